//! Run deadline, checked cooperatively by every waiting loop.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::{RollError, RollResult};

/// A point in time after which the run must stop waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

/// Stand-in for a deadline too far out to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

impl Deadline {
    pub fn after(duration: Duration) -> Self {
        let now = Instant::now();
        let at = now
            .checked_add(duration)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        Self { at }
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Fail with `DeadlineExceeded` if the deadline has passed.
    pub fn check(&self, stage: &str) -> RollResult<()> {
        if self.is_expired() {
            return Err(RollError::DeadlineExceeded(stage.to_string()));
        }
        Ok(())
    }

    /// Sleep for `wait`, or until the deadline if that comes first.
    ///
    /// Returns `DeadlineExceeded` when the deadline cut the wait short.
    pub async fn sleep(&self, wait: Duration, stage: &str) -> RollResult<()> {
        let remaining = self.remaining();
        if wait >= remaining {
            tokio::time::sleep(remaining).await;
            return Err(RollError::DeadlineExceeded(stage.to_string()));
        }
        tokio::time::sleep(wait).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_within_deadline() {
        let deadline = Deadline::after(Duration::from_secs(60));
        let start = Instant::now();
        deadline.sleep(Duration::from_secs(10), "draining").await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert_eq!(deadline.remaining(), Duration::from_secs(50));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_past_deadline_is_cut_short() {
        let deadline = Deadline::after(Duration::from_secs(5));
        let start = Instant::now();
        let err = deadline
            .sleep(Duration::from_secs(30), "cluster health")
            .await
            .unwrap_err();
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert!(matches!(err, RollError::DeadlineExceeded(stage) if stage == "cluster health"));
        assert!(deadline.check("next").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unrepresentable_deadline_is_far_away() {
        let deadline = Deadline::after(Duration::MAX);
        assert!(!deadline.is_expired());
        assert!(deadline.remaining() >= FAR_FUTURE);
        deadline.sleep(Duration::from_secs(1), "draining").await.unwrap();
    }
}
