//! noderoll: replace EKS worker nodes running an outdated launch version.
//!
//! # Usage
//!
//! ```text
//! noderoll run --cluster prod-eu --config /etc/noderoll/noderoll.toml
//! noderoll run --cluster prod-eu --plan
//! ```
//!
//! Tuning comes from the environment (optionally layered over the TOML file).
//! Exit code is 0 when the run completes, 2 on a configuration error and 1
//! on any other failure.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;

const DEFAULT_FILTER: &str = "info,noderoll=debug";

#[derive(Parser)]
#[command(
    name = "noderoll",
    about = "Rolling replacement of outdated EKS worker nodes",
    version,
    propagate_version = true
)]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rotate every outdated worker node of one cluster.
    Run(RunArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Cluster identifier; scaling groups are found by its tags.
    #[arg(long)]
    cluster: String,

    /// Flat TOML file with the same keys as the environment.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Only discover and print what would be rotated.
    #[arg(long)]
    plan: bool,

    /// AWS region passed to the aws CLI.
    #[arg(long)]
    region: Option<String>,

    /// AWS profile passed to the aws CLI.
    #[arg(long)]
    profile: Option<String>,

    /// Kubeconfig context; the current context when unset.
    #[arg(long, env = "K8S_CONTEXT")]
    context: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(cli.log_format) {
        eprintln!("failed to initialise logging: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Commands::Run(args) => commands::run::run(args).await,
    };
    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = ?e, "noderoll setup failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_requires_a_cluster() {
        assert!(Cli::try_parse_from(["noderoll", "run"]).is_err());
    }

    #[test]
    fn run_parses_all_flags() {
        let cli = Cli::try_parse_from([
            "noderoll",
            "run",
            "--cluster",
            "prod-eu",
            "--config",
            "/etc/noderoll.toml",
            "--plan",
            "--region",
            "eu-west-1",
            "--context",
            "arn:aws:eks:eu-west-1:123456789012:cluster/prod-eu",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        let Commands::Run(args) = cli.command;
        assert_eq!(args.cluster, "prod-eu");
        assert_eq!(args.config, Some(PathBuf::from("/etc/noderoll.toml")));
        assert!(args.plan);
        assert_eq!(args.region.as_deref(), Some("eu-west-1"));
        assert_eq!(args.profile, None);
        assert_eq!(
            args.context.as_deref(),
            Some("arn:aws:eks:eu-west-1:123456789012:cluster/prod-eu")
        );
    }

    #[test]
    fn log_format_defaults_to_text() {
        let cli = Cli::try_parse_from(["noderoll", "run", "--cluster", "c"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Text);
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
