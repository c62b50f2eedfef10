//! upload-migrate - command-line driver for the upload migrator.
//!
//! `plan` partitions customers across worker instances, `run` migrates one
//! instance's cohort (or a single space), and `status` summarises the progress
//! store.

mod commands;

use anyhow::{Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;
use upload_migrator::{MigrationSettings, MigrationStep};

#[derive(Parser, Debug)]
#[command(name = "upload-migrate")]
#[command(about = "Migrate legacy uploads to indexed, space-scoped claims")]
struct Cli {
    /// Settings file (JSON). A missing file means defaults.
    #[arg(short, long, global = true, default_value = "migration.json")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Partition customers across worker instances
    Plan(PlanArgs),
    /// Migrate an instance's assigned customers, or one space
    Run(RunArgs),
    /// Show progress statistics, failed and stuck migrations
    Status(StatusArgs),
}

#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Number of worker instances
    #[arg(long)]
    pub instances: Option<u32>,

    /// Parallel segments for the ownership scan (1-10)
    #[arg(long)]
    pub segments: Option<u32>,

    /// Customers to leave out; a trailing `*` matches by prefix
    #[arg(long, value_delimiter = ',')]
    pub skip: Vec<String>,

    /// Only plan these customers; a trailing `*` matches by prefix
    #[arg(long, value_delimiter = ',')]
    pub include: Vec<String>,

    /// Compute and print the plan without publishing it
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug)]
#[command(group(
    ArgGroup::new("target")
        .required(true)
        .args(["instance", "space", "assignment_file"])
))]
pub struct RunArgs {
    /// Instance whose assignments (from the progress store) to run
    #[arg(long)]
    pub instance: Option<u32>,

    /// Migrate a single space, outside any assignment
    #[arg(long)]
    pub space: Option<String>,

    /// Run the assignments in a published instance file
    #[arg(long)]
    pub assignment_file: Option<PathBuf>,

    /// Stop after this many uploads
    #[arg(long)]
    pub limit: Option<u64>,

    /// Analyze only; no remote mutation and no progress writes
    #[arg(long)]
    pub dry_run: bool,

    /// Reprocess spaces whose last run failed
    #[arg(long)]
    pub retry_failed: bool,

    /// Fail verification when the gateway authorization was skipped
    #[arg(long)]
    pub require_gateway_auth: bool,

    /// Run ANALYZE and then only this step
    #[arg(long, value_enum)]
    pub test_step: Option<StepArg>,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Rows to list per section
    #[arg(long, default_value = "20")]
    pub rows: usize,

    /// Print the statistics as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum StepArg {
    Analyze,
    IndexGeneration,
    LocationClaims,
    GatewayAuth,
    Verify,
}

impl From<StepArg> for MigrationStep {
    fn from(arg: StepArg) -> Self {
        match arg {
            StepArg::Analyze => MigrationStep::Analyze,
            StepArg::IndexGeneration => MigrationStep::IndexGeneration,
            StepArg::LocationClaims => MigrationStep::LocationClaims,
            StepArg::GatewayAuth => MigrationStep::GatewayAuth,
            StepArg::Verify => MigrationStep::Verify,
        }
    }
}

fn init_logging(debug: bool, json: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.json_logs);

    let settings = MigrationSettings::load(&cli.config)
        .with_context(|| format!("failed to load settings from {}", cli.config.display()))?;
    info!("Progress database: {}", settings.progress_db_path().display());

    match cli.command {
        Command::Plan(args) => commands::plan(settings, args).await,
        Command::Run(args) => commands::run(settings, args).await,
        Command::Status(args) => commands::status(&settings, &args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_requires_a_target() {
        assert!(Cli::try_parse_from(["upload-migrate", "run"]).is_err());
        assert!(
            Cli::try_parse_from(["upload-migrate", "run", "--instance", "1", "--space", "s"])
                .is_err()
        );
        let cli = Cli::try_parse_from(["upload-migrate", "run", "--instance", "2", "--dry-run"])
            .unwrap();
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.instance, Some(2));
                assert!(args.dry_run);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_plan_filters_split_on_commas() {
        let cli = Cli::try_parse_from([
            "upload-migrate",
            "plan",
            "--instances",
            "4",
            "--skip",
            "a,b*",
            "--include",
            "c*",
        ])
        .unwrap();
        match cli.command {
            Command::Plan(args) => {
                assert_eq!(args.instances, Some(4));
                assert_eq!(args.skip, vec!["a", "b*"]);
                assert_eq!(args.include, vec!["c*"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_step_names() {
        let cli = Cli::try_parse_from([
            "upload-migrate",
            "run",
            "--space",
            "did:key:z6Mk",
            "--test-step",
            "location-claims",
        ])
        .unwrap();
        match cli.command {
            Command::Run(args) => assert_eq!(
                args.test_step.map(MigrationStep::from),
                Some(MigrationStep::LocationClaims)
            ),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
