//! Subcommand implementations: wiring settings into the library.

use anyhow::{bail, Context, Result};
use std::fmt::Write as _;
use std::fs;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

use upload_migrator::planner::read_instance_assignment;
use upload_migrator::progress::ProgressSelection;
use upload_migrator::{
    CancellationToken, MachineOptions, MigrationSettings, MigrationStepMachine, Orchestrator,
    OwnerCache, PartitionPlanner, Plan, ProgressStore, RemoteServices, RunOptions,
    SqliteProgressStore, StepMode,
};

use crate::{PlanArgs, RunArgs, StatusArgs};

fn open_store(settings: &MigrationSettings) -> Result<Arc<SqliteProgressStore>> {
    let path = settings.progress_db_path();
    let store = SqliteProgressStore::open(&path)
        .with_context(|| format!("failed to open progress database {}", path.display()))?;
    Ok(Arc::new(store))
}

/// Compute a partition and, unless dry, publish it.
pub async fn plan(settings: MigrationSettings, args: PlanArgs) -> Result<ExitCode> {
    let mut planner_settings = settings.planner.clone();
    if let Some(instances) = args.instances {
        planner_settings.instances = instances;
    }
    if let Some(segments) = args.segments {
        planner_settings.segments = segments;
    }
    if !args.skip.is_empty() {
        planner_settings.skip_customers = args.skip;
    }
    if !args.include.is_empty() {
        planner_settings.include_customers = args.include;
    }

    let services =
        RemoteServices::from_settings(&settings).context("failed to configure remote services")?;
    fs::create_dir_all(&settings.output_dir)
        .with_context(|| format!("failed to create {}", settings.output_dir.display()))?;
    let planner = PartitionPlanner::new(
        services.scanner,
        services.counter,
        open_store(&settings)?,
        planner_settings,
        &settings.output_dir,
    )?;

    let plan = if args.dry_run {
        info!("Dry run: the plan will not be published");
        planner.build_plan().await?
    } else {
        planner.plan().await?
    };
    println!("{}", render_plan(&plan));
    if !args.dry_run {
        println!("Assignments written to {}", planner.assignment_dir().display());
    }
    Ok(ExitCode::SUCCESS)
}

fn render_plan(plan: &Plan) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Partition plan ({})", plan.planned_at.to_rfc3339());
    let _ = writeln!(
        out,
        "  customers: {}  spaces: {}  uploads: {}",
        plan.assignments.len(),
        plan.total_spaces(),
        plan.total_uploads()
    );
    if let Some(filter) = &plan.filter {
        let _ = writeln!(out, "  filter: {} ({} customers left out)", filter, plan.filtered_out);
    }
    for instance in &plan.instances {
        let _ = writeln!(
            out,
            "  instance {:>3}: {:>6} customers {:>12} uploads",
            instance.instance_id, instance.customers, instance.uploads
        );
    }
    let _ = write!(out, "  skew: {:.1}%", plan.skew_percent());
    out
}

/// Migrate one target. Exits with failure when any upload or space failed.
pub async fn run(settings: MigrationSettings, args: RunArgs) -> Result<ExitCode> {
    let services =
        RemoteServices::from_settings(&settings).context("failed to configure remote services")?;
    let store = open_store(&settings)?;

    let machine = MigrationStepMachine::new(
        services.executors,
        MachineOptions {
            mode: args
                .test_step
                .map(|step| StepMode::Only(step.into()))
                .unwrap_or_default(),
            dry_run: args.dry_run,
            require_gateway_auth: settings.require_gateway_auth || args.require_gateway_auth,
            location_url_template: settings.location_url_template.clone(),
        },
    );

    let mut options = RunOptions::from_settings(&settings);
    options.limit = args.limit;
    options.retry_failed = args.retry_failed;
    info!("Worker {}", options.worker_id);

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current upload");
            token.cancel();
        }
    });

    let orchestrator = Orchestrator::new(services.uploads, machine, store, options)
        .with_owner_cache(Arc::new(OwnerCache::new(services.ownership)))
        .with_cancellation(cancel);

    let report = if let Some(space) = &args.space {
        orchestrator.run_space(space).await?
    } else if let Some(path) = &args.assignment_file {
        let file = read_instance_assignment(path)
            .with_context(|| format!("failed to read assignment file {}", path.display()))?;
        orchestrator
            .run_assignments(Some(file.instance_id), &file.customers)
            .await?
    } else if let Some(instance) = args.instance {
        orchestrator.run_instance(instance).await?
    } else {
        bail!("one of --instance, --space or --assignment-file is required");
    };

    println!("{}", report.render_summary());

    fs::create_dir_all(&settings.output_dir)
        .with_context(|| format!("failed to create {}", settings.output_dir.display()))?;
    let path = report.write_results(&settings.output_dir)?;
    println!("Results written to {}", path.display());

    Ok(if report.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Print store statistics plus failed and stuck rows.
pub fn status(settings: &MigrationSettings, args: &StatusArgs) -> Result<ExitCode> {
    let store = open_store(settings)?;
    let stats = store.scan_all_progress()?;
    let failed = store.get_failed_migrations()?;
    let stuck = store.get_stuck_migrations(settings.stuck_after())?;

    if args.json {
        let value = serde_json::json!({
            "stats": stats,
            "failed": failed,
            "stuck": stuck,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(ExitCode::SUCCESS);
    }

    let mut out = String::new();
    let _ = writeln!(out, "Customers: {}", stats.customer_count());
    for (status, count) in &stats.customers_by_status {
        let _ = writeln!(out, "  {:<12} {:>8}", status, count);
    }
    let _ = writeln!(out, "Spaces: {}", stats.space_count());
    for (status, count) in &stats.spaces_by_status {
        let _ = writeln!(out, "  {:<12} {:>8}", status, count);
    }
    let _ = writeln!(
        out,
        "Uploads: {}/{} completed",
        stats.completed_uploads, stats.total_uploads
    );
    let _ = writeln!(
        out,
        "Indexes generated: {}  location claims: {}  gateway grants: {}  gateway skips: {}",
        stats.counters.indexes_generated,
        stats.counters.location_claims_published,
        stats.counters.gateway_grants,
        stats.counters.gateway_skips
    );
    if !stats.failure_reasons.is_empty() {
        let _ = writeln!(out, "Failure reasons:");
        for (reason, count) in stats.failure_reasons.ranked() {
            let _ = writeln!(out, "  {:<26} {:>8}", reason.as_str(), count);
        }
    }
    render_selection(&mut out, "Failed", &failed, args.rows);
    render_selection(&mut out, "Stuck", &stuck, args.rows);
    print!("{}", out);
    Ok(ExitCode::SUCCESS)
}

fn render_selection(out: &mut String, title: &str, selection: &ProgressSelection, rows: usize) {
    if selection.is_empty() {
        return;
    }
    let _ = writeln!(
        out,
        "{} ({} customers, {} spaces):",
        title,
        selection.customers.len(),
        selection.spaces.len()
    );
    for customer in selection.customers.iter().take(rows) {
        let _ = writeln!(
            out,
            "  customer {} [{}/{} spaces] {}",
            customer.customer,
            customer.completed_spaces,
            customer.total_spaces,
            customer.error.as_deref().unwrap_or("")
        );
    }
    for space in selection.spaces.iter().take(rows) {
        let _ = writeln!(
            out,
            "  space {} of {} [{}/{} uploads, updated {}] {}",
            space.space,
            space.customer,
            space.completed_uploads,
            space.total_uploads,
            space.updated_at.to_rfc3339(),
            space.error.as_deref().unwrap_or("")
        );
    }
}
