//! Upload Migrator - resumable, partitioned migration of legacy upload records.
//!
//! This crate moves uploads into the new indexing and authorization scheme:
//! every upload gets a registered index, a location claim carrying its space
//! for every shard, and a gateway authorization for its space. It is headless;
//! the `upload-migrate` binary in `migrator-cli` is a thin wrapper around it.
//!
//! The pieces:
//! - [`PartitionPlanner`] divides customers across worker instances by load
//! - [`SqliteProgressStore`] records customer and space progress so any run can
//!   be interrupted and resumed
//! - [`MigrationStepMachine`] drives one upload through the steps still needed
//! - [`FailureReason`] classifies every non-success outcome
//! - [`Orchestrator`] wires them into a per-instance run
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use upload_migrator::{
//!     MachineOptions, MigrationSettings, MigrationStepMachine, Orchestrator, RemoteServices,
//!     RunOptions, SqliteProgressStore,
//! };
//!
//! #[tokio::main]
//! async fn main() -> upload_migrator::Result<()> {
//!     let settings = MigrationSettings::load("migration.json".as_ref())?;
//!     let services = RemoteServices::from_settings(&settings)?;
//!     let store = Arc::new(SqliteProgressStore::open(settings.progress_db_path())?);
//!
//!     let machine = MigrationStepMachine::new(services.executors, MachineOptions::default());
//!     let orchestrator =
//!         Orchestrator::new(services.uploads, machine, store, RunOptions::from_settings(&settings));
//!
//!     let report = orchestrator.run_instance(0).await?;
//!     println!("{}", report.render_summary());
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod failure;
pub mod machine;
pub mod orchestrator;
pub mod owner_cache;
pub mod persist;
pub mod planner;
pub mod progress;
pub mod remote;
pub mod retry;
pub mod sizes;
pub mod types;

pub use cancel::CancellationToken;
pub use collaborators::StepExecutors;
pub use config::{MigrationSettings, PlannerSettings};
pub use error::{MigrationError, Result};
pub use failure::{FailureHistogram, FailureReason};
pub use machine::{MachineOptions, MigrationStep, MigrationStepMachine, StepMode, UploadOutcome};
pub use orchestrator::{Orchestrator, RunOptions, RunReport};
pub use owner_cache::OwnerCache;
pub use planner::{PartitionPlanner, Plan};
pub use progress::{ProgressStore, SqliteProgressStore};
pub use remote::RemoteServices;
pub use sizes::TieredSizeResolver;
pub use types::{
    CustomerAssignment, CustomerProgress, MigrationStatus, ProgressStatus, SpaceIdentifier,
    SpaceProgress, UploadRecord,
};
