//! Per-upload migration step machine.
//!
//! ```text
//! INIT → ANALYZE → INDEX_GENERATION → LOCATION_CLAIMS → GATEWAY_AUTH → VERIFY → COMPLETE
//!           │             │                  │                │            │
//!           └─────────────┴──────────────────┴────────────────┴────────────┴──→ FAILED
//! ```
//!
//! ANALYZE decides which of the middle steps are still needed; only those run.
//! Every step is safe to repeat, so re-running an upload is always allowed.
//! Errors raised by a step stop the upload there and are classified by the step
//! that was executing; they never escape [`MigrationStepMachine::migrate`].

mod analyze;
mod gateway;
mod index;
mod location;
mod verify;

pub use analyze::analyze;
pub use gateway::{authorize_gateway, GatewayAuthOutcome};
pub use index::{generate_index, PublishedIndex};
pub use location::publish_location_claims;
pub use verify::{verify_upload, GatewayExpectation, VerificationReport};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::collaborators::StepExecutors;
use crate::config::RunDefaults;
use crate::failure::{classify_step_error, classify_verification, FailureReason};
use crate::types::{CustomerCounters, MigrationStatus, UploadRecord};

/// Remote-facing steps of the machine, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationStep {
    Analyze,
    IndexGeneration,
    LocationClaims,
    GatewayAuth,
    Verify,
}

impl MigrationStep {
    /// Upper-snake step name used in logs and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStep::Analyze => "ANALYZE",
            MigrationStep::IndexGeneration => "INDEX_GENERATION",
            MigrationStep::LocationClaims => "LOCATION_CLAIMS",
            MigrationStep::GatewayAuth => "GATEWAY_AUTH",
            MigrationStep::Verify => "VERIFY",
        }
    }
}

impl fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which steps a machine run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", content = "step", rename_all = "snake_case")]
pub enum StepMode {
    /// The whole pipeline.
    #[default]
    Full,
    /// Test mode: ANALYZE, then only this step, then return.
    Only(MigrationStep),
}

impl StepMode {
    fn runs(&self, step: MigrationStep) -> bool {
        match self {
            StepMode::Full => true,
            StepMode::Only(only) => *only == step,
        }
    }
}

/// Knobs for a machine instance.
#[derive(Debug, Clone)]
pub struct MachineOptions {
    pub mode: StepMode,
    /// Stop after ANALYZE and report what would be done.
    pub dry_run: bool,
    /// A skipped gateway authorization fails verification.
    pub require_gateway_auth: bool,
    /// Location URL template with a `{shard}` placeholder.
    pub location_url_template: String,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            mode: StepMode::Full,
            dry_run: false,
            require_gateway_auth: false,
            location_url_template: RunDefaults::LOCATION_URL_TEMPLATE.to_string(),
        }
    }
}

/// Terminal result for one upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    pub space: String,
    pub root: String,
    pub shard_count: usize,
    pub success: bool,
    /// Nothing needed doing; no mutation was attempted.
    pub already_migrated: bool,
    /// Not attempted because of an upstream outage; not counted as failed.
    pub skipped: bool,
    pub dry_run: bool,
    pub steps: Vec<MigrationStep>,
    pub failed_step: Option<MigrationStep>,
    pub reason: Option<FailureReason>,
    /// Non-fatal classification on an otherwise successful upload.
    pub advisory: Option<FailureReason>,
    pub error: Option<String>,
    pub status: Option<MigrationStatus>,
    pub index_id: Option<String>,
    pub gateway: Option<GatewayAuthOutcome>,
    pub verification: Option<VerificationReport>,
    pub counters: CustomerCounters,
    pub duration_ms: u64,
}

impl UploadOutcome {
    fn start(upload: &UploadRecord) -> Self {
        Self {
            space: upload.space.clone(),
            root: upload.root.clone(),
            shard_count: upload.shards.len(),
            success: false,
            already_migrated: false,
            skipped: false,
            dry_run: false,
            steps: Vec::new(),
            failed_step: None,
            reason: None,
            advisory: None,
            error: None,
            status: None,
            index_id: None,
            gateway: None,
            verification: None,
            counters: CustomerCounters::default(),
            duration_ms: 0,
        }
    }

    /// Whether this outcome counts against its space.
    pub fn is_failure(&self) -> bool {
        !self.success && !self.skipped
    }
}

/// Drives single uploads through the step sequence.
#[derive(Clone)]
pub struct MigrationStepMachine {
    executors: StepExecutors,
    options: MachineOptions,
}

impl MigrationStepMachine {
    /// A machine over `executors`. Options are fixed for its lifetime.
    pub fn new(executors: StepExecutors, options: MachineOptions) -> Self {
        Self { executors, options }
    }

    /// Options this machine was built with.
    pub fn options(&self) -> &MachineOptions {
        &self.options
    }

    /// Migrate one upload. Never returns an error: failures are in the outcome.
    pub async fn migrate(&self, upload: &UploadRecord) -> UploadOutcome {
        let started = Instant::now();
        let mut outcome = UploadOutcome::start(upload);
        self.drive(upload, &mut outcome).await;
        outcome.duration_ms = started.elapsed().as_millis() as u64;

        if outcome.skipped {
            warn!(
                space = %outcome.space,
                root = %outcome.root,
                "Upload skipped: {}",
                outcome.error.as_deref().unwrap_or("indexing service unavailable")
            );
        } else if !outcome.success {
            error!(
                space = %outcome.space,
                root = %outcome.root,
                step = ?outcome.failed_step,
                reason = ?outcome.reason,
                "Upload failed: {}",
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }
        outcome
    }

    async fn drive(&self, upload: &UploadRecord, outcome: &mut UploadOutcome) {
        let mode = self.options.mode;

        trace_step(upload, MigrationStep::Analyze);
        outcome.steps.push(MigrationStep::Analyze);
        let status = match analyze(self.executors.oracle.as_ref(), upload).await {
            Ok(status) => status,
            Err(e) => {
                let reason = classify_step_error(MigrationStep::Analyze, &e);
                return fail(outcome, MigrationStep::Analyze, reason, e.to_string());
            }
        };
        outcome.status = Some(status.clone());

        if upload.shards.is_empty() && !status.has_index_claim {
            return fail(
                outcome,
                MigrationStep::Analyze,
                FailureReason::NoShardsNoIndex,
                "upload has no shards and no index claim".to_string(),
            );
        }

        if status.is_satisfied() && mode == StepMode::Full {
            info!(space = %upload.space, root = %upload.root, "Already migrated");
            outcome.already_migrated = true;
            outcome.success = true;
            return;
        }

        if self.options.dry_run || mode == StepMode::Only(MigrationStep::Analyze) {
            outcome.dry_run = self.options.dry_run;
            outcome.success = true;
            return;
        }

        if status.needs_index_generation && mode.runs(MigrationStep::IndexGeneration) {
            trace_step(upload, MigrationStep::IndexGeneration);
            outcome.steps.push(MigrationStep::IndexGeneration);
            match generate_index(&self.executors, upload).await {
                Ok(published) => {
                    outcome.index_id = Some(published.index_id);
                    outcome.counters.indexes_generated += 1;
                }
                Err(e) => {
                    let reason = classify_step_error(MigrationStep::IndexGeneration, &e);
                    return fail(outcome, MigrationStep::IndexGeneration, reason, e.to_string());
                }
            }
        }

        if status.needs_location_claims && mode.runs(MigrationStep::LocationClaims) {
            trace_step(upload, MigrationStep::LocationClaims);
            outcome.steps.push(MigrationStep::LocationClaims);
            let template = &self.options.location_url_template;
            let result = publish_location_claims(
                &self.executors,
                upload,
                &status.shards_needing_location_claims,
                |shard| template.replace("{shard}", shard),
            )
            .await;
            match result {
                Ok(published) => outcome.counters.location_claims_published += published,
                Err(e) => {
                    let reason = classify_step_error(MigrationStep::LocationClaims, &e);
                    return fail(outcome, MigrationStep::LocationClaims, reason, e.to_string());
                }
            }
        }

        let force_gateway = mode == StepMode::Only(MigrationStep::GatewayAuth);
        if (status.needs_gateway_auth || force_gateway) && mode.runs(MigrationStep::GatewayAuth) {
            trace_step(upload, MigrationStep::GatewayAuth);
            outcome.steps.push(MigrationStep::GatewayAuth);
            let gateway = authorize_gateway(self.executors.gateway.as_ref(), &upload.space).await;
            match &gateway {
                GatewayAuthOutcome::Granted => outcome.counters.gateway_grants += 1,
                GatewayAuthOutcome::Skipped { .. } => {
                    outcome.counters.gateway_skips += 1;
                    if gateway.is_missing_delegation() {
                        outcome.advisory = Some(FailureReason::MissingDelegation);
                    }
                }
                GatewayAuthOutcome::Failed { message } => {
                    let message = message.clone();
                    outcome.gateway = Some(gateway);
                    return fail(
                        outcome,
                        MigrationStep::GatewayAuth,
                        FailureReason::GatewayAuthFailed,
                        message,
                    );
                }
            }
            outcome.gateway = Some(gateway);
        }

        if let StepMode::Only(step) = mode {
            if step != MigrationStep::Verify {
                outcome.success = true;
                return;
            }
        }

        trace_step(upload, MigrationStep::Verify);
        outcome.steps.push(MigrationStep::Verify);
        let expectation = GatewayExpectation {
            outcome: outcome.gateway.as_ref(),
            required: self.options.require_gateway_auth,
            isolated: mode == StepMode::Only(MigrationStep::Verify),
        };
        let report = match verify_upload(self.executors.oracle.as_ref(), upload, expectation).await {
            Ok(report) => report,
            Err(e) => {
                let reason = classify_step_error(MigrationStep::Verify, &e);
                return fail(outcome, MigrationStep::Verify, reason, e.to_string());
            }
        };

        let verdict = classify_verification(&report);
        outcome.verification = Some(report);
        match verdict {
            None => {
                info!(space = %upload.space, root = %upload.root, "Upload migrated");
                outcome.success = true;
            }
            Some(reason) => {
                if reason == FailureReason::MissingDelegation {
                    outcome.advisory = None;
                }
                fail(
                    outcome,
                    MigrationStep::Verify,
                    reason,
                    format!("verification found {}", reason),
                )
            }
        }
    }
}

fn trace_step(upload: &UploadRecord, step: MigrationStep) {
    info!(space = %upload.space, root = %upload.root, step = %step, "→ {}", step);
}

fn fail(outcome: &mut UploadOutcome, step: MigrationStep, reason: FailureReason, error: String) {
    outcome.success = false;
    outcome.skipped = !reason.is_hard_failure();
    outcome.failed_step = Some(step);
    outcome.reason = Some(reason);
    outcome.error = Some(error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_mode_runs() {
        assert!(StepMode::Full.runs(MigrationStep::LocationClaims));
        let only = StepMode::Only(MigrationStep::GatewayAuth);
        assert!(only.runs(MigrationStep::GatewayAuth));
        assert!(!only.runs(MigrationStep::IndexGeneration));
    }

    #[test]
    fn test_fail_marks_outages_as_skips() {
        let upload = UploadRecord {
            space: "did:key:s".into(),
            root: "bafyroot".into(),
            shards: vec![],
            inserted_at: None,
        };
        let mut outcome = UploadOutcome::start(&upload);
        fail(
            &mut outcome,
            MigrationStep::Analyze,
            FailureReason::IndexingService500,
            "503".into(),
        );
        assert!(outcome.skipped);
        assert!(!outcome.is_failure());

        let mut outcome = UploadOutcome::start(&upload);
        fail(
            &mut outcome,
            MigrationStep::LocationClaims,
            FailureReason::LocationClaimFailed,
            "denied".into(),
        );
        assert!(outcome.is_failure());
        assert_eq!(outcome.failed_step, Some(MigrationStep::LocationClaims));
    }

    #[test]
    fn test_step_names_match_serde() {
        for step in [
            MigrationStep::Analyze,
            MigrationStep::IndexGeneration,
            MigrationStep::LocationClaims,
            MigrationStep::GatewayAuth,
            MigrationStep::Verify,
        ] {
            assert_eq!(
                serde_json::to_string(&step).unwrap(),
                format!("\"{}\"", step.as_str())
            );
        }
    }
}
