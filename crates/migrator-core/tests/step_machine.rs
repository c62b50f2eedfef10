//! Integration tests for the per-upload step machine.
//!
//! Each test seeds a [`FakeWorld`] with the remote state of one upload, runs
//! the machine, and checks both the outcome and what was mutated remotely.

mod common;

use common::{upload, Fault, FakeWorld};
use upload_migrator::failure::FailureReason;
use upload_migrator::machine::GatewayAuthOutcome;
use upload_migrator::{MachineOptions, MigrationStep, MigrationStepMachine, StepMode};

const SPACE: &str = "did:key:z6MkSpaceA";

/// Machine with default options over `world`.
fn machine(world: &FakeWorld) -> MigrationStepMachine {
    MigrationStepMachine::new(world.executors(), MachineOptions::default())
}

fn machine_with(world: &FakeWorld, options: MachineOptions) -> MigrationStepMachine {
    MigrationStepMachine::new(world.executors(), options)
}

#[tokio::test]
async fn test_legacy_upload_runs_every_step() {
    let world = FakeWorld::new();
    let legacy = upload(SPACE, "bafyroot1", 3);
    world.seed_legacy(&legacy);

    let outcome = machine(&world).migrate(&legacy).await;

    assert!(outcome.success, "{:?}", outcome.error);
    assert!(!outcome.already_migrated);
    assert_eq!(
        outcome.steps,
        vec![
            MigrationStep::Analyze,
            MigrationStep::IndexGeneration,
            MigrationStep::LocationClaims,
            MigrationStep::GatewayAuth,
            MigrationStep::Verify,
        ]
    );
    assert_eq!(outcome.index_id.as_deref(), Some("idx-bafyroot1"));
    assert_eq!(outcome.counters.indexes_generated, 1);
    assert_eq!(outcome.counters.location_claims_published, 3);
    assert_eq!(outcome.counters.gateway_grants, 1);
    assert_eq!(outcome.gateway, Some(GatewayAuthOutcome::Granted));
    assert!(outcome.verification.as_ref().is_some_and(|r| r.passed()));

    let state = world.state();
    assert_eq!(state.index_claims.get("bafyroot1").map(String::as_str), Some("idx-bafyroot1"));
    for shard in &legacy.shards {
        assert!(state.location_claims[shard].contains(&Some(SPACE.to_string())));
    }
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let world = FakeWorld::new();
    let legacy = upload(SPACE, "bafyroot2", 2);
    world.seed_legacy(&legacy);
    let machine = machine(&world);

    let first = machine.migrate(&legacy).await;
    assert!(first.success);
    let mutations = world.mutation_count();
    assert!(mutations > 0);

    let second = machine.migrate(&legacy).await;
    assert!(second.success);
    assert!(second.already_migrated);
    assert_eq!(second.steps, vec![MigrationStep::Analyze]);
    assert_eq!(world.mutation_count(), mutations);
}

#[tokio::test]
async fn test_already_migrated_upload_only_analyzes() {
    let world = FakeWorld::new();
    let done = upload(SPACE, "bafyroot3", 2);
    world.seed_migrated(&done);

    let outcome = machine(&world).migrate(&done).await;

    assert!(outcome.success);
    assert!(outcome.already_migrated);
    assert_eq!(outcome.steps, vec![MigrationStep::Analyze]);
    assert_eq!(world.mutation_count(), 0);
    let status = outcome.status.unwrap();
    assert!(status.is_satisfied());
    assert!(!status.needs_gateway_auth);
}

#[tokio::test]
async fn test_no_shards_and_no_index_is_unrecoverable() {
    let world = FakeWorld::new();
    let empty = upload(SPACE, "bafyempty", 0);

    let outcome = machine(&world).migrate(&empty).await;

    assert!(!outcome.success);
    assert!(outcome.is_failure());
    assert_eq!(outcome.reason, Some(FailureReason::NoShardsNoIndex));
    assert_eq!(outcome.failed_step, Some(MigrationStep::Analyze));
    assert_eq!(world.mutation_count(), 0);
}

#[tokio::test]
async fn test_no_shards_with_index_is_already_migrated() {
    let world = FakeWorld::new();
    let empty = upload(SPACE, "bafyindexed", 0);
    world
        .state()
        .index_claims
        .insert("bafyindexed".to_string(), "idx-bafyindexed".to_string());

    let outcome = machine(&world).migrate(&empty).await;

    assert!(outcome.success);
    assert!(outcome.already_migrated);
}

#[tokio::test]
async fn test_only_shards_missing_space_are_claimed() {
    let world = FakeWorld::new();
    let partial = upload(SPACE, "bafypartial", 3);
    world.seed_legacy(&partial);
    {
        let mut state = world.state();
        state
            .index_claims
            .insert("bafypartial".to_string(), "idx-bafypartial".to_string());
        state
            .location_claims
            .get_mut(&partial.shards[1])
            .unwrap()
            .push(Some(SPACE.to_string()));
    }

    let outcome = machine(&world).migrate(&partial).await;

    assert!(outcome.success, "{:?}", outcome.error);
    assert!(!outcome.steps.contains(&MigrationStep::IndexGeneration));
    assert_eq!(outcome.counters.location_claims_published, 2);
    let published: Vec<String> = world
        .state()
        .mutations
        .iter()
        .filter(|m| m.starts_with("publish "))
        .cloned()
        .collect();
    assert_eq!(
        published,
        vec![
            format!("publish {}", partial.shards[0]),
            format!("publish {}", partial.shards[2]),
        ]
    );
}

#[tokio::test]
async fn test_missing_delegation_is_an_advisory() {
    let world = FakeWorld::new();
    let legacy = upload(SPACE, "bafyorphan", 1);
    world.seed_legacy(&legacy);
    world.state().no_delegation.insert(SPACE.to_string());

    let outcome = machine(&world).migrate(&legacy).await;

    assert!(outcome.success);
    assert_eq!(outcome.reason, None);
    assert_eq!(outcome.advisory, Some(FailureReason::MissingDelegation));
    assert_eq!(outcome.counters.gateway_skips, 1);
    assert!(outcome.gateway.as_ref().is_some_and(|g| g.is_missing_delegation()));
}

#[tokio::test]
async fn test_missing_delegation_fails_when_gateway_required() {
    let world = FakeWorld::new();
    let legacy = upload(SPACE, "bafyorphan2", 1);
    world.seed_legacy(&legacy);
    world.state().no_delegation.insert(SPACE.to_string());
    let options = MachineOptions {
        require_gateway_auth: true,
        ..MachineOptions::default()
    };

    let outcome = machine_with(&world, options).migrate(&legacy).await;

    assert!(!outcome.success);
    assert_eq!(outcome.failed_step, Some(MigrationStep::Verify));
    assert_eq!(outcome.reason, Some(FailureReason::MissingDelegation));
    assert_eq!(outcome.advisory, None);
}

#[tokio::test]
async fn test_indexing_outage_skips_upload() {
    let world = FakeWorld::new();
    let legacy = upload(SPACE, "bafyoutage", 2);
    world.seed_legacy(&legacy);
    world.state().outage = true;

    let outcome = machine(&world).migrate(&legacy).await;

    assert!(!outcome.success);
    assert!(outcome.skipped);
    assert!(!outcome.is_failure());
    assert_eq!(outcome.reason, Some(FailureReason::IndexingService500));
    assert_eq!(outcome.failed_step, Some(MigrationStep::Analyze));
    assert_eq!(world.mutation_count(), 0);
}

#[tokio::test]
async fn test_index_failure_stops_before_location_claims() {
    let world = FakeWorld::new();
    let legacy = upload(SPACE, "bafybuildfail", 2);
    world.seed_legacy(&legacy);
    world.fail(Fault::Build);

    let outcome = machine(&world).migrate(&legacy).await;

    assert_eq!(outcome.reason, Some(FailureReason::IndexGenerationFailed));
    assert_eq!(outcome.failed_step, Some(MigrationStep::IndexGeneration));
    assert!(outcome.is_failure());
    assert!(!outcome.steps.contains(&MigrationStep::LocationClaims));
    assert_eq!(world.mutation_count(), 0);
}

#[tokio::test]
async fn test_each_step_failure_is_classified() {
    let cases = [
        (Fault::Put, FailureReason::IndexGenerationFailed, MigrationStep::IndexGeneration),
        (Fault::Register, FailureReason::IndexGenerationFailed, MigrationStep::IndexGeneration),
        (Fault::Size, FailureReason::LocationClaimFailed, MigrationStep::LocationClaims),
        (Fault::Advertise, FailureReason::LocationClaimFailed, MigrationStep::LocationClaims),
        (Fault::Grant, FailureReason::GatewayAuthFailed, MigrationStep::GatewayAuth),
    ];

    for (fault, reason, step) in cases {
        let world = FakeWorld::new();
        let legacy = upload(SPACE, "bafyclassify", 2);
        world.seed_legacy(&legacy);
        world.fail(fault);

        let outcome = machine(&world).migrate(&legacy).await;

        assert!(!outcome.success, "{:?} should fail", fault);
        assert_eq!(outcome.reason, Some(reason), "{:?}", fault);
        assert_eq!(outcome.failed_step, Some(step), "{:?}", fault);
        assert!(outcome.error.is_some());
    }
}

#[tokio::test]
async fn test_invisible_claims_fail_verification() {
    let world = FakeWorld::new();
    let legacy = upload(SPACE, "bafylagging", 2);
    world.seed_legacy(&legacy);
    world.state().hide_publications = true;

    let outcome = machine(&world).migrate(&legacy).await;

    assert!(!outcome.success);
    assert_eq!(outcome.failed_step, Some(MigrationStep::Verify));
    assert_eq!(outcome.reason, Some(FailureReason::SpaceInfoMissing));
    let report = outcome.verification.unwrap();
    assert!(report.index_present);
    assert_eq!(report.shards_without_space.len(), 2);
}

#[tokio::test]
async fn test_every_failure_has_a_reason() {
    let faults = [
        None,
        Some(Fault::Build),
        Some(Fault::Put),
        Some(Fault::Publish),
        Some(Fault::Register),
        Some(Fault::Advertise),
        Some(Fault::Grant),
        Some(Fault::Size),
    ];
    for fault in faults {
        for hide in [false, true] {
            let world = FakeWorld::new();
            let legacy = upload(SPACE, "bafytotal", 2);
            world.seed_legacy(&legacy);
            world.state().hide_publications = hide;
            if let Some(fault) = fault {
                world.fail(fault);
            }

            let outcome = machine(&world).migrate(&legacy).await;

            if outcome.success {
                assert_eq!(outcome.reason, None);
            } else {
                assert!(outcome.reason.is_some(), "{:?}/{} has no reason", fault, hide);
                assert!(outcome.failed_step.is_some());
            }
        }
    }
}

#[tokio::test]
async fn test_dry_run_stops_after_analysis() {
    let world = FakeWorld::new();
    let legacy = upload(SPACE, "bafydry", 2);
    world.seed_legacy(&legacy);
    let options = MachineOptions {
        dry_run: true,
        ..MachineOptions::default()
    };

    let outcome = machine_with(&world, options).migrate(&legacy).await;

    assert!(outcome.success);
    assert!(outcome.dry_run);
    assert_eq!(outcome.steps, vec![MigrationStep::Analyze]);
    let status = outcome.status.unwrap();
    assert!(status.needs_index_generation);
    assert!(status.needs_location_claims);
    assert!(status.needs_gateway_auth);
    assert_eq!(world.mutation_count(), 0);
}

#[tokio::test]
async fn test_single_step_mode_runs_only_that_step() {
    let world = FakeWorld::new();
    let legacy = upload(SPACE, "bafyonly", 2);
    world.seed_legacy(&legacy);
    let options = MachineOptions {
        mode: StepMode::Only(MigrationStep::LocationClaims),
        ..MachineOptions::default()
    };

    let outcome = machine_with(&world, options).migrate(&legacy).await;

    assert!(outcome.success);
    assert_eq!(
        outcome.steps,
        vec![MigrationStep::Analyze, MigrationStep::LocationClaims]
    );
    let state = world.state();
    assert!(state.mutations.iter().all(|m| m.starts_with("publish ") || m.starts_with("advertise ")));
    assert!(!state.index_claims.contains_key("bafyonly"));
}

#[tokio::test]
async fn test_gateway_mode_runs_even_when_satisfied() {
    let world = FakeWorld::new();
    let done = upload(SPACE, "bafygw", 1);
    world.seed_migrated(&done);
    let options = MachineOptions {
        mode: StepMode::Only(MigrationStep::GatewayAuth),
        ..MachineOptions::default()
    };

    let outcome = machine_with(&world, options).migrate(&done).await;

    assert!(outcome.success);
    assert_eq!(
        outcome.steps,
        vec![MigrationStep::Analyze, MigrationStep::GatewayAuth]
    );
    assert_eq!(world.state().mutations, vec![format!("grant {}", SPACE)]);
}

#[tokio::test]
async fn test_verify_mode_reports_gaps_without_mutating() {
    let world = FakeWorld::new();
    let legacy = upload(SPACE, "bafyverify", 2);
    world.seed_legacy(&legacy);
    let options = MachineOptions {
        mode: StepMode::Only(MigrationStep::Verify),
        ..MachineOptions::default()
    };

    let outcome = machine_with(&world, options).migrate(&legacy).await;

    assert!(!outcome.success);
    assert_eq!(outcome.steps, vec![MigrationStep::Analyze, MigrationStep::Verify]);
    assert_eq!(outcome.reason, Some(FailureReason::IndexMissing));
    assert_eq!(world.mutation_count(), 0);
}
