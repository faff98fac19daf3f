//! Bulk migration jobs over the in-memory store.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use helios_transform::error::{EngineError, MigrationError};
use helios_transform::migration::{MigrationFilter, MigrationOptions, RetryPolicy};
use helios_transform::store::{CanonicalStore, InMemoryStore};
use helios_transform::types::{Resource, ResourceKey};
use helios_transform::{FhirVersion, MetricsSink, MigrationEngine, MigrationRequest, MigrationState};

use common::*;

fn observations_r4_to_r5(batch_size: usize) -> MigrationRequest {
    MigrationRequest::new(FhirVersion::R4, FhirVersion::R5)
        .with_filter(MigrationFilter::for_types(["Observation"]))
        .with_batch_size(batch_size)
}

fn failed_ids(job: &helios_transform::MigrationJob) -> BTreeSet<String> {
    job.failures.iter().map(|f| f.resource_id.clone()).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_large_migration_records_injected_failures() {
    let store = Arc::new(InMemoryStore::new());
    let bad = seed_observations(&store, 10_000, 20).await;
    assert_eq!(bad.len(), 500);

    let migrations = migrations(store.clone(), MigrationOptions::default());
    let job_id = migrations.create_job(observations_r4_to_r5(100)).unwrap();
    migrations.start(job_id).unwrap();
    let job = migrations.wait(job_id).await.unwrap();

    assert_eq!(job.state, MigrationState::PartiallyCompleted);
    assert_eq!(job.total_resources, 10_000);
    assert_eq!(job.success_count, 9_500);
    assert_eq!(job.failure_count, 500);
    assert_eq!(job.skipped_count, 0);
    assert_eq!(job.batches_completed, 100);
    assert!(job.error.is_none());
    assert!(job.completed_at.is_some());
    assert_eq!(failed_ids(&job), bad);
    assert!(job.failures.iter().all(|f| f.attempts == 1));

    let migrated = ids_at(&store, FhirVersion::R5).await;
    assert_eq!(migrated.len(), 9_500);
    assert!(migrated.is_disjoint(&bad));
    assert_eq!(ids_at(&store, FhirVersion::R4).await, bad);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_migrated_resources_are_stored_at_target_version() {
    let store = Arc::new(InMemoryStore::new());
    seed_observations(&store, 3, 0).await;

    let migrations = migrations(store.clone(), MigrationOptions::default());
    let job_id = migrations.create_job(observations_r4_to_r5(10)).unwrap();
    migrations.start(job_id).unwrap();
    let job = migrations.wait(job_id).await.unwrap();
    assert_eq!(job.state, MigrationState::Completed);

    let stored = store
        .get(&ResourceKey::new("Observation", numbered("obs", 1)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.schema_version(), FhirVersion::R5);
    assert_eq!(stored.canonical_version(), FhirVersion::R5);
    assert_eq!(stored.payload()["valueQuantity"]["value"], serde_json::json!(61.5));
    assert_eq!(stored.version_id(), "2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_paused_job_resumes_after_restore_without_double_counting() {
    let options = MigrationOptions {
        workers: 2,
        ..Default::default()
    };

    // Reference run without interruption.
    let reference_store = Arc::new(InMemoryStore::new());
    let bad = seed_observations(&reference_store, 1_000, 7).await;
    let reference = migrations(reference_store.clone(), options);
    let reference_id = reference.create_job(observations_r4_to_r5(50)).unwrap();
    reference.start(reference_id).unwrap();
    let expected = reference.wait(reference_id).await.unwrap();
    assert_eq!(expected.state, MigrationState::PartiallyCompleted);

    // Interrupted run: pause after three batches, then continue elsewhere.
    let store = Arc::new(InMemoryStore::new());
    seed_observations(&store, 1_000, 7).await;
    let pauser = PauseAfter::new(3);
    let first = MigrationEngine::with_sink(engine(), store.clone(), options, pauser.clone());
    pauser.engine.set(first.clone()).unwrap();

    let job_id = first.create_job(observations_r4_to_r5(50)).unwrap();
    first.start(job_id).unwrap();
    let paused = first.wait(job_id).await.unwrap();
    assert_eq!(paused.state, MigrationState::Paused);
    assert!(paused.batches_completed >= 3);
    assert!(paused.batches_completed < 20);
    assert!(paused.checkpoint.is_some());
    assert_eq!(paused.processed(), paused.batches_completed * 50);

    // Persist the snapshot and hand it to a fresh engine.
    let persisted = serde_json::to_string(&paused).unwrap();
    let second = migrations(store.clone(), options);
    let restored_id = second.restore(serde_json::from_str(&persisted).unwrap()).unwrap();
    assert_eq!(restored_id, job_id);
    second.resume(job_id).unwrap();
    let job = second.wait(job_id).await.unwrap();

    assert_eq!(job.state, expected.state);
    assert_eq!(job.success_count, expected.success_count);
    assert_eq!(job.failure_count, expected.failure_count);
    assert_eq!(job.batches_completed, expected.batches_completed);
    assert_eq!(failed_ids(&job), bad);
    assert_eq!(failed_ids(&job), failed_ids(&expected));
    assert_eq!(
        ids_at(&store, FhirVersion::R5).await,
        ids_at(&reference_store, FhirVersion::R5).await
    );
}

#[tokio::test]
async fn test_restore_rejects_known_job_and_pauses_running_snapshot() {
    let store = Arc::new(InMemoryStore::new());
    let migrations = migrations(store.clone(), MigrationOptions::default());
    let job_id = migrations.create_job(observations_r4_to_r5(10)).unwrap();

    let mut snapshot = migrations.status(job_id).unwrap();
    let err = migrations.restore(snapshot.clone()).unwrap_err();
    assert!(matches!(err, EngineError::Migration(MigrationError::InvalidRequest { .. })));

    snapshot.state = MigrationState::Running;
    let other = MigrationEngine::new(engine(), store, MigrationOptions::default());
    other.restore(snapshot).unwrap();
    assert_eq!(other.status(job_id).unwrap().state, MigrationState::Paused);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dry_run_leaves_store_untouched() {
    let store = Arc::new(InMemoryStore::new());
    let bad = seed_observations(&store, 120, 10).await;

    let migrations = migrations(store.clone(), MigrationOptions::default());
    let job_id = migrations
        .create_job(observations_r4_to_r5(25).dry_run())
        .unwrap();
    migrations.start(job_id).unwrap();
    let job = migrations.wait(job_id).await.unwrap();

    assert!(job.dry_run);
    assert_eq!(job.state, MigrationState::PartiallyCompleted);
    assert_eq!(job.success_count, 108);
    assert_eq!(failed_ids(&job), bad);
    assert!(ids_at(&store, FhirVersion::R5).await.is_empty());
    assert_eq!(ids_at(&store, FhirVersion::R4).await.len(), 120);
}

#[tokio::test]
async fn test_cancel_pending_job() {
    let store = Arc::new(InMemoryStore::new());
    seed_observations(&store, 10, 0).await;
    let sink = Arc::new(MetricsSink::new());
    let migrations =
        MigrationEngine::with_sink(engine(), store.clone(), MigrationOptions::default(), sink.clone());

    let job_id = migrations.create_job(observations_r4_to_r5(5)).unwrap();
    migrations.cancel(job_id).unwrap();

    let job = migrations.wait(job_id).await.unwrap();
    assert_eq!(job.state, MigrationState::Cancelled);
    assert!(job.completed_at.is_some());
    assert_eq!(sink.snapshot().migration_jobs_finished, 1);

    let err = migrations.start(job_id).unwrap_err();
    assert!(matches!(err, EngineError::Migration(MigrationError::InvalidJobState { .. })));
    let err = migrations.cancel(job_id).unwrap_err();
    assert!(matches!(err, EngineError::Migration(MigrationError::InvalidJobState { .. })));
    assert!(ids_at(&store, FhirVersion::R5).await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unavailable_store_fails_job() {
    let store = Arc::new(InMemoryStore::new());
    seed_observations(&store, 20, 0).await;
    store.set_available(false);

    let migrations = migrations(store.clone(), MigrationOptions::default());
    let job_id = migrations.create_job(observations_r4_to_r5(5)).unwrap();
    migrations.start(job_id).unwrap();
    let job = migrations.wait(job_id).await.unwrap();

    assert_eq!(job.state, MigrationState::Failed);
    let error = job.error.expect("failure cause");
    assert!(error.contains("store unavailable"), "{}", error);
    assert_eq!(job.success_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_route_fails_job() {
    let store = Arc::new(InMemoryStore::new());
    seed_observations(&store, 5, 0).await;

    let migrations = migrations(store.clone(), MigrationOptions::default());
    let request = MigrationRequest::new(FhirVersion::R4, FhirVersion::R6)
        .with_filter(MigrationFilter::for_types(["Observation"]));
    let job_id = migrations.create_job(request).unwrap();
    migrations.start(job_id).unwrap();
    let job = migrations.wait(job_id).await.unwrap();

    assert_eq!(job.state, MigrationState::Failed);
    let error = job.error.expect("failure cause");
    assert!(error.contains("Observation") && error.contains("R6"), "{}", error);
    assert_eq!(job.batches_completed, 0);
    assert_eq!(ids_at(&store, FhirVersion::R4).await.len(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resubmitted_failures_complete_after_fix() {
    let store = Arc::new(InMemoryStore::new());
    let bad = seed_observations(&store, 200, 10).await;

    let migrations = migrations(store.clone(), MigrationOptions::default());
    let job_id = migrations.create_job(observations_r4_to_r5(30)).unwrap();
    migrations.start(job_id).unwrap();
    let job = migrations.wait(job_id).await.unwrap();
    assert_eq!(job.state, MigrationState::PartiallyCompleted);
    assert_eq!(job.failure_count, 20);

    for id in &bad {
        store
            .put(resource(FhirVersion::R4, observation_r4(id, "98.6")))
            .await
            .unwrap();
    }

    let retry_id = migrations.resubmit_failures(job_id).unwrap();
    let pending = migrations.status(retry_id).unwrap();
    assert_eq!(pending.state, MigrationState::Pending);
    assert_eq!(pending.resource_type_filter, vec!["Observation".to_string()]);
    assert_eq!(pending.id_filter.len(), 20);

    migrations.start(retry_id).unwrap();
    let retried = migrations.wait(retry_id).await.unwrap();
    assert_eq!(retried.state, MigrationState::Completed);
    assert_eq!(retried.total_resources, 20);
    assert_eq!(retried.success_count, 20);
    assert_eq!(ids_at(&store, FhirVersion::R5).await.len(), 200);

    let err = migrations.resubmit_failures(retry_id).unwrap_err();
    assert!(matches!(err, EngineError::Migration(MigrationError::InvalidRequest { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replaying_a_finished_migration_writes_nothing() {
    let store = Arc::new(InMemoryStore::new());
    seed_observations(&store, 40, 0).await;
    let migrations = migrations(store.clone(), MigrationOptions::default());

    let first = migrations.create_job(observations_r4_to_r5(15)).unwrap();
    migrations.start(first).unwrap();
    assert_eq!(migrations.wait(first).await.unwrap().state, MigrationState::Completed);

    let replay = migrations.create_job(observations_r4_to_r5(15)).unwrap();
    migrations.start(replay).unwrap();
    let job = migrations.wait(replay).await.unwrap();
    assert_eq!(job.state, MigrationState::Completed);
    assert_eq!(job.success_count, 40);

    let history = store
        .history(&ResourceKey::new("Observation", numbered("obs", 0)))
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(migrations.list_jobs().len(), 2);
    assert_eq!(migrations.list_jobs()[0].id, first);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transient_write_faults_are_retried() {
    let store = Arc::new(InMemoryStore::new());
    seed_observations(&store, 10, 0).await;
    let flaky = ResourceKey::new("Observation", numbered("obs", 4));
    store.fail_next_writes(flaky.clone(), 1);

    let options = MigrationOptions {
        retry: RetryPolicy { max_attempts: 2 },
        ..Default::default()
    };
    let migrations = migrations(store.clone(), options);
    let job_id = migrations.create_job(observations_r4_to_r5(5)).unwrap();
    migrations.start(job_id).unwrap();
    let job = migrations.wait(job_id).await.unwrap();

    assert_eq!(job.state, MigrationState::Completed);
    assert_eq!(job.success_count, 10);
    let stored = store.get(&flaky).await.unwrap().unwrap();
    assert_eq!(stored.schema_version(), FhirVersion::R5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_write_fault_without_retry_is_a_failure() {
    let store = Arc::new(InMemoryStore::new());
    seed_observations(&store, 10, 0).await;
    let flaky = ResourceKey::new("Observation", numbered("obs", 4));
    store.fail_next_writes(flaky.clone(), 1);

    let migrations = migrations(store.clone(), MigrationOptions::default());
    let job_id = migrations.create_job(observations_r4_to_r5(5)).unwrap();
    migrations.start(job_id).unwrap();
    let job = migrations.wait(job_id).await.unwrap();

    assert_eq!(job.state, MigrationState::PartiallyCompleted);
    assert_eq!(job.failures.len(), 1);
    let failure = &job.failures[0];
    assert_eq!(failure.key(), flaky);
    assert_eq!(failure.attempts, 1);
    assert!(failure.error.contains("injected write fault"), "{}", failure.error);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resources_at_other_versions_are_skipped() {
    let store = Arc::new(InMemoryStore::new());
    seed_observations(&store, 6, 0).await;
    for n in 0..4 {
        let id = numbered("r4b", n);
        store
            .put(Resource::new(
                "Observation",
                id.as_str(),
                FhirVersion::R4B,
                FhirVersion::R4B,
                observation_r4(&id, "70.0"),
            ))
            .await
            .unwrap();
    }

    let migrations = migrations(store.clone(), MigrationOptions::default());
    let job_id = migrations.create_job(observations_r4_to_r5(3)).unwrap();
    migrations.start(job_id).unwrap();
    let job = migrations.wait(job_id).await.unwrap();

    assert_eq!(job.state, MigrationState::Completed);
    assert_eq!(job.total_resources, 10);
    assert_eq!(job.success_count, 6);
    assert_eq!(job.skipped_count, 4);
    assert_eq!(job.percentage(), 100.0);
    assert_eq!(ids_at(&store, FhirVersion::R4B).await.len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batch_events_match_committed_batches() {
    let store = Arc::new(InMemoryStore::new());
    seed_observations(&store, 95, 0).await;
    let sink = Arc::new(MetricsSink::new());
    let migrations =
        MigrationEngine::with_sink(engine(), store.clone(), MigrationOptions::default(), sink.clone());

    let job_id = migrations.create_job(observations_r4_to_r5(10)).unwrap();
    migrations.start(job_id).unwrap();
    let job = migrations.wait(job_id).await.unwrap();

    assert_eq!(job.batches_completed, 10);
    let metrics = sink.snapshot();
    assert_eq!(metrics.migration_batches, job.batches_completed);
    assert_eq!(metrics.migration_jobs_finished, 1);
}

#[tokio::test]
async fn test_invalid_requests_and_transitions() {
    let store = Arc::new(InMemoryStore::new());
    let migrations = migrations(store, MigrationOptions::default());

    let err = migrations
        .create_job(observations_r4_to_r5(0))
        .unwrap_err();
    assert!(matches!(err, EngineError::Migration(MigrationError::InvalidRequest { .. })));

    let err = migrations
        .create_job(MigrationRequest::new(FhirVersion::R5, FhirVersion::R5))
        .unwrap_err();
    assert!(matches!(err, EngineError::Migration(MigrationError::InvalidRequest { .. })));

    let job_id = migrations.create_job(observations_r4_to_r5(10)).unwrap();
    let err = migrations.pause(job_id).unwrap_err();
    assert!(matches!(err, EngineError::Migration(MigrationError::InvalidJobState { .. })));
    let err = migrations.resume(job_id).unwrap_err();
    assert!(matches!(err, EngineError::Migration(MigrationError::InvalidJobState { .. })));

    let unknown = uuid::Uuid::new_v4();
    let err = migrations.status(unknown).unwrap_err();
    assert!(matches!(err, EngineError::Migration(MigrationError::JobNotFound { .. })));
    assert!(migrations.wait(unknown).await.is_err());
}

#[tokio::test]
async fn test_starting_twice_is_rejected() {
    let store = Arc::new(InMemoryStore::new());
    let migrations = migrations(store, MigrationOptions::default());
    let job_id = migrations.create_job(observations_r4_to_r5(10)).unwrap();

    migrations.start(job_id).unwrap();
    let err = migrations.start(job_id).unwrap_err();
    assert!(matches!(err, EngineError::Migration(MigrationError::InvalidJobState { .. })));

    let job = migrations.wait(job_id).await.unwrap();
    assert_eq!(job.state, MigrationState::Completed);
    assert_eq!(job.total_resources, 0);
}
