use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::{
    MigrationFailure, MigrationFilter, MigrationJob, MigrationOptions, MigrationRequest,
    MigrationState, RetryPolicy,
};
use crate::cache::TransformCache;
use crate::engine::{TransformEngine, TransformOutput};
use crate::error::{EngineError, EngineResult, MigrationError, StoreError};
use crate::events::{EngineEvent, EventSink, NoopSink};
use crate::store::CanonicalStore;
use crate::types::{Resource, ResourceKey};
use crate::version::FhirVersion;

/// Cooperative control flags shared with a job's runner.
#[derive(Debug)]
struct JobControl {
    pause: AtomicBool,
    cancel: AtomicBool,
    state: watch::Sender<MigrationState>,
}

impl JobControl {
    fn new(state: MigrationState) -> Self {
        Self {
            pause: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            state: watch::Sender::new(state),
        }
    }
}

#[derive(Debug)]
struct JobEntry {
    job: MigrationJob,
    control: Arc<JobControl>,
}

#[derive(Debug)]
struct Inner {
    engine: TransformEngine,
    store: Arc<dyn CanonicalStore>,
    options: MigrationOptions,
    sink: Arc<dyn EventSink>,
    cache: Option<Arc<TransformCache<TransformOutput, EngineError>>>,
    jobs: RwLock<HashMap<Uuid, JobEntry>>,
}

/// Parameters a batch worker needs.
#[derive(Debug, Clone, Copy)]
struct BatchParams {
    job_id: Uuid,
    from: FhirVersion,
    to: FhirVersion,
    dry_run: bool,
}

#[derive(Debug)]
enum ResourceOutcome {
    Succeeded,
    Skipped,
    Failed(MigrationFailure),
}

#[derive(Debug)]
struct BatchOutcome {
    number: u64,
    last_key: Option<ResourceKey>,
    succeeded: u64,
    skipped: u64,
    failures: Vec<MigrationFailure>,
    systemic: Option<EngineError>,
    started: Instant,
}

/// An error from one attempt at processing a resource.
#[derive(Debug)]
pub(crate) struct AttemptError {
    pub(crate) error: EngineError,
    pub(crate) retryable: bool,
}

impl AttemptError {
    fn permanent(error: impl Into<EngineError>) -> Self {
        Self {
            error: error.into(),
            retryable: false,
        }
    }

    fn transient(error: impl Into<EngineError>) -> Self {
        Self {
            error: error.into(),
            retryable: true,
        }
    }
}

/// Runs `op` until it succeeds, fails permanently, or the policy's attempts
/// are exhausted. Returns the final result and the attempts made.
pub(crate) async fn with_retries<T, F, Fut>(
    policy: RetryPolicy,
    mut op: F,
) -> (Result<T, AttemptError>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.retryable && attempt < max_attempts => {
                debug!(attempt, error = %e.error, "Retrying resource after transient failure");
                attempt += 1;
            }
            result => return (result, attempt),
        }
    }
}

/// Awaits `fut`, failing with [`MigrationError::Timeout`] after `timeout`.
pub(crate) async fn with_timeout<T, Fut>(
    timeout: Duration,
    key: &ResourceKey,
    fut: Fut,
) -> Result<T, MigrationError>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| MigrationError::Timeout {
            resource_type: key.resource_type.clone(),
            id: key.id.clone(),
            timeout_ms: timeout.as_millis() as u64,
        })
}

/// Batch job runner over the canonical store.
///
/// Jobs walk their population in stable key order, `batch_size` resources
/// at a time. Up to `workers` batches run concurrently, but batch results
/// are committed strictly in order, so `checkpoint` and the counters only
/// ever cover a contiguous prefix of the population. Pause and cancel are
/// checked between batches; a batch that has started always finishes.
#[derive(Debug, Clone)]
pub struct MigrationEngine {
    inner: Arc<Inner>,
}

impl MigrationEngine {
    /// Creates a migration engine.
    pub fn new(engine: TransformEngine, store: Arc<dyn CanonicalStore>, options: MigrationOptions) -> Self {
        Self::with_sink(engine, store, options, Arc::new(NoopSink))
    }

    /// Creates a migration engine reporting to `sink`.
    pub fn with_sink(
        engine: TransformEngine,
        store: Arc<dyn CanonicalStore>,
        options: MigrationOptions,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self::build(engine, store, options, sink, None)
    }

    /// Creates a migration engine that invalidates `cache` for every
    /// resource it writes.
    pub(crate) fn build(
        engine: TransformEngine,
        store: Arc<dyn CanonicalStore>,
        options: MigrationOptions,
        sink: Arc<dyn EventSink>,
        cache: Option<Arc<TransformCache<TransformOutput, EngineError>>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                store,
                options,
                sink,
                cache,
                jobs: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Registers a pending job.
    ///
    /// # Errors
    ///
    /// * `MigrationError::InvalidRequest` - if the batch size is zero or the
    ///   versions are equal
    pub fn create_job(&self, request: MigrationRequest) -> EngineResult<Uuid> {
        if request.batch_size == 0 {
            return Err(MigrationError::InvalidRequest {
                message: "batch size must be greater than zero".to_string(),
            }
            .into());
        }
        if request.from_version == request.to_version {
            return Err(MigrationError::InvalidRequest {
                message: format!("source and target are both {}", request.from_version),
            }
            .into());
        }

        let job = MigrationJob::new(request);
        let id = job.id;
        info!(
            job_id = %id,
            from = %job.from_version,
            to = %job.to_version,
            batch_size = job.batch_size,
            dry_run = job.dry_run,
            "Created migration job"
        );
        self.insert(job);
        Ok(id)
    }

    fn insert(&self, job: MigrationJob) {
        let control = Arc::new(JobControl::new(job.state));
        self.inner
            .jobs
            .write()
            .insert(job.id, JobEntry { job, control });
    }

    /// Starts a pending job in the background.
    pub fn start(&self, job_id: Uuid) -> EngineResult<()> {
        self.transition(job_id, MigrationState::Pending, |job| {
            job.started_at = Some(Utc::now());
        })?;
        self.spawn(job_id);
        Ok(())
    }

    /// Asks a running job to pause after its in-flight batches.
    pub fn pause(&self, job_id: Uuid) -> EngineResult<()> {
        let jobs = self.inner.jobs.read();
        let entry = jobs.get(&job_id).ok_or_else(|| not_found(job_id))?;
        if entry.job.state != MigrationState::Running {
            return Err(invalid_state(job_id, "running", entry.job.state).into());
        }
        entry.control.pause.store(true, Ordering::SeqCst);
        info!(job_id = %job_id, "Pause requested");
        Ok(())
    }

    /// Resumes a paused job from its checkpoint.
    pub fn resume(&self, job_id: Uuid) -> EngineResult<()> {
        self.transition(job_id, MigrationState::Paused, |_| {})?;
        self.spawn(job_id);
        Ok(())
    }

    /// Cancels a job. Pending and paused jobs stop immediately; running
    /// jobs stop after their in-flight batches.
    pub fn cancel(&self, job_id: Uuid) -> EngineResult<()> {
        let mut jobs = self.inner.jobs.write();
        let entry = jobs.get_mut(&job_id).ok_or_else(|| not_found(job_id))?;
        match entry.job.state {
            MigrationState::Running => {
                entry.control.cancel.store(true, Ordering::SeqCst);
            }
            MigrationState::Pending | MigrationState::Paused => {
                entry.job.state = MigrationState::Cancelled;
                entry.job.completed_at = Some(Utc::now());
                entry.control.state.send_replace(MigrationState::Cancelled);
                drop(jobs);
                self.inner.sink.emit(&EngineEvent::MigrationJobFinished {
                    job_id,
                    state: MigrationState::Cancelled,
                });
            }
            other => return Err(invalid_state(job_id, "pending, running or paused", other).into()),
        }
        info!(job_id = %job_id, "Cancellation requested");
        Ok(())
    }

    /// Returns a snapshot of the job.
    pub fn status(&self, job_id: Uuid) -> EngineResult<MigrationJob> {
        self.inner
            .jobs
            .read()
            .get(&job_id)
            .map(|e| e.job.clone())
            .ok_or_else(|| not_found(job_id).into())
    }

    /// Waits until the job is no longer running, then returns its snapshot.
    pub async fn wait(&self, job_id: Uuid) -> EngineResult<MigrationJob> {
        let mut rx = {
            let jobs = self.inner.jobs.read();
            let entry = jobs.get(&job_id).ok_or_else(|| not_found(job_id))?;
            entry.control.state.subscribe()
        };
        // The sender lives as long as the job entry, so this only fails if
        // the engine itself is dropped.
        let _ = rx.wait_for(|state| !state.is_running()).await;
        self.status(job_id)
    }

    /// Lists every job known to the engine, oldest first.
    pub fn list_jobs(&self) -> Vec<MigrationJob> {
        let mut jobs: Vec<MigrationJob> = self
            .inner
            .jobs
            .read()
            .values()
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Restores a persisted job snapshot, e.g. after a process restart.
    ///
    /// A snapshot taken while running is restored as paused; call
    /// [`resume`](Self::resume) to continue after its checkpoint.
    pub fn restore(&self, mut snapshot: MigrationJob) -> EngineResult<Uuid> {
        if self.inner.jobs.read().contains_key(&snapshot.id) {
            return Err(MigrationError::InvalidRequest {
                message: format!("job {} already exists", snapshot.id),
            }
            .into());
        }
        if snapshot.state == MigrationState::Running {
            snapshot.state = MigrationState::Paused;
        }
        let id = snapshot.id;
        info!(
            job_id = %id,
            state = %snapshot.state,
            checkpoint = ?snapshot.checkpoint,
            "Restored migration job"
        );
        self.insert(snapshot);
        Ok(id)
    }

    /// Creates a new pending job covering only the failed resources of a
    /// finished job.
    pub fn resubmit_failures(&self, job_id: Uuid) -> EngineResult<Uuid> {
        let job = self.status(job_id)?;
        if !job.state.is_terminal() {
            return Err(invalid_state(job_id, "finished", job.state).into());
        }
        if job.failures.is_empty() {
            return Err(MigrationError::InvalidRequest {
                message: format!("job {} has no failures to resubmit", job_id),
            }
            .into());
        }

        let mut types: Vec<String> = job.failures.iter().map(|f| f.resource_type.clone()).collect();
        types.sort();
        types.dedup();
        let ids: Vec<String> = job.failures.iter().map(|f| f.resource_id.clone()).collect();

        let request = MigrationRequest {
            filter: MigrationFilter {
                resource_types: types,
                ids,
            },
            from_version: job.from_version,
            to_version: job.to_version,
            batch_size: job.batch_size,
            dry_run: job.dry_run,
        };
        let new_id = self.create_job(request)?;
        info!(job_id = %job_id, resubmitted_as = %new_id, failures = job.failures.len(), "Resubmitted failures");
        Ok(new_id)
    }

    fn transition<F>(&self, job_id: Uuid, expected: MigrationState, f: F) -> EngineResult<()>
    where
        F: FnOnce(&mut MigrationJob),
    {
        let mut jobs = self.inner.jobs.write();
        let entry = jobs.get_mut(&job_id).ok_or_else(|| not_found(job_id))?;
        if entry.job.state != expected {
            return Err(invalid_state(job_id, &expected.to_string(), entry.job.state).into());
        }
        f(&mut entry.job);
        entry.job.state = MigrationState::Running;
        entry.control.pause.store(false, Ordering::SeqCst);
        entry.control.state.send_replace(MigrationState::Running);
        Ok(())
    }

    fn spawn(&self, job_id: Uuid) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            run(inner, job_id).await;
        });
    }
}

fn not_found(job_id: Uuid) -> MigrationError {
    MigrationError::JobNotFound {
        job_id: job_id.to_string(),
    }
}

fn invalid_state(job_id: Uuid, expected: &str, actual: MigrationState) -> MigrationError {
    MigrationError::InvalidJobState {
        job_id: job_id.to_string(),
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}

impl Inner {
    fn snapshot(&self, job_id: Uuid) -> Option<(MigrationJob, Arc<JobControl>)> {
        self.jobs
            .read()
            .get(&job_id)
            .map(|e| (e.job.clone(), e.control.clone()))
    }

    fn update<F>(&self, job_id: Uuid, f: F)
    where
        F: FnOnce(&mut MigrationJob),
    {
        let mut jobs = self.jobs.write();
        if let Some(entry) = jobs.get_mut(&job_id) {
            let before = entry.job.state;
            f(&mut entry.job);
            if entry.job.state != before {
                entry.control.state.send_replace(entry.job.state);
            }
        }
    }

    fn finish(&self, job_id: Uuid, state: MigrationState, error: Option<String>) {
        self.update(job_id, |job| {
            job.state = state;
            job.error = error;
            if state.is_terminal() {
                job.completed_at = Some(Utc::now());
            }
        });
        if let Some((job, _)) = self.snapshot(job_id) {
            info!(
                job_id = %job_id,
                state = %state,
                succeeded = job.success_count,
                failed = job.failure_count,
                skipped = job.skipped_count,
                batches = job.batches_completed,
                "Migration job stopped"
            );
        }
        self.sink
            .emit(&EngineEvent::MigrationJobFinished { job_id, state });
    }

    fn commit(&self, job_id: Uuid, outcome: &BatchOutcome) {
        self.update(job_id, |job| {
            job.success_count += outcome.succeeded;
            job.skipped_count += outcome.skipped;
            job.failure_count += outcome.failures.len() as u64;
            job.failures.extend(outcome.failures.iter().cloned());
            job.batches_completed += 1;
            if outcome.last_key.is_some() {
                job.checkpoint = outcome.last_key.clone();
            }
        });
        self.sink.emit(&EngineEvent::MigrationBatchCompleted {
            job_id,
            batch: outcome.number,
            succeeded: outcome.succeeded,
            failed: outcome.failures.len() as u64,
            skipped: outcome.skipped,
            duration: outcome.started.elapsed(),
        });
    }

    /// Fails the job if a filtered resource type has no route between the
    /// job's versions.
    fn check_routes(&self, job: &MigrationJob) -> Result<(), EngineError> {
        for resource_type in &job.resource_type_filter {
            self.engine
                .registry()
                .find_path(resource_type, job.from_version, job.to_version)?;
        }
        Ok(())
    }
}

async fn run(inner: Arc<Inner>, job_id: Uuid) {
    let Some((job, control)) = inner.snapshot(job_id) else {
        return;
    };

    if let Err(e) = inner.check_routes(&job) {
        error!(job_id = %job_id, error = %e, "Migration job has no transformation route");
        inner.finish(job_id, MigrationState::Failed, Some(e.to_string()));
        return;
    }

    let filter = job.filter();
    match inner.store.count(&filter).await {
        Ok(total) => inner.update(job_id, |j| j.total_resources = total),
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Migration job cannot reach the store");
            inner.finish(job_id, MigrationState::Failed, Some(e.to_string()));
            return;
        }
    }

    let params = BatchParams {
        job_id,
        from: job.from_version,
        to: job.to_version,
        dry_run: job.dry_run,
    };
    let workers = inner.options.workers.max(1);
    let mut cursor = job.checkpoint.clone();
    let mut next_number = job.batches_completed;
    let mut next_commit = job.batches_completed;
    let mut finished: BTreeMap<u64, BatchOutcome> = BTreeMap::new();
    let mut tasks: JoinSet<BatchOutcome> = JoinSet::new();
    let mut exhausted = false;
    let mut systemic: Option<String> = None;

    info!(
        job_id = %job_id,
        checkpoint = ?cursor,
        workers,
        "Migration job running"
    );

    loop {
        let stopping = control.pause.load(Ordering::SeqCst) || control.cancel.load(Ordering::SeqCst);

        while systemic.is_none() && !stopping && !exhausted && tasks.len() < workers {
            match inner.store.list(&filter, cursor.as_ref(), job.batch_size).await {
                Ok(page) if page.is_empty() => exhausted = true,
                Ok(page) => {
                    exhausted = page.len() < job.batch_size;
                    cursor = page.last().map(Resource::key);
                    let number = next_number;
                    next_number += 1;
                    let inner = inner.clone();
                    tasks.spawn(async move { process_batch(inner, params, number, page).await });
                }
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "Failed to list resources");
                    systemic = Some(e.to_string());
                }
            }
        }

        let Some(joined) = tasks.join_next().await else {
            break;
        };
        match joined {
            Ok(outcome) => {
                finished.insert(outcome.number, outcome);
            }
            Err(e) if e.is_cancelled() => continue,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Migration batch task failed");
                systemic.get_or_insert_with(|| format!("batch task failed: {}", e));
                tasks.abort_all();
                continue;
            }
        }

        while systemic.is_none() {
            let Some(outcome) = finished.remove(&next_commit) else {
                break;
            };
            if let Some(e) = &outcome.systemic {
                error!(job_id = %job_id, batch = outcome.number, error = %e, "Systemic migration failure");
                systemic.get_or_insert_with(|| e.to_string());
                tasks.abort_all();
                break;
            }
            inner.commit(job_id, &outcome);
            next_commit += 1;
        }
    }

    if let Some(reason) = systemic {
        inner.finish(job_id, MigrationState::Failed, Some(reason));
        return;
    }
    let final_state = if control.cancel.load(Ordering::SeqCst) {
        MigrationState::Cancelled
    } else if control.pause.load(Ordering::SeqCst) && !exhausted {
        MigrationState::Paused
    } else {
        match inner.snapshot(job_id) {
            Some((job, _)) => job.finished_state(),
            None => return,
        }
    };
    inner.finish(job_id, final_state, None);
}

async fn process_batch(
    inner: Arc<Inner>,
    params: BatchParams,
    number: u64,
    page: Vec<Resource>,
) -> BatchOutcome {
    let mut outcome = BatchOutcome {
        number,
        last_key: page.last().map(Resource::key),
        succeeded: 0,
        skipped: 0,
        failures: Vec::new(),
        systemic: None,
        started: Instant::now(),
    };

    for resource in page {
        match process_resource(&inner, params, resource).await {
            Ok(ResourceOutcome::Succeeded) => outcome.succeeded += 1,
            Ok(ResourceOutcome::Skipped) => outcome.skipped += 1,
            Ok(ResourceOutcome::Failed(failure)) => outcome.failures.push(failure),
            Err(e) => {
                outcome.systemic = Some(e);
                break;
            }
        }
    }

    debug!(
        job_id = %params.job_id,
        batch = number,
        succeeded = outcome.succeeded,
        failed = outcome.failures.len(),
        "Migration batch processed"
    );
    outcome
}

/// Processes one resource. Per-resource failures are returned as
/// [`ResourceOutcome::Failed`]; systemic ones as `Err`.
async fn process_resource(
    inner: &Arc<Inner>,
    params: BatchParams,
    resource: Resource,
) -> Result<ResourceOutcome, EngineError> {
    let version = resource.schema_version();
    if version == params.to {
        return Ok(ResourceOutcome::Succeeded);
    }
    if version != params.from {
        return Ok(ResourceOutcome::Skipped);
    }

    let key = resource.key();
    let resource = Arc::new(resource);
    let (result, attempts) = with_retries(inner.options.retry, || {
        let inner = inner.clone();
        let resource = resource.clone();
        let key = key.clone();
        async move { migrate_once(&inner, params, resource, &key).await }
    })
    .await;

    match result {
        Ok(()) => Ok(ResourceOutcome::Succeeded),
        Err(e) if e.error.is_systemic() => Err(e.error),
        Err(e) => {
            warn!(
                job_id = %params.job_id,
                resource = %key,
                attempts,
                error = %e.error,
                "Resource failed to migrate"
            );
            Ok(ResourceOutcome::Failed(MigrationFailure {
                resource_type: key.resource_type,
                resource_id: key.id,
                error: e.error.to_string(),
                attempts,
            }))
        }
    }
}

async fn migrate_once(
    inner: &Inner,
    params: BatchParams,
    resource: Arc<Resource>,
    key: &ResourceKey,
) -> Result<(), AttemptError> {
    let engine = inner.engine.clone();
    let to = params.to;
    let transform = tokio::task::spawn_blocking(move || engine.transform(&resource, to));

    let output: TransformOutput = match with_timeout(inner.options.resource_timeout, key, transform).await {
        Err(timeout) => return Err(AttemptError::transient(timeout)),
        Ok(Err(join)) => {
            return Err(AttemptError::permanent(MigrationError::InvalidRequest {
                message: format!("transformation task failed: {}", join),
            }));
        }
        Ok(Ok(result)) => result.map_err(AttemptError::permanent)?,
    };

    if params.dry_run {
        return Ok(());
    }

    let migrated = output.resource.with_canonical_version(to);
    match inner.store.put(migrated).await {
        Ok(_) => {
            if let Some(cache) = &inner.cache {
                cache.invalidate(key);
            }
            Ok(())
        }
        Err(e @ StoreError::Unavailable { .. }) => Err(AttemptError::permanent(e)),
        Err(e) => Err(AttemptError::transient(e)),
    }
}
