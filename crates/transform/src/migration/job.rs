//! Migration job records.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::ResourceFilter;
use crate::types::ResourceKey;
use crate::version::FhirVersion;

/// Selects the resources a migration job walks.
pub type MigrationFilter = ResourceFilter;

/// Lifecycle state of a migration job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MigrationState {
    /// Created but not started.
    Pending,
    /// Batches are being processed.
    Running,
    /// Stopped cooperatively; can be resumed.
    Paused,
    /// Every resource succeeded.
    Completed,
    /// Finished with at least one per-resource failure.
    PartiallyCompleted,
    /// Stopped by a systemic failure.
    Failed,
    /// Stopped at the caller's request.
    Cancelled,
}

impl MigrationState {
    /// Returns true if the job can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationState::Completed
                | MigrationState::PartiallyCompleted
                | MigrationState::Failed
                | MigrationState::Cancelled
        )
    }

    /// Returns true while batches may still be processed.
    pub fn is_running(&self) -> bool {
        matches!(self, MigrationState::Running)
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationState::Pending => "pending",
            MigrationState::Running => "running",
            MigrationState::Paused => "paused",
            MigrationState::Completed => "completed",
            MigrationState::PartiallyCompleted => "partially-completed",
            MigrationState::Failed => "failed",
            MigrationState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Request to create a migration job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRequest {
    /// Resources to walk.
    #[serde(default)]
    pub filter: MigrationFilter,
    /// Version of the resources to migrate.
    pub from_version: FhirVersion,
    /// Version to migrate them to.
    pub to_version: FhirVersion,
    /// Resources per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Run the pipeline without writing.
    #[serde(default)]
    pub dry_run: bool,
}

fn default_batch_size() -> usize {
    100
}

impl MigrationRequest {
    /// Creates a request over every resource.
    pub fn new(from_version: FhirVersion, to_version: FhirVersion) -> Self {
        Self {
            filter: MigrationFilter::all(),
            from_version,
            to_version,
            batch_size: default_batch_size(),
            dry_run: false,
        }
    }

    /// Sets the filter.
    pub fn with_filter(mut self, filter: MigrationFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Enables dry-run mode.
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

/// A resource that failed to migrate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationFailure {
    /// Resource type.
    pub resource_type: String,
    /// Resource id.
    pub resource_id: String,
    /// Error message.
    pub error: String,
    /// Attempts made.
    pub attempts: u32,
}

impl MigrationFailure {
    /// Returns the failed resource's key.
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.resource_type, &self.resource_id)
    }
}

/// Snapshot of a migration job.
///
/// Snapshots are serializable so a job can be persisted and later handed
/// back to [`MigrationEngine::restore`](super::MigrationEngine::restore)
/// after a restart; processing resumes after `checkpoint`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationJob {
    /// Unique job identifier.
    pub id: Uuid,
    /// Resource types to include (empty = all).
    pub resource_type_filter: Vec<String>,
    /// Resource ids to include (empty = all).
    pub id_filter: Vec<String>,
    /// Version of the resources to migrate.
    pub from_version: FhirVersion,
    /// Target version.
    pub to_version: FhirVersion,
    /// Resources per batch.
    pub batch_size: usize,
    /// Whether writes are skipped.
    pub dry_run: bool,
    /// Current state.
    pub state: MigrationState,
    /// Key of the last resource of the last committed batch.
    pub checkpoint: Option<ResourceKey>,
    /// Resources matching the filter when the job started.
    pub total_resources: u64,
    /// Resources migrated (or already at the target version).
    pub success_count: u64,
    /// Resources that failed.
    pub failure_count: u64,
    /// Resources at neither version.
    pub skipped_count: u64,
    /// Batches committed.
    pub batches_completed: u64,
    /// Per-resource failures.
    pub failures: Vec<MigrationFailure>,
    /// Systemic failure cause, if the job failed.
    pub error: Option<String>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job first started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl MigrationJob {
    /// Creates a pending job from a request.
    pub fn new(request: MigrationRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource_type_filter: request.filter.resource_types,
            id_filter: request.filter.ids,
            from_version: request.from_version,
            to_version: request.to_version,
            batch_size: request.batch_size,
            dry_run: request.dry_run,
            state: MigrationState::Pending,
            checkpoint: None,
            total_resources: 0,
            success_count: 0,
            failure_count: 0,
            skipped_count: 0,
            batches_completed: 0,
            failures: Vec::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Returns the filter the job walks.
    pub fn filter(&self) -> MigrationFilter {
        MigrationFilter {
            resource_types: self.resource_type_filter.clone(),
            ids: self.id_filter.clone(),
        }
    }

    /// Resources accounted for so far.
    pub fn processed(&self) -> u64 {
        self.success_count + self.failure_count + self.skipped_count
    }

    /// Returns the progress percentage (0-100).
    pub fn percentage(&self) -> f64 {
        if self.total_resources == 0 {
            0.0
        } else {
            (self.processed() as f64 / self.total_resources as f64) * 100.0
        }
    }

    /// Terminal state for a job that walked its whole population.
    pub(crate) fn finished_state(&self) -> MigrationState {
        if self.failure_count == 0 {
            MigrationState::Completed
        } else {
            MigrationState::PartiallyCompleted
        }
    }
}

/// Retry policy for transient per-resource failures.
///
/// Timeouts and non-systemic store errors are retried; transformation errors
/// are deterministic and never are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts per resource, including the first (minimum 1).
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 1 }
    }
}

/// Tuning for the migration engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationOptions {
    /// Batches processed concurrently.
    pub workers: usize,
    /// Time allowed for one resource's transformation.
    pub resource_timeout: Duration,
    /// Retry policy for transient failures.
    pub retry: RetryPolicy,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            resource_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}
