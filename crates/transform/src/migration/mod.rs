//! Background migration of stored resources between versions.
//!
//! A migration job walks a filtered population of the canonical store in
//! batches, transforms each resource from `from_version` to `to_version`,
//! and writes the result back with `to_version` as its canonical version.
//!
//! # Failure Semantics
//!
//! - Per-resource failures (a coercion outside its domain, an unmapped
//!   field, a rejected write) are recorded on the job and processing
//!   continues. A job that finishes with any of them is
//!   [`MigrationState::PartiallyCompleted`].
//! - Systemic failures (store unavailable, a filtered type with no route
//!   between the versions) stop the job as [`MigrationState::Failed`].
//! - Resources at neither version are skipped; resources already at the
//!   target version count as successes.
//!
//! # Example
//!
//! ```ignore
//! use helios_transform::migration::{MigrationEngine, MigrationRequest, MigrationFilter};
//!
//! let request = MigrationRequest::new(FhirVersion::R4, FhirVersion::R5)
//!     .with_filter(MigrationFilter::for_types(["Patient"]))
//!     .with_batch_size(500);
//! let job_id = migrations.create_job(request)?;
//! migrations.start(job_id)?;
//! let job = migrations.wait(job_id).await?;
//! println!("{} migrated, {} failed", job.success_count, job.failure_count);
//! ```

mod engine;
mod job;

pub use engine::MigrationEngine;
pub use job::{
    MigrationFailure, MigrationFilter, MigrationJob, MigrationOptions, MigrationRequest,
    MigrationState, RetryPolicy,
};
