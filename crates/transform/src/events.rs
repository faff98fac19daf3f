//! Engine events and the sinks that receive them.
//!
//! Components emit discrete [`EngineEvent`]s to an injected [`EventSink`];
//! the concrete metrics or logging backend lives outside the engine.
//! [`TracingSink`] forwards events as structured `tracing` records and
//! [`MetricsSink`] keeps in-memory tallies.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::migration::MigrationState;
use crate::version::FhirVersion;

/// A discrete observation emitted by the engine.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A transformation finished (successfully or not).
    TransformCompleted {
        resource_type: String,
        from: FhirVersion,
        to: FhirVersion,
        hops: usize,
        duration: Duration,
        success: bool,
    },

    /// A cache lookup was served from the cache.
    CacheHit {
        resource_type: String,
        target: FhirVersion,
    },

    /// A cache lookup had to compute the value.
    CacheMiss {
        resource_type: String,
        target: FhirVersion,
    },

    /// A client asked for a resource at a version.
    VersionRequested {
        resource_type: String,
        version: FhirVersion,
    },

    /// A migration batch was committed.
    MigrationBatchCompleted {
        job_id: Uuid,
        batch: u64,
        succeeded: u64,
        failed: u64,
        skipped: u64,
        duration: Duration,
    },

    /// A migration job reached a resting state.
    MigrationJobFinished { job_id: Uuid, state: MigrationState },
}

/// Receives engine events.
pub trait EventSink: Send + Sync + fmt::Debug {
    /// Records one event. Must not block for long.
    fn emit(&self, event: &EngineEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: &EngineEvent) {}
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &EngineEvent) {
        match event {
            EngineEvent::TransformCompleted {
                resource_type,
                from,
                to,
                hops,
                duration,
                success,
            } => debug!(
                resource_type = %resource_type,
                from = %from,
                to = %to,
                hops,
                duration_us = duration.as_micros() as u64,
                success,
                "Transformation completed"
            ),
            EngineEvent::CacheHit {
                resource_type,
                target,
            } => debug!(resource_type = %resource_type, target = %target, "Cache hit"),
            EngineEvent::CacheMiss {
                resource_type,
                target,
            } => debug!(resource_type = %resource_type, target = %target, "Cache miss"),
            EngineEvent::VersionRequested {
                resource_type,
                version,
            } => debug!(resource_type = %resource_type, version = %version, "Version requested"),
            EngineEvent::MigrationBatchCompleted {
                job_id,
                batch,
                succeeded,
                failed,
                skipped,
                duration,
            } => info!(
                job_id = %job_id,
                batch,
                succeeded,
                failed,
                skipped,
                duration_ms = duration.as_millis() as u64,
                "Migration batch committed"
            ),
            EngineEvent::MigrationJobFinished { job_id, state } => {
                info!(job_id = %job_id, state = %state, "Migration job finished")
            }
        }
    }
}

/// Point-in-time copy of [`MetricsSink`] counters.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub version_requests: BTreeMap<FhirVersion, u64>,
    pub transforms: u64,
    pub failed_transforms: u64,
    pub transform_time: Duration,
    pub migration_batches: u64,
    pub migration_jobs_finished: u64,
}

/// Keeps in-memory tallies of events.
#[derive(Debug, Default)]
pub struct MetricsSink {
    inner: Mutex<MetricsSnapshot>,
}

impl MetricsSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().clone()
    }
}

impl EventSink for MetricsSink {
    fn emit(&self, event: &EngineEvent) {
        let mut m = self.inner.lock();
        match event {
            EngineEvent::TransformCompleted {
                duration, success, ..
            } => {
                m.transforms += 1;
                if !success {
                    m.failed_transforms += 1;
                }
                m.transform_time += *duration;
            }
            EngineEvent::CacheHit { .. } => m.cache_hits += 1,
            EngineEvent::CacheMiss { .. } => m.cache_misses += 1,
            EngineEvent::VersionRequested { version, .. } => {
                *m.version_requests.entry(*version).or_default() += 1;
            }
            EngineEvent::MigrationBatchCompleted { .. } => m.migration_batches += 1,
            EngineEvent::MigrationJobFinished { .. } => m.migration_jobs_finished += 1,
        }
    }
}

/// Fans events out to several sinks.
#[derive(Debug, Default)]
pub struct FanoutSink {
    sinks: Vec<std::sync::Arc<dyn EventSink>>,
}

impl FanoutSink {
    /// Creates a sink forwarding to every member of `sinks`.
    pub fn new(sinks: Vec<std::sync::Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &EngineEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
