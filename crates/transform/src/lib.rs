//! # helios-transform - Multi-Version FHIR Transformation Engine
//!
//! This crate lets the Helios FHIR Server accept resources in any supported
//! FHIR release, persist them under a single canonical release, and serve
//! them back in whichever release a client asks for.
//!
//! ## Components
//!
//! - [`registry`] - immutable, validated graph of versions per resource type,
//!   whose edges are declarative [`rules::TransformationRule`]s
//! - [`detect`] - determines the release of an inbound payload from a
//!   priority chain of signals
//! - [`engine`] - applies registry edges, multi-hop where needed, and
//!   records a [`types::TransformNote`] for every field touched
//! - [`cache`] - single-flight memoization of transformed resources with
//!   eager invalidation on write
//! - [`store`] - the canonical store interface and an in-memory reference
//!   implementation
//! - [`migration`] - checkpointed, resumable bulk migration jobs
//! - [`service`] - the ingestion and retrieval boundaries tying it together
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use helios_transform::{EngineConfig, RegistryDocument, TransformService};
//! use helios_transform::store::InMemoryStore;
//!
//! let config = EngineConfig::from_env();
//! let document: RegistryDocument = serde_json::from_str(&std::fs::read_to_string("rules.json")?)?;
//! let registry = document.build()?;
//! let service = TransformService::from_config(registry, Arc::new(InMemoryStore::new()), &config)?;
//!
//! let outcome = service.ingest(payload, None).await?;
//! let served = service.retrieve(&outcome.key, FhirVersion::R5).await?;
//! if let Some(advisory) = served.advisory {
//!     // lossy fields the client should know about
//! }
//! ```
//!
//! ## Configuration
//!
//! See [`EngineConfig`] for the `HTS_*` environment variables.

#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod detect;
pub mod engine;
pub mod error;
pub mod events;
pub mod migration;
pub mod registry;
pub mod rules;
pub mod service;
pub mod store;
pub mod types;
pub mod validation;
pub mod version;

pub use cache::{CacheConfig, CacheStats, TransformCache};
pub use config::EngineConfig;
pub use detect::{Detection, DetectionSource, DetectorConfig, VersionDetector};
pub use engine::{LossyPolicy, TransformEngine, TransformOptions, TransformOutput};
pub use error::{
    CacheError, ConfigError, DetectionError, EngineError, EngineResult, MigrationError,
    RegistryError, StoreError, TransformationError, ValidationFailure,
};
pub use events::{EngineEvent, EventSink, MetricsSink, NoopSink, TracingSink};
pub use migration::{MigrationEngine, MigrationJob, MigrationRequest, MigrationState};
pub use registry::{Registry, RegistryBuilder, RegistryDocument, SharedRegistry};
pub use service::{IngestOutcome, LossyAdvisory, Retrieved, TransformService};
pub use types::{Resource, ResourceKey, TransformNote};
pub use validation::{ResourceValidator, ValidationMode};
pub use version::FhirVersion;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initializes the tracing subscriber for logging.
///
/// This should be called once at application startup.
///
/// # Arguments
///
/// * `level` - The log level (error, warn, info, debug, trace)
pub fn init_logging(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("helios_transform={}", level)));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}
