//! Ingestion and retrieval boundaries.
//!
//! [`TransformService`] wires the detector, engine, cache, validator, and
//! store into the two request paths:
//!
//! - **ingest**: detect → canonicalize → validate → store → invalidate cache
//! - **retrieve**: store → transform (memoized) → advisory
//!
//! The cache is invalidated after the store acknowledges a write and before
//! the write returns, and cache keys carry the stored revision and payload
//! hash they were computed from, so a read that starts after a write returns
//! can never observe a value computed from the previous payload. Migration jobs built with [`TransformService::migrations`] share
//! the service cache and invalidate it the same way.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheConfig, CacheKey, CacheStats, TransformCache};
use crate::config::EngineConfig;
use crate::detect::{Detection, VersionDetector};
use crate::engine::{TransformEngine, TransformOutput};
use crate::error::{ConfigError, EngineError, EngineResult, StoreError};
use crate::events::{EngineEvent, EventSink, NoopSink};
use crate::migration::{MigrationEngine, MigrationOptions};
use crate::registry::Registry;
use crate::store::{CanonicalStore, HistoryEntry};
use crate::types::{Resource, ResourceKey, TransformNote, warnings};
use crate::validation::{self, ResourceValidator, ValidationMode};
use crate::version::FhirVersion;

/// Result of a successful ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    /// Key the resource was stored under.
    pub key: ResourceKey,
    /// Version id assigned by the store.
    pub version_id: String,
    /// Version the resource is persisted in.
    pub canonical_version: FhirVersion,
    /// Version the resource was first ingested in.
    pub original_version: FhirVersion,
    /// How the inbound version was determined.
    pub detected: Detection,
    /// Notes from canonicalization and validation.
    pub notes: Vec<TransformNote>,
}

/// Lossy fields surfaced alongside a retrieved payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LossyAdvisory {
    /// The version the caller asked for.
    pub requested_version: FhirVersion,
    /// Every warning note produced on the way.
    pub fields: Vec<TransformNote>,
}

/// A resource served at a requested version.
#[derive(Debug, Clone, PartialEq)]
pub struct Retrieved {
    /// The resource at the requested version.
    pub resource: Resource,
    /// All notes from the transformation.
    pub notes: Vec<TransformNote>,
    /// Present when any note is a warning.
    pub advisory: Option<LossyAdvisory>,
}

/// Facade over the transformation pipeline and the canonical store.
#[derive(Debug, Clone)]
pub struct TransformService {
    detector: VersionDetector,
    engine: TransformEngine,
    store: Arc<dyn CanonicalStore>,
    cache: Arc<TransformCache<TransformOutput, EngineError>>,
    validator: Option<Arc<dyn ResourceValidator>>,
    validation_mode: ValidationMode,
    sink: Arc<dyn EventSink>,
}

impl TransformService {
    /// Creates a service with no validator and no event sink.
    pub fn new(
        detector: VersionDetector,
        engine: TransformEngine,
        store: Arc<dyn CanonicalStore>,
        cache: CacheConfig,
    ) -> Self {
        Self {
            detector,
            engine,
            store,
            cache: Arc::new(TransformCache::new(cache)),
            validator: None,
            validation_mode: ValidationMode::default(),
            sink: Arc::new(NoopSink),
        }
    }

    /// Creates a service from configuration, installing a
    /// [`RequiredElementsValidator`](validation::RequiredElementsValidator)
    /// for the configured elements under the configured validation mode.
    ///
    /// # Errors
    ///
    /// * `ConfigError` - the cache TTL or a required element is malformed
    /// * `RegistryError::UnsupportedDefaultVersion` - the default detection
    ///   version is unknown to the registry
    pub fn from_config(
        registry: Arc<Registry>,
        store: Arc<dyn CanonicalStore>,
        config: &EngineConfig,
    ) -> EngineResult<Self> {
        let cache = config.cache_config().map_err(|e| ConfigError::Invalid {
            setting: "cache TTL",
            value: config.cache_ttl.clone(),
            message: e.to_string(),
        })?;
        let validator = config.required_elements_validator(&registry)?;
        let detector = VersionDetector::new(registry.clone(), config.detector_config())?;
        let engine = TransformEngine::new(registry).with_options(config.transform_options());

        Ok(Self::new(detector, engine, store, cache)
            .with_validator(Arc::new(validator), config.validation_mode))
    }

    /// Installs a validator.
    pub fn with_validator(mut self, validator: Arc<dyn ResourceValidator>, mode: ValidationMode) -> Self {
        self.validator = Some(validator);
        self.validation_mode = mode;
        self
    }

    /// Routes engine, cache, and request events to `sink`.
    ///
    /// Call before the service is cloned; the cache is rebuilt empty.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        let config = self.cache_config();
        self.engine = self.engine.with_sink(sink.clone());
        self.cache = Arc::new(TransformCache::new(config).with_sink(sink.clone()));
        self.sink = sink;
        self
    }

    fn cache_config(&self) -> CacheConfig {
        self.cache.config()
    }

    /// Returns the engine.
    pub fn engine(&self) -> &TransformEngine {
        &self.engine
    }

    /// Returns the store.
    pub fn store(&self) -> &Arc<dyn CanonicalStore> {
        &self.store
    }

    /// Returns the cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Creates a migration engine over this service's store that keeps the
    /// service cache coherent with the resources it rewrites.
    pub fn migrations(&self, options: MigrationOptions) -> MigrationEngine {
        MigrationEngine::build(
            self.engine.clone(),
            self.store.clone(),
            options,
            self.sink.clone(),
            Some(self.cache.clone()),
        )
    }

    /// Detects, canonicalizes, validates, and stores a raw payload.
    ///
    /// A payload without an `id` is assigned a new UUID.
    ///
    /// # Errors
    ///
    /// * `DetectionError::Ambiguous` - the version could not be determined
    /// * `RegistryError` - the version has no route to the canonical version
    /// * `TransformationError` - canonicalization failed
    /// * `ValidationFailure` - strict validation failed
    /// * `StoreError` - the write failed
    pub async fn ingest(&self, raw: Value, hint: Option<FhirVersion>) -> EngineResult<IngestOutcome> {
        let detected = self.detector.detect(&raw, hint)?;
        let mut payload = raw;
        let resource_type = payload
            .get("resourceType")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let id = match payload.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let id = Uuid::new_v4().to_string();
                if let Some(object) = payload.as_object_mut() {
                    object.insert("id".to_string(), Value::String(id.clone()));
                }
                id
            }
        };

        let canonical = self.engine.registry().canonical_version();
        let inbound = Resource::new(&resource_type, &id, detected.version, canonical, payload);
        let TransformOutput {
            resource,
            mut notes,
        } = self.engine.canonicalize(&inbound)?;

        if let Some(validator) = &self.validator {
            validation::check(
                validator.as_ref(),
                self.validation_mode,
                &resource,
                canonical,
                &mut notes,
            )?;
        }

        let stored = self.store.put(resource).await?;
        let key = stored.key();
        self.cache.invalidate(&key);

        info!(
            resource = %key,
            version_id = stored.version_id(),
            detected = %detected.version,
            source = ?detected.source,
            confidence = detected.confidence,
            "Ingested resource"
        );

        Ok(IngestOutcome {
            key,
            version_id: stored.version_id().to_string(),
            canonical_version: stored.canonical_version(),
            original_version: stored.original_version(),
            detected,
            notes,
        })
    }

    /// Reads a resource and serves it at `version`.
    ///
    /// # Errors
    ///
    /// * `StoreError::NotFound` / `Gone` - no live resource for the key
    /// * `RegistryError` - the version is unsupported or unreachable
    /// * `TransformationError` - the transformation failed
    /// * `ValidationFailure` - strict validation failed
    pub async fn retrieve(&self, key: &ResourceKey, version: FhirVersion) -> EngineResult<Retrieved> {
        self.sink.emit(&EngineEvent::VersionRequested {
            resource_type: key.resource_type.clone(),
            version,
        });

        let stored = self
            .store
            .get(key)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                resource_type: key.resource_type.clone(),
                id: key.id.clone(),
            })?;

        let output = match CacheKey::new(&stored, version) {
            Ok(cache_key) => {
                self.cache
                    .get_or_compute(cache_key, || async { self.render(&stored, version) })
                    .await?
            }
            Err(e) => {
                warn!(resource = %key, error = %e, "Serving without cache");
                self.render(&stored, version)?
            }
        };

        let lossy = warnings(&output.notes);
        let advisory = (!lossy.is_empty()).then(|| LossyAdvisory {
            requested_version: version,
            fields: lossy,
        });
        debug!(resource = %key, version = %version, lossy = advisory.is_some(), "Retrieved resource");

        Ok(Retrieved {
            resource: output.resource,
            notes: output.notes,
            advisory,
        })
    }

    fn render(&self, stored: &Resource, version: FhirVersion) -> EngineResult<TransformOutput> {
        let mut output = self.engine.transform(stored, version)?;
        if let Some(validator) = &self.validator {
            validation::check(
                validator.as_ref(),
                self.validation_mode,
                &output.resource,
                version,
                &mut output.notes,
            )?;
        }
        Ok(output)
    }

    /// Deletes a resource and drops its cached transformations.
    pub async fn delete(&self, key: &ResourceKey) -> EngineResult<()> {
        self.store.delete(key).await?;
        self.cache.invalidate(key);
        info!(resource = %key, "Deleted resource");
        Ok(())
    }

    /// Returns every stored version of a resource, oldest first.
    pub async fn history(&self, key: &ResourceKey) -> EngineResult<Vec<HistoryEntry>> {
        Ok(self.store.history(key).await?)
    }
}
