//! Builders for engines, services, and seeded stores.

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use helios_transform::migration::{MigrationEngine, MigrationOptions};
use helios_transform::store::{CanonicalStore, InMemoryStore, ResourceFilter};
use helios_transform::{
    CacheConfig, DetectorConfig, EngineEvent, EventSink, FhirVersion, TransformEngine,
    TransformService, VersionDetector,
};

use super::fixtures::{catalog, numbered, observation_r4, registry, resource};

/// A transformation engine over the catalog.
pub fn engine() -> TransformEngine {
    TransformEngine::new(registry())
}

/// A service over the catalog and a fresh in-memory store.
pub fn service() -> (TransformService, Arc<InMemoryStore>) {
    let registry = registry();
    let store = Arc::new(InMemoryStore::new());
    let service = TransformService::new(
        VersionDetector::new(registry.clone(), DetectorConfig::default()).unwrap(),
        TransformEngine::new(registry),
        store.clone(),
        CacheConfig::default(),
    );
    (service, store)
}

/// A service whose registry uses `canonical` instead of the catalog default.
pub fn service_with_canonical(canonical: FhirVersion) -> (TransformService, Arc<InMemoryStore>) {
    let mut document = catalog();
    document.canonical = canonical;
    let registry = document.build().expect("catalog is connected");
    let store = Arc::new(InMemoryStore::new());
    let service = TransformService::new(
        VersionDetector::new(registry.clone(), DetectorConfig::default()).unwrap(),
        TransformEngine::new(registry),
        store.clone(),
        CacheConfig::default(),
    );
    (service, store)
}

/// Seeds `count` R4 Observations; every `fail_every`th one carries a
/// quantity that cannot be coerced to a decimal.
pub async fn seed_observations(store: &InMemoryStore, count: usize, fail_every: usize) -> BTreeSet<String> {
    let mut bad = BTreeSet::new();
    for n in 0..count {
        let id = numbered("obs", n);
        let value = if fail_every > 0 && n % fail_every == 0 {
            bad.insert(id.clone());
            "n/a".to_string()
        } else {
            format!("{}.5", 60 + n % 40)
        };
        store
            .put(resource(FhirVersion::R4, observation_r4(&id, &value)))
            .await
            .expect("seed write");
    }
    bad
}

/// A migration engine over `store` with the given options.
pub fn migrations(store: Arc<InMemoryStore>, options: MigrationOptions) -> MigrationEngine {
    MigrationEngine::new(engine(), store, options)
}

/// Ids of stored resources currently at `version`.
pub async fn ids_at(store: &InMemoryStore, version: FhirVersion) -> BTreeSet<String> {
    store
        .list(&ResourceFilter::all(), None, usize::MAX)
        .await
        .expect("list")
        .into_iter()
        .filter(|r| r.schema_version() == version)
        .map(|r| r.id().to_string())
        .collect()
}

/// Pauses a job once it has committed `after` batches.
#[derive(Debug)]
pub struct PauseAfter {
    after: u64,
    pub engine: OnceLock<MigrationEngine>,
}

impl PauseAfter {
    pub fn new(after: u64) -> Arc<Self> {
        Arc::new(Self {
            after,
            engine: OnceLock::new(),
        })
    }
}

impl EventSink for PauseAfter {
    fn emit(&self, event: &EngineEvent) {
        if let EngineEvent::MigrationBatchCompleted { job_id, batch, .. } = event {
            if *batch + 1 == self.after {
                if let Some(engine) = self.engine.get() {
                    let _ = engine.pause(*job_id);
                }
            }
        }
    }
}
