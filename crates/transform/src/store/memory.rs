use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::trace;

use super::{CanonicalStore, HistoryEntry, ResourceFilter, StoreResult};
use crate::error::StoreError;
use crate::types::{Resource, ResourceKey};
use crate::version::FhirVersion;

#[derive(Debug)]
struct Record {
    original_version: FhirVersion,
    versions: Vec<HistoryEntry>,
}

impl Record {
    fn current(&self) -> Option<&HistoryEntry> {
        self.versions.last()
    }

    fn is_deleted(&self) -> bool {
        self.current().is_some_and(|e| e.deleted)
    }
}

/// In-memory [`CanonicalStore`].
///
/// Resources are kept in key order, so listing is stable. An availability
/// switch and per-key write faults let tests exercise failure paths.
#[derive(Debug)]
pub struct InMemoryStore {
    records: RwLock<BTreeMap<ResourceKey, Record>>,
    available: AtomicBool,
    write_faults: RwLock<HashMap<ResourceKey, u32>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Creates an empty, available store.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
            write_faults: RwLock::new(HashMap::new()),
        }
    }

    /// Makes every subsequent call succeed or fail with `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Rejects the next `times` writes to `key`.
    pub fn fail_next_writes(&self, key: ResourceKey, times: u32) {
        self.write_faults.write().insert(key, times);
    }

    /// Returns the number of keys ever written, including deleted ones.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns `true` if nothing was ever written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable {
                message: "in-memory store switched off".to_string(),
            })
        }
    }

    fn take_write_fault(&self, key: &ResourceKey) -> bool {
        let mut faults = self.write_faults.write();
        match faults.get_mut(key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl CanonicalStore for InMemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, resource: Resource) -> StoreResult<Resource> {
        self.check_available()?;
        let key = resource.key();

        if !resource.is_canonical() {
            return Err(StoreError::WriteRejected {
                resource_type: key.resource_type,
                id: key.id,
                message: format!(
                    "resource is at {} but the canonical version is {}",
                    resource.schema_version(),
                    resource.canonical_version()
                ),
            });
        }
        if self.take_write_fault(&key) {
            return Err(StoreError::WriteRejected {
                resource_type: key.resource_type,
                id: key.id,
                message: "injected write fault".to_string(),
            });
        }

        let mut records = self.records.write();
        let record = records.entry(key.clone()).or_insert_with(|| Record {
            original_version: resource.original_version(),
            versions: Vec::new(),
        });
        let version_id = (record.versions.len() + 1).to_string();
        let stored = resource.stamped(version_id, Utc::now(), record.original_version);
        record.versions.push(HistoryEntry {
            resource: stored.clone(),
            deleted: false,
        });

        trace!(resource = %key, version_id = stored.version_id(), "Stored resource");
        Ok(stored)
    }

    async fn get(&self, key: &ResourceKey) -> StoreResult<Option<Resource>> {
        self.check_available()?;
        let records = self.records.read();
        match records.get(key) {
            None => Ok(None),
            Some(record) if record.is_deleted() => Err(StoreError::Gone {
                resource_type: key.resource_type.clone(),
                id: key.id.clone(),
            }),
            Some(record) => Ok(record.current().map(|e| e.resource.clone())),
        }
    }

    async fn delete(&self, key: &ResourceKey) -> StoreResult<()> {
        self.check_available()?;
        let mut records = self.records.write();
        let record = records.get_mut(key).ok_or_else(|| StoreError::NotFound {
            resource_type: key.resource_type.clone(),
            id: key.id.clone(),
        })?;
        if record.is_deleted() {
            return Err(StoreError::Gone {
                resource_type: key.resource_type.clone(),
                id: key.id.clone(),
            });
        }

        let version_id = (record.versions.len() + 1).to_string();
        let original_version = record.original_version;
        if let Some(last) = record.current().map(|e| e.resource.clone()) {
            record.versions.push(HistoryEntry {
                resource: last.stamped(version_id, Utc::now(), original_version),
                deleted: true,
            });
        }
        Ok(())
    }

    async fn history(&self, key: &ResourceKey) -> StoreResult<Vec<HistoryEntry>> {
        self.check_available()?;
        self.records
            .read()
            .get(key)
            .map(|r| r.versions.clone())
            .ok_or_else(|| StoreError::NotFound {
                resource_type: key.resource_type.clone(),
                id: key.id.clone(),
            })
    }

    async fn list(
        &self,
        filter: &ResourceFilter,
        after: Option<&ResourceKey>,
        limit: usize,
    ) -> StoreResult<Vec<Resource>> {
        self.check_available()?;
        let lower = match after {
            Some(key) => Bound::Excluded(key.clone()),
            None => Bound::Unbounded,
        };
        let records = self.records.read();
        Ok(records
            .range((lower, Bound::Unbounded))
            .filter(|(key, record)| filter.matches(key) && !record.is_deleted())
            .filter_map(|(_, record)| record.current().map(|e| e.resource.clone()))
            .take(limit)
            .collect())
    }

    async fn count(&self, filter: &ResourceFilter) -> StoreResult<u64> {
        self.check_available()?;
        Ok(self
            .records
            .read()
            .iter()
            .filter(|(key, record)| filter.matches(key) && !record.is_deleted())
            .count() as u64)
    }
}
