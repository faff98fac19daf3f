//! Canonical Store adapter.
//!
//! [`CanonicalStore`] is the engine's only persistence dependency. It
//! receives and returns resources at their canonical version, together with
//! per-resource version metadata; the storage technology behind it is opaque.
//!
//! [`InMemoryStore`] is the reference implementation used by tests and by the
//! bulk-upgrade tool.

mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::InMemoryStore;

use crate::error::StoreError;
use crate::types::{Resource, ResourceKey};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Selects a subset of stored resources.
///
/// Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceFilter {
    /// Resource types to include.
    #[serde(default)]
    pub resource_types: Vec<String>,
    /// Resource ids to include.
    #[serde(default)]
    pub ids: Vec<String>,
}

impl ResourceFilter {
    /// Matches every resource.
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches the given resource types.
    pub fn for_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            resource_types: types.into_iter().map(Into::into).collect(),
            ids: Vec::new(),
        }
    }

    /// Restricts the filter to the given ids.
    pub fn with_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Returns `true` if the key passes the filter.
    pub fn matches(&self, key: &ResourceKey) -> bool {
        (self.resource_types.is_empty() || self.resource_types.contains(&key.resource_type))
            && (self.ids.is_empty() || self.ids.contains(&key.id))
    }
}

/// One recorded version of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// The resource as written (the last live state for a deletion).
    pub resource: Resource,
    /// Whether this version is a deletion.
    pub deleted: bool,
}

/// Persistence interface for canonical resources.
///
/// Writes to the same key are last-writer-wins; writes to different keys
/// are independent.
#[async_trait]
pub trait CanonicalStore: Send + Sync + std::fmt::Debug {
    /// Returns a human-readable name for this backend.
    fn backend_name(&self) -> &'static str;

    /// Writes a canonical resource, assigning the next version id.
    ///
    /// The first recorded `original_version` for the key is preserved.
    ///
    /// # Errors
    ///
    /// * `StoreError::WriteRejected` - if the resource is not at its canonical version
    /// * `StoreError::Unavailable` - if the backend cannot serve requests
    async fn put(&self, resource: Resource) -> StoreResult<Resource>;

    /// Reads the current version of a resource.
    ///
    /// Returns `None` if the key was never written.
    ///
    /// # Errors
    ///
    /// * `StoreError::Gone` - if the resource has been deleted
    async fn get(&self, key: &ResourceKey) -> StoreResult<Option<Resource>>;

    /// Soft-deletes a resource, recording the deletion in its history.
    ///
    /// # Errors
    ///
    /// * `StoreError::NotFound` - if the key was never written
    /// * `StoreError::Gone` - if it is already deleted
    async fn delete(&self, key: &ResourceKey) -> StoreResult<()>;

    /// Returns every recorded version, oldest first.
    async fn history(&self, key: &ResourceKey) -> StoreResult<Vec<HistoryEntry>>;

    /// Returns up to `limit` live resources matching `filter`, in key order,
    /// strictly after `after`.
    async fn list(
        &self,
        filter: &ResourceFilter,
        after: Option<&ResourceKey>,
        limit: usize,
    ) -> StoreResult<Vec<Resource>>;

    /// Counts live resources matching `filter`.
    async fn count(&self, filter: &ResourceFilter) -> StoreResult<u64>;
}
