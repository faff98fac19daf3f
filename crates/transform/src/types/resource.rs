//! Versioned resource types.
//!
//! This module defines the [`Resource`] type, which wraps a FHIR payload with
//! the version metadata the engine tracks: the systemwide canonical version,
//! the version the resource was first ingested in, and the version the
//! payload is currently expressed in.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::version::FhirVersion;

/// Stable identity of a resource: its type and logical id.
///
/// Keys order by resource type first and then by id, which is the order the
/// migration engine walks a population in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    /// The FHIR resource type (e.g., "Patient").
    pub resource_type: String,
    /// The resource's logical ID.
    pub id: String,
}

impl ResourceKey {
    /// Creates a new key.
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)
    }
}

/// A FHIR resource with version metadata.
///
/// # Examples
///
/// ```
/// use helios_transform::FhirVersion;
/// use helios_transform::types::Resource;
/// use serde_json::json;
///
/// let resource = Resource::new(
///     "Patient",
///     "123",
///     FhirVersion::R5,
///     FhirVersion::R4,
///     json!({"resourceType": "Patient", "id": "123"}),
/// );
///
/// assert_eq!(resource.original_version(), FhirVersion::R5);
/// assert_eq!(resource.schema_version(), FhirVersion::R5);
/// assert_eq!(resource.canonical_version(), FhirVersion::R4);
/// assert!(!resource.is_canonical());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// The FHIR resource type.
    resource_type: String,

    /// The resource's logical ID.
    id: String,

    /// The systemwide canonical version resources are persisted in.
    canonical_version: FhirVersion,

    /// The version the resource was first ingested in. Never altered.
    original_version: FhirVersion,

    /// The version the payload is currently expressed in.
    schema_version: FhirVersion,

    /// Store version ID ("0" until first written).
    version_id: String,

    /// When the store last wrote this resource.
    last_modified: DateTime<Utc>,

    /// The resource content as JSON.
    payload: Value,
}

impl Resource {
    /// Creates a resource whose payload is expressed in `schema_version`.
    ///
    /// The original version is set to `schema_version`; this is the only
    /// place it is ever assigned.
    pub fn new(
        resource_type: impl Into<String>,
        id: impl Into<String>,
        schema_version: FhirVersion,
        canonical_version: FhirVersion,
        payload: Value,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            canonical_version,
            original_version: schema_version,
            schema_version,
            version_id: "0".to_string(),
            last_modified: Utc::now(),
            payload,
        }
    }

    /// Returns the FHIR resource type.
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Returns the resource's logical ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the resource key.
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.resource_type, &self.id)
    }

    /// Returns the canonical version.
    pub fn canonical_version(&self) -> FhirVersion {
        self.canonical_version
    }

    /// Returns the version the resource was first ingested in.
    pub fn original_version(&self) -> FhirVersion {
        self.original_version
    }

    /// Returns the version the payload is expressed in.
    pub fn schema_version(&self) -> FhirVersion {
        self.schema_version
    }

    /// Returns `true` when the payload is expressed in the canonical version.
    pub fn is_canonical(&self) -> bool {
        self.schema_version == self.canonical_version
    }

    /// Returns the store version ID.
    pub fn version_id(&self) -> &str {
        &self.version_id
    }

    /// Returns when the store last wrote this resource.
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    /// Returns the payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Consumes self and returns the payload.
    pub fn into_payload(self) -> Value {
        self.payload
    }

    /// Returns a copy of this resource carrying a payload expressed in another
    /// version. Identity, original version, and store metadata carry over.
    pub fn with_payload(&self, payload: Value, schema_version: FhirVersion) -> Self {
        Self {
            resource_type: self.resource_type.clone(),
            id: self.id.clone(),
            canonical_version: self.canonical_version,
            original_version: self.original_version,
            schema_version,
            version_id: self.version_id.clone(),
            last_modified: self.last_modified,
            payload,
        }
    }

    /// Replaces the canonical version, used when a migration moves the
    /// systemwide canonical version.
    pub fn with_canonical_version(mut self, canonical_version: FhirVersion) -> Self {
        self.canonical_version = canonical_version;
        self
    }

    /// Stamps store metadata onto the resource. Called by store adapters.
    ///
    /// `original_version` lets the store keep the first-recorded value for an
    /// id that has been written before.
    pub fn stamped(
        mut self,
        version_id: impl Into<String>,
        last_modified: DateTime<Utc>,
        original_version: FhirVersion,
    ) -> Self {
        self.version_id = version_id.into();
        self.last_modified = last_modified;
        self.original_version = original_version;
        self
    }
}
