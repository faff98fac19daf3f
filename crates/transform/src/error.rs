//! Error types for the transformation engine.
//!
//! This module defines all error types used throughout the engine, following a
//! hierarchy that separates detection, registry, transformation, cache, store,
//! migration, and validation errors. Every error is `Clone` so a single
//! coalesced computation can hand the same failure to every waiting caller.

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use thiserror::Error;

use crate::rules::CoerceTarget;
use crate::version::FhirVersion;

/// The primary error type for all engine operations.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// Version detection errors
    #[error(transparent)]
    Detection(#[from] DetectionError),

    /// Registry construction and lookup errors
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Field transformation errors
    #[error(transparent)]
    Transformation(#[from] TransformationError),

    /// Cache consistency errors
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Canonical store errors
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Migration job errors
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// Strict-mode validation failures
    #[error(transparent)]
    Validation(#[from] ValidationFailure),

    /// Configuration that cannot be turned into components
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// Returns true if this error means a version is absent from the registry
    /// or unreachable through it.
    pub fn is_unsupported_version(&self) -> bool {
        matches!(
            self,
            EngineError::Registry(
                RegistryError::UnsupportedVersion { .. } | RegistryError::NoPath { .. }
            )
        )
    }

    /// Returns true if the error indicates the whole job, not a single
    /// resource, cannot proceed.
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            EngineError::Store(StoreError::Unavailable { .. })
                | EngineError::Registry(RegistryError::Disconnected { .. })
                | EngineError::Registry(RegistryError::MissingCanonical { .. })
        )
    }
}

/// Errors from building components out of an engine configuration.
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("invalid {setting} '{value}': {message}")]
    Invalid {
        setting: &'static str,
        value: String,
        message: String,
    },
}

/// Errors raised while determining the schema version of a raw payload.
#[derive(Error, Debug, Clone)]
pub enum DetectionError {
    /// No signal reached the confidence threshold and no hint was supplied.
    #[error(
        "ambiguous version for {resource_type}: best confidence {best_confidence:.2}, candidates {candidates:?}"
    )]
    Ambiguous {
        resource_type: String,
        candidates: Vec<FhirVersion>,
        best_confidence: f64,
    },

    /// The payload has no `resourceType` element.
    #[error("payload has no resourceType")]
    MissingResourceType,

    /// The payload is not a JSON object.
    #[error("payload must be a JSON object")]
    NotAnObject,
}

/// Errors related to the transformation registry.
#[derive(Error, Debug, Clone)]
pub enum RegistryError {
    /// The version is not a node of the resource type's graph.
    #[error("version {version} is not supported for {resource_type}")]
    UnsupportedVersion {
        resource_type: String,
        version: FhirVersion,
    },

    /// Both versions are known but no edge path connects them.
    #[error("no transformation path for {resource_type} from {from} to {to}")]
    NoPath {
        resource_type: String,
        from: FhirVersion,
        to: FhirVersion,
    },

    /// The registry has already been built.
    #[error("registry is frozen; rules cannot be registered after build")]
    Frozen,

    /// A rule failed structural validation.
    #[error("invalid rule {resource_type} {from}->{to}: {message}")]
    InvalidRule {
        resource_type: String,
        from: FhirVersion,
        to: FhirVersion,
        message: String,
    },

    /// Two rules were registered for the same edge.
    #[error("duplicate rule for {resource_type} {from}->{to}")]
    DuplicateRule {
        resource_type: String,
        from: FhirVersion,
        to: FhirVersion,
    },

    /// A resource type has rules but no canonical node.
    #[error("resource type {resource_type} has no node for the canonical version {canonical}")]
    MissingCanonical {
        resource_type: String,
        canonical: FhirVersion,
    },

    /// A version cannot reach, or be reached from, the canonical version.
    #[error("{resource_type} {version} is not connected {direction} the canonical version")]
    Disconnected {
        resource_type: String,
        version: FhirVersion,
        direction: &'static str,
    },

    /// A field path could not be parsed.
    #[error("invalid field path '{path}': {message}")]
    InvalidPath { path: String, message: String },

    /// The detector's fallback version is not a node for any resource type.
    #[error("default detection version {version} is not supported by any registered resource type")]
    UnsupportedDefaultVersion { version: FhirVersion },
}

/// Errors raised while applying transformation operations.
#[derive(Error, Debug, Clone)]
pub enum TransformationError {
    /// A field survived the edge without any mapping the target accepts.
    #[error("{resource_type} {from}->{to}: field '{path}' has no mapping in the target version")]
    UnmappedField {
        resource_type: String,
        from: FhirVersion,
        to: FhirVersion,
        path: String,
    },

    /// A coercion was applied to a value outside its declared domain.
    #[error("cannot coerce '{path}' to {target}: {message}")]
    CoercionOutOfDomain {
        path: String,
        target: CoerceTarget,
        message: String,
    },

    /// The destination of a move or injection is already occupied.
    #[error("path conflict at '{path}': {message}")]
    PathConflict { path: String, message: String },

    /// The document shape does not match what the operation expects.
    #[error("shape mismatch at '{path}': expected {expected}, found {found}")]
    ShapeMismatch {
        path: String,
        expected: String,
        found: String,
    },

    /// A lossy drop was applied while the lossy policy rejects them.
    #[error("lossy drop of '{path}' rejected: {reason}")]
    LossyRejected { path: String, reason: String },
}

/// Cache consistency errors. Never surfaced to callers; logged and bypassed.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// A cached entry disagrees with the resource's current write generation.
    #[error("cache inconsistency for {key}: {message}")]
    Inconsistency { key: String, message: String },

    /// A payload could not be canonicalized for hashing.
    #[error("failed to hash payload: {message}")]
    Hashing { message: String },
}

/// Errors from the canonical store adapter.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// The requested resource was not found.
    #[error("resource not found: {resource_type}/{id}")]
    NotFound { resource_type: String, id: String },

    /// The resource has been deleted.
    #[error("resource deleted: {resource_type}/{id}")]
    Gone { resource_type: String, id: String },

    /// The store cannot serve requests.
    #[error("store unavailable: {message}")]
    Unavailable { message: String },

    /// The store rejected the write.
    #[error("write rejected for {resource_type}/{id}: {message}")]
    WriteRejected {
        resource_type: String,
        id: String,
        message: String,
    },
}

/// Errors related to migration jobs.
#[derive(Error, Debug, Clone)]
pub enum MigrationError {
    /// The job was not found.
    #[error("migration job not found: {job_id}")]
    JobNotFound { job_id: String },

    /// The job is in an invalid state for the requested operation.
    #[error("invalid job state: job {job_id} is {actual}, expected {expected}")]
    InvalidJobState {
        job_id: String,
        expected: String,
        actual: String,
    },

    /// The job request is malformed.
    #[error("invalid migration request: {message}")]
    InvalidRequest { message: String },

    /// A single resource exceeded the per-resource timeout.
    #[error("transformation of {resource_type}/{id} timed out after {timeout_ms}ms")]
    Timeout {
        resource_type: String,
        id: String,
        timeout_ms: u64,
    },
}

/// A validation failure raised in strict mode.
#[derive(Error, Debug, Clone)]
#[error("{resource_type} failed validation at {version}: {}", diagnostics.join("; "))]
pub struct ValidationFailure {
    pub resource_type: String,
    pub version: FhirVersion,
    pub diagnostics: Vec<String>,
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ambiguous_error_display() {
        let err = DetectionError::Ambiguous {
            resource_type: "Patient".to_string(),
            candidates: vec![FhirVersion::R4, FhirVersion::R5],
            best_confidence: 0.5,
        };
        let message = err.to_string();
        assert!(message.contains("ambiguous version for Patient"));
        assert!(message.contains("R4"));
        assert!(message.contains("R5"));
    }

    #[test]
    fn test_unsupported_version_classification() {
        let err: EngineError = RegistryError::NoPath {
            resource_type: "Observation".to_string(),
            from: FhirVersion::R4,
            to: FhirVersion::R6,
        }
        .into();
        assert!(err.is_unsupported_version());
        assert!(!err.is_systemic());
        assert_eq!(
            err.to_string(),
            "no transformation path for Observation from R4 to R6"
        );
    }

    #[test]
    fn test_store_unavailable_is_systemic() {
        let err: EngineError = StoreError::Unavailable {
            message: "connection refused".to_string(),
        }
        .into();
        assert!(err.is_systemic());

        let err: EngineError = StoreError::NotFound {
            resource_type: "Patient".to_string(),
            id: "1".to_string(),
        }
        .into();
        assert!(!err.is_systemic());
    }

    #[test]
    fn test_validation_failure_display() {
        let err = ValidationFailure {
            resource_type: "Patient".to_string(),
            version: FhirVersion::R5,
            diagnostics: vec!["name required".to_string(), "bad gender".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Patient failed validation at R5: name required; bad gender"
        );
    }
}
