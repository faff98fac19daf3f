//! Transformation notes.
//!
//! Every transformation returns an ordered list of [`TransformNote`]s
//! describing what happened to individual fields. Warning notes mark lossy
//! fields and are surfaced to callers as advisories.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::version::FhirVersion;

/// Severity of a transformation note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteSeverity {
    /// Informational, no data was lost.
    Info,
    /// Data was lost or could not be validated.
    Warning,
}

impl fmt::Display for NoteSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoteSeverity::Info => write!(f, "info"),
            NoteSeverity::Warning => write!(f, "warning"),
        }
    }
}

/// The kind of step a note describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    /// A field moved to a new path.
    Rename,
    /// A value was wrapped in an object.
    Wrap,
    /// A value was unwrapped from an object.
    Unwrap,
    /// A value changed primitive type.
    Coerce,
    /// A default value was injected.
    DefaultInject,
    /// A field was dropped.
    Drop,
    /// A field the reverse edge drops could not be restored.
    NotRestorable,
    /// A validator reported a diagnostic.
    Validation,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Rename => "rename",
            OperationKind::Wrap => "wrap",
            OperationKind::Unwrap => "unwrap",
            OperationKind::Coerce => "coerce",
            OperationKind::DefaultInject => "defaultInject",
            OperationKind::Drop => "drop",
            OperationKind::NotRestorable => "notRestorable",
            OperationKind::Validation => "validation",
        };
        f.write_str(name)
    }
}

/// A single entry in a transformation's audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformNote {
    /// What kind of step produced the note.
    pub operation: OperationKind,
    /// The field path the step touched.
    pub path: String,
    /// Note severity.
    pub severity: NoteSeverity,
    /// Free-form detail (e.g., the reason for a lossy drop).
    pub message: Option<String>,
    /// Source version of the edge.
    pub from: FhirVersion,
    /// Target version of the edge.
    pub to: FhirVersion,
}

impl TransformNote {
    /// Creates an informational note.
    pub fn info(
        operation: OperationKind,
        path: impl Into<String>,
        from: FhirVersion,
        to: FhirVersion,
    ) -> Self {
        Self {
            operation,
            path: path.into(),
            severity: NoteSeverity::Info,
            message: None,
            from,
            to,
        }
    }

    /// Creates a warning note.
    pub fn warning(
        operation: OperationKind,
        path: impl Into<String>,
        from: FhirVersion,
        to: FhirVersion,
    ) -> Self {
        Self {
            severity: NoteSeverity::Warning,
            ..Self::info(operation, path, from, to)
        }
    }

    /// Attaches a message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Returns `true` for warning notes.
    pub fn is_warning(&self) -> bool {
        self.severity == NoteSeverity::Warning
    }
}

/// Returns the warning notes from a list.
pub fn warnings(notes: &[TransformNote]) -> Vec<TransformNote> {
    notes.iter().filter(|n| n.is_warning()).cloned().collect()
}
