//! Validator collaborator.
//!
//! Conformance validation is external to the engine. A [`ResourceValidator`]
//! is invoked on the canonical form after ingestion transforms it, and its
//! diagnostics are handled according to the [`ValidationMode`]:
//!
//! - `Lenient` attaches every diagnostic as a warning note.
//! - `Strict` fails the write with [`ValidationFailure`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationFailure;
use crate::types::{OperationKind, Resource, TransformNote};
use crate::version::FhirVersion;

/// How validator diagnostics are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Diagnostics become warning notes.
    #[default]
    Lenient,
    /// A failing validation is a hard error.
    Strict,
}

impl fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationMode::Lenient => write!(f, "lenient"),
            ValidationMode::Strict => write!(f, "strict"),
        }
    }
}

impl FromStr for ValidationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lenient" => Ok(ValidationMode::Lenient),
            "strict" => Ok(ValidationMode::Strict),
            other => Err(format!("unknown validation mode: {}", other)),
        }
    }
}

/// Result of validating one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// Whether the resource conforms.
    pub ok: bool,
    /// Human-readable findings. May be non-empty even when `ok`.
    pub diagnostics: Vec<String>,
}

impl ValidationReport {
    /// A passing report with no findings.
    pub fn passed() -> Self {
        Self {
            ok: true,
            diagnostics: Vec::new(),
        }
    }

    /// A failing report.
    pub fn failed(diagnostics: Vec<String>) -> Self {
        Self {
            ok: false,
            diagnostics,
        }
    }
}

/// Pluggable conformance check.
pub trait ResourceValidator: Send + Sync + fmt::Debug {
    /// Validates `resource` as a `version` document.
    fn validate(&self, resource: &Resource, version: FhirVersion) -> ValidationReport;
}

/// Checks that required top-level elements are present.
///
/// A minimal validator for deployments without a conformance service.
#[derive(Debug, Clone, Default)]
pub struct RequiredElementsValidator {
    required: BTreeMap<(String, FhirVersion), Vec<String>>,
}

impl RequiredElementsValidator {
    /// Creates a validator with no requirements.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires `elements` on `resource_type` at `version`.
    pub fn require<I, S>(mut self, resource_type: &str, version: FhirVersion, elements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required
            .entry((resource_type.to_string(), version))
            .or_default()
            .extend(elements.into_iter().map(Into::into));
        self
    }
}

impl ResourceValidator for RequiredElementsValidator {
    fn validate(&self, resource: &Resource, version: FhirVersion) -> ValidationReport {
        let Some(required) = self
            .required
            .get(&(resource.resource_type().to_string(), version))
        else {
            return ValidationReport::passed();
        };

        let missing: Vec<String> = required
            .iter()
            .filter(|name| resource.payload().get(name.as_str()).is_none_or(|v| v.is_null()))
            .map(|name| format!("{} is required", name))
            .collect();

        if missing.is_empty() {
            ValidationReport::passed()
        } else {
            ValidationReport::failed(missing)
        }
    }
}

/// Runs `validator` and applies `mode` to the outcome.
pub(crate) fn check(
    validator: &dyn ResourceValidator,
    mode: ValidationMode,
    resource: &Resource,
    version: FhirVersion,
    notes: &mut Vec<TransformNote>,
) -> Result<(), ValidationFailure> {
    let report = validator.validate(resource, version);
    if !report.ok && mode == ValidationMode::Strict {
        return Err(ValidationFailure {
            resource_type: resource.resource_type().to_string(),
            version,
            diagnostics: report.diagnostics,
        });
    }
    if !report.ok {
        notes.extend(report.diagnostics.into_iter().map(|d| {
            TransformNote::warning(
                OperationKind::Validation,
                resource.resource_type(),
                resource.original_version(),
                version,
            )
            .with_message(d)
        }));
    }
    Ok(())
}
