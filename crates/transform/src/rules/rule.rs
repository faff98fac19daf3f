//! Transformation rules: one directed edge of a resource type's version graph.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::operation::{CoerceTarget, Operation};
use super::path::FieldPath;
use crate::error::RegistryError;
use crate::version::FhirVersion;

/// An ordered list of operations converting one resource type between two
/// versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformationRule {
    /// The FHIR resource type the rule applies to.
    pub resource_type: String,
    /// Version of the input document.
    pub from_version: FhirVersion,
    /// Version of the output document.
    pub to_version: FhirVersion,
    /// Operations, applied in order.
    pub operations: Vec<Operation>,
}

impl TransformationRule {
    /// Creates a rule with no operations.
    pub fn new(resource_type: impl Into<String>, from: FhirVersion, to: FhirVersion) -> Self {
        Self {
            resource_type: resource_type.into(),
            from_version: from,
            to_version: to,
            operations: Vec::new(),
        }
    }

    /// Starts a builder that parses paths as operations are added.
    pub fn builder(
        resource_type: impl Into<String>,
        from: FhirVersion,
        to: FhirVersion,
    ) -> TransformationRuleBuilder {
        TransformationRuleBuilder {
            rule: Self::new(resource_type, from, to),
            error: None,
        }
    }

    /// Appends an operation.
    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    /// Returns the paths this rule drops with `lossy = true`.
    pub fn lossy_paths(&self) -> impl Iterator<Item = &FieldPath> {
        self.operations.iter().filter_map(|op| match op {
            Operation::Drop {
                path, lossy: true, ..
            } => Some(path),
            _ => None,
        })
    }

    /// Checks the structural invariants of the rule.
    pub fn validate(&self) -> Result<(), RegistryError> {
        let invalid = |message: String| RegistryError::InvalidRule {
            resource_type: self.resource_type.clone(),
            from: self.from_version,
            to: self.to_version,
            message,
        };

        if self.resource_type.trim().is_empty() {
            return Err(invalid("resource type is empty".to_string()));
        }
        if self.from_version == self.to_version {
            return Err(invalid("an edge must connect two different versions".to_string()));
        }

        for (index, op) in self.operations.iter().enumerate() {
            match op {
                Operation::Drop {
                    path,
                    lossy: true,
                    reason,
                } if reason.trim().is_empty() => {
                    return Err(invalid(format!(
                        "operation {}: lossy drop of '{}' must carry a reason",
                        index, path
                    )));
                }
                Operation::Rename { path, new_path } => {
                    let prefix = path.iteration_prefix_len();
                    if prefix != new_path.iteration_prefix_len()
                        || path.segments()[..prefix] != new_path.segments()[..prefix]
                    {
                        return Err(invalid(format!(
                            "operation {}: rename '{}' -> '{}' must stay within the same iterated elements",
                            index, path, new_path
                        )));
                    }
                    let mut rest = path.segments()[prefix..path.segments().len() - 1]
                        .iter()
                        .chain(new_path.segments()[prefix..new_path.segments().len() - 1].iter());
                    if rest.any(|s| s.each) {
                        return Err(invalid(format!(
                            "operation {}: rename '{}' -> '{}' iterates outside the shared prefix",
                            index, path, new_path
                        )));
                    }
                    if path == new_path {
                        return Err(invalid(format!(
                            "operation {}: rename of '{}' onto itself",
                            index, path
                        )));
                    }
                }
                Operation::Wrap { wrapper_key, .. } | Operation::Unwrap { wrapper_key, .. }
                    if wrapper_key.trim().is_empty() =>
                {
                    return Err(invalid(format!("operation {}: wrapper key is empty", index)));
                }
                Operation::DefaultInject { path, .. } if path.leaf().each => {
                    return Err(invalid(format!(
                        "operation {}: cannot inject into every element of '{}'",
                        index, path
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

/// Builder returned by [`TransformationRule::builder`].
///
/// Path parse errors are deferred to [`build`](Self::build) so rules read as
/// a single chain.
#[derive(Debug)]
pub struct TransformationRuleBuilder {
    rule: TransformationRule,
    error: Option<RegistryError>,
}

impl TransformationRuleBuilder {
    fn push(mut self, make: impl FnOnce() -> Result<Operation, RegistryError>) -> Self {
        if self.error.is_none() {
            match make() {
                Ok(op) => self.rule.operations.push(op),
                Err(e) => self.error = Some(e),
            }
        }
        self
    }

    /// Adds a [`Operation::Rename`].
    pub fn rename(self, path: &str, new_path: &str) -> Self {
        self.push(|| {
            Ok(Operation::Rename {
                path: FieldPath::parse(path)?,
                new_path: FieldPath::parse(new_path)?,
            })
        })
    }

    /// Adds a [`Operation::Wrap`].
    pub fn wrap(self, path: &str, wrapper_key: &str) -> Self {
        self.push(|| {
            Ok(Operation::Wrap {
                path: FieldPath::parse(path)?,
                wrapper_key: wrapper_key.to_string(),
            })
        })
    }

    /// Adds a [`Operation::Unwrap`].
    pub fn unwrap_field(self, path: &str, wrapper_key: &str) -> Self {
        self.push(|| {
            Ok(Operation::Unwrap {
                path: FieldPath::parse(path)?,
                wrapper_key: wrapper_key.to_string(),
            })
        })
    }

    /// Adds a [`Operation::Coerce`].
    pub fn coerce(self, path: &str, target: CoerceTarget) -> Self {
        self.push(|| {
            Ok(Operation::Coerce {
                path: FieldPath::parse(path)?,
                target,
            })
        })
    }

    /// Adds a [`Operation::DefaultInject`].
    pub fn default_inject(self, path: &str, value: Value) -> Self {
        self.push(|| {
            Ok(Operation::DefaultInject {
                path: FieldPath::parse(path)?,
                value,
            })
        })
    }

    /// Adds a lossy [`Operation::Drop`].
    pub fn drop_lossy(self, path: &str, reason: &str) -> Self {
        self.push(|| {
            Ok(Operation::Drop {
                path: FieldPath::parse(path)?,
                lossy: true,
                reason: reason.to_string(),
            })
        })
    }

    /// Adds a lossless [`Operation::Drop`] (e.g., a derived field).
    pub fn drop_field(self, path: &str) -> Self {
        self.push(|| {
            Ok(Operation::Drop {
                path: FieldPath::parse(path)?,
                lossy: false,
                reason: String::new(),
            })
        })
    }

    /// Finishes the rule, validating it.
    pub fn build(self) -> Result<TransformationRule, RegistryError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        self.rule.validate()?;
        Ok(self.rule)
    }
}
