//! Per-version element schemas and structural signatures.
//!
//! A [`ResourceSchema`] lists the elements a version of a resource type
//! accepts; the engine uses it to reject fields that an edge left without a
//! mapping. A [`VersionSignature`] lists elements whose presence or absence
//! discriminates one version from another; the detector uses it as its
//! structural heuristic.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RegistryError;
use crate::rules::FieldPath;

/// Elements every FHIR resource may carry regardless of version.
const BASE_ELEMENTS: &[&str] = &[
    "resourceType",
    "id",
    "meta",
    "implicitRules",
    "language",
    "text",
    "contained",
    "extension",
    "modifierExtension",
];

/// Elements any nested element may carry.
const ELEMENT_BASE: &[&str] = &["id", "extension", "modifierExtension"];

/// The elements a resource type accepts at one version.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceSchema {
    elements: Vec<Vec<String>>,
}

impl ResourceSchema {
    /// Creates a schema from dotted element paths (`[]` markers are optional).
    pub fn new<I, S>(elements: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let elements = elements
            .into_iter()
            .map(|e| {
                FieldPath::parse(e.as_ref())
                    .map(|p| p.names().into_iter().map(str::to_string).collect())
            })
            .collect::<Result<Vec<Vec<String>>, _>>()?;
        Ok(Self { elements })
    }

    /// Returns the declared element paths.
    pub fn elements(&self) -> impl Iterator<Item = String> + '_ {
        self.elements.iter().map(|e| e.join("."))
    }

    fn covers(&self, names: &[&str]) -> bool {
        if names.first().is_some_and(|n| BASE_ELEMENTS.contains(n)) {
            return true;
        }
        if names.len() > 1 && names.last().is_some_and(|n| ELEMENT_BASE.contains(n)) {
            return true;
        }
        self.elements
            .iter()
            .any(|e| e.len() <= names.len() && e.iter().zip(names).all(|(a, b)| a == b))
    }

    fn is_ancestor(&self, names: &[&str]) -> bool {
        self.elements
            .iter()
            .any(|e| e.len() > names.len() && e.iter().zip(names).all(|(a, b)| a == b))
    }

    /// Returns the concrete path of the first element the schema does not
    /// accept, walking the payload in key order.
    pub fn first_unmapped(&self, payload: &Value) -> Option<String> {
        let mut names = Vec::new();
        self.walk(payload, &mut names, String::new())
    }

    fn walk<'a>(&self, value: &'a Value, names: &mut Vec<&'a str>, trail: String) -> Option<String> {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    names.push(key.as_str());
                    let child_trail = if trail.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", trail, key)
                    };
                    let found = if self.covers(names) {
                        None
                    } else if self.is_ancestor(names) {
                        self.walk(child, names, child_trail)
                    } else {
                        Some(child_trail)
                    };
                    names.pop();
                    if found.is_some() {
                        return found;
                    }
                }
                None
            }
            Value::Array(items) => items
                .iter()
                .enumerate()
                .find_map(|(i, item)| self.walk(item, names, format!("{}[{}]", trail, i))),
            _ => None,
        }
    }
}

/// Elements whose presence or absence identifies a version.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VersionSignature {
    /// Elements expected to be present.
    #[serde(default)]
    pub present: Vec<FieldPath>,
    /// Elements expected to be absent.
    #[serde(default)]
    pub absent: Vec<FieldPath>,
}

impl VersionSignature {
    /// Creates a signature from dotted element paths.
    pub fn new(present: &[&str], absent: &[&str]) -> Result<Self, RegistryError> {
        let parse = |paths: &[&str]| {
            paths
                .iter()
                .map(|p| FieldPath::parse(p))
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self {
            present: parse(present)?,
            absent: parse(absent)?,
        })
    }

    /// Returns the fraction of conditions the payload satisfies, or `None`
    /// when the signature declares no conditions.
    pub fn score(&self, payload: &Value) -> Option<f64> {
        let total = self.present.len() + self.absent.len();
        if total == 0 {
            return None;
        }
        let matched = self
            .present
            .iter()
            .filter(|p| element_present(payload, &p.names()))
            .count()
            + self
                .absent
                .iter()
                .filter(|p| !element_present(payload, &p.names()))
                .count();
        Some(matched as f64 / total as f64)
    }
}

/// Returns `true` when any traversal of `names` through objects and arrays
/// reaches a non-null value.
pub(crate) fn element_present(value: &Value, names: &[&str]) -> bool {
    match value {
        Value::Array(items) => items.iter().any(|item| element_present(item, names)),
        Value::Object(map) => match names.split_first() {
            Some((first, rest)) => map
                .get(*first)
                .is_some_and(|child| !child.is_null() && element_present(child, rest)),
            None => true,
        },
        Value::Null => false,
        _ => names.is_empty(),
    }
}
