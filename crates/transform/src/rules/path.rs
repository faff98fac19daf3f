//! Field paths addressed by transformation operations.
//!
//! A path is a dotted list of element names. A segment suffixed with `[]`
//! addresses every element of the array stored under that name, so
//! `contact[].relationship` names the `relationship` element of each contact.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// One element name in a [`FieldPath`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Segment {
    /// Element name.
    pub name: String,
    /// Whether the element is an array whose items are each addressed.
    pub each: bool,
}

/// A parsed field path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath {
    raw: String,
    segments: Vec<Segment>,
}

impl FieldPath {
    /// Parses a dotted path such as `contact[].relationship`.
    pub fn parse(raw: &str) -> Result<Self, RegistryError> {
        let invalid = |message: &str| RegistryError::InvalidPath {
            path: raw.to_string(),
            message: message.to_string(),
        };

        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid("path is empty"));
        }

        let mut segments = Vec::new();
        for part in trimmed.split('.') {
            let (name, each) = match part.strip_suffix("[]") {
                Some(name) => (name, true),
                None => (part, false),
            };
            if name.is_empty() {
                return Err(invalid("empty segment"));
            }
            if name.contains(['[', ']']) || name.chars().any(char::is_whitespace) {
                return Err(invalid("segment names may only end in '[]'"));
            }
            segments.push(Segment {
                name: name.to_string(),
                each,
            });
        }

        Ok(Self {
            raw: trimmed.to_string(),
            segments,
        })
    }

    /// Returns all segments.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Returns the segments leading to the leaf.
    pub fn parent(&self) -> &[Segment] {
        &self.segments[..self.segments.len() - 1]
    }

    /// Returns the final segment.
    pub fn leaf(&self) -> &Segment {
        &self.segments[self.segments.len() - 1]
    }

    /// Number of leading segments up to and including the last iterated
    /// parent segment. Operations that move values keep them inside the
    /// same iterated element, so both sides must share this prefix.
    pub fn iteration_prefix_len(&self) -> usize {
        self.parent()
            .iter()
            .rposition(|s| s.each)
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    /// Returns the element names without iteration markers.
    pub fn names(&self) -> Vec<&str> {
        self.segments.iter().map(|s| s.name.as_str()).collect()
    }

    /// Returns the path as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for FieldPath {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        FieldPath::parse(&value)
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.raw
    }
}
