//! FHIR schema version identifiers.
//!
//! Versions are an explicit, ordered enum rather than strings so that
//! comparisons follow release order ("R4B" sorts after "R4" and before
//! "R5") regardless of how the labels compare lexically.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A FHIR release that resources may be expressed in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum FhirVersion {
    /// FHIR STU3 (3.0.x).
    #[serde(rename = "STU3")]
    Stu3,
    /// FHIR R4 (4.0.x).
    #[default]
    R4,
    /// FHIR R4B (4.3.x).
    R4B,
    /// FHIR R5 (5.0.x).
    R5,
    /// FHIR R6 (6.0.x, ballot).
    R6,
}

impl FhirVersion {
    /// Returns every known version in release order.
    pub fn all() -> &'static [FhirVersion] {
        &[
            FhirVersion::Stu3,
            FhirVersion::R4,
            FhirVersion::R4B,
            FhirVersion::R5,
            FhirVersion::R6,
        ]
    }

    /// Returns the release label (e.g., "R4").
    pub fn as_str(&self) -> &'static str {
        match self {
            FhirVersion::Stu3 => "STU3",
            FhirVersion::R4 => "R4",
            FhirVersion::R4B => "R4B",
            FhirVersion::R5 => "R5",
            FhirVersion::R6 => "R6",
        }
    }

    /// Returns the value used for the `fhirVersion` MIME type parameter.
    pub fn as_mime_param(&self) -> &'static str {
        match self {
            FhirVersion::Stu3 => "3.0",
            FhirVersion::R4 => "4.0",
            FhirVersion::R4B => "4.3",
            FhirVersion::R5 => "5.0",
            FhirVersion::R6 => "6.0",
        }
    }

    /// Parses a `fhirVersion` MIME type parameter (e.g., "4.0").
    pub fn from_mime_param(param: &str) -> Option<Self> {
        match param.trim() {
            "3.0" => Some(FhirVersion::Stu3),
            "4.0" => Some(FhirVersion::R4),
            "4.3" => Some(FhirVersion::R4B),
            "5.0" => Some(FhirVersion::R5),
            "6.0" => Some(FhirVersion::R6),
            _ => None,
        }
    }

    /// Parses a full release string such as "4.0.1" or "6.0.0-ballot2".
    ///
    /// Only the major and minor components are significant.
    pub fn from_fhir_version(release: &str) -> Option<Self> {
        let mut parts = release.trim().split(['.', '-']);
        let major = parts.next()?;
        let minor = parts.next().unwrap_or("0");
        Self::from_mime_param(&format!("{}.{}", major, minor))
    }
}

impl fmt::Display for FhirVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FhirVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let by_label = match trimmed.to_ascii_uppercase().as_str() {
            "STU3" | "R3" => Some(FhirVersion::Stu3),
            "R4" => Some(FhirVersion::R4),
            "R4B" => Some(FhirVersion::R4B),
            "R5" => Some(FhirVersion::R5),
            "R6" => Some(FhirVersion::R6),
            _ => None,
        };

        by_label
            .or_else(|| Self::from_mime_param(trimmed))
            .or_else(|| Self::from_fhir_version(trimmed))
            .ok_or_else(|| format!("unknown FHIR version: {}", s))
    }
}
