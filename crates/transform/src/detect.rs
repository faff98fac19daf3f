//! Version detection for inbound payloads.
//!
//! The detector walks a fixed chain of signals, highest precedence first:
//!
//! | Signal                                   | Confidence              |
//! |------------------------------------------|-------------------------|
//! | Explicit caller hint                     | 1.0                     |
//! | `meta.fhirVersion` / `fhirVersion`       | 0.95                    |
//! | `meta.profile` URL prefix                | 0.85                    |
//! | Structural signature match               | up to 0.75              |
//! | Configured default version               | configured (0.5)        |
//!
//! The first signal at or above the threshold wins. When none does and no
//! hint was given, detection fails with an ambiguity error naming every
//! candidate considered. Detection is a pure function of the payload, the
//! hint, and the registry.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{DetectionError, EngineResult, RegistryError};
use crate::registry::Registry;
use crate::version::FhirVersion;

/// Confidence assigned to an explicit hint.
pub const HINT_CONFIDENCE: f64 = 1.0;
/// Confidence assigned to an embedded version marker.
pub const MARKER_CONFIDENCE: f64 = 0.95;
/// Confidence assigned to a recognised profile URL.
pub const PROFILE_CONFIDENCE: f64 = 0.85;
/// Confidence assigned to a perfect structural signature match.
pub const STRUCTURE_CONFIDENCE: f64 = 0.75;

/// Where a detected version came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DetectionSource {
    /// Supplied by the caller.
    Hint,
    /// Embedded version marker.
    Marker,
    /// Declared conformance profile.
    Profile,
    /// Structural heuristics.
    Structure,
    /// Configured default.
    Default,
}

/// The outcome of a successful detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// The detected version.
    pub version: FhirVersion,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// The signal that produced the version.
    pub source: DetectionSource,
}

/// Detector tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorConfig {
    /// Minimum confidence required to accept a signal.
    pub threshold: f64,
    /// Fallback version; the canonical version when `None`.
    pub default_version: Option<FhirVersion>,
    /// Confidence of the fallback.
    pub default_confidence: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            threshold: 0.6,
            default_version: None,
            default_confidence: 0.5,
        }
    }
}

/// Determines the schema version of raw payloads.
#[derive(Debug, Clone)]
pub struct VersionDetector {
    registry: Arc<Registry>,
    config: DetectorConfig,
}

impl VersionDetector {
    /// Creates a detector over a built registry.
    ///
    /// # Errors
    ///
    /// * `RegistryError::UnsupportedDefaultVersion` - the configured default
    ///   version is not supported for any registered resource type
    pub fn new(registry: Arc<Registry>, config: DetectorConfig) -> Result<Self, RegistryError> {
        if let Some(version) = config.default_version {
            let supported = registry
                .resource_types()
                .any(|resource_type| registry.supports(resource_type, version));
            if !supported {
                return Err(RegistryError::UnsupportedDefaultVersion { version });
            }
        }
        Ok(Self { registry, config })
    }

    /// Returns the detector configuration.
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Detects the version of `raw`.
    ///
    /// # Errors
    ///
    /// * `DetectionError::NotAnObject` / `MissingResourceType` - malformed input
    /// * `RegistryError::UnsupportedVersion` - a hint or marker names a version
    ///   the registry does not support for the resource type
    /// * `DetectionError::Ambiguous` - no signal reached the threshold
    pub fn detect(&self, raw: &Value, hint: Option<FhirVersion>) -> EngineResult<Detection> {
        let object = raw.as_object().ok_or(DetectionError::NotAnObject)?;
        let resource_type = object
            .get("resourceType")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or(DetectionError::MissingResourceType)?;

        if let Some(version) = hint {
            self.require_supported(resource_type, version)?;
            return Ok(Detection {
                version,
                confidence: HINT_CONFIDENCE,
                source: DetectionSource::Hint,
            });
        }

        let mut candidates = BTreeSet::new();
        let mut best_confidence: f64 = 0.0;

        let marker = self.marker_signal(resource_type, raw)?;
        let profile = self.profile_signal(resource_type, raw, &mut candidates);
        let structure = self.structure_signal(resource_type, raw, &mut candidates);
        let default = Some(Detection {
            version: self
                .config
                .default_version
                .unwrap_or_else(|| self.registry.canonical_version()),
            confidence: self.config.default_confidence,
            source: DetectionSource::Default,
        });

        for signal in [marker, profile, structure, default].into_iter().flatten() {
            if signal.confidence >= self.config.threshold {
                debug!(
                    resource_type,
                    version = %signal.version,
                    confidence = signal.confidence,
                    source = ?signal.source,
                    "Detected resource version"
                );
                return Ok(signal);
            }
            candidates.insert(signal.version);
            best_confidence = best_confidence.max(signal.confidence);
        }

        Err(DetectionError::Ambiguous {
            resource_type: resource_type.to_string(),
            candidates: candidates.into_iter().collect(),
            best_confidence,
        }
        .into())
    }

    fn require_supported(&self, resource_type: &str, version: FhirVersion) -> EngineResult<()> {
        if self.registry.supports(resource_type, version) {
            Ok(())
        } else {
            Err(RegistryError::UnsupportedVersion {
                resource_type: resource_type.to_string(),
                version,
            }
            .into())
        }
    }

    fn marker_signal(&self, resource_type: &str, raw: &Value) -> EngineResult<Option<Detection>> {
        let marker = raw
            .pointer("/meta/fhirVersion")
            .or_else(|| raw.get("fhirVersion"))
            .and_then(Value::as_str);

        let Some(marker) = marker else {
            return Ok(None);
        };
        let Ok(version) = FhirVersion::from_str(marker) else {
            debug!(resource_type, marker, "Ignoring unrecognised version marker");
            return Ok(None);
        };

        self.require_supported(resource_type, version)?;
        Ok(Some(Detection {
            version,
            confidence: MARKER_CONFIDENCE,
            source: DetectionSource::Marker,
        }))
    }

    fn profile_signal(
        &self,
        resource_type: &str,
        raw: &Value,
        candidates: &mut BTreeSet<FhirVersion>,
    ) -> Option<Detection> {
        let versions: BTreeSet<FhirVersion> = raw
            .pointer("/meta/profile")
            .and_then(Value::as_array)?
            .iter()
            .filter_map(Value::as_str)
            .filter_map(|url| self.registry.profile_version(url))
            .filter(|v| self.registry.supports(resource_type, *v))
            .collect();

        if versions.len() == 1 {
            versions.into_iter().next().map(|version| Detection {
                version,
                confidence: PROFILE_CONFIDENCE,
                source: DetectionSource::Profile,
            })
        } else {
            candidates.extend(versions);
            None
        }
    }

    fn structure_signal(
        &self,
        resource_type: &str,
        raw: &Value,
        candidates: &mut BTreeSet<FhirVersion>,
    ) -> Option<Detection> {
        let scored: Vec<(FhirVersion, f64)> = self
            .registry
            .signatures(resource_type)
            .into_iter()
            .filter_map(|(version, signature)| signature.score(raw).map(|s| (version, s)))
            .filter(|(_, score)| *score > 0.0)
            .collect();

        let best = scored.iter().map(|(_, s)| *s).fold(0.0_f64, f64::max);
        let leaders: Vec<FhirVersion> = scored
            .iter()
            .filter(|(_, s)| *s == best)
            .map(|(v, _)| *v)
            .collect();

        match leaders.as_slice() {
            [] => None,
            [version] => Some(Detection {
                version: *version,
                confidence: STRUCTURE_CONFIDENCE * best,
                source: DetectionSource::Structure,
            }),
            tied => {
                candidates.extend(tied.iter().copied());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistryBuilder, VersionSignature};
    use crate::rules::TransformationRule;
    use serde_json::json;

    fn registry() -> Arc<Registry> {
        let mut builder = RegistryBuilder::new(FhirVersion::R4);
        for (from, to) in [
            (FhirVersion::R4, FhirVersion::R5),
            (FhirVersion::R5, FhirVersion::R4),
            (FhirVersion::R4, FhirVersion::R4B),
            (FhirVersion::R4B, FhirVersion::R4),
        ] {
            builder
                .register_rule(TransformationRule::new("Patient", from, to))
                .unwrap();
        }
        builder
            .declare_signature(
                "Patient",
                FhirVersion::R5,
                VersionSignature::new(&["contact.relationship.code"], &[]).unwrap(),
            )
            .unwrap()
            .declare_signature(
                "Patient",
                FhirVersion::R4,
                VersionSignature::new(&["animal"], &[]).unwrap(),
            )
            .unwrap();
        builder.build().unwrap()
    }

    fn detector() -> VersionDetector {
        VersionDetector::new(registry(), DetectorConfig::default()).unwrap()
    }

    #[test]
    fn test_hint_wins() {
        let detection = detector()
            .detect(
                &json!({"resourceType": "Patient", "meta": {"fhirVersion": "4.0.1"}}),
                Some(FhirVersion::R5),
            )
            .unwrap();
        assert_eq!(detection.version, FhirVersion::R5);
        assert_eq!(detection.source, DetectionSource::Hint);
        assert_eq!(detection.confidence, 1.0);
    }

    #[test]
    fn test_unsupported_hint_rejected() {
        let err = detector()
            .detect(&json!({"resourceType": "Patient"}), Some(FhirVersion::R6))
            .unwrap_err();
        assert!(err.is_unsupported_version());
    }

    #[test]
    fn test_marker_beats_structure() {
        let raw = json!({
            "resourceType": "Patient",
            "meta": {"fhirVersion": "4.3.0"},
            "contact": [{"relationship": [{"code": "N"}]}]
        });
        let detection = detector().detect(&raw, None).unwrap();
        assert_eq!(detection.version, FhirVersion::R4B);
        assert_eq!(detection.source, DetectionSource::Marker);
    }

    #[test]
    fn test_profile_marker() {
        let raw = json!({
            "resourceType": "Patient",
            "meta": {"profile": ["http://hl7.org/fhir/R5/StructureDefinition/Patient"]}
        });
        let detection = detector().detect(&raw, None).unwrap();
        assert_eq!(detection.version, FhirVersion::R5);
        assert_eq!(detection.source, DetectionSource::Profile);
    }

    #[test]
    fn test_structure_signal() {
        let raw = json!({"resourceType": "Patient", "contact": [{"relationship": [{"code": "N"}]}]});
        let detection = detector().detect(&raw, None).unwrap();
        assert_eq!(detection.version, FhirVersion::R5);
        assert_eq!(detection.source, DetectionSource::Structure);
        assert!((detection.confidence - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_ambiguous_when_structure_ties() {
        let raw = json!({
            "resourceType": "Patient",
            "animal": {},
            "contact": [{"relationship": [{"code": "N"}]}]
        });
        match detector().detect(&raw, None).unwrap_err() {
            crate::error::EngineError::Detection(DetectionError::Ambiguous {
                candidates,
                best_confidence,
                ..
            }) => {
                assert_eq!(candidates, vec![FhirVersion::R4, FhirVersion::R5]);
                assert_eq!(best_confidence, 0.5);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_default_used_when_configured_confident() {
        let config = DetectorConfig {
            default_confidence: 0.7,
            ..DetectorConfig::default()
        };
        let detection = VersionDetector::new(registry(), config)
            .unwrap()
            .detect(&json!({"resourceType": "Patient"}), None)
            .unwrap();
        assert_eq!(detection.version, FhirVersion::R4);
        assert_eq!(detection.source, DetectionSource::Default);
    }

    #[test]
    fn test_unsupported_default_version_rejected() {
        let config = DetectorConfig {
            default_version: Some(FhirVersion::R6),
            ..DetectorConfig::default()
        };
        let err = VersionDetector::new(registry(), config).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::UnsupportedDefaultVersion {
                version: FhirVersion::R6
            }
        ));

        let config = DetectorConfig {
            default_version: Some(FhirVersion::R5),
            ..DetectorConfig::default()
        };
        assert!(VersionDetector::new(registry(), config).is_ok());
    }

    #[test]
    fn test_missing_resource_type() {
        let err = detector().detect(&json!({"id": "x"}), None).unwrap_err();
        assert!(matches!(
            err,
            crate::error::EngineError::Detection(DetectionError::MissingResourceType)
        ));
        assert!(detector().detect(&json!([1, 2]), None).is_err());
    }

    #[test]
    fn test_detection_is_deterministic() {
        let raw = json!({"resourceType": "Patient", "animal": {"species": "dog"}});
        let d = detector();
        let first = d.detect(&raw, None).unwrap();
        let second = d.detect(&raw, None).unwrap();
        assert_eq!(first, second);
    }
}
