//! Version detection tests over the shared catalog.

mod common;

use common::*;
use helios_transform::{
    DetectionError, DetectionSource, DetectorConfig, EngineError, FhirVersion, RegistryError,
    VersionDetector,
};
use serde_json::json;

fn detector() -> VersionDetector {
    VersionDetector::new(registry(), DetectorConfig::default()).unwrap()
}

#[test]
fn test_hint_takes_precedence() {
    let detection = detector()
        .detect(&patient_r5("p1", &["N"]), Some(FhirVersion::R4))
        .unwrap();
    assert_eq!(detection.version, FhirVersion::R4);
    assert_eq!(detection.source, DetectionSource::Hint);
    assert_eq!(detection.confidence, 1.0);
}

#[test]
fn test_embedded_marker_beats_structure() {
    let mut payload = patient_r5("p1", &["N"]);
    payload["meta"] = json!({"fhirVersion": "4.0.1"});
    let detection = detector().detect(&payload, None).unwrap();
    assert_eq!(detection.version, FhirVersion::R4);
    assert_eq!(detection.source, DetectionSource::Marker);
}

#[test]
fn test_profile_marker() {
    let mut payload = patient_r4("p1", &["N"]);
    payload["meta"] = json!({"profile": ["http://example.org/fhir/r5/StructureDefinition/patient"]});
    let detection = detector().detect(&payload, None).unwrap();
    assert_eq!(detection.version, FhirVersion::R5);
    assert_eq!(detection.source, DetectionSource::Profile);
}

#[test]
fn test_structural_heuristics() {
    let detection = detector().detect(&patient_r5("p1", &["N", "E"]), None).unwrap();
    assert_eq!(detection.version, FhirVersion::R5);
    assert_eq!(detection.source, DetectionSource::Structure);

    let detection = detector().detect(&observation_r5_triggered("o1"), None).unwrap();
    assert_eq!(detection.version, FhirVersion::R5);
}

#[test]
fn test_low_confidence_is_ambiguous() {
    let err = detector().detect(&patient_r4("p1", &["N"]), None).unwrap_err();
    match err {
        EngineError::Detection(DetectionError::Ambiguous {
            resource_type,
            candidates,
            best_confidence,
        }) => {
            assert_eq!(resource_type, "Patient");
            assert_eq!(candidates, vec![FhirVersion::R4]);
            assert_eq!(best_confidence, 0.5);
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn test_configured_default_can_clear_threshold() {
    let detector = VersionDetector::new(
        registry(),
        DetectorConfig {
            default_version: Some(FhirVersion::R4),
            default_confidence: 0.7,
            ..Default::default()
        },
    )
    .unwrap();
    let detection = detector.detect(&patient_r4("p1", &["N"]), None).unwrap();
    assert_eq!(detection.version, FhirVersion::R4);
    assert_eq!(detection.source, DetectionSource::Default);
}

#[test]
fn test_marker_for_unsupported_version_is_rejected() {
    let mut payload = observation_r4("o1", "72");
    payload["meta"] = json!({"fhirVersion": "6.0.0"});
    let err = detector().detect(&payload, None).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Registry(RegistryError::UnsupportedVersion { version: FhirVersion::R6, .. })
    ));
}

#[test]
fn test_detection_is_deterministic() {
    let detector = detector();
    let payloads = [
        patient_r5("p1", &["N"]),
        observation_r5_triggered("o1"),
        json!({"resourceType": "Patient", "contact": [{"role": [{"code": "C"}]}]}),
    ];
    for payload in &payloads {
        let bytes = serde_json::to_vec(payload).unwrap();
        let first = detector.detect(&serde_json::from_slice(&bytes).unwrap(), None);
        let second = detector.detect(&serde_json::from_slice(&bytes).unwrap(), None);
        assert_eq!(first.unwrap(), second.unwrap());
    }
}

#[test]
fn test_malformed_payloads() {
    assert!(matches!(
        detector().detect(&json!([1, 2]), None),
        Err(EngineError::Detection(DetectionError::NotAnObject))
    ));
    assert!(matches!(
        detector().detect(&json!({"id": "x"}), None),
        Err(EngineError::Detection(DetectionError::MissingResourceType))
    ));
}
