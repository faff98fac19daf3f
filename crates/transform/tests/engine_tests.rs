//! Transformation engine tests: round trips, lossy drops, multi-hop paths.

mod common;

use common::*;
use helios_transform::types::{NoteSeverity, OperationKind};
use helios_transform::{
    EngineError, FhirVersion, LossyPolicy, TransformEngine, TransformOptions, TransformationError,
};
use serde_json::{Value, json};

/// Removes `names` from a payload so declared-lossy fields can be excluded
/// from equality checks.
fn without(mut payload: Value, names: &[&str]) -> Value {
    if let Some(object) = payload.as_object_mut() {
        for name in names {
            object.remove(*name);
        }
    }
    payload
}

#[test]
fn test_patient_contact_relationship_round_trip() {
    let engine = engine();
    let original = resource(FhirVersion::R4, patient_r4("p1", &["N", "E", "C"]));

    let up = engine.transform(&original, FhirVersion::R5).unwrap();
    assert_eq!(up.resource.schema_version(), FhirVersion::R5);
    assert_eq!(
        up.resource.payload()["contact"][0]["relationship"],
        json!([{"code": "N"}, {"code": "E"}, {"code": "C"}])
    );
    assert!(up.notes.iter().all(|n| n.operation == OperationKind::Wrap));
    assert_eq!(up.notes[2].path, "contact[0].relationship[2]");

    let down = engine.transform(&up.resource, FhirVersion::R4).unwrap();
    assert_eq!(down.resource.payload(), original.payload());
    assert_eq!(
        down.resource.payload()["contact"][0]["relationship"],
        json!(["N", "E", "C"])
    );
}

#[test]
fn test_observation_downgrade_drops_lossy_field_with_note() {
    let engine = engine();
    let input = resource(FhirVersion::R5, observation_r5_triggered("o1"));

    let output = engine.transform(&input, FhirVersion::R4).unwrap();
    assert!(output.resource.payload().get("triggeredBy").is_none());
    assert_eq!(output.resource.payload()["valueQuantity"]["value"], json!("72"));

    let drop = output
        .notes
        .iter()
        .find(|n| n.operation == OperationKind::Drop)
        .expect("drop note");
    assert_eq!(drop.path, "triggeredBy");
    assert_eq!(drop.severity, NoteSeverity::Warning);
    assert_eq!(drop.message.as_deref(), Some("no equivalent in R4"));
    assert_eq!((drop.from, drop.to), (FhirVersion::R5, FhirVersion::R4));
}

#[test]
fn test_lossy_fields_noted_in_both_directions() {
    let engine = engine();
    let input = resource(FhirVersion::R5, observation_r5_triggered("o1"));

    let down = engine.transform(&input, FhirVersion::R4).unwrap();
    let up = engine.transform(&down.resource, FhirVersion::R5).unwrap();

    assert!(down.notes.iter().any(|n| n.path == "triggeredBy"));
    let restored = up
        .notes
        .iter()
        .find(|n| n.path == "triggeredBy")
        .expect("not-restorable note");
    assert_eq!(restored.operation, OperationKind::NotRestorable);

    assert_eq!(
        without(up.resource.payload().clone(), &["triggeredBy"]),
        without(input.payload().clone(), &["triggeredBy"])
    );
}

#[test]
fn test_round_trip_every_registered_pair() {
    let engine = engine();
    let registry = engine.registry().clone();
    let samples = [
        resource(FhirVersion::R4, patient_r4("p1", &["N", "E"])),
        resource(FhirVersion::R4, observation_r4("o1", "98.6")),
    ];

    for sample in &samples {
        let resource_type = sample.resource_type();
        for &a in &registry.supported_versions(resource_type) {
            let at_a = engine.transform(sample, a).unwrap().resource;
            for &b in &registry.supported_versions(resource_type) {
                let there = engine.transform(&at_a, b).unwrap();
                let back = engine.transform(&there.resource, a).unwrap();

                let lossy: Vec<String> = registry
                    .lossy_paths(resource_type, a, b)
                    .into_iter()
                    .chain(registry.lossy_paths(resource_type, b, a))
                    .map(|p| p.as_str().to_string())
                    .collect();
                let lossy: Vec<&str> = lossy.iter().map(String::as_str).collect();
                assert_eq!(
                    without(back.resource.payload().clone(), &lossy),
                    without(at_a.payload().clone(), &lossy),
                    "{} {} -> {} -> {}",
                    resource_type,
                    a,
                    b,
                    a
                );
            }
        }
    }
}

#[test]
fn test_decimal_text_survives_round_trip() {
    let engine = engine();
    for text in ["72.0", "12.50", "0.12345678901234567890"] {
        let original = resource(FhirVersion::R4, observation_r4("o1", text));

        let up = engine.transform(&original, FhirVersion::R5).unwrap();
        let value = &up.resource.payload()["valueQuantity"]["value"];
        assert!(value.is_number(), "{} should coerce to a number", text);
        assert_eq!(value.to_string(), text);

        let down = engine.transform(&up.resource, FhirVersion::R4).unwrap();
        assert_eq!(down.resource.payload()["valueQuantity"]["value"], json!(text));
        assert_eq!(down.resource.payload(), original.payload());
    }
}

#[test]
fn test_canonicalization_is_idempotent() {
    let engine = engine();
    for input in [
        resource(FhirVersion::R6, json!({"resourceType": "Patient", "id": "p1", "contact": [{"role": [{"code": "N"}]}]})),
        resource(FhirVersion::R5, observation_r5_triggered("o1")),
        resource(FhirVersion::R4, observation_r4("o2", "120")),
    ] {
        let once = engine.canonicalize(&input).unwrap().resource;
        let twice = engine.canonicalize(&once).unwrap().resource;
        assert_eq!(once.schema_version(), FhirVersion::R4);
        assert_eq!(twice.payload(), once.payload());
        assert_eq!(twice.schema_version(), once.schema_version());
    }
}

#[test]
fn test_multi_hop_transform() {
    let engine = engine();
    let input = resource(FhirVersion::R4, patient_r4("p1", &["N"]));
    let output = engine.transform(&input, FhirVersion::R6).unwrap();

    let contact = &output.resource.payload()["contact"][0];
    assert_eq!(contact["role"], json!([{"code": "N"}]));
    assert!(contact.get("relationship").is_none());
    assert_eq!(output.resource.original_version(), FhirVersion::R4);
    assert!(output.notes.iter().any(|n| n.operation == OperationKind::Rename));
}

#[test]
fn test_unmapped_field_is_a_hard_failure() {
    let engine = engine();
    let mut payload = observation_r5_triggered("o1");
    payload["bodyStructure"] = json!({"reference": "BodyStructure/b1"});
    let input = resource(FhirVersion::R5, payload);

    let err = engine.transform(&input, FhirVersion::R4).unwrap_err();
    match err {
        EngineError::Transformation(TransformationError::UnmappedField { path, from, to, .. }) => {
            assert_eq!(path, "bodyStructure");
            assert_eq!((from, to), (FhirVersion::R5, FhirVersion::R4));
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn test_out_of_domain_coercion_fails() {
    let engine = engine();
    let input = resource(FhirVersion::R4, observation_r4("o1", "n/a"));
    let err = engine.transform(&input, FhirVersion::R5).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Transformation(TransformationError::CoercionOutOfDomain { ref path, .. })
            if path == "valueQuantity.value"
    ));
}

#[test]
fn test_reject_policy_blocks_lossy_drop() {
    let engine = TransformEngine::new(registry()).with_options(TransformOptions {
        lossy_policy: LossyPolicy::Reject,
    });
    let input = resource(FhirVersion::R5, observation_r5_triggered("o1"));
    let err = engine.transform(&input, FhirVersion::R4).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Transformation(TransformationError::LossyRejected { .. })
    ));

    // Nothing lossy to drop.
    let plain = resource(FhirVersion::R5, json!({"resourceType": "Observation", "id": "o2", "status": "final"}));
    assert!(engine.transform(&plain, FhirVersion::R4).is_ok());
}

#[test]
fn test_unsupported_target() {
    let engine = engine();
    let input = resource(FhirVersion::R4, observation_r4("o1", "1"));
    let err = engine.transform(&input, FhirVersion::R6).unwrap_err();
    assert!(err.is_unsupported_version());
}
