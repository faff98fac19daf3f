//! Resource fixtures and the shared rule catalog.

use std::sync::Arc;

use serde_json::{Value, json};

use helios_transform::types::Resource;
use helios_transform::{FhirVersion, Registry, RegistryDocument};

/// The rule catalog used across the integration tests.
pub const CATALOG: &str = include_str!("../data/registry.json");

/// Parses [`CATALOG`].
pub fn catalog() -> RegistryDocument {
    serde_json::from_str(CATALOG).expect("catalog parses")
}

/// Builds the catalog registry (canonical R4).
pub fn registry() -> Arc<Registry> {
    catalog().build().expect("catalog is connected")
}

/// A Patient with coded contact relationships, at R4.
pub fn patient_r4(id: &str, relationships: &[&str]) -> Value {
    json!({
        "resourceType": "Patient",
        "id": id,
        "active": true,
        "name": [{"family": "Chalmers", "given": ["Peter", "James"]}],
        "gender": "male",
        "birthDate": "1974-12-25",
        "contact": [{
            "relationship": relationships,
            "name": {"family": "du Marché", "given": ["Bénédicte"]}
        }]
    })
}

/// The same Patient at R5, relationships wrapped as coded objects.
pub fn patient_r5(id: &str, relationships: &[&str]) -> Value {
    let coded: Vec<Value> = relationships.iter().map(|c| json!({"code": c})).collect();
    json!({
        "resourceType": "Patient",
        "id": id,
        "active": true,
        "name": [{"family": "Chalmers", "given": ["Peter", "James"]}],
        "gender": "male",
        "birthDate": "1974-12-25",
        "contact": [{
            "relationship": coded,
            "name": {"family": "du Marché", "given": ["Bénédicte"]}
        }]
    })
}

/// An Observation at R4, whose quantity value is carried as text.
pub fn observation_r4(id: &str, value: &str) -> Value {
    json!({
        "resourceType": "Observation",
        "id": id,
        "status": "final",
        "code": {"coding": [{"system": "http://loinc.org", "code": "8867-4"}]},
        "subject": {"reference": "Patient/example"},
        "effectiveDateTime": "2024-03-01T09:30:00Z",
        "valueQuantity": {"value": value, "unit": "beats/minute"}
    })
}

/// An Observation at R5 carrying the R5-only `triggeredBy` element.
pub fn observation_r5_triggered(id: &str) -> Value {
    json!({
        "resourceType": "Observation",
        "id": id,
        "status": "final",
        "code": {"coding": [{"system": "http://loinc.org", "code": "8867-4"}]},
        "valueQuantity": {"value": 72, "unit": "beats/minute"},
        "triggeredBy": [{"observation": {"reference": "Observation/o0"}, "type": "reflex"}]
    })
}

/// Wraps a payload as a resource at `version`, canonical R4.
pub fn resource(version: FhirVersion, payload: Value) -> Resource {
    let resource_type = payload["resourceType"].as_str().unwrap_or_default().to_string();
    let id = payload["id"].as_str().unwrap_or_default().to_string();
    Resource::new(resource_type, id, version, FhirVersion::R4, payload)
}

/// Zero-padded id so key order matches numeric order.
pub fn numbered(prefix: &str, n: usize) -> String {
    format!("{}-{:05}", prefix, n)
}
