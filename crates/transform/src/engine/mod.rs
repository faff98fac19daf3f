//! Transformation Engine.
//!
//! [`TransformEngine`] moves a [`Resource`] between versions by resolving an
//! edge path through the [`Registry`] and interpreting each edge's
//! operations. It never mutates its input and holds no mutable state, so a
//! single engine can be shared across any number of tasks.
//!
//! After each edge the output is checked against the target version's
//! declared schema: a field the edge left without any mapping is a hard
//! [`TransformationError::UnmappedField`], distinct from a declared lossy
//! drop, which succeeds with a warning note.

mod apply;
mod coerce;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{EngineResult, TransformationError};
use crate::events::{EngineEvent, EventSink, NoopSink};
use crate::registry::{Registry, element_present};
use crate::rules::TransformationRule;
use crate::types::{OperationKind, Resource, TransformNote};
use crate::version::FhirVersion;

/// How declared lossy drops are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossyPolicy {
    /// Drop the field and record a warning note.
    #[default]
    Warn,
    /// Fail the transformation.
    Reject,
}

impl fmt::Display for LossyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossyPolicy::Warn => write!(f, "warn"),
            LossyPolicy::Reject => write!(f, "reject"),
        }
    }
}

impl FromStr for LossyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "warn" => Ok(LossyPolicy::Warn),
            "reject" | "strict" => Ok(LossyPolicy::Reject),
            other => Err(format!("unknown lossy policy: {}", other)),
        }
    }
}

/// Options applied to every transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransformOptions {
    /// Treatment of declared lossy drops.
    pub lossy_policy: LossyPolicy,
}

/// A transformed resource and the notes produced along the way.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutput {
    /// The resource at the target version.
    pub resource: Resource,
    /// Notes for every edge applied, in order.
    pub notes: Vec<TransformNote>,
}

/// Applies registry edges to resources.
#[derive(Debug, Clone)]
pub struct TransformEngine {
    registry: Arc<Registry>,
    options: TransformOptions,
    sink: Arc<dyn EventSink>,
}

impl TransformEngine {
    /// Creates an engine with default options and no event sink.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            options: TransformOptions::default(),
            sink: Arc::new(NoopSink),
        }
    }

    /// Replaces the transformation options.
    pub fn with_options(mut self, options: TransformOptions) -> Self {
        self.options = options;
        self
    }

    /// Replaces the event sink.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Returns the registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Returns the options.
    pub fn options(&self) -> TransformOptions {
        self.options
    }

    /// Transforms `resource` to `target`.
    ///
    /// # Errors
    ///
    /// * `RegistryError::UnsupportedVersion` / `NoPath` - no route exists
    /// * `TransformationError` - an operation failed or a field is unmapped
    pub fn transform(&self, resource: &Resource, target: FhirVersion) -> EngineResult<TransformOutput> {
        let from = resource.schema_version();
        let started = Instant::now();
        let result = self.transform_payload(resource.resource_type(), resource.payload(), from, target);

        let (hops, success) = match &result {
            Ok((_, _, hops)) => (*hops, true),
            Err(_) => (0, false),
        };
        self.sink.emit(&EngineEvent::TransformCompleted {
            resource_type: resource.resource_type().to_string(),
            from,
            to: target,
            hops,
            duration: started.elapsed(),
            success,
        });

        let (payload, notes, _) = result.inspect_err(|e| {
            debug!(
                resource = %resource.key(),
                from = %from,
                to = %target,
                error = %e,
                "Transformation failed"
            );
        })?;

        Ok(TransformOutput {
            resource: resource.with_payload(payload, target),
            notes,
        })
    }

    /// Transforms `resource` to the canonical version.
    pub fn canonicalize(&self, resource: &Resource) -> EngineResult<TransformOutput> {
        self.transform(resource, self.registry.canonical_version())
    }

    /// Transforms a bare payload, returning the new payload, the notes, and
    /// the number of edges applied.
    pub fn transform_payload(
        &self,
        resource_type: &str,
        payload: &Value,
        from: FhirVersion,
        to: FhirVersion,
    ) -> EngineResult<(Value, Vec<TransformNote>, usize)> {
        let path = self.registry.find_path(resource_type, from, to)?;
        let mut doc = payload.clone();
        let mut notes = Vec::new();

        for rule in &path {
            apply::apply_rule(&mut doc, rule, self.options.lossy_policy, &mut notes)?;
            self.check_schema(resource_type, rule, &doc)?;
            self.note_not_restorable(resource_type, rule, &doc, &mut notes);
        }

        if notes.iter().any(TransformNote::is_warning) {
            warn!(
                resource_type,
                from = %from,
                to = %to,
                lossy_fields = notes.iter().filter(|n| n.is_warning()).count(),
                "Transformation dropped lossy fields"
            );
        }

        Ok((doc, notes, path.len()))
    }

    fn check_schema(
        &self,
        resource_type: &str,
        rule: &TransformationRule,
        doc: &Value,
    ) -> Result<(), TransformationError> {
        let Some(schema) = self.registry.schema(resource_type, rule.to_version) else {
            return Ok(());
        };
        match schema.first_unmapped(doc) {
            Some(path) => Err(TransformationError::UnmappedField {
                resource_type: resource_type.to_string(),
                from: rule.from_version,
                to: rule.to_version,
                path,
            }),
            None => Ok(()),
        }
    }

    /// Notes fields the reverse edge would drop as lossy and that are absent
    /// here, so a round trip reports them in both directions.
    fn note_not_restorable(
        &self,
        resource_type: &str,
        rule: &TransformationRule,
        doc: &Value,
        notes: &mut Vec<TransformNote>,
    ) {
        for path in self
            .registry
            .lossy_paths(resource_type, rule.to_version, rule.from_version)
        {
            if !element_present(doc, &path.names()) {
                notes.push(
                    TransformNote::info(
                        OperationKind::NotRestorable,
                        path.as_str(),
                        rule.from_version,
                        rule.to_version,
                    )
                    .with_message(format!(
                        "declared lossy when converting {} back to {}",
                        rule.to_version, rule.from_version
                    )),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MetricsSink;
    use crate::registry::{RegistryBuilder, ResourceSchema};
    use crate::types::NoteSeverity;
    use serde_json::json;

    fn registry() -> Arc<Registry> {
        let mut builder = RegistryBuilder::new(FhirVersion::R4);
        builder
            .register_rule(
                TransformationRule::builder("Observation", FhirVersion::R4, FhirVersion::R5)
                    .build()
                    .unwrap(),
            )
            .unwrap()
            .register_rule(
                TransformationRule::builder("Observation", FhirVersion::R5, FhirVersion::R4)
                    .drop_lossy("triggeredBy", "no equivalent in R4")
                    .build()
                    .unwrap(),
            )
            .unwrap()
            .declare_schema(
                "Observation",
                FhirVersion::R4,
                ResourceSchema::new(["status", "code", "value"]).unwrap(),
            )
            .unwrap()
            .declare_schema(
                "Observation",
                FhirVersion::R5,
                ResourceSchema::new(["status", "code", "value", "triggeredBy"]).unwrap(),
            )
            .unwrap();
        builder.build().unwrap()
    }

    fn observation(version: FhirVersion, payload: Value) -> Resource {
        Resource::new("Observation", "o1", version, FhirVersion::R4, payload)
    }

    #[test]
    fn test_transform_does_not_mutate_input() {
        let engine = TransformEngine::new(registry());
        let input = observation(
            FhirVersion::R5,
            json!({"resourceType": "Observation", "status": "final", "triggeredBy": [{"type": "reflex"}]}),
        );
        let before = input.clone();
        let output = engine.canonicalize(&input).unwrap();
        assert_eq!(input, before);
        assert_eq!(output.resource.schema_version(), FhirVersion::R4);
        assert_eq!(output.resource.original_version(), FhirVersion::R5);
        assert!(output.resource.payload().get("triggeredBy").is_none());
    }

    #[test]
    fn test_unmapped_field_is_hard_failure() {
        let engine = TransformEngine::new(registry());
        let input = observation(
            FhirVersion::R5,
            json!({"resourceType": "Observation", "status": "final", "bodyStructure": {"x": 1}}),
        );
        let err = engine.canonicalize(&input).unwrap_err();
        assert!(matches!(
            err,
            crate::error::EngineError::Transformation(TransformationError::UnmappedField { ref path, .. })
                if path == "bodyStructure"
        ));
    }

    #[test]
    fn test_not_restorable_noted_on_upgrade() {
        let engine = TransformEngine::new(registry());
        let input = observation(FhirVersion::R4, json!({"resourceType": "Observation", "status": "final"}));
        let output = engine.transform(&input, FhirVersion::R5).unwrap();
        assert_eq!(output.notes.len(), 1);
        assert_eq!(output.notes[0].operation, OperationKind::NotRestorable);
        assert_eq!(output.notes[0].severity, NoteSeverity::Info);
        assert_eq!(output.notes[0].path, "triggeredBy");
    }

    #[test]
    fn test_reject_policy() {
        let engine = TransformEngine::new(registry()).with_options(TransformOptions {
            lossy_policy: LossyPolicy::Reject,
        });
        let input = observation(
            FhirVersion::R5,
            json!({"resourceType": "Observation", "triggeredBy": [{"type": "reflex"}]}),
        );
        assert!(engine.canonicalize(&input).is_err());
    }

    #[test]
    fn test_emits_transform_events() {
        let sink = Arc::new(MetricsSink::new());
        let engine = TransformEngine::new(registry()).with_sink(sink.clone());
        let input = observation(FhirVersion::R4, json!({"resourceType": "Observation"}));
        engine.transform(&input, FhirVersion::R5).unwrap();
        assert!(engine.transform(&input, FhirVersion::R6).is_err());
        let snapshot = sink.snapshot();
        assert_eq!(snapshot.transforms, 2);
        assert_eq!(snapshot.failed_transforms, 1);
    }

    #[test]
    fn test_lossy_policy_parse() {
        assert_eq!("reject".parse::<LossyPolicy>().unwrap(), LossyPolicy::Reject);
        assert_eq!("WARN".parse::<LossyPolicy>().unwrap(), LossyPolicy::Warn);
        assert!("maybe".parse::<LossyPolicy>().is_err());
    }
}
