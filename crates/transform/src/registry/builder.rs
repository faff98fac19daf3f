use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::{Registry, ResourceGraph, ResourceSchema, VersionSignature};
use crate::error::RegistryError;
use crate::rules::TransformationRule;
use crate::version::FhirVersion;

/// Assembles and validates a [`Registry`].
///
/// All validation that can be done per rule happens in
/// [`register_rule`](Self::register_rule); graph connectivity is checked in
/// [`build`](Self::build). After a successful build the builder is frozen.
#[derive(Debug)]
pub struct RegistryBuilder {
    canonical: FhirVersion,
    graphs: BTreeMap<String, ResourceGraph>,
    profile_prefixes: Vec<(String, FhirVersion)>,
    frozen: bool,
}

impl RegistryBuilder {
    /// Creates a builder for the given canonical version.
    pub fn new(canonical: FhirVersion) -> Self {
        Self {
            canonical,
            graphs: BTreeMap::new(),
            profile_prefixes: Vec::new(),
            frozen: false,
        }
    }

    fn ensure_open(&self) -> Result<(), RegistryError> {
        if self.frozen {
            Err(RegistryError::Frozen)
        } else {
            Ok(())
        }
    }

    fn graph_mut(&mut self, resource_type: &str) -> &mut ResourceGraph {
        self.graphs.entry(resource_type.to_string()).or_default()
    }

    /// Registers one directed edge.
    ///
    /// # Errors
    ///
    /// * `RegistryError::Frozen` - if the builder has already built
    /// * `RegistryError::InvalidRule` - if the rule fails validation
    /// * `RegistryError::DuplicateRule` - if the edge is already declared
    pub fn register_rule(&mut self, rule: TransformationRule) -> Result<&mut Self, RegistryError> {
        self.ensure_open()?;
        rule.validate()?;

        let graph = self.graph_mut(&rule.resource_type);
        let targets = graph.edges.entry(rule.from_version).or_default();
        if targets.contains_key(&rule.to_version) {
            return Err(RegistryError::DuplicateRule {
                resource_type: rule.resource_type.clone(),
                from: rule.from_version,
                to: rule.to_version,
            });
        }

        debug!(
            resource_type = %rule.resource_type,
            from = %rule.from_version,
            to = %rule.to_version,
            operations = rule.operations.len(),
            "Registered transformation rule"
        );

        let (from, to) = (rule.from_version, rule.to_version);
        targets.insert(to, Arc::new(rule));
        graph.nodes.insert(from);
        graph.nodes.insert(to);
        Ok(self)
    }

    /// Declares the elements a version of a resource type accepts.
    pub fn declare_schema(
        &mut self,
        resource_type: &str,
        version: FhirVersion,
        schema: ResourceSchema,
    ) -> Result<&mut Self, RegistryError> {
        self.ensure_open()?;
        let graph = self.graph_mut(resource_type);
        graph.nodes.insert(version);
        graph.schemas.insert(version, schema);
        Ok(self)
    }

    /// Declares the structural signature identifying a version.
    pub fn declare_signature(
        &mut self,
        resource_type: &str,
        version: FhirVersion,
        signature: VersionSignature,
    ) -> Result<&mut Self, RegistryError> {
        self.ensure_open()?;
        let graph = self.graph_mut(resource_type);
        graph.nodes.insert(version);
        graph.signatures.insert(version, signature);
        Ok(self)
    }

    /// Maps a profile URL prefix to a version.
    pub fn declare_profile_prefix(
        &mut self,
        prefix: &str,
        version: FhirVersion,
    ) -> Result<&mut Self, RegistryError> {
        self.ensure_open()?;
        self.profile_prefixes.push((prefix.to_string(), version));
        Ok(self)
    }

    /// Validates connectivity and produces the immutable registry.
    ///
    /// Every version of every resource type must reach the canonical version
    /// and be reachable from it.
    ///
    /// # Errors
    ///
    /// * `RegistryError::Frozen` - if called again after a successful build
    /// * `RegistryError::MissingCanonical` - if a graph has no canonical node
    /// * `RegistryError::Disconnected` - if a version is cut off from canonical
    pub fn build(&mut self) -> Result<Arc<Registry>, RegistryError> {
        self.ensure_open()?;

        for (resource_type, graph) in &self.graphs {
            if !graph.nodes.contains(&self.canonical) {
                return Err(RegistryError::MissingCanonical {
                    resource_type: resource_type.clone(),
                    canonical: self.canonical,
                });
            }

            let from_canonical = graph.reachable(self.canonical, false);
            let to_canonical = graph.reachable(self.canonical, true);
            for version in &graph.nodes {
                if !to_canonical.contains(version) {
                    return Err(RegistryError::Disconnected {
                        resource_type: resource_type.clone(),
                        version: *version,
                        direction: "to",
                    });
                }
                if !from_canonical.contains(version) {
                    return Err(RegistryError::Disconnected {
                        resource_type: resource_type.clone(),
                        version: *version,
                        direction: "from",
                    });
                }
            }
        }

        self.frozen = true;
        let registry = Registry::new(
            self.canonical,
            std::mem::take(&mut self.graphs),
            std::mem::take(&mut self.profile_prefixes),
        );

        info!(
            canonical = %registry.canonical_version(),
            resource_types = registry.resource_types().count(),
            edges = registry.edge_count(),
            "Transformation registry built"
        );

        Ok(Arc::new(registry))
    }

    /// Returns `true` once [`build`](Self::build) has succeeded.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}
