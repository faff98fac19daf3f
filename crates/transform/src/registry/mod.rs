//! Transformation Registry.
//!
//! The registry is an immutable, validated directed graph per resource type:
//! nodes are supported versions, edges are [`TransformationRule`]s. It is
//! assembled with a [`RegistryBuilder`], validated once at startup, and then
//! shared by reference with every component that transforms resources.
//!
//! # Example
//!
//! ```
//! use helios_transform::FhirVersion;
//! use helios_transform::registry::RegistryBuilder;
//! use helios_transform::rules::TransformationRule;
//!
//! let mut builder = RegistryBuilder::new(FhirVersion::R4);
//! builder
//!     .register_rule(
//!         TransformationRule::builder("Patient", FhirVersion::R4, FhirVersion::R5)
//!             .rename("contact[].rel", "contact[].relationship")
//!             .build()
//!             .unwrap(),
//!     )
//!     .unwrap()
//!     .register_rule(
//!         TransformationRule::builder("Patient", FhirVersion::R5, FhirVersion::R4)
//!             .rename("contact[].relationship", "contact[].rel")
//!             .build()
//!             .unwrap(),
//!     )
//!     .unwrap();
//!
//! let registry = builder.build().unwrap();
//! let path = registry.find_path("Patient", FhirVersion::R5, FhirVersion::R4).unwrap();
//! assert_eq!(path.len(), 1);
//!
//! // The builder is frozen once built.
//! assert!(builder.register_rule(
//!     helios_transform::rules::TransformationRule::new("Patient", FhirVersion::R4, FhirVersion::R4B)
//! ).is_err());
//! ```

mod builder;
mod document;
mod schema;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

pub use builder::RegistryBuilder;
pub use document::{ProfilePrefixDecl, RegistryDocument, SchemaDecl, SignatureDecl};
pub use schema::{ResourceSchema, VersionSignature};

pub(crate) use schema::element_present;

use crate::error::RegistryError;
use crate::rules::{FieldPath, TransformationRule};
use crate::version::FhirVersion;

/// The version graph of a single resource type.
#[derive(Debug, Default)]
pub(crate) struct ResourceGraph {
    pub(crate) nodes: BTreeSet<FhirVersion>,
    pub(crate) edges: BTreeMap<FhirVersion, BTreeMap<FhirVersion, Arc<TransformationRule>>>,
    pub(crate) schemas: BTreeMap<FhirVersion, ResourceSchema>,
    pub(crate) signatures: BTreeMap<FhirVersion, VersionSignature>,
}

impl ResourceGraph {
    /// Versions reachable from `start` following edges forward (or backward).
    pub(crate) fn reachable(&self, start: FhirVersion, reverse: bool) -> BTreeSet<FhirVersion> {
        let mut seen = BTreeSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            let next: Vec<FhirVersion> = if reverse {
                self.edges
                    .iter()
                    .filter(|(_, targets)| targets.contains_key(&current))
                    .map(|(from, _)| *from)
                    .collect()
            } else {
                self.edges
                    .get(&current)
                    .map(|targets| targets.keys().copied().collect())
                    .unwrap_or_default()
            };
            for version in next {
                if seen.insert(version) {
                    queue.push_back(version);
                }
            }
        }
        seen
    }
}

/// An immutable, validated transformation registry.
#[derive(Debug)]
pub struct Registry {
    canonical: FhirVersion,
    graphs: BTreeMap<String, ResourceGraph>,
    profile_prefixes: Vec<(String, FhirVersion)>,
}

impl Registry {
    pub(crate) fn new(
        canonical: FhirVersion,
        graphs: BTreeMap<String, ResourceGraph>,
        profile_prefixes: Vec<(String, FhirVersion)>,
    ) -> Self {
        Self {
            canonical,
            graphs,
            profile_prefixes,
        }
    }

    /// Returns the systemwide canonical version.
    pub fn canonical_version(&self) -> FhirVersion {
        self.canonical
    }

    /// Returns the resource types with declared graphs.
    pub fn resource_types(&self) -> impl Iterator<Item = &str> {
        self.graphs.keys().map(String::as_str)
    }

    /// Returns the versions supported for a resource type, in release order.
    ///
    /// Resource types without declared rules support only the canonical
    /// version, as identity.
    pub fn supported_versions(&self, resource_type: &str) -> Vec<FhirVersion> {
        match self.graphs.get(resource_type) {
            Some(graph) => graph.nodes.iter().copied().collect(),
            None => vec![self.canonical],
        }
    }

    /// Returns `true` if `version` is a node for the resource type.
    pub fn supports(&self, resource_type: &str, version: FhirVersion) -> bool {
        self.supported_versions(resource_type).contains(&version)
    }

    /// Finds the shortest edge path between two versions.
    ///
    /// Ties between equally short paths are broken by visiting neighbours in
    /// release order, so the result is deterministic. A path from a version
    /// to itself is empty.
    ///
    /// # Errors
    ///
    /// * `RegistryError::UnsupportedVersion` - if either version is not a node
    /// * `RegistryError::NoPath` - if no edge path connects them
    pub fn find_path(
        &self,
        resource_type: &str,
        from: FhirVersion,
        to: FhirVersion,
    ) -> Result<Vec<Arc<TransformationRule>>, RegistryError> {
        for version in [from, to] {
            if !self.supports(resource_type, version) {
                return Err(RegistryError::UnsupportedVersion {
                    resource_type: resource_type.to_string(),
                    version,
                });
            }
        }
        if from == to {
            return Ok(Vec::new());
        }

        let no_path = || RegistryError::NoPath {
            resource_type: resource_type.to_string(),
            from,
            to,
        };
        let graph = self.graphs.get(resource_type).ok_or_else(no_path)?;

        let mut previous: BTreeMap<FhirVersion, FhirVersion> = BTreeMap::new();
        let mut queue = VecDeque::from([from]);
        while let Some(current) = queue.pop_front() {
            if current == to {
                break;
            }
            if let Some(targets) = graph.edges.get(&current) {
                for next in targets.keys() {
                    if *next != from && !previous.contains_key(next) {
                        previous.insert(*next, current);
                        queue.push_back(*next);
                    }
                }
            }
        }

        if !previous.contains_key(&to) {
            return Err(no_path());
        }

        let mut path = Vec::new();
        let mut cursor = to;
        while cursor != from {
            let prev = previous[&cursor];
            path.push(graph.edges[&prev][&cursor].clone());
            cursor = prev;
        }
        path.reverse();
        Ok(path)
    }

    /// Returns the rule for a single edge, if declared.
    pub fn edge(
        &self,
        resource_type: &str,
        from: FhirVersion,
        to: FhirVersion,
    ) -> Option<Arc<TransformationRule>> {
        self.graphs
            .get(resource_type)?
            .edges
            .get(&from)?
            .get(&to)
            .cloned()
    }

    /// Returns the paths the edge `from -> to` drops as lossy.
    pub fn lossy_paths(
        &self,
        resource_type: &str,
        from: FhirVersion,
        to: FhirVersion,
    ) -> Vec<FieldPath> {
        self.edge(resource_type, from, to)
            .map(|rule| rule.lossy_paths().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the declared schema for a version, if any.
    pub fn schema(&self, resource_type: &str, version: FhirVersion) -> Option<&ResourceSchema> {
        self.graphs.get(resource_type)?.schemas.get(&version)
    }

    /// Returns the declared structural signatures for a resource type.
    pub fn signatures(&self, resource_type: &str) -> Vec<(FhirVersion, &VersionSignature)> {
        self.graphs
            .get(resource_type)
            .map(|g| g.signatures.iter().map(|(v, s)| (*v, s)).collect())
            .unwrap_or_default()
    }

    /// Resolves a profile URL to a version by its longest matching prefix.
    ///
    /// Besides declared prefixes, the published HL7 locations
    /// `http://hl7.org/fhir/R4/` and `http://hl7.org/fhir/4.0/` (and their
    /// equivalents for every release) are recognised.
    pub fn profile_version(&self, profile: &str) -> Option<FhirVersion> {
        let builtin = FhirVersion::all().iter().flat_map(|v| {
            [
                (format!("http://hl7.org/fhir/{}/", v.as_str()), *v),
                (format!("http://hl7.org/fhir/{}/", v.as_mime_param()), *v),
            ]
        });

        self.profile_prefixes
            .iter()
            .cloned()
            .chain(builtin)
            .filter(|(prefix, _)| profile.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, version)| version)
    }

    /// Returns the number of edges across all resource types.
    pub fn edge_count(&self) -> usize {
        self.graphs
            .values()
            .map(|g| g.edges.values().map(BTreeMap::len).sum::<usize>())
            .sum()
    }
}

/// Shared handle to a built registry.
pub type SharedRegistry = Arc<Registry>;
