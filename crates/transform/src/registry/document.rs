//! Serializable rule catalogs.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Registry, RegistryBuilder, ResourceSchema, VersionSignature};
use crate::error::RegistryError;
use crate::rules::TransformationRule;
use crate::version::FhirVersion;

/// A complete registry description, as loaded from a JSON catalog.
///
/// ```json
/// {
///   "canonical": "R4",
///   "rules": [
///     {"resourceType": "Patient", "fromVersion": "R4", "toVersion": "R5",
///      "operations": [{"op": "wrap", "path": "contact[].relationship[]", "wrapperKey": "code"}]}
///   ],
///   "schemas": [
///     {"resourceType": "Patient", "version": "R5", "elements": ["contact[].relationship"]}
///   ]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryDocument {
    /// The canonical version.
    #[serde(default)]
    pub canonical: FhirVersion,
    /// Transformation edges.
    #[serde(default)]
    pub rules: Vec<TransformationRule>,
    /// Per-version element schemas.
    #[serde(default)]
    pub schemas: Vec<SchemaDecl>,
    /// Per-version structural signatures.
    #[serde(default)]
    pub signatures: Vec<SignatureDecl>,
    /// Profile URL prefixes.
    #[serde(default)]
    pub profile_prefixes: Vec<ProfilePrefixDecl>,
}

/// Schema declaration in a [`RegistryDocument`].
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDecl {
    pub resource_type: String,
    pub version: FhirVersion,
    pub elements: Vec<String>,
}

/// Signature declaration in a [`RegistryDocument`].
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureDecl {
    pub resource_type: String,
    pub version: FhirVersion,
    #[serde(flatten)]
    pub signature: VersionSignature,
}

/// Profile prefix declaration in a [`RegistryDocument`].
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilePrefixDecl {
    pub prefix: String,
    pub version: FhirVersion,
}

impl RegistryDocument {
    /// Builds the described registry.
    pub fn build(&self) -> Result<Arc<Registry>, RegistryError> {
        let mut builder = RegistryBuilder::new(self.canonical);
        for rule in &self.rules {
            builder.register_rule(rule.clone())?;
        }
        for decl in &self.schemas {
            builder.declare_schema(
                &decl.resource_type,
                decl.version,
                ResourceSchema::new(&decl.elements)?,
            )?;
        }
        for decl in &self.signatures {
            builder.declare_signature(&decl.resource_type, decl.version, decl.signature.clone())?;
        }
        for decl in &self.profile_prefixes {
            builder.declare_profile_prefix(&decl.prefix, decl.version)?;
        }
        builder.build()
    }
}
