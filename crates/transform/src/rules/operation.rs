//! The closed set of field operations a transformation rule may declare.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::path::FieldPath;
use crate::types::OperationKind;

/// Primitive type targeted by a [`Operation::Coerce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoerceTarget {
    /// JSON string.
    String,
    /// JSON number without a fractional part, within `i64`.
    Integer,
    /// JSON number.
    Decimal,
    /// JSON boolean.
    Boolean,
}

impl fmt::Display for CoerceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoerceTarget::String => write!(f, "string"),
            CoerceTarget::Integer => write!(f, "integer"),
            CoerceTarget::Decimal => write!(f, "decimal"),
            CoerceTarget::Boolean => write!(f, "boolean"),
        }
    }
}

/// A single field operation.
///
/// Serialized with an `op` tag:
///
/// ```
/// use helios_transform::rules::Operation;
///
/// let op: Operation = serde_json::from_str(
///     r#"{"op": "drop", "path": "bodySite", "lossy": true, "reason": "no equivalent in R4"}"#,
/// ).unwrap();
/// assert!(op.is_lossy());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Operation {
    /// Moves the value at `path` to `new_path`.
    Rename {
        /// Source path.
        path: FieldPath,
        /// Destination path.
        new_path: FieldPath,
    },

    /// Replaces the value `v` at `path` with `{wrapper_key: v}`.
    Wrap {
        /// Path of the value to wrap.
        path: FieldPath,
        /// Key of the wrapping object.
        wrapper_key: String,
    },

    /// Replaces `{wrapper_key: v}` at `path` with `v`.
    Unwrap {
        /// Path of the wrapper object.
        path: FieldPath,
        /// Key of the wrapping object.
        wrapper_key: String,
    },

    /// Converts the primitive at `path` to another primitive type.
    Coerce {
        /// Path of the value to convert.
        path: FieldPath,
        /// Target type.
        target: CoerceTarget,
    },

    /// Sets `value` at `path` when nothing is there.
    DefaultInject {
        /// Path to populate.
        path: FieldPath,
        /// Value to inject.
        value: Value,
    },

    /// Removes the value at `path`.
    Drop {
        /// Path to remove.
        path: FieldPath,
        /// Whether removal loses information.
        lossy: bool,
        /// Audit reason; required when `lossy`.
        #[serde(default)]
        reason: String,
    },
}

impl Operation {
    /// Returns the kind of operation.
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Rename { .. } => OperationKind::Rename,
            Operation::Wrap { .. } => OperationKind::Wrap,
            Operation::Unwrap { .. } => OperationKind::Unwrap,
            Operation::Coerce { .. } => OperationKind::Coerce,
            Operation::DefaultInject { .. } => OperationKind::DefaultInject,
            Operation::Drop { .. } => OperationKind::Drop,
        }
    }

    /// Returns the primary path the operation reads.
    pub fn path(&self) -> &FieldPath {
        match self {
            Operation::Rename { path, .. }
            | Operation::Wrap { path, .. }
            | Operation::Unwrap { path, .. }
            | Operation::Coerce { path, .. }
            | Operation::DefaultInject { path, .. }
            | Operation::Drop { path, .. } => path,
        }
    }

    /// Returns `true` for a drop declared lossy.
    pub fn is_lossy(&self) -> bool {
        matches!(self, Operation::Drop { lossy: true, .. })
    }
}
