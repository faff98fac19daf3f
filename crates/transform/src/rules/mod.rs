//! Declarative transformation rules.
//!
//! A [`TransformationRule`] is one directed edge in a resource type's version
//! graph. It holds an ordered list of [`Operation`]s drawn from a closed set,
//! so every declared mapping is auditable and every lossy field can be
//! enumerated statically.

mod operation;
mod path;
mod rule;

pub use operation::{CoerceTarget, Operation};
pub use path::{FieldPath, Segment};
pub use rule::{TransformationRule, TransformationRuleBuilder};
