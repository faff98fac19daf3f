//! Core types for versioned resources and transformation audit trails.

mod hash;
mod notes;
mod resource;

pub use hash::PayloadHash;
pub use notes::{NoteSeverity, OperationKind, TransformNote, warnings};
pub use resource::{Resource, ResourceKey};
