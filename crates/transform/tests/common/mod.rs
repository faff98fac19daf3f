//! Shared test infrastructure for the transformation engine.

#![allow(dead_code)]

pub mod fixtures;
pub mod harness;

pub use fixtures::*;
pub use harness::*;
