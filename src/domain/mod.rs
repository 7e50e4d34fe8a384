//! Domain layer types and invariants.

pub mod artifacts;
pub mod error;
pub mod jobs;
pub mod types;
