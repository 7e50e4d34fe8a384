//! Application services: engine pool, render pipeline and job orchestration.

pub mod deadline;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod render;
pub mod scheduler;
pub mod uploads;
