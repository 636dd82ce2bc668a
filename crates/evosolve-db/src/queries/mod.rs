//! Database query functions, one module per concern.

pub mod cache;
pub mod generations;
pub mod jobs;
pub mod queue;
pub mod telemetry;
