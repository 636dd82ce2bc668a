//! Durable result store for evosolve jobs.
//!
//! Jobs, their per-generation phase records, append-only LLM telemetry, the
//! delayed task queue, and the shared enrichment cache all live in
//! PostgreSQL. Writers use column-level updates so concurrent phase workers
//! and the orchestrator never clobber each other's fields.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
