//! The evosolve engine: orchestrator state machine, phase workers,
//! evolutionary scoring, LLM adapter, and task-queue adapter.
//!
//! The engine is re-entrant by construction. All state lives in the result
//! store; orchestrator and worker invocations read it, act once, and write
//! back, so any invocation can be replayed or resumed after a crash.

pub mod error;
pub mod evolve;
pub mod llm;
pub mod orchestrator;
pub mod queue;
pub mod submit;
pub mod worker;
