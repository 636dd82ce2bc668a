//! The engine error taxonomy.
//!
//! Every failure a phase task or the orchestrator can hit maps to one of
//! these kinds. The kind label is persisted into `{phase}_error` fields and
//! telemetry, so it is part of the observable contract.

use thiserror::Error;

/// Errors produced by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad inputs at submission time. Surfaced to the submitter; the job is
    /// never created.
    #[error("validation: {0}")]
    Validation(String),

    /// Timeout, network failure, or a 4xx/5xx from the LLM provider.
    #[error("llm_transport: {0}")]
    LlmTransport(String),

    /// The model's output could not be parsed into the phase schema, even
    /// after the tolerant repair passes.
    #[error("llm_parse: {0}")]
    LlmParse(String),

    /// A business case failed its numeric bounds, or scoring produced a
    /// non-finite value.
    #[error("numeric_validation: {0}")]
    NumericValidation(String),

    /// The durable store rejected a read or write.
    #[error("store: {0}")]
    Store(#[from] anyhow::Error),

    /// The orchestrator exceeded its attempt budget for a job.
    #[error("orchestration_exhausted: {0}")]
    OrchestrationExhausted(String),

    /// Anything else. Recorded with full detail for telemetry.
    #[error("internal: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable label for the error kind, used in persisted error fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::LlmTransport(_) => "llm_transport",
            Self::LlmParse(_) => "llm_parse",
            Self::NumericValidation(_) => "numeric_validation",
            Self::Store(_) => "store_write",
            Self::OrchestrationExhausted(_) => "orchestration_exhausted",
            Self::Internal(_) => "programmer",
        }
    }

    /// Whether this is a parse failure (drives the `enricher_parse_failure`
    /// flag).
    pub fn is_parse(&self) -> bool {
        matches!(self, Self::LlmParse(_))
    }
}
