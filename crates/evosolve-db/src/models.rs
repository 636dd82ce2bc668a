use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Whether the job has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for JobStatus {
    type Err = JobStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(JobStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`JobStatus`] string.
#[derive(Debug, Clone)]
pub struct JobStatusParseError(pub String);

impl fmt::Display for JobStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid job status: {:?}", self.0)
    }
}

impl std::error::Error for JobStatusParseError {}

// ---------------------------------------------------------------------------

/// One of the three phases within a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Variator,
    Enricher,
    Ranker,
}

impl Phase {
    /// Phases in execution order.
    pub const ALL: [Phase; 3] = [Phase::Variator, Phase::Enricher, Phase::Ranker];

    /// The phase that follows this one within a generation, if any.
    pub fn next(self) -> Option<Phase> {
        match self {
            Self::Variator => Some(Self::Enricher),
            Self::Enricher => Some(Self::Ranker),
            Self::Ranker => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Variator => "variator",
            Self::Enricher => "enricher",
            Self::Ranker => "ranker",
        };
        f.write_str(s)
    }
}

impl FromStr for Phase {
    type Err = PhaseParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "variator" => Ok(Self::Variator),
            "enricher" => Ok(Self::Enricher),
            "ranker" => Ok(Self::Ranker),
            other => Err(PhaseParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Phase`] string.
#[derive(Debug, Clone)]
pub struct PhaseParseError(pub String);

impl fmt::Display for PhaseParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid phase: {:?}", self.0)
    }
}

impl std::error::Error for PhaseParseError {}

// ---------------------------------------------------------------------------

/// How the enricher executes: one batched LLM call for the whole population,
/// or one bounded-concurrency call per idea.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnricherMode {
    #[default]
    Batch,
    PerIdea,
}

impl fmt::Display for EnricherMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Batch => "batch",
            Self::PerIdea => "per_idea",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------

/// Kind of queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Orchestrate,
    Worker,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Orchestrate => "orchestrate",
            Self::Worker => "worker",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskKind {
    type Err = TaskKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "orchestrate" => Ok(Self::Orchestrate),
            "worker" => Ok(Self::Worker),
            other => Err(TaskKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskKind`] string.
#[derive(Debug, Clone)]
pub struct TaskKindParseError(pub String);

impl fmt::Display for TaskKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task kind: {:?}", self.0)
    }
}

impl std::error::Error for TaskKindParseError {}

// ---------------------------------------------------------------------------
// Domain records (persisted as JSONB; field names are the wire contract)
// ---------------------------------------------------------------------------

/// Submitter preferences. Monetary values are millions USD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    pub max_capex: f64,
    pub min_profits: f64,
    pub target_return: f64,
    pub timeline_months: u32,
}

/// Evolution parameters for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionConfig {
    pub generations: u32,
    pub population_size: u32,
    pub top_select_count: u32,
    pub offspring_ratio: f64,
    pub diversification_factor: f64,
    pub model: String,
    #[serde(default)]
    pub enricher_mode: EnricherMode,
    /// When true, top performers carried into the next generation are
    /// re-enriched instead of keeping their prior business case.
    #[serde(default)]
    pub reenrich_carried: bool,
}

/// A raw idea as produced by the variator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Idea {
    pub idea_id: String,
    pub title: String,
    pub description: String,
    pub core_mechanism: String,
    pub is_offspring: bool,
}

/// Business-case projection attached by the enricher. Monetary values are
/// millions USD; `yearly_cashflows` always holds five entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessCase {
    pub npv_success: f64,
    pub capex_est: f64,
    pub timeline_months: f64,
    pub likelihood: f64,
    pub risk_factors: Vec<String>,
    pub yearly_cashflows: Vec<f64>,
}

/// An idea with its business case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedIdea {
    #[serde(flatten)]
    pub idea: Idea,
    pub business_case: BusinessCase,
}

/// A fully scored and ranked idea.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredIdea {
    #[serde(flatten)]
    pub enriched: EnrichedIdea,
    pub score: f64,
    pub rank: u32,
    #[serde(rename = "violatesPreferences", default)]
    pub violates_preferences: bool,
    #[serde(
        rename = "preferenceNote",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub preference_note: Option<String>,
}

impl ScoredIdea {
    pub fn idea_id(&self) -> &str {
        &self.enriched.idea.idea_id
    }
}

/// Per-generation summary scalars kept in the completed job's
/// `generationHistory`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationSummary {
    pub generation: u32,
    pub top_score: f64,
    pub avg_score: f64,
    pub idea_count: u32,
    pub best_idea_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A job -- the root durable entity.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: String,
    pub status: JobStatus,
    pub problem_context: String,
    pub preferences: Json<Preferences>,
    pub evolution_config: Json<EvolutionConfig>,
    pub current_generation: i32,
    pub current_phase: Phase,
    pub top_solutions: Option<Json<Vec<ScoredIdea>>>,
    pub all_solutions: Option<Json<Vec<ScoredIdea>>>,
    pub generation_history: Option<Json<Vec<GenerationSummary>>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One generation's phase tracking and payloads.
#[derive(Debug, Clone, FromRow)]
pub struct GenerationRow {
    pub job_id: String,
    pub generation: i32,

    pub variator_started: bool,
    pub variator_started_at: Option<DateTime<Utc>>,
    pub variator_complete: bool,
    pub variator_completed_at: Option<DateTime<Utc>>,
    pub variator_error: Option<String>,
    pub variator_attempt: i32,

    pub enricher_started: bool,
    pub enricher_started_at: Option<DateTime<Utc>>,
    pub enricher_complete: bool,
    pub enricher_completed_at: Option<DateTime<Utc>>,
    pub enricher_error: Option<String>,
    pub enricher_parse_failure: bool,
    pub enricher_attempt: i32,

    pub ranker_started: bool,
    pub ranker_started_at: Option<DateTime<Utc>>,
    pub ranker_complete: bool,
    pub ranker_completed_at: Option<DateTime<Utc>>,
    pub ranker_error: Option<String>,
    pub ranker_attempt: i32,

    pub ideas: Option<Json<Vec<Idea>>>,
    pub enriched_ideas: Option<Json<Vec<EnrichedIdea>>>,
    pub solutions: Option<Json<Vec<ScoredIdea>>>,
    pub top_performers: Option<Json<Vec<ScoredIdea>>>,
    pub top_score: Option<f64>,
    pub avg_score: Option<f64>,
    pub generation_complete: bool,

    pub created_at: DateTime<Utc>,
}

impl GenerationRow {
    /// Whether the given phase has been marked started.
    pub fn phase_started(&self, phase: Phase) -> bool {
        match phase {
            Phase::Variator => self.variator_started,
            Phase::Enricher => self.enricher_started,
            Phase::Ranker => self.ranker_started,
        }
    }

    /// The timestamp at which the given phase was marked started.
    pub fn phase_started_at(&self, phase: Phase) -> Option<DateTime<Utc>> {
        match phase {
            Phase::Variator => self.variator_started_at,
            Phase::Enricher => self.enricher_started_at,
            Phase::Ranker => self.ranker_started_at,
        }
    }

    /// Whether the given phase has completed.
    pub fn phase_complete(&self, phase: Phase) -> bool {
        match phase {
            Phase::Variator => self.variator_complete,
            Phase::Enricher => self.enricher_complete,
            Phase::Ranker => self.ranker_complete,
        }
    }

    /// The attempt counter for the given phase (bumped on every reset).
    pub fn phase_attempt(&self, phase: Phase) -> i32 {
        match phase {
            Phase::Variator => self.variator_attempt,
            Phase::Enricher => self.enricher_attempt,
            Phase::Ranker => self.ranker_attempt,
        }
    }

    /// The recorded error for the given phase, if any.
    pub fn phase_error(&self, phase: Phase) -> Option<&str> {
        match phase {
            Phase::Variator => self.variator_error.as_deref(),
            Phase::Enricher => self.enricher_error.as_deref(),
            Phase::Ranker => self.ranker_error.as_deref(),
        }
    }
}

/// Append-only telemetry for one LLM call.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ApiCallRow {
    pub id: i64,
    pub job_id: String,
    pub call_id: String,
    pub phase: Phase,
    pub generation: i32,
    pub attempt: i32,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub duration_ms: i64,
    pub recorded_at: DateTime<Utc>,
}

/// Full prompt/response blob for one LLM call (the debug subcollection).
#[derive(Debug, Clone, FromRow)]
pub struct ApiDebugRow {
    pub call_id: String,
    pub job_id: String,
    pub phase: Phase,
    pub generation: i32,
    pub attempt: i32,
    pub prompt: String,
    pub raw_response: String,
    pub parsed_response: Option<Json<serde_json::Value>>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub duration_ms: i64,
    pub recorded_at: DateTime<Utc>,
}

/// A queued task awaiting delayed dispatch.
#[derive(Debug, Clone, FromRow)]
pub struct QueueTaskRow {
    pub id: Uuid,
    pub kind: TaskKind,
    pub payload: Json<serde_json::Value>,
    pub idempotency_key: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub attempt: i32,
    pub max_attempts: i32,
    pub locked_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A write-once enrichment cache entry keyed by content hash.
#[derive(Debug, Clone, FromRow)]
pub struct CacheEntryRow {
    pub cache_key: String,
    pub business_case: Json<BusinessCase>,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Document views (the wire shape of a job for read-through)
// ---------------------------------------------------------------------------

/// One generation as exposed over HTTP.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationDocument {
    pub variator_started: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variator_started_at: Option<DateTime<Utc>>,
    pub variator_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variator_completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variator_error: Option<String>,

    pub enricher_started: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enricher_started_at: Option<DateTime<Utc>>,
    pub enricher_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enricher_completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enricher_error: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub enricher_parse_failure: bool,

    pub ranker_started: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ranker_started_at: Option<DateTime<Utc>>,
    pub ranker_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ranker_completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ranker_error: Option<String>,

    pub ideas: Vec<Idea>,
    pub enriched_ideas: Vec<EnrichedIdea>,
    pub solutions: Vec<ScoredIdea>,
    pub top_performers: Vec<ScoredIdea>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_score: Option<f64>,
    pub generation_complete: bool,
}

impl From<GenerationRow> for GenerationDocument {
    fn from(row: GenerationRow) -> Self {
        Self {
            variator_started: row.variator_started,
            variator_started_at: row.variator_started_at,
            variator_complete: row.variator_complete,
            variator_completed_at: row.variator_completed_at,
            variator_error: row.variator_error,
            enricher_started: row.enricher_started,
            enricher_started_at: row.enricher_started_at,
            enricher_complete: row.enricher_complete,
            enricher_completed_at: row.enricher_completed_at,
            enricher_error: row.enricher_error,
            enricher_parse_failure: row.enricher_parse_failure,
            ranker_started: row.ranker_started,
            ranker_started_at: row.ranker_started_at,
            ranker_complete: row.ranker_complete,
            ranker_completed_at: row.ranker_completed_at,
            ranker_error: row.ranker_error,
            ideas: row.ideas.map(|j| j.0).unwrap_or_default(),
            enriched_ideas: row.enriched_ideas.map(|j| j.0).unwrap_or_default(),
            solutions: row.solutions.map(|j| j.0).unwrap_or_default(),
            top_performers: row.top_performers.map(|j| j.0).unwrap_or_default(),
            top_score: row.top_score,
            avg_score: row.avg_score,
            generation_complete: row.generation_complete,
        }
    }
}

/// Telemetry entry as exposed over HTTP.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCallEntry {
    pub call_id: String,
    pub phase: Phase,
    pub generation: i32,
    pub attempt: i32,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub duration_ms: i64,
    pub recorded_at: DateTime<Utc>,
}

impl From<ApiCallRow> for ApiCallEntry {
    fn from(row: ApiCallRow) -> Self {
        Self {
            call_id: row.call_id,
            phase: row.phase,
            generation: row.generation,
            attempt: row.attempt,
            model: row.model,
            prompt_tokens: row.prompt_tokens,
            completion_tokens: row.completion_tokens,
            duration_ms: row.duration_ms,
            recorded_at: row.recorded_at,
        }
    }
}

/// The full job document assembled for read-through.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDocument {
    pub job_id: String,
    pub status: JobStatus,
    pub problem_context: String,
    pub preferences: Preferences,
    pub evolution_config: EvolutionConfig,
    pub current_generation: i32,
    pub current_phase: Phase,
    /// Keyed by generation number rendered as a string.
    pub generations: std::collections::BTreeMap<String, GenerationDocument>,
    pub api_calls: Vec<ApiCallEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_solutions: Option<Vec<ScoredIdea>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_solutions: Option<Vec<ScoredIdea>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_history: Option<Vec<GenerationSummary>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_display_roundtrip() {
        let variants = [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: JobStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn job_status_invalid() {
        let result = "bogus".parse::<JobStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn job_status_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn phase_display_roundtrip() {
        for v in &Phase::ALL {
            let s = v.to_string();
            let parsed: Phase = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn phase_invalid() {
        let result = "mutator".parse::<Phase>();
        assert!(result.is_err());
    }

    #[test]
    fn phase_order() {
        assert_eq!(Phase::Variator.next(), Some(Phase::Enricher));
        assert_eq!(Phase::Enricher.next(), Some(Phase::Ranker));
        assert_eq!(Phase::Ranker.next(), None);
    }

    #[test]
    fn task_kind_display_roundtrip() {
        for v in &[TaskKind::Orchestrate, TaskKind::Worker] {
            let s = v.to_string();
            let parsed: TaskKind = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn preferences_serialize_camel_case() {
        let prefs = Preferences {
            max_capex: 10.0,
            min_profits: 1.0,
            target_return: 3.0,
            timeline_months: 24,
        };
        let value = serde_json::to_value(&prefs).unwrap();
        assert_eq!(value["maxCapex"], 10.0);
        assert_eq!(value["timelineMonths"], 24);
    }

    #[test]
    fn evolution_config_defaults() {
        let value = serde_json::json!({
            "generations": 2,
            "populationSize": 4,
            "topSelectCount": 2,
            "offspringRatio": 0.5,
            "diversificationFactor": 0.05,
            "model": "gpt-4.1-mini",
        });
        let config: EvolutionConfig = serde_json::from_value(value).unwrap();
        assert_eq!(config.enricher_mode, EnricherMode::Batch);
        assert!(!config.reenrich_carried);
    }

    #[test]
    fn scored_idea_flattens_wire_fields() {
        let scored = ScoredIdea {
            enriched: EnrichedIdea {
                idea: Idea {
                    idea_id: "VAR_GEN1_001".into(),
                    title: "Solar kiosks".into(),
                    description: "Prepaid solar charging kiosks".into(),
                    core_mechanism: "Franchise micro-grids".into(),
                    is_offspring: false,
                },
                business_case: BusinessCase {
                    npv_success: 4.0,
                    capex_est: 0.5,
                    timeline_months: 18.0,
                    likelihood: 0.6,
                    risk_factors: vec!["regulatory".into()],
                    yearly_cashflows: vec![-0.5, 0.2, 0.8, 1.5, 2.0],
                },
            },
            score: 0.72,
            rank: 1,
            violates_preferences: false,
            preference_note: None,
        };

        let value = serde_json::to_value(&scored).unwrap();
        assert_eq!(value["idea_id"], "VAR_GEN1_001");
        assert_eq!(value["business_case"]["capex_est"], 0.5);
        assert_eq!(value["score"], 0.72);
        assert_eq!(value["violatesPreferences"], false);
        assert!(value.get("preferenceNote").is_none());

        let back: ScoredIdea = serde_json::from_value(value).unwrap();
        assert_eq!(back, scored);
    }
}
