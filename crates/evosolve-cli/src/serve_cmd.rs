use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use tower_http::cors::CorsLayer;

use evosolve_core::error::EngineError;
use evosolve_core::llm::{HttpLlmClient, LlmClient};
use evosolve_core::orchestrator;
use evosolve_core::queue::auth::{DispatchAuth, SIGNATURE_HEADER};
use evosolve_core::queue::dispatcher::{Dispatcher, DispatcherConfig};
use evosolve_core::queue::{OrchestrateTask, PgTaskQueue, WorkerTask};
use evosolve_core::submit;
use evosolve_core::worker::{PhaseOutcome, WorkerContext, handle_task};
use evosolve_db::models::{EnricherMode, EvolutionConfig, Preferences};
use evosolve_db::queries::jobs;

use crate::config::EvosolveConfig;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }

    fn from_engine(err: EngineError) -> Self {
        match &err {
            EngineError::Validation(msg) => Self::bad_request(msg.clone()),
            _ => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: format!("[{}] {err}", err.kind()),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// State & request types
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub queue: PgTaskQueue,
    pub llm: Arc<dyn LlmClient>,
    pub auth: DispatchAuth,
    pub enricher_concurrency: usize,
    pub default_model: String,
}

/// Submission body. Everything except the problem description is optional
/// and falls back to service defaults.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest {
    problem_context: String,
    preferences: Option<Preferences>,
    #[serde(default)]
    evolution_config: EvolutionConfigRequest,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct EvolutionConfigRequest {
    generations: Option<u32>,
    population_size: Option<u32>,
    top_select_count: Option<u32>,
    offspring_ratio: Option<f64>,
    diversification_factor: Option<f64>,
    model: Option<String>,
    enricher_mode: Option<EnricherMode>,
    reenrich_carried: Option<bool>,
}

fn default_preferences() -> Preferences {
    Preferences {
        max_capex: 10.0,
        min_profits: 1.0,
        target_return: 3.0,
        timeline_months: 36,
    }
}

impl EvolutionConfigRequest {
    fn resolve(self, default_model: &str) -> EvolutionConfig {
        EvolutionConfig {
            generations: self.generations.unwrap_or(3),
            population_size: self.population_size.unwrap_or(8),
            top_select_count: self.top_select_count.unwrap_or(3),
            offspring_ratio: self.offspring_ratio.unwrap_or(0.7),
            diversification_factor: self.diversification_factor.unwrap_or(0.05),
            model: self.model.unwrap_or_else(|| default_model.to_owned()),
            enricher_mode: self.enricher_mode.unwrap_or_default(),
            reenrich_carried: self.reenrich_carried.unwrap_or(false),
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/jobs", post(submit_job_handler))
        .route("/jobs/{id}", get(get_job_handler))
        .route("/jobs/{id}/results", get(get_results_handler))
        .route("/orchestrate", post(orchestrate_handler))
        .route("/worker", post(worker_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Options for the serve command.
pub struct ServeOptions {
    pub bind: String,
    pub port: u16,
    pub no_dispatcher: bool,
}

pub async fn run_serve(pool: PgPool, config: &EvosolveConfig, options: &ServeOptions) -> Result<()> {
    let llm = HttpLlmClient::new(config.llm_config.clone())
        .map_err(|e| anyhow::anyhow!("failed to build llm client: {e}"))?;

    let state = AppState {
        pool: pool.clone(),
        queue: PgTaskQueue::new(pool.clone()),
        llm: Arc::new(llm),
        auth: config.dispatch_auth.clone(),
        enricher_concurrency: config.enricher_concurrency,
        default_model: config.default_model.clone(),
    };

    // The dispatcher delivers queued tasks back into this process's own
    // endpoints. Disable it when a separate dispatcher process handles the
    // queue.
    let dispatcher_handle = if options.no_dispatcher {
        None
    } else {
        let dispatcher_config = DispatcherConfig {
            orchestrate_url: format!("http://127.0.0.1:{}/orchestrate", options.port),
            worker_url: format!("http://127.0.0.1:{}/worker", options.port),
            ..Default::default()
        };
        let (dispatcher, handle) =
            Dispatcher::new(pool.clone(), dispatcher_config, config.dispatch_auth.clone())?;
        tokio::spawn(async move {
            if let Err(e) = dispatcher.run().await {
                tracing::error!(error = %e, "dispatcher exited with error");
            }
        });
        Some(handle)
    };

    let app = build_router(state);
    let addr: SocketAddr = format!("{}:{}", options.bind, options.port).parse()?;
    tracing::info!("evosolve serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = dispatcher_handle {
        handle.shutdown();
    }
    tracing::info!("evosolve serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn submit_job_handler(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<axum::response::Response, AppError> {
    let preferences = request.preferences.unwrap_or_else(default_preferences);
    let config = request.evolution_config.resolve(&state.default_model);

    let job = submit::submit_job(
        &state.pool,
        &state.queue,
        None,
        &request.problem_context,
        &preferences,
        config,
    )
    .await
    .map_err(AppError::from_engine)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"jobId": job.id, "status": job.status})),
    )
        .into_response())
}

async fn get_job_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<axum::response::Response, AppError> {
    let document = jobs::load_job_document(&state.pool, &id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("job {id} not found")))?;

    Ok(Json(document).into_response())
}

async fn get_results_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<axum::response::Response, AppError> {
    let job = jobs::get_job(&state.pool, &id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("job {id} not found")))?;

    Ok(Json(json!({
        "jobId": job.id,
        "status": job.status,
        "topSolutions": job.top_solutions.map(|j| j.0),
        "allSolutions": job.all_solutions.map(|j| j.0),
        "generationHistory": job.generation_history.map(|j| j.0),
        "error": job.error,
    }))
    .into_response())
}

async fn orchestrate_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<axum::response::Response, AppError> {
    verify_signature(&state.auth, &headers, &body)?;

    let task: OrchestrateTask = serde_json::from_slice(&body)
        .map_err(|e| AppError::bad_request(format!("invalid orchestrate payload: {e}")))?;

    let decision = orchestrator::orchestrate(
        &state.pool,
        &state.queue,
        &task.job_id,
        task.check_attempt,
    )
    .await
    .map_err(AppError::internal)?;

    Ok(Json(decision).into_response())
}

async fn worker_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<axum::response::Response, AppError> {
    verify_signature(&state.auth, &headers, &body)?;

    let task: WorkerTask = serde_json::from_slice(&body)
        .map_err(|e| AppError::bad_request(format!("invalid worker payload: {e}")))?;

    let ctx = WorkerContext {
        pool: &state.pool,
        llm: state.llm.as_ref(),
        enricher_concurrency: state.enricher_concurrency,
    };
    let outcome = handle_task(&ctx, &task)
        .await
        .map_err(AppError::from_engine)?;

    let status = match outcome {
        PhaseOutcome::Completed => "completed",
        PhaseOutcome::Skipped => "skipped",
    };
    Ok(Json(json!({"status": status})).into_response())
}

fn verify_signature(
    auth: &DispatchAuth,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<(), AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::unauthorized("missing dispatch signature"))?;

    auth.verify(body, signature)
        .map_err(|e| AppError::unauthorized(format!("bad dispatch signature: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use evosolve_core::llm::{LlmRequest, LlmResponse};
    use evosolve_db::models::Idea;
    use evosolve_db::queries::{generations, queue};
    use evosolve_test_utils::{create_test_db, drop_test_db};

    /// A provider that must never be reached; replay-safe handlers skip it.
    struct NullLlm;

    #[async_trait]
    impl LlmClient for NullLlm {
        async fn complete(&self, _request: &LlmRequest) -> Result<LlmResponse, EngineError> {
            Err(EngineError::Internal(
                "the test LLM must not be called".to_owned(),
            ))
        }
    }

    fn test_state(pool: PgPool) -> AppState {
        AppState {
            pool: pool.clone(),
            queue: PgTaskQueue::new(pool),
            llm: Arc::new(NullLlm),
            auth: DispatchAuth::new(b"serve-test-secret".to_vec()),
            enricher_concurrency: 4,
            default_model: "test-model".to_owned(),
        }
    }

    async fn send_json(
        state: AppState,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
        sign: bool,
    ) -> axum::response::Response {
        let app = build_router(state.clone());
        let body_bytes = body.map(|b| b.to_string()).unwrap_or_default();

        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        if sign {
            builder = builder.header(SIGNATURE_HEADER, state.auth.sign(body_bytes.as_bytes()));
        }
        app.oneshot(builder.body(Body::from(body_bytes)).unwrap())
            .await
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn submit_creates_pending_job_and_first_check() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone());

        let resp = send_json(
            state,
            "POST",
            "/jobs",
            Some(json!({
                "problemContext": "Generate simple coffee shop business ideas",
                "evolutionConfig": {"generations": 1, "populationSize": 3, "topSelectCount": 1},
            })),
            false,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "pending");
        let job_id = body["jobId"].as_str().unwrap().to_owned();

        let job = jobs::get_job(&pool, &job_id).await.unwrap().unwrap();
        assert_eq!(job.evolution_config.0.population_size, 3);
        assert_eq!(job.evolution_config.0.model, "test-model");

        // The first orchestrator check is queued.
        assert_eq!(queue::pending_count(&pool).await.unwrap(), 1);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn submit_rejects_short_problem() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone());

        let resp = send_json(
            state,
            "POST",
            "/jobs",
            Some(json!({"problemContext": "too short"})),
            false,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn job_read_through_returns_document() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone());

        let resp = send_json(
            state.clone(),
            "POST",
            "/jobs",
            Some(json!({"problemContext": "Generate simple coffee shop business ideas"})),
            false,
        )
        .await;
        let job_id = body_json(resp).await["jobId"].as_str().unwrap().to_owned();

        let resp = send_json(state, "GET", &format!("/jobs/{job_id}"), None, false).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let doc = body_json(resp).await;
        assert_eq!(doc["jobId"], job_id.as_str());
        assert_eq!(doc["status"], "pending");
        assert_eq!(doc["currentPhase"], "variator");
        assert!(doc["problemContext"].as_str().unwrap().contains("coffee"));
        assert!(doc.get("apiCalls").is_some());

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn missing_job_is_404() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone());

        let resp = send_json(state.clone(), "GET", "/jobs/nope", None, false).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = send_json(state, "GET", "/jobs/nope/results", None, false).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn orchestrate_requires_signature() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone());

        let resp = send_json(
            state,
            "POST",
            "/orchestrate",
            Some(json!({"jobId": "job-x", "checkAttempt": 0})),
            false,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn signed_orchestrate_reports_its_action() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone());

        let resp = send_json(
            state.clone(),
            "POST",
            "/jobs",
            Some(json!({"problemContext": "Generate simple coffee shop business ideas"})),
            false,
        )
        .await;
        let job_id = body_json(resp).await["jobId"].as_str().unwrap().to_owned();

        let resp = send_json(
            state,
            "POST",
            "/orchestrate",
            Some(json!({"jobId": job_id, "checkAttempt": 0})),
            true,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["action"], "create-task");
        assert_eq!(body["phase"], "variator");
        assert_eq!(body["generation"], 1);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn replayed_worker_task_returns_200_without_llm_call() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone());

        let resp = send_json(
            state.clone(),
            "POST",
            "/jobs",
            Some(json!({
                "problemContext": "Generate simple coffee shop business ideas",
                "evolutionConfig": {"generations": 1, "populationSize": 2, "topSelectCount": 1},
            })),
            false,
        )
        .await;
        let job_id = body_json(resp).await["jobId"].as_str().unwrap().to_owned();

        // Variator already complete in the store.
        generations::ensure_generation(&pool, &job_id, 1).await.unwrap();
        let ideas: Vec<Idea> = (1..=2)
            .map(|n| Idea {
                idea_id: format!("VAR_GEN1_{n:03}"),
                title: format!("Idea {n}"),
                description: "d".into(),
                core_mechanism: "m".into(),
                is_offspring: false,
            })
            .collect();
        generations::save_variator_results(&pool, &job_id, 1, &ideas)
            .await
            .unwrap();

        // Redelivery: 200 with "skipped"; the NullLlm proves no model call.
        let job = jobs::get_job(&pool, &job_id).await.unwrap().unwrap();
        let resp = send_json(
            state,
            "POST",
            "/worker",
            Some(json!({
                "jobId": job_id,
                "type": "variator",
                "generation": 1,
                "evolutionConfig": serde_json::to_value(&job.evolution_config.0).unwrap(),
                "problemContext": job.problem_context,
                "attempt": 0,
            })),
            true,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "skipped");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn worker_with_bad_signature_is_rejected() {
        let (pool, db_name) = create_test_db().await;
        let state = test_state(pool.clone());
        let app = build_router(state);

        let body = json!({"jobId": "job-x", "type": "variator", "generation": 1,
            "evolutionConfig": {"generations": 1, "populationSize": 1, "topSelectCount": 1,
                "offspringRatio": 0.5, "diversificationFactor": 0.05, "model": "m"},
            "problemContext": "p", "attempt": 0})
        .to_string();
        let request = Request::builder()
            .method("POST")
            .uri("/worker")
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, "00".repeat(32))
            .body(Body::from(body))
            .unwrap();
        let resp = app.oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
