//! The queue dispatcher: polls for due tasks and POSTs them to the
//! orchestrator / worker endpoints.
//!
//! Delivery is at-least-once. A non-2xx response or transport failure
//! releases the task for redelivery with exponential backoff until its
//! attempt budget runs out. The handle exposes pause/resume as the queue's
//! back-pressure signal.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use evosolve_db::models::{QueueTaskRow, TaskKind};
use evosolve_db::queries::queue;

use crate::queue::auth::{DispatchAuth, SIGNATURE_HEADER};

/// Configuration for the dispatcher loop.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Endpoint receiving `orchestrate` tasks.
    pub orchestrate_url: String,
    /// Endpoint receiving `worker` tasks.
    pub worker_url: String,
    /// How often to poll for due tasks when idle.
    pub poll_interval: Duration,
    /// Maximum tasks claimed per poll.
    pub batch_size: i64,
    /// Per-request timeout. Worker tasks block on LLM calls, so this must
    /// comfortably exceed the phase's LLM deadline.
    pub request_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            orchestrate_url: "http://127.0.0.1:8080/orchestrate".to_owned(),
            worker_url: "http://127.0.0.1:8080/worker".to_owned(),
            poll_interval: Duration::from_millis(500),
            batch_size: 16,
            request_timeout: Duration::from_secs(330),
        }
    }
}

/// Control handle for a running dispatcher.
#[derive(Clone)]
pub struct DispatcherHandle {
    pause_tx: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl DispatcherHandle {
    /// Stop delivering tasks until [`resume`](Self::resume) is called.
    /// Already-claimed tasks finish their in-flight delivery.
    pub fn pause(&self) {
        let _ = self.pause_tx.send(true);
    }

    /// Resume delivery after a pause.
    pub fn resume(&self) {
        let _ = self.pause_tx.send(false);
    }

    /// Shut the dispatcher down.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// The dispatcher loop.
pub struct Dispatcher {
    pool: PgPool,
    config: DispatcherConfig,
    auth: DispatchAuth,
    client: reqwest::Client,
    pause_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// Build a dispatcher and its control handle.
    pub fn new(
        pool: PgPool,
        config: DispatcherConfig,
        auth: DispatchAuth,
    ) -> Result<(Self, DispatcherHandle)> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let (pause_tx, pause_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        let handle = DispatcherHandle {
            pause_tx,
            cancel: cancel.clone(),
        };
        let dispatcher = Self {
            pool,
            config,
            auth,
            client,
            pause_rx,
            cancel,
        };
        Ok((dispatcher, handle))
    }

    /// Run until shut down via the handle.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(
            orchestrate_url = %self.config.orchestrate_url,
            worker_url = %self.config.worker_url,
            "dispatcher started"
        );

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("dispatcher shutting down");
                return Ok(());
            }

            // Honour the back-pressure signal.
            if *self.pause_rx.borrow() {
                tokio::select! {
                    _ = self.pause_rx.changed() => continue,
                    _ = self.cancel.cancelled() => continue,
                }
            }

            let claimed = queue::claim_due(&self.pool, self.config.batch_size).await?;
            let drained = !claimed.is_empty();

            for task in claimed {
                self.deliver(task).await;
            }

            if !drained {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = self.cancel.cancelled() => continue,
                }
            }
        }
    }

    /// Deliver one task; failures reschedule or park it.
    async fn deliver(&self, task: QueueTaskRow) {
        let url = match task.kind {
            TaskKind::Orchestrate => &self.config.orchestrate_url,
            TaskKind::Worker => &self.config.worker_url,
        };

        let body = task.payload.0.to_string();
        let signature = self.auth.sign(body.as_bytes());

        let outcome = self
            .client
            .post(url)
            .header(SIGNATURE_HEADER, signature)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await;

        match outcome {
            Ok(resp) if resp.status().is_success() => {
                if let Err(e) = queue::mark_completed(&self.pool, task.id).await {
                    tracing::warn!(task_id = %task.id, error = %e, "failed to mark task completed");
                }
            }
            Ok(resp) => {
                let status = resp.status();
                self.handle_failure(&task, &format!("endpoint returned {status}"))
                    .await;
            }
            Err(e) => {
                self.handle_failure(&task, &format!("delivery failed: {e}"))
                    .await;
            }
        }
    }

    async fn handle_failure(&self, task: &QueueTaskRow, error: &str) {
        let next_attempt = task.attempt + 1;
        if next_attempt >= task.max_attempts {
            tracing::warn!(
                task_id = %task.id,
                kind = %task.kind,
                attempts = next_attempt,
                error,
                "task exhausted its delivery attempts"
            );
            if let Err(e) = queue::mark_exhausted(&self.pool, task.id, error).await {
                tracing::warn!(task_id = %task.id, error = %e, "failed to park dead task");
            }
            return;
        }

        let delay = redelivery_delay(next_attempt);
        let next_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        tracing::info!(
            task_id = %task.id,
            kind = %task.kind,
            attempt = next_attempt,
            delay_ms = delay.as_millis() as u64,
            error,
            "redelivering task"
        );
        if let Err(e) = queue::mark_failed_retry(&self.pool, task.id, error, next_at).await {
            tracing::warn!(task_id = %task.id, error = %e, "failed to reschedule task");
        }
    }
}

/// Exponential redelivery backoff: `2^attempt` seconds, capped at one minute.
fn redelivery_delay(attempt: i32) -> Duration {
    let secs = 2u64.saturating_pow(attempt.max(0) as u32).min(60);
    Duration::from_secs(secs)
}
