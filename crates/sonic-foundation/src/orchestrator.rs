//! Job orchestrator
//!
//! Drives one request through its lifecycle:
//!
//! ```text
//! Received → Validated → Staged → Queued → Executing → Succeeded | Failed
//! ```
//!
//! Every failure is converted into a [`JobResult::Failure`]; `handle` never
//! returns an error and never panics on bad input. The execution ticket and
//! the staged media move into the blocking pipeline task, so a caller that
//! stops waiting cannot release the accelerator while the run is still on it.

use base64::Engine;
use futures::future::join_all;
use serde_json::Value;
use sonic_kernel::config::{LimitsConfig, WebhookConfig, WorkerConfig};
use sonic_kernel::error::{ErrorKind, InferenceError, JobError, StagingError};
use sonic_kernel::job::{JobRequest, JobResult, JobState, OutputArtifact};
use sonic_kernel::model::VideoEncoder;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, error, info, info_span, warn};

use crate::encode::FfmpegEncoder;
use crate::gate::{ExecutionGate, GateStats};
use crate::pipeline::InferencePipeline;
use crate::registry::ModelRegistry;
use crate::staging::MediaStager;
use crate::webhook::{Notifier, WebhookError, WebhookNotifier};

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),
}

fn transition(from: JobState, to: JobState) {
    info!(from = %from, to = %to, terminal = to.is_terminal(), "Job state changed");
}

pub struct JobOrchestrator {
    limits: LimitsConfig,
    webhook: WebhookConfig,
    registry: Arc<ModelRegistry>,
    stager: MediaStager,
    gate: Arc<ExecutionGate>,
    pipeline: Arc<InferencePipeline>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl JobOrchestrator {
    /// Orchestrator with the ffmpeg encoder and HTTP webhook notifier.
    pub fn from_config(
        config: &WorkerConfig,
        registry: Arc<ModelRegistry>,
    ) -> Result<Self, SetupError> {
        let encoder = Arc::new(FfmpegEncoder::new(&config.pipeline));
        let notifier = Arc::new(WebhookNotifier::new(&config.webhook)?);
        Ok(Self::new(config, registry, encoder)?.with_notifier(notifier))
    }

    /// Orchestrator around an injected encoder. No webhooks are sent until a
    /// notifier is attached.
    pub fn new(
        config: &WorkerConfig,
        registry: Arc<ModelRegistry>,
        encoder: Arc<dyn VideoEncoder>,
    ) -> Result<Self, StagingError> {
        Ok(Self {
            limits: config.limits.clone(),
            webhook: config.webhook.clone(),
            registry,
            stager: MediaStager::new(config.staging.clone(), config.limits.clone())?,
            gate: Arc::new(ExecutionGate::new(&config.gate)),
            pipeline: Arc::new(InferencePipeline::new(config.pipeline.clone(), encoder)),
            notifier: None,
        })
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn gate(&self) -> &Arc<ExecutionGate> {
        &self.gate
    }

    pub fn gate_stats(&self) -> GateStats {
        self.gate.stats()
    }

    /// Process one raw request to its terminal result.
    pub async fn handle(&self, raw: Value) -> JobResult {
        self.handle_with_cancel(raw, &CancellationToken::new()).await
    }

    /// Like [`JobOrchestrator::handle`]; `cancel` withdraws the job while it
    /// waits for the accelerator. Once executing it runs to completion.
    pub async fn handle_with_cancel(&self, raw: Value, cancel: &CancellationToken) -> JobResult {
        let raw_id = raw
            .pointer("/input/job_id")
            .or_else(|| raw.get("id"))
            .and_then(Value::as_str)
            .map(str::to_owned);

        let request = match JobRequest::from_raw(raw, &self.limits) {
            Ok(request) => request,
            Err(e) => {
                warn!(job_id = raw_id.as_deref().unwrap_or("-"), error = %e, "Request rejected");
                return JobResult::failure(raw_id, &JobError::from(e));
            }
        };

        let span = info_span!("job", job_id = %request.id);
        async {
            let start = Instant::now();
            transition(JobState::Received, JobState::Validated);

            let result = match self.execute(&request, cancel).await {
                Ok(artifact) => {
                    info!(
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        path = %artifact.video_path.display(),
                        "Job succeeded"
                    );
                    transition(JobState::Executing, JobState::Succeeded);
                    JobResult::Success(artifact)
                }
                Err(e) => {
                    error!(
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        kind = %e.kind(),
                        error = %e,
                        "Job failed"
                    );
                    info!(
                        to = %JobState::Failed,
                        terminal = JobState::Failed.is_terminal(),
                        "Job state changed"
                    );
                    JobResult::failure(Some(request.id.clone()), &e)
                }
            };

            if let (Some(target), Some(notifier)) = (&request.webhook, &self.notifier) {
                // delivery failures are already logged by the notifier
                let _ = notifier.notify(target, &result).await;
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Run many requests concurrently; results come back in input order.
    pub async fn handle_all(&self, raws: Vec<Value>) -> Vec<JobResult> {
        join_all(raws.into_iter().map(|raw| self.handle(raw))).await
    }

    async fn execute(
        &self,
        request: &JobRequest,
        cancel: &CancellationToken,
    ) -> Result<OutputArtifact, JobError> {
        // inputs first: a bad reference never touches the accelerator
        let staged = self.stager.stage(request).await?;
        let bundle = self.registry.ensure_loaded().await?;
        let staged = staged
            .conform_sample_rate(bundle.audio_encoder.sample_rate())
            .await?;
        transition(JobState::Validated, JobState::Staged);
        let params = request
            .params
            .resolve_duration(staged.audio_secs(), self.limits.max_duration_secs);

        transition(JobState::Staged, JobState::Queued);
        let ticket = self
            .gate
            .admit_cancellable(&request.id, self.gate.default_timeout(), cancel)
            .await?;
        transition(JobState::Queued, JobState::Executing);

        let pipeline = Arc::clone(&self.pipeline);
        let span = Span::current();
        let task = tokio::task::spawn_blocking(move || {
            let _enter = span.enter();
            let mut staged = staged;
            let result = pipeline.run(&staged, &params, &bundle);
            staged.release();
            if let Err(e) = &result {
                if e.kind() == ErrorKind::ResourceExhausted {
                    warn!(device = %bundle.device, "Reclaiming accelerator memory");
                    bundle.accelerator.reclaim();
                }
            }
            drop(ticket);
            result
        });
        let mut artifact = task
            .await
            .map_err(|e| InferenceError::Aborted(e.to_string()))??;

        if self.webhook.include_video_base64 {
            match tokio::fs::read(&artifact.video_path).await {
                Ok(bytes) => {
                    artifact.video_base64 =
                        Some(base64::engine::general_purpose::STANDARD.encode(bytes));
                }
                Err(e) => warn!(
                    path = %artifact.video_path.display(),
                    error = %e,
                    "Could not inline output video"
                ),
            }
        }
        Ok(artifact)
    }
}

impl std::fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("registry", &self.registry.state())
            .field("gate", &self.gate.stats())
            .field("webhooks", &self.notifier.is_some())
            .finish()
    }
}
