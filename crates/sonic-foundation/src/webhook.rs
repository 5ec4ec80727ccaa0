//! Terminal-state notifications
//!
//! When a request names a webhook, the orchestrator POSTs one JSON document
//! after the job has finished. Delivery is best effort: failures are logged
//! and never change the job's result.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use sonic_kernel::config::WebhookConfig;
use sonic_kernel::job::{JobResult, WebhookTarget};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook request failed: {0}")]
    Request(String),

    #[error("webhook endpoint answered {status}")]
    Status { status: u16 },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver the terminal notification for `result` to `target`.
    async fn notify(&self, target: &WebhookTarget, result: &JobResult) -> Result<(), WebhookError>;
}

/// Notification body for `result`. The id echoed back prefers the one
/// supplied in `webhook_data`.
pub fn payload(target: &WebhookTarget, result: &JobResult) -> Value {
    match result {
        JobResult::Success(artifact) => {
            let mut body = json!({
                "job_id": target.job_id.as_deref().unwrap_or(&artifact.job_id),
                "status": "completed",
                "output_path": artifact.video_path,
                "metadata": {
                    "file_size": artifact.file_size_bytes,
                    "duration_secs": artifact.duration_secs,
                    "frame_count": artifact.frame_count,
                    "seed": artifact.seed,
                    "face_detected": artifact.face_detected,
                    "completed_at": artifact.completed_at,
                },
            });
            if let Some(video) = &artifact.video_base64 {
                body["video_base64"] = Value::String(video.clone());
            }
            body
        }
        JobResult::Failure {
            job_id,
            error_kind,
            error,
        } => json!({
            "job_id": target.job_id.as_deref().or(job_id.as_deref()),
            "status": "failed",
            "error_kind": error_kind,
            "error": error,
        }),
    }
}

pub struct WebhookNotifier {
    client: Client,
}

impl WebhookNotifier {
    pub fn new(config: &WebhookConfig) -> Result<Self, WebhookError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| WebhookError::Request(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, target: &WebhookTarget, result: &JobResult) -> Result<(), WebhookError> {
        let mut request = self.client.post(&target.url).json(&payload(target, result));
        if let Some(key) = target.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            warn!(url = %target.url, error = %e, "Webhook delivery failed");
            WebhookError::Request(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = %target.url, status = status.as_u16(), "Webhook rejected");
            return Err(WebhookError::Status {
                status: status.as_u16(),
            });
        }
        debug!(url = %target.url, status = status.as_u16(), "Webhook delivered");
        Ok(())
    }
}
