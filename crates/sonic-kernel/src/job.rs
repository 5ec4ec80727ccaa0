//! Job request schema, validation and result types.
//!
//! A raw request is the serverless event shape:
//!
//! ```json
//! { "id": "job_123", "input": { "image_url": "...", "audio_path": "...", "seed": 42 } }
//! ```
//!
//! [`JobRequest::from_raw`] turns it into an immutable, fully validated
//! [`JobRequest`]. Validation has no side effects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use url::Url;

use crate::config::LimitsConfig;
use crate::error::{ErrorKind, JobError, Stage, ValidationError};

pub const DEFAULT_SAMPLING_STEPS: u32 = 20;
pub const DEFAULT_GUIDANCE_STRENGTH: f32 = 3.0;
pub const DEFAULT_DYNAMIC_SCALE: f32 = 1.0;

pub const GUIDANCE_RANGE: (f32, f32) = (0.0, 20.0);
pub const DYNAMIC_SCALE_RANGE: (f32, f32) = (0.0, 4.0);

const MAX_JOB_ID_LEN: usize = 128;

// ============================================================================
// Request
// ============================================================================

/// Where a media input comes from.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MediaSource {
    Path(PathBuf),
    Url(String),
    Base64(String),
}

impl MediaSource {
    pub fn kind(&self) -> &'static str {
        match self {
            MediaSource::Path(_) => "path",
            MediaSource::Url(_) => "url",
            MediaSource::Base64(_) => "base64",
        }
    }
}

// Inline payloads can be megabytes long; keep them out of logs.
impl std::fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaSource::Path(p) => f.debug_tuple("Path").field(p).finish(),
            MediaSource::Url(u) => f.debug_tuple("Url").field(u).finish(),
            MediaSource::Base64(b) => write!(f, "Base64(<{} chars>)", b.len()),
        }
    }
}

/// Validated generation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Requested video length. `None` means "use the audio length".
    pub duration_secs: Option<f32>,
    pub sampling_steps: u32,
    pub guidance_strength: f32,
    pub seed: u64,
    pub dynamic_scale: f32,
    /// Crop the source image to the detected face before conditioning.
    pub crop: bool,
}

impl GenerationParams {
    /// Pin the duration to the audio length when the request left it open.
    pub fn resolve_duration(mut self, audio_secs: f32, max_secs: f32) -> Self {
        if self.duration_secs.is_none() {
            self.duration_secs = Some(audio_secs.min(max_secs));
        }
        self
    }
}

/// Where to POST the terminal notification.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookTarget {
    pub url: String,
    /// Job id echoed in the notification; defaults to the request id.
    pub job_id: Option<String>,
    pub api_key: Option<String>,
}

impl std::fmt::Debug for WebhookTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookTarget")
            .field("url", &self.url)
            .field("job_id", &self.job_id)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

/// An accepted generation request. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub id: String,
    pub image: MediaSource,
    pub audio: MediaSource,
    pub params: GenerationParams,
    pub webhook: Option<WebhookTarget>,
}

/// Wire shape of a request.
#[derive(Debug, Deserialize)]
pub struct RawJobRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub input: JobInput,
}

/// Wire shape of the `input` object.
#[derive(Debug, Default, Deserialize)]
pub struct JobInput {
    /// Names the job (and its output file); takes precedence over `id`.
    pub job_id: Option<String>,
    pub image_url: Option<String>,
    pub image_path: Option<String>,
    pub image_base64: Option<String>,
    pub audio_url: Option<String>,
    pub audio_path: Option<String>,
    pub audio_base64: Option<String>,
    pub duration_seconds: Option<f64>,
    pub sampling_steps: Option<i64>,
    pub seed: Option<i64>,
    pub guidance_strength: Option<f64>,
    pub dynamic_scale: Option<f64>,
    pub crop: Option<bool>,
    pub webhook_url: Option<String>,
    pub webhook_data: Option<WebhookData>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebhookData {
    pub job_id: Option<String>,
    pub api_key: Option<String>,
}

impl JobRequest {
    /// Parse and validate a raw JSON request against `limits`.
    pub fn from_raw(raw: Value, limits: &LimitsConfig) -> Result<Self, ValidationError> {
        let raw: RawJobRequest = match raw {
            Value::Object(ref map) if !map.contains_key("input") => {
                return Err(ValidationError::MissingField("input"));
            }
            Value::Object(_) => serde_json::from_value(raw)
                .map_err(|e| ValidationError::Malformed(e.to_string()))?,
            other => {
                return Err(ValidationError::Malformed(format!(
                    "expected a JSON object, got {}",
                    json_type_name(&other)
                )));
            }
        };
        Self::validate(raw, limits)
    }

    fn validate(raw: RawJobRequest, limits: &LimitsConfig) -> Result<Self, ValidationError> {
        let mut input = raw.input;
        let id = match input.job_id.take().or(raw.id) {
            Some(id) => validate_job_id(id)?,
            None => uuid::Uuid::new_v4().to_string(),
        };

        let image = pick_source(
            "image",
            input.image_path,
            input.image_url,
            input.image_base64,
        )?;
        let audio = pick_source(
            "audio",
            input.audio_path,
            input.audio_url,
            input.audio_base64,
        )?;

        let duration_secs = match input.duration_seconds {
            Some(d) => {
                if !d.is_finite() || d <= 0.0 || d > limits.max_duration_secs as f64 {
                    return Err(ValidationError::OutOfRange {
                        field: "duration_seconds",
                        value: d,
                        min: 0.0,
                        max: limits.max_duration_secs as f64,
                    });
                }
                Some(d as f32)
            }
            None => None,
        };

        let sampling_steps = match input.sampling_steps {
            Some(s) => {
                if s < 1 || s > limits.max_sampling_steps as i64 {
                    return Err(ValidationError::OutOfRange {
                        field: "sampling_steps",
                        value: s as f64,
                        min: 1.0,
                        max: limits.max_sampling_steps as f64,
                    });
                }
                s as u32
            }
            None => DEFAULT_SAMPLING_STEPS.min(limits.max_sampling_steps),
        };

        let seed = match input.seed {
            Some(s) if s < 0 => {
                return Err(ValidationError::OutOfRange {
                    field: "seed",
                    value: s as f64,
                    min: 0.0,
                    max: i64::MAX as f64,
                });
            }
            Some(s) => s as u64,
            None => rand::random::<u32>() as u64,
        };

        let guidance_strength = bounded(
            "guidance_strength",
            input.guidance_strength,
            DEFAULT_GUIDANCE_STRENGTH,
            GUIDANCE_RANGE,
        )?;
        let dynamic_scale = bounded(
            "dynamic_scale",
            input.dynamic_scale,
            DEFAULT_DYNAMIC_SCALE,
            DYNAMIC_SCALE_RANGE,
        )?;

        let webhook = match input.webhook_url {
            Some(url) => {
                if !is_http_url(&url) {
                    return Err(ValidationError::InvalidReference {
                        field: "webhook_url",
                        reason: "must be an http:// or https:// URL".to_string(),
                    });
                }
                let data = input.webhook_data.unwrap_or_default();
                Some(WebhookTarget {
                    url,
                    job_id: data.job_id,
                    api_key: data.api_key,
                })
            }
            None => None,
        };

        Ok(Self {
            id,
            image,
            audio,
            params: GenerationParams {
                duration_secs,
                sampling_steps,
                guidance_strength,
                seed,
                dynamic_scale,
                crop: input.crop.unwrap_or(false),
            },
            webhook,
        })
    }
}

fn validate_job_id(id: String) -> Result<String, ValidationError> {
    let ok = !id.is_empty()
        && id.len() <= MAX_JOB_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(id)
    } else {
        Err(ValidationError::InvalidJobId(id))
    }
}

fn pick_source(
    field: &'static str,
    path: Option<String>,
    url: Option<String>,
    base64: Option<String>,
) -> Result<MediaSource, ValidationError> {
    let mut found = Vec::with_capacity(1);
    if let Some(p) = path {
        found.push(MediaSource::Path(PathBuf::from(p)));
    }
    if let Some(u) = url {
        found.push(MediaSource::Url(u));
    }
    if let Some(b) = base64 {
        found.push(MediaSource::Base64(b));
    }

    let source = match found.len() {
        0 => return Err(ValidationError::MissingField(field)),
        1 => found.remove(0),
        _ => {
            return Err(ValidationError::Conflicting(format!(
                "exactly one of {field}_path, {field}_url, {field}_base64 is allowed"
            )));
        }
    };

    let invalid = |reason: &str| ValidationError::InvalidReference {
        field,
        reason: reason.to_string(),
    };
    match &source {
        MediaSource::Path(p) if p.as_os_str().is_empty() => Err(invalid("empty path")),
        MediaSource::Url(u) if !is_http_url(u) => {
            Err(invalid("must be an http:// or https:// URL"))
        }
        MediaSource::Base64(b) if b.trim().is_empty() => Err(invalid("empty base64 payload")),
        _ => Ok(source),
    }
}

fn bounded(
    field: &'static str,
    value: Option<f64>,
    default: f32,
    (min, max): (f32, f32),
) -> Result<f32, ValidationError> {
    match value {
        None => Ok(default),
        Some(v) if v.is_finite() && v >= min as f64 && v <= max as f64 => Ok(v as f32),
        Some(v) => Err(ValidationError::OutOfRange {
            field,
            value: v,
            min: min as f64,
            max: max as f64,
        }),
    }
}

fn is_http_url(s: &str) -> bool {
    match Url::parse(s) {
        Ok(url) => {
            matches!(url.scheme(), "http" | "https")
                && url.host_str().is_some_and(|h| !h.is_empty())
        }
        Err(_) => false,
    }
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Orchestrator-visible job states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Received,
    Validated,
    Staged,
    Queued,
    Executing,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Received => "received",
            JobState::Validated => "validated",
            JobState::Staged => "staged",
            JobState::Queued => "queued",
            JobState::Executing => "executing",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Result
// ============================================================================

/// Wall-clock time spent in one pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub elapsed_ms: u64,
}

/// The produced video and its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputArtifact {
    pub job_id: String,
    pub video_path: PathBuf,
    pub duration_secs: f32,
    pub frame_count: usize,
    pub fps: u32,
    /// At least one face was found in the source image.
    #[serde(default)]
    pub face_detected: bool,
    pub width: u32,
    pub height: u32,
    pub seed: u64,
    pub file_size_bytes: u64,
    /// SHA-256 over the decoded RGB frames, hex encoded.
    pub frames_digest: String,
    pub stage_latencies: Vec<StageTiming>,
    pub completed_at: DateTime<Utc>,
    /// Inline copy of the video, only when enabled in configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_base64: Option<String>,
}

/// Exactly one of these is produced per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum JobResult {
    #[serde(rename = "completed")]
    Success(OutputArtifact),
    #[serde(rename = "failed")]
    Failure {
        job_id: Option<String>,
        error_kind: ErrorKind,
        error: String,
    },
}

impl JobResult {
    pub fn failure(job_id: Option<String>, err: &JobError) -> Self {
        JobResult::Failure {
            job_id,
            error_kind: err.kind(),
            error: err.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Success(_))
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            JobResult::Success(_) => None,
            JobResult::Failure { error_kind, .. } => Some(*error_kind),
        }
    }

    pub fn artifact(&self) -> Option<&OutputArtifact> {
        match self {
            JobResult::Success(a) => Some(a),
            JobResult::Failure { .. } => None,
        }
    }
}
