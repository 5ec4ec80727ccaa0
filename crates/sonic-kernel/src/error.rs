//! Error taxonomy for the Sonic worker.
//!
//! Every subsystem has its own typed error. They all fold into [`JobError`],
//! whose [`JobError::kind`] yields the stable [`ErrorKind`] reported to
//! callers inside a failed [`JobResult`](crate::job::JobResult).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Stable, caller-visible error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed, missing or out-of-range request fields.
    ValidationError,
    /// Input fetch or decode failure; the caller may retry.
    #[serde(rename = "IOError")]
    IoError,
    /// Checkpoint missing or corrupt; fatal to the process.
    ModelLoadError,
    /// Accelerator out of memory during a run.
    ResourceExhausted,
    /// Admission wait exceeded.
    Timeout,
    /// Waiting queue is full.
    Busy,
    /// Caller withdrew the job before it was admitted.
    Cancelled,
    /// Unexpected failure inside a pipeline stage.
    InferenceError,
}

impl ErrorKind {
    /// Whether a caller may reasonably resubmit the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::IoError | Self::ResourceExhausted | Self::Timeout | Self::Busy
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "ValidationError",
            Self::IoError => "IOError",
            Self::ModelLoadError => "ModelLoadError",
            Self::ResourceExhausted => "ResourceExhausted",
            Self::Timeout => "Timeout",
            Self::Busy => "Busy",
            Self::Cancelled => "Cancelled",
            Self::InferenceError => "InferenceError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request schema and value-range violations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("conflicting fields: {0}")]
    Conflicting(String),

    #[error("'{field}' must be within {min}..={max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("invalid job id '{0}': only ASCII letters, digits, '-' and '_' are allowed")]
    InvalidJobId(String),

    #[error("invalid media reference for '{field}': {reason}")]
    InvalidReference { field: &'static str, reason: String },

    #[error("{what} is {size} bytes, limit is {limit} bytes")]
    TooLarge {
        what: &'static str,
        size: u64,
        limit: u64,
    },

    #[error("unsupported {what}: {reason}")]
    Unsupported { what: &'static str, reason: String },
}

/// Failures while materializing and normalizing input media.
#[derive(Debug, Clone, Error)]
pub enum StagingError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to fetch {what}: {reason}")]
    Fetch { what: &'static str, reason: String },

    #[error("I/O error while staging {what}: {reason}")]
    Io { what: &'static str, reason: String },

    /// Bytes arrived but could not be decoded as the declared media.
    #[error("failed to decode {what}: {reason}")]
    Decode { what: &'static str, reason: String },
}

impl StagingError {
    pub fn io(what: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Io {
            what,
            reason: err.to_string(),
        }
    }

    pub fn decode(what: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Decode {
            what,
            reason: err.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::ValidationError,
            Self::Fetch { .. } | Self::Io { .. } | Self::Decode { .. } => ErrorKind::IoError,
        }
    }
}

/// Model bundle construction failures.
#[derive(Debug, Clone, Error)]
pub enum ModelLoadError {
    #[error("checkpoint file missing: {}", .0.display())]
    CheckpointMissing(PathBuf),

    #[error("checkpoint file corrupt: {}: {reason}", path.display())]
    CheckpointCorrupt { path: PathBuf, reason: String },

    #[error("accelerator unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("insufficient host memory: {0}")]
    InsufficientMemory(String),

    #[error("failed to build {component}: {reason}")]
    Component {
        component: &'static str,
        reason: String,
    },

    #[error("model bundle unavailable after a failed load: {0}")]
    Unavailable(String),
}

/// Execution gate admission failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("admission timed out after {waited_ms} ms in queue")]
    Timeout { waited_ms: u64 },

    #[error("execution queue is full ({queued} jobs waiting)")]
    Busy { queued: usize },

    #[error("job withdrawn while queued")]
    Cancelled,

    #[error("execution gate is closed")]
    Closed,
}

impl GateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Busy { .. } => ErrorKind::Busy,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Closed => ErrorKind::InferenceError,
        }
    }
}

/// Pipeline stage names, used for error attribution and latency reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    FaceDetection,
    AudioFeatures,
    Conditioning,
    Sampling,
    Decode,
    Encode,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FaceDetection => "face_detection",
            Self::AudioFeatures => "audio_features",
            Self::Conditioning => "conditioning",
            Self::Sampling => "sampling",
            Self::Decode => "decode",
            Self::Encode => "encode",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures inside the inference pipeline.
#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    #[error("accelerator out of memory: requested {requested} bytes, {available} bytes free")]
    OutOfMemory { requested: u64, available: u64 },

    #[error("no face detected in the image")]
    NoFaceDetected,

    #[error("{stage} stage failed: {reason}")]
    Stage { stage: Stage, reason: String },

    #[error("pipeline task aborted: {0}")]
    Aborted(String),
}

impl InferenceError {
    pub fn stage(stage: Stage, reason: impl Into<String>) -> Self {
        Self::Stage {
            stage,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::OutOfMemory { .. } => ErrorKind::ResourceExhausted,
            _ => ErrorKind::InferenceError,
        }
    }
}

/// Any per-job failure, as seen by the orchestrator.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    ModelLoad(#[from] ModelLoadError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Inference(#[from] InferenceError),
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::ValidationError,
            Self::Staging(e) => e.kind(),
            Self::ModelLoad(_) => ErrorKind::ModelLoadError,
            Self::Gate(e) => e.kind(),
            Self::Inference(e) => e.kind(),
        }
    }
}
