//! Sonic foundation
//!
//! Runtime pieces of the talking-head worker, built on the seams declared in
//! `sonic-kernel`.

// accelerator memory accounting
pub mod accelerator;

// checkpoint layout and manifest verification
pub mod checkpoint;

// ffmpeg video encoder
pub mod encode;

// single-slot execution gate
pub mod gate;

// device and host memory probing
pub mod hardware;

// job lifecycle
pub mod orchestrator;

// diffusion inference pipeline
pub mod pipeline;

// reference model backend
pub mod reference;

// single-flight model registry
pub mod registry;

// media staging
pub mod staging;

// webhook notifications
pub mod webhook;

pub use accelerator::MemoryBudget;
pub use checkpoint::{CheckpointSet, Component};
pub use encode::FfmpegEncoder;
pub use gate::{ExecutionGate, ExecutionTicket, GateStats};
pub use orchestrator::{JobOrchestrator, SetupError};
pub use pipeline::{InferencePipeline, InferenceSession};
pub use reference::ReferenceModelLoader;
pub use registry::{ModelRegistry, RegistryState};
pub use staging::{MediaStager, StagedMedia};
pub use webhook::{Notifier, WebhookNotifier};
