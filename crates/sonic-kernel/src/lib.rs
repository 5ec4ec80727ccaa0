//! Sonic kernel
//!
//! Shared vocabulary for the talking-head inference worker: the job request
//! schema and its validation, the error taxonomy, the in-memory media types,
//! the model sub-network seams and the layered worker configuration.
//!
//! Implementations of these seams live in `sonic-foundation`.

pub mod config;
pub mod error;
pub mod job;
pub mod media;
pub mod model;

pub use config::{ConfigError, WorkerConfig};
pub use error::{
    ErrorKind, GateError, InferenceError, JobError, ModelLoadError, Stage, StagingError,
    ValidationError,
};
pub use job::{GenerationParams, JobRequest, JobResult, MediaSource, OutputArtifact};
pub use model::{DeviceId, ModelBundle, ModelBundleHandle, ModelLoader};
