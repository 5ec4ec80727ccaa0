//! Model sub-network seams.
//!
//! The concrete networks (audio encoder, face detector, conditioning network,
//! diffusion sampler, decoder) are opaque, already-trained components. The
//! pipeline only talks to them through the traits below, and only through a
//! shared, read-only [`ModelBundle`] built once by a [`ModelLoader`].
//!
//! All calls are synchronous and may block for a long time on the
//! accelerator; callers run them on a blocking thread.

use crate::error::{InferenceError, ModelLoadError};
use crate::media::{Frame, ImageTensor, Region, Waveform};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

// ============================================================================
// Device
// ============================================================================

/// The device a bundle is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceId {
    Cuda(u32),
    Cpu,
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceId::Cuda(index) => write!(f, "cuda:{index}"),
            DeviceId::Cpu => write!(f, "cpu"),
        }
    }
}

/// Memory accounting for the single accelerator.
///
/// Reservations that would exceed the device capacity fail with
/// [`InferenceError::OutOfMemory`].
pub trait Accelerator: Send + Sync {
    fn device(&self) -> DeviceId;

    /// Total bytes available to jobs once the bundle is resident.
    fn capacity_bytes(&self) -> u64;

    /// Bytes currently reserved by running jobs.
    fn in_use_bytes(&self) -> u64;

    fn try_reserve(&self, bytes: u64) -> Result<(), InferenceError>;

    fn release(&self, bytes: u64);

    /// Forcibly drop every transient allocation and cached block.
    fn reclaim(&self);
}

/// A scoped reservation on an [`Accelerator`], returned on drop.
pub struct DeviceReservation {
    accelerator: Arc<dyn Accelerator>,
    bytes: u64,
}

impl DeviceReservation {
    pub fn acquire(accelerator: Arc<dyn Accelerator>, bytes: u64) -> Result<Self, InferenceError> {
        accelerator.try_reserve(bytes)?;
        Ok(Self { accelerator, bytes })
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for DeviceReservation {
    fn drop(&mut self) {
        self.accelerator.release(self.bytes);
    }
}

impl std::fmt::Debug for DeviceReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceReservation")
            .field("device", &self.accelerator.device())
            .field("bytes", &self.bytes)
            .finish()
    }
}

// ============================================================================
// Tensors exchanged between stages
// ============================================================================

/// Time-aligned audio features, one vector per output video frame.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFeatures {
    pub dim: usize,
    pub frames: Vec<Vec<f32>>,
}

/// Face detection result.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceInfo {
    pub face_count: usize,
    /// Tight box around the most prominent face.
    pub face_box: Option<Region>,
    /// Face box expanded by the requested ratio, clamped to the image.
    pub crop_box: Option<Region>,
}

/// Shape of one latent frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatentShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl LatentShape {
    pub fn len(&self) -> usize {
        self.channels * self.height * self.width
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parameters the conditioning network needs besides its inputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConditioningParams {
    pub frame_count: usize,
    pub fps: u32,
    pub dynamic_scale: f32,
}

/// Conditioning tensor sequence: an image-only reference plus one
/// audio-driven entry per target frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Conditioning {
    pub shape: LatentShape,
    pub reference: Vec<f32>,
    pub frames: Vec<Vec<f32>>,
}

/// A clip of latent frames being denoised.
#[derive(Debug, Clone, PartialEq)]
pub struct LatentClip {
    pub shape: LatentShape,
    pub frames: Vec<Vec<f32>>,
}

impl LatentClip {
    pub fn zeros(shape: LatentShape, frame_count: usize) -> Self {
        Self {
            shape,
            frames: vec![vec![0.0; shape.len()]; frame_count],
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Size of the clip in bytes as `f32` storage.
    pub fn byte_size(&self) -> u64 {
        (self.shape.len() * self.frames.len() * std::mem::size_of::<f32>()) as u64
    }
}

/// One denoising step of the sampling schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingStep {
    pub index: usize,
    pub total: usize,
    /// Cumulative signal level at the current noise level.
    pub alpha_bar: f32,
    /// Cumulative signal level after this step.
    pub alpha_bar_prev: f32,
}

/// Which branch of classifier-free guidance is being evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guidance {
    Unconditional,
    Conditional,
}

// ============================================================================
// Sub-network traits
// ============================================================================

/// Waveform → time-aligned feature sequence.
pub trait AudioEncoder: Send + Sync {
    fn name(&self) -> &str;

    /// Sample rate the encoder expects its input at.
    fn sample_rate(&self) -> u32;

    fn encode(
        &self,
        waveform: &Waveform,
        fps: u32,
        frame_count: usize,
    ) -> Result<AudioFeatures, InferenceError>;
}

/// Locates the speaking face in the source image.
pub trait FaceDetector: Send + Sync {
    fn name(&self) -> &str;

    fn detect(&self, image: &ImageTensor, expand_ratio: f32) -> Result<FaceInfo, InferenceError>;
}

/// Image + audio features → per-frame conditioning.
pub trait ConditioningNetwork: Send + Sync {
    fn name(&self) -> &str;

    /// Latent shape produced for a `width` x `height` source image.
    fn latent_shape(&self, width: u32, height: u32) -> LatentShape;

    fn condition(
        &self,
        image: &ImageTensor,
        audio: &AudioFeatures,
        params: &ConditioningParams,
    ) -> Result<Conditioning, InferenceError>;
}

/// Noise prediction network driven by the pipeline's sampling loop.
pub trait DiffusionSampler: Send + Sync {
    fn name(&self) -> &str;

    fn predict_noise(
        &self,
        latents: &LatentClip,
        step: &SamplingStep,
        conditioning: &Conditioning,
        guidance: Guidance,
    ) -> Result<LatentClip, InferenceError>;
}

/// Latent frames → pixel frames.
pub trait FrameDecoder: Send + Sync {
    fn name(&self) -> &str;

    fn decode(
        &self,
        latents: &LatentClip,
        width: u32,
        height: u32,
    ) -> Result<Vec<Frame>, InferenceError>;
}

/// Everything the encode stage needs to produce one container file.
#[derive(Debug)]
pub struct EncodeRequest<'a> {
    pub frames: &'a [Frame],
    pub fps: u32,
    pub audio_path: &'a std::path::Path,
    pub duration_secs: f32,
    pub output_path: &'a std::path::Path,
}

/// Pixel frames + audio → video container.
pub trait VideoEncoder: Send + Sync {
    fn name(&self) -> &str;

    fn encode(&self, request: &EncodeRequest<'_>) -> Result<(), InferenceError>;
}

// ============================================================================
// Bundle
// ============================================================================

/// The resident set of sub-networks. Built once, never mutated afterwards.
pub struct ModelBundle {
    pub device: DeviceId,
    pub accelerator: Arc<dyn Accelerator>,
    pub audio_encoder: Arc<dyn AudioEncoder>,
    pub face_detector: Arc<dyn FaceDetector>,
    pub conditioning: Arc<dyn ConditioningNetwork>,
    pub sampler: Arc<dyn DiffusionSampler>,
    pub decoder: Arc<dyn FrameDecoder>,
    /// Checkpoint files the bundle was built from.
    pub sources: Vec<PathBuf>,
}

impl ModelBundle {
    /// Names of the resident sub-networks, in pipeline order.
    pub fn describe(&self) -> String {
        [
            self.face_detector.name(),
            self.audio_encoder.name(),
            self.conditioning.name(),
            self.sampler.name(),
            self.decoder.name(),
        ]
        .join(" → ")
    }
}

impl std::fmt::Debug for ModelBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelBundle")
            .field("device", &self.device)
            .field("networks", &self.describe())
            .field("sources", &self.sources.len())
            .finish()
    }
}

/// Shared, read-only handle to the resident bundle.
pub type ModelBundleHandle = Arc<ModelBundle>;

/// Builds a complete [`ModelBundle`]. Loading is all-or-nothing.
pub trait ModelLoader: Send + Sync {
    fn name(&self) -> &str;

    fn load(&self) -> Result<ModelBundle, ModelLoadError>;
}
