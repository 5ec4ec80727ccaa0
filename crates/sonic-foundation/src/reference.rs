//! Reference model backend
//!
//! Lightweight, deterministic implementations of the sub-network traits.
//! Every parameter is drawn from an RNG keyed by the fingerprint of the
//! corresponding checkpoint file, so a given checkpoint set always yields the
//! same bundle and the same frames for the same inputs.
//!
//! The networks keep the data contracts of the real ones (16 kHz audio in,
//! one feature vector per frame, 4-channel latents at 1/8 resolution, RGB8
//! frames out), which lets the pipeline, gate and orchestrator run end to end
//! on any machine.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sonic_kernel::config::WorkerConfig;
use sonic_kernel::error::{InferenceError, ModelLoadError, Stage};
use sonic_kernel::media::{Frame, ImageTensor, Region, Waveform};
use sonic_kernel::model::{
    Accelerator, AudioEncoder, AudioFeatures, Conditioning, ConditioningNetwork,
    ConditioningParams, DiffusionSampler, FaceDetector, FaceInfo, FrameDecoder, Guidance,
    LatentClip, LatentShape, ModelBundle, ModelLoader, SamplingStep,
};
use std::sync::Arc;
use tracing::info;

use crate::accelerator::MemoryBudget;
use crate::checkpoint::{CheckpointFile, CheckpointSet, Component};
use crate::hardware;

pub const AUDIO_SAMPLE_RATE: u32 = 16_000;
pub const FEATURE_DIM: usize = 16;
pub const LATENT_CHANNELS: usize = 4;
pub const LATENT_SCALE: u32 = 8;

const AUDIO_BANDS: usize = 8;
const MOTION_GAIN: f32 = 0.25;

fn rng_for(file: &CheckpointFile) -> StdRng {
    StdRng::from_seed(file.fingerprint)
}

fn uniform(rng: &mut StdRng, len: usize, scale: f32) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-scale..=scale)).collect()
}

// ============================================================================
// Audio encoder
// ============================================================================

/// Band-energy audio encoder with a seeded projection.
pub struct ReferenceAudioEncoder {
    /// `FEATURE_DIM x (AUDIO_BANDS + 1)` row-major.
    weights: Vec<f32>,
    bias: Vec<f32>,
}

impl ReferenceAudioEncoder {
    pub fn from_checkpoint(file: &CheckpointFile) -> Self {
        let mut rng = rng_for(file);
        Self {
            weights: uniform(&mut rng, FEATURE_DIM * (AUDIO_BANDS + 1), 1.5),
            bias: uniform(&mut rng, FEATURE_DIM, 0.1),
        }
    }

    fn band_inputs(window: &[f32]) -> [f32; AUDIO_BANDS + 1] {
        let mut x = [0.0f32; AUDIO_BANDS + 1];
        let band_len = (window.len() / AUDIO_BANDS).max(1);
        for (b, chunk) in window.chunks(band_len).take(AUDIO_BANDS).enumerate() {
            let energy: f32 = chunk.iter().map(|s| s * s).sum::<f32>() / chunk.len() as f32;
            x[b] = energy.sqrt();
        }
        let crossings = window
            .windows(2)
            .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
            .count();
        x[AUDIO_BANDS] = crossings as f32 / window.len().max(1) as f32;
        x
    }
}

impl AudioEncoder for ReferenceAudioEncoder {
    fn name(&self) -> &str {
        "whisper-tiny"
    }

    fn sample_rate(&self) -> u32 {
        AUDIO_SAMPLE_RATE
    }

    fn encode(
        &self,
        waveform: &Waveform,
        fps: u32,
        frame_count: usize,
    ) -> Result<AudioFeatures, InferenceError> {
        if waveform.sample_rate != AUDIO_SAMPLE_RATE {
            return Err(InferenceError::stage(
                Stage::AudioFeatures,
                format!(
                    "expected {AUDIO_SAMPLE_RATE} Hz audio, got {} Hz",
                    waveform.sample_rate
                ),
            ));
        }
        if fps == 0 {
            return Err(InferenceError::stage(Stage::AudioFeatures, "fps is zero"));
        }

        let hop = 1.0 / fps as f32;
        let inputs = AUDIO_BANDS + 1;
        let frames = (0..frame_count)
            .map(|i| {
                // two-hop window centred on the frame
                let start = (i as f32 * hop - hop / 2.0).max(0.0);
                let x = Self::band_inputs(&waveform.window(start, 2.0 * hop));
                (0..FEATURE_DIM)
                    .map(|k| {
                        let row = &self.weights[k * inputs..(k + 1) * inputs];
                        let z: f32 = row.iter().zip(x.iter()).map(|(w, v)| w * v).sum();
                        (z + self.bias[k]).tanh()
                    })
                    .collect::<Vec<f32>>()
            })
            .collect();

        Ok(AudioFeatures {
            dim: FEATURE_DIM,
            frames,
        })
    }
}

// ============================================================================
// Face detector
// ============================================================================

/// Local-contrast face locator.
///
/// Splits the image into a grid, scores each cell by luma variance and boxes
/// the cells scoring at least `keep_ratio` of the best one. A flat image has
/// no face.
pub struct ReferenceFaceDetector {
    grid: u32,
    keep_ratio: f32,
    min_variance: f32,
}

impl ReferenceFaceDetector {
    pub fn from_checkpoint(file: &CheckpointFile) -> Self {
        let mut rng = rng_for(file);
        Self {
            grid: 16,
            keep_ratio: rng.gen_range(0.30..0.40),
            min_variance: 1e-4,
        }
    }
}

fn expand_region(region: Region, ratio: f32, width: u32, height: u32) -> Region {
    let grow_x = (region.width as f32 * ratio / 2.0).round() as u32;
    let grow_y = (region.height as f32 * ratio / 2.0).round() as u32;
    let x = region.x.saturating_sub(grow_x);
    let y = region.y.saturating_sub(grow_y);
    let right = (region.x + region.width + grow_x).min(width);
    let bottom = (region.y + region.height + grow_y).min(height);
    Region {
        x,
        y,
        width: right - x,
        height: bottom - y,
    }
}

impl FaceDetector for ReferenceFaceDetector {
    fn name(&self) -> &str {
        "yoloface-v5m"
    }

    fn detect(&self, image: &ImageTensor, expand_ratio: f32) -> Result<FaceInfo, InferenceError> {
        let grid = self.grid.min(image.width).min(image.height).max(1);
        let cell_w = image.width / grid;
        let cell_h = image.height / grid;
        if cell_w == 0 || cell_h == 0 {
            return Err(InferenceError::stage(
                Stage::FaceDetection,
                format!("image {}x{} is too small", image.width, image.height),
            ));
        }

        let mut scores = Vec::with_capacity((grid * grid) as usize);
        for gy in 0..grid {
            for gx in 0..grid {
                let (mut sum, mut sq) = (0.0f32, 0.0f32);
                for y in gy * cell_h..(gy + 1) * cell_h {
                    for x in gx * cell_w..(gx + 1) * cell_w {
                        let l = image.luma(x, y);
                        sum += l;
                        sq += l * l;
                    }
                }
                let n = (cell_w * cell_h) as f32;
                let mean = sum / n;
                scores.push((sq / n - mean * mean).max(0.0));
            }
        }

        let best = scores.iter().copied().fold(0.0f32, f32::max);
        if best < self.min_variance {
            return Ok(FaceInfo {
                face_count: 0,
                face_box: None,
                crop_box: None,
            });
        }

        let threshold = best * self.keep_ratio;
        let (mut x0, mut y0, mut x1, mut y1) = (grid, grid, 0, 0);
        for (i, score) in scores.iter().enumerate() {
            if *score >= threshold {
                let (gx, gy) = (i as u32 % grid, i as u32 / grid);
                x0 = x0.min(gx);
                y0 = y0.min(gy);
                x1 = x1.max(gx + 1);
                y1 = y1.max(gy + 1);
            }
        }

        let face = Region {
            x: x0 * cell_w,
            y: y0 * cell_h,
            width: (x1 - x0) * cell_w,
            height: (y1 - y0) * cell_h,
        };
        Ok(FaceInfo {
            face_count: 1,
            face_box: Some(face),
            crop_box: Some(expand_region(face, expand_ratio, image.width, image.height)),
        })
    }
}

// ============================================================================
// Conditioning network
// ============================================================================

/// Image latents plus an audio-driven motion field around the mouth area.
pub struct ReferenceConditioning {
    /// `LATENT_CHANNELS x FEATURE_DIM` row-major (audio-to-token).
    token_weights: Vec<f32>,
    /// `FEATURE_DIM` weights (audio-to-bucket).
    bucket_weights: Vec<f32>,
    bucket_bias: f32,
}

impl ReferenceConditioning {
    pub fn from_checkpoints(token: &CheckpointFile, bucket: &CheckpointFile) -> Self {
        let mut token_rng = rng_for(token);
        let mut bucket_rng = rng_for(bucket);
        Self {
            token_weights: uniform(&mut token_rng, LATENT_CHANNELS * FEATURE_DIM, 0.5),
            bucket_weights: uniform(&mut bucket_rng, FEATURE_DIM, 0.5),
            bucket_bias: bucket_rng.gen_range(-0.2..0.2),
        }
    }

    /// Average RGB and luma per latent cell, mapped to `[-1, 1]`.
    fn encode_image(image: &ImageTensor, shape: LatentShape) -> Vec<f32> {
        let (lh, lw) = (shape.height, shape.width);
        let cell_w = (image.width as usize / lw).max(1);
        let cell_h = (image.height as usize / lh).max(1);
        let mut out = vec![0.0f32; shape.len()];
        for ly in 0..lh {
            for lx in 0..lw {
                let mut acc = [0.0f32; 4];
                for y in ly * cell_h..((ly + 1) * cell_h).min(image.height as usize) {
                    for x in lx * cell_w..((lx + 1) * cell_w).min(image.width as usize) {
                        let [r, g, b] = image.pixel(x as u32, y as u32);
                        acc[0] += r;
                        acc[1] += g;
                        acc[2] += b;
                        acc[3] += 0.299 * r + 0.587 * g + 0.114 * b;
                    }
                }
                let n = (cell_w * cell_h) as f32;
                for (c, v) in acc.iter().enumerate() {
                    out[(c * lh + ly) * lw + lx] = 2.0 * v / n - 1.0;
                }
            }
        }
        out
    }

    fn mouth_mask(shape: LatentShape) -> Vec<f32> {
        let mut mask = Vec::with_capacity(shape.height * shape.width);
        for y in 0..shape.height {
            for x in 0..shape.width {
                let dy = (y as f32 + 0.5) / shape.height as f32 - 0.7;
                let dx = (x as f32 + 0.5) / shape.width as f32 - 0.5;
                mask.push((-(dx * dx + dy * dy) / 0.02).exp());
            }
        }
        mask
    }
}

impl ConditioningNetwork for ReferenceConditioning {
    fn name(&self) -> &str {
        "audio2token+audio2bucket"
    }

    fn latent_shape(&self, width: u32, height: u32) -> LatentShape {
        LatentShape {
            channels: LATENT_CHANNELS,
            height: (height / LATENT_SCALE).max(1) as usize,
            width: (width / LATENT_SCALE).max(1) as usize,
        }
    }

    fn condition(
        &self,
        image: &ImageTensor,
        audio: &AudioFeatures,
        params: &ConditioningParams,
    ) -> Result<Conditioning, InferenceError> {
        if audio.dim != FEATURE_DIM {
            return Err(InferenceError::stage(
                Stage::Conditioning,
                format!("expected {FEATURE_DIM}-dim audio features, got {}", audio.dim),
            ));
        }
        if audio.frames.len() != params.frame_count {
            return Err(InferenceError::stage(
                Stage::Conditioning,
                format!(
                    "{} audio feature frames for {} video frames",
                    audio.frames.len(),
                    params.frame_count
                ),
            ));
        }

        let shape = self.latent_shape(image.width, image.height);
        let reference = Self::encode_image(image, shape);
        let mask = Self::mouth_mask(shape);
        let plane = shape.height * shape.width;

        let frames = audio
            .frames
            .iter()
            .map(|features| {
                let z: f32 = self
                    .bucket_weights
                    .iter()
                    .zip(features)
                    .map(|(w, f)| w * f)
                    .sum::<f32>()
                    + self.bucket_bias;
                let bucket = 1.0 / (1.0 + (-z).exp());

                let mut frame = reference.clone();
                for c in 0..LATENT_CHANNELS {
                    let row = &self.token_weights[c * FEATURE_DIM..(c + 1) * FEATURE_DIM];
                    let token: f32 = row.iter().zip(features).map(|(w, f)| w * f).sum();
                    let motion = token.tanh() * bucket * params.dynamic_scale * MOTION_GAIN;
                    for (v, m) in frame[c * plane..(c + 1) * plane].iter_mut().zip(&mask) {
                        *v += motion * m;
                    }
                }
                frame
            })
            .collect();

        Ok(Conditioning {
            shape,
            reference,
            frames,
        })
    }
}

// ============================================================================
// Diffusion sampler
// ============================================================================

/// Noise predictor that steers every latent frame towards its conditioning
/// target, blended with its temporal neighbours.
pub struct ReferenceUnet {
    temporal_blend: f32,
    /// Share of the noisy sample that leaks into the clean estimate while
    /// noise is still high.
    leakage: f32,
}

impl ReferenceUnet {
    pub fn from_checkpoint(file: &CheckpointFile) -> Self {
        let mut rng = rng_for(file);
        Self {
            temporal_blend: rng.gen_range(0.1..0.3),
            leakage: rng.gen_range(0.05..0.1),
        }
    }

    fn target(&self, conditioning: &Conditioning, frame: usize, index: usize) -> f32 {
        let frames = &conditioning.frames;
        let here = frames[frame][index];
        let prev = frames[frame.saturating_sub(1)][index];
        let next = frames[(frame + 1).min(frames.len() - 1)][index];
        (1.0 - self.temporal_blend) * here + self.temporal_blend * 0.5 * (prev + next)
    }
}

impl DiffusionSampler for ReferenceUnet {
    fn name(&self) -> &str {
        "sonic-unet"
    }

    fn predict_noise(
        &self,
        latents: &LatentClip,
        step: &SamplingStep,
        conditioning: &Conditioning,
        guidance: Guidance,
    ) -> Result<LatentClip, InferenceError> {
        if latents.shape != conditioning.shape
            || latents.frame_count() != conditioning.frames.len()
        {
            return Err(InferenceError::stage(
                Stage::Sampling,
                "latent clip does not match conditioning",
            ));
        }

        let signal = step.alpha_bar.sqrt();
        let noise = (1.0 - step.alpha_bar).max(1e-6).sqrt();
        let frames = latents
            .frames
            .iter()
            .enumerate()
            .map(|(f, frame)| {
                frame
                    .iter()
                    .enumerate()
                    .map(|(i, x)| {
                        let target = match guidance {
                            Guidance::Conditional => self.target(conditioning, f, i),
                            Guidance::Unconditional => conditioning.reference[i],
                        };
                        let x0 = target + self.leakage * (1.0 - step.alpha_bar) * x.tanh();
                        (x - signal * x0) / noise
                    })
                    .collect::<Vec<f32>>()
            })
            .collect();

        Ok(LatentClip {
            shape: latents.shape,
            frames,
        })
    }
}

// ============================================================================
// Frame decoder
// ============================================================================

/// Bilinear latent-to-pixel decoder.
pub struct ReferenceVae {
    gain: [f32; 3],
    detail: f32,
}

impl ReferenceVae {
    pub fn from_checkpoint(file: &CheckpointFile) -> Self {
        let mut rng = rng_for(file);
        Self {
            gain: [
                rng.gen_range(0.95..1.05),
                rng.gen_range(0.95..1.05),
                rng.gen_range(0.95..1.05),
            ],
            detail: rng.gen_range(0.05..0.15),
        }
    }

    fn sample(plane: &[f32], lw: usize, lh: usize, fx: f32, fy: f32) -> f32 {
        let x0 = (fx.floor().max(0.0) as usize).min(lw - 1);
        let y0 = (fy.floor().max(0.0) as usize).min(lh - 1);
        let x1 = (x0 + 1).min(lw - 1);
        let y1 = (y0 + 1).min(lh - 1);
        let tx = (fx - x0 as f32).clamp(0.0, 1.0);
        let ty = (fy - y0 as f32).clamp(0.0, 1.0);
        let top = plane[y0 * lw + x0] * (1.0 - tx) + plane[y0 * lw + x1] * tx;
        let bottom = plane[y1 * lw + x0] * (1.0 - tx) + plane[y1 * lw + x1] * tx;
        top * (1.0 - ty) + bottom * ty
    }
}

impl FrameDecoder for ReferenceVae {
    fn name(&self) -> &str {
        "svd-vae"
    }

    fn decode(
        &self,
        latents: &LatentClip,
        width: u32,
        height: u32,
    ) -> Result<Vec<Frame>, InferenceError> {
        let shape = latents.shape;
        if shape.channels < LATENT_CHANNELS || shape.is_empty() {
            return Err(InferenceError::stage(
                Stage::Decode,
                format!("unexpected latent shape {shape:?}"),
            ));
        }
        let (lw, lh) = (shape.width, shape.height);
        let plane = lw * lh;
        let sx = lw as f32 / width as f32;
        let sy = lh as f32 / height as f32;

        let frames = latents
            .frames
            .iter()
            .map(|latent| {
                let mut rgb = Vec::with_capacity((width * height * 3) as usize);
                for y in 0..height {
                    let fy = (y as f32 + 0.5) * sy - 0.5;
                    for x in 0..width {
                        let fx = (x as f32 + 0.5) * sx - 0.5;
                        let c: [f32; 4] = std::array::from_fn(|ch| {
                            Self::sample(&latent[ch * plane..(ch + 1) * plane], lw, lh, fx, fy)
                        });
                        let luma = 0.299 * c[0] + 0.587 * c[1] + 0.114 * c[2];
                        for k in 0..3 {
                            let v = (c[k] + 1.0) / 2.0 * self.gain[k]
                                + self.detail * (c[3] - luma) / 2.0;
                            rgb.push((v.clamp(0.0, 1.0) * 255.0).round() as u8);
                        }
                    }
                }
                Frame { width, height, rgb }
            })
            .collect();
        Ok(frames)
    }
}

// ============================================================================
// Loader
// ============================================================================

/// Builds the reference bundle from the checkpoint directory.
pub struct ReferenceModelLoader {
    config: WorkerConfig,
}

impl ReferenceModelLoader {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }
}

fn component<'a>(
    set: &'a CheckpointSet,
    component: Component,
) -> Result<&'a CheckpointFile, ModelLoadError> {
    set.get(component).ok_or_else(|| {
        ModelLoadError::CheckpointMissing(set.root.join(component.relative_path()))
    })
}

impl ModelLoader for ReferenceModelLoader {
    fn name(&self) -> &str {
        "reference"
    }

    fn load(&self) -> Result<ModelBundle, ModelLoadError> {
        let probe = hardware::probe(&self.config.device, &self.config.models)?;
        let checkpoints = CheckpointSet::resolve(
            &self.config.models.checkpoint_dir,
            self.config.models.verify_manifest,
        )?;

        let budget = Arc::new(MemoryBudget::new(probe.device, probe.memory_bytes));
        budget
            .pin_resident(checkpoints.total_bytes())
            .map_err(|e| {
                ModelLoadError::InsufficientMemory(format!("device {}: {e}", probe.device))
            })?;

        let bundle = ModelBundle {
            device: probe.device,
            audio_encoder: Arc::new(ReferenceAudioEncoder::from_checkpoint(component(
                &checkpoints,
                Component::AudioEncoder,
            )?)),
            face_detector: Arc::new(ReferenceFaceDetector::from_checkpoint(component(
                &checkpoints,
                Component::FaceDetector,
            )?)),
            conditioning: Arc::new(ReferenceConditioning::from_checkpoints(
                component(&checkpoints, Component::AudioToToken)?,
                component(&checkpoints, Component::AudioToBucket)?,
            )),
            sampler: Arc::new(ReferenceUnet::from_checkpoint(component(
                &checkpoints,
                Component::Unet,
            )?)),
            decoder: Arc::new(ReferenceVae::from_checkpoint(component(
                &checkpoints,
                Component::Vae,
            )?)),
            sources: checkpoints.files().iter().map(|f| f.path.clone()).collect(),
            accelerator: budget.clone() as Arc<dyn Accelerator>,
        };

        info!(
            device = %bundle.device,
            resident_mb = budget.resident_bytes() / (1024 * 1024),
            networks = %bundle.describe(),
            "Reference model bundle built"
        );
        Ok(bundle)
    }
}
