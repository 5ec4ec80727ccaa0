//! Inference pipeline: face → audio features → conditioning → sampling →
//! decode → encode
//!
//! ```text
//! StagedMedia ─► [FaceDetector] ─► [AudioEncoder] ─► [ConditioningNetwork]
//!                                                        │
//!             MP4 ◄─ [VideoEncoder] ◄─ [FrameDecoder] ◄─ DDIM loop over [DiffusionSampler]
//! ```
//!
//! [`InferencePipeline::run`] is synchronous and long-running; the
//! orchestrator calls it on a blocking thread while holding the execution
//! ticket. Each stage either returns its output or aborts the run; nothing a
//! failed stage produced survives it.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use sonic_kernel::config::PipelineConfig;
use sonic_kernel::error::{InferenceError, Stage};
use sonic_kernel::job::{GenerationParams, OutputArtifact, StageTiming};
use sonic_kernel::media::{Frame, ImageTensor};
use sonic_kernel::model::{
    ConditioningParams, DeviceReservation, EncodeRequest, Guidance, LatentClip, ModelBundle,
    SamplingStep, VideoEncoder,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::staging::{StagedMedia, crop_resize};

/// Offset of the cosine schedule, keeps `alpha_bar` away from 1 at t = 0.
const COSINE_S: f32 = 0.008;
const MIN_ALPHA_BAR: f32 = 1e-4;

/// Cumulative signal level of the cosine noise schedule at `t` in `[0, 1]`.
pub fn cosine_alpha_bar(t: f32) -> f32 {
    let f = ((t + COSINE_S) / (1.0 + COSINE_S) * std::f32::consts::FRAC_PI_2).cos();
    (f * f).max(MIN_ALPHA_BAR)
}

/// Evenly spaced DDIM steps from pure noise down to a clean sample.
/// The last step lands exactly on `alpha_bar = 1`.
pub fn ddim_schedule(steps: u32) -> Vec<SamplingStep> {
    let total = steps as usize;
    (0..total)
        .map(|index| {
            let t = 1.0 - index as f32 / total as f32;
            let t_next = 1.0 - (index + 1) as f32 / total as f32;
            SamplingStep {
                index,
                total,
                alpha_bar: cosine_alpha_bar(t),
                alpha_bar_prev: if index + 1 == total {
                    1.0
                } else {
                    cosine_alpha_bar(t_next)
                },
            }
        })
        .collect()
}

/// Standard normal samples via Box-Muller.
fn gaussian(rng: &mut StdRng, len: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(len + 1);
    while out.len() < len {
        let u1: f32 = 1.0 - rng.r#gen::<f32>();
        let u2: f32 = rng.r#gen::<f32>();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = std::f32::consts::TAU * u2;
        out.push(r * theta.cos());
        out.push(r * theta.sin());
    }
    out.truncate(len);
    out
}

/// SHA-256 over all decoded frames, hex encoded.
pub fn frames_digest(frames: &[Frame]) -> String {
    let mut hasher = Sha256::new();
    for frame in frames {
        hasher.update(frame.width.to_le_bytes());
        hasher.update(frame.height.to_le_bytes());
        hasher.update(&frame.rgb);
    }
    hex::encode(hasher.finalize())
}

/// Per-job transient state. Owned by the executing job only.
pub struct InferenceSession {
    pub job_id: String,
    pub seed: u64,
    pub frame_count: usize,
    pub duration_secs: f32,
    rng: StdRng,
    stage_latencies: Vec<StageTiming>,
    /// Mean |x| of the latents after each sampling step.
    trajectory: Vec<f32>,
    reservation: Option<DeviceReservation>,
}

impl InferenceSession {
    fn new(job_id: &str, seed: u64, duration_secs: f32, fps: u32) -> Self {
        let frame_count = ((duration_secs * fps as f32).round() as usize).max(1);
        Self {
            job_id: job_id.to_string(),
            seed,
            frame_count,
            duration_secs,
            rng: StdRng::seed_from_u64(seed),
            stage_latencies: Vec::with_capacity(6),
            trajectory: Vec::new(),
            reservation: None,
        }
    }

    /// Run `f` as `stage`, recording its wall-clock time on success.
    fn timed<T>(
        &mut self,
        stage: Stage,
        f: impl FnOnce(&mut Self) -> Result<T, InferenceError>,
    ) -> Result<T, InferenceError> {
        let start = Instant::now();
        let result = f(self);
        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => {
                self.stage_latencies.push(StageTiming { stage, elapsed_ms });
                info!(job_id = %self.job_id, stage = %stage, elapsed_ms, "Stage complete");
            }
            Err(e) => {
                warn!(job_id = %self.job_id, stage = %stage, elapsed_ms, error = %e, "Stage failed")
            }
        }
        result
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.reservation.as_ref().map_or(0, DeviceReservation::bytes)
    }
}

pub struct InferencePipeline {
    config: PipelineConfig,
    encoder: Arc<dyn VideoEncoder>,
}

impl InferencePipeline {
    pub fn new(config: PipelineConfig, encoder: Arc<dyn VideoEncoder>) -> Self {
        Self { config, encoder }
    }

    pub fn output_path(&self, job_id: &str) -> PathBuf {
        self.config.output_dir.join(format!("output_{job_id}.mp4"))
    }

    /// Bytes the run holds on the device: latents plus both guidance branches
    /// and the decoded frames.
    fn working_set(&self, bundle: &ModelBundle, image: &ImageTensor, frames: usize) -> u64 {
        let shape = bundle.conditioning.latent_shape(image.width, image.height);
        let latent = (shape.len() * frames * std::mem::size_of::<f32>()) as u64;
        let pixels = image.width as u64 * image.height as u64 * 3 * frames as u64;
        latent * 4 + pixels
    }

    /// Generate one clip. Blocks until the video file is written.
    pub fn run(
        &self,
        staged: &StagedMedia,
        params: &GenerationParams,
        bundle: &ModelBundle,
    ) -> Result<OutputArtifact, InferenceError> {
        let fps = self.config.fps;
        let duration_secs = params.duration_secs.unwrap_or_else(|| staged.audio_secs());
        let mut session = InferenceSession::new(&staged.job_id, params.seed, duration_secs, fps);

        let bytes = self.working_set(bundle, &staged.image, session.frame_count);
        session.reservation = Some(DeviceReservation::acquire(
            Arc::clone(&bundle.accelerator),
            bytes,
        )?);
        info!(
            job_id = %session.job_id,
            device = %bundle.device,
            frames = session.frame_count,
            steps = params.sampling_steps,
            seed = session.seed,
            reserved_bytes = session.reserved_bytes(),
            "Inference started"
        );

        let (image, face_detected) = session.timed(Stage::FaceDetection, |_| {
            let faces = bundle
                .face_detector
                .detect(&staged.image, self.config.face_expand_ratio)?;
            if faces.face_count == 0 {
                return Err(InferenceError::NoFaceDetected);
            }
            let image = match (params.crop, faces.crop_box) {
                (true, Some(region)) => crop_resize(&staged.image, &region, staged.image.width)
                    .ok_or_else(|| {
                        InferenceError::stage(Stage::FaceDetection, "face crop failed")
                    })?,
                _ => staged.image.clone(),
            };
            Ok((image, true))
        })?;

        let features = session.timed(Stage::AudioFeatures, |s| {
            bundle
                .audio_encoder
                .encode(&staged.waveform, fps, s.frame_count)
        })?;

        let conditioning = session.timed(Stage::Conditioning, |s| {
            let params = ConditioningParams {
                frame_count: s.frame_count,
                fps,
                dynamic_scale: params.dynamic_scale,
            };
            bundle.conditioning.condition(&image, &features, &params)
        })?;
        drop(features);

        let latents = session.timed(Stage::Sampling, |s| {
            let shape = conditioning.shape;
            let mut latents = LatentClip {
                shape,
                frames: (0..s.frame_count)
                    .map(|_| gaussian(&mut s.rng, shape.len()))
                    .collect(),
            };

            let guidance = params.guidance_strength;
            for step in ddim_schedule(params.sampling_steps) {
                let eps_u =
                    bundle
                        .sampler
                        .predict_noise(&latents, &step, &conditioning, Guidance::Unconditional)?;
                let eps_c =
                    bundle
                        .sampler
                        .predict_noise(&latents, &step, &conditioning, Guidance::Conditional)?;

                let (sa, sb) = (step.alpha_bar.sqrt(), (1.0 - step.alpha_bar).sqrt());
                let (sa_prev, sb_prev) =
                    (step.alpha_bar_prev.sqrt(), (1.0 - step.alpha_bar_prev).sqrt());

                let mut magnitude = 0.0f64;
                for (f, frame) in latents.frames.iter_mut().enumerate() {
                    for (i, x) in frame.iter_mut().enumerate() {
                        let (u, c) = (eps_u.frames[f][i], eps_c.frames[f][i]);
                        let eps = u + guidance * (c - u);
                        let x0 = (*x - sb * eps) / sa;
                        *x = sa_prev * x0 + sb_prev * eps;
                        magnitude += x.abs() as f64;
                    }
                }
                let mean = (magnitude / (s.frame_count * shape.len()).max(1) as f64) as f32;
                s.trajectory.push(mean);
                debug!(
                    job_id = %s.job_id,
                    step = step.index + 1,
                    total = step.total,
                    alpha_bar = step.alpha_bar,
                    mean_abs = mean,
                    "Sampling step"
                );
            }
            let start_abs = s.trajectory.first().copied().unwrap_or_default();
            let end_abs = s.trajectory.last().copied().unwrap_or_default();
            debug!(
                job_id = %s.job_id,
                steps = s.trajectory.len(),
                start_abs,
                end_abs,
                "Sampling finished"
            );
            Ok(latents)
        })?;
        drop(conditioning);

        let frames = session.timed(Stage::Decode, |s| {
            let frames = bundle.decoder.decode(&latents, image.width, image.height)?;
            if frames.len() != s.frame_count {
                return Err(InferenceError::stage(
                    Stage::Decode,
                    format!("decoded {} frames, expected {}", frames.len(), s.frame_count),
                ));
            }
            Ok(frames)
        })?;
        drop(latents);
        let digest = frames_digest(&frames);

        let output_path = self.output_path(&session.job_id);
        let file_size = session.timed(Stage::Encode, |s| {
            self.encode(&frames, staged, s.duration_secs, &output_path)
        })?;

        let artifact = OutputArtifact {
            job_id: session.job_id.clone(),
            video_path: output_path,
            duration_secs: session.duration_secs,
            frame_count: frames.len(),
            fps,
            face_detected,
            width: image.width,
            height: image.height,
            seed: session.seed,
            file_size_bytes: file_size,
            frames_digest: digest,
            stage_latencies: session.stage_latencies.clone(),
            completed_at: chrono::Utc::now(),
            video_base64: None,
        };
        info!(
            job_id = %artifact.job_id,
            path = %artifact.video_path.display(),
            frames = artifact.frame_count,
            bytes = artifact.file_size_bytes,
            "Inference finished"
        );
        Ok(artifact)
    }

    /// Encode into `<output>.partial`, then rename. The partial file never
    /// outlives a failure.
    fn encode(
        &self,
        frames: &[Frame],
        staged: &StagedMedia,
        duration_secs: f32,
        output_path: &Path,
    ) -> Result<u64, InferenceError> {
        let io_err = |what: &str, e: std::io::Error| {
            InferenceError::stage(Stage::Encode, format!("{what}: {e}"))
        };
        std::fs::create_dir_all(&self.config.output_dir)
            .map_err(|e| io_err("creating output directory", e))?;

        let mut partial = output_path.as_os_str().to_owned();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        let request = EncodeRequest {
            frames,
            fps: self.config.fps,
            audio_path: &staged.audio_path,
            duration_secs,
            output_path: &partial,
        };
        let result = self
            .encoder
            .encode(&request)
            .and_then(|()| {
                std::fs::rename(&partial, output_path).map_err(|e| io_err("publishing output", e))
            })
            .and_then(|()| {
                std::fs::metadata(output_path)
                    .map(|m| m.len())
                    .map_err(|e| io_err("reading output size", e))
            });

        if result.is_err() && partial.exists() {
            if let Err(e) = std::fs::remove_file(&partial) {
                warn!(path = %partial.display(), error = %e, "Failed to remove partial output");
            }
        }
        result
    }
}
