//! A fully wired orchestrator over scratch directories.
//!
//! The bundle is the real reference backend, loaded from placeholder
//! checkpoints on the CPU fallback device, with two instrumented seams:
//! the sampler records how many jobs are inside it at once, and the
//! accelerator counts reclaims. Video encoding is replaced by
//! [`RecordingEncoder`], so no ffmpeg is needed.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use sonic_foundation::orchestrator::JobOrchestrator;
use sonic_foundation::pipeline::frames_digest;
use sonic_foundation::reference::ReferenceModelLoader;
use sonic_foundation::registry::ModelRegistry;
use sonic_foundation::webhook::{Notifier, WebhookError};
use sonic_kernel::config::WorkerConfig;
use sonic_kernel::error::{InferenceError, ModelLoadError, Stage};
use sonic_kernel::job::{JobResult, WebhookTarget};
use sonic_kernel::model::{
    Accelerator, Conditioning, DeviceId, DiffusionSampler, EncodeRequest, Guidance, LatentClip,
    ModelBundle, ModelLoader, SamplingStep, VideoEncoder,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tempfile::TempDir;

use super::fixtures;

/// Route worker logs through the test writer; `RUST_LOG=sonic=debug` shows them.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ─────────────────────────────────────────────────────────────────────────────
// Instrumented seams
// ─────────────────────────────────────────────────────────────────────────────

/// Shared counters fed by the instrumented bundle.
#[derive(Debug, Default)]
pub struct ExecutionProbe {
    in_sampler: AtomicUsize,
    max_in_sampler: AtomicUsize,
    sampler_calls: AtomicUsize,
    reclaims: AtomicU64,
}

impl ExecutionProbe {
    /// Highest number of jobs ever observed inside the sampler at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_in_sampler.load(Ordering::SeqCst)
    }

    pub fn sampler_calls(&self) -> usize {
        self.sampler_calls.load(Ordering::SeqCst)
    }

    pub fn reclaims(&self) -> u64 {
        self.reclaims.load(Ordering::SeqCst)
    }
}

struct TrackingSampler {
    inner: Arc<dyn DiffusionSampler>,
    probe: Arc<ExecutionProbe>,
}

impl DiffusionSampler for TrackingSampler {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn predict_noise(
        &self,
        latents: &LatentClip,
        step: &SamplingStep,
        conditioning: &Conditioning,
        guidance: Guidance,
    ) -> Result<LatentClip, InferenceError> {
        let now = self.probe.in_sampler.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_in_sampler.fetch_max(now, Ordering::SeqCst);
        self.probe.sampler_calls.fetch_add(1, Ordering::SeqCst);
        // widen the window so an overlapping job would be caught
        std::thread::sleep(std::time::Duration::from_micros(200));
        let out = self.inner.predict_noise(latents, step, conditioning, guidance);
        self.probe.in_sampler.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

struct TrackingAccelerator {
    inner: Arc<dyn Accelerator>,
    probe: Arc<ExecutionProbe>,
}

impl Accelerator for TrackingAccelerator {
    fn device(&self) -> DeviceId {
        self.inner.device()
    }

    fn capacity_bytes(&self) -> u64 {
        self.inner.capacity_bytes()
    }

    fn in_use_bytes(&self) -> u64 {
        self.inner.in_use_bytes()
    }

    fn try_reserve(&self, bytes: u64) -> Result<(), InferenceError> {
        self.inner.try_reserve(bytes)
    }

    fn release(&self, bytes: u64) {
        self.inner.release(bytes)
    }

    fn reclaim(&self) {
        self.probe.reclaims.fetch_add(1, Ordering::SeqCst);
        self.inner.reclaim()
    }
}

/// Reference loader whose bundle reports into an [`ExecutionProbe`].
pub struct TrackingLoader {
    inner: ReferenceModelLoader,
    probe: Arc<ExecutionProbe>,
}

impl ModelLoader for TrackingLoader {
    fn name(&self) -> &str {
        "tracking-reference"
    }

    fn load(&self) -> Result<ModelBundle, ModelLoadError> {
        let mut bundle = self.inner.load()?;
        bundle.sampler = Arc::new(TrackingSampler {
            inner: Arc::clone(&bundle.sampler),
            probe: Arc::clone(&self.probe),
        });
        bundle.accelerator = Arc::new(TrackingAccelerator {
            inner: Arc::clone(&bundle.accelerator),
            probe: Arc::clone(&self.probe),
        });
        Ok(bundle)
    }
}

/// What the encoder was asked to produce.
#[derive(Debug, Clone)]
pub struct EncodeCall {
    pub output_path: PathBuf,
    pub frame_count: usize,
    pub fps: u32,
    pub duration_secs: f32,
}

/// Writes the frame digest to the output path instead of a real MP4.
#[derive(Default)]
pub struct RecordingEncoder {
    calls: Mutex<Vec<EncodeCall>>,
    fail: AtomicBool,
}

impl RecordingEncoder {
    pub fn calls(&self) -> Vec<EncodeCall> {
        self.calls.lock().clone()
    }

    /// Subsequent encodes write a partial file and then fail.
    pub fn fail_next(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl VideoEncoder for RecordingEncoder {
    fn name(&self) -> &str {
        "recording"
    }

    fn encode(&self, request: &EncodeRequest<'_>) -> Result<(), InferenceError> {
        self.calls.lock().push(EncodeCall {
            output_path: request.output_path.to_path_buf(),
            frame_count: request.frames.len(),
            fps: request.fps,
            duration_secs: request.duration_secs,
        });
        std::fs::write(request.output_path, frames_digest(request.frames))
            .map_err(|e| InferenceError::stage(Stage::Encode, e.to_string()))?;
        if self.fail.load(Ordering::SeqCst) {
            return Err(InferenceError::stage(Stage::Encode, "muxer crashed"));
        }
        Ok(())
    }
}

/// Keeps every notification instead of sending it.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(WebhookTarget, JobResult)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(WebhookTarget, JobResult)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, target: &WebhookTarget, result: &JobResult) -> Result<(), WebhookError> {
        self.sent.lock().push((target.clone(), result.clone()));
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────────────────────────

pub struct HarnessBuilder {
    config: WorkerConfig,
    checkpoints: bool,
}

impl HarnessBuilder {
    pub fn memory_limit_mb(mut self, mb: u64) -> Self {
        self.config.device.memory_limit_mb = Some(mb);
        self
    }

    pub fn admission_timeout_ms(mut self, ms: u64) -> Self {
        self.config.gate.admission_timeout_ms = ms;
        self
    }

    pub fn max_queue_depth(mut self, depth: usize) -> Self {
        self.config.gate.max_queue_depth = depth;
        self
    }

    pub fn inline_video(mut self) -> Self {
        self.config.webhook.include_video_base64 = true;
        self
    }

    /// Rate audio is normalized to during staging.
    pub fn staging_sample_rate(mut self, rate: u32) -> Self {
        self.config.staging.audio_sample_rate = rate;
        self
    }

    pub fn without_checkpoints(mut self) -> Self {
        self.checkpoints = false;
        self
    }

    pub fn build(mut self) -> Harness {
        init_test_logging();
        let root = TempDir::new().unwrap();
        let dirs = ["checkpoints", "staging", "outputs", "inputs"].map(|d| {
            let path = root.path().join(d);
            std::fs::create_dir_all(&path).unwrap();
            path
        });
        let [checkpoints, staging, outputs, inputs] = dirs;
        if self.checkpoints {
            fixtures::write_checkpoints(&checkpoints);
        }

        self.config.models.checkpoint_dir = checkpoints;
        self.config.staging.temp_root = Some(staging.clone());
        self.config.pipeline.output_dir = outputs.clone();

        let probe = Arc::new(ExecutionProbe::default());
        let loader = TrackingLoader {
            inner: ReferenceModelLoader::new(self.config.clone()),
            probe: Arc::clone(&probe),
        };
        let registry = Arc::new(ModelRegistry::new(Arc::new(loader)));
        let encoder = Arc::new(RecordingEncoder::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let orchestrator = JobOrchestrator::new(&self.config, registry, encoder.clone())
            .unwrap()
            .with_notifier(notifier.clone());

        let harness = Harness {
            root,
            staging,
            outputs,
            inputs,
            probe,
            encoder,
            notifier,
            orchestrator,
        };
        harness.write_input("face.png", &fixtures::face_png(96));
        harness.write_input("flat.png", &fixtures::flat_png(96));
        harness.write_input("voice_1s.wav", &fixtures::speech_wav(1.0, 16_000));
        harness.write_input("voice_4s.wav", &fixtures::speech_wav(4.0, 22_050));
        harness
    }
}

pub struct Harness {
    root: TempDir,
    pub staging: PathBuf,
    pub outputs: PathBuf,
    pub inputs: PathBuf,
    pub probe: Arc<ExecutionProbe>,
    pub encoder: Arc<RecordingEncoder>,
    pub notifier: Arc<RecordingNotifier>,
    pub orchestrator: JobOrchestrator,
}

impl Harness {
    /// Small images, few steps and a CPU device with a 64 MiB budget.
    pub fn builder() -> HarnessBuilder {
        let mut config = WorkerConfig::default();
        config.device.index = 4242;
        config.device.allow_cpu_fallback = true;
        config.device.memory_limit_mb = Some(64);
        config.models.min_host_memory_mb = 0;
        config.staging.image_resolution = 64;
        config.gate.admission_timeout_ms = 30_000;
        HarnessBuilder {
            config,
            checkpoints: true,
        }
    }

    pub fn new() -> Harness {
        Self::builder().build()
    }

    pub fn write_input(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.inputs.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    pub fn input(&self, name: &str) -> String {
        self.inputs.join(name).display().to_string()
    }

    /// Request for `face.png` + `voice_1s.wav` with three sampling steps;
    /// `overrides` are merged into `input`.
    pub fn request(&self, id: &str, overrides: Value) -> Value {
        let mut input = Map::new();
        input.insert("image_path".into(), json!(self.input("face.png")));
        input.insert("audio_path".into(), json!(self.input("voice_1s.wav")));
        input.insert("sampling_steps".into(), json!(3));
        input.insert("seed".into(), json!(42));
        if let Value::Object(extra) = overrides {
            for (k, v) in extra {
                if v.is_null() {
                    input.remove(&k);
                } else {
                    input.insert(k, v);
                }
            }
        }
        json!({ "id": id, "input": input })
    }

    /// Entries left under the staging root.
    pub fn staged_leftovers(&self) -> usize {
        count(&self.staging)
    }

    /// Output files whose name ends in `.partial`.
    pub fn partial_outputs(&self) -> usize {
        std::fs::read_dir(&self.outputs)
            .map(|d| {
                d.filter_map(Result::ok)
                    .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn output_path(&self, job_id: &str) -> PathBuf {
        self.outputs.join(format!("output_{job_id}.mp4"))
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }
}

fn count(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}
