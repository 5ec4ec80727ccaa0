//! Worker configuration
//!
//! Layering, later sources win:
//!
//! 1. built-in defaults ([`WorkerConfig::default`])
//! 2. an optional file (YAML, TOML, JSON or JSON5, format from the extension,
//!    `${VAR}` references substituted from the environment)
//! 3. environment variables `SONIC__<SECTION>__<KEY>`, e.g.
//!    `SONIC__DEVICE__INDEX=1` or `SONIC__MODELS__CHECKPOINT_DIR=/ckpt`
//!
//! The result is checked with [`WorkerConfig::validate`] before use.

use config::{Config as Cfg, Environment, File, FileFormat};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

pub const ENV_PREFIX: &str = "SONIC";

/// Configuration loading error
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Detect configuration format from file extension
pub fn detect_format(path: &Path) -> ConfigResult<FileFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        "json5" => Ok(FileFormat::Json5),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

static ENV_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env reference pattern is valid")
});

/// Substitute `${VAR_NAME}` references with environment values.
///
/// Unset variables are left untouched.
pub fn substitute_env_vars(content: &str) -> String {
    ENV_REF
        .replace_all(content, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

/// Parse a configuration string with an explicit format
pub fn from_str<T>(content: &str, format: FileFormat) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let substituted_content = substitute_env_vars(content);

    let config = Cfg::builder()
        .add_source(File::from_str(&substituted_content, format))
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    config
        .try_deserialize()
        .map_err(|e| ConfigError::Serialization(e.to_string()))
}

// ============================================================================
// Schema
// ============================================================================

/// Complete worker configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub device: DeviceConfig,
    pub models: ModelsConfig,
    pub limits: LimitsConfig,
    pub staging: StagingConfig,
    pub gate: GateConfig,
    pub pipeline: PipelineConfig,
    pub webhook: WebhookConfig,
}

/// Accelerator selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// CUDA device ordinal.
    pub index: u32,
    /// Bind to the CPU when the device is missing. Development only.
    pub allow_cpu_fallback: bool,
    /// Override the probed device memory, in MiB.
    pub memory_limit_mb: Option<u64>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            index: 0,
            allow_cpu_fallback: false,
            memory_limit_mb: None,
        }
    }
}

/// Checkpoint location and load-time checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub checkpoint_dir: PathBuf,
    /// Verify `manifest.sha256` when present.
    pub verify_manifest: bool,
    /// Minimum free host RAM before loading, in MiB.
    pub min_host_memory_mb: u64,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("checkpoints"),
            verify_manifest: true,
            min_host_memory_mb: 4096,
        }
    }
}

/// Request and input limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_duration_secs: f32,
    pub max_sampling_steps: u32,
    pub max_image_bytes: u64,
    pub max_audio_bytes: u64,
    pub max_audio_secs: f32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: 60.0,
            max_sampling_steps: 100,
            max_image_bytes: 20 * 1024 * 1024,
            max_audio_bytes: 50 * 1024 * 1024,
            max_audio_secs: 300.0,
        }
    }
}

/// Input fetching and normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Parent of the per-job temp dirs. System temp dir when unset.
    pub temp_root: Option<PathBuf>,
    pub fetch_timeout_secs: u64,
    /// Square edge length images are normalized to.
    pub image_resolution: u32,
    pub audio_sample_rate: u32,
    /// Used to transcode non-WAV audio.
    pub ffmpeg_path: String,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            temp_root: None,
            fetch_timeout_secs: 60,
            image_resolution: 512,
            audio_sample_rate: 16_000,
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }
}

/// Execution gate admission policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub admission_timeout_ms: u64,
    /// Jobs allowed to wait while one is executing.
    pub max_queue_depth: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            admission_timeout_ms: 10 * 60 * 1000,
            max_queue_depth: 32,
        }
    }
}

/// Inference and encoding settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub fps: u32,
    pub face_expand_ratio: f32,
    pub output_dir: PathBuf,
    pub ffmpeg_path: String,
    pub crf: u8,
    pub x264_preset: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fps: 25,
            face_expand_ratio: 0.5,
            output_dir: PathBuf::from("/tmp/sonic_outputs"),
            ffmpeg_path: "ffmpeg".to_string(),
            crf: 18,
            x264_preset: "medium".to_string(),
        }
    }
}

/// Completion notification delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub timeout_secs: u64,
    /// Embed the video as base64 in the result and the notification.
    pub include_video_base64: bool,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            include_video_base64: false,
        }
    }
}

impl WorkerConfig {
    /// Load defaults, then `path` (if any), then `SONIC__*` environment variables.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        Self::load_layers(path, None)
    }

    /// Same as [`WorkerConfig::load`], with the environment layer read from
    /// `env` instead of the process environment.
    pub fn load_layers(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> ConfigResult<Self> {
        let defaults = Cfg::try_from(&WorkerConfig::default())
            .map_err(|e| ConfigError::Serialization(e.to_string()))?;

        let mut builder = Cfg::builder().add_source(defaults);

        if let Some(path) = path {
            let format = detect_format(path)?;
            let content = std::fs::read_to_string(path)?;
            let substituted = substitute_env_vars(&content);
            builder = builder.add_source(File::from_str(&substituted, format));
            tracing::debug!(path = %path.display(), "Configuration file layered over defaults");
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let config: WorkerConfig = builder
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ConfigError::Serialization(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.pipeline.fps == 0 {
            return invalid("pipeline.fps must be greater than zero".into());
        }
        let res = self.staging.image_resolution;
        if res < 64 || res % 8 != 0 {
            return invalid(format!(
                "staging.image_resolution must be a multiple of 8 and at least 64, got {res}"
            ));
        }
        if self.staging.audio_sample_rate == 0 {
            return invalid("staging.audio_sample_rate must be greater than zero".into());
        }
        if !(self.limits.max_duration_secs.is_finite() && self.limits.max_duration_secs > 0.0) {
            return invalid("limits.max_duration_secs must be positive".into());
        }
        if !(self.limits.max_audio_secs.is_finite() && self.limits.max_audio_secs > 0.0) {
            return invalid("limits.max_audio_secs must be positive".into());
        }
        if self.limits.max_sampling_steps == 0 {
            return invalid("limits.max_sampling_steps must be greater than zero".into());
        }
        if self.limits.max_image_bytes == 0 || self.limits.max_audio_bytes == 0 {
            return invalid(
                "limits.max_image_bytes and limits.max_audio_bytes must be non-zero".into(),
            );
        }
        if !(self.pipeline.face_expand_ratio.is_finite() && self.pipeline.face_expand_ratio >= 0.0)
        {
            return invalid("pipeline.face_expand_ratio must be non-negative".into());
        }
        if self.pipeline.crf > 51 {
            return invalid(format!("pipeline.crf must be 0..=51, got {}", self.pipeline.crf));
        }
        if self.gate.admission_timeout_ms == 0 {
            return invalid("gate.admission_timeout_ms must be greater than zero".into());
        }
        Ok(())
    }
}
