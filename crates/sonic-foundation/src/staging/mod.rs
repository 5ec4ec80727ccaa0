//! Media staging
//!
//! Materializes a job's image and audio inside a per-job temp directory,
//! validates and normalizes them, and hands back a [`StagedMedia`] that owns
//! the directory. Releasing it, explicitly or by dropping it, deletes every
//! staged file.

mod audio_norm;
mod fetch;
mod image_norm;

pub use audio_norm::{is_wav, normalize_wav, resample};
pub use image_norm::{NormalizedImage, crop_resize, decode_and_normalize};

use reqwest::Client;
use sonic_kernel::config::{LimitsConfig, StagingConfig};
use sonic_kernel::error::StagingError;
use sonic_kernel::job::JobRequest;
use sonic_kernel::media::{ImageTensor, Waveform};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, info, warn};

const SOURCE_AUDIO: &str = "audio_source";
const TRANSCODED_AUDIO: &str = "audio_transcoded.wav";

/// Normalized inputs for one job, plus the temp directory holding them.
pub struct StagedMedia {
    pub job_id: String,
    pub image: ImageTensor,
    pub source_size: (u32, u32),
    pub waveform: Waveform,
    /// Original audio as received, for muxing into the output.
    pub audio_path: PathBuf,
    dir: Option<TempDir>,
}

impl StagedMedia {
    pub fn audio_secs(&self) -> f32 {
        self.waveform.duration_secs()
    }

    /// The temp directory, or `None` once released.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_ref().map(|d| d.path())
    }

    pub fn is_released(&self) -> bool {
        self.dir.is_none()
    }

    /// Resample the waveform to `rate` if it was staged at another rate.
    pub async fn conform_sample_rate(mut self, rate: u32) -> Result<Self, StagingError> {
        let from = self.waveform.sample_rate;
        if from == rate {
            return Ok(self);
        }
        tokio::task::spawn_blocking(move || {
            let samples = resample(&self.waveform.samples, from, rate)
                .map_err(|e| StagingError::decode("audio", e))?;
            debug!(job_id = %self.job_id, from, to = rate, "Audio resampled for the encoder");
            self.waveform = Waveform::new(rate, samples);
            Ok(self)
        })
        .await
        .map_err(|e| StagingError::io("resample task", e))?
    }

    /// Delete the staged files. Safe to call more than once.
    pub fn release(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        let path = dir.path().to_path_buf();
        match dir.close() {
            Ok(()) => {
                debug!(job_id = %self.job_id, dir = %path.display(), "Staged media released")
            }
            Err(e) => warn!(
                job_id = %self.job_id,
                dir = %path.display(),
                error = %e,
                "Failed to remove staging directory"
            ),
        }
    }
}

impl Drop for StagedMedia {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for StagedMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedMedia")
            .field("job_id", &self.job_id)
            .field("image", &(self.image.width, self.image.height))
            .field("audio_secs", &self.audio_secs())
            .field("dir", &self.dir())
            .finish()
    }
}

pub struct MediaStager {
    config: StagingConfig,
    limits: LimitsConfig,
    client: Client,
}

impl MediaStager {
    pub fn new(config: StagingConfig, limits: LimitsConfig) -> Result<Self, StagingError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()
            .map_err(|e| StagingError::io("http client", e))?;
        Ok(Self {
            config,
            limits,
            client,
        })
    }

    pub fn temp_root(&self) -> PathBuf {
        self.config
            .temp_root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Fetch, validate and normalize both inputs of `request`.
    ///
    /// On any error the partially staged directory is removed before
    /// returning.
    pub async fn stage(&self, request: &JobRequest) -> Result<StagedMedia, StagingError> {
        let start = Instant::now();
        let root = self.temp_root();
        std::fs::create_dir_all(&root).map_err(|e| StagingError::io("staging root", e))?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("sonic-{}-", request.id))
            .tempdir_in(&root)
            .map_err(|e| StagingError::io("staging directory", e))?;

        let (image_bytes, audio_bytes) = tokio::try_join!(
            fetch::fetch(&self.client, &request.image, "image", self.limits.max_image_bytes),
            fetch::fetch(&self.client, &request.audio, "audio", self.limits.max_audio_bytes),
        )?;

        let audio_path = dir.path().join(SOURCE_AUDIO);
        tokio::fs::write(&audio_path, &audio_bytes)
            .await
            .map_err(|e| StagingError::io("audio", e))?;

        let wav_bytes = if audio_norm::is_wav(&audio_bytes) {
            audio_bytes
        } else {
            let transcoded = dir.path().join(TRANSCODED_AUDIO);
            audio_norm::transcode_to_wav(
                &self.config.ffmpeg_path,
                &audio_path,
                &transcoded,
                self.config.audio_sample_rate,
            )
            .await?;
            tokio::fs::read(&transcoded)
                .await
                .map_err(|e| StagingError::io("audio", e))?
        };

        let resolution = self.config.image_resolution;
        let sample_rate = self.config.audio_sample_rate;
        let max_audio_secs = self.limits.max_audio_secs;
        let (image, waveform) = tokio::task::spawn_blocking(move || {
            let image = image_norm::decode_and_normalize(&image_bytes, resolution)?;
            let waveform = audio_norm::normalize_wav(&wav_bytes, sample_rate, max_audio_secs)?;
            Ok::<_, StagingError>((image, waveform))
        })
        .await
        .map_err(|e| StagingError::io("decode task", e))??;

        let staged = StagedMedia {
            job_id: request.id.clone(),
            image: image.tensor,
            source_size: (image.source_width, image.source_height),
            waveform,
            audio_path,
            dir: Some(dir),
        };
        info!(
            job_id = %request.id,
            image_source = request.image.kind(),
            audio_source = request.audio.kind(),
            source_width = image.source_width,
            source_height = image.source_height,
            audio_secs = staged.audio_secs(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Inputs staged"
        );
        Ok(staged)
    }
}
