//! Audio decoding and normalization to mono at the encoder sample rate.
//!
//! RIFF/WAVE PCM is decoded natively. Other containers are transcoded to WAV
//! with ffmpeg first.

use hound::{SampleFormat, WavReader};
use rubato::{FftFixedIn, Resampler};
use sonic_kernel::error::{StagingError, ValidationError};
use sonic_kernel::media::Waveform;
use std::io::Cursor;
use std::path::Path;
use std::process::Stdio;
use tracing::debug;

const RESAMPLE_CHUNK: usize = 1024;
const RESAMPLE_SUB_CHUNKS: usize = 2;

fn unsupported(reason: impl Into<String>) -> ValidationError {
    ValidationError::Unsupported {
        what: "audio",
        reason: reason.into(),
    }
}

pub fn is_wav(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

/// Decode WAV bytes, downmix to mono, resample to `target_rate` and check
/// the duration against `max_secs`.
pub fn normalize_wav(
    bytes: &[u8],
    target_rate: u32,
    max_secs: f32,
) -> Result<Waveform, StagingError> {
    let (rate, mono) = decode_wav(bytes)?;
    if mono.is_empty() {
        return Err(unsupported("contains no samples").into());
    }

    let secs = mono.len() as f32 / rate as f32;
    if secs > max_secs {
        return Err(ValidationError::OutOfRange {
            field: "audio_duration_secs",
            value: secs as f64,
            min: 0.0,
            max: max_secs as f64,
        }
        .into());
    }

    let samples =
        resample(&mono, rate, target_rate).map_err(|e| StagingError::decode("audio", e))?;
    debug!(
        source_rate = rate,
        target_rate,
        samples = samples.len(),
        secs,
        "Audio normalized"
    );
    Ok(Waveform::new(target_rate, samples))
}

fn decode_wav(bytes: &[u8]) -> Result<(u32, Vec<f32>), StagingError> {
    let bad = |reason: String| StagingError::decode("audio", reason);
    let reader = WavReader::new(Cursor::new(bytes)).map_err(|e| bad(format!("bad WAV: {e}")))?;
    let spec = reader.spec();
    if spec.channels == 0 || spec.sample_rate == 0 {
        return Err(bad("WAV header has zero channels or sample rate".into()));
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| bad(format!("bad WAV data: {e}")))?,
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| bad(format!("bad WAV data: {e}")))?
        }
    };

    let channels = spec.channels as usize;
    let mono = interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();
    Ok((spec.sample_rate, mono))
}

/// Mono sample-rate conversion with rubato's FFT resampler.
pub fn resample(input: &[f32], from: u32, to: u32) -> Result<Vec<f32>, String> {
    if from == to || input.is_empty() {
        return Ok(input.to_vec());
    }

    let mut resampler =
        FftFixedIn::<f32>::new(from as usize, to as usize, RESAMPLE_CHUNK, RESAMPLE_SUB_CHUNKS, 1)
            .map_err(|e| format!("resampler setup failed: {e}"))?;

    let expected = (input.len() as f64 * to as f64 / from as f64).round() as usize;
    let delay = resampler.output_delay();
    let mut output = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK);

    let mut pos = 0;
    while output.len() < expected + delay {
        let needed = resampler.input_frames_next();
        let mut chunk = vec![0.0f32; needed];
        if pos < input.len() {
            let take = (input.len() - pos).min(needed);
            chunk[..take].copy_from_slice(&input[pos..pos + take]);
        }
        pos += needed;

        let out = resampler
            .process(&[chunk], None)
            .map_err(|e| format!("resampling failed: {e}"))?;
        output.extend_from_slice(&out[0]);
    }

    output.drain(..delay.min(output.len()));
    output.truncate(expected);
    Ok(output)
}

/// Transcode any ffmpeg-readable audio file to mono PCM WAV at `rate`.
pub async fn transcode_to_wav(
    ffmpeg: &str,
    src: &Path,
    dst: &Path,
    rate: u32,
) -> Result<(), StagingError> {
    let output = tokio::process::Command::new(ffmpeg)
        .args(["-nostdin", "-hide_banner", "-loglevel", "error", "-y", "-i"])
        .arg(src)
        .args(["-vn", "-ac", "1", "-ar"])
        .arg(rate.to_string())
        .args(["-acodec", "pcm_s16le", "-f", "wav"])
        .arg(dst)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| StagingError::io("audio", format!("failed to run {ffmpeg}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = stderr.lines().last().unwrap_or("ffmpeg failed").trim().to_string();
        return Err(StagingError::decode("audio", format!("ffmpeg: {reason}")));
    }
    Ok(())
}
