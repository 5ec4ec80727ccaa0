//! MP4 encoding through an ffmpeg subprocess.
//!
//! Frames are streamed as raw RGB24 on stdin; the source audio is muxed in,
//! padded or trimmed to the clip duration. Bit-exact flags keep the container
//! free of timestamps and encoder version strings.

use sonic_kernel::config::PipelineConfig;
use sonic_kernel::error::{InferenceError, Stage};
use sonic_kernel::model::{EncodeRequest, VideoEncoder};
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::debug;

pub struct FfmpegEncoder {
    ffmpeg: String,
    crf: u8,
    preset: String,
}

impl FfmpegEncoder {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg_path.clone(),
            crf: config.crf,
            preset: config.x264_preset.clone(),
        }
    }

    fn args(&self, request: &EncodeRequest<'_>, width: u32, height: u32) -> Vec<String> {
        let mut args: Vec<String> = [
            "-nostdin",
            "-hide_banner",
            "-loglevel",
            "error",
            "-y",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgb24",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.extend([
            "-s".to_string(),
            format!("{width}x{height}"),
            "-r".to_string(),
            request.fps.to_string(),
            "-i".to_string(),
            "pipe:0".to_string(),
            "-i".to_string(),
            request.audio_path.display().to_string(),
            "-map".to_string(),
            "0:v:0".to_string(),
            "-map".to_string(),
            "1:a:0".to_string(),
            "-t".to_string(),
            format!("{:.3}", request.duration_secs),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            self.preset.clone(),
            "-crf".to_string(),
            self.crf.to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-af".to_string(),
            "apad".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            "128k".to_string(),
        ]);
        args.extend(
            [
                "-fflags",
                "+bitexact",
                "-flags:v",
                "+bitexact",
                "-flags:a",
                "+bitexact",
                "-map_metadata",
                "-1",
                "-movflags",
                "+faststart",
                "-f",
                "mp4",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args.push(request.output_path.display().to_string());
        args
    }
}

fn encode_err(reason: impl Into<String>) -> InferenceError {
    InferenceError::stage(Stage::Encode, reason)
}

impl VideoEncoder for FfmpegEncoder {
    fn name(&self) -> &str {
        "ffmpeg-libx264"
    }

    fn encode(&self, request: &EncodeRequest<'_>) -> Result<(), InferenceError> {
        let first = request
            .frames
            .first()
            .ok_or_else(|| encode_err("no frames to encode"))?;
        let (width, height) = (first.width, first.height);
        let frame_bytes = (width * height * 3) as usize;
        if request
            .frames
            .iter()
            .any(|f| f.width != width || f.height != height || f.rgb.len() != frame_bytes)
        {
            return Err(encode_err("frames differ in size"));
        }

        let args = self.args(request, width, height);
        debug!(ffmpeg = %self.ffmpeg, ?args, "Spawning encoder");

        let mut child = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| encode_err(format!("failed to run {}: {e}", self.ffmpeg)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| encode_err("encoder stdin unavailable"))?;

        // stdin is fed from a second thread so a full stderr pipe cannot stall us
        let write_result = std::thread::scope(|scope| {
            let writer = scope.spawn(move || -> std::io::Result<()> {
                for frame in request.frames {
                    stdin.write_all(&frame.rgb)?;
                }
                stdin.flush()
            });
            let output = child.wait_with_output();
            let written = writer
                .join()
                .unwrap_or_else(|_| Err(std::io::Error::other("frame writer panicked")));
            (written, output)
        });

        let (written, output) = write_result;
        let output = output.map_err(|e| encode_err(format!("waiting for encoder failed: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr.lines().last().unwrap_or("").trim();
            return Err(encode_err(format!(
                "encoder exited with {}: {reason}",
                output.status
            )));
        }
        written.map_err(|e| encode_err(format!("writing frames failed: {e}")))?;
        Ok(())
    }
}
