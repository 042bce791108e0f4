//! ffmpeg/ffprobe-backed transcoder implementation.

use super::{ProbeResult, RunOutput, Transcoder, TranscodeError, TranscodeOperation};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Sample rate used when decoding audio for waveform extraction. Mono 8 kHz
/// is plenty for a 200-point envelope and keeps decode output small.
const WAVEFORM_DECODE_RATE: u32 = 8000;

/// Transcoder backed by the ffmpeg and ffprobe binaries.
pub struct FfmpegTranscoder {
    ffmpeg_bin: PathBuf,
    ffprobe_bin: PathBuf,
    /// Hard wall-clock budget per invocation.
    timeout: Duration,
    /// Maximum size of a produced output file in bytes.
    max_output_bytes: u64,
}

/// ffprobe JSON output structure.
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: String,
    duration: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    codec_name: Option<String>,
    sample_rate: Option<String>,
    channels: Option<i32>,
    bit_rate: Option<String>,
}

impl FfmpegTranscoder {
    pub fn new(
        ffmpeg_bin: impl Into<PathBuf>,
        ffprobe_bin: impl Into<PathBuf>,
        timeout: Duration,
        max_output_bytes: u64,
    ) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            ffprobe_bin: ffprobe_bin.into(),
            timeout,
            max_output_bytes,
        }
    }

    /// Run a command with the configured wall-clock timeout. The child is
    /// killed if the budget elapses.
    async fn run_with_timeout(
        &self,
        mut cmd: Command,
    ) -> Result<std::process::Output, TranscodeError> {
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TranscodeError::Timeout),
        }
    }

    fn check_output_size(&self, path: &Path) -> Result<u64, TranscodeError> {
        let size = std::fs::metadata(path)?.len();
        if size > self.max_output_bytes {
            return Err(TranscodeError::OutputTooLarge {
                actual: size,
                max: self.max_output_bytes,
            });
        }
        Ok(size)
    }

    async fn transcode_to_file(
        &self,
        input: &Path,
        output: &Path,
        extra_args: &[String],
    ) -> Result<RunOutput, TranscodeError> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.arg("-i").arg(input);
        cmd.args(extra_args);
        cmd.args(["-vn", "-y"]); // audio only, overwrite output
        cmd.arg(output);

        let result = self.run_with_timeout(cmd).await?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(TranscodeError::ProcessFailed(stderr.trim().to_string()));
        }

        self.check_output_size(output)?;
        Ok(RunOutput::File(output.to_path_buf()))
    }

    /// Decode the input to raw mono PCM and reduce it to `sample_count`
    /// normalized peaks spanning the full duration.
    async fn extract_waveform(
        &self,
        input: &Path,
        sample_count: usize,
    ) -> Result<RunOutput, TranscodeError> {
        if sample_count == 0 {
            return Err(TranscodeError::InvalidOutput(
                "sample_count must be positive".to_string(),
            ));
        }

        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.arg("-i").arg(input);
        cmd.args([
            "-ac",
            "1",
            "-ar",
            &WAVEFORM_DECODE_RATE.to_string(),
            "-f",
            "s16le",
            "-vn",
            "pipe:1",
        ]);

        let result = self.run_with_timeout(cmd).await?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(TranscodeError::ProcessFailed(stderr.trim().to_string()));
        }

        let samples: Vec<i16> = result
            .stdout
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        if samples.is_empty() {
            return Err(TranscodeError::InvalidOutput(
                "decoded zero audio samples".to_string(),
            ));
        }

        Ok(RunOutput::Waveform(compute_peaks(&samples, sample_count)))
    }
}

/// Reduce raw PCM samples to `sample_count` peak values normalized to [0, 1].
fn compute_peaks(samples: &[i16], sample_count: usize) -> Vec<f32> {
    let window = (samples.len() / sample_count).max(1);
    let mut peaks = Vec::with_capacity(sample_count);

    for i in 0..sample_count {
        let start = i * window;
        if start >= samples.len() {
            peaks.push(0.0);
            continue;
        }
        let end = (start + window).min(samples.len());
        let peak = samples[start..end]
            .iter()
            .map(|s| (*s as i32).unsigned_abs())
            .max()
            .unwrap_or(0);
        // i16::MIN's magnitude overshoots i16::MAX by one; clamp to keep [0, 1]
        peaks.push((peak as f32 / i16::MAX as f32).min(1.0));
    }

    peaks
}

fn parse_probe_output(stdout: &str) -> Result<ProbeResult, TranscodeError> {
    let probe: FfprobeOutput = serde_json::from_str(stdout)
        .map_err(|e| TranscodeError::InvalidOutput(format!("JSON parse error: {}", e)))?;

    // Find the audio stream
    let audio_stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type == "audio")
        .ok_or_else(|| TranscodeError::InvalidOutput("No audio stream found".to_string()))?;

    let duration_secs: f64 = probe
        .format
        .duration
        .as_ref()
        .and_then(|d| d.parse().ok())
        .unwrap_or(0.0);

    // Prefer stream bitrate, fall back to format bitrate
    let bitrate_str = audio_stream
        .bit_rate
        .as_ref()
        .or(probe.format.bit_rate.as_ref());
    let bitrate_kbps = bitrate_str
        .and_then(|b| b.parse::<i64>().ok())
        .map(|b| (b / 1000) as i32);

    let sample_rate = audio_stream
        .sample_rate
        .as_ref()
        .and_then(|sr| sr.parse().ok());

    Ok(ProbeResult {
        duration_secs,
        codec: audio_stream
            .codec_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        format: probe.format.format_name,
        bitrate_kbps,
        sample_rate,
        channels: audio_stream.channels,
    })
}

/// Parse the version from ffmpeg's first output line,
/// "ffmpeg version X.X.X ...".
fn parse_version_line(stdout: &str) -> Option<String> {
    let first_line = stdout.lines().next()?;
    let version_part = first_line.strip_prefix("ffmpeg version ")?;
    version_part.split_whitespace().next().map(|s| s.to_string())
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn is_available(&self) -> bool {
        let ffmpeg_ok = Command::new(&self.ffmpeg_bin)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false);

        let ffprobe_ok = Command::new(&self.ffprobe_bin)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false);

        ffmpeg_ok && ffprobe_ok
    }

    async fn version(&self) -> Option<String> {
        let output = Command::new(&self.ffmpeg_bin)
            .arg("-version")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_version_line(&String::from_utf8_lossy(&output.stdout))
    }

    async fn probe(&self, input: &Path) -> Result<ProbeResult, TranscodeError> {
        let mut cmd = Command::new(&self.ffprobe_bin);
        cmd.args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ]);
        cmd.arg(input);

        let result = self.run_with_timeout(cmd).await?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(TranscodeError::ProbeFailed(stderr.trim().to_string()));
        }

        parse_probe_output(&String::from_utf8_lossy(&result.stdout))
    }

    async fn run(
        &self,
        input: &Path,
        operation: &TranscodeOperation,
        work_dir: &Path,
    ) -> Result<RunOutput, TranscodeError> {
        debug!("Running transcode operation {:?} on {:?}", operation, input);

        match operation {
            TranscodeOperation::ToQuality { bitrate_kbps, codec } => {
                let output = work_dir.join("out.ogg");
                let args = vec![
                    "-c:a".to_string(),
                    codec.clone(),
                    "-b:a".to_string(),
                    format!("{}k", bitrate_kbps),
                ];
                self.transcode_to_file(input, &output, &args).await
            }
            TranscodeOperation::ExtractClip { start_secs, duration_secs } => {
                let output = work_dir.join("clip.ogg");
                let args = vec![
                    "-ss".to_string(),
                    format!("{:.3}", start_secs),
                    "-t".to_string(),
                    format!("{:.3}", duration_secs),
                    "-c:a".to_string(),
                    "libvorbis".to_string(),
                ];
                self.transcode_to_file(input, &output, &args).await
            }
            TranscodeOperation::ExtractWaveform { sample_count } => {
                self.extract_waveform(input, *sample_count).await
            }
        }
    }
}
