//! Transcoder capability.
//!
//! Thin wrapper around an external command-line audio transcoder. This is the
//! only part of the pipeline that invokes an external process; everything else
//! talks to it through the [`Transcoder`] trait so job logic can be tested
//! with a fake implementation.

mod ffmpeg;

pub use ffmpeg::FfmpegTranscoder;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during probing or transcoding.
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("transcoder process timed out")]
    Timeout,

    #[error("transcoder process failed: {0}")]
    ProcessFailed(String),

    #[error("probe failed: {0}")]
    ProbeFailed(String),

    #[error("invalid transcoder output: {0}")]
    InvalidOutput(String),

    #[error("output too large: {actual} bytes (max: {max})")]
    OutputTooLarge { actual: u64, max: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio metadata extracted by probing a file.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    /// Duration in seconds.
    pub duration_secs: f64,
    /// Audio codec name.
    pub codec: String,
    /// Container format name (e.g. "mp3", "flac").
    pub format: String,
    /// Bitrate in kbps, when the container reports one.
    pub bitrate_kbps: Option<i32>,
    /// Sample rate in Hz.
    pub sample_rate: Option<i32>,
    /// Number of channels.
    pub channels: Option<i32>,
}

/// A single transcoder operation applied to an input file.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscodeOperation {
    /// Transcode the full input to a target bitrate/codec.
    ToQuality { bitrate_kbps: u32, codec: String },
    /// Extract a clip starting at `start_secs` for `duration_secs`.
    ExtractClip { start_secs: f64, duration_secs: f64 },
    /// Compute a fixed-length normalized amplitude envelope.
    ExtractWaveform { sample_count: usize },
}

/// Result of a successful [`Transcoder::run`].
#[derive(Debug, Clone)]
pub enum RunOutput {
    /// Path of the produced audio file, inside the caller's work dir.
    File(PathBuf),
    /// Normalized amplitude samples in [0, 1].
    Waveform(Vec<f32>),
}

/// Capability interface over the external transcoder binary.
///
/// `run` enforces a hard wall-clock timeout and a maximum output size and
/// returns typed failures rather than panicking past this boundary; callers
/// decide retry policy. Output paths are confined to the per-attempt
/// `work_dir` the caller provides, so concurrent invocations never collide.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Whether the external binary is present and functional.
    async fn is_available(&self) -> bool;

    /// Version string of the external binary, if it can be determined.
    async fn version(&self) -> Option<String>;

    /// Probe an input file for duration and codec information.
    async fn probe(&self, input: &Path) -> Result<ProbeResult, TranscodeError>;

    /// Run one transcode operation against `input`, writing any produced
    /// file into `work_dir`.
    async fn run(
        &self,
        input: &Path,
        operation: &TranscodeOperation,
        work_dir: &Path,
    ) -> Result<RunOutput, TranscodeError>;
}
