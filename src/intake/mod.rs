//! Intake validation for uploaded master files.
//!
//! Inspects container/codec and duration before any work is scheduled, so no
//! artifact job ever runs against input known to be invalid. Runs
//! synchronously at upload time and never mutates storage; the only side
//! effect is a bounded-time probe through the transcoder capability.

use crate::transcoder::{TranscodeError, Transcoder};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Default accepted container formats (lowercase extensions).
pub const DEFAULT_ACCEPTED_FORMATS: &[&str] = &["mp3", "flac", "wav", "ogg", "m4a", "aac"];

/// Rejection reasons surfaced synchronously to the uploader.
#[derive(Debug, Error, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum IntakeError {
    #[error("unsupported format: {detail}")]
    UnsupportedFormat { detail: String },

    #[error("corrupt or unreadable file: {detail}")]
    CorruptOrUnreadable { detail: String },

    #[error("duration out of bounds: {duration_secs}s (max: {max_secs}s)")]
    DurationOutOfBounds { duration_secs: f64, max_secs: f64 },

    #[error("probe timed out")]
    ProbeTimeout,
}

/// Validated-and-probed descriptor of an accepted master file.
#[derive(Debug, Clone)]
pub struct MasterDescriptor {
    /// Duration in seconds, as probed.
    pub duration_secs: f64,
    /// Input codec name.
    pub codec: String,
    /// Container format, as probed.
    pub container: String,
    /// Size of the uploaded file in bytes.
    pub size_bytes: u64,
}

/// Validates uploaded masters against the configured accepted formats and
/// duration bounds.
pub struct IntakeValidator {
    transcoder: Arc<dyn Transcoder>,
    accepted_formats: Vec<String>,
    max_duration_secs: f64,
}

impl IntakeValidator {
    pub fn new(
        transcoder: Arc<dyn Transcoder>,
        accepted_formats: Vec<String>,
        max_duration_secs: f64,
    ) -> Self {
        Self {
            transcoder,
            accepted_formats,
            max_duration_secs,
        }
    }

    /// Validate a stored upload. Returns a descriptor on success or the
    /// specific rejection reason.
    pub async fn validate(&self, path: &Path) -> Result<MasterDescriptor, IntakeError> {
        // (a) extension must be one of the accepted formats
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .ok_or_else(|| IntakeError::UnsupportedFormat {
                detail: "missing file extension".to_string(),
            })?;

        if !self.accepted_formats.iter().any(|f| f == &ext) {
            return Err(IntakeError::UnsupportedFormat { detail: ext });
        }

        // (a, continued) magic-byte sanity check
        let size_bytes = self.check_magic_bytes(path)?;

        // (b) bounded-time probe for duration and codec
        let probe = match self.transcoder.probe(path).await {
            Ok(p) => p,
            Err(TranscodeError::Timeout) => return Err(IntakeError::ProbeTimeout),
            Err(e) => {
                return Err(IntakeError::CorruptOrUnreadable {
                    detail: e.to_string(),
                })
            }
        };

        if probe.duration_secs <= 0.0 || probe.duration_secs > self.max_duration_secs {
            return Err(IntakeError::DurationOutOfBounds {
                duration_secs: probe.duration_secs,
                max_secs: self.max_duration_secs,
            });
        }

        debug!(
            "Validated master {:?}: {:.1}s, codec {}",
            path, probe.duration_secs, probe.codec
        );

        Ok(MasterDescriptor {
            duration_secs: probe.duration_secs,
            codec: probe.codec,
            container: probe.format,
            size_bytes,
        })
    }

    /// Sniff the file's leading bytes and require an audio signature.
    /// Returns the file size on success.
    fn check_magic_bytes(&self, path: &Path) -> Result<u64, IntakeError> {
        let metadata = std::fs::metadata(path).map_err(|e| IntakeError::CorruptOrUnreadable {
            detail: e.to_string(),
        })?;
        if metadata.len() == 0 {
            return Err(IntakeError::CorruptOrUnreadable {
                detail: "empty file".to_string(),
            });
        }

        let kind = infer::get_from_path(path).map_err(|e| IntakeError::CorruptOrUnreadable {
            detail: e.to_string(),
        })?;

        match kind {
            Some(k) if k.matcher_type() == infer::MatcherType::Audio => Ok(metadata.len()),
            // m4a sometimes sniffs as generic MP4 video container
            Some(k) if k.extension() == "mp4" => Ok(metadata.len()),
            Some(k) => Err(IntakeError::CorruptOrUnreadable {
                detail: format!("content looks like {}, not audio", k.mime_type()),
            }),
            // mp3 files without an ID3 tag defeat signature sniffing; let the
            // probe decide whether the content is readable
            None => Ok(metadata.len()),
        }
    }
}
