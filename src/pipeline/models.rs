//! Data models for the processing pipeline.
//!
//! Defines artifact keys, per-artifact states, derived asset descriptors and
//! the track lifecycle states they roll up into.

use serde::{Deserialize, Serialize};

/// A configured output quality for a transcoded rendition.
///
/// The set is closed: every supported quality is a variant here, so state
/// handling stays exhaustive at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioQuality {
    Kbps320,
    Kbps128,
}

impl AudioQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioQuality::Kbps320 => "320kbps",
            AudioQuality::Kbps128 => "128kbps",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "320kbps" => Some(AudioQuality::Kbps320),
            "128kbps" => Some(AudioQuality::Kbps128),
            _ => None,
        }
    }

    /// Target bitrate in kbps.
    pub fn bitrate_kbps(&self) -> u32 {
        match self {
            AudioQuality::Kbps320 => 320,
            AudioQuality::Kbps128 => 128,
        }
    }

    /// Output codec passed to the transcoder.
    pub fn codec(&self) -> &'static str {
        "libvorbis"
    }

    /// File extension of the produced rendition.
    pub fn extension(&self) -> &'static str {
        "ogg"
    }
}

/// Key identifying one derived artifact of a track.
///
/// One key per configured quality, plus the preview clip and the waveform
/// envelope. Keys are stable strings in storage and over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKey {
    Quality(AudioQuality),
    Preview,
    Waveform,
}

impl ArtifactKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKey::Quality(q) => q.as_str(),
            ArtifactKey::Preview => "preview",
            ArtifactKey::Waveform => "waveform",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "preview" => Some(ArtifactKey::Preview),
            "waveform" => Some(ArtifactKey::Waveform),
            other => AudioQuality::parse(other).map(ArtifactKey::Quality),
        }
    }
}

impl std::fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// Artifact keys appear as JSON map keys, so they serialize as plain strings.
impl Serialize for ArtifactKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ArtifactKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ArtifactKey::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown artifact key: {}", s)))
    }
}

/// Status of a single artifact within the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactStatus {
    Queued,
    Running,
    Completed, // terminal
    Failed,    // terminal once attempts are exhausted
}

impl ArtifactStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Queued => "QUEUED",
            ArtifactStatus::Running => "RUNNING",
            ArtifactStatus::Completed => "COMPLETED",
            ArtifactStatus::Failed => "FAILED",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(ArtifactStatus::Queued),
            "RUNNING" => Some(ArtifactStatus::Running),
            "COMPLETED" => Some(ArtifactStatus::Completed),
            "FAILED" => Some(ArtifactStatus::Failed),
            _ => None,
        }
    }

    /// Returns true if this is a terminal state (Completed or Failed).
    pub fn is_terminal(&self) -> bool {
        matches!(self, ArtifactStatus::Completed | ArtifactStatus::Failed)
    }
}

/// Reason an artifact attempt (or the whole key) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactErrorKind {
    TranscodeTimeout,     // external process exceeded its wall-clock budget - retry
    TranscodeProcessError, // non-zero exit or unusable output - retry
    StorageWriteFailed,   // durable storage rejected the upload - retry
    StorageReadFailed,    // master file could not be read - retry
    AttemptsExhausted,    // retry ceiling reached - terminal, needs explicit reprocess
}

impl ArtifactErrorKind {
    /// Returns true if this error kind should trigger another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ArtifactErrorKind::AttemptsExhausted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactErrorKind::TranscodeTimeout => "transcode_timeout",
            ArtifactErrorKind::TranscodeProcessError => "transcode_process_error",
            ArtifactErrorKind::StorageWriteFailed => "storage_write_failed",
            ArtifactErrorKind::StorageReadFailed => "storage_read_failed",
            ArtifactErrorKind::AttemptsExhausted => "attempts_exhausted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "transcode_timeout" => Some(ArtifactErrorKind::TranscodeTimeout),
            "transcode_process_error" => Some(ArtifactErrorKind::TranscodeProcessError),
            "storage_write_failed" => Some(ArtifactErrorKind::StorageWriteFailed),
            "storage_read_failed" => Some(ArtifactErrorKind::StorageReadFailed),
            "attempts_exhausted" => Some(ArtifactErrorKind::AttemptsExhausted),
            _ => None,
        }
    }
}

/// A transcoded audio rendition stored in durable storage.
///
/// Produced exactly once per successful quality or preview job. The reference
/// is immutable once written; reprocessing clears the key first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioAsset {
    /// Storage locator, `{track_id}/{artifact_key}/{checksum}.{ext}`.
    pub locator: String,
    /// Output codec (e.g. "libvorbis").
    pub codec: String,
    /// Target bitrate in kbps.
    pub bitrate_kbps: u32,
    /// Size of the stored object in bytes.
    pub size_bytes: u64,
    /// Duration of the rendition in seconds.
    pub duration_secs: f64,
    /// SHA-256 of the object contents, hex encoded.
    pub checksum: String,
}

/// Normalized amplitude envelope of the whole track, for UI rendering.
///
/// Regenerable from the master at any time; depends on no other artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveformAsset {
    /// Fixed-length sequence of peaks in [0, 1], spanning the full duration.
    pub peaks: Vec<f32>,
    /// Number of peaks (== peaks.len(), kept for API consumers).
    pub sample_count: usize,
    /// Duration of the source master used to compute the peaks.
    pub source_duration_secs: f64,
}

/// Asset payload attached to a completed artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactAsset {
    Audio(AudioAsset),
    Waveform(WaveformAsset),
}

/// Full state of one artifact key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactState {
    Queued {
        /// Unix timestamp of the last transition.
        at: i64,
    },
    Running {
        at: i64,
        /// 1-based attempt number currently executing.
        attempt: u32,
    },
    Completed {
        at: i64,
        asset: ArtifactAsset,
    },
    Failed {
        at: i64,
        reason: ArtifactErrorKind,
        message: String,
        /// Attempts made so far.
        attempts: u32,
    },
}

impl ArtifactState {
    pub fn status(&self) -> ArtifactStatus {
        match self {
            ArtifactState::Queued { .. } => ArtifactStatus::Queued,
            ArtifactState::Running { .. } => ArtifactStatus::Running,
            ArtifactState::Completed { .. } => ArtifactStatus::Completed,
            ArtifactState::Failed { .. } => ArtifactStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Attempts recorded on this state (0 for queued/completed-without-retries).
    pub fn attempts(&self) -> u32 {
        match self {
            ArtifactState::Running { attempt, .. } => *attempt,
            ArtifactState::Failed { attempts, .. } => *attempts,
            _ => 0,
        }
    }
}

/// Mapping from artifact key to its current state.
///
/// Keys are absent until their job is first scheduled; once present they only
/// move forward, except through an explicit reprocess.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingStatus {
    #[serde(flatten)]
    pub artifacts: std::collections::HashMap<ArtifactKey, ArtifactState>,
}

impl ProcessingStatus {
    pub fn get(&self, key: &ArtifactKey) -> Option<&ArtifactState> {
        self.artifacts.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Returns true if every one of the given keys is completed.
    pub fn all_completed(&self, keys: &[ArtifactKey]) -> bool {
        keys.iter().all(|k| {
            matches!(
                self.artifacts.get(k),
                Some(ArtifactState::Completed { .. })
            )
        })
    }

    /// Keys from the given set that are failed past their retry ceiling.
    pub fn exhausted_keys(&self, keys: &[ArtifactKey]) -> Vec<ArtifactKey> {
        keys.iter()
            .filter(|k| {
                matches!(
                    self.artifacts.get(k),
                    Some(ArtifactState::Failed {
                        reason: ArtifactErrorKind::AttemptsExhausted,
                        ..
                    })
                )
            })
            .copied()
            .collect()
    }
}

/// Lifecycle state of a track as seen by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackState {
    Draft,
    Processing,
    Ready,
    Failed,
    Rejected,
}

impl TrackState {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            TrackState::Draft => "DRAFT",
            TrackState::Processing => "PROCESSING",
            TrackState::Ready => "READY",
            TrackState::Failed => "FAILED",
            TrackState::Rejected => "REJECTED",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(TrackState::Draft),
            "PROCESSING" => Some(TrackState::Processing),
            "READY" => Some(TrackState::Ready),
            "FAILED" => Some(TrackState::Failed),
            "REJECTED" => Some(TrackState::Rejected),
            _ => None,
        }
    }
}

/// Pipeline-owned record for a track: lifecycle state plus master file info.
#[derive(Debug, Clone)]
pub struct TrackRecord {
    pub id: String,
    pub state: TrackState,
    /// Absolute path of the stored master file.
    pub master_path: Option<String>,
    /// Container format of the master, as probed at intake.
    pub master_format: Option<String>,
    /// Duration of the master in seconds, as probed at intake.
    pub duration_secs: Option<f64>,
    /// Required keys that exhausted their retries (set when state is FAILED).
    pub failing_keys: Vec<ArtifactKey>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Aggregate counts for operator visibility.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub tracks_processing: usize,
    pub tracks_ready: usize,
    pub tracks_failed: usize,
    pub artifacts_queued: usize,
    pub artifacts_running: usize,
    pub artifacts_completed: usize,
    pub artifacts_failed: usize,
}
