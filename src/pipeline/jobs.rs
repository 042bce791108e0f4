//! Artifact jobs: quality transcode, preview clip, waveform extraction.
//!
//! One job produces one artifact for one track. Jobs are idempotent under
//! at-least-once delivery: a job whose key is already completed is a no-op,
//! and every state write is conditional so duplicate or stale attempts lose
//! the race instead of corrupting state.

use crate::pipeline::models::*;
use crate::pipeline::status_store::{ProcessingStatusStore, TransitionOutcome};
use crate::storage::{artifact_object_key, checksum_hex, ObjectStore};
use crate::transcoder::{RunOutput, TranscodeError, TranscodeOperation, Transcoder};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Payload of one artifact job, as submitted to the queue.
///
/// Small and JSON-serializable so an external queue can carry it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactJob {
    pub track_id: String,
    pub key: ArtifactKey,
}

impl ArtifactJob {
    pub fn new(track_id: impl Into<String>, key: ArtifactKey) -> Self {
        Self {
            track_id: track_id.into(),
            key,
        }
    }
}

/// Outcome of a single job attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// This attempt produced the artifact and won the completion write.
    Completed,
    /// The key was already completed; nothing was done.
    AlreadyCompleted,
    /// Another attempt owns the key right now; this one exits without
    /// side effects on the tracker.
    Conflict,
    /// The attempt failed; the failure was recorded with this attempt count.
    Failed {
        kind: ArtifactErrorKind,
        message: String,
        attempts: u32,
    },
}

/// Parameters a job needs beyond its payload.
#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    /// Scratch root for per-attempt working directories.
    pub scratch_dir: PathBuf,
    pub preview_start_secs: f64,
    pub preview_duration_secs: f64,
    pub preview_bitrate_kbps: u32,
    pub waveform_sample_count: usize,
}

/// Executes artifact job attempts against the tracker, transcoder and
/// durable storage.
pub struct JobRunner {
    store: Arc<dyn ProcessingStatusStore>,
    transcoder: Arc<dyn Transcoder>,
    objects: Arc<dyn ObjectStore>,
    config: JobRunnerConfig,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn ProcessingStatusStore>,
        transcoder: Arc<dyn Transcoder>,
        objects: Arc<dyn ObjectStore>,
        config: JobRunnerConfig,
    ) -> Self {
        Self {
            store,
            transcoder,
            objects,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ProcessingStatusStore> {
        &self.store
    }

    /// Run one attempt of the given job.
    ///
    /// Store access errors bubble up as hard errors; transcode/storage
    /// failures are recorded into the tracker and returned as
    /// [`AttemptOutcome::Failed`] for the queue's retry policy to act on.
    pub async fn execute(&self, job: &ArtifactJob) -> Result<AttemptOutcome> {
        let track = self
            .store
            .get_track(&job.track_id)?
            .with_context(|| format!("Track not found: {}", job.track_id))?;

        let Some(current) = self.store.get_artifact(&job.track_id, &job.key)? else {
            bail!("Artifact {} was never scheduled for track {}", job.key, job.track_id);
        };

        // Idempotent short-circuit: at-least-once delivery makes duplicate
        // submissions normal, not exceptional.
        let claim_from = match current.status() {
            ArtifactStatus::Completed => {
                debug!(
                    "Job {}/{} already completed, skipping",
                    job.track_id, job.key
                );
                return Ok(AttemptOutcome::AlreadyCompleted);
            }
            ArtifactStatus::Running => return Ok(AttemptOutcome::Conflict),
            from @ (ArtifactStatus::Queued | ArtifactStatus::Failed) => from,
        };

        let attempt = current.attempts() + 1;
        let claimed = self.store.transition(
            &job.track_id,
            &job.key,
            claim_from,
            &ArtifactState::Running {
                at: chrono::Utc::now().timestamp(),
                attempt,
            },
        )?;
        if claimed == TransitionOutcome::Conflict {
            return Ok(AttemptOutcome::Conflict);
        }

        info!(
            "Running job {}/{} (attempt {})",
            job.track_id, job.key, attempt
        );

        // Work dir namespaced per (track, key, attempt) so concurrent
        // invocations never collide on a path
        let work_dir = self.config.scratch_dir.join(format!(
            "{}_{}_{}_{}",
            job.track_id,
            job.key,
            attempt,
            uuid::Uuid::new_v4()
        ));
        tokio::fs::create_dir_all(&work_dir).await?;

        let result = self.run_operation(&track, &job.key, &work_dir).await;

        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            debug!("Failed to clean up work dir {:?}: {}", work_dir, e);
        }

        match result {
            Ok(asset) => {
                let wrote = self.store.transition(
                    &job.track_id,
                    &job.key,
                    ArtifactStatus::Running,
                    &ArtifactState::Completed {
                        at: chrono::Utc::now().timestamp(),
                        asset,
                    },
                )?;
                if wrote == TransitionOutcome::Conflict {
                    // The stored object stays behind as a content-addressed
                    // orphan; no cleanup coordination needed.
                    warn!(
                        "Job {}/{} lost completion race, leaving orphan object",
                        job.track_id, job.key
                    );
                    return Ok(AttemptOutcome::Conflict);
                }
                info!("Job {}/{} completed", job.track_id, job.key);
                Ok(AttemptOutcome::Completed)
            }
            Err((kind, message)) => {
                warn!(
                    "Job {}/{} attempt {} failed: {} ({})",
                    job.track_id,
                    job.key,
                    attempt,
                    message,
                    kind.as_str()
                );
                self.store.transition(
                    &job.track_id,
                    &job.key,
                    ArtifactStatus::Running,
                    &ArtifactState::Failed {
                        at: chrono::Utc::now().timestamp(),
                        reason: kind,
                        message: message.clone(),
                        attempts: attempt,
                    },
                )?;
                Ok(AttemptOutcome::Failed {
                    kind,
                    message,
                    attempts: attempt,
                })
            }
        }
    }

    /// Mark a key permanently failed after its retry budget is spent.
    pub fn mark_exhausted(&self, job: &ArtifactJob, attempts: u32) -> Result<TransitionOutcome> {
        self.store.transition(
            &job.track_id,
            &job.key,
            ArtifactStatus::Failed,
            &ArtifactState::Failed {
                at: chrono::Utc::now().timestamp(),
                reason: ArtifactErrorKind::AttemptsExhausted,
                message: format!("retry ceiling reached after {} attempts", attempts),
                attempts,
            },
        )
    }

    /// Execute the transcoder operation for this key and build the asset.
    async fn run_operation(
        &self,
        track: &TrackRecord,
        key: &ArtifactKey,
        work_dir: &Path,
    ) -> std::result::Result<ArtifactAsset, (ArtifactErrorKind, String)> {
        let master_path = track.master_path.as_deref().ok_or((
            ArtifactErrorKind::StorageReadFailed,
            "track has no stored master file".to_string(),
        ))?;
        let master = Path::new(master_path);
        if !master.exists() {
            return Err((
                ArtifactErrorKind::StorageReadFailed,
                format!("master file missing: {}", master_path),
            ));
        }
        let master_duration = track.duration_secs.unwrap_or(0.0);

        match key {
            ArtifactKey::Quality(quality) => {
                let operation = TranscodeOperation::ToQuality {
                    bitrate_kbps: quality.bitrate_kbps(),
                    codec: quality.codec().to_string(),
                };
                let output = self.run_transcode(master, &operation, work_dir).await?;
                let asset = self
                    .upload_rendition(
                        &track.id,
                        key,
                        output,
                        quality.codec(),
                        quality.bitrate_kbps(),
                        master_duration,
                        quality.extension(),
                    )
                    .await?;
                Ok(ArtifactAsset::Audio(asset))
            }
            ArtifactKey::Preview => {
                // Clamp the configured window to the master's actual duration;
                // a short track previews in full.
                let (start, length) = clamp_preview_window(
                    self.config.preview_start_secs,
                    self.config.preview_duration_secs,
                    master_duration,
                );
                let operation = TranscodeOperation::ExtractClip {
                    start_secs: start,
                    duration_secs: length,
                };
                let output = self.run_transcode(master, &operation, work_dir).await?;
                let asset = self
                    .upload_rendition(
                        &track.id,
                        key,
                        output,
                        "libvorbis",
                        self.config.preview_bitrate_kbps,
                        length,
                        "ogg",
                    )
                    .await?;
                Ok(ArtifactAsset::Audio(asset))
            }
            ArtifactKey::Waveform => {
                let operation = TranscodeOperation::ExtractWaveform {
                    sample_count: self.config.waveform_sample_count,
                };
                match self.run_transcode(master, &operation, work_dir).await? {
                    RunOutput::Waveform(peaks) => Ok(ArtifactAsset::Waveform(WaveformAsset {
                        sample_count: peaks.len(),
                        peaks,
                        source_duration_secs: master_duration,
                    })),
                    RunOutput::File(_) => Err((
                        ArtifactErrorKind::TranscodeProcessError,
                        "waveform operation produced a file".to_string(),
                    )),
                }
            }
        }
    }

    async fn run_transcode(
        &self,
        master: &Path,
        operation: &TranscodeOperation,
        work_dir: &Path,
    ) -> std::result::Result<RunOutput, (ArtifactErrorKind, String)> {
        self.transcoder
            .run(master, operation, work_dir)
            .await
            .map_err(|e| match e {
                TranscodeError::Timeout => {
                    (ArtifactErrorKind::TranscodeTimeout, e.to_string())
                }
                other => (ArtifactErrorKind::TranscodeProcessError, other.to_string()),
            })
    }

    /// Read the produced file, checksum it and upload under the canonical
    /// content-addressed key.
    #[allow(clippy::too_many_arguments)]
    async fn upload_rendition(
        &self,
        track_id: &str,
        key: &ArtifactKey,
        output: RunOutput,
        codec: &str,
        bitrate_kbps: u32,
        duration_secs: f64,
        extension: &str,
    ) -> std::result::Result<AudioAsset, (ArtifactErrorKind, String)> {
        let RunOutput::File(path) = output else {
            return Err((
                ArtifactErrorKind::TranscodeProcessError,
                "transcode operation produced no file".to_string(),
            ));
        };

        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            (
                ArtifactErrorKind::TranscodeProcessError,
                format!("failed to read transcoder output: {}", e),
            )
        })?;

        let checksum = checksum_hex(&bytes);
        let object_key = artifact_object_key(track_id, key.as_str(), &checksum, extension);
        let locator = self
            .objects
            .put(&object_key, &bytes)
            .await
            .map_err(|e| (ArtifactErrorKind::StorageWriteFailed, e.to_string()))?;

        Ok(AudioAsset {
            locator,
            codec: codec.to_string(),
            bitrate_kbps,
            size_bytes: bytes.len() as u64,
            duration_secs,
            checksum,
        })
    }
}

/// Clamp the configured preview window to the master duration.
fn clamp_preview_window(start: f64, length: f64, master_duration: f64) -> (f64, f64) {
    if master_duration <= 0.0 {
        return (0.0, length);
    }
    if master_duration <= length {
        // Whole track is shorter than the configured clip
        return (0.0, master_duration);
    }
    let start = start.clamp(0.0, master_duration - length);
    (start, length)
}
