//! Processing status storage and persistence.
//!
//! SQLite-backed tracker for per-artifact completion state. All forward
//! transitions are conditional on the expected prior state, so concurrent
//! writers race safely: exactly one wins, the loser observes a conflict.

use super::models::*;
use super::schema::PIPELINE_SCHEMA_SQL;
use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Outcome of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The write won; state moved forward.
    Applied,
    /// The row was not in the expected state; nothing was written.
    Conflict,
}

impl TransitionOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied)
    }
}

/// Trait for pipeline state storage operations.
///
/// The single source of truth for per-artifact completion. Jobs read before
/// writing and write idempotently through the conditional `transition`.
pub trait ProcessingStatusStore: Send + Sync {
    // === Track lifecycle ===

    /// Create a track record in DRAFT state if absent. Idempotent.
    fn ensure_track(&self, track_id: &str) -> Result<()>;

    /// Get a track record by ID.
    fn get_track(&self, track_id: &str) -> Result<Option<TrackRecord>>;

    /// Record the stored master file and probed descriptor on a track.
    fn set_master_info(
        &self,
        track_id: &str,
        master_path: &str,
        master_format: &str,
        duration_secs: f64,
    ) -> Result<()>;

    /// Conditionally move the track lifecycle state forward.
    ///
    /// `failing_keys` is persisted when transitioning to FAILED, for operator
    /// visibility; pass an empty slice otherwise.
    fn set_track_state(
        &self,
        track_id: &str,
        from_expected: TrackState,
        to: TrackState,
        failing_keys: &[ArtifactKey],
    ) -> Result<TransitionOutcome>;

    // === Artifact state ===

    /// Insert QUEUED rows for every given key that is not already present.
    /// Safe under at-least-once fan-out: existing rows are left untouched.
    fn init_artifacts(&self, track_id: &str, keys: &[ArtifactKey]) -> Result<()>;

    /// Get the full artifact map for a track. Empty if nothing was scheduled.
    fn get_status(&self, track_id: &str) -> Result<ProcessingStatus>;

    /// Get the state of one artifact key.
    fn get_artifact(&self, track_id: &str, key: &ArtifactKey) -> Result<Option<ArtifactState>>;

    /// Conditionally transition one artifact key.
    ///
    /// The write only lands if the row currently holds `from_expected`. A
    /// completed artifact is immutable through this method; use
    /// `reset_for_reprocess` to clear it.
    fn transition(
        &self,
        track_id: &str,
        key: &ArtifactKey,
        from_expected: ArtifactStatus,
        to: &ArtifactState,
    ) -> Result<TransitionOutcome>;

    /// Reset a terminal key back to QUEUED, clearing attempts, errors and any
    /// completed asset reference. Conflicts unless the key is terminal.
    fn reset_for_reprocess(&self, track_id: &str, key: &ArtifactKey) -> Result<TransitionOutcome>;

    // === Statistics ===

    /// Aggregate counts across tracks and artifacts.
    fn stats(&self) -> Result<PipelineStats>;
}

/// SQLite implementation of ProcessingStatusStore.
pub struct SqlitePipelineStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePipelineStore {
    /// Open or create a pipeline database.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open pipeline database: {:?}", db_path.as_ref()))?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.execute_batch(PIPELINE_SCHEMA_SQL)?;
        info!("Opened pipeline database at {:?}", db_path.as_ref());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.execute_batch(PIPELINE_SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn row_to_track(row: &rusqlite::Row) -> rusqlite::Result<TrackRecord> {
        let failing_keys: Vec<ArtifactKey> = row
            .get::<_, Option<String>>("failing_keys")?
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();

        Ok(TrackRecord {
            id: row.get("id")?,
            state: TrackState::from_db_str(&row.get::<_, String>("state")?)
                .unwrap_or(TrackState::Draft),
            master_path: row.get("master_path")?,
            master_format: row.get("master_format")?,
            duration_secs: row.get("duration_secs")?,
            failing_keys,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn row_to_artifact(row: &rusqlite::Row) -> rusqlite::Result<(String, ArtifactState)> {
        let key: String = row.get("artifact_key")?;
        let status = ArtifactStatus::from_db_str(&row.get::<_, String>("status")?)
            .unwrap_or(ArtifactStatus::Queued);
        let at: i64 = row.get("updated_at")?;
        let attempts: u32 = row.get::<_, i64>("attempts")? as u32;

        let state = match status {
            ArtifactStatus::Queued => ArtifactState::Queued { at },
            ArtifactStatus::Running => ArtifactState::Running { at, attempt: attempts },
            ArtifactStatus::Completed => {
                let asset: ArtifactAsset = row
                    .get::<_, Option<String>>("asset_json")?
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .ok_or_else(|| {
                        rusqlite::Error::InvalidColumnType(
                            0,
                            "asset_json".to_string(),
                            rusqlite::types::Type::Text,
                        )
                    })?;
                ArtifactState::Completed { at, asset }
            }
            ArtifactStatus::Failed => ArtifactState::Failed {
                at,
                reason: row
                    .get::<_, Option<String>>("error_kind")?
                    .and_then(|s| ArtifactErrorKind::from_str(&s))
                    .unwrap_or(ArtifactErrorKind::TranscodeProcessError),
                message: row
                    .get::<_, Option<String>>("error_message")?
                    .unwrap_or_default(),
                attempts,
            },
        };

        Ok((key, state))
    }

    /// Column values (attempts, error_kind, error_message, asset_json) for a
    /// target state.
    fn state_columns(
        to: &ArtifactState,
    ) -> Result<(u32, Option<&'static str>, Option<String>, Option<String>)> {
        Ok(match to {
            ArtifactState::Queued { .. } => (0, None, None, None),
            ArtifactState::Running { attempt, .. } => (*attempt, None, None, None),
            ArtifactState::Completed { asset, .. } => {
                let json = serde_json::to_string(asset).context("serialize artifact asset")?;
                (0, None, None, Some(json))
            }
            ArtifactState::Failed {
                reason,
                message,
                attempts,
                ..
            } => (*attempts, Some(reason.as_str()), Some(message.clone()), None),
        })
    }
}

impl ProcessingStatusStore for SqlitePipelineStore {
    fn ensure_track(&self, track_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Self::now();
        conn.execute(
            "INSERT OR IGNORE INTO pipeline_tracks (id, state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![track_id, TrackState::Draft.as_db_str(), now],
        )?;
        Ok(())
    }

    fn get_track(&self, track_id: &str) -> Result<Option<TrackRecord>> {
        let conn = self.conn.lock().unwrap();
        let track = conn
            .prepare("SELECT * FROM pipeline_tracks WHERE id = ?1")?
            .query_row([track_id], Self::row_to_track)
            .optional()?;
        Ok(track)
    }

    fn set_master_info(
        &self,
        track_id: &str,
        master_path: &str,
        master_format: &str,
        duration_secs: f64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE pipeline_tracks
             SET master_path = ?2, master_format = ?3, duration_secs = ?4, updated_at = ?5
             WHERE id = ?1",
            params![track_id, master_path, master_format, duration_secs, Self::now()],
        )?;
        if updated == 0 {
            bail!("Track not found: {}", track_id);
        }
        Ok(())
    }

    fn set_track_state(
        &self,
        track_id: &str,
        from_expected: TrackState,
        to: TrackState,
        failing_keys: &[ArtifactKey],
    ) -> Result<TransitionOutcome> {
        let conn = self.conn.lock().unwrap();
        let failing_json = if failing_keys.is_empty() {
            None
        } else {
            Some(serde_json::to_string(failing_keys)?)
        };
        let updated = conn.execute(
            "UPDATE pipeline_tracks
             SET state = ?3, failing_keys = ?4, updated_at = ?5
             WHERE id = ?1 AND state = ?2",
            params![
                track_id,
                from_expected.as_db_str(),
                to.as_db_str(),
                failing_json,
                Self::now()
            ],
        )?;
        Ok(if updated == 1 {
            TransitionOutcome::Applied
        } else {
            TransitionOutcome::Conflict
        })
    }

    fn init_artifacts(&self, track_id: &str, keys: &[ArtifactKey]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Self::now();
        for key in keys {
            conn.execute(
                "INSERT OR IGNORE INTO pipeline_artifacts
                 (track_id, artifact_key, status, attempts, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 0, ?4, ?4)",
                params![track_id, key.as_str(), ArtifactStatus::Queued.as_db_str(), now],
            )?;
        }
        Ok(())
    }

    fn get_status(&self, track_id: &str) -> Result<ProcessingStatus> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM pipeline_artifacts WHERE track_id = ?1")?;
        let rows = stmt
            .query_map([track_id], Self::row_to_artifact)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut status = ProcessingStatus::default();
        for (key_str, state) in rows {
            // Unknown keys (from a newer deployment) are skipped rather than failing the read
            if let Some(key) = ArtifactKey::parse(&key_str) {
                status.artifacts.insert(key, state);
            }
        }
        Ok(status)
    }

    fn get_artifact(&self, track_id: &str, key: &ArtifactKey) -> Result<Option<ArtifactState>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .prepare(
                "SELECT * FROM pipeline_artifacts WHERE track_id = ?1 AND artifact_key = ?2",
            )?
            .query_row(params![track_id, key.as_str()], Self::row_to_artifact)
            .optional()?;
        Ok(row.map(|(_, state)| state))
    }

    fn transition(
        &self,
        track_id: &str,
        key: &ArtifactKey,
        from_expected: ArtifactStatus,
        to: &ArtifactState,
    ) -> Result<TransitionOutcome> {
        // A completed artifact is never silently replaced.
        if from_expected == ArtifactStatus::Completed {
            bail!("completed artifacts are immutable; use reset_for_reprocess");
        }

        let (attempts, error_kind, error_message, asset_json) = Self::state_columns(to)?;
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE pipeline_artifacts
             SET status = ?4, attempts = ?5, error_kind = ?6, error_message = ?7,
                 asset_json = ?8, updated_at = ?9
             WHERE track_id = ?1 AND artifact_key = ?2 AND status = ?3",
            params![
                track_id,
                key.as_str(),
                from_expected.as_db_str(),
                to.status().as_db_str(),
                attempts,
                error_kind,
                error_message,
                asset_json,
                Self::now()
            ],
        )?;
        Ok(if updated == 1 {
            TransitionOutcome::Applied
        } else {
            TransitionOutcome::Conflict
        })
    }

    fn reset_for_reprocess(&self, track_id: &str, key: &ArtifactKey) -> Result<TransitionOutcome> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE pipeline_artifacts
             SET status = ?3, attempts = 0, error_kind = NULL, error_message = NULL,
                 asset_json = NULL, updated_at = ?4
             WHERE track_id = ?1 AND artifact_key = ?2 AND status IN ('COMPLETED', 'FAILED')",
            params![
                track_id,
                key.as_str(),
                ArtifactStatus::Queued.as_db_str(),
                Self::now()
            ],
        )?;
        Ok(if updated == 1 {
            TransitionOutcome::Applied
        } else {
            TransitionOutcome::Conflict
        })
    }

    fn stats(&self) -> Result<PipelineStats> {
        let conn = self.conn.lock().unwrap();

        let track_count = |state: TrackState| -> Result<usize> {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM pipeline_tracks WHERE state = ?1",
                [state.as_db_str()],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        };
        let artifact_count = |status: ArtifactStatus| -> Result<usize> {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM pipeline_artifacts WHERE status = ?1",
                [status.as_db_str()],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        };

        Ok(PipelineStats {
            tracks_processing: track_count(TrackState::Processing)?,
            tracks_ready: track_count(TrackState::Ready)?,
            tracks_failed: track_count(TrackState::Failed)?,
            artifacts_queued: artifact_count(ArtifactStatus::Queued)?,
            artifacts_running: artifact_count(ArtifactStatus::Running)?,
            artifacts_completed: artifact_count(ArtifactStatus::Completed)?,
            artifacts_failed: artifact_count(ArtifactStatus::Failed)?,
        })
    }
}
