//! Database schema for the processing pipeline.
//!
//! Two tables:
//! - pipeline_tracks: lifecycle state + master file info, one row per track
//! - pipeline_artifacts: one row per (track, artifact key)

/// SQL schema for the pipeline database (version 1).
pub const PIPELINE_SCHEMA_SQL: &str = r#"
-- Track lifecycle and master file bookkeeping
CREATE TABLE IF NOT EXISTS pipeline_tracks (
    id TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    master_path TEXT,
    master_format TEXT,
    duration_secs REAL,

    -- Required keys that exhausted retries, JSON array of key strings
    failing_keys TEXT,

    -- Timestamps (Unix seconds)
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Per-artifact completion state
CREATE TABLE IF NOT EXISTS pipeline_artifacts (
    track_id TEXT NOT NULL,
    artifact_key TEXT NOT NULL,
    status TEXT NOT NULL,

    -- Attempt accounting
    attempts INTEGER NOT NULL DEFAULT 0,

    -- Failure detail (set while status = FAILED)
    error_kind TEXT,
    error_message TEXT,

    -- Completed asset payload, JSON (AudioAsset or WaveformAsset)
    asset_json TEXT,

    -- Timestamps (Unix seconds)
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,

    PRIMARY KEY (track_id, artifact_key),
    FOREIGN KEY (track_id) REFERENCES pipeline_tracks(id) ON DELETE CASCADE
);

-- Indexes
CREATE INDEX IF NOT EXISTS idx_pipeline_tracks_state ON pipeline_tracks(state);
CREATE INDEX IF NOT EXISTS idx_pipeline_artifacts_status ON pipeline_artifacts(status);
"#;

/// Current schema version.
pub const PIPELINE_SCHEMA_VERSION: i32 = 1;
