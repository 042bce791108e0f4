//! Audio processing pipeline.
//!
//! Takes a single validated master file per track and deterministically
//! produces every derived artifact needed to serve it:
//! 1. One transcoded rendition per configured quality
//! 2. A bounded-duration preview clip
//! 3. A waveform amplitude envelope for UI rendering
//!
//! Each artifact is an independent, retryable job writing its terminal state
//! into the processing status tracker; the orchestrator rolls the per-key
//! states up into a single track readiness signal.

mod jobs;
mod models;
mod orchestrator;
mod retry_policy;
mod schema;
mod status_store;

pub use jobs::{ArtifactJob, AttemptOutcome, JobRunner, JobRunnerConfig};
pub use models::{
    ArtifactAsset, ArtifactErrorKind, ArtifactKey, ArtifactState, ArtifactStatus, AudioAsset,
    AudioQuality, PipelineStats, ProcessingStatus, TrackRecord, TrackState, WaveformAsset,
};
pub use orchestrator::{PipelineOrchestrator, TrackProcessingView};
pub use retry_policy::RetryPolicy;
pub use schema::{PIPELINE_SCHEMA_SQL, PIPELINE_SCHEMA_VERSION};
pub use status_store::{ProcessingStatusStore, SqlitePipelineStore, TransitionOutcome};
