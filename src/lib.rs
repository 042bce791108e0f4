//! Trackpipe Server Library
//!
//! Audio ingestion and transcoding pipeline: takes one uploaded master audio
//! file per track and produces the derived artifacts needed to serve it
//! (bitrate renditions, a preview clip, a waveform envelope), tracking
//! per-artifact completion so the track is marked ready exactly once.
//!
//! This library exposes the internal modules for testing and potential reuse.

pub mod config;
pub mod intake;
pub mod notify;
pub mod pipeline;
pub mod queue;
pub mod server;
pub mod storage;
pub mod transcoder;

// Re-export commonly used types for convenience
pub use config::{AppConfig, PipelineSettings};
pub use intake::{IntakeError, IntakeValidator, MasterDescriptor};
pub use notify::{LogNotifier, TrackEventNotifier};
pub use pipeline::{
    ArtifactJob, ArtifactKey, ArtifactState, AudioQuality, JobRunner, PipelineOrchestrator,
    ProcessingStatus, ProcessingStatusStore, SqlitePipelineStore, TrackState,
};
pub use queue::{JobSubmitter, Lane, WorkerPool, WorkerPoolConfig};
pub use storage::{FsObjectStore, MemoryObjectStore, ObjectStore};
pub use transcoder::{FfmpegTranscoder, Transcoder};
