//! Track lifecycle event notifier.
//!
//! The pipeline emits {processing, ready, failed} transitions for downstream
//! consumers (owner notification, enabling playback endpoints). Delivery is an
//! external concern; this module only defines the seam and a tracing-backed
//! default.

use crate::pipeline::ArtifactKey;
use tracing::{info, warn};

/// Receives track lifecycle transitions emitted by the orchestrator.
pub trait TrackEventNotifier: Send + Sync {
    /// The track's upload validated and jobs were fanned out.
    fn track_processing(&self, track_id: &str);

    /// Every required artifact completed; the track is playable.
    fn track_ready(&self, track_id: &str);

    /// A required artifact exhausted its retries.
    fn track_failed(&self, track_id: &str, failing_keys: &[ArtifactKey]);
}

/// Default notifier that records transitions in the log.
pub struct LogNotifier;

impl TrackEventNotifier for LogNotifier {
    fn track_processing(&self, track_id: &str) {
        info!("Track {} entered processing", track_id);
    }

    fn track_ready(&self, track_id: &str) {
        info!("Track {} is ready", track_id);
    }

    fn track_failed(&self, track_id: &str, failing_keys: &[ArtifactKey]) {
        let keys: Vec<&str> = failing_keys.iter().map(|k| k.as_str()).collect();
        warn!("Track {} failed processing (keys: {})", track_id, keys.join(", "));
    }
}
