//! Pipeline orchestration.
//!
//! Fans a validated upload out into the set of required jobs, and on each
//! terminal artifact event recomputes aggregate readiness and drives the
//! track lifecycle. Recomputation is idempotent and order-independent: the
//! conditional track-state writes make `ready` (and `failed`) fire exactly
//! once no matter how many times or in what order terminal events arrive.

use crate::config::PipelineSettings;
use crate::intake::MasterDescriptor;
use crate::notify::TrackEventNotifier;
use crate::pipeline::jobs::ArtifactJob;
use crate::pipeline::models::*;
use crate::pipeline::status_store::ProcessingStatusStore;
use crate::queue::{lane_for, ArtifactTerminalSink, JobSubmitter};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Track state plus the full artifact map, for API consumers.
#[derive(Debug, Clone, Serialize)]
pub struct TrackProcessingView {
    pub track_id: String,
    pub state: TrackState,
    pub artifacts: ProcessingStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failing_keys: Vec<ArtifactKey>,
}

pub struct PipelineOrchestrator {
    store: Arc<dyn ProcessingStatusStore>,
    submitter: Arc<dyn JobSubmitter>,
    notifier: Arc<dyn TrackEventNotifier>,
    settings: PipelineSettings,
}

impl PipelineOrchestrator {
    pub fn new(
        store: Arc<dyn ProcessingStatusStore>,
        submitter: Arc<dyn JobSubmitter>,
        notifier: Arc<dyn TrackEventNotifier>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            submitter,
            notifier,
            settings,
        }
    }

    /// Every artifact key this deployment produces.
    fn all_keys(&self) -> Vec<ArtifactKey> {
        let mut keys: Vec<ArtifactKey> = self
            .settings
            .qualities
            .iter()
            .map(|q| ArtifactKey::Quality(*q))
            .collect();
        keys.push(ArtifactKey::Preview);
        keys.push(ArtifactKey::Waveform);
        keys
    }

    /// Fan a validated upload out into queued artifact entries and job
    /// submissions. Safe to call again for the same track while it is
    /// processing (at-least-once): existing artifact rows are left as-is and
    /// jobs are idempotent.
    pub fn on_intake_validated(
        &self,
        track_id: &str,
        master_path: &Path,
        descriptor: &MasterDescriptor,
    ) -> Result<()> {
        self.store.ensure_track(track_id)?;
        self.store.set_master_info(
            track_id,
            &master_path.to_string_lossy(),
            &descriptor.container,
            descriptor.duration_secs,
        )?;

        let moved = self
            .store
            .set_track_state(track_id, TrackState::Draft, TrackState::Processing, &[])?;
        if !moved.applied() {
            let track = self
                .store
                .get_track(track_id)?
                .context("track vanished during fan-out")?;
            if track.state != TrackState::Processing {
                bail!(
                    "Track {} cannot start processing from state {:?}",
                    track_id,
                    track.state
                );
            }
        }

        let keys = self.all_keys();
        self.store.init_artifacts(track_id, &keys)?;
        for key in &keys {
            self.submitter
                .submit(ArtifactJob::new(track_id, *key), lane_for(key))?;
        }

        info!(
            "Track {} validated ({:.1}s {}), fanned out {} artifact jobs",
            track_id,
            descriptor.duration_secs,
            descriptor.container,
            keys.len()
        );
        self.notifier.track_processing(track_id);
        Ok(())
    }

    /// Record an intake rejection.
    ///
    /// Only marks tracks the pipeline already owns a record for; a first
    /// upload that fails validation leaves no pipeline state behind, so the
    /// track remains a draft with an empty ProcessingStatus.
    pub fn on_intake_rejected(&self, track_id: &str) -> Result<()> {
        if self.store.get_track(track_id)?.is_some() {
            let moved = self.store.set_track_state(
                track_id,
                TrackState::Draft,
                TrackState::Rejected,
                &[],
            )?;
            if moved.applied() {
                info!("Track {} rejected at intake", track_id);
            }
        }
        Ok(())
    }

    /// Reprocess a single artifact key.
    ///
    /// Only valid when the key is in a terminal state; a running key cannot
    /// be restarted, which keeps two invocations from ever writing the same
    /// key concurrently.
    pub fn reprocess(&self, track_id: &str, key: ArtifactKey) -> Result<()> {
        let track = self
            .store
            .get_track(track_id)?
            .with_context(|| format!("Track not found: {}", track_id))?;
        if !self.all_keys().contains(&key) {
            bail!("Artifact key {} is not configured for this deployment", key);
        }

        let reset = self.store.reset_for_reprocess(track_id, &key)?;
        if !reset.applied() {
            bail!(
                "Artifact {} of track {} is not in a terminal state",
                key,
                track_id
            );
        }

        // A failed track goes back to processing while the key reruns.
        if track.state == TrackState::Failed {
            self.store
                .set_track_state(track_id, TrackState::Failed, TrackState::Processing, &[])?;
        }

        self.submitter
            .submit(ArtifactJob::new(track_id, key), lane_for(&key))?;
        info!("Reprocessing artifact {} of track {}", key, track_id);
        Ok(())
    }

    /// Full per-key map plus lifecycle state, as exposed to the surrounding
    /// system. Tracks the pipeline has never seen report DRAFT with an empty
    /// map.
    pub fn get_processing_status(&self, track_id: &str) -> Result<TrackProcessingView> {
        let track = self.store.get_track(track_id)?;
        let artifacts = self.store.get_status(track_id)?;
        let (state, failing_keys) = match track {
            Some(t) => (t.state, t.failing_keys),
            None => (TrackState::Draft, Vec::new()),
        };
        Ok(TrackProcessingView {
            track_id: track_id.to_string(),
            state,
            artifacts,
            failing_keys,
        })
    }

    /// Recompute aggregate readiness after a terminal artifact event.
    fn recompute_readiness(&self, track_id: &str) -> Result<()> {
        let status = self.store.get_status(track_id)?;
        let required = &self.settings.required_keys;

        if status.all_completed(required) {
            let moved =
                self.store
                    .set_track_state(track_id, TrackState::Processing, TrackState::Ready, &[])?;
            if moved.applied() {
                info!("Track {} is ready", track_id);
                self.notifier.track_ready(track_id);
            }
            return Ok(());
        }

        let exhausted = status.exhausted_keys(required);
        if !exhausted.is_empty() {
            let moved = self.store.set_track_state(
                track_id,
                TrackState::Processing,
                TrackState::Failed,
                &exhausted,
            )?;
            if moved.applied() {
                warn!(
                    "Track {} failed processing: {} required artifact(s) exhausted retries",
                    track_id,
                    exhausted.len()
                );
                self.notifier.track_failed(track_id, &exhausted);
            }
        }

        Ok(())
    }
}

impl ArtifactTerminalSink for PipelineOrchestrator {
    fn on_artifact_terminal(&self, track_id: &str, _key: &ArtifactKey) -> Result<()> {
        // The specific key doesn't matter: readiness is recomputed from the
        // full map so events can arrive in any order, any number of times.
        self.recompute_readiness(track_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::status_store::SqlitePipelineStore;
    use crate::queue::Lane;
    use std::sync::Mutex;

    const K320: ArtifactKey = ArtifactKey::Quality(AudioQuality::Kbps320);
    const K128: ArtifactKey = ArtifactKey::Quality(AudioQuality::Kbps128);

    /// Submitter that records jobs instead of running them.
    #[derive(Default)]
    struct RecordingSubmitter {
        jobs: Mutex<Vec<(ArtifactJob, Lane)>>,
    }

    impl RecordingSubmitter {
        fn submitted(&self) -> Vec<(ArtifactJob, Lane)> {
            self.jobs.lock().unwrap().clone()
        }
    }

    impl JobSubmitter for RecordingSubmitter {
        fn submit(&self, job: ArtifactJob, lane: Lane) -> Result<()> {
            self.jobs.lock().unwrap().push((job, lane));
            Ok(())
        }
    }

    /// Notifier that counts emitted lifecycle events.
    #[derive(Default)]
    struct CountingNotifier {
        processing: Mutex<u32>,
        ready: Mutex<u32>,
        failed: Mutex<Vec<Vec<ArtifactKey>>>,
    }

    impl TrackEventNotifier for CountingNotifier {
        fn track_processing(&self, _track_id: &str) {
            *self.processing.lock().unwrap() += 1;
        }
        fn track_ready(&self, _track_id: &str) {
            *self.ready.lock().unwrap() += 1;
        }
        fn track_failed(&self, _track_id: &str, failing_keys: &[ArtifactKey]) {
            self.failed.lock().unwrap().push(failing_keys.to_vec());
        }
    }

    struct Fixture {
        orchestrator: PipelineOrchestrator,
        store: Arc<dyn ProcessingStatusStore>,
        submitter: Arc<RecordingSubmitter>,
        notifier: Arc<CountingNotifier>,
    }

    fn make_fixture() -> Fixture {
        let store: Arc<dyn ProcessingStatusStore> =
            Arc::new(SqlitePipelineStore::in_memory().unwrap());
        let submitter = Arc::new(RecordingSubmitter::default());
        let notifier = Arc::new(CountingNotifier::default());
        let orchestrator = PipelineOrchestrator::new(
            store.clone(),
            submitter.clone(),
            notifier.clone(),
            PipelineSettings::default(),
        );
        Fixture {
            orchestrator,
            store,
            submitter,
            notifier,
        }
    }

    fn descriptor(duration_secs: f64) -> MasterDescriptor {
        MasterDescriptor {
            duration_secs,
            codec: "pcm_s16le".to_string(),
            container: "wav".to_string(),
            size_bytes: 1024,
        }
    }

    fn validate(fx: &Fixture, track_id: &str) {
        fx.orchestrator
            .on_intake_validated(track_id, Path::new("/media/masters/t/m.wav"), &descriptor(180.0))
            .unwrap();
    }

    fn complete_key(fx: &Fixture, track_id: &str, key: ArtifactKey) {
        let state = fx.store.get_artifact(track_id, &key).unwrap().unwrap();
        fx.store
            .transition(
                track_id,
                &key,
                state.status(),
                &ArtifactState::Running { at: 1, attempt: 1 },
            )
            .unwrap();
        fx.store
            .transition(
                track_id,
                &key,
                ArtifactStatus::Running,
                &ArtifactState::Completed {
                    at: 2,
                    asset: ArtifactAsset::Audio(AudioAsset {
                        locator: format!("{}/{}/c.ogg", track_id, key),
                        codec: "libvorbis".to_string(),
                        bitrate_kbps: 320,
                        size_bytes: 1,
                        duration_secs: 180.0,
                        checksum: "c".to_string(),
                    }),
                },
            )
            .unwrap();
    }

    fn exhaust_key(fx: &Fixture, track_id: &str, key: ArtifactKey) {
        let state = fx.store.get_artifact(track_id, &key).unwrap().unwrap();
        fx.store
            .transition(
                track_id,
                &key,
                state.status(),
                &ArtifactState::Running { at: 1, attempt: 3 },
            )
            .unwrap();
        fx.store
            .transition(
                track_id,
                &key,
                ArtifactStatus::Running,
                &ArtifactState::Failed {
                    at: 2,
                    reason: ArtifactErrorKind::AttemptsExhausted,
                    message: "retry ceiling reached".to_string(),
                    attempts: 3,
                },
            )
            .unwrap();
    }

    #[test]
    fn test_fan_out_creates_queued_entries_and_jobs() {
        let fx = make_fixture();
        validate(&fx, "t1");

        let view = fx.orchestrator.get_processing_status("t1").unwrap();
        assert_eq!(view.state, TrackState::Processing);
        for key in [K320, K128, ArtifactKey::Preview, ArtifactKey::Waveform] {
            assert!(
                matches!(view.artifacts.get(&key), Some(ArtifactState::Queued { .. })),
                "expected {} queued",
                key
            );
        }

        let jobs = fx.submitter.submitted();
        assert_eq!(jobs.len(), 4);
        // Waveform goes on the low-priority lane, everything else default
        for (job, lane) in &jobs {
            let expected = if job.key == ArtifactKey::Waveform {
                Lane::Low
            } else {
                Lane::Default
            };
            assert_eq!(*lane, expected, "lane for {}", job.key);
        }
        assert_eq!(*fx.notifier.processing.lock().unwrap(), 1);
    }

    #[test]
    fn test_ready_when_required_qualities_complete() {
        let fx = make_fixture();
        validate(&fx, "t1");

        complete_key(&fx, "t1", K320);
        fx.orchestrator.on_artifact_terminal("t1", &K320).unwrap();
        assert_eq!(
            fx.orchestrator.get_processing_status("t1").unwrap().state,
            TrackState::Processing
        );

        complete_key(&fx, "t1", K128);
        fx.orchestrator.on_artifact_terminal("t1", &K128).unwrap();

        // Ready even though preview and waveform are still queued
        let view = fx.orchestrator.get_processing_status("t1").unwrap();
        assert_eq!(view.state, TrackState::Ready);
        assert!(matches!(
            view.artifacts.get(&ArtifactKey::Preview),
            Some(ArtifactState::Queued { .. })
        ));
        assert_eq!(*fx.notifier.ready.lock().unwrap(), 1);
    }

    #[test]
    fn test_ready_exactly_once_any_order() {
        // Every completion order of the required keys reaches READY exactly
        // once, including duplicate terminal deliveries.
        let orders = [[K320, K128], [K128, K320]];
        for order in orders {
            let fx = make_fixture();
            validate(&fx, "t1");

            for key in order {
                complete_key(&fx, "t1", key);
                fx.orchestrator.on_artifact_terminal("t1", &key).unwrap();
                // Duplicate delivery of the same event
                fx.orchestrator.on_artifact_terminal("t1", &key).unwrap();
            }

            assert_eq!(
                fx.orchestrator.get_processing_status("t1").unwrap().state,
                TrackState::Ready
            );
            assert_eq!(*fx.notifier.ready.lock().unwrap(), 1, "order {:?}", order);
        }
    }

    #[test]
    fn test_optional_failure_does_not_fail_track() {
        let fx = make_fixture();
        validate(&fx, "t1");

        exhaust_key(&fx, "t1", ArtifactKey::Waveform);
        fx.orchestrator
            .on_artifact_terminal("t1", &ArtifactKey::Waveform)
            .unwrap();
        assert_eq!(
            fx.orchestrator.get_processing_status("t1").unwrap().state,
            TrackState::Processing
        );

        complete_key(&fx, "t1", K320);
        complete_key(&fx, "t1", K128);
        fx.orchestrator.on_artifact_terminal("t1", &K128).unwrap();

        assert_eq!(
            fx.orchestrator.get_processing_status("t1").unwrap().state,
            TrackState::Ready
        );
        assert!(fx.notifier.failed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_required_exhaustion_fails_track_with_keys() {
        let fx = make_fixture();
        validate(&fx, "t1");

        complete_key(&fx, "t1", K320);
        fx.orchestrator.on_artifact_terminal("t1", &K320).unwrap();

        exhaust_key(&fx, "t1", K128);
        fx.orchestrator.on_artifact_terminal("t1", &K128).unwrap();

        let view = fx.orchestrator.get_processing_status("t1").unwrap();
        assert_eq!(view.state, TrackState::Failed);
        assert_eq!(view.failing_keys, vec![K128]);
        assert_eq!(fx.notifier.failed.lock().unwrap().as_slice(), &[vec![K128]]);

        // A duplicate terminal event does not re-notify
        fx.orchestrator.on_artifact_terminal("t1", &K128).unwrap();
        assert_eq!(fx.notifier.failed.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_retryable_failure_is_not_terminal_for_track() {
        let fx = make_fixture();
        validate(&fx, "t1");

        // A failure still inside its retry budget
        let state = fx.store.get_artifact("t1", &K128).unwrap().unwrap();
        fx.store
            .transition(
                "t1",
                &K128,
                state.status(),
                &ArtifactState::Running { at: 1, attempt: 1 },
            )
            .unwrap();
        fx.store
            .transition(
                "t1",
                &K128,
                ArtifactStatus::Running,
                &ArtifactState::Failed {
                    at: 2,
                    reason: ArtifactErrorKind::TranscodeTimeout,
                    message: "timeout".to_string(),
                    attempts: 1,
                },
            )
            .unwrap();

        fx.orchestrator.on_artifact_terminal("t1", &K128).unwrap();
        assert_eq!(
            fx.orchestrator.get_processing_status("t1").unwrap().state,
            TrackState::Processing
        );
    }

    #[test]
    fn test_rejection_without_record_leaves_nothing() {
        let fx = make_fixture();
        fx.orchestrator.on_intake_rejected("t1").unwrap();

        let view = fx.orchestrator.get_processing_status("t1").unwrap();
        assert_eq!(view.state, TrackState::Draft);
        assert!(view.artifacts.is_empty());
        assert!(fx.submitter.submitted().is_empty());
    }

    #[test]
    fn test_rejection_with_existing_record() {
        let fx = make_fixture();
        fx.store.ensure_track("t1").unwrap();
        fx.orchestrator.on_intake_rejected("t1").unwrap();

        assert_eq!(
            fx.orchestrator.get_processing_status("t1").unwrap().state,
            TrackState::Rejected
        );
    }

    #[test]
    fn test_reprocess_resets_and_resubmits() {
        let fx = make_fixture();
        validate(&fx, "t1");

        complete_key(&fx, "t1", K320);
        exhaust_key(&fx, "t1", K128);
        fx.orchestrator.on_artifact_terminal("t1", &K128).unwrap();
        assert_eq!(
            fx.orchestrator.get_processing_status("t1").unwrap().state,
            TrackState::Failed
        );

        let before = fx.submitter.submitted().len();
        fx.orchestrator.reprocess("t1", K128).unwrap();

        let view = fx.orchestrator.get_processing_status("t1").unwrap();
        assert_eq!(view.state, TrackState::Processing);
        assert!(matches!(
            view.artifacts.get(&K128),
            Some(ArtifactState::Queued { .. })
        ));
        assert_eq!(fx.submitter.submitted().len(), before + 1);

        // Completing the rerun makes the track ready
        complete_key(&fx, "t1", K128);
        fx.orchestrator.on_artifact_terminal("t1", &K128).unwrap();
        assert_eq!(
            fx.orchestrator.get_processing_status("t1").unwrap().state,
            TrackState::Ready
        );
    }

    #[test]
    fn test_reprocess_rejects_non_terminal_key() {
        let fx = make_fixture();
        validate(&fx, "t1");

        // Queued is not terminal
        assert!(fx.orchestrator.reprocess("t1", K320).is_err());

        // Running is not terminal either
        fx.store
            .transition(
                "t1",
                &K320,
                ArtifactStatus::Queued,
                &ArtifactState::Running { at: 1, attempt: 1 },
            )
            .unwrap();
        assert!(fx.orchestrator.reprocess("t1", K320).is_err());
    }

    #[test]
    fn test_reprocess_completed_optional_artifact() {
        let fx = make_fixture();
        validate(&fx, "t1");

        complete_key(&fx, "t1", K320);
        complete_key(&fx, "t1", K128);
        fx.orchestrator.on_artifact_terminal("t1", &K320).unwrap();
        assert_eq!(
            fx.orchestrator.get_processing_status("t1").unwrap().state,
            TrackState::Ready
        );

        complete_key(&fx, "t1", ArtifactKey::Waveform);
        fx.orchestrator.reprocess("t1", ArtifactKey::Waveform).unwrap();

        // Track stays ready; rerunning an advisory artifact never regresses it
        assert_eq!(
            fx.orchestrator.get_processing_status("t1").unwrap().state,
            TrackState::Ready
        );
        // And a later terminal event does not notify ready a second time
        complete_key(&fx, "t1", ArtifactKey::Waveform);
        fx.orchestrator
            .on_artifact_terminal("t1", &ArtifactKey::Waveform)
            .unwrap();
        assert_eq!(*fx.notifier.ready.lock().unwrap(), 1);
    }

    #[test]
    fn test_fan_out_is_resubmittable() {
        let fx = make_fixture();
        validate(&fx, "t1");
        complete_key(&fx, "t1", K320);

        // A redelivered fan-out must not reset the completed key
        validate(&fx, "t1");
        let view = fx.orchestrator.get_processing_status("t1").unwrap();
        assert!(matches!(
            view.artifacts.get(&K320),
            Some(ArtifactState::Completed { .. })
        ));
    }

    #[test]
    fn test_reprocess_unknown_track() {
        let fx = make_fixture();
        assert!(fx.orchestrator.reprocess("ghost", K320).is_err());
    }
}
