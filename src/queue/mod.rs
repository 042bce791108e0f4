//! Job submission interface and the in-process two-lane worker pool.
//!
//! The pipeline submits work through the narrow [`JobSubmitter`] seam and
//! learns about terminal outcomes through [`ArtifactTerminalSink`], so the
//! orchestration logic stays testable without a real queue. The default
//! deployment is the [`WorkerPool`] below: background workers pulling from a
//! latency-sensitive default lane and a deferrable low-priority lane.

use crate::pipeline::{ArtifactJob, ArtifactKey, AttemptOutcome, JobRunner, RetryPolicy};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Priority class of the job queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// Quality transcodes and preview extraction: playback readiness should
    /// never wait.
    Default,
    /// Waveform extraction: CPU-heavy, deferrable.
    Low,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Default => "default",
            Lane::Low => "low",
        }
    }
}

/// Lane an artifact key is scheduled on.
pub fn lane_for(key: &ArtifactKey) -> Lane {
    match key {
        ArtifactKey::Waveform => Lane::Low,
        _ => Lane::Default,
    }
}

/// Narrow job-submission interface consumed by the orchestrator.
///
/// Implementations must tolerate duplicate submissions: jobs are idempotent
/// and delivery is at-least-once.
pub trait JobSubmitter: Send + Sync {
    fn submit(&self, job: ArtifactJob, lane: Lane) -> Result<()>;
}

/// Receives terminal artifact outcomes (completed, or failed past the retry
/// ceiling). Implemented by the orchestrator.
pub trait ArtifactTerminalSink: Send + Sync {
    fn on_artifact_terminal(&self, track_id: &str, key: &ArtifactKey) -> Result<()>;
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Workers on the default lane.
    pub default_lane_workers: usize,
    /// Workers on the low-priority lane.
    pub low_lane_workers: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            default_lane_workers: 4,
            low_lane_workers: 1,
        }
    }
}

type JobReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ArtifactJob>>>;

/// In-process two-lane worker pool.
///
/// Jobs block only on their own transcoder invocation and storage I/O; the
/// only shared state they touch is the tracker's conditional writes.
pub struct WorkerPool {
    default_tx: mpsc::UnboundedSender<ArtifactJob>,
    low_tx: mpsc::UnboundedSender<ArtifactJob>,
    default_rx: JobReceiver,
    low_rx: JobReceiver,
    runner: Arc<JobRunner>,
    policy: RetryPolicy,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(runner: Arc<JobRunner>, policy: RetryPolicy, config: WorkerPoolConfig) -> Self {
        let (default_tx, default_rx) = mpsc::unbounded_channel();
        let (low_tx, low_rx) = mpsc::unbounded_channel();
        Self {
            default_tx,
            low_tx,
            default_rx: Arc::new(tokio::sync::Mutex::new(default_rx)),
            low_rx: Arc::new(tokio::sync::Mutex::new(low_rx)),
            runner,
            policy,
            config,
        }
    }

    /// Spawn the lane workers. Returns their task handles; workers run until
    /// the shutdown token fires.
    pub fn start(
        &self,
        sink: Arc<dyn ArtifactTerminalSink>,
        shutdown: CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        for (lane, count, rx) in [
            (Lane::Default, self.config.default_lane_workers, &self.default_rx),
            (Lane::Low, self.config.low_lane_workers, &self.low_rx),
        ] {
            for worker_id in 0..count {
                let rx = Arc::clone(rx);
                let runner = Arc::clone(&self.runner);
                let policy = self.policy.clone();
                let sink = Arc::clone(&sink);
                let resubmit = self.sender_for(lane);
                let shutdown = shutdown.clone();

                handles.push(tokio::spawn(async move {
                    info!("Worker {}/{} started", lane.as_str(), worker_id);
                    loop {
                        let job = tokio::select! {
                            _ = shutdown.cancelled() => break,
                            job = async { rx.lock().await.recv().await } => job,
                        };
                        let Some(job) = job else { break };
                        process_job(&runner, &policy, sink.as_ref(), &resubmit, job).await;
                    }
                    info!("Worker {}/{} stopped", lane.as_str(), worker_id);
                }));
            }
        }

        handles
    }

    fn sender_for(&self, lane: Lane) -> mpsc::UnboundedSender<ArtifactJob> {
        match lane {
            Lane::Default => self.default_tx.clone(),
            Lane::Low => self.low_tx.clone(),
        }
    }
}

impl JobSubmitter for WorkerPool {
    fn submit(&self, job: ArtifactJob, lane: Lane) -> Result<()> {
        debug!(
            "Submitting job {}/{} on {} lane",
            job.track_id,
            job.key,
            lane.as_str()
        );
        self.sender_for(lane)
            .send(job)
            .map_err(|e| anyhow::anyhow!("worker pool is shut down: {}", e))
    }
}

/// Run one attempt and act on its outcome: report terminals, schedule
/// retries with backoff, exhaust the key at the ceiling.
async fn process_job(
    runner: &JobRunner,
    policy: &RetryPolicy,
    sink: &dyn ArtifactTerminalSink,
    resubmit: &mpsc::UnboundedSender<ArtifactJob>,
    job: ArtifactJob,
) {
    let outcome = match runner.execute(&job).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Job {}/{} aborted: {:#}", job.track_id, job.key, e);
            return;
        }
    };

    match outcome {
        AttemptOutcome::Completed | AttemptOutcome::AlreadyCompleted => {
            if let Err(e) = sink.on_artifact_terminal(&job.track_id, &job.key) {
                error!(
                    "Terminal handling failed for {}/{}: {:#}",
                    job.track_id, job.key, e
                );
            }
        }
        AttemptOutcome::Conflict => {
            // Another attempt owns the key; this delivery is done.
            debug!("Job {}/{} lost its claim, exiting", job.track_id, job.key);
        }
        AttemptOutcome::Failed { kind, attempts, .. } => {
            if policy.should_retry(kind, attempts) {
                let backoff = Duration::from_secs(policy.backoff_secs(attempts));
                debug!(
                    "Re-enqueueing {}/{} in {:?} (attempt {})",
                    job.track_id, job.key, backoff, attempts
                );
                let resubmit = resubmit.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    if resubmit.send(job).is_err() {
                        warn!("Dropping retry, worker pool is shut down");
                    }
                });
            } else {
                if let Err(e) = runner.mark_exhausted(&job, attempts) {
                    error!(
                        "Failed to mark {}/{} exhausted: {:#}",
                        job.track_id, job.key, e
                    );
                }
                if let Err(e) = sink.on_artifact_terminal(&job.track_id, &job.key) {
                    error!(
                        "Terminal handling failed for {}/{}: {:#}",
                        job.track_id, job.key, e
                    );
                }
            }
        }
    }
}
