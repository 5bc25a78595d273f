//! crates/cv_pipeline_core/src/queue.rs
//!
//! A bounded background queue for processing runs. Submissions never block:
//! a full queue is reported to the caller so the request can be rejected.
//! A semaphore caps how many runs execute at the same time.

use crate::orchestrator::Orchestrator;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Upper bound on runs executing at the same time.
pub const MAX_CONCURRENT_RUNS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingJob {
    /// Run every stage from the first page.
    Process(Uuid),
    /// Continue an interrupted run from its persisted state.
    Resume(Uuid),
}

impl ProcessingJob {
    pub fn document_id(&self) -> Uuid {
        match self {
            ProcessingJob::Process(id) | ProcessingJob::Resume(id) => *id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("processing queue is full")]
    Full,
    #[error("processing queue is shut down")]
    Closed,
}

#[derive(Clone)]
pub struct ProcessingQueue {
    tx: mpsc::Sender<ProcessingJob>,
}

impl ProcessingQueue {
    /// Spawns the dispatcher. It exits once every `ProcessingQueue` clone is
    /// dropped and the in-flight runs have finished.
    ///
    /// `max_concurrent` is clamped to `1..=MAX_CONCURRENT_RUNS`.
    pub fn start(
        orchestrator: Arc<Orchestrator>,
        capacity: usize,
        max_concurrent: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let permits = u32::try_from(max_concurrent.clamp(1, MAX_CONCURRENT_RUNS)).unwrap_or(1);
        let handle = tokio::spawn(dispatch(orchestrator, rx, permits));
        (Self { tx }, handle)
    }

    pub fn submit(&self, job: ProcessingJob) -> Result<(), SubmitError> {
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmitError::Full,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        })?;
        info!(document_id = %job.document_id(), ?job, "Job queued.");
        Ok(())
    }
}

async fn dispatch(
    orchestrator: Arc<Orchestrator>,
    mut rx: mpsc::Receiver<ProcessingJob>,
    max_concurrent: u32,
) {
    let permits = Arc::new(Semaphore::new(max_concurrent as usize));

    while let Some(job) = rx.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let _permit = permit;
            run_job(&orchestrator, job).await;
        });
    }

    // Drain: wait until every spawned run has released its permit.
    if permits.acquire_many(max_concurrent).await.is_err() {
        warn!("Processing queue semaphore closed during shutdown.");
    }
    info!("Processing queue stopped.");
}

async fn run_job(orchestrator: &Orchestrator, job: ProcessingJob) {
    let document_id = job.document_id();
    let outcome = match job {
        ProcessingJob::Process(id) => orchestrator.run(id).await,
        ProcessingJob::Resume(id) => orchestrator.resume(id).await,
    };
    match outcome {
        Ok(document) => info!(
            document_id = %document_id,
            status = %document.status,
            "Job finished."
        ),
        // The orchestrator has already recorded the failure on the document.
        Err(e) => error!(document_id = %document_id, error = %e, "Job failed."),
    }
}
