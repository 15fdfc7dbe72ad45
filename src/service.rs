//! Host-facing entry point: submit jobs, observe them, collect results.

use crate::{
    bitmap::Bitmap,
    config::Config,
    engine::EngineFactory,
    error::RecognitionError,
    job::{CancelToken, JobId, JobOptions, JobProgress, JobStatus, RecognitionJob, RecognitionResult},
    memory::{MemoryGuardian, MemorySource},
    orchestrator::{Orchestrator, ProgressReporter},
    pool::WorkerPool,
};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct Finished {
    result: Result<RecognitionResult, RecognitionError>,
    at: Instant,
}

type Outcome = Option<Finished>;

struct JobEntry {
    cancel: CancelToken,
    progress: watch::Receiver<JobProgress>,
    outcome: watch::Receiver<Outcome>,
}

pub struct RecognitionService<F: EngineFactory> {
    cfg: Config,
    orchestrator: Arc<Orchestrator<F>>,
    guardian: Arc<MemoryGuardian<F>>,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    next_id: AtomicU64,
    stop: CancelToken,
    guardian_task: Mutex<Option<JoinHandle<()>>>,
}

impl<F: EngineFactory> RecognitionService<F> {
    pub fn new(cfg: &Config, factory: F, memory: Arc<dyn MemorySource>) -> Result<Self> {
        cfg.validate()?;
        let pool = WorkerPool::new(&cfg.pool, factory);
        let orchestrator = Orchestrator::new(cfg, pool.clone())?;
        let guardian = MemoryGuardian::new(cfg, pool, memory);
        Ok(Self {
            cfg: cfg.clone(),
            orchestrator: Arc::new(orchestrator),
            guardian: Arc::new(guardian),
            jobs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            stop: CancelToken::new(),
            guardian_task: Mutex::new(None),
        })
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<JobId, JobEntry>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn forget_expired(&self, jobs: &mut HashMap<JobId, JobEntry>) {
        let retention = self.cfg.pool.result_retention();
        let now = Instant::now();
        let before = jobs.len();
        jobs.retain(|_, entry| {
            entry
                .outcome
                .borrow()
                .as_ref()
                .is_none_or(|f| now.duration_since(f.at) < retention)
        });
        if jobs.len() < before {
            debug!("forgot {} uncollected finished job(s)", before - jobs.len());
        }
    }

    pub fn pool(&self) -> &WorkerPool<F> {
        self.orchestrator.pool()
    }

    pub fn guardian(&self) -> &Arc<MemoryGuardian<F>> {
        &self.guardian
    }

    /// Start periodic memory sampling. Calling it twice is a no-op.
    pub fn start_guardian(&self) {
        let mut task = self.guardian_task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let guardian = self.guardian.clone();
        *task = Some(tokio::spawn(guardian.run(self.stop.clone())));
    }

    pub fn submit(&self, bitmap: Bitmap, language: &str) -> Result<JobId, RecognitionError> {
        self.submit_with(bitmap, language, JobOptions::default())
    }

    /// Validate and admit a job, then run it on its own task.
    pub fn submit_with(
        &self,
        bitmap: Bitmap,
        language: &str,
        opts: JobOptions,
    ) -> Result<JobId, RecognitionError> {
        if self.stop.is_cancelled() || self.pool().is_closed() {
            return Err(RecognitionError::PoolClosed);
        }
        bitmap.validate()?;
        self.guardian.admit(opts.urgent)?;

        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut job = RecognitionJob::new(
            id,
            bitmap,
            language,
            &self.cfg.recovery.default_fallback_language,
            self.cfg.recovery.max_attempts,
            opts,
        );
        let (progress_tx, progress_rx) = watch::channel(JobProgress::queued());
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let mut reporter = ProgressReporter::new(progress_tx, job.planned_attempts());

        {
            let mut jobs = self.jobs();
            self.forget_expired(&mut jobs);
            jobs.insert(
                id,
                JobEntry {
                    cancel: job.cancel.clone(),
                    progress: progress_rx,
                    outcome: outcome_rx,
                },
            );
        }
        info!(
            "{} submitted language={} chain={:?} urgent={}",
            id, job.requested_language, job.fallback_chain, job.urgent
        );

        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            let result = orchestrator.recognize(&mut job, &mut reporter).await;
            outcome_tx.send_replace(Some(Finished {
                result,
                at: Instant::now(),
            }));
        });
        Ok(id)
    }

    pub fn progress(&self, id: JobId) -> Result<watch::Receiver<JobProgress>, RecognitionError> {
        self.jobs()
            .get(&id)
            .map(|entry| entry.progress.clone())
            .ok_or(RecognitionError::UnknownJob(id))
    }

    pub fn status(&self, id: JobId) -> Result<JobStatus, RecognitionError> {
        self.jobs()
            .get(&id)
            .map(|entry| entry.progress.borrow().status)
            .ok_or(RecognitionError::UnknownJob(id))
    }

    /// Wait for the job to finish. The job is forgotten once its result is taken.
    pub async fn result(&self, id: JobId) -> Result<RecognitionResult, RecognitionError> {
        let mut outcome = self
            .jobs()
            .get(&id)
            .map(|entry| entry.outcome.clone())
            .ok_or(RecognitionError::UnknownJob(id))?;

        let finished = match outcome.wait_for(Option::is_some).await {
            Ok(value) => value
                .as_ref()
                .map_or(Err(RecognitionError::Cancelled), |f| f.result.clone()),
            Err(_) => {
                warn!("{} task ended without reporting an outcome", id);
                Err(RecognitionError::Cancelled)
            }
        };
        self.jobs().remove(&id);
        finished
    }

    /// Cancel a running job. Finished jobs are left alone until collected or expired.
    pub fn cancel(&self, id: JobId) -> Result<(), RecognitionError> {
        let mut jobs = self.jobs();
        self.forget_expired(&mut jobs);
        let entry = jobs.get(&id).ok_or(RecognitionError::UnknownJob(id))?;
        if !entry.progress.borrow().status.is_terminal() {
            debug!("{} cancel requested", id);
        }
        entry.cancel.cancel();
        Ok(())
    }

    pub fn active_jobs(&self) -> usize {
        self.jobs()
            .values()
            .filter(|entry| entry.outcome.borrow().is_none())
            .count()
    }

    /// Stop the guardian, cancel outstanding jobs, and drain the pool.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let outstanding: Vec<CancelToken> = self
            .jobs()
            .values()
            .filter(|entry| entry.outcome.borrow().is_none())
            .map(|entry| entry.cancel.clone())
            .collect();
        info!("shutting down; cancelling {} outstanding job(s)", outstanding.len());
        for cancel in outstanding {
            cancel.cancel();
        }
        let task = self
            .guardian_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let grace: Duration = self.cfg.pool.shutdown_grace();
        self.pool().shutdown(grace).await;
    }
}
