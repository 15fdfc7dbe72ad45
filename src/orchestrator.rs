use crate::{
    config::Config,
    engine::{EngineError, EngineFactory, EngineOutput},
    error::{AttemptFailure, FailureReason, RecognitionError},
    job::{JobProgress, JobStatus, RecognitionJob, RecognitionResult},
    pool::WorkerPool,
    postprocess::TextCleaner,
    preprocess::Preprocessor,
    recovery::{Decision, RecoveryController, RecoveryLog},
};
use anyhow::Result;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Offsets of each stage inside one attempt's slice of the job percent.
const PREPROCESS_AT: f32 = 0.02;
const AWAIT_ENGINE_AT: f32 = 0.06;
const RECOGNIZE_AT: f32 = 0.10;
const ENGINE_SPAN: f32 = 0.88;
const MAX_RUNNING_PERCENT: f32 = 99.0;

/// Publishes a job's progress with strictly increasing percent.
pub struct ProgressReporter {
    tx: watch::Sender<JobProgress>,
    slices: u32,
    last: f32,
}

impl ProgressReporter {
    pub fn new(tx: watch::Sender<JobProgress>, planned_attempts: u32) -> Self {
        let last = tx.borrow().percent;
        Self {
            tx,
            slices: planned_attempts.max(1),
            last,
        }
    }

    /// A reporter nobody listens to.
    pub fn detached(planned_attempts: u32) -> Self {
        let (tx, _) = watch::channel(JobProgress::queued());
        Self::new(tx, planned_attempts)
    }

    pub fn subscribe(&self) -> watch::Receiver<JobProgress> {
        self.tx.subscribe()
    }

    pub fn last_percent(&self) -> f32 {
        self.last
    }

    fn percent_for(&self, attempt: u32, within: f32) -> f32 {
        let attempt = attempt.min(self.slices - 1) as f32;
        let pct = (attempt + unit(within)) / self.slices as f32 * 100.0;
        pct.min(MAX_RUNNING_PERCENT)
    }

    fn emit(&mut self, status: JobStatus, attempt: u32, language: &str, within: f32, message: String) {
        let percent = self.percent_for(attempt, within);
        if percent <= self.last {
            return;
        }
        self.last = percent;
        self.tx.send_replace(JobProgress {
            status,
            percent,
            message,
            attempt,
            language: Some(language.to_string()),
        });
    }

    pub fn stage(&mut self, status: JobStatus, attempt: u32, language: &str) {
        let (within, message) = match status {
            JobStatus::Preprocessing => (PREPROCESS_AT, format!("preprocessing for {language}")),
            JobStatus::AwaitingEngine => (AWAIT_ENGINE_AT, format!("waiting for a {language} engine")),
            JobStatus::Recognizing => (RECOGNIZE_AT, format!("recognizing ({language})")),
            _ => return,
        };
        self.emit(status, attempt, language, within, message);
    }

    /// Engine-reported fraction of the current recognition call.
    pub fn engine(&mut self, attempt: u32, language: &str, fraction: f32) {
        let fraction = unit(fraction);
        let within = RECOGNIZE_AT + ENGINE_SPAN * fraction;
        let message = format!("recognizing ({language}) {:.0}%", fraction * 100.0);
        self.emit(JobStatus::Recognizing, attempt, language, within, message);
    }

    /// Terminal event; always delivered at 100%.
    pub fn finish(&mut self, status: JobStatus, attempt: u32, language: Option<&str>, message: String) {
        self.last = 100.0;
        self.tx.send_replace(JobProgress {
            status,
            percent: 100.0,
            message,
            attempt,
            language: language.map(str::to_string),
        });
    }
}

/// Clamp to `0..=1`; NaN counts as no progress.
fn unit(fraction: f32) -> f32 {
    if fraction.is_nan() {
        0.0
    } else {
        fraction.clamp(0.0, 1.0)
    }
}

enum Attempt {
    Accepted(EngineOutput),
    Soft(EngineOutput),
    Failed(FailureReason),
}

pub struct Orchestrator<F: EngineFactory> {
    pool: WorkerPool<F>,
    preprocessor: Preprocessor,
    recovery: RecoveryController,
    cleaner: TextCleaner,
    per_attempt_timeout: Duration,
    acquire_timeout: Duration,
}

impl<F: EngineFactory> Orchestrator<F> {
    pub fn new(cfg: &Config, pool: WorkerPool<F>) -> Result<Self> {
        Ok(Self {
            pool,
            preprocessor: Preprocessor::new(&cfg.preprocess),
            recovery: RecoveryController::new(&cfg.recovery),
            cleaner: TextCleaner::new(&cfg.postprocess)?,
            per_attempt_timeout: cfg.pool.per_attempt_timeout(),
            acquire_timeout: cfg.pool.acquire_timeout(),
        })
    }

    pub fn pool(&self) -> &WorkerPool<F> {
        &self.pool
    }

    /// Drive `job` through its attempts until it succeeds or recovery gives up.
    pub async fn recognize(
        &self,
        job: &mut RecognitionJob,
        progress: &mut ProgressReporter,
    ) -> Result<RecognitionResult, RecognitionError> {
        let outcome = self.run_attempts(job, progress).await;
        let language = job.current_language().to_string();
        match &outcome {
            Ok(result) => {
                job.status = JobStatus::Succeeded;
                info!(
                    "{} succeeded language={} attempts={} confidence={:.1} elapsed_ms={}",
                    job.id, result.language_used, result.attempts, result.confidence, result.elapsed_ms
                );
                let message = if result.fallback_used {
                    format!("recognized with fallback language {}", result.language_used)
                } else {
                    "recognized".to_string()
                };
                progress.finish(job.status, job.attempt, Some(&result.language_used), message);
            }
            Err(RecognitionError::Cancelled) => {
                job.status = JobStatus::Cancelled;
                info!("{} cancelled during attempt {}", job.id, job.attempt + 1);
                progress.finish(job.status, job.attempt, Some(&language), "cancelled".to_string());
            }
            Err(err) => {
                job.status = JobStatus::Failed;
                warn!("{} failed: {}", job.id, err);
                progress.finish(job.status, job.attempt, Some(&language), err.to_string());
            }
        }
        outcome
    }

    async fn run_attempts(
        &self,
        job: &mut RecognitionJob,
        progress: &mut ProgressReporter,
    ) -> Result<RecognitionResult, RecognitionError> {
        job.source.validate()?;
        let mut log = RecoveryLog::default();

        loop {
            let language = job.current_language().to_string();
            let reason = match self.attempt(job, &language, progress).await? {
                Attempt::Accepted(output) => return Ok(self.result_for(job, &language, output)),
                Attempt::Soft(output) => {
                    let confidence = output.confidence;
                    debug!(
                        "{} attempt {} ({}) below confidence floor: {:.1} < {:.1}",
                        job.id,
                        job.attempt + 1,
                        language,
                        confidence,
                        self.recovery.min_confidence()
                    );
                    log.offer_soft(self.result_for(job, &language, output));
                    FailureReason::LowConfidence(confidence)
                }
                Attempt::Failed(reason) => reason,
            };

            let failure = AttemptFailure {
                attempt: job.attempt,
                language: language.clone(),
                reason,
            };
            warn!("{} {}", job.id, failure);
            let factory = self.pool.factory();
            match self
                .recovery
                .decide(job, &mut log, failure, |lang| factory.supports(lang))
            {
                Decision::Retry { attempt, .. } => job.attempt = attempt,
                Decision::Promote(mut best) => {
                    best.attempts = job.attempt + 1;
                    best.elapsed_ms = job.created_at.elapsed().as_millis() as u64;
                    info!(
                        "{} promoting best low-confidence result ({}, {:.1})",
                        job.id, best.language_used, best.confidence
                    );
                    return Ok(best);
                }
                Decision::GiveUp(err) => return Err(err),
            }
        }
    }

    fn result_for(&self, job: &RecognitionJob, language: &str, output: EngineOutput) -> RecognitionResult {
        RecognitionResult {
            text: self.cleaner.clean(&output.text),
            confidence: output.confidence,
            language_used: language.to_string(),
            attempts: job.attempt + 1,
            elapsed_ms: job.created_at.elapsed().as_millis() as u64,
            fallback_used: language != job.requested_language,
        }
    }

    /// One pass of preprocess, acquire, recognize. `Err` ends the job outright.
    async fn attempt(
        &self,
        job: &mut RecognitionJob,
        language: &str,
        progress: &mut ProgressReporter,
    ) -> Result<Attempt, RecognitionError> {
        if job.cancel.is_cancelled() {
            return Err(RecognitionError::Cancelled);
        }
        if job.deadline_passed() {
            return Ok(Attempt::Failed(FailureReason::DeadlineExceeded));
        }

        job.status = JobStatus::Preprocessing;
        progress.stage(job.status, job.attempt, language);
        let prepared = self
            .preprocessor
            .prepare_shared(job.source.clone(), language, &job.hint)
            .await?;
        debug!(
            "{} prepared {}x{} scale={:.2} filters={:?}",
            job.id,
            prepared.width(),
            prepared.height(),
            prepared.scale,
            prepared.filters
        );

        job.status = JobStatus::AwaitingEngine;
        progress.stage(job.status, job.attempt, language);
        let acquire_timeout = match job.remaining() {
            Some(left) => self.acquire_timeout.min(left),
            None => self.acquire_timeout,
        };
        let mut lease = match self.pool.acquire(language, acquire_timeout, &job.cancel).await {
            Ok(lease) => lease,
            Err(RecognitionError::PoolExhausted { waited_ms, .. }) => {
                debug!("{} no {} engine after {}ms", job.id, language, waited_ms);
                return Ok(Attempt::Failed(if job.deadline_passed() {
                    FailureReason::DeadlineExceeded
                } else {
                    FailureReason::PoolExhausted
                }));
            }
            Err(RecognitionError::EngineInitFailed { message, .. }) => {
                return Ok(Attempt::Failed(FailureReason::EngineInitFailed(message)));
            }
            Err(err) => return Err(err),
        };

        job.status = JobStatus::Recognizing;
        progress.stage(job.status, job.attempt, language);
        let (timeout, deadline_bound) = match job.remaining() {
            Some(left) if left < self.per_attempt_timeout => (left, true),
            _ => (self.per_attempt_timeout, false),
        };
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let started = Instant::now();

        let outcome = {
            let call = lease.recognize(&prepared, progress_tx);
            tokio::pin!(call);
            loop {
                tokio::select! {
                    biased;
                    _ = job.cancel.cancelled() => break Call::Cancelled,
                    Some(fraction) = progress_rx.recv() => {
                        progress.engine(job.attempt, language, fraction);
                    }
                    res = &mut call => break Call::Done(res),
                    _ = &mut sleep => break Call::TimedOut,
                }
            }
        };
        drop(prepared);
        let handle = lease.id();
        self.pool.release(lease).await;

        match outcome {
            Call::Cancelled => Err(RecognitionError::Cancelled),
            Call::TimedOut => {
                debug!(
                    "{} {} engine #{} gave no answer within {:?}",
                    job.id, language, handle, timeout
                );
                Ok(Attempt::Failed(if deadline_bound {
                    FailureReason::DeadlineExceeded
                } else {
                    FailureReason::RecognitionTimeout
                }))
            }
            Call::Done(Ok(output)) => {
                debug!(
                    "{} {} engine #{} answered in {}ms confidence={:.1}",
                    job.id,
                    language,
                    handle,
                    started.elapsed().as_millis(),
                    output.confidence
                );
                if self.recovery.is_acceptable(output.confidence) {
                    Ok(Attempt::Accepted(output))
                } else {
                    Ok(Attempt::Soft(output))
                }
            }
            Call::Done(Err(err)) => Ok(Attempt::Failed(FailureReason::Engine(err.to_string()))),
        }
    }
}

enum Call {
    Done(Result<EngineOutput, EngineError>),
    TimedOut,
    Cancelled,
}
