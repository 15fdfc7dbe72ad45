use crate::bitmap::Bitmap;
use crate::preprocess::PreprocessHint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Preprocessing,
    AwaitingEngine,
    Recognizing,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Urgent jobs are admitted even under critical memory pressure.
    pub urgent: bool,
    pub deadline: Option<Duration>,
    pub hint: PreprocessHint,
}

#[derive(Debug)]
pub struct RecognitionJob {
    pub id: JobId,
    /// Original bitmap. Every attempt derives a fresh prepared copy from it.
    pub source: Arc<Bitmap>,
    pub requested_language: String,
    pub fallback_chain: Vec<String>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub status: JobStatus,
    pub created_at: Instant,
    pub deadline: Option<Instant>,
    pub urgent: bool,
    pub hint: PreprocessHint,
    pub cancel: CancelToken,
}

impl RecognitionJob {
    pub fn new(
        id: JobId,
        source: Bitmap,
        language: &str,
        default_fallback: &str,
        max_attempts: u32,
        opts: JobOptions,
    ) -> Self {
        let created_at = Instant::now();
        Self {
            id,
            source: Arc::new(source),
            requested_language: language.to_string(),
            fallback_chain: fallback_chain(language, default_fallback),
            attempt: 0,
            max_attempts: max_attempts.max(1),
            status: JobStatus::Queued,
            created_at,
            deadline: opts.deadline.map(|d| created_at + d),
            urgent: opts.urgent,
            hint: opts.hint,
            cancel: CancelToken::new(),
        }
    }

    pub fn current_language(&self) -> &str {
        let idx = (self.attempt as usize).min(self.fallback_chain.len().saturating_sub(1));
        &self.fallback_chain[idx]
    }

    /// Attempts this job can make at most: `min(max_attempts, len(chain))`.
    pub fn planned_attempts(&self) -> u32 {
        self.max_attempts.min(self.fallback_chain.len() as u32).max(1)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// `[requested, default]` with duplicates and blanks removed, requested first.
pub fn fallback_chain(requested: &str, default_fallback: &str) -> Vec<String> {
    let mut chain: Vec<String> = Vec::with_capacity(2);
    for lang in [requested, default_fallback] {
        let lang = lang.trim();
        if lang.is_empty() || chain.iter().any(|l| l == lang) {
            continue;
        }
        chain.push(lang.to_string());
    }
    if chain.is_empty() {
        chain.push("auto".to_string());
    }
    chain
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionResult {
    pub text: String,
    pub confidence: f32,
    pub language_used: String,
    pub attempts: u32,
    pub elapsed_ms: u64,
    /// True when the answer came from a language other than the requested one.
    pub fallback_used: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobProgress {
    pub status: JobStatus,
    pub percent: f32,
    pub message: String,
    pub attempt: u32,
    pub language: Option<String>,
}

impl JobProgress {
    pub fn queued() -> Self {
        Self {
            status: JobStatus::Queued,
            percent: 0.0,
            message: "queued".to_string(),
            attempt: 0,
            language: None,
        }
    }
}
