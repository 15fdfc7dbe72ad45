//! Classified failures surfaced to callers of the recognition service.

use crate::job::JobId;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecognitionError {
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    #[error("no engine could be started for language profile '{language}': {message}")]
    EngineInitFailed { language: String, message: String },

    #[error("no '{language}' engine became available within {waited_ms}ms")]
    PoolExhausted { language: String, waited_ms: u64 },

    #[error("memory pressure is critical; retry the submission later")]
    MemoryPressureBackoff,

    #[error("job was cancelled")]
    Cancelled,

    #[error("all {} attempts failed: {}", attempts.len(), AttemptList(attempts))]
    AllAttemptsFailed { attempts: Vec<AttemptFailure> },

    #[error("engine pool is shutting down")]
    PoolClosed,

    #[error("unknown job {0}")]
    UnknownJob(JobId),
}

impl RecognitionError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        RecognitionError::InvalidInput {
            message: message.into(),
        }
    }
}

/// One failed attempt of a job, as recorded by the recovery controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptFailure {
    /// 0-based attempt index.
    pub attempt: u32,
    pub language: String,
    pub reason: FailureReason,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempt {} ({}): {}",
            self.attempt + 1,
            self.language,
            self.reason
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    EngineInitFailed(String),
    PoolExhausted,
    RecognitionTimeout,
    DeadlineExceeded,
    Engine(String),
    LowConfidence(f32),
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::EngineInitFailed(msg) => write!(f, "engine unavailable ({msg})"),
            FailureReason::PoolExhausted => write!(f, "no engine became available in time"),
            FailureReason::RecognitionTimeout => write!(f, "recognition timed out"),
            FailureReason::DeadlineExceeded => write!(f, "job deadline exceeded"),
            FailureReason::Engine(msg) => write!(f, "engine error ({msg})"),
            FailureReason::LowConfidence(c) => write!(f, "low confidence ({c:.1})"),
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

struct AttemptList<'a>(&'a [AttemptFailure]);

impl fmt::Display for AttemptList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}
