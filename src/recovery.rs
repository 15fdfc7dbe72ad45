use crate::config::Recovery;
use crate::error::{AttemptFailure, FailureReason, RecognitionError};
use crate::job::{RecognitionJob, RecognitionResult};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Decision {
    /// Restart at preprocessing for `attempt` using `language`.
    Retry { attempt: u32, language: String },
    /// No further attempts; the best low-confidence result becomes the answer.
    Promote(RecognitionResult),
    GiveUp(RecognitionError),
}

/// Per-job record of what has been tried so far.
#[derive(Debug, Clone, Default)]
pub struct RecoveryLog {
    pub failures: Vec<AttemptFailure>,
    pub best_soft: Option<RecognitionResult>,
}

impl RecoveryLog {
    /// Keep a low-confidence result if it beats the one held so far.
    pub fn offer_soft(&mut self, result: RecognitionResult) {
        let better = self
            .best_soft
            .as_ref()
            .is_none_or(|held| result.confidence > held.confidence);
        if better {
            self.best_soft = Some(result);
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryController {
    min_confidence: f32,
}

impl RecoveryController {
    pub fn new(cfg: &Recovery) -> Self {
        Self {
            min_confidence: cfg.min_confidence,
        }
    }

    pub fn min_confidence(&self) -> f32 {
        self.min_confidence
    }

    pub fn is_acceptable(&self, confidence: f32) -> bool {
        confidence >= self.min_confidence
    }

    /// Decide what follows a failed attempt. `supports` reports whether an
    /// engine could be constructed for a language at all.
    pub fn decide(
        &self,
        job: &RecognitionJob,
        log: &mut RecoveryLog,
        failure: AttemptFailure,
        supports: impl Fn(&str) -> bool,
    ) -> Decision {
        if failure.reason == FailureReason::Cancelled {
            return Decision::GiveUp(RecognitionError::Cancelled);
        }

        let init_failure = matches!(failure.reason, FailureReason::EngineInitFailed(_));
        let deadline_hit = failure.reason == FailureReason::DeadlineExceeded || job.deadline_passed();
        log.failures.push(failure);

        let next = job.attempt + 1;
        let remaining: Vec<&str> = job
            .fallback_chain
            .iter()
            .take(job.planned_attempts() as usize)
            .skip(next as usize)
            .map(String::as_str)
            .collect();

        let pointless = init_failure && remaining.iter().all(|lang| !supports(lang));

        if !deadline_hit && !pointless {
            if let Some(language) = remaining.first() {
                debug!(
                    "{} retrying attempt {} with {} after: {}",
                    job.id,
                    next + 1,
                    language,
                    log.failures.last().map(ToString::to_string).unwrap_or_default()
                );
                return Decision::Retry {
                    attempt: next,
                    language: language.to_string(),
                };
            }
        }

        if let Some(best) = log.best_soft.take() {
            return Decision::Promote(best);
        }

        let all_init = log
            .failures
            .iter()
            .all(|f| matches!(f.reason, FailureReason::EngineInitFailed(_)));
        if all_init {
            let mut languages: Vec<&str> = log.failures.iter().map(|f| f.language.as_str()).collect();
            languages.extend(remaining.iter().copied());
            let message = log
                .failures
                .iter()
                .map(|f| f.reason.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Decision::GiveUp(RecognitionError::EngineInitFailed {
                language: languages.join(", "),
                message,
            });
        }

        Decision::GiveUp(RecognitionError::AllAttemptsFailed {
            attempts: log.failures.clone(),
        })
    }
}
