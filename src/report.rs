use crate::{
    error::RecognitionError,
    job::{JobId, JobStatus, RecognitionResult},
};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub input: PathBuf,
    pub requested_language: String,
    pub status: JobStatus,
    pub started_at: String,
    pub finished_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<RecognitionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RecognitionError>,
}

impl JobReport {
    pub fn new(
        job_id: JobId,
        input: PathBuf,
        requested_language: &str,
        started_at: String,
        finished_at: String,
        outcome: Result<RecognitionResult, RecognitionError>,
    ) -> Self {
        let (status, result, error) = match outcome {
            Ok(result) => (JobStatus::Succeeded, Some(result), None),
            Err(RecognitionError::Cancelled) => {
                (JobStatus::Cancelled, None, Some(RecognitionError::Cancelled))
            }
            Err(err) => (JobStatus::Failed, None, Some(err)),
        };
        Self {
            job_id,
            input,
            requested_language: requested_language.to_string(),
            status,
            started_at,
            finished_at,
            result,
            error,
        }
    }
}

/// Rejected before a job id was assigned.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedInput {
    pub input: PathBuf,
    pub error: RecognitionError,
}

/// What `doctor` prints.
#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub checked_at: String,
    pub config: crate::config::Config,
    pub memory: Option<crate::memory::MemorySample>,
    pub memory_error: Option<String>,
    pub engine_language: String,
    pub engine_ok: bool,
    pub engine_error: Option<String>,
}
