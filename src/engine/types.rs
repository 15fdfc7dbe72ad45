//! JSON-lines protocol spoken with external recognizer workers.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum WorkerRequest {
    Recognize {
        id: u64,
        width: u32,
        height: u32,
        png_base64: String,
    },
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    Ready {
        language: String,
        #[serde(default)]
        version: Option<String>,
    },
    Error {
        message: String,
    },
    Progress {
        id: u64,
        fraction: f32,
    },
    Done {
        id: u64,
        text: String,
        confidence: f32,
    },
    Failed {
        id: u64,
        message: String,
    },
}

impl WorkerEvent {
    /// Request id this event answers, if any.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            WorkerEvent::Progress { id, .. }
            | WorkerEvent::Done { id, .. }
            | WorkerEvent::Failed { id, .. } => Some(*id),
            WorkerEvent::Ready { .. } | WorkerEvent::Error { .. } => None,
        }
    }
}
