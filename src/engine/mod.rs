pub mod process;
pub mod types;

use crate::preprocess::EngineBitmap;
use std::future::Future;
use thiserror::Error;
use tokio::sync::mpsc;

pub use process::{ProcessEngine, ProcessEngineFactory};

/// Fractions in `0.0..=1.0` pushed by an engine while it works.
pub type ProgressSender = mpsc::UnboundedSender<f32>;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineOutput {
    pub text: String,
    pub confidence: f32,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unsupported language profile: {0}")]
    Unsupported(String),

    #[error("engine initialization failed: {0}")]
    Init(String),

    #[error("recognition failed: {0}")]
    Recognition(String),

    #[error("engine worker exited: {0}")]
    Exited(String),

    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One instantiated recognition engine bound to a single language profile.
pub trait Engine: Send + 'static {
    fn recognize(
        &mut self,
        bitmap: &EngineBitmap,
        progress: ProgressSender,
    ) -> impl Future<Output = Result<EngineOutput, EngineError>> + Send;

    fn terminate(self) -> impl Future<Output = ()> + Send;

    /// A handle whose engine reports unhealthy is retired instead of reused.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Builds engines. Only the worker pool calls `create`.
pub trait EngineFactory: Send + Sync + 'static {
    type Engine: Engine;

    fn create(
        &self,
        language: &str,
    ) -> impl Future<Output = Result<Self::Engine, EngineError>> + Send;

    /// Cheap capability check that does not construct anything.
    fn supports(&self, _language: &str) -> bool {
        true
    }
}
