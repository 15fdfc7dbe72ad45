pub mod bitmap;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod memory;
pub mod orchestrator;
pub mod pool;
pub mod postprocess;
pub mod preprocess;
pub mod recovery;
pub mod report;
pub mod service;
pub mod util;
