use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub recovery: Recovery,
    #[serde(default)]
    pub preprocess: Preprocess,
    #[serde(default)]
    pub memory: Memory,
    #[serde(default)]
    pub engine: Engine,
    #[serde(default)]
    pub postprocess: Postprocess,
    #[serde(default)]
    pub logging: Logging,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw).with_context(|| "parsing TOML")?;
        cfg.validate()
            .with_context(|| format!("validating config: {}", path.display()))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.pool;
        if p.max_workers_per_language == 0 || p.max_total_workers == 0 {
            bail!("pool capacities must be at least 1");
        }
        if p.max_workers_per_language > p.max_total_workers {
            bail!(
                "pool.max_workers_per_language ({}) exceeds pool.max_total_workers ({})",
                p.max_workers_per_language,
                p.max_total_workers
            );
        }
        if p.per_attempt_timeout_ms == 0 || p.acquire_timeout_ms == 0 {
            bail!("pool timeouts must be non-zero");
        }
        if !(1..=100).contains(&p.memory_high_water_mark_pct) {
            bail!("pool.memory_high_water_mark_pct must be within 1..=100");
        }
        if p.memory_high_water_mark_pct >= self.memory.critical_pct {
            bail!(
                "pool.memory_high_water_mark_pct ({}) must be below memory.critical_pct ({})",
                p.memory_high_water_mark_pct,
                self.memory.critical_pct
            );
        }
        if self.recovery.max_attempts == 0 {
            bail!("recovery.max_attempts must be at least 1");
        }
        if !(0.0..=100.0).contains(&self.recovery.min_confidence) {
            bail!("recovery.min_confidence must be within 0..=100");
        }
        if self.preprocess.max_upscale < 1.0 {
            bail!("preprocess.max_upscale must be >= 1.0");
        }
        if self.preprocess.max_pixels == 0 {
            bail!("preprocess.max_pixels must be non-zero");
        }
        Ok(())
    }
}

/// Process-wide pool limits, fixed at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_workers_per_language: usize,
    pub max_total_workers: usize,
    pub idle_timeout_ms: u64,
    pub per_attempt_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
    pub memory_high_water_mark_pct: u8,
    pub shutdown_grace_ms: u64,
    /// Finished jobs nobody collected are forgotten after this long.
    pub result_retention_ms: u64,
}
impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers_per_language: 2,
            max_total_workers: 4,
            idle_timeout_ms: 60_000,
            per_attempt_timeout_ms: 120_000,
            acquire_timeout_ms: 30_000,
            memory_high_water_mark_pct: 80,
            shutdown_grace_ms: 10_000,
            result_retention_ms: 300_000,
        }
    }
}
impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn per_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.per_attempt_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn result_retention(&self) -> Duration {
        Duration::from_millis(self.result_retention_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recovery {
    pub max_attempts: u32,
    pub default_fallback_language: String,
    /// Results below this score are soft failures.
    pub min_confidence: f32,
}
impl Default for Recovery {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            default_fallback_language: "eng".into(),
            min_confidence: 60.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preprocess {
    pub assumed_dpi: u32,
    pub min_effective_dpi: u32,
    pub target_dpi: u32,
    pub max_upscale: f32,
    pub max_pixels: u64,
    pub low_contrast_threshold: f32,
    pub noise_threshold: f32,
    pub dense_contrast_boost: f32,
    pub sharpen_sigma: f32,
    pub sharpen_threshold: i32,
    pub blocking_pixel_threshold: u64,
}
impl Default for Preprocess {
    fn default() -> Self {
        Self {
            assumed_dpi: 150,
            min_effective_dpi: 200,
            target_dpi: 300,
            max_upscale: 3.0,
            max_pixels: 25_000_000,
            low_contrast_threshold: 0.2,
            noise_threshold: 0.08,
            dense_contrast_boost: 25.0,
            sharpen_sigma: 1.0,
            sharpen_threshold: 2,
            blocking_pixel_threshold: 4_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub sample_interval_ms: u64,
    pub critical_pct: u8,
    pub pressure_idle_timeout_ms: u64,
    pub source: String,
    pub process_budget_bytes: u64,
}
impl Default for Memory {
    fn default() -> Self {
        Self {
            sample_interval_ms: 5_000,
            critical_pct: 92,
            pressure_idle_timeout_ms: 5_000,
            source: "system".into(),
            process_budget_bytes: 0,
        }
    }
}
impl Memory {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }

    pub fn pressure_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.pressure_idle_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Engine {
    pub command: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub init_timeout_ms: u64,
    /// Supported language profiles. Empty accepts any identifier.
    pub languages: Vec<String>,
}
impl Default for Engine {
    fn default() -> Self {
        Self {
            command: "ocr-worker".into(),
            args: vec!["--lang".into(), "{lang}".into()],
            env: Default::default(),
            init_timeout_ms: 30_000,
            languages: vec![],
        }
    }
}
impl Engine {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Postprocess {
    pub normalize_unicode: bool,
    pub normalize_newlines: bool,
    pub trim_trailing_whitespace: bool,
    pub collapse_blank_lines: bool,
    pub max_blank_lines: usize,
    #[serde(default)]
    pub control_chars_to_sanitize: Vec<u8>,
    pub remove_noise_lines: bool,
    #[serde(default)]
    pub noise_line_patterns: Vec<String>,
}
impl Default for Postprocess {
    fn default() -> Self {
        Self {
            normalize_unicode: true,
            normalize_newlines: true,
            trim_trailing_whitespace: true,
            collapse_blank_lines: true,
            max_blank_lines: 1,
            control_chars_to_sanitize: (0u8..32).chain([127]).collect(),
            remove_noise_lines: true,
            noise_line_patterns: vec!["^[^\\p{L}\\p{N}]{1,3}$".into()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            write_to_file: false,
            file_path: "".into(),
        }
    }
}
