//! Memory pressure sampling and reclamation.

use crate::config::Config;
use crate::engine::EngineFactory;
use crate::error::RecognitionError;
use crate::job::CancelToken;
use crate::pool::WorkerPool;
use anyhow::{Result, anyhow};
use serde::Serialize;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryReading {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

/// Where the guardian gets its numbers from.
pub trait MemorySource: Send + Sync + 'static {
    fn read(&self) -> Result<MemoryReading>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum PressureLevel {
    Normal,
    Elevated,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemorySample {
    #[serde(skip)]
    pub timestamp: Instant,
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub pressure: PressureLevel,
}

impl MemorySample {
    pub fn used_pct(&self) -> f64 {
        used_pct(self.used_bytes, self.total_bytes)
    }
}

fn used_pct(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

pub fn classify(used_bytes: u64, total_bytes: u64, high_water_pct: u8, critical_pct: u8) -> PressureLevel {
    let pct = used_pct(used_bytes, total_bytes);
    if pct >= critical_pct as f64 {
        PressureLevel::Critical
    } else if pct >= high_water_pct as f64 {
        PressureLevel::Elevated
    } else {
        PressureLevel::Normal
    }
}

/// Host memory via `sysinfo`: system-wide, or this process against a budget.
pub struct SystemMemorySource {
    system: Mutex<System>,
    process_budget: Option<u64>,
}

impl SystemMemorySource {
    pub fn system_wide() -> Self {
        Self {
            system: Mutex::new(System::new()),
            process_budget: None,
        }
    }

    pub fn process(budget_bytes: u64) -> Self {
        Self {
            system: Mutex::new(System::new()),
            process_budget: Some(budget_bytes),
        }
    }

    pub fn from_config(cfg: &crate::config::Memory) -> Result<Self> {
        match cfg.source.as_str() {
            "system" => Ok(Self::system_wide()),
            "process" if cfg.process_budget_bytes > 0 => Ok(Self::process(cfg.process_budget_bytes)),
            "process" => Err(anyhow!("memory.source=process needs memory.process_budget_bytes")),
            other => Err(anyhow!("unknown memory.source: {other}")),
        }
    }
}

impl MemorySource for SystemMemorySource {
    fn read(&self) -> Result<MemoryReading> {
        let mut sys = self.system.lock().unwrap_or_else(|e| e.into_inner());
        match self.process_budget {
            None => {
                sys.refresh_memory();
                Ok(MemoryReading {
                    used_bytes: sys.used_memory(),
                    total_bytes: sys.total_memory(),
                })
            }
            Some(budget) => {
                let pid = sysinfo::get_current_pid().map_err(|e| anyhow!("current pid: {e}"))?;
                sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                let used = sys
                    .process(pid)
                    .map(|p| p.memory())
                    .ok_or_else(|| anyhow!("process {pid} not found"))?;
                Ok(MemoryReading {
                    used_bytes: used,
                    total_bytes: budget,
                })
            }
        }
    }
}

/// Readings pushed by the host (or a test).
#[derive(Debug, Default)]
pub struct ManualMemorySource {
    used: AtomicU64,
    total: AtomicU64,
}

impl ManualMemorySource {
    pub fn new(used_bytes: u64, total_bytes: u64) -> Self {
        Self {
            used: AtomicU64::new(used_bytes),
            total: AtomicU64::new(total_bytes),
        }
    }

    pub fn set(&self, used_bytes: u64, total_bytes: u64) {
        self.total.store(total_bytes, Ordering::SeqCst);
        self.used.store(used_bytes, Ordering::SeqCst);
    }

    /// Set usage as a percentage of the current total.
    pub fn set_used_pct(&self, pct: u8) {
        let total = self.total.load(Ordering::SeqCst).max(100);
        self.set(total / 100 * pct as u64, total);
    }
}

impl MemorySource for ManualMemorySource {
    fn read(&self) -> Result<MemoryReading> {
        Ok(MemoryReading {
            used_bytes: self.used.load(Ordering::SeqCst),
            total_bytes: self.total.load(Ordering::SeqCst),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GuardianStatus {
    pub pressure: PressureLevel,
    /// False from the moment pressure turns Critical until it is Normal again.
    pub admitting: bool,
}

pub struct MemoryGuardian<F: EngineFactory> {
    source: Arc<dyn MemorySource>,
    pool: WorkerPool<F>,
    high_water_pct: u8,
    critical_pct: u8,
    interval: Duration,
    pressure_idle_timeout: Duration,
    status: watch::Sender<GuardianStatus>,
}

impl<F: EngineFactory> MemoryGuardian<F> {
    pub fn new(cfg: &Config, pool: WorkerPool<F>, source: Arc<dyn MemorySource>) -> Self {
        let (status, _) = watch::channel(GuardianStatus {
            pressure: PressureLevel::Normal,
            admitting: true,
        });
        Self {
            source,
            pool,
            high_water_pct: cfg.pool.memory_high_water_mark_pct,
            critical_pct: cfg.memory.critical_pct,
            interval: cfg.memory.sample_interval(),
            pressure_idle_timeout: cfg.memory.pressure_idle_timeout(),
            status,
        }
    }

    pub fn status(&self) -> GuardianStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<GuardianStatus> {
        self.status.subscribe()
    }

    /// Admission gate for new submissions.
    pub fn admit(&self, urgent: bool) -> Result<(), RecognitionError> {
        if urgent || self.status().admitting {
            Ok(())
        } else {
            Err(RecognitionError::MemoryPressureBackoff)
        }
    }

    /// Take one sample, update admission, and reclaim idle engines.
    pub async fn tick(&self) -> Result<MemorySample> {
        let reading = self.source.read()?;
        let pressure = classify(
            reading.used_bytes,
            reading.total_bytes,
            self.high_water_pct,
            self.critical_pct,
        );
        let sample = MemorySample {
            timestamp: Instant::now(),
            used_bytes: reading.used_bytes,
            total_bytes: reading.total_bytes,
            pressure,
        };

        let previous = self.status();
        let admitting = match pressure {
            PressureLevel::Critical => false,
            PressureLevel::Normal => true,
            PressureLevel::Elevated => previous.admitting,
        };
        if previous.pressure != pressure {
            if pressure > previous.pressure {
                warn!("memory pressure {:?} -> {:?} ({:.1}% used)", previous.pressure, pressure, sample.used_pct());
            } else {
                info!("memory pressure {:?} -> {:?} ({:.1}% used)", previous.pressure, pressure, sample.used_pct());
            }
        }
        if previous.admitting != admitting {
            info!("submission admission {}", if admitting { "reopened" } else { "closed" });
        }
        self.status.send_replace(GuardianStatus { pressure, admitting });

        let evicted = match pressure {
            PressureLevel::Normal => self.pool.evict_idle().await,
            PressureLevel::Elevated | PressureLevel::Critical => {
                self.pool
                    .evict_idle_older_than(self.pressure_idle_timeout)
                    .await
            }
        };
        debug!(
            "memory sample used={} total={} pressure={:?} evicted={}",
            sample.used_bytes, sample.total_bytes, pressure, evicted
        );
        Ok(sample)
    }

    /// Sample on a fixed interval until `stop` fires.
    pub async fn run(self: Arc<Self>, stop: CancelToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        warn!("memory sample failed: {:#}", err);
                    }
                }
            }
        }
        debug!("memory guardian stopped");
    }
}
