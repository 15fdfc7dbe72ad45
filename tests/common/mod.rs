#![allow(dead_code)]

use ocr_pool::{
    bitmap::{Bitmap, PixelFormat},
    config::Config,
    engine::{Engine, EngineError, EngineFactory, EngineOutput, ProgressSender},
    preprocess::EngineBitmap,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed { text: String, confidence: f32 },
    Fail(String),
    Hang,
    InitFail(String),
}

impl Behavior {
    pub fn ok(text: &str, confidence: f32) -> Self {
        Behavior::Succeed {
            text: text.to_string(),
            confidence,
        }
    }
}

#[derive(Default)]
pub struct Stats {
    created: AtomicUsize,
    create_calls: AtomicUsize,
    terminated: AtomicUsize,
    busy: Mutex<HashMap<String, (usize, usize)>>,
    total_busy: Mutex<(usize, usize)>,
    calls: Mutex<Vec<String>>,
}

impl Stats {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Languages of every recognize call, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn peak_busy(&self, language: &str) -> usize {
        self.busy.lock().unwrap().get(language).map_or(0, |b| b.1)
    }

    pub fn peak_total_busy(&self) -> usize {
        self.total_busy.lock().unwrap().1
    }

    fn enter(self: &Arc<Self>, language: &str) -> BusyGuard {
        {
            let mut busy = self.busy.lock().unwrap();
            let entry = busy.entry(language.to_string()).or_default();
            entry.0 += 1;
            entry.1 = entry.1.max(entry.0);
        }
        {
            let mut total = self.total_busy.lock().unwrap();
            total.0 += 1;
            total.1 = total.1.max(total.0);
        }
        self.calls.lock().unwrap().push(language.to_string());
        BusyGuard {
            stats: self.clone(),
            language: language.to_string(),
        }
    }
}

struct BusyGuard {
    stats: Arc<Stats>,
    language: String,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if let Some(entry) = self.stats.busy.lock().unwrap().get_mut(&self.language) {
            entry.0 -= 1;
        }
        self.stats.total_busy.lock().unwrap().0 -= 1;
    }
}

/// Engine factory whose engines follow a per-language script.
#[derive(Clone)]
pub struct ScriptedFactory {
    behaviors: Arc<Mutex<HashMap<String, Behavior>>>,
    default: Behavior,
    delay: Duration,
    init_delay: Duration,
    progress: Vec<f32>,
    supported: Option<Vec<String>>,
    pub stats: Arc<Stats>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self {
            behaviors: Arc::new(Mutex::new(HashMap::new())),
            default: Behavior::ok("hello world", 95.0),
            delay: Duration::from_millis(10),
            init_delay: Duration::ZERO,
            progress: Vec::new(),
            supported: None,
            stats: Arc::new(Stats::default()),
        }
    }

    pub fn with(self, language: &str, behavior: Behavior) -> Self {
        self.set(language, behavior);
        self
    }

    pub fn default_behavior(mut self, behavior: Behavior) -> Self {
        self.default = behavior;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = delay;
        self
    }

    pub fn progress_steps(mut self, steps: &[f32]) -> Self {
        self.progress = steps.to_vec();
        self
    }

    pub fn supporting(mut self, languages: &[&str]) -> Self {
        self.supported = Some(languages.iter().map(|l| l.to_string()).collect());
        self
    }

    /// Change a language's behavior; engines already created pick it up on their next call.
    pub fn set(&self, language: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(language.to_string(), behavior);
    }

    fn behavior_for(&self, language: &str) -> Behavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(language)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

impl EngineFactory for ScriptedFactory {
    type Engine = ScriptedEngine;

    async fn create(&self, language: &str) -> Result<ScriptedEngine, EngineError> {
        self.stats.create_calls.fetch_add(1, Ordering::SeqCst);
        if !self.init_delay.is_zero() {
            tokio::time::sleep(self.init_delay).await;
        }
        if !self.supports(language) {
            return Err(EngineError::Unsupported(language.to_string()));
        }
        if let Behavior::InitFail(message) = self.behavior_for(language) {
            return Err(EngineError::Init(message));
        }
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedEngine {
            language: language.to_string(),
            factory: self.clone(),
        })
    }

    fn supports(&self, language: &str) -> bool {
        self.supported
            .as_ref()
            .is_none_or(|s| s.iter().any(|l| l == language))
    }
}

pub struct ScriptedEngine {
    language: String,
    factory: ScriptedFactory,
}

impl Engine for ScriptedEngine {
    async fn recognize(
        &mut self,
        _bitmap: &EngineBitmap,
        progress: ProgressSender,
    ) -> Result<EngineOutput, EngineError> {
        let _busy = self.factory.stats.enter(&self.language);
        let behavior = self.factory.behavior_for(&self.language);

        if self.factory.progress.is_empty() {
            tokio::time::sleep(self.factory.delay).await;
        } else {
            let step = self.factory.delay / self.factory.progress.len() as u32;
            for fraction in &self.factory.progress {
                tokio::time::sleep(step).await;
                let _ = progress.send(*fraction);
            }
        }

        match behavior {
            Behavior::Succeed { text, confidence } => Ok(EngineOutput { text, confidence }),
            Behavior::Fail(message) | Behavior::InitFail(message) => {
                Err(EngineError::Recognition(message))
            }
            Behavior::Hang => std::future::pending().await,
        }
    }

    async fn terminate(self) {
        self.factory.stats.terminated.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.pool.max_workers_per_language = 2;
    cfg.pool.max_total_workers = 4;
    cfg.pool.idle_timeout_ms = 60_000;
    cfg.pool.per_attempt_timeout_ms = 5_000;
    cfg.pool.acquire_timeout_ms = 1_000;
    cfg.pool.shutdown_grace_ms = 2_000;
    cfg.recovery.max_attempts = 2;
    cfg.recovery.default_fallback_language = "eng".into();
    cfg.recovery.min_confidence = 60.0;
    cfg
}

/// Small striped page at print resolution so preprocessing leaves its size alone.
pub fn sample_bitmap() -> Bitmap {
    let (width, height) = (64u32, 32u32);
    let data = (0..width * height)
        .map(|i| if (i % width) / 4 % 2 == 0 { 20 } else { 235 })
        .collect();
    Bitmap::new(width, height, PixelFormat::Gray8, data).with_dpi(300)
}
