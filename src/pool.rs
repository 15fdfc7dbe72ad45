use crate::config::PoolConfig;
use crate::engine::{Engine, EngineError, EngineFactory, EngineOutput, ProgressSender};
use crate::error::RecognitionError;
use crate::job::CancelToken;
use crate::preprocess::EngineBitmap;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub type HandleId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HandleState {
    Idle,
    Busy,
    Terminating,
}

#[derive(Debug, Clone)]
pub struct HandleMeta {
    pub id: HandleId,
    pub language: String,
    pub state: HandleState,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub jobs_served: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HandleInfo {
    pub id: HandleId,
    pub language: String,
    pub state: HandleState,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub jobs_served: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub handles: Vec<HandleInfo>,
    pub creating: usize,
    pub queued: usize,
    pub total_live: usize,
}

impl PoolSnapshot {
    pub fn count(&self, language: &str, state: HandleState) -> usize {
        self.handles
            .iter()
            .filter(|h| h.language == language && h.state == state)
            .count()
    }

    pub fn total_in(&self, state: HandleState) -> usize {
        self.handles.iter().filter(|h| h.state == state).count()
    }
}

pub struct WorkerPool<F: EngineFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: EngineFactory> Clone for WorkerPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PoolInner<F: EngineFactory> {
    factory: F,
    cfg: PoolConfig,
    state: Mutex<PoolState<F::Engine>>,
    drained: Notify,
}

struct PoolState<E> {
    languages: HashMap<String, Slots<E>>,
    waiters: VecDeque<Waiter<E>>,
    next_handle_id: HandleId,
    next_waiter_id: u64,
    closed: bool,
}

struct Slots<E> {
    // most recently used last
    idle: Vec<Pooled<E>>,
    busy: HashMap<HandleId, HandleMeta>,
    creating: usize,
    terminating: HashMap<HandleId, HandleMeta>,
}

impl<E> Default for Slots<E> {
    fn default() -> Self {
        Self {
            idle: Vec::new(),
            busy: HashMap::new(),
            creating: 0,
            terminating: HashMap::new(),
        }
    }
}

impl<E> Slots<E> {
    fn live(&self) -> usize {
        self.idle.len() + self.busy.len() + self.creating + self.terminating.len()
    }
}

struct Pooled<E> {
    meta: HandleMeta,
    engine: E,
}

enum Grant<E> {
    Reuse(Pooled<E>),
    Create,
}

struct Waiter<E> {
    id: u64,
    language: String,
    tx: oneshot::Sender<Grant<E>>,
}

enum Blocked {
    LanguageCap,
    GlobalCeiling,
}

enum Wake<E> {
    Granted(Result<Grant<E>, oneshot::error::RecvError>),
    Cancelled,
    TimedOut,
}

enum Stage {
    Queued,
    Reserved,
    Settled,
}

/// Returns whatever an abandoned `acquire` was holding.
struct PendingAcquire<'a, F: EngineFactory> {
    pool: &'a WorkerPool<F>,
    language: &'a str,
    waiter_id: u64,
    rx: oneshot::Receiver<Grant<F::Engine>>,
    stage: Stage,
}

impl<F: EngineFactory> Drop for PendingAcquire<'_, F> {
    fn drop(&mut self) {
        match self.stage {
            Stage::Settled => {}
            Stage::Reserved => {
                debug!("{} engine construction abandoned", self.language);
                self.pool.give_back(self.language, Grant::Create);
            }
            Stage::Queued => {
                let victims = {
                    let mut st = self.pool.inner.lock();
                    if st.withdraw(self.waiter_id) {
                        return;
                    }
                    let Ok(grant) = self.rx.try_recv() else {
                        return;
                    };
                    st.revoke(self.language, grant);
                    st.dispatch(&self.pool.inner.cfg)
                };
                self.pool.inner.drained.notify_waiters();
                self.pool.inner.spawn_retire(victims);
            }
        }
    }
}

impl<E> PoolState<E> {
    fn slots(&mut self, language: &str) -> &mut Slots<E> {
        self.languages.entry(language.to_string()).or_default()
    }

    fn total_live(&self) -> usize {
        self.languages.values().map(Slots::live).sum()
    }

    fn pending_terminations(&self) -> usize {
        self.languages.values().map(|s| s.terminating.len()).sum()
    }

    fn try_grant(&mut self, language: &str, cfg: &PoolConfig) -> Result<Grant<E>, Blocked> {
        let total = self.total_live();
        let slots = self.slots(language);
        if let Some(mut pooled) = slots.idle.pop() {
            pooled.meta.state = HandleState::Busy;
            slots.busy.insert(pooled.meta.id, pooled.meta.clone());
            return Ok(Grant::Reuse(pooled));
        }
        if slots.live() >= cfg.max_workers_per_language {
            return Err(Blocked::LanguageCap);
        }
        if total >= cfg.max_total_workers {
            return Err(Blocked::GlobalCeiling);
        }
        slots.creating += 1;
        Ok(Grant::Create)
    }

    fn revoke(&mut self, language: &str, grant: Grant<E>) {
        let slots = self.slots(language);
        match grant {
            Grant::Reuse(mut pooled) => {
                slots.busy.remove(&pooled.meta.id);
                pooled.meta.state = HandleState::Idle;
                slots.idle.push(pooled);
            }
            Grant::Create => slots.creating = slots.creating.saturating_sub(1),
        }
    }

    fn dispatch(&mut self, cfg: &PoolConfig) -> Vec<Pooled<E>> {
        let mut victims = Vec::new();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut starved = 0;
        let mut i = 0;
        while i < self.waiters.len() {
            if self.waiters[i].tx.is_closed() {
                self.waiters.remove(i);
                continue;
            }
            let language = self.waiters[i].language.clone();
            if blocked.contains(&language) {
                i += 1;
                continue;
            }
            match self.try_grant(&language, cfg) {
                Ok(grant) => {
                    let Some(waiter) = self.waiters.remove(i) else {
                        break;
                    };
                    if let Err(grant) = waiter.tx.send(grant) {
                        self.revoke(&waiter.language, grant);
                    }
                }
                Err(Blocked::GlobalCeiling) => {
                    // Slots already being freed go to older ceiling-blocked waiters first.
                    if self.pending_terminations() <= starved {
                        if let Some(victim) = self.reclaim_idle_for(&language) {
                            debug!(
                                "reclaiming idle {} engine #{} for queued {} request",
                                victim.meta.language, victim.meta.id, language
                            );
                            victims.push(victim);
                        }
                    }
                    starved += 1;
                    blocked.insert(language);
                    i += 1;
                }
                Err(Blocked::LanguageCap) => {
                    blocked.insert(language);
                    i += 1;
                }
            }
        }
        victims
    }

    // Any waiter of a language that still has idle handles is younger than
    // the blocked one, or it would have taken the handle earlier in the pass.
    fn reclaim_idle_for(&mut self, language: &str) -> Option<Pooled<E>> {
        let (victim_lang, idx) = self
            .languages
            .iter()
            .filter(|(lang, _)| lang.as_str() != language)
            .flat_map(|(lang, slots)| {
                slots
                    .idle
                    .iter()
                    .enumerate()
                    .map(move |(i, p)| (lang, i, p.meta.last_used_at))
            })
            .min_by_key(|(_, _, last_used)| *last_used)
            .map(|(lang, i, _)| (lang.clone(), i))?;
        let slots = self.slots(&victim_lang);
        let mut pooled = slots.idle.remove(idx);
        pooled.meta.state = HandleState::Terminating;
        slots.terminating.insert(pooled.meta.id, pooled.meta.clone());
        Some(pooled)
    }

    fn finish_termination(&mut self, language: &str, id: HandleId) {
        self.slots(language).terminating.remove(&id);
    }

    fn withdraw(&mut self, waiter_id: u64) -> bool {
        match self.waiters.iter().position(|w| w.id == waiter_id) {
            Some(pos) => {
                self.waiters.remove(pos);
                true
            }
            None => false,
        }
    }
}

impl<F: EngineFactory> PoolInner<F> {
    fn lock(&self) -> MutexGuard<'_, PoolState<F::Engine>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn retire(self: Arc<Self>, mut victims: Vec<Pooled<F::Engine>>) {
        while let Some(Pooled { meta, engine }) = victims.pop() {
            info!(
                "terminating {} engine #{} (served {} jobs, idle {}ms)",
                meta.language,
                meta.id,
                meta.jobs_served,
                meta.last_used_at.elapsed().as_millis()
            );
            engine.terminate().await;
            let more = {
                let mut st = self.lock();
                st.finish_termination(&meta.language, meta.id);
                st.dispatch(&self.cfg)
            };
            victims.extend(more);
            self.drained.notify_waiters();
        }
    }

    fn spawn_retire(self: &Arc<Self>, victims: Vec<Pooled<F::Engine>>) {
        if victims.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(Arc::clone(self).retire(victims));
            }
            Err(_) => {
                // Without a runtime the engines are simply dropped.
                let mut pending = victims;
                while let Some(pooled) = pending.pop() {
                    let mut st = self.lock();
                    st.finish_termination(&pooled.meta.language, pooled.meta.id);
                    pending.extend(st.dispatch(&self.cfg));
                }
                self.drained.notify_waiters();
            }
        }
    }
}

impl<F: EngineFactory> WorkerPool<F> {
    pub fn new(cfg: &PoolConfig, factory: F) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                factory,
                cfg: cfg.clone(),
                state: Mutex::new(PoolState {
                    languages: HashMap::new(),
                    waiters: VecDeque::new(),
                    next_handle_id: 1,
                    next_waiter_id: 1,
                    closed: false,
                }),
                drained: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.cfg
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Lease an engine for `language`, queueing FIFO behind earlier requests when at capacity.
    pub async fn acquire(
        &self,
        language: &str,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<EngineLease<F>, RecognitionError> {
        if cancel.is_cancelled() {
            return Err(RecognitionError::Cancelled);
        }
        let started = Instant::now();

        let (waiter_id, rx, victims) = {
            let mut st = self.inner.lock();
            if st.closed {
                return Err(RecognitionError::PoolClosed);
            }
            let (tx, rx) = oneshot::channel();
            let id = st.next_waiter_id;
            st.next_waiter_id += 1;
            st.waiters.push_back(Waiter {
                id,
                language: language.to_string(),
                tx,
            });
            let victims = st.dispatch(&self.inner.cfg);
            if st.waiters.iter().any(|w| w.id == id) {
                debug!(
                    "queued {} request ({} waiting, {} live engines)",
                    language,
                    st.waiters.len(),
                    st.total_live()
                );
            }
            (id, rx, victims)
        };
        self.inner.spawn_retire(victims);

        let mut pending = PendingAcquire {
            pool: self,
            language,
            waiter_id,
            rx,
            stage: Stage::Queued,
        };

        let wake = tokio::select! {
            biased;
            res = &mut pending.rx => Wake::Granted(res),
            _ = cancel.cancelled() => Wake::Cancelled,
            _ = tokio::time::sleep(timeout) => Wake::TimedOut,
        };

        let grant = match wake {
            Wake::Granted(res) => {
                pending.stage = Stage::Settled;
                res.map_err(|_| RecognitionError::PoolClosed)?
            }
            // The guard withdraws the request or hands back a racing grant.
            Wake::Cancelled => return Err(RecognitionError::Cancelled),
            Wake::TimedOut => {
                if self.inner.lock().withdraw(waiter_id) {
                    pending.stage = Stage::Settled;
                    warn!("{} engine acquisition timed out after {:?}", language, timeout);
                    return Err(RecognitionError::PoolExhausted {
                        language: language.to_string(),
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
                // Grants are sent under the lock, so a lost withdrawal means one is ready.
                pending.stage = Stage::Settled;
                pending
                    .rx
                    .try_recv()
                    .map_err(|_| RecognitionError::PoolClosed)?
            }
        };

        match grant {
            Grant::Reuse(pooled) => {
                debug!(
                    "reusing {} engine #{} after {}ms wait",
                    language,
                    pooled.meta.id,
                    started.elapsed().as_millis()
                );
                Ok(self.lease(pooled))
            }
            Grant::Create => {
                pending.stage = Stage::Reserved;
                let res = self.create_engine(language, cancel).await;
                pending.stage = Stage::Settled;
                res
            }
        }
    }

    async fn create_engine(
        &self,
        language: &str,
        cancel: &CancelToken,
    ) -> Result<EngineLease<F>, RecognitionError> {
        let created = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            res = self.inner.factory.create(language) => Some(res),
        };

        match created {
            Some(Ok(engine)) => {
                let now = Instant::now();
                let meta = {
                    let mut st = self.inner.lock();
                    let id = st.next_handle_id;
                    st.next_handle_id += 1;
                    let meta = HandleMeta {
                        id,
                        language: language.to_string(),
                        state: HandleState::Busy,
                        created_at: now,
                        last_used_at: now,
                        jobs_served: 0,
                    };
                    let slots = st.slots(language);
                    slots.creating = slots.creating.saturating_sub(1);
                    slots.busy.insert(id, meta.clone());
                    meta
                };
                info!("created {} engine #{}", language, meta.id);
                Ok(self.lease(Pooled { meta, engine }))
            }
            Some(Err(err)) => {
                warn!("{} engine construction failed: {}", language, err);
                self.give_back(language, Grant::Create);
                Err(RecognitionError::EngineInitFailed {
                    language: language.to_string(),
                    message: init_message(&err),
                })
            }
            None => {
                self.give_back(language, Grant::Create);
                Err(RecognitionError::Cancelled)
            }
        }
    }

    fn lease(&self, pooled: Pooled<F::Engine>) -> EngineLease<F> {
        EngineLease {
            pool: Arc::downgrade(&self.inner),
            meta: pooled.meta,
            engine: Some(pooled.engine),
        }
    }

    fn give_back(&self, language: &str, grant: Grant<F::Engine>) {
        let victims = {
            let mut st = self.inner.lock();
            st.revoke(language, grant);
            st.dispatch(&self.inner.cfg)
        };
        self.inner.drained.notify_waiters();
        self.inner.spawn_retire(victims);
    }

    pub async fn release(&self, mut lease: EngineLease<F>) {
        let Some(engine) = lease.engine.take() else {
            return;
        };
        let mut meta = lease.meta.clone();
        meta.last_used_at = Instant::now();
        meta.jobs_served += 1;
        let healthy = engine.is_healthy();

        let retire = {
            let mut st = self.inner.lock();
            let closed = st.closed;
            let slots = st.slots(&meta.language);
            slots.busy.remove(&meta.id);
            let mut retire = Vec::new();
            if closed || !healthy {
                meta.state = HandleState::Terminating;
                slots.terminating.insert(meta.id, meta.clone());
                retire.push(Pooled { meta, engine });
            } else {
                meta.state = HandleState::Idle;
                slots.idle.push(Pooled { meta, engine });
            }
            retire.extend(st.dispatch(&self.inner.cfg));
            retire
        };
        self.inner.drained.notify_waiters();
        if !healthy {
            warn!("retiring unhealthy {} engine #{}", lease.meta.language, lease.meta.id);
        }
        if !retire.is_empty() {
            Arc::clone(&self.inner).retire(retire).await;
        }
    }

    pub async fn evict_idle(&self) -> usize {
        self.evict_idle_older_than(self.inner.cfg.idle_timeout())
            .await
    }

    /// Destroy idle handles with `now - last_used_at > threshold`.
    pub async fn evict_idle_older_than(&self, threshold: Duration) -> usize {
        let victims = {
            let mut st = self.inner.lock();
            let now = Instant::now();
            let mut victims = Vec::new();
            for slots in st.languages.values_mut() {
                if slots.idle.is_empty() {
                    continue;
                }
                let (expired, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut slots.idle)
                    .into_iter()
                    .partition(|p| now.duration_since(p.meta.last_used_at) > threshold);
                slots.idle = keep;
                for mut pooled in expired {
                    pooled.meta.state = HandleState::Terminating;
                    slots.terminating.insert(pooled.meta.id, pooled.meta.clone());
                    victims.push(pooled);
                }
            }
            victims
        };
        let evicted = victims.len();
        if evicted > 0 {
            info!("evicting {} idle engines (threshold {:?})", evicted, threshold);
            Arc::clone(&self.inner).retire(victims).await;
        }
        evicted
    }

    pub async fn shutdown(&self, grace: Duration) {
        let (cancelled, idle) = {
            let mut st = self.inner.lock();
            st.closed = true;
            let cancelled = st.waiters.len();
            // Dropping the senders wakes every waiter with PoolClosed.
            st.waiters.clear();
            let mut idle = Vec::new();
            for slots in st.languages.values_mut() {
                for mut pooled in slots.idle.drain(..) {
                    pooled.meta.state = HandleState::Terminating;
                    slots.terminating.insert(pooled.meta.id, pooled.meta.clone());
                    idle.push(pooled);
                }
            }
            (cancelled, idle)
        };
        info!(
            "pool shutting down: {} queued acquisitions cancelled, {} idle engines",
            cancelled,
            idle.len()
        );
        Arc::clone(&self.inner).retire(idle).await;

        let deadline = Instant::now() + grace;
        loop {
            let notified = self.inner.drained.notified();
            let outstanding = {
                let st = self.inner.lock();
                st.languages
                    .values()
                    .map(|s| s.busy.len() + s.creating + s.terminating.len())
                    .sum::<usize>()
            };
            if outstanding == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(
                    "shutdown grace of {:?} elapsed with {} engines still busy",
                    grace, outstanding
                );
                break;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let st = self.inner.lock();
        let now = Instant::now();
        let info = |meta: &HandleMeta| HandleInfo {
            id: meta.id,
            language: meta.language.clone(),
            state: meta.state,
            age_ms: now.duration_since(meta.created_at).as_millis() as u64,
            idle_ms: now.duration_since(meta.last_used_at).as_millis() as u64,
            jobs_served: meta.jobs_served,
        };
        let mut handles = Vec::new();
        for slots in st.languages.values() {
            handles.extend(slots.idle.iter().map(|p| info(&p.meta)));
            handles.extend(slots.busy.values().map(info));
            handles.extend(slots.terminating.values().map(info));
        }
        handles.sort_by_key(|h| h.id);
        PoolSnapshot {
            handles,
            creating: st.languages.values().map(|s| s.creating).sum(),
            queued: st.waiters.len(),
            total_live: st.total_live(),
        }
    }

    pub fn busy_count(&self, language: &str) -> usize {
        self.inner
            .lock()
            .languages
            .get(language)
            .map_or(0, |s| s.busy.len())
    }

    pub fn total_busy(&self) -> usize {
        self.inner
            .lock()
            .languages
            .values()
            .map(|s| s.busy.len())
            .sum()
    }

    pub fn total_live(&self) -> usize {
        self.inner.lock().total_live()
    }

    pub fn queued(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

fn init_message(err: &EngineError) -> String {
    match err {
        EngineError::Unsupported(lang) => format!("language profile '{lang}' is not installed"),
        other => other.to_string(),
    }
}

/// A lease dropped without [`WorkerPool::release`] retires its handle.
pub struct EngineLease<F: EngineFactory> {
    pool: Weak<PoolInner<F>>,
    meta: HandleMeta,
    engine: Option<F::Engine>,
}

impl<F: EngineFactory> EngineLease<F> {
    pub fn id(&self) -> HandleId {
        self.meta.id
    }

    pub fn language(&self) -> &str {
        &self.meta.language
    }

    pub fn jobs_served(&self) -> u64 {
        self.meta.jobs_served
    }

    pub async fn recognize(
        &mut self,
        bitmap: &EngineBitmap,
        progress: ProgressSender,
    ) -> Result<EngineOutput, EngineError> {
        match self.engine.as_mut() {
            Some(engine) => engine.recognize(bitmap, progress).await,
            None => Err(EngineError::Exited("lease already released".into())),
        }
    }
}

impl<F: EngineFactory> Drop for EngineLease<F> {
    fn drop(&mut self) {
        let Some(engine) = self.engine.take() else {
            return;
        };
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        warn!(
            "{} engine #{} lease dropped without release; retiring it",
            self.meta.language, self.meta.id
        );
        let mut meta = self.meta.clone();
        meta.state = HandleState::Terminating;
        let victims = {
            let mut st = pool.lock();
            let slots = st.slots(&meta.language);
            slots.busy.remove(&meta.id);
            slots.terminating.insert(meta.id, meta.clone());
            let mut victims = vec![Pooled { meta, engine }];
            victims.extend(st.dispatch(&pool.cfg));
            victims
        };
        pool.drained.notify_waiters();
        pool.spawn_retire(victims);
    }
}
