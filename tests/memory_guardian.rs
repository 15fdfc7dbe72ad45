mod common;

use common::{Behavior, ScriptedFactory, sample_bitmap, test_config};
use ocr_pool::{
    error::RecognitionError,
    job::{CancelToken, JobOptions},
    memory::{ManualMemorySource, MemoryGuardian, PressureLevel, classify},
    pool::{HandleState, WorkerPool},
    service::RecognitionService,
};
use std::sync::Arc;
use std::time::Duration;

const GIB: u64 = 1 << 30;

#[test]
fn classification_uses_both_marks() {
    assert_eq!(classify(50, 100, 80, 92), PressureLevel::Normal);
    assert_eq!(classify(80, 100, 80, 92), PressureLevel::Elevated);
    assert_eq!(classify(91, 100, 80, 92), PressureLevel::Elevated);
    assert_eq!(classify(92, 100, 80, 92), PressureLevel::Critical);
    assert_eq!(classify(10, 0, 80, 92), PressureLevel::Normal);
}

#[tokio::test(start_paused = true)]
async fn critical_pressure_rejects_new_work_but_not_running_jobs() {
    let cfg = test_config();
    let memory = Arc::new(ManualMemorySource::new(GIB, 16 * GIB));
    let factory = ScriptedFactory::new().delay(Duration::from_secs(2));
    let service = RecognitionService::new(&cfg, factory, memory.clone()).unwrap();

    let running = service.submit(sample_bitmap(), "deu").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    memory.set(15 * GIB, 16 * GIB);
    let sample = service.guardian().tick().await.unwrap();
    assert_eq!(sample.pressure, PressureLevel::Critical);

    let err = service.submit(sample_bitmap(), "deu").unwrap_err();
    assert!(matches!(err, RecognitionError::MemoryPressureBackoff));

    let urgent = JobOptions {
        urgent: true,
        ..JobOptions::default()
    };
    let urgent_id = service.submit_with(sample_bitmap(), "deu", urgent).unwrap();

    let result = service.result(running).await.unwrap();
    assert_eq!(result.language_used, "deu");
    assert!(service.result(urgent_id).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn admission_reopens_only_back_at_normal() {
    let cfg = test_config();
    let memory = Arc::new(ManualMemorySource::new(95, 100));
    let pool = WorkerPool::new(&cfg.pool, ScriptedFactory::new());
    let guardian = MemoryGuardian::new(&cfg, pool, memory.clone());

    guardian.tick().await.unwrap();
    assert!(!guardian.status().admitting);

    memory.set_used_pct(85);
    let sample = guardian.tick().await.unwrap();
    assert_eq!(sample.pressure, PressureLevel::Elevated);
    assert!(guardian.admit(false).is_err(), "elevated keeps admission closed");
    assert!(guardian.admit(true).is_ok());

    memory.set_used_pct(40);
    guardian.tick().await.unwrap();
    assert!(guardian.status().admitting);
    assert!(guardian.admit(false).is_ok());
}

#[tokio::test(start_paused = true)]
async fn pressure_shortens_the_idle_threshold() {
    let mut cfg = test_config();
    cfg.pool.idle_timeout_ms = 60_000;
    cfg.memory.pressure_idle_timeout_ms = 1_000;
    let factory = ScriptedFactory::new();
    let memory = Arc::new(ManualMemorySource::new(10, 100));
    let pool = WorkerPool::new(&cfg.pool, factory.clone());
    let guardian = MemoryGuardian::new(&cfg, pool.clone(), memory.clone());
    let cancel = CancelToken::new();

    let idle = pool.acquire("eng", Duration::from_secs(1), &cancel).await.unwrap();
    let busy = pool.acquire("deu", Duration::from_secs(1), &cancel).await.unwrap();
    pool.release(idle).await;
    tokio::time::advance(Duration::from_secs(2)).await;

    guardian.tick().await.unwrap();
    assert_eq!(pool.snapshot().count("eng", HandleState::Idle), 1);

    memory.set_used_pct(85);
    guardian.tick().await.unwrap();
    assert_eq!(pool.snapshot().count("eng", HandleState::Idle), 0);
    assert_eq!(pool.busy_count("deu"), 1, "busy handles are never evicted");
    assert_eq!(factory.stats.terminated(), 1);

    pool.release(busy).await;
}

#[tokio::test(start_paused = true)]
async fn background_sampling_follows_the_source() {
    let mut cfg = test_config();
    cfg.memory.sample_interval_ms = 500;
    let memory = Arc::new(ManualMemorySource::new(10, 100));
    let factory = ScriptedFactory::new().with("deu", Behavior::ok("ok", 90.0));
    let service = RecognitionService::new(&cfg, factory, memory.clone()).unwrap();
    service.start_guardian();
    let mut status = service.guardian().subscribe();

    memory.set_used_pct(97);
    status
        .wait_for(|s| s.pressure == PressureLevel::Critical)
        .await
        .unwrap();
    assert!(matches!(
        service.submit(sample_bitmap(), "deu"),
        Err(RecognitionError::MemoryPressureBackoff)
    ));

    memory.set_used_pct(20);
    status.wait_for(|s| s.admitting).await.unwrap();
    assert!(service.submit(sample_bitmap(), "deu").is_ok());

    service.shutdown().await;
}
