mod common;

use common::{Behavior, ScriptedFactory, sample_bitmap, test_config};
use ocr_pool::{
    bitmap::{Bitmap, PixelFormat},
    config::Config,
    error::{FailureReason, RecognitionError},
    job::{JobId, JobOptions, JobProgress, JobStatus, RecognitionJob, RecognitionResult},
    orchestrator::{Orchestrator, ProgressReporter},
    pool::{HandleState, WorkerPool},
};
use std::time::Duration;

fn orchestrator(cfg: &Config, factory: &ScriptedFactory) -> Orchestrator<ScriptedFactory> {
    let pool = WorkerPool::new(&cfg.pool, factory.clone());
    Orchestrator::new(cfg, pool).unwrap()
}

fn job(cfg: &Config, language: &str, opts: JobOptions) -> RecognitionJob {
    RecognitionJob::new(
        JobId(1),
        sample_bitmap(),
        language,
        &cfg.recovery.default_fallback_language,
        cfg.recovery.max_attempts,
        opts,
    )
}

async fn run(
    orch: &Orchestrator<ScriptedFactory>,
    job: &mut RecognitionJob,
) -> Result<RecognitionResult, RecognitionError> {
    let mut progress = ProgressReporter::detached(job.planned_attempts());
    orch.recognize(job, &mut progress).await
}

#[tokio::test(start_paused = true)]
async fn healthy_engine_answers_on_the_first_attempt() {
    let cfg = test_config();
    let factory = ScriptedFactory::new();
    let orch = orchestrator(&cfg, &factory);
    let mut job = job(&cfg, "deu", JobOptions::default());

    let result = run(&orch, &mut job).await.unwrap();
    assert_eq!(result.attempts, 1);
    assert_eq!(result.language_used, "deu");
    assert!(!result.fallback_used);
    assert_eq!(result.text, "hello world");
    assert_eq!(job.status, JobStatus::Succeeded);

    // The handle went back to the pool rather than being destroyed.
    assert_eq!(orch.pool().snapshot().count("deu", HandleState::Idle), 1);
    assert_eq!(factory.stats.terminated(), 0);
}

#[tokio::test(start_paused = true)]
async fn failing_language_falls_back_to_the_default() {
    let cfg = test_config();
    let factory = ScriptedFactory::new()
        .with("deu", Behavior::Fail("garbled".into()))
        .with("eng", Behavior::ok("fallback text", 88.0));
    let orch = orchestrator(&cfg, &factory);
    let mut job = job(&cfg, "deu", JobOptions::default());

    let result = run(&orch, &mut job).await.unwrap();
    assert_eq!(result.attempts, 2);
    assert_eq!(result.language_used, "eng");
    assert!(result.fallback_used);
    assert_eq!(result.text, "fallback text");
    assert_eq!(factory.stats.calls(), vec!["deu", "eng"]);
    // Engines stay reusable after a failed attempt.
    assert_eq!(orch.pool().snapshot().count("deu", HandleState::Idle), 1);
}

#[tokio::test(start_paused = true)]
async fn attempts_stop_at_the_shorter_of_limit_and_chain() {
    for (max_attempts, expected) in [(1, 1), (2, 2), (5, 2)] {
        let mut cfg = test_config();
        cfg.recovery.max_attempts = max_attempts;
        let factory = ScriptedFactory::new().default_behavior(Behavior::Fail("boom".into()));
        let orch = orchestrator(&cfg, &factory);
        let mut job = job(&cfg, "fra", JobOptions::default());

        let err = run(&orch, &mut job).await.unwrap_err();
        match err {
            RecognitionError::AllAttemptsFailed { attempts } => {
                assert_eq!(attempts.len(), expected);
                assert_eq!(attempts[0].language, "fra");
                assert!(matches!(attempts[0].reason, FailureReason::Engine(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(factory.stats.calls().len(), expected);
        assert_eq!(job.status, JobStatus::Failed);
    }
}

#[tokio::test(start_paused = true)]
async fn requested_language_equal_to_fallback_is_tried_once() {
    let cfg = test_config();
    let factory = ScriptedFactory::new().default_behavior(Behavior::Fail("boom".into()));
    let orch = orchestrator(&cfg, &factory);
    let mut job = job(&cfg, "eng", JobOptions::default());

    let err = run(&orch, &mut job).await.unwrap_err();
    assert!(matches!(err, RecognitionError::AllAttemptsFailed { ref attempts } if attempts.len() == 1));
}

#[tokio::test(start_paused = true)]
async fn low_confidence_result_is_promoted_when_nothing_beats_it() {
    let cfg = test_config();
    let factory = ScriptedFactory::new()
        .with("deu", Behavior::ok("schwach", 45.0))
        .with("eng", Behavior::ok("weaker", 30.0));
    let orch = orchestrator(&cfg, &factory);
    let mut job = job(&cfg, "deu", JobOptions::default());

    let result = run(&orch, &mut job).await.unwrap();
    assert_eq!(result.language_used, "deu");
    assert_eq!(result.text, "schwach");
    assert_eq!(result.attempts, 2);
    assert!(!result.fallback_used);
}

#[tokio::test(start_paused = true)]
async fn low_confidence_result_yields_to_a_confident_fallback() {
    let cfg = test_config();
    let factory = ScriptedFactory::new()
        .with("deu", Behavior::ok("schwach", 45.0))
        .with("eng", Behavior::ok("strong", 91.0));
    let orch = orchestrator(&cfg, &factory);
    let mut job = job(&cfg, "deu", JobOptions::default());

    let result = run(&orch, &mut job).await.unwrap();
    assert_eq!(result.language_used, "eng");
    assert!(result.fallback_used);
    assert_eq!(result.confidence, 91.0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_before_acquisition_leaves_nothing_busy() {
    let cfg = test_config();
    let factory = ScriptedFactory::new();
    let orch = orchestrator(&cfg, &factory);
    let mut job = job(&cfg, "deu", JobOptions::default());
    job.cancel.cancel();

    let err = run(&orch, &mut job).await.unwrap_err();
    assert!(matches!(err, RecognitionError::Cancelled));
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(orch.pool().total_busy(), 0);
    assert_eq!(factory.stats.create_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_while_waiting_for_an_engine() {
    let mut cfg = test_config();
    cfg.pool.max_workers_per_language = 1;
    cfg.pool.max_total_workers = 1;
    cfg.pool.acquire_timeout_ms = 60_000;
    let factory = ScriptedFactory::new();
    let orch = std::sync::Arc::new(orchestrator(&cfg, &factory));

    let held = orch
        .pool()
        .acquire("deu", Duration::from_secs(1), &Default::default())
        .await
        .unwrap();

    let mut job = job(&cfg, "deu", JobOptions::default());
    let cancel = job.cancel.clone();
    let task = {
        let orch = orch.clone();
        tokio::spawn(async move {
            let res = run(&orch, &mut job).await;
            (res, job.status)
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(orch.pool().queued(), 1);

    cancel.cancel();
    let (res, status) = task.await.unwrap();
    assert!(matches!(res, Err(RecognitionError::Cancelled)));
    assert_eq!(status, JobStatus::Cancelled);
    assert_eq!(orch.pool().queued(), 0);

    orch.pool().release(held).await;
    assert_eq!(orch.pool().total_busy(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_recognition_aborts_the_call() {
    let cfg = test_config();
    let factory = ScriptedFactory::new().default_behavior(Behavior::Hang);
    let orch = std::sync::Arc::new(orchestrator(&cfg, &factory));
    let mut job = job(&cfg, "deu", JobOptions::default());
    let cancel = job.cancel.clone();

    let task = {
        let orch = orch.clone();
        tokio::spawn(async move { run(&orch, &mut job).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(orch.pool().total_busy(), 1);

    cancel.cancel();
    assert!(matches!(task.await.unwrap(), Err(RecognitionError::Cancelled)));
    assert_eq!(orch.pool().total_busy(), 0);
    assert_eq!(factory.stats.calls(), vec!["deu"]);
}

#[tokio::test(start_paused = true)]
async fn timed_out_attempt_is_retried_with_the_fallback() {
    let cfg = test_config();
    let factory = ScriptedFactory::new()
        .with("deu", Behavior::Hang)
        .with("eng", Behavior::ok("made it", 80.0));
    let orch = orchestrator(&cfg, &factory);
    let mut job = job(&cfg, "deu", JobOptions::default());

    let started = tokio::time::Instant::now();
    let result = run(&orch, &mut job).await.unwrap();
    assert_eq!(result.language_used, "eng");
    assert_eq!(result.attempts, 2);
    assert!(started.elapsed() >= cfg.pool.per_attempt_timeout());
    assert_eq!(orch.pool().snapshot().count("deu", HandleState::Idle), 1);
}

#[tokio::test(start_paused = true)]
async fn every_attempt_timing_out_is_aggregated() {
    let cfg = test_config();
    let factory = ScriptedFactory::new().default_behavior(Behavior::Hang);
    let orch = orchestrator(&cfg, &factory);
    let mut job = job(&cfg, "deu", JobOptions::default());

    match run(&orch, &mut job).await.unwrap_err() {
        RecognitionError::AllAttemptsFailed { attempts } => {
            assert_eq!(attempts.len(), 2);
            assert!(attempts.iter().all(|a| a.reason == FailureReason::RecognitionTimeout));
            assert_eq!(attempts[1].language, "eng");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn single_timed_out_attempt_still_surfaces_as_aggregate() {
    let mut cfg = test_config();
    cfg.recovery.max_attempts = 1;
    let factory = ScriptedFactory::new().default_behavior(Behavior::Hang);
    let orch = orchestrator(&cfg, &factory);
    let mut job = job(&cfg, "deu", JobOptions::default());

    let err = run(&orch, &mut job).await.unwrap_err();
    assert!(err.to_string().contains("deu"), "{err}");
    match err {
        RecognitionError::AllAttemptsFailed { attempts } => {
            assert_eq!(attempts.len(), 1);
            assert_eq!(attempts[0].reason, FailureReason::RecognitionTimeout);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(job.status, JobStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn job_deadline_stops_further_attempts() {
    let cfg = test_config();
    let factory = ScriptedFactory::new().default_behavior(Behavior::Hang);
    let orch = orchestrator(&cfg, &factory);
    let opts = JobOptions {
        deadline: Some(Duration::from_secs(1)),
        ..JobOptions::default()
    };
    let mut job = job(&cfg, "deu", opts);

    match run(&orch, &mut job).await.unwrap_err() {
        RecognitionError::AllAttemptsFailed { attempts } => {
            assert_eq!(attempts.len(), 1);
            assert_eq!(attempts[0].reason, FailureReason::DeadlineExceeded);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(factory.stats.calls(), vec!["deu"]);
}

#[tokio::test(start_paused = true)]
async fn every_chain_entry_failing_to_start_reports_init_failure() {
    let cfg = test_config();
    let factory = ScriptedFactory::new().default_behavior(Behavior::InitFail("no model".into()));
    let orch = orchestrator(&cfg, &factory);
    let mut job = job(&cfg, "deu", JobOptions::default());

    match run(&orch, &mut job).await.unwrap_err() {
        RecognitionError::EngineInitFailed { language, message } => {
            assert!(language.contains("deu") && language.contains("eng"), "{language}");
            assert!(message.contains("no model"), "{message}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(orch.pool().total_live(), 0);
}

#[tokio::test(start_paused = true)]
async fn unsupported_chain_gives_up_without_trying_the_rest() {
    let mut cfg = test_config();
    cfg.recovery.default_fallback_language = "tlh".into();
    let factory = ScriptedFactory::new().supporting(&["eng"]);
    let orch = orchestrator(&cfg, &factory);
    let mut job = job(&cfg, "qya", JobOptions::default());

    let err = run(&orch, &mut job).await.unwrap_err();
    assert!(matches!(err, RecognitionError::EngineInitFailed { .. }), "{err:?}");
    assert_eq!(factory.stats.create_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn malformed_bitmap_fails_before_touching_the_pool() {
    let cfg = test_config();
    let factory = ScriptedFactory::new();
    let orch = orchestrator(&cfg, &factory);
    let mut job = RecognitionJob::new(
        JobId(7),
        Bitmap::new(10, 10, PixelFormat::Rgb8, vec![0; 10]),
        "deu",
        "eng",
        2,
        JobOptions::default(),
    );

    let err = run(&orch, &mut job).await.unwrap_err();
    assert!(matches!(err, RecognitionError::InvalidInput { .. }));
    assert_eq!(factory.stats.create_calls(), 0);
    assert_eq!(orch.pool().total_live(), 0);
}

#[tokio::test(start_paused = true)]
async fn progress_is_strictly_increasing_and_ends_at_100() {
    let cfg = test_config();
    let factory = ScriptedFactory::new()
        .with("deu", Behavior::Fail("garbled".into()))
        .progress_steps(&[0.25, 0.5, 0.5, 0.75, 1.0])
        .delay(Duration::from_millis(50));
    let orch = orchestrator(&cfg, &factory);
    let mut job = job(&cfg, "deu", JobOptions::default());

    let (tx, _) = tokio::sync::watch::channel(JobProgress::queued());
    let mut progress = ProgressReporter::new(tx, job.planned_attempts());
    let mut rx = progress.subscribe();
    let watcher = tokio::spawn(async move {
        let mut seen = Vec::new();
        while rx.changed().await.is_ok() {
            let p = rx.borrow_and_update().clone();
            let done = p.status.is_terminal();
            seen.push(p);
            if done {
                break;
            }
        }
        seen
    });

    let result = orch.recognize(&mut job, &mut progress).await.unwrap();
    assert_eq!(result.language_used, "eng");
    let seen = watcher.await.unwrap();

    assert!(seen.len() >= 4, "{seen:?}");
    for pair in seen.windows(2) {
        assert!(pair[1].percent > pair[0].percent, "{seen:?}");
    }
    let last = seen.last().unwrap();
    assert_eq!(last.status, JobStatus::Succeeded);
    assert_eq!(last.percent, 100.0);
    assert!(seen[..seen.len() - 1].iter().all(|p| p.percent <= 99.0));
    // Attempt one of two stays within the first half.
    assert!(
        seen.iter()
            .filter(|p| p.attempt == 0 && !p.status.is_terminal())
            .all(|p| p.percent <= 50.0)
    );
    assert!(seen.iter().any(|p| p.attempt == 1 && p.percent > 50.0));
}

#[test]
fn nan_engine_progress_does_not_jump_to_the_ceiling() {
    let mut progress = ProgressReporter::detached(2);
    let rx = progress.subscribe();
    progress.stage(JobStatus::Recognizing, 0, "deu");
    let at_start = progress.last_percent();
    assert!((at_start - 5.0).abs() < 1e-3, "{at_start}");

    progress.engine(0, "deu", f32::NAN);
    assert_eq!(progress.last_percent(), at_start);

    progress.engine(0, "deu", 0.5);
    let halfway = rx.borrow().percent;
    assert!(halfway > at_start && halfway < 50.0, "{halfway}");
}
