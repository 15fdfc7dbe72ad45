use crate::{
    bitmap::Bitmap,
    config::Config,
    engine::{Engine, EngineFactory, ProcessEngineFactory},
    job::JobOptions,
    memory::{MemoryGuardian, MemorySource, SystemMemorySource},
    pool::WorkerPool,
    report::{DoctorReport, JobReport, RejectedInput},
    service::RecognitionService,
    util::{ensure_dir, now_rfc3339},
};
use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "ocr-pool")]
#[command(about = "Pooled text recognition with per-language engine limits and fallback")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./ocr-pool.toml if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the effective config, a memory sample, and an engine handshake result.
    Doctor {
        /// Language profile to start an engine for (defaults to the fallback language).
        #[arg(long)]
        lang: Option<String>,
    },
    Recognize {
        #[arg(long, required = true, num_args = 1..)]
        input: Vec<PathBuf>,
        #[arg(long)]
        lang: String,
        /// Admit even under critical memory pressure.
        #[arg(long)]
        urgent: bool,
        /// Stop a job after this many milliseconds, across all attempts.
        #[arg(long)]
        deadline_ms: Option<u64>,
        /// Write the JSON reports here instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

pub async fn dispatch(args: Args) -> Result<()> {
    let cfg_path = resolve_config_path(args.config.as_deref())?;
    let cfg = Config::load(&cfg_path)?;
    let log_path = resolve_log_path(&cfg);
    let _guard = init_logging(&args, &cfg, log_path.as_deref())?;
    debug!("config loaded from {}", cfg_path.display());

    match &args.cmd {
        Command::Doctor { lang } => doctor(&cfg, lang.as_deref()).await,
        Command::Recognize {
            input,
            lang,
            urgent,
            deadline_ms,
            out,
        } => {
            let opts = JobOptions {
                urgent: *urgent,
                deadline: deadline_ms.map(std::time::Duration::from_millis),
                ..JobOptions::default()
            };
            recognize(&cfg, input, lang, opts, out.as_deref()).await
        }
    }
}

fn resolve_config_path(user: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = user {
        return Ok(p.to_path_buf());
    }
    let default = PathBuf::from("ocr-pool.toml");
    if default.exists() {
        Ok(default)
    } else {
        Ok(PathBuf::from("ocr-pool.example.toml"))
    }
}

fn init_logging(args: &Args, cfg: &Config, file_path: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries the JSON reports, so logs go to stderr.
    let stderr_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    };

    let (file_layer, guard) = if let Some(path) = file_path {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let file = std::fs::File::create(path)
            .with_context(|| format!("create log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

fn resolve_log_path(cfg: &Config) -> Option<PathBuf> {
    if !cfg.logging.write_to_file {
        return None;
    }
    if !cfg.logging.file_path.is_empty() {
        return Some(PathBuf::from(&cfg.logging.file_path));
    }
    Some(PathBuf::from("logs").join("ocr-pool.log"))
}

async fn doctor(cfg: &Config, lang: Option<&str>) -> Result<()> {
    let language = lang
        .unwrap_or(cfg.recovery.default_fallback_language.as_str())
        .to_string();
    let factory = ProcessEngineFactory::new(&cfg.engine);
    let source: Arc<dyn MemorySource> = Arc::new(SystemMemorySource::from_config(&cfg.memory)?);

    let pool = WorkerPool::new(&cfg.pool, factory.clone());
    let guardian = MemoryGuardian::new(cfg, pool, source);
    let (memory, memory_error) = match guardian.tick().await {
        Ok(sample) => (Some(sample), None),
        Err(err) => (None, Some(format!("{err:#}"))),
    };

    let (engine_ok, engine_error) = match factory.create(&language).await {
        Ok(engine) => {
            engine.terminate().await;
            (true, None)
        }
        Err(err) => (false, Some(err.to_string())),
    };

    let report = DoctorReport {
        checked_at: now_rfc3339(),
        config: cfg.clone(),
        memory,
        memory_error,
        engine_language: language,
        engine_ok,
        engine_error,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn load_bitmap(cfg: &Config, path: &Path) -> Result<Bitmap> {
    if !path.exists() {
        return Err(anyhow!("input does not exist: {}", path.display()));
    }
    let img = image::open(path).with_context(|| format!("decoding image: {}", path.display()))?;
    let bitmap = Bitmap::from_image(img);
    if bitmap.dpi().is_none() {
        debug!(
            "{} carries no resolution; assuming {} dpi",
            path.display(),
            cfg.preprocess.assumed_dpi
        );
    }
    Ok(bitmap)
}

async fn recognize(
    cfg: &Config,
    inputs: &[PathBuf],
    lang: &str,
    opts: JobOptions,
    out: Option<&Path>,
) -> Result<()> {
    let factory = ProcessEngineFactory::new(&cfg.engine);
    let source: Arc<dyn MemorySource> = Arc::new(SystemMemorySource::from_config(&cfg.memory)?);
    let service = Arc::new(RecognitionService::new(cfg, factory, source)?);
    service.guardian().tick().await?;
    service.start_guardian();

    let mut rejected = Vec::new();
    let mut running = Vec::new();
    for input in inputs {
        let bitmap = load_bitmap(cfg, input)?;
        let started = now_rfc3339();
        match service.submit_with(bitmap, lang, opts.clone()) {
            Ok(id) => running.push((id, input.clone(), started)),
            Err(err) => {
                warn!("{} rejected: {}", input.display(), err);
                rejected.push(RejectedInput {
                    input: input.clone(),
                    error: err,
                });
            }
        }
    }

    let mut tasks = Vec::with_capacity(running.len());
    for (id, input, started) in running {
        let service = service.clone();
        let lang = lang.to_string();
        tasks.push(tokio::spawn(async move {
            let watcher = service.progress(id).ok().map(|mut rx| {
                tokio::spawn(async move {
                    while rx.changed().await.is_ok() {
                        let p = rx.borrow_and_update().clone();
                        info!("{} {:?} {:.0}% {}", id, p.status, p.percent, p.message);
                        if p.status.is_terminal() {
                            break;
                        }
                    }
                })
            });
            let outcome = service.result(id).await;
            if let Some(watcher) = watcher {
                watcher.abort();
            }
            JobReport::new(id, input, &lang, started, now_rfc3339(), outcome)
        }));
    }

    let mut reports = Vec::with_capacity(tasks.len());
    for task in tasks {
        reports.push(task.await.context("recognition task panicked")?);
    }
    service.shutdown().await;

    let succeeded = reports
        .iter()
        .filter(|r| r.result.is_some())
        .count();
    info!(
        "finished {} job(s): {} succeeded, {} failed, {} rejected",
        reports.len(),
        succeeded,
        reports.len() - succeeded,
        rejected.len()
    );

    let body = serde_json::to_string_pretty(&serde_json::json!({
        "jobs": reports,
        "rejected": rejected,
    }))?;
    match out {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                ensure_dir(parent)?;
            }
            std::fs::write(path, body).with_context(|| format!("writing {}", path.display()))?;
        }
        None => println!("{body}"),
    }
    Ok(())
}
