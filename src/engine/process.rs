use super::types::{WorkerEvent, WorkerRequest};
use super::{Engine, EngineError, EngineFactory, EngineOutput, ProgressSender};
use crate::config;
use crate::preprocess::EngineBitmap;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Spawns one long-lived recognizer worker process per engine handle.
#[derive(Debug, Clone)]
pub struct ProcessEngineFactory {
    cfg: config::Engine,
}

impl ProcessEngineFactory {
    pub fn new(cfg: &config::Engine) -> Self {
        Self { cfg: cfg.clone() }
    }

    fn command_for(&self, language: &str) -> Command {
        let mut cmd = Command::new(&self.cfg.command);
        cmd.args(self.cfg.args.iter().map(|a| a.replace("{lang}", language)));
        for (k, v) in &self.cfg.env {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

impl EngineFactory for ProcessEngineFactory {
    type Engine = ProcessEngine;

    async fn create(&self, language: &str) -> Result<ProcessEngine, EngineError> {
        if !self.supports(language) {
            return Err(EngineError::Unsupported(language.to_string()));
        }

        let mut child = self.command_for(language).spawn().map_err(|e| {
            EngineError::Init(format!("spawning {} for {language}: {e}", self.cfg.command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Init("worker has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Init("worker has no stdout".into()))?;

        // Drain stderr so a chatty worker can't block on a full pipe.
        if let Some(stderr) = child.stderr.take() {
            let lang = language.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("worker[{lang}] stderr: {}", line.trim_end());
                }
            });
        }

        let mut lines = BufReader::new(stdout).lines();
        let handshake = tokio::time::timeout(self.cfg.init_timeout(), read_event(&mut lines)).await;
        match handshake {
            Ok(Ok(Some(WorkerEvent::Ready { language: ready, version }))) => {
                info!(
                    "worker ready language={} pid={:?} version={}",
                    ready,
                    child.id(),
                    version.as_deref().unwrap_or("unknown")
                );
            }
            Ok(Ok(Some(WorkerEvent::Error { message }))) => {
                return Err(EngineError::Init(message));
            }
            Ok(Ok(Some(other))) => {
                return Err(EngineError::Init(format!(
                    "unexpected handshake event: {other:?}"
                )));
            }
            Ok(Ok(None)) => {
                let status = child.wait().await.ok();
                return Err(EngineError::Exited(format!(
                    "worker closed stdout during handshake (status {status:?})"
                )));
            }
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(EngineError::Init(format!(
                    "no handshake within {:?}",
                    self.cfg.init_timeout()
                )));
            }
        }

        Ok(ProcessEngine {
            language: language.to_string(),
            child,
            stdin,
            lines,
            next_id: 0,
            write_interrupted: false,
            exited: false,
        })
    }

    fn supports(&self, language: &str) -> bool {
        self.cfg.languages.is_empty() || self.cfg.languages.iter().any(|l| l == language)
    }
}

pub struct ProcessEngine {
    language: String,
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    next_id: u64,
    write_interrupted: bool,
    exited: bool,
}

impl ProcessEngine {
    pub fn language(&self) -> &str {
        &self.language
    }

    async fn send(&mut self, req: &WorkerRequest) -> Result<(), EngineError> {
        let mut line = serde_json::to_vec(req)
            .map_err(|e| EngineError::Recognition(format!("encoding request: {e}")))?;
        line.push(b'\n');
        if self.write_interrupted {
            // Terminate the partial line left by an abandoned call.
            self.stdin.write_all(b"\n").await?;
        }
        self.write_interrupted = true;
        self.stdin.write_all(&line).await?;
        self.stdin.flush().await?;
        self.write_interrupted = false;
        Ok(())
    }
}

impl Engine for ProcessEngine {
    async fn recognize(
        &mut self,
        bitmap: &EngineBitmap,
        progress: ProgressSender,
    ) -> Result<EngineOutput, EngineError> {
        self.next_id += 1;
        let id = self.next_id;

        let png = bitmap
            .to_png()
            .map_err(|e| EngineError::Recognition(format!("encoding PNG: {e}")))?;
        let req = WorkerRequest::Recognize {
            id,
            width: bitmap.width(),
            height: bitmap.height(),
            png_base64: STANDARD.encode(png),
        };
        if let Err(err) = self.send(&req).await {
            self.exited = true;
            return Err(err);
        }

        loop {
            let event = match read_event(&mut self.lines).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    self.exited = true;
                    return Err(EngineError::Exited(format!(
                        "{} worker closed stdout",
                        self.language
                    )));
                }
                Err(err) => {
                    self.exited = true;
                    return Err(err);
                }
            };

            if event.request_id() != Some(id) {
                debug!("discarding stale worker event: {:?}", event);
                continue;
            }

            match event {
                WorkerEvent::Progress { fraction, .. } => {
                    if fraction.is_finite() {
                        let _ = progress.send(fraction.clamp(0.0, 1.0));
                    }
                }
                WorkerEvent::Done {
                    text, confidence, ..
                } => {
                    return Ok(EngineOutput {
                        text,
                        confidence: confidence.clamp(0.0, 100.0),
                    });
                }
                WorkerEvent::Failed { message, .. } => {
                    return Err(EngineError::Recognition(message));
                }
                WorkerEvent::Ready { .. } | WorkerEvent::Error { .. } => {}
            }
        }
    }

    async fn terminate(mut self) {
        if !self.exited {
            let _ = self.send(&WorkerRequest::Shutdown).await;
        }
        let ProcessEngine {
            mut child,
            stdin,
            language,
            ..
        } = self;
        drop(stdin);
        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!("worker[{language}] exited with {status}"),
            Ok(Err(err)) => warn!("worker[{language}] wait failed: {err}"),
            Err(_) => {
                warn!("worker[{language}] ignored shutdown; killing");
                let _ = child.kill().await;
            }
        }
    }

    fn is_healthy(&self) -> bool {
        !self.exited
    }
}

async fn read_event(
    lines: &mut Lines<BufReader<ChildStdout>>,
) -> Result<Option<WorkerEvent>, EngineError> {
    loop {
        let Some(line) = lines.next_line().await? else {
            return Ok(None);
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<WorkerEvent>(line) {
            Ok(event) => return Ok(Some(event)),
            Err(err) => debug!("ignoring non-protocol worker output ({err}): {line}"),
        }
    }
}
