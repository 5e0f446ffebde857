//! Worker launcher - starts a runtime process for a code snapshot.
//!
//! Flow:
//! 1. Write wrapper + code + bootstrap to a temporary script
//! 2. Spawn the runtime on that script with stdout piped
//! 3. Read exactly one line from stdout: the worker's `host:port`
//! 4. Forward any later stdout lines to the log
//!
//! Any failure before step 4 kills the half-started process.

use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use crate::bridge::driver::compose_script;
use crate::bridge::protocol::{ReadyLineError, parse_ready_line};
use crate::worker::{ProcessWorker, Worker};

/// Longest stdout line accepted from a worker, readiness line included.
const MAX_OUTPUT_LINE: usize = 64 * 1024;

/// How long to wait for an exit status after a worker closes stdout early.
const EXIT_PROBE: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to write worker script: {0}")]
    Script(#[source] std::io::Error),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker exited before announcing readiness ({status})")]
    Exited { status: String },

    #[error("worker did not announce readiness within {0:?}")]
    Timeout(Duration),

    #[error("malformed readiness line {line:?}: {source}")]
    Malformed {
        line: String,
        #[source]
        source: ReadyLineError,
    },

    #[error("failed to read readiness line: {0}")]
    Handshake(String),
}

/// Extension point for how workers are started.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start a worker bound to `code` and wait until it is ready for requests.
    async fn launch(&self, code: &str) -> Result<Box<dyn Worker>, LaunchError>;

    /// Version string of the script runtime, if it can be determined.
    async fn runtime_version(&self) -> Option<String> {
        None
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|s| s.is_finite() && *s > 0.0)
        .map(Duration::from_secs_f64)
}

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Runtime executable, resolved through `PATH`.
    pub program: String,
    /// Arguments placed before the script path.
    pub args: Vec<String>,
    pub ready_timeout: Duration,
    /// Per-render deadline. `None` waits as long as the worker takes.
    pub render_timeout: Option<Duration>,
    /// Where scripts are written. Defaults to the system temp dir.
    pub script_dir: Option<PathBuf>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            program: std::env::var("RENDERPOOL_RUNTIME").unwrap_or_else(|_| "node".to_string()),
            args: Vec::new(),
            ready_timeout: env_secs("RENDERPOOL_READY_TIMEOUT").unwrap_or(Duration::from_secs(30)),
            render_timeout: env_secs("RENDERPOOL_RENDER_TIMEOUT"),
            script_dir: None,
        }
    }
}

impl LauncherConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_render_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.render_timeout = timeout;
        self
    }

    pub fn with_script_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.script_dir = Some(dir.into());
        self
    }
}

/// Launches workers as child processes of the configured runtime.
pub struct ProcessLauncher {
    config: LauncherConfig,
    client: reqwest::Client,
}

impl ProcessLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        // Shorter than Node's 5s keep-alive so a pooled connection is never
        // reused just as the worker closes it.
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self { config, client }
    }

    pub fn shared(config: LauncherConfig) -> Arc<dyn Launcher> {
        Arc::new(Self::new(config))
    }

    async fn launch_process(&self, code: &str) -> Result<ProcessWorker, LaunchError> {
        let started = Instant::now();
        let script = write_script(code, self.config.script_dir.as_deref())?;

        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .arg(&*script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: self.config.program.clone(),
                source,
            })?;

        let pid = child.id().unwrap_or_default();
        tracing::debug!(pid, script = %script.display(), "Worker process spawned");

        let Some(stdout) = child.stdout.take() else {
            kill_half_started(&mut child, pid).await;
            return Err(LaunchError::Handshake("stdout not captured".to_string()));
        };
        let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_OUTPUT_LINE));

        let addr = match self.await_ready(&mut lines, &mut child).await {
            Ok(addr) => addr,
            Err(e) => {
                kill_half_started(&mut child, pid).await;
                return Err(e);
            }
        };

        tracing::info!(
            pid,
            %addr,
            code_bytes = code.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Worker ready"
        );

        let output_task = tokio::spawn(forward_worker_output(lines, pid));

        Ok(ProcessWorker::new(
            code.to_owned(),
            addr,
            pid,
            child,
            self.client.clone(),
            self.config.render_timeout,
            script,
            output_task,
        ))
    }

    async fn await_ready(
        &self,
        lines: &mut FramedRead<ChildStdout, LinesCodec>,
        child: &mut Child,
    ) -> Result<SocketAddr, LaunchError> {
        let announced = tokio::time::timeout(self.config.ready_timeout, lines.next()).await;

        match announced {
            Ok(Some(Ok(line))) => {
                parse_ready_line(&line).map_err(|source| LaunchError::Malformed { line, source })
            }
            Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => Err(LaunchError::Handshake(
                format!("readiness line longer than {MAX_OUTPUT_LINE} bytes"),
            )),
            Ok(Some(Err(LinesCodecError::Io(e)))) => Err(LaunchError::Handshake(e.to_string())),
            Ok(None) => Err(LaunchError::Exited {
                status: describe_exit(child).await,
            }),
            Err(_) => Err(LaunchError::Timeout(self.config.ready_timeout)),
        }
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, code: &str) -> Result<Box<dyn Worker>, LaunchError> {
        let worker = self.launch_process(code).await?;
        Ok(Box::new(worker))
    }

    async fn runtime_version(&self) -> Option<String> {
        let output = tokio::time::timeout(
            Duration::from_secs(5),
            Command::new(&self.config.program)
                .arg("--version")
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .ok()?
        .ok()?;

        if !output.status.success() {
            return None;
        }
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!version.is_empty()).then_some(version)
    }
}

fn write_script(code: &str, dir: Option<&Path>) -> Result<tempfile::TempPath, LaunchError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("renderpool-").suffix(".js");

    let mut file = match dir {
        Some(dir) => builder.tempfile_in(dir),
        None => builder.tempfile(),
    }
    .map_err(LaunchError::Script)?;

    file.write_all(compose_script(code).as_bytes())
        .map_err(LaunchError::Script)?;
    file.flush().map_err(LaunchError::Script)?;

    Ok(file.into_temp_path())
}

async fn describe_exit(child: &mut Child) -> String {
    match tokio::time::timeout(EXIT_PROBE, child.wait()).await {
        Ok(Ok(status)) => status.to_string(),
        Ok(Err(e)) => format!("wait failed: {e}"),
        Err(_) => "stdout closed while process still running".to_string(),
    }
}

async fn kill_half_started(child: &mut Child, pid: u32) {
    if let Err(e) = child.kill().await
        && e.kind() != std::io::ErrorKind::InvalidInput
    {
        tracing::warn!(pid, error = %e, "Failed to kill half-started worker");
    }
}

async fn forward_worker_output(mut lines: FramedRead<ChildStdout, LinesCodec>, pid: u32) {
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => {
                tracing::info!(target: "renderpool::worker", pid, "{}", line);
            }
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                tracing::warn!(target: "renderpool::worker", pid, "Dropped oversized output line");
            }
            Err(LinesCodecError::Io(e)) => {
                tracing::debug!(pid, error = %e, "Worker stdout read failed");
                break;
            }
        }
    }
    tracing::trace!(pid, "Worker stdout closed");
}
