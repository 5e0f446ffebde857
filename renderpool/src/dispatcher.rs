//! Render dispatcher - the public entry point.
//!
//! Every call takes a slot, makes sure the slot's worker runs exactly the
//! requested code (recycling it otherwise), renders through it and hands the
//! slot back. Any failed render kills the worker, so the next caller on that
//! slot relaunches instead of inheriting a worker in unknown state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::launcher::{LaunchError, Launcher, LauncherConfig, ProcessLauncher};
use crate::slot::SlotPool;
use crate::worker::{ProcessKillError, RenderError, Worker};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("launch failed: {0}")]
    Launch(#[from] LaunchError),

    #[error("render failed: {0}")]
    Render(#[from] RenderError),

    #[error("kill failed: {0}")]
    Kill(#[from] ProcessKillError),

    /// The render failed and the worker could not be killed afterwards.
    #[error("render failed: {render}; kill failed: {kill}")]
    RenderAndKill {
        render: RenderError,
        kill: ProcessKillError,
    },

    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

impl DispatchError {
    /// Stage of the pipeline that failed.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Launch(_) => "launch",
            Self::Render(_) | Self::RenderAndKill { .. } => "render",
            Self::Kill(_) => "kill",
            Self::ShuttingDown => "shutdown",
        }
    }
}

pub struct DispatcherConfig {
    pub num_workers: usize,
    /// How long a worker gets to exit after SIGTERM during shutdown.
    pub shutdown_grace: Duration,
    pub launcher: Arc<dyn Launcher>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatcherConfig {
    pub fn new() -> Self {
        Self {
            num_workers: std::env::var("RENDERPOOL_WORKERS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1),
            shutdown_grace: Duration::from_secs(5),
            launcher: ProcessLauncher::shared(LauncherConfig::default()),
        }
    }

    pub fn with_num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }
}

/// Counters since the dispatcher was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Launch attempts, successful or not.
    pub launches: u64,
    /// Workers discarded because the requested code changed.
    pub recycled: u64,
    pub renders: u64,
    pub failed_renders: u64,
}

#[derive(Default)]
struct Counters {
    launches: AtomicU64,
    recycled: AtomicU64,
    renders: AtomicU64,
    failed_renders: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            launches: self.launches.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            renders: self.renders.load(Ordering::Relaxed),
            failed_renders: self.failed_renders.load(Ordering::Relaxed),
        }
    }
}

pub struct RenderDispatcher {
    pool: SlotPool<Box<dyn Worker>>,
    launcher: Arc<dyn Launcher>,
    shutdown_grace: Duration,
    closed: AtomicBool,
    counters: Counters,
}

impl RenderDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        let pool = SlotPool::new(config.num_workers);
        tracing::info!(num_workers = pool.num_slots(), "Render dispatcher created");

        Self {
            pool,
            launcher: config.launcher,
            shutdown_grace: config.shutdown_grace,
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn num_slots(&self) -> usize {
        self.pool.num_slots()
    }

    pub fn available_slots(&self) -> usize {
        self.pool.available()
    }

    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Render `route` with `payload` through a worker running exactly `code`.
    ///
    /// Blocks until a slot is free. No retries: a caller that wants one calls
    /// again and gets a freshly launched worker.
    pub async fn render(
        &self,
        code: &str,
        route: &str,
        payload: &str,
    ) -> Result<String, DispatchError> {
        let mut lease = self.pool.acquire().await;
        if self.is_closed() {
            return Err(DispatchError::ShuttingDown);
        }
        let slot = lease.slot_id();

        if let Some(mut stale) = lease.take_if(|w| w.code() != code) {
            tracing::info!(%slot, addr = %stale.addr(), "Code changed, recycling worker");
            Counters::bump(&self.counters.recycled);
            stale.terminate().await?;
        }

        // The worker leaves the lease for the duration of the call. If this
        // future is dropped mid-render, the worker is dropped with it and the
        // slot goes back empty.
        let mut worker = match lease.take() {
            Some(worker) => worker,
            None => {
                tracing::debug!(%slot, "Launching worker");
                Counters::bump(&self.counters.launches);
                self.launcher.launch(code).await.inspect_err(|e| {
                    tracing::warn!(%slot, error = %e, "Worker launch failed");
                })?
            }
        };

        Counters::bump(&self.counters.renders);
        match worker.render(route, payload).await {
            Ok(html) => {
                tracing::debug!(%slot, route, bytes = html.len(), "Render succeeded");
                lease.put(worker);
                Ok(html)
            }
            Err(render) => {
                Counters::bump(&self.counters.failed_renders);
                tracing::warn!(%slot, route, error = %render, "Render failed, discarding worker");
                match worker.terminate().await {
                    Ok(()) => Err(DispatchError::Render(render)),
                    Err(kill) => Err(DispatchError::RenderAndKill { render, kill }),
                }
            }
        }
    }

    /// Stop accepting renders and stop every live worker.
    ///
    /// Waits for in-flight renders to release their slots. Returns the first
    /// kill failure after attempting every worker. Later calls are no-ops.
    pub async fn shutdown(&self) -> Result<(), DispatchError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::info!("Shutting down render dispatcher");

        let mut leases = Vec::with_capacity(self.pool.num_slots());
        for _ in 0..self.pool.num_slots() {
            leases.push(self.pool.acquire().await);
        }

        let mut first_error = None;
        let mut stopped = 0usize;
        for lease in &mut leases {
            let Some(mut worker) = lease.take() else {
                continue;
            };
            match worker.shutdown(self.shutdown_grace).await {
                Ok(()) => stopped += 1,
                Err(e) => {
                    tracing::error!(slot = %lease.slot_id(), error = %e, "Failed to stop worker");
                    first_error.get_or_insert(e);
                }
            }
        }

        tracing::info!(stopped, "Render dispatcher shut down");
        match first_error {
            Some(e) => Err(DispatchError::Kill(e)),
            None => Ok(()),
        }
    }
}
