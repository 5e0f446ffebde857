//! RenderService: transport-agnostic front of the worker pool.
//!
//! This service owns:
//! - The render dispatcher (slots, workers, recycling)
//! - Where the rendering code comes from on each request
//! - Shutdown coordination between transports and the pool
//!
//! Transports (HTTP today) delegate to this service for rendering and health.

use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::watch;

use crate::dispatcher::{DispatchError, DispatchStats, DispatcherConfig, RenderDispatcher};
use crate::health::Health;
use crate::version::VersionInfo;

/// Where the rendering code is read from.
#[derive(Debug, Clone)]
pub enum CodeSource {
    /// Re-read on every render, so edits on disk roll out as worker recycles.
    File(PathBuf),
    Inline(String),
}

impl CodeSource {
    pub async fn load(&self) -> Result<String, ServiceError> {
        match self {
            CodeSource::File(path) => tokio::fs::read_to_string(path).await.map_err(|source| {
                ServiceError::CodeSource {
                    path: path.clone(),
                    source,
                }
            }),
            CodeSource::Inline(code) => Ok(code.clone()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("failed to read rendering code from {}: {source}", path.display())]
    CodeSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Snapshot of service health for transports to query.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: Health,
    pub total_slots: usize,
    pub available_slots: usize,
    pub stats: DispatchStats,
    pub version: VersionInfo,
}

impl HealthSnapshot {
    pub fn is_ready(&self) -> bool {
        self.status == Health::Ready
    }
}

pub struct RenderService {
    dispatcher: RenderDispatcher,
    code: CodeSource,
    version: VersionInfo,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RenderService {
    pub fn new(config: DispatcherConfig, code: CodeSource) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            dispatcher: RenderDispatcher::new(config),
            code,
            version: VersionInfo::new(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn with_version(mut self, version: VersionInfo) -> Self {
        self.version = version;
        self
    }

    pub fn dispatcher(&self) -> &RenderDispatcher {
        &self.dispatcher
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow() || self.dispatcher.is_closed()
    }

    /// Render `route` with `payload` using the current rendering code.
    pub async fn render(&self, route: &str, payload: &str) -> Result<String, ServiceError> {
        if self.is_shutting_down() {
            return Err(DispatchError::ShuttingDown.into());
        }
        let code = self.code.load().await?;
        Ok(self.dispatcher.render(&code, route, payload).await?)
    }

    pub fn health(&self) -> HealthSnapshot {
        let total_slots = self.dispatcher.num_slots();
        let available_slots = self.dispatcher.available_slots();
        let status = if self.is_shutting_down() {
            Health::ShuttingDown
        } else if available_slots == 0 {
            Health::Busy
        } else {
            Health::Ready
        };

        HealthSnapshot {
            status,
            total_slots,
            available_slots,
            stats: self.dispatcher.stats(),
            version: self.version.clone(),
        }
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Stop every worker. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<(), DispatchError> {
        self.trigger_shutdown();
        self.dispatcher.shutdown().await
    }
}
