//! renderpool: server-side rendering through a pool of long-lived script
//! runtime workers.
//!
//! Each worker is a runtime process bound to one snapshot of the rendering
//! code. [`RenderDispatcher`] bounds concurrency to the pool size, reuses a
//! worker while the code is unchanged, and replaces it when the code changes
//! or a render fails.

mod health;
mod version;

pub mod bridge;
pub mod dispatcher;
pub mod launcher;
pub mod service;
pub mod slot;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod testing;

pub use dispatcher::{DispatchError, DispatchStats, DispatcherConfig, RenderDispatcher};
pub use health::Health;
pub use launcher::{LaunchError, Launcher, LauncherConfig, ProcessLauncher};
pub use service::{CodeSource, HealthSnapshot, RenderService, ServiceError};
pub use version::{RENDERPOOL_VERSION, VersionInfo};
pub use worker::{ProcessKillError, ProcessWorker, RenderError, Worker};
