//! Worker handles.
//!
//! A worker is one runtime process bound to one exact version of the rendering
//! code. It never reloads: a code change means a new worker. The process handle
//! is owned by the worker alone; dropping the worker kills the process.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tokio::process::Child;
use tokio::task::JoinHandle;

use crate::bridge::protocol::render_url;

/// A render call through a started worker failed.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// Connection refused, reset, timed out, or the body could not be read.
    #[error("request to worker at {addr} failed: {}", source_chain(.source))]
    Transport {
        addr: SocketAddr,
        #[source]
        source: reqwest::Error,
    },

    /// The rendering code raised, or the worker otherwise answered non-2xx.
    #[error("worker at {addr} responded {status}: {body}")]
    Remote {
        addr: SocketAddr,
        status: u16,
        body: String,
    },
}

/// `err` followed by each of its sources, separated by `: `.
fn source_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.ends_with(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

/// A worker process could not be terminated. The process may have leaked.
#[derive(Debug, thiserror::Error)]
#[error("failed to terminate worker process {pid}: {source}")]
pub struct ProcessKillError {
    pub pid: u32,
    #[source]
    pub source: io::Error,
}

/// A live worker as seen by the dispatcher.
///
/// Implemented by [`ProcessWorker`] for real runtime processes. The trait is the
/// seam that lets the dispatcher be exercised without spawning anything.
#[async_trait]
pub trait Worker: Send + Sync {
    /// The exact code snapshot this worker was launched with.
    fn code(&self) -> &str;

    /// Address announced in the readiness line.
    fn addr(&self) -> SocketAddr;

    /// Perform one render call. Never retries.
    async fn render(&self, route: &str, payload: &str) -> Result<String, RenderError>;

    /// Kill the process. Succeeds if it already exited; safe to call twice.
    async fn terminate(&mut self) -> Result<(), ProcessKillError>;

    /// Stop the process, giving it `grace` to exit on its own first.
    async fn shutdown(&mut self, grace: Duration) -> Result<(), ProcessKillError> {
        let _ = grace;
        self.terminate().await
    }
}

/// POST one render request to a worker and return the markup.
pub async fn post_render(
    client: &reqwest::Client,
    addr: SocketAddr,
    route: &str,
    payload: &str,
    timeout: Option<Duration>,
) -> Result<String, RenderError> {
    let url = render_url(addr, route);
    tracing::trace!(%url, payload_bytes = payload.len(), "Sending render request");

    let mut request = client
        .post(&url)
        .header(CONTENT_TYPE, "application/json")
        .body(payload.to_owned());
    if let Some(timeout) = timeout {
        request = request.timeout(timeout);
    }

    let response = request
        .send()
        .await
        .map_err(|source| RenderError::Transport { addr, source })?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|source| RenderError::Transport { addr, source })?;

    if !status.is_success() {
        return Err(RenderError::Remote {
            addr,
            status: status.as_u16(),
            body,
        });
    }

    Ok(body)
}

/// A runtime process started by [`ProcessLauncher`](crate::launcher::ProcessLauncher).
pub struct ProcessWorker {
    code: String,
    addr: SocketAddr,
    pid: u32,
    child: Child,
    client: reqwest::Client,
    render_timeout: Option<Duration>,
    // Deleted when the worker is dropped.
    _script: tempfile::TempPath,
    output_task: JoinHandle<()>,
}

impl ProcessWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        code: String,
        addr: SocketAddr,
        pid: u32,
        child: Child,
        client: reqwest::Client,
        render_timeout: Option<Duration>,
        script: tempfile::TempPath,
        output_task: JoinHandle<()>,
    ) -> Self {
        Self {
            code,
            addr,
            pid,
            child,
            client,
            render_timeout,
            _script: script,
            output_task,
        }
    }

    /// Ask the process to exit. Returns false if no signal was delivered.
    #[cfg(unix)]
    fn request_exit(&self) -> bool {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(self.pid) else {
            return false;
        };
        match signal::kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(pid = self.pid, error = %e, "SIGTERM not delivered");
                false
            }
        }
    }

    #[cfg(not(unix))]
    fn request_exit(&self) -> bool {
        false
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    fn code(&self) -> &str {
        &self.code
    }

    fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn render(&self, route: &str, payload: &str) -> Result<String, RenderError> {
        post_render(&self.client, self.addr, route, payload, self.render_timeout).await
    }

    async fn terminate(&mut self) -> Result<(), ProcessKillError> {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(pid = self.pid, %status, "Worker already exited");
                return Ok(());
            }
            Ok(None) => {}
            Err(source) => {
                return Err(ProcessKillError {
                    pid: self.pid,
                    source,
                });
            }
        }

        match self.child.kill().await {
            Ok(()) => {
                tracing::debug!(pid = self.pid, addr = %self.addr, "Worker terminated");
                Ok(())
            }
            // Reaped between try_wait and kill.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(source) => Err(ProcessKillError {
                pid: self.pid,
                source,
            }),
        }
    }

    async fn shutdown(&mut self, grace: Duration) -> Result<(), ProcessKillError> {
        if matches!(self.child.try_wait(), Ok(None)) && self.request_exit() {
            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(pid = self.pid, %status, "Worker exited after SIGTERM");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    tracing::warn!(pid = self.pid, error = %e, "Failed to wait for worker");
                }
                Err(_) => {
                    tracing::warn!(pid = self.pid, ?grace, "Worker ignored SIGTERM, killing");
                }
            }
        }
        self.terminate().await
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        // The child itself is spawned with kill_on_drop.
        self.output_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn post_render_returns_markup() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/render"))
            .and(header("content-type", "application/json"))
            .and(body_string(r#"{"user":"ada"}"#))
            .respond_with(ResponseTemplate::new(200).set_body_string("<h1>ada</h1>"))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let html = post_render(
            &client,
            *server.address(),
            "/render",
            r#"{"user":"ada"}"#,
            None,
        )
        .await
        .unwrap();

        assert_eq!(html, "<h1>ada</h1>");
    }

    #[tokio::test]
    async fn post_render_quotes_remote_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(500).set_body_string("TypeError: props.user is undefined"),
            )
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let err = post_render(&client, *server.address(), "/", "{}", None)
            .await
            .unwrap_err();

        match &err {
            RenderError::Remote { status, body, .. } => {
                assert_eq!(*status, 500);
                assert_eq!(body, "TypeError: props.user is undefined");
            }
            other => panic!("expected Remote, got {other:?}"),
        }
        assert!(err.to_string().contains("props.user is undefined"));
    }

    #[tokio::test]
    async fn post_render_maps_refused_connection() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = reqwest::Client::new();
        let err = post_render(&client, addr, "/", "{}", None)
            .await
            .unwrap_err();

        assert!(matches!(err, RenderError::Transport { .. }));
        let message = err.to_string();
        assert!(message.contains("refused"), "{message}");
    }

    #[tokio::test]
    async fn post_render_times_out() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("late")
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let err = post_render(
            &client,
            *server.address(),
            "/",
            "{}",
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();

        match err {
            RenderError::Transport { source, .. } => assert!(source.is_timeout()),
            other => panic!("expected Transport, got {other:?}"),
        }
    }
}
