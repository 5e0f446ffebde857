//! In-process launcher and worker doubles for unit tests.
//!
//! `FakeWorker` renders `<p>{code}|{route}|{payload}</p>` and records its
//! lifecycle in a shared event log (`launch:<code>`, `terminate:<code>`,
//! `drop:<code>`). Route `/fail` and any code containing `throw` make the render
//! fail, the latter with a body quoting the code; code containing `unkillable`
//! makes `terminate` fail.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::launcher::{LaunchError, Launcher};
use crate::worker::{ProcessKillError, RenderError, Worker};

#[derive(Default)]
pub struct Tracker {
    pub launches: AtomicUsize,
    pub live: AtomicUsize,
    pub max_live: AtomicUsize,
    pub overlapped: AtomicBool,
    pub events: Mutex<Vec<String>>,
}

impl Tracker {
    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct FakeLauncher {
    pub tracker: Arc<Tracker>,
    pub fail_launch: AtomicBool,
    pub render_delay: Duration,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(render_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            render_delay,
            ..Self::default()
        })
    }

    pub fn set_fail_launch(&self, fail: bool) {
        self.fail_launch.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, code: &str) -> Result<Box<dyn Worker>, LaunchError> {
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(LaunchError::Exited {
                status: "exit status: 1".to_string(),
            });
        }

        let tracker = &self.tracker;
        let port = 40000 + tracker.launches.fetch_add(1, Ordering::SeqCst) as u16;
        let live = tracker.live.fetch_add(1, Ordering::SeqCst) + 1;
        tracker.max_live.fetch_max(live, Ordering::SeqCst);
        tracker.record(format!("launch:{code}"));

        Ok(Box::new(FakeWorker {
            code: code.to_string(),
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            tracker: Arc::clone(tracker),
            in_flight: AtomicUsize::new(0),
            delay: self.render_delay,
            terminated: false,
        }))
    }

    async fn runtime_version(&self) -> Option<String> {
        Some("fake-1.0".to_string())
    }
}

pub struct FakeWorker {
    code: String,
    addr: SocketAddr,
    tracker: Arc<Tracker>,
    in_flight: AtomicUsize,
    delay: Duration,
    terminated: bool,
}

#[async_trait]
impl Worker for FakeWorker {
    fn code(&self) -> &str {
        &self.code
    }

    fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn render(&self, route: &str, payload: &str) -> Result<String, RenderError> {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.tracker.overlapped.store(true, Ordering::SeqCst);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if route == "/fail" {
            return Err(RenderError::Remote {
                addr: self.addr,
                status: 500,
                body: "Error: boom".to_string(),
            });
        }
        if self.code.contains("throw") {
            return Err(RenderError::Remote {
                addr: self.addr,
                status: 500,
                body: format!("Uncaught exception in {:?}", self.code),
            });
        }
        Ok(format!("<p>{}|{}|{}</p>", self.code, route, payload))
    }

    async fn terminate(&mut self) -> Result<(), ProcessKillError> {
        if self.code.contains("unkillable") {
            return Err(ProcessKillError {
                pid: 4242,
                source: std::io::Error::other("operation not permitted"),
            });
        }
        if !self.terminated {
            self.terminated = true;
            self.tracker.live.fetch_sub(1, Ordering::SeqCst);
            self.tracker.record(format!("terminate:{}", self.code));
        }
        Ok(())
    }
}

impl Drop for FakeWorker {
    fn drop(&mut self) {
        if !self.terminated {
            self.tracker.live.fetch_sub(1, Ordering::SeqCst);
            self.tracker.record(format!("drop:{}", self.code));
        }
    }
}
