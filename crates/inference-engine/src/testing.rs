//! In-process workers for tests
//!
//! A [`StubLauncher`] serves an axum router on the port the supervisor
//! allocated instead of starting a process. Terminating the worker aborts the
//! server task. Enabled for this crate's own tests and, through the
//! `testing` feature, for downstream integration tests.

use async_trait::async_trait;
use axum::body::StreamBody;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, MethodRouter};
use axum::Router;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use common::error::{Error, Result};

use crate::worker::{LaunchSpec, WorkerLauncher, WorkerProcess};

/// Launcher serving `app` for every launch
///
/// The router sits behind a mutex because axum routers are `Send` but not
/// `Sync`.
pub struct StubLauncher {
    app: Mutex<Router>,
    launches: Mutex<Vec<LaunchSpec>>,
}

impl StubLauncher {
    pub fn new(app: Router) -> Arc<Self> {
        Arc::new(Self {
            app: Mutex::new(app),
            launches: Mutex::new(Vec::new()),
        })
    }

    /// Every launch recorded so far
    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerLauncher for StubLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn WorkerProcess>> {
        self.launches.lock().unwrap().push(spec.clone());
        let app = self.app.lock().unwrap().clone();

        let listener = std::net::TcpListener::bind((spec.host.as_str(), spec.port))
            .map_err(|e| Error::Spawn(e.to_string()))?;
        let server = axum::Server::from_tcp(listener)
            .map_err(|e| Error::Spawn(e.to_string()))?
            .serve(app.into_make_service());

        let task = tokio::spawn(async move {
            let _ = server.await;
        });

        Ok(Box::new(StubWorker { task, exited: false }))
    }
}

struct StubWorker {
    task: JoinHandle<()>,
    exited: bool,
}

#[async_trait]
impl WorkerProcess for StubWorker {
    fn id(&self) -> Option<u32> {
        None
    }

    fn try_exit(&mut self) -> Option<String> {
        (self.exited || self.task.is_finished()).then(|| "stub exited".to_string())
    }

    async fn wait(&mut self) -> String {
        if !self.exited {
            let _ = (&mut self.task).await;
            self.exited = true;
        }
        "stub exited".to_string()
    }

    async fn terminate(&mut self, _grace: Duration) -> Result<()> {
        self.task.abort();
        self.wait().await;
        Ok(())
    }
}

/// `/health` route answering 503 for the first `failures` probes
pub fn healthy_after(failures: usize) -> MethodRouter {
    let probes = Arc::new(AtomicUsize::new(0));
    get(move || {
        let probes = probes.clone();
        async move {
            if probes.fetch_add(1, Ordering::SeqCst) < failures {
                (StatusCode::SERVICE_UNAVAILABLE, "starting")
            } else {
                (StatusCode::OK, "ok")
            }
        }
    })
}

/// NDJSON body built from `lines`, optionally never finishing
pub fn ndjson(lines: &[&str], hang: bool) -> impl IntoResponse {
    let items: Vec<std::result::Result<String, std::io::Error>> =
        lines.iter().map(|line| Ok(format!("{}\n", line))).collect();
    let body = futures::stream::iter(items);
    let body: futures::stream::BoxStream<'static, std::result::Result<String, std::io::Error>> = if hang {
        Box::pin(futures::StreamExt::chain(body, futures::stream::pending()))
    } else {
        Box::pin(body)
    };
    (StatusCode::OK, StreamBody::new(body))
}

/// `/completion` handler streaming `Hel`, `lo` and a done chunk
pub async fn completion_ok() -> impl IntoResponse {
    ndjson(
        &[
            r#"{"content":"Hel","done":false}"#,
            r#"{"content":"lo","done":false}"#,
            r#"{"content":"","done":true,"done_reason":"stop"}"#,
        ],
        false,
    )
}
