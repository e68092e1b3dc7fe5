//! Runner supervisor
//!
//! This module drives one worker from spawn to ready: it allocates a port,
//! starts the worker through a [`WorkerLauncher`], polls `/health` until the
//! worker answers, and sends the `/load` command. The resulting
//! [`RunnerHandle`] owns the worker until it is shut down or dropped.

use reqwest::Client;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::error::{Error, Result};
use common::utils::{format_duration, truncate_string};
use config::{environment, DepotConfig, RunnerConfig};

use crate::port;
use crate::state::RunnerState;
use crate::worker::{CommandLauncher, LaunchSpec, WorkerLauncher, WorkerProcess};

/// Environment variable naming the worker's scratch directory
pub const SCRATCH_ENV: &str = "DEPOT_RUNNER_SCRATCH";

/// Longest slice of a worker response body kept in diagnostics
const DIAGNOSTIC_BODY_LIMIT: usize = 512;

/// Starts workers and brings them to the ready state
pub struct RunnerSupervisor {
    /// Worker settings
    config: RunnerConfig,

    /// Storage root propagated to every worker
    storage_root: PathBuf,

    /// How workers are started
    launcher: Arc<dyn WorkerLauncher>,

    /// HTTP client shared by all handles
    client: Client,
}

impl RunnerSupervisor {
    /// Creates a supervisor that runs the configured worker executable
    pub fn new(config: &DepotConfig) -> Result<Self> {
        let launcher = Arc::new(CommandLauncher::from_config(&config.runner));
        Self::with_launcher(config, launcher)
    }

    /// Creates a supervisor with a custom launcher
    pub fn with_launcher(config: &DepotConfig, launcher: Arc<dyn WorkerLauncher>) -> Result<Self> {
        let client = Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| Error::Internal(format!("failed to build worker client: {}", e)))?;

        Ok(Self {
            config: config.runner.clone(),
            storage_root: config.storage_root.clone(),
            launcher,
            client,
        })
    }

    /// Starts a worker for `artifact_path` and returns it once loaded
    ///
    /// On any failure the worker is stopped and its scratch directory removed
    /// before the error is returned.
    pub async fn start(
        &self,
        artifact_id: &str,
        artifact_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<RunnerHandle> {
        let (state, _) = watch::channel(RunnerState::Spawning);

        let addr = port::allocate(&self.config.host)?;
        let port = addr.port();
        let scratch = tempfile::Builder::new().prefix("depot-runner-").tempdir()?;

        let spec = LaunchSpec {
            artifact_path: artifact_path.to_path_buf(),
            host: self.config.host.clone(),
            port,
            env: vec![
                (
                    environment::STORAGE_ROOT.to_string(),
                    self.storage_root.display().to_string(),
                ),
                (SCRATCH_ENV.to_string(), scratch.path().display().to_string()),
            ],
            scratch_dir: scratch.path().to_path_buf(),
        };

        info!("Spawning worker for {} on port {}", artifact_id, port);

        let worker = match self.launcher.launch(&spec).await {
            Ok(worker) => worker,
            Err(e) => {
                warn!("Worker for {} failed to start: {}", artifact_id, e);
                return Err(e);
            }
        };

        let mut handle = RunnerHandle {
            artifact_id: artifact_id.to_string(),
            worker,
            port,
            base_url: port::base_url(addr),
            client: self.client.clone(),
            scratch: Some(scratch),
            state,
            grace: self.config.shutdown_grace(),
            stopped: false,
        };

        match self.bring_up(&mut handle, artifact_path, cancel).await {
            Ok(()) => Ok(handle),
            Err(e) => {
                if !e.is_cancelled() {
                    handle.fail(e.to_string());
                }
                if let Err(stop) = handle.shutdown().await {
                    warn!("Failed to stop worker for {}: {}", artifact_id, stop);
                }
                Err(e)
            }
        }
    }

    async fn bring_up(
        &self,
        handle: &mut RunnerHandle,
        artifact_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        handle.transition(RunnerState::WaitingHealthy);
        self.wait_healthy(handle, cancel).await?;

        handle.transition(RunnerState::Loading);
        self.load(handle, artifact_path, cancel).await?;

        handle.transition(RunnerState::Ready);
        Ok(())
    }

    /// Polls `/health` until success, the deadline, cancellation or worker exit
    async fn wait_healthy(&self, handle: &mut RunnerHandle, cancel: &CancellationToken) -> Result<()> {
        let interval = self.config.health_interval();
        let timeout = self.config.health_timeout();
        let url = format!("{}/health", handle.base_url);

        let started = Instant::now();
        let deadline = started + timeout;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let client = handle.client.clone();
        let worker = &mut handle.worker;
        let mut last = String::from("no probe completed");

        loop {
            let probe = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled("cancelled while waiting for worker health".to_string()));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::HealthTimeout { waited: started.elapsed(), last });
                }
                status = worker.wait() => {
                    return Err(Error::Spawn(format!("worker exited before becoming healthy ({})", status)));
                }
                result = async {
                    ticker.tick().await;
                    probe(&client, &url, interval).await
                } => result,
            };

            match probe {
                Ok(()) => {
                    info!(
                        "Worker on port {} healthy after {}",
                        handle.port,
                        format_duration(started.elapsed())
                    );
                    return Ok(());
                }
                Err(diagnostic) => {
                    debug!("Health probe on port {} failed: {}", handle.port, diagnostic);
                    last = diagnostic;
                }
            }
        }
    }

    /// Sends the load command
    async fn load(
        &self,
        handle: &mut RunnerHandle,
        artifact_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let url = format!("{}/load", handle.base_url);
        let request = handle
            .client
            .post(&url)
            .timeout(self.config.load_timeout())
            .json(&json!({ "model": artifact_path.to_string_lossy() }))
            .send();

        let worker = &mut handle.worker;
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled("cancelled while loading artifact".to_string()));
            }
            status = worker.wait() => {
                return Err(Error::Spawn(format!("worker exited while loading ({})", status)));
            }
            response = request => response
                .map_err(|e| Error::BackendFailure(format!("load request failed: {}", e)))?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::LoadRejected {
                status: status.as_u16(),
                message: truncate_string(body.trim(), DIAGNOSTIC_BODY_LIMIT),
            });
        }

        info!("Worker on port {} loaded {:?}", handle.port, artifact_path);
        Ok(())
    }
}

/// One health probe; the error is the diagnostic kept for the timeout report
async fn probe(client: &Client, url: &str, timeout: Duration) -> std::result::Result<(), String> {
    match client.get(url).timeout(timeout).send().await {
        Ok(response) if response.status().is_success() => Ok(()),
        Ok(response) => {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(format!(
                "HTTP {}: {}",
                status,
                truncate_string(body.trim(), DIAGNOSTIC_BODY_LIMIT)
            ))
        }
        Err(e) => Err(format!("health request failed: {}", e)),
    }
}

/// A started worker and everything it owns
///
/// Dropping the handle kills the worker and removes its scratch directory;
/// [`RunnerHandle::shutdown`] does the same with a graceful stop first.
pub struct RunnerHandle {
    pub(crate) artifact_id: String,
    pub(crate) worker: Box<dyn WorkerProcess>,
    pub(crate) port: u16,
    pub(crate) base_url: String,
    pub(crate) client: Client,
    scratch: Option<TempDir>,
    state: watch::Sender<RunnerState>,
    grace: Duration,
    stopped: bool,
}

impl RunnerHandle {
    /// Artifact the worker serves
    pub fn artifact_id(&self) -> &str {
        &self.artifact_id
    }

    /// Port the worker listens on
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Current state
    pub fn state(&self) -> RunnerState {
        self.state.borrow().clone()
    }

    /// Receiver observing every state change
    pub fn subscribe(&self) -> watch::Receiver<RunnerState> {
        self.state.subscribe()
    }

    /// Scratch directory of the worker, until shutdown
    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch.as_ref().map(|dir| dir.path())
    }

    /// Moves to `next` if the transition is valid
    pub(crate) fn transition(&self, next: RunnerState) {
        let port = self.port;
        self.state.send_if_modified(|current| {
            if current.can_transition_to(&next) {
                debug!("Worker on port {}: {} -> {}", port, current, next);
                *current = next;
                true
            } else {
                if !current.is_terminal() {
                    warn!("Worker on port {}: ignoring transition {} -> {}", port, current, next);
                }
                false
            }
        });
    }

    /// Marks the pipeline as failed
    pub(crate) fn fail(&self, reason: impl Into<String>) {
        self.transition(RunnerState::Failed(reason.into()));
    }

    /// Stops the worker and removes the scratch directory
    ///
    /// Safe to call more than once. A failed pipeline keeps its `Failed` state.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        self.transition(RunnerState::Terminating);
        let result = self.worker.terminate(self.grace).await;

        if let Some(scratch) = self.scratch.take() {
            if let Err(e) = scratch.close() {
                warn!("Failed to remove worker scratch directory: {}", e);
            }
        }

        self.transition(RunnerState::Terminated);
        info!("Worker for {} on port {} shut down", self.artifact_id, self.port);

        result
    }
}

impl Drop for RunnerHandle {
    fn drop(&mut self) {
        if !self.stopped {
            debug!("Worker handle on port {} dropped without shutdown, killing", self.port);
            self.state.send_if_modified(|current| {
                if current.is_terminal() {
                    false
                } else {
                    *current = RunnerState::Terminated;
                    true
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{completion_ok, StubLauncher};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::Router;

    fn config(interval_ms: u64, timeout_ms: u64) -> DepotConfig {
        let mut config = DepotConfig::default();
        config.storage_root = PathBuf::from("/srv/depot/models");
        config.runner.health_interval_ms = interval_ms;
        config.runner.health_timeout_ms = timeout_ms;
        config.runner.shutdown_grace_ms = 200;
        config
    }

    fn healthy_app() -> Router {
        Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/load", post(|| async { StatusCode::OK }))
            .route("/completion", post(completion_ok))
    }

    #[tokio::test]
    async fn test_start_reaches_ready_and_propagates_env() {
        let launcher = StubLauncher::new(healthy_app());
        let supervisor = RunnerSupervisor::with_launcher(&config(20, 2000), launcher.clone()).unwrap();

        let mut handle = supervisor
            .start("mlx-community/tiny", Path::new("/srv/depot/models/mlx-community_tiny"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(handle.state(), RunnerState::Ready);

        let specs = launcher.launches();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].port, handle.port());
        assert_eq!(specs[0].env_var("DEPOT_MODELS"), Some("/srv/depot/models"));
        assert!(specs[0].scratch_dir.is_dir());

        let scratch = handle.scratch_dir().unwrap().to_path_buf();
        handle.shutdown().await.unwrap();
        assert_eq!(handle.state(), RunnerState::Terminated);
        assert!(!scratch.exists());
    }

    #[tokio::test]
    async fn test_ipv6_loopback_worker_becomes_ready() {
        if std::net::TcpListener::bind("[::1]:0").is_err() {
            return;
        }
        let mut config = config(20, 2000);
        config.runner.host = "::1".to_string();
        let supervisor =
            RunnerSupervisor::with_launcher(&config, StubLauncher::new(healthy_app())).unwrap();

        let mut handle = supervisor
            .start("mlx-community/tiny", Path::new("/tmp/tiny"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(handle.state(), RunnerState::Ready);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_waits_until_worker_answers() {
        let app = Router::new()
            .route("/health", get(crate::testing::healthy_after(3)))
            .route("/load", post(|| async { StatusCode::OK }));
        let supervisor =
            RunnerSupervisor::with_launcher(&config(20, 2000), StubLauncher::new(app)).unwrap();

        let handle = supervisor
            .start("mlx-community/tiny", Path::new("/tmp/tiny"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(handle.state().is_ready());
    }

    #[tokio::test]
    async fn test_health_timeout_keeps_last_diagnostic() {
        let app = Router::new().route(
            "/health",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "warming up") }),
        );
        let launcher = StubLauncher::new(app);
        let supervisor = RunnerSupervisor::with_launcher(&config(50, 300), launcher.clone()).unwrap();

        let err = match supervisor
            .start("mlx-community/tiny", Path::new("/tmp/tiny"), &CancellationToken::new())
            .await
        {
            Ok(_) => panic!("worker should not become healthy"),
            Err(e) => e,
        };

        match &err {
            Error::HealthTimeout { waited, last } => {
                assert!(*waited >= Duration::from_millis(300));
                assert!(last.contains("503"), "{}", last);
                assert!(last.contains("warming up"), "{}", last);
            }
            other => panic!("unexpected error {}", other),
        }
        assert!(!launcher.launches()[0].scratch_dir.exists());
    }

    #[tokio::test]
    async fn test_load_rejection_carries_status() {
        let app = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route(
                "/load",
                post(|| async { (StatusCode::UNPROCESSABLE_ENTITY, "unsupported architecture") }),
            );
        let supervisor =
            RunnerSupervisor::with_launcher(&config(20, 2000), StubLauncher::new(app)).unwrap();

        let err = match supervisor
            .start("mlx-community/tiny", Path::new("/tmp/tiny"), &CancellationToken::new())
            .await
        {
            Ok(_) => panic!("load should be rejected"),
            Err(e) => e,
        };

        match err {
            Error::LoadRejected { status, message } => {
                assert_eq!(status, 422);
                assert_eq!(message, "unsupported architecture");
            }
            other => panic!("unexpected error {}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_during_health_wait() {
        let app = Router::new().route("/health", get(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let supervisor =
            RunnerSupervisor::with_launcher(&config(20, 10_000), StubLauncher::new(app)).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = match supervisor.start("mlx-community/tiny", Path::new("/tmp/tiny"), &cancel).await {
            Ok(_) => panic!("start should be cancelled"),
            Err(e) => e,
        };
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
