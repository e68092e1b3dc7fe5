//! Worker process launching
//!
//! This module provides the seam through which the supervisor starts worker
//! processes. [`CommandLauncher`] runs the configured executable; tests
//! substitute launchers that serve the worker protocol in-process.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use common::error::{Error, Result};
use config::RunnerConfig;

/// Everything a launcher needs to start one worker
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Artifact directory the worker will load
    pub artifact_path: PathBuf,

    /// Loopback address the worker binds
    pub host: String,

    /// Port the worker binds
    pub port: u16,

    /// Variables set explicitly in the worker environment
    pub env: Vec<(String, String)>,

    /// Private scratch directory, removed when the worker is gone
    pub scratch_dir: PathBuf,
}

impl LaunchSpec {
    /// Looks up an explicitly set variable
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A running worker
#[async_trait]
pub trait WorkerProcess: Send {
    /// OS process id, if there is one
    fn id(&self) -> Option<u32>;

    /// Returns the exit description if the worker has already exited
    fn try_exit(&mut self) -> Option<String>;

    /// Resolves once the worker exits, with a description of how it exited
    async fn wait(&mut self) -> String;

    /// Sends the stop signal, waits up to `grace`, then kills
    async fn terminate(&mut self, grace: Duration) -> Result<()>;
}

/// Starts worker processes
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Starts one worker as described by `spec`
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn WorkerProcess>>;
}

/// Launcher running the configured worker executable
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    /// Worker executable
    program: PathBuf,

    /// Arguments placed before `--model` and `--port`
    args: Vec<String>,
}

impl CommandLauncher {
    /// Creates a launcher for `program`
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Creates a launcher from runner settings
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
    }
}

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn WorkerProcess>> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--model")
            .arg(&spec.artifact_path)
            .arg("--port")
            .arg(spec.port.to_string())
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| Error::Spawn(format!("failed to start {:?}: {}", self.program, e)))?;

        let label = format!("worker:{}", spec.port);
        info!("Started {} (pid {:?}) for {:?}", label, child.id(), spec.artifact_path);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, label.clone(), false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, label.clone(), true));
        }

        Ok(Box::new(ChildWorker { child, label }))
    }
}

/// Relays worker output lines into the log
async fn forward_output<R>(stream: R, label: String, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if is_stderr => warn!("[{}] {}", label, line),
            Ok(Some(line)) => debug!("[{}] {}", label, line),
            Ok(None) => break,
            Err(e) => {
                debug!("[{}] output closed: {}", label, e);
                break;
            }
        }
    }
}

/// Worker backed by an OS child process
struct ChildWorker {
    child: Child,
    label: String,
}

impl ChildWorker {
    #[cfg(unix)]
    fn signal_stop(&self) {
        if let Some(pid) = self.child.id() {
            // SAFETY: kill(2) with a pid we own and a valid signal number.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                debug!("SIGTERM to {} failed: {}", self.label, std::io::Error::last_os_error());
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_stop(&self) {}
}

#[async_trait]
impl WorkerProcess for ChildWorker {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_exit(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("unknown exit status: {}", e)),
        }
    }

    async fn wait(&mut self) -> String {
        match self.child.wait().await {
            Ok(status) => status.to_string(),
            Err(e) => format!("unknown exit status: {}", e),
        }
    }

    async fn terminate(&mut self, grace: Duration) -> Result<()> {
        if let Some(status) = self.try_exit() {
            debug!("{} already exited ({})", self.label, status);
            return Ok(());
        }

        self.signal_stop();

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!("{} stopped ({})", self.label, status);
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                warn!("{} ignored stop signal for {:?}, killing", self.label, grace);
                self.child.kill().await?;
                Ok(())
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn spec(scratch: &std::path::Path, models: &str) -> LaunchSpec {
        LaunchSpec {
            artifact_path: PathBuf::from("/models/mlx-community_tiny"),
            host: "127.0.0.1".to_string(),
            port: 4242,
            env: vec![
                ("DEPOT_MODELS".to_string(), models.to_string()),
                ("DEPOT_RUNNER_SCRATCH".to_string(), scratch.display().to_string()),
            ],
            scratch_dir: scratch.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_command_launcher_passes_arguments_and_env() {
        let scratch = tempfile::tempdir().unwrap();
        let out = scratch.path().join("seen.txt");
        let script = format!("echo \"$DEPOT_MODELS $*\" > {}", out.display());

        let launcher = CommandLauncher::new("sh", vec!["-c".to_string(), script, "worker".to_string()]);
        let mut worker = launcher.launch(&spec(scratch.path(), "/srv/depot")).await.unwrap();

        let status = worker.wait().await;
        assert_eq!(status, "exit status: 0");

        let seen = std::fs::read_to_string(&out).unwrap();
        assert_eq!(
            seen.trim(),
            "/srv/depot --model /models/mlx-community_tiny --port 4242"
        );
    }

    #[tokio::test]
    async fn test_terminate_stops_worker_within_grace() {
        let scratch = tempfile::tempdir().unwrap();
        let launcher = CommandLauncher::new(
            "sh",
            vec!["-c".to_string(), "exec sleep 30".to_string(), "worker".to_string()],
        );
        let mut worker = launcher.launch(&spec(scratch.path(), "/srv/depot")).await.unwrap();
        assert!(worker.try_exit().is_none());

        let started = Instant::now();
        worker.terminate(Duration::from_secs(5)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(worker.try_exit().is_some());
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let scratch = tempfile::tempdir().unwrap();
        let launcher = CommandLauncher::new("/definitely/missing/depot-runner", Vec::new());
        let err = match launcher.launch(&spec(scratch.path(), "/srv/depot")).await {
            Ok(_) => panic!("launch should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::Spawn(_)), "{}", err);
    }
}
