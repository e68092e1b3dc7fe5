//! Main integration module for Model Depot
//!
//! This module wires the artifact store, the remote catalog, the downloader
//! and the runner supervisor together once at process start. Everything is
//! owned by an explicit [`ModelDepot`] value that callers pass around.

use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use common::error::{Error, Result};
pub use common::models::{
    Artifact, ArtifactDetails, CatalogEntry, CompletionChunk, CompletionRequest, DownloadProgress,
    Manifest, ManifestEntry,
};
pub use config::DepotConfig;
pub use logging::init as init_logging;
pub use inference_engine::{
    CommandLauncher, GenerationStream, LaunchSpec, RunnerHandle, RunnerState, RunnerSupervisor,
    WorkerLauncher, WorkerProcess,
};
pub use model_manager::{ArtifactStore, Downloader, NullSink, ProgressSink, RemoteCatalog};

/// Status reported by [`ModelDepot::pull`] when nothing had to be fetched
pub const ALREADY_EXISTS: &str = "already exists";

/// The assembled depot
pub struct ModelDepot {
    /// Effective configuration
    config: DepotConfig,

    /// Local artifact store
    store: ArtifactStore,

    /// Remote catalog client
    catalog: RemoteCatalog,

    /// File downloader
    downloader: Downloader,

    /// Worker supervisor
    supervisor: RunnerSupervisor,

    /// Per-artifact pull leases
    pulls: DashMap<String, Arc<Mutex<()>>>,
}

impl ModelDepot {
    /// Builds a depot from the layered configuration (defaults, file, environment)
    pub fn load() -> Result<Self> {
        Self::new(DepotConfig::load()?)
    }

    /// Builds a depot that runs the configured worker executable
    pub fn new(config: DepotConfig) -> Result<Self> {
        let supervisor = RunnerSupervisor::new(&config)?;
        Self::assemble(config, supervisor)
    }

    /// Builds a depot with a custom worker launcher
    pub fn with_launcher(config: DepotConfig, launcher: Arc<dyn WorkerLauncher>) -> Result<Self> {
        let supervisor = RunnerSupervisor::with_launcher(&config, launcher)?;
        Self::assemble(config, supervisor)
    }

    fn assemble(config: DepotConfig, supervisor: RunnerSupervisor) -> Result<Self> {
        let store = ArtifactStore::new(&config.storage_root)?;
        let catalog = RemoteCatalog::new(&config)?;
        let downloader = Downloader::new(&config.download, catalog.token().map(str::to_string))?;

        info!("Model depot ready at {:?}", config.storage_root);

        Ok(Self {
            config,
            store,
            catalog,
            downloader,
            supervisor,
            pulls: DashMap::new(),
        })
    }

    /// Effective configuration
    pub fn config(&self) -> &DepotConfig {
        &self.config
    }

    /// Local artifact store
    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Remote catalog client
    pub fn catalog(&self) -> &RemoteCatalog {
        &self.catalog
    }

    /// Makes `id` available locally and returns its directory
    ///
    /// An artifact that already exists is reported as such without contacting
    /// the catalog. Concurrent pulls of one id in this process run one at a
    /// time; later callers find the artifact in place.
    pub async fn pull(
        &self,
        id: &str,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let path = self.store.path_for(id)?;
        if self.store.exists(id) {
            sink.report(DownloadProgress::status(ALREADY_EXISTS));
            return Ok(path);
        }

        let key = ArtifactStore::local_name(id)?;
        let lease = self
            .pulls
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled(format!("pull of {} cancelled", id))),
            _guard = lease.lock() => {
                if self.store.exists(id) {
                    debug!("{} was pulled by a concurrent caller", id);
                    sink.report(DownloadProgress::status(ALREADY_EXISTS));
                    Ok(path)
                } else {
                    self.fetch(id, sink, cancel).await
                }
            }
        };

        drop(lease);
        self.pulls.remove_if(&key, |_, lease| Arc::strong_count(lease) == 1);

        result
    }

    async fn fetch(&self, id: &str, sink: &dyn ProgressSink, cancel: &CancellationToken) -> Result<PathBuf> {
        sink.report(DownloadProgress::status("pulling manifest"));
        let manifest = self.catalog.resolve_manifest(id).await?;
        self.downloader
            .download_artifact(&self.store, &manifest, sink, cancel)
            .await
    }

    /// Lists usable local artifacts
    pub fn list(&self) -> Result<Vec<Artifact>> {
        self.store.list()
    }

    /// Describes one local artifact
    pub fn show(&self, id: &str) -> Result<Artifact> {
        self.store.info(id)
    }

    /// Removes a local artifact
    pub fn delete(&self, id: &str) -> Result<()> {
        self.store.delete(id)
    }

    /// Searches the remote catalog
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<CatalogEntry>> {
        self.catalog.search(query, limit).await
    }

    /// Recommended artifact ids
    pub fn popular(&self) -> &'static [&'static str] {
        RemoteCatalog::popular()
    }

    /// Starts a worker for `request.model` and streams its completion
    ///
    /// Each call gets its own worker, stopped when the stream ends.
    pub async fn generate(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<GenerationStream> {
        let id = request.model.clone();
        if !self.store.exists(&id) {
            return Err(Error::NotFound(format!(
                "artifact {} is not in the local store, pull it first",
                id
            )));
        }

        let path = self.store.path_for(&id)?;
        let handle = self.supervisor.start(&id, &path, &cancel).await?;

        Ok(handle.stream(request, cancel))
    }
}
