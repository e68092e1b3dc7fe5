//! Resumable artifact downloader
//!
//! This module transfers the files of a manifest into the artifact store.
//! Each file streams into `<name>.part` and is renamed into place only once
//! its byte count is right, so an interrupted transfer resumes from the
//! partial file with a `Range` request. Whole artifacts are assembled in the
//! store's staging directory and committed when every file has arrived.

use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::error::{Error, Result};
use common::models::{DownloadProgress, Manifest, ManifestEntry};
use common::utils::format_bytes;
use config::DownloadConfig;

use crate::store::ArtifactStore;

/// Receiver of download progress events
pub trait ProgressSink: Send + Sync {
    /// Called for every progress event, in order
    fn report(&self, progress: DownloadProgress);
}

impl<F> ProgressSink for F
where
    F: Fn(DownloadProgress) + Send + Sync,
{
    fn report(&self, progress: DownloadProgress) {
        self(progress)
    }
}

/// Sink that drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn report(&self, _progress: DownloadProgress) {}
}

/// How the response body relates to the partial file
enum WriteMode {
    /// Body continues the partial file
    Append,
    /// Body is the whole file
    Truncate,
}

/// Downloader for manifest files
#[derive(Debug, Clone)]
pub struct Downloader {
    /// HTTP client for file requests
    client: Client,

    /// Bearer token, if any
    token: Option<String>,

    /// Longest gap tolerated between two body chunks
    read_timeout: Duration,

    /// Keep staging directories after resumable failures
    retain_partial: bool,
}

/// Path of the partial file for `dest`
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

fn file_len(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().filter(|m| m.is_file()).map(|m| m.len())
}

/// Parses the total of a `Content-Range: bytes a-b/total` header
fn content_range_total(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_RANGE)?
        .to_str()
        .ok()?
        .rsplit('/')
        .next()?
        .trim()
        .parse()
        .ok()
}

fn content_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Reports a committed artifact and its digest
///
/// The artifact is already usable at this point, so a digest failure is only
/// logged.
fn report_committed(store: &ArtifactStore, id: &str, sink: &dyn ProgressSink) {
    sink.report(DownloadProgress::status("success"));
    match store.digest(id) {
        Ok(digest) => sink.report(DownloadProgress::status(format!("digest {}", digest))),
        Err(e) => warn!("Could not digest {} after download: {}", id, e),
    }
}

impl Downloader {
    /// Creates a downloader attaching `token` to every request
    pub fn new(config: &DownloadConfig, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("model-depot/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| Error::Internal(format!("failed to build download client: {}", e)))?;

        Ok(Self {
            client,
            token,
            read_timeout: config.read_timeout(),
            retain_partial: config.retain_partial,
        })
    }

    /// Downloads every file of `manifest` and commits the artifact
    ///
    /// Returns the final artifact directory. On failure the staging directory
    /// survives only when the error is resumable and partial retention is on.
    pub async fn download_artifact(
        &self,
        store: &ArtifactStore,
        manifest: &Manifest,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let id = manifest.artifact_id.as_str();
        let staging = store.staging_path_for(id)?;
        tokio::fs::create_dir_all(&staging).await?;

        info!(
            "Downloading {} ({} files, {})",
            id,
            manifest.entries.len(),
            format_bytes(manifest.total_size())
        );

        let result = async {
            for entry in &manifest.entries {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled(format!("download of {} cancelled", id)));
                }
                let dest = staging.join(&entry.filename);
                self.download_file(entry, &dest, sink, cancel).await?;
            }
            store.commit_staged(id)
        }
        .await;

        match result {
            Ok(path) => {
                report_committed(store, id, sink);
                info!("Downloaded {} to {:?}", id, path);
                Ok(path)
            }
            Err(e) => {
                if self.retain_partial && e.is_resumable() {
                    info!("Keeping partial download of {} for resume: {}", id, e);
                } else {
                    warn!("Download of {} failed, removing staging directory: {}", id, e);
                    if let Err(cleanup) = store.discard_staged(id) {
                        warn!("Failed to remove staging directory of {}: {}", id, cleanup);
                    }
                }
                Err(e)
            }
        }
    }

    /// Downloads one file to `dest`, resuming from `<dest>.part` when present
    ///
    /// Returns the final size of the file.
    pub async fn download_file(
        &self,
        entry: &ManifestEntry,
        dest: &Path,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let name = entry.filename.as_str();
        let expected = entry.size;
        let part = part_path(dest);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if expected > 0 && file_len(dest) == Some(expected) {
            debug!("{} already complete", name);
            sink.report(DownloadProgress::file(name, expected, expected));
            return Ok(expected);
        }

        let mut offset = match file_len(&part) {
            Some(len) if expected > 0 && len == expected => {
                debug!("{} fully present as partial file, promoting", name);
                tokio::fs::rename(&part, dest).await?;
                sink.report(DownloadProgress::file(name, expected, expected));
                return Ok(expected);
            }
            Some(len) if expected > 0 && len > expected => {
                warn!("Partial {} is larger than expected, starting over", name);
                tokio::fs::remove_file(&part).await?;
                0
            }
            Some(len) => len,
            None => 0,
        };

        let mut retried_unsatisfiable = false;
        let (response, mode) = loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled(format!("download of {} cancelled", name)));
            }

            let response = self.request(&entry.url, name, offset, cancel).await?;
            let status = response.status();

            match status {
                StatusCode::PARTIAL_CONTENT => break (response, WriteMode::Append),
                StatusCode::OK => {
                    if offset > 0 {
                        debug!("Server ignored range for {}, restarting", name);
                    }
                    offset = 0;
                    break (response, WriteMode::Truncate);
                }
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    return Err(Error::AuthRequired(format!(
                        "{} returned {} for {}",
                        entry.url,
                        status.as_u16(),
                        name
                    )));
                }
                StatusCode::RANGE_NOT_SATISFIABLE if !retried_unsatisfiable => {
                    warn!("Range {} of {} not satisfiable, restarting", offset, name);
                    if let Err(e) = tokio::fs::remove_file(&part).await {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            return Err(e.into());
                        }
                    }
                    offset = 0;
                    retried_unsatisfiable = true;
                }
                _ => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(Error::transfer(
                        name,
                        format!(
                            "HTTP {}: {}",
                            status.as_u16(),
                            common::utils::truncate_string(body.trim(), 256)
                        ),
                        file_len(&part).unwrap_or(0),
                    ));
                }
            }
        };

        let total = if expected > 0 {
            expected
        } else {
            match (content_length(&response), &mode) {
                (Some(len), WriteMode::Append) => len + offset,
                (Some(len), WriteMode::Truncate) => len,
                (None, _) => content_range_total(&response).unwrap_or(0),
            }
        };

        let mut file = match mode {
            WriteMode::Append => {
                debug!("Resuming {} at {}", name, format_bytes(offset));
                sink.report(DownloadProgress::file(name, offset, total));
                OpenOptions::new().create(true).append(true).open(&part).await?
            }
            WriteMode::Truncate => File::create(&part).await?,
        };

        let mut written = offset;
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    file.flush().await?;
                    drop(file);
                    return Err(Error::Cancelled(format!(
                        "download of {} cancelled at {}",
                        name,
                        format_bytes(written)
                    )));
                }
                next = tokio::time::timeout(self.read_timeout, stream.next()) => next,
            };

            let failure = match next {
                Ok(None) => break,
                Ok(Some(Ok(chunk))) => {
                    file.write_all(&chunk).await?;
                    written += chunk.len() as u64;
                    sink.report(DownloadProgress::file(name, written, total));
                    continue;
                }
                Ok(Some(Err(e))) => e.to_string(),
                Err(_) => format!("no data received for {:?}", self.read_timeout),
            };

            file.flush().await?;
            drop(file);
            return Err(Self::interrupted(name, &part, written, failure).await);
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if total > 0 && written != total {
            if written > total {
                tokio::fs::remove_file(&part).await?;
                return Err(Error::transfer(
                    name,
                    format!("received {} bytes, expected {}", written, total),
                    0,
                ));
            }
            return Err(Error::transfer(
                name,
                format!("received {} bytes, expected {}", written, total),
                written,
            ));
        }

        tokio::fs::rename(&part, dest).await?;
        debug!("Finished {} ({})", name, format_bytes(written));

        Ok(written)
    }

    /// Sends the file request, honouring cancellation while waiting for headers
    async fn request(
        &self,
        url: &str,
        name: &str,
        offset: u64,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                Err(Error::Cancelled(format!("download of {} cancelled", name)))
            }
            response = request.send() => {
                response.map_err(|e| Error::transfer(name, e.to_string(), offset))
            }
        }
    }

    /// Builds the error for a broken transfer, dropping an empty partial file
    async fn interrupted(name: &str, part: &Path, written: u64, message: String) -> Error {
        let preserved = file_len(part).unwrap_or(written);
        if preserved == 0 {
            if let Err(e) = tokio::fs::remove_file(part).await {
                debug!("Could not remove empty partial {:?}: {}", part, e);
            }
        } else {
            warn!("Transfer of {} interrupted after {}", name, format_bytes(preserved));
        }
        Error::transfer(name, message, preserved)
    }
}
