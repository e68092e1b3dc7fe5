//! Remote catalog client
//!
//! This module resolves an artifact identifier into the ordered list of files
//! worth downloading, builds per-file download URLs and searches the catalog.
//! The bearer token is resolved once when the client is built.

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::path::{Component, Path};
use tracing::{debug, info};

use common::error::{Error, Result};
use common::models::{CatalogEntry, Manifest, ManifestEntry};
use common::utils::truncate_string;
use config::{DepotConfig, EnvSource, ProcessEnv};

use crate::credentials;

/// Longest slice of an error response body kept in error messages
const ERROR_BODY_LIMIT: usize = 1024;

/// Auxiliary files fetched alongside the weights
const AUXILIARY_FILES: [&str; 11] = [
    "config.json",
    "tokenizer.json",
    "tokenizer_config.json",
    "generation_config.json",
    "special_tokens_map.json",
    "tokenizer.model",
    "preprocessor_config.json",
    "chat_template.json",
    "added_tokens.json",
    "vocab.json",
    "merges.txt",
];

/// Curated artifacts suggested to users who have not searched yet
pub const POPULAR_ARTIFACTS: [&str; 7] = [
    "mlx-community/Llama-3.2-3B-Instruct-4bit",
    "mlx-community/Llama-3.2-1B-Instruct-4bit",
    "mlx-community/Mistral-7B-Instruct-v0.3-4bit",
    "mlx-community/Qwen2.5-7B-Instruct-4bit",
    "mlx-community/SmolLM2-1.7B-Instruct-4bit",
    "mlx-community/Phi-3.5-mini-instruct-4bit",
    "mlx-community/gemma-2-2b-it-4bit",
];

/// Repository metadata as returned by `GET /api/models/<id>`
#[derive(Debug, Deserialize)]
struct RepoInfo {
    #[serde(default)]
    siblings: Vec<Sibling>,
}

#[derive(Debug, Deserialize)]
struct Sibling {
    #[serde(default)]
    rfilename: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    lfs: Option<LfsInfo>,
}

#[derive(Debug, Deserialize)]
struct LfsInfo {
    #[serde(default)]
    size: u64,
}

impl Sibling {
    fn declared_size(&self) -> u64 {
        match &self.lfs {
            Some(lfs) if lfs.size > 0 => lfs.size,
            _ => self.size.unwrap_or(0),
        }
    }
}

/// Returns true if a repository file belongs in a local artifact
pub fn should_download(name: &str) -> bool {
    let lower = name.to_lowercase();
    let file_name = lower.rsplit('/').next().unwrap_or(&lower);

    if AUXILIARY_FILES.contains(&file_name) {
        return true;
    }

    if lower.ends_with(".npz")
        || lower.ends_with(".safetensors")
        || lower.ends_with(".safetensors.index.json")
    {
        return true;
    }

    file_name.starts_with("model-") && file_name.contains(".safetensors")
}

/// Returns true if `name` stays inside the artifact directory
fn is_contained(name: &str) -> bool {
    let path = Path::new(name);
    !name.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

/// Client for the remote artifact catalog
#[derive(Debug, Clone)]
pub struct RemoteCatalog {
    /// HTTP client for metadata requests
    client: Client,

    /// Metadata API base URL
    api_base: String,

    /// Base URL files are resolved against
    resolve_base: String,

    /// Bearer token, if any
    token: Option<String>,

    /// Tag filter for searches
    search_filter: Option<String>,
}

impl RemoteCatalog {
    /// Creates a catalog client, reading credentials from the process environment
    pub fn new(config: &DepotConfig) -> Result<Self> {
        Self::with_env(config, &ProcessEnv)
    }

    /// Creates a catalog client with an explicit environment for credential lookup
    pub fn with_env(config: &DepotConfig, env: &dyn EnvSource) -> Result<Self> {
        let token = credentials::resolve_token(
            config.catalog.credential_file.as_deref(),
            &config.catalog.token_env_vars,
            env,
        );
        Self::with_token(config, token)
    }

    /// Creates a catalog client with a known token
    pub fn with_token(config: &DepotConfig, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("model-depot/", env!("CARGO_PKG_VERSION")))
            .timeout(config.catalog.request_timeout())
            .build()
            .map_err(|e| Error::Internal(format!("failed to build catalog client: {}", e)))?;

        info!(
            "Catalog at {} ({})",
            config.catalog.url,
            if token.is_some() { "authenticated" } else { "anonymous" }
        );

        Ok(Self {
            client,
            api_base: config.catalog.url.trim_end_matches('/').to_string(),
            resolve_base: config.resolve_base().to_string(),
            token,
            search_filter: config.catalog.search_filter.clone(),
        })
    }

    /// Token attached to catalog and file requests
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Download URL of one file of an artifact
    pub fn file_url(&self, id: &str, filename: &str) -> String {
        format!("{}/{}/resolve/main/{}", self.resolve_base, id, filename)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Resolves the downloadable files of `id`, in catalog order
    pub async fn resolve_manifest(&self, id: &str) -> Result<Manifest> {
        let url = format!("{}/api/models/{}", self.api_base, id);
        debug!("Resolving manifest of {} from {}", id, url);

        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| Error::RemoteManifest(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            let body = truncate_string(body.trim(), ERROR_BODY_LIMIT);

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(Error::AuthRequired(format!(
                    "catalog returned {} for {}: {}",
                    status.as_u16(),
                    id,
                    body
                )));
            }

            return Err(Error::RemoteManifest(format!(
                "catalog returned {} for {}: {}",
                status.as_u16(),
                id,
                body
            )));
        }

        let info: RepoInfo = response
            .json()
            .await
            .map_err(|e| Error::RemoteManifest(format!("invalid metadata for {}: {}", id, e)))?;

        let entries: Vec<ManifestEntry> = info
            .siblings
            .into_iter()
            .filter(|sibling| is_contained(&sibling.rfilename) && should_download(&sibling.rfilename))
            .map(|sibling| ManifestEntry {
                size: sibling.declared_size(),
                url: self.file_url(id, &sibling.rfilename),
                filename: sibling.rfilename,
            })
            .collect();

        if entries.is_empty() {
            return Err(Error::NoDownloadableFiles(id.to_string()));
        }

        let manifest = Manifest {
            artifact_id: id.to_string(),
            entries,
        };

        info!(
            "Manifest of {} lists {} files ({})",
            id,
            manifest.entries.len(),
            common::utils::format_bytes(manifest.total_size())
        );

        Ok(manifest)
    }

    /// Recommended artifact ids, no request involved
    pub fn popular() -> &'static [&'static str] {
        &POPULAR_ARTIFACTS
    }

    /// Searches the catalog, restricted to the configured tag filter
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<CatalogEntry>> {
        let url = format!("{}/api/models", self.api_base);
        let limit = limit.to_string();

        let mut params: Vec<(&str, &str)> = vec![("search", query)];
        if let Some(filter) = &self.search_filter {
            params.push(("filter", filter.as_str()));
        }
        params.push(("limit", limit.as_str()));

        let response = self
            .authorized(self.client.get(&url).query(&params))
            .send()
            .await
            .map_err(|e| Error::RemoteManifest(format!("search request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::RemoteManifest(format!(
                "search returned {}: {}",
                status.as_u16(),
                truncate_string(body.trim(), ERROR_BODY_LIMIT)
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::RemoteManifest(format!("invalid search response: {}", e)))
    }
}
