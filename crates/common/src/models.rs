//! Common data models for Model Depot
//!
//! This module defines the records exchanged between the store, the catalog,
//! the downloader and the runner supervisor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A locally cached, usable artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Display identifier (e.g. `mlx-community/Llama-3.2-1B-Instruct-4bit`)
    pub name: String,
    /// Local directory holding the artifact files
    #[serde(skip)]
    pub local_path: PathBuf,
    /// Sum of all contained file sizes in bytes
    pub size: u64,
    /// Name/size fingerprint, `sha256:<hex>`
    pub digest: String,
    /// Modification time of the artifact directory
    pub modified_at: DateTime<Utc>,
    /// Details parsed from the descriptor file
    pub details: ArtifactDetails,
}

/// Optional metadata read from an artifact's `config.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDetails {
    /// Storage format of the weights
    pub format: String,
    /// Architecture family, e.g. `LlamaForCausalLM`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    /// Human readable parameter size, e.g. `1.5B`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter_size: Option<String>,
    /// Quantization level, e.g. `Q4`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantization_level: Option<String>,
}

/// One downloadable file reported by the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// File name relative to the artifact root
    pub filename: String,
    /// Declared size in bytes, 0 when the catalog did not report one
    pub size: u64,
    /// Absolute URL the file is fetched from
    pub url: String,
}

/// Ordered list of files making up one artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Artifact identifier the manifest was resolved for
    pub artifact_id: String,
    /// Files in download order
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Sum of the declared sizes
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Returns true if the manifest has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Progress event emitted while pulling an artifact
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    /// File currently being transferred, empty for artifact-level events
    pub filename: String,
    /// Bytes of `filename` on disk so far
    pub completed: u64,
    /// Total bytes of `filename`, 0 while unknown
    pub total: u64,
    /// Status line, e.g. `pulling config.json` or `success`
    pub status: String,
}

impl DownloadProgress {
    /// Progress for a single file
    pub fn file(filename: &str, completed: u64, total: u64) -> Self {
        Self {
            filename: filename.to_string(),
            completed,
            total,
            status: format!("pulling {}", filename),
        }
    }

    /// Artifact-level status without byte counts
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            ..Default::default()
        }
    }
}

/// Catalog search hit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Repository identifier
    #[serde(rename = "modelId", alias = "id", default)]
    pub model_id: String,
    /// Publishing namespace
    #[serde(default)]
    pub author: Option<String>,
    /// Download counter as reported by the catalog
    #[serde(default)]
    pub downloads: u64,
    /// Repository tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Last modification timestamp, verbatim
    #[serde(rename = "lastModified", default)]
    pub last_modified: Option<String>,
}

/// Generation request forwarded to a worker's `/completion` endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Target artifact identifier
    pub model: String,
    /// Already formatted prompt
    pub prompt: String,
    /// Sampling and other worker options, passed through untouched
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl CompletionRequest {
    /// Creates a request without extra options
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            options: serde_json::Map::new(),
        }
    }
}

/// One newline-delimited object of a completion stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionChunk {
    /// Incremental generated text
    #[serde(default)]
    pub content: String,
    /// Set on the final chunk only
    #[serde(default)]
    pub done: bool,
    /// Why generation stopped (`stop`, `length`, `error`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_reason: Option<String>,
    /// Artifact identifier echoed by the worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Failure description on a terminal error chunk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CompletionChunk {
    /// Terminal chunk describing a failure
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            content: String::new(),
            done: true,
            done_reason: Some("error".to_string()),
            model: None,
            error: Some(message.into()),
        }
    }

    /// Returns true if this chunk reports a failure
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_parses_minimal_done_line() {
        let chunk: CompletionChunk = serde_json::from_str(r#"{"done":true}"#).unwrap();
        assert!(chunk.done);
        assert!(chunk.content.is_empty());
        assert!(!chunk.is_error());
    }

    #[test]
    fn test_request_flattens_options() {
        let mut req = CompletionRequest::new("mlx-community/tiny", "Hello");
        req.options.insert("temperature".to_string(), serde_json::json!(0.2));

        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["model"], "mlx-community/tiny");
        assert_eq!(value["prompt"], "Hello");
        assert_eq!(value["temperature"], 0.2);
    }

    #[test]
    fn test_failure_chunk_is_terminal() {
        let chunk = CompletionChunk::failure("worker returned 500");
        assert!(chunk.done);
        assert_eq!(chunk.done_reason.as_deref(), Some("error"));
        assert!(chunk.is_error());
    }
}
