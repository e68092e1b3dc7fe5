//! Artifact store implementation
//!
//! This module maps artifact identifiers to directories under the storage
//! root, decides which directories hold a usable artifact, and computes the
//! size and lightweight digest shown in listings.
//!
//! Downloads never write into an artifact's final directory. They fill a
//! staging directory under `.partial/` which is renamed into place once every
//! file is present, so `exists` never sees a half-written artifact.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use common::error::{Error, Result};
use common::models::Artifact;

use crate::metadata::{self, DESCRIPTOR_FILE};

/// Filler that replaces path separators in directory names
const SEPARATOR_FILLER: char = '_';

/// Staging area for downloads in progress
pub const STAGING_DIR: &str = ".partial";

/// Subdirectories of the root that never hold artifacts
pub const RESERVED_DIRS: [&str; 5] = ["blobs", "manifests", "mlx", "ollama", STAGING_DIR];

/// Namespaces whose first filler is restored to `/` for display
pub const KNOWN_NAMESPACES: [&str; 7] = [
    "mlx-community",
    "huggingface",
    "meta-llama",
    "mistralai",
    "Qwen",
    "google",
    "microsoft",
];

/// Recognised weight layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightLayout {
    /// Single consolidated `model.safetensors`
    Consolidated,
    /// Sharded safetensors described by `model.safetensors.index.json`
    Sharded,
    /// NumPy archive `weights.npz`
    Npz,
}

impl WeightLayout {
    /// File whose presence identifies the layout
    pub fn marker(&self) -> &'static str {
        match self {
            WeightLayout::Consolidated => "model.safetensors",
            WeightLayout::Sharded => "model.safetensors.index.json",
            WeightLayout::Npz => "weights.npz",
        }
    }

    /// Format label used in artifact details
    pub fn format(&self) -> &'static str {
        match self {
            WeightLayout::Consolidated | WeightLayout::Sharded => "safetensors",
            WeightLayout::Npz => "npz",
        }
    }

    /// Detects the layout of `dir`, if any
    pub fn detect(dir: &Path) -> Option<Self> {
        [WeightLayout::Consolidated, WeightLayout::Sharded, WeightLayout::Npz]
            .into_iter()
            .find(|layout| dir.join(layout.marker()).is_file())
    }
}

/// Local artifact store rooted at one directory
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    /// Storage root
    root: PathBuf,
}

impl ArtifactStore {
    /// Creates a store rooted at `root`, creating the directory if missing
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        info!("Artifact store rooted at {:?}", root);
        Ok(Self { root })
    }

    /// Storage root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory name for an identifier
    pub fn local_name(id: &str) -> Result<String> {
        let name: String = id
            .trim()
            .chars()
            .map(|c| if c == '/' || c == '\\' { SEPARATOR_FILLER } else { c })
            .collect();

        if name.is_empty() || name == "." || name == ".." {
            return Err(Error::InvalidArgument(format!("invalid artifact id {:?}", id)));
        }
        if RESERVED_DIRS.contains(&name.as_str()) {
            return Err(Error::InvalidArgument(format!("artifact id {:?} uses a reserved name", id)));
        }

        Ok(name)
    }

    /// Display identifier for a directory name
    ///
    /// Only ids under [`KNOWN_NAMESPACES`] come back with their `/`; any other
    /// name is returned unchanged, since which filler was a separator cannot
    /// be recovered.
    pub fn display_name(local_name: &str) -> String {
        for namespace in KNOWN_NAMESPACES {
            if let Some(rest) = local_name
                .strip_prefix(namespace)
                .and_then(|rest| rest.strip_prefix(SEPARATOR_FILLER))
            {
                return format!("{}/{}", namespace, rest);
            }
        }
        local_name.to_string()
    }

    /// Local directory for an identifier
    pub fn path_for(&self, id: &str) -> Result<PathBuf> {
        Ok(self.root.join(Self::local_name(id)?))
    }

    /// Staging directory a download of `id` writes into
    pub fn staging_path_for(&self, id: &str) -> Result<PathBuf> {
        Ok(self.root.join(STAGING_DIR).join(Self::local_name(id)?))
    }

    /// Returns true if `id` has a descriptor and a recognised weight layout
    pub fn exists(&self, id: &str) -> bool {
        match self.path_for(id) {
            Ok(dir) => Self::is_complete(&dir),
            Err(_) => false,
        }
    }

    fn is_complete(dir: &Path) -> bool {
        dir.join(DESCRIPTOR_FILE).is_file() && WeightLayout::detect(dir).is_some()
    }

    /// Lists every usable artifact under the root
    pub fn list(&self) -> Result<Vec<Artifact>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut artifacts = Vec::new();

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }

            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                warn!("Skipping non UTF-8 directory {:?}", entry.path());
                continue;
            };

            if RESERVED_DIRS.contains(&name.as_str()) {
                continue;
            }

            if !Self::is_complete(&entry.path()) {
                debug!("Skipping incomplete artifact directory {}", name);
                continue;
            }

            match self.describe(&name, entry.path()) {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => warn!("Skipping artifact {}: {}", name, e),
            }
        }

        artifacts.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(artifacts)
    }

    /// Full record for a single artifact
    pub fn info(&self, id: &str) -> Result<Artifact> {
        let dir = self.path_for(id)?;
        if !Self::is_complete(&dir) {
            return Err(Error::NotFound(format!("artifact {} is not in the local store", id)));
        }
        let name = Self::local_name(id)?;
        self.describe(&name, dir)
    }

    fn describe(&self, local_name: &str, dir: PathBuf) -> Result<Artifact> {
        let modified_at: DateTime<Utc> = std::fs::metadata(&dir)?.modified()?.into();
        let format = WeightLayout::detect(&dir)
            .map(|layout| layout.format())
            .unwrap_or_default();

        Ok(Artifact {
            name: Self::display_name(local_name),
            size: dir_size(&dir)?,
            digest: compute_digest(&dir)?,
            modified_at,
            details: metadata::read_details(&dir, format),
            local_path: dir,
        })
    }

    /// Name/size fingerprint of an artifact
    pub fn digest(&self, id: &str) -> Result<String> {
        compute_digest(&self.path_for(id)?)
    }

    /// Sum of file sizes of an artifact
    pub fn size(&self, id: &str) -> Result<u64> {
        dir_size(&self.path_for(id)?)
    }

    /// Removes an artifact; deleting something absent is not an error
    pub fn delete(&self, id: &str) -> Result<()> {
        let dir = self.path_for(id)?;
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!("Deleted artifact {} at {:?}", id, dir);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Moves a fully downloaded staging directory into place
    ///
    /// A leftover directory at the final path (from an older, incomplete
    /// layout) is replaced.
    pub fn commit_staged(&self, id: &str) -> Result<PathBuf> {
        let staging = self.staging_path_for(id)?;
        let target = self.path_for(id)?;

        if !Self::is_complete(&staging) {
            return Err(Error::Internal(format!(
                "staged download of {} is missing its descriptor or weights",
                id
            )));
        }

        if target.exists() {
            warn!("Replacing unusable directory {:?}", target);
            std::fs::remove_dir_all(&target)?;
        }

        std::fs::rename(&staging, &target)?;
        info!("Committed artifact {} to {:?}", id, target);

        Ok(target)
    }

    /// Removes the staging directory of `id`
    pub fn discard_staged(&self, id: &str) -> Result<()> {
        let staging = self.staging_path_for(id)?;
        match std::fs::remove_dir_all(&staging) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Folds `(relative path, size)` of every file under `root` into SHA-256
///
/// Contents are not read, so two payloads with identical names and sizes
/// share a digest.
pub fn compute_digest(root: &Path) -> Result<String> {
    let mut hasher = Sha256::new();

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(walk_error)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| Error::Internal(e.to_string()))?;
        let size = entry.metadata().map_err(walk_error)?.len();
        let rel = rel.to_string_lossy().replace('\\', "/");
        hasher.update(format!("{}:{}\n", rel, size).as_bytes());
    }

    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Total size of all files under `root`
pub fn dir_size(root: &Path) -> Result<u64> {
    let mut size = 0;
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(walk_error)?;
        if entry.file_type().is_file() {
            size += entry.metadata().map_err(walk_error)?.len();
        }
    }
    Ok(size)
}

fn walk_error(e: walkdir::Error) -> Error {
    match e.into_io_error() {
        Some(io) => Error::Io(io),
        None => Error::Internal("filesystem loop while walking artifact".to_string()),
    }
}
