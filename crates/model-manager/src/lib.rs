//! Artifact management for Model Depot
//!
//! This crate provides the local artifact store, the remote catalog client
//! and the resumable downloader that moves catalog files into the store.

pub mod catalog;
pub mod credentials;
pub mod downloader;
pub mod metadata;
pub mod store;

// Re-export commonly used types
pub use catalog::RemoteCatalog;
pub use downloader::{Downloader, NullSink, ProgressSink};
pub use store::ArtifactStore;
