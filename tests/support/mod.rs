//! Shared fixtures for the integration tests
//!
//! Remote collaborators (catalog, file host, worker) are axum servers bound to
//! ephemeral loopback ports inside the test process. Workers come from the
//! `testing` feature of `inference-engine`.

#![allow(dead_code)]

use axum::Router;
use std::net::TcpListener;
use std::path::Path;

use model_depot::DepotConfig;

pub use inference_engine::testing::StubLauncher;

/// Serves `app` on an ephemeral port and returns its base URL
pub fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(axum::Server::from_tcp(listener).unwrap().serve(app.into_make_service()));
    format!("http://{}", addr)
}

/// Configuration isolated from the user's environment
///
/// The catalog lives at `catalog_url`, files are resolved under
/// `<catalog_url>/files`, and no credentials are picked up.
pub fn depot_config(root: &Path, catalog_url: &str) -> DepotConfig {
    let mut config = DepotConfig::default();
    config.storage_root = root.to_path_buf();
    config.catalog.url = catalog_url.to_string();
    config.catalog.resolve_url = Some(format!("{}/files", catalog_url));
    config.catalog.credential_file = None;
    config.catalog.token_env_vars = Vec::new();
    config.runner.health_interval_ms = 20;
    config.runner.health_timeout_ms = 2_000;
    config.runner.shutdown_grace_ms = 200;
    config
}

/// Writes a minimal usable artifact for `local_name` under `root`
pub fn write_artifact(root: &Path, local_name: &str) {
    let dir = root.join(local_name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("config.json"), br#"{"architectures":["LlamaForCausalLM"]}"#).unwrap();
    std::fs::write(dir.join("model.safetensors"), vec![0u8; 128]).unwrap();
}

/// Deterministic file contents
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
