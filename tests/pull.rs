//! Pull behaviour against an in-process catalog and file host

mod support;

use axum::body::StreamBody;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use model_depot::{DownloadProgress, Error, ModelDepot, NullSink, ALREADY_EXISTS};
use support::{depot_config, payload, serve, write_artifact};

const ID: &str = "mlx-community/resumable";

#[derive(Clone, Default)]
struct Remote {
    requests: Arc<AtomicUsize>,
    manifests: Arc<AtomicUsize>,
    weight_ranges: Arc<Mutex<Vec<Option<String>>>>,
    /// Break the first weight transfer after this many bytes
    break_after: Option<usize>,
}

async fn manifest(State(remote): State<Remote>, UrlPath((owner, _name)): UrlPath<(String, String)>) -> Response {
    remote.requests.fetch_add(1, Ordering::SeqCst);
    remote.manifests.fetch_add(1, Ordering::SeqCst);

    if owner == "gated" {
        return (StatusCode::UNAUTHORIZED, "token required").into_response();
    }

    Json(json!({
        "siblings": [
            {"rfilename": "README.md", "size": 5},
            {"rfilename": "config.json", "size": 10},
            {"rfilename": "model.safetensors", "lfs": {"size": 1000}}
        ]
    }))
    .into_response()
}

async fn file(
    State(remote): State<Remote>,
    UrlPath((_owner, _name, file)): UrlPath<(String, String, String)>,
    headers: HeaderMap,
) -> Response {
    remote.requests.fetch_add(1, Ordering::SeqCst);

    match file.as_str() {
        "config.json" => (StatusCode::OK, b"{\"a\":\"bc\"}".to_vec()).into_response(),
        "model.safetensors" => {
            let range = headers
                .get(header::RANGE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let first_attempt = {
                let mut ranges = remote.weight_ranges.lock().unwrap();
                ranges.push(range.clone());
                ranges.len() == 1
            };

            let body = payload(1000);
            match range.as_deref().and_then(|r| r.strip_prefix("bytes=")) {
                Some(spec) => {
                    let start: usize = spec.trim_end_matches('-').parse().unwrap();
                    (
                        StatusCode::PARTIAL_CONTENT,
                        [(header::CONTENT_RANGE, format!("bytes {}-999/1000", start))],
                        body[start..].to_vec(),
                    )
                        .into_response()
                }
                None => match remote.break_after {
                    Some(cut) if first_attempt => {
                        let head = body[..cut].to_vec();
                        let stream = futures::stream::iter(vec![Ok::<_, std::io::Error>(head)]).chain(
                            futures::stream::once(async {
                                tokio::time::sleep(Duration::from_millis(100)).await;
                                Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "link dropped"))
                            }),
                        );
                        (
                            StatusCode::OK,
                            [(header::CONTENT_LENGTH, "1000".to_string())],
                            StreamBody::new(stream),
                        )
                            .into_response()
                    }
                    _ => (StatusCode::OK, body).into_response(),
                },
            }
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

fn remote_app(remote: Remote) -> Router {
    Router::new()
        .route("/api/models/:owner/:name", get(manifest))
        .route("/files/:owner/:name/resolve/main/:file", get(file))
        .with_state(remote)
}

#[tokio::test]
async fn test_interrupted_pull_resumes_from_partial_bytes() {
    let remote = Remote {
        break_after: Some(500),
        ..Default::default()
    };
    let url = serve(remote_app(remote.clone()));
    let root = tempfile::tempdir().unwrap();

    let first = ModelDepot::new(depot_config(root.path(), &url)).unwrap();
    let err = first
        .pull(ID, &NullSink, &CancellationToken::new())
        .await
        .unwrap_err();
    match &err {
        Error::Transfer { file, preserved_bytes, .. } => {
            assert_eq!(file, "model.safetensors");
            assert_eq!(*preserved_bytes, 500);
        }
        other => panic!("unexpected error {}", other),
    }
    assert!(!first.store().exists(ID));
    assert!(first.list().unwrap().is_empty());

    // A fresh depot stands in for the next invocation.
    let second = ModelDepot::new(depot_config(root.path(), &url)).unwrap();
    let events = Mutex::new(Vec::new());
    let sink = |p: DownloadProgress| events.lock().unwrap().push(p);
    let path = second.pull(ID, &sink, &CancellationToken::new()).await.unwrap();

    assert_eq!(
        *remote.weight_ranges.lock().unwrap(),
        vec![None, Some("bytes=500-".to_string())]
    );
    assert_eq!(std::fs::read(path.join("model.safetensors")).unwrap(), payload(1000));
    assert!(second.store().exists(ID));

    let events = events.into_inner().unwrap();
    let resumed = events
        .iter()
        .find(|e| e.filename == "model.safetensors")
        .unwrap();
    assert_eq!(resumed.completed, 500);
    assert_eq!(resumed.total, 1000);
    assert!(events.iter().any(|e| e.status == "success"));

    let listed = second.list().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, ID);
    assert_eq!(listed[0].size, 1010);
}

#[tokio::test]
async fn test_existing_artifact_makes_no_requests() {
    let remote = Remote::default();
    let url = serve(remote_app(remote.clone()));
    let root = tempfile::tempdir().unwrap();
    write_artifact(root.path(), "mlx-community_present");

    let depot = ModelDepot::new(depot_config(root.path(), &url)).unwrap();
    let statuses = Mutex::new(Vec::new());
    let sink = |p: DownloadProgress| statuses.lock().unwrap().push(p.status);

    depot
        .pull("mlx-community/present", &sink, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(remote.requests.load(Ordering::SeqCst), 0);
    assert_eq!(statuses.into_inner().unwrap(), vec![ALREADY_EXISTS.to_string()]);
}

#[tokio::test]
async fn test_concurrent_pulls_fetch_once() {
    let remote = Remote::default();
    let url = serve(remote_app(remote.clone()));
    let root = tempfile::tempdir().unwrap();
    let depot = ModelDepot::new(depot_config(root.path(), &url)).unwrap();
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(
        depot.pull(ID, &NullSink, &cancel),
        depot.pull(ID, &NullSink, &cancel)
    );

    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(remote.manifests.load(Ordering::SeqCst), 1);
    assert_eq!(remote.weight_ranges.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_gated_artifact_requires_auth() {
    let url = serve(remote_app(Remote::default()));
    let root = tempfile::tempdir().unwrap();
    let depot = ModelDepot::new(depot_config(root.path(), &url)).unwrap();

    let err = depot
        .pull("gated/model", &NullSink, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.is_auth_required(), "{}", err);
    assert!(depot.list().unwrap().is_empty());
}

#[tokio::test]
async fn test_show_and_delete() {
    let url = serve(remote_app(Remote::default()));
    let root = tempfile::tempdir().unwrap();
    let depot = ModelDepot::new(depot_config(root.path(), &url)).unwrap();

    depot.pull(ID, &NullSink, &CancellationToken::new()).await.unwrap();

    let shown = depot.show(ID).unwrap();
    assert_eq!(shown.name, ID);
    assert!(shown.digest.starts_with("sha256:"));
    assert_eq!(shown.details.format, "safetensors");

    depot.delete(ID).unwrap();
    assert!(depot.show(ID).unwrap_err().is_not_found());
    depot.delete(ID).unwrap();
}

#[tokio::test]
async fn test_invalid_id_is_rejected_before_any_request() {
    let remote = Remote::default();
    let url = serve(remote_app(remote.clone()));
    let root = tempfile::tempdir().unwrap();
    let depot = ModelDepot::new(depot_config(root.path(), &url)).unwrap();

    let err = depot
        .pull("..", &NullSink, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidArgument(_)), "{}", err);
    assert_eq!(remote.requests.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_popular_artifacts_need_no_catalog() {
    let remote = Remote::default();
    let url = serve(remote_app(remote.clone()));
    let root = tempfile::tempdir().unwrap();
    let depot = ModelDepot::new(depot_config(root.path(), &url)).unwrap();

    let popular = depot.popular();
    assert!(popular.contains(&"mlx-community/Llama-3.2-1B-Instruct-4bit"));
    assert!(popular.iter().all(|id| id.starts_with("mlx-community/")));
    assert_eq!(remote.requests.load(Ordering::SeqCst), 0);
}
