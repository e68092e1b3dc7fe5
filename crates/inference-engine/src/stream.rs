//! Completion stream relay
//!
//! This module forwards a worker's newline-delimited completion chunks to the
//! caller. A relay task owns the [`RunnerHandle`] for the lifetime of the
//! stream and hands chunks over a capacity-1 channel, so reads from the
//! worker advance only as fast as the consumer pulls. When the stream ends
//! for any reason the task shuts the worker down.

use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::error::{Error, Result};
use common::models::{CompletionChunk, CompletionRequest};
use common::utils::truncate_string;

use crate::state::RunnerState;
use crate::supervisor::RunnerHandle;

/// How a relay ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayEnd {
    /// The worker sent its done chunk
    Done,
    /// The caller cancelled
    Cancelled,
    /// The consumer dropped the stream
    Detached,
}

/// Stream of completion chunks from one worker
///
/// Yields `Ok` chunks up to and including the `done` chunk. A failure is
/// delivered as a single trailing `Err`.
pub struct GenerationStream {
    chunks: ReceiverStream<Result<CompletionChunk>>,
    state: watch::Receiver<RunnerState>,
}

impl GenerationStream {
    /// Current state of the worker behind the stream
    pub fn state(&self) -> RunnerState {
        self.state.borrow().clone()
    }

    /// Waits until the worker reaches a terminal state and returns it
    pub async fn finished(&mut self) -> RunnerState {
        loop {
            let current = self.state.borrow().clone();
            if current.is_terminal() {
                return current;
            }
            if self.state.changed().await.is_err() {
                return self.state.borrow().clone();
            }
        }
    }

    /// Converts a trailing error into a final `done` chunk carrying the error
    pub fn into_chunks(self) -> impl Stream<Item = CompletionChunk> + Send + Unpin {
        self.map(|item| item.unwrap_or_else(|e| CompletionChunk::failure(e.to_string())))
    }
}

impl Stream for GenerationStream {
    type Item = Result<CompletionChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.chunks).poll_next(cx)
    }
}

impl RunnerHandle {
    /// Sends `request` to the worker and relays the response
    ///
    /// The handle moves into the relay task; the worker is stopped once the
    /// stream completes, fails, is cancelled or is dropped.
    pub fn stream(self, request: CompletionRequest, cancel: CancellationToken) -> GenerationStream {
        let (tx, rx) = mpsc::channel(1);
        let state = self.subscribe();

        tokio::spawn(relay(self, request, tx, cancel));

        GenerationStream {
            chunks: ReceiverStream::new(rx),
            state,
        }
    }
}

async fn relay(
    mut handle: RunnerHandle,
    request: CompletionRequest,
    tx: mpsc::Sender<Result<CompletionChunk>>,
    cancel: CancellationToken,
) {
    handle.transition(RunnerState::Streaming);

    let outcome = pump(&mut handle, &request, &tx, &cancel).await;

    let trailing = match outcome {
        Ok(RelayEnd::Done) => {
            info!("Completion for {} finished", handle.artifact_id);
            handle.transition(RunnerState::Ready);
            None
        }
        Ok(RelayEnd::Cancelled) => {
            info!("Completion for {} cancelled", handle.artifact_id);
            Some(Error::Cancelled("generation cancelled".to_string()))
        }
        Ok(RelayEnd::Detached) => {
            debug!("Consumer of {} went away", handle.artifact_id);
            None
        }
        Err(e) => {
            warn!("Completion for {} failed: {}", handle.artifact_id, e);
            handle.fail(e.to_string());
            Some(e)
        }
    };

    if let Err(e) = handle.shutdown().await {
        warn!("Failed to stop worker for {}: {}", handle.artifact_id, e);
    }

    if let Some(e) = trailing {
        let _ = tx.send(Err(e)).await;
    }
}

async fn pump(
    handle: &mut RunnerHandle,
    request: &CompletionRequest,
    tx: &mpsc::Sender<Result<CompletionChunk>>,
    cancel: &CancellationToken,
) -> Result<RelayEnd> {
    let url = format!("{}/completion", handle.base_url);
    let send = handle
        .client
        .post(&url)
        .query(&[("model", request.model.as_str())])
        .json(request)
        .send();

    let worker = &mut handle.worker;

    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(RelayEnd::Cancelled),
        _ = tx.closed() => return Ok(RelayEnd::Detached),
        status = worker.wait() => {
            return Err(Error::BackendFailure(format!("worker exited ({})", status)));
        }
        response = send => response
            .map_err(|e| Error::BackendFailure(format!("completion request failed: {}", e)))?,
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::BackendFailure(format!(
            "worker returned {}: {}",
            status.as_u16(),
            truncate_string(body.trim(), 512)
        )));
    }

    let body = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
    let mut lines = FramedRead::new(StreamReader::new(body), LinesCodec::new());

    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(RelayEnd::Cancelled),
            _ = tx.closed() => return Ok(RelayEnd::Detached),
            line = lines.next() => line,
            status = worker.wait() => {
                return Err(Error::BackendFailure(format!("worker exited mid-stream ({})", status)));
            }
        };

        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                return Err(Error::BackendFailure(format!("reading completion stream failed: {}", e)));
            }
            None => {
                return Err(Error::BackendFailure(
                    "completion stream ended without a done chunk".to_string(),
                ));
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let chunk: CompletionChunk = serde_json::from_str(line).map_err(|e| {
            Error::BackendFailure(format!(
                "invalid completion line {:?}: {}",
                truncate_string(line, 128),
                e
            ))
        })?;
        let done = chunk.done;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(RelayEnd::Cancelled),
            sent = tx.send(Ok(chunk)) => {
                if sent.is_err() {
                    return Ok(RelayEnd::Detached);
                }
            }
        }

        if done {
            return Ok(RelayEnd::Done);
        }
    }
}
