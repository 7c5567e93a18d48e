//! Bidirectional streaming transport (`POST /<svc>`)
//!
//! The request body is a stream of newline-delimited JSON-RPC requests; the
//! response body streams one newline-delimited response per request, written
//! as soon as that request finishes. Requests on the same connection do not
//! wait for each other.

use std::convert::Infallible;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::Response;
use futures_util::StreamExt;
use futures_util::stream;
use portico_core::HostedService;
use portico_mcp::{JsonRpcRequest, JsonRpcResponse, handle, should_reply};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::server::GatewayState;

/// Splits a byte stream into complete lines, keeping any trailing fragment
/// for the next chunk
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every complete, non-blank line it finished
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(text) = Self::clean(&line) {
                lines.push(text);
            }
        }
        lines
    }

    /// Whatever is left once the input has ended, if it is not blank
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        Self::clean(&rest)
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    fn clean(raw: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(raw);
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

/// `POST /<svc>`
pub async fn open_stream(
    State(state): State<GatewayState>,
    Path(service): Path<String>,
    body: Body,
) -> Result<Response, GatewayError> {
    let hosted = state.registry.resolve(&service)?;
    debug!("Streaming connection opened for '{}'", service);

    let (tx, rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(read_requests(hosted, body, tx));

    let out = stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|line| (Ok::<_, Infallible>(Bytes::from(line + "\n")), rx))
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(out))
        .map_err(|e| GatewayError::BadRequest(e.to_string()))
}

/// Read the request body, dispatching each complete line independently.
/// The response stream ends once the body has ended and every dispatched
/// request has answered (all senders dropped).
async fn read_requests(service: HostedService, body: Body, tx: mpsc::UnboundedSender<String>) {
    let mut framer = LineFramer::new();
    let mut data = body.into_data_stream();

    while let Some(chunk) = data.next().await {
        match chunk {
            Ok(bytes) => {
                for line in framer.push(&bytes) {
                    dispatch_line(&service, line, &tx);
                }
            }
            Err(e) => {
                debug!("Streaming request body ended with error: {}", e);
                return;
            }
        }
        if tx.is_closed() {
            debug!("Streaming client went away");
            return;
        }
    }

    if let Some(line) = framer.finish() {
        dispatch_line(&service, line, &tx);
    }
}

fn dispatch_line(service: &HostedService, line: String, tx: &mpsc::UnboundedSender<String>) {
    let request: JsonRpcRequest = match serde_json::from_str(&line) {
        Ok(r) => r,
        Err(e) => {
            warn!("Invalid JSON-RPC line on stream: {}", e);
            let _ = tx.send(JsonRpcResponse::parse_error(e).to_json_string());
            return;
        }
    };

    let service = service.clone();
    let tx = tx.clone();
    tokio::spawn(async move {
        let reply = should_reply(&request);
        let response = handle(&service, request).await;
        if reply {
            let _ = tx.send(response.to_json_string());
        }
    });
}
