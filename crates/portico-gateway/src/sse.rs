//! Event-stream transport
//!
//! `GET /<svc>/sse` opens the push channel and announces the companion
//! request path in an `endpoint` event. `POST /<svc>/message` is acknowledged
//! with 202 straight away; the response is dispatched in the background and
//! pushed as a `message` event on whichever connection is current for the
//! session when dispatch completes.
//!
//! Known limitation: if no push connection exists within the delivery
//! timeout the request is dropped and the caller never gets a response.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{self, Stream, StreamExt};
use portico_core::HostedService;
use portico_mcp::{JsonRpcRequest, JsonRpcResponse, handle, should_reply};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::server::GatewayState;
use crate::session::{PushChannel, SessionRegistry, normalize_session_key};

/// Timing knobs for the event-stream transport
#[derive(Debug, Clone)]
pub struct SseSettings {
    pub keepalive: Duration,
    pub delivery_timeout: Duration,
    pub delivery_poll: Duration,
}

impl Default for SseSettings {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(30),
            delivery_timeout: Duration::from_secs(20),
            delivery_poll: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// Session key and companion endpoint for a service + optional client id.
/// Without a client id the session is the service name itself.
fn session_for(service: &str, query: &SessionQuery) -> Result<(String, String), GatewayError> {
    match query.session_id.as_deref() {
        None => Ok((service.to_string(), format!("/{}/message", service))),
        Some(raw) => {
            let id = normalize_session_key(raw).map_err(|e| GatewayError::BadRequest(e.to_string()))?;
            Ok((
                format!("{}:{}", service, id),
                format!("/{}/message?sessionId={}", service, id),
            ))
        }
    }
}

/// `GET /<svc>/sse`
pub async fn open_stream(
    State(state): State<GatewayState>,
    Path(service): Path<String>,
    Query(query): Query<SessionQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, GatewayError> {
    state.registry.resolve(&service)?;
    let (session_id, endpoint) = session_for(&service, &query)?;

    let channel = state.sessions.open(&session_id);
    debug!(
        "Event stream for '{}' announcing endpoint {}",
        session_id, endpoint
    );

    let first = stream::once(async move { Ok(Event::default().event("endpoint").data(endpoint)) });
    Ok(Sse::new(first.chain(message_events(channel)))
        .keep_alive(KeepAlive::new().interval(state.sse.keepalive).text("keepalive")))
}

/// Message events until the channel is replaced or its senders go away
fn message_events(channel: PushChannel) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(channel, |mut channel| async move {
        let next = tokio::select! {
            biased;
            _ = channel.closed.cancelled() => None,
            msg = channel.rx.recv() => msg,
        };
        next.map(|json| (Ok(Event::default().event("message").data(json)), channel))
    })
}

/// `POST /<svc>/message`
pub async fn post_message(
    State(state): State<GatewayState>,
    Path(service): Path<String>,
    Query(query): Query<SessionQuery>,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let hosted = state.registry.resolve(&service)?;
    let (session_id, _) = session_for(&service, &query)?;

    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            warn!("Invalid JSON-RPC message for '{}': {}", session_id, e);
            let resp = JsonRpcResponse::parse_error(e);
            return Ok((StatusCode::BAD_REQUEST, axum::Json(resp)).into_response());
        }
    };

    tokio::spawn(deliver(
        state.sessions.clone(),
        state.sse.clone(),
        hosted,
        session_id,
        request,
    ));

    Ok((StatusCode::ACCEPTED, "Accepted").into_response())
}

/// Wait for a push connection, dispatch, then push the response to the
/// connection current at completion time
pub async fn deliver(
    sessions: std::sync::Arc<SessionRegistry>,
    settings: SseSettings,
    service: HostedService,
    session_id: String,
    request: JsonRpcRequest,
) {
    let method = request.method.clone();
    if !sessions
        .wait_for_connection(&session_id, settings.delivery_timeout, settings.delivery_poll)
        .await
    {
        warn!(
            "No event stream for session '{}' after {:?}; dropping {} request",
            session_id, settings.delivery_timeout, method
        );
        return;
    }

    let reply = should_reply(&request);
    let response = handle(&service, request).await;
    if !reply {
        return;
    }

    if !sessions.send(&session_id, response.to_json_string()) {
        warn!(
            "Event stream for session '{}' closed before {} response could be delivered",
            session_id, method
        );
    }
}
