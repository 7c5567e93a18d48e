//! Tunnel client — outbound WebSocket to the relay
//!
//! Registers a public server name, keeps one socket open to the relay with
//! a fixed-delay reconnect loop, and forwards relayed requests to the local
//! gateway. Event-stream requests are forwarded chunk by chunk and can be
//! cancelled by the relay; everything else gets one buffered response.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::error::{RelayError, TunnelError};
use crate::log::{ConnectionLog, LogEntry};
use crate::protocol::{TunnelFrame, body_bytes, flatten_value};
use crate::relay::{RegisterRequest, RelayApi};

/// Hop-by-hop and length headers never copied across the tunnel
const SKIPPED_HEADERS: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "upgrade",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
];

/// First path segment of the gateway's administration routes
const ADMIN_SEGMENT: &str = "admin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Idle,
    Registering,
    Connecting,
    Connected,
    ReconnectWait,
    Stopped,
}

/// Source of server names for interactive registration
#[async_trait]
pub trait NamePrompt: Send + Sync {
    /// Ask for a name. `taken` is the name the relay just refused, if any.
    async fn prompt_name(&self, taken: Option<&str>) -> Result<String, TunnelError>;
}

/// Reads names from the terminal
pub struct StdinPrompt;

#[async_trait]
impl NamePrompt for StdinPrompt {
    async fn prompt_name(&self, taken: Option<&str>) -> Result<String, TunnelError> {
        if let Some(name) = taken {
            eprintln!("The name '{}' is already registered by someone else.", name);
        }
        tokio::task::spawn_blocking(|| {
            use std::io::Write;
            eprint!("Public server name: ");
            let _ = std::io::stderr().flush();
            let mut line = String::new();
            std::io::stdin()
                .read_line(&mut line)
                .map_err(|e| TunnelError::Prompt(e.to_string()))?;
            let name = line.trim().to_string();
            if name.is_empty() {
                return Err(TunnelError::Prompt("no name entered".to_string()));
            }
            Ok(name)
        })
        .await
        .map_err(|e| TunnelError::Prompt(e.to_string()))?
    }
}

/// How `start()` obtains a registered name
#[derive(Clone)]
pub enum Registration {
    /// Register the preset name once; failure is fatal
    Register,
    /// The name is already registered elsewhere
    Skip,
    /// Prompt for names until one registers (only when no name is preset)
    Interactive(Arc<dyn NamePrompt>),
}

#[derive(Clone)]
pub struct TunnelOptions {
    pub name: Option<String>,
    pub local_url: String,
    pub relay_ws_url: String,
    pub relay_api_url: String,
    pub description: String,
    pub owner_email: Option<String>,
    pub reconnect_delay: Duration,
    pub registration: Registration,
}

impl TunnelOptions {
    pub fn new(local_url: &str, relay_ws_url: &str, relay_api_url: &str) -> Self {
        Self {
            name: None,
            local_url: local_url.trim_end_matches('/').to_string(),
            relay_ws_url: relay_ws_url.to_string(),
            relay_api_url: relay_api_url.to_string(),
            description: String::new(),
            owner_email: None,
            reconnect_delay: Duration::from_secs(5),
            registration: Registration::Register,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_registration(mut self, registration: Registration) -> Self {
        self.registration = registration;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_owner_email(mut self, owner_email: Option<String>) -> Self {
        self.owner_email = owner_email;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Registration body for a name; the connection URL is the tunnel
    /// endpoint this client will open
    pub fn registration_request(&self, name: &str) -> RegisterRequest {
        let connection_url = tunnel_url(&self.relay_ws_url, name)
            .map(String::from)
            .unwrap_or_else(|_| self.relay_ws_url.clone());
        RegisterRequest::new(name, &connection_url, &self.description, self.owner_email.clone())
    }
}

/// The relay's tunnel endpoint for a server name
pub fn tunnel_url(relay_ws_url: &str, name: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(relay_ws_url)?;
    url.query_pairs_mut().append_pair("name", name);
    Ok(url)
}

#[derive(Debug, Clone, Serialize)]
pub struct TunnelStatus {
    pub name: Option<String>,
    pub state: TunnelState,
    pub tunnel_id: Option<String>,
    pub public_url: Option<String>,
    pub last_error: Option<String>,
    pub active_streams: usize,
}

#[derive(Debug, Clone)]
struct Snapshot {
    state: TunnelState,
    name: Option<String>,
    tunnel_id: Option<String>,
    public_url: Option<String>,
    last_error: Option<String>,
}

/// A relayed request bound for the local gateway
#[derive(Debug, Clone)]
struct LocalRequest {
    request_id: String,
    method: String,
    path: String,
    headers: BTreeMap<String, Value>,
    query_params: Option<BTreeMap<String, Value>>,
    body: Option<Value>,
}

impl LocalRequest {
    fn is_streaming(&self) -> bool {
        is_stream_request(&self.method, &self.path)
    }
}

/// Whether a relayed path resolves to the gateway's administration routes.
/// Dot segments and percent-encoded dots are resolved first; a path that
/// does not parse is treated as administrative.
pub fn targets_admin(path: &str) -> bool {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    match Url::parse(&format!("http://gateway/{}", path.trim_start_matches('/'))) {
        Ok(url) => {
            let path = url.path().trim_start_matches('/');
            path == ADMIN_SEGMENT
                || path
                    .strip_prefix(ADMIN_SEGMENT)
                    .is_some_and(|rest| rest.starts_with('/'))
        }
        Err(_) => true,
    }
}

/// A frame queued for the socket. Stream frames carry their stream's token
/// and are dropped unsent once it is cancelled.
struct Outbound {
    frame: TunnelFrame,
    stream: Option<CancellationToken>,
}

impl Outbound {
    fn for_stream(frame: TunnelFrame, token: &CancellationToken) -> Self {
        Self {
            frame,
            stream: Some(token.clone()),
        }
    }

    fn is_stale(&self) -> bool {
        self.stream.as_ref().is_some_and(|t| t.is_cancelled())
    }
}

impl From<TunnelFrame> for Outbound {
    fn from(frame: TunnelFrame) -> Self {
        Self {
            frame,
            stream: None,
        }
    }
}

type FrameSender = mpsc::UnboundedSender<Outbound>;

/// GET requests for an event-stream endpoint are forwarded chunk by chunk
pub fn is_stream_request(method: &str, path: &str) -> bool {
    let path = path.split('?').next().unwrap_or_default();
    method.eq_ignore_ascii_case("GET") && path.trim_end_matches('/').ends_with("/sse")
}

struct Inner {
    options: TunnelOptions,
    snapshot: Mutex<Snapshot>,
    log: ConnectionLog,
    relay: RelayApi,
    http: reqwest::Client,
    started: AtomicBool,
    connecting: AtomicBool,
    stop: CancellationToken,
    streams: DashMap<String, (u64, CancellationToken)>,
    stream_seq: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one tunnel; clones share the same connection
#[derive(Clone)]
pub struct TunnelClient {
    inner: Arc<Inner>,
}

impl TunnelClient {
    pub fn new(options: TunnelOptions) -> Self {
        let relay = RelayApi::new(&options.relay_api_url);
        Self {
            inner: Arc::new(Inner {
                snapshot: Mutex::new(Snapshot {
                    state: TunnelState::Idle,
                    name: options.name.clone(),
                    tunnel_id: None,
                    public_url: None,
                    last_error: None,
                }),
                options,
                log: ConnectionLog::new(),
                relay,
                http: reqwest::Client::new(),
                started: AtomicBool::new(false),
                connecting: AtomicBool::new(false),
                stop: CancellationToken::new(),
                streams: DashMap::new(),
                stream_seq: AtomicU64::new(0),
                task: Mutex::new(None),
            }),
        }
    }

    /// Register (per the configured [`Registration`]) and spawn the
    /// connection loop. Returns once the name is settled; connecting
    /// happens in the background.
    pub async fn start(&self) -> Result<(), TunnelError> {
        if self.inner.stop.is_cancelled() {
            return Err(TunnelError::Stopped);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(TunnelError::AlreadyRunning);
        }

        let name = match self.inner.register().await {
            Ok(name) => name,
            Err(e) => {
                self.inner.fail(format!("Registration failed: {}", e));
                self.inner.set_state(TunnelState::Idle);
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        self.inner.update(|s| s.name = Some(name));

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.run().await });
        *lock(&self.inner.task) = Some(handle);
        Ok(())
    }

    /// Disable reconnection and close the socket. Safe to call repeatedly.
    pub async fn stop(&self) {
        if !self.inner.stop.is_cancelled() {
            self.inner.log.info("Stopping tunnel client");
            self.inner.stop.cancel();
        }
        let handle = lock(&self.inner.task).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.inner.set_state(TunnelState::Stopped);
    }

    pub fn name(&self) -> Option<String> {
        self.inner.read(|s| s.name.clone())
    }

    pub fn state(&self) -> TunnelState {
        self.inner.read(|s| s.state)
    }

    /// Connected and holding a public URL
    pub fn is_connected(&self) -> bool {
        self.inner
            .read(|s| s.state == TunnelState::Connected && s.public_url.is_some())
    }

    pub fn tunnel_id(&self) -> Option<String> {
        self.inner.read(|s| s.tunnel_id.clone())
    }

    pub fn public_url(&self) -> Option<String> {
        self.inner.read(|s| s.public_url.clone())
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.read(|s| s.last_error.clone())
    }

    pub fn active_streams(&self) -> usize {
        self.inner.streams.len()
    }

    pub fn connection_log(&self) -> Vec<LogEntry> {
        self.inner.log.entries()
    }

    pub fn status(&self) -> TunnelStatus {
        let snapshot = self.inner.read(|s| s.clone());
        TunnelStatus {
            name: snapshot.name,
            state: snapshot.state,
            tunnel_id: snapshot.tunnel_id,
            public_url: snapshot.public_url,
            last_error: snapshot.last_error,
            active_streams: self.active_streams(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn read<R>(&self, f: impl FnOnce(&Snapshot) -> R) -> R {
        f(&lock(&self.snapshot))
    }

    fn update(&self, f: impl FnOnce(&mut Snapshot)) {
        f(&mut lock(&self.snapshot));
    }

    fn set_state(&self, state: TunnelState) {
        self.update(|s| s.state = state);
    }

    fn fail(&self, message: String) {
        self.log.error(message.clone());
        self.update(|s| s.last_error = Some(message));
    }

    async fn register(&self) -> Result<String, TunnelError> {
        match (&self.options.registration, self.options.name.clone()) {
            (Registration::Skip, Some(name)) => {
                self.log.info(format!("Using pre-registered name '{}'", name));
                Ok(name)
            }
            (Registration::Interactive(prompt), None) => {
                self.register_interactive(prompt.as_ref()).await
            }
            (_, Some(name)) => {
                self.set_state(TunnelState::Registering);
                self.relay
                    .register(&self.options.registration_request(&name))
                    .await?;
                self.log.info(format!("Registered '{}' with relay", name));
                Ok(name)
            }
            (_, None) => Err(RelayError::Validation("A server name is required".to_string()).into()),
        }
    }

    async fn register_interactive(&self, prompt: &dyn NamePrompt) -> Result<String, TunnelError> {
        let mut taken: Option<String> = None;
        loop {
            let name = prompt.prompt_name(taken.as_deref()).await?;
            self.set_state(TunnelState::Registering);
            match self.relay.register(&self.options.registration_request(&name)).await {
                Ok(_) => {
                    self.log.info(format!("Registered '{}' with relay", name));
                    return Ok(name);
                }
                Err(RelayError::NameTaken { .. }) => {
                    self.log.warn(format!("Name '{}' is already registered", name));
                    taken = Some(name);
                }
                Err(RelayError::Validation(message)) => {
                    self.log.warn(message);
                    taken = None;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Connect, serve until the socket closes, then wait and reconnect
    /// until stopped
    async fn run(self: Arc<Self>) {
        loop {
            self.connect().await;
            if self.stop.is_cancelled() {
                break;
            }

            self.set_state(TunnelState::ReconnectWait);
            self.log.warn(format!(
                "Reconnecting in {}s",
                self.options.reconnect_delay.as_secs_f64()
            ));
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(self.options.reconnect_delay) => {}
            }
        }
        self.set_state(TunnelState::Stopped);
        self.log.info("Tunnel client stopped");
    }

    async fn connect(self: &Arc<Self>) {
        if self
            .connecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Tunnel connect already in progress");
            return;
        }
        self.connect_once().await;
        self.connecting.store(false, Ordering::SeqCst);
    }

    async fn connect_once(self: &Arc<Self>) {
        let Some(name) = self.read(|s| s.name.clone()) else {
            self.fail("Cannot connect without a server name".to_string());
            return;
        };
        let url = match tunnel_url(&self.options.relay_ws_url, &name) {
            Ok(url) => url,
            Err(e) => {
                self.fail(format!("Invalid relay URL {}: {}", self.options.relay_ws_url, e));
                return;
            }
        };

        self.set_state(TunnelState::Connecting);
        self.log.info(format!("Connecting to relay at {}", url));
        let ws = tokio::select! {
            _ = self.stop.cancelled() => return,
            result = tokio_tungstenite::connect_async(url.as_str()) => match result {
                Ok((ws, _)) => ws,
                Err(e) => {
                    self.fail(format!("Relay connection failed: {}", e));
                    return;
                }
            },
        };
        self.log.info("Tunnel socket open, waiting for relay");

        let (mut sink, mut stream) = ws.split();
        let conn = self.stop.child_token();
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

        let writer_conn = conn.clone();
        let writer = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = writer_conn.cancelled() => break,
                    frame = rx.recv() => frame,
                };
                let Some(outbound) = frame else { break };
                if outbound.is_stale() {
                    continue;
                }
                let text = match outbound.frame.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode tunnel frame: {}", e);
                        continue;
                    }
                };
                if sink.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        loop {
            let msg = tokio::select! {
                _ = self.stop.cancelled() => {
                    self.log.info("Closing tunnel socket");
                    break;
                }
                msg = stream.next() => msg,
            };
            let text = match msg {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) => {
                    self.log.warn("Relay closed the tunnel socket");
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.fail(format!("Tunnel socket error: {}", e));
                    break;
                }
                None => {
                    self.log.warn("Tunnel socket ended");
                    break;
                }
            };
            match TunnelFrame::parse(text.as_str()) {
                Ok(frame) => {
                    if !self.handle_frame(frame, &tx, &conn) {
                        break;
                    }
                }
                Err(e) => warn!("Ignoring malformed tunnel frame: {}", e),
            }
        }

        conn.cancel();
        drop(tx);
        let _ = writer.await;
        self.on_closed();
    }

    /// Returns false when the socket should be closed
    fn handle_frame(
        self: &Arc<Self>,
        frame: TunnelFrame,
        tx: &FrameSender,
        conn: &CancellationToken,
    ) -> bool {
        match frame {
            TunnelFrame::Connected {
                tunnel_id,
                public_url,
            } => {
                self.log
                    .info(format!("Tunnel {} connected at {}", tunnel_id, public_url));
                self.update(|s| {
                    s.tunnel_id = Some(tunnel_id);
                    s.public_url = Some(public_url);
                    s.state = TunnelState::Connected;
                    s.last_error = None;
                });
            }
            TunnelFrame::Request {
                request_id,
                method,
                path,
                headers,
                query_params,
                body,
            } => {
                let request = LocalRequest {
                    request_id,
                    method,
                    path,
                    headers,
                    query_params,
                    body,
                };
                self.spawn_request(request, tx.clone(), conn);
            }
            TunnelFrame::StreamCancel { request_id } => {
                match self.streams.remove(&request_id) {
                    Some((_, (_, token))) => {
                        debug!("Relay cancelled stream {}", request_id);
                        token.cancel();
                    }
                    None => debug!("Stream {} already finished", request_id),
                }
            }
            TunnelFrame::Ping { timestamp } => {
                let _ = tx.send(TunnelFrame::Pong { timestamp }.into());
            }
            TunnelFrame::Error { message } => {
                self.fail(format!("Relay error: {}", message));
                return false;
            }
            TunnelFrame::Unknown => debug!("Ignoring unknown tunnel frame type"),
            other => debug!("Ignoring unexpected frame from relay: {:?}", other),
        }
        true
    }

    fn spawn_request(
        self: &Arc<Self>,
        request: LocalRequest,
        tx: FrameSender,
        conn: &CancellationToken,
    ) {
        debug!(
            "Relayed {} {} ({})",
            request.method, request.path, request.request_id
        );
        if targets_admin(&request.path) {
            self.log.warn(format!(
                "Refused relayed {} {}: administration is local only",
                request.method, request.path
            ));
            let frame = error_response(
                &request.request_id,
                403,
                "Service administration is not available through the tunnel".to_string(),
            );
            let _ = tx.send(frame.into());
            return;
        }
        let inner = self.clone();
        if request.is_streaming() {
            let token = conn.child_token();
            let seq = self.stream_seq.fetch_add(1, Ordering::SeqCst);
            if let Some((_, previous)) = self
                .streams
                .insert(request.request_id.clone(), (seq, token.clone()))
            {
                previous.cancel();
            }
            tokio::spawn(async move {
                let request_id = request.request_id.clone();
                inner.forward_stream(&request, &tx, &token).await;
                inner.streams.remove_if(&request_id, |_, (s, _)| *s == seq);
            });
        } else {
            tokio::spawn(async move {
                let frame = inner.forward(&request).await;
                let _ = tx.send(frame.into());
            });
        }
    }

    fn build(&self, request: &LocalRequest) -> Result<reqwest::RequestBuilder, String> {
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|e| format!("Invalid method {}: {}", request.method, e))?;

        let path = if request.path.starts_with('/') {
            request.path.clone()
        } else {
            format!("/{}", request.path)
        };
        let mut url = Url::parse(&format!("{}{}", self.options.local_url, path))
            .map_err(|e| format!("Invalid local URL for {}: {}", path, e))?;
        if let Some(params) = request.query_params.as_ref().filter(|p| !p.is_empty()) {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params {
                match value {
                    Value::Array(items) => {
                        for item in items.iter().filter_map(flatten_value) {
                            pairs.append_pair(key, &item);
                        }
                    }
                    other => {
                        if let Some(v) = flatten_value(other) {
                            pairs.append_pair(key, &v);
                        }
                    }
                }
            }
        }

        let mut headers = HeaderMap::new();
        for (key, value) in &request.headers {
            if SKIPPED_HEADERS.contains(&key.to_lowercase().as_str()) {
                continue;
            }
            let Some(value) = flatten_value(value) else {
                continue;
            };
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                headers.append(name, value);
            }
        }
        if matches!(request.body, Some(Value::Object(_)) | Some(Value::Array(_)))
            && !headers.contains_key(CONTENT_TYPE)
        {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }

        let mut builder = self.http.request(method, url).headers(headers);
        if let Some(bytes) = body_bytes(&request.body) {
            builder = builder.body(bytes);
        }
        Ok(builder)
    }

    /// One local call, one `response` frame
    async fn forward(&self, request: &LocalRequest) -> TunnelFrame {
        let sent = match self.build(request) {
            Ok(builder) => builder.send().await.map_err(|e| e.to_string()),
            Err(e) => Err(e),
        };
        match sent {
            Ok(resp) => response_frame(&request.request_id, resp).await,
            Err(e) => {
                self.log.warn(format!(
                    "Local request {} {} failed: {}",
                    request.method, request.path, e
                ));
                bad_gateway(&request.request_id, &e)
            }
        }
    }

    /// Forward chunks until the local stream ends or the relay cancels.
    /// Nothing is sent for the request once `token` is cancelled.
    async fn forward_stream(
        &self,
        request: &LocalRequest,
        tx: &FrameSender,
        token: &CancellationToken,
    ) {
        let request_id = request.request_id.clone();
        let sent = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            sent = async {
                self.build(request)?.send().await.map_err(|e| e.to_string())
            } => sent,
        };

        let mut resp = match sent {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                let frame = response_frame(&request_id, resp).await;
                let _ = tx.send(Outbound::for_stream(frame, token));
                return;
            }
            Err(e) => {
                self.log
                    .warn(format!("Local stream {} failed: {}", request.path, e));
                let _ = tx.send(Outbound::for_stream(bad_gateway(&request_id, &e), token));
                return;
            }
        };

        let mut pending = Vec::new();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("Stream {} cancelled, dropping local request", request_id);
                    return;
                }
                chunk = resp.chunk() => chunk,
            };
            match chunk {
                Ok(Some(bytes)) => {
                    pending.extend_from_slice(&bytes);
                    let body = take_utf8(&mut pending);
                    if !body.is_empty() {
                        let chunk = TunnelFrame::StreamChunk {
                            request_id: request_id.clone(),
                            body,
                        };
                        let _ = tx.send(Outbound::for_stream(chunk, token));
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.log
                        .warn(format!("Local stream {} ended with error: {}", request.path, e));
                    break;
                }
            }
        }

        if !pending.is_empty() {
            let chunk = TunnelFrame::StreamChunk {
                request_id: request_id.clone(),
                body: String::from_utf8_lossy(&pending).into_owned(),
            };
            let _ = tx.send(Outbound::for_stream(chunk, token));
        }
        let _ = tx.send(Outbound::for_stream(TunnelFrame::StreamEnd { request_id }, token));
    }

    fn on_closed(&self) {
        let open_streams = self.streams.len();
        for entry in self.streams.iter() {
            entry.value().1.cancel();
        }
        self.streams.clear();
        self.update(|s| {
            s.tunnel_id = None;
            s.public_url = None;
        });
        self.log.warn(format!(
            "Tunnel disconnected ({} open streams closed)",
            open_streams
        ));
    }
}

/// Drain the longest valid UTF-8 prefix, leaving an incomplete trailing
/// sequence in `buf` for the next chunk
fn take_utf8(buf: &mut Vec<u8>) -> String {
    let valid = match std::str::from_utf8(buf) {
        Ok(_) => buf.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => {
            let text = String::from_utf8_lossy(buf).into_owned();
            buf.clear();
            return text;
        }
    };
    let rest = buf.split_off(valid);
    let text = String::from_utf8_lossy(buf).into_owned();
    *buf = rest;
    text
}

fn response_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        if SKIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        let Ok(value) = value.to_str() else { continue };
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    out
}

async fn response_frame(request_id: &str, resp: reqwest::Response) -> TunnelFrame {
    let status_code = resp.status().as_u16();
    let headers = response_headers(resp.headers());
    match resp.bytes().await {
        Ok(bytes) => TunnelFrame::Response {
            request_id: request_id.to_string(),
            status_code,
            headers,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        },
        Err(e) => bad_gateway(request_id, &e.to_string()),
    }
}

fn bad_gateway(request_id: &str, error: &str) -> TunnelFrame {
    error_response(request_id, 502, format!("Bad gateway: {}", error))
}

fn error_response(request_id: &str, status_code: u16, message: String) -> TunnelFrame {
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    TunnelFrame::Response {
        request_id: request_id.to_string(),
        status_code,
        headers,
        body: serde_json::json!({ "error": message }).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::{Body, Bytes};
    use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
    use axum::extract::{RawQuery, State};
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use serde_json::json;
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;

    // ── Fake relay ──

    #[derive(Clone)]
    struct RelayShared {
        inbound: mpsc::UnboundedSender<Value>,
        outbound: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
        connections: Arc<AtomicUsize>,
        registrations: Arc<Mutex<Vec<String>>>,
        taken: Arc<Mutex<Vec<String>>>,
        last_query: Arc<Mutex<Option<String>>>,
        register_fails: Arc<AtomicBool>,
    }

    struct FakeRelay {
        ws_url: String,
        api_url: String,
        shared: RelayShared,
        inbound: mpsc::UnboundedReceiver<Value>,
    }

    async fn relay_ws(
        ws: WebSocketUpgrade,
        State(shared): State<RelayShared>,
        RawQuery(query): RawQuery,
    ) -> Response {
        *shared.last_query.lock().unwrap() = query;
        ws.on_upgrade(move |socket| relay_session(socket, shared))
    }

    async fn relay_session(socket: WebSocket, shared: RelayShared) {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *shared.outbound.lock().unwrap() = Some(tx);
        shared.connections.fetch_add(1, Ordering::SeqCst);

        let (mut sink, mut stream) = socket.split();
        loop {
            tokio::select! {
                out = rx.recv() => match out {
                    Some(text) if text == "__close__" => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                    Some(text) => {
                        if sink.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Ok(value) = serde_json::from_str::<Value>(text.as_str()) {
                            let _ = shared.inbound.send(value);
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    async fn relay_register(
        State(shared): State<RelayShared>,
        axum::Json(body): axum::Json<Value>,
    ) -> Response {
        let name = body["name"].as_str().unwrap_or_default().to_string();
        if shared.register_fails.load(Ordering::SeqCst) {
            return (StatusCode::INTERNAL_SERVER_ERROR, "relay down").into_response();
        }
        if shared.taken.lock().unwrap().contains(&name) {
            return (
                StatusCode::CONFLICT,
                axum::Json(json!({"message": "taken", "existing_record": {"name": name}})),
            )
                .into_response();
        }
        shared.registrations.lock().unwrap().push(name.clone());
        (
            StatusCode::CREATED,
            axum::Json(json!({"success": true, "name": name, "id": 1})),
        )
            .into_response()
    }

    async fn spawn_relay() -> FakeRelay {
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let shared = RelayShared {
            inbound: inbound_tx,
            outbound: Arc::new(Mutex::new(None)),
            connections: Arc::new(AtomicUsize::new(0)),
            registrations: Arc::new(Mutex::new(Vec::new())),
            taken: Arc::new(Mutex::new(Vec::new())),
            last_query: Arc::new(Mutex::new(None)),
            register_fails: Arc::new(AtomicBool::new(false)),
        };
        let app = Router::new()
            .route("/tunnel", get(relay_ws))
            .route("/api/register", post(relay_register))
            .with_state(shared.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        FakeRelay {
            ws_url: format!("ws://{}/tunnel", addr),
            api_url: format!("http://{}/api", addr),
            shared,
            inbound,
        }
    }

    impl FakeRelay {
        fn send(&self, frame: Value) {
            let tx = self.shared.outbound.lock().unwrap().clone().unwrap();
            tx.send(frame.to_string()).unwrap();
        }

        fn close(&self) {
            let tx = self.shared.outbound.lock().unwrap().clone().unwrap();
            tx.send("__close__".to_string()).unwrap();
        }

        fn connections(&self) -> usize {
            self.shared.connections.load(Ordering::SeqCst)
        }

        async fn wait_connections(&self, n: usize) {
            wait_until(|| self.connections() >= n).await;
        }

        async fn next_frame(&mut self) -> Value {
            tokio::time::timeout(Duration::from_secs(5), self.inbound.recv())
                .await
                .expect("timed out waiting for a frame")
                .unwrap()
        }

        /// Every frame that arrives within `window`
        async fn drain_for(&mut self, window: Duration) -> Vec<Value> {
            let mut frames = Vec::new();
            let deadline = tokio::time::Instant::now() + window;
            while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, self.inbound.recv()).await {
                frames.push(frame);
            }
            frames
        }

        fn options(&self, local_url: &str) -> TunnelOptions {
            TunnelOptions::new(local_url, &self.ws_url, &self.api_url)
                .with_reconnect_delay(Duration::from_millis(50))
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(tokio::time::Instant::now() < deadline, "condition not reached");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    // ── Fake local gateway ──

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn endless_events(dropped: Arc<AtomicBool>) -> Response {
        let flag = DropFlag(dropped);
        let stream = futures_util::stream::unfold(flag, |flag| async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Some((Ok::<_, Infallible>(Bytes::from("data: tick\n\n")), flag))
        });
        Response::builder()
            .header("content-type", "text/event-stream")
            .body(Body::from_stream(stream))
            .unwrap()
    }

    async fn spawn_local(dropped: Arc<AtomicBool>) -> String {
        let app = Router::new()
            .route("/", get(|| async { axum::Json(json!({"name": "portico", "services": []})) }))
            .route("/echo", post(|body: String| async move { body }))
            .route(
                "/files/sse",
                get(move || {
                    let dropped = dropped.clone();
                    async move { endless_events(dropped) }
                }),
            )
            .route(
                "/short/sse",
                get(|| async { "event: endpoint\ndata: /short/message\n\n" }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    async fn connected_client(relay: &FakeRelay, local: &str) -> TunnelClient {
        let client = TunnelClient::new(relay.options(local).with_name("demo"));
        client.start().await.unwrap();
        relay.wait_connections(1).await;
        relay.send(json!({"type": "connected", "tunnel_id": "t1", "public_url": "https://demo.relay.example"}));
        wait_until(|| client.is_connected()).await;
        client
    }

    fn frames_for<'a>(frames: &'a [Value], request_id: &str) -> Vec<&'a Value> {
        frames.iter().filter(|f| f["request_id"] == request_id).collect()
    }

    // ── Unit ──

    #[test]
    fn test_stream_classification() {
        assert!(is_stream_request("GET", "/filesystem/sse"));
        assert!(is_stream_request("get", "/filesystem/sse?sessionId=a"));
        assert!(!is_stream_request("POST", "/filesystem/sse"));
        assert!(!is_stream_request("GET", "/filesystem/message"));
        assert!(!is_stream_request("GET", "/"));
    }

    #[test]
    fn test_targets_admin() {
        assert!(targets_admin("/admin"));
        assert!(targets_admin("/admin/services/gmail/enable"));
        assert!(targets_admin("admin/services?x=1"));
        assert!(targets_admin("//admin/services"));
        assert!(targets_admin("/files/../admin/services"));
        assert!(targets_admin("/files/%2E%2E/admin/services/x/disable"));
        assert!(!targets_admin("/administrator/sse"));
        assert!(!targets_admin("/filesystem/admin"));
        assert!(!targets_admin("/"));
    }

    #[test]
    fn test_cancelled_stream_frames_are_stale() {
        let token = CancellationToken::new();
        let end = TunnelFrame::StreamEnd { request_id: "r1".into() };
        let queued = Outbound::for_stream(end.clone(), &token);
        let plain = Outbound::from(end);
        assert!(!queued.is_stale());

        token.cancel();
        assert!(queued.is_stale());
        assert!(!plain.is_stale());
    }

    #[test]
    fn test_tunnel_url_carries_name() {
        let url = tunnel_url("wss://relay.example/tunnel", "my server").unwrap();
        assert_eq!(url.as_str(), "wss://relay.example/tunnel?name=my+server");
        assert!(tunnel_url("not a url", "x").is_err());
    }

    #[test]
    fn test_take_utf8_keeps_partial_sequence() {
        let bytes = "né".as_bytes();
        let mut buf = bytes[..2].to_vec();
        assert_eq!(take_utf8(&mut buf), "n");
        assert_eq!(buf.len(), 1);
        buf.extend_from_slice(&bytes[2..]);
        assert_eq!(take_utf8(&mut buf), "é");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_registration_request_uses_tunnel_endpoint() {
        let options = TunnelOptions::new("http://127.0.0.1:8080/", "wss://relay.example/tunnel", "https://relay.example/api")
            .with_owner_email(Some("me@example.com".into()));
        let req = options.registration_request("Demo Server");
        assert_eq!(req.server_key, "demo-server");
        assert_eq!(req.connection_url, "wss://relay.example/tunnel?name=Demo+Server");
        assert_eq!(options.local_url, "http://127.0.0.1:8080");
    }

    // ── Against the fake relay ──

    #[tokio::test]
    async fn test_register_connect_and_forward_request() {
        let mut relay = spawn_relay().await;
        let local = spawn_local(Arc::new(AtomicBool::new(false))).await;
        let client = connected_client(&relay, &local).await;

        assert_eq!(relay.shared.registrations.lock().unwrap().as_slice(), ["demo"]);
        assert_eq!(relay.shared.last_query.lock().unwrap().as_deref(), Some("name=demo"));
        assert_eq!(client.tunnel_id().as_deref(), Some("t1"));
        assert_eq!(client.public_url().as_deref(), Some("https://demo.relay.example"));

        relay.send(json!({"type": "request", "request_id": "r1", "method": "GET", "path": "/", "headers": {}}));
        let frame = relay.next_frame().await;
        assert_eq!(frame["type"], "response");
        assert_eq!(frame["request_id"], "r1");
        assert_eq!(frame["status_code"], 200);
        assert!(frame["body"].as_str().unwrap().contains("portico"));

        let rest = relay.drain_for(Duration::from_millis(300)).await;
        assert!(frames_for(&rest, "r1").is_empty());

        client.stop().await;
    }

    #[tokio::test]
    async fn test_post_body_and_query_forwarded() {
        let mut relay = spawn_relay().await;
        let local = spawn_local(Arc::new(AtomicBool::new(false))).await;
        let client = connected_client(&relay, &local).await;

        relay.send(json!({
            "type": "request", "request_id": "r2", "method": "POST", "path": "/echo",
            "headers": {"content-type": "text/plain", "host": "demo.relay.example"},
            "query_params": {"a": "1"},
            "body": "hello"
        }));
        let frame = relay.next_frame().await;
        assert_eq!(frame["request_id"], "r2");
        assert_eq!(frame["status_code"], 200);
        assert_eq!(frame["body"], "hello");

        client.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_gateway_gets_502() {
        let mut relay = spawn_relay().await;
        let client = connected_client(&relay, "http://127.0.0.1:1").await;

        relay.send(json!({"type": "request", "request_id": "r3", "method": "GET", "path": "/"}));
        let frame = relay.next_frame().await;
        assert_eq!(frame["type"], "response");
        assert_eq!(frame["status_code"], 502);

        client.stop().await;
    }

    #[tokio::test]
    async fn test_stream_cancel_stops_forwarding() {
        let mut relay = spawn_relay().await;
        let dropped = Arc::new(AtomicBool::new(false));
        let local = spawn_local(dropped.clone()).await;
        let client = connected_client(&relay, &local).await;

        relay.send(json!({"type": "request", "request_id": "r1", "method": "GET", "path": "/files/sse"}));
        let first = relay.next_frame().await;
        assert_eq!(first["type"], "stream_chunk");
        assert_eq!(first["request_id"], "r1");
        assert_eq!(client.active_streams(), 1);

        relay.send(json!({"type": "stream_cancel", "request_id": "r1"}));
        // Only chunks already on the wire when the cancel arrived can land
        let settling = relay.drain_for(Duration::from_millis(50)).await;
        assert!(frames_for(&settling, "r1").iter().all(|f| f["type"] == "stream_chunk"));

        let after = relay.drain_for(Duration::from_millis(300)).await;
        assert!(frames_for(&after, "r1").is_empty());
        wait_until(|| dropped.load(Ordering::SeqCst)).await;
        assert_eq!(client.active_streams(), 0);

        // Second cancel is harmless
        relay.send(json!({"type": "stream_cancel", "request_id": "r1"}));
        let after = relay.drain_for(Duration::from_millis(100)).await;
        assert!(after.iter().all(|f| f["type"] != "stream_end"));
        assert!(client.is_connected());

        client.stop().await;
    }

    #[tokio::test]
    async fn test_relay_close_cancels_open_streams() {
        let mut relay = spawn_relay().await;
        let dropped = Arc::new(AtomicBool::new(false));
        let local = spawn_local(dropped.clone()).await;
        let client = connected_client(&relay, &local).await;

        relay.send(json!({"type": "request", "request_id": "r1", "method": "GET", "path": "/files/sse"}));
        assert_eq!(relay.next_frame().await["type"], "stream_chunk");
        assert_eq!(client.active_streams(), 1);
        assert!(!dropped.load(Ordering::SeqCst));

        relay.close();
        wait_until(|| dropped.load(Ordering::SeqCst)).await;
        wait_until(|| client.active_streams() == 0).await;
        assert!(
            client
                .connection_log()
                .iter()
                .any(|e| e.message.contains("1 open streams closed"))
        );

        client.stop().await;
    }

    #[tokio::test]
    async fn test_relayed_admin_request_refused() {
        let mut relay = spawn_relay().await;
        let local = spawn_local(Arc::new(AtomicBool::new(false))).await;
        let client = connected_client(&relay, &local).await;

        for (id, path) in [
            ("a1", "/admin/services/gmail/enable"),
            ("a2", "/files/../admin/services/gmail/disable"),
        ] {
            relay.send(json!({"type": "request", "request_id": id, "method": "POST", "path": path}));
            let frame = relay.next_frame().await;
            assert_eq!(frame["request_id"], id);
            assert_eq!(frame["status_code"], 403);
            assert!(frame["body"].as_str().unwrap().contains("not available through the tunnel"));
        }

        // Unrelated paths still reach the gateway
        relay.send(json!({"type": "request", "request_id": "a3", "method": "GET", "path": "/administrator"}));
        let frame = relay.next_frame().await;
        assert_eq!(frame["request_id"], "a3");
        assert_eq!(frame["status_code"], 404);

        client.stop().await;
    }

    #[tokio::test]
    async fn test_finite_stream_ends_once() {
        let mut relay = spawn_relay().await;
        let local = spawn_local(Arc::new(AtomicBool::new(false))).await;
        let client = connected_client(&relay, &local).await;

        relay.send(json!({"type": "request", "request_id": "s1", "method": "GET", "path": "/short/sse"}));
        let frames = relay.drain_for(Duration::from_millis(500)).await;
        let frames = frames_for(&frames, "s1");
        let body: String = frames
            .iter()
            .filter(|f| f["type"] == "stream_chunk")
            .map(|f| f["body"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(body, "event: endpoint\ndata: /short/message\n\n");
        assert_eq!(frames.iter().filter(|f| f["type"] == "stream_end").count(), 1);
        assert_eq!(frames.last().unwrap()["type"], "stream_end");

        client.stop().await;
    }

    #[tokio::test]
    async fn test_failed_stream_is_single_response() {
        let mut relay = spawn_relay().await;
        let local = spawn_local(Arc::new(AtomicBool::new(false))).await;
        let client = connected_client(&relay, &local).await;

        relay.send(json!({"type": "request", "request_id": "m1", "method": "GET", "path": "/missing/sse"}));
        let frames = relay.drain_for(Duration::from_millis(300)).await;
        let frames = frames_for(&frames, "m1");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "response");
        assert_eq!(frames[0]["status_code"], 404);

        client.stop().await;
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let mut relay = spawn_relay().await;
        let local = spawn_local(Arc::new(AtomicBool::new(false))).await;
        let client = connected_client(&relay, &local).await;

        relay.send(json!({"type": "ping", "timestamp": 42}));
        let frame = relay.next_frame().await;
        assert_eq!(frame, json!({"type": "pong", "timestamp": 42}));

        client.stop().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_relay_close() {
        let relay = spawn_relay().await;
        let local = spawn_local(Arc::new(AtomicBool::new(false))).await;
        let client = connected_client(&relay, &local).await;

        relay.close();
        wait_until(|| client.tunnel_id().is_none()).await;
        relay.wait_connections(2).await;
        // Reconnecting does not register again
        assert_eq!(relay.shared.registrations.lock().unwrap().len(), 1);

        relay.send(json!({"type": "connected", "tunnel_id": "t2", "public_url": "https://demo.relay.example"}));
        wait_until(|| client.is_connected()).await;
        assert_eq!(client.tunnel_id().as_deref(), Some("t2"));

        client.stop().await;
    }

    #[tokio::test]
    async fn test_error_frame_closes_and_reconnects() {
        let relay = spawn_relay().await;
        let local = spawn_local(Arc::new(AtomicBool::new(false))).await;
        let client = connected_client(&relay, &local).await;

        relay.send(json!({"type": "error", "message": "tunnel evicted"}));
        relay.wait_connections(2).await;
        assert!(client.last_error().unwrap().contains("tunnel evicted"));
        assert!(client.connection_log().iter().any(|e| e.message.contains("tunnel evicted")));

        client.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_final() {
        let relay = spawn_relay().await;
        let local = spawn_local(Arc::new(AtomicBool::new(false))).await;
        let client = connected_client(&relay, &local).await;

        client.stop().await;
        client.stop().await;
        assert_eq!(client.state(), TunnelState::Stopped);
        assert!(client.tunnel_id().is_none());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(relay.connections(), 1);
        assert!(matches!(client.start().await, Err(TunnelError::Stopped)));
    }

    #[tokio::test]
    async fn test_second_start_rejected() {
        let relay = spawn_relay().await;
        let local = spawn_local(Arc::new(AtomicBool::new(false))).await;
        let client = connected_client(&relay, &local).await;
        assert!(matches!(client.start().await, Err(TunnelError::AlreadyRunning)));
        client.stop().await;
    }

    #[tokio::test]
    async fn test_registration_failure_is_fatal() {
        let relay = spawn_relay().await;
        relay.shared.register_fails.store(true, Ordering::SeqCst);
        let client = TunnelClient::new(relay.options("http://127.0.0.1:1").with_name("demo"));

        let err = client.start().await.unwrap_err();
        assert!(matches!(err, TunnelError::Registration(RelayError::Http { status: 500, .. })));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(relay.connections(), 0);
        assert!(client.last_error().is_some());
    }

    #[tokio::test]
    async fn test_skip_registration() {
        let relay = spawn_relay().await;
        let client = TunnelClient::new(
            relay
                .options("http://127.0.0.1:1")
                .with_name("demo")
                .with_registration(Registration::Skip),
        );
        client.start().await.unwrap();
        relay.wait_connections(1).await;
        assert!(relay.shared.registrations.lock().unwrap().is_empty());
        client.stop().await;
    }

    struct ScriptedPrompt {
        names: Mutex<Vec<String>>,
        seen_taken: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl NamePrompt for ScriptedPrompt {
        async fn prompt_name(&self, taken: Option<&str>) -> Result<String, TunnelError> {
            self.seen_taken.lock().unwrap().push(taken.map(String::from));
            let mut names = self.names.lock().unwrap();
            if names.is_empty() {
                return Err(TunnelError::Prompt("out of names".into()));
            }
            Ok(names.remove(0))
        }
    }

    #[tokio::test]
    async fn test_interactive_registration_retries_until_free() {
        let relay = spawn_relay().await;
        relay.shared.taken.lock().unwrap().push("demo".into());
        let prompt = Arc::new(ScriptedPrompt {
            names: Mutex::new(vec!["demo".into(), "demo-2".into()]),
            seen_taken: Mutex::new(Vec::new()),
        });

        let client = TunnelClient::new(
            relay
                .options("http://127.0.0.1:1")
                .with_registration(Registration::Interactive(prompt.clone())),
        );
        client.start().await.unwrap();

        assert_eq!(client.name().as_deref(), Some("demo-2"));
        assert_eq!(
            prompt.seen_taken.lock().unwrap().as_slice(),
            [None, Some("demo".to_string())]
        );
        relay.wait_connections(1).await;
        assert_eq!(relay.shared.last_query.lock().unwrap().as_deref(), Some("name=demo-2"));
        client.stop().await;
    }
}
