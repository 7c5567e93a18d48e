//! Event-stream session registry
//!
//! At most one live push connection exists per session id. Opening a new
//! one for the same id force-closes the old one; the old connection's
//! eventual teardown must not remove its replacement, so every connection
//! carries a generation number and removal is conditional on it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Maximum client-supplied session ID length
const MAX_SESSION_ID_LEN: usize = 128;

/// Normalize a client-supplied session id: trim, then require 1 to
/// `MAX_SESSION_ID_LEN` characters from `[A-Za-z0-9_-]`. The id is echoed
/// into the endpoint URL unencoded, so nothing else is accepted.
pub fn normalize_session_key(key: &str) -> Result<String, &'static str> {
    let normalized = key.trim();

    if normalized.is_empty() {
        return Err("Session ID cannot be empty");
    }
    if normalized.len() > MAX_SESSION_ID_LEN {
        return Err("Session ID too long");
    }
    if !normalized
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err("Session ID may only contain letters, digits, '-' and '_'");
    }

    Ok(normalized.to_string())
}

struct PushConnection {
    generation: u64,
    tx: mpsc::UnboundedSender<String>,
    closed: CancellationToken,
    opened_at: DateTime<Utc>,
}

/// Snapshot of a live session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub generation: u64,
    pub opened_at: DateTime<Utc>,
}

/// Receiving half of a push connection, handed to the SSE response stream.
/// Dropping it deregisters the connection if it is still the current one.
pub struct PushChannel {
    pub session_id: String,
    pub generation: u64,
    pub rx: mpsc::UnboundedReceiver<String>,
    /// Cancelled when a newer connection replaces this one
    pub closed: CancellationToken,
    registry: Arc<SessionRegistry>,
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        if self.registry.remove(&self.session_id, self.generation) {
            debug!("Event stream for session '{}' disconnected", self.session_id);
        }
    }
}

/// Live push connections keyed by session id
#[derive(Default)]
pub struct SessionRegistry {
    connections: DashMap<String, PushConnection>,
    next_generation: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a push connection, replacing (and force-closing) any existing one
    pub fn open(self: &Arc<Self>, session_id: &str) -> PushChannel {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();

        let previous = self.connections.insert(
            session_id.to_string(),
            PushConnection {
                generation,
                tx,
                closed: closed.clone(),
                opened_at: Utc::now(),
            },
        );

        if let Some(old) = previous {
            info!(
                "Replacing event stream for session '{}' (generation {} -> {})",
                session_id, old.generation, generation
            );
            old.closed.cancel();
        } else {
            info!("Event stream opened for session '{}'", session_id);
        }

        PushChannel {
            session_id: session_id.to_string(),
            generation,
            rx,
            closed,
            registry: self.clone(),
        }
    }

    /// Push a message to whichever connection is current for the session.
    /// Returns false when there is none.
    pub fn send(&self, session_id: &str, message: String) -> bool {
        self.connections
            .get(session_id)
            .is_some_and(|conn| conn.tx.send(message).is_ok())
    }

    /// Remove a connection only if it is still the given generation
    pub fn remove(&self, session_id: &str, generation: u64) -> bool {
        self.connections
            .remove_if(session_id, |_, conn| conn.generation == generation)
            .is_some()
    }

    pub fn is_connected(&self, session_id: &str) -> bool {
        self.connections.contains_key(session_id)
    }

    pub fn current_generation(&self, session_id: &str) -> Option<u64> {
        self.connections.get(session_id).map(|c| c.generation)
    }

    /// Poll until a push connection exists for the session or the timeout
    /// elapses. Returns whether one appeared.
    pub async fn wait_for_connection(
        &self,
        session_id: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_connected(session_id) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Force-close every connection (gateway shutdown)
    pub fn close_all(&self) {
        for conn in self.connections.iter() {
            conn.closed.cancel();
        }
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut list: Vec<SessionInfo> = self
            .connections
            .iter()
            .map(|c| SessionInfo {
                session_id: c.key().clone(),
                generation: c.generation,
                opened_at: c.opened_at,
            })
            .collect();
        list.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        list
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }
}
