//! Session registry — at most one live session per charge point id.
//!
//! The listener owns the registry. Registering an id that is already
//! present closes the older connection with 1001 and replaces it; a
//! monotonically increasing connection id keeps a replaced session's
//! cleanup from removing its successor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// WebSocket close code 1001 ("going away"), used both when a session is
/// replaced and when every upstream is gone.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Commands for a client connection's writer task.
#[derive(Debug)]
pub enum ClientCommand {
    /// Send a text frame.
    Frame(String),
    /// Send a close frame and stop writing.
    Close { code: u16, reason: String },
}

/// Writer-side handle of one registered client connection.
pub struct ClientConnection {
    pub connection_id: u64,
    pub client_id: String,
    pub connected_at: DateTime<Utc>,
    sender: mpsc::UnboundedSender<ClientCommand>,
}

/// Outcome of a registration attempt
pub enum RegisterResult {
    /// Fresh connection — no previous session existed
    New { connection_id: u64 },
    /// An older session with the same id was closed and replaced
    Replaced { connection_id: u64 },
}

impl RegisterResult {
    pub fn connection_id(&self) -> u64 {
        match self {
            Self::New { connection_id } | Self::Replaced { connection_id } => *connection_id,
        }
    }
}

/// Thread-safe registry of active charge point sessions
pub struct SessionRegistry {
    sessions: DashMap<String, ClientConnection>,
    /// Monotonically increasing connection ID counter
    next_connection_id: AtomicU64,
}

/// Shared, reference-counted session registry
pub type SharedSessionRegistry = Arc<SessionRegistry>;

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Wrap in `Arc` for shared ownership
    pub fn shared() -> SharedSessionRegistry {
        Arc::new(Self::new())
    }

    /// Register a new charge point connection.
    ///
    /// If a session already exists for this id, its client socket is told
    /// to close with 1001 "Replaced by a new connection" and the entry is
    /// replaced. Dropping the old sender also ends the old writer task
    /// once the close frame has gone out.
    pub fn register(
        &self,
        client_id: &str,
        sender: mpsc::UnboundedSender<ClientCommand>,
    ) -> RegisterResult {
        let replaced = self.sessions.remove(client_id).map(|(_, old)| {
            warn!(
                client_id,
                old_connection_id = old.connection_id,
                connected_since = %old.connected_at,
                "duplicate client id, replacing older session"
            );
            let _ = old.sender.send(ClientCommand::Close {
                code: CLOSE_GOING_AWAY,
                reason: "Replaced by a new connection".into(),
            });
        });

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        info!(client_id, connection_id, "registering charge point session");
        self.sessions.insert(
            client_id.to_string(),
            ClientConnection {
                connection_id,
                client_id: client_id.to_string(),
                connected_at: Utc::now(),
                sender,
            },
        );

        match replaced {
            Some(()) => RegisterResult::Replaced { connection_id },
            None => RegisterResult::New { connection_id },
        }
    }

    /// Unregister a charge point connection.
    ///
    /// Only removes the entry if `connection_id` matches the current one,
    /// so the cleanup of a replaced connection cannot remove the session
    /// that superseded it.
    pub fn unregister(&self, client_id: &str, connection_id: u64) {
        let removed = self
            .sessions
            .remove_if(client_id, |_, conn| conn.connection_id == connection_id);
        if removed.is_some() {
            info!(client_id, connection_id, "unregistered charge point session");
        }
    }

    /// Check if a charge point is currently connected
    pub fn is_connected(&self, client_id: &str) -> bool {
        self.sessions.contains_key(client_id)
    }

    /// Get all connected charge point IDs
    pub fn connected_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|r| r.key().clone()).collect()
    }

    /// Number of active sessions
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Ask every connected client to close, then empty the registry.
    /// Used on graceful shutdown.
    pub fn close_all(&self, reason: &str) {
        for entry in self.sessions.iter() {
            let _ = entry.sender.send(ClientCommand::Close {
                code: CLOSE_GOING_AWAY,
                reason: reason.to_string(),
            });
        }
        self.sessions.clear();
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ──────────────────────────────────────────────────────
