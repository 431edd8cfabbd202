//! Notification events
//!
//! Raised by the listener and sessions at connection-lifecycle points and
//! for every charge point Call before fan-out. The dispatcher decides which
//! of these become alerts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event types for notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    /// Charge point connected to the proxy
    ClientConnected {
        client_id: String,
        remote_addr: Option<String>,
    },
    /// Charge point disconnected from the proxy
    ClientDisconnected { client_id: String },
    /// An upstream link came up for this charge point
    UpstreamConnected { client_id: String, upstream: String },
    /// An upstream link went down for this charge point
    UpstreamDisconnected { client_id: String, upstream: String },
    /// A Call frame from the charge point, raised before fan-out
    CallFromClient { client_id: String, frame: String },
}

impl Event {
    /// Get the event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::ClientConnected { .. } => "client_connected",
            Event::ClientDisconnected { .. } => "client_disconnected",
            Event::UpstreamConnected { .. } => "upstream_connected",
            Event::UpstreamDisconnected { .. } => "upstream_disconnected",
            Event::CallFromClient { .. } => "call_from_client",
        }
    }

    /// The charge point this event concerns
    pub fn client_id(&self) -> &str {
        match self {
            Event::ClientConnected { client_id, .. }
            | Event::ClientDisconnected { client_id }
            | Event::UpstreamConnected { client_id, .. }
            | Event::UpstreamDisconnected { client_id, .. }
            | Event::CallFromClient { client_id, .. } => client_id,
        }
    }
}

/// Wrapper for sending events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

impl EventMessage {
    pub fn new(event: Event) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event,
        }
    }
}
