//! Alert dispatcher
//!
//! Sessions raise events through an [`EventSink`]; the dispatch task keeps
//! only the events the operator asked for, renders them as human-readable
//! one-liners and hands them to the delivery channels. This is the one
//! layer that opens OCPP payloads: `StatusNotification`,
//! `StartTransaction` and `StopTransaction` get their interesting fields
//! pulled into the alert text.
//!
//! Delivery failures are logged and swallowed; nothing here may ever
//! disturb the proxy path.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::NotifyConfig;
use crate::notify::events::{Event, EventMessage};
use crate::support::ocpp_frame::CallDetails;

use super::pushover::PushoverChannel;

// ── EventSink ──────────────────────────────────────────────────

/// Handle the listener and sessions use to raise notification events.
///
/// The dispatcher is the only consumer, so this is a plain channel into
/// its task rather than a subscriber fan-out. Publishing never blocks the
/// routing path, and an event outlives the session that raised it.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<EventMessage>,
}

impl EventSink {
    fn new() -> (Self, mpsc::UnboundedReceiver<EventMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A sink with no dispatcher behind it; every event is discarded.
    pub fn disabled() -> Self {
        let (sink, _rx) = Self::new();
        sink
    }

    /// Hand an event to the dispatcher. Never blocks and never fails;
    /// a gone dispatcher just means nobody is listening anymore.
    pub fn publish(&self, event: Event) {
        let message = EventMessage::new(event);
        debug!(
            event_type = message.event.event_type(),
            client_id = message.event.client_id(),
            "notification event raised"
        );
        let _ = self.tx.send(message);
    }
}

/// Errors a delivery channel can report. Always swallowed after logging.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("delivery rejected with status {0}")]
    Rejected(u16),
}

/// One way of getting an alert to a human.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &'static str;
    async fn deliver(&self, title: &str, message: &str) -> Result<(), NotifyError>;
}

/// Flag-gated alert formatter and fan-out to delivery channels.
pub struct Notifier {
    config: NotifyConfig,
    channels: Vec<Box<dyn AlertChannel>>,
}

impl Notifier {
    /// Build from config; a Pushover channel is wired up when credentials
    /// are present, otherwise alerts are log-only.
    pub fn new(config: NotifyConfig) -> Self {
        let mut channels: Vec<Box<dyn AlertChannel>> = Vec::new();
        if let Some(pushover) = &config.pushover {
            channels.push(Box::new(PushoverChannel::new(pushover.clone())));
        }
        Self { config, channels }
    }

    pub fn add_channel(&mut self, channel: Box<dyn AlertChannel>) {
        self.channels.push(channel);
    }

    /// Spawn the dispatch task and return the sink that feeds it.
    /// The task drains remaining events and exits once the last sink
    /// handle is dropped.
    pub fn start(self) -> EventSink {
        let (sink, mut events_rx) = EventSink::new();
        tokio::spawn(async move {
            while let Some(message) = events_rx.recv().await {
                self.dispatch(&message.event).await;
            }
        });
        sink
    }

    async fn dispatch(&self, event: &Event) {
        let Some(alert) = self.format_alert(event) else {
            return;
        };
        info!(alert = %alert, "📣 alert");
        for channel in &self.channels {
            if let Err(e) = channel.deliver("OCPP proxy", &alert).await {
                warn!(channel = channel.name(), error = %e, "alert delivery failed");
            }
        }
    }

    /// Render an event as an alert line, or `None` when its flag is off.
    fn format_alert(&self, event: &Event) -> Option<String> {
        match event {
            Event::ClientConnected {
                client_id,
                remote_addr,
            } if self.config.client_connected => Some(match remote_addr {
                Some(addr) => format!("{} connected ({})", client_id, addr),
                None => format!("{} connected", client_id),
            }),
            Event::ClientDisconnected { client_id } if self.config.client_disconnected => {
                Some(format!("{} disconnected", client_id))
            }
            Event::UpstreamConnected {
                client_id,
                upstream,
            } if self.config.upstream_connected => {
                Some(format!("{}: connected to upstream {}", client_id, upstream))
            }
            Event::UpstreamDisconnected {
                client_id,
                upstream,
            } if self.config.upstream_disconnected => {
                Some(format!("{}: lost upstream {}", client_id, upstream))
            }
            Event::CallFromClient { client_id, frame } => {
                self.format_call_alert(client_id, frame)
            }
            _ => None,
        }
    }

    fn format_call_alert(&self, client_id: &str, frame: &str) -> Option<String> {
        let details = CallDetails::parse(frame).ok()?;
        let payload = &details.payload;
        match details.action.as_str() {
            "StatusNotification" if self.config.status_notification => {
                let connector = payload.get("connectorId").and_then(|v| v.as_u64()).unwrap_or(0);
                let status = payload
                    .get("status")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Unknown");
                let error_code = payload
                    .get("errorCode")
                    .and_then(|v| v.as_str())
                    .filter(|code| *code != "NoError");
                Some(match error_code {
                    Some(code) => {
                        format!("{}: connector {} is {} ({})", client_id, connector, status, code)
                    }
                    None => format!("{}: connector {} is {}", client_id, connector, status),
                })
            }
            "StartTransaction" if self.config.start_transaction => {
                let connector = payload.get("connectorId").and_then(|v| v.as_u64()).unwrap_or(0);
                let id_tag = payload.get("idTag").and_then(|v| v.as_str()).unwrap_or("?");
                Some(format!(
                    "{}: transaction started on connector {} by {}",
                    client_id, connector, id_tag
                ))
            }
            "StopTransaction" if self.config.stop_transaction => {
                let transaction = payload
                    .get("transactionId")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                Some(match payload.get("reason").and_then(|v| v.as_str()) {
                    Some(reason) => format!(
                        "{}: transaction {} stopped ({})",
                        client_id, transaction, reason
                    ),
                    None => format!("{}: transaction {} stopped", client_id, transaction),
                })
            }
            _ => None,
        }
    }
}
