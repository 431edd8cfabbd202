//! # OCPP Mirror Proxy
//!
//! WebSocket proxy for the OCPP 1.6-J framing layer. A charge point opens a
//! single session to the proxy; the proxy multiplexes it onto a mandatory
//! primary central system and, optionally, a standby mirror:
//!
//! - **support**: Cross-cutting utilities (errors, OCPP-J framing, shutdown)
//! - **proxy**: The engine — listener, per-client sessions, message router,
//!   upstream links with reconnect/back-off
//! - **notify**: Connection-lifecycle and message alerts (event bus + dispatcher)
//! - **config**: Application configuration (TOML-based)

pub mod config;
pub mod notify;
pub mod proxy;
pub mod support;

// Re-export commonly used types at crate root
pub use config::{default_config_path, AppConfig};
pub use notify::{Event, EventSink, Notifier};
pub use proxy::{ProxyServer, SessionRegistry, SharedSessionRegistry};
pub use support::errors::ProxyError;
