//! Notifications: lifecycle and message alerts.
//!
//! Sessions raise [`Event`]s through an [`EventSink`]; the [`Notifier`]'s
//! dispatch task filters them by config flags and pushes human-readable
//! alerts through the delivery channels.

pub mod dispatcher;
pub mod events;
pub mod pushover;

pub use dispatcher::{AlertChannel, EventSink, Notifier, NotifyError};
pub use events::{Event, EventMessage};
pub use pushover::PushoverChannel;
