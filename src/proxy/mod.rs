//! The proxy engine: listener, per-client sessions, the message router and
//! the upstream links.

pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod upstream;

pub use registry::{SessionRegistry, SharedSessionRegistry};
pub use server::ProxyServer;
pub use session::{Session, SessionContext};
pub use upstream::UpstreamLink;
