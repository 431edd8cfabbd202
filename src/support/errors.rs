use thiserror::Error;

/// Fatal errors surfaced to the process entry point.
///
/// Everything on the message-routing hot path is logged and swallowed
/// locally; only startup failures travel through this type.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
