//! Charge-point-facing WebSocket listener
//!
//! Accepts connections at `ws://<host>:<port>/{client_id}`, validates the
//! path, negotiates the OCPP subprotocol, enforces one live session per
//! client id, and hands each accepted connection to a [`Session`].

use std::net::SocketAddr;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::notify::{Event, EventSink};
use crate::proxy::registry::{ClientCommand, SharedSessionRegistry};
use crate::proxy::session::{Session, SessionContext};
use crate::proxy::upstream::ForwardedHeaders;
use crate::support::errors::ProxyError;
use crate::support::shutdown::ShutdownSignal;

/// Subprotocol assumed when the charge point offers none.
const DEFAULT_SUBPROTOCOL: &str = "ocpp1.6";

/// Charge-point-facing proxy listener
pub struct ProxyServer {
    config: AppConfig,
    registry: SharedSessionRegistry,
    notify: EventSink,
    shutdown: Option<ShutdownSignal>,
}

impl ProxyServer {
    pub fn new(
        config: AppConfig,
        registry: SharedSessionRegistry,
        notify: EventSink,
    ) -> Self {
        Self {
            config,
            registry,
            notify,
            shutdown: None,
        }
    }

    /// Set the shutdown signal for graceful shutdown
    pub fn with_shutdown(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown = Some(signal);
        self
    }

    pub fn registry(&self) -> &SharedSessionRegistry {
        &self.registry
    }

    /// Bind and serve until shutdown.
    pub async fn run(&self) -> Result<(), ProxyError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Bind the listening socket. Split from [`serve`](Self::serve) so
    /// callers can learn the bound address before accepting.
    pub async fn bind(&self) -> Result<TcpListener, ProxyError> {
        let addr = self.config.address();
        let listener = TcpListener::bind(&addr).await?;
        info!("🔌 OCPP proxy listening on ws://{}", addr);
        info!("   Charge points should connect to: ws://{}/{{client_id}}", addr);
        Ok(listener)
    }

    /// Accept connections until the shutdown signal fires.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ProxyError> {
        match self.shutdown.clone() {
            Some(shutdown) => loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((stream, addr)) => self.spawn_connection(stream, addr),
                        Err(e) => error!(error = %e, "failed to accept connection"),
                    },
                    _ = shutdown.triggered() => {
                        info!("🛑 listener received shutdown signal");
                        self.graceful_shutdown().await;
                        return Ok(());
                    }
                }
            },
            None => {
                while let Ok((stream, addr)) = listener.accept().await {
                    self.spawn_connection(stream, addr);
                }
                Ok(())
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let config = self.config.clone();
        let registry = self.registry.clone();
        let notify = self.notify.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            if let Err(e) =
                handle_connection(stream, addr, config, registry, notify, shutdown).await
            {
                warn!(remote_addr = %addr, error = %e, "connection error");
            }
        });
    }

    async fn graceful_shutdown(&self) {
        let count = self.registry.count();
        if count > 0 {
            info!("📢 Closing {} connected charge point session(s)...", count);
        }
        self.registry.close_all("Server shutting down");
        // Give writer tasks a moment to flush close frames.
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
        info!("✅ Listener shutdown complete");
    }
}

// ── Handshake helpers ──────────────────────────────────────────

/// Extract and validate the client id from the request path.
/// Exactly one non-empty `[A-Za-z0-9_-]+` segment is accepted.
fn extract_client_id(path: &str) -> Option<String> {
    let id = path.strip_prefix('/').unwrap_or(path);
    if !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        Some(id.to_string())
    } else {
        None
    }
}

/// Pick the subprotocol for this session from the client's offer.
///
/// Returns `(protocol, echo)` where `echo` says whether to confirm it in
/// the handshake response — only when the client actually offered it.
/// `None` means the client offered subprotocols but none we speak, which
/// refuses the upgrade.
fn negotiate_subprotocol(offered: &str) -> Option<(String, bool)> {
    if offered.trim().is_empty() {
        return Some((DEFAULT_SUBPROTOCOL.to_string(), false));
    }
    offered
        .split(',')
        .map(str::trim)
        .find(|p| p.starts_with("ocpp"))
        .map(|p| (p.to_string(), true))
}

/// First comma-separated element of `X-Forwarded-For` when present and
/// non-empty, else the remote peer address.
fn derive_client_ip(forwarded_for: Option<&str>, peer: &SocketAddr) -> String {
    forwarded_for
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string())
}

// ── Connection handling ────────────────────────────────────────

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    config: AppConfig,
    registry: SharedSessionRegistry,
    notify: EventSink,
    shutdown: Option<ShutdownSignal>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    debug!(remote_addr = %addr, "new connection");

    let mut raw_path = String::new();
    let mut client_id: Option<String> = None;
    let mut protocol = DEFAULT_SUBPROTOCOL.to_string();
    let mut forwarded = ForwardedHeaders::default();

    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, mut response: Response| {
            raw_path = req.uri().path().to_string();
            debug!(remote_addr = %addr, path = %raw_path, "websocket handshake");

            let offered = req
                .headers()
                .get("Sec-WebSocket-Protocol")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");

            match negotiate_subprotocol(offered) {
                Some((negotiated, echo)) => {
                    if echo {
                        if let Ok(value) = negotiated.parse() {
                            response
                                .headers_mut()
                                .insert("Sec-WebSocket-Protocol", value);
                        }
                    }
                    protocol = negotiated;
                }
                None => {
                    warn!(remote_addr = %addr, offered, "no supported subprotocol, refusing upgrade");
                    let mut reject = ErrorResponse::new(Some("unsupported subprotocol".into()));
                    *reject.status_mut() = StatusCode::BAD_REQUEST;
                    return Err(reject);
                }
            }

            client_id = extract_client_id(&raw_path);

            let header = |name: &str| {
                req.headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            forwarded.client_ip =
                derive_client_ip(header("X-Forwarded-For").as_deref(), &addr);
            forwarded.authorization = header("Authorization");
            forwarded.user_agent = header("User-Agent");

            Ok(response)
        },
    )
    .await?;

    let client_id = match client_id {
        Some(id) => id,
        None => {
            warn!(remote_addr = %addr, path = %raw_path, "invalid path, closing");
            let mut ws_stream = ws_stream;
            let _ = ws_stream
                .close(Some(CloseFrame {
                    code: CloseCode::Policy,
                    reason: format!("Invalid path {}", raw_path).into(),
                }))
                .await;
            return Ok(());
        }
    };

    info!(client_id = %client_id, remote_addr = %addr, protocol = %protocol, "charge point connected");

    let (client_tx, client_cmd_rx) = mpsc::unbounded_channel();
    let connection_id = registry.register(&client_id, client_tx.clone()).connection_id();

    notify.publish(Event::ClientConnected {
        client_id: client_id.clone(),
        remote_addr: Some(addr.to_string()),
    });

    let (ws_sender, ws_receiver) = ws_stream.split();
    let mut send_task = tokio::spawn(client_writer(ws_sender, client_cmd_rx, client_id.clone()));

    let ctx = SessionContext {
        client_id: client_id.clone(),
        protocol,
        forwarded,
    };
    let (mut session, mut events_rx) =
        Session::new(ctx, &config.upstreams(), client_tx, notify.clone());

    tokio::select! {
        // The writer stops when the registry replaced this connection or
        // the socket broke; either way the session is over.
        _ = &mut send_task => {
            debug!(client_id = %client_id, "client writer stopped");
        }
        _ = session.run(ws_receiver, &mut events_rx, shutdown) => {}
    }

    session.teardown();
    registry.unregister(&client_id, connection_id);
    notify.publish(Event::ClientDisconnected {
        client_id: client_id.clone(),
    });

    info!(client_id = %client_id, "charge point disconnected");
    Ok(())
}

/// Outgoing half of the client socket. Stops after a close command or a
/// send failure; the channel closing ends it too.
async fn client_writer(
    mut ws_sender: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::UnboundedReceiver<ClientCommand>,
    client_id: String,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            ClientCommand::Frame(text) => {
                debug!(client_id = %client_id, frame = %text, "-> client");
                if let Err(e) = ws_sender.send(Message::Text(text)).await {
                    warn!(client_id = %client_id, error = %e, "client send failed");
                    break;
                }
            }
            ClientCommand::Close { code, reason } => {
                info!(client_id = %client_id, code, reason = %reason, "closing client socket");
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                };
                let _ = ws_sender.send(Message::Close(Some(frame))).await;
                break;
            }
        }
    }
}
