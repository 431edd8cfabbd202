//! Upstream link — one outbound WebSocket per configured central system.
//!
//! Each link owns a driver task that connects, pumps frames, and reconnects
//! with capped exponential back-off after unsolicited closes. Lifecycle and
//! message events are delivered to the owning session over its single event
//! channel, which keeps connect/disconnect/frame ordering intact per link.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::proxy::session::SessionEvent;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── Reconnection policy ────────────────────────────────────────

const RECONNECT_BASE_MS: u64 = 5_000;
const RECONNECT_MAX_MS: u64 = 60_000;
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Delay before reconnect attempt `n` (1-indexed):
/// `min(5000 · 2^(n−1), 60000)` milliseconds.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let doublings = attempt.saturating_sub(1).min(4);
    Duration::from_millis((RECONNECT_BASE_MS << doublings).min(RECONNECT_MAX_MS))
}

// ── ForwardedHeaders ───────────────────────────────────────────

/// Handshake context carried from the charge point connection onto every
/// outbound upstream handshake.
#[derive(Debug, Clone, Default)]
pub struct ForwardedHeaders {
    /// Apparent client IP, injected as `X-Forwarded-For` / `X-Real-IP`.
    /// Empty means omit both headers.
    pub client_ip: String,
    /// `Authorization` pass-through from the client request.
    pub authorization: Option<String>,
    /// `User-Agent` pass-through from the client request.
    pub user_agent: Option<String>,
}

// ── UpstreamLink ───────────────────────────────────────────────

/// One WebSocket connection to one upstream URL.
///
/// Owned by exactly one session. `close()` is idempotent, cancels any
/// pending reconnect timer, and forbids all future connects.
pub struct UpstreamLink {
    index: usize,
    name: String,
    url: String,
    protocol: String,
    headers: ForwardedHeaders,
    events: mpsc::UnboundedSender<SessionEvent>,
    /// Sender into the live socket's write loop; `None` while not open.
    outbox: Mutex<Option<mpsc::UnboundedSender<String>>>,
    started: AtomicBool,
    connected: AtomicBool,
    ever_connected: AtomicBool,
    closed: AtomicBool,
    gave_up: AtomicBool,
    reconnect_attempts: AtomicU32,
    close_tx: watch::Sender<bool>,
}

impl UpstreamLink {
    pub fn new(
        index: usize,
        name: String,
        url: String,
        protocol: String,
        headers: ForwardedHeaders,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            index,
            name,
            url,
            protocol,
            headers,
            events,
            outbox: Mutex::new(None),
            started: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            ever_connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            gave_up: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
            close_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn has_ever_connected(&self) -> bool {
        self.ever_connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The link burned through its reconnection budget and stopped.
    pub fn is_exhausted(&self) -> bool {
        self.gave_up.load(Ordering::SeqCst)
    }

    /// Spawn the driver task. Subsequent calls are no-ops.
    pub fn connect(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let link = Arc::clone(self);
        tokio::spawn(async move {
            link.drive().await;
        });
    }

    /// Queue a frame onto the live socket.
    ///
    /// Returns `false` without queuing when the link is not open; the
    /// frame is not retried (request timeouts are the endpoints' business).
    pub fn send(&self, raw: &str) -> bool {
        let outbox = self.outbox.lock().unwrap();
        match outbox.as_ref() {
            Some(tx) if self.connected.load(Ordering::SeqCst) => tx.send(raw.to_string()).is_ok(),
            _ => {
                debug!(upstream = %self.name, "send on non-open upstream link dropped");
                false
            }
        }
    }

    /// Permanently close the link: cancels any pending reconnect timer,
    /// closes the live socket if any, forbids future connects.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(upstream = %self.name, "closing upstream link");
        let _ = self.close_tx.send(true);
    }

    // ── Driver ─────────────────────────────────────────────

    async fn drive(self: Arc<Self>) {
        let mut close_rx = self.close_tx.subscribe();
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }

            // close() must also cancel an attempt that is still
            // handshaking, not just the back-off timer.
            let connect_result = tokio::select! {
                result = self.open_socket() => result,
                _ = close_rx.changed() => return,
            };

            match connect_result {
                Ok(ws) => {
                    info!(upstream = %self.name, url = %self.url, "upstream link open");
                    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
                    self.note_open(outbox_tx);
                    let _ = self.events.send(SessionEvent::UpstreamConnected { index: self.index });

                    self.run_io(ws, outbox_rx, &mut close_rx).await;

                    self.note_socket_closed();
                    if self.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    info!(upstream = %self.name, "upstream link lost");
                    let _ = self
                        .events
                        .send(SessionEvent::UpstreamDisconnected { index: self.index });
                }
                Err(e) => {
                    warn!(upstream = %self.name, url = %self.url, error = %e, "upstream connect failed");
                }
            }

            // Schedule the next attempt, or give up once the budget is spent.
            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > MAX_RECONNECT_ATTEMPTS {
                warn!(
                    upstream = %self.name,
                    attempts = MAX_RECONNECT_ATTEMPTS,
                    "reconnection budget exhausted, giving up"
                );
                self.note_gave_up();
                let _ = self.events.send(SessionEvent::UpstreamGaveUp { index: self.index });
                return;
            }
            let delay = reconnect_delay(attempt);
            debug!(
                upstream = %self.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = close_rx.changed() => return,
            }
        }
    }

    async fn run_io(
        &self,
        ws: WsStream,
        mut outbox_rx: mpsc::UnboundedReceiver<String>,
        close_rx: &mut watch::Receiver<bool>,
    ) {
        let (mut sink, mut stream) = ws.split();
        loop {
            tokio::select! {
                frame = outbox_rx.recv() => match frame {
                    Some(text) => {
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            warn!(upstream = %self.name, error = %e, "upstream send failed");
                            break;
                        }
                    }
                    None => break,
                },
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        let _ = self.events.send(SessionEvent::UpstreamFrame {
                            index: self.index,
                            raw: text,
                        });
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(upstream = %self.name, ?frame, "upstream sent close");
                        break;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!(
                            upstream = %self.name,
                            bytes = data.len(),
                            "binary frame from upstream ignored"
                        );
                    }
                    // Ping/pong are answered by the transport.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(upstream = %self.name, error = %e, "upstream socket error");
                        break;
                    }
                    None => break,
                },
                _ = close_rx.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    async fn open_socket(&self) -> Result<WsStream, tokio_tungstenite::tungstenite::Error> {
        let request = self.client_request()?;
        let (ws, _response) = connect_async(request).await?;
        Ok(ws)
    }

    /// Resolved URL plus the forwarded handshake headers. Header values
    /// that fail validation are skipped rather than failing the connect —
    /// they originate from client input.
    fn client_request(
        &self,
    ) -> Result<
        tokio_tungstenite::tungstenite::handshake::client::Request,
        tokio_tungstenite::tungstenite::Error,
    > {
        let mut request = self.url.as_str().into_client_request()?;
        let headers = request.headers_mut();

        if let Ok(protocol) = HeaderValue::from_str(&self.protocol) {
            headers.insert("Sec-WebSocket-Protocol", protocol);
        }
        if !self.headers.client_ip.is_empty() {
            if let Ok(ip) = HeaderValue::from_str(&self.headers.client_ip) {
                headers.insert("X-Forwarded-For", ip.clone());
                headers.insert("X-Real-IP", ip);
            }
        }
        if let Some(auth) = &self.headers.authorization {
            if let Ok(value) = HeaderValue::from_str(auth) {
                headers.insert("Authorization", value);
            }
        }
        if let Some(ua) = &self.headers.user_agent {
            if let Ok(value) = HeaderValue::from_str(ua) {
                headers.insert("User-Agent", value);
            }
        }
        Ok(request)
    }

    // ── State transitions ──────────────────────────────────
    //
    // pub(crate) so session tests can drive the state machine without
    // sockets; the driver task is the only production caller.

    pub(crate) fn note_open(&self, outbox_tx: mpsc::UnboundedSender<String>) {
        *self.outbox.lock().unwrap() = Some(outbox_tx);
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.ever_connected.store(true, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
    }

    pub(crate) fn note_socket_closed(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.outbox.lock().unwrap() = None;
    }

    pub(crate) fn note_gave_up(&self) {
        self.gave_up.store(true, Ordering::SeqCst);
    }
}
