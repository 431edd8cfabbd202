//! Per-client proxy session
//!
//! One session per connected charge point. The session owns the client
//! socket's read half (the write half runs behind a command channel), one
//! upstream link per configured central system, a router, and a buffer for
//! frames that arrive before any upstream is up. Everything is mutated from
//! a single task selecting over the client socket, the link event channel
//! and the shutdown signal, so no routing state needs locks.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::UpstreamConfig;
use crate::notify::{Event, EventSink};
use crate::proxy::registry::{ClientCommand, CLOSE_GOING_AWAY};
use crate::proxy::router::{RouteDecision, Router};
use crate::proxy::upstream::{ForwardedHeaders, UpstreamLink};
use crate::support::ocpp_frame::{MessageKind, RawOcppMessage};
use crate::support::shutdown::ShutdownSignal;

/// Frames held while no upstream is connected. Oldest are dropped beyond
/// this; the cap is far above any realistic boot-time burst.
const PRE_CONNECT_BUFFER_MAX: usize = 256;

// ── SessionEvent ───────────────────────────────────────────────

/// Everything the upstream links report back to their owning session,
/// over one channel so per-link ordering is preserved.
#[derive(Debug)]
pub enum SessionEvent {
    UpstreamConnected { index: usize },
    UpstreamDisconnected { index: usize },
    UpstreamGaveUp { index: usize },
    UpstreamFrame { index: usize, raw: String },
}

// ── SessionContext ─────────────────────────────────────────────

/// Handshake-derived facts the listener hands to a new session.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub client_id: String,
    /// Negotiated subprotocol, reused verbatim on upstream handshakes.
    pub protocol: String,
    pub forwarded: ForwardedHeaders,
}

// ── Session ────────────────────────────────────────────────────

/// Per-client runtime state bundling the client writer handle, the
/// upstream links (position-significant: ordinal 0 is the primary),
/// the router and the pre-connect buffer.
pub struct Session {
    client_id: String,
    client_tx: mpsc::UnboundedSender<ClientCommand>,
    links: Vec<Arc<UpstreamLink>>,
    router: Router,
    buffer: VecDeque<String>,
    notify: EventSink,
}

impl Session {
    /// Build a session and the event channel its links report into.
    pub fn new(
        ctx: SessionContext,
        upstreams: &[UpstreamConfig],
        client_tx: mpsc::UnboundedSender<ClientCommand>,
        notify: EventSink,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let links = upstreams
            .iter()
            .enumerate()
            .map(|(index, upstream)| {
                Arc::new(UpstreamLink::new(
                    index,
                    upstream.name.clone(),
                    format!("{}{}", upstream.base_url, ctx.client_id),
                    ctx.protocol.clone(),
                    ctx.forwarded.clone(),
                    events_tx.clone(),
                ))
            })
            .collect();

        let session = Self {
            client_id: ctx.client_id,
            client_tx,
            links,
            router: Router::new(),
            buffer: VecDeque::new(),
            notify,
        };
        (session, events_rx)
    }

    /// Drive the session until the client goes away, every upstream is
    /// lost, or the server shuts down.
    pub async fn run<S>(
        &mut self,
        mut client_rx: S,
        events_rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
        shutdown: Option<ShutdownSignal>,
    ) where
        S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        for link in &self.links {
            link.connect();
        }

        loop {
            let shutdown_wait = async {
                match shutdown.as_ref() {
                    Some(signal) => signal.triggered().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                frame = client_rx.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        debug!(client_id = %self.client_id, frame = %text, "<- client");
                        self.on_client_frame(text);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(client_id = %self.client_id, ?frame, "client sent close");
                        break;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!(
                            client_id = %self.client_id,
                            bytes = data.len(),
                            "binary frame from client ignored"
                        );
                    }
                    // Ping/pong are answered by the transport.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(client_id = %self.client_id, error = %e, "client socket error");
                        break;
                    }
                    None => break,
                },
                event = events_rx.recv() => match event {
                    Some(event) => {
                        if self.on_upstream_event(event) {
                            break;
                        }
                    }
                    None => break,
                },
                _ = shutdown_wait => {
                    info!(client_id = %self.client_id, "session closing due to server shutdown");
                    self.close_client("Server shutting down");
                    break;
                }
            }
        }

        self.teardown();
    }

    /// Close every link, forbidding reconnects, and drop routing state.
    /// Idempotent and safe to call with link I/O still in flight.
    pub fn teardown(&mut self) {
        for link in &self.links {
            link.close();
        }
        self.router.clear();
        self.buffer.clear();
    }

    // ── Client → upstreams ─────────────────────────────────

    fn on_client_frame(&mut self, raw: String) {
        if !self.links.iter().any(|l| l.is_connected()) {
            if self.buffer.len() >= PRE_CONNECT_BUFFER_MAX {
                self.buffer.pop_front();
                warn!(
                    client_id = %self.client_id,
                    cap = PRE_CONNECT_BUFFER_MAX,
                    "pre-connect buffer full, dropping oldest frame"
                );
            }
            self.buffer.push_back(raw);
            debug!(
                client_id = %self.client_id,
                buffered = self.buffer.len(),
                "no upstream connected, frame buffered"
            );
            return;
        }

        let msg = match RawOcppMessage::parse(&raw) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(client_id = %self.client_id, error = %e, "unparseable client frame dropped");
                return;
            }
        };

        if msg.kind == MessageKind::Call {
            self.notify.publish(Event::CallFromClient {
                client_id: self.client_id.clone(),
                frame: msg.raw.clone(),
            });
        }

        match self.router.route_from_client(&msg) {
            RouteDecision::Broadcast => {
                for link in &self.links {
                    if link.is_connected() && !link.send(&msg.raw) {
                        warn!(
                            client_id = %self.client_id,
                            upstream = %link.name(),
                            "fan-out send failed"
                        );
                    }
                }
            }
            RouteDecision::Direct(upstream) => {
                match self.links.iter().find(|l| l.name() == upstream) {
                    Some(link) => {
                        if !link.send(&msg.raw) {
                            warn!(
                                client_id = %self.client_id,
                                upstream = %upstream,
                                "reply could not be delivered, upstream link down"
                            );
                        }
                    }
                    None => warn!(
                        client_id = %self.client_id,
                        upstream = %upstream,
                        "reply addressed to unknown upstream"
                    ),
                }
            }
            RouteDecision::Drop => {}
        }
    }

    // ── Upstreams → client ─────────────────────────────────

    /// Returns `true` when the session should end.
    fn on_upstream_event(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::UpstreamConnected { index } => {
                let upstream = self.links[index].name().to_string();
                info!(client_id = %self.client_id, upstream = %upstream, "connected to upstream");
                self.notify.publish(Event::UpstreamConnected {
                    client_id: self.client_id.clone(),
                    upstream,
                });
                self.drain_buffer(index);
                false
            }
            SessionEvent::UpstreamFrame { index, raw } => {
                self.on_upstream_frame(index, raw);
                false
            }
            SessionEvent::UpstreamDisconnected { index } => {
                let upstream = self.links[index].name().to_string();
                info!(client_id = %self.client_id, upstream = %upstream, "disconnected from upstream");
                self.notify.publish(Event::UpstreamDisconnected {
                    client_id: self.client_id.clone(),
                    upstream,
                });
                self.end_if_all_upstreams_lost()
            }
            SessionEvent::UpstreamGaveUp { index } => {
                warn!(
                    client_id = %self.client_id,
                    upstream = %self.links[index].name(),
                    "upstream gave up reconnecting"
                );
                // A link that will never come up counts as quiescent for
                // the buffer rule.
                self.maybe_clear_buffer();
                self.end_if_all_upstreams_lost()
            }
        }
    }

    fn on_upstream_frame(&mut self, index: usize, raw: String) {
        let upstream = self.links[index].name().to_string();
        debug!(client_id = %self.client_id, upstream = %upstream, frame = %raw, "<- upstream");

        let msg = match RawOcppMessage::parse(&raw) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(
                    client_id = %self.client_id,
                    upstream = %upstream,
                    error = %e,
                    "unparseable upstream frame dropped"
                );
                return;
            }
        };

        match msg.kind {
            MessageKind::Call => {
                self.router.observe_from_upstream(&msg, &upstream);
                self.forward_to_client(msg.raw);
            }
            MessageKind::CallResult | MessageKind::CallError => {
                if self
                    .router
                    .should_forward_upstream_reply(&msg.unique_id, index == 0)
                {
                    self.forward_to_client(msg.raw);
                }
            }
        }
    }

    fn forward_to_client(&self, raw: String) {
        if self.client_tx.send(ClientCommand::Frame(raw)).is_err() {
            warn!(client_id = %self.client_id, "client writer gone, frame dropped");
        }
    }

    // ── Pre-connect buffer ─────────────────────────────────

    /// Deliver buffered frames to the link that just came up.
    ///
    /// The primary gets them through the normal client path so Calls are
    /// registered and fanned out to everything currently connected; a
    /// secondary gets them directly, since the primary was (or will be)
    /// served on its own connect.
    fn drain_buffer(&mut self, index: usize) {
        if !self.buffer.is_empty() {
            let frames: Vec<String> = self.buffer.iter().cloned().collect();
            if index == 0 {
                info!(
                    client_id = %self.client_id,
                    count = frames.len(),
                    "replaying buffered frames through the primary"
                );
                for raw in frames {
                    self.on_client_frame(raw);
                }
            } else {
                let link = &self.links[index];
                info!(
                    client_id = %self.client_id,
                    upstream = %link.name(),
                    count = frames.len(),
                    "delivering buffered frames to late upstream"
                );
                for raw in &frames {
                    link.send(raw);
                }
            }
        }
        self.maybe_clear_buffer();
    }

    /// Clear the buffer once no link can still come up and need it:
    /// every link is either connected or out of reconnection budget.
    fn maybe_clear_buffer(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let quiescent = self
            .links
            .iter()
            .all(|l| l.is_connected() || l.is_exhausted());
        if quiescent {
            debug!(
                client_id = %self.client_id,
                count = self.buffer.len(),
                "pre-connect buffer cleared"
            );
            self.buffer.clear();
        }
    }

    // ── Session survival ───────────────────────────────────

    /// The session dies when every upstream is down with no prospect of
    /// usefulness: already seen once (so this is an outage, not a slow
    /// boot) or out of reconnection budget.
    fn all_upstreams_lost(&self) -> bool {
        self.links
            .iter()
            .all(|l| !l.is_connected() && (l.has_ever_connected() || l.is_exhausted()))
    }

    fn end_if_all_upstreams_lost(&mut self) -> bool {
        if !self.all_upstreams_lost() {
            return false;
        }
        warn!(client_id = %self.client_id, "all upstream servers unavailable, closing client");
        self.close_client("All upstream servers unavailable");
        true
    }

    fn close_client(&self, reason: &str) {
        let _ = self.client_tx.send(ClientCommand::Close {
            code: CLOSE_GOING_AWAY,
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::EventSink;
    use tokio::sync::mpsc::error::TryRecvError;

    fn upstream_configs(count: usize) -> Vec<UpstreamConfig> {
        let mut configs = vec![UpstreamConfig {
            name: "PRI".into(),
            base_url: "ws://primary.example/".into(),
        }];
        if count > 1 {
            configs.push(UpstreamConfig {
                name: "SEC".into(),
                base_url: "ws://mirror.example/".into(),
            });
        }
        configs
    }

    fn make_session(
        upstream_count: usize,
    ) -> (
        Session,
        mpsc::UnboundedReceiver<SessionEvent>,
        mpsc::UnboundedReceiver<ClientCommand>,
    ) {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let ctx = SessionContext {
            client_id: "STATION01".into(),
            protocol: "ocpp1.6".into(),
            forwarded: ForwardedHeaders::default(),
        };
        let (session, events_rx) = Session::new(
            ctx,
            &upstream_configs(upstream_count),
            client_tx,
            EventSink::disabled(),
        );
        (session, events_rx, client_rx)
    }

    /// Put the link in the open state and return the capture side of its
    /// outbox, i.e. "frames this upstream would receive".
    fn open_link(session: &Session, index: usize) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        session.links[index].note_open(tx);
        rx
    }

    fn recv_frame(rx: &mut mpsc::UnboundedReceiver<ClientCommand>) -> Option<String> {
        match rx.try_recv() {
            Ok(ClientCommand::Frame(text)) => Some(text),
            _ => None,
        }
    }

    #[test]
    fn call_fans_out_to_all_connected_upstreams() {
        let (mut session, _events, _client) = make_session(2);
        let mut pri = open_link(&session, 0);
        let mut sec = open_link(&session, 1);

        let call = r#"[2,"m1","Heartbeat",{}]"#;
        session.on_client_frame(call.to_string());

        assert_eq!(pri.try_recv().unwrap(), call);
        assert_eq!(sec.try_recv().unwrap(), call);
        assert!(session.router.is_client_call("m1"));
    }

    #[test]
    fn call_skips_disconnected_upstreams() {
        let (mut session, _events, _client) = make_session(2);
        let mut pri = open_link(&session, 0);

        session.on_client_frame(r#"[2,"m1","Heartbeat",{}]"#.to_string());

        assert!(pri.try_recv().is_ok());
        // SEC was never open; nothing to assert there beyond no panic, and
        // the id is still registered for reply filtering.
        assert!(session.router.is_client_call("m1"));
    }

    #[test]
    fn only_primary_reply_reaches_client() {
        let (mut session, _events, mut client) = make_session(2);
        let _pri = open_link(&session, 0);
        let _sec = open_link(&session, 1);

        session.on_client_frame(r#"[2,"m1","Heartbeat",{}]"#.to_string());

        let primary_reply = r#"[3,"m1",{"currentTime":"T"}]"#;
        let mirror_reply = r#"[3,"m1",{"currentTime":"U"}]"#;

        session.on_upstream_frame(1, mirror_reply.to_string());
        assert!(recv_frame(&mut client).is_none());

        session.on_upstream_frame(0, primary_reply.to_string());
        assert_eq!(recv_frame(&mut client).unwrap(), primary_reply);

        // A second mirror reply is still filtered.
        session.on_upstream_frame(1, mirror_reply.to_string());
        assert!(recv_frame(&mut client).is_none());
    }

    #[test]
    fn upstream_call_and_client_reply_round_trip() {
        let (mut session, _events, mut client) = make_session(2);
        let mut pri = open_link(&session, 0);
        let mut sec = open_link(&session, 1);

        let server_call = r#"[2,"s9","RemoteStartTransaction",{"idTag":"TAG"}]"#;
        session.on_upstream_frame(1, server_call.to_string());
        assert_eq!(recv_frame(&mut client).unwrap(), server_call);

        let reply = r#"[3,"s9",{"status":"Accepted"}]"#;
        session.on_client_frame(reply.to_string());

        assert_eq!(sec.try_recv().unwrap(), reply);
        assert_eq!(pri.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(session.router.pending_server_call("s9"), None);
    }

    #[test]
    fn mirror_reply_to_unrelated_exchange_is_forwarded() {
        let (mut session, _events, mut client) = make_session(2);
        let _pri = open_link(&session, 0);
        let _sec = open_link(&session, 1);

        // No client call with this id: an upstream-initiated exchange the
        // proxy has no stake in.
        let reply = r#"[3,"x1",{"status":"Accepted"}]"#;
        session.on_upstream_frame(1, reply.to_string());
        assert_eq!(recv_frame(&mut client).unwrap(), reply);
    }

    #[test]
    fn unknown_client_reply_goes_nowhere() {
        let (mut session, _events, _client) = make_session(2);
        let mut pri = open_link(&session, 0);
        let mut sec = open_link(&session, 1);

        session.on_client_frame(r#"[3,"zz",{}]"#.to_string());
        assert_eq!(pri.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(sec.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn garbage_frames_are_dropped() {
        let (mut session, _events, mut client) = make_session(1);
        let mut pri = open_link(&session, 0);

        session.on_client_frame("not json".to_string());
        session.on_upstream_frame(0, "[]".to_string());

        assert_eq!(pri.try_recv(), Err(TryRecvError::Empty));
        assert!(recv_frame(&mut client).is_none());
    }

    #[test]
    fn frames_buffer_until_an_upstream_connects() {
        let (mut session, _events, _client) = make_session(2);

        session.on_client_frame(r#"[2,"b1","BootNotification",{}]"#.to_string());
        assert_eq!(session.buffer.len(), 1);
        // Not routed yet, so not registered yet either.
        assert!(!session.router.is_client_call("b1"));
    }

    #[test]
    fn buffer_drains_to_late_secondary_then_primary() {
        let (mut session, _events, _client) = make_session(2);
        let boot = r#"[2,"b1","BootNotification",{}]"#;
        session.on_client_frame(boot.to_string());

        // Mirror comes up first: it gets the frame directly, without
        // registration, and the buffer stays for the primary.
        let mut sec = open_link(&session, 1);
        assert!(!session.on_upstream_event(SessionEvent::UpstreamConnected { index: 1 }));
        assert_eq!(sec.try_recv().unwrap(), boot);
        assert!(!session.router.is_client_call("b1"));
        assert_eq!(session.buffer.len(), 1);

        // Primary comes up: replay through the normal path registers the
        // Call and fans out to every connected upstream.
        let mut pri = open_link(&session, 0);
        assert!(!session.on_upstream_event(SessionEvent::UpstreamConnected { index: 0 }));
        assert_eq!(pri.try_recv().unwrap(), boot);
        assert_eq!(sec.try_recv().unwrap(), boot);
        assert!(session.router.is_client_call("b1"));
        assert!(session.buffer.is_empty());
    }

    #[test]
    fn buffer_survives_while_a_link_may_still_come_up() {
        let (mut session, _events, _client) = make_session(2);
        session.on_client_frame(r#"[2,"b1","BootNotification",{}]"#.to_string());

        let _pri = open_link(&session, 0);
        session.on_upstream_event(SessionEvent::UpstreamConnected { index: 0 });

        // SEC is neither connected nor exhausted — the buffer must stay.
        assert_eq!(session.buffer.len(), 1);

        session.links[1].note_gave_up();
        session.on_upstream_event(SessionEvent::UpstreamGaveUp { index: 1 });
        assert!(session.buffer.is_empty());
    }

    #[test]
    fn buffer_drops_oldest_beyond_cap() {
        let (mut session, _events, _client) = make_session(1);
        for n in 0..PRE_CONNECT_BUFFER_MAX + 3 {
            session.on_client_frame(format!(r#"[2,"m{}","Heartbeat",{{}}]"#, n));
        }
        assert_eq!(session.buffer.len(), PRE_CONNECT_BUFFER_MAX);
        assert!(session.buffer.front().unwrap().contains("\"m3\""));
    }

    #[test]
    fn session_ends_when_all_upstreams_lost() {
        let (mut session, _events, mut client) = make_session(2);
        let _pri = open_link(&session, 0);
        let _sec = open_link(&session, 1);

        session.links[0].note_socket_closed();
        assert!(!session.on_upstream_event(SessionEvent::UpstreamDisconnected { index: 0 }));

        session.links[1].note_socket_closed();
        assert!(session.on_upstream_event(SessionEvent::UpstreamDisconnected { index: 1 }));

        match client.try_recv() {
            Ok(ClientCommand::Close { code, reason }) => {
                assert_eq!(code, CLOSE_GOING_AWAY);
                assert_eq!(reason, "All upstream servers unavailable");
            }
            other => panic!("expected close command, got {:?}", other),
        }
    }

    #[test]
    fn never_connected_link_with_budget_keeps_session_alive() {
        let (mut session, _events, _client) = make_session(2);
        let _pri = open_link(&session, 0);

        // SEC has never connected and still has attempts left.
        session.links[0].note_socket_closed();
        assert!(!session.on_upstream_event(SessionEvent::UpstreamDisconnected { index: 0 }));
    }

    #[test]
    fn exhausted_never_connected_link_counts_as_lost() {
        let (mut session, _events, mut client) = make_session(1);
        session.links[0].note_gave_up();
        assert!(session.on_upstream_event(SessionEvent::UpstreamGaveUp { index: 0 }));
        assert!(matches!(
            client.try_recv(),
            Ok(ClientCommand::Close { code: CLOSE_GOING_AWAY, .. })
        ));
    }

    #[test]
    fn teardown_closes_links_and_clears_state() {
        let (mut session, _events, _client) = make_session(2);
        session.on_client_frame(r#"[2,"b1","BootNotification",{}]"#.to_string());
        session.teardown();
        assert!(session.links.iter().all(|l| l.is_closed()));
        assert!(session.buffer.is_empty());
        assert!(!session.router.is_client_call("b1"));
        // Safe to call again mid-flight.
        session.teardown();
    }
}
