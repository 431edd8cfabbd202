//! Message routing and correlation
//!
//! One `Router` per session. Two tables drive every decision:
//!
//! - `client_calls` — ids of Calls the charge point has sent. Entries are
//!   kept until the session ends: the mirror may reply late or more than
//!   once, and those replies must keep being filtered out.
//! - `server_calls` — id → upstream name for Calls an upstream sent toward
//!   the charge point. Removed on the first matching client reply.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::support::ocpp_frame::{MessageKind, RawOcppMessage};

/// Where a client-originated frame should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Send to every currently-connected upstream.
    Broadcast,
    /// Send to the named upstream only.
    Direct(String),
    /// Discard; the router has already logged why.
    Drop,
}

/// Correlation engine for one session.
#[derive(Debug, Default)]
pub struct Router {
    client_calls: HashSet<String>,
    server_calls: HashMap<String, String>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide where a charge point frame goes.
    ///
    /// Calls are registered in `client_calls` *before* the broadcast
    /// decision is returned, so a reply arriving on any upstream sees a
    /// consistent table. Replies are matched against `server_calls` and
    /// consume the entry.
    pub fn route_from_client(&mut self, msg: &RawOcppMessage) -> RouteDecision {
        match msg.kind {
            MessageKind::Call => {
                self.register_client_call(&msg.unique_id);
                RouteDecision::Broadcast
            }
            MessageKind::CallResult | MessageKind::CallError => {
                match self.server_calls.remove(&msg.unique_id) {
                    Some(upstream) => RouteDecision::Direct(upstream),
                    None => {
                        warn!(
                            unique_id = %msg.unique_id,
                            "client reply matches no pending upstream request, dropping"
                        );
                        RouteDecision::Drop
                    }
                }
            }
        }
    }

    /// Record a charge point Call so upstream replies to it can be
    /// recognized for the rest of the session.
    pub fn register_client_call(&mut self, unique_id: &str) {
        self.client_calls.insert(unique_id.to_string());
    }

    /// Bookkeeping for a frame received from the named upstream.
    ///
    /// Only upstream Calls leave a trace: the reply the charge point sends
    /// later must be routed back to the upstream that asked.
    pub fn observe_from_upstream(&mut self, msg: &RawOcppMessage, upstream: &str) {
        if msg.kind == MessageKind::Call {
            if let Some(previous) = self
                .server_calls
                .insert(msg.unique_id.clone(), upstream.to_string())
            {
                // Two upstreams picked the same id; the earlier exchange is
                // now unroutable.
                warn!(
                    unique_id = %msg.unique_id,
                    previous_upstream = %previous,
                    upstream,
                    "colliding upstream request id overwrites earlier entry"
                );
            }
        }
    }

    /// Should an upstream reply with this id reach the charge point?
    ///
    /// Replies to ids the proxy never fanned out always pass (an
    /// upstream-initiated exchange). Replies to fanned-out Calls pass only
    /// from the primary; the entry stays so the mirror keeps being filtered.
    pub fn should_forward_upstream_reply(&self, unique_id: &str, from_primary: bool) -> bool {
        if !self.client_calls.contains(unique_id) {
            return true;
        }
        if from_primary {
            return true;
        }
        debug!(unique_id, "reply from mirror to a fanned-out request, dropping");
        false
    }

    /// Whether the id belongs to a Call the charge point sent.
    pub fn is_client_call(&self, unique_id: &str) -> bool {
        self.client_calls.contains(unique_id)
    }

    /// Upstream waiting for the client's reply to `unique_id`, if any.
    pub fn pending_server_call(&self, unique_id: &str) -> Option<&str> {
        self.server_calls.get(unique_id).map(String::as_str)
    }

    /// Empty both tables. Called at session teardown.
    pub fn clear(&mut self) {
        self.client_calls.clear();
        self.server_calls.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str) -> RawOcppMessage {
        RawOcppMessage::parse(&format!(r#"[2,"{}","Heartbeat",{{}}]"#, id)).unwrap()
    }

    fn result(id: &str) -> RawOcppMessage {
        RawOcppMessage::parse(&format!(r#"[3,"{}",{{}}]"#, id)).unwrap()
    }

    fn error(id: &str) -> RawOcppMessage {
        RawOcppMessage::parse(&format!(r#"[4,"{}","GenericError","",{{}}]"#, id)).unwrap()
    }

    #[test]
    fn client_call_broadcasts_and_registers() {
        let mut router = Router::new();
        assert_eq!(router.route_from_client(&call("m1")), RouteDecision::Broadcast);
        assert!(router.is_client_call("m1"));
    }

    #[test]
    fn client_reply_routes_to_asking_upstream_once() {
        let mut router = Router::new();
        router.observe_from_upstream(&call("s9"), "SEC");
        assert_eq!(
            router.route_from_client(&result("s9")),
            RouteDecision::Direct("SEC".into())
        );
        // One-shot: the entry is consumed.
        assert_eq!(router.pending_server_call("s9"), None);
        assert_eq!(router.route_from_client(&result("s9")), RouteDecision::Drop);
    }

    #[test]
    fn client_call_error_reply_also_routes() {
        let mut router = Router::new();
        router.observe_from_upstream(&call("s1"), "PRI");
        assert_eq!(
            router.route_from_client(&error("s1")),
            RouteDecision::Direct("PRI".into())
        );
    }

    #[test]
    fn unknown_client_reply_drops() {
        let mut router = Router::new();
        assert_eq!(router.route_from_client(&result("nope")), RouteDecision::Drop);
    }

    #[test]
    fn primary_reply_forwards_and_retains_entry() {
        let mut router = Router::new();
        router.route_from_client(&call("m1"));
        assert!(router.should_forward_upstream_reply("m1", true));
        // The id stays registered: the mirror's late reply is still filtered.
        assert!(router.is_client_call("m1"));
        assert!(!router.should_forward_upstream_reply("m1", false));
        assert!(!router.should_forward_upstream_reply("m1", false));
    }

    #[test]
    fn unrelated_upstream_reply_forwards() {
        let router = Router::new();
        // No client call with this id — an upstream-initiated exchange.
        assert!(router.should_forward_upstream_reply("x1", false));
    }

    #[test]
    fn upstream_replies_leave_no_trace() {
        let mut router = Router::new();
        router.observe_from_upstream(&result("r1"), "PRI");
        assert_eq!(router.pending_server_call("r1"), None);
    }

    #[test]
    fn colliding_server_call_ids_overwrite() {
        let mut router = Router::new();
        router.observe_from_upstream(&call("dup"), "PRI");
        router.observe_from_upstream(&call("dup"), "SEC");
        assert_eq!(router.pending_server_call("dup"), Some("SEC"));
        // The earlier exchange is misrouted to the later upstream.
        assert_eq!(
            router.route_from_client(&result("dup")),
            RouteDecision::Direct("SEC".into())
        );
    }

    #[test]
    fn clear_empties_both_tables() {
        let mut router = Router::new();
        router.route_from_client(&call("m1"));
        router.observe_from_upstream(&call("s1"), "PRI");
        router.clear();
        assert!(!router.is_client_call("m1"));
        assert_eq!(router.pending_server_call("s1"), None);
        // After clear, a mirror reply to m1 would pass again — tables are gone.
        assert!(router.should_forward_upstream_reply("m1", false));
    }
}
