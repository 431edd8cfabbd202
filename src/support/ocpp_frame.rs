//! OCPP-J message framing
//!
//! The OCPP-J (JSON over WebSocket) transport envelope is a JSON array whose
//! first two positions are always `[<messageTypeId>, "<uniqueId>", …]`:
//!
//! - **Call**       `[2, "<uniqueId>", "<action>", {<payload>}]`
//! - **CallResult** `[3, "<uniqueId>", {<payload>}]`
//! - **CallError**  `[4, "<uniqueId>", "<errorCode>", "<errorDescription>", {<errorDetails>}]`
//!
//! The proxy only ever needs the two-element prefix to route a frame; bodies
//! are carried verbatim and never rewritten. `CallDetails` digs out the
//! action and payload of a Call for the alert layer, which is the one place
//! that inspects message bodies.

use serde_json::Value;
use thiserror::Error;

// ── Message-type constants ─────────────────────────────────────

const MSG_TYPE_CALL: u64 = 2;
const MSG_TYPE_CALL_RESULT: u64 = 3;
const MSG_TYPE_CALL_ERROR: u64 = 4;

// ── MessageKind ────────────────────────────────────────────────

/// The three OCPP-J message type ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `[2, …]` — a request
    Call,
    /// `[3, …]` — a success reply
    CallResult,
    /// `[4, …]` — a failure reply
    CallError,
}

impl MessageKind {
    fn from_type_id(id: u64) -> Option<Self> {
        match id {
            MSG_TYPE_CALL => Some(Self::Call),
            MSG_TYPE_CALL_RESULT => Some(Self::CallResult),
            MSG_TYPE_CALL_ERROR => Some(Self::CallError),
            _ => None,
        }
    }

    /// Returns `true` for the two reply kinds.
    pub fn is_reply(self) -> bool {
        matches!(self, Self::CallResult | Self::CallError)
    }
}

// ── RawOcppMessage ─────────────────────────────────────────────

/// A routable OCPP-J frame: the parsed `(type, id)` prefix plus the
/// untouched frame text to forward.
#[derive(Debug, Clone)]
pub struct RawOcppMessage {
    pub kind: MessageKind,
    pub unique_id: String,
    /// The frame exactly as received. Routed verbatim, never mutated.
    pub raw: String,
}

impl RawOcppMessage {
    /// Parse the routing prefix of a raw text frame.
    ///
    /// Accepts only a JSON array of length ≥ 2 whose first element is an
    /// integer in {2, 3, 4} and whose second element is a string. Anything
    /// else is a parse failure the caller logs and drops.
    pub fn parse(text: &str) -> Result<Self, OcppFrameError> {
        let arr: Vec<Value> =
            serde_json::from_str(text).map_err(|e| OcppFrameError::InvalidJson(e.to_string()))?;

        if arr.len() < 2 {
            return Err(OcppFrameError::TooShort(arr.len()));
        }

        let type_id = arr[0].as_u64().ok_or(OcppFrameError::InvalidMessageType)?;
        let kind =
            MessageKind::from_type_id(type_id).ok_or(OcppFrameError::UnknownMessageType(type_id))?;

        let unique_id = arr[1]
            .as_str()
            .ok_or(OcppFrameError::UniqueIdNotAString)?
            .to_string();

        Ok(Self {
            kind,
            unique_id,
            raw: text.to_string(),
        })
    }
}

// ── CallDetails ────────────────────────────────────────────────

/// Action and payload of a Call frame.
///
/// Only the alert dispatcher looks this deep; the routing path stops at
/// [`RawOcppMessage`].
#[derive(Debug, Clone)]
pub struct CallDetails {
    pub action: String,
    pub payload: Value,
}

impl CallDetails {
    /// Extract `(action, payload)` from a raw Call frame.
    pub fn parse(text: &str) -> Result<Self, OcppFrameError> {
        let arr: Vec<Value> =
            serde_json::from_str(text).map_err(|e| OcppFrameError::InvalidJson(e.to_string()))?;

        if arr.first().and_then(Value::as_u64) != Some(MSG_TYPE_CALL) {
            return Err(OcppFrameError::NotACall);
        }
        if arr.len() < 4 {
            return Err(OcppFrameError::TooShort(arr.len()));
        }

        let action = arr[2]
            .as_str()
            .ok_or(OcppFrameError::ActionNotAString)?
            .to_string();

        Ok(Self {
            action,
            payload: arr[3].clone(),
        })
    }
}

// ── Errors ─────────────────────────────────────────────────────

/// Ways a text frame can fail to be an OCPP-J message.
#[derive(Debug, Error)]
pub enum OcppFrameError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("array has {0} elements, need at least 2")]
    TooShort(usize),

    #[error("message type is not an integer")]
    InvalidMessageType,

    #[error("unknown message type {0}")]
    UnknownMessageType(u64),

    #[error("uniqueId is not a string")]
    UniqueIdNotAString,

    #[error("action is not a string")]
    ActionNotAString,

    #[error("not a Call frame")]
    NotACall,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_call() {
        let text = r#"[2,"m1","BootNotification",{"chargePointVendor":"Vendor"}]"#;
        let msg = RawOcppMessage::parse(text).unwrap();
        assert_eq!(msg.kind, MessageKind::Call);
        assert_eq!(msg.unique_id, "m1");
        assert_eq!(msg.raw, text);
    }

    #[test]
    fn parse_call_result() {
        let msg = RawOcppMessage::parse(r#"[3,"m1",{"currentTime":"2024-01-01T00:00:00Z"}]"#).unwrap();
        assert_eq!(msg.kind, MessageKind::CallResult);
        assert_eq!(msg.unique_id, "m1");
        assert!(msg.kind.is_reply());
    }

    #[test]
    fn parse_call_error() {
        let msg =
            RawOcppMessage::parse(r#"[4,"m1","NotImplemented","Action not supported",{}]"#).unwrap();
        assert_eq!(msg.kind, MessageKind::CallError);
        assert!(msg.kind.is_reply());
    }

    #[test]
    fn parse_accepts_bare_prefix() {
        // Routing needs only the two-element prefix; arity of the tail is
        // the endpoints' business.
        let msg = RawOcppMessage::parse(r#"[2,"m1"]"#).unwrap();
        assert_eq!(msg.kind, MessageKind::Call);
    }

    #[test]
    fn parse_rejects_non_json() {
        assert!(RawOcppMessage::parse("not json").is_err());
    }

    #[test]
    fn parse_rejects_non_array() {
        assert!(RawOcppMessage::parse(r#"{"type":2}"#).is_err());
    }

    #[test]
    fn parse_rejects_short_array() {
        assert!(RawOcppMessage::parse("[2]").is_err());
    }

    #[test]
    fn parse_rejects_unknown_type() {
        assert!(RawOcppMessage::parse(r#"[5,"m1"]"#).is_err());
        assert!(RawOcppMessage::parse(r#"[0,"m1"]"#).is_err());
    }

    #[test]
    fn parse_rejects_wrong_typed_head() {
        assert!(RawOcppMessage::parse(r#"["2","m1"]"#).is_err());
        assert!(RawOcppMessage::parse(r#"[2.5,"m1"]"#).is_err());
        assert!(RawOcppMessage::parse(r#"[2,42]"#).is_err());
    }

    #[test]
    fn call_details() {
        let details =
            CallDetails::parse(r#"[2,"m1","StatusNotification",{"connectorId":1,"status":"Charging"}]"#)
                .unwrap();
        assert_eq!(details.action, "StatusNotification");
        assert_eq!(details.payload["connectorId"], 1);
    }

    #[test]
    fn call_details_rejects_replies() {
        assert!(CallDetails::parse(r#"[3,"m1",{}]"#).is_err());
    }
}
