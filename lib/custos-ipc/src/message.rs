use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// A request that expects a response.
    Call,

    /// A message that expects no response.
    Cast,

    /// A successful response to a call.
    Response,

    /// A failed response to a call.
    Error,
}

/// A message envelope.
///
/// Calls carry a correlation identifier that is unique among the outstanding calls of a connection, and which is
/// echoed back in the matching response or error. Casts carry a correlation identifier of zero.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Kind of the message.
    pub kind: MessageKind,

    /// Correlation identifier.
    #[serde(rename = "correlationId", default)]
    pub correlation_id: u64,

    /// Payload.
    #[serde(default)]
    pub payload: Value,
}

impl Message {
    /// Creates a call.
    pub fn call(correlation_id: u64, payload: Value) -> Self {
        Self {
            kind: MessageKind::Call,
            correlation_id,
            payload,
        }
    }

    /// Creates a cast.
    pub fn cast(payload: Value) -> Self {
        Self {
            kind: MessageKind::Cast,
            correlation_id: 0,
            payload,
        }
    }

    /// Creates a successful response to the call with the given correlation identifier.
    pub fn response(correlation_id: u64, payload: Value) -> Self {
        Self {
            kind: MessageKind::Response,
            correlation_id,
            payload,
        }
    }

    /// Creates a failed response to the call with the given correlation identifier.
    ///
    /// The payload is the error message.
    pub fn error<E: fmt::Display>(correlation_id: u64, error: E) -> Self {
        Self {
            kind: MessageKind::Error,
            correlation_id,
            payload: Value::String(error.to_string()),
        }
    }

    /// Returns `true` if the message answers a call.
    pub fn is_reply(&self) -> bool {
        matches!(self.kind, MessageKind::Response | MessageKind::Error)
    }

    /// Returns `true` if the payload is the given reserved control payload.
    pub fn is_control(&self, control: &str) -> bool {
        self.payload.as_str() == Some(control)
    }
}

/// Reserved control payloads.
///
/// These are answered by the worker runtime itself and never reach the worker's own handlers.
pub mod control {
    /// Liveness probe, sent as a call.
    pub const PING: &str = "ping";

    /// Reply to a liveness probe.
    pub const PONG: &str = "pong";

    /// Readiness probe, sent as a call, and answered with a boolean.
    pub const READY: &str = "ready";

    /// Graceful shutdown request, sent as a cast.
    pub const SHUTDOWN: &str = "shutdown";
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn wire_field_names() {
        let message = Message::call(7, json!({"op": "increment"}));
        let encoded = serde_json::to_value(&message).unwrap();
        assert_eq!(
            encoded,
            json!({"kind": "call", "correlationId": 7, "payload": {"op": "increment"}})
        );

        let decoded: Message = serde_json::from_str(r#"{"kind": "cast", "payload": "shutdown"}"#).unwrap();
        assert_eq!(decoded, Message::cast(json!("shutdown")));
        assert!(decoded.is_control(control::SHUTDOWN));
        assert!(!decoded.is_reply());
    }

    #[test]
    fn error_payload_is_message() {
        let message = Message::error(3, "boom");
        assert_eq!(message.payload, json!("boom"));
        assert!(message.is_reply());
    }
}
