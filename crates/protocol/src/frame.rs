//! Top-level frame envelope

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::{non_empty, Validate, ValidationError};
use crate::snapshot::StateVersion;

/// Gateway frame - discriminated by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayFrame {
    #[serde(rename = "req")]
    Request(RequestFrame),
    #[serde(rename = "res")]
    Response(ResponseFrame),
    #[serde(rename = "event")]
    Event(EventFrame),
}

impl GatewayFrame {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Request(_) => "req",
            Self::Response(_) => "res",
            Self::Event(_) => "event",
        }
    }
}

/// Request frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RequestFrame {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

impl Validate for RequestFrame {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("id", &self.id)?;
        non_empty("method", &self.method)
    }
}

/// Response frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    /// Create a success response
    pub fn success(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    /// Create an error response
    pub fn failure(id: impl Into<String>, error: ErrorShape) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }
}

impl Validate for ResponseFrame {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("id", &self.id)?;
        if let Some(error) = &self.error {
            error.validate().map_err(|err| err.within("error"))?;
        }
        Ok(())
    }
}

/// Event frame pushed by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EventFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_version: Option<StateVersion>,
}

impl EventFrame {
    /// Create an unsequenced event (only used before the handshake completes)
    pub fn unsequenced(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload: Some(payload),
            seq: None,
            state_version: None,
        }
    }
}

impl Validate for EventFrame {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("event", &self.event)
    }
}

/// Error carried in a failed response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: None,
            retry_after_ms: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn retry_after(mut self, retry_after_ms: Option<u64>) -> Self {
        self.retryable = Some(true);
        self.retry_after_ms = retry_after_ms;
        self
    }
}

impl Validate for ErrorShape {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("code", &self.code)?;
        non_empty("message", &self.message)
    }
}

/// `tick` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TickEvent {
    pub ts: u64,
}

impl Validate for TickEvent {}

/// `shutdown` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ShutdownEvent {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_expected_ms: Option<u64>,
}

impl Validate for ShutdownEvent {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("reason", &self.reason)
    }
}

/// Wire error codes
pub mod error_codes {
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const NOT_PAIRED: &str = "NOT_PAIRED";
    pub const PROTOCOL_MISMATCH: &str = "PROTOCOL_MISMATCH";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const CONFLICT: &str = "CONFLICT";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const RESOURCE_EXHAUSTED: &str = "RESOURCE_EXHAUSTED";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
    pub const INTERNAL: &str = "INTERNAL";
}

/// Event names
pub mod events {
    pub const CONNECT_CHALLENGE: &str = "connect.challenge";
    pub const TICK: &str = "tick";
    pub const SHUTDOWN: &str = "shutdown";
    pub const PRESENCE: &str = "presence";
    pub const HEALTH: &str = "health";
    pub const AGENT: &str = "agent";
    pub const DEVICE_PAIR_REQUESTED: &str = "device.pair.requested";
    pub const DEVICE_PAIR_RESOLVED: &str = "device.pair.resolved";
    pub const NODE_PAIR_REQUESTED: &str = "node.pair.requested";
    pub const NODE_PAIR_RESOLVED: &str = "node.pair.resolved";
    pub const EXEC_APPROVAL_REQUESTED: &str = "exec.approval.requested";
    pub const EXEC_APPROVAL_RESOLVED: &str = "exec.approval.resolved";

    /// Every event the server may push, advertised in `hello-ok`.
    pub const ALL: [&str; 12] = [
        CONNECT_CHALLENGE,
        TICK,
        SHUTDOWN,
        PRESENCE,
        HEALTH,
        AGENT,
        DEVICE_PAIR_REQUESTED,
        DEVICE_PAIR_RESOLVED,
        NODE_PAIR_REQUESTED,
        NODE_PAIR_RESOLVED,
        EXEC_APPROVAL_REQUESTED,
        EXEC_APPROVAL_RESOLVED,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_frame_serializes_with_discriminator() {
        let frame = GatewayFrame::Request(RequestFrame::new(
            "1",
            "sessions.list",
            Some(json!({ "limit": 5 })),
        ));

        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"req\""));
        assert!(json.contains("\"method\":\"sessions.list\""));
    }

    #[test]
    fn failure_response_carries_retry_hints() {
        let shape = ErrorShape::new(error_codes::UNAVAILABLE, "busy").retry_after(Some(250));
        let frame = ResponseFrame::failure("7", shape);

        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["ok"], json!(false));
        assert_eq!(value["error"]["retryable"], json!(true));
        assert_eq!(value["error"]["retryAfterMs"], json!(250));
        assert!(value.get("payload").is_none());
    }
}
