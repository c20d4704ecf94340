//! Frame codec
//!
//! `decode` dispatches on the `type` discriminator first, then deserializes the
//! remaining fields into the closed struct for that variant and runs its
//! semantic checks. Any failure is a [`FrameError`], which the connection layer
//! treats as connection-fatal.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::frame::{EventFrame, GatewayFrame, RequestFrame, ResponseFrame};
use crate::schema::{Validate, ValidationError};

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame exceeds max payload ({size} > {max} bytes)")]
    TooLarge { size: usize, max: usize },
    #[error("malformed JSON: {0}")]
    Malformed(String),
    #[error("frame must be a JSON object")]
    NotAnObject,
    #[error("frame is missing the `type` discriminator")]
    MissingType,
    #[error("unknown frame type '{0}'")]
    UnknownType(String),
    #[error("invalid {frame_type} frame: {error}")]
    Invalid {
        frame_type: &'static str,
        id: Option<String>,
        error: ValidationError,
    },
}

impl FrameError {
    /// Request/response id recovered from the rejected frame, if any
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Invalid { id, .. } => id.as_deref(),
            _ => None,
        }
    }
}

/// Decode one text message, enforcing `max_payload` first
pub fn decode_bounded(text: &str, max_payload: usize) -> Result<GatewayFrame, FrameError> {
    if text.len() > max_payload {
        return Err(FrameError::TooLarge {
            size: text.len(),
            max: max_payload,
        });
    }
    decode(text)
}

/// Decode one text message into a validated frame
pub fn decode(text: &str) -> Result<GatewayFrame, FrameError> {
    let value: Value = serde_json::from_str(text).map_err(|err| FrameError::Malformed(err.to_string()))?;
    decode_value(value)
}

/// Decode an already-parsed JSON value into a validated frame
pub fn decode_value(value: Value) -> Result<GatewayFrame, FrameError> {
    let Value::Object(mut fields) = value else {
        return Err(FrameError::NotAnObject);
    };

    let frame_type = match fields.remove("type") {
        Some(Value::String(frame_type)) => frame_type,
        Some(_) | None => return Err(FrameError::MissingType),
    };

    let id = fields.get("id").and_then(Value::as_str).map(str::to_string);

    match frame_type.as_str() {
        "req" => variant::<RequestFrame>("req", id, fields).map(GatewayFrame::Request),
        "res" => variant::<ResponseFrame>("res", id, fields).map(GatewayFrame::Response),
        "event" => variant::<EventFrame>("event", id, fields).map(GatewayFrame::Event),
        _ => Err(FrameError::UnknownType(frame_type)),
    }
}

fn variant<T>(frame_type: &'static str, id: Option<String>, fields: Map<String, Value>) -> Result<T, FrameError>
where
    T: DeserializeOwned + Validate,
{
    let invalid = |error: ValidationError| FrameError::Invalid {
        frame_type,
        id: id.clone(),
        error,
    };

    let frame: T = serde_json::from_value(Value::Object(fields))
        .map_err(|err| invalid(ValidationError::new("", err.to_string())))?;
    frame.validate().map_err(invalid)?;
    Ok(frame)
}

/// Encode a frame as one JSON text message
pub fn encode(frame: &GatewayFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ErrorShape;
    use crate::snapshot::StateVersion;
    use serde_json::json;

    fn roundtrip(frame: GatewayFrame) {
        let text = encode(&frame).unwrap();
        let decoded = decode(&text).unwrap();
        assert_eq!(decoded, frame);
        let original: Value = serde_json::from_str(&text).unwrap();
        let reencoded: Value = serde_json::from_str(&encode(&decoded).unwrap()).unwrap();
        assert_eq!(original, reencoded);
    }

    #[test]
    fn every_variant_survives_encode_decode() {
        roundtrip(GatewayFrame::Request(RequestFrame::new(
            "r-1",
            "trace.runs.list",
            Some(json!({ "limit": 3 })),
        )));
        roundtrip(GatewayFrame::Response(ResponseFrame::success("r-1", json!({ "runs": [] }))));
        roundtrip(GatewayFrame::Response(ResponseFrame::failure(
            "r-2",
            ErrorShape::new("CONFLICT", "already resolved").with_details(json!({ "id": "a" })),
        )));
        roundtrip(GatewayFrame::Event(EventFrame {
            event: "presence".into(),
            payload: Some(json!({ "presence": [] })),
            seq: Some(4),
            state_version: Some(StateVersion(9)),
        }));
    }

    #[test]
    fn rejects_unknown_type_before_deep_validation() {
        let err = decode(r#"{"type":"ping","whatever":1}"#).unwrap_err();
        assert!(matches!(err, FrameError::UnknownType(t) if t == "ping"));
        assert!(matches!(decode(r#"{"id":"1"}"#).unwrap_err(), FrameError::MissingType));
        assert!(matches!(decode("[1,2]").unwrap_err(), FrameError::NotAnObject));
        assert!(matches!(decode("{not json").unwrap_err(), FrameError::Malformed(_)));
    }

    #[test]
    fn rejects_extra_fields_and_keeps_the_id() {
        let err = decode(r#"{"type":"req","id":"9","method":"health","bogus":true}"#).unwrap_err();
        assert_eq!(err.id(), Some("9"));
        assert!(matches!(err, FrameError::Invalid { frame_type: "req", .. }));
    }

    #[test]
    fn rejects_blank_method() {
        let err = decode(r#"{"type":"req","id":"9","method":" "}"#).unwrap_err();
        match err {
            FrameError::Invalid { error, .. } => assert_eq!(error.path, "method"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn enforces_max_payload() {
        let text = r#"{"type":"req","id":"1","method":"health"}"#;
        assert!(decode_bounded(text, 8).is_err());
        assert!(decode_bounded(text, 1024).is_ok());
    }
}
