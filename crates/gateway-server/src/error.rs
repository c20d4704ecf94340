//! Gateway error taxonomy and its mapping onto wire `ErrorShape`s

use cp_core::device_auth::DeviceAuthError;
use cp_core::{ApprovalError, PairingError, TraceError};
use cp_protocol::{error_codes, ErrorShape, FrameError, ValidationError};
use serde_json::json;
use thiserror::Error;

/// WebSocket close codes used by the gateway
pub mod close_codes {
    pub const NORMAL: u16 = 1000;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const SERVICE_RESTART: u16 = 1012;
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("frame too large: {0}")]
    TooLarge(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("device is not paired (request {request_id})")]
    NotPaired { request_id: String, code: String },

    #[error("protocol mismatch: server supports {server_min}..={server_max}, client {client_min}..={client_max}")]
    ProtocolMismatch {
        server_min: u32,
        server_max: u32,
        client_min: u32,
        client_max: u32,
    },

    #[error("unknown method '{0}'")]
    MethodNotFound(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("unavailable: {message}")]
    Unavailable {
        message: String,
        retry_after_ms: Option<u64>,
    },

    /// Error reported by a peer (e.g. a node answering `node.invoke`)
    #[error("remote error {}: {}", .0.code, .0.message)]
    Remote(ErrorShape),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn code(&self) -> &str {
        match self {
            Self::Protocol(_) | Self::TooLarge(_) => error_codes::PROTOCOL_ERROR,
            Self::Auth(_) => error_codes::AUTH_FAILED,
            Self::NotPaired { .. } => error_codes::NOT_PAIRED,
            Self::ProtocolMismatch { .. } => error_codes::PROTOCOL_MISMATCH,
            Self::MethodNotFound(_) => error_codes::METHOD_NOT_FOUND,
            Self::Validation(_) => error_codes::INVALID_REQUEST,
            Self::Timeout(_) => error_codes::TIMEOUT,
            Self::ResourceExhausted(_) => error_codes::RESOURCE_EXHAUSTED,
            Self::Conflict(_) => error_codes::CONFLICT,
            Self::NotFound(_) => error_codes::NOT_FOUND,
            Self::Forbidden(_) => error_codes::FORBIDDEN,
            Self::Unavailable { .. } => error_codes::UNAVAILABLE,
            Self::Remote(shape) => &shape.code,
            Self::Internal(_) => error_codes::INTERNAL,
        }
    }

    /// Fatal classes close the connection instead of failing one request
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_)
                | Self::TooLarge(_)
                | Self::Auth(_)
                | Self::NotPaired { .. }
                | Self::ProtocolMismatch { .. }
                | Self::ResourceExhausted(_)
        )
    }

    pub fn close_code(&self) -> u16 {
        match self {
            Self::Protocol(_) => close_codes::PROTOCOL_ERROR,
            Self::TooLarge(_) => close_codes::MESSAGE_TOO_BIG,
            Self::Auth(_) | Self::NotPaired { .. } | Self::ProtocolMismatch { .. } => close_codes::POLICY_VIOLATION,
            Self::ResourceExhausted(_) => close_codes::POLICY_VIOLATION,
            Self::Internal(_) => close_codes::INTERNAL_ERROR,
            _ => close_codes::NORMAL,
        }
    }

    pub fn to_error_shape(&self) -> ErrorShape {
        if let Self::Remote(shape) = self {
            return shape.clone();
        }

        let shape = ErrorShape::new(self.code(), self.to_string());
        match self {
            Self::NotPaired { request_id, code } => shape.with_details(json!({
                "requestId": request_id,
                "code": code,
            })),
            Self::ProtocolMismatch {
                server_min,
                server_max,
                client_min,
                client_max,
            } => shape.with_details(json!({
                "serverMinProtocol": server_min,
                "serverMaxProtocol": server_max,
                "clientMinProtocol": client_min,
                "clientMaxProtocol": client_max,
            })),
            Self::Unavailable { retry_after_ms, .. } => shape.retry_after(*retry_after_ms),
            Self::Timeout(_) => shape.retry_after(None),
            _ => shape,
        }
    }
}

impl From<ValidationError> for GatewayError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<FrameError> for GatewayError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::TooLarge { .. } => Self::TooLarge(err.to_string()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<PairingError> for GatewayError {
    fn from(err: PairingError) -> Self {
        match err {
            PairingError::InvalidInput(message) => Self::Validation(message),
            PairingError::Unauthorized(message) => Self::Auth(message),
            PairingError::Forbidden(message) => Self::Forbidden(message),
            PairingError::NotFound(message) => Self::NotFound(message),
            PairingError::Conflict(message) => Self::Conflict(message),
            PairingError::Storage(message) => Self::Internal(message),
        }
    }
}

impl From<ApprovalError> for GatewayError {
    fn from(err: ApprovalError) -> Self {
        match err {
            ApprovalError::InvalidInput(message) => Self::Validation(message),
            ApprovalError::NotFound(message) => Self::NotFound(message),
            ApprovalError::Conflict(message) => Self::Conflict(message),
            ApprovalError::Storage(message) => Self::Internal(message),
        }
    }
}

impl From<TraceError> for GatewayError {
    fn from(err: TraceError) -> Self {
        match err {
            TraceError::InvalidInput(message) => Self::Validation(message),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<DeviceAuthError> for GatewayError {
    fn from(err: DeviceAuthError) -> Self {
        Self::Auth(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_scoped_errors_keep_the_connection() {
        assert!(!GatewayError::Validation("bad".into()).is_connection_fatal());
        assert!(!GatewayError::Conflict("again".into()).is_connection_fatal());
        assert!(!GatewayError::MethodNotFound("x".into()).is_connection_fatal());
        assert!(GatewayError::Protocol("junk".into()).is_connection_fatal());
        assert!(GatewayError::ResourceExhausted("slow".into()).is_connection_fatal());
    }

    #[test]
    fn unavailable_is_retryable_with_hint() {
        let shape = GatewayError::Unavailable {
            message: "no backend".into(),
            retry_after_ms: Some(5_000),
        }
        .to_error_shape();
        assert_eq!(shape.code, error_codes::UNAVAILABLE);
        assert_eq!(shape.retryable, Some(true));
        assert_eq!(shape.retry_after_ms, Some(5_000));
    }

    #[test]
    fn not_paired_carries_request_details() {
        let shape = GatewayError::NotPaired {
            request_id: "req-1".into(),
            code: "ABC123".into(),
        }
        .to_error_shape();
        assert_eq!(shape.code, error_codes::NOT_PAIRED);
        let details = shape.details.unwrap();
        assert_eq!(details["requestId"], "req-1");
        assert_eq!(details["code"], "ABC123");
    }

    #[test]
    fn store_errors_map_onto_wire_codes() {
        let err: GatewayError = PairingError::Conflict("resolved".into()).into();
        assert_eq!(err.code(), error_codes::CONFLICT);
        let err: GatewayError = ApprovalError::NotFound("a1".into()).into();
        assert_eq!(err.code(), error_codes::NOT_FOUND);
        let err: GatewayError = FrameError::TooLarge { size: 10, max: 5 }.into();
        assert_eq!(err.close_code(), close_codes::MESSAGE_TOO_BIG);
    }
}
