//! Closed-schema registry
//!
//! Each logical schema name maps to a check that deserializes a JSON value into
//! its Rust type (unknown properties rejected by `deny_unknown_fields`) and
//! then runs the type's semantic `Validate` rules. The serde type is the single
//! source of truth for both the static shape and runtime validation.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::frame::{ErrorShape, EventFrame, RequestFrame, ResponseFrame, ShutdownEvent, TickEvent};
use crate::handshake::{ConnectParams, HelloOk};
use crate::methods::*;
use crate::snapshot::{PresenceEntry, Snapshot};

/// A value did not match its schema
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", render(.path, .message))]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Prefix the path with an enclosing field
    pub fn within(mut self, parent: &str) -> Self {
        self.path = if self.path.is_empty() {
            parent.to_string()
        } else {
            format!("{}.{}", parent, self.path)
        };
        self
    }
}

fn render(path: &str, message: &str) -> String {
    if path.is_empty() {
        message.to_string()
    } else {
        format!("{}: {}", path, message)
    }
}

/// Semantic rules serde cannot express (non-empty strings, ranges).
pub trait Validate {
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

pub(crate) fn non_empty(path: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new(path, "must be a non-empty string"));
    }
    Ok(())
}

pub(crate) fn non_empty_opt(path: &str, value: Option<&str>) -> Result<(), ValidationError> {
    match value {
        Some(value) => non_empty(path, value),
        None => Ok(()),
    }
}

pub(crate) fn non_empty_all(path: &str, values: Option<&[String]>) -> Result<(), ValidationError> {
    for (index, value) in values.unwrap_or_default().iter().enumerate() {
        non_empty(&format!("{}[{}]", path, index), value)?;
    }
    Ok(())
}

/// Deserialize + validate params for a method. Absent or `null` params are
/// treated as an empty object so all-optional schemas accept them.
pub fn parse_params<T>(params: Option<Value>) -> Result<T, ValidationError>
where
    T: DeserializeOwned + Validate,
{
    let value = match params {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(value) => value,
    };
    let parsed: T = serde_json::from_value(value).map_err(|err| ValidationError::new("", err.to_string()))?;
    parsed.validate()?;
    Ok(parsed)
}

type SchemaCheck = fn(&Value) -> Result<(), ValidationError>;

fn check<T>(value: &Value) -> Result<(), ValidationError>
where
    T: DeserializeOwned + Validate,
{
    let parsed: T = serde::Deserialize::deserialize(value).map_err(|err| ValidationError::new("", err.to_string()))?;
    parsed.validate()
}

/// Register each type under its own name
macro_rules! register_schemas {
    ($registry:ident; $($schema:ident),* $(,)?) => {
        $( $registry.register::<$schema>(stringify!($schema)); )*
    };
}

/// Logical schema name -> validator
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<&'static str, SchemaCheck>,
}

impl SchemaRegistry {
    /// Registry with every schema the protocol defines
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        register_schemas!(registry;
            RequestFrame, ResponseFrame, EventFrame, ErrorShape, ConnectParams, HelloOk, Snapshot,
            PresenceEntry, TickEvent, ShutdownEvent,
            EmptyParams, HealthResult, StatusResult, SnapshotGetResult,
            NodePairRequestParams, PairRequestResult, PairListResult, PairResolveParams, PairApproveResult,
            PairRejectResult, PairVerifyParams, PairVerifyResult, DeviceTokenRotateParams,
            DeviceTokenRevokeParams, IssuedToken, DeviceTokenRevokeResult, PairRequestedEvent, PairResolvedEvent,
            NodeListResult, NodeInvokeParams, NodeInvokeResult, NodeEventParams,
            ExecApprovalsSetParams, ExecApprovalsSnapshot, ExecApprovalsNodeGetParams, ExecApprovalsNodeSetParams,
            ExecApprovalsNodeSnapshot, ExecApprovalRequestParams, ExecApprovalResolveParams, ExecApprovalRequest,
            ExecApprovalResolveResult,
            TraceRunsListParams, TraceRunsListResult, TraceRunGetParams, TraceRunGetResult,
            ConfigSetParams, SessionsListParams, SessionKeyParams, CronListParams, CronAddParams,
            CronJobRefParams, AgentParams, AgentWaitParams, ChatSendParams, ChatAbortParams,
        );
        registry.register::<AgentEventPayload>("AgentEvent");
        registry
    }

    pub fn register<T>(&mut self, name: &'static str)
    where
        T: DeserializeOwned + Validate,
    {
        self.schemas.insert(name, check::<T>);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.schemas.keys().copied()
    }

    /// Validate `value` against the named schema
    pub fn validate(&self, name: &str, value: &Value) -> Result<(), ValidationError> {
        let check = self
            .schemas
            .get(name)
            .ok_or_else(|| ValidationError::new("", format!("unknown schema '{}'", name)))?;
        check(value)
    }
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("schemas", &self.schemas.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_unknown_properties() {
        let registry = SchemaRegistry::builtin();
        let err = registry
            .validate("PairResolveParams", &json!({ "requestId": "r1", "extra": true }))
            .unwrap_err();
        assert!(err.message.contains("unknown field"));
    }

    #[test]
    fn rejects_blank_required_strings() {
        let registry = SchemaRegistry::builtin();
        let err = registry
            .validate("PairResolveParams", &json!({ "requestId": "  " }))
            .unwrap_err();
        assert_eq!(err.path, "requestId");
    }

    #[test]
    fn empty_params_accept_missing_and_null() {
        let parsed: TraceRunsListParams = parse_params(None).unwrap();
        assert!(parsed.limit.is_none());
        let parsed: EmptyParams = parse_params(Some(Value::Null)).unwrap();
        let _ = parsed;
        assert!(parse_params::<EmptyParams>(Some(json!({ "x": 1 }))).is_err());
    }

    #[test]
    fn errors_render_with_their_path() {
        assert_eq!(ValidationError::new("", "bad").to_string(), "bad");
        let nested = ValidationError::new("code", "must be a non-empty string").within("error");
        assert_eq!(nested.to_string(), "error.code: must be a non-empty string");
    }

    #[test]
    fn unknown_schema_is_an_error() {
        let registry = SchemaRegistry::builtin();
        assert!(registry.validate("NoSuchSchema", &json!({})).is_err());
        assert!(registry.contains("ConnectParams"));
    }
}
