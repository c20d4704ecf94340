//! RPC params/result payloads and server-pushed event payloads

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::{non_empty, non_empty_all, non_empty_opt, Validate, ValidationError};
use crate::snapshot::{Snapshot, StateVersion};

fn in_range(path: &str, value: Option<u64>, min: u64, max: u64) -> Result<(), ValidationError> {
    match value {
        Some(value) if value < min || value > max => Err(ValidationError::new(
            path,
            format!("must be between {} and {}", min, max),
        )),
        _ => Ok(()),
    }
}

/// Methods that take no params
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmptyParams {}

impl Validate for EmptyParams {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HealthResult {
    pub ok: bool,
    pub ts: u64,
    pub uptime_ms: u64,
    pub connections: usize,
    pub state_version: StateVersion,
}

impl Validate for HealthResult {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StatusResult {
    pub version: String,
    pub protocol: u32,
    pub uptime_ms: u64,
    pub connections: usize,
    pub nodes: usize,
    pub state_version: StateVersion,
    pub pending_device_pairings: usize,
    pub pending_node_pairings: usize,
    pub pending_approvals: usize,
}

impl Validate for StatusResult {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotGetResult {
    pub snapshot: Snapshot,
}

impl Validate for SnapshotGetResult {
    fn validate(&self) -> Result<(), ValidationError> {
        self.snapshot.validate().map_err(|err| err.within("snapshot"))
    }
}

// ---------------------------------------------------------------------------
// Pairing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingStatus {
    Pending,
    Approved,
    Rejected,
}

/// A device or node asking to be trusted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PairingRequest {
    pub request_id: String,
    pub identity_id: String,
    pub public_key: String,
    pub code: String,
    pub role: String,
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caps: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    pub status: PairingStatus,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
}

impl Validate for PairingRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("requestId", &self.request_id)?;
        non_empty("identityId", &self.identity_id)?;
        non_empty("publicKey", &self.public_key)
    }
}

/// An approved device or node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PairedIdentity {
    pub identity_id: String,
    pub public_key: String,
    pub role: String,
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    pub approved_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NodePairRequestParams {
    pub node_id: String,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caps: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub silent: Option<bool>,
}

impl Validate for NodePairRequestParams {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("nodeId", &self.node_id)?;
        non_empty("publicKey", &self.public_key)?;
        non_empty_opt("displayName", self.display_name.as_deref())?;
        non_empty_opt("platform", self.platform.as_deref())?;
        non_empty_opt("version", self.version.as_deref())?;
        non_empty_opt("remoteIp", self.remote_ip.as_deref())?;
        non_empty_all("caps", self.caps.as_deref())?;
        non_empty_all("commands", self.commands.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PairRequestResult {
    pub request: PairingRequest,
    pub created: bool,
}

impl Validate for PairRequestResult {
    fn validate(&self) -> Result<(), ValidationError> {
        self.request.validate().map_err(|err| err.within("request"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PairListResult {
    pub pending: Vec<PairingRequest>,
    pub paired: Vec<PairedIdentity>,
}

impl Validate for PairListResult {}

/// `*.pair.approve` / `*.pair.reject`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PairResolveParams {
    pub request_id: String,
}

impl Validate for PairResolveParams {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("requestId", &self.request_id)
    }
}

/// A scoped token minted for a paired identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IssuedToken {
    pub identity_id: String,
    pub token: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub issued_at_ms: u64,
    pub expires_at_ms: u64,
}

impl Validate for IssuedToken {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("identityId", &self.identity_id)?;
        non_empty("token", &self.token)?;
        non_empty("role", &self.role)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PairApproveResult {
    pub request: PairingRequest,
    pub token: IssuedToken,
}

impl Validate for PairApproveResult {
    fn validate(&self) -> Result<(), ValidationError> {
        self.request.validate().map_err(|err| err.within("request"))?;
        self.token.validate().map_err(|err| err.within("token"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PairRejectResult {
    pub request: PairingRequest,
}

impl Validate for PairRejectResult {}

/// Proof of continued key possession: an Ed25519 signature over
/// `pair-verify|<requestId>|<code>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PairVerifyParams {
    pub request_id: String,
    pub signature: String,
}

impl Validate for PairVerifyParams {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("requestId", &self.request_id)?;
        non_empty("signature", &self.signature)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PairVerifyResult {
    pub identity_id: String,
    pub verified_at_ms: u64,
}

impl Validate for PairVerifyResult {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeviceTokenRotateParams {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
}

impl Validate for DeviceTokenRotateParams {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("deviceId", &self.device_id)?;
        non_empty_opt("role", self.role.as_deref())?;
        non_empty_all("scopes", self.scopes.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeviceTokenRevokeParams {
    pub device_id: String,
}

impl Validate for DeviceTokenRevokeParams {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("deviceId", &self.device_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeviceTokenRevokeResult {
    pub identity_id: String,
    pub revoked_at_ms: u64,
}

impl Validate for DeviceTokenRevokeResult {}

/// `device.pair.requested` / `node.pair.requested`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PairRequestedEvent {
    pub request: PairingRequest,
}

impl Validate for PairRequestedEvent {}

/// `device.pair.resolved` / `node.pair.resolved`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PairResolvedEvent {
    pub request_id: String,
    pub identity_id: String,
    pub status: PairingStatus,
    pub ts: u64,
}

impl Validate for PairResolvedEvent {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.status == PairingStatus::Pending {
            return Err(ValidationError::new("status", "must be approved or rejected"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NodeSummary {
    pub node_id: String,
    pub conn_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub platform: String,
    pub version: String,
    pub caps: Vec<String>,
    pub commands: Vec<String>,
    pub paired: bool,
    pub connected_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeListResult {
    pub nodes: Vec<NodeSummary>,
}

impl Validate for NodeListResult {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NodeInvokeParams {
    pub node_id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub idempotency_key: String,
}

impl Validate for NodeInvokeParams {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("nodeId", &self.node_id)?;
        non_empty("command", &self.command)?;
        non_empty("idempotencyKey", &self.idempotency_key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NodeInvokeResult {
    pub node_id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Validate for NodeInvokeResult {}

/// Event a node forwards into the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeEventParams {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(rename = "payloadJSON", default, skip_serializing_if = "Option::is_none")]
    pub payload_json: Option<String>,
}

impl NodeEventParams {
    /// Structured payload, falling back to the JSON-encoded string form
    pub fn payload_value(&self) -> Result<Value, ValidationError> {
        if let Some(payload) = &self.payload {
            return Ok(payload.clone());
        }
        match &self.payload_json {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|err| ValidationError::new("payloadJSON", err.to_string())),
            None => Ok(Value::Null),
        }
    }
}

impl Validate for NodeEventParams {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("event", &self.event)
    }
}

/// One agent-runtime event (`agent` stream item)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AgentEventPayload {
    pub run_id: String,
    pub seq: u64,
    pub stream: String,
    pub ts: u64,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_run_id: Option<String>,
}

impl Validate for AgentEventPayload {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("runId", &self.run_id)?;
        non_empty("stream", &self.stream)?;
        non_empty_opt("sessionKey", self.session_key.as_deref())
    }
}

// ---------------------------------------------------------------------------
// Exec approvals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecSecurity {
    Deny,
    #[default]
    Allowlist,
    Full,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecAsk {
    Off,
    #[default]
    OnMiss,
    Always,
}

/// One policy layer (global default or node override)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecPolicy {
    #[serde(default)]
    pub security: ExecSecurity,
    #[serde(default)]
    pub ask: ExecAsk,
    #[serde(default)]
    pub allowlist: Vec<String>,
}

impl Validate for ExecPolicy {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty_all("allowlist", Some(&self.allowlist))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecApprovalsSnapshot {
    pub policy: ExecPolicy,
    pub hash: String,
}

impl Validate for ExecApprovalsSnapshot {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecApprovalsSetParams {
    pub policy: ExecPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_hash: Option<String>,
}

impl Validate for ExecApprovalsSetParams {
    fn validate(&self) -> Result<(), ValidationError> {
        self.policy.validate().map_err(|err| err.within("policy"))?;
        non_empty_opt("baseHash", self.base_hash.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecApprovalsNodeGetParams {
    pub node_id: String,
}

impl Validate for ExecApprovalsNodeGetParams {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("nodeId", &self.node_id)
    }
}

/// `policy: null` (or absent) clears the node override
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecApprovalsNodeSetParams {
    pub node_id: String,
    #[serde(default)]
    pub policy: Option<ExecPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_hash: Option<String>,
}

impl Validate for ExecApprovalsNodeSetParams {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("nodeId", &self.node_id)?;
        if let Some(policy) = &self.policy {
            policy.validate().map_err(|err| err.within("policy"))?;
        }
        non_empty_opt("baseHash", self.base_hash.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecApprovalsNodeSnapshot {
    pub node_id: String,
    #[serde(rename = "override")]
    pub node_override: Option<ExecPolicy>,
    pub effective: ExecPolicy,
    pub hash: String,
}

impl Validate for ExecApprovalsNodeSnapshot {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecApprovalDecision {
    AllowOnce,
    AllowAlways,
    Deny,
}

impl ExecApprovalDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AllowOnce => "allow-once",
            Self::AllowAlways => "allow-always",
            Self::Deny => "deny",
        }
    }

    pub fn is_allow(self) -> bool {
        !matches!(self, Self::Deny)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecApprovalScope {
    Global,
    Node,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecApprovalRequestParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Validate for ExecApprovalRequestParams {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("command", &self.command)?;
        non_empty_opt("id", self.id.as_deref())?;
        non_empty_opt("nodeId", self.node_id.as_deref())?;
        non_empty_opt("runId", self.run_id.as_deref())?;
        in_range("timeoutMs", self.timeout_ms, 1, 24 * 60 * 60 * 1000)
    }
}

/// An exec approval record, pending or resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecApprovalRequest {
    pub id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub scope: ExecApprovalScope,
    pub status: ExecApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ExecApprovalDecision>,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
}

impl Validate for ExecApprovalRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("id", &self.id)?;
        non_empty("command", &self.command)?;
        let resolved = self.status != ExecApprovalStatus::Pending;
        if resolved != self.decision.is_some() {
            return Err(ValidationError::new(
                "decision",
                "must be present exactly when the request is resolved",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecApprovalResolveParams {
    pub id: String,
    pub decision: ExecApprovalDecision,
}

impl Validate for ExecApprovalResolveParams {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("id", &self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecApprovalResolveResult {
    pub request: ExecApprovalRequest,
    /// False when the same decision had already been recorded
    pub changed: bool,
}

impl Validate for ExecApprovalResolveResult {
    fn validate(&self) -> Result<(), ValidationError> {
        self.request.validate().map_err(|err| err.within("request"))
    }
}

// ---------------------------------------------------------------------------
// Trace
// ---------------------------------------------------------------------------

pub const TRACE_RUNS_DEFAULT_LIMIT: u64 = 50;
pub const TRACE_RUNS_MAX_LIMIT: u64 = 200;
pub const TRACE_EVENTS_DEFAULT_LIMIT: u64 = 5_000;
pub const TRACE_EVENTS_MAX_LIMIT: u64 = 20_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceRunStatus {
    #[default]
    Running,
    Ended,
}

/// Rollup metadata for one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRunMeta {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    pub created_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at_ms: Option<u64>,
    pub last_event_at_ms: u64,
    pub status: TraceRunStatus,
    #[serde(default)]
    pub event_count: u64,
    #[serde(default)]
    pub streams: BTreeMap<String, u64>,
    #[serde(default)]
    pub tool_calls: u64,
    #[serde(default)]
    pub tool_errors: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One line of a run's append-only log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRunEvent {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    pub seq: u64,
    pub stream: String,
    pub ts: u64,
    #[serde(default)]
    pub data: Value,
}

impl From<AgentEventPayload> for TraceRunEvent {
    fn from(event: AgentEventPayload) -> Self {
        Self {
            run_id: event.run_id,
            source_run_id: event.source_run_id,
            client_run_id: event.client_run_id,
            session_key: event.session_key,
            seq: event.seq,
            stream: event.stream,
            ts: event.ts,
            data: event.data,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TraceRunsListParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

impl Validate for TraceRunsListParams {
    fn validate(&self) -> Result<(), ValidationError> {
        in_range("limit", self.limit, 1, TRACE_RUNS_MAX_LIMIT)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TraceRunsListResult {
    pub runs: Vec<TraceRunMeta>,
}

impl Validate for TraceRunsListResult {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TraceRunGetParams {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

impl Validate for TraceRunGetParams {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("runId", &self.run_id)?;
        in_range("limit", self.limit, 1, TRACE_EVENTS_MAX_LIMIT)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TraceRunGetResult {
    pub meta: Option<TraceRunMeta>,
    pub events: Vec<TraceRunEvent>,
    pub truncated: bool,
}

impl Validate for TraceRunGetResult {}

// ---------------------------------------------------------------------------
// Downstream subsystems (config, sessions, cron, agent, chat)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfigSetParams {
    pub raw: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_hash: Option<String>,
}

impl Validate for ConfigSetParams {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("raw", &self.raw)?;
        non_empty_opt("baseHash", self.base_hash.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionsListParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_minutes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_global: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

impl Validate for SessionsListParams {
    fn validate(&self) -> Result<(), ValidationError> {
        in_range("limit", self.limit, 1, 10_000)?;
        non_empty_opt("agentId", self.agent_id.as_deref())
    }
}

/// `sessions.preview` / `sessions.reset` / `sessions.delete`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionKeyParams {
    pub key: String,
}

impl Validate for SessionKeyParams {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("key", &self.key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CronListParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_disabled: Option<bool>,
}

impl Validate for CronListParams {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CronAddParams {
    pub name: String,
    pub schedule: Value,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

impl Validate for CronAddParams {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("name", &self.name)?;
        if !self.schedule.is_object() {
            return Err(ValidationError::new("schedule", "must be an object"));
        }
        non_empty_opt("agentId", self.agent_id.as_deref())
    }
}

/// `cron.remove` / `cron.run`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CronJobRefParams {
    pub id: String,
}

impl Validate for CronJobRefParams {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("id", &self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AgentParams {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    pub idempotency_key: String,
}

impl Validate for AgentParams {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("message", &self.message)?;
        non_empty_opt("agentId", self.agent_id.as_deref())?;
        non_empty_opt("sessionKey", self.session_key.as_deref())?;
        non_empty("idempotencyKey", &self.idempotency_key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AgentWaitParams {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Validate for AgentWaitParams {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("runId", &self.run_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChatSendParams {
    pub session_key: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub idempotency_key: String,
}

impl Validate for ChatSendParams {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("sessionKey", &self.session_key)?;
        non_empty("idempotencyKey", &self.idempotency_key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChatAbortParams {
    pub session_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl Validate for ChatAbortParams {
    fn validate(&self) -> Result<(), ValidationError> {
        non_empty("sessionKey", &self.session_key)?;
        non_empty_opt("runId", self.run_id.as_deref())
    }
}
