//! Local method handlers
//!
//! Everything here runs after the method table has authorized the caller and
//! the params have passed their closed schema.

use std::time::Duration;

use cp_core::approvals::PolicyOutcome;
use cp_core::now_ms;
use cp_core::pairing::{PairRequestInput, PairingKind};
use cp_core::PairingError;
use cp_protocol::methods::{
    AgentEventPayload, DeviceTokenRevokeParams, DeviceTokenRotateParams, ExecApprovalDecision,
    ExecApprovalRequest, ExecApprovalRequestParams, ExecApprovalResolveParams, ExecApprovalResolveResult,
    ExecApprovalStatus, ExecApprovalsNodeGetParams, ExecApprovalsNodeSetParams, ExecApprovalsSetParams,
    HealthResult, NodeEventParams, NodeInvokeParams, NodeInvokeResult, NodeListResult, NodePairRequestParams,
    PairRequestResult, PairRequestedEvent, PairResolveParams, PairResolvedEvent, PairVerifyParams, PairingRequest,
    SnapshotGetResult, StatusResult, TraceRunGetParams, TraceRunsListParams, TraceRunsListResult,
};
use cp_protocol::{error_codes, events, parse_params, ErrorShape, RequestFrame, ResponseFrame, PROTOCOL_VERSION, ROLE_NODE};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::methods::{MethodSpec, Route};
use super::sequencer::{OutboundQueue, QueueError};
use crate::downstream::CallContext;
use crate::error::GatewayError;
use crate::state::Gateway;

pub const DEFAULT_NODE_INVOKE_TIMEOUT_MS: u64 = 30_000;
const APPROVAL_TRACE_STREAM: &str = "approval";

/// The authenticated peer behind a request
#[derive(Clone)]
pub struct Caller {
    pub conn_id: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub client_id: String,
    pub device_id: Option<String>,
    pub remote_ip: Option<String>,
    pub queue: OutboundQueue,
}

impl Caller {
    /// Recorded as `resolvedBy`
    pub fn label(&self) -> &str {
        self.device_id.as_deref().unwrap_or(&self.client_id)
    }

    pub fn is_node(&self) -> bool {
        self.role == ROLE_NODE
    }

    pub fn context(&self) -> CallContext {
        CallContext {
            conn_id: self.conn_id.clone(),
            role: self.role.clone(),
            scopes: self.scopes.clone(),
            client_id: self.client_id.clone(),
        }
    }
}

/// Run one method and check its result against the declared schema
pub async fn dispatch(
    gateway: &Gateway,
    caller: &Caller,
    spec: &MethodSpec,
    params: Value,
) -> Result<Value, GatewayError> {
    if spec.route == Route::Downstream {
        return gateway.downstream().call(spec.name, params, &caller.context()).await;
    }

    let result = call_local(gateway, caller, spec.name, params).await?;
    check_result(gateway, spec, result)
}

/// Answer `snapshot.get` straight from the hub, under its lock
pub async fn respond_snapshot(
    gateway: &Gateway,
    caller: &Caller,
    spec: &MethodSpec,
    id: String,
) -> Result<(), QueueError> {
    gateway
        .hub()
        .send_snapshot(&caller.queue, |snapshot| {
            match to_json(SnapshotGetResult { snapshot }).and_then(|payload| check_result(gateway, spec, payload)) {
                Ok(payload) => ResponseFrame::success(id, payload),
                Err(err) => ResponseFrame::failure(id, err.to_error_shape()),
            }
        })
        .await
}

fn check_result(gateway: &Gateway, spec: &MethodSpec, result: Value) -> Result<Value, GatewayError> {
    if let Some(schema) = spec.result {
        if let Err(err) = gateway.registry().validate(schema, &result) {
            error!(method = spec.name, "Result failed {}: {}", schema, err);
            return Err(GatewayError::Internal(format!("'{}' produced an invalid result", spec.name)));
        }
    }
    Ok(result)
}

fn to_json<T: Serialize>(value: T) -> Result<Value, GatewayError> {
    Ok(serde_json::to_value(value)?)
}

async fn call_local(gateway: &Gateway, caller: &Caller, method: &str, params: Value) -> Result<Value, GatewayError> {
    let params = Some(params);
    match method {
        "health" => health(gateway).await,
        "status" => status(gateway).await,

        "device.pair.list" => to_json(gateway.pairing(PairingKind::Device).list().await),
        "device.pair.approve" => pair_approve(gateway, caller, PairingKind::Device, parse_params(params)?).await,
        "device.pair.reject" => pair_reject(gateway, caller, PairingKind::Device, parse_params(params)?).await,
        "device.pair.verify" => pair_verify(gateway, caller, PairingKind::Device, parse_params(params)?).await,
        "device.token.rotate" => token_rotate(gateway, parse_params(params)?).await,
        "device.token.revoke" => token_revoke(gateway, parse_params(params)?).await,

        "node.pair.request" => node_pair_request(gateway, caller, parse_params(params)?).await,
        "node.pair.list" => to_json(gateway.pairing(PairingKind::Node).list().await),
        "node.pair.approve" => pair_approve(gateway, caller, PairingKind::Node, parse_params(params)?).await,
        "node.pair.reject" => pair_reject(gateway, caller, PairingKind::Node, parse_params(params)?).await,
        "node.pair.verify" => pair_verify(gateway, caller, PairingKind::Node, parse_params(params)?).await,
        "node.list" => to_json(NodeListResult {
            nodes: gateway.hub().list_nodes().await,
        }),
        "node.invoke" => node_invoke(gateway, parse_params(params)?).await,
        "node.event" => node_event(gateway, caller, parse_params(params)?).await,

        "exec.approvals.get" => to_json(gateway.exec_policy().get().await?),
        "exec.approvals.set" => {
            let params: ExecApprovalsSetParams = parse_params(params)?;
            to_json(
                gateway
                    .exec_policy()
                    .set(params.policy, params.base_hash.as_deref())
                    .await?,
            )
        }
        "exec.approvals.node.get" => {
            let params: ExecApprovalsNodeGetParams = parse_params(params)?;
            to_json(gateway.exec_policy().node_get(&params.node_id).await?)
        }
        "exec.approvals.node.set" => {
            let params: ExecApprovalsNodeSetParams = parse_params(params)?;
            to_json(
                gateway
                    .exec_policy()
                    .node_set(&params.node_id, params.policy, params.base_hash.as_deref())
                    .await?,
            )
        }
        "exec.approval.request" => approval_request(gateway, parse_params(params)?).await,
        "exec.approval.resolve" => approval_resolve(gateway, caller, parse_params(params)?).await,

        "trace.runs.list" => {
            let params: TraceRunsListParams = parse_params(params)?;
            to_json(TraceRunsListResult {
                runs: gateway.trace().list_runs(params.limit).await?,
            })
        }
        "trace.run.get" => {
            let params: TraceRunGetParams = parse_params(params)?;
            to_json(gateway.trace().get_run_events(&params.run_id, params.limit).await?)
        }

        other => Err(GatewayError::MethodNotFound(other.to_string())),
    }
}

async fn health(gateway: &Gateway) -> Result<Value, GatewayError> {
    let hub = gateway.hub();
    to_json(HealthResult {
        ok: true,
        ts: now_ms(),
        uptime_ms: hub.uptime_ms(),
        connections: hub.connection_count().await,
        state_version: hub.state_version().await,
    })
}

async fn status(gateway: &Gateway) -> Result<Value, GatewayError> {
    let hub = gateway.hub();
    to_json(StatusResult {
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol: PROTOCOL_VERSION,
        uptime_ms: hub.uptime_ms(),
        connections: hub.connection_count().await,
        nodes: hub.list_nodes().await.len(),
        state_version: hub.state_version().await,
        pending_device_pairings: gateway.pairing(PairingKind::Device).pending_count().await,
        pending_node_pairings: gateway.pairing(PairingKind::Node).pending_count().await,
        pending_approvals: gateway.approvals().pending().await.len(),
    })
}

// ---------------------------------------------------------------------------
// Pairing
// ---------------------------------------------------------------------------

fn requested_event(kind: PairingKind) -> &'static str {
    match kind {
        PairingKind::Device => events::DEVICE_PAIR_REQUESTED,
        PairingKind::Node => events::NODE_PAIR_REQUESTED,
    }
}

fn resolved_event(kind: PairingKind) -> &'static str {
    match kind {
        PairingKind::Device => events::DEVICE_PAIR_RESOLVED,
        PairingKind::Node => events::NODE_PAIR_RESOLVED,
    }
}

/// Tell operators a new pairing request is waiting
pub async fn announce_pair_requested(gateway: &Gateway, kind: PairingKind, request: &PairingRequest) {
    let event = PairRequestedEvent {
        request: request.clone(),
    };
    if let Err(err) = gateway.broadcast(requested_event(kind), &event).await {
        warn!(request_id = %request.request_id, "Failed to announce pairing request: {}", err);
    }
}

async fn announce_pair_resolved(gateway: &Gateway, kind: PairingKind, request: &PairingRequest) {
    let event = PairResolvedEvent {
        request_id: request.request_id.clone(),
        identity_id: request.identity_id.clone(),
        status: request.status,
        ts: request.resolved_at_ms.unwrap_or_else(now_ms),
    };
    if let Err(err) = gateway.broadcast(resolved_event(kind), &event).await {
        warn!(request_id = %request.request_id, "Failed to announce pairing resolution: {}", err);
    }
}

async fn pair_approve(
    gateway: &Gateway,
    caller: &Caller,
    kind: PairingKind,
    params: PairResolveParams,
) -> Result<Value, GatewayError> {
    let result = gateway
        .pairing(kind)
        .approve(&params.request_id, Some(caller.label()))
        .await?;
    announce_pair_resolved(gateway, kind, &result.request).await;
    to_json(result)
}

async fn pair_reject(
    gateway: &Gateway,
    caller: &Caller,
    kind: PairingKind,
    params: PairResolveParams,
) -> Result<Value, GatewayError> {
    let result = gateway
        .pairing(kind)
        .reject(&params.request_id, Some(caller.label()))
        .await?;
    announce_pair_resolved(gateway, kind, &result.request).await;
    to_json(result)
}

async fn pair_verify(
    gateway: &Gateway,
    caller: &Caller,
    kind: PairingKind,
    params: PairVerifyParams,
) -> Result<Value, GatewayError> {
    let result = gateway
        .pairing(kind)
        .verify(&params.request_id, &params.signature)
        .await?;
    if kind == PairingKind::Node && caller.is_node() {
        gateway
            .hub()
            .mark_node_paired(&caller.conn_id, &result.identity_id)
            .await;
    }
    to_json(result)
}

async fn node_pair_request(
    gateway: &Gateway,
    caller: &Caller,
    params: NodePairRequestParams,
) -> Result<Value, GatewayError> {
    let silent = params.silent.unwrap_or(false);
    let (request, created) = gateway
        .pairing(PairingKind::Node)
        .request(PairRequestInput {
            identity_id: params.node_id,
            public_key: params.public_key,
            display_name: params.display_name,
            platform: params.platform,
            version: params.version,
            remote_ip: params.remote_ip.or_else(|| caller.remote_ip.clone()),
            caps: params.caps.unwrap_or_default(),
            commands: params.commands.unwrap_or_default(),
            role: Some(ROLE_NODE.to_string()),
            scopes: Vec::new(),
        })
        .await?;
    if created && !silent {
        announce_pair_requested(gateway, PairingKind::Node, &request).await;
    }
    to_json(PairRequestResult { request, created })
}

/// Device tokens first; node identities share the same token surface
async fn token_rotate(gateway: &Gateway, params: DeviceTokenRotateParams) -> Result<Value, GatewayError> {
    let DeviceTokenRotateParams {
        device_id,
        role,
        scopes,
    } = params;
    let issued = match gateway
        .pairing(PairingKind::Device)
        .rotate_token(&device_id, role.clone(), scopes.clone())
        .await
    {
        Err(PairingError::NotFound(_)) => {
            gateway
                .pairing(PairingKind::Node)
                .rotate_token(&device_id, role, scopes)
                .await?
        }
        other => other?,
    };
    to_json(issued)
}

async fn token_revoke(gateway: &Gateway, params: DeviceTokenRevokeParams) -> Result<Value, GatewayError> {
    let revoked = match gateway.pairing(PairingKind::Device).revoke_token(&params.device_id).await {
        Err(PairingError::NotFound(_)) => {
            gateway
                .pairing(PairingKind::Node)
                .revoke_token(&params.device_id)
                .await?
        }
        other => other?,
    };
    gateway
        .hub()
        .disconnect_identity(&revoked.identity_id, "token revoked")
        .await;
    to_json(revoked)
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

async fn node_invoke(gateway: &Gateway, params: NodeInvokeParams) -> Result<Value, GatewayError> {
    let target = gateway
        .hub()
        .node(&params.node_id)
        .await
        .ok_or_else(|| GatewayError::Unavailable {
            message: format!("node '{}' is not connected", params.node_id),
            retry_after_ms: None,
        })?;
    if !target.session.paired {
        return Err(GatewayError::Forbidden(format!("node '{}' is not paired", params.node_id)));
    }
    if !target.session.commands.is_empty() && !target.session.commands.contains(&params.command) {
        return Err(GatewayError::Validation(format!(
            "node '{}' does not advertise command '{}'",
            params.node_id, params.command
        )));
    }

    let request_id = Uuid::new_v4().to_string();
    let timeout_ms = params.timeout_ms.unwrap_or(DEFAULT_NODE_INVOKE_TIMEOUT_MS);
    let waiter = target.pending.register(&request_id);
    let request = RequestFrame::new(
        request_id.clone(),
        "node.invoke",
        Some(json!({
            "command": params.command,
            "params": params.params,
            "timeoutMs": timeout_ms,
            "idempotencyKey": params.idempotency_key,
        })),
    );
    if let Err(err) = target.queue.send_request(request) {
        target.pending.cancel(&request_id);
        return Err(GatewayError::Unavailable {
            message: format!("node '{}' is not accepting requests: {}", params.node_id, err),
            retry_after_ms: None,
        });
    }
    debug!(node_id = %params.node_id, command = %params.command, request_id = %request_id, "Invoking node");

    let response = match tokio::time::timeout(Duration::from_millis(timeout_ms), waiter).await {
        Ok(Ok(response)) => response,
        Ok(Err(_)) => {
            return Err(GatewayError::Unavailable {
                message: format!("node '{}' disconnected", params.node_id),
                retry_after_ms: None,
            })
        }
        Err(_) => {
            target.pending.cancel(&request_id);
            return Err(GatewayError::Timeout(format!(
                "node '{}' did not answer '{}' within {}ms",
                params.node_id, params.command, timeout_ms
            )));
        }
    };

    if !response.ok {
        let error = response
            .error
            .unwrap_or_else(|| ErrorShape::new(error_codes::INTERNAL, "node reported a failure without details"));
        return Err(GatewayError::Remote(error));
    }
    to_json(NodeInvokeResult {
        node_id: params.node_id,
        command: params.command,
        payload: response.payload,
    })
}

async fn node_event(gateway: &Gateway, caller: &Caller, params: NodeEventParams) -> Result<Value, GatewayError> {
    let paired = gateway
        .hub()
        .node_session(&caller.conn_id)
        .await
        .is_some_and(|session| session.paired);
    if !paired {
        return Err(GatewayError::Forbidden("node is not paired".to_string()));
    }
    let payload = params.payload_value()?;
    match params.event.as_str() {
        events::AGENT => {
            let event: AgentEventPayload = parse_params(Some(payload))?;
            gateway.publish_agent_event(event).await?;
        }
        other => debug!(conn_id = %caller.conn_id, event = other, "Ignoring node event"),
    }
    Ok(json!({ "ok": true }))
}

// ---------------------------------------------------------------------------
// Exec approvals
// ---------------------------------------------------------------------------

async fn approval_request(gateway: &Gateway, params: ExecApprovalRequestParams) -> Result<Value, GatewayError> {
    let policy = gateway.exec_policy().effective(params.node_id.as_deref()).await;
    let outcome = policy.evaluate(&params.command, params.resolved_path.as_deref());

    let record = match outcome {
        PolicyOutcome::Allow | PolicyOutcome::Deny => {
            let decision = if outcome == PolicyOutcome::Allow {
                ExecApprovalDecision::AllowOnce
            } else {
                ExecApprovalDecision::Deny
            };
            let record = gateway.approvals().record_automatic(params, decision).await?;
            debug!(approval_id = %record.id, decision = decision.as_str(), "Exec approval decided by policy");
            record
        }
        PolicyOutcome::Ask => {
            let (pending, waiter) = gateway.approvals().create(params).await?;
            if let Err(err) = gateway.broadcast(events::EXEC_APPROVAL_REQUESTED, &pending).await {
                warn!(approval_id = %pending.id, "Failed to announce exec approval: {}", err);
            }
            let record = waiter
                .await
                .map_err(|_| GatewayError::Internal("approval waiter dropped".to_string()))?;
            if record.status == ExecApprovalStatus::Expired {
                announce_approval_resolved(gateway, &record).await;
                trace_approval(gateway, &record).await;
            }
            record
        }
    };

    if outcome != PolicyOutcome::Ask {
        trace_approval(gateway, &record).await;
    }
    to_json(record)
}

async fn approval_resolve(
    gateway: &Gateway,
    caller: &Caller,
    params: ExecApprovalResolveParams,
) -> Result<Value, GatewayError> {
    let resolution = gateway
        .approvals()
        .resolve(&params.id, params.decision, Some(caller.label()))
        .await?;

    if resolution.changed {
        let record = &resolution.request;
        announce_approval_resolved(gateway, record).await;
        if params.decision == ExecApprovalDecision::AllowAlways {
            let pattern = record.resolved_path.as_deref().unwrap_or(&record.command);
            if let Err(err) = gateway.exec_policy().remember(record.node_id.as_deref(), pattern).await {
                warn!(approval_id = %record.id, "Failed to remember allow-always pattern: {}", err);
            }
        }
        trace_approval(gateway, record).await;
        info!(
            approval_id = %record.id,
            decision = params.decision.as_str(),
            resolved_by = caller.label(),
            "Exec approval resolved by operator"
        );
    }

    to_json(ExecApprovalResolveResult {
        request: resolution.request,
        changed: resolution.changed,
    })
}

async fn announce_approval_resolved(gateway: &Gateway, record: &ExecApprovalRequest) {
    if let Err(err) = gateway.broadcast(events::EXEC_APPROVAL_RESOLVED, record).await {
        warn!(approval_id = %record.id, "Failed to announce exec approval resolution: {}", err);
    }
}

async fn trace_approval(gateway: &Gateway, record: &ExecApprovalRequest) {
    let Some(run_id) = record.run_id.as_deref() else {
        return;
    };
    let data = json!({
        "approvalId": record.id,
        "command": record.command,
        "status": record.status,
        "decision": record.decision,
        "resolvedBy": record.resolved_by,
    });
    let ts = record.resolved_at_ms.unwrap_or_else(now_ms);
    if let Err(err) = gateway
        .trace()
        .append_system(run_id, APPROVAL_TRACE_STREAM, data, record.session_key.clone(), ts)
        .await
    {
        warn!(approval_id = %record.id, run_id, "Failed to trace exec approval: {}", err);
    }
}
