//! Method table: wire method name -> params/result schema and access guard

use cp_protocol::{scopes, ROLE_NODE, ROLE_OPERATOR};

use crate::error::GatewayError;

/// Who may call a method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Any authenticated connection
    Any,
    /// Operators holding the scope (admin implies every scope)
    Operator(&'static str),
    /// Node-role connections only
    Node,
}

/// Where the call is served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Local,
    Downstream,
}

#[derive(Debug, Clone, Copy)]
pub struct MethodSpec {
    pub name: &'static str,
    pub params: &'static str,
    /// `None` for results the gateway does not own a schema for
    pub result: Option<&'static str>,
    pub access: Access,
    pub route: Route,
}

/// The handshake method; only valid as the first frame
pub const CONNECT: &str = "connect";
/// Answered from inside the hub lock
pub const SNAPSHOT_GET: &str = "snapshot.get";

/// Calls that may block for a long time. They run beside the ordered
/// per-connection request stream and may answer out of order.
const LONG_RUNNING: &[&str] = &["node.invoke", "exec.approval.request", "agent.wait"];

const fn local(name: &'static str, params: &'static str, result: Option<&'static str>, access: Access) -> MethodSpec {
    MethodSpec {
        name,
        params,
        result,
        access,
        route: Route::Local,
    }
}

const fn downstream(name: &'static str, params: &'static str, access: Access) -> MethodSpec {
    MethodSpec {
        name,
        params,
        result: None,
        access,
        route: Route::Downstream,
    }
}

use Access::{Any, Node, Operator};

pub const METHODS: &[MethodSpec] = &[
    local("health", "EmptyParams", Some("HealthResult"), Any),
    local("status", "EmptyParams", Some("StatusResult"), Operator(scopes::READ)),
    local(SNAPSHOT_GET, "EmptyParams", Some("SnapshotGetResult"), Any),
    // Device pairing
    local("device.pair.list", "EmptyParams", Some("PairListResult"), Operator(scopes::PAIRING)),
    local("device.pair.approve", "PairResolveParams", Some("PairApproveResult"), Operator(scopes::PAIRING)),
    local("device.pair.reject", "PairResolveParams", Some("PairRejectResult"), Operator(scopes::PAIRING)),
    local("device.pair.verify", "PairVerifyParams", Some("PairVerifyResult"), Any),
    local("device.token.rotate", "DeviceTokenRotateParams", Some("IssuedToken"), Operator(scopes::PAIRING)),
    local("device.token.revoke", "DeviceTokenRevokeParams", Some("DeviceTokenRevokeResult"), Operator(scopes::PAIRING)),
    // Node pairing and invocation
    local("node.pair.request", "NodePairRequestParams", Some("PairRequestResult"), Any),
    local("node.pair.list", "EmptyParams", Some("PairListResult"), Operator(scopes::PAIRING)),
    local("node.pair.approve", "PairResolveParams", Some("PairApproveResult"), Operator(scopes::PAIRING)),
    local("node.pair.reject", "PairResolveParams", Some("PairRejectResult"), Operator(scopes::PAIRING)),
    local("node.pair.verify", "PairVerifyParams", Some("PairVerifyResult"), Any),
    local("node.list", "EmptyParams", Some("NodeListResult"), Operator(scopes::READ)),
    local("node.invoke", "NodeInvokeParams", Some("NodeInvokeResult"), Operator(scopes::WRITE)),
    local("node.event", "NodeEventParams", None, Node),
    // Exec approvals
    local("exec.approvals.get", "EmptyParams", Some("ExecApprovalsSnapshot"), Operator(scopes::READ)),
    local("exec.approvals.set", "ExecApprovalsSetParams", Some("ExecApprovalsSnapshot"), Operator(scopes::ADMIN)),
    local("exec.approvals.node.get", "ExecApprovalsNodeGetParams", Some("ExecApprovalsNodeSnapshot"), Operator(scopes::READ)),
    local("exec.approvals.node.set", "ExecApprovalsNodeSetParams", Some("ExecApprovalsNodeSnapshot"), Operator(scopes::ADMIN)),
    local("exec.approval.request", "ExecApprovalRequestParams", Some("ExecApprovalRequest"), Any),
    local("exec.approval.resolve", "ExecApprovalResolveParams", Some("ExecApprovalResolveResult"), Operator(scopes::APPROVALS)),
    // Trace
    local("trace.runs.list", "TraceRunsListParams", Some("TraceRunsListResult"), Operator(scopes::READ)),
    local("trace.run.get", "TraceRunGetParams", Some("TraceRunGetResult"), Operator(scopes::READ)),
    // Downstream subsystems
    downstream("config.get", "EmptyParams", Operator(scopes::READ)),
    downstream("config.set", "ConfigSetParams", Operator(scopes::ADMIN)),
    downstream("sessions.list", "SessionsListParams", Operator(scopes::READ)),
    downstream("sessions.preview", "SessionKeyParams", Operator(scopes::READ)),
    downstream("sessions.reset", "SessionKeyParams", Operator(scopes::WRITE)),
    downstream("sessions.delete", "SessionKeyParams", Operator(scopes::ADMIN)),
    downstream("cron.list", "CronListParams", Operator(scopes::READ)),
    downstream("cron.add", "CronAddParams", Operator(scopes::ADMIN)),
    downstream("cron.remove", "CronJobRefParams", Operator(scopes::ADMIN)),
    downstream("cron.run", "CronJobRefParams", Operator(scopes::WRITE)),
    downstream("agent", "AgentParams", Operator(scopes::WRITE)),
    downstream("agent.wait", "AgentWaitParams", Operator(scopes::WRITE)),
    downstream("chat.send", "ChatSendParams", Operator(scopes::WRITE)),
    downstream("chat.abort", "ChatAbortParams", Operator(scopes::WRITE)),
];

pub fn lookup(name: &str) -> Option<&'static MethodSpec> {
    METHODS.iter().find(|spec| spec.name == name)
}

/// Advertised in `hello-ok`
pub fn method_names() -> Vec<String> {
    std::iter::once(CONNECT)
        .chain(METHODS.iter().map(|spec| spec.name))
        .map(str::to_string)
        .collect()
}

/// Admin implies everything; write implies read
pub fn has_scope(granted: &[String], needed: &str) -> bool {
    granted.iter().any(|scope| {
        scope == scopes::ADMIN || scope == needed || (needed == scopes::READ && scope == scopes::WRITE)
    })
}

impl MethodSpec {
    pub fn is_long_running(&self) -> bool {
        LONG_RUNNING.contains(&self.name)
    }

    pub fn authorize(&self, role: &str, granted: &[String]) -> Result<(), GatewayError> {
        match self.access {
            Access::Any => Ok(()),
            Access::Node if role == ROLE_NODE => Ok(()),
            Access::Node => Err(GatewayError::Forbidden(format!("'{}' is only available to nodes", self.name))),
            Access::Operator(scope) if role == ROLE_OPERATOR && has_scope(granted, scope) => Ok(()),
            Access::Operator(scope) => Err(GatewayError::Forbidden(format!(
                "'{}' requires operator scope {}",
                self.name, scope
            ))),
        }
    }
}
