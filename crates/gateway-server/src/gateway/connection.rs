//! Connection lifecycle
//!
//! `Connecting -> AwaitingHello -> Authenticated -> Active -> Closing -> Closed`.
//! The loop here is transport-agnostic: it reads [`Inbound`] messages from any
//! stream and writes through the connection's [`OutboundQueue`]. The axum
//! handler adapts a WebSocket to both sides.
//!
//! Handshake: the server sends `connect.challenge`, the first client frame
//! must be a `connect` request, and the `hello-ok` response is queued by the
//! hub under the same lock that registers the connection, so no event can
//! overtake it.
//!
//! After the handshake, requests run one at a time in arrival order on a
//! per-connection worker. Only long-running methods are split off from that
//! stream; the read loop itself never waits on a handler.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cp_core::device_auth::{verify_connect_proof, DeviceAuthPayload};
use cp_core::now_ms;
use cp_core::pairing::{PairRequestInput, PairingKind};
use cp_protocol::{
    decode_bounded, events, parse_params, scopes, ConnectChallenge, ConnectParams, DeviceProof, EventFrame, Features,
    GatewayFrame, HelloOk, HelloOkKind, IssuedAuth, PresenceEntry, RequestFrame, ResponseFrame, ServerInfo, Snapshot,
    ROLE_NODE, ROLE_OPERATOR,
};
use futures::{Stream, StreamExt};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::hub::{ConnectionEntry, NodeSession, PendingRequests};
use super::methods::{self, has_scope, MethodSpec, CONNECT, SNAPSHOT_GET};
use super::rpc::{self, announce_pair_requested, Caller};
use super::sequencer::OutboundQueue;
use crate::error::{close_codes, GatewayError};
use crate::state::Gateway;

/// One message from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    /// Non-text data; always a protocol violation
    Binary,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionMeta {
    pub remote_ip: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    AwaitingHello,
    Authenticated,
    Active,
    Closing,
    Closed,
}

/// Highest version inside both ranges
pub fn negotiate_protocol(server: (u32, u32), client: (u32, u32)) -> Result<u32, GatewayError> {
    let low = server.0.max(client.0);
    let high = server.1.min(client.1);
    if low > high {
        return Err(GatewayError::ProtocolMismatch {
            server_min: server.0,
            server_max: server.1,
            client_min: client.0,
            client_max: client.1,
        });
    }
    Ok(high)
}

/// Drive one connection until either side closes
pub async fn run_connection<S>(gateway: Gateway, meta: ConnectionMeta, mut inbound: S, queue: OutboundQueue)
where
    S: Stream<Item = Inbound> + Unpin,
{
    let mut connection = Connection {
        conn_id: Uuid::new_v4().to_string(),
        remote_ip: meta.remote_ip,
        pending: PendingRequests::default(),
        state: ConnState::Connecting,
        in_flight: HashSet::new(),
        gateway,
        queue,
    };
    connection.run(&mut inbound).await;
}

enum HandshakeError {
    /// The peer or the queue went away; nothing left to tell anyone
    Gone,
    Rejected {
        request_id: Option<String>,
        error: GatewayError,
    },
}

fn rejected(request_id: Option<String>, error: GatewayError) -> HandshakeError {
    HandshakeError::Rejected { request_id, error }
}

/// Outcome of credential checks
struct AuthGrant {
    method: &'static str,
    role: String,
    scopes: Vec<String>,
    device_id: Option<String>,
    issued: Option<IssuedAuth>,
    paired: bool,
}

/// A validated request waiting for the connection's worker
struct Job {
    id: String,
    spec: &'static MethodSpec,
    params: Value,
}

enum Step {
    Inbound(Option<Inbound>),
    Finished(String),
    Idle,
    QueueClosed,
}

struct Connection {
    gateway: Gateway,
    conn_id: String,
    remote_ip: Option<String>,
    queue: OutboundQueue,
    pending: PendingRequests,
    state: ConnState,
    in_flight: HashSet<String>,
}

impl Connection {
    fn transition(&mut self, next: ConnState) {
        debug!(conn_id = %self.conn_id, from = ?self.state, to = ?next, "Connection state");
        self.state = next;
    }

    async fn run<S>(&mut self, inbound: &mut S)
    where
        S: Stream<Item = Inbound> + Unpin,
    {
        info!(conn_id = %self.conn_id, remote_ip = ?self.remote_ip, "Connection opened");
        let nonce = Uuid::new_v4().to_string();
        let challenge = ConnectChallenge {
            nonce: nonce.clone(),
            ts: now_ms(),
        };
        let sent = serde_json::to_value(&challenge)
            .map_err(GatewayError::from)
            .and_then(|payload| {
                self.queue
                    .send_unsequenced(EventFrame::unsequenced(events::CONNECT_CHALLENGE, payload))
                    .map_err(|err| GatewayError::Internal(err.to_string()))
            });
        if let Err(err) = sent {
            error!(conn_id = %self.conn_id, "Failed to send connect challenge: {}", err);
            self.queue.close(close_codes::INTERNAL_ERROR, "challenge failed");
            self.transition(ConnState::Closed);
            return;
        }
        self.transition(ConnState::AwaitingHello);

        let caller = match self.handshake(inbound, &nonce).await {
            Ok(caller) => Arc::new(caller),
            Err(HandshakeError::Gone) => {
                debug!(conn_id = %self.conn_id, "Peer left during handshake");
                self.queue.close(close_codes::NORMAL, "handshake abandoned");
                self.transition(ConnState::Closed);
                return;
            }
            Err(HandshakeError::Rejected { request_id, error }) => {
                warn!(conn_id = %self.conn_id, code = error.code(), "Handshake rejected: {}", error);
                self.transition(ConnState::Closing);
                let close_code = match error.close_code() {
                    close_codes::NORMAL => close_codes::POLICY_VIOLATION,
                    code => code,
                };
                self.fail(request_id, &error, close_code);
                self.transition(ConnState::Closed);
                return;
            }
        };

        self.transition(ConnState::Active);
        self.serve(inbound, &caller).await;

        self.transition(ConnState::Closing);
        self.gateway.hub().detach(&self.conn_id).await;
        self.pending.clear();
        self.queue.close(close_codes::NORMAL, "connection closed");
        self.transition(ConnState::Closed);
        info!(conn_id = %self.conn_id, "Connection closed");
    }

    /// Send a failure response (when the frame had an id), then close
    fn fail(&self, request_id: Option<String>, error: &GatewayError, close_code: u16) {
        if let Some(id) = request_id {
            if let Err(err) = self.queue.send_response(ResponseFrame::failure(id, error.to_error_shape())) {
                debug!(conn_id = %self.conn_id, "Could not deliver failure response: {}", err);
            }
        }
        self.queue.close(close_code, &error.to_string());
    }

    async fn handshake<S>(&mut self, inbound: &mut S, nonce: &str) -> Result<Caller, HandshakeError>
    where
        S: Stream<Item = Inbound> + Unpin,
    {
        let gateway = self.gateway.clone();
        let config = gateway.config();
        let deadline = Duration::from_millis(config.handshake_timeout_ms);
        let queue = self.queue.clone();

        let first = tokio::select! {
            first = tokio::time::timeout(deadline, inbound.next()) => first,
            _ = queue.wait_closed() => return Err(HandshakeError::Gone),
        };
        let text = match first {
            Err(_) => {
                return Err(rejected(
                    None,
                    GatewayError::Timeout(format!("no connect request within {}ms", config.handshake_timeout_ms)),
                ))
            }
            Ok(None) => return Err(HandshakeError::Gone),
            Ok(Some(Inbound::Binary)) => {
                return Err(rejected(None, GatewayError::Protocol("binary frames are not supported".to_string())))
            }
            Ok(Some(Inbound::Text(text))) => text,
        };

        let frame = decode_bounded(&text, config.max_payload)
            .map_err(|err| rejected(err.id().map(str::to_string), err.into()))?;
        let request = match frame {
            GatewayFrame::Request(request) if request.method == CONNECT => request,
            GatewayFrame::Request(request) => {
                let error = GatewayError::Protocol(format!(
                    "first request must be '{}', got '{}'",
                    CONNECT, request.method
                ));
                return Err(rejected(Some(request.id), error));
            }
            other => {
                let error = GatewayError::Protocol(format!(
                    "first frame must be a '{}' request, got '{}'",
                    CONNECT,
                    other.type_name()
                ));
                return Err(rejected(None, error));
            }
        };

        let RequestFrame { id: request_id, params, .. } = request;
        let params: ConnectParams = parse_params(params).map_err(|err| {
            rejected(Some(request_id.clone()), GatewayError::Protocol(format!("invalid connect params: {}", err)))
        })?;
        let protocol = negotiate_protocol(
            (config.min_protocol, config.max_protocol),
            (params.min_protocol, params.max_protocol),
        )
        .map_err(|err| rejected(Some(request_id.clone()), err))?;

        let grant = self
            .authenticate(&params, nonce)
            .await
            .map_err(|err| rejected(Some(request_id.clone()), err))?;
        self.transition(ConnState::Authenticated);
        info!(
            conn_id = %self.conn_id,
            client_id = %params.client.id,
            role = %grant.role,
            auth = grant.method,
            protocol,
            "Client authenticated"
        );

        let now = now_ms();
        let presence = PresenceEntry {
            conn_id: Some(self.conn_id.clone()),
            client_id: Some(params.client.id.clone()),
            host: params.client.display_name.clone(),
            ip: self.remote_ip.clone(),
            version: Some(params.client.version.clone()),
            platform: Some(params.client.platform.clone()),
            device_family: params.client.device_family.clone(),
            mode: Some(params.client.mode.as_str().to_string()),
            instance_id: params.client.instance_id.clone(),
            device_id: grant.device_id.clone(),
            roles: Some(vec![grant.role.clone()]),
            scopes: Some(grant.scopes.clone()),
            reason: Some("connect".to_string()),
            ts: now,
        };
        let node = (grant.role == ROLE_NODE).then(|| NodeSession {
            node_id: grant.device_id.clone().unwrap_or_else(|| params.client.id.clone()),
            display_name: params.client.display_name.clone(),
            platform: params.client.platform.clone(),
            version: params.client.version.clone(),
            caps: params.caps.clone().unwrap_or_default(),
            commands: params.commands.clone().unwrap_or_default(),
            paired: grant.paired,
            connected_at_ms: now,
        });
        let entry = ConnectionEntry {
            conn_id: self.conn_id.clone(),
            role: grant.role.clone(),
            scopes: grant.scopes.clone(),
            device_id: grant.device_id.clone(),
            presence,
            node,
            queue: self.queue.clone(),
            pending: self.pending.clone(),
        };

        let hello_id = request_id.clone();
        let server = ServerInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            commit: option_env!("CP_GIT_COMMIT").map(str::to_string),
            host: std::env::var("HOSTNAME").ok(),
            conn_id: self.conn_id.clone(),
        };
        let policy = config.policy();
        let issued = grant.issued.clone();
        let respond = move |snapshot: Snapshot| -> Result<ResponseFrame, GatewayError> {
            let hello = HelloOk {
                kind: HelloOkKind::HelloOk,
                protocol,
                server,
                features: Features {
                    methods: methods::method_names(),
                    events: events::ALL.iter().map(|event| event.to_string()).collect(),
                },
                snapshot,
                auth: issued,
                policy,
            };
            Ok(ResponseFrame::success(hello_id, serde_json::to_value(hello)?))
        };
        gateway
            .hub()
            .attach(entry, respond)
            .await
            .map_err(|err| rejected(Some(request_id), err))?;

        Ok(Caller {
            conn_id: self.conn_id.clone(),
            role: grant.role,
            scopes: grant.scopes,
            client_id: params.client.id,
            device_id: grant.device_id,
            remote_ip: self.remote_ip.clone(),
            queue: self.queue.clone(),
        })
    }

    async fn authenticate(&self, params: &ConnectParams, nonce: &str) -> Result<AuthGrant, GatewayError> {
        let role = params.role();
        if role != ROLE_OPERATOR && role != ROLE_NODE {
            return Err(GatewayError::Auth(format!("unknown role '{}'", role)));
        }
        let config = self.gateway.config();
        let token = params.auth.as_ref().and_then(|auth| auth.token.as_deref());
        let password = params.auth.as_ref().and_then(|auth| auth.password.as_deref());

        if let Some(device) = &params.device {
            return self.authenticate_device(params, device, token, nonce).await;
        }

        if let Some(token) = token {
            if config
                .gateway_token
                .as_deref()
                .is_some_and(|expected| secure_eq(token, expected))
            {
                return Ok(shared_grant("token", role, params.scopes.as_deref()));
            }
            return self.authenticate_device_token(token, role, params.scopes.as_deref()).await;
        }

        if let Some(password) = password {
            return match config.gateway_password.as_deref() {
                Some(expected) if secure_eq(password, expected) => {
                    Ok(shared_grant("password", role, params.scopes.as_deref()))
                }
                _ => Err(GatewayError::Auth("invalid password".to_string())),
            };
        }

        if config.open_auth() {
            return Ok(shared_grant("none", role, params.scopes.as_deref()));
        }
        Err(GatewayError::Auth("credentials required".to_string()))
    }

    /// Signature over the challenge nonce; unknown keys open a pairing request
    async fn authenticate_device(
        &self,
        params: &ConnectParams,
        device: &DeviceProof,
        token: Option<&str>,
        nonce: &str,
    ) -> Result<AuthGrant, GatewayError> {
        let role = params.role();
        let config = self.gateway.config();
        let requested = params.scopes.clone().unwrap_or_default();
        let payload = DeviceAuthPayload {
            device_id: &device.id,
            client_id: &params.client.id,
            client_mode: params.client.mode.as_str(),
            role,
            scopes: &requested,
            signed_at_ms: device.signed_at,
            token,
            nonce: device.nonce.as_deref(),
        };
        verify_connect_proof(
            &payload,
            &device.public_key,
            &device.signature,
            Some(nonce),
            now_ms(),
            config.signature_skew_ms,
        )?;

        let store = self.gateway.pairing_for_role(role);
        if let Some(identity) = store.paired_identity(&device.id).await {
            if identity.role != role {
                return Err(GatewayError::Auth(format!(
                    "{} '{}' is paired for role '{}'",
                    store.kind().as_str(),
                    device.id,
                    identity.role
                )));
            }
            let issued = store.confirm_connect(&device.id, &device.public_key).await?;
            let scopes = grant_scopes(params.scopes.as_deref(), &identity.scopes);
            return Ok(AuthGrant {
                method: "device",
                role: role.to_string(),
                scopes,
                device_id: Some(identity.identity_id),
                issued: Some(IssuedAuth {
                    device_token: issued.token,
                    role: issued.role,
                    scopes: issued.scopes,
                    issued_at_ms: Some(issued.issued_at_ms),
                }),
                paired: true,
            });
        }

        let (request, created) = store
            .request(PairRequestInput {
                identity_id: device.id.clone(),
                public_key: device.public_key.clone(),
                display_name: params.client.display_name.clone(),
                platform: Some(params.client.platform.clone()),
                version: Some(params.client.version.clone()),
                remote_ip: self.remote_ip.clone(),
                caps: params.caps.clone().unwrap_or_default(),
                commands: params.commands.clone().unwrap_or_default(),
                role: Some(role.to_string()),
                scopes: requested,
            })
            .await?;
        if created {
            announce_pair_requested(&self.gateway, store.kind(), &request).await;
        }
        Err(GatewayError::NotPaired {
            request_id: request.request_id,
            code: request.code,
        })
    }

    /// A token minted at pairing; its claims say which store to check
    async fn authenticate_device_token(
        &self,
        token: &str,
        role: &str,
        requested: Option<&[String]>,
    ) -> Result<AuthGrant, GatewayError> {
        let claims = self
            .gateway
            .tokens()
            .decode(token)
            .map_err(|_| GatewayError::Auth("invalid token".to_string()))?;
        let kind = match claims.kind.as_str() {
            kind if kind == PairingKind::Device.as_str() => PairingKind::Device,
            kind if kind == PairingKind::Node.as_str() => PairingKind::Node,
            _ => return Err(GatewayError::Auth("invalid token".to_string())),
        };
        let identity = self
            .gateway
            .pairing(kind)
            .verify_token(&claims.identity_id, token)
            .await
            .map_err(|err| GatewayError::Auth(err.to_string()))?;
        if identity.role != role {
            return Err(GatewayError::Auth(format!("token is not valid for role '{}'", role)));
        }
        Ok(AuthGrant {
            method: "device-token",
            role: role.to_string(),
            scopes: grant_scopes(requested, &identity.scopes),
            device_id: Some(identity.identity_id),
            issued: None,
            paired: true,
        })
    }

    async fn serve<S>(&mut self, inbound: &mut S, caller: &Arc<Caller>)
    where
        S: Stream<Item = Inbound> + Unpin,
    {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<String>();
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(process_requests(
            self.gateway.clone(),
            Arc::clone(caller),
            jobs_rx,
            done_tx,
        ));
        let idle_timeout_ms = self.gateway.config().idle_timeout_ms;
        let queue = self.queue.clone();

        loop {
            let step = tokio::select! {
                _ = queue.wait_closed() => Step::QueueClosed,
                Some(id) = done_rx.recv() => Step::Finished(id),
                next = next_inbound(inbound, idle_timeout_ms) => match next {
                    Some(message) => Step::Inbound(message),
                    None => Step::Idle,
                },
            };

            match step {
                Step::QueueClosed => {
                    debug!(conn_id = %self.conn_id, "Outbound side closed");
                    return;
                }
                Step::Finished(id) => {
                    self.in_flight.remove(&id);
                }
                Step::Idle => {
                    info!(conn_id = %self.conn_id, idle_timeout_ms, "Closing idle connection");
                    self.queue.close(close_codes::NORMAL, "idle timeout");
                    return;
                }
                Step::Inbound(None) => {
                    debug!(conn_id = %self.conn_id, "Peer went away");
                    return;
                }
                Step::Inbound(Some(Inbound::Binary)) => {
                    let error = GatewayError::Protocol("binary frames are not supported".to_string());
                    warn!(conn_id = %self.conn_id, "{}", error);
                    self.fail(None, &error, close_codes::UNSUPPORTED_DATA);
                    return;
                }
                Step::Inbound(Some(Inbound::Text(text))) => {
                    if let Err((request_id, error)) = self.handle_text(&text, caller, &jobs_tx) {
                        warn!(conn_id = %self.conn_id, code = error.code(), "Closing connection: {}", error);
                        self.fail(request_id, &error, error.close_code());
                        return;
                    }
                }
            }
        }
    }

    /// Only connection-fatal errors come back out
    fn handle_text(
        &mut self,
        text: &str,
        caller: &Caller,
        jobs: &mpsc::UnboundedSender<Job>,
    ) -> Result<(), (Option<String>, GatewayError)> {
        let frame = decode_bounded(text, self.gateway.config().max_payload)
            .map_err(|err| (err.id().map(str::to_string), GatewayError::from(err)))?;
        match frame {
            GatewayFrame::Request(request) => {
                self.handle_request(request, caller, jobs);
                Ok(())
            }
            GatewayFrame::Response(response) => {
                let id = response.id.clone();
                if !self.pending.complete(response) {
                    debug!(conn_id = %self.conn_id, response_id = %id, "Dropping response with no outstanding request");
                }
                Ok(())
            }
            GatewayFrame::Event(event) => Err((
                None,
                GatewayError::Protocol(format!("clients may not send events ('{}')", event.event)),
            )),
        }
    }

    /// Validate and queue for the worker; rejections are answered here
    fn handle_request(&mut self, request: RequestFrame, caller: &Caller, jobs: &mpsc::UnboundedSender<Job>) {
        let RequestFrame { id, method, params } = request;
        if method == CONNECT {
            self.reply_error(id, GatewayError::Validation("connection is already established".to_string()));
            return;
        }
        if self.in_flight.contains(&id) {
            let error = GatewayError::Validation(format!("request id '{}' is already in flight", id));
            self.reply_error(id, error);
            return;
        }
        let Some(spec) = methods::lookup(&method) else {
            self.reply_error(id, GatewayError::MethodNotFound(method));
            return;
        };
        if let Err(err) = spec.authorize(&caller.role, &caller.scopes) {
            self.reply_error(id, err);
            return;
        }
        let params = match params {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(params) => params,
        };
        if let Err(err) = self.gateway.registry().validate(spec.params, &params) {
            self.reply_error(id, err.into());
            return;
        }

        self.in_flight.insert(id.clone());
        if let Err(mpsc::error::SendError(job)) = jobs.send(Job { id, spec, params }) {
            self.in_flight.remove(&job.id);
            debug!(conn_id = %self.conn_id, request_id = %job.id, "Request worker is gone");
        }
    }

    fn reply_error(&self, id: String, error: GatewayError) {
        debug!(conn_id = %self.conn_id, request_id = %id, code = error.code(), "Rejecting request: {}", error);
        if let Err(err) = self.queue.send_response(ResponseFrame::failure(id, error.to_error_shape())) {
            debug!(conn_id = %self.conn_id, "Could not deliver error response: {}", err);
        }
    }
}

/// Run a connection's requests in arrival order. Long-running methods are
/// spawned so they cannot stall the requests behind them.
async fn process_requests(
    gateway: Gateway,
    caller: Arc<Caller>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    done_tx: mpsc::UnboundedSender<String>,
) {
    while let Some(job) = jobs.recv().await {
        if job.spec.is_long_running() {
            let gateway = gateway.clone();
            let caller = Arc::clone(&caller);
            let done_tx = done_tx.clone();
            tokio::spawn(async move {
                let id = execute(&gateway, &caller, job).await;
                let _ = done_tx.send(id);
            });
        } else {
            let id = execute(&gateway, &caller, job).await;
            let _ = done_tx.send(id);
        }
    }
}

/// Run one request and queue its response. Returns the request id.
async fn execute(gateway: &Gateway, caller: &Caller, job: Job) -> String {
    let Job { id, spec, params } = job;
    let started = Instant::now();

    let delivered = if spec.name == SNAPSHOT_GET {
        rpc::respond_snapshot(gateway, caller, spec, id.clone()).await
    } else {
        let response = match rpc::dispatch(gateway, caller, spec, params).await {
            Ok(payload) => ResponseFrame::success(id.clone(), payload),
            Err(err) => {
                if matches!(err, GatewayError::Internal(_)) {
                    error!(conn_id = %caller.conn_id, method = spec.name, "Request failed: {}", err);
                } else {
                    debug!(conn_id = %caller.conn_id, method = spec.name, code = err.code(), "Request failed: {}", err);
                }
                ResponseFrame::failure(id.clone(), err.to_error_shape())
            }
        };
        caller.queue.send_response(response)
    };

    debug!(
        conn_id = %caller.conn_id,
        method = spec.name,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Request handled"
    );
    if let Err(err) = delivered {
        debug!(conn_id = %caller.conn_id, request_id = %id, "Response undeliverable: {}", err);
    }
    id
}

/// `None` when the idle timeout elapsed first
async fn next_inbound<S>(inbound: &mut S, idle_timeout_ms: u64) -> Option<Option<Inbound>>
where
    S: Stream<Item = Inbound> + Unpin,
{
    if idle_timeout_ms == 0 {
        return Some(inbound.next().await);
    }
    tokio::time::timeout(Duration::from_millis(idle_timeout_ms), inbound.next())
        .await
        .ok()
}

fn default_scopes(role: &str) -> Vec<String> {
    if role == ROLE_OPERATOR {
        vec![scopes::ADMIN.to_string()]
    } else {
        Vec::new()
    }
}

fn shared_grant(method: &'static str, role: &str, requested: Option<&[String]>) -> AuthGrant {
    AuthGrant {
        method,
        role: role.to_string(),
        scopes: requested.map(<[String]>::to_vec).unwrap_or_else(|| default_scopes(role)),
        device_id: None,
        issued: None,
        paired: false,
    }
}

/// Requested scopes narrowed to what the identity was granted
fn grant_scopes(requested: Option<&[String]>, granted: &[String]) -> Vec<String> {
    match requested {
        None => granted.to_vec(),
        Some(requested) => requested
            .iter()
            .filter(|scope| has_scope(granted, scope))
            .cloned()
            .collect(),
    }
}

/// Compare secrets without an early exit on the first differing byte
fn secure_eq(left: &str, right: &str) -> bool {
    let left = Sha256::digest(left.as_bytes());
    let right = Sha256::digest(right.as_bytes());
    left.iter()
        .zip(right.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::sequencer::{channel, CloseFrame, Outbound, OutboundReceiver};
    use crate::state::test_support::build_gateway;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    use cp_core::device_auth::{derive_device_id, pair_verify_payload};
    use cp_protocol::{decode, error_codes, ErrorShape};
    use ed25519_dalek::{Signer, SigningKey};
    use futures::channel::mpsc::{unbounded, UnboundedSender};
    use serde_json::json;
    use tokio::task::JoinHandle;

    const WAIT: Duration = Duration::from_secs(2);

    struct TestClient {
        tx: UnboundedSender<Inbound>,
        rx: OutboundReceiver,
        task: JoinHandle<()>,
        nonce: Option<String>,
    }

    impl TestClient {
        fn spawn(gateway: &Gateway) -> Self {
            let (queue, rx) = channel(gateway.config().max_buffered_bytes);
            let (tx, inbound) = unbounded();
            let task = tokio::spawn(run_connection(gateway.clone(), ConnectionMeta::default(), inbound, queue));
            Self {
                tx,
                rx,
                task,
                nonce: None,
            }
        }

        fn send(&self, value: Value) {
            self.tx.unbounded_send(Inbound::Text(value.to_string())).unwrap();
        }

        async fn next(&mut self) -> Outbound {
            tokio::time::timeout(WAIT, self.rx.next())
                .await
                .expect("timed out waiting for outbound")
                .expect("outbound ended")
        }

        async fn frame(&mut self) -> GatewayFrame {
            match self.next().await {
                Outbound::Frame(text) => decode(&text).unwrap(),
                Outbound::Close { frame, .. } => panic!("unexpected close {:?}", frame),
            }
        }

        async fn response(&mut self, id: &str) -> ResponseFrame {
            loop {
                if let GatewayFrame::Response(response) = self.frame().await {
                    if response.id == id {
                        return response;
                    }
                }
            }
        }

        async fn event(&mut self, name: &str) -> EventFrame {
            loop {
                if let GatewayFrame::Event(event) = self.frame().await {
                    if event.event == name {
                        return event;
                    }
                }
            }
        }

        async fn request(&mut self, name: &str) -> RequestFrame {
            loop {
                if let GatewayFrame::Request(request) = self.frame().await {
                    if request.method == name {
                        return request;
                    }
                }
            }
        }

        async fn close_frame(&mut self) -> CloseFrame {
            loop {
                if let Outbound::Close { frame, .. } = self.next().await {
                    return frame;
                }
            }
        }

        async fn challenge(&mut self) -> String {
            let event = self.event(events::CONNECT_CHALLENGE).await;
            assert!(event.seq.is_none());
            let nonce = event.payload.unwrap()["nonce"].as_str().unwrap().to_string();
            self.nonce = Some(nonce.clone());
            nonce
        }

        async fn connect(&mut self, params: Value) -> ResponseFrame {
            if self.nonce.is_none() {
                self.challenge().await;
            }
            self.send(json!({ "type": "req", "id": "c1", "method": "connect", "params": params }));
            self.response("c1").await
        }

        async fn call(&mut self, id: &str, method: &str, params: Value) -> ResponseFrame {
            self.send(json!({ "type": "req", "id": id, "method": method, "params": params }));
            self.response(id).await
        }
    }

    fn connect_params(extra: Value) -> Value {
        let mut params = json!({
            "minProtocol": 1,
            "maxProtocol": 3,
            "client": { "id": "cli", "version": "1.0.0", "platform": "linux", "mode": "cli" }
        });
        if let (Some(target), Value::Object(extra)) = (params.as_object_mut(), extra) {
            target.extend(extra);
        }
        params
    }

    fn error_code(response: &ResponseFrame) -> &str {
        assert!(!response.ok, "expected failure, got {:?}", response.payload);
        &response.error.as_ref().unwrap().code
    }

    /// Attach `node` as `node_id`, then pair and verify it through `admin`
    async fn pair_node(admin: &mut TestClient, node: &mut TestClient, key: &DeviceKey, node_id: &str) {
        let response = node
            .connect(connect_params(json!({
                "role": ROLE_NODE,
                "client": { "id": node_id, "version": "1.0.0", "platform": "linux", "mode": "node" },
            })))
            .await;
        assert!(response.ok);
        let requested = node
            .call("pair", "node.pair.request", json!({ "nodeId": node_id, "publicKey": key.public_key }))
            .await;
        let request = requested.payload.unwrap()["request"].clone();
        let request_id = request["requestId"].as_str().unwrap().to_string();
        let code = request["code"].as_str().unwrap().to_string();
        assert!(admin
            .call("approve", "node.pair.approve", json!({ "requestId": request_id }))
            .await
            .ok);
        let verified = node
            .call(
                "verify",
                "node.pair.verify",
                json!({ "requestId": request_id, "signature": key.sign(&pair_verify_payload(&request_id, &code)) }),
            )
            .await;
        assert!(verified.ok);
    }

    struct DeviceKey {
        key: SigningKey,
        public_key: String,
        device_id: String,
    }

    impl DeviceKey {
        fn new(seed: u8) -> Self {
            let key = SigningKey::from_bytes(&[seed; 32]);
            let public_key = URL_SAFE_NO_PAD.encode(key.verifying_key().as_bytes());
            let device_id = derive_device_id(&public_key).unwrap();
            Self {
                key,
                public_key,
                device_id,
            }
        }

        fn sign(&self, payload: &str) -> String {
            URL_SAFE_NO_PAD.encode(self.key.sign(payload.as_bytes()).to_bytes())
        }

        fn proof(&self, role: &str, nonce: &str) -> Value {
            let signed_at = now_ms() as i64;
            let payload = DeviceAuthPayload {
                device_id: &self.device_id,
                client_id: "cli",
                client_mode: "cli",
                role,
                scopes: &[],
                signed_at_ms: signed_at,
                token: None,
                nonce: Some(nonce),
            };
            json!({
                "id": self.device_id,
                "publicKey": self.public_key,
                "signature": self.sign(&payload.to_signing_string()),
                "signedAt": signed_at,
                "nonce": nonce,
            })
        }
    }

    #[tokio::test]
    async fn hello_negotiates_highest_common_protocol() {
        let (gateway, _temp_dir) = build_gateway(|_| {}).await;
        let mut client = TestClient::spawn(&gateway);

        let response = client.connect(connect_params(json!({}))).await;
        assert!(response.ok);
        let hello: HelloOk = serde_json::from_value(response.payload.unwrap()).unwrap();
        assert_eq!(hello.protocol, 3);
        assert_eq!(hello.snapshot.presence.len(), 1);
        assert_eq!(hello.snapshot.presence[0].conn_id.as_deref(), Some(hello.server.conn_id.as_str()));
        assert!(hello.features.methods.contains(&"node.invoke".to_string()));
        assert_eq!(hello.policy, gateway.config().policy());
        assert!(hello.auth.is_none());
    }

    #[tokio::test]
    async fn disjoint_protocol_range_is_rejected() {
        let (gateway, _temp_dir) = build_gateway(|_| {}).await;
        let mut client = TestClient::spawn(&gateway);

        let response = client
            .connect(connect_params(json!({ "minProtocol": 5, "maxProtocol": 6 })))
            .await;
        assert_eq!(error_code(&response), error_codes::PROTOCOL_MISMATCH);
        let details = response.error.unwrap().details.unwrap();
        assert_eq!(details["serverMaxProtocol"], 3);
        assert_eq!(client.close_frame().await.code, close_codes::POLICY_VIOLATION);
        assert_eq!(gateway.hub().connection_count().await, 0);
    }

    #[tokio::test]
    async fn first_request_must_be_connect() {
        let (gateway, _temp_dir) = build_gateway(|_| {}).await;
        let mut client = TestClient::spawn(&gateway);
        client.challenge().await;

        client.send(json!({ "type": "req", "id": "h1", "method": "health" }));
        let response = client.response("h1").await;
        assert_eq!(error_code(&response), error_codes::PROTOCOL_ERROR);
        assert_eq!(client.close_frame().await.code, close_codes::PROTOCOL_ERROR);
    }

    #[tokio::test]
    async fn silent_client_hits_the_handshake_deadline() {
        let (gateway, _temp_dir) = build_gateway(|config| config.handshake_timeout_ms = 30).await;
        let mut client = TestClient::spawn(&gateway);
        client.challenge().await;

        assert_eq!(client.close_frame().await.code, close_codes::POLICY_VIOLATION);
        tokio::time::timeout(WAIT, client.task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shared_token_must_match() {
        let (gateway, _temp_dir) = build_gateway(|config| config.gateway_token = Some("s3cret".into())).await;

        let mut anonymous = TestClient::spawn(&gateway);
        let response = anonymous.connect(connect_params(json!({}))).await;
        assert_eq!(error_code(&response), error_codes::AUTH_FAILED);

        let mut wrong = TestClient::spawn(&gateway);
        let response = wrong
            .connect(connect_params(json!({ "auth": { "token": "guess" } })))
            .await;
        assert_eq!(error_code(&response), error_codes::AUTH_FAILED);
        assert_eq!(wrong.close_frame().await.code, close_codes::POLICY_VIOLATION);

        let mut right = TestClient::spawn(&gateway);
        let response = right
            .connect(connect_params(json!({ "auth": { "token": "s3cret" } })))
            .await;
        assert!(response.ok);
    }

    #[tokio::test]
    async fn request_errors_keep_the_connection_open() {
        let (gateway, _temp_dir) = build_gateway(|_| {}).await;
        let mut client = TestClient::spawn(&gateway);
        assert!(client.connect(connect_params(json!({}))).await.ok);

        let unknown = client.call("r1", "nope.nothing", json!({})).await;
        assert_eq!(error_code(&unknown), error_codes::METHOD_NOT_FOUND);

        let extra_field = client.call("r2", "health", json!({ "verbose": true })).await;
        assert_eq!(error_code(&extra_field), error_codes::INVALID_REQUEST);

        let again = client.call("r3", CONNECT, connect_params(json!({}))).await;
        assert_eq!(error_code(&again), error_codes::INVALID_REQUEST);

        let health = client.call("r4", "health", json!({})).await;
        assert!(health.ok);
    }

    #[tokio::test]
    async fn narrow_scopes_are_enforced() {
        let (gateway, _temp_dir) = build_gateway(|_| {}).await;
        let mut client = TestClient::spawn(&gateway);
        let response = client
            .connect(connect_params(json!({ "scopes": [scopes::READ] })))
            .await;
        assert!(response.ok);

        let listed = client.call("r1", "trace.runs.list", json!({})).await;
        assert!(listed.ok);
        let denied = client.call("r2", "device.pair.list", json!({})).await;
        assert_eq!(error_code(&denied), error_codes::FORBIDDEN);
    }

    #[tokio::test]
    async fn invalid_frames_close_with_protocol_error() {
        let (gateway, _temp_dir) = build_gateway(|_| {}).await;
        let mut client = TestClient::spawn(&gateway);
        assert!(client.connect(connect_params(json!({}))).await.ok);

        client.send(json!({ "type": "req", "id": "x1" }));
        let response = client.response("x1").await;
        assert_eq!(error_code(&response), error_codes::PROTOCOL_ERROR);
        assert_eq!(client.close_frame().await.code, close_codes::PROTOCOL_ERROR);
        tokio::time::timeout(WAIT, client.task).await.unwrap().unwrap();
        assert_eq!(gateway.hub().connection_count().await, 0);
    }

    #[tokio::test]
    async fn client_events_and_binary_are_fatal() {
        let (gateway, _temp_dir) = build_gateway(|_| {}).await;

        let mut eventful = TestClient::spawn(&gateway);
        assert!(eventful.connect(connect_params(json!({}))).await.ok);
        eventful.send(json!({ "type": "event", "event": "tick", "payload": { "ts": 1 } }));
        assert_eq!(eventful.close_frame().await.code, close_codes::PROTOCOL_ERROR);

        let mut binary = TestClient::spawn(&gateway);
        assert!(binary.connect(connect_params(json!({}))).await.ok);
        binary.tx.unbounded_send(Inbound::Binary).unwrap();
        assert_eq!(binary.close_frame().await.code, close_codes::UNSUPPORTED_DATA);
    }

    #[tokio::test]
    async fn events_arrive_with_contiguous_seqs() {
        let (gateway, _temp_dir) = build_gateway(|_| {}).await;
        let mut client = TestClient::spawn(&gateway);
        let hello = client.connect(connect_params(json!({}))).await;
        let hello: HelloOk = serde_json::from_value(hello.payload.unwrap()).unwrap();

        for ts in 0..5 {
            gateway.hub().tick(ts).await;
        }

        let mut seqs = Vec::new();
        let mut versions = Vec::new();
        while seqs.len() < 7 {
            if let GatewayFrame::Event(event) = client.frame().await {
                seqs.push(event.seq.unwrap());
                versions.push(event.state_version.unwrap());
            }
        }
        assert_eq!(seqs, (1..=7).collect::<Vec<u64>>());
        assert!(versions.iter().all(|version| *version >= hello.snapshot.state_version));
    }

    #[tokio::test]
    async fn duplicate_in_flight_id_is_rejected() {
        let (gateway, _temp_dir) = build_gateway(|_| {}).await;
        let mut client = TestClient::spawn(&gateway);
        assert!(client.connect(connect_params(json!({}))).await.ok);

        let ask = json!({ "id": "ap-9", "command": "make deploy" });
        client.send(json!({ "type": "req", "id": "dup", "method": "exec.approval.request", "params": ask }));
        let requested = client.event(events::EXEC_APPROVAL_REQUESTED).await;
        assert_eq!(requested.payload.unwrap()["id"], "ap-9");

        client.send(json!({ "type": "req", "id": "dup", "method": "health" }));
        let duplicate = client.response("dup").await;
        assert_eq!(error_code(&duplicate), error_codes::INVALID_REQUEST);

        let resolved = client
            .call("res", "exec.approval.resolve", json!({ "id": "ap-9", "decision": "allow-once" }))
            .await;
        assert!(resolved.ok);
        let original = client.response("dup").await;
        assert!(original.ok);
        assert_eq!(original.payload.unwrap()["status"], "approved");
    }

    #[tokio::test]
    async fn unknown_device_pairs_then_reconnects_with_a_token() {
        let (gateway, _temp_dir) = build_gateway(|_| {}).await;
        let device = DeviceKey::new(7);

        let mut admin = TestClient::spawn(&gateway);
        assert!(admin.connect(connect_params(json!({}))).await.ok);

        let mut first = TestClient::spawn(&gateway);
        let nonce = first.challenge().await;
        let response = first
            .connect(connect_params(json!({ "device": device.proof(ROLE_OPERATOR, &nonce) })))
            .await;
        assert_eq!(error_code(&response), error_codes::NOT_PAIRED);
        let details = response.error.unwrap().details.unwrap();
        let request_id = details["requestId"].as_str().unwrap().to_string();
        assert_eq!(first.close_frame().await.code, close_codes::POLICY_VIOLATION);

        let requested = admin.event(events::DEVICE_PAIR_REQUESTED).await;
        assert_eq!(requested.payload.unwrap()["request"]["identityId"], device.device_id.as_str());
        let approved = admin
            .call("a1", "device.pair.approve", json!({ "requestId": request_id }))
            .await;
        assert!(approved.ok);
        let resolved = admin.event(events::DEVICE_PAIR_RESOLVED).await;
        assert_eq!(resolved.payload.unwrap()["status"], "approved");

        let mut second = TestClient::spawn(&gateway);
        let nonce = second.challenge().await;
        let response = second
            .connect(connect_params(json!({ "device": device.proof(ROLE_OPERATOR, &nonce) })))
            .await;
        assert!(response.ok);
        let hello: HelloOk = serde_json::from_value(response.payload.unwrap()).unwrap();
        let device_token = hello.auth.unwrap().device_token;

        let mut third = TestClient::spawn(&gateway);
        let response = third
            .connect(connect_params(json!({ "auth": { "token": device_token } })))
            .await;
        assert!(response.ok);

        let revoked = admin
            .call("a2", "device.token.revoke", json!({ "deviceId": device.device_id }))
            .await;
        assert!(revoked.ok);
        assert_eq!(second.close_frame().await.code, close_codes::POLICY_VIOLATION);
        assert_eq!(third.close_frame().await.code, close_codes::POLICY_VIOLATION);

        let mut fourth = TestClient::spawn(&gateway);
        let response = fourth
            .connect(connect_params(json!({ "auth": { "token": device_token } })))
            .await;
        assert_eq!(error_code(&response), error_codes::AUTH_FAILED);
    }

    #[tokio::test]
    async fn stale_nonce_is_refused() {
        let (gateway, _temp_dir) = build_gateway(|_| {}).await;
        let device = DeviceKey::new(9);
        let mut client = TestClient::spawn(&gateway);
        client.challenge().await;

        let response = client
            .connect(connect_params(json!({ "device": device.proof(ROLE_OPERATOR, "not-the-nonce") })))
            .await;
        assert_eq!(error_code(&response), error_codes::AUTH_FAILED);
        assert_eq!(gateway.pairing(PairingKind::Device).pending_count().await, 0);
    }

    #[tokio::test]
    async fn node_pairs_and_answers_invocations() {
        let (gateway, _temp_dir) = build_gateway(|_| {}).await;
        let node_key = DeviceKey::new(11);

        let mut admin = TestClient::spawn(&gateway);
        assert!(admin.connect(connect_params(json!({}))).await.ok);

        let mut node = TestClient::spawn(&gateway);
        let response = node
            .connect(connect_params(json!({
                "role": ROLE_NODE,
                "client": { "id": "node-1", "version": "1.0.0", "platform": "linux", "mode": "node" },
                "commands": ["system.run"],
            })))
            .await;
        assert!(response.ok);

        let requested = node
            .call(
                "p1",
                "node.pair.request",
                json!({ "nodeId": "node-1", "publicKey": node_key.public_key }),
            )
            .await;
        let request = requested.payload.unwrap()["request"].clone();
        let request_id = request["requestId"].as_str().unwrap().to_string();
        let code = request["code"].as_str().unwrap().to_string();

        let unpaired = admin
            .call(
                "i0",
                "node.invoke",
                json!({ "nodeId": "node-1", "command": "system.run", "idempotencyKey": "k0" }),
            )
            .await;
        assert_eq!(error_code(&unpaired), error_codes::FORBIDDEN);

        assert!(admin
            .call("a1", "node.pair.approve", json!({ "requestId": request_id }))
            .await
            .ok);
        let verified = node
            .call(
                "p2",
                "node.pair.verify",
                json!({ "requestId": request_id, "signature": node_key.sign(&pair_verify_payload(&request_id, &code)) }),
            )
            .await;
        assert!(verified.ok);

        admin.send(json!({
            "type": "req",
            "id": "i1",
            "method": "node.invoke",
            "params": { "nodeId": "node-1", "command": "system.run", "params": { "argv": ["uname"] }, "idempotencyKey": "k1" }
        }));
        let invoke = node.request("node.invoke").await;
        assert_eq!(invoke.params.as_ref().unwrap()["command"], "system.run");

        node.send(json!({ "type": "res", "id": "not-outstanding", "ok": true, "payload": {} }));
        node.send(json!({ "type": "res", "id": invoke.id, "ok": true, "payload": { "stdout": "Linux" } }));

        let result = admin.response("i1").await;
        assert!(result.ok);
        assert_eq!(result.payload.unwrap()["payload"]["stdout"], "Linux");

        let failed = {
            admin.send(json!({
                "type": "req",
                "id": "i2",
                "method": "node.invoke",
                "params": { "nodeId": "node-1", "command": "system.run", "idempotencyKey": "k2" }
            }));
            let invoke = node.request("node.invoke").await;
            let error = ErrorShape::new("EXEC_FAILED", "exit 1");
            node.send(json!({ "type": "res", "id": invoke.id, "ok": false, "error": error }));
            admin.response("i2").await
        };
        assert_eq!(error_code(&failed), "EXEC_FAILED");
    }

    #[tokio::test]
    async fn node_agent_events_are_traced_and_broadcast() {
        let (gateway, _temp_dir) = build_gateway(|_| {}).await;
        let mut operator = TestClient::spawn(&gateway);
        assert!(operator.connect(connect_params(json!({}))).await.ok);

        let agent = json!({
            "runId": "run-7",
            "seq": 1,
            "stream": "lifecycle",
            "ts": 42,
            "data": { "phase": "start" }
        });

        let mut stranger = TestClient::spawn(&gateway);
        assert!(stranger
            .connect(connect_params(json!({
                "role": ROLE_NODE,
                "client": { "id": "node-x", "version": "1.0.0", "platform": "linux", "mode": "node" },
            })))
            .await
            .ok);
        let unpaired = stranger
            .call("e0", "node.event", json!({ "event": "agent", "payload": agent }))
            .await;
        assert_eq!(error_code(&unpaired), error_codes::FORBIDDEN);

        let mut node = TestClient::spawn(&gateway);
        pair_node(&mut operator, &mut node, &DeviceKey::new(12), "node-2").await;
        let response = node
            .call("e1", "node.event", json!({ "event": "agent", "payload": agent }))
            .await;
        assert!(response.ok);

        let event = operator.event(events::AGENT).await;
        assert_eq!(event.payload.unwrap()["runId"], "run-7");

        let denied = operator
            .call("e2", "node.event", json!({ "event": "agent", "payload": agent }))
            .await;
        assert_eq!(error_code(&denied), error_codes::FORBIDDEN);

        let run = operator
            .call("t1", "trace.run.get", json!({ "runId": "run-7" }))
            .await;
        assert_eq!(run.payload.unwrap()["events"].as_array().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn node_events_fan_out_in_arrival_order() {
        let (gateway, _temp_dir) = build_gateway(|_| {}).await;
        let mut operator = TestClient::spawn(&gateway);
        assert!(operator.connect(connect_params(json!({}))).await.ok);
        let mut node = TestClient::spawn(&gateway);
        pair_node(&mut operator, &mut node, &DeviceKey::new(13), "node-3").await;

        const COUNT: u64 = 30;
        for seq in 1..=COUNT {
            let agent = json!({ "runId": "run-8", "seq": seq, "stream": "assistant", "ts": seq, "data": { "n": seq } });
            node.send(json!({
                "type": "req",
                "id": format!("ev-{}", seq),
                "method": "node.event",
                "params": { "event": "agent", "payload": agent }
            }));
        }

        let mut answered = Vec::new();
        while answered.len() < COUNT as usize {
            if let GatewayFrame::Response(response) = node.frame().await {
                if let Some(seq) = response.id.strip_prefix("ev-") {
                    assert!(response.ok);
                    answered.push(seq.parse::<u64>().unwrap());
                }
            }
        }
        assert_eq!(answered, (1..=COUNT).collect::<Vec<_>>());

        let mut broadcast = Vec::new();
        while broadcast.len() < COUNT as usize {
            let event = operator.event(events::AGENT).await;
            broadcast.push(event.payload.unwrap()["seq"].as_u64().unwrap());
        }
        assert_eq!(broadcast, (1..=COUNT).collect::<Vec<_>>());

        let run = operator
            .call("t1", "trace.run.get", json!({ "runId": "run-8" }))
            .await;
        let traced: Vec<u64> = run.payload.unwrap()["events"]
            .as_array()
            .unwrap()
            .iter()
            .map(|event| event["seq"].as_u64().unwrap())
            .collect();
        assert_eq!(traced, (1..=COUNT).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn approval_traffic_reaches_other_operators() {
        let (gateway, _temp_dir) = build_gateway(|_| {}).await;
        let mut requester = TestClient::spawn(&gateway);
        assert!(requester.connect(connect_params(json!({}))).await.ok);
        let mut approver = TestClient::spawn(&gateway);
        assert!(approver
            .connect(connect_params(json!({ "scopes": [scopes::APPROVALS] })))
            .await
            .ok);
        let mut reader = TestClient::spawn(&gateway);
        assert!(reader
            .connect(connect_params(json!({ "scopes": [scopes::READ] })))
            .await
            .ok);

        requester.send(json!({
            "type": "req",
            "id": "ask",
            "method": "exec.approval.request",
            "params": { "id": "ap-2", "command": "terraform apply", "runId": "run-9" }
        }));
        let requested = approver.event(events::EXEC_APPROVAL_REQUESTED).await;
        assert_eq!(requested.payload.unwrap()["command"], "terraform apply");

        // The long-running request does not hold up later requests.
        assert!(requester.call("h1", "health", json!({})).await.ok);

        let resolved = approver
            .call("res", "exec.approval.resolve", json!({ "id": "ap-2", "decision": "deny" }))
            .await;
        assert!(resolved.ok);
        let announced = approver.event(events::EXEC_APPROVAL_RESOLVED).await;
        assert_eq!(announced.payload.unwrap()["status"], "denied");

        let answer = requester.response("ask").await;
        assert_eq!(answer.payload.unwrap()["decision"], "deny");

        // Read-only operators never see approval traffic.
        let status = reader.call("s1", "health", json!({})).await;
        assert!(status.ok);
        let mut seen = Vec::new();
        while let Ok(Some(outbound)) = tokio::time::timeout(Duration::from_millis(50), reader.rx.next()).await {
            if let Outbound::Frame(text) = outbound {
                if let GatewayFrame::Event(event) = decode(&text).unwrap() {
                    seen.push(event.event);
                }
            }
        }
        assert!(seen.iter().all(|name| !name.starts_with("exec.approval.")));
    }

    #[tokio::test]
    async fn slow_consumer_is_shed() {
        let (gateway, _temp_dir) = build_gateway(|config| config.max_buffered_bytes = 16 * 1024).await;
        let mut client = TestClient::spawn(&gateway);
        assert!(client.connect(connect_params(json!({}))).await.ok);

        let blob = "x".repeat(1024);
        for seq in 0..64u64 {
            gateway
                .broadcast(events::AGENT, &json!({ "runId": "r", "seq": seq, "blob": blob }))
                .await
                .unwrap();
        }

        match client.next().await {
            Outbound::Close { farewell, frame } => {
                assert_eq!(frame.code, close_codes::POLICY_VIOLATION);
                assert!(farewell.is_some());
            }
            Outbound::Frame(_) => panic!("shed must preempt queued frames"),
        }
        tokio::time::timeout(WAIT, client.task).await.unwrap().unwrap();
        assert_eq!(gateway.hub().connection_count().await, 0);
    }

    #[tokio::test]
    async fn shutdown_announces_and_closes_with_restart_code() {
        let (gateway, _temp_dir) = build_gateway(|_| {}).await;
        let mut client = TestClient::spawn(&gateway);
        assert!(client.connect(connect_params(json!({}))).await.ok);

        gateway.shutdown("maintenance", Some(5_000)).await;
        let shutdown = client.event(events::SHUTDOWN).await;
        assert_eq!(shutdown.payload.unwrap()["restartExpectedMs"], 5_000);
        assert_eq!(client.close_frame().await.code, close_codes::SERVICE_RESTART);

        let mut late = TestClient::spawn(&gateway);
        let response = late.connect(connect_params(json!({}))).await;
        assert_eq!(error_code(&response), error_codes::UNAVAILABLE);
    }

    #[test]
    fn negotiation_and_scope_narrowing() {
        assert_eq!(negotiate_protocol((1, 3), (2, 5)).unwrap(), 3);
        assert!(negotiate_protocol((1, 3), (4, 4)).is_err());

        let granted = vec![scopes::WRITE.to_string()];
        let requested = vec![scopes::READ.to_string(), scopes::ADMIN.to_string()];
        assert_eq!(grant_scopes(Some(&requested), &granted), vec![scopes::READ.to_string()]);
        assert_eq!(grant_scopes(None, &granted), granted);

        assert!(secure_eq("abc", "abc"));
        assert!(!secure_eq("abc", "abd"));
    }
}
