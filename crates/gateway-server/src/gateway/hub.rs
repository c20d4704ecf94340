//! Connection hub - the single serialization point for gateway state
//!
//! Presence, health and the `StateVersion` live behind one lock together with
//! the outbound queue of every active connection. Snapshots are built and
//! events are enqueued while holding that lock, so a snapshot handed to a
//! client is never older than the next event the client sees.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use cp_core::now_ms;
use cp_protocol::methods::NodeSummary;
use cp_protocol::{
    events, scopes, PresenceEntry, ResponseFrame, ShutdownEvent, Snapshot, StateVersion, TickEvent, ROLE_OPERATOR,
};
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use super::methods::has_scope;
use super::sequencer::{OutboundQueue, QueueError};
use crate::error::{close_codes, GatewayError};

/// A connected node's advertised surface
#[derive(Debug, Clone)]
pub struct NodeSession {
    pub node_id: String,
    pub display_name: Option<String>,
    pub platform: String,
    pub version: String,
    pub caps: Vec<String>,
    pub commands: Vec<String>,
    pub paired: bool,
    pub connected_at_ms: u64,
}

/// Server-originated requests awaiting the peer's response
#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Arc<StdMutex<HashMap<String, oneshot::Sender<ResponseFrame>>>>,
}

impl PendingRequests {
    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<ResponseFrame>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, id: &str) -> oneshot::Receiver<ResponseFrame> {
        let (tx, rx) = oneshot::channel();
        self.map().insert(id.to_string(), tx);
        rx
    }

    /// Route a response to its waiter. False when no request is outstanding.
    pub fn complete(&self, response: ResponseFrame) -> bool {
        match self.map().remove(&response.id) {
            Some(waiter) => {
                let _ = waiter.send(response);
                true
            }
            None => false,
        }
    }

    pub fn cancel(&self, id: &str) {
        self.map().remove(id);
    }

    /// Drop every waiter; they observe the peer as gone
    pub fn clear(&self) {
        self.map().clear();
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }
}

/// One attached connection as the hub sees it
pub struct ConnectionEntry {
    pub conn_id: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub device_id: Option<String>,
    pub presence: PresenceEntry,
    pub node: Option<NodeSession>,
    pub queue: OutboundQueue,
    pub pending: PendingRequests,
}

impl ConnectionEntry {
    fn can_see(&self, event: &str) -> bool {
        event_visible(event, &self.role, &self.scopes)
    }
}

/// Handle used by `node.invoke` to reach a node
#[derive(Clone)]
pub struct NodeTarget {
    pub session: NodeSession,
    pub queue: OutboundQueue,
    pub pending: PendingRequests,
}

/// Pairing and approval traffic is only pushed to operators holding the scope
pub fn event_visible(event: &str, role: &str, granted: &[String]) -> bool {
    let needed = if event.starts_with("device.pair.") || event.starts_with("node.pair.") {
        scopes::PAIRING
    } else if event.starts_with("exec.approval.") {
        scopes::APPROVALS
    } else {
        return true;
    };
    role == ROLE_OPERATOR && has_scope(granted, needed)
}

#[derive(Default)]
struct HubState {
    version: StateVersion,
    connections: BTreeMap<String, ConnectionEntry>,
    health: Value,
    shutting_down: bool,
}

impl HubState {
    fn refresh_health(&mut self) {
        let nodes = self.connections.values().filter(|entry| entry.node.is_some()).count();
        self.health = json!({
            "ok": !self.shutting_down,
            "ts": now_ms(),
            "connections": self.connections.len(),
            "nodes": nodes,
        });
    }

    fn presence(&self) -> Vec<PresenceEntry> {
        self.connections.values().map(|entry| entry.presence.clone()).collect()
    }

    /// Stamp with the current version and enqueue for every allowed viewer
    fn broadcast(&self, event: &str, payload: &Value) -> usize {
        let mut delivered = 0;
        for entry in self.connections.values().filter(|entry| entry.can_see(event)) {
            match entry.queue.send_event(event, payload.clone(), self.version) {
                Ok(_) => delivered += 1,
                Err(QueueError::Closed) => {}
                Err(err) => warn!(conn_id = %entry.conn_id, event, "Dropping connection: {}", err),
            }
        }
        delivered
    }

    /// Presence or health changed: new version, then tell everyone
    fn bump_and_announce(&mut self) {
        self.version = self.version.next();
        self.refresh_health();
        let presence = json!({ "presence": self.presence() });
        let health = self.health.clone();
        self.broadcast(events::PRESENCE, &presence);
        self.broadcast(events::HEALTH, &health);
    }
}

pub struct Hub {
    state: Mutex<HubState>,
    started_at: Instant,
    state_dir: Option<String>,
}

impl Hub {
    pub fn new(state_dir: Option<String>) -> Self {
        let mut state = HubState::default();
        state.refresh_health();
        Self {
            state: Mutex::new(state),
            started_at: Instant::now(),
            state_dir,
        }
    }

    pub fn uptime_ms(&self) -> u64 {
        u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn snapshot_locked(&self, state: &HubState) -> Snapshot {
        Snapshot {
            presence: state.presence(),
            health: state.health.clone(),
            state_version: state.version,
            uptime_ms: self.uptime_ms(),
            state_dir: self.state_dir.clone(),
        }
    }

    /// Register a connection and queue its `hello-ok` before any event can
    /// reach it. `respond` turns the snapshot into the handshake response.
    pub async fn attach<F>(&self, entry: ConnectionEntry, respond: F) -> Result<StateVersion, GatewayError>
    where
        F: FnOnce(Snapshot) -> Result<ResponseFrame, GatewayError>,
    {
        let mut state = self.state.lock().await;
        if state.shutting_down {
            return Err(GatewayError::Unavailable {
                message: "gateway is shutting down".to_string(),
                retry_after_ms: None,
            });
        }

        let conn_id = entry.conn_id.clone();
        let queue = entry.queue.clone();
        state.connections.insert(conn_id.clone(), entry);
        state.version = state.version.next();
        state.refresh_health();

        let snapshot = self.snapshot_locked(&state);
        let version = snapshot.state_version;
        let sent = respond(snapshot).and_then(|response| {
            queue
                .send_response(response)
                .map_err(|err| GatewayError::ResourceExhausted(err.to_string()))
        });
        if let Err(err) = sent {
            state.connections.remove(&conn_id);
            state.refresh_health();
            return Err(err);
        }

        let presence = json!({ "presence": state.presence() });
        let health = state.health.clone();
        state.broadcast(events::PRESENCE, &presence);
        state.broadcast(events::HEALTH, &health);

        info!(conn_id = %conn_id, state_version = version.0, "Connection attached");
        Ok(version)
    }

    pub async fn detach(&self, conn_id: &str) -> Option<ConnectionEntry> {
        let mut state = self.state.lock().await;
        let entry = state.connections.remove(conn_id)?;
        entry.pending.clear();
        state.bump_and_announce();
        info!(conn_id, "Connection detached");
        Some(entry)
    }

    /// Answer with the current snapshot. Queued under the lock like the
    /// `hello-ok`, so no newer event can reach the peer ahead of it.
    pub async fn send_snapshot<F>(&self, queue: &OutboundQueue, respond: F) -> Result<(), QueueError>
    where
        F: FnOnce(Snapshot) -> ResponseFrame,
    {
        let state = self.state.lock().await;
        queue.send_response(respond(self.snapshot_locked(&state)))
    }

    pub async fn state_version(&self) -> StateVersion {
        self.state.lock().await.version
    }

    /// Push an event to every connection allowed to see it
    pub async fn broadcast(&self, event: &str, payload: Value) -> usize {
        let state = self.state.lock().await;
        let delivered = state.broadcast(event, &payload);
        debug!(event, delivered, "Broadcast event");
        delivered
    }

    pub async fn tick(&self, ts: u64) {
        let payload = match serde_json::to_value(TickEvent { ts }) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Failed to encode tick: {}", err);
                return;
            }
        };
        self.broadcast(events::TICK, payload).await;
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn node(&self, node_id: &str) -> Option<NodeTarget> {
        let state = self.state.lock().await;
        state.connections.values().find_map(|entry| {
            let session = entry.node.as_ref().filter(|session| session.node_id == node_id)?;
            Some(NodeTarget {
                session: session.clone(),
                queue: entry.queue.clone(),
                pending: entry.pending.clone(),
            })
        })
    }

    /// The node session attached to `conn_id`, if it is a node
    pub async fn node_session(&self, conn_id: &str) -> Option<NodeSession> {
        let state = self.state.lock().await;
        state.connections.get(conn_id)?.node.clone()
    }

    pub async fn list_nodes(&self) -> Vec<NodeSummary> {
        let state = self.state.lock().await;
        let mut nodes: Vec<_> = state
            .connections
            .values()
            .filter_map(|entry| {
                let session = entry.node.as_ref()?;
                Some(NodeSummary {
                    node_id: session.node_id.clone(),
                    conn_id: entry.conn_id.clone(),
                    display_name: session.display_name.clone(),
                    platform: session.platform.clone(),
                    version: session.version.clone(),
                    caps: session.caps.clone(),
                    commands: session.commands.clone(),
                    paired: session.paired,
                    connected_at_ms: session.connected_at_ms,
                })
            })
            .collect();
        nodes.sort_by(|left, right| left.node_id.cmp(&right.node_id));
        nodes
    }

    /// A node proved key possession on this connection
    pub async fn mark_node_paired(&self, conn_id: &str, node_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(session) = state
            .connections
            .get_mut(conn_id)
            .and_then(|entry| entry.node.as_mut())
        else {
            return false;
        };
        session.node_id = node_id.to_string();
        session.paired = true;
        state.bump_and_announce();
        true
    }

    /// Close every connection authenticated as `device_id`
    pub async fn disconnect_identity(&self, device_id: &str, reason: &str) -> usize {
        let state = self.state.lock().await;
        let mut closed = 0;
        for entry in state
            .connections
            .values()
            .filter(|entry| entry.device_id.as_deref() == Some(device_id))
        {
            entry.queue.close(close_codes::POLICY_VIOLATION, reason);
            closed += 1;
        }
        if closed > 0 {
            info!(device_id, closed, "Closed connections for identity");
        }
        closed
    }

    /// Announce shutdown, then close everything after it flushes
    pub async fn shutdown(&self, reason: &str, restart_expected_ms: Option<u64>) {
        let mut state = self.state.lock().await;
        state.shutting_down = true;
        let payload = serde_json::to_value(ShutdownEvent {
            reason: reason.to_string(),
            restart_expected_ms,
        })
        .unwrap_or_else(|_| json!({ "reason": reason }));
        state.broadcast(events::SHUTDOWN, &payload);
        for entry in state.connections.values() {
            entry.queue.close(close_codes::SERVICE_RESTART, reason);
        }
        info!(connections = state.connections.len(), reason, "Gateway shutting down");
    }
}
