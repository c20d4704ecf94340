//! Process-scoped gateway state

use std::sync::Arc;
use std::time::Duration;

use cp_core::approvals::{ApprovalManager, ExecPolicyStore};
use cp_core::now_ms;
use cp_core::pairing::{PairingKind, PairingStore};
use cp_core::tokens::TokenIssuer;
use cp_core::trace::{FlusherHandle, TraceStore, DEFAULT_FLUSH_DELAY};
use cp_protocol::methods::AgentEventPayload;
use cp_protocol::{events, SchemaRegistry, ROLE_NODE};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::downstream::Downstream;
use crate::error::GatewayError;
use crate::gateway::hub::Hub;

const PAIRING_PRUNE_INTERVAL: Duration = Duration::from_secs(30);

/// Shared gateway state, cheap to clone
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    config: GatewayConfig,
    hub: Hub,
    registry: SchemaRegistry,
    tokens: TokenIssuer,
    devices: PairingStore,
    nodes: PairingStore,
    exec_policy: ExecPolicyStore,
    approvals: ApprovalManager,
    trace: TraceStore,
    downstream: Arc<dyn Downstream>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    flusher: Mutex<Option<FlusherHandle>>,
}

impl Gateway {
    /// Open every store under `config.state_dir`
    pub async fn new(config: GatewayConfig, downstream: Arc<dyn Downstream>) -> Result<Self, GatewayError> {
        let state_dir = config.state_dir.clone();
        let tokens = TokenIssuer::new(config.token_secret.clone(), config.device_token_ttl_seconds);

        let devices = PairingStore::new(
            state_dir.join(PairingKind::Device.dir_name()),
            PairingKind::Device,
            tokens.clone(),
            config.pairing_ttl_ms,
        )
        .await?;
        let nodes = PairingStore::new(
            state_dir.join(PairingKind::Node.dir_name()),
            PairingKind::Node,
            tokens.clone(),
            config.pairing_ttl_ms,
        )
        .await?;
        let exec_policy = ExecPolicyStore::new(&state_dir).await?;
        let trace = TraceStore::new(&state_dir).await?;

        info!("Gateway state loaded from {:?}", state_dir);

        Ok(Self {
            inner: Arc::new(GatewayInner {
                hub: Hub::new(Some(state_dir.display().to_string())),
                registry: SchemaRegistry::builtin(),
                approvals: ApprovalManager::new(config.approval_timeout_ms),
                tokens,
                devices,
                nodes,
                exec_policy,
                trace,
                downstream,
                config,
                tasks: Mutex::new(Vec::new()),
                flusher: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.inner.registry
    }

    pub fn tokens(&self) -> &TokenIssuer {
        &self.inner.tokens
    }

    pub fn pairing(&self, kind: PairingKind) -> &PairingStore {
        match kind {
            PairingKind::Device => &self.inner.devices,
            PairingKind::Node => &self.inner.nodes,
        }
    }

    /// Nodes pair through the node store, everything else as a device
    pub fn pairing_for_role(&self, role: &str) -> &PairingStore {
        if role == ROLE_NODE {
            &self.inner.nodes
        } else {
            &self.inner.devices
        }
    }

    pub fn exec_policy(&self) -> &ExecPolicyStore {
        &self.inner.exec_policy
    }

    pub fn approvals(&self) -> &ApprovalManager {
        &self.inner.approvals
    }

    pub fn trace(&self) -> &TraceStore {
        &self.inner.trace
    }

    pub fn downstream(&self) -> &Arc<dyn Downstream> {
        &self.inner.downstream
    }

    /// Serialize and push an event to every connection allowed to see it
    pub async fn broadcast<T: Serialize>(&self, event: &str, payload: &T) -> Result<usize, GatewayError> {
        let payload = serde_json::to_value(payload)?;
        Ok(self.hub().broadcast(event, payload).await)
    }

    /// Trace an agent-runtime event, then fan it out as `agent`
    pub async fn publish_agent_event(&self, event: AgentEventPayload) -> Result<usize, GatewayError> {
        if let Err(err) = self.trace().append(event.clone().into()).await {
            warn!(run_id = %event.run_id, "Failed to trace agent event: {}", err);
        }
        self.broadcast(events::AGENT, &event).await
    }

    /// Start the tick, pairing-prune and trace-flush tasks
    pub async fn start_background(&self) {
        let mut tasks = self.inner.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }

        let gateway = self.clone();
        let tick_interval = Duration::from_millis(self.config().tick_interval_ms);
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                gateway.hub().tick(now_ms()).await;
            }
        }));

        let gateway = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(PAIRING_PRUNE_INTERVAL);
            loop {
                interval.tick().await;
                for kind in [PairingKind::Device, PairingKind::Node] {
                    match gateway.pairing(kind).prune_expired().await {
                        Ok(expired) if !expired.is_empty() => {
                            debug!(kind = kind.as_str(), count = expired.len(), "Expired pairing requests");
                        }
                        Ok(_) => {}
                        Err(err) => warn!(kind = kind.as_str(), "Pairing prune failed: {}", err),
                    }
                }
            }
        }));

        *self.inner.flusher.lock().await = Some(self.trace().spawn_flusher(DEFAULT_FLUSH_DELAY));
        info!(tick_ms = self.config().tick_interval_ms, "Background tasks started");
    }

    /// Broadcast `shutdown`, close every connection and stop background work
    pub async fn shutdown(&self, reason: &str, restart_expected_ms: Option<u64>) {
        self.hub().shutdown(reason, restart_expected_ms).await;

        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Some(flusher) = self.inner.flusher.lock().await.take() {
            flusher.shutdown().await;
        } else {
            self.trace().flush_all().await;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::build_gateway;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn agent_events_are_traced() {
        let (gateway, _temp_dir) = build_gateway(|_| {}).await;
        gateway
            .publish_agent_event(AgentEventPayload {
                run_id: "run-1".into(),
                seq: 1,
                stream: "tool".into(),
                ts: 100,
                data: json!({ "phase": "start", "name": "exec" }),
                session_key: Some("main".into()),
                source_run_id: None,
                client_run_id: None,
            })
            .await
            .unwrap();

        let run = gateway.trace().get_run_events("run-1", None).await.unwrap();
        assert_eq!(run.events.len(), 1);
        assert_eq!(run.meta.unwrap().tool_calls, 1);
    }

    #[tokio::test]
    async fn shutdown_stops_background_and_flushes() {
        let (gateway, temp_dir) = build_gateway(|config| config.tick_interval_ms = 10).await;
        gateway.start_background().await;
        gateway
            .publish_agent_event(AgentEventPayload {
                run_id: "run-2".into(),
                seq: 1,
                stream: "lifecycle".into(),
                ts: 200,
                data: json!({ "phase": "start" }),
                session_key: None,
                source_run_id: None,
                client_run_id: None,
            })
            .await
            .unwrap();
        gateway.shutdown("test", None).await;

        let meta = temp_dir.path().join("trace").join("runs").join("run-2.meta.json");
        assert!(meta.exists());
        assert!(gateway.inner.tasks.lock().await.is_empty());
    }
}
