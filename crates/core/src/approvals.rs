//! Exec approvals
//!
//! [`ExecPolicyStore`] holds the persisted policy layers (global default plus
//! per-node overrides). [`ApprovalManager`] is the interactive gate: pending
//! requests resolve exactly once, by an operator decision or by timeout, and a
//! timeout always resolves to `deny`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cp_protocol::methods::{
    ExecApprovalDecision, ExecApprovalRequest, ExecApprovalRequestParams, ExecApprovalScope,
    ExecApprovalStatus, ExecApprovalsNodeSnapshot, ExecApprovalsSnapshot, ExecAsk, ExecPolicy,
    ExecSecurity,
};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ApprovalError;
use crate::now_ms;

pub const DEFAULT_APPROVAL_TIMEOUT_MS: u64 = 120_000;
/// Resolved records stay queryable this long so duplicate resolves stay idempotent
const RESOLVED_RETENTION_MS: u64 = 10 * 60 * 1000;
pub const RESOLVED_BY_POLICY: &str = "policy";
pub const RESOLVED_BY_TIMEOUT: &str = "timeout";

// ---------------------------------------------------------------------------
// Policy layers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ExecApprovalsFile {
    #[serde(default = "file_version")]
    version: u32,
    #[serde(default)]
    defaults: ExecPolicy,
    #[serde(default)]
    nodes: BTreeMap<String, ExecPolicy>,
}

fn file_version() -> u32 {
    1
}

impl ExecApprovalsFile {
    fn hash(&self) -> Result<String, ApprovalError> {
        let encoded = serde_json::to_vec(self)
            .map_err(|err| ApprovalError::Storage(format!("Failed to encode exec approvals: {}", err)))?;
        Ok(hex::encode(Sha256::digest(&encoded)))
    }

    fn effective(&self, node_id: Option<&str>) -> &ExecPolicy {
        node_id
            .and_then(|node_id| self.nodes.get(node_id))
            .unwrap_or(&self.defaults)
    }
}

/// What the policy alone says about a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyOutcome {
    Allow,
    Deny,
    Ask,
}

/// A policy layer with its allowlist compiled to glob patterns
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    pub policy: ExecPolicy,
    patterns: Vec<Pattern>,
}

impl CompiledPolicy {
    pub fn compile(policy: ExecPolicy) -> Result<Self, ApprovalError> {
        let patterns = policy
            .allowlist
            .iter()
            .map(|pattern| {
                Pattern::new(pattern).map_err(|err| {
                    ApprovalError::InvalidInput(format!("Invalid allowlist pattern '{}': {}", pattern, err))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { policy, patterns })
    }

    pub fn evaluate(&self, command: &str, resolved_path: Option<&str>) -> PolicyOutcome {
        let policy = &self.policy;
        if policy.security == ExecSecurity::Deny {
            return PolicyOutcome::Deny;
        }
        if policy.ask == ExecAsk::Always {
            return PolicyOutcome::Ask;
        }
        if policy.security == ExecSecurity::Full {
            return PolicyOutcome::Allow;
        }

        let executable = command.split_whitespace().next().unwrap_or_default();
        let matched = self.patterns.iter().any(|pattern| {
            pattern.matches(command)
                || pattern.matches(executable)
                || resolved_path.is_some_and(|path| pattern.matches(path))
        });

        match (matched, policy.ask) {
            (true, _) => PolicyOutcome::Allow,
            (false, ExecAsk::Off) => PolicyOutcome::Deny,
            (false, _) => PolicyOutcome::Ask,
        }
    }
}

/// The persisted file plus every layer already compiled
struct PolicyState {
    file: ExecApprovalsFile,
    defaults: CompiledPolicy,
    nodes: HashMap<String, CompiledPolicy>,
}

impl PolicyState {
    fn compile(file: ExecApprovalsFile) -> Result<Self, ApprovalError> {
        let defaults = CompiledPolicy::compile(file.defaults.clone())?;
        let nodes = file
            .nodes
            .iter()
            .map(|(node_id, policy)| Ok((node_id.clone(), CompiledPolicy::compile(policy.clone())?)))
            .collect::<Result<HashMap<_, _>, ApprovalError>>()?;
        Ok(Self { file, defaults, nodes })
    }

    fn effective(&self, node_id: Option<&str>) -> &CompiledPolicy {
        node_id
            .and_then(|node_id| self.nodes.get(node_id))
            .unwrap_or(&self.defaults)
    }
}

#[derive(Clone)]
pub struct ExecPolicyStore {
    state: Arc<RwLock<PolicyState>>,
    file_path: PathBuf,
}

impl ExecPolicyStore {
    pub async fn new(state_dir: &Path) -> Result<Self, ApprovalError> {
        tokio::fs::create_dir_all(state_dir).await.map_err(|err| {
            ApprovalError::Storage(format!("Failed to create state dir: {}", err))
        })?;
        let file_path = state_dir.join("exec-approvals.json");
        let state = PolicyState::compile(load_policy_file(&file_path).await?)?;
        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            file_path,
        })
    }

    pub async fn get(&self) -> Result<ExecApprovalsSnapshot, ApprovalError> {
        let state = self.state.read().await;
        Ok(ExecApprovalsSnapshot {
            policy: state.file.defaults.clone(),
            hash: state.file.hash()?,
        })
    }

    pub async fn set(
        &self,
        policy: ExecPolicy,
        base_hash: Option<&str>,
    ) -> Result<ExecApprovalsSnapshot, ApprovalError> {
        let mut state = self.state.write().await;
        check_base_hash(&state.file, base_hash)?;
        let mut next = state.file.clone();
        next.defaults = normalize_policy(policy);
        self.commit(&mut state, next).await?;
        info!("Global exec policy updated");
        Ok(ExecApprovalsSnapshot {
            policy: state.file.defaults.clone(),
            hash: state.file.hash()?,
        })
    }

    pub async fn node_get(&self, node_id: &str) -> Result<ExecApprovalsNodeSnapshot, ApprovalError> {
        let state = self.state.read().await;
        node_snapshot(&state.file, node_id.trim())
    }

    /// `None` clears the override so the node falls back to the global default
    pub async fn node_set(
        &self,
        node_id: &str,
        policy: Option<ExecPolicy>,
        base_hash: Option<&str>,
    ) -> Result<ExecApprovalsNodeSnapshot, ApprovalError> {
        let node_id = node_id.trim();
        if node_id.is_empty() {
            return Err(ApprovalError::InvalidInput("nodeId cannot be empty".to_string()));
        }
        let mut state = self.state.write().await;
        check_base_hash(&state.file, base_hash)?;
        let mut next = state.file.clone();
        match policy {
            Some(policy) => {
                next.nodes.insert(node_id.to_string(), normalize_policy(policy));
            }
            None => {
                next.nodes.remove(node_id);
            }
        }
        self.commit(&mut state, next).await?;
        info!(node_id, "Node exec policy updated");
        node_snapshot(&state.file, node_id)
    }

    pub async fn effective(&self, node_id: Option<&str>) -> CompiledPolicy {
        self.state.read().await.effective(node_id).clone()
    }

    /// Append to the allowlist of whichever layer is effective for `node_id`
    pub async fn remember(&self, node_id: Option<&str>, pattern: &str) -> Result<(), ApprovalError> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write().await;
        let mut next = state.file.clone();
        let layer = match node_id {
            Some(node_id) if next.nodes.contains_key(node_id) => next.nodes.get_mut(node_id),
            _ => Some(&mut next.defaults),
        };
        let Some(layer) = layer else {
            return Ok(());
        };
        if layer.allowlist.iter().any(|existing| existing == pattern) {
            return Ok(());
        }
        layer.allowlist.push(pattern.to_string());
        self.commit(&mut state, next).await?;
        debug!(pattern, "Allowlist extended");
        Ok(())
    }

    /// Compile and persist `next`, then make it the live state
    async fn commit(&self, state: &mut PolicyState, next: ExecApprovalsFile) -> Result<(), ApprovalError> {
        let compiled = PolicyState::compile(next)?;
        persist_policy_file(&self.file_path, &compiled.file).await?;
        *state = compiled;
        Ok(())
    }
}

fn check_base_hash(state: &ExecApprovalsFile, base_hash: Option<&str>) -> Result<(), ApprovalError> {
    if let Some(base_hash) = base_hash {
        if state.hash()? != base_hash.trim() {
            return Err(ApprovalError::Conflict(
                "Exec approvals changed since they were read; reload and retry".to_string(),
            ));
        }
    }
    Ok(())
}

fn node_snapshot(state: &ExecApprovalsFile, node_id: &str) -> Result<ExecApprovalsNodeSnapshot, ApprovalError> {
    Ok(ExecApprovalsNodeSnapshot {
        node_id: node_id.to_string(),
        node_override: state.nodes.get(node_id).cloned(),
        effective: state.effective(Some(node_id)).clone(),
        hash: state.hash()?,
    })
}

fn normalize_policy(mut policy: ExecPolicy) -> ExecPolicy {
    let mut seen = std::collections::HashSet::new();
    policy.allowlist = policy
        .allowlist
        .into_iter()
        .map(|pattern| pattern.trim().to_string())
        .filter(|pattern| !pattern.is_empty() && seen.insert(pattern.clone()))
        .collect();
    policy
}

async fn load_policy_file(path: &Path) -> Result<ExecApprovalsFile, ApprovalError> {
    if !path.exists() {
        return Ok(ExecApprovalsFile {
            version: file_version(),
            ..Default::default()
        });
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| ApprovalError::Storage(format!("Failed to read exec approvals: {}", err)))?;
    if content.trim().is_empty() {
        return Ok(ExecApprovalsFile {
            version: file_version(),
            ..Default::default()
        });
    }
    serde_json::from_str(&content)
        .map_err(|err| ApprovalError::Storage(format!("Failed to parse exec approvals: {}", err)))
}

async fn persist_policy_file(path: &Path, state: &ExecApprovalsFile) -> Result<(), ApprovalError> {
    let content = serde_json::to_string_pretty(state)
        .map_err(|err| ApprovalError::Storage(format!("Failed to serialize exec approvals: {}", err)))?;
    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, content)
        .await
        .map_err(|err| ApprovalError::Storage(format!("Failed to write exec approvals: {}", err)))?;
    if let Err(err) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(ApprovalError::Storage(format!("Failed to write exec approvals: {}", err)));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Interactive gate
// ---------------------------------------------------------------------------

struct ApprovalEntry {
    record: ExecApprovalRequest,
    waiters: Vec<oneshot::Sender<ExecApprovalRequest>>,
    timer: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct ApprovalManager {
    entries: Arc<Mutex<HashMap<String, ApprovalEntry>>>,
    default_timeout_ms: u64,
}

/// Outcome of a resolve call
#[derive(Debug, Clone)]
pub struct Resolution {
    pub request: ExecApprovalRequest,
    /// False when the identical decision was already recorded
    pub changed: bool,
}

impl ApprovalManager {
    pub fn new(default_timeout_ms: u64) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            default_timeout_ms: if default_timeout_ms == 0 {
                DEFAULT_APPROVAL_TIMEOUT_MS
            } else {
                default_timeout_ms
            },
        }
    }

    /// Register a pending request and arm its fail-closed timer. The receiver
    /// yields the final record once resolved or expired.
    pub async fn create(
        &self,
        params: ExecApprovalRequestParams,
    ) -> Result<(ExecApprovalRequest, oneshot::Receiver<ExecApprovalRequest>), ApprovalError> {
        let timeout_ms = params.timeout_ms.unwrap_or(self.default_timeout_ms);
        let record = self.build_record(params, timeout_ms);
        let (tx, rx) = oneshot::channel();

        let mut entries = self.entries.lock().await;
        prune_locked(&mut entries, now_ms());
        if entries.contains_key(&record.id) {
            return Err(ApprovalError::Conflict(format!(
                "Approval '{}' already exists",
                record.id
            )));
        }

        let manager = self.clone();
        let id = record.id.clone();
        // Expiry takes the entries lock, so it cannot run before the insert below.
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            if let Some(expired) = manager.expire(&id).await {
                warn!(approval_id = %expired.id, "Exec approval timed out; denied");
            }
        });
        entries.insert(
            record.id.clone(),
            ApprovalEntry {
                record: record.clone(),
                waiters: vec![tx],
                timer: Some(timer),
            },
        );
        drop(entries);

        info!(approval_id = %record.id, command = %record.command, "Exec approval requested");
        Ok((record, rx))
    }

    /// Record a decision the policy made without asking anyone
    pub async fn record_automatic(
        &self,
        params: ExecApprovalRequestParams,
        decision: ExecApprovalDecision,
    ) -> Result<ExecApprovalRequest, ApprovalError> {
        let mut record = self.build_record(params, 0);
        let now = now_ms();
        record.status = status_for(decision);
        record.decision = Some(decision);
        record.resolved_at_ms = Some(now);
        record.resolved_by = Some(RESOLVED_BY_POLICY.to_string());

        let mut entries = self.entries.lock().await;
        prune_locked(&mut entries, now);
        if entries.contains_key(&record.id) {
            return Err(ApprovalError::Conflict(format!(
                "Approval '{}' already exists",
                record.id
            )));
        }
        entries.insert(
            record.id.clone(),
            ApprovalEntry {
                record: record.clone(),
                waiters: Vec::new(),
                timer: None,
            },
        );
        Ok(record)
    }

    /// Terminal: first decision wins, an identical repeat is a no-op, a
    /// different one is a Conflict.
    pub async fn resolve(
        &self,
        id: &str,
        decision: ExecApprovalDecision,
        resolved_by: Option<&str>,
    ) -> Result<Resolution, ApprovalError> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(id.trim())
            .ok_or_else(|| ApprovalError::NotFound(format!("Unknown approval id '{}'", id)))?;

        if let Some(existing) = entry.record.decision {
            if existing == decision {
                return Ok(Resolution {
                    request: entry.record.clone(),
                    changed: false,
                });
            }
            return Err(ApprovalError::Conflict(format!(
                "Approval '{}' was already resolved as {}",
                id,
                existing.as_str()
            )));
        }

        entry.record.status = status_for(decision);
        entry.record.decision = Some(decision);
        entry.record.resolved_at_ms = Some(now_ms());
        entry.record.resolved_by = resolved_by.map(str::to_string);
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        let record = entry.record.clone();
        for waiter in entry.waiters.drain(..) {
            let _ = waiter.send(record.clone());
        }

        info!(approval_id = %record.id, decision = decision.as_str(), "Exec approval resolved");
        Ok(Resolution {
            request: record,
            changed: true,
        })
    }

    /// Fail closed. Returns the record only if this call expired it.
    pub async fn expire(&self, id: &str) -> Option<ExecApprovalRequest> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(id)?;
        if entry.record.status != ExecApprovalStatus::Pending {
            return None;
        }
        entry.record.status = ExecApprovalStatus::Expired;
        entry.record.decision = Some(ExecApprovalDecision::Deny);
        entry.record.resolved_at_ms = Some(now_ms());
        entry.record.resolved_by = Some(RESOLVED_BY_TIMEOUT.to_string());
        entry.timer = None;
        let record = entry.record.clone();
        for waiter in entry.waiters.drain(..) {
            let _ = waiter.send(record.clone());
        }
        Some(record)
    }

    pub async fn get(&self, id: &str) -> Option<ExecApprovalRequest> {
        self.entries.lock().await.get(id).map(|entry| entry.record.clone())
    }

    pub async fn pending(&self) -> Vec<ExecApprovalRequest> {
        let entries = self.entries.lock().await;
        let mut pending: Vec<_> = entries
            .values()
            .filter(|entry| entry.record.status == ExecApprovalStatus::Pending)
            .map(|entry| entry.record.clone())
            .collect();
        pending.sort_by(|left, right| left.created_at_ms.cmp(&right.created_at_ms));
        pending
    }

    fn build_record(&self, params: ExecApprovalRequestParams, timeout_ms: u64) -> ExecApprovalRequest {
        let now = now_ms();
        let id = params
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let scope = if params.node_id.is_some() {
            ExecApprovalScope::Node
        } else {
            ExecApprovalScope::Global
        };
        ExecApprovalRequest {
            id,
            command: params.command,
            cwd: params.cwd,
            host: params.host,
            node_id: params.node_id,
            agent_id: params.agent_id,
            resolved_path: params.resolved_path,
            session_key: params.session_key,
            run_id: params.run_id,
            scope,
            status: ExecApprovalStatus::Pending,
            decision: None,
            created_at_ms: now,
            expires_at_ms: now.saturating_add(timeout_ms),
            resolved_at_ms: None,
            resolved_by: None,
        }
    }
}

fn status_for(decision: ExecApprovalDecision) -> ExecApprovalStatus {
    if decision.is_allow() {
        ExecApprovalStatus::Approved
    } else {
        ExecApprovalStatus::Denied
    }
}

fn prune_locked(entries: &mut HashMap<String, ApprovalEntry>, now: u64) {
    entries.retain(|_, entry| match entry.record.resolved_at_ms {
        Some(resolved_at) => now.saturating_sub(resolved_at) < RESOLVED_RETENTION_MS,
        None => true,
    });
}
