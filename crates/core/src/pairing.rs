//! Device & node pairing
//!
//! Both workflows share one store type, parameterised by [`PairingKind`]:
//! request -> approve/reject (terminal) -> verify, plus token rotate/revoke.
//! State lives behind one `RwLock`. Every mutation is applied to a copy,
//! written to `<base_dir>/pairing.json` (tmp file + rename) and only then
//! swapped in, so a failed write leaves memory and disk unchanged.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cp_protocol::handshake::{scopes, ROLE_NODE, ROLE_OPERATOR};
use cp_protocol::methods::{
    DeviceTokenRevokeResult, IssuedToken, PairApproveResult, PairListResult, PairRejectResult,
    PairVerifyResult, PairedIdentity, PairingRequest, PairingStatus,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::device_auth::{self, pair_verify_payload};
use crate::error::PairingError;
use crate::now_ms;
use crate::tokens::TokenIssuer;

pub const DEFAULT_PAIRING_TTL_MS: u64 = 5 * 60 * 1000;
/// How long resolved requests are kept so late duplicates see a Conflict
const RESOLVED_RETENTION_MS: u64 = 24 * 60 * 60 * 1000;
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairingKind {
    Device,
    Node,
}

impl PairingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Node => "node",
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Device => "devices",
            Self::Node => "nodes",
        }
    }

    fn default_role(self) -> &'static str {
        match self {
            Self::Device => ROLE_OPERATOR,
            Self::Node => ROLE_NODE,
        }
    }

    fn default_scopes(self) -> Vec<String> {
        match self {
            Self::Device => vec![scopes::ADMIN.to_string()],
            Self::Node => Vec::new(),
        }
    }
}

/// What a requester claims about itself
#[derive(Debug, Clone, Default)]
pub struct PairRequestInput {
    pub identity_id: String,
    pub public_key: String,
    pub display_name: Option<String>,
    pub platform: Option<String>,
    pub version: Option<String>,
    pub remote_ip: Option<String>,
    pub caps: Vec<String>,
    pub commands: Vec<String>,
    pub role: Option<String>,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityRecord {
    identity_id: String,
    public_key: String,
    role: String,
    scopes: Vec<String>,
    display_name: Option<String>,
    platform: Option<String>,
    approved_at_ms: u64,
    verified_at_ms: Option<u64>,
    revoked_at_ms: Option<u64>,
    token_version: u64,
}

#[derive(Debug, Default, Clone)]
struct PairingState {
    requests: HashMap<String, PairingRequest>,
    paired: HashMap<String, IdentityRecord>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredPairingState {
    requests: Vec<PairingRequest>,
    paired: Vec<IdentityRecord>,
}

impl From<StoredPairingState> for PairingState {
    fn from(value: StoredPairingState) -> Self {
        Self {
            requests: value
                .requests
                .into_iter()
                .map(|request| (request.request_id.clone(), request))
                .collect(),
            paired: value
                .paired
                .into_iter()
                .map(|record| (record.identity_id.clone(), record))
                .collect(),
        }
    }
}

impl From<&PairingState> for StoredPairingState {
    fn from(value: &PairingState) -> Self {
        let mut requests: Vec<_> = value.requests.values().cloned().collect();
        requests.sort_by(|left, right| left.created_at_ms.cmp(&right.created_at_ms));
        let mut paired: Vec<_> = value.paired.values().cloned().collect();
        paired.sort_by(|left, right| left.identity_id.cmp(&right.identity_id));
        Self { requests, paired }
    }
}

#[derive(Clone)]
pub struct PairingStore {
    kind: PairingKind,
    state: Arc<RwLock<PairingState>>,
    file_path: PathBuf,
    issuer: TokenIssuer,
    ttl_ms: u64,
}

impl PairingStore {
    pub async fn new(
        base_dir: PathBuf,
        kind: PairingKind,
        issuer: TokenIssuer,
        ttl_ms: u64,
    ) -> Result<Self, PairingError> {
        tokio::fs::create_dir_all(&base_dir).await.map_err(|err| {
            PairingError::Storage(format!("Failed to create pairing dir: {}", err))
        })?;

        let file_path = base_dir.join("pairing.json");
        let state = load_state(&file_path).await?;
        debug!(
            kind = kind.as_str(),
            requests = state.requests.len(),
            paired = state.paired.len(),
            "Loaded pairing state"
        );

        Ok(Self {
            kind,
            state: Arc::new(RwLock::new(state)),
            file_path,
            issuer,
            ttl_ms: if ttl_ms == 0 { DEFAULT_PAIRING_TTL_MS } else { ttl_ms },
        })
    }

    pub fn kind(&self) -> PairingKind {
        self.kind
    }

    /// Open (or reuse) a pending request. Returns `(request, created)`.
    pub async fn request(&self, input: PairRequestInput) -> Result<(PairingRequest, bool), PairingError> {
        let identity_id = normalize_identity_id(&input.identity_id)?;
        let public_key = input.public_key.trim().to_string();
        device_auth::validate_public_key(&public_key)
            .map_err(|err| PairingError::InvalidInput(err.to_string()))?;

        let now = now_ms();
        let mut state = self.state.write().await;
        let mut next = state.clone();
        prune_locked(&mut next, now);

        if let Some(record) = next.paired.get(&identity_id) {
            if record.revoked_at_ms.is_none() && record.public_key == public_key {
                return Err(PairingError::Conflict(format!(
                    "{} '{}' is already paired",
                    self.kind.as_str(),
                    identity_id
                )));
            }
        }

        let existing = next
            .requests
            .values()
            .find(|request| request.status == PairingStatus::Pending && request.identity_id == identity_id)
            .cloned();
        if let Some(existing) = existing {
            if existing.public_key == public_key {
                return Ok((existing, false));
            }
            // A new key for the same identity supersedes the old pending request.
            next.requests.remove(&existing.request_id);
        }

        let role = normalize_optional(input.role).unwrap_or_else(|| self.kind.default_role().to_string());
        let scopes = if input.scopes.is_empty() {
            self.kind.default_scopes()
        } else {
            input.scopes
        };

        let request = PairingRequest {
            request_id: Uuid::new_v4().to_string(),
            identity_id,
            public_key,
            code: generate_code(),
            role,
            scopes,
            display_name: normalize_optional(input.display_name),
            platform: normalize_optional(input.platform),
            version: normalize_optional(input.version),
            remote_ip: normalize_optional(input.remote_ip),
            caps: input.caps,
            commands: input.commands,
            status: PairingStatus::Pending,
            created_at_ms: now,
            expires_at_ms: now.saturating_add(self.ttl_ms),
            resolved_at_ms: None,
            resolved_by: None,
        };
        next.requests.insert(request.request_id.clone(), request.clone());
        self.commit(&mut state, next).await?;

        info!(
            kind = self.kind.as_str(),
            request_id = %request.request_id,
            identity_id = %request.identity_id,
            "Pairing requested"
        );
        Ok((request, true))
    }

    pub async fn list(&self) -> PairListResult {
        let now = now_ms();
        let state = self.state.read().await;

        let mut pending: Vec<_> = state
            .requests
            .values()
            .filter(|request| request.status == PairingStatus::Pending && request.expires_at_ms > now)
            .cloned()
            .collect();
        pending.sort_by(|left, right| left.created_at_ms.cmp(&right.created_at_ms));

        let mut paired: Vec<_> = state.paired.values().map(to_paired_identity).collect();
        paired.sort_by(|left, right| left.identity_id.cmp(&right.identity_id));

        PairListResult { pending, paired }
    }

    pub async fn pending_count(&self) -> usize {
        let now = now_ms();
        let state = self.state.read().await;
        state
            .requests
            .values()
            .filter(|request| request.status == PairingStatus::Pending && request.expires_at_ms > now)
            .count()
    }

    pub async fn approve(
        &self,
        request_id: &str,
        resolved_by: Option<&str>,
    ) -> Result<PairApproveResult, PairingError> {
        let now = now_ms();
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let request = resolve_locked(&mut next, request_id, PairingStatus::Approved, resolved_by, now)?;

        let token_version = next
            .paired
            .get(&request.identity_id)
            .map(|record| record.token_version.saturating_add(1))
            .unwrap_or(1);
        let record = IdentityRecord {
            identity_id: request.identity_id.clone(),
            public_key: request.public_key.clone(),
            role: request.role.clone(),
            scopes: request.scopes.clone(),
            display_name: request.display_name.clone(),
            platform: request.platform.clone(),
            approved_at_ms: now,
            verified_at_ms: None,
            revoked_at_ms: None,
            token_version,
        };
        let token = self.issue_for(&record)?;
        next.paired.insert(record.identity_id.clone(), record);
        self.commit(&mut state, next).await?;

        info!(
            kind = self.kind.as_str(),
            request_id = %request.request_id,
            identity_id = %request.identity_id,
            "Pairing approved"
        );
        Ok(PairApproveResult { request, token })
    }

    pub async fn reject(
        &self,
        request_id: &str,
        resolved_by: Option<&str>,
    ) -> Result<PairRejectResult, PairingError> {
        let now = now_ms();
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let request = resolve_locked(&mut next, request_id, PairingStatus::Rejected, resolved_by, now)?;
        self.commit(&mut state, next).await?;

        info!(
            kind = self.kind.as_str(),
            request_id = %request.request_id,
            identity_id = %request.identity_id,
            "Pairing rejected"
        );
        Ok(PairRejectResult { request })
    }

    /// Requester proves it still holds the key it asked to pair with
    pub async fn verify(&self, request_id: &str, signature: &str) -> Result<PairVerifyResult, PairingError> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let request = next
            .requests
            .get(request_id.trim())
            .cloned()
            .ok_or_else(|| PairingError::NotFound("Pairing request not found".to_string()))?;

        match request.status {
            PairingStatus::Approved => {}
            PairingStatus::Pending => {
                return Err(PairingError::Forbidden("Pairing request is not approved yet".to_string()))
            }
            PairingStatus::Rejected => {
                return Err(PairingError::Forbidden("Pairing request was rejected".to_string()))
            }
        }

        let record = next
            .paired
            .get_mut(&request.identity_id)
            .filter(|record| record.public_key == request.public_key && record.revoked_at_ms.is_none())
            .ok_or_else(|| PairingError::Forbidden("Approval is no longer active".to_string()))?;

        device_auth::verify_signature(
            &request.public_key,
            &pair_verify_payload(&request.request_id, &request.code),
            signature,
        )
        .map_err(|err| PairingError::Unauthorized(err.to_string()))?;

        let verified_at_ms = now_ms();
        record.verified_at_ms = Some(verified_at_ms);
        let identity_id = record.identity_id.clone();
        self.commit(&mut state, next).await?;

        Ok(PairVerifyResult {
            identity_id,
            verified_at_ms,
        })
    }

    /// Paired identity with this id and public key, if active
    pub async fn paired_identity(&self, identity_id: &str) -> Option<PairedIdentity> {
        let state = self.state.read().await;
        state
            .paired
            .get(identity_id)
            .filter(|record| record.revoked_at_ms.is_none())
            .map(to_paired_identity)
    }

    /// A fresh signature at connect time counts as proof of possession.
    /// Returns a token bound to the current version.
    pub async fn confirm_connect(&self, identity_id: &str, public_key: &str) -> Result<IssuedToken, PairingError> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let record = next
            .paired
            .get_mut(identity_id)
            .filter(|record| record.revoked_at_ms.is_none())
            .ok_or_else(|| PairingError::NotFound(format!("{} is not paired", self.kind.as_str())))?;

        if record.public_key != public_key.trim() {
            return Err(PairingError::Unauthorized("Public key does not match pairing".to_string()));
        }

        let first_verify = record.verified_at_ms.is_none();
        if first_verify {
            record.verified_at_ms = Some(now_ms());
        }
        let record = record.clone();
        let token = self.issue_for(&record)?;
        if first_verify {
            self.commit(&mut state, next).await?;
        }
        Ok(token)
    }

    /// Invalidate the old token and issue a new one under one write lock
    pub async fn rotate_token(
        &self,
        identity_id: &str,
        role: Option<String>,
        scopes: Option<Vec<String>>,
    ) -> Result<IssuedToken, PairingError> {
        let identity_id = normalize_identity_id(identity_id)?;
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let record = next
            .paired
            .get_mut(&identity_id)
            .ok_or_else(|| PairingError::NotFound(format!("{} is not paired", self.kind.as_str())))?;

        if record.revoked_at_ms.is_some() {
            return Err(PairingError::Forbidden(format!(
                "{} '{}' is revoked",
                self.kind.as_str(),
                identity_id
            )));
        }

        record.token_version = record.token_version.saturating_add(1);
        if let Some(role) = normalize_optional(role) {
            record.role = role;
        }
        if let Some(scopes) = scopes {
            record.scopes = scopes;
        }
        let record = record.clone();
        let issued = self.issue_for(&record)?;
        self.commit(&mut state, next).await?;

        info!(kind = self.kind.as_str(), identity_id = %identity_id, "Token rotated");
        Ok(issued)
    }

    pub async fn revoke_token(&self, identity_id: &str) -> Result<DeviceTokenRevokeResult, PairingError> {
        let identity_id = normalize_identity_id(identity_id)?;
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let record = next
            .paired
            .get_mut(&identity_id)
            .ok_or_else(|| PairingError::NotFound(format!("{} is not paired", self.kind.as_str())))?;

        let revoked_at_ms = match record.revoked_at_ms {
            Some(revoked_at_ms) => revoked_at_ms,
            None => {
                let now = now_ms();
                record.token_version = record.token_version.saturating_add(1);
                record.revoked_at_ms = Some(now);
                now
            }
        };
        self.commit(&mut state, next).await?;

        info!(kind = self.kind.as_str(), identity_id = %identity_id, "Token revoked");
        Ok(DeviceTokenRevokeResult {
            identity_id,
            revoked_at_ms,
        })
    }

    /// Check a bearer token presented by `identity_id`
    pub async fn verify_token(&self, identity_id: &str, token: &str) -> Result<PairedIdentity, PairingError> {
        let claims = self.issuer.decode(token)?;
        if claims.kind != self.kind.as_str() || claims.identity_id != identity_id {
            return Err(PairingError::Forbidden("Token does not belong to this identity".to_string()));
        }

        let state = self.state.read().await;
        let record = state
            .paired
            .get(&claims.identity_id)
            .ok_or_else(|| PairingError::Unauthorized(format!("{} is not paired", self.kind.as_str())))?;

        if record.revoked_at_ms.is_some() {
            return Err(PairingError::Forbidden("Token was revoked".to_string()));
        }
        if record.verified_at_ms.is_none() {
            return Err(PairingError::Forbidden("Pairing is not verified".to_string()));
        }
        if record.token_version != claims.token_version {
            return Err(PairingError::Unauthorized(
                "Token version is stale; rotate required".to_string(),
            ));
        }
        Ok(to_paired_identity(record))
    }

    /// Drop expired pending requests and old resolved ones
    pub async fn prune_expired(&self) -> Result<Vec<PairingRequest>, PairingError> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let expired = prune_locked(&mut next, now_ms());
        if !expired.is_empty() {
            self.commit(&mut state, next).await?;
            debug!(kind = self.kind.as_str(), count = expired.len(), "Pruned expired pairing requests");
        }
        Ok(expired)
    }

    /// Persist `next`, then make it the live state
    async fn commit(&self, state: &mut PairingState, next: PairingState) -> Result<(), PairingError> {
        persist_state(&self.file_path, &next).await?;
        *state = next;
        Ok(())
    }

    fn issue_for(&self, record: &IdentityRecord) -> Result<IssuedToken, PairingError> {
        self.issuer.issue(
            self.kind.as_str(),
            &record.identity_id,
            &record.role,
            &record.scopes,
            record.token_version,
        )
    }
}

fn resolve_locked(
    state: &mut PairingState,
    request_id: &str,
    status: PairingStatus,
    resolved_by: Option<&str>,
    now: u64,
) -> Result<PairingRequest, PairingError> {
    let request_id = request_id.trim();
    let request = state
        .requests
        .get_mut(request_id)
        .ok_or_else(|| PairingError::NotFound("Pairing request not found".to_string()))?;

    if request.status != PairingStatus::Pending {
        return Err(PairingError::Conflict(format!(
            "Pairing request '{}' is already {}",
            request_id,
            status_label(request.status)
        )));
    }
    if request.expires_at_ms <= now {
        state.requests.remove(request_id);
        return Err(PairingError::NotFound("Pairing request expired".to_string()));
    }

    request.status = status;
    request.resolved_at_ms = Some(now);
    request.resolved_by = resolved_by.map(str::to_string);
    Ok(request.clone())
}

fn prune_locked(state: &mut PairingState, now: u64) -> Vec<PairingRequest> {
    let mut expired = Vec::new();
    state.requests.retain(|_, request| match request.status {
        PairingStatus::Pending if request.expires_at_ms <= now => {
            expired.push(request.clone());
            false
        }
        PairingStatus::Pending => true,
        _ => request
            .resolved_at_ms
            .map(|resolved_at| now.saturating_sub(resolved_at) < RESOLVED_RETENTION_MS)
            .unwrap_or(true),
    });
    expired
}

fn status_label(status: PairingStatus) -> &'static str {
    match status {
        PairingStatus::Pending => "pending",
        PairingStatus::Approved => "approved",
        PairingStatus::Rejected => "rejected",
    }
}

fn to_paired_identity(record: &IdentityRecord) -> PairedIdentity {
    PairedIdentity {
        identity_id: record.identity_id.clone(),
        public_key: record.public_key.clone(),
        role: record.role.clone(),
        scopes: record.scopes.clone(),
        display_name: record.display_name.clone(),
        platform: record.platform.clone(),
        approved_at_ms: record.approved_at_ms,
        verified_at_ms: record.verified_at_ms,
        revoked_at_ms: record.revoked_at_ms,
    }
}

fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

fn normalize_identity_id(value: &str) -> Result<String, PairingError> {
    let normalized = value.trim().to_string();
    if normalized.is_empty() {
        return Err(PairingError::InvalidInput("identity id cannot be empty".to_string()));
    }
    if normalized.len() > 256 {
        return Err(PairingError::InvalidInput("identity id is too long".to_string()));
    }
    Ok(normalized)
}

fn normalize_optional(value: Option<String>) -> Option<String> {
    value.and_then(|item| {
        let trimmed = item.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

async fn load_state(path: &Path) -> Result<PairingState, PairingError> {
    if !path.exists() {
        return Ok(PairingState::default());
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| PairingError::Storage(format!("Failed to read pairing state: {}", err)))?;
    if content.trim().is_empty() {
        return Ok(PairingState::default());
    }
    let state: StoredPairingState = serde_json::from_str(&content)
        .map_err(|err| PairingError::Storage(format!("Failed to parse pairing state: {}", err)))?;
    Ok(state.into())
}

async fn persist_state(path: &Path, state: &PairingState) -> Result<(), PairingError> {
    let content = serde_json::to_string_pretty(&StoredPairingState::from(state))
        .map_err(|err| PairingError::Storage(format!("Failed to serialize pairing state: {}", err)))?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|err| {
            PairingError::Storage(format!("Failed to create pairing dir: {}", err))
        })?;
    }

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, content)
        .await
        .map_err(|err| PairingError::Storage(format!("Failed to write pairing state: {}", err)))?;
    if let Err(err) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(PairingError::Storage(format!("Failed to write pairing state: {}", err)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::device_auth::test_keys::{public_key, sign, signing_key};

    async fn build_store(kind: PairingKind) -> (PairingStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = PairingStore::new(
            temp_dir.path().join(kind.dir_name()),
            kind,
            TokenIssuer::new("test-secret", 3600),
            60_000,
        )
        .await
        .unwrap();
        (store, temp_dir)
    }

    fn input(identity_id: &str, seed: u8) -> PairRequestInput {
        PairRequestInput {
            identity_id: identity_id.to_string(),
            public_key: public_key(&signing_key(seed)),
            display_name: Some("Laptop".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn request_approve_verify_token_flow() {
        let (store, _temp_dir) = build_store(PairingKind::Node).await;
        let (request, created) = store.request(input("node-a", 1)).await.unwrap();
        assert!(created);
        assert_eq!(request.code.len(), CODE_LEN);
        assert_eq!(request.role, ROLE_NODE);

        let (again, created) = store.request(input("node-a", 1)).await.unwrap();
        assert!(!created);
        assert_eq!(again.request_id, request.request_id);

        let approved = store.approve(&request.request_id, Some("admin")).await.unwrap();
        assert_eq!(approved.request.status, PairingStatus::Approved);

        let err = store.verify_token("node-a", &approved.token.token).await.unwrap_err();
        assert!(matches!(err, PairingError::Forbidden(_)));

        let signature = sign(&signing_key(1), &pair_verify_payload(&request.request_id, &request.code));
        store.verify(&request.request_id, &signature).await.unwrap();

        let identity = store.verify_token("node-a", &approved.token.token).await.unwrap();
        assert_eq!(identity.identity_id, "node-a");
    }

    #[tokio::test]
    async fn second_resolution_is_a_conflict_and_approval_stands() {
        let (store, _temp_dir) = build_store(PairingKind::Device).await;
        let (request, _) = store.request(input("dev-1", 2)).await.unwrap();

        store.approve(&request.request_id, None).await.unwrap();
        let err = store.reject(&request.request_id, None).await.unwrap_err();
        assert!(matches!(err, PairingError::Conflict(_)));
        let err = store.approve(&request.request_id, None).await.unwrap_err();
        assert!(matches!(err, PairingError::Conflict(_)));

        let listed = store.list().await;
        assert!(listed.pending.is_empty());
        assert_eq!(listed.paired.len(), 1);
        assert!(store.paired_identity("dev-1").await.is_some());
    }

    #[tokio::test]
    async fn verify_with_wrong_key_fails() {
        let (store, _temp_dir) = build_store(PairingKind::Node).await;
        let (request, _) = store.request(input("node-b", 3)).await.unwrap();
        store.approve(&request.request_id, None).await.unwrap();

        let forged = sign(&signing_key(99), &pair_verify_payload(&request.request_id, &request.code));
        let err = store.verify(&request.request_id, &forged).await.unwrap_err();
        assert!(matches!(err, PairingError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn rotate_invalidates_old_token_and_revoke_invalidates_all() {
        let (store, _temp_dir) = build_store(PairingKind::Device).await;
        let (request, _) = store.request(input("dev-2", 4)).await.unwrap();
        store.approve(&request.request_id, None).await.unwrap();
        let first = store
            .confirm_connect("dev-2", &public_key(&signing_key(4)))
            .await
            .unwrap();
        store.verify_token("dev-2", &first.token).await.unwrap();

        let rotated = store.rotate_token("dev-2", None, None).await.unwrap();
        let err = store.verify_token("dev-2", &first.token).await.unwrap_err();
        assert!(matches!(err, PairingError::Unauthorized(_)));
        store.verify_token("dev-2", &rotated.token).await.unwrap();

        store.revoke_token("dev-2").await.unwrap();
        let err = store.verify_token("dev-2", &rotated.token).await.unwrap_err();
        assert!(matches!(err, PairingError::Forbidden(_)));
        assert!(store.paired_identity("dev-2").await.is_none());
    }

    #[tokio::test]
    async fn state_survives_reload() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("devices");
        let issuer = TokenIssuer::new("test-secret", 3600);
        let store = PairingStore::new(dir.clone(), PairingKind::Device, issuer.clone(), 60_000)
            .await
            .unwrap();
        let (request, _) = store.request(input("dev-3", 5)).await.unwrap();
        store.approve(&request.request_id, None).await.unwrap();

        let reloaded = PairingStore::new(dir, PairingKind::Device, issuer, 60_000)
            .await
            .unwrap();
        assert!(reloaded.paired_identity("dev-3").await.is_some());
        let err = reloaded.reject(&request.request_id, None).await.unwrap_err();
        assert!(matches!(err, PairingError::Conflict(_)));
    }

    #[tokio::test]
    async fn failed_write_leaves_request_pending() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("devices");
        let store = PairingStore::new(
            dir.clone(),
            PairingKind::Device,
            TokenIssuer::new("test-secret", 3600),
            60_000,
        )
        .await
        .unwrap();
        let (request, _) = store.request(input("dev-4", 7)).await.unwrap();

        let file_path = dir.join("pairing.json");
        std::fs::remove_file(&file_path).unwrap();
        std::fs::create_dir(&file_path).unwrap();

        let err = store.approve(&request.request_id, Some("admin")).await.unwrap_err();
        assert!(matches!(err, PairingError::Storage(_)));
        let listed = store.list().await;
        assert_eq!(listed.pending.len(), 1);
        assert_eq!(listed.pending[0].status, PairingStatus::Pending);
        assert!(listed.paired.is_empty());
        assert!(store.revoke_token("dev-4").await.is_err());

        std::fs::remove_dir(&file_path).unwrap();
        let rejected = store.reject(&request.request_id, None).await.unwrap();
        assert_eq!(rejected.request.status, PairingStatus::Rejected);
        assert!(!dir.join("pairing.json.tmp").exists());
    }

    #[tokio::test]
    async fn expired_requests_are_pruned() {
        let temp_dir = TempDir::new().unwrap();
        let store = PairingStore::new(
            temp_dir.path().join("nodes"),
            PairingKind::Node,
            TokenIssuer::new("test-secret", 3600),
            1,
        )
        .await
        .unwrap();
        let (request, _) = store.request(input("node-c", 6)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let expired = store.prune_expired().await.unwrap();
        assert_eq!(expired.len(), 1);
        let err = store.approve(&request.request_id, None).await.unwrap_err();
        assert!(matches!(err, PairingError::NotFound(_)));
    }
}
