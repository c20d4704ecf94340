//! Handshake types: `connect` params and the `hello-ok` reply

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::schema::{non_empty, non_empty_all, non_empty_opt, Validate, ValidationError};
use crate::snapshot::Snapshot;

/// Role an operator UI/CLI connects with
pub const ROLE_OPERATOR: &str = "operator";
/// Role a peer execution node connects with
pub const ROLE_NODE: &str = "node";

pub mod scopes {
    pub const ADMIN: &str = "operator.admin";
    pub const APPROVALS: &str = "operator.approvals";
    pub const PAIRING: &str = "operator.pairing";
    pub const READ: &str = "operator.read";
    pub const WRITE: &str = "operator.write";
}

/// Client mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientMode {
    Webchat,
    Cli,
    Ui,
    Backend,
    Node,
    Probe,
    Test,
}

impl ClientMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Webchat => "webchat",
            Self::Cli => "cli",
            Self::Ui => "ui",
            Self::Backend => "backend",
            Self::Node => "node",
            Self::Probe => "probe",
            Self::Test => "test",
        }
    }
}

/// Client identity sent in `connect`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClientInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub version: String,
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_identifier: Option<String>,
    pub mode: ClientMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

/// Proof of possession of a device key, signed over the connect challenge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeviceProof {
    pub id: String,
    pub public_key: String,
    pub signature: String,
    pub signed_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Shared-secret auth
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Params of the first request on every connection (`connect`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caps: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<BTreeMap<String, bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceProof>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl ConnectParams {
    pub fn role(&self) -> &str {
        self.role.as_deref().unwrap_or(ROLE_OPERATOR)
    }
}

impl Validate for ConnectParams {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.min_protocol < 1 {
            return Err(ValidationError::new("minProtocol", "must be >= 1"));
        }
        if self.max_protocol < 1 {
            return Err(ValidationError::new("maxProtocol", "must be >= 1"));
        }
        if self.min_protocol > self.max_protocol {
            return Err(ValidationError::new("minProtocol", "must not exceed maxProtocol"));
        }

        non_empty("client.id", &self.client.id)?;
        non_empty("client.version", &self.client.version)?;
        non_empty("client.platform", &self.client.platform)?;
        non_empty_opt("client.displayName", self.client.display_name.as_deref())?;
        non_empty_opt("client.instanceId", self.client.instance_id.as_deref())?;
        non_empty_all("caps", self.caps.as_deref())?;
        non_empty_all("commands", self.commands.as_deref())?;
        non_empty_all("scopes", self.scopes.as_deref())?;
        non_empty_opt("role", self.role.as_deref())?;

        if let Some(device) = &self.device {
            non_empty("device.id", &device.id)?;
            non_empty("device.publicKey", &device.public_key)?;
            non_empty("device.signature", &device.signature)?;
            non_empty_opt("device.nonce", device.nonce.as_deref())?;
            if device.signed_at < 0 {
                return Err(ValidationError::new("device.signedAt", "must be >= 0"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HelloOkKind {
    #[serde(rename = "hello-ok")]
    HelloOk,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServerInfo {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub conn_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Features {
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

/// Token issued to a paired device at handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IssuedAuth {
    pub device_token: String,
    pub role: String,
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at_ms: Option<u64>,
}

/// Connection policy, fixed for the lifetime of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Policy {
    pub max_payload: usize,
    pub max_buffered_bytes: usize,
    pub tick_interval_ms: u64,
}

impl Validate for Policy {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.max_payload == 0 {
            return Err(ValidationError::new("maxPayload", "must be >= 1"));
        }
        if self.max_buffered_bytes == 0 {
            return Err(ValidationError::new("maxBufferedBytes", "must be >= 1"));
        }
        if self.tick_interval_ms == 0 {
            return Err(ValidationError::new("tickIntervalMs", "must be >= 1"));
        }
        Ok(())
    }
}

/// Successful handshake payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HelloOk {
    #[serde(rename = "type")]
    pub kind: HelloOkKind,
    pub protocol: u32,
    pub server: ServerInfo,
    pub features: Features,
    pub snapshot: Snapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<IssuedAuth>,
    pub policy: Policy,
}

impl Validate for HelloOk {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.protocol < 1 {
            return Err(ValidationError::new("protocol", "must be >= 1"));
        }
        non_empty("server.version", &self.server.version)?;
        non_empty("server.connId", &self.server.conn_id)?;
        self.policy.validate().map_err(|err| err.within("policy"))?;
        if let Some(auth) = &self.auth {
            non_empty("auth.deviceToken", &auth.device_token)?;
            non_empty("auth.role", &auth.role)?;
        }
        Ok(())
    }
}

/// `connect.challenge` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectChallenge {
    pub nonce: String,
    pub ts: u64,
}
