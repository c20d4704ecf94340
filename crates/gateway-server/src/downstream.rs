//! Seam to the subsystems the gateway only fronts (config, sessions, cron, agent, chat)

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::GatewayError;

/// Who is calling, for audit and authorization downstream
#[derive(Debug, Clone)]
pub struct CallContext {
    pub conn_id: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub client_id: String,
}

#[async_trait]
pub trait Downstream: Send + Sync {
    /// `params` has already passed the method's closed schema
    async fn call(&self, method: &str, params: Value, ctx: &CallContext) -> Result<Value, GatewayError>;
}

/// Answers every call with a retryable `UNAVAILABLE`
#[derive(Debug, Clone)]
pub struct UnavailableDownstream {
    retry_after_ms: u64,
}

impl UnavailableDownstream {
    pub fn new(retry_after_ms: u64) -> Self {
        Self { retry_after_ms }
    }
}

impl Default for UnavailableDownstream {
    fn default() -> Self {
        Self::new(5_000)
    }
}

#[async_trait]
impl Downstream for UnavailableDownstream {
    async fn call(&self, method: &str, _params: Value, ctx: &CallContext) -> Result<Value, GatewayError> {
        debug!(
            method,
            conn_id = %ctx.conn_id,
            role = %ctx.role,
            client_id = %ctx.client_id,
            scopes = ?ctx.scopes,
            "No downstream configured"
        );
        Err(GatewayError::Unavailable {
            message: format!("'{}' has no backend attached", method),
            retry_after_ms: Some(self.retry_after_ms),
        })
    }
}
