//! Scoped bearer tokens for paired devices and nodes (HS256 JWT)

use chrono::{Duration, Utc};
use cp_protocol::methods::IssuedToken;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::PairingError;

pub const DEFAULT_TOKEN_SECRET: &str = "dev-gateway-token-secret";
pub const DEFAULT_TOKEN_TTL_SECONDS: i64 = 60 * 60 * 24 * 30;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenClaims {
    pub sub: String,
    pub kind: String,
    pub identity_id: String,
    pub role: String,
    pub scopes: Vec<String>,
    /// Must equal the identity's current version; bumping it invalidates
    /// every previously issued token in one step.
    pub token_version: u64,
    pub iat: usize,
    pub exp: usize,
}

#[derive(Clone)]
pub struct TokenIssuer {
    secret: String,
    ttl_seconds: i64,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("ttl_seconds", &self.ttl_seconds)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    pub fn new(secret: impl Into<String>, ttl_seconds: i64) -> Self {
        let ttl_seconds = if ttl_seconds > 0 {
            ttl_seconds
        } else {
            DEFAULT_TOKEN_TTL_SECONDS
        };
        Self {
            secret: secret.into(),
            ttl_seconds,
        }
    }

    pub fn issue(
        &self,
        kind: &str,
        identity_id: &str,
        role: &str,
        scopes: &[String],
        token_version: u64,
    ) -> Result<IssuedToken, PairingError> {
        let issued_at = Utc::now();
        let expires_at = issued_at + Duration::seconds(self.ttl_seconds);
        let exp = usize::try_from(expires_at.timestamp())
            .map_err(|_| PairingError::Storage("Failed to encode expiration".to_string()))?;
        let iat = usize::try_from(issued_at.timestamp())
            .map_err(|_| PairingError::Storage("Failed to encode issue time".to_string()))?;

        let claims = TokenClaims {
            sub: format!("{}:{}", kind, identity_id),
            kind: kind.to_string(),
            identity_id: identity_id.to_string(),
            role: role.to_string(),
            scopes: scopes.to_vec(),
            token_version,
            iat,
            exp,
        };

        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|err| PairingError::Storage(format!("Failed to encode token: {}", err)))?;

        Ok(IssuedToken {
            identity_id: identity_id.to_string(),
            token,
            role: role.to_string(),
            scopes: scopes.to_vec(),
            issued_at_ms: u64::try_from(issued_at.timestamp_millis()).unwrap_or_default(),
            expires_at_ms: u64::try_from(expires_at.timestamp_millis()).unwrap_or_default(),
        })
    }

    pub fn decode(&self, token: &str) -> Result<TokenClaims, PairingError> {
        let data = decode::<TokenClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::new(Algorithm::HS256),
        )
        .map_err(|err| PairingError::Unauthorized(format!("Invalid token: {}", err)))?;
        Ok(data.claims)
    }
}
