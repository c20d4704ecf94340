//! Gateway configuration read from `CP_*` environment variables

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use cp_core::approvals::DEFAULT_APPROVAL_TIMEOUT_MS;
use cp_core::pairing::DEFAULT_PAIRING_TTL_MS;
use cp_core::tokens::{DEFAULT_TOKEN_SECRET, DEFAULT_TOKEN_TTL_SECONDS};
use cp_protocol::{Policy, PROTOCOL_VERSION};
use tracing::warn;

pub const DEFAULT_MAX_PAYLOAD: usize = 512 * 1024;
pub const DEFAULT_MAX_BUFFERED_BYTES: usize = 1536 * 1024;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_SIGNATURE_SKEW_MS: u64 = 10 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub state_dir: PathBuf,
    pub bind: SocketAddr,
    pub gateway_token: Option<String>,
    pub gateway_password: Option<String>,
    pub token_secret: String,
    pub device_token_ttl_seconds: i64,
    pub max_payload: usize,
    pub max_buffered_bytes: usize,
    pub tick_interval_ms: u64,
    pub handshake_timeout_ms: u64,
    /// 0 disables the server-side idle timeout
    pub idle_timeout_ms: u64,
    pub signature_skew_ms: u64,
    pub pairing_ttl_ms: u64,
    pub approval_timeout_ms: u64,
    pub min_protocol: u32,
    pub max_protocol: u32,
    /// Accept unauthenticated clients when no token or password is set
    pub allow_open_auth: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".cp-state"),
            bind: SocketAddr::from(([127, 0, 0, 1], 18789)),
            gateway_token: None,
            gateway_password: None,
            token_secret: DEFAULT_TOKEN_SECRET.to_string(),
            device_token_ttl_seconds: DEFAULT_TOKEN_TTL_SECONDS,
            max_payload: DEFAULT_MAX_PAYLOAD,
            max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            idle_timeout_ms: 0,
            signature_skew_ms: DEFAULT_SIGNATURE_SKEW_MS,
            pairing_ttl_ms: DEFAULT_PAIRING_TTL_MS,
            approval_timeout_ms: DEFAULT_APPROVAL_TIMEOUT_MS,
            min_protocol: 1,
            max_protocol: PROTOCOL_VERSION,
            allow_open_auth: true,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unset, blank or unparsable values
    /// fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;
        let defaults = Self::default();
        let text = |name: &str| text_var(lookup, name);

        let mut config = Self {
            state_dir: text("CP_STATE_DIR").map(PathBuf::from).unwrap_or(defaults.state_dir),
            bind: parsed(lookup, "CP_BIND").unwrap_or(defaults.bind),
            gateway_token: text("CP_GATEWAY_TOKEN"),
            gateway_password: text("CP_GATEWAY_PASSWORD"),
            token_secret: text("CP_TOKEN_SECRET").unwrap_or(defaults.token_secret),
            device_token_ttl_seconds: parsed(lookup, "CP_DEVICE_TOKEN_TTL_SECONDS")
                .filter(|ttl: &i64| *ttl > 0)
                .unwrap_or(defaults.device_token_ttl_seconds),
            max_payload: parsed(lookup, "CP_MAX_PAYLOAD")
                .filter(|value: &usize| *value > 0)
                .unwrap_or(defaults.max_payload),
            max_buffered_bytes: parsed(lookup, "CP_MAX_BUFFERED_BYTES")
                .filter(|value: &usize| *value > 0)
                .unwrap_or(defaults.max_buffered_bytes),
            tick_interval_ms: parsed(lookup, "CP_TICK_INTERVAL_MS")
                .filter(|value: &u64| *value > 0)
                .unwrap_or(defaults.tick_interval_ms),
            handshake_timeout_ms: parsed(lookup, "CP_HANDSHAKE_TIMEOUT_MS")
                .filter(|value: &u64| *value > 0)
                .unwrap_or(defaults.handshake_timeout_ms),
            idle_timeout_ms: parsed(lookup, "CP_IDLE_TIMEOUT_MS").unwrap_or(defaults.idle_timeout_ms),
            signature_skew_ms: parsed(lookup, "CP_SIGNATURE_SKEW_MS")
                .filter(|value: &u64| *value > 0)
                .unwrap_or(defaults.signature_skew_ms),
            pairing_ttl_ms: parsed(lookup, "CP_PAIRING_TTL_MS")
                .filter(|value: &u64| *value > 0)
                .unwrap_or(defaults.pairing_ttl_ms),
            approval_timeout_ms: parsed(lookup, "CP_APPROVAL_TIMEOUT_MS")
                .filter(|value: &u64| *value > 0)
                .unwrap_or(defaults.approval_timeout_ms),
            min_protocol: parsed(lookup, "CP_MIN_PROTOCOL")
                .filter(|value: &u32| *value > 0)
                .unwrap_or(defaults.min_protocol),
            max_protocol: parsed(lookup, "CP_MAX_PROTOCOL")
                .filter(|value: &u32| *value > 0)
                .unwrap_or(defaults.max_protocol),
            allow_open_auth: parse_flag(lookup("CP_ALLOW_OPEN_AUTH").as_deref(), defaults.allow_open_auth),
        };

        if config.min_protocol > config.max_protocol {
            warn!(
                min = config.min_protocol,
                max = config.max_protocol,
                "Inverted protocol range; using defaults"
            );
            config.min_protocol = defaults.min_protocol;
            config.max_protocol = defaults.max_protocol;
        }
        config
    }

    pub fn policy(&self) -> Policy {
        Policy {
            max_payload: self.max_payload,
            max_buffered_bytes: self.max_buffered_bytes,
            tick_interval_ms: self.tick_interval_ms,
        }
    }

    /// No shared secret configured: local development mode
    pub fn open_auth(&self) -> bool {
        self.allow_open_auth && self.gateway_token.is_none() && self.gateway_password.is_none()
    }
}

fn text_var(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parsed<T: FromStr>(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = text_var(lookup, name)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid value for {}: {:?}", name, raw);
            None
        }
    }
}

/// `1/true/yes/on` or `0/false/no/off`; anything else keeps `default`
fn parse_flag(raw: Option<&str>, default: bool) -> bool {
    match raw {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> GatewayConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        GatewayConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = config_from(&[]);
        assert_eq!(config.max_payload, 512 * 1024);
        assert_eq!(config.max_buffered_bytes, 1536 * 1024);
        assert_eq!(config.tick_interval_ms, 30_000);
        assert_eq!((config.min_protocol, config.max_protocol), (1, PROTOCOL_VERSION));
        assert_eq!(config.bind.to_string(), "127.0.0.1:18789");
        assert!(config.open_auth());
    }

    #[test]
    fn reads_overrides_and_ignores_garbage() {
        let config = config_from(&[
            ("CP_STATE_DIR", "/tmp/cp"),
            ("CP_GATEWAY_TOKEN", " secret "),
            ("CP_MAX_PAYLOAD", "1024"),
            ("CP_TICK_INTERVAL_MS", "soon"),
            ("CP_IDLE_TIMEOUT_MS", "5000"),
            ("CP_GATEWAY_PASSWORD", "   "),
        ]);
        assert_eq!(config.state_dir, PathBuf::from("/tmp/cp"));
        assert_eq!(config.gateway_token.as_deref(), Some("secret"));
        assert!(config.gateway_password.is_none());
        assert_eq!(config.max_payload, 1024);
        assert_eq!(config.tick_interval_ms, DEFAULT_TICK_INTERVAL_MS);
        assert_eq!(config.idle_timeout_ms, 5000);
        assert!(!config.open_auth());
    }

    #[test]
    fn open_auth_can_be_disabled() {
        let config = config_from(&[("CP_ALLOW_OPEN_AUTH", "off")]);
        assert!(!config.open_auth());
    }

    #[test]
    fn inverted_protocol_range_falls_back() {
        let config = config_from(&[("CP_MIN_PROTOCOL", "4"), ("CP_MAX_PROTOCOL", "2")]);
        assert_eq!((config.min_protocol, config.max_protocol), (1, PROTOCOL_VERSION));
    }

    #[test]
    fn flag_parsing() {
        assert!(parse_flag(Some("YES"), false));
        assert!(!parse_flag(Some(" off "), true));
        assert!(parse_flag(Some("maybe"), true));
        assert!(!parse_flag(None, false));
    }
}
