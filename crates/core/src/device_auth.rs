//! Device key handling: Ed25519 signatures over the connect payload

use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use ed25519_dalek::{Signature, VerifyingKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeviceAuthError {
    #[error("public key is not a valid Ed25519 key")]
    InvalidPublicKey,
    #[error("signature is not a valid Ed25519 signature")]
    InvalidSignature,
    #[error("signature does not match payload")]
    SignatureMismatch,
    #[error("device id does not match public key")]
    DeviceIdMismatch,
    #[error("signature timestamp outside the allowed window")]
    Stale,
    #[error("connect nonce does not match the issued challenge")]
    NonceMismatch,
}

/// Fields covered by a device's connect signature
#[derive(Debug, Clone)]
pub struct DeviceAuthPayload<'a> {
    pub device_id: &'a str,
    pub client_id: &'a str,
    pub client_mode: &'a str,
    pub role: &'a str,
    pub scopes: &'a [String],
    pub signed_at_ms: i64,
    pub token: Option<&'a str>,
    pub nonce: Option<&'a str>,
}

impl DeviceAuthPayload<'_> {
    /// `v2|deviceId|clientId|clientMode|role|scopes|signedAtMs|token|nonce`
    /// (`v1` without the trailing nonce)
    pub fn to_signing_string(&self) -> String {
        let version = if self.nonce.is_some() { "v2" } else { "v1" };
        let scopes = self.scopes.join(",");
        let signed_at = self.signed_at_ms.to_string();
        let mut parts = vec![
            version,
            self.device_id,
            self.client_id,
            self.client_mode,
            self.role,
            scopes.as_str(),
            signed_at.as_str(),
            self.token.unwrap_or_default(),
        ];
        if let Some(nonce) = self.nonce {
            parts.push(nonce);
        }
        parts.join("|")
    }
}

/// Payload a requester signs to prove key possession for a pairing request
pub fn pair_verify_payload(request_id: &str, code: &str) -> String {
    format!("pair-verify|{}|{}", request_id, code)
}

/// base64url (padded or not), falling back to standard base64
pub fn decode_key_material(input: &str) -> Option<Vec<u8>> {
    let input = input.trim();
    URL_SAFE_NO_PAD
        .decode(input)
        .or_else(|_| URL_SAFE.decode(input))
        .or_else(|_| STANDARD.decode(input))
        .ok()
}

fn verifying_key(public_key: &str) -> Result<VerifyingKey, DeviceAuthError> {
    let raw = decode_key_material(public_key).ok_or(DeviceAuthError::InvalidPublicKey)?;
    let bytes = <[u8; 32]>::try_from(raw.as_slice()).map_err(|_| DeviceAuthError::InvalidPublicKey)?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| DeviceAuthError::InvalidPublicKey)
}

/// Check that `public_key` parses as an Ed25519 key
pub fn validate_public_key(public_key: &str) -> Result<(), DeviceAuthError> {
    verifying_key(public_key).map(|_| ())
}

/// `hex(sha256(publicKeyBytes))`
pub fn derive_device_id(public_key: &str) -> Result<String, DeviceAuthError> {
    let raw = decode_key_material(public_key).ok_or(DeviceAuthError::InvalidPublicKey)?;
    Ok(hex::encode(Sha256::digest(&raw)))
}

pub fn verify_signature(public_key: &str, payload: &str, signature: &str) -> Result<(), DeviceAuthError> {
    let key = verifying_key(public_key)?;
    let raw = decode_key_material(signature).ok_or(DeviceAuthError::InvalidSignature)?;
    let bytes = <[u8; 64]>::try_from(raw.as_slice()).map_err(|_| DeviceAuthError::InvalidSignature)?;
    let signature = Signature::from_bytes(&bytes);
    key.verify_strict(payload.as_bytes(), &signature)
        .map_err(|_| DeviceAuthError::SignatureMismatch)
}

/// Reject signatures older (or further in the future) than `skew_ms`
pub fn check_freshness(signed_at_ms: i64, now_ms: u64, skew_ms: u64) -> Result<(), DeviceAuthError> {
    let now = i128::from(now_ms);
    let signed_at = i128::from(signed_at_ms);
    if (now - signed_at).abs() > i128::from(skew_ms) {
        return Err(DeviceAuthError::Stale);
    }
    Ok(())
}

/// Full connect-time check: id binding, freshness, nonce and signature
pub fn verify_connect_proof(
    payload: &DeviceAuthPayload<'_>,
    public_key: &str,
    signature: &str,
    expected_nonce: Option<&str>,
    now_ms: u64,
    skew_ms: u64,
) -> Result<(), DeviceAuthError> {
    if derive_device_id(public_key)? != payload.device_id {
        return Err(DeviceAuthError::DeviceIdMismatch);
    }
    check_freshness(payload.signed_at_ms, now_ms, skew_ms)?;
    if let Some(expected) = expected_nonce {
        if payload.nonce != Some(expected) {
            return Err(DeviceAuthError::NonceMismatch);
        }
    }
    verify_signature(public_key, &payload.to_signing_string(), signature)
}

#[cfg(test)]
pub(crate) mod test_keys {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    use ed25519_dalek::{Signer, SigningKey};

    pub fn signing_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    pub fn public_key(key: &SigningKey) -> String {
        URL_SAFE_NO_PAD.encode(key.verifying_key().as_bytes())
    }

    pub fn sign(key: &SigningKey, payload: &str) -> String {
        URL_SAFE_NO_PAD.encode(key.sign(payload.as_bytes()).to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::test_keys::*;
    use super::*;

    #[test]
    fn signing_string_layout() {
        let scopes = vec!["operator.admin".to_string(), "operator.read".to_string()];
        let payload = DeviceAuthPayload {
            device_id: "dev",
            client_id: "cli",
            client_mode: "cli",
            role: "operator",
            scopes: &scopes,
            signed_at_ms: 42,
            token: None,
            nonce: Some("n1"),
        };
        assert_eq!(
            payload.to_signing_string(),
            "v2|dev|cli|cli|operator|operator.admin,operator.read|42||n1"
        );
    }

    #[test]
    fn connect_proof_checks_binding_nonce_and_age() {
        let key = signing_key(3);
        let public = public_key(&key);
        let device_id = derive_device_id(&public).unwrap();
        let scopes = vec![];
        let payload = DeviceAuthPayload {
            device_id: &device_id,
            client_id: "ui",
            client_mode: "ui",
            role: "operator",
            scopes: &scopes,
            signed_at_ms: 1_000,
            token: None,
            nonce: Some("abc"),
        };
        let signature = sign(&key, &payload.to_signing_string());

        verify_connect_proof(&payload, &public, &signature, Some("abc"), 1_500, 600_000).unwrap();
        assert_eq!(
            verify_connect_proof(&payload, &public, &signature, Some("other"), 1_500, 600_000),
            Err(DeviceAuthError::NonceMismatch)
        );
        assert_eq!(
            verify_connect_proof(&payload, &public, &signature, Some("abc"), 700_000, 600_000),
            Err(DeviceAuthError::Stale)
        );

        let other = public_key(&signing_key(4));
        assert_eq!(
            verify_connect_proof(&payload, &other, &signature, Some("abc"), 1_500, 600_000),
            Err(DeviceAuthError::DeviceIdMismatch)
        );
    }

    #[test]
    fn tampered_payload_fails() {
        let key = signing_key(9);
        let public = public_key(&key);
        let signature = sign(&key, "hello");
        verify_signature(&public, "hello", &signature).unwrap();
        assert_eq!(
            verify_signature(&public, "hellO", &signature),
            Err(DeviceAuthError::SignatureMismatch)
        );
        assert_eq!(
            verify_signature("not-a-key", "hello", &signature),
            Err(DeviceAuthError::InvalidPublicKey)
        );
    }
}
