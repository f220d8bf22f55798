//! Circuit identity and reconnection token issuance.
//!
//! Both values are 128 random bits carried next to an HMAC-SHA256 tag, so a
//! presented value can be checked without a server-side lookup table. The
//! connection token is domain-separated and bound to its circuit id, which
//! keeps the durable identifier off less-trusted channels.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::env;
use std::fmt;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const PAYLOAD_LEN: usize = 16;
const TAG_LEN: usize = 32;
const ID_DOMAIN: &[u8] = b"filament.circuit-id.v1";
const TOKEN_DOMAIN: &[u8] = b"filament.connection-token.v1";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("secure random source unavailable: {0}")]
    RandomSource(#[from] rand::Error),
    #[error("identity secret must not be empty")]
    EmptySecret,
}

/// Opaque, unguessable identifier for one circuit. Constructed only by
/// [`IdentityIssuer`]; the wire form round-trips through [`Display`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CircuitId {
    payload: [u8; PAYLOAD_LEN],
    encoded: String,
}

impl CircuitId {
    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    fn payload(&self) -> &[u8; PAYLOAD_LEN] {
        &self.payload
    }
}

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl fmt::Debug for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CircuitId").field(&self.encoded).finish()
    }
}

/// Short-lived proof that the holder may reattach to a circuit. A circuit
/// has exactly one active token at a time; the registry replaces it on
/// every successful reconnect.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionToken {
    payload: [u8; PAYLOAD_LEN],
    encoded: String,
}

impl ConnectionToken {
    pub fn as_str(&self) -> &str {
        &self.encoded
    }
}

impl fmt::Display for ConnectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl fmt::Debug for ConnectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Tokens are bearer secrets; keep them out of debug output.
        f.write_str("ConnectionToken(..)")
    }
}

/// Issues and validates circuit ids and connection tokens under one keyed
/// MAC. Validation is constant-time on the tag and treats all input as
/// attacker-controlled: malformed or tampered values come back as `None`.
pub struct IdentityIssuer {
    key: Vec<u8>,
}

impl IdentityIssuer {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, IdentityError> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(IdentityError::EmptySecret);
        }
        Ok(Self {
            key: secret.to_vec(),
        })
    }

    /// Fresh random key. Circuits only live inside one process, so a
    /// per-process key is the default.
    pub fn generate() -> Result<Self, IdentityError> {
        let mut key = vec![0u8; 32];
        OsRng.try_fill_bytes(&mut key)?;
        Ok(Self { key })
    }

    /// Reads `FILAMENT_IDENTITY_SECRET`, falling back to a random key.
    pub fn from_env() -> Result<Self, IdentityError> {
        match env::var("FILAMENT_IDENTITY_SECRET") {
            Ok(secret) if !secret.trim().is_empty() => Self::new(secret.trim()),
            _ => Self::generate(),
        }
    }

    pub fn issue(&self) -> Result<CircuitId, IdentityError> {
        let payload = self.random_payload()?;
        let tag = self.tag(&[ID_DOMAIN, &payload]);
        Ok(CircuitId {
            payload,
            encoded: encode(&payload, &tag),
        })
    }

    pub fn validate(&self, presented: &str) -> Option<CircuitId> {
        let (payload, tag) = decode(presented)?;
        self.verify(&[ID_DOMAIN, &payload], &tag)?;
        Some(CircuitId {
            payload,
            encoded: encode(&payload, &tag),
        })
    }

    pub fn issue_token(&self, circuit_id: &CircuitId) -> Result<ConnectionToken, IdentityError> {
        let payload = self.random_payload()?;
        let tag = self.tag(&[TOKEN_DOMAIN, circuit_id.payload(), &payload]);
        Ok(ConnectionToken {
            payload,
            encoded: encode(&payload, &tag),
        })
    }

    pub fn validate_token(&self, circuit_id: &CircuitId, presented: &str) -> Option<ConnectionToken> {
        let (payload, tag) = decode(presented)?;
        self.verify(&[TOKEN_DOMAIN, circuit_id.payload(), &payload], &tag)?;
        Some(ConnectionToken {
            payload,
            encoded: encode(&payload, &tag),
        })
    }

    fn random_payload(&self) -> Result<[u8; PAYLOAD_LEN], IdentityError> {
        let mut payload = [0u8; PAYLOAD_LEN];
        OsRng.try_fill_bytes(&mut payload)?;
        Ok(payload)
    }

    fn tag(&self, parts: &[&[u8]]) -> [u8; TAG_LEN] {
        let mut mac = self.mac();
        for part in parts {
            mac.update(part);
        }
        mac.finalize().into_bytes().into()
    }

    fn verify(&self, parts: &[&[u8]], tag: &[u8]) -> Option<()> {
        let mut mac = self.mac();
        for part in parts {
            mac.update(part);
        }
        mac.verify_slice(tag).ok()
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.key).expect("hmac accepts keys of any length")
    }
}

fn encode(payload: &[u8; PAYLOAD_LEN], tag: &[u8; TAG_LEN]) -> String {
    let mut raw = Vec::with_capacity(PAYLOAD_LEN + TAG_LEN);
    raw.extend_from_slice(payload);
    raw.extend_from_slice(tag);
    URL_SAFE_NO_PAD.encode(raw)
}

fn decode(presented: &str) -> Option<([u8; PAYLOAD_LEN], [u8; TAG_LEN])> {
    let raw = URL_SAFE_NO_PAD.decode(presented).ok()?;
    if raw.len() != PAYLOAD_LEN + TAG_LEN {
        return None;
    }
    let mut payload = [0u8; PAYLOAD_LEN];
    let mut tag = [0u8; TAG_LEN];
    payload.copy_from_slice(&raw[..PAYLOAD_LEN]);
    tag.copy_from_slice(&raw[PAYLOAD_LEN..]);
    Some((payload, tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> IdentityIssuer {
        IdentityIssuer::new("filament-test-secret").unwrap()
    }

    #[test_deadline::deadline]
    fn issued_ids_are_unique() {
        let issuer = issuer();
        let first = issuer.issue().unwrap();
        let second = issuer.issue().unwrap();
        assert_ne!(first, second);
    }

    #[test_deadline::deadline]
    fn validate_round_trips_the_wire_form() {
        let issuer = issuer();
        let id = issuer.issue().unwrap();
        let validated = issuer.validate(id.as_str()).expect("own id validates");
        assert_eq!(validated, id);
    }

    #[test_deadline::deadline]
    fn tampered_and_malformed_ids_are_rejected() {
        let issuer = issuer();
        let id = issuer.issue().unwrap();

        let mut tampered = id.as_str().to_string();
        let flipped = if tampered.ends_with('A') { 'B' } else { 'A' };
        tampered.pop();
        tampered.push(flipped);

        assert!(issuer.validate(&tampered).is_none());
        assert!(issuer.validate("").is_none());
        assert!(issuer.validate("not base64 !!").is_none());
        assert!(issuer.validate("c2hvcnQ").is_none());
    }

    #[test_deadline::deadline]
    fn ids_from_another_key_are_rejected() {
        let ours = issuer();
        let theirs = IdentityIssuer::new("a-different-secret").unwrap();
        let id = theirs.issue().unwrap();
        assert!(ours.validate(id.as_str()).is_none());
    }

    #[test_deadline::deadline]
    fn tokens_are_bound_to_their_circuit() {
        let issuer = issuer();
        let id = issuer.issue().unwrap();
        let other = issuer.issue().unwrap();
        let token = issuer.issue_token(&id).unwrap();

        assert!(issuer.validate_token(&id, token.as_str()).is_some());
        assert!(issuer.validate_token(&other, token.as_str()).is_none());
        assert!(issuer.validate(token.as_str()).is_none());
    }

    #[test_deadline::deadline]
    fn empty_secret_is_refused() {
        assert!(matches!(
            IdentityIssuer::new(""),
            Err(IdentityError::EmptySecret)
        ));
    }
}
