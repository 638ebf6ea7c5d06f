//! CapabilityToken: an authenticated, encrypted blob carrying spawn rights
//! and resource ceilings, handed to a child instance so it can call back
//! into the guest-request surface. Integrity is "successful authenticated
//! decryption under the process master key" — there is no separate
//! signature, per §3.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use ring::aead::{self, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, AES_256_GCM};
use ring::error::Unspecified;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ceilings {
    pub max_children: u32,
    pub allowed_images: Vec<String>,
    pub max_memory_mb: u32,
    pub max_vcpus: u32,
    pub allowed_secrets: Vec<String>,
    pub max_expose_ports: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityToken {
    pub parent_instance_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub spawn: bool,
    pub spawn_depth: u32,
    pub ceilings: Ceilings,
}

impl CapabilityToken {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Derive a child token: ceilings are copied verbatim (never
    /// expanded), `spawn_depth` decrements, and `spawn` turns off once
    /// depth is exhausted.
    pub fn derive_child(&self, child_instance_id: &str, ttl: chrono::Duration) -> CapabilityToken {
        let now = Utc::now();
        CapabilityToken {
            parent_instance_id: child_instance_id.to_string(),
            issued_at: now,
            expires_at: now + ttl,
            spawn: self.spawn_depth > 1,
            spawn_depth: self.spawn_depth.saturating_sub(1),
            ceilings: self.ceilings.clone(),
        }
    }
}

/// A single-use nonce sequence: each seal call consumes one 12-byte random
/// nonce, prefixed onto the ciphertext so `open` can reconstruct it.
struct OneShotNonce(Option<[u8; aead::NONCE_LEN]>);

impl NonceSequence for OneShotNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, Unspecified> {
        let bytes = self.0.take().ok_or(Unspecified)?;
        Ok(Nonce::assume_unique_for_key(bytes))
    }
}

/// Encrypts/decrypts tokens under a 32-byte process master key. Losing
/// this key invalidates every outstanding token; it is generated once per
/// daemon process and never persisted (tokens are short-lived by design).
pub struct TokenCodec {
    key_bytes: [u8; 32],
}

impl TokenCodec {
    pub fn new(key_bytes: [u8; 32]) -> Self {
        Self { key_bytes }
    }

    pub fn generate() -> Self {
        let mut key_bytes = [0u8; 32];
        getrandom::fill(&mut key_bytes).expect("failed to generate capability master key");
        Self::new(key_bytes)
    }

    /// Serialize, encrypt, and base64-encode a token for the `_token` RPC
    /// parameter.
    pub fn encode(&self, token: &CapabilityToken) -> Result<String> {
        let plaintext = serde_json::to_vec(token)?;
        let unbound = UnboundKey::new(&AES_256_GCM, &self.key_bytes)
            .map_err(|_| Error::Internal("invalid capability key".into()))?;
        let mut nonce_bytes = [0u8; aead::NONCE_LEN];
        getrandom::fill(&mut nonce_bytes).map_err(|_| Error::Internal("rng failure".into()))?;
        let mut sealing = SealingKey::new(unbound, OneShotNonce(Some(nonce_bytes)));

        let mut in_out = plaintext;
        sealing
            .seal_in_place_append_tag(aead::Aad::empty(), &mut in_out)
            .map_err(|_| Error::Internal("token encryption failed".into()))?;

        let mut blob = Vec::with_capacity(nonce_bytes.len() + in_out.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&in_out);
        Ok(BASE64.encode(&blob))
    }

    /// Decode and authenticated-decrypt a token. Any failure — bad
    /// base64, short blob, or a failed AEAD tag check — is reported as a
    /// [`Error::Capability`], matching the "integrity = successful
    /// authenticated decryption" contract: there is no separate signature
    /// to check.
    pub fn decode(&self, encoded: &str) -> Result<CapabilityToken> {
        let blob = BASE64.decode(encoded).map_err(|_| Error::Capability("malformed token".into()))?;
        if blob.len() < aead::NONCE_LEN {
            return Err(Error::Capability("token too short".into()));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(aead::NONCE_LEN);
        let mut nonce = [0u8; aead::NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);

        let unbound = UnboundKey::new(&AES_256_GCM, &self.key_bytes)
            .map_err(|_| Error::Internal("invalid capability key".into()))?;
        let mut opening = OpeningKey::new(unbound, OneShotNonce(Some(nonce)));

        let mut in_out = ciphertext.to_vec();
        let plaintext = opening
            .open_in_place(aead::Aad::empty(), &mut in_out)
            .map_err(|_| Error::Capability("token authentication failed".into()))?;

        let token: CapabilityToken =
            serde_json::from_slice(plaintext).map_err(|_| Error::Capability("corrupt token body".into()))?;
        if token.is_expired() {
            return Err(Error::Capability("token expired".into()));
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_token() -> CapabilityToken {
        CapabilityToken {
            parent_instance_id: "inst-1".into(),
            issued_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::minutes(5),
            spawn: true,
            spawn_depth: 2,
            ceilings: Ceilings {
                max_children: 4,
                allowed_images: vec!["alpine".into()],
                max_memory_mb: 1024,
                max_vcpus: 2,
                allowed_secrets: vec![],
                max_expose_ports: 2,
            },
        }
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let codec = TokenCodec::generate();
        let token = sample_token();
        let encoded = codec.encode(&token).unwrap();
        let decoded = codec.decode(&encoded).unwrap();
        assert_eq!(decoded.parent_instance_id, "inst-1");
        assert_eq!(decoded.spawn_depth, 2);
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let codec = TokenCodec::generate();
        let encoded = codec.encode(&sample_token()).unwrap();
        let mut bytes = encoded.into_bytes();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
        let tampered = String::from_utf8(bytes).unwrap();
        assert!(codec.decode(&tampered).is_err());
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let codec_a = TokenCodec::generate();
        let codec_b = TokenCodec::generate();
        let encoded = codec_a.encode(&sample_token()).unwrap();
        assert!(codec_b.decode(&encoded).is_err());
    }

    #[test]
    fn derived_child_never_expands_ceilings() {
        let parent = sample_token();
        let child = parent.derive_child("inst-2", chrono::Duration::minutes(5));
        assert_eq!(child.spawn_depth, 1);
        assert!(child.spawn);
        assert_eq!(child.ceilings.max_memory_mb, parent.ceilings.max_memory_mb);

        let grandchild = child.derive_child("inst-3", chrono::Duration::minutes(5));
        assert_eq!(grandchild.spawn_depth, 0);
        assert!(!grandchild.spawn);
    }

    #[test]
    fn expired_token_rejected() {
        let codec = TokenCodec::generate();
        let mut token = sample_token();
        token.expires_at = Utc::now() - chrono::Duration::minutes(1);
        let encoded = codec.encode(&token).unwrap();
        assert!(codec.decode(&encoded).is_err());
    }
}
