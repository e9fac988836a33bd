//! Cryptographic key material for the admission protocol
//!
//! Wraps the opaque sign/verify capability (Ed25519) and the random
//! identifiers used for swarm topics, peers and invitations.

use ed25519_dalek::{Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use zeroize::Zeroize;

/// Length of generated shared-secret authentication codes.
pub const AUTH_CODE_LENGTH: usize = 6;

/// Key handling errors
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Invalid public key bytes")]
    InvalidPublicKey,
    #[error("Invalid signature bytes")]
    InvalidSignature,
}

/// Opaque 32-byte public key, used both as a cryptographic identity and
/// as a random rendezvous identifier (swarm topics, peer ids).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Generate a random key (used for swarm topics and peer ids).
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex encoding of the full key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex.
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidPublicKey)?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self(bytes))
    }

    /// Short display id (Blake3 hash prefix of the key).
    pub fn display_id(&self) -> String {
        let hash = blake3::hash(&self.0);
        hex::encode(&hash.as_bytes()[..8])
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}..)", &self.to_hex()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Ed25519 key pair used for challenge signing (guest keypair) and
/// credential issuance.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut secret_key_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret_key_bytes);
        let signing_key = SigningKey::from_bytes(&secret_key_bytes);
        secret_key_bytes.zeroize();
        Self { signing_key }
    }

    /// Rebuild from secret bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&bytes),
        }
    }

    /// Public half of the pair.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign arbitrary data.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data).to_bytes().to_vec()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPair({}..)", &self.public_key().to_hex()[..8])
    }
}

// Secret bytes travel inside invitation codes for KNOWN_PUBLIC_KEY
// invitations, so the pair must round-trip through serde.
impl Serialize for KeyPair {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.signing_key.to_bytes())
    }
}

impl<'de> Deserialize<'de> for KeyPair {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = <Vec<u8>>::deserialize(deserializer)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("invalid secret key length"))?;
        Ok(Self::from_secret_bytes(bytes))
    }
}

/// Verify an Ed25519 signature over `data` with `public_key`.
pub fn verify_signature(data: &[u8], signature: &[u8], public_key: &PublicKey) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(public_key.as_bytes()) else {
        return false;
    };
    let sig_bytes: [u8; 64] = match signature.try_into() {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let sig = Ed25519Signature::from_bytes(&sig_bytes);
    verifying_key.verify(data, &sig).is_ok()
}

/// Generate a numeric one-time passcode for shared-secret invitations.
pub fn generate_pass_code(length: usize) -> String {
    use rand::Rng;
    let mut rng = rand::rngs::OsRng;
    (0..length).map(|_| rng.gen_range(0..10).to_string()).collect()
}

/// Generate a fresh random challenge for public-key authentication.
pub fn generate_challenge() -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_hex_roundtrip() {
        let key = PublicKey::random();
        let restored = PublicKey::from_hex(&key.to_hex()).expect("hex roundtrip");
        assert_eq!(key, restored);
    }

    #[test]
    fn test_keypair_sign_verify() {
        let pair = KeyPair::generate();
        let sig = pair.sign(b"challenge");
        assert!(verify_signature(b"challenge", &sig, &pair.public_key()));
        assert!(!verify_signature(b"other", &sig, &pair.public_key()));
    }

    #[test]
    fn test_keypair_serde_roundtrip() {
        let pair = KeyPair::generate();
        let bytes = bincode::serialize(&pair).expect("serialize");
        let restored: KeyPair = bincode::deserialize(&bytes).expect("deserialize");
        assert_eq!(pair.public_key(), restored.public_key());

        let sig = restored.sign(b"data");
        assert!(verify_signature(b"data", &sig, &pair.public_key()));
    }

    #[test]
    fn test_pass_code_shape() {
        let code = generate_pass_code(AUTH_CODE_LENGTH);
        assert_eq!(code.len(), AUTH_CODE_LENGTH);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_challenges_are_unique() {
        assert_ne!(generate_challenge(), generate_challenge());
    }
}
