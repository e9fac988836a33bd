//! Out-of-band invitation code
//!
//! Compact string a host shares via URL, QR code or direct message.
//! Carries everything a guest needs to rendezvous and authenticate,
//! except the shared-secret passcode, which is exchanged live.

use super::record::{
    AuthMethod, InvitationKind, InvitationRecord, InvitationState, InvitationType,
};
use crate::keys::{KeyPair, PublicKey};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodeError {
    #[error("Invalid invitation code: {0}")]
    Invalid(String),
}

#[derive(Serialize, Deserialize)]
struct CodePayload {
    invitation_id: String,
    kind: InvitationKind,
    invitation_type: InvitationType,
    auth_method: AuthMethod,
    swarm_key: PublicKey,
    space_key: Option<PublicKey>,
    identity_key: Option<PublicKey>,
    guest_keypair: Option<KeyPair>,
    timeout_ms: u64,
    created_at_ms: u64,
    lifetime_ms: Option<u64>,
    multi_use: bool,
}

/// Encoder/decoder for the shareable invitation string.
pub struct InvitationCode;

impl InvitationCode {
    /// Encode the shareable subset of a record as base58.
    pub fn encode(record: &InvitationRecord) -> Result<String, CodeError> {
        let payload = CodePayload {
            invitation_id: record.invitation_id.clone(),
            kind: record.kind,
            invitation_type: record.invitation_type,
            auth_method: record.auth_method,
            swarm_key: record.swarm_key,
            space_key: record.space_key,
            identity_key: record.identity_key,
            guest_keypair: record.guest_keypair.clone(),
            timeout_ms: record.timeout.as_millis() as u64,
            created_at_ms: record.created_at_ms,
            lifetime_ms: record.lifetime_ms,
            multi_use: record.multi_use,
        };
        let bytes = bincode::serialize(&payload).map_err(|e| CodeError::Invalid(e.to_string()))?;
        Ok(bs58::encode(bytes).into_string())
    }

    /// Decode a code back into a guest-side record (state Init, no
    /// passcode, not persistent).
    pub fn decode(code: &str) -> Result<InvitationRecord, CodeError> {
        let bytes = bs58::decode(code.trim())
            .into_vec()
            .map_err(|e| CodeError::Invalid(e.to_string()))?;
        let payload: CodePayload =
            bincode::deserialize(&bytes).map_err(|e| CodeError::Invalid(e.to_string()))?;

        Ok(InvitationRecord {
            invitation_id: payload.invitation_id,
            kind: payload.kind,
            invitation_type: payload.invitation_type,
            state: InvitationState::Init,
            auth_method: payload.auth_method,
            auth_code: None,
            guest_keypair: payload.guest_keypair,
            swarm_key: payload.swarm_key,
            space_key: payload.space_key,
            identity_key: payload.identity_key,
            timeout: Duration::from_millis(payload.timeout_ms),
            created_at_ms: payload.created_at_ms,
            lifetime_ms: payload.lifetime_ms,
            multi_use: payload.multi_use,
            persistent: false,
            delegation_credential_id: None,
            role: None,
            error: None,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
