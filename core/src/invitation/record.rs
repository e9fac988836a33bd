//! Invitation data model
//!
//! The record is the single source of truth for one invitation's
//! lifecycle; it is only mutated through `GuardedInvitationState`.

use crate::credentials::SpaceRole;
use crate::keys::{self, KeyPair, PublicKey, AUTH_CODE_LENGTH};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Default per-step wait bound (connection, auth code, admission RPC).
pub const INVITATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default lifetime applied to delegated invitations.
pub const DEFAULT_DELEGATED_LIFETIME_MS: u64 = 12 * 60 * 60 * 1000;

/// Current wall clock in unix milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Which protocol strategy applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvitationKind {
    /// Admit a new device under an existing identity.
    Device,
    /// Admit a peer into a shared space.
    Space,
}

/// Lifecycle rules of the invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvitationType {
    /// Live, human-paced exchange with the creator online.
    Interactive,
    /// Hosting right delegated to any authorized peer; replayable by
    /// multiple hosts without the creator being online.
    Delegated,
    /// Pre-resolved, no live handshake.
    Offline,
}

/// Invitation state machine. Success, Error, Cancelled, Timeout and
/// Expired are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvitationState {
    Init,
    Connecting,
    Connected,
    ReadyForAuthentication,
    Authenticating,
    Success,
    Error,
    Cancelled,
    Timeout,
    Expired,
}

impl InvitationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvitationState::Success
                | InvitationState::Error
                | InvitationState::Cancelled
                | InvitationState::Timeout
                | InvitationState::Expired
        )
    }
}

/// How a guest proves it may use the invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMethod {
    None,
    SharedSecret,
    KnownPublicKey,
}

/// Kind-specific context contributed by the protocol strategy when the
/// record is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationContext {
    pub kind: InvitationKind,
    pub space_key: Option<PublicKey>,
    pub identity_key: Option<PublicKey>,
}

/// Options accepted by `create_invitation`; unset fields get the same
/// defaults the original service applies.
#[derive(Debug, Clone)]
pub struct InvitationOptions {
    pub invitation_type: InvitationType,
    pub auth_method: AuthMethod,
    /// Explicit passcode override; generated when absent and the method
    /// is SharedSecret.
    pub auth_code: Option<String>,
    pub timeout: Duration,
    pub lifetime_ms: Option<u64>,
    pub multi_use: bool,
    pub persistent: bool,
    pub role: Option<SpaceRole>,
}

impl Default for InvitationOptions {
    fn default() -> Self {
        Self {
            invitation_type: InvitationType::Interactive,
            auth_method: AuthMethod::SharedSecret,
            auth_code: None,
            timeout: INVITATION_TIMEOUT,
            lifetime_ms: None,
            multi_use: false,
            persistent: false,
            role: None,
        }
    }
}

impl InvitationOptions {
    pub fn with_auth_method(mut self, auth_method: AuthMethod) -> Self {
        self.auth_method = auth_method;
        self
    }

    pub fn with_type(mut self, invitation_type: InvitationType) -> Self {
        self.invitation_type = invitation_type;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_lifetime_ms(mut self, lifetime_ms: u64) -> Self {
        self.lifetime_ms = Some(lifetime_ms);
        self
    }

    pub fn multi_use(mut self, multi_use: bool) -> Self {
        self.multi_use = multi_use;
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_role(mut self, role: SpaceRole) -> Self {
        self.role = Some(role);
        self
    }
}

/// Full invitation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvitationRecord {
    pub invitation_id: String,
    pub kind: InvitationKind,
    pub invitation_type: InvitationType,
    pub state: InvitationState,
    pub auth_method: AuthMethod,
    /// Present iff `auth_method == SharedSecret`.
    pub auth_code: Option<String>,
    /// Present iff `auth_method == KnownPublicKey`. Carried in the
    /// out-of-band code, never persisted by the metadata store.
    pub guest_keypair: Option<KeyPair>,
    /// Rendezvous topic peers dial into.
    pub swarm_key: PublicKey,
    pub space_key: Option<PublicKey>,
    pub identity_key: Option<PublicKey>,
    /// Per-step wait bound.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    pub created_at_ms: u64,
    /// Expires at `created_at_ms + lifetime_ms` when set.
    pub lifetime_ms: Option<u64>,
    pub multi_use: bool,
    pub persistent: bool,
    pub delegation_credential_id: Option<String>,
    /// Access level granted on admission (Space kind only).
    pub role: Option<SpaceRole>,
    /// Last flow-fatal error, set when the terminal state is Error.
    pub error: Option<String>,
}

impl InvitationRecord {
    /// Build a fresh record from options and the strategy's context,
    /// applying defaults for everything unset.
    pub fn create(options: InvitationOptions, context: InvitationContext) -> Self {
        let auth_code = match options.auth_method {
            AuthMethod::SharedSecret => Some(
                options
                    .auth_code
                    .unwrap_or_else(|| keys::generate_pass_code(AUTH_CODE_LENGTH)),
            ),
            _ => None,
        };
        let guest_keypair = match options.auth_method {
            AuthMethod::KnownPublicKey => Some(KeyPair::generate()),
            _ => None,
        };
        let lifetime_ms = match (options.lifetime_ms, options.invitation_type) {
            (Some(lifetime), _) => Some(lifetime),
            (None, InvitationType::Delegated) => Some(DEFAULT_DELEGATED_LIFETIME_MS),
            (None, _) => None,
        };

        Self {
            invitation_id: uuid::Uuid::new_v4().to_string(),
            kind: context.kind,
            invitation_type: options.invitation_type,
            state: InvitationState::Init,
            auth_method: options.auth_method,
            auth_code,
            guest_keypair,
            swarm_key: PublicKey::random(),
            space_key: context.space_key,
            identity_key: context.identity_key,
            timeout: options.timeout,
            created_at_ms: now_ms(),
            lifetime_ms,
            multi_use: options.multi_use,
            persistent: options.persistent,
            delegation_credential_id: None,
            role: options.role,
            error: None,
        }
    }

    /// Absolute expiration time, if the invitation has a lifetime.
    pub fn expires_at_ms(&self) -> Option<u64> {
        self.lifetime_ms
            .map(|lifetime| self.created_at_ms.saturating_add(lifetime))
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        match self.expires_at_ms() {
            Some(expires) => now_ms >= expires,
            None => false,
        }
    }

    pub fn requires_authentication(&self) -> bool {
        self.auth_method != AuthMethod::None
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn device_context() -> InvitationContext {
        InvitationContext {
            kind: InvitationKind::Device,
            space_key: None,
            identity_key: Some(PublicKey::random()),
        }
    }

    #[test]
    fn test_shared_secret_gets_auth_code() {
        let record = InvitationRecord::create(InvitationOptions::default(), device_context());
        assert_eq!(record.auth_method, AuthMethod::SharedSecret);
        assert_eq!(record.auth_code.as_ref().map(String::len), Some(AUTH_CODE_LENGTH));
        assert!(record.guest_keypair.is_none());
        assert_eq!(record.state, InvitationState::Init);
    }

    #[test]
    fn test_known_public_key_gets_keypair() {
        let options = InvitationOptions::default().with_auth_method(AuthMethod::KnownPublicKey);
        let record = InvitationRecord::create(options, device_context());
        assert!(record.auth_code.is_none());
        assert!(record.guest_keypair.is_some());
    }

    #[test]
    fn test_delegated_default_lifetime() {
        let options = InvitationOptions::default().with_type(InvitationType::Delegated);
        let record = InvitationRecord::create(options, device_context());
        assert_eq!(record.lifetime_ms, Some(DEFAULT_DELEGATED_LIFETIME_MS));
        assert!(!record.is_expired(now_ms()));
        assert!(record.is_expired(now_ms() + DEFAULT_DELEGATED_LIFETIME_MS + 1));
    }

    #[test]
    fn test_interactive_has_no_lifetime() {
        let record = InvitationRecord::create(InvitationOptions::default(), device_context());
        assert_eq!(record.expires_at_ms(), None);
        assert!(!record.is_expired(u64::MAX));
    }

    #[test]
    fn test_terminal_states() {
        for state in [
            InvitationState::Success,
            InvitationState::Error,
            InvitationState::Cancelled,
            InvitationState::Timeout,
            InvitationState::Expired,
        ] {
            assert!(state.is_terminal());
        }
        for state in [
            InvitationState::Init,
            InvitationState::Connecting,
            InvitationState::Connected,
            InvitationState::ReadyForAuthentication,
            InvitationState::Authenticating,
        ] {
            assert!(!state.is_terminal());
        }
    }
}
