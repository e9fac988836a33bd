//! Credential and identity collaborator interfaces
//!
//! The admission protocol does not persist keys or write credentials
//! itself; it drives these interfaces. Production implementations wrap
//! the real identity store and space control log. In-memory fakes are
//! provided for tests (and compiled in, like the local transport in the
//! rest of the stack).

use crate::keys::{KeyPair, PublicKey};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Credential layer errors
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("No identity available")]
    NoIdentity,
    #[error("Unknown space")]
    UnknownSpace,
    #[error("Not authorized: {0}")]
    NotAuthorized(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Credential store error: {0}")]
    Store(String),
}

/// Access level granted to an admitted space member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpaceRole {
    Member,
    Admin,
}

/// Public profile a peer presents during introduction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub device_key: PublicKey,
    pub display_name: Option<String>,
}

/// Position in a space's control log; returned on admission so the
/// guest knows how far to fast-forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Timeframe(pub u64);

/// Claims carried by signed credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CredentialClaim {
    /// Membership in a space.
    SpaceMember {
        space_key: PublicKey,
        role: SpaceRole,
    },
    /// Authorization of a device under an identity.
    DeviceAuthorization { identity_key: PublicKey },
    /// Grants any currently-authorized peer the right to host the
    /// named invitation (delegated invitations).
    InvitationDelegation {
        invitation_id: String,
        space_key: PublicKey,
        multi_use: bool,
        expires_at_ms: Option<u64>,
    },
    /// Cancels a previously written delegation.
    DelegationCancelled { credential_id: String },
}

/// A signed credential written into an identity or space control log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub issuer: PublicKey,
    pub subject: PublicKey,
    pub claim: CredentialClaim,
    pub signature: Vec<u8>,
}

impl Credential {
    /// Bytes covered by the signature (everything except the signature).
    pub fn signable_bytes(
        id: &str,
        issuer: &PublicKey,
        subject: &PublicKey,
        claim: &CredentialClaim,
    ) -> Result<Vec<u8>, CredentialError> {
        bincode::serialize(&(id, issuer, subject, claim))
            .map_err(|e| CredentialError::Serialization(e.to_string()))
    }

    /// Verify the credential signature against the issuer key.
    pub fn verify(&self) -> bool {
        match Self::signable_bytes(&self.id, &self.issuer, &self.subject, &self.claim) {
            Ok(bytes) => crate::keys::verify_signature(&bytes, &self.signature, &self.issuer),
            Err(_) => false,
        }
    }
}

/// Identity store surface consumed by the admission protocol.
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Key of the identity this device belongs to, if any.
    fn identity_key(&self) -> Option<PublicKey>;

    /// This device's key.
    fn device_key(&self) -> PublicKey;

    /// Profile presented to remote peers.
    fn profile(&self) -> DeviceProfile;

    /// Sign with the identity (or device) key.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CredentialError>;

    /// Host side: authorize a new device under our identity and return
    /// the written credential.
    async fn admit_device(
        &self,
        device_key: PublicKey,
        profile: Option<DeviceProfile>,
    ) -> Result<Credential, CredentialError>;

    /// Guest side: adopt an identity after being admitted as a device.
    async fn accept_identity(
        &self,
        identity_key: PublicKey,
        credential: Credential,
    ) -> Result<(), CredentialError>;
}

/// Space control-log surface consumed by the admission protocol.
#[async_trait]
pub trait SpaceControl: Send + Sync {
    /// Whether this peer already holds membership in the space.
    fn is_member(&self, space_key: &PublicKey) -> bool;

    /// Whether this peer may invite new members (membership management
    /// permission).
    async fn can_invite_members(&self, space_key: &PublicKey) -> Result<bool, CredentialError>;

    /// Append a credential to the space control log; returns the log
    /// position after the write.
    async fn write_credential(
        &self,
        space_key: &PublicKey,
        credential: Credential,
    ) -> Result<Timeframe, CredentialError>;

    /// Read back the control log.
    async fn query_credentials(
        &self,
        space_key: &PublicKey,
    ) -> Result<Vec<Credential>, CredentialError>;

    /// Guest side: record an admission result locally so replication can
    /// start from `timeframe`.
    async fn record_admission(
        &self,
        space_key: &PublicKey,
        credential: Credential,
        timeframe: Timeframe,
    ) -> Result<(), CredentialError>;
}

// ============================================================================
// IN-MEMORY FAKES
// ============================================================================

/// In-memory identity service for tests and local profiles.
pub struct MemoryIdentityService {
    keypair: KeyPair,
    identity_key: RwLock<Option<PublicKey>>,
    display_name: Option<String>,
    admitted_devices: RwLock<Vec<Credential>>,
}

impl MemoryIdentityService {
    /// A device that already owns an identity (host side).
    pub fn with_identity(display_name: impl Into<String>) -> Arc<Self> {
        let keypair = KeyPair::generate();
        let identity_key = keypair.public_key();
        Arc::new(Self {
            keypair,
            identity_key: RwLock::new(Some(identity_key)),
            display_name: Some(display_name.into()),
            admitted_devices: RwLock::new(Vec::new()),
        })
    }

    /// A fresh device with no identity yet (guest side of a device
    /// invitation).
    pub fn without_identity() -> Arc<Self> {
        Arc::new(Self {
            keypair: KeyPair::generate(),
            identity_key: RwLock::new(None),
            display_name: None,
            admitted_devices: RwLock::new(Vec::new()),
        })
    }

    pub fn admitted_devices(&self) -> Vec<Credential> {
        self.admitted_devices.read().clone()
    }
}

#[async_trait]
impl IdentityService for MemoryIdentityService {
    fn identity_key(&self) -> Option<PublicKey> {
        *self.identity_key.read()
    }

    fn device_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    fn profile(&self) -> DeviceProfile {
        DeviceProfile {
            device_key: self.device_key(),
            display_name: self.display_name.clone(),
        }
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CredentialError> {
        Ok(self.keypair.sign(data))
    }

    async fn admit_device(
        &self,
        device_key: PublicKey,
        _profile: Option<DeviceProfile>,
    ) -> Result<Credential, CredentialError> {
        let identity_key = self.identity_key().ok_or(CredentialError::NoIdentity)?;
        let id = uuid::Uuid::new_v4().to_string();
        let claim = CredentialClaim::DeviceAuthorization { identity_key };
        let bytes = Credential::signable_bytes(&id, &identity_key, &device_key, &claim)?;
        let credential = Credential {
            id,
            issuer: identity_key,
            subject: device_key,
            claim,
            signature: self.keypair.sign(&bytes),
        };
        self.admitted_devices.write().push(credential.clone());
        Ok(credential)
    }

    async fn accept_identity(
        &self,
        identity_key: PublicKey,
        _credential: Credential,
    ) -> Result<(), CredentialError> {
        *self.identity_key.write() = Some(identity_key);
        Ok(())
    }
}

#[derive(Default)]
struct SpaceState {
    log: Vec<Credential>,
    timeframe: u64,
}

/// In-memory space control for tests.
#[derive(Default)]
pub struct MemorySpaceControl {
    spaces: RwLock<HashMap<PublicKey, SpaceState>>,
    memberships: RwLock<HashMap<PublicKey, (Credential, Timeframe)>>,
    invite_capable: RwLock<HashSet<PublicKey>>,
}

impl MemorySpaceControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a hosted space, optionally with membership-management
    /// permission.
    pub fn host_space(&self, space_key: PublicKey, can_invite: bool) {
        self.spaces.write().entry(space_key).or_default();
        self.memberships.write().insert(
            space_key,
            (
                Credential {
                    id: uuid::Uuid::new_v4().to_string(),
                    issuer: space_key,
                    subject: space_key,
                    claim: CredentialClaim::SpaceMember {
                        space_key,
                        role: SpaceRole::Admin,
                    },
                    signature: Vec::new(),
                },
                Timeframe(0),
            ),
        );
        if can_invite {
            self.invite_capable.write().insert(space_key);
        }
    }

    pub fn admission(&self, space_key: &PublicKey) -> Option<(Credential, Timeframe)> {
        self.memberships.read().get(space_key).cloned()
    }
}

#[async_trait]
impl SpaceControl for MemorySpaceControl {
    fn is_member(&self, space_key: &PublicKey) -> bool {
        self.memberships.read().contains_key(space_key)
    }

    async fn can_invite_members(&self, space_key: &PublicKey) -> Result<bool, CredentialError> {
        Ok(self.invite_capable.read().contains(space_key))
    }

    async fn write_credential(
        &self,
        space_key: &PublicKey,
        credential: Credential,
    ) -> Result<Timeframe, CredentialError> {
        let mut spaces = self.spaces.write();
        let state = spaces.get_mut(space_key).ok_or(CredentialError::UnknownSpace)?;
        state.log.push(credential);
        state.timeframe += 1;
        Ok(Timeframe(state.timeframe))
    }

    async fn query_credentials(
        &self,
        space_key: &PublicKey,
    ) -> Result<Vec<Credential>, CredentialError> {
        let spaces = self.spaces.read();
        let state = spaces.get(space_key).ok_or(CredentialError::UnknownSpace)?;
        Ok(state.log.clone())
    }

    async fn record_admission(
        &self,
        space_key: &PublicKey,
        credential: Credential,
        timeframe: Timeframe,
    ) -> Result<(), CredentialError> {
        self.memberships
            .write()
            .insert(*space_key, (credential, timeframe));
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
