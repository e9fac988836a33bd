//! Invitation protocol strategy interface and wire payloads
//!
//! The handshake speaks these messages over one swarm connection:
//! options -> introduce -> authenticate -> admit. Kind-specific business
//! logic (device vs space) lives behind `InvitationProtocol`.

use super::record::{AuthMethod, InvitationContext, InvitationRecord};
use super::InvitationError;
use crate::credentials::{Credential, DeviceProfile, SpaceRole, Timeframe};
use crate::keys::PublicKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Declared role exchanged at connection open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    Host,
    Guest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionsRequest {
    pub role: PeerRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionsResponse {
    pub role: PeerRole,
}

/// Guest's opening message: which invitation, and who is asking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntroductionRequest {
    pub invitation_id: String,
    pub profile: Option<DeviceProfile>,
}

/// Host's answer: how to authenticate, with challenge material for
/// public-key auth. The space key is revealed here only when no
/// authentication is required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntroductionResponse {
    pub auth_method: AuthMethod,
    pub challenge: Option<Vec<u8>>,
    pub space_key: Option<PublicKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthenticationRequest {
    /// Shared-secret passcode entered by a human.
    Code { code: String },
    /// Signature over the challenge from the introduction response.
    SignedChallenge { signature: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthenticationStatus {
    Ok,
    /// Wrong passcode; the guest may resubmit.
    InvalidOtp,
    /// Too many wrong passcodes; the connection is closed.
    InvalidOtpAttempts,
    InvalidSignature,
    InternalError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationResponse {
    pub status: AuthenticationStatus,
}

/// Admission payload, dispatched by invitation kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdmissionRequest {
    Device {
        device_key: PublicKey,
        profile: Option<DeviceProfile>,
    },
    Space {
        device_key: PublicKey,
        identity_key: PublicKey,
        profile: Option<DeviceProfile>,
    },
}

impl AdmissionRequest {
    pub fn device_key(&self) -> PublicKey {
        match self {
            AdmissionRequest::Device { device_key, .. } => *device_key,
            AdmissionRequest::Space { device_key, .. } => *device_key,
        }
    }
}

/// Domain-specific admission result returned by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdmissionResponse {
    Device {
        identity_key: PublicKey,
        credential: Credential,
    },
    Space {
        space_key: PublicKey,
        role: SpaceRole,
        credential: Credential,
        /// Control-log position so the guest can fast-forward.
        timeframe: Timeframe,
    },
}

/// What `accept` folds into the guest's record on success.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdmissionResult {
    pub identity_key: Option<PublicKey>,
    pub space_key: Option<PublicKey>,
    pub role: Option<SpaceRole>,
    pub credential_id: Option<String>,
}

/// Kind-specific invitation business logic. One instance per
/// invitation, used by both the handler and the per-connection
/// extensions.
#[async_trait]
pub trait InvitationProtocol: Send + Sync + std::fmt::Debug {
    /// Context merged into the record at creation time.
    fn invitation_context(&self) -> InvitationContext;

    /// Host-side precondition for creating an invitation.
    async fn check_can_invite_new_members(&self) -> Result<(), InvitationError>;

    /// Guest-side precondition, checked before joining the swarm.
    fn check_invitation(&self, record: &InvitationRecord) -> Result<(), InvitationError>;

    /// Guest's introduction payload.
    fn create_introduction(&self, record: &InvitationRecord) -> IntroductionRequest;

    /// Guest's admission payload.
    async fn create_admission_request(
        &self,
        record: &InvitationRecord,
    ) -> Result<AdmissionRequest, InvitationError>;

    /// Host side: validate and admit the guest, producing the
    /// domain-specific admission response.
    async fn admit(
        &self,
        record: &InvitationRecord,
        request: AdmissionRequest,
        guest_profile: Option<DeviceProfile>,
    ) -> Result<AdmissionResponse, InvitationError>;

    /// Guest side: record the admission response locally.
    async fn accept(
        &self,
        response: AdmissionResponse,
        request: &AdmissionRequest,
    ) -> Result<AdmissionResult, InvitationError>;

    /// Write the credential that lets any authorized peer host this
    /// invitation; returns the credential id.
    async fn delegate(&self, record: &InvitationRecord) -> Result<String, InvitationError>;

    /// Cancel a previously written delegation.
    async fn cancel_delegation(&self, record: &InvitationRecord) -> Result<(), InvitationError>;
}
