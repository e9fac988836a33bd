//! Device invitation strategy
//!
//! Admits a new device under an existing identity. The host must
//! already own an identity; the guest must not.

use super::protocol::{
    AdmissionRequest, AdmissionResponse, AdmissionResult, IntroductionRequest, InvitationProtocol,
};
use super::record::{InvitationContext, InvitationKind, InvitationRecord};
use super::InvitationError;
use crate::credentials::{CredentialError, DeviceProfile, IdentityService};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::info;

pub struct DeviceInvitationProtocol {
    identity: Arc<dyn IdentityService>,
}

impl DeviceInvitationProtocol {
    pub fn new(identity: Arc<dyn IdentityService>) -> Arc<Self> {
        Arc::new(Self { identity })
    }
}

impl fmt::Debug for DeviceInvitationProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceInvitationProtocol")
            .field("identity_key", &self.identity.identity_key())
            .field("device_key", &self.identity.device_key())
            .finish()
    }
}

#[async_trait]
impl InvitationProtocol for DeviceInvitationProtocol {
    fn invitation_context(&self) -> InvitationContext {
        InvitationContext {
            kind: InvitationKind::Device,
            space_key: None,
            identity_key: self.identity.identity_key(),
        }
    }

    async fn check_can_invite_new_members(&self) -> Result<(), InvitationError> {
        if self.identity.identity_key().is_none() {
            return Err(InvitationError::Unauthorized(
                "device invitations require an existing identity".into(),
            ));
        }
        Ok(())
    }

    fn check_invitation(&self, record: &InvitationRecord) -> Result<(), InvitationError> {
        if record.kind != InvitationKind::Device {
            return Err(InvitationError::InvalidInvitation(
                "not a device invitation".into(),
            ));
        }
        // A device that already belongs to an identity cannot join
        // another one.
        if self.identity.identity_key().is_some() {
            return Err(InvitationError::AlreadyJoined);
        }
        Ok(())
    }

    fn create_introduction(&self, record: &InvitationRecord) -> IntroductionRequest {
        IntroductionRequest {
            invitation_id: record.invitation_id.clone(),
            profile: Some(self.identity.profile()),
        }
    }

    async fn create_admission_request(
        &self,
        _record: &InvitationRecord,
    ) -> Result<AdmissionRequest, InvitationError> {
        Ok(AdmissionRequest::Device {
            device_key: self.identity.device_key(),
            profile: Some(self.identity.profile()),
        })
    }

    async fn admit(
        &self,
        _record: &InvitationRecord,
        request: AdmissionRequest,
        guest_profile: Option<DeviceProfile>,
    ) -> Result<AdmissionResponse, InvitationError> {
        let (device_key, profile) = match request {
            AdmissionRequest::Device {
                device_key,
                profile,
            } => (device_key, profile),
            AdmissionRequest::Space { .. } => {
                return Err(InvitationError::Protocol(
                    "expected device admission request".into(),
                ))
            }
        };
        let identity_key = self
            .identity
            .identity_key()
            .ok_or(CredentialError::NoIdentity)?;

        let credential = self
            .identity
            .admit_device(device_key, guest_profile.or(profile))
            .await?;
        info!(device = %device_key.display_id(), "admitted device");

        Ok(AdmissionResponse::Device {
            identity_key,
            credential,
        })
    }

    async fn accept(
        &self,
        response: AdmissionResponse,
        _request: &AdmissionRequest,
    ) -> Result<AdmissionResult, InvitationError> {
        let (identity_key, credential) = match response {
            AdmissionResponse::Device {
                identity_key,
                credential,
            } => (identity_key, credential),
            AdmissionResponse::Space { .. } => {
                return Err(InvitationError::Protocol(
                    "expected device admission response".into(),
                ))
            }
        };
        if !credential.verify() {
            return Err(InvitationError::InvalidInvitation(
                "admission credential failed verification".into(),
            ));
        }
        let credential_id = credential.id.clone();
        self.identity
            .accept_identity(identity_key, credential)
            .await?;

        Ok(AdmissionResult {
            identity_key: Some(identity_key),
            space_key: None,
            role: None,
            credential_id: Some(credential_id),
        })
    }

    async fn delegate(&self, _record: &InvitationRecord) -> Result<String, InvitationError> {
        Err(InvitationError::DelegationUnsupported)
    }

    async fn cancel_delegation(&self, _record: &InvitationRecord) -> Result<(), InvitationError> {
        Err(InvitationError::DelegationUnsupported)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryIdentityService;
    use crate::invitation::record::InvitationOptions;

    fn record_for(protocol: &DeviceInvitationProtocol) -> InvitationRecord {
        InvitationRecord::create(InvitationOptions::default(), protocol.invitation_context())
    }

    #[tokio::test]
    async fn test_admit_accept_roundtrip() {
        let host = DeviceInvitationProtocol::new(MemoryIdentityService::with_identity("host"));
        let guest_identity = MemoryIdentityService::without_identity();
        let guest = DeviceInvitationProtocol::new(guest_identity.clone());
        let record = record_for(&host);

        let request = guest.create_admission_request(&record).await.unwrap();
        let response = host.admit(&record, request.clone(), None).await.unwrap();
        let result = guest.accept(response, &request).await.unwrap();

        assert_eq!(result.identity_key, record.identity_key);
        assert_eq!(guest_identity.identity_key(), record.identity_key);
        assert!(result.credential_id.is_some());
    }

    #[tokio::test]
    async fn test_host_requires_identity() {
        let protocol = DeviceInvitationProtocol::new(MemoryIdentityService::without_identity());
        assert!(matches!(
            protocol.check_can_invite_new_members().await,
            Err(InvitationError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_guest_with_identity_already_joined() {
        let host = DeviceInvitationProtocol::new(MemoryIdentityService::with_identity("host"));
        let record = record_for(&host);

        let joined = DeviceInvitationProtocol::new(MemoryIdentityService::with_identity("other"));
        assert!(matches!(
            joined.check_invitation(&record),
            Err(InvitationError::AlreadyJoined)
        ));

        let fresh = DeviceInvitationProtocol::new(MemoryIdentityService::without_identity());
        assert!(fresh.check_invitation(&record).is_ok());
    }

    #[tokio::test]
    async fn test_delegation_unsupported() {
        let host = DeviceInvitationProtocol::new(MemoryIdentityService::with_identity("host"));
        let record = record_for(&host);
        assert!(matches!(
            host.delegate(&record).await,
            Err(InvitationError::DelegationUnsupported)
        ));
    }
}
