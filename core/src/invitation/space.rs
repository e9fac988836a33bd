//! Space invitation strategy
//!
//! Admits a peer into a shared space by writing a signed membership
//! credential into the space control log. Delegation writes a
//! credential that lets any currently-authorized peer host the
//! invitation, which is what makes multi-host delegated invitations
//! possible without the creator being online.

use super::protocol::{
    AdmissionRequest, AdmissionResponse, AdmissionResult, IntroductionRequest, InvitationProtocol,
};
use super::record::{InvitationContext, InvitationKind, InvitationRecord};
use super::InvitationError;
use crate::credentials::{
    Credential, CredentialClaim, CredentialError, DeviceProfile, IdentityService, SpaceControl,
    SpaceRole,
};
use crate::keys::PublicKey;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::info;

pub struct SpaceInvitationProtocol {
    spaces: Arc<dyn SpaceControl>,
    identity: Arc<dyn IdentityService>,
    space_key: PublicKey,
}

impl SpaceInvitationProtocol {
    pub fn new(
        spaces: Arc<dyn SpaceControl>,
        identity: Arc<dyn IdentityService>,
        space_key: PublicKey,
    ) -> Arc<Self> {
        Arc::new(Self {
            spaces,
            identity,
            space_key,
        })
    }

    fn sign_credential(
        &self,
        subject: PublicKey,
        claim: CredentialClaim,
    ) -> Result<Credential, InvitationError> {
        let issuer = self
            .identity
            .identity_key()
            .ok_or(CredentialError::NoIdentity)?;
        let id = uuid::Uuid::new_v4().to_string();
        let bytes = Credential::signable_bytes(&id, &issuer, &subject, &claim)?;
        let signature = self.identity.sign(&bytes)?;
        Ok(Credential {
            id,
            issuer,
            subject,
            claim,
            signature,
        })
    }
}

impl fmt::Debug for SpaceInvitationProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpaceInvitationProtocol")
            .field("space_key", &self.space_key)
            .field("identity_key", &self.identity.identity_key())
            .finish()
    }
}

#[async_trait]
impl InvitationProtocol for SpaceInvitationProtocol {
    fn invitation_context(&self) -> InvitationContext {
        InvitationContext {
            kind: InvitationKind::Space,
            space_key: Some(self.space_key),
            identity_key: self.identity.identity_key(),
        }
    }

    async fn check_can_invite_new_members(&self) -> Result<(), InvitationError> {
        if !self.spaces.can_invite_members(&self.space_key).await? {
            return Err(InvitationError::Unauthorized(
                "membership management permission required".into(),
            ));
        }
        Ok(())
    }

    fn check_invitation(&self, record: &InvitationRecord) -> Result<(), InvitationError> {
        if record.kind != InvitationKind::Space {
            return Err(InvitationError::InvalidInvitation(
                "not a space invitation".into(),
            ));
        }
        let space_key = record.space_key.unwrap_or(self.space_key);
        if self.spaces.is_member(&space_key) {
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
        let identity_key = self
            .identity
            .identity_key()
            .ok_or(CredentialError::NoIdentity)?;
        Ok(AdmissionRequest::Space {
            device_key: self.identity.device_key(),
            identity_key,
            profile: Some(self.identity.profile()),
        })
    }

    async fn admit(
        &self,
        record: &InvitationRecord,
        request: AdmissionRequest,
        _guest_profile: Option<DeviceProfile>,
    ) -> Result<AdmissionResponse, InvitationError> {
        let identity_key = match request {
            AdmissionRequest::Space { identity_key, .. } => identity_key,
            AdmissionRequest::Device { .. } => {
                return Err(InvitationError::Protocol(
                    "expected space admission request".into(),
                ))
            }
        };
        let role = record.role.unwrap_or(SpaceRole::Member);
        let credential = self.sign_credential(
            identity_key,
            CredentialClaim::SpaceMember {
                space_key: self.space_key,
                role,
            },
        )?;
        let timeframe = self
            .spaces
            .write_credential(&self.space_key, credential.clone())
            .await?;
        info!(member = %identity_key.display_id(), space = %self.space_key.display_id(), "admitted member");

        Ok(AdmissionResponse::Space {
            space_key: self.space_key,
            role,
            credential,
            timeframe,
        })
    }

    async fn accept(
        &self,
        response: AdmissionResponse,
        _request: &AdmissionRequest,
    ) -> Result<AdmissionResult, InvitationError> {
        let (space_key, role, credential, timeframe) = match response {
            AdmissionResponse::Space {
                space_key,
                role,
                credential,
                timeframe,
            } => (space_key, role, credential, timeframe),
            AdmissionResponse::Device { .. } => {
                return Err(InvitationError::Protocol(
                    "expected space admission response".into(),
                ))
            }
        };
        if !credential.verify() {
            return Err(InvitationError::InvalidInvitation(
                "membership credential failed verification".into(),
            ));
        }
        let credential_id = credential.id.clone();
        self.spaces
            .record_admission(&space_key, credential, timeframe)
            .await?;

        Ok(AdmissionResult {
            identity_key: None,
            space_key: Some(space_key),
            role: Some(role),
            credential_id: Some(credential_id),
        })
    }

    async fn delegate(&self, record: &InvitationRecord) -> Result<String, InvitationError> {
        let credential = self.sign_credential(
            self.space_key,
            CredentialClaim::InvitationDelegation {
                invitation_id: record.invitation_id.clone(),
                space_key: self.space_key,
                multi_use: record.multi_use,
                expires_at_ms: record.expires_at_ms(),
            },
        )?;
        let id = credential.id.clone();
        self.spaces
            .write_credential(&self.space_key, credential)
            .await?;
        info!(invitation = %record.invitation_id, "delegation credential written");
        Ok(id)
    }

    async fn cancel_delegation(&self, record: &InvitationRecord) -> Result<(), InvitationError> {
        let credential_id = record
            .delegation_credential_id
            .clone()
            .ok_or_else(|| {
                InvitationError::InvalidInvitation("invitation was never delegated".into())
            })?;
        let credential = self.sign_credential(
            self.space_key,
            CredentialClaim::DelegationCancelled { credential_id },
        )?;
        self.spaces
            .write_credential(&self.space_key, credential)
            .await?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{MemoryIdentityService, MemorySpaceControl};
    use crate::invitation::record::{InvitationOptions, InvitationType};

    fn host_setup(can_invite: bool) -> (Arc<SpaceInvitationProtocol>, Arc<MemorySpaceControl>, PublicKey) {
        let spaces = MemorySpaceControl::new();
        let space_key = PublicKey::random();
        spaces.host_space(space_key, can_invite);
        let identity = MemoryIdentityService::with_identity("host");
        let protocol = SpaceInvitationProtocol::new(spaces.clone(), identity, space_key);
        (protocol, spaces, space_key)
    }

    #[tokio::test]
    async fn test_admit_accept_roundtrip_validates_kind_and_role() {
        let (host, _host_spaces, space_key) = host_setup(true);
        let record = InvitationRecord::create(
            InvitationOptions::default().with_role(SpaceRole::Admin),
            host.invitation_context(),
        );

        let guest_spaces = MemorySpaceControl::new();
        let guest = SpaceInvitationProtocol::new(
            guest_spaces.clone(),
            MemoryIdentityService::with_identity("guest"),
            space_key,
        );

        let request = guest.create_admission_request(&record).await.unwrap();
        let response = host.admit(&record, request.clone(), None).await.unwrap();
        let result = guest.accept(response, &request).await.unwrap();

        assert_eq!(result.space_key, Some(space_key));
        assert_eq!(result.role, Some(SpaceRole::Admin));
        let (credential, _) = guest_spaces.admission(&space_key).unwrap();
        assert!(matches!(
            credential.claim,
            CredentialClaim::SpaceMember { space_key: key, role: SpaceRole::Admin } if key == space_key
        ));
    }

    #[tokio::test]
    async fn test_unauthorized_inviter_rejected() {
        let (host, _, _) = host_setup(false);
        assert!(matches!(
            host.check_can_invite_new_members().await,
            Err(InvitationError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_existing_member_already_joined() {
        let (host, _, space_key) = host_setup(true);
        let record =
            InvitationRecord::create(InvitationOptions::default(), host.invitation_context());

        // The host itself is a member of the space.
        let same_peer = SpaceInvitationProtocol::new(
            {
                let spaces = MemorySpaceControl::new();
                spaces.host_space(space_key, false);
                spaces
            },
            MemoryIdentityService::with_identity("member"),
            space_key,
        );
        assert!(matches!(
            same_peer.check_invitation(&record),
            Err(InvitationError::AlreadyJoined)
        ));
    }

    #[tokio::test]
    async fn test_delegate_and_cancel_write_credentials() {
        let (host, spaces, space_key) = host_setup(true);
        let mut record = InvitationRecord::create(
            InvitationOptions::default()
                .with_type(InvitationType::Delegated)
                .multi_use(true),
            host.invitation_context(),
        );

        let credential_id = host.delegate(&record).await.unwrap();
        record.delegation_credential_id = Some(credential_id.clone());

        let log = spaces.query_credentials(&space_key).await.unwrap();
        assert!(log.iter().any(|c| matches!(
            &c.claim,
            CredentialClaim::InvitationDelegation { invitation_id, multi_use: true, .. }
                if *invitation_id == record.invitation_id
        )));

        host.cancel_delegation(&record).await.unwrap();
        let log = spaces.query_credentials(&space_key).await.unwrap();
        assert!(log.iter().any(|c| matches!(
            &c.claim,
            CredentialClaim::DelegationCancelled { credential_id: id } if *id == credential_id
        )));
    }

    #[tokio::test]
    async fn test_cancel_delegation_requires_prior_delegate() {
        let (host, _, _) = host_setup(true);
        let record =
            InvitationRecord::create(InvitationOptions::default(), host.invitation_context());
        assert!(matches!(
            host.cancel_delegation(&record).await,
            Err(InvitationError::InvalidInvitation(_))
        ));
    }
}
