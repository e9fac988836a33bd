//! Invitation admission protocol
//!
//! Admits a guest peer into an identity or space domain over the swarm:
//! `options -> introduce -> authenticate -> admit`, with an HTTP edge
//! fallback for delegated space invitations.

pub mod code;
pub mod device;
pub mod edge;
pub mod guest;
pub mod handler;
pub mod host;
pub mod manager;
pub mod protocol;
pub mod record;
pub mod space;
pub mod state;
pub mod topology;

use crate::credentials::CredentialError;
use crate::store::StoreError;
use crate::swarm::SwarmError;
use protocol::AuthenticationStatus;
use std::time::Duration;
use thiserror::Error;

/// Wrong shared-secret submissions tolerated per connection.
pub const MAX_OTP_ATTEMPTS: u32 = 3;

/// Distinct hosts a guest tries for a delegated invitation before
/// giving up.
pub const MAX_DELEGATED_INVITATION_HOST_TRIES: u32 = 3;

/// Bounded wait for the role (options) exchange.
pub const OPTIONS_TIMEOUT: Duration = Duration::from_secs(10);

/// Invitation flow errors.
///
/// Connection-scoped failures (role mismatch, a single bad OTP attempt,
/// one host failing in a delegated scenario) are recovered locally and
/// never surface as a terminal invitation error.
#[derive(Debug, Error)]
pub enum InvitationError {
    #[error("Peer role mismatch")]
    RoleMismatch,
    #[error("Authentication failed: {0:?}")]
    Authentication(AuthenticationStatus),
    #[error("Step timed out")]
    Timeout,
    #[error("Invitation expired")]
    Expired,
    #[error("Already joined")]
    AlreadyJoined,
    #[error("Invalid invitation: {0}")]
    InvalidInvitation(String),
    #[error("Not authorized: {0}")]
    Unauthorized(String),
    #[error("Invitation context disposed")]
    ContextDisposed,
    #[error("Delegation is not supported for this invitation kind")]
    DelegationUnsupported,
    #[error("Protocol violation: {0}")]
    Protocol(String),
    #[error("All host candidates failed")]
    HostCandidatesExhausted,
    #[error(transparent)]
    Swarm(#[from] SwarmError),
    #[error(transparent)]
    Edge(#[from] edge::EdgeError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
