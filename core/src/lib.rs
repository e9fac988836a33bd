//! Gangway: peer admission over swarm rendezvous
//!
//! Invitation-based admission of peers into identity and space
//! domains. A host shares an out-of-band code; the guest rendezvouses
//! on the code's swarm topic, proves it may use the invitation and is
//! admitted with a signed credential. Delegated invitations can also
//! be redeemed against an edge HTTP service when no host is online.

pub mod credentials;
pub mod invitation;
pub mod keys;
pub mod store;
pub mod swarm;

pub use credentials::{Credential, CredentialClaim, DeviceProfile, SpaceRole, Timeframe};
pub use invitation::code::InvitationCode;
pub use invitation::manager::{InvitationEvent, InvitationsManager};
pub use invitation::record::{
    AuthMethod, InvitationKind, InvitationOptions, InvitationRecord, InvitationState,
    InvitationType,
};
pub use invitation::InvitationError;
pub use keys::{KeyPair, PublicKey};
