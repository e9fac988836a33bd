//! Swarm collaborator abstraction
//!
//! The transport layer (peer discovery, connection establishment, RPC
//! framing) is consumed through these interfaces: join a swarm under a
//! topic, get notified per connection, exchange typed RPC calls. The
//! in-memory implementation in `memory` backs the test suite.

pub mod memory;

use crate::invitation::protocol::{
    AdmissionRequest, AdmissionResponse, AuthenticationRequest, AuthenticationResponse,
    IntroductionRequest, IntroductionResponse, OptionsRequest, OptionsResponse,
};
use crate::keys::PublicKey;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Rendezvous namespace peers dial into for one invitation.
pub type SwarmTopic = PublicKey;

/// Transport-level peer identifier.
pub type PeerId = PublicKey;

/// Swarm layer errors
#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("Failed to join swarm: {0}")]
    JoinFailed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("RPC call failed: {0}")]
    Rpc(String),
    /// Application-level error raised by the remote service handler.
    #[error("Service error: {0}")]
    Service(String),
}

/// The named RPC service exposed by the host side of an invitation
/// connection. Guests expose only `options` (role exchange).
#[async_trait]
pub trait InvitationService: Send + Sync {
    async fn options(&self, request: OptionsRequest) -> Result<OptionsResponse, SwarmError>;

    async fn introduce(
        &self,
        request: IntroductionRequest,
    ) -> Result<IntroductionResponse, SwarmError>;

    async fn authenticate(
        &self,
        request: AuthenticationRequest,
    ) -> Result<AuthenticationResponse, SwarmError>;

    async fn admit(&self, request: AdmissionRequest) -> Result<AdmissionResponse, SwarmError>;
}

/// Read-only view of one member's swarm neighborhood, handed to the
/// topology on every membership change.
pub trait SwarmView: Send + Sync {
    fn local_peer(&self) -> PeerId;
    /// Discovered peers on the topic, excluding ourselves.
    fn candidates(&self) -> Vec<PeerId>;
    /// Peers we currently hold a connection to.
    fn connected(&self) -> Vec<PeerId>;
    /// Schedule a connection attempt to `peer`.
    fn dial(&self, peer: &PeerId);
}

/// Swarm-membership policy callbacks.
pub trait Topology: Send + Sync {
    /// Membership changed; the policy may dial a candidate.
    fn update(&self, view: &dyn SwarmView);
    /// Incoming connection offer; return whether to accept it.
    fn on_offer(&self, peer: &PeerId) -> bool;
}

/// One physical connection to a remote peer.
#[derive(Clone)]
pub struct ConnectionHandle {
    remote_peer: PeerId,
    rpc: Arc<dyn InvitationService>,
    token: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(
        remote_peer: PeerId,
        rpc: Arc<dyn InvitationService>,
        token: CancellationToken,
    ) -> Self {
        Self {
            remote_peer,
            rpc,
            token,
        }
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    /// RPC stub for the remote peer's service.
    pub fn rpc(&self) -> &Arc<dyn InvitationService> {
        &self.rpc
    }

    /// Token cancelled when the connection closes, from either side.
    pub fn closed(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Per-connection protocol driver. A fresh extension is created for
/// every connection; it both serves the local side of the service and
/// drives the handshake from `on_open`.
#[async_trait]
pub trait SwarmExtension: InvitationService {
    /// Called synchronously while the connection is being set up,
    /// before any RPC is dispatched.
    fn bind(&self, connection: ConnectionHandle);

    /// Runs in its own task once the connection is open.
    async fn on_open(&self);

    /// Connection torn down.
    async fn on_close(&self) {}
}

/// Produces a fresh extension per connection.
pub type ExtensionFactory = Arc<dyn Fn() -> Arc<dyn SwarmExtension> + Send + Sync>;

pub struct JoinSwarmParams {
    pub topic: SwarmTopic,
    pub peer_id: PeerId,
    pub topology: Arc<dyn Topology>,
    pub extensions: ExtensionFactory,
}

/// Open swarm membership; dropping it does not leave the swarm, close
/// it explicitly.
#[async_trait]
pub trait SwarmJoin: Send + Sync {
    async fn close(&self);
}

/// Swarm controller consumed from the transport collaborator.
#[async_trait]
pub trait SwarmController: Send + Sync {
    async fn join(&self, params: JoinSwarmParams) -> Result<Box<dyn SwarmJoin>, SwarmError>;
}
