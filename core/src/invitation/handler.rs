//! Invitation flow orchestration
//!
//! Wires an invitation's guarded state to the swarm: joins the topic
//! with the right topology and extension factory, arms the expiration
//! and inactivity timers, and tears the membership down when the
//! invitation context is disposed.

use super::edge::EdgeInvitationHandler;
use super::guest::{GuestExtension, GuestFlowShared};
use super::host::HostExtension;
use super::protocol::{InvitationProtocol, PeerRole};
use super::record::{now_ms, InvitationState};
use super::state::GuardedInvitationState;
use super::topology::InvitationTopology;
use super::InvitationError;
use crate::swarm::{JoinSwarmParams, SwarmController};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct InvitationsHandler {
    swarm: Arc<dyn SwarmController>,
    edge: Option<Arc<EdgeInvitationHandler>>,
}

impl InvitationsHandler {
    pub fn new(swarm: Arc<dyn SwarmController>) -> Arc<Self> {
        Arc::new(Self { swarm, edge: None })
    }

    pub fn with_edge(
        swarm: Arc<dyn SwarmController>,
        edge: Arc<EdgeInvitationHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            swarm,
            edge: Some(edge),
        })
    }

    /// Start hosting `state`'s invitation: join its swarm topic and
    /// serve guests until the invitation reaches a terminal state.
    pub async fn host_invitation_flow(
        &self,
        state: GuardedInvitationState,
        protocol: Arc<dyn InvitationProtocol>,
    ) -> Result<(), InvitationError> {
        let record = state.record();

        // An already-expired invitation never touches the network.
        if record.is_expired(now_ms()) {
            state.set(None, InvitationState::Expired);
            state.dispose();
            return Err(InvitationError::Expired);
        }
        if let Some(expires_at) = record.expires_at_ms() {
            Self::arm_expiration(&state, expires_at);
        }

        let topology = InvitationTopology::new(PeerRole::Host);
        let extensions = {
            let state = state.clone();
            let protocol = protocol.clone();
            let topology = topology.clone();
            Arc::new(move || {
                HostExtension::new(state.clone(), protocol.clone(), topology.clone())
                    as Arc<dyn crate::swarm::SwarmExtension>
            })
        };

        let join = self
            .swarm
            .join(JoinSwarmParams {
                topic: record.swarm_key,
                peer_id: crate::keys::PublicKey::random(),
                topology,
                extensions,
            })
            .await?;
        info!(invitation = %record.invitation_id, topic = %record.swarm_key.display_id(), "hosting invitation");

        // Leave the topic once the invitation is done.
        {
            let ctx = state.context();
            tokio::spawn(async move {
                ctx.cancelled().await;
                join.close().await;
            });
        }

        state.set(None, InvitationState::Connecting);
        Ok(())
    }

    /// Start redeeming `state`'s invitation as a guest.
    pub async fn accept_invitation_flow(
        &self,
        state: GuardedInvitationState,
        protocol: Arc<dyn InvitationProtocol>,
        shared: Arc<GuestFlowShared>,
    ) -> Result<(), InvitationError> {
        let record = state.record();

        if let Err(err) = protocol.check_invitation(&record) {
            state.error(None, &err);
            return Err(err);
        }
        if record.is_expired(now_ms()) {
            state.set(None, InvitationState::Expired);
            state.dispose();
            return Err(InvitationError::Expired);
        }
        if let Some(expires_at) = record.expires_at_ms() {
            Self::arm_expiration(&state, expires_at);
        }
        Self::arm_inactivity(&state, record.timeout);

        let topology = InvitationTopology::new(PeerRole::Guest);
        let extensions = {
            let state = state.clone();
            let protocol = protocol.clone();
            let shared = shared.clone();
            Arc::new(move || {
                GuestExtension::new(state.clone(), protocol.clone(), shared.clone())
                    as Arc<dyn crate::swarm::SwarmExtension>
            })
        };

        let join = self
            .swarm
            .join(JoinSwarmParams {
                topic: record.swarm_key,
                peer_id: crate::keys::PublicKey::random(),
                topology,
                extensions,
            })
            .await?;
        info!(invitation = %record.invitation_id, topic = %record.swarm_key.display_id(), "redeeming invitation");

        {
            let ctx = state.context();
            tokio::spawn(async move {
                ctx.cancelled().await;
                join.close().await;
            });
        }

        // Delegated space invitations may also be redeemable through
        // the edge service; the swarm path and the edge path race, the
        // flow lock decides.
        if let Some(edge) = &self.edge {
            if EdgeInvitationHandler::eligible(&record) {
                let edge = edge.clone();
                let state = state.clone();
                let protocol = protocol.clone();
                tokio::spawn(async move {
                    edge.handle(state, protocol).await;
                });
            }
        }

        state.set(None, InvitationState::Connecting);
        Ok(())
    }

    /// Flip to Expired at the lifetime deadline, unless the invitation
    /// finished first.
    fn arm_expiration(state: &GuardedInvitationState, expires_at_ms: u64) {
        let ctx = state.context();
        let state = state.clone();
        let delay = Duration::from_millis(expires_at_ms.saturating_sub(now_ms()));
        tokio::spawn(async move {
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            // An active flow blocks the administrative transition; wait
            // it out and try again.
            loop {
                if state.set(None, InvitationState::Expired) {
                    warn!("invitation expired");
                    state.dispose();
                    return;
                }
                if state.is_disposed() {
                    return;
                }
                if state.record().state.is_terminal() {
                    // Already finished; the lifetime just ends it for
                    // good.
                    state.dispose();
                    return;
                }
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
            }
        });
    }

    /// Guest-side inactivity watchdog. Fires only while no flow holds
    /// the lock; an in-progress handshake is never interrupted.
    fn arm_inactivity(state: &GuardedInvitationState, timeout: Duration) {
        let ctx = state.context();
        let state = state.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    _ = tokio::time::sleep(timeout) => {}
                }
                if state.is_flow_locked() {
                    debug!("inactivity deadline passed during an active flow");
                    continue;
                }
                if state.set(None, InvitationState::Timeout) {
                    warn!("invitation timed out waiting for a host");
                    state.dispose();
                    return;
                }
                // A flow took the lock between the check and the
                // transition, or the invitation already ended.
                if state.is_disposed() || state.record().state.is_terminal() {
                    return;
                }
            }
        });
    }
}
