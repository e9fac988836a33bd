//! Swarm-membership policy for invitations
//!
//! Hosts dial one candidate at a time and skip peers already known to
//! be the wrong role; guests accept all offers and never initiate.
//! This asymmetry avoids duplicate dials and connection storms.

use super::protocol::PeerRole;
use crate::swarm::{PeerId, SwarmView, Topology};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Bound on the wrong-role and detached sets; cleared on overflow so
/// churn cannot grow them without limit.
pub const MAX_WRONG_ROLE_PEERS: usize = 500;

/// Hold-down before a just-disconnected peer may be dialed again; a
/// finished guest stays visible on the topic until its membership is
/// torn down, and redialing it in that window just churns connections.
pub const REDIAL_BACKOFF: Duration = Duration::from_secs(1);

pub struct InvitationTopology {
    role: PeerRole,
    wrong_role: Mutex<HashSet<PeerId>>,
    detached: Mutex<HashMap<PeerId, Instant>>,
}

impl InvitationTopology {
    pub fn new(role: PeerRole) -> Arc<Self> {
        Arc::new(Self {
            role,
            wrong_role: Mutex::new(HashSet::new()),
            detached: Mutex::new(HashMap::new()),
        })
    }

    /// Record a peer whose options exchange revealed a role mismatch so
    /// it is not redialed.
    pub fn add_wrong_role_peer(&self, peer: PeerId) {
        let mut wrong_role = self.wrong_role.lock();
        if wrong_role.len() >= MAX_WRONG_ROLE_PEERS {
            debug!("wrong-role set overflow, clearing");
            wrong_role.clear();
        }
        wrong_role.insert(peer);
    }

    pub fn is_wrong_role(&self, peer: &PeerId) -> bool {
        self.wrong_role.lock().contains(peer)
    }

    /// Record a peer whose connection just closed so it is not redialed
    /// before the hold-down elapses.
    pub fn mark_detached(&self, peer: PeerId) {
        let mut detached = self.detached.lock();
        if detached.len() >= MAX_WRONG_ROLE_PEERS {
            debug!("detached set overflow, clearing");
            detached.clear();
        }
        detached.insert(peer, Instant::now());
    }

    fn in_backoff(&self, peer: &PeerId) -> bool {
        let mut detached = self.detached.lock();
        match detached.get(peer) {
            Some(at) if at.elapsed() < REDIAL_BACKOFF => true,
            Some(_) => {
                detached.remove(peer);
                false
            }
            None => false,
        }
    }
}

impl Topology for InvitationTopology {
    fn update(&self, view: &dyn SwarmView) {
        // Guests never initiate.
        if self.role != PeerRole::Host {
            return;
        }
        // One active flow at a time.
        if !view.connected().is_empty() {
            return;
        }
        let candidate = {
            let wrong_role = self.wrong_role.lock();
            view.candidates()
                .into_iter()
                .find(|peer| !wrong_role.contains(peer) && !self.in_backoff(peer))
        };
        if let Some(candidate) = candidate {
            debug!(peer = %candidate.display_id(), "dialing candidate");
            view.dial(&candidate);
        }
    }

    fn on_offer(&self, peer: &PeerId) -> bool {
        match self.role {
            // Hosts never retry a rejected offer, so always accept.
            PeerRole::Guest => true,
            PeerRole::Host => !self.is_wrong_role(peer),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PublicKey;

    struct RecordingView {
        local: PeerId,
        candidates: Vec<PeerId>,
        connected: Vec<PeerId>,
        dialed: Mutex<Vec<PeerId>>,
    }

    impl SwarmView for RecordingView {
        fn local_peer(&self) -> PeerId {
            self.local
        }
        fn candidates(&self) -> Vec<PeerId> {
            self.candidates.clone()
        }
        fn connected(&self) -> Vec<PeerId> {
            self.connected.clone()
        }
        fn dial(&self, peer: &PeerId) {
            self.dialed.lock().push(*peer);
        }
    }

    fn view(candidates: Vec<PeerId>, connected: Vec<PeerId>) -> RecordingView {
        RecordingView {
            local: PublicKey::random(),
            candidates,
            connected,
            dialed: Mutex::new(Vec::new()),
        }
    }

    #[test]
    fn test_host_dials_first_eligible_candidate() {
        let topology = InvitationTopology::new(PeerRole::Host);
        let wrong = PublicKey::random();
        let good = PublicKey::random();
        topology.add_wrong_role_peer(wrong);

        let v = view(vec![wrong, good], vec![]);
        topology.update(&v);
        assert_eq!(*v.dialed.lock(), vec![good]);
    }

    #[test]
    fn test_host_skips_dial_when_connected() {
        let topology = InvitationTopology::new(PeerRole::Host);
        let v = view(vec![PublicKey::random()], vec![PublicKey::random()]);
        topology.update(&v);
        assert!(v.dialed.lock().is_empty());
    }

    #[test]
    fn test_guest_never_dials() {
        let topology = InvitationTopology::new(PeerRole::Guest);
        let v = view(vec![PublicKey::random()], vec![]);
        topology.update(&v);
        assert!(v.dialed.lock().is_empty());
    }

    #[test]
    fn test_guest_accepts_all_offers() {
        let topology = InvitationTopology::new(PeerRole::Guest);
        let peer = PublicKey::random();
        topology.add_wrong_role_peer(peer);
        assert!(topology.on_offer(&peer));
    }

    #[test]
    fn test_host_rejects_wrong_role_offer() {
        let topology = InvitationTopology::new(PeerRole::Host);
        let peer = PublicKey::random();
        assert!(topology.on_offer(&peer));
        topology.add_wrong_role_peer(peer);
        assert!(!topology.on_offer(&peer));
    }

    #[test]
    fn test_host_skips_recently_detached_peer() {
        let topology = InvitationTopology::new(PeerRole::Host);
        let gone = PublicKey::random();
        let fresh = PublicKey::random();
        topology.mark_detached(gone);

        let v = view(vec![gone, fresh], vec![]);
        topology.update(&v);
        assert_eq!(*v.dialed.lock(), vec![fresh]);
    }

    #[test]
    fn test_host_holds_off_when_only_candidate_just_detached() {
        let topology = InvitationTopology::new(PeerRole::Host);
        let gone = PublicKey::random();
        topology.mark_detached(gone);

        let v = view(vec![gone], vec![]);
        topology.update(&v);
        assert!(v.dialed.lock().is_empty());
    }

    #[test]
    fn test_detached_peer_dialable_after_backoff() {
        let topology = InvitationTopology::new(PeerRole::Host);
        let gone = PublicKey::random();
        if let Some(past) = Instant::now().checked_sub(REDIAL_BACKOFF * 2) {
            topology.detached.lock().insert(gone, past);
            let v = view(vec![gone], vec![]);
            topology.update(&v);
            assert_eq!(*v.dialed.lock(), vec![gone]);
        }
    }

    #[test]
    fn test_wrong_role_set_is_bounded() {
        let topology = InvitationTopology::new(PeerRole::Host);
        for _ in 0..MAX_WRONG_ROLE_PEERS {
            topology.add_wrong_role_peer(PublicKey::random());
        }
        assert_eq!(topology.wrong_role.lock().len(), MAX_WRONG_ROLE_PEERS);

        // Overflow clears the set instead of growing it.
        topology.add_wrong_role_peer(PublicKey::random());
        assert_eq!(topology.wrong_role.lock().len(), 1);
    }
}
