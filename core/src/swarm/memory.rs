//! In-process loopback swarm
//!
//! Topics are rendezvous keys in a shared registry; connections are
//! direct method dispatch between two extensions. Used by the test
//! suite and local simulations.

use super::{
    ConnectionHandle, ExtensionFactory, InvitationService, JoinSwarmParams, PeerId, SwarmController,
    SwarmError, SwarmExtension, SwarmJoin, SwarmTopic, SwarmView, Topology,
};
use crate::invitation::protocol::{
    AdmissionRequest, AdmissionResponse, AuthenticationRequest, AuthenticationResponse,
    IntroductionRequest, IntroductionResponse, OptionsRequest, OptionsResponse,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone)]
struct Member {
    peer_id: PeerId,
    topology: Arc<dyn Topology>,
    extensions: ExtensionFactory,
    token: CancellationToken,
    connected: Arc<Mutex<HashSet<PeerId>>>,
}

/// Shared in-memory swarm registry. Clones share the same topics.
#[derive(Clone, Default)]
pub struct MemorySwarm {
    topics: Arc<Mutex<HashMap<SwarmTopic, HashMap<PeerId, Member>>>>,
}

impl MemorySwarm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-run every member's topology against the current membership.
    fn refresh(&self, topic: SwarmTopic) {
        let members: Vec<Member> = {
            let topics = self.topics.lock();
            match topics.get(&topic) {
                Some(members) => members.values().cloned().collect(),
                None => return,
            }
        };
        for member in members {
            let view = MemberView {
                swarm: self.clone(),
                topic,
                member: member.clone(),
            };
            member.topology.update(&view);
        }
    }

    fn member(&self, topic: &SwarmTopic, peer: &PeerId) -> Option<Member> {
        self.topics.lock().get(topic)?.get(peer).cloned()
    }

    async fn connect(&self, topic: SwarmTopic, from: PeerId, to: PeerId) {
        let (dialer, target) = match (self.member(&topic, &from), self.member(&topic, &to)) {
            (Some(dialer), Some(target)) => (dialer, target),
            _ => return,
        };
        if dialer.token.is_cancelled() || target.token.is_cancelled() {
            return;
        }
        if dialer.connected.lock().contains(&to) {
            return;
        }
        if !target.topology.on_offer(&from) {
            debug!(from = %from.display_id(), to = %to.display_id(), "offer rejected");
            return;
        }

        let conn = CancellationToken::new();
        // Either member leaving the swarm tears the connection down.
        {
            let conn = conn.clone();
            let dialer_token = dialer.token.clone();
            let target_token = target.token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = dialer_token.cancelled() => {},
                    _ = target_token.cancelled() => {},
                    _ = conn.cancelled() => {},
                }
                conn.cancel();
            });
        }

        let dialer_ext = (dialer.extensions)();
        let target_ext = (target.extensions)();

        dialer_ext.bind(ConnectionHandle::new(
            to,
            Arc::new(ServiceAdapter(target_ext.clone())),
            conn.clone(),
        ));
        target_ext.bind(ConnectionHandle::new(
            from,
            Arc::new(ServiceAdapter(dialer_ext.clone())),
            conn.clone(),
        ));

        dialer.connected.lock().insert(to);
        target.connected.lock().insert(from);
        debug!(from = %from.display_id(), to = %to.display_id(), "connection open");

        {
            let ext = dialer_ext.clone();
            tokio::spawn(async move { ext.on_open().await });
        }
        {
            let ext = target_ext.clone();
            tokio::spawn(async move { ext.on_open().await });
        }

        // Cleanup once the connection closes.
        let swarm = self.clone();
        tokio::spawn(async move {
            conn.cancelled().await;
            dialer.connected.lock().remove(&to);
            target.connected.lock().remove(&from);
            dialer_ext.on_close().await;
            target_ext.on_close().await;
            debug!(from = %from.display_id(), to = %to.display_id(), "connection closed");
            swarm.refresh(topic);
        });
    }
}

#[async_trait]
impl SwarmController for MemorySwarm {
    async fn join(&self, params: JoinSwarmParams) -> Result<Box<dyn SwarmJoin>, SwarmError> {
        let member = Member {
            peer_id: params.peer_id,
            topology: params.topology,
            extensions: params.extensions,
            token: CancellationToken::new(),
            connected: Arc::new(Mutex::new(HashSet::new())),
        };
        let token = member.token.clone();
        {
            let mut topics = self.topics.lock();
            topics
                .entry(params.topic)
                .or_default()
                .insert(params.peer_id, member);
        }
        debug!(peer = %params.peer_id.display_id(), topic = %params.topic.display_id(), "joined swarm");
        self.refresh(params.topic);

        Ok(Box::new(MemoryJoin {
            swarm: self.clone(),
            topic: params.topic,
            peer_id: params.peer_id,
            token,
        }))
    }
}

struct MemoryJoin {
    swarm: MemorySwarm,
    topic: SwarmTopic,
    peer_id: PeerId,
    token: CancellationToken,
}

#[async_trait]
impl SwarmJoin for MemoryJoin {
    async fn close(&self) {
        self.token.cancel();
        let mut topics = self.swarm.topics.lock();
        if let Some(members) = topics.get_mut(&self.topic) {
            members.remove(&self.peer_id);
            if members.is_empty() {
                topics.remove(&self.topic);
            }
        }
        drop(topics);
        self.swarm.refresh(self.topic);
    }
}

struct MemberView {
    swarm: MemorySwarm,
    topic: SwarmTopic,
    member: Member,
}

impl SwarmView for MemberView {
    fn local_peer(&self) -> PeerId {
        self.member.peer_id
    }

    fn candidates(&self) -> Vec<PeerId> {
        let topics = self.swarm.topics.lock();
        match topics.get(&self.topic) {
            Some(members) => members
                .keys()
                .filter(|peer| **peer != self.member.peer_id)
                .copied()
                .collect(),
            None => Vec::new(),
        }
    }

    fn connected(&self) -> Vec<PeerId> {
        self.member.connected.lock().iter().copied().collect()
    }

    fn dial(&self, peer: &PeerId) {
        let swarm = self.swarm.clone();
        let topic = self.topic;
        let from = self.member.peer_id;
        let to = *peer;
        tokio::spawn(async move {
            swarm.connect(topic, from, to).await;
        });
    }
}

/// Adapts an extension into the RPC stub its remote peer calls.
struct ServiceAdapter(Arc<dyn SwarmExtension>);

#[async_trait]
impl InvitationService for ServiceAdapter {
    async fn options(&self, request: OptionsRequest) -> Result<OptionsResponse, SwarmError> {
        self.0.options(request).await
    }

    async fn introduce(
        &self,
        request: IntroductionRequest,
    ) -> Result<IntroductionResponse, SwarmError> {
        self.0.introduce(request).await
    }

    async fn authenticate(
        &self,
        request: AuthenticationRequest,
    ) -> Result<AuthenticationResponse, SwarmError> {
        self.0.authenticate(request).await
    }

    async fn admit(&self, request: AdmissionRequest) -> Result<AdmissionResponse, SwarmError> {
        self.0.admit(request).await
    }
}

// ============================================================================
// TESTS
// ============================================================================
