//! Host-side connection extension
//!
//! One extension per physical connection. Serves the invitation RPC
//! service (options -> introduce -> authenticate -> admit) and drives
//! the host side of the flow from `on_open`: exchange roles, take the
//! flow lock, then wait for the admission signal bounded by the
//! invitation timeout.

use super::protocol::{
    AdmissionRequest, AdmissionResponse, AuthenticationRequest, AuthenticationResponse,
    AuthenticationStatus, IntroductionRequest, IntroductionResponse, InvitationProtocol,
    OptionsRequest, OptionsResponse, PeerRole,
};
use super::record::{AuthMethod, InvitationState};
use super::state::{FlowGuard, GuardedInvitationState};
use super::topology::InvitationTopology;
use super::{InvitationError, MAX_OTP_ATTEMPTS, OPTIONS_TIMEOUT};
use crate::credentials::DeviceProfile;
use crate::keys::{self, PublicKey};
use crate::swarm::{ConnectionHandle, InvitationService, SwarmError, SwarmExtension};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Default)]
struct HostSession {
    connection: Option<ConnectionHandle>,
    flow: Option<FlowGuard>,
    /// Set by `on_close`; a flow guard acquired after this point must
    /// not be stored.
    closed: bool,
    guest_profile: Option<DeviceProfile>,
    challenge: Option<Vec<u8>>,
    auth_attempts: u32,
    authentication_passed: bool,
    admitted_tx: Option<oneshot::Sender<PublicKey>>,
}

enum AdmissionWait {
    Admitted(PublicKey),
    ConnectionLost,
    TimedOut,
}

pub struct HostExtension {
    state: GuardedInvitationState,
    protocol: Arc<dyn InvitationProtocol>,
    topology: Arc<InvitationTopology>,
    session: Mutex<HostSession>,
    admitted_rx: Mutex<Option<oneshot::Receiver<PublicKey>>>,
    flow_ready: watch::Sender<bool>,
}

impl HostExtension {
    pub fn new(
        state: GuardedInvitationState,
        protocol: Arc<dyn InvitationProtocol>,
        topology: Arc<InvitationTopology>,
    ) -> Arc<Self> {
        let (admitted_tx, admitted_rx) = oneshot::channel();
        let (flow_ready, _) = watch::channel(false);
        Arc::new(Self {
            state,
            protocol,
            topology,
            session: Mutex::new(HostSession {
                admitted_tx: Some(admitted_tx),
                ..HostSession::default()
            }),
            admitted_rx: Mutex::new(Some(admitted_rx)),
            flow_ready,
        })
    }

    fn connection(&self) -> Option<ConnectionHandle> {
        self.session.lock().connection.clone()
    }

    /// Run a transition with the session's flow guard as lock holder.
    fn set_state(&self, new_state: InvitationState) -> bool {
        let session = self.session.lock();
        self.state.set(session.flow.as_ref(), new_state)
    }

    fn fail_flow(&self, err: &InvitationError) {
        let session = self.session.lock();
        self.state.error(session.flow.as_ref(), err);
    }

    /// Bounded role exchange with the remote peer.
    async fn exchange_roles(&self, conn: &ConnectionHandle) -> Result<(), InvitationError> {
        let response = timeout(
            OPTIONS_TIMEOUT,
            conn.rpc().options(OptionsRequest {
                role: PeerRole::Host,
            }),
        )
        .await
        .map_err(|_| InvitationError::Timeout)??;
        if response.role != PeerRole::Guest {
            return Err(InvitationError::RoleMismatch);
        }
        Ok(())
    }

    /// Wait until `on_open` holds the flow lock, bounded; guards against
    /// a guest racing ahead of the host's own open task.
    async fn wait_flow_ready(&self) -> Result<(), SwarmError> {
        let mut rx = self.flow_ready.subscribe();
        timeout(OPTIONS_TIMEOUT, rx.wait_for(|ready| *ready))
            .await
            .map_err(|_| SwarmError::Service("host flow not ready".into()))?
            .map_err(|_| SwarmError::ConnectionClosed)?;
        Ok(())
    }

    fn authenticate_shared_secret(&self, code: &str) -> AuthenticationStatus {
        let record = self.state.record();
        let mut session = self.session.lock();
        let expected = match record.auth_code.as_deref() {
            Some(expected) => expected,
            None => return AuthenticationStatus::InternalError,
        };
        if code == expected {
            session.authentication_passed = true;
            return AuthenticationStatus::Ok;
        }
        session.auth_attempts += 1;
        if session.auth_attempts > MAX_OTP_ATTEMPTS {
            AuthenticationStatus::InvalidOtpAttempts
        } else {
            AuthenticationStatus::InvalidOtp
        }
    }

    fn authenticate_known_public_key(&self, signature: &[u8]) -> AuthenticationStatus {
        let record = self.state.record();
        let mut session = self.session.lock();
        let (challenge, guest_key) = match (&session.challenge, &record.guest_keypair) {
            (Some(challenge), Some(keypair)) => (challenge.clone(), keypair.public_key()),
            _ => return AuthenticationStatus::InternalError,
        };
        if keys::verify_signature(&challenge, signature, &guest_key) {
            session.authentication_passed = true;
            AuthenticationStatus::Ok
        } else {
            AuthenticationStatus::InvalidSignature
        }
    }
}

#[async_trait]
impl InvitationService for HostExtension {
    async fn options(&self, request: OptionsRequest) -> Result<OptionsResponse, SwarmError> {
        if request.role != PeerRole::Guest {
            // Another host on the topic; remember it and drop the
            // connection without escalating.
            if let Some(conn) = self.connection() {
                self.topology.add_wrong_role_peer(conn.remote_peer());
                conn.close();
            }
        }
        Ok(OptionsResponse {
            role: PeerRole::Host,
        })
    }

    async fn introduce(
        &self,
        request: IntroductionRequest,
    ) -> Result<IntroductionResponse, SwarmError> {
        self.wait_flow_ready().await?;
        let record = self.state.record();
        if request.invitation_id != record.invitation_id {
            warn!(
                got = %request.invitation_id,
                expected = %record.invitation_id,
                "guest introduced an unknown invitation"
            );
            self.fail_flow(&InvitationError::InvalidInvitation(
                "unknown invitation id".into(),
            ));
            if let Some(conn) = self.connection() {
                conn.close();
            }
            return Err(SwarmError::Service("unknown invitation id".into()));
        }

        debug!(guest = ?request.profile, "guest introduced itself");
        {
            let mut session = self.session.lock();
            session.guest_profile = request.profile;
            if record.auth_method == AuthMethod::KnownPublicKey {
                session.challenge = Some(keys::generate_challenge());
            }
        }
        self.set_state(InvitationState::ReadyForAuthentication);

        let challenge = self.session.lock().challenge.clone();
        Ok(IntroductionResponse {
            auth_method: record.auth_method,
            challenge,
            // Space details stay hidden until the guest authenticates.
            space_key: if record.auth_method == AuthMethod::None {
                record.space_key
            } else {
                None
            },
        })
    }

    async fn authenticate(
        &self,
        request: AuthenticationRequest,
    ) -> Result<AuthenticationResponse, SwarmError> {
        let record = self.state.record();
        self.set_state(InvitationState::Authenticating);

        let status = match (record.auth_method, &request) {
            (AuthMethod::None, _) => {
                self.session.lock().authentication_passed = true;
                AuthenticationStatus::Ok
            }
            (AuthMethod::SharedSecret, AuthenticationRequest::Code { code }) => {
                self.authenticate_shared_secret(code)
            }
            (AuthMethod::KnownPublicKey, AuthenticationRequest::SignedChallenge { signature }) => {
                self.authenticate_known_public_key(signature)
            }
            _ => AuthenticationStatus::InternalError,
        };

        if status == AuthenticationStatus::InvalidOtpAttempts {
            warn!("authentication attempts exhausted, closing connection");
            if let Some(conn) = self.connection() {
                conn.close();
            }
        }
        Ok(AuthenticationResponse { status })
    }

    async fn admit(&self, request: AdmissionRequest) -> Result<AdmissionResponse, SwarmError> {
        let record = self.state.record();
        let (passed, guest_profile) = {
            let session = self.session.lock();
            (session.authentication_passed, session.guest_profile.clone())
        };

        let state_ok = match record.state {
            InvitationState::Authenticating => true,
            InvitationState::ReadyForAuthentication => !record.requires_authentication(),
            _ => false,
        };
        if !state_ok {
            return Err(SwarmError::Service("admission out of order".into()));
        }
        if record.requires_authentication() && !passed {
            return Err(SwarmError::Service("not authenticated".into()));
        }

        let device_key = request.device_key();
        match self.protocol.admit(&record, request, guest_profile).await {
            Ok(response) => {
                if let Some(tx) = self.session.lock().admitted_tx.take() {
                    let _ = tx.send(device_key);
                }
                Ok(response)
            }
            Err(err) => {
                self.fail_flow(&err);
                if let Some(conn) = self.connection() {
                    conn.close();
                }
                Err(SwarmError::Service(err.to_string()))
            }
        }
    }
}

#[async_trait]
impl SwarmExtension for HostExtension {
    fn bind(&self, connection: ConnectionHandle) {
        self.session.lock().connection = Some(connection);
    }

    async fn on_open(&self) {
        let Some(conn) = self.connection() else {
            return;
        };

        // 1. Role exchange, bounded.
        match self.exchange_roles(&conn).await {
            Ok(()) => {}
            Err(InvitationError::RoleMismatch) => {
                debug!(peer = %conn.remote_peer().display_id(), "peer is not a guest");
                self.topology.add_wrong_role_peer(conn.remote_peer());
                conn.close();
                return;
            }
            Err(err) => {
                debug!(%err, "options exchange failed");
                conn.close();
                return;
            }
        }

        // 2. Take the invitation's flow lock, bounded by the connection
        // and the invitation context.
        let closed = conn.closed();
        let guard = tokio::select! {
            guard = self.state.acquire_flow() => match guard {
                Ok(guard) => guard,
                Err(_) => {
                    conn.close();
                    return;
                }
            },
            _ = closed.cancelled() => return,
        };
        // The connection may have died while we queued for the lock; a
        // dead session must not sit on it for the admission timeout.
        if closed.is_cancelled() {
            return;
        }

        if !self.state.set(Some(&guard), InvitationState::Connected) {
            conn.close();
            return;
        }
        let record = self.state.record();
        {
            let mut session = self.session.lock();
            if session.closed {
                drop(session);
                drop(guard);
                self.state.set(None, InvitationState::Connecting);
                return;
            }
            session.flow = Some(guard);
        }
        self.flow_ready.send_replace(true);
        debug!(invitation = %record.invitation_id, "host connected to guest");

        // 3. Wait for admission, bounded by the invitation timeout and
        // the connection itself.
        let admitted = self.admitted_rx.lock().take();
        let Some(admitted) = admitted else {
            return;
        };
        let wait = tokio::select! {
            result = timeout(record.timeout, admitted) => match result {
                Ok(Ok(device_key)) => AdmissionWait::Admitted(device_key),
                Ok(Err(_)) => AdmissionWait::ConnectionLost,
                Err(_) => AdmissionWait::TimedOut,
            },
            _ = closed.cancelled() => AdmissionWait::ConnectionLost,
        };
        match wait {
            AdmissionWait::Admitted(device_key) => {
                info!(guest = %device_key.display_id(), invitation = %record.invitation_id, "admitted guest");
                if record.multi_use {
                    // Keep serving further guests; the next flow may
                    // restart from Success with a newer lock epoch.
                    self.set_state(InvitationState::Success);
                } else {
                    self.state.complete(|_| {});
                }
            }
            AdmissionWait::ConnectionLost => {
                // Let another candidate retry.
                debug!(invitation = %record.invitation_id, "connection lost before admission");
                self.set_state(InvitationState::Connecting);
            }
            AdmissionWait::TimedOut => {
                debug!(invitation = %record.invitation_id, "admission wait timed out");
                if record.multi_use {
                    self.set_state(InvitationState::Connecting);
                } else {
                    self.set_state(InvitationState::Timeout);
                    self.state.dispose();
                }
            }
        }

        self.session.lock().flow.take();
        conn.close();
    }

    async fn on_close(&self) {
        // Release the flow lock if the connection died mid-flow, and
        // keep a guard acquired after this point from being stored.
        if let Some(conn) = self.connection() {
            self.topology.mark_detached(conn.remote_peer());
        }
        let flow = {
            let mut session = self.session.lock();
            session.closed = true;
            session.flow.take()
        };
        drop(flow);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{MemoryIdentityService, MemorySpaceControl};
    use crate::invitation::record::{
        InvitationContext, InvitationKind, InvitationOptions, InvitationRecord,
    };
    use crate::invitation::space::SpaceInvitationProtocol;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct PeerStub {
        role: PeerRole,
    }

    #[async_trait]
    impl InvitationService for PeerStub {
        async fn options(&self, _request: OptionsRequest) -> Result<OptionsResponse, SwarmError> {
            Ok(OptionsResponse { role: self.role })
        }

        async fn introduce(
            &self,
            _request: IntroductionRequest,
        ) -> Result<IntroductionResponse, SwarmError> {
            Err(SwarmError::Service("not a host".into()))
        }

        async fn authenticate(
            &self,
            _request: AuthenticationRequest,
        ) -> Result<AuthenticationResponse, SwarmError> {
            Err(SwarmError::Service("not a host".into()))
        }

        async fn admit(
            &self,
            _request: AdmissionRequest,
        ) -> Result<AdmissionResponse, SwarmError> {
            Err(SwarmError::Service("not a host".into()))
        }
    }

    fn host_setup() -> (
        GuardedInvitationState,
        Arc<HostExtension>,
        Arc<InvitationTopology>,
        mpsc::UnboundedReceiver<InvitationRecord>,
    ) {
        let spaces = MemorySpaceControl::new();
        let space_key = PublicKey::random();
        spaces.host_space(space_key, true);
        let protocol = SpaceInvitationProtocol::new(
            spaces,
            MemoryIdentityService::with_identity("host"),
            space_key,
        );
        let record = InvitationRecord::create(
            InvitationOptions::default().with_auth_method(AuthMethod::None),
            InvitationContext {
                kind: InvitationKind::Space,
                space_key: Some(space_key),
                identity_key: None,
            },
        );
        let (state, rx) = GuardedInvitationState::new(record);
        let topology = InvitationTopology::new(PeerRole::Host);
        let ext = HostExtension::new(state.clone(), protocol, topology.clone());
        (state, ext, topology, rx)
    }

    fn connect(ext: &Arc<HostExtension>, role: PeerRole) -> ConnectionHandle {
        let conn = ConnectionHandle::new(
            PublicKey::random(),
            Arc::new(PeerStub { role }),
            CancellationToken::new(),
        );
        ext.bind(conn.clone());
        conn
    }

    #[tokio::test]
    async fn test_flow_ready_signal_raised_before_subscribe_is_seen() {
        let (_state, ext, _topology, _rx) = host_setup();
        ext.flow_ready.send_replace(true);
        ext.wait_flow_ready().await.unwrap();
    }

    #[tokio::test]
    async fn test_flow_ready_wakes_earlier_waiter() {
        let (_state, ext, _topology, _rx) = host_setup();
        let waiter = {
            let ext = ext.clone();
            tokio::spawn(async move { ext.wait_flow_ready().await })
        };
        tokio::task::yield_now().await;
        ext.flow_ready.send_replace(true);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_on_open_releases_lock_when_connection_already_closed() {
        let (state, ext, _topology, _rx) = host_setup();
        let conn = connect(&ext, PeerRole::Guest);
        conn.close();
        ext.on_open().await;

        assert!(!state.is_flow_locked());
        assert_ne!(state.record().state, InvitationState::Connected);
    }

    #[tokio::test]
    async fn test_on_open_after_close_returns_invitation_to_connecting() {
        let (state, ext, _topology, _rx) = host_setup();
        let _conn = connect(&ext, PeerRole::Guest);
        ext.on_close().await;
        ext.on_open().await;

        assert!(!state.is_flow_locked());
        assert_eq!(state.record().state, InvitationState::Connecting);
    }

    #[tokio::test]
    async fn test_wrong_role_peer_is_marked_and_dropped() {
        let (state, ext, topology, _rx) = host_setup();
        let conn = connect(&ext, PeerRole::Host);
        ext.on_open().await;

        assert!(topology.is_wrong_role(&conn.remote_peer()));
        assert!(conn.is_closed());
        assert!(!state.is_flow_locked());
    }
}
