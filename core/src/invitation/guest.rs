//! Guest-side connection extension
//!
//! Drives the guest handshake from `on_open`: exchange roles, take the
//! flow lock, introduce, authenticate, then request admission. Per
//! invitation the extensions share a `GuestFlowShared` so the code
//! prompt and the host-failure budget survive reconnects to other
//! hosts of a delegated invitation.

use super::protocol::{
    AdmissionRequest, AdmissionResponse, AuthenticationRequest, AuthenticationResponse,
    AuthenticationStatus, IntroductionRequest, IntroductionResponse, InvitationProtocol,
    OptionsRequest, OptionsResponse, PeerRole,
};
use super::record::{AuthMethod, InvitationState, InvitationType};
use super::state::{FlowGuard, GuardedInvitationState};
use super::{
    InvitationError, MAX_DELEGATED_INVITATION_HOST_TRIES, MAX_OTP_ATTEMPTS, OPTIONS_TIMEOUT,
};
use crate::swarm::{ConnectionHandle, InvitationService, PeerId, SwarmError, SwarmExtension};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Hands an interactively-entered code to the flow waiting for it.
#[derive(Default)]
pub struct AuthTrigger {
    value: Mutex<Option<String>>,
    notify: Notify,
}

impl AuthTrigger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn wake(&self, code: String) {
        *self.value.lock() = Some(code);
        self.notify.notify_waiters();
    }

    pub fn reset(&self) {
        *self.value.lock() = None;
    }

    pub async fn wait(&self) -> String {
        loop {
            let notified = self.notify.notified();
            if let Some(code) = self.value.lock().clone() {
                return code;
            }
            notified.await;
        }
    }
}

/// State shared by every connection attempt of one accepted invitation.
pub struct GuestFlowShared {
    pub auth_trigger: Arc<AuthTrigger>,
    tried_hosts: Mutex<HashSet<PeerId>>,
    host_failures: AtomicU32,
}

impl GuestFlowShared {
    pub fn new(auth_trigger: Arc<AuthTrigger>) -> Arc<Self> {
        Arc::new(Self {
            auth_trigger,
            tried_hosts: Mutex::new(HashSet::new()),
            host_failures: AtomicU32::new(0),
        })
    }
}

pub struct GuestExtension {
    state: GuardedInvitationState,
    protocol: Arc<dyn InvitationProtocol>,
    shared: Arc<GuestFlowShared>,
    connection: Mutex<Option<ConnectionHandle>>,
}

enum FlowEnd {
    Done,
    /// Connection or context went away before the flow owned anything.
    Detached,
}

impl GuestExtension {
    pub fn new(
        state: GuardedInvitationState,
        protocol: Arc<dyn InvitationProtocol>,
        shared: Arc<GuestFlowShared>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            protocol,
            shared,
            connection: Mutex::new(None),
        })
    }

    async fn rpc_introduce(
        &self,
        conn: &ConnectionHandle,
        request: IntroductionRequest,
    ) -> Result<IntroductionResponse, InvitationError> {
        timeout(self.state.record().timeout, conn.rpc().introduce(request))
            .await
            .map_err(|_| InvitationError::Timeout)?
            .map_err(InvitationError::from)
    }

    async fn rpc_authenticate(
        &self,
        conn: &ConnectionHandle,
        request: AuthenticationRequest,
    ) -> Result<AuthenticationResponse, InvitationError> {
        timeout(self.state.record().timeout, conn.rpc().authenticate(request))
            .await
            .map_err(|_| InvitationError::Timeout)?
            .map_err(InvitationError::from)
    }

    async fn rpc_admit(
        &self,
        conn: &ConnectionHandle,
        request: AdmissionRequest,
    ) -> Result<AdmissionResponse, InvitationError> {
        timeout(self.state.record().timeout, conn.rpc().admit(request))
            .await
            .map_err(|_| InvitationError::Timeout)?
            .map_err(InvitationError::from)
    }

    /// Shared-secret prompt loop. The host answers InvalidOtp while
    /// attempts remain; the budget here keeps the guest from prompting
    /// past its own limit.
    async fn authenticate_with_code(
        &self,
        conn: &ConnectionHandle,
        guard: &FlowGuard,
    ) -> Result<(), InvitationError> {
        let wait_timeout = self.state.record().timeout;
        for attempt in 1..=MAX_OTP_ATTEMPTS {
            self.state
                .set(Some(guard), InvitationState::ReadyForAuthentication);
            let code = timeout(wait_timeout, self.shared.auth_trigger.wait())
                .await
                .map_err(|_| InvitationError::Timeout)?;
            self.state.set(Some(guard), InvitationState::Authenticating);

            let response = self
                .rpc_authenticate(conn, AuthenticationRequest::Code { code })
                .await?;
            match response.status {
                AuthenticationStatus::Ok => return Ok(()),
                AuthenticationStatus::InvalidOtp if attempt < MAX_OTP_ATTEMPTS => {
                    debug!(attempt, "code rejected, prompting again");
                    self.shared.auth_trigger.reset();
                }
                AuthenticationStatus::InvalidOtp => {
                    return Err(InvitationError::Authentication(
                        AuthenticationStatus::InvalidOtpAttempts,
                    ))
                }
                status => return Err(InvitationError::Authentication(status)),
            }
        }
        Err(InvitationError::Authentication(
            AuthenticationStatus::InvalidOtpAttempts,
        ))
    }

    async fn authenticate_with_key(
        &self,
        conn: &ConnectionHandle,
        guard: &FlowGuard,
        challenge: Option<Vec<u8>>,
    ) -> Result<(), InvitationError> {
        self.state
            .set(Some(guard), InvitationState::ReadyForAuthentication);
        let record = self.state.record();
        let keypair = record
            .guest_keypair
            .as_ref()
            .ok_or_else(|| InvitationError::Protocol("invitation carries no guest key".into()))?;
        let challenge = challenge
            .ok_or_else(|| InvitationError::Protocol("host sent no challenge".into()))?;
        let signature = keypair.sign(&challenge);

        self.state.set(Some(guard), InvitationState::Authenticating);
        let response = self
            .rpc_authenticate(conn, AuthenticationRequest::SignedChallenge { signature })
            .await?;
        match response.status {
            AuthenticationStatus::Ok => Ok(()),
            status => Err(InvitationError::Authentication(status)),
        }
    }

    /// Bounded role exchange with the remote peer.
    async fn exchange_roles(&self, conn: &ConnectionHandle) -> Result<(), InvitationError> {
        let response = timeout(
            OPTIONS_TIMEOUT,
            conn.rpc().options(OptionsRequest {
                role: PeerRole::Guest,
            }),
        )
        .await
        .map_err(|_| InvitationError::Timeout)??;
        if response.role != PeerRole::Host {
            return Err(InvitationError::RoleMismatch);
        }
        Ok(())
    }

    async fn run_flow(&self, conn: &ConnectionHandle) -> Result<FlowEnd, InvitationError> {
        let closed = conn.closed();
        let guard = tokio::select! {
            guard = self.state.acquire_flow() => match guard {
                Ok(guard) => guard,
                Err(_) => return Ok(FlowEnd::Detached),
            },
            _ = closed.cancelled() => return Ok(FlowEnd::Detached),
        };

        if !self.state.set(Some(&guard), InvitationState::Connected) {
            return Ok(FlowEnd::Detached);
        }
        let record = self.state.record();
        debug!(invitation = %record.invitation_id, host = %conn.remote_peer().display_id(), "connected to host");

        let introduction = self
            .rpc_introduce(conn, self.protocol.create_introduction(&record))
            .await?;

        // Adopt what the host disclosed; a delegated code may not know
        // the auth method or space key up front.
        self.state.transition(
            Some(&guard),
            InvitationState::Connected,
            |record| {
                record.auth_method = introduction.auth_method;
                if record.space_key.is_none() {
                    record.space_key = introduction.space_key;
                }
            },
        );

        match introduction.auth_method {
            AuthMethod::None => {
                self.state
                    .set(Some(&guard), InvitationState::ReadyForAuthentication);
            }
            AuthMethod::SharedSecret => self.authenticate_with_code(conn, &guard).await?,
            AuthMethod::KnownPublicKey => {
                self.authenticate_with_key(conn, &guard, introduction.challenge)
                    .await?
            }
        }

        let record = self.state.record();
        let request = self.protocol.create_admission_request(&record).await?;
        let response = self.rpc_admit(conn, request.clone()).await?;
        let result = self.protocol.accept(response, &request).await?;

        info!(invitation = %record.invitation_id, "admission accepted");
        self.state.complete(move |record| {
            if record.identity_key.is_none() {
                record.identity_key = result.identity_key;
            }
            if record.space_key.is_none() {
                record.space_key = result.space_key;
            }
            if result.role.is_some() {
                record.role = result.role;
            }
        });
        Ok(FlowEnd::Done)
    }

    /// A connection attempt failed. Delegated invitations get a budget
    /// of host candidates before the flow is declared dead.
    fn handle_failure(&self, conn: &ConnectionHandle, err: InvitationError) {
        if matches!(err, InvitationError::ContextDisposed) {
            return;
        }
        self.shared.tried_hosts.lock().insert(conn.remote_peer());
        let failures = self.shared.host_failures.fetch_add(1, Ordering::SeqCst) + 1;

        let record = self.state.record();
        let retryable = record.invitation_type == InvitationType::Delegated
            && failures < MAX_DELEGATED_INVITATION_HOST_TRIES
            && !matches!(err, InvitationError::Authentication(_));
        if retryable {
            warn!(
                invitation = %record.invitation_id,
                host = %conn.remote_peer().display_id(),
                failures,
                %err,
                "host attempt failed, trying another candidate"
            );
            self.state.set(None, InvitationState::Connecting);
            return;
        }

        let err = if record.invitation_type == InvitationType::Delegated
            && failures >= MAX_DELEGATED_INVITATION_HOST_TRIES
            && !matches!(err, InvitationError::Authentication(_))
        {
            InvitationError::HostCandidatesExhausted
        } else {
            err
        };
        match err {
            InvitationError::Timeout => {
                if self.state.set(None, InvitationState::Timeout) {
                    self.state.dispose();
                }
            }
            err => {
                self.state.error(None, &err);
            }
        }
    }
}

#[async_trait]
impl InvitationService for GuestExtension {
    async fn options(&self, _request: OptionsRequest) -> Result<OptionsResponse, SwarmError> {
        Ok(OptionsResponse {
            role: PeerRole::Guest,
        })
    }

    async fn introduce(
        &self,
        _request: IntroductionRequest,
    ) -> Result<IntroductionResponse, SwarmError> {
        Err(SwarmError::Service("guest does not host invitations".into()))
    }

    async fn authenticate(
        &self,
        _request: AuthenticationRequest,
    ) -> Result<AuthenticationResponse, SwarmError> {
        Err(SwarmError::Service("guest does not host invitations".into()))
    }

    async fn admit(&self, _request: AdmissionRequest) -> Result<AdmissionResponse, SwarmError> {
        Err(SwarmError::Service("guest does not host invitations".into()))
    }
}

#[async_trait]
impl SwarmExtension for GuestExtension {
    fn bind(&self, connection: ConnectionHandle) {
        *self.connection.lock() = Some(connection);
    }

    async fn on_open(&self) {
        let Some(conn) = self.connection.lock().clone() else {
            return;
        };
        if self.shared.tried_hosts.lock().contains(&conn.remote_peer()) {
            conn.close();
            return;
        }

        match self.exchange_roles(&conn).await {
            Ok(()) => {}
            Err(InvitationError::RoleMismatch) => {
                // Another guest of the same invitation; not a failure.
                debug!(peer = %conn.remote_peer().display_id(), "peer is not a host");
                conn.close();
                return;
            }
            Err(err) => {
                debug!(%err, "options exchange failed");
                conn.close();
                return;
            }
        }

        match self.run_flow(&conn).await {
            Ok(FlowEnd::Done) | Ok(FlowEnd::Detached) => {}
            Err(err) => self.handle_failure(&conn, err),
        }
        conn.close();
    }
}

// ============================================================================
// TESTS
// ============================================================================
