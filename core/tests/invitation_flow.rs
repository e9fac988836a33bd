//! End-to-end invitation flows over the in-memory swarm.

use gangway_core::credentials::{IdentityService, MemoryIdentityService, MemorySpaceControl};
use gangway_core::invitation::device::DeviceInvitationProtocol;
use gangway_core::invitation::guest::{AuthTrigger, GuestFlowShared};
use gangway_core::invitation::handler::InvitationsHandler;
use gangway_core::invitation::manager::InvitationsManager;
use gangway_core::invitation::protocol::{
    AdmissionRequest, AdmissionResponse, AuthenticationRequest, AuthenticationResponse,
    IntroductionRequest, IntroductionResponse, InvitationProtocol, OptionsRequest,
    OptionsResponse, PeerRole,
};
use gangway_core::invitation::record::{InvitationOptions, InvitationRecord};
use gangway_core::invitation::space::SpaceInvitationProtocol;
use gangway_core::invitation::state::GuardedInvitationState;
use gangway_core::invitation::topology::InvitationTopology;
use gangway_core::swarm::memory::MemorySwarm;
use gangway_core::swarm::{
    ConnectionHandle, ExtensionFactory, InvitationService, JoinSwarmParams, SwarmController,
    SwarmError, SwarmExtension,
};
use gangway_core::{
    AuthMethod, InvitationError, InvitationState, InvitationType, KeyPair, PublicKey,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const TEST_DEADLINE: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn space_host(can_invite: bool) -> (Arc<SpaceInvitationProtocol>, PublicKey) {
    let spaces = MemorySpaceControl::new();
    let space_key = PublicKey::random();
    spaces.host_space(space_key, can_invite);
    let protocol = SpaceInvitationProtocol::new(
        spaces,
        MemoryIdentityService::with_identity("host"),
        space_key,
    );
    (protocol, space_key)
}

fn space_guest(space_key: PublicKey, name: &str) -> Arc<SpaceInvitationProtocol> {
    SpaceInvitationProtocol::new(
        MemorySpaceControl::new(),
        MemoryIdentityService::with_identity(name),
        space_key,
    )
}

/// Wait until the stream yields a record in `state`, failing the test
/// if the stream ends or the deadline passes first.
async fn wait_for_state(
    rx: &mut UnboundedReceiver<InvitationRecord>,
    state: InvitationState,
) -> InvitationRecord {
    timeout(TEST_DEADLINE, async {
        while let Some(record) = rx.recv().await {
            if record.state == state {
                return record;
            }
            assert!(
                !record.state.is_terminal(),
                "stream reached terminal {:?} while waiting for {:?} (error: {:?})",
                record.state,
                state,
                record.error,
            );
        }
        panic!("stream ended while waiting for {state:?}");
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {state:?}"))
}

/// Drain the stream and return the terminal record it ends with.
async fn terminal_record(rx: &mut UnboundedReceiver<InvitationRecord>) -> InvitationRecord {
    timeout(TEST_DEADLINE, async {
        let mut last = None;
        while let Some(record) = rx.recv().await {
            last = Some(record);
        }
        last.expect("stream emitted at least one record")
    })
    .await
    .expect("stream closed within the deadline")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_device_invitation_shared_secret_happy_path() {
    init_tracing();
    let swarm = Arc::new(MemorySwarm::new());
    let host_manager = InvitationsManager::new(InvitationsHandler::new(swarm.clone()), None);
    let guest_manager = InvitationsManager::new(InvitationsHandler::new(swarm.clone()), None);

    let host_identity = MemoryIdentityService::with_identity("alice-laptop");
    let host_protocol = DeviceInvitationProtocol::new(host_identity.clone());
    let (record, code, mut host_rx) = host_manager
        .create_invitation(
            host_protocol,
            InvitationOptions::default().with_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    let auth_code = record.auth_code.clone().unwrap();

    let guest_identity = MemoryIdentityService::without_identity();
    let guest_protocol = DeviceInvitationProtocol::new(guest_identity.clone());
    let (accepted, mut guest_rx) = guest_manager
        .accept_invitation(guest_protocol, &code)
        .await
        .unwrap();
    assert_eq!(accepted.invitation_id, record.invitation_id);

    wait_for_state(&mut guest_rx, InvitationState::ReadyForAuthentication).await;
    guest_manager
        .authenticate(&record.invitation_id, auth_code)
        .unwrap();

    let guest_final = terminal_record(&mut guest_rx).await;
    assert_eq!(guest_final.state, InvitationState::Success);
    assert_eq!(guest_final.identity_key, record.identity_key);
    assert_eq!(guest_identity.identity_key(), record.identity_key);
    assert_eq!(host_identity.admitted_devices().len(), 1);

    let host_final = terminal_record(&mut host_rx).await;
    assert_eq!(host_final.state, InvitationState::Success);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wrong_code_exhausts_attempts() {
    init_tracing();
    let swarm = Arc::new(MemorySwarm::new());
    let host_manager = InvitationsManager::new(InvitationsHandler::new(swarm.clone()), None);
    let guest_manager = InvitationsManager::new(InvitationsHandler::new(swarm.clone()), None);

    let (host_protocol, space_key) = space_host(true);
    let (record, code, _host_rx) = host_manager
        .create_invitation(
            host_protocol,
            InvitationOptions::default().with_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    let wrong_code = {
        let real = record.auth_code.clone().unwrap();
        if real == "000000" { "111111".to_string() } else { "000000".to_string() }
    };

    let (_accepted, mut guest_rx) = guest_manager
        .accept_invitation(space_guest(space_key, "mallory"), &code)
        .await
        .unwrap();

    for _ in 0..3 {
        wait_for_state_allow_terminal(&mut guest_rx, InvitationState::ReadyForAuthentication)
            .await;
        guest_manager
            .authenticate(&record.invitation_id, wrong_code.clone())
            .unwrap();
    }

    let guest_final = terminal_record(&mut guest_rx).await;
    assert_eq!(guest_final.state, InvitationState::Error);
    assert!(guest_final.error.unwrap().contains("InvalidOtpAttempts"));
}

/// Like `wait_for_state` but without failing on intermediate states,
/// used where the flow legitimately revisits the target state.
async fn wait_for_state_allow_terminal(
    rx: &mut UnboundedReceiver<InvitationRecord>,
    state: InvitationState,
) -> InvitationRecord {
    timeout(TEST_DEADLINE, async {
        while let Some(record) = rx.recv().await {
            if record.state == state {
                return record;
            }
        }
        panic!("stream ended while waiting for {state:?}");
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {state:?}"))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_space_invitation_without_auth() {
    init_tracing();
    let swarm = Arc::new(MemorySwarm::new());
    let host_manager = InvitationsManager::new(InvitationsHandler::new(swarm.clone()), None);
    let guest_manager = InvitationsManager::new(InvitationsHandler::new(swarm.clone()), None);

    let (host_protocol, space_key) = space_host(true);
    let (_record, code, mut host_rx) = host_manager
        .create_invitation(
            host_protocol,
            InvitationOptions::default()
                .with_auth_method(AuthMethod::None)
                .with_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    let guest_spaces = MemorySpaceControl::new();
    let guest_protocol = SpaceInvitationProtocol::new(
        guest_spaces.clone(),
        MemoryIdentityService::with_identity("bob"),
        space_key,
    );
    let (_accepted, mut guest_rx) = guest_manager
        .accept_invitation(guest_protocol, &code)
        .await
        .unwrap();

    let guest_final = terminal_record(&mut guest_rx).await;
    assert_eq!(guest_final.state, InvitationState::Success);
    assert_eq!(guest_final.space_key, Some(space_key));
    assert!(guest_spaces.admission(&space_key).is_some());

    let host_final = terminal_record(&mut host_rx).await;
    assert_eq!(host_final.state, InvitationState::Success);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_space_invitation_known_public_key() {
    init_tracing();
    let swarm = Arc::new(MemorySwarm::new());
    let host_manager = InvitationsManager::new(InvitationsHandler::new(swarm.clone()), None);
    let guest_manager = InvitationsManager::new(InvitationsHandler::new(swarm.clone()), None);

    let (host_protocol, space_key) = space_host(true);
    let (record, code, mut host_rx) = host_manager
        .create_invitation(
            host_protocol,
            InvitationOptions::default()
                .with_auth_method(AuthMethod::KnownPublicKey)
                .with_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    // The code carries the guest keypair; no interactive secret exists.
    assert!(record.guest_keypair.is_some());
    assert!(record.auth_code.is_none());

    let guest_spaces = MemorySpaceControl::new();
    let guest_protocol = SpaceInvitationProtocol::new(
        guest_spaces.clone(),
        MemoryIdentityService::with_identity("heidi"),
        space_key,
    );
    let (_accepted, mut guest_rx) = guest_manager
        .accept_invitation(guest_protocol, &code)
        .await
        .unwrap();

    // The challenge round-trip needs no code entry.
    let guest_final = terminal_record(&mut guest_rx).await;
    assert_eq!(guest_final.state, InvitationState::Success);
    assert_eq!(guest_final.space_key, Some(space_key));
    assert!(guest_spaces.admission(&space_key).is_some());

    let host_final = terminal_record(&mut host_rx).await;
    assert_eq!(host_final.state, InvitationState::Success);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_known_public_key_rejects_wrong_keypair() {
    init_tracing();
    let swarm = Arc::new(MemorySwarm::new());
    let host_manager = InvitationsManager::new(InvitationsHandler::new(swarm.clone()), None);
    let guest_manager = InvitationsManager::new(InvitationsHandler::new(swarm.clone()), None);

    let (host_protocol, space_key) = space_host(true);
    let (_record, code, _host_rx) = host_manager
        .create_invitation(
            host_protocol,
            InvitationOptions::default()
                .with_auth_method(AuthMethod::KnownPublicKey)
                .with_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    // A stolen code rewritten with a different keypair cannot answer
    // the host's challenge.
    let mut tampered = gangway_core::InvitationCode::decode(&code).unwrap();
    tampered.guest_keypair = Some(KeyPair::generate());
    let code = gangway_core::InvitationCode::encode(&tampered).unwrap();

    let (_accepted, mut guest_rx) = guest_manager
        .accept_invitation(space_guest(space_key, "trudy"), &code)
        .await
        .unwrap();

    let guest_final = terminal_record(&mut guest_rx).await;
    assert_eq!(guest_final.state, InvitationState::Error);
    assert!(guest_final.error.unwrap().contains("InvalidSignature"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_multi_use_invitation_admits_multiple_guests() {
    init_tracing();
    let swarm = Arc::new(MemorySwarm::new());
    let host_manager = InvitationsManager::new(InvitationsHandler::new(swarm.clone()), None);

    let (host_protocol, space_key) = space_host(true);
    let (_record, code, mut host_rx) = host_manager
        .create_invitation(
            host_protocol,
            InvitationOptions::default()
                .with_auth_method(AuthMethod::None)
                .multi_use(true)
                .with_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    for name in ["carol", "dave"] {
        let guest_manager = InvitationsManager::new(InvitationsHandler::new(swarm.clone()), None);
        let (_accepted, mut guest_rx) = guest_manager
            .accept_invitation(space_guest(space_key, name), &code)
            .await
            .unwrap();
        let guest_final = terminal_record(&mut guest_rx).await;
        assert_eq!(guest_final.state, InvitationState::Success);

        wait_for_state_allow_terminal(&mut host_rx, InvitationState::Success).await;
    }

    // The invitation is still registered and serving.
    assert_eq!(host_manager.created_invitations().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_use_invitation_admits_exactly_one_of_two_guests() {
    init_tracing();
    let swarm = Arc::new(MemorySwarm::new());
    let host_manager = InvitationsManager::new(InvitationsHandler::new(swarm.clone()), None);

    let (host_protocol, space_key) = space_host(true);
    let (_record, code, _host_rx) = host_manager
        .create_invitation(
            host_protocol,
            InvitationOptions::default()
                .with_auth_method(AuthMethod::None)
                .with_timeout(Duration::from_secs(2)),
        )
        .await
        .unwrap();

    let mut streams = Vec::new();
    for name in ["erin", "frank"] {
        let guest_manager = InvitationsManager::new(InvitationsHandler::new(swarm.clone()), None);
        let (_accepted, rx) = guest_manager
            .accept_invitation(space_guest(space_key, name), &code)
            .await
            .unwrap();
        streams.push((guest_manager, rx));
    }

    let mut outcomes = Vec::new();
    for (_manager, mut rx) in streams {
        outcomes.push(terminal_record(&mut rx).await.state);
    }
    let successes = outcomes
        .iter()
        .filter(|state| **state == InvitationState::Success)
        .count();
    assert_eq!(successes, 1, "outcomes: {outcomes:?}");
    assert!(outcomes.contains(&InvitationState::Timeout));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_expired_code_rejected_without_joining() {
    init_tracing();
    let swarm = Arc::new(MemorySwarm::new());
    let guest_manager = InvitationsManager::new(InvitationsHandler::new(swarm.clone()), None);

    let (host_protocol, space_key) = space_host(true);
    let mut record = InvitationRecord::create(
        InvitationOptions::default().with_lifetime_ms(1),
        host_protocol.invitation_context(),
    );
    record.created_at_ms -= 60_000;
    let code = gangway_core::InvitationCode::encode(&record).unwrap();

    let result = guest_manager
        .accept_invitation(space_guest(space_key, "late"), &code)
        .await;
    assert!(matches!(result, Err(InvitationError::Expired)));
}

/// A peer that claims the host role but fails every handshake step.
struct FailingHost {
    conn: parking_lot::Mutex<Option<ConnectionHandle>>,
}

#[async_trait]
impl InvitationService for FailingHost {
    async fn options(&self, _request: OptionsRequest) -> Result<OptionsResponse, SwarmError> {
        Ok(OptionsResponse {
            role: PeerRole::Host,
        })
    }

    async fn introduce(
        &self,
        _request: IntroductionRequest,
    ) -> Result<IntroductionResponse, SwarmError> {
        Err(SwarmError::Service("host lost its delegation".into()))
    }

    async fn authenticate(
        &self,
        _request: AuthenticationRequest,
    ) -> Result<AuthenticationResponse, SwarmError> {
        Err(SwarmError::Service("host lost its delegation".into()))
    }

    async fn admit(&self, _request: AdmissionRequest) -> Result<AdmissionResponse, SwarmError> {
        Err(SwarmError::Service("host lost its delegation".into()))
    }
}

#[async_trait]
impl SwarmExtension for FailingHost {
    fn bind(&self, connection: ConnectionHandle) {
        *self.conn.lock() = Some(connection);
    }

    async fn on_open(&self) {}
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delegated_guest_retries_next_host() {
    init_tracing();
    let swarm = Arc::new(MemorySwarm::new());
    let handler = InvitationsHandler::new(swarm.clone());

    let (host_protocol, space_key) = space_host(true);
    let record = InvitationRecord::create(
        InvitationOptions::default()
            .with_type(InvitationType::Delegated)
            .with_auth_method(AuthMethod::None)
            .with_timeout(Duration::from_secs(5)),
        host_protocol.invitation_context(),
    );

    // A broken delegated host joins the topic first.
    let failing: ExtensionFactory = Arc::new(|| {
        Arc::new(FailingHost {
            conn: parking_lot::Mutex::new(None),
        }) as Arc<dyn SwarmExtension>
    });
    let _broken_join = swarm
        .join(JoinSwarmParams {
            topic: record.swarm_key,
            peer_id: PublicKey::random(),
            topology: InvitationTopology::new(PeerRole::Host),
            extensions: failing,
        })
        .await
        .unwrap();

    // Guest starts redeeming and fails against the broken host.
    let guest_record = {
        let code = gangway_core::InvitationCode::encode(&record).unwrap();
        gangway_core::InvitationCode::decode(&code).unwrap()
    };
    let (guest_state, mut guest_rx) = GuardedInvitationState::new(guest_record);
    let shared = GuestFlowShared::new(AuthTrigger::new());
    handler
        .accept_invitation_flow(
            guest_state.clone(),
            space_guest(space_key, "grace"),
            shared,
        )
        .await
        .unwrap();

    // First attempt fails; the guest reverts to Connecting.
    wait_for_state_allow_terminal(&mut guest_rx, InvitationState::Connected).await;
    wait_for_state_allow_terminal(&mut guest_rx, InvitationState::Connecting).await;

    // A healthy delegated host comes online.
    let (host_state, _host_rx) = GuardedInvitationState::new(record.clone());
    handler
        .host_invitation_flow(host_state.clone(), host_protocol)
        .await
        .unwrap();

    let guest_final = terminal_record(&mut guest_rx).await;
    assert_eq!(guest_final.state, InvitationState::Success);
}
