//! Invitation registries and lifecycle
//!
//! Owns the created and accepted invitation registries, persists
//! persistent invitations through the storage backend, and exposes the
//! code-entry path for interactive authentication.

use super::code::InvitationCode;
use super::guest::{AuthTrigger, GuestFlowShared};
use super::handler::InvitationsHandler;
use super::protocol::InvitationProtocol;
use super::record::{now_ms, InvitationOptions, InvitationRecord, InvitationState, InvitationType};
use super::state::GuardedInvitationState;
use super::InvitationError;
use crate::store::{StorageBackend, StoreError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

const STORAGE_PREFIX: &str = "invitation/";
const EVENT_CAPACITY: usize = 64;

/// Registry lifecycle notifications.
#[derive(Debug, Clone)]
pub enum InvitationEvent {
    Created(InvitationRecord),
    Accepted(InvitationRecord),
    RemovedCreated(String),
    RemovedAccepted(String),
    Saved(String),
}

struct ActiveInvitation {
    state: GuardedInvitationState,
    protocol: Arc<dyn InvitationProtocol>,
    auth_trigger: Option<Arc<AuthTrigger>>,
}

pub struct InvitationsManager {
    handler: Arc<InvitationsHandler>,
    storage: Option<Arc<dyn StorageBackend>>,
    created: Mutex<HashMap<String, ActiveInvitation>>,
    accepted: Mutex<HashMap<String, ActiveInvitation>>,
    events: broadcast::Sender<InvitationEvent>,
}

impl InvitationsManager {
    pub fn new(
        handler: Arc<InvitationsHandler>,
        storage: Option<Arc<dyn StorageBackend>>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            handler,
            storage,
            created: Mutex::new(HashMap::new()),
            accepted: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InvitationEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: InvitationEvent) {
        let _ = self.events.send(event);
    }

    /// Create and start hosting a new invitation. Returns the initial
    /// record, its shareable code and the state stream.
    pub async fn create_invitation(
        self: &Arc<Self>,
        protocol: Arc<dyn InvitationProtocol>,
        options: InvitationOptions,
    ) -> Result<
        (
            InvitationRecord,
            String,
            mpsc::UnboundedReceiver<InvitationRecord>,
        ),
        InvitationError,
    > {
        protocol.check_can_invite_new_members().await?;

        let mut record = InvitationRecord::create(options, protocol.invitation_context());
        if record.invitation_type == InvitationType::Delegated {
            record.delegation_credential_id = Some(protocol.delegate(&record).await?);
        }
        let code = InvitationCode::encode(&record)
            .map_err(|err| InvitationError::InvalidInvitation(err.to_string()))?;

        let (state, rx) = GuardedInvitationState::new(record.clone());
        self.created.lock().insert(
            record.invitation_id.clone(),
            ActiveInvitation {
                state: state.clone(),
                protocol: protocol.clone(),
                auth_trigger: None,
            },
        );
        self.persist(&record)?;
        self.watch_removal(&state, record.invitation_id.clone(), true);

        if let Err(err) = self
            .handler
            .host_invitation_flow(state.clone(), protocol)
            .await
        {
            self.remove_created(&record.invitation_id);
            return Err(err);
        }

        let snapshot = state.record();
        info!(invitation = %snapshot.invitation_id, "invitation created");
        self.emit(InvitationEvent::Created(snapshot.clone()));
        Ok((snapshot, code, rx))
    }

    /// Redeem an invitation code as a guest. The returned stream ends
    /// with a terminal record.
    pub async fn accept_invitation(
        self: &Arc<Self>,
        protocol: Arc<dyn InvitationProtocol>,
        code: &str,
    ) -> Result<
        (
            InvitationRecord,
            mpsc::UnboundedReceiver<InvitationRecord>,
        ),
        InvitationError,
    > {
        let record = InvitationCode::decode(code)
            .map_err(|err| InvitationError::InvalidInvitation(err.to_string()))?;

        let auth_trigger = AuthTrigger::new();
        let shared = GuestFlowShared::new(auth_trigger.clone());
        let (state, rx) = GuardedInvitationState::new(record.clone());
        self.accepted.lock().insert(
            record.invitation_id.clone(),
            ActiveInvitation {
                state: state.clone(),
                protocol: protocol.clone(),
                auth_trigger: Some(auth_trigger),
            },
        );
        self.watch_removal(&state, record.invitation_id.clone(), false);

        if let Err(err) = self
            .handler
            .accept_invitation_flow(state.clone(), protocol, shared)
            .await
        {
            self.remove_accepted(&record.invitation_id);
            return Err(err);
        }

        let snapshot = state.record();
        info!(invitation = %snapshot.invitation_id, "invitation accepted");
        self.emit(InvitationEvent::Accepted(snapshot.clone()));
        Ok((snapshot, rx))
    }

    /// Deliver an interactively-entered passcode to a waiting guest
    /// flow.
    pub fn authenticate(&self, invitation_id: &str, code: String) -> Result<(), InvitationError> {
        let accepted = self.accepted.lock();
        let entry = accepted.get(invitation_id).ok_or_else(|| {
            InvitationError::InvalidInvitation("no such pending invitation".into())
        })?;
        match &entry.auth_trigger {
            Some(trigger) => {
                trigger.wake(code);
                Ok(())
            }
            None => Err(InvitationError::InvalidInvitation(
                "invitation does not expect a code".into(),
            )),
        }
    }

    /// Cancel an invitation from either registry. For delegated
    /// invitations the delegation credential is revoked as well.
    pub async fn cancel_invitation(&self, invitation_id: &str) -> Result<(), InvitationError> {
        let entry = {
            let created = self.created.lock();
            created
                .get(invitation_id)
                .map(|entry| (entry.state.clone(), entry.protocol.clone(), true))
        }
        .or_else(|| {
            let accepted = self.accepted.lock();
            accepted
                .get(invitation_id)
                .map(|entry| (entry.state.clone(), entry.protocol.clone(), false))
        });
        let Some((state, protocol, hosted)) = entry else {
            return Err(InvitationError::InvalidInvitation(
                "no such invitation".into(),
            ));
        };

        let record = state.record();
        if hosted && record.invitation_type == InvitationType::Delegated {
            if let Err(err) = protocol.cancel_delegation(&record).await {
                warn!(invitation = %invitation_id, %err, "failed to revoke delegation");
            }
        }
        if state.set(None, InvitationState::Cancelled) {
            info!(invitation = %invitation_id, "invitation cancelled");
        }
        state.dispose();
        Ok(())
    }

    /// Reload persisted invitations: prune the expired ones and restart
    /// hosting for the rest. `resolve` maps a stored record back to its
    /// protocol strategy; records it cannot resolve are left stored.
    pub async fn load_persisted(
        self: &Arc<Self>,
        resolve: impl Fn(&InvitationRecord) -> Option<Arc<dyn InvitationProtocol>>,
    ) -> Result<Vec<InvitationRecord>, InvitationError> {
        let Some(storage) = &self.storage else {
            return Ok(Vec::new());
        };

        let mut restored = Vec::new();
        for (key, value) in storage.scan_prefix(STORAGE_PREFIX.as_bytes())? {
            let record: InvitationRecord = match serde_json::from_slice(&value) {
                Ok(record) => record,
                Err(err) => {
                    warn!(%err, "dropping unreadable persisted invitation");
                    storage.remove(&key)?;
                    continue;
                }
            };
            if record.is_expired(now_ms()) {
                debug!(invitation = %record.invitation_id, "pruning expired persisted invitation");
                storage.remove(&key)?;
                continue;
            }
            let Some(protocol) = resolve(&record) else {
                continue;
            };

            let (state, _rx) = GuardedInvitationState::new(record.clone());
            self.created.lock().insert(
                record.invitation_id.clone(),
                ActiveInvitation {
                    state: state.clone(),
                    protocol: protocol.clone(),
                    auth_trigger: None,
                },
            );
            self.watch_removal(&state, record.invitation_id.clone(), true);
            self.handler
                .host_invitation_flow(state.clone(), protocol)
                .await?;
            let snapshot = state.record();
            self.emit(InvitationEvent::Created(snapshot.clone()));
            restored.push(snapshot);
        }
        Ok(restored)
    }

    /// Records created by this manager, as currently known.
    pub fn created_invitations(&self) -> Vec<InvitationRecord> {
        self.created
            .lock()
            .values()
            .map(|entry| entry.state.record())
            .collect()
    }

    pub fn accepted_invitations(&self) -> Vec<InvitationRecord> {
        self.accepted
            .lock()
            .values()
            .map(|entry| entry.state.record())
            .collect()
    }

    fn storage_key(invitation_id: &str) -> Vec<u8> {
        format!("{STORAGE_PREFIX}{invitation_id}").into_bytes()
    }

    /// Persist a persistent invitation. Delegated invitations live on
    /// as their delegation credential and records carrying a guest
    /// keypair never touch the store.
    fn persist(&self, record: &InvitationRecord) -> Result<(), StoreError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        if !record.persistent
            || record.guest_keypair.is_some()
            || record.invitation_type == InvitationType::Delegated
        {
            return Ok(());
        }
        let bytes = serde_json::to_vec(record)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        storage.put(&Self::storage_key(&record.invitation_id), &bytes)?;
        storage.flush()?;
        self.emit(InvitationEvent::Saved(record.invitation_id.clone()));
        Ok(())
    }

    fn remove_created(&self, invitation_id: &str) {
        if self.created.lock().remove(invitation_id).is_some() {
            if let Some(storage) = &self.storage {
                if let Err(err) = storage.remove(&Self::storage_key(invitation_id)) {
                    warn!(invitation = %invitation_id, %err, "failed to remove persisted invitation");
                }
            }
            self.emit(InvitationEvent::RemovedCreated(invitation_id.to_string()));
        }
    }

    fn remove_accepted(&self, invitation_id: &str) {
        if self.accepted.lock().remove(invitation_id).is_some() {
            self.emit(InvitationEvent::RemovedAccepted(invitation_id.to_string()));
        }
    }

    /// Drop the registry entry once the invitation context is disposed.
    fn watch_removal(
        self: &Arc<Self>,
        state: &GuardedInvitationState,
        invitation_id: String,
        hosted: bool,
    ) {
        let ctx = state.context();
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            ctx.cancelled().await;
            if let Some(manager) = manager.upgrade() {
                if hosted {
                    manager.remove_created(&invitation_id);
                } else {
                    manager.remove_accepted(&invitation_id);
                }
            }
        });
    }
}

// ============================================================================
// TESTS
// ============================================================================
