//! Edge-service fallback for delegated space invitations
//!
//! When no delegated host is reachable over the swarm, the guest can
//! redeem eligible invitations against the edge HTTP service instead.
//! Both paths race for the same flow lock; whichever admits first
//! wins and the other is rejected by its stale epoch.

use super::protocol::{AdmissionRequest, AdmissionResponse, InvitationProtocol};
use super::record::{
    AuthMethod, InvitationKind, InvitationRecord, InvitationState, InvitationType,
};
use super::state::GuardedInvitationState;
use super::InvitationError;
use crate::credentials::{Credential, SpaceRole, Timeframe};
use crate::keys::PublicKey;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Attempt budget per invitation; counts every call, including ones
/// answered with an authentication challenge.
pub const MAX_RETRIES_PER_INVITATION: u32 = 5;

const RETRY_INTERVAL: Duration = Duration::from_millis(3000);
const RETRY_JITTER_MS: u64 = 500;

/// Edge transport errors
#[derive(Debug, Error)]
pub enum EdgeError {
    /// The service wants the invitation's guest key to sign `challenge`
    /// before it will admit.
    #[error("Edge service issued an authentication challenge")]
    AuthChallenge { challenge: Vec<u8> },
    #[error("Edge call failed: {message}")]
    CallFailed {
        message: String,
        retryable: bool,
        retry_after_ms: Option<u64>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeJoinRequest {
    pub invitation_id: String,
    pub device_key: PublicKey,
    pub identity_key: PublicKey,
    pub space_key: PublicKey,
    /// Hex signature over the previously issued challenge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge_signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeJoinResponse {
    pub space_key: PublicKey,
    pub role: SpaceRole,
    pub credential: Credential,
    pub timeframe: Timeframe,
}

/// Client for the edge invitation endpoint.
#[async_trait]
pub trait EdgeClient: Send + Sync {
    async fn join_space_by_invitation(
        &self,
        request: &EdgeJoinRequest,
    ) -> Result<EdgeJoinResponse, EdgeError>;
}

/// HTTP implementation of [`EdgeClient`].
pub struct HttpEdgeClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpEdgeClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, EdgeError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| EdgeError::CallFailed {
                message: err.to_string(),
                retryable: false,
                retry_after_ms: None,
            })?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    fn retry_after_ms(response: &reqwest::Response) -> Option<u64> {
        response
            .headers()
            .get(reqwest::header::RETRY_AFTER)?
            .to_str()
            .ok()?
            .parse::<u64>()
            .ok()
            .map(|secs| secs * 1000)
    }
}

#[async_trait]
impl EdgeClient for HttpEdgeClient {
    async fn join_space_by_invitation(
        &self,
        request: &EdgeJoinRequest,
    ) -> Result<EdgeJoinResponse, EdgeError> {
        let url = format!("{}/spaces/join", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|err| EdgeError::CallFailed {
                message: err.to_string(),
                // Connection-level failures are worth another try.
                retryable: true,
                retry_after_ms: None,
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            if let Some(challenge) = response
                .headers()
                .get("x-edge-challenge")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| hex::decode(value).ok())
            {
                return Err(EdgeError::AuthChallenge { challenge });
            }
            return Err(EdgeError::CallFailed {
                message: "unauthorized".into(),
                retryable: false,
                retry_after_ms: None,
            });
        }
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = Self::retry_after_ms(&response);
            return Err(EdgeError::CallFailed {
                message: format!("edge responded {status}"),
                retryable: true,
                retry_after_ms,
            });
        }
        if !status.is_success() {
            return Err(EdgeError::CallFailed {
                message: format!("edge responded {status}"),
                retryable: false,
                retry_after_ms: None,
            });
        }

        response
            .json::<EdgeJoinResponse>()
            .await
            .map_err(|err| EdgeError::CallFailed {
                message: err.to_string(),
                retryable: false,
                retry_after_ms: None,
            })
    }
}

pub struct EdgeInvitationHandler {
    client: Arc<dyn EdgeClient>,
}

impl EdgeInvitationHandler {
    pub fn new(client: Arc<dyn EdgeClient>) -> Arc<Self> {
        Arc::new(Self { client })
    }

    /// Only delegated space invitations without an interactive secret
    /// can be redeemed without a live host.
    pub fn eligible(record: &InvitationRecord) -> bool {
        record.kind == InvitationKind::Space
            && record.invitation_type == InvitationType::Delegated
            && record.auth_method != AuthMethod::SharedSecret
            && record.space_key.is_some()
    }

    fn build_request(
        record: &InvitationRecord,
        admission: &AdmissionRequest,
        challenge_signature: Option<String>,
    ) -> Result<EdgeJoinRequest, InvitationError> {
        let (device_key, identity_key) = match admission {
            AdmissionRequest::Space {
                device_key,
                identity_key,
                ..
            } => (*device_key, *identity_key),
            AdmissionRequest::Device { .. } => {
                return Err(InvitationError::Protocol(
                    "edge redemption is space-only".into(),
                ))
            }
        };
        let space_key = record
            .space_key
            .ok_or_else(|| InvitationError::Protocol("invitation names no space".into()))?;
        Ok(EdgeJoinRequest {
            invitation_id: record.invitation_id.clone(),
            device_key,
            identity_key,
            space_key,
            challenge_signature,
        })
    }

    /// Drive edge redemption until success, a terminal failure, or the
    /// attempt budget runs out. Yields the flow lock between attempts.
    pub async fn handle(
        &self,
        state: GuardedInvitationState,
        protocol: Arc<dyn InvitationProtocol>,
    ) {
        let mut challenge_signature: Option<String> = None;
        let mut last_failure = String::from("no attempts made");

        for attempt in 1..=MAX_RETRIES_PER_INVITATION {
            let guard = match state.acquire_flow().await {
                Ok(guard) => guard,
                // Disposed; the swarm path finished first.
                Err(_) => return,
            };
            if state.record().state.is_terminal() {
                return;
            }
            state.set(Some(&guard), InvitationState::Connecting);
            let record = state.record();

            let admission = match protocol.create_admission_request(&record).await {
                Ok(admission) => admission,
                Err(err) => {
                    state.error(Some(&guard), &err);
                    return;
                }
            };
            let request =
                match Self::build_request(&record, &admission, challenge_signature.take()) {
                    Ok(request) => request,
                    Err(err) => {
                        state.error(Some(&guard), &err);
                        return;
                    }
                };

            debug!(invitation = %record.invitation_id, attempt, "calling edge service");
            match self.client.join_space_by_invitation(&request).await {
                Ok(response) => {
                    let response = AdmissionResponse::Space {
                        space_key: response.space_key,
                        role: response.role,
                        credential: response.credential,
                        timeframe: response.timeframe,
                    };
                    match protocol.accept(response, &admission).await {
                        Ok(result) => {
                            info!(invitation = %record.invitation_id, "admitted via edge");
                            state.complete(move |record| {
                                record.space_key = result.space_key.or(record.space_key);
                                if result.role.is_some() {
                                    record.role = result.role;
                                }
                            });
                        }
                        Err(err) => {
                            state.error(Some(&guard), &err);
                        }
                    }
                    return;
                }
                Err(EdgeError::AuthChallenge { challenge }) => {
                    let Some(keypair) = record.guest_keypair.as_ref() else {
                        state.error(
                            Some(&guard),
                            &InvitationError::Protocol("invitation carries no guest key".into()),
                        );
                        return;
                    };
                    debug!(invitation = %record.invitation_id, "answering edge challenge");
                    challenge_signature = Some(hex::encode(keypair.sign(&challenge)));
                    last_failure = "edge challenge unanswered".into();
                    // Resubmit immediately with the signature attached.
                    continue;
                }
                Err(EdgeError::CallFailed {
                    message,
                    retryable: true,
                    retry_after_ms,
                }) => {
                    warn!(invitation = %record.invitation_id, attempt, %message, "edge call failed, will retry");
                    last_failure = message;
                    drop(guard);
                    let base = retry_after_ms
                        .map(Duration::from_millis)
                        .unwrap_or(RETRY_INTERVAL);
                    let jitter =
                        Duration::from_millis(rand::thread_rng().gen_range(0..RETRY_JITTER_MS));
                    let ctx = state.context();
                    tokio::select! {
                        _ = ctx.cancelled() => return,
                        _ = tokio::time::sleep(base + jitter) => {}
                    }
                }
                Err(err @ EdgeError::CallFailed { .. }) => {
                    state.error(Some(&guard), &InvitationError::Edge(err));
                    return;
                }
            }
        }

        state.error(
            None,
            &InvitationError::Edge(EdgeError::CallFailed {
                message: last_failure,
                retryable: false,
                retry_after_ms: None,
            }),
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================
