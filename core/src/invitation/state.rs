//! Guarded invitation state
//!
//! Serializes state transitions across concurrent connection attempts.
//! Lock acquisition returns a `FlowGuard` carrying an epoch; a
//! transition presented with a stale guard is rejected, so a losing
//! connection can never clobber a transition made by the flow that
//! currently owns the invitation.

use super::record::{InvitationRecord, InvitationState};
use super::InvitationError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Shared {
    record: Mutex<InvitationRecord>,
    events: Mutex<Option<mpsc::UnboundedSender<InvitationRecord>>>,
    ctx: CancellationToken,
    flow: Arc<tokio::sync::Mutex<()>>,
    /// Monotonic acquisition counter.
    epoch: AtomicU64,
    /// Epoch of the current lock holder, 0 when the lock is free.
    active: AtomicU64,
    /// Epoch that produced the current terminal state, if any.
    terminal_epoch: AtomicU64,
}

/// Exclusive right to drive one invitation's state. Dropping the guard
/// releases the flow lock; the epoch stays burned.
pub struct FlowGuard {
    epoch: u64,
    shared: Arc<Shared>,
    _permit: OwnedMutexGuard<()>,
}

impl FlowGuard {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        let _ = self.shared.active.compare_exchange(
            self.epoch,
            0,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

/// Wraps one `InvitationRecord` behind the flow lock and an event
/// stream; every applied transition is pushed to subscribers.
#[derive(Clone)]
pub struct GuardedInvitationState {
    shared: Arc<Shared>,
}

impl GuardedInvitationState {
    /// Returns the guarded state and the event stream observing it.
    pub fn new(record: InvitationRecord) -> (Self, mpsc::UnboundedReceiver<InvitationRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Self {
            shared: Arc::new(Shared {
                record: Mutex::new(record),
                events: Mutex::new(Some(tx)),
                ctx: CancellationToken::new(),
                flow: Arc::new(tokio::sync::Mutex::new(())),
                epoch: AtomicU64::new(0),
                active: AtomicU64::new(0),
                terminal_epoch: AtomicU64::new(0),
            }),
        };
        (state, rx)
    }

    /// Cancellation context owning the invitation's tasks and timers.
    pub fn context(&self) -> CancellationToken {
        self.shared.ctx.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.ctx.is_cancelled()
    }

    /// Whether some flow currently holds the lock.
    pub fn is_flow_locked(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst) != 0
    }

    /// Snapshot of the current record.
    pub fn record(&self) -> InvitationRecord {
        self.shared.record.lock().clone()
    }

    /// Acquire the flow lock, waiting until it is free. Fails once the
    /// invitation context is disposed.
    pub async fn acquire_flow(&self) -> Result<FlowGuard, InvitationError> {
        let permit = tokio::select! {
            permit = self.shared.flow.clone().lock_owned() => permit,
            _ = self.shared.ctx.cancelled() => return Err(InvitationError::ContextDisposed),
        };
        if self.shared.ctx.is_cancelled() {
            return Err(InvitationError::ContextDisposed);
        }
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.active.store(epoch, Ordering::SeqCst);
        debug!(epoch, "flow lock acquired");
        Ok(FlowGuard {
            epoch,
            shared: self.shared.clone(),
            _permit: permit,
        })
    }

    /// Apply a state transition. Returns whether it was applied.
    ///
    /// `holder == None` marks an administrative transition (cancel,
    /// expiration, initial Connecting); it is rejected while any flow
    /// holds the lock and may not leave a terminal state. A holder
    /// transition is rejected when its epoch is stale, and may leave a
    /// terminal state only if it is strictly newer than the epoch that
    /// produced it (delegated/multi-use restart).
    pub fn set(&self, holder: Option<&FlowGuard>, new_state: InvitationState) -> bool {
        self.transition(holder, new_state, |_| {})
    }

    /// Like `set`, additionally merging record fields under the same
    /// gating (e.g. adopting the auth method from an introduction
    /// response).
    pub fn transition(
        &self,
        holder: Option<&FlowGuard>,
        new_state: InvitationState,
        update: impl FnOnce(&mut InvitationRecord),
    ) -> bool {
        if self.shared.ctx.is_cancelled() {
            return false;
        }
        let holder_epoch = match holder {
            Some(guard) => {
                if self.shared.active.load(Ordering::SeqCst) != guard.epoch {
                    debug!(epoch = guard.epoch, "rejected transition from stale flow");
                    return false;
                }
                guard.epoch
            }
            None => {
                // Administrative transitions yield to whichever flow
                // holds the lock.
                if self.shared.active.load(Ordering::SeqCst) != 0 {
                    debug!("rejected administrative transition during an active flow");
                    return false;
                }
                0
            }
        };

        let snapshot = {
            let mut record = self.shared.record.lock();
            if record.state.is_terminal()
                && holder_epoch <= self.shared.terminal_epoch.load(Ordering::SeqCst)
            {
                debug!(state = ?record.state, "rejected transition out of terminal state");
                return false;
            }
            update(&mut record);
            record.state = new_state;
            if new_state.is_terminal() {
                let sealed = if holder_epoch > 0 {
                    holder_epoch
                } else {
                    self.shared.epoch.load(Ordering::SeqCst)
                };
                self.shared.terminal_epoch.store(sealed, Ordering::SeqCst);
            }
            record.clone()
        };
        self.emit(snapshot);
        true
    }

    /// Record a flow-fatal error: transition to Error with the message
    /// attached, then dispose the invitation context.
    pub fn error(&self, holder: Option<&FlowGuard>, err: &InvitationError) -> bool {
        let message = err.to_string();
        let applied = self.transition(holder, InvitationState::Error, |record| {
            record.error = Some(message);
        });
        if applied {
            self.dispose();
        }
        applied
    }

    /// Final success: merge the admission result into the record, emit
    /// Success and dispose the context. Used only by the flow that
    /// actually completed admission.
    pub fn complete(&self, update: impl FnOnce(&mut InvitationRecord)) {
        if self.shared.ctx.is_cancelled() {
            return;
        }
        let snapshot = {
            let mut record = self.shared.record.lock();
            update(&mut record);
            record.state = InvitationState::Success;
            self.shared
                .terminal_epoch
                .store(self.shared.epoch.load(Ordering::SeqCst), Ordering::SeqCst);
            record.clone()
        };
        self.emit(snapshot);
        self.dispose();
    }

    /// Tear down the invitation: cancels all child tasks and closes the
    /// event stream.
    pub fn dispose(&self) {
        self.shared.ctx.cancel();
        self.shared.events.lock().take();
    }

    fn emit(&self, snapshot: InvitationRecord) {
        if let Some(tx) = self.shared.events.lock().as_ref() {
            let _ = tx.send(snapshot);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
