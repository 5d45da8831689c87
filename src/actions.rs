//! Optimistic mutations and the queue drain.
//!
//! Kitchen taps must feel instant on a flaky link, so every mutation applies
//! to the board first and talks to the server second. Offline, the mutation
//! lands in the durable queue and the optimistic state *is* the success.
//! Online, a refused status update rolls back that one order and surfaces a
//! failure event; a refused acknowledgement keeps the overlay because acking
//! is idempotent and safe to over-apply.
//!
//! Each call is independent: no cross-call lock, so updates to different
//! orders never wait on each other. Two concurrent updates to the same order
//! race last-write-wins, which is acceptable for a screen driven by one pair
//! of hands.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::api::{ApiError, ApiResult, OrderApi};
use crate::connectivity::ConnectivityGate;
use crate::events::{EventBus, UiEvent};
use crate::orders::OrderStatus;
use crate::queue::{ActionKind, ActionPayload, ActionQueue, PendingAction, MAX_ACTION_ATTEMPTS};
use crate::reconcile::Reconciler;
use crate::store::OrderBoard;

/// Tally of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub dropped: usize,
}

/// One order's three-phase optimistic status change: snapshot the previous
/// status, show the tentative one, then commit or restore exactly that
/// order.
struct StatusAttempt<'a> {
    board: &'a OrderBoard,
    order_id: &'a str,
    previous: OrderStatus,
}

impl<'a> StatusAttempt<'a> {
    /// Apply `target` to the list and selected mirror. `None` when the
    /// order is not on the board; nothing is changed in that case.
    fn apply(board: &'a OrderBoard, order_id: &'a str, target: OrderStatus) -> Option<Self> {
        let previous = board.set_status(order_id, target)?;
        Some(StatusAttempt {
            board,
            order_id,
            previous,
        })
    }

    /// The change sticks.
    fn commit(self) {}

    /// Put the snapshotted status back on this one order.
    fn rollback(self) {
        self.board.set_status(self.order_id, self.previous);
    }
}

pub struct MutationExecutor {
    board: Arc<OrderBoard>,
    queue: Arc<ActionQueue>,
    reconciler: Arc<Reconciler>,
    api: Arc<dyn OrderApi>,
    gate: Arc<ConnectivityGate>,
    bus: EventBus,
    /// One drain at a time; a second trigger while one runs is a no-op.
    draining: AtomicBool,
    /// First auth rejection seen since the last [`MutationExecutor::take_auth_failure`].
    auth_failure: Mutex<Option<String>>,
}

impl MutationExecutor {
    pub fn new(
        board: Arc<OrderBoard>,
        queue: Arc<ActionQueue>,
        reconciler: Arc<Reconciler>,
        api: Arc<dyn OrderApi>,
        gate: Arc<ConnectivityGate>,
        bus: EventBus,
    ) -> Self {
        MutationExecutor {
            board,
            queue,
            reconciler,
            api,
            gate,
            bus,
            draining: AtomicBool::new(false),
            auth_failure: Mutex::new(None),
        }
    }

    fn note_auth_failure(&self, error: &ApiError) {
        if error.is_auth() {
            warn!("Server rejected station credentials: {error}");
            if let Ok(mut slot) = self.auth_failure.lock() {
                slot.get_or_insert_with(|| error.to_string());
            }
        }
    }

    /// The reason the server rejected our credentials, if it did. Taking it
    /// clears the flag; the engine loop reacts by de-authorizing the station.
    pub fn take_auth_failure(&self) -> Option<String> {
        self.auth_failure.lock().ok().and_then(|mut slot| slot.take())
    }

    // -----------------------------------------------------------------------
    // Acknowledge
    // -----------------------------------------------------------------------

    /// Record that the kitchen saw an order.
    ///
    /// The overlay entry is written before anything can fail, so the alert
    /// strip stops immediately. A repeat call for the same order is a no-op
    /// that keeps the first tap's timestamp. `Ok(false)` means the server
    /// refused while online; local state is unchanged by the refusal.
    pub async fn acknowledge(&self, order_id: &str) -> Result<bool, String> {
        if self.board.overlay_contains(order_id) {
            debug!("Order {order_id} already acknowledged, nothing to do");
            return Ok(true);
        }

        let now = Utc::now();
        if !self.board.overlay_insert(order_id, now) {
            // Raced another tap; the first one owns the timestamp
            return Ok(true);
        }
        if let Err(e) = self.reconciler.persist_ack(order_id, now) {
            warn!("Could not persist ack for order {order_id}: {e}");
        }
        self.board.set_acknowledged(order_id, Some(now));

        if !self.gate.is_online() {
            let payload = ActionPayload {
                acknowledged_at: Some(now),
                numeric_id: self.board.numeric_id_of(order_id),
                ..Default::default()
            };
            self.queue.enqueue(ActionKind::Acknowledge, order_id, &payload);
            return Ok(true);
        }

        match self.api.acknowledge(order_id, Some(now)).await {
            Ok(mut updated) => {
                // The local tap instant beats whatever the server stamped
                if let Some(at) = self.board.overlay_get(order_id) {
                    updated.acknowledged_at = Some(at);
                }
                self.board.merge_remote(updated);
                Ok(true)
            }
            Err(e) => {
                self.note_auth_failure(&e);
                info!("Acknowledge for order {order_id} refused, overlay retained: {e}");
                Ok(false)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Status update
    // -----------------------------------------------------------------------

    /// Move an order to a new status.
    ///
    /// Refuses outright (`Err`) when the order is not on the board; nothing
    /// is mutated or queued in that case. Otherwise the status applies
    /// optimistically, and `Ok(false)` means the online call was refused and
    /// that one order was rolled back.
    pub async fn update_status(
        &self,
        order_id: &str,
        new_status: OrderStatus,
    ) -> Result<bool, String> {
        let numeric_id = match self.board.get(order_id) {
            Some(order) => order.numeric_id,
            None => return Err(format!("Order {order_id} is not on the board")),
        };

        let attempt = match StatusAttempt::apply(&self.board, order_id, new_status) {
            Some(attempt) => attempt,
            // The board changed between lookup and apply
            None => return Err(format!("Order {order_id} is not on the board")),
        };

        if !self.gate.is_online() {
            let payload = ActionPayload {
                target_status: Some(new_status),
                numeric_id,
                ..Default::default()
            };
            self.queue
                .enqueue(ActionKind::StatusUpdate, order_id, &payload);
            attempt.commit();
            return Ok(true);
        }

        let numeric_id = match numeric_id {
            Some(n) => n,
            None => {
                self.fail_attempt(attempt, new_status, "Order has no kitchen ticket number yet");
                return Ok(false);
            }
        };

        match self.api.update_status(numeric_id, new_status).await {
            Ok(()) => {
                attempt.commit();
                Ok(true)
            }
            Err(e) => {
                self.note_auth_failure(&e);
                self.fail_attempt(attempt, new_status, &e.to_string());
                Ok(false)
            }
        }
    }

    /// Roll one order's optimistic status change back and tell the display
    /// why. Other orders' in-flight updates are not touched.
    fn fail_attempt(&self, attempt: StatusAttempt<'_>, target: OrderStatus, error: &str) {
        warn!(
            "Rolling back order {} to {}: {error}",
            attempt.order_id, attempt.previous
        );
        let order_id = attempt.order_id.to_string();
        attempt.rollback();
        self.bus.emit(UiEvent::StatusUpdateFailed {
            order_id,
            target_status: target,
            error: error.to_string(),
        });
    }

    // -----------------------------------------------------------------------
    // Drain
    // -----------------------------------------------------------------------

    /// Replay queued actions FIFO, walking the whole queue once.
    ///
    /// One action's failure does not block the rest; only an auth rejection
    /// aborts the walk, since every later action would bounce off the same
    /// dead credentials. A concurrent drain trigger returns an empty summary
    /// instead of replaying rows twice.
    pub async fn drain(&self) -> DrainSummary {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            debug!("Drain already running, skipping");
            return DrainSummary::default();
        }

        let summary = self.drain_inner().await;
        self.draining.store(false, Ordering::SeqCst);
        summary
    }

    async fn drain_inner(&self) -> DrainSummary {
        let mut summary = DrainSummary::default();
        let actions = match self.queue.pending() {
            Ok(actions) => actions,
            Err(e) => {
                warn!("Could not read action queue: {e}");
                return summary;
            }
        };
        if actions.is_empty() {
            return summary;
        }
        info!("Draining {} queued action(s)", actions.len());

        for action in actions {
            summary.attempted += 1;
            match self.dispatch(&action).await {
                Ok(()) => {
                    self.queue.complete(&action.id);
                    summary.succeeded += 1;
                }
                Err(e) if e.is_auth() => {
                    self.note_auth_failure(&e);
                    summary.failed += 1;
                    warn!("Aborting drain, credentials rejected: {e}");
                    break;
                }
                Err(e) => {
                    let detail = e.to_string();
                    if action.retry_count >= MAX_ACTION_ATTEMPTS {
                        self.queue
                            .drop_exhausted(&action.id, &action.order_id, &detail);
                        summary.dropped += 1;
                    } else {
                        if let Err(db_err) = self.queue.record_failure(&action.id, &detail) {
                            warn!(
                                "Could not record failure for action {}: {db_err}",
                                action.id
                            );
                        }
                        summary.failed += 1;
                    }
                }
            }
        }

        info!(
            "Drain finished: {} ok, {} failed, {} dropped",
            summary.succeeded, summary.failed, summary.dropped
        );
        summary
    }

    async fn dispatch(&self, action: &PendingAction) -> ApiResult<()> {
        match action.kind {
            ActionKind::Acknowledge => {
                let at = action
                    .payload
                    .acknowledged_at
                    .or_else(|| self.board.overlay_get(&action.order_id));
                match self.api.acknowledge(&action.order_id, at).await {
                    Ok(mut updated) => {
                        if let Some(at) = self.board.overlay_get(&action.order_id) {
                            updated.acknowledged_at = Some(at);
                        }
                        self.board.merge_remote(updated);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            ActionKind::StatusUpdate => {
                let target = match action.payload.target_status {
                    Some(t) => t,
                    None => {
                        return Err(ApiError::Rejected(format!(
                            "Queued status update {} has no target status",
                            action.id
                        )))
                    }
                };
                // Payload first; the order may have gained its ticket number
                // in a snapshot since the action was queued
                let numeric_id = action
                    .payload
                    .numeric_id
                    .or_else(|| self.board.numeric_id_of(&action.order_id));
                let numeric_id = match numeric_id {
                    Some(n) => n,
                    None => {
                        return Err(ApiError::Rejected(format!(
                            "Order {} has no kitchen ticket number",
                            action.order_id
                        )))
                    }
                };
                self.api.update_status(numeric_id, target).await
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
