//! Engine loops: snapshot refresh, connectivity probing, de-authorization.
//!
//! Two timers drive the station. The refresh loop polls the server for a
//! full order snapshot and reconciles it into the board; it skips fetching
//! while the gate reports offline, keeping the last good board on screen.
//! The probe loop pings the health endpoint regardless of gate state (it is
//! the only thing that can flip the gate back online) and reacts to an
//! offline-to-online edge by draining the action queue and refreshing
//! immediately.
//!
//! A typed auth rejection from any call ends the session: local state is
//! purged, credentials are dropped, and both loops stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::actions::MutationExecutor;
use crate::api::{ApiError, OrderApi};
use crate::connectivity::{ConnectivityGate, Transition};
use crate::db::{self, DbState};
use crate::events::{EventBus, UiEvent};
use crate::print::PrintLedger;
use crate::queue::ActionQueue;
use crate::reconcile::Reconciler;
use crate::storage;
use crate::store::OrderBoard;

pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_PROBE_INTERVAL_SECS: u64 = 10;

// ---------------------------------------------------------------------------
// Engine state
// ---------------------------------------------------------------------------

/// Shared run flag and refresh bookkeeping for the background loops.
pub struct SyncState {
    pub is_running: Arc<AtomicBool>,
    pub last_refresh: Arc<Mutex<Option<String>>>,
}

impl SyncState {
    pub fn new() -> Self {
        SyncState {
            is_running: Arc::new(AtomicBool::new(false)),
            last_refresh: Arc::new(Mutex::new(None)),
        }
    }

    pub fn stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);
    }
}

impl Default for SyncState {
    fn default() -> Self {
        SyncState::new()
    }
}

/// Everything the loops need, wired once at startup.
pub struct EngineCtx {
    pub db: Arc<DbState>,
    pub board: Arc<OrderBoard>,
    pub queue: Arc<ActionQueue>,
    pub ledger: Arc<PrintLedger>,
    pub reconciler: Arc<Reconciler>,
    pub gate: Arc<ConnectivityGate>,
    pub api: Arc<dyn OrderApi>,
    pub executor: Arc<MutationExecutor>,
    pub bus: EventBus,
    pub state: Arc<SyncState>,
}

/// Wire the full engine around an already opened database and API client.
pub fn build_engine(
    db: Arc<DbState>,
    api: Arc<dyn OrderApi>,
    bus: EventBus,
) -> Result<Arc<EngineCtx>, String> {
    let board = Arc::new(OrderBoard::new());
    let queue = Arc::new(ActionQueue::new(db.clone()));
    let ledger = Arc::new(PrintLedger::load(db.clone())?);
    let reconciler = Arc::new(Reconciler::new(db.clone(), board.clone()));
    let gate = Arc::new(ConnectivityGate::new());
    let executor = Arc::new(MutationExecutor::new(
        board.clone(),
        queue.clone(),
        reconciler.clone(),
        api.clone(),
        gate.clone(),
        bus.clone(),
    ));

    Ok(Arc::new(EngineCtx {
        db,
        board,
        queue,
        ledger,
        reconciler,
        gate,
        api,
        executor,
        bus,
        state: Arc::new(SyncState::new()),
    }))
}

// ---------------------------------------------------------------------------
// Refresh cycle
// ---------------------------------------------------------------------------

/// One fetch-reconcile-notify pass. Returns the resulting board size.
///
/// Auth rejections bubble up typed so the caller can end the session; any
/// other error leaves the previous board contents on screen.
pub async fn run_refresh_cycle(ctx: &EngineCtx) -> Result<usize, ApiError> {
    // Hydrate lazily; reconcile passes snapshots through until this succeeds
    if !ctx.board.overlay_hydrated() {
        if let Err(e) = ctx.reconciler.hydrate() {
            warn!("Overlay hydration failed, continuing un-hydrated: {e}");
        }
    }

    let snapshot = ctx.api.fetch_snapshot().await?;
    let outcome = ctx.reconciler.apply_snapshot(snapshot);
    if outcome.selection_cleared {
        debug!("Selected order left the snapshot");
    }

    let unhandled = ctx.ledger.classify_unhandled(&ctx.board.orders());
    ctx.bus.emit(UiEvent::OrdersRefreshed {
        count: outcome.count,
    });
    if !unhandled.is_empty() {
        info!("{} order(s) awaiting auto-print", unhandled.len());
        ctx.bus.emit(UiEvent::AutoPrintRequested {
            order_ids: unhandled,
        });
    }

    let stamp = Utc::now().to_rfc3339();
    if let Ok(mut guard) = ctx.state.last_refresh.lock() {
        *guard = Some(stamp.clone());
    }
    if let Ok(conn) = ctx.db.conn.lock() {
        if let Err(e) = db::set_setting(&conn, "engine", "last_refresh_at", &stamp) {
            debug!("Could not persist refresh stamp: {e}");
        }
    }

    Ok(outcome.count)
}

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

/// Start the snapshot refresh loop. Spawns a tokio task that polls every
/// `interval_secs` seconds while the gate reports online.
pub fn start_refresh_loop(ctx: Arc<EngineCtx>, interval_secs: u64) {
    let is_running = ctx.state.is_running.clone();
    is_running.store(true, Ordering::SeqCst);

    tokio::spawn(async move {
        info!("Refresh loop started (interval: {interval_secs}s)");
        loop {
            if !is_running.load(Ordering::SeqCst) {
                info!("Refresh loop stopped");
                break;
            }

            tokio::time::sleep(Duration::from_secs(interval_secs)).await;

            if !is_running.load(Ordering::SeqCst) {
                break;
            }
            if !storage::is_configured() {
                debug!("Station not paired yet, skipping refresh");
                continue;
            }
            if !ctx.gate.is_online() {
                debug!("Offline, keeping last board and skipping fetch");
                continue;
            }

            match run_refresh_cycle(&ctx).await {
                Ok(count) => debug!("Refresh cycle complete: {count} orders"),
                Err(e) if e.is_auth() => {
                    deauthorize(&ctx, &e.to_string());
                    break;
                }
                Err(e) => warn!("Refresh cycle failed, keeping last board: {e}"),
            }

            // Mutations noticed a dead key before we did
            if let Some(reason) = ctx.executor.take_auth_failure() {
                deauthorize(&ctx, &reason);
                break;
            }
        }
    });
}

/// Start the connectivity probe loop. Unlike the refresh loop this always
/// probes, including while offline; it is what brings the gate back up.
pub fn start_probe_loop(ctx: Arc<EngineCtx>, interval_secs: u64) {
    let is_running = ctx.state.is_running.clone();
    is_running.store(true, Ordering::SeqCst);

    tokio::spawn(async move {
        info!("Probe loop started (interval: {interval_secs}s)");
        loop {
            if !is_running.load(Ordering::SeqCst) {
                info!("Probe loop stopped");
                break;
            }

            tokio::time::sleep(Duration::from_secs(interval_secs)).await;

            if !is_running.load(Ordering::SeqCst) {
                break;
            }

            let online = ctx.api.probe().await;
            match ctx.gate.observe(online) {
                Some(Transition::CameOnline) => {
                    ctx.bus.emit(UiEvent::NetworkStatus { online: true });

                    let summary = ctx.executor.drain().await;
                    if summary.attempted > 0 {
                        info!(
                            "Post-recovery drain: {} ok, {} failed, {} dropped",
                            summary.succeeded, summary.failed, summary.dropped
                        );
                    }
                    if let Some(reason) = ctx.executor.take_auth_failure() {
                        deauthorize(&ctx, &reason);
                        break;
                    }

                    // Fresh snapshot right away instead of waiting a tick
                    if storage::is_configured() {
                        match run_refresh_cycle(&ctx).await {
                            Ok(_) => {}
                            Err(e) if e.is_auth() => {
                                deauthorize(&ctx, &e.to_string());
                                break;
                            }
                            Err(e) => warn!("Post-recovery refresh failed: {e}"),
                        }
                    }
                }
                Some(Transition::WentOffline) => {
                    ctx.bus.emit(UiEvent::NetworkStatus { online: false });
                }
                None => {}
            }
        }
    });
}

// ---------------------------------------------------------------------------
// De-authorization
// ---------------------------------------------------------------------------

/// Drop every locally persisted trace of the session: queued actions, the
/// ack overlay, the print ledger, settings, and the in-memory board.
fn purge_local_state(ctx: &EngineCtx) {
    if let Ok(conn) = ctx.db.conn.lock() {
        let _ = conn.execute_batch(
            "BEGIN IMMEDIATE;
             DELETE FROM action_queue;
             DELETE FROM ack_overlay;
             DELETE FROM local_settings;
             COMMIT;",
        );
    }
    if let Err(e) = ctx.ledger.clear() {
        warn!("Could not clear print ledger: {e}");
    }
    ctx.board.reset();
    if let Ok(mut guard) = ctx.state.last_refresh.lock() {
        *guard = None;
    }
}

/// Handle a rejected station key: wipe local state and credentials, tell
/// the display, and stop both loops. The station is back to unpaired.
pub fn deauthorize(ctx: &EngineCtx, reason: &str) {
    warn!("Station de-authorized ({reason}), wiping local state");

    purge_local_state(ctx);
    let _ = storage::factory_reset();

    ctx.bus.emit(UiEvent::SessionRevoked {
        reason: reason.to_string(),
    });
    ctx.state.stop();
}

// ---------------------------------------------------------------------------
// Status surface
// ---------------------------------------------------------------------------

/// Snapshot of engine health for the display's status strip.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub online: bool,
    pub pending_actions: i64,
    pub last_refresh_at: Option<String>,
    pub overlay_hydrated: bool,
}

pub fn sync_status(ctx: &EngineCtx) -> SyncStatus {
    SyncStatus {
        online: ctx.gate.is_online(),
        pending_actions: ctx.queue.pending_count(),
        last_refresh_at: ctx.state.last_refresh.lock().ok().and_then(|g| g.clone()),
        overlay_hydrated: ctx.board.overlay_hydrated(),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
