//! Prepboard KDS - offline-tolerant kitchen order display core.
//!
//! The station polls an admin dashboard for order snapshots, lets the
//! kitchen acknowledge orders and move them through their lifecycle, and
//! keeps working when the link drops: mutations apply optimistically to the
//! in-memory board and replay from a durable queue once connectivity
//! returns. The display layer consumes [`events::UiEvent`]s and never talks
//! to the server directly.

use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod actions;
pub mod api;
pub mod connectivity;
pub mod db;
pub mod events;
pub mod orders;
pub mod print;
pub mod queue;
pub mod reconcile;
pub mod storage;
pub mod store;
pub mod sync;

pub use actions::{DrainSummary, MutationExecutor};
pub use api::{ApiError, ApiResult, HttpOrderApi, OrderApi};
pub use connectivity::{ConnectivityGate, Transition};
pub use events::{EventBus, UiEvent};
pub use orders::{Order, OrderSnapshot, OrderStatus};
pub use print::PrintLedger;
pub use queue::{ActionKind, ActionQueue};
pub use reconcile::{ReconcileOutcome, Reconciler};
pub use store::OrderBoard;
pub use sync::{EngineCtx, SyncState, SyncStatus};

/// Initialize structured logging: console plus a daily-rolling file under
/// `log_dir`. Call once, before anything else logs.
pub fn init_logging(log_dir: &std::path::Path) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,prepboard=debug"));

    std::fs::create_dir_all(log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, "prepboard");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    // Keep the guard alive for the lifetime of the process; dropping it
    // would flush and close the file writer.
    std::mem::forget(guard);

    info!("Prepboard KDS v{}", env!("CARGO_PKG_VERSION"));
}
