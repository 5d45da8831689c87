//! Headless runner for the Prepboard KDS engine.
//!
//! Resolves station credentials (environment overrides first, then the OS
//! keyring), opens the local database, wires the engine, and runs the
//! background loops until Ctrl-C. Engine events are logged; a display
//! front-end would subscribe to the same bus instead.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use prepboard::{db, storage, sync, EventBus, HttpOrderApi, UiEvent};

#[tokio::main]
async fn main() -> Result<()> {
    let data_dir = PathBuf::from(
        std::env::var("PREPBOARD_DATA_DIR").unwrap_or_else(|_| "/var/lib/prepboard".to_string()),
    );
    prepboard::init_logging(&data_dir.join("logs"));

    if !storage::is_configured() {
        anyhow::bail!(
            "station is not paired: set PREPBOARD_SERVER_URL, PREPBOARD_API_KEY and \
             PREPBOARD_STATION_ID, or store credentials through the pairing flow"
        );
    }
    let server_url = storage::resolve_credential(storage::KEY_SERVER_URL)
        .context("server URL missing from credential store")?;
    let api_key = storage::resolve_credential(storage::KEY_API_KEY)
        .context("API key missing from credential store")?;
    let station_id = storage::resolve_credential(storage::KEY_STATION_ID)
        .context("station id missing from credential store")?;

    let db = Arc::new(db::init(&data_dir).map_err(anyhow::Error::msg)?);
    let api = Arc::new(
        HttpOrderApi::new(&server_url, &api_key, &station_id).map_err(anyhow::Error::msg)?,
    );
    let bus = EventBus::default();
    let ctx = sync::build_engine(db, api, bus.clone()).map_err(anyhow::Error::msg)?;

    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(UiEvent::SessionRevoked { reason }) => {
                    error!("Session revoked: {reason}");
                }
                Ok(event) => info!("Engine event: {event:?}"),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event subscriber lagged, skipped {skipped} event(s)");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    sync::start_probe_loop(ctx.clone(), sync::DEFAULT_PROBE_INTERVAL_SECS);
    sync::start_refresh_loop(ctx.clone(), sync::DEFAULT_REFRESH_INTERVAL_SECS);
    info!("Engine running for station {station_id}");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutting down");
    ctx.state.stop();

    Ok(())
}
