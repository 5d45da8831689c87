//! Auto-print dedup ledger.
//!
//! The kitchen printer fires once per order, ever. This ledger remembers
//! which orders were auto-printed (or had their print attempt fail) in the
//! `print_ledger` table, so a restart or an app upgrade never reprints a
//! ticket that is already hanging on the rail.
//!
//! Both sets are loaded once at startup and kept in memory; every mutation
//! writes through to SQLite. The actual printing lives outside the engine;
//! whoever does it reports the outcome back via [`PrintLedger::mark_printed`]
//! or [`PrintLedger::mark_failed`].

use chrono::Utc;
use rusqlite::params;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::db::DbState;
use crate::orders::{Order, OrderStatus};

pub struct PrintLedger {
    db: Arc<DbState>,
    printed: Mutex<HashSet<String>>,
    failed: Mutex<HashSet<String>>,
}

impl PrintLedger {
    /// Load both sets from the `print_ledger` table.
    pub fn load(db: Arc<DbState>) -> Result<Self, String> {
        let (printed, failed) = {
            let conn = db.conn.lock().map_err(|e| e.to_string())?;
            let mut stmt = conn
                .prepare("SELECT order_id, state FROM print_ledger")
                .map_err(|e| format!("print ledger prepare: {e}"))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(|e| format!("print ledger query: {e}"))?;

            let mut printed = HashSet::new();
            let mut failed = HashSet::new();
            for row in rows {
                let (order_id, state) = row.map_err(|e| format!("print ledger row: {e}"))?;
                match state.as_str() {
                    "printed" => {
                        printed.insert(order_id);
                    }
                    "failed" => {
                        failed.insert(order_id);
                    }
                    other => warn!("Ignoring print ledger row {order_id} with state '{other}'"),
                }
            }
            (printed, failed)
        };

        info!(
            printed = printed.len(),
            failed = failed.len(),
            "Print ledger loaded"
        );

        Ok(PrintLedger {
            db,
            printed: Mutex::new(printed),
            failed: Mutex::new(failed),
        })
    }

    pub fn is_printed(&self, order_id: &str) -> bool {
        self.printed.lock().unwrap().contains(order_id)
    }

    pub fn is_failed(&self, order_id: &str) -> bool {
        self.failed.lock().unwrap().contains(order_id)
    }

    /// Printed or failed: either way, auto-print must not fire again.
    pub fn is_handled(&self, order_id: &str) -> bool {
        self.is_printed(order_id) || self.is_failed(order_id)
    }

    pub fn printed_count(&self) -> usize {
        self.printed.lock().unwrap().len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.lock().unwrap().len()
    }

    /// Record a successful print. Clears any earlier failure for the order;
    /// once printed, an order never leaves the printed set.
    pub fn mark_printed(&self, order_id: &str) -> Result<(), String> {
        {
            self.failed.lock().unwrap().remove(order_id);
            self.printed.lock().unwrap().insert(order_id.to_string());
        }
        let conn = self.db.conn.lock().map_err(|e| e.to_string())?;
        conn.execute(
            "INSERT INTO print_ledger (order_id, state, updated_at)
             VALUES (?1, 'printed', ?2)
             ON CONFLICT(order_id) DO UPDATE SET
                state = 'printed',
                updated_at = excluded.updated_at",
            params![order_id, Utc::now().to_rfc3339()],
        )
        .map_err(|e| format!("mark_printed: {e}"))?;
        Ok(())
    }

    /// Record a failed print attempt. A failed order is still "handled":
    /// retries are a manual reprint decision, not an auto-print loop.
    pub fn mark_failed(&self, order_id: &str) -> Result<(), String> {
        if self.is_printed(order_id) {
            // A reprint failing must not demote a ticket that already printed
            debug!("Ignoring print failure for already-printed order {order_id}");
            return Ok(());
        }
        self.failed.lock().unwrap().insert(order_id.to_string());
        let conn = self.db.conn.lock().map_err(|e| e.to_string())?;
        conn.execute(
            "INSERT INTO print_ledger (order_id, state, updated_at)
             VALUES (?1, 'failed', ?2)
             ON CONFLICT(order_id) DO UPDATE SET
                state = 'failed',
                updated_at = excluded.updated_at",
            params![order_id, Utc::now().to_rfc3339()],
        )
        .map_err(|e| format!("mark_failed: {e}"))?;
        Ok(())
    }

    /// Ids of pending orders neither printed nor failed, in the order
    /// given. These are the tickets auto-print should fire for.
    pub fn classify_unhandled(&self, orders: &[Order]) -> Vec<String> {
        let printed = self.printed.lock().unwrap();
        let failed = self.failed.lock().unwrap();
        orders
            .iter()
            .filter(|o| {
                o.status == OrderStatus::Pending
                    && !printed.contains(&o.id)
                    && !failed.contains(&o.id)
            })
            .map(|o| o.id.clone())
            .collect()
    }

    /// Wipe both sets, memory and table. De-authentication path.
    pub fn clear(&self) -> Result<(), String> {
        self.printed.lock().unwrap().clear();
        self.failed.lock().unwrap().clear();
        let conn = self.db.conn.lock().map_err(|e| e.to_string())?;
        conn.execute("DELETE FROM print_ledger", [])
            .map_err(|e| format!("print ledger clear: {e}"))?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
