//! Snapshot reconciliation: folding server polls into the board.
//!
//! The server owns membership and status. The station owns acknowledgement
//! instants for orders still in the new-ish phase; those live in the
//! `ack_overlay` table and its in-memory mirror on [`OrderBoard`]. On every
//! poll the overlay replaces the server's `acknowledged_at` wholesale for
//! new-ish orders, so a confirmation tap never flickers back to unconfirmed
//! while the action queue catches up.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::db::DbState;
use crate::orders::{sort_newest_first, OrderSnapshot};
use crate::store::OrderBoard;

/// What a reconcile pass did, for logging and event payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileOutcome {
    /// Orders on the board after the merge.
    pub count: usize,
    /// Overlay entries dropped because their orders settled or vanished.
    pub pruned: usize,
    /// True when the selected order left the snapshot.
    pub selection_cleared: bool,
}

pub struct Reconciler {
    db: Arc<DbState>,
    board: Arc<OrderBoard>,
}

impl Reconciler {
    pub fn new(db: Arc<DbState>, board: Arc<OrderBoard>) -> Self {
        Self { db, board }
    }

    // -----------------------------------------------------------------------
    // Overlay persistence
    // -----------------------------------------------------------------------

    /// Load persisted overlay entries into the board. Acks recorded before
    /// this ran (first taps during startup) win over the loaded rows; once
    /// hydrated, later calls are no-ops.
    pub fn hydrate(&self) -> Result<usize, String> {
        if self.board.overlay_hydrated() {
            return Ok(0);
        }
        let persisted = self.load_overlay()?;
        let merged = self.board.hydrate_overlay(persisted);
        info!(entries = merged, "Ack overlay hydrated");
        Ok(merged)
    }

    fn load_overlay(&self) -> Result<HashMap<String, DateTime<Utc>>, String> {
        let conn = self.db.conn.lock().map_err(|e| e.to_string())?;
        let mut stmt = conn
            .prepare("SELECT order_id, acknowledged_at FROM ack_overlay")
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| e.to_string())?;

        let mut entries = HashMap::new();
        for row in rows {
            let (order_id, raw) = row.map_err(|e| e.to_string())?;
            match DateTime::parse_from_rfc3339(&raw) {
                Ok(at) => {
                    entries.insert(order_id, at.with_timezone(&Utc));
                }
                Err(e) => {
                    warn!(order_id, error = %e, "Skipping overlay row with bad timestamp");
                }
            }
        }
        Ok(entries)
    }

    /// Write-through for a locally recorded acknowledgement. The first write
    /// for an order wins so the original tap instant survives restarts.
    pub fn persist_ack(&self, order_id: &str, at: DateTime<Utc>) -> Result<(), String> {
        let conn = self.db.conn.lock().map_err(|e| e.to_string())?;
        conn.execute(
            "INSERT OR IGNORE INTO ack_overlay (order_id, acknowledged_at, created_at)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![order_id, at.to_rfc3339(), Utc::now().to_rfc3339()],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn delete_acks(&self, order_ids: &[String]) {
        let conn = match self.db.conn.lock() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Could not prune overlay rows");
                return;
            }
        };
        for order_id in order_ids {
            if let Err(e) = conn.execute("DELETE FROM ack_overlay WHERE order_id = ?1", [order_id])
            {
                warn!(order_id, error = %e, "Failed to delete overlay row");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Merge
    // -----------------------------------------------------------------------

    /// Fold a server snapshot into the board.
    ///
    /// Membership and status come from the server as-is. For new-ish orders
    /// the overlay replaces `acknowledged_at` wholesale; a missing entry
    /// clears it, so a stale server-side ack cannot resurrect a dismissed
    /// alert. Settled and vanished orders drop their overlay entries. Before
    /// [`Reconciler::hydrate`] has run, snapshots pass through verbatim so a
    /// slow disk never erases server acknowledgements.
    pub fn apply_snapshot(&self, snapshot: OrderSnapshot) -> ReconcileOutcome {
        let mut orders = snapshot.orders;
        let mut pruned = 0;

        if self.board.overlay_hydrated() {
            let newish: HashSet<String> = orders
                .iter()
                .filter(|o| o.status.is_newish())
                .map(|o| o.id.clone())
                .collect();

            let removed = self.board.overlay_prune(&newish);
            if !removed.is_empty() {
                debug!(count = removed.len(), "Pruned settled overlay entries");
                self.delete_acks(&removed);
                pruned = removed.len();
            }

            for order in orders.iter_mut() {
                if order.status.is_newish() {
                    order.acknowledged_at = self.board.overlay_get(&order.id);
                }
            }
        } else {
            debug!("Overlay not hydrated yet, passing snapshot through verbatim");
        }

        sort_newest_first(&mut orders);
        let count = orders.len();
        let selection_cleared = self.board.replace_all(orders);

        ReconcileOutcome {
            count,
            pruned,
            selection_cleared,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::orders::{Order, OrderStatus};
    use chrono::TimeZone;
    use rusqlite::Connection;

    fn test_state() -> (Reconciler, Arc<OrderBoard>, Arc<DbState>) {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        db::run_migrations_for_test(&conn);
        let db = Arc::new(DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        });
        let board = Arc::new(OrderBoard::new());
        (Reconciler::new(db.clone(), board.clone()), board, db)
    }

    fn order(id: &str, status: OrderStatus, created_min: u32) -> Order {
        Order {
            id: id.to_string(),
            numeric_id: None,
            status,
            created_at: Utc.with_ymd_and_hms(2025, 3, 1, 12, created_min, 0).unwrap(),
            acknowledged_at: None,
            total: 0.0,
            items: vec![],
            customer: None,
            notes: None,
        }
    }

    fn snapshot(orders: Vec<Order>) -> OrderSnapshot {
        OrderSnapshot {
            orders,
            server_time: Some(Utc::now()),
        }
    }

    fn at(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, min, 0).unwrap()
    }

    fn overlay_row_count(db: &DbState) -> i64 {
        let conn = db.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM ack_overlay", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_bootstrap_snapshot_passes_through_verbatim() {
        let (reconciler, board, _db) = test_state();
        let mut pending = order("ord-1", OrderStatus::Pending, 5);
        pending.acknowledged_at = Some(at(6));

        // No hydrate() yet: the server-reported ack must survive
        let outcome = reconciler.apply_snapshot(snapshot(vec![pending]));
        assert_eq!(outcome.count, 1);
        assert_eq!(outcome.pruned, 0);
        assert_eq!(board.get("ord-1").unwrap().acknowledged_at, Some(at(6)));
    }

    #[test]
    fn test_hydrate_loads_persisted_entries_once() {
        let (reconciler, board, db) = test_state();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO ack_overlay (order_id, acknowledged_at, created_at)
                 VALUES ('ord-1', '2025-03-01T12:06:00+00:00', '2025-03-01T12:06:00+00:00')",
                [],
            )
            .unwrap();
        }

        assert_eq!(reconciler.hydrate().unwrap(), 1);
        assert!(board.overlay_hydrated());
        assert_eq!(board.overlay_get("ord-1"), Some(at(6)));
        // Second call is a no-op
        assert_eq!(reconciler.hydrate().unwrap(), 0);
    }

    #[test]
    fn test_overlay_overrides_server_ack_for_newish() {
        let (reconciler, board, _db) = test_state();
        reconciler.hydrate().unwrap();
        board.overlay_insert("ord-1", at(6));

        let mut from_server = order("ord-1", OrderStatus::Confirmed, 5);
        from_server.acknowledged_at = Some(at(30));

        reconciler.apply_snapshot(snapshot(vec![from_server]));
        assert_eq!(board.get("ord-1").unwrap().acknowledged_at, Some(at(6)));
    }

    #[test]
    fn test_missing_overlay_entry_clears_server_ack() {
        let (reconciler, board, _db) = test_state();
        reconciler.hydrate().unwrap();

        let mut newish = order("ord-1", OrderStatus::Pending, 5);
        newish.acknowledged_at = Some(at(6));
        let mut settled = order("ord-2", OrderStatus::Completed, 4);
        settled.acknowledged_at = Some(at(7));

        reconciler.apply_snapshot(snapshot(vec![newish, settled]));
        // New-ish: the overlay is authoritative and has no entry
        assert_eq!(board.get("ord-1").unwrap().acknowledged_at, None);
        // Settled orders keep whatever the server said
        assert_eq!(board.get("ord-2").unwrap().acknowledged_at, Some(at(7)));
    }

    #[test]
    fn test_prune_drops_settled_and_vanished_entries() {
        let (reconciler, board, db) = test_state();
        reconciler.hydrate().unwrap();
        for id in ["ord-live", "ord-done", "ord-gone"] {
            board.overlay_insert(id, at(6));
            reconciler.persist_ack(id, at(6)).unwrap();
        }
        assert_eq!(overlay_row_count(&db), 3);

        let outcome = reconciler.apply_snapshot(snapshot(vec![
            order("ord-live", OrderStatus::Preparing, 5),
            order("ord-done", OrderStatus::Completed, 4),
        ]));

        assert_eq!(outcome.pruned, 2);
        assert!(board.overlay_contains("ord-live"));
        assert!(!board.overlay_contains("ord-done"));
        assert!(!board.overlay_contains("ord-gone"));
        assert_eq!(overlay_row_count(&db), 1);
    }

    #[test]
    fn test_snapshot_replaces_membership_and_clears_selection() {
        let (reconciler, board, _db) = test_state();
        reconciler.hydrate().unwrap();

        reconciler.apply_snapshot(snapshot(vec![
            order("ord-1", OrderStatus::Pending, 5),
            order("ord-2", OrderStatus::Ready, 4),
        ]));
        assert!(board.select("ord-2"));

        let outcome = reconciler.apply_snapshot(snapshot(vec![order(
            "ord-1",
            OrderStatus::Preparing,
            5,
        )]));
        assert_eq!(outcome.count, 1);
        assert!(outcome.selection_cleared);
        assert!(board.selected().is_none());
        assert!(board.get("ord-2").is_none());
    }

    #[test]
    fn test_snapshot_sorted_newest_first() {
        let (reconciler, board, _db) = test_state();
        reconciler.hydrate().unwrap();

        reconciler.apply_snapshot(snapshot(vec![
            order("old", OrderStatus::Pending, 1),
            order("newest", OrderStatus::Pending, 30),
            order("middle", OrderStatus::Ready, 15),
        ]));
        let ids: Vec<String> = board.orders().into_iter().map(|o| o.id).collect();
        assert_eq!(ids, vec!["newest", "middle", "old"]);
    }

    #[test]
    fn test_persist_ack_first_write_wins() {
        let (reconciler, _board, db) = test_state();
        reconciler.persist_ack("ord-1", at(6)).unwrap();
        reconciler.persist_ack("ord-1", at(20)).unwrap();

        let conn = db.conn.lock().unwrap();
        let stored: String = conn
            .query_row(
                "SELECT acknowledged_at FROM ack_overlay WHERE order_id = 'ord-1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        let parsed = DateTime::parse_from_rfc3339(&stored).unwrap().with_timezone(&Utc);
        assert_eq!(parsed, at(6));
    }
}
