//! Durable action queue.
//!
//! Mutations made while offline (and mutations whose delivery has not been
//! confirmed) land here, in the `action_queue` table, and are replayed FIFO
//! by the executor's drain. Rows survive restarts; SQLite is the source of
//! truth for work the server has not confirmed.
//!
//! Actions are never coalesced. Two status updates for the same order stay
//! two rows and replay in insertion order, so the server sees the same
//! sequence the kitchen produced.

use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::orders::OrderStatus;

/// Retry ceiling. A failure landing on a row whose retry count already
/// reached this drops the row instead of queueing another attempt.
pub const MAX_ACTION_ATTEMPTS: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Acknowledge,
    StatusUpdate,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Acknowledge => "acknowledge",
            ActionKind::StatusUpdate => "status_update",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value {
            "acknowledge" => Ok(ActionKind::Acknowledge),
            "status_update" => Ok(ActionKind::StatusUpdate),
            other => Err(format!("Unknown action kind '{other}'")),
        }
    }
}

/// Everything the drain needs to replay an action without the original
/// call context. The numeric id is resolved at enqueue time because the
/// order may have left the board by the time the queue drains.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActionPayload {
    pub acknowledged_at: Option<chrono::DateTime<Utc>>,
    pub target_status: Option<OrderStatus>,
    pub numeric_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct PendingAction {
    pub id: String,
    pub kind: ActionKind,
    pub order_id: String,
    pub payload: ActionPayload,
    pub retry_count: i64,
    pub created_at: String,
}

pub struct ActionQueue {
    db: Arc<DbState>,
}

impl ActionQueue {
    pub fn new(db: Arc<DbState>) -> Self {
        ActionQueue { db }
    }

    /// Append an action. Infallible from the caller's point of view: the
    /// optimistic in-memory apply already happened, so a persistence error
    /// is logged here rather than unwinding the mutation.
    pub fn enqueue(&self, kind: ActionKind, order_id: &str, payload: &ActionPayload) -> String {
        let id = Uuid::new_v4().to_string();
        let payload_json = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
        let created_at = Utc::now().to_rfc3339();

        match self.db.conn.lock() {
            Ok(conn) => {
                let result = conn.execute(
                    "INSERT INTO action_queue (id, kind, order_id, payload, retry_count, created_at)
                     VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                    params![id, kind.as_str(), order_id, payload_json, created_at],
                );
                match result {
                    Ok(_) => info!("Queued {} for order {order_id}", kind.as_str()),
                    Err(e) => error!("Failed to persist queued {} for order {order_id}: {e}", kind.as_str()),
                }
            }
            Err(e) => error!("Action queue lock poisoned: {e}"),
        }

        id
    }

    /// All pending actions, oldest first.
    pub fn pending(&self) -> Result<Vec<PendingAction>, String> {
        let conn = self.db.conn.lock().map_err(|e| e.to_string())?;
        let mut stmt = conn
            .prepare(
                "SELECT id, kind, order_id, payload, retry_count, created_at
                 FROM action_queue
                 ORDER BY created_at ASC, rowid ASC",
            )
            .map_err(|e| format!("pending prepare: {e}"))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(|e| format!("pending query: {e}"))?;

        let mut actions = Vec::new();
        for row in rows {
            let (id, kind_raw, order_id, payload_raw, retry_count, created_at) =
                row.map_err(|e| format!("pending row: {e}"))?;
            let kind = match ActionKind::parse(&kind_raw) {
                Ok(k) => k,
                Err(e) => {
                    // CHECK constraint makes this unreachable short of manual edits
                    warn!("Skipping queued action {id}: {e}");
                    continue;
                }
            };
            let payload: ActionPayload = serde_json::from_str(&payload_raw).unwrap_or_else(|e| {
                warn!("Queued action {id} has malformed payload ({e}), using empty payload");
                ActionPayload::default()
            });
            actions.push(PendingAction {
                id,
                kind,
                order_id,
                payload,
                retry_count,
                created_at,
            });
        }
        Ok(actions)
    }

    pub fn pending_count(&self) -> i64 {
        if let Ok(conn) = self.db.conn.lock() {
            conn.query_row("SELECT COUNT(*) FROM action_queue", [], |row| row.get(0))
                .unwrap_or(0)
        } else {
            0
        }
    }

    /// Remove an action after the server confirmed it.
    pub fn complete(&self, action_id: &str) {
        if let Ok(conn) = self.db.conn.lock() {
            match conn.execute("DELETE FROM action_queue WHERE id = ?1", params![action_id]) {
                Ok(_) => debug!("Completed queued action {action_id}"),
                Err(e) => error!("Failed to remove completed action {action_id}: {e}"),
            }
        }
    }

    /// Record a failed attempt: bump retry_count and remember the error.
    pub fn record_failure(&self, action_id: &str, error_detail: &str) -> Result<(), String> {
        let conn = self.db.conn.lock().map_err(|e| e.to_string())?;
        conn.execute(
            "UPDATE action_queue SET retry_count = retry_count + 1, last_error = ?2 WHERE id = ?1",
            params![action_id, error_detail],
        )
        .map_err(|e| format!("record_failure: {e}"))?;
        Ok(())
    }

    /// Remove an action whose attempts are exhausted. The mutation is lost;
    /// the next snapshot will show whatever the server actually has.
    pub fn drop_exhausted(&self, action_id: &str, order_id: &str, error_detail: &str) {
        if let Ok(conn) = self.db.conn.lock() {
            match conn.execute("DELETE FROM action_queue WHERE id = ?1", params![action_id]) {
                Ok(_) => warn!(
                    "Dropping action {action_id} for order {order_id}: retry ceiling ({MAX_ACTION_ATTEMPTS}) reached (last error: {error_detail})"
                ),
                Err(e) => error!("Failed to drop exhausted action {action_id}: {e}"),
            }
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
    use rusqlite::Connection;

    fn test_queue() -> ActionQueue {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        db::run_migrations_for_test(&conn);
        ActionQueue::new(Arc::new(DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        }))
    }

    fn ack_payload() -> ActionPayload {
        ActionPayload {
            acknowledged_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    fn status_payload(status: OrderStatus, numeric_id: Option<i64>) -> ActionPayload {
        ActionPayload {
            target_status: Some(status),
            numeric_id,
            ..Default::default()
        }
    }

    #[test]
    fn test_enqueue_preserves_fifo_order() {
        let queue = test_queue();
        // Same-second inserts; rowid breaks the created_at tie
        let first = queue.enqueue(ActionKind::Acknowledge, "ord-1", &ack_payload());
        let second = queue.enqueue(
            ActionKind::StatusUpdate,
            "ord-1",
            &status_payload(OrderStatus::Preparing, Some(42)),
        );
        let third = queue.enqueue(
            ActionKind::StatusUpdate,
            "ord-2",
            &status_payload(OrderStatus::Ready, None),
        );

        let pending = queue.pending().expect("pending");
        let ids: Vec<&str> = pending.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec![first.as_str(), second.as_str(), third.as_str()]);
        assert_eq!(queue.pending_count(), 3);
    }

    #[test]
    fn test_same_order_actions_are_not_coalesced() {
        let queue = test_queue();
        queue.enqueue(
            ActionKind::StatusUpdate,
            "ord-1",
            &status_payload(OrderStatus::Preparing, Some(7)),
        );
        queue.enqueue(
            ActionKind::StatusUpdate,
            "ord-1",
            &status_payload(OrderStatus::Ready, Some(7)),
        );

        let pending = queue.pending().expect("pending");
        assert_eq!(pending.len(), 2, "both transitions must replay");
        assert_eq!(
            pending[0].payload.target_status,
            Some(OrderStatus::Preparing)
        );
        assert_eq!(pending[1].payload.target_status, Some(OrderStatus::Ready));
    }

    #[test]
    fn test_payload_survives_the_table() {
        let queue = test_queue();
        queue.enqueue(
            ActionKind::StatusUpdate,
            "ord-1",
            &status_payload(OrderStatus::Ready, Some(4211)),
        );

        let pending = queue.pending().expect("pending");
        assert_eq!(pending.len(), 1);
        let action = &pending[0];
        assert_eq!(action.kind, ActionKind::StatusUpdate);
        assert_eq!(action.order_id, "ord-1");
        assert_eq!(action.payload.target_status, Some(OrderStatus::Ready));
        assert_eq!(action.payload.numeric_id, Some(4211));
        assert!(action.payload.acknowledged_at.is_none());
        assert_eq!(action.retry_count, 0);
    }

    #[test]
    fn test_complete_removes_the_row() {
        let queue = test_queue();
        let id = queue.enqueue(ActionKind::Acknowledge, "ord-1", &ack_payload());
        assert_eq!(queue.pending_count(), 1);

        queue.complete(&id);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn test_record_failure_increments_in_place() {
        let queue = test_queue();
        let id = queue.enqueue(ActionKind::Acknowledge, "ord-1", &ack_payload());

        queue.record_failure(&id, "HTTP 503").expect("first failure");
        queue
            .record_failure(&id, "HTTP 504")
            .expect("second failure");

        let pending = queue.pending().expect("pending");
        assert_eq!(pending.len(), 1, "failed action stays queued");
        assert_eq!(pending[0].retry_count, 2);

        let last_error: Option<String> = {
            let conn = queue.db.conn.lock().unwrap();
            conn.query_row(
                "SELECT last_error FROM action_queue WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .unwrap()
        };
        assert_eq!(last_error.as_deref(), Some("HTTP 504"));
    }

    #[test]
    fn test_drop_exhausted_removes_the_row() {
        let queue = test_queue();
        let id = queue.enqueue(ActionKind::Acknowledge, "ord-1", &ack_payload());
        for _ in 0..MAX_ACTION_ATTEMPTS {
            queue.record_failure(&id, "connection refused").expect("failure");
        }

        queue.drop_exhausted(&id, "ord-1", "connection refused");
        assert_eq!(queue.pending_count(), 0);
    }
}
