//! In-memory board state.
//!
//! `OrderBoard` is the one owned state object the whole engine works
//! against: the reconciled order list, the selected-order mirror the detail
//! pane reads, and the acknowledgement overlay. Every component receives a
//! handle at construction; nothing reaches for globals.
//!
//! Mutations swap whole values under short-lived locks, so readers observe
//! either the previous or the next state, never a torn one. The list and
//! the selected mirror live under a single mutex because they must move
//! together: a replace that dropped the selected order but left the mirror
//! pointing at it would strand the detail pane on a ghost.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::debug;

use crate::orders::{sort_newest_first, Order, OrderStatus};

struct BoardInner {
    orders: Vec<Order>,
    selected: Option<Order>,
}

struct AckOverlay {
    entries: HashMap<String, DateTime<Utc>>,
    /// False until the persisted overlay has been loaded. Reconcile passes
    /// that run before hydration must not prune or override anything.
    hydrated: bool,
}

pub struct OrderBoard {
    inner: Mutex<BoardInner>,
    overlay: Mutex<AckOverlay>,
}

impl OrderBoard {
    pub fn new() -> Self {
        OrderBoard {
            inner: Mutex::new(BoardInner {
                orders: Vec::new(),
                selected: None,
            }),
            overlay: Mutex::new(AckOverlay {
                entries: HashMap::new(),
                hydrated: false,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Order list + selection
    // ------------------------------------------------------------------

    pub fn orders(&self) -> Vec<Order> {
        self.inner.lock().unwrap().orders.clone()
    }

    pub fn order_count(&self) -> usize {
        self.inner.lock().unwrap().orders.len()
    }

    pub fn get(&self, order_id: &str) -> Option<Order> {
        let inner = self.inner.lock().unwrap();
        inner.orders.iter().find(|o| o.id == order_id).cloned()
    }

    /// Legacy kitchen-ticket number for an order, if the board knows one.
    pub fn numeric_id_of(&self, order_id: &str) -> Option<i64> {
        let inner = self.inner.lock().unwrap();
        inner
            .orders
            .iter()
            .find(|o| o.id == order_id)
            .and_then(|o| o.numeric_id)
    }

    pub fn selected(&self) -> Option<Order> {
        self.inner.lock().unwrap().selected.clone()
    }

    /// Point the detail mirror at an order from the current list.
    pub fn select(&self, order_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.orders.iter().find(|o| o.id == order_id).cloned() {
            Some(order) => {
                inner.selected = Some(order);
                true
            }
            None => false,
        }
    }

    pub fn clear_selection(&self) {
        self.inner.lock().unwrap().selected = None;
    }

    /// Replace the whole list (already reconciled and sorted by the caller).
    ///
    /// The selected mirror is refreshed from the new list, or cleared when
    /// its order is gone. Returns true if the selection was cleared.
    pub fn replace_all(&self, orders: Vec<Order>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let mut selection_cleared = false;
        if let Some(selected) = inner.selected.as_ref() {
            let refreshed = orders.iter().find(|o| o.id == selected.id).cloned();
            if refreshed.is_none() {
                debug!(
                    "Selected order {} left the snapshot, clearing selection",
                    selected.id
                );
                selection_cleared = true;
            }
            inner.selected = refreshed;
        }
        inner.orders = orders;
        selection_cleared
    }

    /// Set an order's status, returning the previous status. `None` means
    /// the order is not on the board and nothing changed.
    pub fn set_status(&self, order_id: &str, status: OrderStatus) -> Option<OrderStatus> {
        let mut inner = self.inner.lock().unwrap();
        let previous = match inner.orders.iter_mut().find(|o| o.id == order_id) {
            Some(order) => {
                let prev = order.status;
                order.status = status;
                prev
            }
            None => return None,
        };
        if let Some(selected) = inner.selected.as_mut() {
            if selected.id == order_id {
                selected.status = status;
            }
        }
        Some(previous)
    }

    /// Stamp (or clear) the acknowledgement instant on the board copies.
    pub fn set_acknowledged(&self, order_id: &str, at: Option<DateTime<Utc>>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let mut found = false;
        if let Some(order) = inner.orders.iter_mut().find(|o| o.id == order_id) {
            order.acknowledged_at = at;
            found = true;
        }
        if let Some(selected) = inner.selected.as_mut() {
            if selected.id == order_id {
                selected.acknowledged_at = at;
            }
        }
        found
    }

    /// Fold a server-returned order into the list and mirror, keeping its
    /// position. Unknown ids are ignored; membership only changes through
    /// [`OrderBoard::replace_all`].
    pub fn merge_remote(&self, updated: Order) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(order) = inner.orders.iter_mut().find(|o| o.id == updated.id) {
            *order = updated.clone();
        }
        if let Some(selected) = inner.selected.as_mut() {
            if selected.id == updated.id {
                *selected = updated;
            }
        }
    }

    /// Re-sort the list in place (newest first).
    pub fn resort(&self) {
        let mut inner = self.inner.lock().unwrap();
        sort_newest_first(&mut inner.orders);
        // selected mirror is a copy; ordering does not affect it
    }

    // ------------------------------------------------------------------
    // Acknowledgement overlay
    // ------------------------------------------------------------------

    pub fn overlay_hydrated(&self) -> bool {
        self.overlay.lock().unwrap().hydrated
    }

    /// Load persisted acknowledgements. Entries recorded in memory before
    /// hydration win over their persisted copies (they are newer). Only the
    /// first call does anything.
    pub fn hydrate_overlay(&self, persisted: HashMap<String, DateTime<Utc>>) -> usize {
        let mut overlay = self.overlay.lock().unwrap();
        if overlay.hydrated {
            debug!("Overlay already hydrated, ignoring repeat load");
            return 0;
        }
        let mut loaded = 0;
        for (order_id, at) in persisted {
            if !overlay.entries.contains_key(&order_id) {
                overlay.entries.insert(order_id, at);
                loaded += 1;
            }
        }
        overlay.hydrated = true;
        loaded
    }

    pub fn overlay_get(&self, order_id: &str) -> Option<DateTime<Utc>> {
        self.overlay.lock().unwrap().entries.get(order_id).copied()
    }

    pub fn overlay_contains(&self, order_id: &str) -> bool {
        self.overlay.lock().unwrap().entries.contains_key(order_id)
    }

    pub fn overlay_len(&self) -> usize {
        self.overlay.lock().unwrap().entries.len()
    }

    /// Record an acknowledgement instant. Returns false (and keeps the
    /// existing instant) when one is already recorded; the first tap wins.
    pub fn overlay_insert(&self, order_id: &str, at: DateTime<Utc>) -> bool {
        let mut overlay = self.overlay.lock().unwrap();
        if overlay.entries.contains_key(order_id) {
            return false;
        }
        overlay.entries.insert(order_id.to_string(), at);
        true
    }

    /// Drop every overlay entry whose order id is not in `keep`.
    /// Returns the removed ids so the caller can prune the persisted copy.
    pub fn overlay_prune(&self, keep: &HashSet<String>) -> Vec<String> {
        let mut overlay = self.overlay.lock().unwrap();
        let stale: Vec<String> = overlay
            .entries
            .keys()
            .filter(|id| !keep.contains(*id))
            .cloned()
            .collect();
        for id in &stale {
            overlay.entries.remove(id);
        }
        stale
    }

    /// Current overlay contents (for the reconcile pass).
    pub fn overlay_snapshot(&self) -> HashMap<String, DateTime<Utc>> {
        self.overlay.lock().unwrap().entries.clone()
    }

    /// Drop everything: board, selection, overlay, hydration flag.
    /// Used by the de-authentication path.
    pub fn reset(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.orders.clear();
            inner.selected = None;
        }
        let mut overlay = self.overlay.lock().unwrap();
        overlay.entries.clear();
        overlay.hydrated = false;
    }
}

impl Default for OrderBoard {
    fn default() -> Self {
        OrderBoard::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn order(id: &str, status: OrderStatus) -> Order {
        Order {
            id: id.to_string(),
            numeric_id: Some(100),
            status,
            created_at: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
            acknowledged_at: None,
            total: 12.0,
            items: vec![],
            customer: None,
            notes: None,
        }
    }

    fn ts(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, min, 0).unwrap()
    }

    #[test]
    fn test_replace_all_refreshes_selected_mirror() {
        let board = OrderBoard::new();
        board.replace_all(vec![order("a", OrderStatus::Pending)]);
        assert!(board.select("a"));

        // New snapshot carries a newer copy of the selected order
        let mut newer = order("a", OrderStatus::Preparing);
        newer.total = 99.0;
        let cleared = board.replace_all(vec![newer]);

        assert!(!cleared);
        let selected = board.selected().expect("still selected");
        assert_eq!(selected.status, OrderStatus::Preparing);
        assert_eq!(selected.total, 99.0);
    }

    #[test]
    fn test_replace_all_clears_vanished_selection() {
        let board = OrderBoard::new();
        board.replace_all(vec![order("a", OrderStatus::Pending)]);
        board.select("a");

        let cleared = board.replace_all(vec![order("b", OrderStatus::Pending)]);
        assert!(cleared);
        assert!(board.selected().is_none());
        // The rest of the list is intact
        assert_eq!(board.order_count(), 1);
    }

    #[test]
    fn test_set_status_updates_list_and_mirror() {
        let board = OrderBoard::new();
        board.replace_all(vec![
            order("a", OrderStatus::Pending),
            order("b", OrderStatus::Pending),
        ]);
        board.select("a");

        let prev = board.set_status("a", OrderStatus::Preparing);
        assert_eq!(prev, Some(OrderStatus::Pending));
        assert_eq!(board.get("a").unwrap().status, OrderStatus::Preparing);
        assert_eq!(board.selected().unwrap().status, OrderStatus::Preparing);
        // Untouched order keeps its status
        assert_eq!(board.get("b").unwrap().status, OrderStatus::Pending);

        assert_eq!(board.set_status("missing", OrderStatus::Ready), None);
    }

    #[test]
    fn test_overlay_first_insert_wins() {
        let board = OrderBoard::new();
        assert!(board.overlay_insert("a", ts(0)));
        assert!(!board.overlay_insert("a", ts(5)));
        assert_eq!(board.overlay_get("a"), Some(ts(0)));
    }

    #[test]
    fn test_overlay_prune_removes_stale_entries() {
        let board = OrderBoard::new();
        board.overlay_insert("keep", ts(1));
        board.overlay_insert("stale-1", ts(2));
        board.overlay_insert("stale-2", ts(3));

        let keep: HashSet<String> = ["keep".to_string()].into_iter().collect();
        let mut removed = board.overlay_prune(&keep);
        removed.sort();
        assert_eq!(removed, vec!["stale-1", "stale-2"]);
        assert_eq!(board.overlay_len(), 1);
        assert!(board.overlay_contains("keep"));
    }

    #[test]
    fn test_hydrate_is_one_shot_and_memory_wins() {
        let board = OrderBoard::new();
        assert!(!board.overlay_hydrated());

        // Acknowledged before the persisted overlay loaded
        board.overlay_insert("a", ts(9));

        let persisted: HashMap<String, DateTime<Utc>> =
            [("a".to_string(), ts(1)), ("b".to_string(), ts(2))]
                .into_iter()
                .collect();
        let loaded = board.hydrate_overlay(persisted);

        assert!(board.overlay_hydrated());
        assert_eq!(loaded, 1, "only 'b' should load; in-memory 'a' is newer");
        assert_eq!(board.overlay_get("a"), Some(ts(9)));
        assert_eq!(board.overlay_get("b"), Some(ts(2)));

        // Second hydration attempt is ignored
        let again = board.hydrate_overlay([("c".to_string(), ts(3))].into_iter().collect());
        assert_eq!(again, 0);
        assert!(!board.overlay_contains("c"));
    }

    #[test]
    fn test_reset_clears_everything() {
        let board = OrderBoard::new();
        board.replace_all(vec![order("a", OrderStatus::Pending)]);
        board.select("a");
        board.overlay_insert("a", ts(0));
        board.hydrate_overlay(HashMap::new());

        board.reset();

        assert_eq!(board.order_count(), 0);
        assert!(board.selected().is_none());
        assert_eq!(board.overlay_len(), 0);
        assert!(!board.overlay_hydrated());
    }
}
