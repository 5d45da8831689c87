//! Engine-to-UI event channel.
//!
//! The display layer and the print collaborator subscribe here instead of
//! being called directly. Events are broadcast best-effort: emitting with no
//! live subscriber is not an error, and a slow subscriber that lags just
//! misses old events.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::orders::OrderStatus;

/// Everything the engine announces. Serialized with an `event` tag and a
/// camelCase `payload` so the frontend bridge sees the same shape the old
/// tablet app emitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum UiEvent {
    /// A refresh cycle replaced the board contents.
    #[serde(rename_all = "camelCase")]
    OrdersRefreshed { count: usize },
    /// The connectivity gate flipped.
    #[serde(rename_all = "camelCase")]
    NetworkStatus { online: bool },
    /// An online status update failed and was rolled back.
    #[serde(rename_all = "camelCase")]
    StatusUpdateFailed {
        order_id: String,
        target_status: OrderStatus,
        error: String,
    },
    /// Fresh pending orders the ticket printer has not handled yet.
    #[serde(rename_all = "camelCase")]
    AutoPrintRequested { order_ids: Vec<String> },
    /// Station credentials were rejected; local state has been wiped.
    #[serde(rename_all = "camelCase")]
    SessionRevoked { reason: String },
}

/// Cloneable handle around a broadcast channel of [`UiEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<UiEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        EventBus { tx }
    }

    /// Fire and forget. A send error only means nobody is listening.
    pub fn emit(&self, event: UiEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(64)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(UiEvent::NetworkStatus { online: true });
    }

    #[test]
    fn test_subscriber_receives_emitted_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(UiEvent::OrdersRefreshed { count: 3 });
        bus.emit(UiEvent::SessionRevoked {
            reason: "API key is invalid or expired".to_string(),
        });

        assert_eq!(rx.try_recv().unwrap(), UiEvent::OrdersRefreshed { count: 3 });
        assert!(matches!(
            rx.try_recv().unwrap(),
            UiEvent::SessionRevoked { .. }
        ));
    }

    #[test]
    fn test_event_wire_shape() {
        let event = UiEvent::StatusUpdateFailed {
            order_id: "ord-9".to_string(),
            target_status: OrderStatus::Preparing,
            error: "HTTP 500".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "status_update_failed");
        assert_eq!(json["payload"]["orderId"], "ord-9");
        assert_eq!(json["payload"]["targetStatus"], "preparing");
    }
}
