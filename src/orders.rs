//! Order data model for the kitchen display.
//!
//! Orders arrive from the admin dashboard API in camelCase JSON; snake_case
//! aliases cover older server builds. The board never invents orders: every
//! `Order` here was deserialized from a server snapshot or returned by a
//! mutation endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a kitchen order.
///
/// `pending → confirmed → preparing → ready → completed`, with `cancelled`
/// as the alternate terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Preparing,
    Ready,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Preparing => "preparing",
            OrderStatus::Ready => "ready",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_lowercase().as_str() {
            "pending" => Ok(OrderStatus::Pending),
            "confirmed" => Ok(OrderStatus::Confirmed),
            "preparing" => Ok(OrderStatus::Preparing),
            "ready" => Ok(OrderStatus::Ready),
            "completed" => Ok(OrderStatus::Completed),
            "cancelled" | "canceled" => Ok(OrderStatus::Cancelled),
            other => Err(format!(
                "Invalid order status '{other}' (expected pending|confirmed|preparing|ready|completed|cancelled)"
            )),
        }
    }

    /// Statuses that still count as "new" on the board: the order has not
    /// reached the pass yet, the acknowledgement overlay applies, and the
    /// alert strip keeps ringing until someone taps it.
    pub fn is_newish(self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Confirmed | OrderStatus::Preparing
        )
    }

    /// Terminal statuses: no further transitions expected.
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub name: String,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_quantity() -> i64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCustomer {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

/// One order as shown on the board.
///
/// `id` is the server's opaque identifier and the only key used locally.
/// `numeric_id` is the legacy kitchen-ticket number some endpoints still
/// address; it can be absent on freshly created orders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    #[serde(default, alias = "numeric_id")]
    pub numeric_id: Option<i64>,
    pub status: OrderStatus,
    #[serde(alias = "created_at")]
    pub created_at: DateTime<Utc>,
    #[serde(default, alias = "acknowledged_at")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "total_amount")]
    pub total: f64,
    #[serde(default)]
    pub items: Vec<OrderItem>,
    #[serde(default)]
    pub customer: Option<OrderCustomer>,
    #[serde(default, alias = "special_instructions")]
    pub notes: Option<String>,
}

/// Full order list as fetched from the server in one poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSnapshot {
    #[serde(default)]
    pub orders: Vec<Order>,
    #[serde(default, alias = "server_time")]
    pub server_time: Option<DateTime<Utc>>,
}

/// Sort newest first. Stable, so same-instant orders keep arrival order.
pub fn sort_newest_first(orders: &mut [Order]) {
    orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

// ===========================================================================
// Tests
// ===========================================================================
