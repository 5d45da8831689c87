//! Connectivity gate.
//!
//! A single online/offline flag fed exclusively by the health-check probe.
//! Remote call failures do NOT flip the gate; a request can fail for plenty
//! of reasons while the link is fine, and flapping the gate on every error
//! would re-trigger drains in a loop. The probe loop is the only writer.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Edge reported by [`ConnectivityGate::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    CameOnline,
    WentOffline,
}

/// Probe-driven online/offline state. Starts offline until the first
/// successful probe; mutations made before that are queued, not lost.
pub struct ConnectivityGate {
    online: AtomicBool,
}

impl ConnectivityGate {
    pub fn new() -> Self {
        ConnectivityGate {
            online: AtomicBool::new(false),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Record a probe result. Returns the edge if the state changed.
    pub fn observe(&self, online: bool) -> Option<Transition> {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        match (was_online, online) {
            (false, true) => {
                info!("Network restored, station back online");
                Some(Transition::CameOnline)
            }
            (true, false) => {
                info!("Network lost, station now offline");
                Some(Transition::WentOffline)
            }
            _ => None,
        }
    }
}

impl Default for ConnectivityGate {
    fn default() -> Self {
        ConnectivityGate::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
