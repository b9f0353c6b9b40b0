//! Typed connection events.
//!
//! The core emits one event per notable transition on a connection. Events
//! for a single connection arrive in the order they occurred; no ordering is
//! guaranteed across connections. The external notification subsystem
//! consumes them through [`EventBus::subscribe`].

use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// Client intent extracted from the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Status,
    Login,
}

#[derive(Debug, Clone)]
pub struct Event {
    /// Per-connection session id.
    pub session_id: Uuid,
    /// Gateway the connection arrived through.
    pub gateway_id: String,
    /// Matched backend server, when routing succeeded.
    pub server_id: Option<String>,
    pub kind: EventKind,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    /// No backend matched the requested hostname.
    NoRoute { domain: String, intent: Intent },
    /// A status query was answered locally or relayed from the backend.
    StatusServed { domain: String, online: bool },
    /// A login relay to the backend started.
    Connected {
        domain: String,
        client_addr: SocketAddr,
    },
    /// A relay ended, with per-direction byte counts.
    Disconnected {
        bytes_client_to_server: u64,
        bytes_server_to_client: u64,
        duration: Duration,
    },
    /// The connection was closed before routing completed.
    Rejected { reason: String },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NoRoute { .. } => "no-route",
            Self::StatusServed { .. } => "status-served",
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::Rejected { .. } => "rejected",
        }
    }
}

/// Broadcast fan-out of [`Event`]s to any number of subscribers.
///
/// Emission never blocks connection processing: with no subscribers the
/// event is dropped, and a lagging subscriber loses old events rather than
/// stalling the core.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        trace!(
            session_id = %event.session_id,
            gateway = %event.gateway_id,
            kind = event.kind.name(),
            "event"
        );
        metrics::counter!("hostgate_events_total", 1, "kind" => event.kind.name());
        // An error only means there are no subscribers right now.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
