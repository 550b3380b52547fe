//! Core events for UIs
//!
//! The tunnel core publishes opaque events on a broadcast channel; dashboards
//! and log printers subscribe. Nothing on the request path ever waits for a
//! consumer.

use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Connecting,
    Connected { subdomain: String },
    Disconnected,
}

/// Display-only classification of an incoming request. The actual response
/// mode is decided later from the loopback response itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Http,
    Sse,
    Ws,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Http => "http",
            RequestKind::Sse => "sse",
            RequestKind::Ws => "ws",
        }
    }
}

#[derive(Debug, Clone)]
pub enum TunnelEvent {
    ConnectionState(ConnectionState),
    RequestStarted {
        id: Uuid,
        method: String,
        path: String,
        kind: RequestKind,
    },
    RequestCompleted {
        id: Uuid,
        status: u16,
    },
    /// Server-measured duration, relayed from `request_timing`.
    RequestTimed {
        id: Uuid,
        duration_ms: u64,
    },
    StreamProgress {
        id: Uuid,
        bytes: u64,
    },
}

/// Broadcast fan-out for [`TunnelEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TunnelEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Best-effort publish; no subscribers is fine.
    pub fn emit(&self, event: TunnelEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit(TunnelEvent::ConnectionState(ConnectionState::Connecting));
        match rx.recv().await.unwrap() {
            TunnelEvent::ConnectionState(state) => assert_eq!(state, ConnectionState::Connecting),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::new(8);
        bus.emit(TunnelEvent::ConnectionState(ConnectionState::Disconnected));
    }
}
