//! Connection registry
//!
//! Maps party ids to their open WebSocket connections. A party may hold
//! several connections (tabs, devices); every one of them receives the
//! party's events. Frames are queued per connection and never block the
//! engine: a connection whose queue is full loses the frame.

use dashmap::DashMap;
use parley_common::events::{EventSink, SessionEvent};
use parley_common::metrics;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Frames buffered per connection before new ones are dropped
pub const OUTBOUND_BUFFER: usize = 256;

/// Identifies one registered connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub party_id: String,
    pub id: u64,
}

struct Connection {
    id: u64,
    outbound: mpsc::Sender<String>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    parties: DashMap<String, Vec<Connection>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; the receiver yields serialized frames
    pub fn register(&self, party_id: &str) -> (ConnectionHandle, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.parties
            .entry(party_id.to_string())
            .or_default()
            .push(Connection { id, outbound: tx });

        metrics::set_realtime_connections(self.connection_count());
        debug!(party_id = %party_id, connection_id = id, "Connection registered");

        (
            ConnectionHandle {
                party_id: party_id.to_string(),
                id,
            },
            rx,
        )
    }

    pub fn unregister(&self, handle: &ConnectionHandle) {
        if let Some(mut connections) = self.parties.get_mut(&handle.party_id) {
            connections.retain(|c| c.id != handle.id);
        }
        self.parties
            .remove_if(&handle.party_id, |_, connections| connections.is_empty());

        metrics::set_realtime_connections(self.connection_count());
        debug!(party_id = %handle.party_id, connection_id = handle.id, "Connection unregistered");
    }

    /// Queue a frame for a single connection
    pub fn send_to(&self, handle: &ConnectionHandle, frame: String) {
        if let Some(connections) = self.parties.get(&handle.party_id) {
            if let Some(connection) = connections.iter().find(|c| c.id == handle.id) {
                if connection.outbound.try_send(frame).is_err() {
                    warn!(party_id = %handle.party_id, "Dropping reply frame, connection not draining");
                }
            }
        }
    }

    pub fn is_connected(&self, party_id: &str) -> bool {
        self.parties.contains_key(party_id)
    }

    pub fn connection_count(&self) -> usize {
        self.parties.iter().map(|entry| entry.value().len()).sum()
    }
}

impl EventSink for ConnectionRegistry {
    fn send(&self, party_id: &str, event: &SessionEvent) {
        let Some(connections) = self.parties.get(party_id) else {
            debug!(party_id = %party_id, event = event.name(), "Party not connected");
            return;
        };

        let frame = match serde_json::to_string(event) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, event = event.name(), "Failed to serialize event");
                return;
            }
        };

        for connection in connections.iter() {
            if let Err(e) = connection.outbound.try_send(frame.clone()) {
                warn!(
                    party_id = %party_id,
                    connection_id = connection.id,
                    event = event.name(),
                    error = %e,
                    "Dropping event frame"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_common::session::{Actor, CloseReason};

    fn ended() -> SessionEvent {
        SessionEvent::SessionEnded {
            session_id: "s-1".into(),
            ended_by: Actor::Provider,
            reason: CloseReason::Completed,
        }
    }

    #[tokio::test]
    async fn test_event_reaches_every_connection_of_party() {
        let registry = ConnectionRegistry::new();
        let (_a, mut rx_a) = registry.register("r-1");
        let (_b, mut rx_b) = registry.register("r-1");
        let (_other, mut rx_other) = registry.register("p-1");

        registry.send("r-1", &ended());

        for rx in [&mut rx_a, &mut rx_b] {
            let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(frame["event"], "sessionEnded");
            assert_eq!(frame["data"]["reason"], "completed");
        }
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unregister_removes_party_when_last_connection_leaves() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = registry.register("r-1");
        let (second, _rx2) = registry.register("r-1");
        assert_eq!(registry.connection_count(), 2);

        registry.unregister(&first);
        assert!(registry.is_connected("r-1"));
        registry.unregister(&second);
        assert!(!registry.is_connected("r-1"));
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let registry = ConnectionRegistry::new();
        let (_handle, mut rx) = registry.register("r-1");

        for _ in 0..OUTBOUND_BUFFER + 10 {
            registry.send("r-1", &ended());
        }

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, OUTBOUND_BUFFER);
    }
}
