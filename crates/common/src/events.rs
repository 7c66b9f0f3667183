//! Outbound session events and the sink they are pushed through
//!
//! The core never talks to connections directly; it hands each event to an
//! [`EventSink`] addressed by party id. The gateway's connection registry is
//! the production sink.

use crate::session::{Actor, CloseReason, Session, SessionStatus};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Events emitted by the session engine and the billing scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum SessionEvent {
    #[serde(rename_all = "camelCase")]
    SessionCreated {
        session_id: String,
        requester_id: String,
        provider_id: String,
        status: SessionStatus,
    },
    #[serde(rename_all = "camelCase")]
    StatusChanged {
        session_id: String,
        from: Option<SessionStatus>,
        to: SessionStatus,
        actor: Actor,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    JoinUpdate {
        session_id: String,
        requester_joined: bool,
        provider_joined: bool,
    },
    #[serde(rename_all = "camelCase")]
    BillingTick {
        session_id: String,
        minutes_charged: i64,
        new_balance: Decimal,
    },
    #[serde(rename_all = "camelCase")]
    SessionEnded {
        session_id: String,
        ended_by: Actor,
        reason: CloseReason,
    },
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::SessionCreated { .. } => "sessionCreated",
            SessionEvent::StatusChanged { .. } => "statusChanged",
            SessionEvent::JoinUpdate { .. } => "joinUpdate",
            SessionEvent::BillingTick { .. } => "billingTick",
            SessionEvent::SessionEnded { .. } => "sessionEnded",
        }
    }

    pub fn created(session: &Session) -> Self {
        SessionEvent::SessionCreated {
            session_id: session.id().to_string(),
            requester_id: session.requester_id().to_string(),
            provider_id: session.provider_id().to_string(),
            status: session.status(),
        }
    }

    pub fn join_update(session: &Session) -> Self {
        SessionEvent::JoinUpdate {
            session_id: session.id().to_string(),
            requester_joined: session.requester_joined(),
            provider_joined: session.provider_joined(),
        }
    }
}

/// Outbound transport as seen from the core.
///
/// `send` must not block: implementations enqueue and return.
pub trait EventSink: Send + Sync {
    fn send(&self, party_id: &str, event: &SessionEvent);
}

/// Deliver an event to both parties of a session
pub fn fan_out(sink: &dyn EventSink, session: &Session, event: &SessionEvent) {
    sink.send(session.requester_id(), event);
    sink.send(session.provider_id(), event);
}


/// Sink that keeps every delivery in memory, for tests
#[derive(Debug, Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<(String, SessionEvent)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All deliveries in order as `(party_id, event)`
    pub fn deliveries(&self) -> Vec<(String, SessionEvent)> {
        self.delivered
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    /// Events delivered to one party
    pub fn events_for(&self, party_id: &str) -> Vec<SessionEvent> {
        self.deliveries()
            .into_iter()
            .filter(|(to, _)| to == party_id)
            .map(|(_, event)| event)
            .collect()
    }

    /// Names of the events delivered to one party
    pub fn names_for(&self, party_id: &str) -> Vec<&'static str> {
        self.events_for(party_id).iter().map(|e| e.name()).collect()
    }

    pub fn clear(&self) {
        if let Ok(mut delivered) = self.delivered.lock() {
            delivered.clear();
        }
    }
}

impl EventSink for RecordingSink {
    fn send(&self, party_id: &str, event: &SessionEvent) {
        if let Ok(mut delivered) = self.delivered.lock() {
            delivered.push((party_id.to_string(), event.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_wire_shape() {
        let event = SessionEvent::BillingTick {
            session_id: "s-1".into(),
            minutes_charged: 2,
            new_balance: dec!(6.00),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "billingTick");
        assert_eq!(json["data"]["sessionId"], "s-1");
        assert_eq!(json["data"]["minutesCharged"], 2);
        assert_eq!(json["data"]["newBalance"], "6.00");
    }

    #[test]
    fn test_recording_sink_filters_by_party() {
        let sink = RecordingSink::new();
        let ended = SessionEvent::SessionEnded {
            session_id: "s-1".into(),
            ended_by: Actor::System,
            reason: CloseReason::InsufficientFunds,
        };
        sink.send("r-1", &ended);
        sink.send("p-1", &ended);

        assert_eq!(sink.names_for("r-1"), vec!["sessionEnded"]);
        assert_eq!(sink.deliveries().len(), 2);
        sink.clear();
        assert!(sink.deliveries().is_empty());
    }
}
