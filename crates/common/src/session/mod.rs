//! Session domain model
//!
//! A session is one metered engagement between a requester and a provider.
//! Status and join fields are only writable inside this crate: the state
//! machine and the join coordinator are the sole mutators.

mod id;

pub use id::SessionIdGenerator;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Pending,
    Confirmed,
    Active,
    Rejected,
    Ended,
}

impl SessionStatus {
    /// Statuses that make both parties busy
    pub const OPEN: [SessionStatus; 3] = [
        SessionStatus::Pending,
        SessionStatus::Confirmed,
        SessionStatus::Active,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Confirmed => "confirmed",
            SessionStatus::Active => "active",
            SessionStatus::Rejected => "rejected",
            SessionStatus::Ended => "ended",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Rejected | SessionStatus::Ended)
    }

    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }

    /// The transition table. Nothing outside it is legal.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Rejected)
                | (Confirmed, Active)
                | (Confirmed, Rejected)
                | (Active, Ended)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "confirmed" => Ok(SessionStatus::Confirmed),
            "active" => Ok(SessionStatus::Active),
            "rejected" => Ok(SessionStatus::Rejected),
            "ended" => Ok(SessionStatus::Ended),
            other => Err(format!("unknown session status '{}'", other)),
        }
    }
}

/// Medium of the consultation; selects the billing rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionKind {
    Text,
    Audio,
    Video,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Text => "text",
            SessionKind::Audio => "audio",
            SessionKind::Video => "video",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(SessionKind::Text),
            "audio" => Ok(SessionKind::Audio),
            "video" => Ok(SessionKind::Video),
            other => Err(format!("unknown session kind '{}'", other)),
        }
    }
}

/// One of the two participants of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Party {
    Requester,
    Provider,
}

impl Party {
    pub fn as_str(&self) -> &'static str {
        match self {
            Party::Requester => "requester",
            Party::Provider => "provider",
        }
    }
}

/// Who caused a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Actor {
    Requester,
    Provider,
    System,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Actor::Requester => "requester",
            Actor::Provider => "provider",
            Actor::System => "system",
        }
    }
}

impl From<Party> for Actor {
    fn from(party: Party) -> Self {
        match party {
            Party::Requester => Actor::Requester,
            Party::Provider => Actor::Provider,
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Actor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requester" => Ok(Actor::Requester),
            "provider" => Ok(Actor::Provider),
            "system" => Ok(Actor::System),
            other => Err(format!("unknown actor '{}'", other)),
        }
    }
}

/// Why a session reached a terminal status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CloseReason {
    /// Explicit end by one of the parties
    Completed,
    /// Explicit reject by one of the parties
    Declined,
    InsufficientFunds,
    ConfirmTimeout,
    JoinTimeout,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Completed => "completed",
            CloseReason::Declined => "declined",
            CloseReason::InsufficientFunds => "insufficientFunds",
            CloseReason::ConfirmTimeout => "confirmTimeout",
            CloseReason::JoinTimeout => "joinTimeout",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloseReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(CloseReason::Completed),
            "declined" => Ok(CloseReason::Declined),
            "insufficientFunds" => Ok(CloseReason::InsufficientFunds),
            "confirmTimeout" => Ok(CloseReason::ConfirmTimeout),
            "joinTimeout" => Ok(CloseReason::JoinTimeout),
            other => Err(format!("unknown close reason '{}'", other)),
        }
    }
}

/// Append-only audit record of one status change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionEntry {
    /// `None` only for the creation entry
    pub from: Option<SessionStatus>,
    pub to: SessionStatus,
    pub changed_by: Actor,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl TransitionEntry {
    fn same_transition(&self, other: &TransitionEntry) -> bool {
        self.from == other.from
            && self.to == other.to
            && self.changed_by == other.changed_by
            && self.timestamp == other.timestamp
    }

    /// The same transition carrying different metadata
    pub fn with_metadata(&self, metadata: serde_json::Value) -> TransitionEntry {
        TransitionEntry {
            metadata,
            ..self.clone()
        }
    }
}

/// Durable metering facts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingState {
    pub metering_started_at: Option<DateTime<Utc>>,
    /// Start of the first minute not yet charged
    pub last_charged_at: Option<DateTime<Utc>>,
    pub billed_minutes: i64,
    pub amount_charged: Decimal,
}

impl BillingState {
    /// Whole minutes elapsed since the last charge
    pub fn unbilled_minutes(&self, now: DateTime<Utc>) -> i64 {
        match self.last_charged_at {
            Some(since) if now > since => (now - since).num_seconds() / 60,
            _ => 0,
        }
    }

    /// Record a successful charge of `minutes`.
    ///
    /// The anchor moves by exactly the charged minutes so partial minutes
    /// roll into the next tick.
    pub(crate) fn record_charge(&mut self, minutes: i64, amount: Decimal) {
        if let Some(since) = self.last_charged_at {
            self.last_charged_at = Some(since + Duration::minutes(minutes));
        }
        self.billed_minutes += minutes;
        self.amount_charged += amount;
    }

    /// Idempotency key for the next unbilled minute.
    ///
    /// Stable until that minute is recorded, so a retried debit always
    /// carries the key of the original attempt.
    pub fn next_minute_key(&self, session_id: &str) -> String {
        format!("{}:{}", session_id, self.billed_minutes + 1)
    }
}

/// The central session entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub(crate) id: String,
    pub(crate) requester_id: String,
    pub(crate) provider_id: String,
    pub(crate) kind: SessionKind,
    pub(crate) status: SessionStatus,
    pub(crate) previous_status: Option<SessionStatus>,
    pub(crate) rejected_by: Option<Actor>,
    pub(crate) ended_by: Option<Actor>,
    pub(crate) close_reason: Option<CloseReason>,
    pub(crate) requester_joined: bool,
    pub(crate) provider_joined: bool,
    pub(crate) transition_log: Vec<TransitionEntry>,
    pub(crate) billing: BillingState,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
    /// Optimistic concurrency token, bumped by every store update
    pub(crate) version: i64,
}

impl Session {
    /// Build a freshly created session with its creation log entry
    pub(crate) fn new(
        id: String,
        requester_id: String,
        provider_id: String,
        kind: SessionKind,
        initial: SessionStatus,
        now: DateTime<Utc>,
    ) -> Self {
        let created = TransitionEntry {
            from: None,
            to: initial,
            changed_by: Actor::Requester,
            timestamp: now,
            metadata: serde_json::json!({ "event": "created" }),
        };

        Self {
            id,
            requester_id,
            provider_id,
            kind,
            status: initial,
            previous_status: None,
            rejected_by: None,
            ended_by: None,
            close_reason: None,
            requester_joined: false,
            provider_joined: false,
            transition_log: vec![created],
            billing: BillingState::default(),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn requester_id(&self) -> &str {
        &self.requester_id
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn previous_status(&self) -> Option<SessionStatus> {
        self.previous_status
    }

    pub fn rejected_by(&self) -> Option<Actor> {
        self.rejected_by
    }

    pub fn ended_by(&self) -> Option<Actor> {
        self.ended_by
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn requester_joined(&self) -> bool {
        self.requester_joined
    }

    pub fn provider_joined(&self) -> bool {
        self.provider_joined
    }

    pub fn fully_joined(&self) -> bool {
        self.requester_joined && self.provider_joined
    }

    pub fn transition_log(&self) -> &[TransitionEntry] {
        &self.transition_log
    }

    pub fn billing(&self) -> &BillingState {
        &self.billing
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    /// Which side `party_id` plays in this session, if any
    pub fn party_of(&self, party_id: &str) -> Option<Party> {
        if self.requester_id == party_id {
            Some(Party::Requester)
        } else if self.provider_id == party_id {
            Some(Party::Provider)
        } else {
            None
        }
    }

    pub fn has_joined(&self, party: Party) -> bool {
        match party {
            Party::Requester => self.requester_joined,
            Party::Provider => self.provider_joined,
        }
    }

    /// Billed only while active, fully joined and metering has started
    pub fn is_billable(&self) -> bool {
        self.status == SessionStatus::Active
            && self.fully_joined()
            && self.billing.last_charged_at.is_some()
    }

    /// Time the session entered its current status
    pub fn status_since(&self) -> DateTime<Utc> {
        self.transition_log
            .last()
            .map(|entry| entry.timestamp)
            .unwrap_or(self.created_at)
    }

    pub(crate) fn set_joined(&mut self, party: Party) {
        match party {
            Party::Requester => self.requester_joined = true,
            Party::Provider => self.provider_joined = true,
        }
    }

    /// Append a log entry, or merge its metadata into the latest entry when
    /// it records the same logical transition.
    pub(crate) fn record_transition(&mut self, entry: TransitionEntry) {
        if let Some(last) = self.transition_log.last_mut() {
            if last.same_transition(&entry) {
                merge_metadata(&mut last.metadata, entry.metadata);
                return;
            }
        }
        self.transition_log.push(entry);
    }
}

/// Shallow object merge; non-object values replace the target outright
fn merge_metadata(target: &mut serde_json::Value, extra: serde_json::Value) {
    match (target, extra) {
        (serde_json::Value::Object(existing), serde_json::Value::Object(incoming)) => {
            for (key, value) in incoming {
                existing.insert(key, value);
            }
        }
        (_, serde_json::Value::Null) => {}
        (target, extra) => *target = extra,
    }
}
