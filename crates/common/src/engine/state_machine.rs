//! Session status transitions
//!
//! `transition` is the only public way to change a session's status. The
//! check, the log append and the store write all happen inside the session's
//! exclusive section, so log order is commit order.

use super::EngineContext;
use crate::errors::{AppError, Result};
use crate::events::{fan_out, SessionEvent};
use crate::locks::session_key;
use crate::metrics;
use crate::session::{Actor, CloseReason, Session, SessionStatus, TransitionEntry};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{info, instrument};

pub struct SessionStateMachine {
    ctx: EngineContext,
}

impl SessionStateMachine {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Move a session to `to`; fails with `InvalidTransition` without
    /// touching the session when the table forbids it.
    pub async fn transition(
        &self,
        session_id: &str,
        to: SessionStatus,
        actor: Actor,
        metadata: Value,
    ) -> Result<Session> {
        self.close_or_transition(session_id, to, actor, None, metadata)
            .await
    }

    /// Like [`transition`](Self::transition) with an explicit close reason
    /// for terminal targets.
    #[instrument(skip(self, metadata), fields(to = %to, actor = %actor))]
    pub async fn close_or_transition(
        &self,
        session_id: &str,
        to: SessionStatus,
        actor: Actor,
        reason: Option<CloseReason>,
        metadata: Value,
    ) -> Result<Session> {
        let _guard = self.ctx.locks.acquire(&session_key(session_id)).await?;

        let mut session = self.ctx.load(session_id).await?;
        let entry = Self::apply(&mut session, to, actor, reason, metadata, self.ctx.clock.now())?;
        let saved = self.ctx.save(&session).await?;

        self.announce(&saved, &entry);
        Ok(saved)
    }

    /// Validate and apply a transition to an in-memory session.
    ///
    /// Callers must hold the session's lock and persist the result.
    pub(crate) fn apply(
        session: &mut Session,
        to: SessionStatus,
        actor: Actor,
        reason: Option<CloseReason>,
        metadata: Value,
        now: DateTime<Utc>,
    ) -> Result<TransitionEntry> {
        let from = session.status;
        if !from.can_transition_to(to) {
            return Err(AppError::InvalidTransition { from, to });
        }

        let mut metadata = match metadata {
            Value::Null => json!({}),
            other => other,
        };

        match to {
            SessionStatus::Rejected => {
                let reason = reason.unwrap_or(CloseReason::Declined);
                session.rejected_by = Some(actor);
                session.close_reason = Some(reason);
                tag_reason(&mut metadata, reason);
            }
            SessionStatus::Ended => {
                let reason = reason.unwrap_or(CloseReason::Completed);
                session.ended_by = Some(actor);
                session.close_reason = Some(reason);
                tag_reason(&mut metadata, reason);
            }
            _ => {}
        }

        session.previous_status = Some(from);
        session.status = to;
        session.updated_at = now;

        let entry = TransitionEntry {
            from: Some(from),
            to,
            changed_by: actor,
            timestamp: now,
            metadata,
        };
        session.record_transition(entry.clone());

        Ok(entry)
    }

    /// Fan out the events for a committed transition
    pub(crate) fn announce(&self, session: &Session, entry: &TransitionEntry) {
        let changed = SessionEvent::StatusChanged {
            session_id: session.id().to_string(),
            from: entry.from,
            to: entry.to,
            actor: entry.changed_by,
            timestamp: entry.timestamp,
        };
        fan_out(self.ctx.events.as_ref(), session, &changed);

        // Every close, rejections included, tells the parties why.
        if entry.to.is_terminal() {
            let default_reason = if entry.to == SessionStatus::Rejected {
                CloseReason::Declined
            } else {
                CloseReason::Completed
            };
            let ended = SessionEvent::SessionEnded {
                session_id: session.id().to_string(),
                ended_by: entry.changed_by,
                reason: session.close_reason().unwrap_or(default_reason),
            };
            fan_out(self.ctx.events.as_ref(), session, &ended);
        }

        metrics::record_transition(entry.from, entry.to, entry.changed_by);

        info!(
            session_id = %session.id(),
            from = ?entry.from,
            to = %entry.to,
            actor = %entry.changed_by,
            "Session transitioned"
        );
    }
}

fn tag_reason(metadata: &mut Value, reason: CloseReason) {
    if let Value::Object(map) = metadata {
        map.entry("reason")
            .or_insert_with(|| Value::String(reason.as_str().to_string()));
    }
}
