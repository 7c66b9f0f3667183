//! Join coordination
//!
//! Tracks which parties have joined and fires the fully-joined edge exactly
//! once: a confirmed session becomes active and metering starts.

use super::state_machine::SessionStateMachine;
use super::EngineContext;
use crate::errors::{AppError, Result};
use crate::events::{fan_out, SessionEvent};
use crate::locks::session_key;
use crate::metrics;
use crate::session::{Actor, Party, Session, SessionStatus};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Join flags after a `mark_joined` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResult {
    pub session_id: String,
    pub status: SessionStatus,
    pub requester_joined: bool,
    pub provider_joined: bool,
    /// True only for the call that started metering
    pub metering_started: bool,
}

impl JoinResult {
    fn of(session: &Session, metering_started: bool) -> Self {
        Self {
            session_id: session.id().to_string(),
            status: session.status(),
            requester_joined: session.requester_joined(),
            provider_joined: session.provider_joined(),
            metering_started,
        }
    }
}

pub struct JoinCoordinator {
    ctx: EngineContext,
    machine: Arc<SessionStateMachine>,
}

impl JoinCoordinator {
    pub fn new(ctx: EngineContext, machine: Arc<SessionStateMachine>) -> Self {
        Self { ctx, machine }
    }

    /// Record that `party` has joined. Repeated joins are no-ops.
    #[instrument(skip(self), fields(party = party.as_str()))]
    pub async fn mark_joined(&self, session_id: &str, party: Party) -> Result<JoinResult> {
        let _guard = self.ctx.locks.acquire(&session_key(session_id)).await?;
        let mut session = self.ctx.load(session_id).await?;

        if !matches!(
            session.status(),
            SessionStatus::Confirmed | SessionStatus::Active
        ) {
            return Err(AppError::SessionNotActive {
                id: session_id.to_string(),
                status: session.status(),
            });
        }

        if session.has_joined(party) {
            debug!(session_id = %session_id, "Party already joined");
            return Ok(JoinResult::of(&session, false));
        }

        let now = self.ctx.clock.now();
        session.set_joined(party);
        session.updated_at = now;

        let mut activated = None;
        let mut metering_started = false;

        if session.fully_joined() {
            if session.status() == SessionStatus::Confirmed {
                let entry = SessionStateMachine::apply(
                    &mut session,
                    SessionStatus::Active,
                    Actor::System,
                    None,
                    json!({ "requesterJoined": true, "providerJoined": true }),
                    now,
                )?;
                activated = Some(entry);
            }

            if session.billing.metering_started_at.is_none() {
                session.billing.metering_started_at = Some(now);
                session.billing.last_charged_at = Some(now);
                metering_started = true;

                if let Some(entry) = &activated {
                    session.record_transition(
                        entry.with_metadata(json!({ "meteringStartedAt": now })),
                    );
                }
            }
        }

        let saved = self.ctx.save(&session).await?;

        fan_out(
            self.ctx.events.as_ref(),
            &saved,
            &SessionEvent::join_update(&saved),
        );
        if let Some(entry) = &activated {
            self.machine.announce(&saved, entry);
        }
        metrics::record_join(party);

        if metering_started {
            info!(session_id = %saved.id(), "Both parties joined, metering started");
        }

        Ok(JoinResult::of(&saved, metering_started))
    }
}

#[cfg(test)]
mod tests {
    use crate::config::CreationMode;
    use crate::engine::testing::{harness, harness_with_mode};
    use crate::errors::AppError;
    use crate::session::{Actor, SessionKind, SessionStatus};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_both_joins_activate_confirmed_session() {
        let h = harness();
        let session = h.engine.create_session("r", "p", SessionKind::Text).await.unwrap();
        let id = session.id().to_string();
        h.engine.confirm(&id, "p").await.unwrap();
        h.sink.clear();

        let first = h.engine.join(&id, "r").await.unwrap();
        assert!(first.requester_joined && !first.provider_joined);
        assert_eq!(first.status, SessionStatus::Confirmed);
        assert!(!first.metering_started);

        let second = h.engine.join(&id, "p").await.unwrap();
        assert_eq!(second.status, SessionStatus::Active);
        assert!(second.metering_started);

        let stored = h.engine.get_session(&id).await.unwrap();
        assert!(stored.is_billable());
        assert_eq!(stored.billing().metering_started_at, Some(h.clock_now()));

        let last = stored.transition_log().last().unwrap();
        assert_eq!(last.from, Some(SessionStatus::Confirmed));
        assert_eq!(last.to, SessionStatus::Active);
        assert_eq!(last.changed_by, Actor::System);
        assert_eq!(last.metadata["providerJoined"], true);
        assert!(last.metadata.get("meteringStartedAt").is_some());

        assert_eq!(
            h.sink.names_for("r"),
            vec!["joinUpdate", "joinUpdate", "statusChanged"]
        );
    }

    #[tokio::test]
    async fn test_repeat_join_is_noop() {
        let h = harness();
        let session = h.engine.create_session("r", "p", SessionKind::Text).await.unwrap();
        let id = session.id().to_string();
        h.engine.confirm(&id, "p").await.unwrap();
        h.engine.join(&id, "r").await.unwrap();
        let version = h.engine.get_session(&id).await.unwrap().version();
        h.sink.clear();

        let again = h.engine.join(&id, "r").await.unwrap();

        assert!(again.requester_joined);
        assert!(!again.metering_started);
        assert!(h.sink.deliveries().is_empty());
        assert_eq!(h.engine.get_session(&id).await.unwrap().version(), version);
    }

    #[tokio::test]
    async fn test_join_before_confirm_is_refused() {
        let h = harness();
        let session = h.engine.create_session("r", "p", SessionKind::Text).await.unwrap();

        let result = h.engine.join(session.id(), "r").await;
        assert!(matches!(
            result,
            Err(AppError::SessionNotActive { status: SessionStatus::Pending, .. })
        ));
    }

    #[tokio::test]
    async fn test_join_after_provider_ends_is_refused() {
        let h = harness();
        let session = h.engine.create_session("r", "p", SessionKind::Text).await.unwrap();
        let id = session.id().to_string();
        h.engine.confirm(&id, "p").await.unwrap();
        h.engine.join(&id, "r").await.unwrap();
        h.engine.join(&id, "p").await.unwrap();
        h.engine.end(&id, "p").await.unwrap();
        let ended = h.engine.get_session(&id).await.unwrap();
        h.sink.clear();

        let result = h.engine.join(&id, "r").await;
        assert!(matches!(
            result,
            Err(AppError::SessionNotActive { status: SessionStatus::Ended, .. })
        ));

        let stored = h.engine.get_session(&id).await.unwrap();
        assert_eq!(stored.status(), SessionStatus::Ended);
        assert_eq!(stored.version(), ended.version());
        assert!(h.sink.deliveries().is_empty());
    }

    #[tokio::test]
    async fn test_immediate_session_starts_metering_without_transition() {
        let h = harness_with_mode(CreationMode::Immediate);
        let session = h.engine.create_session("r", "p", SessionKind::Text).await.unwrap();
        let id = session.id().to_string();

        h.engine.join(&id, "p").await.unwrap();
        let both = h.engine.join(&id, "r").await.unwrap();

        assert!(both.metering_started);
        let stored = h.engine.get_session(&id).await.unwrap();
        assert_eq!(stored.transition_log().len(), 1);
        assert!(stored.is_billable());
    }

    #[tokio::test]
    async fn test_concurrent_joins_start_metering_once() {
        let h = harness();
        let session = h.engine.create_session("r", "p", SessionKind::Text).await.unwrap();
        let id = session.id().to_string();
        h.engine.confirm(&id, "p").await.unwrap();

        let engine = Arc::new(h.engine);
        let a = {
            let engine = engine.clone();
            let id = id.clone();
            tokio::spawn(async move { engine.join(&id, "r").await })
        };
        let b = {
            let engine = engine.clone();
            let id = id.clone();
            tokio::spawn(async move { engine.join(&id, "p").await })
        };

        let results = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];
        let started = results.iter().filter(|r| r.metering_started).count();
        assert_eq!(started, 1);

        let stored = engine.get_session(&id).await.unwrap();
        let activations = stored
            .transition_log()
            .iter()
            .filter(|e| e.to == SessionStatus::Active)
            .count();
        assert_eq!(activations, 1);
    }
}
