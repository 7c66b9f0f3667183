//! Session engine
//!
//! Ties the availability matcher, the state machine and the join coordinator
//! to one store, lock registry, clock and event sink. Front doors (HTTP,
//! WebSocket) call [`SessionEngine`] with a caller's party id; the engine
//! resolves which side that caller plays and authorizes the action.

mod join;
mod matcher;
mod state_machine;

pub use join::{JoinCoordinator, JoinResult};
pub use matcher::AvailabilityMatcher;
pub use state_machine::SessionStateMachine;

use crate::clock::Clock;
use crate::config::{AppConfig, CreationMode};
use crate::db::SessionStore;
use crate::errors::{AppError, Result};
use crate::events::EventSink;
use crate::locks::KeyedLocks;
use crate::resilience::bounded;
use crate::session::{Actor, CloseReason, Party, Session, SessionIdGenerator, SessionKind, SessionStatus};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Shared handles every engine component works against
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn SessionStore>,
    pub locks: KeyedLocks,
    pub events: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
    /// Upper bound on any single store call
    pub store_timeout: Duration,
}

impl EngineContext {
    pub fn new(
        store: Arc<dyn SessionStore>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        config: &AppConfig,
    ) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(config.lock_timeout()),
            events,
            clock,
            store_timeout: config.store_timeout(),
        }
    }

    /// Fetch a session or fail with `SessionNotFound`
    pub async fn load(&self, session_id: &str) -> Result<Session> {
        bounded(
            "session load",
            self.store_timeout,
            self.store.get_by_id(session_id),
        )
        .await?
        .ok_or_else(|| AppError::SessionNotFound {
            id: session_id.to_string(),
        })
    }

    /// Persist a session loaded under its lock
    pub async fn save(&self, session: &Session) -> Result<Session> {
        bounded("session update", self.store_timeout, self.store.update(session)).await
    }
}

/// Entry point for all session operations
pub struct SessionEngine {
    ctx: EngineContext,
    matcher: AvailabilityMatcher,
    machine: Arc<SessionStateMachine>,
    joins: JoinCoordinator,
}

impl SessionEngine {
    pub fn new(ctx: EngineContext, mode: CreationMode, id_length: usize) -> Self {
        let machine = Arc::new(SessionStateMachine::new(ctx.clone()));
        Self {
            matcher: AvailabilityMatcher::new(ctx.clone(), SessionIdGenerator::new(id_length), mode),
            joins: JoinCoordinator::new(ctx.clone(), machine.clone()),
            machine,
            ctx,
        }
    }

    /// Build from configuration
    pub fn from_config(ctx: EngineContext, config: &AppConfig) -> Self {
        Self::new(ctx, config.sessions.creation_mode, config.sessions.id_length)
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn state_machine(&self) -> &Arc<SessionStateMachine> {
        &self.machine
    }

    pub fn creation_mode(&self) -> CreationMode {
        self.matcher.creation_mode()
    }

    pub async fn create_session(
        &self,
        requester_id: &str,
        provider_id: &str,
        kind: SessionKind,
    ) -> Result<Session> {
        self.matcher
            .try_create_session(requester_id, provider_id, kind)
            .await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        self.ctx.load(session_id).await
    }

    /// Fetch a session on behalf of one of its parties
    pub async fn get_session_for(&self, session_id: &str, party_id: &str) -> Result<Session> {
        let (session, _) = self.resolve(session_id, party_id).await?;
        Ok(session)
    }

    /// Provider accepts a pending session
    pub async fn confirm(&self, session_id: &str, party_id: &str) -> Result<Session> {
        let (_, party) = self.resolve(session_id, party_id).await?;
        if party != Party::Provider {
            return Err(AppError::Validation {
                message: "only the provider can confirm a session".into(),
                field: None,
            });
        }

        self.machine
            .transition(session_id, SessionStatus::Confirmed, Actor::Provider, Value::Null)
            .await
    }

    pub async fn join(&self, session_id: &str, party_id: &str) -> Result<JoinResult> {
        let (_, party) = self.resolve(session_id, party_id).await?;
        self.joins.mark_joined(session_id, party).await
    }

    /// Either party ends an active session
    pub async fn end(&self, session_id: &str, party_id: &str) -> Result<Session> {
        let (_, party) = self.resolve(session_id, party_id).await?;
        self.machine
            .close_or_transition(
                session_id,
                SessionStatus::Ended,
                party.into(),
                Some(CloseReason::Completed),
                Value::Null,
            )
            .await
    }

    /// Either party declines a pending or confirmed session
    pub async fn reject(&self, session_id: &str, party_id: &str) -> Result<Session> {
        let (_, party) = self.resolve(session_id, party_id).await?;
        self.machine
            .close_or_transition(
                session_id,
                SessionStatus::Rejected,
                party.into(),
                Some(CloseReason::Declined),
                Value::Null,
            )
            .await
    }

    /// Party ids never change, so resolving outside the session lock is safe.
    async fn resolve(&self, session_id: &str, party_id: &str) -> Result<(Session, Party)> {
        let session = self.ctx.load(session_id).await?;
        let party = session
            .party_of(party_id)
            .ok_or_else(|| AppError::NotAParty {
                session_id: session_id.to_string(),
                party_id: party_id.to_string(),
            })?;
        Ok((session, party))
    }
}
