//! Availability matching
//!
//! A party may be in at most one open session, whichever role it plays.
//! The busy check and the insert run while both parties' locks are held.

use super::EngineContext;
use crate::config::CreationMode;
use crate::errors::{AppError, Result};
use crate::events::{fan_out, SessionEvent};
use crate::locks::party_key;
use crate::metrics;
use crate::resilience::bounded;
use crate::session::{Session, SessionIdGenerator, SessionKind, SessionStatus};
use tracing::{info, instrument, warn};

const MAX_ID_ATTEMPTS: usize = 5;

pub struct AvailabilityMatcher {
    ctx: EngineContext,
    ids: SessionIdGenerator,
    mode: CreationMode,
}

impl AvailabilityMatcher {
    pub fn new(ctx: EngineContext, ids: SessionIdGenerator, mode: CreationMode) -> Self {
        Self { ctx, ids, mode }
    }

    pub fn creation_mode(&self) -> CreationMode {
        self.mode
    }

    /// Create a session between two idle parties.
    ///
    /// The requester is checked first, so a caller that is itself busy
    /// always sees `RequesterBusy`.
    #[instrument(skip(self), fields(mode = self.mode.as_str()))]
    pub async fn try_create_session(
        &self,
        requester_id: &str,
        provider_id: &str,
        kind: SessionKind,
    ) -> Result<Session> {
        if requester_id == provider_id {
            return Err(AppError::Validation {
                message: "requester and provider must be different parties".into(),
                field: Some("providerId".into()),
            });
        }

        let requester_key = party_key(requester_id);
        let provider_key = party_key(provider_id);
        let _guards = self
            .ctx
            .locks
            .acquire_many(&[&requester_key, &provider_key])
            .await?;

        if self.is_busy(requester_id).await? {
            metrics::record_busy("requester");
            return Err(AppError::RequesterBusy {
                requester_id: requester_id.to_string(),
            });
        }
        if self.is_busy(provider_id).await? {
            metrics::record_busy("provider");
            return Err(AppError::ProviderBusy {
                provider_id: provider_id.to_string(),
            });
        }

        let id = self.unused_id().await?;
        let initial = match self.mode {
            CreationMode::Pending => SessionStatus::Pending,
            CreationMode::Immediate => SessionStatus::Active,
        };
        let session = Session::new(
            id,
            requester_id.to_string(),
            provider_id.to_string(),
            kind,
            initial,
            self.ctx.clock.now(),
        );

        let created = bounded(
            "session insert",
            self.ctx.store_timeout,
            self.ctx.store.create(&session),
        )
        .await?;

        fan_out(
            self.ctx.events.as_ref(),
            &created,
            &SessionEvent::created(&created),
        );
        metrics::record_session_created(kind, self.mode);

        info!(
            session_id = %created.id(),
            requester_id = %requester_id,
            provider_id = %provider_id,
            kind = %kind,
            status = %initial,
            "Session created"
        );

        Ok(created)
    }

    async fn is_busy(&self, party_id: &str) -> Result<bool> {
        let open = bounded(
            "busy check",
            self.ctx.store_timeout,
            self.ctx.store.find_active_by_party(party_id),
        )
        .await?;
        Ok(!open.is_empty())
    }

    async fn unused_id(&self) -> Result<String> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let candidate = self.ids.generate();
            let existing = bounded(
                "id collision check",
                self.ctx.store_timeout,
                self.ctx.store.get_by_id(&candidate),
            )
            .await?;
            if existing.is_none() {
                return Ok(candidate);
            }
            warn!(candidate = %candidate, "Session id collision, regenerating");
        }

        Err(AppError::Internal {
            message: format!("no free session id after {} attempts", MAX_ID_ATTEMPTS),
        })
    }
}
