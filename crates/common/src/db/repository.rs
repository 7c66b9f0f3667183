//! Postgres session store
//!
//! Updates are conditional on the stored `version`, so two processes that
//! race on the same session cannot both commit.

use crate::db::models::*;
use crate::db::{DbPool, SessionStore};
use crate::errors::{AppError, Result};
use crate::session::{Session, SessionStatus};
use async_trait::async_trait;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, IntoActiveModel,
    QueryFilter, QueryOrder,
};
use tracing::debug;

/// Session store over the `sessions` table
#[derive(Clone)]
pub struct PgSessionStore {
    pool: DbPool,
}

impl PgSessionStore {
    /// Create a new store with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> &DatabaseConnection {
        self.pool.conn()
    }

    fn open_statuses() -> Vec<&'static str> {
        SessionStatus::OPEN.iter().map(|s| s.as_str()).collect()
    }

    fn into_sessions(rows: Vec<SessionRow>) -> Result<Vec<Session>> {
        rows.into_iter().map(Session::try_from).collect()
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create(&self, session: &Session) -> Result<Session> {
        let row = SessionRow::try_from(session)?;
        let inserted = row.into_active_model().reset_all().insert(self.conn()).await?;
        debug!(session_id = %inserted.id, "Session row inserted");
        Session::try_from(inserted)
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Session>> {
        SessionEntity::find_by_id(id.to_string())
            .one(self.conn())
            .await?
            .map(Session::try_from)
            .transpose()
    }

    async fn find_active_by_party(&self, party_id: &str) -> Result<Vec<Session>> {
        let rows = SessionEntity::find()
            .filter(
                Condition::any()
                    .add(SessionColumn::RequesterId.eq(party_id))
                    .add(SessionColumn::ProviderId.eq(party_id)),
            )
            .filter(SessionColumn::Status.is_in(Self::open_statuses()))
            .order_by_asc(SessionColumn::CreatedAt)
            .all(self.conn())
            .await?;

        Self::into_sessions(rows)
    }

    async fn update(&self, session: &Session) -> Result<Session> {
        let expected = session.version();
        let mut next = session.clone();
        next.version = expected + 1;

        let mut row = SessionRow::try_from(&next)?.into_active_model().reset_all();
        // Identity columns never change after creation.
        row.not_set(SessionColumn::Id);
        row.not_set(SessionColumn::RequesterId);
        row.not_set(SessionColumn::ProviderId);
        row.not_set(SessionColumn::Kind);
        row.not_set(SessionColumn::CreatedAt);

        let result = SessionEntity::update_many()
            .set(row)
            .filter(SessionColumn::Id.eq(session.id()))
            .filter(SessionColumn::Version.eq(expected))
            .exec(self.conn())
            .await?;

        if result.rows_affected == 0 {
            return match self.get_by_id(session.id()).await? {
                Some(_) => Err(AppError::VersionConflict {
                    id: session.id().to_string(),
                    expected,
                }),
                None => Err(AppError::SessionNotFound {
                    id: session.id().to_string(),
                }),
            };
        }

        Ok(next)
    }

    async fn list_billable(&self) -> Result<Vec<Session>> {
        let rows = SessionEntity::find()
            .filter(SessionColumn::Status.eq(SessionStatus::Active.as_str()))
            .filter(SessionColumn::RequesterJoined.eq(true))
            .filter(SessionColumn::ProviderJoined.eq(true))
            .order_by_asc(SessionColumn::CreatedAt)
            .all(self.conn())
            .await?;

        Self::into_sessions(rows)
    }

    async fn list_open(&self) -> Result<Vec<Session>> {
        let rows = SessionEntity::find()
            .filter(SessionColumn::Status.is_in(Self::open_statuses()))
            .order_by_asc(SessionColumn::CreatedAt)
            .all(self.conn())
            .await?;

        Self::into_sessions(rows)
    }

    async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }
}
