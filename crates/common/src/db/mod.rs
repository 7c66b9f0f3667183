//! Session persistence for Parley
//!
//! Provides:
//! - The [`SessionStore`] abstraction the engine is written against
//! - A SeaORM/Postgres implementation with optimistic versioning
//! - An in-memory implementation with identical semantics
//! - Connection pool management

pub mod models;
mod memory;
mod repository;

pub use memory::MemorySessionStore;
pub use repository::PgSessionStore;

use crate::config::DatabaseConfig;
use crate::errors::{AppError, Result};
use crate::session::Session;
use async_trait::async_trait;
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use std::time::Duration;
use tracing::info;

/// Durable record of sessions and their transition logs.
///
/// `update` is a compare-and-swap: it succeeds only when the stored version
/// equals `session.version()` and returns the session with its new version.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session; fails if the id is taken
    async fn create(&self, session: &Session) -> Result<Session>;

    async fn get_by_id(&self, id: &str) -> Result<Option<Session>>;

    /// Sessions in pending/confirmed/active where the party plays either role
    async fn find_active_by_party(&self, party_id: &str) -> Result<Vec<Session>>;

    async fn update(&self, session: &Session) -> Result<Session>;

    /// Active sessions with both parties joined
    async fn list_billable(&self) -> Result<Vec<Session>>;

    /// All sessions in pending/confirmed/active
    async fn list_open(&self) -> Result<Vec<Session>>;

    async fn ping(&self) -> Result<()>;
}

/// Database connection pool wrapper
#[derive(Clone)]
pub struct DbPool {
    /// Primary connection
    pub primary: DatabaseConnection,
}

impl DbPool {
    /// Create a new database pool from configuration
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to session database...");

        let mut opts = ConnectOptions::new(&config.url);
        opts.max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .sqlx_logging(false);

        let primary = Database::connect(opts)
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Failed to connect to primary: {}", e),
            })?;

        info!("Database connection established");

        Ok(Self { primary })
    }

    pub fn conn(&self) -> &DatabaseConnection {
        &self.primary
    }

    /// Ping the database to check connectivity
    pub async fn ping(&self) -> Result<()> {
        use sea_orm::ConnectionTrait;

        self.primary
            .execute_unprepared("SELECT 1")
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Primary ping failed: {}", e),
            })?;

        Ok(())
    }
}
