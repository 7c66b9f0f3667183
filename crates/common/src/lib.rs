//! Parley Common Library
//!
//! Core of the Parley session service:
//! - Session domain model and transition table
//! - Session engine (availability matching, state machine, join coordination)
//! - Billing scheduler with wallet ledger and rate table clients
//! - Session store abstraction (Postgres and in-memory)
//! - Error types, configuration, metrics

pub mod billing;
pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod events;
pub mod locks;
pub mod metrics;
pub mod resilience;
pub mod session;

// Re-export commonly used types
pub use clock::{Clock, SystemClock};
pub use config::AppConfig;
pub use db::SessionStore;
pub use engine::{EngineContext, SessionEngine};
pub use errors::{AppError, Result};
pub use events::{EventSink, SessionEvent};
pub use session::{Actor, CloseReason, Party, Session, SessionKind, SessionStatus};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
