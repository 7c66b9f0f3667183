//! Configuration management for Parley services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::session::SessionKind;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Session store configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Redis configuration (rate cache)
    #[serde(default)]
    pub redis: RedisConfig,

    /// Session lifecycle configuration
    #[serde(default)]
    pub sessions: SessionsConfig,

    /// Billing scheduler configuration
    #[serde(default)]
    pub billing: BillingConfig,

    /// Wallet ledger configuration
    #[serde(default)]
    pub wallet: WalletConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Postgres URL, or `memory://` for the in-process store
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Upper bound for a single store call, in milliseconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    /// Redis URL; caching is disabled when absent
    pub url: Option<String>,

    /// Key prefix for namespacing
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

/// How new sessions start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CreationMode {
    /// Created `pending`; the provider confirms explicitly
    Pending,
    /// Created `active`; metering starts once both parties join
    Immediate,
}

impl CreationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreationMode::Pending => "pending",
            CreationMode::Immediate => "immediate",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionsConfig {
    /// Initial status policy for new sessions
    #[serde(default = "default_creation_mode")]
    pub creation_mode: CreationMode,

    /// Length of generated session ids
    #[serde(default = "default_id_length")]
    pub id_length: usize,

    /// Maximum wait for a per-session or per-party lock, in milliseconds
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,

    /// Pending sessions older than this are rejected by the system
    #[serde(default = "default_confirm_timeout")]
    pub confirm_timeout_secs: u64,

    /// Sessions not fully joined this long after becoming joinable are closed
    #[serde(default = "default_join_timeout")]
    pub join_timeout_secs: u64,
}

/// Where per-minute rates come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateSource {
    Static,
    Http,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RatesConfig {
    #[serde(default = "default_text_rate")]
    pub text: Decimal,

    #[serde(default = "default_audio_rate")]
    pub audio: Decimal,

    #[serde(default = "default_video_rate")]
    pub video: Decimal,

    /// Per-provider overrides: provider id -> kind -> rate
    #[serde(default)]
    pub providers: HashMap<String, HashMap<SessionKind, Decimal>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BillingConfig {
    /// Run the billing scheduler in this process
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Seconds between ticks
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Sessions charged in parallel within one tick
    #[serde(default = "default_max_concurrent_charges")]
    pub max_concurrent_charges: usize,

    /// Total time spent retrying a transient debit failure within one tick
    #[serde(default = "default_retry_budget")]
    pub retry_budget_ms: u64,

    /// Rate table implementation
    #[serde(default = "default_rate_source")]
    pub rate_source: RateSource,

    /// Static rates (also the fallback when the pricing service has no entry)
    #[serde(default)]
    pub rates: RatesConfig,

    /// Pricing service base URL when `rate_source = "http"`
    pub pricing_url: Option<String>,

    /// Cache TTL for looked-up rates
    #[serde(default = "default_rate_cache_ttl")]
    pub rate_cache_ttl_secs: u64,
}

/// Wallet ledger implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletProvider {
    Http,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WalletConfig {
    #[serde(default = "default_wallet_provider")]
    pub provider: WalletProvider,

    /// Wallet service base URL
    pub base_url: Option<String>,

    /// Bearer token for the wallet service
    pub api_key: Option<String>,

    /// Upper bound for a single debit call, in milliseconds
    #[serde(default = "default_wallet_timeout")]
    pub timeout_ms: u64,

    /// Balance given to unknown accounts by the memory provider
    #[serde(default)]
    pub initial_balance: Decimal,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for logs
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Requests per second (global)
    #[serde(default = "default_rate_limit")]
    pub requests_per_second: u32,

    /// Burst capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 30 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_database_url() -> String { "memory://".to_string() }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_operation_timeout() -> u64 { 3000 }
fn default_key_prefix() -> String { "parley".to_string() }
fn default_creation_mode() -> CreationMode { CreationMode::Pending }
fn default_id_length() -> usize { 20 }
fn default_lock_timeout() -> u64 { 15_000 }
fn default_confirm_timeout() -> u64 { 120 }
fn default_join_timeout() -> u64 { 180 }
fn default_text_rate() -> Decimal { Decimal::new(200, 2) }
fn default_audio_rate() -> Decimal { Decimal::new(500, 2) }
fn default_video_rate() -> Decimal { Decimal::new(800, 2) }
fn default_tick_interval() -> u64 { 15 }
fn default_max_concurrent_charges() -> usize { 16 }
fn default_retry_budget() -> u64 { 1000 }
fn default_rate_source() -> RateSource { RateSource::Static }
fn default_rate_cache_ttl() -> u64 { 300 }
fn default_wallet_provider() -> WalletProvider { WalletProvider::Http }
fn default_wallet_timeout() -> u64 { 2000 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "parley".to_string() }
fn default_rate_limit() -> u32 { 200 }
fn default_burst() -> u32 { 400 }
fn default_enabled() -> bool { true }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            operation_timeout_ms: default_operation_timeout(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            creation_mode: default_creation_mode(),
            id_length: default_id_length(),
            lock_timeout_ms: default_lock_timeout(),
            confirm_timeout_secs: default_confirm_timeout(),
            join_timeout_secs: default_join_timeout(),
        }
    }
}

impl Default for RatesConfig {
    fn default() -> Self {
        Self {
            text: default_text_rate(),
            audio: default_audio_rate(),
            video: default_video_rate(),
            providers: HashMap::new(),
        }
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            tick_interval_secs: default_tick_interval(),
            max_concurrent_charges: default_max_concurrent_charges(),
            retry_budget_ms: default_retry_budget(),
            rate_source: default_rate_source(),
            rates: RatesConfig::default(),
            pricing_url: None,
            rate_cache_ttl_secs: default_rate_cache_ttl(),
        }
    }
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            provider: default_wallet_provider(),
            base_url: None,
            api_key: None,
            timeout_ms: default_wallet_timeout(),
            initial_balance: Decimal::ZERO,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rate_limit(),
            burst: default_burst(),
            enabled: default_enabled(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))

            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))

            // Load local overrides
            .add_source(File::with_name("config/local").required(false))

            // Load from environment variables with APP__ prefix
            // e.g., APP__BILLING__TICK_INTERVAL_SECS=5
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )

            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }

    /// Bound for a single store call
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.database.operation_timeout_ms)
    }

    /// Bound for waiting on a per-key lock
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.sessions.lock_timeout_ms)
    }

    /// Interval between billing ticks
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.billing.tick_interval_secs.max(1))
    }

    /// Whether the in-process store was selected
    pub fn uses_memory_store(&self) -> bool {
        self.database.url.starts_with("memory://")
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            redis: RedisConfig::default(),
            sessions: SessionsConfig::default(),
            billing: BillingConfig::default(),
            wallet: WalletConfig::default(),
            observability: ObservabilityConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}
