//! Metered billing
//!
//! Provides:
//! - The wallet ledger abstraction with HTTP and in-memory implementations
//! - Rate tables (static, pricing service, Redis-cached)
//! - The billing scheduler that charges live sessions per elapsed minute

mod rates;
mod scheduler;
mod wallet;

pub use rates::{CachedRateTable, HttpRateTable, RateTable, StaticRateTable};
pub use scheduler::{BillingScheduler, SchedulerSettings, TickReport};
pub use wallet::{DebitOutcome, DebitRequest, HttpWalletLedger, MemoryWallet, WalletLedger};

use crate::cache::Cache;
use crate::config::{AppConfig, RateSource, WalletProvider};
use crate::errors::{AppError, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Build the configured wallet ledger
pub fn wallet_from_config(config: &AppConfig) -> Result<Arc<dyn WalletLedger>> {
    let wallet: Arc<dyn WalletLedger> = match config.wallet.provider {
        WalletProvider::Http => Arc::new(HttpWalletLedger::new(&config.wallet)?),
        WalletProvider::Memory => Arc::new(MemoryWallet::new(config.wallet.initial_balance)),
    };
    info!(provider = ?config.wallet.provider, "Wallet ledger configured");
    Ok(wallet)
}

/// Build the configured rate table, cached in Redis when a cache is given
pub fn rates_from_config(config: &AppConfig, cache: Option<Arc<Cache>>) -> Result<Arc<dyn RateTable>> {
    let fallback = StaticRateTable::from_config(&config.billing.rates);

    let table: Arc<dyn RateTable> = match config.billing.rate_source {
        RateSource::Static => return Ok(Arc::new(fallback)),
        RateSource::Http => {
            let url = config
                .billing
                .pricing_url
                .as_deref()
                .ok_or_else(|| AppError::Configuration {
                    message: "billing.pricing_url is required when rate_source = \"http\"".into(),
                })?;
            Arc::new(HttpRateTable::new(
                url,
                Duration::from_millis(config.wallet.timeout_ms),
                fallback,
            )?)
        }
    };

    Ok(match cache {
        Some(cache) => Arc::new(CachedRateTable::new(
            table,
            cache,
            config.billing.rate_cache_ttl_secs,
        )),
        None => table,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_rates_require_pricing_url() {
        let mut config = AppConfig::default();
        config.billing.rate_source = RateSource::Http;
        config.billing.pricing_url = None;
        assert!(matches!(
            rates_from_config(&config, None),
            Err(AppError::Configuration { .. })
        ));
    }

    #[test]
    fn test_memory_wallet_from_config() {
        let mut config = AppConfig::default();
        config.wallet.provider = WalletProvider::Memory;
        assert!(wallet_from_config(&config).is_ok());
    }
}
