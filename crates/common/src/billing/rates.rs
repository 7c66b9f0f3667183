//! Per-minute rate lookup

use crate::cache::{keys, Cache};
use crate::config::RatesConfig;
use crate::errors::{AppError, Result};
use crate::session::SessionKind;
use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Rate per minute for a provider and session kind
#[async_trait]
pub trait RateTable: Send + Sync {
    async fn rate_per_minute(&self, provider_id: &str, kind: SessionKind) -> Result<Decimal>;
}

/// Rates from configuration, with optional per-provider overrides
#[derive(Debug, Clone)]
pub struct StaticRateTable {
    defaults: HashMap<SessionKind, Decimal>,
    overrides: HashMap<String, HashMap<SessionKind, Decimal>>,
}

impl StaticRateTable {
    pub fn from_config(config: &RatesConfig) -> Self {
        let defaults = HashMap::from([
            (SessionKind::Text, config.text),
            (SessionKind::Audio, config.audio),
            (SessionKind::Video, config.video),
        ]);
        Self {
            defaults,
            overrides: config.providers.clone(),
        }
    }

    /// Same rate for every kind
    pub fn flat(rate: Decimal) -> Self {
        let defaults = [SessionKind::Text, SessionKind::Audio, SessionKind::Video]
            .into_iter()
            .map(|kind| (kind, rate))
            .collect();
        Self {
            defaults,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, provider_id: &str, kind: SessionKind, rate: Decimal) -> Self {
        self.overrides
            .entry(provider_id.to_string())
            .or_default()
            .insert(kind, rate);
        self
    }

    fn lookup(&self, provider_id: &str, kind: SessionKind) -> Result<Decimal> {
        let rate = self
            .overrides
            .get(provider_id)
            .and_then(|rates| rates.get(&kind))
            .or_else(|| self.defaults.get(&kind))
            .copied()
            .ok_or_else(|| AppError::Pricing {
                message: format!("no rate configured for {}", kind),
            })?;
        ensure_positive(rate, provider_id, kind)
    }
}

#[async_trait]
impl RateTable for StaticRateTable {
    async fn rate_per_minute(&self, provider_id: &str, kind: SessionKind) -> Result<Decimal> {
        self.lookup(provider_id, kind)
    }
}

fn ensure_positive(rate: Decimal, provider_id: &str, kind: SessionKind) -> Result<Decimal> {
    if rate <= Decimal::ZERO {
        return Err(AppError::Configuration {
            message: format!("rate for {} {} must be positive, got {}", provider_id, kind, rate),
        });
    }
    Ok(rate)
}

/// Rates from the pricing service; falls back to static rates on 404
pub struct HttpRateTable {
    client: reqwest::Client,
    base_url: String,
    fallback: StaticRateTable,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RateResponse {
    rate_per_minute: Decimal,
}

impl HttpRateTable {
    pub fn new(base_url: &str, timeout: Duration, fallback: StaticRateTable) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create pricing HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            fallback,
        })
    }
}

#[async_trait]
impl RateTable for HttpRateTable {
    async fn rate_per_minute(&self, provider_id: &str, kind: SessionKind) -> Result<Decimal> {
        let url = format!("{}/providers/{}/rates/{}", self.base_url, provider_id, kind);

        let response = self.client.get(&url).send().await.map_err(|e| AppError::Pricing {
            message: format!("Rate request failed: {}", e),
        })?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(provider_id = %provider_id, kind = %kind, "No priced rate, using static");
            return self.fallback.lookup(provider_id, kind);
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Pricing {
                message: format!("Pricing error {}: {}", status, body),
            });
        }

        let body: RateResponse = response.json().await.map_err(|e| AppError::Pricing {
            message: format!("Failed to parse rate response: {}", e),
        })?;

        ensure_positive(body.rate_per_minute, provider_id, kind)
    }
}

/// Redis read-through cache in front of another table
pub struct CachedRateTable {
    inner: Arc<dyn RateTable>,
    cache: Arc<Cache>,
    ttl_secs: u64,
}

impl CachedRateTable {
    pub fn new(inner: Arc<dyn RateTable>, cache: Arc<Cache>, ttl_secs: u64) -> Self {
        Self {
            inner,
            cache,
            ttl_secs,
        }
    }
}

#[async_trait]
impl RateTable for CachedRateTable {
    async fn rate_per_minute(&self, provider_id: &str, kind: SessionKind) -> Result<Decimal> {
        self.cache
            .get_or_load(&keys::rate(provider_id, kind), self.ttl_secs, "rates", || {
                self.inner.rate_per_minute(provider_id, kind)
            })
            .await
    }
}
