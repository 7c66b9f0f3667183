//! Wallet ledger clients
//!
//! The ledger is the source of truth for balances. Every debit carries an
//! idempotency key; a ledger that already applied a key returns the current
//! balance instead of debiting again.

use crate::config::WalletConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// One debit against a requester's wallet
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebitRequest {
    pub account_id: String,
    pub amount: Decimal,
    /// Session being paid for
    pub service_ref: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DebitOutcome {
    Debited { new_balance: Decimal },
    /// Nothing was debited
    InsufficientFunds,
}

#[async_trait]
pub trait WalletLedger: Send + Sync {
    /// Debit the full amount or nothing.
    ///
    /// Transport failures and timeouts are errors, never `InsufficientFunds`.
    async fn debit(&self, request: &DebitRequest) -> Result<DebitOutcome>;
}

/// Client for the wallet HTTP service
pub struct HttpWalletLedger {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DebitResponse {
    balance: Decimal,
}

impl HttpWalletLedger {
    pub fn new(config: &WalletConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| AppError::Configuration {
                message: "wallet.base_url is required for the http wallet".into(),
            })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create wallet HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl WalletLedger for HttpWalletLedger {
    async fn debit(&self, request: &DebitRequest) -> Result<DebitOutcome> {
        let url = format!("{}/accounts/{}/debits", self.base_url, request.account_id);

        let mut builder = self
            .client
            .post(&url)
            .header("Idempotency-Key", &request.idempotency_key)
            .json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| AppError::Wallet {
            message: format!("Debit request failed: {}", e),
        })?;

        match response.status() {
            StatusCode::PAYMENT_REQUIRED => {
                debug!(account_id = %request.account_id, "Wallet reported insufficient funds");
                Ok(DebitOutcome::InsufficientFunds)
            }
            status if status.is_success() => {
                let body: DebitResponse = response.json().await.map_err(|e| AppError::Wallet {
                    message: format!("Failed to parse debit response: {}", e),
                })?;
                Ok(DebitOutcome::Debited {
                    new_balance: body.balance,
                })
            }
            status if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => {
                let body = response.text().await.unwrap_or_default();
                Err(AppError::Wallet {
                    message: format!("Wallet error {}: {}", status, body),
                })
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                warn!(status = %status, body = %body, "Wallet refused debit");
                Err(AppError::Internal {
                    message: format!("Wallet refused debit with {}: {}", status, body),
                })
            }
        }
    }
}

#[derive(Default)]
struct MemoryWalletState {
    balances: HashMap<String, Decimal>,
    applied: HashSet<String>,
    failures_left: u32,
}

/// In-memory ledger for tests and local runs
pub struct MemoryWallet {
    state: Mutex<MemoryWalletState>,
    initial_balance: Decimal,
}

impl MemoryWallet {
    /// Unknown accounts start with `initial_balance`
    pub fn new(initial_balance: Decimal) -> Self {
        Self {
            state: Mutex::new(MemoryWalletState::default()),
            initial_balance,
        }
    }

    pub fn set_balance(&self, account_id: &str, balance: Decimal) {
        if let Ok(mut state) = self.state.lock() {
            state.balances.insert(account_id.to_string(), balance);
        }
    }

    pub fn balance_of(&self, account_id: &str) -> Decimal {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.balances.get(account_id).copied())
            .unwrap_or(self.initial_balance)
    }

    /// Make the next `count` debits fail as if the service were unreachable
    pub fn fail_next(&self, count: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.failures_left = count;
        }
    }

    /// Number of distinct debits applied
    pub fn applied_count(&self) -> usize {
        self.state.lock().map(|s| s.applied.len()).unwrap_or(0)
    }
}

#[async_trait]
impl WalletLedger for MemoryWallet {
    async fn debit(&self, request: &DebitRequest) -> Result<DebitOutcome> {
        let mut state = self.state.lock().map_err(|_| AppError::Internal {
            message: "wallet state poisoned".into(),
        })?;

        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(AppError::Wallet {
                message: "wallet unavailable".into(),
            });
        }

        let initial = self.initial_balance;
        let balance = *state
            .balances
            .entry(request.account_id.clone())
            .or_insert(initial);

        if state.applied.contains(&request.idempotency_key) {
            return Ok(DebitOutcome::Debited {
                new_balance: balance,
            });
        }

        if balance < request.amount {
            return Ok(DebitOutcome::InsufficientFunds);
        }

        let new_balance = balance - request.amount;
        state
            .balances
            .insert(request.account_id.clone(), new_balance);
        state.applied.insert(request.idempotency_key.clone());

        Ok(DebitOutcome::Debited { new_balance })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn debit(key: &str, amount: Decimal) -> DebitRequest {
        DebitRequest {
            account_id: "r-1".into(),
            amount,
            service_ref: "s-1".into(),
            idempotency_key: key.into(),
        }
    }

    #[tokio::test]
    async fn test_debits_all_or_nothing() {
        let wallet = MemoryWallet::new(dec!(0));
        wallet.set_balance("r-1", dec!(5));

        let first = wallet.debit(&debit("s-1:1-2", dec!(4))).await.unwrap();
        assert_eq!(first, DebitOutcome::Debited { new_balance: dec!(1) });

        let second = wallet.debit(&debit("s-1:3-3", dec!(2))).await.unwrap();
        assert_eq!(second, DebitOutcome::InsufficientFunds);
        assert_eq!(wallet.balance_of("r-1"), dec!(1));
    }

    #[tokio::test]
    async fn test_repeated_key_is_not_debited_twice() {
        let wallet = MemoryWallet::new(dec!(10));

        wallet.debit(&debit("s-1:1-1", dec!(2))).await.unwrap();
        let replay = wallet.debit(&debit("s-1:1-1", dec!(2))).await.unwrap();

        assert_eq!(replay, DebitOutcome::Debited { new_balance: dec!(8) });
        assert_eq!(wallet.applied_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let wallet = MemoryWallet::new(dec!(10));
        wallet.fail_next(1);

        let err = wallet.debit(&debit("k", dec!(1))).await.unwrap_err();
        assert!(err.is_transient());
        assert!(wallet.debit(&debit("k", dec!(1))).await.is_ok());
    }

    #[test]
    fn test_http_wallet_requires_base_url() {
        let config = WalletConfig {
            base_url: None,
            ..WalletConfig::default()
        };
        assert!(matches!(
            HttpWalletLedger::new(&config),
            Err(AppError::Configuration { .. })
        ));
    }

    #[test]
    fn test_debit_request_wire_shape() {
        let json = serde_json::to_value(debit("s-1:1-1", dec!(2))).unwrap();
        assert_eq!(json["accountId"], "r-1");
        assert_eq!(json["serviceRef"], "s-1");
        assert_eq!(json["idempotencyKey"], "s-1:1-1");
    }
}
