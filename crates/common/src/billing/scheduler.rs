//! Billing scheduler
//!
//! Every tick re-reads billable sessions from the store, charges the whole
//! minutes elapsed since each session's last charge, and ends sessions whose
//! requester can no longer pay. The same pass expires sessions stuck waiting
//! for a confirmation or a join.

use super::rates::RateTable;
use super::wallet::{DebitOutcome, DebitRequest, WalletLedger};
use crate::config::AppConfig;
use crate::engine::{EngineContext, SessionStateMachine};
use crate::errors::{AppError, Result};
use crate::events::SessionEvent;
use crate::locks::session_key;
use crate::metrics;
use crate::resilience::{bounded, classify, retry_policy};
use crate::session::{Actor, CloseReason, Session, SessionStatus};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

/// Scheduler tuning
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    pub max_concurrent_charges: usize,
    /// Total retry time for one transient debit failure
    pub retry_budget: Duration,
    /// Upper bound on one wallet or pricing call
    pub call_timeout: Duration,
    /// Zero disables the rule
    pub confirm_timeout: chrono::Duration,
    /// Zero disables the rule
    pub join_timeout: chrono::Duration,
}

impl SchedulerSettings {
    /// Build from configuration, shrinking the retry budget so that one
    /// charge pass never holds a session lock longer than a caller waits for it.
    pub fn from_config(config: &AppConfig) -> Self {
        let call_timeout = Duration::from_millis(config.wallet.timeout_ms);
        let requested = Duration::from_millis(config.billing.retry_budget_ms);
        let limit = max_retry_budget(config.lock_timeout(), call_timeout, config.store_timeout());

        if requested > limit {
            warn!(
                requested_ms = requested.as_millis() as u64,
                limit_ms = limit.as_millis() as u64,
                "billing.retry_budget_ms does not fit inside sessions.lock_timeout_ms, clamping"
            );
        }

        Self {
            tick_interval: config.tick_interval(),
            max_concurrent_charges: config.billing.max_concurrent_charges.max(1),
            retry_budget: requested.min(limit),
            call_timeout,
            confirm_timeout: chrono::Duration::seconds(config.sessions.confirm_timeout_secs as i64),
            join_timeout: chrono::Duration::seconds(config.sessions.join_timeout_secs as i64),
        }
    }
}

/// Longest a charge pass holds the session lock: the reload and the rate
/// lookup, the window in which new minutes may still start, then one debit
/// and one accounting write, each retried for up to the budget plus a final
/// attempt.
fn charge_hold(budget: Duration, call_timeout: Duration, store_timeout: Duration) -> Duration {
    budget * 3 + call_timeout * 2 + store_timeout * 2
}

/// Largest retry budget whose worst-case hold stays under `lock_timeout`
fn max_retry_budget(lock_timeout: Duration, call_timeout: Duration, store_timeout: Duration) -> Duration {
    lock_timeout
        .saturating_sub(call_timeout * 2 + store_timeout * 2)
        .saturating_sub(Duration::from_millis(1))
        / 3
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub sessions_charged: usize,
    pub minutes_charged: i64,
    pub ended_insufficient_funds: usize,
    pub expired: usize,
    /// Left for a later tick: nothing due, lock busy or no longer billable
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChargeOutcome {
    Charged { minutes: i64 },
    NothingDue,
    NotBillable,
    /// Minutes paid before the wallet ran dry
    EndedInsufficientFunds { minutes: i64 },
    Failed,
}

pub struct BillingScheduler {
    ctx: EngineContext,
    machine: Arc<SessionStateMachine>,
    wallet: Arc<dyn WalletLedger>,
    rates: Arc<dyn RateTable>,
    settings: SchedulerSettings,
}

impl BillingScheduler {
    pub fn new(
        ctx: EngineContext,
        machine: Arc<SessionStateMachine>,
        wallet: Arc<dyn WalletLedger>,
        rates: Arc<dyn RateTable>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            ctx,
            machine,
            wallet,
            rates,
            settings,
        }
    }

    /// Tick until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_ms = self.settings.tick_interval.as_millis() as u64,
            "Billing scheduler started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(report) if report != TickReport::default() => {
                            info!(?report, "Billing tick finished");
                        }
                        Ok(_) => debug!("Billing tick found nothing to do"),
                        Err(e) => error!(error = %e, "Billing tick failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Billing scheduler stopped");
    }

    /// One pass over live sessions
    pub async fn tick(&self) -> Result<TickReport> {
        let started = Instant::now();
        let mut report = TickReport::default();

        let billable = bounded(
            "list billable sessions",
            self.ctx.store_timeout,
            self.ctx.store.list_billable(),
        )
        .await?;

        let outcomes: Vec<ChargeOutcome> = stream::iter(billable)
            .map(|session| async move { self.charge(session.id()).await })
            .buffer_unordered(self.settings.max_concurrent_charges)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                ChargeOutcome::Charged { minutes } => {
                    report.sessions_charged += 1;
                    report.minutes_charged += minutes;
                }
                ChargeOutcome::EndedInsufficientFunds { minutes } => {
                    report.ended_insufficient_funds += 1;
                    report.minutes_charged += minutes;
                }
                ChargeOutcome::NothingDue | ChargeOutcome::NotBillable => report.skipped += 1,
                ChargeOutcome::Failed => report.failed += 1,
            }
        }

        // Charges above already happened; a failed sweep must not hide them.
        match self.sweep_expired().await {
            Ok(expired) => report.expired = expired,
            Err(e) => warn!(error = %e, "Expiry sweep failed, retrying next tick"),
        }

        metrics::record_billing_tick(started.elapsed().as_secs_f64());
        Ok(report)
    }

    async fn charge(&self, session_id: &str) -> ChargeOutcome {
        match self.charge_session(session_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Charge failed, retrying next tick");
                ChargeOutcome::Failed
            }
        }
    }

    #[instrument(skip(self))]
    async fn charge_session(&self, session_id: &str) -> Result<ChargeOutcome> {
        let _guard = self.ctx.locks.acquire(&session_key(session_id)).await?;

        // Re-read under the lock: the session may have ended since listing.
        let mut session = self.ctx.load(session_id).await?;
        if !session.is_billable() {
            return Ok(ChargeOutcome::NotBillable);
        }

        let started = Instant::now();
        let now = self.ctx.clock.now();
        let due = session.billing().unbilled_minutes(now);
        if due < 1 {
            return Ok(ChargeOutcome::NothingDue);
        }

        let rate = bounded(
            "rate lookup",
            self.settings.call_timeout,
            self.rates.rate_per_minute(session.provider_id(), session.kind()),
        )
        .await?;

        // One debit per minute, each under the key of that minute, recorded
        // before the next one starts. A debit whose accounting write failed
        // is replayed under the same key by a later tick.
        let mut charged = 0;
        let mut balance = None;
        while charged < due {
            if charged > 0 && started.elapsed() >= self.settings.retry_budget {
                debug!(remaining = due - charged, "Charge window used up, rest left for next tick");
                break;
            }

            let request = DebitRequest {
                account_id: session.requester_id().to_string(),
                amount: rate,
                service_ref: session.id().to_string(),
                idempotency_key: session.billing().next_minute_key(session.id()),
            };

            match self.debit_with_retry(&request).await {
                Ok(DebitOutcome::Debited { new_balance }) => {
                    session.billing.record_charge(1, rate);
                    session.updated_at = now;
                    session = match self.save_with_retry(&session).await {
                        Ok(saved) => saved,
                        Err(e) => {
                            self.announce_charge(&session, charged, balance);
                            return Err(e);
                        }
                    };
                    charged += 1;
                    balance = Some(new_balance);
                }
                Ok(DebitOutcome::InsufficientFunds) => {
                    metrics::record_debit_failure("insufficient_funds");
                    self.announce_charge(&session, charged, balance);
                    let unpaid = due - charged;
                    self.end_for_funds(session, unpaid, rate * Decimal::from(unpaid), now)
                        .await?;
                    return Ok(ChargeOutcome::EndedInsufficientFunds { minutes: charged });
                }
                Err(e) => {
                    metrics::record_debit_failure(if e.is_transient() { "unavailable" } else { "refused" });
                    self.announce_charge(&session, charged, balance);
                    return Err(e);
                }
            }
        }

        self.announce_charge(&session, charged, balance);
        Ok(ChargeOutcome::Charged { minutes: charged })
    }

    /// Tell the requester what this pass charged
    fn announce_charge(&self, session: &Session, minutes: i64, balance: Option<Decimal>) {
        let Some(new_balance) = balance else {
            return;
        };
        if minutes < 1 {
            return;
        }

        self.ctx.events.send(
            session.requester_id(),
            &SessionEvent::BillingTick {
                session_id: session.id().to_string(),
                minutes_charged: minutes,
                new_balance,
            },
        );
        metrics::record_minutes_charged(session.kind(), minutes);
        debug!(minutes, new_balance = %new_balance, "Session charged");
    }

    async fn debit_with_retry(&self, request: &DebitRequest) -> Result<DebitOutcome> {
        backoff::future::retry(retry_policy(self.settings.retry_budget), || async move {
            bounded("wallet debit", self.settings.call_timeout, self.wallet.debit(request))
                .await
                .map_err(classify)
        })
        .await
    }

    /// The debit already went through; the accounting write must follow it.
    async fn save_with_retry(&self, session: &Session) -> Result<Session> {
        backoff::future::retry(retry_policy(self.settings.retry_budget), || async move {
            match self.ctx.save(session).await {
                // Only this lock holder writes the session, so a conflict is not retryable.
                Err(e @ AppError::VersionConflict { .. }) => Err(backoff::Error::permanent(e)),
                other => other.map_err(classify),
            }
        })
        .await
        .inspect_err(|e| {
            error!(
                session_id = %session.id(),
                error = %e,
                "Debit applied but accounting write failed"
            );
        })
    }

    async fn end_for_funds(
        &self,
        mut session: Session,
        minutes: i64,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let entry = SessionStateMachine::apply(
            &mut session,
            SessionStatus::Ended,
            Actor::System,
            Some(CloseReason::InsufficientFunds),
            json!({ "minutesDue": minutes, "amountDue": amount }),
            now,
        )?;
        let saved = self.ctx.save(&session).await?;
        self.machine.announce(&saved, &entry);
        metrics::record_system_close(CloseReason::InsufficientFunds);

        info!(session_id = %saved.id(), "Session ended for insufficient funds");
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<usize> {
        let open = bounded(
            "list open sessions",
            self.ctx.store_timeout,
            self.ctx.store.list_open(),
        )
        .await?;

        let now = self.ctx.clock.now();
        let mut expired = 0;
        for session in open {
            if self.expiry_for(&session, now).is_none() {
                continue;
            }
            match self.expire(session.id()).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => warn!(session_id = %session.id(), error = %e, "Expiry failed"),
            }
        }
        Ok(expired)
    }

    /// Re-check and apply an expiry under the session lock
    async fn expire(&self, session_id: &str) -> Result<bool> {
        let _guard = self.ctx.locks.acquire(&session_key(session_id)).await?;
        let mut session = self.ctx.load(session_id).await?;

        let now = self.ctx.clock.now();
        let Some((to, reason)) = self.expiry_for(&session, now) else {
            return Ok(false);
        };

        let waited = (now - session.status_since()).num_seconds();
        let entry = SessionStateMachine::apply(
            &mut session,
            to,
            Actor::System,
            Some(reason),
            json!({ "waitedSecs": waited }),
            now,
        )?;
        let saved = self.ctx.save(&session).await?;
        self.machine.announce(&saved, &entry);
        metrics::record_system_close(reason);

        info!(session_id = %session_id, reason = %reason, "Stale session expired");
        Ok(true)
    }

    fn expiry_for(&self, session: &Session, now: DateTime<Utc>) -> Option<(SessionStatus, CloseReason)> {
        let confirm = self.settings.confirm_timeout;
        let join = self.settings.join_timeout;
        let enabled = |limit: chrono::Duration| limit > chrono::Duration::zero();

        match session.status() {
            SessionStatus::Pending if enabled(confirm) && now - session.created_at() >= confirm => {
                Some((SessionStatus::Rejected, CloseReason::ConfirmTimeout))
            }
            SessionStatus::Confirmed
                if enabled(join) && !session.fully_joined() && now - session.status_since() >= join =>
            {
                Some((SessionStatus::Rejected, CloseReason::JoinTimeout))
            }
            SessionStatus::Active
                if enabled(join) && !session.fully_joined() && now - session.created_at() >= join =>
            {
                Some((SessionStatus::Ended, CloseReason::JoinTimeout))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::{MemoryWallet, StaticRateTable};
    use crate::config::CreationMode;
    use crate::db::{MemorySessionStore, SessionStore};
    use crate::engine::testing::{harness, harness_with_mode, Harness};
    use crate::session::SessionKind;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Store whose writes or listings can be switched off
    struct FlakyStore {
        inner: Arc<MemorySessionStore>,
        fail_updates: AtomicBool,
        fail_listing_open: AtomicBool,
    }

    impl FlakyStore {
        fn wrap(inner: Arc<MemorySessionStore>) -> Arc<Self> {
            Arc::new(Self {
                inner,
                fail_updates: AtomicBool::new(false),
                fail_listing_open: AtomicBool::new(false),
            })
        }

        fn unavailable() -> AppError {
            AppError::DatabaseConnection {
                message: "connection reset".into(),
            }
        }
    }

    #[async_trait]
    impl SessionStore for FlakyStore {
        async fn create(&self, session: &Session) -> Result<Session> {
            self.inner.create(session).await
        }

        async fn get_by_id(&self, id: &str) -> Result<Option<Session>> {
            self.inner.get_by_id(id).await
        }

        async fn find_active_by_party(&self, party_id: &str) -> Result<Vec<Session>> {
            self.inner.find_active_by_party(party_id).await
        }

        async fn update(&self, session: &Session) -> Result<Session> {
            if self.fail_updates.load(Ordering::SeqCst) {
                return Err(Self::unavailable());
            }
            self.inner.update(session).await
        }

        async fn list_billable(&self) -> Result<Vec<Session>> {
            self.inner.list_billable().await
        }

        async fn list_open(&self) -> Result<Vec<Session>> {
            if self.fail_listing_open.load(Ordering::SeqCst) {
                return Err(Self::unavailable());
            }
            self.inner.list_open().await
        }

        async fn ping(&self) -> Result<()> {
            self.inner.ping().await
        }
    }

    fn scheduler_over(h: &Harness, store: Arc<FlakyStore>, wallet: Arc<MemoryWallet>) -> BillingScheduler {
        let mut ctx = h.engine.context().clone();
        ctx.store = store;
        BillingScheduler::new(
            ctx,
            h.engine.state_machine().clone(),
            wallet,
            Arc::new(StaticRateTable::flat(dec!(2))),
            settings(),
        )
    }

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            tick_interval: Duration::from_secs(15),
            max_concurrent_charges: 4,
            retry_budget: Duration::from_millis(300),
            call_timeout: Duration::from_secs(1),
            confirm_timeout: ChronoDuration::seconds(120),
            join_timeout: ChronoDuration::seconds(180),
        }
    }

    fn scheduler(h: &Harness, wallet: Arc<MemoryWallet>) -> BillingScheduler {
        BillingScheduler::new(
            h.engine.context().clone(),
            h.engine.state_machine().clone(),
            wallet,
            Arc::new(StaticRateTable::flat(dec!(2))),
            settings(),
        )
    }

    async fn live_session(h: &Harness) -> String {
        let session = h.engine.create_session("r", "p", SessionKind::Text).await.unwrap();
        let id = session.id().to_string();
        h.engine.confirm(&id, "p").await.unwrap();
        h.engine.join(&id, "r").await.unwrap();
        h.engine.join(&id, "p").await.unwrap();
        h.sink.clear();
        id
    }

    fn ticks_for(h: &Harness, party: &str) -> Vec<(i64, Decimal)> {
        h.sink
            .events_for(party)
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::BillingTick {
                    minutes_charged,
                    new_balance,
                    ..
                } => Some((minutes_charged, new_balance)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_charges_whole_minutes_and_ends_on_exhaustion() {
        let h = harness();
        let wallet = Arc::new(MemoryWallet::new(dec!(0)));
        wallet.set_balance("r", dec!(10));
        let billing = scheduler(&h, wallet.clone());
        let id = live_session(&h).await;

        // 30s in: nothing due yet
        h.clock.advance(ChronoDuration::seconds(30));
        let report = billing.tick().await.unwrap();
        assert_eq!(report.sessions_charged, 0);

        // 90s in: minute 1 charged, 30s carried over
        h.clock.advance(ChronoDuration::seconds(60));
        billing.tick().await.unwrap();
        // 150s in: minute 2 charged
        h.clock.advance(ChronoDuration::seconds(60));
        billing.tick().await.unwrap();

        assert_eq!(ticks_for(&h, "r"), vec![(1, dec!(8)), (1, dec!(6))]);
        assert!(ticks_for(&h, "p").is_empty());

        // 270s in: minutes 3 and 4 charged together
        h.clock.advance(ChronoDuration::seconds(120));
        let report = billing.tick().await.unwrap();
        assert_eq!(report.minutes_charged, 2);
        assert_eq!(wallet.balance_of("r"), dec!(2));

        // 330s in: minute 5 costs 2, balance 2 still covers it
        h.clock.advance(ChronoDuration::seconds(60));
        billing.tick().await.unwrap();
        assert_eq!(wallet.balance_of("r"), dec!(0));

        // 390s in: minute 6 cannot be paid
        h.clock.advance(ChronoDuration::seconds(60));
        h.sink.clear();
        let report = billing.tick().await.unwrap();
        assert_eq!(report.ended_insufficient_funds, 1);

        let ended = h.engine.get_session(&id).await.unwrap();
        assert_eq!(ended.status(), SessionStatus::Ended);
        assert_eq!(ended.ended_by(), Some(Actor::System));
        assert_eq!(ended.close_reason(), Some(CloseReason::InsufficientFunds));
        assert_eq!(ended.billing().billed_minutes, 5);
        assert_eq!(ended.billing().amount_charged, dec!(10));
        assert!(h.sink.events_for("r").contains(&SessionEvent::SessionEnded {
            session_id: id.clone(),
            ended_by: Actor::System,
            reason: CloseReason::InsufficientFunds,
        }));

        // No further billing once ended
        h.clock.advance(ChronoDuration::seconds(600));
        h.sink.clear();
        billing.tick().await.unwrap();
        assert!(ticks_for(&h, "r").is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_ticks_never_double_charge() {
        let h = harness();
        let wallet = Arc::new(MemoryWallet::new(dec!(100)));
        let billing = Arc::new(scheduler(&h, wallet.clone()));
        live_session(&h).await;
        h.clock.advance(ChronoDuration::seconds(185));

        let a = {
            let billing = billing.clone();
            tokio::spawn(async move { billing.tick().await.unwrap() })
        };
        let b = {
            let billing = billing.clone();
            tokio::spawn(async move { billing.tick().await.unwrap() })
        };
        let total = a.await.unwrap().minutes_charged + b.await.unwrap().minutes_charged;

        assert_eq!(total, 3);
        assert_eq!(wallet.balance_of("r"), dec!(94));
    }

    #[tokio::test]
    async fn test_manual_end_racing_tick_is_charged_at_most_once() {
        let h = harness();
        let wallet = Arc::new(MemoryWallet::new(dec!(100)));
        let billing = Arc::new(scheduler(&h, wallet.clone()));
        let id = live_session(&h).await;
        h.clock.advance(ChronoDuration::seconds(125));

        let engine = Arc::new(h.engine);
        let tick = {
            let billing = billing.clone();
            tokio::spawn(async move { billing.tick().await.unwrap() })
        };
        let end = {
            let engine = engine.clone();
            let id = id.clone();
            tokio::spawn(async move { engine.end(&id, "r").await })
        };
        tick.await.unwrap();
        end.await.unwrap().unwrap();

        // Either the tick ran first and billed two minutes, or the end won.
        let balance = wallet.balance_of("r");
        assert!(balance == dec!(96) || balance == dec!(100));

        h.clock.advance(ChronoDuration::seconds(300));
        billing.tick().await.unwrap();
        assert_eq!(wallet.balance_of("r"), balance);
    }

    #[tokio::test]
    async fn test_transient_wallet_failure_retries_within_tick() {
        let h = harness();
        let wallet = Arc::new(MemoryWallet::new(dec!(10)));
        wallet.fail_next(1);
        let billing = scheduler(&h, wallet.clone());
        live_session(&h).await;
        h.clock.advance(ChronoDuration::seconds(60));

        let report = billing.tick().await.unwrap();

        assert_eq!(report.sessions_charged, 1);
        assert_eq!(wallet.balance_of("r"), dec!(8));
    }

    #[tokio::test]
    async fn test_outage_is_not_insufficient_funds() {
        let h = harness();
        let wallet = Arc::new(MemoryWallet::new(dec!(10)));
        wallet.fail_next(1_000);
        let billing = scheduler(&h, wallet.clone());
        let id = live_session(&h).await;
        h.clock.advance(ChronoDuration::seconds(60));

        let report = billing.tick().await.unwrap();

        assert_eq!(report.failed, 1);
        let session = h.engine.get_session(&id).await.unwrap();
        assert_eq!(session.status(), SessionStatus::Active);
        assert_eq!(session.billing().billed_minutes, 0);

        // Recovered: the missed minute is picked up by the next tick.
        wallet.fail_next(0);
        h.clock.advance(ChronoDuration::seconds(60));
        let report = billing.tick().await.unwrap();
        assert_eq!(report.minutes_charged, 2);
    }

    #[tokio::test]
    async fn test_failed_accounting_write_is_not_charged_twice() {
        let h = harness();
        let store = FlakyStore::wrap(h.store.clone());
        let wallet = Arc::new(MemoryWallet::new(dec!(100)));
        let billing = scheduler_over(&h, store.clone(), wallet.clone());
        let id = live_session(&h).await;

        // Minute 1 is debited but its accounting write never lands.
        h.clock.advance(ChronoDuration::seconds(60));
        store.fail_updates.store(true, Ordering::SeqCst);
        let report = billing.tick().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(wallet.balance_of("r"), dec!(98));
        assert_eq!(h.engine.get_session(&id).await.unwrap().billing().billed_minutes, 0);

        // The replayed minute 1 carries its original key and is not debited again.
        store.fail_updates.store(false, Ordering::SeqCst);
        h.clock.advance(ChronoDuration::seconds(60));
        let report = billing.tick().await.unwrap();

        assert_eq!(report.minutes_charged, 2);
        assert_eq!(wallet.balance_of("r"), dec!(96));
        assert_eq!(wallet.applied_count(), 2);
        let session = h.engine.get_session(&id).await.unwrap();
        assert_eq!(session.billing().billed_minutes, 2);
        assert_eq!(session.billing().amount_charged, dec!(4));
    }

    #[tokio::test]
    async fn test_each_minute_is_debited_under_its_own_key() {
        let h = harness();
        let wallet = Arc::new(MemoryWallet::new(dec!(5)));
        let billing = scheduler(&h, wallet.clone());
        let id = live_session(&h).await;

        // Three minutes due, funds for two: the two are kept, then the session ends.
        h.clock.advance(ChronoDuration::seconds(185));
        let report = billing.tick().await.unwrap();

        assert_eq!(report.ended_insufficient_funds, 1);
        assert_eq!(report.minutes_charged, 2);
        assert_eq!(wallet.balance_of("r"), dec!(1));
        assert_eq!(ticks_for(&h, "r"), vec![(2, dec!(1))]);

        let ended = h.engine.get_session(&id).await.unwrap();
        assert_eq!(ended.billing().billed_minutes, 2);
        assert_eq!(ended.close_reason(), Some(CloseReason::InsufficientFunds));
    }

    #[tokio::test]
    async fn test_failed_sweep_keeps_charge_report() {
        let h = harness();
        let store = FlakyStore::wrap(h.store.clone());
        let wallet = Arc::new(MemoryWallet::new(dec!(100)));
        let billing = scheduler_over(&h, store.clone(), wallet);
        live_session(&h).await;

        h.clock.advance(ChronoDuration::seconds(60));
        store.fail_listing_open.store(true, Ordering::SeqCst);
        let report = billing.tick().await.unwrap();

        assert_eq!(report.sessions_charged, 1);
        assert_eq!(report.minutes_charged, 1);
        assert_eq!(report.expired, 0);
    }

    #[test]
    fn test_default_settings_fit_inside_lock_timeout() {
        let config = AppConfig::default();
        let settings = SchedulerSettings::from_config(&config);

        assert_eq!(settings.retry_budget, Duration::from_millis(config.billing.retry_budget_ms));
        let hold = charge_hold(settings.retry_budget, settings.call_timeout, config.store_timeout());
        assert!(hold < config.lock_timeout());
    }

    #[test]
    fn test_oversized_retry_budget_is_clamped() {
        let mut config = AppConfig::default();
        config.billing.retry_budget_ms = 60_000;
        let settings = SchedulerSettings::from_config(&config);

        assert!(settings.retry_budget < Duration::from_millis(60_000));
        let hold = charge_hold(settings.retry_budget, settings.call_timeout, config.store_timeout());
        assert!(hold < config.lock_timeout());

        // A lock timeout too short for any retry leaves no budget at all.
        config.sessions.lock_timeout_ms = 1_000;
        assert_eq!(SchedulerSettings::from_config(&config).retry_budget, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_sweep_expires_unconfirmed_and_unjoined_sessions() {
        let h = harness();
        let billing = scheduler(&h, Arc::new(MemoryWallet::new(dec!(10))));

        let unconfirmed = h.engine.create_session("r1", "p1", SessionKind::Text).await.unwrap();
        let unjoined = h.engine.create_session("r2", "p2", SessionKind::Text).await.unwrap();
        h.clock.advance(ChronoDuration::seconds(60));
        h.engine.confirm(unjoined.id(), "p2").await.unwrap();
        h.engine.join(unjoined.id(), "r2").await.unwrap();

        h.clock.advance(ChronoDuration::seconds(61));
        let report = billing.tick().await.unwrap();
        assert_eq!(report.expired, 1);
        let rejected = h.engine.get_session(unconfirmed.id()).await.unwrap();
        assert_eq!(rejected.status(), SessionStatus::Rejected);
        assert_eq!(rejected.rejected_by(), Some(Actor::System));
        assert_eq!(rejected.close_reason(), Some(CloseReason::ConfirmTimeout));
        for party in ["r1", "p1"] {
            assert!(h.sink.events_for(party).contains(&SessionEvent::SessionEnded {
                session_id: unconfirmed.id().to_string(),
                ended_by: Actor::System,
                reason: CloseReason::ConfirmTimeout,
            }));
        }

        h.clock.advance(ChronoDuration::seconds(120));
        let report = billing.tick().await.unwrap();
        assert_eq!(report.expired, 1);
        let rejected = h.engine.get_session(unjoined.id()).await.unwrap();
        assert_eq!(rejected.close_reason(), Some(CloseReason::JoinTimeout));
    }

    #[tokio::test]
    async fn test_sweep_ends_unjoined_immediate_session() {
        let h = harness_with_mode(CreationMode::Immediate);
        let billing = scheduler(&h, Arc::new(MemoryWallet::new(dec!(10))));
        let session = h.engine.create_session("r", "p", SessionKind::Audio).await.unwrap();
        h.engine.join(session.id(), "p").await.unwrap();

        h.clock.advance(ChronoDuration::seconds(181));
        billing.tick().await.unwrap();

        let ended = h.engine.get_session(session.id()).await.unwrap();
        assert_eq!(ended.status(), SessionStatus::Ended);
        assert_eq!(ended.ended_by(), Some(Actor::System));
        assert_eq!(ended.close_reason(), Some(CloseReason::JoinTimeout));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness();
        let billing = scheduler(&h, Arc::new(MemoryWallet::new(dec!(10))));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { billing.run(rx).await });
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }
}
