//! Metrics and observability utilities
//!
//! Prometheus metrics for the session lifecycle, billing and the realtime
//! gateway, all under a common prefix.

use crate::config::CreationMode;
use crate::session::{Actor, CloseReason, Party, SessionKind, SessionStatus};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all Parley metrics
pub const METRICS_PREFIX: &str = "parley";

/// Histogram buckets for HTTP request latency (in seconds)
pub const LATENCY_BUCKETS: &[f64] = &[
    0.001, // 1ms
    0.005, // 5ms
    0.010, // 10ms
    0.025, // 25ms
    0.050, // 50ms
    0.100, // 100ms
    0.250, // 250ms
    0.500, // 500ms
    1.000, // 1s
    2.500, // 2.5s
    5.000, // 5s
];

/// Buckets for a full billing pass; bounded by wallet latency
pub const TICK_BUCKETS: &[f64] = &[0.010, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Register all metric descriptions
pub fn register_metrics() {
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );

    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    // Session lifecycle
    describe_counter!(
        format!("{}_sessions_created_total", METRICS_PREFIX),
        Unit::Count,
        "Sessions created"
    );

    describe_counter!(
        format!("{}_session_create_conflicts_total", METRICS_PREFIX),
        Unit::Count,
        "Session creations refused because a party was busy"
    );

    describe_counter!(
        format!("{}_session_transitions_total", METRICS_PREFIX),
        Unit::Count,
        "Committed status transitions"
    );

    describe_counter!(
        format!("{}_session_joins_total", METRICS_PREFIX),
        Unit::Count,
        "First joins per party"
    );

    // Billing
    describe_counter!(
        format!("{}_billing_ticks_total", METRICS_PREFIX),
        Unit::Count,
        "Billing passes run"
    );

    describe_histogram!(
        format!("{}_billing_tick_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Duration of one billing pass"
    );

    describe_counter!(
        format!("{}_billing_minutes_charged_total", METRICS_PREFIX),
        Unit::Count,
        "Minutes successfully debited"
    );

    describe_counter!(
        format!("{}_billing_debit_failures_total", METRICS_PREFIX),
        Unit::Count,
        "Debits that did not go through"
    );

    describe_counter!(
        format!("{}_billing_sessions_ended_total", METRICS_PREFIX),
        Unit::Count,
        "Sessions closed by the system"
    );

    // Realtime
    describe_gauge!(
        format!("{}_realtime_connections", METRICS_PREFIX),
        Unit::Count,
        "Open WebSocket connections"
    );

    // Cache
    describe_counter!(
        format!("{}_cache_hits_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache hits"
    );

    describe_counter!(
        format!("{}_cache_misses_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache misses"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

pub fn record_session_created(kind: SessionKind, mode: CreationMode) {
    counter!(
        format!("{}_sessions_created_total", METRICS_PREFIX),
        "kind" => kind.as_str(),
        "mode" => mode.as_str()
    )
    .increment(1);
}

/// `party` is the side found busy
pub fn record_busy(party: &'static str) {
    counter!(
        format!("{}_session_create_conflicts_total", METRICS_PREFIX),
        "party" => party
    )
    .increment(1);
}

pub fn record_transition(from: Option<SessionStatus>, to: SessionStatus, actor: Actor) {
    counter!(
        format!("{}_session_transitions_total", METRICS_PREFIX),
        "from" => from.map(|s| s.as_str()).unwrap_or("none"),
        "to" => to.as_str(),
        "actor" => actor.as_str()
    )
    .increment(1);
}

pub fn record_join(party: Party) {
    counter!(
        format!("{}_session_joins_total", METRICS_PREFIX),
        "party" => party.as_str()
    )
    .increment(1);
}

/// Helper to record one billing pass
pub fn record_billing_tick(duration_secs: f64) {
    counter!(format!("{}_billing_ticks_total", METRICS_PREFIX)).increment(1);
    histogram!(format!("{}_billing_tick_duration_seconds", METRICS_PREFIX)).record(duration_secs);
}

pub fn record_minutes_charged(kind: SessionKind, minutes: i64) {
    counter!(
        format!("{}_billing_minutes_charged_total", METRICS_PREFIX),
        "kind" => kind.as_str()
    )
    .increment(minutes.max(0) as u64);
}

pub fn record_debit_failure(reason: &'static str) {
    counter!(
        format!("{}_billing_debit_failures_total", METRICS_PREFIX),
        "reason" => reason
    )
    .increment(1);
}

pub fn record_system_close(reason: CloseReason) {
    counter!(
        format!("{}_billing_sessions_ended_total", METRICS_PREFIX),
        "reason" => reason.as_str()
    )
    .increment(1);
}

pub fn set_realtime_connections(count: usize) {
    gauge!(format!("{}_realtime_connections", METRICS_PREFIX)).set(count as f64);
}

/// Helper to record cache metrics
pub fn record_cache(hit: bool, cache_name: &str) {
    if hit {
        counter!(
            format!("{}_cache_hits_total", METRICS_PREFIX),
            "cache" => cache_name.to_string()
        )
        .increment(1);
    } else {
        counter!(
            format!("{}_cache_misses_total", METRICS_PREFIX),
            "cache" => cache_name.to_string()
        )
        .increment(1);
    }
}
