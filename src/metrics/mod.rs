//! Metrics Module
//!
//! Prometheus-compatible metrics for the exchange core:
//! - order flow (submitted, rejected, cancelled)
//! - trade execution and traded value
//! - persistence queue health (batches, drops)
//! - sessions and per-symbol book depth

use crate::services::matching::types::{OrderKind, Side};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Instant;

/// Metric names as constants for consistency
pub mod names {
    pub const ORDERS_SUBMITTED_TOTAL: &str = "orders_submitted_total";
    pub const ORDERS_REJECTED_TOTAL: &str = "orders_rejected_total";
    pub const ORDERS_CANCELLED_TOTAL: &str = "orders_cancelled_total";
    pub const TRADES_EXECUTED_TOTAL: &str = "trades_executed_total";
    pub const TRADE_VALUE_CENTS_TOTAL: &str = "trade_value_cents_total";

    pub const PERSIST_EVENTS_DROPPED_TOTAL: &str = "persist_events_dropped_total";
    pub const PERSIST_BATCH_SIZE: &str = "persist_batch_size";
    pub const PERSIST_BATCH_DURATION_SECONDS: &str = "persist_batch_duration_seconds";

    pub const ACTIVE_SESSIONS: &str = "active_sessions";
    pub const BOOK_DEPTH: &str = "book_depth";
}

/// Label keys
pub mod labels {
    pub const SIDE: &str = "side";
    pub const KIND: &str = "kind";
    pub const SYMBOL: &str = "symbol";
    pub const REASON: &str = "reason";
}

/// Install the Prometheus recorder with an HTTP scrape endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full(names::PERSIST_BATCH_DURATION_SECONDS.to_string()),
            &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0],
        )?
        .install()
}

/// Record an accepted order submission.
pub fn record_order_submitted(side: Side, kind: OrderKind) {
    counter!(
        names::ORDERS_SUBMITTED_TOTAL,
        labels::SIDE => side.to_string(),
        labels::KIND => kind.to_string()
    )
    .increment(1);
}

/// Record an engine-side rejection with its reason.
pub fn record_order_rejected(reason: &'static str) {
    counter!(
        names::ORDERS_REJECTED_TOTAL,
        labels::REASON => reason
    )
    .increment(1);
}

/// Record a cancellation (client cancel, IOC/FOK remainder, band stop).
pub fn record_order_cancelled() {
    counter!(names::ORDERS_CANCELLED_TOTAL).increment(1);
}

/// Record a settled trade and the cash it moved.
pub fn record_trade_executed(value_cents: i64) {
    counter!(names::TRADES_EXECUTED_TOTAL).increment(1);
    counter!(names::TRADE_VALUE_CENTS_TOTAL).increment(value_cents.max(0) as u64);
}

/// Record a dropped persistence event (queue full).
pub fn record_persist_drop() {
    counter!(names::PERSIST_EVENTS_DROPPED_TOTAL).increment(1);
}

/// Record a flushed persistence batch.
pub fn record_persist_batch(size: usize, duration_secs: f64) {
    histogram!(names::PERSIST_BATCH_SIZE).record(size as f64);
    histogram!(names::PERSIST_BATCH_DURATION_SECONDS).record(duration_secs);
}

/// Track the live session count.
pub fn set_active_sessions(count: i64) {
    gauge!(names::ACTIVE_SESSIONS).set(count as f64);
}

/// Track per-symbol resting depth.
pub fn set_book_depth(symbol: &str, bids: i64, asks: i64) {
    gauge!(
        names::BOOK_DEPTH,
        labels::SYMBOL => symbol.to_string(),
        labels::SIDE => "buy"
    )
    .set(bids as f64);
    gauge!(
        names::BOOK_DEPTH,
        labels::SYMBOL => symbol.to_string(),
        labels::SIDE => "sell"
    )
    .set(asks as f64);
}

/// Timer for measuring durations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer() {
        let timer = Timer::new();
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(timer.elapsed_secs() >= 0.01);
    }

    #[test]
    fn test_metric_names() {
        assert_eq!(names::ORDERS_SUBMITTED_TOTAL, "orders_submitted_total");
        assert_eq!(names::TRADES_EXECUTED_TOTAL, "trades_executed_total");
        assert_eq!(names::BOOK_DEPTH, "book_depth");
    }
}
