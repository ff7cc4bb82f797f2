//! Prometheus metrics for the scheduling loop.
//!
//! This module provides metrics for:
//! - Feed fetch latency and failures
//! - Opportunity detection latency and counts
//! - Stake sizing and execution outcomes
//! - Bankroll gauges and cycle timing

use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::debug;

// === Metric Name Constants ===

/// Feed fetch latency metric name.
pub const METRIC_FEED_FETCH_LATENCY: &str = "feed_fetch_latency_ms";
/// Opportunity detection latency metric name.
pub const METRIC_DETECTION_LATENCY: &str = "opportunity_detection_latency_ms";
/// Full cycle latency metric name.
pub const METRIC_CYCLE_LATENCY: &str = "cycle_latency_ms";
/// Execution submit latency metric name.
pub const METRIC_EXECUTION_LATENCY: &str = "execution_submit_latency_ms";
/// Feed failures counter metric name.
pub const METRIC_FEED_FAILURES: &str = "feed_failures_total";
/// Quotes ingested counter metric name.
pub const METRIC_QUOTES_INGESTED: &str = "quotes_ingested_total";
/// Quotes rejected counter metric name.
pub const METRIC_QUOTES_REJECTED: &str = "quotes_rejected_total";
/// Opportunities detected counter metric name.
pub const METRIC_OPPORTUNITIES_DETECTED: &str = "opportunities_detected_total";
/// Plans sized counter metric name.
pub const METRIC_PLANS_SIZED: &str = "stake_plans_total";
/// No-plan counter metric name.
pub const METRIC_NO_PLAN: &str = "stake_no_plan_total";
/// Accepted legs counter metric name.
pub const METRIC_LEGS_ACCEPTED: &str = "legs_accepted_total";
/// Rejected legs counter metric name.
pub const METRIC_LEGS_REJECTED: &str = "legs_rejected_total";
/// Cycles completed counter metric name.
pub const METRIC_CYCLES: &str = "cycles_total";
/// Backoff entries counter metric name.
pub const METRIC_BACKOFFS: &str = "backoffs_total";
/// Total capital gauge metric name.
pub const METRIC_BANKROLL_TOTAL: &str = "bankroll_total";
/// Reserved capital gauge metric name.
pub const METRIC_BANKROLL_RESERVED: &str = "bankroll_reserved";
/// Odds API calls counter metric name.
pub const METRIC_API_CALLS: &str = "odds_api_calls_total";
/// Odds API remaining quota gauge metric name.
pub const METRIC_API_REMAINING: &str = "odds_api_requests_remaining";

/// Initialize all metric descriptions.
/// Call this once at startup to register metrics with descriptions.
pub fn init_metrics() {
    // Latency histograms
    describe_histogram!(METRIC_FEED_FETCH_LATENCY, "Odds feed fetch latency in milliseconds");
    describe_histogram!(
        METRIC_DETECTION_LATENCY,
        "Time to scan a snapshot for arbitrage in milliseconds"
    );
    describe_histogram!(METRIC_CYCLE_LATENCY, "Scheduler cycle latency in milliseconds");
    describe_histogram!(
        METRIC_EXECUTION_LATENCY,
        "Execution client submit latency in milliseconds"
    );

    // Counters
    describe_counter!(METRIC_FEED_FAILURES, "Total number of failed or timed out feed fetches");
    describe_counter!(METRIC_QUOTES_INGESTED, "Total number of quotes accepted by the store");
    describe_counter!(METRIC_QUOTES_REJECTED, "Total number of malformed quotes dropped");
    describe_counter!(
        METRIC_OPPORTUNITIES_DETECTED,
        "Total number of arbitrage opportunities detected"
    );
    describe_counter!(METRIC_PLANS_SIZED, "Total number of stake plans produced");
    describe_counter!(METRIC_NO_PLAN, "Total number of opportunities that could not be sized");
    describe_counter!(METRIC_LEGS_ACCEPTED, "Total number of legs accepted by execution");
    describe_counter!(METRIC_LEGS_REJECTED, "Total number of legs rejected by execution");
    describe_counter!(METRIC_CYCLES, "Total number of scheduler cycles");
    describe_counter!(METRIC_BACKOFFS, "Total number of backoff periods entered");
    describe_counter!(METRIC_API_CALLS, "Total number of odds API requests sent");

    // Gauges
    describe_gauge!(METRIC_BANKROLL_TOTAL, "Total capital held by the ledger");
    describe_gauge!(METRIC_BANKROLL_RESERVED, "Capital reserved for open legs");
    describe_gauge!(METRIC_API_REMAINING, "Requests left on the last odds API key used");

    debug!("Metrics initialized");
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Record one feed fetch.
pub fn record_feed_fetch(start: Instant, feed: &str, ok: bool) {
    histogram!(METRIC_FEED_FETCH_LATENCY, "feed" => feed.to_string()).record(elapsed_ms(start));
    if !ok {
        counter!(METRIC_FEED_FAILURES, "feed" => feed.to_string()).increment(1);
    }
}

/// Record a detection pass.
pub fn record_detection(start: Instant, found: usize) {
    histogram!(METRIC_DETECTION_LATENCY).record(elapsed_ms(start));
    counter!(METRIC_OPPORTUNITIES_DETECTED).increment(found as u64);
}

/// Record ingestion results.
pub fn record_ingest(accepted: usize, rejected: usize) {
    counter!(METRIC_QUOTES_INGESTED).increment(accepted as u64);
    counter!(METRIC_QUOTES_REJECTED).increment(rejected as u64);
}

/// Record execution submit latency.
pub fn record_execution(start: Instant, accepted: usize, rejected: usize) {
    histogram!(METRIC_EXECUTION_LATENCY).record(elapsed_ms(start));
    counter!(METRIC_LEGS_ACCEPTED).increment(accepted as u64);
    counter!(METRIC_LEGS_REJECTED).increment(rejected as u64);
}

/// Update bankroll gauges.
pub fn record_ledger(total: Decimal, reserved: Decimal) {
    gauge!(METRIC_BANKROLL_TOTAL).set(total.to_f64().unwrap_or_default());
    gauge!(METRIC_BANKROLL_RESERVED).set(reserved.to_f64().unwrap_or_default());
}

/// Record one odds API request and the quota it reported, if any.
pub fn record_api_call(remaining: Option<u64>) {
    counter!(METRIC_API_CALLS).increment(1);
    if let Some(remaining) = remaining {
        gauge!(METRIC_API_REMAINING).set(remaining as f64);
    }
}

/// Increment plans sized counter.
pub fn inc_plans_sized() {
    counter!(METRIC_PLANS_SIZED).increment(1);
}

/// Increment no-plan counter.
pub fn inc_no_plan(reason: &'static str) {
    counter!(METRIC_NO_PLAN, "reason" => reason).increment(1);
}

/// Increment cycles counter.
pub fn inc_cycles() {
    counter!(METRIC_CYCLES).increment(1);
}

/// Increment backoff counter.
pub fn inc_backoffs() {
    counter!(METRIC_BACKOFFS).increment(1);
}

/// RAII guard for timing operations.
/// Automatically records latency when dropped.
pub struct LatencyTimer {
    start: Instant,
    metric_name: &'static str,
}

impl LatencyTimer {
    /// Create a new latency timer for the given metric.
    pub fn new(metric_name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            metric_name,
        }
    }

    /// Get elapsed time in milliseconds (without recording).
    pub fn elapsed_ms(&self) -> f64 {
        elapsed_ms(self.start)
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        histogram!(self.metric_name).record(elapsed_ms(self.start));
    }
}

/// Create a latency timer for one scheduler cycle.
pub fn timer_cycle() -> LatencyTimer {
    LatencyTimer::new(METRIC_CYCLE_LATENCY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn latency_timer_measures_time() {
        let timer = LatencyTimer::new("test_metric");
        sleep(Duration::from_millis(10));
        assert!(timer.elapsed_ms() >= 9.0);
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_ledger(dec!(100), dec!(25.5));
        record_detection(Instant::now(), 3);
        inc_no_plan("below_min_outlay");
    }
}
