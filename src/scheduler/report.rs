//! Per-cycle summaries and the shared status read by the API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::info;

use super::state::SchedulerState;

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Cycle number, starting at 1.
    pub cycle: u64,
    /// When the cycle started.
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    /// Wall time spent.
    pub duration_ms: u64,
    /// Feeds that answered.
    pub feeds_ok: usize,
    /// Feeds that failed or timed out.
    pub feeds_failed: usize,
    /// Quotes stored.
    pub quotes_accepted: usize,
    /// Quotes refused.
    pub quotes_rejected: usize,
    /// Stale quotes purged at cycle start.
    pub stale_purged: usize,
    /// Opportunities found.
    pub opportunities: usize,
    /// Opportunities skipped as recently dispatched.
    pub deduplicated: usize,
    /// Plans sized and reserved.
    pub plans: usize,
    /// Opportunities that could not be sized or reserved.
    pub no_plan: usize,
    /// Plans submitted with at least one accepted leg.
    pub dispatched: usize,
    /// Legs accepted.
    pub legs_accepted: usize,
    /// Legs rejected or abandoned.
    pub legs_rejected: usize,
    /// Capital released back to the pool.
    pub released: Decimal,
    /// No feed answered; the loop backs off.
    pub fetch_failed: bool,
    /// Shutdown interrupted the cycle.
    pub cancelled: bool,
}

impl CycleReport {
    /// Log the summary.
    pub fn log(&self) {
        info!(
            cycle = self.cycle,
            duration_ms = self.duration_ms,
            feeds_ok = self.feeds_ok,
            feeds_failed = self.feeds_failed,
            quotes = self.quotes_accepted,
            opportunities = self.opportunities,
            plans = self.plans,
            dispatched = self.dispatched,
            legs_rejected = self.legs_rejected,
            cancelled = self.cancelled,
            "Cycle complete"
        );
    }
}

/// Serializable view of the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    /// Current phase.
    pub state: String,
    /// Completed cycles.
    pub cycles: u64,
    /// Consecutive all-feeds-failed cycles.
    pub consecutive_failures: u32,
    /// Most recent cycle.
    pub last_report: Option<CycleReport>,
    /// Fatal error, if halted.
    pub halted_reason: Option<String>,
}

#[derive(Debug)]
struct StatusInner {
    state: SchedulerState,
    cycles: u64,
    consecutive_failures: u32,
    last_report: Option<CycleReport>,
    halted_reason: Option<String>,
}

/// Shared, cheaply cloned scheduler status.
#[derive(Debug, Clone)]
pub struct SchedulerStatus {
    inner: Arc<RwLock<StatusInner>>,
    ready: Arc<AtomicBool>,
}

impl Default for SchedulerStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerStatus {
    /// Idle status with no cycles.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(StatusInner {
                state: SchedulerState::Idle,
                cycles: 0,
                consecutive_failures: 0,
                last_report: None,
                halted_reason: None,
            })),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Current phase.
    pub fn state(&self) -> SchedulerState {
        self.inner.read().state
    }

    pub(crate) fn set_state(&self, state: SchedulerState) {
        self.inner.write().state = state;
    }

    pub(crate) fn set_failures(&self, failures: u32) {
        self.inner.write().consecutive_failures = failures;
    }

    pub(crate) fn halt(&self, reason: String) {
        let mut inner = self.inner.write();
        inner.state = SchedulerState::Halted;
        inner.halted_reason = Some(reason);
    }

    /// Store a finished cycle; the first one marks the service ready.
    pub fn record(&self, report: CycleReport) {
        let mut inner = self.inner.write();
        inner.cycles = inner.cycles.max(report.cycle);
        inner.last_report = Some(report);
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Completed cycles.
    pub fn cycles(&self) -> u64 {
        self.inner.read().cycles
    }

    /// Most recent report.
    pub fn last_report(&self) -> Option<CycleReport> {
        self.inner.read().last_report.clone()
    }

    /// Whether at least one cycle has completed.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Force the ready flag.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Point-in-time copy for the API.
    pub fn view(&self) -> StatusView {
        let inner = self.inner.read();
        StatusView {
            state: inner.state.to_string(),
            cycles: inner.cycles,
            consecutive_failures: inner.consecutive_failures,
            last_report: inner.last_report.clone(),
            halted_reason: inner.halted_reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_report_marks_ready() {
        let status = SchedulerStatus::new();
        assert!(!status.is_ready());

        status.record(CycleReport {
            cycle: 1,
            ..Default::default()
        });

        assert!(status.is_ready());
        assert_eq!(status.cycles(), 1);
        assert_eq!(status.view().state, "Idle");
    }

    #[test]
    fn halt_is_visible() {
        let status = SchedulerStatus::new();
        status.halt("reserved exceeds total".into());
        let view = status.view();
        assert_eq!(view.state, "Halted");
        assert_eq!(view.halted_reason.as_deref(), Some("reserved exceeds total"));
    }
}
