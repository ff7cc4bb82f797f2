//! The scheduling loop: fetch, detect, size, dispatch.
//!
//! One cycle runs at a time. Feeds are polled concurrently, each under its own
//! timeout; every later phase is sequential. Shutdown cancels in-flight
//! fetches and submissions, and any capital reserved by the cancelled cycle is
//! released before the cycle returns.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::report::{CycleReport, SchedulerStatus};
use super::state::{backoff_delay, SchedulerEvent, SchedulerState};
use crate::arbitrage::{detect, ArbitrageOpportunity, SeenOpportunities};
use crate::bankroll::{Ledger, LedgerPersistence, ReservationId};
use crate::config::{Config, QuietHours};
use crate::error::{BotError, FeedError, LedgerError};
use crate::feed::{OddsBatch, OddsFeed};
use crate::metrics;
use crate::odds::OddsStore;
use crate::trading::{ExecutionClient, OpenBets, StakePlan, StakeSizer};

/// Timing and threshold settings for the loop.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Interval between cycle starts.
    pub poll_interval: Duration,
    /// Per-feed fetch timeout.
    pub feed_timeout: Duration,
    /// First backoff delay.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
    /// Minimum edge for an opportunity.
    pub min_edge: Decimal,
    /// Quotes older than this are deleted at cycle start.
    pub quote_purge_after: Duration,
    /// Per-plan submit timeout.
    pub execution_timeout: Duration,
    /// Window for skipping repeated opportunities.
    pub dedupe_window: Duration,
    /// UTC hours without cycles.
    pub quiet_hours: Option<QuietHours>,
}

impl SchedulerSettings {
    /// Settings taken from the loaded configuration.
    pub fn from_config(config: &Config) -> Result<Self, BotError> {
        Ok(Self {
            poll_interval: config.poll_interval(),
            feed_timeout: config.feed_timeout(),
            backoff_base: config.backoff_base(),
            max_backoff: config.max_backoff(),
            min_edge: config.min_edge,
            quote_purge_after: config.quote_purge_after(),
            execution_timeout: config.execution_timeout(),
            dedupe_window: config.dedupe_window(),
            quiet_hours: config.quiet_hours().map_err(BotError::InvalidConfig)?,
        })
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        let config = Config::default();
        Self {
            poll_interval: config.poll_interval(),
            feed_timeout: config.feed_timeout(),
            backoff_base: config.backoff_base(),
            max_backoff: config.max_backoff(),
            min_edge: config.min_edge,
            quote_purge_after: config.quote_purge_after(),
            execution_timeout: config.execution_timeout(),
            dedupe_window: config.dedupe_window(),
            quiet_hours: None,
        }
    }
}

/// Drives fetch → detect → size → dispatch cycles.
pub struct Scheduler {
    settings: SchedulerSettings,
    feeds: Vec<Arc<dyn OddsFeed>>,
    store: Arc<OddsStore>,
    persistence: LedgerPersistence,
    sizer: StakeSizer,
    executor: Arc<dyn ExecutionClient>,
    open_bets: OpenBets,
    seen: Mutex<SeenOpportunities>,
    status: SchedulerStatus,
    cycles: AtomicU64,
    failures: AtomicU32,
    in_flight: tokio::sync::Mutex<()>,
}

impl Scheduler {
    /// Create a scheduler with no feeds.
    pub fn new(
        settings: SchedulerSettings,
        store: Arc<OddsStore>,
        persistence: LedgerPersistence,
        sizer: StakeSizer,
        executor: Arc<dyn ExecutionClient>,
    ) -> Self {
        let seen = Mutex::new(SeenOpportunities::new(settings.dedupe_window));
        Self {
            settings,
            feeds: Vec::new(),
            store,
            persistence,
            sizer,
            executor,
            open_bets: OpenBets::new(),
            seen,
            status: SchedulerStatus::new(),
            cycles: AtomicU64::new(0),
            failures: AtomicU32::new(0),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    /// Add a feed.
    pub fn with_feed(mut self, feed: Arc<dyn OddsFeed>) -> Self {
        self.feeds.push(feed);
        self
    }

    /// Share an existing open-bet book (e.g. with the API).
    pub fn with_open_bets(mut self, open_bets: OpenBets) -> Self {
        self.open_bets = open_bets;
        self
    }

    /// Share an existing status handle (e.g. with the API).
    pub fn with_status(mut self, status: SchedulerStatus) -> Self {
        self.status = status;
        self
    }

    /// Odds store.
    pub fn store(&self) -> &Arc<OddsStore> {
        &self.store
    }

    /// Ledger handle.
    pub fn ledger(&self) -> &Ledger {
        self.persistence.ledger()
    }

    /// Open bets created by dispatch.
    pub fn open_bets(&self) -> &OpenBets {
        &self.open_bets
    }

    /// Shared status.
    pub fn status(&self) -> &SchedulerStatus {
        &self.status
    }

    /// Consecutive cycles in which every feed failed.
    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Run cycles on the poll interval until `shutdown` is cancelled.
    ///
    /// Returns an error only for ledger corruption.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), BotError> {
        info!(
            feeds = self.feeds.len(),
            interval_secs = self.settings.poll_interval.as_secs(),
            min_edge = %self.settings.min_edge,
            "Scheduler started"
        );

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self.in_quiet_hours(OffsetDateTime::now_utc()) {
                debug!("Quiet hours, skipping cycle");
                continue;
            }

            let report = self.run_cycle(&shutdown).await?;
            if report.cancelled {
                break;
            }

            if report.fetch_failed {
                let attempt = self.consecutive_failures().saturating_sub(1);
                let delay = backoff_delay(self.settings.backoff_base, attempt, self.settings.max_backoff);
                metrics::inc_backoffs();
                warn!(attempt, delay_ms = delay.as_millis() as u64, "All feeds failed, backing off");

                let cancelled = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => true,
                    _ = tokio::time::sleep(delay) => false,
                };
                if cancelled {
                    self.advance(SchedulerEvent::Cancelled);
                    break;
                }
                self.advance(SchedulerEvent::BackoffElapsed);
                ticker.reset_immediately();
            }
        }

        if let Err(e) = self.persistence.persist().await {
            warn!(error = %e, "Failed to persist ledger on shutdown");
        }
        info!("Scheduler stopped");
        Ok(())
    }

    fn in_quiet_hours(&self, now: OffsetDateTime) -> bool {
        self.settings
            .quiet_hours
            .is_some_and(|quiet| quiet.contains(now.hour()))
    }

    /// Run exactly one cycle.
    ///
    /// Concurrent callers are serialized, so two cycles never overlap.
    #[instrument(skip_all)]
    pub async fn run_cycle(&self, shutdown: &CancellationToken) -> Result<CycleReport, BotError> {
        let _in_flight = self.in_flight.lock().await;
        let _timer = metrics::timer_cycle();
        let started = tokio::time::Instant::now();
        let mut report = CycleReport {
            cycle: self.cycles.fetch_add(1, Ordering::SeqCst) + 1,
            started_at: Some(OffsetDateTime::now_utc()),
            ..Default::default()
        };

        self.ledger().verify().map_err(|e| self.fail(e))?;
        self.advance(SchedulerEvent::Tick);

        // Fetching
        let now = OffsetDateTime::now_utc();
        report.stale_purged = self.store.purge_stale(self.settings.quote_purge_after, now);

        let results = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("Cycle cancelled during fetch");
                report.cancelled = true;
                self.advance(SchedulerEvent::Cancelled);
                return Ok(self.finish(report, started));
            }
            results = self.fetch_all() => results,
        };

        for (feed, result) in results {
            match result {
                Ok(batch) => {
                    report.feeds_ok += 1;
                    self.ingest(&feed, batch, &mut report);
                }
                Err(e) => {
                    report.feeds_failed += 1;
                    warn!(feed = %feed, error = %e, "Feed excluded from this cycle");
                }
            }
        }

        if report.feeds_ok == 0 && report.feeds_failed > 0 {
            let attempt = self.failures.fetch_add(1, Ordering::SeqCst);
            self.status.set_failures(attempt + 1);
            report.fetch_failed = true;
            self.advance(SchedulerEvent::FetchFailed { attempt });
            return Ok(self.finish(report, started));
        }
        self.failures.store(0, Ordering::SeqCst);
        self.status.set_failures(0);
        self.advance(SchedulerEvent::FetchSucceeded);

        // Detecting
        let snapshot = self.store.snapshot();
        let opportunities = detect(&snapshot, self.settings.min_edge);
        report.opportunities = opportunities.len();
        self.seen.lock().prune();
        self.advance(SchedulerEvent::Detected);

        // Sizing
        let reserved = self.size_and_reserve(opportunities, &mut report)?;
        if shutdown.is_cancelled() {
            info!(plans = reserved.len(), "Cycle cancelled before dispatch");
            for (_, ids) in &reserved {
                report.legs_rejected += ids.len();
                report.released += self.release_all(ids)?;
            }
            report.cancelled = true;
            self.advance(SchedulerEvent::Cancelled);
            return Ok(self.finish(report, started));
        }
        self.advance(SchedulerEvent::Sized);

        // Dispatching
        let touched_ledger = !reserved.is_empty();
        self.dispatch(reserved, shutdown, &mut report).await?;

        if touched_ledger {
            if let Err(e) = self.persistence.persist().await {
                warn!(error = %e, "Failed to persist ledger");
            }
        }

        if report.cancelled {
            self.advance(SchedulerEvent::Cancelled);
        } else {
            self.advance(SchedulerEvent::Dispatched);
        }
        Ok(self.finish(report, started))
    }

    async fn fetch_all(&self) -> Vec<(String, Result<OddsBatch, FeedError>)> {
        let timeout = self.settings.feed_timeout;
        let fetches = self.feeds.iter().map(|feed| async move {
            let started = std::time::Instant::now();
            let result = match tokio::time::timeout(timeout, feed.fetch_odds()).await {
                Ok(result) => result,
                Err(_) => Err(FeedError::Timeout {
                    feed: feed.name().to_string(),
                }),
            };
            metrics::record_feed_fetch(started, feed.name(), result.is_ok());
            (feed.name().to_string(), result)
        });
        join_all(fetches).await
    }

    fn ingest(&self, feed: &str, batch: OddsBatch, report: &mut CycleReport) {
        for market in batch.markets {
            let id = market.id.clone();
            if let Err(e) = self.store.register_market(market) {
                warn!(feed = %feed, market = %id, error = %e, "Market refused");
            }
        }
        let summary = self.store.ingest_batch(batch.quotes);
        metrics::record_ingest(summary.accepted, summary.rejected);
        debug!(
            feed = %feed,
            accepted = summary.accepted,
            unchanged = summary.unchanged,
            rejected = summary.rejected,
            best_price_changes = summary.best_price_changes,
            "Feed ingested"
        );
        report.quotes_accepted += summary.accepted;
        report.quotes_rejected += summary.rejected;
    }

    /// Size each opportunity against the live ledger and reserve its legs.
    ///
    /// Each reservation is taken before the next opportunity is sized, so later
    /// plans only see capital that is still free.
    fn size_and_reserve(
        &self,
        opportunities: Vec<ArbitrageOpportunity>,
        report: &mut CycleReport,
    ) -> Result<Vec<(StakePlan, Vec<ReservationId>)>, BotError> {
        let ledger = self.ledger();
        let mut reserved = Vec::new();

        for opportunity in opportunities {
            if self.seen.lock().is_recent(&opportunity) {
                debug!(market = %opportunity.market.id, "Opportunity dispatched recently, skipping");
                report.deduplicated += 1;
                continue;
            }

            let plan = match self.sizer.size(&opportunity, ledger.available()) {
                Ok(plan) => plan,
                Err(reason) => {
                    debug!(market = %opportunity.market.id, reason = %reason, "No plan");
                    metrics::inc_no_plan(reason.reason());
                    report.no_plan += 1;
                    continue;
                }
            };

            let legs: Vec<(Decimal, String)> = plan
                .stakes
                .iter()
                .map(|s| (s.stake, s.label(plan.market_id())))
                .collect();
            match ledger.reserve_plan(&legs) {
                Ok(ids) => {
                    info!(
                        market = %plan.opportunity.market.display_name(),
                        outlay = %plan.total_outlay,
                        expected_profit = %plan.expected_profit.round_dp(2),
                        "Plan reserved"
                    );
                    metrics::inc_plans_sized();
                    report.plans += 1;
                    reserved.push((plan, ids));
                }
                Err(e) if e.is_fatal() => return Err(self.fail(e)),
                Err(e) => {
                    warn!(market = %plan.market_id(), error = %e, "Reservation refused");
                    metrics::inc_no_plan("insufficient_funds");
                    report.no_plan += 1;
                }
            }
        }

        Ok(reserved)
    }

    async fn dispatch(
        &self,
        reserved: Vec<(StakePlan, Vec<ReservationId>)>,
        shutdown: &CancellationToken,
        report: &mut CycleReport,
    ) -> Result<(), BotError> {
        let mut pending = reserved.into_iter();

        while let Some((plan, ids)) = pending.next() {
            let started = std::time::Instant::now();
            let submit = tokio::time::timeout(self.settings.execution_timeout, self.executor.submit(&plan));
            let outcome = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                result = submit => Some(result),
            };

            match outcome {
                None => {
                    info!(market = %plan.market_id(), "Cycle cancelled during dispatch");
                    report.cancelled = true;
                    report.legs_rejected += ids.len();
                    report.released += self.release_all(&ids)?;
                    for (_, rest) in pending.by_ref() {
                        report.legs_rejected += rest.len();
                        report.released += self.release_all(&rest)?;
                    }
                    break;
                }
                Some(Err(_elapsed)) => {
                    warn!(
                        market = %plan.market_id(),
                        executor = %self.executor.name(),
                        timeout_ms = self.settings.execution_timeout.as_millis() as u64,
                        "Execution timed out, releasing plan"
                    );
                    report.legs_rejected += ids.len();
                    report.released += self.release_all(&ids)?;
                }
                Some(Ok(Err(e))) => {
                    warn!(market = %plan.market_id(), error = %e, "Execution failed, releasing plan");
                    report.legs_rejected += ids.len();
                    report.released += self.release_all(&ids)?;
                }
                Some(Ok(Ok(execution))) => {
                    metrics::record_execution(started, execution.accepted.len(), execution.rejected.len());
                    match self.open_bets.reconcile(self.ledger(), &plan, &ids, &execution) {
                        Ok(result) => {
                            report.legs_accepted += result.accepted;
                            report.legs_rejected += result.rejected + result.closed;
                            report.released += result.released;
                            if result.accepted > 0 {
                                self.seen.lock().record(&plan.opportunity);
                                report.dispatched += 1;
                            }
                            if !result.unresolved.is_empty() {
                                error!(
                                    market = %plan.market_id(),
                                    legs = result.unresolved.len(),
                                    "Reconciliation left legs unresolved"
                                );
                            }
                        }
                        Err(e) if e.is_fatal() => return Err(self.fail(e)),
                        Err(e) => error!(market = %plan.market_id(), error = %e, "Reconciliation failed"),
                    }
                    report.released += self.release_untracked(&ids)?;
                }
            }
        }

        Ok(())
    }

    /// Release every reservation in `ids`, skipping ones already closed.
    fn release_all(&self, ids: &[ReservationId]) -> Result<Decimal, BotError> {
        let mut released = Decimal::ZERO;
        for id in ids {
            match self.ledger().release(*id) {
                Ok(amount) => released += amount,
                Err(e) if e.is_fatal() => return Err(self.fail(e)),
                Err(e) => warn!(id = %id, error = %e, "Release skipped"),
            }
        }
        Ok(released)
    }

    /// Release reservations of `ids` that are still open but not held as bets.
    fn release_untracked(&self, ids: &[ReservationId]) -> Result<Decimal, BotError> {
        let stranded: Vec<ReservationId> = ids
            .iter()
            .copied()
            .filter(|id| self.ledger().reservation(*id).is_some() && self.open_bets.get(*id).is_none())
            .collect();
        if stranded.is_empty() {
            return Ok(Decimal::ZERO);
        }
        warn!(legs = stranded.len(), "Releasing reservations left without an open bet");
        self.release_all(&stranded)
    }

    fn advance(&self, event: SchedulerEvent) {
        let current = self.status.state();
        match current.on(event) {
            Ok(next) => {
                debug!(from = %current, to = %next, "State transition");
                self.status.set_state(next);
            }
            Err(e) => error!(error = %e, "Unexpected scheduler transition"),
        }
    }

    fn fail(&self, e: LedgerError) -> BotError {
        error!(error = %e, "Fatal ledger error, halting scheduler");
        if self.status.state() != SchedulerState::Halted {
            self.advance(SchedulerEvent::Fatal);
        }
        self.status.halt(e.to_string());
        BotError::Ledger(e)
    }

    fn finish(&self, mut report: CycleReport, started: tokio::time::Instant) -> CycleReport {
        report.duration_ms = started.elapsed().as_millis() as u64;
        metrics::inc_cycles();
        report.log();
        self.status.record(report.clone());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bankroll::MemoryStore;
    use crate::feed::MockFeed;
    use crate::market::{Market, OddsQuote};
    use crate::trading::PaperExecutor;
    use rust_decimal_macros::dec;

    fn arb_batch() -> OddsBatch {
        let market = Market::new("m", "h2h", ["A", "B"]);
        let now = OffsetDateTime::now_utc();
        let quotes = vec![
            OddsQuote::new(&market.id, "A", "x", dec!(2.10), now),
            OddsQuote::new(&market.id, "B", "x", dec!(1.80), now),
            OddsQuote::new(&market.id, "A", "y", dec!(1.85), now),
            OddsQuote::new(&market.id, "B", "y", dec!(2.05), now),
        ];
        OddsBatch::new(vec![market], quotes)
    }

    fn scheduler(feed: MockFeed) -> Scheduler {
        let ledger = Ledger::new(dec!(1000));
        let persistence = LedgerPersistence::new(ledger, Arc::new(MemoryStore::new()));
        Scheduler::new(
            SchedulerSettings::default(),
            Arc::new(OddsStore::new(Duration::from_secs(30))),
            persistence,
            StakeSizer::new(dec!(10), dec!(100), dec!(0.01)),
            Arc::new(PaperExecutor::new()),
        )
        .with_feed(Arc::new(feed))
    }

    #[tokio::test]
    async fn cycle_dispatches_and_holds_stakes() {
        let feed = MockFeed::new("mock");
        feed.push_batch(arb_batch());
        let scheduler = scheduler(feed);

        let report = scheduler.run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.opportunities, 1);
        assert_eq!(report.plans, 1);
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.legs_accepted, 2);
        assert_eq!(scheduler.open_bets().len(), 2);
        assert!(scheduler.ledger().reserved() > dec!(99));
        assert_eq!(scheduler.status().state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn same_opportunity_not_dispatched_twice() {
        let feed = MockFeed::new("mock");
        feed.push_batch(arb_batch());
        feed.push_batch(arb_batch());
        let scheduler = scheduler(feed);
        let token = CancellationToken::new();

        scheduler.run_cycle(&token).await.unwrap();
        let second = scheduler.run_cycle(&token).await.unwrap();

        assert_eq!(second.opportunities, 1);
        assert_eq!(second.deduplicated, 1);
        assert_eq!(second.plans, 0);
        assert_eq!(scheduler.open_bets().len(), 2);
    }

    #[tokio::test]
    async fn all_feeds_failing_counts_attempts() {
        let feed = MockFeed::new("down");
        feed.push_failure("503");
        feed.push_failure("503");
        let scheduler = scheduler(feed);
        let token = CancellationToken::new();

        let first = scheduler.run_cycle(&token).await.unwrap();
        assert!(first.fetch_failed);
        assert_eq!(scheduler.status().state(), SchedulerState::Backoff { attempt: 0 });

        // Leave backoff the way the loop does before the next tick.
        scheduler.advance(SchedulerEvent::BackoffElapsed);
        scheduler.run_cycle(&token).await.unwrap();
        assert_eq!(scheduler.status().state(), SchedulerState::Backoff { attempt: 1 });
        assert_eq!(scheduler.consecutive_failures(), 2);
    }
}
