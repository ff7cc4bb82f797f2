//! Concurrent odds store with point-in-time snapshots.
//!
//! Writers (feed tasks) lock only the `(market, outcome)` entry they touch and
//! share the snapshot gate; `snapshot` takes the gate exclusively for the
//! duration of one copy, so a reader never observes half of a batch.

use std::collections::HashMap;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use time::OffsetDateTime;
use tracing::{debug, instrument, warn};

use super::snapshot::{MarketQuotes, OddsSnapshot};
use crate::error::QuoteError;
use crate::market::{Market, OddsQuote};

/// Quotes for one `(market, outcome)`, keyed by bookmaker.
type BookQuotes = HashMap<String, OddsQuote>;

/// Result of ingesting a batch of quotes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Quotes stored (new or replacing an older one).
    pub accepted: usize,
    /// Quotes ignored because an equal or newer one is already stored.
    pub unchanged: usize,
    /// Quotes refused (unknown market/outcome, invalid price).
    pub rejected: usize,
    /// Ingests that moved the best fresh price of their outcome.
    pub best_price_changes: usize,
}

/// Latest normalized odds per market.
#[derive(Debug)]
pub struct OddsStore {
    /// Registered markets by id.
    markets: DashMap<String, Market>,
    /// Quotes per (market id, outcome).
    quotes: DashMap<(String, String), BookQuotes>,
    /// Shared by writers, exclusive for snapshots.
    gate: RwLock<()>,
    /// Read-time staleness threshold.
    max_quote_age: Duration,
}

enum Ingested {
    Stored { best_changed: bool },
    Unchanged,
}

impl OddsStore {
    /// Create an empty store.
    pub fn new(max_quote_age: Duration) -> Self {
        Self {
            markets: DashMap::new(),
            quotes: DashMap::new(),
            gate: RwLock::new(()),
            max_quote_age,
        }
    }

    /// Staleness threshold used by `snapshot`.
    pub fn max_quote_age(&self) -> Duration {
        self.max_quote_age
    }

    /// Register a market. Returns `true` if it was not known before.
    ///
    /// Re-registering with the same outcome set is a no-op; a different
    /// outcome set is refused since markets are immutable.
    pub fn register_market(&self, market: Market) -> Result<bool, QuoteError> {
        let _gate = self.gate.read();
        if let Some(existing) = self.markets.get(&market.id) {
            if existing.outcomes != market.outcomes {
                return Err(QuoteError::OutcomeSetMismatch(market.id));
            }
            return Ok(false);
        }
        self.markets.insert(market.id.clone(), market);
        Ok(true)
    }

    /// Insert or replace a quote.
    ///
    /// Returns whether the best fresh price for the quote's outcome changed.
    pub fn ingest(&self, quote: OddsQuote) -> Result<bool, QuoteError> {
        self.ingest_at(quote, OffsetDateTime::now_utc())
    }

    /// `ingest` with an explicit clock.
    pub fn ingest_at(&self, quote: OddsQuote, now: OffsetDateTime) -> Result<bool, QuoteError> {
        let _gate = self.gate.read();
        match self.ingest_locked(quote, now)? {
            Ingested::Stored { best_changed } => Ok(best_changed),
            Ingested::Unchanged => Ok(false),
        }
    }

    /// Ingest many quotes so that a snapshot sees either all or none of them.
    #[instrument(skip(self, quotes), fields(count = quotes.len()))]
    pub fn ingest_batch(&self, quotes: Vec<OddsQuote>) -> IngestSummary {
        let now = OffsetDateTime::now_utc();
        let mut summary = IngestSummary::default();
        let _gate = self.gate.read();

        for quote in quotes {
            match self.ingest_locked(quote, now) {
                Ok(Ingested::Stored { best_changed }) => {
                    summary.accepted += 1;
                    if best_changed {
                        summary.best_price_changes += 1;
                    }
                }
                Ok(Ingested::Unchanged) => summary.unchanged += 1,
                Err(e) => {
                    debug!(error = %e, "Quote rejected");
                    summary.rejected += 1;
                }
            }
        }

        if summary.rejected > 0 {
            warn!(rejected = summary.rejected, "Some quotes were rejected");
        }
        summary
    }

    fn ingest_locked(&self, quote: OddsQuote, now: OffsetDateTime) -> Result<Ingested, QuoteError> {
        quote.validate()?;
        {
            let market = self
                .markets
                .get(&quote.market_id)
                .ok_or_else(|| QuoteError::UnknownMarket(quote.market_id.clone()))?;
            if !market.has_outcome(&quote.outcome) {
                return Err(QuoteError::UnknownOutcome {
                    market: quote.market_id.clone(),
                    outcome: quote.outcome.clone(),
                });
            }
        }

        let key = (quote.market_id.clone(), quote.outcome.clone());
        let mut entry = self.quotes.entry(key).or_default();

        if let Some(existing) = entry.get(&quote.bookmaker) {
            if existing.timestamp > quote.timestamp || *existing == quote {
                return Ok(Ingested::Unchanged);
            }
        }

        let before = best_fresh_price(&entry, now, self.max_quote_age);
        entry.insert(quote.bookmaker.clone(), quote);
        let after = best_fresh_price(&entry, now, self.max_quote_age);

        Ok(Ingested::Stored {
            best_changed: before != after,
        })
    }

    /// Point-in-time copy with stale quotes filtered out.
    pub fn snapshot(&self) -> OddsSnapshot {
        self.snapshot_at(OffsetDateTime::now_utc())
    }

    /// `snapshot` with an explicit clock.
    pub fn snapshot_at(&self, now: OffsetDateTime) -> OddsSnapshot {
        let _gate = self.gate.write();
        let mut snapshot = OddsSnapshot::empty(now);

        for market in self.markets.iter() {
            snapshot
                .markets
                .insert(market.key().clone(), MarketQuotes::new(market.value().clone()));
        }

        for entry in self.quotes.iter() {
            let (market_id, outcome) = entry.key();
            let Some(target) = snapshot.markets.get_mut(market_id) else {
                continue;
            };
            let mut fresh: Vec<OddsQuote> = entry
                .value()
                .values()
                .filter(|q| !q.is_stale(now, self.max_quote_age))
                .cloned()
                .collect();
            if fresh.is_empty() {
                continue;
            }
            fresh.sort_by(|a, b| a.bookmaker.cmp(&b.bookmaker));
            target.quotes.insert(outcome.clone(), fresh);
        }

        snapshot
    }

    /// Drop quotes older than `older_than`. Returns how many were removed.
    pub fn purge_stale(&self, older_than: Duration, now: OffsetDateTime) -> usize {
        let _gate = self.gate.read();
        let mut removed = 0;
        self.quotes.retain(|_, books| {
            let before = books.len();
            books.retain(|_, q| !q.is_stale(now, older_than));
            removed += before - books.len();
            !books.is_empty()
        });
        if removed > 0 {
            debug!(removed, "Purged stale quotes");
        }
        removed
    }

    /// Forget a market and all its quotes (e.g. the event has started).
    pub fn remove_market(&self, market_id: &str) -> Option<Market> {
        let _gate = self.gate.read();
        self.quotes.retain(|(m, _), _| m != market_id);
        self.markets.remove(market_id).map(|(_, m)| m)
    }

    /// Registered market ids.
    pub fn market_ids(&self) -> Vec<String> {
        self.markets.iter().map(|m| m.key().clone()).collect()
    }

    /// Number of registered markets.
    pub fn market_count(&self) -> usize {
        self.markets.len()
    }

    /// Number of retained quotes, stale ones included.
    pub fn quote_count(&self) -> usize {
        self.quotes.iter().map(|e| e.value().len()).sum()
    }
}

fn best_fresh_price(books: &BookQuotes, now: OffsetDateTime, max_age: Duration) -> Option<Decimal> {
    books
        .values()
        .filter(|q| !q.is_stale(now, max_age))
        .map(|q| q.odds)
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn store_with_market() -> OddsStore {
        let store = OddsStore::new(Duration::from_secs(30));
        store
            .register_market(Market::new("e1", "h2h", ["A", "B"]))
            .unwrap();
        store
    }

    fn quote(outcome: &str, bookmaker: &str, odds: Decimal, at: OffsetDateTime) -> OddsQuote {
        OddsQuote::new("e1:h2h", outcome, bookmaker, odds, at)
    }

    #[test]
    fn ingest_reports_best_price_changes() {
        let store = store_with_market();
        let now = OffsetDateTime::now_utc();

        assert!(store.ingest_at(quote("A", "x", dec!(2.0), now), now).unwrap());
        // Worse price from another bookmaker leaves the best unchanged.
        assert!(!store.ingest_at(quote("A", "y", dec!(1.9), now), now).unwrap());
        // Better price moves it.
        assert!(store.ingest_at(quote("A", "y", dec!(2.2), now), now).unwrap());
    }

    #[test]
    fn ingesting_same_quote_twice_is_idempotent() {
        let store = store_with_market();
        let now = OffsetDateTime::now_utc();
        let q = quote("A", "x", dec!(2.0), now);

        store.ingest_at(q.clone(), now).unwrap();
        let first = store.snapshot_at(now);
        assert!(!store.ingest_at(q, now).unwrap());
        let second = store.snapshot_at(now);

        assert_eq!(
            first.market("e1:h2h").unwrap().quotes,
            second.market("e1:h2h").unwrap().quotes
        );
        assert_eq!(store.quote_count(), 1);
    }

    #[test]
    fn older_quote_does_not_replace_newer() {
        let store = store_with_market();
        let now = OffsetDateTime::now_utc();

        store.ingest_at(quote("A", "x", dec!(2.0), now), now).unwrap();
        let older = quote("A", "x", dec!(3.0), now - time::Duration::seconds(5));
        assert!(!store.ingest_at(older, now).unwrap());

        let snapshot = store.snapshot_at(now);
        assert_eq!(snapshot.market("e1:h2h").unwrap().quotes_for("A")[0].odds, dec!(2.0));
    }

    #[test]
    fn stale_quotes_are_filtered_not_deleted() {
        let store = store_with_market();
        let now = OffsetDateTime::now_utc();
        let old = now - time::Duration::seconds(45);

        store.ingest_at(quote("A", "x", dec!(2.0), old), now).unwrap();
        store.ingest_at(quote("B", "x", dec!(2.0), now), now).unwrap();

        let snapshot = store.snapshot_at(now);
        let entry = snapshot.market("e1:h2h").unwrap();
        assert!(entry.quotes_for("A").is_empty());
        assert_eq!(entry.quotes_for("B").len(), 1);
        assert_eq!(store.quote_count(), 2);

        assert_eq!(store.purge_stale(Duration::from_secs(30), now), 1);
        assert_eq!(store.quote_count(), 1);
    }

    #[test]
    fn unknown_market_and_outcome_are_rejected() {
        let store = store_with_market();
        let now = OffsetDateTime::now_utc();

        let err = store
            .ingest_at(OddsQuote::new("nope", "A", "x", dec!(2), now), now)
            .unwrap_err();
        assert_eq!(err, QuoteError::UnknownMarket("nope".into()));

        let err = store.ingest_at(quote("Draw", "x", dec!(3), now), now).unwrap_err();
        assert!(matches!(err, QuoteError::UnknownOutcome { .. }));
    }

    #[test]
    fn market_outcome_set_is_immutable() {
        let store = store_with_market();
        assert!(!store.register_market(Market::new("e1", "h2h", ["A", "B"])).unwrap());
        assert_eq!(
            store.register_market(Market::new("e1", "h2h", ["A", "B", "Draw"])),
            Err(QuoteError::OutcomeSetMismatch("e1:h2h".into()))
        );
    }

    #[test]
    fn batch_counts_each_result() {
        let store = store_with_market();
        let now = OffsetDateTime::now_utc();
        let summary = store.ingest_batch(vec![
            quote("A", "x", dec!(2.0), now),
            quote("A", "x", dec!(2.0), now),
            quote("B", "x", dec!(0.5), now),
        ]);

        assert_eq!(summary.accepted, 1);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.rejected, 1);
    }

    #[test]
    fn remove_market_drops_its_quotes() {
        let store = store_with_market();
        let now = OffsetDateTime::now_utc();
        store.ingest_at(quote("A", "x", dec!(2.0), now), now).unwrap();

        assert!(store.remove_market("e1:h2h").is_some());
        assert_eq!(store.quote_count(), 0);
        assert!(store.snapshot_at(now).is_empty());
    }

    #[test]
    fn concurrent_writers_all_land() {
        let store = Arc::new(store_with_market());
        let now = OffsetDateTime::now_utc();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for outcome in ["A", "B"] {
                        let q = quote(outcome, &format!("book-{i}"), dec!(2.0), now);
                        store.ingest_at(q, now).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snapshot = store.snapshot_at(now);
        let entry = snapshot.market("e1:h2h").unwrap();
        assert_eq!(entry.quotes_for("A").len(), 8);
        assert_eq!(entry.quotes_for("B").len(), 8);
    }
}
