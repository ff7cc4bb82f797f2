//! Immutable point-in-time view of the odds store.

use std::collections::BTreeMap;

use time::OffsetDateTime;

use crate::market::{Market, OddsQuote};

/// Fresh quotes for one market, keyed by outcome.
#[derive(Debug, Clone)]
pub struct MarketQuotes {
    /// The market definition.
    pub market: Market,
    /// Quotes per outcome, sorted by bookmaker id.
    pub quotes: BTreeMap<String, Vec<OddsQuote>>,
}

impl MarketQuotes {
    /// Create an empty entry for `market`.
    pub fn new(market: Market) -> Self {
        Self {
            market,
            quotes: BTreeMap::new(),
        }
    }

    /// Quotes for one outcome (empty if none are fresh).
    pub fn quotes_for(&self, outcome: &str) -> &[OddsQuote] {
        self.quotes.get(outcome).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether every outcome of the market has at least one quote.
    pub fn is_fully_quoted(&self) -> bool {
        self.market
            .outcomes
            .iter()
            .all(|o| !self.quotes_for(o).is_empty())
    }

    /// Total number of quotes in this market.
    pub fn quote_count(&self) -> usize {
        self.quotes.values().map(Vec::len).sum()
    }
}

/// Consistent copy of the store taken at one instant.
#[derive(Debug, Clone)]
pub struct OddsSnapshot {
    /// Instant the snapshot was taken; staleness is judged against it.
    pub taken_at: OffsetDateTime,
    /// Markets keyed by id.
    pub markets: BTreeMap<String, MarketQuotes>,
}

impl OddsSnapshot {
    /// Empty snapshot.
    pub fn empty(taken_at: OffsetDateTime) -> Self {
        Self {
            taken_at,
            markets: BTreeMap::new(),
        }
    }

    /// Build a snapshot directly from markets and quotes.
    ///
    /// Quotes for markets not listed, or for outcomes outside a market, are
    /// dropped. No staleness filter is applied.
    pub fn from_parts(
        taken_at: OffsetDateTime,
        markets: impl IntoIterator<Item = Market>,
        quotes: impl IntoIterator<Item = OddsQuote>,
    ) -> Self {
        let mut snapshot = Self::empty(taken_at);
        for market in markets {
            snapshot
                .markets
                .insert(market.id.clone(), MarketQuotes::new(market));
        }
        for quote in quotes {
            if let Some(entry) = snapshot.markets.get_mut(&quote.market_id) {
                if entry.market.has_outcome(&quote.outcome) {
                    entry
                        .quotes
                        .entry(quote.outcome.clone())
                        .or_default()
                        .push(quote);
                }
            }
        }
        for entry in snapshot.markets.values_mut() {
            for list in entry.quotes.values_mut() {
                list.sort_by(|a, b| a.bookmaker.cmp(&b.bookmaker));
            }
        }
        snapshot
    }

    /// Look up one market.
    pub fn market(&self, id: &str) -> Option<&MarketQuotes> {
        self.markets.get(id)
    }

    /// Number of markets.
    pub fn len(&self) -> usize {
        self.markets.len()
    }

    /// Whether the snapshot holds no markets.
    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }

    /// Total number of quotes.
    pub fn quote_count(&self) -> usize {
        self.markets.values().map(MarketQuotes::quote_count).sum()
    }
}
