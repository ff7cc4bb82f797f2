//! Market-related types for sportsbook betting propositions.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use time::OffsetDateTime;

use crate::error::QuoteError;

/// Ordered outcome identifiers of a market. Two or three for most sports.
pub type Outcomes = SmallVec<[String; 3]>;

/// A single betting proposition: one market type on one event.
///
/// The outcome set is fixed for the lifetime of the market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    /// Unique market identifier (`{event_id}:{market_type}`).
    pub id: String,
    /// Event identifier from the feed.
    pub event_id: String,
    /// Market type key (h2h, totals, ...).
    pub market_type: String,
    /// Ordered outcome identifiers.
    pub outcomes: Outcomes,
    /// Human readable label, e.g. "Arsenal vs Chelsea".
    #[serde(default)]
    pub label: Option<String>,
    /// Event start time.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub commence_time: Option<OffsetDateTime>,
}

impl Market {
    /// Create a market with the canonical id for `event_id` / `market_type`.
    pub fn new(
        event_id: impl Into<String>,
        market_type: impl Into<String>,
        outcomes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let event_id = event_id.into();
        let market_type = market_type.into();
        Self {
            id: Self::market_id(&event_id, &market_type),
            event_id,
            market_type,
            outcomes: outcomes.into_iter().map(Into::into).collect(),
            label: None,
            commence_time: None,
        }
    }

    /// Canonical market id.
    pub fn market_id(event_id: &str, market_type: &str) -> String {
        format!("{event_id}:{market_type}")
    }

    /// Attach a display label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Attach the event start time.
    pub fn with_commence_time(mut self, at: OffsetDateTime) -> Self {
        self.commence_time = Some(at);
        self
    }

    /// Number of outcomes.
    pub fn outcome_count(&self) -> usize {
        self.outcomes.len()
    }

    /// Whether `outcome` belongs to this market.
    pub fn has_outcome(&self, outcome: &str) -> bool {
        self.outcomes.iter().any(|o| o == outcome)
    }

    /// Display name for logs.
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }
}

/// A bookmaker's decimal price for one outcome of one market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OddsQuote {
    /// Market id.
    pub market_id: String,
    /// Outcome id.
    pub outcome: String,
    /// Bookmaker id.
    pub bookmaker: String,
    /// Decimal odds (payout per unit stake).
    pub odds: Decimal,
    /// When the bookmaker published this price.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Maximum stake honoured at this price, if known.
    #[serde(default)]
    pub liquidity_cap: Option<Decimal>,
}

impl OddsQuote {
    /// Create a quote without a liquidity cap.
    pub fn new(
        market_id: impl Into<String>,
        outcome: impl Into<String>,
        bookmaker: impl Into<String>,
        odds: Decimal,
        timestamp: OffsetDateTime,
    ) -> Self {
        Self {
            market_id: market_id.into(),
            outcome: outcome.into(),
            bookmaker: bookmaker.into(),
            odds,
            timestamp,
            liquidity_cap: None,
        }
    }

    /// Attach a liquidity cap.
    pub fn with_liquidity_cap(mut self, cap: Decimal) -> Self {
        self.liquidity_cap = Some(cap);
        self
    }

    /// Implied probability (1 / odds).
    pub fn implied_probability(&self) -> Decimal {
        Decimal::ONE / self.odds
    }

    /// Age of the quote at `now`; zero for quotes stamped in the future.
    pub fn age(&self, now: OffsetDateTime) -> Duration {
        (now - self.timestamp).try_into().unwrap_or(Duration::ZERO)
    }

    /// Whether the quote is older than `max_age` at `now`.
    pub fn is_stale(&self, now: OffsetDateTime, max_age: Duration) -> bool {
        self.age(now) > max_age
    }

    /// Check the price and cap are usable.
    pub fn validate(&self) -> Result<(), QuoteError> {
        if self.odds <= Decimal::ONE {
            return Err(QuoteError::InvalidOdds(self.odds));
        }
        if let Some(cap) = self.liquidity_cap {
            if cap <= Decimal::ZERO {
                return Err(QuoteError::InvalidLiquidity(cap));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn market_id_is_event_and_type() {
        let market = Market::new("evt-1", "h2h", ["Home", "Away"]);
        assert_eq!(market.id, "evt-1:h2h");
        assert_eq!(market.outcome_count(), 2);
        assert!(market.has_outcome("Away"));
        assert!(!market.has_outcome("Draw"));
    }

    #[test]
    fn implied_probability_is_inverse_odds() {
        let quote = OddsQuote::new("m", "A", "bk", dec!(2.5), OffsetDateTime::now_utc());
        assert_eq!(quote.implied_probability(), dec!(0.4));
    }

    #[test]
    fn staleness_uses_age() {
        let now = OffsetDateTime::now_utc();
        let quote = OddsQuote::new("m", "A", "bk", dec!(2), now - time::Duration::seconds(31));
        assert!(quote.is_stale(now, Duration::from_secs(30)));
        assert!(!quote.is_stale(now, Duration::from_secs(60)));
    }

    #[test]
    fn future_quotes_have_zero_age() {
        let now = OffsetDateTime::now_utc();
        let quote = OddsQuote::new("m", "A", "bk", dec!(2), now + time::Duration::seconds(5));
        assert_eq!(quote.age(now), Duration::ZERO);
    }

    #[test]
    fn validate_rejects_even_money_or_less() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(
            OddsQuote::new("m", "A", "bk", dec!(1), now).validate(),
            Err(QuoteError::InvalidOdds(dec!(1)))
        );
        assert!(OddsQuote::new("m", "A", "bk", dec!(1.01), now).validate().is_ok());
        assert_eq!(
            OddsQuote::new("m", "A", "bk", dec!(2), now)
                .with_liquidity_cap(dec!(0))
                .validate(),
            Err(QuoteError::InvalidLiquidity(dec!(0)))
        );
    }
}
