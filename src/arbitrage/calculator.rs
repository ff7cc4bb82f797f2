//! Best-price selection and edge calculations for arbitrage opportunities.

use std::cmp::Ordering;

use rust_decimal::Decimal;
use serde::Serialize;
use smallvec::SmallVec;
use time::OffsetDateTime;

use crate::market::{Market, OddsQuote};
use crate::odds::MarketQuotes;

/// One outcome of an opportunity, backed at one bookmaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArbitrageLeg {
    /// Outcome id.
    pub outcome: String,
    /// Bookmaker offering the best price.
    pub bookmaker: String,
    /// Decimal odds taken.
    pub odds: Decimal,
    /// Maximum stake honoured at this price.
    pub liquidity_cap: Option<Decimal>,
}

impl ArbitrageLeg {
    /// Leg built from the winning quote.
    pub fn from_quote(quote: &OddsQuote) -> Self {
        Self {
            outcome: quote.outcome.clone(),
            bookmaker: quote.bookmaker.clone(),
            odds: quote.odds,
            liquidity_cap: quote.liquidity_cap,
        }
    }

    /// Implied probability (1 / odds).
    pub fn implied_probability(&self) -> Decimal {
        Decimal::ONE / self.odds
    }
}

/// Legs of an opportunity, in the market's outcome order.
pub type Legs = SmallVec<[ArbitrageLeg; 3]>;

/// Detected arbitrage opportunity.
///
/// Every outcome of the market is covered by exactly one leg, and
/// `edge = 1 - implied_sum > 0`.
#[derive(Debug, Clone, Serialize)]
pub struct ArbitrageOpportunity {
    /// Market being traded.
    pub market: Market,
    /// One leg per outcome.
    pub legs: Legs,
    /// Sum of implied probabilities of the legs.
    pub implied_sum: Decimal,
    /// 1 - implied_sum.
    pub edge: Decimal,
    /// Snapshot instant the opportunity was found in.
    #[serde(with = "time::serde::rfc3339")]
    pub detected_at: OffsetDateTime,
}

impl ArbitrageOpportunity {
    /// Guaranteed return on outlay in percent: edge / implied_sum * 100.
    pub fn profit_pct(&self) -> Decimal {
        if self.implied_sum.is_zero() {
            Decimal::ZERO
        } else {
            (self.edge / self.implied_sum) * Decimal::ONE_HUNDRED
        }
    }

    /// Leg for `outcome`.
    pub fn leg(&self, outcome: &str) -> Option<&ArbitrageLeg> {
        self.legs.iter().find(|l| l.outcome == outcome)
    }

    /// Stable identity of market + leg assignment + prices.
    pub fn fingerprint(&self) -> String {
        let mut key = self.market.id.clone();
        for leg in &self.legs {
            key.push('|');
            key.push_str(&leg.outcome);
            key.push('@');
            key.push_str(&leg.bookmaker);
            key.push('=');
            key.push_str(&leg.odds.normalize().to_string());
        }
        key
    }
}

/// Pick the most favourable quote for one outcome.
///
/// Highest odds wins; ties go to the larger liquidity cap (no cap counts as
/// unlimited), then to the lexicographically smallest bookmaker id.
pub fn select_best_quote(quotes: &[OddsQuote]) -> Option<&OddsQuote> {
    quotes.iter().max_by(|a, b| compare_quotes(a, b))
}

fn compare_quotes(a: &OddsQuote, b: &OddsQuote) -> Ordering {
    a.odds
        .cmp(&b.odds)
        .then_with(|| compare_caps(a.liquidity_cap, b.liquidity_cap))
        .then_with(|| b.bookmaker.cmp(&a.bookmaker))
}

fn compare_caps(a: Option<Decimal>, b: Option<Decimal>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => a.cmp(&b),
    }
}

/// Sum of implied probabilities of `legs`.
pub fn implied_sum(legs: &[ArbitrageLeg]) -> Decimal {
    legs.iter().map(ArbitrageLeg::implied_probability).sum()
}

/// Best leg per outcome, or `None` if any outcome has no fresh quote.
pub fn best_legs(entry: &MarketQuotes) -> Option<Legs> {
    entry
        .market
        .outcomes
        .iter()
        .map(|outcome| select_best_quote(entry.quotes_for(outcome)).map(ArbitrageLeg::from_quote))
        .collect()
}

/// Evaluate one market against `min_edge`.
pub fn calculate_opportunity(
    entry: &MarketQuotes,
    min_edge: Decimal,
    detected_at: OffsetDateTime,
) -> Option<ArbitrageOpportunity> {
    let legs = best_legs(entry)?;
    let implied_sum = implied_sum(&legs);

    if implied_sum >= Decimal::ONE - min_edge {
        return None;
    }

    Some(ArbitrageOpportunity {
        market: entry.market.clone(),
        legs,
        implied_sum,
        edge: Decimal::ONE - implied_sum,
        detected_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn q(bookmaker: &str, odds: Decimal, cap: Option<Decimal>) -> OddsQuote {
        let mut quote = OddsQuote::new("m", "A", bookmaker, odds, OffsetDateTime::now_utc());
        quote.liquidity_cap = cap;
        quote
    }

    #[test]
    fn highest_odds_wins() {
        let quotes = vec![q("a", dec!(2.0), None), q("b", dec!(2.2), Some(dec!(5)))];
        assert_eq!(select_best_quote(&quotes).unwrap().bookmaker, "b");
    }

    #[test]
    fn tie_prefers_larger_cap_then_smallest_id() {
        let quotes = vec![
            q("c", dec!(2.0), Some(dec!(50))),
            q("b", dec!(2.0), Some(dec!(100))),
            q("a", dec!(2.0), Some(dec!(10))),
        ];
        assert_eq!(select_best_quote(&quotes).unwrap().bookmaker, "b");

        let quotes = vec![q("z", dec!(2.0), None), q("y", dec!(2.0), None), q("x", dec!(2.0), Some(dec!(1000)))];
        assert_eq!(select_best_quote(&quotes).unwrap().bookmaker, "y");
    }

    #[test]
    fn empty_quotes_select_nothing() {
        assert!(select_best_quote(&[]).is_none());
    }

    #[test]
    fn profit_pct_relative_to_outlay() {
        let opp = ArbitrageOpportunity {
            market: Market::new("e", "h2h", ["A", "B"]),
            legs: Legs::new(),
            implied_sum: dec!(0.95),
            edge: dec!(0.05),
            detected_at: OffsetDateTime::now_utc(),
        };
        // 0.05 / 0.95 * 100 ≈ 5.263%
        assert!(opp.profit_pct() > dec!(5.26) && opp.profit_pct() < dec!(5.27));
    }

    #[test]
    fn fingerprint_ignores_trailing_zeros() {
        let mut market_quotes = MarketQuotes::new(Market::new("e", "h2h", ["A"]));
        market_quotes.quotes.insert("A".into(), vec![q("a", dec!(2.10), None)]);
        let legs = best_legs(&market_quotes).unwrap();
        let opp = ArbitrageOpportunity {
            market: market_quotes.market.clone(),
            legs,
            implied_sum: dec!(0.9),
            edge: dec!(0.1),
            detected_at: OffsetDateTime::now_utc(),
        };
        assert_eq!(opp.fingerprint(), "e:h2h|A@a=2.1");
    }
}
