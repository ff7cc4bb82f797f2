//! Arbitrage opportunity detection across a whole snapshot.

use std::time::Instant;

use rust_decimal::Decimal;
use tracing::{debug, info, instrument};

use super::calculator::{best_legs, calculate_opportunity, implied_sum, ArbitrageOpportunity};
use crate::metrics;
use crate::odds::OddsSnapshot;

/// Find every qualifying opportunity in `snapshot`, highest edge first.
///
/// Markets missing a fresh quote for any outcome are skipped. Each outcome's
/// best price is chosen independently, which is optimal because implied
/// probabilities add per outcome.
#[instrument(skip(snapshot), fields(markets = snapshot.len()))]
pub fn detect(snapshot: &OddsSnapshot, min_edge: Decimal) -> Vec<ArbitrageOpportunity> {
    let started = Instant::now();
    let mut opportunities: Vec<ArbitrageOpportunity> = snapshot
        .markets
        .values()
        .filter_map(|entry| calculate_opportunity(entry, min_edge, snapshot.taken_at))
        .collect();

    opportunities.sort_by(|a, b| {
        b.edge
            .cmp(&a.edge)
            .then_with(|| a.market.id.cmp(&b.market.id))
    });

    for opp in &opportunities {
        info!(
            market = %opp.market.display_name(),
            edge = %opp.edge.round_dp(6),
            implied_sum = %opp.implied_sum.round_dp(6),
            legs = opp.legs.len(),
            "Arbitrage opportunity detected"
        );
    }

    if opportunities.is_empty() {
        if let Some(diagnosis) = diagnose_no_opportunity(snapshot) {
            debug!(
                closest_market = %diagnosis.market_id,
                implied_sum = %diagnosis.implied_sum.round_dp(6),
                threshold = %(Decimal::ONE - min_edge),
                complete_markets = diagnosis.complete_markets,
                "No arbitrage opportunity"
            );
        }
    }

    metrics::record_detection(started, opportunities.len());
    opportunities
}

/// The fully quoted market closest to being an arbitrage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoOpportunityDiagnosis {
    /// Market with the lowest implied sum.
    pub market_id: String,
    /// Its implied sum.
    pub implied_sum: Decimal,
    /// How many markets had every outcome quoted.
    pub complete_markets: usize,
}

/// Explain an empty detection result; `None` if no market is fully quoted.
pub fn diagnose_no_opportunity(snapshot: &OddsSnapshot) -> Option<NoOpportunityDiagnosis> {
    let sums: Vec<(&str, Decimal)> = snapshot
        .markets
        .values()
        .filter_map(|entry| best_legs(entry).map(|legs| (entry.market.id.as_str(), implied_sum(&legs))))
        .collect();

    let complete_markets = sums.len();
    sums.into_iter()
        .min_by(|a, b| a.1.cmp(&b.1))
        .map(|(market_id, implied_sum)| NoOpportunityDiagnosis {
            market_id: market_id.to_string(),
            implied_sum,
            complete_markets,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{Market, OddsQuote};
    use rust_decimal_macros::dec;
    use time::OffsetDateTime;

    fn two_way(event: &str, a: (&str, Decimal), b: (&str, Decimal)) -> (Market, Vec<OddsQuote>) {
        let market = Market::new(event, "h2h", ["A", "B"]);
        let now = OffsetDateTime::now_utc();
        let quotes = vec![
            OddsQuote::new(&market.id, "A", a.0, a.1, now),
            OddsQuote::new(&market.id, "B", b.0, b.1, now),
        ];
        (market, quotes)
    }

    #[test]
    fn finds_two_bookmaker_arbitrage() {
        let (market, quotes) = two_way("m", ("X", dec!(2.10)), ("Y", dec!(2.05)));
        let snapshot = OddsSnapshot::from_parts(OffsetDateTime::now_utc(), [market], quotes);

        let found = detect(&snapshot, Decimal::ZERO);

        assert_eq!(found.len(), 1);
        let opp = &found[0];
        assert!(opp.edge > dec!(0.0359) && opp.edge < dec!(0.0361));
        assert_eq!(opp.leg("A").unwrap().bookmaker, "X");
        assert_eq!(opp.leg("B").unwrap().bookmaker, "Y");
        assert_eq!(opp.edge, Decimal::ONE - opp.implied_sum);
    }

    #[test]
    fn min_edge_filters_thin_opportunities() {
        let (market, quotes) = two_way("m", ("X", dec!(2.10)), ("Y", dec!(2.05)));
        let snapshot = OddsSnapshot::from_parts(OffsetDateTime::now_utc(), [market], quotes);

        assert!(detect(&snapshot, dec!(0.05)).is_empty());
        assert_eq!(detect(&snapshot, dec!(0.03)).len(), 1);
    }

    #[test]
    fn no_opportunity_when_book_is_overround() {
        let (market, quotes) = two_way("m", ("X", dec!(1.90)), ("Y", dec!(1.95)));
        let snapshot = OddsSnapshot::from_parts(OffsetDateTime::now_utc(), [market], quotes);

        assert!(detect(&snapshot, Decimal::ZERO).is_empty());
        let diagnosis = diagnose_no_opportunity(&snapshot).unwrap();
        assert_eq!(diagnosis.market_id, "m:h2h");
        assert!(diagnosis.implied_sum > Decimal::ONE);
    }

    #[test]
    fn incomplete_markets_are_skipped() {
        let market = Market::new("m", "h2h", ["A", "B", "Draw"]);
        let now = OffsetDateTime::now_utc();
        let quotes = vec![
            OddsQuote::new(&market.id, "A", "X", dec!(5.0), now),
            OddsQuote::new(&market.id, "B", "Y", dec!(5.0), now),
        ];
        let snapshot = OddsSnapshot::from_parts(now, [market], quotes);

        assert!(detect(&snapshot, Decimal::ZERO).is_empty());
        assert!(diagnose_no_opportunity(&snapshot).is_none());
    }

    #[test]
    fn results_ordered_by_edge() {
        let (m1, q1) = two_way("small", ("X", dec!(2.05)), ("Y", dec!(2.05)));
        let (m2, q2) = two_way("large", ("X", dec!(2.30)), ("Y", dec!(2.20)));
        let snapshot = OddsSnapshot::from_parts(
            OffsetDateTime::now_utc(),
            [m1, m2],
            q1.into_iter().chain(q2),
        );

        let found = detect(&snapshot, Decimal::ZERO);
        let ids: Vec<_> = found.iter().map(|o| o.market.id.as_str()).collect();
        assert_eq!(ids, vec!["large:h2h", "small:h2h"]);
    }

    #[test]
    fn every_opportunity_covers_each_outcome_once() {
        let market = Market::new("m", "h2h", ["Home", "Draw", "Away"]);
        let now = OffsetDateTime::now_utc();
        let mut quotes = Vec::new();
        for (book, prices) in [
            ("a", [dec!(3.2), dec!(3.6), dec!(3.0)]),
            ("b", [dec!(3.0), dec!(3.9), dec!(3.4)]),
            ("c", [dec!(3.5), dec!(3.1), dec!(3.3)]),
        ] {
            for (outcome, odds) in ["Home", "Draw", "Away"].iter().zip(prices) {
                quotes.push(OddsQuote::new(&market.id, *outcome, book, odds, now));
            }
        }
        let snapshot = OddsSnapshot::from_parts(now, [market.clone()], quotes);

        let found = detect(&snapshot, Decimal::ZERO);
        assert_eq!(found.len(), 1);
        let opp = &found[0];
        assert!(opp.edge > Decimal::ZERO);
        let covered: Vec<_> = opp.legs.iter().map(|l| l.outcome.as_str()).collect();
        assert_eq!(covered, vec!["Home", "Draw", "Away"]);
        assert_eq!(opp.leg("Home").unwrap().bookmaker, "c");
        assert_eq!(opp.leg("Draw").unwrap().bookmaker, "b");
        assert_eq!(opp.leg("Away").unwrap().bookmaker, "b");
    }
}
