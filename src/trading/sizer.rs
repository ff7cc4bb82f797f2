//! Stake sizing: turn an opportunity plus available capital into a plan.

use rust_decimal::Decimal;
use serde::Serialize;
use smallvec::SmallVec;
use strum::IntoStaticStr;
use thiserror::Error;
use tracing::debug;

use crate::arbitrage::ArbitrageOpportunity;
use crate::config::Config;
use crate::utils::round_down;

/// Stake assigned to one leg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LegStake {
    /// Outcome id.
    pub outcome: String,
    /// Bookmaker the stake is placed with.
    pub bookmaker: String,
    /// Decimal odds taken.
    pub odds: Decimal,
    /// Stake amount.
    pub stake: Decimal,
}

impl LegStake {
    /// Gross return if this outcome wins.
    pub fn payout(&self) -> Decimal {
        self.stake * self.odds
    }

    /// Ledger label for this leg's reservation.
    pub fn label(&self, market_id: &str) -> String {
        format!("{market_id}/{}@{}", self.outcome, self.bookmaker)
    }
}

/// Sized plan for one opportunity.
///
/// `total_outlay` never exceeds the capital available when the plan was made,
/// and payouts differ across outcomes only by rounding.
#[derive(Debug, Clone, Serialize)]
pub struct StakePlan {
    /// Opportunity being staked.
    pub opportunity: ArbitrageOpportunity,
    /// One stake per leg, in outcome order.
    pub stakes: SmallVec<[LegStake; 3]>,
    /// Sum of stakes.
    pub total_outlay: Decimal,
    /// Worst-case payout minus outlay.
    pub expected_profit: Decimal,
}

impl StakePlan {
    /// Stake for `outcome`.
    pub fn stake_for(&self, outcome: &str) -> Option<&LegStake> {
        self.stakes.iter().find(|s| s.outcome == outcome)
    }

    /// Smallest payout across outcomes.
    pub fn min_payout(&self) -> Decimal {
        self.stakes.iter().map(LegStake::payout).min().unwrap_or_default()
    }

    /// Largest payout across outcomes.
    pub fn max_payout(&self) -> Decimal {
        self.stakes.iter().map(LegStake::payout).max().unwrap_or_default()
    }

    /// Market id of the underlying opportunity.
    pub fn market_id(&self) -> &str {
        &self.opportunity.market.id
    }
}

/// Why an opportunity could not be sized.
#[derive(Error, Debug, Clone, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum NoPlan {
    /// Not enough free capital to reach the minimum outlay.
    #[error("available {available} below minimum outlay {min_outlay}")]
    InsufficientFunds {
        /// Capital available.
        available: Decimal,
        /// Configured minimum.
        min_outlay: Decimal,
    },

    /// Liquidity caps shrank the outlay below the minimum.
    #[error("liquidity caps limit outlay to {outlay}, below minimum {min_outlay}")]
    CappedBelowMinimum {
        /// Outlay after capping.
        outlay: Decimal,
        /// Configured minimum.
        min_outlay: Decimal,
    },

    /// Rounding to the stake increment dropped the outlay below the minimum.
    #[error("rounded outlay {total} below minimum {min_outlay}")]
    RoundedBelowMinimum {
        /// Rounded total.
        total: Decimal,
        /// Configured minimum.
        min_outlay: Decimal,
    },

    /// A leg rounded down to nothing.
    #[error("stake for {outcome} rounds to zero")]
    ZeroStake {
        /// Outcome with no stake.
        outcome: String,
    },
}

impl NoPlan {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        self.into()
    }
}

/// Proportional, payout-equalizing stake sizer.
#[derive(Debug, Clone)]
pub struct StakeSizer {
    min_outlay: Decimal,
    max_outlay: Decimal,
    increment: Decimal,
}

impl StakeSizer {
    /// Sizer with explicit limits.
    pub fn new(min_outlay: Decimal, max_outlay: Decimal, increment: Decimal) -> Self {
        Self {
            min_outlay,
            max_outlay,
            increment,
        }
    }

    /// Sizer using the configured limits.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.min_outlay, config.max_outlay, config.stake_rounding_increment)
    }

    /// Size `opportunity` against `available` capital.
    ///
    /// Stakes are split so every outcome pays the same, the outlay is cut until
    /// no leg exceeds its liquidity cap, and each stake is rounded down to the
    /// increment.
    pub fn size(&self, opportunity: &ArbitrageOpportunity, available: Decimal) -> Result<StakePlan, NoPlan> {
        let mut outlay = available.min(self.max_outlay);
        if outlay < self.min_outlay || opportunity.implied_sum <= Decimal::ZERO {
            return Err(NoPlan::InsufficientFunds {
                available,
                min_outlay: self.min_outlay,
            });
        }

        let weights: SmallVec<[Decimal; 3]> = opportunity
            .legs
            .iter()
            .map(|leg| leg.implied_probability() / opportunity.implied_sum)
            .collect();

        // Each pass lowers the outlay to fit the most binding cap.
        for _ in 0..=opportunity.legs.len() {
            let binding = opportunity
                .legs
                .iter()
                .zip(&weights)
                .filter_map(|(leg, w)| leg.liquidity_cap.map(|cap| (cap, *w)))
                .filter(|(cap, w)| outlay * w > *cap)
                .map(|(cap, w)| cap / w)
                .min();
            match binding {
                Some(capped) if capped < outlay => {
                    debug!(from = %outlay, to = %capped, "Liquidity cap tightened outlay");
                    outlay = capped;
                }
                _ => break,
            }
        }

        if outlay < self.min_outlay {
            return Err(NoPlan::CappedBelowMinimum {
                outlay: outlay.round_dp(2),
                min_outlay: self.min_outlay,
            });
        }

        let mut stakes: SmallVec<[LegStake; 3]> = SmallVec::with_capacity(opportunity.legs.len());
        for (leg, w) in opportunity.legs.iter().zip(&weights) {
            let mut stake = round_down(outlay * w, self.increment);
            if let Some(cap) = leg.liquidity_cap {
                stake = stake.min(round_down(cap, self.increment));
            }
            if stake <= Decimal::ZERO {
                return Err(NoPlan::ZeroStake {
                    outcome: leg.outcome.clone(),
                });
            }
            stakes.push(LegStake {
                outcome: leg.outcome.clone(),
                bookmaker: leg.bookmaker.clone(),
                odds: leg.odds,
                stake,
            });
        }

        let total_outlay: Decimal = stakes.iter().map(|s| s.stake).sum();
        if total_outlay > available {
            return Err(NoPlan::InsufficientFunds {
                available,
                min_outlay: self.min_outlay,
            });
        }
        if total_outlay < self.min_outlay {
            return Err(NoPlan::RoundedBelowMinimum {
                total: total_outlay,
                min_outlay: self.min_outlay,
            });
        }

        let min_payout = stakes.iter().map(LegStake::payout).min().unwrap_or_default();
        Ok(StakePlan {
            opportunity: opportunity.clone(),
            stakes,
            total_outlay,
            expected_profit: min_payout - total_outlay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitrage::{ArbitrageLeg, Legs};
    use crate::market::Market;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rust_decimal_macros::dec;
    use time::OffsetDateTime;

    fn opportunity(legs: &[(&str, Decimal, Option<Decimal>)]) -> ArbitrageOpportunity {
        let outcomes: Vec<&str> = legs.iter().map(|l| l.0).collect();
        let legs: Legs = legs
            .iter()
            .enumerate()
            .map(|(i, (outcome, odds, cap))| ArbitrageLeg {
                outcome: outcome.to_string(),
                bookmaker: format!("book{i}"),
                odds: *odds,
                liquidity_cap: *cap,
            })
            .collect();
        let implied_sum = crate::arbitrage::calculator::implied_sum(&legs);
        ArbitrageOpportunity {
            market: Market::new("evt", "h2h", outcomes),
            legs,
            implied_sum,
            edge: Decimal::ONE - implied_sum,
            detected_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn equalizes_payouts() {
        let sizer = StakeSizer::new(dec!(10), dec!(100), dec!(0.01));
        let opp = opportunity(&[("A", dec!(2.10), None), ("B", dec!(2.05), None)]);

        let plan = sizer.size(&opp, dec!(1000)).unwrap();

        assert!(plan.total_outlay <= dec!(100));
        assert!(plan.total_outlay > dec!(99.9));
        assert!(plan.max_payout() - plan.min_payout() <= dec!(0.01) * dec!(2.10));
        assert!(plan.expected_profit > dec!(3.5));
        assert!(plan.stake_for("B").unwrap().stake > plan.stake_for("A").unwrap().stake);
    }

    #[test]
    fn outlay_limited_by_available_capital() {
        let sizer = StakeSizer::new(dec!(10), dec!(100), dec!(0.01));
        let opp = opportunity(&[("A", dec!(2.10), None), ("B", dec!(2.05), None)]);

        let plan = sizer.size(&opp, dec!(42.5)).unwrap();
        assert!(plan.total_outlay <= dec!(42.5));
    }

    #[test]
    fn insufficient_capital_is_no_plan() {
        let sizer = StakeSizer::new(dec!(50), dec!(100), dec!(0.01));
        let opp = opportunity(&[("A", dec!(2.10), None), ("B", dec!(2.05), None)]);

        let err = sizer.size(&opp, dec!(49.99)).unwrap_err();
        assert!(matches!(err, NoPlan::InsufficientFunds { .. }));
        assert_eq!(err.reason(), "insufficient_funds");
    }

    #[test]
    fn caps_below_minimum_yield_no_plan() {
        // Wants 120, capital allows 100, leg A's cap limits the plan to 40.
        let sizer = StakeSizer::new(dec!(50), dec!(120), dec!(0.01));
        let opp = opportunity(&[("A", dec!(2.2), Some(dec!(20))), ("B", dec!(2.2), None)]);

        let err = sizer.size(&opp, dec!(100)).unwrap_err();
        assert_eq!(
            err,
            NoPlan::CappedBelowMinimum {
                outlay: dec!(40),
                min_outlay: dec!(50)
            }
        );
    }

    #[test]
    fn caps_tighten_outlay_across_legs() {
        let sizer = StakeSizer::new(dec!(10), dec!(300), dec!(0.01));
        let opp = opportunity(&[
            ("Home", dec!(3.5), Some(dec!(60))),
            ("Draw", dec!(3.9), Some(dec!(40))),
            ("Away", dec!(3.4), None),
        ]);

        let plan = sizer.size(&opp, dec!(1000)).unwrap();

        for (stake, leg) in plan.stakes.iter().zip(&opp.legs) {
            if let Some(cap) = leg.liquidity_cap {
                assert!(stake.stake <= cap);
            }
        }
        assert!(plan.total_outlay < dec!(300));
        assert!(plan.max_payout() - plan.min_payout() <= dec!(0.01) * dec!(3.9));
    }

    #[test]
    fn coarse_increment_never_rounds_up() {
        let sizer = StakeSizer::new(dec!(10), dec!(100), dec!(5));
        let opp = opportunity(&[("A", dec!(2.10), None), ("B", dec!(2.05), None)]);

        let plan = sizer.size(&opp, dec!(100)).unwrap();
        for stake in &plan.stakes {
            assert_eq!(stake.stake % dec!(5), Decimal::ZERO);
        }
        assert_eq!(plan.total_outlay, dec!(95));
    }

    #[test]
    fn random_plans_respect_capital_and_payout_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let sizer = StakeSizer::new(dec!(10), dec!(500), dec!(0.01));
        let mut sized = 0;

        for _ in 0..500 {
            let n = rng.gen_range(2..=3);
            let legs: Vec<(String, Decimal, Option<Decimal>)> = (0..n)
                .map(|i| {
                    let odds = Decimal::new(rng.gen_range(n as i64 * 100 + 5..n as i64 * 100 + 150), 2);
                    let cap = rng.gen_bool(0.4).then(|| Decimal::new(rng.gen_range(500..20_000), 2));
                    (format!("o{i}"), odds, cap)
                })
                .collect();
            let borrowed: Vec<(&str, Decimal, Option<Decimal>)> =
                legs.iter().map(|(o, d, c)| (o.as_str(), *d, *c)).collect();
            let opp = opportunity(&borrowed);
            if opp.edge <= Decimal::ZERO {
                continue;
            }
            let available = Decimal::new(rng.gen_range(0..100_000), 2);

            if let Ok(plan) = sizer.size(&opp, available) {
                sized += 1;
                assert!(plan.total_outlay <= available);
                assert!(plan.total_outlay >= dec!(10));
                let max_odds = opp.legs.iter().map(|l| l.odds).max().unwrap();
                assert!(plan.max_payout() - plan.min_payout() <= dec!(0.01) * max_odds);
                for (stake, leg) in plan.stakes.iter().zip(&opp.legs) {
                    if let Some(cap) = leg.liquidity_cap {
                        assert!(stake.stake <= cap);
                    }
                }
            }
        }
        assert!(sized > 50);
    }
}
