//! Hand-off of stake plans to an execution venue.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use super::sizer::StakePlan;
use crate::error::ExecutionError;

/// One leg the venue accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegFill {
    /// Outcome id.
    pub outcome: String,
    /// Bookmaker the bet was placed with.
    pub bookmaker: String,
    /// Stake actually matched (may be below the planned stake).
    pub stake: Decimal,
    /// Odds obtained.
    pub odds: Decimal,
}

/// One leg the venue refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegRejection {
    /// Outcome id.
    pub outcome: String,
    /// Bookmaker that refused.
    pub bookmaker: String,
    /// Reason given.
    pub reason: String,
}

/// Result of submitting one plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Accepted legs with their fill details.
    pub accepted: Vec<LegFill>,
    /// Rejected legs.
    pub rejected: Vec<LegRejection>,
}

impl ExecutionReport {
    /// Every leg of `plan` accepted at its planned stake and odds.
    pub fn fill_all(plan: &StakePlan) -> Self {
        Self {
            accepted: plan
                .stakes
                .iter()
                .map(|s| LegFill {
                    outcome: s.outcome.clone(),
                    bookmaker: s.bookmaker.clone(),
                    stake: s.stake,
                    odds: s.odds,
                })
                .collect(),
            rejected: Vec::new(),
        }
    }

    /// Every leg of `plan` rejected with `reason`.
    pub fn reject_all(plan: &StakePlan, reason: &str) -> Self {
        Self {
            accepted: Vec::new(),
            rejected: plan
                .stakes
                .iter()
                .map(|s| LegRejection {
                    outcome: s.outcome.clone(),
                    bookmaker: s.bookmaker.clone(),
                    reason: reason.to_string(),
                })
                .collect(),
        }
    }

    /// Fill for `outcome`, if accepted.
    pub fn fill_for(&self, outcome: &str) -> Option<&LegFill> {
        self.accepted.iter().find(|f| f.outcome == outcome)
    }

    /// True if every leg was accepted.
    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Execution venue collaborator.
#[async_trait]
pub trait ExecutionClient: Send + Sync {
    /// Venue name for logs.
    fn name(&self) -> &str;

    /// Submit every leg of `plan`.
    async fn submit(&self, plan: &StakePlan) -> Result<ExecutionReport, ExecutionError>;
}

/// Simulated venue that accepts every leg.
///
/// Each leg is matched at the quoted odds worsened by a uniform draw in
/// `[0, slippage]`, so paper fills can come in below the planned price.
#[derive(Debug)]
pub struct PaperExecutor {
    submitted: AtomicU64,
    slippage: Decimal,
    rng: Mutex<StdRng>,
}

impl Default for PaperExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperExecutor {
    /// Paper venue filling at the quoted odds.
    pub fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            slippage: Decimal::ZERO,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Worsen fill odds by up to this fraction.
    pub fn with_slippage(mut self, slippage: Decimal) -> Self {
        self.slippage = slippage.max(Decimal::ZERO);
        self
    }

    /// Deterministic slippage draws.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Plans submitted so far.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    fn fill_odds(&self, quoted: Decimal) -> Decimal {
        if self.slippage.is_zero() {
            return quoted;
        }
        let draw = Decimal::new(self.rng.lock().gen_range(0..=10_000), 4);
        (quoted * (Decimal::ONE - self.slippage * draw)).round_dp_with_strategy(4, RoundingStrategy::ToZero)
    }
}

#[async_trait]
impl ExecutionClient for PaperExecutor {
    fn name(&self) -> &str {
        "paper"
    }

    #[instrument(skip(self, plan), fields(market = %plan.market_id()))]
    async fn submit(&self, plan: &StakePlan) -> Result<ExecutionReport, ExecutionError> {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        let accepted: Vec<LegFill> = plan
            .stakes
            .iter()
            .map(|stake| {
                let odds = self.fill_odds(stake.odds);
                info!(
                    outcome = %stake.outcome,
                    bookmaker = %stake.bookmaker,
                    stake = %stake.stake,
                    quoted = %stake.odds,
                    odds = %odds,
                    "Paper bet placed"
                );
                LegFill {
                    outcome: stake.outcome.clone(),
                    bookmaker: stake.bookmaker.clone(),
                    stake: stake.stake,
                    odds,
                }
            })
            .collect();

        let guaranteed = accepted
            .iter()
            .map(|f| f.stake * f.odds)
            .min()
            .unwrap_or_default();
        info!(
            outlay = %plan.total_outlay,
            locked_profit = %(guaranteed - plan.total_outlay).round_dp(2),
            "Paper plan filled"
        );

        Ok(ExecutionReport {
            accepted,
            rejected: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitrage::{ArbitrageLeg, ArbitrageOpportunity, Legs};
    use crate::market::Market;
    use crate::trading::StakeSizer;
    use rust_decimal_macros::dec;
    use time::OffsetDateTime;

    fn plan() -> StakePlan {
        let legs: Legs = [("A", "x", dec!(2.10)), ("B", "y", dec!(2.05))]
            .into_iter()
            .map(|(outcome, bookmaker, odds)| ArbitrageLeg {
                outcome: outcome.into(),
                bookmaker: bookmaker.into(),
                odds,
                liquidity_cap: None,
            })
            .collect();
        let implied_sum = Decimal::ONE / dec!(2.10) + Decimal::ONE / dec!(2.05);
        let opp = ArbitrageOpportunity {
            market: Market::new("e", "h2h", ["A", "B"]),
            legs,
            implied_sum,
            edge: Decimal::ONE - implied_sum,
            detected_at: OffsetDateTime::now_utc(),
        };
        StakeSizer::new(dec!(10), dec!(100), dec!(0.01))
            .size(&opp, dec!(100))
            .unwrap()
    }

    #[tokio::test]
    async fn paper_executor_fills_everything() {
        let executor = PaperExecutor::new();
        let plan = plan();

        let report = executor.submit(&plan).await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.accepted.len(), 2);
        assert_eq!(report.fill_for("A").unwrap().stake, plan.stake_for("A").unwrap().stake);
        assert_eq!(executor.submitted(), 1);
    }

    #[test]
    fn reject_all_lists_every_leg() {
        let report = ExecutionReport::reject_all(&plan(), "suspended");
        assert!(report.accepted.is_empty());
        assert_eq!(report.rejected.len(), 2);
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn slippage_only_worsens_odds_within_bound() {
        let executor = PaperExecutor::new().with_slippage(dec!(0.05)).with_seed(7);
        let plan = plan();
        let mut moved = false;

        for _ in 0..20 {
            let report = executor.submit(&plan).await.unwrap();
            for fill in &report.accepted {
                let quoted = plan.stake_for(&fill.outcome).unwrap().odds;
                assert!(fill.odds <= quoted);
                assert!(fill.odds >= quoted * dec!(0.95) - dec!(0.0001));
                moved |= fill.odds < quoted;
            }
        }
        assert!(moved);
    }

    #[tokio::test]
    async fn slipped_fill_price_is_what_gets_tracked() {
        use crate::bankroll::Ledger;
        use crate::trading::OpenBets;

        let executor = PaperExecutor::new().with_slippage(dec!(0.02)).with_seed(1);
        let plan = plan();
        let ledger = Ledger::new(dec!(1000));
        let legs: Vec<_> = plan
            .stakes
            .iter()
            .map(|s| (s.stake, s.label(plan.market_id())))
            .collect();
        let ids = ledger.reserve_plan(&legs).unwrap();
        let bets = OpenBets::new();

        let report = executor.submit(&plan).await.unwrap();
        bets.reconcile(&ledger, &plan, &ids, &report).unwrap();

        for (fill, id) in report.accepted.iter().zip(&ids) {
            assert_eq!(bets.get(*id).unwrap().odds, fill.odds);
        }
    }
}
