//! Settled bet history and performance statistics.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;

use crate::bankroll::ReservationId;

/// How a settled leg ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BetResult {
    /// Positive P&L.
    Win,
    /// Negative P&L.
    Loss,
    /// Stake returned.
    Push,
}

/// A leg that has been settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettledBet {
    /// Reservation that held the stake.
    pub reservation: ReservationId,
    /// Market id.
    pub market_id: String,
    /// Outcome backed.
    pub outcome: String,
    /// Bookmaker.
    pub bookmaker: String,
    /// Matched stake.
    pub stake: Decimal,
    /// Matched odds.
    pub odds: Decimal,
    /// Realized P&L.
    pub pnl: Decimal,
    /// Settlement time.
    #[serde(with = "time::serde::rfc3339")]
    pub settled_at: OffsetDateTime,
}

impl SettledBet {
    /// Win, loss or push from the sign of the P&L.
    pub fn result(&self) -> BetResult {
        if self.pnl > Decimal::ZERO {
            BetResult::Win
        } else if self.pnl < Decimal::ZERO {
            BetResult::Loss
        } else {
            BetResult::Push
        }
    }

    /// Market type part of the market id (`h2h`, `totals@2.5`, ...).
    pub fn market_type(&self) -> &str {
        self.market_id
            .rsplit_once(':')
            .map_or(self.market_id.as_str(), |(_, market_type)| market_type)
    }
}

/// Aggregate figures over a set of settled legs.
///
/// `roi_pct` is profit over total stake; `win_rate_pct` counts pushes as
/// neither wins nor losses but includes them in the total.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BetStats {
    /// Settled legs.
    pub bets: usize,
    /// Winning legs.
    pub wins: usize,
    /// Losing legs.
    pub losses: usize,
    /// Pushed legs.
    pub pushes: usize,
    /// Sum of stakes.
    pub staked: Decimal,
    /// Net P&L.
    pub profit: Decimal,
    /// Wins over bets, in percent.
    pub win_rate_pct: Decimal,
    /// Profit over stake, in percent.
    pub roi_pct: Decimal,
    /// Mean P&L per leg.
    pub avg_profit: Decimal,
}

impl BetStats {
    fn add(&mut self, bet: &SettledBet) {
        self.bets += 1;
        match bet.result() {
            BetResult::Win => self.wins += 1,
            BetResult::Loss => self.losses += 1,
            BetResult::Push => self.pushes += 1,
        }
        self.staked += bet.stake;
        self.profit += bet.pnl;
    }

    fn finish(mut self) -> Self {
        if self.bets > 0 {
            let bets = Decimal::from(self.bets);
            self.win_rate_pct = (Decimal::from(self.wins) / bets * Decimal::ONE_HUNDRED).round_dp(2);
            self.avg_profit = (self.profit / bets).round_dp(2);
        }
        if !self.staked.is_zero() {
            self.roi_pct = (self.profit / self.staked * Decimal::ONE_HUNDRED).round_dp(4);
        }
        self
    }
}

/// Statistics overall and broken down by market type and bookmaker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HistoryStats {
    /// Every settled leg.
    pub overall: BetStats,
    /// Keyed by market type.
    pub by_market_type: BTreeMap<String, BetStats>,
    /// Keyed by bookmaker.
    pub by_bookmaker: BTreeMap<String, BetStats>,
}

/// Append-only record of settled legs, shared between clones.
#[derive(Debug, Clone, Default)]
pub struct BetHistory {
    inner: Arc<Mutex<Vec<SettledBet>>>,
}

impl BetHistory {
    /// Empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one settled leg.
    pub fn record(&self, bet: SettledBet) {
        self.inner.lock().push(bet);
    }

    /// Number of settled legs.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True if nothing has settled yet.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Up to `limit` most recent legs, newest first.
    pub fn recent(&self, limit: usize) -> Vec<SettledBet> {
        self.inner.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> HistoryStats {
        let bets = self.inner.lock();
        let mut overall = BetStats::default();
        let mut by_market_type: BTreeMap<String, BetStats> = BTreeMap::new();
        let mut by_bookmaker: BTreeMap<String, BetStats> = BTreeMap::new();

        for bet in bets.iter() {
            overall.add(bet);
            by_market_type.entry(bet.market_type().to_string()).or_default().add(bet);
            by_bookmaker.entry(bet.bookmaker.clone()).or_default().add(bet);
        }

        HistoryStats {
            overall: overall.finish(),
            by_market_type: by_market_type.into_iter().map(|(k, v)| (k, v.finish())).collect(),
            by_bookmaker: by_bookmaker.into_iter().map(|(k, v)| (k, v.finish())).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn bet(id: u64, market_id: &str, bookmaker: &str, stake: Decimal, pnl: Decimal) -> SettledBet {
        SettledBet {
            reservation: ReservationId(id),
            market_id: market_id.into(),
            outcome: "A".into(),
            bookmaker: bookmaker.into(),
            stake,
            odds: dec!(2.0),
            pnl,
            settled_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn empty_history_has_zero_stats() {
        assert_eq!(BetHistory::new().stats(), HistoryStats::default());
    }

    #[test]
    fn stats_aggregate_and_break_down() {
        let history = BetHistory::new();
        history.record(bet(1, "e1:h2h", "x", dec!(50), dec!(55)));
        history.record(bet(2, "e1:h2h", "y", dec!(50), dec!(-50)));
        history.record(bet(3, "e2:totals@2.5", "x", dec!(20), dec!(0)));

        let stats = history.stats();

        assert_eq!(
            stats.overall,
            BetStats {
                bets: 3,
                wins: 1,
                losses: 1,
                pushes: 1,
                staked: dec!(120),
                profit: dec!(5),
                win_rate_pct: dec!(33.33),
                roi_pct: dec!(4.1667),
                avg_profit: dec!(1.67),
            }
        );
        assert_eq!(stats.by_market_type["h2h"].bets, 2);
        assert_eq!(stats.by_market_type["totals@2.5"].pushes, 1);
        assert_eq!(stats.by_bookmaker["x"].profit, dec!(55));
        assert_eq!(stats.by_bookmaker["y"].roi_pct, dec!(-100));
    }

    #[test]
    fn recent_is_newest_first() {
        let history = BetHistory::new();
        for id in 1..=5 {
            history.record(bet(id, "e:h2h", "x", dec!(10), dec!(1)));
        }
        let ids: Vec<_> = history.recent(2).iter().map(|b| b.reservation.0).collect();
        assert_eq!(ids, vec![5, 4]);
    }
}
