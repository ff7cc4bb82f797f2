//! Open bet tracking and per-leg ledger reconciliation.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::execution::ExecutionReport;
use super::history::{BetHistory, SettledBet};
use super::sizer::StakePlan;
use crate::bankroll::{Ledger, ReservationId, Settlement};
use crate::error::LedgerError;

/// An accepted leg awaiting its result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenBet {
    /// Ledger reservation holding the stake.
    pub reservation: ReservationId,
    /// Market id.
    pub market_id: String,
    /// Outcome backed.
    pub outcome: String,
    /// Bookmaker holding the bet.
    pub bookmaker: String,
    /// Matched stake.
    pub stake: Decimal,
    /// Matched odds.
    pub odds: Decimal,
    /// When the bet was accepted.
    #[serde(with = "time::serde::rfc3339")]
    pub placed_at: OffsetDateTime,
}

impl OpenBet {
    /// P&L of this bet once the market resolves.
    pub fn pnl(&self, winning_outcome: &str) -> Decimal {
        if self.outcome == winning_outcome {
            self.stake * (self.odds - Decimal::ONE)
        } else {
            -self.stake
        }
    }
}

/// Ledger effect of reconciling one execution report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Legs now held as open bets.
    pub accepted: usize,
    /// Legs whose reservation was released.
    pub rejected: usize,
    /// Legs whose reservation was already closed elsewhere.
    pub closed: usize,
    /// Capital returned to the available pool.
    pub released: Decimal,
    /// Legs the ledger refused to update; still reserved and not tracked.
    pub unresolved: Vec<ReservationId>,
}

impl Reconciliation {
    fn refused(&mut self, id: ReservationId, error: LedgerError) -> Result<(), LedgerError> {
        match error {
            e if e.is_fatal() => return Err(e),
            LedgerError::UnknownReservation(_) => {
                debug!(id = %id, "Reservation already closed, skipping leg");
                self.closed += 1;
            }
            e => {
                warn!(id = %id, error = %e, "Ledger refused leg update");
                self.unresolved.push(id);
            }
        }
        Ok(())
    }
}

/// Accepted legs keyed by reservation, plus the history of settled ones.
#[derive(Debug, Clone, Default)]
pub struct OpenBets {
    inner: Arc<Mutex<BTreeMap<ReservationId, OpenBet>>>,
    history: BetHistory,
}

impl OpenBets {
    /// Empty book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open bets.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True if nothing is open.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// All open bets in reservation order.
    pub fn list(&self) -> Vec<OpenBet> {
        self.inner.lock().values().cloned().collect()
    }

    /// Open bet for `reservation`.
    pub fn get(&self, reservation: ReservationId) -> Option<OpenBet> {
        self.inner.lock().get(&reservation).cloned()
    }

    /// Legs settled so far.
    pub fn history(&self) -> &BetHistory {
        &self.history
    }

    /// Apply an execution report to the plan's reservations.
    ///
    /// `reservations` are aligned with `plan.stakes`. Rejected or missing legs
    /// are released; underfilled legs release the unmatched part; accepted legs
    /// become open bets. Every leg is processed even if the ledger refuses one
    /// of them: reservations closed in the meantime count as `closed`, other
    /// refusals are listed in `unresolved`. Only a fatal ledger error aborts.
    pub fn reconcile(
        &self,
        ledger: &Ledger,
        plan: &StakePlan,
        reservations: &[ReservationId],
        report: &ExecutionReport,
    ) -> Result<Reconciliation, LedgerError> {
        let mut outcome = Reconciliation::default();
        let now = OffsetDateTime::now_utc();

        for (leg, id) in plan.stakes.iter().zip(reservations) {
            let Some(fill) = report
                .fill_for(&leg.outcome)
                .filter(|f| f.stake > Decimal::ZERO)
            else {
                let reason = report
                    .rejected
                    .iter()
                    .find(|r| r.outcome == leg.outcome)
                    .map(|r| r.reason.as_str())
                    .unwrap_or("missing from report");
                warn!(
                    market = %plan.market_id(),
                    outcome = %leg.outcome,
                    bookmaker = %leg.bookmaker,
                    reason = %reason,
                    "Leg rejected, releasing stake"
                );
                match ledger.release(*id) {
                    Ok(amount) => {
                        outcome.released += amount;
                        outcome.rejected += 1;
                    }
                    Err(e) => outcome.refused(*id, e)?,
                }
                continue;
            };

            if ledger.reservation(*id).is_none() {
                outcome.refused(*id, LedgerError::UnknownReservation(*id))?;
                continue;
            }

            let mut stake = fill.stake;
            if stake < leg.stake {
                let shortfall = leg.stake - stake;
                match ledger.release_partial(*id, shortfall) {
                    Ok(_) => {
                        outcome.released += shortfall;
                        info!(
                            outcome = %leg.outcome,
                            planned = %leg.stake,
                            filled = %stake,
                            "Partial fill, released remainder"
                        );
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(LedgerError::UnknownReservation(_)) => {
                        outcome.refused(*id, LedgerError::UnknownReservation(*id))?;
                        continue;
                    }
                    Err(e) => {
                        warn!(id = %id, error = %e, "Partial release refused, tracking planned stake");
                        stake = leg.stake;
                    }
                }
            } else if stake > leg.stake {
                warn!(outcome = %leg.outcome, planned = %leg.stake, filled = %stake, "Overfill reported, tracking planned stake");
                stake = leg.stake;
            }

            self.inner.lock().insert(
                *id,
                OpenBet {
                    reservation: *id,
                    market_id: plan.market_id().to_string(),
                    outcome: leg.outcome.clone(),
                    bookmaker: fill.bookmaker.clone(),
                    stake,
                    odds: fill.odds,
                    placed_at: now,
                },
            );
            outcome.accepted += 1;
        }

        Ok(outcome)
    }

    /// Settle one reservation with an explicit P&L.
    ///
    /// Works for reservations restored from disk that have no open bet entry;
    /// only tracked bets enter the history.
    pub fn settle(&self, ledger: &Ledger, reservation: ReservationId, pnl: Decimal) -> Result<Settlement, LedgerError> {
        let settlement = ledger.settle(reservation, pnl)?;
        let removed = self.inner.lock().remove(&reservation);
        if let Some(bet) = removed {
            self.history.record(SettledBet {
                reservation,
                market_id: bet.market_id,
                outcome: bet.outcome,
                bookmaker: bet.bookmaker,
                stake: bet.stake,
                odds: bet.odds,
                pnl,
                settled_at: OffsetDateTime::now_utc(),
            });
        }
        Ok(settlement)
    }

    /// Settle every open bet on `market_id` given the winning outcome.
    ///
    /// Winners return `stake * (odds - 1)`, losers lose their stake.
    pub fn settle_market(
        &self,
        ledger: &Ledger,
        market_id: &str,
        winning_outcome: &str,
    ) -> Result<Vec<(ReservationId, Settlement)>, LedgerError> {
        let bets: Vec<OpenBet> = self
            .inner
            .lock()
            .values()
            .filter(|b| b.market_id == market_id)
            .cloned()
            .collect();

        let mut settled = Vec::with_capacity(bets.len());
        for bet in bets {
            let settlement = self.settle(ledger, bet.reservation, bet.pnl(winning_outcome))?;
            settled.push((bet.reservation, settlement));
        }
        info!(market = %market_id, winner = %winning_outcome, bets = settled.len(), "Market settled");
        Ok(settled)
    }
}
