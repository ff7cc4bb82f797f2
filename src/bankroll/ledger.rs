//! Bankroll ledger: available capital, reservations and realized P&L.
//!
//! All mutations go through one mutex, so two cycles (or a cycle and a
//! settlement callback) can never reserve the same capital twice, and every
//! read of `available` reflects all earlier reservations.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, error, info};

use crate::error::LedgerError;
use crate::metrics;

/// Identifier of one capital reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(pub u64);

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Capital held for one dispatched stake until it settles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Reservation id.
    pub id: ReservationId,
    /// Amount held.
    pub amount: Decimal,
    /// Free-form description (market / outcome / bookmaker).
    pub label: String,
    /// When the hold was taken.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Result of settling one reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    /// Stake that was held.
    pub stake: Decimal,
    /// Realized profit or loss.
    pub pnl: Decimal,
}

/// Serializable copy of the ledger state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    /// Total capital, reserved or not.
    pub total_capital: Decimal,
    /// Sum of open reservations.
    pub reserved: Decimal,
    /// Cumulative realized P&L.
    pub realized_pnl: Decimal,
    /// Open reservations.
    pub reservations: Vec<Reservation>,
    /// Next reservation id to hand out.
    pub next_id: u64,
    /// When this snapshot was taken.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl LedgerSnapshot {
    /// Capital not held by any reservation.
    pub fn available(&self) -> Decimal {
        self.total_capital - self.reserved
    }
}

#[derive(Debug)]
struct LedgerState {
    total_capital: Decimal,
    reserved: Decimal,
    realized_pnl: Decimal,
    reservations: BTreeMap<ReservationId, Reservation>,
    next_id: u64,
    corrupted: Option<String>,
}

impl LedgerState {
    fn available(&self) -> Decimal {
        self.total_capital - self.reserved
    }

    fn check_invariants(&self) -> Result<(), String> {
        let held: Decimal = self.reservations.values().map(|r| r.amount).sum();
        if held != self.reserved {
            return Err(format!(
                "reserved {} does not match open reservations {}",
                self.reserved, held
            ));
        }
        if self.reserved < Decimal::ZERO {
            return Err(format!("reserved {} is negative", self.reserved));
        }
        if self.reserved > self.total_capital {
            return Err(format!(
                "reserved {} exceeds total capital {}",
                self.reserved, self.total_capital
            ));
        }
        if let Some(r) = self.reservations.values().find(|r| r.amount <= Decimal::ZERO) {
            return Err(format!("reservation {} holds non-positive {}", r.id, r.amount));
        }
        Ok(())
    }

    fn open(&mut self, amount: Decimal, label: String, now: OffsetDateTime) -> ReservationId {
        let id = ReservationId(self.next_id);
        self.next_id += 1;
        self.reserved += amount;
        self.reservations.insert(
            id,
            Reservation {
                id,
                amount,
                label,
                created_at: now,
            },
        );
        id
    }

    fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            total_capital: self.total_capital,
            reserved: self.reserved,
            realized_pnl: self.realized_pnl,
            reservations: self.reservations.values().cloned().collect(),
            next_id: self.next_id,
            updated_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Shared handle to the single bankroll ledger.
#[derive(Debug, Clone)]
pub struct Ledger {
    inner: Arc<Mutex<LedgerState>>,
}

impl Ledger {
    /// Fresh ledger holding `total_capital` and no reservations.
    pub fn new(total_capital: Decimal) -> Self {
        Self::from_state(LedgerState {
            total_capital,
            reserved: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            reservations: BTreeMap::new(),
            next_id: 1,
            corrupted: None,
        })
    }

    /// Rebuild a ledger from a persisted snapshot, checking its invariants.
    pub fn restore(snapshot: LedgerSnapshot) -> Result<Self, LedgerError> {
        let max_id = snapshot.reservations.iter().map(|r| r.id.0).max().unwrap_or(0);
        let state = LedgerState {
            total_capital: snapshot.total_capital,
            reserved: snapshot.reserved,
            realized_pnl: snapshot.realized_pnl,
            reservations: snapshot
                .reservations
                .into_iter()
                .map(|r| (r.id, r))
                .collect(),
            next_id: snapshot.next_id.max(max_id + 1),
            corrupted: None,
        };
        state.check_invariants().map_err(LedgerError::Corruption)?;
        info!(
            total_capital = %state.total_capital,
            reserved = %state.reserved,
            open = state.reservations.len(),
            "Ledger restored"
        );
        Ok(Self::from_state(state))
    }

    fn from_state(state: LedgerState) -> Self {
        metrics::record_ledger(state.total_capital, state.reserved);
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// Run one mutation under the gate, then re-check the invariants.
    fn mutate<T>(
        &self,
        op: impl FnOnce(&mut LedgerState) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut state = self.inner.lock();
        if let Some(reason) = &state.corrupted {
            return Err(LedgerError::Corruption(reason.clone()));
        }

        let result = op(&mut *state);

        if let Err(reason) = state.check_invariants() {
            error!(reason = %reason, "Ledger invariant violated, halting ledger");
            state.corrupted = Some(reason.clone());
            return Err(LedgerError::Corruption(reason));
        }
        metrics::record_ledger(state.total_capital, state.reserved);
        result
    }

    /// Capital not held by any reservation.
    pub fn available(&self) -> Decimal {
        self.inner.lock().available()
    }

    /// Total capital.
    pub fn total_capital(&self) -> Decimal {
        self.inner.lock().total_capital
    }

    /// Sum of open reservations.
    pub fn reserved(&self) -> Decimal {
        self.inner.lock().reserved
    }

    /// Cumulative realized P&L.
    pub fn realized_pnl(&self) -> Decimal {
        self.inner.lock().realized_pnl
    }

    /// Hold `amount` of available capital.
    pub fn reserve(&self, amount: Decimal, label: impl Into<String>) -> Result<ReservationId, LedgerError> {
        let label = label.into();
        self.mutate(|state| {
            validate_amount(amount)?;
            let available = state.available();
            if amount > available {
                return Err(LedgerError::InsufficientFunds {
                    required: amount,
                    available,
                });
            }
            let id = state.open(amount, label, OffsetDateTime::now_utc());
            debug!(id = %id, amount = %amount, "Capital reserved");
            Ok(id)
        })
    }

    /// Hold several amounts at once: either every hold is taken or none is.
    pub fn reserve_plan(&self, legs: &[(Decimal, String)]) -> Result<Vec<ReservationId>, LedgerError> {
        self.mutate(|state| {
            let mut required = Decimal::ZERO;
            for (amount, _) in legs {
                validate_amount(*amount)?;
                required += *amount;
            }
            let available = state.available();
            if required > available {
                return Err(LedgerError::InsufficientFunds {
                    required,
                    available,
                });
            }
            let now = OffsetDateTime::now_utc();
            let ids: Vec<_> = legs
                .iter()
                .map(|(amount, label)| state.open(*amount, label.clone(), now))
                .collect();
            debug!(legs = ids.len(), total = %required, "Plan reserved");
            Ok(ids)
        })
    }

    /// Cancel a reservation entirely. Returns the released amount.
    pub fn release(&self, id: ReservationId) -> Result<Decimal, LedgerError> {
        self.mutate(|state| {
            let reservation = state
                .reservations
                .remove(&id)
                .ok_or(LedgerError::UnknownReservation(id))?;
            state.reserved -= reservation.amount;
            debug!(id = %id, amount = %reservation.amount, "Reservation released");
            Ok(reservation.amount)
        })
    }

    /// Release `amount` of a reservation, keeping the rest held.
    ///
    /// Releasing the whole amount closes the reservation. Returns what is
    /// still held.
    pub fn release_partial(&self, id: ReservationId, amount: Decimal) -> Result<Decimal, LedgerError> {
        self.mutate(|state| {
            validate_amount(amount)?;
            let held = state
                .reservations
                .get(&id)
                .map(|r| r.amount)
                .ok_or(LedgerError::UnknownReservation(id))?;
            if amount > held {
                return Err(LedgerError::InvalidAmount(amount));
            }
            state.reserved -= amount;
            let remaining = held - amount;
            if remaining.is_zero() {
                state.reservations.remove(&id);
            } else if let Some(r) = state.reservations.get_mut(&id) {
                r.amount = remaining;
            }
            debug!(id = %id, released = %amount, remaining = %remaining, "Reservation reduced");
            Ok(remaining)
        })
    }

    /// Close a reservation with its realized result.
    ///
    /// `pnl` is added to realized P&L and total capital; it may not be below
    /// minus the held stake.
    pub fn settle(&self, id: ReservationId, pnl: Decimal) -> Result<Settlement, LedgerError> {
        self.mutate(|state| {
            let stake = state
                .reservations
                .get(&id)
                .map(|r| r.amount)
                .ok_or(LedgerError::UnknownReservation(id))?;
            if pnl < -stake {
                return Err(LedgerError::InvalidSettlement { id, pnl, stake });
            }
            state.reservations.remove(&id);
            state.reserved -= stake;
            state.realized_pnl += pnl;
            state.total_capital += pnl;
            info!(id = %id, stake = %stake, pnl = %pnl, total_capital = %state.total_capital, "Reservation settled");
            Ok(Settlement { stake, pnl })
        })
    }

    /// Add external capital.
    pub fn deposit(&self, amount: Decimal) -> Result<Decimal, LedgerError> {
        self.mutate(|state| {
            validate_amount(amount)?;
            state.total_capital += amount;
            info!(amount = %amount, total_capital = %state.total_capital, "Deposit");
            Ok(state.total_capital)
        })
    }

    /// Remove external capital; only unreserved capital can leave.
    pub fn withdraw(&self, amount: Decimal) -> Result<Decimal, LedgerError> {
        self.mutate(|state| {
            validate_amount(amount)?;
            let available = state.available();
            if amount > available {
                return Err(LedgerError::InsufficientFunds {
                    required: amount,
                    available,
                });
            }
            state.total_capital -= amount;
            info!(amount = %amount, total_capital = %state.total_capital, "Withdrawal");
            Ok(state.total_capital)
        })
    }

    /// Check the invariants without mutating.
    pub fn verify(&self) -> Result<(), LedgerError> {
        let mut state = self.inner.lock();
        if let Some(reason) = &state.corrupted {
            return Err(LedgerError::Corruption(reason.clone()));
        }
        if let Err(reason) = state.check_invariants() {
            state.corrupted = Some(reason.clone());
            return Err(LedgerError::Corruption(reason));
        }
        Ok(())
    }

    /// Look up an open reservation.
    pub fn reservation(&self, id: ReservationId) -> Option<Reservation> {
        self.inner.lock().reservations.get(&id).cloned()
    }

    /// Number of open reservations.
    pub fn open_count(&self) -> usize {
        self.inner.lock().reservations.len()
    }

    /// Serializable copy of the current state.
    pub fn snapshot(&self) -> LedgerSnapshot {
        self.inner.lock().snapshot()
    }
}

fn validate_amount(amount: Decimal) -> Result<(), LedgerError> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount(amount));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rust_decimal_macros::dec;

    #[test]
    fn reserve_reduces_available() {
        let ledger = Ledger::new(dec!(100));
        ledger.reserve(dec!(30), "a").unwrap();

        assert_eq!(ledger.available(), dec!(70));
        assert_eq!(ledger.reserved(), dec!(30));
        assert_eq!(ledger.total_capital(), dec!(100));
    }

    #[test]
    fn reserve_beyond_available_fails() {
        let ledger = Ledger::new(dec!(100));
        ledger.reserve(dec!(80), "a").unwrap();

        assert_eq!(
            ledger.reserve(dec!(30), "b"),
            Err(LedgerError::InsufficientFunds {
                required: dec!(30),
                available: dec!(20),
            })
        );
        assert_eq!(ledger.available(), dec!(20));
    }

    #[test]
    fn release_returns_capital() {
        let ledger = Ledger::new(dec!(100));
        let id = ledger.reserve(dec!(40), "a").unwrap();

        assert_eq!(ledger.release(id).unwrap(), dec!(40));
        assert_eq!(ledger.available(), dec!(100));
        assert_eq!(ledger.release(id), Err(LedgerError::UnknownReservation(id)));
    }

    #[test]
    fn release_partial_keeps_remainder() {
        let ledger = Ledger::new(dec!(100));
        let id = ledger.reserve(dec!(40), "a").unwrap();

        assert_eq!(ledger.release_partial(id, dec!(15)).unwrap(), dec!(25));
        assert_eq!(ledger.reserved(), dec!(25));
        assert_eq!(ledger.release_partial(id, dec!(25)).unwrap(), dec!(0));
        assert!(ledger.reservation(id).is_none());
        assert_eq!(ledger.release_partial(id, dec!(1)), Err(LedgerError::UnknownReservation(id)));
    }

    #[test]
    fn settle_moves_pnl_into_capital() {
        let ledger = Ledger::new(dec!(100));
        let win = ledger.reserve(dec!(40), "win").unwrap();
        let lose = ledger.reserve(dec!(30), "lose").unwrap();

        ledger.settle(win, dec!(44)).unwrap();
        ledger.settle(lose, dec!(-30)).unwrap();

        assert_eq!(ledger.reserved(), dec!(0));
        assert_eq!(ledger.realized_pnl(), dec!(14));
        assert_eq!(ledger.total_capital(), dec!(114));
    }

    #[test]
    fn settle_cannot_lose_more_than_stake() {
        let ledger = Ledger::new(dec!(100));
        let id = ledger.reserve(dec!(10), "a").unwrap();

        assert!(matches!(
            ledger.settle(id, dec!(-11)),
            Err(LedgerError::InvalidSettlement { .. })
        ));
        assert_eq!(ledger.reserved(), dec!(10));
    }

    #[test]
    fn reserve_plan_is_all_or_nothing() {
        let ledger = Ledger::new(dec!(100));
        let legs = vec![(dec!(60), "a".to_string()), (dec!(50), "b".to_string())];

        assert!(matches!(
            ledger.reserve_plan(&legs),
            Err(LedgerError::InsufficientFunds { .. })
        ));
        assert_eq!(ledger.open_count(), 0);

        let legs = vec![(dec!(60), "a".to_string()), (dec!(40), "b".to_string())];
        assert_eq!(ledger.reserve_plan(&legs).unwrap().len(), 2);
        assert_eq!(ledger.available(), dec!(0));
    }

    #[test]
    fn withdraw_limited_to_available() {
        let ledger = Ledger::new(dec!(100));
        ledger.reserve(dec!(70), "a").unwrap();

        assert!(ledger.withdraw(dec!(40)).is_err());
        assert_eq!(ledger.withdraw(dec!(30)).unwrap(), dec!(70));
        assert_eq!(ledger.deposit(dec!(5)).unwrap(), dec!(75));
    }

    #[test]
    fn non_positive_amounts_rejected() {
        let ledger = Ledger::new(dec!(100));
        assert_eq!(ledger.reserve(dec!(0), "a"), Err(LedgerError::InvalidAmount(dec!(0))));
        assert_eq!(ledger.deposit(dec!(-1)), Err(LedgerError::InvalidAmount(dec!(-1))));
    }

    #[test]
    fn restore_rejects_inconsistent_snapshot() {
        let ledger = Ledger::new(dec!(100));
        ledger.reserve(dec!(30), "a").unwrap();
        let mut snapshot = ledger.snapshot();
        snapshot.reserved = dec!(20);

        assert!(matches!(
            Ledger::restore(snapshot),
            Err(LedgerError::Corruption(_))
        ));
    }

    #[test]
    fn restore_round_trips_open_reservations() {
        let ledger = Ledger::new(dec!(100));
        let id = ledger.reserve(dec!(30), "a").unwrap();
        let restored = Ledger::restore(ledger.snapshot()).unwrap();

        assert_eq!(restored.available(), dec!(70));
        assert_eq!(restored.reservation(id).unwrap().amount, dec!(30));
        let next = restored.reserve(dec!(1), "b").unwrap();
        assert!(next > id);
    }

    #[test]
    fn concurrent_reservations_never_overcommit() {
        let ledger = Ledger::new(dec!(100));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let ledger = ledger.clone();
                std::thread::spawn(move || ledger.reserve(dec!(10), format!("t{i}")).is_ok())
            })
            .collect();
        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(successes, 10);
        assert_eq!(ledger.available(), dec!(0));
        assert!(ledger.verify().is_ok());
    }

    #[test]
    fn random_interleavings_preserve_invariants() {
        for seed in 0..20u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let ledger = Ledger::new(Decimal::from(rng.gen_range(50..500)));
            let mut open: Vec<ReservationId> = Vec::new();

            for _ in 0..300 {
                let amount = Decimal::new(rng.gen_range(1..20_000), 2);
                match rng.gen_range(0..6) {
                    0 | 1 => {
                        if let Ok(id) = ledger.reserve(amount, "r") {
                            open.push(id);
                        }
                    }
                    2 if !open.is_empty() => {
                        let id = open.swap_remove(rng.gen_range(0..open.len()));
                        ledger.release(id).unwrap();
                    }
                    3 if !open.is_empty() => {
                        let idx = rng.gen_range(0..open.len());
                        let held = ledger.reservation(open[idx]).unwrap().amount;
                        let part = (held * Decimal::new(rng.gen_range(1..=100), 2)).round_dp(2);
                        if part > Decimal::ZERO && ledger.release_partial(open[idx], part).unwrap().is_zero() {
                            open.swap_remove(idx);
                        }
                    }
                    4 if !open.is_empty() => {
                        let id = open.swap_remove(rng.gen_range(0..open.len()));
                        let stake = ledger.reservation(id).unwrap().amount;
                        let pnl = if rng.gen_bool(0.5) {
                            -stake
                        } else {
                            stake * Decimal::new(rng.gen_range(1..400), 2)
                        };
                        ledger.settle(id, pnl).unwrap();
                    }
                    _ => {
                        if rng.gen_bool(0.5) {
                            ledger.deposit(amount).unwrap();
                        } else {
                            let _ = ledger.withdraw(amount);
                        }
                    }
                }

                let snapshot = ledger.snapshot();
                assert!(snapshot.reserved <= snapshot.total_capital, "seed {seed}");
                assert!(snapshot.reserved >= Decimal::ZERO, "seed {seed}");
                assert_eq!(
                    snapshot.reserved,
                    snapshot.reservations.iter().map(|r| r.amount).sum::<Decimal>(),
                    "seed {seed}"
                );
                assert!(ledger.verify().is_ok(), "seed {seed}");
            }
        }
    }
}
