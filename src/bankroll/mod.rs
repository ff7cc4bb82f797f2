//! Bankroll module for capital accounting.
//!
//! This module handles:
//! - The single serialized ledger (reserve / release / settle)
//! - Invariant checking and corruption detection
//! - Snapshot persistence for crash recovery

pub mod ledger;
pub mod persistence;

pub use ledger::{Ledger, LedgerSnapshot, Reservation, ReservationId, Settlement};
pub use persistence::{JsonFileStore, LedgerPersistence, LedgerStore, MemoryStore};
