//! Arbitrage module for detecting opportunities.
//!
//! This module handles:
//! - Best-price selection per outcome and edge calculations
//! - Opportunity detection across a snapshot
//! - Suppression of recently dispatched duplicates

pub mod calculator;
pub mod dedupe;
pub mod detector;

pub use calculator::{
    calculate_opportunity, select_best_quote, ArbitrageLeg, ArbitrageOpportunity, Legs,
};
pub use dedupe::SeenOpportunities;
pub use detector::{detect, diagnose_no_opportunity, NoOpportunityDiagnosis};
