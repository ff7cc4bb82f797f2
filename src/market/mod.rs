//! Market and quote types shared by every stage of the pipeline.
//!
//! This module handles:
//! - Betting propositions with a fixed, ordered outcome set
//! - Normalized bookmaker quotes (decimal odds, liquidity cap)

pub mod types;

pub use types::{Market, OddsQuote, Outcomes};
