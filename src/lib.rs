//! Sportsbook odds arbitrage engine.
//!
//! This library polls bookmaker odds on a fixed cadence, looks for markets
//! where backing every outcome at the best available price costs less than
//! the guaranteed payout, sizes stakes against a single bankroll ledger and
//! hands the resulting plans to an execution venue.
//!
//! # Arbitrage
//!
//! With decimal odds `o_i`, staking `S * (1/o_i) / Σ(1/o_j)` on each outcome
//! returns the same amount whichever outcome wins. When `Σ(1/o_j) < 1` that
//! return exceeds the outlay:
//!
//! ```text
//! A @ 2.10 (bookmaker X)   1/2.10 = 0.4762
//! B @ 2.05 (bookmaker Y)   1/2.05 = 0.4878
//! ───────────────────────────────────────
//! Implied sum:                      0.9640 < 1
//! Edge:                             0.0360
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration loading from environment
//! - [`error`]: Unified error types
//! - [`market`]: Markets and bookmaker quotes
//! - [`odds`]: Concurrent odds store and snapshots
//! - [`arbitrage`]: Opportunity detection and deduplication
//! - [`bankroll`]: Capital ledger and its persistence
//! - [`trading`]: Stake sizing, execution and open bets
//! - [`feed`]: Odds feeds (The Odds API, mock)
//! - [`scheduler`]: The periodic cycle and its state machine
//! - [`api`]: HTTP API for health, status, settlement and metrics
//! - [`metrics`]: Prometheus metric names and recorders
//! - [`utils`]: Utility functions

pub mod api;
pub mod arbitrage;
pub mod bankroll;
pub mod config;
pub mod error;
pub mod feed;
pub mod market;
pub mod metrics;
pub mod odds;
pub mod scheduler;
pub mod trading;
pub mod utils;

pub use config::Config;
pub use error::{BotError, Result};
