//! Trading module for staking and execution.
//!
//! This module handles:
//! - Payout-equalizing stake sizing
//! - Plan submission to an execution venue
//! - Open bet tracking and ledger reconciliation
//! - Settled bet history and ROI statistics

pub mod execution;
pub mod history;
pub mod position;
pub mod sizer;

pub use execution::{ExecutionClient, ExecutionReport, LegFill, LegRejection, PaperExecutor};
pub use history::{BetHistory, BetResult, BetStats, HistoryStats, SettledBet};
pub use position::{OpenBet, OpenBets, Reconciliation};
pub use sizer::{LegStake, NoPlan, StakePlan, StakeSizer};
