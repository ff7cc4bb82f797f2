//! Unified error types for the arbitrage bot.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::bankroll::ReservationId;

/// Unified error type for the arbitrage bot.
#[derive(Error, Debug)]
pub enum BotError {
    /// Configuration loading error.
    #[error("configuration error: {0}")]
    Config(#[from] envy::Error),

    /// Configuration loaded but failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Odds feed error.
    #[error("feed error: {0}")]
    Feed(#[from] FeedError),

    /// Quote ingestion error.
    #[error("quote error: {0}")]
    Quote(#[from] QuoteError),

    /// Bankroll ledger error.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Execution hand-off error.
    #[error("execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// Ledger persistence error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a single odds feed during a fetch.
#[derive(Error, Debug)]
pub enum FeedError {
    /// Feed did not answer within its timeout.
    #[error("feed {feed} timed out")]
    Timeout {
        /// Feed name.
        feed: String,
    },

    /// Feed answered with an error.
    #[error("feed {feed} failed: {reason}")]
    Failed {
        /// Feed name.
        feed: String,
        /// Reason for failure.
        reason: String,
    },

    /// Every API key has used up its call budget.
    #[error("feed {feed} skipped: API call budget exhausted")]
    QuotaExhausted {
        /// Feed name.
        feed: String,
    },

    /// HTTP request failed.
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Feed payload could not be parsed.
    #[error("failed to parse feed payload: {0}")]
    Parse(String),
}

/// Reasons a quote is refused by the odds store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuoteError {
    /// Quote refers to a market that was never registered.
    #[error("unknown market {0}")]
    UnknownMarket(String),

    /// Quote refers to an outcome outside the market's outcome set.
    #[error("outcome {outcome} is not part of market {market}")]
    UnknownOutcome {
        /// Market id.
        market: String,
        /// Offending outcome.
        outcome: String,
    },

    /// Decimal odds must be strictly greater than 1.
    #[error("invalid decimal odds {0}")]
    InvalidOdds(Decimal),

    /// Liquidity cap must be positive when present.
    #[error("invalid liquidity cap {0}")]
    InvalidLiquidity(Decimal),

    /// A market was re-registered with a different outcome set.
    #[error("market {0} re-registered with a different outcome set")]
    OutcomeSetMismatch(String),
}

/// Bankroll ledger errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Not enough unreserved capital.
    #[error("insufficient funds: need {required}, available {available}")]
    InsufficientFunds {
        /// Requested amount.
        required: Decimal,
        /// Available capital at the time of the request.
        available: Decimal,
    },

    /// Amounts must be positive.
    #[error("invalid amount {0}")]
    InvalidAmount(Decimal),

    /// Reservation id is not open.
    #[error("unknown reservation {0}")]
    UnknownReservation(ReservationId),

    /// Settlement would lose more than the reserved stake.
    #[error("invalid settlement for {id}: pnl {pnl} exceeds stake {stake}")]
    InvalidSettlement {
        /// Reservation being settled.
        id: ReservationId,
        /// Reported pnl.
        pnl: Decimal,
        /// Reserved stake.
        stake: Decimal,
    },

    /// Ledger invariants no longer hold. Fatal.
    #[error("ledger corruption: {0}")]
    Corruption(String),
}

impl LedgerError {
    /// Whether this error must halt the scheduler.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LedgerError::Corruption(_))
    }
}

/// Execution hand-off errors.
#[derive(Error, Debug, Clone)]
pub enum ExecutionError {
    /// Whole plan rejected by the execution venue.
    #[error("execution rejected: {reason}")]
    Rejected {
        /// Rejection reason.
        reason: String,
    },

    /// Submission did not complete in time.
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout in milliseconds.
        timeout_ms: u64,
    },

    /// Execution venue unreachable.
    #[error("execution unavailable: {0}")]
    Unavailable(String),
}

/// Ledger persistence errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot (de)serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, BotError>;
