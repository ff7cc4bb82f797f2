//! Feed module for pulling bookmaker odds.
//!
//! This module handles:
//! - The feed collaborator contract used by the scheduler
//! - The Odds API v4 client (one feed per sport)
//! - API key rotation under a daily call budget
//! - A scripted mock feed for tests and demos

pub mod mock;
pub mod odds_api;
pub mod quota;

use async_trait::async_trait;

use crate::error::FeedError;
use crate::market::{Market, OddsQuote};

pub use mock::{MockFeed, MockResponse};
pub use odds_api::{EventFilter, OddsApiFeed};
pub use quota::{ApiKeyPool, KeyUsageView};

/// Markets announced by one fetch, with their quotes.
#[derive(Debug, Clone, Default)]
pub struct OddsBatch {
    /// Markets the quotes refer to.
    pub markets: Vec<Market>,
    /// Quotes in arrival order.
    pub quotes: Vec<OddsQuote>,
}

impl OddsBatch {
    /// Batch from parts.
    pub fn new(markets: Vec<Market>, quotes: Vec<OddsQuote>) -> Self {
        Self { markets, quotes }
    }

    /// True if nothing was returned.
    pub fn is_empty(&self) -> bool {
        self.markets.is_empty() && self.quotes.is_empty()
    }
}

/// A source of bookmaker odds.
///
/// Each fetch is independent; the scheduler applies the timeout and does not
/// retry within a cycle.
#[async_trait]
pub trait OddsFeed: Send + Sync {
    /// Feed name for logs and metrics.
    fn name(&self) -> &str;

    /// Fetch the current odds.
    async fn fetch_odds(&self) -> Result<OddsBatch, FeedError>;
}
