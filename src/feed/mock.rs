//! Scripted odds feed for tests and demos.
//!
//! This module provides a feed that replays queued batches and failures
//! without making network requests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use time::OffsetDateTime;

use super::{OddsBatch, OddsFeed};
use crate::error::FeedError;

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Return this batch.
    Batch(OddsBatch),
    /// Fail with this reason.
    Fail(String),
    /// Never answer (until the caller's timeout fires).
    Hang,
}

#[derive(Debug, Default)]
struct MockState {
    script: VecDeque<MockResponse>,
    fallback: Option<MockResponse>,
    latency: Duration,
}

/// Mock feed replaying scripted responses.
///
/// Queued responses are consumed in order; once the queue is empty the
/// fallback response (an empty batch unless set) is repeated. Quotes are
/// re-stamped with the fetch time unless `keep_timestamps` is set.
#[derive(Debug, Clone)]
pub struct MockFeed {
    name: String,
    state: Arc<Mutex<MockState>>,
    calls: Arc<AtomicUsize>,
    restamp: bool,
}

impl MockFeed {
    /// Create a mock feed named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(MockState::default())),
            calls: Arc::new(AtomicUsize::new(0)),
            restamp: true,
        }
    }

    /// Keep the timestamps stored in scripted quotes.
    pub fn keep_timestamps(mut self) -> Self {
        self.restamp = false;
        self
    }

    /// Delay every reply by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = latency;
        self
    }

    /// Queue a successful reply.
    pub fn push_batch(&self, batch: OddsBatch) {
        self.state.lock().script.push_back(MockResponse::Batch(batch));
    }

    /// Queue a failure.
    pub fn push_failure(&self, reason: impl Into<String>) {
        self.state.lock().script.push_back(MockResponse::Fail(reason.into()));
    }

    /// Queue a reply that never arrives.
    pub fn push_hang(&self) {
        self.state.lock().script.push_back(MockResponse::Hang);
    }

    /// Reply used once the queue is empty.
    pub fn set_fallback(&self, response: MockResponse) {
        self.state.lock().fallback = Some(response);
    }

    /// Number of fetches so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OddsFeed for MockFeed {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_odds(&self) -> Result<OddsBatch, FeedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (response, latency) = {
            let mut state = self.state.lock();
            let response = state
                .script
                .pop_front()
                .or_else(|| state.fallback.clone())
                .unwrap_or(MockResponse::Batch(OddsBatch::default()));
            (response, state.latency)
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match response {
            MockResponse::Batch(mut batch) => {
                if self.restamp {
                    let now = OffsetDateTime::now_utc();
                    for quote in &mut batch.quotes {
                        quote.timestamp = now;
                    }
                }
                Ok(batch)
            }
            MockResponse::Fail(reason) => Err(FeedError::Failed {
                feed: self.name.clone(),
                reason,
            }),
            MockResponse::Hang => {
                std::future::pending::<()>().await;
                Err(FeedError::Timeout {
                    feed: self.name.clone(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{Market, OddsQuote};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn replays_script_then_fallback() {
        let feed = MockFeed::new("mock");
        let market = Market::new("e", "h2h", ["A", "B"]);
        let quote = OddsQuote::new(&market.id, "A", "x", dec!(2.0), OffsetDateTime::UNIX_EPOCH);
        feed.push_batch(OddsBatch::new(vec![market], vec![quote]));
        feed.push_failure("boom");

        let first = feed.fetch_odds().await.unwrap();
        assert_eq!(first.quotes.len(), 1);
        assert!(first.quotes[0].timestamp > OffsetDateTime::UNIX_EPOCH);

        assert!(matches!(feed.fetch_odds().await, Err(FeedError::Failed { .. })));
        assert!(feed.fetch_odds().await.unwrap().is_empty());
        assert_eq!(feed.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn hang_never_resolves() {
        let feed = MockFeed::new("slow");
        feed.push_hang();

        let result = tokio::time::timeout(Duration::from_secs(5), feed.fetch_odds()).await;
        assert!(result.is_err());
    }
}
