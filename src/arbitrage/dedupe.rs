//! Suppression of opportunities that were already dispatched recently.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use super::calculator::ArbitrageOpportunity;

/// Remembers dispatched opportunity fingerprints for a fixed window.
#[derive(Debug)]
pub struct SeenOpportunities {
    window: Duration,
    seen: HashMap<String, Instant>,
}

impl SeenOpportunities {
    /// Create a tracker with the given suppression window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// Whether the same market, legs and prices were dispatched within the window.
    pub fn is_recent(&self, opportunity: &ArbitrageOpportunity) -> bool {
        self.seen
            .get(&opportunity.fingerprint())
            .is_some_and(|at| at.elapsed() < self.window)
    }

    /// Remember `opportunity` as dispatched now.
    pub fn record(&mut self, opportunity: &ArbitrageOpportunity) {
        self.seen.insert(opportunity.fingerprint(), Instant::now());
    }

    /// Forget entries older than the window. Returns how many were dropped.
    pub fn prune(&mut self) -> usize {
        let before = self.seen.len();
        let window = self.window;
        self.seen.retain(|_, at| at.elapsed() < window);
        before - self.seen.len()
    }

    /// Number of remembered fingerprints.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
