//! Odds store module for managing normalized bookmaker prices.
//!
//! This module handles:
//! - Concurrent quote ingestion from many feeds (last-timestamp-wins)
//! - Point-in-time snapshots for the detector
//! - Read-time staleness filtering and explicit purging

pub mod snapshot;
pub mod store;

pub use snapshot::{MarketQuotes, OddsSnapshot};
pub use store::{IngestSummary, OddsStore};
