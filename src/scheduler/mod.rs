//! Scheduler module for the periodic arbitrage cycle.
//!
//! This module handles:
//! - The explicit state machine and backoff policy
//! - Running fetch, detect, size and dispatch phases without overlap
//! - Cycle reports and the status shared with the API

pub mod cycle;
pub mod report;
pub mod state;

pub use cycle::{Scheduler, SchedulerSettings};
pub use report::{CycleReport, SchedulerStatus, StatusView};
pub use state::{backoff_delay, InvalidTransition, SchedulerEvent, SchedulerState};
