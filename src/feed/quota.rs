//! Per-key call budgets for the odds API.

use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;
use time::{Date, OffsetDateTime};
use tracing::{info, warn};

use crate::config::Config;

#[derive(Debug)]
struct KeyUsage {
    key: String,
    calls: u64,
    exhausted: bool,
}

#[derive(Debug)]
struct PoolState {
    day: Date,
    keys: Vec<KeyUsage>,
}

/// Public view of one key's usage; only the key's last four characters are shown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyUsageView {
    /// Last characters of the key.
    pub key_suffix: String,
    /// Calls made today.
    pub calls: u64,
    /// Whether the key is out of quota until the next UTC day.
    pub exhausted: bool,
}

/// API keys shared by every odds feed, each with a daily call budget.
///
/// `acquire` hands out the key with the most calls left and counts the call.
/// A key is retired for the day once it reaches `max_calls` or the API
/// reports no remaining requests. Counts reset at UTC midnight.
pub struct ApiKeyPool {
    max_calls: u64,
    state: Mutex<PoolState>,
}

impl fmt::Debug for ApiKeyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyPool")
            .field("keys", &self.state.lock().keys.len())
            .field("max_calls", &self.max_calls)
            .finish()
    }
}

impl ApiKeyPool {
    /// Pool over `keys`; `max_calls == 0` means no per-key limit.
    pub fn new(keys: Vec<String>, max_calls: u64) -> Self {
        Self {
            max_calls,
            state: Mutex::new(PoolState {
                day: OffsetDateTime::now_utc().date(),
                keys: keys
                    .into_iter()
                    .map(|key| KeyUsage {
                        key,
                        calls: 0,
                        exhausted: false,
                    })
                    .collect(),
            }),
        }
    }

    /// Pool over every configured key.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.api_keys(), config.max_api_calls)
    }

    /// True if no key is configured.
    pub fn is_empty(&self) -> bool {
        self.state.lock().keys.is_empty()
    }

    /// Take a key for one call, or `None` if every key is spent.
    pub fn acquire(&self) -> Option<String> {
        self.acquire_at(OffsetDateTime::now_utc())
    }

    /// `acquire` with an explicit clock.
    pub fn acquire_at(&self, now: OffsetDateTime) -> Option<String> {
        let mut state = self.state.lock();
        if state.day != now.date() {
            info!(day = %now.date(), "New UTC day, resetting API call counts");
            state.day = now.date();
            for usage in &mut state.keys {
                usage.calls = 0;
                usage.exhausted = false;
            }
        }

        let max_calls = self.max_calls;
        let usage = state
            .keys
            .iter_mut()
            .filter(|u| !u.exhausted && (max_calls == 0 || u.calls < max_calls))
            .min_by_key(|u| u.calls)?;
        usage.calls += 1;
        if max_calls > 0 && usage.calls >= max_calls {
            warn!(key = %suffix(&usage.key), calls = usage.calls, "API key reached its daily budget");
            usage.exhausted = true;
        }
        Some(usage.key.clone())
    }

    /// Apply the remaining-requests count the API reported for `key`.
    pub fn report_remaining(&self, key: &str, remaining: u64) {
        if remaining == 0 {
            self.mark_exhausted(key);
        }
    }

    /// Retire `key` until the next UTC day.
    pub fn mark_exhausted(&self, key: &str) {
        let mut state = self.state.lock();
        if let Some(usage) = state.keys.iter_mut().find(|u| u.key == key) {
            if !usage.exhausted {
                warn!(key = %suffix(key), "API key out of quota");
            }
            usage.exhausted = true;
        }
    }

    /// Calls made today across all keys.
    pub fn total_calls(&self) -> u64 {
        self.state.lock().keys.iter().map(|u| u.calls).sum()
    }

    /// Per-key usage for status output.
    pub fn usage(&self) -> Vec<KeyUsageView> {
        self.state
            .lock()
            .keys
            .iter()
            .map(|u| KeyUsageView {
                key_suffix: suffix(&u.key).to_string(),
                calls: u.calls,
                exhausted: u.exhausted,
            })
            .collect()
    }
}

fn suffix(key: &str) -> &str {
    let start = key
        .char_indices()
        .rev()
        .nth(3)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &key[start..]
}
