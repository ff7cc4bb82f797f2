//! Application configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // === Scheduling ===
    /// Seconds between cycle starts.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Per-feed fetch timeout in milliseconds.
    #[serde(default = "default_feed_timeout")]
    pub feed_timeout_ms: u64,

    /// Base backoff delay after a failed fetch, in milliseconds.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Backoff cap in seconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// UTC hour range with no cycles, e.g. "1-7" or "23-5".
    #[serde(default)]
    pub quiet_hours: Option<String>,

    // === Detection ===
    /// Minimum edge (1 - implied sum) an opportunity must exceed.
    #[serde(default = "default_min_edge")]
    pub min_edge: Decimal,

    /// Quotes older than this are ignored by the detector.
    #[serde(default = "default_max_quote_age")]
    pub max_quote_age_secs: u64,

    /// Quotes older than this are dropped from the store.
    #[serde(default = "default_quote_purge_after")]
    pub quote_purge_after_secs: u64,

    /// Identical opportunities are dispatched at most once per window.
    #[serde(default = "default_dedupe_window")]
    pub dedupe_window_secs: u64,

    // === Sizing ===
    /// Smallest total outlay worth dispatching.
    #[serde(default = "default_min_outlay")]
    pub min_outlay: Decimal,

    /// Target total outlay per opportunity.
    #[serde(default = "default_max_outlay")]
    pub max_outlay: Decimal,

    /// Stakes are rounded down to a multiple of this.
    #[serde(default = "default_rounding_increment")]
    pub stake_rounding_increment: Decimal,

    // === Bankroll ===
    /// Capital used when no persisted ledger exists.
    #[serde(default = "default_start_bankroll")]
    pub start_bankroll: Decimal,

    /// Ledger snapshot file.
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,

    // === Execution ===
    /// Per-plan submit timeout in milliseconds.
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_ms: u64,

    /// Worst-case fractional odds slippage applied by the paper executor.
    #[serde(default = "default_slippage")]
    pub slippage: Decimal,

    // === Odds feed ===
    /// The Odds API key.
    #[serde(default)]
    pub odds_api_key: Option<String>,

    /// Additional comma-separated API keys, rotated by remaining quota.
    #[serde(default)]
    pub odds_api_keys: Option<String>,

    /// Calls allowed per key per UTC day (0 = unlimited).
    #[serde(default = "default_max_api_calls")]
    pub max_api_calls: u64,

    /// The Odds API base URL.
    #[serde(default = "default_odds_api_url")]
    pub odds_api_url: String,

    /// Comma-separated sport keys; one feed per sport.
    #[serde(default = "default_sports")]
    pub sports: String,

    /// Bookmaker regions requested from the feed.
    #[serde(default = "default_regions")]
    pub regions: String,

    /// Comma-separated market keys (h2h, totals, ...).
    #[serde(default = "default_market_types")]
    pub market_types: String,

    /// Comma-separated bookmaker allowlist; empty accepts every bookmaker.
    #[serde(default)]
    pub bookmakers: String,

    /// Only events starting within this many hours are priced (0 = no limit).
    #[serde(default = "default_event_window")]
    pub event_window_hours: u64,

    // === Server Configuration ===
    /// HTTP server port for health/metrics endpoints.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub rust_log: String,
}

fn default_poll_interval() -> u64 {
    15
}

fn default_feed_timeout() -> u64 {
    5_000
}

fn default_backoff_base() -> u64 {
    1_000
}

fn default_max_backoff() -> u64 {
    120
}

fn default_min_edge() -> Decimal {
    Decimal::new(2, 3) // 0.002
}

fn default_max_quote_age() -> u64 {
    30
}

fn default_quote_purge_after() -> u64 {
    300
}

fn default_dedupe_window() -> u64 {
    600
}

fn default_min_outlay() -> Decimal {
    Decimal::new(10, 0)
}

fn default_max_outlay() -> Decimal {
    Decimal::new(100, 0)
}

fn default_rounding_increment() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_start_bankroll() -> Decimal {
    Decimal::new(1000, 0)
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("data/ledger.json")
}

fn default_execution_timeout() -> u64 {
    10_000
}

fn default_slippage() -> Decimal {
    Decimal::new(1, 3) // 0.001
}

fn default_max_api_calls() -> u64 {
    500
}

fn default_event_window() -> u64 {
    6
}

fn default_odds_api_url() -> String {
    "https://api.the-odds-api.com".to_string()
}

fn default_sports() -> String {
    "soccer_epl".to_string()
}

fn default_regions() -> String {
    "eu".to_string()
}

fn default_market_types() -> String {
    "h2h".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            feed_timeout_ms: default_feed_timeout(),
            backoff_base_ms: default_backoff_base(),
            max_backoff_secs: default_max_backoff(),
            quiet_hours: None,
            min_edge: default_min_edge(),
            max_quote_age_secs: default_max_quote_age(),
            quote_purge_after_secs: default_quote_purge_after(),
            dedupe_window_secs: default_dedupe_window(),
            min_outlay: default_min_outlay(),
            max_outlay: default_max_outlay(),
            stake_rounding_increment: default_rounding_increment(),
            start_bankroll: default_start_bankroll(),
            ledger_path: default_ledger_path(),
            execution_timeout_ms: default_execution_timeout(),
            slippage: default_slippage(),
            odds_api_key: None,
            odds_api_keys: None,
            max_api_calls: default_max_api_calls(),
            odds_api_url: default_odds_api_url(),
            sports: default_sports(),
            regions: default_regions(),
            market_types: default_market_types(),
            bookmakers: String::new(),
            event_window_hours: default_event_window(),
            port: default_port(),
            rust_log: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from environment, reading .env file first.
    pub fn load() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Check if the configuration is valid.
    pub fn validate(&self) -> Result<(), String> {
        if self.poll_interval_secs == 0 {
            return Err("POLL_INTERVAL_SECS must be positive".to_string());
        }

        if self.min_edge < Decimal::ZERO || self.min_edge >= Decimal::ONE {
            return Err("MIN_EDGE must be in [0, 1)".to_string());
        }

        if self.max_quote_age_secs == 0 {
            return Err("MAX_QUOTE_AGE_SECS must be positive".to_string());
        }

        if self.feed_timeout_ms == 0 {
            return Err("FEED_TIMEOUT_MS must be positive".to_string());
        }

        if self.execution_timeout_ms == 0 {
            return Err("EXECUTION_TIMEOUT_MS must be positive".to_string());
        }

        if self.max_backoff() < self.backoff_base() {
            return Err("MAX_BACKOFF_SECS must not be below BACKOFF_BASE_MS".to_string());
        }

        if self.stake_rounding_increment <= Decimal::ZERO {
            return Err("STAKE_ROUNDING_INCREMENT must be positive".to_string());
        }

        if self.min_outlay <= Decimal::ZERO {
            return Err("MIN_OUTLAY must be positive".to_string());
        }

        if self.max_outlay < self.min_outlay {
            return Err("MAX_OUTLAY must be at least MIN_OUTLAY".to_string());
        }

        if self.slippage < Decimal::ZERO || self.slippage >= Decimal::ONE {
            return Err("SLIPPAGE must be in [0, 1)".to_string());
        }

        if self.start_bankroll < Decimal::ZERO {
            return Err("START_BANKROLL must not be negative".to_string());
        }

        self.quiet_hours()?;

        Ok(())
    }

    /// Interval between cycle starts.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Per-feed fetch timeout.
    pub fn feed_timeout(&self) -> Duration {
        Duration::from_millis(self.feed_timeout_ms)
    }

    /// Base backoff delay.
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Backoff cap.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    /// Staleness threshold for quotes.
    pub fn max_quote_age(&self) -> Duration {
        Duration::from_secs(self.max_quote_age_secs)
    }

    /// Age after which quotes are purged.
    pub fn quote_purge_after(&self) -> Duration {
        Duration::from_secs(self.quote_purge_after_secs)
    }

    /// Window for suppressing identical opportunities.
    pub fn dedupe_window(&self) -> Duration {
        Duration::from_secs(self.dedupe_window_secs)
    }

    /// Per-plan submit timeout.
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    /// Parsed quiet hours, if configured.
    pub fn quiet_hours(&self) -> Result<Option<QuietHours>, String> {
        match self.quiet_hours.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => QuietHours::parse(raw).map(Some),
        }
    }

    /// Sport keys to poll.
    pub fn sport_list(&self) -> Vec<String> {
        split_list(&self.sports)
    }

    /// Market keys to request.
    pub fn market_type_list(&self) -> Vec<String> {
        split_list(&self.market_types)
    }

    /// Allowed bookmaker keys; empty means all.
    pub fn bookmaker_list(&self) -> Vec<String> {
        split_list(&self.bookmakers)
    }

    /// Every configured API key, single key first, without duplicates.
    pub fn api_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        let single = self.odds_api_key.iter().map(|k| k.trim().to_string());
        let many = self.odds_api_keys.iter().flat_map(|raw| split_list(raw));
        for key in single.chain(many) {
            if !key.is_empty() && !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    /// Look-ahead window for events, if limited.
    pub fn event_window(&self) -> Option<Duration> {
        (self.event_window_hours > 0).then(|| Duration::from_secs(self.event_window_hours * 3600))
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// UTC hour range during which the scheduler does not start cycles.
///
/// `start == end` is rejected; ranges with `start > end` wrap midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietHours {
    /// First quiet hour (inclusive).
    pub start: u8,
    /// First active hour again (exclusive end).
    pub end: u8,
}

impl QuietHours {
    /// Parse "H1-H2".
    pub fn parse(raw: &str) -> Result<Self, String> {
        let (start, end) = raw
            .split_once('-')
            .ok_or_else(|| format!("QUIET_HOURS must look like 1-7, got {raw:?}"))?;
        let start: u8 = start
            .trim()
            .parse()
            .map_err(|_| format!("invalid quiet hours start {start:?}"))?;
        let end: u8 = end
            .trim()
            .parse()
            .map_err(|_| format!("invalid quiet hours end {end:?}"))?;

        if start > 23 || end > 23 {
            return Err(format!("quiet hours out of range: {start}-{end}"));
        }
        if start == end {
            return Err("quiet hours start and end must differ".to_string());
        }

        Ok(Self { start, end })
    }

    /// Whether the given UTC hour is quiet.
    pub fn contains(&self, hour: u8) -> bool {
        if self.start < self.end {
            self.start <= hour && hour < self.end
        } else {
            hour >= self.start || hour < self.end
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn default_values_are_sensible() {
        let config = Config::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(15));
        assert_eq!(config.max_quote_age(), Duration::from_secs(30));
        assert_eq!(config.min_edge, dec!(0.002));
        assert_eq!(config.stake_rounding_increment, dec!(0.01));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_negative_min_edge() {
        let config = Config {
            min_edge: dec!(-0.01),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_outlay_bounds_inverted() {
        let config = Config {
            min_outlay: dec!(50),
            max_outlay: dec!(20),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_increment() {
        let config = Config {
            stake_rounding_increment: Decimal::ZERO,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_backoff_cap_below_base() {
        let config = Config {
            backoff_base_ms: 5_000,
            max_backoff_secs: 1,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_malformed_quiet_hours() {
        let config = Config {
            quiet_hours: Some("late".to_string()),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn quiet_hours_plain_range() {
        let quiet = QuietHours::parse("1-7").unwrap();
        assert!(!quiet.contains(0));
        assert!(quiet.contains(1));
        assert!(quiet.contains(6));
        assert!(!quiet.contains(7));
    }

    #[test]
    fn quiet_hours_wrap_midnight() {
        let quiet = QuietHours::parse("23-5").unwrap();
        assert!(quiet.contains(23));
        assert!(quiet.contains(0));
        assert!(quiet.contains(4));
        assert!(!quiet.contains(5));
        assert!(!quiet.contains(12));
    }

    #[test]
    fn validate_rejects_slippage_of_one() {
        let config = Config {
            slippage: Decimal::ONE,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn api_keys_merge_single_and_list() {
        let config = Config {
            odds_api_key: Some("k1".to_string()),
            odds_api_keys: Some("k2, k1 ,k3".to_string()),
            ..Config::default()
        };
        assert_eq!(config.api_keys(), vec!["k1", "k2", "k3"]);
        assert!(Config::default().api_keys().is_empty());
    }

    #[test]
    fn zero_event_window_means_unlimited() {
        assert_eq!(Config::default().event_window(), Some(Duration::from_secs(6 * 3600)));
        let config = Config {
            event_window_hours: 0,
            ..Config::default()
        };
        assert_eq!(config.event_window(), None);
    }

    #[test]
    fn lists_split_on_commas() {
        let config = Config {
            sports: "soccer_epl, basketball_nba,,".to_string(),
            ..Config::default()
        };
        assert_eq!(config.sport_list(), vec!["soccer_epl", "basketball_nba"]);
    }
}
