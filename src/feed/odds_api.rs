//! The Odds API v4 client.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::Deserialize;
use time::OffsetDateTime;
use tracing::{debug, instrument, warn};

use super::quota::ApiKeyPool;
use super::{OddsBatch, OddsFeed};
use crate::config::Config;
use crate::error::FeedError;
use crate::market::{Market, OddsQuote};
use crate::metrics;

/// Event returned by `/v4/sports/{sport}/odds`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEvent {
    /// Event id.
    pub id: String,
    /// Sport key.
    #[serde(default)]
    pub sport_key: String,
    /// Kick-off time.
    #[serde(with = "time::serde::rfc3339")]
    pub commence_time: OffsetDateTime,
    /// Home team.
    #[serde(default)]
    pub home_team: Option<String>,
    /// Away team.
    #[serde(default)]
    pub away_team: Option<String>,
    /// Bookmakers quoting this event.
    #[serde(default)]
    pub bookmakers: Vec<ApiBookmaker>,
}

/// One bookmaker's markets for an event.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiBookmaker {
    /// Bookmaker key.
    pub key: String,
    /// Time of the bookmaker's last price update.
    #[serde(with = "time::serde::rfc3339")]
    pub last_update: OffsetDateTime,
    /// Markets offered.
    #[serde(default)]
    pub markets: Vec<ApiMarket>,
}

/// One market at one bookmaker.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiMarket {
    /// Market key (`h2h`, `spreads`, `totals`).
    pub key: String,
    /// Outcome prices.
    #[serde(default)]
    pub outcomes: Vec<ApiOutcome>,
}

/// One priced outcome.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiOutcome {
    /// Outcome name (team, `Draw`, `Over`, `Under`).
    pub name: String,
    /// Decimal odds.
    pub price: Decimal,
    /// Handicap or total line.
    #[serde(default)]
    pub point: Option<Decimal>,
}

/// Which events and bookmakers a feed keeps.
///
/// Bookmaker keys are compared case-insensitively, ignoring underscores and
/// spaces. An empty allowlist keeps every bookmaker.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    bookmakers: Vec<String>,
    event_window: Option<Duration>,
}

impl EventFilter {
    /// Filter from the configured allowlist and event window.
    pub fn from_config(config: &Config) -> Self {
        let filter = Self::default().with_bookmakers(config.bookmaker_list());
        match config.event_window() {
            Some(window) => filter.with_event_window(window),
            None => filter,
        }
    }

    /// Keep only these bookmakers.
    pub fn with_bookmakers<I, S>(mut self, bookmakers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.bookmakers = bookmakers.into_iter().map(|b| normalize_book(b.as_ref())).collect();
        self
    }

    /// Drop events starting later than `window` from now.
    pub fn with_event_window(mut self, window: Duration) -> Self {
        self.event_window = Some(window);
        self
    }

    /// Whether quotes from `bookmaker` are kept.
    pub fn allows_bookmaker(&self, bookmaker: &str) -> bool {
        self.bookmakers.is_empty() || self.bookmakers.contains(&normalize_book(bookmaker))
    }

    /// Whether an event starting at `commence_time` is kept.
    pub fn allows_event(&self, commence_time: OffsetDateTime, now: OffsetDateTime) -> bool {
        self.event_window
            .map_or(true, |window| commence_time <= now + window)
    }
}

fn normalize_book(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_' && !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Feed for a single sport on The Odds API.
#[derive(Debug, Clone)]
pub struct OddsApiFeed {
    http: reqwest::Client,
    name: String,
    base_url: String,
    keys: Arc<ApiKeyPool>,
    sport: String,
    regions: String,
    markets: String,
    filter: EventFilter,
}

impl OddsApiFeed {
    /// Feed for `sport` drawing keys from the shared `keys` pool.
    pub fn new(config: &Config, sport: &str, keys: Arc<ApiKeyPool>) -> Result<Self, FeedError> {
        if keys.is_empty() {
            return Err(FeedError::Failed {
                feed: sport.to_string(),
                reason: "ODDS_API_KEY not set".into(),
            });
        }

        let http = reqwest::Client::builder()
            .timeout(config.feed_timeout())
            .connect_timeout(Duration::from_millis(config.feed_timeout_ms.min(2_000)))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            http,
            name: format!("odds-api:{sport}"),
            base_url: config.odds_api_url.trim_end_matches('/').to_string(),
            keys,
            sport: sport.to_string(),
            regions: config.regions.clone(),
            markets: config.market_type_list().join(","),
            filter: EventFilter::from_config(config),
        })
    }
}

#[async_trait]
impl OddsFeed for OddsApiFeed {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(sport = %self.sport))]
    async fn fetch_odds(&self) -> Result<OddsBatch, FeedError> {
        let Some(api_key) = self.keys.acquire() else {
            warn!(feed = %self.name, "API call budget exhausted, skipping feed");
            return Err(FeedError::QuotaExhausted {
                feed: self.name.clone(),
            });
        };

        let url = format!("{}/v4/sports/{}/odds", self.base_url, self.sport);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("apiKey", api_key.as_str()),
                ("regions", self.regions.as_str()),
                ("markets", self.markets.as_str()),
                ("oddsFormat", "decimal"),
                ("dateFormat", "iso"),
            ])
            .send()
            .await?;

        let remaining = response
            .headers()
            .get("x-requests-remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .map(|v| v.max(0.0) as u64);
        metrics::record_api_call(remaining);
        if let Some(remaining) = remaining {
            debug!(remaining, "Odds API quota");
            self.keys.report_remaining(&api_key, remaining);
        }

        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::TOO_MANY_REQUESTS) {
            self.keys.mark_exhausted(&api_key);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Odds API request failed");
            return Err(FeedError::Failed {
                feed: self.name.clone(),
                reason: format!("HTTP {status}"),
            });
        }

        let events: Vec<ApiEvent> = response.json().await?;
        let batch = parse_events(events, &self.filter, OffsetDateTime::now_utc());
        debug!(markets = batch.markets.len(), quotes = batch.quotes.len(), "Odds fetched");
        Ok(batch)
    }
}

/// Normalize API events into markets and quotes.
///
/// Totals get one market per line. Spreads get one market per home handicap
/// (`spreads@-1.5` holds "Home -1.5" and "Away 1.5"), so each market has two
/// complementary outcomes. Outcomes keep the order in which bookmakers list
/// them; prices of 1.0 or below are dropped, and so is every quote of a market
/// that ends up with fewer than two outcomes.
pub fn parse_events(events: Vec<ApiEvent>, filter: &EventFilter, now: OffsetDateTime) -> OddsBatch {
    let mut batch = OddsBatch::default();
    let mut skipped_events = 0usize;

    for event in events {
        if !filter.allows_event(event.commence_time, now) {
            skipped_events += 1;
            continue;
        }
        let label = match (&event.home_team, &event.away_team) {
            (Some(home), Some(away)) => Some(format!("{home} vs {away}")),
            _ => None,
        };
        // market type -> outcome names in first-seen order
        let mut outcome_sets: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut quotes: Vec<(String, OddsQuote)> = Vec::new();

        for bookmaker in event.bookmakers.iter().filter(|b| filter.allows_bookmaker(&b.key)) {
            for market in &bookmaker.markets {
                let home = event
                    .home_team
                    .as_deref()
                    .or_else(|| market.outcomes.first().map(|o| o.name.as_str()))
                    .unwrap_or_default();
                for outcome in &market.outcomes {
                    if outcome.price <= Decimal::ONE {
                        continue;
                    }
                    let market_type = market_type(&market.key, outcome, home);
                    let name = outcome_name(outcome);
                    let outcomes = outcome_sets.entry(market_type.clone()).or_default();
                    if !outcomes.contains(&name) {
                        outcomes.push(name.clone());
                    }
                    let quote = OddsQuote::new(
                        Market::market_id(&event.id, &market_type),
                        name,
                        bookmaker.key.clone(),
                        outcome.price,
                        bookmaker.last_update,
                    );
                    quotes.push((market_type, quote));
                }
            }
        }

        outcome_sets.retain(|_, outcomes| outcomes.len() >= 2);
        batch.quotes.extend(
            quotes
                .into_iter()
                .filter(|(market_type, _)| outcome_sets.contains_key(market_type))
                .map(|(_, quote)| quote),
        );
        for (market_type, outcomes) in outcome_sets {
            let mut market = Market::new(event.id.clone(), market_type, outcomes)
                .with_commence_time(event.commence_time);
            if let Some(label) = &label {
                market = market.with_label(label.clone());
            }
            batch.markets.push(market);
        }
    }

    if skipped_events > 0 {
        debug!(skipped_events, "Events outside the event window");
    }
    batch
}

fn market_type(key: &str, outcome: &ApiOutcome, home: &str) -> String {
    match outcome.point {
        None => key.to_string(),
        Some(point) if key.contains("spreads") => {
            let home_line = if outcome.name == home { point } else { -point };
            format!("{key}@{}", signed(home_line))
        }
        Some(point) => format!("{key}@{}", point.abs().normalize()),
    }
}

fn signed(value: Decimal) -> String {
    let value = value.normalize();
    if value.is_zero() {
        "0".to_string()
    } else if value.is_sign_positive() {
        format!("+{value}")
    } else {
        value.to_string()
    }
}

fn outcome_name(outcome: &ApiOutcome) -> String {
    match outcome.point {
        Some(point) => format!("{} {}", outcome.name, point.normalize()),
        None => outcome.name.clone(),
    }
}
