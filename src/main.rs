//! Sportsbook arbitrage engine entry point.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sportsbook_arb::api::{create_router, AppState};
use sportsbook_arb::bankroll::{JsonFileStore, Ledger, LedgerPersistence, LedgerStore};
use sportsbook_arb::config::Config;
use sportsbook_arb::error::LedgerError;
use sportsbook_arb::feed::{ApiKeyPool, MockFeed, MockResponse, OddsApiFeed, OddsBatch, OddsFeed};
use sportsbook_arb::market::{Market, OddsQuote};
use sportsbook_arb::metrics;
use sportsbook_arb::odds::OddsStore;
use sportsbook_arb::scheduler::{Scheduler, SchedulerSettings, SchedulerStatus};
use sportsbook_arb::trading::{OpenBets, PaperExecutor, StakeSizer};
use sportsbook_arb::utils::shutdown_signal;

/// Sportsbook odds arbitrage scheduler.
#[derive(Parser, Debug)]
#[command(name = "sportsbook-arb")]
#[command(about = "Polls bookmaker odds, detects arbitrage and sizes stakes against a bankroll")]
#[command(version)]
struct Args {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,

    /// HTTP server port for health/metrics (overrides PORT).
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduling loop (default).
    Run {
        /// HTTP server port for health/metrics (overrides PORT).
        #[arg(short, long)]
        port: Option<u16>,

        /// Use a built-in mock feed instead of The Odds API.
        #[arg(long)]
        demo: bool,
    },

    /// Check configuration validity.
    CheckConfig,

    /// Print the persisted ledger.
    Ledger,

    /// Add capital to the persisted ledger.
    Deposit {
        /// Amount to add.
        #[arg(value_parser = positive_amount)]
        amount: Decimal,
    },

    /// Remove unreserved capital from the persisted ledger.
    Withdraw {
        /// Amount to remove.
        #[arg(value_parser = positive_amount)]
        amount: Decimal,
    },
}

/// Direction of a manual capital change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Adjustment {
    Deposit,
    Withdraw,
}

impl Adjustment {
    /// Apply to the ledger; returns the new total capital.
    fn apply(self, ledger: &Ledger, amount: Decimal) -> Result<Decimal, LedgerError> {
        match self {
            Adjustment::Deposit => ledger.deposit(amount),
            Adjustment::Withdraw => ledger.withdraw(amount),
        }
    }
}

fn positive_amount(raw: &str) -> Result<Decimal, String> {
    let amount: Decimal = raw.parse().map_err(|e| format!("invalid amount: {e}"))?;
    if amount <= Decimal::ZERO {
        return Err("amount must be greater than zero".to_string());
    }
    Ok(amount)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    let filter = if args.verbose {
        EnvFilter::new("sportsbook_arb=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(args.json_logs.then(|| fmt::layer().json()))
        .with((!args.json_logs).then(fmt::layer))
        .with(filter)
        .init();

    // Handle subcommands
    match args.command {
        Some(Command::CheckConfig) => cmd_check_config(),
        Some(Command::Ledger) => cmd_ledger().await,
        Some(Command::Deposit { amount }) => cmd_adjust(Adjustment::Deposit, amount).await,
        Some(Command::Withdraw { amount }) => cmd_adjust(Adjustment::Withdraw, amount).await,
        Some(Command::Run { port, demo }) => cmd_run(port.or(args.port), demo).await,
        None => cmd_run(args.port, false).await,
    }
}

fn load_config() -> anyhow::Result<Config> {
    let config = Config::load().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(anyhow::anyhow!("Configuration validation failed: {}", e));
    }
    Ok(config)
}

/// Check configuration validity.
fn cmd_check_config() -> anyhow::Result<()> {
    println!("======================================================================");
    println!("SPORTSBOOK ARB - CONFIGURATION CHECK");
    println!("======================================================================");

    print!("Loading configuration... ");
    let config = match Config::load() {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAILED");
            println!("  Error: {}", e);
            return Err(anyhow::anyhow!("Configuration load failed"));
        }
    };

    print!("Validating configuration... ");
    match config.validate() {
        Ok(()) => println!("OK"),
        Err(e) => {
            println!("FAILED");
            println!("  Error: {}", e);
            return Err(anyhow::anyhow!("Configuration validation failed"));
        }
    }

    print!("Checking Odds API keys... ");
    let keys = config.api_keys();
    if !keys.is_empty() {
        println!("OK ({})", keys.len());
    } else {
        println!("MISSING (only `run --demo` will work)");
    }

    println!("----------------------------------------------------------------------");
    println!("Configuration Summary:");
    println!("  Poll Interval: {}s", config.poll_interval_secs);
    println!("  Feed Timeout: {}ms", config.feed_timeout_ms);
    println!("  Min Edge: {}", config.min_edge);
    println!("  Max Quote Age: {}s", config.max_quote_age_secs);
    println!("  Outlay: {} - {}", config.min_outlay, config.max_outlay);
    println!("  Stake Increment: {}", config.stake_rounding_increment);
    println!("  Sports: {}", config.sport_list().join(", "));
    println!("  Markets: {}", config.market_type_list().join(", "));
    match config.max_api_calls {
        0 => println!("  API Calls Per Key: unlimited"),
        n => println!("  API Calls Per Key: {}/day", n),
    }
    match config.bookmaker_list() {
        books if books.is_empty() => println!("  Bookmakers: all"),
        books => println!("  Bookmakers: {}", books.join(", ")),
    }
    match config.event_window() {
        Some(window) => println!("  Event Window: {}h", window.as_secs() / 3600),
        None => println!("  Event Window: unlimited"),
    }
    println!("  Paper Slippage: {}", config.slippage);
    println!("  Ledger: {}", config.ledger_path.display());
    match config.quiet_hours.as_deref() {
        Some(hours) if !hours.trim().is_empty() => println!("  Quiet Hours (UTC): {}", hours),
        _ => println!("  Quiet Hours: none"),
    }
    println!("======================================================================");
    println!("CONFIGURATION CHECK PASSED");
    println!("======================================================================");

    Ok(())
}

async fn open_ledger(config: &Config) -> anyhow::Result<LedgerPersistence> {
    let store: Arc<dyn LedgerStore> = Arc::new(JsonFileStore::new(config.ledger_path.clone()));
    Ok(LedgerPersistence::open(store, config.start_bankroll).await?)
}

/// Print the persisted ledger.
async fn cmd_ledger() -> anyhow::Result<()> {
    let config = load_config()?;
    let persistence = open_ledger(&config).await?;
    let snapshot = persistence.ledger().snapshot();

    println!("======================================================================");
    println!("SPORTSBOOK ARB - LEDGER ({})", config.ledger_path.display());
    println!("======================================================================");
    println!("  Total Capital: {}", snapshot.total_capital);
    println!("  Reserved:      {}", snapshot.reserved);
    println!("  Available:     {}", snapshot.available());
    println!("  Realized P&L:  {}", snapshot.realized_pnl);
    println!("----------------------------------------------------------------------");
    println!("Open reservations: {}", snapshot.reservations.len());
    for r in &snapshot.reservations {
        println!("  {} {:>10}  {}", r.id, r.amount, r.label);
    }
    println!("======================================================================");
    Ok(())
}

/// Deposit or withdraw against the persisted ledger.
async fn cmd_adjust(adjustment: Adjustment, amount: Decimal) -> anyhow::Result<()> {
    let config = load_config()?;
    let persistence = open_ledger(&config).await?;
    let ledger = persistence.ledger();

    let total = adjustment.apply(ledger, amount)?;
    persistence.persist().await?;

    println!("Total capital: {}", total);
    println!("Available:     {}", ledger.available());
    Ok(())
}

/// Run the scheduling loop with the HTTP API.
async fn cmd_run(port_override: Option<u16>, demo: bool) -> anyhow::Result<()> {
    info!("Loading configuration...");
    let config = load_config()?;
    let settings = SchedulerSettings::from_config(&config)?;
    let port = port_override.unwrap_or(config.port);

    // Metrics
    let prometheus = PrometheusBuilder::new().install_recorder()?;
    metrics::init_metrics();

    // Ledger
    let persistence = open_ledger(&config).await?;
    info!(
        total_capital = %persistence.ledger().total_capital(),
        available = %persistence.ledger().available(),
        "Ledger ready"
    );

    // Feeds
    let api_keys = Arc::new(ApiKeyPool::from_config(&config));
    let feeds: Vec<Arc<dyn OddsFeed>> = if demo {
        info!("Demo mode: using mock feed");
        vec![Arc::new(demo_feed())]
    } else {
        if api_keys.is_empty() {
            return Err(anyhow::anyhow!(
                "ODDS_API_KEY or ODDS_API_KEYS must be set (or use `run --demo`)"
            ));
        }
        config
            .sport_list()
            .iter()
            .map(|sport| {
                OddsApiFeed::new(&config, sport, api_keys.clone()).map(|f| Arc::new(f) as Arc<dyn OddsFeed>)
            })
            .collect::<Result<_, _>>()?
    };

    let status = SchedulerStatus::new();
    let open_bets = OpenBets::new();
    let mut scheduler = Scheduler::new(
        settings,
        Arc::new(OddsStore::new(config.max_quote_age())),
        persistence.clone(),
        StakeSizer::from_config(&config),
        Arc::new(PaperExecutor::new().with_slippage(config.slippage)),
    )
    .with_status(status.clone())
    .with_open_bets(open_bets.clone());
    for feed in feeds {
        info!(feed = %feed.name(), "Feed registered");
        scheduler = scheduler.with_feed(feed);
    }

    // Shutdown wiring
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    // Start HTTP server
    let mut app_state = AppState::new(status, persistence.clone(), open_bets.clone()).with_metrics(prometheus);
    if !demo {
        app_state = app_state.with_api_keys(api_keys);
    }
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    let router = create_router(app_state).layer(TraceLayer::new_for_http());
    let server_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        }
    });

    info!("========================================");
    info!("SPORTSBOOK ARBITRAGE SCHEDULER STARTED");
    info!("========================================");

    let result = scheduler.run(shutdown.clone()).await;
    shutdown.cancel();

    match tokio::time::timeout(Duration::from_secs(5), server_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!(error = %e, "HTTP server error"),
        Ok(Err(e)) => warn!(error = %e, "HTTP server task failed"),
        Err(_) => warn!("HTTP server did not stop in time"),
    }

    let ledger = persistence.ledger();
    info!("========================================");
    info!("SCHEDULER STOPPED - FINAL SUMMARY");
    info!("========================================");
    info!("Total capital: {}", ledger.total_capital());
    info!("Reserved: {}", ledger.reserved());
    info!("Realized P&L: {}", ledger.realized_pnl());
    let performance = open_bets.history().stats().overall;
    info!(
        "Settled bets: {} (W {} / L {} / P {}), ROI {}%",
        performance.bets, performance.wins, performance.losses, performance.pushes, performance.roi_pct
    );
    info!("========================================");

    if let Err(e) = &result {
        error!(error = %e, "Scheduler halted");
    }
    Ok(result?)
}

/// Mock feed quoting one arbitrage and one fair market on every fetch.
fn demo_feed() -> MockFeed {
    let now = OffsetDateTime::now_utc();
    let arb = Market::new("demo-1", "h2h", ["Home", "Away"]).with_label("Demo FC vs Sample United");
    let fair = Market::new("demo-2", "h2h", ["Home", "Draw", "Away"]).with_label("Mock City vs Test Rovers");

    let quotes = vec![
        OddsQuote::new(&arb.id, "Home", "book_a", dec!(2.10), now).with_liquidity_cap(dec!(250)),
        OddsQuote::new(&arb.id, "Away", "book_a", dec!(1.80), now),
        OddsQuote::new(&arb.id, "Home", "book_b", dec!(1.90), now),
        OddsQuote::new(&arb.id, "Away", "book_b", dec!(2.05), now).with_liquidity_cap(dec!(150)),
        OddsQuote::new(&fair.id, "Home", "book_a", dec!(2.40), now),
        OddsQuote::new(&fair.id, "Draw", "book_a", dec!(3.30), now),
        OddsQuote::new(&fair.id, "Away", "book_a", dec!(3.00), now),
        OddsQuote::new(&fair.id, "Home", "book_b", dec!(2.45), now),
        OddsQuote::new(&fair.id, "Draw", "book_b", dec!(3.20), now),
        OddsQuote::new(&fair.id, "Away", "book_b", dec!(2.90), now),
    ];

    let feed = MockFeed::new("demo");
    feed.set_fallback(MockResponse::Batch(OddsBatch::new(
        vec![arb, fair],
        quotes,
    )));
    feed
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn non_positive_amounts_are_rejected_by_the_cli() {
        assert!(Args::try_parse_from(["sportsbook-arb", "withdraw", "--", "-50"]).is_err());
        assert!(Args::try_parse_from(["sportsbook-arb", "deposit", "0"]).is_err());
        assert!(Args::try_parse_from(["sportsbook-arb", "withdraw", "abc"]).is_err());

        let args = Args::try_parse_from(["sportsbook-arb", "withdraw", "12.5"]).unwrap();
        assert!(matches!(args.command, Some(Command::Withdraw { amount }) if amount == dec!(12.5)));
    }

    #[test]
    fn withdraw_never_adds_capital() {
        let ledger = Ledger::new(dec!(100));

        assert!(Adjustment::Withdraw.apply(&ledger, dec!(-50)).is_err());
        assert_eq!(ledger.total_capital(), dec!(100));

        assert_eq!(Adjustment::Withdraw.apply(&ledger, dec!(30)).unwrap(), dec!(70));
        assert_eq!(Adjustment::Deposit.apply(&ledger, dec!(5)).unwrap(), dec!(75));
    }
}
