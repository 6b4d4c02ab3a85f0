use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use weather_agent::backtest;
use weather_agent::config::{Config, TradingMode};
use weather_agent::db::Database;
use weather_agent::kalshi::{KalshiAuth, KalshiClient};
use weather_agent::orchestrator::TradingBot;
use weather_agent::paper;
use weather_agent::supervisor::PositionSupervisor;
use weather_agent::weather::WeatherClient;

#[derive(Parser, Debug)]
#[command(name = "weather-agent", about = "Kalshi temperature-market trading agent")]
struct Cli {
    /// Enable live trading (default: paper)
    #[arg(long)]
    live: bool,

    /// Skip the live-trading confirmation prompt
    #[arg(long)]
    yes: bool,

    /// Run continuously instead of a single cycle
    #[arg(long)]
    continuous: bool,

    /// Inter-cycle interval in minutes (default: from config)
    #[arg(long)]
    interval: Option<u64>,

    /// Show the paper trading summary and exit
    #[arg(long)]
    status: bool,

    /// Show open paper positions priced against live quotes and exit
    #[arg(long)]
    paper_portfolio: bool,

    /// Skip the anti-front-running delay
    #[arg(long)]
    no_jitter: bool,

    /// Run the position supervisor instead of the trading loop
    #[arg(long)]
    supervisor: bool,

    /// Print the calibration / backtest report and exit
    #[arg(long)]
    backtest: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if cli.live {
        config.trading_mode = TradingMode::Live;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("weather_agent=info")),
        )
        .init();

    if cli.status {
        let db = Database::open(&config.db_path)?;
        let s = paper::summary(&db)?;
        println!("\n=== Paper Trading Summary ===");
        println!("  balance: ${:.2}", s.balance_cents as f64 / 100.0);
        println!(
            "  starting balance: ${:.2}",
            paper::PAPER_BANKROLL_START_CENTS as f64 / 100.0
        );
        println!("  total trades: {}", s.total_trades);
        println!("  wins: {} / losses: {}", s.wins, s.losses);
        if s.wins + s.losses > 0 {
            println!(
                "  win rate: {:.1}%",
                s.wins as f64 / (s.wins + s.losses) as f64 * 100.0
            );
        }
        println!("  total P&L: ${:.2}", s.total_pnl_cents as f64 / 100.0);
        println!("  open trades: {}", s.open_trades);
        println!("  ROI: {:.1}%", s.roi_pct);
        return Ok(());
    }

    if cli.backtest {
        let db = Database::open(&config.db_path)?;
        backtest::report(&db)?;
        return Ok(());
    }

    if cli.paper_portfolio {
        let db = Database::open(&config.db_path)?;
        paper::ensure_seeded(&db)?;
        let client =
            KalshiClient::new(config.kalshi_base_url(), None, config.request_timeout_secs)?;
        let (cash, _, priced) = paper::portfolio_value(&db, &client).await?;
        if priced.is_empty() {
            println!("\nNo open paper positions.");
            return Ok(());
        }
        println!("\n=== Paper Portfolio (Cash: ${:.2}) ===", cash as f64 / 100.0);
        let mut total_cost = 0i64;
        let mut total_value = 0i64;
        for p in &priced {
            let side = if p.position < 0 { "NO" } else { "YES" };
            let pnl = p.current_value - p.market_exposure;
            total_cost += p.market_exposure;
            total_value += p.current_value;
            println!(
                "  {} {} x{} | cost={}¢ val={}¢ pnl={:+}¢ (YES@{}¢)",
                p.ticker,
                side,
                p.position.abs(),
                p.market_exposure,
                p.current_value,
                pnl,
                p.yes_bid,
            );
        }
        println!(
            "\n  Total: cost=${:.2} val=${:.2} unrealized={:+}¢",
            total_cost as f64 / 100.0,
            total_value as f64 / 100.0,
            total_value - total_cost,
        );
        println!("  Account value: ${:.2}", (cash + total_value) as f64 / 100.0);
        return Ok(());
    }

    if config.trading_mode == TradingMode::Live {
        warn!("LIVE TRADING MODE — real money at risk");
        if !cli.yes {
            println!("Type 'YES' to confirm live trading:");
            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
            if line.trim() != "YES" {
                println!("Aborted.");
                return Ok(());
            }
        }
    }

    if cli.supervisor {
        let auth = if config.kalshi.api_key_id.is_empty() {
            None
        } else {
            Some(KalshiAuth::from_key_file(
                &config.kalshi.api_key_id,
                &config.kalshi.private_key_path,
            )?)
        };
        let client =
            KalshiClient::new(config.kalshi_base_url(), auth, config.request_timeout_secs)?;
        let weather = WeatherClient::new()?;
        let mut supervisor = PositionSupervisor::new(client, weather, config);
        return supervisor.run().await;
    }

    let mut bot = TradingBot::new(config)?;
    bot.no_jitter = cli.no_jitter;

    info!("Weather agent starting in {} mode", bot.config.trading_mode);

    if cli.continuous {
        bot.run_continuous(cli.interval).await;
    } else {
        bot.run_cycle().await;
    }

    Ok(())
}
