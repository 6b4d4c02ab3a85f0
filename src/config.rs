use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradingMode {
    Paper,
    Live,
}

impl FromStr for TradingMode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "paper" => Ok(TradingMode::Paper),
            "live" => Ok(TradingMode::Live),
            _ => anyhow::bail!("Invalid trading mode: '{}'. Must be 'paper' or 'live'", s),
        }
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Paper => write!(f, "paper"),
            TradingMode::Live => write!(f, "live"),
        }
    }
}

/// One trading window in ET hours. The low-temp window wraps midnight
/// (start 20, end 8 means 20:00 through 08:00).
#[derive(Debug, Clone, Copy)]
pub struct TradingWindow {
    pub start_hour_et: u32,
    pub end_hour_et: u32,
}

#[derive(Debug, Clone)]
pub struct TradingWindows {
    pub high_temp: TradingWindow,
    pub low_temp: TradingWindow,
}

#[derive(Debug, Clone)]
pub struct KalshiConfig {
    pub api_key_id: String,
    pub private_key_path: String,
    pub base_url: String,
    pub demo_url: String,
}

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub max_trades_per_day: u32,
    pub min_edge_pct: f64,
    pub min_entry_price: i64,
    pub max_position_pct: f64,
    pub max_contracts_per_trade: i64,
    pub max_contracts_per_ticker: i64,
    pub max_brackets_per_event: u32,
    pub take_profit_pct: f64,
    pub bonus_trades_after_wins: u32,
    pub bonus_trade_count: u32,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub trading_mode: TradingMode,
    pub db_path: String,
    pub log_dir: String,
    pub use_demo: bool,
    pub kill_switch: bool,
    pub collector_interval_min: u64,
    pub request_timeout_secs: u64,
    pub disabled_cities: Vec<String>,
    pub trading_windows: TradingWindows,
    pub kalshi: KalshiConfig,
    pub risk: RiskConfig,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env_or(key, default)
        .parse()
        .with_context(|| format!("Failed to parse {}", key))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Don't fail if .env missing

        let disabled_cities = env_or("DISABLED_CITIES", "")
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Config {
            trading_mode: env_or("TRADING_MODE", "paper")
                .parse()
                .context("Failed to parse TRADING_MODE")?,
            db_path: env_or("DATABASE_PATH", "data/weather-agent.db"),
            log_dir: env_or("LOG_DIR", "logs"),
            use_demo: env_parse("USE_DEMO", "false")?,
            kill_switch: env_parse("KILL_SWITCH", "false")?,
            collector_interval_min: env_parse("COLLECTOR_INTERVAL_MIN", "30")?,
            request_timeout_secs: env_parse("REQUEST_TIMEOUT_SECS", "15")?,
            disabled_cities,
            trading_windows: TradingWindows {
                high_temp: TradingWindow {
                    start_hour_et: env_parse("HIGH_WINDOW_START_ET", "8")?,
                    end_hour_et: env_parse("HIGH_WINDOW_END_ET", "18")?,
                },
                low_temp: TradingWindow {
                    start_hour_et: env_parse("LOW_WINDOW_START_ET", "20")?,
                    end_hour_et: env_parse("LOW_WINDOW_END_ET", "8")?,
                },
            },
            kalshi: KalshiConfig {
                api_key_id: env_or("KALSHI_API_KEY_ID", ""),
                private_key_path: env_or("KALSHI_PRIVATE_KEY_PATH", "kalshi_private_key.pem"),
                base_url: env_or("KALSHI_BASE_URL", "https://api.elections.kalshi.com"),
                demo_url: env_or("KALSHI_DEMO_URL", "https://demo-api.kalshi.co"),
            },
            risk: RiskConfig {
                max_trades_per_day: env_parse("MAX_TRADES_PER_DAY", "12")?,
                min_edge_pct: env_parse("MIN_EDGE_PCT", "15.0")?,
                min_entry_price: env_parse("MIN_ENTRY_PRICE", "2")?,
                max_position_pct: env_parse("MAX_POSITION_PCT", "20.0")?,
                max_contracts_per_trade: env_parse("MAX_CONTRACTS_PER_TRADE", "10")?,
                max_contracts_per_ticker: env_parse("MAX_CONTRACTS_PER_TICKER", "50")?,
                max_brackets_per_event: env_parse("MAX_BRACKETS_PER_EVENT", "2")?,
                take_profit_pct: env_parse("TAKE_PROFIT_PCT", "35.0")?,
                bonus_trades_after_wins: env_parse("BONUS_TRADES_AFTER_WINS", "18")?,
                bonus_trade_count: env_parse("BONUS_TRADE_COUNT", "2")?,
            },
        })
    }

    /// Exchange base URL, honoring demo mode.
    pub fn kalshi_base_url(&self) -> &str {
        if self.use_demo {
            &self.kalshi.demo_url
        } else {
            &self.kalshi.base_url
        }
    }

    pub fn city_enabled(&self, code: &str) -> bool {
        !self.disabled_cities.iter().any(|c| c == code)
    }
}
