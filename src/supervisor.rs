//! Position supervisor: a long-running process independent of the trading
//! cycle. Polls open positions, takes profits, exits mathematically dead
//! positions, and enforces the account-level profit rule.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::cities;
use crate::clock;
use crate::config::Config;
use crate::kalshi::{Action, KalshiClient, Market, OrderIntent, Position, Side};
use crate::weather::WeatherClient;

const POLL_INTERVAL_SECS: u64 = 30;
const IDLE_INTERVAL_SECS: u64 = 300;
const RATE_LIMIT_DELAY_MS: u64 = 200;
const PROFIT_TRIGGER_PCT: i64 = 10;

/// Strike shape parsed from a position's ticker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BracketKind {
    Bracket { low: f64, high: f64 },
    Threshold { value: f64 },
}

/// A weather position decoded from its ticker.
#[derive(Debug, Clone)]
pub struct PositionBracket {
    pub city: &'static str,
    pub station: &'static str,
    pub market_type: crate::signals::MarketType,
    pub kind: BracketKind,
}

/// Decode `(city, type, bracket)` from a ticker like
/// `KXHIGHNY-26FEB18-B36.5` or `KXLOWTPHIL-26FEB16-T29`.
pub fn parse_position_bracket(ticker: &str) -> Option<PositionBracket> {
    let segments: Vec<&str> = ticker.split('-').collect();
    if segments.len() < 3 {
        return None;
    }
    let prefix = segments[0];
    let bracket_part = segments[segments.len() - 1];

    let (city, is_high) = cities::by_series(prefix)?;
    let market_type = if is_high {
        crate::signals::MarketType::High
    } else {
        crate::signals::MarketType::Low
    };

    let kind = if let Some(num) = bracket_part.strip_prefix('B') {
        let mid: f64 = num.parse().ok()?;
        BracketKind::Bracket {
            low: (mid - 0.5).floor(),
            high: (mid + 0.5).floor(),
        }
    } else if let Some(num) = bracket_part.strip_prefix('T') {
        BracketKind::Threshold {
            value: num.parse().ok()?,
        }
    } else {
        return None;
    };

    Some(PositionBracket {
        city: city.code,
        station: city.primary,
        market_type,
        kind,
    })
}

/// The dead-position decision table, indexed by (market type, bracket kind,
/// held side, current temp vs strike, ET hour).
pub fn is_position_dead(
    bracket: &PositionBracket,
    current_temp: f64,
    side: Side,
    hour_et: u32,
) -> Option<String> {
    use crate::signals::MarketType;

    match bracket.kind {
        BracketKind::Bracket { low, high } => match (bracket.market_type, side) {
            (MarketType::High, Side::Yes) => {
                // High already ran past the cap
                if current_temp > high + 2.0 && hour_et >= 12 {
                    return Some(format!(
                        "Current {:.0}°F already above bracket [{:.0}-{:.0}]°F — high is past this range",
                        current_temp, low, high,
                    ));
                }
                // Late in the day and nowhere near the floor
                if current_temp < low - 5.0 && hour_et >= 15 {
                    return Some(format!(
                        "Current {:.0}°F, {:.0}°F below bracket [{:.0}-{:.0}]°F at {}:00 ET — can't reach",
                        current_temp,
                        low - current_temp,
                        low,
                        high,
                        hour_et,
                    ));
                }
            }
            (MarketType::High, Side::No) => {
                if low <= current_temp && current_temp <= high && (13..=16).contains(&hour_et) {
                    return Some(format!(
                        "Current {:.0}°F is IN bracket [{:.0}-{:.0}]°F during peak — high likely lands here",
                        current_temp, low, high,
                    ));
                }
            }
            (MarketType::Low, Side::Yes) => {
                if current_temp < low - 3.0 && hour_et >= 4 {
                    return Some(format!(
                        "Current {:.0}°F already below bracket [{:.0}-{:.0}]°F — low already passed",
                        current_temp, low, high,
                    ));
                }
                if current_temp > high + 4.0 && hour_et >= 2 {
                    return Some(format!(
                        "Current {:.0}°F, {:.0}°F above bracket [{:.0}-{:.0}]°F at {}:00 ET — won't cool enough",
                        current_temp,
                        current_temp - high,
                        low,
                        high,
                        hour_et,
                    ));
                }
            }
            (MarketType::Low, Side::No) => {
                if low <= current_temp && current_temp <= high && (4..=7).contains(&hour_et) {
                    return Some(format!(
                        "Current {:.0}°F is IN bracket [{:.0}-{:.0}]°F during coldest hours",
                        current_temp, low, high,
                    ));
                }
                if low <= current_temp && current_temp <= high && hour_et >= 2 {
                    return Some(format!(
                        "Current {:.0}°F is IN bracket [{:.0}-{:.0}]°F overnight — likely settling here",
                        current_temp, low, high,
                    ));
                }
            }
        },
        BracketKind::Threshold { value } => match (bracket.market_type, side) {
            (crate::signals::MarketType::High, Side::Yes) => {
                if current_temp < value - 5.0 && hour_et >= 15 {
                    return Some(format!(
                        "Current {:.0}°F, never reaching {:.0}°F threshold at {}:00 ET",
                        current_temp, value, hour_et,
                    ));
                }
            }
            (crate::signals::MarketType::Low, Side::Yes) => {
                if current_temp < value - 1.0 && hour_et >= 3 {
                    return Some(format!(
                        "Current {:.0}°F already below {:.0}°F threshold — low already breached",
                        current_temp, value,
                    ));
                }
            }
            (crate::signals::MarketType::Low, Side::No) => {
                if current_temp > value + 3.0 && (5..=8).contains(&hour_et) {
                    return Some(format!(
                        "Current {:.0}°F still {:.0}°F above {:.0}°F threshold at {}:00 ET — low won't reach it",
                        current_temp,
                        current_temp - value,
                        value,
                        hour_et,
                    ));
                }
                if current_temp > value && current_temp < value + 10.0 && (4..=7).contains(&hour_et)
                {
                    return Some(format!(
                        "Current {:.0}°F in threshold range (>{:.0}°F) during coldest hours",
                        current_temp, value,
                    ));
                }
            }
            (crate::signals::MarketType::High, Side::No) => {
                if current_temp > value + 2.0 && hour_et >= 12 {
                    return Some(format!(
                        "Current {:.0}°F already exceeded {:.0}°F threshold",
                        current_temp, value,
                    ));
                }
            }
        },
    }
    None
}

#[derive(Debug, Default, Serialize)]
pub struct SupervisorStats {
    pub checks: u64,
    pub take_profits_triggered: u64,
    pub dead_exits_triggered: u64,
    pub profit_rule_triggered: u64,
    pub errors: u64,
    pub positions_tracked: usize,
}

pub struct PositionSupervisor {
    client: KalshiClient,
    weather: WeatherClient,
    config: Config,
    profit_rule_fired: bool,
    pub stats: SupervisorStats,
    pid_file: PathBuf,
}

impl PositionSupervisor {
    pub fn new(client: KalshiClient, weather: WeatherClient, config: Config) -> Self {
        let pid_file = PathBuf::from(&config.log_dir).join("supervisor.pid");
        PositionSupervisor {
            client,
            weather,
            config,
            profit_rule_fired: false,
            stats: SupervisorStats::default(),
            pid_file,
        }
    }

    fn write_pid(&self) {
        if let Some(parent) = self.pid_file.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&self.pid_file, std::process::id().to_string()) {
            warn!("Failed to write PID file: {}", e);
        } else {
            info!("PID file written: {}", self.pid_file.display());
        }
    }

    fn remove_pid(&self) {
        let _ = std::fs::remove_file(&self.pid_file);
    }

    async fn open_positions(&mut self) -> Vec<Position> {
        match self.client.get_positions().await {
            Ok(positions) => positions
                .into_iter()
                .filter(|p| p.position != 0)
                .collect(),
            Err(e) => {
                error!("Failed to fetch positions: {}", e);
                self.stats.errors += 1;
                Vec::new()
            }
        }
    }

    fn held_side(position: &Position) -> Side {
        if position.position < 0 {
            Side::No
        } else {
            Side::Yes
        }
    }

    fn position_value(position: &Position, market: &Market) -> i64 {
        let yes_bid = market.yes_bid.max(0);
        if position.position < 0 {
            position.position.abs() * (100 - yes_bid)
        } else {
            position.position * yes_bid
        }
    }

    async fn sell_position(&mut self, position: &Position, price_cents: i64) -> bool {
        let side = Self::held_side(position);
        let intent = OrderIntent {
            ticker: position.ticker.clone(),
            action: Action::Sell,
            side,
            count: position.position.abs(),
            price_cents,
        };
        match self.client.create_order(&intent).await {
            Ok(order) => {
                info!(
                    "Exit order placed: {} sell {} x{} @ {}¢ (status {})",
                    position.ticker, side, intent.count, price_cents, order.status,
                );
                true
            }
            Err(e) => {
                error!("Exit order failed for {}: {}", position.ticker, e);
                self.stats.errors += 1;
                false
            }
        }
    }

    /// Take-profit: gain from cost basis at the prevailing bid.
    async fn check_take_profit(&mut self, position: &Position, market: &Market) -> bool {
        if market.status != "active" || position.market_exposure <= 0 {
            return false;
        }

        let current_value = Self::position_value(position, market);
        let cost = position.market_exposure;
        let gain_pct = (current_value - cost) as f64 / cost as f64 * 100.0;

        let sell_price = if position.position < 0 {
            market.no_bid.max(0)
        } else {
            market.yes_bid.max(0)
        };
        if sell_price <= 0 {
            return false;
        }

        if gain_pct >= self.config.risk.take_profit_pct {
            info!(
                "TAKE PROFIT TRIGGERED: {} | {}¢ → {}¢ | +{:.0}%",
                position.ticker, cost, current_value, gain_pct,
            );
            self.stats.take_profits_triggered += 1;
            return self.sell_position(position, sell_price).await;
        }
        false
    }

    /// Dead-position check against the current station temperature.
    async fn check_dead_position(&mut self, position: &Position, market: &Market) -> bool {
        let bracket = match parse_position_bracket(&position.ticker) {
            Some(b) => b,
            None => return false,
        };

        let current_temp = match self.weather.latest_station_temp(bracket.station).await {
            Some(t) => t,
            None => return false,
        };

        let side = Self::held_side(position);
        let reason = match is_position_dead(&bracket, current_temp, side, clock::et_hour()) {
            Some(r) => r,
            None => return false,
        };

        if market.status != "active" {
            return false;
        }

        warn!(
            "DEAD POSITION: {} | {} | Current: {:.0}°F",
            position.ticker, reason, current_temp,
        );
        self.stats.dead_exits_triggered += 1;

        let sell_price = if side == Side::No {
            let no_bid = market.no_bid.max(0);
            if no_bid > 0 {
                no_bid
            } else {
                (100 - market.yes_ask.max(0)).max(0)
            }
        } else {
            market.yes_bid.max(0)
        };
        if sell_price <= 0 {
            warn!("No bid available for dead position {}", position.ticker);
            return false;
        }

        self.sell_position(position, sell_price).await
    }

    /// Account-level rule: unrealized profit ≥ 10% of total account value
    /// liquidates every winning position. Fires once per session.
    async fn check_profit_rule(&mut self, positions: &[Position]) -> bool {
        if self.profit_rule_fired {
            return false;
        }

        let cash = match self.client.get_balance().await {
            Ok(c) => c,
            Err(e) => {
                error!("Profit rule: failed to get balance: {}", e);
                return false;
            }
        };

        let mut total_cost = 0i64;
        let mut position_value = 0i64;
        let mut priced: Vec<(&Position, Market)> = Vec::new();
        for pos in positions {
            tokio::time::sleep(Duration::from_millis(RATE_LIMIT_DELAY_MS)).await;
            match self.client.get_market(&pos.ticker).await {
                Ok(market) => {
                    position_value += Self::position_value(pos, &market);
                    total_cost += pos.market_exposure;
                    priced.push((pos, market));
                }
                Err(_) => {
                    // Unpriceable: assume cost
                    position_value += pos.market_exposure;
                    total_cost += pos.market_exposure;
                }
            }
        }

        let total_value = cash + position_value;
        let unrealized_pnl = position_value - total_cost;
        let trigger_amount = total_value * PROFIT_TRIGGER_PCT / 100;

        info!(
            "Portfolio: cash={}¢ + positions={}¢ = {}¢ | unrealized {:+}¢ (trigger {}¢)",
            cash, position_value, total_value, unrealized_pnl, trigger_amount,
        );

        if unrealized_pnl < trigger_amount || trigger_amount <= 0 {
            return false;
        }

        warn!(
            "PROFIT RULE TRIGGERED: unrealized +{}¢ (trigger {}¢) — selling winners",
            unrealized_pnl, trigger_amount,
        );
        self.stats.profit_rule_triggered += 1;
        self.profit_rule_fired = true;

        for (pos, market) in priced {
            let value = Self::position_value(pos, &market);
            if value <= pos.market_exposure {
                continue;
            }
            let sell_price = if pos.position < 0 {
                market.no_bid.max(0)
            } else {
                market.yes_bid.max(0)
            };
            if sell_price > 0 {
                tokio::time::sleep(Duration::from_millis(RATE_LIMIT_DELAY_MS)).await;
                self.sell_position(pos, sell_price).await;
            }
        }
        true
    }

    /// One poll: profit rule first, then per-position take-profit and
    /// dead-position checks. Returns the number of open positions.
    pub async fn run_check(&mut self) -> usize {
        self.stats.checks += 1;

        let positions = self.open_positions().await;
        self.stats.positions_tracked = positions.len();
        if positions.is_empty() {
            return 0;
        }

        info!("Checking {} open position(s)...", positions.len());

        if self.check_profit_rule(&positions).await {
            info!("Profit rule fired — skipping individual checks this poll");
            return positions.len();
        }

        for pos in &positions {
            tokio::time::sleep(Duration::from_millis(RATE_LIMIT_DELAY_MS)).await;
            let market = match self.client.get_market(&pos.ticker).await {
                Ok(m) => m,
                Err(e) => {
                    error!("Failed to get price for {}: {}", pos.ticker, e);
                    self.stats.errors += 1;
                    continue;
                }
            };

            // Take-profit has priority over the dead check
            if !self.check_take_profit(pos, &market).await {
                self.check_dead_position(pos, &market).await;
            }
        }

        positions.len()
    }

    /// Main loop: 30 s cadence with open positions, 300 s idle. A shutdown
    /// signal finishes the in-flight poll and exits cleanly.
    pub async fn run(&mut self) -> Result<()> {
        self.write_pid();
        info!(
            "Position supervisor started (PID {}), take-profit {}%, poll {}s/{}s",
            std::process::id(),
            self.config.risk.take_profit_pct,
            POLL_INTERVAL_SECS,
            IDLE_INTERVAL_SECS,
        );

        loop {
            // Kill switch pauses all supervision without exiting
            let num_positions = if self.config.kill_switch {
                0
            } else {
                self.run_check().await
            };
            let interval = if num_positions > 0 {
                POLL_INTERVAL_SECS
            } else {
                IDLE_INTERVAL_SECS
            };

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
                _ = shutdown_signal() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.remove_pid();
        info!(
            "Position supervisor stopped. Stats: {}",
            serde_json::to_string(&self.stats).unwrap_or_default(),
        );
        Ok(())
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::MarketType;

    fn bracket(city: &str, market_type: MarketType, low: f64, high: f64) -> PositionBracket {
        PositionBracket {
            city: cities::get(city).unwrap().code,
            station: cities::get(city).unwrap().primary,
            market_type,
            kind: BracketKind::Bracket { low, high },
        }
    }

    fn threshold(city: &str, market_type: MarketType, value: f64) -> PositionBracket {
        PositionBracket {
            city: cities::get(city).unwrap().code,
            station: cities::get(city).unwrap().primary,
            market_type,
            kind: BracketKind::Threshold { value },
        }
    }

    #[test]
    fn test_parse_bracket_ticker() {
        let b = parse_position_bracket("KXHIGHNY-26FEB15-B36.5").unwrap();
        assert_eq!(b.city, "NYC");
        assert_eq!(b.station, "KNYC");
        assert_eq!(b.market_type, MarketType::High);
        assert_eq!(b.kind, BracketKind::Bracket { low: 36.0, high: 37.0 });
    }

    #[test]
    fn test_parse_threshold_ticker() {
        let b = parse_position_bracket("KXLOWTPHIL-26FEB16-T29").unwrap();
        assert_eq!(b.city, "PHI");
        assert_eq!(b.market_type, MarketType::Low);
        assert_eq!(b.kind, BracketKind::Threshold { value: 29.0 });
    }

    #[test]
    fn test_parse_unknown_prefix() {
        assert!(parse_position_bracket("KXBTC-26FEB16-T29").is_none());
        assert!(parse_position_bracket("KXHIGHNY").is_none());
    }

    // ── Decision table: brackets ──

    #[test]
    fn test_high_yes_dead_when_temp_past_cap_afternoon() {
        let b = bracket("NYC", MarketType::High, 36.0, 37.0);
        // Temp 40 > 37 + 2 at 12:00 ET
        assert!(is_position_dead(&b, 40.0, Side::Yes, 12).is_some());
        // Morning: still possible the high rides back... actually the rule
        // requires hour >= 12
        assert!(is_position_dead(&b, 40.0, Side::Yes, 11).is_none());
        // Within the 2°F grace band
        assert!(is_position_dead(&b, 38.5, Side::Yes, 12).is_none());
    }

    #[test]
    fn test_high_yes_dead_when_unreachable_late() {
        let b = bracket("NYC", MarketType::High, 50.0, 51.0);
        // 15:00 ET and 44°F: 6°F below the floor
        assert!(is_position_dead(&b, 44.0, Side::Yes, 15).is_some());
        assert!(is_position_dead(&b, 44.0, Side::Yes, 14).is_none());
        assert!(is_position_dead(&b, 46.0, Side::Yes, 15).is_none());
    }

    #[test]
    fn test_high_no_dead_when_temp_in_bracket_at_peak() {
        let b = bracket("NYC", MarketType::High, 40.0, 42.0);
        assert!(is_position_dead(&b, 41.0, Side::No, 14).is_some());
        assert!(is_position_dead(&b, 41.0, Side::No, 12).is_none());
        assert!(is_position_dead(&b, 41.0, Side::No, 17).is_none());
        assert!(is_position_dead(&b, 44.0, Side::No, 14).is_none());
    }

    #[test]
    fn test_low_yes_dead_when_low_passed() {
        let b = bracket("NYC", MarketType::Low, 30.0, 32.0);
        // Temp dropped below the bracket already
        assert!(is_position_dead(&b, 26.0, Side::Yes, 5).is_some());
        assert!(is_position_dead(&b, 28.0, Side::Yes, 5).is_none());
        // Too warm to cool into the bracket after midnight
        assert!(is_position_dead(&b, 37.0, Side::Yes, 3).is_some());
        assert!(is_position_dead(&b, 35.0, Side::Yes, 3).is_none());
    }

    #[test]
    fn test_low_no_dead_when_temp_settling_in_bracket() {
        let b = bracket("NYC", MarketType::Low, 30.0, 32.0);
        // In bracket during coldest hours
        assert!(is_position_dead(&b, 31.0, Side::No, 5).is_some());
        // In bracket overnight
        assert!(is_position_dead(&b, 31.0, Side::No, 2).is_some());
        // In bracket at midnight: not yet
        assert!(is_position_dead(&b, 31.0, Side::No, 1).is_none());
    }

    // ── Decision table: thresholds ──

    #[test]
    fn test_threshold_high_yes_dead_late() {
        let t = threshold("NYC", MarketType::High, 50.0);
        assert!(is_position_dead(&t, 44.0, Side::Yes, 15).is_some());
        assert!(is_position_dead(&t, 46.0, Side::Yes, 15).is_none());
        assert!(is_position_dead(&t, 44.0, Side::Yes, 14).is_none());
    }

    #[test]
    fn test_threshold_low_yes_dead_when_breached() {
        let t = threshold("PHI", MarketType::Low, 29.0);
        assert!(is_position_dead(&t, 27.5, Side::Yes, 3).is_some());
        assert!(is_position_dead(&t, 28.5, Side::Yes, 3).is_none());
    }

    #[test]
    fn test_threshold_low_no_dead_when_low_wont_reach() {
        let t = threshold("PHI", MarketType::Low, 29.0);
        // 5-8 ET and still 3+ above
        assert!(is_position_dead(&t, 33.0, Side::No, 6).is_some());
        // In threshold range during coldest hours
        assert!(is_position_dead(&t, 31.0, Side::No, 5).is_some());
        // Same temp outside both hour ranges survives
        assert!(is_position_dead(&t, 31.0, Side::No, 9).is_none());
    }

    #[test]
    fn test_threshold_high_no_dead_when_exceeded() {
        let t = threshold("NYC", MarketType::High, 50.0);
        assert!(is_position_dead(&t, 53.0, Side::No, 12).is_some());
        assert!(is_position_dead(&t, 51.0, Side::No, 12).is_none());
        assert!(is_position_dead(&t, 53.0, Side::No, 11).is_none());
    }
}
