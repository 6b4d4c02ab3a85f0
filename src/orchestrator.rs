//! Trading orchestrator: runs the full cycle (settlement sync, portfolio
//! sweeps, weather collection, signal generation, risk gating, sizing, and
//! order placement) with every step failure-isolated.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tracing::{error, info, warn};

use crate::clock;
use crate::config::{Config, TradingMode};
use crate::db::{Database, JournalEntry};
use crate::extremes;
use crate::kalshi::{Action, FeeSchedule, KalshiAuth, KalshiClient, OrderIntent, Side};
use crate::lockin;
use crate::paper;
use crate::risk::{self, GateDecision, StackDecision, TradeCapInputs};
use crate::signals::{self, MarketType, Signal, SignalSource};
use crate::sizing;
use crate::weather::{self, WeatherClient};

/// A position in the unified signed format, from either book.
#[derive(Debug, Clone)]
pub struct PositionView {
    pub ticker: String,
    pub position: i64,
    pub market_exposure: i64,
}

impl PositionView {
    pub fn held_side(&self) -> Side {
        if self.position < 0 {
            Side::No
        } else {
            Side::Yes
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub ticker: String,
    pub side: Side,
    pub contracts: i64,
    pub price_cents: i64,
    pub paper: bool,
    pub order_id: Option<String>,
}

/// Account state sampled for the risk gate.
#[derive(Debug, Clone)]
struct RiskSnapshot {
    account_value_cents: i64,
    total_exposure_cents: i64,
    today_count: i64,
    today_wins: i64,
    looking_good: i64,
}

pub struct TradingBot {
    pub config: Config,
    pub db: Database,
    pub client: KalshiClient,
    pub weather: WeatherClient,
    pub no_jitter: bool,
    profit_rule_triggered: bool,
    fees: FeeSchedule,
}

impl TradingBot {
    pub fn new(config: Config) -> Result<Self> {
        let db = Database::open(&config.db_path)?;

        let auth = if config.kalshi.api_key_id.is_empty() {
            None
        } else {
            match KalshiAuth::from_key_file(
                &config.kalshi.api_key_id,
                &config.kalshi.private_key_path,
            ) {
                Ok(a) => Some(a),
                Err(e) => {
                    warn!("Exchange credentials unavailable: {} — authenticated endpoints disabled", e);
                    None
                }
            }
        };
        let client = KalshiClient::new(config.kalshi_base_url(), auth, config.request_timeout_secs)
            .context("Failed to build exchange client")?;
        let weather = WeatherClient::new()?;

        paper::ensure_seeded(&db)?;

        Ok(TradingBot {
            config,
            db,
            client,
            weather,
            no_jitter: false,
            profit_rule_triggered: false,
            fees: FeeSchedule::weather(),
        })
    }

    /// Assemble from parts; lets tests inject an in-memory DB and mock client.
    pub fn with_parts(
        config: Config,
        db: Database,
        client: KalshiClient,
        weather: WeatherClient,
    ) -> Self {
        TradingBot {
            config,
            db,
            client,
            weather,
            no_jitter: true,
            profit_rule_triggered: false,
            fees: FeeSchedule::weather(),
        }
    }

    pub fn paper_mode(&self) -> bool {
        self.config.trading_mode == TradingMode::Paper
    }

    // ── Trading window ────────────────────────────────────────────────

    /// Which window (if any) is open at the given ET hour. The low window
    /// wraps midnight.
    pub fn trading_window(&self, et_hour: u32) -> Option<MarketType> {
        let w = &self.config.trading_windows;
        if w.high_temp.start_hour_et <= et_hour && et_hour <= w.high_temp.end_hour_et {
            return Some(MarketType::High);
        }
        if et_hour >= w.low_temp.start_hour_et || et_hour <= w.low_temp.end_hour_et {
            return Some(MarketType::Low);
        }
        None
    }

    /// Window gating: today's signals must match the open window; tomorrow's
    /// are always eligible (early-entry edge).
    pub fn filter_for_window(&self, signals: Vec<Signal>, window: MarketType) -> Vec<Signal> {
        let tomorrow = clock::kalshi_date_tomorrow();
        signals
            .into_iter()
            .filter(|s| s.market_type == window || s.event_ticker.contains(&tomorrow))
            .collect()
    }

    // ── Positions & account state ─────────────────────────────────────

    async fn open_positions(&self) -> Result<Vec<PositionView>> {
        if self.paper_mode() {
            Ok(paper::positions(&self.db)?
                .into_iter()
                .map(|p| PositionView {
                    ticker: p.ticker,
                    position: p.position,
                    market_exposure: p.market_exposure,
                })
                .collect())
        } else {
            let positions = self.client.get_positions().await?;
            Ok(positions
                .into_iter()
                .map(|p| PositionView {
                    ticker: p.ticker,
                    position: p.position,
                    market_exposure: p.market_exposure,
                })
                .collect())
        }
    }

    async fn gather_risk_inputs(&self) -> Result<RiskSnapshot> {
        if self.paper_mode() {
            let (cash, _, priced) = paper::portfolio_value(&self.db, &self.client).await?;
            let market_value: i64 = priced.iter().map(|p| p.current_value).sum();
            let total_exposure: i64 = priced
                .iter()
                .filter(|p| p.position != 0)
                .map(|p| p.market_exposure.abs())
                .sum();
            let looking_good = priced
                .iter()
                .filter(|p| p.current_value > p.market_exposure)
                .count() as i64;
            Ok(RiskSnapshot {
                account_value_cents: cash + market_value,
                total_exposure_cents: total_exposure,
                today_count: paper::todays_trade_count(&self.db)?,
                today_wins: paper::todays_wins(&self.db)?,
                looking_good,
            })
        } else {
            let cash = self.client.get_balance().await?;
            let positions = self.open_positions().await?;
            let total_exposure: i64 = positions
                .iter()
                .filter(|p| p.position != 0)
                .map(|p| p.market_exposure.abs())
                .sum();

            let mut looking_good = 0i64;
            for pos in positions.iter().filter(|p| p.position != 0) {
                tokio::time::sleep(Duration::from_millis(150)).await;
                if let Ok(market) = self.client.get_market(&pos.ticker).await {
                    let value = if pos.position < 0 {
                        pos.position.abs() * (100 - market.yes_bid.max(0))
                    } else {
                        pos.position * market.yes_bid.max(0)
                    };
                    if value > pos.market_exposure {
                        looking_good += 1;
                    }
                }
            }

            let today = clock::today_et();
            Ok(RiskSnapshot {
                account_value_cents: cash + total_exposure,
                total_exposure_cents: total_exposure,
                today_count: self.db.journal_count_for_day(&today)?,
                today_wins: self.db.journal_wins_for_day(&today)?,
                looking_good,
            })
        }
    }

    // ── Settlement sync ───────────────────────────────────────────────

    /// Mark settled journal entries with realized P&L and fees. Results are
    /// cached so a ticker is fetched at most once across sweeps.
    pub async fn sync_settlements(&self) -> Result<usize> {
        let unsettled = self.db.unsettled_journal()?;
        if unsettled.is_empty() {
            return Ok(0);
        }

        let mut settled_count = 0usize;
        for row in unsettled {
            let result_str = match self.lookup_settlement(&row.ticker).await {
                Some(r) => r,
                None => continue,
            };

            let won = result_str == row.side;
            let (pnl, outcome) = if won {
                ((100 - row.entry_price_cents) * row.contracts, "win")
            } else {
                (-row.entry_price_cents * row.contracts, "loss")
            };
            let fees = self.fees.taker_fee_cents(row.contracts, row.entry_price_cents);

            self.db
                .settle_journal_row(row.id, outcome, pnl, fees, None)?;
            settled_count += 1;
            info!(
                "SETTLED: {} {} x{} → {} ({:+}¢)",
                row.ticker, row.side, row.contracts, outcome, pnl,
            );
        }

        if settled_count > 0 {
            info!("Settlement sync: {} trades updated", settled_count);
        }
        Ok(settled_count)
    }

    /// Settle paper trades whose markets have resolved.
    pub async fn settle_paper_trades(&self) -> Result<usize> {
        let open: Vec<(i64, String, String)> = {
            let mut stmt = self.db.conn.prepare(
                "SELECT id, market_ticker, side FROM paper_trades WHERE settled = 0",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        let mut settled = 0usize;
        for (id, ticker, side) in open {
            let result_str = match self.lookup_settlement(&ticker).await {
                Some(r) => r,
                None => continue,
            };
            paper::settle_trade(&self.db, id, result_str == side)?;
            settled += 1;
        }
        Ok(settled)
    }

    /// Backfill prediction actuals from the recorded daily extremes once a
    /// prediction's ET day has rolled over. The settlement station's running
    /// extreme for that day IS the settlement value.
    pub fn backfill_prediction_actuals(&self) -> Result<usize> {
        let today = clock::today_et();
        let pending: Vec<(String, String, String)> = {
            let mut stmt = self.db.conn.prepare(
                "SELECT DISTINCT city, market_type, date(created_at, '-5 hours')
                 FROM prediction_log
                 WHERE actual_temp_f IS NULL AND date(created_at, '-5 hours') < ?1",
            )?;
            let rows = stmt
                .query_map([&today], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        let mut backfilled = 0usize;
        for (city_code, market_type, date_et) in pending {
            let city = match crate::cities::get(&city_code) {
                Some(c) => c,
                None => continue,
            };
            let ext = extremes::daily_extremes_for(&self.db, city.primary, &date_et)?;
            let actual = match market_type.as_str() {
                "high" => ext.running_high_f,
                _ => ext.running_low_f,
            };
            if let Some(actual) = actual {
                backfilled +=
                    self.db
                        .settle_predictions(&city_code, &market_type, &date_et, actual)?;
            }
        }

        if backfilled > 0 {
            info!("Backfilled {} prediction actuals", backfilled);
        }
        Ok(backfilled)
    }

    /// Settlement result for a ticker, through the settled-markets cache.
    async fn lookup_settlement(&self, ticker: &str) -> Option<String> {
        if let Ok(Some(cached)) = self.db.cached_settlement(ticker) {
            return Some(cached);
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        let market = match self.client.get_market(ticker).await {
            Ok(m) => m,
            Err(e) => {
                error!("Failed to check settlement for {}: {}", ticker, e);
                return None;
            }
        };

        if !matches!(market.status.as_str(), "settled" | "finalized") {
            return None;
        }
        let result = market.result.filter(|r| !r.is_empty())?;
        if let Err(e) = self.db.cache_settlement(ticker, &result) {
            warn!("Failed to cache settlement for {}: {}", ticker, e);
        }
        Some(result)
    }

    // ── Portfolio sweeps ──────────────────────────────────────────────

    pub async fn log_portfolio(&self) {
        let positions = match self.open_positions().await {
            Ok(p) => p,
            Err(e) => {
                error!("Portfolio status: failed to get positions: {}", e);
                return;
            }
        };

        info!("PORTFOLIO STATUS ({} mode):", self.config.trading_mode);
        let mut total_cost = 0i64;
        let mut total_value = 0i64;
        for pos in positions.iter().filter(|p| p.position != 0) {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let market = match self.client.get_market(&pos.ticker).await {
                Ok(m) => m,
                Err(e) => {
                    error!("  Failed to price {}: {}", pos.ticker, e);
                    continue;
                }
            };
            let yes_bid = market.yes_bid.max(0);
            let value = if pos.position < 0 {
                pos.position.abs() * (100 - yes_bid)
            } else {
                pos.position * yes_bid
            };
            let pnl = value - pos.market_exposure;
            total_cost += pos.market_exposure;
            total_value += value;
            info!(
                "  {} {} x{} | cost={}¢ now={}¢ pnl={:+}¢ (YES@{}¢)",
                pos.ticker,
                pos.held_side(),
                pos.position.abs(),
                pos.market_exposure,
                value,
                pnl,
                yes_bid,
            );
        }
        info!(
            "  Positions cost: ${:.2} | value: ${:.2} | unrealized: {:+}¢",
            total_cost as f64 / 100.0,
            total_value as f64 / 100.0,
            total_value - total_cost,
        );
    }

    /// Unrealized-profit rule: when open-position profit reaches 10% of
    /// total account value, lock in every winner and unlock bonus trades.
    pub async fn check_profit_rule(&mut self) -> Result<bool> {
        const PROFIT_TRIGGER_PCT: i64 = 10;

        let (cash, positions) = if self.paper_mode() {
            let (cash, _, priced) = paper::portfolio_value(&self.db, &self.client).await?;
            let views: Vec<(PositionView, i64)> = priced
                .into_iter()
                .filter(|p| p.position != 0)
                .map(|p| {
                    (
                        PositionView {
                            ticker: p.ticker,
                            position: p.position,
                            market_exposure: p.market_exposure,
                        },
                        p.current_value,
                    )
                })
                .collect();
            (cash, views)
        } else {
            let cash = self.client.get_balance().await?;
            let mut views = Vec::new();
            for pos in self.open_positions().await? {
                if pos.position == 0 {
                    continue;
                }
                tokio::time::sleep(Duration::from_millis(150)).await;
                let market = match self.client.get_market(&pos.ticker).await {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                let value = if pos.position < 0 {
                    pos.position.abs() * (100 - market.yes_bid.max(0))
                } else {
                    pos.position * market.yes_bid.max(0)
                };
                views.push((pos, value));
            }
            (cash, views)
        };

        let total_cost: i64 = positions.iter().map(|(p, _)| p.market_exposure).sum();
        let total_value: i64 = positions.iter().map(|(_, v)| *v).sum();
        let unrealized_pnl = total_value - total_cost;
        let account_value = cash + total_value;
        let trigger_amount = account_value * PROFIT_TRIGGER_PCT / 100;

        info!(
            "Profit rule check: unrealized P&L={}¢ vs trigger={}¢ (10% of ${:.2})",
            unrealized_pnl,
            trigger_amount,
            account_value as f64 / 100.0,
        );

        if unrealized_pnl >= trigger_amount && trigger_amount > 0 {
            info!(
                "PROFIT RULE TRIGGERED: unrealized +{}¢ (trigger {}¢) — selling winners",
                unrealized_pnl, trigger_amount,
            );
            let views: Vec<PositionView> = positions.into_iter().map(|(p, _)| p).collect();
            self.liquidate_winning_positions(&views).await;
            self.profit_rule_triggered = true;
            self.append_event_log(serde_json::json!({
                "type": "profit_rule",
                "timestamp": clock::now_utc().to_rfc3339(),
                "unrealized_pnl_cents": unrealized_pnl,
                "trigger_cents": trigger_amount,
                "account_value_cents": account_value,
            }));
            return Ok(true);
        }
        Ok(false)
    }

    pub fn profit_rule_triggered(&self) -> bool {
        self.profit_rule_triggered
    }

    /// Close only the positions currently priced above cost. Closes are
    /// always sell orders on the held side.
    pub async fn liquidate_winning_positions(&self, positions: &[PositionView]) {
        for pos in positions {
            if pos.position == 0 {
                continue;
            }
            tokio::time::sleep(Duration::from_millis(150)).await;
            let market = match self.client.get_market(&pos.ticker).await {
                Ok(m) => m,
                Err(e) => {
                    error!("Failed to price {} for liquidation: {}", pos.ticker, e);
                    continue;
                }
            };

            if pos.position < 0 {
                // NO: profitable when closing costs less than we received
                let abs_qty = pos.position.abs();
                let received_per = if abs_qty > 0 {
                    pos.market_exposure / abs_qty
                } else {
                    0
                };
                let no_ask = market.no_ask.max(0);
                if no_ask > 0 && no_ask < received_per {
                    self.close_position(pos, no_ask, market.yes_bid.max(0)).await;
                    info!(
                        "Locked NO profit: {} sold {} NO @ {}¢ (received {}¢)",
                        pos.ticker, abs_qty, no_ask, received_per,
                    );
                } else {
                    info!(
                        "Skipping {} — NO not profitable (close@{}¢ vs received@{}¢)",
                        pos.ticker, no_ask, received_per,
                    );
                }
            } else {
                let yes_bid = market.yes_bid.max(0);
                let avg_cost = if pos.position > 0 {
                    pos.market_exposure / pos.position
                } else {
                    0
                };
                if yes_bid > avg_cost {
                    self.close_position(pos, yes_bid, yes_bid).await;
                    info!(
                        "Locked YES profit: {} sold {} @ {}¢ (cost {}¢)",
                        pos.ticker, pos.position, yes_bid, avg_cost,
                    );
                } else {
                    info!(
                        "Skipping {} — YES not profitable (bid {}¢ vs cost {}¢)",
                        pos.ticker, yes_bid, avg_cost,
                    );
                }
            }
        }
    }

    /// Close a position at a limit price: sell the held side. `yes_bid` is
    /// what the paper ledger credits against.
    async fn close_position(&self, pos: &PositionView, price_cents: i64, yes_bid: i64) {
        let side = pos.held_side();
        let count = pos.position.abs();

        if self.paper_mode() {
            if let Err(e) =
                paper::close_position(&self.db, &pos.ticker, &side.to_string(), count, yes_bid)
            {
                error!("Paper close failed for {}: {}", pos.ticker, e);
            }
            return;
        }

        let intent = OrderIntent {
            ticker: pos.ticker.clone(),
            action: Action::Sell,
            side,
            count,
            price_cents,
        };
        match self.client.create_order(&intent).await {
            Ok(order) => info!(
                "CLOSE ORDER: {} sell {} x{} @ {}¢ → {}",
                pos.ticker, side, count, price_cents, order.status,
            ),
            Err(e) => error!("Failed to close {}: {}", pos.ticker, e),
        }
    }

    /// Sell positions that have captured at least `take_profit_pct` of cost.
    pub async fn check_take_profits(&self) {
        let take_profit_pct = self.config.risk.take_profit_pct;
        info!("Checking positions for take-profit (>={}% gain)...", take_profit_pct);

        let positions = match self.open_positions().await {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to get positions for take-profit: {}", e);
                return;
            }
        };

        for pos in positions.iter().filter(|p| p.position != 0) {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let market = match self.client.get_market(&pos.ticker).await {
                Ok(m) => m,
                Err(e) => {
                    error!("Failed to check market {}: {}", pos.ticker, e);
                    continue;
                }
            };
            if market.status != "active" {
                continue;
            }

            let yes_bid = market.yes_bid.max(0);
            let no_bid = market.no_bid.max(0);
            let cost = pos.market_exposure;
            if cost <= 0 {
                continue;
            }

            let (current_value, sell_price) = if pos.position < 0 {
                (pos.position.abs() * (100 - yes_bid), no_bid)
            } else {
                (pos.position * yes_bid, yes_bid)
            };
            if sell_price <= 0 {
                continue;
            }

            let gain_pct = (current_value - cost) as f64 / cost as f64 * 100.0;
            if gain_pct >= take_profit_pct {
                info!(
                    "TAKE PROFIT: {} {} x{} | cost={}¢ now={}¢ | gain {:.0}%",
                    pos.ticker,
                    pos.held_side(),
                    pos.position.abs(),
                    cost,
                    current_value,
                    gain_pct,
                );
                self.close_position(pos, sell_price, yes_bid).await;
                self.append_event_log(serde_json::json!({
                    "type": "take_profit",
                    "timestamp": clock::now_utc().to_rfc3339(),
                    "ticker": pos.ticker,
                    "qty": pos.position.abs(),
                    "cost_cents": cost,
                    "sell_price_cents": sell_price,
                    "gain_pct": gain_pct,
                }));
            }
        }
    }

    /// Exit positions more than 42% underwater while a bid remains.
    pub async fn cut_losers(&self) {
        const CUT_LOSS_PCT: f64 = 42.0;
        const MIN_EXIT_BID: i64 = 2;

        let positions = match self.open_positions().await {
            Ok(p) => p,
            Err(e) => {
                error!("Cut losers: failed to get positions: {}", e);
                return;
            }
        };

        for pos in positions.iter().filter(|p| p.position != 0) {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let market = match self.client.get_market(&pos.ticker).await {
                Ok(m) => m,
                Err(e) => {
                    error!("Cut losers: failed on {}: {}", pos.ticker, e);
                    continue;
                }
            };
            if market.status != "active" {
                continue;
            }

            let yes_bid = market.yes_bid.max(0);
            let no_bid = market.no_bid.max(0);
            let cost = pos.market_exposure;
            if cost == 0 {
                continue;
            }

            let (current_value, sell_price) = if pos.position < 0 {
                (pos.position.abs() * (100 - yes_bid), no_bid)
            } else {
                (pos.position * yes_bid, yes_bid)
            };

            let loss_pct = (cost - current_value) as f64 / cost as f64 * 100.0;
            if loss_pct >= CUT_LOSS_PCT && sell_price >= MIN_EXIT_BID {
                info!(
                    "CUT LOSER: {} | cost={}¢ now={}¢ ({:.0}% loss) | selling {} x{} @ {}¢",
                    pos.ticker,
                    cost,
                    current_value,
                    loss_pct,
                    pos.held_side(),
                    pos.position.abs(),
                    sell_price,
                );
                self.close_position(pos, sell_price, yes_bid).await;
            }
        }
    }

    // ── Signal execution ──────────────────────────────────────────────

    /// The per-signal risk gate; the first reject wins.
    async fn check_risk_limits(&self, signal: &Signal) -> Result<GateDecision> {
        let snapshot = self.gather_risk_inputs().await?;

        let decision = risk::check_capital_cap(
            snapshot.total_exposure_cents,
            snapshot.account_value_cents,
        );
        if !decision.is_accept() {
            return Ok(decision);
        }

        let decision = risk::check_trade_cap(
            signal,
            &TradeCapInputs {
                today_count: snapshot.today_count,
                today_wins: snapshot.today_wins,
                looking_good: snapshot.looking_good,
                account_value_cents: snapshot.account_value_cents,
                profit_rule_triggered: self.profit_rule_triggered,
            },
            &self.config.risk,
        );
        if !decision.is_accept() {
            return Ok(decision);
        }

        Ok(risk::check_min_edge(signal, &self.config.risk))
    }

    /// Current holdings relevant to dedup/stacking for a signal.
    async fn holdings_for(&self, signal: &Signal) -> Result<(bool, i64)> {
        if self.paper_mode() {
            let held = paper::is_duplicate(&self.db, &signal.market_ticker, &signal.side.to_string())?;
            let contracts = paper::contracts_on_ticker(&self.db, &signal.market_ticker)?;
            Ok((held, contracts))
        } else {
            let positions = self.open_positions().await?;
            let matching = positions
                .iter()
                .find(|p| p.ticker == signal.market_ticker && p.position != 0);
            let held = matching.is_some_and(|p| p.held_side() == signal.side);
            let contracts = matching.map_or(0, |p| p.position.abs());
            Ok((held, contracts))
        }
    }

    /// Run one signal through the full gate chain and place the order.
    pub async fn execute_signal(&self, signal: &Signal) -> Result<Option<ExecutionResult>> {
        // Kill switch blocks all order creation
        if let GateDecision::Reject(reason) = risk::check_kill_switch(self.config.kill_switch) {
            warn!("Order blocked: {} ({})", signal.market_ticker, reason);
            return Ok(None);
        }

        let (already_held, existing_contracts) = match self.holdings_for(signal).await {
            Ok(h) => h,
            Err(e) => {
                error!("Position check failed: {} — blocking trade for safety", e);
                return Ok(None);
            }
        };

        if let GateDecision::Reject(reason) = risk::check_ticker_cap(
            existing_contracts,
            self.config.risk.max_contracts_per_ticker,
        ) {
            warn!("Order blocked: {} ({})", signal.market_ticker, reason);
            return Ok(None);
        }

        if let GateDecision::Reject(reason) = risk::check_yes_policy(signal) {
            info!("Skipping {}: {}", signal.market_ticker, reason);
            return Ok(None);
        }

        if let GateDecision::Reject(reason) = risk::sanity_check(signal) {
            warn!("Trade blocked by sanity check: {} ({})", signal.market_ticker, reason);
            return Ok(None);
        }

        let is_stacking = match risk::stacking_decision(signal, already_held, existing_contracts) {
            StackDecision::FirstEntry => false,
            StackDecision::Stack => {
                info!(
                    "LOCK-IN STACK: {} {} (edge {:.0}%, existing {}) — adding contracts",
                    signal.market_ticker, signal.side, signal.edge_pct, existing_contracts,
                );
                true
            }
            StackDecision::Blocked(reason) => {
                info!("Skipping {}: {}", signal.market_ticker, reason);
                return Ok(None);
            }
        };

        match self.check_risk_limits(signal).await {
            Ok(GateDecision::Accept) => {}
            Ok(GateDecision::Reject(reason)) => {
                info!("Risk: {}", reason);
                return Ok(None);
            }
            Err(e) => {
                error!("Risk check failed: {} — blocking trade", e);
                return Ok(None);
            }
        }

        let balance = if self.paper_mode() {
            paper::balance(&self.db)?
        } else {
            self.client.get_balance().await?
        };
        let contracts = sizing::size_contracts(
            signal,
            is_stacking,
            balance,
            &self.config.risk,
            &mut rand::thread_rng(),
        );
        if contracts <= 0 {
            info!("Skipping {}: position size = 0", signal.market_ticker);
            return Ok(None);
        }

        if self.paper_mode() {
            let fill = paper::open_trade(&self.db, signal, contracts, &self.config.risk)?;
            Ok(fill.map(|f| ExecutionResult {
                ticker: f.ticker,
                side: signal.side,
                contracts: f.contracts,
                price_cents: f.price_cents,
                paper: true,
                order_id: None,
            }))
        } else {
            self.execute_live(signal, contracts).await
        }
    }

    async fn execute_live(
        &self,
        signal: &Signal,
        contracts: i64,
    ) -> Result<Option<ExecutionResult>> {
        let intent = OrderIntent {
            ticker: signal.market_ticker.clone(),
            action: signal.action,
            side: signal.side,
            count: contracts,
            price_cents: signal.suggested_price_cents,
        };

        let order = match self.client.create_order(&intent).await {
            Ok(o) => o,
            Err(e) => {
                error!("Failed to place order: {}", e);
                return Ok(None);
            }
        };
        info!(
            "LIVE ORDER PLACED: {} {} {} x{} @ {}¢ (order {})",
            signal.action,
            signal.side,
            signal.market_ticker,
            contracts,
            signal.suggested_price_cents,
            order.order_id,
        );

        // Top-of-book snapshot at execution time, for later analysis
        if let Ok(market) = self.client.get_market(&signal.market_ticker).await {
            let _ = self.db.insert_orderbook_snapshot(
                &signal.market_ticker,
                market.yes_bid,
                market.yes_ask,
                market.no_bid,
                market.no_ask,
            );
        }

        let (floor_strike, cap_strike) = match signal.strike {
            Some(crate::signals::Strike::Bracket { floor, cap }) => (Some(floor), Some(cap)),
            Some(crate::signals::Strike::GreaterThan { floor }) => (Some(floor), None),
            Some(crate::signals::Strike::LessThan { cap }) => (None, Some(cap)),
            None => (None, None),
        };

        let entry = JournalEntry {
            order_id: order.order_id.clone(),
            ticker: signal.market_ticker.clone(),
            event_ticker: signal.event_ticker.clone(),
            city: signal.city.clone(),
            market_type: signal.market_type.to_string(),
            side: signal.side.to_string(),
            contracts,
            entry_price_cents: signal.suggested_price_cents,
            estimated_temp_f: signal.forecast_temp_f,
            forecast_temp_f: signal.forecast_temp_f,
            primary_temp_f: signal.current_temp_f,
            surrounding_avg_f: signal.surrounding_avg_f,
            confidence: signal.confidence,
            edge_pct: signal.edge_pct,
            floor_strike,
            cap_strike,
            our_probability: signal.our_probability,
            market_probability: signal.market_yes_price_cents as f64 / 100.0,
            signal_source: signal.signal_source.to_string(),
        };
        if let Err(e) = self.db.journal_trade(&entry) {
            error!("Failed to journal trade: {}", e);
        }

        Ok(Some(ExecutionResult {
            ticker: signal.market_ticker.clone(),
            side: signal.side,
            contracts,
            price_cents: signal.suggested_price_cents,
            paper: false,
            order_id: Some(order.order_id),
        }))
    }

    fn log_predictions(&self, signals: &[Signal]) {
        let mut seen = std::collections::HashSet::new();
        for s in signals {
            let key = format!("{}_{}", s.city, s.market_type);
            if !seen.insert(key) {
                continue;
            }
            if let Err(e) = self.db.insert_prediction(
                &s.city,
                &s.market_type.to_string(),
                s.forecast_temp_f,
                Some(s.forecast_temp_f),
                s.current_temp_f,
                s.surrounding_avg_f,
                s.confidence,
            ) {
                error!("Failed to log prediction: {}", e);
            }
        }
    }

    fn append_event_log(&self, event: serde_json::Value) {
        use std::io::Write;
        let dir = Path::new(&self.config.log_dir);
        if std::fs::create_dir_all(dir).is_err() {
            return;
        }
        let path = dir.join("take_profits.jsonl");
        if let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{}", event);
        }
    }

    // ── The cycle ─────────────────────────────────────────────────────

    pub async fn run_cycle(&mut self) {
        // Anti-front-running: random delay so we never trade on the clock
        if !self.no_jitter {
            let jitter = rand::thread_rng().gen_range(0..=300u64);
            info!("Anti-front-run jitter: waiting {}s before cycle", jitter);
            tokio::time::sleep(Duration::from_secs(jitter)).await;
        }

        info!("Starting bot cycle [{} mode]", self.config.trading_mode);

        // Settlement sync
        if self.paper_mode() {
            if let Err(e) = self.settle_paper_trades().await {
                error!("Paper settlement sync failed: {}", e);
            }
        } else if let Err(e) = self.sync_settlements().await {
            error!("Settlement sync failed: {}", e);
        }
        if let Err(e) = self.backfill_prediction_actuals() {
            error!("Prediction backfill failed: {}", e);
        }

        self.log_portfolio().await;

        if let Err(e) = self.check_profit_rule().await {
            error!("Profit rule check failed: {}", e);
        }

        self.check_take_profits().await;
        self.cut_losers().await;

        // Weather collection and extremes never abort the cycle
        let obs_count = weather::collect_all(&self.db, &self.weather, &self.config).await;
        info!("Collected {} observations", obs_count);
        let station_count =
            extremes::update_all_stations(&self.db, &self.weather, &self.config).await;
        info!("Updated {} METAR stations", station_count);

        let et_hour = clock::et_hour();
        let window = match self.trading_window(et_hour) {
            Some(w) => w,
            None => {
                info!("Outside trading window. Skipping signal generation.");
                return;
            }
        };
        info!("In {} temp trading window", window);

        let model_signals =
            signals::generate_model_signals(&self.db, &self.client, &self.weather, &self.config)
                .await;
        let lockin_signals =
            lockin::generate_lockin_signals(&self.db, &self.client, &self.config, et_hour).await;

        // Lock-in signals go first
        let mut all_signals = lockin_signals;
        all_signals.extend(model_signals);

        self.log_predictions(&all_signals);

        let window_signals = self.filter_for_window(all_signals, window);
        let lockin_count = window_signals
            .iter()
            .filter(|s| s.signal_source == SignalSource::MetarLockin)
            .count();
        info!(
            "Window signals: {} model + {} lock-in",
            window_signals.len() - lockin_count,
            lockin_count,
        );
        if window_signals.is_empty() {
            info!("No actionable signals for {} window", window);
            return;
        }

        // Execute top signals: at most 3 per cycle, 2 brackets per event
        let max_per_event = self.config.risk.max_brackets_per_event as i64;
        let mut executed = 0usize;
        let mut event_bracket_count: std::collections::HashMap<String, i64> =
            std::collections::HashMap::new();

        for signal in &window_signals {
            if executed >= 3 {
                break;
            }
            let evt_count = event_bracket_count
                .get(&signal.event_ticker)
                .copied()
                .unwrap_or(0);
            if evt_count >= max_per_event {
                info!(
                    "Skipping {}: max {} brackets for event {}",
                    signal.market_ticker, max_per_event, signal.event_ticker,
                );
                continue;
            }

            match self.execute_signal(signal).await {
                Ok(Some(_)) => {
                    executed += 1;
                    *event_bracket_count
                        .entry(signal.event_ticker.clone())
                        .or_insert(0) += 1;
                    info!("Trade {} executed: {}", executed, signal);
                }
                Ok(None) => {}
                Err(e) => error!("Execution failed for {}: {}", signal.market_ticker, e),
            }
        }

        if self.paper_mode() {
            if let Ok(s) = paper::summary(&self.db) {
                info!(
                    "Paper balance: ${:.2} | trades: {} | P&L: ${:.2}",
                    s.balance_cents as f64 / 100.0,
                    s.total_trades,
                    s.total_pnl_cents as f64 / 100.0,
                );
            }
        }

        match self.db.source_stats() {
            Ok(stats) => {
                for s in stats {
                    if s.total_trades > 0 {
                        info!(
                            "{}: {} trades, {:.1}% win rate, avg P&L {:.1}¢ (total: {}¢)",
                            s.source, s.total_trades, s.win_rate_pct, s.avg_pnl_cents, s.total_pnl_cents,
                        );
                    }
                }
            }
            Err(e) => error!("Source stats failed: {}", e),
        }
    }

    /// Continuous mode: cycles separated by the configured interval; a
    /// shutdown signal aborts the sleep.
    pub async fn run_continuous(&mut self, interval_min: Option<u64>) {
        let interval = interval_min.unwrap_or(self.config.collector_interval_min);
        info!("Starting continuous mode (interval: {} min)", interval);

        loop {
            self.run_cycle().await;
            info!("Next cycle in {} minutes...", interval);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(interval * 60)) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received — stopping after current cycle");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::Strike;

    fn paper_bot() -> TradingBot {
        let config = Config::from_env().unwrap();
        let db = Database::open_in_memory().unwrap();
        let client = KalshiClient::with_client(
            reqwest::Client::new(),
            "http://unused:1".to_string(),
            None,
        );
        let weather = WeatherClient::with_base_urls(
            "http://unused:1".to_string(),
            "http://unused:1".to_string(),
        )
        .unwrap();
        TradingBot::with_parts(config, db, client, weather)
    }

    fn no_signal(ticker: &str, yes_price: i64, edge: f64, source: SignalSource) -> Signal {
        Signal {
            city: "NYC".to_string(),
            market_type: MarketType::High,
            event_ticker: "KXHIGHNY-26FEB18".to_string(),
            market_ticker: ticker.to_string(),
            action: Action::Buy,
            side: Side::No,
            suggested_price_cents: 100 - yes_price,
            confidence: 0.8,
            edge_pct: edge,
            reason: "test".to_string(),
            current_temp_f: 41.0,
            forecast_temp_f: 44.0,
            surrounding_avg_f: 40.5,
            market_yes_price_cents: yes_price,
            is_tomorrow: false,
            margin_f: 5.0,
            signal_source: source,
            strike: Some(Strike::Bracket { floor: 50.0, cap: 51.0 }),
            our_probability: 0.03,
        }
    }

    #[test]
    fn test_trading_window_high() {
        let bot = paper_bot();
        assert_eq!(bot.trading_window(8), Some(MarketType::High));
        assert_eq!(bot.trading_window(12), Some(MarketType::High));
        assert_eq!(bot.trading_window(18), Some(MarketType::High));
        assert_eq!(bot.trading_window(19), None);
    }

    #[test]
    fn test_trading_window_low_wraps_midnight() {
        let bot = paper_bot();
        assert_eq!(bot.trading_window(20), Some(MarketType::Low));
        assert_eq!(bot.trading_window(23), Some(MarketType::Low));
        assert_eq!(bot.trading_window(2), Some(MarketType::Low));
        // Inside both ranges, high wins at 8
        assert_eq!(bot.trading_window(8), Some(MarketType::High));
    }

    #[test]
    fn test_window_filter_allows_tomorrow() {
        let bot = paper_bot();
        let tomorrow = clock::kalshi_date_tomorrow();

        let mut today_low = no_signal("A", 30, 50.0, SignalSource::Model);
        today_low.market_type = MarketType::Low;

        let mut tomorrow_low = no_signal("B", 30, 50.0, SignalSource::Model);
        tomorrow_low.market_type = MarketType::Low;
        tomorrow_low.event_ticker = format!("KXLOWTNYC-{}", tomorrow);

        let kept = bot.filter_for_window(vec![today_low, tomorrow_low], MarketType::High);
        // Today's low signal is out of window; tomorrow's is always eligible
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].market_ticker, "B");
    }

    #[tokio::test]
    async fn test_kill_switch_blocks_execution() {
        let mut bot = paper_bot();
        bot.config.kill_switch = true;
        let result = bot
            .execute_signal(&no_signal("T1", 30, 50.0, SignalSource::Model))
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(paper::todays_trade_count(&bot.db).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_yes_model_signal_blocked() {
        let bot = paper_bot();
        let mut signal = no_signal("T1", 80, 20.0, SignalSource::Model);
        signal.side = Side::Yes;
        signal.suggested_price_cents = 80;
        let result = bot.execute_signal(&signal).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_paper_execution_places_trade() {
        let bot = paper_bot();
        let result = bot
            .execute_signal(&no_signal("T1", 30, 50.0, SignalSource::Model))
            .await
            .unwrap()
            .unwrap();
        assert!(result.paper);
        assert_eq!(result.side, Side::No);
        assert!(result.contracts >= 1);
        // Balance was debited
        assert!(paper::balance(&bot.db).unwrap() < paper::PAPER_BANKROLL_START_CENTS);
    }

    #[tokio::test]
    async fn test_model_dedup_blocks_second_trade() {
        let bot = paper_bot();
        let signal = no_signal("T1", 30, 50.0, SignalSource::Model);
        assert!(bot.execute_signal(&signal).await.unwrap().is_some());
        // Same (ticker, side) again → dedup
        assert!(bot.execute_signal(&signal).await.unwrap().is_none());

        // Different ticker passes
        let other = no_signal("T2", 30, 50.0, SignalSource::Model);
        assert!(bot.execute_signal(&other).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lockin_stacking_allowed() {
        let bot = paper_bot();
        let signal = no_signal("T1", 30, 90.0, SignalSource::MetarLockin);
        assert!(bot.execute_signal(&signal).await.unwrap().is_some());
        // Lock-in stacks instead of deduping
        assert!(bot.execute_signal(&signal).await.unwrap().is_some());
        assert!(paper::contracts_on_ticker(&bot.db, "T1").unwrap() > 0);
    }

    #[tokio::test]
    async fn test_sanity_gate_blocks_in_pipeline() {
        let bot = paper_bot();
        // 95% edge on a liquid 25¢ market, model source → blocked
        let signal = no_signal("T1", 25, 95.0, SignalSource::Model);
        assert!(bot.execute_signal(&signal).await.unwrap().is_none());

        // Same numbers as a lock-in → allowed
        let signal = no_signal("T1", 25, 95.0, SignalSource::MetarLockin);
        assert!(bot.execute_signal(&signal).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_min_edge_blocks_weak_model_signal() {
        let bot = paper_bot();
        let signal = no_signal("T1", 30, 10.0, SignalSource::Model);
        assert!(bot.execute_signal(&signal).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_settlement_math_no_side() {
        let bot = paper_bot();
        bot.db
            .journal_trade(&JournalEntry {
                order_id: "o1".to_string(),
                ticker: "T1".to_string(),
                event_ticker: "E".to_string(),
                city: "NYC".to_string(),
                market_type: "high".to_string(),
                side: "no".to_string(),
                contracts: 5,
                entry_price_cents: 70,
                estimated_temp_f: 44.0,
                forecast_temp_f: 44.0,
                primary_temp_f: 41.0,
                surrounding_avg_f: 40.0,
                confidence: 0.9,
                edge_pct: 90.0,
                floor_strike: Some(58.0),
                cap_strike: None,
                our_probability: 0.01,
                market_probability: 0.3,
                signal_source: "metar_lockin".to_string(),
            })
            .unwrap();
        // Cache the result so no HTTP call is needed
        bot.db.cache_settlement("T1", "no").unwrap();

        let n = bot.sync_settlements().await.unwrap();
        assert_eq!(n, 1);

        let rows = bot.db.unsettled_journal().unwrap();
        assert!(rows.is_empty());
        let (result, pnl): (String, i64) = bot
            .db
            .conn
            .query_row(
                "SELECT settlement_result, pnl_cents FROM trade_journal WHERE ticker = 'T1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(result, "win");
        // NO bought at 70¢ wins (100 - 70) * 5 = 150
        assert_eq!(pnl, 150);
    }

    #[tokio::test]
    async fn test_paper_settlement_sweep() {
        let bot = paper_bot();
        let signal = no_signal("T1", 30, 50.0, SignalSource::Model);
        paper::open_trade(&bot.db, &signal, 5, &bot.config.risk).unwrap();
        bot.db.cache_settlement("T1", "no").unwrap();

        let n = bot.settle_paper_trades().await.unwrap();
        assert_eq!(n, 1);
        let s = paper::summary(&bot.db).unwrap();
        assert_eq!(s.wins, 1);
    }

    #[test]
    fn test_prediction_backfill_from_extremes() {
        let bot = paper_bot();
        // A prediction from yesterday, still unsettled
        bot.db
            .conn
            .execute(
                "INSERT INTO prediction_log (city, market_type, estimated_temp_f, confidence, created_at)
                 VALUES ('NYC', 'high', 44.0, 0.7, datetime('now', '-1 day'))",
                [],
            )
            .unwrap();
        // Yesterday's recorded extreme at the settlement station
        let yesterday: String = bot
            .db
            .conn
            .query_row("SELECT date('now', '-5 hours', '-1 day')", [], |r| r.get(0))
            .unwrap();
        crate::extremes::record_temp(&bot.db, "KNYC", &yesterday, 46.0).unwrap();

        let n = bot.backfill_prediction_actuals().unwrap();
        assert_eq!(n, 1);

        let (actual, err): (f64, f64) = bot
            .db
            .conn
            .query_row(
                "SELECT actual_temp_f, error_f FROM prediction_log",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(actual, 46.0);
        assert!((err - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_prediction_backfill_skips_today() {
        let bot = paper_bot();
        bot.db
            .insert_prediction("NYC", "high", 44.0, None, 41.0, 40.0, 0.7)
            .unwrap();
        crate::extremes::record_temp(&bot.db, "KNYC", &clock::today_et(), 46.0).unwrap();

        // Today's prediction is still live; nothing settles
        let n = bot.backfill_prediction_actuals().unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_prediction_logging_dedups_city_type() {
        let bot = paper_bot();
        let signals = vec![
            no_signal("T1", 30, 50.0, SignalSource::Model),
            no_signal("T2", 25, 40.0, SignalSource::Model),
        ];
        bot.log_predictions(&signals);
        // Both are NYC/high → one prediction row
        let count: i64 = bot
            .db
            .conn
            .query_row("SELECT COUNT(*) FROM prediction_log", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
