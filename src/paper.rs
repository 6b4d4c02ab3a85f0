//! Paper trading mirror: a shadow ledger and portfolio model that reproduces
//! exchange accounting against the same risk and control logic.
//!
//! The balance ledger is append-only; the current balance is the latest row.
//! YES trades aggregate to positive position, NO trades to negative.

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::clock;
use crate::config::RiskConfig;
use crate::db::Database;
use crate::kalshi::KalshiClient;
use crate::signals::Signal;

pub const PAPER_BANKROLL_START_CENTS: i64 = 10_000;

/// An open paper position aggregated across unsettled rows.
#[derive(Debug, Clone)]
pub struct PaperPosition {
    pub ticker: String,
    /// Signed: YES contracts minus NO contracts.
    pub position: i64,
    /// Cost basis across unsettled rows, in cents.
    pub market_exposure: i64,
}

/// A position priced against live quotes.
#[derive(Debug, Clone)]
pub struct PricedPosition {
    pub ticker: String,
    pub position: i64,
    pub market_exposure: i64,
    pub current_value: i64,
    pub yes_bid: i64,
    pub no_bid: i64,
}

#[derive(Debug, Clone)]
pub struct PaperFill {
    pub ticker: String,
    pub side: String,
    pub price_cents: i64,
    pub contracts: i64,
    pub cost_cents: i64,
    pub balance_after: i64,
}

#[derive(Debug, Clone)]
pub struct PaperSummary {
    pub balance_cents: i64,
    pub total_trades: i64,
    pub wins: i64,
    pub losses: i64,
    pub total_pnl_cents: i64,
    pub open_trades: i64,
    pub roi_pct: f64,
}

/// Seed the balance ledger on first run.
pub fn ensure_seeded(db: &Database) -> Result<()> {
    let count: i64 = db
        .conn
        .query_row("SELECT COUNT(*) FROM paper_balance", [], |row| row.get(0))
        .context("Failed to count paper balance entries")?;
    if count == 0 {
        db.conn
            .execute(
                "INSERT INTO paper_balance (balance_cents, updated_at) VALUES (?1, datetime('now'))",
                [PAPER_BANKROLL_START_CENTS],
            )
            .context("Failed to seed paper balance")?;
    }
    Ok(())
}

pub fn balance(db: &Database) -> Result<i64> {
    let bal: i64 = db
        .conn
        .query_row(
            "SELECT COALESCE((SELECT balance_cents FROM paper_balance ORDER BY id DESC LIMIT 1), ?1)",
            [PAPER_BANKROLL_START_CENTS],
            |row| row.get(0),
        )
        .context("Failed to get paper balance")?;
    Ok(bal)
}

fn append_balance(db: &Database, balance_cents: i64) -> Result<()> {
    db.conn
        .execute(
            "INSERT INTO paper_balance (balance_cents, updated_at) VALUES (?1, datetime('now'))",
            [balance_cents],
        )
        .context("Failed to append paper balance")?;
    Ok(())
}

/// Paper trades placed today (ET day boundary, matching settlement).
pub fn todays_trade_count(db: &Database) -> Result<i64> {
    let today = clock::today_et();
    let count: i64 = db
        .conn
        .query_row(
            "SELECT COUNT(*) FROM paper_trades WHERE date(created_at, '-5 hours') = ?1",
            [today],
            |row| row.get(0),
        )
        .context("Failed to count today's paper trades")?;
    Ok(count)
}

pub fn todays_wins(db: &Database) -> Result<i64> {
    let today = clock::today_et();
    let count: i64 = db
        .conn
        .query_row(
            "SELECT COUNT(*) FROM paper_trades
             WHERE settled = 1 AND pnl_cents > 0 AND date(created_at, '-5 hours') = ?1",
            [today],
            |row| row.get(0),
        )
        .context("Failed to count today's paper wins")?;
    Ok(count)
}

/// Open (unsettled) trade on the same market and side today?
pub fn is_duplicate(db: &Database, ticker: &str, side: &str) -> Result<bool> {
    let today = clock::today_et();
    let count: i64 = db
        .conn
        .query_row(
            "SELECT COUNT(*) FROM paper_trades
             WHERE market_ticker = ?1 AND side = ?2 AND settled = 0
               AND date(created_at, '-5 hours') = ?3",
            rusqlite::params![ticker, side, today],
            |row| row.get(0),
        )
        .context("Failed to check paper duplicate")?;
    Ok(count > 0)
}

/// Total contracts held (either side) on a ticker across unsettled rows.
pub fn contracts_on_ticker(db: &Database, ticker: &str) -> Result<i64> {
    let count: i64 = db
        .conn
        .query_row(
            "SELECT COALESCE(SUM(contracts), 0) FROM paper_trades
             WHERE market_ticker = ?1 AND settled = 0",
            [ticker],
            |row| row.get(0),
        )
        .context("Failed to count contracts on ticker")?;
    Ok(count)
}

/// Record a fill: insert the trade row and debit the balance atomically.
/// Rejects when the cost breaches the per-position cap or the balance.
pub fn open_trade(
    db: &Database,
    signal: &Signal,
    contracts: i64,
    risk: &RiskConfig,
) -> Result<Option<PaperFill>> {
    ensure_seeded(db)?;

    let bal = balance(db)?;
    let cost = signal.suggested_price_cents * contracts;

    let max_position = (bal as f64 * risk.max_position_pct / 100.0) as i64;
    if cost > max_position {
        warn!("Paper trade rejected: cost {}¢ > max position {}¢", cost, max_position);
        return Ok(None);
    }
    if cost > bal {
        warn!("Paper trade rejected: insufficient balance ({}¢ < {}¢)", bal, cost);
        return Ok(None);
    }

    let tx = db
        .conn
        .unchecked_transaction()
        .context("Failed to start paper open transaction")?;
    tx.execute(
        "INSERT INTO paper_trades
         (city, market_type, event_ticker, market_ticker, action, side,
          price_cents, contracts, confidence, edge_pct, reason,
          current_temp_f, forecast_temp_f, surrounding_avg_f, signal_source, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, datetime('now'))",
        rusqlite::params![
            signal.city,
            signal.market_type.to_string(),
            signal.event_ticker,
            signal.market_ticker,
            signal.action.to_string(),
            signal.side.to_string(),
            signal.suggested_price_cents,
            contracts,
            signal.confidence,
            signal.edge_pct,
            signal.reason,
            signal.current_temp_f,
            signal.forecast_temp_f,
            signal.surrounding_avg_f,
            signal.signal_source.to_string(),
        ],
    )
    .context("Failed to insert paper trade")?;

    let new_balance = bal - cost;
    tx.execute(
        "INSERT INTO paper_balance (balance_cents, updated_at) VALUES (?1, datetime('now'))",
        [new_balance],
    )
    .context("Failed to debit paper balance")?;
    tx.commit().context("Failed to commit paper open")?;

    info!(
        "PAPER TRADE: {} {} {} x{} @ {}¢ | Balance: ${:.2} → ${:.2} ({})",
        signal.action,
        signal.side,
        signal.market_ticker,
        contracts,
        signal.suggested_price_cents,
        bal as f64 / 100.0,
        new_balance as f64 / 100.0,
        signal.signal_source,
    );

    Ok(Some(PaperFill {
        ticker: signal.market_ticker.clone(),
        side: signal.side.to_string(),
        price_cents: signal.suggested_price_cents,
        contracts,
        cost_cents: cost,
        balance_after: new_balance,
    }))
}

/// Settle a paper trade at expiry. A winner pays 100¢ per contract.
pub fn settle_trade(db: &Database, trade_id: i64, won: bool) -> Result<()> {
    let (price, contracts): (i64, i64) = db
        .conn
        .query_row(
            "SELECT price_cents, contracts FROM paper_trades WHERE id = ?1",
            [trade_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .context("Paper trade not found for settlement")?;

    let (pnl, result) = if won {
        ((100 - price) * contracts, "win")
    } else {
        (-(price * contracts), "loss")
    };

    let tx = db
        .conn
        .unchecked_transaction()
        .context("Failed to start paper settle transaction")?;
    tx.execute(
        "UPDATE paper_trades
         SET settled = 1, settlement_result = ?1, pnl_cents = ?2, settled_at = datetime('now')
         WHERE id = ?3",
        rusqlite::params![result, pnl, trade_id],
    )
    .context("Failed to settle paper trade")?;

    // Cost was debited at open; a winner credits the full payout.
    if won {
        let bal = balance(db)?;
        tx.execute(
            "INSERT INTO paper_balance (balance_cents, updated_at) VALUES (?1, datetime('now'))",
            [bal + 100 * contracts],
        )
        .context("Failed to credit paper settlement")?;
    }
    tx.commit().context("Failed to commit paper settle")?;

    info!("SETTLED paper trade {}: {} | P&L: {:+}¢", trade_id, result, pnl);
    Ok(())
}

/// Open positions aggregated by ticker, in the exchange's signed format.
pub fn positions(db: &Database) -> Result<Vec<PaperPosition>> {
    let mut stmt = db
        .conn
        .prepare(
            "SELECT market_ticker, side, SUM(contracts), SUM(price_cents * contracts)
             FROM paper_trades
             WHERE settled = 0
             GROUP BY market_ticker, side",
        )
        .context("Failed to prepare paper positions query")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })
        .context("Failed to query paper positions")?;

    let mut by_ticker: std::collections::HashMap<String, PaperPosition> =
        std::collections::HashMap::new();
    for row in rows {
        let (ticker, side, qty, cost) = row.context("Failed to read paper position row")?;
        let entry = by_ticker
            .entry(ticker.clone())
            .or_insert_with(|| PaperPosition {
                ticker,
                position: 0,
                market_exposure: 0,
            });
        if side == "yes" {
            entry.position += qty;
        } else {
            entry.position -= qty;
        }
        entry.market_exposure += cost;
    }

    let mut result: Vec<PaperPosition> = by_ticker.into_values().collect();
    result.sort_by(|a, b| a.ticker.cmp(&b.ticker));
    Ok(result)
}

/// Close a position (or part of one) against an observed YES bid.
///
/// NO closes credit `qty × (100 − yes_bid)`; YES closes credit
/// `qty × yes_bid`. Rows are consumed FIFO; a partially-consumed row is
/// split into a settled portion and a remaining open portion.
pub fn close_position(
    db: &Database,
    ticker: &str,
    side: &str,
    qty: i64,
    yes_bid_cents: i64,
) -> Result<i64> {
    if qty <= 0 {
        return Ok(0);
    }

    let credit = if side == "no" {
        qty * (100 - yes_bid_cents)
    } else {
        qty * yes_bid_cents
    };

    let tx = db
        .conn
        .unchecked_transaction()
        .context("Failed to start paper close transaction")?;

    let open_rows: Vec<(i64, i64, i64)> = {
        let mut stmt = tx
            .prepare(
                "SELECT id, contracts, price_cents FROM paper_trades
                 WHERE market_ticker = ?1 AND side = ?2 AND settled = 0
                 ORDER BY id ASC",
            )
            .context("Failed to prepare paper close query")?;
        let rows = stmt
            .query_map(rusqlite::params![ticker, side], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .context("Failed to query open paper rows")?;
        rows.collect::<std::result::Result<_, _>>()
            .context("Failed to read open paper rows")?
    };

    let mut remaining = qty;
    for (trade_id, contracts, entry_price) in open_rows {
        if remaining <= 0 {
            break;
        }
        let settle_qty = contracts.min(remaining);
        let cost = settle_qty * entry_price;
        let pnl = credit * settle_qty / qty - cost;

        if settle_qty == contracts {
            tx.execute(
                "UPDATE paper_trades
                 SET settled = 1, settlement_result = 'closed', pnl_cents = ?1, settled_at = datetime('now')
                 WHERE id = ?2",
                rusqlite::params![pnl, trade_id],
            )
            .context("Failed to close paper row")?;
        } else {
            // Partial close: shrink the open row, clone the settled portion
            tx.execute(
                "UPDATE paper_trades SET contracts = contracts - ?1 WHERE id = ?2",
                rusqlite::params![settle_qty, trade_id],
            )
            .context("Failed to shrink paper row")?;
            tx.execute(
                "INSERT INTO paper_trades
                 (city, market_type, event_ticker, market_ticker, action, side,
                  price_cents, contracts, confidence, edge_pct, reason,
                  current_temp_f, forecast_temp_f, surrounding_avg_f, signal_source,
                  settled, settlement_result, pnl_cents, created_at, settled_at)
                 SELECT city, market_type, event_ticker, market_ticker, action, side,
                  price_cents, ?1, confidence, edge_pct, reason,
                  current_temp_f, forecast_temp_f, surrounding_avg_f, signal_source,
                  1, 'closed', ?2, created_at, datetime('now')
                 FROM paper_trades WHERE id = ?3",
                rusqlite::params![settle_qty, pnl, trade_id],
            )
            .context("Failed to split paper row")?;
        }
        remaining -= settle_qty;
    }

    let bal = balance(db)?;
    let new_balance = bal + credit;
    tx.execute(
        "INSERT INTO paper_balance (balance_cents, updated_at) VALUES (?1, datetime('now'))",
        [new_balance],
    )
    .context("Failed to credit paper close")?;
    tx.commit().context("Failed to commit paper close")?;

    info!(
        "PAPER CLOSE: {} {} x{} (yes_bid {}¢) | credit={}¢ | Balance: ${:.2} → ${:.2}",
        side,
        ticker,
        qty,
        yes_bid_cents,
        credit,
        bal as f64 / 100.0,
        new_balance as f64 / 100.0,
    );
    Ok(credit)
}

/// Value all open positions against live quotes.
/// Returns (cash, total exposure, priced positions).
pub async fn portfolio_value(
    db: &Database,
    client: &KalshiClient,
) -> Result<(i64, i64, Vec<PricedPosition>)> {
    let cash = balance(db)?;
    let open = positions(db)?;
    let mut total_exposure = 0i64;
    let mut priced = Vec::new();

    for pos in open {
        if pos.position == 0 {
            continue;
        }
        total_exposure += pos.market_exposure;

        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        match client.get_market(&pos.ticker).await {
            Ok(market) => {
                let yes_bid = market.yes_bid.max(0);
                let current_value = if pos.position < 0 {
                    pos.position.abs() * (100 - yes_bid)
                } else {
                    pos.position * yes_bid
                };
                priced.push(PricedPosition {
                    ticker: pos.ticker,
                    position: pos.position,
                    market_exposure: pos.market_exposure,
                    current_value,
                    yes_bid,
                    no_bid: market.no_bid.max(0),
                });
            }
            Err(e) => {
                warn!("Failed to price paper position {}: {}", pos.ticker, e);
                priced.push(PricedPosition {
                    ticker: pos.ticker,
                    position: pos.position,
                    market_exposure: pos.market_exposure,
                    // Fallback: assume no change
                    current_value: pos.market_exposure,
                    yes_bid: 0,
                    no_bid: 0,
                });
            }
        }
    }

    Ok((cash, total_exposure, priced))
}

/// Cash plus the market value of every open position.
pub async fn total_account_value(db: &Database, client: &KalshiClient) -> Result<i64> {
    let (cash, _, priced) = portfolio_value(db, client).await?;
    let market_value: i64 = priced.iter().map(|p| p.current_value).sum();
    Ok(cash + market_value)
}

pub fn summary(db: &Database) -> Result<PaperSummary> {
    ensure_seeded(db)?;
    let balance_cents = balance(db)?;
    let total_trades: i64 = db
        .conn
        .query_row("SELECT COUNT(*) FROM paper_trades", [], |r| r.get(0))
        .context("Failed to count paper trades")?;
    let wins: i64 = db
        .conn
        .query_row(
            "SELECT COUNT(*) FROM paper_trades WHERE settled = 1 AND settlement_result = 'win'",
            [],
            |r| r.get(0),
        )
        .context("Failed to count wins")?;
    let losses: i64 = db
        .conn
        .query_row(
            "SELECT COUNT(*) FROM paper_trades WHERE settled = 1 AND settlement_result = 'loss'",
            [],
            |r| r.get(0),
        )
        .context("Failed to count losses")?;
    let total_pnl_cents: i64 = db
        .conn
        .query_row(
            "SELECT COALESCE(SUM(pnl_cents), 0) FROM paper_trades WHERE settled = 1",
            [],
            |r| r.get(0),
        )
        .context("Failed to sum paper P&L")?;
    let open_trades: i64 = db
        .conn
        .query_row("SELECT COUNT(*) FROM paper_trades WHERE settled = 0", [], |r| {
            r.get(0)
        })
        .context("Failed to count open trades")?;

    Ok(PaperSummary {
        balance_cents,
        total_trades,
        wins,
        losses,
        total_pnl_cents,
        open_trades,
        roi_pct: (balance_cents - PAPER_BANKROLL_START_CENTS) as f64
            / PAPER_BANKROLL_START_CENTS as f64
            * 100.0,
    })
}
