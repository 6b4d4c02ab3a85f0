//! Calibration and backtesting over the recorded prediction log and settled
//! paper trades: per-city accuracy, walk-forward parameter search, and a
//! Monte Carlo bankroll simulation.

use anyhow::{Context, Result};
use rand::Rng;

use crate::cities;
use crate::db::Database;
use crate::paper::PAPER_BANKROLL_START_CENTS;

/// Prediction accuracy for one city, from settled prediction-log rows.
#[derive(Debug, Clone)]
pub struct CityAccuracy {
    pub city: String,
    pub samples: usize,
    /// Mean signed error (estimate − actual): positive = we run hot.
    pub mean_error_f: f64,
    pub mean_abs_error_f: f64,
}

impl CityAccuracy {
    /// Bias correction that would zero the mean signed error.
    pub fn suggested_bias(&self) -> f64 {
        -self.mean_error_f
    }
}

pub fn city_accuracy(db: &Database, city: &str) -> Result<Option<CityAccuracy>> {
    let rows = db.predictions_for_city(city, 500)?;
    let settled: Vec<(f64, f64)> = rows
        .iter()
        .filter_map(|p| p.actual_temp_f.map(|a| (p.estimated_temp_f, a)))
        .collect();
    if settled.is_empty() {
        return Ok(None);
    }

    let n = settled.len() as f64;
    let mean_error = settled.iter().map(|(e, a)| e - a).sum::<f64>() / n;
    let mean_abs_error = settled.iter().map(|(e, a)| (e - a).abs()).sum::<f64>() / n;

    Ok(Some(CityAccuracy {
        city: city.to_string(),
        samples: settled.len(),
        mean_error_f: mean_error,
        mean_abs_error_f: mean_abs_error,
    }))
}

pub fn all_city_accuracy(db: &Database) -> Result<Vec<CityAccuracy>> {
    let mut out = Vec::new();
    for city in cities::all() {
        if let Some(acc) = city_accuracy(db, city.code)? {
            out.push(acc);
        }
    }
    Ok(out)
}

/// A settled trade's inputs for parameter search.
#[derive(Debug, Clone)]
pub struct SettledTrade {
    pub edge_pct: f64,
    pub confidence: f64,
    pub pnl_cents: i64,
}

pub fn settled_paper_trades(db: &Database) -> Result<Vec<SettledTrade>> {
    let mut stmt = db
        .conn
        .prepare(
            "SELECT COALESCE(edge_pct, 0.0), COALESCE(confidence, 0.0), pnl_cents
             FROM paper_trades
             WHERE settled = 1
             ORDER BY id ASC",
        )
        .context("Failed to prepare settled trades query")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(SettledTrade {
                edge_pct: row.get(0)?,
                confidence: row.get(1)?,
                pnl_cents: row.get(2)?,
            })
        })
        .context("Failed to query settled trades")?;
    let mut trades = Vec::new();
    for row in rows {
        trades.push(row.context("Failed to read settled trade")?);
    }
    Ok(trades)
}

/// Outcome of evaluating one candidate edge threshold.
#[derive(Debug, Clone)]
pub struct ParamResult {
    pub min_edge_pct: f64,
    pub trades_taken: usize,
    pub total_pnl_cents: i64,
    pub win_rate_pct: f64,
}

fn evaluate_threshold(trades: &[SettledTrade], min_edge_pct: f64) -> ParamResult {
    let taken: Vec<&SettledTrade> = trades
        .iter()
        .filter(|t| t.edge_pct >= min_edge_pct)
        .collect();
    let wins = taken.iter().filter(|t| t.pnl_cents > 0).count();
    ParamResult {
        min_edge_pct,
        trades_taken: taken.len(),
        total_pnl_cents: taken.iter().map(|t| t.pnl_cents).sum(),
        win_rate_pct: if taken.is_empty() {
            0.0
        } else {
            wins as f64 / taken.len() as f64 * 100.0
        },
    }
}

/// Candidate edge thresholds for the search grid.
pub const EDGE_GRID: &[f64] = &[5.0, 10.0, 15.0, 20.0, 25.0, 30.0, 40.0, 50.0];

/// Walk-forward search: optimize the edge threshold on each training window,
/// evaluate on the following window, sum the out-of-sample results.
///
/// Selecting on all the data at once would overfit to the very trades being
/// scored; out-of-sample aggregation is the honest number.
#[derive(Debug, Clone)]
pub struct WalkForwardResult {
    pub windows: usize,
    pub out_of_sample_pnl_cents: i64,
    pub out_of_sample_trades: usize,
    pub chosen_thresholds: Vec<f64>,
}

pub fn walk_forward(trades: &[SettledTrade], window_size: usize) -> Option<WalkForwardResult> {
    if window_size == 0 || trades.len() < window_size * 2 {
        return None;
    }

    let mut oos_pnl = 0i64;
    let mut oos_trades = 0usize;
    let mut chosen = Vec::new();
    let mut windows = 0usize;

    let mut start = 0usize;
    while start + window_size * 2 <= trades.len() {
        let train = &trades[start..start + window_size];
        let test = &trades[start + window_size..start + window_size * 2];

        let best = EDGE_GRID
            .iter()
            .map(|&edge| evaluate_threshold(train, edge))
            .max_by_key(|r| r.total_pnl_cents)?;

        let applied = evaluate_threshold(test, best.min_edge_pct);
        oos_pnl += applied.total_pnl_cents;
        oos_trades += applied.trades_taken;
        chosen.push(best.min_edge_pct);
        windows += 1;

        start += window_size;
    }

    if windows == 0 {
        return None;
    }
    Some(WalkForwardResult {
        windows,
        out_of_sample_pnl_cents: oos_pnl,
        out_of_sample_trades: oos_trades,
        chosen_thresholds: chosen,
    })
}

/// Monte Carlo bankroll simulation by resampling the empirical per-trade
/// P&L distribution.
#[derive(Debug, Clone)]
pub struct MonteCarloResult {
    pub paths: usize,
    pub trades_per_path: usize,
    pub ruin_probability: f64,
    pub median_final_cents: i64,
    pub p5_final_cents: i64,
    pub p95_final_cents: i64,
}

pub fn monte_carlo(
    pnls: &[i64],
    start_cents: i64,
    trades_per_path: usize,
    paths: usize,
    rng: &mut impl Rng,
) -> Option<MonteCarloResult> {
    if pnls.is_empty() || paths == 0 {
        return None;
    }

    let mut finals = Vec::with_capacity(paths);
    let mut ruined = 0usize;

    for _ in 0..paths {
        let mut bankroll = start_cents;
        let mut hit_zero = false;
        for _ in 0..trades_per_path {
            bankroll += pnls[rng.gen_range(0..pnls.len())];
            if bankroll <= 0 {
                hit_zero = true;
                break;
            }
        }
        if hit_zero {
            ruined += 1;
            finals.push(0);
        } else {
            finals.push(bankroll);
        }
    }

    finals.sort_unstable();
    let pct = |p: f64| -> i64 {
        let idx = ((finals.len() - 1) as f64 * p).round() as usize;
        finals[idx]
    };

    Some(MonteCarloResult {
        paths,
        trades_per_path,
        ruin_probability: ruined as f64 / paths as f64,
        median_final_cents: pct(0.50),
        p5_final_cents: pct(0.05),
        p95_final_cents: pct(0.95),
    })
}

/// Print a calibration report to the operator log.
pub fn report(db: &Database) -> Result<()> {
    use tracing::info;

    info!("=== Calibration report ===");
    for acc in all_city_accuracy(db)? {
        info!(
            "{}: {} samples, bias {:+.1}°F, MAE {:.1}°F (suggested correction {:+.1}°F)",
            acc.city, acc.samples, acc.mean_error_f, acc.mean_abs_error_f, acc.suggested_bias(),
        );
    }

    let trades = settled_paper_trades(db)?;
    info!("{} settled paper trades", trades.len());

    if let Some(wf) = walk_forward(&trades, 20) {
        info!(
            "Walk-forward: {} windows, out-of-sample P&L {}¢ over {} trades (thresholds {:?})",
            wf.windows, wf.out_of_sample_pnl_cents, wf.out_of_sample_trades, wf.chosen_thresholds,
        );
    }

    let pnls: Vec<i64> = trades.iter().map(|t| t.pnl_cents).collect();
    if let Some(mc) = monte_carlo(
        &pnls,
        PAPER_BANKROLL_START_CENTS,
        200,
        2_000,
        &mut rand::thread_rng(),
    ) {
        info!(
            "Monte Carlo ({} paths × {}): ruin {:.1}%, median ${:.2}, p5 ${:.2}, p95 ${:.2}",
            mc.paths,
            mc.trades_per_path,
            mc.ruin_probability * 100.0,
            mc.median_final_cents as f64 / 100.0,
            mc.p5_final_cents as f64 / 100.0,
            mc.p95_final_cents as f64 / 100.0,
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    fn trade(edge: f64, pnl: i64) -> SettledTrade {
        SettledTrade {
            edge_pct: edge,
            confidence: 0.7,
            pnl_cents: pnl,
        }
    }

    #[test]
    fn test_city_accuracy_from_predictions() {
        let db = Database::open_in_memory().unwrap();
        db.insert_prediction("NYC", "high", 44.0, Some(43.0), 41.0, 40.0, 0.7)
            .unwrap();
        db.insert_prediction("NYC", "high", 50.0, Some(49.0), 47.0, 46.0, 0.7)
            .unwrap();
        let today = crate::clock::today_et();
        db.settle_predictions("NYC", "high", &today, 46.0).unwrap();

        let acc = city_accuracy(&db, "NYC").unwrap().unwrap();
        assert_eq!(acc.samples, 2);
        // Errors: 44-46 = -2, 50-46 = +4 → mean +1, MAE 3
        assert!((acc.mean_error_f - 1.0).abs() < 1e-9);
        assert!((acc.mean_abs_error_f - 3.0).abs() < 1e-9);
        assert!((acc.suggested_bias() + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_city_accuracy_requires_settled_rows() {
        let db = Database::open_in_memory().unwrap();
        db.insert_prediction("NYC", "high", 44.0, None, 41.0, 40.0, 0.7)
            .unwrap();
        assert!(city_accuracy(&db, "NYC").unwrap().is_none());
    }

    #[test]
    fn test_evaluate_threshold_filters_by_edge() {
        let trades = vec![trade(10.0, -50), trade(20.0, 100), trade(40.0, 80)];
        let r = evaluate_threshold(&trades, 15.0);
        assert_eq!(r.trades_taken, 2);
        assert_eq!(r.total_pnl_cents, 180);
        assert!((r.win_rate_pct - 100.0).abs() < 1e-9);

        let r = evaluate_threshold(&trades, 5.0);
        assert_eq!(r.trades_taken, 3);
        assert_eq!(r.total_pnl_cents, 130);
    }

    #[test]
    fn test_walk_forward_needs_enough_data() {
        let trades: Vec<SettledTrade> = (0..10).map(|_| trade(20.0, 10)).collect();
        assert!(walk_forward(&trades, 20).is_none());
        assert!(walk_forward(&trades, 0).is_none());
        assert!(walk_forward(&trades, 5).is_some());
    }

    #[test]
    fn test_walk_forward_out_of_sample_sum() {
        // 20 trades, window 5 → 3 rolling train/test splits
        // High-edge trades profit, low-edge trades lose; the search should
        // learn to filter the losers out-of-sample.
        let mut trades = Vec::new();
        for _ in 0..10 {
            trades.push(trade(10.0, -100));
            trades.push(trade(30.0, 150));
        }
        let wf = walk_forward(&trades, 5).unwrap();
        assert_eq!(wf.windows, 3);
        assert!(wf.out_of_sample_pnl_cents > 0);
        // Every chosen threshold filters out the 10%-edge losers
        assert!(wf.chosen_thresholds.iter().all(|&t| t > 10.0));
    }

    #[test]
    fn test_monte_carlo_all_winners_never_ruins() {
        let pnls = vec![50i64, 100, 75];
        let mc = monte_carlo(&pnls, 10_000, 100, 500, &mut StepRng::new(0, 77)).unwrap();
        assert_eq!(mc.ruin_probability, 0.0);
        assert!(mc.median_final_cents > 10_000);
        assert!(mc.p5_final_cents <= mc.median_final_cents);
        assert!(mc.median_final_cents <= mc.p95_final_cents);
    }

    #[test]
    fn test_monte_carlo_certain_ruin() {
        let pnls = vec![-5_000i64];
        let mc = monte_carlo(&pnls, 10_000, 10, 100, &mut StepRng::new(0, 1)).unwrap();
        assert_eq!(mc.ruin_probability, 1.0);
        assert_eq!(mc.median_final_cents, 0);
    }

    #[test]
    fn test_monte_carlo_empty_inputs() {
        assert!(monte_carlo(&[], 10_000, 10, 100, &mut StepRng::new(0, 1)).is_none());
        assert!(monte_carlo(&[10], 10_000, 10, 0, &mut StepRng::new(0, 1)).is_none());
    }

    #[test]
    fn test_settled_paper_trades_reads_only_settled() {
        let db = Database::open_in_memory().unwrap();
        db.conn
            .execute(
                "INSERT INTO paper_trades (city, market_type, event_ticker, market_ticker, action, side, price_cents, contracts, edge_pct, confidence, settled, pnl_cents, created_at)
                 VALUES ('NYC', 'high', 'E', 'T1', 'buy', 'no', 70, 3, 50.0, 0.8, 1, 90, datetime('now'))",
                [],
            )
            .unwrap();
        db.conn
            .execute(
                "INSERT INTO paper_trades (city, market_type, event_ticker, market_ticker, action, side, price_cents, contracts, edge_pct, confidence, settled, pnl_cents, created_at)
                 VALUES ('NYC', 'high', 'E', 'T2', 'buy', 'no', 70, 3, 50.0, 0.8, 0, 0, datetime('now'))",
                [],
            )
            .unwrap();

        let trades = settled_paper_trades(&db).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].pnl_cents, 90);
    }
}
