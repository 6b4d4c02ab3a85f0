use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;

/// A single station observation snapshot.
#[derive(Debug, Clone)]
pub struct Observation {
    pub station: String,
    pub city: String,
    pub is_primary: bool,
    pub temp_f: Option<f64>,
    pub humidity: Option<f64>,
    pub wind_mph: Option<f64>,
    pub wind_dir: Option<i64>,
    pub pressure_mb: Option<f64>,
    pub cloud_cover: Option<String>,
    pub obs_time: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ObservationRow {
    pub station: String,
    pub city: String,
    pub is_primary: bool,
    pub temp_f: Option<f64>,
    pub humidity: Option<f64>,
    pub wind_mph: Option<f64>,
    pub wind_dir: Option<i64>,
    pub pressure_mb: Option<f64>,
    pub cloud_cover: Option<String>,
    pub obs_time: Option<String>,
    pub collected_at: String,
}

/// Latest forecast highs/lows merged across recent rows for a city.
#[derive(Debug, Clone)]
pub struct ForecastSummary {
    pub city: String,
    pub forecast_high_f: Option<f64>,
    pub forecast_low_f: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub order_id: String,
    pub ticker: String,
    pub event_ticker: String,
    pub city: String,
    pub market_type: String,
    pub side: String,
    pub contracts: i64,
    pub entry_price_cents: i64,
    pub estimated_temp_f: f64,
    pub forecast_temp_f: f64,
    pub primary_temp_f: f64,
    pub surrounding_avg_f: f64,
    pub confidence: f64,
    pub edge_pct: f64,
    pub floor_strike: Option<f64>,
    pub cap_strike: Option<f64>,
    pub our_probability: f64,
    pub market_probability: f64,
    pub signal_source: String,
}

#[derive(Debug, Clone)]
pub struct JournalRow {
    pub id: i64,
    pub ticker: String,
    pub side: String,
    pub contracts: i64,
    pub entry_price_cents: i64,
    pub signal_source: String,
    pub settled: bool,
    pub settlement_result: Option<String>,
    pub pnl_cents: i64,
}

#[derive(Debug, Clone)]
pub struct PredictionRow {
    pub id: i64,
    pub city: String,
    pub market_type: String,
    pub estimated_temp_f: f64,
    pub forecast_temp_f: Option<f64>,
    pub confidence: f64,
    pub actual_temp_f: Option<f64>,
    pub error_f: Option<f64>,
    pub created_at: String,
}

/// Per-signal-source outcome statistics.
#[derive(Debug, Clone)]
pub struct SourceStats {
    pub source: String,
    pub total_trades: i64,
    pub win_rate_pct: f64,
    pub avg_pnl_cents: f64,
    pub total_pnl_cents: i64,
}

pub struct Database {
    pub conn: Connection,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        // Create parent directories if needed
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }

        let conn =
            Connection::open(path).with_context(|| format!("Failed to open database: {}", path))?;

        let db = Database { conn };
        db.run_migrations()?;
        db.enable_wal()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let db = Database { conn };
        db.run_migrations()?;
        Ok(db)
    }

    fn enable_wal(&self) -> Result<()> {
        self.conn
            .pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL mode")?;
        Ok(())
    }

    // ── Observations ──────────────────────────────────────────────────

    pub fn insert_observation(&self, obs: &Observation) -> Result<()> {
        self.conn.execute(
            "INSERT INTO observations (station, city, is_primary, temp_f, humidity, wind_mph, wind_dir, pressure_mb, cloud_cover, obs_time, collected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, datetime('now'))",
            rusqlite::params![
                obs.station,
                obs.city,
                obs.is_primary,
                obs.temp_f,
                obs.humidity,
                obs.wind_mph,
                obs.wind_dir,
                obs.pressure_mb,
                obs.cloud_cover,
                obs.obs_time,
            ],
        ).context("Failed to insert observation")?;
        Ok(())
    }

    /// Latest observation per station for a city, primary first.
    pub fn latest_observations(&self, city: &str) -> Result<Vec<ObservationRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT station, city, is_primary, temp_f, humidity, wind_mph, wind_dir, pressure_mb, cloud_cover, obs_time, collected_at
             FROM observations
             WHERE city = ?1 AND id IN (
                 SELECT MAX(id) FROM observations WHERE city = ?1 GROUP BY station
             )
             ORDER BY is_primary DESC, station",
        ).context("Failed to prepare latest observations query")?;
        let rows = stmt
            .query_map([city], |row| {
                Ok(ObservationRow {
                    station: row.get(0)?,
                    city: row.get(1)?,
                    is_primary: row.get(2)?,
                    temp_f: row.get(3)?,
                    humidity: row.get(4)?,
                    wind_mph: row.get(5)?,
                    wind_dir: row.get(6)?,
                    pressure_mb: row.get(7)?,
                    cloud_cover: row.get(8)?,
                    obs_time: row.get(9)?,
                    collected_at: row.get(10)?,
                })
            })
            .context("Failed to query latest observations")?;
        let mut observations = Vec::new();
        for row in rows {
            observations.push(row.context("Failed to read observation row")?);
        }
        Ok(observations)
    }

    // ── Forecasts ─────────────────────────────────────────────────────

    pub fn insert_forecast(
        &self,
        city: &str,
        forecast_date: &str,
        forecast_high_f: Option<f64>,
        forecast_low_f: Option<f64>,
        period_name: Option<&str>,
        short_forecast: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO forecasts (city, forecast_date, forecast_high_f, forecast_low_f, period_name, short_forecast, collected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))",
            rusqlite::params![city, forecast_date, forecast_high_f, forecast_low_f, period_name, short_forecast],
        ).context("Failed to insert forecast")?;
        Ok(())
    }

    /// Latest high/low for a city, merged from the most recent rows.
    /// With `target_date`, only that date's forecast rows are considered.
    pub fn latest_forecast(
        &self,
        city: &str,
        target_date: Option<&str>,
    ) -> Result<Option<ForecastSummary>> {
        let sql = if target_date.is_some() {
            "SELECT forecast_high_f, forecast_low_f FROM forecasts
             WHERE city = ?1 AND forecast_date = ?2
             ORDER BY collected_at DESC LIMIT 4"
        } else {
            "SELECT forecast_high_f, forecast_low_f FROM forecasts
             WHERE city = ?1
             ORDER BY collected_at DESC LIMIT 4"
        };
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare latest forecast query")?;

        let mapper = |row: &rusqlite::Row<'_>| {
            Ok((
                row.get::<_, Option<f64>>(0)?,
                row.get::<_, Option<f64>>(1)?,
            ))
        };
        let rows: Vec<(Option<f64>, Option<f64>)> = if let Some(date) = target_date {
            stmt.query_map(rusqlite::params![city, date], mapper)
                .context("Failed to query forecasts")?
                .collect::<std::result::Result<_, _>>()
                .context("Failed to read forecast rows")?
        } else {
            stmt.query_map([city], mapper)
                .context("Failed to query forecasts")?
                .collect::<std::result::Result<_, _>>()
                .context("Failed to read forecast rows")?
        };

        if rows.is_empty() {
            return Ok(None);
        }

        let mut high = None;
        let mut low = None;
        for (h, l) in rows {
            if high.is_none() {
                high = h;
            }
            if low.is_none() {
                low = l;
            }
        }

        Ok(Some(ForecastSummary {
            city: city.to_string(),
            forecast_high_f: high,
            forecast_low_f: low,
        }))
    }

    // ── Prediction log ────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn insert_prediction(
        &self,
        city: &str,
        market_type: &str,
        estimated_temp_f: f64,
        forecast_temp_f: Option<f64>,
        primary_temp_f: f64,
        surrounding_avg_f: f64,
        confidence: f64,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO prediction_log (city, market_type, estimated_temp_f, forecast_temp_f, primary_temp_f, surrounding_avg_f, confidence, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now'))",
            rusqlite::params![city, market_type, estimated_temp_f, forecast_temp_f, primary_temp_f, surrounding_avg_f, confidence],
        ).context("Failed to insert prediction")?;
        Ok(())
    }

    /// Backfill the settled actual for every open prediction of a
    /// (city, market_type) created on a given ET day.
    pub fn settle_predictions(
        &self,
        city: &str,
        market_type: &str,
        date_et: &str,
        actual_temp_f: f64,
    ) -> Result<usize> {
        let n = self.conn.execute(
            "UPDATE prediction_log
             SET actual_temp_f = ?1,
                 error_f = ABS(estimated_temp_f - ?1),
                 settled_at = datetime('now')
             WHERE city = ?2 AND market_type = ?3 AND actual_temp_f IS NULL
               AND date(created_at, '-5 hours') = ?4",
            rusqlite::params![actual_temp_f, city, market_type, date_et],
        ).context("Failed to settle predictions")?;
        Ok(n)
    }

    pub fn predictions_for_city(&self, city: &str, limit: i64) -> Result<Vec<PredictionRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, city, market_type, estimated_temp_f, forecast_temp_f, confidence, actual_temp_f, error_f, created_at
             FROM prediction_log
             WHERE city = ?1
             ORDER BY id DESC
             LIMIT ?2",
        ).context("Failed to prepare predictions query")?;
        let rows = stmt
            .query_map(rusqlite::params![city, limit], |row| {
                Ok(PredictionRow {
                    id: row.get(0)?,
                    city: row.get(1)?,
                    market_type: row.get(2)?,
                    estimated_temp_f: row.get(3)?,
                    forecast_temp_f: row.get(4)?,
                    confidence: row.get(5)?,
                    actual_temp_f: row.get(6)?,
                    error_f: row.get(7)?,
                    created_at: row.get(8)?,
                })
            })
            .context("Failed to query predictions")?;
        let mut predictions = Vec::new();
        for row in rows {
            predictions.push(row.context("Failed to read prediction row")?);
        }
        Ok(predictions)
    }

    // ── Trade journal (live) ──────────────────────────────────────────

    pub fn journal_trade(&self, entry: &JournalEntry) -> Result<()> {
        self.conn.execute(
            "INSERT INTO trade_journal
             (order_id, ticker, event_ticker, city, market_type, side, contracts,
              entry_price_cents, estimated_temp_f, forecast_temp_f, primary_temp_f,
              surrounding_avg_f, confidence, edge_pct, floor_strike, cap_strike,
              our_probability, market_probability, signal_source, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, datetime('now'))",
            rusqlite::params![
                entry.order_id,
                entry.ticker,
                entry.event_ticker,
                entry.city,
                entry.market_type,
                entry.side,
                entry.contracts,
                entry.entry_price_cents,
                entry.estimated_temp_f,
                entry.forecast_temp_f,
                entry.primary_temp_f,
                entry.surrounding_avg_f,
                entry.confidence,
                entry.edge_pct,
                entry.floor_strike,
                entry.cap_strike,
                entry.our_probability,
                entry.market_probability,
                entry.signal_source,
            ],
        ).context("Failed to journal trade")?;
        Ok(())
    }

    pub fn unsettled_journal(&self) -> Result<Vec<JournalRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, ticker, side, contracts, entry_price_cents, signal_source, settled, settlement_result, pnl_cents
             FROM trade_journal WHERE settled = 0",
        ).context("Failed to prepare unsettled journal query")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(JournalRow {
                    id: row.get(0)?,
                    ticker: row.get(1)?,
                    side: row.get(2)?,
                    contracts: row.get(3)?,
                    entry_price_cents: row.get(4)?,
                    signal_source: row.get(5)?,
                    settled: row.get(6)?,
                    settlement_result: row.get(7)?,
                    pnl_cents: row.get(8)?,
                })
            })
            .context("Failed to query unsettled journal")?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.context("Failed to read journal row")?);
        }
        Ok(entries)
    }

    pub fn settle_journal_row(
        &self,
        id: i64,
        result: &str,
        pnl_cents: i64,
        fees_cents: i64,
        actual_temp_f: Option<f64>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE trade_journal
                 SET settled = 1, settlement_result = ?1, pnl_cents = ?2, fees_cents = ?3,
                     actual_temp_f = ?4, settled_at = datetime('now')
                 WHERE id = ?5",
                rusqlite::params![result, pnl_cents, fees_cents, actual_temp_f, id],
            )
            .context("Failed to settle journal row")?;
        Ok(())
    }

    /// Count of journaled trades created on a given ET day.
    pub fn journal_count_for_day(&self, date_et: &str) -> Result<i64> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM trade_journal WHERE date(created_at, '-5 hours') = ?1",
                [date_et],
                |row| row.get(0),
            )
            .context("Failed to count journal trades for day")?;
        Ok(count)
    }

    pub fn journal_wins_for_day(&self, date_et: &str) -> Result<i64> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM trade_journal
                 WHERE settled = 1 AND pnl_cents > 0 AND date(created_at, '-5 hours') = ?1",
                [date_et],
                |row| row.get(0),
            )
            .context("Failed to count journal wins for day")?;
        Ok(count)
    }

    /// Win rate and P&L per signal source, over settled journal rows.
    pub fn source_stats(&self) -> Result<Vec<SourceStats>> {
        let mut stats = Vec::new();
        for source in ["model", "metar_lockin"] {
            let row = self
                .conn
                .query_row(
                    "SELECT COUNT(*),
                            COALESCE(AVG(CASE WHEN pnl_cents > 0 THEN 1.0 ELSE 0.0 END), 0.0),
                            COALESCE(AVG(pnl_cents), 0.0),
                            COALESCE(SUM(pnl_cents), 0)
                     FROM trade_journal
                     WHERE signal_source = ?1 AND settled = 1",
                    [source],
                    |row| {
                        Ok(SourceStats {
                            source: source.to_string(),
                            total_trades: row.get(0)?,
                            win_rate_pct: row.get::<_, f64>(1)? * 100.0,
                            avg_pnl_cents: row.get(2)?,
                            total_pnl_cents: row.get(3)?,
                        })
                    },
                )
                .context("Failed to query source stats")?;
            stats.push(row);
        }
        Ok(stats)
    }

    // ── Settled-market cache ──────────────────────────────────────────

    pub fn cache_settlement(&self, ticker: &str, result: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO settled_markets (ticker, result, cached_at)
                 VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(ticker) DO UPDATE SET result = excluded.result, cached_at = excluded.cached_at",
                rusqlite::params![ticker, result],
            )
            .context("Failed to cache settlement")?;
        Ok(())
    }

    pub fn cached_settlement(&self, ticker: &str) -> Result<Option<String>> {
        let result = self
            .conn
            .query_row(
                "SELECT result FROM settled_markets WHERE ticker = ?1",
                [ticker],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("Failed to read cached settlement")?;
        Ok(result)
    }

    // ── Orderbook snapshots ───────────────────────────────────────────

    pub fn insert_orderbook_snapshot(
        &self,
        ticker: &str,
        yes_bid: i64,
        yes_ask: i64,
        no_bid: i64,
        no_ask: i64,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO orderbook_snapshots (ticker, yes_bid, yes_ask, no_bid, no_ask, captured_at)
             VALUES (?1, ?2, ?3, ?4, ?5, datetime('now'))",
            rusqlite::params![ticker, yes_bid, yes_ask, no_bid, no_ask],
        ).context("Failed to insert orderbook snapshot")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS observations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                station TEXT NOT NULL,
                city TEXT NOT NULL,
                is_primary INTEGER NOT NULL DEFAULT 0,
                temp_f REAL,
                humidity REAL,
                wind_mph REAL,
                wind_dir INTEGER,
                pressure_mb REAL,
                cloud_cover TEXT,
                obs_time TEXT,
                collected_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS forecasts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                city TEXT NOT NULL,
                forecast_date TEXT NOT NULL,
                forecast_high_f REAL,
                forecast_low_f REAL,
                period_name TEXT,
                short_forecast TEXT,
                collected_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS metar_daily_extremes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                station TEXT NOT NULL,
                date_et TEXT NOT NULL,
                running_high_f REAL,
                running_low_f REAL,
                last_updated TEXT NOT NULL,
                observation_count INTEGER NOT NULL DEFAULT 0,
                UNIQUE(station, date_et)
            );

            CREATE TABLE IF NOT EXISTS prediction_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                city TEXT NOT NULL,
                market_type TEXT NOT NULL,
                estimated_temp_f REAL NOT NULL,
                forecast_temp_f REAL,
                primary_temp_f REAL,
                surrounding_avg_f REAL,
                confidence REAL NOT NULL,
                actual_temp_f REAL,
                error_f REAL,
                settled_at TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS trade_journal (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id TEXT,
                ticker TEXT NOT NULL,
                event_ticker TEXT NOT NULL,
                city TEXT NOT NULL,
                market_type TEXT NOT NULL,
                side TEXT NOT NULL,
                contracts INTEGER NOT NULL,
                entry_price_cents INTEGER NOT NULL,
                estimated_temp_f REAL,
                forecast_temp_f REAL,
                primary_temp_f REAL,
                surrounding_avg_f REAL,
                confidence REAL,
                edge_pct REAL,
                floor_strike REAL,
                cap_strike REAL,
                our_probability REAL,
                market_probability REAL,
                signal_source TEXT NOT NULL DEFAULT 'model',
                settled INTEGER NOT NULL DEFAULT 0,
                settlement_result TEXT,
                pnl_cents INTEGER NOT NULL DEFAULT 0,
                fees_cents INTEGER NOT NULL DEFAULT 0,
                actual_temp_f REAL,
                created_at TEXT NOT NULL,
                settled_at TEXT
            );

            CREATE TABLE IF NOT EXISTS paper_trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                city TEXT NOT NULL,
                market_type TEXT NOT NULL,
                event_ticker TEXT NOT NULL,
                market_ticker TEXT NOT NULL,
                action TEXT NOT NULL,
                side TEXT NOT NULL,
                price_cents INTEGER NOT NULL,
                contracts INTEGER NOT NULL,
                confidence REAL,
                edge_pct REAL,
                reason TEXT,
                current_temp_f REAL,
                forecast_temp_f REAL,
                surrounding_avg_f REAL,
                signal_source TEXT NOT NULL DEFAULT 'model',
                settled INTEGER NOT NULL DEFAULT 0,
                settlement_result TEXT,
                pnl_cents INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                settled_at TEXT
            );

            CREATE TABLE IF NOT EXISTS paper_balance (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                balance_cents INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS settled_markets (
                ticker TEXT PRIMARY KEY,
                result TEXT NOT NULL,
                cached_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS orderbook_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticker TEXT NOT NULL,
                yes_bid INTEGER,
                yes_ask INTEGER,
                no_bid INTEGER,
                no_ask INTEGER,
                captured_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_obs_station_time ON observations(station, collected_at);
            CREATE INDEX IF NOT EXISTS idx_obs_city_time ON observations(city, collected_at);
            CREATE INDEX IF NOT EXISTS idx_metar_station_date ON metar_daily_extremes(station, date_et);
            ",
            )
            .context("Failed to run database migrations")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(station: &str, city: &str, is_primary: bool, temp_f: f64) -> Observation {
        Observation {
            station: station.to_string(),
            city: city.to_string(),
            is_primary,
            temp_f: Some(temp_f),
            humidity: Some(50.0),
            wind_mph: Some(5.0),
            wind_dir: Some(270),
            pressure_mb: Some(1013.0),
            cloud_cover: Some("CLR".to_string()),
            obs_time: Some("2026-02-18T15:00:00Z".to_string()),
        }
    }

    #[test]
    fn test_open_in_memory_creates_tables() {
        let db = Database::open_in_memory().unwrap();
        let tables: Vec<String> = db
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        for table in [
            "observations",
            "forecasts",
            "metar_daily_extremes",
            "prediction_log",
            "trade_journal",
            "paper_trades",
            "paper_balance",
            "settled_markets",
            "orderbook_snapshots",
        ] {
            assert!(tables.contains(&table.to_string()), "missing table {}", table);
        }
    }

    #[test]
    fn test_migrations_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().unwrap();
    }

    #[test]
    fn test_latest_observations_one_per_station() {
        let db = Database::open_in_memory().unwrap();
        db.insert_observation(&obs("KNYC", "NYC", true, 40.0)).unwrap();
        db.insert_observation(&obs("KLGA", "NYC", false, 41.0)).unwrap();
        // Newer reading for the primary station supersedes the first
        db.insert_observation(&obs("KNYC", "NYC", true, 42.0)).unwrap();

        let latest = db.latest_observations("NYC").unwrap();
        assert_eq!(latest.len(), 2);
        // Primary first
        assert_eq!(latest[0].station, "KNYC");
        assert_eq!(latest[0].temp_f, Some(42.0));
        assert_eq!(latest[1].station, "KLGA");
    }

    #[test]
    fn test_latest_observations_filters_city() {
        let db = Database::open_in_memory().unwrap();
        db.insert_observation(&obs("KNYC", "NYC", true, 40.0)).unwrap();
        db.insert_observation(&obs("KMIA", "MIA", true, 80.0)).unwrap();

        let latest = db.latest_observations("MIA").unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].station, "KMIA");
    }

    #[test]
    fn test_latest_forecast_merges_high_low() {
        let db = Database::open_in_memory().unwrap();
        db.insert_forecast("NYC", "2026-02-18", Some(45.0), None, Some("Today"), Some("Sunny"))
            .unwrap();
        db.insert_forecast("NYC", "2026-02-18", None, Some(31.0), Some("Tonight"), Some("Clear"))
            .unwrap();

        let fc = db.latest_forecast("NYC", None).unwrap().unwrap();
        assert_eq!(fc.forecast_high_f, Some(45.0));
        assert_eq!(fc.forecast_low_f, Some(31.0));
    }

    #[test]
    fn test_latest_forecast_by_date() {
        let db = Database::open_in_memory().unwrap();
        db.insert_forecast("NYC", "2026-02-18", Some(45.0), Some(31.0), None, None)
            .unwrap();
        db.insert_forecast("NYC", "2026-02-19", Some(50.0), Some(35.0), None, None)
            .unwrap();

        let fc = db.latest_forecast("NYC", Some("2026-02-19")).unwrap().unwrap();
        assert_eq!(fc.forecast_high_f, Some(50.0));

        let missing = db.latest_forecast("NYC", Some("2026-03-01")).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_prediction_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        db.insert_prediction("NYC", "high", 44.0, Some(43.0), 41.0, 40.5, 0.7)
            .unwrap();

        let preds = db.predictions_for_city("NYC", 10).unwrap();
        assert_eq!(preds.len(), 1);
        assert!(preds[0].actual_temp_f.is_none());

        let today = crate::clock::today_et();
        let n = db.settle_predictions("NYC", "high", &today, 46.0).unwrap();
        assert_eq!(n, 1);

        let preds = db.predictions_for_city("NYC", 10).unwrap();
        assert_eq!(preds[0].actual_temp_f, Some(46.0));
        assert!((preds[0].error_f.unwrap() - 2.0).abs() < 1e-9);
    }

    fn journal_entry(ticker: &str, side: &str) -> JournalEntry {
        JournalEntry {
            order_id: "ord-1".to_string(),
            ticker: ticker.to_string(),
            event_ticker: "KXHIGHNY-26FEB18".to_string(),
            city: "NYC".to_string(),
            market_type: "high".to_string(),
            side: side.to_string(),
            contracts: 5,
            entry_price_cents: 80,
            estimated_temp_f: 44.0,
            forecast_temp_f: 43.0,
            primary_temp_f: 41.0,
            surrounding_avg_f: 40.5,
            confidence: 0.7,
            edge_pct: 30.0,
            floor_strike: Some(48.0),
            cap_strike: Some(49.0),
            our_probability: 0.2,
            market_probability: 0.2,
            signal_source: "model".to_string(),
        }
    }

    #[test]
    fn test_journal_settlement() {
        let db = Database::open_in_memory().unwrap();
        db.journal_trade(&journal_entry("KXHIGHNY-26FEB18-B48.5", "no"))
            .unwrap();

        let unsettled = db.unsettled_journal().unwrap();
        assert_eq!(unsettled.len(), 1);
        let id = unsettled[0].id;

        db.settle_journal_row(id, "win", 100, 7, Some(44.0)).unwrap();
        assert!(db.unsettled_journal().unwrap().is_empty());

        let today = crate::clock::today_et();
        assert_eq!(db.journal_count_for_day(&today).unwrap(), 1);
        assert_eq!(db.journal_wins_for_day(&today).unwrap(), 1);
    }

    #[test]
    fn test_source_stats() {
        let db = Database::open_in_memory().unwrap();
        db.journal_trade(&journal_entry("T1", "no")).unwrap();
        db.journal_trade(&journal_entry("T2", "no")).unwrap();
        let rows = db.unsettled_journal().unwrap();
        db.settle_journal_row(rows[0].id, "win", 100, 0, None).unwrap();
        db.settle_journal_row(rows[1].id, "loss", -80, 0, None).unwrap();

        let stats = db.source_stats().unwrap();
        let model = stats.iter().find(|s| s.source == "model").unwrap();
        assert_eq!(model.total_trades, 2);
        assert!((model.win_rate_pct - 50.0).abs() < 1e-9);
        assert_eq!(model.total_pnl_cents, 20);

        let lockin = stats.iter().find(|s| s.source == "metar_lockin").unwrap();
        assert_eq!(lockin.total_trades, 0);
    }

    #[test]
    fn test_settlement_cache() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.cached_settlement("T1").unwrap().is_none());

        db.cache_settlement("T1", "yes").unwrap();
        assert_eq!(db.cached_settlement("T1").unwrap().unwrap(), "yes");

        // Upsert overwrites
        db.cache_settlement("T1", "no").unwrap();
        assert_eq!(db.cached_settlement("T1").unwrap().unwrap(), "no");
    }

    #[test]
    fn test_orderbook_snapshot() {
        let db = Database::open_in_memory().unwrap();
        db.insert_orderbook_snapshot("KXHIGHNY-26FEB18-B48.5", 20, 25, 75, 80)
            .unwrap();
        let count: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM orderbook_snapshots", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
