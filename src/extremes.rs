//! Running daily high/low per settlement station, keyed by ET calendar day.
//!
//! Single writer: only the updater mutates these rows. A new ET day gets a
//! fresh row; prior days are never touched. Within a day the running high is
//! monotonically non-decreasing and the running low non-increasing.

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cities;
use crate::clock;
use crate::config::Config;
use crate::db::Database;
use crate::weather::WeatherClient;

#[derive(Debug, Clone)]
pub struct DailyExtremes {
    pub station: String,
    pub date_et: String,
    pub running_high_f: Option<f64>,
    pub running_low_f: Option<f64>,
    pub last_updated: Option<String>,
    pub observation_count: i64,
}

/// Current running extremes for a station on today's ET date. Zero-count
/// default when no observations have landed yet.
pub fn daily_extremes(db: &Database, station: &str) -> Result<DailyExtremes> {
    daily_extremes_for(db, station, &clock::today_et())
}

pub fn daily_extremes_for(db: &Database, station: &str, date_et: &str) -> Result<DailyExtremes> {
    let row = db
        .conn
        .query_row(
            "SELECT running_high_f, running_low_f, last_updated, observation_count
             FROM metar_daily_extremes
             WHERE station = ?1 AND date_et = ?2",
            rusqlite::params![station, date_et],
            |row| {
                Ok(DailyExtremes {
                    station: station.to_string(),
                    date_et: date_et.to_string(),
                    running_high_f: row.get(0)?,
                    running_low_f: row.get(1)?,
                    last_updated: row.get(2)?,
                    observation_count: row.get(3)?,
                })
            },
        )
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(DailyExtremes {
                station: station.to_string(),
                date_et: date_et.to_string(),
                running_high_f: None,
                running_low_f: None,
                last_updated: None,
                observation_count: 0,
            }),
            other => Err(other),
        })
        .context("Failed to read daily extremes")?;
    Ok(row)
}

/// Fold a new temperature into the station's running extremes for a day.
pub fn record_temp(
    db: &Database,
    station: &str,
    date_et: &str,
    temp_f: f64,
) -> Result<DailyExtremes> {
    let existing = daily_extremes_for(db, station, date_et)?;

    if existing.observation_count > 0 {
        let new_high = existing
            .running_high_f
            .map_or(temp_f, |h| h.max(temp_f));
        let new_low = existing.running_low_f.map_or(temp_f, |l| l.min(temp_f));
        db.conn
            .execute(
                "UPDATE metar_daily_extremes
                 SET running_high_f = ?1, running_low_f = ?2,
                     last_updated = datetime('now'), observation_count = observation_count + 1
                 WHERE station = ?3 AND date_et = ?4",
                rusqlite::params![new_high, new_low, station, date_et],
            )
            .context("Failed to update daily extremes")?;
        info!(
            "Updated {}: {:.1}°F (high: {:.1}°F, low: {:.1}°F, count: {})",
            station,
            temp_f,
            new_high,
            new_low,
            existing.observation_count + 1,
        );
    } else {
        db.conn
            .execute(
                "INSERT INTO metar_daily_extremes
                 (station, date_et, running_high_f, running_low_f, last_updated, observation_count)
                 VALUES (?1, ?2, ?3, ?3, datetime('now'), 1)",
                rusqlite::params![station, date_et, temp_f],
            )
            .context("Failed to insert daily extremes")?;
        info!("New record for {}: {:.1}°F (first observation)", station, temp_f);
    }

    daily_extremes_for(db, station, date_et)
}

/// Fetch the latest temperature for each settlement station and fold it in.
/// Returns the number of stations updated successfully.
pub async fn update_all_stations(
    db: &Database,
    client: &WeatherClient,
    config: &Config,
) -> usize {
    let today = clock::today_et();
    let mut success = 0usize;

    for city in cities::all() {
        if !config.city_enabled(city.code) {
            continue;
        }
        match client.latest_station_temp(city.primary).await {
            Some(temp_f) => match record_temp(db, city.primary, &today, temp_f) {
                Ok(_) => success += 1,
                Err(e) => warn!("Failed to record extreme for {}: {}", city.primary, e),
            },
            None => warn!("No METAR data for {} ({})", city.code, city.primary),
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }

    info!("METAR update complete: {} stations updated", success);
    success
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_observation_seeds_both_extremes() {
        let db = Database::open_in_memory().unwrap();
        let ext = record_temp(&db, "KNYC", "2026-02-18", 40.0).unwrap();
        assert_eq!(ext.running_high_f, Some(40.0));
        assert_eq!(ext.running_low_f, Some(40.0));
        assert_eq!(ext.observation_count, 1);
    }

    #[test]
    fn test_high_monotone_non_decreasing() {
        let db = Database::open_in_memory().unwrap();
        record_temp(&db, "KNYC", "2026-02-18", 40.0).unwrap();
        record_temp(&db, "KNYC", "2026-02-18", 45.0).unwrap();
        let ext = record_temp(&db, "KNYC", "2026-02-18", 42.0).unwrap();
        assert_eq!(ext.running_high_f, Some(45.0));
        assert_eq!(ext.running_low_f, Some(40.0));
        assert_eq!(ext.observation_count, 3);
    }

    #[test]
    fn test_low_monotone_non_increasing() {
        let db = Database::open_in_memory().unwrap();
        record_temp(&db, "KNYC", "2026-02-18", 40.0).unwrap();
        record_temp(&db, "KNYC", "2026-02-18", 35.0).unwrap();
        let ext = record_temp(&db, "KNYC", "2026-02-18", 38.0).unwrap();
        assert_eq!(ext.running_low_f, Some(35.0));
        assert_eq!(ext.running_high_f, Some(40.0));
    }

    #[test]
    fn test_new_day_gets_fresh_row() {
        let db = Database::open_in_memory().unwrap();
        record_temp(&db, "KNYC", "2026-02-18", 45.0).unwrap();
        let ext = record_temp(&db, "KNYC", "2026-02-19", 30.0).unwrap();
        // New day starts from scratch
        assert_eq!(ext.running_high_f, Some(30.0));
        assert_eq!(ext.running_low_f, Some(30.0));
        assert_eq!(ext.observation_count, 1);

        // Prior day untouched
        let prior = daily_extremes_for(&db, "KNYC", "2026-02-18").unwrap();
        assert_eq!(prior.running_high_f, Some(45.0));
        assert_eq!(prior.observation_count, 1);
    }

    #[test]
    fn test_missing_station_defaults_to_empty() {
        let db = Database::open_in_memory().unwrap();
        let ext = daily_extremes_for(&db, "KBOS", "2026-02-18").unwrap();
        assert!(ext.running_high_f.is_none());
        assert!(ext.running_low_f.is_none());
        assert_eq!(ext.observation_count, 0);
    }

    #[test]
    fn test_stations_independent() {
        let db = Database::open_in_memory().unwrap();
        record_temp(&db, "KNYC", "2026-02-18", 40.0).unwrap();
        record_temp(&db, "KMIA", "2026-02-18", 80.0).unwrap();

        let nyc = daily_extremes_for(&db, "KNYC", "2026-02-18").unwrap();
        let mia = daily_extremes_for(&db, "KMIA", "2026-02-18").unwrap();
        assert_eq!(nyc.running_high_f, Some(40.0));
        assert_eq!(mia.running_high_f, Some(80.0));
    }
}
