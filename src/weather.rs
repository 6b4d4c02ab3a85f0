//! Weather data providers: NWS station observations and point forecasts,
//! Open-Meteo daily forecasts, and the multi-source consensus validator.
//!
//! All provider calls are bounded by a 10 s client timeout and retried at
//! most once; a failed station is skipped for the cycle, never fatal.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cities::{self, City};
use crate::clock;
use crate::config::Config;
use crate::db::{Database, Observation};

const USER_AGENT: &str = "weather-agent/1.0";
const CONSENSUS_TTL_SECS: u64 = 600;

fn c_to_f(temp_c: f64) -> f64 {
    ((temp_c * 9.0 / 5.0 + 32.0) * 10.0).round() / 10.0
}

/// One NWS forecast period (half-day granularity).
#[derive(Debug, Clone)]
pub struct ForecastPeriod {
    pub period_name: String,
    pub temperature_f: f64,
    pub is_daytime: bool,
    pub short_forecast: String,
    pub start_date: String,
}

/// Tomorrow's high/low from one provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderForecast {
    pub high: Option<f64>,
    pub low: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusConfidence {
    High,
    Medium,
    Low,
    VeryLow,
    NoData,
}

/// Median forecast across providers with an agreement grade.
#[derive(Debug, Clone, Copy)]
pub struct ConsensusForecast {
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub high_confidence: ConsensusConfidence,
    pub low_confidence: ConsensusConfidence,
    pub high_sources: usize,
    pub low_sources: usize,
}

pub struct WeatherClient {
    client: Client,
    nws_base: String,
    open_meteo_base: String,
    max_retries: u32,
    consensus_cache: Mutex<HashMap<String, (Instant, ConsensusForecast)>>,
}

impl WeatherClient {
    pub fn new() -> Result<Self> {
        Self::with_base_urls(
            "https://api.weather.gov".to_string(),
            "https://api.open-meteo.com".to_string(),
        )
    }

    pub fn with_base_urls(nws_base: String, open_meteo_base: String) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build weather HTTP client")?;
        Ok(WeatherClient {
            client,
            nws_base: nws_base.trim_end_matches('/').to_string(),
            open_meteo_base: open_meteo_base.trim_end_matches('/').to_string(),
            max_retries: 1,
            consensus_cache: Mutex::new(HashMap::new()),
        })
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(2000)).await;
            }
            match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp.json().await.context("Failed to parse weather response");
                }
                Ok(resp) => {
                    warn!("Weather request {} returned {}", url, resp.status());
                    last_err = Some(anyhow::anyhow!("HTTP {}", resp.status()));
                }
                Err(e) => {
                    warn!("Weather request failed (attempt {}) {}: {}", attempt + 1, url, e);
                    last_err = Some(e.into());
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("weather request failed")))
    }

    // ── NWS observations ──────────────────────────────────────────────

    /// Latest observation for a station. None when the station has no
    /// temperature value (common for stale METARs).
    pub async fn get_observation(&self, station: &str) -> Result<Option<Observation>> {
        let url = format!("{}/stations/{}/observations/latest", self.nws_base, station);
        let data = self.get_json(&url).await?;

        let props = &data["properties"];
        let temp_c = match props["temperature"]["value"].as_f64() {
            Some(t) => t,
            None => {
                debug!("No temp data for station {}", station);
                return Ok(None);
            }
        };

        let wind_kmh = props["windSpeed"]["value"].as_f64();
        let pressure_pa = props["barometricPressure"]["value"].as_f64();
        let cloud_cover = props["cloudLayers"][0]["amount"]
            .as_str()
            .map(|s| s.to_string());

        Ok(Some(Observation {
            station: station.to_string(),
            city: String::new(),
            is_primary: false,
            temp_f: Some(c_to_f(temp_c)),
            humidity: props["relativeHumidity"]["value"].as_f64(),
            wind_mph: wind_kmh.map(|k| (k * 0.621371 * 10.0).round() / 10.0),
            wind_dir: props["windDirection"]["value"].as_f64().map(|d| d as i64),
            pressure_mb: pressure_pa.map(|p| (p / 100.0 * 10.0).round() / 10.0),
            cloud_cover,
            obs_time: props["timestamp"].as_str().map(|s| s.to_string()),
        }))
    }

    /// Current temperature only, for the supervisor's dead-position checks.
    pub async fn latest_station_temp(&self, station: &str) -> Option<f64> {
        match self.get_observation(station).await {
            Ok(Some(obs)) => obs.temp_f,
            _ => None,
        }
    }

    // ── NWS point forecast ────────────────────────────────────────────

    /// Two-step point forecast: resolve the gridpoint, then fetch periods.
    pub async fn get_point_forecast(&self, lat: f64, lon: f64) -> Result<Vec<ForecastPeriod>> {
        let point_url = format!("{}/points/{},{}", self.nws_base, lat, lon);
        let point_data = self.get_json(&point_url).await?;

        let forecast_url = point_data["properties"]["forecast"]
            .as_str()
            .context("No forecast URL for point")?
            .to_string();

        let forecast_data = self.get_json(&forecast_url).await?;
        let periods = forecast_data["properties"]["periods"]
            .as_array()
            .context("No forecast periods")?;

        let mut results = Vec::new();
        for p in periods.iter().take(8) {
            let temperature = match p["temperature"].as_f64() {
                Some(t) => t,
                None => continue,
            };
            results.push(ForecastPeriod {
                period_name: p["name"].as_str().unwrap_or("").to_string(),
                temperature_f: temperature,
                is_daytime: p["isDaytime"].as_bool().unwrap_or(false),
                short_forecast: p["shortForecast"].as_str().unwrap_or("").to_string(),
                start_date: p["startTime"]
                    .as_str()
                    .map(|s| s.chars().take(10).collect())
                    .unwrap_or_default(),
            });
        }
        Ok(results)
    }

    /// NWS high/low for tomorrow (ET), from the period list.
    async fn nws_tomorrow(&self, city: &City) -> ProviderForecast {
        let tomorrow = clock::tomorrow_et();
        let periods = match self.get_point_forecast(city.lat, city.lon).await {
            Ok(p) => p,
            Err(e) => {
                warn!("NWS forecast unavailable for {}: {}", city.code, e);
                return ProviderForecast::default();
            }
        };

        let mut fc = ProviderForecast::default();
        for p in periods {
            if p.start_date == tomorrow {
                if p.is_daytime {
                    fc.high = Some(p.temperature_f);
                } else {
                    fc.low = Some(p.temperature_f);
                }
            }
        }
        fc
    }

    // ── Open-Meteo ────────────────────────────────────────────────────

    /// Open-Meteo daily forecast; index 1 is tomorrow.
    pub async fn open_meteo_tomorrow(&self, lat: f64, lon: f64) -> ProviderForecast {
        let url = format!(
            "{}/v1/forecast?latitude={}&longitude={}&daily=temperature_2m_max,temperature_2m_min&temperature_unit=fahrenheit&timezone=America/New_York&forecast_days=2",
            self.open_meteo_base, lat, lon,
        );
        let data = match self.get_json(&url).await {
            Ok(d) => d,
            Err(e) => {
                warn!("Open-Meteo unavailable: {}", e);
                return ProviderForecast::default();
            }
        };

        let maxes = data["daily"]["temperature_2m_max"].as_array();
        let mins = data["daily"]["temperature_2m_min"].as_array();
        let pick = |arr: Option<&Vec<Value>>| -> Option<f64> {
            let arr = arr?;
            let idx = if arr.len() > 1 { 1 } else { 0 };
            arr.get(idx)?.as_f64().map(|v| (v * 10.0).round() / 10.0)
        };

        ProviderForecast {
            high: pick(maxes),
            low: pick(mins),
        }
    }

    // ── Multi-source consensus ────────────────────────────────────────

    /// Median across providers for tomorrow, cached for 10 minutes so one
    /// cycle never refetches a city.
    pub async fn consensus_forecast(&self, city_code: &str) -> Option<ConsensusForecast> {
        {
            let cache = self.consensus_cache.lock().await;
            if let Some((at, cached)) = cache.get(city_code) {
                if at.elapsed() < Duration::from_secs(CONSENSUS_TTL_SECS) {
                    return Some(*cached);
                }
            }
        }

        let city = cities::get(city_code)?;
        let nws = self.nws_tomorrow(city).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let om = self.open_meteo_tomorrow(city.lat, city.lon).await;

        let (high, high_confidence, high_sources) =
            consensus_of(&[nws.high, om.high]);
        let (low, low_confidence, low_sources) = consensus_of(&[nws.low, om.low]);

        let result = ConsensusForecast {
            high,
            low,
            high_confidence,
            low_confidence,
            high_sources,
            low_sources,
        };

        let mut cache = self.consensus_cache.lock().await;
        cache.insert(city_code.to_string(), (Instant::now(), result));
        Some(result)
    }
}

/// Median of available sources plus an agreement grade.
fn consensus_of(values: &[Option<f64>]) -> (Option<f64>, ConsensusConfidence, usize) {
    let mut present: Vec<f64> = values.iter().filter_map(|v| *v).collect();
    if present.is_empty() {
        return (None, ConsensusConfidence::NoData, 0);
    }
    present.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = present.len();
    let median = if n % 2 == 1 {
        present[n / 2]
    } else {
        (present[n / 2 - 1] + present[n / 2]) / 2.0
    };

    let max_div = present
        .iter()
        .map(|v| (v - median).abs())
        .fold(0.0_f64, f64::max);

    let confidence = if n >= 3 && max_div <= 2.0 {
        ConsensusConfidence::High
    } else if n >= 2 && max_div <= 3.0 {
        ConsensusConfidence::Medium
    } else if n >= 2 && max_div <= 5.0 {
        ConsensusConfidence::Low
    } else {
        ConsensusConfidence::VeryLow
    };

    (Some((median * 10.0).round() / 10.0), confidence, n)
}

// ── Collector ─────────────────────────────────────────────────────────

/// One snapshot per configured station plus forecast periods, persisted.
/// Failed stations are skipped; returns the number of stored observations.
pub async fn collect_all(db: &Database, client: &WeatherClient, config: &Config) -> usize {
    info!("Starting collection cycle");
    let mut total = 0usize;

    for city in cities::all() {
        if !config.city_enabled(city.code) {
            continue;
        }
        total += collect_city(db, client, city).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    info!("Collection complete: {} observations stored", total);
    total
}

async fn collect_city(db: &Database, client: &WeatherClient, city: &City) -> usize {
    let mut collected = 0usize;

    // Primary station
    match client.get_observation(city.primary).await {
        Ok(Some(mut obs)) => {
            obs.city = city.code.to_string();
            obs.is_primary = true;
            if let Err(e) = db.insert_observation(&obs) {
                warn!("Failed to store observation for {}: {}", city.primary, e);
            } else {
                collected += 1;
                info!(
                    "  {} [PRIMARY] {}: {:.1}°F",
                    city.code,
                    city.primary,
                    obs.temp_f.unwrap_or(f64::NAN),
                );
            }
        }
        Ok(None) => warn!("  {} [PRIMARY] {}: NO DATA", city.code, city.primary),
        Err(e) => warn!("  {} [PRIMARY] {}: {}", city.code, city.primary, e),
    }

    // Surrounding stations
    for station in city.surrounding {
        match client.get_observation(station).await {
            Ok(Some(mut obs)) => {
                obs.city = city.code.to_string();
                obs.is_primary = false;
                if db.insert_observation(&obs).is_ok() {
                    collected += 1;
                    debug!(
                        "  {} [SURR]    {}: {:.1}°F",
                        city.code,
                        station,
                        obs.temp_f.unwrap_or(f64::NAN),
                    );
                }
            }
            Ok(None) => debug!("  {} [SURR]    {}: no data", city.code, station),
            Err(e) => debug!("  {} [SURR]    {}: {}", city.code, station, e),
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    // Forecast periods for today and tomorrow
    match client.get_point_forecast(city.lat, city.lon).await {
        Ok(periods) => {
            let n = periods.len().min(4);
            for p in periods.into_iter().take(4) {
                let (high, low) = if p.is_daytime {
                    (Some(p.temperature_f), None)
                } else {
                    (None, Some(p.temperature_f))
                };
                if let Err(e) = db.insert_forecast(
                    city.code,
                    &p.start_date,
                    high,
                    low,
                    Some(&p.period_name),
                    Some(&p.short_forecast),
                ) {
                    warn!("Failed to store forecast for {}: {}", city.code, e);
                }
            }
            info!("  {} forecast: {} periods collected", city.code, n);
        }
        Err(e) => warn!("  {} forecast unavailable: {}", city.code, e),
    }

    collected
}
