//! Temperature estimation engine.
//!
//! Fuses the latest station observations, NWS forecast, running observed
//! extremes, and (for tomorrow) the multi-source consensus into a
//! `(estimated_temp, confidence)` pair per (city, day, high|low). The
//! standard deviation is derived at consumption time from the confidence and
//! a per-city floor.

use anyhow::Result;
use tracing::{info, warn};

use crate::cities::{self, City};
use crate::db::Database;
use crate::extremes;
use crate::weather::ConsensusForecast;

/// The estimator's full output for one city/date.
#[derive(Debug, Clone)]
pub struct TempEstimate {
    pub city: String,
    pub primary_temp: f64,
    pub surrounding_avg: f64,
    pub forecast_high: Option<f64>,
    pub forecast_low: Option<f64>,
    pub estimated_high: Option<f64>,
    pub estimated_low: Option<f64>,
    pub high_confidence: f64,
    pub low_confidence: f64,
    pub running_high: Option<f64>,
    pub running_low: Option<f64>,
    pub is_tomorrow: bool,
}

/// σ for pricing: tighter with confidence, floored per city.
pub fn sigma_for(city_code: &str, confidence: f64) -> f64 {
    let base = 4.0 - confidence * 2.0;
    cities::sigma_floor(city_code).max(base)
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Estimate the final high/low for a city.
///
/// `target_date`: None for today; Some(YYYY-MM-DD) for tomorrow (running-temp
/// rules are skipped and the consensus, when available, becomes the base).
/// `et_hour` is passed in so the time-of-day rules are testable.
pub fn estimate(
    db: &Database,
    city: &City,
    target_date: Option<&str>,
    consensus: Option<ConsensusForecast>,
    et_hour: u32,
) -> Result<Option<TempEstimate>> {
    let is_tomorrow = target_date.is_some();

    let obs = db.latest_observations(city.code)?;
    if obs.is_empty() {
        warn!("No observations for {}", city.code);
        return Ok(None);
    }

    let primary_temp = match obs.iter().find(|o| o.is_primary).and_then(|o| o.temp_f) {
        Some(t) => t,
        None => {
            warn!("No primary temp for {}", city.code);
            return Ok(None);
        }
    };

    let surr_temps: Vec<f64> = obs
        .iter()
        .filter(|o| !o.is_primary)
        .filter_map(|o| o.temp_f)
        .collect();
    let surrounding_avg = if surr_temps.is_empty() {
        primary_temp
    } else {
        round1(surr_temps.iter().sum::<f64>() / surr_temps.len() as f64)
    };

    let primary_obs = obs.iter().find(|o| o.is_primary);
    let wind_mph = primary_obs.and_then(|o| o.wind_mph).unwrap_or(0.0);
    let cloud_cover = primary_obs
        .and_then(|o| o.cloud_cover.clone())
        .unwrap_or_default();

    let forecast = db.latest_forecast(city.code, target_date)?;
    let forecast_high = forecast.as_ref().and_then(|f| f.forecast_high_f);
    let forecast_low = forecast.as_ref().and_then(|f| f.forecast_low_f);

    let running = extremes::daily_extremes(db, city.primary)?;
    let running_high = running.running_high_f;
    let running_low = running.running_low_f;
    if let Some(h) = running_high {
        info!("{} running high: {:.1}°F", city.code, h);
    }
    if let Some(l) = running_low {
        info!("{} running low: {:.1}°F", city.code, l);
    }

    // ── High ──────────────────────────────────────────────────────────
    let mut estimated_high = None;
    let mut high_confidence: f64 = 0.5;

    if let Some(fc_high) = forecast_high {
        let consensus_high = if is_tomorrow {
            consensus.and_then(|c| c.high.map(|h| (h, c.high_confidence)))
        } else {
            None
        };

        let mut est = match consensus_high {
            Some((h, _)) => {
                info!("Using multi-source consensus for {} high: {:.1}°F", city.code, h);
                h
            }
            None => fc_high,
        };

        if is_tomorrow {
            high_confidence = match consensus_high {
                Some((_, crate::weather::ConsensusConfidence::High)) => 0.5,
                _ => 0.4,
            };
        } else {
            // Running high is the floor: the day can only get hotter.
            if let Some(rh) = running_high {
                if rh > est {
                    warn!(
                        "{} running high {:.1}°F exceeds forecast {:.1}°F — using running high as floor",
                        city.code, rh, est,
                    );
                    est = rh;
                    high_confidence += 0.15;
                }
                // ±1°F C/F rounding ambiguity in 5-minute METAR data
                est = est.max(rh + 1.0);
            }

            // Current temp already near or above the estimate
            if primary_temp > est - 2.0 {
                est += (primary_temp - est + 2.0) * 0.7;
                high_confidence += 0.1;
            }

            // Surrounding stations warmer: warm air incoming
            if surrounding_avg > primary_temp + 1.5 {
                est += (surrounding_avg - primary_temp) * 0.5;
                high_confidence += 0.05;
            }
            // Surrounding stations cooler: cold air incoming
            if surrounding_avg < primary_temp - 1.5 {
                est -= (primary_temp - surrounding_avg) * 0.3;
                high_confidence += 0.05;
            }
        }

        let bias = cities::high_bias(city.code);
        if bias != 0.0 {
            est += bias;
            info!("{} high bias: adjusted {:+.1}°F to {:.1}°F", city.code, bias, est);
        }

        if !is_tomorrow {
            if (12..=16).contains(&et_hour) {
                high_confidence += 0.2;
            } else if (10..=18).contains(&et_hour) {
                high_confidence += 0.1;
            }
        }

        estimated_high = Some(round1(est));
    }

    // ── Low ───────────────────────────────────────────────────────────
    let mut estimated_low = None;
    let mut low_confidence: f64 = 0.5;

    if let Some(fc_low) = forecast_low {
        let consensus_low = if is_tomorrow {
            consensus.and_then(|c| c.low.map(|l| (l, c.low_confidence)))
        } else {
            None
        };

        let mut est = match consensus_low {
            Some((l, _)) => {
                info!("Using multi-source consensus for {} low: {:.1}°F", city.code, l);
                l
            }
            None => fc_low,
        };

        if is_tomorrow {
            low_confidence = match consensus_low {
                Some((_, crate::weather::ConsensusConfidence::High)) => 0.5,
                _ => 0.4,
            };
        } else if let Some(rl) = running_low {
            // Running low is the ceiling: the day can only get colder.
            if rl < est {
                warn!(
                    "{} running low {:.1}°F below forecast low {:.1}°F — using running low as ceiling",
                    city.code, rl, est,
                );
                est = rl;
                low_confidence += 0.15;
            }
            est = est.min(rl - 1.0);
        } else {
            // Clear sky + calm: radiative cooling undershoots the forecast
            if matches!(cloud_cover.as_str(), "CLR" | "FEW" | "SKC") && wind_mph < 8.0 {
                est -= 1.5;
                low_confidence += 0.1;
            }
            // Cloud deck + wind: insulation keeps the low warmer
            if matches!(cloud_cover.as_str(), "OVC" | "BKN") && wind_mph > 10.0 {
                est += 1.5;
                low_confidence += 0.1;
            }
            // Evening: the current reading anchors the overnight low
            if et_hour >= 20 || et_hour <= 4 {
                est = est.min(primary_temp);
                low_confidence += 0.15;
            }
        }

        let bias = cities::low_bias(city.code);
        if bias != 0.0 {
            est += bias;
            info!("{} low bias: adjusted {:+.1}°F to {:.1}°F", city.code, bias, est);
        }

        estimated_low = Some(round1(est));
    }

    Ok(Some(TempEstimate {
        city: city.code.to_string(),
        primary_temp,
        surrounding_avg,
        forecast_high,
        forecast_low,
        estimated_high,
        estimated_low,
        high_confidence: high_confidence.min(0.95),
        low_confidence: low_confidence.min(0.95),
        running_high,
        running_low,
        is_tomorrow,
    }))
}
