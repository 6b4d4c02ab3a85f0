//! Lock-in signals from observed daily extremes.
//!
//! After the lock window opens (high after 18 ET, low after 08 ET) the daily
//! extreme is final: brackets the temperature can no longer reach are sold
//! NO, and brackets the locked extreme already satisfies are bought YES.

use tracing::{info, warn};

use crate::cities;
use crate::clock;
use crate::config::Config;
use crate::db::Database;
use crate::extremes;
use crate::kalshi::{Action, KalshiClient, Market, Side};
use crate::signals::{MarketType, Signal, SignalSource, Strike};

/// How far past the running extreme a strike must sit before a bracket is
/// treated as impossible. 1°F covers the METAR C/F rounding ambiguity.
pub const LOCKIN_SAFETY_BUFFER_F: f64 = 1.0;

pub fn is_high_locked(et_hour: u32) -> bool {
    et_hour >= 18
}

pub fn is_low_locked(et_hour: u32) -> bool {
    et_hour >= 8
}

fn lockin_signal(
    city: &str,
    market_type: MarketType,
    event_ticker: &str,
    market: &Market,
    side: Side,
    price_cents: i64,
    edge_pct: f64,
    our_probability: f64,
    running_extreme: f64,
    reason: String,
    strike: Strike,
) -> Signal {
    Signal {
        city: city.to_string(),
        market_type,
        event_ticker: event_ticker.to_string(),
        market_ticker: market.ticker.clone(),
        action: Action::Buy,
        side,
        suggested_price_cents: price_cents,
        confidence: 0.95,
        edge_pct,
        reason,
        current_temp_f: running_extreme,
        forecast_temp_f: running_extreme,
        surrounding_avg_f: running_extreme,
        market_yes_price_cents: if side == Side::No {
            market.yes_bid
        } else {
            market.yes_ask
        },
        is_tomorrow: false,
        margin_f: 0.0,
        signal_source: SignalSource::MetarLockin,
        strike: Some(strike),
        our_probability,
    }
}

/// A bracket the locked extreme can no longer reach: bet against it.
pub fn check_impossible(
    market: &Market,
    city: &str,
    market_type: MarketType,
    event_ticker: &str,
    running_extreme: f64,
    min_edge_pct: f64,
) -> Option<Signal> {
    let strike = Strike::from_market(market)?;

    let yes_bid = market.yes_bid.max(0);
    let yes_ask = if market.yes_ask > 0 { market.yes_ask } else { 100 };
    if yes_bid == 0 && yes_ask == 100 {
        return None;
    }

    let (impossible, desc) = match market_type {
        MarketType::High => {
            // The high can't climb any more: any strike whose floor sits
            // above the locked ceiling is out of reach.
            let locked_ceiling = running_extreme + LOCKIN_SAFETY_BUFFER_F;
            match strike {
                Strike::GreaterThan { floor } | Strike::Bracket { floor, .. }
                    if floor > locked_ceiling =>
                {
                    (
                        true,
                        format!(
                            "floor {:.0}°F impossible (high locked at {:.1}°F + {:.0}°F buffer)",
                            floor, running_extreme, LOCKIN_SAFETY_BUFFER_F,
                        ),
                    )
                }
                _ => (false, String::new()),
            }
        }
        MarketType::Low => {
            // The low can't drop any more: any strike whose cap sits below
            // the locked floor is out of reach.
            let locked_floor = running_extreme - LOCKIN_SAFETY_BUFFER_F;
            match strike {
                Strike::LessThan { cap } | Strike::Bracket { cap, .. } if cap < locked_floor => (
                    true,
                    format!(
                        "cap {:.0}°F impossible (low locked at {:.1}°F - {:.0}°F buffer)",
                        cap, running_extreme, LOCKIN_SAFETY_BUFFER_F,
                    ),
                ),
                _ => (false, String::new()),
            }
        }
    };

    if !impossible {
        return None;
    }

    // Cheap YES quotes make for terrible NO risk/reward
    if yes_bid < 10 {
        info!("  SKIP lock-in {}: YES@{}¢ too low", market.ticker, yes_bid);
        return None;
    }

    let our_price_cents = 1i64;
    let edge = ((yes_bid - our_price_cents) as f64 / yes_bid as f64) * 100.0;
    if edge < min_edge_pct {
        return None;
    }

    Some(lockin_signal(
        city,
        market_type,
        event_ticker,
        market,
        Side::No,
        100 - yes_bid,
        edge,
        0.01,
        running_extreme,
        format!("METAR_LOCKIN: {}", desc),
        strike,
    ))
}

/// A bracket the locked extreme already satisfies with buffer on both sides:
/// bet for it.
pub fn check_confirmed(
    market: &Market,
    city: &str,
    market_type: MarketType,
    event_ticker: &str,
    running_extreme: f64,
) -> Option<Signal> {
    let strike = Strike::from_market(market)?;

    let yes_bid = market.yes_bid.max(0);
    let yes_ask = if market.yes_ask > 0 { market.yes_ask } else { 100 };
    // No edge left at 99¢
    if yes_ask >= 99 {
        return None;
    }
    if yes_bid == 0 && yes_ask == 100 {
        return None;
    }

    let buffer = LOCKIN_SAFETY_BUFFER_F;
    let (confirmed, desc) = match strike {
        Strike::LessThan { cap } if running_extreme < cap - buffer => (
            true,
            format!(
                "<{:.0}°F CONFIRMED ({} locked at {:.1}°F, {:.1}°F margin)",
                cap,
                market_type,
                running_extreme,
                cap - running_extreme,
            ),
        ),
        Strike::GreaterThan { floor } if running_extreme > floor + buffer => (
            true,
            format!(
                ">{:.0}°F CONFIRMED ({} locked at {:.1}°F, {:.1}°F margin)",
                floor,
                market_type,
                running_extreme,
                running_extreme - floor,
            ),
        ),
        Strike::Bracket { floor, cap }
            if floor + buffer < running_extreme && running_extreme < cap - buffer =>
        {
            (
                true,
                format!(
                    "[{:.0}-{:.0}]°F CONFIRMED ({} locked at {:.1}°F)",
                    floor, cap, market_type, running_extreme,
                ),
            )
        }
        _ => (false, String::new()),
    };

    if !confirmed {
        return None;
    }

    let our_price_cents = 99i64;
    let edge = if yes_ask > 0 {
        ((our_price_cents - yes_ask) as f64 / yes_ask as f64) * 100.0
    } else {
        0.0
    };
    if edge < 1.0 {
        return None;
    }

    info!(
        "  CONFIRMED: {} YES@{}¢ (edge: {:.1}%) — {}",
        market.ticker, yes_ask, edge, desc,
    );

    Some(lockin_signal(
        city,
        market_type,
        event_ticker,
        market,
        Side::Yes,
        yes_ask,
        edge,
        0.99,
        running_extreme,
        format!("METAR_LOCKIN: {}", desc),
        strike,
    ))
}

/// Scan today's markets for impossible and confirmed brackets. Active only
/// inside the lock windows; the extremes tracker must be updated first.
pub async fn generate_lockin_signals(
    db: &Database,
    client: &KalshiClient,
    config: &Config,
    et_hour: u32,
) -> Vec<Signal> {
    let high_locked = is_high_locked(et_hour);
    let low_locked = is_low_locked(et_hour);

    if !high_locked && !low_locked {
        info!(
            "No lock-in window active (ET hour: {}). High locks at 18, low at 8.",
            et_hour,
        );
        return Vec::new();
    }

    info!(
        "Lock-in check: HIGH={}, LOW={} (ET hour: {})",
        if high_locked { "LOCKED" } else { "open" },
        if low_locked { "LOCKED" } else { "open" },
        et_hour,
    );

    let mut signals = Vec::new();
    let min_edge = config.risk.min_edge_pct;
    let date_str = clock::kalshi_date_today();

    for city in cities::all() {
        if !config.city_enabled(city.code) {
            continue;
        }

        let ext = match extremes::daily_extremes(db, city.primary) {
            Ok(e) if e.observation_count > 0 => e,
            _ => {
                info!("No METAR data for {}, skipping", city.code);
                continue;
            }
        };

        let mut passes: Vec<(MarketType, f64, &str)> = Vec::new();
        if high_locked {
            if let (Some(rh), Some(series)) = (ext.running_high_f, city.kalshi_high) {
                passes.push((MarketType::High, rh, series));
            }
        }
        if low_locked {
            if let (Some(rl), Some(series)) = (ext.running_low_f, city.kalshi_low) {
                passes.push((MarketType::Low, rl, series));
            }
        }

        for (market_type, running, series) in passes {
            let event_ticker = format!("{}-{}", series, date_str);
            let markets = match client.get_event_markets(&event_ticker).await {
                Ok(m) => m,
                Err(e) => {
                    warn!("Failed to get markets for {}: {}", event_ticker, e);
                    continue;
                }
            };

            for market in &markets {
                if let Some(sig) = check_impossible(
                    market,
                    city.code,
                    market_type,
                    &event_ticker,
                    running,
                    min_edge,
                ) {
                    signals.push(sig);
                }
                if let Some(sig) =
                    check_confirmed(market, city.code, market_type, &event_ticker, running)
                {
                    signals.push(sig);
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        }
    }

    signals.sort_by(|a, b| {
        b.edge_pct
            .partial_cmp(&a.edge_pct)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    info!("Generated {} lock-in signals", signals.len());
    for s in &signals {
        info!("  {}", s);
    }
    signals
}
