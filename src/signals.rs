//! Signal generation: prices each market bracket against the temperature
//! estimate via a Gaussian model and emits typed trading signals.

use statrs::distribution::{ContinuousCDF, Normal};
use tracing::{info, warn};

use crate::cities;
use crate::clock;
use crate::config::Config;
use crate::db::Database;
use crate::estimator::{self, TempEstimate};
use crate::kalshi::{Action, KalshiClient, Market, Side};
use crate::weather::WeatherClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketType {
    High,
    Low,
}

impl std::fmt::Display for MarketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarketType::High => write!(f, "high"),
            MarketType::Low => write!(f, "low"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalSource {
    Model,
    MetarLockin,
}

impl std::fmt::Display for SignalSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalSource::Model => write!(f, "model"),
            SignalSource::MetarLockin => write!(f, "metar_lockin"),
        }
    }
}

/// Contract payoff condition. Cap strikes are inclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Strike {
    Bracket { floor: f64, cap: f64 },
    GreaterThan { floor: f64 },
    LessThan { cap: f64 },
}

impl Strike {
    /// Prefer the API's explicit strikes; fall back to ticker parsing.
    pub fn from_market(market: &Market) -> Option<Strike> {
        match (market.floor_strike, market.cap_strike) {
            (Some(floor), Some(cap)) => Some(Strike::Bracket { floor, cap }),
            (Some(floor), None) => Some(Strike::GreaterThan { floor }),
            (None, Some(cap)) => Some(Strike::LessThan { cap }),
            (None, None) => parse_strike_from_ticker(&market.ticker),
        }
    }

    /// Synthetic [low, high] bounds used for margin-of-safety distances.
    pub fn bounds(&self) -> (f64, f64) {
        match *self {
            Strike::Bracket { floor, cap } => (floor, cap),
            Strike::GreaterThan { floor } => (floor, floor + 10.0),
            Strike::LessThan { cap } => (cap - 10.0, cap),
        }
    }
}

/// Parse the strike from a ticker's trailing segment: "B40.5" is a 2°F
/// bracket centered on the value, "T43" a threshold (widened for margin
/// purposes, since direction is not encoded in the ticker).
pub fn parse_strike_from_ticker(ticker: &str) -> Option<Strike> {
    let last = ticker.rsplit('-').next()?;
    let re = regex::Regex::new(r"^([BTbt]?)([0-9]+(?:\.[0-9]+)?)$").ok()?;
    let caps = re.captures(last)?;
    let value: f64 = caps.get(2)?.as_str().parse().ok()?;

    match caps.get(1).map(|m| m.as_str().to_uppercase()) {
        Some(ref kind) if kind == "B" => Some(Strike::Bracket {
            floor: (value - 0.5).floor(),
            cap: (value + 0.5).floor(),
        }),
        _ => Some(Strike::Bracket {
            floor: value,
            cap: value + 4.0,
        }),
    }
}

/// A trading signal, transient per cycle.
#[derive(Debug, Clone)]
pub struct Signal {
    pub city: String,
    pub market_type: MarketType,
    pub event_ticker: String,
    pub market_ticker: String,
    pub action: Action,
    pub side: Side,
    pub suggested_price_cents: i64,
    pub confidence: f64,
    pub edge_pct: f64,
    pub reason: String,
    pub current_temp_f: f64,
    pub forecast_temp_f: f64,
    pub surrounding_avg_f: f64,
    pub market_yes_price_cents: i64,
    pub is_tomorrow: bool,
    pub margin_f: f64,
    pub signal_source: SignalSource,
    pub strike: Option<Strike>,
    pub our_probability: f64,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{:.0}% conf] {} {}: {} {} {} @ {}¢ (edge: {:.1}%) — {}",
            self.confidence * 100.0,
            self.city,
            self.market_type,
            self.action,
            self.side,
            self.market_ticker,
            self.suggested_price_cents,
            self.edge_pct,
            self.reason,
        )
    }
}

fn norm_cdf(z: f64) -> f64 {
    let normal = Normal::new(0.0, 1.0).expect("unit normal");
    normal.cdf(z)
}

/// P(settle YES) for a strike under N(mu, sigma), clamped to [0.01, 0.99].
pub fn strike_probability(strike: &Strike, mu: f64, sigma: f64) -> f64 {
    let p = match *strike {
        Strike::Bracket { floor, cap } => {
            // Cap is inclusive: the bracket covers [floor, cap + 1)
            let z_low = (floor - mu) / sigma;
            let z_high = (cap + 1.0 - mu) / sigma;
            norm_cdf(z_high) - norm_cdf(z_low)
        }
        Strike::GreaterThan { floor } => 1.0 - norm_cdf((floor - mu) / sigma),
        Strike::LessThan { cap } => norm_cdf((cap - mu) / sigma),
    };
    p.clamp(0.01, 0.99)
}

/// Inputs to the base path for one (city, date, type).
#[derive(Debug, Clone)]
pub struct AnalysisContext<'a> {
    pub city: &'a str,
    pub market_type: MarketType,
    pub event_ticker: &'a str,
    pub estimated_temp: f64,
    pub confidence: f64,
    pub estimate: &'a TempEstimate,
    pub is_tomorrow: bool,
    pub min_edge_pct: f64,
    pub min_entry_price: i64,
}

/// Base path: price every market in the event against the estimate.
pub fn analyze_brackets(markets: &[Market], ctx: &AnalysisContext<'_>) -> Vec<Signal> {
    let mut signals = Vec::new();
    let sigma = estimator::sigma_for(ctx.city, ctx.confidence);

    for market in markets {
        let strike = match Strike::from_market(market) {
            Some(s) => s,
            None => continue,
        };

        let yes_bid = market.yes_bid.max(0);
        let yes_ask = if market.yes_ask > 0 { market.yes_ask } else { 100 };

        // Illiquid: nothing quoted on either side
        if yes_bid == 0 && yes_ask == 100 {
            continue;
        }
        // 1¢ longshot brackets have negative expectancy
        if yes_ask < ctx.min_entry_price {
            continue;
        }

        let our_prob = strike_probability(&strike, ctx.estimated_temp, sigma);
        let our_price_cents = (our_prob * 100.0).round() as i64;
        let (bracket_low, bracket_high) = strike.bounds();

        // Market undervalues the bracket: buy YES at the ask
        if our_price_cents > yes_ask && yes_ask > 0 {
            let edge = ((our_price_cents - yes_ask) as f64 / yes_ask as f64) * 100.0;
            if edge >= ctx.min_edge_pct {
                signals.push(Signal {
                    city: ctx.city.to_string(),
                    market_type: ctx.market_type,
                    event_ticker: ctx.event_ticker.to_string(),
                    market_ticker: market.ticker.clone(),
                    action: Action::Buy,
                    side: Side::Yes,
                    suggested_price_cents: yes_ask,
                    confidence: ctx.confidence,
                    edge_pct: edge,
                    reason: format!(
                        "Est temp {:.0}°F, bracket [{:.0}-{:.0}]°F, our prob {:.0}% vs market {}¢",
                        ctx.estimated_temp,
                        bracket_low,
                        bracket_high,
                        our_prob * 100.0,
                        yes_ask,
                    ),
                    current_temp_f: ctx.estimate.primary_temp,
                    forecast_temp_f: forecast_for(ctx),
                    surrounding_avg_f: ctx.estimate.surrounding_avg,
                    market_yes_price_cents: yes_ask,
                    is_tomorrow: ctx.is_tomorrow,
                    margin_f: 0.0,
                    signal_source: SignalSource::Model,
                    strike: Some(strike),
                    our_probability: our_prob,
                });
            }
        }

        // Market overvalues the bracket: sell YES (buy NO at 100 - bid)
        if our_price_cents < yes_bid && yes_bid > 0 {
            let nearest_edge = (ctx.estimated_temp - bracket_low)
                .abs()
                .min((ctx.estimated_temp - bracket_high).abs());
            if nearest_edge < 3.0 {
                info!(
                    "  SKIP NO {}: estimate {:.0}°F only {:.1}°F from nearest bracket edge",
                    market.ticker, ctx.estimated_temp, nearest_edge,
                );
                continue;
            }
            let edge = ((yes_bid - our_price_cents) as f64 / yes_bid as f64) * 100.0;

            let mut confidence = ctx.confidence;
            match validate_no_signal(ctx, &strike, market, edge, nearest_edge) {
                NoValidation::Blocked => continue,
                NoValidation::Penalized => {
                    confidence = (confidence - 0.15).max(0.2);
                }
                NoValidation::Clean => {}
            }

            if edge >= ctx.min_edge_pct {
                signals.push(Signal {
                    city: ctx.city.to_string(),
                    market_type: ctx.market_type,
                    event_ticker: ctx.event_ticker.to_string(),
                    market_ticker: market.ticker.clone(),
                    action: Action::Buy,
                    side: Side::No,
                    suggested_price_cents: 100 - yes_bid,
                    confidence,
                    edge_pct: edge,
                    reason: format!(
                        "Est temp {:.0}°F, NOT in [{:.0}-{:.0}]°F, our prob {:.0}% vs market {}¢",
                        ctx.estimated_temp,
                        bracket_low,
                        bracket_high,
                        our_prob * 100.0,
                        yes_bid,
                    ),
                    current_temp_f: ctx.estimate.primary_temp,
                    forecast_temp_f: forecast_for(ctx),
                    surrounding_avg_f: ctx.estimate.surrounding_avg,
                    market_yes_price_cents: yes_bid,
                    is_tomorrow: ctx.is_tomorrow,
                    margin_f: nearest_edge,
                    signal_source: SignalSource::Model,
                    strike: Some(strike),
                    our_probability: our_prob,
                });
            }
        }
    }

    signals
}

fn forecast_for(ctx: &AnalysisContext<'_>) -> f64 {
    match ctx.market_type {
        MarketType::High => ctx.estimate.forecast_high.unwrap_or(0.0),
        MarketType::Low => ctx.estimate.forecast_low.unwrap_or(0.0),
    }
}

enum NoValidation {
    Clean,
    Penalized,
    Blocked,
}

/// Extra scrutiny for NO signals where our model disagrees hard with the
/// market. A flagged signal must survive every cross-check, and still takes
/// a confidence penalty.
fn validate_no_signal(
    ctx: &AnalysisContext<'_>,
    strike: &Strike,
    market: &Market,
    edge: f64,
    nearest_edge: f64,
) -> NoValidation {
    let yes_bid = market.yes_bid;
    let (bracket_low, bracket_high) = strike.bounds();
    let running_h = ctx.estimate.running_high;
    let running_l = ctx.estimate.running_low;

    let mut flagged = false;
    let mut flag_reasons: Vec<String> = Vec::new();

    // Running extreme hugging the bracket edge while the model claims a big edge
    if ctx.market_type == MarketType::High {
        if let Some(rh) = running_h {
            let running_margin = (rh - bracket_low).abs();
            if running_margin < 2.0 && edge > 50.0 {
                flagged = true;
                flag_reasons.push(format!(
                    "running high {:.1}°F only {:.1}°F from bracket edge",
                    rh, running_margin,
                ));
            }
        }
    }
    if ctx.market_type == MarketType::Low {
        if let Some(rl) = running_l {
            let running_margin = (rl - bracket_high).abs();
            if running_margin < 2.0 && edge > 50.0 {
                flagged = true;
                flag_reasons.push(format!(
                    "running low {:.1}°F only {:.1}°F from bracket edge",
                    rl, running_margin,
                ));
            }
        }
    }

    // Large disagreement with a liquid market on today's contracts
    if yes_bid >= 15 && edge > 80.0 && !ctx.is_tomorrow {
        flagged = true;
        flag_reasons.push(format!(
            "market prices YES at {}¢ but model claims {:.0}% edge",
            yes_bid, edge,
        ));
    }

    // Forecast vs observed reality diverging
    if !ctx.is_tomorrow {
        if ctx.market_type == MarketType::High {
            if let (Some(rh), Some(fc)) = (running_h, ctx.estimate.forecast_high) {
                if (rh - fc).abs() > 3.0 {
                    flagged = true;
                    flag_reasons.push(format!(
                        "forecast ({:.0}°F) diverges from running high ({:.1}°F)",
                        fc, rh,
                    ));
                }
            }
        }
        if ctx.market_type == MarketType::Low {
            if let (Some(rl), Some(fc)) = (running_l, ctx.estimate.forecast_low) {
                if (rl - fc).abs() > 3.0 {
                    flagged = true;
                    flag_reasons.push(format!(
                        "forecast ({:.0}°F) diverges from running low ({:.1}°F)",
                        fc, rl,
                    ));
                }
            }
        }
    }

    if !flagged {
        return NoValidation::Clean;
    }

    warn!(
        "FLAGGED {}: {} — running enhanced validation",
        market.ticker,
        flag_reasons.join("; "),
    );

    let is_bracket = matches!(strike, Strike::Bracket { .. });

    // Does the running extreme plus rounding ambiguity land inside the bracket?
    if is_bracket {
        if ctx.market_type == MarketType::High {
            if let Some(rh) = running_h {
                let effective = rh + 1.0;
                if bracket_low <= effective && effective <= bracket_high + 1.0 {
                    warn!(
                        "  BLOCKED {}: running high + rounding ({:.1}°F) falls in bracket",
                        market.ticker, effective,
                    );
                    return NoValidation::Blocked;
                }
            }
        }
        if ctx.market_type == MarketType::Low {
            if let Some(rl) = running_l {
                let effective = rl - 1.0;
                if bracket_low <= effective && effective <= bracket_high + 1.0 {
                    warn!(
                        "  BLOCKED {}: running low - rounding ({:.1}°F) falls in bracket",
                        market.ticker, effective,
                    );
                    return NoValidation::Blocked;
                }
            }
        }
    }

    // Running data already past the estimate means the model input is stale
    if ctx.market_type == MarketType::High {
        if let Some(rh) = running_h {
            if rh > ctx.estimated_temp {
                warn!(
                    "  BLOCKED {}: running high {:.1}°F > estimate {:.1}°F — stale input",
                    market.ticker, rh, ctx.estimated_temp,
                );
                return NoValidation::Blocked;
            }
        }
    }
    if ctx.market_type == MarketType::Low {
        if let Some(rl) = running_l {
            if rl < ctx.estimated_temp {
                warn!(
                    "  BLOCKED {}: running low {:.1}°F < estimate {:.1}°F — stale input",
                    market.ticker, rl, ctx.estimated_temp,
                );
                return NoValidation::Blocked;
            }
        }
    }

    // Flagged signals need a wider margin of safety
    if nearest_edge < 4.0 {
        warn!(
            "  BLOCKED {}: flagged signal with only {:.1}°F margin (need 4°F)",
            market.ticker, nearest_edge,
        );
        return NoValidation::Blocked;
    }

    info!("  Flagged signal passed enhanced validation — confidence reduced");
    NoValidation::Penalized
}

/// Keep only high-probability plays: NO where the YES quote is rich enough
/// to pay, YES only on near-certain (≥50¢) contracts.
pub fn post_filter(signals: Vec<Signal>) -> Vec<Signal> {
    signals
        .into_iter()
        .filter(|s| match s.side {
            Side::No => {
                if s.market_yes_price_cents < 10 {
                    info!(
                        "  FILTERED OUT: {} NO (YES@{}¢) — bad risk/reward",
                        s.market_ticker, s.market_yes_price_cents,
                    );
                    false
                } else {
                    true
                }
            }
            Side::Yes => {
                if s.suggested_price_cents >= 50 {
                    true
                } else {
                    info!(
                        "  FILTERED OUT: {} YES @ {}¢ (YES buys under 50¢)",
                        s.market_ticker, s.suggested_price_cents,
                    );
                    false
                }
            }
        })
        .collect()
}

/// Priority score: longshot NO sells dominate, then high-conviction YES.
pub fn signal_score(s: &Signal) -> f64 {
    let mut base = s.confidence * s.edge_pct.min(100.0);

    if s.side == Side::No && s.market_yes_price_cents <= 25 {
        base *= 5.0;
    } else if s.side == Side::Yes && s.suggested_price_cents >= 80 {
        base *= 3.0;
    } else if s.side == Side::No {
        base *= 2.0;
    } else if s.side == Side::Yes && s.suggested_price_cents >= 10 {
        base *= 1.0;
    } else {
        base *= 0.3;
    }

    if cities::is_preferred(&s.city) {
        base *= 1.3;
    }
    base
}

pub fn sort_by_priority(signals: &mut [Signal]) {
    signals.sort_by(|a, b| {
        signal_score(b)
            .partial_cmp(&signal_score(a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Full base path over all cities for today and tomorrow.
pub async fn generate_model_signals(
    db: &Database,
    client: &KalshiClient,
    weather: &WeatherClient,
    config: &Config,
) -> Vec<Signal> {
    let mut signals = Vec::new();

    let dates = [
        (clock::kalshi_date_today(), None::<String>),
        (clock::kalshi_date_tomorrow(), Some(clock::tomorrow_et())),
    ];

    for city in cities::all() {
        if !config.city_enabled(city.code) {
            info!("Skipping {} (disabled)", city.code);
            continue;
        }

        for (date_str, target_date) in &dates {
            let is_tomorrow = target_date.is_some();
            let consensus = if is_tomorrow {
                weather.consensus_forecast(city.code).await
            } else {
                None
            };

            let estimate = match estimator::estimate(
                db,
                city,
                target_date.as_deref(),
                consensus,
                clock::et_hour(),
            ) {
                Ok(Some(e)) => e,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Estimate failed for {}: {}", city.code, e);
                    continue;
                }
            };

            let passes: [(Option<&str>, MarketType, Option<f64>, f64); 2] = [
                (
                    city.kalshi_high,
                    MarketType::High,
                    estimate.estimated_high,
                    estimate.high_confidence,
                ),
                (
                    city.kalshi_low,
                    MarketType::Low,
                    estimate.estimated_low,
                    estimate.low_confidence,
                ),
            ];

            for (series, market_type, estimated, confidence) in passes {
                let (series, estimated) = match (series, estimated) {
                    (Some(s), Some(t)) => (s, t),
                    _ => continue,
                };
                let event_ticker = format!("{}-{}", series, date_str);

                let markets = match client.get_event_markets(&event_ticker).await {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("Failed to get markets for {}: {}", event_ticker, e);
                        continue;
                    }
                };
                if markets.is_empty() {
                    continue;
                }

                let ctx = AnalysisContext {
                    city: city.code,
                    market_type,
                    event_ticker: &event_ticker,
                    estimated_temp: estimated,
                    confidence,
                    estimate: &estimate,
                    is_tomorrow,
                    min_edge_pct: config.risk.min_edge_pct,
                    min_entry_price: config.risk.min_entry_price,
                };
                signals.extend(analyze_brackets(&markets, &ctx));

                // Spacing between market lookups in the hot loop
                tokio::time::sleep(std::time::Duration::from_millis(150)).await;
            }
        }
    }

    let mut signals = post_filter(signals);
    sort_by_priority(&mut signals);

    info!("Generated {} model signals", signals.len());
    for s in &signals {
        info!("  {}", s);
    }
    signals
}
