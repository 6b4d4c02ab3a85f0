//! Risk gate: every signal passes through these checks before sizing.
//! Outcomes are values, not exceptions; the orchestrator collects the
//! reject reasons for logging.

use tracing::warn;

use crate::config::RiskConfig;
use crate::kalshi::Side;
use crate::signals::{Signal, SignalSource};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Accept,
    Reject(String),
}

impl GateDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, GateDecision::Accept)
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        GateDecision::Reject(reason.into())
    }
}

/// Dedup/stacking outcome for a signal against existing holdings.
#[derive(Debug, Clone, PartialEq)]
pub enum StackDecision {
    /// No open position on this (ticker, side) today.
    FirstEntry,
    /// Lock-in stacking onto an existing position.
    Stack,
    Blocked(String),
}

pub const CAPITAL_CAP_PCT: f64 = 0.40;
pub const MAX_STACK_CONTRACTS_PER_TICKER: i64 = 25;
pub const BASE_ACCOUNT_CENTS: i64 = 8_000;

/// Global kill switch: checked on every signal.
pub fn check_kill_switch(kill_switch: bool) -> GateDecision {
    if kill_switch {
        GateDecision::reject("kill switch on")
    } else {
        GateDecision::Accept
    }
}

/// YES buys are prohibited except for lock-in confirmed brackets.
pub fn check_yes_policy(signal: &Signal) -> GateDecision {
    if signal.side == Side::Yes && signal.signal_source != SignalSource::MetarLockin {
        GateDecision::reject("YES buys restricted to lock-in signals")
    } else {
        GateDecision::Accept
    }
}

/// Per-ticker contract cap.
pub fn check_ticker_cap(current_contracts: i64, max_per_ticker: i64) -> GateDecision {
    if current_contracts >= max_per_ticker {
        GateDecision::reject(format!(
            "ticker already holds {} contracts (cap {})",
            current_contracts, max_per_ticker,
        ))
    } else {
        GateDecision::Accept
    }
}

/// Total open exposure must stay under 40% of account value.
pub fn check_capital_cap(total_exposure_cents: i64, account_value_cents: i64) -> GateDecision {
    let max_exposure = (account_value_cents as f64 * CAPITAL_CAP_PCT) as i64;
    if total_exposure_cents >= max_exposure {
        GateDecision::reject(format!(
            "capital cap: exposure {}¢ >= 40% of {}¢ account",
            total_exposure_cents, account_value_cents,
        ))
    } else {
        GateDecision::Accept
    }
}

/// Minimum edge: 15% for model signals, 1% for lock-ins.
pub fn check_min_edge(signal: &Signal, risk: &RiskConfig) -> GateDecision {
    let min_edge = if signal.signal_source == SignalSource::MetarLockin {
        1.0
    } else {
        risk.min_edge_pct
    };
    if signal.edge_pct < min_edge {
        GateDecision::reject(format!(
            "edge too low ({:.1}% < {:.1}%)",
            signal.edge_pct, min_edge,
        ))
    } else {
        GateDecision::Accept
    }
}

/// Catches too-good-to-be-true signals before any money moves.
pub fn sanity_check(signal: &Signal) -> GateDecision {
    let is_lockin = signal.signal_source == SignalSource::MetarLockin;

    // Huge edge on a liquid market is a data error, not free money
    if signal.edge_pct > 90.0 && signal.market_yes_price_cents >= 20 && !is_lockin {
        warn!(
            "SANITY BLOCK: {} has {:.0}% edge with YES@{}¢ — only lock-ins allowed at this edge",
            signal.market_ticker, signal.edge_pct, signal.market_yes_price_cents,
        );
        return GateDecision::reject("edge >90% on liquid market");
    }

    // Forecast vs current divergence catches wrong-date data
    if signal.current_temp_f != 0.0 && signal.forecast_temp_f != 0.0 {
        let temp_diff = (signal.forecast_temp_f - signal.current_temp_f).abs();
        if temp_diff > 20.0 {
            warn!(
                "SANITY BLOCK: {} forecast {:.0}°F vs current {:.0}°F",
                signal.market_ticker, signal.forecast_temp_f, signal.current_temp_f,
            );
            return GateDecision::reject("forecast/current divergence >20°F");
        }
    }

    // Primary vs surrounding divergence: warn only, stations can differ
    if signal.current_temp_f != 0.0 && signal.surrounding_avg_f != 0.0 {
        let station_diff = (signal.current_temp_f - signal.surrounding_avg_f).abs();
        if station_diff > 8.0 {
            warn!(
                "SANITY: {} primary {:.0}°F vs surrounding {:.0}°F — possible stale station",
                signal.market_ticker, signal.current_temp_f, signal.surrounding_avg_f,
            );
        }
    }

    // Bracket-edge rounding risk needs finer-grained data than we have
    if !is_lockin && !signal.is_tomorrow && signal.margin_f < 2.0 && signal.side == Side::No {
        warn!(
            "SANITY BLOCK: {} margin only {:.1}°F — too close to the bracket edge",
            signal.market_ticker, signal.margin_f,
        );
        return GateDecision::reject("margin <2°F on today's model signal");
    }

    GateDecision::Accept
}

/// Dedup for model signals, capped stacking for lock-ins.
pub fn stacking_decision(
    signal: &Signal,
    already_held: bool,
    existing_contracts: i64,
) -> StackDecision {
    if !already_held {
        return StackDecision::FirstEntry;
    }
    if signal.signal_source != SignalSource::MetarLockin {
        return StackDecision::Blocked(format!(
            "already traded {} {} today (model signal, no stacking)",
            signal.market_ticker, signal.side,
        ));
    }
    if existing_contracts >= MAX_STACK_CONTRACTS_PER_TICKER {
        return StackDecision::Blocked(format!(
            "max stack: {} already holds {} contracts (cap {})",
            signal.market_ticker, existing_contracts, MAX_STACK_CONTRACTS_PER_TICKER,
        ));
    }
    StackDecision::Stack
}

/// Thresholds scale with account size; $80 is the calibration point.
pub fn account_scale_factor(account_cents: i64) -> f64 {
    (account_cents as f64 / BASE_ACCOUNT_CENTS as f64).max(0.5)
}

/// Inputs to the daily trade-cap check.
#[derive(Debug, Clone)]
pub struct TradeCapInputs {
    pub today_count: i64,
    pub today_wins: i64,
    /// Open positions currently marked above cost.
    pub looking_good: i64,
    pub account_value_cents: i64,
    pub profit_rule_triggered: bool,
}

/// Daily trade cap with bonus slots.
///
/// Base cap scales with account size. Winning days unlock bonus slots
/// restricted to longshot YES plays; the profit rule adds ten more; enough
/// positions in profit add three.
pub fn check_trade_cap(
    signal: &Signal,
    inputs: &TradeCapInputs,
    risk: &RiskConfig,
) -> GateDecision {
    let scale = account_scale_factor(inputs.account_value_cents);
    let base_max = ((risk.max_trades_per_day as f64 * scale).round() as i64).max(8);
    let bonus_threshold = ((risk.bonus_trades_after_wins as f64 * scale).round() as i64).max(6);
    let bonus_count = risk.bonus_trade_count as i64;

    let mut effective_max = base_max;

    if inputs.profit_rule_triggered {
        effective_max = base_max + 10;
    }

    if inputs.today_wins >= bonus_threshold {
        effective_max = effective_max.max(base_max + bonus_count);
        if inputs.today_count >= base_max {
            // Bonus slots only take longshot YES plays
            if !(signal.side == Side::Yes && signal.suggested_price_cents <= 10) {
                return GateDecision::reject(format!(
                    "bonus slot is longshot-YES only (got {} @ {}¢)",
                    signal.side, signal.suggested_price_cents,
                ));
            }
        }
    }

    if inputs.today_count >= effective_max {
        let looking_good_threshold = ((17.0 * scale).round() as i64).max(7);
        if inputs.looking_good >= looking_good_threshold
            && inputs.today_count < effective_max + 3
        {
            effective_max += 3;
        }
    }

    if inputs.today_count >= effective_max {
        return GateDecision::reject(format!(
            "max daily trades reached ({}/{}, wins={})",
            inputs.today_count, effective_max, inputs.today_wins,
        ));
    }

    GateDecision::Accept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::kalshi::Action;
    use crate::signals::MarketType;

    fn risk() -> RiskConfig {
        Config::from_env().unwrap().risk
    }

    fn signal(side: Side, source: SignalSource, edge: f64, yes_price: i64) -> Signal {
        Signal {
            city: "NYC".to_string(),
            market_type: MarketType::High,
            event_ticker: "E".to_string(),
            market_ticker: "T".to_string(),
            action: Action::Buy,
            side,
            suggested_price_cents: if side == Side::No { 100 - yes_price } else { yes_price },
            confidence: 0.8,
            edge_pct: edge,
            reason: String::new(),
            current_temp_f: 41.0,
            forecast_temp_f: 44.0,
            surrounding_avg_f: 40.5,
            market_yes_price_cents: yes_price,
            is_tomorrow: false,
            margin_f: 5.0,
            signal_source: source,
            strike: None,
            our_probability: 0.2,
        }
    }

    fn cap_inputs(today_count: i64, account: i64) -> TradeCapInputs {
        TradeCapInputs {
            today_count,
            today_wins: 0,
            looking_good: 0,
            account_value_cents: account,
            profit_rule_triggered: false,
        }
    }

    #[test]
    fn test_kill_switch() {
        assert!(check_kill_switch(false).is_accept());
        assert!(!check_kill_switch(true).is_accept());
    }

    #[test]
    fn test_yes_policy_blocks_model_yes() {
        let s = signal(Side::Yes, SignalSource::Model, 30.0, 80);
        assert!(!check_yes_policy(&s).is_accept());

        let s = signal(Side::Yes, SignalSource::MetarLockin, 5.0, 90);
        assert!(check_yes_policy(&s).is_accept());

        let s = signal(Side::No, SignalSource::Model, 30.0, 20);
        assert!(check_yes_policy(&s).is_accept());
    }

    #[test]
    fn test_ticker_cap() {
        assert!(check_ticker_cap(49, 50).is_accept());
        assert!(!check_ticker_cap(50, 50).is_accept());
    }

    #[test]
    fn test_capital_cap_at_boundary() {
        // 40% of 18,000 = 7,200
        assert!(!check_capital_cap(7_200, 18_000).is_accept());
        assert!(!check_capital_cap(8_000, 18_000).is_accept());
        assert!(check_capital_cap(7_199, 18_000).is_accept());
    }

    #[test]
    fn test_min_edge_tiers() {
        let model = signal(Side::No, SignalSource::Model, 10.0, 20);
        assert!(!check_min_edge(&model, &risk()).is_accept());

        let model = signal(Side::No, SignalSource::Model, 15.0, 20);
        assert!(check_min_edge(&model, &risk()).is_accept());

        let lockin = signal(Side::No, SignalSource::MetarLockin, 2.0, 20);
        assert!(check_min_edge(&lockin, &risk()).is_accept());

        let lockin = signal(Side::No, SignalSource::MetarLockin, 0.5, 20);
        assert!(!check_min_edge(&lockin, &risk()).is_accept());
    }

    #[test]
    fn test_sanity_blocks_huge_edge_on_liquid_market() {
        let s = signal(Side::No, SignalSource::Model, 95.0, 25);
        assert!(!sanity_check(&s).is_accept());

        // Same numbers from a lock-in pass
        let s = signal(Side::No, SignalSource::MetarLockin, 95.0, 25);
        assert!(sanity_check(&s).is_accept());

        // Big edge on an illiquid quote is fine
        let s = signal(Side::No, SignalSource::Model, 95.0, 15);
        assert!(sanity_check(&s).is_accept());
    }

    #[test]
    fn test_sanity_blocks_temp_divergence() {
        let mut s = signal(Side::No, SignalSource::Model, 30.0, 20);
        s.current_temp_f = 40.0;
        s.forecast_temp_f = 65.0;
        assert!(!sanity_check(&s).is_accept());

        s.forecast_temp_f = 55.0;
        assert!(sanity_check(&s).is_accept());
    }

    #[test]
    fn test_sanity_blocks_thin_margin_today() {
        let mut s = signal(Side::No, SignalSource::Model, 30.0, 20);
        s.margin_f = 1.5;
        assert!(!sanity_check(&s).is_accept());

        // Tomorrow signals are exempt
        s.is_tomorrow = true;
        assert!(sanity_check(&s).is_accept());

        // Lock-ins are exempt
        let mut s = signal(Side::No, SignalSource::MetarLockin, 30.0, 20);
        s.margin_f = 0.0;
        assert!(sanity_check(&s).is_accept());
    }

    #[test]
    fn test_station_divergence_warns_but_accepts() {
        let mut s = signal(Side::No, SignalSource::Model, 30.0, 20);
        s.current_temp_f = 50.0;
        s.surrounding_avg_f = 40.0;
        assert!(sanity_check(&s).is_accept());
    }

    #[test]
    fn test_stacking_first_entry() {
        let s = signal(Side::No, SignalSource::Model, 30.0, 20);
        assert_eq!(stacking_decision(&s, false, 0), StackDecision::FirstEntry);
    }

    #[test]
    fn test_stacking_blocks_model_duplicates() {
        let s = signal(Side::No, SignalSource::Model, 30.0, 20);
        assert!(matches!(
            stacking_decision(&s, true, 5),
            StackDecision::Blocked(_)
        ));
    }

    #[test]
    fn test_stacking_allows_lockin_until_cap() {
        let s = signal(Side::No, SignalSource::MetarLockin, 90.0, 20);
        assert_eq!(stacking_decision(&s, true, 10), StackDecision::Stack);
        assert!(matches!(
            stacking_decision(&s, true, 25),
            StackDecision::Blocked(_)
        ));
    }

    #[test]
    fn test_account_scale_factor() {
        assert_eq!(account_scale_factor(8_000), 1.0);
        assert_eq!(account_scale_factor(16_000), 2.0);
        // Floored at 0.5
        assert_eq!(account_scale_factor(1_000), 0.5);
    }

    #[test]
    fn test_trade_cap_base() {
        let s = signal(Side::No, SignalSource::Model, 30.0, 20);
        // account 8,000 → scale 1.0 → base_max = max(8, 12) = 12
        assert!(check_trade_cap(&s, &cap_inputs(11, 8_000), &risk()).is_accept());
        assert!(!check_trade_cap(&s, &cap_inputs(12, 8_000), &risk()).is_accept());
    }

    #[test]
    fn test_trade_cap_floor_of_eight() {
        let s = signal(Side::No, SignalSource::Model, 30.0, 20);
        // Tiny account scales down but the floor holds at 8
        assert!(check_trade_cap(&s, &cap_inputs(7, 1_000), &risk()).is_accept());
        assert!(!check_trade_cap(&s, &cap_inputs(8, 1_000), &risk()).is_accept());
    }

    #[test]
    fn test_profit_rule_unlocks_ten() {
        let s = signal(Side::No, SignalSource::Model, 30.0, 20);
        let mut inputs = cap_inputs(12, 8_000);
        assert!(!check_trade_cap(&s, &inputs, &risk()).is_accept());

        inputs.profit_rule_triggered = true;
        // effective = 12 + 10 = 22
        assert!(check_trade_cap(&s, &inputs, &risk()).is_accept());
        inputs.today_count = 22;
        assert!(!check_trade_cap(&s, &inputs, &risk()).is_accept());
    }

    #[test]
    fn test_bonus_slots_longshot_yes_only() {
        let mut inputs = cap_inputs(12, 8_000);
        inputs.today_wins = 18; // >= threshold 18

        // A NO signal cannot use the bonus slot
        let no_sig = signal(Side::No, SignalSource::Model, 30.0, 20);
        assert!(!check_trade_cap(&no_sig, &inputs, &risk()).is_accept());

        // A longshot YES (≤10¢) can
        let mut yes_sig = signal(Side::Yes, SignalSource::MetarLockin, 30.0, 8);
        yes_sig.suggested_price_cents = 8;
        assert!(check_trade_cap(&yes_sig, &inputs, &risk()).is_accept());
    }

    #[test]
    fn test_looking_good_momentum_bonus() {
        let s = signal(Side::No, SignalSource::Model, 30.0, 20);
        let mut inputs = cap_inputs(12, 8_000);
        // At the cap with enough winners marked in profit
        inputs.looking_good = 17;
        assert!(check_trade_cap(&s, &inputs, &risk()).is_accept());

        // Past the +3 extension
        inputs.today_count = 15;
        assert!(!check_trade_cap(&s, &inputs, &risk()).is_accept());
    }
}
