//! Contract sizing: risk bands tiered by side and conviction, stacking
//! multipliers for lock-ins, and a small anti-fingerprint jitter.

use rand::Rng;
use tracing::info;

use crate::config::RiskConfig;
use crate::kalshi::Side;
use crate::signals::{Signal, SignalSource};

/// Stacking multiplier for a signal. Lock-in stacks ramp with edge;
/// tomorrow's strong NO signals size up with the forecast-update safety net.
pub fn stack_multiplier(signal: &Signal, is_stacking: bool) -> f64 {
    if is_stacking && signal.signal_source == SignalSource::MetarLockin {
        if signal.edge_pct >= 80.0 {
            5.0
        } else if signal.edge_pct >= 40.0 {
            3.0
        } else {
            1.0
        }
    } else if signal.is_tomorrow && signal.edge_pct >= 40.0 && signal.side == Side::No {
        2.0
    } else {
        1.0
    }
}

/// Number of contracts for a signal, before the risk gate's caps.
///
/// Risk bands (cents, scaled by the stack multiplier):
///   NO (selling longshots): 175..225, risk per contract is the YES price
///   YES at ≥50¢:            0..175, minimum 3 contracts
///   YES below 50¢:          100..125
/// Bounded by 10 contracts, the minimum deployment (ceiling division), and
/// the bankroll cap. Contract counts of 3+ take a ±1 random jitter.
pub fn size_contracts(
    signal: &Signal,
    is_stacking: bool,
    balance_cents: i64,
    risk: &RiskConfig,
    rng: &mut impl Rng,
) -> i64 {
    let price = signal.suggested_price_cents;
    if price <= 0 {
        return 0;
    }

    let multiplier = stack_multiplier(signal, is_stacking);
    if multiplier > 1.0 {
        info!(
            "Stack sizing: {:.1}x multiplier (edge {:.0}%, source {})",
            multiplier, signal.edge_pct, signal.signal_source,
        );
    }

    let max_contracts = risk.max_contracts_per_trade;
    let (min_risk_cents, contracts_by_risk) = if signal.side == Side::No {
        let max_risk = (225.0 * multiplier) as i64;
        info!(
            "SELL LONGSHOT: {} YES@{}¢ → buying NO@{}¢",
            signal.market_ticker, signal.market_yes_price_cents, price,
        );
        (175i64, max_risk / price)
    } else if price >= 50 {
        let max_risk = (175.0 * multiplier) as i64;
        (0i64, (max_risk / price).max(3))
    } else {
        if price < risk.min_entry_price {
            info!(
                "Skipping {}: price {}¢ below min {}¢",
                signal.market_ticker, price, risk.min_entry_price,
            );
            return 0;
        }
        let max_risk = (125.0 * multiplier) as i64;
        (100i64, max_risk / price)
    };

    let mut contracts = contracts_by_risk.min(max_contracts);

    // Minimum deployment: round up, allowing a slight band overshoot
    if min_risk_cents > 0 {
        let min_contracts = ((min_risk_cents + price - 1) / price).max(1);
        contracts = contracts.max(min_contracts);
    }

    // Bankroll cap
    let max_by_bankroll = ((balance_cents as f64 * risk.max_position_pct / 100.0) as i64) / price;
    contracts = contracts.min(max_by_bankroll);

    // Anti-fingerprint jitter, biased toward no change
    if contracts >= 3 {
        let delta = [-1i64, 0, 0, 1][rng.gen_range(0..4)];
        contracts = (contracts + delta).max(1);
    }

    contracts.max(0)
}
