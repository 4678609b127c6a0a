use serde::{Deserialize, Serialize};

use crate::instruments::InstrumentContext;

const STEP_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskConfig {
    /// Fraction of equity risked per trade
    pub risk_fraction: f64,
    /// Achieved risk above this multiple of the target is logged as a warning
    pub max_risk_multiple: f64,
    /// Currency equity and risk are measured in
    pub account_currency: String,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_fraction: 0.0055,
            max_risk_multiple: 1.5,
            account_currency: "USD".to_string(),
        }
    }
}

/// Sizing of a single trade. Never mutated after creation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskParameters {
    pub volatility_pips: f64,
    pub stop_distance_pips: f64,
    pub volume: f64,
    /// Equity * risk fraction
    pub risk_amount: f64,
    /// Actual fraction of equity lost if the stop is hit at `volume`
    pub achieved_risk_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoTradeReason {
    ZeroVolatility,
    NoEquity,
    VolumeRoundsToZero,
    /// Volume bounds or step unusable (inverted, non-positive, NaN)
    InvalidVolumeLimits,
    /// Pip value cannot be expressed in account currency
    NoConversionRate,
}

impl std::fmt::Display for NoTradeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoTradeReason::ZeroVolatility => write!(f, "volatility is zero"),
            NoTradeReason::NoEquity => write!(f, "account equity is not positive"),
            NoTradeReason::VolumeRoundsToZero => write!(f, "volume rounds to zero"),
            NoTradeReason::InvalidVolumeLimits => write!(f, "instrument volume limits are invalid"),
            NoTradeReason::NoConversionRate => {
                write!(f, "no quote-to-account conversion rate")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizingDecision {
    Trade(RiskParameters),
    NoTrade(NoTradeReason),
}

/// Volatility-bounded position sizing
#[derive(Debug, Clone)]
pub struct RiskSizer {
    config: RiskConfig,
}

impl RiskSizer {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn risk_fraction(&self) -> f64 {
        self.config.risk_fraction
    }

    pub fn account_currency(&self) -> &str {
        &self.config.account_currency
    }

    /// Size a trade entered at `price` whose stop sits `volatility_pips` away
    pub fn size(
        &self,
        equity: f64,
        risk_fraction: f64,
        volatility_pips: f64,
        price: f64,
        instrument: &InstrumentContext,
    ) -> SizingDecision {
        if volatility_pips.is_nan() || volatility_pips <= 0.0 {
            return SizingDecision::NoTrade(NoTradeReason::ZeroVolatility);
        }
        if equity.is_nan() || equity <= 0.0 {
            return SizingDecision::NoTrade(NoTradeReason::NoEquity);
        }

        let (min_volume, max_volume, step) = (
            instrument.min_volume,
            instrument.max_volume,
            instrument.volume_step,
        );
        let limits_valid = min_volume.is_finite()
            && max_volume.is_finite()
            && min_volume > 0.0
            && min_volume <= max_volume
            && step.is_finite()
            && step > 0.0;
        if !limits_valid {
            tracing::warn!(
                symbol = %instrument.symbol,
                min_volume,
                max_volume,
                volume_step = step,
                "Unusable volume limits, not trading"
            );
            return SizingDecision::NoTrade(NoTradeReason::InvalidVolumeLimits);
        }

        let pip_value = match instrument.pip_value_per_lot(price, &self.config.account_currency) {
            Some(value) if value.is_finite() && value > 0.0 => value,
            _ => {
                tracing::warn!(
                    symbol = %instrument.symbol,
                    account_currency = %self.config.account_currency,
                    "No pip value in account currency, not trading"
                );
                return SizingDecision::NoTrade(NoTradeReason::NoConversionRate);
            }
        };

        let stop_distance_pips = volatility_pips;
        let risk_amount = equity * risk_fraction;
        let raw_volume = risk_amount / (stop_distance_pips * pip_value);

        let volume = round_to_step(raw_volume.clamp(min_volume, max_volume), step);
        if volume <= 0.0 {
            return SizingDecision::NoTrade(NoTradeReason::VolumeRoundsToZero);
        }

        let achieved_risk = volume * stop_distance_pips * pip_value;
        let achieved_risk_pct = achieved_risk / equity;

        if achieved_risk_pct > risk_fraction * self.config.max_risk_multiple {
            tracing::warn!(
                symbol = %instrument.symbol,
                volume,
                achieved_risk_pct,
                target_risk_pct = risk_fraction,
                "Minimum volume exceeds risk budget, trading at clamped size"
            );
        }

        tracing::debug!(
            symbol = %instrument.symbol,
            raw_volume,
            volume,
            stop_distance_pips,
            risk_amount,
            "Sized position"
        );

        SizingDecision::Trade(RiskParameters {
            volatility_pips,
            stop_distance_pips,
            volume,
            risk_amount,
            achieved_risk_pct,
        })
    }
}

/// Round down to a whole number of steps
fn round_to_step(volume: f64, step: f64) -> f64 {
    let steps = (volume / step + STEP_EPSILON).floor();
    // Strip float noise such as 0.55000000000000004
    (steps * step * 1e8).round() / 1e8
}
