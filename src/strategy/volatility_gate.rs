use serde::{Deserialize, Serialize};

use crate::indicators::average_true_range;
use crate::instruments::InstrumentContext;
use crate::models::Bar;

const PIP_EPSILON: f64 = 1e-9;

/// Volatility band an instrument must sit in to be traded this cycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VolatilityConfig {
    /// Confirmation bars in the true-range average
    pub window: usize,
    pub min_pips: f64,
    pub max_pips: f64,
}

impl Default for VolatilityConfig {
    fn default() -> Self {
        Self {
            window: 14,
            min_pips: 4.0,
            max_pips: 15.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateRejection {
    InsufficientHistory,
    TooQuiet,
    TooVolatile,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolatilityReading {
    pub accepted: bool,
    pub volatility_pips: f64,
    pub rejection: Option<GateRejection>,
}

impl VolatilityReading {
    fn rejected(volatility_pips: f64, reason: GateRejection) -> Self {
        Self {
            accepted: false,
            volatility_pips,
            rejection: Some(reason),
        }
    }
}

/// Accepts or rejects an instrument based on its recent true range
#[derive(Debug, Clone)]
pub struct VolatilityGate {
    config: VolatilityConfig,
}

impl VolatilityGate {
    pub fn new(config: VolatilityConfig) -> Self {
        Self { config }
    }

    /// Bars needed before the gate can produce a reading
    pub fn bars_required(&self) -> usize {
        self.config.window + 1
    }

    /// Evaluate the instrument against the volatility band (bounds inclusive)
    pub fn evaluate(&self, instrument: &InstrumentContext, bars: &[Bar]) -> VolatilityReading {
        let Some(atr) = average_true_range(bars, self.config.window) else {
            return VolatilityReading::rejected(0.0, GateRejection::InsufficientHistory);
        };
        let volatility_pips = instrument.to_pips(atr);

        if volatility_pips < self.config.min_pips - PIP_EPSILON {
            return VolatilityReading::rejected(volatility_pips, GateRejection::TooQuiet);
        }
        if volatility_pips > self.config.max_pips + PIP_EPSILON {
            return VolatilityReading::rejected(volatility_pips, GateRejection::TooVolatile);
        }

        VolatilityReading {
            accepted: true,
            volatility_pips,
            rejection: None,
        }
    }
}
