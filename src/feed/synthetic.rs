use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use super::BarSource;
use crate::execution::GatewayError;
use crate::instruments::{AssetClass, InstrumentContext};
use crate::models::{Bar, Timeframe};

/// Market scenario types for synthetic data generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketScenario {
    /// Steady drift with pullbacks, produces structure breaks
    Trending,
    /// Mean-reverting chop around the base price
    Ranging,
    /// Swings large enough for the volatility gate to reject
    Volatile,
}

impl MarketScenario {
    pub const ALL: [MarketScenario; 3] = [
        MarketScenario::Trending,
        MarketScenario::Ranging,
        MarketScenario::Volatile,
    ];
}

/// Generates seeded random-walk bars on a confirmation timeframe and the
/// structure bars aggregated from them
///
/// Moves are drawn in pips so every asset class gets comparable volatility.
pub struct SyntheticBarGenerator {
    rng: StdRng,
    base_volume: f64,
}

impl SyntheticBarGenerator {
    /// Create a new generator with a seed for reproducibility
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            base_volume: 1_000.0,
        }
    }

    fn base_price(instrument: &InstrumentContext) -> f64 {
        let upper = instrument.symbol.to_uppercase();
        match instrument.asset_class {
            AssetClass::Forex if upper.contains("JPY") => 150.0,
            AssetClass::Forex => 1.1,
            AssetClass::Metal if upper.starts_with("XAU") => 2_300.0,
            AssetClass::Metal => 28.0,
            AssetClass::Index => 39_000.0,
            AssetClass::Crypto => 65_000.0,
            AssetClass::Bond => 130.0,
            AssetClass::Equity | AssetClass::Fund => 100.0,
        }
    }

    /// Generate `count` confirmation bars starting after `start`
    ///
    /// # Arguments
    /// * `instrument` - Instrument whose pip size scales the moves
    /// * `scenario` - The market scenario to simulate
    /// * `start` - Open time of the first bar
    /// * `count` - Number of bars
    /// * `timeframe` - Bar timeframe
    pub fn generate(
        &mut self,
        instrument: &InstrumentContext,
        scenario: MarketScenario,
        start: DateTime<Utc>,
        count: usize,
        timeframe: Timeframe,
    ) -> Vec<Bar> {
        let pip = instrument.pip_size;
        let base = Self::base_price(instrument);
        let (step_pips, wick_pips) = match scenario {
            MarketScenario::Trending | MarketScenario::Ranging => (4.0, 3.0),
            MarketScenario::Volatile => (18.0, 12.0),
        };

        let mut bars = Vec::with_capacity(count);
        let mut price = base;
        // Trend direction flips every few hours to produce fresh structure
        let mut drift_pips = 0.8;

        for i in 0..count {
            let timestamp = start + Duration::minutes((i as i64 + 1) * timeframe.minutes());
            let open = price;

            let drift = match scenario {
                MarketScenario::Trending => {
                    if i > 0 && i % 240 == 0 {
                        drift_pips = -drift_pips;
                    }
                    drift_pips * pip
                }
                MarketScenario::Ranging => (base - price) * 0.05,
                MarketScenario::Volatile => 0.0,
            };
            let noise = self.rng.gen_range(-step_pips..step_pips) * pip;
            price = (price + drift + noise).max(pip);

            let high = open.max(price) + self.rng.gen_range(0.0..wick_pips) * pip;
            let low = (open.min(price) - self.rng.gen_range(0.0..wick_pips) * pip).max(pip / 2.0);
            let volume = self.base_volume * self.rng.gen_range(0.7..1.3);

            bars.push(Bar {
                symbol: instrument.symbol.clone(),
                timeframe,
                timestamp,
                open,
                high,
                low,
                close: price,
                volume,
            });
        }

        bars
    }
}

/// Aggregate consecutive bars into complete bars of `timeframe`
///
/// Buckets end on multiples of the target timeframe counted from the first
/// bar's open; a trailing partial bucket is dropped.
pub fn aggregate(bars: &[Bar], timeframe: Timeframe) -> Vec<Bar> {
    let Some(first) = bars.first() else {
        return Vec::new();
    };
    let per_bucket = (timeframe.minutes() / first.timeframe.minutes()).max(1) as usize;

    bars.chunks(per_bucket)
        .filter(|chunk| chunk.len() == per_bucket)
        .filter_map(|chunk| {
            let head = chunk.first()?;
            let tail = chunk.last()?;
            Some(Bar {
                symbol: head.symbol.clone(),
                timeframe,
                timestamp: tail.timestamp,
                open: head.open,
                high: chunk.iter().map(|b| b.high).fold(f64::MIN, f64::max),
                low: chunk.iter().map(|b| b.low).fold(f64::MAX, f64::min),
                close: tail.close,
                volume: chunk.iter().map(|b| b.volume).sum(),
            })
        })
        .collect()
}

/// Replays pre-generated bars in batches
pub struct SyntheticFeed {
    pending: Mutex<VecDeque<Bar>>,
    batch_size: usize,
}

impl SyntheticFeed {
    /// Build an interleaved multi-instrument replay
    ///
    /// At equal timestamps the confirmation bar is delivered before the
    /// structure bar that closes with it.
    pub fn build(
        symbols: &[String],
        start: DateTime<Utc>,
        hours: u32,
        seed: u64,
        structure: Timeframe,
        confirmation: Timeframe,
    ) -> Self {
        let mut generator = SyntheticBarGenerator::new(seed);
        let count = (hours as i64 * 60 / confirmation.minutes()).max(0) as usize;
        let mut all = Vec::new();

        for (i, symbol) in symbols.iter().enumerate() {
            let instrument = InstrumentContext::for_symbol(symbol);
            let scenario = MarketScenario::ALL[i % MarketScenario::ALL.len()];
            let lower = generator.generate(&instrument, scenario, start, count, confirmation);
            let upper = aggregate(&lower, structure);
            tracing::debug!(
                symbol = %symbol,
                scenario = ?scenario,
                confirmation_bars = lower.len(),
                structure_bars = upper.len(),
                "Generated synthetic bars"
            );
            all.extend(lower);
            all.extend(upper);
        }

        all.sort_by_key(|b| (b.timestamp, b.timeframe.minutes()));
        Self::from_bars(all, 256)
    }

    pub fn from_bars(bars: Vec<Bar>, batch_size: usize) -> Self {
        Self {
            pending: Mutex::new(bars.into()),
            batch_size: batch_size.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Bar>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn remaining(&self) -> usize {
        self.lock().len()
    }
}

#[async_trait]
impl BarSource for SyntheticFeed {
    async fn poll_bars(&self) -> Result<Vec<Bar>, GatewayError> {
        let mut pending = self.lock();
        let n = self.batch_size.min(pending.len());
        Ok(pending.drain(..n).collect())
    }
}
