/// Structure-break retest state machine
///
/// One instance per instrument. Structure bars (higher timeframe) detect a
/// close beyond the recent close band; confirmation bars (lower timeframe)
/// then look for a close through the same level and a continuation beyond
/// the first break candle a few bars later.
///
/// ```text
/// Idle -> StructureBroken -> AwaitingInitialBreak -> BreakConfirmed -> Fired -> Idle
///               (any waiting state) --timeout--> Idle
/// ```
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::indicators::CloseBand;
use crate::instruments::InstrumentContext;
use crate::models::{Bar, Direction, PatternTrigger};

const PRICE_EPSILON: f64 = 1e-9;

/// Configuration for structure-break detection and the retest window
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PatternConfig {
    /// Structure bars forming the close band (current bar excluded)
    pub lookback: usize,
    /// Minimum close distance beyond the band, in pips
    pub min_breakout_pips: f64,
    /// Continuation beyond the first break candle needed to fire, in pips
    pub trigger_offset_pips: f64,
    /// Confirmation bar (first break candle = 1) from which the trigger is evaluated
    pub trigger_bar: u32,
    /// Confirmation bars after arming before the window expires
    pub timeout_bars: u32,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            lookback: 12,
            min_breakout_pips: 1.0,
            trigger_offset_pips: 0.6,
            trigger_bar: 3,
            timeout_bars: 120, // ~2 hours of M1 bars
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternState {
    Idle,
    StructureBroken,
    AwaitingInitialBreak,
    BreakConfirmed,
    Fired,
}

/// A confirmed higher-timeframe break
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureBreak {
    pub timestamp: DateTime<Utc>,
    pub break_price: f64,
    pub direction: Direction,
    /// Band edge that was broken
    pub level: f64,
}

/// Lower-timeframe confirmation progress for the active structure break
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetestWindow {
    pub direction: Direction,
    pub break_confirmed: bool,
    pub first_break_high: f64,
    pub first_break_low: f64,
    /// Bars since the first break candle (that candle counts as 1)
    pub bars_since_break: u32,
    /// Bars since the window was armed
    pub elapsed_bars: u32,
}

impl RetestWindow {
    fn armed(direction: Direction) -> Self {
        Self {
            direction,
            break_confirmed: false,
            first_break_high: 0.0,
            first_break_low: 0.0,
            bars_since_break: 0,
            elapsed_bars: 0,
        }
    }
}

/// Why a structure bar did not start a new cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureOutcome {
    /// Bar timestamp not newer than the last accepted structure bar
    Duplicate,
    /// Fewer structure bars than the lookback
    InsufficientHistory,
    NoBreak,
    /// A new structure break armed a retest window
    Broken(Direction),
}

pub struct PatternStateMachine {
    symbol: String,
    config: PatternConfig,
    pip_size: f64,
    state: PatternState,
    closes: VecDeque<f64>,
    structure_break: Option<StructureBreak>,
    window: Option<RetestWindow>,
    last_structure_ts: Option<DateTime<Utc>>,
    last_confirmation_ts: Option<DateTime<Utc>>,
}

impl PatternStateMachine {
    pub fn new(instrument: &InstrumentContext, config: PatternConfig) -> Self {
        Self {
            symbol: instrument.symbol.clone(),
            closes: VecDeque::with_capacity(config.lookback + 1),
            config,
            pip_size: instrument.pip_size,
            state: PatternState::Idle,
            structure_break: None,
            window: None,
            last_structure_ts: None,
            last_confirmation_ts: None,
        }
    }

    pub fn state(&self) -> PatternState {
        self.state
    }

    pub fn structure_break(&self) -> Option<&StructureBreak> {
        self.structure_break.as_ref()
    }

    pub fn window(&self) -> Option<&RetestWindow> {
        self.window.as_ref()
    }

    /// Pick up a refreshed pip size; the active window is kept
    pub fn update_instrument(&mut self, instrument: &InstrumentContext) {
        self.pip_size = instrument.pip_size;
    }

    fn trigger_offset(&self) -> f64 {
        self.config.trigger_offset_pips * self.pip_size
    }

    /// Feed a closed structure (higher timeframe) bar
    pub fn on_higher_timeframe_bar(&mut self, bar: &Bar) -> StructureOutcome {
        if self
            .last_structure_ts
            .is_some_and(|last| bar.timestamp <= last)
        {
            tracing::debug!(symbol = %self.symbol, ts = %bar.timestamp, "Ignoring repeated structure bar");
            return StructureOutcome::Duplicate;
        }
        self.last_structure_ts = Some(bar.timestamp);

        let outcome = if self.closes.len() < self.config.lookback {
            StructureOutcome::InsufficientHistory
        } else {
            self.detect_break(bar)
        };

        self.closes.push_back(bar.close);
        while self.closes.len() > self.config.lookback {
            self.closes.pop_front();
        }

        outcome
    }

    fn detect_break(&mut self, bar: &Bar) -> StructureOutcome {
        let Some(band) = CloseBand::from_closes(&self.closes) else {
            return StructureOutcome::InsufficientHistory;
        };
        let min_distance = self.config.min_breakout_pips * self.pip_size;

        let (direction, level) = if bar.close - band.high >= min_distance - PRICE_EPSILON {
            (Direction::Bullish, band.high)
        } else if band.low - bar.close >= min_distance - PRICE_EPSILON {
            (Direction::Bearish, band.low)
        } else {
            return StructureOutcome::NoBreak;
        };

        if self.window.is_some() {
            tracing::debug!(
                symbol = %self.symbol,
                state = ?self.state,
                "New structure break replaces active retest window"
            );
        }

        self.state = PatternState::StructureBroken;
        self.structure_break = Some(StructureBreak {
            timestamp: bar.timestamp,
            break_price: bar.close,
            direction,
            level,
        });
        self.window = Some(RetestWindow::armed(direction));
        self.state = PatternState::AwaitingInitialBreak;

        tracing::info!(
            symbol = %self.symbol,
            direction = ?direction,
            level,
            close = bar.close,
            "Structure break detected"
        );

        StructureOutcome::Broken(direction)
    }

    /// Feed a closed confirmation (lower timeframe) bar
    ///
    /// Returns the trigger when the retest completes on this bar.
    pub fn on_lower_timeframe_bar(&mut self, bar: &Bar) -> Option<PatternTrigger> {
        if !matches!(
            self.state,
            PatternState::AwaitingInitialBreak | PatternState::BreakConfirmed
        ) {
            return None;
        }
        if self
            .last_confirmation_ts
            .is_some_and(|last| bar.timestamp <= last)
        {
            tracing::debug!(symbol = %self.symbol, ts = %bar.timestamp, "Ignoring repeated confirmation bar");
            return None;
        }
        self.last_confirmation_ts = Some(bar.timestamp);

        let trigger_offset = self.trigger_offset();
        let level = self.structure_break.as_ref()?.level;
        let window = self.window.as_mut()?;
        window.elapsed_bars += 1;

        let mut fired = None;
        match self.state {
            PatternState::AwaitingInitialBreak => {
                let crossed = match window.direction {
                    Direction::Bullish => bar.close > level,
                    Direction::Bearish => bar.close < level,
                };
                if crossed {
                    window.break_confirmed = true;
                    window.first_break_high = bar.high;
                    window.first_break_low = bar.low;
                    window.bars_since_break = 1;
                    self.state = PatternState::BreakConfirmed;
                    tracing::debug!(symbol = %self.symbol, high = bar.high, low = bar.low, "Initial break candle captured");
                }
            }
            PatternState::BreakConfirmed => {
                window.bars_since_break += 1;
                if window.bars_since_break >= self.config.trigger_bar {
                    fired = match window.direction {
                        Direction::Bullish => {
                            let threshold = window.first_break_high + trigger_offset;
                            (bar.high >= threshold - PRICE_EPSILON).then_some(threshold)
                        }
                        Direction::Bearish => {
                            let threshold = window.first_break_low - trigger_offset;
                            (bar.low <= threshold + PRICE_EPSILON).then_some(threshold)
                        }
                    };
                }
            }
            _ => {}
        }

        if let Some(trigger_price) = fired {
            let window = self.window.take()?;
            self.state = PatternState::Fired;
            let trigger = PatternTrigger {
                symbol: self.symbol.clone(),
                direction: window.direction,
                trigger_price,
                break_level: level,
                first_break_high: window.first_break_high,
                first_break_low: window.first_break_low,
                fired_at: bar.timestamp,
            };
            tracing::info!(
                symbol = %self.symbol,
                direction = ?trigger.direction,
                trigger_price,
                "Retest trigger fired"
            );
            self.reset();
            return Some(trigger);
        }

        if window.elapsed_bars >= self.config.timeout_bars {
            tracing::info!(
                symbol = %self.symbol,
                elapsed = window.elapsed_bars,
                "Retest window timed out"
            );
            self.reset();
        }

        None
    }

    /// Drop any active window and return to Idle
    pub fn reset(&mut self) {
        self.state = PatternState::Idle;
        self.window = None;
        self.structure_break = None;
    }
}
