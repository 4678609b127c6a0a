/// Weekly performance tracking and take-profit mode selection
///
/// Each instrument carries a weekly record. Once the week's profit crosses
/// the threshold the instrument switches to the extended 1:2 target and
/// stays there until the next weekly boundary.
use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Weekly profit fraction that activates extended mode
    pub profit_threshold: f64,
    pub week_start_day: Weekday,
    pub week_start_hour_utc: u32,
    pub standard_reward_ratio: f64,
    pub extended_reward_ratio: f64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            profit_threshold: 0.10,
            week_start_day: Weekday::Mon,
            week_start_hour_utc: 0,
            standard_reward_ratio: 1.0,
            extended_reward_ratio: 2.0,
        }
    }
}

/// Take-profit mode of an instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TpMode {
    /// 1:1 risk:reward
    Standard,
    /// 1:2 risk:reward with a breakeven move at 1:1
    Extended,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyPerformanceRecord {
    pub symbol: String,
    pub week_start: DateTime<Utc>,
    pub starting_equity: f64,
    pub weekly_profit_pct: f64,
    pub extended_mode: bool,
    pub trade_count: u32,
}

impl WeeklyPerformanceRecord {
    fn new(symbol: &str, week_start: DateTime<Utc>, starting_equity: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            week_start,
            starting_equity,
            weekly_profit_pct: 0.0,
            extended_mode: false,
            trade_count: 0,
        }
    }
}

/// Result of one evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModeEvaluation {
    pub mode: TpMode,
    pub weekly_profit_pct: f64,
    /// Extended mode was switched on by this evaluation
    pub activated: bool,
    /// A new week started with this evaluation
    pub week_reset: bool,
}

/// Start of the trading week containing `now`
pub fn floor_to_week_start(now: DateTime<Utc>, day: Weekday, hour: u32) -> DateTime<Utc> {
    let date = now.date_naive();
    let days_back =
        (date.weekday().num_days_from_monday() + 7 - day.num_days_from_monday()) % 7;
    let time = NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or_default();
    let start = Utc.from_utc_datetime(&(date - Duration::days(days_back as i64)).and_time(time));

    if start > now {
        start - Duration::days(7)
    } else {
        start
    }
}

pub struct PerformanceModeTracker {
    config: PerformanceConfig,
    records: HashMap<String, WeeklyPerformanceRecord>,
}

impl PerformanceModeTracker {
    pub fn new(config: PerformanceConfig) -> Self {
        Self {
            config,
            records: HashMap::new(),
        }
    }

    fn week_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        floor_to_week_start(now, self.config.week_start_day, self.config.week_start_hour_utc)
    }

    /// Update the weekly record of `symbol` with the current equity
    pub fn evaluate(&mut self, symbol: &str, equity: f64, now: DateTime<Utc>) -> ModeEvaluation {
        let week_start = self.week_start(now);
        let threshold = self.config.profit_threshold;
        let mut week_reset = false;

        let record = self
            .records
            .entry(symbol.to_string())
            .or_insert_with(|| WeeklyPerformanceRecord::new(symbol, week_start, equity));

        if week_start > record.week_start {
            tracing::info!(
                symbol = %symbol,
                previous_profit_pct = record.weekly_profit_pct,
                was_extended = record.extended_mode,
                "Weekly boundary crossed, resetting performance record"
            );
            *record = WeeklyPerformanceRecord::new(symbol, week_start, equity);
            week_reset = true;
        }

        if record.starting_equity > 0.0 {
            record.weekly_profit_pct = (equity - record.starting_equity) / record.starting_equity;
        }

        let mut activated = false;
        if !record.extended_mode && record.weekly_profit_pct >= threshold {
            record.extended_mode = true;
            activated = true;
            tracing::info!(
                symbol = %symbol,
                weekly_profit_pct = record.weekly_profit_pct,
                "Weekly profit threshold reached, extended target mode on"
            );
        }

        ModeEvaluation {
            mode: mode_of(record),
            weekly_profit_pct: record.weekly_profit_pct,
            activated,
            week_reset,
        }
    }

    /// Count an opened trade against this week's record
    pub fn register_trade(&mut self, symbol: &str, equity: f64, now: DateTime<Utc>) {
        self.evaluate(symbol, equity, now);
        if let Some(record) = self.records.get_mut(symbol) {
            record.trade_count += 1;
        }
    }

    pub fn select_tp_mode(&self, symbol: &str) -> TpMode {
        self.records
            .get(symbol)
            .map(mode_of)
            .unwrap_or(TpMode::Standard)
    }

    pub fn reward_ratio(&self, mode: TpMode) -> f64 {
        match mode {
            TpMode::Standard => self.config.standard_reward_ratio,
            TpMode::Extended => self.config.extended_reward_ratio,
        }
    }

    /// Copy of the current record
    pub fn snapshot(&self, symbol: &str) -> Option<WeeklyPerformanceRecord> {
        self.records.get(symbol).cloned()
    }
}

fn mode_of(record: &WeeklyPerformanceRecord) -> TpMode {
    if record.extended_mode {
        TpMode::Extended
    } else {
        TpMode::Standard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        // March 2024: the 4th and 11th are Mondays
        Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_floor_to_monday() {
        assert_eq!(floor_to_week_start(at(6, 15), Weekday::Mon, 0), at(4, 0));
        assert_eq!(floor_to_week_start(at(4, 0), Weekday::Mon, 0), at(4, 0));
        assert_eq!(floor_to_week_start(at(10, 23), Weekday::Mon, 0), at(4, 0));
        assert_eq!(floor_to_week_start(at(11, 0), Weekday::Mon, 0), at(11, 0));
    }

    #[test]
    fn test_custom_week_boundary() {
        // Sunday 22:00 UTC boundary
        assert_eq!(floor_to_week_start(at(10, 21), Weekday::Sun, 22), at(3, 22));
        assert_eq!(floor_to_week_start(at(10, 22), Weekday::Sun, 22), at(10, 22));
        assert_eq!(floor_to_week_start(at(6, 12), Weekday::Sun, 22), at(3, 22));
    }

    #[test]
    fn test_standard_until_threshold() {
        let mut tracker = PerformanceModeTracker::new(PerformanceConfig::default());
        assert_eq!(tracker.select_tp_mode("EURUSD"), TpMode::Standard);

        let eval = tracker.evaluate("EURUSD", 10_000.0, at(4, 9));
        assert_eq!(eval.mode, TpMode::Standard);

        let eval = tracker.evaluate("EURUSD", 10_900.0, at(5, 9));
        assert_eq!(eval.mode, TpMode::Standard);
        assert!((eval.weekly_profit_pct - 0.09).abs() < 1e-9);
    }

    #[test]
    fn test_extended_mode_is_sticky_within_week() {
        let mut tracker = PerformanceModeTracker::new(PerformanceConfig::default());
        tracker.evaluate("EURUSD", 10_000.0, at(4, 9));

        let eval = tracker.evaluate("EURUSD", 11_000.0, at(5, 9));
        assert!(eval.activated);
        assert_eq!(eval.mode, TpMode::Extended);

        // Giving back profit does not leave extended mode
        let eval = tracker.evaluate("EURUSD", 10_200.0, at(7, 9));
        assert!(!eval.activated);
        assert_eq!(eval.mode, TpMode::Extended);
        assert_eq!(tracker.select_tp_mode("EURUSD"), TpMode::Extended);
    }

    #[test]
    fn test_weekly_reset_clears_extended_mode() {
        let mut tracker = PerformanceModeTracker::new(PerformanceConfig::default());
        tracker.evaluate("EURUSD", 10_000.0, at(4, 9));
        tracker.evaluate("EURUSD", 12_000.0, at(8, 20));
        assert_eq!(tracker.select_tp_mode("EURUSD"), TpMode::Extended);

        let eval = tracker.evaluate("EURUSD", 12_000.0, at(11, 1));
        assert!(eval.week_reset);
        assert_eq!(eval.mode, TpMode::Standard);

        let record = tracker.snapshot("EURUSD").unwrap();
        assert_eq!(record.week_start, at(11, 0));
        assert_eq!(record.starting_equity, 12_000.0);
        assert!(!record.extended_mode);
    }

    #[test]
    fn test_records_are_per_instrument() {
        let mut tracker = PerformanceModeTracker::new(PerformanceConfig::default());
        tracker.evaluate("EURUSD", 10_000.0, at(4, 9));
        tracker.evaluate("XAUUSD", 11_000.0, at(4, 9));
        tracker.evaluate("EURUSD", 11_000.0, at(5, 9));

        assert_eq!(tracker.select_tp_mode("EURUSD"), TpMode::Extended);
        assert_eq!(tracker.select_tp_mode("XAUUSD"), TpMode::Standard);
    }

    #[test]
    fn test_register_trade_counts() {
        let mut tracker = PerformanceModeTracker::new(PerformanceConfig::default());
        tracker.register_trade("EURUSD", 10_000.0, at(4, 9));
        tracker.register_trade("EURUSD", 10_050.0, at(4, 12));

        let record = tracker.snapshot("EURUSD").unwrap();
        assert_eq!(record.trade_count, 2);
        assert_eq!(record.starting_equity, 10_000.0);
    }

    #[test]
    fn test_reward_ratios() {
        let tracker = PerformanceModeTracker::new(PerformanceConfig::default());
        assert_eq!(tracker.reward_ratio(TpMode::Standard), 1.0);
        assert_eq!(tracker.reward_ratio(TpMode::Extended), 2.0);
    }
}
