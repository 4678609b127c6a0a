/// Average True Range (ATR) indicator
///
/// True Range is the greatest of:
/// - Current High - Current Low
/// - Abs(Current High - Previous Close)
/// - Abs(Current Low - Previous Close)
///
/// The volatility gate uses a plain arithmetic mean of the most recent
/// true ranges rather than Wilder's smoothing, so the value only depends
/// on the bars inside the window.
use crate::models::Bar;

/// True range of `bar` given the previous bar's close
pub fn true_range(bar: &Bar, prev_close: f64) -> f64 {
    (bar.high - bar.low)
        .max((bar.high - prev_close).abs())
        .max((bar.low - prev_close).abs())
}

/// True ranges for every bar after the first
pub fn true_ranges(bars: &[Bar]) -> Vec<f64> {
    bars.windows(2)
        .map(|pair| true_range(&pair[1], pair[0].close))
        .collect()
}

/// Simple average of the last `period` true ranges
///
/// Returns None if there are fewer than `period + 1` bars
pub fn average_true_range(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let recent = &bars[bars.len() - (period + 1)..];
    let sum: f64 = true_ranges(recent).iter().sum();

    Some(sum / period as f64)
}
