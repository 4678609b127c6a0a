use std::collections::VecDeque;

use crate::models::Bar;

/// Rolling window of closed bars for one instrument and timeframe
///
/// Owned by a single instrument worker, so no locking is needed. Bars
/// arriving out of order or twice are rejected by timestamp.
#[derive(Debug, Clone)]
pub struct BarHistory {
    bars: VecDeque<Bar>,
    max_bars: usize,
}

impl BarHistory {
    /// Create a new history
    ///
    /// # Arguments
    /// * `max_bars` - Maximum number of bars to keep
    pub fn new(max_bars: usize) -> Self {
        Self {
            bars: VecDeque::with_capacity(max_bars.max(1)),
            max_bars: max_bars.max(1),
        }
    }

    /// Append a bar, dropping the oldest when full
    ///
    /// Returns false (and keeps nothing) if the bar is not newer than the
    /// last accepted one.
    pub fn push(&mut self, bar: Bar) -> bool {
        if let Some(last) = self.bars.back() {
            if bar.timestamp <= last.timestamp {
                tracing::debug!(
                    symbol = %bar.symbol,
                    timestamp = %bar.timestamp,
                    "Ignoring stale or duplicate bar"
                );
                return false;
            }
        }

        self.bars.push_back(bar);
        while self.bars.len() > self.max_bars {
            self.bars.pop_front();
        }
        true
    }

    /// The N most recent bars, oldest first
    pub fn recent(&self, n: usize) -> Vec<Bar> {
        let skip = self.bars.len().saturating_sub(n);
        self.bars.iter().skip(skip).cloned().collect()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.back()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn clear(&mut self) {
        self.bars.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Timeframe;
    use chrono::{Duration, TimeZone, Utc};

    fn bar(minute: i64, close: f64) -> Bar {
        Bar {
            symbol: "EURUSD".to_string(),
            timeframe: Timeframe::M1,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap()
                + Duration::minutes(minute),
            open: close,
            high: close,
            low: close,
            close,
            volume: 100.0,
        }
    }

    #[test]
    fn test_new_history() {
        let history = BarHistory::new(50);
        assert!(history.is_empty());
        assert!(history.last().is_none());
    }

    #[test]
    fn test_max_bars_limit() {
        let mut history = BarHistory::new(5);
        for i in 0..10 {
            assert!(history.push(bar(i, 1.1000 + i as f64 * 0.0001)));
        }

        assert_eq!(history.len(), 5);
        let bars = history.recent(5);
        assert_eq!(bars[0].timestamp, bar(5, 0.0).timestamp);
        assert_eq!(bars[4].timestamp, bar(9, 0.0).timestamp);
    }

    #[test]
    fn test_recent_returns_tail_in_order() {
        let mut history = BarHistory::new(100);
        for i in 0..10 {
            history.push(bar(i, i as f64));
        }

        let recent = history.recent(3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].close, 7.0);
        assert_eq!(recent[2].close, 9.0);

        // Asking for more than available returns everything
        assert_eq!(history.recent(50).len(), 10);
    }

    #[test]
    fn test_rejects_duplicate_and_stale_bars() {
        let mut history = BarHistory::new(10);
        assert!(history.push(bar(1, 1.0)));
        assert!(!history.push(bar(1, 2.0)));
        assert!(!history.push(bar(0, 3.0)));

        assert_eq!(history.len(), 1);
        assert_eq!(history.last().unwrap().close, 1.0);
    }

    #[test]
    fn test_clear() {
        let mut history = BarHistory::new(10);
        history.push(bar(1, 1.0));
        history.clear();
        assert!(history.is_empty());
        assert!(history.push(bar(0, 1.0)));
    }
}
