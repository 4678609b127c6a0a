/// Close-price band of recent structure bars
///
/// The band is the lowest and highest close over a lookback window. A close
/// beyond either edge is a break of market structure.

/// Lowest and highest close of a lookback window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CloseBand {
    pub low: f64,
    pub high: f64,
}

impl CloseBand {
    /// Band over `closes`, or None for an empty window
    pub fn from_closes<'a, I>(closes: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a f64>,
    {
        let mut iter = closes.into_iter();
        let first = *iter.next()?;

        Some(iter.fold(
            CloseBand {
                low: first,
                high: first,
            },
            |band, &close| CloseBand {
                low: band.low.min(close),
                high: band.high.max(close),
            },
        ))
    }

    pub fn width(&self) -> f64 {
        self.high - self.low
    }
}
