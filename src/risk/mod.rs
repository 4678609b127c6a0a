// Position sizing and take-profit mode selection
pub mod performance;
pub mod sizer;

pub use performance::{
    floor_to_week_start, ModeEvaluation, PerformanceConfig, PerformanceModeTracker, TpMode,
    WeeklyPerformanceRecord,
};
pub use sizer::{NoTradeReason, RiskConfig, RiskParameters, RiskSizer, SizingDecision};
