// Pattern detection and the pre-trade volatility filter
pub mod pattern;
pub mod volatility_gate;

pub use pattern::{
    PatternConfig, PatternState, PatternStateMachine, RetestWindow, StructureBreak,
    StructureOutcome,
};
pub use volatility_gate::{GateRejection, VolatilityConfig, VolatilityGate, VolatilityReading};
