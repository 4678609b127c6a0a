// Technical indicators module
// True range / ATR for the volatility gate, close band for structure breaks

pub mod atr;
pub mod structure;

pub use atr::{average_true_range, true_range, true_ranges};
pub use structure::CloseBand;
