// Core modules
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod execution;
pub mod feed;
pub mod indicators;
pub mod instruments;
pub mod models;
pub mod resilience;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use config::BotConfig;
pub use error::{BotError, Result};
pub use models::*;
