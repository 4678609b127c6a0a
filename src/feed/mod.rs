//! Market data sources
//!
//! A [`BarSource`] delivers closed bars in batches. Live adapters sit behind
//! the same trait as the seeded synthetic replay used by the binary.
pub mod synthetic;

pub use synthetic::{MarketScenario, SyntheticBarGenerator, SyntheticFeed};

use async_trait::async_trait;

use crate::execution::GatewayError;
use crate::models::Bar;

#[async_trait]
pub trait BarSource: Send + Sync {
    /// Next batch of closed bars in delivery order; empty once exhausted
    async fn poll_bars(&self) -> Result<Vec<Bar>, GatewayError>;
}
