// Order execution and post-submission management
pub mod bar_buffer;
pub mod gateway;
pub mod orchestrator;
pub mod paper;

pub use bar_buffer::BarHistory;
pub use gateway::{ExecutionGateway, GatewayError, OrderAck, OrderRequest};
pub use orchestrator::{
    trade_levels, CloseReason, ExecutionOrchestrator, ManagedPosition, PositionPhase,
    PositionUpdate, TradeLevels,
};
pub use paper::{PaperExit, PaperGateway, PaperOrder};
