use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{Direction, PatternTrigger};
use crate::resilience::Dependency;
use crate::risk::TpMode;

/// Events published for external monitoring
#[derive(Debug, Clone, Serialize, PartialEq)]
pub enum BotEvent {
    TriggerFired(PatternTrigger),
    TradeRejected {
        symbol: String,
        reason: String,
    },
    TradeOpened {
        symbol: String,
        order_id: String,
        direction: Direction,
        volume: f64,
        entry: f64,
        stop: f64,
        target: f64,
        mode: TpMode,
    },
    StopMovedToBreakeven {
        symbol: String,
        order_id: String,
        stop: f64,
    },
    ExtendedModeActivated {
        symbol: String,
        weekly_profit_pct: f64,
    },
    CircuitOpened {
        component: Dependency,
    },
    RestartRequested {
        component: Dependency,
    },
    ManualInterventionRequired {
        component: Dependency,
        error_id: Uuid,
    },
}

/// Fan-out channel for [`BotEvent`]s
///
/// Publishing never blocks; events are dropped when nobody subscribes.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BotEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: BotEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("No event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BotEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
