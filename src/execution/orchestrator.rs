use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::gateway::{ExecutionGateway, GatewayError, OrderRequest};
use crate::error::{BotError, Result};
use crate::events::BotEvent;
use crate::instruments::InstrumentContext;
use crate::models::{Bar, Direction, PatternTrigger};
use crate::resilience::{
    Dependency, ErrorKind, ErrorRecord, ErrorSeverity, ResilienceSupervisor,
};
use crate::risk::{SizingDecision, TpMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PositionPhase {
    /// Original stop in place
    Initial,
    /// Stop moved to entry after the 1:1 checkpoint
    Breakeven,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    /// Stopped out at entry after the breakeven move
    Breakeven,
}

/// An open position being monitored by its instrument worker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagedPosition {
    pub order_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub volume: f64,
    pub entry: f64,
    pub stop: f64,
    pub target: f64,
    /// 1:1 checkpoint, only for extended-mode positions
    pub breakeven_at: Option<f64>,
    pub phase: PositionPhase,
    /// Locked at submission. `manage` never upgrades a standard position
    /// after the instrument switches to extended mode.
    pub mode: TpMode,
    pub opened_at: DateTime<Utc>,
}

impl ManagedPosition {
    fn reached(&self, bar: &Bar, level: f64) -> bool {
        match self.direction {
            Direction::Bullish => bar.high >= level,
            Direction::Bearish => bar.low <= level,
        }
    }

    fn stopped(&self, bar: &Bar) -> bool {
        match self.direction {
            Direction::Bullish => bar.low <= self.stop,
            Direction::Bearish => bar.high >= self.stop,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PositionUpdate {
    Unchanged,
    MovedToBreakeven,
    Closed { reason: CloseReason, exit_price: f64 },
}

/// Stop and target levels for a trade
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeLevels {
    pub stop: f64,
    pub target: f64,
    pub breakeven_at: Option<f64>,
}

/// Place stop and target around `entry`
///
/// The target sits `reward_ratio` stop distances away. Extended positions
/// also get a checkpoint one stop distance away.
pub fn trade_levels(
    direction: Direction,
    entry: f64,
    stop_distance: f64,
    mode: TpMode,
    reward_ratio: f64,
) -> TradeLevels {
    let sign = direction.sign();
    TradeLevels {
        stop: entry - sign * stop_distance,
        target: entry + sign * stop_distance * reward_ratio,
        breakeven_at: match mode {
            TpMode::Extended => Some(entry + sign * stop_distance),
            TpMode::Standard => None,
        },
    }
}

/// Turns a sized trigger into a submitted order and manages it afterwards
///
/// Holds no mutable state; shared by all instrument workers.
pub struct ExecutionOrchestrator {
    gateway: Arc<dyn ExecutionGateway>,
    supervisor: Arc<ResilienceSupervisor>,
}

impl ExecutionOrchestrator {
    pub fn new(gateway: Arc<dyn ExecutionGateway>, supervisor: Arc<ResilienceSupervisor>) -> Self {
        Self {
            gateway,
            supervisor,
        }
    }

    pub fn supervisor(&self) -> &Arc<ResilienceSupervisor> {
        &self.supervisor
    }

    /// Account equity, falling back to `last_known` when the gateway is degraded
    pub async fn account_equity(&self, last_known: Option<f64>) -> Result<f64> {
        self.supervisor
            .call_with_fallback(
                Dependency::ExecutionGateway,
                "account_equity",
                || self.gateway.account_equity(),
                || last_known,
            )
            .await
    }

    /// Audit a skipped trade and tell subscribers why
    pub fn reject_trade(&self, symbol: &str, kind: ErrorKind, reason: String) {
        self.supervisor.record(ErrorRecord::new(
            symbol,
            "execute",
            ErrorSeverity::Low,
            kind,
            reason.clone(),
        ));
        self.supervisor.events().publish(BotEvent::TradeRejected {
            symbol: symbol.to_string(),
            reason,
        });
    }

    /// Submit the order for a fired trigger
    ///
    /// A failed submission is not retried with a new size; the pattern has
    /// to fire again.
    pub async fn execute(
        &self,
        trigger: &PatternTrigger,
        sizing: SizingDecision,
        mode: TpMode,
        reward_ratio: f64,
        instrument: &InstrumentContext,
    ) -> Result<ManagedPosition> {
        let params = match sizing {
            SizingDecision::Trade(params) => params,
            SizingDecision::NoTrade(reason) => {
                let reason = format!("no trade: {}", reason);
                self.reject_trade(&trigger.symbol, ErrorKind::ValidationFailure, reason.clone());
                return Err(BotError::Validation(reason));
            }
        };

        let stop_distance = instrument.to_price(params.stop_distance_pips);
        let levels = trade_levels(
            trigger.direction,
            trigger.trigger_price,
            stop_distance,
            mode,
            reward_ratio,
        );

        let request = OrderRequest {
            client_order_id: Uuid::new_v4(),
            symbol: trigger.symbol.clone(),
            side: trigger.direction.side(),
            volume: params.volume,
            price: trigger.trigger_price,
            stop: levels.stop,
            target: levels.target,
        };

        let ack = match self
            .supervisor
            .call(Dependency::ExecutionGateway, "submit_order", || {
                self.gateway.submit_order(&request)
            })
            .await
        {
            Ok(ack) => ack,
            Err(err) => {
                tracing::warn!(symbol = %trigger.symbol, error = %err, "Order submission failed");
                self.supervisor.events().publish(BotEvent::TradeRejected {
                    symbol: trigger.symbol.clone(),
                    reason: err.to_string(),
                });
                return Err(err);
            }
        };

        if !ack.accepted {
            let source = GatewayError::Rejected(format!("order {} not accepted", ack.order_id));
            self.reject_trade(&trigger.symbol, ErrorKind::DependencyFailure, source.to_string());
            return Err(BotError::DependencyFailure {
                dependency: Dependency::ExecutionGateway,
                operation: "submit_order".to_string(),
                source,
            });
        }

        let entry = if ack.filled_price > 0.0 {
            ack.filled_price
        } else {
            trigger.trigger_price
        };

        let position = ManagedPosition {
            order_id: ack.order_id,
            symbol: trigger.symbol.clone(),
            direction: trigger.direction,
            volume: params.volume,
            entry,
            stop: levels.stop,
            target: levels.target,
            breakeven_at: levels.breakeven_at,
            phase: PositionPhase::Initial,
            mode,
            opened_at: trigger.fired_at,
        };

        tracing::info!(
            symbol = %position.symbol,
            order_id = %position.order_id,
            direction = ?position.direction,
            volume = position.volume,
            entry = position.entry,
            stop = position.stop,
            target = position.target,
            mode = ?mode,
            risk_pct = params.achieved_risk_pct,
            "Order filled"
        );

        self.supervisor.events().publish(BotEvent::TradeOpened {
            symbol: position.symbol.clone(),
            order_id: position.order_id.clone(),
            direction: position.direction,
            volume: position.volume,
            entry: position.entry,
            stop: position.stop,
            target: position.target,
            mode,
        });

        Ok(position)
    }

    /// Apply one confirmation bar to an open position
    ///
    /// The stop is checked before the target when a bar touches both. The
    /// breakeven move is only attempted on bars that close neither.
    pub async fn manage(&self, position: &mut ManagedPosition, bar: &Bar) -> Result<PositionUpdate> {
        if bar.symbol != position.symbol || bar.timestamp <= position.opened_at {
            return Ok(PositionUpdate::Unchanged);
        }

        if position.stopped(bar) {
            let reason = match position.phase {
                PositionPhase::Initial => CloseReason::StopLoss,
                PositionPhase::Breakeven => CloseReason::Breakeven,
            };
            return Ok(PositionUpdate::Closed {
                reason,
                exit_price: position.stop,
            });
        }

        if position.reached(bar, position.target) {
            return Ok(PositionUpdate::Closed {
                reason: CloseReason::TakeProfit,
                exit_price: position.target,
            });
        }

        let Some(checkpoint) = position.breakeven_at else {
            return Ok(PositionUpdate::Unchanged);
        };
        if position.phase != PositionPhase::Initial || !position.reached(bar, checkpoint) {
            return Ok(PositionUpdate::Unchanged);
        }

        let new_stop = position.entry;
        let order_id = position.order_id.clone();
        let moved = self
            .supervisor
            .call(Dependency::ExecutionGateway, "modify_stop", || {
                self.gateway.modify_stop(&order_id, new_stop)
            })
            .await?;

        if !moved {
            tracing::warn!(
                symbol = %position.symbol,
                order_id = %position.order_id,
                "Venue refused breakeven stop move"
            );
            return Ok(PositionUpdate::Unchanged);
        }

        position.stop = new_stop;
        position.phase = PositionPhase::Breakeven;
        tracing::info!(
            symbol = %position.symbol,
            order_id = %position.order_id,
            stop = new_stop,
            "Stop moved to breakeven"
        );
        self.supervisor.events().publish(BotEvent::StopMovedToBreakeven {
            symbol: position.symbol.clone(),
            order_id: position.order_id.clone(),
            stop: new_stop,
        });

        Ok(PositionUpdate::MovedToBreakeven)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::execution::paper::PaperGateway;
    use crate::models::Timeframe;
    use crate::resilience::ResilienceConfig;
    use crate::risk::{NoTradeReason, RiskParameters};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap()
    }

    fn setup() -> (Arc<PaperGateway>, ExecutionOrchestrator, EventBus) {
        let bus = EventBus::default();
        let supervisor = Arc::new(ResilienceSupervisor::new(ResilienceConfig::default(), bus.clone()));
        let gateway = Arc::new(PaperGateway::new(10_000.0));
        let orchestrator = ExecutionOrchestrator::new(gateway.clone(), supervisor);
        (gateway, orchestrator, bus)
    }

    fn trigger(direction: Direction, price: f64) -> PatternTrigger {
        PatternTrigger {
            symbol: "EURUSD".to_string(),
            direction,
            trigger_price: price,
            break_level: price,
            first_break_high: price,
            first_break_low: price,
            fired_at: t0(),
        }
    }

    fn sized(volume: f64, stop_pips: f64) -> SizingDecision {
        SizingDecision::Trade(RiskParameters {
            volatility_pips: stop_pips,
            stop_distance_pips: stop_pips,
            volume,
            risk_amount: 55.0,
            achieved_risk_pct: 0.0055,
        })
    }

    fn bar(minute: i64, high: f64, low: f64) -> Bar {
        Bar {
            symbol: "EURUSD".to_string(),
            timeframe: Timeframe::M1,
            timestamp: t0() + Duration::minutes(minute),
            open: low,
            high,
            low,
            close: high,
            volume: 100.0,
        }
    }

    #[test]
    fn test_trade_levels() {
        let levels = trade_levels(Direction::Bullish, 1.1000, 0.0010, TpMode::Standard, 1.0);
        assert!((levels.stop - 1.0990).abs() < 1e-12);
        assert!((levels.target - 1.1010).abs() < 1e-12);
        assert!(levels.breakeven_at.is_none());

        let levels = trade_levels(Direction::Bearish, 1.1000, 0.0010, TpMode::Extended, 2.0);
        assert!((levels.stop - 1.1010).abs() < 1e-12);
        assert!((levels.target - 1.0980).abs() < 1e-12);
        assert!((levels.breakeven_at.unwrap() - 1.0990).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_execute_standard_trade() {
        let (gateway, orchestrator, bus) = setup();
        let mut events = bus.subscribe();
        let ctx = InstrumentContext::for_symbol("EURUSD");

        let position = orchestrator
            .execute(&trigger(Direction::Bullish, 1.1000), sized(0.55, 10.0), TpMode::Standard, 1.0, &ctx)
            .await
            .unwrap();

        assert_eq!(position.volume, 0.55);
        assert!((position.stop - 1.0990).abs() < 1e-9);
        assert!((position.target - 1.1010).abs() < 1e-9);
        assert_eq!(position.phase, PositionPhase::Initial);
        assert_eq!(gateway.open_orders().len(), 1);
        assert!(matches!(events.recv().await.unwrap(), BotEvent::TradeOpened { .. }));
    }

    #[tokio::test]
    async fn test_no_trade_is_rejected_and_audited() {
        let (gateway, orchestrator, bus) = setup();
        let mut events = bus.subscribe();
        let ctx = InstrumentContext::for_symbol("EURUSD");

        let result = orchestrator
            .execute(
                &trigger(Direction::Bullish, 1.1000),
                SizingDecision::NoTrade(NoTradeReason::VolumeRoundsToZero),
                TpMode::Standard,
                1.0,
                &ctx,
            )
            .await;

        assert!(matches!(result, Err(BotError::Validation(_))));
        assert!(gateway.open_orders().is_empty());
        assert_eq!(
            orchestrator.supervisor().audit_count(ErrorKind::ValidationFailure),
            1
        );
        assert!(matches!(events.recv().await.unwrap(), BotEvent::TradeRejected { .. }));
    }

    #[tokio::test]
    async fn test_venue_rejection_surfaces() {
        let (gateway, orchestrator, _bus) = setup();
        gateway.fail_next(GatewayError::Rejected("market closed".into()));
        let ctx = InstrumentContext::for_symbol("EURUSD");

        let result = orchestrator
            .execute(&trigger(Direction::Bullish, 1.1000), sized(0.55, 10.0), TpMode::Standard, 1.0, &ctx)
            .await;

        assert!(matches!(result, Err(BotError::DependencyFailure { .. })));
        assert!(gateway.open_orders().is_empty());
    }

    #[tokio::test]
    async fn test_extended_position_moves_to_breakeven() {
        let (gateway, orchestrator, _bus) = setup();
        let ctx = InstrumentContext::for_symbol("EURUSD");

        let mut position = orchestrator
            .execute(&trigger(Direction::Bullish, 1.1000), sized(0.5, 10.0), TpMode::Extended, 2.0, &ctx)
            .await
            .unwrap();
        assert!((position.target - 1.1020).abs() < 1e-9);

        let update = orchestrator.manage(&mut position, &bar(1, 1.1005, 1.0995)).await.unwrap();
        assert_eq!(update, PositionUpdate::Unchanged);

        let update = orchestrator.manage(&mut position, &bar(2, 1.1011, 1.1002)).await.unwrap();
        assert_eq!(update, PositionUpdate::MovedToBreakeven);
        assert_eq!(position.phase, PositionPhase::Breakeven);
        assert_eq!(position.stop, 1.1000);
        assert_eq!(gateway.open_orders()[0].stop, 1.1000);

        let update = orchestrator.manage(&mut position, &bar(3, 1.1004, 1.0999)).await.unwrap();
        assert_eq!(
            update,
            PositionUpdate::Closed {
                reason: CloseReason::Breakeven,
                exit_price: 1.1000
            }
        );
    }

    #[tokio::test]
    async fn test_standard_position_hits_target() {
        let (_gateway, orchestrator, _bus) = setup();
        let ctx = InstrumentContext::for_symbol("EURUSD");

        let mut position = orchestrator
            .execute(&trigger(Direction::Bearish, 1.1000), sized(0.5, 10.0), TpMode::Standard, 1.0, &ctx)
            .await
            .unwrap();

        // Same-timestamp bar is the trigger bar itself
        let mut same = bar(0, 1.1000, 1.0980);
        same.timestamp = t0();
        assert_eq!(orchestrator.manage(&mut position, &same).await.unwrap(), PositionUpdate::Unchanged);

        let update = orchestrator.manage(&mut position, &bar(1, 1.1003, 1.0989)).await.unwrap();
        assert_eq!(
            update,
            PositionUpdate::Closed {
                reason: CloseReason::TakeProfit,
                exit_price: position.target
            }
        );
    }

    #[tokio::test]
    async fn test_standard_position_keeps_initial_stop_past_one_to_one() {
        let (gateway, orchestrator, _bus) = setup();
        let ctx = InstrumentContext::for_symbol("EURUSD");

        // Standard mode with a wide target: no breakeven checkpoint is armed
        let mut position = orchestrator
            .execute(&trigger(Direction::Bullish, 1.1000), sized(0.5, 10.0), TpMode::Standard, 2.0, &ctx)
            .await
            .unwrap();
        assert_eq!(position.mode, TpMode::Standard);
        assert!(position.breakeven_at.is_none());
        assert!((position.target - 1.1020).abs() < 1e-9);

        // Past the 1:1 distance, short of the target
        let update = orchestrator.manage(&mut position, &bar(1, 1.1012, 1.1001)).await.unwrap();
        assert_eq!(update, PositionUpdate::Unchanged);
        assert_eq!(position.mode, TpMode::Standard);
        assert_eq!(position.phase, PositionPhase::Initial);
        assert!((position.stop - 1.0990).abs() < 1e-9);
        assert!((gateway.open_orders()[0].stop - 1.0990).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_equity_falls_back_to_last_known() {
        let (gateway, orchestrator, _bus) = setup();
        // Venue errors are Medium: retried, then the fallback is used
        for _ in 0..3 {
            gateway.fail_next(GatewayError::Venue("busy".into()));
        }

        let equity = orchestrator.account_equity(Some(9_800.0)).await.unwrap();
        assert_eq!(equity, 9_800.0);
        assert_eq!(orchestrator.account_equity(None).await.unwrap(), 10_000.0);
    }
}
