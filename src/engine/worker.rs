use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::BotError;
use crate::events::{BotEvent, EventBus};
use crate::execution::{BarHistory, ExecutionOrchestrator, ManagedPosition, PositionUpdate};
use crate::instruments::{AssetClass, InstrumentContext};
use crate::models::{Bar, PatternTrigger, Timeframe};
use crate::resilience::ErrorKind;
use crate::risk::{
    PerformanceConfig, PerformanceModeTracker, RiskConfig, RiskSizer, TpMode,
    WeeklyPerformanceRecord,
};
use crate::strategy::{
    GateRejection, PatternConfig, PatternState, PatternStateMachine, StructureOutcome,
    VolatilityConfig, VolatilityGate,
};

/// Everything a worker needs besides its instrument
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub pattern: PatternConfig,
    pub volatility: VolatilityConfig,
    pub risk: RiskConfig,
    pub performance: PerformanceConfig,
    pub structure_timeframe: Timeframe,
    pub confirmation_timeframe: Timeframe,
    pub history_len: usize,
}

pub enum WorkerMessage {
    Bar(Bar),
    /// Broker-reported change of the instrument's properties
    Instrument(InstrumentContext),
    Snapshot(oneshot::Sender<WorkerSnapshot>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerStats {
    pub structure_bars: u64,
    pub confirmation_bars: u64,
    pub triggers: u64,
    pub trades_opened: u64,
    pub trades_closed: u64,
    pub trades_skipped: u64,
}

/// Point-in-time view of one instrument worker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSnapshot {
    pub symbol: String,
    pub asset_class: AssetClass,
    pub pip_size: f64,
    pub pattern_state: PatternState,
    pub tp_mode: TpMode,
    pub weekly: Option<WeeklyPerformanceRecord>,
    pub open_position: Option<ManagedPosition>,
    pub stats: WorkerStats,
}

/// Owns all per-instrument state; runs as one tokio task
pub struct InstrumentWorker {
    instrument: InstrumentContext,
    structure_timeframe: Timeframe,
    confirmation_timeframe: Timeframe,
    pattern: PatternStateMachine,
    history: BarHistory,
    gate: VolatilityGate,
    sizer: RiskSizer,
    tracker: PerformanceModeTracker,
    orchestrator: Arc<ExecutionOrchestrator>,
    events: EventBus,
    position: Option<ManagedPosition>,
    last_equity: Option<f64>,
    stats: WorkerStats,
}

impl InstrumentWorker {
    pub fn new(
        instrument: InstrumentContext,
        settings: WorkerSettings,
        orchestrator: Arc<ExecutionOrchestrator>,
    ) -> Self {
        let gate = VolatilityGate::new(settings.volatility);
        let history_len = settings.history_len.max(gate.bars_required());
        let events = orchestrator.supervisor().events().clone();

        Self {
            pattern: PatternStateMachine::new(&instrument, settings.pattern),
            history: BarHistory::new(history_len),
            gate,
            sizer: RiskSizer::new(settings.risk),
            tracker: PerformanceModeTracker::new(settings.performance),
            structure_timeframe: settings.structure_timeframe,
            confirmation_timeframe: settings.confirmation_timeframe,
            instrument,
            orchestrator,
            events,
            position: None,
            last_equity: None,
            stats: WorkerStats::default(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.instrument.symbol
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            symbol: self.instrument.symbol.clone(),
            asset_class: self.instrument.asset_class,
            pip_size: self.instrument.pip_size,
            pattern_state: self.pattern.state(),
            tp_mode: self.tracker.select_tp_mode(&self.instrument.symbol),
            weekly: self.tracker.snapshot(&self.instrument.symbol),
            open_position: self.position.clone(),
            stats: self.stats.clone(),
        }
    }

    /// Process messages until the channel closes or shutdown is signalled
    ///
    /// An in-flight gateway call is abandoned when shutdown fires.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<WorkerMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::debug!(symbol = %self.instrument.symbol, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                message = rx.recv() => match message {
                    Some(WorkerMessage::Bar(bar)) => {
                        tokio::select! {
                            biased;
                            _ = shutdown.changed() => break,
                            _ = self.on_bar(bar) => {}
                        }
                    }
                    Some(WorkerMessage::Instrument(instrument)) => {
                        self.update_instrument(instrument);
                    }
                    Some(WorkerMessage::Snapshot(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    None => break,
                },
            }
        }

        tracing::debug!(
            symbol = %self.instrument.symbol,
            open_position = self.position.is_some(),
            "Worker stopped"
        );
    }

    /// Swap in refreshed instrument properties
    ///
    /// Open positions keep the levels they were submitted with.
    pub fn update_instrument(&mut self, instrument: InstrumentContext) {
        if instrument.symbol != self.instrument.symbol {
            return;
        }
        tracing::info!(
            symbol = %instrument.symbol,
            pip_size = instrument.pip_size,
            contract_size = instrument.contract_size,
            "Instrument properties updated"
        );
        self.pattern.update_instrument(&instrument);
        self.instrument = instrument;
    }

    /// Apply one closed bar
    pub async fn on_bar(&mut self, bar: Bar) {
        if bar.symbol != self.instrument.symbol {
            tracing::warn!(
                worker = %self.instrument.symbol,
                symbol = %bar.symbol,
                "Bar routed to the wrong worker"
            );
            return;
        }

        if bar.timeframe == self.structure_timeframe {
            self.on_structure_bar(&bar);
        } else if bar.timeframe == self.confirmation_timeframe {
            self.on_confirmation_bar(bar).await;
        } else {
            tracing::trace!(symbol = %bar.symbol, timeframe = %bar.timeframe, "Ignoring bar timeframe");
        }
    }

    fn on_structure_bar(&mut self, bar: &Bar) {
        match self.pattern.on_higher_timeframe_bar(bar) {
            StructureOutcome::Broken(direction) => {
                self.stats.structure_bars += 1;
                tracing::info!(
                    symbol = %bar.symbol,
                    direction = ?direction,
                    close = bar.close,
                    "Structure break, retest window armed"
                );
            }
            StructureOutcome::InsufficientHistory => {
                self.stats.structure_bars += 1;
                tracing::debug!(symbol = %bar.symbol, "Not enough structure bars yet");
            }
            StructureOutcome::NoBreak => self.stats.structure_bars += 1,
            StructureOutcome::Duplicate => {}
        }
    }

    async fn on_confirmation_bar(&mut self, bar: Bar) {
        if !self.history.push(bar.clone()) {
            return;
        }
        self.stats.confirmation_bars += 1;

        self.manage_position(&bar).await;

        if let Some(trigger) = self.pattern.on_lower_timeframe_bar(&bar) {
            self.on_trigger(trigger).await;
        }
    }

    async fn manage_position(&mut self, bar: &Bar) {
        let Some(position) = self.position.as_mut() else {
            return;
        };

        match self.orchestrator.manage(position, bar).await {
            Ok(PositionUpdate::Closed { reason, exit_price }) => {
                tracing::info!(
                    symbol = %bar.symbol,
                    order_id = %position.order_id,
                    reason = ?reason,
                    exit_price,
                    "Position closed"
                );
                self.position = None;
                self.stats.trades_closed += 1;
                self.refresh_mode(bar.timestamp).await;
            }
            Ok(PositionUpdate::MovedToBreakeven) | Ok(PositionUpdate::Unchanged) => {}
            Err(err) => {
                tracing::warn!(symbol = %bar.symbol, error = %err, "Position management failed");
            }
        }
    }

    /// Re-read equity after a close so the weekly mode reflects realised P&L
    async fn refresh_mode(&mut self, now: DateTime<Utc>) {
        let equity = match self.orchestrator.account_equity(self.last_equity).await {
            Ok(equity) => equity,
            Err(err) => {
                tracing::warn!(symbol = %self.instrument.symbol, error = %err, "Equity refresh failed");
                return;
            }
        };
        self.last_equity = Some(equity);
        self.evaluate_mode(equity, now);
    }

    fn evaluate_mode(&mut self, equity: f64, now: DateTime<Utc>) -> TpMode {
        let evaluation = self.tracker.evaluate(&self.instrument.symbol, equity, now);
        if evaluation.activated {
            self.events.publish(BotEvent::ExtendedModeActivated {
                symbol: self.instrument.symbol.clone(),
                weekly_profit_pct: evaluation.weekly_profit_pct,
            });
        }
        evaluation.mode
    }

    fn skip(&mut self, kind: ErrorKind, reason: String) {
        self.stats.trades_skipped += 1;
        tracing::info!(symbol = %self.instrument.symbol, reason = %reason, "Trigger skipped");
        self.orchestrator
            .reject_trade(&self.instrument.symbol, kind, reason);
    }

    async fn on_trigger(&mut self, trigger: PatternTrigger) {
        self.stats.triggers += 1;
        tracing::info!(
            symbol = %trigger.symbol,
            direction = ?trigger.direction,
            trigger_price = trigger.trigger_price,
            "Pattern trigger fired"
        );
        self.events.publish(BotEvent::TriggerFired(trigger.clone()));

        if self.position.is_some() {
            self.skip(ErrorKind::ValidationFailure, "position already open".to_string());
            return;
        }

        let bars = self.history.recent(self.gate.bars_required());
        let reading = self.gate.evaluate(&self.instrument, &bars);
        if let Some(rejection) = reading.rejection {
            let (kind, reason) = match rejection {
                GateRejection::InsufficientHistory => (
                    ErrorKind::DataGap,
                    BotError::DataGap {
                        symbol: self.instrument.symbol.clone(),
                        needed: self.gate.bars_required(),
                        available: bars.len(),
                    }
                    .to_string(),
                ),
                GateRejection::TooQuiet | GateRejection::TooVolatile => (
                    ErrorKind::ValidationFailure,
                    format!(
                        "volatility {:.2} pips outside gate ({:?})",
                        reading.volatility_pips, rejection
                    ),
                ),
            };
            self.skip(kind, reason);
            return;
        }

        let equity = match self.orchestrator.account_equity(self.last_equity).await {
            Ok(equity) => equity,
            Err(err) => {
                tracing::warn!(symbol = %trigger.symbol, error = %err, "Equity unavailable, trigger dropped");
                self.stats.trades_skipped += 1;
                self.events.publish(BotEvent::TradeRejected {
                    symbol: trigger.symbol.clone(),
                    reason: err.to_string(),
                });
                return;
            }
        };
        self.last_equity = Some(equity);

        let mode = self.evaluate_mode(equity, trigger.fired_at);
        let reward_ratio = self.tracker.reward_ratio(mode);
        let sizing = self.sizer.size(
            equity,
            self.sizer.risk_fraction(),
            reading.volatility_pips,
            trigger.trigger_price,
            &self.instrument,
        );

        match self
            .orchestrator
            .execute(&trigger, sizing, mode, reward_ratio, &self.instrument)
            .await
        {
            Ok(position) => {
                self.tracker
                    .register_trade(&self.instrument.symbol, equity, trigger.fired_at);
                self.stats.trades_opened += 1;
                self.position = Some(position);
            }
            Err(err) if err.is_local() => {
                self.stats.trades_skipped += 1;
                tracing::info!(symbol = %trigger.symbol, reason = %err, "Trade not placed");
            }
            Err(err) => {
                self.stats.trades_skipped += 1;
                tracing::error!(symbol = %trigger.symbol, error = %err, "Trade submission failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::PaperGateway;
    use crate::resilience::{ResilienceConfig, ResilienceSupervisor};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            pattern: PatternConfig {
                lookback: 3,
                ..PatternConfig::default()
            },
            volatility: VolatilityConfig::default(),
            risk: RiskConfig::default(),
            performance: PerformanceConfig::default(),
            structure_timeframe: Timeframe::H1,
            confirmation_timeframe: Timeframe::M1,
            history_len: 64,
        }
    }

    fn worker(gateway: Arc<PaperGateway>, bus: EventBus) -> InstrumentWorker {
        let supervisor = Arc::new(ResilienceSupervisor::new(ResilienceConfig::default(), bus));
        let orchestrator = Arc::new(ExecutionOrchestrator::new(gateway, supervisor));
        InstrumentWorker::new(InstrumentContext::for_symbol("EURUSD"), settings(), orchestrator)
    }

    fn hourly(hour: i64, close: f64) -> Bar {
        Bar {
            symbol: "EURUSD".to_string(),
            timeframe: Timeframe::H1,
            timestamp: t0() + Duration::hours(hour),
            open: close,
            high: close + 0.0005,
            low: close - 0.0005,
            close,
            volume: 1_000.0,
        }
    }

    fn minute(minute: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            symbol: "EURUSD".to_string(),
            timeframe: Timeframe::M1,
            timestamp: t0() + Duration::minutes(minute),
            open,
            high,
            low,
            close,
            volume: 10.0,
        }
    }

    /// 20 quiet minute bars with a 6 pip true range
    async fn warm_up(worker: &mut InstrumentWorker) {
        for i in 1..=20 {
            worker.on_bar(minute(i, 1.0998, 1.1001, 1.0995, 1.0998)).await;
        }
    }

    /// Structure break up through the 1.0993 band high
    async fn structure_break(worker: &mut InstrumentWorker) {
        for h in 1..=3 {
            worker.on_bar(hourly(h, 1.0990 + h as f64 * 0.0001)).await;
        }
        worker.on_bar(hourly(4, 1.1010)).await;
        assert_eq!(worker.pattern.state(), PatternState::AwaitingInitialBreak);
    }

    /// First break candle, a pause, then a third bar through 1.0998 + 0.6 pips
    fn retest_bars() -> [Bar; 3] {
        [
            minute(241, 1.0992, 1.0998, 1.0991, 1.0996),
            minute(242, 1.0996, 1.0998, 1.0992, 1.0995),
            minute(243, 1.0995, 1.0999, 1.0993, 1.0997),
        ]
    }

    async fn fire(worker: &mut InstrumentWorker) {
        structure_break(worker).await;
        for bar in retest_bars() {
            worker.on_bar(bar).await;
        }
    }

    #[tokio::test]
    async fn test_full_cycle_opens_position() {
        let gateway = Arc::new(PaperGateway::new(10_000.0));
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let mut worker = worker(gateway.clone(), bus);

        warm_up(&mut worker).await;
        fire(&mut worker).await;

        let snapshot = worker.snapshot();
        assert_eq!(snapshot.pattern_state, PatternState::Idle);
        assert_eq!(snapshot.stats.triggers, 1);
        assert_eq!(snapshot.stats.trades_opened, 1);
        let position = snapshot.open_position.expect("position opened");
        assert_eq!(position.mode, TpMode::Standard);
        assert!((position.entry - 1.09986).abs() < 1e-9);
        assert!(position.stop < position.entry && position.target > position.entry);
        assert_eq!(gateway.open_orders().len(), 1);
        assert_eq!(snapshot.weekly.unwrap().trade_count, 1);

        assert!(matches!(events.recv().await.unwrap(), BotEvent::TriggerFired(_)));
        assert!(matches!(events.recv().await.unwrap(), BotEvent::TradeOpened { .. }));
    }

    #[tokio::test]
    async fn test_trigger_without_history_is_skipped() {
        let gateway = Arc::new(PaperGateway::new(10_000.0));
        let mut worker = worker(gateway.clone(), EventBus::default());

        fire(&mut worker).await;

        let snapshot = worker.snapshot();
        assert_eq!(snapshot.stats.triggers, 1);
        assert_eq!(snapshot.stats.trades_skipped, 1);
        assert!(snapshot.open_position.is_none());
        assert!(gateway.open_orders().is_empty());
        assert_eq!(
            worker.orchestrator.supervisor().audit_count(ErrorKind::DataGap),
            1
        );
    }

    #[tokio::test]
    async fn test_duplicate_bars_do_not_double_fire() {
        let gateway = Arc::new(PaperGateway::new(10_000.0));
        let mut worker = worker(gateway.clone(), EventBus::default());

        warm_up(&mut worker).await;
        structure_break(&mut worker).await;
        for bar in retest_bars() {
            worker.on_bar(bar.clone()).await;
            worker.on_bar(bar).await;
        }

        let snapshot = worker.snapshot();
        assert_eq!(snapshot.stats.triggers, 1);
        assert_eq!(snapshot.stats.confirmation_bars, 23);
        assert_eq!(gateway.open_orders().len(), 1);
    }

    #[tokio::test]
    async fn test_position_closed_at_target() {
        let gateway = Arc::new(PaperGateway::new(10_000.0));
        let mut worker = worker(gateway.clone(), EventBus::default());

        warm_up(&mut worker).await;
        fire(&mut worker).await;
        let target = worker.snapshot().open_position.unwrap().target;

        let exit_bar = minute(244, 1.0998, target + 0.0001, 1.0997, target);
        gateway.mark(&exit_bar);
        worker.on_bar(exit_bar).await;

        let snapshot = worker.snapshot();
        assert!(snapshot.open_position.is_none());
        assert_eq!(snapshot.stats.trades_closed, 1);
        assert!(gateway.equity() > 10_000.0);
        assert!(snapshot.weekly.unwrap().weekly_profit_pct > 0.0);
    }

    #[tokio::test]
    async fn test_instrument_refresh_changes_sizing_inputs() {
        let gateway = Arc::new(PaperGateway::new(10_000.0));
        let mut worker = worker(gateway, EventBus::default());

        let mut ctx = InstrumentContext::for_symbol("EURUSD");
        ctx.pip_size = 0.001;
        worker.update_instrument(ctx);
        assert_eq!(worker.snapshot().pip_size, 0.001);

        // Another symbol's context is ignored
        worker.update_instrument(InstrumentContext::for_symbol("GBPUSD"));
        assert_eq!(worker.symbol(), "EURUSD");
        assert_eq!(worker.instrument.pip_size, 0.001);
    }

    #[tokio::test]
    async fn test_ignores_foreign_symbol() {
        let gateway = Arc::new(PaperGateway::new(10_000.0));
        let mut worker = worker(gateway, EventBus::default());

        let mut bar = minute(1, 1.0, 1.0, 1.0, 1.0);
        bar.symbol = "GBPUSD".to_string();
        worker.on_bar(bar).await;

        assert_eq!(worker.snapshot().stats.confirmation_bars, 0);
    }
}
