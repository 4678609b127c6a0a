//! Per-instrument actors
//!
//! The [`Engine`] routes each bar to the task owning its symbol, spawning
//! the task on first sight. Workers share nothing but the orchestrator and
//! the resilience supervisor behind it.
pub mod worker;

pub use worker::{InstrumentWorker, WorkerMessage, WorkerSettings, WorkerSnapshot, WorkerStats};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;

use crate::error::{BotError, Result};
use crate::execution::ExecutionOrchestrator;
use crate::instruments::{InstrumentContext, PipValueResolver};
use crate::models::{Bar, Timeframe};
use crate::risk::{PerformanceConfig, RiskConfig};
use crate::strategy::{PatternConfig, VolatilityConfig};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub structure_timeframe: Timeframe,
    pub confirmation_timeframe: Timeframe,
    /// Bars queued per worker before new ones are dropped
    pub bar_buffer: usize,
    /// Confirmation bars kept per worker
    pub history_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            structure_timeframe: Timeframe::H1,
            confirmation_timeframe: Timeframe::M1,
            bar_buffer: 16,
            history_len: 64,
        }
    }
}

/// Whether a bar reached its worker's queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    Queued,
    Dropped,
}

struct WorkerHandle {
    tx: mpsc::Sender<WorkerMessage>,
}

pub struct Engine {
    config: EngineConfig,
    pattern: PatternConfig,
    volatility: VolatilityConfig,
    risk: RiskConfig,
    performance: PerformanceConfig,
    resolver: PipValueResolver,
    orchestrator: Arc<ExecutionOrchestrator>,
    workers: HashMap<String, WorkerHandle>,
    tasks: JoinSet<()>,
    shutdown: watch::Sender<bool>,
    dropped: u64,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        pattern: PatternConfig,
        volatility: VolatilityConfig,
        risk: RiskConfig,
        performance: PerformanceConfig,
        resolver: PipValueResolver,
        orchestrator: Arc<ExecutionOrchestrator>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            pattern,
            volatility,
            risk,
            performance,
            resolver,
            orchestrator,
            workers: HashMap::new(),
            tasks: JoinSet::new(),
            shutdown,
            dropped: 0,
        }
    }

    pub fn orchestrator(&self) -> &Arc<ExecutionOrchestrator> {
        &self.orchestrator
    }

    /// Bars dropped because a worker queue was full
    pub fn dropped_bars(&self) -> u64 {
        self.dropped
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<_> = self.workers.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            pattern: self.pattern.clone(),
            volatility: self.volatility.clone(),
            risk: self.risk.clone(),
            performance: self.performance.clone(),
            structure_timeframe: self.config.structure_timeframe,
            confirmation_timeframe: self.config.confirmation_timeframe,
            history_len: self.config.history_len,
        }
    }

    /// Sender for the worker owning `symbol`, which must be uppercase
    fn sender(&mut self, symbol: &str) -> mpsc::Sender<WorkerMessage> {
        if let Some(handle) = self.workers.get(symbol) {
            return handle.tx.clone();
        }

        let instrument = self.resolver.context(symbol).clone();
        tracing::info!(
            symbol = %symbol,
            asset_class = ?instrument.asset_class,
            pip_size = instrument.pip_size,
            "Spawning instrument worker"
        );

        let (tx, rx) = mpsc::channel(self.config.bar_buffer.max(1));
        let worker = InstrumentWorker::new(instrument, self.worker_settings(), self.orchestrator.clone());
        self.tasks.spawn(worker.run(rx, self.shutdown.subscribe()));
        self.workers
            .insert(symbol.to_string(), WorkerHandle { tx: tx.clone() });
        tx
    }

    /// Queue a bar without waiting; a full queue drops the bar
    pub fn ingest(&mut self, mut bar: Bar) -> Ingest {
        bar.symbol = bar.symbol.to_uppercase();
        let tx = self.sender(&bar.symbol);
        match tx.try_send(WorkerMessage::Bar(bar)) {
            Ok(()) => Ingest::Queued,
            Err(TrySendError::Full(WorkerMessage::Bar(bar))) => {
                self.dropped += 1;
                tracing::warn!(
                    symbol = %bar.symbol,
                    timeframe = %bar.timeframe,
                    timestamp = %bar.timestamp,
                    "Worker queue full, bar dropped"
                );
                Ingest::Dropped
            }
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                Ingest::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped += 1;
                tracing::warn!("Worker stopped, bar dropped");
                Ingest::Dropped
            }
        }
    }

    /// Queue a bar, waiting for room in the worker's queue
    ///
    /// Used for replays where every bar must be processed.
    pub async fn replay(&mut self, mut bar: Bar) -> Result<()> {
        bar.symbol = bar.symbol.to_uppercase();
        let symbol = bar.symbol.clone();
        let tx = self.sender(&symbol);
        tx.send(WorkerMessage::Bar(bar))
            .await
            .map_err(|_| BotError::WorkerUnavailable(symbol))
    }

    /// Cache a broker-reported instrument change and pass it to its worker
    ///
    /// Unusable properties are rejected and the cached context is kept.
    pub async fn refresh_instrument(&mut self, instrument: InstrumentContext) -> Result<()> {
        instrument.validate().map_err(BotError::Validation)?;
        let instrument = self.resolver.refresh(instrument).clone();
        let Some(handle) = self.workers.get(&instrument.symbol) else {
            return Ok(());
        };
        let symbol = instrument.symbol.clone();
        handle
            .tx
            .send(WorkerMessage::Instrument(instrument))
            .await
            .map_err(|_| BotError::WorkerUnavailable(symbol))
    }

    /// Ask one worker for its state
    ///
    /// Answered after every bar queued before the request.
    pub async fn snapshot(&self, symbol: &str) -> Result<WorkerSnapshot> {
        let symbol = symbol.to_uppercase();
        let handle = self
            .workers
            .get(&symbol)
            .ok_or_else(|| BotError::WorkerUnavailable(symbol.clone()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .tx
            .send(WorkerMessage::Snapshot(reply_tx))
            .await
            .map_err(|_| BotError::WorkerUnavailable(symbol.clone()))?;
        reply_rx
            .await
            .map_err(|_| BotError::WorkerUnavailable(symbol))
    }

    /// Wait until the worker for `symbol` has handled everything queued so far
    pub async fn flush(&self, symbol: &str) -> Result<()> {
        self.snapshot(symbol).await.map(|_| ())
    }

    /// Snapshots of all running workers, sorted by symbol
    pub async fn snapshot_all(&self) -> Vec<WorkerSnapshot> {
        let mut snapshots = Vec::with_capacity(self.workers.len());
        for symbol in self.symbols() {
            match self.snapshot(&symbol).await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(err) => tracing::warn!(symbol = %symbol, error = %err, "Snapshot failed"),
            }
        }
        snapshots
    }

    /// Signal every worker to stop and wait for them
    pub async fn shutdown(mut self) {
        tracing::info!(workers = self.workers.len(), "Shutting down engine");
        let _ = self.shutdown.send(true);
        self.workers.clear();

        while let Some(result) = self.tasks.join_next().await {
            if let Err(err) = result {
                tracing::error!(error = %err, "Worker task failed");
            }
        }
    }
}
