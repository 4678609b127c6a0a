use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::gateway::{ExecutionGateway, GatewayError, OrderAck, OrderRequest};
use crate::instruments::{InstrumentOverride, PipValueResolver};
use crate::models::{Bar, TradeSide};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PaperExit {
    Stop,
    Target,
}

/// A simulated position held by the paper venue
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaperOrder {
    pub order_id: String,
    pub client_order_id: Uuid,
    pub symbol: String,
    pub side: TradeSide,
    pub volume: f64,
    pub entry: f64,
    pub stop: f64,
    pub target: f64,
    pub contract_size: f64,
    /// Quote-to-account rate at entry
    pub quote_to_account: f64,
    pub opened_at: DateTime<Utc>,
    pub exit: Option<PaperExit>,
    pub exit_price: Option<f64>,
    pub realized_pnl: Option<f64>,
}

impl PaperOrder {
    fn sign(&self) -> f64 {
        match self.side {
            TradeSide::Buy => 1.0,
            TradeSide::Sell => -1.0,
        }
    }

    /// Exit hit by `bar`, stop first when both are touched
    fn exit_on(&self, bar: &Bar) -> Option<(PaperExit, f64)> {
        let (stop_hit, target_hit) = match self.side {
            TradeSide::Buy => (bar.low <= self.stop, bar.high >= self.target),
            TradeSide::Sell => (bar.high >= self.stop, bar.low <= self.target),
        };
        if stop_hit {
            Some((PaperExit::Stop, self.stop))
        } else if target_hit {
            Some((PaperExit::Target, self.target))
        } else {
            None
        }
    }
}

#[derive(Debug)]
struct PaperState {
    equity: f64,
    next_id: u64,
    open: HashMap<String, PaperOrder>,
    closed: Vec<PaperOrder>,
    by_client_id: HashMap<Uuid, String>,
    faults: VecDeque<GatewayError>,
    instruments: PipValueResolver,
    account_currency: String,
}

impl PaperState {
    fn take_fault(&mut self) -> Result<(), GatewayError> {
        match self.faults.pop_front() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}

/// In-process simulated venue
///
/// Orders fill at the requested price. Positions are settled into equity
/// when [`PaperGateway::mark`] sees a bar cross their stop or target; only
/// bars marked after submission can settle an order.
/// Injected faults are returned by the next calls in FIFO order.
#[derive(Debug)]
pub struct PaperGateway {
    state: Mutex<PaperState>,
}

impl PaperGateway {
    pub fn new(starting_equity: f64) -> Self {
        Self::with_instruments(starting_equity, HashMap::new())
    }

    pub fn with_instruments(
        starting_equity: f64,
        overrides: HashMap<String, InstrumentOverride>,
    ) -> Self {
        Self {
            state: Mutex::new(PaperState {
                equity: starting_equity,
                next_id: 1,
                open: HashMap::new(),
                closed: Vec::new(),
                by_client_id: HashMap::new(),
                faults: VecDeque::new(),
                instruments: PipValueResolver::new(overrides),
                account_currency: "USD".to_string(),
            }),
        }
    }

    /// Settle profit and loss in `currency` instead of USD
    pub fn with_account_currency(self, currency: &str) -> Self {
        self.lock().account_currency = currency.to_uppercase();
        self
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn equity(&self) -> f64 {
        self.lock().equity
    }

    pub fn set_equity(&self, equity: f64) {
        self.lock().equity = equity;
    }

    /// Make the next gateway call fail with `error`
    pub fn fail_next(&self, error: GatewayError) {
        self.lock().faults.push_back(error);
    }

    pub fn open_orders(&self) -> Vec<PaperOrder> {
        let mut orders: Vec<_> = self.lock().open.values().cloned().collect();
        orders.sort_by_key(|o| o.opened_at);
        orders
    }

    pub fn closed_orders(&self) -> Vec<PaperOrder> {
        self.lock().closed.clone()
    }

    /// Settle open orders of `bar.symbol` whose stop or target the bar crossed
    pub fn mark(&self, bar: &Bar) -> Vec<PaperOrder> {
        let mut state = self.lock();

        let hits: Vec<(String, PaperExit, f64)> = state
            .open
            .values()
            .filter(|o| o.symbol.eq_ignore_ascii_case(&bar.symbol))
            .filter_map(|o| o.exit_on(bar).map(|(exit, price)| (o.order_id.clone(), exit, price)))
            .collect();

        let mut settled = Vec::with_capacity(hits.len());
        for (order_id, exit, price) in hits {
            let Some(mut order) = state.open.remove(&order_id) else {
                continue;
            };
            let currency = state.account_currency.clone();
            let rate = state
                .instruments
                .context(&order.symbol)
                .quote_to_account_rate(price, &currency)
                .unwrap_or(order.quote_to_account);
            let pnl = (price - order.entry) * order.sign() * order.volume * order.contract_size * rate;
            order.exit = Some(exit);
            order.exit_price = Some(price);
            order.realized_pnl = Some(pnl);
            state.equity += pnl;

            tracing::info!(
                symbol = %order.symbol,
                order_id = %order.order_id,
                exit = ?exit,
                price,
                pnl,
                equity = state.equity,
                "Paper position closed"
            );

            state.closed.push(order.clone());
            settled.push(order);
        }
        settled
    }
}

#[async_trait]
impl ExecutionGateway for PaperGateway {
    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck, GatewayError> {
        let mut state = self.lock();
        state.take_fault()?;

        // Resubmission of an order we already filled
        if let Some(order_id) = state.by_client_id.get(&request.client_order_id) {
            let entry = state
                .open
                .get(order_id)
                .map(|o| o.entry)
                .or_else(|| {
                    state
                        .closed
                        .iter()
                        .find(|o| &o.order_id == order_id)
                        .map(|o| o.entry)
                })
                .unwrap_or(request.price);
            return Ok(OrderAck {
                accepted: true,
                order_id: order_id.clone(),
                filled_price: entry,
            });
        }

        if request.volume <= 0.0 {
            return Err(GatewayError::Rejected(format!(
                "invalid volume {}",
                request.volume
            )));
        }
        let stops_valid = match request.side {
            TradeSide::Buy => request.stop < request.price && request.target > request.price,
            TradeSide::Sell => request.stop > request.price && request.target < request.price,
        };
        if !stops_valid {
            return Err(GatewayError::Rejected("invalid stops".to_string()));
        }

        let currency = state.account_currency.clone();
        let instrument = state.instruments.context(&request.symbol).clone();
        let Some(quote_to_account) = instrument.quote_to_account_rate(request.price, &currency) else {
            return Err(GatewayError::Rejected(format!(
                "no {} conversion rate for {}",
                currency, request.symbol
            )));
        };
        let contract_size = instrument.contract_size;

        let order_id = format!("paper-{}", state.next_id);
        state.next_id += 1;

        let order = PaperOrder {
            order_id: order_id.clone(),
            client_order_id: request.client_order_id,
            symbol: request.symbol.clone(),
            side: request.side,
            volume: request.volume,
            entry: request.price,
            stop: request.stop,
            target: request.target,
            contract_size,
            quote_to_account,
            opened_at: Utc::now(),
            exit: None,
            exit_price: None,
            realized_pnl: None,
        };

        state.by_client_id.insert(request.client_order_id, order_id.clone());
        state.open.insert(order_id.clone(), order);

        Ok(OrderAck {
            accepted: true,
            order_id,
            filled_price: request.price,
        })
    }

    async fn account_equity(&self) -> Result<f64, GatewayError> {
        let mut state = self.lock();
        state.take_fault()?;
        Ok(state.equity)
    }

    async fn modify_stop(&self, order_id: &str, new_stop: f64) -> Result<bool, GatewayError> {
        let mut state = self.lock();
        state.take_fault()?;

        match state.open.get_mut(order_id) {
            Some(order) => {
                order.stop = new_stop;
                Ok(true)
            }
            None => Err(GatewayError::UnknownOrder(order_id.to_string())),
        }
    }
}
