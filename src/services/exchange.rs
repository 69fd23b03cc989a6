//! Exchange Coordinator
//!
//! Top-level dispatcher: owns every symbol's matching engine, applies the
//! order-validation gate, wires reservations between the engines and the
//! account manager, and computes the aggregate market index.
//!
//! Submission path: validate -> reserve -> enqueue. A failure at any step
//! unwinds the reservation, so no order can hold buying power without a
//! live path to the matcher.

use crate::metrics as obs;
use crate::services::accounts::AccountManager;
use crate::services::matching::engine::{ReservationPort, SymbolEngine};
use crate::services::matching::types::{
    now_millis, price_to_dollars, IndexConstituent, IndexSnapshot, MarketDataUpdate, Order,
    OrderKind, ReleaseReason, Side, SubmitError, SymbolSnapshot, Trade, MAX_ORDER_PRICE,
    MAX_ORDER_QUANTITY, MIN_ORDER_PRICE, Price,
};
use crate::services::persistence::PersistenceHandle;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Aggregate index parameters, S&P-style: equal weighted, base 1000.
const INDEX_NAME: &str = "AUREX500";
const INDEX_BASE_VALUE: f64 = 1000.0;
const INDEX_INTERVAL: Duration = Duration::from_millis(1000);

/// Broadcast fan-out capacity for trades / market data / index updates.
const BROADCAST_CAPACITY: usize = 1024;

/// One listed symbol and its restored day-open state.
#[derive(Debug, Clone)]
pub struct Listing {
    pub symbol: String,
    pub initial_price: Price,
    pub volume: i64,
}

impl Listing {
    pub fn new(symbol: impl Into<String>, initial_price: Price) -> Self {
        Self {
            symbol: symbol.into(),
            initial_price,
            volume: 0,
        }
    }
}

/// Ranking criterion for [`Exchange::top_symbols`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopCriterion {
    Volume,
    Change,
}

/// Per-engine counters surfaced by [`Exchange::telemetry`].
#[derive(Debug, Clone)]
pub struct EngineTelemetry {
    pub symbol: String,
    pub orders_processed: u64,
    pub trades_executed: u64,
    pub messages_sent: u64,
    pub matching_load: &'static str,
}

/// The exchange: symbol registry, order gate, market-data hub.
pub struct Exchange {
    engines: DashMap<String, Arc<SymbolEngine>>,
    accounts: Arc<AccountManager>,
    persistence: PersistenceHandle,
    trade_tx: broadcast::Sender<Trade>,
    md_tx: broadcast::Sender<MarketDataUpdate>,
    index_tx: broadcast::Sender<IndexSnapshot>,
    market_index: Arc<RwLock<IndexSnapshot>>,
    running: Arc<AtomicBool>,
    index_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Exchange {
    pub fn new(
        listings: Vec<Listing>,
        accounts: Arc<AccountManager>,
        persistence: PersistenceHandle,
    ) -> Self {
        let (trade_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (md_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (index_tx, _) = broadcast::channel(BROADCAST_CAPACITY);

        let engines = DashMap::new();
        for listing in &listings {
            let engine = SymbolEngine::new(listing.symbol.clone(), listing.initial_price);
            engine.restore_day_stats(listing.initial_price, listing.volume);
            engines.insert(listing.symbol.clone(), Arc::new(engine));
        }

        let market_index = IndexSnapshot {
            name: INDEX_NAME.to_string(),
            value: INDEX_BASE_VALUE,
            day_open: INDEX_BASE_VALUE,
            day_high: INDEX_BASE_VALUE,
            day_low: INDEX_BASE_VALUE,
            change_points: 0.0,
            change_percent: 0.0,
            constituents: Vec::new(),
            timestamp_ms: now_millis(),
        };

        info!(symbols = listings.len(), "exchange initialized");
        Self {
            engines,
            accounts,
            persistence,
            trade_tx,
            md_tx,
            index_tx,
            market_index: Arc::new(RwLock::new(market_index)),
            running: Arc::new(AtomicBool::new(false)),
            index_thread: Mutex::new(None),
        }
    }

    /// Start every symbol engine plus the index worker thread.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("exchange already running");
            return;
        }

        for entry in self.engines.iter() {
            let reservations: Arc<dyn ReservationPort> = Arc::clone(&self.accounts) as Arc<dyn ReservationPort>;
            entry.value().start(
                reservations,
                self.trade_tx.clone(),
                self.md_tx.clone(),
                self.persistence.clone(),
            );
        }

        let engines: Vec<Arc<SymbolEngine>> = self
            .engines
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        let running = Arc::clone(&self.running);
        let market_index = Arc::clone(&self.market_index);
        let index_tx = self.index_tx.clone();
        let handle = thread::Builder::new()
            .name("index-worker".to_string())
            .spawn(move || index_worker(engines, running, market_index, index_tx))
            .expect("spawn index worker");
        *self.index_thread.lock() = Some(handle);

        info!(symbols = self.engines.len(), "exchange started");
    }

    /// Stop the engines and the index worker. Engines bound their joins
    /// and detach stragglers, so shutdown completes even under load.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for entry in self.engines.iter() {
            entry.value().stop();
        }
        if let Some(handle) = self.index_thread.lock().take() {
            let _ = handle.join();
        }
        info!("exchange stopped");
    }

    pub fn symbols(&self) -> Vec<String> {
        self.engines.iter().map(|e| e.key().clone()).collect()
    }

    /// Validate, reserve, and enqueue one order.
    pub fn submit(&self, symbol: &str, order: Order) -> Result<(), SubmitError> {
        validate_order(&order)?;
        if order.symbol != symbol {
            return Err(SubmitError::InvalidOrder(
                "order symbol does not match routing symbol".into(),
            ));
        }

        let engine = self
            .engines
            .get(symbol)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| SubmitError::UnknownSymbol(symbol.to_string()))?;

        // Market orders reserve at the last trade price; without one there
        // is no sane bound, so they are refused outright.
        let effective_price = match order.kind {
            OrderKind::Market => {
                let last = engine.stats().last_price();
                if last <= 0 {
                    return Err(SubmitError::NoReferencePrice);
                }
                last
            }
            _ => order.price,
        };

        self.accounts.reserve(&order, effective_price)?;

        if let Err(e) = engine.submit(order.clone()) {
            let reason = match e {
                SubmitError::Busy => ReleaseReason::QueueFull,
                _ => ReleaseReason::Rejected,
            };
            self.accounts.release(&order, reason);
            return Err(e);
        }

        obs::record_order_submitted(order.side, order.kind);
        Ok(())
    }

    /// Queue a cancel behind the user's earlier submissions for the symbol.
    pub fn cancel(&self, symbol: &str, order_id: &str) -> Result<(), SubmitError> {
        let engine = self
            .engines
            .get(symbol)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| SubmitError::UnknownSymbol(symbol.to_string()))?;
        engine.cancel(order_id)
    }

    pub fn order_status(&self, symbol: &str, order_id: &str) -> Option<Order> {
        self.engines.get(symbol)?.order_status(order_id)
    }

    pub fn market_data(&self, symbol: &str) -> Option<MarketDataUpdate> {
        self.engines.get(symbol).map(|e| e.market_data())
    }

    pub fn all_symbol_snapshots(&self) -> Vec<SymbolSnapshot> {
        self.engines.iter().map(|e| e.value().snapshot()).collect()
    }

    /// Top `n` symbols ranked by the given criterion.
    pub fn top_symbols(&self, criterion: TopCriterion, n: usize) -> Vec<SymbolSnapshot> {
        let mut snapshots = self.all_symbol_snapshots();
        match criterion {
            TopCriterion::Volume => snapshots.sort_by(|a, b| b.volume.cmp(&a.volume)),
            TopCriterion::Change => snapshots.sort_by(|a, b| {
                b.change_percent
                    .partial_cmp(&a.change_percent)
                    .unwrap_or(std::cmp::Ordering::Equal)
            }),
        }
        snapshots.truncate(n);
        snapshots
    }

    /// Per-engine counters and load levels for the telemetry heartbeat.
    pub fn telemetry(&self) -> Vec<EngineTelemetry> {
        self.engines
            .iter()
            .map(|e| {
                let stats = e.value().stats();
                EngineTelemetry {
                    symbol: e.key().clone(),
                    orders_processed: stats.orders_processed(),
                    trades_executed: stats.trades_executed(),
                    messages_sent: stats.messages_sent(),
                    matching_load: stats.matching_load().as_str(),
                }
            })
            .collect()
    }

    pub fn market_index(&self) -> IndexSnapshot {
        self.market_index.read().clone()
    }

    pub fn subscribe_trades(&self) -> broadcast::Receiver<Trade> {
        self.trade_tx.subscribe()
    }

    pub fn subscribe_market_data(&self) -> broadcast::Receiver<MarketDataUpdate> {
        self.md_tx.subscribe()
    }

    pub fn subscribe_index(&self) -> broadcast::Receiver<IndexSnapshot> {
        self.index_tx.subscribe()
    }

    /// True when every engine's queues have drained.
    pub fn quiesced(&self) -> bool {
        self.engines.iter().all(|e| e.value().quiesced())
    }

    pub fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stock rows for the periodic market-data sync.
    pub fn stock_rows(&self) -> Vec<(String, Price, Price, i64)> {
        self.engines
            .iter()
            .map(|e| {
                let stats = e.value().stats();
                (
                    e.key().clone(),
                    stats.last_price(),
                    stats.day_open(),
                    stats.volume(),
                )
            })
            .collect()
    }
}

/// The validation gate applied before any reservation.
fn validate_order(order: &Order) -> Result<(), SubmitError> {
    if order.order_id.is_empty() {
        return Err(SubmitError::InvalidOrder("order_id cannot be empty".into()));
    }
    if order.user_id.is_empty() {
        return Err(SubmitError::InvalidOrder("user_id cannot be empty".into()));
    }
    if order.symbol.is_empty() {
        return Err(SubmitError::InvalidOrder("symbol cannot be empty".into()));
    }
    if order.quantity <= 0 {
        return Err(SubmitError::InvalidOrder("quantity must be positive".into()));
    }
    if order.quantity > MAX_ORDER_QUANTITY {
        return Err(SubmitError::InvalidOrder(
            "quantity exceeds maximum allowed".into(),
        ));
    }
    if order.remaining_qty != order.quantity {
        return Err(SubmitError::InvalidOrder(
            "remaining quantity must equal quantity on entry".into(),
        ));
    }
    if order.kind != OrderKind::Market {
        if order.price <= 0 {
            return Err(SubmitError::InvalidOrder("price must be positive".into()));
        }
        if !(MIN_ORDER_PRICE..=MAX_ORDER_PRICE).contains(&order.price) {
            return Err(SubmitError::InvalidOrder("price out of valid range".into()));
        }
        if order.quantity > i64::MAX / order.price {
            return Err(SubmitError::InvalidOrder(
                "order value too large (overflow risk)".into(),
            ));
        }
    }
    Ok(())
}

/// Recompute the equal-weighted index once a second and fan it out.
fn index_worker(
    engines: Vec<Arc<SymbolEngine>>,
    running: Arc<AtomicBool>,
    market_index: Arc<RwLock<IndexSnapshot>>,
    index_tx: broadcast::Sender<IndexSnapshot>,
) {
    info!("index worker started");
    while running.load(Ordering::SeqCst) {
        let snapshot = {
            let mut index = market_index.write();

            let count = engines.len();
            if count > 0 {
                let weight = 1.0 / count as f64;
                let mut weighted_price_sum = 0.0;
                let mut constituents = Vec::with_capacity(count);
                for engine in &engines {
                    let stats = engine.stats();
                    let price = price_to_dollars(stats.last_price());
                    weighted_price_sum += price * weight;
                    constituents.push(IndexConstituent {
                        symbol: engine.symbol().to_string(),
                        last_price: stats.last_price(),
                        weight,
                        contribution: price * weight / INDEX_BASE_VALUE * 100.0,
                        change_percent: stats.change_percent(),
                    });
                    obs::set_book_depth(
                        engine.symbol(),
                        stats.book_depth(Side::Buy),
                        stats.book_depth(Side::Sell),
                    );
                }

                let value = weighted_price_sum * (INDEX_BASE_VALUE / 100.0);
                index.day_high = index.day_high.max(value);
                index.day_low = index.day_low.min(value);
                index.change_points = value - index.day_open;
                index.change_percent = if index.day_open != 0.0 {
                    index.change_points / index.day_open * 100.0
                } else {
                    0.0
                };
                index.value = value;
                index.constituents = constituents;
            }
            index.timestamp_ms = now_millis();
            index.clone()
        };

        let _ = index_tx.send(snapshot);
        thread::sleep(INDEX_INTERVAL);
    }
    info!("index worker stopped");
}
