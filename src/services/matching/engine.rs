//! Per-Symbol Matching Engine
//!
//! Each listed symbol gets one `SymbolEngine`: a matching thread that is
//! the only writer of the order book, plus dedicated publisher threads for
//! trades and market data. All cross-thread traffic flows through bounded
//! lock-free rings; the matching thread never takes a lock on the hot path
//! (the status cache and depth snapshot are written outside matching
//! decisions).
//!
//! ```text
//! submit() --MPSC--> matching thread --SPSC--> trade publisher --> apply_trade
//!                         |                                     \-> persistence
//!                         +---------SPSC--> market data publisher --> subscribers
//! ```

use super::book::OrderBook;
use super::types::{
    BookLevel, EngineCommand, MarketDataUpdate, Order, OrderKind, OrderStatus, Price,
    ReleaseReason, Side, SubmitError, SymbolSnapshot, Trade, now_millis, price_to_dollars,
};
use super::waiter::{AdaptiveWaiter, LoadLevel};
use crate::metrics as obs;
use crate::services::persistence::PersistenceHandle;
use crossbeam::queue::ArrayQueue;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Queue capacities. Powers of two, sized for bursty ingress.
const ORDER_QUEUE_SIZE: usize = 4096;
const TRADE_QUEUE_SIZE: usize = 4096;
const MARKET_DATA_QUEUE_SIZE: usize = 1024;

/// Maximum resting orders per side of one book.
pub const MAX_ORDER_BOOK_DEPTH: usize = 10_000;

/// Emit a market-data snapshot every N processed commands.
const MARKET_DATA_INTERVAL: u64 = 1000;

/// Depth snapshot staleness bound for cross-thread readers.
const SNAPSHOT_CACHE_MS: i64 = 100;

/// Bound on joining worker threads at shutdown before detaching them.
const JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// VWAP accumulators renormalize past this denominator to avoid overflow.
const VWAP_RESET_THRESHOLD: i64 = i64::MAX / 2;

// ============================================================================
// Reservation Port
// ============================================================================

/// The narrow capability the engine uses to keep account balances
/// consistent with the lifecycle of the orders it owns. Implemented by the
/// account manager; the engine never sees account internals.
pub trait ReservationPort: Send + Sync {
    /// Hold cash (buys) or shares (sells) for a validated order.
    fn reserve(&self, order: &Order, effective_price: Price) -> Result<(), SubmitError>;

    /// Return the unfilled portion of an order's reservation. The filled
    /// portion stays reserved until its trades settle via `apply_trade`.
    fn release(&self, order: &Order, reason: ReleaseReason);

    /// Settle one trade: consume both sides' reservations and move cash
    /// and shares. Invoked exactly once per trade, by the trade publisher.
    fn apply_trade(&self, trade: &Trade);
}

// ============================================================================
// Per-Symbol Statistics
// ============================================================================

/// Lock-free daily statistics for one symbol. Written by the matching and
/// publisher threads, read by the exchange and the index worker.
pub struct SymbolStats {
    last_price: AtomicI64,
    open_price: AtomicI64,
    day_high: AtomicI64,
    day_low: AtomicI64,
    volume: AtomicI64,
    vwap: AtomicI64,
    last_qty: AtomicI64,
    orders_processed: AtomicU64,
    trades_executed: AtomicU64,
    messages_sent: AtomicU64,
    buy_depth: AtomicI64,
    sell_depth: AtomicI64,
    matching_load: AtomicU8,
}

impl SymbolStats {
    fn new(initial_price: Price) -> Self {
        Self {
            last_price: AtomicI64::new(initial_price),
            open_price: AtomicI64::new(initial_price),
            day_high: AtomicI64::new(initial_price),
            day_low: AtomicI64::new(initial_price),
            volume: AtomicI64::new(0),
            vwap: AtomicI64::new(initial_price),
            last_qty: AtomicI64::new(0),
            orders_processed: AtomicU64::new(0),
            trades_executed: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            buy_depth: AtomicI64::new(0),
            sell_depth: AtomicI64::new(0),
            matching_load: AtomicU8::new(LoadLevel::Idle.as_u8()),
        }
    }

    pub fn book_depth(&self, side: Side) -> i64 {
        match side {
            Side::Buy => self.buy_depth.load(Ordering::Relaxed),
            Side::Sell => self.sell_depth.load(Ordering::Relaxed),
        }
    }

    pub fn last_price(&self) -> Price {
        self.last_price.load(Ordering::Relaxed)
    }

    pub fn day_open(&self) -> Price {
        self.open_price.load(Ordering::Relaxed)
    }

    pub fn day_high(&self) -> Price {
        self.day_high.load(Ordering::Relaxed)
    }

    pub fn day_low(&self) -> Price {
        self.day_low.load(Ordering::Relaxed)
    }

    pub fn volume(&self) -> i64 {
        self.volume.load(Ordering::Relaxed)
    }

    pub fn vwap(&self) -> Price {
        self.vwap.load(Ordering::Relaxed)
    }

    pub fn change_points(&self) -> Price {
        self.last_price() - self.day_open()
    }

    pub fn change_percent(&self) -> f64 {
        let open = self.day_open();
        if open == 0 {
            return 0.0;
        }
        (self.last_price() - open) as f64 / open as f64 * 100.0
    }

    pub fn orders_processed(&self) -> u64 {
        self.orders_processed.load(Ordering::Relaxed)
    }

    pub fn trades_executed(&self) -> u64 {
        self.trades_executed.load(Ordering::Relaxed)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn matching_load(&self) -> LoadLevel {
        LoadLevel::from_u8(self.matching_load.load(Ordering::Relaxed))
    }

    fn record_trade(&self, price: Price, qty: i64) {
        self.last_price.store(price, Ordering::Relaxed);
        self.last_qty.store(qty, Ordering::Relaxed);
        self.volume.fetch_add(qty, Ordering::Relaxed);

        let mut high = self.day_high.load(Ordering::Relaxed);
        while price > high {
            match self.day_high.compare_exchange_weak(
                high,
                price,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => high = current,
            }
        }
        let mut low = self.day_low.load(Ordering::Relaxed);
        while price < low {
            match self.day_low.compare_exchange_weak(
                low,
                price,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => low = current,
            }
        }
    }
}

/// Cross-thread copy of the top of the book, refreshed by the matching
/// thread and served to market-data queries without touching the book.
#[derive(Debug, Clone, Default)]
pub struct DepthSnapshot {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub taken_ms: i64,
}

// ============================================================================
// Symbol Engine
// ============================================================================

/// Handle to one symbol's matching engine. Cheap to share; all mutation
/// happens on the engine's own threads.
pub struct SymbolEngine {
    symbol: String,
    ingress: Arc<ArrayQueue<EngineCommand>>,
    trade_queue: Arc<ArrayQueue<Trade>>,
    md_queue: Arc<ArrayQueue<MarketDataUpdate>>,
    running: Arc<AtomicBool>,
    stats: Arc<SymbolStats>,
    status_cache: Arc<DashMap<String, Order>>,
    depth: Arc<RwLock<DepthSnapshot>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl SymbolEngine {
    pub fn new(symbol: impl Into<String>, initial_price: Price) -> Self {
        Self {
            symbol: symbol.into(),
            ingress: Arc::new(ArrayQueue::new(ORDER_QUEUE_SIZE)),
            trade_queue: Arc::new(ArrayQueue::new(TRADE_QUEUE_SIZE)),
            md_queue: Arc::new(ArrayQueue::new(MARKET_DATA_QUEUE_SIZE)),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(SymbolStats::new(initial_price)),
            status_cache: Arc::new(DashMap::new()),
            depth: Arc::new(RwLock::new(DepthSnapshot::default())),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn stats(&self) -> &SymbolStats {
        &self.stats
    }

    /// Spawn the matching, trade-publisher and market-data threads.
    pub fn start(
        &self,
        reservations: Arc<dyn ReservationPort>,
        trade_tx: broadcast::Sender<Trade>,
        md_tx: broadcast::Sender<MarketDataUpdate>,
        persistence: PersistenceHandle,
    ) {
        self.running.store(true, Ordering::SeqCst);

        let mut worker = MatchWorker {
            symbol: self.symbol.clone(),
            book: OrderBook::new(MAX_ORDER_BOOK_DEPTH),
            ingress: Arc::clone(&self.ingress),
            trade_queue: Arc::clone(&self.trade_queue),
            md_queue: Arc::clone(&self.md_queue),
            running: Arc::clone(&self.running),
            stats: Arc::clone(&self.stats),
            status_cache: Arc::clone(&self.status_cache),
            depth: Arc::clone(&self.depth),
            reservations: Arc::clone(&reservations),
            persistence: persistence.clone(),
            waiter: AdaptiveWaiter::new(),
            commands_seen: 0,
            book_dirty: false,
            vwap_numerator: 0.0,
            vwap_denominator: 0,
        };

        let matching = thread::Builder::new()
            .name(format!("match-{}", self.symbol))
            .spawn(move || worker.run())
            .expect("spawn matching thread");

        let trade_publisher = {
            let symbol = self.symbol.clone();
            let queue = Arc::clone(&self.trade_queue);
            let running = Arc::clone(&self.running);
            let stats = Arc::clone(&self.stats);
            let reservations = Arc::clone(&reservations);
            let persistence = persistence.clone();
            thread::Builder::new()
                .name(format!("trade-{}", self.symbol))
                .spawn(move || {
                    trade_publisher_loop(
                        symbol,
                        queue,
                        running,
                        stats,
                        reservations,
                        persistence,
                        trade_tx,
                    )
                })
                .expect("spawn trade publisher thread")
        };

        let md_publisher = {
            let symbol = self.symbol.clone();
            let queue = Arc::clone(&self.md_queue);
            let running = Arc::clone(&self.running);
            let stats = Arc::clone(&self.stats);
            thread::Builder::new()
                .name(format!("md-{}", self.symbol))
                .spawn(move || market_data_publisher_loop(symbol, queue, running, stats, md_tx))
                .expect("spawn market data thread")
        };

        let mut threads = self.threads.lock();
        threads.push(matching);
        threads.push(trade_publisher);
        threads.push(md_publisher);
        info!(symbol = %self.symbol, "symbol engine started");
    }

    /// Signal shutdown and join the worker threads, detaching any that do
    /// not finish within the timeout.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handles = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!(thread = %name, "join timeout, detaching worker thread");
            }
        }
        info!(symbol = %self.symbol, "symbol engine stopped");
    }

    /// Enqueue a pre-validated, pre-reserved order for matching.
    pub fn submit(&self, order: Order) -> Result<(), SubmitError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(SubmitError::EngineShutdown);
        }

        if let Some(existing) = self.status_cache.get(&order.order_id) {
            if !existing.status.is_terminal() {
                return Err(SubmitError::DuplicateOrderId(order.order_id.clone()));
            }
        }

        // Cheap depth pre-check; the matching thread re-checks
        // authoritatively against the book itself.
        let side_depth = match order.side {
            Side::Buy => self.stats.buy_depth.load(Ordering::Relaxed),
            Side::Sell => self.stats.sell_depth.load(Ordering::Relaxed),
        };
        if side_depth >= MAX_ORDER_BOOK_DEPTH as i64 {
            return Err(SubmitError::DepthLimit);
        }

        let mut pending = order.clone();
        pending.status = OrderStatus::Pending;
        self.status_cache.insert(pending.order_id.clone(), pending);

        if let Err(cmd) = self.ingress.push(EngineCommand::New(order)) {
            if let EngineCommand::New(order) = cmd {
                // Roll back the pending marker so the id can be retried.
                if let Some(entry) = self.status_cache.get(&order.order_id) {
                    let still_pending = entry.status == OrderStatus::Pending;
                    drop(entry);
                    if still_pending {
                        self.status_cache.remove(&order.order_id);
                    }
                }
            }
            return Err(SubmitError::Busy);
        }
        Ok(())
    }

    /// Queue a cancel behind the user's earlier submissions.
    pub fn cancel(&self, order_id: &str) -> Result<(), SubmitError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(SubmitError::EngineShutdown);
        }
        match self.status_cache.get(order_id) {
            None => {
                return Err(SubmitError::InvalidOrder(format!(
                    "order not found: {order_id}"
                )))
            }
            Some(entry) if entry.status.is_terminal() => {
                return Err(SubmitError::InvalidOrder(format!(
                    "order already {}",
                    entry.status
                )))
            }
            Some(_) => {}
        }
        self.ingress
            .push(EngineCommand::Cancel(order_id.to_string()))
            .map_err(|_| SubmitError::Busy)
    }

    /// Last cached status of an order, if the engine has seen it.
    pub fn order_status(&self, order_id: &str) -> Option<Order> {
        self.status_cache.get(order_id).map(|o| o.clone())
    }

    /// Top-of-book view served from the cached depth snapshot, at most
    /// [`SNAPSHOT_CACHE_MS`] stale under load.
    pub fn market_data(&self) -> MarketDataUpdate {
        let depth = self.depth.read();
        MarketDataUpdate {
            symbol: self.symbol.clone(),
            last_price: self.stats.last_price(),
            last_qty: self.stats.last_qty.load(Ordering::Relaxed),
            top_bids: depth.bids.clone(),
            top_asks: depth.asks.clone(),
            timestamp_ms: now_millis(),
        }
    }

    pub fn snapshot(&self) -> SymbolSnapshot {
        let depth = self.depth.read();
        SymbolSnapshot {
            symbol: self.symbol.clone(),
            last_price: self.stats.last_price(),
            day_open: self.stats.day_open(),
            day_high: self.stats.day_high(),
            day_low: self.stats.day_low(),
            change_points: self.stats.change_points(),
            change_percent: self.stats.change_percent(),
            volume: self.stats.volume(),
            vwap: self.stats.vwap(),
            top_bids: depth.bids.clone(),
            top_asks: depth.asks.clone(),
        }
    }

    /// True once every queue between the gate and the publishers is empty.
    /// Useful for health checks and draining tests.
    pub fn quiesced(&self) -> bool {
        self.ingress.is_empty() && self.trade_queue.is_empty() && self.md_queue.is_empty()
    }

    /// Restore the previous session's closing state on startup.
    pub fn restore_day_stats(&self, last_price: Price, volume: i64) {
        if last_price > 0 {
            self.stats.last_price.store(last_price, Ordering::Relaxed);
            self.stats.open_price.store(last_price, Ordering::Relaxed);
            self.stats.day_high.store(last_price, Ordering::Relaxed);
            self.stats.day_low.store(last_price, Ordering::Relaxed);
            self.stats.vwap.store(last_price, Ordering::Relaxed);
        }
        self.stats.volume.store(volume, Ordering::Relaxed);
    }
}

// ============================================================================
// Matching Worker
// ============================================================================

/// Single-threaded owner of one symbol's book. Everything here runs on the
/// matching thread; no locks are held while matching.
struct MatchWorker {
    symbol: String,
    book: OrderBook,
    ingress: Arc<ArrayQueue<EngineCommand>>,
    trade_queue: Arc<ArrayQueue<Trade>>,
    md_queue: Arc<ArrayQueue<MarketDataUpdate>>,
    running: Arc<AtomicBool>,
    stats: Arc<SymbolStats>,
    status_cache: Arc<DashMap<String, Order>>,
    depth: Arc<RwLock<DepthSnapshot>>,
    reservations: Arc<dyn ReservationPort>,
    persistence: PersistenceHandle,
    waiter: AdaptiveWaiter,
    commands_seen: u64,
    book_dirty: bool,
    vwap_numerator: f64,
    vwap_denominator: i64,
}

impl MatchWorker {
    fn run(&mut self) {
        info!(symbol = %self.symbol, "matching engine worker started");
        loop {
            if !self.running.load(Ordering::SeqCst) {
                self.drain_on_shutdown();
                break;
            }

            let command = self.ingress.pop();
            let did_work = command.is_some();

            if let Some(command) = command {
                match command {
                    EngineCommand::New(order) => self.process_new_order(order),
                    EngineCommand::Cancel(order_id) => self.process_cancel(&order_id),
                }
                self.stats.orders_processed.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .buy_depth
                    .store(self.book.side_count(Side::Buy) as i64, Ordering::Relaxed);
                self.stats
                    .sell_depth
                    .store(self.book.side_count(Side::Sell) as i64, Ordering::Relaxed);
                self.commands_seen += 1;
                self.book_dirty = true;
                if self.commands_seen % MARKET_DATA_INTERVAL == 0 {
                    self.emit_market_data();
                }
                debug_assert!(
                    match (self.book.best_bid_price(), self.book.best_ask_price()) {
                        (Some(bid), Some(ask)) => bid < ask,
                        _ => true,
                    },
                    "crossed book after command"
                );
            }
            self.refresh_depth_if_stale();

            self.waiter.record_iteration(did_work);
            let level = self.waiter.level();
            if self.stats.matching_load.load(Ordering::Relaxed) != level.as_u8() {
                self.stats
                    .matching_load
                    .store(level.as_u8(), Ordering::Relaxed);
            }
            if !did_work {
                self.waiter.wait_for_work();
            }
        }
        info!(
            symbol = %self.symbol,
            load = self.waiter.level().as_str(),
            "matching engine worker stopped"
        );
    }

    /// Shutdown path: hand queued work back without matching it.
    fn drain_on_shutdown(&mut self) {
        let mut drained = 0usize;
        while let Some(command) = self.ingress.pop() {
            if let EngineCommand::New(order) = command {
                self.reservations
                    .release(&order, ReleaseReason::EngineShutdown);
                self.status_cache.remove(&order.order_id);
                drained += 1;
            }
        }
        if drained > 0 {
            info!(symbol = %self.symbol, drained, "released queued orders on shutdown");
        }
    }

    fn process_new_order(&mut self, mut order: Order) {
        // Authoritative depth check on the matching thread.
        if self.book.side_count(order.side) >= MAX_ORDER_BOOK_DEPTH {
            warn!(symbol = %self.symbol, order_id = %order.order_id, "book depth limit reached");
            self.finalize_rejected(&mut order, "depth_limit");
            return;
        }

        if self.book.contains(&order.order_id) {
            self.finalize_rejected(&mut order, "duplicate_order_id");
            return;
        }

        // FOK feasibility, excluding the submitter's own liquidity, before
        // any state is touched. Either everything fills or nothing does.
        // Non-market kinds reach the matcher with a validated positive
        // price, so the limit is never unbounded here.
        if order.kind == OrderKind::Fok {
            let available = self.book.available_quantity(
                order.side.opposite(),
                Some(order.price),
                &order.user_id,
            );
            if available < order.quantity {
                order.status = OrderStatus::Cancelled;
                self.cache_status(&order);
                self.reservations.release(&order, ReleaseReason::FokNotFilled);
                self.persistence.record_order(&order, Some("fok_not_filled"));
                obs::record_order_cancelled();
                return;
            }
        }

        let (trades, band_stopped) = self.match_incoming(&mut order);

        if order.remaining_qty == 0 {
            order.status = OrderStatus::Filled;
            self.cache_status(&order);
            self.reservations.release(&order, ReleaseReason::Filled);
            self.persistence.record_order(&order, None);
        } else if band_stopped {
            order.status = OrderStatus::Cancelled;
            self.cache_status(&order);
            self.reservations
                .release(&order, ReleaseReason::MarketUnmatched);
            self.persistence.record_order(&order, Some("market_band"));
            obs::record_order_cancelled();
        } else {
            match order.kind {
                OrderKind::Limit => {
                    order.status = if order.filled_qty() > 0 {
                        OrderStatus::Partial
                    } else {
                        OrderStatus::Open
                    };
                    self.cache_status(&order);
                    self.persistence.record_order(&order, None);
                    match self.book.insert(order) {
                        Ok(_) => {}
                        Err(mut rejected) => {
                            // Depth cap raced with fills freeing nothing;
                            // hand the remainder back.
                            self.finalize_rejected(&mut rejected, "depth_limit");
                        }
                    }
                }
                OrderKind::Ioc => {
                    order.status = OrderStatus::Cancelled;
                    self.cache_status(&order);
                    self.reservations
                        .release(&order, ReleaseReason::IocRemainder);
                    self.persistence.record_order(&order, Some("ioc_remainder"));
                    obs::record_order_cancelled();
                }
                OrderKind::Market => {
                    order.status = OrderStatus::Cancelled;
                    self.cache_status(&order);
                    self.reservations
                        .release(&order, ReleaseReason::MarketUnmatched);
                    self.persistence
                        .record_order(&order, Some("market_unmatched"));
                    obs::record_order_cancelled();
                }
                OrderKind::Fok => {
                    // Unreachable after the feasibility check; keep the
                    // atomicity promise anyway.
                    order.status = OrderStatus::Cancelled;
                    self.cache_status(&order);
                    self.reservations
                        .release(&order, ReleaseReason::FokNotFilled);
                    self.persistence.record_order(&order, Some("fok_not_filled"));
                }
            }
        }

        // Publish trades and fold them into the daily statistics.
        for trade in trades {
            self.stats.record_trade(trade.price, trade.quantity);
            self.update_vwap(trade.price, trade.quantity);
            self.publish_trade(trade);
        }
    }

    fn finalize_rejected(&mut self, order: &mut Order, detail: &'static str) {
        order.status = OrderStatus::Rejected;
        self.cache_status(order);
        self.reservations.release(order, ReleaseReason::Rejected);
        self.persistence.record_order(order, Some(detail));
        obs::record_order_rejected(detail);
    }

    fn process_cancel(&mut self, order_id: &str) {
        let Some(handle) = self.book.lookup(order_id) else {
            // Raced with a fill; cancel after the fact is a no-op.
            debug!(symbol = %self.symbol, order_id, "cancel for order not in book");
            return;
        };
        let mut order = self.book.remove(handle);
        order.status = OrderStatus::Cancelled;
        self.cache_status(&order);
        self.reservations.release(&order, ReleaseReason::Cancelled);
        self.persistence.record_order(&order, Some("cancelled"));
        obs::record_order_cancelled();
    }

    /// Match an incoming order against the opposite side in price-time
    /// priority. Returns the executed trades and whether a market order
    /// stopped on the protection band.
    fn match_incoming(&mut self, incoming: &mut Order) -> (Vec<Trade>, bool) {
        let mut trades = Vec::new();
        let opposite = incoming.side.opposite();

        // The protection band derives from the last price as of arrival.
        let band_limit: Option<Price> = if incoming.kind == OrderKind::Market {
            let last = self.stats.last_price();
            if last > 0 {
                Some(match incoming.side {
                    Side::Buy => last.saturating_mul(110) / 100,
                    Side::Sell => last.saturating_mul(90) / 100,
                })
            } else {
                None
            }
        } else {
            None
        };
        let mut band_stopped = false;

        let mut level_cursor = self.book.best(opposite);
        while incoming.remaining_qty > 0 {
            let Some(level) = level_cursor else { break };
            let level_price = self.book.level_price(level);

            match incoming.kind {
                OrderKind::Market => {
                    if let Some(limit) = band_limit {
                        let outside = match incoming.side {
                            Side::Buy => level_price > limit,
                            Side::Sell => level_price < limit,
                        };
                        if outside {
                            band_stopped = true;
                            break;
                        }
                    }
                }
                _ => {
                    let crosses = match incoming.side {
                        Side::Buy => incoming.price >= level_price,
                        Side::Sell => incoming.price <= level_price,
                    };
                    if !crosses {
                        break;
                    }
                }
            }

            // Self-trade prevention: same-user makers are skipped, not
            // consumed. A level holding only the taker's own orders is
            // passed over and left intact.
            let Some(maker_handle) = self.book.first_counterparty(level, &incoming.user_id)
            else {
                debug_assert!(self.book.level_quantity(level) > 0);
                level_cursor = self.book.next_level(level);
                continue;
            };

            let maker_price;
            let trade_qty;
            {
                let maker = self.book.order(maker_handle);
                maker_price = maker.price;
                trade_qty = incoming.remaining_qty.min(maker.remaining_qty);
            }

            incoming.remaining_qty -= trade_qty;
            let maker_remaining = self.book.fill(maker_handle, trade_qty);

            let maker_snapshot = if maker_remaining == 0 {
                let mut filled = self.book.remove(maker_handle);
                filled.status = OrderStatus::Filled;
                // The best level may have emptied; re-read it next turn.
                level_cursor = self.book.best(opposite);
                filled
            } else {
                let mut partial = self.book.order(maker_handle).clone();
                partial.status = OrderStatus::Partial;
                partial
            };

            let trade = match incoming.side {
                Side::Buy => Trade {
                    buy_order_id: incoming.order_id.clone(),
                    sell_order_id: maker_snapshot.order_id.clone(),
                    symbol: self.symbol.clone(),
                    price: maker_price,
                    quantity: trade_qty,
                    timestamp_ms: now_millis(),
                    buy_user_id: incoming.user_id.clone(),
                    sell_user_id: maker_snapshot.user_id.clone(),
                },
                Side::Sell => Trade {
                    buy_order_id: maker_snapshot.order_id.clone(),
                    sell_order_id: incoming.order_id.clone(),
                    symbol: self.symbol.clone(),
                    price: maker_price,
                    quantity: trade_qty,
                    timestamp_ms: now_millis(),
                    buy_user_id: maker_snapshot.user_id.clone(),
                    sell_user_id: incoming.user_id.clone(),
                },
            };
            trades.push(trade);

            self.cache_status(&maker_snapshot);
            if maker_snapshot.status == OrderStatus::Filled {
                self.reservations
                    .release(&maker_snapshot, ReleaseReason::Filled);
                self.persistence.record_order(&maker_snapshot, None);
            }
        }

        (trades, band_stopped)
    }

    /// Push a trade to the publisher, yielding while the ring is full and
    /// dropping only if shutdown lands first (the publisher drains and
    /// settles whatever was already queued).
    fn publish_trade(&self, trade: Trade) {
        let mut pending = trade;
        loop {
            match self.trade_queue.push(pending) {
                Ok(()) => return,
                Err(back) => {
                    if !self.running.load(Ordering::Acquire) {
                        warn!(
                            symbol = %self.symbol,
                            "dropping trade on shutdown, queue full"
                        );
                        return;
                    }
                    pending = back;
                    thread::yield_now();
                }
            }
        }
    }

    fn update_vwap(&mut self, price: Price, qty: i64) {
        if self.vwap_denominator > VWAP_RESET_THRESHOLD {
            // Renormalize, preserving the current value at reduced weight.
            let current = self.stats.vwap() as f64 / 100.0;
            self.vwap_numerator = current * 1_000_000.0;
            self.vwap_denominator = 1_000_000;
        }
        self.vwap_numerator += price_to_dollars(price) * qty as f64;
        self.vwap_denominator += qty;
        if self.vwap_denominator > 0 {
            let vwap_dollars = self.vwap_numerator / self.vwap_denominator as f64;
            self.stats
                .vwap
                .store((vwap_dollars * 100.0 + 0.5).floor() as i64, Ordering::Relaxed);
        }
    }

    fn emit_market_data(&mut self) {
        let update = MarketDataUpdate {
            symbol: self.symbol.clone(),
            last_price: self.stats.last_price(),
            last_qty: self.stats.last_qty.load(Ordering::Relaxed),
            top_bids: self.book.top_levels(Side::Buy, 5),
            top_asks: self.book.top_levels(Side::Sell, 5),
            timestamp_ms: now_millis(),
        };
        self.refresh_depth(update.timestamp_ms);

        let mut pending = update;
        loop {
            match self.md_queue.push(pending) {
                Ok(()) => return,
                Err(back) => {
                    if !self.running.load(Ordering::Acquire) {
                        return;
                    }
                    pending = back;
                    thread::yield_now();
                }
            }
        }
    }

    fn refresh_depth_if_stale(&mut self) {
        if !self.book_dirty {
            return;
        }
        let now = now_millis();
        if now - self.depth.read().taken_ms >= SNAPSHOT_CACHE_MS {
            self.refresh_depth(now);
        }
    }

    fn refresh_depth(&mut self, now: i64) {
        let mut depth = self.depth.write();
        depth.bids = self.book.top_levels(Side::Buy, 5);
        depth.asks = self.book.top_levels(Side::Sell, 5);
        depth.taken_ms = now;
        self.book_dirty = false;
    }

    /// Record a status without ever regressing a terminal state.
    fn cache_status(&self, order: &Order) {
        use dashmap::mapref::entry::Entry;
        match self.status_cache.entry(order.order_id.clone()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().status.is_terminal() {
                    occupied.insert(order.clone());
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(order.clone());
            }
        }
    }
}

// ============================================================================
// Publisher Loops
// ============================================================================

fn trade_publisher_loop(
    symbol: String,
    queue: Arc<ArrayQueue<Trade>>,
    running: Arc<AtomicBool>,
    stats: Arc<SymbolStats>,
    reservations: Arc<dyn ReservationPort>,
    persistence: PersistenceHandle,
    trade_tx: broadcast::Sender<Trade>,
) {
    info!(symbol = %symbol, "trade publisher started");
    let mut waiter = AdaptiveWaiter::new();
    let mut seq: u64 = 0;
    loop {
        if !running.load(Ordering::SeqCst) {
            // Settle whatever the matcher already produced before exiting;
            // these trades mutated the book, so they must reach accounts.
            while let Some(trade) = queue.pop() {
                seq += 1;
                settle_trade(&stats, &reservations, &persistence, &trade_tx, trade, seq);
            }
            break;
        }

        let trade = queue.pop();
        let did_work = trade.is_some();
        if let Some(trade) = trade {
            seq += 1;
            settle_trade(&stats, &reservations, &persistence, &trade_tx, trade, seq);
        }

        waiter.record_iteration(did_work);
        if !did_work {
            waiter.wait_for_work();
        }
    }
    info!(symbol = %symbol, "trade publisher stopped");
}

fn settle_trade(
    stats: &SymbolStats,
    reservations: &Arc<dyn ReservationPort>,
    persistence: &PersistenceHandle,
    trade_tx: &broadcast::Sender<Trade>,
    trade: Trade,
    seq: u64,
) {
    stats.trades_executed.fetch_add(1, Ordering::Relaxed);
    reservations.apply_trade(&trade);
    persistence.record_trade(&trade, seq);
    obs::record_trade_executed(trade.value());
    // No receivers is fine; market data is best-effort.
    let _ = trade_tx.send(trade);
}

fn market_data_publisher_loop(
    symbol: String,
    queue: Arc<ArrayQueue<MarketDataUpdate>>,
    running: Arc<AtomicBool>,
    stats: Arc<SymbolStats>,
    md_tx: broadcast::Sender<MarketDataUpdate>,
) {
    info!(symbol = %symbol, "market data publisher started");
    let mut waiter = AdaptiveWaiter::new();
    loop {
        if !running.load(Ordering::SeqCst) {
            while queue.pop().is_some() {}
            break;
        }

        let update = queue.pop();
        let did_work = update.is_some();
        if let Some(update) = update {
            stats.messages_sent.fetch_add(1, Ordering::Relaxed);
            let _ = md_tx.send(update);
        }

        waiter.record_iteration(did_work);
        if !did_work {
            waiter.wait_for_work();
        }
    }
    info!(symbol = %symbol, "market data publisher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::matching::types::price_from_dollars;
    use tokio::sync::mpsc;

    /// Records every port interaction so tests can assert on the exact
    /// release reasons the engine emits.
    #[derive(Default)]
    struct RecordingPort {
        releases: Mutex<Vec<(String, ReleaseReason)>>,
        trades: Mutex<Vec<Trade>>,
    }

    impl ReservationPort for RecordingPort {
        fn reserve(&self, _order: &Order, _effective_price: Price) -> Result<(), SubmitError> {
            Ok(())
        }

        fn release(&self, order: &Order, reason: ReleaseReason) {
            self.releases.lock().push((order.order_id.clone(), reason));
        }

        fn apply_trade(&self, trade: &Trade) {
            self.trades.lock().push(trade.clone());
        }
    }

    struct TestBench {
        worker: MatchWorker,
        port: Arc<RecordingPort>,
        _persist_rx: mpsc::Receiver<crate::services::persistence::PersistEvent>,
    }

    fn bench(initial_price: Price) -> TestBench {
        let port = Arc::new(RecordingPort::default());
        let (persistence, rx) = PersistenceHandle::channel(1024);
        let worker = MatchWorker {
            symbol: "AAPL".to_string(),
            book: OrderBook::new(MAX_ORDER_BOOK_DEPTH),
            ingress: Arc::new(ArrayQueue::new(64)),
            trade_queue: Arc::new(ArrayQueue::new(256)),
            md_queue: Arc::new(ArrayQueue::new(64)),
            running: Arc::new(AtomicBool::new(true)),
            stats: Arc::new(SymbolStats::new(initial_price)),
            status_cache: Arc::new(DashMap::new()),
            depth: Arc::new(RwLock::new(DepthSnapshot::default())),
            reservations: Arc::clone(&port) as Arc<dyn ReservationPort>,
            persistence,
            waiter: AdaptiveWaiter::new(),
            commands_seen: 0,
            book_dirty: false,
            vwap_numerator: 0.0,
            vwap_denominator: 0,
        };
        TestBench {
            worker,
            port,
            _persist_rx: rx,
        }
    }

    fn limit(id: &str, user: &str, side: Side, qty: i64, dollars: f64) -> Order {
        Order::new(id, user, "AAPL", side, OrderKind::Limit, qty, price_from_dollars(dollars))
    }

    fn drain_trades(worker: &MatchWorker) -> Vec<Trade> {
        let mut out = Vec::new();
        while let Some(t) = worker.trade_queue.pop() {
            out.push(t);
        }
        out
    }

    fn status(worker: &MatchWorker, id: &str) -> OrderStatus {
        worker.status_cache.get(id).expect("cached").status
    }

    #[test]
    fn test_cross_trades_at_maker_price() {
        let mut b = bench(price_from_dollars(100.0));
        b.worker.process_new_order(limit("maker", "alice", Side::Buy, 10, 101.0));
        b.worker.process_new_order(limit("taker", "bob", Side::Sell, 10, 100.0));

        let trades = drain_trades(&b.worker);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].price, price_from_dollars(101.0));
        assert_eq!(trades[0].quantity, 10);
        assert_eq!(trades[0].buy_user_id, "alice");
        assert_eq!(trades[0].sell_user_id, "bob");

        assert_eq!(status(&b.worker, "maker"), OrderStatus::Filled);
        assert_eq!(status(&b.worker, "taker"), OrderStatus::Filled);
        assert_eq!(b.worker.stats.last_price(), price_from_dollars(101.0));
        assert_eq!(b.worker.stats.volume(), 10);

        let releases = b.port.releases.lock();
        assert!(releases.contains(&("maker".to_string(), ReleaseReason::Filled)));
        assert!(releases.contains(&("taker".to_string(), ReleaseReason::Filled)));
    }

    #[test]
    fn test_partial_taker_rests_on_book() {
        let mut b = bench(price_from_dollars(100.0));
        b.worker.process_new_order(limit("maker", "alice", Side::Sell, 40, 100.0));
        b.worker.process_new_order(limit("taker", "bob", Side::Buy, 100, 100.0));

        assert_eq!(drain_trades(&b.worker).len(), 1);
        let taker = b.worker.status_cache.get("taker").unwrap().clone();
        assert_eq!(taker.status, OrderStatus::Partial);
        assert_eq!(taker.remaining_qty, 60);
        assert!(b.worker.book.contains("taker"));
        assert_eq!(b.worker.book.side_count(Side::Buy), 1);
        assert_eq!(b.worker.book.side_count(Side::Sell), 0);
    }

    #[test]
    fn test_sweep_multiple_levels_in_price_order() {
        let mut b = bench(price_from_dollars(100.0));
        b.worker.process_new_order(limit("a1", "alice", Side::Sell, 10, 100.0));
        b.worker.process_new_order(limit("a2", "alice", Side::Sell, 10, 101.0));
        b.worker.process_new_order(limit("a3", "alice", Side::Sell, 10, 102.0));
        b.worker.process_new_order(limit("taker", "bob", Side::Buy, 25, 101.5));

        let trades = drain_trades(&b.worker);
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].price, price_from_dollars(100.0));
        assert_eq!(trades[1].price, price_from_dollars(101.0));

        // Remainder rests at the taker's limit; the $102 ask is untouched.
        let taker = b.worker.status_cache.get("taker").unwrap().clone();
        assert_eq!(taker.status, OrderStatus::Partial);
        assert_eq!(taker.remaining_qty, 5);
        assert_eq!(status(&b.worker, "a3"), OrderStatus::Open);
    }

    #[test]
    fn test_ioc_remainder_cancelled_with_reason() {
        let mut b = bench(price_from_dollars(50.0));
        b.worker.process_new_order(limit("maker", "g", Side::Sell, 40, 50.0));
        let ioc = Order::new(
            "ioc", "f", "AAPL", Side::Buy, OrderKind::Ioc, 100, price_from_dollars(50.0),
        );
        b.worker.process_new_order(ioc);

        assert_eq!(drain_trades(&b.worker).len(), 1);
        let cached = b.worker.status_cache.get("ioc").unwrap().clone();
        assert_eq!(cached.status, OrderStatus::Cancelled);
        assert_eq!(cached.remaining_qty, 60);
        assert!(!b.worker.book.contains("ioc"));
        assert!(b
            .port
            .releases
            .lock()
            .contains(&("ioc".to_string(), ReleaseReason::IocRemainder)));
    }

    #[test]
    fn test_fok_infeasible_when_only_self_liquidity() {
        let mut b = bench(price_from_dollars(100.0));
        // 60 shares from the submitter and only 40 from others.
        b.worker.process_new_order(limit("own", "carol", Side::Sell, 60, 100.0));
        b.worker.process_new_order(limit("other", "dave", Side::Sell, 40, 100.0));

        let fok = Order::new(
            "fok", "carol", "AAPL", Side::Buy, OrderKind::Fok, 50, price_from_dollars(100.0),
        );
        b.worker.process_new_order(fok);

        // Zero trades, both makers untouched.
        assert!(drain_trades(&b.worker).is_empty());
        assert_eq!(status(&b.worker, "fok"), OrderStatus::Cancelled);
        assert_eq!(status(&b.worker, "own"), OrderStatus::Open);
        assert_eq!(status(&b.worker, "other"), OrderStatus::Open);
        assert!(b
            .port
            .releases
            .lock()
            .contains(&("fok".to_string(), ReleaseReason::FokNotFilled)));
    }

    #[test]
    fn test_fok_feasible_fills_fully() {
        let mut b = bench(price_from_dollars(100.0));
        b.worker.process_new_order(limit("m1", "alice", Side::Sell, 30, 100.0));
        b.worker.process_new_order(limit("m2", "bob", Side::Sell, 30, 101.0));

        let fok = Order::new(
            "fok", "carol", "AAPL", Side::Buy, OrderKind::Fok, 50, price_from_dollars(101.0),
        );
        b.worker.process_new_order(fok);

        let trades = drain_trades(&b.worker);
        assert_eq!(trades.iter().map(|t| t.quantity).sum::<i64>(), 50);
        assert_eq!(status(&b.worker, "fok"), OrderStatus::Filled);
    }

    #[test]
    fn test_market_band_stops_before_outlier_level() {
        let mut b = bench(price_from_dollars(300.0));
        b.worker.process_new_order(limit("near", "alice", Side::Sell, 5, 320.0));
        b.worker.process_new_order(limit("far", "bob", Side::Sell, 10, 400.0));

        let market = Order::new("mkt", "carol", "AAPL", Side::Buy, OrderKind::Market, 10, 0);
        b.worker.process_new_order(market);

        // $320 is inside the +10% band of $300 ($330); $400 is not.
        let trades = drain_trades(&b.worker);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].price, price_from_dollars(320.0));
        let cached = b.worker.status_cache.get("mkt").unwrap().clone();
        assert_eq!(cached.status, OrderStatus::Cancelled);
        assert_eq!(cached.remaining_qty, 5);
        assert!(b
            .port
            .releases
            .lock()
            .contains(&("mkt".to_string(), ReleaseReason::MarketUnmatched)));
        // The out-of-band maker is untouched.
        assert_eq!(status(&b.worker, "far"), OrderStatus::Open);
    }

    #[test]
    fn test_market_sell_band_floor() {
        let mut b = bench(price_from_dollars(300.0));
        // The only bid sits far below the -10% floor ($270).
        b.worker.process_new_order(limit("low", "alice", Side::Buy, 10, 200.0));

        let market = Order::new("mkt", "bob", "AAPL", Side::Sell, OrderKind::Market, 10, 0);
        b.worker.process_new_order(market);

        assert!(drain_trades(&b.worker).is_empty());
        assert_eq!(status(&b.worker, "mkt"), OrderStatus::Cancelled);
        assert_eq!(status(&b.worker, "low"), OrderStatus::Open);
    }

    #[test]
    fn test_ioc_with_no_match_cancels_whole_order() {
        let mut b = bench(price_from_dollars(50.0));
        let ioc = Order::new(
            "ioc", "f", "AAPL", Side::Buy, OrderKind::Ioc, 10, price_from_dollars(50.0),
        );
        b.worker.process_new_order(ioc);

        assert!(drain_trades(&b.worker).is_empty());
        let cached = b.worker.status_cache.get("ioc").unwrap().clone();
        assert_eq!(cached.status, OrderStatus::Cancelled);
        assert_eq!(cached.remaining_qty, 10);
        assert_eq!(b.worker.book.side_count(Side::Buy), 0);
    }

    #[test]
    fn test_market_order_never_rests() {
        let mut b = bench(price_from_dollars(100.0));
        let market = Order::new("mkt", "carol", "AAPL", Side::Buy, OrderKind::Market, 10, 0);
        b.worker.process_new_order(market);

        assert!(drain_trades(&b.worker).is_empty());
        assert_eq!(status(&b.worker, "mkt"), OrderStatus::Cancelled);
        assert_eq!(b.worker.book.side_count(Side::Buy), 0);
    }

    #[test]
    fn test_self_trade_skip_leaves_level_intact() {
        let mut b = bench(price_from_dollars(150.0));
        b.worker.process_new_order(limit("sell", "dave", Side::Sell, 10, 150.0));
        b.worker.process_new_order(limit("buy", "dave", Side::Buy, 10, 150.0));

        assert!(drain_trades(&b.worker).is_empty());
        assert_eq!(status(&b.worker, "sell"), OrderStatus::Open);
        assert_eq!(status(&b.worker, "buy"), OrderStatus::Open);
        assert_eq!(b.worker.book.side_count(Side::Buy), 1);
        assert_eq!(b.worker.book.side_count(Side::Sell), 1);
        // No releases either: both reservations stay live with their orders.
        assert!(b.port.releases.lock().is_empty());
    }

    #[test]
    fn test_taker_fills_through_own_order_level() {
        let mut b = bench(price_from_dollars(100.0));
        // Dave's own ask sits at the best price; Erin's is behind it.
        b.worker.process_new_order(limit("own", "dave", Side::Sell, 10, 100.0));
        b.worker.process_new_order(limit("erin", "erin", Side::Sell, 10, 101.0));
        b.worker.process_new_order(limit("take", "dave", Side::Buy, 10, 101.0));

        let trades = drain_trades(&b.worker);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].price, price_from_dollars(101.0));
        assert_eq!(trades[0].sell_user_id, "erin");
        // Dave's resting ask survives the sweep.
        assert_eq!(status(&b.worker, "own"), OrderStatus::Open);
    }

    #[test]
    fn test_duplicate_order_id_rejected_in_book() {
        let mut b = bench(price_from_dollars(100.0));
        b.worker.process_new_order(limit("dup", "alice", Side::Buy, 5, 99.0));
        b.worker.process_new_order(limit("dup", "alice", Side::Buy, 5, 99.0));

        // The cache keeps the live resting order; the duplicate released
        // its reservation with a rejection.
        assert_eq!(status(&b.worker, "dup"), OrderStatus::Open);
        assert!(b
            .port
            .releases
            .lock()
            .contains(&("dup".to_string(), ReleaseReason::Rejected)));
    }

    #[test]
    fn test_cancel_removes_resting_order() {
        let mut b = bench(price_from_dollars(100.0));
        b.worker.process_new_order(limit("o1", "alice", Side::Buy, 5, 99.0));
        b.worker.process_cancel("o1");

        assert_eq!(status(&b.worker, "o1"), OrderStatus::Cancelled);
        assert!(!b.worker.book.contains("o1"));
        assert!(b
            .port
            .releases
            .lock()
            .contains(&("o1".to_string(), ReleaseReason::Cancelled)));

        // Cancelling again (or a filled order) is a no-op.
        b.worker.process_cancel("o1");
        assert_eq!(b.port.releases.lock().len(), 1);
    }

    #[test]
    fn test_terminal_status_is_never_overwritten() {
        let b = bench(price_from_dollars(100.0));
        let mut order = limit("o1", "alice", Side::Buy, 5, 99.0);
        order.status = OrderStatus::Filled;
        b.worker.cache_status(&order);

        order.status = OrderStatus::Open;
        b.worker.cache_status(&order);
        assert_eq!(status(&b.worker, "o1"), OrderStatus::Filled);
    }

    #[test]
    fn test_shutdown_drain_releases_queued_orders() {
        let mut b = bench(price_from_dollars(100.0));
        b.worker
            .ingress
            .push(EngineCommand::New(limit("q1", "alice", Side::Buy, 5, 99.0)))
            .unwrap();
        b.worker
            .ingress
            .push(EngineCommand::New(limit("q2", "bob", Side::Buy, 5, 99.0)))
            .unwrap();
        b.worker.running.store(false, Ordering::SeqCst);
        b.worker.drain_on_shutdown();

        let releases = b.port.releases.lock();
        assert!(releases.contains(&("q1".to_string(), ReleaseReason::EngineShutdown)));
        assert!(releases.contains(&("q2".to_string(), ReleaseReason::EngineShutdown)));
    }

    #[test]
    fn test_vwap_tracks_trades_and_survives_renormalization() {
        let mut b = bench(price_from_dollars(100.0));
        b.worker.update_vwap(price_from_dollars(100.0), 10);
        b.worker.update_vwap(price_from_dollars(200.0), 10);
        assert_eq!(b.worker.stats.vwap(), price_from_dollars(150.0));

        // Force the overflow guard; the published value must not regress.
        b.worker.vwap_denominator = VWAP_RESET_THRESHOLD + 1;
        b.worker.update_vwap(price_from_dollars(150.0), 1);
        let vwap = b.worker.stats.vwap();
        assert!((vwap - price_from_dollars(150.0)).abs() <= 1, "vwap={vwap}");
    }
}
