//! Asynchronous Order/Trade Persistence
//!
//! Engine threads hand audit records to a bounded queue and move on; a
//! single worker drains the queue into batched transactions against the
//! durable store. Backpressure policy is drop-with-log, never block: the
//! matching hot path must not wait on the database.

use crate::db::Database;
use crate::metrics as obs;
use crate::services::matching::types::{Order, Trade};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Capacity of the event queue shared by every engine thread.
pub const DEFAULT_QUEUE_CAPACITY: usize = 8192;

/// A partially filled batch is flushed after this long.
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Order lifecycle record for the audit log. `reason` carries the detail
/// behind cancels/rejects ("ioc_remainder", "market_band", ...).
#[derive(Debug, Clone)]
pub struct OrderEvent {
    pub order: Order,
    pub reason: Option<&'static str>,
}

/// Trade record with its deterministic identity. The id is a v5 UUID over
/// `(buy_order_id, sell_order_id, timestamp, seq)`, which together with the
/// unique constraint makes replayed writes idempotent.
#[derive(Debug, Clone)]
pub struct TradeEvent {
    pub trade_id: Uuid,
    pub trade: Trade,
}

impl TradeEvent {
    pub fn new(trade: Trade, seq: u64) -> Self {
        let key = format!(
            "{}:{}:{}:{}",
            trade.buy_order_id, trade.sell_order_id, trade.timestamp_ms, seq
        );
        Self {
            trade_id: Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()),
            trade,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PersistEvent {
    Order(OrderEvent),
    Trade(TradeEvent),
}

/// Cloneable producer side of the persistence queue.
#[derive(Clone)]
pub struct PersistenceHandle {
    tx: mpsc::Sender<PersistEvent>,
}

impl PersistenceHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PersistEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn record_order(&self, order: &Order, reason: Option<&'static str>) {
        self.push(PersistEvent::Order(OrderEvent {
            order: order.clone(),
            reason,
        }));
    }

    pub fn record_trade(&self, trade: &Trade, seq: u64) {
        self.push(PersistEvent::Trade(TradeEvent::new(trade.clone(), seq)));
    }

    fn push(&self, event: PersistEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(?event, "persistence queue full, dropping event");
                obs::record_persist_drop();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Worker already stopped; nothing left to audit to.
                debug!("persistence queue closed, dropping event");
            }
        }
    }
}

/// Drains the event queue into batched transactions.
pub struct PersistenceWorker {
    db: Database,
    rx: mpsc::Receiver<PersistEvent>,
    batch_size: usize,
}

impl PersistenceWorker {
    pub fn new(db: Database, rx: mpsc::Receiver<PersistEvent>, batch_size: usize) -> Self {
        Self { db, rx, batch_size }
    }

    pub async fn run(mut self) {
        info!(batch_size = self.batch_size, "persistence worker started");
        let mut batch: Vec<PersistEvent> = Vec::with_capacity(self.batch_size);
        loop {
            match tokio::time::timeout(FLUSH_INTERVAL, self.rx.recv()).await {
                Ok(Some(event)) => {
                    batch.push(event);
                    if batch.len() >= self.batch_size {
                        self.flush(&mut batch).await;
                    }
                }
                Ok(None) => {
                    self.flush(&mut batch).await;
                    break;
                }
                Err(_) => {
                    // Flush a partial batch rather than sit on it.
                    self.flush(&mut batch).await;
                }
            }
        }
        info!("persistence worker stopped");
    }

    async fn flush(&self, batch: &mut Vec<PersistEvent>) {
        if batch.is_empty() {
            return;
        }
        let timer = obs::Timer::new();
        match self.db.write_events(batch).await {
            Ok(()) => {
                debug!(count = batch.len(), "persisted event batch");
                obs::record_persist_batch(batch.len(), timer.elapsed_secs());
            }
            Err(e) => {
                // The engine keeps running; the audit gap is logged.
                error!(count = batch.len(), error = %e, "failed to persist event batch");
            }
        }
        batch.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::matching::types::{OrderKind, Side};

    fn sample_trade() -> Trade {
        Trade {
            buy_order_id: "b1".into(),
            sell_order_id: "s1".into(),
            symbol: "AAPL".into(),
            price: 10100,
            quantity: 10,
            timestamp_ms: 1_700_000_000_000,
            buy_user_id: "alice".into(),
            sell_user_id: "bob".into(),
        }
    }

    #[test]
    fn test_trade_event_id_is_deterministic() {
        let a = TradeEvent::new(sample_trade(), 7);
        let b = TradeEvent::new(sample_trade(), 7);
        let c = TradeEvent::new(sample_trade(), 8);
        assert_eq!(a.trade_id, b.trade_id);
        assert_ne!(a.trade_id, c.trade_id);
    }

    #[test]
    fn test_queue_full_drops_instead_of_blocking() {
        let (handle, _rx) = PersistenceHandle::channel(1);
        let order = Order::new("o1", "u1", "AAPL", Side::Buy, OrderKind::Limit, 1, 100);
        // Capacity one: the second record must drop, not block this thread.
        handle.record_order(&order, None);
        handle.record_order(&order, None);
    }
}
