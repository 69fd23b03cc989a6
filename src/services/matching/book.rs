//! Per-Symbol Limit Order Book
//!
//! Price-time priority book owned exclusively by one matching thread.
//! Bids form a strictly descending chain of price levels, asks a strictly
//! ascending one; each level holds a FIFO of resting orders. Levels and
//! orders live in arenas and are addressed by typed indices, which keeps
//! removal O(1) given a handle without any pointer juggling.

use super::types::{BookLevel, Order, Price, Side};
use std::collections::HashMap;

/// Handle to a resting order inside the book's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderRef(u32);

/// Handle to a price level inside the book's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelRef(u32);

/// Fixed-slot arena with a free list. Slots are recycled on removal so
/// handles stay dense under churn.
struct Arena<T> {
    slots: Vec<Option<T>>,
    free: Vec<u32>,
}

impl<T> Arena<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, value: T) -> u32 {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(value);
                idx
            }
            None => {
                self.slots.push(Some(value));
                (self.slots.len() - 1) as u32
            }
        }
    }

    fn remove(&mut self, idx: u32) -> T {
        let value = self.slots[idx as usize]
            .take()
            .expect("arena slot already vacant");
        self.free.push(idx);
        value
    }

    fn get(&self, idx: u32) -> &T {
        self.slots[idx as usize]
            .as_ref()
            .expect("arena slot vacant")
    }

    fn get_mut(&mut self, idx: u32) -> &mut T {
        self.slots[idx as usize]
            .as_mut()
            .expect("arena slot vacant")
    }
}

struct OrderNode {
    order: Order,
    prev: Option<OrderRef>,
    next: Option<OrderRef>,
    level: LevelRef,
}

struct LevelNode {
    price: Price,
    total_quantity: i64,
    head: Option<OrderRef>,
    tail: Option<OrderRef>,
    next: Option<LevelRef>,
}

/// Arena-backed order book for one symbol.
pub struct OrderBook {
    orders: Arena<OrderNode>,
    levels: Arena<LevelNode>,
    best_bid: Option<LevelRef>,
    best_ask: Option<LevelRef>,
    by_id: HashMap<String, OrderRef>,
    buy_count: usize,
    sell_count: usize,
    max_depth: usize,
}

impl OrderBook {
    pub fn new(max_depth: usize) -> Self {
        Self {
            orders: Arena::with_capacity(1024),
            levels: Arena::with_capacity(256),
            best_bid: None,
            best_ask: None,
            by_id: HashMap::new(),
            buy_count: 0,
            sell_count: 0,
            max_depth,
        }
    }

    pub fn contains(&self, order_id: &str) -> bool {
        self.by_id.contains_key(order_id)
    }

    pub fn lookup(&self, order_id: &str) -> Option<OrderRef> {
        self.by_id.get(order_id).copied()
    }

    pub fn side_count(&self, side: Side) -> usize {
        match side {
            Side::Buy => self.buy_count,
            Side::Sell => self.sell_count,
        }
    }

    pub fn best(&self, side: Side) -> Option<LevelRef> {
        match side {
            Side::Buy => self.best_bid,
            Side::Sell => self.best_ask,
        }
    }

    pub fn best_bid_price(&self) -> Option<Price> {
        self.best_bid.map(|l| self.levels.get(l.0).price)
    }

    pub fn best_ask_price(&self) -> Option<Price> {
        self.best_ask.map(|l| self.levels.get(l.0).price)
    }

    pub fn next_level(&self, level: LevelRef) -> Option<LevelRef> {
        self.levels.get(level.0).next
    }

    pub fn level_price(&self, level: LevelRef) -> Price {
        self.levels.get(level.0).price
    }

    pub fn level_quantity(&self, level: LevelRef) -> i64 {
        self.levels.get(level.0).total_quantity
    }

    pub fn order(&self, handle: OrderRef) -> &Order {
        &self.orders.get(handle.0).order
    }

    /// First resting order at `level` not owned by `exclude_user`, in FIFO
    /// order. Returns None when the level holds only the excluded user's
    /// orders; the skipped makers are left untouched.
    pub fn first_counterparty(&self, level: LevelRef, exclude_user: &str) -> Option<OrderRef> {
        let mut cursor = self.levels.get(level.0).head;
        while let Some(handle) = cursor {
            let node = self.orders.get(handle.0);
            if node.order.user_id != exclude_user {
                return Some(handle);
            }
            cursor = node.next;
        }
        None
    }

    /// Total quantity resting at or better than `limit` on `side`, skipping
    /// `exclude_user`'s orders. `limit = None` walks the whole side. Used by
    /// the FOK feasibility check before any mutation.
    pub fn available_quantity(
        &self,
        side: Side,
        limit: Option<Price>,
        exclude_user: &str,
    ) -> i64 {
        let mut total = 0i64;
        let mut cursor = self.best(side);
        while let Some(level_ref) = cursor {
            let level = self.levels.get(level_ref.0);
            if let Some(limit) = limit {
                let beyond = match side {
                    // Walking asks for a buyer: stop above the limit.
                    Side::Sell => level.price > limit,
                    // Walking bids for a seller: stop below the limit.
                    Side::Buy => level.price < limit,
                };
                if beyond {
                    break;
                }
            }
            let mut order_cursor = level.head;
            while let Some(handle) = order_cursor {
                let node = self.orders.get(handle.0);
                if node.order.user_id != exclude_user {
                    total += node.order.remaining_qty;
                }
                order_cursor = node.next;
            }
            cursor = level.next;
        }
        total
    }

    /// Place a resting order at the tail of its price level's FIFO,
    /// creating the level if absent. Fails (handing the order back) only
    /// when the side's depth cap is reached.
    pub fn insert(&mut self, order: Order) -> Result<OrderRef, Order> {
        let side = order.side;
        if self.side_count(side) >= self.max_depth {
            return Err(order);
        }

        let level_ref = self.find_or_create_level(order.price, side);
        let remaining = order.remaining_qty;
        let order_id = order.order_id.clone();

        let level = self.levels.get(level_ref.0);
        let old_tail = level.tail;

        let handle = OrderRef(self.orders.insert(OrderNode {
            order,
            prev: old_tail,
            next: None,
            level: level_ref,
        }));

        let level = self.levels.get_mut(level_ref.0);
        level.tail = Some(handle);
        if level.head.is_none() {
            level.head = Some(handle);
        }
        if let Some(tail) = old_tail {
            self.orders.get_mut(tail.0).next = Some(handle);
        }
        self.levels.get_mut(level_ref.0).total_quantity += remaining;

        self.by_id.insert(order_id, handle);
        match side {
            Side::Buy => self.buy_count += 1,
            Side::Sell => self.sell_count += 1,
        }
        Ok(handle)
    }

    /// Reduce a resting order by `qty`, keeping the level's total in sync.
    /// Returns the order's remaining quantity after the fill; the caller
    /// removes the order when it reaches zero.
    pub fn fill(&mut self, handle: OrderRef, qty: i64) -> i64 {
        let node = self.orders.get_mut(handle.0);
        node.order.remaining_qty -= qty;
        let remaining = node.order.remaining_qty;
        let level_ref = node.level;
        self.levels.get_mut(level_ref.0).total_quantity -= qty;
        remaining
    }

    /// Unlink an order in O(1) and drop its level if that left it empty.
    pub fn remove(&mut self, handle: OrderRef) -> Order {
        let node = self.orders.remove(handle.0);
        let level_ref = node.level;

        // Unlink from the level FIFO.
        match node.prev {
            Some(prev) => self.orders.get_mut(prev.0).next = node.next,
            None => self.levels.get_mut(level_ref.0).head = node.next,
        }
        match node.next {
            Some(next) => self.orders.get_mut(next.0).prev = node.prev,
            None => self.levels.get_mut(level_ref.0).tail = node.prev,
        }

        let level = self.levels.get_mut(level_ref.0);
        level.total_quantity -= node.order.remaining_qty;
        let level_empty = level.head.is_none();
        debug_assert!(!level_empty || level.total_quantity == 0);

        self.by_id.remove(&node.order.order_id);
        match node.order.side {
            Side::Buy => self.buy_count -= 1,
            Side::Sell => self.sell_count -= 1,
        }

        if level_empty {
            self.unlink_level(node.order.side, level_ref);
        }

        node.order
    }

    /// Top `count` levels on `side`, best first.
    pub fn top_levels(&self, side: Side, count: usize) -> Vec<BookLevel> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = self.best(side);
        while let Some(level_ref) = cursor {
            if out.len() >= count {
                break;
            }
            let level = self.levels.get(level_ref.0);
            if level.total_quantity > 0 {
                out.push(BookLevel {
                    price: level.price,
                    quantity: level.total_quantity,
                });
            }
            cursor = level.next;
        }
        out
    }

    fn find_or_create_level(&mut self, price: Price, side: Side) -> LevelRef {
        let head = self.best(side);

        let better = |candidate: Price, than: Price| match side {
            Side::Buy => candidate > than,
            Side::Sell => candidate < than,
        };

        // New best-of-book level.
        let replace_head = match head {
            None => true,
            Some(h) => better(price, self.levels.get(h.0).price),
        };
        if replace_head {
            let new_ref = LevelRef(self.levels.insert(LevelNode {
                price,
                total_quantity: 0,
                head: None,
                tail: None,
                next: head,
            }));
            match side {
                Side::Buy => self.best_bid = Some(new_ref),
                Side::Sell => self.best_ask = Some(new_ref),
            }
            return new_ref;
        }

        // Walk the chain for an exact match or the insertion point.
        let mut cursor = head.expect("non-empty chain");
        loop {
            let current = self.levels.get(cursor.0);
            if current.price == price {
                return cursor;
            }
            let next = current.next;
            let insert_here = match next {
                None => true,
                Some(n) => better(price, self.levels.get(n.0).price),
            };
            if insert_here {
                let new_ref = LevelRef(self.levels.insert(LevelNode {
                    price,
                    total_quantity: 0,
                    head: None,
                    tail: None,
                    next,
                }));
                self.levels.get_mut(cursor.0).next = Some(new_ref);
                return new_ref;
            }
            cursor = next.expect("insertion point exists");
        }
    }

    /// Remove an empty level from its side's chain. O(1) when it is the
    /// best level (the matching hot path), O(#levels) otherwise (cancels).
    fn unlink_level(&mut self, side: Side, level_ref: LevelRef) {
        let next = self.levels.get(level_ref.0).next;
        let head = self.best(side);
        if head == Some(level_ref) {
            match side {
                Side::Buy => self.best_bid = next,
                Side::Sell => self.best_ask = next,
            }
        } else {
            let mut cursor = head;
            while let Some(current) = cursor {
                if self.levels.get(current.0).next == Some(level_ref) {
                    self.levels.get_mut(current.0).next = next;
                    break;
                }
                cursor = self.levels.get(current.0).next;
            }
        }
        self.levels.remove(level_ref.0);
    }

    /// Sum of live remaining quantities per level, for consistency checks.
    #[cfg(test)]
    fn level_fifo_quantity(&self, level_ref: LevelRef) -> i64 {
        let mut total = 0;
        let mut cursor = self.levels.get(level_ref.0).head;
        while let Some(handle) = cursor {
            let node = self.orders.get(handle.0);
            total += node.order.remaining_qty;
            cursor = node.next;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::matching::types::OrderKind;
    use proptest::prelude::*;

    fn limit(id: &str, user: &str, side: Side, qty: i64, price: Price) -> Order {
        Order::new(id, user, "AAPL", side, OrderKind::Limit, qty, price)
    }

    #[test]
    fn test_bid_chain_descending_ask_chain_ascending() {
        let mut book = OrderBook::new(100);
        for (id, price) in [("b1", 100_00), ("b2", 102_00), ("b3", 101_00)] {
            book.insert(limit(id, "u1", Side::Buy, 10, price)).unwrap();
        }
        for (id, price) in [("a1", 105_00), ("a2", 103_00), ("a3", 104_00)] {
            book.insert(limit(id, "u2", Side::Sell, 10, price)).unwrap();
        }

        assert_eq!(book.best_bid_price(), Some(102_00));
        assert_eq!(book.best_ask_price(), Some(103_00));

        let bids = book.top_levels(Side::Buy, 5);
        assert_eq!(
            bids.iter().map(|l| l.price).collect::<Vec<_>>(),
            vec![102_00, 101_00, 100_00]
        );
        let asks = book.top_levels(Side::Sell, 5);
        assert_eq!(
            asks.iter().map(|l| l.price).collect::<Vec<_>>(),
            vec![103_00, 104_00, 105_00]
        );
    }

    #[test]
    fn test_fifo_order_within_level() {
        let mut book = OrderBook::new(100);
        book.insert(limit("first", "u1", Side::Sell, 5, 100_00)).unwrap();
        book.insert(limit("second", "u2", Side::Sell, 5, 100_00)).unwrap();

        let level = book.best(Side::Sell).unwrap();
        let head = book.first_counterparty(level, "nobody").unwrap();
        assert_eq!(book.order(head).order_id, "first");
    }

    #[test]
    fn test_remove_mid_level_keeps_links() {
        let mut book = OrderBook::new(100);
        let _a = book.insert(limit("a", "u1", Side::Buy, 5, 100_00)).unwrap();
        let b = book.insert(limit("b", "u2", Side::Buy, 7, 100_00)).unwrap();
        let _c = book.insert(limit("c", "u3", Side::Buy, 9, 100_00)).unwrap();

        let removed = book.remove(b);
        assert_eq!(removed.order_id, "b");

        let level = book.best(Side::Buy).unwrap();
        assert_eq!(book.level_quantity(level), 14);
        assert_eq!(book.level_fifo_quantity(level), 14);
        assert!(!book.contains("b"));
        assert_eq!(book.side_count(Side::Buy), 2);
    }

    #[test]
    fn test_empty_level_is_unlinked() {
        let mut book = OrderBook::new(100);
        let a = book.insert(limit("a", "u1", Side::Sell, 5, 100_00)).unwrap();
        book.insert(limit("b", "u1", Side::Sell, 5, 101_00)).unwrap();

        book.remove(a);
        assert_eq!(book.best_ask_price(), Some(101_00));

        // Removing a mid-chain level also unlinks it.
        let c = book.insert(limit("c", "u1", Side::Sell, 5, 102_00)).unwrap();
        let mid = book.lookup("b").unwrap();
        book.remove(mid);
        assert_eq!(book.best_ask_price(), Some(102_00));
        let _ = c;
    }

    #[test]
    fn test_depth_cap() {
        let mut book = OrderBook::new(2);
        book.insert(limit("a", "u1", Side::Buy, 1, 100_00)).unwrap();
        book.insert(limit("b", "u1", Side::Buy, 1, 101_00)).unwrap();
        let rejected = book.insert(limit("c", "u1", Side::Buy, 1, 102_00));
        assert!(rejected.is_err());
        // The sell side has its own cap.
        assert!(book.insert(limit("d", "u1", Side::Sell, 1, 103_00)).is_ok());
    }

    #[test]
    fn test_available_quantity_excludes_user_and_respects_limit() {
        let mut book = OrderBook::new(100);
        book.insert(limit("a", "alice", Side::Sell, 50, 100_00)).unwrap();
        book.insert(limit("b", "bob", Side::Sell, 40, 101_00)).unwrap();
        book.insert(limit("c", "alice", Side::Sell, 30, 101_00)).unwrap();
        book.insert(limit("d", "carol", Side::Sell, 20, 102_00)).unwrap();

        // Buyer bob, limit $101: alice's 50 + alice's 30, bob's own excluded.
        assert_eq!(book.available_quantity(Side::Sell, Some(101_00), "bob"), 80);
        // No limit walks the whole side.
        assert_eq!(book.available_quantity(Side::Sell, None, "bob"), 100);
        assert_eq!(book.available_quantity(Side::Sell, Some(100_00), "dave"), 50);
    }

    #[test]
    fn test_first_counterparty_skips_self_without_mutation() {
        let mut book = OrderBook::new(100);
        book.insert(limit("own", "dave", Side::Sell, 10, 150_00)).unwrap();

        let level = book.best(Side::Sell).unwrap();
        assert!(book.first_counterparty(level, "dave").is_none());
        // The skipped order is still resting, untouched.
        assert!(book.contains("own"));
        assert_eq!(book.level_quantity(level), 10);
    }

    proptest! {
        /// Book consistency: after any sequence of inserts and removals,
        /// every level's total equals the sum of its live orders and the
        /// chains stay strictly sorted.
        #[test]
        fn prop_book_consistency(ops in prop::collection::vec((0u8..2, 0u8..2, 1i64..50, 1i64..20), 1..120)) {
            let mut book = OrderBook::new(10_000);
            let mut live: Vec<String> = Vec::new();
            for (i, (action, side, price_step, qty)) in ops.into_iter().enumerate() {
                let side = if side == 0 { Side::Buy } else { Side::Sell };
                if action == 0 || live.is_empty() {
                    let id = format!("o{i}");
                    let price = 100_00 + price_step * 10;
                    book.insert(limit(&id, "u1", side, qty, price)).unwrap();
                    live.push(id);
                } else {
                    let id = live.remove(i % live.len());
                    let handle = book.lookup(&id).unwrap();
                    book.remove(handle);
                }
            }

            for side in [Side::Buy, Side::Sell] {
                let mut cursor = book.best(side);
                let mut last_price: Option<Price> = None;
                while let Some(level) = cursor {
                    let price = book.level_price(level);
                    if let Some(last) = last_price {
                        match side {
                            Side::Buy => prop_assert!(price < last),
                            Side::Sell => prop_assert!(price > last),
                        }
                    }
                    prop_assert!(book.level_quantity(level) > 0);
                    prop_assert_eq!(book.level_quantity(level), book.level_fifo_quantity(level));
                    last_price = Some(price);
                    cursor = book.next_level(level);
                }
            }
        }
    }
}
