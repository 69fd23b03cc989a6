//! Account Manager & Reservation Ledger
//!
//! The pre-trade risk gate. Every order holds cash (buys) or shares
//! (sells) against its account before it may reach a matching engine;
//! fills consume the hold, cancels and rejects give it back. The manager
//! guarantees, at every observable instant:
//!
//! - `0 <= reserved_cash <= cash` and `0 <= reserved[s] <= positions[s]`
//! - the ledger's per-order holds sum exactly to each account's totals
//! - a trade conserves total cash and total shares across its two sides
//!
//! Lock discipline: an account's mutex first, then the process-wide ledger
//! mutex. `apply_trade` touches two accounts and takes their locks in
//! lexicographic user-id order.

use crate::db::Database;
use crate::services::matching::engine::ReservationPort;
use crate::services::matching::types::{
    Order, Price, ReleaseReason, Side, SubmitError, Trade,
};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// New accounts start with $100,000.00.
pub const DEFAULT_INITIAL_CASH: Price = 10_000_000;

/// Mutable per-user balances, guarded by the account's own mutex.
#[derive(Debug, Default)]
struct AccountState {
    cash: i64,
    reserved_cash: i64,
    positions: HashMap<String, i64>,
    reserved: HashMap<String, i64>,
    total_trades: i64,
    realized_pnl: i64,
    active: bool,
    dirty: bool,
}

struct Account {
    state: Mutex<AccountState>,
}

/// Read-only copy of an account, used for queries and database flushes.
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub user_id: String,
    pub cash: i64,
    pub reserved_cash: i64,
    pub positions: HashMap<String, i64>,
    pub reserved: HashMap<String, i64>,
    pub buying_power: i64,
    pub total_trades: i64,
    pub realized_pnl: i64,
    pub active: bool,
}

/// The hold backing one live order. `reserved_quantity` counts shares still
/// expected to fill; for buys `reserved_cash` is the cash held for them at
/// `price_used`.
#[derive(Debug)]
struct Reservation {
    user_id: String,
    symbol: String,
    side: Side,
    price_used: Price,
    reserved_cash: i64,
    reserved_quantity: i64,
}

/// Owns every account and the reservation ledger.
pub struct AccountManager {
    accounts: DashMap<String, Arc<Account>>,
    reservations: Mutex<HashMap<String, Reservation>>,
    symbols: HashSet<String>,
    initial_cash: Price,
}

impl AccountManager {
    pub fn new(symbols: impl IntoIterator<Item = String>, initial_cash: Price) -> Self {
        Self {
            accounts: DashMap::new(),
            reservations: Mutex::new(HashMap::new()),
            symbols: symbols.into_iter().collect(),
            initial_cash,
        }
    }

    pub fn loaded_count(&self) -> usize {
        self.accounts.len()
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.accounts.contains_key(user_id)
    }

    /// Create a fresh in-memory account. Returns false if it already
    /// existed.
    pub fn open_account(&self, user_id: &str, cash: i64) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.accounts.entry(user_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(Account {
                    state: Mutex::new(AccountState {
                        cash,
                        active: true,
                        ..Default::default()
                    }),
                }));
                true
            }
        }
    }

    /// Install a previously persisted account state (startup load path).
    pub fn install_snapshot(&self, snapshot: AccountSnapshot) {
        let account = Arc::new(Account {
            state: Mutex::new(AccountState {
                cash: snapshot.cash,
                reserved_cash: 0,
                positions: snapshot.positions,
                reserved: HashMap::new(),
                total_trades: snapshot.total_trades,
                realized_pnl: snapshot.realized_pnl,
                active: snapshot.active,
                dirty: false,
            }),
        });
        self.accounts.insert(snapshot.user_id, account);
    }

    pub fn snapshot(&self, user_id: &str) -> Option<AccountSnapshot> {
        let account = self.get(user_id)?;
        let state = account.state.lock();
        Some(Self::snapshot_of(user_id, &state))
    }

    /// Make sure the user's account is resident, loading it from the
    /// durable store or creating it with the configured initial cash.
    pub async fn ensure_loaded(&self, user_id: &str, db: &Database) -> Result<(), sqlx::Error> {
        if self.contains(user_id) {
            return Ok(());
        }
        match db.load_account(user_id).await? {
            Some(snapshot) => {
                info!(user_id, cash = snapshot.cash, "loaded account from database");
                self.install_snapshot(snapshot);
            }
            None => {
                db.create_account(user_id, self.initial_cash).await?;
                self.open_account(user_id, self.initial_cash);
                info!(user_id, cash = self.initial_cash, "created new account");
            }
        }
        Ok(())
    }

    /// Persist accounts touched since the last flush. Failures are logged
    /// per account and do not stop the sweep.
    pub async fn flush_dirty(&self, db: &Database) -> usize {
        let mut flushed = 0;
        for snapshot in self.take_dirty_snapshots() {
            match db.upsert_account(&snapshot).await {
                Ok(()) => flushed += 1,
                Err(e) => {
                    error!(user_id = %snapshot.user_id, error = %e, "failed to sync account");
                }
            }
        }
        if flushed > 0 {
            info!(flushed, "synced accounts to database");
        }
        flushed
    }

    /// Final flush on shutdown: every resident account, dirty or not.
    pub async fn flush_all(&self, db: &Database) -> usize {
        let snapshots: Vec<AccountSnapshot> = self
            .accounts
            .iter()
            .map(|entry| {
                let state = entry.value().state.lock();
                Self::snapshot_of(entry.key(), &state)
            })
            .collect();
        let mut flushed = 0;
        for snapshot in snapshots {
            match db.upsert_account(&snapshot).await {
                Ok(()) => flushed += 1,
                Err(e) => {
                    error!(user_id = %snapshot.user_id, error = %e, "failed to sync account");
                }
            }
        }
        flushed
    }

    fn get(&self, user_id: &str) -> Option<Arc<Account>> {
        self.accounts.get(user_id).map(|a| Arc::clone(a.value()))
    }

    fn snapshot_of(user_id: &str, state: &AccountState) -> AccountSnapshot {
        AccountSnapshot {
            user_id: user_id.to_string(),
            cash: state.cash,
            reserved_cash: state.reserved_cash,
            positions: state.positions.clone(),
            reserved: state.reserved.clone(),
            buying_power: state.cash - state.reserved_cash,
            total_trades: state.total_trades,
            realized_pnl: state.realized_pnl,
            active: state.active,
        }
    }

    fn take_dirty_snapshots(&self) -> Vec<AccountSnapshot> {
        self.accounts
            .iter()
            .filter_map(|entry| {
                let mut state = entry.value().state.lock();
                if state.dirty {
                    state.dirty = false;
                    Some(Self::snapshot_of(entry.key(), &state))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Consume one side's hold for a settled trade and move the balances.
    /// Runs under the account's lock and the ledger lock.
    fn settle_buy(
        state: &mut AccountState,
        ledger: &mut HashMap<String, Reservation>,
        trade: &Trade,
    ) {
        if let Some(res) = ledger.get_mut(&trade.buy_order_id) {
            let consumed = trade.value().min(res.reserved_cash);
            state.reserved_cash = (state.reserved_cash - consumed).max(0);
            res.reserved_cash -= consumed;
            res.reserved_quantity = (res.reserved_quantity - trade.quantity).max(0);
            // Filled at better prices than reserved: nothing left to fill,
            // so the excess hold goes back too.
            if res.reserved_quantity == 0 && res.reserved_cash > 0 {
                state.reserved_cash = (state.reserved_cash - res.reserved_cash).max(0);
                res.reserved_cash = 0;
            }
            if res.reserved_cash == 0 && res.reserved_quantity == 0 {
                ledger.remove(&trade.buy_order_id);
            }
        }
        state.cash -= trade.value();
        *state.positions.entry(trade.symbol.clone()).or_insert(0) += trade.quantity;
        state.total_trades += 1;
        state.dirty = true;
    }

    fn settle_sell(
        state: &mut AccountState,
        ledger: &mut HashMap<String, Reservation>,
        trade: &Trade,
    ) {
        if let Some(res) = ledger.get_mut(&trade.sell_order_id) {
            let consumed = trade.quantity.min(res.reserved_quantity);
            let held = state.reserved.entry(trade.symbol.clone()).or_insert(0);
            *held = (*held - consumed).max(0);
            res.reserved_quantity -= consumed;
            if res.reserved_cash == 0 && res.reserved_quantity == 0 {
                ledger.remove(&trade.sell_order_id);
            }
        }
        state.cash += trade.value();
        let position = state.positions.entry(trade.symbol.clone()).or_insert(0);
        if *position < trade.quantity {
            warn!(
                order_id = %trade.sell_order_id,
                "position underflow clamped while settling sell"
            );
            *position = 0;
        } else {
            *position -= trade.quantity;
        }
        state.total_trades += 1;
        state.dirty = true;
    }

    /// Sum of the ledger's holds for one user: (cash, shares per symbol).
    /// Soundness requires this to equal the account's own totals.
    #[cfg(test)]
    pub(crate) fn reserved_totals(&self, user_id: &str) -> (i64, HashMap<String, i64>) {
        let ledger = self.reservations.lock();
        let mut cash = 0i64;
        let mut shares: HashMap<String, i64> = HashMap::new();
        for res in ledger.values() {
            if res.user_id != user_id {
                continue;
            }
            match res.side {
                Side::Buy => cash += res.reserved_cash,
                Side::Sell => *shares.entry(res.symbol.clone()).or_insert(0) += res.reserved_quantity,
            }
        }
        (cash, shares)
    }

    pub fn live_reservations(&self) -> usize {
        self.reservations.lock().len()
    }
}

impl ReservationPort for AccountManager {
    fn reserve(&self, order: &Order, effective_price: Price) -> Result<(), SubmitError> {
        if order.order_id.is_empty() {
            return Err(SubmitError::InvalidOrder("missing order_id".into()));
        }
        let account = self
            .get(&order.user_id)
            .ok_or_else(|| SubmitError::AccountNotFound(order.user_id.clone()))?;

        let mut state = account.state.lock();
        let mut ledger = self.reservations.lock();

        if ledger.contains_key(&order.order_id) {
            return Err(SubmitError::DuplicateOrderId(order.order_id.clone()));
        }

        match order.side {
            Side::Buy => {
                if effective_price <= 0 {
                    return Err(SubmitError::NoReferencePrice);
                }
                if order.quantity > i64::MAX / effective_price {
                    return Err(SubmitError::InvalidOrder("order value too large".into()));
                }
                let required = effective_price * order.quantity;
                if state.cash - state.reserved_cash < required {
                    return Err(SubmitError::InsufficientBuyingPower);
                }
                state.reserved_cash += required;
                ledger.insert(
                    order.order_id.clone(),
                    Reservation {
                        user_id: order.user_id.clone(),
                        symbol: order.symbol.clone(),
                        side: Side::Buy,
                        price_used: effective_price,
                        reserved_cash: required,
                        reserved_quantity: order.quantity,
                    },
                );
            }
            Side::Sell => {
                if !self.symbols.contains(&order.symbol) {
                    return Err(SubmitError::UnknownSymbol(order.symbol.clone()));
                }
                let held = state.reserved.get(&order.symbol).copied().unwrap_or(0);
                let owned = state.positions.get(&order.symbol).copied().unwrap_or(0);
                if owned - held < order.quantity {
                    return Err(SubmitError::InsufficientShares);
                }
                *state.reserved.entry(order.symbol.clone()).or_insert(0) += order.quantity;
                ledger.insert(
                    order.order_id.clone(),
                    Reservation {
                        user_id: order.user_id.clone(),
                        symbol: order.symbol.clone(),
                        side: Side::Sell,
                        price_used: effective_price,
                        reserved_cash: 0,
                        reserved_quantity: order.quantity,
                    },
                );
            }
        }
        Ok(())
    }

    fn release(&self, order: &Order, reason: ReleaseReason) {
        let Some(account) = self.get(&order.user_id) else {
            return;
        };
        let mut state = account.state.lock();
        let mut ledger = self.reservations.lock();
        let Some(res) = ledger.get_mut(&order.order_id) else {
            // Already consumed or never reserved; releases are idempotent.
            return;
        };
        if res.user_id != order.user_id {
            // A rejected duplicate id must not unwind the live order's hold.
            return;
        }

        // Free only the unfilled portion. Anything already matched stays
        // held until its trades settle through `apply_trade`.
        let unfilled = order.remaining_qty.clamp(0, res.reserved_quantity);
        match res.side {
            Side::Buy => {
                let mut freed = (unfilled * res.price_used).min(res.reserved_cash);
                res.reserved_quantity -= unfilled;
                if res.reserved_quantity == 0 {
                    freed = res.reserved_cash;
                }
                state.reserved_cash = (state.reserved_cash - freed).max(0);
                res.reserved_cash -= freed;
            }
            Side::Sell => {
                let held = state.reserved.entry(res.symbol.clone()).or_insert(0);
                *held = (*held - unfilled).max(0);
                res.reserved_quantity -= unfilled;
            }
        }

        if res.reserved_cash == 0 && res.reserved_quantity == 0 {
            ledger.remove(&order.order_id);
        }
        debug!(
            order_id = %order.order_id,
            reason = %reason,
            unfilled,
            "reservation released"
        );
    }

    fn apply_trade(&self, trade: &Trade) {
        let buyer = self.get(&trade.buy_user_id);
        let seller = self.get(&trade.sell_user_id);

        match (buyer, seller) {
            (Some(buyer), Some(seller)) => {
                if trade.buy_user_id == trade.sell_user_id {
                    // The engines prevent self-trades; settle defensively
                    // on the single account if one ever slips through.
                    warn!(symbol = %trade.symbol, "self-trade reached settlement");
                    let mut state = buyer.state.lock();
                    let mut ledger = self.reservations.lock();
                    Self::settle_buy(&mut state, &mut ledger, trade);
                    Self::settle_sell(&mut state, &mut ledger, trade);
                    return;
                }
                // Canonical lock order by user id keeps two-account
                // settlement deadlock-free and atomic.
                let (mut buy_state, mut sell_state) = lock_pair(
                    &buyer,
                    &trade.buy_user_id,
                    &seller,
                    &trade.sell_user_id,
                );
                let mut ledger = self.reservations.lock();
                Self::settle_buy(&mut buy_state, &mut ledger, trade);
                Self::settle_sell(&mut sell_state, &mut ledger, trade);
            }
            (buyer, seller) => {
                warn!(
                    buy_user = %trade.buy_user_id,
                    sell_user = %trade.sell_user_id,
                    "trade references unloaded account(s)"
                );
                if let Some(buyer) = buyer {
                    let mut state = buyer.state.lock();
                    let mut ledger = self.reservations.lock();
                    Self::settle_buy(&mut state, &mut ledger, trade);
                }
                if let Some(seller) = seller {
                    let mut state = seller.state.lock();
                    let mut ledger = self.reservations.lock();
                    Self::settle_sell(&mut state, &mut ledger, trade);
                }
            }
        }
    }
}

/// Lock two accounts in lexicographic user-id order, returning the guards
/// as (buyer, seller).
fn lock_pair<'a>(
    buyer: &'a Account,
    buy_user: &str,
    seller: &'a Account,
    sell_user: &str,
) -> (MutexGuard<'a, AccountState>, MutexGuard<'a, AccountState>) {
    if buy_user <= sell_user {
        let b = buyer.state.lock();
        let s = seller.state.lock();
        (b, s)
    } else {
        let s = seller.state.lock();
        let b = buyer.state.lock();
        (b, s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::matching::types::OrderKind;
    use proptest::prelude::*;

    const AAPL: &str = "AAPL";

    fn manager() -> AccountManager {
        AccountManager::new(vec![AAPL.to_string(), "MSFT".to_string()], DEFAULT_INITIAL_CASH)
    }

    fn seeded(user: &str, cash: i64, shares: i64) -> AccountSnapshot {
        let mut positions = HashMap::new();
        if shares > 0 {
            positions.insert(AAPL.to_string(), shares);
        }
        AccountSnapshot {
            user_id: user.to_string(),
            cash,
            reserved_cash: 0,
            positions,
            reserved: HashMap::new(),
            buying_power: cash,
            total_trades: 0,
            realized_pnl: 0,
            active: true,
        }
    }

    fn order(id: &str, user: &str, side: Side, qty: i64, price: Price) -> Order {
        Order::new(id, user, AAPL, side, OrderKind::Limit, qty, price)
    }

    fn trade(buy_id: &str, sell_id: &str, buyer: &str, seller: &str, qty: i64, price: Price) -> Trade {
        Trade {
            buy_order_id: buy_id.to_string(),
            sell_order_id: sell_id.to_string(),
            symbol: AAPL.to_string(),
            price,
            quantity: qty,
            timestamp_ms: 0,
            buy_user_id: buyer.to_string(),
            sell_user_id: seller.to_string(),
        }
    }

    fn assert_sound(mgr: &AccountManager, user: &str) {
        let snap = mgr.snapshot(user).expect("account");
        assert!(snap.cash >= 0, "cash negative for {user}");
        assert!(snap.reserved_cash >= 0 && snap.reserved_cash <= snap.cash);
        for (symbol, held) in &snap.reserved {
            let owned = snap.positions.get(symbol).copied().unwrap_or(0);
            assert!(*held >= 0 && *held <= owned, "reserved {held} > owned {owned}");
        }
        let (ledger_cash, ledger_shares) = mgr.reserved_totals(user);
        assert_eq!(snap.reserved_cash, ledger_cash, "ledger cash mismatch for {user}");
        for (symbol, held) in &snap.reserved {
            assert_eq!(
                *held,
                ledger_shares.get(symbol).copied().unwrap_or(0),
                "ledger share mismatch for {user}/{symbol}"
            );
        }
    }

    #[test]
    fn test_reserve_buy_holds_cash() {
        let mgr = manager();
        mgr.open_account("alice", 100_000_00);
        let o = order("o1", "alice", Side::Buy, 10, 101_00);
        mgr.reserve(&o, o.price).unwrap();

        let snap = mgr.snapshot("alice").unwrap();
        assert_eq!(snap.reserved_cash, 1010_00);
        assert_eq!(snap.buying_power, 100_000_00 - 1010_00);
        assert_sound(&mgr, "alice");
    }

    #[test]
    fn test_reserve_buy_insufficient_buying_power() {
        let mgr = manager();
        mgr.open_account("alice", 1000_00);
        let o = order("o1", "alice", Side::Buy, 11, 100_00);
        assert_eq!(mgr.reserve(&o, o.price), Err(SubmitError::InsufficientBuyingPower));
        assert_eq!(mgr.live_reservations(), 0);
    }

    #[test]
    fn test_reserve_sell_requires_free_shares() {
        let mgr = manager();
        mgr.install_snapshot(seeded("alice", 0, 10));

        let o1 = order("o1", "alice", Side::Sell, 8, 100_00);
        mgr.reserve(&o1, o1.price).unwrap();
        let o2 = order("o2", "alice", Side::Sell, 3, 100_00);
        assert_eq!(mgr.reserve(&o2, o2.price), Err(SubmitError::InsufficientShares));
        assert_sound(&mgr, "alice");
    }

    #[test]
    fn test_reserve_unknown_symbol_and_missing_account() {
        let mgr = manager();
        mgr.open_account("alice", 1000_00);
        let mut o = order("o1", "alice", Side::Sell, 1, 100_00);
        o.symbol = "ZZZZ".to_string();
        assert!(matches!(mgr.reserve(&o, o.price), Err(SubmitError::UnknownSymbol(_))));

        let o2 = order("o2", "ghost", Side::Buy, 1, 100_00);
        assert!(matches!(mgr.reserve(&o2, o2.price), Err(SubmitError::AccountNotFound(_))));
    }

    #[test]
    fn test_reserve_rejects_duplicates_and_overflow() {
        let mgr = manager();
        mgr.open_account("alice", i64::MAX / 2);
        let o = order("o1", "alice", Side::Buy, 10, 100_00);
        mgr.reserve(&o, o.price).unwrap();
        assert!(matches!(mgr.reserve(&o, o.price), Err(SubmitError::DuplicateOrderId(_))));

        let huge = order("o2", "alice", Side::Buy, i64::MAX / 2, 100_00);
        assert!(matches!(mgr.reserve(&huge, huge.price), Err(SubmitError::InvalidOrder(_))));
    }

    #[test]
    fn test_release_returns_full_hold_on_cancel() {
        let mgr = manager();
        mgr.open_account("alice", 100_000_00);
        let o = order("o1", "alice", Side::Buy, 10, 101_00);
        mgr.reserve(&o, o.price).unwrap();
        mgr.release(&o, ReleaseReason::Cancelled);

        let snap = mgr.snapshot("alice").unwrap();
        assert_eq!(snap.reserved_cash, 0);
        assert_eq!(snap.cash, 100_000_00);
        assert_eq!(mgr.live_reservations(), 0);
        // A second release of the same order is a no-op.
        mgr.release(&o, ReleaseReason::Cancelled);
        assert_eq!(mgr.snapshot("alice").unwrap().reserved_cash, 0);
    }

    #[test]
    fn test_apply_trade_conserves_cash_and_shares() {
        let mgr = manager();
        mgr.open_account("buyer", 100_000_00);
        mgr.install_snapshot(seeded("seller", 100_000_00, 10));

        let buy = order("b1", "buyer", Side::Buy, 10, 101_00);
        let sell = order("s1", "seller", Side::Sell, 10, 101_00);
        mgr.reserve(&buy, buy.price).unwrap();
        mgr.reserve(&sell, sell.price).unwrap();

        mgr.apply_trade(&trade("b1", "s1", "buyer", "seller", 10, 101_00));

        let b = mgr.snapshot("buyer").unwrap();
        let s = mgr.snapshot("seller").unwrap();
        assert_eq!(b.cash, 100_000_00 - 1010_00);
        assert_eq!(b.positions.get(AAPL), Some(&10));
        assert_eq!(s.cash, 100_000_00 + 1010_00);
        assert_eq!(s.positions.get(AAPL), Some(&0));
        assert_eq!(b.cash + s.cash, 200_000_00);
        assert_eq!(b.total_trades, 1);
        assert_eq!(s.total_trades, 1);
        assert_eq!(mgr.live_reservations(), 0);
        assert_sound(&mgr, "buyer");
        assert_sound(&mgr, "seller");
    }

    #[test]
    fn test_price_improvement_hold_is_freed_on_settle() {
        let mgr = manager();
        mgr.open_account("buyer", 100_000_00);
        mgr.install_snapshot(seeded("seller", 0, 10));

        // Buyer reserved at $101 but the maker's price was $100.
        let buy = order("b1", "buyer", Side::Buy, 10, 101_00);
        let sell = order("s1", "seller", Side::Sell, 10, 100_00);
        mgr.reserve(&buy, 101_00).unwrap();
        mgr.reserve(&sell, 100_00).unwrap();

        mgr.apply_trade(&trade("b1", "s1", "buyer", "seller", 10, 100_00));

        let b = mgr.snapshot("buyer").unwrap();
        assert_eq!(b.cash, 100_000_00 - 1000_00);
        // The $10 over-reservation came back with the fill.
        assert_eq!(b.reserved_cash, 0);
        assert_eq!(mgr.live_reservations(), 0);
    }

    #[test]
    fn test_ioc_partial_release_then_settle() {
        let mgr = manager();
        mgr.open_account("taker", 100_000_00);
        mgr.install_snapshot(seeded("maker", 0, 40));

        // IOC buy 100 @ $50 fills 40; the engine releases the 60-lot
        // remainder before the trade settles.
        let mut buy = order("b1", "taker", Side::Buy, 100, 50_00);
        let sell = order("s1", "maker", Side::Sell, 40, 50_00);
        mgr.reserve(&buy, 50_00).unwrap();
        mgr.reserve(&sell, 50_00).unwrap();

        buy.remaining_qty = 60;
        mgr.release(&buy, ReleaseReason::IocRemainder);
        let mid = mgr.snapshot("taker").unwrap();
        assert_eq!(mid.reserved_cash, 40 * 50_00);

        mgr.apply_trade(&trade("b1", "s1", "taker", "maker", 40, 50_00));
        let done = mgr.snapshot("taker").unwrap();
        assert_eq!(done.reserved_cash, 0);
        assert_eq!(done.cash, 100_000_00 - 40 * 50_00);
        assert_eq!(done.positions.get(AAPL), Some(&40));
        assert_eq!(mgr.live_reservations(), 0);
        assert_sound(&mgr, "taker");
        assert_sound(&mgr, "maker");
    }

    #[test]
    fn test_settle_before_release_also_clears_hold() {
        let mgr = manager();
        mgr.open_account("taker", 100_000_00);
        mgr.install_snapshot(seeded("maker", 0, 40));

        let mut buy = order("b1", "taker", Side::Buy, 100, 50_00);
        let sell = order("s1", "maker", Side::Sell, 40, 50_00);
        mgr.reserve(&buy, 50_00).unwrap();
        mgr.reserve(&sell, 50_00).unwrap();

        // Opposite interleaving: the trade settles first, then the engine
        // releases the cancelled remainder.
        mgr.apply_trade(&trade("b1", "s1", "taker", "maker", 40, 50_00));
        buy.remaining_qty = 60;
        mgr.release(&buy, ReleaseReason::IocRemainder);

        let done = mgr.snapshot("taker").unwrap();
        assert_eq!(done.reserved_cash, 0);
        assert_eq!(done.cash, 100_000_00 - 40 * 50_00);
        assert_eq!(mgr.live_reservations(), 0);
    }

    proptest! {
        /// Random reserve/trade/release sequences keep every balance
        /// non-negative, the ledger in sync, and cash and shares conserved.
        #[test]
        fn prop_reservation_invariants(
            ops in prop::collection::vec((1i64..40, 1i64..500, any::<bool>()), 1..60)
        ) {
            let mgr = manager();
            mgr.open_account("bob", 10_000_000_00);
            mgr.install_snapshot(seeded("alice", 10_000_000_00, 100_000));

            let start_cash = 2 * 10_000_000_00i64;
            let start_shares = 100_000i64;

            for (i, (qty, price_steps, settle)) in ops.into_iter().enumerate() {
                let price = price_steps * 10;
                let buy = order(&format!("b{i}"), "bob", Side::Buy, qty, price);
                let sell = order(&format!("s{i}"), "alice", Side::Sell, qty, price);
                if mgr.reserve(&buy, price).is_err() {
                    continue;
                }
                if mgr.reserve(&sell, price).is_err() {
                    mgr.release(&buy, ReleaseReason::Cancelled);
                    continue;
                }
                if settle {
                    mgr.apply_trade(&trade(
                        &buy.order_id, &sell.order_id, "bob", "alice", qty, price,
                    ));
                    let mut filled_buy = buy.clone();
                    filled_buy.remaining_qty = 0;
                    let mut filled_sell = sell.clone();
                    filled_sell.remaining_qty = 0;
                    mgr.release(&filled_buy, ReleaseReason::Filled);
                    mgr.release(&filled_sell, ReleaseReason::Filled);
                } else {
                    mgr.release(&buy, ReleaseReason::Cancelled);
                    mgr.release(&sell, ReleaseReason::Cancelled);
                }

                assert_sound(&mgr, "bob");
                assert_sound(&mgr, "alice");
            }

            let bob = mgr.snapshot("bob").unwrap();
            let alice = mgr.snapshot("alice").unwrap();
            prop_assert_eq!(bob.cash + alice.cash, start_cash);
            let total_shares = bob.positions.get(AAPL).copied().unwrap_or(0)
                + alice.positions.get(AAPL).copied().unwrap_or(0);
            prop_assert_eq!(total_shares, start_shares);
            prop_assert_eq!(mgr.live_reservations(), 0);
        }
    }
}
