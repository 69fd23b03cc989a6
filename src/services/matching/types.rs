//! Matching Engine Types
//!
//! Shared types for the matching engine: fixed-point prices, orders,
//! trades and the market-data DTOs broadcast to subscribers.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Fixed-Point Price
// ============================================================================

/// Prices and cash amounts are stored as integer cents ($123.45 == 12345).
pub type Price = i64;

/// Scale factor between dollars and the fixed-point representation.
pub const PRICE_SCALE: i64 = 100;

/// Convert dollars to cents with half-up rounding.
pub fn price_from_dollars(dollars: f64) -> Price {
    (dollars * PRICE_SCALE as f64 + 0.5).floor() as Price
}

/// Convert cents back to dollars for display and the wire boundary.
pub fn price_to_dollars(price: Price) -> f64 {
    price as f64 / PRICE_SCALE as f64
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Order Types
// ============================================================================

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The side a taker on this side matches against.
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Order kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Market,
    Limit,
    /// Immediate-or-cancel: match like a limit, cancel the remainder.
    Ioc,
    /// Fill-or-kill: all-or-nothing, checked before any book mutation.
    Fok,
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderKind::Market => write!(f, "market"),
            OrderKind::Limit => write!(f, "limit"),
            OrderKind::Ioc => write!(f, "ioc"),
            OrderKind::Fok => write!(f, "fok"),
        }
    }
}

/// Order status
///
/// Terminal statuses (Filled, Cancelled, Rejected) are never overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Accepted by the gate, not yet seen by the matching thread.
    Pending,
    /// Resting on the book.
    Open,
    /// Partially filled and still live.
    Partial,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Pending => write!(f, "pending"),
            OrderStatus::Open => write!(f, "open"),
            OrderStatus::Partial => write!(f, "partial"),
            OrderStatus::Filled => write!(f, "filled"),
            OrderStatus::Cancelled => write!(f, "cancelled"),
            OrderStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// An order as it travels through the exchange.
///
/// `price` is meaningful for Limit/IOC/FOK orders only; Market orders carry
/// zero. Invariant: `0 <= remaining_qty <= quantity`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    pub quantity: i64,
    pub remaining_qty: i64,
    pub price: Price,
    pub timestamp_ms: i64,
    pub status: OrderStatus,
}

impl Order {
    pub fn new(
        order_id: impl Into<String>,
        user_id: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        kind: OrderKind,
        quantity: i64,
        price: Price,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            user_id: user_id.into(),
            symbol: symbol.into(),
            side,
            kind,
            quantity,
            remaining_qty: quantity,
            price,
            timestamp_ms: now_millis(),
            status: OrderStatus::Pending,
        }
    }

    pub fn filled_qty(&self) -> i64 {
        self.quantity - self.remaining_qty
    }
}

// ============================================================================
// Trade
// ============================================================================

/// An execution between a resting maker and an incoming taker.
///
/// The trade price is always the maker's price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub buy_order_id: String,
    pub sell_order_id: String,
    pub symbol: String,
    pub price: Price,
    pub quantity: i64,
    pub timestamp_ms: i64,
    pub buy_user_id: String,
    pub sell_user_id: String,
}

impl Trade {
    /// Cash moved by this trade, in cents.
    pub fn value(&self) -> i64 {
        self.price * self.quantity
    }
}

// ============================================================================
// Market Data
// ============================================================================

/// One aggregated price level as exposed to market-data consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Price,
    pub quantity: i64,
}

/// Top-of-book snapshot broadcast by the market-data publisher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataUpdate {
    pub symbol: String,
    pub last_price: Price,
    pub last_qty: i64,
    pub top_bids: Vec<BookLevel>,
    pub top_asks: Vec<BookLevel>,
    pub timestamp_ms: i64,
}

/// Per-symbol daily statistics exposed by the exchange.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolSnapshot {
    pub symbol: String,
    pub last_price: Price,
    pub day_open: Price,
    pub day_high: Price,
    pub day_low: Price,
    pub change_points: Price,
    pub change_percent: f64,
    pub volume: i64,
    pub vwap: Price,
    pub top_bids: Vec<BookLevel>,
    pub top_asks: Vec<BookLevel>,
}

/// One constituent of the aggregate market index.
#[derive(Debug, Clone, Serialize)]
pub struct IndexConstituent {
    pub symbol: String,
    pub last_price: Price,
    pub weight: f64,
    pub contribution: f64,
    pub change_percent: f64,
}

/// Equal-weighted aggregate index over all listed symbols (base 1000).
#[derive(Debug, Clone, Serialize)]
pub struct IndexSnapshot {
    pub name: String,
    pub value: f64,
    pub day_open: f64,
    pub day_high: f64,
    pub day_low: f64,
    pub change_points: f64,
    pub change_percent: f64,
    pub constituents: Vec<IndexConstituent>,
    pub timestamp_ms: i64,
}

// ============================================================================
// Engine Commands & Release Reasons
// ============================================================================

/// Commands consumed by a symbol's matching thread.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    New(Order),
    Cancel(String),
}

/// Why a reservation is being handed back to the account manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    Filled,
    Cancelled,
    IocRemainder,
    FokNotFilled,
    MarketUnmatched,
    QueueFull,
    EngineShutdown,
    Rejected,
}

impl ReleaseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ReleaseReason::Filled => "filled",
            ReleaseReason::Cancelled => "cancelled",
            ReleaseReason::IocRemainder => "ioc_remainder",
            ReleaseReason::FokNotFilled => "fok_not_filled",
            ReleaseReason::MarketUnmatched => "market_unmatched",
            ReleaseReason::QueueFull => "queue_full",
            ReleaseReason::EngineShutdown => "engine_shutdown",
            ReleaseReason::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Maximum quantity accepted on a single order (1 billion shares).
pub const MAX_ORDER_QUANTITY: i64 = 1_000_000_000;

/// Valid limit-price range: one cent to one million dollars.
pub const MIN_ORDER_PRICE: Price = 1;
pub const MAX_ORDER_PRICE: Price = 100_000_000;

/// Rejections surfaced to clients on the submission path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("duplicate order_id: {0}")]
    DuplicateOrderId(String),

    #[error("insufficient buying power")]
    InsufficientBuyingPower,

    #[error("insufficient shares")]
    InsufficientShares,

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("order book depth limit reached")]
    DepthLimit,

    #[error("order queue full")]
    Busy,

    #[error("no reference price for market order")]
    NoReferencePrice,

    #[error("engine is shutting down")]
    EngineShutdown,
}
