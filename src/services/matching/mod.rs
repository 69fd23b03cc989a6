//! Order Matching Engine Module
//!
//! Multi-symbol matching under strict price-time priority.
//!
//! # Architecture
//!
//! ```text
//! Exchange
//!   ├→ SymbolEngine (one per listed symbol)
//!   │    ├→ matching thread  (exclusive owner of the OrderBook)
//!   │    ├→ trade publisher  (settles reservations, feeds persistence)
//!   │    └→ market data publisher
//!   └→ ReservationPort (implemented by the account manager)
//! ```
//!
//! # Properties
//!
//! - **Single writer per book**: all book mutation happens on the symbol's
//!   matching thread; other threads see only queues and snapshots
//! - **Price-time priority**: best price first, FIFO within a level, and
//!   the trade price is always the maker's
//! - **Self-trade prevention**: same-user makers are skipped, never
//!   consumed or cancelled
//! - **Bounded everything**: lock-free rings with fixed capacities, a
//!   depth cap per book side, and an adaptive waiter for idle periods

pub mod book;
pub mod engine;
pub mod types;
pub mod waiter;

pub use engine::{ReservationPort, SymbolEngine, SymbolStats, MAX_ORDER_BOOK_DEPTH};
pub use types::*;
