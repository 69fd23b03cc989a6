pub mod account;
pub mod stock;

pub use account::{AccountRecord, PositionRecord};
pub use stock::{QuoteRecord, StockRecord};
