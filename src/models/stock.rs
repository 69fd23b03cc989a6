use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Row of the `stocks_master` table: one listed instrument.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StockRecord {
    pub symbol: String,
    pub company_name: String,
    pub sector: String,
    pub initial_price: i64,
    pub is_active: bool,
}

/// Row of the `stock_quotes` table: the last persisted market state for a
/// symbol, used to restore day-open prices across restarts.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QuoteRecord {
    pub symbol: String,
    pub last_price: i64,
    pub open_price: i64,
    pub volume: i64,
}
