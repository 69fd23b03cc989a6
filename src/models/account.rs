use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Row of the `accounts` table. Cash amounts are fixed-point cents.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AccountRecord {
    pub user_id: String,
    pub cash: i64,
    pub buying_power: i64,
    pub total_trades: i64,
    pub realized_pnl: i64,
    pub is_active: bool,
}

/// Row of the `account_positions` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PositionRecord {
    pub user_id: String,
    pub symbol: String,
    pub quantity: i64,
}
