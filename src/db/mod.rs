//! Database Layer
//!
//! Postgres access behind a small pool. Hot-path audit data (orders,
//! trades) arrives here only through the persistence worker's batches;
//! account snapshots, stock master data and security events use the
//! direct methods. All writes are idempotent upserts so replays after a
//! crash cannot double-record.

use crate::models::{QuoteRecord, StockRecord};
use crate::services::accounts::AccountSnapshot;
use crate::services::persistence::PersistEvent;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

const POOL_SIZE: u32 = 5;

/// Statements run at startup; each is idempotent.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS accounts (
        user_id       TEXT PRIMARY KEY,
        cash          BIGINT NOT NULL DEFAULT 0,
        buying_power  BIGINT NOT NULL DEFAULT 0,
        total_trades  BIGINT NOT NULL DEFAULT 0,
        realized_pnl  BIGINT NOT NULL DEFAULT 0,
        is_active     BOOLEAN NOT NULL DEFAULT TRUE,
        updated_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS account_positions (
        user_id   TEXT NOT NULL,
        symbol    TEXT NOT NULL,
        quantity  BIGINT NOT NULL DEFAULT 0,
        PRIMARY KEY (user_id, symbol)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS orders (
        order_id      TEXT PRIMARY KEY,
        user_id       TEXT NOT NULL,
        symbol        TEXT NOT NULL,
        side          TEXT NOT NULL,
        kind          TEXT NOT NULL,
        quantity      BIGINT NOT NULL,
        remaining_qty BIGINT NOT NULL,
        price         BIGINT NOT NULL,
        status        TEXT NOT NULL,
        detail        TEXT,
        timestamp_ms  BIGINT NOT NULL,
        updated_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS trades (
        trade_id      UUID PRIMARY KEY,
        buy_order_id  TEXT NOT NULL,
        sell_order_id TEXT NOT NULL,
        symbol        TEXT NOT NULL,
        price         BIGINT NOT NULL,
        quantity      BIGINT NOT NULL,
        buy_user_id   TEXT NOT NULL,
        sell_user_id  TEXT NOT NULL,
        timestamp_ms  BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stocks_master (
        symbol        TEXT PRIMARY KEY,
        company_name  TEXT NOT NULL,
        sector        TEXT NOT NULL DEFAULT '',
        initial_price BIGINT NOT NULL,
        is_active     BOOLEAN NOT NULL DEFAULT TRUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stock_quotes (
        symbol     TEXT PRIMARY KEY,
        last_price BIGINT NOT NULL,
        open_price BIGINT NOT NULL,
        volume     BIGINT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS security_events (
        id            BIGSERIAL PRIMARY KEY,
        event_type    TEXT NOT NULL,
        connection_id BIGINT,
        detail        TEXT NOT NULL,
        created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS circuit_breaker_events (
        id         BIGSERIAL PRIMARY KEY,
        symbol     TEXT NOT NULL,
        order_id   TEXT NOT NULL,
        detail     TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
];

/// Listings seeded on an empty `stocks_master`, in fixed-point cents.
const DEFAULT_LISTINGS: &[(&str, &str, &str, i64)] = &[
    ("AAPL", "Apple Inc.", "Technology", 175_00),
    ("GOOGL", "Alphabet Inc.", "Technology", 140_00),
    ("MSFT", "Microsoft Corporation", "Technology", 380_00),
    ("AMZN", "Amazon.com Inc.", "Consumer Discretionary", 155_00),
    ("TSLA", "Tesla Inc.", "Consumer Discretionary", 250_00),
];

#[derive(Clone)]
pub struct Database {
    pub pool: PgPool,
}

impl Database {
    pub async fn connect(dsn: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(POOL_SIZE)
            .acquire_timeout(Duration::from_secs(5))
            .connect(dsn)
            .await?;
        Ok(Self { pool })
    }

    pub async fn init_schema(&self) -> Result<(), sqlx::Error> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("database schema ready");
        Ok(())
    }

    // ========================================================================
    // Accounts
    // ========================================================================

    pub async fn load_account(&self, user_id: &str) -> Result<Option<AccountSnapshot>, sqlx::Error> {
        let row: Option<crate::models::AccountRecord> = sqlx::query_as(
            r#"
            SELECT user_id, cash, buying_power, total_trades, realized_pnl, is_active
            FROM accounts
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(record) = row else {
            return Ok(None);
        };

        let positions: Vec<crate::models::PositionRecord> = sqlx::query_as(
            "SELECT user_id, symbol, quantity FROM account_positions WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let positions: HashMap<String, i64> = positions
            .into_iter()
            .map(|p| (p.symbol, p.quantity))
            .collect();

        Ok(Some(AccountSnapshot {
            user_id: record.user_id,
            cash: record.cash,
            reserved_cash: 0,
            positions,
            reserved: HashMap::new(),
            buying_power: record.buying_power,
            total_trades: record.total_trades,
            realized_pnl: record.realized_pnl,
            active: record.is_active,
        }))
    }

    pub async fn create_account(&self, user_id: &str, initial_cash: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO accounts (user_id, cash, buying_power)
            VALUES ($1, $2, $2)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(initial_cash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_account(&self, snapshot: &AccountSnapshot) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO accounts (user_id, cash, buying_power, total_trades, realized_pnl, is_active, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                cash = $2,
                buying_power = $3,
                total_trades = $4,
                realized_pnl = $5,
                is_active = $6,
                updated_at = NOW()
            "#,
        )
        .bind(&snapshot.user_id)
        .bind(snapshot.cash)
        .bind(snapshot.buying_power)
        .bind(snapshot.total_trades)
        .bind(snapshot.realized_pnl)
        .bind(snapshot.active)
        .execute(&mut *tx)
        .await?;

        for (symbol, quantity) in &snapshot.positions {
            sqlx::query(
                r#"
                INSERT INTO account_positions (user_id, symbol, quantity)
                VALUES ($1, $2, $3)
                ON CONFLICT (user_id, symbol) DO UPDATE SET quantity = $3
                "#,
            )
            .bind(&snapshot.user_id)
            .bind(symbol)
            .bind(quantity)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    // ========================================================================
    // Stock master data
    // ========================================================================

    /// Active listings, seeding the defaults when the table is empty.
    pub async fn load_stocks(&self) -> Result<Vec<StockRecord>, sqlx::Error> {
        let stocks: Vec<StockRecord> = sqlx::query_as(
            r#"
            SELECT symbol, company_name, sector, initial_price, is_active
            FROM stocks_master
            WHERE is_active
            ORDER BY symbol
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if !stocks.is_empty() {
            return Ok(stocks);
        }

        info!("stocks_master empty, seeding default listings");
        for (symbol, name, sector, price) in DEFAULT_LISTINGS {
            sqlx::query(
                r#"
                INSERT INTO stocks_master (symbol, company_name, sector, initial_price)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (symbol) DO NOTHING
                "#,
            )
            .bind(symbol)
            .bind(name)
            .bind(sector)
            .bind(price)
            .execute(&self.pool)
            .await?;
        }
        self.load_stocks_raw().await
    }

    async fn load_stocks_raw(&self) -> Result<Vec<StockRecord>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT symbol, company_name, sector, initial_price, is_active
            FROM stocks_master
            WHERE is_active
            ORDER BY symbol
            "#,
        )
        .fetch_all(&self.pool)
        .await
    }

    pub async fn load_quote(&self, symbol: &str) -> Result<Option<QuoteRecord>, sqlx::Error> {
        sqlx::query_as(
            "SELECT symbol, last_price, open_price, volume FROM stock_quotes WHERE symbol = $1",
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await
    }

    /// Batch upsert of (symbol, last_price, open_price, volume) rows from
    /// the periodic market-data sync.
    pub async fn save_quotes(&self, rows: &[(String, i64, i64, i64)]) -> Result<(), sqlx::Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (symbol, last_price, open_price, volume) in rows {
            sqlx::query(
                r#"
                INSERT INTO stock_quotes (symbol, last_price, open_price, volume, updated_at)
                VALUES ($1, $2, $3, $4, NOW())
                ON CONFLICT (symbol) DO UPDATE SET
                    last_price = $2,
                    open_price = $3,
                    volume = $4,
                    updated_at = NOW()
                "#,
            )
            .bind(symbol)
            .bind(last_price)
            .bind(open_price)
            .bind(volume)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ========================================================================
    // Audit log
    // ========================================================================

    /// Commit one persistence batch as a single transaction.
    pub async fn write_events(&self, events: &[PersistEvent]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        for event in events {
            match event {
                PersistEvent::Order(order_event) => {
                    let order = &order_event.order;
                    sqlx::query(
                        r#"
                        INSERT INTO orders
                            (order_id, user_id, symbol, side, kind, quantity,
                             remaining_qty, price, status, detail, timestamp_ms, updated_at)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
                        ON CONFLICT (order_id) DO UPDATE SET
                            remaining_qty = $7,
                            status = $9,
                            detail = $10,
                            updated_at = NOW()
                        "#,
                    )
                    .bind(&order.order_id)
                    .bind(&order.user_id)
                    .bind(&order.symbol)
                    .bind(order.side.to_string())
                    .bind(order.kind.to_string())
                    .bind(order.quantity)
                    .bind(order.remaining_qty)
                    .bind(order.price)
                    .bind(order.status.to_string())
                    .bind(order_event.reason)
                    .bind(order.timestamp_ms)
                    .execute(&mut *tx)
                    .await?;

                    // Market-band halts double as circuit-breaker audit rows.
                    if order_event.reason == Some("market_band") {
                        sqlx::query(
                            r#"
                            INSERT INTO circuit_breaker_events (symbol, order_id, detail)
                            VALUES ($1, $2, $3)
                            "#,
                        )
                        .bind(&order.symbol)
                        .bind(&order.order_id)
                        .bind("market order outside protection band")
                        .execute(&mut *tx)
                        .await?;
                    }
                }
                PersistEvent::Trade(trade_event) => {
                    let trade = &trade_event.trade;
                    sqlx::query(
                        r#"
                        INSERT INTO trades
                            (trade_id, buy_order_id, sell_order_id, symbol, price,
                             quantity, buy_user_id, sell_user_id, timestamp_ms)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                        ON CONFLICT (trade_id) DO NOTHING
                        "#,
                    )
                    .bind(trade_event.trade_id)
                    .bind(&trade.buy_order_id)
                    .bind(&trade.sell_order_id)
                    .bind(&trade.symbol)
                    .bind(trade.price)
                    .bind(trade.quantity)
                    .bind(&trade.buy_user_id)
                    .bind(&trade.sell_user_id)
                    .bind(trade.timestamp_ms)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    // ========================================================================
    // Security events (synchronous path, low rate, audit critical)
    // ========================================================================

    pub async fn record_security_event(
        &self,
        event_type: &str,
        connection_id: Option<i64>,
        detail: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO security_events (event_type, connection_id, detail) VALUES ($1, $2, $3)",
        )
        .bind(event_type)
        .bind(connection_id)
        .bind(detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
