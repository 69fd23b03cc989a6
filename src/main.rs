use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod auth;
mod cache;
mod config;
mod db;
mod metrics;
mod models;
mod services;

use crate::api::tcp::TcpGateway;
use crate::auth::{SessionManager, TokenStore};
use crate::cache::{RedisClient, RedisConfig};
use crate::config::AppConfig;
use crate::db::Database;
use crate::services::accounts::AccountManager;
use crate::services::exchange::{Exchange, Listing};
use crate::services::matching::types::price_from_dollars;
use crate::services::persistence::{PersistenceHandle, PersistenceWorker, DEFAULT_QUEUE_CAPACITY};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::load().context("failed to load configuration")?;

    let default_filter = if config.dev_verbose {
        "aurex_backend=trace"
    } else {
        "aurex_backend=debug"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Aurex Backend v{}", env!("CARGO_PKG_VERSION"));

    // Metrics exporter
    let metrics_addr: SocketAddr = config
        .metrics_address
        .parse()
        .context("invalid AUREX_METRICS_ADDRESS")?;
    crate::metrics::init_metrics(metrics_addr).context("failed to start metrics exporter")?;
    tracing::info!("Metrics exporter listening on {}", metrics_addr);

    // Database
    let db = Database::connect(&config.db_dsn)
        .await
        .context("failed to connect to database")?;
    db.init_schema().await.context("failed to prepare schema")?;
    tracing::info!("Database connected");

    // Redis: token store plus the pub/sub fan-out for external consumers
    let redis = Arc::new(
        RedisClient::new(RedisConfig::from_host_port(
            &config.redis_host,
            config.redis_port,
        ))
        .await
        .context("failed to connect to Redis")?,
    );
    let tokens = Arc::new(TokenStore::new(Arc::clone(&redis)));
    if tokens.is_available().await {
        tracing::info!(
            "Token store ready at {}:{}",
            config.redis_host,
            config.redis_port
        );
    } else {
        tracing::warn!("Token store unreachable; logins will fail until Redis returns");
    }

    // Listings: stock master data, with last-known prices restored
    let stocks = db.load_stocks().await.context("failed to load listings")?;
    let mut listings = Vec::with_capacity(stocks.len());
    for stock in &stocks {
        let quote = db.load_quote(&stock.symbol).await?;
        let (initial_price, volume) = match quote {
            Some(q) if q.last_price > 0 => (q.last_price, q.volume),
            _ => (stock.initial_price, 0),
        };
        tracing::info!(
            symbol = %stock.symbol,
            company = %stock.company_name,
            price_cents = initial_price,
            "listing symbol"
        );
        listings.push(Listing {
            symbol: stock.symbol.clone(),
            initial_price,
            volume,
        });
    }

    // Accounts
    let symbols: Vec<String> = listings.iter().map(|l| l.symbol.clone()).collect();
    let accounts = Arc::new(AccountManager::new(
        symbols.clone(),
        price_from_dollars(config.initial_cash_dollars),
    ));

    // Persistence worker
    let (persistence, persist_rx) = PersistenceHandle::channel(DEFAULT_QUEUE_CAPACITY);
    let persistence_worker = PersistenceWorker::new(db.clone(), persist_rx, config.persist_batch_size);
    tokio::spawn(persistence_worker.run());
    tracing::info!("Persistence worker spawned");

    // Exchange: one matching engine per symbol plus the index worker
    let exchange = Arc::new(Exchange::new(listings, Arc::clone(&accounts), persistence));
    exchange.start();
    tracing::info!(?symbols, "Exchange started");

    // Sessions
    let sessions = Arc::new(SessionManager::new(
        tokens,
        Arc::clone(&accounts),
        db.clone(),
        Duration::from_secs(config.session_idle_minutes * 60),
    ));
    Arc::clone(&sessions).spawn_idle_sweep();

    // Redis pub/sub worker: trade events out to external consumers
    {
        let redis = Arc::clone(&redis);
        let mut trade_rx = exchange.subscribe_trades();
        tokio::spawn(async move {
            tracing::info!("Redis trade pub/sub worker started");
            loop {
                match trade_rx.recv().await {
                    Ok(trade) => {
                        let channel = format!("aurex:trades:{}", trade.symbol);
                        match serde_json::to_string(&trade) {
                            Ok(payload) => {
                                if let Err(e) = redis.publish(&channel, &payload).await {
                                    tracing::warn!(error = %e, "failed to publish trade");
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "failed to encode trade"),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(lagged = n, "trade pub/sub lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::warn!("Redis trade pub/sub worker stopped");
        });
    }

    // Redis pub/sub worker: order book snapshots
    {
        let redis = Arc::clone(&redis);
        let mut md_rx = exchange.subscribe_market_data();
        tokio::spawn(async move {
            tracing::info!("Redis orderbook pub/sub worker started");
            loop {
                match md_rx.recv().await {
                    Ok(update) => {
                        let channel = format!("aurex:orderbook:{}", update.symbol);
                        match serde_json::to_string(&update) {
                            Ok(payload) => {
                                if let Err(e) = redis.publish(&channel, &payload).await {
                                    tracing::warn!(error = %e, "failed to publish orderbook");
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "failed to encode orderbook"),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(lagged = n, "orderbook pub/sub lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::warn!("Redis orderbook pub/sub worker stopped");
        });
    }

    // Index worker fan-out: publish each aggregate index tick to Redis
    {
        let redis = Arc::clone(&redis);
        let mut index_rx = exchange.subscribe_index();
        tokio::spawn(async move {
            while let Ok(index) = index_rx.recv().await {
                tracing::debug!(
                    name = %index.name,
                    value = index.value,
                    change_percent = index.change_percent,
                    "index updated"
                );
                match serde_json::to_string(&index) {
                    Ok(payload) => {
                        if let Err(e) = redis.publish("aurex:index", &payload).await {
                            tracing::warn!(error = %e, "failed to publish index");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to encode index"),
                }
            }
        });
    }

    // Telemetry heartbeat: engine counters and session/account gauges
    {
        let exchange = Arc::clone(&exchange);
        let accounts = Arc::clone(&accounts);
        let sessions = Arc::clone(&sessions);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await;
            loop {
                interval.tick().await;
                for engine in exchange.telemetry() {
                    tracing::info!(
                        symbol = %engine.symbol,
                        orders = engine.orders_processed,
                        trades = engine.trades_executed,
                        md_messages = engine.messages_sent,
                        load = engine.matching_load,
                        "engine telemetry"
                    );
                }
                for snapshot in exchange.all_symbol_snapshots() {
                    tracing::debug!(
                        symbol = %snapshot.symbol,
                        last = snapshot.last_price,
                        vwap = snapshot.vwap,
                        volume = snapshot.volume,
                        high = snapshot.day_high,
                        low = snapshot.day_low,
                        "symbol snapshot"
                    );
                }
                if let Some(leader) = exchange
                    .top_symbols(crate::services::exchange::TopCriterion::Volume, 1)
                    .first()
                {
                    tracing::debug!(
                        symbol = %leader.symbol,
                        volume = leader.volume,
                        "most active symbol"
                    );
                }
                let index = exchange.market_index();
                tracing::info!(
                    healthy = exchange.is_healthy(),
                    quiesced = exchange.quiesced(),
                    index_value = index.value,
                    accounts = accounts.loaded_count(),
                    reservations = accounts.live_reservations(),
                    sessions = sessions.active_count(),
                    symbols = exchange.symbols().len(),
                    "exchange heartbeat"
                );
            }
        });
    }

    // Periodic account flush + market snapshot sync
    {
        let accounts = Arc::clone(&accounts);
        let exchange = Arc::clone(&exchange);
        let db = db.clone();
        let every = Duration::from_secs(config.account_flush_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                accounts.flush_dirty(&db).await;
                if let Err(e) = db.save_quotes(&exchange.stock_rows()).await {
                    tracing::error!(error = %e, "failed to sync stock quotes");
                }
            }
        });
    }

    // TCP order gateway
    let listener = TcpListener::bind(config.tcp_bind())
        .await
        .with_context(|| format!("failed to bind tcp gateway on {}", config.tcp_bind()))?;
    let gateway = Arc::new(TcpGateway::new(
        Arc::clone(&exchange),
        Arc::clone(&sessions),
        db.clone(),
    ));
    let gateway_task = tokio::spawn(Arc::clone(&gateway).serve(listener));
    tracing::info!("Aurex exchange is accepting orders on {}", config.tcp_bind());

    // Run until interrupted, then unwind in dependency order.
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    gateway_task.abort();
    let stopping = Arc::clone(&exchange);
    tokio::task::spawn_blocking(move || stopping.stop())
        .await
        .context("exchange shutdown panicked")?;

    let flushed = accounts.flush_all(&db).await;
    if let Err(e) = db.save_quotes(&exchange.stock_rows()).await {
        tracing::error!(error = %e, "failed to persist final quotes");
    }
    tracing::info!(flushed, "final account sync complete, goodbye");
    Ok(())
}
