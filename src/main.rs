use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use papertrade::config::AppConfig;
use papertrade::services::feed::MarketFeed;
use papertrade::services::futures::{FuturesEngine, FuturesOrderService, PositionCloser};
use papertrade::services::portfolio::PortfolioService;
use papertrade::services::price::{HttpPriceSource, PriceCache};
use papertrade::services::spot::SpotMatchingEngine;
use papertrade::store::Store;
use papertrade::ws::AccountEventBroadcaster;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "papertrade=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;

    tracing::info!("Starting papertrade v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Tracked pairs: {}", config.trading_pairs);

    let store = Store::new();

    let source = Arc::new(HttpPriceSource::new(&config.ticker_base_url));
    let prices = Arc::new(PriceCache::new(
        source.clone(),
        config.price_fresh(),
        config.price_fallback(),
        config.price_fetch_timeout(),
    ));
    tracing::info!("Price cache initialized against {}", config.ticker_base_url);

    let portfolio = Arc::new(PortfolioService::new(store.clone(), prices.clone()));
    let broadcaster = Arc::new(AccountEventBroadcaster::new(
        portfolio,
        config.portfolio_broadcast(),
    ));
    tracing::info!("Account event broadcaster initialized");

    // spot: the feed polls upstream prices and sweeps resting limit orders
    let matcher = Arc::new(SpotMatchingEngine::new(store.clone(), broadcaster.clone()));
    let feed = MarketFeed::new(source, prices.clone(), matcher, config.feed_poll());
    feed.start(&config.get_trading_pairs());

    // futures: the engine fills, fires targets and liquidates on its tick
    let orders = Arc::new(FuturesOrderService::new(
        store.clone(),
        prices.clone(),
        broadcaster.clone(),
    ));
    let closer = Arc::new(PositionCloser::new(
        store.clone(),
        prices.clone(),
        broadcaster.clone(),
    ));
    let engine = FuturesEngine::new(store.clone(), prices, orders, closer, config.engine_tick());
    engine.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    engine.stop();
    feed.stop();
    broadcaster.shutdown();

    let stats = store.stats().await;
    tracing::info!(
        balances = stats.balances,
        spot_orders = stats.spot_orders,
        futures_orders = stats.futures_orders,
        positions = stats.positions,
        history_rows = stats.history_rows,
        "Store contents at shutdown"
    );

    Ok(())
}
