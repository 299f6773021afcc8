// =============================================================================
// ChartSync — Main Entry Point
// =============================================================================
//
// Wires the Binance market source, the repository, the conflation hub, and
// the REST/WS façade around the sync orchestrator, then runs until Ctrl+C.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use chartsync::api::rest::{self, ApiContext};
use chartsync::api::ws;
use chartsync::binance::BinanceMarketSource;
use chartsync::{
    ConflationHub, EventBus, Paths, SeriesCache, SessionState, SyncConfig, SyncOrchestrator,
    SyncSettings, TimeSeriesRepository,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║               ChartSync — Starting Up                    ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut settings = SyncSettings::load("chartsync.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        SyncSettings::default()
    });
    settings.apply_env_overrides();

    let interval = settings.interval_parsed();
    info!(
        symbol = %settings.symbol,
        interval = %settings.interval,
        cache_dir = %settings.cache_dir,
        "Configured session"
    );

    // ── 2. Build shared components ───────────────────────────────────────
    let repo = Arc::new(TimeSeriesRepository::new());
    let cache = Arc::new(SeriesCache::new());
    let bus = Arc::new(EventBus::new());
    let hub = Arc::new(ConflationHub::new(Duration::from_millis(
        settings.ws_conflation_ms,
    )));
    let source = Arc::new(BinanceMarketSource::new());

    // The hub feeds the WebSocket fan-out through a broadcast channel. Its
    // sweep timer is owned by the orchestrator's session lifecycle.
    let (ws_feed, _) = broadcast::channel(256);
    hub.set_emitter(ws::broadcast_emitter(ws_feed.clone()));

    let orchestrator = SyncOrchestrator::new(
        source,
        repo.clone(),
        Paths {
            cache_dir: settings.cache_dir.clone().into(),
        },
        cache.clone(),
        bus.clone(),
        hub.clone(),
        SyncConfig::from_settings(&settings),
    );

    // Log series transitions as they are published.
    let _series_sub = bus.subscribe_series_updated(|evt| {
        debug!(
            state = %evt.state,
            count = evt.count,
            last_open = evt.last_open,
            live_gap = evt.live_gap,
            "series updated"
        );
    });

    // ── 3. Start the session ─────────────────────────────────────────────
    orchestrator
        .start(SessionState {
            symbol: settings.symbol.clone(),
            interval,
        })
        .await?;

    // ── 4. Start the API server ──────────────────────────────────────────
    let ctx = Arc::new(ApiContext {
        cache,
        repo,
        orchestrator: orchestrator.clone(),
        ws_feed,
    });
    let bind_addr = settings.bind_addr.clone();

    tokio::spawn(async move {
        let app = rest::router(ctx);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("Failed to bind API server");
        info!(addr = %bind_addr, "API server listening");
        axum::serve(listener, app)
            .await
            .expect("API server failed");
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    orchestrator.stop().await;

    info!("ChartSync shut down complete.");
    Ok(())
}
