// =============================================================================
// Meridian Index Engine -- Main Entry Point
// =============================================================================
//
// Real-time trading signal pipeline for Indian equity-index derivatives.
// The engine starts in paper mode; live trading requires MERIDIAN_MODE=live
// (or the config file) plus a broker adapter.
//
// Feed selection:
//   MERIDIAN_FEED_URL    -- vendor WebSocket tick stream (wall clock)
//   MERIDIAN_REPLAY_FILE -- JSON-lines replay (virtual clock, deterministic
//                           IDs; MERIDIAN_REPLAY_SPEED for pacing)
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod bus;
mod clock;
mod core;
mod engine;
mod execution;
mod gateway;
mod indicators;
mod market_data;
mod runtime_config;
mod signal;
mod store;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::clock::{Clock, IdSource, VirtualClock, WallClock};
use crate::core::Core;
use crate::market_data::{ReplayFeed, TickSource, VendorSocketFeed};
use crate::runtime_config::CoreConfig;

const CONFIG_PATH: &str = "meridian_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Meridian Index Engine starting up");

    let mut config = CoreConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        CoreConfig::default()
    });
    config.apply_env_overrides();

    if let Err(e) = config.validate() {
        error!(error = %e, "configuration invalid -- refusing to start");
        std::process::exit(1);
    }

    info!(
        mode = %config.mode,
        instruments = ?config.instruments,
        timeframes = ?config.timeframes,
        agents = ?config.agents,
        "configuration ready"
    );

    // ── 2. Clock & id source (replay switches both) ──────────────────────
    let replay_file = std::env::var("MERIDIAN_REPLAY_FILE").ok();
    let (clock, ids, virtual_clock): (Arc<dyn Clock>, Arc<IdSource>, Option<Arc<VirtualClock>>) =
        if replay_file.is_some() {
            let seed = std::env::var("MERIDIAN_REPLAY_SEED")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1u64);
            let vclock = Arc::new(VirtualClock::new(0));
            (
                vclock.clone() as Arc<dyn Clock>,
                IdSource::replay(seed),
                Some(vclock),
            )
        } else {
            (Arc::new(WallClock) as Arc<dyn Clock>, IdSource::random(), None)
        };

    // ── 3. Build & restore the core ──────────────────────────────────────
    let core = match Core::build(config, clock, ids, None) {
        Ok(core) => core,
        Err(e) => {
            error!(error = %e, "failed to build core");
            std::process::exit(1);
        }
    };

    let (positions, signals) = core.restore();
    info!(positions, signals, "state restored from store");

    // ── 4. Spawn subsystems ──────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let subsystem_handles = core.spawn_subsystems(shutdown_rx.clone());
    info!(tasks = subsystem_handles.len(), "subsystems running");

    // ── 5. Tick feed ─────────────────────────────────────────────────────
    if let Some(path) = replay_file {
        let builder = core.builder.clone();
        let vclock = virtual_clock.expect("replay mode always has a virtual clock");
        let speed = std::env::var("MERIDIAN_REPLAY_SPEED")
            .ok()
            .and_then(|s| s.parse::<f64>().ok());
        tokio::spawn(async move {
            let feed = ReplayFeed::new(path, speed, vclock);
            if let Err(e) = feed.run(builder).await {
                error!(error = %e, "replay feed failed");
            }
        });
    } else if let Ok(url) = std::env::var("MERIDIAN_FEED_URL") {
        let builder = core.builder.clone();
        tokio::spawn(async move {
            loop {
                let feed = VendorSocketFeed::new(url.clone());
                if let Err(e) = feed.run(builder.clone()).await {
                    error!(error = %e, "tick feed error -- reconnecting in 5s");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });
    } else {
        warn!("no tick feed configured (MERIDIAN_FEED_URL / MERIDIAN_REPLAY_FILE) -- market data idle");
    }

    // ── 6. Gateway HTTP server ───────────────────────────────────────────
    let bind_addr = core.config.read().gateway.bind_addr.clone();
    let app = core.gateway.router();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "gateway listening");
    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "gateway server failed");
        }
    });

    info!("all subsystems running -- press Ctrl+C to stop");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received -- stopping");

    // Reverse dependency order: the gateway goes first so clients stop
    // receiving, then the decision/signal machinery, then market data.
    let _ = shutdown_tx.send(true);
    let _ = server.await;
    for handle in subsystem_handles {
        let _ = handle.await;
    }

    if let Err(e) = core.config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save config on shutdown");
    }

    info!("Meridian Index Engine shut down complete");
    Ok(())
}
