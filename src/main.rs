// =============================================================================
// Pulsedesk Engine — Main Entry Point
// =============================================================================
//
// Per-symbol tick processing and visual-range backend for the display
// workstation. Boot order: config, feed manager, API server, then wait for
// shutdown. Displays are created at runtime through the API; nothing is
// subscribed until a display asks for it.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod display;
mod errors;
mod feed;
mod history;
mod instrument;
mod layout;
mod price_format;
mod processor;
mod runtime_config;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::feed::manager::FeedSettings;
use crate::runtime_config::EngineConfig;

const CONFIG_PATH: &str = "pulsedesk_config.json";

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
    info!("║        Pulsedesk Engine — Starting Up                   ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });
    config.apply_env_overrides();

    info!(
        feed_url = %config.feed_url,
        bind_addr = %config.bind_addr,
        "engine configured"
    );

    // ── 2. Feed manager ──────────────────────────────────────────────────
    let feed_settings = FeedSettings::from_config(&config);
    if feed_settings.auth_token.is_empty() {
        warn!("PULSEDESK_FEED_TOKEN is not set — the feed will reject authentication");
    }
    let feed = feed::manager::spawn(feed_settings);

    // ── 3. Shared state ──────────────────────────────────────────────────
    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState::new(config, feed));

    // ── 4. API server ────────────────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr_clone = bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr_clone)
            .await
            .expect("Failed to bind API server");
        info!(addr = %bind_addr_clone, "API server listening");
        axum::serve(listener, app)
            .await
            .expect("API server failed");
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    state.displays.shutdown_all().await;

    if let Err(e) = state.config.read().save(CONFIG_PATH) {
        error!(error = %e, "Failed to save engine config on shutdown");
    }

    info!("Pulsedesk Engine shut down complete.");
    Ok(())
}
