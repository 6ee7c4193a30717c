// =============================================================================
// Central Application State
// =============================================================================
//
// Ties the engine together: runtime config, the feed manager handle, and the
// display registry. Shared across the API tasks via `Arc<AppState>`. There is
// no engine-wide mutable state beyond what the subsystems own themselves.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::display::{DisplayInfo, DisplayManager};
use crate::feed::manager::{FeedHandle, FeedMetricsSnapshot};
use crate::runtime_config::EngineConfig;

pub struct AppState {
    pub config: Arc<RwLock<EngineConfig>>,
    pub feed: FeedHandle,
    pub displays: DisplayManager,
    /// Engine start instant, for uptime reporting.
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: EngineConfig, feed: FeedHandle) -> Self {
        let displays = DisplayManager::new(
            feed.clone(),
            config.default_display.clone(),
            config.ingress_queue_capacity,
        );
        Self {
            config: Arc::new(RwLock::new(config)),
            feed,
            displays,
            start_time: std::time::Instant::now(),
        }
    }

    /// Engine-wide status payload for the dashboard.
    pub fn build_status(&self) -> EngineStatus {
        EngineStatus {
            connection_state: self.feed.connection_state().to_string(),
            feed: self.feed.metrics(),
            display_count: self.displays.count(),
            displays: self.displays.list(),
            uptime_s: self.start_time.elapsed().as_secs(),
            server_time: Utc::now().timestamp_millis(),
        }
    }
}

/// Payload of `GET /api/v1/state`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub connection_state: String,
    pub feed: FeedMetricsSnapshot,
    pub display_count: usize,
    pub displays: Vec<DisplayInfo>,
    pub uptime_s: u64,
    pub server_time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::manager;

    #[tokio::test]
    async fn status_reflects_displays() {
        let state = AppState::new(EngineConfig::default(), manager::test_handle());

        let status = state.build_status();
        assert_eq!(status.display_count, 0);
        assert_eq!(status.connection_state, "disconnected");

        let id = state.displays.create_display("EURUSD", None);
        let status = state.build_status();
        assert_eq!(status.display_count, 1);
        assert_eq!(status.displays[0].symbol, "EURUSD");

        state.displays.destroy_display(id).await;
        assert_eq!(state.build_status().display_count, 0);
    }

    #[tokio::test]
    async fn status_serializes() {
        let state = AppState::new(EngineConfig::default(), manager::test_handle());
        let json = serde_json::to_string(&state.build_status()).unwrap();
        assert!(json.contains("\"connection_state\":\"disconnected\""));
        assert!(json.contains("\"feed\""));
    }
}
