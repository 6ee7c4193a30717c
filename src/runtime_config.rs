// =============================================================================
// Runtime Configuration — engine and per-display settings with atomic save
// =============================================================================
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file. Display options are editable at
// runtime per display; the engine-level block only changes across restarts.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::layout::{AxisBounds, ContainerSize, LayoutOptions};
use crate::processor::engine::DEFAULT_SNAPSHOT_INTERVAL_MS;
use crate::processor::ProcessorSettings;
use crate::types::{ColorMode, ProfileMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_feed_url() -> String {
    "wss://feed.pulsedesk.local/v1/stream".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_initial_snapshot_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_base_delay_ms() -> u64 {
    500
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_reconnect_alert_threshold() -> u32 {
    5
}

fn default_ingress_queue_capacity() -> usize {
    1024
}

fn default_container_size() -> ContainerSize {
    ContainerSize { w: 220.0, h: 160.0 }
}

fn default_header_height() -> f64 {
    40.0
}

fn default_adr_axis_position() -> f64 {
    0.65
}

fn default_snapshot_interval() -> i64 {
    DEFAULT_SNAPSHOT_INTERVAL_MS
}

// =============================================================================
// DisplayConfig
// =============================================================================

/// Per-display options, editable at runtime. Geometry fields feed the layout
/// derivation; the rest feed the processor. Changes take effect on the next
/// tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// Physical display dimensions.
    #[serde(default = "default_container_size")]
    pub container_size: ContainerSize,

    #[serde(default = "default_header_height")]
    pub header_height: f64,

    /// X position of the ADR axis as a fraction of content width.
    #[serde(default = "default_adr_axis_position")]
    pub adr_axis_position: f64,

    /// Clamp bounds for `adr_axis_position`. Out-of-range positions are
    /// clamped, never rejected.
    #[serde(default)]
    pub adr_axis_bounds: AxisBounds,

    #[serde(default)]
    pub profile_mode: ProfileMode,

    /// Overrides the asset-class default profile bucket size.
    #[serde(default)]
    pub bucket_size_override: Option<f64>,

    /// Truncate the profile view to the K highest-volume buckets.
    #[serde(default)]
    pub profile_top_k: Option<usize>,

    /// Renderer colouring hint; no processor effect.
    #[serde(default)]
    pub color_mode: ColorMode,

    /// Snapshot rate limit in milliseconds.
    #[serde(default = "default_snapshot_interval")]
    pub min_snapshot_interval_ms: i64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            container_size: default_container_size(),
            header_height: default_header_height(),
            adr_axis_position: default_adr_axis_position(),
            adr_axis_bounds: AxisBounds::default(),
            profile_mode: ProfileMode::default(),
            bucket_size_override: None,
            profile_top_k: None,
            color_mode: ColorMode::default(),
            min_snapshot_interval_ms: default_snapshot_interval(),
        }
    }
}

impl DisplayConfig {
    /// The geometry slice of the config, consumed by the layout derivation.
    pub fn layout_options(&self) -> LayoutOptions {
        LayoutOptions {
            header_height: self.header_height,
            adr_axis_position: self.adr_axis_position,
            adr_axis_bounds: self.adr_axis_bounds,
        }
    }

    /// The processor slice of the config.
    pub fn processor_settings(&self) -> ProcessorSettings {
        ProcessorSettings {
            profile_mode: self.profile_mode,
            bucket_size_override: self.bucket_size_override,
            profile_top_k: self.profile_top_k,
            min_snapshot_interval_ms: self.min_snapshot_interval_ms,
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level engine configuration.
///
/// Every field has a serde default so that older JSON files missing new fields
/// still deserialise correctly. Feed credentials are never persisted here;
/// they come from the environment at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Upstream feed -------------------------------------------------------

    #[serde(default = "default_feed_url")]
    pub feed_url: String,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// How long a fresh subscription waits for its initial SNAPSHOT before a
    /// timeout error is surfaced (the subscription itself stays pending).
    #[serde(default = "default_initial_snapshot_timeout_ms")]
    pub initial_snapshot_timeout_ms: u64,

    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// After this many consecutive failed reconnects a `connection_lost`
    /// error is surfaced to every display. Retrying continues regardless.
    #[serde(default = "default_reconnect_alert_threshold")]
    pub reconnect_alert_threshold: u32,

    /// Per-processor ingress queue depth. Overflow drops the oldest tick.
    #[serde(default = "default_ingress_queue_capacity")]
    pub ingress_queue_capacity: usize,

    // --- API surface ---------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // --- Display defaults ----------------------------------------------------

    /// Config applied to displays created without an explicit one.
    #[serde(default)]
    pub default_display: DisplayConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            feed_url: default_feed_url(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            initial_snapshot_timeout_ms: default_initial_snapshot_timeout_ms(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            reconnect_alert_threshold: default_reconnect_alert_threshold(),
            ingress_queue_capacity: default_ingress_queue_capacity(),
            bind_addr: default_bind_addr(),
            default_display: DisplayConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            feed_url = %config.feed_url,
            bind_addr = %config.bind_addr,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Apply environment overrides. Called once at startup.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("PULSEDESK_FEED_URL") {
            if !url.is_empty() {
                self.feed_url = url;
            }
        }
        if let Ok(addr) = std::env::var("PULSEDESK_BIND_ADDR") {
            if !addr.is_empty() {
                self.bind_addr = addr;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.heartbeat_interval_ms, 10_000);
        assert_eq!(cfg.initial_snapshot_timeout_ms, 10_000);
        assert_eq!(cfg.reconnect_base_delay_ms, 500);
        assert_eq!(cfg.reconnect_max_delay_ms, 30_000);
        assert_eq!(cfg.reconnect_alert_threshold, 5);
        assert_eq!(cfg.ingress_queue_capacity, 1024);

        let d = &cfg.default_display;
        assert!((d.container_size.w - 220.0).abs() < 1e-9);
        assert!((d.container_size.h - 160.0).abs() < 1e-9);
        assert!((d.header_height - 40.0).abs() < 1e-9);
        assert!((d.adr_axis_position - 0.65).abs() < 1e-9);
        assert_eq!(d.min_snapshot_interval_ms, 16);
        assert_eq!(d.profile_mode, ProfileMode::Traditional);
        assert_eq!(d.color_mode, ColorMode::Intensity);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "bind_addr": "127.0.0.1:9000", "reconnect_alert_threshold": 3 }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:9000");
        assert_eq!(cfg.reconnect_alert_threshold, 3);
        assert_eq!(cfg.heartbeat_interval_ms, 10_000);
    }

    #[test]
    fn partial_display_config_fills_defaults() {
        let json = r#"{ "profile_mode": "delta", "min_snapshot_interval_ms": 33 }"#;
        let cfg: DisplayConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.profile_mode, ProfileMode::Delta);
        assert_eq!(cfg.min_snapshot_interval_ms, 33);
        assert!((cfg.adr_axis_position - 0.65).abs() < 1e-9);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, cfg2);
    }

    #[test]
    fn processor_settings_projection() {
        let mut cfg = DisplayConfig::default();
        cfg.profile_mode = ProfileMode::Delta;
        cfg.bucket_size_override = Some(0.5);
        cfg.min_snapshot_interval_ms = 50;

        let settings = cfg.processor_settings();
        assert_eq!(settings.profile_mode, ProfileMode::Delta);
        assert_eq!(settings.bucket_size_override, Some(0.5));
        assert_eq!(settings.min_snapshot_interval_ms, 50);
    }

    #[test]
    fn layout_options_projection() {
        let cfg = DisplayConfig::default();
        let opts = cfg.layout_options();
        assert!((opts.header_height - 40.0).abs() < 1e-9);
        assert!((opts.adr_axis_position - 0.65).abs() < 1e-9);
        assert!((opts.adr_axis_bounds.min - 0.05).abs() < 1e-9);
        assert!((opts.adr_axis_bounds.max - 0.95).abs() < 1e-9);
    }
}
