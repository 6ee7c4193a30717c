// =============================================================================
// Per-symbol tick processor
// =============================================================================
//
// Owns everything derived from one instrument's tick stream: price history,
// EWMA volatility and directional bias, the market profile, active price
// markers, and the visual range. Consumes ticks synchronously (no awaits, no
// locks) and emits rate-limited snapshots; every tick updates state, only
// snapshot emission is coalesced.

use anyhow::Result;
use serde::Serialize;
use tracing::{error, warn};

use crate::errors::FeedError;
use crate::history::RingBuffer;
use crate::instrument::InstrumentDescriptor;
use crate::price_format::{self, PriceParts};
use crate::types::{Candle, ProfileMode, Tick};

use super::markers::{self, MarkerEngine, PriceMarker};
use super::profile::{MarketProfile, ProfileBucket, TradeDirection, DEFAULT_MAX_LEVELS};
use super::range::{VisualRange, VisualRangeManager};

/// Price history depth.
pub const PRICE_HISTORY_CAPACITY: usize = 512;

/// Default snapshot rate limit (~60 Hz).
pub const DEFAULT_SNAPSHOT_INTERVAL_MS: i64 = 16;

/// EWMA smoothing for volatility intensity.
const VOLATILITY_ALPHA: f64 = 0.05;

/// EWMA smoothing for directional bias.
const BIAS_BETA: f64 = 0.02;

/// One sample of the mid-price history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PricePoint {
    pub price: f64,
    pub timestamp_ms: i64,
}

/// Per-display options the processor consumes. Derived from the display
/// config; geometry options never reach the processor.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorSettings {
    pub profile_mode: ProfileMode,
    pub bucket_size_override: Option<f64>,
    pub profile_top_k: Option<usize>,
    pub min_snapshot_interval_ms: i64,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            profile_mode: ProfileMode::Traditional,
            bucket_size_override: None,
            profile_top_k: None,
            min_snapshot_interval_ms: DEFAULT_SNAPSHOT_INTERVAL_MS,
        }
    }
}

/// Immutable view of processor state delivered to the renderer. Value-typed;
/// readers never need locks.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub symbol: String,
    pub timestamp_ms: i64,
    pub ready: bool,
    pub last_price: f64,
    pub last_tick_timestamp_ms: i64,
    pub price_parts: PriceParts,
    pub volatility_intensity: f64,
    pub directional_bias: f64,
    pub visual_range: VisualRange,
    pub instrument: InstrumentDescriptor,
    pub market_profile: Vec<ProfileBucket>,
    pub markers: Vec<PriceMarker>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FeedError>,
}

pub struct SymbolProcessor {
    instrument: InstrumentDescriptor,
    settings: ProcessorSettings,

    price_history: RingBuffer<PricePoint>,
    volatility_ewma: f64,
    directional_bias: f64,

    profile: MarketProfile,
    marker_engine: MarkerEngine,
    active_markers: Vec<PriceMarker>,

    range: VisualRangeManager,
    visual_range: VisualRange,
    /// Mid-price extremes observed since init / day rollover; drives the
    /// visual-range step selection.
    session_low: f64,
    session_high: f64,

    current_day: Option<u32>,
    last_price: f64,
    last_tick_timestamp_ms: i64,
    prev_mid: Option<f64>,
    last_direction: Option<TradeDirection>,

    ready: bool,
    shut_down: bool,
    last_snapshot_ms: Option<i64>,
    error: Option<FeedError>,
    invalid_ticks: u64,
}

impl SymbolProcessor {
    /// Build a processor for one instrument. Seeds the market profile from
    /// the historical candles exactly once and centres the initial visual
    /// range on today's open. `ready` stays false until the first tick.
    pub fn initialize(
        instrument: InstrumentDescriptor,
        initial_price: f64,
        history: &[Candle],
        settings: ProcessorSettings,
    ) -> Result<Self> {
        let bucket_size = settings.bucket_size_override.unwrap_or_else(|| {
            price_format::default_bucket_size(instrument.asset_class, instrument.pip_size)
        });
        let mut profile = MarketProfile::new(
            bucket_size,
            DEFAULT_MAX_LEVELS,
            settings.profile_mode == ProfileMode::Delta,
        )?;
        profile.seed_from_history(history, 0);

        let open = instrument.todays_open;
        let mut range = VisualRangeManager::new();
        let visual_range = range.update(open, instrument.adr_extent(), open, open);

        Ok(Self {
            instrument,
            settings,
            price_history: RingBuffer::new(PRICE_HISTORY_CAPACITY),
            volatility_ewma: 0.0,
            directional_bias: 0.0,
            profile,
            marker_engine: MarkerEngine::new(),
            active_markers: Vec::new(),
            range,
            visual_range,
            session_low: open,
            session_high: open,
            current_day: None,
            last_price: initial_price,
            last_tick_timestamp_ms: 0,
            prev_mid: None,
            last_direction: None,
            ready: false,
            shut_down: false,
            last_snapshot_ms: None,
            error: None,
            invalid_ticks: 0,
        })
    }

    /// Process one tick. Every valid tick updates state; a snapshot is
    /// returned only when the rate limiter allows (at most one per interval),
    /// so bursts coalesce without losing their effect.
    pub fn on_tick(&mut self, tick: &Tick) -> Option<StateSnapshot> {
        if self.shut_down {
            return None;
        }
        if !tick.is_valid() {
            self.invalid_ticks += 1;
            warn!(
                symbol = %self.instrument.symbol,
                bid = tick.bid,
                ask = tick.ask,
                dropped = self.invalid_ticks,
                "dropping invalid tick"
            );
            return None;
        }

        let mid = tick.mid();
        let ts = tick.timestamp_ms;

        // Day rollover resets intraday aggregates before processing.
        match self.current_day {
            Some(day) if day != tick.day_id => {
                self.instrument.roll_day(mid);
                self.session_low = mid;
                self.session_high = mid;
                self.active_markers.clear();
                self.marker_engine.reset();
                self.prev_mid = None;
                self.current_day = Some(tick.day_id);
            }
            None => self.current_day = Some(tick.day_id),
            _ => {}
        }

        self.price_history.push(PricePoint {
            price: mid,
            timestamp_ms: ts,
        });

        let delta = self.prev_mid.map_or(0.0, |prev| mid - prev);

        // EWMA of |move| in pips; read back through a tanh soft cap.
        let pips_moved = delta.abs() / self.instrument.pip_size;
        self.volatility_ewma =
            VOLATILITY_ALPHA * pips_moved + (1.0 - VOLATILITY_ALPHA) * self.volatility_ewma;

        let sign = if delta > 0.0 {
            1.0
        } else if delta < 0.0 {
            -1.0
        } else {
            0.0
        };
        self.directional_bias =
            (BIAS_BETA * sign + (1.0 - BIAS_BETA) * self.directional_bias).clamp(-1.0, 1.0);

        // Uptick rule for delta attribution; flat ticks inherit the previous
        // direction, the first tick stays unattributed.
        let direction = if delta > 0.0 {
            Some(TradeDirection::Buy)
        } else if delta < 0.0 {
            Some(TradeDirection::Sell)
        } else {
            self.last_direction
        };
        if direction.is_some() {
            self.last_direction = direction;
        }
        self.profile
            .on_tick(mid, tick.bid_size + tick.ask_size, ts, direction);

        let fresh = self
            .marker_engine
            .evaluate(tick, &mut self.instrument, &self.price_history);
        markers::merge(&mut self.active_markers, fresh, ts);

        self.session_low = self.session_low.min(mid);
        self.session_high = self.session_high.max(mid);
        self.visual_range = self.range.update(
            mid,
            self.instrument.adr_extent(),
            self.session_low,
            self.session_high,
        );

        self.last_price = mid;
        self.last_tick_timestamp_ms = ts;
        self.prev_mid = Some(mid);
        self.ready = true;

        if !(self.visual_range.high >= self.visual_range.low)
            || !self.visual_range.high.is_finite()
        {
            error!(
                symbol = %self.instrument.symbol,
                low = self.visual_range.low,
                high = self.visual_range.high,
                "visual range inverted, shutting processor down"
            );
            self.error = Some(FeedError::Internal {
                detail: "visual range inverted".to_string(),
            });
            self.shutdown();
            return Some(self.snapshot());
        }

        let emit = match self.last_snapshot_ms {
            None => true,
            Some(last) => ts - last >= self.settings.min_snapshot_interval_ms.max(0),
        };
        if emit {
            self.last_snapshot_ms = Some(ts);
            Some(self.snapshot())
        } else {
            None
        }
    }

    /// Build an immutable snapshot of current state. Safe at any time,
    /// including before the first tick and after shutdown.
    pub fn snapshot(&self) -> StateSnapshot {
        let now = self.last_tick_timestamp_ms;
        StateSnapshot {
            symbol: self.instrument.symbol.clone(),
            timestamp_ms: now,
            ready: self.ready,
            last_price: self.last_price,
            last_tick_timestamp_ms: self.last_tick_timestamp_ms,
            price_parts: price_format::split_price(self.last_price, self.instrument.digits),
            volatility_intensity: self.volatility_ewma.tanh().clamp(0.0, 1.0),
            directional_bias: self.directional_bias,
            visual_range: self.visual_range,
            instrument: self.instrument.clone(),
            market_profile: self.profile.view(self.settings.profile_top_k),
            markers: self
                .active_markers
                .iter()
                .filter(|m| !m.is_expired(now))
                .copied()
                .collect(),
            error: self.error.clone(),
        }
    }

    /// Apply updated per-display options. Geometry options never arrive here;
    /// a bucket-size override only applies at the next `initialize`.
    pub fn update_settings(&mut self, settings: ProcessorSettings) {
        self.profile
            .set_track_delta(settings.profile_mode == ProfileMode::Delta);
        self.settings = settings;
    }

    /// Attach (or clear) a feed error surfaced through snapshots.
    pub fn set_error(&mut self, error: Option<FeedError>) {
        self.error = error;
    }

    /// Release buffers. Idempotent; the processor ignores ticks afterwards.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.price_history.clear();
        self.active_markers.clear();
        self.profile.clear();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn symbol(&self) -> &str {
        &self.instrument.symbol
    }

    pub fn invalid_tick_count(&self) -> u64 {
        self.invalid_ticks
    }
}
