// =============================================================================
// Price-marker engine
// =============================================================================
//
// Detects significant per-tick events and emits time-decaying markers the
// renderer draws as annotations. The engine itself is almost stateless: it
// keeps per-kind cooldown deadlines and a small spread-statistics window; the
// active marker list lives in the processor and is maintained through
// [`merge`].
//
// Detection rules:
//   - new_high / new_low     mid exceeds today's observed extreme
//   - adr_high/low_touch     mid comes within 1 pip of the projected ADR band
//   - large_move             |mid - mid k ticks ago| beyond a pip threshold
//   - spread_spike           spread beyond mean + 3 sigma of the recent window

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::history::RingBuffer;
use crate::instrument::InstrumentDescriptor;
use crate::types::Tick;

use super::engine::PricePoint;

/// Closed set of marker kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    NewHigh,
    NewLow,
    AdrHighTouch,
    AdrLowTouch,
    LargeMove,
    SpreadSpike,
}

/// At most this many active markers per kind; oldest evicted first.
pub const MAX_PER_KIND: usize = 8;

/// Lifetime per kind, milliseconds.
pub const TTL_NEW_EXTREME_MS: i64 = 300_000;
pub const TTL_ADR_TOUCH_MS: i64 = 30_000;
pub const TTL_LARGE_MOVE_MS: i64 = 5_000;
pub const TTL_SPREAD_SPIKE_MS: i64 = 10_000;

/// Large-move detection: reference point this many ticks back, pip threshold,
/// and re-arm delay.
const LARGE_MOVE_LOOKBACK_TICKS: usize = 16;
const LARGE_MOVE_THRESHOLD_PIPS: f64 = 15.0;
const LARGE_MOVE_COOLDOWN_MS: i64 = 10_000;

const ADR_TOUCH_EPSILON_PIPS: f64 = 1.0;
const ADR_TOUCH_COOLDOWN_MS: i64 = 30_000;

const SPREAD_WINDOW: usize = 64;
const SPREAD_MIN_SAMPLES: usize = 16;
const SPREAD_SPIKE_COOLDOWN_MS: i64 = 10_000;

impl MarkerKind {
    pub fn ttl_ms(&self) -> i64 {
        match self {
            Self::NewHigh | Self::NewLow => TTL_NEW_EXTREME_MS,
            Self::AdrHighTouch | Self::AdrLowTouch => TTL_ADR_TOUCH_MS,
            Self::LargeMove => TTL_LARGE_MOVE_MS,
            Self::SpreadSpike => TTL_SPREAD_SPIKE_MS,
        }
    }

    /// New extremes supersede their predecessor instead of stacking.
    fn supersedes(&self) -> bool {
        matches!(self, Self::NewHigh | Self::NewLow)
    }
}

/// A detected event. Pure value; `magnitude` feeds renderer alpha/scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceMarker {
    pub kind: MarkerKind,
    pub price: f64,
    pub created_at_ms: i64,
    pub ttl_ms: i64,
    pub magnitude: f64,
}

impl PriceMarker {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms - self.created_at_ms > self.ttl_ms
    }
}

#[derive(Debug, Clone)]
pub struct MarkerEngine {
    cooldown_until: HashMap<MarkerKind, i64>,
    spreads: RingBuffer<f64>,
}

impl MarkerEngine {
    pub fn new() -> Self {
        Self {
            cooldown_until: HashMap::new(),
            spreads: RingBuffer::new(SPREAD_WINDOW),
        }
    }

    /// Drop cooldowns and spread statistics (day rollover).
    pub fn reset(&mut self) {
        self.cooldown_until.clear();
        self.spreads.clear();
    }

    /// Evaluate one tick. Updates today's observed high/low on the descriptor
    /// and returns any newly detected markers. `history` must already contain
    /// the current tick's mid as its latest element.
    pub fn evaluate(
        &mut self,
        tick: &Tick,
        instrument: &mut InstrumentDescriptor,
        history: &RingBuffer<PricePoint>,
    ) -> Vec<PriceMarker> {
        let mid = tick.mid();
        let now = tick.timestamp_ms;
        let pip = instrument.pip_size;
        let mut out = Vec::new();

        // -- today's extremes -------------------------------------------------
        let (new_high, new_low) = instrument.observe_mid(mid);
        if new_high {
            out.push(self.marker(MarkerKind::NewHigh, mid, now, 1.0));
        }
        if new_low {
            out.push(self.marker(MarkerKind::NewLow, mid, now, 1.0));
        }

        // -- projected ADR band ----------------------------------------------
        let epsilon = ADR_TOUCH_EPSILON_PIPS * pip;
        if mid + epsilon >= instrument.projected_adr_high
            && self.armed(MarkerKind::AdrHighTouch, now)
        {
            out.push(self.marker(MarkerKind::AdrHighTouch, mid, now, 1.0));
            self.disarm(MarkerKind::AdrHighTouch, now + ADR_TOUCH_COOLDOWN_MS);
        }
        if mid - epsilon <= instrument.projected_adr_low
            && self.armed(MarkerKind::AdrLowTouch, now)
        {
            out.push(self.marker(MarkerKind::AdrLowTouch, mid, now, 1.0));
            self.disarm(MarkerKind::AdrLowTouch, now + ADR_TOUCH_COOLDOWN_MS);
        }

        // -- large move -------------------------------------------------------
        if let Some(reference) = history.nth_back(LARGE_MOVE_LOOKBACK_TICKS) {
            let delta = mid - reference.price;
            if delta.abs() > LARGE_MOVE_THRESHOLD_PIPS * pip
                && self.armed(MarkerKind::LargeMove, now)
            {
                debug!(
                    symbol = %instrument.symbol,
                    delta,
                    "large move detected"
                );
                out.push(self.marker(MarkerKind::LargeMove, mid, now, delta.abs()));
                self.disarm(MarkerKind::LargeMove, now + LARGE_MOVE_COOLDOWN_MS);
            }
        }

        // -- spread spike ------------------------------------------------------
        let spread = tick.spread();
        if self.spreads.len() >= SPREAD_MIN_SAMPLES {
            let (mean, std) = spread_stats(&self.spreads);
            if std > f64::EPSILON
                && spread > mean + 3.0 * std
                && self.armed(MarkerKind::SpreadSpike, now)
            {
                out.push(self.marker(MarkerKind::SpreadSpike, mid, now, (spread - mean) / pip));
                self.disarm(MarkerKind::SpreadSpike, now + SPREAD_SPIKE_COOLDOWN_MS);
            }
        }
        self.spreads.push(spread);

        out
    }

    fn marker(&self, kind: MarkerKind, price: f64, now: i64, magnitude: f64) -> PriceMarker {
        PriceMarker {
            kind,
            price,
            created_at_ms: now,
            ttl_ms: kind.ttl_ms(),
            magnitude,
        }
    }

    fn armed(&self, kind: MarkerKind, now: i64) -> bool {
        self.cooldown_until.get(&kind).map_or(true, |t| now >= *t)
    }

    fn disarm(&mut self, kind: MarkerKind, until: i64) {
        self.cooldown_until.insert(kind, until);
    }
}

impl Default for MarkerEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Fold freshly detected markers into the active list: supersede previous
/// extremes, drop expired entries, and enforce the per-kind cap (oldest
/// evicted first).
pub fn merge(active: &mut Vec<PriceMarker>, fresh: Vec<PriceMarker>, now_ms: i64) {
    for marker in fresh {
        if marker.kind.supersedes() {
            active.retain(|m| m.kind != marker.kind);
        }
        active.push(marker);
    }

    active.retain(|m| !m.is_expired(now_ms));

    for kind in [
        MarkerKind::NewHigh,
        MarkerKind::NewLow,
        MarkerKind::AdrHighTouch,
        MarkerKind::AdrLowTouch,
        MarkerKind::LargeMove,
        MarkerKind::SpreadSpike,
    ] {
        let count = active.iter().filter(|m| m.kind == kind).count();
        if count > MAX_PER_KIND {
            let mut excess = count - MAX_PER_KIND;
            // Entries are in insertion order, so removal from the front drops
            // the oldest of this kind first.
            active.retain(|m| {
                if m.kind == kind && excess > 0 {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
        }
    }
}

fn spread_stats(window: &RingBuffer<f64>) -> (f64, f64) {
    let n = window.len() as f64;
    let mean = window.iter().sum::<f64>() / n;
    let variance = window.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::InstrumentDescriptor;

    fn eurusd() -> InstrumentDescriptor {
        InstrumentDescriptor::new("EURUSD", 5, 1.08500, 1.08750, 1.08350, 1.08680, 1.08420)
    }

    fn tick(mid: f64, ts: i64) -> Tick {
        Tick {
            bid: mid - 0.00001,
            ask: mid + 0.00001,
            bid_size: 1.0,
            ask_size: 1.0,
            timestamp_ms: ts,
            day_id: 1,
        }
    }

    fn history_of(mids: &[(f64, i64)]) -> RingBuffer<PricePoint> {
        let mut h = RingBuffer::new(512);
        for (price, ts) in mids {
            h.push(PricePoint {
                price: *price,
                timestamp_ms: *ts,
            });
        }
        h
    }

    #[test]
    fn new_high_marker_and_descriptor_update() {
        let mut engine = MarkerEngine::new();
        let mut instr = eurusd();
        let t = tick(1.08700, 0);
        let history = history_of(&[(1.08700, 0)]);

        let out = engine.evaluate(&t, &mut instr, &history);
        assert!(out.iter().any(|m| m.kind == MarkerKind::NewHigh));
        assert!((instr.todays_high - 1.08700).abs() < 1e-12);
    }

    #[test]
    fn no_marker_inside_todays_range() {
        let mut engine = MarkerEngine::new();
        let mut instr = eurusd();
        let t = tick(1.08500, 0);
        let history = history_of(&[(1.08500, 0)]);

        let out = engine.evaluate(&t, &mut instr, &history);
        assert!(out.is_empty());
    }

    #[test]
    fn adr_touch_with_cooldown() {
        let mut engine = MarkerEngine::new();
        let mut instr = eurusd();
        // Within 1 pip of the projected high (1.08750).
        let history = history_of(&[(1.08745, 0)]);
        let out = engine.evaluate(&tick(1.08745, 0), &mut instr, &history);
        assert!(out.iter().any(|m| m.kind == MarkerKind::AdrHighTouch));

        // Immediately after: still touching, but cooled down.
        let out = engine.evaluate(&tick(1.08746, 100), &mut instr, &history);
        assert!(!out.iter().any(|m| m.kind == MarkerKind::AdrHighTouch));

        // After the cooldown expires it re-arms.
        let out = engine.evaluate(&tick(1.08746, 31_000), &mut instr, &history);
        assert!(out.iter().any(|m| m.kind == MarkerKind::AdrHighTouch));
    }

    #[test]
    fn large_move_magnitude_in_price_units() {
        let mut engine = MarkerEngine::new();
        // BTC-style commodity class: pip = 10.
        let mut instr = InstrumentDescriptor::new("BTCUSD", 2, 43_000.0, 44_000.0, 42_000.0, 43_500.0, 42_500.0);
        let history = history_of(&[(43_250.0, 0), (43_450.0, 500)]);

        let out = engine.evaluate(&tick(43_450.0, 500), &mut instr, &history);
        let large: Vec<_> = out
            .iter()
            .filter(|m| m.kind == MarkerKind::LargeMove)
            .collect();
        assert_eq!(large.len(), 1);
        assert!((large[0].magnitude - 200.0).abs() < 1.0);
        assert_eq!(large[0].ttl_ms, TTL_LARGE_MOVE_MS);
    }

    #[test]
    fn large_move_respects_cooldown() {
        let mut engine = MarkerEngine::new();
        let mut instr = InstrumentDescriptor::new("BTCUSD", 2, 43_000.0, 44_000.0, 42_000.0, 43_500.0, 42_500.0);
        let history = history_of(&[(43_250.0, 0), (43_450.0, 500)]);

        let out = engine.evaluate(&tick(43_450.0, 500), &mut instr, &history);
        assert!(out.iter().any(|m| m.kind == MarkerKind::LargeMove));

        // Another qualifying move inside the cooldown window is suppressed.
        let history = history_of(&[(43_450.0, 500), (43_700.0, 1_000)]);
        let out = engine.evaluate(&tick(43_700.0, 1_000), &mut instr, &history);
        assert!(!out.iter().any(|m| m.kind == MarkerKind::LargeMove));
    }

    #[test]
    fn spread_spike_detection() {
        let mut engine = MarkerEngine::new();
        let mut instr = eurusd();
        let history = history_of(&[(1.08500, 0)]);

        // Build up a window of slightly noisy spreads.
        for i in 0..30 {
            let jitter = (i % 3) as f64 * 0.000001;
            let t = Tick {
                bid: 1.08500,
                ask: 1.08502 + jitter,
                bid_size: 1.0,
                ask_size: 1.0,
                timestamp_ms: i,
                day_id: 1,
            };
            engine.evaluate(&t, &mut instr, &history);
        }

        // A spread an order of magnitude wider spikes past mean + 3 sigma.
        let wide = Tick {
            bid: 1.08500,
            ask: 1.08540,
            bid_size: 1.0,
            ask_size: 1.0,
            timestamp_ms: 100,
            day_id: 1,
        };
        let out = engine.evaluate(&wide, &mut instr, &history);
        assert!(out.iter().any(|m| m.kind == MarkerKind::SpreadSpike));
    }

    #[test]
    fn constant_spread_never_spikes() {
        let mut engine = MarkerEngine::new();
        let mut instr = eurusd();
        let history = history_of(&[(1.08500, 0)]);
        for i in 0..50 {
            let out = engine.evaluate(&tick(1.08500, i), &mut instr, &history);
            assert!(!out.iter().any(|m| m.kind == MarkerKind::SpreadSpike));
        }
    }

    #[test]
    fn merge_expires_and_caps() {
        let mut active = Vec::new();
        // 12 large-move markers, one per second.
        for i in 0..12 {
            let fresh = vec![PriceMarker {
                kind: MarkerKind::LargeMove,
                price: 1.0,
                created_at_ms: i * 1_000,
                ttl_ms: 60_000,
                magnitude: 1.0,
            }];
            merge(&mut active, fresh, i * 1_000);
        }
        assert_eq!(active.len(), MAX_PER_KIND);
        // Oldest were evicted first.
        assert_eq!(active[0].created_at_ms, 4_000);

        // Advancing time expires everything.
        merge(&mut active, Vec::new(), 100_000);
        assert!(active.is_empty());
    }

    #[test]
    fn merge_supersedes_previous_extreme() {
        let mut active = Vec::new();
        let high = |ts: i64, price: f64| PriceMarker {
            kind: MarkerKind::NewHigh,
            price,
            created_at_ms: ts,
            ttl_ms: TTL_NEW_EXTREME_MS,
            magnitude: 1.0,
        };
        merge(&mut active, vec![high(0, 1.0870)], 0);
        merge(&mut active, vec![high(1_000, 1.0875)], 1_000);
        let highs: Vec<_> = active
            .iter()
            .filter(|m| m.kind == MarkerKind::NewHigh)
            .collect();
        assert_eq!(highs.len(), 1);
        assert!((highs[0].price - 1.0875).abs() < 1e-12);
    }

    #[test]
    fn reset_clears_cooldowns() {
        let mut engine = MarkerEngine::new();
        let mut instr = eurusd();
        let history = history_of(&[(1.08745, 0)]);
        let out = engine.evaluate(&tick(1.08745, 0), &mut instr, &history);
        assert!(out.iter().any(|m| m.kind == MarkerKind::AdrHighTouch));

        engine.reset();
        let out = engine.evaluate(&tick(1.08746, 100), &mut instr, &history);
        assert!(out.iter().any(|m| m.kind == MarkerKind::AdrHighTouch));
    }
}
