// =============================================================================
// Market-profile accumulator
// =============================================================================
//
// Bucketed volume/trade histogram keyed by quantized price. The level count is
// bounded: inserting a new bucket at the cap silently evicts the level with
// the oldest `last_update_ms`. Supports one-shot seeding from historical M1
// candles (volume spread uniformly across the buckets a candle spans) and an
// optional delta mode that attributes volume to the buy or sell side.

use std::collections::HashMap;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::Candle;

/// Hard cap on distinct price levels.
pub const DEFAULT_MAX_LEVELS: usize = 500;

/// Widest bucket span a single candle may seed. Wider candles are malformed
/// input and are skipped.
const MAX_SEED_SPAN: i64 = 10_000;

/// Side attribution for delta mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeDirection {
    Buy,
    Sell,
}

/// Accumulated state for one price bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProfileLevel {
    pub volume: f64,
    pub trade_count: u64,
    pub last_update_ms: i64,
    pub buy_volume: f64,
    pub sell_volume: f64,
}

/// One row of the rendered histogram, produced by [`MarketProfile::view`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProfileBucket {
    pub price: f64,
    pub volume: f64,
    pub trade_count: u64,
    pub buy_volume: f64,
    pub sell_volume: f64,
}

#[derive(Debug, Clone)]
pub struct MarketProfile {
    bucket_size: f64,
    max_levels: usize,
    track_delta: bool,
    levels: HashMap<i64, ProfileLevel>,
    seeded: bool,
}

impl MarketProfile {
    /// Create an empty profile. `bucket_size` must be finite and positive;
    /// `max_levels` must be non-zero.
    pub fn new(bucket_size: f64, max_levels: usize, track_delta: bool) -> Result<Self> {
        if !bucket_size.is_finite() || bucket_size <= 0.0 {
            bail!("market profile bucket_size must be positive and finite, got {bucket_size}");
        }
        if max_levels == 0 {
            bail!("market profile max_levels must be non-zero");
        }
        Ok(Self {
            bucket_size,
            max_levels,
            track_delta,
            levels: HashMap::new(),
            seeded: false,
        })
    }

    pub fn bucket_size(&self) -> f64 {
        self.bucket_size
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Switch delta attribution on or off. Past levels keep whatever sides
    /// they already accumulated.
    pub fn set_track_delta(&mut self, track: bool) {
        self.track_delta = track;
    }

    /// Fold one tick into the histogram. Never fails; eviction is silent.
    pub fn on_tick(
        &mut self,
        price: f64,
        size: f64,
        timestamp_ms: i64,
        direction: Option<TradeDirection>,
    ) {
        if !price.is_finite() {
            return;
        }
        let idx = self.bucket_index(price);

        if !self.levels.contains_key(&idx) && self.levels.len() >= self.max_levels {
            self.evict_oldest();
        }

        let level = self.levels.entry(idx).or_default();
        level.volume += size;
        level.trade_count += 1;
        level.last_update_ms = timestamp_ms;
        if self.track_delta {
            match direction {
                Some(TradeDirection::Buy) => level.buy_volume += size,
                Some(TradeDirection::Sell) => level.sell_volume += size,
                None => {}
            }
        }
    }

    /// Seed the histogram from historical M1 candles, spreading each candle's
    /// volume uniformly across the buckets spanned by `[low, high]`. Intended
    /// to run exactly once, before the first live tick; repeated calls are
    /// ignored.
    pub fn seed_from_history(&mut self, candles: &[Candle], fallback_timestamp_ms: i64) {
        if self.seeded {
            warn!("market profile already seeded, ignoring repeated seed");
            return;
        }
        self.seeded = true;

        for candle in candles {
            let (lo, hi) = if candle.l <= candle.h {
                (candle.l, candle.h)
            } else {
                (candle.h, candle.l)
            };
            if !lo.is_finite() || !hi.is_finite() || candle.v < 0.0 {
                warn!(t = candle.t, "skipping malformed candle in profile seed");
                continue;
            }

            let lo_idx = self.bucket_index(lo);
            let hi_idx = self.bucket_index(hi);
            let span = hi_idx - lo_idx + 1;
            if span > MAX_SEED_SPAN {
                warn!(t = candle.t, span, "skipping candle with implausible range");
                continue;
            }

            let timestamp = if candle.t > 0 {
                candle.t
            } else {
                fallback_timestamp_ms
            };
            let share = candle.v / span as f64;
            for idx in lo_idx..=hi_idx {
                if !self.levels.contains_key(&idx) && self.levels.len() >= self.max_levels {
                    self.evict_oldest();
                }
                let level = self.levels.entry(idx).or_default();
                level.volume += share;
                level.last_update_ms = timestamp;
            }
        }
    }

    /// Snapshot the histogram, buckets sorted descending by price. When
    /// `top_k` is set, only the K highest-volume buckets are kept.
    pub fn view(&self, top_k: Option<usize>) -> Vec<ProfileBucket> {
        let mut buckets: Vec<ProfileBucket> = self
            .levels
            .iter()
            .map(|(idx, level)| ProfileBucket {
                price: *idx as f64 * self.bucket_size,
                volume: level.volume,
                trade_count: level.trade_count,
                buy_volume: level.buy_volume,
                sell_volume: level.sell_volume,
            })
            .collect();

        if let Some(k) = top_k {
            buckets.sort_by(|a, b| b.volume.total_cmp(&a.volume));
            buckets.truncate(k);
        }
        buckets.sort_by(|a, b| b.price.total_cmp(&a.price));
        buckets
    }

    /// Drop all accumulated levels. Seeding state is not reset.
    pub fn clear(&mut self) {
        self.levels.clear();
    }

    fn bucket_index(&self, price: f64) -> i64 {
        (price / self.bucket_size).round() as i64
    }

    fn evict_oldest(&mut self) {
        // Deterministic tie-break on the bucket index so identical timestamps
        // do not make eviction depend on hash order.
        if let Some(oldest) = self
            .levels
            .iter()
            .min_by_key(|(idx, level)| (level.last_update_ms, **idx))
            .map(|(idx, _)| *idx)
        {
            self.levels.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(t: i64, l: f64, h: f64, v: f64) -> Candle {
        Candle {
            t,
            o: l,
            h,
            l,
            c: h,
            v,
        }
    }

    #[test]
    fn rejects_non_positive_bucket_size() {
        assert!(MarketProfile::new(0.0, 10, false).is_err());
        assert!(MarketProfile::new(-1.0, 10, false).is_err());
        assert!(MarketProfile::new(f64::NAN, 10, false).is_err());
    }

    #[test]
    fn rejects_zero_max_levels() {
        assert!(MarketProfile::new(1.0, 0, false).is_err());
    }

    #[test]
    fn accumulates_into_quantized_buckets() {
        let mut p = MarketProfile::new(0.001, 10, false).unwrap();
        p.on_tick(1.08547, 2.0, 1, None);
        p.on_tick(1.08460, 3.0, 2, None);
        // Both quantize to 1.085.
        assert_eq!(p.level_count(), 1);
        let view = p.view(None);
        assert!((view[0].price - 1.085).abs() < 1e-9);
        assert!((view[0].volume - 5.0).abs() < 1e-9);
        assert_eq!(view[0].trade_count, 2);
    }

    #[test]
    fn evicts_oldest_level_at_cap() {
        let mut p = MarketProfile::new(1.0, 3, false).unwrap();
        p.on_tick(100.0, 1.0, 1, None);
        p.on_tick(101.0, 1.0, 2, None);
        p.on_tick(102.0, 1.0, 3, None);
        p.on_tick(103.0, 1.0, 4, None);

        assert_eq!(p.level_count(), 3);
        let prices: Vec<f64> = p.view(None).iter().map(|b| b.price).collect();
        assert_eq!(prices, vec![103.0, 102.0, 101.0]);
    }

    #[test]
    fn updating_a_level_refreshes_its_age() {
        let mut p = MarketProfile::new(1.0, 2, false).unwrap();
        p.on_tick(100.0, 1.0, 1, None);
        p.on_tick(101.0, 1.0, 2, None);
        // Touch 100 again so 101 becomes the oldest.
        p.on_tick(100.0, 1.0, 3, None);
        p.on_tick(102.0, 1.0, 4, None);

        let prices: Vec<f64> = p.view(None).iter().map(|b| b.price).collect();
        assert_eq!(prices, vec![102.0, 100.0]);
    }

    #[test]
    fn level_count_never_exceeds_cap() {
        let mut p = MarketProfile::new(1.0, 5, false).unwrap();
        for i in 0..200 {
            p.on_tick(100.0 + i as f64, 1.0, i, None);
            assert!(p.level_count() <= 5);
        }
    }

    #[test]
    fn seed_spreads_volume_uniformly() {
        let mut p = MarketProfile::new(1.0, 100, false).unwrap();
        p.seed_from_history(&[candle(1_000, 100.0, 103.0, 8.0)], 0);
        // Buckets 100..=103, 2.0 volume each.
        assert_eq!(p.level_count(), 4);
        for bucket in p.view(None) {
            assert!((bucket.volume - 2.0).abs() < 1e-9);
            assert_eq!(bucket.trade_count, 0);
        }
    }

    #[test]
    fn seed_is_one_shot() {
        let mut p = MarketProfile::new(1.0, 100, false).unwrap();
        p.seed_from_history(&[candle(1_000, 100.0, 100.0, 4.0)], 0);
        p.seed_from_history(&[candle(2_000, 100.0, 100.0, 4.0)], 0);
        let view = p.view(None);
        assert!((view[0].volume - 4.0).abs() < 1e-9);
    }

    #[test]
    fn seeded_levels_age_out_before_live_ones() {
        let mut p = MarketProfile::new(1.0, 2, false).unwrap();
        p.seed_from_history(&[candle(10, 100.0, 101.0, 2.0)], 0);
        // Live ticks with later timestamps displace the seeds.
        p.on_tick(102.0, 1.0, 100, None);
        p.on_tick(103.0, 1.0, 101, None);
        let prices: Vec<f64> = p.view(None).iter().map(|b| b.price).collect();
        assert_eq!(prices, vec![103.0, 102.0]);
    }

    #[test]
    fn seed_skips_malformed_candles() {
        let mut p = MarketProfile::new(1.0, 100, false).unwrap();
        p.seed_from_history(
            &[
                candle(1, f64::NAN, 100.0, 2.0),
                candle(2, 100.0, 1e12, 2.0),
                candle(3, 100.0, 100.0, 2.0),
            ],
            0,
        );
        assert_eq!(p.level_count(), 1);
    }

    #[test]
    fn delta_mode_attributes_sides() {
        let mut p = MarketProfile::new(1.0, 10, true).unwrap();
        p.on_tick(100.0, 2.0, 1, Some(TradeDirection::Buy));
        p.on_tick(100.0, 3.0, 2, Some(TradeDirection::Sell));
        p.on_tick(100.0, 1.0, 3, None);

        let view = p.view(None);
        assert!((view[0].volume - 6.0).abs() < 1e-9);
        assert!((view[0].buy_volume - 2.0).abs() < 1e-9);
        assert!((view[0].sell_volume - 3.0).abs() < 1e-9);
    }

    #[test]
    fn traditional_mode_ignores_direction() {
        let mut p = MarketProfile::new(1.0, 10, false).unwrap();
        p.on_tick(100.0, 2.0, 1, Some(TradeDirection::Buy));
        let view = p.view(None);
        assert!((view[0].buy_volume).abs() < 1e-9);
    }

    #[test]
    fn view_top_k_keeps_highest_volume() {
        let mut p = MarketProfile::new(1.0, 10, false).unwrap();
        p.on_tick(100.0, 1.0, 1, None);
        p.on_tick(101.0, 9.0, 2, None);
        p.on_tick(102.0, 5.0, 3, None);

        let view = p.view(Some(2));
        let prices: Vec<f64> = view.iter().map(|b| b.price).collect();
        // Top two by volume (101, 102), then sorted descending by price.
        assert_eq!(prices, vec![102.0, 101.0]);
    }
}
