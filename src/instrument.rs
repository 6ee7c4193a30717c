// =============================================================================
// Instrument descriptor
// =============================================================================
//
// Immutable per-session facts about one instrument, created from the feed's
// initial SNAPSHOT frame. The only mutable fields are today's observed
// high/low, which widen monotonically within a day and collapse to the first
// mid of a new day on rollover. Each processor owns its copy; the canonical
// wire snapshot is retained (refcounted per symbol) by the feed manager.

use serde::{Deserialize, Serialize};

use crate::price_format::{self, AssetClass};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentDescriptor {
    pub symbol: String,
    pub digits: u32,
    pub asset_class: AssetClass,
    pub pip_size: f64,
    pub todays_open: f64,
    pub projected_adr_high: f64,
    pub projected_adr_low: f64,
    pub todays_high: f64,
    pub todays_low: f64,
}

impl InstrumentDescriptor {
    pub fn new(
        symbol: impl Into<String>,
        digits: u32,
        todays_open: f64,
        projected_adr_high: f64,
        projected_adr_low: f64,
        todays_high: f64,
        todays_low: f64,
    ) -> Self {
        let asset_class = price_format::classify(todays_open, digits);
        let pip_size = price_format::pip_size(asset_class, digits);
        Self {
            symbol: symbol.into(),
            digits,
            asset_class,
            pip_size,
            todays_open,
            projected_adr_high,
            projected_adr_low,
            todays_high,
            todays_low,
        }
    }

    /// Width of the projected average daily range. Guarded to stay positive so
    /// window arithmetic downstream never divides by or multiplies into zero.
    pub fn adr_extent(&self) -> f64 {
        let extent = self.projected_adr_high - self.projected_adr_low;
        if extent.is_finite() && extent > 0.0 {
            extent.max(self.pip_size)
        } else {
            self.pip_size
        }
    }

    /// Fold an observed mid into today's range. Returns `(new_high, new_low)`
    /// flags for marker detection.
    pub fn observe_mid(&mut self, mid: f64) -> (bool, bool) {
        let new_high = mid > self.todays_high;
        let new_low = mid < self.todays_low;
        if new_high {
            self.todays_high = mid;
        }
        if new_low {
            self.todays_low = mid;
        }
        (new_high, new_low)
    }

    /// Reset intraday extremes at a day boundary: both collapse to the first
    /// mid of the new session.
    pub fn roll_day(&mut self, mid: f64) {
        self.todays_high = mid;
        self.todays_low = mid;
    }
}
