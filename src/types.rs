// =============================================================================
// Shared types used across the pulsedesk engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// A single bid/ask update from the upstream feed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub bid: f64,
    pub ask: f64,
    #[serde(default)]
    pub bid_size: f64,
    #[serde(default)]
    pub ask_size: f64,
    pub timestamp_ms: i64,
    pub day_id: u32,
}

impl Tick {
    /// Midpoint of the quote.
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    /// Quoted spread (ask - bid).
    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }

    /// A tick is usable when both sides are positive and finite. Anything else
    /// is dropped upstream of all state updates.
    pub fn is_valid(&self) -> bool {
        self.bid.is_finite() && self.ask.is_finite() && self.bid > 0.0 && self.ask > 0.0
    }
}

/// A single M1 OHLCV candle delivered inside the initial SNAPSHOT frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time in epoch milliseconds.
    pub t: i64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

/// Upstream connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Authenticating => write!(f, "authenticating"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Market-profile rendering mode requested by a display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileMode {
    /// Total volume per bucket.
    Traditional,
    /// Separate buy/sell volume per bucket.
    Delta,
}

impl Default for ProfileMode {
    fn default() -> Self {
        Self::Traditional
    }
}

/// Renderer colouring hint carried through the config. Has no effect on
/// processor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorMode {
    Intensity,
    Directional,
    Static,
}

impl Default for ColorMode {
    fn default() -> Self {
        Self::Intensity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(bid: f64, ask: f64) -> Tick {
        Tick {
            bid,
            ask,
            bid_size: 1.0,
            ask_size: 1.0,
            timestamp_ms: 0,
            day_id: 1,
        }
    }

    #[test]
    fn mid_is_average_of_bid_ask() {
        let t = tick(1.0840, 1.0842);
        assert!((t.mid() - 1.0841).abs() < 1e-12);
    }

    #[test]
    fn valid_tick() {
        assert!(tick(1.0840, 1.0842).is_valid());
    }

    #[test]
    fn non_positive_quotes_are_invalid() {
        assert!(!tick(0.0, 1.0842).is_valid());
        assert!(!tick(1.0840, -1.0).is_valid());
    }

    #[test]
    fn non_finite_quotes_are_invalid() {
        assert!(!tick(f64::NAN, 1.0842).is_valid());
        assert!(!tick(1.0840, f64::INFINITY).is_valid());
    }

    #[test]
    fn connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
    }
}
