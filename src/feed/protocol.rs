// =============================================================================
// Upstream wire protocol
// =============================================================================
//
// JSON frames over a persistent WebSocket, tagged by `type`. The client sends
// AUTH, SUBSCRIBE, UNSUBSCRIBE, and HEARTBEAT; the server sends SNAPSHOT,
// TICK, HEARTBEAT, and ERROR. Frames above 64 KiB are rejected in both
// directions (the server batches candles to stay under the cap).
//
// AUTH carries an HMAC-SHA256 signature over `token|timestamp_ms` so the raw
// secret never crosses the wire.

use anyhow::{bail, Context, Result};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::instrument::InstrumentDescriptor;
use crate::types::{Candle, Tick};

type HmacSha256 = Hmac<Sha256>;

/// Hard cap on a single frame, bytes.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Initial state for one instrument, sent by the server on subscribe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFrame {
    pub symbol: String,
    pub digits: u32,
    pub todays_open: f64,
    pub projected_adr_high: f64,
    pub projected_adr_low: f64,
    pub todays_high: f64,
    pub todays_low: f64,
    #[serde(default)]
    pub m1_candles: Vec<Candle>,
}

impl SnapshotFrame {
    pub fn to_descriptor(&self) -> InstrumentDescriptor {
        InstrumentDescriptor::new(
            self.symbol.clone(),
            self.digits,
            self.todays_open,
            self.projected_adr_high,
            self.projected_adr_low,
            self.todays_high,
            self.todays_low,
        )
    }
}

/// One quote update for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickFrame {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    #[serde(default)]
    pub bid_size: f64,
    #[serde(default)]
    pub ask_size: f64,
    pub timestamp_ms: i64,
    pub day_id: u32,
}

impl TickFrame {
    pub fn tick(&self) -> Tick {
        Tick {
            bid: self.bid,
            ask: self.ask,
            bid_size: self.bid_size,
            ask_size: self.ask_size,
            timestamp_ms: self.timestamp_ms,
            day_id: self.day_id,
        }
    }
}

/// Every frame that crosses the upstream connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frame {
    Auth {
        token: String,
        timestamp_ms: i64,
        signature: String,
    },
    Subscribe {
        symbol: String,
    },
    Unsubscribe {
        symbol: String,
    },
    Snapshot(SnapshotFrame),
    Tick(TickFrame),
    Heartbeat {
        timestamp_ms: i64,
    },
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        symbol: Option<String>,
    },
}

/// Serialize a frame, enforcing the size cap.
pub fn encode(frame: &Frame) -> Result<String> {
    let text = serde_json::to_string(frame).context("failed to serialise frame")?;
    if text.len() > MAX_FRAME_BYTES {
        bail!(
            "outbound frame of {} bytes exceeds the {} byte cap",
            text.len(),
            MAX_FRAME_BYTES
        );
    }
    Ok(text)
}

/// Parse an inbound frame, enforcing the size cap.
pub fn decode(text: &str) -> Result<Frame> {
    if text.len() > MAX_FRAME_BYTES {
        bail!(
            "inbound frame of {} bytes exceeds the {} byte cap",
            text.len(),
            MAX_FRAME_BYTES
        );
    }
    serde_json::from_str(text).context("failed to parse frame")
}

/// HMAC-SHA256 hex signature over `token|timestamp_ms`.
pub fn auth_signature(token: &str, timestamp_ms: i64, secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(format!("{token}|{timestamp_ms}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Build a signed AUTH frame.
pub fn auth_frame(token: &str, secret: &str, timestamp_ms: i64) -> Frame {
    Frame::Auth {
        token: token.to_string(),
        timestamp_ms,
        signature: auth_signature(token, timestamp_ms, secret),
    }
}
