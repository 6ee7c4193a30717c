// =============================================================================
// Typed feed errors
// =============================================================================
//
// A closed set of error kinds that crosses task boundaries: the feed manager
// produces them, display owners attach them to outgoing snapshots, and the
// dashboard renders them as a diagnostic banner. Connection-level recovery
// (reconnect, backoff) happens inside the feed manager; these values are what
// the rest of the engine sees.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error surfaced to displays through the snapshot channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedError {
    /// Upstream read/write failure. Recovered locally by reconnecting.
    #[error("transient I/O failure: {detail}")]
    TransientIo { detail: String },

    /// Fatal at the connection level. Reconnect attempts stop.
    #[error("authentication failed: {detail}")]
    AuthFailed { detail: String },

    /// Upstream rejected a specific symbol. Other subscriptions are untouched.
    #[error("unknown symbol: {symbol}")]
    SymbolUnknown { symbol: String },

    /// The initial SNAPSHOT did not arrive in time. The subscription remains
    /// pending; the snapshot may still arrive later.
    #[error("initial snapshot timed out after {waited_ms} ms")]
    InitialSnapshotTimeout { waited_ms: u64 },

    /// Reconnect attempts exceeded the alert threshold. Retrying continues.
    #[error("connection lost after {attempts} reconnect attempts")]
    ConnectionLost { attempts: u32 },

    /// A tick with non-positive or non-finite quotes. Logged and dropped.
    #[error("invalid tick: {detail}")]
    InvalidTick { detail: String },

    /// A broken internal invariant. The affected processor is shut down.
    #[error("internal invariant violated: {detail}")]
    Internal { detail: String },
}

impl FeedError {
    /// Fatal errors trigger orderly teardown instead of recovery.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthFailed { .. } | Self::Internal { .. })
    }

    /// Map an upstream ERROR frame code onto a typed error.
    pub fn from_wire(code: &str, message: &str, symbol: Option<&str>) -> Self {
        match code {
            "auth_failed" => Self::AuthFailed {
                detail: message.to_string(),
            },
            "symbol_unknown" => Self::SymbolUnknown {
                symbol: symbol.unwrap_or("?").to_string(),
            },
            _ => Self::TransientIo {
                detail: format!("{code}: {message}"),
            },
        }
    }
}
