// =============================================================================
// Per-symbol processing pipeline
// =============================================================================
//
// Everything derived from one instrument's tick stream:
// - engine: the processor itself (EWMA volatility/bias, history, snapshots)
// - profile: bounded market-profile histogram
// - markers: price-marker detection with TTL decay
// - range: non-accumulating visual-range selection

pub mod engine;
pub mod markers;
pub mod profile;
pub mod range;

pub use engine::{ProcessorSettings, StateSnapshot, SymbolProcessor};
pub use markers::{MarkerKind, PriceMarker};
pub use profile::{MarketProfile, ProfileBucket};
pub use range::{VisualRange, VisualRangeManager};
