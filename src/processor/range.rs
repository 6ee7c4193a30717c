// =============================================================================
// Visual-range manager
// =============================================================================
//
// Chooses the vertical price window a display shows: one of a fixed set of
// ADR-multiplier steps, centred on the current mid. The step is re-derived
// from current conditions on every tick and ASSIGNED outright — taking
// `max(current, target)` instead makes the window monotonically widen and the
// price float drift toward the centre of an ever-growing window. The window
// reflects current conditions, not the historical maximum.

use serde::{Deserialize, Serialize};

/// Fraction of the projected ADR displayed on each side of centre.
pub const ADR_STEPS: [f64; 6] = [0.30, 0.50, 0.75, 1.00, 1.50, 2.00];

/// Containment slack applied to the observed session range.
const RANGE_MARGIN: f64 = 0.05;

/// The vertical price window for one display.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VisualRange {
    pub low: f64,
    pub high: f64,
    /// The ADR-multiplier step the window was built from.
    pub step: f64,
}

#[derive(Debug, Clone)]
pub struct VisualRangeManager {
    step: f64,
}

impl VisualRangeManager {
    pub fn new() -> Self {
        Self { step: ADR_STEPS[0] }
    }

    /// The currently selected ADR-multiplier step.
    pub fn current_step(&self) -> f64 {
        self.step
    }

    /// Re-derive the window for the latest tick. `observed_low..observed_high`
    /// is the session price range seen so far; the selected step is the
    /// smallest whose window, centred on `mid`, contains it with margin.
    pub fn update(
        &mut self,
        mid: f64,
        adr_extent: f64,
        observed_low: f64,
        observed_high: f64,
    ) -> VisualRange {
        let target = target_step(mid, adr_extent, observed_low, observed_high);
        // Direct assignment. Not max(self.step, target).
        self.step = target;
        VisualRange {
            low: mid - target * adr_extent,
            high: mid + target * adr_extent,
            step: target,
        }
    }
}

impl Default for VisualRangeManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Smallest step whose half-window covers the farther observed extreme from
/// `mid`, with margin. Falls back to the largest step when nothing fits.
fn target_step(mid: f64, adr_extent: f64, observed_low: f64, observed_high: f64) -> f64 {
    let reach = (mid - observed_low)
        .max(observed_high - mid)
        .max(0.0)
        * (1.0 + RANGE_MARGIN);

    for step in ADR_STEPS {
        if step * adr_extent >= reach {
            return step;
        }
    }
    ADR_STEPS[ADR_STEPS.len() - 1]
}
