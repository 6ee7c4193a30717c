// =============================================================================
// Rendering-context derivation
// =============================================================================
//
// The single geometry authority: a pure function from container dimensions and
// display configuration to the content area, ADR-axis position, and y-scale
// domain the renderer consumes. Content width equals container width — there
// is no horizontal padding anywhere in the coordinate pipeline, so no caller
// ever threads a padding value through it.

use serde::{Deserialize, Serialize};

use crate::processor::VisualRange;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContainerSize {
    pub w: f64,
    pub h: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisBounds {
    pub min: f64,
    pub max: f64,
}

impl Default for AxisBounds {
    fn default() -> Self {
        Self {
            min: 0.05,
            max: 0.95,
        }
    }
}

/// Geometry inputs owned by the display config.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayoutOptions {
    pub header_height: f64,
    pub adr_axis_position: f64,
    pub adr_axis_bounds: AxisBounds,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ContentArea {
    pub w: f64,
    pub h: f64,
}

/// Linear mapping from prices to vertical pixels: `price_low` lands at
/// `px_low` (the bottom of the content area), `price_high` at `px_high` (0).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct YScaleDomain {
    pub price_low: f64,
    pub price_high: f64,
    pub px_low: f64,
    pub px_high: f64,
}

impl YScaleDomain {
    /// Pixel y for a price. Degenerate domains collapse to the bottom edge.
    pub fn y_for(&self, price: f64) -> f64 {
        let span = self.price_high - self.price_low;
        if span <= 0.0 {
            return self.px_low;
        }
        let t = (price - self.price_low) / span;
        self.px_low + t * (self.px_high - self.px_low)
    }
}

/// The derived geometry for one display.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RenderContext {
    pub container: ContainerSize,
    pub content: ContentArea,
    pub adr_axis_x: f64,
    pub y_domain: YScaleDomain,
}

/// Derive the rendering context. Pure and total: identical inputs always
/// produce identical outputs, and every dimension stays non-negative.
pub fn derive(
    container: ContainerSize,
    options: &LayoutOptions,
    visual_range: &VisualRange,
) -> RenderContext {
    let content = ContentArea {
        w: container.w.max(0.0),
        h: (container.h - options.header_height).max(0.0),
    };

    let position = options
        .adr_axis_position
        .clamp(options.adr_axis_bounds.min, options.adr_axis_bounds.max);
    let adr_axis_x = content.w * position;

    RenderContext {
        container,
        content,
        adr_axis_x,
        y_domain: YScaleDomain {
            price_low: visual_range.low,
            price_high: visual_range.high,
            px_low: content.h,
            px_high: 0.0,
        },
    }
}
