//! Region of interest geometry.
//!
//! A `Region` is a rectangle expressed as fractions of the frame width and
//! height, so the same configuration works at any resolution. Detection boxes
//! arrive normalized from the inference engine and are converted to pixels
//! before the overlap test.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_REGION_NAME: &str = "default";

/// Fractional rectangle used as the counting boundary.
///
/// Fields are private so the `x1 < x2`, `y1 < y2` invariant cannot be broken
/// after construction.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Region {
    x1: f64,
    y1: f64,
    x2: f64,
    y2: f64,
    name: String,
}

impl Region {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        for (label, value) in [("x1", x1), ("y1", y1), ("x2", x2), ("y2", y2)] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(anyhow!(
                    "region '{}': {} must be within [0, 1], got {}",
                    name,
                    label,
                    value
                ));
            }
        }
        if x1 >= x2 || y1 >= y2 {
            return Err(anyhow!(
                "region '{}' is degenerate or inverted: ({}, {}) -> ({}, {})",
                name,
                x1,
                y1,
                x2,
                y2
            ));
        }
        Ok(Self {
            x1,
            y1,
            x2,
            y2,
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn x1(&self) -> f64 {
        self.x1
    }

    pub fn y1(&self) -> f64 {
        self.y1
    }

    pub fn x2(&self) -> f64 {
        self.x2
    }

    pub fn y2(&self) -> f64 {
        self.y2
    }

    /// Region corners in absolute pixels for the given frame size.
    pub fn to_pixels(&self, frame_width: f64, frame_height: f64) -> PixelRect {
        PixelRect {
            xmin: self.x1 * frame_width,
            ymin: self.y1 * frame_height,
            xmax: self.x2 * frame_width,
            ymax: self.y2 * frame_height,
        }
    }

    /// Inclusive overlap test between this region and a pixel-space box.
    ///
    /// Any shared area, containment, or edge contact counts as inside. Only
    /// boxes strictly disjoint on some axis are rejected.
    pub fn overlaps(&self, bbox: &PixelRect, frame_width: f64, frame_height: f64) -> bool {
        if !(frame_width > 0.0 && frame_height > 0.0) {
            return false;
        }
        let roi = self.to_pixels(frame_width, frame_height);
        !(bbox.xmax < roi.xmin
            || bbox.xmin > roi.xmax
            || bbox.ymax < roi.ymin
            || bbox.ymin > roi.ymax)
    }
}

/// Wire shape of a region in configuration files and status output.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RegionSpec {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
    #[serde(default = "default_region_name")]
    pub name: String,
}

fn default_region_name() -> String {
    DEFAULT_REGION_NAME.to_string()
}

impl TryFrom<RegionSpec> for Region {
    type Error = anyhow::Error;

    fn try_from(spec: RegionSpec) -> Result<Self> {
        Region::new(spec.x1, spec.y1, spec.x2, spec.y2, spec.name)
    }
}

impl From<&Region> for RegionSpec {
    fn from(region: &Region) -> Self {
        Self {
            x1: region.x1,
            y1: region.y1,
            x2: region.x2,
            y2: region.y2,
            name: region.name.clone(),
        }
    }
}

/// Bounding box normalized to [0, 1] per axis, as produced by the engine.
///
/// Ordering is not enforced; a malformed box simply fails to overlap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct BoundingBox {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl BoundingBox {
    pub fn new(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.xmin.is_finite()
            && self.ymin.is_finite()
            && self.xmax.is_finite()
            && self.ymax.is_finite()
    }

    pub fn to_pixels(&self, frame_width: f64, frame_height: f64) -> PixelRect {
        PixelRect {
            xmin: self.xmin * frame_width,
            ymin: self.ymin * frame_height,
            xmax: self.xmax * frame_width,
            ymax: self.ymax * frame_height,
        }
    }
}

/// Axis-aligned rectangle in absolute pixel coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PixelRect {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}
