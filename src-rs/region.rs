use anyhow::{bail, Context};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::geometry::{Point, Shape, ShapeKind};

/// Rectangular selection in image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Region {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// A zero-sized region disables spatial filtering.
    pub fn is_degenerate(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn contains(&self, p: Point) -> bool {
        let (x, y) = (f64::from(self.x), f64::from(self.y));
        p.0 >= x
            && p.0 < x + f64::from(self.width)
            && p.1 >= y
            && p.1 < y + f64::from(self.height)
    }

    /// `{x}_{y}_{w}_{h}`, the suffix of staged patch names.
    pub fn patch_suffix(&self) -> String {
        format!("{}_{}_{}_{}", self.x, self.y, self.width, self.height)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.x, self.y, self.width, self.height)
    }
}

impl FromStr for Region {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
        if parts.len() != 4 {
            bail!("region must be x,y,w,h (got {raw:?})");
        }
        let mut values = [0i32; 4];
        for (slot, part) in values.iter_mut().zip(&parts) {
            let v = part
                .parse::<f64>()
                .with_context(|| format!("invalid region component: {part:?}"))?;
            if !v.is_finite() || v < f64::from(i32::MIN) || v > f64::from(i32::MAX) {
                bail!("region component out of range: {part:?}");
            }
            *slot = v as i32;
        }
        let [x, y, w, h] = values;
        if w < 0 || h < 0 {
            bail!("region width and height must not be negative");
        }
        Ok(Region::new(x, y, w, h))
    }
}

/// Region for a rectangle selection. Anything else (no selection, another
/// shape kind, zero area) means there is nothing to segment.
pub fn resolve_region(selection: Option<&Shape>) -> Option<Region> {
    let shape = selection?;
    if shape.kind != ShapeKind::Rectangle || shape.is_empty() {
        return None;
    }
    let (x, y, w, h) = shape.bounds()?;
    Some(Region::new(x as i32, y as i32, w as i32, h as i32))
}
