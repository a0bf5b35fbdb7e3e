//! Turns a model-suggested point into one that is safe to click.
//!
//! Suggestions are often expressed in screen space rather than viewport
//! space, or sit on the very edge of the element they mean. Validation is a
//! pure function of its inputs and runs before every pointer action.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::viewport::{SafeZone, ViewportInfo};

const BOX_INSET: f64 = 2.0;
const MIN_BOX_SIDE: f64 = 10.0;
const WIDE_ELEMENT: f64 = 200.0;
const SHORT_ELEMENT: f64 = 60.0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
}

impl BoundingBox {
    pub fn from_edges(left: f64, top: f64, right: f64, bottom: f64) -> Self {
        Self { left, top, right, bottom, width: right - left, height: bottom - top }
    }

    pub fn span_x(&self) -> f64 {
        self.right - self.left
    }

    pub fn span_y(&self) -> f64 {
        self.bottom - self.top
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.left + self.right) / 2.0, (self.top + self.bottom) / 2.0)
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.left && x <= self.right && y >= self.top && y <= self.bottom
    }

    /// Why this box cannot be trusted, if it cannot.
    pub fn defect(&self, info: &ViewportInfo) -> Option<&'static str> {
        let edges = [self.left, self.top, self.right, self.bottom];
        if edges.iter().any(|v| !v.is_finite()) {
            return Some("non-finite edge");
        }
        if self.left < 0.0 || self.top < 0.0 {
            return Some("negative origin");
        }
        if self.right > info.viewport.width as f64 || self.bottom > info.viewport.height as f64 {
            return Some("extends outside viewport");
        }
        if self.right <= self.left || self.bottom <= self.top {
            return Some("non-positive area");
        }
        if self.span_x() < MIN_BOX_SIDE || self.span_y() < MIN_BOX_SIDE {
            return Some("smaller than 10px");
        }
        None
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementShape {
    InputField,
    Button,
    Other,
}

impl ElementShape {
    pub fn classify(width: f64, height: f64) -> Self {
        if height < SHORT_ELEMENT && width > WIDE_ELEMENT {
            Self::InputField
        } else if height < SHORT_ELEMENT && width < WIDE_ELEMENT {
            Self::Button
        } else {
            Self::Other
        }
    }

    /// Fractional offsets from the top-left corner to aim at.
    fn aim(&self) -> (f64, f64) {
        match self {
            Self::InputField => (0.25, 0.5),
            Self::Button => (0.5, 0.5),
            Self::Other => (0.4, 0.4),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoordinateResolution {
    pub x: i64,
    pub y: i64,
    pub was_adjusted: bool,
    pub adjustment_reason: Option<String>,
    pub safe_zone: SafeZone,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CoordinateValidator;

impl CoordinateValidator {
    pub fn validate(
        &self,
        x: f64,
        y: f64,
        info: &ViewportInfo,
        bbox: Option<&BoundingBox>,
    ) -> CoordinateResolution {
        let zone = info.safe_zone;
        let mut reasons: Vec<String> = Vec::new();
        let (mut px, mut py) = (snap(x), snap(y));

        if px > info.viewport.width || py > info.viewport.height {
            px = snap(px as f64 - info.scroll_x);
            py = snap(py as f64 - info.scroll_y);
            let (cx, cy) = zone.clamp(px, py);
            px = cx;
            py = cy;
            reasons.push("screen-to-viewport correction".into());
        }

        let (cx, cy) = zone.clamp(px, py);
        if (cx, cy) != (px, py) {
            reasons.push(format!("clamped ({}, {}) into safe zone", px, py));
            px = cx;
            py = cy;
        }

        if let Some(b) = bbox {
            match b.defect(info) {
                Some(why) => debug!(reason = why, bbox = ?b, "ignoring bounding box"),
                None => {
                    if let Some((rx, ry, shape)) = retarget(px, py, b) {
                        // Inner rect may overlap the toolbar band; the zone wins.
                        let (sx, sy) = zone.clamp(rx, ry);
                        reasons.push(format!("retargeted inside {:?} box", shape));
                        px = sx;
                        py = sy;
                    }
                }
            }
        }

        let was_adjusted = !reasons.is_empty();
        let adjustment_reason = if was_adjusted { Some(reasons.join("; ")) } else { None };
        if was_adjusted {
            debug!(raw_x = x, raw_y = y, x = px, y = py, reason = ?adjustment_reason, "coordinates adjusted");
        }
        CoordinateResolution { x: px, y: py, was_adjusted, adjustment_reason, safe_zone: zone }
    }
}

fn snap(v: f64) -> i64 {
    (v + 0.5).floor() as i64
}

/// New aim point when (x, y) is not comfortably inside the box.
fn retarget(x: i64, y: i64, b: &BoundingBox) -> Option<(i64, i64, ElementShape)> {
    let inner = SafeZone::new(
        (b.left + BOX_INSET).ceil() as i64,
        (b.top + BOX_INSET).ceil() as i64,
        (b.right - BOX_INSET).floor() as i64,
        (b.bottom - BOX_INSET).floor() as i64,
    );
    if inner.contains(x, y) {
        return None;
    }
    let shape = ElementShape::classify(b.span_x(), b.span_y());
    let (fx, fy) = shape.aim();
    let tx = snap(b.left + b.span_x() * fx);
    let ty = snap(b.top + b.span_y() * fy);
    let (tx, ty) = inner.clamp(tx, ty);
    Some((tx, ty, shape))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Size;

    fn viewport(w: i64, h: i64) -> ViewportInfo {
        ViewportInfo::from_measurements(Size::new(w, h), Size::new(w, h), 0.0, 0.0)
    }

    #[test]
    fn in_zone_point_is_untouched() {
        let r = CoordinateValidator.validate(400.4, 300.5, &viewport(1280, 720), None);
        assert_eq!((r.x, r.y), (400, 301));
        assert!(!r.was_adjusted);
        assert!(r.adjustment_reason.is_none());
    }

    #[test]
    fn screen_space_point_is_corrected() {
        let r = CoordinateValidator.validate(2000.0, 900.0, &viewport(1280, 720), None);
        assert!(r.was_adjusted);
        assert!(r.safe_zone.contains(r.x, r.y));
        assert_eq!((r.x, r.y), (1265, 705));
        assert!(r.adjustment_reason.unwrap().contains("screen-to-viewport"));
    }

    #[test]
    fn scroll_offset_is_subtracted_for_screen_points() {
        let mut info = viewport(1280, 720);
        info.scroll_y = 400.0;
        let r = CoordinateValidator.validate(300.0, 900.0, &info, None);
        assert_eq!((r.x, r.y), (300, 500));
    }

    #[test]
    fn toolbar_band_is_avoided() {
        let r = CoordinateValidator.validate(5.0, 10.0, &viewport(1280, 720), None);
        assert_eq!((r.x, r.y), (15, 60));
        assert!(r.was_adjusted);
    }

    #[test]
    fn input_shaped_box_aims_left_of_center() {
        let b = BoundingBox::from_edges(100.0, 100.0, 420.0, 140.0);
        let r = CoordinateValidator.validate(90.0, 100.0, &viewport(1280, 720), Some(&b));
        assert_eq!((r.x, r.y), (180, 120));
        assert!(r.was_adjusted);
    }

    #[test]
    fn button_shaped_box_aims_center() {
        let b = BoundingBox::from_edges(500.0, 300.0, 600.0, 340.0);
        let r = CoordinateValidator.validate(500.0, 300.0, &viewport(1280, 720), Some(&b));
        assert_eq!((r.x, r.y), (550, 320));
    }

    #[test]
    fn large_box_aims_upper_left_region() {
        let b = BoundingBox::from_edges(200.0, 200.0, 700.0, 500.0);
        let r = CoordinateValidator.validate(100.0, 100.0, &viewport(1280, 720), Some(&b));
        assert_eq!((r.x, r.y), (400, 320));
    }

    #[test]
    fn point_inside_box_is_kept() {
        let b = BoundingBox::from_edges(100.0, 100.0, 420.0, 140.0);
        let r = CoordinateValidator.validate(300.0, 120.0, &viewport(1280, 720), Some(&b));
        assert_eq!((r.x, r.y), (300, 120));
        assert!(!r.was_adjusted);
    }

    #[test]
    fn invalid_boxes_never_change_the_result() {
        let info = viewport(1280, 720);
        let bad = [
            BoundingBox::from_edges(-5.0, 100.0, 200.0, 140.0),
            BoundingBox::from_edges(100.0, 100.0, 1400.0, 140.0),
            BoundingBox::from_edges(300.0, 100.0, 100.0, 140.0),
            BoundingBox::from_edges(100.0, 100.0, 105.0, 140.0),
            BoundingBox::from_edges(100.0, 100.0, 100.0, 100.0),
        ];
        let plain = CoordinateValidator.validate(640.0, 400.0, &info, None);
        for b in &bad {
            let r = CoordinateValidator.validate(640.0, 400.0, &info, Some(b));
            assert_eq!(r, plain, "box {:?} leaked into the result", b);
        }
    }

    #[test]
    fn every_output_lies_in_the_safe_zone() {
        let sizes = [(1280, 720), (375, 667), (20, 20), (0, 0), (1920, 1080)];
        let samples = [-1e9, -100.0, -0.4, 0.0, 14.6, 59.5, 300.0, 719.9, 1265.5, 5000.0, 1e12, f64::NAN];
        let b = BoundingBox::from_edges(0.0, 0.0, 250.0, 40.0);
        for (w, h) in sizes {
            let info = viewport(w, h);
            for &x in &samples {
                for &y in &samples {
                    for bbox in [None, Some(&b)] {
                        let r = CoordinateValidator.validate(x, y, &info, bbox);
                        assert!(
                            info.safe_zone.contains(r.x, r.y),
                            "({}, {}) -> ({}, {}) escaped {:?}",
                            x, y, r.x, r.y, info.safe_zone
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn shape_classification_boundaries() {
        assert_eq!(ElementShape::classify(320.0, 40.0), ElementShape::InputField);
        assert_eq!(ElementShape::classify(120.0, 40.0), ElementShape::Button);
        assert_eq!(ElementShape::classify(200.0, 40.0), ElementShape::Other);
        assert_eq!(ElementShape::classify(320.0, 60.0), ElementShape::Other);
    }
}
