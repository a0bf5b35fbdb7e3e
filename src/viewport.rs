use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::driver::{Driver, Size};

pub const EDGE_MARGIN: i64 = 15;
/// Top floor of the safe zone; leaves room for a toolbar even when the
/// reported chrome height is zero.
pub const MIN_TOP: i64 = 60;
const FALLBACK_CHROME_HEIGHT: i64 = 50;
const FALLBACK_MARGIN: i64 = 10;
const FALLBACK_WINDOW: Size = Size { width: 1280, height: 800 };

pub const VIEWPORT_METRICS_SCRIPT: &str = r#"
return {
  width: window.innerWidth || document.documentElement.clientWidth,
  height: window.innerHeight || document.documentElement.clientHeight,
  scrollX: window.scrollX || window.pageXOffset || 0,
  scrollY: window.scrollY || window.pageYOffset || 0,
  scrollWidth: document.documentElement.scrollWidth,
  scrollHeight: document.documentElement.scrollHeight
};
"#;

/// Inclusive pixel rectangle in which pointer actions are permitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeZone {
    pub min_x: i64,
    pub min_y: i64,
    pub max_x: i64,
    pub max_y: i64,
}

impl SafeZone {
    /// Collapses inverted bounds so the zone always contains at least one point.
    pub fn new(min_x: i64, min_y: i64, max_x: i64, max_y: i64) -> Self {
        Self {
            min_x,
            min_y,
            max_x: max_x.max(min_x),
            max_y: max_y.max(min_y),
        }
    }

    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    pub fn clamp(&self, x: i64, y: i64) -> (i64, i64) {
        (x.clamp(self.min_x, self.max_x), y.clamp(self.min_y, self.max_y))
    }

    pub fn center(&self) -> (i64, i64) {
        ((self.min_x + self.max_x) / 2, (self.min_y + self.max_y) / 2)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewportInfo {
    pub window: Size,
    pub viewport: Size,
    pub scroll_x: f64,
    pub scroll_y: f64,
    pub scroll_width: i64,
    pub scroll_height: i64,
    pub chrome: Size,
    pub safe_zone: SafeZone,
    /// False when the in-page query failed and defaults were assumed.
    pub measured: bool,
}

impl ViewportInfo {
    pub fn from_measurements(window: Size, viewport: Size, scroll_x: f64, scroll_y: f64) -> Self {
        let chrome = Size::new(
            (window.width - viewport.width).max(0),
            (window.height - viewport.height).max(0),
        );
        let safe_zone = SafeZone::new(
            EDGE_MARGIN,
            MIN_TOP.max(chrome.height + EDGE_MARGIN),
            viewport.width - EDGE_MARGIN,
            viewport.height - EDGE_MARGIN,
        );
        Self {
            window,
            viewport,
            scroll_x,
            scroll_y,
            scroll_width: viewport.width,
            scroll_height: viewport.height,
            chrome,
            safe_zone,
            measured: true,
        }
    }

    /// Degraded geometry used when the page cannot be queried.
    pub fn fallback(window: Size) -> Self {
        let viewport = Size::new(window.width, (window.height - FALLBACK_CHROME_HEIGHT).max(0));
        let safe_zone = SafeZone::new(
            FALLBACK_MARGIN,
            FALLBACK_CHROME_HEIGHT + FALLBACK_MARGIN,
            viewport.width - FALLBACK_MARGIN,
            viewport.height - FALLBACK_MARGIN,
        );
        Self {
            window,
            viewport,
            scroll_x: 0.0,
            scroll_y: 0.0,
            scroll_width: viewport.width,
            scroll_height: viewport.height,
            chrome: Size::new(0, FALLBACK_CHROME_HEIGHT),
            safe_zone,
            measured: false,
        }
    }

    pub fn center(&self) -> (i64, i64) {
        (self.viewport.width / 2, self.viewport.height / 2)
    }
}

/// Computes live viewport geometry. Results are never cached: call
/// [`ViewportResolver::resolve`] again after anything that may navigate.
#[derive(Clone, Copy, Debug, Default)]
pub struct ViewportResolver;

impl ViewportResolver {
    pub async fn resolve(&self, driver: &dyn Driver) -> ViewportInfo {
        let window = match driver.window_size().await {
            Ok(size) => size,
            Err(e) => {
                warn!(error = %e, "window size unavailable, assuming {}x{}", FALLBACK_WINDOW.width, FALLBACK_WINDOW.height);
                return ViewportInfo::fallback(FALLBACK_WINDOW);
            }
        };
        let metrics = match driver.evaluate(VIEWPORT_METRICS_SCRIPT, vec![]).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "viewport query failed, using window size");
                return ViewportInfo::fallback(window);
            }
        };
        match parse_metrics(&metrics, window) {
            Some(info) => {
                debug!(
                    viewport_w = info.viewport.width,
                    viewport_h = info.viewport.height,
                    chrome_h = info.chrome.height,
                    safe = ?info.safe_zone,
                    "viewport resolved"
                );
                info
            }
            None => {
                warn!(metrics = %metrics, "viewport metrics malformed, using window size");
                ViewportInfo::fallback(window)
            }
        }
    }
}

fn parse_metrics(v: &Value, window: Size) -> Option<ViewportInfo> {
    let num = |k: &str| v.get(k).and_then(|x| x.as_f64());
    let width = num("width")?;
    let height = num("height")?;
    if width <= 0.0 || height <= 0.0 {
        return None;
    }
    let viewport = Size::new(width.round() as i64, height.round() as i64);
    let mut info = ViewportInfo::from_measurements(
        window,
        viewport,
        num("scrollX").unwrap_or(0.0),
        num("scrollY").unwrap_or(0.0),
    );
    info.scroll_width = num("scrollWidth").map(|w| w.round() as i64).unwrap_or(viewport.width);
    info.scroll_height = num("scrollHeight").map(|h| h.round() as i64).unwrap_or(viewport.height);
    Some(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedDriver;
    use serde_json::json;

    #[test]
    fn zero_chrome_uses_toolbar_floor() {
        let info = ViewportInfo::from_measurements(Size::new(1280, 720), Size::new(1280, 720), 0.0, 0.0);
        assert_eq!(info.safe_zone, SafeZone { min_x: 15, min_y: 60, max_x: 1265, max_y: 705 });
    }

    #[test]
    fn tall_chrome_pushes_top_down() {
        let info = ViewportInfo::from_measurements(Size::new(1280, 900), Size::new(1280, 800), 0.0, 0.0);
        assert_eq!(info.chrome, Size::new(0, 100));
        assert_eq!(info.safe_zone.min_y, 115);
    }

    #[test]
    fn tiny_viewport_still_has_a_point() {
        let info = ViewportInfo::from_measurements(Size::new(10, 10), Size::new(10, 10), 0.0, 0.0);
        let z = info.safe_zone;
        assert!(z.contains(z.min_x, z.min_y));
        assert!(z.max_x >= z.min_x && z.max_y >= z.min_y);
    }

    #[tokio::test]
    async fn resolves_from_page_metrics() {
        let driver = ScriptedDriver::new(Size::new(1280, 800)).with_viewport(json!({
            "width": 1280, "height": 720, "scrollX": 0, "scrollY": 240,
            "scrollWidth": 1280, "scrollHeight": 3000
        }));
        let info = ViewportResolver.resolve(&driver).await;
        assert!(info.measured);
        assert_eq!(info.chrome.height, 80);
        assert_eq!(info.safe_zone.min_y, 95);
        assert_eq!(info.scroll_y, 240.0);
        assert_eq!(info.scroll_height, 3000);
    }

    #[tokio::test]
    async fn failed_query_falls_back() {
        let driver = ScriptedDriver::new(Size::new(1000, 700)).with_viewport(json!(null));
        let info = ViewportResolver.resolve(&driver).await;
        assert!(!info.measured);
        assert_eq!(info.viewport, Size::new(1000, 650));
        assert_eq!(info.safe_zone, SafeZone { min_x: 10, min_y: 60, max_x: 990, max_y: 640 });
    }
}
