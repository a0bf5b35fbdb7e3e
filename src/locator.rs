//! Re-anchors an approximate point onto the concrete input element the
//! model most likely meant.
//!
//! Every strategy is read-only: in-page scripts only describe
//! elements, they never focus, tag or otherwise mutate them. Strategies run
//! in order and the first hit wins.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::coords::BoundingBox;
use crate::driver::{Driver, Point};
use crate::error::Result;

/// Candidates farther than this from the point are never matched.
pub const NEARBY_RADIUS: f64 = 100.0;

macro_rules! point_script {
    ($body:literal) => {
        concat!(
            r#"
const x = arguments[0], y = arguments[1];
const skipTypes = ['hidden', 'checkbox', 'radio', 'submit', 'button', 'image', 'file', 'reset'];
const isTextInput = (el) => !!el && (el.tagName === 'TEXTAREA' ||
  (el.tagName === 'INPUT' && !skipTypes.includes((el.getAttribute('type') || 'text').toLowerCase())));
const isVisible = (el) => {
  const r = el.getBoundingClientRect();
  const s = window.getComputedStyle(el);
  return r.width > 0 && r.height > 0 && s.visibility !== 'hidden' && s.display !== 'none';
};
const cssPath = (el) => {
  if (el.id && document.querySelectorAll('#' + CSS.escape(el.id)).length === 1) {
    return '#' + CSS.escape(el.id);
  }
  const parts = [];
  let node = el;
  while (node && node.nodeType === 1 && node !== document.documentElement) {
    let part = node.tagName.toLowerCase();
    const parent = node.parentElement;
    if (parent) {
      const same = Array.from(parent.children).filter((c) => c.tagName === node.tagName);
      if (same.length > 1) part += ':nth-of-type(' + (same.indexOf(node) + 1) + ')';
    }
    parts.unshift(part);
    node = parent;
  }
  return 'html > ' + parts.join(' > ');
};
const describe = (el) => {
  const r = el.getBoundingClientRect();
  return {
    selector: cssPath(el),
    tag: el.tagName.toLowerCase(),
    inputType: el.getAttribute('type'),
    name: el.getAttribute('name'),
    id: el.id || null,
    placeholder: el.getAttribute('placeholder'),
    autocomplete: el.getAttribute('autocomplete'),
    rect: { left: r.left, top: r.top, right: r.right, bottom: r.bottom, width: r.width, height: r.height },
    visible: isVisible(el)
  };
};
"#,
            $body
        )
    };
}

pub const DIRECT_SCRIPT: &str = point_script!(
    r#"
const el = document.elementFromPoint(x, y);
return isTextInput(el) && isVisible(el) ? describe(el) : null;
"#
);

pub const LAYERED_SCRIPT: &str = point_script!(
    r#"
for (const el of document.elementsFromPoint(x, y)) {
  if (isTextInput(el) && isVisible(el)) return describe(el);
}
return null;
"#
);

pub const CHILD_SCRIPT: &str = point_script!(
    r#"
const sel = 'input[type="email"], input[type="text"], input[placeholder*="email" i], input[name*="email" i], input[id*="email" i]';
for (const el of document.elementsFromPoint(x, y)) {
  if (el === document.body || el === document.documentElement) continue;
  for (const child of el.querySelectorAll(sel)) {
    if (isTextInput(child) && isVisible(child)) return describe(child);
  }
}
return null;
"#
);

pub const NEARBY_SCRIPT: &str = point_script!(
    r#"
return Array.from(document.querySelectorAll('input, textarea'))
  .filter((el) => isTextInput(el) && isVisible(el))
  .map(describe);
"#
);

pub const PATTERN_SCRIPT: &str = point_script!(
    r#"
const patterns = [
  'input[autocomplete*="email"]', 'input[name="email"]', 'input[name="username"]',
  'input[id*="email"]', 'input[class*="email"]', 'input[data-testid*="email"]'
];
const out = [];
for (const p of patterns) {
  for (const el of document.querySelectorAll(p)) {
    if (isTextInput(el) && isVisible(el)) out.push(describe(el));
  }
}
return out;
"#
);

pub const DIAGNOSE_SCRIPT: &str = r#"
const el = document.elementFromPoint(arguments[0], arguments[1]);
if (!el) return 'nothing at point';
let d = el.tagName.toLowerCase();
if (el.id) d += '#' + el.id;
if (typeof el.className === 'string' && el.className.trim()) d += '.' + el.className.trim().split(/\s+/).join('.');
return d;
"#;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementDescriptor {
    pub selector: String,
    pub tag: String,
    #[serde(default)]
    pub input_type: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub autocomplete: Option<String>,
    pub rect: BoundingBox,
    #[serde(default)]
    pub visible: bool,
}

impl ElementDescriptor {
    pub fn center(&self) -> Point {
        let (x, y) = self.rect.center();
        Point::new(x, y)
    }

    pub fn distance_to(&self, p: Point) -> f64 {
        let c = self.center();
        ((c.x - p.x).powi(2) + (c.y - p.y).powi(2)).sqrt()
    }

    pub fn looks_like_email(&self) -> bool {
        if self.input_type.as_deref().is_some_and(|t| t.eq_ignore_ascii_case("email")) {
            return true;
        }
        [&self.name, &self.id, &self.placeholder, &self.autocomplete]
            .into_iter()
            .flatten()
            .any(|v| v.to_lowercase().contains("email"))
    }
}

/// A candidate whose box holds the point wins outright; otherwise the
/// closest one within `radius` of the point.
pub fn pick_nearest(point: Point, candidates: &[ElementDescriptor], radius: f64) -> Option<&ElementDescriptor> {
    if let Some(hit) = candidates.iter().find(|c| c.rect.contains(point.x, point.y)) {
        return Some(hit);
    }
    candidates
        .iter()
        .map(|c| (c, c.distance_to(point)))
        .filter(|(_, d)| *d <= radius)
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(c, _)| c)
}

#[async_trait]
pub trait LocateStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn locate(&self, point: Point, page: &dyn Driver) -> Result<Option<ElementDescriptor>>;
}

async fn query_one(page: &dyn Driver, script: &str, point: Point) -> Result<Option<ElementDescriptor>> {
    let v = page.evaluate(script, vec![json!(point.x), json!(point.y)]).await?;
    if v.is_null() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(v)?))
}

async fn query_many(page: &dyn Driver, script: &str, point: Point) -> Result<Vec<ElementDescriptor>> {
    let v = page.evaluate(script, vec![json!(point.x), json!(point.y)]).await?;
    match v {
        Value::Null => Ok(Vec::new()),
        other => Ok(serde_json::from_value(other)?),
    }
}

/// The topmost element at the point is itself a visible input.
pub struct DirectHit;

#[async_trait]
impl LocateStrategy for DirectHit {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn locate(&self, point: Point, page: &dyn Driver) -> Result<Option<ElementDescriptor>> {
        query_one(page, DIRECT_SCRIPT, point).await
    }
}

/// First visible input anywhere in the z-ordered stack, for overlays.
pub struct LayeredHit;

#[async_trait]
impl LocateStrategy for LayeredHit {
    fn name(&self) -> &'static str {
        "layered"
    }

    async fn locate(&self, point: Point, page: &dyn Driver) -> Result<Option<ElementDescriptor>> {
        query_one(page, LAYERED_SCRIPT, point).await
    }
}

/// Input-like descendants of the stacked elements.
pub struct ChildSearch;

#[async_trait]
impl LocateStrategy for ChildSearch {
    fn name(&self) -> &'static str {
        "child_search"
    }

    async fn locate(&self, point: Point, page: &dyn Driver) -> Result<Option<ElementDescriptor>> {
        query_one(page, CHILD_SCRIPT, point).await
    }
}

pub struct NearbySearch {
    pub radius: f64,
}

#[async_trait]
impl LocateStrategy for NearbySearch {
    fn name(&self) -> &'static str {
        "nearby"
    }

    async fn locate(&self, point: Point, page: &dyn Driver) -> Result<Option<ElementDescriptor>> {
        let candidates = query_many(page, NEARBY_SCRIPT, point).await?;
        debug!(candidates = candidates.len(), "nearby candidates");
        Ok(pick_nearest(point, &candidates, self.radius).cloned())
    }
}

/// Known email/username attribute patterns.
pub struct PatternMatch {
    pub radius: f64,
}

#[async_trait]
impl LocateStrategy for PatternMatch {
    fn name(&self) -> &'static str {
        "pattern"
    }

    async fn locate(&self, point: Point, page: &dyn Driver) -> Result<Option<ElementDescriptor>> {
        let candidates = query_many(page, PATTERN_SCRIPT, point).await?;
        Ok(pick_nearest(point, &candidates, self.radius).cloned())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum LocateOutcome {
    Found { element: ElementDescriptor, strategy: &'static str },
    NotFound { diagnostics: String },
}

impl LocateOutcome {
    pub fn element(&self) -> Option<&ElementDescriptor> {
        match self {
            Self::Found { element, .. } => Some(element),
            Self::NotFound { .. } => None,
        }
    }
}

pub struct ElementLocator {
    strategies: Vec<Box<dyn LocateStrategy>>,
}

impl Default for ElementLocator {
    fn default() -> Self {
        Self::new(vec![
            Box::new(DirectHit),
            Box::new(LayeredHit),
            Box::new(ChildSearch),
            Box::new(NearbySearch { radius: NEARBY_RADIUS }),
            Box::new(PatternMatch { radius: NEARBY_RADIUS }),
        ])
    }
}

impl ElementLocator {
    pub fn new(strategies: Vec<Box<dyn LocateStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Never fails: script errors are logged and treated as misses.
    pub async fn locate(&self, point: Point, page: &dyn Driver) -> LocateOutcome {
        for strategy in &self.strategies {
            match strategy.locate(point, page).await {
                Ok(Some(element)) => {
                    debug!(strategy = strategy.name(), selector = %element.selector, x = point.x, y = point.y, "element located");
                    return LocateOutcome::Found { element, strategy: strategy.name() };
                }
                Ok(None) => {}
                Err(e) => warn!(strategy = strategy.name(), error = %e, "locator strategy failed"),
            }
        }
        let diagnostics = match page.evaluate(DIAGNOSE_SCRIPT, vec![json!(point.x), json!(point.y)]).await {
            Ok(Value::String(s)) => s,
            Ok(other) => other.to_string(),
            Err(e) => format!("diagnostics unavailable: {}", e),
        };
        debug!(x = point.x, y = point.y, at_point = %diagnostics, "no input element located");
        LocateOutcome::NotFound { diagnostics }
    }
}
