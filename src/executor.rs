use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, TimingConfig, TypingConfig};
use crate::coords::{BoundingBox, CoordinateResolution, CoordinateValidator};
use crate::driver::{Driver, Key, KeyStroke, Point, PointerSequence};
use crate::error::{AutomationError, Result};
use crate::locator::{ElementDescriptor, ElementLocator, LocateOutcome};
use crate::vision::{ActionRequest, ActionResult, ActionType, ScrollDirection};
use crate::viewport::{ViewportInfo, ViewportResolver};

pub const DEFAULT_SCROLL_PX: i64 = 300;
pub const DEFAULT_WAIT_MS: u64 = 1000;
const DRAG_DURATION_MS: u64 = 300;
const DOUBLE_CLICK_GAP_MS: u64 = 50;

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern compiles"));

/// Focuses `arguments[0]` (a selector), or the current active element when
/// the selector is null, and reports what ended up focused.
pub const FOCUS_SCRIPT: &str = r#"
const sel = arguments[0];
const el = sel ? document.querySelector(sel) : document.activeElement;
if (!el || el === document.body) return null;
el.focus();
if (typeof el.click === 'function') el.click();
el.dispatchEvent(new FocusEvent('focus', { bubbles: true }));
el.dispatchEvent(new MouseEvent('click', { bubbles: true, cancelable: true }));
const a = document.activeElement || el;
const r = a.getBoundingClientRect();
const s = window.getComputedStyle(a);
return {
  tag: a.tagName.toLowerCase(),
  visible: r.width > 0 && r.height > 0 && s.visibility !== 'hidden' && s.display !== 'none',
  disabled: !!a.disabled,
  readOnly: !!a.readOnly,
  value: typeof a.value === 'string' ? a.value : null
};
"#;

pub const READ_VALUE_SCRIPT: &str = r#"
const a = document.activeElement;
return a && typeof a.value === 'string' ? a.value : null;
"#;

pub fn looks_like_email(text: &str) -> bool {
    text.contains('@')
}

pub fn is_valid_email(text: &str) -> bool {
    EMAIL_RE.is_match(text)
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusReport {
    pub tag: String,
    #[serde(default)]
    pub visible: bool,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub value: Option<String>,
}

impl FocusReport {
    pub fn check(&self) -> Result<()> {
        let reason = if self.tag != "input" && self.tag != "textarea" {
            format!("active element is <{}>, not an input or textarea", self.tag)
        } else if !self.visible {
            "element is not visible".to_string()
        } else if self.disabled {
            "element is disabled".to_string()
        } else if self.read_only {
            "element is read-only".to_string()
        } else {
            return Ok(());
        };
        Err(AutomationError::FocusValidation { reason })
    }
}

/// Ways of emptying a field, in the order email entry tries them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearMethod {
    TripleClick,
    SelectAll,
    HomeShiftEnd,
    Backspace,
}

impl ClearMethod {
    pub const CASCADE: [ClearMethod; 4] =
        [Self::TripleClick, Self::SelectAll, Self::HomeShiftEnd, Self::Backspace];
}

impl fmt::Display for ClearMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TripleClick => "triple_click",
            Self::SelectAll => "select_all",
            Self::HomeShiftEnd => "home_shift_end",
            Self::Backspace => "backspace",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "detail")]
pub enum ClearOutcome {
    AlreadyEmpty,
    Cleared(ClearMethod),
    Residue(String),
    Skipped,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TypeReport {
    pub located_by: Option<&'static str>,
    pub email: bool,
    pub focus_attempts: u32,
    pub cleared: ClearOutcome,
    pub final_value: Option<String>,
    pub matched: bool,
    pub resolution: Option<CoordinateResolution>,
}

#[derive(Default)]
struct Performed {
    element_found: bool,
    resolution: Option<CoordinateResolution>,
}

pub struct ActionExecutor<D: Driver> {
    driver: Arc<D>,
    timing: TimingConfig,
    typing: TypingConfig,
    resolver: ViewportResolver,
    validator: CoordinateValidator,
    locator: ElementLocator,
}

impl<D: Driver> ActionExecutor<D> {
    pub fn new(driver: Arc<D>, cfg: &EngineConfig) -> Self {
        Self {
            driver,
            timing: cfg.timing.clone(),
            typing: cfg.typing.clone(),
            resolver: ViewportResolver,
            validator: CoordinateValidator,
            locator: ElementLocator::default(),
        }
    }

    pub fn with_locator(mut self, locator: ElementLocator) -> Self {
        self.locator = locator;
        self
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    pub fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    fn page(&self) -> &dyn Driver {
        &*self.driver
    }

    pub async fn viewport(&self) -> ViewportInfo {
        self.resolver.resolve(self.page()).await
    }

    pub async fn settle(&self, ms: u64) -> Result<()> {
        if ms > 0 {
            self.driver.pause(ms).await?;
        }
        Ok(())
    }

    /// Runs one action. Failures come back as a single error carrying the
    /// action, the requested coordinates and the attempt number.
    pub async fn execute(&self, req: &ActionRequest, attempt: u32) -> Result<ActionResult> {
        let start = Instant::now();
        let outcome = self.dispatch(req).await;
        let duration_ms = start.elapsed().as_millis() as u64;
        let (x, y) = req
            .coordinates
            .map(|p| (p.x.round() as i64, p.y.round() as i64))
            .unwrap_or((0, 0));
        match outcome {
            Ok(done) => {
                self.settle(self.timing.post_action_ms)
                    .await
                    .map_err(|e| e.at(req.action_type, x, y, attempt))?;
                info!(
                    action = %req.action_type,
                    attempt,
                    x = done.resolution.as_ref().map(|r| r.x),
                    y = done.resolution.as_ref().map(|r| r.y),
                    element_found = done.element_found,
                    duration_ms,
                    "action executed"
                );
                Ok(ActionResult {
                    success: true,
                    duration_ms,
                    element_found: done.element_found,
                    screenshot: None,
                    error: None,
                    resolution: done.resolution,
                })
            }
            Err(e) => {
                let err = e.at(req.action_type, x, y, attempt);
                warn!(action = %req.action_type, attempt, x, y, duration_ms, error = %err, "action failed");
                Err(err)
            }
        }
    }

    async fn dispatch(&self, req: &ActionRequest) -> Result<Performed> {
        match req.action_type {
            ActionType::Click | ActionType::DoubleClick => {
                let p = req
                    .coordinates
                    .ok_or_else(|| AutomationError::driver("pointer action without coordinates"))?;
                let info = self.viewport().await;
                let res = self.validator.validate(p.x, p.y, &info, req.bounding_box.as_ref());
                if req.action_type == ActionType::Click {
                    self.click_at(&res).await?;
                } else {
                    self.double_click_at(&res).await?;
                }
                let element_found = req.bounding_box.is_some_and(|b| b.defect(&info).is_none());
                Ok(Performed { element_found, resolution: Some(res) })
            }
            ActionType::Type => {
                let text = req
                    .text
                    .as_deref()
                    .ok_or_else(|| AutomationError::driver("type action without text"))?;
                let report = self.type_text(req.coordinates, text, req.bounding_box.as_ref()).await?;
                Ok(Performed { element_found: report.located_by.is_some(), resolution: report.resolution })
            }
            ActionType::Scroll => {
                self.scroll(req.direction.unwrap_or_default(), req.amount.unwrap_or(DEFAULT_SCROLL_PX))
                    .await?;
                Ok(Performed::default())
            }
            ActionType::Wait => {
                self.wait(req.duration_ms.unwrap_or(DEFAULT_WAIT_MS)).await?;
                Ok(Performed::default())
            }
            ActionType::Navigate => {
                let url = req
                    .target_url()
                    .ok_or_else(|| AutomationError::driver("navigate action without url"))?;
                self.driver.navigate(url).await?;
                self.settle(self.timing.navigation_settle_ms).await?;
                Ok(Performed::default())
            }
        }
    }

    // ---------- pointer ----------

    pub async fn click_at(&self, at: &CoordinateResolution) -> Result<()> {
        let seq = PointerSequence::mouse()
            .move_to(at.x, at.y, 0)
            .pause(self.timing.pointer_settle_ms)
            .down()
            .pause(self.timing.press_hold_ms)
            .up();
        self.driver.perform_pointer_sequence(&seq).await
    }

    pub async fn double_click_at(&self, at: &CoordinateResolution) -> Result<()> {
        let seq = PointerSequence::mouse()
            .move_to(at.x, at.y, 0)
            .pause(self.timing.pointer_settle_ms)
            .down()
            .pause(self.timing.press_hold_ms)
            .up()
            .pause(DOUBLE_CLICK_GAP_MS)
            .down()
            .pause(self.timing.press_hold_ms)
            .up();
        self.driver.perform_pointer_sequence(&seq).await
    }

    async fn triple_click_at(&self, at: &CoordinateResolution) -> Result<()> {
        let mut seq = PointerSequence::mouse().move_to(at.x, at.y, 0).pause(self.timing.pointer_settle_ms);
        for _ in 0..3 {
            seq = seq.down().up();
        }
        self.driver.perform_pointer_sequence(&seq).await
    }

    /// Drags from the viewport center so the content moves `amount` pixels
    /// in `direction`. Both ends stay inside the safe zone.
    pub async fn scroll(&self, direction: ScrollDirection, amount: i64) -> Result<()> {
        let info = self.viewport().await;
        let zone = info.safe_zone;
        let (vx, vy) = info.center();
        let (cx, cy) = zone.clamp(vx, vy);
        let (dx, dy) = match direction {
            ScrollDirection::Down => (0, -amount),
            ScrollDirection::Up => (0, amount),
            ScrollDirection::Right => (-amount, 0),
            ScrollDirection::Left => (amount, 0),
        };
        let (ex, ey) = zone.clamp(cx + dx, cy + dy);
        debug!(?direction, amount, from_x = cx, from_y = cy, to_x = ex, to_y = ey, "scroll drag");
        let seq = PointerSequence::touch()
            .move_to(cx, cy, 0)
            .down()
            .pause(self.timing.pointer_settle_ms)
            .move_to(ex, ey, DRAG_DURATION_MS)
            .up();
        self.driver.perform_pointer_sequence(&seq).await
    }

    pub async fn wait(&self, ms: u64) -> Result<()> {
        self.driver.pause(ms).await
    }

    // ---------- text entry ----------

    /// Types `text` into the input nearest `point`. Email-like text or
    /// fields take the verified email path.
    pub async fn type_text(
        &self,
        point: Option<Point>,
        text: &str,
        bbox: Option<&BoundingBox>,
    ) -> Result<TypeReport> {
        let info = self.viewport().await;
        let res = point.map(|p| self.validator.validate(p.x, p.y, &info, bbox));
        let outcome = self.locate_at(res.as_ref()).await;
        let email_field = outcome
            .as_ref()
            .and_then(|o| o.element())
            .is_some_and(|e| e.looks_like_email());
        if looks_like_email(text) || email_field {
            self.type_email(text, res, outcome, &info).await
        } else {
            self.type_generic(text, res, outcome).await
        }
    }

    async fn locate_at(&self, res: Option<&CoordinateResolution>) -> Option<LocateOutcome> {
        match res {
            Some(r) => Some(self.locator.locate(Point::new(r.x as f64, r.y as f64), self.page()).await),
            None => None,
        }
    }

    async fn type_generic(
        &self,
        text: &str,
        res: Option<CoordinateResolution>,
        outcome: Option<LocateOutcome>,
    ) -> Result<TypeReport> {
        let located_by = self.focus(res.as_ref(), outcome.as_ref()).await?;
        let cleared = if self.typing.clear_before_typing {
            self.clear_simple().await?
        } else {
            ClearOutcome::Skipped
        };
        let base = self.base_value(&cleared).await;
        let final_value = self.type_chars(text, &base, false).await?;
        Ok(self.report(located_by, false, 1, cleared, final_value, &base, text, res))
    }

    async fn type_email(
        &self,
        text: &str,
        res: Option<CoordinateResolution>,
        first: Option<LocateOutcome>,
        info: &ViewportInfo,
    ) -> Result<TypeReport> {
        if !is_valid_email(text) {
            warn!(text, "text does not look like a well-formed email, typing anyway");
        }
        let budget = self.typing.email_focus_attempts.max(1);
        let mut outcome = first;
        let mut last_err = None;
        let mut focused = None;
        let mut used = 0;
        for n in 1..=budget {
            used = n;
            if n > 1 {
                self.settle(self.timing.clear_settle_ms).await?;
                outcome = self.locate_at(res.as_ref()).await;
            }
            match self.focus(res.as_ref(), outcome.as_ref()).await {
                Ok(by) => {
                    focused = Some(by);
                    break;
                }
                Err(e) => {
                    warn!(attempt = n, error = %e, "email field focus failed");
                    last_err = Some(e);
                }
            }
        }
        let Some(located_by) = focused else {
            return Err(last_err.unwrap_or_else(|| AutomationError::FocusValidation {
                reason: "email field never took focus".into(),
            }));
        };

        let anchor = match outcome.as_ref().and_then(|o| o.element()) {
            Some(el) => Some(self.anchor_for(el, info)),
            None => res.clone(),
        };
        let cleared = if self.typing.clear_before_typing {
            self.clear_email_field(anchor.as_ref()).await?
        } else {
            ClearOutcome::Skipped
        };
        let base = self.base_value(&cleared).await;
        let final_value = self.type_chars(text, &base, true).await?;
        Ok(self.report(located_by, true, used, cleared, final_value, &base, text, res))
    }

    #[allow(clippy::too_many_arguments)]
    fn report(
        &self,
        located_by: Option<&'static str>,
        email: bool,
        focus_attempts: u32,
        cleared: ClearOutcome,
        final_value: Option<String>,
        base: &str,
        text: &str,
        resolution: Option<CoordinateResolution>,
    ) -> TypeReport {
        let expected = format!("{}{}", base, text);
        let matched = final_value.as_deref() == Some(expected.as_str());
        if !matched {
            warn!(expected = %expected, actual = ?final_value, "field value differs from typed text");
        }
        TypeReport { located_by, email, focus_attempts, cleared, final_value, matched, resolution }
    }

    fn anchor_for(&self, el: &ElementDescriptor, info: &ViewportInfo) -> CoordinateResolution {
        let c = el.center();
        self.validator.validate(c.x, c.y, info, Some(&el.rect))
    }

    /// Focuses the located element, or clicks the raw point and takes
    /// whatever gained focus when nothing was located.
    async fn focus(
        &self,
        res: Option<&CoordinateResolution>,
        outcome: Option<&LocateOutcome>,
    ) -> Result<Option<&'static str>> {
        let mut miss = None;
        let (selector, located_by) = match outcome {
            Some(LocateOutcome::Found { element, strategy }) => (Some(element.selector.clone()), Some(*strategy)),
            Some(LocateOutcome::NotFound { diagnostics }) => {
                if let Some(r) = res {
                    debug!(x = r.x, y = r.y, at_point = %diagnostics, "locator miss, clicking raw coordinates");
                    self.click_at(r).await?;
                    self.settle(self.timing.pointer_settle_ms).await?;
                    miss = Some((r.x, r.y, diagnostics.clone()));
                }
                (None, None)
            }
            None => (None, None),
        };
        let arg = selector.clone().map(Value::String).unwrap_or(Value::Null);
        let v = self.driver.evaluate(FOCUS_SCRIPT, vec![arg]).await?;
        if v.is_null() {
            // the raw click did not focus anything either
            if let Some((x, y, diagnostics)) = miss {
                return Err(AutomationError::LocatorMiss { x, y, diagnostics });
            }
            return Err(AutomationError::FocusValidation {
                reason: match selector {
                    Some(s) => format!("no element matches {}", s),
                    None => "nothing has focus".to_string(),
                },
            });
        }
        let report: FocusReport = serde_json::from_value(v)?;
        report.check()?;
        Ok(located_by)
    }

    pub async fn read_value(&self) -> Result<Option<String>> {
        let v = self.driver.evaluate(READ_VALUE_SCRIPT, vec![]).await?;
        Ok(v.as_str().map(str::to_string))
    }

    /// Best-effort read used for verification; failures only warn.
    async fn peek_value(&self) -> Option<String> {
        match self.read_value().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "could not read field value");
                None
            }
        }
    }

    async fn base_value(&self, cleared: &ClearOutcome) -> String {
        match cleared {
            ClearOutcome::AlreadyEmpty | ClearOutcome::Cleared(_) => String::new(),
            ClearOutcome::Residue(rest) => rest.clone(),
            ClearOutcome::Skipped => self.peek_value().await.unwrap_or_default(),
        }
    }

    async fn clear_simple(&self) -> Result<ClearOutcome> {
        if self.read_value().await?.unwrap_or_default().is_empty() {
            return Ok(ClearOutcome::AlreadyEmpty);
        }
        self.apply_clear(ClearMethod::SelectAll, None).await?;
        self.settle(self.timing.clear_settle_ms).await?;
        let left = self.read_value().await?.unwrap_or_default();
        if left.is_empty() {
            return Ok(ClearOutcome::Cleared(ClearMethod::SelectAll));
        }
        self.apply_clear(ClearMethod::Backspace, None).await?;
        self.settle(self.timing.clear_settle_ms).await?;
        let left = self.read_value().await?.unwrap_or_default();
        if left.is_empty() {
            Ok(ClearOutcome::Cleared(ClearMethod::Backspace))
        } else {
            warn!(residue = %left, "field still has content after clearing");
            Ok(ClearOutcome::Residue(left))
        }
    }

    /// Tries each [`ClearMethod`] in cascade order and stops at the first one
    /// that leaves the field empty.
    pub async fn clear_email_field(&self, anchor: Option<&CoordinateResolution>) -> Result<ClearOutcome> {
        let mut left = self.read_value().await?.unwrap_or_default();
        if left.is_empty() {
            return Ok(ClearOutcome::AlreadyEmpty);
        }
        for method in ClearMethod::CASCADE {
            if method == ClearMethod::TripleClick && anchor.is_none() {
                continue;
            }
            self.apply_clear(method, anchor).await?;
            self.settle(self.timing.clear_settle_ms).await?;
            left = self.read_value().await?.unwrap_or_default();
            if left.is_empty() {
                debug!(%method, "email field cleared");
                return Ok(ClearOutcome::Cleared(method));
            }
            debug!(%method, remaining = left.chars().count(), "clear method left text behind");
        }
        warn!(residue = %left, "email field could not be cleared");
        Ok(ClearOutcome::Residue(left))
    }

    async fn apply_clear(&self, method: ClearMethod, anchor: Option<&CoordinateResolution>) -> Result<()> {
        match method {
            ClearMethod::TripleClick => {
                if let Some(at) = anchor {
                    self.triple_click_at(at).await?;
                    self.driver.send_keys(&[KeyStroke::plain(Key::Delete)]).await?;
                }
                Ok(())
            }
            ClearMethod::SelectAll => {
                self.driver
                    .send_keys(&[KeyStroke::select_all(), KeyStroke::plain(Key::Delete)])
                    .await
            }
            ClearMethod::HomeShiftEnd => {
                self.driver
                    .send_keys(&[
                        KeyStroke::plain(Key::Home),
                        KeyStroke::shift(Key::End),
                        KeyStroke::plain(Key::Delete),
                    ])
                    .await
            }
            ClearMethod::Backspace => {
                let n = self.read_value().await?.unwrap_or_default().chars().count();
                let mut keys = vec![KeyStroke::plain(Key::End)];
                keys.extend(std::iter::repeat(KeyStroke::plain(Key::Backspace)).take(n));
                self.driver.send_keys(&keys).await
            }
        }
    }

    /// Types one character at a time, re-reading the field every
    /// `verify_every` characters. Mismatches are logged, never fatal.
    async fn type_chars(&self, text: &str, base: &str, email: bool) -> Result<Option<String>> {
        let every = self.typing.verify_every;
        let mut typed = String::with_capacity(text.len());
        for (i, c) in text.chars().enumerate() {
            self.driver.send_keys(&[KeyStroke::ch(c)]).await?;
            typed.push(c);
            self.settle(self.timing.char_delay_ms).await?;
            if email && (c == '@' || c == '.') {
                self.settle(self.timing.email_separator_delay_ms).await?;
            }
            if every > 0 && (i + 1) % every == 0 {
                let expected = format!("{}{}", base, typed);
                let live = self.peek_value().await;
                if live.as_deref() != Some(expected.as_str()) {
                    warn!(typed = i + 1, expected = %expected, live = ?live, "partial input mismatch");
                }
            }
        }
        Ok(self.peek_value().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{PointerKind, Size};
    use crate::locator::{CHILD_SCRIPT, DIRECT_SCRIPT};
    use crate::scripted::ScriptedDriver;

    fn executor(driver: ScriptedDriver) -> (Arc<ScriptedDriver>, ActionExecutor<ScriptedDriver>) {
        let driver = Arc::new(driver);
        let mut cfg = EngineConfig::default();
        cfg.timing = TimingConfig::instant();
        (driver.clone(), ActionExecutor::new(driver, &cfg))
    }

    fn email_input() -> Value {
        json!({
            "selector": "#email", "tag": "input", "inputType": "email",
            "rect": {"left": 100, "top": 100, "right": 420, "bottom": 140}, "visible": true
        })
    }

    #[test]
    fn focus_checks_name_the_failed_condition() {
        let mut r = FocusReport { tag: "div".into(), visible: true, ..Default::default() };
        assert!(r.check().unwrap_err().to_string().contains("<div>"));
        r.tag = "input".into();
        assert!(r.check().is_ok());
        r.read_only = true;
        assert!(r.check().unwrap_err().to_string().contains("read-only"));
        r.read_only = false;
        r.disabled = true;
        assert!(r.check().unwrap_err().to_string().contains("disabled"));
        r.visible = false;
        assert!(r.check().unwrap_err().to_string().contains("not visible"));
    }

    #[test]
    fn email_pattern() {
        assert!(is_valid_email("a.b@example.com"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("two words@example.com"));
    }

    #[tokio::test]
    async fn click_lands_inside_safe_zone() {
        let (driver, exec) = executor(ScriptedDriver::new(Size::new(1280, 720)));
        let result = exec.execute(&ActionRequest::click(3000.0, 5.0), 1).await.unwrap();
        assert!(result.success);
        let seqs = driver.pointer_sequences();
        assert_eq!(seqs.len(), 1);
        assert_eq!(seqs[0].presses(), 1);
        let (x, y) = seqs[0].targets().next().unwrap();
        assert!(result.resolution.unwrap().safe_zone.contains(x, y));
    }

    #[tokio::test]
    async fn double_click_presses_twice() {
        let (driver, exec) = executor(ScriptedDriver::new(Size::new(1280, 720)));
        exec.execute(&ActionRequest::double_click(400.0, 300.0), 1).await.unwrap();
        assert_eq!(driver.pointer_sequences()[0].presses(), 2);
    }

    #[tokio::test]
    async fn scroll_down_drags_upward_from_center() {
        let (driver, exec) = executor(ScriptedDriver::new(Size::new(1280, 720)));
        exec.scroll(ScrollDirection::Down, 200).await.unwrap();
        let seq = &driver.pointer_sequences()[0];
        assert_eq!(seq.kind, PointerKind::Touch);
        let points: Vec<_> = seq.targets().collect();
        assert_eq!(points, vec![(640, 360), (640, 160)]);
    }

    #[tokio::test]
    async fn generic_typing_replaces_existing_text() {
        let driver = ScriptedDriver::new(Size::new(1280, 720)).with_field_value("old");
        driver.on_script(|script, _| {
            if script == DIRECT_SCRIPT {
                Ok(json!({
                    "selector": "#q", "tag": "input", "inputType": "search",
                    "rect": {"left": 100, "top": 100, "right": 420, "bottom": 140}, "visible": true
                }))
            } else {
                Ok(Value::Null)
            }
        });
        let (driver, exec) = executor(driver);
        let report = exec.type_text(Some(Point::new(150.0, 120.0)), "rust traits", None).await.unwrap();
        assert_eq!(report.located_by, Some("direct"));
        assert!(!report.email);
        assert_eq!(report.cleared, ClearOutcome::Cleared(ClearMethod::SelectAll));
        assert!(report.matched);
        assert_eq!(driver.field_value(), "rust traits");
        assert_eq!(driver.focused_selectors(), vec![Some("#q".to_string())]);
    }

    #[tokio::test]
    async fn focus_failure_is_descriptive() {
        let driver = ScriptedDriver::new(Size::new(1280, 720))
            .with_focus(FocusReport { tag: "input".into(), visible: true, disabled: true, ..Default::default() });
        let (_, exec) = executor(driver);
        let err = exec
            .execute(&ActionRequest::type_at(150.0, 120.0, "hello"), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, AutomationError::FocusValidation { ref reason } if reason.contains("disabled")));
    }

    #[tokio::test]
    async fn locator_miss_falls_back_to_raw_click() {
        let (driver, exec) = executor(ScriptedDriver::new(Size::new(1280, 720)));
        let report = exec.type_text(Some(Point::new(300.0, 300.0)), "abc", None).await.unwrap();
        assert_eq!(report.located_by, None);
        assert_eq!(driver.pointer_sequences().len(), 1);
        assert_eq!(driver.focused_selectors(), vec![None]);
        assert_eq!(driver.field_value(), "abc");
    }

    #[tokio::test]
    async fn email_cascade_stops_at_first_success() {
        let driver = ScriptedDriver::new(Size::new(1280, 720)).with_field_value("stale@old.io");
        driver.on_script(|script, _| if script == CHILD_SCRIPT { Ok(email_input()) } else { Ok(Value::Null) });
        let (driver, exec) = executor(driver);
        let report = exec.type_text(Some(Point::new(120.0, 120.0)), "new@example.com", None).await.unwrap();
        assert!(report.email);
        assert_eq!(report.cleared, ClearOutcome::Cleared(ClearMethod::TripleClick));
        assert!(report.matched);
        let keys = driver.sent_keys();
        assert!(!keys.contains(&KeyStroke::select_all()));
        assert!(!keys.contains(&KeyStroke::plain(Key::Home)));
        assert!(!keys.contains(&KeyStroke::plain(Key::Backspace)));
    }

    #[tokio::test]
    async fn email_cascade_moves_on_when_selection_is_ignored() {
        let driver = ScriptedDriver::new(Size::new(1280, 720))
            .with_field_value("stale@old.io")
            .ignoring_pointer_selection()
            .ignoring_select_all();
        driver.on_script(|script, _| if script == CHILD_SCRIPT { Ok(email_input()) } else { Ok(Value::Null) });
        let (driver, exec) = executor(driver);
        let report = exec.type_text(Some(Point::new(120.0, 120.0)), "new@example.com", None).await.unwrap();
        assert_eq!(report.cleared, ClearOutcome::Cleared(ClearMethod::HomeShiftEnd));
        let keys = driver.sent_keys();
        assert!(keys.contains(&KeyStroke::select_all()));
        assert!(!keys.contains(&KeyStroke::plain(Key::Backspace)));
        assert_eq!(driver.field_value(), "new@example.com");
    }

    #[tokio::test]
    async fn failed_fallback_click_is_a_locator_miss() {
        let driver = ScriptedDriver::new(Size::new(1280, 720)).with_nothing_focusable();
        let (driver, exec) = executor(driver);
        let err = exec.type_text(Some(Point::new(300.0, 300.0)), "abc", None).await.unwrap_err();
        assert!(matches!(err, AutomationError::LocatorMiss { .. }));
        assert!(err.is_element_not_found());
        assert_eq!(driver.pointer_sequences().len(), 1);
    }

    #[tokio::test]
    async fn custom_locator_replaces_default_strategies() {
        let driver = Arc::new(ScriptedDriver::new(Size::new(1280, 720)));
        let cfg = EngineConfig { timing: TimingConfig::instant(), ..Default::default() };
        let exec = ActionExecutor::new(driver.clone(), &cfg).with_locator(ElementLocator::new(vec![]));
        let report = exec.type_text(Some(Point::new(300.0, 300.0)), "abc", None).await.unwrap();
        assert_eq!(report.located_by, None);
        assert!(!driver.evaluated_scripts().iter().any(|s| s == DIRECT_SCRIPT));
        assert_eq!(driver.pointer_sequences().len(), 1);
    }

    #[tokio::test]
    async fn email_focus_is_retried_up_to_the_budget() {
        let driver = ScriptedDriver::new(Size::new(1280, 720)).with_nothing_focusable();
        let (driver, exec) = executor(driver);
        let err = exec
            .type_text(Some(Point::new(300.0, 300.0)), "ann@example.com", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AutomationError::LocatorMiss { .. }));
        assert_eq!(driver.focused_selectors().len(), 3);
        // the element is located again before every attempt
        let located = driver.evaluated_scripts().iter().filter(|s| *s == DIRECT_SCRIPT).count();
        assert_eq!(located, 3);
        assert!(driver.sent_keys().is_empty());
    }

    #[tokio::test]
    async fn nothing_focused_without_a_point_is_a_focus_error() {
        let driver = ScriptedDriver::new(Size::new(1280, 720)).with_nothing_focusable();
        let (driver, exec) = executor(driver);
        let err = exec.type_text(None, "ann@example.com", None).await.unwrap_err();
        assert!(matches!(err, AutomationError::FocusValidation { ref reason } if reason.contains("nothing has focus")));
        assert_eq!(driver.focused_selectors().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn email_separators_get_an_extra_pause() {
        let driver = ScriptedDriver::new(Size::new(1280, 720));
        driver.on_script(|script, _| if script == CHILD_SCRIPT { Ok(email_input()) } else { Ok(Value::Null) });
        let driver = Arc::new(driver);
        let cfg = EngineConfig {
            timing: TimingConfig { email_separator_delay_ms: 150, ..TimingConfig::instant() },
            ..Default::default()
        };
        let exec = ActionExecutor::new(driver.clone(), &cfg);
        let report = exec.type_text(Some(Point::new(120.0, 120.0)), "ann@mail.example.com", None).await.unwrap();
        assert!(report.email);
        assert_eq!(driver.pauses(), vec![150, 150, 150]);
        assert_eq!(driver.field_value(), "ann@mail.example.com");
    }

    #[tokio::test]
    async fn long_input_is_checked_while_typing() {
        async fn value_reads(text: &str) -> usize {
            let driver = ScriptedDriver::new(Size::new(1280, 720));
            driver.on_script(|script, _| {
                if script == DIRECT_SCRIPT {
                    Ok(json!({
                        "selector": "#q", "tag": "input", "inputType": "search",
                        "rect": {"left": 100, "top": 100, "right": 420, "bottom": 140}, "visible": true
                    }))
                } else {
                    Ok(Value::Null)
                }
            });
            let (driver, exec) = executor(driver);
            let report = exec.type_text(Some(Point::new(150.0, 120.0)), text, None).await.unwrap();
            assert!(report.matched);
            driver.evaluated_scripts().iter().filter(|s| *s == READ_VALUE_SCRIPT).count()
        }
        let short = value_reads("123456789").await;
        assert_eq!(value_reads("123456789012").await, short + 1);
        assert_eq!(value_reads("12345678901234567890").await, short + 2);
    }

    #[tokio::test]
    async fn navigate_uses_text_as_url() {
        let (driver, exec) = executor(ScriptedDriver::new(Size::new(1280, 720)));
        let mut req = ActionRequest::new(ActionType::Navigate);
        req.text = Some("https://example.com/login".into());
        exec.execute(&req, 1).await.unwrap();
        assert_eq!(driver.navigations(), vec!["https://example.com/login".to_string()]);
    }
}
