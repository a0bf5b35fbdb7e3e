//! Deterministic in-memory collaborators for dry runs and tests.
//!
//! [`ScriptedDriver`] models a page with a single text field: keystrokes
//! edit it, select-all style gestures select it, and scripts the engine
//! knows about (viewport metrics, focus, value reads) are answered from
//! that model. Anything else goes to an optional script handler.
//! [`ScriptedVision`] replays queued backend responses; the last queued
//! response of each kind repeats.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::driver::{Driver, Key, KeyStroke, PointerKind, PointerSequence, Size};
use crate::error::{AutomationError, Result};
use crate::executor::{FocusReport, FOCUS_SCRIPT, READ_VALUE_SCRIPT};
use crate::vision::{
    ActionRequest, FeedbackRequest, IterativeFeedback, IterativeStart, SessionBudget, StepContext,
    VisionBackend, VisualGuidance,
};
use crate::viewport::VIEWPORT_METRICS_SCRIPT;

type ScriptHandler = Box<dyn Fn(&str, &[Value]) -> Result<Value> + Send + Sync>;

const DEFAULT_SHOT_LEN: usize = 1000;

struct PageModel {
    window: Size,
    viewport: Value,
    focus: Option<FocusReport>,
    field: String,
    selected: bool,
    ignore_pointer_selection: bool,
    ignore_select_all: bool,
    screenshots: VecDeque<Vec<u8>>,
    last_screenshot: Vec<u8>,
    failing_pointer: usize,
    navigations: Vec<String>,
    pointer: Vec<PointerSequence>,
    keys: Vec<KeyStroke>,
    scripts: Vec<String>,
    focused: Vec<Option<String>>,
    pauses: Vec<u64>,
}

impl PageModel {
    fn press(&mut self, k: &KeyStroke) {
        match k.key {
            Key::Char(c) if k.ctrl => {
                if c.eq_ignore_ascii_case(&'a') && !self.ignore_select_all {
                    self.selected = true;
                }
            }
            Key::Char(c) => {
                if self.selected {
                    self.field.clear();
                    self.selected = false;
                }
                self.field.push(c);
            }
            Key::Backspace => {
                if self.selected {
                    self.field.clear();
                    self.selected = false;
                } else {
                    self.field.pop();
                }
            }
            Key::Delete => {
                if self.selected {
                    self.field.clear();
                    self.selected = false;
                }
            }
            Key::Home => self.selected = false,
            Key::End => self.selected = k.shift,
            Key::Enter | Key::Tab => {}
        }
    }
}

pub struct ScriptedDriver {
    page: Mutex<PageModel>,
    handler: Mutex<Option<ScriptHandler>>,
}

impl ScriptedDriver {
    pub fn new(window: Size) -> Self {
        let viewport = json!({
            "width": window.width, "height": window.height,
            "scrollX": 0, "scrollY": 0,
            "scrollWidth": window.width, "scrollHeight": window.height
        });
        Self {
            page: Mutex::new(PageModel {
                window,
                viewport,
                focus: Some(FocusReport { tag: "input".into(), visible: true, ..Default::default() }),
                field: String::new(),
                selected: false,
                ignore_pointer_selection: false,
                ignore_select_all: false,
                screenshots: VecDeque::new(),
                last_screenshot: vec![0u8; DEFAULT_SHOT_LEN],
                failing_pointer: 0,
                navigations: Vec::new(),
                pointer: Vec::new(),
                keys: Vec::new(),
                scripts: Vec::new(),
                focused: Vec::new(),
                pauses: Vec::new(),
            }),
            handler: Mutex::new(None),
        }
    }

    fn with_page(self, f: impl FnOnce(&mut PageModel)) -> Self {
        f(&mut self.lock());
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PageModel> {
        self.page.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Raw answer to the viewport metrics script; `null` makes it fail.
    pub fn with_viewport(self, metrics: Value) -> Self {
        self.with_page(|p| p.viewport = metrics)
    }

    pub fn with_focus(self, report: FocusReport) -> Self {
        self.with_page(|p| p.focus = Some(report))
    }

    /// Focus attempts find nothing to focus.
    pub fn with_nothing_focusable(self) -> Self {
        self.with_page(|p| p.focus = None)
    }

    pub fn with_field_value(self, value: &str) -> Self {
        self.with_page(|p| p.field = value.to_string())
    }

    /// Triple clicks no longer select the field text.
    pub fn ignoring_pointer_selection(self) -> Self {
        self.with_page(|p| p.ignore_pointer_selection = true)
    }

    /// Ctrl+A no longer selects the field text.
    pub fn ignoring_select_all(self) -> Self {
        self.with_page(|p| p.ignore_select_all = true)
    }

    /// Screenshots returned in order; the last one repeats.
    pub fn with_screenshots(self, shots: Vec<Vec<u8>>) -> Self {
        self.with_page(|p| p.screenshots = shots.into())
    }

    /// The next `n` pointer gestures fail as if intercepted.
    pub fn failing_pointer(self, n: usize) -> Self {
        self.with_page(|p| p.failing_pointer = n)
    }

    pub fn on_script<F>(&self, f: F)
    where
        F: Fn(&str, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        *self.handler.lock().unwrap_or_else(|p| p.into_inner()) = Some(Box::new(f));
    }

    pub fn field_value(&self) -> String {
        self.lock().field.clone()
    }

    pub fn pointer_sequences(&self) -> Vec<PointerSequence> {
        self.lock().pointer.clone()
    }

    pub fn sent_keys(&self) -> Vec<KeyStroke> {
        self.lock().keys.clone()
    }

    pub fn evaluated_scripts(&self) -> Vec<String> {
        self.lock().scripts.clone()
    }

    pub fn focused_selectors(&self) -> Vec<Option<String>> {
        self.lock().focused.clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.lock().navigations.clone()
    }

    pub fn pauses(&self) -> Vec<u64> {
        self.lock().pauses.clone()
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    async fn navigate(&self, url: &str) -> Result<()> {
        self.lock().navigations.push(url.to_string());
        Ok(())
    }

    async fn take_screenshot(&self) -> Result<Vec<u8>> {
        let mut p = self.lock();
        if let Some(next) = p.screenshots.pop_front() {
            p.last_screenshot = next;
        }
        Ok(p.last_screenshot.clone())
    }

    async fn perform_pointer_sequence(&self, seq: &PointerSequence) -> Result<()> {
        let mut p = self.lock();
        p.pointer.push(seq.clone());
        if p.failing_pointer > 0 {
            p.failing_pointer -= 1;
            return Err(AutomationError::driver("click intercepted by another element"));
        }
        if seq.kind == PointerKind::Mouse && seq.presses() >= 3 && !p.ignore_pointer_selection {
            p.selected = true;
        }
        Ok(())
    }

    async fn evaluate(&self, script: &str, args: Vec<Value>) -> Result<Value> {
        {
            let mut p = self.lock();
            p.scripts.push(script.to_string());
            if script == VIEWPORT_METRICS_SCRIPT {
                return match &p.viewport {
                    Value::Null => Err(AutomationError::driver("viewport metrics unavailable")),
                    v => Ok(v.clone()),
                };
            }
            if script == FOCUS_SCRIPT {
                let selector = args.first().and_then(|v| v.as_str()).map(str::to_string);
                p.focused.push(selector);
                let Some(mut report) = p.focus.clone() else {
                    return Ok(Value::Null);
                };
                report.value = Some(p.field.clone());
                return Ok(serde_json::to_value(report)?);
            }
            if script == READ_VALUE_SCRIPT {
                return Ok(Value::String(p.field.clone()));
            }
        }
        let handler = self.handler.lock().unwrap_or_else(|p| p.into_inner());
        match handler.as_ref() {
            Some(f) => f(script, &args),
            None => Ok(Value::Null),
        }
    }

    async fn window_size(&self) -> Result<Size> {
        Ok(self.lock().window)
    }

    async fn send_keys(&self, keys: &[KeyStroke]) -> Result<()> {
        let mut p = self.lock();
        for k in keys {
            p.keys.push(*k);
            p.press(k);
        }
        Ok(())
    }

    async fn pause(&self, ms: u64) -> Result<()> {
        self.lock().pauses.push(ms);
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        Ok(())
    }
}

/// Guidance that resolves to `req`.
pub fn guidance_for(req: ActionRequest) -> VisualGuidance {
    VisualGuidance {
        success: true,
        action_type: Some(req.action_type),
        coordinates: req.coordinates,
        element_info: req.bounding_box.map(|b| crate::vision::ElementInfo {
            bounding_box: Some(b),
            description: None,
            is_visible: true,
            is_clickable: true,
        }),
        confidence: req.confidence,
        reasoning: req.reasoning,
        text: req.text,
        alternative_actions: Vec::new(),
    }
}

/// Unsuccessful guidance offering `alternatives`.
pub fn unresolved_guidance(reasoning: &str, alternatives: Vec<ActionRequest>) -> VisualGuidance {
    VisualGuidance {
        success: false,
        action_type: None,
        coordinates: None,
        element_info: None,
        confidence: 0.0,
        reasoning: reasoning.to_string(),
        text: None,
        alternative_actions: alternatives,
    }
}

fn next_of<T: Clone>(queue: &Mutex<VecDeque<Result<T>>>, what: &str) -> Result<T> {
    let mut q = queue.lock().unwrap_or_else(|p| p.into_inner());
    match q.len() {
        0 => Err(AutomationError::ai(format!("no scripted {} left", what))),
        1 => q[0].clone(),
        _ => q.pop_front().unwrap_or_else(|| Err(AutomationError::ai("queue drained"))),
    }
}

#[derive(Default)]
pub struct ScriptedVision {
    guidance: Mutex<VecDeque<Result<VisualGuidance>>>,
    start: Mutex<VecDeque<Result<IterativeStart>>>,
    feedback: Mutex<VecDeque<Result<IterativeFeedback>>>,
    contexts: Mutex<Vec<StepContext>>,
    feedback_requests: Mutex<Vec<FeedbackRequest>>,
    budgets: Mutex<Vec<SessionBudget>>,
}

impl ScriptedVision {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_guidance(self, g: VisualGuidance) -> Self {
        self.guidance.lock().unwrap_or_else(|p| p.into_inner()).push_back(Ok(g));
        self
    }

    pub fn with_guidance_error(self, msg: &str) -> Self {
        self.guidance.lock().unwrap_or_else(|p| p.into_inner()).push_back(Err(AutomationError::ai(msg)));
        self
    }

    pub fn with_start(self, s: IterativeStart) -> Self {
        self.start.lock().unwrap_or_else(|p| p.into_inner()).push_back(Ok(s));
        self
    }

    pub fn with_feedback(self, f: IterativeFeedback) -> Self {
        self.feedback.lock().unwrap_or_else(|p| p.into_inner()).push_back(Ok(f));
        self
    }

    pub fn with_feedback_error(self, msg: &str) -> Self {
        self.feedback.lock().unwrap_or_else(|p| p.into_inner()).push_back(Err(AutomationError::ai(msg)));
        self
    }

    pub fn contexts(&self) -> Vec<StepContext> {
        self.contexts.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn feedback_requests(&self) -> Vec<FeedbackRequest> {
        self.feedback_requests.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn budgets(&self) -> Vec<SessionBudget> {
        self.budgets.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl VisionBackend for ScriptedVision {
    async fn request_visual_action(
        &self,
        _screenshot: &[u8],
        _instruction: &str,
        _screen_size: Size,
        context: &StepContext,
    ) -> Result<VisualGuidance> {
        self.contexts.lock().unwrap_or_else(|p| p.into_inner()).push(context.clone());
        next_of(&self.guidance, "guidance")
    }

    async fn start_iterative_session(
        &self,
        _instruction: &str,
        _screenshot: &[u8],
        _screen_size: Size,
        budget: SessionBudget,
    ) -> Result<IterativeStart> {
        self.budgets.lock().unwrap_or_else(|p| p.into_inner()).push(budget);
        next_of(&self.start, "session start")
    }

    async fn submit_iterative_feedback(&self, req: &FeedbackRequest) -> Result<IterativeFeedback> {
        self.feedback_requests.lock().unwrap_or_else(|p| p.into_inner()).push(req.clone());
        next_of(&self.feedback, "feedback")
    }
}
