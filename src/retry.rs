//! Per-step orchestration: ask for guidance, act, check the effect, and try
//! again with fresh evidence when the step did not take.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::{EngineConfig, RetryConfig, MAX_ATTEMPTS_CEILING};
use crate::driver::{Driver, Size};
use crate::error::{AutomationError, Result};
use crate::executor::ActionExecutor;
use crate::store::Screenshot;
use crate::vision::{ActionRequest, ActionResult, ScreenshotRef, ScrollDirection, StepContext, VisionBackend};

const REASONING_LOG_CHARS: usize = 100;

/// Decides whether the UI changed between two screenshots.
pub trait ChangeDetector: Send + Sync {
    fn changed(&self, before: &[u8], after: &[u8]) -> bool;
}

/// Compares encoded image sizes: a relative size delta above `threshold`
/// counts as a change.
#[derive(Clone, Copy, Debug)]
pub struct ByteLengthDelta {
    pub threshold: f64,
}

impl ChangeDetector for ByteLengthDelta {
    fn changed(&self, before: &[u8], after: &[u8]) -> bool {
        if before.is_empty() {
            return !after.is_empty();
        }
        let delta = (after.len() as f64 - before.len() as f64).abs() / before.len() as f64;
        delta > self.threshold
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuidanceSource {
    Primary,
    Alternative,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    NoGuidance,
    ExecutionFailed,
    NoVisibleChange,
}

/// What one attempt did. Never mutated once recorded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttemptResult {
    pub attempt: u32,
    pub action: Option<ActionRequest>,
    pub source: Option<GuidanceSource>,
    pub outcome: AttemptOutcome,
    pub duration_ms: u64,
    pub error: Option<String>,
    /// The page as it looked after the attempt, when one was captured.
    pub screenshot: Option<ScreenshotRef>,
}

impl AttemptResult {
    pub fn succeeded(&self) -> bool {
        self.outcome == AttemptOutcome::Succeeded
    }

    fn summary(&self) -> String {
        let what = match &self.action {
            Some(a) => match a.coordinates {
                Some(p) => format!("{} at ({:.0}, {:.0})", a.action_type, p.x, p.y),
                None => a.action_type.to_string(),
            },
            None => "no action".to_string(),
        };
        let why = self.error.as_deref().unwrap_or("no detail");
        format!("attempt {}: {} -> {:?}: {}", self.attempt, what, self.outcome, why)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_number: usize,
    pub description: String,
    pub action: ActionRequest,
    pub attempts: Vec<AttemptResult>,
    pub result: ActionResult,
    pub success: bool,
}

impl StepResult {
    pub fn attempts_used(&self) -> usize {
        self.attempts.len()
    }
}

#[derive(Clone, Debug, Default)]
pub struct StepOptions {
    /// Overrides the configured attempt budget, still capped at 3.
    pub max_attempts: Option<u32>,
    /// Overrides the page context inferred from the description.
    pub page_context: Option<String>,
}

#[derive(Debug)]
pub struct PlanOutcome {
    pub steps: Vec<StepResult>,
    pub failure: Option<AutomationError>,
}

impl PlanOutcome {
    pub fn success(&self) -> bool {
        self.failure.is_none()
    }
}

pub fn infer_page_context(description: &str) -> Option<String> {
    let d = description.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| d.contains(w));
    let ctx = if has(&["sign up", "signup", "register", "create account"]) {
        "registration form"
    } else if has(&["log in", "login", "sign in", "signin", "password"]) {
        "login form"
    } else if has(&["checkout", "payment", "card number", "billing"]) {
        "checkout form"
    } else if has(&["search"]) {
        "search"
    } else if has(&["email"]) {
        "email entry"
    } else {
        return None;
    };
    Some(ctx.to_string())
}

pub fn element_hints(description: &str) -> Vec<String> {
    let mut hints = Vec::new();
    for quote in ['"', '\''] {
        let parts: Vec<&str> = description.split(quote).collect();
        for (i, part) in parts.iter().enumerate() {
            if i % 2 == 1 && i + 1 < parts.len() && !part.trim().is_empty() {
                hints.push(format!("label \"{}\"", part.trim()));
            }
        }
    }
    let d = description.to_lowercase();
    let kinds = [
        (&["button"][..], "button"),
        (&["field", "input", "textbox", "text box"][..], "input field"),
        (&["link"][..], "link"),
        (&["checkbox", "check box"][..], "checkbox"),
        (&["dropdown", "select "][..], "dropdown"),
        (&["email"][..], "email field"),
    ];
    for (words, hint) in kinds {
        if words.iter().any(|w| d.contains(w)) {
            hints.push(hint.to_string());
        }
    }
    for pos in ["top", "bottom", "left", "right"] {
        if d.split(|c: char| !c.is_alphanumeric()).any(|w| w == pos) {
            hints.push(format!("position: {}", pos));
        }
    }
    hints
}

fn truncate(s: &str, n: usize) -> String {
    if s.chars().count() <= n {
        s.to_string()
    } else {
        let mut t: String = s.chars().take(n).collect();
        t.push('…');
        t
    }
}

pub struct RetryController<D: Driver, V: VisionBackend> {
    executor: ActionExecutor<D>,
    vision: Arc<V>,
    retry: RetryConfig,
    ui_settle_ms: u64,
    detector: Box<dyn ChangeDetector>,
}

impl<D: Driver, V: VisionBackend> RetryController<D, V> {
    pub fn new(driver: Arc<D>, vision: Arc<V>, cfg: &EngineConfig) -> Self {
        Self {
            executor: ActionExecutor::new(driver, cfg),
            vision,
            retry: cfg.retry.clone(),
            ui_settle_ms: cfg.timing.ui_settle_ms,
            detector: Box::new(ByteLengthDelta { threshold: cfg.retry.change_threshold }),
        }
    }

    pub fn with_detector(mut self, detector: Box<dyn ChangeDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn executor(&self) -> &ActionExecutor<D> {
        &self.executor
    }

    fn context(
        &self,
        step_number: usize,
        attempt: u32,
        description: &str,
        attempts: &[AttemptResult],
        opts: &StepOptions,
    ) -> StepContext {
        StepContext {
            step_number,
            attempt,
            page_context: opts.page_context.clone().or_else(|| infer_page_context(description)),
            element_hints: element_hints(description),
            previous_attempts: attempts.iter().filter(|a| !a.succeeded()).map(AttemptResult::summary).collect(),
        }
    }

    /// Runs one step with up to three attempts. Backend errors end the step
    /// immediately; exhausting the attempts yields [`AutomationError::StepFailed`]
    /// carrying every attempt made.
    pub async fn execute_step(
        &self,
        step_number: usize,
        description: &str,
        screenshot: &[u8],
        screen_size: Size,
        opts: &StepOptions,
    ) -> Result<StepResult> {
        let max = opts.max_attempts.unwrap_or(self.retry.attempts()).clamp(1, MAX_ATTEMPTS_CEILING);
        let mut attempts: Vec<AttemptResult> = Vec::new();
        let mut shot = screenshot.to_vec();
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=max {
            let started = Instant::now();
            let ctx = self.context(step_number, attempt, description, &attempts, opts);
            let guidance = self
                .vision
                .request_visual_action(&shot, description, screen_size, &ctx)
                .await?;

            let chosen = if guidance.success {
                guidance.clone().into_request().map(|r| (r, GuidanceSource::Primary))
            } else {
                guidance
                    .best_alternative(self.retry.alternative_confidence)
                    .cloned()
                    .map(|r| (r, GuidanceSource::Alternative))
            };
            let Some((req, source)) = chosen else {
                last_error = format!("no usable guidance: {}", truncate(&guidance.reasoning, REASONING_LOG_CHARS));
                warn!(step = step_number, attempt, confidence = guidance.confidence, "{}", last_error);
                attempts.push(AttemptResult {
                    attempt,
                    action: None,
                    source: None,
                    outcome: AttemptOutcome::NoGuidance,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: Some(last_error.clone()),
                    screenshot: None,
                });
                if attempt < max {
                    shot = self.executor.driver().take_screenshot().await?;
                }
                continue;
            };

            info!(
                step = step_number,
                attempt,
                action = %req.action_type,
                x = req.coordinates.map(|p| p.x),
                y = req.coordinates.map(|p| p.y),
                confidence = req.confidence,
                ?source,
                reasoning = %truncate(&req.reasoning, REASONING_LOG_CHARS),
                "attempting step"
            );

            match self.executor.execute(&req, attempt).await {
                Ok(mut result) => {
                    if attempt < max {
                        self.executor.settle(self.ui_settle_ms).await?;
                        let after = self.executor.driver().take_screenshot().await?;
                        let changed = self.detector.changed(&shot, &after);
                        if req.action_type.is_pointer() && !changed {
                            last_error = "no visible change after click".to_string();
                            warn!(step = step_number, attempt, "click produced no visible change, retrying");
                            attempts.push(AttemptResult {
                                attempt,
                                action: Some(req),
                                source: Some(source),
                                outcome: AttemptOutcome::NoVisibleChange,
                                duration_ms: started.elapsed().as_millis() as u64,
                                error: Some(last_error.clone()),
                                screenshot: Some(Screenshot::new(after.clone()).reference()),
                            });
                            shot = after;
                            continue;
                        }
                        result.screenshot = Some(Screenshot::new(after).reference());
                    }
                    let duration_ms = started.elapsed().as_millis() as u64;
                    info!(step = step_number, attempt, duration_ms, "step succeeded");
                    attempts.push(AttemptResult {
                        attempt,
                        action: Some(req.clone()),
                        source: Some(source),
                        outcome: AttemptOutcome::Succeeded,
                        duration_ms,
                        error: None,
                        screenshot: result.screenshot.clone(),
                    });
                    return Ok(StepResult {
                        step_number,
                        description: description.to_string(),
                        action: req,
                        attempts,
                        result,
                        success: true,
                    });
                }
                Err(e) => {
                    let not_found = e.is_element_not_found();
                    let duration_ms = started.elapsed().as_millis() as u64;
                    last_error = e.to_string();
                    warn!(step = step_number, attempt, error = %e, "attempt failed");
                    let after = if attempt < max {
                        if not_found && attempt == 2 {
                            info!(step = step_number, "element not found twice, scrolling down");
                            if let Err(se) = self
                                .executor
                                .scroll(ScrollDirection::Down, self.retry.scroll_on_miss_px)
                                .await
                            {
                                warn!(error = %se, "recovery scroll failed");
                            }
                        }
                        self.executor.settle(self.ui_settle_ms).await?;
                        Some(self.executor.driver().take_screenshot().await?)
                    } else {
                        match self.executor.driver().take_screenshot().await {
                            Ok(bytes) => Some(bytes),
                            Err(se) => {
                                warn!(step = step_number, error = %se, "no screenshot after final attempt");
                                None
                            }
                        }
                    };
                    attempts.push(AttemptResult {
                        attempt,
                        action: Some(req),
                        source: Some(source),
                        outcome: AttemptOutcome::ExecutionFailed,
                        duration_ms,
                        error: Some(last_error.clone()),
                        screenshot: after.as_ref().map(|b| Screenshot::new(b.clone()).reference()),
                    });
                    if let Some(bytes) = after {
                        shot = bytes;
                    }
                }
            }
        }

        warn!(step = step_number, attempts = attempts.len(), error = %last_error, "step failed");
        Err(AutomationError::StepFailed { step: step_number, attempts, message: last_error })
    }

    /// Runs descriptions in order and halts at the first failed step.
    pub async fn execute_steps(&self, descriptions: &[String], opts: &StepOptions) -> PlanOutcome {
        let mut steps = Vec::new();
        for (i, description) in descriptions.iter().enumerate() {
            let shot = match self.executor.driver().take_screenshot().await {
                Ok(s) => s,
                Err(e) => return PlanOutcome { steps, failure: Some(e) },
            };
            let size = self.executor.viewport().await.viewport;
            match self.execute_step(i + 1, description, &shot, size, opts).await {
                Ok(step) => steps.push(step),
                Err(e) => {
                    warn!(step = i + 1, error = %e, "halting plan");
                    return PlanOutcome { steps, failure: Some(e) };
                }
            }
        }
        PlanOutcome { steps, failure: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_length_delta_threshold() {
        let d = ByteLengthDelta { threshold: 0.01 };
        assert!(!d.changed(&[0; 1000], &[0; 1010]));
        assert!(d.changed(&[0; 1000], &[0; 1011]));
        assert!(d.changed(&[0; 1000], &[0; 900]));
        assert!(d.changed(&[], &[1]));
    }

    #[test]
    fn context_inference() {
        assert_eq!(infer_page_context("Type the password").as_deref(), Some("login form"));
        assert_eq!(infer_page_context("Click Register").as_deref(), Some("registration form"));
        assert_eq!(infer_page_context("scroll a bit"), None);
        let hints = element_hints("Click the 'Continue' button at the bottom");
        assert!(hints.contains(&"label \"Continue\"".to_string()));
        assert!(hints.contains(&"button".to_string()));
        assert!(hints.contains(&"position: bottom".to_string()));
    }

    #[test]
    fn long_reasoning_is_cut() {
        assert_eq!(truncate("abcdef", 3), "abc…");
        assert_eq!(truncate("abc", 3), "abc");
    }
}
