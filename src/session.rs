//! The autonomous loop: act, show the backend what happened, take its next
//! instruction, until it says the task is done or something runs out.

use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{EngineConfig, SessionConfig, TimingConfig};
use crate::driver::{Driver, Size};
use crate::error::Result;
use crate::executor::ActionExecutor;
use crate::store::{now_ms, DiskScreenshotStore, Screenshot, ScreenshotStore};
use crate::vision::{
    ActionLog, ActionRequest, ActionResult, FeedbackRequest, IterativeFeedback, PreviousAction,
    SessionBudget, VisionBackend,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    Running,
    Completed,
    Stopped,
    MaxStepsReached,
    /// The backend asked to continue but gave no next action.
    NoAction,
    TimedOut,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Initializing | Self::Running)
    }
}

/// Cooperative cancellation for one session, observed between steps only.
#[derive(Clone, Debug, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionStep {
    pub step_number: usize,
    pub action: ActionRequest,
    pub attempts: u32,
    pub result: ActionResult,
    pub success: bool,
}

#[derive(Clone, Debug)]
pub struct Session {
    pub id: String,
    pub remote_id: Option<String>,
    pub instruction: String,
    pub steps: Vec<SessionStep>,
    pub screenshots: Vec<Screenshot>,
    pub logs: Vec<ActionLog>,
    pub started_at_ms: u128,
    pub ended_at_ms: Option<u128>,
    pub status: SessionStatus,
    pub max_steps: usize,
    pub timeout: Duration,
    pub estimated_total_steps: Option<usize>,
    pub issues: Vec<String>,
    pub message: Option<String>,
    clock: Instant,
}

impl Session {
    fn new(instruction: &str, max_steps: usize, timeout: Duration) -> Self {
        Self {
            id: nanoid!(),
            remote_id: None,
            instruction: instruction.to_string(),
            steps: Vec::new(),
            screenshots: Vec::new(),
            logs: Vec::new(),
            started_at_ms: now_ms(),
            ended_at_ms: None,
            status: SessionStatus::Initializing,
            max_steps,
            timeout,
            estimated_total_steps: None,
            issues: Vec::new(),
            message: None,
            clock: Instant::now(),
        }
    }

    /// Moves into a terminal status. Only the first call has any effect.
    fn finish(&mut self, status: SessionStatus, message: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let message = message.into();
        self.status = status;
        self.ended_at_ms = Some(now_ms());
        info!(session = %self.id, status = ?status, steps = self.steps.len(), message = %message, "session finished");
        self.message = Some(message);
        true
    }

    fn record(&mut self, step_number: usize, action: ActionRequest, result: ActionResult) {
        let (x, y) = match (&result.resolution, action.coordinates) {
            (Some(r), _) => (Some(r.x), Some(r.y)),
            (None, Some(p)) => (Some(p.x.round() as i64), Some(p.y.round() as i64)),
            (None, None) => (None, None),
        };
        self.logs.push(ActionLog {
            step: step_number,
            action_type: action.action_type,
            x,
            y,
            success: result.success,
            duration_ms: result.duration_ms,
            error: result.error.clone(),
            timestamp_ms: now_ms(),
        });
        let success = result.success;
        self.steps.push(SessionStep { step_number, action, attempts: 1, result, success });
    }
}

#[derive(Clone, Debug, Default)]
pub struct SessionOptions {
    pub max_steps: Option<usize>,
    pub timeout: Option<Duration>,
    pub start_url: Option<String>,
    /// Stop flag for this session only; a fresh one is used when absent.
    pub stop: Option<StopHandle>,
}

#[derive(Clone, Debug)]
pub struct SessionOutcome {
    pub session_id: String,
    pub success: bool,
    pub status: SessionStatus,
    pub total_steps: usize,
    pub steps: Vec<SessionStep>,
    pub screenshots: Vec<Screenshot>,
    pub logs: Vec<ActionLog>,
    pub issues: Vec<String>,
    pub message: String,
}

impl From<Session> for SessionOutcome {
    fn from(s: Session) -> Self {
        Self {
            session_id: s.id,
            success: s.status == SessionStatus::Completed,
            status: s.status,
            total_steps: s.steps.len(),
            steps: s.steps,
            screenshots: s.screenshots,
            logs: s.logs,
            issues: s.issues,
            message: s.message.unwrap_or_default(),
        }
    }
}

pub struct IterativeSessionManager<D: Driver, V: VisionBackend> {
    executor: ActionExecutor<D>,
    vision: Arc<V>,
    session: SessionConfig,
    timing: TimingConfig,
    store: Option<Arc<dyn ScreenshotStore>>,
}

impl<D: Driver, V: VisionBackend> IterativeSessionManager<D, V> {
    pub fn new(driver: Arc<D>, vision: Arc<V>, cfg: &EngineConfig) -> Self {
        let store: Option<Arc<dyn ScreenshotStore>> = match (cfg.screenshots.persist, cfg.screenshots.dir.as_ref()) {
            (true, Some(dir)) => Some(Arc::new(DiskScreenshotStore::new(dir))),
            (true, None) => Some(Arc::new(DiskScreenshotStore::new(
                std::env::temp_dir().join("steady_hands_runs"),
            ))),
            _ => None,
        };
        Self {
            executor: ActionExecutor::new(driver, cfg),
            vision,
            session: cfg.session.clone(),
            timing: cfg.timing.clone(),
            store,
        }
    }

    pub fn with_screenshot_store(mut self, store: Arc<dyn ScreenshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Never fails: every failure resolves the session to `Error` and the
    /// outcome keeps whatever steps and screenshots were captured.
    pub async fn execute_iterative_session(&self, instruction: &str, opts: SessionOptions) -> SessionOutcome {
        let mut session = Session::new(
            instruction,
            opts.max_steps.unwrap_or(self.session.max_steps),
            opts.timeout.unwrap_or_else(|| self.session.timeout()),
        );
        info!(session = %session.id, max_steps = session.max_steps, timeout_s = session.timeout.as_secs(), "session initializing");
        let stop = opts.stop.unwrap_or_default();
        if let Err(e) = self.drive(&mut session, opts.start_url.as_deref(), &stop).await {
            warn!(session = %session.id, error = %e, "session aborted");
            session.finish(SessionStatus::Error, e.to_string());
        }
        SessionOutcome::from(session)
    }

    async fn drive(&self, s: &mut Session, start_url: Option<&str>, stop: &StopHandle) -> Result<()> {
        if let Some(url) = start_url {
            self.executor.driver().navigate(url).await?;
            self.executor.settle(self.timing.navigation_settle_ms).await?;
        }
        let screen = self.executor.viewport().await.viewport;
        let first = self.capture(s, None).await?;
        let start = self
            .vision
            .start_iterative_session(
                &s.instruction,
                &first.bytes,
                screen,
                SessionBudget { timeout_secs: s.timeout.as_secs(), max_steps: s.max_steps },
            )
            .await?;
        s.remote_id = Some(start.session_id.clone());
        s.estimated_total_steps = start.estimated_total_steps;
        s.status = SessionStatus::Running;
        info!(session = %s.id, remote = %start.session_id, estimated_steps = ?start.estimated_total_steps, "session running");

        let mut current = start.first_action;
        let mut step_number = 1;
        while step_number <= s.max_steps {
            if stop.is_requested() {
                s.finish(SessionStatus::Stopped, "stop requested");
                return Ok(());
            }
            if s.clock.elapsed() >= s.timeout {
                s.finish(
                    SessionStatus::TimedOut,
                    format!("timed out after {}s at step {}", s.timeout.as_secs(), step_number),
                );
                return Ok(());
            }
            let Some(action) = current.take() else {
                s.finish(SessionStatus::NoAction, "backend supplied no action to run");
                return Ok(());
            };

            info!(session = %s.id, step = step_number, action = %action.action_type, confidence = action.confidence, "executing session step");
            let started = Instant::now();
            let mut result = match self.executor.execute(&action, 1).await {
                Ok(r) => r,
                Err(e) => {
                    let mut failed = ActionResult::failed(started.elapsed().as_millis() as u64, e.to_string());
                    match self.capture(s, Some(step_number)).await {
                        Ok(shot) => failed.screenshot = Some(shot.reference()),
                        Err(se) => warn!(session = %s.id, step = step_number, error = %se, "no screenshot after failed action"),
                    }
                    s.record(step_number, action, failed);
                    return Err(e);
                }
            };
            let shot = self.capture(s, Some(step_number)).await?;
            result.screenshot = Some(shot.reference());
            info!(session = %s.id, step = step_number, success = result.success, duration_ms = result.duration_ms, "session step result");
            s.record(step_number, action.clone(), result.clone());

            let feedback = self
                .vision
                .submit_iterative_feedback(&self.feedback_request(s, step_number, screen, shot, action, result))
                .await?;

            if self.resolve(s, &feedback) {
                return Ok(());
            }
            match feedback.next_action {
                Some(next) => current = Some(next),
                None => {
                    s.finish(SessionStatus::NoAction, "backend asked to continue without a next action");
                    return Ok(());
                }
            }
            step_number += 1;
            if step_number <= s.max_steps {
                self.executor.settle(self.timing.inter_step_ms).await?;
            }
        }
        s.finish(
            SessionStatus::MaxStepsReached,
            format!("step budget of {} exhausted", s.max_steps),
        );
        Ok(())
    }

    /// Applies a terminal verdict from the backend, if there is one.
    fn resolve(&self, s: &mut Session, feedback: &IterativeFeedback) -> bool {
        if feedback.task_completed {
            let msg = feedback
                .progress_assessment
                .clone()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| "task completed".to_string());
            return s.finish(SessionStatus::Completed, msg);
        }
        if !feedback.should_continue {
            s.issues.extend(feedback.issues_found.iter().cloned());
            let mut msg = if feedback.reasoning.trim().is_empty() {
                "backend stopped the session".to_string()
            } else {
                feedback.reasoning.clone()
            };
            if !feedback.issues_found.is_empty() {
                msg.push_str(&format!(" (issues: {})", feedback.issues_found.join("; ")));
            }
            return s.finish(SessionStatus::Stopped, msg);
        }
        false
    }

    fn feedback_request(
        &self,
        s: &Session,
        step_number: usize,
        screen: Size,
        shot: Screenshot,
        action: ActionRequest,
        result: ActionResult,
    ) -> FeedbackRequest {
        let window = self.session.recent_log_window;
        let logs_from = s.logs.len().saturating_sub(window);
        let ctx = self.session.screenshot_context;
        let shots_from = s.screenshots.len().saturating_sub(ctx);
        FeedbackRequest {
            remote_session_id: s.remote_id.clone().unwrap_or_default(),
            instruction: s.instruction.clone(),
            screenshot: shot.bytes,
            previous: PreviousAction { action, result },
            recent_logs: s.logs[logs_from..].to_vec(),
            step_number,
            screen_size: screen,
            recent_screenshots: s.screenshots[shots_from..].iter().map(|x| x.bytes.clone()).collect(),
        }
    }

    async fn capture(&self, s: &mut Session, step: Option<usize>) -> Result<Screenshot> {
        let bytes = self.executor.driver().take_screenshot().await?;
        let mut shot = Screenshot::new(bytes);
        if let Some(store) = &self.store {
            match store.save(&s.id, step, &shot).await {
                Ok(path) => shot.path = Some(path),
                Err(e) => warn!(session = %s.id, error = %e, "screenshot not persisted"),
            }
        }
        s.screenshots.push(shot.clone());
        Ok(shot)
    }
}

impl SessionOutcome {
    pub fn screenshot_paths(&self) -> Vec<PathBuf> {
        self.screenshots.iter().filter_map(|s| s.path.clone()).collect()
    }
}
