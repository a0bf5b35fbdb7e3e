use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::VisionConfig;
use crate::coords::{BoundingBox, CoordinateResolution};
use crate::driver::{Point, Size};
use crate::error::{AutomationError, Result};

// ========================= Wire Types =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Click,
    #[serde(alias = "doubleclick", alias = "double-click")]
    DoubleClick,
    #[serde(alias = "input", alias = "type_text")]
    Type,
    Scroll,
    Wait,
    #[serde(alias = "goto")]
    Navigate,
}

impl ActionType {
    pub fn is_pointer(&self) -> bool {
        matches!(self, Self::Click | Self::DoubleClick)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Click => "click",
            Self::DoubleClick => "double_click",
            Self::Type => "type",
            Self::Scroll => "scroll",
            Self::Wait => "wait",
            Self::Navigate => "navigate",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    #[default]
    Down,
    Left,
    Right,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action_type: ActionType,
    #[serde(default)]
    pub coordinates: Option<Point>,
    /// Text to enter for `type`; also accepted as the target URL for `navigate`.
    #[serde(default, alias = "input_text")]
    pub text: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub bounding_box: Option<BoundingBox>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub direction: Option<ScrollDirection>,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

impl ActionRequest {
    pub fn new(action_type: ActionType) -> Self {
        Self {
            action_type,
            coordinates: None,
            text: None,
            url: None,
            bounding_box: None,
            confidence: 1.0,
            reasoning: String::new(),
            direction: None,
            amount: None,
            duration_ms: None,
        }
    }

    pub fn click(x: f64, y: f64) -> Self {
        Self { coordinates: Some(Point::new(x, y)), ..Self::new(ActionType::Click) }
    }

    pub fn double_click(x: f64, y: f64) -> Self {
        Self { coordinates: Some(Point::new(x, y)), ..Self::new(ActionType::DoubleClick) }
    }

    pub fn type_at(x: f64, y: f64, text: impl Into<String>) -> Self {
        Self {
            coordinates: Some(Point::new(x, y)),
            text: Some(text.into()),
            ..Self::new(ActionType::Type)
        }
    }

    pub fn scroll(direction: ScrollDirection, amount: i64) -> Self {
        Self { direction: Some(direction), amount: Some(amount), ..Self::new(ActionType::Scroll) }
    }

    pub fn wait(ms: u64) -> Self {
        Self { duration_ms: Some(ms), ..Self::new(ActionType::Wait) }
    }

    pub fn navigate(url: impl Into<String>) -> Self {
        Self { url: Some(url.into()), ..Self::new(ActionType::Navigate) }
    }

    pub fn with_box(mut self, bbox: BoundingBox) -> Self {
        self.bounding_box = Some(bbox);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    pub fn target_url(&self) -> Option<&str> {
        self.url.as_deref().or(self.text.as_deref())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotRef {
    pub id: String,
    pub byte_len: usize,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub duration_ms: u64,
    pub element_found: bool,
    #[serde(default)]
    pub screenshot: Option<ScreenshotRef>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub resolution: Option<CoordinateResolution>,
}

impl ActionResult {
    pub fn failed(duration_ms: u64, error: impl Into<String>) -> Self {
        Self { success: false, duration_ms, error: Some(error.into()), ..Default::default() }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementInfo {
    #[serde(default)]
    pub bounding_box: Option<BoundingBox>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_visible: bool,
    #[serde(default)]
    pub is_clickable: bool,
}

/// The backend's answer to "what should happen next on this screenshot".
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VisualGuidance {
    pub success: bool,
    #[serde(default)]
    pub action_type: Option<ActionType>,
    #[serde(default)]
    pub coordinates: Option<Point>,
    #[serde(default)]
    pub element_info: Option<ElementInfo>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, alias = "input_text")]
    pub text: Option<String>,
    #[serde(default)]
    pub alternative_actions: Vec<ActionRequest>,
}

impl VisualGuidance {
    pub fn into_request(self) -> Option<ActionRequest> {
        let action_type = self.action_type?;
        Some(ActionRequest {
            action_type,
            coordinates: self.coordinates,
            text: self.text,
            url: None,
            bounding_box: self.element_info.and_then(|e| e.bounding_box),
            confidence: self.confidence,
            reasoning: self.reasoning,
            direction: None,
            amount: None,
            duration_ms: None,
        })
    }

    /// Highest-confidence alternative strictly above `threshold`.
    pub fn best_alternative(&self, threshold: f64) -> Option<&ActionRequest> {
        self.alternative_actions
            .iter()
            .filter(|a| a.confidence > threshold)
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    }
}

/// Extra signal sent with a guidance request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepContext {
    pub step_number: usize,
    pub attempt: u32,
    #[serde(default)]
    pub page_context: Option<String>,
    #[serde(default)]
    pub element_hints: Vec<String>,
    #[serde(default)]
    pub previous_attempts: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionBudget {
    pub timeout_secs: u64,
    pub max_steps: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IterativeStart {
    pub session_id: String,
    #[serde(default)]
    pub first_action: Option<ActionRequest>,
    #[serde(default)]
    pub estimated_total_steps: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionLog {
    pub step: usize,
    pub action_type: ActionType,
    #[serde(default)]
    pub x: Option<i64>,
    #[serde(default)]
    pub y: Option<i64>,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
    pub timestamp_ms: u128,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreviousAction {
    pub action: ActionRequest,
    pub result: ActionResult,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FeedbackRequest {
    pub remote_session_id: String,
    pub instruction: String,
    pub screenshot: Vec<u8>,
    pub previous: PreviousAction,
    pub recent_logs: Vec<ActionLog>,
    pub step_number: usize,
    pub screen_size: Size,
    /// Most recent screenshots, oldest first.
    pub recent_screenshots: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IterativeFeedback {
    #[serde(default)]
    pub should_continue: bool,
    #[serde(default)]
    pub task_completed: bool,
    #[serde(default)]
    pub next_action: Option<ActionRequest>,
    #[serde(default)]
    pub progress_assessment: Option<String>,
    #[serde(default)]
    pub issues_found: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

// ========================= Backend Seam =========================

#[async_trait]
pub trait VisionBackend: Send + Sync {
    async fn request_visual_action(
        &self,
        screenshot: &[u8],
        instruction: &str,
        screen_size: Size,
        context: &StepContext,
    ) -> Result<VisualGuidance>;

    async fn start_iterative_session(
        &self,
        instruction: &str,
        screenshot: &[u8],
        screen_size: Size,
        budget: SessionBudget,
    ) -> Result<IterativeStart>;

    async fn submit_iterative_feedback(&self, req: &FeedbackRequest) -> Result<IterativeFeedback>;
}

// ========================= HTTP Client =========================

#[derive(Clone)]
pub struct HttpVisionBackend {
    http: Client,
    cfg: VisionConfig,
}

impl HttpVisionBackend {
    pub fn new(cfg: VisionConfig) -> Result<Self> {
        if cfg.api_base.trim().is_empty() {
            return Err(AutomationError::Config("vision api_base is empty".into()));
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| AutomationError::Config(e.to_string()))?;
        Ok(Self { http, cfg })
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T> {
        let url = format!("{}/{}", self.cfg.api_base.trim_end_matches('/'), path);
        let mut req = self.http.post(&url).json(&body);
        if let Some(key) = &self.cfg.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.map_err(|e| AutomationError::ai(format!("{}: {}", url, e)))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| AutomationError::ai(e.to_string()))?;
        if !status.is_success() {
            return Err(AutomationError::ai(format!("{} returned {}: {}", path, status, text)));
        }
        serde_json::from_str(&text)
            .map_err(|e| AutomationError::ai(format!("failed to parse {} response: {}", path, e)))
    }
}

fn b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

#[async_trait]
impl VisionBackend for HttpVisionBackend {
    async fn request_visual_action(
        &self,
        screenshot: &[u8],
        instruction: &str,
        screen_size: Size,
        context: &StepContext,
    ) -> Result<VisualGuidance> {
        let body = json!({
            "screenshot": b64(screenshot),
            "instruction": instruction,
            "screen_size": screen_size,
            "context": context,
        });
        self.post("visual-action", body).await
    }

    async fn start_iterative_session(
        &self,
        instruction: &str,
        screenshot: &[u8],
        screen_size: Size,
        budget: SessionBudget,
    ) -> Result<IterativeStart> {
        let body = json!({
            "instruction": instruction,
            "screenshot": b64(screenshot),
            "screen_size": screen_size,
            "session_config": budget,
        });
        self.post("iterative/start", body).await
    }

    async fn submit_iterative_feedback(&self, req: &FeedbackRequest) -> Result<IterativeFeedback> {
        let body = json!({
            "session_id": req.remote_session_id,
            "instruction": req.instruction,
            "screenshot": b64(&req.screenshot),
            "previous_action": req.previous,
            "action_logs": req.recent_logs,
            "step_number": req.step_number,
            "screen_size": req.screen_size,
            "session_context": {
                "recent_screenshots": req.recent_screenshots.iter().map(|s| b64(s)).collect::<Vec<_>>(),
            },
        });
        self.post("iterative/feedback", body).await
    }
}
