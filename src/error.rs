use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::AttemptResult;
use crate::vision::ActionType;

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum AutomationError {
    #[error("driver error: {0}")]
    Driver(String),
    #[error("no input element found near ({x}, {y}): {diagnostics}")]
    LocatorMiss { x: i64, y: i64, diagnostics: String },
    #[error("focused element is not usable for typing: {reason}")]
    FocusValidation { reason: String },
    #[error("{action} failed at ({x}, {y}) on attempt {attempt}: {message}")]
    ActionExecution {
        action: ActionType,
        x: i64,
        y: i64,
        attempt: u32,
        message: String,
    },
    #[error("vision backend error: {0}")]
    AiRequest(String),
    #[error("step {step} failed after {} attempt(s): {message}", attempts.len())]
    StepFailed {
        step: usize,
        attempts: Vec<AttemptResult>,
        message: String,
    },
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, AutomationError>;

impl AutomationError {
    pub fn driver(msg: impl Into<String>) -> Self {
        Self::Driver(msg.into())
    }

    pub fn ai(msg: impl Into<String>) -> Self {
        Self::AiRequest(msg.into())
    }

    /// True for failures that mean the target could not be found on screen,
    /// either by the locator or because an interaction hit nothing usable.
    pub fn is_element_not_found(&self) -> bool {
        match self {
            Self::LocatorMiss { .. } => true,
            Self::FocusValidation { reason } => {
                reason.starts_with("no element matches") || reason.starts_with("nothing has focus")
            }
            Self::ActionExecution { message, .. } => {
                let m = message.to_lowercase();
                m.contains("not found") || m.contains("no input element") || m.contains("detached")
            }
            _ => false,
        }
    }

    /// Attaches coordinates and attempt metadata to a lower-level failure.
    /// Locator misses, focus failures and backend errors keep their own shape.
    pub fn at(self, action: ActionType, x: i64, y: i64, attempt: u32) -> Self {
        match self {
            Self::Driver(message) => Self::ActionExecution { action, x, y, attempt, message },
            Self::Io(message) => Self::ActionExecution { action, x, y, attempt, message },
            Self::ActionExecution { message, .. } => {
                Self::ActionExecution { action, x, y, attempt, message }
            }
            other => other,
        }
    }
}

impl From<std::io::Error> for AutomationError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for AutomationError {
    fn from(e: serde_json::Error) -> Self {
        Self::Driver(format!("malformed value: {}", e))
    }
}
