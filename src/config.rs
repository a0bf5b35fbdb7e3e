//! Engine configuration.
//!
//! Every field has a default, so a config file only needs the values it
//! overrides. Environment variables are applied last.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AutomationError, Result};

/// Hard ceiling on attempts per step, regardless of configuration.
pub const MAX_ATTEMPTS_CEILING: u32 = 3;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub timing: TimingConfig,
    pub retry: RetryConfig,
    pub session: SessionConfig,
    pub typing: TypingConfig,
    pub screenshots: ScreenshotConfig,
    pub vision: VisionConfig,
}

/// Delays applied around pointer and keyboard actions, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub pointer_settle_ms: u64,
    pub press_hold_ms: u64,
    pub post_action_ms: u64,
    pub char_delay_ms: u64,
    pub email_separator_delay_ms: u64,
    pub clear_settle_ms: u64,
    pub ui_settle_ms: u64,
    pub navigation_settle_ms: u64,
    pub inter_step_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            pointer_settle_ms: 50,
            press_hold_ms: 80,
            post_action_ms: 500,
            char_delay_ms: 50,
            email_separator_delay_ms: 150,
            clear_settle_ms: 100,
            ui_settle_ms: 1000,
            navigation_settle_ms: 2000,
            inter_step_ms: 500,
        }
    }
}

impl TimingConfig {
    /// All delays set to zero. Useful for dry runs against scripted drivers.
    pub fn instant() -> Self {
        Self {
            pointer_settle_ms: 0,
            press_hold_ms: 0,
            post_action_ms: 0,
            char_delay_ms: 0,
            email_separator_delay_ms: 0,
            clear_settle_ms: 0,
            ui_settle_ms: 0,
            navigation_settle_ms: 0,
            inter_step_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Minimum confidence for an alternative action to be used when the
    /// primary guidance is unsuccessful.
    pub alternative_confidence: f64,
    /// Relative screenshot size delta above which the UI counts as changed.
    pub change_threshold: f64,
    pub scroll_on_miss_px: i64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS_CEILING,
            alternative_confidence: 0.6,
            change_threshold: 0.01,
            scroll_on_miss_px: 300,
        }
    }
}

impl RetryConfig {
    pub fn attempts(&self) -> u32 {
        self.max_attempts.clamp(1, MAX_ATTEMPTS_CEILING)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_steps: usize,
    pub timeout_secs: u64,
    pub recent_log_window: usize,
    pub screenshot_context: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_steps: 20,
            timeout_secs: 300,
            recent_log_window: 5,
            screenshot_context: 3,
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TypingConfig {
    pub clear_before_typing: bool,
    pub verify_every: usize,
    pub email_focus_attempts: u32,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            clear_before_typing: true,
            verify_every: 10,
            email_focus_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenshotConfig {
    pub persist: bool,
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:8000/api".into(),
            api_key: None,
            timeout_secs: 120,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| AutomationError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AutomationError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&raw)
    }

    /// Applies `STEADY_HANDS_*` environment overrides.
    pub fn apply_env(mut self) -> Self {
        if let Ok(url) = env::var("STEADY_HANDS_VISION_URL") {
            if !url.trim().is_empty() {
                self.vision.api_base = url;
            }
        }
        if let Ok(key) = env::var("STEADY_HANDS_API_KEY") {
            if !key.trim().is_empty() {
                self.vision.api_key = Some(key);
            }
        }
        if let Ok(dir) = env::var("STEADY_HANDS_SCREENSHOT_DIR") {
            if !dir.trim().is_empty() {
                self.screenshots.persist = true;
                self.screenshots.dir = Some(PathBuf::from(dir));
            }
        }
        if let Some(n) = env::var("STEADY_HANDS_MAX_STEPS").ok().and_then(|v| v.parse().ok()) {
            self.session.max_steps = n;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = EngineConfig::from_toml_str(
            r#"
            [retry]
            max_attempts = 7

            [session]
            max_steps = 4
            "#,
        )
        .unwrap();
        assert_eq!(cfg.retry.attempts(), 3);
        assert_eq!(cfg.session.max_steps, 4);
        assert_eq!(cfg.session.timeout_secs, 300);
        assert_eq!(cfg.timing.post_action_ms, 500);
    }

    #[test]
    fn bad_toml_is_config_error() {
        let err = EngineConfig::from_toml_str("retry = 3").unwrap_err();
        assert!(matches!(err, AutomationError::Config(_)));
    }
}
