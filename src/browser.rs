use anyhow::{anyhow, Result as AnyResult};
use async_trait::async_trait;
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams, DispatchMouseEventType,
    DispatchTouchEventParams, DispatchTouchEventType, MouseButton, TouchPoint,
};
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use nanoid::nanoid;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::driver::{Driver, Key, KeyStroke, PointerKind, PointerOp, PointerSequence, Size};
use crate::error::{AutomationError, Result};

const MOD_CTRL: i64 = 2;
const MOD_SHIFT: i64 = 8;

#[derive(Clone, Debug)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    pub window: Size,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self { headless: true, user_agent: None, window: Size::new(1280, 800) }
    }
}

/// [`Driver`] backed by a Chromium page over the DevTools protocol.
pub struct ChromiumDriver {
    page: Page,
    window: Size,
    _browser: OxideBrowser,
}

fn drv(e: impl std::fmt::Display) -> AutomationError {
    AutomationError::driver(e.to_string())
}

impl ChromiumDriver {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        Self::launch_inner(cfg).await.map_err(drv)
    }

    /// Attaches to a running browser and drives its first page.
    pub async fn connect(ws_url: &str) -> Result<Self> {
        Self::connect_inner(ws_url).await.map_err(drv)
    }

    async fn launch_inner(cfg: BrowserConfig) -> AnyResult<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // a fresh profile per launch avoids the profile singleton lock
        let profile_dir: PathBuf = std::env::temp_dir().join(format!("steady-hands-profile-{}", nanoid!(8)));
        std::fs::create_dir_all(&profile_dir)?;
        builder = builder
            .user_data_dir(profile_dir)
            .window_size(cfg.window.width as u32, cfg.window.height as u32)
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await?;
        tokio::spawn(async move { while handler.next().await.is_some() {} });
        let page = browser.new_page("about:blank").await?;
        if let Some(ua) = cfg.user_agent {
            page.set_user_agent(ua).await?;
        }
        let driver = Self { page, window: cfg.window, _browser: browser };
        driver.apply_metrics().await?;
        Ok(driver)
    }

    async fn connect_inner(ws_url: &str) -> AnyResult<Self> {
        let (browser, mut handler) = OxideBrowser::connect(ws_url).await?;
        tokio::spawn(async move { while handler.next().await.is_some() {} });
        let page = match browser.pages().await?.into_iter().next() {
            Some(p) => p,
            None => browser.new_page("about:blank").await?,
        };
        let mut driver = Self { page, window: Size::new(1280, 800), _browser: browser };
        if let Ok(size) = driver.outer_size().await {
            driver.window = size;
        }
        Ok(driver)
    }

    async fn apply_metrics(&self) -> AnyResult<()> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(self.window.width)
            .height(self.window.height)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(params).await?;
        Ok(())
    }

    async fn eval_body(&self, body: &str, args: Vec<Value>) -> AnyResult<Value> {
        let expr = format!("(function(){{\n{}\n}}).apply(null, {})", body, Value::Array(args));
        let result = self.page.evaluate(expr).await?;
        Ok(result.into_value().unwrap_or(Value::Null))
    }

    async fn outer_size(&self) -> AnyResult<Size> {
        let v = self
            .eval_body("return { width: window.outerWidth, height: window.outerHeight };", vec![])
            .await?;
        Ok(serde_json::from_value(v)?)
    }

    async fn mouse(&self, kind: DispatchMouseEventType, x: i64, y: i64, pressed: bool, clicks: i64) -> AnyResult<()> {
        let mut b = DispatchMouseEventParams::builder().r#type(kind).x(x as f64).y(y as f64);
        if pressed || clicks > 0 {
            b = b.button(MouseButton::Left).click_count(clicks.max(1));
        }
        if pressed {
            b = b.buttons(1);
        }
        self.page.execute(b.build().map_err(|e| anyhow!(e))?).await?;
        Ok(())
    }

    async fn touch(&self, kind: DispatchTouchEventType, at: Option<(i64, i64)>) -> AnyResult<()> {
        let points: Vec<TouchPoint> = at.map(|(x, y)| TouchPoint::new(x as f64, y as f64)).into_iter().collect();
        let params = DispatchTouchEventParams::builder()
            .r#type(kind)
            .touch_points(points)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(params).await?;
        Ok(())
    }

    async fn mouse_sequence(&self, seq: &PointerSequence) -> AnyResult<()> {
        let (mut x, mut y) = (0, 0);
        let mut pressed = false;
        let mut clicks = 0;
        for op in &seq.ops {
            match *op {
                PointerOp::Move { x: nx, y: ny, duration_ms } => {
                    if duration_ms > 0 {
                        sleep(Duration::from_millis(duration_ms)).await;
                    }
                    x = nx;
                    y = ny;
                    self.mouse(DispatchMouseEventType::MouseMoved, x, y, pressed, 0).await?;
                }
                PointerOp::Down => {
                    clicks += 1;
                    pressed = true;
                    self.mouse(DispatchMouseEventType::MousePressed, x, y, true, clicks).await?;
                }
                PointerOp::Up => {
                    pressed = false;
                    self.mouse(DispatchMouseEventType::MouseReleased, x, y, false, clicks.max(1)).await?;
                }
                PointerOp::Pause { ms } => sleep(Duration::from_millis(ms)).await,
            }
        }
        Ok(())
    }

    async fn touch_sequence(&self, seq: &PointerSequence) -> AnyResult<()> {
        let (mut x, mut y) = (0, 0);
        let mut touching = false;
        for op in &seq.ops {
            match *op {
                PointerOp::Move { x: nx, y: ny, duration_ms } => {
                    if duration_ms > 0 {
                        sleep(Duration::from_millis(duration_ms)).await;
                    }
                    x = nx;
                    y = ny;
                    if touching {
                        self.touch(DispatchTouchEventType::TouchMove, Some((x, y))).await?;
                    }
                }
                PointerOp::Down => {
                    touching = true;
                    self.touch(DispatchTouchEventType::TouchStart, Some((x, y))).await?;
                }
                PointerOp::Up => {
                    touching = false;
                    self.touch(DispatchTouchEventType::TouchEnd, None).await?;
                }
                PointerOp::Pause { ms } => sleep(Duration::from_millis(ms)).await,
            }
        }
        Ok(())
    }

    async fn key(&self, k: &KeyStroke) -> AnyResult<()> {
        let KeyEvent { name, code, vk, text, modifiers } = KeyEvent::from_stroke(k);
        let down_kind = if text.is_some() { DispatchKeyEventType::KeyDown } else { DispatchKeyEventType::RawKeyDown };
        let mut down = DispatchKeyEventParams::builder().r#type(down_kind).key(name.clone()).modifiers(modifiers);
        let mut up = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyUp)
            .key(name)
            .modifiers(modifiers);
        if let Some(code) = code {
            down = down.code(code.clone());
            up = up.code(code);
        }
        if let Some(vk) = vk {
            down = down.windows_virtual_key_code(vk);
            up = up.windows_virtual_key_code(vk);
        }
        if let Some(text) = text {
            down = down.text(text);
        }
        self.page.execute(down.build().map_err(|e| anyhow!(e))?).await?;
        self.page.execute(up.build().map_err(|e| anyhow!(e))?).await?;
        Ok(())
    }

    async fn screenshot_png(&self) -> AnyResult<Vec<u8>> {
        let take = || async { self.page.screenshot(ScreenshotParams::builder().full_page(false).build()).await };
        match take().await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("0 width") || msg.contains("0 height") {
                    warn!(error = %msg, "empty viewport, reapplying metrics");
                    self.apply_metrics().await?;
                    sleep(Duration::from_millis(50)).await;
                    return Ok(take().await?);
                }
                Err(anyhow!(e))
            }
        }
    }
}

#[async_trait]
impl Driver for ChromiumDriver {
    async fn navigate(&self, url: &str) -> Result<()> {
        debug!(url, "navigating");
        self.page.goto(url).await.map_err(drv)?;
        self.page.wait_for_navigation().await.map_err(drv)?;
        Ok(())
    }

    async fn take_screenshot(&self) -> Result<Vec<u8>> {
        self.screenshot_png().await.map_err(drv)
    }

    async fn perform_pointer_sequence(&self, seq: &PointerSequence) -> Result<()> {
        match seq.kind {
            PointerKind::Mouse => self.mouse_sequence(seq).await,
            PointerKind::Touch => self.touch_sequence(seq).await,
        }
        .map_err(drv)
    }

    async fn evaluate(&self, script: &str, args: Vec<Value>) -> Result<Value> {
        self.eval_body(script, args).await.map_err(drv)
    }

    async fn window_size(&self) -> Result<Size> {
        match self.outer_size().await {
            Ok(s) if s.width > 0 && s.height > 0 => Ok(s),
            _ => Ok(self.window),
        }
    }

    async fn send_keys(&self, keys: &[KeyStroke]) -> Result<()> {
        for k in keys {
            self.key(k).await.map_err(drv)?;
        }
        Ok(())
    }

    async fn pause(&self, ms: u64) -> Result<()> {
        sleep(Duration::from_millis(ms)).await;
        Ok(())
    }
}

/// CDP key event fields for one stroke.
#[derive(Debug, PartialEq)]
struct KeyEvent {
    name: String,
    code: Option<String>,
    vk: Option<i64>,
    text: Option<String>,
    modifiers: i64,
}

impl KeyEvent {
    fn from_stroke(k: &KeyStroke) -> Self {
        let mut modifiers = 0;
        if k.ctrl {
            modifiers |= MOD_CTRL;
        }
        if k.shift {
            modifiers |= MOD_SHIFT;
        }
        let named = |name: &str, vk: i64| (name.to_string(), Some(name.to_string()), Some(vk));
        let (name, code, vk) = match k.key {
            // shortcuts such as ctrl+a are matched on code and key code, not text
            Key::Char(c) if c.is_ascii_alphabetic() => {
                let upper = c.to_ascii_uppercase();
                (c.to_string(), Some(format!("Key{}", upper)), Some(upper as i64))
            }
            Key::Char(c) if c.is_ascii_digit() => (c.to_string(), Some(format!("Digit{}", c)), Some(c as i64)),
            Key::Char(c) => (c.to_string(), None, None),
            Key::Backspace => named("Backspace", 8),
            Key::Tab => named("Tab", 9),
            Key::Enter => named("Enter", 13),
            Key::End => named("End", 35),
            Key::Home => named("Home", 36),
            Key::Delete => named("Delete", 46),
        };
        let text = match k.key {
            Key::Char(c) if !k.ctrl => Some(c.to_string()),
            Key::Enter => Some("\r".to_string()),
            _ => None,
        };
        Self { name, code, vk, text, modifiers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_all_carries_code_and_key_code() {
        let ev = KeyEvent::from_stroke(&KeyStroke::select_all());
        assert_eq!(ev.name, "a");
        assert_eq!(ev.code.as_deref(), Some("KeyA"));
        assert_eq!(ev.vk, Some(65));
        assert_eq!(ev.text, None);
        assert_eq!(ev.modifiers, MOD_CTRL);
    }

    #[test]
    fn plain_characters_insert_text() {
        let ev = KeyEvent::from_stroke(&KeyStroke::ch('a'));
        assert_eq!(ev.text.as_deref(), Some("a"));
        assert_eq!(ev.modifiers, 0);
        let digit = KeyEvent::from_stroke(&KeyStroke::ch('7'));
        assert_eq!((digit.code.as_deref(), digit.vk), (Some("Digit7"), Some(55)));
        let at = KeyEvent::from_stroke(&KeyStroke::ch('@'));
        assert_eq!((at.code, at.vk, at.text.as_deref()), (None, None, Some("@")));
    }

    #[test]
    fn named_keys() {
        let ev = KeyEvent::from_stroke(&KeyStroke::shift(Key::End));
        assert_eq!((ev.code.as_deref(), ev.vk, ev.modifiers), (Some("End"), Some(35), MOD_SHIFT));
        assert_eq!(KeyEvent::from_stroke(&KeyStroke::plain(Key::Enter)).text.as_deref(), Some("\r"));
    }
}
