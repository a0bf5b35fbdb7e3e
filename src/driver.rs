use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: i64,
    pub height: i64,
}

impl Size {
    pub fn new(width: i64, height: i64) -> Self {
        Self { width, height }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointerKind {
    Mouse,
    Touch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PointerOp {
    Move { x: i64, y: i64, duration_ms: u64 },
    Down,
    Up,
    Pause { ms: u64 },
}

/// One uninterrupted pointer gesture, dispatched as a single unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerSequence {
    pub kind: PointerKind,
    pub ops: Vec<PointerOp>,
}

impl PointerSequence {
    pub fn mouse() -> Self {
        Self { kind: PointerKind::Mouse, ops: Vec::new() }
    }

    pub fn touch() -> Self {
        Self { kind: PointerKind::Touch, ops: Vec::new() }
    }

    pub fn move_to(mut self, x: i64, y: i64, duration_ms: u64) -> Self {
        self.ops.push(PointerOp::Move { x, y, duration_ms });
        self
    }

    pub fn down(mut self) -> Self {
        self.ops.push(PointerOp::Down);
        self
    }

    pub fn up(mut self) -> Self {
        self.ops.push(PointerOp::Up);
        self
    }

    pub fn pause(mut self, ms: u64) -> Self {
        if ms > 0 {
            self.ops.push(PointerOp::Pause { ms });
        }
        self
    }

    /// Number of presses in the sequence.
    pub fn presses(&self) -> usize {
        self.ops.iter().filter(|op| matches!(op, PointerOp::Down)).count()
    }

    /// Every coordinate the pointer is moved to.
    pub fn targets(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        self.ops.iter().filter_map(|op| match op {
            PointerOp::Move { x, y, .. } => Some((*x, *y)),
            _ => None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Key {
    Char(char),
    Backspace,
    Delete,
    Home,
    End,
    Enter,
    Tab,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStroke {
    pub key: Key,
    pub ctrl: bool,
    pub shift: bool,
}

impl KeyStroke {
    pub fn plain(key: Key) -> Self {
        Self { key, ctrl: false, shift: false }
    }

    pub fn ch(c: char) -> Self {
        Self::plain(Key::Char(c))
    }

    pub fn ctrl(key: Key) -> Self {
        Self { key, ctrl: true, shift: false }
    }

    pub fn shift(key: Key) -> Self {
        Self { key, ctrl: false, shift: true }
    }

    pub fn select_all() -> Self {
        Self::ctrl(Key::Char('a'))
    }
}

/// The automation capability set the engine runs against.
///
/// Scripts passed to [`Driver::evaluate`] are function bodies: they read
/// their inputs from `arguments[n]` and `return` a JSON-compatible value.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<()>;
    async fn take_screenshot(&self) -> Result<Vec<u8>>;
    async fn perform_pointer_sequence(&self, seq: &PointerSequence) -> Result<()>;
    async fn evaluate(&self, script: &str, args: Vec<Value>) -> Result<Value>;
    async fn window_size(&self) -> Result<Size>;
    async fn send_keys(&self, keys: &[KeyStroke]) -> Result<()>;
    async fn pause(&self, ms: u64) -> Result<()>;
}
