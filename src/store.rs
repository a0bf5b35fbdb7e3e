use async_trait::async_trait;
use nanoid::nanoid;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs as async_fs;

use crate::error::{AutomationError, Result};
use crate::vision::ScreenshotRef;

#[derive(Clone, Debug, PartialEq)]
pub struct Screenshot {
    pub id: String,
    pub bytes: Vec<u8>,
    pub captured_at_ms: u128,
    pub path: Option<PathBuf>,
}

impl Screenshot {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { id: nanoid!(), bytes, captured_at_ms: now_ms(), path: None }
    }

    pub fn reference(&self) -> ScreenshotRef {
        ScreenshotRef { id: self.id.clone(), byte_len: self.bytes.len(), path: self.path.clone() }
    }
}

pub(crate) fn now_ms() -> u128 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or(0)
}

#[async_trait]
pub trait ScreenshotStore: Send + Sync {
    /// Persists the image and returns where it went. `step` is `None` for the
    /// screenshot taken before the first action.
    async fn save(&self, session_id: &str, step: Option<usize>, shot: &Screenshot) -> Result<PathBuf>;
}

pub struct DiskScreenshotStore {
    base_dir: PathBuf,
}

impl DiskScreenshotStore {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self { base_dir: base.as_ref().to_path_buf() }
    }
}

#[async_trait]
impl ScreenshotStore for DiskScreenshotStore {
    async fn save(&self, session_id: &str, step: Option<usize>, shot: &Screenshot) -> Result<PathBuf> {
        let dir = self.base_dir.join(session_id);
        async_fs::create_dir_all(&dir)
            .await
            .map_err(|e| AutomationError::Io(format!("create_dir {}: {}", dir.display(), e)))?;
        let name = match step {
            Some(s) => format!("step_{:03}.png", s),
            None => "start.png".to_string(),
        };
        let path = dir.join(name);
        async_fs::write(&path, &shot.bytes)
            .await
            .map_err(|e| AutomationError::Io(format!("write {}: {}", path.display(), e)))?;
        Ok(path)
    }
}
