pub mod browser;
pub mod config;
pub mod coords;
pub mod driver;
pub mod error;
pub mod executor;
pub mod locator;
pub mod retry;
pub mod scripted;
pub mod session;
pub mod store;
pub mod viewport;
pub mod vision;

pub use browser::{BrowserConfig, ChromiumDriver};
pub use config::EngineConfig;
pub use coords::{BoundingBox, CoordinateResolution, CoordinateValidator};
pub use driver::{Driver, Point, Size};
pub use error::{AutomationError, Result};
pub use executor::ActionExecutor;
pub use locator::ElementLocator;
pub use retry::{RetryController, StepOptions, StepResult};
pub use session::{IterativeSessionManager, SessionOptions, SessionOutcome, SessionStatus, StopHandle};
pub use store::{DiskScreenshotStore, ScreenshotStore};
pub use viewport::{SafeZone, ViewportInfo, ViewportResolver};
pub use vision::{ActionRequest, ActionType, HttpVisionBackend, VisionBackend};
