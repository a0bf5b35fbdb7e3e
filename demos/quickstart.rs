use anyhow::Result;
use std::sync::Arc;
use steady_hands::{
    BrowserConfig, ChromiumDriver, EngineConfig, HttpVisionBackend, IterativeSessionManager, SessionOptions,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = match std::env::var("STEADY_HANDS_CONFIG") {
        Ok(path) if !path.trim().is_empty() => EngineConfig::load(path)?,
        _ => EngineConfig::default(),
    }
    .apply_env();

    let driver = match std::env::var("CHROME_WS_URL") {
        Ok(ws) if !ws.trim().is_empty() => ChromiumDriver::connect(&ws).await?,
        _ => ChromiumDriver::launch(BrowserConfig { headless: false, ..Default::default() }).await?,
    };
    let vision = HttpVisionBackend::new(cfg.vision.clone())?;
    let manager = IterativeSessionManager::new(Arc::new(driver), Arc::new(vision), &cfg);

    let outcome = manager
        .execute_iterative_session(
            "Create an account with the email demo.user@example.com and submit the form.",
            SessionOptions { start_url: Some("https://example.com/signup".into()), ..Default::default() },
        )
        .await;

    info!(
        status = ?outcome.status,
        steps = outcome.total_steps,
        message = %outcome.message,
        "session finished"
    );
    for step in &outcome.steps {
        println!(
            "step {:>2}: {:<12} success={} {}",
            step.step_number,
            step.action.action_type.to_string(),
            step.success,
            step.result.error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}
