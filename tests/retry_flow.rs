use std::sync::Arc;

use steady_hands::config::{EngineConfig, TimingConfig};
use steady_hands::driver::{PointerKind, Size};
use steady_hands::retry::{AttemptOutcome, ChangeDetector, GuidanceSource, RetryController, StepOptions};
use steady_hands::scripted::{guidance_for, unresolved_guidance, ScriptedDriver, ScriptedVision};
use steady_hands::vision::ActionRequest;
use steady_hands::AutomationError;

fn config() -> EngineConfig {
    EngineConfig { timing: TimingConfig::instant(), ..Default::default() }
}

fn controller(
    driver: ScriptedDriver,
    vision: ScriptedVision,
) -> (Arc<ScriptedDriver>, Arc<ScriptedVision>, RetryController<ScriptedDriver, ScriptedVision>) {
    let driver = Arc::new(driver);
    let vision = Arc::new(vision);
    let ctl = RetryController::new(driver.clone(), vision.clone(), &config());
    (driver, vision, ctl)
}

const SCREEN: Size = Size { width: 1280, height: 720 };

#[tokio::test]
async fn click_that_changes_the_page_succeeds_first_time() {
    let driver = ScriptedDriver::new(SCREEN).with_screenshots(vec![vec![0u8; 1200]]);
    let vision = ScriptedVision::new().with_guidance(guidance_for(ActionRequest::click(400.0, 300.0)));
    let (driver, _, ctl) = controller(driver, vision);

    let step = ctl
        .execute_step(1, "Click the 'Continue' button", &[0u8; 1000], SCREEN, &StepOptions::default())
        .await
        .unwrap();

    assert!(step.success);
    assert_eq!(step.attempts_used(), 1);
    assert_eq!(step.attempts[0].source, Some(GuidanceSource::Primary));
    assert!(step.result.screenshot.is_some());
    assert_eq!(driver.pointer_sequences().len(), 1);
}

#[tokio::test]
async fn click_without_visible_change_is_retried() {
    // every screenshot has the same size, so nothing ever "changes"
    let vision = ScriptedVision::new().with_guidance(guidance_for(ActionRequest::click(400.0, 300.0)));
    let (driver, vision, ctl) = controller(ScriptedDriver::new(SCREEN), vision);

    let step = ctl
        .execute_step(1, "Click Sign in", &[0u8; 1000], SCREEN, &StepOptions::default())
        .await
        .unwrap();

    // the last attempt is accepted without a change check
    assert!(step.success);
    assert_eq!(step.attempts_used(), 3);
    assert_eq!(step.attempts[0].outcome, AttemptOutcome::NoVisibleChange);
    assert_eq!(step.attempts[1].outcome, AttemptOutcome::NoVisibleChange);
    assert_eq!(step.attempts[2].outcome, AttemptOutcome::Succeeded);
    assert_eq!(driver.pointer_sequences().len(), 3);

    let contexts = vision.contexts();
    assert_eq!(contexts.len(), 3);
    assert_eq!(contexts[1].attempt, 2);
    assert_eq!(contexts[1].previous_attempts.len(), 1);
    assert_eq!(contexts[2].previous_attempts.len(), 2);
    assert_eq!(contexts[0].page_context.as_deref(), Some("login form"));
}

struct AlwaysChanged;

impl ChangeDetector for AlwaysChanged {
    fn changed(&self, _before: &[u8], _after: &[u8]) -> bool {
        true
    }
}

#[tokio::test]
async fn change_detector_is_replaceable() {
    let vision = ScriptedVision::new().with_guidance(guidance_for(ActionRequest::click(400.0, 300.0)));
    let (driver, _, ctl) = controller(ScriptedDriver::new(SCREEN), vision);
    let ctl = ctl.with_detector(Box::new(AlwaysChanged));

    // identical screenshots would normally count as no change
    let step = ctl
        .execute_step(1, "Click Sign in", &[0u8; 1000], SCREEN, &StepOptions::default())
        .await
        .unwrap();

    assert_eq!(step.attempts_used(), 1);
    assert_eq!(step.attempts[0].outcome, AttemptOutcome::Succeeded);
    assert!(step.attempts[0].screenshot.is_some());
    assert_eq!(driver.pointer_sequences().len(), 1);
}

#[tokio::test]
async fn falls_back_to_confident_alternative() {
    let alts = vec![
        ActionRequest::click(10.0, 10.0).with_confidence(0.5),
        ActionRequest::click(300.0, 300.0).with_confidence(0.8),
    ];
    let driver = ScriptedDriver::new(SCREEN).with_screenshots(vec![vec![0u8; 2000]]);
    let vision = ScriptedVision::new().with_guidance(unresolved_guidance("button is ambiguous", alts));
    let (_, _, ctl) = controller(driver, vision);

    let step = ctl
        .execute_step(1, "Click submit", &[0u8; 1000], SCREEN, &StepOptions::default())
        .await
        .unwrap();

    assert_eq!(step.attempts[0].source, Some(GuidanceSource::Alternative));
    let p = step.action.coordinates.unwrap();
    assert_eq!((p.x, p.y), (300.0, 300.0));
}

#[tokio::test]
async fn weak_alternatives_exhaust_the_budget() {
    let alts = vec![ActionRequest::click(10.0, 10.0).with_confidence(0.6)];
    let vision = ScriptedVision::new().with_guidance(unresolved_guidance("cannot see it", alts));
    let (driver, vision, ctl) = controller(ScriptedDriver::new(SCREEN), vision);

    let err = ctl
        .execute_step(4, "Click the missing thing", &[0u8; 1000], SCREEN, &StepOptions::default())
        .await
        .unwrap_err();

    match err {
        AutomationError::StepFailed { step, attempts, message } => {
            assert_eq!(step, 4);
            assert_eq!(attempts.len(), 3);
            assert!(attempts.iter().all(|a| a.outcome == AttemptOutcome::NoGuidance));
            assert!(message.contains("cannot see it"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(vision.contexts().len(), 3);
    assert!(driver.pointer_sequences().is_empty());
}

#[tokio::test]
async fn attempts_are_capped_at_three() {
    let vision = ScriptedVision::new().with_guidance(unresolved_guidance("nothing", vec![]));
    let (_, vision, ctl) = controller(ScriptedDriver::new(SCREEN), vision);
    let opts = StepOptions { max_attempts: Some(10), ..Default::default() };

    let err = ctl.execute_step(1, "Click it", &[0u8; 1000], SCREEN, &opts).await.unwrap_err();

    assert!(matches!(err, AutomationError::StepFailed { ref attempts, .. } if attempts.len() == 3));
    assert_eq!(vision.contexts().len(), 3);
}

#[tokio::test]
async fn second_miss_scrolls_before_final_attempt() {
    let driver = ScriptedDriver::new(SCREEN).with_nothing_focusable();
    let vision = ScriptedVision::new().with_guidance(guidance_for(ActionRequest::type_at(200.0, 200.0, "hello")));
    let (driver, _, ctl) = controller(driver, vision);

    let err = ctl
        .execute_step(2, "Type hello in the search field", &[0u8; 1000], SCREEN, &StepOptions::default())
        .await
        .unwrap_err();

    let AutomationError::StepFailed { attempts, .. } = err else {
        panic!("expected step failure");
    };
    assert!(attempts.iter().all(|a| a.outcome == AttemptOutcome::ExecutionFailed));
    // including the last one, after which nothing else is tried
    assert!(attempts.iter().all(|a| a.screenshot.is_some()));
    let touches = driver
        .pointer_sequences()
        .into_iter()
        .filter(|s| s.kind == PointerKind::Touch)
        .count();
    assert_eq!(touches, 1);
}

#[tokio::test]
async fn execution_failures_are_retried() {
    let driver = ScriptedDriver::new(SCREEN).failing_pointer(1);
    let vision = ScriptedVision::new().with_guidance(guidance_for(ActionRequest::click(400.0, 300.0)));
    let (driver, _, ctl) = controller(driver, vision);
    let opts = StepOptions { max_attempts: Some(2), ..Default::default() };

    let step = ctl.execute_step(1, "Click OK", &[0u8; 1000], SCREEN, &opts).await.unwrap();

    assert_eq!(step.attempts[0].outcome, AttemptOutcome::ExecutionFailed);
    assert!(step.attempts[0].error.as_deref().unwrap().contains("intercepted"));
    assert_eq!(step.attempts[1].outcome, AttemptOutcome::Succeeded);
    // an interception is not a miss, so no recovery scroll
    assert!(driver.pointer_sequences().iter().all(|s| s.kind == PointerKind::Mouse));
}

#[tokio::test]
async fn backend_errors_abort_the_step() {
    let vision = ScriptedVision::new().with_guidance_error("503 upstream");
    let (driver, vision, ctl) = controller(ScriptedDriver::new(SCREEN), vision);

    let err = ctl
        .execute_step(1, "Click OK", &[0u8; 1000], SCREEN, &StepOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, AutomationError::AiRequest(ref m) if m.contains("503")));
    assert_eq!(vision.contexts().len(), 1);
    assert!(driver.pointer_sequences().is_empty());
}

#[tokio::test]
async fn plan_halts_at_first_failed_step() {
    let vision = ScriptedVision::new()
        .with_guidance(guidance_for(ActionRequest::click(100.0, 100.0)))
        .with_guidance(unresolved_guidance("lost", vec![]));
    let (_, vision, ctl) = controller(ScriptedDriver::new(SCREEN), vision);
    let plan = vec![
        "Click the menu".to_string(),
        "Click settings".to_string(),
        "Click logout".to_string(),
    ];
    let opts = StepOptions { max_attempts: Some(1), ..Default::default() };

    let outcome = ctl.execute_steps(&plan, &opts).await;

    assert!(!outcome.success());
    assert_eq!(outcome.steps.len(), 1);
    assert!(matches!(outcome.failure, Some(AutomationError::StepFailed { step: 2, .. })));
    assert_eq!(vision.contexts().len(), 2);
}
