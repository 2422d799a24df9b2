//! Integration tests for end-to-end task scenarios
//!
//! Drives the public engine API against scripted collaborators: fallback
//! learning, diagnosis of expired credentials, evidence-based verification,
//! and the learning loop across task runs.

use std::sync::Arc;

use task_engine::config::{MemoryConfig, VerificationConfig};
use task_engine::diagnoser::{hypothesize, DiagnosisInput, FixKind};
use task_engine::driver::Locator;
use task_engine::memory::{FailureKey, FailureMemory, FailureReport, InMemoryLearningStore, LearningStore};
use task_engine::services::Credential;
use task_engine::test_support::{MapVault, RecordingAuditLogger, ScriptedDriver, ScriptedJudge};
use task_engine::verifier::{composite_score, score_snapshot, VerificationMethod};
use task_engine::{Action, ActionType, EngineConfig, TaskContext, TaskEngine};
use tokio_util::sync::CancellationToken;

fn engine(driver: Arc<ScriptedDriver>, store: Arc<InMemoryLearningStore>) -> TaskEngine {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
    TaskEngine::builder(EngineConfig::default(), driver, store)
        .build()
        .expect("default config is valid")
}

/// Scenario A: a missing CSS selector falls back to text and is learned
#[tokio::test(start_paused = true)]
async fn test_missing_selector_falls_back_to_text_and_is_learned() {
    let driver = Arc::new(ScriptedDriver::new());
    driver.add_element(Locator::Text("Submit".into()));
    let store = Arc::new(InMemoryLearningStore::new());
    let audit = Arc::new(RecordingAuditLogger::new());
    let engine = TaskEngine::builder(EngineConfig::default(), driver.clone(), store.clone())
        .audit(audit.clone())
        .build()
        .unwrap();

    let task = TaskContext::new("u1", "example.com", "generic");
    let result = engine
        .executor()
        .execute(&task, 0, &Action::click("#submit"))
        .await
        .expect("text fallback should succeed");

    assert!(result.success);
    assert_eq!(result.method.as_deref(), Some("click_text"));

    let key = FailureKey::new("example.com", ActionType::Click, Some("#submit"));
    let row = store.get_failure(&key).await.unwrap().expect("learned row");
    assert_eq!(row.solution.unwrap().method, "click_text");
    assert_eq!(row.success_rate, 100.0);

    let entries = audit.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].method.as_deref(), Some("click_text"));
    assert!(entries[0].screenshot_ref.is_some());
}

/// Scenario A, second run: the learned method goes first
#[tokio::test(start_paused = true)]
async fn test_learned_fallback_is_tried_first_next_time() {
    let driver = Arc::new(ScriptedDriver::new());
    driver.add_element(Locator::Text("Submit".into()));
    let store = Arc::new(InMemoryLearningStore::new());
    let engine = engine(driver.clone(), store);
    let task = TaskContext::new("u1", "example.com", "generic");

    engine.executor().execute(&task, 0, &Action::click("#submit")).await.unwrap();
    let clicks_first_run = driver.calls("click");
    engine.executor().execute(&task, 0, &Action::click("#submit")).await.unwrap();
    let clicks_second_run = driver.calls("click") - clicks_first_run;

    assert!(clicks_first_run >= 2, "css failed before text succeeded");
    assert_eq!(clicks_second_run, 1, "learned click_text runs first");
}

/// Scenario B: expired credential outranks a stale session
#[tokio::test]
async fn test_expired_credential_diagnosis() {
    let store = Arc::new(InMemoryLearningStore::new());
    let memory = FailureMemory::new(store.clone(), MemoryConfig::default());
    for _ in 0..3 {
        memory
            .record_failure(FailureReport {
                domain: "bank.test".into(),
                action_type: ActionType::Login,
                selector: None,
                original_method: Some("login_session_restore".into()),
                error_type: "unauthorized".into(),
                solution: None,
            })
            .await
            .unwrap();
    }
    let prior = memory.recent_failures("bank.test", ActionType::Login).await.unwrap();
    assert_eq!(prior.len(), 1, "identical failures share one row");
    assert_eq!(prior[0].failure_count, 3);

    let hypotheses = hypothesize(&DiagnosisInput {
        error: "unauthorized: stored credential expired".into(),
        attempts: 1,
        credential_expired: true,
        prior_failures: prior[0].failure_count,
    });
    let rank = |fix: &FixKind| hypotheses.iter().position(|h| &h.suggested_fix == fix).unwrap();
    assert!(rank(&FixKind::RefreshCredential) < rank(&FixKind::ClearSession));
    assert_eq!(hypotheses[rank(&FixKind::RefreshCredential)].likelihood, 90.0);
    assert_eq!(hypotheses[rank(&FixKind::ClearSession)].likelihood, 70.0);
}

/// Scenario B end to end: the engine refreshes the credential and the
/// second attempt logs in
#[tokio::test(start_paused = true)]
async fn test_expired_credential_is_refreshed_by_engine() {
    let driver = Arc::new(ScriptedDriver::permissive());
    driver.set_page_text("Welcome back, Ada. Sign out");
    driver.set_url("https://bank.test/dashboard");
    let vault = Arc::new(MapVault::new());
    vault.insert(
        "u1",
        "bank.test",
        Credential {
            username: "ada".into(),
            password: "s3cret".into(),
            expired: true,
        },
    );
    vault.set_refreshable(true);
    let store = Arc::new(InMemoryLearningStore::new());
    let engine = TaskEngine::builder(EngineConfig::default(), driver.clone(), store)
        .vault(vault)
        .build()
        .unwrap();

    let report = engine
        .run_task(
            TaskContext::new("u1", "bank.test", "login"),
            &[Action::login()],
            &CancellationToken::new(),
        )
        .await;

    assert!(report.success, "{:?}", report.explanation);
    assert_eq!(report.attempts, 1, "repaired login resumes the same attempt");
    assert!(driver.filled_values().contains(&"ada".to_string()));
}

/// Scenario B on a single-attempt tier: the repair has to be used in place
#[tokio::test(start_paused = true)]
async fn test_repaired_step_resumes_within_single_attempt_budget() {
    let driver = Arc::new(ScriptedDriver::permissive());
    driver.set_page_text("Login completed successfully. Thank you.");
    driver.set_url("https://portal.test/complete");
    let vault = Arc::new(MapVault::new());
    vault.insert(
        "u1",
        "portal.test",
        Credential {
            username: "grace".into(),
            password: "hopper".into(),
            expired: true,
        },
    );
    vault.set_refreshable(true);
    let store = Arc::new(InMemoryLearningStore::new());
    let engine = TaskEngine::builder(EngineConfig::default(), driver.clone(), store)
        .vault(vault)
        .build()
        .unwrap();

    let report = engine
        .run_task(
            TaskContext::new("u1", "portal.test", "generic"),
            &[Action::login(), Action::click("#continue")],
            &CancellationToken::new(),
        )
        .await;

    assert!(report.success, "{:?}", report.explanation);
    assert_eq!(report.attempts, 1);
    assert_eq!(report.hypotheses[0].suggested_fix, FixKind::RefreshCredential);
    let indices: Vec<_> = report.outcome.steps.iter().map(|s| s.step_index).collect();
    assert_eq!(indices, [0, 1]);
    assert!(report.outcome.steps.iter().all(|s| s.success));
    assert!(driver.filled_values().contains(&"grace".to_string()));
}

/// Scenario C: a booking reference is proof enough, no vision review
#[tokio::test(start_paused = true)]
async fn test_booking_reference_verifies_without_judge() {
    let driver = Arc::new(ScriptedDriver::permissive());
    driver.set_page_text("Thanks for staying with us! Booking Reference: AB12-9087");
    let judge = Arc::new(ScriptedJudge::always(r#"{"success": true, "confidence": 99}"#));
    let store = Arc::new(InMemoryLearningStore::new());
    let engine = TaskEngine::builder(EngineConfig::default(), driver, store)
        .judge(judge.clone())
        .build()
        .unwrap();

    let report = engine
        .run_task(
            TaskContext::new("u1", "hotel.test", "booking"),
            &[Action::navigate("https://hotel.test/book"), Action::click("#confirm")],
            &CancellationToken::new(),
        )
        .await;

    assert!(report.success);
    let verification = report.verification.unwrap();
    let evidence = verification.stage(VerificationMethod::Evidence).unwrap();
    assert_eq!(evidence.confidence, 95.0);
    assert!(verification.evidence.unwrap().contains("AB12-9087"));
    assert_eq!(judge.calls(), 0);
}

#[test]
fn test_composite_scoring_examples() {
    assert!((composite_score(90.0, 90.0, None) - 90.0).abs() < 1e-9);
    assert!((composite_score(60.0, 80.0, Some(100.0)) - 82.0).abs() < 1e-9);

    let snapshot = score_snapshot(
        &VerificationConfig::default(),
        "purchase",
        "Order placed. Order number: 5521-XK",
        None,
        None,
    );
    assert!(snapshot.passed);
    assert_eq!(snapshot.evidence.confidence, 95.0);
}

#[tokio::test]
async fn test_identical_failures_upsert_one_row() {
    let store = Arc::new(InMemoryLearningStore::new());
    let memory = FailureMemory::new(store.clone(), MemoryConfig::default());
    let report = FailureReport {
        domain: "shop.test".into(),
        action_type: ActionType::Click,
        selector: Some("#checkout".into()),
        original_method: Some("click_css".into()),
        error_type: "not_found".into(),
        solution: None,
    };
    memory.record_failure(report.clone()).await.unwrap();
    memory.record_failure(report).await.unwrap();
    assert_eq!(store.failure_count(), 1);
}

/// Hints that helped on one site reach the next run as known issues
#[tokio::test(start_paused = true)]
async fn test_known_issues_reach_the_next_run() {
    let store = Arc::new(InMemoryLearningStore::new());
    let driver = Arc::new(ScriptedDriver::permissive());
    driver.set_page_text("Submitted successfully. Ticket number: TK-4410");
    let engine = engine(driver, store);
    for _ in 0..2 {
        engine
            .learning()
            .record_correction("forms.test", "form_submit", "accept the cookie banner first", true)
            .await
            .unwrap();
    }

    let preamble = engine
        .learning()
        .preamble_for("forms.test", "form_submit")
        .await
        .unwrap()
        .expect("two helpful applications qualify");
    assert!(preamble.starts_with("Known issues from previous runs:"));
    assert!(preamble.contains("accept the cookie banner first"));

    let report = engine
        .run_task(
            TaskContext::new("u1", "forms.test", "form_submit"),
            &[Action::fill("#name", "Ada"), Action::new(ActionType::Submit)],
            &CancellationToken::new(),
        )
        .await;
    assert!(report.success);
    assert_eq!(report.attempts, 1);
}
