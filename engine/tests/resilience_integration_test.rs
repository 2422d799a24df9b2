//! Integration tests for retry, circuit breaking, step orchestration, and
//! strategy races through the public API.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use task_engine::config::{BreakerConfig, OrchestratorConfig};
use task_engine::driver::DriverError;
use task_engine::memory::{FailureMemory, InMemoryLearningStore, LearningStore};
use task_engine::racer::{ParallelStrategy, RaceScope, StrategyStatus};
use task_engine::resilience::{BreakerRegistry, CircuitState, ResilientExecutor, RetryPolicy};
use task_engine::test_support::ScriptedDriver;
use task_engine::{
    Action, ActionExecutor, EngineConfig, EngineError, ErrorKind, StepOrchestrator, TaskContext, TaskEngine,
};
use tokio_util::sync::CancellationToken;

fn strategy(id: &str, name: &str, delay_ms: u64, ok: bool) -> ParallelStrategy<String> {
    let label = id.to_string();
    ParallelStrategy::new(id, name, move |token: CancellationToken| async move {
        tokio::select! {
            _ = token.cancelled() => Err(EngineError::Cancelled(label)),
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {
                if ok {
                    Ok(format!("{label} won"))
                } else {
                    Err(EngineError::Transient(format!("{label} failed")))
                }
            }
        }
    })
}

fn engine(store: Arc<dyn LearningStore>) -> TaskEngine {
    TaskEngine::builder(EngineConfig::default(), Arc::new(ScriptedDriver::permissive()), store)
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_race_declares_single_winner_and_cancels_rest() {
    let engine = engine(Arc::new(InMemoryLearningStore::new()));
    let scope = RaceScope::new("search", "flights.test");

    let outcome = engine
        .race(
            &scope,
            vec![
                strategy("A", "api_direct", 400, true),
                strategy("B", "dom_scrape", 50, true),
                strategy("C", "vision_read", 800, true),
            ],
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(outcome.winning_strategy.as_deref(), Some("B"));
    assert_eq!(outcome.value.as_deref(), Some("B won"));
    let wins: Vec<_> = outcome
        .results
        .iter()
        .filter(|r| r.status == StrategyStatus::Succeeded)
        .collect();
    assert_eq!(wins.len(), 1);
    for loser in outcome.results.iter().filter(|r| r.id != "B") {
        assert_eq!(loser.status, StrategyStatus::Cancelled);
    }
}

#[tokio::test(start_paused = true)]
async fn test_race_history_reorders_next_race() {
    let store: Arc<dyn LearningStore> = Arc::new(InMemoryLearningStore::new());
    let engine = engine(store.clone());
    let scope = RaceScope::new("search", "flights.test");

    for _ in 0..3 {
        engine
            .race(
                &scope,
                vec![strategy("A", "api_direct", 300, true), strategy("B", "dom_scrape", 20, true)],
                &CancellationToken::new(),
            )
            .await;
    }

    let stats = store.race_stats("search", "flights.test").await.unwrap();
    let dom = stats.iter().find(|s| s.strategy_name == "dom_scrape").unwrap();
    assert_eq!((dom.runs, dom.wins), (3, 3));

    let outcome = engine
        .race(
            &scope,
            vec![strategy("A", "api_direct", 300, true), strategy("B", "dom_scrape", 20, true)],
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(outcome.results[0].name, "dom_scrape", "historical winner goes first");
}

#[tokio::test(start_paused = true)]
async fn test_retry_invokes_exactly_n_plus_one_times() {
    let policy = RetryPolicy::new(3, Duration::from_millis(1_000), Duration::from_millis(30_000));
    let calls = AtomicU32::new(0);
    let err = policy
        .execute("flaky", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err::<(), _>(EngineError::Transient(format!("call {n}"))) }
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert!(err.to_string().contains("after 4 attempt(s)"));
    assert!(err.to_string().contains("call 4"));
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_probes_and_closes() {
    let registry = Arc::new(BreakerRegistry::new(BreakerConfig {
        failure_threshold: 3,
        cooldown_secs: 60,
        ..BreakerConfig::default()
    }));
    let exec = ResilientExecutor::new(RetryPolicy::no_retry(), registry.clone());

    for _ in 0..3 {
        let _ = exec
            .execute("ai_judge", "judge", |_| async { Err::<(), _>(EngineError::Transient("503".into())) })
            .await;
    }
    let breaker = registry.get("ai_judge");
    assert_eq!(breaker.state(), CircuitState::Open);

    let refused = exec
        .execute("ai_judge", "judge", |_| async { Ok::<_, EngineError>(()) })
        .await
        .unwrap_err();
    assert_eq!(refused.kind(), ErrorKind::CircuitOpen);

    tokio::time::advance(Duration::from_secs(61)).await;
    exec.execute("ai_judge", "judge", |_| async { Ok::<_, EngineError>(()) })
        .await
        .unwrap();
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    exec.execute("ai_judge", "judge", |_| async { Ok::<_, EngineError>(()) })
        .await
        .unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert!(Arc::ptr_eq(&breaker, &registry.get("ai_judge")));
}

#[tokio::test(start_paused = true)]
async fn test_failed_probe_reopens_breaker() {
    let registry = Arc::new(BreakerRegistry::new(BreakerConfig {
        failure_threshold: 1,
        cooldown_secs: 30,
        ..BreakerConfig::default()
    }));
    let exec = ResilientExecutor::new(RetryPolicy::no_retry(), registry.clone());
    let fail = |_| async { Err::<(), _>(EngineError::Transient("503".into())) };

    let _ = exec.execute("vault", "refresh", fail).await;
    assert_eq!(registry.get("vault").state(), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(31)).await;
    let _ = exec.execute("vault", "refresh", fail).await;
    assert_eq!(registry.get("vault").state(), CircuitState::Open);

    let refused = exec
        .execute("vault", "refresh", |_| async { Ok::<_, EngineError>(()) })
        .await
        .unwrap_err();
    assert_eq!(refused.kind(), ErrorKind::CircuitOpen, "cooldown restarts after a failed probe");
}

#[tokio::test(start_paused = true)]
async fn test_dropped_half_open_probe_releases() {
    let registry = Arc::new(BreakerRegistry::new(BreakerConfig {
        failure_threshold: 1,
        cooldown_secs: 60,
        required_successes: 1,
        ..BreakerConfig::default()
    }));
    let exec = ResilientExecutor::new(RetryPolicy::no_retry(), registry.clone());

    let _ = exec
        .execute("ai_judge", "judge", |_| async { Err::<(), _>(EngineError::Transient("503".into())) })
        .await;
    tokio::time::advance(Duration::from_secs(61)).await;

    let abandoned = tokio::time::timeout(
        Duration::from_millis(10),
        exec.execute("ai_judge", "judge", |_| async {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok::<_, EngineError>(())
        }),
    )
    .await;
    assert!(abandoned.is_err(), "caller gave up on the probe");
    assert_eq!(registry.get("ai_judge").state(), CircuitState::HalfOpen);

    exec.execute("ai_judge", "judge", |_| async { Ok::<_, EngineError>(()) })
        .await
        .expect("released slot admits the next probe");
    assert_eq!(registry.get("ai_judge").state(), CircuitState::Closed);
}

fn orchestrator(driver: Arc<ScriptedDriver>, config: OrchestratorConfig) -> StepOrchestrator {
    let memory = FailureMemory::new(Arc::new(InMemoryLearningStore::new()), Default::default());
    StepOrchestrator::new(Arc::new(ActionExecutor::new(driver, memory)), config)
}

#[tokio::test(start_paused = true)]
async fn test_step_failure_keeps_one_result_per_step() {
    let driver = Arc::new(ScriptedDriver::permissive());
    driver.fail_next("navigate", DriverError::Timeout("dns".into()));
    driver.fail_next("evaluate", DriverError::Timeout("dns".into()));
    let orch = orchestrator(driver.clone(), OrchestratorConfig::default());

    let outcome = orch
        .run(
            &TaskContext::new("u1", "news.test", "research"),
            &[Action::navigate("https://news.test"), Action::click("#headline")],
            &CancellationToken::new(),
        )
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.steps.len(), 2);
    assert_eq!(outcome.steps[0].attempts, 2);
    assert_eq!(driver.calls("navigate"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_task_timeout_returns_partial_log() {
    let driver = Arc::new(ScriptedDriver::permissive());
    driver.set_delay("click", Duration::from_secs(25));
    let orch = orchestrator(
        driver.clone(),
        OrchestratorConfig {
            task_timeout_secs: 40,
            ..OrchestratorConfig::default()
        },
    );

    let outcome = orch
        .run(
            &TaskContext::new("u1", "slow.test", "generic"),
            &[Action::click("#a"), Action::click("#b")],
            &CancellationToken::new(),
        )
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.error_kind, Some(ErrorKind::Timeout));
    assert_eq!(outcome.failed_step, Some(1));
    assert_eq!(outcome.steps.len(), 2);
    assert!(outcome.steps[0].success);
    assert!(!outcome.steps[1].success);
    assert_eq!(driver.calls("close"), 1, "session released");
}
