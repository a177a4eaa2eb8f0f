use super::make_scheduler;
use crate::scheduler::{
    DriveError, ExecutionOutcome, RequestDriver, SessionStatus, StrategyKind, UpstreamExecutor,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio_util::sync::CancellationToken;

/// Executor that replays scripted outcomes per session key; unscripted keys
/// succeed.
struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<ExecutionOutcome>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    fn new() -> Self {
        Self { scripts: Mutex::new(HashMap::new()), calls: Mutex::new(Vec::new()) }
    }

    fn script(self, key: &str, outcomes: Vec<ExecutionOutcome>) -> Self {
        self.scripts.lock().insert(key.to_string(), outcomes.into());
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl UpstreamExecutor for ScriptedExecutor {
    async fn run(&self, session_key: &str, _org_id: Option<&str>) -> ExecutionOutcome {
        self.calls.lock().push(session_key.to_string());
        self.scripts
            .lock()
            .get_mut(session_key)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| ExecutionOutcome::success(200))
    }
}

#[tokio::test]
async fn test_drive_succeeds_first_attempt() {
    let scheduler = make_scheduler(&["sk-ant-aaa"], StrategyKind::RoundRobin);
    let driver = RequestDriver::new(scheduler.clone());
    let executor = ScriptedExecutor::new();

    let report = driver.drive(&executor, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.session_key, "sk-ant-aaa");
    assert_eq!(report.attempts, 1);
    assert_eq!(scheduler.session_health("sk-ant-aaa").unwrap().success_count, 1);
}

#[tokio::test]
async fn test_auth_failure_stops_retrying() {
    // S3: a 401 must not be retried on other credentials.
    let scheduler =
        make_scheduler(&["sk-ant-aaa", "sk-ant-bbb", "sk-ant-ccc"], StrategyKind::RoundRobin);
    let driver = RequestDriver::new(scheduler.clone());
    let executor = ScriptedExecutor::new()
        .script("sk-ant-aaa", vec![ExecutionOutcome::failure(401, "401 unauthorized")]);

    let err = driver.drive(&executor, &CancellationToken::new()).await.unwrap_err();
    match err {
        DriveError::Exhausted { attempts, message, .. } => {
            assert_eq!(attempts, 1);
            assert!(message.contains("401"));
        },
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(executor.calls(), vec!["sk-ant-aaa"]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_session_is_excluded_on_retry() {
    let scheduler =
        make_scheduler(&["sk-ant-aaa", "sk-ant-bbb", "sk-ant-ccc"], StrategyKind::RoundRobin);
    let driver = RequestDriver::new(scheduler.clone());
    let executor = ScriptedExecutor::new()
        .script("sk-ant-aaa", vec![ExecutionOutcome::failure(500, "internal server error")]);

    let report = driver.drive(&executor, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.attempts, 2);

    let calls = executor.calls();
    assert_eq!(calls[0], "sk-ant-aaa");
    assert_ne!(calls[1], "sk-ant-aaa");

    let failed = scheduler.session_health("sk-ant-aaa").unwrap();
    assert_eq!(failed.error_count, 1);
    assert_eq!(failed.status, SessionStatus::Cooling);
}

#[tokio::test(start_paused = true)]
async fn test_budget_exhaustion_reports_last_error() {
    let scheduler = make_scheduler(&["sk-ant-aaa", "sk-ant-bbb"], StrategyKind::RoundRobin);
    let driver = RequestDriver::new(scheduler.clone());
    let executor = ScriptedExecutor::new()
        .script("sk-ant-aaa", vec![ExecutionOutcome::failure(503, "service unavailable")])
        .script("sk-ant-bbb", vec![ExecutionOutcome::failure(503, "service unavailable")]);

    let err = driver.drive(&executor, &CancellationToken::new()).await.unwrap_err();
    match err {
        DriveError::Exhausted { attempts, .. } => assert_eq!(attempts, 2),
        other => panic!("unexpected error: {other}"),
    }
    // Both credentials burned, the third attempt had nothing left to select.
    assert_eq!(executor.calls().len(), 2);
}

#[tokio::test]
async fn test_drive_honors_updated_retry_budget() {
    let scheduler =
        make_scheduler(&["sk-ant-aaa", "sk-ant-bbb", "sk-ant-ccc"], StrategyKind::RoundRobin);
    scheduler.set_max_retry_attempts(1);

    let driver = RequestDriver::new(scheduler.clone());
    let executor = ScriptedExecutor::new()
        .script("sk-ant-aaa", vec![ExecutionOutcome::failure(500, "internal server error")]);

    let err = driver.drive(&executor, &CancellationToken::new()).await.unwrap_err();
    match err {
        DriveError::Exhausted { attempts, .. } => assert_eq!(attempts, 1),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(executor.calls(), vec!["sk-ant-aaa"]);
}

#[tokio::test]
async fn test_empty_pool_reports_no_available() {
    let scheduler = make_scheduler(&[], StrategyKind::RoundRobin);
    let driver = RequestDriver::new(scheduler);
    let executor = ScriptedExecutor::new();

    let err = driver.drive(&executor, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, DriveError::NoAvailableSession));
    assert!(executor.calls().is_empty());
}

#[tokio::test]
async fn test_discovered_org_id_is_backfilled() {
    let scheduler = make_scheduler(&["sk-ant-aaa"], StrategyKind::RoundRobin);
    let driver = RequestDriver::new(scheduler.clone());
    let executor = ScriptedExecutor::new().script(
        "sk-ant-aaa",
        vec![ExecutionOutcome::success_with_org(200, "org-discovered".into())],
    );

    driver.drive(&executor, &CancellationToken::new()).await.unwrap();
    assert_eq!(
        scheduler.session_health("sk-ant-aaa").unwrap().org_id.as_deref(),
        Some("org-discovered")
    );
}

#[tokio::test]
async fn test_cancellation_short_circuits() {
    let scheduler = make_scheduler(&["sk-ant-aaa"], StrategyKind::RoundRobin);
    let driver = RequestDriver::new(scheduler.clone());
    let executor = ScriptedExecutor::new();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = driver.drive(&executor, &cancel).await.unwrap_err();
    assert!(matches!(err, DriveError::Cancelled));
    assert!(executor.calls().is_empty());
}
