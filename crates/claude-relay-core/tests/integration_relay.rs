#![allow(clippy::expect_used, reason = "integration test — panics are the assertion mechanism")]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use claude_relay_core::proxy::upstream::{ClaudeWebClient, CompletionEvent, SseParser};
use claude_relay_core::scheduler::{
    ExecutionOutcome, RequestDriver, SchedulerConfig, SessionStatus, StrategyKind,
    UpstreamExecutor,
};
use claude_relay_core::{SessionInfo, SessionScheduler};

use futures::StreamExt;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Executor whose per-key failure budget models a flaky upstream.
struct FlakyExecutor {
    failures_left: Mutex<HashMap<String, u32>>,
}

impl FlakyExecutor {
    fn failing(key: &str, failures: u32) -> Self {
        Self { failures_left: Mutex::new(HashMap::from([(key.to_string(), failures)])) }
    }
}

#[async_trait]
impl UpstreamExecutor for FlakyExecutor {
    async fn run(&self, session_key: &str, _org_id: Option<&str>) -> ExecutionOutcome {
        let mut failures = self.failures_left.lock();
        match failures.get_mut(session_key) {
            Some(left) if *left > 0 => {
                *left -= 1;
                ExecutionOutcome::failure(503, "service unavailable")
            },
            _ => ExecutionOutcome::success(200),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_driver_fails_over_and_pool_state_reflects_it() {
    let sessions = vec![
        SessionInfo::new("sk-ant-aaa", None),
        SessionInfo::new("sk-ant-bbb", None),
        SessionInfo::new("sk-ant-ccc", None),
    ];
    let config = SchedulerConfig {
        enabled: true,
        strategy: StrategyKind::RoundRobin,
        ..SchedulerConfig::default()
    };
    let scheduler = Arc::new(SessionScheduler::new(sessions, config));
    let driver = RequestDriver::new(Arc::clone(&scheduler));

    let executor = FlakyExecutor::failing("sk-ant-aaa", 10);
    let report = driver
        .drive(&executor, &CancellationToken::new())
        .await
        .expect("second credential should have served the request");

    assert_eq!(report.attempts, 2);
    assert_ne!(report.session_key, "sk-ant-aaa");

    let rows = scheduler.list_health();
    let failed = rows.iter().find(|r| r.session_key == "sk-ant-aaa").expect("row exists");
    assert_eq!(failed.status, SessionStatus::Cooling);
    assert_eq!(failed.error_count, 1);

    let stats = scheduler.stats();
    assert_eq!(stats.total_requests, 2);
    assert_eq!(stats.successful_requests, 1);
    assert_eq!(stats.failed_requests, 1);

    // Another request goes straight to a healthy credential.
    let report = driver
        .drive(&executor, &CancellationToken::new())
        .await
        .expect("healthy pool serves immediately");
    assert_eq!(report.attempts, 1);
    assert_ne!(report.session_key, "sk-ant-aaa");
}

#[tokio::test]
async fn test_web_client_conversation_flow() {
    let server = MockServer::start().await;
    std::env::set_var("RELAY_UPSTREAM_URL", server.uri());

    Mock::given(method("GET"))
        .and(path("/organizations"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!([{ "uuid": "org-123", "name": "test" }])),
        )
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/organizations/org-123/chat_conversations"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({})))
        .mount(&server)
        .await;

    let sse_body = concat!(
        "data: {\"type\":\"completion\",\"completion\":\"Hello\"}\n\n",
        "data: {\"type\":\"completion\",\"completion\":\" world\"}\n\n",
    );
    Mock::given(method("POST"))
        .and(path_regex(r"/organizations/org-123/chat_conversations/.+/completion"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body, "text/event-stream"),
        )
        .mount(&server)
        .await;

    Mock::given(method("DELETE"))
        .and(path_regex(r"/organizations/org-123/chat_conversations/.+"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let mut client = ClaudeWebClient::new(
        "sk-ant-test-key",
        None,
        "claude-sonnet-4-20250514",
        false,
        None,
    )
    .expect("client builds");

    let org = client.fetch_org_id().await.expect("org lookup");
    assert_eq!(org, "org-123");
    client.set_org_id(org);

    let conversation = client.create_conversation().await.expect("conversation created");

    let response = client
        .send_completion(&conversation, "Human: hi\n\n", Vec::new(), Vec::new())
        .await
        .expect("completion accepted");

    let mut parser = SseParser::new();
    let mut text = String::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        for event in parser.push(&chunk.expect("chunk")) {
            match event {
                CompletionEvent::Delta(delta) => text.push_str(&delta),
                CompletionEvent::Error(message) => panic!("unexpected stream error: {message}"),
            }
        }
    }
    assert_eq!(text, "Hello world");

    client.delete_conversation(&conversation).await.expect("cleanup");

    std::env::remove_var("RELAY_UPSTREAM_URL");
}
