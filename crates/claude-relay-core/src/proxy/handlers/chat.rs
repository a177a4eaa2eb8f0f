//! Chat-completions handling.
//!
//! Each inbound request becomes a [`ConversationExecutor`] that drives one
//! claude.ai conversation per attempt: resolve the organization, upload
//! inline images, create the conversation, relay the completion SSE, and
//! clean the conversation up afterwards. The scheduler's [`RequestDriver`]
//! retries the executor across credentials; the mirror path runs it once
//! with the caller's own credential.

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::{
    flatten_messages, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse,
};
use crate::proxy::server::{AppState, RuntimeSettings};
use crate::proxy::upstream::{ClaudeWebClient, CompletionEvent, SseParser, UpstreamError};
use crate::scheduler::{DriveError, ExecutionOutcome, RequestDriver, SessionInfo, UpstreamExecutor};

pub(crate) const DEFAULT_MODEL: &str = "claude-3-7-sonnet-20250219";

const DELETE_RETRIES: u32 = 3;

pub async fn handle_chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    let settings = state.settings.read().await.clone();

    if !settings.scheduler_enabled || state.scheduler.session_count() == 0 {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Session scheduler is not enabled");
    }

    chat_response(state, settings, request, None).await
}

/// Mirror path: the caller supplies its own credential in the Authorization
/// header (`sessionKey` or `sessionKey:orgID`) and bypasses the pool.
pub async fn handle_mirror_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    let settings = state.settings.read().await.clone();
    if !settings.enable_mirror_api {
        return error_response(StatusCode::FORBIDDEN, "Mirror API is not enabled");
    }

    let Some(session) = session_from_auth_header(&headers) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing session key in authorization");
    };

    chat_response(state, settings, request, Some(session)).await
}

async fn chat_response(
    state: AppState,
    settings: RuntimeSettings,
    request: ChatCompletionRequest,
    mirror_session: Option<SessionInfo>,
) -> Response {
    if request.messages.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "No messages provided");
    }

    let requested = if request.model.is_empty() { DEFAULT_MODEL } else { request.model.as_str() };
    let (model, thinking) = split_thinking_model(requested);
    let flattened = flatten_messages(&request.messages, settings.no_role_prefix);

    let chunk_id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
    let model_name = model.to_string();

    let (tx, mut rx) = mpsc::channel::<Bytes>(32);
    let executor = Arc::new(ConversationExecutor {
        model: model_name.clone(),
        thinking,
        prompt: flattened.prompt,
        images: flattened.images,
        stream: request.stream,
        chunk_id: chunk_id.clone(),
        proxy: settings.proxy.clone(),
        chat_delete: settings.chat_delete,
        max_history: settings.max_chat_history_length,
        tx,
        collected: Mutex::new(String::new()),
    });

    let cancel = CancellationToken::new();
    // The task owns the only executor handle: when it finishes, the chunk
    // sender drops and `rx` sees end-of-stream after the buffered chunks.
    let task = {
        let scheduler = Arc::clone(&state.scheduler);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = match mirror_session {
                Some(session) => {
                    let outcome =
                        executor.run(&session.session_key, session.org_id.as_deref()).await;
                    if outcome.ok {
                        Ok(())
                    } else {
                        Err(outcome
                            .error
                            .unwrap_or_else(|| "Failed to process request".to_string()))
                    }
                },
                None => {
                    let driver = RequestDriver::new(scheduler);
                    driver
                        .drive(executor.as_ref(), &cancel)
                        .await
                        .map(|_| ())
                        .map_err(|e| drive_error_message(&e))
                },
            };
            result.map(|()| executor.collected.lock().clone())
        })
    };

    if request.stream {
        // The first relayed chunk commits the response; until then a failed
        // attempt can still be retried on another credential.
        match rx.recv().await {
            Some(first) => streaming_response(first, rx, cancel),
            None => match task.await {
                Ok(Ok(_)) => {
                    streaming_response(Bytes::from_static(b"data: [DONE]\n\n"), rx, cancel)
                },
                Ok(Err(message)) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &message),
                Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "request task failed"),
            },
        }
    } else {
        match task.await {
            Ok(Ok(content)) => {
                let response = ChatCompletionResponse::new(chunk_id, &model_name, content);
                Json(response).into_response()
            },
            Ok(Err(message)) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &message),
            Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "request task failed"),
        }
    }
}

fn streaming_response(
    first: Bytes,
    rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) -> Response {
    // Dropping the body (client disconnect) cancels any in-flight retries.
    struct CancelOnDrop(CancellationToken);
    impl Drop for CancelOnDrop {
        fn drop(&mut self) {
            self.0.cancel();
        }
    }

    let guard = CancelOnDrop(cancel);
    let rest = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        rx.recv().await.map(|bytes| (Ok::<Bytes, Infallible>(bytes), (rx, guard)))
    });
    let stream = futures::stream::once(async move { Ok::<Bytes, Infallible>(first) }).chain(rest);

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn drive_error_message(error: &DriveError) -> String {
    match error {
        DriveError::NoAvailableSession => "No available sessions".to_string(),
        DriveError::Exhausted { message, attempts, .. } => {
            format!("Failed to process request after {attempts} attempt(s): {message}")
        },
        DriveError::Cancelled => "Request cancelled".to_string(),
    }
}

pub(crate) fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Splits the `-think` suffix off a model id.
pub(crate) fn split_thinking_model(model: &str) -> (&str, bool) {
    match model.strip_suffix("-think") {
        Some(base) => (base, true),
        None => (model, false),
    }
}

fn session_from_auth_header(headers: &HeaderMap) -> Option<SessionInfo> {
    let auth = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = auth.strip_prefix("Bearer ").unwrap_or(auth).trim();
    if token.is_empty() {
        return None;
    }
    Some(match token.split_once(':') {
        Some((key, org)) => SessionInfo::new(key, Some(org.to_string())),
        None => SessionInfo::new(token, None),
    })
}

/// One inbound request's upstream work, retried across credentials by the
/// driver.
struct ConversationExecutor {
    model: String,
    thinking: bool,
    prompt: String,
    images: Vec<String>,
    stream: bool,
    chunk_id: String,
    proxy: Option<String>,
    chat_delete: bool,
    max_history: usize,
    tx: mpsc::Sender<Bytes>,
    collected: Mutex<String>,
}

#[async_trait]
impl UpstreamExecutor for ConversationExecutor {
    async fn run(&self, session_key: &str, org_id: Option<&str>) -> ExecutionOutcome {
        self.collected.lock().clear();

        let mut client = match ClaudeWebClient::new(
            session_key,
            org_id,
            &self.model,
            self.thinking,
            self.proxy.as_deref(),
        ) {
            Ok(client) => client,
            Err(e) => return ExecutionOutcome::failure(e.status, e.message),
        };

        let discovered_org = if org_id.is_none() {
            match client.fetch_org_id().await {
                Ok(org) => {
                    client.set_org_id(org.clone());
                    Some(org)
                },
                Err(e) => return ExecutionOutcome::failure(e.status, e.message),
            }
        } else {
            None
        };

        let mut files = Vec::new();
        for image in &self.images {
            match client.upload_image(image).await {
                Ok(file_uuid) => files.push(file_uuid),
                Err(e) => return ExecutionOutcome::failure(e.status, e.message),
            }
        }

        let (prompt, attachments) = if self.prompt.len() > self.max_history {
            tracing::info!(
                limit = self.max_history,
                "prompt exceeds history limit, sending as attachment"
            );
            let (prompt, attachment) = ClaudeWebClient::big_context_attachment(&self.prompt);
            (prompt, vec![attachment])
        } else {
            (self.prompt.clone(), Vec::new())
        };

        let conversation_id = match client.create_conversation().await {
            Ok(id) => id,
            Err(e) => return ExecutionOutcome::failure(e.status, e.message),
        };

        let result = self.relay(&client, &conversation_id, &prompt, attachments, files).await;

        if self.chat_delete || result.is_err() {
            spawn_cleanup(client.clone(), conversation_id);
        }

        match result {
            Ok(()) => match discovered_org {
                Some(org) => ExecutionOutcome::success_with_org(200, org),
                None => ExecutionOutcome::success(200),
            },
            Err(e) => ExecutionOutcome::failure(e.status, e.message),
        }
    }
}

impl ConversationExecutor {
    /// Streams the upstream completion, forwarding OpenAI-format chunks (or
    /// collecting text when not streaming). An error before the first
    /// client-visible byte is retryable; afterwards the stream just ends.
    async fn relay(
        &self,
        client: &ClaudeWebClient,
        conversation_id: &str,
        prompt: &str,
        attachments: Vec<Value>,
        files: Vec<String>,
    ) -> Result<(), UpstreamError> {
        let response = client.send_completion(conversation_id, prompt, attachments, files).await?;

        let mut parser = SseParser::new();
        let mut body = response.bytes_stream();
        let mut emitted = false;

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) if emitted => {
                    tracing::warn!("upstream stream interrupted after output began: {e}");
                    return Ok(());
                },
                Err(e) => return Err(UpstreamError { status: 0, message: format!("stream error: {e}") }),
            };

            for event in parser.push(&chunk) {
                match event {
                    CompletionEvent::Delta(text) => {
                        if self.stream {
                            if !emitted {
                                let role = ChatCompletionChunk::role(&self.chunk_id, &self.model);
                                if self.emit(&role).await.is_err() {
                                    return Ok(());
                                }
                            }
                            emitted = true;
                            let chunk =
                                ChatCompletionChunk::content(&self.chunk_id, &self.model, text);
                            if self.emit(&chunk).await.is_err() {
                                tracing::debug!("client disconnected, dropping stream");
                                return Ok(());
                            }
                        } else {
                            self.collected.lock().push_str(&text);
                        }
                    },
                    CompletionEvent::Error(message) => {
                        if emitted {
                            tracing::warn!("upstream error after output began: {message}");
                            break;
                        }
                        return Err(UpstreamError { status: 0, message });
                    },
                }
            }
        }

        if self.stream {
            if !emitted {
                let role = ChatCompletionChunk::role(&self.chunk_id, &self.model);
                let _ = self.emit(&role).await;
            }
            let finish = ChatCompletionChunk::finish(&self.chunk_id, &self.model);
            let _ = self.emit(&finish).await;
            let _ = self.tx.send(Bytes::from_static(b"data: [DONE]\n\n")).await;
        }
        Ok(())
    }

    async fn emit(&self, chunk: &ChatCompletionChunk) -> Result<(), ()> {
        let payload = serde_json::to_string(chunk).unwrap_or_default();
        self.tx
            .send(Bytes::from(format!("data: {payload}\n\n")))
            .await
            .map_err(|_| ())
    }
}

fn spawn_cleanup(client: ClaudeWebClient, conversation_id: String) {
    tokio::spawn(async move {
        for attempt in 1..=DELETE_RETRIES {
            match client.delete_conversation(&conversation_id).await {
                Ok(()) => {
                    tracing::debug!(conversation_id = %conversation_id, "conversation deleted");
                    return;
                },
                Err(e) => {
                    tracing::debug!(conversation_id = %conversation_id, attempt, "delete failed: {e}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                },
            }
        }
        tracing::warn!(conversation_id = %conversation_id, "conversation cleanup failed after retries");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_thinking_model() {
        assert_eq!(
            split_thinking_model("claude-sonnet-4-20250514-think"),
            ("claude-sonnet-4-20250514", true)
        );
        assert_eq!(
            split_thinking_model("claude-sonnet-4-20250514"),
            ("claude-sonnet-4-20250514", false)
        );
    }

    #[test]
    fn test_session_from_auth_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer sk-ant-key:org-1".parse().unwrap());
        let session = session_from_auth_header(&headers).unwrap();
        assert_eq!(session.session_key, "sk-ant-key");
        assert_eq!(session.org_id.as_deref(), Some("org-1"));

        headers.insert(header::AUTHORIZATION, "Bearer sk-ant-key".parse().unwrap());
        let session = session_from_auth_header(&headers).unwrap();
        assert_eq!(session.org_id, None);

        headers.remove(header::AUTHORIZATION);
        assert!(session_from_auth_header(&headers).is_none());
    }
}
