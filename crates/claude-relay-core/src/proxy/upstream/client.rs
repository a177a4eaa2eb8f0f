//! reqwest client for the claude.ai web API.

use base64::Engine;
use reqwest::{header, Client, Response};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_BASE_URL: &str = "https://claude.ai/api";

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Root parent for the first message of a fresh conversation.
const ROOT_PARENT_UUID: &str = "00000000-0000-4000-8000-000000000000";

fn resolve_base_url() -> String {
    match std::env::var("RELAY_UPSTREAM_URL") {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().trim_end_matches('/').to_string(),
        _ => DEFAULT_BASE_URL.to_string(),
    }
}

/// Upstream failure carrying the HTTP status (0 for transport errors) and a
/// message the classifier can inspect.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct UpstreamError {
    pub status: u16,
    pub message: String,
}

impl UpstreamError {
    fn transport(err: &reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            format!("request timeout: {err}")
        } else if err.is_connect() {
            format!("connection error: {err}")
        } else {
            format!("network error: {err}")
        };
        Self { status: 0, message }
    }

    async fn from_response(response: Response) -> Self {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(200).collect();
        Self { status, message: format!("upstream returned {status}: {snippet}") }
    }
}

/// One credential's view of the claude.ai web API.
#[derive(Debug, Clone)]
pub struct ClaudeWebClient {
    http: Client,
    base_url: String,
    session_key: String,
    org_id: Option<String>,
    model: String,
    thinking: bool,
}

impl ClaudeWebClient {
    pub fn new(
        session_key: &str,
        org_id: Option<&str>,
        model: &str,
        thinking: bool,
        proxy: Option<&str>,
    ) -> Result<Self, UpstreamError> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .timeout(Duration::from_secs(600))
            .user_agent(USER_AGENT);

        if let Some(proxy_url) = proxy.filter(|p| !p.is_empty()) {
            let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| UpstreamError {
                status: 0,
                message: format!("invalid proxy url: {e}"),
            })?;
            builder = builder.proxy(proxy);
        }

        let http = builder.build().map_err(|e| UpstreamError {
            status: 0,
            message: format!("failed to build http client: {e}"),
        })?;

        Ok(Self {
            http,
            base_url: resolve_base_url(),
            session_key: session_key.to_string(),
            org_id: org_id.map(str::to_string),
            model: model.to_string(),
            thinking,
        })
    }

    pub fn org_id(&self) -> Option<&str> {
        self.org_id.as_deref()
    }

    pub fn set_org_id(&mut self, org_id: String) {
        self.org_id = Some(org_id);
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header(header::COOKIE, format!("sessionKey={}", self.session_key))
            .header(header::REFERER, "https://claude.ai/chats")
            .header(header::ORIGIN, "https://claude.ai")
    }

    fn org(&self) -> Result<&str, UpstreamError> {
        self.org_id.as_deref().ok_or_else(|| UpstreamError {
            status: 0,
            message: "organization id not resolved".to_string(),
        })
    }

    /// Looks up the first organization owned by this session.
    pub async fn fetch_org_id(&self) -> Result<String, UpstreamError> {
        let url = format!("{}/organizations", self.base_url);
        let response = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .map_err(|e| UpstreamError::transport(&e))?;

        if !response.status().is_success() {
            return Err(UpstreamError::from_response(response).await);
        }

        let orgs: Value = response.json().await.map_err(|e| UpstreamError::transport(&e))?;
        orgs.as_array()
            .and_then(|list| list.first())
            .and_then(|org| org.get("uuid"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| UpstreamError {
                status: 0,
                message: "no organization found for session".to_string(),
            })
    }

    /// Creates a fresh conversation and returns its uuid.
    pub async fn create_conversation(&self) -> Result<String, UpstreamError> {
        let org = self.org()?;
        let conversation_id = uuid::Uuid::new_v4().to_string();
        let url = format!("{}/organizations/{}/chat_conversations", self.base_url, org);

        let response = self
            .request(reqwest::Method::POST, url)
            .json(&json!({ "uuid": conversation_id, "name": "" }))
            .send()
            .await
            .map_err(|e| UpstreamError::transport(&e))?;

        if !response.status().is_success() {
            return Err(UpstreamError::from_response(response).await);
        }
        Ok(conversation_id)
    }

    /// Sends the completion request and hands back the streaming response.
    /// Callers consume the body as SSE via [`super::SseParser`].
    pub async fn send_completion(
        &self,
        conversation_id: &str,
        prompt: &str,
        attachments: Vec<Value>,
        files: Vec<String>,
    ) -> Result<Response, UpstreamError> {
        let org = self.org()?;
        let url = format!(
            "{}/organizations/{}/chat_conversations/{}/completion",
            self.base_url, org, conversation_id
        );

        let mut payload = json!({
            "prompt": prompt,
            "parent_message_uuid": ROOT_PARENT_UUID,
            "timezone": "UTC",
            "model": self.model,
            "attachments": attachments,
            "files": files,
            "rendering_mode": "messages",
        });
        if self.thinking {
            payload["paprika_mode"] = json!("extended");
        }

        let response = self
            .request(reqwest::Method::POST, url)
            .header(header::ACCEPT, "text/event-stream")
            .json(&payload)
            .send()
            .await
            .map_err(|e| UpstreamError::transport(&e))?;

        if !response.status().is_success() {
            return Err(UpstreamError::from_response(response).await);
        }
        Ok(response)
    }

    /// Deletes a conversation; used for post-request cleanup.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<(), UpstreamError> {
        let org = self.org()?;
        let url = format!(
            "{}/organizations/{}/chat_conversations/{}",
            self.base_url, org, conversation_id
        );

        let response = self
            .request(reqwest::Method::DELETE, url)
            .send()
            .await
            .map_err(|e| UpstreamError::transport(&e))?;

        if !response.status().is_success() {
            return Err(UpstreamError::from_response(response).await);
        }
        Ok(())
    }

    /// Uploads one inline `data:` image and returns its file uuid.
    pub async fn upload_image(&self, data_url: &str) -> Result<String, UpstreamError> {
        let org = self.org()?;
        let (media_type, encoded) = split_data_url(data_url)?;
        let bytes =
            base64::engine::general_purpose::STANDARD.decode(encoded).map_err(|e| {
                UpstreamError { status: 0, message: format!("invalid image payload: {e}") }
            })?;

        let extension = media_type.strip_prefix("image/").unwrap_or("png");
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(format!("image.{extension}"))
            .mime_str(media_type)
            .map_err(|e| UpstreamError {
                status: 0,
                message: format!("invalid image media type: {e}"),
            })?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let url = format!("{}/organizations/{}/upload", self.base_url, org);
        let response = self
            .request(reqwest::Method::POST, url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| UpstreamError::transport(&e))?;

        if !response.status().is_success() {
            return Err(UpstreamError::from_response(response).await);
        }

        let body: Value = response.json().await.map_err(|e| UpstreamError::transport(&e))?;
        body.get("file_uuid")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| UpstreamError {
                status: 0,
                message: "upload response missing file_uuid".to_string(),
            })
    }

    /// Wraps an oversized prompt into a plain-text attachment, replacing it
    /// with a short instruction.
    pub fn big_context_attachment(prompt: &str) -> (String, Value) {
        let attachment = json!({
            "file_name": "context.txt",
            "file_type": "text/plain",
            "file_size": prompt.len(),
            "extracted_content": prompt,
        });
        (
            "Please answer based on the conversation in the attached context file.".to_string(),
            attachment,
        )
    }
}

fn split_data_url(data_url: &str) -> Result<(&str, &str), UpstreamError> {
    let invalid = || UpstreamError {
        status: 0,
        message: "invalid data url for inline image".to_string(),
    };
    let rest = data_url.strip_prefix("data:").ok_or_else(invalid)?;
    let (meta, encoded) = rest.split_once(',').ok_or_else(invalid)?;
    let media_type = meta.split(';').next().filter(|m| !m.is_empty()).ok_or_else(invalid)?;
    Ok((media_type, encoded))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_data_url() {
        let (media_type, encoded) = split_data_url("data:image/png;base64,AAAA").unwrap();
        assert_eq!(media_type, "image/png");
        assert_eq!(encoded, "AAAA");

        assert!(split_data_url("https://example.com/a.png").is_err());
    }

    #[test]
    fn test_big_context_attachment_carries_prompt() {
        let (prompt, attachment) = ClaudeWebClient::big_context_attachment("long history");
        assert!(prompt.contains("context file"));
        assert_eq!(attachment["extracted_content"], "long history");
        assert_eq!(attachment["file_type"], "text/plain");
    }
}
