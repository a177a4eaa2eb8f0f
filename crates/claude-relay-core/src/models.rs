//! OpenAI wire types and message flattening.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Inbound chat-completions request. Unknown fields are ignored; upstream
/// conversations carry none of the sampling knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
}

/// OpenAI message content: plain string or typed parts.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// Messages flattened into one upstream prompt plus extracted inline images.
#[derive(Debug, Clone, Default)]
pub struct FlattenedPrompt {
    pub prompt: String,
    /// `data:` URLs lifted out of image parts, uploaded separately.
    pub images: Vec<String>,
}

/// Flattens an OpenAI message list into a single conversational prompt.
pub fn flatten_messages(messages: &[ChatMessage], no_role_prefix: bool) -> FlattenedPrompt {
    let mut flattened = FlattenedPrompt::default();

    for message in messages {
        let mut text = String::new();
        match &message.content {
            MessageContent::Text(value) => text.push_str(value),
            MessageContent::Parts(parts) => {
                for part in parts {
                    match part {
                        ContentPart::Text { text: value } => {
                            if !text.is_empty() {
                                text.push('\n');
                            }
                            text.push_str(value);
                        },
                        ContentPart::ImageUrl { image_url } => {
                            if image_url.url.starts_with("data:") {
                                flattened.images.push(image_url.url.clone());
                            }
                        },
                    }
                }
            },
        }

        if text.is_empty() {
            continue;
        }

        if no_role_prefix {
            flattened.prompt.push_str(&text);
        } else {
            let prefix = match message.role.as_str() {
                "assistant" => "Assistant",
                "system" => "System",
                _ => "Human",
            };
            flattened.prompt.push_str(prefix);
            flattened.prompt.push_str(": ");
            flattened.prompt.push_str(&text);
        }
        flattened.prompt.push_str("\n\n");
    }

    flattened
}

// ===== Responses =====

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ResponseChoice>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseChoice {
    pub index: u32,
    pub message: ResponseMessage,
    pub finish_reason: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatCompletionResponse {
    pub fn new(id: String, model: &str, content: String) -> Self {
        Self {
            id,
            object: "chat.completion",
            created: Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![ResponseChoice {
                index: 0,
                message: ResponseMessage { role: "assistant", content },
                finish_reason: "stop",
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ChatCompletionChunk {
    fn new(id: &str, model: &str, delta: ChunkDelta, finish_reason: Option<&'static str>) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk",
            created: Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![ChunkChoice { index: 0, delta, finish_reason }],
        }
    }

    pub fn role(id: &str, model: &str) -> Self {
        Self::new(id, model, ChunkDelta { role: Some("assistant"), ..Default::default() }, None)
    }

    pub fn content(id: &str, model: &str, text: String) -> Self {
        Self::new(id, model, ChunkDelta { content: Some(text), ..Default::default() }, None)
    }

    pub fn finish(id: &str, model: &str) -> Self {
        Self::new(id, model, ChunkDelta::default(), Some("stop"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_message(role: &str, text: &str) -> ChatMessage {
        ChatMessage { role: role.to_string(), content: MessageContent::Text(text.to_string()) }
    }

    #[test]
    fn test_flatten_adds_role_prefixes() {
        let messages = vec![
            text_message("system", "Be terse."),
            text_message("user", "Hi"),
            text_message("assistant", "Hello"),
        ];
        let flattened = flatten_messages(&messages, false);
        assert_eq!(flattened.prompt, "System: Be terse.\n\nHuman: Hi\n\nAssistant: Hello\n\n");
    }

    #[test]
    fn test_flatten_without_prefixes() {
        let messages = vec![text_message("user", "Hi")];
        let flattened = flatten_messages(&messages, true);
        assert_eq!(flattened.prompt, "Hi\n\n");
    }

    #[test]
    fn test_flatten_extracts_inline_images() {
        let messages = vec![ChatMessage {
            role: "user".to_string(),
            content: MessageContent::Parts(vec![
                ContentPart::Text { text: "what is this".to_string() },
                ContentPart::ImageUrl {
                    image_url: ImageUrl { url: "data:image/png;base64,AAAA".to_string() },
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl { url: "https://example.com/a.png".to_string() },
                },
            ]),
        }];
        let flattened = flatten_messages(&messages, false);
        assert_eq!(flattened.prompt, "Human: what is this\n\n");
        assert_eq!(flattened.images, vec!["data:image/png;base64,AAAA"]);
    }

    #[test]
    fn test_content_parses_string_or_parts() {
        let plain: ChatMessage =
            serde_json::from_str(r#"{"role":"user","content":"hello"}"#).unwrap();
        assert!(matches!(plain.content, MessageContent::Text(ref t) if t == "hello"));

        let parts: ChatMessage = serde_json::from_str(
            r#"{"role":"user","content":[{"type":"text","text":"hello"}]}"#,
        )
        .unwrap();
        assert!(matches!(parts.content, MessageContent::Parts(ref p) if p.len() == 1));
    }
}
