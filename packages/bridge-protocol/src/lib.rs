//! Wire protocol for the bridge-ws gateway.
//!
//! Inbound frames are validated by hand over `serde_json::Value` so the
//! error message a client sees is determined by a fixed evaluation order.
//! Outbound frames are plain serde enums tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MAX_PROMPT_BYTES: usize = 512 * 1024;
pub const MAX_SYSTEM_PROMPT_BYTES: usize = 64 * 1024;
pub const MAX_PROJECT_ID_CHARS: usize = 128;
pub const MAX_IMAGES: usize = 4;
pub const MAX_IMAGE_DATA_BYTES: usize = 10 * 1024 * 1024;
const MAX_TYPE_PREVIEW_CHARS: usize = 50;

pub const PROTOCOL_VERSION: &str = "2.0";

const ALLOWED_IMAGE_TYPES: &[&str] = &["image/png", "image/jpeg", "image/gif", "image/webp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Claude,
    Codex,
    Ollama,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Claude => "claude",
            ProviderKind::Codex => "codex",
            ProviderKind::Ollama => "ollama",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "claude" => Some(ProviderKind::Claude),
            "codex" => Some(ProviderKind::Codex),
            "ollama" => Some(ProviderKind::Ollama),
            _ => None,
        }
    }

    pub fn all() -> &'static [ProviderKind] {
        &[ProviderKind::Claude, ProviderKind::Codex, ProviderKind::Ollama]
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageAttachment {
    pub media_type: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptRequest {
    pub prompt: String,
    pub request_id: String,
    pub provider: ProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageAttachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Prompt(PromptRequest),
    Cancel(CancelRequest),
}

/// Frames the gateway writes back to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Connected {
        version: String,
        agent: String,
    },
    Chunk {
        content: String,
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        thinking: bool,
    },
    Complete {
        #[serde(rename = "requestId")]
        request_id: String,
    },
    Error {
        message: String,
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ServerFrame {
    pub fn connected(agent: impl Into<String>) -> Self {
        ServerFrame::Connected {
            version: PROTOCOL_VERSION.to_string(),
            agent: agent.into(),
        }
    }

    pub fn chunk(content: impl Into<String>, request_id: impl Into<String>, thinking: bool) -> Self {
        ServerFrame::Chunk {
            content: content.into(),
            request_id: request_id.into(),
            thinking,
        }
    }

    pub fn complete(request_id: impl Into<String>) -> Self {
        ServerFrame::Complete {
            request_id: request_id.into(),
        }
    }

    pub fn error(message: impl Into<String>, request_id: Option<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
            request_id,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("server frames serialize to JSON")
    }
}

/// Validates one inbound text frame.
///
/// The `Err` string is the exact human-readable message sent back to the
/// client; checks run in a fixed order so the first violation wins.
pub fn parse_client_frame(text: &str) -> Result<ClientFrame, String> {
    let value: Value = serde_json::from_str(text).map_err(|_| "Invalid JSON".to_string())?;
    let object = value
        .as_object()
        .ok_or_else(|| "Message must be a JSON object".to_string())?;
    let frame_type = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| "Missing or invalid 'type' field".to_string())?;

    match frame_type {
        "prompt" => parse_prompt(object).map(ClientFrame::Prompt),
        "cancel" => parse_cancel(object).map(ClientFrame::Cancel),
        other => {
            let preview: String = other.chars().take(MAX_TYPE_PREVIEW_CHARS).collect();
            Err(format!("Unknown message type: {preview}"))
        }
    }
}

fn parse_prompt(object: &serde_json::Map<String, Value>) -> Result<PromptRequest, String> {
    let prompt = object
        .get("prompt")
        .and_then(Value::as_str)
        .filter(|prompt| !prompt.is_empty())
        .ok_or_else(|| "Missing or empty 'prompt' field".to_string())?;
    if prompt.len() > MAX_PROMPT_BYTES {
        return Err("Prompt exceeds maximum size of 512 KiB".to_string());
    }

    let request_id = object
        .get("requestId")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| "Missing or empty 'requestId' field".to_string())?;

    let system_prompt = match object.get("systemPrompt").and_then(Value::as_str) {
        Some(system) if system.len() > MAX_SYSTEM_PROMPT_BYTES => {
            return Err("System prompt exceeds maximum size of 64 KiB".to_string());
        }
        Some(system) => Some(system.to_string()),
        None => None,
    };

    let project_id = match object.get("projectId").and_then(Value::as_str) {
        Some(project) if project.chars().count() > MAX_PROJECT_ID_CHARS => {
            return Err("Project id exceeds maximum length of 128 characters".to_string());
        }
        Some(project) if !is_valid_project_id(project) => {
            return Err(
                "Project id may only contain letters, digits, '.', '_' and '-'".to_string(),
            );
        }
        Some(project) => Some(project.to_string()),
        None => None,
    };

    let provider = match object.get("provider").and_then(Value::as_str) {
        Some(tag) => ProviderKind::parse(tag).ok_or_else(|| {
            let supported: Vec<&str> = ProviderKind::all()
                .iter()
                .map(|provider| provider.as_str())
                .collect();
            format!(
                "Unknown provider: {tag}. Supported providers: {}",
                supported.join(", ")
            )
        })?,
        None => ProviderKind::Claude,
    };

    let images = parse_images(object.get("images"))?;

    let thinking_tokens = object
        .get("thinkingTokens")
        .and_then(Value::as_u64)
        .filter(|_| provider == ProviderKind::Claude);

    Ok(PromptRequest {
        prompt: prompt.to_string(),
        request_id: request_id.to_string(),
        provider,
        model: object
            .get("model")
            .and_then(Value::as_str)
            .map(|model| model.to_string()),
        system_prompt,
        project_id,
        thinking_tokens,
        images,
    })
}

fn parse_images(value: Option<&Value>) -> Result<Vec<ImageAttachment>, String> {
    let entries = match value.and_then(Value::as_array) {
        Some(entries) if !entries.is_empty() => entries,
        _ => return Ok(Vec::new()),
    };
    if entries.len() > MAX_IMAGES {
        return Err(format!("Too many images: maximum is {MAX_IMAGES}"));
    }

    let mut images = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let media_type = entry.get("media_type").and_then(Value::as_str);
        let data = entry.get("data").and_then(Value::as_str);
        let (media_type, data) = match (media_type, data) {
            (Some(media_type), Some(data)) => (media_type, data),
            _ => return Err(format!("Invalid image attachment at index {index}")),
        };
        if !ALLOWED_IMAGE_TYPES.contains(&media_type) {
            return Err(format!("Unsupported image media type: {media_type}"));
        }
        if data.len() > MAX_IMAGE_DATA_BYTES {
            return Err(format!("Image at index {index} exceeds maximum size of 10 MiB"));
        }
        images.push(ImageAttachment {
            media_type: media_type.to_string(),
            data: data.to_string(),
        });
    }
    Ok(images)
}

fn parse_cancel(object: &serde_json::Map<String, Value>) -> Result<CancelRequest, String> {
    let request_id = object
        .get("requestId")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| "Missing or empty 'requestId' field in cancel message".to_string())?;
    Ok(CancelRequest {
        request_id: request_id.to_string(),
    })
}

fn is_valid_project_id(project: &str) -> bool {
    !project.is_empty()
        && project
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse_err(value: Value) -> String {
        parse_client_frame(&value.to_string()).expect_err("expected rejection")
    }

    fn parse_prompt_ok(value: Value) -> PromptRequest {
        match parse_client_frame(&value.to_string()).expect("expected prompt") {
            ClientFrame::Prompt(prompt) => prompt,
            other => panic!("expected prompt frame, got {other:?}"),
        }
    }

    #[test]
    fn rejects_invalid_json() {
        let err = parse_client_frame("{not json").expect_err("expected rejection");
        assert_eq!(err, "Invalid JSON");
    }

    #[test]
    fn rejects_non_object_payloads() {
        assert_eq!(parse_err(json!([1, 2, 3])), "Message must be a JSON object");
        assert_eq!(parse_err(json!("prompt")), "Message must be a JSON object");
    }

    #[test]
    fn rejects_missing_type() {
        assert_eq!(parse_err(json!({})), "Missing or invalid 'type' field");
        assert_eq!(
            parse_err(json!({ "type": 42 })),
            "Missing or invalid 'type' field"
        );
    }

    #[test]
    fn rejects_unknown_type_with_truncated_preview() {
        let err = parse_err(json!({ "type": "shutdown" }));
        assert_eq!(err, "Unknown message type: shutdown");

        let long = "x".repeat(80);
        let err = parse_err(json!({ "type": long }));
        assert_eq!(err, format!("Unknown message type: {}", "x".repeat(50)));
    }

    #[test]
    fn rejects_missing_prompt_before_missing_request_id() {
        let err = parse_err(json!({ "type": "prompt", "requestId": "r1" }));
        assert_eq!(err, "Missing or empty 'prompt' field");
    }

    #[test]
    fn prompt_size_boundary() {
        let at_limit = "a".repeat(MAX_PROMPT_BYTES);
        let prompt = parse_prompt_ok(json!({
            "type": "prompt",
            "prompt": at_limit,
            "requestId": "r1",
        }));
        assert_eq!(prompt.prompt.len(), MAX_PROMPT_BYTES);

        let over = "a".repeat(MAX_PROMPT_BYTES + 1);
        let err = parse_err(json!({
            "type": "prompt",
            "prompt": over,
            "requestId": "r1",
        }));
        assert_eq!(err, "Prompt exceeds maximum size of 512 KiB");
    }

    #[test]
    fn rejects_missing_request_id() {
        let err = parse_err(json!({ "type": "prompt", "prompt": "hi" }));
        assert_eq!(err, "Missing or empty 'requestId' field");
        let err = parse_err(json!({ "type": "prompt", "prompt": "hi", "requestId": "" }));
        assert_eq!(err, "Missing or empty 'requestId' field");
    }

    #[test]
    fn system_prompt_boundary() {
        let at_limit = "s".repeat(MAX_SYSTEM_PROMPT_BYTES);
        parse_prompt_ok(json!({
            "type": "prompt",
            "prompt": "hi",
            "requestId": "r1",
            "systemPrompt": at_limit,
        }));

        let over = "s".repeat(MAX_SYSTEM_PROMPT_BYTES + 1);
        let err = parse_err(json!({
            "type": "prompt",
            "prompt": "hi",
            "requestId": "r1",
            "systemPrompt": over,
        }));
        assert_eq!(err, "System prompt exceeds maximum size of 64 KiB");
    }

    #[test]
    fn project_id_boundaries() {
        let at_limit = "p".repeat(MAX_PROJECT_ID_CHARS);
        let prompt = parse_prompt_ok(json!({
            "type": "prompt",
            "prompt": "hi",
            "requestId": "r1",
            "projectId": at_limit,
        }));
        assert_eq!(prompt.project_id.unwrap().len(), MAX_PROJECT_ID_CHARS);

        let over = "p".repeat(MAX_PROJECT_ID_CHARS + 1);
        let err = parse_err(json!({
            "type": "prompt",
            "prompt": "hi",
            "requestId": "r1",
            "projectId": over,
        }));
        assert_eq!(err, "Project id exceeds maximum length of 128 characters");

        let err = parse_err(json!({
            "type": "prompt",
            "prompt": "hi",
            "requestId": "r1",
            "projectId": "../etc",
        }));
        assert_eq!(
            err,
            "Project id may only contain letters, digits, '.', '_' and '-'"
        );
    }

    #[test]
    fn unknown_provider_lists_supported_tags() {
        let err = parse_err(json!({
            "type": "prompt",
            "prompt": "hi",
            "requestId": "r1",
            "provider": "gpt4all",
        }));
        assert_eq!(
            err,
            "Unknown provider: gpt4all. Supported providers: claude, codex, ollama"
        );
    }

    #[test]
    fn provider_defaults_to_claude() {
        let prompt = parse_prompt_ok(json!({
            "type": "prompt",
            "prompt": "hi",
            "requestId": "r1",
        }));
        assert_eq!(prompt.provider, ProviderKind::Claude);
    }

    #[test]
    fn thinking_tokens_only_apply_to_claude() {
        let prompt = parse_prompt_ok(json!({
            "type": "prompt",
            "prompt": "hi",
            "requestId": "r1",
            "thinkingTokens": 2048,
        }));
        assert_eq!(prompt.thinking_tokens, Some(2048));

        let prompt = parse_prompt_ok(json!({
            "type": "prompt",
            "prompt": "hi",
            "requestId": "r1",
            "provider": "ollama",
            "thinkingTokens": 2048,
        }));
        assert_eq!(prompt.thinking_tokens, None);

        // Negative budgets are ignored rather than rejected.
        let prompt = parse_prompt_ok(json!({
            "type": "prompt",
            "prompt": "hi",
            "requestId": "r1",
            "thinkingTokens": -5,
        }));
        assert_eq!(prompt.thinking_tokens, None);
    }

    #[test]
    fn image_count_boundary() {
        let image = json!({ "media_type": "image/png", "data": "aGVsbG8=" });
        let four: Vec<Value> = std::iter::repeat(image.clone()).take(4).collect();
        let prompt = parse_prompt_ok(json!({
            "type": "prompt",
            "prompt": "hi",
            "requestId": "r1",
            "images": four,
        }));
        assert_eq!(prompt.images.len(), 4);

        let five: Vec<Value> = std::iter::repeat(image).take(5).collect();
        let err = parse_err(json!({
            "type": "prompt",
            "prompt": "hi",
            "requestId": "r1",
            "images": five,
        }));
        assert_eq!(err, "Too many images: maximum is 4");
    }

    #[test]
    fn image_data_size_boundary() {
        let at_limit = "A".repeat(MAX_IMAGE_DATA_BYTES);
        parse_prompt_ok(json!({
            "type": "prompt",
            "prompt": "hi",
            "requestId": "r1",
            "images": [{ "media_type": "image/jpeg", "data": at_limit }],
        }));

        let over = "A".repeat(MAX_IMAGE_DATA_BYTES + 1);
        let err = parse_err(json!({
            "type": "prompt",
            "prompt": "hi",
            "requestId": "r1",
            "images": [{ "media_type": "image/jpeg", "data": over }],
        }));
        assert_eq!(err, "Image at index 0 exceeds maximum size of 10 MiB");
    }

    #[test]
    fn rejects_unsupported_image_media_type() {
        let err = parse_err(json!({
            "type": "prompt",
            "prompt": "hi",
            "requestId": "r1",
            "images": [{ "media_type": "image/tiff", "data": "aGVsbG8=" }],
        }));
        assert_eq!(err, "Unsupported image media type: image/tiff");
    }

    #[test]
    fn rejects_malformed_image_entries() {
        let err = parse_err(json!({
            "type": "prompt",
            "prompt": "hi",
            "requestId": "r1",
            "images": [{ "media_type": "image/png" }],
        }));
        assert_eq!(err, "Invalid image attachment at index 0");
    }

    #[test]
    fn unknown_optional_fields_are_ignored() {
        let prompt = parse_prompt_ok(json!({
            "type": "prompt",
            "prompt": "hi",
            "requestId": "r1",
            "temperature": 0.7,
            "systemPrompt": 12,
        }));
        assert_eq!(prompt.system_prompt, None);
    }

    #[test]
    fn cancel_requires_request_id() {
        let err = parse_err(json!({ "type": "cancel" }));
        assert_eq!(err, "Missing or empty 'requestId' field in cancel message");

        let frame = parse_client_frame(&json!({ "type": "cancel", "requestId": "r9" }).to_string())
            .expect("cancel parses");
        assert_eq!(
            frame,
            ClientFrame::Cancel(CancelRequest {
                request_id: "r9".to_string()
            })
        );
    }

    #[test]
    fn canonical_frames_round_trip() {
        let canonical = json!({
            "type": "prompt",
            "prompt": "hello",
            "requestId": "r1",
            "provider": "codex",
            "model": "o4-mini",
            "systemPrompt": "be terse",
            "projectId": "proj-1",
            "images": [{ "media_type": "image/png", "data": "aGVsbG8=" }],
        });
        let frame = parse_client_frame(&canonical.to_string()).expect("parses");
        let round_tripped = serde_json::to_value(&frame).expect("serializes");
        assert_eq!(round_tripped, canonical);

        let cancel = json!({ "type": "cancel", "requestId": "r1" });
        let frame = parse_client_frame(&cancel.to_string()).expect("parses");
        assert_eq!(serde_json::to_value(&frame).expect("serializes"), cancel);
    }

    #[test]
    fn server_frame_serialization() {
        assert_eq!(
            ServerFrame::connected("bridge-ws").to_json(),
            r#"{"type":"connected","version":"2.0","agent":"bridge-ws"}"#
        );
        assert_eq!(
            ServerFrame::chunk("hi", "r1", false).to_json(),
            r#"{"type":"chunk","content":"hi","requestId":"r1"}"#
        );
        assert_eq!(
            ServerFrame::chunk("hmm", "r1", true).to_json(),
            r#"{"type":"chunk","content":"hmm","requestId":"r1","thinking":true}"#
        );
        assert_eq!(
            ServerFrame::complete("r1").to_json(),
            r#"{"type":"complete","requestId":"r1"}"#
        );
        assert_eq!(
            ServerFrame::error("boom", Some("r1".to_string())).to_json(),
            r#"{"type":"error","message":"boom","requestId":"r1"}"#
        );
        assert_eq!(
            ServerFrame::error("bad frame", None).to_json(),
            r#"{"type":"error","message":"bad frame"}"#
        );
    }
}
