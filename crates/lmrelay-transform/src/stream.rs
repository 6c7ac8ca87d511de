//! Per-event translation of an upstream stream into the client's dialect.

use lmrelay_protocol::Dialect;
use lmrelay_protocol::openai::chat::{ChatCompletionChunk, ChunkDelta};
use serde_json::{Value, json};

use crate::error::TransformError;
use crate::outbound::ANTHROPIC_ID_PREFIX;

/// One SSE frame to send downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFrame {
    pub event: Option<String>,
    pub data: Value,
}

impl StreamFrame {
    fn data(data: Value) -> Self {
        Self { event: None, data }
    }

    /// Anthropic streams name each frame after the payload's `type`.
    fn typed(data: Value) -> Self {
        let event = data.get("type").and_then(Value::as_str).map(str::to_string);
        Self { event, data }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Identity,
    AnthropicEventsToOpenAIChat,
    AnthropicTextToOpenAIChat,
    AnthropicEventsToAnthropicText,
    OpenAITextToOpenAIChat,
    OpenAIChatToOpenAIText,
}

#[derive(Debug, Clone)]
pub struct StreamTranslator {
    route: Route,
    outbound: Dialect,
    id: String,
    model: String,
    created: i64,
    role_sent: bool,
}

impl StreamTranslator {
    pub fn new(
        inbound: Dialect,
        outbound: Dialect,
        model: impl Into<String>,
        created: i64,
    ) -> Result<Self, TransformError> {
        let route = match (inbound, outbound) {
            (from, to) if from == to => Route::Identity,
            (Dialect::GoogleChat, Dialect::OpenAIChat) => Route::Identity,
            (Dialect::OpenAIChat, Dialect::AnthropicChat) => Route::AnthropicEventsToOpenAIChat,
            (Dialect::OpenAIChat, Dialect::AnthropicText) => Route::AnthropicTextToOpenAIChat,
            (Dialect::AnthropicText, Dialect::AnthropicChat) => {
                Route::AnthropicEventsToAnthropicText
            }
            (Dialect::OpenAIChat, Dialect::OpenAIText) => Route::OpenAITextToOpenAIChat,
            (Dialect::OpenAIText, Dialect::OpenAIChat) => Route::OpenAIChatToOpenAIText,
            (to, from) => return Err(TransformError::Unsupported { from, to }),
        };
        Ok(Self {
            route,
            outbound,
            id: String::new(),
            model: model.into(),
            created,
            role_sent: false,
        })
    }

    pub fn translate(&mut self, chunk: Value) -> Vec<StreamFrame> {
        if let Some(error) = chunk.get("error").filter(|e| !e.is_null()) {
            return vec![StreamFrame {
                event: Some("error".to_string()),
                data: json!({ "error": error }),
            }];
        }
        match self.route {
            Route::Identity => {
                if matches!(self.outbound, Dialect::AnthropicChat | Dialect::AnthropicText) {
                    vec![StreamFrame::typed(chunk)]
                } else {
                    vec![StreamFrame::data(chunk)]
                }
            }
            Route::AnthropicEventsToOpenAIChat => self.anthropic_event_to_chat(&chunk),
            Route::AnthropicTextToOpenAIChat => self.anthropic_text_to_chat(&chunk),
            Route::AnthropicEventsToAnthropicText => self.anthropic_event_to_text(&chunk),
            Route::OpenAITextToOpenAIChat => self.openai_text_to_chat(&chunk),
            Route::OpenAIChatToOpenAIText => self.openai_chat_to_text(&chunk),
        }
    }

    fn remember_identity(&mut self, source: &Value, id_field: &str, prefix: &str) {
        if self.id.is_empty()
            && let Some(id) = source.get(id_field).and_then(Value::as_str)
        {
            self.id = format!("{prefix}{id}");
        }
        if let Some(model) = source.get("model").and_then(Value::as_str) {
            self.model = model.to_string();
        }
    }

    fn chat_chunk(&mut self, content: Option<String>, finish_reason: Option<String>) -> StreamFrame {
        let role = (!self.role_sent).then(|| "assistant".to_string());
        self.role_sent = true;
        let chunk = ChatCompletionChunk::delta(
            self.id.clone(),
            self.model.clone(),
            self.created,
            ChunkDelta { role, content },
            finish_reason,
        );
        StreamFrame::data(serde_json::to_value(chunk).unwrap_or_default())
    }

    fn anthropic_event_to_chat(&mut self, event: &Value) -> Vec<StreamFrame> {
        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                if let Some(message) = event.get("message") {
                    self.remember_identity(message, "id", ANTHROPIC_ID_PREFIX);
                }
                vec![self.chat_chunk(Some(String::new()), None)]
            }
            Some("content_block_delta") => match text_delta(event) {
                Some(text) => vec![self.chat_chunk(Some(text), None)],
                None => Vec::new(),
            },
            Some("message_delta") => match stop_reason(event.get("delta")) {
                Some(reason) => vec![self.chat_chunk(None, Some(reason))],
                None => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    fn anthropic_text_to_chat(&mut self, event: &Value) -> Vec<StreamFrame> {
        if event.get("type").and_then(Value::as_str) != Some("completion") {
            return Vec::new();
        }
        self.remember_identity(event, "log_id", ANTHROPIC_ID_PREFIX);
        let content = event
            .get("completion")
            .and_then(Value::as_str)
            .map(str::to_string);
        vec![self.chat_chunk(content, stop_reason(Some(event)))]
    }

    fn anthropic_event_to_text(&mut self, event: &Value) -> Vec<StreamFrame> {
        let (completion, reason) = match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                if let Some(message) = event.get("message") {
                    self.remember_identity(message, "id", ANTHROPIC_ID_PREFIX);
                }
                return Vec::new();
            }
            Some("content_block_delta") => match text_delta(event) {
                Some(text) => (text, None),
                None => return Vec::new(),
            },
            Some("message_delta") => match stop_reason(event.get("delta")) {
                Some(reason) => (String::new(), Some(reason)),
                None => return Vec::new(),
            },
            _ => return Vec::new(),
        };
        vec![StreamFrame::typed(json!({
            "type": "completion",
            "id": self.id,
            "completion": completion,
            "stop_reason": reason,
            "model": self.model,
        }))]
    }

    fn openai_text_to_chat(&mut self, chunk: &Value) -> Vec<StreamFrame> {
        self.remember_identity(chunk, "id", "");
        if let Some(created) = chunk.get("created").and_then(Value::as_i64) {
            self.created = created;
        }
        let Some(choice) = first_choice(chunk) else {
            return Vec::new();
        };
        let content = choice
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string);
        let reason = stop_reason_field(choice, "finish_reason");
        vec![self.chat_chunk(content, reason)]
    }

    fn openai_chat_to_text(&mut self, chunk: &Value) -> Vec<StreamFrame> {
        let Some(choice) = first_choice(chunk) else {
            return Vec::new();
        };
        let text = choice
            .get("delta")
            .and_then(|delta| delta.get("content"))
            .and_then(Value::as_str)
            .unwrap_or("");
        let reason = stop_reason_field(choice, "finish_reason");
        if text.is_empty() && reason.is_none() {
            return Vec::new();
        }
        vec![StreamFrame::data(json!({
            "id": chunk.get("id").cloned().unwrap_or(Value::Null),
            "object": "text_completion",
            "created": chunk.get("created").cloned().unwrap_or(json!(self.created)),
            "model": chunk.get("model").cloned().unwrap_or(json!(self.model)),
            "choices": [{
                "index": 0,
                "text": text,
                "logprobs": null,
                "finish_reason": reason,
            }],
        }))]
    }
}

fn first_choice(chunk: &Value) -> Option<&Value> {
    chunk.get("choices").and_then(Value::as_array)?.first()
}

fn text_delta(event: &Value) -> Option<String> {
    event
        .get("delta")
        .and_then(|delta| delta.get("text"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn stop_reason(source: Option<&Value>) -> Option<String> {
    source.and_then(|source| stop_reason_field(source, "stop_reason"))
}

fn stop_reason_field(source: &Value, field: &str) -> Option<String> {
    source
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_events_become_chat_chunks() {
        let mut translator =
            StreamTranslator::new(Dialect::OpenAIChat, Dialect::AnthropicChat, "gpt-4", 7).unwrap();
        let start = translator.translate(json!({
            "type": "message_start",
            "message": {"id": "msg_1", "model": "claude-3-5-sonnet-latest"}
        }));
        assert_eq!(start.len(), 1);
        assert_eq!(start[0].data["id"], json!("ant-msg_1"));
        assert_eq!(start[0].data["choices"][0]["delta"]["role"], json!("assistant"));

        let delta = translator.translate(json!({
            "type": "content_block_delta", "index": 0,
            "delta": {"type": "text_delta", "text": "Hi"}
        }));
        assert_eq!(delta[0].data["choices"][0]["delta"]["content"], json!("Hi"));
        assert_eq!(delta[0].data["choices"][0]["delta"].get("role"), None);

        assert!(translator.translate(json!({"type": "ping"})).is_empty());

        let stop = translator.translate(json!({
            "type": "message_delta", "delta": {"stop_reason": "end_turn"}
        }));
        assert_eq!(stop[0].data["choices"][0]["finish_reason"], json!("end_turn"));
    }

    #[test]
    fn chat_chunks_become_text_chunks() {
        let mut translator =
            StreamTranslator::new(Dialect::OpenAIText, Dialect::OpenAIChat, "gpt-4o", 7).unwrap();
        let role_only = translator.translate(json!({
            "id": "c1", "choices": [{"index": 0, "delta": {"role": "assistant"}}]
        }));
        assert!(role_only.is_empty());
        let frames = translator.translate(json!({
            "id": "c1", "model": "gpt-4o", "created": 9,
            "choices": [{"index": 0, "delta": {"content": "yo"}, "finish_reason": null}]
        }));
        assert_eq!(frames[0].data["object"], json!("text_completion"));
        assert_eq!(frames[0].data["choices"][0]["text"], json!("yo"));
    }

    #[test]
    fn anthropic_identity_frames_are_named() {
        let mut translator =
            StreamTranslator::new(Dialect::AnthropicChat, Dialect::AnthropicChat, "m", 0).unwrap();
        let frames = translator.translate(json!({"type": "message_stop"}));
        assert_eq!(frames[0].event.as_deref(), Some("message_stop"));
    }

    #[test]
    fn anthropic_events_become_text_completions() {
        let mut translator =
            StreamTranslator::new(Dialect::AnthropicText, Dialect::AnthropicChat, "m", 0).unwrap();
        assert!(translator
            .translate(json!({"type": "message_start", "message": {"id": "msg_5", "model": "claude-3-haiku"}}))
            .is_empty());
        let frames = translator.translate(json!({
            "type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "ok"}
        }));
        assert_eq!(frames[0].event.as_deref(), Some("completion"));
        assert_eq!(frames[0].data["completion"], json!("ok"));
        assert_eq!(frames[0].data["id"], json!("ant-msg_5"));
    }

    #[test]
    fn upstream_error_events_pass_through() {
        let mut translator =
            StreamTranslator::new(Dialect::OpenAIChat, Dialect::AnthropicChat, "m", 0).unwrap();
        let frames = translator.translate(json!({
            "type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}
        }));
        assert_eq!(frames[0].event.as_deref(), Some("error"));
        assert_eq!(frames[0].data["error"]["type"], json!("overloaded_error"));
    }
}
