use std::collections::BTreeMap;

use serde_json::{Value, json};

use super::{into_object, str_field};
use crate::inbound::JsonObject;

/// Folds Anthropic `message_start` .. `message_stop` events into a message.
#[derive(Debug, Clone, Default)]
pub struct AnthropicChatAggregator {
    id: Option<String>,
    model: Option<String>,
    role: Option<String>,
    blocks: BTreeMap<u64, Value>,
    /// Accumulated `text_delta` payloads, written into `blocks` on finish.
    texts: BTreeMap<u64, String>,
    stop_reason: Option<Value>,
    stop_sequence: Option<Value>,
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

impl AnthropicChatAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: &Value) {
        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                let Some(message) = event.get("message") else {
                    return;
                };
                if self.id.is_none() {
                    self.id = str_field(message, "id");
                    self.model = str_field(message, "model");
                }
                if let Some(role) = str_field(message, "role") {
                    self.role = Some(role);
                }
                if let Some(usage) = message.get("usage") {
                    self.read_usage(usage);
                }
            }
            Some("content_block_start") => {
                let index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
                if let Some(block) = event.get("content_block") {
                    self.blocks.insert(index, block.clone());
                }
            }
            Some("content_block_delta") => {
                let index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
                let Some(delta) = event.get("delta") else {
                    return;
                };
                if let Some(text) = delta.get("text").and_then(Value::as_str) {
                    self.blocks
                        .entry(index)
                        .or_insert_with(|| json!({"type": "text", "text": ""}));
                    self.texts.entry(index).or_default().push_str(text);
                }
            }
            Some("message_delta") => {
                if let Some(delta) = event.get("delta") {
                    if let Some(reason) = delta.get("stop_reason").filter(|r| !r.is_null()) {
                        self.stop_reason = Some(reason.clone());
                    }
                    if let Some(sequence) = delta.get("stop_sequence").filter(|s| !s.is_null()) {
                        self.stop_sequence = Some(sequence.clone());
                    }
                }
                if let Some(usage) = event.get("usage") {
                    self.read_usage(usage);
                }
            }
            _ => {}
        }
    }

    fn read_usage(&mut self, usage: &Value) {
        if let Some(input) = usage.get("input_tokens").and_then(Value::as_u64) {
            self.input_tokens = Some(input);
        }
        if let Some(output) = usage.get("output_tokens").and_then(Value::as_u64) {
            self.output_tokens = Some(output);
        }
    }

    pub fn finish(mut self) -> JsonObject {
        for (index, text) in std::mem::take(&mut self.texts) {
            if let Some(block) = self.blocks.get_mut(&index) {
                let mut merged = block
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                merged.push_str(&text);
                block["text"] = Value::String(merged);
            }
        }
        into_object(json!({
            "id": self.id.unwrap_or_default(),
            "type": "message",
            "role": self.role.unwrap_or_else(|| "assistant".to_string()),
            "model": self.model.unwrap_or_default(),
            "content": self.blocks.into_values().collect::<Vec<_>>(),
            "stop_reason": self.stop_reason,
            "stop_sequence": self.stop_sequence,
            "usage": {
                "input_tokens": self.input_tokens,
                "output_tokens": self.output_tokens,
            },
        }))
    }
}
