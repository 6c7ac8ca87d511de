use std::collections::BTreeMap;

use lmrelay_protocol::openai::chat::{
    ChatChoice, ChatCompletionChunk, ChatCompletionResponse, ChatMessage,
};
use serde_json::Value;

use super::into_object;
use crate::inbound::JsonObject;

#[derive(Debug, Clone, Default)]
struct ChoiceState {
    role: Option<String>,
    content: String,
    finish_reason: Option<String>,
}

/// Folds `chat.completion.chunk` frames into a `chat.completion`.
#[derive(Debug, Clone, Default)]
pub struct OpenAIChatAggregator {
    identity: Option<(String, String, i64, String)>,
    usage: Option<Value>,
    choices: BTreeMap<i64, ChoiceState>,
}

impl OpenAIChatAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unparseable frames are ignored.
    pub fn push_value(&mut self, chunk: &Value) {
        if let Ok(chunk) = serde_json::from_value::<ChatCompletionChunk>(chunk.clone()) {
            self.push(chunk);
        }
    }

    pub fn push(&mut self, chunk: ChatCompletionChunk) {
        if chunk.usage.as_ref().is_some_and(|usage| !usage.is_null()) {
            self.usage = chunk.usage;
        }
        if chunk.choices.is_empty() {
            return;
        }
        if self.identity.is_none() && !chunk.id.is_empty() {
            let object = non_stream_object(&chunk.object);
            self.identity = Some((chunk.id, object, chunk.created, chunk.model));
        }
        for choice in chunk.choices {
            let state = self.choices.entry(choice.index).or_default();
            if let Some(role) = choice.delta.role {
                state.role = Some(role);
            }
            if let Some(content) = choice.delta.content {
                state.content.push_str(&content);
            }
            if let Some(reason) = choice.finish_reason {
                state.finish_reason = Some(reason);
            }
        }
    }

    pub fn finish(self) -> ChatCompletionResponse {
        let mut response = ChatCompletionResponse::empty();
        if let Some((id, object, created, model)) = self.identity {
            response.id = id;
            response.object = object;
            response.created = created;
            response.model = model;
        }
        response.usage = self.usage;
        if !self.choices.is_empty() {
            response.choices = self
                .choices
                .into_iter()
                .map(|(index, state)| ChatChoice {
                    index,
                    message: ChatMessage {
                        role: state.role.unwrap_or_else(|| "assistant".to_string()),
                        content: state.content,
                    },
                    finish_reason: state.finish_reason,
                })
                .collect();
        }
        response
    }

    pub fn finish_object(self) -> JsonObject {
        into_object(serde_json::to_value(self.finish()).unwrap_or_default())
    }
}

fn non_stream_object(object: &str) -> String {
    match object.strip_suffix(".chunk") {
        Some(base) if !base.is_empty() => base.to_string(),
        _ if object.is_empty() => "chat.completion".to_string(),
        _ => object.to_string(),
    }
}
