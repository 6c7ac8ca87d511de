//! Folding a streamed response back into the shape the same upstream would
//! have returned without `stream: true`.

mod anthropic_chat;
mod anthropic_text;
mod openai_chat;
mod openai_text;

pub use anthropic_chat::AnthropicChatAggregator;
pub use anthropic_text::AnthropicTextAggregator;
pub use openai_chat::OpenAIChatAggregator;
pub use openai_text::OpenAITextAggregator;

use lmrelay_protocol::Dialect;
use serde_json::Value;

use crate::inbound::JsonObject;

/// Per-dialect fold state; one per streamed exchange.
#[derive(Debug, Clone)]
pub enum StreamAggregator {
    OpenAIChat(OpenAIChatAggregator),
    OpenAIText(OpenAITextAggregator),
    AnthropicChat(AnthropicChatAggregator),
    AnthropicText(AnthropicTextAggregator),
}

impl StreamAggregator {
    /// `None` for dialects that never stream.
    pub fn for_dialect(dialect: Dialect) -> Option<Self> {
        match dialect {
            Dialect::OpenAIChat | Dialect::GoogleChat => {
                Some(Self::OpenAIChat(OpenAIChatAggregator::new()))
            }
            Dialect::OpenAIText => Some(Self::OpenAIText(OpenAITextAggregator::new())),
            Dialect::AnthropicChat => Some(Self::AnthropicChat(AnthropicChatAggregator::new())),
            Dialect::AnthropicText => Some(Self::AnthropicText(AnthropicTextAggregator::new())),
            Dialect::OpenAIEmbedding => None,
        }
    }

    pub fn push(&mut self, chunk: &Value) {
        match self {
            Self::OpenAIChat(inner) => inner.push_value(chunk),
            Self::OpenAIText(inner) => inner.push(chunk),
            Self::AnthropicChat(inner) => inner.push(chunk),
            Self::AnthropicText(inner) => inner.push(chunk),
        }
    }

    pub fn finish(self) -> JsonObject {
        match self {
            Self::OpenAIChat(inner) => inner.finish_object(),
            Self::OpenAIText(inner) => inner.finish(),
            Self::AnthropicChat(inner) => inner.finish(),
            Self::AnthropicText(inner) => inner.finish(),
        }
    }
}

/// Folds a complete chunk sequence in one call.
pub fn fold<'a>(
    dialect: Dialect,
    chunks: impl IntoIterator<Item = &'a Value>,
) -> Option<JsonObject> {
    let mut aggregator = StreamAggregator::for_dialect(dialect)?;
    for chunk in chunks {
        aggregator.push(chunk);
    }
    Some(aggregator.finish())
}

fn str_field(value: &Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn into_object(value: Value) -> JsonObject {
    match value {
        Value::Object(map) => map,
        _ => JsonObject::new(),
    }
}
