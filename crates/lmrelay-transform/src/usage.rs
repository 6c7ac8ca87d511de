use lmrelay_protocol::Dialect;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::inbound::JsonObject;

/// Token accounting filled in after the upstream response is known.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

impl TokenUsage {
    pub fn total(&self) -> Option<u64> {
        match (self.prompt_tokens, self.output_tokens) {
            (None, None) => None,
            (prompt, output) => Some(prompt.unwrap_or(0) + output.unwrap_or(0)),
        }
    }

    /// Reads the usage block of a finished (or aggregated) upstream response.
    pub fn from_response(dialect: Dialect, body: &JsonObject) -> Self {
        let Some(usage) = body.get("usage") else {
            return Self::default();
        };
        let field = |name: &str| usage.get(name).and_then(Value::as_u64);
        match dialect {
            Dialect::AnthropicChat | Dialect::AnthropicText => Self {
                prompt_tokens: field("input_tokens"),
                output_tokens: field("output_tokens"),
            },
            Dialect::OpenAIChat
            | Dialect::OpenAIText
            | Dialect::OpenAIEmbedding
            | Dialect::GoogleChat => Self {
                prompt_tokens: field("prompt_tokens"),
                output_tokens: field("completion_tokens"),
            },
        }
    }

    pub fn to_openai(&self) -> Value {
        json!({
            "prompt_tokens": self.prompt_tokens,
            "completion_tokens": self.output_tokens,
            "total_tokens": self.total(),
        })
    }
}
