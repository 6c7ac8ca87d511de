use std::fmt;

use serde::{Deserialize, Serialize};

/// A request/response JSON shape spoken by one client-facing API convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dialect {
    /// `POST /v1/chat/completions` with a `messages` array.
    #[serde(rename = "openai")]
    OpenAIChat,
    /// `POST /v1/completions` with a `prompt` string.
    #[serde(rename = "openai-text")]
    OpenAIText,
    /// `POST /v1/embeddings`.
    #[serde(rename = "openai-embedding")]
    OpenAIEmbedding,
    /// `POST /v1/messages`.
    #[serde(rename = "anthropic-chat")]
    AnthropicChat,
    /// `POST /v1/complete` with a `\n\nHuman:` prompt.
    #[serde(rename = "anthropic-text")]
    AnthropicText,
    /// The Google route group. The body is OpenAI-chat shaped.
    #[serde(rename = "google-ai")]
    GoogleChat,
}

impl Dialect {
    pub fn as_str(self) -> &'static str {
        match self {
            Dialect::OpenAIChat => "openai",
            Dialect::OpenAIText => "openai-text",
            Dialect::OpenAIEmbedding => "openai-embedding",
            Dialect::AnthropicChat => "anthropic-chat",
            Dialect::AnthropicText => "anthropic-text",
            Dialect::GoogleChat => "google-ai",
        }
    }

    /// Upstream path a request in this dialect is sent to.
    pub fn upstream_path(self) -> &'static str {
        match self {
            Dialect::OpenAIChat | Dialect::GoogleChat => "/v1/chat/completions",
            Dialect::OpenAIText => "/v1/completions",
            Dialect::OpenAIEmbedding => "/v1/embeddings",
            Dialect::AnthropicChat => "/v1/messages",
            Dialect::AnthropicText => "/v1/complete",
        }
    }

    /// OpenAI-family streams end with an explicit `data: [DONE]` frame.
    pub fn stream_done_marker(self) -> bool {
        matches!(
            self,
            Dialect::OpenAIChat | Dialect::OpenAIText | Dialect::GoogleChat
        )
    }

    pub fn supports_streaming(self) -> bool {
        !matches!(self, Dialect::OpenAIEmbedding)
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    Blocking,
    Streaming,
}
