use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An upstream provider reachable through the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Service {
    #[serde(rename = "openai")]
    OpenAI,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "google-ai")]
    GoogleAI,
}

impl Service {
    pub const ALL: [Service; 3] = [Service::OpenAI, Service::Anthropic, Service::GoogleAI];

    pub fn as_str(self) -> &'static str {
        match self {
            Service::OpenAI => "openai",
            Service::Anthropic => "anthropic",
            Service::GoogleAI => "google-ai",
        }
    }

    /// Short tag used when deriving public credential identifiers.
    pub fn key_prefix(self) -> &'static str {
        match self {
            Service::OpenAI => "oai",
            Service::Anthropic => "ant",
            Service::GoogleAI => "gai",
        }
    }

    /// Model id prefixes this service is willing to advertise in model lists.
    pub fn known_model_prefixes(self) -> &'static [&'static str] {
        match self {
            Service::OpenAI => &["gpt", "o1", "dall-e", "chatgpt", "text-embedding"],
            Service::Anthropic => &["claude"],
            Service::GoogleAI => &["gemini"],
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownService(pub String);

impl fmt::Display for UnknownService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown service: {}", self.0)
    }
}

impl std::error::Error for UnknownService {}

impl FromStr for Service {
    type Err = UnknownService;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "openai" => Ok(Service::OpenAI),
            "anthropic" => Ok(Service::Anthropic),
            "google-ai" | "google" => Ok(Service::GoogleAI),
            other => Err(UnknownService(other.to_string())),
        }
    }
}
