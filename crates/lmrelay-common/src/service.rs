use lmrelay_protocol::{ModelFamily, Service};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Where the model list of a service comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelListSource {
    /// `GET <base_url>/v1/models` with a pooled credential.
    Upstream,
    /// Model ids advertised by the configured credentials.
    #[default]
    Credentials,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialConfig {
    pub secret: String,
    /// `None` means every family of the service.
    #[serde(default)]
    pub families: Option<Vec<ModelFamily>>,
    /// Model ids the key can reach; empty means unrestricted.
    #[serde(default)]
    pub models: Vec<String>,
}

impl CredentialConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            families: None,
            models: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub base_url: String,
    pub credentials: Vec<CredentialConfig>,
    pub max_concurrency: usize,
    pub model_list: ModelListSource,
    /// Model substituted on the chat-compat route when the requested model
    /// does not contain `flagship_marker`. `None` disables reassignment.
    pub flagship_model: Option<String>,
    pub flagship_marker: String,
}

impl ServiceConfig {
    pub fn new(service: Service) -> Self {
        let (flagship_model, flagship_marker) = match service {
            Service::Anthropic => (Some("claude-3-5-sonnet-latest".to_string()), "claude"),
            Service::OpenAI => (None, "gpt"),
            Service::GoogleAI => (None, "gemini"),
        };
        Self {
            base_url: default_base_url(service).to_string(),
            credentials: Vec::new(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            model_list: ModelListSource::default(),
            flagship_model,
            flagship_marker: flagship_marker.to_string(),
        }
    }
}

pub fn default_base_url(service: Service) -> &'static str {
    match service {
        Service::OpenAI => "https://api.openai.com",
        Service::Anthropic => "https://api.anthropic.com",
        Service::GoogleAI => "https://generativelanguage.googleapis.com/v1beta/openai",
    }
}
