use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Parser;
use lmrelay_common::{GlobalConfigPatch, split_keys};
use lmrelay_protocol::Service;

#[derive(Parser, Debug)]
#[command(name = "lmrelay", about = "Key-rotating reverse proxy for LLM APIs")]
pub(crate) struct Cli {
    /// TOML configuration file.
    #[arg(long, env = "LMRELAY_CONFIG")]
    pub(crate) config: Option<PathBuf>,
    #[arg(long, env = "LMRELAY_HOST")]
    pub(crate) host: Option<String>,
    #[arg(long, env = "LMRELAY_PORT")]
    pub(crate) port: Option<u16>,
    /// Outbound proxy for upstream traffic.
    #[arg(long, env = "LMRELAY_PROXY")]
    pub(crate) proxy: Option<String>,
    #[arg(long, env = "LMRELAY_QUEUE_TIMEOUT_SECS")]
    pub(crate) queue_timeout_secs: Option<u64>,
    #[arg(long, env = "LMRELAY_MODEL_CACHE_TTL_SECS")]
    pub(crate) model_cache_ttl_secs: Option<u64>,
    /// Comma-separated OpenAI keys.
    #[arg(long, env = "OPENAI_KEY", hide_env_values = true)]
    pub(crate) openai_key: Option<String>,
    /// Comma-separated Anthropic keys.
    #[arg(long, env = "ANTHROPIC_KEY", hide_env_values = true)]
    pub(crate) anthropic_key: Option<String>,
    /// Comma-separated Google AI keys.
    #[arg(long, env = "GOOGLE_AI_KEY", hide_env_values = true)]
    pub(crate) google_ai_key: Option<String>,
}

impl Cli {
    /// The CLI/ENV layer; applied over the file layer.
    pub(crate) fn patch(&self) -> GlobalConfigPatch {
        let mut keys = BTreeMap::new();
        for (service, raw) in [
            (Service::OpenAI, &self.openai_key),
            (Service::Anthropic, &self.anthropic_key),
            (Service::GoogleAI, &self.google_ai_key),
        ] {
            if let Some(raw) = raw {
                let parsed = split_keys(raw);
                if !parsed.is_empty() {
                    keys.insert(service, parsed);
                }
            }
        }
        GlobalConfigPatch {
            host: self.host.clone(),
            port: self.port,
            proxy: self.proxy.clone(),
            queue_timeout_secs: self.queue_timeout_secs,
            model_cache_ttl_secs: self.model_cache_ttl_secs,
            keys,
            ..Default::default()
        }
    }
}
