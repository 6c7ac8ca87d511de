use std::collections::BTreeMap;
use std::time::Duration;

use lmrelay_protocol::{ModelFamily, Service};
use serde::{Deserialize, Serialize};

mod file;
mod service;

pub use file::{FileConfig, ServiceFileConfig, load_file};
pub use service::{CredentialConfig, ModelListSource, ServiceConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required config field: {0}")]
    MissingField(&'static str),
    #[error("unknown service `{0}`")]
    UnknownService(String),
    #[error("unknown model family `{0}`")]
    UnknownFamily(String),
    #[error("service {service}: family {family} belongs to another service")]
    ForeignFamily { service: Service, family: ModelFamily },
    #[error("service {0}: max_concurrency must be at least 1")]
    ZeroConcurrency(Service),
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 7860;
pub const DEFAULT_QUEUE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MODEL_CACHE_TTL_SECS: u64 = 60;

/// Final, merged configuration used by the running process.
///
/// Merge order: CLI > ENV > file > defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Optional outbound proxy (for upstream egress).
    pub proxy: Option<String>,
    pub queue_timeout_secs: u64,
    pub model_cache_ttl_secs: u64,
    /// Families clients may see in model lists and request.
    pub allowed_model_families: Vec<ModelFamily>,
    pub services: BTreeMap<Service, ServiceConfig>,
}

impl GlobalConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }

    pub fn model_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.model_cache_ttl_secs)
    }

    pub fn service(&self, service: Service) -> Option<&ServiceConfig> {
        self.services.get(&service)
    }

    pub fn family_allowed(&self, family: ModelFamily) -> bool {
        self.allowed_model_families.contains(&family)
    }
}

/// Optional layer used for merging config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub proxy: Option<String>,
    pub queue_timeout_secs: Option<u64>,
    pub model_cache_ttl_secs: Option<u64>,
    pub allowed_model_families: Option<Vec<ModelFamily>>,
    pub services: BTreeMap<Service, ServiceConfig>,
    /// Plain secrets per service; replace the credentials of that service.
    pub keys: BTreeMap<Service, Vec<String>>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.queue_timeout_secs.is_some() {
            self.queue_timeout_secs = other.queue_timeout_secs;
        }
        if other.model_cache_ttl_secs.is_some() {
            self.model_cache_ttl_secs = other.model_cache_ttl_secs;
        }
        if other.allowed_model_families.is_some() {
            self.allowed_model_families = other.allowed_model_families;
        }
        self.services.extend(other.services);
        self.keys.extend(other.keys);
    }

    pub fn into_config(self) -> Result<GlobalConfig, ConfigError> {
        let mut services = self.services;
        for (service, keys) in self.keys {
            let entry = services
                .entry(service)
                .or_insert_with(|| ServiceConfig::new(service));
            entry.credentials = keys.into_iter().map(CredentialConfig::new).collect();
        }
        for (service, config) in &services {
            if config.max_concurrency == 0 {
                return Err(ConfigError::ZeroConcurrency(*service));
            }
            for credential in &config.credentials {
                if let Some(family) = credential
                    .families
                    .iter()
                    .flatten()
                    .find(|family| family.service() != *service)
                {
                    return Err(ConfigError::ForeignFamily {
                        service: *service,
                        family: *family,
                    });
                }
            }
        }
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: self.port.unwrap_or(DEFAULT_PORT),
            proxy: self.proxy.filter(|proxy| !proxy.is_empty()),
            queue_timeout_secs: self
                .queue_timeout_secs
                .unwrap_or(DEFAULT_QUEUE_TIMEOUT_SECS),
            model_cache_ttl_secs: self
                .model_cache_ttl_secs
                .unwrap_or(DEFAULT_MODEL_CACHE_TTL_SECS),
            allowed_model_families: self
                .allowed_model_families
                .unwrap_or_else(|| ModelFamily::ALL.to_vec()),
            services,
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            proxy: value.proxy,
            queue_timeout_secs: Some(value.queue_timeout_secs),
            model_cache_ttl_secs: Some(value.model_cache_ttl_secs),
            allowed_model_families: Some(value.allowed_model_families),
            services: value.services,
            keys: BTreeMap::new(),
        }
    }
}

/// Splits a comma-separated key list, as accepted from the environment.
pub fn split_keys(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_layers_win() {
        let mut patch = GlobalConfigPatch {
            host: Some("127.0.0.1".to_string()),
            port: Some(1),
            ..Default::default()
        };
        patch.overlay(GlobalConfigPatch {
            port: Some(2),
            ..Default::default()
        });
        let config = patch.into_config().unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 2);
        assert_eq!(config.queue_timeout_secs, DEFAULT_QUEUE_TIMEOUT_SECS);
        assert_eq!(config.allowed_model_families.len(), ModelFamily::ALL.len());
    }

    #[test]
    fn keys_create_services_with_defaults() {
        let mut patch = GlobalConfigPatch::default();
        patch
            .keys
            .insert(Service::OpenAI, split_keys("sk-a, sk-b,,"));
        let config = patch.into_config().unwrap();
        let openai = config.service(Service::OpenAI).unwrap();
        assert_eq!(openai.credentials.len(), 2);
        assert_eq!(openai.credentials[1].secret, "sk-b");
        assert_eq!(openai.base_url, "https://api.openai.com");
    }

    #[test]
    fn foreign_family_is_rejected() {
        let mut service = ServiceConfig::new(Service::OpenAI);
        service.credentials.push(CredentialConfig {
            secret: "sk".to_string(),
            families: Some(vec![ModelFamily::ClaudeOpus]),
            models: Vec::new(),
        });
        let mut patch = GlobalConfigPatch::default();
        patch.services.insert(Service::OpenAI, service);
        assert!(matches!(
            patch.into_config(),
            Err(ConfigError::ForeignFamily { .. })
        ));
    }
}
