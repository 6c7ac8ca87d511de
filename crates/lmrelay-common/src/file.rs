use std::collections::BTreeMap;
use std::path::Path;

use lmrelay_protocol::{ModelFamily, Service};
use serde::Deserialize;

use crate::service::{CredentialConfig, ModelListSource, ServiceConfig};
use crate::{ConfigError, GlobalConfigPatch};

/// On-disk TOML layout. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub proxy: Option<String>,
    pub queue_timeout_secs: Option<u64>,
    pub model_cache_ttl_secs: Option<u64>,
    pub allowed_model_families: Option<Vec<String>>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceFileConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceFileConfig {
    pub base_url: Option<String>,
    /// Shorthand for credentials that only carry a secret.
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,
    pub max_concurrency: Option<usize>,
    pub model_list: Option<ModelListSource>,
    /// An empty string disables reassignment.
    pub flagship_model: Option<String>,
    pub flagship_marker: Option<String>,
}

impl FileConfig {
    pub fn parse(raw: &str, path: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn into_patch(self) -> Result<GlobalConfigPatch, ConfigError> {
        let allowed_model_families = self
            .allowed_model_families
            .map(|families| {
                families
                    .iter()
                    .map(|family| {
                        family
                            .parse::<ModelFamily>()
                            .map_err(|_| ConfigError::UnknownFamily(family.clone()))
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;
        let mut services = BTreeMap::new();
        for (name, file) in self.services {
            let service = name
                .parse::<Service>()
                .map_err(|_| ConfigError::UnknownService(name.clone()))?;
            services.insert(service, file.into_service(service));
        }
        Ok(GlobalConfigPatch {
            host: self.host,
            port: self.port,
            proxy: self.proxy,
            queue_timeout_secs: self.queue_timeout_secs,
            model_cache_ttl_secs: self.model_cache_ttl_secs,
            allowed_model_families,
            services,
            keys: BTreeMap::new(),
        })
    }
}

impl ServiceFileConfig {
    fn into_service(self, service: Service) -> ServiceConfig {
        let mut config = ServiceConfig::new(service);
        if let Some(base_url) = self.base_url {
            config.base_url = base_url.trim_end_matches('/').to_string();
        }
        config.credentials = self
            .keys
            .into_iter()
            .map(CredentialConfig::new)
            .chain(self.credentials)
            .collect();
        if let Some(max_concurrency) = self.max_concurrency {
            config.max_concurrency = max_concurrency;
        }
        if let Some(model_list) = self.model_list {
            config.model_list = model_list;
        }
        if let Some(flagship) = self.flagship_model {
            config.flagship_model = Some(flagship).filter(|model| !model.is_empty());
        }
        if let Some(marker) = self.flagship_marker {
            config.flagship_marker = marker;
        }
        config
    }
}

/// Reads a TOML config file into a patch layer.
pub fn load_file(path: &Path) -> Result<GlobalConfigPatch, ConfigError> {
    let display = path.display().to_string();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: display.clone(),
        source,
    })?;
    FileConfig::parse(&raw, &display)?.into_patch()
}
