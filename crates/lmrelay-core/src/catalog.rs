//! Per-service model list cache with a fixed freshness window.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use http::Method;
use lmrelay_common::ModelListSource;
use lmrelay_protocol::openai::models::{ModelEntry, ModelList};
use lmrelay_protocol::{ModelFamily, Service, is_fine_tune};
use lmrelay_provider_core::{CredentialPool, Headers, Outcome, ProxyError};
use serde_json::Value;
use tokio::time::Instant;

use crate::forwarder::classify_failure;
use crate::pipeline::{ANTHROPIC_VERSION, models_path};
use crate::upstream_client::{UpstreamClient, UpstreamRequest};

#[async_trait]
pub trait ModelFetcher: Send + Sync {
    async fn fetch(&self, service: Service) -> Result<ModelList, ProxyError>;
}

#[derive(Debug)]
struct CatalogEntry {
    fetched_at: Instant,
    models: Arc<ModelList>,
}

pub struct ModelCatalog {
    entries: BTreeMap<Service, ArcSwapOption<CatalogEntry>>,
    ttl: Duration,
    fetcher: Arc<dyn ModelFetcher>,
}

impl std::fmt::Debug for ModelCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCatalog")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl ModelCatalog {
    pub fn new(ttl: Duration, fetcher: Arc<dyn ModelFetcher>) -> Self {
        let entries = Service::ALL
            .into_iter()
            .map(|service| (service, ArcSwapOption::empty()))
            .collect();
        Self {
            entries,
            ttl,
            fetcher,
        }
    }

    /// Cached list while fresh; otherwise one fetch. A failed fetch yields
    /// an empty list and leaves the previous entry in place.
    pub async fn get_models(&self, service: Service) -> Arc<ModelList> {
        let Some(slot) = self.entries.get(&service) else {
            return Arc::new(ModelList::empty());
        };
        if let Some(entry) = slot.load_full()
            && entry.fetched_at.elapsed() < self.ttl
        {
            return Arc::clone(&entry.models);
        }
        match self.fetcher.fetch(service).await {
            Ok(models) => {
                let models = Arc::new(models);
                tracing::debug!(
                    event = "model_catalog_refreshed",
                    service = %service,
                    count = models.data.len(),
                );
                slot.store(Some(Arc::new(CatalogEntry {
                    fetched_at: Instant::now(),
                    models: Arc::clone(&models),
                })));
                models
            }
            Err(err) => {
                tracing::warn!(
                    event = "model_catalog_fetch_failed",
                    service = %service,
                    error = %err,
                );
                Arc::new(ModelList::empty())
            }
        }
    }
}

fn owner(service: Service) -> &'static str {
    match service {
        Service::OpenAI => "openai",
        Service::Anthropic => "anthropic",
        Service::GoogleAI => "google",
    }
}

fn render(service: Service, ids: Vec<String>) -> ModelList {
    let created = time::OffsetDateTime::now_utc().unix_timestamp();
    ModelList::new(
        ids.into_iter()
            .map(|id| ModelEntry::new(id, owner(service), created))
            .collect(),
    )
}

/// Lists the model ids advertised by the configured credentials.
#[derive(Debug)]
pub struct CredentialModelFetcher {
    pool: Arc<CredentialPool>,
    allowed: Vec<ModelFamily>,
}

impl CredentialModelFetcher {
    pub fn new(pool: Arc<CredentialPool>, allowed: Vec<ModelFamily>) -> Self {
        Self { pool, allowed }
    }
}

#[async_trait]
impl ModelFetcher for CredentialModelFetcher {
    async fn fetch(&self, service: Service) -> Result<ModelList, ProxyError> {
        Ok(render(service, self.pool.list_models(service, &self.allowed)))
    }
}

/// Asks the upstream `models` endpoint with a pooled credential.
pub struct UpstreamModelFetcher {
    client: Arc<dyn UpstreamClient>,
    pool: Arc<CredentialPool>,
    base_urls: BTreeMap<Service, String>,
    allowed: Vec<ModelFamily>,
}

impl UpstreamModelFetcher {
    pub fn new(
        client: Arc<dyn UpstreamClient>,
        pool: Arc<CredentialPool>,
        base_urls: BTreeMap<Service, String>,
        allowed: Vec<ModelFamily>,
    ) -> Self {
        Self {
            client,
            pool,
            base_urls,
            allowed,
        }
    }
}

#[async_trait]
impl ModelFetcher for UpstreamModelFetcher {
    async fn fetch(&self, service: Service) -> Result<ModelList, ProxyError> {
        let base_url = self
            .base_urls
            .get(&service)
            .ok_or_else(|| ProxyError::NotFound(format!("service {service}")))?;
        let lease = self
            .pool
            .select_any(service)
            .ok_or(ProxyError::NoCredentialAvailable { service })?;
        let mut headers = Headers::new();
        match service {
            Service::OpenAI | Service::GoogleAI => {
                headers.set("authorization", format!("Bearer {}", lease.secret()))
            }
            Service::Anthropic => {
                headers.set("x-api-key", lease.secret());
                headers.set("anthropic-version", ANTHROPIC_VERSION);
            }
        }
        let request = UpstreamRequest {
            method: Method::GET,
            url: format!("{base_url}{}", models_path(service)),
            headers,
            body: None,
            is_stream: false,
        };
        let response = self
            .client
            .send(request)
            .await
            .map_err(|err| ProxyError::Network {
                message: err.message,
            })?;
        let body = response
            .body
            .collect()
            .await
            .map_err(|err| ProxyError::Network {
                message: err.message,
            })?;
        if !(200..300).contains(&response.status) {
            let (outcome, err) = classify_failure(response.status, &response.headers, body);
            if let Some(outcome) = outcome {
                self.pool.report_outcome(lease, outcome);
            }
            return Err(err);
        }
        self.pool.report_outcome(lease, Outcome::Success);

        let value: Value =
            serde_json::from_slice(&body).map_err(|err| ProxyError::UpstreamProtocol {
                message: format!("model list: {err}"),
            })?;
        let prefixes = service.known_model_prefixes();
        let mut ids: Vec<String> = value
            .get("data")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.get("id").and_then(Value::as_str))
            // Google prefixes ids with `models/`.
            .map(|id| id.strip_prefix("models/").unwrap_or(id))
            .filter(|id| prefixes.iter().any(|prefix| id.starts_with(prefix)))
            .filter(|id| !is_fine_tune(id))
            .filter(|id| self.allowed.contains(&ModelFamily::classify(service, id)))
            .map(str::to_string)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(render(service, ids))
    }
}

/// Routes each service to the fetcher its configuration names.
pub struct ConfiguredModelFetcher {
    sources: BTreeMap<Service, ModelListSource>,
    upstream: Arc<dyn ModelFetcher>,
    credentials: Arc<dyn ModelFetcher>,
}

impl ConfiguredModelFetcher {
    pub fn new(
        sources: BTreeMap<Service, ModelListSource>,
        upstream: Arc<dyn ModelFetcher>,
        credentials: Arc<dyn ModelFetcher>,
    ) -> Self {
        Self {
            sources,
            upstream,
            credentials,
        }
    }
}

#[async_trait]
impl ModelFetcher for ConfiguredModelFetcher {
    async fn fetch(&self, service: Service) -> Result<ModelList, ProxyError> {
        match self.sources.get(&service) {
            Some(ModelListSource::Upstream) => self.upstream.fetch(service).await,
            Some(ModelListSource::Credentials) => self.credentials.fetch(service).await,
            None => Err(ProxyError::NotFound(format!("service {service}"))),
        }
    }
}
