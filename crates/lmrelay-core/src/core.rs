use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Router;
use axum::routing::{any, get};
use lmrelay_common::GlobalConfig;
use lmrelay_protocol::Service;
use lmrelay_provider_core::{CredentialPool, CredentialSpec, EventHub};

use crate::catalog::{
    ConfiguredModelFetcher, CredentialModelFetcher, ModelCatalog, UpstreamModelFetcher,
};
use crate::forwarder::Forwarder;
use crate::gate::{AdmissionGate, AllowAll};
use crate::handler::{health_handler, proxy_handler};
use crate::upstream_client::UpstreamClient;

pub struct CoreState {
    pub config: GlobalConfig,
    pub forwarder: Forwarder,
    pub catalog: ModelCatalog,
    pub gate: Arc<dyn AdmissionGate>,
}

pub struct Core {
    state: Arc<CoreState>,
}

impl Core {
    pub fn new(config: GlobalConfig, client: Arc<dyn UpstreamClient>, events: EventHub) -> Self {
        Self::with_gate(config, client, events, Arc::new(AllowAll))
    }

    pub fn with_gate(
        config: GlobalConfig,
        client: Arc<dyn UpstreamClient>,
        events: EventHub,
        gate: Arc<dyn AdmissionGate>,
    ) -> Self {
        let pool = Arc::new(build_pool(&config, events));

        let mut forwarder = Forwarder::new(Arc::clone(&client), Arc::clone(&pool));
        for (service, service_config) in &config.services {
            forwarder = forwarder.with_service(
                *service,
                service_config.base_url.as_str(),
                service_config.max_concurrency,
                config.queue_timeout(),
            );
        }

        let base_urls: BTreeMap<Service, String> = Service::ALL
            .into_iter()
            .filter_map(|service| {
                forwarder
                    .base_url(service)
                    .map(|url| (service, url.to_string()))
            })
            .collect();
        let sources = config
            .services
            .iter()
            .map(|(service, service_config)| (*service, service_config.model_list))
            .collect();
        let allowed = config.allowed_model_families.clone();
        let fetcher = ConfiguredModelFetcher::new(
            sources,
            Arc::new(UpstreamModelFetcher::new(
                client,
                Arc::clone(&pool),
                base_urls,
                allowed.clone(),
            )),
            Arc::new(CredentialModelFetcher::new(pool, allowed)),
        );
        let catalog = ModelCatalog::new(config.model_cache_ttl(), Arc::new(fetcher));

        Self {
            state: Arc::new(CoreState {
                config,
                forwarder,
                catalog,
                gate,
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/{service}/{*path}", any(proxy_handler))
            .with_state(self.state.clone())
    }

    pub fn state(&self) -> Arc<CoreState> {
        self.state.clone()
    }
}

/// Loads every configured credential into a fresh pool.
pub fn build_pool(config: &GlobalConfig, events: EventHub) -> CredentialPool {
    let mut pool = CredentialPool::new(events);
    for (service, service_config) in &config.services {
        for credential in &service_config.credentials {
            pool.insert(
                *service,
                CredentialSpec {
                    secret: credential.secret.clone(),
                    families: credential.families.clone().unwrap_or_default(),
                    models: credential.models.clone(),
                },
            );
        }
    }
    pool
}
