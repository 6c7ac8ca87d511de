mod pool;
mod state;

pub use pool::{CredentialLease, CredentialPool, CredentialRow, NoCredential};
pub use state::{CredentialHealth, DisableReason, Outcome};

use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize};

use lmrelay_protocol::{ModelFamily, Service};
use serde::{Deserialize, Serialize};

/// Stable, non-secret credential identifier: `<service prefix>-<8 hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CredentialId(String);

impl CredentialId {
    pub fn derive(service: Service, secret: &str) -> Self {
        let digest = blake3::hash(secret.as_bytes()).to_hex();
        Self(format!("{}-{}", service.key_prefix(), &digest[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a credential is allowed to serve, as loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct CredentialSpec {
    pub secret: String,
    /// Empty means every family of the service.
    pub families: Vec<ModelFamily>,
    /// Empty means unrestricted.
    pub models: Vec<String>,
}

impl CredentialSpec {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            ..Self::default()
        }
    }
}

/// A pooled upstream secret. Identity and capabilities are fixed; health,
/// last-use stamp and in-flight count are mutated only by the pool.
pub struct Credential {
    id: CredentialId,
    service: Service,
    secret: String,
    families: Vec<ModelFamily>,
    models: Vec<String>,
    pub(crate) health: Mutex<CredentialHealth>,
    pub(crate) last_used: AtomicU64,
    pub(crate) in_flight: AtomicUsize,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("service", &self.service)
            .field("families", &self.families)
            .finish_non_exhaustive()
    }
}

impl Credential {
    pub fn new(service: Service, spec: CredentialSpec) -> Self {
        let families = if spec.families.is_empty() {
            ModelFamily::for_service(service).collect()
        } else {
            spec.families
        };
        Self {
            id: CredentialId::derive(service, &spec.secret),
            service,
            secret: spec.secret,
            families,
            models: spec.models,
            health: Mutex::new(CredentialHealth::Active),
            last_used: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &CredentialId {
        &self.id
    }

    pub fn service(&self) -> Service {
        self.service
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn families(&self) -> &[ModelFamily] {
        &self.families
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    pub fn supports(&self, family: ModelFamily, model: &str) -> bool {
        self.families.contains(&family)
            && (self.models.is_empty() || self.models.iter().any(|m| m == model))
    }
}
