use std::time::SystemTime;

use lmrelay_protocol::Service;
use serde::{Deserialize, Serialize};

use crate::credential::{CredentialId, DisableReason};

/// A credential health transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PoolEvent {
    RateLimited {
        at: SystemTime,
        service: Service,
        credential: CredentialId,
        retry_after_ms: u64,
    },
    Recovered {
        at: SystemTime,
        service: Service,
        credential: CredentialId,
    },
    Disabled {
        at: SystemTime,
        service: Service,
        credential: CredentialId,
        reason: DisableReason,
    },
}

impl PoolEvent {
    pub fn credential(&self) -> &CredentialId {
        match self {
            PoolEvent::RateLimited { credential, .. }
            | PoolEvent::Recovered { credential, .. }
            | PoolEvent::Disabled { credential, .. } => credential,
        }
    }
}
