use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::SystemTime;

use lmrelay_protocol::{ModelFamily, Service, is_fine_tune};
use tokio::time::Instant;

use super::state::{CredentialHealth, DisableReason, Outcome};
use super::{Credential, CredentialId, CredentialSpec};
use crate::events::{EventHub, PoolEvent};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no {service} credential available for {family}")]
pub struct NoCredential {
    pub service: Service,
    pub family: ModelFamily,
}

/// One row of [`CredentialPool::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRow {
    pub id: CredentialId,
    pub health: CredentialHealth,
    pub in_flight: usize,
}

/// Scoped claim on a selected credential.
///
/// Dropping the lease releases the in-flight count without touching health;
/// [`CredentialPool::report_outcome`] consumes it.
#[derive(Debug)]
pub struct CredentialLease {
    credential: Arc<Credential>,
}

impl CredentialLease {
    fn new(credential: Arc<Credential>) -> Self {
        credential.in_flight.fetch_add(1, Ordering::AcqRel);
        Self { credential }
    }

    pub fn id(&self) -> &CredentialId {
        self.credential.id()
    }

    pub fn service(&self) -> Service {
        self.credential.service()
    }

    pub fn secret(&self) -> &str {
        self.credential.secret()
    }
}

impl Drop for CredentialLease {
    fn drop(&mut self) {
        self.credential.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Credentials grouped by service. Entries are created at start-up and never
/// removed; only health, last-use and in-flight counts change afterwards.
#[derive(Debug)]
pub struct CredentialPool {
    credentials: BTreeMap<Service, Vec<Arc<Credential>>>,
    /// Logical clock for least-recently-used ordering.
    clock: AtomicU64,
    events: EventHub,
}

impl CredentialPool {
    pub fn new(events: EventHub) -> Self {
        Self {
            credentials: BTreeMap::new(),
            clock: AtomicU64::new(0),
            events,
        }
    }

    /// Adds a credential; a secret already present for the service is ignored.
    pub fn insert(&mut self, service: Service, spec: CredentialSpec) -> CredentialId {
        let credential = Credential::new(service, spec);
        let id = credential.id().clone();
        let entries = self.credentials.entry(service).or_default();
        if !entries.iter().any(|existing| existing.id() == &id) {
            entries.push(Arc::new(credential));
        }
        id
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn len(&self, service: Service) -> usize {
        self.credentials.get(&service).map_or(0, Vec::len)
    }

    fn entries(&self, service: Service) -> &[Arc<Credential>] {
        self.credentials
            .get(&service)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Current health, flipping an expired rate limit back to `Active`.
    fn current_health(&self, credential: &Credential, now: Instant) -> CredentialHealth {
        let mut health = credential
            .health
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let CredentialHealth::RateLimited { until } = *health
            && until <= now
        {
            *health = CredentialHealth::Active;
            drop(health);
            self.events.emit(PoolEvent::Recovered {
                at: SystemTime::now(),
                service: credential.service(),
                credential: credential.id().clone(),
            });
            return CredentialHealth::Active;
        }
        *health
    }

    /// Picks the least-recently-used available credential able to serve
    /// `model` of `family`.
    pub fn select(
        &self,
        service: Service,
        family: ModelFamily,
        model: &str,
    ) -> Result<CredentialLease, NoCredential> {
        self.select_where(service, |credential| credential.supports(family, model))
            .ok_or(NoCredential { service, family })
    }

    /// Any usable credential of the service, for service-level calls such as
    /// listing models.
    pub fn select_any(&self, service: Service) -> Option<CredentialLease> {
        self.select_where(service, |_| true)
    }

    fn select_where(
        &self,
        service: Service,
        accept: impl Fn(&Credential) -> bool,
    ) -> Option<CredentialLease> {
        loop {
            let now = Instant::now();
            let mut best: Option<(&Arc<Credential>, u64)> = None;
            for credential in self.entries(service) {
                if !accept(credential.as_ref()) {
                    continue;
                }
                if self.current_health(credential, now) != CredentialHealth::Active {
                    continue;
                }
                let stamp = credential.last_used.load(Ordering::Acquire);
                if best.is_none_or(|(_, best_stamp)| stamp < best_stamp) {
                    best = Some((credential, stamp));
                }
            }
            let (credential, stamp) = best?;
            let next = self.clock.fetch_add(1, Ordering::AcqRel) + 1;
            if credential
                .last_used
                .compare_exchange(stamp, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(CredentialLease::new(Arc::clone(credential)));
            }
        }
    }

    /// Applies the outcome of the attempt made with `lease`.
    pub fn report_outcome(&self, lease: CredentialLease, outcome: Outcome) {
        let credential = &lease.credential;
        let event = {
            let mut health = credential
                .health
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match outcome {
                Outcome::Success => None,
                Outcome::RateLimited { .. } if health.is_disabled() => None,
                Outcome::RateLimited { retry_after } => {
                    *health = CredentialHealth::RateLimited {
                        until: Instant::now() + retry_after,
                    };
                    Some(PoolEvent::RateLimited {
                        at: SystemTime::now(),
                        service: credential.service(),
                        credential: credential.id().clone(),
                        retry_after_ms: u64::try_from(retry_after.as_millis())
                            .unwrap_or(u64::MAX),
                    })
                }
                Outcome::Invalid | Outcome::QuotaExceeded => {
                    let reason = if outcome == Outcome::Invalid {
                        DisableReason::Invalid
                    } else {
                        DisableReason::QuotaExceeded
                    };
                    if health.is_disabled() {
                        None
                    } else {
                        *health = CredentialHealth::Disabled { reason };
                        Some(PoolEvent::Disabled {
                            at: SystemTime::now(),
                            service: credential.service(),
                            credential: credential.id().clone(),
                            reason,
                        })
                    }
                }
            }
        };
        if let Some(event) = event {
            self.events.emit(event);
        }
    }

    /// Model ids reachable through the service's usable credentials.
    pub fn list_models(&self, service: Service, allowed: &[ModelFamily]) -> Vec<String> {
        let now = Instant::now();
        let prefixes = service.known_model_prefixes();
        let mut models: Vec<String> = self
            .entries(service)
            .iter()
            .filter(|credential| !self.current_health(credential, now).is_disabled())
            .flat_map(|credential| {
                credential.models().iter().filter(move |model| {
                    credential
                        .families()
                        .contains(&ModelFamily::classify(service, model))
                })
            })
            .filter(|model| allowed.contains(&ModelFamily::classify(service, model)))
            .filter(|model| prefixes.iter().any(|prefix| model.starts_with(prefix)))
            .filter(|model| !is_fine_tune(model))
            .cloned()
            .collect();
        models.sort();
        models.dedup();
        models
    }

    pub fn snapshot(&self, service: Service) -> Vec<CredentialRow> {
        let now = Instant::now();
        self.entries(service)
            .iter()
            .map(|credential| CredentialRow {
                id: credential.id().clone(),
                health: self.current_health(credential, now),
                in_flight: credential.in_flight.load(Ordering::Acquire),
            })
            .collect()
    }

    pub fn health(&self, id: &CredentialId) -> Option<CredentialHealth> {
        let now = Instant::now();
        self.credentials
            .values()
            .flatten()
            .find(|credential| credential.id() == id)
            .map(|credential| self.current_health(credential, now))
    }
}
