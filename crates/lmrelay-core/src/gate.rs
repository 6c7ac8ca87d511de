use std::net::IpAddr;

use lmrelay_protocol::Service;
use lmrelay_provider_core::ProxyError;

/// Decides whether a client may use a service at all. Runs after the
/// request is classified and before any credential is touched.
pub trait AdmissionGate: Send + Sync {
    fn check(&self, service: Service, client: Option<IpAddr>) -> Result<(), ProxyError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AdmissionGate for AllowAll {
    fn check(&self, _service: Service, _client: Option<IpAddr>) -> Result<(), ProxyError> {
        Ok(())
    }
}
