use bytes::Bytes;
use lmrelay_protocol::{Dialect, ModelFamily, ResponseMode, Service};
use lmrelay_transform::{JsonObject, TokenUsage};

use crate::credential::CredentialLease;
use crate::errors::ProxyError;
use crate::headers::Headers;

/// One client request as it moves through the pipeline and forwarder.
///
/// Owned by a single task; the credential lease is assigned at most once.
#[derive(Debug)]
pub struct ProxyRequest {
    pub trace_id: String,
    pub service: Service,
    pub inbound: Dialect,
    pub outbound: Dialect,
    pub model: String,
    pub family: ModelFamily,
    pub body: JsonObject,
    /// Upstream path, set by the path-selection step.
    pub path: Option<String>,
    pub headers: Headers,
    pub mode: ResponseMode,
    /// Serialized body, set by the final pipeline step.
    pub finalized: Option<Bytes>,
    pub usage: TokenUsage,
    lease: Option<CredentialLease>,
}

impl ProxyRequest {
    pub fn new(
        service: Service,
        inbound: Dialect,
        outbound: Dialect,
        model: String,
        family: ModelFamily,
        body: JsonObject,
        mode: ResponseMode,
    ) -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().to_string(),
            service,
            inbound,
            outbound,
            model,
            family,
            body,
            path: None,
            headers: Headers::new(),
            mode,
            finalized: None,
            usage: TokenUsage::default(),
            lease: None,
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn assign_lease(&mut self, lease: CredentialLease) -> Result<(), ProxyError> {
        if self.lease.is_some() {
            return Err(ProxyError::internal("credential already assigned"));
        }
        self.lease = Some(lease);
        Ok(())
    }

    pub fn lease(&self) -> Option<&CredentialLease> {
        self.lease.as_ref()
    }

    pub fn take_lease(&mut self) -> Option<CredentialLease> {
        self.lease.take()
    }

    pub fn is_streaming(&self) -> bool {
        self.mode == ResponseMode::Streaming
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{CredentialPool, CredentialSpec};
    use crate::events::EventHub;

    #[test]
    fn lease_is_assigned_once() {
        let mut pool = CredentialPool::new(EventHub::default());
        pool.insert(Service::OpenAI, CredentialSpec::new("a"));
        pool.insert(Service::OpenAI, CredentialSpec::new("b"));
        let mut request = ProxyRequest::new(
            Service::OpenAI,
            Dialect::OpenAIChat,
            Dialect::OpenAIChat,
            "gpt-4o".to_string(),
            ModelFamily::Gpt4o,
            JsonObject::new(),
            ResponseMode::Blocking,
        );
        let first = pool.select(Service::OpenAI, ModelFamily::Gpt4o, "gpt-4o").unwrap();
        let second = pool.select(Service::OpenAI, ModelFamily::Gpt4o, "gpt-4o").unwrap();
        request.assign_lease(first).unwrap();
        assert!(matches!(
            request.assign_lease(second),
            Err(ProxyError::Internal(_))
        ));
        assert!(request.lease().is_some());
    }
}
