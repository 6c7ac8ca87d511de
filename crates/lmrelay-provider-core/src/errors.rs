use bytes::Bytes;
use http::StatusCode;
use lmrelay_protocol::{ErrorBody, Service};
use lmrelay_transform::TransformError;
use serde_json::{Value, json};

use crate::credential::NoCredential;

pub type ProxyResult<T> = Result<T, ProxyError>;

/// Every way a proxied request can fail before or after reaching upstream.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    #[error("{message}")]
    Client {
        message: String,
        details: Option<Value>,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Gate(String),
    #[error("no {service} credential available")]
    NoCredentialAvailable { service: Service },
    #[error("timed out waiting for a {service} slot")]
    QueueTimeout { service: Service },
    #[error("upstream protocol error: {message}")]
    UpstreamProtocol { message: String },
    #[error("translation failed: {0}")]
    Transform(TransformError),
    #[error("upstream unreachable: {message}")]
    Network { message: String },
    #[error("upstream rejected credential ({status})")]
    CredentialRejected { status: StatusCode, body: Bytes },
    #[error("upstream error ({status})")]
    Upstream { status: StatusCode, body: Bytes },
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn client(message: impl Into<String>) -> Self {
        ProxyError::Client {
            message: message.into(),
            details: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ProxyError::Internal(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Client { .. } => StatusCode::BAD_REQUEST,
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::Gate(_) => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::NoCredentialAvailable { .. } | ProxyError::QueueTimeout { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::UpstreamProtocol { .. }
            | ProxyError::Transform(_)
            | ProxyError::Network { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::CredentialRejected { status, .. } | ProxyError::Upstream { status, .. } => {
                *status
            }
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the same request may succeed if retried later.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ProxyError::QueueTimeout { .. }
                | ProxyError::NoCredentialAvailable { .. }
                | ProxyError::Network { .. }
        ) || self.status() == StatusCode::TOO_MANY_REQUESTS
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Client { .. } => "client",
            ProxyError::NotFound(_) => "not_found",
            ProxyError::Gate(_) => "gate",
            ProxyError::NoCredentialAvailable { .. } => "no_credential_available",
            ProxyError::QueueTimeout { .. } => "queue_timeout",
            ProxyError::UpstreamProtocol { .. } => "upstream_protocol",
            ProxyError::Transform(_) => "transform",
            ProxyError::Network { .. } => "network",
            ProxyError::CredentialRejected { .. } => "credential_rejected",
            ProxyError::Upstream { .. } => "upstream",
            ProxyError::Internal(_) => "internal",
        }
    }

    /// Response body: upstream JSON verbatim, everything else as `{error, details?}`.
    pub fn body(&self) -> Bytes {
        match self {
            ProxyError::CredentialRejected { body, .. } | ProxyError::Upstream { body, .. } => {
                if serde_json::from_slice::<Value>(body).is_ok() {
                    return body.clone();
                }
                let text = String::from_utf8_lossy(body);
                let mut error = ErrorBody::new(self.to_string());
                if !text.trim().is_empty() {
                    error = error.with_details(json!({ "upstream_body": text }));
                }
                Bytes::from(error.to_vec())
            }
            ProxyError::Client {
                message,
                details: Some(details),
            } => Bytes::from(ErrorBody::new(message.clone()).with_details(details.clone()).to_vec()),
            ProxyError::QueueTimeout { .. } => Bytes::from(
                ErrorBody::new(self.to_string())
                    .with_details(json!({ "retriable": true }))
                    .to_vec(),
            ),
            other => Bytes::from(ErrorBody::new(other.to_string()).to_vec()),
        }
    }
}

impl From<TransformError> for ProxyError {
    fn from(value: TransformError) -> Self {
        match value {
            TransformError::Client { message, details } => ProxyError::Client { message, details },
            other => ProxyError::Transform(other),
        }
    }
}

impl From<NoCredential> for ProxyError {
    fn from(value: NoCredential) -> Self {
        ProxyError::NoCredentialAvailable {
            service: value.service,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses() {
        assert_eq!(ProxyError::client("bad").status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ProxyError::QueueTimeout {
                service: Service::OpenAI
            }
            .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyError::CredentialRejected {
                status: StatusCode::PAYMENT_REQUIRED,
                body: Bytes::new()
            }
            .status(),
            StatusCode::PAYMENT_REQUIRED
        );
    }

    #[test]
    fn upstream_json_is_passed_through() {
        let body = Bytes::from_static(br#"{"error":{"type":"rate_limit_error"}}"#);
        let err = ProxyError::Upstream {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: body.clone(),
        };
        assert_eq!(err.body(), body);
        assert!(err.is_retriable());
    }

    #[test]
    fn client_error_renders_details() {
        let err = ProxyError::from(TransformError::Client {
            message: "bad prompt".to_string(),
            details: Some(json!({"field": "prompt"})),
        });
        let body: Value = serde_json::from_slice(&err.body()).unwrap();
        assert_eq!(body, json!({"error": "bad prompt", "details": {"field": "prompt"}}));
    }
}
