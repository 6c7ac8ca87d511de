//! Credential pool and the request/response/error types shared by the
//! forwarding layer.
//!
//! This crate does not depend on axum or any concrete HTTP client.

pub mod credential;
pub mod errors;
pub mod events;
pub mod headers;
pub mod request;
pub mod response;

pub use credential::{
    Credential, CredentialHealth, CredentialId, CredentialLease, CredentialPool, CredentialRow,
    CredentialSpec, DisableReason, NoCredential, Outcome,
};
pub use errors::{ProxyError, ProxyResult};
pub use events::{EventHub, EventSink, PoolEvent, TracingEventSink};
pub use headers::Headers;
pub use request::ProxyRequest;
pub use response::{ByteStream, ProxyResponse, StreamBody};
