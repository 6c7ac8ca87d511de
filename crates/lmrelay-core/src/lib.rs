//! HTTP surface of the relay: ingress classification, admission, the
//! mutation pipeline, upstream dispatch and the model catalog.

pub mod catalog;
pub mod classify;
pub mod core;
pub mod forwarder;
pub mod gate;
pub mod handler;
pub mod pipeline;
pub mod queue;
pub mod upstream_client;

pub use catalog::{ModelCatalog, ModelFetcher};
pub use classify::{Classified, Endpoint, classify_request};
pub use crate::core::{Core, CoreState, build_pool};
pub use forwarder::{BlockingResponseHandler, DialectResponseHandler, DispatchMeta, Forwarder};
pub use gate::{AdmissionGate, AllowAll};
pub use handler::REQUEST_ID_HEADER;
pub use pipeline::{MutationStep, Pipeline};
pub use queue::{AdmissionQueue, QueueSlot};
pub use upstream_client::{
    TransportError, TransportErrorKind, UpstreamBody, UpstreamClient, UpstreamClientConfig,
    UpstreamRequest, UpstreamResponse, WreqUpstreamClient,
};
