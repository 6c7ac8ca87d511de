//! Wire-level vocabulary shared by every lmrelay crate.
//!
//! Nothing here performs IO: these are the tagged enums computed at ingress
//! (service, dialect, model family) and the JSON shapes the translator and
//! aggregators produce.

pub mod dialect;
pub mod error;
pub mod family;
pub mod openai;
pub mod service;
pub mod sse;

pub use dialect::{Dialect, ResponseMode};
pub use error::ErrorBody;
pub use family::{ModelFamily, is_fine_tune};
pub use service::{Service, UnknownService};
