//! Pure dialect translation: request normalization, response translation,
//! per-chunk stream translation and stream-to-non-stream aggregation.
//!
//! Every function here is a plain transformation over JSON objects; no
//! shared state and no IO.

pub mod content;
pub mod error;
pub mod inbound;
pub mod outbound;
pub mod stream;
pub mod stream2nostream;
pub mod usage;

pub use error::TransformError;
pub use inbound::{FlagshipPolicy, JsonObject};
pub use outbound::{ResponseContext, translate_response};
pub use stream::{StreamFrame, StreamTranslator};
pub use stream2nostream::StreamAggregator;
pub use usage::TokenUsage;
