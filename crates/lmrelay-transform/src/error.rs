use lmrelay_protocol::Dialect;
use serde_json::Value;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransformError {
    /// The client sent something that cannot be translated; surfaced verbatim.
    #[error("{message}")]
    Client {
        message: String,
        details: Option<Value>,
    },
    #[error("no translation from {from} to {to}")]
    Unsupported { from: Dialect, to: Dialect },
    /// An upstream body did not have the shape its dialect promises.
    #[error("malformed {dialect} body: {message}")]
    Shape { dialect: Dialect, message: String },
}

impl TransformError {
    pub fn client(message: impl Into<String>) -> Self {
        TransformError::Client {
            message: message.into(),
            details: None,
        }
    }

    pub fn shape(dialect: Dialect, message: impl Into<String>) -> Self {
        TransformError::Shape {
            dialect,
            message: message.into(),
        }
    }
}
