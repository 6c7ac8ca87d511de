use serde_json::{Value, json};

use super::{into_object, str_field};
use crate::inbound::JsonObject;

/// Folds legacy `completion` events.
#[derive(Debug, Clone, Default)]
pub struct AnthropicTextAggregator {
    id: Option<String>,
    model: Option<String>,
    completion: String,
    stop_reason: Option<Value>,
    stop: Option<Value>,
}

impl AnthropicTextAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: &Value) {
        if event.get("type").and_then(Value::as_str) != Some("completion") {
            return;
        }
        if self.id.is_none() {
            self.id = str_field(event, "log_id").or_else(|| str_field(event, "id"));
            self.model = str_field(event, "model");
        }
        if let Some(text) = event.get("completion").and_then(Value::as_str) {
            self.completion.push_str(text);
        }
        if let Some(reason) = event.get("stop_reason").filter(|r| !r.is_null()) {
            self.stop_reason.get_or_insert_with(|| reason.clone());
        }
        if let Some(stop) = event.get("stop").filter(|s| !s.is_null()) {
            self.stop = Some(stop.clone());
        }
    }

    pub fn finish(self) -> JsonObject {
        into_object(json!({
            "type": "completion",
            "id": self.id.unwrap_or_default(),
            "completion": self.completion,
            "stop_reason": self.stop_reason,
            "stop": self.stop,
            "model": self.model.unwrap_or_default(),
        }))
    }
}
