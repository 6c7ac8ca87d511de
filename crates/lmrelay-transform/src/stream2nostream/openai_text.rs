use std::collections::BTreeMap;

use serde_json::{Value, json};

use super::{into_object, str_field};
use crate::inbound::JsonObject;

#[derive(Debug, Clone, Default)]
struct ChoiceState {
    text: String,
    finish_reason: Option<Value>,
}

/// Folds streamed `text_completion` frames.
#[derive(Debug, Clone, Default)]
pub struct OpenAITextAggregator {
    identity: Option<(String, i64, String)>,
    usage: Option<Value>,
    choices: BTreeMap<i64, ChoiceState>,
}

impl OpenAITextAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &Value) {
        if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
            self.usage = Some(usage.clone());
        }
        let Some(choices) = chunk
            .get("choices")
            .and_then(Value::as_array)
            .filter(|choices| !choices.is_empty())
        else {
            return;
        };
        if self.identity.is_none()
            && let Some(id) = str_field(chunk, "id")
        {
            let created = chunk.get("created").and_then(Value::as_i64).unwrap_or(0);
            let model = str_field(chunk, "model").unwrap_or_default();
            self.identity = Some((id, created, model));
        }
        for choice in choices {
            let index = choice.get("index").and_then(Value::as_i64).unwrap_or(0);
            let state = self.choices.entry(index).or_default();
            if let Some(text) = choice.get("text").and_then(Value::as_str) {
                state.text.push_str(text);
            }
            if state.finish_reason.is_none()
                && let Some(reason) = choice.get("finish_reason").filter(|r| !r.is_null())
            {
                state.finish_reason = Some(reason.clone());
            }
        }
    }

    pub fn finish(self) -> JsonObject {
        let (id, created, model) = self.identity.unwrap_or_default();
        let mut choices: Vec<Value> = self
            .choices
            .into_iter()
            .map(|(index, state)| {
                json!({
                    "index": index,
                    "text": state.text,
                    "logprobs": null,
                    "finish_reason": state.finish_reason,
                })
            })
            .collect();
        if choices.is_empty() {
            choices.push(json!({"index": 0, "text": "", "logprobs": null, "finish_reason": null}));
        }
        let mut out = into_object(json!({
            "id": id,
            "object": "text_completion",
            "created": created,
            "model": model,
            "choices": choices,
        }));
        if let Some(usage) = self.usage {
            out.insert("usage".to_string(), usage);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_text_deltas() {
        let mut aggregator = OpenAITextAggregator::new();
        for (text, finish) in [("Once", None), (" upon", None), ("", Some("length"))] {
            aggregator.push(&json!({
                "id": "cmpl-9",
                "object": "text_completion",
                "created": 10,
                "model": "gpt-3.5-turbo-instruct",
                "choices": [{"index": 0, "text": text, "finish_reason": finish}]
            }));
        }
        let out = aggregator.finish();
        assert_eq!(out["id"], json!("cmpl-9"));
        assert_eq!(out["choices"][0]["text"], json!("Once upon"));
        assert_eq!(out["choices"][0]["finish_reason"], json!("length"));
    }
}
