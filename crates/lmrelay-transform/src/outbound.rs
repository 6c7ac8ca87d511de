//! Response-side translation from the upstream (outbound) dialect back to
//! the dialect the client spoke.

use lmrelay_protocol::Dialect;
use serde_json::{Value, json};

use crate::content::flatten_content_blocks;
use crate::error::TransformError;
use crate::inbound::JsonObject;
use crate::usage::TokenUsage;

/// Facts about the exchange that are not in the upstream body.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseContext {
    pub usage: TokenUsage,
    /// Unix seconds used for `created` when the upstream omits it.
    pub created: i64,
}

impl ResponseContext {
    pub fn now(usage: TokenUsage) -> Self {
        Self {
            usage,
            created: time::OffsetDateTime::now_utc().unix_timestamp(),
        }
    }
}

/// Ids of Anthropic responses handed to OpenAI-dialect clients carry this prefix.
pub const ANTHROPIC_ID_PREFIX: &str = "ant-";

pub fn translate_response(
    inbound: Dialect,
    outbound: Dialect,
    body: JsonObject,
    ctx: &ResponseContext,
) -> Result<JsonObject, TransformError> {
    match (inbound, outbound) {
        (from, to) if from == to => Ok(body),
        (Dialect::GoogleChat, Dialect::OpenAIChat) => Ok(body),
        (Dialect::OpenAIChat, Dialect::OpenAIText) => openai_text_to_chat(body),
        (Dialect::OpenAIText, Dialect::OpenAIChat) => openai_chat_to_text(body),
        (Dialect::OpenAIChat, Dialect::AnthropicChat) => anthropic_chat_to_openai(body, ctx),
        (Dialect::OpenAIChat, Dialect::AnthropicText) => anthropic_text_to_openai(body, ctx),
        (Dialect::AnthropicText, Dialect::AnthropicChat) => anthropic_chat_to_text(body),
        (to, from) => Err(TransformError::Unsupported { from, to }),
    }
}

fn first_choice(dialect: Dialect, body: &mut JsonObject) -> Result<JsonObject, TransformError> {
    let choice = body
        .get_mut("choices")
        .and_then(Value::as_array_mut)
        .filter(|choices| !choices.is_empty())
        .map(|choices| choices.swap_remove(0));
    match choice {
        Some(Value::Object(choice)) => Ok(choice),
        _ => Err(TransformError::shape(dialect, "missing `choices[0]`")),
    }
}

/// Turbo-instruct compatibility: a text completion handed to a chat client.
fn openai_text_to_chat(mut body: JsonObject) -> Result<JsonObject, TransformError> {
    let mut choice = first_choice(Dialect::OpenAIText, &mut body)?;
    let text = choice
        .remove("text")
        .and_then(|text| text.as_str().map(str::to_string))
        .unwrap_or_default();
    choice.remove("logprobs");
    choice.insert(
        "message".to_string(),
        json!({ "role": "assistant", "content": text.trim() }),
    );
    body.insert("object".to_string(), json!("chat.completion"));
    body.insert("choices".to_string(), json!([choice]));
    Ok(body)
}

/// A text request that was upgraded to chat upstream.
fn openai_chat_to_text(mut body: JsonObject) -> Result<JsonObject, TransformError> {
    let Some(Value::Array(choices)) = body.remove("choices") else {
        return Err(TransformError::shape(Dialect::OpenAIChat, "missing `choices`"));
    };
    let choices = choices
        .into_iter()
        .map(|choice| {
            let Value::Object(mut choice) = choice else {
                return choice;
            };
            let text = choice
                .remove("message")
                .and_then(|message| {
                    message
                        .get("content")
                        .and_then(Value::as_str)
                        .map(|content| content.trim().to_string())
                })
                .unwrap_or_default();
            choice.insert("text".to_string(), json!(text));
            choice.entry("logprobs").or_insert(Value::Null);
            Value::Object(choice)
        })
        .collect::<Vec<_>>();
    body.insert("object".to_string(), json!("text_completion"));
    body.insert("choices".to_string(), Value::Array(choices));
    Ok(body)
}

fn anthropic_id(body: &JsonObject, fields: &[&str]) -> String {
    let raw = fields
        .iter()
        .find_map(|field| body.get(*field).and_then(Value::as_str))
        .unwrap_or_default();
    format!("{ANTHROPIC_ID_PREFIX}{raw}")
}

fn content_blocks(body: &JsonObject) -> Result<String, TransformError> {
    match body.get("content") {
        Some(Value::Array(blocks)) => Ok(flatten_content_blocks(blocks)),
        _ => Err(TransformError::shape(
            Dialect::AnthropicChat,
            "missing `content` array",
        )),
    }
}

fn anthropic_chat_to_openai(
    body: JsonObject,
    ctx: &ResponseContext,
) -> Result<JsonObject, TransformError> {
    let content = content_blocks(&body)?;
    let usage = TokenUsage::from_response(Dialect::AnthropicChat, &body);
    let usage = if usage == TokenUsage::default() {
        ctx.usage
    } else {
        usage
    };
    let out = json!({
        "id": anthropic_id(&body, &["id"]),
        "object": "chat.completion",
        "created": ctx.created,
        "model": body.get("model").cloned().unwrap_or(Value::Null),
        "usage": usage.to_openai(),
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": body.get("stop_reason").cloned().unwrap_or(Value::Null),
        }],
    });
    into_object(out)
}

fn anthropic_text_to_openai(
    body: JsonObject,
    ctx: &ResponseContext,
) -> Result<JsonObject, TransformError> {
    let Some(completion) = body.get("completion").and_then(Value::as_str) else {
        return Err(TransformError::shape(
            Dialect::AnthropicText,
            "missing `completion`",
        ));
    };
    let out = json!({
        "id": anthropic_id(&body, &["log_id", "id"]),
        "object": "chat.completion",
        "created": ctx.created,
        "model": body.get("model").cloned().unwrap_or(Value::Null),
        "usage": ctx.usage.to_openai(),
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": completion.trim() },
            "finish_reason": body.get("stop_reason").cloned().unwrap_or(Value::Null),
        }],
    });
    into_object(out)
}

fn anthropic_chat_to_text(body: JsonObject) -> Result<JsonObject, TransformError> {
    let completion = content_blocks(&body)?;
    let field = |name: &str| body.get(name).cloned().unwrap_or(Value::Null);
    let out = json!({
        "type": "completion",
        "id": anthropic_id(&body, &["id"]),
        "completion": completion,
        "stop_reason": field("stop_reason"),
        "stop": field("stop_sequence"),
        "model": field("model"),
        "usage": field("usage"),
    });
    into_object(out)
}

fn into_object(value: Value) -> Result<JsonObject, TransformError> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Ok(JsonObject::new()),
    }
}
