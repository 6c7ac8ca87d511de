//! Request-side normalization: which dialect goes upstream and how the
//! client body is rewritten to reach it.

use lmrelay_protocol::{Dialect, ModelFamily, Service};
use serde_json::{Map, Value, json};

use crate::content::content_to_text;
use crate::error::TransformError;

pub type JsonObject = Map<String, Value>;

/// Model every turbo-instruct compatibility request is pinned to.
pub const TURBO_INSTRUCT_MODEL: &str = "gpt-3.5-turbo-instruct";

/// `max_tokens` used when an OpenAI chat request without one is sent to Anthropic.
pub const DEFAULT_ANTHROPIC_MAX_TOKENS: u64 = 4096;

/// Output ceilings above this need the long-output beta header.
pub const ANTHROPIC_LONG_OUTPUT_THRESHOLD: u64 = 4096;
pub const ANTHROPIC_BETA_HEADER: &str = "anthropic-beta";
pub const ANTHROPIC_LONG_OUTPUT_BETA: &str = "max-tokens-3-5-sonnet-2024-07-15";

const HUMAN_TURN: &str = "\n\nHuman:";
const ASSISTANT_TURN: &str = "\n\nAssistant:";

pub fn resolve_outbound(service: Service, inbound: Dialect, family: ModelFamily) -> Dialect {
    match (service, inbound) {
        (Service::OpenAI, Dialect::OpenAIText) if family.is_chat_only() => Dialect::OpenAIChat,
        (Service::Anthropic, Dialect::AnthropicText) if family.is_chat_only() => {
            Dialect::AnthropicChat
        }
        (Service::Anthropic, Dialect::OpenAIChat) => {
            if family.is_chat_only() {
                Dialect::AnthropicChat
            } else {
                Dialect::AnthropicText
            }
        }
        (Service::GoogleAI, Dialect::GoogleChat) => Dialect::OpenAIChat,
        (_, other) => other,
    }
}

pub fn require_model(body: &JsonObject) -> Result<String, TransformError> {
    match body.get("model") {
        Some(Value::String(model)) if !model.is_empty() => Ok(model.clone()),
        _ => Err(TransformError::client("`model` must be a non-empty string")),
    }
}

pub fn wants_stream(body: &JsonObject) -> bool {
    body.get("stream").and_then(Value::as_bool).unwrap_or(false)
}

/// Decides the inbound dialect of a turbo-instruct compatibility request.
///
/// Exactly one of `prompt` and `messages` must be present. Either way the
/// model is pinned to [`TURBO_INSTRUCT_MODEL`].
pub fn resolve_turbo_instruct(body: &mut JsonObject) -> Result<Dialect, TransformError> {
    let has_prompt = body.get("prompt").is_some_and(|v| !v.is_null());
    let has_messages = body.get("messages").is_some_and(|v| !v.is_null());
    let dialect = match (has_prompt, has_messages) {
        (true, false) => Dialect::OpenAIText,
        (false, true) => Dialect::OpenAIChat,
        _ => {
            return Err(TransformError::client(
                "`prompt` OR `messages` must be provided",
            ));
        }
    };
    body.insert("model".to_string(), json!(TURBO_INSTRUCT_MODEL));
    Ok(dialect)
}

/// Moves `max_tokens` to `max_completion_tokens` unless the latter is set.
pub fn fixup_max_tokens(body: &mut JsonObject) {
    let legacy = body.remove("max_tokens");
    let current = body
        .get("max_completion_tokens")
        .is_some_and(|v| !v.is_null());
    if !current && let Some(value) = legacy.filter(|v| !v.is_null()) {
        body.insert("max_completion_tokens".to_string(), value);
    }
}

/// The requested output ceiling of an Anthropic-bound body.
pub fn output_ceiling(outbound: Dialect, body: &JsonObject) -> Option<u64> {
    let field = match outbound {
        Dialect::AnthropicText => "max_tokens_to_sample",
        Dialect::AnthropicChat => "max_tokens",
        _ => return None,
    };
    body.get(field).and_then(Value::as_u64)
}

/// Headers an upstream needs to accept an otherwise valid body.
pub fn compat_headers(outbound: Dialect, body: &JsonObject) -> Vec<(&'static str, &'static str)> {
    match output_ceiling(outbound, body) {
        Some(ceiling) if ceiling > ANTHROPIC_LONG_OUTPUT_THRESHOLD => {
            vec![(ANTHROPIC_BETA_HEADER, ANTHROPIC_LONG_OUTPUT_BETA)]
        }
        _ => Vec::new(),
    }
}

/// Replaces models outside a family with the service's flagship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagshipPolicy {
    /// Substring that marks a model as already belonging to the family.
    pub marker: String,
    pub flagship: String,
}

impl FlagshipPolicy {
    pub fn new(marker: impl Into<String>, flagship: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            flagship: flagship.into(),
        }
    }

    /// Returns the replaced model id when a reassignment happened.
    pub fn apply(&self, body: &mut JsonObject) -> Option<String> {
        let current = body.get("model").and_then(Value::as_str).unwrap_or("");
        if current.contains(&self.marker) {
            return None;
        }
        let previous = current.to_string();
        body.insert("model".to_string(), json!(self.flagship));
        Some(previous)
    }
}

pub fn translate_request(
    inbound: Dialect,
    outbound: Dialect,
    body: JsonObject,
) -> Result<JsonObject, TransformError> {
    match (inbound, outbound) {
        (from, to) if from == to => Ok(body),
        (Dialect::GoogleChat, Dialect::OpenAIChat) => Ok(body),
        (Dialect::OpenAIText, Dialect::OpenAIChat) => openai_text_to_chat(body),
        (Dialect::OpenAIChat, Dialect::OpenAIText) => openai_chat_to_text(body),
        (Dialect::AnthropicText, Dialect::AnthropicChat) => anthropic_text_to_chat(body),
        (Dialect::OpenAIChat, Dialect::AnthropicChat) => openai_chat_to_anthropic_chat(body),
        (Dialect::OpenAIChat, Dialect::AnthropicText) => openai_chat_to_anthropic_text(body),
        (from, to) => Err(TransformError::Unsupported { from, to }),
    }
}

fn prompt_text(body: &JsonObject) -> Result<String, TransformError> {
    match body.get("prompt") {
        Some(Value::String(prompt)) => Ok(prompt.clone()),
        Some(Value::Array(parts)) => {
            let parts = parts
                .iter()
                .map(|part| {
                    part.as_str()
                        .ok_or_else(|| TransformError::client("`prompt` must contain strings"))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(parts.join("\n"))
        }
        _ => Err(TransformError::client("`prompt` must be a string")),
    }
}

struct Turn {
    role: String,
    content: String,
}

fn chat_turns(body: &JsonObject) -> Result<Vec<Turn>, TransformError> {
    let Some(Value::Array(messages)) = body.get("messages") else {
        return Err(TransformError::client("`messages` must be an array"));
    };
    messages
        .iter()
        .map(|message| {
            let role = message
                .get("role")
                .and_then(Value::as_str)
                .ok_or_else(|| TransformError::client("every message needs a `role`"))?;
            Ok(Turn {
                role: role.to_string(),
                content: content_to_text(message.get("content")),
            })
        })
        .collect()
}

fn copy_fields(from: &JsonObject, to: &mut JsonObject, fields: &[&str]) {
    for field in fields {
        if let Some(value) = from.get(*field) {
            to.insert((*field).to_string(), value.clone());
        }
    }
}

fn openai_text_to_chat(mut body: JsonObject) -> Result<JsonObject, TransformError> {
    let prompt = prompt_text(&body)?;
    body.remove("prompt");
    // Text-only knobs; `logprobs` changes type between the two dialects.
    for field in ["echo", "suffix", "best_of", "logprobs"] {
        body.remove(field);
    }
    body.insert(
        "messages".to_string(),
        json!([{ "role": "user", "content": prompt }]),
    );
    Ok(body)
}

fn openai_chat_to_text(mut body: JsonObject) -> Result<JsonObject, TransformError> {
    let turns = chat_turns(&body)?;
    let mut prompt = turns
        .iter()
        .map(|turn| format!("{}: {}", turn.role, turn.content))
        .collect::<Vec<_>>()
        .join("\n\n");
    prompt.push_str("\n\nassistant:");
    body.remove("messages");
    if let Some(ceiling) = body.remove("max_completion_tokens") {
        body.entry("max_tokens").or_insert(ceiling);
    }
    for field in ["tools", "tool_choice", "response_format", "parallel_tool_calls"] {
        body.remove(field);
    }
    body.insert("prompt".to_string(), json!(prompt));
    Ok(body)
}

/// Splits a `\n\nHuman:` / `\n\nAssistant:` transcript into turns.
/// Text before the first marker becomes the system prompt.
fn parse_transcript(prompt: &str) -> (Option<String>, Vec<Turn>) {
    let mut turns: Vec<Turn> = Vec::new();
    let mut rest = prompt;
    let mut current_role: Option<&str> = None;
    let mut system = None;
    loop {
        let next_human = rest.find(HUMAN_TURN).map(|at| (at, "user", HUMAN_TURN.len()));
        let next_assistant = rest
            .find(ASSISTANT_TURN)
            .map(|at| (at, "assistant", ASSISTANT_TURN.len()));
        let next = match (next_human, next_assistant) {
            (Some(h), Some(a)) => Some(if h.0 < a.0 { h } else { a }),
            (h, a) => h.or(a),
        };
        let (segment, advance) = match next {
            Some((at, role, len)) => (&rest[..at], Some((role, at + len))),
            None => (rest, None),
        };
        let text = segment.trim();
        match current_role {
            None if !text.is_empty() => system = Some(text.to_string()),
            None => {}
            Some(role) => push_turn(&mut turns, role, text),
        }
        match advance {
            Some((role, offset)) => {
                current_role = Some(role);
                rest = &rest[offset..];
            }
            None => break,
        }
    }
    while turns
        .last()
        .is_some_and(|turn| turn.role == "assistant" && turn.content.is_empty())
    {
        turns.pop();
    }
    (system, turns)
}

/// Appends a turn, merging into the previous one when the role repeats.
fn push_turn(turns: &mut Vec<Turn>, role: &str, text: &str) {
    if let Some(last) = turns.last_mut()
        && last.role == role
    {
        if !text.is_empty() {
            if !last.content.is_empty() {
                last.content.push_str("\n\n");
            }
            last.content.push_str(text);
        }
        return;
    }
    turns.push(Turn {
        role: role.to_string(),
        content: text.to_string(),
    });
}

fn anthropic_text_to_chat(body: JsonObject) -> Result<JsonObject, TransformError> {
    let prompt = prompt_text(&body)?;
    let (system, turns) = parse_transcript(&prompt);
    if !turns.iter().any(|turn| turn.role == "user") {
        return Err(TransformError::client("`prompt` contains no Human turn"));
    }
    let mut out = JsonObject::new();
    copy_fields(
        &body,
        &mut out,
        &["model", "stop_sequences", "stream", "temperature", "top_p", "top_k", "metadata"],
    );
    if let Some(system) = system {
        out.insert("system".to_string(), json!(system));
    }
    out.insert("messages".to_string(), turns_to_messages(&turns));
    let ceiling = body
        .get("max_tokens_to_sample")
        .cloned()
        .unwrap_or_else(|| json!(DEFAULT_ANTHROPIC_MAX_TOKENS));
    out.insert("max_tokens".to_string(), ceiling);
    Ok(out)
}

fn turns_to_messages(turns: &[Turn]) -> Value {
    Value::Array(
        turns
            .iter()
            .map(|turn| json!({ "role": turn.role, "content": turn.content }))
            .collect(),
    )
}

/// Separates system prompts and folds tool/function turns into user turns.
fn split_openai_turns(body: &JsonObject) -> Result<(Vec<String>, Vec<Turn>), TransformError> {
    let mut system = Vec::new();
    let mut turns = Vec::new();
    for turn in chat_turns(body)? {
        match turn.role.as_str() {
            "system" | "developer" => system.push(turn.content),
            "assistant" => push_turn(&mut turns, "assistant", &turn.content),
            _ => push_turn(&mut turns, "user", &turn.content),
        }
    }
    Ok((system, turns))
}

fn openai_ceiling(body: &JsonObject) -> Value {
    body.get("max_completion_tokens")
        .filter(|v| !v.is_null())
        .or_else(|| body.get("max_tokens").filter(|v| !v.is_null()))
        .cloned()
        .unwrap_or_else(|| json!(DEFAULT_ANTHROPIC_MAX_TOKENS))
}

fn openai_stop(body: &JsonObject) -> Option<Value> {
    match body.get("stop") {
        Some(Value::String(stop)) => Some(json!([stop])),
        Some(Value::Array(stops)) => Some(Value::Array(stops.clone())),
        _ => None,
    }
}

fn openai_chat_to_anthropic_chat(body: JsonObject) -> Result<JsonObject, TransformError> {
    let (system, turns) = split_openai_turns(&body)?;
    if turns.is_empty() {
        return Err(TransformError::client("`messages` contains no user turn"));
    }
    let mut out = JsonObject::new();
    copy_fields(&body, &mut out, &["model", "stream", "temperature", "top_p"]);
    if !system.is_empty() {
        out.insert("system".to_string(), json!(system.join("\n")));
    }
    out.insert("messages".to_string(), turns_to_messages(&turns));
    out.insert("max_tokens".to_string(), openai_ceiling(&body));
    if let Some(stop) = openai_stop(&body) {
        out.insert("stop_sequences".to_string(), stop);
    }
    Ok(out)
}

fn openai_chat_to_anthropic_text(body: JsonObject) -> Result<JsonObject, TransformError> {
    let (system, turns) = split_openai_turns(&body)?;
    let mut prompt = system.join("\n");
    for turn in &turns {
        let marker = if turn.role == "assistant" {
            ASSISTANT_TURN
        } else {
            HUMAN_TURN
        };
        prompt.push_str(marker);
        prompt.push(' ');
        prompt.push_str(&turn.content);
    }
    prompt.push_str(ASSISTANT_TURN);

    let mut out = JsonObject::new();
    copy_fields(&body, &mut out, &["model", "stream", "temperature", "top_p"]);
    out.insert("prompt".to_string(), json!(prompt));
    out.insert("max_tokens_to_sample".to_string(), openai_ceiling(&body));
    if let Some(stop) = openai_stop(&body) {
        out.insert("stop_sequences".to_string(), stop);
    }
    Ok(out)
}
