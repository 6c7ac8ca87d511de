use bytes::Bytes;
use http::Method;
use lmrelay_common::GlobalConfig;
use lmrelay_protocol::{Dialect, ModelFamily, ResponseMode, Service};
use lmrelay_provider_core::{ProxyError, ProxyRequest};
use lmrelay_transform::inbound::{self, FlagshipPolicy};
use lmrelay_transform::JsonObject;
use serde_json::Value;

use crate::pipeline::Pipeline;

/// A client-facing route under `/{service}/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Models,
    ChatCompletions,
    Completions,
    TurboInstruct,
    Messages,
    Complete,
    Embeddings,
}

impl Endpoint {
    pub fn parse(service: Service, path: &str) -> Option<Endpoint> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let endpoint = match segments.as_slice() {
            ["v1", "models"] => Endpoint::Models,
            ["v1", "chat", "completions"] => Endpoint::ChatCompletions,
            ["v1", "completions"] => Endpoint::Completions,
            ["v1", "turbo-instruct", "chat", "completions"] => Endpoint::TurboInstruct,
            ["v1", "messages"] => Endpoint::Messages,
            ["v1", "complete"] => Endpoint::Complete,
            ["v1", "embeddings"] => Endpoint::Embeddings,
            _ => return None,
        };
        endpoint.served_by(service).then_some(endpoint)
    }

    pub fn served_by(self, service: Service) -> bool {
        match self {
            Endpoint::Models | Endpoint::ChatCompletions => true,
            Endpoint::Completions | Endpoint::TurboInstruct | Endpoint::Embeddings => {
                service == Service::OpenAI
            }
            Endpoint::Messages | Endpoint::Complete => service == Service::Anthropic,
        }
    }

    pub fn method(self) -> Method {
        match self {
            Endpoint::Models => Method::GET,
            _ => Method::POST,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Endpoint::Models => "models",
            Endpoint::ChatCompletions => "chat_completions",
            Endpoint::Completions => "completions",
            Endpoint::TurboInstruct => "turbo_instruct",
            Endpoint::Messages => "messages",
            Endpoint::Complete => "complete",
            Endpoint::Embeddings => "embeddings",
        }
    }

    fn inbound(self, service: Service) -> Option<Dialect> {
        match self {
            Endpoint::Models | Endpoint::TurboInstruct => None,
            Endpoint::ChatCompletions if service == Service::GoogleAI => Some(Dialect::GoogleChat),
            Endpoint::ChatCompletions => Some(Dialect::OpenAIChat),
            Endpoint::Completions => Some(Dialect::OpenAIText),
            Endpoint::Messages => Some(Dialect::AnthropicChat),
            Endpoint::Complete => Some(Dialect::AnthropicText),
            Endpoint::Embeddings => Some(Dialect::OpenAIEmbedding),
        }
    }
}

#[derive(Debug)]
pub enum Classified {
    Models,
    Proxy {
        request: ProxyRequest,
        pipeline: Pipeline,
    },
}

/// Validates the ingress request and resolves dialects, family and mode.
pub fn classify_request(
    service: Service,
    method: &Method,
    path: &str,
    body: Bytes,
    config: &GlobalConfig,
    trace_id: &str,
) -> Result<Classified, ProxyError> {
    let endpoint = Endpoint::parse(service, path)
        .ok_or_else(|| ProxyError::NotFound(format!("{service} does not serve /{path}")))?;
    if *method != endpoint.method() {
        return Err(ProxyError::NotFound(format!(
            "{method} is not supported on /{path}"
        )));
    }
    if endpoint == Endpoint::Models {
        return Ok(Classified::Models);
    }

    let mut body = parse_object(&body)?;
    let inbound = match endpoint.inbound(service) {
        Some(dialect) => dialect,
        None => inbound::resolve_turbo_instruct(&mut body)?,
    };

    if service == Service::Anthropic && endpoint == Endpoint::ChatCompletions {
        reassign_flagship(config, &mut body, trace_id);
    }

    let model = inbound::require_model(&body)?;
    let family = ModelFamily::classify(service, &model);
    if !config.family_allowed(family) {
        return Err(ProxyError::Client {
            message: format!("model family {family} is not allowed"),
            details: Some(serde_json::json!({ "model": model, "family": family })),
        });
    }

    let outbound = if endpoint == Endpoint::TurboInstruct {
        Dialect::OpenAIText
    } else {
        inbound::resolve_outbound(service, inbound, family)
    };
    let mode = if inbound.supports_streaming() && inbound::wants_stream(&body) {
        ResponseMode::Streaming
    } else {
        ResponseMode::Blocking
    };

    let pipeline = Pipeline::for_route(service, inbound, outbound);
    let request = ProxyRequest::new(service, inbound, outbound, model, family, body, mode)
        .with_trace_id(trace_id);
    Ok(Classified::Proxy { request, pipeline })
}

fn parse_object(body: &[u8]) -> Result<JsonObject, ProxyError> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(_) => Err(ProxyError::client("request body must be a JSON object")),
        Err(err) => Err(ProxyError::Client {
            message: "request body is not valid JSON".to_string(),
            details: Some(serde_json::json!({ "parse_error": err.to_string() })),
        }),
    }
}

fn reassign_flagship(config: &GlobalConfig, body: &mut JsonObject, trace_id: &str) {
    let Some(service_config) = config.service(Service::Anthropic) else {
        return;
    };
    let Some(flagship) = service_config
        .flagship_model
        .as_deref()
        .filter(|model| !model.is_empty())
    else {
        return;
    };
    let policy = FlagshipPolicy::new(service_config.flagship_marker.as_str(), flagship);
    if let Some(previous) = policy.apply(body) {
        tracing::info!(
            event = "model_reassigned",
            trace_id = %trace_id,
            service = %Service::Anthropic,
            from = %previous,
            to = %flagship,
        );
    }
}
