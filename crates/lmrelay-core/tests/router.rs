use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use lmrelay_common::{GlobalConfig, GlobalConfigPatch, ModelListSource, ServiceConfig};
use lmrelay_core::{
    Core, REQUEST_ID_HEADER, TransportError, UpstreamBody, UpstreamClient, UpstreamRequest,
    UpstreamResponse,
};
use lmrelay_protocol::Service;
use lmrelay_provider_core::{EventHub, Headers};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower::ServiceExt;

enum Scripted {
    Json(u16, Value),
    Stream(Vec<&'static str>),
}

struct FakeUpstream {
    script: Mutex<VecDeque<Scripted>>,
    seen: Mutex<Vec<UpstreamRequest>>,
}

impl FakeUpstream {
    fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<UpstreamRequest> {
        self.seen.lock().unwrap().clone()
    }
}

impl UpstreamClient for FakeUpstream {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            self.seen.lock().unwrap().push(req);
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected upstream call");
            let (status, body) = match next {
                Scripted::Json(status, value) => {
                    (status, UpstreamBody::Bytes(Bytes::from(value.to_string())))
                }
                Scripted::Stream(frames) => {
                    let (tx, rx) = mpsc::channel(frames.len().max(1));
                    for frame in frames {
                        tx.try_send(Ok(Bytes::from(frame))).unwrap();
                    }
                    (200, UpstreamBody::Stream(rx))
                }
            };
            Ok(UpstreamResponse {
                status,
                headers: Headers::new(),
                body,
            })
        })
    }
}

fn config(keys: &[(Service, &str)]) -> GlobalConfig {
    let mut patch = GlobalConfigPatch::default();
    for service in Service::ALL {
        patch.services.insert(service, ServiceConfig::new(service));
    }
    for (service, key) in keys {
        patch
            .keys
            .entry(*service)
            .or_default()
            .push((*key).to_string());
    }
    patch.into_config().unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn read_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn anthropic_reply_is_translated_for_chat_clients() {
    let upstream = FakeUpstream::new(vec![Scripted::Json(
        200,
        json!({
            "id": "msg_1",
            "type": "message",
            "model": "claude-3-5-sonnet-latest",
            "content": [{"type": "text", "text": "Hi there"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 12, "output_tokens": 3}
        }),
    )]);
    let core = Core::new(
        config(&[(Service::Anthropic, "sk-ant-1")]),
        upstream.clone(),
        EventHub::default(),
    );

    let response = core
        .router()
        .oneshot(post(
            "/anthropic/v1/chat/completions",
            json!({
                "model": "claude-3-5-sonnet-latest",
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "hello"}
                ],
                "max_tokens": 100
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key(REQUEST_ID_HEADER));
    let body = read_json(response).await;
    assert_eq!(body["id"], "ant-msg_1");
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "Hi there");
    assert_eq!(body["usage"]["prompt_tokens"], 12);
    assert_eq!(body["proxy"]["service"], "anthropic");
    assert_eq!(body["proxy"]["output_tokens"], 3);

    let calls = upstream.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].url, "https://api.anthropic.com/v1/messages");
    assert_eq!(calls[0].headers.get("x-api-key"), Some("sk-ant-1"));
    assert_eq!(calls[0].headers.get("anthropic-version"), Some("2023-06-01"));
    assert_eq!(calls[0].headers.get("anthropic-beta"), None);
    let sent: Value = serde_json::from_slice(calls[0].body.as_ref().unwrap()).unwrap();
    assert_eq!(sent["system"], "be brief");
    assert_eq!(sent["messages"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn stream_is_relayed_and_slot_released() {
    let upstream = FakeUpstream::new(vec![Scripted::Stream(vec![
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\ndata: [DONE]\n\n",
    ])]);
    let core = Core::new(
        config(&[(Service::OpenAI, "sk-1")]),
        upstream.clone(),
        EventHub::default(),
    );
    let state = core.state();

    let response = core
        .router()
        .oneshot(post(
            "/openai/v1/chat/completions",
            json!({
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "text/event-stream"
    );
    let queue = state.forwarder.queue(Service::OpenAI).unwrap();
    assert_eq!(queue.outstanding(), 1);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("\"Hel\""));
    assert!(text.contains("\"lo\""));
    assert!(text.trim_end().ends_with("data: [DONE]"));
    assert_eq!(text.matches("[DONE]").count(), 1);
    assert_eq!(queue.outstanding(), 0);

    let rows = state.forwarder.pool().snapshot(Service::OpenAI);
    assert_eq!(rows[0].in_flight, 0);
    assert_eq!(rows[0].health.as_str(), "active");
}

#[tokio::test]
async fn dropped_stream_releases_slot_and_lease() {
    let upstream = FakeUpstream::new(vec![Scripted::Stream(vec![
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"partial\"},\"finish_reason\":null}]}\n\n",
    ])]);
    let core = Core::new(
        config(&[(Service::OpenAI, "sk-1")]),
        upstream,
        EventHub::default(),
    );
    let state = core.state();
    let response = core
        .router()
        .oneshot(post(
            "/openai/v1/chat/completions",
            json!({"model": "gpt-4o", "messages": [], "stream": true}),
        ))
        .await
        .unwrap();
    let queue = state.forwarder.queue(Service::OpenAI).unwrap();
    assert_eq!(queue.outstanding(), 1);
    assert_eq!(state.forwarder.pool().snapshot(Service::OpenAI)[0].in_flight, 1);

    drop(response);
    assert_eq!(queue.outstanding(), 0);
    assert_eq!(state.forwarder.pool().snapshot(Service::OpenAI)[0].in_flight, 0);
}

#[tokio::test]
async fn stream_error_event_rate_limits_the_credential() {
    let upstream = FakeUpstream::new(vec![Scripted::Stream(vec![
        "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude-3-5-sonnet-latest\",\"usage\":{\"input_tokens\":5,\"output_tokens\":0}}}\n\n",
        "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n",
        "event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"rate_limit_error\",\"message\":\"Rate limited\"}}\n\n",
        "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"unreachable\"}}\n\n",
    ])]);
    let core = Core::new(
        config(&[(Service::Anthropic, "sk-ant-1")]),
        upstream,
        EventHub::default(),
    );
    let state = core.state();
    let response = core
        .router()
        .oneshot(post(
            "/anthropic/v1/chat/completions",
            json!({
                "model": "claude-3-5-sonnet-latest",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("rate_limit_error"));
    assert!(!text.contains("unreachable"));
    assert!(!text.contains("[DONE]"));

    assert_eq!(state.forwarder.queue(Service::Anthropic).unwrap().outstanding(), 0);
    let rows = state.forwarder.pool().snapshot(Service::Anthropic);
    assert_eq!(rows[0].health.as_str(), "rate_limited");
    assert_eq!(rows[0].in_flight, 0);
}

#[tokio::test]
async fn disabled_pool_answers_503_without_calling_upstream() {
    let upstream = FakeUpstream::new(vec![Scripted::Json(
        401,
        json!({"error": {"type": "invalid_api_key", "message": "bad key"}}),
    )]);
    let core = Core::new(
        config(&[(Service::OpenAI, "sk-revoked")]),
        upstream.clone(),
        EventHub::default(),
    );
    let router = core.router();
    let body = json!({"model": "gpt-4o", "messages": []});

    let first = router
        .clone()
        .oneshot(post("/openai/v1/chat/completions", body.clone()))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(read_json(first).await["error"]["message"], "bad key");

    let second = router
        .oneshot(post("/openai/v1/chat/completions", body))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(upstream.calls().len(), 1);
    let queue = core.state().forwarder.queue(Service::OpenAI).unwrap().outstanding();
    assert_eq!(queue, 0);
}

#[tokio::test]
async fn upstream_errors_pass_through_and_release_the_slot() {
    let upstream = FakeUpstream::new(vec![Scripted::Json(
        500,
        json!({"error": {"message": "overloaded"}}),
    )]);
    let core = Core::new(
        config(&[(Service::OpenAI, "sk-1")]),
        upstream,
        EventHub::default(),
    );
    let response = core
        .router()
        .oneshot(post(
            "/openai/v1/chat/completions",
            json!({"model": "gpt-4o", "messages": []}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.headers().contains_key(REQUEST_ID_HEADER));
    assert_eq!(read_json(response).await["error"]["message"], "overloaded");
    let state = core.state();
    assert_eq!(state.forwarder.queue(Service::OpenAI).unwrap().outstanding(), 0);
    let rows = state.forwarder.pool().snapshot(Service::OpenAI);
    assert_eq!(rows[0].health.as_str(), "active");
    assert_eq!(rows[0].in_flight, 0);
}

#[tokio::test]
async fn models_come_from_credentials_by_default() {
    let mut config = config(&[(Service::OpenAI, "sk-1")]);
    let openai = config.services.get_mut(&Service::OpenAI).unwrap();
    openai.model_list = ModelListSource::Credentials;
    openai.credentials[0].models = vec![
        "gpt-4o".to_string(),
        "ft:gpt-4o:acme::abc".to_string(),
        "gpt-3.5-turbo".to_string(),
    ];
    let core = Core::new(config, FakeUpstream::new(Vec::new()), EventHub::default());
    let response = core
        .router()
        .oneshot(
            Request::builder()
                .uri("/openai/v1/models")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["object"], "list");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["gpt-3.5-turbo", "gpt-4o"]);
    assert_eq!(body["data"][0]["owned_by"], "openai");
}

#[tokio::test]
async fn upstream_model_list_is_filtered() {
    let upstream = FakeUpstream::new(vec![Scripted::Json(
        200,
        json!({"object": "list", "data": [
            {"id": "gpt-4o"},
            {"id": "whisper-1"},
            {"id": "ft:gpt-4o:acme::abc"},
            {"id": "gpt-3.5-turbo"}
        ]}),
    )]);
    let mut config = config(&[(Service::OpenAI, "sk-1")]);
    config.services.get_mut(&Service::OpenAI).unwrap().model_list = ModelListSource::Upstream;
    let core = Core::new(config, upstream.clone(), EventHub::default());
    let router = core.router();
    for _ in 0..2 {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/openai/v1/models")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = read_json(response).await;
        let ids: Vec<&str> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| entry["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["gpt-3.5-turbo", "gpt-4o"]);
    }
    let calls = upstream.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].url, "https://api.openai.com/v1/models");
    assert_eq!(calls[0].headers.get("authorization"), Some("Bearer sk-1"));
}

#[tokio::test]
async fn unknown_routes_are_404() {
    let core = Core::new(config(&[]), FakeUpstream::new(Vec::new()), EventHub::default());
    let router = core.router();
    let response = router
        .clone()
        .oneshot(post("/azure/v1/chat/completions", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = router
        .oneshot(post("/anthropic/v1/embeddings", json!({"model": "x"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
