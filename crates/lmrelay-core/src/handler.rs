use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::HeaderValue;
use axum::response::Response;
use bytes::Bytes;
use http::StatusCode;
use http::header::CONTENT_TYPE;
use lmrelay_protocol::Service;
use lmrelay_provider_core::{ProxyError, ProxyResponse};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::classify::{Classified, classify_request};
use crate::core::CoreState;

pub const REQUEST_ID_HEADER: &str = "x-lmrelay-request-id";
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

pub async fn proxy_handler(
    State(state): State<Arc<CoreState>>,
    Path((service, path)): Path<(String, String)>,
    request: Request,
) -> Response {
    let trace_id = Uuid::new_v4().to_string();
    let started_at = Instant::now();
    let method = request.method().clone();
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let service = match service.parse::<Service>() {
        Ok(service) if state.config.service(service).is_some() => service,
        Ok(_) | Err(_) => {
            return error_response(
                ProxyError::NotFound(format!("unknown service `{service}`")),
                &trace_id,
            );
        }
    };
    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(err) => {
            return error_response(
                ProxyError::client(format!("failed to read request body: {err}")),
                &trace_id,
            );
        }
    };

    let classified = match classify_request(service, &method, &path, body, &state.config, &trace_id)
    {
        Ok(classified) => classified,
        Err(err) => {
            log_failure(&trace_id, service, &err, started_at, false);
            return error_response(err, &trace_id);
        }
    };

    let (request, pipeline) = match classified {
        Classified::Models => {
            let models = state.catalog.get_models(service).await;
            info!(
                event = "downstream_responded",
                trace_id = %trace_id,
                service = %service,
                op = "models",
                status = 200u16,
                count = models.data.len(),
                elapsed_ms = started_at.elapsed().as_millis() as u64,
            );
            let body = serde_json::to_vec(models.as_ref()).unwrap_or_else(|_| b"{}".to_vec());
            return json_response(StatusCode::OK, Bytes::from(body), &trace_id);
        }
        Classified::Proxy { request, pipeline } => (request, pipeline),
    };

    let is_stream = request.is_streaming();
    info!(
        event = "downstream_received",
        trace_id = %trace_id,
        service = %service,
        inbound = %request.inbound,
        outbound = %request.outbound,
        model = %request.model,
        family = %request.family,
        method = %method,
        path = %path,
        is_stream,
    );

    if let Err(err) = state.gate.check(service, client) {
        log_failure(&trace_id, service, &err, started_at, is_stream);
        return error_response(err, &trace_id);
    }

    match state.forwarder.forward(request, &pipeline).await {
        Ok(response) => {
            info!(
                event = "downstream_responded",
                trace_id = %trace_id,
                service = %service,
                status = response.status().as_u16(),
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                is_stream,
            );
            proxy_response(response, &trace_id)
        }
        Err(err) => {
            log_failure(&trace_id, service, &err, started_at, is_stream);
            error_response(err, &trace_id)
        }
    }
}

/// Pool and queue state per configured service.
pub async fn health_handler(State(state): State<Arc<CoreState>>) -> Response {
    let services: serde_json::Map<String, serde_json::Value> = state
        .config
        .services
        .keys()
        .map(|service| {
            let credentials: Vec<_> = state
                .forwarder
                .pool()
                .snapshot(*service)
                .into_iter()
                .map(|row| {
                    json!({
                        "id": row.id,
                        "health": row.health.as_str(),
                        "in_flight": row.in_flight,
                    })
                })
                .collect();
            let queue = state.forwarder.queue(*service).map(|queue| {
                json!({
                    "capacity": queue.capacity(),
                    "outstanding": queue.outstanding(),
                    "waiting": queue.waiting(),
                })
            });
            (
                service.to_string(),
                json!({ "credentials": credentials, "queue": queue }),
            )
        })
        .collect();
    let body = json!({ "status": "ok", "services": services }).to_string();
    json_response(StatusCode::OK, Bytes::from(body), &Uuid::new_v4().to_string())
}

fn log_failure(trace_id: &str, service: Service, err: &ProxyError, started_at: Instant, is_stream: bool) {
    warn!(
        event = "downstream_responded",
        trace_id = %trace_id,
        service = %service,
        status = err.status().as_u16(),
        kind = err.kind(),
        error = %err,
        elapsed_ms = started_at.elapsed().as_millis() as u64,
        is_stream,
    );
}

fn proxy_response(response: ProxyResponse, trace_id: &str) -> Response {
    let mut resp = match response {
        ProxyResponse::Json {
            status,
            headers,
            body,
        } => {
            let mut resp = Response::new(Body::from(body));
            *resp.status_mut() = status;
            resp.headers_mut().extend(headers);
            resp
        }
        ProxyResponse::Stream {
            status,
            headers,
            body,
        } => {
            let mut resp = Response::new(Body::from_stream(body.stream));
            *resp.status_mut() = status;
            resp.headers_mut().extend(headers);
            if !resp.headers().contains_key(CONTENT_TYPE) {
                resp.headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(body.content_type));
            }
            resp
        }
    };
    tag_request_id(&mut resp, trace_id);
    resp
}

fn json_response(status: StatusCode, body: Bytes, trace_id: &str) -> Response {
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    tag_request_id(&mut resp, trace_id);
    resp
}

fn error_response(err: ProxyError, trace_id: &str) -> Response {
    json_response(err.status(), err.body(), trace_id)
}

fn tag_request_id(resp: &mut Response, trace_id: &str) {
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
}
