//! Admission-controlled dispatch: queue slot, pipeline, upstream call,
//! outcome attribution, and response completion.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream;
use http::header::{CACHE_CONTROL, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use lmrelay_protocol::sse::{SseDecoder, SseEvent, encode_done, encode_event};
use lmrelay_protocol::{Dialect, Service};
use lmrelay_provider_core::{
    CredentialId, CredentialLease, CredentialPool, Headers, Outcome, ProxyError, ProxyRequest,
    ProxyResponse, StreamBody,
};
use lmrelay_transform::outbound::ResponseContext;
use lmrelay_transform::{
    JsonObject, StreamAggregator, StreamTranslator, TokenUsage, translate_response,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::pipeline::Pipeline;
use crate::queue::{AdmissionQueue, QueueSlot};
use crate::upstream_client::{TransportError, UpstreamBody, UpstreamClient, UpstreamRequest};

const RATE_LIMIT_FALLBACK: Duration = Duration::from_secs(30);

/// Facts about a dispatch that the completion handler reports back.
#[derive(Debug, Clone)]
pub struct DispatchMeta {
    pub credential: CredentialId,
    pub queue_ms: u64,
}

/// Turns a parsed upstream body into the body sent to the client.
pub trait BlockingResponseHandler: Send + Sync {
    fn handle(
        &self,
        request: &mut ProxyRequest,
        body: JsonObject,
        meta: &DispatchMeta,
    ) -> Result<JsonObject, ProxyError>;
}

/// Translates back to the inbound dialect, records token usage and attaches
/// the `proxy` diagnostic object.
#[derive(Debug, Default)]
pub struct DialectResponseHandler;

impl BlockingResponseHandler for DialectResponseHandler {
    fn handle(
        &self,
        request: &mut ProxyRequest,
        body: JsonObject,
        meta: &DispatchMeta,
    ) -> Result<JsonObject, ProxyError> {
        let usage = TokenUsage::from_response(request.outbound, &body);
        request.usage = usage;
        let ctx = ResponseContext::now(usage);
        let mut out = translate_response(request.inbound, request.outbound, body, &ctx)?;
        out.insert(
            "proxy".to_string(),
            json!({
                "service": request.service,
                "credential": meta.credential,
                "prompt_tokens": usage.prompt_tokens,
                "output_tokens": usage.output_tokens,
                "queue_ms": meta.queue_ms,
            }),
        );
        Ok(out)
    }
}

/// Maps a non-2xx upstream answer to a credential outcome (if attributable)
/// and the error returned to the client.
pub fn classify_failure(status: u16, headers: &Headers, body: Bytes) -> (Option<Outcome>, ProxyError) {
    let code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    let quota = is_quota_error(&body);
    match status {
        401 | 403 if !quota => (
            Some(Outcome::Invalid),
            ProxyError::CredentialRejected { status: code, body },
        ),
        402 | 400 | 403 | 429 if quota || status == 402 => (
            Some(Outcome::QuotaExceeded),
            ProxyError::CredentialRejected { status: code, body },
        ),
        429 => (
            Some(Outcome::RateLimited {
                retry_after: retry_after(headers).unwrap_or(RATE_LIMIT_FALLBACK),
            }),
            ProxyError::Upstream { status: code, body },
        ),
        _ => (None, ProxyError::Upstream { status: code, body }),
    }
}

fn is_quota_error(body: &[u8]) -> bool {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return false;
    };
    value.get("error").is_some_and(is_quota_payload)
}

fn is_quota_payload(error: &Value) -> bool {
    let tagged = ["type", "code"].iter().any(|field| {
        matches!(
            error.get(*field).and_then(Value::as_str),
            Some("insufficient_quota" | "billing_not_active" | "billing_hard_limit_reached")
        )
    });
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_ascii_lowercase();
    tagged || message.contains("credit balance is too low")
}

/// Credential outcome of an error event reported inside an upstream stream.
/// `None` means the failure is not attributable to the credential.
fn stream_error_outcome(error: &Value) -> Option<Outcome> {
    if is_quota_payload(error) {
        return Some(Outcome::QuotaExceeded);
    }
    let tagged = |expected: &[&str]| {
        ["type", "code"].iter().any(|field| {
            error
                .get(*field)
                .and_then(Value::as_str)
                .is_some_and(|tag| expected.contains(&tag))
        })
    };
    if tagged(&["rate_limit_error", "rate_limit_exceeded"]) {
        Some(Outcome::RateLimited {
            retry_after: RATE_LIMIT_FALLBACK,
        })
    } else if tagged(&["authentication_error", "permission_error", "invalid_api_key"]) {
        Some(Outcome::Invalid)
    } else {
        None
    }
}

fn retry_after(headers: &Headers) -> Option<Duration> {
    let value = headers.get("retry-after")?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(
        at.duration_since(std::time::SystemTime::now())
            .unwrap_or(Duration::ZERO),
    )
}

#[derive(Debug)]
struct ServiceRoute {
    base_url: String,
    queue: AdmissionQueue,
}

pub struct Forwarder {
    client: Arc<dyn UpstreamClient>,
    pool: Arc<CredentialPool>,
    routes: BTreeMap<Service, ServiceRoute>,
    handler: Arc<dyn BlockingResponseHandler>,
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}

impl Forwarder {
    pub fn new(client: Arc<dyn UpstreamClient>, pool: Arc<CredentialPool>) -> Self {
        Self {
            client,
            pool,
            routes: BTreeMap::new(),
            handler: Arc::new(DialectResponseHandler),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn BlockingResponseHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_service(
        mut self,
        service: Service,
        base_url: impl Into<String>,
        max_concurrency: usize,
        queue_timeout: Duration,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        self.routes.insert(
            service,
            ServiceRoute {
                base_url,
                queue: AdmissionQueue::new(service, max_concurrency, queue_timeout),
            },
        );
        self
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn client(&self) -> &Arc<dyn UpstreamClient> {
        &self.client
    }

    pub fn base_url(&self, service: Service) -> Option<&str> {
        self.routes.get(&service).map(|route| route.base_url.as_str())
    }

    pub fn queue(&self, service: Service) -> Option<&AdmissionQueue> {
        self.routes.get(&service).map(|route| &route.queue)
    }

    /// Waits for a slot, runs the pipeline and sends the request upstream.
    ///
    /// The slot is held until the blocking response is built or, for
    /// streams, until the relayed stream ends or is dropped.
    pub async fn forward(
        &self,
        mut request: ProxyRequest,
        pipeline: &Pipeline,
    ) -> Result<ProxyResponse, ProxyError> {
        let route = self
            .routes
            .get(&request.service)
            .ok_or_else(|| ProxyError::NotFound(format!("service {}", request.service)))?;
        let slot = route.queue.acquire().await?;
        let queue_ms = u64::try_from(slot.waited().as_millis()).unwrap_or(u64::MAX);

        pipeline.run(&mut request, &self.pool)?;
        let lease = request
            .take_lease()
            .ok_or_else(|| ProxyError::internal("pipeline assigned no credential"))?;
        let path = request
            .path
            .clone()
            .ok_or_else(|| ProxyError::internal("pipeline selected no upstream path"))?;
        let upstream = UpstreamRequest {
            method: Method::POST,
            url: format!("{}{}", route.base_url, path),
            headers: request.headers.clone(),
            body: request.finalized.clone(),
            is_stream: request.is_streaming(),
        };
        let meta = DispatchMeta {
            credential: lease.id().clone(),
            queue_ms,
        };

        tracing::info!(
            event = "upstream_sent",
            trace_id = %request.trace_id,
            service = %request.service,
            credential = %meta.credential,
            outbound = %request.outbound,
            path = %path,
            queue_ms,
            is_stream = upstream.is_stream,
        );
        let started = Instant::now();
        let response = match self.client.send(upstream).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    event = "upstream_transport_error",
                    trace_id = %request.trace_id,
                    credential = %meta.credential,
                    kind = ?err.kind,
                    error = %err,
                );
                return Err(ProxyError::Network {
                    message: err.message,
                });
            }
        };
        tracing::info!(
            event = "upstream_responded",
            trace_id = %request.trace_id,
            credential = %meta.credential,
            status = response.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
        );

        if !(200..300).contains(&response.status) {
            let body = response.body.collect().await.map_err(network_error)?;
            let (outcome, err) = classify_failure(response.status, &response.headers, body);
            if let Some(outcome) = outcome {
                self.pool.report_outcome(lease, outcome);
            }
            return Err(err);
        }

        if request.is_streaming() {
            let relay = StreamRelay::new(
                request,
                lease,
                slot,
                response.body,
                Arc::clone(&self.pool),
                Arc::clone(&self.handler),
                meta,
            )?;
            let mut headers = HeaderMap::new();
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            return Ok(ProxyResponse::Stream {
                status: StatusCode::OK,
                headers,
                body: StreamBody::event_stream(relay.into_stream()),
            });
        }

        let bytes = response.body.collect().await.map_err(network_error)?;
        let body = match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(body)) => body,
            Ok(_) | Err(_) => {
                return Err(ProxyError::UpstreamProtocol {
                    message: "upstream body is not a JSON object".to_string(),
                });
            }
        };
        let out = self.handler.handle(&mut request, body, &meta)?;
        self.pool.report_outcome(lease, Outcome::Success);
        drop(slot);

        let body = serde_json::to_vec(&out)
            .map_err(|err| ProxyError::internal(format!("serialize response: {err}")))?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(ProxyResponse::Json {
            status: StatusCode::OK,
            headers,
            body: Bytes::from(body),
        })
    }
}

fn network_error(err: TransportError) -> ProxyError {
    ProxyError::Network {
        message: err.message,
    }
}

enum Source {
    Once(Option<Bytes>),
    Channel(mpsc::Receiver<Result<Bytes, TransportError>>),
}

impl Source {
    async fn next(&mut self) -> Option<Result<Bytes, TransportError>> {
        match self {
            Source::Once(bytes) => bytes.take().map(Ok),
            Source::Channel(rx) => rx.recv().await,
        }
    }
}

/// Relays an upstream event stream to the client in the inbound dialect
/// while folding it for accounting. Owns the queue slot and the lease.
struct StreamRelay {
    source: Source,
    decoder: SseDecoder,
    translator: StreamTranslator,
    aggregator: Option<StreamAggregator>,
    pending: VecDeque<Bytes>,
    finished: bool,
    request: ProxyRequest,
    lease: Option<CredentialLease>,
    slot: Option<QueueSlot>,
    pool: Arc<CredentialPool>,
    handler: Arc<dyn BlockingResponseHandler>,
    meta: DispatchMeta,
    started: Instant,
}

impl StreamRelay {
    fn new(
        request: ProxyRequest,
        lease: CredentialLease,
        slot: QueueSlot,
        body: UpstreamBody,
        pool: Arc<CredentialPool>,
        handler: Arc<dyn BlockingResponseHandler>,
        meta: DispatchMeta,
    ) -> Result<Self, ProxyError> {
        let created = ResponseContext::now(TokenUsage::default()).created;
        let translator =
            StreamTranslator::new(request.inbound, request.outbound, request.model.clone(), created)?;
        let source = match body {
            UpstreamBody::Bytes(bytes) => Source::Once(Some(bytes)),
            UpstreamBody::Stream(rx) => Source::Channel(rx),
        };
        Ok(Self {
            source,
            decoder: SseDecoder::new(),
            translator,
            aggregator: StreamAggregator::for_dialect(request.outbound),
            pending: VecDeque::new(),
            finished: false,
            request,
            lease: Some(lease),
            slot: Some(slot),
            pool,
            handler,
            meta,
            started: Instant::now(),
        })
    }

    fn into_stream(self) -> impl futures_util::Stream<Item = Result<Bytes, std::io::Error>> + Send {
        stream::unfold(self, |mut relay| async move {
            let chunk = relay.next_chunk().await?;
            Some((Ok(chunk), relay))
        })
    }

    async fn next_chunk(&mut self) -> Option<Bytes> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                return Some(chunk);
            }
            if self.finished {
                self.slot = None;
                return None;
            }
            match self.source.next().await {
                Some(Ok(bytes)) => {
                    for event in self.decoder.push(&bytes) {
                        self.on_event(event);
                    }
                }
                Some(Err(err)) => self.fail(err),
                None => {
                    for event in self.decoder.finish() {
                        self.on_event(event);
                    }
                    self.complete();
                }
            }
        }
    }

    fn on_event(&mut self, event: SseEvent) {
        if self.finished {
            return;
        }
        if event.is_done() {
            self.complete();
            return;
        }
        let chunk = match serde_json::from_str::<Value>(&event.data) {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::debug!(
                    event = "stream_frame_skipped",
                    trace_id = %self.request.trace_id,
                    error = %err,
                );
                return;
            }
        };
        let upstream_error = chunk.get("error").filter(|e| !e.is_null()).cloned();
        if upstream_error.is_none()
            && let Some(aggregator) = self.aggregator.as_mut()
        {
            aggregator.push(&chunk);
        }
        for frame in self.translator.translate(chunk) {
            self.pending
                .push_back(encode_event(frame.event.as_deref(), &frame.data.to_string()));
        }
        if let Some(error) = upstream_error {
            self.abort(&error);
        }
    }

    /// Ends the relay after the upstream reported an error mid-stream.
    fn abort(&mut self, error: &Value) {
        let outcome = stream_error_outcome(error);
        tracing::warn!(
            event = "stream_upstream_error",
            trace_id = %self.request.trace_id,
            credential = %self.meta.credential,
            error_type = error.get("type").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
            outcome = ?outcome,
        );
        self.finished = true;
        self.aggregator = None;
        if let (Some(lease), Some(outcome)) = (self.lease.take(), outcome) {
            self.pool.report_outcome(lease, outcome);
        }
    }

    fn fail(&mut self, err: TransportError) {
        tracing::warn!(
            event = "stream_failed",
            trace_id = %self.request.trace_id,
            credential = %self.meta.credential,
            error = %err,
        );
        let event = match self.request.inbound {
            Dialect::AnthropicChat | Dialect::AnthropicText => Some("error"),
            _ => None,
        };
        let data = json!({ "error": { "type": "upstream_stream_error", "message": err.message } });
        self.pending.push_back(encode_event(event, &data.to_string()));
        self.finished = true;
        self.lease = None;
    }

    fn complete(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(aggregated) = self.aggregator.take().map(StreamAggregator::finish) {
            if let Err(err) = self.handler.handle(&mut self.request, aggregated, &self.meta) {
                tracing::warn!(
                    event = "stream_completion_failed",
                    trace_id = %self.request.trace_id,
                    error = %err,
                );
            }
        }
        if let Some(lease) = self.lease.take() {
            self.pool.report_outcome(lease, Outcome::Success);
        }
        if self.request.inbound.stream_done_marker() {
            self.pending.push_back(encode_done());
        }
        tracing::info!(
            event = "stream_completed",
            trace_id = %self.request.trace_id,
            credential = %self.meta.credential,
            prompt_tokens = self.request.usage.prompt_tokens,
            output_tokens = self.request.usage.output_tokens,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
        );
    }
}

impl Drop for StreamRelay {
    fn drop(&mut self) {
        if !self.finished {
            tracing::info!(
                event = "stream_cancelled",
                trace_id = %self.request.trace_id,
                credential = %self.meta.credential,
                elapsed_ms = self.started.elapsed().as_millis() as u64,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(retry_after: Option<&str>) -> Headers {
        let mut headers = Headers::new();
        if let Some(value) = retry_after {
            headers.set("Retry-After", value);
        }
        headers
    }

    #[test]
    fn rate_limit_uses_retry_after_or_fallback() {
        let (outcome, err) = classify_failure(429, &headers(Some("12")), Bytes::new());
        assert_eq!(
            outcome,
            Some(Outcome::RateLimited {
                retry_after: Duration::from_secs(12)
            })
        );
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);

        let (outcome, _) = classify_failure(429, &headers(None), Bytes::new());
        assert_eq!(
            outcome,
            Some(Outcome::RateLimited {
                retry_after: RATE_LIMIT_FALLBACK
            })
        );
    }

    #[test]
    fn auth_failures_disable() {
        let (outcome, err) = classify_failure(401, &headers(None), Bytes::from_static(b"{}"));
        assert_eq!(outcome, Some(Outcome::Invalid));
        assert!(matches!(err, ProxyError::CredentialRejected { status, .. } if status == StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn quota_bodies_are_quota_exceeded() {
        let body = Bytes::from_static(
            br#"{"error":{"message":"You exceeded your current quota","type":"insufficient_quota","code":"insufficient_quota"}}"#,
        );
        let (outcome, err) = classify_failure(429, &headers(None), body);
        assert_eq!(outcome, Some(Outcome::QuotaExceeded));
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);

        let anthropic = Bytes::from_static(
            br#"{"type":"error","error":{"type":"invalid_request_error","message":"Your credit balance is too low to access the Anthropic API."}}"#,
        );
        let (outcome, _) = classify_failure(400, &headers(None), anthropic);
        assert_eq!(outcome, Some(Outcome::QuotaExceeded));

        let (outcome, err) = classify_failure(402, &headers(None), Bytes::new());
        assert_eq!(outcome, Some(Outcome::QuotaExceeded));
        assert_eq!(err.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn stream_errors_map_to_outcomes() {
        assert_eq!(
            stream_error_outcome(&json!({"type": "rate_limit_error", "message": "slow down"})),
            Some(Outcome::RateLimited {
                retry_after: RATE_LIMIT_FALLBACK
            })
        );
        assert_eq!(
            stream_error_outcome(&json!({"type": "insufficient_quota", "message": "no"})),
            Some(Outcome::QuotaExceeded)
        );
        assert_eq!(
            stream_error_outcome(&json!({"type": "authentication_error"})),
            Some(Outcome::Invalid)
        );
        assert_eq!(
            stream_error_outcome(&json!({"type": "overloaded_error", "message": "Overloaded"})),
            None
        );
    }

    #[test]
    fn other_errors_pass_through_unattributed() {
        let (outcome, err) = classify_failure(500, &headers(None), Bytes::from_static(b"boom"));
        assert_eq!(outcome, None);
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let (outcome, _) = classify_failure(400, &headers(None), Bytes::from_static(b"{}"));
        assert_eq!(outcome, None);
    }
}
