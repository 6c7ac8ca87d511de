//! Ordered request mutations applied between ingress and dispatch.

use bytes::Bytes;
use lmrelay_protocol::{Dialect, Service};
use lmrelay_provider_core::{CredentialPool, ProxyError, ProxyRequest};
use lmrelay_transform::inbound;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStep {
    /// Rewrites the body from the inbound to the outbound dialect.
    TranslateBody,
    /// `max_tokens` -> `max_completion_tokens` for OpenAI chat.
    FixupMaxTokens,
    /// Leases a credential and sets the auth headers.
    AddKey,
    SelectPath,
    CompatHeaders,
    /// Serializes the body; always the last step.
    FinalizeBody,
}

impl MutationStep {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationStep::TranslateBody => "translate_body",
            MutationStep::FixupMaxTokens => "fixup_max_tokens",
            MutationStep::AddKey => "add_key",
            MutationStep::SelectPath => "select_path",
            MutationStep::CompatHeaders => "compat_headers",
            MutationStep::FinalizeBody => "finalize_body",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    steps: Vec<MutationStep>,
}

impl Pipeline {
    /// Appends `FinalizeBody`; passing it explicitly is an error.
    pub fn new(steps: Vec<MutationStep>) -> Result<Self, ProxyError> {
        if steps.contains(&MutationStep::FinalizeBody) {
            return Err(ProxyError::internal(
                "finalize_body is appended by the pipeline itself",
            ));
        }
        Ok(Self::terminated(steps))
    }

    fn terminated(mut steps: Vec<MutationStep>) -> Self {
        steps.push(MutationStep::FinalizeBody);
        Self { steps }
    }

    /// The step chain for a request travelling from `inbound` to `outbound`.
    pub fn for_route(service: Service, inbound: Dialect, outbound: Dialect) -> Self {
        let mut steps = Vec::with_capacity(6);
        if inbound != outbound {
            steps.push(MutationStep::TranslateBody);
        }
        if service == Service::OpenAI && outbound == Dialect::OpenAIChat {
            steps.push(MutationStep::FixupMaxTokens);
        }
        steps.push(MutationStep::AddKey);
        steps.push(MutationStep::SelectPath);
        if service == Service::Anthropic {
            steps.push(MutationStep::CompatHeaders);
        }
        Self::terminated(steps)
    }

    pub fn steps(&self) -> &[MutationStep] {
        &self.steps
    }

    /// Runs every step in order, stopping at the first error. A request that
    /// fails here is dropped by the caller, which releases any lease taken.
    pub fn run(&self, request: &mut ProxyRequest, pool: &CredentialPool) -> Result<(), ProxyError> {
        for step in &self.steps {
            apply(*step, request, pool).inspect_err(|err| {
                tracing::debug!(
                    event = "pipeline_step_failed",
                    trace_id = %request.trace_id,
                    step = step.as_str(),
                    error = %err,
                );
            })?;
        }
        Ok(())
    }
}

fn apply(
    step: MutationStep,
    request: &mut ProxyRequest,
    pool: &CredentialPool,
) -> Result<(), ProxyError> {
    match step {
        MutationStep::TranslateBody => {
            let body = std::mem::take(&mut request.body);
            request.body = inbound::translate_request(request.inbound, request.outbound, body)?;
        }
        MutationStep::FixupMaxTokens => inbound::fixup_max_tokens(&mut request.body),
        MutationStep::AddKey => {
            let lease = pool.select(request.service, request.family, &request.model)?;
            match request.service {
                Service::OpenAI | Service::GoogleAI => request
                    .headers
                    .set("authorization", format!("Bearer {}", lease.secret())),
                Service::Anthropic => {
                    request.headers.set("x-api-key", lease.secret());
                    request.headers.set("anthropic-version", ANTHROPIC_VERSION);
                }
            }
            tracing::debug!(
                event = "credential_assigned",
                trace_id = %request.trace_id,
                credential = %lease.id(),
            );
            request.assign_lease(lease)?;
        }
        MutationStep::SelectPath => {
            request.path = Some(upstream_path(request.service, request.outbound).to_string());
        }
        MutationStep::CompatHeaders => {
            for (name, value) in inbound::compat_headers(request.outbound, &request.body) {
                request.headers.set(name, value);
            }
        }
        MutationStep::FinalizeBody => {
            let body = serde_json::to_vec(&request.body)
                .map_err(|err| ProxyError::internal(format!("serialize body: {err}")))?;
            request.headers.set("content-type", "application/json");
            request.headers.set("content-length", body.len().to_string());
            request.finalized = Some(Bytes::from(body));
        }
    }
    Ok(())
}

/// Path appended to the service base URL. The Google base URL already ends
/// in its version segment.
pub fn upstream_path(service: Service, dialect: Dialect) -> &'static str {
    let path = dialect.upstream_path();
    match service {
        Service::GoogleAI => path.strip_prefix("/v1").unwrap_or(path),
        Service::OpenAI | Service::Anthropic => path,
    }
}

pub fn models_path(service: Service) -> &'static str {
    match service {
        Service::GoogleAI => "/models",
        Service::OpenAI | Service::Anthropic => "/v1/models",
    }
}
