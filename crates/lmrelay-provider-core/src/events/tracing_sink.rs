use super::{EventSink, PoolEvent};

/// Logs pool events through `tracing`.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn write(&self, event: &PoolEvent) {
        match event {
            PoolEvent::RateLimited {
                service,
                credential,
                retry_after_ms,
                ..
            } => tracing::warn!(
                event = "credential_rate_limited",
                service = %service,
                credential = %credential,
                retry_after_ms,
            ),
            PoolEvent::Recovered {
                service,
                credential,
                ..
            } => tracing::info!(
                event = "credential_recovered",
                service = %service,
                credential = %credential,
            ),
            PoolEvent::Disabled {
                service,
                credential,
                reason,
                ..
            } => tracing::warn!(
                event = "credential_disabled",
                service = %service,
                credential = %credential,
                reason = reason.as_str(),
            ),
        }
    }
}
