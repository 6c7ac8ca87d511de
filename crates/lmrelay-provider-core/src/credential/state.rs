use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialHealth {
    Active,
    RateLimited { until: Instant },
    Disabled { reason: DisableReason },
}

impl CredentialHealth {
    pub fn is_disabled(&self) -> bool {
        matches!(self, CredentialHealth::Disabled { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialHealth::Active => "active",
            CredentialHealth::RateLimited { .. } => "rate_limited",
            CredentialHealth::Disabled { .. } => "disabled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisableReason {
    Invalid,
    QuotaExceeded,
}

impl DisableReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DisableReason::Invalid => "invalid",
            DisableReason::QuotaExceeded => "quota_exceeded",
        }
    }
}

/// Result of one upstream attempt, as far as credential health is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RateLimited { retry_after: Duration },
    Invalid,
    QuotaExceeded,
}
