// gatewally/src/errors.rs
//
// Gateway error taxonomy. Every pipeline failure maps to exactly one of
// these; the HTTP layer turns them into status codes and the metrics
// registry labels error counters with `kind()`.
//
// Infrastructure errors (Cache, Storage) are caught and logged inside the
// subsystems that raise them — they never surface to the caller.

use crate::types::Violation;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("rate limit exceeded, retry after {retry_after}s")]
    RateLimitExceeded { retry_after: u64 },

    #[error("budget exceeded: ${current:.2} / ${limit:.2}")]
    BudgetExceeded { current: f64, limit: f64 },

    #[error("guardrail violation: {}", .0.iter().map(|v| v.rule_name.as_str()).collect::<Vec<_>>().join(", "))]
    GuardrailViolation(Vec<Violation>),

    #[error("provider {provider} error{}: {message}", .status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Provider {
        provider: String,
        status:   Option<u16>,
        message:  String,
    },

    #[error("operation timed out after {0}s")]
    Timeout(u64),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl GatewayError {
    /// Stable category label — metric dimension, never shown to end users.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded { .. } => "RateLimitExceeded",
            Self::BudgetExceeded { .. }    => "BudgetExceeded",
            Self::GuardrailViolation(_)    => "GuardrailViolation",
            Self::Provider { .. }          => "ProviderError",
            Self::Timeout(_)               => "TimeoutError",
            Self::Authentication(_)        => "AuthenticationError",
            Self::Validation(_)            => "ValidationError",
            Self::Cache(_)                 => "CacheError",
            Self::Storage(_)               => "StorageError",
        }
    }

    /// HTTP status the out-of-process surface maps this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::RateLimitExceeded { .. } => 429,
            Self::BudgetExceeded { .. }    => 402,
            Self::GuardrailViolation(_)    => 400,
            Self::Provider { .. }          => 502,
            Self::Timeout(_)               => 504,
            Self::Authentication(_)        => 401,
            Self::Validation(_)            => 400,
            Self::Cache(_) | Self::Storage(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        let e = GatewayError::RateLimitExceeded { retry_after: 17 };
        assert_eq!(e.kind(), "RateLimitExceeded");
        assert_eq!(e.http_status(), 429);

        let e = GatewayError::BudgetExceeded { current: 0.99, limit: 1.0 };
        assert_eq!(e.kind(), "BudgetExceeded");
        assert_eq!(e.http_status(), 402);

        let e = GatewayError::Timeout(30);
        assert_eq!(e.http_status(), 504);
    }
}
