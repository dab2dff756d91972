use thiserror::Error;

/// Errors surfaced at the HTTP boundary of the gateway.
///
/// Every variant carries a stable machine-readable kind string and an HTTP
/// status; the admission gate fails fast with the first matching kind.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing api key")]
    AuthMissing,
    #[error("invalid api key")]
    AuthInvalid,
    #[error("account suspended")]
    TenantSuspended,
    #[error("model not allowed for api key: {0}")]
    ModelNotAllowed(String),
    #[error("rate limited")]
    RateLimited,
    #[error("too many concurrent requests")]
    ConcurrencyExceeded,
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("spend limit exceeded")]
    SpendLimitExceeded,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("no provider available: {0}")]
    NoCandidates(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("client cancelled")]
    ClientCancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthMissing => "auth_missing",
            Self::AuthInvalid => "auth_invalid",
            Self::TenantSuspended => "tenant_suspended",
            Self::ModelNotAllowed(_) => "model_not_allowed",
            Self::RateLimited => "rate_limited",
            Self::ConcurrencyExceeded => "concurrency_exceeded",
            Self::InsufficientBalance => "insufficient_balance",
            Self::SpendLimitExceeded => "spend_limit_exceeded",
            Self::InvalidRequest(_) => "invalid_request",
            Self::NoCandidates(_) => "no_candidates",
            Self::Upstream(_) => "upstream_error",
            Self::ClientCancelled => "client_cancelled",
            Self::Internal(_) => "internal_error",
        }
    }

    /// The `code` field of the OpenAI-shaped error body. Exhausted upstream
    /// attempts are generalized to `upstream_failed` regardless of the last
    /// adapter error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Upstream(_) | Self::NoCandidates(_) => "upstream_failed",
            other => other.kind(),
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::AuthMissing | Self::AuthInvalid => 401,
            Self::InsufficientBalance | Self::SpendLimitExceeded => 402,
            Self::TenantSuspended | Self::ModelNotAllowed(_) => 403,
            Self::RateLimited | Self::ConcurrencyExceeded => 429,
            Self::InvalidRequest(_) => 400,
            Self::NoCandidates(_) | Self::Upstream(_) => 502,
            // Never sent on the wire: the stream is already committed as 200.
            // 499 is what the request log records for a client abort.
            Self::ClientCancelled => 499,
            Self::Internal(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_errors_generalize_to_upstream_failed() {
        let err = GatewayError::Upstream("connect refused".to_string());
        assert_eq!(err.kind(), "upstream_error");
        assert_eq!(err.code(), "upstream_failed");
        assert_eq!(err.status(), 502);
    }

    #[test]
    fn admission_kinds_map_to_documented_statuses() {
        assert_eq!(GatewayError::AuthMissing.status(), 401);
        assert_eq!(GatewayError::TenantSuspended.status(), 403);
        assert_eq!(GatewayError::RateLimited.status(), 429);
        assert_eq!(GatewayError::ConcurrencyExceeded.status(), 429);
        assert_eq!(GatewayError::InsufficientBalance.status(), 402);
        assert_eq!(
            GatewayError::ModelNotAllowed("gpt-4o".to_string()).status(),
            403
        );
        assert_eq!(
            GatewayError::InvalidRequest("bad json".to_string()).status(),
            400
        );
    }
}
