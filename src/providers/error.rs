use std::fmt;

/// Classified provider error — tells the feedback loop *why* the LLM call
/// failed so it can decide between an in-iteration retry and failing the
/// project.
#[derive(Debug)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub status: Option<u16>,
    pub message: String,
    /// Seconds to wait before retrying (from a 429 body, when present).
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// 401/403 — bad API key or permissions.
    Auth,
    /// 402 — billing or quota exhausted.
    Billing,
    /// 429 — rate limited.
    RateLimit,
    /// 404 or "model not found".
    NotFound,
    /// 408 or client-side timeout.
    Timeout,
    /// Connection refused, DNS failure, reset.
    Network,
    /// 5xx provider outage.
    ServerError,
    Unknown,
}

impl ProviderError {
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            401 | 403 => ProviderErrorKind::Auth,
            402 => ProviderErrorKind::Billing,
            404 => ProviderErrorKind::NotFound,
            408 => ProviderErrorKind::Timeout,
            429 => ProviderErrorKind::RateLimit,
            500 | 502 | 503 | 504 => ProviderErrorKind::ServerError,
            _ => ProviderErrorKind::Unknown,
        };
        let retry_after_secs = if kind == ProviderErrorKind::RateLimit {
            extract_retry_after(body)
        } else {
            None
        };
        Self { kind, status: Some(status), message: truncate_body(body), retry_after_secs }
    }

    pub fn network(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ProviderErrorKind::Timeout
        } else {
            ProviderErrorKind::Network
        };
        Self { kind, status: None, message: err.to_string(), retry_after_secs: None }
    }

    /// Whether repeating the same request may succeed. Auth and parse
    /// failures never are; transient transport and server issues are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::RateLimit
                | ProviderErrorKind::Timeout
                | ProviderErrorKind::Network
                | ProviderErrorKind::ServerError
        )
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(status) = self.status {
            write!(f, "provider error ({}, {:?}): {}", status, self.kind, self.message)
        } else {
            write!(f, "provider error ({:?}): {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for ProviderError {}

/// Parse retry_after from a JSON error body.
/// Handles `{"error": {"retry_after": 5}}` and `{"retry_after": 5}`.
fn extract_retry_after(body: &str) -> Option<u64> {
    let v: serde_json::Value = serde_json::from_str(body).ok()?;
    v["error"]["retry_after"]
        .as_u64()
        .or_else(|| v["retry_after"].as_u64())
        .or_else(|| {
            v["error"]["retry_after"]
                .as_f64()
                .or_else(|| v["retry_after"].as_f64())
                .map(|f| f.ceil() as u64)
        })
}

fn truncate_body(body: &str) -> String {
    crate::utils::truncate_str(body, 300)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(ProviderError::from_status(401, "").kind, ProviderErrorKind::Auth);
        assert_eq!(ProviderError::from_status(402, "").kind, ProviderErrorKind::Billing);
        assert_eq!(ProviderError::from_status(404, "").kind, ProviderErrorKind::NotFound);
        assert_eq!(ProviderError::from_status(429, "").kind, ProviderErrorKind::RateLimit);
        assert_eq!(ProviderError::from_status(503, "").kind, ProviderErrorKind::ServerError);
        assert_eq!(ProviderError::from_status(418, "").kind, ProviderErrorKind::Unknown);
    }

    #[test]
    fn test_retry_after_extraction() {
        let err = ProviderError::from_status(429, r#"{"error": {"retry_after": 5}}"#);
        assert_eq!(err.retry_after_secs, Some(5));
        let err = ProviderError::from_status(429, r#"{"retry_after": 2.3}"#);
        assert_eq!(err.retry_after_secs, Some(3));
        let err = ProviderError::from_status(429, "not json");
        assert_eq!(err.retry_after_secs, None);
    }

    #[test]
    fn test_retryability() {
        assert!(ProviderError::from_status(429, "").is_retryable());
        assert!(ProviderError::from_status(503, "").is_retryable());
        assert!(!ProviderError::from_status(401, "").is_retryable());
        assert!(!ProviderError::from_status(404, "").is_retryable());
    }

    #[test]
    fn test_long_bodies_truncated() {
        let err = ProviderError::from_status(500, &"x".repeat(1000));
        assert!(err.message.len() <= 303);
    }
}
