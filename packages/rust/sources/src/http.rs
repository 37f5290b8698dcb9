//! HTTP plumbing shared by source clients: client construction and the
//! mapping from transport/status failures onto [`ErrorKind`].

use std::time::Duration;

use paperflow_shared::{ErrorKind, PaperflowError, Result, StageError};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};

/// User-Agent sent with every request.
pub const USER_AGENT: &str = concat!("paperflow/", env!("CARGO_PKG_VERSION"));

/// Longest error body echoed into a failure message.
const MAX_ERROR_BODY: usize = 200;

/// Build a reqwest client with the per-request timeout.
pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|e| PaperflowError::Network(format!("failed to build HTTP client: {e}")))
}

/// Classify a transport-level failure.
pub fn classify_transport(url: &str, err: &reqwest::Error) -> StageError {
    let kind = if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_decode() {
        ErrorKind::Corruption
    } else {
        ErrorKind::Connection
    };
    StageError::new(kind, format!("{url}: {err}"))
}

/// Kind for a non-success HTTP status.
pub fn status_kind(status: StatusCode) -> ErrorKind {
    match status.as_u16() {
        429 => ErrorKind::RateLimited,
        404 => ErrorKind::NotFound,
        400 | 422 => ErrorKind::InvalidInput,
        408 => ErrorKind::Timeout,
        500..=599 => ErrorKind::Upstream,
        _ => ErrorKind::Rejected,
    }
}

/// Classify a non-success response, keeping a short body excerpt and any
/// `Retry-After` hint.
pub fn classify_status(url: &str, status: StatusCode, headers: &HeaderMap, body: &str) -> StageError {
    let excerpt: String = body.trim().chars().take(MAX_ERROR_BODY).collect();
    let message = if excerpt.is_empty() {
        format!("{url}: HTTP {status}")
    } else {
        format!("{url}: HTTP {status}: {excerpt}")
    };
    StageError::new(status_kind(status), message).with_retry_after(retry_after(headers))
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn status_mapping() {
        assert_eq!(status_kind(StatusCode::TOO_MANY_REQUESTS), ErrorKind::RateLimited);
        assert_eq!(status_kind(StatusCode::NOT_FOUND), ErrorKind::NotFound);
        assert_eq!(status_kind(StatusCode::BAD_REQUEST), ErrorKind::InvalidInput);
        assert_eq!(status_kind(StatusCode::UNPROCESSABLE_ENTITY), ErrorKind::InvalidInput);
        assert_eq!(status_kind(StatusCode::BAD_GATEWAY), ErrorKind::Upstream);
        assert_eq!(status_kind(StatusCode::FORBIDDEN), ErrorKind::Rejected);
    }

    #[test]
    fn retry_after_seconds() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(3)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn error_message_truncates_body() {
        let body = "x".repeat(1000);
        let err = classify_status("http://h/x", StatusCode::BAD_GATEWAY, &HeaderMap::new(), &body);
        assert_eq!(err.kind, ErrorKind::Upstream);
        assert!(err.message.len() < 300);
    }
}
