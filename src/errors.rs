use std::fmt;

use thiserror::Error;

/// Coarse classification of a failed fetch, after retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    RateLimited,
    NotFound,
    Timeout,
    Unknown,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FetchErrorKind::RateLimited => "RATE_LIMITED",
            FetchErrorKind::NotFound => "NOT_FOUND",
            FetchErrorKind::Timeout => "TIMEOUT",
            FetchErrorKind::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error)]
#[error("fetch {kind} for {url} after {attempts} attempt(s){}: {message}", status_suffix(.status))]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub url: String,
    pub status: Option<u16>,
    pub attempts: u32,
    pub message: String,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

#[derive(Debug, Clone, Error)]
pub enum ExtractionError {
    #[error("page has no readable content")]
    EmptyContent,

    #[error("no API name could be resolved for {0}")]
    NoApiName(String),

    #[error("malformed content: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("model service rejected credentials: {0}")]
    Auth(String),

    #[error("model service quota exceeded: {0}")]
    Quota(String),

    #[error("model service timed out")]
    Timeout,

    #[error("model service transport error: {0}")]
    Transport(String),

    #[error("malformed model response: {0}")]
    Malformed(String),
}

impl ServiceError {
    /// Bad credentials and unparseable answers will not improve on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::Quota(_) | ServiceError::Timeout | ServiceError::Transport(_)
        )
    }
}

/// Everything that can fail a single row. Never fatal to a batch.
#[derive(Debug, Clone, Error)]
pub enum RowError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_error_message_carries_kind_and_status() {
        let e = FetchError {
            kind: FetchErrorKind::NotFound,
            url: "https://example.com/x".into(),
            status: Some(404),
            attempts: 1,
            message: "not found".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("NOT_FOUND"));
        assert!(msg.contains("HTTP 404"));

        let row: RowError = e.into();
        assert!(matches!(row, RowError::Fetch(_)));
    }
}
