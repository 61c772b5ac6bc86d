use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Rate limit exceeded: {details}")]
    RateLimited {
        details: String,
        retry_after: Option<Duration>,
    },

    #[error("Server error: {0}")]
    Server(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Provider disabled: {0}")]
    Disabled(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),
}

/// Retry classification applied by the gateway and the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
    Degraded,
}

impl ProviderError {
    pub fn classify(&self) -> ErrorClass {
        match self {
            ProviderError::Timeout(_)
            | ProviderError::RateLimited { .. }
            | ProviderError::Server(_)
            | ProviderError::Network(_) => ErrorClass::Transient,
            ProviderError::Auth(_)
            | ProviderError::Malformed(_)
            | ProviderError::RequestFailed(_) => ErrorClass::Permanent,
            ProviderError::Disabled(_) => ErrorClass::Degraded,
        }
    }

    /// Map an HTTP status to the taxonomy. 429 and 5xx are retryable;
    /// everything else in 4xx fails immediately.
    pub fn from_status(status: reqwest::StatusCode, body: impl Into<String>) -> Self {
        let body = body.into();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            ProviderError::RateLimited {
                details: body,
                retry_after: None,
            }
        } else if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            ProviderError::Auth(format!("status {status}: {body}"))
        } else if status.is_server_error() {
            ProviderError::Server(format!("status {status}: {body}"))
        } else {
            ProviderError::RequestFailed(format!("status {status}: {body}"))
        }
    }
}

fn is_network_error(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout() || (err.status().is_none() && err.is_request())
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return ProviderError::Network("request timed out".to_string());
        }
        if is_network_error(&error) {
            return ProviderError::Network(error.to_string());
        }
        match error.status() {
            Some(status) => ProviderError::from_status(status, error.to_string()),
            None => ProviderError::RequestFailed(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            ProviderError::Timeout(Duration::from_secs(1)).classify(),
            ErrorClass::Transient
        );
        assert_eq!(
            ProviderError::Server("500".into()).classify(),
            ErrorClass::Transient
        );
        assert_eq!(
            ProviderError::RateLimited {
                details: "429".into(),
                retry_after: None
            }
            .classify(),
            ErrorClass::Transient
        );
        assert_eq!(
            ProviderError::Auth("401".into()).classify(),
            ErrorClass::Permanent
        );
        assert_eq!(
            ProviderError::Malformed("not json".into()).classify(),
            ErrorClass::Permanent
        );
        assert_eq!(
            ProviderError::Disabled("no key".into()).classify(),
            ErrorClass::Degraded
        );
    }

    #[test]
    fn test_status_mapping() {
        use reqwest::StatusCode;
        assert!(matches!(
            ProviderError::from_status(StatusCode::TOO_MANY_REQUESTS, ""),
            ProviderError::RateLimited { .. }
        ));
        assert!(matches!(
            ProviderError::from_status(StatusCode::SERVICE_UNAVAILABLE, ""),
            ProviderError::Server(_)
        ));
        assert!(matches!(
            ProviderError::from_status(StatusCode::BAD_REQUEST, ""),
            ProviderError::RequestFailed(_)
        ));
        assert!(matches!(
            ProviderError::from_status(StatusCode::UNAUTHORIZED, ""),
            ProviderError::Auth(_)
        ));
    }
}
