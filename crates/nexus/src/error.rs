use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Core error taxonomy. Every failure that crosses a component boundary is
/// one of these kinds; the coordinator retries transient kinds locally and
/// everything else surfaces to the orchestrator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Transient provider error after {attempts} attempt(s): {last_error}")]
    ProviderTransient { attempts: u32, last_error: String },

    #[error("Permanent provider error: {0}")]
    ProviderPermanent(String),

    #[error("Provider degraded: {0}")]
    ProviderDegraded(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Dependency failed: {0}")]
    DependencyFailed(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Config(_) => ErrorKind::Config,
            CoreError::Store(_) => ErrorKind::Store,
            CoreError::ProviderTransient { .. } => ErrorKind::ProviderTransient,
            CoreError::ProviderPermanent(_) => ErrorKind::ProviderPermanent,
            CoreError::ProviderDegraded(_) => ErrorKind::ProviderDegraded,
            CoreError::Timeout(_) => ErrorKind::Timeout,
            CoreError::Cancelled => ErrorKind::Cancelled,
            CoreError::DependencyFailed(_) => ErrorKind::DependencyFailed,
            CoreError::InvariantViolation(_) => ErrorKind::InvariantViolation,
        }
    }

    /// Whether the coordinator may requeue the operation that produced this.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::ProviderTransient { .. } | CoreError::Timeout(_)
        )
    }
}

/// Stable labels for `meta.error_kind` on events and ledger rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Store,
    ProviderTransient,
    ProviderPermanent,
    ProviderDegraded,
    Timeout,
    Cancelled,
    DependencyFailed,
    InvariantViolation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Store => "store",
            ErrorKind::ProviderTransient => "provider_transient",
            ErrorKind::ProviderPermanent => "provider_permanent",
            ErrorKind::ProviderDegraded => "provider_degraded",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::DependencyFailed => "dependency_failed",
            ErrorKind::InvariantViolation => "invariant_violation",
        }
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "config" => Ok(ErrorKind::Config),
            "store" => Ok(ErrorKind::Store),
            "provider_transient" => Ok(ErrorKind::ProviderTransient),
            "provider_permanent" => Ok(ErrorKind::ProviderPermanent),
            "provider_degraded" => Ok(ErrorKind::ProviderDegraded),
            "timeout" => Ok(ErrorKind::Timeout),
            "cancelled" => Ok(ErrorKind::Cancelled),
            "dependency_failed" => Ok(ErrorKind::DependencyFailed),
            "invariant_violation" => Ok(ErrorKind::InvariantViolation),
            other => Err(format!("unknown error kind: {other}")),
        }
    }
}

impl From<crate::store::StoreError> for CoreError {
    fn from(err: crate::store::StoreError) -> Self {
        CoreError::Store(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels_round_trip() {
        let kinds = [
            ErrorKind::Config,
            ErrorKind::Store,
            ErrorKind::ProviderTransient,
            ErrorKind::ProviderPermanent,
            ErrorKind::ProviderDegraded,
            ErrorKind::Timeout,
            ErrorKind::Cancelled,
            ErrorKind::DependencyFailed,
            ErrorKind::InvariantViolation,
        ];
        for kind in kinds {
            let parsed: ErrorKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(CoreError::ProviderTransient {
            attempts: 2,
            last_error: "503".into()
        }
        .is_transient());
        assert!(CoreError::Timeout("deadline".into()).is_transient());
        assert!(!CoreError::ProviderPermanent("401".into()).is_transient());
        assert!(!CoreError::Cancelled.is_transient());
    }
}
