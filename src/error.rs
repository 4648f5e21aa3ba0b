//! Domain error taxonomy shared across the catalog store, the registry
//! clients and the marketplace harvesters.
//!
//! Binaries and orchestration code keep using `anyhow`; these enums are what
//! components hand to each other so callers can branch on the kind of failure
//! instead of string-matching messages.

use std::time::Duration;
use thiserror::Error;

/// Failures surfaced by a [`crate::catalog::CatalogStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// A referenced game/set/card/printing row does not exist yet.
    #[error("dependency missing: {0}")]
    DependencyMissing(String),

    /// Unique/check constraint hit outside the designed upsert path.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// Connection loss, pool exhaustion, statement timeout, serialization failure.
    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
                let message = db_err.message().to_string();
                classify_sqlstate(&code, message)
            }
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => StoreError::Transient(err.to_string()),
            sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
            _ => StoreError::Database(err.to_string()),
        }
    }
}

/// Map a Postgres SQLSTATE onto the store taxonomy.
pub fn classify_sqlstate(code: &str, message: String) -> StoreError {
    match code {
        "23503" => StoreError::DependencyMissing(message),
        "23505" | "23514" | "23502" => StoreError::IntegrityViolation(message),
        // query_canceled, serialization_failure, deadlock_detected, too_many_connections
        "57014" | "40001" | "40P01" | "53300" | "57P01" => StoreError::Transient(message),
        c if c.starts_with("08") => StoreError::Transient(message),
        _ => StoreError::Database(message),
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failures talking to upstream registries and marketplaces.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Connection errors, timeouts, protocol errors, 5xx and 429.
    #[error("transient upstream failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    /// 404; a domain signal rather than a failure.
    #[error("not found upstream: {0}")]
    NotFound(String),

    /// Any other 4xx. Never retried.
    #[error("upstream rejected request ({status}): {url}")]
    Rejected { status: u16, url: String },

    #[error("captcha challenge detected at {0}")]
    Captcha(String),

    #[error("request blocked by {url} (status {status:?})")]
    Blocked { status: Option<u16>, url: String },

    /// Payload decoded but misses required fields.
    #[error("malformed upstream data: {0}")]
    Malformed(String),

    #[error("failed to decode upstream payload: {0}")]
    Decode(String),
}

impl UpstreamError {
    pub fn transient(message: impl Into<String>) -> Self {
        UpstreamError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, UpstreamError::NotFound(_))
    }

    /// Build the error for a non-success HTTP status.
    pub fn from_status(status: u16, url: &str, retry_after: Option<Duration>) -> Self {
        match status {
            404 => UpstreamError::NotFound(url.to_string()),
            429 => UpstreamError::Transient {
                message: format!("429 Too Many Requests from {url}"),
                retry_after,
            },
            500..=599 => UpstreamError::Transient {
                message: format!("{status} from {url}"),
                retry_after,
            },
            _ => UpstreamError::Rejected {
                status,
                url: url.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return UpstreamError::Decode(err.to_string());
        }
        if let Some(status) = err.status() {
            let url = err.url().map(|u| u.to_string()).unwrap_or_default();
            return UpstreamError::from_status(status.as_u16(), &url, None);
        }
        // connect / timeout / request / body errors are all worth another attempt
        UpstreamError::transient(err.to_string())
    }
}

impl From<serde_json::Error> for UpstreamError {
    fn from(err: serde_json::Error) -> Self {
        UpstreamError::Decode(err.to_string())
    }
}

/// Errors that decide whether a retry loop should try again.
pub trait Retryable {
    fn is_retryable(&self) -> bool;

    /// Server supplied lower bound for the next delay (e.g. `Retry-After`).
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Retryable for UpstreamError {
    fn is_retryable(&self) -> bool {
        matches!(self, UpstreamError::Transient { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            UpstreamError::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_classification() {
        assert!(matches!(
            classify_sqlstate("23503", "fk".into()),
            StoreError::DependencyMissing(_)
        ));
        assert!(matches!(
            classify_sqlstate("23505", "dup".into()),
            StoreError::IntegrityViolation(_)
        ));
        assert!(classify_sqlstate("08006", "conn".into()).is_transient());
        assert!(classify_sqlstate("57014", "timeout".into()).is_transient());
        assert!(matches!(
            classify_sqlstate("42P01", "missing table".into()),
            StoreError::Database(_)
        ));
    }

    #[test]
    fn status_classification() {
        assert!(UpstreamError::from_status(404, "u", None).is_not_found());
        assert!(UpstreamError::from_status(503, "u", None).is_retryable());
        assert!(UpstreamError::from_status(429, "u", Some(Duration::from_secs(7))).is_retryable());
        assert_eq!(
            UpstreamError::from_status(429, "u", Some(Duration::from_secs(7))).retry_after(),
            Some(Duration::from_secs(7))
        );
        let rejected = UpstreamError::from_status(403, "u", None);
        assert!(!rejected.is_retryable());
        assert!(matches!(rejected, UpstreamError::Rejected { status: 403, .. }));
    }
}
