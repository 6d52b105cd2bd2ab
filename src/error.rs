//! Error types for the operator
//!
//! Every failure that reaches the reconciler is mapped onto an [`ErrorClass`],
//! which decides between terminal failure, retry with backoff, token eviction
//! and conflict handling.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// HTTP transport failure talking to Vault
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Operator configuration is unusable
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Resource spec failed local validation
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Remote path could not be resolved from the resource spec
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Vault rejected the payload (4xx other than auth/conflict)
    #[error("Vault rejected the request for {path}: {message}")]
    RemoteValidation { path: String, message: String },

    /// Login was refused or the token was rejected by an authenticated call
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// The remote object changed between read and write
    #[error("Conflicting update at {0}")]
    Conflict(String),

    /// Remote call exceeded its deadline
    #[error("{operation} on {path} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        path: String,
        timeout: Duration,
    },

    /// Server-side or network failure worth retrying
    #[error("Transient remote error: {0}")]
    Transient(String),
}

/// How the reconciler treats a failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Terminal until the spec changes
    Validation,
    /// Evict the cached token and retry with backoff
    Auth,
    /// Retry with exponential backoff
    Transient,
    /// Re-fetch and re-diff, then wait for the next resync
    Conflict,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Auth => "auth",
            ErrorClass::Transient => "transient",
            ErrorClass::Conflict => "conflict",
        }
    }
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::ValidationError(_) | Error::InvalidPath(_) | Error::RemoteValidation { .. } => {
                ErrorClass::Validation
            }
            Error::AuthRejected(_) => ErrorClass::Auth,
            Error::Conflict(_) => ErrorClass::Conflict,
            Error::KubeError(_)
            | Error::HttpError(_)
            | Error::SerializationError(_)
            | Error::ConfigError(_)
            | Error::Timeout { .. }
            | Error::Transient(_) => ErrorClass::Transient,
        }
    }

    /// Whether an automatic retry can make progress without a spec change
    pub fn is_retriable(&self) -> bool {
        !matches!(self.class(), ErrorClass::Validation)
            && !matches!(self, Error::ConfigError(_))
    }
}

impl Error {
    /// Owned copy with the same class and message
    ///
    /// Wrapped library errors are not `Clone`; they are carried over as
    /// [`Error::Transient`] with their rendered message.
    pub fn replicate(&self) -> Error {
        match self {
            Error::ConfigError(m) => Error::ConfigError(m.clone()),
            Error::ValidationError(m) => Error::ValidationError(m.clone()),
            Error::InvalidPath(m) => Error::InvalidPath(m.clone()),
            Error::RemoteValidation { path, message } => Error::RemoteValidation {
                path: path.clone(),
                message: message.clone(),
            },
            Error::AuthRejected(m) => Error::AuthRejected(m.clone()),
            Error::Conflict(m) => Error::Conflict(m.clone()),
            Error::Timeout {
                operation,
                path,
                timeout,
            } => Error::Timeout {
                operation: *operation,
                path: path.clone(),
                timeout: *timeout,
            },
            Error::Transient(m) => Error::Transient(m.clone()),
            Error::KubeError(_) | Error::HttpError(_) | Error::SerializationError(_) => {
                Error::Transient(self.to_string())
            }
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replicate_keeps_class_and_message() {
        let rejected = Error::AuthRejected("permission denied".to_string());
        let copy = rejected.replicate();
        assert_eq!(copy.class(), ErrorClass::Auth);
        assert_eq!(copy.to_string(), rejected.to_string());

        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let copy = Error::SerializationError(parse).replicate();
        assert_eq!(copy.class(), ErrorClass::Transient);
        assert!(copy.to_string().contains("Serialization error"));
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(
            Error::InvalidPath("".to_string()).class(),
            ErrorClass::Validation
        );
        assert_eq!(
            Error::RemoteValidation {
                path: "db/roles/a".to_string(),
                message: "bad".to_string()
            }
            .class(),
            ErrorClass::Validation
        );
        assert_eq!(
            Error::AuthRejected("denied".to_string()).class(),
            ErrorClass::Auth
        );
        assert_eq!(
            Error::Conflict("db/roles/a".to_string()).class(),
            ErrorClass::Conflict
        );
        assert_eq!(
            Error::Timeout {
                operation: "read",
                path: "db/roles/a".to_string(),
                timeout: Duration::from_secs(1),
            }
            .class(),
            ErrorClass::Transient
        );
    }

    #[test]
    fn test_is_retriable() {
        assert!(Error::Transient("503".to_string()).is_retriable());
        assert!(Error::AuthRejected("403".to_string()).is_retriable());
        assert!(!Error::ValidationError("missing".to_string()).is_retriable());
        assert!(!Error::ConfigError("no vault address".to_string()).is_retriable());
    }
}
