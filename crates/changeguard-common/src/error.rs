//! Error types for the changeguard operator
//!
//! Errors are structured so that reconcilers, admission handlers and the
//! callback endpoint can decide between "retry later", "superseded, stop" and
//! "deny outright" without string matching.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for changeguard operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid or unsupported resource content
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Resource (namespace/name or kind) carrying the invalid value
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.target.objectRef.kind")
        field: Option<String>,
    },

    /// Referenced object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of the missing object
        kind: String,
        /// namespace/name of the missing object
        name: String,
    },

    /// Review-service call failed
    #[error("review service error [{action}]: {message}")]
    Review {
        /// Review-service action (e.g. "submitChangeFinishNotify")
        action: String,
        /// Description of what failed
        message: String,
        /// Whether the failure happened at the transport layer
        retryable: bool,
    },

    /// The execution no longer matches the brief on its workload
    #[error("execution {execution} superseded by {current}")]
    Superseded {
        /// Execution that was being worked on
        execution: String,
        /// Execution id currently recorded for the workload
        current: String,
    },

    /// A bounded wait ran out of time
    #[error("timed out after {after:?}: {message}")]
    Timeout {
        /// What was being waited for
        message: String,
        /// How long the wait lasted
        after: Duration,
    },

    /// A bounded wait was cancelled by its caller
    #[error("cancelled: {message}")]
    Cancelled {
        /// What was being waited for
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "webhook")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a non-retryable review-service error
    pub fn review(action: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Review {
            action: action.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a review-service transport error (retried by the client)
    pub fn review_transport(action: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Review {
            action: action.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a supersession error
    pub fn superseded(execution: impl Into<String>, current: impl Into<String>) -> Self {
        Self::Superseded {
            execution: execution.into(),
            current: current.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            message: msg.into(),
            after,
        }
    }

    /// Create a cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, serialization and supersession errors need a change in the
    /// cluster before anything different can happen. Review errors are only
    /// retryable at the transport layer.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
            ),
            Error::Validation { .. } => false,
            Error::NotFound { .. } => true,
            Error::Review { retryable, .. } => *retryable,
            Error::Superseded { .. } => false,
            Error::Timeout { .. } => true,
            Error::Cancelled { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True when the API server rejected a write because of a stale resourceVersion
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// True for API 404s and [`Error::NotFound`]
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            Error::NotFound { .. } => true,
            _ => false,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            Error::Review { action, .. } => Some(action),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
