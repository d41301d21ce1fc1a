//! Error types for the ArangoDB operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Variants carry the deployment, action type or resource involved so that
//! a log line alone is enough to tell what the reconciler was doing.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for deployment specs
    #[error("validation error for {deployment}: {message}")]
    Validation {
        /// Name of the deployment with invalid configuration
        deployment: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.dbservers.count")
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// A plan references an action type with no registered factory
    ///
    /// This is a skew between the plan builder and the action registry,
    /// never a transient condition.
    #[error("unknown action type: {action_type}")]
    UnknownAction {
        /// The unregistered action type
        action_type: String,
    },

    /// The same action type was registered twice
    #[error("action type registered twice: {action_type}")]
    DuplicateAction {
        /// The duplicated action type
        action_type: String,
    },

    /// Optimistic concurrency check failed on a status write
    #[error("status conflict: expected version {expected}, found {actual}")]
    Conflict {
        /// Version the writer based its update on
        expected: String,
        /// Version currently persisted
        actual: String,
    },

    /// ArangoDB server or agency request failed
    #[error("database error [{endpoint}]: {message}")]
    Database {
        /// Endpoint or operation that failed
        endpoint: String,
        /// Description of what failed
        message: String,
        /// Whether the request may succeed if repeated
        retryable: bool,
    },

    /// An action refused to proceed
    #[error("action {action} failed: {message}")]
    ActionFailed {
        /// Action type that failed
        action: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "executor", "builder")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            deployment: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with deployment context and field path
    pub fn validation_for_field(
        deployment: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            deployment: deployment.into(),
            message: msg.into(),
            field: Some(field.into()),
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

    /// Create an unknown action error
    pub fn unknown_action(action_type: impl Into<String>) -> Self {
        Self::UnknownAction {
            action_type: action_type.into(),
        }
    }

    /// Create a duplicate registration error
    pub fn duplicate_action(action_type: impl Into<String>) -> Self {
        Self::DuplicateAction {
            action_type: action_type.into(),
        }
    }

    /// Create a status conflict error
    pub fn conflict(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::Conflict {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a retryable database error
    pub fn database(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Database {
            endpoint: endpoint.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a database error that repeating the request will not fix
    pub fn database_permanent(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Database {
            endpoint: endpoint.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create an action failure
    pub fn action_failed(action: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ActionFailed {
            action: action.into(),
            message: msg.into(),
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

    /// Returns true if this error is potentially retryable
    ///
    /// Registry errors and spec validation errors will not go away on their
    /// own; everything that talks to a remote system may.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { .. } => true,
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::UnknownAction { .. } => false,
            Error::DuplicateAction { .. } => false,
            Error::Conflict { .. } => true,
            Error::Database { retryable, .. } => *retryable,
            Error::ActionFailed { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Returns true if this error is a lost optimistic concurrency race
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(resp),
            } => resp.code == 409,
            _ => false,
        }
    }

    /// Returns true if this error means the target resource does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(resp) } if resp.code == 404)
    }

    /// Get the deployment name associated with this error, if any
    pub fn deployment(&self) -> Option<&str> {
        match self {
            Error::Validation { deployment, .. } if deployment != UNKNOWN_CONTEXT => {
                Some(deployment)
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
