//! Error types for the fleet networking controllers
//!
//! Errors carry the resource they were about and a coarse [`ErrorKind`] so
//! that reconcilers can branch on "already gone", "lost a race" and "try
//! again shortly" without string matching.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Coarse classification of API failures
///
/// Derived from the Kubernetes status reason (or HTTP code when no reason is
/// set) for object store errors, and from the HTTP status for Traffic Manager
/// errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The object does not exist
    NotFound,
    /// Optimistic-concurrency failure: the resourceVersion is stale
    Conflict,
    /// Create of an object that already exists
    AlreadyExists,
    /// The request was rejected as invalid
    Invalid,
    /// The caller is not permitted to perform the request
    Forbidden,
    /// The request timed out before it could complete
    Timeout,
    /// The server could not complete the request in time
    ServerTimeout,
    /// The server is throttling the caller
    TooManyRequests,
    /// Anything else
    Other,
}

impl ErrorKind {
    /// Classify a Kubernetes API status
    pub fn from_status(code: u16, reason: &str) -> Self {
        match reason {
            "NotFound" => return Self::NotFound,
            "AlreadyExists" => return Self::AlreadyExists,
            "Conflict" => return Self::Conflict,
            "Invalid" => return Self::Invalid,
            "Forbidden" => return Self::Forbidden,
            "Timeout" => return Self::Timeout,
            "ServerTimeout" => return Self::ServerTimeout,
            "TooManyRequests" => return Self::TooManyRequests,
            _ => {}
        }
        match code {
            404 => Self::NotFound,
            409 => Self::Conflict,
            422 => Self::Invalid,
            403 => Self::Forbidden,
            429 => Self::TooManyRequests,
            504 => Self::Timeout,
            _ => Self::Other,
        }
    }

    /// Errors worth retrying locally before surfacing to the controller
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ServerTimeout | Self::TooManyRequests
        )
    }
}

/// Main error type for fleet networking operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Object store error not backed by a kube-rs error (e.g. the in-memory store)
    #[error("store error [{kind:?}] for {resource}: {message}")]
    Store {
        /// Classification of the failure
        kind: ErrorKind,
        /// Resource the request was about (e.g. "ServiceImport work/nginx")
        resource: String,
        /// Description of what failed
        message: String,
    },

    /// Azure Traffic Manager API error
    #[error("traffic manager error [{kind:?}] for {resource_type}: {message}")]
    TrafficManager {
        /// Classification of the failure
        kind: ErrorKind,
        /// Resource type the call was about (profile, endpoint)
        resource_type: String,
        /// Description of what failed
        message: String,
    },

    /// Validation error for an object
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// The invalid resource
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// A bounded wait ran out of steps without reaching the desired state
    #[error("timed out waiting for {operation}: {message}")]
    Timeout {
        /// The operation being waited on
        operation: String,
        /// Description of the last observed state
        message: String,
    },

    /// The operation was cancelled by shutdown or an enclosing deadline
    #[error("{operation} cancelled")]
    Cancelled {
        /// The operation that was interrupted
        operation: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "controller")
        context: String,
    },
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

impl Error {
    /// Create a store error with the given classification
    pub fn store(kind: ErrorKind, resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Store {
            kind,
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a NotFound store error
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::store(ErrorKind::NotFound, resource, "not found")
    }

    /// Create a Conflict store error
    pub fn conflict(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::store(ErrorKind::Conflict, resource, msg)
    }

    /// Create a Traffic Manager API error
    pub fn traffic_manager(
        kind: ErrorKind,
        resource_type: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::TrafficManager {
            kind,
            resource_type: resource_type.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a timeout error for a bounded wait
    pub fn timeout(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
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

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => ErrorKind::from_status(ae.code, &ae.reason),
                _ => ErrorKind::Other,
            },
            Error::Store { kind, .. } => *kind,
            Error::TrafficManager { kind, .. } => *kind,
            Error::Validation { .. } => ErrorKind::Invalid,
            Error::Serialization { .. }
            | Error::Timeout { .. }
            | Error::Cancelled { .. }
            | Error::Internal { .. } => ErrorKind::Other,
        }
    }

    /// The object is already gone
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Someone else updated the object first
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    /// Timeout, server timeout or throttling
    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}

/// Drop a NotFound error, keeping everything else
///
/// Callers that expect the object may already be gone use this to treat
/// absence as success.
pub fn ignore_not_found<T: Default>(result: Result<T, Error>) -> Result<T, Error> {
    match result {
        Err(e) if e.is_not_found() => Ok(T::default()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, reason: &str) -> Error {
        Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} from the api server"),
            reason: reason.to_string(),
            code,
        }))
    }

    // ==========================================================================
    // Story Tests: How reconcilers read API failures
    // ==========================================================================

    /// Story: A racing delete is recognised as "already gone"
    ///
    /// Reconcilers treat NotFound as somebody else reaching the end state
    /// first, so it must be recognised from both kube and store errors.
    #[test]
    fn story_not_found_is_recognised_everywhere() {
        assert!(api_error(404, "NotFound").is_not_found());
        assert!(api_error(404, "").is_not_found());
        assert!(Error::not_found("ServiceImport work/app").is_not_found());
        assert!(!Error::internal("boom").is_not_found());
    }

    /// Story: Lost optimistic-concurrency races are distinguishable
    #[test]
    fn story_conflicts_are_distinct_from_already_exists() {
        assert!(api_error(409, "Conflict").is_conflict());
        assert_eq!(api_error(409, "AlreadyExists").kind(), ErrorKind::AlreadyExists);
        assert!(!api_error(409, "AlreadyExists").is_conflict());
        assert!(Error::conflict("claim", "stale resourceVersion").is_conflict());
    }

    /// Story: Only throttling and timeouts are retried locally
    ///
    /// Conflicts need a fresh read, so they are deliberately not transient.
    #[test]
    fn story_transient_classification() {
        assert!(api_error(504, "Timeout").is_transient());
        assert!(api_error(500, "ServerTimeout").is_transient());
        assert!(api_error(429, "TooManyRequests").is_transient());
        assert!(api_error(429, "").is_transient());

        assert!(!api_error(409, "Conflict").is_transient());
        assert!(!api_error(422, "Invalid").is_transient());
        assert!(!api_error(500, "InternalError").is_transient());
        assert!(!Error::timeout("delete", "still present").is_transient());
    }

    /// Story: Absence is success for callers that expect it
    #[test]
    fn story_ignore_not_found() {
        assert!(ignore_not_found::<()>(Err(Error::not_found("x"))).is_ok());
        assert!(ignore_not_found::<()>(Err(Error::conflict("x", "y"))).is_err());
        assert_eq!(ignore_not_found(Ok(3)).ok(), Some(3));
    }

    /// Story: Messages name the resource involved
    #[test]
    fn story_errors_name_their_resource() {
        let err = Error::store(ErrorKind::Invalid, "ServiceExport work/app", "bad spec");
        assert!(err.to_string().contains("ServiceExport work/app"));

        let err = Error::traffic_manager(ErrorKind::Forbidden, "profile", "denied");
        assert!(err.to_string().contains("profile"));
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let err = Error::validation_for("ServiceExport work/app", "weight out of range");
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }
}
