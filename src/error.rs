//! Error types for the Kubernetes CPI
//!
//! Errors carry enough structure for the dispatcher to report a CPI error
//! class and a retry hint. Every error that crosses a component boundary is
//! wrapped in [`Error::Step`] so the caller sees the chain of steps that led
//! to the failure.

use std::time::Duration;

use thiserror::Error;

/// Main error type for CPI operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Building a client for a cluster context failed
    #[error("client error for context {context:?}: {message}")]
    Client {
        /// Context the client was requested for
        context: String,
        /// Description of what failed
        message: String,
    },

    /// Caller supplied input that can never succeed
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// A disk and a VM live in different cluster contexts
    #[error(
        "Kubernetes disk and resource pool contexts must be the same: disk: {disk_context:?}, resource pool: {vm_context:?}"
    )]
    ContextMismatch {
        /// Context encoded in the disk CID
        disk_context: String,
        /// Context encoded in the VM CID
        vm_context: String,
    },

    /// The watch stream delivered something other than a modification
    #[error("unexpected {kind} watch event: {event}")]
    UnexpectedEvent {
        /// Object kind being watched
        kind: &'static str,
        /// The event that was received
        event: String,
    },

    /// A readiness wait exceeded its deadline
    #[error("{operation} failed with a timeout after {timeout:?}")]
    Timeout {
        /// The wait that timed out (e.g. "Pod create")
        operation: String,
        /// The configured deadline
        timeout: Duration,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Configuration could not be loaded
    #[error("config error: {message}")]
    Config {
        /// Description of what failed
        message: String,
    },

    /// The CPI method is deliberately unsupported on this platform
    #[error("{method} is not supported")]
    NotSupported {
        /// CPI method name
        method: String,
    },

    /// The CPI method has not been implemented
    #[error("{method} is not implemented")]
    NotImplemented {
        /// CPI method name
        method: String,
    },

    /// An error annotated with the step that produced it
    #[error("{step}: {source}")]
    Step {
        /// Name of the failing step (e.g. "Getting pod")
        step: String,
        /// The underlying failure
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap an error with the name of the step that produced it
    pub fn wrap(step: impl Into<String>, source: impl Into<Error>) -> Self {
        Self::Step {
            step: step.into(),
            source: Box::new(source.into()),
        }
    }

    /// Create a client construction error
    pub fn client(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Client {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a timeout error for the given wait
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// The innermost error, skipping every [`Error::Step`] wrapper
    pub fn root(&self) -> &Error {
        match self {
            Error::Step { source, .. } => source.root(),
            other => other,
        }
    }

    /// True when the API server answered 404
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// True when the API server answered 409 AlreadyExists
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self.root(),
            Error::Kube { source: kube::Error::Api(ae) }
                if ae.code == 409 || ae.reason == "AlreadyExists"
        )
    }

    /// True when a readiness wait ran out of time
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Error::Timeout { .. })
    }

    /// Check if the director may retry the call that produced this error
    ///
    /// Input errors never succeed on retry; transient API failures and
    /// timeouts might.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Step { source, .. } => source.is_retryable(),
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Client { .. } => true,
            Error::Timeout { .. } => true,
            Error::UnexpectedEvent { .. } => true,
            Error::Validation { .. }
            | Error::ContextMismatch { .. }
            | Error::Serialization { .. }
            | Error::Config { .. }
            | Error::NotSupported { .. }
            | Error::NotImplemented { .. } => false,
        }
    }

    /// The CPI error class reported to the director
    pub fn bosh_type(&self) -> &'static str {
        match self.root() {
            Error::NotSupported { .. } => "Bosh::Clouds::NotSupported",
            Error::NotImplemented { .. } => "Bosh::Clouds::NotImplemented",
            _ => "Bosh::Clouds::CloudError",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, reason: &str) -> Error {
        Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{} error", reason),
            reason: reason.to_string(),
            code,
        }))
    }

    /// Story: a failure deep inside attach surfaces with every step name
    #[test]
    fn story_wrapped_errors_read_as_a_causal_chain() {
        let inner = Error::timeout("Pod create", Duration::from_secs(300));
        let err = Error::wrap(
            "Recreating pod to attach disk",
            Error::wrap("Waiting for pod recreate", inner),
        );

        let msg = err.to_string();
        assert!(msg.starts_with("Recreating pod to attach disk: Waiting for pod recreate: "));
        assert!(msg.contains("Pod create failed with a timeout"));
        assert!(err.is_timeout());
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_not_found_detection_sees_through_wrapping() {
        let err = Error::wrap("Getting pod", api_error(404, "NotFound"));
        assert!(err.is_not_found());
        assert!(!err.is_already_exists());
    }

    #[test]
    fn test_already_exists_detection() {
        assert!(api_error(409, "AlreadyExists").is_already_exists());
        assert!(!api_error(500, "InternalError").is_already_exists());
    }

    #[test]
    fn test_retry_hints() {
        assert!(!api_error(422, "Invalid").is_retryable());
        assert!(api_error(503, "ServiceUnavailable").is_retryable());
        assert!(!Error::validation("bad replicas").is_retryable());
        assert!(Error::timeout("Disk creation", Duration::from_secs(1)).is_retryable());
        assert!(!Error::wrap("Creating VM", Error::validation("no network")).is_retryable());
    }

    #[test]
    fn test_bosh_error_classes() {
        let unsupported = Error::NotSupported {
            method: "reboot_vm".to_string(),
        };
        assert_eq!(unsupported.bosh_type(), "Bosh::Clouds::NotSupported");

        let unimplemented = Error::NotImplemented {
            method: "snapshot_disk".to_string(),
        };
        assert_eq!(unimplemented.bosh_type(), "Bosh::Clouds::NotImplemented");

        assert_eq!(
            Error::validation("x").bosh_type(),
            "Bosh::Clouds::CloudError"
        );
    }

    #[test]
    fn test_context_mismatch_message_names_both_contexts() {
        let err = Error::ContextMismatch {
            disk_context: "east".to_string(),
            vm_context: "west".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("\"east\""));
        assert!(msg.contains("\"west\""));
    }
}
