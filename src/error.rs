//! Error types for the gateway core.
//!
//! Messages are lowercase and name the thing that failed. The binary edge
//! (`main`, `ssh`) wraps these in `anyhow` with context; everything below it
//! returns one of the typed errors here.

use thiserror::Error;

/// The configuration failed validation. No handler exists after this error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required field is empty.
    #[error("invalid configuration: {field} is required")]
    Missing {
        /// Dotted path of the field.
        field: String,
    },

    /// A field holds a value outside its allowed range.
    #[error("invalid configuration: {field}: {reason}")]
    Invalid {
        /// Dotted path of the field.
        field: String,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    pub fn missing(field: impl Into<String>) -> Self {
        Self::Missing {
            field: field.into(),
        }
    }

    pub fn invalid(field: impl Into<String>, reason: impl ToString) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.to_string(),
        }
    }

    /// Dotted path of the offending field.
    pub fn field(&self) -> &str {
        match self {
            Self::Missing { field } | Self::Invalid { field, .. } => field,
        }
    }
}

/// Failures talking to the container daemon.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The daemon could not be reached at all.
    #[error("docker daemon unreachable at {host}: {reason}")]
    Unreachable { host: String, reason: String },

    /// The daemon speaks an API older than the gateway supports.
    #[error("unsupported docker api version {found} (need at least {required})")]
    UnsupportedVersion { found: String, required: String },

    /// The image is missing and could not (or may not) be pulled.
    #[error("image unavailable: {image}: {reason}")]
    ImageUnavailable { image: String, reason: String },

    /// A backend call did not finish in time.
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: &'static str, seconds: u64 },

    /// The operation was abandoned because the connection is going away.
    #[error("backend operation cancelled")]
    Cancelled,

    /// The daemon returned an error.
    #[error("docker api request failed: {0}")]
    Api(#[from] bollard::errors::Error),

    /// Anything else the daemon did that the gateway did not expect.
    #[error("unexpected backend response: {0}")]
    Unexpected(String),
}

impl BackendError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BackendError::Cancelled)
    }
}

/// Errors returned by the connection handler and its session channels.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Creating or attaching a backend unit failed. Counted as a backend failure.
    #[error("provisioning failed: {0}")]
    Provisioning(#[source] BackendError),

    /// The caller used the handler or a channel in a state that does not allow it.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The handler's cancellation signal fired while the operation was pending.
    #[error("operation cancelled: connection is shutting down")]
    Cancelled,

    /// The requested feature is not available with this configuration.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A non-provisioning backend call (resize, signal, wait) failed.
    #[error("backend request failed: {0}")]
    Backend(#[source] BackendError),
}

impl HandlerError {
    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation(reason.into())
    }

    /// Wrap a provisioning failure, keeping cancellation distinguishable.
    pub(crate) fn provisioning(err: BackendError) -> Self {
        if err.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Provisioning(err)
        }
    }

    /// Wrap a failure of a non-provisioning backend call.
    pub(crate) fn backend(err: BackendError) -> Self {
        if err.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Backend(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_field() {
        assert_eq!(ConfigError::missing("a.b").field(), "a.b");
        let err = ConfigError::invalid("docker.timeouts.http_secs", "must be greater than zero");
        assert_eq!(err.field(), "docker.timeouts.http_secs");
        assert_eq!(
            err.to_string(),
            "invalid configuration: docker.timeouts.http_secs: must be greater than zero"
        );
    }

    #[test]
    fn test_cancellation_is_not_a_provisioning_error() {
        assert!(matches!(
            HandlerError::provisioning(BackendError::Cancelled),
            HandlerError::Cancelled
        ));
        assert!(matches!(
            HandlerError::provisioning(BackendError::Unexpected("boom".into())),
            HandlerError::Provisioning(_)
        ));
    }
}
