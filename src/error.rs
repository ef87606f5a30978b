//! Error types for the gpufleet operator

use thiserror::Error;

/// Main error type for gpufleet operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for CRD specs
    #[error("validation error: {0}")]
    Validation(String),

    /// The GpuPool referenced by a workload does not exist
    #[error("gpu pool({0}) does not exist")]
    PoolNotFound(String),

    /// The allocator could not satisfy a GPU request
    #[error("allocation error: {0}")]
    Allocation(String),

    /// No host port could be reserved or released
    #[error("host port error: {0}")]
    HostPort(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal/operational error
    #[error("internal error: {0}")]
    Internal(String),

    /// An error from a deeper call, wrapped with a short description of the step
    #[error("{context}: {source}")]
    Context {
        /// What the reconciler was doing when the error occurred
        context: String,
        /// The underlying error
        source: Box<Error>,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an allocation error with the given message
    pub fn allocation(msg: impl Into<String>) -> Self {
        Self::Allocation(msg.into())
    }

    /// Create a host port error with the given message
    pub fn host_port(msg: impl Into<String>) -> Self {
        Self::HostPort(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Wrap this error with a short context string
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Strip context wrappers and return the underlying error
    pub fn root(&self) -> &Error {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns true if the underlying error is a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Self::Kube(kube::Error::Api(ae)) if ae.code == 404)
    }

    /// Returns true if the underlying error is a Kubernetes 409 (stale resource version)
    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), Self::Kube(kube::Error::Api(ae)) if ae.code == 409)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Attach context to errors flowing out of a fallible step
pub trait ResultExt<T> {
    /// Wrap the error (if any) with a short context string
    fn context(self, context: &str) -> Result<T, Error>;
}

impl<T, E: Into<Error>> ResultExt<T> for Result<T, E> {
    fn context(self, context: &str) -> Result<T, Error> {
        self.map_err(|e| e.into().context(context))
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} (test)"),
        reason: reason.to_string(),
        code,
    }))
}
