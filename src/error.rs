//! Error types for the Dex Operator

use thiserror::Error;

/// Result type for the operator
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the operator
#[derive(Debug, Error)]
pub enum Error {
    /// Resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),
    /// Write rejected because the resource version was stale
    #[error("Conflict: {0}")]
    Conflict(String),
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(String),
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),
    /// Secret error
    #[error("Secret error: {0}")]
    SecretError(String),
    /// Certificate generation error
    #[error("Certificate error: {0}")]
    CertificateError(String),
    /// The pass deadline expired during a step
    #[error("Timed out: {0}")]
    Timeout(String),
    /// A convergence step failed
    #[error("failed to {action}. error: {source}")]
    StepFailed {
        /// Reason code recorded on the Applied condition
        reason: &'static str,
        /// What the step was doing
        action: &'static str,
        /// Underlying cause
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// True when the error means the requested resource is absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Map a kube client error onto the operator taxonomy
    pub fn from_kube(context: impl std::fmt::Display, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref response) if response.code == 404 => {
                Error::NotFound(format!("{}: {}", context, response.message))
            }
            kube::Error::Api(ref response) if response.code == 409 => {
                Error::Conflict(format!("{}: {}", context, response.message))
            }
            other => Error::KubeError(format!("{}: {}", context, other)),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::ConfigError(format!("JSON serialization failed: {}", err))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::ConfigError(format!("YAML serialization failed: {}", err))
    }
}
