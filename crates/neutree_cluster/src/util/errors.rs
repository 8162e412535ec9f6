use std::fmt;
use thiserror::Error;
use tokio::time::Duration;

/// Default delay before the driver re-runs a pass that made progress but has not converged.
pub const NOT_READY_REQUEUE: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum StdError {
    #[error("ConfigError: {0}")]
    ConfigError(String),

    #[error("DependencyNotReady: {0}")]
    DependencyNotReady(String),

    #[error("RemoteUnavailable: {0}")]
    RemoteUnavailable(String),

    #[error("HeterogeneousAccelerators: {0}")]
    HeterogeneousAccelerators(String),

    #[error("NotReadyYet: {0}")]
    NotReadyYet(String),

    #[error("JustProvisioned: {0}")]
    JustProvisioned(String),

    #[error("ResourceNotFound: {0}")]
    ResourceNotFound(String),

    #[error("Fatal: {0}")]
    Fatal(String),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("JsonSerializationError: {0}")]
    JsonSerializationError(#[source] serde_json::Error),

    #[error("YamlSerializationError: {0}")]
    YamlSerializationError(#[source] serde_yaml::Error),

    #[error("HttpError: {0}")]
    HttpError(String),

    #[error("IoError: {0}")]
    IoError(#[source] std::io::Error),

    #[error("CommandFailed: {0}")]
    CommandFailed(String),

    #[error("{key}: {source}")]
    ObjectError {
        key: String,
        #[source]
        source: Box<StdError>,
    },
}

impl StdError {
    pub fn metric_label(&self) -> String {
        let label = match self {
            StdError::ConfigError(_) => "configerror",
            StdError::DependencyNotReady(_) => "dependencynotready",
            StdError::RemoteUnavailable(_) => "remoteunavailable",
            StdError::HeterogeneousAccelerators(_) => "heterogeneousaccelerators",
            StdError::NotReadyYet(_) => "notreadyyet",
            StdError::JustProvisioned(_) => "justprovisioned",
            StdError::ResourceNotFound(_) => "resourcenotfound",
            StdError::Fatal(_) => "fatal",
            StdError::KubeError(_) => "kubeerror",
            StdError::JsonSerializationError(_) => "jsonserializationerror",
            StdError::YamlSerializationError(_) => "yamlserializationerror",
            StdError::HttpError(_) => "httperror",
            StdError::IoError(_) => "ioerror",
            StdError::CommandFailed(_) => "commandfailed",
            StdError::ObjectError { source, .. } => return source.metric_label(),
        };
        label.to_string()
    }

    /// Attach the identity key of the object the failure relates to.
    pub fn with_key(self, key: impl Into<String>) -> StdError {
        StdError::ObjectError {
            key: key.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through object-key wrappers.
    pub fn root(&self) -> &StdError {
        match self {
            StdError::ObjectError { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self.root() {
            StdError::ResourceNotFound(_) => true,
            StdError::KubeError(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Progress was made but convergence is pending; the driver should retry without failing.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            StdError::NotReadyYet(_) | StdError::JustProvisioned(_)
        )
    }
}

#[derive(Error, Debug)]
pub struct ErrorWithRequeue {
    pub duration: Duration,
    pub error: StdError,
}

impl ErrorWithRequeue {
    pub fn new(error: StdError, duration: Duration) -> ErrorWithRequeue {
        ErrorWithRequeue { error, duration }
    }

    pub fn metric_label(&self) -> String {
        self.error.metric_label()
    }
}

impl fmt::Display for ErrorWithRequeue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Standard Error: {0}")]
    StdError(#[source] StdError),

    #[error("Error With Requeue: {0}")]
    ErrorWithRequeue(#[source] ErrorWithRequeue),
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::StdError(e) => e.metric_label(),
            Error::ErrorWithRequeue(e) => e.metric_label(),
        }
    }

    pub fn inner(&self) -> &StdError {
        match self {
            Error::StdError(e) => e,
            Error::ErrorWithRequeue(e) => &e.error,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ErrorWithRequeue(_) => true,
            Error::StdError(e) => e.is_retryable(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.inner().is_not_found()
    }

    /// Message surfaced to users in `status.errorMessage`.
    pub fn user_message(&self) -> String {
        self.inner().to_string()
    }

    pub fn not_ready(message: impl Into<String>) -> Error {
        Error::ErrorWithRequeue(ErrorWithRequeue::new(
            StdError::NotReadyYet(message.into()),
            NOT_READY_REQUEUE,
        ))
    }

    pub fn just_provisioned(message: impl Into<String>, duration: Duration) -> Error {
        Error::ErrorWithRequeue(ErrorWithRequeue::new(
            StdError::JustProvisioned(message.into()),
            duration,
        ))
    }

    /// Attach the identity key of the object the failure relates to.
    pub fn with_key(self, key: impl Into<String>) -> Error {
        match self {
            Error::StdError(e) => Error::StdError(e.with_key(key)),
            Error::ErrorWithRequeue(e) => Error::ErrorWithRequeue(ErrorWithRequeue::new(
                e.error.with_key(key),
                e.duration,
            )),
        }
    }
}

impl From<StdError> for Error {
    fn from(error: StdError) -> Self {
        Error::StdError(error)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
