use crate::tasks::config::AgentConfig;
use std::time::Duration;
use thiserror::Error;

/// Finalizer token owned by the finalization engine
pub const APPLIED_MANIFEST_WORK_FINALIZER: &str =
    "cluster.open-cluster-management.io/applied-manifest-work-cleanup";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "work-agent";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Conflict updating {0}, object changed since it was read")]
    Conflict(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Missing object key")]
    MissingObjectKey,

    #[error("{} errors: [{}]", .0.len(), join_errors(.0))]
    Aggregate(Vec<Error>),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Whether requeueing the key can fix the failure.
    ///
    /// Only bad manifests and bad configuration need a human; everything else
    /// is retried with backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::InvalidManifest(_) | Error::ConfigError(_) | Error::MissingObjectKey => false,
            Error::Aggregate(errors) => errors.iter().any(Error::is_retryable),
            _ => true,
        }
    }

    /// Folds a list of errors into `Ok(())`, the single error, or `Aggregate`.
    pub fn aggregate(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate(errors)),
        }
    }
}

/// True for a 404 from the API server
#[must_use]
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// True for a 409 from the API server
#[must_use]
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Runs a remote call under a deadline. An elapsed deadline is a retryable
/// `Timeout`, never a definitive answer.
pub async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(what.to_string())),
    }
}

/// Agent-wide state resolved at startup
#[derive(Clone)]
pub struct Context {
    pub config: std::sync::Arc<AgentConfig>,
    pub hub_hash: String,
}
