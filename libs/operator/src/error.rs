use thiserror::Error;

/// Errors surfaced by the reconciliation core. The variants follow the
/// operator's recovery taxonomy: transient API and external errors are
/// requeued with backoff, validation errors wait for a spec change, job
/// failures wait for operator intervention.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("waiting for dependency: {0}")]
    DependencyNotReady(String),

    #[error("dependents exist: {0}")]
    DependentsExist(String),

    #[error("external system: {0}")]
    External(String),

    #[error("job {0} failed: {1}")]
    JobFailed(String, String),

    #[error("invalid trace id")]
    InvalidTraceId,
}

impl Error {
    /// Bounded-cardinality label for the failure counter.
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::Kube(_) => "kube",
            Error::Serialization(_) => "serialization",
            Error::MissingObjectKey(_) => "missing_object_key",
            Error::Validation(_) => "validation",
            Error::DependencyNotReady(_) => "dependency_not_ready",
            Error::DependentsExist(_) => "dependents_exist",
            Error::External(_) => "external",
            Error::JobFailed(_, _) => "job_failed",
            Error::InvalidTraceId => "invalid_trace_id",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
