use thiserror::Error;

use crate::job::JobId;
use crate::trial::TrialId;

/// Main error type for the tuna orchestrator.
///
/// Setup-time errors (graph validation, dependency binding, configuration)
/// propagate out of the API call that triggered them. Execution failures do
/// not: a failing job is recorded as job state and surfaces through the
/// owning trial's aggregate state instead.
#[derive(Debug, Error)]
pub enum Error {
    /// A job was asked to run without an assigned runner.
    #[error("job {0} has no runner bound")]
    UnboundJob(JobId),

    /// The declared steps do not form a usable DAG.
    #[error("invalid step graph: {0}")]
    InvalidStepGraph(String),

    /// A dependency edge cannot be bound to the child step's arguments.
    #[error("dependency binding for step '{step}' failed: {reason}")]
    DependencyBinding { step: String, reason: String },

    /// The local pool was shut down while this job was still in flight.
    #[error("runner shut down before job {0} finished")]
    RunnerShutdown(JobId),

    /// Jobs can only be added to a trial before it is dispatched.
    #[error("trial {0} is already dispatched; no more jobs can be added")]
    TrialSealed(TrialId),

    /// The scheduler has no trial registered under this id.
    #[error("unknown trial {0}")]
    UnknownTrial(TrialId),

    /// Results were requested from a trial that did not complete.
    #[error("trial {0} has no usable results")]
    TrialFailed(TrialId),

    /// Every trial failed; there is no best parameterization to report.
    #[error("no usable result: every trial failed")]
    NoUsableResult,

    /// Scheduler or runner misconfiguration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A backend reported a failure; the message is captured verbatim.
    #[error("backend error: {0}")]
    Backend(String),

    /// The parameter-suggestion oracle reported an error.
    #[error("oracle error: {0}")]
    Oracle(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for tuna operations.
pub type Result<T> = std::result::Result<T, Error>;
