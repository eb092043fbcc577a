use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::job::Job;

/// Coarse backend-reported status, normalized across execution backends.
///
/// Each concrete runner maps its backend's status strings into this shape;
/// nothing downstream ever sees a raw backend status.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum BackendStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BackendStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// Trait for executors that submit, poll, and cancel jobs on a backend.
///
/// Implementors decouple *what* a job executes from *where* it executes:
/// the trial and step-graph layers depend only on this trait, never on a
/// concrete backend.
///
/// Contract common to all implementations:
///
/// - [`run_job`](Runner::run_job) must return after backend submission
///   latency; long-running execution happens out of band (a pooled worker
///   task for the local variant, a batch or grid job for the others).
/// - [`check_job_status`](Runner::check_job_status) queries the backend and
///   applies `job.complete(..)` or `job.fail(..)` exactly once when a
///   terminal backend state is first observed; it is a no-op for jobs that
///   are already terminal or were never submitted here.
/// - [`cancel_job`](Runner::cancel_job) is best-effort backend cancellation
///   but always leaves the job in a terminal state.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Short backend name used in logs and submission identifiers.
    fn name(&self) -> &str;

    /// Submit the job for execution.
    async fn run_job(&self, job: &Arc<Job>) -> Result<()>;

    /// Poll the backend and apply any newly observed terminal state.
    async fn check_job_status(&self, job: &Arc<Job>) -> Result<()>;

    /// Cancel the job on the backend.
    async fn cancel_job(&self, job: &Arc<Job>) -> Result<()>;
}
