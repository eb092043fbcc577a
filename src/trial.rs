use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::job::Job;
use crate::params::{ParamMap, ResultMap};
use crate::stepgraph::StepExecutor;

/// Trial identifier: the oracle's trial index.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct TrialId(pub u64);

impl fmt::Display for TrialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trial-{}", self.0)
    }
}

/// Trial lifecycle states; same shape as the job state machine, one level up.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TrialState {
    Created,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TrialState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TrialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

struct TrialInner {
    state: TrialState,
    jobs: Vec<Arc<Job>>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

/// A named parameter set owning one or more jobs.
///
/// Trials are owned by the scheduler; job state flows back in through
/// [`check_status`](Trial::check_status), which recomputes the aggregate:
/// completed iff every owned job completed, failed as soon as any owned job
/// failed. Insertion order is dependency-relevant for multi-step trials
/// (jobs are registered in topological step order).
pub struct Trial {
    id: TrialId,
    params: ParamMap,
    created_at: DateTime<Utc>,
    executor: Option<StepExecutor>,
    inner: Mutex<TrialInner>,
}

impl Trial {
    pub fn new(id: TrialId, params: ParamMap) -> Self {
        Self {
            id,
            params,
            created_at: Utc::now(),
            executor: None,
            inner: Mutex::new(TrialInner {
                state: TrialState::Created,
                jobs: Vec::new(),
                started_at: None,
                ended_at: None,
            }),
        }
    }

    /// Create a multi-step trial from an instantiated step executor.
    ///
    /// The executor's jobs become the trial's owned jobs, in topological
    /// step order.
    pub fn with_executor(id: TrialId, params: ParamMap, executor: StepExecutor) -> Self {
        let jobs = executor.jobs();
        Self {
            id,
            params,
            created_at: Utc::now(),
            executor: Some(executor),
            inner: Mutex::new(TrialInner {
                state: TrialState::Created,
                jobs,
                started_at: None,
                ended_at: None,
            }),
        }
    }

    pub fn id(&self) -> TrialId {
        self.id
    }

    /// The trial's parameterization. Immutable after creation.
    pub fn params(&self) -> &ParamMap {
        &self.params
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().ended_at
    }

    pub fn state(&self) -> TrialState {
        self.inner.lock().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// The owned jobs, in insertion order.
    pub fn jobs(&self) -> Vec<Arc<Job>> {
        self.inner.lock().jobs.clone()
    }

    /// Append a job. Only legal while the trial has not been dispatched.
    pub fn add_job(&self, job: Arc<Job>) -> Result<()> {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, TrialState::Created | TrialState::Queued) {
            return Err(Error::TrialSealed(self.id));
        }
        inner.jobs.push(job);
        Ok(())
    }

    /// Mark the trial staged for dispatch (used by batch submission).
    pub fn mark_queued(&self) {
        let mut inner = self.inner.lock();
        if inner.state == TrialState::Created {
            inner.state = TrialState::Queued;
        }
    }

    /// Dispatch every owned job.
    ///
    /// Multi-step trials dispatch through the step executor, which holds
    /// back steps whose dependencies are not yet satisfied. Submission
    /// errors are recorded on the affected job rather than thrown: the
    /// aggregate rule is the failure-surfacing mechanism.
    pub async fn run(&self) -> Result<()> {
        let jobs = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return Ok(());
            }
            inner.state = TrialState::Running;
            inner.started_at = Some(Utc::now());
            inner.jobs.clone()
        };
        tracing::info!(trial = %self.id, jobs = jobs.len(), "running trial");

        if let Some(executor) = &self.executor {
            executor.dispatch_ready().await?;
        } else {
            for job in &jobs {
                if let Err(err) = job.run().await {
                    job.fail(err.to_string());
                }
            }
        }
        Ok(())
    }

    /// Poll owned jobs, advance the step executor, and recompute the
    /// aggregate state. Idempotent; safe to call repeatedly.
    pub async fn check_status(&self) -> TrialState {
        let (state, jobs) = {
            let inner = self.inner.lock();
            (inner.state, inner.jobs.clone())
        };
        if state.is_terminal() {
            return state;
        }

        for job in &jobs {
            if let Err(err) = job.poll().await {
                tracing::warn!(trial = %self.id, job = %job.id(), error = %err, "status poll failed");
            }
        }

        if let Some(executor) = &self.executor {
            if let Err(err) = executor.dispatch_ready().await {
                // Binding failures have already been recorded on the
                // affected jobs; the aggregate below picks them up.
                tracing::warn!(trial = %self.id, error = %err, "step dispatch failed");
            }
        }

        self.refresh_state()
    }

    /// Recompute the aggregate state from owned job states alone.
    pub fn refresh_state(&self) -> TrialState {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return inner.state;
        }

        let jobs = &inner.jobs;
        let any_failed = jobs.iter().any(|j| j.has_failed());
        let all_completed = !jobs.is_empty() && jobs.iter().all(|j| j.is_completed());
        let all_terminal = !jobs.is_empty() && jobs.iter().all(|j| j.is_terminal());

        let next = if any_failed {
            TrialState::Failed
        } else if all_completed {
            TrialState::Completed
        } else if all_terminal {
            // No failures, not all completed: the remainder were cancelled.
            TrialState::Cancelled
        } else {
            inner.state
        };

        if next != inner.state {
            tracing::info!(trial = %self.id, state = %next, "trial state changed");
            inner.state = next;
            if next.is_terminal() && inner.ended_at.is_none() {
                inner.ended_at = Some(Utc::now());
            }
        }
        inner.state
    }

    /// The aggregated result map.
    ///
    /// Single-step trials return the sole job's result; multi-step trials
    /// return the designated final step's result. Anything but a completed
    /// trial has no usable results.
    pub fn get_results(&self) -> Result<ResultMap> {
        if self.state() != TrialState::Completed {
            return Err(Error::TrialFailed(self.id));
        }

        if let Some(executor) = &self.executor {
            return executor
                .final_results()
                .ok_or(Error::TrialFailed(self.id));
        }

        let jobs = self.jobs();
        let mut merged = ResultMap::new();
        for job in &jobs {
            if let Some(result) = job.result() {
                merged.extend(result);
            }
        }
        Ok(merged)
    }

    /// Cancel every non-terminal owned job via its runner, then mark the
    /// trial cancelled. Terminal jobs are left untouched.
    pub async fn cancel(&self) {
        let jobs = self.jobs();
        for job in &jobs {
            if let Err(err) = job.cancel().await {
                tracing::warn!(trial = %self.id, job = %job.id(), error = %err, "cancel failed");
            }
        }
        let mut inner = self.inner.lock();
        if !inner.state.is_terminal() {
            inner.state = TrialState::Cancelled;
            inner.ended_at = Some(Utc::now());
        }
    }
}

impl fmt::Debug for Trial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trial")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("job_count", &self.inner.lock().jobs.len())
            .field("multi_step", &self.executor.is_some())
            .finish_non_exhaustive()
    }
}
