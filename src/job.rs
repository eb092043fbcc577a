use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::params::{ArgMap, ArgValue, ResultMap, SliceKey};
use crate::runner::Runner;

/// Unique job identifier.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job lifecycle states.
///
/// Transitions are monotonic: `Created → Queued → Running` and then one of
/// the three terminal states. Once terminal, a job never changes state again.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum JobState {
    Created,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobState {
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

/// An in-process objective callable.
///
/// The function receives the job's bound invocation arguments and returns a
/// metric map, or an error string captured verbatim into the job's error
/// field.
pub type ObjectiveFn =
    Arc<dyn Fn(&ArgMap) -> std::result::Result<ResultMap, String> + Send + Sync>;

/// What a job executes.
#[derive(Clone)]
pub enum JobPayload {
    /// An in-process function. The name is the payload's portable identity:
    /// remote backends re-resolve it against the shipped user code instead
    /// of serializing the callable itself.
    Function { name: String, func: ObjectiveFn },
    /// A shell or interpreter script invoked as a subprocess.
    Script { path: PathBuf },
    /// A container image, optionally with an explicit command.
    Container {
        image: String,
        command: Option<String>,
    },
}

impl JobPayload {
    /// Short kind label used in logs and submission names.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Function { .. } => "function",
            Self::Script { .. } => "script",
            Self::Container { .. } => "container",
        }
    }
}

impl fmt::Debug for JobPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function { name, .. } => {
                f.debug_struct("Function").field("name", name).finish()
            }
            Self::Script { path } => {
                f.debug_struct("Script").field("path", path).finish()
            }
            Self::Container { image, command } => f
                .debug_struct("Container")
                .field("image", image)
                .field("command", command)
                .finish(),
        }
    }
}

/// Opaque reference to a dataset materialized by a backend.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DatasetRef(pub String);

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Declaration that a job materializes its output as a backend dataset
/// instead of (or in addition to) an in-process result map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputDataset {
    /// Dataset name template; the backend resolves the final reference.
    pub dataset: String,
    /// Output file name registered into the dataset.
    pub file: String,
    /// Total events to process (grid backends split work by events).
    pub num_events: u64,
    /// Events per backend task.
    pub num_events_per_task: u64,
}

impl OutputDataset {
    pub fn new(dataset: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            file: file.into(),
            num_events: 1,
            num_events_per_task: 1,
        }
    }

    pub fn with_events(mut self, num_events: u64, per_task: u64) -> Self {
        self.num_events = num_events;
        self.num_events_per_task = per_task;
        self
    }
}

#[derive(Default)]
struct JobLifecycle {
    state: JobState,
    args: ArgMap,
    result: Option<ResultMap>,
    error: Option<String>,
    dataset_ref: Option<DatasetRef>,
    input_datasets: BTreeMap<String, DatasetRef>,
    runner: Option<Arc<dyn Runner>>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

impl Default for JobState {
    fn default() -> Self {
        Self::Created
    }
}

/// A unit of work plus its lifecycle state.
///
/// Jobs are created by a trial (or by the step-graph executor), shared as
/// `Arc<Job>` between the owning trial and the assigned runner, and mutated
/// through interior state: the runner applies backend-observed transitions,
/// the trial reads them back. State locks are never held across awaits.
pub struct Job {
    id: JobId,
    payload: JobPayload,
    env_vars: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
    output_files: Vec<String>,
    slice: Option<SliceKey>,
    propagation_key: String,
    return_results: bool,
    output_dataset: Option<OutputDataset>,
    created_at: DateTime<Utc>,
    lifecycle: Mutex<JobLifecycle>,
}

impl Job {
    fn new(payload: JobPayload, args: ArgMap) -> Self {
        Self {
            id: JobId::new(),
            payload,
            env_vars: BTreeMap::new(),
            working_dir: None,
            output_files: Vec::new(),
            slice: None,
            propagation_key: "parent_result".to_string(),
            return_results: true,
            output_dataset: None,
            created_at: Utc::now(),
            lifecycle: Mutex::new(JobLifecycle {
                args,
                ..JobLifecycle::default()
            }),
        }
    }

    /// Create a function job from a named in-process objective.
    pub fn function(
        name: impl Into<String>,
        func: ObjectiveFn,
        args: ArgMap,
    ) -> Self {
        Self::new(
            JobPayload::Function {
                name: name.into(),
                func,
            },
            args,
        )
    }

    /// Create a script job.
    pub fn script(path: impl Into<PathBuf>, args: ArgMap) -> Self {
        Self::new(JobPayload::Script { path: path.into() }, args)
    }

    /// Create a container job.
    pub fn container(
        image: impl Into<String>,
        command: Option<String>,
        args: ArgMap,
    ) -> Self {
        Self::new(
            JobPayload::Container {
                image: image.into(),
                command,
            },
            args,
        )
    }

    pub fn with_env_var(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Declare output files collected into the result map after completion.
    pub fn with_output_files(mut self, files: Vec<String>) -> Self {
        self.output_files = files;
        self
    }

    /// Tag this job with the global-parameter slice it was replicated for.
    ///
    /// The slice's values are folded into the invocation arguments.
    pub fn with_slice(mut self, slice: SliceKey) -> Self {
        for (name, value) in slice.entries() {
            self.lifecycle
                .get_mut()
                .args
                .insert(name.clone(), ArgValue::Scalar(value.clone()));
        }
        self.slice = Some(slice);
        self
    }

    /// Override the argument name parent results are injected under.
    pub fn with_propagation_key(mut self, key: impl Into<String>) -> Self {
        self.propagation_key = key.into();
        self
    }

    /// When false the runner never fetches an in-process return value; the
    /// job's downstream effect is its registered dataset.
    pub fn with_return_results(mut self, yes: bool) -> Self {
        self.return_results = yes;
        self
    }

    pub fn with_output_dataset(mut self, output: OutputDataset) -> Self {
        self.output_dataset = Some(output);
        self
    }

    pub fn with_input_dataset(
        mut self,
        name: impl Into<String>,
        dataset: DatasetRef,
    ) -> Self {
        self.lifecycle
            .get_mut()
            .input_datasets
            .insert(name.into(), dataset);
        self
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn payload(&self) -> &JobPayload {
        &self.payload
    }

    pub fn env_vars(&self) -> &BTreeMap<String, String> {
        &self.env_vars
    }

    pub fn working_dir(&self) -> Option<&PathBuf> {
        self.working_dir.as_ref()
    }

    pub fn output_files(&self) -> &[String] {
        &self.output_files
    }

    pub fn slice(&self) -> Option<&SliceKey> {
        self.slice.as_ref()
    }

    pub fn propagation_key(&self) -> &str {
        &self.propagation_key
    }

    pub fn return_results(&self) -> bool {
        self.return_results
    }

    pub fn output_dataset(&self) -> Option<&OutputDataset> {
        self.output_dataset.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.lifecycle.lock().started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.lifecycle.lock().ended_at
    }

    pub fn state(&self) -> JobState {
        self.lifecycle.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == JobState::Running
    }

    pub fn is_completed(&self) -> bool {
        self.state() == JobState::Completed
    }

    pub fn has_failed(&self) -> bool {
        self.state() == JobState::Failed
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Snapshot of the current invocation arguments.
    pub fn args(&self) -> ArgMap {
        self.lifecycle.lock().args.clone()
    }

    pub fn result(&self) -> Option<ResultMap> {
        self.lifecycle.lock().result.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.lifecycle.lock().error.clone()
    }

    pub fn dataset_ref(&self) -> Option<DatasetRef> {
        self.lifecycle.lock().dataset_ref.clone()
    }

    pub fn input_datasets(&self) -> BTreeMap<String, DatasetRef> {
        self.lifecycle.lock().input_datasets.clone()
    }

    pub fn runner(&self) -> Option<Arc<dyn Runner>> {
        self.lifecycle.lock().runner.clone()
    }

    /// Bind the runner that will execute this job.
    pub fn set_runner(&self, runner: Arc<dyn Runner>) {
        self.lifecycle.lock().runner = Some(runner);
    }

    /// Record the dataset reference the backend registered at submission.
    pub fn set_dataset_ref(&self, dataset: DatasetRef) {
        self.lifecycle.lock().dataset_ref = Some(dataset);
    }

    /// Attach an input dataset resolved from an upstream step.
    pub fn add_input_dataset(&self, name: impl Into<String>, dataset: DatasetRef) {
        self.lifecycle
            .lock()
            .input_datasets
            .insert(name.into(), dataset);
    }

    /// Inject a named value from an upstream step's result into this job's
    /// invocation arguments before submission.
    pub fn set_parent_result(&self, step: &str, key: &str, value: ArgValue) {
        tracing::debug!(
            job = %self.id,
            parent_step = step,
            key,
            "binding parent result into job arguments"
        );
        self.lifecycle.lock().args.insert(key.to_string(), value);
    }

    /// Submit this job through its assigned runner.
    ///
    /// Fails with [`Error::UnboundJob`] if no runner has been set.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let runner = self.runner().ok_or(Error::UnboundJob(self.id))?;
        tracing::info!(job = %self.id, runner = runner.name(), "submitting job");
        self.mark_queued();
        runner.run_job(self).await
    }

    /// Poll the assigned runner for newly observed terminal state.
    ///
    /// A no-op for terminal or never-submitted jobs.
    pub async fn poll(self: &Arc<Self>) -> Result<()> {
        if self.is_terminal() || self.state() == JobState::Created {
            return Ok(());
        }
        match self.runner() {
            Some(runner) => runner.check_job_status(self).await,
            None => Ok(()),
        }
    }

    /// Cancel this job through its runner. Terminal jobs are left untouched.
    pub async fn cancel(self: &Arc<Self>) -> Result<()> {
        if !matches!(self.state(), JobState::Queued | JobState::Running) {
            return Ok(());
        }
        match self.runner() {
            Some(runner) => runner.cancel_job(self).await,
            None => {
                self.mark_cancelled();
                Ok(())
            }
        }
    }

    /// Advance `Created → Queued`. Any other state is left alone.
    pub fn mark_queued(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == JobState::Created {
            lifecycle.state = JobState::Queued;
            true
        } else {
            false
        }
    }

    /// Advance to `Running` from `Created` or `Queued`.
    pub fn mark_running(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if matches!(lifecycle.state, JobState::Created | JobState::Queued) {
            lifecycle.state = JobState::Running;
            lifecycle.started_at = Some(Utc::now());
            true
        } else {
            false
        }
    }

    /// Transition to `Completed` and store the results.
    ///
    /// A no-op if the job is already terminal; states never move backwards.
    pub fn complete(&self, results: ResultMap) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state.is_terminal() {
            return false;
        }
        lifecycle.state = JobState::Completed;
        lifecycle.result = Some(results);
        lifecycle.ended_at = Some(Utc::now());
        tracing::info!(job = %self.id, "job completed");
        true
    }

    /// Transition to `Failed` and store the error verbatim.
    ///
    /// A no-op if the job is already terminal.
    pub fn fail(&self, error: impl Into<String>) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state.is_terminal() {
            return false;
        }
        let error = error.into();
        tracing::warn!(job = %self.id, error = %error, "job failed");
        lifecycle.state = JobState::Failed;
        lifecycle.error = Some(error);
        lifecycle.ended_at = Some(Utc::now());
        true
    }

    /// Transition to `Cancelled`. Only `Queued` and `Running` jobs move;
    /// anything else is a no-op.
    pub fn mark_cancelled(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if matches!(lifecycle.state, JobState::Queued | JobState::Running) {
            lifecycle.state = JobState::Cancelled;
            lifecycle.ended_at = Some(Utc::now());
            true
        } else {
            false
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("payload", &self.payload)
            .field("state", &self.state())
            .field("slice", &self.slice)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{args_from_params, ParamMap, ParamValue};
    use async_trait::async_trait;

    fn noop_objective() -> ObjectiveFn {
        Arc::new(|_args| Ok(ResultMap::new()))
    }

    fn sample_job() -> Job {
        let mut params = ParamMap::new();
        params.insert("x".to_string(), ParamValue::Float(0.5));
        Job::function("objective", noop_objective(), args_from_params(&params))
    }

    struct RecordingRunner;

    #[async_trait]
    impl Runner for RecordingRunner {
        fn name(&self) -> &str {
            "recording"
        }

        async fn run_job(&self, job: &Arc<Job>) -> Result<()> {
            job.mark_running();
            Ok(())
        }

        async fn check_job_status(&self, _job: &Arc<Job>) -> Result<()> {
            Ok(())
        }

        async fn cancel_job(&self, job: &Arc<Job>) -> Result<()> {
            job.mark_cancelled();
            Ok(())
        }
    }

    #[test]
    fn new_job_starts_created() {
        let job = sample_job();
        assert_eq!(job.state(), JobState::Created);
        assert!(!job.is_terminal());
        assert!(job.result().is_none());
    }

    #[tokio::test]
    async fn run_without_runner_is_unbound() {
        let job = Arc::new(sample_job());
        match job.run().await {
            Err(Error::UnboundJob(id)) => assert_eq!(id, job.id()),
            other => panic!("expected UnboundJob, got {other:?}"),
        }
        // The failed submission must not advance the state machine.
        assert_eq!(job.state(), JobState::Created);
    }

    #[tokio::test]
    async fn run_with_runner_advances_state() {
        let job = Arc::new(sample_job());
        job.set_runner(Arc::new(RecordingRunner));
        job.run().await.unwrap();
        assert_eq!(job.state(), JobState::Running);
        assert!(job.started_at().is_some());
    }

    #[test]
    fn terminal_states_are_sticky() {
        let job = sample_job();
        job.mark_queued();
        job.mark_running();

        let mut results = ResultMap::new();
        results.insert("metric".to_string(), ParamValue::Float(1.0));
        assert!(job.complete(results.clone()));
        assert_eq!(job.state(), JobState::Completed);

        // Neither a second complete nor a late fail may change anything.
        assert!(!job.complete(ResultMap::new()));
        assert!(!job.fail("too late"));
        assert_eq!(job.state(), JobState::Completed);
        assert_eq!(job.result(), Some(results));
        assert!(job.error().is_none());
    }

    #[test]
    fn fail_records_error_verbatim() {
        let job = sample_job();
        job.mark_queued();
        assert!(job.fail("backend said: out of memory"));
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(job.error().as_deref(), Some("backend said: out of memory"));
    }

    #[test]
    fn cancel_only_from_queued_or_running() {
        let job = sample_job();
        assert!(!job.mark_cancelled());
        assert_eq!(job.state(), JobState::Created);

        job.mark_queued();
        assert!(job.mark_cancelled());
        assert_eq!(job.state(), JobState::Cancelled);

        // Cancelling a terminal job is a no-op.
        assert!(!job.mark_cancelled());
        assert_eq!(job.state(), JobState::Cancelled);
    }

    #[test]
    fn parent_result_is_injected_into_args() {
        let job = sample_job();
        job.set_parent_result(
            "simulate",
            "xyz",
            ArgValue::Scalar(ParamValue::Float(0.4)),
        );
        let args = job.args();
        assert_eq!(
            args.get("xyz").and_then(ArgValue::as_scalar),
            Some(&ParamValue::Float(0.4))
        );
        // Original parameters stay bound alongside the injected value.
        assert_eq!(
            args.get("x").and_then(ArgValue::as_scalar),
            Some(&ParamValue::Float(0.5))
        );
    }

    #[test]
    fn slice_values_are_folded_into_args() {
        let slice = SliceKey::new(vec![(
            "device".to_string(),
            ParamValue::Text("gpu".into()),
        )]);
        let job = sample_job().with_slice(slice.clone());
        assert_eq!(job.slice(), Some(&slice));
        assert_eq!(
            job.args().get("device").and_then(ArgValue::as_scalar),
            Some(&ParamValue::Text("gpu".into()))
        );
    }
}
