use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use crate::error::{Error, Result};
use crate::events::{EventBus, ExperimentEvent};
use crate::job::{Job, ObjectiveFn};
use crate::oracle::{Oracle, Suggestion, TrialRecord};
use crate::params::{args_from_params, ParamMap, ParamValue, ResultMap};
use crate::runner::Runner;
use crate::stepgraph::StepGraph;
use crate::telemetry;
use crate::trial::{Trial, TrialId, TrialState};

/// Whether the objective metric is maximized or minimized when picking the
/// best trial.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ObjectiveDirection {
    Maximize,
    Minimize,
}

impl Default for ObjectiveDirection {
    fn default() -> Self {
        Self::Maximize
    }
}

impl ObjectiveDirection {
    fn improves(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Maximize => candidate > incumbent,
            Self::Minimize => candidate < incumbent,
        }
    }
}

/// Configuration for the experiment scheduler.
///
/// Threaded explicitly through construction; there is no ambient
/// process-wide state.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Sleep between monitoring passes.
    pub monitoring_interval: Duration,
    /// Upper bound on how long a single trial is monitored.
    pub max_trial_monitoring_time: Duration,
    /// Root directory for per-trial job working directories.
    pub job_output_dir: PathBuf,
    /// Remove a trial's working directories once it is reported.
    pub cleanup_after_completion: bool,
    /// Block in `run_trial` until the trial is terminal.
    pub synchronous: bool,
    /// Concurrency bound for asynchronous optimization.
    pub max_concurrent_trials: usize,
    /// Metric the optimization ranks trials by.
    pub objective_metric: String,
    pub direction: ObjectiveDirection,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            monitoring_interval: Duration::from_secs(10),
            max_trial_monitoring_time: Duration::from_secs(86_400),
            job_output_dir: std::env::temp_dir().join("tuna-experiments"),
            cleanup_after_completion: false,
            synchronous: false,
            max_concurrent_trials: 4,
            objective_metric: "objective".to_string(),
            direction: ObjectiveDirection::Maximize,
        }
    }
}

impl SchedulerConfig {
    pub fn with_monitoring_interval(mut self, interval: Duration) -> Self {
        self.monitoring_interval = interval;
        self
    }

    pub fn with_max_trial_monitoring_time(mut self, limit: Duration) -> Self {
        self.max_trial_monitoring_time = limit;
        self
    }

    pub fn with_job_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.job_output_dir = dir.into();
        self
    }

    pub fn with_cleanup_after_completion(mut self, yes: bool) -> Self {
        self.cleanup_after_completion = yes;
        self
    }

    pub fn synchronous(mut self) -> Self {
        self.synchronous = true;
        self
    }

    pub fn with_max_concurrent_trials(mut self, bound: usize) -> Self {
        self.max_concurrent_trials = bound.max(1);
        self
    }

    pub fn with_objective(
        mut self,
        metric: impl Into<String>,
        direction: ObjectiveDirection,
    ) -> Self {
        self.objective_metric = metric.into();
        self.direction = direction;
        self
    }
}

/// The objective every trial evaluates.
enum Objective {
    Unset,
    Function { name: String, func: ObjectiveFn },
    Script { path: PathBuf },
    Container {
        image: String,
        command: Option<String>,
    },
    Steps(StepGraph),
}

/// Outcome of an optimization run.
#[derive(Clone, Debug)]
pub struct OptimizationOutcome {
    /// The best completed trial by the configured metric and direction.
    pub best: TrialRecord,
    pub completed: usize,
    pub failed: usize,
}

/// Top-level orchestrator driving trial generation, dispatch, monitoring,
/// and reporting against an external parameter-suggestion oracle.
pub struct ExperimentScheduler {
    config: SchedulerConfig,
    oracle: Mutex<Box<dyn Oracle>>,
    runner: Arc<dyn Runner>,
    objective: Objective,
    trials: Mutex<BTreeMap<TrialId, Arc<Trial>>>,
    history: Mutex<Vec<TrialRecord>>,
    reported: Mutex<HashSet<TrialId>>,
    next_index: AtomicU64,
    events: EventBus,
}

impl ExperimentScheduler {
    pub fn new(
        oracle: Box<dyn Oracle>,
        runner: Arc<dyn Runner>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            config,
            oracle: Mutex::new(oracle),
            runner,
            objective: Objective::Unset,
            trials: Mutex::new(BTreeMap::new()),
            history: Mutex::new(Vec::new()),
            reported: Mutex::new(HashSet::new()),
            next_index: AtomicU64::new(0),
            events: EventBus::default(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Subscribe to experiment lifecycle events.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Use a named in-process function as the objective.
    pub fn set_objective_function(
        &mut self,
        name: impl Into<String>,
        func: ObjectiveFn,
    ) {
        self.objective = Objective::Function {
            name: name.into(),
            func,
        };
    }

    /// Use a script as the objective. The path must exist.
    pub fn set_script_objective(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        if !path.exists() {
            return Err(Error::Config(format!(
                "script path '{}' does not exist",
                path.display()
            )));
        }
        self.objective = Objective::Script { path };
        Ok(())
    }

    /// Use a container as the objective.
    pub fn set_container_objective(
        &mut self,
        image: impl Into<String>,
        command: Option<String>,
    ) {
        self.objective = Objective::Container {
            image: image.into(),
            command,
        };
    }

    /// Use a multi-step graph as the objective.
    pub fn set_step_graph(&mut self, graph: StepGraph) {
        self.objective = Objective::Steps(graph);
    }

    /// Look up a trial by id.
    pub fn trial(&self, id: TrialId) -> Option<Arc<Trial>> {
        self.trials.lock().get(&id).cloned()
    }

    /// Snapshot of all registered trials.
    pub fn trials(&self) -> Vec<Arc<Trial>> {
        self.trials.lock().values().cloned().collect()
    }

    /// Optimization history: one record per reported trial.
    pub fn history(&self) -> Vec<TrialRecord> {
        self.history.lock().clone()
    }

    fn create_trial(&self, params: ParamMap) -> Result<TrialId> {
        let id = TrialId(self.next_index.fetch_add(1, Ordering::SeqCst));
        let trial_dir = self.config.job_output_dir.join(id.to_string());
        std::fs::create_dir_all(&trial_dir)?;

        let trial = match &self.objective {
            Objective::Unset => {
                return Err(Error::Config("objective not set".to_string()))
            }
            Objective::Function { name, func } => {
                let trial = Trial::new(id, params.clone());
                let job = Job::function(
                    name.clone(),
                    func.clone(),
                    args_from_params(&params),
                )
                .with_working_dir(&trial_dir);
                let job = Arc::new(job);
                job.set_runner(self.runner.clone());
                trial.add_job(job)?;
                trial
            }
            Objective::Script { path } => {
                let trial = Trial::new(id, params.clone());
                let job = Job::script(path.clone(), args_from_params(&params))
                    .with_working_dir(&trial_dir)
                    .with_output_files(vec!["result.json".to_string()]);
                let job = Arc::new(job);
                job.set_runner(self.runner.clone());
                trial.add_job(job)?;
                trial
            }
            Objective::Container { image, command } => {
                let trial = Trial::new(id, params.clone());
                let job = Job::container(
                    image.clone(),
                    command.clone(),
                    args_from_params(&params),
                )
                .with_working_dir(&trial_dir)
                .with_output_files(vec!["result.json".to_string()]);
                let job = Arc::new(job);
                job.set_runner(self.runner.clone());
                trial.add_job(job)?;
                trial
            }
            Objective::Steps(graph) => {
                let executor =
                    graph.instantiate(id, &params, Some(trial_dir.as_path()));
                Trial::with_executor(id, params.clone(), executor)
            }
        };

        let trial = Arc::new(trial);
        self.trials.lock().insert(id, trial);
        self.events.publish(ExperimentEvent::TrialCreated { trial: id });
        tracing::info!(trial = %id, "created trial");
        Ok(id)
    }

    /// Ask the oracle for a new parameterization and wrap it in a trial.
    ///
    /// Returns `None` once the oracle reports the search exhausted.
    pub fn get_next_trial(&self) -> Result<Option<TrialId>> {
        let history = self.history.lock().clone();
        let suggestion = self
            .oracle
            .lock()
            .suggest(&history)
            .map_err(|err| Error::Oracle(err.to_string()))?;
        match suggestion {
            Suggestion::Exhausted => {
                tracing::info!("oracle reports search exhausted");
                Ok(None)
            }
            Suggestion::Parameters(params) => {
                Ok(Some(self.create_trial(params)?))
            }
        }
    }

    /// Dispatch a trial. In synchronous mode this blocks (polling and
    /// sleeping) until the trial is terminal.
    pub async fn run_trial(&self, id: TrialId) -> Result<()> {
        let trial = self.trial(id).ok_or(Error::UnknownTrial(id))?;

        let span = telemetry::trial_dispatch_span(id.to_string());
        trial.run().instrument(span).await?;
        self.events
            .publish(ExperimentEvent::TrialDispatched { trial: id });

        if self.config.synchronous {
            self.wait_for_trial(&trial).await;
        }
        Ok(())
    }

    async fn wait_for_trial(&self, trial: &Arc<Trial>) {
        let started = tokio::time::Instant::now();
        loop {
            let state = trial.check_status().await;
            if state.is_terminal() {
                break;
            }
            if started.elapsed() > self.config.max_trial_monitoring_time {
                tracing::warn!(
                    trial = %trial.id(),
                    "trial monitoring timed out after {:?}",
                    self.config.max_trial_monitoring_time
                );
                break;
            }
            tokio::time::sleep(self.config.monitoring_interval).await;
        }
    }

    /// One polling pass over every unreported trial.
    ///
    /// Newly completed trials are reported to the oracle; failures and
    /// cancellations are recorded in the history with no metrics.
    pub async fn monitor_trials(&self) -> Result<()> {
        let trials: Vec<(TrialId, Arc<Trial>)> = {
            let guard = self.trials.lock();
            guard.iter().map(|(id, t)| (*id, t.clone())).collect()
        };
        let outstanding = trials
            .iter()
            .filter(|(_, t)| !t.is_terminal())
            .count();
        let span = telemetry::monitor_pass_span(outstanding);

        async {
            for (id, trial) in trials {
                if self.reported.lock().contains(&id) {
                    continue;
                }
                let previous = trial.state();
                let state = if previous.is_terminal() {
                    previous
                } else {
                    trial.check_status().await
                };
                if state != previous {
                    self.events.publish(ExperimentEvent::TrialStateChanged {
                        trial: id,
                        state,
                    });
                }
                match state {
                    TrialState::Completed => {
                        if let Err(err) = self.complete_trial(id, None).await {
                            tracing::warn!(trial = %id, error = %err, "failed to report trial");
                        }
                    }
                    TrialState::Failed | TrialState::Cancelled => {
                        self.record_unusable(id, state);
                    }
                    _ => {}
                }
            }
        }
        .instrument(span)
        .await;
        Ok(())
    }

    fn record_unusable(&self, id: TrialId, state: TrialState) {
        if !self.reported.lock().insert(id) {
            return;
        }
        if let Some(trial) = self.trial(id) {
            self.history.lock().push(TrialRecord {
                id,
                params: trial.params().clone(),
                metrics: None,
                state,
            });
        }
    }

    /// Report a finished trial's metrics back to the oracle.
    ///
    /// When `raw_data` is `None` the trial's aggregated results are used.
    /// Reporting is idempotent per trial.
    pub async fn complete_trial(
        &self,
        id: TrialId,
        raw_data: Option<ResultMap>,
    ) -> Result<()> {
        if self.reported.lock().contains(&id) {
            return Ok(());
        }
        let trial = self.trial(id).ok_or(Error::UnknownTrial(id))?;
        let metrics = match raw_data {
            Some(data) => data,
            None => trial.get_results()?,
        };

        self.oracle
            .lock()
            .report(id, &metrics)
            .map_err(|err| Error::Oracle(err.to_string()))?;
        self.reported.lock().insert(id);
        self.history.lock().push(TrialRecord {
            id,
            params: trial.params().clone(),
            metrics: Some(metrics),
            state: trial.state(),
        });
        tracing::info!(trial = %id, "reported trial to oracle");

        if self.config.cleanup_after_completion {
            let trial_dir = self.config.job_output_dir.join(id.to_string());
            if let Err(err) = tokio::fs::remove_dir_all(&trial_dir).await {
                tracing::warn!(trial = %id, error = %err, "cleanup failed");
            }
        }
        Ok(())
    }

    /// Cancel a trial: every non-terminal owned job is cancelled via its
    /// runner. There is no cascading cancellation across sibling trials.
    pub async fn cancel_trial(&self, id: TrialId) -> Result<()> {
        let trial = self.trial(id).ok_or(Error::UnknownTrial(id))?;
        trial.cancel().await;
        self.events.publish(ExperimentEvent::TrialStateChanged {
            trial: id,
            state: trial.state(),
        });
        self.record_unusable(id, trial.state());
        Ok(())
    }

    /// Drive the generate → run → monitor → report loop.
    ///
    /// Synchronous mode runs one trial at a time to completion.
    /// Asynchronous mode keeps up to `max_concurrent_trials` outstanding
    /// and interleaves monitoring passes. Returns the best completed trial;
    /// if every trial failed there is no usable result and
    /// [`Error::NoUsableResult`] is returned.
    pub async fn run_optimization(
        &self,
        max_trials: usize,
        timeout: Option<Duration>,
    ) -> Result<OptimizationOutcome> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let expired =
            |deadline: Option<tokio::time::Instant>| match deadline {
                Some(d) => tokio::time::Instant::now() >= d,
                None => false,
            };

        let mut generated = 0usize;
        let mut exhausted = false;

        while generated < max_trials && !exhausted && !expired(deadline) {
            if !self.config.synchronous {
                let outstanding = self
                    .trials()
                    .iter()
                    .filter(|t| !t.is_terminal())
                    .count();
                if outstanding >= self.config.max_concurrent_trials {
                    self.monitor_trials().await?;
                    tokio::time::sleep(self.config.monitoring_interval).await;
                    continue;
                }
            }

            match self.get_next_trial()? {
                None => exhausted = true,
                Some(id) => {
                    generated += 1;
                    self.run_trial(id).await?;
                    self.monitor_trials().await?;
                }
            }
        }

        // Drain whatever is still in flight.
        loop {
            self.monitor_trials().await?;
            let outstanding = self
                .trials()
                .iter()
                .filter(|t| !t.is_terminal())
                .count();
            if outstanding == 0 {
                break;
            }
            if expired(deadline) {
                tracing::warn!(
                    outstanding,
                    "optimization timed out; cancelling outstanding trials"
                );
                for trial in self.trials() {
                    if !trial.is_terminal() {
                        let _ = self.cancel_trial(trial.id()).await;
                    }
                }
                self.monitor_trials().await?;
                break;
            }
            tokio::time::sleep(self.config.monitoring_interval).await;
        }

        self.best_outcome()
    }

    fn metric_value(&self, metrics: &ResultMap) -> Option<f64> {
        match metrics.get(&self.config.objective_metric) {
            Some(ParamValue::Float(v)) => Some(*v),
            Some(ParamValue::Int(v)) => Some(*v as f64),
            _ => None,
        }
    }

    fn best_outcome(&self) -> Result<OptimizationOutcome> {
        let history = self.history.lock().clone();
        let completed = history
            .iter()
            .filter(|r| r.state == TrialState::Completed)
            .count();
        let failed = history.len() - completed;

        let mut best: Option<(f64, TrialRecord)> = None;
        for record in history {
            let Some(metrics) = &record.metrics else { continue };
            let Some(value) = self.metric_value(metrics) else {
                continue;
            };
            let replace = match &best {
                None => true,
                Some((incumbent, _)) => {
                    self.config.direction.improves(value, *incumbent)
                }
            };
            if replace {
                best = Some((value, record));
            }
        }

        match best {
            Some((_, record)) => Ok(OptimizationOutcome {
                best: record,
                completed,
                failed,
            }),
            None => Err(Error::NoUsableResult),
        }
    }

    /// Scoped batch submission.
    ///
    /// Trials added through the builder are created immediately but held
    /// back; when the closure returns `Ok`, the whole batch is dispatched
    /// as one unit. When it returns `Err`, the staged trials are discarded
    /// and nothing is submitted. Dispatched trials still run and terminate
    /// independently.
    pub async fn batch_trial_context<F, R>(
        &self,
        build: F,
    ) -> Result<(R, Vec<TrialId>)>
    where
        F: FnOnce(&mut TrialBatch<'_>) -> Result<R>,
    {
        let mut batch = TrialBatch {
            scheduler: self,
            staged: Vec::new(),
        };
        match build(&mut batch) {
            Ok(value) => {
                let staged = batch.staged;
                for id in &staged {
                    self.run_trial(*id).await?;
                }
                Ok((value, staged))
            }
            Err(err) => {
                let mut trials = self.trials.lock();
                for id in &batch.staged {
                    trials.remove(id);
                }
                Err(err)
            }
        }
    }

    /// Persist the oracle's serialized state. The blob is opaque to the
    /// orchestrator.
    pub async fn save_experiment(&self, path: impl AsRef<Path>) -> Result<()> {
        let blob = {
            self.oracle
                .lock()
                .serialize()
                .map_err(|err| Error::Oracle(err.to_string()))?
        };
        tokio::fs::write(path.as_ref(), blob).await?;
        tracing::info!(path = %path.as_ref().display(), "saved experiment");
        Ok(())
    }

    /// Restore the oracle's state from a previously saved blob.
    pub async fn load_experiment(&self, path: impl AsRef<Path>) -> Result<()> {
        let blob = tokio::fs::read(path.as_ref()).await?;
        self.oracle
            .lock()
            .restore(&blob)
            .map_err(|err| Error::Oracle(err.to_string()))?;
        tracing::info!(path = %path.as_ref().display(), "loaded experiment");
        Ok(())
    }
}

/// Builder handed to [`ExperimentScheduler::batch_trial_context`].
pub struct TrialBatch<'a> {
    scheduler: &'a ExperimentScheduler,
    staged: Vec<TrialId>,
}

impl TrialBatch<'_> {
    /// Stage a trial with explicit parameters. The trial is created but
    /// not dispatched until the batch scope exits successfully.
    pub fn add_trial(&mut self, params: ParamMap) -> Result<TrialId> {
        let id = self.scheduler.create_trial(params)?;
        if let Some(trial) = self.scheduler.trial(id) {
            trial.mark_queued();
        }
        self.staged.push(id);
        Ok(id)
    }

    /// Ids staged so far.
    pub fn staged(&self) -> &[TrialId] {
        &self.staged
    }
}
