//! Tuna - Trial orchestration for distributed hyperparameter optimization.
//!
//! A crate for running parameterized trials of a user-supplied objective
//! across heterogeneous execution backends (a local process pool, a Slurm
//! batch cluster, a distributed grid workload system) on behalf of an
//! external Bayesian-optimization engine.
//!
//! # Core Concepts
//!
//! - **Job**: The unit of work - a function, script, or container payload
//!   plus its lifecycle state machine. See [`Job`].
//!
//! - **Trial**: A named parameter set owning one or more jobs; its state is
//!   an aggregate of its jobs' states. See [`Trial`].
//!
//! - **Runner**: The polymorphic executor seam. Concrete variants submit,
//!   poll, and cancel jobs on a specific backend; everything above depends
//!   only on the [`Runner`] trait.
//!
//! - **StepGraph**: A validated DAG of named steps, each bound to its own
//!   runner, with result propagation along edges and optional replication
//!   across global-parameter slices. See [`StepGraph`].
//!
//! - **Oracle**: The external parameter-suggestion engine, reduced to a
//!   four-operation contract. See [`Oracle`].
//!
//! - **Scheduler**: The top-level orchestrator driving the generate → run →
//!   monitor → report loop. See [`ExperimentScheduler`].
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tuna::*;
//!
//! let runner = Arc::new(LocalPoolRunner::new(LocalPoolConfig::default()));
//! let mut scheduler = ExperimentScheduler::new(
//!     Box::new(my_oracle),
//!     runner,
//!     SchedulerConfig::default().with_objective("sharpness", ObjectiveDirection::Minimize),
//! );
//! scheduler.set_objective_function("evaluate", Arc::new(evaluate));
//! let outcome = scheduler.run_optimization(20, None).await?;
//! println!("best parameters: {:?}", outcome.best.params);
//! ```

/// Error taxonomy for the orchestrator.
///
/// The `error` module defines [`Error`] and the crate-wide [`Result`]
/// alias. Setup-time errors propagate; execution failures surface as job
/// and trial state instead.
pub mod error;

/// Experiment lifecycle events.
///
/// The `events` module provides [`ExperimentEvent`] and the in-process
/// broadcast [`EventBus`] the scheduler publishes on.
pub mod events;

/// Job definitions and the job state machine.
///
/// The `job` module defines [`Job`], [`JobId`], [`JobState`],
/// [`JobPayload`], and the dataset declarations used by grid backends.
pub mod job;

/// The external parameter-suggestion interface.
///
/// The `oracle` module defines the [`Oracle`] trait, [`Suggestion`], and
/// the [`TrialRecord`] history entries handed to it.
pub mod oracle;

/// Parameter, argument, and result value types.
///
/// The `params` module defines [`ParamValue`], the map aliases, and the
/// deterministic [`GlobalParameterSet`] slice expansion.
pub mod params;

/// The backend-executor seam.
///
/// The `runner` module defines the [`Runner`] trait and the normalized
/// [`BackendStatus`] mapping.
pub mod runner;

/// Concrete runners: local pool, Slurm batch, grid workload.
pub mod runners;

/// Top-level experiment orchestration.
///
/// The `scheduler` module provides [`ExperimentScheduler`],
/// [`SchedulerConfig`], batch submission via
/// [`ExperimentScheduler::batch_trial_context`], and experiment
/// persistence.
pub mod scheduler;

/// Multi-step objectives.
///
/// The `stepgraph` module provides [`StepGraph`] validation and the
/// executor that fans one trial out into a pipeline of dependent jobs.
pub mod stepgraph;

/// Tracing span helpers.
pub mod telemetry;

/// Trial aggregation.
///
/// The `trial` module defines [`Trial`], [`TrialId`], and [`TrialState`].
pub mod trial;

pub use error::{Error, Result};
pub use events::{EventBus, ExperimentEvent};
pub use job::{
    DatasetRef, Job, JobId, JobPayload, JobState, ObjectiveFn, OutputDataset,
};
pub use oracle::{Oracle, Suggestion, TrialRecord};
pub use params::{
    args_from_params, ArgMap, ArgValue, GlobalParameterSet, ParamMap,
    ParamValue, ResultMap, SliceKey,
};
pub use runner::{BackendStatus, Runner};
pub use runners::{
    BatchSystem, ContainerEngine, GridClient, GridConfig, GridRunner,
    LocalPoolConfig, LocalPoolRunner, SlurmCli, SlurmConfig, SlurmRunner,
};
pub use scheduler::{
    ExperimentScheduler, ObjectiveDirection, OptimizationOutcome,
    SchedulerConfig, TrialBatch,
};
pub use stepgraph::{
    DependencyKind, MergePolicy, StepDependency, StepExecutor, StepGraph,
    StepGraphBuilder, StepSpec,
};
pub use trial::{Trial, TrialId, TrialState};
