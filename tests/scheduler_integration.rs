//! Integration tests for the experiment scheduler.
//!
//! Drives the full generate → run → monitor → report loop against the local
//! pool runner with a deterministic grid-search oracle, and exercises batch
//! submission, experiment persistence, and multi-step objectives end to end.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use tuna::{
    ArgMap, ArgValue, Error, ExperimentScheduler, JobPayload,
    JobState, LocalPoolConfig, LocalPoolRunner, ObjectiveDirection, ObjectiveFn,
    Oracle, ParamMap, ParamValue, ResultMap, Runner, SchedulerConfig,
    StepDependency, StepGraph, StepSpec, Suggestion, TrialId, TrialRecord,
    TrialState,
};

fn scratch() -> PathBuf {
    std::env::temp_dir()
        .join("tuna-scheduler-tests")
        .join(uuid::Uuid::new_v4().to_string())
}

/// Deterministic oracle walking a fixed list of parameterizations.
///
/// Serializes as its cursor position, so a restored oracle resumes the walk
/// exactly where the saved one left off.
struct GridOracle {
    space: Vec<ParamMap>,
    cursor: usize,
}

impl GridOracle {
    fn over(values: &[f64]) -> Self {
        let space = values
            .iter()
            .map(|v| {
                let mut params = ParamMap::new();
                params.insert("x".to_string(), ParamValue::Float(*v));
                params
            })
            .collect();
        Self { space, cursor: 0 }
    }
}

impl Oracle for GridOracle {
    fn suggest(&mut self, _history: &[TrialRecord]) -> tuna::Result<Suggestion> {
        match self.space.get(self.cursor) {
            Some(params) => {
                self.cursor += 1;
                Ok(Suggestion::Parameters(params.clone()))
            }
            None => Ok(Suggestion::Exhausted),
        }
    }

    fn report(
        &mut self,
        _trial: TrialId,
        _metrics: &ResultMap,
    ) -> tuna::Result<()> {
        Ok(())
    }

    fn serialize(&self) -> tuna::Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.cursor)?)
    }

    fn restore(&mut self, blob: &[u8]) -> tuna::Result<()> {
        self.cursor = serde_json::from_slice(blob)?;
        Ok(())
    }
}

/// Objective minimized at x = 0.3.
fn parabola() -> ObjectiveFn {
    Arc::new(|args: &ArgMap| {
        let x = match args.get("x").and_then(ArgValue::as_scalar) {
            Some(ParamValue::Float(v)) => *v,
            other => return Err(format!("missing parameter x: {other:?}")),
        };
        let mut results = ResultMap::new();
        results.insert(
            "objective".to_string(),
            ParamValue::Float((x - 0.3) * (x - 0.3)),
        );
        Ok(results)
    })
}

fn local_pool() -> Arc<LocalPoolRunner> {
    Arc::new(LocalPoolRunner::new(
        LocalPoolConfig::default()
            .with_max_workers(2)
            .with_scratch_dir(scratch()),
    ))
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig::default()
        .with_monitoring_interval(Duration::from_millis(5))
        .with_job_output_dir(scratch())
        .with_objective("objective", ObjectiveDirection::Minimize)
}

#[tokio::test]
async fn synchronous_optimization_finds_the_best_trial() {
    let oracle = GridOracle::over(&[0.0, 0.3, 0.9]);
    let mut scheduler = ExperimentScheduler::new(
        Box::new(oracle),
        local_pool(),
        fast_config().synchronous(),
    );
    scheduler.set_objective_function("parabola", parabola());

    let outcome = timeout(
        Duration::from_secs(10),
        scheduler.run_optimization(10, None),
    )
    .await
    .expect("optimization hung")
    .unwrap();

    assert_eq!(outcome.completed, 3);
    assert_eq!(outcome.failed, 0);
    assert_eq!(
        outcome.best.params.get("x"),
        Some(&ParamValue::Float(0.3))
    );
    let metrics = outcome.best.metrics.expect("best trial has metrics");
    assert_eq!(metrics.get("objective"), Some(&ParamValue::Float(0.0)));
}

#[tokio::test]
async fn asynchronous_optimization_interleaves_trials() {
    let oracle = GridOracle::over(&[0.1, 0.2, 0.3, 0.4, 0.5]);
    let mut scheduler = ExperimentScheduler::new(
        Box::new(oracle),
        local_pool(),
        fast_config().with_max_concurrent_trials(2),
    );
    scheduler.set_objective_function("parabola", parabola());

    let outcome = timeout(
        Duration::from_secs(10),
        scheduler.run_optimization(5, None),
    )
    .await
    .expect("optimization hung")
    .unwrap();

    assert_eq!(outcome.completed, 5);
    assert_eq!(
        outcome.best.params.get("x"),
        Some(&ParamValue::Float(0.3))
    );
    // Every trial reached a terminal state before the loop returned.
    assert!(scheduler.trials().iter().all(|t| t.is_terminal()));
}

#[tokio::test]
async fn failed_trials_do_not_hide_the_best_result() {
    let flaky: ObjectiveFn = Arc::new(|args: &ArgMap| {
        let x = match args.get("x").and_then(ArgValue::as_scalar) {
            Some(ParamValue::Float(v)) => *v,
            other => return Err(format!("missing parameter x: {other:?}")),
        };
        if x > 0.5 {
            return Err("diverged".to_string());
        }
        let mut results = ResultMap::new();
        results.insert("objective".to_string(), ParamValue::Float(x));
        Ok(results)
    });

    let oracle = GridOracle::over(&[0.9, 0.2, 0.8, 0.4]);
    let mut scheduler = ExperimentScheduler::new(
        Box::new(oracle),
        local_pool(),
        fast_config().synchronous(),
    );
    scheduler.set_objective_function("flaky", flaky);

    let outcome = timeout(
        Duration::from_secs(10),
        scheduler.run_optimization(10, None),
    )
    .await
    .expect("optimization hung")
    .unwrap();

    assert_eq!(outcome.completed, 2);
    assert_eq!(outcome.failed, 2);
    assert_eq!(
        outcome.best.params.get("x"),
        Some(&ParamValue::Float(0.2))
    );

    // The failed trials kept their error, and their results are unusable.
    let failed: Vec<_> = scheduler
        .trials()
        .into_iter()
        .filter(|t| t.state() == TrialState::Failed)
        .collect();
    assert_eq!(failed.len(), 2);
    for trial in failed {
        let job = &trial.jobs()[0];
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(job.error().as_deref(), Some("diverged"));
        assert!(trial.get_results().is_err());
    }
}

#[tokio::test]
async fn all_failures_mean_no_usable_result() {
    let broken: ObjectiveFn = Arc::new(|_args| Err("always fails".to_string()));
    let oracle = GridOracle::over(&[0.1, 0.2]);
    let mut scheduler = ExperimentScheduler::new(
        Box::new(oracle),
        local_pool(),
        fast_config().synchronous(),
    );
    scheduler.set_objective_function("broken", broken);

    let result = timeout(
        Duration::from_secs(10),
        scheduler.run_optimization(10, None),
    )
    .await
    .expect("optimization hung");
    assert!(matches!(result, Err(Error::NoUsableResult)));
}

#[tokio::test]
async fn exhausted_oracle_stops_generation_early() {
    let oracle = GridOracle::over(&[0.3]);
    let mut scheduler = ExperimentScheduler::new(
        Box::new(oracle),
        local_pool(),
        fast_config().synchronous(),
    );
    scheduler.set_objective_function("parabola", parabola());

    let outcome = timeout(
        Duration::from_secs(10),
        scheduler.run_optimization(100, None),
    )
    .await
    .expect("optimization hung")
    .unwrap();

    assert_eq!(outcome.completed, 1);
    assert_eq!(scheduler.trials().len(), 1);
}

#[tokio::test]
async fn batch_trials_dispatch_together_at_scope_exit() {
    let oracle = GridOracle::over(&[]);
    let mut scheduler = ExperimentScheduler::new(
        Box::new(oracle),
        local_pool(),
        fast_config(),
    );
    scheduler.set_objective_function("parabola", parabola());

    let scheduler = &scheduler;
    let (_, staged) = scheduler
        .batch_trial_context(|batch| {
            for value in [0.1, 0.2, 0.3] {
                let mut params = ParamMap::new();
                params.insert("x".to_string(), ParamValue::Float(value));
                batch.add_trial(params)?;
            }
            // Inside the scope nothing has been dispatched: trials are
            // staged and their jobs never submitted.
            for id in batch.staged() {
                let trial = scheduler.trial(*id).unwrap();
                assert_eq!(trial.state(), TrialState::Queued);
                assert!(trial
                    .jobs()
                    .iter()
                    .all(|job| job.state() == JobState::Created));
            }
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(staged.len(), 3);
    for id in &staged {
        let trial = scheduler.trial(*id).unwrap();
        assert_ne!(trial.state(), TrialState::Created);
        assert_ne!(trial.state(), TrialState::Queued);
        assert!(trial
            .jobs()
            .iter()
            .all(|job| job.state() != JobState::Created));
    }

    // Drain the batch; each trial still terminates independently.
    timeout(Duration::from_secs(10), async {
        loop {
            scheduler.monitor_trials().await.unwrap();
            if scheduler.trials().iter().all(|t| t.is_terminal()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("batch never drained");

    for id in &staged {
        assert_eq!(
            scheduler.trial(*id).unwrap().state(),
            TrialState::Completed
        );
    }
}

#[tokio::test]
async fn failed_batch_scope_discards_staged_trials() {
    let oracle = GridOracle::over(&[]);
    let mut scheduler = ExperimentScheduler::new(
        Box::new(oracle),
        local_pool(),
        fast_config(),
    );
    scheduler.set_objective_function("parabola", parabola());

    let mut staged_ids = Vec::new();
    let result = scheduler
        .batch_trial_context(|batch| {
            let mut params = ParamMap::new();
            params.insert("x".to_string(), ParamValue::Float(0.5));
            staged_ids.push(batch.add_trial(params)?);
            Err::<(), _>(Error::Config("abort the batch".to_string()))
        })
        .await;

    assert!(matches!(result, Err(Error::Config(_))));
    assert_eq!(staged_ids.len(), 1);
    // The staged trial was discarded, never dispatched.
    assert!(scheduler.trial(staged_ids[0]).is_none());
}

#[tokio::test]
async fn saved_experiment_restores_the_oracle_walk() {
    let dir = scratch();
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("experiment.bin");

    let mut first = ExperimentScheduler::new(
        Box::new(GridOracle::over(&[0.1, 0.2, 0.3])),
        local_pool(),
        fast_config(),
    );
    first.set_objective_function("parabola", parabola());

    // Consume two suggestions, then persist the oracle state.
    first.get_next_trial().unwrap().unwrap();
    first.get_next_trial().unwrap().unwrap();
    first.save_experiment(&path).await.unwrap();

    // A fresh scheduler with a fresh oracle resumes exactly where the
    // saved one left off.
    let mut second = ExperimentScheduler::new(
        Box::new(GridOracle::over(&[0.1, 0.2, 0.3])),
        local_pool(),
        fast_config(),
    );
    second.set_objective_function("parabola", parabola());
    second.load_experiment(&path).await.unwrap();

    let id = second.get_next_trial().unwrap().expect("walk not exhausted");
    let trial = second.trial(id).unwrap();
    assert_eq!(trial.params().get("x"), Some(&ParamValue::Float(0.3)));

    // And the restored walk is exhausted afterwards, like the original.
    assert!(second.get_next_trial().unwrap().is_none());
}

#[tokio::test]
async fn events_track_the_trial_lifecycle() {
    let oracle = GridOracle::over(&[0.3]);
    let mut scheduler = ExperimentScheduler::new(
        Box::new(oracle),
        local_pool(),
        fast_config().synchronous(),
    );
    scheduler.set_objective_function("parabola", parabola());
    let mut rx = scheduler.events().subscribe();

    timeout(
        Duration::from_secs(10),
        scheduler.run_optimization(1, None),
    )
    .await
    .expect("optimization hung")
    .unwrap();

    let mut created = false;
    let mut dispatched = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            tuna::ExperimentEvent::TrialCreated { trial } => {
                assert_eq!(trial, TrialId(0));
                created = true;
            }
            tuna::ExperimentEvent::TrialDispatched { trial } => {
                assert_eq!(trial, TrialId(0));
                dispatched = true;
            }
            _ => {}
        }
    }
    assert!(created, "TrialCreated never published");
    assert!(dispatched, "TrialDispatched never published");
}

#[tokio::test]
async fn concurrent_dispatch_shares_the_pool() {
    let oracle = GridOracle::over(&[0.1, 0.2, 0.3]);
    let mut scheduler = ExperimentScheduler::new(
        Box::new(oracle),
        local_pool(),
        fast_config(),
    );
    scheduler.set_objective_function("parabola", parabola());

    let mut ids = Vec::new();
    while let Some(id) = scheduler.get_next_trial().unwrap() {
        ids.push(id);
    }
    assert_eq!(ids.len(), 3);

    futures::future::join_all(ids.iter().map(|id| scheduler.run_trial(*id)))
        .await
        .into_iter()
        .collect::<tuna::Result<Vec<_>>>()
        .unwrap();

    timeout(Duration::from_secs(10), async {
        loop {
            scheduler.monitor_trials().await.unwrap();
            if scheduler.trials().iter().all(|t| t.is_terminal()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("trials never drained");

    assert_eq!(scheduler.history().len(), 3);
}

#[tokio::test]
async fn two_step_objective_threads_results_through_the_scheduler() {
    let runner: Arc<dyn Runner> = local_pool();

    // simulate produces an intermediate value; analyze consumes it under
    // the propagated key and folds it into the final objective.
    let simulate: ObjectiveFn = Arc::new(|args: &ArgMap| {
        let x = match args.get("x").and_then(ArgValue::as_scalar) {
            Some(ParamValue::Float(v)) => *v,
            other => return Err(format!("missing parameter x: {other:?}")),
        };
        let mut results = ResultMap::new();
        results.insert("xyz".to_string(), ParamValue::Float(x * 0.8));
        Ok(results)
    });
    let analyze: ObjectiveFn = Arc::new(|args: &ArgMap| {
        let xyz = match args.get("xyz").and_then(ArgValue::as_scalar) {
            Some(ParamValue::Float(v)) => *v,
            other => return Err(format!("missing binding xyz: {other:?}")),
        };
        let mut results = ResultMap::new();
        results.insert("objective".to_string(), ParamValue::Float(xyz));
        Ok(results)
    });

    let graph = StepGraph::builder()
        .step(
            StepSpec::new(
                "simulate",
                JobPayload::Function {
                    name: "simulate".to_string(),
                    func: simulate,
                },
                runner.clone(),
            )
            .with_propagation_key("xyz"),
        )
        .step(
            StepSpec::new(
                "analyze",
                JobPayload::Function {
                    name: "analyze".to_string(),
                    func: analyze,
                },
                runner.clone(),
            )
            .with_placeholder("xyz")
            .depends_on(StepDependency::results("simulate")),
        )
        .build()
        .unwrap();

    let oracle = GridOracle::over(&[0.5]);
    let mut scheduler = ExperimentScheduler::new(
        Box::new(oracle),
        runner,
        fast_config().synchronous(),
    );
    scheduler.set_step_graph(graph);

    let outcome = timeout(
        Duration::from_secs(10),
        scheduler.run_optimization(1, None),
    )
    .await
    .expect("optimization hung")
    .unwrap();

    let metrics = outcome.best.metrics.expect("trial completed");
    assert_eq!(metrics.get("objective"), Some(&ParamValue::Float(0.4)));
}
