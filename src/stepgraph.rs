use parking_lot::Mutex;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::job::{Job, JobPayload, OutputDataset};
use crate::params::{
    args_from_params, ArgValue, GlobalParameterSet, ParamMap, ParamValue,
    ResultMap,
};
use crate::runner::Runner;
use crate::trial::TrialId;

/// What a child step consumes from its parent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DependencyKind {
    /// The parent's in-process result map; the child waits for the parent
    /// to complete.
    Results,
    /// A dataset reference registered by the parent's backend; the child is
    /// released as soon as the reference exists and the backend gates the
    /// actual execution.
    Dataset,
}

/// How parent values map onto child replicas.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MergePolicy {
    /// Each parent slice feeds the child slice with the same key.
    OneToOne,
    /// Every parent slice feeds a single (unsliced) child as one keyed map.
    AllToOne,
}

/// A dependency edge from a child step to one of its parents.
#[derive(Clone, Debug)]
pub struct StepDependency {
    pub parent: String,
    pub kind: DependencyKind,
    pub merge: MergePolicy,
}

impl StepDependency {
    /// Results dependency with one-to-one slice mapping.
    pub fn results(parent: impl Into<String>) -> Self {
        Self {
            parent: parent.into(),
            kind: DependencyKind::Results,
            merge: MergePolicy::OneToOne,
        }
    }

    /// Results dependency merging every parent slice into one child.
    pub fn all_to_one(parent: impl Into<String>) -> Self {
        Self {
            parent: parent.into(),
            kind: DependencyKind::Results,
            merge: MergePolicy::AllToOne,
        }
    }

    /// Dataset dependency; chaining is delegated to the backend.
    pub fn dataset(parent: impl Into<String>) -> Self {
        Self {
            parent: parent.into(),
            kind: DependencyKind::Dataset,
            merge: MergePolicy::OneToOne,
        }
    }
}

/// Declaration of one named step in a multi-step objective.
#[derive(Clone)]
pub struct StepSpec {
    name: String,
    payload: JobPayload,
    runner: Arc<dyn Runner>,
    deps: Vec<StepDependency>,
    placeholders: Vec<String>,
    propagation_key: String,
    sliced: bool,
    return_results: bool,
    output_dataset: Option<OutputDataset>,
    output_files: Vec<String>,
}

impl StepSpec {
    pub fn new(
        name: impl Into<String>,
        payload: JobPayload,
        runner: Arc<dyn Runner>,
    ) -> Self {
        Self {
            name: name.into(),
            payload,
            runner,
            deps: Vec::new(),
            placeholders: Vec::new(),
            propagation_key: "parent_result".to_string(),
            sliced: false,
            return_results: true,
            output_dataset: None,
            output_files: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare a dependency on another step.
    pub fn depends_on(mut self, dep: StepDependency) -> Self {
        self.deps.push(dep);
        self
    }

    /// Declare an argument name this step expects to be injected by a
    /// parent. Propagation keys are checked against this list when the
    /// graph is built.
    pub fn with_placeholder(mut self, name: impl Into<String>) -> Self {
        self.placeholders.push(name.into());
        self
    }

    /// The key under which this step's result value is propagated to its
    /// children.
    pub fn with_propagation_key(mut self, key: impl Into<String>) -> Self {
        self.propagation_key = key.into();
        self
    }

    /// Replicate this step across the graph's global-parameter slices.
    pub fn sliced(mut self) -> Self {
        self.sliced = true;
        self
    }

    /// See [`Job::with_return_results`].
    pub fn with_return_results(mut self, yes: bool) -> Self {
        self.return_results = yes;
        self
    }

    pub fn with_output_dataset(mut self, output: OutputDataset) -> Self {
        self.output_dataset = Some(output);
        self
    }

    pub fn with_output_files(mut self, files: Vec<String>) -> Self {
        self.output_files = files;
        self
    }
}

impl fmt::Debug for StepSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepSpec")
            .field("name", &self.name)
            .field("payload", &self.payload)
            .field("deps", &self.deps)
            .field("sliced", &self.sliced)
            .finish_non_exhaustive()
    }
}

/// A validated DAG of named steps, each bound to its own runner.
///
/// `StepGraph` is the template; [`StepGraph::instantiate`] stamps it into
/// concrete jobs for one trial. Validation happens once at build time so
/// structural mistakes surface before any trial is created.
#[derive(Clone)]
pub struct StepGraph {
    steps: Vec<StepSpec>,
    topo: Vec<usize>,
    final_step: String,
    globals: GlobalParameterSet,
}

impl StepGraph {
    pub fn builder() -> StepGraphBuilder {
        StepGraphBuilder {
            steps: Vec::new(),
            final_step: None,
            globals: GlobalParameterSet::new(),
        }
    }

    /// The designated final step whose result becomes the trial result.
    pub fn final_step(&self) -> &str {
        &self.final_step
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    /// Stamp the graph into jobs for one trial.
    ///
    /// Parameter-sensitive steps are replicated into one job per
    /// global-parameter slice, tagged with the slice key; every job is
    /// bound to its step's runner.
    pub fn instantiate(
        &self,
        trial: TrialId,
        params: &ParamMap,
        base_dir: Option<&Path>,
    ) -> StepExecutor {
        let slices = self.globals.slices();
        let mut jobs: BTreeMap<String, BTreeMap<String, Arc<Job>>> =
            BTreeMap::new();
        let mut exec_steps = Vec::with_capacity(self.topo.len());

        for &index in &self.topo {
            let spec = &self.steps[index];
            let step_slices: Vec<Option<&crate::params::SliceKey>> = if spec.sliced
            {
                slices.iter().map(Some).collect()
            } else {
                vec![None]
            };

            let mut per_slice = BTreeMap::new();
            for slice in step_slices {
                let mut job = match &spec.payload {
                    JobPayload::Function { name, func } => Job::function(
                        name.clone(),
                        func.clone(),
                        args_from_params(params),
                    ),
                    JobPayload::Script { path } => {
                        Job::script(path.clone(), args_from_params(params))
                    }
                    JobPayload::Container { image, command } => Job::container(
                        image.clone(),
                        command.clone(),
                        args_from_params(params),
                    ),
                };

                job = job
                    .with_propagation_key(spec.propagation_key.clone())
                    .with_return_results(spec.return_results)
                    .with_output_files(spec.output_files.clone());

                if let Some(output) = &spec.output_dataset {
                    let mut output = output.clone();
                    output.dataset = format!("{}.{}", output.dataset, trial);
                    job = job.with_output_dataset(output);
                }

                let composite = match slice {
                    Some(slice) => {
                        job = job.with_slice(slice.clone());
                        slice.composite()
                    }
                    None => String::new(),
                };

                if let Some(base) = base_dir {
                    let mut dir = base.join(&spec.name);
                    if !composite.is_empty() {
                        dir = dir.join(&composite);
                    }
                    job = job.with_working_dir(dir);
                }

                let job = Arc::new(job);
                job.set_runner(spec.runner.clone());
                per_slice.insert(composite, job);
            }

            jobs.insert(spec.name.clone(), per_slice);
            exec_steps.push(ExecStep {
                name: spec.name.clone(),
                deps: spec.deps.clone(),
            });
        }

        let propagation_keys = self
            .steps
            .iter()
            .map(|s| (s.name.clone(), s.propagation_key.clone()))
            .collect();
        let dataset_files = self
            .steps
            .iter()
            .filter_map(|s| {
                s.output_dataset
                    .as_ref()
                    .map(|d| (s.name.clone(), d.file.clone()))
            })
            .collect();

        StepExecutor {
            steps: exec_steps,
            jobs,
            propagation_keys,
            dataset_files,
            final_step: self.final_step.clone(),
            dispatched: Mutex::new(HashSet::new()),
        }
    }
}

impl fmt::Debug for StepGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepGraph")
            .field("steps", &self.step_names())
            .field("final_step", &self.final_step)
            .finish_non_exhaustive()
    }
}

/// Builder for [`StepGraph`]; all structural validation happens in
/// [`build`](StepGraphBuilder::build).
pub struct StepGraphBuilder {
    steps: Vec<StepSpec>,
    final_step: Option<String>,
    globals: GlobalParameterSet,
}

impl StepGraphBuilder {
    pub fn step(mut self, spec: StepSpec) -> Self {
        self.steps.push(spec);
        self
    }

    /// Designate the final step; defaults to the last declared step.
    pub fn final_step(mut self, name: impl Into<String>) -> Self {
        self.final_step = Some(name.into());
        self
    }

    pub fn global_parameters(mut self, globals: GlobalParameterSet) -> Self {
        self.globals = globals;
        self
    }

    pub fn build(self) -> Result<StepGraph> {
        if self.steps.is_empty() {
            return Err(Error::InvalidStepGraph(
                "no steps declared".to_string(),
            ));
        }

        let mut index_by_name: HashMap<&str, usize> = HashMap::new();
        for (i, spec) in self.steps.iter().enumerate() {
            if index_by_name.insert(spec.name.as_str(), i).is_some() {
                return Err(Error::InvalidStepGraph(format!(
                    "duplicate step name '{}'",
                    spec.name
                )));
            }
        }

        for spec in &self.steps {
            if spec.sliced && self.globals.is_empty() {
                return Err(Error::InvalidStepGraph(format!(
                    "step '{}' is parameter-sensitive but no global parameters are declared",
                    spec.name
                )));
            }

            for dep in &spec.deps {
                let parent_index = *index_by_name
                    .get(dep.parent.as_str())
                    .ok_or_else(|| {
                        Error::InvalidStepGraph(format!(
                            "step '{}' depends on undeclared step '{}'",
                            spec.name, dep.parent
                        ))
                    })?;
                let parent = &self.steps[parent_index];

                match dep.kind {
                    DependencyKind::Results => {
                        let key = parent.propagation_key.as_str();
                        if !spec.placeholders.iter().any(|p| p == key) {
                            return Err(Error::DependencyBinding {
                                step: spec.name.clone(),
                                reason: format!(
                                    "no placeholder argument matches propagation key '{key}' of parent '{}'",
                                    parent.name
                                ),
                            });
                        }
                        match dep.merge {
                            MergePolicy::OneToOne => {
                                if parent.sliced != spec.sliced {
                                    return Err(Error::DependencyBinding {
                                        step: spec.name.clone(),
                                        reason: format!(
                                            "one-to-one merge from '{}' requires parent and child to share slicing",
                                            parent.name
                                        ),
                                    });
                                }
                            }
                            MergePolicy::AllToOne => {
                                // Slice-key shapes would be ambiguous; fail
                                // loudly instead of guessing a merge order.
                                if spec.sliced {
                                    return Err(Error::DependencyBinding {
                                        step: spec.name.clone(),
                                        reason: format!(
                                            "all-to-one merge from '{}' cannot target a parameter-sliced child",
                                            parent.name
                                        ),
                                    });
                                }
                            }
                        }
                    }
                    DependencyKind::Dataset => {
                        if parent.output_dataset.is_none() {
                            return Err(Error::InvalidStepGraph(format!(
                                "step '{}' declares a dataset dependency on '{}', which registers no output dataset",
                                spec.name, parent.name
                            )));
                        }
                    }
                }
            }
        }

        // Cycle check and topological order.
        let mut graph = DiGraph::<usize, ()>::new();
        let nodes: Vec<_> =
            (0..self.steps.len()).map(|i| graph.add_node(i)).collect();
        for (i, spec) in self.steps.iter().enumerate() {
            for dep in &spec.deps {
                let parent = index_by_name[dep.parent.as_str()];
                graph.add_edge(nodes[parent], nodes[i], ());
            }
        }
        let topo = toposort(&graph, None).map_err(|cycle| {
            let name = &self.steps[graph[cycle.node_id()]].name;
            Error::InvalidStepGraph(format!("cycle involving step '{name}'"))
        })?;
        let topo: Vec<usize> = topo.into_iter().map(|n| graph[n]).collect();

        let final_step = match self.final_step {
            Some(name) => {
                if !index_by_name.contains_key(name.as_str()) {
                    return Err(Error::InvalidStepGraph(format!(
                        "final step '{name}' is not declared"
                    )));
                }
                name
            }
            None => self
                .steps
                .last()
                .map(|s| s.name.clone())
                .unwrap_or_default(),
        };

        Ok(StepGraph {
            steps: self.steps,
            topo,
            final_step,
            globals: self.globals,
        })
    }
}

struct ExecStep {
    name: String,
    deps: Vec<StepDependency>,
}

/// Drives the ordered dispatch and result propagation of one trial's
/// instantiated step graph.
///
/// The executor never blocks: each [`dispatch_ready`](Self::dispatch_ready)
/// pass releases exactly those steps whose parents now satisfy their
/// dependency contract, binds parent values into child arguments, and
/// submits the released jobs.
pub struct StepExecutor {
    steps: Vec<ExecStep>,
    jobs: BTreeMap<String, BTreeMap<String, Arc<Job>>>,
    propagation_keys: HashMap<String, String>,
    dataset_files: HashMap<String, String>,
    final_step: String,
    dispatched: Mutex<HashSet<String>>,
}

impl StepExecutor {
    /// Every job of the graph, in topological step order (slices in
    /// composite-key order within a step).
    pub fn jobs(&self) -> Vec<Arc<Job>> {
        self.steps
            .iter()
            .flat_map(|step| self.jobs[&step.name].values().cloned())
            .collect()
    }

    /// The jobs of one step, keyed by slice composite.
    pub fn step_jobs(&self, step: &str) -> Option<&BTreeMap<String, Arc<Job>>> {
        self.jobs.get(step)
    }

    pub fn final_step(&self) -> &str {
        &self.final_step
    }

    fn deps_satisfied(&self, step: &ExecStep) -> bool {
        step.deps.iter().all(|dep| {
            let parents = &self.jobs[&dep.parent];
            match dep.kind {
                DependencyKind::Results => {
                    parents.values().all(|job| job.is_completed())
                }
                DependencyKind::Dataset => {
                    parents.values().all(|job| job.dataset_ref().is_some())
                }
            }
        })
    }

    fn bind_step(&self, step: &ExecStep) -> Result<()> {
        let children = &self.jobs[&step.name];
        for dep in &step.deps {
            let parents = &self.jobs[&dep.parent];
            match dep.kind {
                DependencyKind::Dataset => {
                    let input_name = self
                        .dataset_files
                        .get(&dep.parent)
                        .cloned()
                        .unwrap_or_else(|| dep.parent.clone());
                    for (composite, parent) in parents {
                        let dataset =
                            parent.dataset_ref().ok_or_else(|| {
                                Error::DependencyBinding {
                                    step: step.name.clone(),
                                    reason: format!(
                                        "parent '{}' registered no dataset",
                                        dep.parent
                                    ),
                                }
                            })?;
                        let name = if composite.is_empty() {
                            input_name.clone()
                        } else {
                            format!("{input_name}+{composite}")
                        };
                        for child in children.values() {
                            child.add_input_dataset(name.clone(), dataset.clone());
                        }
                    }
                }
                DependencyKind::Results => {
                    let key = self
                        .propagation_keys
                        .get(&dep.parent)
                        .cloned()
                        .unwrap_or_else(|| "parent_result".to_string());
                    match dep.merge {
                        MergePolicy::OneToOne => {
                            for (composite, child) in children {
                                let parent = parents.get(composite).ok_or_else(
                                    || Error::DependencyBinding {
                                        step: step.name.clone(),
                                        reason: format!(
                                            "parent '{}' has no slice '{composite}'",
                                            dep.parent
                                        ),
                                    },
                                )?;
                                let value =
                                    self.extract(parent, &dep.parent, &key, step)?;
                                child.set_parent_result(
                                    &dep.parent,
                                    &key,
                                    ArgValue::Scalar(value),
                                );
                            }
                        }
                        MergePolicy::AllToOne => {
                            let mut merged: BTreeMap<String, ParamValue> =
                                BTreeMap::new();
                            for (composite, parent) in parents {
                                let value =
                                    self.extract(parent, &dep.parent, &key, step)?;
                                merged.insert(composite.clone(), value);
                            }
                            for child in children.values() {
                                child.set_parent_result(
                                    &dep.parent,
                                    &key,
                                    ArgValue::PerSlice(merged.clone()),
                                );
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn extract(
        &self,
        parent: &Arc<Job>,
        parent_name: &str,
        key: &str,
        step: &ExecStep,
    ) -> Result<ParamValue> {
        parent
            .result()
            .and_then(|result| result.get(key).cloned())
            .ok_or_else(|| Error::DependencyBinding {
                step: step.name.clone(),
                reason: format!(
                    "result of parent '{parent_name}' has no key '{key}'"
                ),
            })
    }

    /// Dispatch every not-yet-dispatched step whose dependency contract is
    /// now satisfied.
    ///
    /// A binding failure fails the affected step's jobs before anything is
    /// submitted for them and is reported back to the caller; other ready
    /// steps still dispatch.
    pub async fn dispatch_ready(&self) -> Result<()> {
        let mut to_run: Vec<Arc<Job>> = Vec::new();
        let mut binding_error: Option<Error> = None;

        {
            let mut dispatched = self.dispatched.lock();
            for step in &self.steps {
                if dispatched.contains(&step.name) {
                    continue;
                }
                if !self.deps_satisfied(step) {
                    continue;
                }
                match self.bind_step(step) {
                    Ok(()) => {
                        dispatched.insert(step.name.clone());
                        to_run.extend(self.jobs[&step.name].values().cloned());
                    }
                    Err(err) => {
                        // Surface the failure before any backend resources
                        // are consumed for this step.
                        for job in self.jobs[&step.name].values() {
                            job.fail(err.to_string());
                        }
                        dispatched.insert(step.name.clone());
                        if binding_error.is_none() {
                            binding_error = Some(err);
                        }
                    }
                }
            }
        }

        for job in &to_run {
            if let Err(err) = job.run().await {
                job.fail(err.to_string());
            }
        }

        match binding_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// The final step's aggregated result.
    ///
    /// A sliced final step merges its per-slice results under
    /// `composite.metric` keys.
    pub fn final_results(&self) -> Option<ResultMap> {
        let jobs = self.jobs.get(&self.final_step)?;
        if jobs.len() == 1 {
            return jobs.values().next().and_then(|job| job.result());
        }
        let mut merged = ResultMap::new();
        for (composite, job) in jobs {
            let result = job.result()?;
            for (key, value) in result {
                merged.insert(format!("{composite}.{key}"), value);
            }
        }
        Some(merged)
    }
}

impl fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepExecutor")
            .field("final_step", &self.final_step)
            .field("dispatched", &*self.dispatched.lock())
            .finish_non_exhaustive()
    }
}
