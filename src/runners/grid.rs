use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Instrument;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::job::{DatasetRef, Job, JobId, JobPayload, OutputDataset};
use crate::params::ArgMap;
use crate::runner::{BackendStatus, Runner};
use crate::telemetry;

/// Configuration for the grid workload runner.
#[derive(Clone, Debug)]
pub struct GridConfig {
    /// Experiment name; prefixes workflow and task names.
    pub name: String,
    /// Cloud the workflow is routed to.
    pub cloud: String,
    /// Queue the workflow is routed to.
    pub queue: String,
    /// Virtual organization.
    pub vo: String,
    /// Shell snippet the remote side sources before running user code.
    pub init_env: Option<String>,
    /// Directory whose snapshot ships the user's code to the grid. When
    /// unset, the workflow references no snapshot and the backend must
    /// already know the code.
    pub source_dir: Option<PathBuf>,
    /// Path prefixes (relative to `source_dir`) excluded from the snapshot.
    pub exclude_paths: Vec<String>,
    /// Maximum task walltime in seconds.
    pub max_walltime_secs: u64,
    /// Cores per task.
    pub core_count: u32,
    /// Memory per task in MB.
    pub total_memory_mb: u64,
    /// Register a separate log dataset per task.
    pub enable_separate_log: bool,
    /// Local staging directory for snapshot archives.
    pub job_dir: PathBuf,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            name: "tuna".to_string(),
            cloud: "US".to_string(),
            queue: "ANALY_OSG".to_string(),
            vo: "wlcg".to_string(),
            init_env: None,
            source_dir: None,
            exclude_paths: Vec::new(),
            max_walltime_secs: 36_000,
            core_count: 1,
            total_memory_mb: 4_000,
            enable_separate_log: true,
            job_dir: std::env::temp_dir().join("tuna-grid"),
        }
    }
}

impl GridConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.source_dir = Some(dir.into());
        self
    }

    pub fn with_exclude_paths(mut self, excludes: Vec<String>) -> Self {
        self.exclude_paths = excludes;
        self
    }

    pub fn with_job_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.job_dir = dir.into();
        self
    }
}

/// A packed working-directory snapshot shipped with the workflow so the
/// remote side can re-import user code.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub archive: PathBuf,
    /// Digest over the relative paths and contents of every packed file,
    /// independent of archive timestamps.
    pub digest: String,
    pub file_count: usize,
}

/// Workflow-level submission payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    pub cloud: String,
    pub queue: String,
    pub vo: String,
    pub init_env: Option<String>,
    pub snapshot: Option<SnapshotRef>,
    pub max_walltime_secs: u64,
    pub core_count: u32,
    pub total_memory_mb: u64,
}

/// Per-job task submission payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    /// Function name the remote side resolves against the snapshot.
    pub function: String,
    pub args: ArgMap,
    pub output: Option<OutputDataset>,
    pub input_datasets: BTreeMap<String, DatasetRef>,
    pub return_results: bool,
    pub log_dataset: Option<String>,
}

/// Backend handle for a submitted workflow.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

/// Backend handle for a submitted task.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskId(pub String);

/// The grid workload system's submission surface, treated as opaque.
///
/// The wire format is the external system's own API/CLI; this trait only
/// fixes the operations the orchestrator needs.
#[async_trait]
pub trait GridClient: Send + Sync {
    async fn submit_workflow(&self, spec: &WorkflowSpec) -> Result<WorkflowId>;

    async fn submit_task(
        &self,
        workflow: &WorkflowId,
        spec: &TaskSpec,
    ) -> Result<TaskId>;

    async fn task_status(&self, task: &TaskId) -> Result<BackendStatus>;

    /// Fetch a finished task's in-process return value.
    async fn task_results(
        &self,
        task: &TaskId,
    ) -> Result<crate::params::ResultMap>;

    async fn cancel_task(&self, task: &TaskId) -> Result<()>;

    /// Register (or resolve) a dataset name, returning its reference.
    async fn register_dataset(&self, name: &str) -> Result<DatasetRef>;
}

/// Pack `source` into a zip archive under `out_dir`, skipping `excludes`.
///
/// Files are walked in sorted order and the digest covers relative paths
/// plus contents, so identical trees produce identical digests.
pub fn build_snapshot(
    source: &Path,
    excludes: &[String],
    out_dir: &Path,
) -> Result<SnapshotRef> {
    std::fs::create_dir_all(out_dir)?;

    let mut files: Vec<(PathBuf, PathBuf)> = Vec::new();
    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry.map_err(|err| {
            Error::Backend(format!("snapshot walk failed: {err}"))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|err| Error::Backend(format!("snapshot path: {err}")))?
            .to_path_buf();
        let relative_str = relative.to_string_lossy();
        if excludes
            .iter()
            .any(|exclude| relative_str.starts_with(exclude.as_str()))
        {
            continue;
        }
        files.push((entry.path().to_path_buf(), relative));
    }
    files.sort_by(|a, b| a.1.cmp(&b.1));

    let mut hasher = Sha256::new();
    for (path, relative) in &files {
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0]);
        hasher.update(std::fs::read(path)?);
    }
    let digest = hex::encode(hasher.finalize());

    let archive = out_dir.join(format!("snapshot-{}.zip", &digest[..12]));
    let file = std::fs::File::create(&archive)?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for (path, relative) in &files {
        writer
            .start_file(relative.to_string_lossy(), options)
            .map_err(|err| Error::Backend(format!("snapshot write: {err}")))?;
        writer.write_all(&std::fs::read(path)?)?;
    }
    writer
        .finish()
        .map_err(|err| Error::Backend(format!("snapshot finish: {err}")))?;

    Ok(SnapshotRef {
        archive,
        digest,
        file_count: files.len(),
    })
}

/// Runner submitting function jobs to a distributed grid workload system.
///
/// One workflow is submitted lazily per runner instance; every job becomes
/// a task inside it. Jobs declaring an output dataset get the dataset
/// registered at submission so dataset-dependent children can be released
/// immediately, with the backend's own dependency-triggering gating their
/// execution.
pub struct GridRunner {
    config: GridConfig,
    client: Arc<dyn GridClient>,
    workflow: tokio::sync::Mutex<Option<WorkflowId>>,
    tasks: Mutex<HashMap<JobId, TaskId>>,
}

impl GridRunner {
    pub fn new(config: GridConfig, client: Arc<dyn GridClient>) -> Self {
        Self {
            config,
            client,
            workflow: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    async fn ensure_workflow(&self) -> Result<WorkflowId> {
        let mut workflow = self.workflow.lock().await;
        if let Some(id) = workflow.as_ref() {
            return Ok(id.clone());
        }

        let snapshot = match &self.config.source_dir {
            Some(source) => Some(build_snapshot(
                source,
                &self.config.exclude_paths,
                &self.config.job_dir,
            )?),
            None => None,
        };

        let spec = WorkflowSpec {
            name: self.config.name.clone(),
            cloud: self.config.cloud.clone(),
            queue: self.config.queue.clone(),
            vo: self.config.vo.clone(),
            init_env: self.config.init_env.clone(),
            snapshot,
            max_walltime_secs: self.config.max_walltime_secs,
            core_count: self.config.core_count,
            total_memory_mb: self.config.total_memory_mb,
        };
        let id = self.client.submit_workflow(&spec).await?;
        tracing::info!(workflow = %id.0, name = %spec.name, "submitted grid workflow");
        *workflow = Some(id.clone());
        Ok(id)
    }
}

#[async_trait]
impl Runner for GridRunner {
    fn name(&self) -> &str {
        "grid"
    }

    async fn run_job(&self, job: &Arc<Job>) -> Result<()> {
        let function = match job.payload() {
            JobPayload::Function { name, .. } => name.clone(),
            other => {
                let message = format!(
                    "grid runner executes function jobs only, got {}",
                    other.kind()
                );
                job.fail(message.clone());
                return Err(Error::Backend(message));
            }
        };

        let span = telemetry::job_submit_span(job.id().to_string(), self.name());
        async {
            job.mark_queued();
            let workflow = self.ensure_workflow().await?;

            if let Some(output) = job.output_dataset() {
                let mut name = output.dataset.clone();
                if !name.ends_with('/') {
                    name.push('/');
                }
                let dataset = self.client.register_dataset(&name).await?;
                job.set_dataset_ref(dataset);
            }

            let task_name =
                format!("{}.{}.{}", self.config.name, job.id(), function);
            let spec = TaskSpec {
                name: task_name.clone(),
                function,
                args: job.args(),
                output: job.output_dataset().cloned(),
                input_datasets: job.input_datasets(),
                return_results: job.return_results(),
                log_dataset: self
                    .config
                    .enable_separate_log
                    .then(|| format!("{task_name}.log/")),
            };

            match self.client.submit_task(&workflow, &spec).await {
                Ok(task_id) => {
                    tracing::info!(job = %job.id(), task = %task_id.0, "submitted grid task");
                    self.tasks.lock().insert(job.id(), task_id);
                    Ok(())
                }
                Err(err) => {
                    job.fail(format!("failed to submit grid task: {err}"));
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn check_job_status(&self, job: &Arc<Job>) -> Result<()> {
        let task_id = match self.tasks.lock().get(&job.id()) {
            None => return Ok(()),
            Some(task) => task.clone(),
        };

        let span = telemetry::job_poll_span(job.id().to_string(), self.name());
        async {
            let status = self.client.task_status(&task_id).await?;
            match status {
                BackendStatus::Queued => {}
                BackendStatus::Running => {
                    job.mark_running();
                }
                BackendStatus::Completed => {
                    // Dataset-producing steps may opt out of a return value;
                    // their completion is the backend's terminal status alone.
                    if job.return_results() {
                        let results = self.client.task_results(&task_id).await?;
                        job.complete(results);
                    } else {
                        job.complete(crate::params::ResultMap::new());
                    }
                    self.tasks.lock().remove(&job.id());
                }
                BackendStatus::Failed => {
                    job.fail(format!("grid task {} failed", task_id.0));
                    self.tasks.lock().remove(&job.id());
                }
                BackendStatus::Cancelled => {
                    job.mark_cancelled();
                    self.tasks.lock().remove(&job.id());
                }
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn cancel_job(&self, job: &Arc<Job>) -> Result<()> {
        let task_id = self.tasks.lock().remove(&job.id());
        if let Some(task_id) = task_id {
            if let Err(err) = self.client.cancel_task(&task_id).await {
                tracing::warn!(job = %job.id(), error = %err, "grid cancel failed");
            }
        }
        job.mark_cancelled();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobState, ObjectiveFn};
    use crate::params::{ParamValue, ResultMap};
    use parking_lot::Mutex as PlMutex;

    fn staging() -> PathBuf {
        std::env::temp_dir()
            .join("tuna-grid-tests")
            .join(uuid::Uuid::new_v4().to_string())
    }

    fn objective() -> ObjectiveFn {
        Arc::new(|_args| Ok(ResultMap::new()))
    }

    struct MockGrid {
        workflows: PlMutex<Vec<WorkflowSpec>>,
        tasks: PlMutex<Vec<TaskSpec>>,
        status: PlMutex<BackendStatus>,
        results: PlMutex<ResultMap>,
        cancelled: PlMutex<Vec<TaskId>>,
    }

    impl MockGrid {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                workflows: PlMutex::new(Vec::new()),
                tasks: PlMutex::new(Vec::new()),
                status: PlMutex::new(BackendStatus::Queued),
                results: PlMutex::new(ResultMap::new()),
                cancelled: PlMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl GridClient for MockGrid {
        async fn submit_workflow(
            &self,
            spec: &WorkflowSpec,
        ) -> Result<WorkflowId> {
            self.workflows.lock().push(spec.clone());
            Ok(WorkflowId(format!("wf-{}", self.workflows.lock().len())))
        }

        async fn submit_task(
            &self,
            _workflow: &WorkflowId,
            spec: &TaskSpec,
        ) -> Result<TaskId> {
            self.tasks.lock().push(spec.clone());
            Ok(TaskId(format!("task-{}", self.tasks.lock().len())))
        }

        async fn task_status(&self, _task: &TaskId) -> Result<BackendStatus> {
            Ok(*self.status.lock())
        }

        async fn task_results(&self, _task: &TaskId) -> Result<ResultMap> {
            Ok(self.results.lock().clone())
        }

        async fn cancel_task(&self, task: &TaskId) -> Result<()> {
            self.cancelled.lock().push(task.clone());
            Ok(())
        }

        async fn register_dataset(&self, name: &str) -> Result<DatasetRef> {
            Ok(DatasetRef(name.trim_end_matches('/').to_string()))
        }
    }

    fn write_tree(root: &Path) {
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join("data")).unwrap();
        std::fs::write(root.join("src/main.py"), b"print('hi')\n").unwrap();
        std::fs::write(root.join("src/util.py"), b"x = 1\n").unwrap();
        std::fs::write(root.join("data/big.bin"), vec![0u8; 1024]).unwrap();
    }

    #[test]
    fn snapshot_digest_is_deterministic() {
        let root = staging();
        write_tree(&root);

        // Archives must not land inside the tree being packed.
        let out = staging();
        let a = build_snapshot(&root, &[], &out.join("a")).unwrap();
        let b = build_snapshot(&root, &[], &out.join("b")).unwrap();
        assert_eq!(a.digest, b.digest);
        assert_eq!(a.file_count, 3);
    }

    #[test]
    fn snapshot_honors_excluded_paths() {
        let root = staging();
        write_tree(&root);

        let snapshot =
            build_snapshot(&root, &["data".to_string()], &staging()).unwrap();
        assert_eq!(snapshot.file_count, 2);

        let file = std::fs::File::open(&snapshot.archive).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        let names: Vec<String> =
            (0..archive.len())
                .map(|i| archive.by_index(i).unwrap().name().to_string())
                .collect();
        assert!(names.iter().all(|name| !name.starts_with("data")));
    }

    #[tokio::test]
    async fn one_workflow_is_shared_across_jobs() {
        let grid = MockGrid::new();
        let runner = Arc::new(GridRunner::new(
            GridConfig::default().with_job_dir(staging()),
            grid.clone(),
        ));

        for _ in 0..2 {
            let job =
                Arc::new(Job::function("objective", objective(), ArgMap::new()));
            job.set_runner(runner.clone());
            job.run().await.unwrap();
        }

        assert_eq!(grid.workflows.lock().len(), 1);
        assert_eq!(grid.tasks.lock().len(), 2);
    }

    #[tokio::test]
    async fn output_dataset_is_registered_at_submission() {
        let grid = MockGrid::new();
        let runner = Arc::new(GridRunner::new(
            GridConfig::default().with_job_dir(staging()),
            grid.clone(),
        ));

        let job = Arc::new(
            Job::function("produce", objective(), ArgMap::new())
                .with_return_results(false)
                .with_output_dataset(OutputDataset::new(
                    "physics.events",
                    "events.root",
                )),
        );
        job.set_runner(runner.clone());
        job.run().await.unwrap();

        // Registered before any completion is observed.
        assert_eq!(
            job.dataset_ref(),
            Some(DatasetRef("physics.events".to_string()))
        );

        // Terminal status completes the job without a result fetch.
        *grid.status.lock() = BackendStatus::Completed;
        runner.check_job_status(&job).await.unwrap();
        assert_eq!(job.state(), JobState::Completed);
        assert!(job.result().unwrap().is_empty());
    }

    #[tokio::test]
    async fn completed_task_results_flow_back() {
        let grid = MockGrid::new();
        let mut results = ResultMap::new();
        results.insert("objective".to_string(), ParamValue::Float(0.7));
        *grid.results.lock() = results.clone();

        let runner = Arc::new(GridRunner::new(
            GridConfig::default().with_job_dir(staging()),
            grid.clone(),
        ));
        let job = Arc::new(Job::function("objective", objective(), ArgMap::new()));
        job.set_runner(runner.clone());
        job.run().await.unwrap();

        *grid.status.lock() = BackendStatus::Completed;
        runner.check_job_status(&job).await.unwrap();
        assert_eq!(job.state(), JobState::Completed);
        assert_eq!(job.result(), Some(results));
    }

    #[tokio::test]
    async fn script_payloads_are_rejected() {
        let grid = MockGrid::new();
        let runner = Arc::new(GridRunner::new(
            GridConfig::default().with_job_dir(staging()),
            grid.clone(),
        ));
        let job = Arc::new(Job::script("/opt/run.sh", ArgMap::new()));
        job.set_runner(runner.clone());

        assert!(job.run().await.is_err());
        assert_eq!(job.state(), JobState::Failed);
    }

    #[tokio::test]
    async fn cancel_forwards_to_the_grid() {
        let grid = MockGrid::new();
        let runner = Arc::new(GridRunner::new(
            GridConfig::default().with_job_dir(staging()),
            grid.clone(),
        ));
        let job = Arc::new(Job::function("objective", objective(), ArgMap::new()));
        job.set_runner(runner.clone());
        job.run().await.unwrap();

        runner.cancel_job(&job).await.unwrap();
        assert_eq!(job.state(), JobState::Cancelled);
        assert_eq!(grid.cancelled.lock().len(), 1);
    }
}
