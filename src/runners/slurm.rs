use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Instrument;

use crate::error::{Error, Result};
use crate::job::{Job, JobId, JobPayload};
use crate::params::{ParamValue, ResultMap};
use crate::runner::{BackendStatus, Runner};
use crate::telemetry;

/// Configuration for the batch-cluster runner.
#[derive(Clone, Debug)]
pub struct SlurmConfig {
    /// Partition jobs are submitted to.
    pub partition: String,
    /// Wall-clock limit, `HH:MM:SS`.
    pub time_limit: String,
    /// Memory request per job (e.g. `4G`).
    pub memory: String,
    /// CPUs per task.
    pub cpus_per_task: u32,
    /// Environment modules loaded before the payload runs.
    pub modules: Vec<String>,
    /// Extra `#SBATCH --key=value` lines.
    pub sbatch_options: BTreeMap<String, String>,
    /// Directory holding per-job scripts, parameter and result files.
    /// Must be on a filesystem shared with the cluster.
    pub job_dir: PathBuf,
    /// Command resolving a function payload by name on the remote side
    /// (reads the params file, writes the result/error files).
    pub task_launcher: String,
    /// Singularity executable for container payloads.
    pub singularity_path: String,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            partition: "batch".to_string(),
            time_limit: "01:00:00".to_string(),
            memory: "4G".to_string(),
            cpus_per_task: 1,
            modules: vec!["python".to_string()],
            sbatch_options: BTreeMap::new(),
            job_dir: std::env::temp_dir().join("tuna-slurm"),
            task_launcher: "tuna-run-task".to_string(),
            singularity_path: "singularity".to_string(),
        }
    }
}

impl SlurmConfig {
    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    pub fn with_time_limit(mut self, limit: impl Into<String>) -> Self {
        self.time_limit = limit.into();
        self
    }

    pub fn with_memory(mut self, memory: impl Into<String>) -> Self {
        self.memory = memory.into();
        self
    }

    pub fn with_cpus_per_task(mut self, cpus: u32) -> Self {
        self.cpus_per_task = cpus;
        self
    }

    pub fn with_modules(mut self, modules: Vec<String>) -> Self {
        self.modules = modules;
        self
    }

    pub fn with_sbatch_option(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.sbatch_options.insert(key.into(), value.into());
        self
    }

    pub fn with_job_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.job_dir = dir.into();
        self
    }

    pub fn with_task_launcher(mut self, launcher: impl Into<String>) -> Self {
        self.task_launcher = launcher.into();
        self
    }
}

/// The batch scheduler's submission/status/cancel surface.
///
/// Kept as a trait so tests (and alternative batch systems with an
/// sbatch-compatible front) can stand in for the real CLI.
#[async_trait]
pub trait BatchSystem: Send + Sync {
    /// Submit a script; returns the backend's job id.
    async fn submit(&self, script: &Path) -> Result<String>;

    /// Query the status of a batch job id.
    async fn query(&self, batch_id: &str) -> Result<BackendStatus>;

    /// Cancel a batch job id.
    async fn cancel(&self, batch_id: &str) -> Result<()>;
}

/// Map one Slurm state token onto the normalized status set.
pub fn parse_slurm_state(state: &str) -> BackendStatus {
    let state = state.trim().trim_end_matches('+');
    match state {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "SUSPENDED" | "REQUEUE_HOLD" => {
            BackendStatus::Queued
        }
        "RUNNING" | "COMPLETING" | "STAGE_OUT" => BackendStatus::Running,
        "COMPLETED" => BackendStatus::Completed,
        "CANCELLED" => BackendStatus::Cancelled,
        _ => BackendStatus::Failed,
    }
}

/// Real batch interface shelling out to the Slurm CLI.
#[derive(Debug, Default)]
pub struct SlurmCli;

#[async_trait]
impl BatchSystem for SlurmCli {
    async fn submit(&self, script: &Path) -> Result<String> {
        let output = tokio::process::Command::new("sbatch")
            .arg(script)
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::Backend(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        // "Submitted batch job 123456"
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .split_whitespace()
            .last()
            .map(str::to_string)
            .ok_or_else(|| {
                Error::Backend(format!("unexpected sbatch output: {stdout}"))
            })
    }

    async fn query(&self, batch_id: &str) -> Result<BackendStatus> {
        let squeue = tokio::process::Command::new("squeue")
            .args(["-j", batch_id, "-h", "-o", "%T"])
            .output()
            .await?;
        if squeue.status.success() {
            let state = String::from_utf8_lossy(&squeue.stdout);
            let state = state.trim();
            if !state.is_empty() {
                return Ok(parse_slurm_state(state));
            }
        }

        // Not in the queue anymore; ask accounting for the final state.
        let sacct = tokio::process::Command::new("sacct")
            .args(["-j", batch_id, "-o", "State", "-n", "-X"])
            .output()
            .await?;
        let state = String::from_utf8_lossy(&sacct.stdout);
        match state.split_whitespace().next() {
            Some(token) => Ok(parse_slurm_state(token)),
            None => Ok(BackendStatus::Completed),
        }
    }

    async fn cancel(&self, batch_id: &str) -> Result<()> {
        let status = tokio::process::Command::new("scancel")
            .arg(batch_id)
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::Backend(format!(
                "scancel {batch_id} exited with {status}"
            )))
        }
    }
}

struct SubmittedJob {
    batch_id: String,
    job_path: PathBuf,
}

/// Runner submitting jobs to a Slurm-style batch cluster.
///
/// Each job gets its own directory under the configured `job_dir` holding
/// the rendered submission script, the serialized parameters, and the
/// result/error files the payload writes back. Status flows through the
/// batch scheduler's job-id API; results flow through the shared
/// filesystem.
pub struct SlurmRunner {
    config: SlurmConfig,
    batch: Arc<dyn BatchSystem>,
    submitted: Mutex<HashMap<JobId, SubmittedJob>>,
}

impl SlurmRunner {
    pub fn new(config: SlurmConfig) -> Self {
        Self::with_batch_system(config, Arc::new(SlurmCli))
    }

    /// Construct with an explicit batch interface (used by tests).
    pub fn with_batch_system(
        config: SlurmConfig,
        batch: Arc<dyn BatchSystem>,
    ) -> Self {
        Self {
            config,
            batch,
            submitted: Mutex::new(HashMap::new()),
        }
    }

    /// Render the submission script for a job.
    pub fn render_script(&self, job: &Job, job_path: &Path) -> String {
        let mut script = String::new();
        let dir = job_path.display();

        let _ = writeln!(script, "#!/bin/bash");
        let _ = writeln!(script, "#SBATCH --job-name={}", job.id());
        let _ = writeln!(script, "#SBATCH --output={dir}/job.out");
        let _ = writeln!(script, "#SBATCH --error={dir}/job.err");
        let _ = writeln!(script, "#SBATCH --partition={}", self.config.partition);
        let _ = writeln!(script, "#SBATCH --time={}", self.config.time_limit);
        let _ = writeln!(script, "#SBATCH --mem={}", self.config.memory);
        let _ = writeln!(
            script,
            "#SBATCH --cpus-per-task={}",
            self.config.cpus_per_task
        );
        for (key, value) in &self.config.sbatch_options {
            let _ = writeln!(script, "#SBATCH --{key}={value}");
        }

        script.push('\n');
        for module in &self.config.modules {
            let _ = writeln!(script, "module load {module}");
        }

        script.push('\n');
        for (key, value) in job.env_vars() {
            let _ = writeln!(script, "export {key}=\"{value}\"");
        }
        let _ = writeln!(script, "export JOB_PARAMS_FILE=\"{dir}/params.json\"");

        script.push('\n');
        match job.payload() {
            JobPayload::Function { name, .. } => {
                let _ = writeln!(
                    script,
                    "{} --function {name} --params \"$JOB_PARAMS_FILE\" --result {dir}/result.json --error {dir}/error.json",
                    self.config.task_launcher
                );
            }
            JobPayload::Script { path } => {
                let working_dir = job
                    .working_dir()
                    .map(|d| d.display().to_string())
                    .unwrap_or_else(|| dir.to_string());
                let _ = writeln!(script, "cd {working_dir}");
                let interpreter = if path.extension().is_some_and(|e| e == "sh")
                {
                    "bash"
                } else {
                    "python"
                };
                let _ = writeln!(script, "{interpreter} {}", path.display());
                Self::append_exit_trap(&mut script, &dir.to_string(), "script");
            }
            JobPayload::Container { image, command } => {
                let mut line = format!(
                    "{} run --bind {dir}:/job",
                    self.config.singularity_path
                );
                for (key, value) in job.env_vars() {
                    let _ = write!(line, " --env {key}={value}");
                }
                match job.working_dir() {
                    Some(workdir) => {
                        let _ = write!(
                            line,
                            " --bind {}:/workdir --pwd /workdir",
                            workdir.display()
                        );
                    }
                    None => {
                        let _ = write!(line, " --pwd /job");
                    }
                }
                let _ = write!(line, " {image}");
                if let Some(command) = command {
                    let _ = write!(line, " {command}");
                }
                let _ = writeln!(script, "{line}");
                Self::append_exit_trap(&mut script, &dir.to_string(), "container");
            }
        }

        script
    }

    fn append_exit_trap(script: &mut String, dir: &str, what: &str) {
        let _ = writeln!(script, "EXIT_CODE=$?");
        let _ = writeln!(script, "if [ $EXIT_CODE -ne 0 ]; then");
        let _ = writeln!(
            script,
            "  echo \"{{\\\"error\\\": \\\"{what} exited with code $EXIT_CODE\\\"}}\" > {dir}/error.json"
        );
        let _ = writeln!(script, "  exit $EXIT_CODE");
        let _ = writeln!(script, "fi");
        let _ = writeln!(script, "if [ ! -f {dir}/result.json ]; then");
        let _ = writeln!(
            script,
            "  echo \"{{\\\"stdout\\\": \\\"see job.out\\\"}}\" > {dir}/result.json"
        );
        let _ = writeln!(script, "fi");
    }

    async fn apply_terminal(
        &self,
        job: &Arc<Job>,
        status: BackendStatus,
        job_path: &Path,
    ) {
        match status {
            BackendStatus::Completed => {
                match tokio::fs::read(job_path.join("result.json")).await {
                    Ok(bytes) => match serde_json::from_slice::<ResultMap>(&bytes)
                    {
                        Ok(mut results) => {
                            self.collect_output_files(job, job_path, &mut results)
                                .await;
                            job.complete(results);
                        }
                        Err(err) => {
                            job.fail(format!("malformed result.json: {err}"));
                        }
                    },
                    Err(_) => {
                        match tokio::fs::read_to_string(
                            job_path.join("error.json"),
                        )
                        .await
                        {
                            Ok(error) => {
                                job.fail(Self::error_message(&error));
                            }
                            Err(_) => {
                                let mut results = ResultMap::new();
                                results.insert(
                                    "result".to_string(),
                                    ParamValue::Text(
                                        "job completed but no results found"
                                            .to_string(),
                                    ),
                                );
                                job.complete(results);
                            }
                        }
                    }
                }
            }
            BackendStatus::Failed => {
                let message = match tokio::fs::read_to_string(
                    job_path.join("error.json"),
                )
                .await
                {
                    Ok(error) => Self::error_message(&error),
                    Err(_) => "batch job failed".to_string(),
                };
                job.fail(message);
            }
            BackendStatus::Cancelled => {
                job.mark_cancelled();
            }
            BackendStatus::Queued | BackendStatus::Running => {}
        }
    }

    fn error_message(raw: &str) -> String {
        serde_json::from_str::<serde_json::Value>(raw)
            .ok()
            .and_then(|value| {
                value
                    .get("error")
                    .and_then(|e| e.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| raw.trim().to_string())
    }

    async fn collect_output_files(
        &self,
        job: &Arc<Job>,
        job_path: &Path,
        results: &mut ResultMap,
    ) {
        let base = job
            .working_dir()
            .cloned()
            .unwrap_or_else(|| job_path.to_path_buf());
        for file in job.output_files() {
            let content = tokio::fs::read_to_string(base.join(file))
                .await
                .unwrap_or_else(|_| "File not found".to_string());
            results.insert(
                format!("output_files.{file}"),
                ParamValue::Text(content),
            );
        }
    }
}

#[async_trait]
impl Runner for SlurmRunner {
    fn name(&self) -> &str {
        "slurm"
    }

    async fn run_job(&self, job: &Arc<Job>) -> Result<()> {
        let span = telemetry::job_submit_span(job.id().to_string(), self.name());
        async {
            job.mark_queued();
            let job_path = self.config.job_dir.join(job.id().to_string());
            tokio::fs::create_dir_all(&job_path).await?;

            let params = serde_json::to_vec_pretty(&job.args())?;
            tokio::fs::write(job_path.join("params.json"), params).await?;

            let script = self.render_script(job, &job_path);
            let script_path = job_path.join("job.sh");
            tokio::fs::write(&script_path, script).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o755);
                tokio::fs::set_permissions(&script_path, perms).await?;
            }

            match self.batch.submit(&script_path).await {
                Ok(batch_id) => {
                    tracing::info!(job = %job.id(), batch_id = %batch_id, "submitted batch job");
                    self.submitted
                        .lock()
                        .insert(job.id(), SubmittedJob { batch_id, job_path });
                    Ok(())
                }
                Err(err) => {
                    job.fail(format!(
                        "failed to submit to batch scheduler: {err}"
                    ));
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn check_job_status(&self, job: &Arc<Job>) -> Result<()> {
        let (batch_id, job_path) = match self.submitted.lock().get(&job.id()) {
            None => return Ok(()),
            Some(entry) => (entry.batch_id.clone(), entry.job_path.clone()),
        };

        let span = telemetry::job_poll_span(job.id().to_string(), self.name());
        async {
            let status = self.batch.query(&batch_id).await?;
            match status {
                BackendStatus::Running => {
                    job.mark_running();
                }
                BackendStatus::Queued => {}
                terminal => {
                    self.apply_terminal(job, terminal, &job_path).await;
                    self.submitted.lock().remove(&job.id());
                }
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn cancel_job(&self, job: &Arc<Job>) -> Result<()> {
        let entry = self.submitted.lock().remove(&job.id());
        if let Some(entry) = entry {
            if let Err(err) = self.batch.cancel(&entry.batch_id).await {
                tracing::warn!(job = %job.id(), error = %err, "scancel failed");
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
    use crate::params::{ArgMap, ParamMap};
    use parking_lot::Mutex as PlMutex;

    fn job_dir() -> PathBuf {
        std::env::temp_dir()
            .join("tuna-slurm-tests")
            .join(uuid::Uuid::new_v4().to_string())
    }

    fn objective() -> ObjectiveFn {
        Arc::new(|_args| Ok(ResultMap::new()))
    }

    struct MockBatch {
        submissions: PlMutex<Vec<PathBuf>>,
        status: PlMutex<BackendStatus>,
        cancelled: PlMutex<Vec<String>>,
    }

    impl MockBatch {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                submissions: PlMutex::new(Vec::new()),
                status: PlMutex::new(BackendStatus::Queued),
                cancelled: PlMutex::new(Vec::new()),
            })
        }

        fn set_status(&self, status: BackendStatus) {
            *self.status.lock() = status;
        }
    }

    #[async_trait]
    impl BatchSystem for MockBatch {
        async fn submit(&self, script: &Path) -> Result<String> {
            self.submissions.lock().push(script.to_path_buf());
            Ok(format!("{}", 100000 + self.submissions.lock().len()))
        }

        async fn query(&self, _batch_id: &str) -> Result<BackendStatus> {
            Ok(*self.status.lock())
        }

        async fn cancel(&self, batch_id: &str) -> Result<()> {
            self.cancelled.lock().push(batch_id.to_string());
            Ok(())
        }
    }

    #[test]
    fn state_parsing_covers_the_slurm_table() {
        assert_eq!(parse_slurm_state("PENDING"), BackendStatus::Queued);
        assert_eq!(parse_slurm_state("CONFIGURING"), BackendStatus::Queued);
        assert_eq!(parse_slurm_state("RUNNING"), BackendStatus::Running);
        assert_eq!(parse_slurm_state("COMPLETING"), BackendStatus::Running);
        assert_eq!(parse_slurm_state("COMPLETED"), BackendStatus::Completed);
        assert_eq!(parse_slurm_state("CANCELLED"), BackendStatus::Cancelled);
        assert_eq!(parse_slurm_state("CANCELLED+"), BackendStatus::Cancelled);
        assert_eq!(parse_slurm_state("FAILED"), BackendStatus::Failed);
        assert_eq!(parse_slurm_state("TIMEOUT"), BackendStatus::Failed);
        assert_eq!(parse_slurm_state("OUT_OF_MEMORY"), BackendStatus::Failed);
        assert_eq!(parse_slurm_state("NODE_FAIL"), BackendStatus::Failed);
    }

    #[test]
    fn script_rendering_includes_resources_and_environment() {
        let config = SlurmConfig::default()
            .with_partition("physics")
            .with_time_limit("02:00:00")
            .with_memory("8G")
            .with_cpus_per_task(4)
            .with_modules(vec!["python".to_string(), "gcc".to_string()])
            .with_sbatch_option("account", "eic-project");
        let runner = SlurmRunner::with_batch_system(config, MockBatch::new());

        let job = Job::function("objective", objective(), ArgMap::new())
            .with_env_var("OMP_NUM_THREADS", "4");
        let path = PathBuf::from("/scratch/jobs/abc");
        let script = runner.render_script(&job, &path);

        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("#SBATCH --partition=physics"));
        assert!(script.contains("#SBATCH --time=02:00:00"));
        assert!(script.contains("#SBATCH --mem=8G"));
        assert!(script.contains("#SBATCH --cpus-per-task=4"));
        assert!(script.contains("#SBATCH --account=eic-project"));
        assert!(script.contains("module load python"));
        assert!(script.contains("module load gcc"));
        assert!(script.contains("export OMP_NUM_THREADS=\"4\""));
        assert!(script
            .contains("export JOB_PARAMS_FILE=\"/scratch/jobs/abc/params.json\""));
        assert!(script.contains("--function objective"));
        assert!(script.contains("/scratch/jobs/abc/result.json"));
    }

    #[test]
    fn script_payload_gets_exit_trap() {
        let runner =
            SlurmRunner::with_batch_system(SlurmConfig::default(), MockBatch::new());
        let job = Job::script("/opt/objective.sh", ArgMap::new());
        let script = runner.render_script(&job, Path::new("/scratch/j"));

        assert!(script.contains("bash /opt/objective.sh"));
        assert!(script.contains("EXIT_CODE=$?"));
        assert!(script.contains("/scratch/j/error.json"));
    }

    #[tokio::test]
    async fn submit_poll_complete_round_trip() {
        let batch = MockBatch::new();
        let config = SlurmConfig::default().with_job_dir(job_dir());
        let runner = Arc::new(SlurmRunner::with_batch_system(
            config.clone(),
            batch.clone(),
        ));

        let mut params = ParamMap::new();
        params.insert("x".to_string(), ParamValue::Float(0.5));
        let job = Arc::new(Job::function(
            "objective",
            objective(),
            crate::params::args_from_params(&params),
        ));
        job.set_runner(runner.clone());
        job.run().await.unwrap();
        assert_eq!(job.state(), JobState::Queued);
        assert_eq!(batch.submissions.lock().len(), 1);

        batch.set_status(BackendStatus::Running);
        runner.check_job_status(&job).await.unwrap();
        assert_eq!(job.state(), JobState::Running);

        // The payload "wrote" its result to the shared filesystem.
        let result_path = config.job_dir.join(job.id().to_string());
        tokio::fs::write(
            result_path.join("result.json"),
            b"{\"objective\": 0.9}",
        )
        .await
        .unwrap();

        batch.set_status(BackendStatus::Completed);
        runner.check_job_status(&job).await.unwrap();
        assert_eq!(job.state(), JobState::Completed);
        assert_eq!(
            job.result().unwrap().get("objective"),
            Some(&ParamValue::Float(0.9))
        );

        // Idempotent once terminal.
        runner.check_job_status(&job).await.unwrap();
        assert_eq!(job.state(), JobState::Completed);
    }

    #[tokio::test]
    async fn failed_batch_job_reads_error_file() {
        let batch = MockBatch::new();
        let config = SlurmConfig::default().with_job_dir(job_dir());
        let runner = Arc::new(SlurmRunner::with_batch_system(
            config.clone(),
            batch.clone(),
        ));

        let job = Arc::new(Job::function("objective", objective(), ArgMap::new()));
        job.set_runner(runner.clone());
        job.run().await.unwrap();

        let job_path = config.job_dir.join(job.id().to_string());
        tokio::fs::write(
            job_path.join("error.json"),
            b"{\"error\": \"script exited with code 1\"}",
        )
        .await
        .unwrap();

        batch.set_status(BackendStatus::Failed);
        runner.check_job_status(&job).await.unwrap();
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(
            job.error().as_deref(),
            Some("script exited with code 1")
        );
    }

    #[tokio::test]
    async fn cancel_forwards_to_the_batch_system() {
        let batch = MockBatch::new();
        let runner = Arc::new(SlurmRunner::with_batch_system(
            SlurmConfig::default().with_job_dir(job_dir()),
            batch.clone(),
        ));

        let job = Arc::new(Job::function("objective", objective(), ArgMap::new()));
        job.set_runner(runner.clone());
        job.run().await.unwrap();

        runner.cancel_job(&job).await.unwrap();
        assert_eq!(job.state(), JobState::Cancelled);
        assert_eq!(batch.cancelled.lock().len(), 1);
    }
}
