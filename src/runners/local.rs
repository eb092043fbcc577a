use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::job::{Job, JobId, JobPayload};
use crate::params::{ArgMap, ParamValue, ResultMap};
use crate::runner::Runner;
use crate::telemetry;

/// Which container engine the local runner shells out to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContainerEngine {
    Docker,
    Singularity,
}

/// Configuration for the local bounded worker pool.
#[derive(Clone, Debug)]
pub struct LocalPoolConfig {
    /// Maximum number of jobs executing at once. Jobs beyond the bound
    /// queue inside the pool rather than being rejected.
    pub max_workers: usize,
    /// Container engine for container payloads.
    pub container_engine: ContainerEngine,
    /// Scratch space for per-job parameter and result files.
    pub scratch_dir: PathBuf,
}

impl Default for LocalPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: num_cpus::get(),
            container_engine: ContainerEngine::Docker,
            scratch_dir: std::env::temp_dir().join("tuna-jobs"),
        }
    }
}

impl LocalPoolConfig {
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers.max(1);
        self
    }

    pub fn with_container_engine(mut self, engine: ContainerEngine) -> Self {
        self.container_engine = engine;
        self
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }
}

type TaskOutcome = std::result::Result<ResultMap, String>;

struct RunningTask {
    job: Arc<Job>,
    handle: JoinHandle<TaskOutcome>,
}

/// Runner executing jobs on the local machine.
///
/// Function payloads run in-process on the blocking thread pool; script and
/// container payloads run as subprocesses with stdout/stderr streamed to
/// files next to the job. A semaphore bounds concurrent execution; the
/// bound is the pool's only admission control.
pub struct LocalPoolRunner {
    config: LocalPoolConfig,
    semaphore: Arc<Semaphore>,
    tasks: Mutex<HashMap<JobId, RunningTask>>,
    shut_down: AtomicBool,
}

impl LocalPoolRunner {
    pub fn new(config: LocalPoolConfig) -> Self {
        let permits = config.max_workers.max(1);
        Self {
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
            tasks: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Number of jobs currently submitted and not yet reaped.
    pub fn outstanding(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Release the pool.
    ///
    /// Safe to call with jobs outstanding: each one is aborted and failed
    /// with a [`Error::RunnerShutdown`] message.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.semaphore.close();

        let drained: Vec<RunningTask> =
            self.tasks.lock().drain().map(|(_, task)| task).collect();
        for task in drained {
            task.handle.abort();
            task.job
                .fail(Error::RunnerShutdown(task.job.id()).to_string());
        }
        tracing::info!("local pool shut down");
    }

    async fn execute(
        config: LocalPoolConfig,
        semaphore: Arc<Semaphore>,
        job: Arc<Job>,
    ) -> TaskOutcome {
        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| "worker pool shut down".to_string())?;
        job.mark_running();

        match job.payload().clone() {
            JobPayload::Function { func, .. } => {
                let args = job.args();
                let joined =
                    tokio::task::spawn_blocking(move || func(&args)).await;
                match joined {
                    Ok(outcome) => outcome,
                    Err(err) => Err(format!("objective panicked: {err}")),
                }
            }
            JobPayload::Script { path } => {
                Self::execute_script(&config, &job, &path).await
            }
            JobPayload::Container { image, command } => {
                Self::execute_container(&config, &job, &image, command.as_deref())
                    .await
            }
        }
    }

    async fn execute_script(
        config: &LocalPoolConfig,
        job: &Arc<Job>,
        script: &Path,
    ) -> TaskOutcome {
        let job_dir = config.scratch_dir.join(format!("job-{}", job.id()));
        let prepared = Self::prepare_job_dir(&job_dir, &job.args()).await?;

        let working_dir = job
            .working_dir()
            .cloned()
            .unwrap_or_else(|| job_dir.clone());

        let interpreter =
            if script.extension().is_some_and(|ext| ext == "sh") {
                "bash"
            } else {
                "python"
            };

        let mut command = tokio::process::Command::new(interpreter);
        command
            .arg(script)
            .envs(job.env_vars())
            .env("JOB_PARAMS_FILE", &prepared.params_file)
            .current_dir(&working_dir)
            .stdout(Self::capture(&job_dir.join("job.out"))?)
            .stderr(Self::capture(&job_dir.join("job.err"))?)
            .stdin(Stdio::null());

        let status = command
            .status()
            .await
            .map_err(|err| format!("failed to spawn {interpreter}: {err}"))?;

        let outcome = if status.success() {
            let mut results =
                Self::read_results(&job_dir, "script produced no result file")
                    .await?;
            Self::collect_output_files(job, &working_dir, &mut results).await;
            Ok(results)
        } else {
            let stderr =
                tokio::fs::read_to_string(job_dir.join("job.err"))
                    .await
                    .unwrap_or_default();
            Err(format!(
                "script failed with {status}: {}",
                stderr.trim()
            ))
        };

        let _ = tokio::fs::remove_dir_all(&job_dir).await;
        outcome
    }

    async fn execute_container(
        config: &LocalPoolConfig,
        job: &Arc<Job>,
        image: &str,
        container_command: Option<&str>,
    ) -> TaskOutcome {
        let job_dir = config.scratch_dir.join(format!("job-{}", job.id()));
        Self::prepare_job_dir(&job_dir, &job.args()).await?;

        let mut argv: Vec<String> = Vec::new();
        match config.container_engine {
            ContainerEngine::Docker => {
                argv.extend(["docker".into(), "run".into(), "--rm".into()]);
                for (key, value) in job.env_vars() {
                    argv.push("-e".into());
                    argv.push(format!("{key}={value}"));
                }
                argv.push("-v".into());
                argv.push(format!("{}:/job", job_dir.display()));
                match job.working_dir() {
                    Some(dir) => {
                        argv.push("-v".into());
                        argv.push(format!("{}:/workdir", dir.display()));
                        argv.push("-w".into());
                        argv.push("/workdir".into());
                    }
                    None => {
                        argv.push("-w".into());
                        argv.push("/job".into());
                    }
                }
                argv.push(image.to_string());
            }
            ContainerEngine::Singularity => {
                argv.extend(["singularity".into(), "run".into()]);
                for (key, value) in job.env_vars() {
                    argv.push("--env".into());
                    argv.push(format!("{key}={value}"));
                }
                argv.push("--bind".into());
                argv.push(format!("{}:/job", job_dir.display()));
                match job.working_dir() {
                    Some(dir) => {
                        argv.push("--bind".into());
                        argv.push(format!("{}:/workdir", dir.display()));
                        argv.push("--pwd".into());
                        argv.push("/workdir".into());
                    }
                    None => {
                        argv.push("--pwd".into());
                        argv.push("/job".into());
                    }
                }
                argv.push(image.to_string());
            }
        }
        if let Some(cmd) = container_command {
            argv.extend(cmd.split_whitespace().map(str::to_string));
        }

        let mut command = tokio::process::Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdout(Self::capture(&job_dir.join("job.out"))?)
            .stderr(Self::capture(&job_dir.join("job.err"))?)
            .stdin(Stdio::null());

        let status = command
            .status()
            .await
            .map_err(|err| format!("failed to spawn {}: {err}", argv[0]))?;

        let outcome = if status.success() {
            let mut results = Self::read_results(
                &job_dir,
                "container produced no result file",
            )
            .await?;
            let working_dir = job
                .working_dir()
                .cloned()
                .unwrap_or_else(|| job_dir.clone());
            Self::collect_output_files(job, &working_dir, &mut results).await;
            Ok(results)
        } else {
            let stderr =
                tokio::fs::read_to_string(job_dir.join("job.err"))
                    .await
                    .unwrap_or_default();
            Err(format!(
                "container failed with {status}: {}",
                stderr.trim()
            ))
        };

        let _ = tokio::fs::remove_dir_all(&job_dir).await;
        outcome
    }

    async fn prepare_job_dir(
        job_dir: &Path,
        args: &ArgMap,
    ) -> std::result::Result<PreparedDir, String> {
        tokio::fs::create_dir_all(job_dir)
            .await
            .map_err(|err| format!("cannot create job dir: {err}"))?;
        let params_file = job_dir.join("params.json");
        let payload = serde_json::to_vec_pretty(args)
            .map_err(|err| format!("cannot serialize parameters: {err}"))?;
        tokio::fs::write(&params_file, payload)
            .await
            .map_err(|err| format!("cannot write parameters: {err}"))?;
        Ok(PreparedDir { params_file })
    }

    fn capture(path: &Path) -> std::result::Result<Stdio, String> {
        std::fs::File::create(path)
            .map(Stdio::from)
            .map_err(|err| format!("cannot open {}: {err}", path.display()))
    }

    async fn read_results(
        job_dir: &Path,
        fallback_note: &str,
    ) -> std::result::Result<ResultMap, String> {
        let result_file = job_dir.join("result.json");
        match tokio::fs::read(&result_file).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|err| format!("malformed result.json: {err}")),
            Err(_) => {
                let stdout =
                    tokio::fs::read_to_string(job_dir.join("job.out"))
                        .await
                        .unwrap_or_else(|_| fallback_note.to_string());
                let mut results = ResultMap::new();
                results.insert(
                    "stdout".to_string(),
                    ParamValue::Text(stdout.trim().to_string()),
                );
                Ok(results)
            }
        }
    }

    async fn collect_output_files(
        job: &Arc<Job>,
        working_dir: &Path,
        results: &mut ResultMap,
    ) {
        for file in job.output_files() {
            let content = tokio::fs::read_to_string(working_dir.join(file))
                .await
                .unwrap_or_else(|_| "File not found".to_string());
            results.insert(
                format!("output_files.{file}"),
                ParamValue::Text(content),
            );
        }
    }
}

struct PreparedDir {
    params_file: PathBuf,
}

#[async_trait]
impl Runner for LocalPoolRunner {
    fn name(&self) -> &str {
        "local-pool"
    }

    async fn run_job(&self, job: &Arc<Job>) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            let err = Error::RunnerShutdown(job.id());
            job.fail(err.to_string());
            return Err(err);
        }

        let span = telemetry::job_submit_span(job.id().to_string(), self.name());
        let _enter = span.enter();

        job.mark_queued();
        let config = self.config.clone();
        let semaphore = Arc::clone(&self.semaphore);
        let task_job = Arc::clone(job);
        let handle = tokio::spawn(async move {
            Self::execute(config, semaphore, task_job).await
        });

        self.tasks.lock().insert(
            job.id(),
            RunningTask {
                job: Arc::clone(job),
                handle,
            },
        );
        Ok(())
    }

    async fn check_job_status(&self, job: &Arc<Job>) -> Result<()> {
        let finished = match self.tasks.lock().get(&job.id()) {
            None => return Ok(()),
            Some(task) => task.handle.is_finished(),
        };
        if !finished {
            return Ok(());
        }

        let task = self.tasks.lock().remove(&job.id());
        let Some(task) = task else {
            return Ok(());
        };

        match task.handle.await {
            Ok(Ok(results)) => {
                job.complete(results);
            }
            Ok(Err(err)) => {
                job.fail(err);
            }
            Err(join_err) if join_err.is_cancelled() => {
                job.mark_cancelled();
            }
            Err(join_err) => {
                job.fail(format!("worker task panicked: {join_err}"));
            }
        }
        Ok(())
    }

    async fn cancel_job(&self, job: &Arc<Job>) -> Result<()> {
        if let Some(task) = self.tasks.lock().remove(&job.id()) {
            task.handle.abort();
        }
        job.mark_cancelled();
        Ok(())
    }
}

impl Drop for LocalPoolRunner {
    fn drop(&mut self) {
        // Outstanding tasks hold their own Arc<Job>; aborting here keeps
        // detached subprocess supervisors from outliving the pool.
        for (_, task) in self.tasks.lock().drain() {
            task.handle.abort();
        }
    }
}
