/// Local bounded worker pool.
///
/// Executes function payloads in-process and script/container payloads as
/// subprocesses; see [`LocalPoolRunner`].
pub mod local;

/// Batch-cluster submission via rendered `sbatch` scripts; see
/// [`SlurmRunner`].
pub mod slurm;

/// Distributed grid workload submission with workspace snapshots and
/// dataset registration; see [`GridRunner`].
pub mod grid;

pub use grid::{GridClient, GridConfig, GridRunner, SnapshotRef, TaskSpec, WorkflowSpec};
pub use local::{ContainerEngine, LocalPoolConfig, LocalPoolRunner};
pub use slurm::{BatchSystem, SlurmCli, SlurmConfig, SlurmRunner};
