pub mod native;
pub mod prun;
pub mod slurm;

use crate::{
    config::{NetworkConfig, SystemConfig},
    exec::{self, Deadline, ExecResult, LaunchCommand},
    job::{Job, JobError},
    mpi::MpiError,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{fmt, io, num::ParseIntError, path::PathBuf};
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Debug, Error)]
pub enum JobManagerError {
    #[error("No usable job manager among [{0}]")]
    DetectionFailure(String),
    #[error("Application binary is undefined")]
    UndefinedBinary,
    #[error("Working directory {0} does not exist")]
    MissingWorkDir(PathBuf),
    #[error("Launcher {0} not found")]
    MissingLauncher(PathBuf),
    #[error("Unable to get launcher arguments")]
    ArgConstructionFailed(#[from] MpiError),
    #[error("Unable to generate batch script {path}")]
    BatchScript { path: PathBuf, source: io::Error },
    #[error("Unable to get job ID from {output:?}")]
    JobIdParseFailed {
        output: String,
        source: ParseIntError,
    },
    #[error("Job has no ID, the backend cannot be queried for it")]
    NoJobId,
    #[error("Status query failed: {0}")]
    StatusQueryFailed(String),
    #[error(transparent)]
    Job(#[from] JobError),
}

/// Known job management backends
#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// mpirun straight from the MPI installation
    Native,
    /// Slurm through sbatch
    Slurm,
    /// Slurm through the bsub front-end
    IntelSlurm,
    /// third party resource manager launcher
    Prun,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Native => "native",
            Self::Slurm => "slurm",
            Self::IntelSlurm => "intel-slurm",
            Self::Prun => "prun",
        })
    }
}

impl BackendKind {
    /// Check whether the backend is usable with the tools on `search`
    pub fn probe(&self, search: &[PathBuf]) -> Option<JobManager> {
        match self {
            Self::Native => Some(native::detect()),
            Self::Slurm => slurm::detect(*self, "sbatch", search),
            Self::IntelSlurm => slurm::detect(*self, "bsub", search),
            Self::Prun => prun::detect(search),
        }
    }
}

/// What a backend can do, unbound operations are simply not there
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub submit: bool,
    pub load: bool,
    pub job_status: bool,
    pub job_count: bool,
    pub post_run: bool,
}

/// Scheduler view of a submitted job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completing,
    /// completed or no longer known to the queue
    Finished,
    Failed(String),
    Other(String),
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed(_))
    }
}

/// A detected backend, immutable once selected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobManager {
    pub kind: BackendKind,
    /// the backend's own submission tool, resolved during detection
    pub bin_path: Option<PathBuf>,
    /// tool used for status and job count queries
    pub query_path: Option<PathBuf>,
    pub cmd_args: Vec<String>,
}

impl JobManager {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            bin_path: None,
            query_path: None,
            cmd_args: Vec::new(),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        match self.kind {
            BackendKind::Native => Capabilities {
                submit: true,
                load: true,
                job_status: false,
                job_count: false,
                post_run: false,
            },
            BackendKind::Prun => Capabilities {
                submit: true,
                load: false,
                job_status: false,
                job_count: false,
                post_run: false,
            },
            BackendKind::Slurm | BackendKind::IntelSlurm => Capabilities {
                submit: true,
                load: true,
                job_status: true,
                job_count: true,
                post_run: true,
            },
        }
    }

    pub fn load(&self, system: &SystemConfig) -> Option<Result<(), JobManagerError>> {
        match self.kind {
            BackendKind::Native => Some(Ok(())),
            BackendKind::Prun => None,
            BackendKind::Slurm | BackendKind::IntelSlurm => Some(slurm::load(self, system)),
        }
    }

    /// Build the command submitting `job` and bind its output accessors
    #[instrument(level = "debug", skip_all, fields(backend = %self.kind, job = %job.name))]
    pub fn prepare(
        &self,
        job: &mut Job,
        system: &SystemConfig,
        network: &NetworkConfig,
    ) -> Result<LaunchCommand, JobManagerError> {
        let command = match self.kind {
            BackendKind::Native => native::prepare(job, system, network),
            BackendKind::Prun => prun::prepare(self, job, system),
            BackendKind::Slurm | BackendKind::IntelSlurm => {
                slurm::prepare(self, job, system, network)
            }
        }?;

        info!(
            "* Command object for '{}' is ready",
            command.command_line()
        );

        Ok(command)
    }

    /// Run a prepared command and record what the backend reported about the job
    #[instrument(level = "debug", skip_all, fields(backend = %self.kind, job = %job.name))]
    pub fn submit(
        &self,
        job: &mut Job,
        command: &LaunchCommand,
        system: &SystemConfig,
        deadline: Deadline,
    ) -> Result<ExecResult, JobManagerError> {
        let result = exec::run(command, deadline);

        if let BackendKind::Slurm | BackendKind::IntelSlurm = self.kind {
            slurm::record_submission(job, &result, system)?;
        }

        Ok(result)
    }

    pub fn job_status(
        &self,
        job: &Job,
        system: &SystemConfig,
    ) -> Option<Result<JobStatus, JobManagerError>> {
        match self.kind {
            BackendKind::Native | BackendKind::Prun => None,
            BackendKind::Slurm | BackendKind::IntelSlurm => {
                Some(slurm::job_status(self, job, system))
            }
        }
    }

    pub fn job_count(&self, system: &SystemConfig) -> Option<Result<usize, JobManagerError>> {
        match self.kind {
            BackendKind::Native | BackendKind::Prun => None,
            BackendKind::Slurm | BackendKind::IntelSlurm => Some(slurm::job_count(self, system)),
        }
    }

    /// Wait for a submitted job to leave the backend
    pub fn post_run(
        &self,
        job: &Job,
        system: &SystemConfig,
    ) -> Option<Result<(), JobManagerError>> {
        match self.kind {
            BackendKind::Native | BackendKind::Prun => None,
            BackendKind::Slurm | BackendKind::IntelSlurm => Some(slurm::post_run(self, job, system)),
        }
    }
}

/// Probes backends in a fixed order, the first usable one wins
#[derive(Debug, Clone)]
pub struct Detector {
    order: Vec<BackendKind>,
    search: Vec<PathBuf>,
}

impl Detector {
    pub fn new(order: Vec<BackendKind>, search: Vec<PathBuf>) -> Self {
        Self { order, search }
    }

    pub fn from_system(system: &SystemConfig) -> Self {
        Self::new(system.backends.clone(), system.search_dirs())
    }

    #[instrument(level = "debug", skip(self))]
    pub fn detect(&self) -> Result<JobManager, JobManagerError> {
        for kind in self.order.iter() {
            if let Some(jobmgr) = kind.probe(&self.search) {
                info!("Selected job manager: {kind}");

                return Ok(jobmgr);
            }

            debug!("{kind} is not usable, trying the next backend");
        }

        Err(JobManagerError::DetectionFailure(
            self.order.iter().join(", "),
        ))
    }
}

// checks shared by every backend
fn check_binary(job: &Job) -> Result<(), JobManagerError> {
    if job.app.bin_path.as_os_str().is_empty() {
        Err(JobManagerError::UndefinedBinary)
    } else {
        Ok(())
    }
}

fn check_run_dir(job: &Job) -> Result<Option<PathBuf>, JobManagerError> {
    match job.run_dir {
        Some(ref dir) if !dir.is_dir() => Err(JobManagerError::MissingWorkDir(dir.clone())),
        ref run_dir => Ok(run_dir.clone()),
    }
}

#[cfg(test)]
mod jm_test;
