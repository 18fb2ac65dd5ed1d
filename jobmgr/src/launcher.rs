use crate::{
    config::{ConfigErrors, LauncherConfig, MpiConfig, NetworkConfig, SystemConfig},
    exec::{Deadline, ExecError},
    jm::{BackendKind, Detector, JobManager, JobManagerError, JobStatus},
    job::{Job, JobError, JobState},
    mpi,
};
use std::{
    borrow::Cow,
    io::{self, Write},
    process::ExitStatus,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Configuration error")]
    Config(#[from] ConfigErrors),
    #[error("Job manager error")]
    JobManager(#[from] JobManagerError),
    #[error("Job output error")]
    Job(#[from] JobError),
    #[error("Job failed: {reason}")]
    SubmissionFailed { reason: String },
    #[error("Job timed out after {0:?}")]
    DeadlineExceeded(Duration),
}

/// Everything the launcher needs, built by the caller
#[derive(Debug, Clone)]
pub struct LauncherSettings {
    pub system: SystemConfig,
    pub mpi: Option<MpiConfig>,
    pub network: NetworkConfig,
    // skips detection when set
    pub backend: Option<BackendKind>,
}

impl From<LauncherConfig> for LauncherSettings {
    fn from(config: LauncherConfig) -> Self {
        Self {
            system: config.system,
            mpi: config.mpi,
            network: config.network,
            backend: None,
        }
    }
}

/// Normalized result of a launched job
#[derive(Debug)]
pub struct LaunchReport {
    pub job_id: Option<u64>,
    pub state: JobState,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub status: Option<ExitStatus>,
    pub error: Option<ExecError>,
    pub deadline_exceeded: bool,
    pub timeout: Duration,
    pub runtime: Duration,
}

impl LaunchReport {
    pub fn passed(&self) -> bool {
        self.error.is_none() && !self.deadline_exceeded
    }

    /// Classify the run, the streams stay on the report either way
    pub fn check(&self) -> Result<(), LaunchError> {
        if self.deadline_exceeded {
            Err(LaunchError::DeadlineExceeded(self.timeout))
        } else if let Some(ref error) = self.error {
            Err(LaunchError::SubmissionFailed {
                reason: error.to_string(),
            })
        } else {
            Ok(())
        }
    }

    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }

    /// Print both streams under a header naming the job, stderr only when there is some
    pub fn write_to<W: Write>(&self, name: &str, out: &mut W) -> io::Result<()> {
        writeln!(out, "==> {name} <==")?;
        out.write_all(&self.stdout)?;

        if !self.stderr.is_empty() {
            writeln!(out, "--> {name} (stderr) <--")?;
            out.write_all(&self.stderr)?;
        }

        out.flush()
    }
}

/// Facade tying detection, command building, execution and output collection together.
/// Immutable once loaded, jobs can be run from several threads at once.
#[derive(Debug)]
pub struct Launcher {
    system: SystemConfig,
    network: NetworkConfig,
    mpi: Option<Arc<MpiConfig>>,
    jobmgr: JobManager,
}

impl Launcher {
    #[instrument(level = "info", skip_all)]
    pub fn load(settings: LauncherSettings) -> Result<Self, LaunchError> {
        let LauncherSettings {
            system,
            mpi,
            network,
            backend,
        } = settings;

        let jobmgr = match backend {
            Some(kind) => kind
                .probe(&system.search_dirs())
                .ok_or_else(|| JobManagerError::DetectionFailure(kind.to_string()))?,
            None => Detector::from_system(&system).detect()?,
        };

        if let Some(result) = jobmgr.load(&system) {
            result?;
        }

        let mpi = mpi.map(|mut mpi| {
            if mpi.implementation.is_none() || mpi.version.is_none() {
                match mpi::detect_from_dir(&mpi.install_dir, None) {
                    Ok((implementation, version)) => {
                        info!(
                            "Detected {implementation} {version} in {}",
                            mpi.install_dir.to_string_lossy()
                        );
                        mpi.implementation.get_or_insert(implementation);
                        mpi.version.get_or_insert(version);
                    }
                    Err(error) => warn!(
                        error = ?error,
                        "Unable to detect the MPI installation in {}",
                        mpi.install_dir.to_string_lossy()
                    ),
                }
            }

            Arc::new(mpi)
        });

        Ok(Self {
            system,
            network,
            mpi,
            jobmgr,
        })
    }

    pub fn backend(&self) -> &JobManager {
        &self.jobmgr
    }

    pub fn system(&self) -> &SystemConfig {
        &self.system
    }

    pub fn mpi(&self) -> Option<&MpiConfig> {
        self.mpi.as_deref()
    }

    /// Launch `job` and wait for it as far as its blocking mode asks for
    #[instrument(level = "info", skip_all, fields(job = %job.name, backend = %self.jobmgr.kind))]
    pub fn run(&self, job: &mut Job) -> Result<LaunchReport, LaunchError> {
        // jobs are launched once, a finished job has to be rebuilt
        job.advance(JobState::BackendSelected)?;
        if job.mpi.is_none() {
            job.mpi = self.mpi.clone();
        }

        let command = self.jobmgr.prepare(job, &self.system, &self.network)?;
        job.advance(JobState::CommandBuilt)?;

        // the deadline starts before anything is spawned
        let deadline = Deadline::after(self.system.timeout());
        let result = self.jobmgr.submit(job, &command, &self.system, deadline)?;
        job.advance(JobState::Submitted)?;

        if result.error.is_some() {
            error!(
                stdout = %result.stdout_lossy(),
                stderr = %result.stderr_lossy(),
                "Command failed: {:?}", result.error
            );
        }
        if result.deadline_exceeded {
            error!(
                stdout = %result.stdout_lossy(),
                stderr = %result.stderr_lossy(),
                "Command timed out"
            );
        }

        job.stdout = result.stdout;
        job.stderr = result.stderr;

        if job.non_blocking {
            job.advance(JobState::NonBlockingPending)?;
        } else {
            // nothing to wait for once the submission itself failed
            if result.error.is_none() && !result.deadline_exceeded {
                if let Some(finalized) = self.jobmgr.post_run(job, &self.system) {
                    finalized?;
                }
            }
            job.advance(JobState::BlockingCompleted)?;
        }

        let stdout = job.output()?;
        let stderr = job.error()?;
        job.advance(JobState::OutputBound)?;

        let report = LaunchReport {
            job_id: job.id,
            state: JobState::Done,
            stdout,
            stderr,
            status: result.status,
            error: result.error,
            deadline_exceeded: result.deadline_exceeded,
            timeout: deadline.timeout(),
            runtime: result.runtime,
        };
        job.advance(JobState::Done)?;

        Ok(report)
    }

    pub fn job_status(&self, job: &Job) -> Option<Result<JobStatus, LaunchError>> {
        self.jobmgr
            .job_status(job, &self.system)
            .map(|status| status.map_err(LaunchError::from))
    }

    pub fn job_count(&self) -> Option<Result<usize, LaunchError>> {
        self.jobmgr
            .job_count(&self.system)
            .map(|count| count.map_err(LaunchError::from))
    }
}
