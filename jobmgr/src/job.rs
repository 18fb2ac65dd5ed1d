use crate::config::{JobConfig, MpiConfig};
use once_cell::sync::OnceCell;
use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job output was read before a backend bound its accessors")]
    Unbound,
    #[error("Job accessors are already bound")]
    AlreadyBound,
    #[error("Job cannot move from {from} to {to}")]
    InvalidTransition { from: JobState, to: JobState },
    #[error("Failed to clean up {path}")]
    Io { path: PathBuf, source: io::Error },
}

/// Steps a job goes through inside the launcher, strictly in this order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobState {
    #[default]
    Created,
    BackendSelected,
    CommandBuilt,
    Submitted,
    BlockingCompleted,
    NonBlockingPending,
    OutputBound,
    Done,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Where the final output of a job comes from, bound by the submitting backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSource {
    /// the streams captured while the command ran
    Captured,
    /// captured streams followed by the log files a batch system wrote
    BatchLogs { output: PathBuf, error: PathBuf },
}

/// The application a job starts
#[derive(Debug, Clone, Default)]
pub struct App {
    pub bin_path: PathBuf,
    pub args: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Job {
    pub id: Option<u64>,
    pub name: String,
    pub app: App,
    pub np: usize,
    pub nnodes: usize,
    /// extra arguments for the launcher itself
    pub args: Vec<String>,
    pub run_dir: Option<PathBuf>,
    pub non_blocking: bool,
    /// network device hint, overrides the launcher wide one
    pub device: Option<String>,
    pub mpi: Option<Arc<MpiConfig>>,

    pub batch_script: Option<PathBuf>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,

    state: JobState,
    source: OnceCell<OutputSource>,
}

impl Job {
    pub fn new<P: Into<PathBuf>>(bin_path: P) -> Self {
        Self {
            app: App {
                bin_path: bin_path.into(),
                args: Vec::new(),
            },
            ..Default::default()
        }
    }

    pub fn from_config(name: &str, config: &JobConfig) -> Self {
        Self {
            name: name.to_string(),
            app: App {
                bin_path: config.binary.clone(),
                args: config.args.clone(),
            },
            np: config.np,
            nnodes: config.nnodes,
            args: config.launch_args.clone(),
            run_dir: config.run_dir.clone(),
            non_blocking: config.non_blocking,
            device: config.device.clone(),
            ..Default::default()
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Move the job forward, a job never goes back to an earlier state
    pub(crate) fn advance(&mut self, next: JobState) -> Result<(), JobError> {
        if next <= self.state {
            return Err(JobError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }

        trace!(job = %self.name, "{} -> {}", self.state, next);
        self.state = next;

        Ok(())
    }

    /// Bind the output accessors, only the first bind counts
    pub fn bind(&self, source: OutputSource) -> Result<(), JobError> {
        self.source.set(source).map_err(|_| JobError::AlreadyBound)
    }

    pub fn output_source(&self) -> Option<&OutputSource> {
        self.source.get()
    }

    /// Final standard output, including whatever the backend collected on the side
    pub fn output(&self) -> Result<Vec<u8>, JobError> {
        match self.source.get().ok_or(JobError::Unbound)? {
            OutputSource::Captured => Ok(self.stdout.clone()),
            OutputSource::BatchLogs { output, .. } => Ok(with_log(&self.stdout, output)),
        }
    }

    /// Final standard error, including whatever the backend collected on the side
    pub fn error(&self) -> Result<Vec<u8>, JobError> {
        match self.source.get().ok_or(JobError::Unbound)? {
            OutputSource::Captured => Ok(self.stderr.clone()),
            OutputSource::BatchLogs { error, .. } => Ok(with_log(&self.stderr, error)),
        }
    }

    pub fn is_mpi(&self) -> bool {
        self.mpi.is_some()
    }

    /// Remove every file the job created on the way, missing files are not an error
    pub fn clean_up(&mut self) -> Result<(), JobError> {
        let mut paths = Vec::new();

        if let Some(script) = self.batch_script.take() {
            paths.push(script);
        }
        if let Some(OutputSource::BatchLogs { output, error }) = self.source.get() {
            paths.push(output.clone());
            paths.push(error.clone());
        }

        for path in paths {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed {}", path.to_string_lossy()),
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(JobError::Io { path, source }),
            }
        }

        Ok(())
    }
}

fn with_log(captured: &[u8], log: &Path) -> Vec<u8> {
    let mut buffer = captured.to_vec();

    match fs::read(log) {
        Ok(content) => buffer.extend_from_slice(&content),
        Err(error) => warn!(
            error = ?error,
            "Failed to read batch log {}",
            log.to_string_lossy()
        ),
    }

    buffer
}

#[cfg(test)]
mod job_test;
