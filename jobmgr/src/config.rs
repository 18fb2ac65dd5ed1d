use crate::jm::BackendKind;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    env,
    fs::File,
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

/// Resolve `name` against a list of directories, the same way a shell resolves a command.
/// Names containing a path separator are checked as-is.
pub fn lookup_path<P: AsRef<Path>>(name: &str, search: &[P]) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);

        return matches!(check_executable(&path), Ok(true)).then_some(path);
    }

    search
        .iter()
        .map(|dir| dir.as_ref().join(name))
        .find(|candidate| matches!(check_executable(candidate), Ok(true)))
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
    #[error("Failed to read configuration {path}")]
    ReadFailed { path: PathBuf, source: Error },
    #[error("Failed to parse configuration")]
    ParseFailed(#[from] serde_yaml::Error),
    #[error("Configuration contains errors, see log output")]
    PreflightFailed,
    #[error("Job {0} is not defined")]
    UnknownJob(String),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct LauncherConfig {
    pub system: SystemConfig,
    // MPI installation used by all jobs, optional for non-MPI workloads
    #[serde(default)]
    pub mpi: Option<MpiConfig>,
    #[serde(default, alias = "net")]
    pub network: NetworkConfig,
    // Jobs as named launch requests, launched in name order
    #[serde(default)]
    pub jobs: BTreeMap<String, JobConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SystemConfig {
    pub scratch_dir: PathBuf,
    /// Deadline for a single launched command, in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Interval between two batch status queries, in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Upper bound for waiting on a batch job after submission, in seconds
    #[serde(default = "default_max_poll")]
    pub max_poll: u64,
    /// Backends to probe, first usable one wins
    #[serde(default = "default_backends")]
    pub backends: Vec<BackendKind>,
    /// Directories searched for backend tools, falls back to $PATH
    #[serde(default)]
    pub search_path: Option<Vec<PathBuf>>,
    #[serde(default)]
    pub batch_template: Option<PathBuf>,
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default = "default_job_id_prefix")]
    pub job_id_prefix: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    #[serde(default)]
    pub device: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct MpiConfig {
    pub install_dir: PathBuf,
    // detected from install_dir when left out
    #[serde(default)]
    pub implementation: Option<crate::mpi::Implementation>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub tarball: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    pub binary: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub np: usize,
    #[serde(default)]
    pub nnodes: usize,
    #[serde(default)]
    pub launch_args: Vec<String>,
    #[serde(default)]
    pub run_dir: Option<PathBuf>,
    #[serde(default)]
    pub non_blocking: bool,
    #[serde(default)]
    pub device: Option<String>,
}

impl SystemConfig {
    pub fn new(scratch_dir: PathBuf) -> Self {
        Self {
            scratch_dir,
            timeout: default_timeout(),
            poll_interval: default_poll_interval(),
            max_poll: default_max_poll(),
            backends: default_backends(),
            search_path: None,
            batch_template: None,
            partition: None,
            job_id_prefix: default_job_id_prefix(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval)
    }

    pub fn max_poll(&self) -> Duration {
        Duration::from_secs(self.max_poll)
    }

    /// directories to resolve backend tools in
    pub fn search_dirs(&self) -> Vec<PathBuf> {
        match self.search_path {
            Some(ref dirs) => dirs.clone(),
            None => env::var_os("PATH")
                .map(|path| env::split_paths(&path).collect())
                .unwrap_or_default(),
        }
    }
}

impl MpiConfig {
    pub fn new(install_dir: PathBuf) -> Self {
        Self {
            install_dir,
            implementation: None,
            version: None,
            extra_args: Vec::new(),
            url: None,
            tarball: None,
        }
    }

    /// tarball name, either configured or the last segment of the url
    pub fn tarball(&self) -> Option<&str> {
        self.tarball.as_deref().or_else(|| {
            self.url
                .as_deref()
                .and_then(|url| url.trim_end_matches('/').rsplit('/').next())
                .filter(|name| !name.is_empty())
        })
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.install_dir.join("bin")
    }
}

impl LauncherConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let file = File::open(path).map_err(|source| ConfigErrors::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(serde_yaml::from_reader(file)?)
    }

    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if !self.system.scratch_dir.is_dir() {
            error!(
                "system.scratch_dir ({}) does not exist or is not a directory",
                self.system.scratch_dir.to_string_lossy()
            );
            contains_error = true;
        }

        if self.system.timeout == 0 {
            error!("system.timeout cannot be 0, every launched command would be killed right away");
            contains_error = true;
        }

        if self.system.poll_interval == 0 {
            warn!("system.poll_interval is 0, batch status queries will run back to back");
        }

        if self.system.backends.is_empty() {
            warn!("system.backends is empty. Falling back to the native backend");
            self.system.backends = vec![BackendKind::Native];
        } else if !self.system.backends.contains(&BackendKind::Native) {
            warn!("system.backends does not include native, detection may fail");
        }

        if let Some(ref template) = self.system.batch_template {
            if !template.is_file() {
                error!(
                    "system.batch_template ({}) is not a file",
                    template.to_string_lossy()
                );
                contains_error = true;
            }
        }

        if let Some(ref device) = self.network.device {
            if device.trim().is_empty() {
                warn!("network.device is empty. Treating it as unset");
                self.network.device = None;
            }
        }

        if let Some(ref mpi) = self.mpi {
            if !mpi.install_dir.is_dir() {
                error!(
                    "mpi.install_dir ({}) is not a directory",
                    mpi.install_dir.to_string_lossy()
                );
                contains_error = true;
            }
        }

        if self.jobs.is_empty() {
            warn!("No job was defined, nothing will be launched");
        }

        for (name, job) in self.jobs.iter() {
            if job.binary.as_os_str().is_empty() {
                error!("jobs.{name}.binary cannot be empty");
                contains_error = true;
            } else if self.mpi.is_none() && !job.binary.is_file() {
                // MPI jobs may refer to binaries that only exist on compute nodes
                warn!(
                    "jobs.{name}.binary ({}) was not found on this host",
                    job.binary.to_string_lossy()
                );
            }

            if let Some(ref run_dir) = job.run_dir {
                if !run_dir.is_dir() {
                    error!(
                        "jobs.{name}.run_dir ({}) does not exist",
                        run_dir.to_string_lossy()
                    );
                    contains_error = true;
                }
            }

            if job.nnodes > 0 && job.np > 0 && job.nnodes > job.np {
                warn!(
                    "jobs.{name} requests more nodes ({}) than processes ({})",
                    job.nnodes, job.np
                );
            }
        }

        contains_error
    }
}

fn default_timeout() -> u64 {
    600
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_max_poll() -> u64 {
    600
}

fn default_backends() -> Vec<BackendKind> {
    vec![
        BackendKind::Slurm,
        BackendKind::IntelSlurm,
        BackendKind::Prun,
        BackendKind::Native,
    ]
}

fn default_job_id_prefix() -> String {
    String::from("Submitted batch job ")
}
