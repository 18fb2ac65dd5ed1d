pub mod openmpi;

use crate::config::{NetworkConfig, SystemConfig};
use serde::{Deserialize, Serialize};
use std::{ffi::OsString, fmt, path::Path, path::PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MpiError {
    #[error("{0} does not exist, not an installation of this implementation")]
    NotThisImplementation(PathBuf),
    #[error("Failed to run {bin}: {reason}")]
    DetectionFailed { bin: PathBuf, reason: String },
    #[error("Unexpected version output: {0:?}")]
    UnparseableOutput(String),
    #[error("No known MPI implementation found in {0}")]
    UnknownImplementation(PathBuf),
    #[error("Invalid network device {0:?}")]
    InvalidDevice(String),
}

/// Supported MPI implementations
/// (an enum instead of trait objects, there is a small, closed set of them)
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Implementation {
    OpenMpi,
}

impl fmt::Display for Implementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenMpi => f.write_str(openmpi::ID),
        }
    }
}

impl Implementation {
    pub const ALL: [Implementation; 1] = [Implementation::OpenMpi];

    /// Append implementation specific launcher flags to `existing`
    pub fn extra_launch_args(
        &self,
        system: &SystemConfig,
        network: &NetworkConfig,
        existing: Vec<String>,
    ) -> Result<Vec<String>, MpiError> {
        match self {
            Self::OpenMpi => openmpi::extra_launch_args(system, network, existing),
        }
    }

    /// Find out whether `dir` holds this implementation and which version it is
    pub fn detect_version(
        &self,
        dir: &Path,
        env: Option<Vec<(OsString, OsString)>>,
    ) -> Result<String, MpiError> {
        match self {
            Self::OpenMpi => openmpi::detect_from_dir(dir, env),
        }
    }

    /// launcher binary name inside the installation's bin directory
    pub fn launcher(&self) -> &'static str {
        match self {
            Self::OpenMpi => "mpirun",
        }
    }
}

/// Probe every known implementation against `dir`, first match wins
pub fn detect_from_dir(
    dir: &Path,
    env: Option<Vec<(OsString, OsString)>>,
) -> Result<(Implementation, String), MpiError> {
    let mut last_error = None;

    for implementation in Implementation::ALL {
        match implementation.detect_version(dir, env.clone()) {
            Ok(version) => return Ok((implementation, version)),
            Err(MpiError::NotThisImplementation(path)) => {
                debug!("{implementation} not found at {}", path.to_string_lossy());
            }
            Err(error) => last_error = Some(error),
        }
    }

    Err(last_error.unwrap_or_else(|| MpiError::UnknownImplementation(dir.to_path_buf())))
}
