//! The default job manager: mpirun from the MPI installation, started directly.

use super::{check_binary, check_run_dir, BackendKind, JobManager, JobManagerError};
use crate::{
    config::{NetworkConfig, SystemConfig},
    exec::LaunchCommand,
    job::{Job, OutputSource},
    mpi::MpiError,
};
use tracing::debug;

/// Native is always usable, mpirun itself is only checked once a job is submitted
pub fn detect() -> JobManager {
    JobManager::new(BackendKind::Native)
}

/// network configuration for `job`, its own device hint wins unless it is empty
pub(crate) fn job_network(job: &Job, network: &NetworkConfig) -> NetworkConfig {
    match job.device {
        Some(ref device) if !device.is_empty() => NetworkConfig {
            device: Some(device.clone()),
        },
        _ => network.clone(),
    }
}

/// Command line starting `job` on the current allocation:
/// `mpirun [-np N] <mpi args> <launch args> <binary> <binary args>`
pub fn launch_command(
    job: &Job,
    system: &SystemConfig,
    network: &NetworkConfig,
) -> Result<LaunchCommand, JobManagerError> {
    let application = job.app.bin_path.to_string_lossy().into_owned();

    let mpi = match job.mpi {
        Some(ref mpi) => mpi,
        None => {
            if !job.args.is_empty() {
                debug!("Not an MPI job, ignoring launch arguments {:?}", job.args);
            }

            return Ok(LaunchCommand::new(application).args(job.app.args.iter().cloned()));
        }
    };

    let implementation = mpi
        .implementation
        .ok_or_else(|| MpiError::UnknownImplementation(mpi.install_dir.clone()))?;

    let mut command = LaunchCommand::new(mpi.bin_dir().join(implementation.launcher()));
    if job.np > 0 {
        command = command.arg("-np").arg(job.np.to_string());
    }

    let existing = mpi.extra_args.iter().chain(job.args.iter()).cloned().collect();
    let launch_args =
        implementation.extra_launch_args(system, &job_network(job, network), existing)?;

    Ok(command
        .args(launch_args)
        .arg(application)
        .args(job.app.args.iter().cloned()))
}

pub fn prepare(
    job: &mut Job,
    system: &SystemConfig,
    network: &NetworkConfig,
) -> Result<LaunchCommand, JobManagerError> {
    check_binary(job)?;
    let exec_dir = check_run_dir(job)?;

    let mut command = launch_command(job, system, network)?;
    if job.is_mpi() && !command.bin_path.is_file() {
        return Err(JobManagerError::MissingLauncher(command.bin_path));
    }
    command.exec_dir = exec_dir;

    job.bind(OutputSource::Captured)?;

    Ok(command)
}
