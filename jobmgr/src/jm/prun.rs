use super::{check_binary, check_run_dir, BackendKind, JobManager, JobManagerError};
use crate::{
    config::{lookup_path, SystemConfig},
    exec::LaunchCommand,
    job::{Job, OutputSource},
};
use std::path::PathBuf;
use tracing::info;

const PRUN: &str = "prun";
// variable handed to the launched processes explicitly
const PASSTHROUGH_VAR: &str = "PATH";

pub fn detect(search: &[PathBuf]) -> Option<JobManager> {
    match lookup_path(PRUN, search) {
        Some(bin_path) => Some(JobManager {
            bin_path: Some(bin_path),
            ..JobManager::new(BackendKind::Prun)
        }),
        None => {
            info!("* prun not detected");
            None
        }
    }
}

/// `prun <launch args> -x PATH <binary> <binary args>`
pub fn prepare(
    jobmgr: &JobManager,
    job: &mut Job,
    system: &SystemConfig,
) -> Result<LaunchCommand, JobManagerError> {
    check_binary(job)?;
    let exec_dir = check_run_dir(job)?;

    let bin_path = jobmgr
        .bin_path
        .clone()
        .or_else(|| lookup_path(PRUN, &system.search_dirs()))
        .ok_or_else(|| JobManagerError::MissingLauncher(PathBuf::from(PRUN)))?;

    let mut command = LaunchCommand::new(bin_path)
        .args(jobmgr.cmd_args.iter().cloned())
        .args(job.args.iter().cloned())
        .arg("-x")
        .arg(PASSTHROUGH_VAR)
        .arg(job.app.bin_path.to_string_lossy())
        .args(job.app.args.iter().cloned());
    command.exec_dir = exec_dir;

    job.bind(OutputSource::Captured)?;

    Ok(command)
}
