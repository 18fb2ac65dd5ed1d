use super::MpiError;
use crate::{
    config::{NetworkConfig, SystemConfig},
    exec::{self, Deadline, LaunchCommand},
};
use std::{env, ffi::OsString, path::Path, time::Duration};
use tracing::{debug, error, instrument, warn};

/// Tag used to refer to the MPI version in batch templates
pub const VERSION_TAG: &str = "OMPIVERSION";
/// Tag used to refer to the MPI URL in batch templates
pub const URL_TAG: &str = "OMPIURL";
/// Tag used to refer to the MPI tarball in batch templates
pub const TARBALL_TAG: &str = "OMPITARBALL";

pub const ID: &str = "openmpi";

const INFO_BIN: &str = "ompi_info";
const OUTPUT_PREFIX: &str = "Open MPI";
const VERSION_MARKER: &str = "v";
const DETECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Prefer UCX over the legacy openib transport, and pin UCX to a device if one is given
pub fn extra_launch_args(
    _system: &SystemConfig,
    network: &NetworkConfig,
    mut args: Vec<String>,
) -> Result<Vec<String>, MpiError> {
    args.extend(["--mca", "btl", "^openib"].map(String::from));
    args.extend(["--mca", "pml", "ucx"].map(String::from));

    // an empty hint means no hint, UCX picks the device itself
    if let Some(device) = network.device.as_deref().filter(|device| !device.is_empty()) {
        if device.contains(char::is_whitespace) {
            return Err(MpiError::InvalidDevice(device.to_string()));
        }

        args.push(String::from("-x"));
        args.push(format!("UCX_NET_DEVICES={device}"));
    }

    Ok(args)
}

/// Extract the bare version from `ompi_info --version` output
pub fn parse_version_output(output: &str) -> Result<String, MpiError> {
    let first = output.lines().next().unwrap_or_default().trim_end();

    let version = first
        .strip_prefix(OUTPUT_PREFIX)
        .ok_or_else(|| MpiError::UnparseableOutput(first.to_string()))?
        .trim_start();
    let version = version.strip_prefix(VERSION_MARKER).unwrap_or(version);

    if version.is_empty() {
        Err(MpiError::UnparseableOutput(first.to_string()))
    } else {
        Ok(version.to_string())
    }
}

fn prepend_env(key: &str, dir: &Path) -> (OsString, OsString) {
    let mut paths = vec![dir.to_path_buf()];
    if let Some(current) = env::var_os(key) {
        paths.extend(env::split_paths(&current));
    }

    let joined = env::join_paths(paths).unwrap_or_else(|_| dir.as_os_str().to_owned());

    (OsString::from(key), joined)
}

/// Figure out which version of Open MPI is installed in `dir`
#[instrument(level = "debug", skip(env))]
pub fn detect_from_dir(
    dir: &Path,
    env: Option<Vec<(OsString, OsString)>>,
) -> Result<String, MpiError> {
    let bin_dir = dir.join("bin");
    let target = bin_dir.join(INFO_BIN);

    if !target.is_file() {
        return Err(MpiError::NotThisImplementation(target));
    }

    let mut command = LaunchCommand::new(&target).arg("--version");
    command.exec_dir = Some(bin_dir.clone());
    command.env = env.unwrap_or_else(|| {
        vec![
            prepend_env("LD_LIBRARY_PATH", &dir.join("lib")),
            prepend_env("PATH", &bin_dir),
        ]
    });

    let mut result = exec::run(&command, Deadline::after(DETECT_TIMEOUT));

    if !result.success() {
        // relocated installations only work with OPAL_PREFIX pointing at them
        debug!(
            stdout = %result.stdout_lossy(),
            stderr = %result.stderr_lossy(),
            "{INFO_BIN} failed, retrying with OPAL_PREFIX={}",
            dir.to_string_lossy()
        );
        command
            .env
            .push((OsString::from("OPAL_PREFIX"), dir.as_os_str().to_owned()));
        result = exec::run(&command, Deadline::after(DETECT_TIMEOUT));

        if !result.success() {
            error!(
                stdout = %result.stdout_lossy(),
                stderr = %result.stderr_lossy(),
                "Unable to run {INFO_BIN}"
            );

            let reason = match result.error {
                Some(ref error) => error.to_string(),
                None => String::from("deadline exceeded"),
            };

            return Err(MpiError::DetectionFailed {
                bin: target,
                reason,
            });
        }
    }

    parse_version_output(&result.stdout_lossy()).map_err(|error| {
        warn!(error = ?error, "Failed to parse {INFO_BIN} output");
        error
    })
}

#[cfg(test)]
mod openmpi_test;
