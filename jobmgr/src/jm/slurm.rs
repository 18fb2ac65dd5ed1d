//! Slurm style batch submission, for both `sbatch` and the `bsub` front-end.
//!
//! Jobs are turned into a batch script in the scratch directory. The script is submitted
//! with `-W` so the submission only returns once the job is done, unless the job asks to
//! be non-blocking. Job output ends up in log files next to the script.

use super::{
    check_binary, check_run_dir, native, BackendKind, JobManager, JobManagerError, JobStatus,
};
use crate::{
    config::{lookup_path, NetworkConfig, SystemConfig},
    exec::{self, Deadline, ExecResult, LaunchCommand},
    job::{Job, OutputSource},
    mpi::openmpi,
};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, warn};

const QUERY_TOOL: &str = "squeue";
const BLOCKING_FLAG: &str = "-W";
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

pub const JOBNAME_TAG: &str = "#JOBNAME";
pub const NP_TAG: &str = "#NP";
pub const NNODES_TAG: &str = "#NNODES";
pub const OUTPUT_TAG: &str = "#OUTPUT";
pub const ERROR_TAG: &str = "#ERROR";
pub const RUNDIR_TAG: &str = "#RUNDIR";
pub const DIRECTIVES_TAG: &str = "#DIRECTIVES";
pub const CMD_TAG: &str = "#CMD";

pub const DEFAULT_TEMPLATE: &str = "#!/bin/bash
#DIRECTIVES

# MPI: OMPIVERSION (OMPITARBALL from OMPIURL)
#CMD
";

pub fn detect(kind: BackendKind, submit_tool: &str, search: &[PathBuf]) -> Option<JobManager> {
    let bin_path = match lookup_path(submit_tool, search) {
        Some(path) => path,
        None => {
            info!("* {kind} not detected");
            return None;
        }
    };

    // other schedulers ship a tool with the same name, squeue confirms this is Slurm
    let query_path = match lookup_path(QUERY_TOOL, search) {
        Some(path) => path,
        None => {
            info!("* {kind} not detected (no {QUERY_TOOL} command available)");
            return None;
        }
    };

    Some(JobManager {
        bin_path: Some(bin_path),
        query_path: Some(query_path),
        ..JobManager::new(kind)
    })
}

pub fn load(_jobmgr: &JobManager, system: &SystemConfig) -> Result<(), JobManagerError> {
    if system.scratch_dir.is_dir() {
        Ok(())
    } else {
        Err(JobManagerError::MissingWorkDir(system.scratch_dir.clone()))
    }
}

/// Replace every tag in `template` with its value in a single pass, values are not re-scanned
pub fn render(template: &str, tags: &[(&str, String)]) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    'outer: while !rest.is_empty() {
        for (tag, value) in tags {
            if let Some(tail) = rest.strip_prefix(tag) {
                rendered.push_str(value);
                rest = tail;
                continue 'outer;
            }
        }

        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            rendered.push(c);
        }
        rest = chars.as_str();
    }

    rendered
}

fn directives(job: &Job, system: &SystemConfig, output: &Path, error: &Path) -> String {
    let mut lines = Vec::new();

    if !job.name.is_empty() {
        lines.push(format!("#SBATCH --job-name={}", job.name));
    }
    if job.nnodes > 0 {
        lines.push(format!("#SBATCH --nodes={}", job.nnodes));
    }
    if job.np > 0 {
        lines.push(format!("#SBATCH --ntasks={}", job.np));
    }
    if let Some(ref partition) = system.partition {
        lines.push(format!("#SBATCH --partition={partition}"));
    }
    lines.push(format!("#SBATCH --output={}", output.to_string_lossy()));
    lines.push(format!("#SBATCH --error={}", error.to_string_lossy()));
    if let Some(ref run_dir) = job.run_dir {
        lines.push(format!("#SBATCH --chdir={}", run_dir.to_string_lossy()));
    }

    lines.join("\n")
}

/// Write the batch script for `job` into the scratch directory, returns the log paths
fn generate_job_script(
    job: &mut Job,
    system: &SystemConfig,
    network: &NetworkConfig,
) -> Result<(PathBuf, PathBuf), JobManagerError> {
    let template = match system.batch_template {
        Some(ref path) => {
            fs::read_to_string(path).map_err(|source| JobManagerError::BatchScript {
                path: path.clone(),
                source,
            })?
        }
        None => DEFAULT_TEMPLATE.to_string(),
    };

    let script = tempfile::Builder::new()
        .prefix("hpcjm-")
        .suffix(".sh")
        .tempfile_in(&system.scratch_dir)
        .map_err(|source| JobManagerError::BatchScript {
            path: system.scratch_dir.clone(),
            source,
        })?;
    let output = script.path().with_extension("out");
    let error = script.path().with_extension("err");

    let command = native::launch_command(job, system, network)?;
    let mpi = job.mpi.as_deref();
    let run_dir = job
        .run_dir
        .clone()
        .unwrap_or_else(|| system.scratch_dir.clone());

    let tags = [
        (JOBNAME_TAG, job.name.clone()),
        (NNODES_TAG, job.nnodes.to_string()),
        (NP_TAG, job.np.to_string()),
        (OUTPUT_TAG, output.to_string_lossy().into_owned()),
        (ERROR_TAG, error.to_string_lossy().into_owned()),
        (RUNDIR_TAG, run_dir.to_string_lossy().into_owned()),
        (DIRECTIVES_TAG, directives(job, system, &output, &error)),
        (CMD_TAG, command.command_line()),
        (
            openmpi::VERSION_TAG,
            mpi.and_then(|mpi| mpi.version.clone()).unwrap_or_default(),
        ),
        (
            openmpi::URL_TAG,
            mpi.and_then(|mpi| mpi.url.clone()).unwrap_or_default(),
        ),
        (
            openmpi::TARBALL_TAG,
            mpi.and_then(|mpi| mpi.tarball())
                .map(String::from)
                .unwrap_or_default(),
        ),
    ];
    let content = render(&template, &tags);

    let (mut file, path) = script
        .keep()
        .map_err(|error| JobManagerError::BatchScript {
            path: error.file.path().to_path_buf(),
            source: error.error,
        })?;
    // owned by the job from here on, even if writing fails
    job.batch_script = Some(path.clone());

    file.write_all(content.as_bytes())
        .map_err(|source| JobManagerError::BatchScript { path, source })?;

    debug!("Batch script:\n{content}");

    Ok((output, error))
}

/// `sbatch [-W] <script>`, run from the job's run directory
pub fn prepare(
    jobmgr: &JobManager,
    job: &mut Job,
    system: &SystemConfig,
    network: &NetworkConfig,
) -> Result<LaunchCommand, JobManagerError> {
    check_binary(job)?;

    if !system.scratch_dir.is_dir() {
        return Err(JobManagerError::MissingWorkDir(system.scratch_dir.clone()));
    }
    let exec_dir = check_run_dir(job)?;

    let bin_path = jobmgr
        .bin_path
        .clone()
        .ok_or_else(|| JobManagerError::MissingLauncher(PathBuf::from("sbatch")))?;

    let (output, error) = generate_job_script(job, system, network)?;
    let script = job
        .batch_script
        .as_ref()
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut command = LaunchCommand::new(bin_path).args(jobmgr.cmd_args.iter().cloned());
    // blocking by default, users can request non-blocking
    if !job.non_blocking {
        command = command.arg(BLOCKING_FLAG);
    }
    command = command.arg(script);
    command.exec_dir = exec_dir;

    job.bind(OutputSource::BatchLogs { output, error })?;

    Ok(command)
}

/// Job ID from the submission output, `None` when the output does not carry one
pub fn parse_job_id(stdout: &str, prefix: &str) -> Result<Option<u64>, JobManagerError> {
    match stdout.strip_prefix(prefix) {
        Some(rest) => rest
            .trim_end()
            .parse()
            .map(Some)
            .map_err(|source| JobManagerError::JobIdParseFailed {
                output: stdout.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

pub fn record_submission(
    job: &mut Job,
    result: &ExecResult,
    system: &SystemConfig,
) -> Result<(), JobManagerError> {
    match parse_job_id(&result.stdout_lossy(), &system.job_id_prefix) {
        Ok(Some(id)) => {
            debug!("Job {} got ID {id}", job.name);
            job.id = Some(id);
        }
        Ok(None) => debug!("Submission output does not contain a job ID"),
        // only tracking is lost, a blocking job is done once sbatch returns
        Err(error) if !job.non_blocking => {
            warn!(error = ?error, "Failed to get the job ID, continuing without it");
        }
        Err(error) => return Err(error),
    }

    Ok(())
}

fn query(jobmgr: &JobManager, args: Vec<String>) -> Result<ExecResult, JobManagerError> {
    let bin_path = jobmgr
        .query_path
        .clone()
        .ok_or_else(|| JobManagerError::StatusQueryFailed(format!("{QUERY_TOOL} not found")))?;

    Ok(exec::run(
        &LaunchCommand::new(bin_path).args(args),
        Deadline::after(QUERY_TIMEOUT),
    ))
}

/// Map the first state squeue prints to a `JobStatus`, no output means the job is gone
pub fn parse_status(output: &str) -> JobStatus {
    let state = match output.lines().map(str::trim).find(|line| !line.is_empty()) {
        Some(line) => line,
        None => return JobStatus::Finished,
    };
    let normalized = state
        .split(|c: char| c == '+' || c.is_whitespace())
        .next()
        .unwrap_or(state)
        .to_ascii_uppercase();

    match normalized.as_str() {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_HOLD" | "SUSPENDED" => {
            JobStatus::Pending
        }
        "RUNNING" | "RESIZING" | "SIGNALING" | "STAGE_OUT" => JobStatus::Running,
        "COMPLETING" => JobStatus::Completing,
        "COMPLETED" => JobStatus::Finished,
        "FAILED" | "CANCELLED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "PREEMPTED"
        | "BOOT_FAIL" | "DEADLINE" => JobStatus::Failed(normalized),
        _ => JobStatus::Other(state.to_string()),
    }
}

#[instrument(level = "debug", skip_all, fields(id = ?job.id))]
pub fn job_status(
    jobmgr: &JobManager,
    job: &Job,
    _system: &SystemConfig,
) -> Result<JobStatus, JobManagerError> {
    let id = job.id.ok_or(JobManagerError::NoJobId)?;
    let result = query(
        jobmgr,
        vec![
            String::from("-h"),
            String::from("-j"),
            id.to_string(),
            String::from("-o"),
            String::from("%T"),
        ],
    )?;

    if result.success() {
        Ok(parse_status(&result.stdout_lossy()))
    } else if result.stderr_lossy().contains("Invalid job id") {
        // squeue forgets about jobs shortly after they finish
        Ok(JobStatus::Finished)
    } else {
        Err(JobManagerError::StatusQueryFailed(
            result.stderr_lossy().trim().to_string(),
        ))
    }
}

pub fn job_count(jobmgr: &JobManager, system: &SystemConfig) -> Result<usize, JobManagerError> {
    let mut args = vec![String::from("-h"), String::from("-o"), String::from("%i")];
    if let Some(ref partition) = system.partition {
        args.push(String::from("-p"));
        args.push(partition.clone());
    }

    let result = query(jobmgr, args)?;
    if !result.success() {
        return Err(JobManagerError::StatusQueryFailed(
            result.stderr_lossy().trim().to_string(),
        ));
    }

    Ok(result
        .stdout_lossy()
        .lines()
        .filter(|line| !line.trim().is_empty())
        .count())
}

/// Poll the queue until the job is gone, bounded by `system.max_poll`
#[instrument(level = "debug", skip_all, fields(id = ?job.id))]
pub fn post_run(
    jobmgr: &JobManager,
    job: &Job,
    system: &SystemConfig,
) -> Result<(), JobManagerError> {
    if job.id.is_none() {
        debug!("No job ID to poll, relying on the batch logs");
        return Ok(());
    }

    let start = Instant::now();

    loop {
        match job_status(jobmgr, job, system) {
            Ok(status) if status.is_terminal() => {
                debug!("Job left the queue with {status:?}");
                break;
            }
            Ok(status) => debug!("Job is {status:?}"),
            Err(error) => {
                warn!(error = ?error, "Failed to query job status, stop polling");
                break;
            }
        }

        if start.elapsed() >= system.max_poll() {
            warn!(
                "Job still queued after {:?}, output may be incomplete",
                system.max_poll()
            );
            break;
        }

        thread::sleep(system.poll_interval());
    }

    Ok(())
}
