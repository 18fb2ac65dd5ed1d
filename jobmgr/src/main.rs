use clap::Parser;
use hpc_jobmgr::{
    config::{ConfigErrors, LauncherConfig},
    BackendKind, Job, LaunchError, LaunchReport, Launcher, LauncherSettings,
};
use rayon::{prelude::*, ThreadPoolBuilder};
use std::{io, path::PathBuf, process::exit};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::ResultExt;

/// Launch MPI jobs through the job manager available on this host
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Launcher configuration (YAML)
    #[arg(short, long)]
    config: PathBuf,
    /// Only launch the named jobs, defaults to every configured job
    #[arg(short, long)]
    job: Vec<String>,
    /// Use this backend instead of detecting one
    #[arg(short, long, value_enum)]
    backend: Option<BackendKind>,
    /// Print the selected backend and exit
    #[arg(long)]
    detect: bool,
    /// Number of jobs launched at the same time
    #[arg(short, long)]
    threads: Option<usize>,
    /// Keep batch scripts and logs after the run
    #[arg(long)]
    keep: bool,
}

fn print_detection(launcher: &Launcher) {
    let backend = launcher.backend();
    println!("backend: {}", backend.kind);
    if let Some(ref bin_path) = backend.bin_path {
        println!("tool: {}", bin_path.to_string_lossy());
    }
    println!("capabilities: {:?}", backend.capabilities());

    if let Some(mpi) = launcher.mpi() {
        println!(
            "mpi: {} {} ({})",
            mpi.implementation
                .map(|implementation| implementation.to_string())
                .unwrap_or_else(|| String::from("unknown")),
            mpi.version.as_deref().unwrap_or("unknown"),
            mpi.install_dir.to_string_lossy()
        );
    }

    match launcher.job_count() {
        Some(Ok(count)) => println!("queued jobs: {count}"),
        Some(Err(error)) => warn!(error = ?error, "Failed to count queued jobs"),
        None => {}
    }
}

fn launch(
    launcher: &Launcher,
    name: &str,
    job: &mut Job,
    keep: bool,
) -> Result<LaunchReport, LaunchError> {
    let report = launcher.run(job);

    // batch artefacts belong to the job, cleaned up on every path
    if !keep {
        if let Err(error) = job.clean_up() {
            warn!(error = ?error, "Failed to clean up after {name}");
        }
    }

    report
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let mut config = LauncherConfig::load(&cli.config).unwrap_or_log();
    if config.preflight_checks() {
        error!("{}", ConfigErrors::PreflightFailed);
        exit(1);
    }

    let selected = if cli.job.is_empty() {
        config.jobs.keys().cloned().collect()
    } else {
        for name in cli.job.iter() {
            if !config.jobs.contains_key(name) {
                error!("{}", ConfigErrors::UnknownJob(name.clone()));
                exit(1);
            }
        }
        cli.job.clone()
    };

    let jobs = config.jobs.clone();
    let mut settings = LauncherSettings::from(config);
    settings.backend = cli.backend;

    let launcher = Launcher::load(settings).unwrap_or_log();

    if cli.detect {
        print_detection(&launcher);
        return;
    }

    let pool = ThreadPoolBuilder::new()
        .num_threads(cli.threads.unwrap_or(0))
        .build()
        .unwrap_or_log();

    let results: Vec<(String, Result<LaunchReport, LaunchError>)> = pool.install(|| {
        selected
            .par_iter()
            .map(|name| {
                let mut job = Job::from_config(name, &jobs[name]);
                (name.clone(), launch(&launcher, name, &mut job, cli.keep))
            })
            .collect()
    });

    let mut failed = 0;
    let mut printing = true;
    let stdout = io::stdout();
    let mut out = stdout.lock();

    for (name, result) in results {
        match result {
            Ok(report) => {
                // a closed stdout only stops the printing, jobs are still classified
                if printing {
                    if let Err(error) = report.write_to(&name, &mut out) {
                        warn!(error = ?error, "Failed to print job output, skipping the rest");
                        printing = false;
                    }
                }

                match report.check() {
                    Ok(()) => info!(
                        "{name} done in {} ms{}",
                        report.runtime.as_millis(),
                        report
                            .job_id
                            .map(|id| format!(" (job {id})"))
                            .unwrap_or_default()
                    ),
                    Err(error) => {
                        error!(error = ?error, "{name} failed: {error}");
                        failed += 1;
                    }
                }
            }
            Err(error) => {
                error!(error = ?error, "Failed to launch {name}: {error}");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        error!("{failed} job(s) failed");
        exit(1);
    }
}
