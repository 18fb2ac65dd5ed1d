//! Launch MPI jobs through whatever job manager the host provides.
//!
//! A [`launcher::Launcher`] detects the backend once (native `mpirun`, Slurm, or `prun`),
//! then every [`job::Job`] handed to it is turned into a backend specific command, run under
//! a deadline, and its output collected the same way regardless of the backend.

pub mod config;
pub mod exec;
pub mod jm;
pub mod job;
pub mod launcher;
pub mod mpi;

pub use jm::{BackendKind, Detector, JobManager, JobManagerError};
pub use job::{Job, JobState, OutputSource};
pub use launcher::{LaunchError, LaunchReport, Launcher, LauncherSettings};
