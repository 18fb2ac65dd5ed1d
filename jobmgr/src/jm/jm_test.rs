use super::{BackendKind, Detector, JobManager, JobManagerError};
use crate::{
    config::{MpiConfig, NetworkConfig, SystemConfig},
    job::{Job, OutputSource},
    mpi::{Implementation, MpiError},
};
use std::{fs, os::unix::fs::PermissionsExt, path::Path, path::PathBuf, sync::Arc};

fn tool(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn openmpi(install_dir: &Path) -> Arc<MpiConfig> {
    let mut mpi = MpiConfig::new(install_dir.to_path_buf());
    mpi.implementation = Some(Implementation::OpenMpi);
    Arc::new(mpi)
}

fn all_backends() -> Vec<BackendKind> {
    vec![
        BackendKind::Slurm,
        BackendKind::IntelSlurm,
        BackendKind::Prun,
        BackendKind::Native,
    ]
}

#[test]
pub fn native_is_the_fallback() {
    let empty = tempfile::tempdir().unwrap();
    let detector = Detector::new(all_backends(), vec![empty.path().to_path_buf()]);

    let jobmgr = detector.detect().unwrap();
    assert_eq!(jobmgr.kind, BackendKind::Native);
    assert!(jobmgr.bin_path.is_none());
}

#[test]
pub fn native_never_reports_unusable() {
    assert!(BackendKind::Native.probe(&[]).is_some());
}

#[test]
pub fn slurm_needs_squeue_to_confirm() {
    let dir = tempfile::tempdir().unwrap();
    tool(dir.path(), "sbatch");
    let search = vec![dir.path().to_path_buf()];

    assert!(BackendKind::Slurm.probe(&search).is_none());

    let squeue = tool(dir.path(), "squeue");
    let jobmgr = Detector::new(all_backends(), search).detect().unwrap();
    assert_eq!(jobmgr.kind, BackendKind::Slurm);
    assert_eq!(jobmgr.bin_path, Some(dir.path().join("sbatch")));
    assert_eq!(jobmgr.query_path, Some(squeue));
}

#[test]
pub fn priority_order_is_respected() {
    let dir = tempfile::tempdir().unwrap();
    tool(dir.path(), "bsub");
    tool(dir.path(), "squeue");
    tool(dir.path(), "prun");
    let search = vec![dir.path().to_path_buf()];

    let jobmgr = Detector::new(all_backends(), search.clone())
        .detect()
        .unwrap();
    assert_eq!(jobmgr.kind, BackendKind::IntelSlurm);

    let jobmgr = Detector::new(vec![BackendKind::Prun, BackendKind::Slurm], search)
        .detect()
        .unwrap();
    assert_eq!(jobmgr.kind, BackendKind::Prun);
}

#[test]
pub fn detection_fails_without_native() {
    let empty = tempfile::tempdir().unwrap();
    let detector = Detector::new(
        vec![BackendKind::Slurm, BackendKind::Prun],
        vec![empty.path().to_path_buf()],
    );

    assert!(matches!(
        detector.detect(),
        Err(JobManagerError::DetectionFailure(_))
    ));
}

#[test]
pub fn unbound_operations_are_absent() {
    let system = SystemConfig::new(PathBuf::from("/tmp"));
    let native = JobManager::new(BackendKind::Native);
    let prun = JobManager::new(BackendKind::Prun);
    let job = Job::new("/bin/true");

    assert!(native.job_status(&job, &system).is_none());
    assert!(native.job_count(&system).is_none());
    assert!(prun.load(&system).is_none());
    assert!(!prun.capabilities().post_run);
    assert!(JobManager::new(BackendKind::Slurm).capabilities().job_status);
}

#[test]
pub fn native_command_starts_with_np() {
    let install = tempfile::tempdir().unwrap();
    fs::create_dir(install.path().join("bin")).unwrap();
    tool(&install.path().join("bin"), "mpirun");

    let system = SystemConfig::new(PathBuf::from("/tmp"));
    let mut job = Job::new("/apps/hello");
    job.np = 4;
    job.mpi = Some(openmpi(install.path()));

    let command = JobManager::new(BackendKind::Native)
        .prepare(&mut job, &system, &NetworkConfig::default())
        .unwrap();

    assert_eq!(command.bin_path, install.path().join("bin/mpirun"));
    assert_eq!(&command.args[..2], ["-np", "4"]);
    assert_eq!(
        &command.args[2..],
        ["--mca", "btl", "^openib", "--mca", "pml", "ucx", "/apps/hello"]
    );
    assert_eq!(job.output_source(), Some(&OutputSource::Captured));
}

#[test]
pub fn native_command_without_np_and_with_device() {
    let install = tempfile::tempdir().unwrap();
    fs::create_dir(install.path().join("bin")).unwrap();
    tool(&install.path().join("bin"), "mpirun");

    let system = SystemConfig::new(PathBuf::from("/tmp"));
    let network = NetworkConfig {
        device: Some(String::from("eth0")),
    };
    let mut job = Job::new("/apps/hello");
    job.mpi = Some(openmpi(install.path()));
    job.device = Some(String::from("mlx5_0:1"));
    job.app.args = vec![String::from("--iterations"), String::from("10")];

    let command = JobManager::new(BackendKind::Native)
        .prepare(&mut job, &system, &network)
        .unwrap();

    assert_eq!(command.args[0], "--mca");
    assert_eq!(
        &command.args[6..],
        [
            "-x",
            "UCX_NET_DEVICES=mlx5_0:1",
            "/apps/hello",
            "--iterations",
            "10"
        ]
    );
}

#[test]
pub fn native_checks_launcher_and_workdir() {
    let install = tempfile::tempdir().unwrap();
    let system = SystemConfig::new(PathBuf::from("/tmp"));
    let native = JobManager::new(BackendKind::Native);

    let mut job = Job::new("/apps/hello");
    job.mpi = Some(openmpi(install.path()));
    assert!(matches!(
        native.prepare(&mut job, &system, &NetworkConfig::default()),
        Err(JobManagerError::MissingLauncher(_))
    ));

    let mut job = Job::new("/apps/hello");
    job.run_dir = Some(install.path().join("missing"));
    assert!(matches!(
        native.prepare(&mut job, &system, &NetworkConfig::default()),
        Err(JobManagerError::MissingWorkDir(_))
    ));

    let mut job = Job::new("");
    assert!(matches!(
        native.prepare(&mut job, &system, &NetworkConfig::default()),
        Err(JobManagerError::UndefinedBinary)
    ));
    assert!(job.output_source().is_none());
}

#[test]
pub fn unknown_implementation_fails_argument_construction() {
    let system = SystemConfig::new(PathBuf::from("/tmp"));
    let mut job = Job::new("/apps/hello");
    job.mpi = Some(Arc::new(MpiConfig::new(PathBuf::from("/opt/mpi"))));

    assert!(matches!(
        JobManager::new(BackendKind::Native).prepare(&mut job, &system, &NetworkConfig::default()),
        Err(JobManagerError::ArgConstructionFailed(
            MpiError::UnknownImplementation(_)
        ))
    ));
}

#[test]
pub fn prun_argument_order() {
    let dir = tempfile::tempdir().unwrap();
    let prun = tool(dir.path(), "prun");
    let jobmgr = BackendKind::Prun
        .probe(&[dir.path().to_path_buf()])
        .unwrap();

    let system = SystemConfig::new(PathBuf::from("/tmp"));
    let mut job = Job::new("/apps/hello");
    job.args = vec![String::from("-n"), String::from("8")];
    job.app.args = vec![String::from("input.dat")];

    let command = jobmgr
        .prepare(&mut job, &system, &NetworkConfig::default())
        .unwrap();

    assert_eq!(command.bin_path, prun);
    assert_eq!(
        command.args,
        ["-n", "8", "-x", "PATH", "/apps/hello", "input.dat"]
    );
}
