use super::{detect_from_dir, extra_launch_args, parse_version_output};
use crate::{
    config::{NetworkConfig, SystemConfig},
    mpi::MpiError,
};
use std::{fs, os::unix::fs::PermissionsExt, path::Path, path::PathBuf};

fn system() -> SystemConfig {
    SystemConfig::new(PathBuf::from("/tmp"))
}

fn fake_ompi_info(install_dir: &Path, script: &str) {
    let bin = install_dir.join("bin");
    fs::create_dir_all(&bin).unwrap();
    let path = bin.join("ompi_info");
    fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
}

#[test]
pub fn prefers_ucx_without_device() {
    let args = extra_launch_args(&system(), &NetworkConfig::default(), Vec::new()).unwrap();

    assert_eq!(args, ["--mca", "btl", "^openib", "--mca", "pml", "ucx"]);
    assert!(!args.iter().any(|arg| arg.contains("UCX_NET_DEVICES")));
}

#[test]
pub fn device_is_exported_last() {
    let network = NetworkConfig {
        device: Some(String::from("eth1")),
    };
    let existing = vec![String::from("--bind-to"), String::from("core")];
    let args = extra_launch_args(&system(), &network, existing).unwrap();

    assert_eq!(&args[..2], ["--bind-to", "core"]);
    let exclusion = args.iter().position(|arg| arg == "^openib").unwrap();
    assert_eq!(&args[exclusion + 1..exclusion + 4], ["--mca", "pml", "ucx"]);
    assert_eq!(args.last().unwrap(), "UCX_NET_DEVICES=eth1");
    assert_eq!(args[args.len() - 2], "-x");
}

#[test]
pub fn invalid_device_is_rejected() {
    let network = NetworkConfig {
        device: Some(String::from("eth1 eth2")),
    };

    assert!(matches!(
        extra_launch_args(&system(), &network, Vec::new()),
        Err(MpiError::InvalidDevice(_))
    ));
}

#[test]
pub fn empty_device_means_no_device() {
    let network = NetworkConfig {
        device: Some(String::new()),
    };

    assert_eq!(
        extra_launch_args(&system(), &network, Vec::new()).unwrap(),
        ["--mca", "btl", "^openib", "--mca", "pml", "ucx"]
    );
}

#[test]
pub fn parse_version() {
    assert_eq!(parse_version_output("Open MPI v4.1.2\n").unwrap(), "4.1.2");
    assert_eq!(
        parse_version_output("Open MPI v5.0.0rc2\n\nhttps://www.open-mpi.org/community/help/\n")
            .unwrap(),
        "5.0.0rc2"
    );
}

#[test]
pub fn parse_version_rejects_other_products() {
    assert!(matches!(
        parse_version_output("HYDRA build details:\n"),
        Err(MpiError::UnparseableOutput(_))
    ));
    assert!(matches!(
        parse_version_output(""),
        Err(MpiError::UnparseableOutput(_))
    ));
    assert!(matches!(
        parse_version_output("Open MPI v\n"),
        Err(MpiError::UnparseableOutput(_))
    ));
}

#[test]
pub fn detect_missing_binary() {
    let dir = tempfile::tempdir().unwrap();

    assert!(matches!(
        detect_from_dir(dir.path(), None),
        Err(MpiError::NotThisImplementation(_))
    ));
}

#[test]
pub fn detect_installed_version() {
    let dir = tempfile::tempdir().unwrap();
    fake_ompi_info(dir.path(), "echo 'Open MPI v4.1.2'");

    assert_eq!(detect_from_dir(dir.path(), None).unwrap(), "4.1.2");
}

#[test]
pub fn detect_retries_with_opal_prefix() {
    let dir = tempfile::tempdir().unwrap();
    fake_ompi_info(
        dir.path(),
        "[ -n \"$OPAL_PREFIX\" ] || exit 1\necho \"Open MPI v4.0.7\"",
    );

    assert_eq!(detect_from_dir(dir.path(), None).unwrap(), "4.0.7");
}

#[test]
pub fn detect_fails_after_retry() {
    let dir = tempfile::tempdir().unwrap();
    fake_ompi_info(
        dir.path(),
        "echo \"${OPAL_PREFIX:-unset}\" >> \"$(dirname \"$0\")/attempts\"; echo broken >&2; exit 1",
    );

    assert!(matches!(
        detect_from_dir(dir.path(), None),
        Err(MpiError::DetectionFailed { .. })
    ));

    // one plain attempt, one with OPAL_PREFIX, both logged
    let attempts = fs::read_to_string(dir.path().join("bin/attempts")).unwrap();
    assert_eq!(
        attempts.lines().collect::<Vec<_>>(),
        ["unset", dir.path().to_str().unwrap()]
    );
}

#[test]
pub fn detect_unparseable_output() {
    let dir = tempfile::tempdir().unwrap();
    fake_ompi_info(dir.path(), "echo 'MPICH Version: 4.0'");

    assert!(matches!(
        detect_from_dir(dir.path(), None),
        Err(MpiError::UnparseableOutput(_))
    ));
}
