use super::{Job, JobError, JobState, OutputSource};
use crate::config::JobConfig;
use std::{fs, path::PathBuf};

#[test]
pub fn accessors_require_a_bind() {
    let job = Job::new("/bin/true");

    assert!(matches!(job.output(), Err(JobError::Unbound)));
    assert!(matches!(job.error(), Err(JobError::Unbound)));
}

#[test]
pub fn captured_accessors_return_buffers() {
    let mut job = Job::new("/bin/true");
    job.stdout = b"hello".to_vec();
    job.stderr = b"oops".to_vec();
    job.bind(OutputSource::Captured).unwrap();

    assert_eq!(job.output().unwrap(), b"hello");
    assert_eq!(job.error().unwrap(), b"oops");
}

#[test]
pub fn second_bind_is_rejected() {
    let job = Job::new("/bin/true");
    job.bind(OutputSource::Captured).unwrap();

    assert!(matches!(
        job.bind(OutputSource::Captured),
        Err(JobError::AlreadyBound)
    ));
}

#[test]
pub fn state_only_moves_forward() {
    let mut job = Job::new("/bin/true");
    job.advance(JobState::BackendSelected).unwrap();
    job.advance(JobState::CommandBuilt).unwrap();

    assert!(matches!(
        job.advance(JobState::BackendSelected),
        Err(JobError::InvalidTransition {
            from: JobState::CommandBuilt,
            to: JobState::BackendSelected,
        })
    ));
    assert!(matches!(
        job.advance(JobState::CommandBuilt),
        Err(JobError::InvalidTransition { .. })
    ));
    assert_eq!(job.state(), JobState::CommandBuilt);
}

#[test]
pub fn batch_logs_are_appended_and_cleaned_up() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("job.out");
    let error = dir.path().join("job.err");
    let script = dir.path().join("job.sh");
    fs::write(&output, "rank 0\n").unwrap();
    fs::write(&script, "#!/bin/sh\n").unwrap();

    let mut job = Job::new("/bin/true");
    job.stdout = b"Submitted batch job 7\n".to_vec();
    job.batch_script = Some(script.clone());
    job.bind(OutputSource::BatchLogs {
        output: output.clone(),
        error: error.clone(),
    })
    .unwrap();

    assert_eq!(job.output().unwrap(), b"Submitted batch job 7\nrank 0\n");
    // a missing log only loses the log part
    assert!(job.error().unwrap().is_empty());

    job.clean_up().unwrap();
    assert!(!output.exists());
    assert!(!script.exists());
    assert!(job.batch_script.is_none());
}

#[test]
pub fn from_config_copies_the_launch_request() {
    let config = JobConfig {
        binary: PathBuf::from("/apps/hello"),
        args: vec![String::from("--size"), String::from("8")],
        np: 4,
        nnodes: 2,
        launch_args: vec![String::from("--oversubscribe")],
        run_dir: None,
        non_blocking: true,
        device: Some(String::from("ib0")),
    };
    let job = Job::from_config("hello", &config);

    assert_eq!(job.name, "hello");
    assert_eq!(job.app.args, ["--size", "8"]);
    assert_eq!((job.np, job.nnodes), (4, 2));
    assert!(job.non_blocking);
    assert_eq!(job.state(), JobState::Created);
    assert!(job.id.is_none());
}
