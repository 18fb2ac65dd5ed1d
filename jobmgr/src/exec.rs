use itertools::Itertools;
use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use parking_lot::Mutex;
use std::{
    borrow::Cow,
    ffi::OsString,
    io::{self, Read},
    os::unix::process::CommandExt,
    path::PathBuf,
    process::{Command, ExitStatus, Stdio},
    sync::{mpsc, Arc},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};
use wait_timeout::ChildExt;

/// Time the pipe readers get to drain after the child is gone
const READER_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Failed to spawn {bin}: {source}")]
    Spawn { bin: PathBuf, source: io::Error },
    #[error("Failed to wait for a child process")]
    Wait(#[from] io::Error),
    #[error("Command exited with {0}")]
    Status(ExitStatus),
}

/// A fully built command, ready to hand to `run`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchCommand {
    pub bin_path: PathBuf,
    pub args: Vec<String>,
    pub exec_dir: Option<PathBuf>,
    // added on top of the inherited environment
    pub env: Vec<(OsString, OsString)>,
}

impl LaunchCommand {
    pub fn new<P: Into<PathBuf>>(bin_path: P) -> Self {
        Self {
            bin_path: bin_path.into(),
            ..Default::default()
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// shell-like rendering, only meant for logs and batch scripts
    pub fn command_line(&self) -> String {
        std::iter::once(self.bin_path.to_string_lossy())
            .chain(self.args.iter().map(|arg| Cow::from(arg.as_str())))
            .map(|token| quote(&token))
            .join(" ")
    }
}

fn quote(token: &str) -> String {
    if !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,^+@%".contains(c))
    {
        token.to_string()
    } else {
        format!("'{}'", token.replace('\'', r"'\''"))
    }
}

/// Point in time after which a launched command gets killed
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    timeout: Duration,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
            timeout,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn elapsed(&self) -> bool {
        Instant::now() >= self.at
    }
}

#[derive(Debug, Default)]
/// container for everything observed while running a command
pub struct ExecResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub status: Option<ExitStatus>,
    pub error: Option<ExecError>,
    // set independently of `error`, a killed child reports both
    pub deadline_exceeded: bool,
    pub runtime: Duration,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.error.is_none() && !self.deadline_exceeded
    }

    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

type Buffer = Arc<Mutex<Vec<u8>>>;

fn drain<R: Read + Send + 'static>(
    mut source: R,
    buffer: Buffer,
    done: mpsc::Sender<()>,
) {
    thread::spawn(move || {
        let mut chunk = [0u8; 64 * 1024];

        loop {
            match source.read(&mut chunk) {
                Ok(0) => break,
                Ok(read) => buffer.lock().extend_from_slice(&chunk[..read]),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    warn!(error = ?error, "Failed to read from child pipe");
                    break;
                }
            }
        }

        let _ = done.send(());
    });
}

fn kill_group(child: &mut std::process::Child) {
    let pid = Pid::from_raw(child.id() as i32);

    if let Err(error) = killpg(pid, Signal::SIGKILL) {
        debug!(error = ?error, "Failed to kill process group, killing child only");

        if let Err(error) = child.kill() {
            warn!(error = ?error, "Failed to kill child {}", child.id());
        }
    }
}

/// Run `command` until it exits or `deadline` passes, capturing both output streams
#[instrument(level = "debug", skip_all, fields(bin = ?command.bin_path))]
pub fn run(command: &LaunchCommand, deadline: Deadline) -> ExecResult {
    let mut result = ExecResult::default();
    let start = Instant::now();

    debug!("Running {}", command.command_line());

    let mut builder = Command::new(&command.bin_path);
    builder
        .args(command.args.iter())
        .envs(command.env.iter().map(|(key, value)| (key, value)))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // own process group, so a timeout takes down everything the launcher forked
        .process_group(0);

    if let Some(ref dir) = command.exec_dir {
        builder.current_dir(dir);
    }

    let mut child = match builder.spawn() {
        Ok(child) => child,
        Err(source) => {
            result.error = Some(ExecError::Spawn {
                bin: command.bin_path.clone(),
                source,
            });
            result.runtime = start.elapsed();
            return result;
        }
    };

    let stdout: Buffer = Arc::default();
    let stderr: Buffer = Arc::default();
    let (done_tx, done_rx) = mpsc::channel();
    let mut readers = 0;

    if let Some(pipe) = child.stdout.take() {
        drain(pipe, stdout.clone(), done_tx.clone());
        readers += 1;
    }
    if let Some(pipe) = child.stderr.take() {
        drain(pipe, stderr.clone(), done_tx.clone());
        readers += 1;
    }
    drop(done_tx);

    let status = match child.wait_timeout(deadline.remaining()) {
        Ok(Some(status)) => Ok(status),
        Ok(None) => {
            debug!(
                "Command ran into its {:?} deadline, killing process {}",
                deadline.timeout(),
                child.id()
            );
            result.deadline_exceeded = true;
            kill_group(&mut child);
            child.wait()
        }
        Err(error) => {
            kill_group(&mut child);
            let _ = child.wait();
            Err(error)
        }
    };

    // readers finish once every holder of the pipes is gone
    let grace = Instant::now() + READER_GRACE;
    for _ in 0..readers {
        if done_rx
            .recv_timeout(grace.saturating_duration_since(Instant::now()))
            .is_err()
        {
            warn!("Output pipes still open after the command finished, output may be incomplete");
            break;
        }
    }

    result.stdout = std::mem::take(&mut *stdout.lock());
    result.stderr = std::mem::take(&mut *stderr.lock());
    result.runtime = start.elapsed();

    match status {
        Ok(status) => {
            result.status = Some(status);
            if !status.success() {
                result.error = Some(ExecError::Status(status));
            }
        }
        Err(error) => result.error = Some(ExecError::Wait(error)),
    }

    debug!(
        "Finished in {} ms | status: {:?} | deadline exceeded: {}",
        result.runtime.as_millis(),
        result.status,
        result.deadline_exceeded
    );
    trace!(stdout = %result.stdout_lossy(), stderr = %result.stderr_lossy());

    result
}
