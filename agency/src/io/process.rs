//! Command-runner capability: child processes with deadlines and bounded output.
//!
//! git, tmux and the setup script are all reached through [`CommandRunner`], so
//! tests can script external tools without spawning them.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Default cap on captured stdout/stderr per stream.
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

/// How often a waiting runner re-checks its cancel token.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared flag an outer caller flips to abort in-flight commands.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Options for a single command invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOpts {
    pub cwd: Option<PathBuf>,
    /// Added on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    /// `None` means stdin is connected to null.
    pub stdin: Option<Vec<u8>>,
    /// Kill the child once this elapses.
    pub timeout: Option<Duration>,
    /// Send stdout and stderr to this file (truncated first) instead of capturing.
    pub output_path: Option<PathBuf>,
    pub output_limit_bytes: Option<usize>,
    pub cancel: Option<CancelToken>,
}

impl RunOpts {
    pub fn in_dir(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: Some(cwd.into()),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Captured result of a finished (or killed) child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    /// `None` when killed or terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
    pub canceled: bool,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.canceled
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

pub trait CommandRunner {
    /// Run `name` with `args`. `Err` means the command could not be executed
    /// at all; a non-zero exit is reported through [`CmdOutput`].
    fn run(&self, name: &str, args: &[&str], opts: &RunOpts) -> io::Result<CmdOutput>;
}

/// [`CommandRunner`] that spawns real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRunner;

enum WaitEnd {
    Exited,
    TimedOut,
    Canceled,
}

impl CommandRunner for OsRunner {
    #[instrument(skip_all, fields(cmd = name, timeout_secs = opts.timeout.map(|t| t.as_secs())))]
    fn run(&self, name: &str, args: &[&str], opts: &RunOpts) -> io::Result<CmdOutput> {
        let mut cmd = Command::new(name);
        cmd.args(args).envs(&opts.env);
        if let Some(cwd) = &opts.cwd {
            cmd.current_dir(cwd);
        }
        if opts.stdin.is_some() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }
        if let Some(path) = &opts.output_path {
            let log = File::create(path)?;
            cmd.stdout(Stdio::from(log.try_clone()?))
                .stderr(Stdio::from(log));
        } else {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        debug!(args = ?args, "spawning child process");
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                error!(err = %e, "failed to spawn command");
                return Err(e);
            }
        };

        if let Some(input) = &opts.stdin {
            let written = match child.stdin.take() {
                Some(mut child_stdin) => child_stdin.write_all(input),
                None => Err(io::Error::other("stdin was not piped")),
            };
            match written {
                Ok(()) => {}
                // The child stopped reading; its exit status still tells the story.
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    debug!("child closed stdin early");
                }
                Err(e) => {
                    warn!(err = %e, "writing child stdin failed, killing");
                    if let Err(reap) = kill_and_reap(&mut child) {
                        warn!(err = %reap, "failed to reap child");
                    }
                    return Err(e);
                }
            }
        }

        let limit = opts.output_limit_bytes.unwrap_or(DEFAULT_OUTPUT_LIMIT_BYTES);
        let stdout_handle = child
            .stdout
            .take()
            .map(|out| thread::spawn(move || read_stream_limited(out, limit)));
        let stderr_handle = child
            .stderr
            .take()
            .map(|err| thread::spawn(move || read_stream_limited(err, limit)));

        let (status, end) = wait_bounded(&mut child, opts.timeout, opts.cancel.as_ref())?;

        let (stdout, stdout_truncated) = join_output(stdout_handle)?;
        let (stderr, stderr_truncated) = join_output(stderr_handle)?;
        if stdout_truncated > 0 || stderr_truncated > 0 {
            warn!(stdout_truncated, stderr_truncated, "output truncated");
        }

        let output = CmdOutput {
            exit_code: status.code(),
            stdout,
            stderr,
            timed_out: matches!(end, WaitEnd::TimedOut),
            canceled: matches!(end, WaitEnd::Canceled),
        };
        debug!(
            exit_code = ?output.exit_code,
            timed_out = output.timed_out,
            canceled = output.canceled,
            "command finished"
        );
        Ok(output)
    }
}

fn wait_bounded(
    child: &mut Child,
    timeout: Option<Duration>,
    cancel: Option<&CancelToken>,
) -> io::Result<(ExitStatus, WaitEnd)> {
    if timeout.is_none() && cancel.is_none() {
        return Ok((child.wait()?, WaitEnd::Exited));
    }

    let start = Instant::now();
    loop {
        if cancel.is_some_and(CancelToken::is_canceled) {
            warn!("command canceled, killing");
            return Ok((kill_and_reap(child)?, WaitEnd::Canceled));
        }
        let slice = match timeout {
            Some(limit) => {
                let elapsed = start.elapsed();
                if elapsed >= limit {
                    warn!(timeout_secs = limit.as_secs(), "command timed out, killing");
                    return Ok((kill_and_reap(child)?, WaitEnd::TimedOut));
                }
                (limit - elapsed).min(POLL_INTERVAL)
            }
            None => POLL_INTERVAL,
        };
        if let Some(status) = child.wait_timeout(slice)? {
            return Ok((status, WaitEnd::Exited));
        }
    }
}

fn kill_and_reap(child: &mut Child) -> io::Result<ExitStatus> {
    if let Err(err) = child.kill() {
        // Already exited between the poll and the kill.
        if err.kind() != io::ErrorKind::InvalidInput {
            return Err(err);
        }
    }
    child.wait()
}

type ReaderHandle = thread::JoinHandle<io::Result<(Vec<u8>, usize)>>;

fn join_output(handle: Option<ReaderHandle>) -> io::Result<(Vec<u8>, usize)> {
    match handle {
        None => Ok((Vec::new(), 0)),
        Some(handle) => handle
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("output reader thread panicked"))),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> io::Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
