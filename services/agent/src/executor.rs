//! Child-process execution for the `command` action.
//!
//! Two modes share one argv/env/redirection front:
//! - *synchronous*: spawn, wait, capture the selected streams as text;
//! - *detached*: spawn with spool-file sinks, open an independent reader per
//!   spooled stream for later `tail`, and hand the exit code to a waiter
//!   task.  Detached children must never get a pipe — the agent's dispatch
//!   loop is single-threaded and would deadlock against a full pipe buffer.
//!
//! Spool files are named temp files kept on close so the tail reader can
//! open the same path the child writes to; they are deleted only by an
//! explicit `check` + `clear` (or when a synchronous capture is done with
//! them).  Child output is decoded as UTF-8 with replacement, never refused.

use crate::dispatcher::HandlerError;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Redirection resolution
// ---------------------------------------------------------------------------

/// Where one of the child's output streams goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkSpec {
    /// `"null"` — discard.
    Null,
    /// `"tmpfile"`, or any pipe selection in detached mode.
    Spool,
    /// `"stdout"` (stderr only) — share stdout's sink.
    Merge,
    /// Default in synchronous mode — capture via an inherited pipe.
    Pipe,
}

/// Map a request's redirection selector to a sink.
pub fn resolve_sink(selector: Option<&str>, detached: bool, is_stderr: bool) -> SinkSpec {
    match selector {
        Some("null") => SinkSpec::Null,
        Some("tmpfile") => SinkSpec::Spool,
        Some("stdout") if is_stderr => SinkSpec::Merge,
        _ if detached => SinkSpec::Spool,
        _ => SinkSpec::Pipe,
    }
}

// ---------------------------------------------------------------------------
// Command spec
// ---------------------------------------------------------------------------

/// Parsed `command` request: argv tokens (no shell), optional `K=V`
/// environment (when present, the child env is exactly that map), and one
/// sink per stream.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub env: Option<Vec<String>>,
    pub stdout: SinkSpec,
    pub stderr: SinkSpec,
}

fn build_command(spec: &CommandSpec) -> Command {
    let mut command = Command::new(&spec.argv[0]);
    command.args(&spec.argv[1..]);
    if let Some(vars) = &spec.env {
        command.env_clear();
        for var in vars {
            match var.split_once('=') {
                Some((key, value)) => command.env(key, value),
                None => command.env(var, ""),
            };
        }
    }
    command
}

fn exit_code_of(status: ExitStatus) -> i64 {
    if let Some(code) = status.code() {
        return i64::from(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -i64::from(signal);
        }
    }
    -1
}

/// A kept-on-close named temp file: the writer handle goes to the child,
/// the path stays valid for an independent reader.
fn new_spool() -> std::io::Result<(std::fs::File, PathBuf)> {
    tempfile::NamedTempFile::new()?
        .keep()
        .map_err(|persist| persist.error)
}

// ---------------------------------------------------------------------------
// Synchronous execution
// ---------------------------------------------------------------------------

/// What a synchronous run hands back to the reply.
#[derive(Debug)]
pub struct SyncOutcome {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: i64,
}

enum Capture {
    Discard,
    Pipe,
    File(PathBuf),
}

async fn read_capture(capture: Capture, piped: Vec<u8>) -> std::io::Result<Option<String>> {
    match capture {
        Capture::Discard => Ok(None),
        Capture::Pipe => Ok(Some(String::from_utf8_lossy(&piped).into_owned())),
        Capture::File(path) => {
            let bytes = tokio::fs::read(&path).await?;
            let _ = tokio::fs::remove_file(&path).await;
            Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
        }
    }
}

/// Run the child to completion and capture the selected streams.
pub async fn run_sync(spec: CommandSpec) -> Result<SyncOutcome, HandlerError> {
    let mut command = build_command(&spec);

    // A pipe cannot double as the child's stderr, so a merged piped stdout
    // is routed through one spool file and read back afterwards.
    let merge = spec.stderr == SinkSpec::Merge;
    let mut stdout_writer: Option<std::fs::File> = None;
    let stdout_capture = if spec.stdout == SinkSpec::Null {
        command.stdout(Stdio::null());
        Capture::Discard
    } else if spec.stdout == SinkSpec::Spool || merge {
        let (file, path) = new_spool()?;
        stdout_writer = Some(file.try_clone()?);
        command.stdout(Stdio::from(file));
        Capture::File(path)
    } else {
        command.stdout(Stdio::piped());
        Capture::Pipe
    };
    let stderr_capture = match spec.stderr {
        SinkSpec::Null => {
            command.stderr(Stdio::null());
            Capture::Discard
        }
        SinkSpec::Merge => {
            match stdout_writer.take() {
                Some(writer) => command.stderr(Stdio::from(writer)),
                None => command.stderr(Stdio::null()),
            };
            Capture::Discard
        }
        SinkSpec::Spool => {
            let (file, path) = new_spool()?;
            command.stderr(Stdio::from(file));
            Capture::File(path)
        }
        SinkSpec::Pipe => {
            command.stderr(Stdio::piped());
            Capture::Pipe
        }
    };
    drop(stdout_writer);

    let child = command.spawn()?;
    let output = child.wait_with_output().await?;

    Ok(SyncOutcome {
        stdout: read_capture(stdout_capture, output.stdout).await?,
        stderr: read_capture(stderr_capture, output.stderr).await?,
        exit_code: exit_code_of(output.status),
    })
}

// ---------------------------------------------------------------------------
// Detached execution
// ---------------------------------------------------------------------------

/// Independent read view of one spool file.
///
/// The child advances the file length; this reader advances its own
/// position, so `remain` is simply `len - position`.
struct SpoolStream {
    path: PathBuf,
    reader: tokio::fs::File,
}

impl SpoolStream {
    async fn open(path: PathBuf) -> std::io::Result<Self> {
        let reader = tokio::fs::File::open(&path).await?;
        Ok(SpoolStream { path, reader })
    }

    /// Read up to `limit` bytes (default: to the current EOF) and report the
    /// gap still unread behind the child's write position.
    async fn read_tail(&mut self, limit: Option<u64>) -> std::io::Result<(String, u64)> {
        let mut bytes = Vec::new();
        match limit {
            Some(n) => {
                (&mut self.reader).take(n).read_to_end(&mut bytes).await?;
            }
            None => {
                self.reader.read_to_end(&mut bytes).await?;
            }
        }
        let position = self.reader.stream_position().await?;
        let written = tokio::fs::metadata(&self.path).await?.len();
        Ok((
            String::from_utf8_lossy(&bytes).into_owned(),
            written.saturating_sub(position),
        ))
    }
}

/// Per-stream results of one `tail` round.
#[derive(Debug, Default)]
pub struct TailReport {
    pub stdout: Option<(String, u64)>,
    pub stderr: Option<(String, u64)>,
}

/// The single detached-executor slot's occupant.
///
/// Owns the tail readers and spool paths; the child itself is owned by the
/// waiter task, which writes the exit code into the watch cell exactly once.
pub struct Executor {
    exit: watch::Receiver<Option<i64>>,
    stdout: Option<SpoolStream>,
    stderr: Option<SpoolStream>,
}

impl Executor {
    /// Exit code recorded by the waiter; `None` while the child runs.
    pub fn exit_code(&self) -> Option<i64> {
        *self.exit.borrow()
    }

    /// Block until the waiter has recorded the exit code.
    pub async fn wait(&mut self) {
        let _ = self.exit.wait_for(Option::is_some).await;
    }

    pub fn stdout_path(&self) -> Option<String> {
        self.stdout.as_ref().map(|s| s.path.display().to_string())
    }

    pub fn stderr_path(&self) -> Option<String> {
        self.stderr.as_ref().map(|s| s.path.display().to_string())
    }

    /// True when at least one stream is spool-backed (tail has a source).
    pub fn has_tail_source(&self) -> bool {
        self.stdout.is_some() || self.stderr.is_some()
    }

    /// One `tail` round over every spooled stream.
    pub async fn tail(&mut self, limit: Option<u64>) -> std::io::Result<TailReport> {
        let mut report = TailReport::default();
        if let Some(stream) = self.stdout.as_mut() {
            report.stdout = Some(stream.read_tail(limit).await?);
        }
        if let Some(stream) = self.stderr.as_mut() {
            report.stderr = Some(stream.read_tail(limit).await?);
        }
        Ok(report)
    }

    /// Release the slot's resources: drop the readers, delete the spools.
    pub async fn cleanup(self) {
        for stream in [self.stdout, self.stderr].into_iter().flatten() {
            drop(stream.reader);
            if let Err(e) = tokio::fs::remove_file(&stream.path).await {
                warn!(path = %stream.path.display(), error = %e, "failed to remove spool file");
            }
        }
    }
}

/// Spawn a detached child and build its executor.
///
/// The caller has already verified the slot is empty — this fails before
/// spawning only on spool-file or spawn errors, and cleans up any spool it
/// created on the way out.
pub async fn spawn_detached(spec: CommandSpec) -> Result<Executor, HandlerError> {
    let mut command = build_command(&spec);

    let mut stdout_writer: Option<std::fs::File> = None;
    let stdout_spool = match spec.stdout {
        SinkSpec::Null => {
            command.stdout(Stdio::null());
            None
        }
        _ => {
            let (file, path) = new_spool()?;
            stdout_writer = Some(file.try_clone()?);
            command.stdout(Stdio::from(file));
            Some(path)
        }
    };
    let stderr_spool = match spec.stderr {
        SinkSpec::Null => {
            command.stderr(Stdio::null());
            None
        }
        SinkSpec::Merge => {
            match stdout_writer.take() {
                Some(writer) => command.stderr(Stdio::from(writer)),
                None => command.stderr(Stdio::null()),
            };
            None
        }
        _ => {
            let (file, path) = new_spool()?;
            command.stderr(Stdio::from(file));
            Some(path)
        }
    };
    drop(stdout_writer);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            for path in stdout_spool.iter().chain(stderr_spool.iter()) {
                let _ = std::fs::remove_file(path);
            }
            return Err(e.into());
        }
    };

    let stdout = match stdout_spool {
        Some(path) => Some(SpoolStream::open(path).await?),
        None => None,
    };
    let stderr = match stderr_spool {
        Some(path) => Some(SpoolStream::open(path).await?),
        None => None,
    };

    let (exit_tx, exit_rx) = watch::channel(None);
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => {
                let code = exit_code_of(status);
                debug!(exit_code = code, "detached child exited");
                let _ = exit_tx.send(Some(code));
            }
            Err(e) => {
                warn!(error = %e, "failed to reap detached child");
                let _ = exit_tx.send(Some(-1));
            }
        }
    });

    Ok(Executor {
        exit: exit_rx,
        stdout,
        stderr,
    })
}
