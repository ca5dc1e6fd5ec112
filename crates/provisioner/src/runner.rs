// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Dev Tunnel Provisioner Contributors

// Dev Tunnel Provisioner - Process Runner
// Spawns the agent executable and collects its output

use std::fmt;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use devtunnel_common::{Error, Result};

/// Upper bound on waiting for a killed session to be reaped
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives stdout lines of a hosted session as they arrive
pub type LineCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// A single agent invocation: program plus argument vector
///
/// Arguments are handed to the OS as discrete elements and never pass
/// through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// `None` waits for as long as the process runs
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
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

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished process
///
/// A non-zero exit code is a normal outcome here; callers decide whether it
/// means "not found" or a real failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs agent commands
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run to completion, honoring the invocation's timeout and `cancel`.
    /// The child is killed when either fires.
    async fn run(&self, invocation: &Invocation, cancel: &CancellationToken)
        -> Result<ProcessOutput>;

    /// Start a long-running command and return as soon as it is spawned.
    /// The session outlives the caller and is only ended through
    /// [`HostedSession::terminate`] (or by being dropped).
    async fn host(
        &self,
        invocation: &Invocation,
        on_line: LineCallback,
    ) -> Result<Box<dyn HostedSession>>;
}

/// Handle to a running `host` process
#[async_trait]
pub trait HostedSession: Send + Sync {
    fn pid(&self) -> Option<u32>;

    fn has_exited(&self) -> bool;

    /// Ask the session to exit, forcing it after `grace`
    async fn terminate(&mut self, grace: Duration) -> Result<()>;
}

/// [`ProcessRunner`] backed by real child processes
#[derive(Debug, Clone, Default)]
pub struct AgentRunner;

impl AgentRunner {
    pub fn new() -> Self {
        Self
    }
}

fn spawn_error(program: &str, err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::NotFound {
        Error::AgentNotFound(program.to_string())
    } else {
        Error::Io(err)
    }
}

#[async_trait]
impl ProcessRunner for AgentRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        debug!("Running: {}", invocation);

        let child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the wait future on cancel/timeout kills the child
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&invocation.program, e))?;

        let limit = invocation.timeout;
        let deadline = async move {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Cancelled: {}", invocation);
                Err(Error::Cancelled)
            }

            _ = deadline => {
                warn!("Timed out after {:?}: {}", limit.unwrap_or_default(), invocation);
                Err(Error::Timeout {
                    command: invocation.to_string(),
                    after: limit.unwrap_or_default(),
                })
            }

            output = child.wait_with_output() => {
                let output = output?;
                let result = ProcessOutput {
                    exit_code: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                };
                debug!("Exit code {}: {}", result.exit_code, invocation);
                Ok(result)
            }
        }
    }

    async fn host(
        &self,
        invocation: &Invocation,
        on_line: LineCallback,
    ) -> Result<Box<dyn HostedSession>> {
        info!("Starting hosted session: {}", invocation);

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    // New session so stop can signal the whole process group
                    if libc::setsid() == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| spawn_error(&invocation.program, e))?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, move |line| on_line(line)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, |line| warn!("host: {}", line)));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                // Fires on an explicit kill or when the session handle is dropped
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    warn!("Failed to wait for hosted session: {}", e);
                    -1
                }
            };
            info!("Hosted session exited with code {}", code);
            let _ = exit_tx.send(Some(code));
        });

        Ok(Box::new(AgentSession {
            pid,
            exit_rx,
            kill_tx: Some(kill_tx),
        }))
    }
}

/// Hand each non-empty line of `reader` to `on_line` until EOF
///
/// Bytes that are not valid UTF-8 are replaced rather than ending the
/// stream.
async fn forward_lines<R, F>(reader: R, on_line: F)
where
    R: AsyncRead + Unpin,
    F: Fn(&str),
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if !line.is_empty() {
                    on_line(line);
                }
            }
            Err(e) => {
                debug!("Stopped reading hosted session output: {}", e);
                break;
            }
        }
    }
}

/// Session spawned by [`AgentRunner::host`]
struct AgentSession {
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<i32>>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl AgentSession {
    #[cfg(unix)]
    fn signal_group(&self, signal: libc::c_int) {
        if let Some(pid) = self.pid {
            // The session leader's pid doubles as the process group id
            let result = unsafe { libc::kill(-(pid as i32), signal) };
            if result != 0 {
                debug!(
                    "Signal {} to process group {} failed: {}",
                    signal,
                    pid,
                    io::Error::last_os_error()
                );
            }
        }
    }

    async fn wait_exit(&self, limit: Duration) -> bool {
        let mut exit_rx = self.exit_rx.clone();
        tokio::time::timeout(limit, exit_rx.wait_for(|code| code.is_some()))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}

#[async_trait]
impl HostedSession for AgentSession {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    async fn terminate(&mut self, grace: Duration) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }

        #[cfg(unix)]
        self.signal_group(libc::SIGTERM);
        #[cfg(not(unix))]
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }

        if self.wait_exit(grace).await {
            return Ok(());
        }

        warn!(
            "Hosted session did not exit within {:?}, killing it",
            grace
        );
        #[cfg(unix)]
        self.signal_group(libc::SIGKILL);
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }

        if self.wait_exit(REAP_TIMEOUT).await {
            Ok(())
        } else {
            Err(Error::Provisioning(
                "hosted session could not be terminated".to_string(),
            ))
        }
    }
}
