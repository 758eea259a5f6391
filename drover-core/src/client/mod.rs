//! Execution clients.
//!
//! A client is a live handle to one target of execution: either a shell
//! child on the controller, or an SSH session to a remote host. Both
//! variants expose the same surface so the run loop can drive a mixed set
//! uniformly.

mod local;
mod ssh;

pub use local::LocalClient;
pub use ssh::{Bastion, SshClient};

use std::process::ExitStatus;
use thiserror::Error;
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};

/// Exit status a process reports when terminated by SIGTERM. Treated as
/// the expected consequence of forwarded operator interrupts, so it is
/// never surfaced as the run's exit code.
pub const SIGTERM_STATUS: i32 = 15;

/// Errors raised by clients.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connecting to {host} failed: {reason}")]
    Connect { host: String, reason: anyhow::Error },

    #[error("task already running")]
    AlreadyRunning,

    #[error("no task running")]
    NotRunning,

    #[error("starting task failed: {0}")]
    Start(#[source] std::io::Error),

    #[error("process exited with status {code}")]
    Exit { code: i32 },

    #[error("sending signal to pid {pid} failed")]
    Signal { pid: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Signals the engine forwards into running tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
}

impl Signal {
    fn kill_flag(self) -> &'static str {
        match self {
            Signal::Interrupt => "-INT",
            Signal::Terminate => "-TERM",
        }
    }
}

/// Deliver `sig` to a local process. Best effort: the target may already
/// be gone, and for SSH sessions the remote side may not see the signal
/// at all.
pub async fn send_signal(pid: u32, sig: Signal) -> Result<(), ClientError> {
    let status = tokio::process::Command::new("kill")
        .arg(sig.kill_flag())
        .arg(pid.to_string())
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(ClientError::Signal { pid })
    }
}

/// Map a child's exit status to the numeric code the run reports.
///
/// A signalled child has no exit code; the signal number stands in, so a
/// SIGTERM death reads as status 15.
pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal()).unwrap_or(1)
}

/// A live execution target.
pub enum Client {
    Local(LocalClient),
    Ssh(SshClient),
}

impl Client {
    /// Start a shell snippet on this client. The three standard streams
    /// become available for taking afterwards.
    pub fn run(&mut self, snippet: &str) -> Result<(), ClientError> {
        match self {
            Client::Local(c) => c.run(snippet),
            Client::Ssh(c) => c.run(snippet),
        }
    }

    /// Block until the current task exits; non-zero maps to
    /// [`ClientError::Exit`].
    pub async fn wait(&mut self) -> Result<(), ClientError> {
        match self {
            Client::Local(c) => c.wait().await,
            Client::Ssh(c) => c.wait().await,
        }
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        match self {
            Client::Local(c) => c.take_stdout(),
            Client::Ssh(c) => c.take_stdout(),
        }
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        match self {
            Client::Local(c) => c.take_stderr(),
            Client::Ssh(c) => c.take_stderr(),
        }
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        match self {
            Client::Local(c) => c.take_stdin(),
            Client::Ssh(c) => c.take_stdin(),
        }
    }

    /// Pid of the controller-side process driving the current task.
    pub fn pid(&self) -> Option<u32> {
        match self {
            Client::Local(c) => c.pid(),
            Client::Ssh(c) => c.pid(),
        }
    }

    /// Forward a signal into the running task.
    pub async fn signal(&self, sig: Signal) -> Result<(), ClientError> {
        let Some(pid) = self.pid() else {
            return Err(ClientError::NotRunning);
        };
        send_signal(pid, sig).await
    }

    /// Display label and its printable length (escape sequences excluded).
    pub fn prefix(&self) -> (String, usize) {
        match self {
            Client::Local(c) => c.prefix(),
            Client::Ssh(c) => c.prefix(),
        }
    }

    /// Release persistent resources. No-op for local clients.
    pub async fn close(&mut self) {
        match self {
            Client::Local(c) => c.close(),
            Client::Ssh(c) => c.close().await,
        }
    }
}
