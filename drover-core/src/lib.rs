//! Execution engine for drover.
//!
//! Takes a [`Network`] (hosts, optional bastion, default user), an
//! ordered [`EnvList`] and a list of [`Command`]s, and drives the
//! commands across every host in parallel: local shells for `localhost`,
//! multiplexed OpenSSH sessions for everything else, merged line-prefixed
//! output, forwarded interrupts, and fail-fast exit-status semantics.

pub mod client;
pub mod command;
pub mod env;
pub mod network;
pub mod prefix;
pub mod run;
pub mod sshconfig;
pub mod supfile;
pub mod task;

pub use client::{Client, ClientError, LocalClient, Signal, SshClient};
pub use command::{Command, Upload};
pub use env::{EnvError, EnvList};
pub use network::{HostAddr, Network};
pub use run::{run, RunError, RunOptions};
pub use supfile::{Supfile, SupfileError};
pub use task::{build_tasks, Task, TaskError, TaskInput, TaskTargets};
