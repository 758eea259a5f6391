//! The run loop.
//!
//! A run connects every host of the network in parallel, then drives each
//! command's tasks strictly in order. Within a task the motif is always
//! the same: start every client, pump its output streams, fan controller
//! input in, forward operator interrupts, join everything, and settle the
//! exit policy before the next task may begin.

use crate::client::{
    send_signal, Bastion, Client, ClientError, LocalClient, Signal, SshClient, SIGTERM_STATUS,
};
use crate::command::Command;
use crate::env::EnvList;
use crate::network::Network;
use crate::prefix;
use crate::task::{build_tasks, Task, TaskError, TaskInput, TaskTargets};
use futures::future::join_all;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command as ProcessCommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Knobs the CLI exposes to the engine.
pub struct RunOptions {
    /// Tag every output line with the padded host label.
    pub prefix: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { prefix: true }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("no commands to be run")]
    NoCommands,

    #[error("failed to create control socket directory")]
    ControlDir(#[source] std::io::Error),

    #[error("connecting to clients failed")]
    Connect(#[source] ClientError),

    #[error("{prefix}starting task failed")]
    TaskStart {
        prefix: String,
        #[source]
        source: ClientError,
    },

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("task failed with exit status {code}")]
    TaskFailed { code: i32 },

    #[error("run interrupted")]
    Interrupted,
}

impl RunError {
    /// The process exit status this failure maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::TaskFailed { code } => *code,
            _ => 1,
        }
    }
}

/// Run `commands` over the network's hosts.
///
/// All clients are connected up front and reused by every task; whatever
/// happens, they are closed before this returns.
pub async fn run(
    network: &Network,
    env_vars: &EnvList,
    commands: &[Command],
    options: &RunOptions,
) -> Result<(), RunError> {
    if commands.is_empty() {
        return Err(RunError::NoCommands);
    }
    let env = env_vars.as_export();

    // Control sockets for ssh multiplexing live for exactly one run.
    let control_dir = tempfile::Builder::new()
        .prefix("drover-")
        .tempdir()
        .map_err(RunError::ControlDir)?;

    let bastion = match &network.bastion {
        Some(addr) => Some(Arc::new(
            Bastion::connect(
                addr,
                network.user.as_deref(),
                network.identity_file.as_deref(),
                control_dir.path(),
            )
            .await
            .map_err(RunError::Connect)?,
        )),
        None => None,
    };

    let mut clients =
        match connect_all(network, &env, bastion.clone(), control_dir.path()).await {
            Ok(clients) => clients,
            Err(err) => {
                if let Some(bastion) = &bastion {
                    bastion.close().await;
                }
                return Err(err);
            }
        };

    let max_len = clients.iter().map(|c| c.prefix().1).max().unwrap_or(0);
    debug!(clients = clients.len(), "all clients connected");

    let result = drive_commands(&mut clients, commands, &env, max_len, options).await;

    close_all(&mut clients).await;
    if let Some(bastion) = &bastion {
        bastion.close().await;
    }
    result
}

/// Connect one client per host, in parallel, and return them in network
/// order. The first connect failure wins; clients that did come up are
/// closed again.
async fn connect_all(
    network: &Network,
    env: &str,
    bastion: Option<Arc<Bastion>>,
    control_dir: &Path,
) -> Result<Vec<Client>, RunError> {
    let mut connectors: Vec<JoinHandle<(usize, Result<Client, ClientError>)>> = Vec::new();

    for (index, host) in network.hosts.iter().enumerate() {
        let host = host.clone();
        let host_env = format!("{env}export DROVER_HOST=\"{host}\";");

        if host == "localhost" {
            connectors.push(tokio::spawn(async move {
                (index, LocalClient::connect(host_env).map(Client::Local))
            }));
        } else {
            let user = network.user.clone();
            let identity = network.identity_file.clone();
            let bastion = bastion.clone();
            let control_path = control_dir.join(format!("mux-{index}.sock"));
            let color = prefix::host_color(index);
            connectors.push(tokio::spawn(async move {
                let result = SshClient::connect(
                    &host,
                    user.as_deref(),
                    identity.as_deref(),
                    bastion.as_deref(),
                    &control_path,
                    color,
                    host_env,
                )
                .await;
                (index, result.map(Client::Ssh))
            }));
        }
    }

    let mut slots: Vec<Option<Client>> = Vec::new();
    slots.resize_with(network.hosts.len(), || None);
    let mut first_error: Option<ClientError> = None;

    for connector in connectors {
        match connector.await {
            Ok((index, Ok(client))) => slots[index] = Some(client),
            Ok((_, Err(err))) => {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
            Err(err) => {
                if first_error.is_none() {
                    first_error = Some(ClientError::Connect {
                        host: "connector".to_string(),
                        reason: anyhow::Error::new(err),
                    });
                }
            }
        }
    }

    let mut clients: Vec<Client> = slots.into_iter().flatten().collect();
    if let Some(err) = first_error {
        close_all(&mut clients).await;
        return Err(RunError::Connect(err));
    }
    Ok(clients)
}

async fn drive_commands(
    clients: &mut Vec<Client>,
    commands: &[Command],
    env: &str,
    max_len: usize,
    options: &RunOptions,
) -> Result<(), RunError> {
    for command in commands {
        debug!(command = %command.name, "running command");
        for task in build_tasks(command, clients.len(), env)? {
            let Task { run, input, targets } = task;
            match targets {
                TaskTargets::Range(range) => {
                    execute_task(&mut clients[range], &run, input, max_len, options).await?;
                }
                TaskTargets::Local(local) => {
                    let mut solo = [Client::Local(*local)];
                    execute_task(&mut solo, &run, input, max_len, options).await?;
                }
            }
        }
    }
    Ok(())
}

/// Fan one task out over its clients and join it completely.
///
/// Starts happen in declaration order; everything after that is
/// concurrent. No part of the next task may begin until the pumps have
/// drained and every waiter has settled.
async fn execute_task(
    clients: &mut [Client],
    snippet: &str,
    input: Option<TaskInput>,
    max_len: usize,
    options: &RunOptions,
) -> Result<(), RunError> {
    if clients.is_empty() {
        return Ok(());
    }

    let mut pumps: Vec<JoinHandle<()>> = Vec::new();
    let mut writers: Vec<ChildStdin> = Vec::new();
    let mut pids: Vec<u32> = Vec::new();
    let mut prefixes: Vec<String> = Vec::new();

    for client in clients.iter_mut() {
        let prefix = if options.prefix {
            let (text, printable) = client.prefix();
            prefix::pad(&text, printable, max_len)
        } else {
            String::new()
        };

        if let Err(source) = client.run(snippet) {
            return Err(RunError::TaskStart { prefix, source });
        }

        if let Some(pid) = client.pid() {
            pids.push(pid);
        }
        if let Some(stdout) = client.take_stdout() {
            pumps.push(tokio::spawn(pump_lines(stdout, prefix.clone(), StreamKind::Stdout)));
        }
        if let Some(stderr) = client.take_stderr() {
            pumps.push(tokio::spawn(pump_lines(stderr, prefix.clone(), StreamKind::Stderr)));
        }
        if let Some(stdin) = client.take_stdin() {
            writers.push(stdin);
        }
        prefixes.push(prefix);
    }

    let stdin_pump: Option<JoinHandle<()>> = match input {
        Some(TaskInput::Stdin) => {
            let writers = std::mem::take(&mut writers);
            Some(tokio::spawn(async move {
                let mut stdin = tokio::io::stdin();
                fan_in(&mut stdin, writers).await;
            }))
        }
        Some(TaskInput::LocalCommand { program, args }) => {
            let writers = std::mem::take(&mut writers);
            Some(tokio::spawn(stream_local_command(program, args, writers)))
        }
        None => None,
    };

    // Trap operator interrupts for the lifetime of this task only and
    // fan them out to every client.
    let trap_pids = pids.clone();
    let trap: JoinHandle<()> = tokio::spawn(async move {
        let mut interrupts = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%err, "installing interrupt trap failed");
                return;
            }
        };
        loop {
            if interrupts.recv().await.is_none() {
                return;
            }
            for pid in &trap_pids {
                if let Err(err) = send_signal(*pid, Signal::Interrupt).await {
                    eprintln!("sending signal failed: {err}");
                }
            }
        }
    });

    for pump in pumps {
        let _ = pump.await;
    }

    let results = join_all(clients.iter_mut().map(|client| client.wait())).await;

    // The input pump normally finishes on its own EOF; if the clients
    // died first it would sit on a read forever.
    if let Some(pump) = stdin_pump {
        pump.abort();
        let _ = pump.await;
    }
    trap.abort();
    let _ = trap.await;

    // Without task input, client stdins stay open until the task is over.
    drop(writers);

    settle(&results, &prefixes)
}

/// Decide a task's fate from the per-client wait results, in client
/// order. The first non-15 status becomes the run's exit code; signalled
/// terminations (status 15) are not reported per host but still abort
/// the run, with exit 1 when nothing else failed.
fn settle(results: &[Result<(), ClientError>], prefixes: &[String]) -> Result<(), RunError> {
    let mut code: Option<i32> = None;
    let mut signalled = false;

    for (result, prefix) in results.iter().zip(prefixes) {
        let Err(err) = result else { continue };
        match err {
            ClientError::Exit { code: status } if *status == SIGTERM_STATUS => {
                signalled = true;
            }
            ClientError::Exit { code: status } => {
                eprintln!("{prefix}{err}");
                if code.is_none() {
                    code = Some(*status);
                }
            }
            other => {
                eprintln!("{prefix}{other}");
                if code.is_none() {
                    code = Some(1);
                }
            }
        }
    }

    match (code, signalled) {
        (Some(code), _) => Err(RunError::TaskFailed { code }),
        (None, true) => Err(RunError::Interrupted),
        (None, false) => Ok(()),
    }
}

async fn close_all(clients: &mut [Client]) {
    for client in clients.iter_mut() {
        client.close().await;
    }
}

enum StreamKind {
    Stdout,
    Stderr,
}

/// Copy a child stream to the controller line by line, each line tagged
/// with the client label. Whole-line writes keep interleaved output from
/// different hosts readable.
async fn pump_lines<R>(stream: R, prefix: String, kind: StreamKind)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match kind {
                StreamKind::Stdout => println!("{prefix}{line}"),
                StreamKind::Stderr => eprintln!("{prefix}{line}"),
            },
            Ok(None) => return,
            Err(err) => {
                eprintln!("{prefix}reading output failed: {err}");
                return;
            }
        }
    }
}

/// Copy `reader` into every writer, then close them all so the shells
/// see EOF.
async fn fan_in<R>(reader: &mut R, mut writers: Vec<ChildStdin>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for writer in writers.iter_mut() {
                    if let Err(err) = writer.write_all(&buf[..n]).await {
                        eprintln!("copying STDIN failed: {err}");
                    }
                }
            }
            Err(err) => {
                eprintln!("copying STDIN failed: {err}");
                break;
            }
        }
    }
    for mut writer in writers {
        let _ = writer.shutdown().await;
    }
}

/// Spawn the task's input command (the tar stream of an upload) and fan
/// its stdout into every client's stdin.
async fn stream_local_command(program: String, args: Vec<String>, writers: Vec<ChildStdin>) {
    let child = ProcessCommand::new(&program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn();

    let mut child = match child {
        Ok(child) => child,
        Err(err) => {
            eprintln!("starting {program} failed: {err}");
            for mut writer in writers {
                let _ = writer.shutdown().await;
            }
            return;
        }
    };

    match child.stdout.take() {
        Some(mut stdout) => fan_in(&mut stdout, writers).await,
        None => {
            for mut writer in writers {
                let _ = writer.shutdown().await;
            }
        }
    }

    match child.wait().await {
        Ok(status) if !status.success() => {
            eprintln!("{program} exited with status {}", status.code().unwrap_or(1));
        }
        Ok(_) => {}
        Err(err) => eprintln!("waiting for {program} failed: {err}"),
    }
}
