//! Remote execution over the system OpenSSH client.
//!
//! Connecting a host establishes an OpenSSH ControlMaster bound to a
//! run-scoped socket; every task then opens a cheap multiplexed session
//! over that master. Authentication (agent, key files, passphrase
//! prompts) happens once, at master time, and is delegated to `ssh`
//! itself. Bastion networks route each master through a shared `-W`
//! proxy over the bastion's own control socket.

use super::{exit_code, ClientError};
use crate::network::HostAddr;
use anyhow::anyhow;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::debug;

/// The shared tunnel entry point of a bastion network.
///
/// Owns a ControlMaster to the bastion host; remote clients receive a
/// reference at connect time and dial their own transport through it.
pub struct Bastion {
    destination: String,
    port: Option<u16>,
    control_path: PathBuf,
}

impl Bastion {
    pub async fn connect(
        addr: &str,
        default_user: Option<&str>,
        identity: Option<&Path>,
        control_dir: &Path,
    ) -> Result<Self, ClientError> {
        let parsed = HostAddr::parse(addr);
        let destination = match resolve_user(&parsed, default_user) {
            Some(user) => format!("{}@{}", user, parsed.hostname),
            None => parsed.hostname.clone(),
        };
        let control_path = control_dir.join("bastion.sock");

        open_master(&destination, parsed.port, identity, None, &control_path)
            .await
            .map_err(|reason| ClientError::Connect {
                host: addr.to_string(),
                reason,
            })?;
        debug!(bastion = addr, "bastion master established");

        Ok(Self {
            destination,
            port: parsed.port,
            control_path,
        })
    }

    /// ProxyCommand that opens a host transport through this bastion.
    pub fn proxy_command(&self) -> String {
        let mut cmd = format!("ssh -S {} ", self.control_path.display());
        if let Some(port) = self.port {
            cmd.push_str(&format!("-p {port} "));
        }
        cmd.push_str(&format!("-W %h:%p {}", self.destination));
        cmd
    }

    pub async fn close(&self) {
        close_master(&self.destination, &self.control_path).await;
    }
}

/// A remote host driven over a per-host ControlMaster.
pub struct SshClient {
    user: Option<String>,
    hostname: String,
    port: Option<u16>,
    control_path: PathBuf,
    env: String,
    color: &'static str,
    child: Option<Child>,
    running: bool,
    connected: bool,
}

impl SshClient {
    /// Establish the transport to `host` (`user@host:port` accepted).
    ///
    /// The user falls back to the network's user, then to the
    /// controller's current user; with neither set the OpenSSH client
    /// applies its own configuration.
    pub async fn connect(
        host: &str,
        default_user: Option<&str>,
        identity: Option<&Path>,
        bastion: Option<&Bastion>,
        control_path: &Path,
        color: &'static str,
        env: String,
    ) -> Result<Self, ClientError> {
        let parsed = HostAddr::parse(host);
        let user = resolve_user(&parsed, default_user);
        let dest = match &user {
            Some(user) => format!("{}@{}", user, parsed.hostname),
            None => parsed.hostname.clone(),
        };

        let proxy = bastion.map(Bastion::proxy_command);
        open_master(&dest, parsed.port, identity, proxy.as_deref(), control_path)
            .await
            .map_err(|reason| ClientError::Connect {
                host: host.to_string(),
                reason,
            })?;
        debug!(host, "ssh master established");

        Ok(Self {
            user,
            hostname: parsed.hostname,
            port: parsed.port,
            control_path: control_path.to_path_buf(),
            env,
            color,
            child: None,
            running: false,
            connected: true,
        })
    }

    fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.hostname),
            None => self.hostname.clone(),
        }
    }

    /// Open a multiplexed session running the task snippet.
    pub fn run(&mut self, snippet: &str) -> Result<(), ClientError> {
        if self.running {
            return Err(ClientError::AlreadyRunning);
        }

        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()));
        cmd.arg("-o").arg("BatchMode=yes");
        if let Some(port) = self.port {
            cmd.arg("-p").arg(port.to_string());
        }
        cmd.arg(self.destination());
        cmd.arg("--").arg(format!("{}{}", self.env, snippet));
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = cmd.spawn().map_err(ClientError::Start)?;
        self.child = Some(child);
        self.running = true;
        Ok(())
    }

    pub async fn wait(&mut self) -> Result<(), ClientError> {
        let Some(child) = self.child.as_mut() else {
            return Err(ClientError::NotRunning);
        };
        let status = child.wait().await?;
        self.running = false;
        if status.success() {
            Ok(())
        } else {
            Err(ClientError::Exit {
                code: exit_code(status),
            })
        }
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.as_mut().and_then(|c| c.stdout.take())
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.as_mut().and_then(|c| c.stderr.take())
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.as_mut().and_then(|c| c.stdin.take())
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    pub fn prefix(&self) -> (String, usize) {
        let label = match self.port {
            Some(port) => format!("{}:{}", self.hostname, port),
            None => self.hostname.clone(),
        };
        let label = match &self.user {
            Some(user) => format!("{user}@{label} | "),
            None => format!("{label} | "),
        };
        let printable = label.len();
        (format!("{}{}", self.color, label), printable)
    }

    /// Tear the master down; idempotent.
    pub async fn close(&mut self) {
        if !self.connected {
            return;
        }
        close_master(&self.destination(), &self.control_path).await;
        self.connected = false;
    }
}

// Address user wins, then the network user, then the operator's own.
fn resolve_user(addr: &HostAddr, default_user: Option<&str>) -> Option<String> {
    addr.user
        .clone()
        .or_else(|| default_user.map(str::to_string))
        .or_else(|| std::env::var("USER").ok())
}

/// Establish a ControlMaster to `dest`.
///
/// Runs with inherited stdio so `ssh` can prompt for passphrases or host
/// key confirmation on the controller's terminal. With `-N -f` the
/// client forks once the master is up, so a zero status means the socket
/// is ready.
async fn open_master(
    dest: &str,
    port: Option<u16>,
    identity: Option<&Path>,
    proxy_command: Option<&str>,
    control_path: &Path,
) -> anyhow::Result<()> {
    let mut cmd = Command::new("ssh");
    cmd.arg("-o").arg("ConnectTimeout=10");
    cmd.arg("-o").arg("StrictHostKeyChecking=accept-new");
    cmd.arg("-o")
        .arg(format!("ControlPath={}", control_path.display()));
    cmd.arg("-o").arg("ControlMaster=yes");
    cmd.arg("-o").arg("ControlPersist=yes");
    if let Some(proxy) = proxy_command {
        cmd.arg("-o").arg(format!("ProxyCommand={proxy}"));
    }
    if let Some(port) = port {
        cmd.arg("-p").arg(port.to_string());
    }
    if let Some(identity) = identity {
        cmd.arg("-i").arg(identity);
    }
    cmd.arg("-N").arg("-f").arg(dest);

    let status = cmd.status().await?;
    if !status.success() {
        return Err(anyhow!(
            "ssh master connection exited with status {}",
            status.code().unwrap_or(1)
        ));
    }
    Ok(())
}

async fn close_master(dest: &str, control_path: &Path) {
    let result = Command::new("ssh")
        .arg("-O")
        .arg("exit")
        .arg("-o")
        .arg(format!("ControlPath={}", control_path.display()))
        .arg(dest)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(err) = result {
        debug!(dest, %err, "closing ssh master failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_user_beats_the_network_user() {
        let addr = HostAddr::parse("deploy@web1");
        assert_eq!(resolve_user(&addr, Some("fallback")).as_deref(), Some("deploy"));
    }

    #[test]
    fn test_network_user_applies_when_the_address_has_none() {
        let addr = HostAddr::parse("web1:2222");
        assert_eq!(resolve_user(&addr, Some("deploy")).as_deref(), Some("deploy"));
    }

    #[test]
    fn test_proxy_command_routes_through_control_socket() {
        let bastion = Bastion {
            destination: "ops@gate".to_string(),
            port: Some(2200),
            control_path: PathBuf::from("/tmp/run/bastion.sock"),
        };
        assert_eq!(
            bastion.proxy_command(),
            "ssh -S /tmp/run/bastion.sock -p 2200 -W %h:%p ops@gate"
        );
    }
}
