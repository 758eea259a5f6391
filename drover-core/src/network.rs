//! Host groups and remote address handling.

use crate::env::EnvList;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Command;

/// A named group of hosts, with an optional bastion and default user.
///
/// The `hosts` order is load-bearing: clients are created, labeled and
/// batched in this order for the whole run.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Network {
    /// Default account for hosts that do not carry their own `user@`.
    pub user: Option<String>,
    /// Intermediary host all remote transports are tunneled through.
    pub bastion: Option<String>,
    /// Host addresses, possibly in `user@host:port` form.
    pub hosts: Vec<String>,
    /// Shell snippet whose stdout, split by whitespace, extends `hosts`.
    pub inventory: Option<String>,
    pub env: EnvList,
    /// Private key for all hosts of this network, e.g. from `--sshconfig`.
    #[serde(skip)]
    pub identity_file: Option<PathBuf>,
}

impl Network {
    /// Run the inventory snippet and return the host addresses it prints.
    pub fn parse_inventory(&self) -> Result<Vec<String>> {
        let Some(snippet) = &self.inventory else {
            return Ok(Vec::new());
        };

        let output = Command::new("bash")
            .arg("-c")
            .arg(snippet)
            .output()
            .context("running inventory snippet failed")?;
        if !output.status.success() {
            anyhow::bail!(
                "inventory snippet exited with status {}: {}",
                output.status.code().unwrap_or(1),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .map(str::to_string)
            .collect())
    }
}

/// A host address split into its `user@host:port` parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAddr {
    pub user: Option<String>,
    pub hostname: String,
    pub port: Option<u16>,
}

impl HostAddr {
    /// Split `user@host:port`; both user and port are optional.
    ///
    /// A trailing `:segment` that does not parse as a number is treated
    /// as part of the hostname.
    pub fn parse(addr: &str) -> Self {
        let (user, rest) = match addr.split_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            _ => (None, addr),
        };

        match rest.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => match port.parse::<u16>() {
                Ok(port) => Self {
                    user,
                    hostname: host.to_string(),
                    port: Some(port),
                },
                Err(_) => Self {
                    user,
                    hostname: rest.to_string(),
                    port: None,
                },
            },
            _ => Self {
                user,
                hostname: rest.to_string(),
                port: None,
            },
        }
    }

    /// The label shown in output prefixes: `host` or `host:port`.
    pub fn label(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.hostname, port),
            None => self.hostname.clone(),
        }
    }
}
