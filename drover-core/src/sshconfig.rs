//! ssh_config parsing and host rewriting.
//!
//! `--sshconfig <path>` lets a run borrow connection details from an
//! OpenSSH client configuration: for every network host whose name matches
//! a `Host` block, the user, hostname, port and identity file from that
//! block replace the Supfile's values.

use crate::network::{HostAddr, Network};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SshConfigError {
    #[error("failed to read ssh config at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// One `Host` block of an ssh_config file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigHost {
    /// Patterns of the `Host` line, wildcards excluded.
    pub aliases: Vec<String>,
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<String>,
}

impl ConfigHost {
    fn matches(&self, host: &str) -> bool {
        self.aliases.iter().any(|alias| alias == host)
    }
}

/// Parse the ssh_config file at `path`.
pub fn parse_file(path: &Path) -> Result<Vec<ConfigHost>, SshConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| SshConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_content(&content))
}

/// Parse ssh_config text into its `Host` blocks.
///
/// Only the keywords the engine consumes are interpreted (`Host`,
/// `HostName`, `User`, `Port`, `IdentityFile`); everything else is
/// skipped. Wildcard-only `Host` blocks carry global defaults, not
/// addressable hosts, and are dropped.
pub fn parse_content(content: &str) -> Vec<ConfigHost> {
    let mut hosts = Vec::new();
    let mut current: Option<ConfigHost> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = parse_line(line) else {
            continue;
        };

        match key.to_lowercase().as_str() {
            "host" => {
                if let Some(host) = current.take() {
                    if !host.aliases.is_empty() {
                        hosts.push(host);
                    }
                }
                let aliases: Vec<String> = value
                    .split_whitespace()
                    .filter(|alias| !alias.contains('*') && !alias.contains('?'))
                    .map(str::to_string)
                    .collect();
                current = Some(ConfigHost {
                    aliases,
                    ..ConfigHost::default()
                });
            }
            "hostname" => {
                if let Some(host) = current.as_mut() {
                    host.hostname = Some(value.to_string());
                }
            }
            "user" => {
                if let Some(host) = current.as_mut() {
                    host.user = Some(value.to_string());
                }
            }
            "port" => {
                if let Some(host) = current.as_mut() {
                    host.port = value.parse().ok();
                }
            }
            "identityfile" => {
                if let Some(host) = current.as_mut() {
                    host.identity_file = Some(expand_tilde(value));
                }
            }
            _ => {}
        }
    }

    if let Some(host) = current {
        if !host.aliases.is_empty() {
            hosts.push(host);
        }
    }

    hosts
}

/// Rewrite matching network hosts with their ssh_config details.
///
/// Hosts without a matching block are left untouched. The identity file
/// is a network-level setting; with several matched hosts the last match
/// wins.
pub fn apply_to_network(entries: &[ConfigHost], network: &mut Network) {
    for host in network.hosts.iter_mut() {
        let addr = HostAddr::parse(host);
        let Some(entry) = entries.iter().find(|e| e.matches(&addr.hostname)) else {
            continue;
        };

        let hostname = entry.hostname.as_deref().unwrap_or(&addr.hostname);
        let user = entry.user.clone().or(addr.user);
        let port = entry.port.or(addr.port);

        let mut rewritten = String::new();
        if let Some(user) = user {
            rewritten.push_str(&user);
            rewritten.push('@');
        }
        rewritten.push_str(hostname);
        if let Some(port) = port {
            rewritten.push_str(&format!(":{port}"));
        }
        *host = rewritten;

        if let Some(identity) = &entry.identity_file {
            network.identity_file = Some(PathBuf::from(identity));
        }
    }
}

// ssh_config accepts both `Key Value` and `Key=Value`.
fn parse_line(line: &str) -> Option<(&str, &str)> {
    if let Some((key, value)) = line.split_once('=') {
        return Some((key.trim(), value.trim()));
    }
    if let Some((key, value)) = line.split_once(char::is_whitespace) {
        return Some((key.trim(), value.trim()));
    }
    None
}

fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).display().to_string();
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# staging fleet
Host web1
    HostName 51.222.245.56
    User ubuntu
    IdentityFile ~/.ssh/staging.pem

Host web2 web2-alt
    HostName=37.187.75.150
    User=root
    Port=2222

Host *
    ServerAliveInterval 60
"#;

    #[test]
    fn test_parse_blocks() {
        let hosts = parse_content(SAMPLE);
        assert_eq!(hosts.len(), 2);

        assert_eq!(hosts[0].aliases, ["web1"]);
        assert_eq!(hosts[0].hostname.as_deref(), Some("51.222.245.56"));
        assert_eq!(hosts[0].user.as_deref(), Some("ubuntu"));
        assert!(
            hosts[0]
                .identity_file
                .as_deref()
                .unwrap()
                .ends_with(".ssh/staging.pem")
        );

        assert_eq!(hosts[1].aliases, ["web2", "web2-alt"]);
        assert_eq!(hosts[1].port, Some(2222));
    }

    #[test]
    fn test_wildcard_blocks_are_dropped() {
        let hosts = parse_content("Host *\n    User nobody\n");
        assert!(hosts.is_empty());
    }

    #[test]
    fn test_tilde_expansion() {
        assert!(!expand_tilde("~/.ssh/key").starts_with('~'));
        assert_eq!(expand_tilde("/abs/key"), "/abs/key");
    }

    #[test]
    fn test_apply_rewrites_matching_hosts_only() {
        let entries = parse_content(SAMPLE);
        let mut network = Network {
            hosts: vec!["web1".to_string(), "untouched.example.com".to_string()],
            ..Network::default()
        };
        apply_to_network(&entries, &mut network);
        assert_eq!(network.hosts[0], "ubuntu@51.222.245.56");
        assert_eq!(network.hosts[1], "untouched.example.com");
        assert!(network.identity_file.is_some());
    }

    #[test]
    fn test_apply_keeps_existing_user_when_block_has_none() {
        let entries = parse_content("Host web3\n    HostName 10.0.0.3\n");
        let mut network = Network {
            hosts: vec!["deploy@web3:2200".to_string()],
            ..Network::default()
        };
        apply_to_network(&entries, &mut network);
        assert_eq!(network.hosts[0], "deploy@10.0.0.3:2200");
        assert!(network.identity_file.is_none());
    }
}
