//! Controller-side execution via a local shell child.

use super::{exit_code, ClientError};
use crate::prefix;
use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

/// Runs task snippets in a `bash -c` child on the controller host.
#[derive(Debug)]
pub struct LocalClient {
    user: String,
    env: String,
    child: Option<Child>,
    running: bool,
}

impl LocalClient {
    /// Record the operator's username; no connection is involved.
    pub fn connect(env: String) -> Result<Self, ClientError> {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .or_else(|_| std::env::var("LOGNAME"))
            .unwrap_or_else(|_| "unknown".to_string());

        Ok(Self {
            user,
            env,
            child: None,
            running: false,
        })
    }

    pub fn run(&mut self, snippet: &str) -> Result<(), ClientError> {
        if self.running {
            return Err(ClientError::AlreadyRunning);
        }

        let child = Command::new("bash")
            .arg("-c")
            .arg(format!("{}{}", self.env, snippet))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(ClientError::Start)?;

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
        let label = format!("{}@localhost | ", self.user);
        let printable = label.len();
        (format!("{}{}", prefix::RESET, label), printable)
    }

    pub fn close(&mut self) {
        self.child = None;
        self.running = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Signal;
    use crate::client::SIGTERM_STATUS;

    fn local() -> LocalClient {
        LocalClient::connect(String::new()).expect("local connect")
    }

    #[tokio::test]
    async fn test_run_and_wait_success() {
        let mut client = local();
        client.run("true").unwrap();
        client.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_reports_exit_status() {
        let mut client = local();
        client.run("exit 7").unwrap();
        match client.wait().await {
            Err(ClientError::Exit { code }) => assert_eq!(code, 7),
            other => panic!("expected exit status 7, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_twice_is_rejected() {
        let mut client = local();
        client.run("sleep 5").unwrap();
        assert!(matches!(
            client.run("true"),
            Err(ClientError::AlreadyRunning)
        ));
        let pid = client.pid().unwrap();
        super::super::send_signal(pid, Signal::Terminate).await.unwrap();
        let _ = client.wait().await;
    }

    #[tokio::test]
    async fn test_env_is_exported_to_the_child() {
        let mut client =
            LocalClient::connect("export GREETING=\"hello\";".to_string()).unwrap();
        client.run("test \"$GREETING\" = hello").unwrap();
        client.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_sigterm_maps_to_status_15() {
        let mut client = local();
        client.run("sleep 5").unwrap();
        let pid = client.pid().unwrap();
        super::super::send_signal(pid, Signal::Terminate).await.unwrap();
        match client.wait().await {
            Err(ClientError::Exit { code }) => assert_eq!(code, SIGTERM_STATUS),
            other => panic!("expected status 15, got {other:?}"),
        }
    }

    #[test]
    fn test_prefix_excludes_escapes_from_printable_length() {
        let client = local();
        let (prefix, len) = client.prefix();
        assert!(prefix.ends_with("@localhost | "));
        assert!(prefix.len() > len);
    }

    #[tokio::test]
    async fn test_wait_without_run_is_an_error() {
        let mut client = local();
        assert!(matches!(
            client.wait().await,
            Err(ClientError::NotRunning)
        ));
    }
}
