//! Translation of declarative commands into executable tasks.
//!
//! A task is the atomic unit the run loop drives: one resolved shell
//! snippet, the clients it targets, and optionally a byte source bound to
//! its standard input. One command yields one task in the common case,
//! several under `serial`, and none when there is nothing to do.

use crate::client::{ClientError, LocalClient};
use crate::command::Command;
use std::ops::Range;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    /// The command mixes fields that cannot be combined.
    #[error("command '{name}' mixes exclusive fields: {fields}")]
    BadCommand { name: String, fields: String },

    #[error("failed to read script {path}: {source}")]
    Script {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Byte source for a task's standard input.
#[derive(Debug)]
pub enum TaskInput {
    /// The controller's own standard input.
    Stdin,
    /// Stdout of a locally spawned command; spawned when the task starts
    /// so serial batches each get a fresh stream.
    LocalCommand { program: String, args: Vec<String> },
}

/// The clients a task runs on.
#[derive(Debug)]
pub enum TaskTargets {
    /// Contiguous slice of the run's client set, in network order.
    Range(Range<usize>),
    /// A controller-side client created for a `local` command.
    Local(Box<LocalClient>),
}

/// One unit of execution, consumed once by the run loop.
#[derive(Debug)]
pub struct Task {
    pub run: String,
    pub input: Option<TaskInput>,
    pub targets: TaskTargets,
}

/// Translate one command into its tasks for a run over `client_count`
/// clients. `env` is the run's export string, used for ad-hoc local
/// clients.
pub fn build_tasks(cmd: &Command, client_count: usize, env: &str) -> Result<Vec<Task>, TaskError> {
    check_exclusive_fields(cmd)?;

    let ranges = batch_ranges(client_count, cmd.once, cmd.serial);
    let mut tasks = Vec::new();

    if let Some(snippet) = &cmd.local {
        let local_env = format!("{env}export DROVER_HOST=\"localhost\";");
        tasks.push(Task {
            run: snippet.clone(),
            input: None,
            targets: TaskTargets::Local(Box::new(LocalClient::connect(local_env)?)),
        });
    } else if !cmd.upload.is_empty() {
        for range in &ranges {
            for upload in &cmd.upload {
                tasks.push(Task {
                    run: extract_snippet(&upload.dst),
                    input: Some(archive_stream(&upload.src)),
                    targets: TaskTargets::Range(range.clone()),
                });
            }
        }
    } else if let Some(path) = &cmd.script {
        let snippet = std::fs::read_to_string(path).map_err(|source| TaskError::Script {
            path: PathBuf::from(path),
            source,
        })?;
        for range in &ranges {
            tasks.push(Task {
                run: snippet.clone(),
                input: None,
                targets: TaskTargets::Range(range.clone()),
            });
        }
    } else if let Some(snippet) = &cmd.run {
        for range in &ranges {
            tasks.push(Task {
                run: snippet.clone(),
                input: None,
                targets: TaskTargets::Range(range.clone()),
            });
        }
    }

    if cmd.stdin {
        for task in &mut tasks {
            if task.input.is_none() {
                task.input = Some(TaskInput::Stdin);
            }
        }
    }

    Ok(tasks)
}

fn check_exclusive_fields(cmd: &Command) -> Result<(), TaskError> {
    let mut set = Vec::new();
    if cmd.run.is_some() {
        set.push("run");
    }
    if cmd.local.is_some() {
        set.push("local");
    }
    if cmd.script.is_some() {
        set.push("script");
    }
    if !cmd.upload.is_empty() {
        set.push("upload");
    }
    if set.len() > 1 {
        return Err(TaskError::BadCommand {
            name: cmd.name.clone(),
            fields: set.join(", "),
        });
    }
    Ok(())
}

/// Client index ranges a command fans out over: everything at once, only
/// the first client, or sequential batches of `serial` clients.
fn batch_ranges(count: usize, once: bool, serial: Option<usize>) -> Vec<Range<usize>> {
    if count == 0 {
        return Vec::new();
    }
    if once {
        return vec![0..1];
    }
    match serial {
        Some(n) if n > 0 => (0..count)
            .step_by(n)
            .map(|start| start..(start + n).min(count))
            .collect(),
        _ => vec![0..count],
    }
}

fn extract_snippet(dst: &str) -> String {
    format!("tar -C \"{dst}\" -xzf -")
}

fn archive_stream(src: &str) -> TaskInput {
    TaskInput::LocalCommand {
        program: "tar".to_string(),
        args: vec![
            "-C".to_string(),
            ".".to_string(),
            "-czf".to_string(),
            "-".to_string(),
            src.to_string(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Upload;
    use std::io::Write;

    fn run_command(snippet: &str) -> Command {
        Command {
            run: Some(snippet.to_string()),
            ..Command::default()
        }
    }

    #[test]
    fn test_default_is_one_task_over_all_clients() {
        let tasks = build_tasks(&run_command("date"), 4, "").unwrap();
        assert_eq!(tasks.len(), 1);
        match &tasks[0].targets {
            TaskTargets::Range(range) => assert_eq!(range.clone(), 0..4),
            TaskTargets::Local(_) => panic!("expected a host range"),
        }
    }

    #[test]
    fn test_once_trims_to_the_first_client() {
        let cmd = Command {
            once: true,
            ..run_command("date")
        };
        let tasks = build_tasks(&cmd, 5, "").unwrap();
        assert_eq!(tasks.len(), 1);
        match &tasks[0].targets {
            TaskTargets::Range(range) => assert_eq!(range.clone(), 0..1),
            TaskTargets::Local(_) => panic!("expected a host range"),
        }
    }

    #[test]
    fn test_serial_partitions_in_network_order() {
        let cmd = Command {
            serial: Some(2),
            ..run_command("date")
        };
        let tasks = build_tasks(&cmd, 5, "").unwrap();
        let ranges: Vec<Range<usize>> = tasks
            .iter()
            .map(|t| match &t.targets {
                TaskTargets::Range(r) => r.clone(),
                TaskTargets::Local(_) => panic!("expected a host range"),
            })
            .collect();
        assert_eq!(ranges, vec![0..2, 2..4, 4..5]);
    }

    #[test]
    fn test_serial_larger_than_client_count() {
        let cmd = Command {
            serial: Some(10),
            ..run_command("date")
        };
        let tasks = build_tasks(&cmd, 3, "").unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[test]
    fn test_no_clients_yields_no_tasks() {
        let tasks = build_tasks(&run_command("date"), 0, "").unwrap();
        assert!(tasks.is_empty());
    }

    #[test]
    fn test_docs_only_command_yields_no_tasks() {
        let cmd = Command {
            desc: Some("annotation".to_string()),
            ..Command::default()
        };
        assert!(build_tasks(&cmd, 3, "").unwrap().is_empty());
    }

    #[test]
    fn test_mixed_fields_are_rejected() {
        let cmd = Command {
            run: Some("date".to_string()),
            script: Some("deploy.sh".to_string()),
            name: "broken".to_string(),
            ..Command::default()
        };
        let err = build_tasks(&cmd, 1, "").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("broken"));
        assert!(message.contains("run"));
        assert!(message.contains("script"));
    }

    #[test]
    fn test_upload_combined_with_run_is_rejected() {
        let cmd = Command {
            run: Some("date".to_string()),
            upload: vec![Upload {
                src: "a".to_string(),
                dst: "b".to_string(),
            }],
            ..Command::default()
        };
        assert!(build_tasks(&cmd, 1, "").is_err());
    }

    #[test]
    fn test_upload_desugars_to_a_tar_pipe() {
        let cmd = Command {
            upload: vec![Upload {
                src: "./build".to_string(),
                dst: "/srv/app".to_string(),
            }],
            ..Command::default()
        };
        let tasks = build_tasks(&cmd, 2, "").unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].run, "tar -C \"/srv/app\" -xzf -");
        match &tasks[0].input {
            Some(TaskInput::LocalCommand { program, args }) => {
                assert_eq!(program, "tar");
                assert!(args.contains(&"./build".to_string()));
            }
            _ => panic!("expected a local tar stream"),
        }
    }

    #[test]
    fn test_script_contents_become_the_snippet() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "echo from-script").unwrap();
        let cmd = Command {
            script: Some(file.path().display().to_string()),
            ..Command::default()
        };
        let tasks = build_tasks(&cmd, 1, "").unwrap();
        assert_eq!(tasks[0].run.trim(), "echo from-script");
    }

    #[test]
    fn test_missing_script_is_an_error() {
        let cmd = Command {
            script: Some("/nonexistent/deploy.sh".to_string()),
            ..Command::default()
        };
        assert!(matches!(
            build_tasks(&cmd, 1, ""),
            Err(TaskError::Script { .. })
        ));
    }

    #[test]
    fn test_local_command_runs_on_the_controller() {
        let cmd = Command {
            local: Some("hostname".to_string()),
            ..Command::default()
        };
        let tasks = build_tasks(&cmd, 8, "").unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(matches!(tasks[0].targets, TaskTargets::Local(_)));
    }

    #[test]
    fn test_stdin_binds_the_controller_input() {
        let cmd = Command {
            stdin: true,
            ..run_command("cat")
        };
        let tasks = build_tasks(&cmd, 2, "").unwrap();
        assert!(matches!(tasks[0].input, Some(TaskInput::Stdin)));
    }
}
