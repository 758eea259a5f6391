//! Declarative command definitions.

use serde::Deserialize;

/// A named shell action from the Supfile.
///
/// At most one of `run`/`local`/`script` may be set, and `upload` cannot
/// be combined with any of them; the task builder rejects other mixes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Command {
    /// Assigned at dispatch time from the Supfile key.
    #[serde(skip)]
    pub name: String,
    /// Documentation shown in the command listing.
    pub desc: Option<String>,
    /// Shell snippet executed on every selected host.
    pub run: Option<String>,
    /// Shell snippet executed once on the controller instead of `run`.
    pub local: Option<String>,
    /// Path to a local file whose contents become the shell snippet.
    pub script: Option<String>,
    /// File transfers, each desugared into a tar pipe.
    pub upload: Vec<Upload>,
    /// Connect the task's stdin to the controller's stdin.
    pub stdin: bool,
    /// Run on exactly one host (the first).
    pub once: bool,
    /// Process hosts in sequential batches of this size.
    pub serial: Option<usize>,
}

/// One `src` → `dst` transfer of an `upload` command.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Upload {
    pub src: String,
    pub dst: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_minimal_command() {
        let cmd: Command = serde_yaml::from_str("run: echo hi\n").unwrap();
        assert_eq!(cmd.run.as_deref(), Some("echo hi"));
        assert!(!cmd.once);
        assert_eq!(cmd.serial, None);
    }

    #[test]
    fn test_decode_upload_command() {
        let cmd: Command = serde_yaml::from_str(
            "desc: ship assets\nupload:\n  - src: ./build\n    dst: /srv/app\nonce: true\n",
        )
        .unwrap();
        assert_eq!(cmd.upload.len(), 1);
        assert_eq!(cmd.upload[0].dst, "/srv/app");
        assert!(cmd.once);
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        assert!(serde_yaml::from_str::<Command>("runs: typo\n").is_err());
    }
}
