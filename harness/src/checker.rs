//! Hand a history to an external linearizability checker.

use crate::{history::History, Error};
use serde::Serialize;
use std::{fs::File, future::Future, io::BufWriter, path::PathBuf};
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

/// Judgement of a history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Valid,
    Invalid,
    /// No judgement was made.
    Unknown,
}

impl Verdict {
    /// Returns true unless the history was found invalid.
    pub fn is_acceptable(&self) -> bool {
        !matches!(self, Self::Invalid)
    }
}

/// Judges whether a history is linearizable per key.
pub trait Checker: Send + Sync {
    fn check(&self, history: &History) -> impl Future<Output = Result<Verdict, Error>> + Send;
}

/// Skips checking.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unchecked;

impl Checker for Unchecked {
    async fn check(&self, _history: &History) -> Result<Verdict, Error> {
        Ok(Verdict::Unknown)
    }
}

/// Runs an external command on the history, written as JSON lines.
///
/// The path of the history file is appended to the command's arguments. Exit status 0 means
/// the history is valid; any other status means it is not.
#[derive(Clone, Debug)]
pub struct CommandChecker {
    program: String,
    args: Vec<String>,
    scratch: PathBuf,
}

impl CommandChecker {
    /// Create a checker from a command line (`argv[0]` is the program).
    pub fn new(argv: &[String]) -> Result<Self, Error> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::InvalidConfig("checker command is empty".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            scratch: std::env::temp_dir(),
        })
    }
}

impl Checker for CommandChecker {
    async fn check(&self, history: &History) -> Result<Verdict, Error> {
        let path = self
            .scratch
            .join(format!("history-{}.jsonl", Uuid::new_v4()));
        history.write_jsonl(BufWriter::new(File::create(&path)?))?;

        debug!(program = %self.program, path = %path.display(), "running checker");
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&path)
            .output()
            .await
            .map_err(|e| Error::Checker(format!("{}: {e}", self.program)));
        if let Err(e) = std::fs::remove_file(&path) {
            debug!(path = %path.display(), error = ?e, "failed to remove scratch file");
        }
        let output = output?;

        let verdict = if output.status.success() {
            Verdict::Valid
        } else {
            Verdict::Invalid
        };
        info!(
            ?verdict,
            status = ?output.status,
            stdout = %String::from_utf8_lossy(&output.stdout).trim(),
            "checker finished"
        );
        Ok(verdict)
    }
}
