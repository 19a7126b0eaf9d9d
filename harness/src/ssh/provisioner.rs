use super::Ssh;
use crate::{
    genesis::Genesis, identity::Node, keys::ValidatorKey, setup::Provisioner, Error,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use tracing::debug;
use uuid::Uuid;

/// Default remote path of the validator key file.
pub const DEFAULT_KEY_PATH: &str = "/opt/harness/priv_validator.json";

/// Default remote path of the genesis file.
pub const DEFAULT_GENESIS_PATH: &str = "/opt/harness/genesis.json";

/// Operator-supplied shell snippets that manage the node software.
///
/// `keygen` must print a validator key document (JSON with a `pub_key` object) on stdout.
/// `install` runs after the key and genesis files have been uploaded to `key_path` and
/// `genesis_path`. Every snippet sees the entries of `versions` as environment variables.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commands {
    pub keygen: String,
    pub install: String,
    pub teardown: String,
    #[serde(default = "default_key_path")]
    pub key_path: String,
    #[serde(default = "default_genesis_path")]
    pub genesis_path: String,
    #[serde(default)]
    pub logs: Vec<PathBuf>,
}

fn default_key_path() -> String {
    DEFAULT_KEY_PATH.to_string()
}

fn default_genesis_path() -> String {
    DEFAULT_GENESIS_PATH.to_string()
}

/// Provisions nodes by running [Commands] over SSH.
#[derive(Clone, Debug)]
pub struct SshProvisioner {
    ssh: Ssh,
    commands: Commands,
    versions: BTreeMap<String, String>,
    scratch: PathBuf,
}

impl SshProvisioner {
    pub fn new(ssh: Ssh, commands: Commands, versions: BTreeMap<String, String>) -> Self {
        Self {
            ssh,
            commands,
            versions,
            scratch: std::env::temp_dir(),
        }
    }

    /// Prefix `command` with an `export` of every pinned version.
    pub fn with_versions(&self, command: &str) -> String {
        if self.versions.is_empty() {
            return command.to_string();
        }
        let exports: Vec<String> = self
            .versions
            .iter()
            .map(|(name, version)| format!("{}='{}'", env_name(name), version))
            .collect();
        format!("export {}; {}", exports.join(" "), command)
    }

    /// Write `contents` to a scratch file, upload it to `remote` on `node`, and remove the
    /// scratch file.
    async fn upload(&self, node: &Node, contents: &[u8], remote: &str) -> Result<(), Error> {
        let local = self.scratch.join(format!("harness-{}", Uuid::new_v4()));
        tokio::fs::write(&local, contents).await?;
        let result = self.ssh.copy(&local, node.as_str(), remote).await;
        remove(&local).await;
        result
    }
}

/// Environment variable holding the version of `component` (`tendermint` -> `TENDERMINT_VERSION`).
fn env_name(component: &str) -> String {
    let name: String = component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{name}_VERSION")
}

async fn remove(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!(path = %path.display(), error = ?e, "failed to remove scratch file");
    }
}

impl Provisioner for SshProvisioner {
    async fn generate_key(&self, node: &Node) -> Result<ValidatorKey, Error> {
        let command = self.with_versions(&self.commands.keygen);
        let output = self.ssh.output(node.as_str(), &command).await?;
        ValidatorKey::parse(node, output.trim())
    }

    async fn install(
        &self,
        node: &Node,
        key: &ValidatorKey,
        genesis: &Genesis,
    ) -> Result<(), Error> {
        let key = serde_json::to_vec_pretty(key.document())?;
        self.upload(node, &key, &self.commands.key_path).await?;
        let genesis = serde_json::to_vec_pretty(genesis)?;
        self.upload(node, &genesis, &self.commands.genesis_path)
            .await?;
        let command = self.with_versions(&self.commands.install);
        self.ssh.execute(node.as_str(), &command).await
    }

    async fn teardown(&self, node: &Node) -> Result<(), Error> {
        let command = self.with_versions(&self.commands.teardown);
        self.ssh.execute(node.as_str(), &command).await
    }

    fn log_files(&self, _node: &Node) -> Vec<PathBuf> {
        self.commands.logs.clone()
    }
}
