//! Run configuration, loaded from YAML.

use crate::{
    client::{http::DEFAULT_RPC_PORT, DEFAULT_TIMEOUT},
    generator::{DEFAULT_OPS_PER_KEY, DEFAULT_STAGGER},
    genesis::DEFAULT_CHAIN_ID,
    identity::{Cluster, Node},
    nemesis::Profile,
    ssh::{Commands, SshConfig},
    Error,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs::File, path::Path, path::PathBuf, time::Duration};

/// Default run length, in seconds.
pub const DEFAULT_TIME_LIMIT: u64 = 60;

/// Default number of concurrent key groups.
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Default path of the recorded history.
pub const DEFAULT_OUTPUT: &str = "history.jsonl";

/// Configuration of a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Cluster members, in order.
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub enable_duplicated_identity: bool,
    #[serde(default)]
    pub nemesis_profile: Profile,
    /// Seconds during which new operations are issued.
    #[serde(default = "default_time_limit")]
    pub time_limit: u64,
    /// Component versions, exported to provisioning commands.
    #[serde(default)]
    pub versions: BTreeMap<String, String>,
    /// Number of key groups worked on concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_ops_per_key")]
    pub ops_per_key: usize,
    /// Mean delay between operations on one lane, in milliseconds.
    #[serde(default = "default_stagger")]
    pub stagger: u64,
    /// Bound on a single operation, in milliseconds.
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    /// Seed of every random choice (drawn at random if absent).
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_chain_id")]
    pub chain_id: String,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,
    #[serde(default)]
    pub commands: Commands,
    /// Checker command line; the history path is appended.
    #[serde(default)]
    pub checker: Option<Vec<String>>,
    #[serde(default = "default_output")]
    pub output: PathBuf,
}

fn default_time_limit() -> u64 {
    DEFAULT_TIME_LIMIT
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_ops_per_key() -> usize {
    DEFAULT_OPS_PER_KEY
}

fn default_stagger() -> u64 {
    DEFAULT_STAGGER.as_millis() as u64
}

fn default_client_timeout() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}

fn default_chain_id() -> String {
    DEFAULT_CHAIN_ID.to_string()
}

fn default_rpc_port() -> u16 {
    DEFAULT_RPC_PORT
}

fn default_output() -> PathBuf {
    PathBuf::from(DEFAULT_OUTPUT)
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_reader(File::open(path)?)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a config document.
    pub fn parse(yaml: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<(), Error> {
        self.cluster()?;
        if self.time_limit == 0 {
            return Err(Error::InvalidConfig("time_limit must be positive".into()));
        }
        if self.concurrency == 0 {
            return Err(Error::InvalidConfig("concurrency must be positive".into()));
        }
        if self.ops_per_key == 0 {
            return Err(Error::InvalidConfig("ops_per_key must be positive".into()));
        }
        if self.client_timeout == 0 {
            return Err(Error::InvalidConfig(
                "client_timeout must be positive".into(),
            ));
        }
        if self.nemesis_profile == Profile::DuplicateIdentityPartition
            && !self.enable_duplicated_identity
        {
            return Err(Error::InvalidConfig(format!(
                "{} requires enable_duplicated_identity",
                self.nemesis_profile
            )));
        }
        if matches!(&self.checker, Some(argv) if argv.is_empty()) {
            return Err(Error::InvalidConfig("checker command is empty".into()));
        }
        Ok(())
    }

    pub fn cluster(&self) -> Result<Cluster, Error> {
        Cluster::new(self.nodes.clone())
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit)
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout)
    }
}
