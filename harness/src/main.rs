//! BFT Harness CLI

use bft_harness::{
    checker::{Checker, CommandChecker, Unchecked, Verdict},
    client::http::HttpTransport,
    config::Config,
    identity::Assignment,
    nemesis::{self, Profile},
    runner::Harness,
    ssh::{Ssh, SshClocks, SshNet, SshProvisioner},
    weights::Weights,
    Error,
};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use tracing::{error, info, warn};

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

const TEST_CMD: &str = "test";
const PROFILES_CMD: &str = "profiles";
const WEIGHTS_CMD: &str = "weights";

/// Apply command-line overrides to a loaded config.
fn apply_overrides(mut config: Config, matches: &ArgMatches) -> Result<Config, Error> {
    if let Some(time_limit) = matches.get_one::<u64>("time-limit") {
        config.time_limit = *time_limit;
    }
    if let Some(profile) = matches.get_one::<String>("nemesis") {
        config.nemesis_profile = profile.parse()?;
    }
    if let Some(seed) = matches.get_one::<u64>("seed") {
        config.seed = Some(*seed);
    }
    config.validate()?;
    Ok(config)
}

/// Run a test against the cluster described by `config`, checking with `checker`.
async fn test<K: Checker>(config: &Config, checker: K) -> Result<Verdict, Error> {
    let cluster = config.cluster()?;
    let ssh = Ssh::new(config.ssh.clone());
    let harness = Harness {
        provisioner: SshProvisioner::new(
            ssh.clone(),
            config.commands.clone(),
            config.versions.clone(),
        ),
        net: SshNet::new(ssh.clone(), cluster),
        clocks: SshClocks::new(ssh),
        checker,
    };
    let report = harness
        .run(config, |node| {
            HttpTransport::new(node, config.rpc_port, config.client_timeout())
                .map_err(|e| Error::InvalidConfig(format!("cannot connect to {node}: {e}")))
        })
        .await?;
    info!(
        seed = report.seed,
        records = report.history.len(),
        path = %report.output.display(),
        verdict = ?report.verdict,
        "test complete"
    );
    if let Some(e) = &report.teardown {
        warn!(error = %e, "cluster was not fully torn down");
    }
    Ok(report.verdict)
}

/// Log the weight table `config` would produce.
fn weights(config: &Config) -> Result<(), Error> {
    let cluster = config.cluster()?;
    let assignment = Assignment::assign(&cluster, config.enable_duplicated_identity)?;
    let weights = Weights::allocate(&cluster, &assignment)?;
    for node in cluster.iter() {
        info!(
            %node,
            identity = %assignment.identity(node),
            weight = weights.get(node).unwrap_or_default(),
            "weight"
        );
    }
    match weights.duplicated_share() {
        Some((power, total)) => info!(power, total, "duplicated identity share"),
        None => info!(total = weights.total_power(), "no duplicated identity"),
    }
    Ok(())
}

/// Entrypoint for the BFT Harness CLI
#[tokio::main]
async fn main() -> std::process::ExitCode {
    // Define application
    let config_arg = Arg::new("config")
        .long("config")
        .required(true)
        .help("Path to YAML config file")
        .value_parser(clap::value_parser!(PathBuf));
    let matches = Command::new("harness")
        .version(crate_version())
        .about("Inject duplicated validator identities and network faults into a BFT cluster.")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new(TEST_CMD)
                .about("Provision the cluster, run the workload under a nemesis, and check the resulting history.")
                .arg(config_arg.clone())
                .arg(
                    Arg::new("time-limit")
                        .long("time-limit")
                        .help("Seconds during which operations are issued (overrides config)")
                        .value_parser(clap::builder::RangedU64ValueParser::<u64>::new().range(1..)),
                )
                .arg(
                    Arg::new("nemesis")
                        .long("nemesis")
                        .help("Nemesis profile (overrides config)")
                        .value_parser(Profile::all().map(|p| p.name()).collect::<Vec<_>>()),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .help("Seed of every random choice (overrides config)")
                        .value_parser(clap::value_parser!(u64)),
                ),
        )
        .subcommand(Command::new(PROFILES_CMD).about("List nemesis profiles and their schedules."))
        .subcommand(
            Command::new(WEIGHTS_CMD)
                .about("Show the identity assignment and voting weights a config produces.")
                .arg(config_arg),
        )
        .get_matches();

    // Create logger
    let level = if matches.get_flag(VERBOSE_FLAG) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    // Parse subcommands
    match matches.subcommand() {
        Some((TEST_CMD, matches)) => {
            let config_path = matches.get_one::<PathBuf>("config").unwrap();
            let config = match Config::load(config_path)
                .and_then(|config| apply_overrides(config, matches))
            {
                Ok(config) => config,
                Err(e) => {
                    error!(error=?e, "invalid config");
                    return std::process::ExitCode::FAILURE;
                }
            };
            let result = match &config.checker {
                Some(argv) => match CommandChecker::new(argv) {
                    Ok(checker) => test(&config, checker).await,
                    Err(e) => Err(e),
                },
                None => test(&config, Unchecked).await,
            };
            match result {
                Ok(verdict) if verdict.is_acceptable() => return std::process::ExitCode::SUCCESS,
                Ok(verdict) => error!(?verdict, "history rejected"),
                Err(e) => error!(error=?e, "test failed"),
            }
        }
        Some((PROFILES_CMD, _)) => {
            for profile in Profile::all() {
                info!(%profile, schedule = %nemesis::describe(profile), "profile");
            }
            return std::process::ExitCode::SUCCESS;
        }
        Some((WEIGHTS_CMD, matches)) => {
            let config_path = matches.get_one::<PathBuf>("config").unwrap();
            if let Err(e) = Config::load(config_path).and_then(|config| weights(&config)) {
                error!(error=?e, "failed to compute weights");
            } else {
                return std::process::ExitCode::SUCCESS;
            }
        }
        Some((cmd, _)) => {
            error!(cmd, "invalid subcommand");
        }
        None => {
            error!("no subcommand provided");
        }
    }
    std::process::ExitCode::FAILURE
}
