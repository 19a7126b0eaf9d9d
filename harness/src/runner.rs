//! Orchestrate a complete run.
//!
//! [execute] interleaves the workload with the nemesis: every lane is an independent task issuing
//! one operation at a time, while the nemesis follows its schedule. [Harness::run] wraps that in
//! the full lifecycle (assign identities, allocate weights, provision, execute, tear down, check).

use crate::{
    checker::{Checker, Verdict},
    client::{Client, Transport},
    config::Config,
    generator::{stagger, KeyGroup, Keys},
    grudge::Builder,
    history::{History, Operation, Phase, Recorder},
    identity::{Assignment, Node},
    keys::Registry,
    nemesis::{Clocks, Nemesis, Net},
    setup::{self, Provisioner},
    weights::Weights,
    Error,
};
use futures::future::try_join_all;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{fs::File, io::BufWriter, path::PathBuf, sync::Arc, time::Duration};
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};

/// Parameters of the workload.
#[derive(Clone, Debug)]
pub struct Workload {
    /// Number of key groups.
    pub concurrency: usize,
    pub ops_per_key: usize,
    pub stagger: Duration,
    pub time_limit: Duration,
    pub seed: u64,
}

impl Workload {
    pub fn from_config(config: &Config, seed: u64) -> Self {
        Self {
            concurrency: config.concurrency,
            ops_per_key: config.ops_per_key,
            stagger: config.stagger(),
            time_limit: config.time_limit(),
            seed,
        }
    }
}

/// One lane: issues operations on its group's key against a single node until `deadline`.
struct Lane<T: Transport> {
    process: u64,
    stride: u64,
    lane: usize,
    group: Arc<KeyGroup>,
    client: Arc<Client<T>>,
    recorder: Recorder,
    stagger: Duration,
    rng: StdRng,
}

impl<T: Transport> Lane<T> {
    async fn run(mut self, deadline: Instant) {
        while Instant::now() < deadline {
            let invocation = self.group.next(self.lane, &mut self.rng);
            let node = self.client.node().clone();
            self.recorder.operation(Operation {
                process: self.process,
                phase: Phase::Invoke,
                verb: invocation.verb,
                key: invocation.key,
                value: invocation.value,
                error: None,
                message: None,
                node: node.clone(),
            });
            let outcome = self.client.invoke(&invocation).await;
            let phase = outcome.phase;
            self.recorder.operation(Operation {
                process: self.process,
                phase,
                verb: invocation.verb,
                key: invocation.key,
                value: outcome.value,
                error: outcome.error,
                message: outcome.message,
                node,
            });

            // The indeterminate operation stays open, so continue as a new process
            if phase == Phase::Info {
                self.process += self.stride;
            }

            let next = Instant::now() + stagger(self.stagger, &mut self.rng);
            sleep_until(next.min(deadline)).await;
        }
    }
}

/// Run the workload and the nemesis together, returning the recorded history.
///
/// `clients` holds one client per cluster node, in cluster order. Lane `i` of every key group
/// targets `clients[i % n]`. No operation is issued after the time limit; operations in flight at
/// that point are allowed to complete.
pub async fn execute<T, N, C>(
    workload: &Workload,
    clients: Vec<Client<T>>,
    nemesis: &mut Nemesis<N, C>,
) -> Result<History, Error>
where
    T: Transport,
    N: Net,
    C: Clocks,
{
    if clients.is_empty() {
        return Err(Error::EmptyCluster);
    }
    let nodes = clients.len();
    let clients: Vec<_> = clients.into_iter().map(Arc::new).collect();
    let recorder = Recorder::new();
    let deadline = Instant::now() + workload.time_limit;

    // Spawn lanes
    let keys = Keys::new();
    let lanes_per_group = 2 * nodes;
    let total = (workload.concurrency * lanes_per_group) as u64;
    let mut handles = Vec::with_capacity(total as usize);
    for g in 0..workload.concurrency {
        let group = Arc::new(KeyGroup::new(keys.clone(), nodes, workload.ops_per_key));
        for lane in 0..group.lanes() {
            let index = g * lanes_per_group + lane;
            let lane = Lane {
                process: index as u64,
                stride: total,
                lane,
                group: group.clone(),
                client: clients[lane % nodes].clone(),
                recorder: recorder.clone(),
                stagger: workload.stagger,
                rng: StdRng::seed_from_u64(workload.seed.wrapping_add(index as u64 + 1)),
            };
            handles.push(tokio::spawn(lane.run(deadline)));
        }
    }
    info!(
        groups = workload.concurrency,
        lanes = handles.len(),
        time_limit = ?workload.time_limit,
        "started workload"
    );

    // Run the nemesis alongside the lanes
    if let Err(e) = nemesis.run(&recorder, deadline).await {
        for handle in &handles {
            handle.abort();
        }
        if let Err(cleanup) = nemesis.cleanup().await {
            warn!(error = ?cleanup, "failed to undo faults");
        }
        return Err(e);
    }

    try_join_all(handles)
        .await
        .map_err(|e| Error::Task(e.to_string()))?;
    let history = recorder.history();
    info!(
        records = history.len(),
        keys = history.by_key().len(),
        "finished workload"
    );
    Ok(history)
}

/// Result of a complete run.
#[derive(Clone, Debug)]
pub struct Report {
    pub history: History,
    pub verdict: Verdict,
    pub seed: u64,
    /// Where the history was written.
    pub output: PathBuf,
    /// Failure to tear down some node, if any (the history is still complete).
    pub teardown: Option<String>,
}

/// External collaborators of a run.
pub struct Harness<P, N, C, K> {
    pub provisioner: P,
    pub net: N,
    pub clocks: C,
    pub checker: K,
}

impl<P, N, C, K> Harness<P, N, C, K>
where
    P: Provisioner,
    N: Net,
    C: Clocks,
    K: Checker,
{
    /// Run the full lifecycle described by `config`, connecting to each node with `connect`.
    ///
    /// Configuration errors abort before any node is touched. Once provisioning starts, nodes are
    /// always torn down, even if the run fails. A completed history is always written and checked;
    /// a teardown failure is then reported in [Report::teardown].
    pub async fn run<T, F>(self, config: &Config, connect: F) -> Result<Report, Error>
    where
        T: Transport,
        F: Fn(&Node) -> Result<T, Error>,
    {
        let Self {
            provisioner,
            net,
            clocks,
            checker,
        } = self;

        // Decide identities and weights
        config.validate()?;
        let cluster = config.cluster()?;
        let assignment = Assignment::assign(&cluster, config.enable_duplicated_identity)?;
        let weights = Weights::allocate(&cluster, &assignment)?;
        let builder = Builder::new(cluster.clone(), assignment.clone())?;
        if let Some((power, total)) = weights.duplicated_share() {
            info!(power, total, "duplicated identity share");
        }
        let seed = config.seed.unwrap_or_else(|| rand::thread_rng().gen());
        info!(seed, profile = %config.nemesis_profile, "configured run");

        // Connect before provisioning so transport errors surface early
        let clients = cluster
            .iter()
            .map(|node| {
                let transport = connect(node)?;
                Ok(Client::new(node.clone(), transport, config.client_timeout()))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let workload = Workload::from_config(config, seed);
        let mut nemesis = Nemesis::new(
            config.nemesis_profile,
            cluster.clone(),
            builder,
            net,
            clocks,
            StdRng::seed_from_u64(seed),
        );

        // Provision, execute, and always tear down
        let registry = Registry::new();
        let result = async {
            setup::setup(
                &provisioner,
                &registry,
                &cluster,
                &assignment,
                &weights,
                &config.chain_id,
            )
            .await?;
            execute(&workload, clients, &mut nemesis).await
        }
        .await;
        let teardown = match setup::teardown(&provisioner, &registry, &cluster).await {
            Ok(()) => None,
            Err(e) => {
                warn!(error = ?e, "failed to tear down cluster");
                Some(e.to_string())
            }
        };
        let history = result?;

        // Persist and check
        history.write_jsonl(BufWriter::new(File::create(&config.output)?))?;
        info!(path = %config.output.display(), "wrote history");
        let verdict = checker.check(&history).await?;
        info!(?verdict, "checked history");
        Ok(Report {
            history,
            verdict,
            seed,
            output: config.output.clone(),
            teardown,
        })
    }
}
