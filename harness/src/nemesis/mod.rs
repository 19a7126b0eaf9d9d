//! Inject faults into the cluster on a schedule.
//!
//! A run uses exactly one [Profile], which pairs an [Injector] (what the fault does) with a
//! [Schedule] (when it fires). The [Nemesis] drives the injector through [Net] and [Clocks] and
//! records every action on the nemesis lane of the history.

use crate::{
    generator::stagger,
    grudge::{Builder, Grudge},
    history::{Action, Phase, Recorder},
    identity::{Cluster, Node},
    Error,
};
use rand::rngs::StdRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{
    collections::BTreeSet,
    fmt,
    future::Future,
    str::FromStr,
    time::Duration,
};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

pub mod clock;
pub mod partition;

/// Mean delay between clock-skew pulses.
pub const DEFAULT_PULSE: Duration = Duration::from_secs(5);

/// Applies partitions to the cluster network.
pub trait Net: Send + Sync {
    /// Make every node drop traffic from the nodes listed against it in `grudge`.
    fn partition(&self, grudge: &Grudge) -> impl Future<Output = Result<(), Error>> + Send;

    /// Remove every partition.
    fn heal(&self) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Perturbs node clocks.
pub trait Clocks: Send + Sync {
    /// Shift the clock of `node` by `offset_ms` milliseconds.
    fn bump(&self, node: &Node, offset_ms: i64) -> impl Future<Output = Result<(), Error>> + Send;

    /// Resynchronize the clock of `node`.
    fn reset(&self, node: &Node) -> impl Future<Output = Result<(), Error>> + Send;
}

/// What a fault does when started.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Injector {
    /// Keep one member of the duplicated identity reachable and isolate the rest.
    Grudge,
    /// Split the cluster into two random halves.
    HalfSplit,
    /// Let each node reach only a majority-sized arc of a random ring.
    MajorityRing,
    /// Isolate one random node.
    IsolateOne,
    /// Shift the clocks of a random subset of nodes.
    ClockSkew,
    Noop,
}

/// When a fault fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Schedule {
    /// Wait `quiet`, start the fault, hold it for `active`, stop it, repeat.
    Cyclic { quiet: Duration, active: Duration },
    /// Start the fault after a random delay (uniform in `[0, 2 * mean)`), repeatedly.
    Pulses { mean: Duration },
    Never,
}

/// A named fault-injection strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Profile {
    DuplicateIdentityPartition,
    HalfSplit,
    MajorityRing,
    SingleNodeIsolation,
    ClockSkew,
    #[default]
    None,
}

struct Entry {
    name: &'static str,
    profile: Profile,
    injector: Injector,
    schedule: Schedule,
}

const PARTITION_CYCLE: Schedule = Schedule::Cyclic {
    quiet: Duration::from_secs(5),
    active: Duration::from_secs(30),
};

const TABLE: &[Entry] = &[
    Entry {
        name: "duplicate-identity-partition",
        profile: Profile::DuplicateIdentityPartition,
        injector: Injector::Grudge,
        schedule: Schedule::Cyclic {
            quiet: Duration::ZERO,
            active: Duration::from_secs(5),
        },
    },
    Entry {
        name: "half-split",
        profile: Profile::HalfSplit,
        injector: Injector::HalfSplit,
        schedule: PARTITION_CYCLE,
    },
    Entry {
        name: "majority-ring",
        profile: Profile::MajorityRing,
        injector: Injector::MajorityRing,
        schedule: PARTITION_CYCLE,
    },
    Entry {
        name: "single-node-isolation",
        profile: Profile::SingleNodeIsolation,
        injector: Injector::IsolateOne,
        schedule: PARTITION_CYCLE,
    },
    Entry {
        name: "clock-skew",
        profile: Profile::ClockSkew,
        injector: Injector::ClockSkew,
        schedule: Schedule::Pulses {
            mean: DEFAULT_PULSE,
        },
    },
    Entry {
        name: "none",
        profile: Profile::None,
        injector: Injector::Noop,
        schedule: Schedule::Never,
    },
];

impl Profile {
    /// Every profile, in table order.
    pub fn all() -> impl Iterator<Item = Profile> {
        TABLE.iter().map(|entry| entry.profile)
    }

    fn entry(self) -> &'static Entry {
        // Entries are listed in variant order
        &TABLE[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.entry().name
    }

    pub fn injector(self) -> Injector {
        self.entry().injector
    }

    pub fn schedule(self) -> Schedule {
        self.entry().schedule
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Profile {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        TABLE
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.profile)
            .ok_or_else(|| Error::UnknownProfile(name.to_string()))
    }
}

impl Serialize for Profile {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Profile {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// Drives one profile for the duration of a run.
pub struct Nemesis<N: Net, C: Clocks> {
    profile: Profile,
    cluster: Cluster,
    builder: Builder,
    net: N,
    clocks: C,
    rng: StdRng,
    skewed: BTreeSet<Node>,
    partitioned: bool,
}

impl<N: Net, C: Clocks> Nemesis<N, C> {
    pub fn new(
        profile: Profile,
        cluster: Cluster,
        builder: Builder,
        net: N,
        clocks: C,
        rng: StdRng,
    ) -> Self {
        Self {
            profile,
            cluster,
            builder,
            net,
            clocks,
            rng,
            skewed: BTreeSet::new(),
            partitioned: false,
        }
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    pub fn net(&self) -> &N {
        &self.net
    }

    pub fn clocks(&self) -> &C {
        &self.clocks
    }

    /// Start the fault, returning a description of what was applied.
    async fn start(&mut self) -> Result<String, Error> {
        let nodes = self.cluster.nodes();
        let grudge = match self.profile.injector() {
            Injector::Grudge => self.builder.build(nodes, &mut self.rng),
            Injector::HalfSplit => partition::half_split(nodes, &mut self.rng),
            Injector::MajorityRing => partition::majority_ring(nodes, &mut self.rng),
            Injector::IsolateOne => partition::isolate_one(nodes, &mut self.rng),
            Injector::ClockSkew => {
                let offsets = clock::skew(nodes, &mut self.rng);
                for (node, offset) in &offsets {
                    self.skewed.insert(node.clone());
                    self.clocks.bump(node, *offset).await?;
                }
                return Ok(serde_json::to_string(&offsets)?);
            }
            Injector::Noop => return Ok(String::new()),
        };
        // A partition that fails part-way may still leave rules behind
        self.partitioned = true;
        self.net.partition(&grudge).await?;
        Ok(serde_json::to_string(&grudge)?)
    }

    /// Undo every fault still in effect.
    async fn stop(&mut self) -> Result<(), Error> {
        if self.partitioned {
            self.net.heal().await?;
            self.partitioned = false;
        }
        while let Some(node) = self.skewed.pop_first() {
            self.clocks.reset(&node).await?;
        }
        Ok(())
    }

    async fn record_start(&mut self, recorder: &Recorder) -> Result<(), Error> {
        recorder.fault(Phase::Invoke, Action::Start, None);
        let detail = self.start().await?;
        debug!(profile = %self.profile, %detail, "started fault");
        recorder.fault(Phase::Info, Action::Start, Some(detail));
        Ok(())
    }

    async fn record_stop(&mut self, recorder: &Recorder) -> Result<(), Error> {
        recorder.fault(Phase::Invoke, Action::Stop, None);
        self.stop().await?;
        debug!(profile = %self.profile, "stopped fault");
        recorder.fault(Phase::Info, Action::Stop, None);
        Ok(())
    }

    /// Run the schedule until `deadline`, leaving no fault in effect when it returns.
    pub async fn run(&mut self, recorder: &Recorder, deadline: Instant) -> Result<(), Error> {
        info!(profile = %self.profile, "starting nemesis");
        match self.profile.schedule() {
            Schedule::Never => {}
            Schedule::Cyclic { quiet, active } => loop {
                let start = Instant::now() + quiet;
                if start >= deadline {
                    break;
                }
                sleep_until(start).await;
                self.record_start(recorder).await?;
                sleep_until((Instant::now() + active).min(deadline)).await;
                self.record_stop(recorder).await?;
            },
            Schedule::Pulses { mean } => {
                loop {
                    let pulse = Instant::now() + stagger(mean, &mut self.rng);
                    if pulse >= deadline {
                        break;
                    }
                    sleep_until(pulse).await;
                    self.record_start(recorder).await?;
                }
                if !self.skewed.is_empty() {
                    self.record_stop(recorder).await?;
                }
            }
        }
        info!(profile = %self.profile, "stopped nemesis");
        Ok(())
    }

    /// Undo any fault left in effect by an interrupted run.
    pub async fn cleanup(&mut self) -> Result<(), Error> {
        self.stop().await
    }
}

/// Describe the fault windows of a profile, for display.
pub fn describe(profile: Profile) -> String {
    match profile.schedule() {
        Schedule::Cyclic { quiet, active } => {
            format!("quiet {}s / active {}s", quiet.as_secs(), active.as_secs())
        }
        Schedule::Pulses { mean } => format!("pulses every {}s on average", mean.as_secs()),
        Schedule::Never => "never".to_string(),
    }
}
