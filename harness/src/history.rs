//! Record operations and nemesis events for an external checker.
//!
//! Client operations are written as pairs of records: an `invoke` followed by exactly one
//! completion (`ok`, `fail`, or `info`). Nemesis events live on their own lane so fault windows can
//! be aligned with the client history.

use crate::{identity::Node, Error};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    io::Write,
    sync::{Arc, Mutex},
};
use tokio::time::Instant;

/// Stage of an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Invoke,
    Ok,
    /// The operation definitely did not take effect.
    Fail,
    /// The operation may or may not have taken effect.
    Info,
}

/// Register operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Read,
    Write,
    Cas,
}

/// Classified cause of an unsuccessful operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    PreconditionFailed,
    NotFound,
    ConnectionRefused,
    Timeout,
}

/// Argument or result of an operation.
///
/// Serialized as `null`, an integer, or a `[from, to]` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(u64),
    Pair(u64, u64),
    None,
}

/// A client operation at one stage of its life.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub process: u64,
    pub phase: Phase,
    #[serde(rename = "f")]
    pub verb: Verb,
    pub key: u64,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub node: Node,
}

/// Nemesis action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Start,
    Stop,
}

/// A nemesis event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub phase: Phase,
    #[serde(rename = "f")]
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Which lane recorded an event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "lane", rename_all = "lowercase")]
pub enum Event {
    Client(Operation),
    Nemesis(Fault),
}

/// A timestamped history entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub index: u64,
    /// Nanoseconds since the start of the run.
    pub time: u64,
    #[serde(flatten)]
    pub event: Event,
}

/// Append-only recorder shared by every lane.
#[derive(Clone)]
pub struct Recorder {
    start: Instant,
    records: Arc<Mutex<Vec<Record>>>,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            records: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Append an event, assigning it the next index.
    pub fn record(&self, event: Event) {
        let mut records = self.records.lock().unwrap();
        let time = self.start.elapsed().as_nanos() as u64;
        let index = records.len() as u64;
        records.push(Record { index, time, event });
    }

    pub fn operation(&self, operation: Operation) {
        self.record(Event::Client(operation));
    }

    pub fn fault(&self, phase: Phase, action: Action, detail: Option<String>) {
        self.record(Event::Nemesis(Fault {
            phase,
            action,
            detail,
        }));
    }

    /// Snapshot the history recorded so far.
    pub fn history(&self) -> History {
        History {
            records: self.records.lock().unwrap().clone(),
        }
    }
}

/// A complete history.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct History {
    records: Vec<Record>,
}

impl History {
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Client operations in recorded order.
    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.records.iter().filter_map(|r| match &r.event {
            Event::Client(op) => Some(op),
            Event::Nemesis(_) => None,
        })
    }

    /// Nemesis events in recorded order.
    pub fn faults(&self) -> impl Iterator<Item = &Fault> {
        self.records.iter().filter_map(|r| match &r.event {
            Event::Nemesis(fault) => Some(fault),
            Event::Client(_) => None,
        })
    }

    /// Client operations grouped by key, each sub-history in recorded order.
    pub fn by_key(&self) -> BTreeMap<u64, Vec<&Operation>> {
        let mut keys: BTreeMap<u64, Vec<&Operation>> = BTreeMap::new();
        for op in self.operations() {
            keys.entry(op.key).or_default().push(op);
        }
        keys
    }

    /// Processes with an invocation that was never completed.
    pub fn pending(&self) -> Vec<u64> {
        let mut open = HashSet::new();
        for op in self.operations() {
            match op.phase {
                Phase::Invoke => {
                    open.insert(op.process);
                }
                _ => {
                    open.remove(&op.process);
                }
            }
        }
        let mut open: Vec<_> = open.into_iter().collect();
        open.sort_unstable();
        open
    }

    /// Write one JSON record per line.
    pub fn write_jsonl<W: Write>(&self, mut writer: W) -> Result<(), Error> {
        for record in &self.records {
            serde_json::to_writer(&mut writer, record)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Parse a history written by [History::write_jsonl].
    pub fn read_jsonl(input: &str) -> Result<Self, Error> {
        let records = input
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<Result<Vec<Record>, _>>()?;
        Ok(Self { records })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(process: u64, phase: Phase, verb: Verb, key: u64, value: Value) -> Operation {
        Operation {
            process,
            phase,
            verb,
            key,
            value,
            error: None,
            message: None,
            node: Node::from("n1"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_indexes_and_groups() {
        let recorder = Recorder::new();
        recorder.operation(op(0, Phase::Invoke, Verb::Write, 5, Value::Int(3)));
        recorder.fault(Phase::Info, Action::Start, Some("grudge".into()));
        recorder.operation(op(1, Phase::Invoke, Verb::Read, 6, Value::None));
        recorder.operation(op(0, Phase::Ok, Verb::Write, 5, Value::Int(3)));

        let history = recorder.history();
        assert_eq!(history.len(), 4);
        let indexes: Vec<u64> = history.records().iter().map(|r| r.index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3]);
        assert_eq!(history.faults().count(), 1);
        assert_eq!(history.pending(), vec![1]);

        let keys = history.by_key();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[&5].len(), 2);
        assert_eq!(keys[&6].len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_records_ordered_in_time() {
        let recorder = Recorder::new();
        let handles: Vec<_> = (0..4)
            .map(|lane| {
                let recorder = recorder.clone();
                tokio::spawn(async move {
                    for _ in 0..500 {
                        recorder.operation(op(lane, Phase::Invoke, Verb::Read, lane, Value::None));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let history = recorder.history();
        assert_eq!(history.len(), 2000);
        for pair in history.records().windows(2) {
            assert_eq!(pair[0].index + 1, pair[1].index);
            assert!(pair[0].time <= pair[1].time);
        }
    }

    #[test]
    fn test_json_shape() {
        let mut failed = op(2, Phase::Fail, Verb::Cas, 5, Value::Pair(3, 7));
        failed.error = Some(ErrorKind::PreconditionFailed);
        let record = Record {
            index: 9,
            time: 100,
            event: Event::Client(failed),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "index": 9,
                "time": 100,
                "lane": "client",
                "process": 2,
                "phase": "fail",
                "f": "cas",
                "key": 5,
                "value": [3, 7],
                "error": "precondition-failed",
                "node": "n1",
            })
        );

        let read = op(0, Phase::Invoke, Verb::Read, 1, Value::None);
        let json = serde_json::to_value(&read).unwrap();
        assert_eq!(json["value"], serde_json::Value::Null);
    }

    #[test]
    fn test_jsonl_round_trip() {
        let recorder = Recorder::new();
        recorder.operation(op(0, Phase::Invoke, Verb::Read, 1, Value::None));
        recorder.operation(op(0, Phase::Ok, Verb::Read, 1, Value::Int(4)));
        recorder.fault(Phase::Info, Action::Stop, None);
        let history = recorder.history();

        let mut buf = Vec::new();
        history.write_jsonl(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert_eq!(History::read_jsonl(&text).unwrap(), history);
    }
}
