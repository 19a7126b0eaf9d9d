use bft_harness::{
    checker::{Checker, Unchecked, Verdict},
    client::{Client, DEFAULT_TIMEOUT},
    config::Config,
    generator::Invocation,
    history::{Action, ErrorKind, History, Phase, Value, Verb},
    identity::Node,
    mocks::{MockClocks, MockNet, MockProvisioner, MockTransport, NetEvent, Register},
    runner::Harness,
    Error,
};
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
};
use uuid::Uuid;

/// Replays each key's sub-history against a sequential register.
///
/// Valid only for transports that complete without yielding, where every invocation is
/// immediately followed by its completion.
#[derive(Clone, Default)]
struct SequentialChecker {
    checked: Arc<Mutex<usize>>,
}

impl Checker for SequentialChecker {
    async fn check(&self, history: &History) -> Result<Verdict, Error> {
        for (_, ops) in history.by_key() {
            let mut current: Option<u64> = None;
            for op in ops.iter().filter(|op| op.phase == Phase::Ok) {
                match (op.verb, op.value) {
                    (Verb::Read, Value::Int(v)) if current == Some(v) => {}
                    (Verb::Read, Value::None) if current.is_none() => {}
                    (Verb::Write, Value::Int(v)) => current = Some(v),
                    (Verb::Cas, Value::Pair(from, to)) if current == Some(from) => {
                        current = Some(to)
                    }
                    _ => return Ok(Verdict::Invalid),
                }
            }
        }
        *self.checked.lock().unwrap() += 1;
        Ok(Verdict::Valid)
    }
}

fn output() -> PathBuf {
    std::env::temp_dir().join(format!("harness-test-{}.jsonl", Uuid::new_v4()))
}

fn config(nodes: usize, extra: &str) -> Config {
    let nodes: Vec<String> = (1..=nodes).map(|i| format!("n{i}")).collect();
    let yaml = format!(
        "nodes: [{}]\ntime_limit: 20\nseed: 42\noutput: {}\n{extra}",
        nodes.join(", "),
        output().display()
    );
    Config::parse(&yaml).unwrap()
}

fn connect(register: &Register) -> impl Fn(&Node) -> Result<MockTransport, Error> + '_ {
    move |_| Ok(MockTransport::new(register.clone()))
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_identity_run() {
    let config = config(
        10,
        "enable_duplicated_identity: true\nnemesis_profile: duplicate-identity-partition\nconcurrency: 2\n",
    );
    let provisioner = MockProvisioner::new();
    let net = MockNet::new();
    let checker = SequentialChecker::default();
    let register = Register::new();
    let harness = Harness {
        provisioner: provisioner.clone(),
        net: net.clone(),
        clocks: MockClocks::new(),
        checker: checker.clone(),
    };
    let report = harness.run(&config, connect(&register)).await.unwrap();
    assert_eq!(report.verdict, Verdict::Valid);
    assert_eq!(report.seed, 42);
    assert_eq!(report.teardown, None);
    assert_eq!(*checker.checked.lock().unwrap(), 1);

    // Clones were provisioned with the origin's key and torn down afterwards
    let installs = provisioner.installs();
    for clone in ["n1", "n2", "n3"] {
        assert_eq!(installs[&Node::from(clone)], installs[&Node::from("n4")]);
    }
    assert_eq!(provisioner.genesis().unwrap().validators.len(), 7);
    assert_eq!(provisioner.torn_down().len(), 10);

    // Four 5s grudge windows, each healed
    let events = net.events();
    let windows = events
        .iter()
        .filter(|e| matches!(e, NetEvent::Partition(_)))
        .count();
    assert_eq!(windows, 4);
    assert_eq!(events.last(), Some(&NetEvent::Heal));
    let starts = report
        .history
        .faults()
        .filter(|f| f.phase == Phase::Info && f.action == Action::Start)
        .count();
    assert_eq!(starts, 4);

    // The history was persisted
    let written = std::fs::read_to_string(&report.output).unwrap();
    assert_eq!(History::read_jsonl(&written).unwrap(), report.history);
    std::fs::remove_file(&report.output).unwrap();
    assert!(report.history.pending().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_infeasible_duplication_aborts_before_setup() {
    let config = config(3, "enable_duplicated_identity: true\n");
    let provisioner = MockProvisioner::new();
    let harness = Harness {
        provisioner: provisioner.clone(),
        net: MockNet::new(),
        clocks: MockClocks::new(),
        checker: Unchecked,
    };
    let result = harness.run(&config, connect(&Register::new())).await;
    assert!(matches!(result, Err(Error::DuplicationInfeasible(3))));
    assert!(provisioner.generated().is_empty());
    assert!(provisioner.torn_down().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_nemesis_failure_tears_down() {
    let config = config(5, "nemesis_profile: majority-ring\n");
    let provisioner = MockProvisioner::new();
    let net = MockNet::new();
    net.fail();
    let harness = Harness {
        provisioner: provisioner.clone(),
        net,
        clocks: MockClocks::new(),
        checker: Unchecked,
    };
    let result = harness.run(&config, connect(&Register::new())).await;
    assert!(matches!(result, Err(Error::Task(_))));
    assert_eq!(provisioner.installs().len(), 5);
    assert_eq!(provisioner.torn_down().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_failure_keeps_history() {
    let config = config(5, "");
    let provisioner = MockProvisioner::new();
    provisioner.fail_teardown(&Node::from("n3"));
    let checker = SequentialChecker::default();
    let harness = Harness {
        provisioner: provisioner.clone(),
        net: MockNet::new(),
        clocks: MockClocks::new(),
        checker: checker.clone(),
    };
    let report = harness.run(&config, connect(&Register::new())).await.unwrap();

    // Every node was still torn down and the history was written and checked
    assert_eq!(provisioner.torn_down().len(), 5);
    assert!(report.teardown.is_some());
    assert_eq!(report.verdict, Verdict::Valid);
    assert_eq!(*checker.checked.lock().unwrap(), 1);
    let written = std::fs::read_to_string(&report.output).unwrap();
    assert_eq!(History::read_jsonl(&written).unwrap(), report.history);
    assert!(report.history.operations().count() > 0);
    std::fs::remove_file(&report.output).unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_clock_skew_run() {
    let config = config(5, "nemesis_profile: clock-skew\n");
    let clocks = MockClocks::new();
    let register = Register::new();
    let harness = Harness {
        provisioner: MockProvisioner::new(),
        net: MockNet::new(),
        clocks: clocks.clone(),
        checker: Unchecked,
    };
    let report = harness.run(&config, connect(&register)).await.unwrap();
    assert_eq!(report.verdict, Verdict::Unknown);
    assert!(!clocks.bumps().is_empty());
    assert!(!clocks.resets().is_empty());
    std::fs::remove_file(&report.output).unwrap();
}

#[tokio::test]
async fn test_register_scenario() {
    let register = Register::new();
    let clients: HashMap<&str, Client<MockTransport>> = ["n1", "n2"]
        .into_iter()
        .map(|name| {
            let client = Client::new(
                Node::from(name),
                MockTransport::new(register.clone()),
                DEFAULT_TIMEOUT,
            );
            (name, client)
        })
        .collect();
    let invoke = |verb, value| Invocation { verb, key: 5, value };

    let outcome = clients["n1"]
        .invoke(&invoke(Verb::Write, Value::Int(3)))
        .await;
    assert_eq!(outcome.phase, Phase::Ok);

    let outcome = clients["n2"].invoke(&invoke(Verb::Read, Value::None)).await;
    assert_eq!(outcome.phase, Phase::Ok);
    assert_eq!(outcome.value, Value::Int(3));

    let outcome = clients["n2"]
        .invoke(&invoke(Verb::Cas, Value::Pair(3, 7)))
        .await;
    assert_eq!(outcome.phase, Phase::Ok);

    let outcome = clients["n1"]
        .invoke(&invoke(Verb::Cas, Value::Pair(3, 7)))
        .await;
    assert_eq!(outcome.phase, Phase::Fail);
    assert_eq!(outcome.error, Some(ErrorKind::PreconditionFailed));
    assert_eq!(register.get(5), Some(7));
}
