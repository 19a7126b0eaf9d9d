//! Generate per-key register workloads.
//!
//! Operations are issued by lanes. A [KeyGroup] is the set of `2n` lanes (for a cluster of `n`
//! nodes) working on one key at a time: the first `n` lanes only read, the remaining `n` draw
//! writes and compare-and-sets with equal probability. Reserving read lanes keeps read pressure
//! proportional to cluster size no matter how the write/cas mix plays out.
//!
//! Lanes share the group's operation budget. Once a key has seen `ops_per_key` invocations the
//! group moves to a fresh key, so every key's sub-history stays small enough to check on its own.

use crate::history::{Value, Verb};
use rand::Rng;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

/// Values written and compared are drawn from `[0, MAX_VALUE)`.
pub const MAX_VALUE: u64 = 10;

/// Default number of invocations per key.
pub const DEFAULT_OPS_PER_KEY: usize = 100;

/// Default mean delay between operations on one lane.
pub const DEFAULT_STAGGER: Duration = Duration::from_millis(500);

/// An operation to invoke.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub verb: Verb,
    pub key: u64,
    pub value: Value,
}

/// What a lane is allowed to issue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Reader,
    Writer,
}

impl Role {
    /// Role of lane `lane` in a group reserving `readers` read lanes.
    pub fn of(lane: usize, readers: usize) -> Self {
        if lane < readers {
            Self::Reader
        } else {
            Self::Writer
        }
    }
}

/// Draw an operation on `key` for a lane with `role`.
pub fn draw<R: Rng + ?Sized>(role: Role, key: u64, rng: &mut R) -> Invocation {
    match role {
        Role::Reader => Invocation {
            verb: Verb::Read,
            key,
            value: Value::None,
        },
        Role::Writer if rng.gen_bool(0.5) => Invocation {
            verb: Verb::Write,
            key,
            value: Value::Int(rng.gen_range(0..MAX_VALUE)),
        },
        Role::Writer => Invocation {
            verb: Verb::Cas,
            key,
            value: Value::Pair(rng.gen_range(0..MAX_VALUE), rng.gen_range(0..MAX_VALUE)),
        },
    }
}

/// Draw a pacing delay, uniform in `[0, 2 * mean)`.
pub fn stagger<R: Rng + ?Sized>(mean: Duration, rng: &mut R) -> Duration {
    let bound = mean.saturating_mul(2);
    if bound.is_zero() {
        return Duration::ZERO;
    }
    rng.gen_range(Duration::ZERO..bound)
}

/// Source of never-before-used keys, shared by every group.
#[derive(Clone, Debug, Default)]
pub struct Keys {
    next: Arc<AtomicU64>,
}

impl Keys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh key.
    pub fn fresh(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

struct Budget {
    key: u64,
    remaining: usize,
}

/// Lanes working on a shared key.
pub struct KeyGroup {
    keys: Keys,
    readers: usize,
    lanes: usize,
    ops_per_key: usize,
    budget: Mutex<Budget>,
}

impl KeyGroup {
    /// Create a group of `2 * nodes` lanes that issues up to `ops_per_key` operations per key.
    pub fn new(keys: Keys, nodes: usize, ops_per_key: usize) -> Self {
        let key = keys.fresh();
        Self {
            keys,
            readers: nodes,
            lanes: 2 * nodes,
            ops_per_key: ops_per_key.max(1),
            budget: Mutex::new(Budget {
                key,
                remaining: ops_per_key.max(1),
            }),
        }
    }

    /// Number of lanes in this group.
    pub fn lanes(&self) -> usize {
        self.lanes
    }

    /// Role of lane `lane` (in `0..lanes()`).
    pub fn role(&self, lane: usize) -> Role {
        Role::of(lane, self.readers)
    }

    /// Key currently being worked on.
    pub fn key(&self) -> u64 {
        self.budget.lock().unwrap().key
    }

    /// Take the next operation for `lane`, moving to a fresh key if the budget is spent.
    pub fn next<R: Rng + ?Sized>(&self, lane: usize, rng: &mut R) -> Invocation {
        let key = {
            let mut budget = self.budget.lock().unwrap();
            if budget.remaining == 0 {
                budget.key = self.keys.fresh();
                budget.remaining = self.ops_per_key;
            }
            budget.remaining -= 1;
            budget.key
        };
        draw(self.role(lane), key, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use std::collections::{BTreeMap, HashSet};

    #[test]
    fn test_roles_reserve_readers() {
        let group = KeyGroup::new(Keys::new(), 5, DEFAULT_OPS_PER_KEY);
        assert_eq!(group.lanes(), 10);
        let readers = (0..group.lanes())
            .filter(|lane| group.role(*lane) == Role::Reader)
            .count();
        assert_eq!(readers, 5);

        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..50 {
            for lane in 0..5 {
                assert_eq!(group.next(lane, &mut rng).verb, Verb::Read);
            }
            for lane in 5..10 {
                assert_ne!(group.next(lane, &mut rng).verb, Verb::Read);
            }
        }
    }

    #[test]
    fn test_budget_rolls_to_fresh_key() {
        let keys = Keys::new();
        let a = KeyGroup::new(keys.clone(), 3, 100);
        let b = KeyGroup::new(keys.clone(), 3, 100);
        assert_ne!(a.key(), b.key());

        let mut rng = StdRng::seed_from_u64(1);
        let mut counts: BTreeMap<u64, usize> = BTreeMap::new();
        for i in 0..1_000 {
            let op = a.next(i % a.lanes(), &mut rng);
            *counts.entry(op.key).or_default() += 1;
        }
        let op = b.next(0, &mut rng);
        *counts.entry(op.key).or_default() += 1;

        // Ten full keys for `a`, never reusing the key held by `b`
        assert_eq!(counts.len(), 11);
        let full: HashSet<u64> = counts
            .iter()
            .filter(|(_, c)| **c == 100)
            .map(|(k, _)| *k)
            .collect();
        assert_eq!(full.len(), 10);
        assert!(!full.contains(&b.key()));
    }

    #[test]
    fn test_draw_ranges_and_mix() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut writes = 0;
        let mut cas = 0;
        for _ in 0..10_000 {
            let op = draw(Role::Writer, 0, &mut rng);
            match (op.verb, op.value) {
                (Verb::Write, Value::Int(v)) => {
                    assert!(v < MAX_VALUE);
                    writes += 1;
                }
                (Verb::Cas, Value::Pair(from, to)) => {
                    assert!(from < MAX_VALUE && to < MAX_VALUE);
                    cas += 1;
                }
                other => panic!("unexpected operation: {other:?}"),
            }
        }
        assert!(writes > 4_500 && cas > 4_500, "writes={writes} cas={cas}");
    }

    #[test]
    fn test_stagger_mean() {
        let mut rng = StdRng::seed_from_u64(3);
        let mean = Duration::from_millis(500);
        let mut total = Duration::ZERO;
        for _ in 0..10_000 {
            let delay = stagger(mean, &mut rng);
            assert!(delay < Duration::from_secs(1));
            total += delay;
        }
        let average = total / 10_000;
        assert!(average > Duration::from_millis(480) && average < Duration::from_millis(520));
        assert_eq!(stagger(Duration::ZERO, &mut rng), Duration::ZERO);
    }
}
