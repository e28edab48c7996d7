//! Support for simulating cache-eviction policies, with and without
//! frequency-based admission.
//!
//! This is study tooling rather than a cache: a [`Policy`] tracks only which
//! keys are resident, the [`Simulation`] driver feeds it a workload, and the
//! interesting question is how hit rates move when a [`TinyLfu64`] filter is
//! allowed to veto insertions (a candidate is admitted only when it is more
//! popular than the victim it would displace).

use std::collections::{HashMap, HashSet};

use crate::tiny_lfu::TinyLfu64;

/// A cache-eviction policy over resident keys.
pub trait Policy {
    /// Whether the cache has filled to capacity.
    fn warm(&self) -> bool;
    /// The key that would be displaced to admit `key`, if any.
    fn next_eviction(&self, key: &str) -> Option<String>;
    fn insert(&mut self, key: &str);
    fn contains(&self, key: &str) -> bool;
    fn evict(&mut self, key: &str);
}

/// Doubly-linked recency order over a slab, with an index for O(1) lookup.
/// Front is most recently placed; eviction candidates come off the back.
#[derive(Default)]
struct RecencyList {
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    index: HashMap<String, usize>,
}

struct Node {
    key: String,
    prev: Option<usize>,
    next: Option<usize>,
}

impl RecencyList {
    fn len(&self) -> usize {
        self.index.len()
    }

    fn has(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    fn back(&self) -> Option<&str> {
        self.tail.map(|idx| self.nodes[idx].key.as_str())
    }

    fn insert_front(&mut self, key: &str) {
        assert!(!self.has(key), "inserted a key that is already present");
        let node = Node {
            key: key.to_owned(),
            prev: None,
            next: self.head,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.attach_front(idx);
        self.index.insert(key.to_owned(), idx);
    }

    fn move_to_front(&mut self, key: &str) {
        let Some(&idx) = self.index.get(key) else {
            panic!("moved a key that is not present");
        };
        self.unlink(idx);
        self.nodes[idx].next = self.head;
        self.attach_front(idx);
    }

    fn remove(&mut self, key: &str) {
        if let Some(idx) = self.index.remove(key) {
            self.unlink(idx);
            self.nodes[idx].key.clear();
            self.free.push(idx);
        }
    }

    fn attach_front(&mut self, idx: usize) {
        self.nodes[idx].prev = None;
        match self.head {
            Some(head) => self.nodes[head].prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        match prev {
            Some(prev) => self.nodes[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.nodes[next].prev = prev,
            None => self.tail = prev,
        }
    }
}

/// Evicts in insertion order; residency does not refresh a key.
pub struct Fifo {
    size: usize,
    list: RecencyList,
}

impl Fifo {
    pub fn new(capacity: usize) -> Self {
        Self {
            size: capacity,
            list: RecencyList::default(),
        }
    }
}

impl Policy for Fifo {
    fn warm(&self) -> bool {
        self.list.len() >= self.size
    }

    fn next_eviction(&self, _key: &str) -> Option<String> {
        self.list.back().map(str::to_owned)
    }

    fn insert(&mut self, key: &str) {
        if !self.list.has(key) {
            self.list.insert_front(key);
            if self.list.len() > self.size {
                if let Some(victim) = self.next_eviction(key) {
                    self.list.remove(&victim);
                }
            }
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.list.has(key)
    }

    fn evict(&mut self, key: &str) {
        self.list.remove(key);
    }
}

/// Evicts the least recently inserted-or-refreshed key.
pub struct Lru {
    size: usize,
    list: RecencyList,
}

impl Lru {
    pub fn new(capacity: usize) -> Self {
        Self {
            size: capacity,
            list: RecencyList::default(),
        }
    }
}

impl Policy for Lru {
    fn warm(&self) -> bool {
        self.list.len() >= self.size
    }

    fn next_eviction(&self, _key: &str) -> Option<String> {
        self.list.back().map(str::to_owned)
    }

    fn insert(&mut self, key: &str) {
        if self.list.has(key) {
            self.list.move_to_front(key);
        } else {
            self.list.insert_front(key);
            if self.list.len() > self.size {
                if let Some(victim) = self.next_eviction(key) {
                    self.list.remove(&victim);
                }
            }
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.list.has(key)
    }

    fn evict(&mut self, key: &str) {
        self.list.remove(key);
    }
}

/// An oracle stand-in: a fixed chosen set is resident forever, and every
/// other key nominates itself for eviction so it is never admitted.
pub struct Pinned {
    chosen: HashSet<String>,
}

impl Pinned {
    pub fn new(chosen: impl IntoIterator<Item = String>) -> Self {
        Self {
            chosen: chosen.into_iter().collect(),
        }
    }
}

impl Policy for Pinned {
    fn warm(&self) -> bool {
        true
    }

    fn next_eviction(&self, key: &str) -> Option<String> {
        if self.chosen.contains(key) {
            None
        } else {
            Some(key.to_owned())
        }
    }

    fn insert(&mut self, _key: &str) {}

    fn contains(&self, key: &str) -> bool {
        self.chosen.contains(key)
    }

    fn evict(&mut self, _key: &str) {}
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub reads: u64,
    pub hits: u64,
    pub inserts: u64,
    pub writes: u64,
}

/// Feeds accesses through a policy, optionally gating insertions on a
/// frequency filter, and counts what happened.
pub struct Simulation<P> {
    policy: P,
    admission: Option<TinyLfu64>,
    outcome: Outcome,
}

impl<P: Policy> Simulation<P> {
    pub fn new(policy: P, admission: Option<TinyLfu64>) -> Self {
        Self {
            policy,
            admission,
            outcome: Outcome::default(),
        }
    }

    pub fn read(&mut self, key: &str) {
        if let Some(filter) = &self.admission {
            filter.tally(key.as_bytes());
        }
        if self.policy.contains(key) {
            self.outcome.hits += 1;
        } else {
            let admit = match (&self.admission, self.policy.next_eviction(key)) {
                (Some(filter), Some(victim)) => {
                    filter.should_replace(victim.as_bytes(), key.as_bytes())
                }
                _ => true,
            };
            if admit {
                self.outcome.inserts += 1;
                self.policy.insert(key);
            }
        }
        self.outcome.reads += 1;
    }

    /// A write invalidates the key.
    pub fn write(&mut self, key: &str) {
        self.policy.evict(key);
        self.outcome.writes += 1;
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::{Fifo, Lru, Outcome, Pinned, Policy, Simulation};
    use crate::tiny_lfu::TinyLfu64;

    #[test]
    fn lru_refreshes_on_insert() {
        let mut lru = Lru::new(3);
        lru.insert("a");
        lru.insert("b");
        lru.insert("c");
        assert!(lru.warm());
        assert_eq!(lru.next_eviction("x").as_deref(), Some("a"));

        // Re-inserting refreshes recency.
        lru.insert("a");
        assert_eq!(lru.next_eviction("x").as_deref(), Some("b"));

        lru.insert("d");
        assert!(!lru.contains("b"));
        assert!(lru.contains("a"));
        assert!(lru.contains("c"));
        assert!(lru.contains("d"));
    }

    #[test]
    fn fifo_ignores_reinsertion() {
        let mut fifo = Fifo::new(2);
        fifo.insert("a");
        fifo.insert("b");
        fifo.insert("a");
        assert_eq!(fifo.next_eviction("x").as_deref(), Some("a"));

        fifo.insert("c");
        assert!(!fifo.contains("a"));
        assert!(fifo.contains("b"));
        assert!(fifo.contains("c"));
    }

    #[test]
    fn evict_then_reinsert() {
        let mut lru = Lru::new(2);
        lru.insert("a");
        lru.insert("b");
        lru.evict("a");
        assert!(!lru.contains("a"));
        lru.insert("c");
        lru.insert("d");
        assert!(lru.contains("c"));
        assert!(lru.contains("d"));
        assert!(!lru.contains("b"));
    }

    #[test]
    fn writes_invalidate() {
        let mut sim = Simulation::new(Lru::new(2), None);
        sim.read("a");
        sim.read("a");
        sim.write("a");
        sim.read("a");
        assert_eq!(
            sim.outcome(),
            Outcome {
                reads: 3,
                hits: 1,
                inserts: 2,
                writes: 1,
            }
        );
    }

    #[test]
    fn pinned_set_never_churns() {
        let chosen = (0..4).map(|i| format!("keep-{i}"));
        let mut sim = Simulation::new(
            Pinned::new(chosen),
            Some(TinyLfu64::new(1024, 65536)),
        );
        for round in 0..10 {
            for i in 0..4 {
                sim.read(&format!("keep-{i}"));
            }
            sim.read(&format!("other-{round}"));
        }
        let outcome = sim.outcome();
        assert_eq!(outcome.hits, 40);
        assert_eq!(outcome.reads, 50);
    }

    /// A hot set under a cold scan: with admission the hot set survives, so
    /// frequency-gated insertion must beat unconditional insertion.
    #[test]
    fn admission_protects_the_hot_set() {
        fn scan_workload(sim: &mut Simulation<Lru>) {
            for round in 0..50u32 {
                for i in 0..8 {
                    sim.read(&format!("hot-{i}"));
                }
                for i in 0..8 {
                    sim.read(&format!("cold-{}", round * 8 + i));
                }
            }
        }

        let warm = |lru: &mut Lru| {
            for i in 0..8 {
                lru.insert(&format!("hot-{i}"));
            }
        };

        let mut plain = Lru::new(8);
        warm(&mut plain);
        let mut unconditional = Simulation::new(plain, None);
        scan_workload(&mut unconditional);

        let mut gated = Lru::new(8);
        warm(&mut gated);
        let mut admitted = Simulation::new(gated, Some(TinyLfu64::new(1024, 65536)));
        scan_workload(&mut admitted);

        let with = admitted.outcome();
        let without = unconditional.outcome();
        assert!(
            with.hits > without.hits,
            "admission ({} hits) should beat unconditional insertion ({} hits)",
            with.hits,
            without.hits
        );
        // The hot set is still resident at the end of the gated run.
        for i in 0..8 {
            assert!(admitted.policy().contains(&format!("hot-{i}")));
        }
    }
}
