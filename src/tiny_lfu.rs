//! A frequency-based admission filter for caches.
//!
//! The filter keeps a counting sketch of how often each key has been seen
//! and answers one question: is a cache-miss candidate more popular than the
//! eviction victim it would displace? Admitting on frequency rather than
//! recency is the TinyLFU policy [1]; the sketch underneath is a counting
//! Bloom filter / Count-Min row [2], so an estimate can only ever err high
//! for a key. An attacker cannot inflate an unpopular key's estimate
//! without also inflating every key it collides with.
//!
//! Two variants are provided. [`TinyLfu32`] uses 32-bit counters and ages
//! its history: every `memory` observations it halves every counter
//! ("decimation"), so long-dead hot keys fade. Decimation runs under a mutex
//! while readers keep reading; an epoch counter that is odd while a
//! decimation is in flight lets [`TinyLfu32::should_replace`] retry until it
//! has a pair of counts from one stable era. [`TinyLfu64`] trades aging away
//! for wider counters and wait-free reads.
//!
//! Counter array size and hash-position count are derived from the caller's
//! working-set size and byte budget with the usual Bloom arithmetic (see
//! [`crate::bloom`]).
//!
//! [1] TinyLFU: A Highly Efficient Cache Admission Policy
//!     <https://dl.acm.org/citation.cfm?id=3149371>
//! [2] An Improved Data Stream Summary: The Count-Min Sketch and its
//!     Applications
//!     <http://dimacs.rutgers.edu/~graham/pubs/papers/cm-full.pdf>

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::bloom;

/// Lower bound on the false-positive probability fed to the Bloom sizing.
/// 2⁻⁴ keeps the hash-position count within the four 64-bit words the digest
/// scheme yields.
const MIN_P: f64 = 0.0625;

// 128-bit FNV constants.
const FNV_PRIME: u128 = 0x0000_0000_0100_0000_0000_0000_0000_013b;
const FNV_OFFSET: u128 = 0x6c62_272e_07bb_0142_62b8_2175_6295_c58d;

fn fnv1_128(data: &[u8]) -> u128 {
    let mut hash = FNV_OFFSET;
    for &byte in data {
        hash = hash.wrapping_mul(FNV_PRIME);
        hash ^= byte as u128;
    }
    hash
}

fn fnv1a_128(data: &[u8]) -> u128 {
    let mut hash = FNV_OFFSET;
    for &byte in data {
        hash ^= byte as u128;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Four independent counter positions for a key: two 128-bit FNV variants,
/// split big-endian into 64-bit words, each reduced modulo the table length.
fn positions(key: &[u8], len: u64) -> [u64; 4] {
    let d1 = fnv1_128(key);
    let d2 = fnv1a_128(key);
    [
        (d1 >> 64) as u64 % len,
        d1 as u64 % len,
        (d2 >> 64) as u64 % len,
        d2 as u64 % len,
    ]
}

/// Sizes a filter: counter positions and hash count for a working set of
/// `memory` keys within `space` bytes at `width` bytes per counter.
fn dimension(memory: f64, space: u64, width: u64) -> (usize, usize) {
    assert!(memory >= 1.0, "frequency filter needs a nonzero working-set size");
    assert!(space >= width, "frequency filter space budget holds no counter");
    let mut m = space as f64 / width as f64;
    let mut p = bloom::params_p(memory, m);
    if p < MIN_P {
        p = MIN_P;
        m = bloom::params_m(memory, p);
        assert!(
            m * width as f64 <= space as f64,
            "frequency filter sizing exceeded its space budget"
        );
    }
    let keys = (bloom::keys_for_probability(p).ceil() as usize).max(1);
    (keys, m as usize)
}

/// The aging variant: 32-bit counters, halved across the board every
/// `memory` observations.
pub struct TinyLfu32 {
    memory: u32,
    counter: AtomicU32,
    /// Even at rest, odd while a decimation is in progress.
    epoch: AtomicU64,
    keys: usize,
    counts: Box<[AtomicU32]>,
    decay: Mutex<()>,
}

impl TinyLfu32 {
    /// `memory` is the expected working-set size in distinct keys (and the
    /// decay period in observations); `space` is the byte budget for the
    /// counter array.
    pub fn new(memory: u32, space: u64) -> Self {
        let (keys, counts) = dimension(memory as f64, space, 4);
        Self {
            memory,
            counter: AtomicU32::new(0),
            epoch: AtomicU64::new(0),
            keys,
            counts: (0..counts).map(|_| AtomicU32::new(0)).collect(),
            decay: Mutex::new(()),
        }
    }

    /// Record one observation of `key`, decimating first if this observation
    /// completes a decay period.
    pub fn tally(&self, key: &[u8]) {
        let h = positions(key, self.counts.len() as u64);
        for &i in h.iter().take(self.keys) {
            self.counts[i as usize].fetch_add(1, Ordering::AcqRel);
        }
        if self.counter.fetch_add(1, Ordering::AcqRel) + 1 == self.memory {
            self.decimate();
        }
    }

    /// True iff `candidate` has been observed strictly more often than
    /// `victim`, with both estimates taken from the same decay era.
    pub fn should_replace(&self, victim: &[u8], candidate: &[u8]) -> bool {
        let hv = positions(victim, self.counts.len() as u64);
        let hc = positions(candidate, self.counts.len() as u64);
        loop {
            let (v_count, v_epoch) = self.read(&hv);
            let (c_count, c_epoch) = self.read(&hc);
            if v_epoch == c_epoch {
                // An odd epoch is a decimation in flight; its halving sweep
                // may sit between the two reads.
                if c_epoch & 0x1 == 1 {
                    continue;
                }
                return v_count < c_count;
            }
        }
    }

    /// Minimum counter over the key's positions, sandwiched between two equal
    /// epoch observations.
    fn read(&self, hashes: &[u64; 4]) -> (u32, u64) {
        loop {
            let epoch = self.epoch.load(Ordering::Acquire);
            let mut count = u32::MAX;
            for &i in hashes.iter().take(self.keys) {
                count = count.min(self.counts[i as usize].load(Ordering::Acquire));
            }
            if epoch == self.epoch.load(Ordering::Acquire) {
                return (count, epoch);
            }
        }
    }

    fn decimate(&self) {
        let _decay = self.decay.lock();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        divide_two(&self.counter);
        for count in self.counts.iter() {
            divide_two(count);
        }
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }
}

/// Halve a counter without losing concurrent increments.
fn divide_two(count: &AtomicU32) {
    loop {
        let value = count.load(Ordering::Acquire);
        if count
            .compare_exchange(value, value / 2, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            break;
        }
    }
}

/// The plain variant: 64-bit counters, no aging, wait-free throughout.
pub struct TinyLfu64 {
    keys: usize,
    counts: Box<[AtomicU64]>,
}

impl TinyLfu64 {
    pub fn new(memory: u64, space: u64) -> Self {
        let (keys, counts) = dimension(memory as f64, space, 8);
        Self {
            keys,
            counts: (0..counts).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn tally(&self, key: &[u8]) {
        let h = positions(key, self.counts.len() as u64);
        for &i in h.iter().take(self.keys) {
            self.counts[i as usize].fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn should_replace(&self, victim: &[u8], candidate: &[u8]) -> bool {
        let hv = positions(victim, self.counts.len() as u64);
        let hc = positions(candidate, self.counts.len() as u64);
        self.read(&hv) < self.read(&hc)
    }

    fn read(&self, hashes: &[u64; 4]) -> u64 {
        let mut count = u64::MAX;
        for &i in hashes.iter().take(self.keys) {
            count = count.min(self.counts[i as usize].load(Ordering::Acquire));
        }
        count
    }
}

// Accessors only available for testing.
#[cfg(test)]
impl TinyLfu32 {
    fn min_count(&self, key: &[u8]) -> u32 {
        self.read(&positions(key, self.counts.len() as u64)).0
    }

    fn epoch_value(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn space_used(&self) -> u64 {
        self.counts.len() as u64 * 4
    }

    fn hash_count(&self) -> usize {
        self.keys
    }
}

#[cfg(test)]
impl TinyLfu64 {
    fn min_count_64(&self, key: &[u8]) -> u64 {
        self.read(&positions(key, self.counts.len() as u64))
    }

    fn space_used(&self) -> u64 {
        self.counts.len() as u64 * 8
    }

    fn hash_count(&self) -> usize {
        self.keys
    }
}
