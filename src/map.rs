//! A nearly wait-free hash map.
//!
//! Strictly speaking the map is lock-free because of the possibility of
//! chained resize operations, but operations that do not run into a resize
//! see behavior equivalent to wait-free.
//!
//! The map is an open-addressed table of slots, each holding two atomic
//! pointers: a key and a value. A slot's key is claimed at most once (null to
//! key) and never changes afterwards; all mutation happens on the value
//! pointer, which moves through a monotone lattice: null, to any number of
//! live values, to a *primed* value, to the primed tombstone. Tags in the low
//! pointer bits encode the sentinels: a tagged null is the tombstone (a
//! deletion, distinct from plain absence), the prime tag marks a value that
//! is mid-copy and must not be trusted in this table, and the doubly-tagged
//! null ("tombprime") is the terminal state of every copied slot.
//!
//! Resizing is incremental and cooperative. A writer that finds the table too
//! full (or trips over a slot that is already being copied) installs a
//! successor table on the `next` pointer and performs a bounded chunk of copy
//! work before continuing in the successor; every other writer that comes
//! along helps with its own chunk. A slot is copied by priming its value,
//! re-inserting the live value into the successor (unless the successor has
//! already seen a newer write for that key), and sealing the old slot with
//! the primed tombstone. Once every slot is sealed, the map's root pointer is
//! swung to the successor and the old table is retired. Readers never block:
//! a reader that meets a primed value copies that one slot itself and retries
//! in the successor.
//!
//! This design is borrowed from Cliff Click's lock-free hash table for the
//! JVM, by way of its C++ ports:
//! - Video from Cliff: <https://www.youtube.com/watch?v=HJ-719EGIts>
//! - Code from Cliff: <https://github.com/boundary/high-scale-lib>

pub(crate) mod table;

use std::{
    collections::hash_map::RandomState,
    hash::{BuildHasher, Hash, Hasher},
    sync::atomic::{self, AtomicU64, AtomicUsize, Ordering},
};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use quanta::{Clock, Instant};

use table::{
    defer_destroy, deprime, is_clear, is_dead, is_key_tombstone, is_primed, reprobe_limit,
    tombstone, Aligned, Slot, Table, MIN_CAPACITY,
};

/// Hashing and equality, supplied by the caller. Keys and values are opaque
/// to the map itself; the sentinels it stores internally never reach these
/// predicates.
pub trait MapHelper<K, V> {
    fn hash_key(&self, key: &K) -> u64;
    fn keys_equal(&self, a: &K, b: &K) -> bool;
    fn values_equal(&self, a: &V, b: &V) -> bool;
}

/// The obvious helper for keys and values that already carry the std traits.
///
/// The default build hasher is the one used by `std::collections::HashMap`,
/// which provides resistance against HashDoS attacks at some cost on small
/// keys; swap in another `BuildHasher` if that trade-off is wrong for you.
pub struct DefaultHelper<S = RandomState> {
    build_hasher: S,
}

impl<S: Default> Default for DefaultHelper<S> {
    fn default() -> Self {
        Self {
            build_hasher: S::default(),
        }
    }
}

impl<S> DefaultHelper<S> {
    pub fn with_hasher(build_hasher: S) -> Self {
        Self { build_hasher }
    }
}

impl<K, V, S> MapHelper<K, V> for DefaultHelper<S>
where
    K: Hash + Eq,
    V: PartialEq,
    S: BuildHasher,
{
    fn hash_key(&self, key: &K) -> u64 {
        let mut hasher = self.build_hasher.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn keys_equal(&self, a: &K, b: &K) -> bool {
        a == b
    }

    fn values_equal(&self, a: &V, b: &V) -> bool {
        a == b
    }
}

/// The expected-value predicate a write carries into the value-install loop.
pub(crate) enum Match<'a, V> {
    /// Accept whatever is there, absence and tombstones included.
    AnyOld,
    /// Accept only a live value.
    Live,
    /// Accept only absence or a tombstone.
    Dead,
    /// Accept only a slot whose value was never set. Used by the copy
    /// protocol so an old value never clobbers a newer write in the
    /// successor table.
    Empty,
    /// Accept only a live value equal to this one.
    Value(&'a V),
}

// Derived impls would demand `V: Copy`; every variant is copyable for any
// `V` since the expected value is only ever borrowed.
impl<V> Clone for Match<'_, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for Match<'_, V> {}

pub(crate) enum PutVal<V> {
    Tombstone,
    Value(Owned<Aligned<V>>),
}

/// A hash map safe for any number of concurrent readers and writers, with
/// readers that never block.
///
/// Construct one with [`Map::new`] (std `Hash`/`Eq`/`PartialEq` via
/// [`DefaultHelper`]) or [`Map::with_helper`]. Writes clone the key on first
/// claim and clone values when drafted into copy work, hence the `Clone`
/// bounds on the operations.
///
/// [`len`](Map::len) is advisory under concurrency: it is exact after
/// quiescence but only approximately current while writers are active.
pub struct Map<K, V, H = DefaultHelper> {
    helper: H,
    table: Atomic<Table<K, V>>,
    size: AtomicUsize,
    last_resize: AtomicU64,
    clock: Clock,
    origin: Instant,
}

impl<K, V> Map<K, V, DefaultHelper> {
    pub fn new() -> Self {
        Self::with_helper(DefaultHelper::default())
    }
}

impl<K, V> Default for Map<K, V, DefaultHelper> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, H> Map<K, V, H> {
    pub fn with_helper(helper: H) -> Self {
        let clock = Clock::new();
        let origin = clock.now();
        Self {
            helper,
            table: Atomic::new(Table::new(1, MIN_CAPACITY)),
            size: AtomicUsize::new(0),
            // u64::MAX means no resize has completed yet.
            last_resize: AtomicU64::new(u64::MAX),
            clock,
            origin,
        }
    }

    /// Live mappings in the map. A plain atomic load; advisory while writers
    /// are active.
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn millis(&self) -> u64 {
        (self.clock.now() - self.origin).as_millis() as u64
    }

    fn root<'g>(&self, guard: &'g Guard) -> &'g Table<K, V> {
        // The root pointer is installed at construction and only ever swung
        // to a successor; it is never null.
        unsafe { self.table.load_consume(guard).deref() }
    }

    /// Capacity of the current root table. Advisory: a resize may be in
    /// progress, and another may begin at any time.
    pub fn capacity(&self) -> usize {
        let guard = &crossbeam_epoch::pin();
        self.root(guard).capacity
    }
}

impl<K, V, H> Map<K, V, H>
where
    K: Clone,
    V: Clone,
    H: MapHelper<K, V>,
{
    /// Unconditional insert. Returns whether a live mapping was displaced.
    pub fn put(&self, key: K, value: V) -> bool {
        let guard = &crossbeam_epoch::pin();
        let obs = self.put_root(guard, &key, Match::AnyOld, PutVal::Value(Owned::new(Aligned(value))));
        !is_dead(obs)
    }

    /// Replace the value for `key` only if a live mapping exists. Returns
    /// whether the replacement happened.
    pub fn put_if_exists(&self, key: K, value: V) -> bool {
        let guard = &crossbeam_epoch::pin();
        let obs = self.put_root(guard, &key, Match::Live, PutVal::Value(Owned::new(Aligned(value))));
        !is_dead(obs)
    }

    /// Insert only if no live mapping exists. Returns whether the insert
    /// happened.
    pub fn put_if_absent(&self, key: K, value: V) -> bool {
        let guard = &crossbeam_epoch::pin();
        let obs = self.put_root(guard, &key, Match::Dead, PutVal::Value(Owned::new(Aligned(value))));
        is_dead(obs)
    }

    /// Replace the value for `key` only if the current value equals
    /// `expected` under the helper's `values_equal`.
    pub fn compare_and_swap(&self, key: K, expected: &V, value: V) -> bool {
        let guard = &crossbeam_epoch::pin();
        let obs = self.put_root(
            guard,
            &key,
            Match::Value(expected),
            PutVal::Value(Owned::new(Aligned(value))),
        );
        self.observed_equals(expected, obs)
    }

    /// Delete any current mapping. Returns whether a live value was
    /// displaced.
    pub fn delete(&self, key: &K) -> bool {
        let guard = &crossbeam_epoch::pin();
        let obs = self.put_root(guard, key, Match::AnyOld, PutVal::Tombstone);
        !is_dead(obs)
    }

    /// Delete only if the current value equals `expected`.
    pub fn delete_if(&self, key: &K, expected: &V) -> bool {
        let guard = &crossbeam_epoch::pin();
        let obs = self.put_root(guard, key, Match::Value(expected), PutVal::Tombstone);
        self.observed_equals(expected, obs)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let guard = &crossbeam_epoch::pin();
        let hash = self.helper.hash_key(key);
        self.get_in(guard, self.root(guard), hash, key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    fn put_root<'g>(
        &self,
        guard: &'g Guard,
        key: &K,
        expected: Match<'_, V>,
        put: PutVal<V>,
    ) -> Shared<'g, Aligned<V>>
    where
        K: 'g,
    {
        let hash = self.helper.hash_key(key);
        let obs = self.put_if_match(guard, self.root(guard), key, hash, expected, put);
        assert!(!is_primed(obs), "a write observed a primed value");
        obs
    }

    fn observed_equals(&self, expected: &V, obs: Shared<'_, Aligned<V>>) -> bool {
        match unsafe { obs.as_ref() } {
            Some(cell) if !is_primed(obs) => self.helper.values_equal(expected, &cell.0),
            _ => false,
        }
    }

    fn keys_match(&self, key: &K, k: Shared<'_, Aligned<K>>) -> bool {
        match unsafe { k.as_ref() } {
            Some(cell) => self.helper.keys_equal(key, &cell.0),
            None => false,
        }
    }

    /// Draft this thread into one chunk of copy work on the root table, if a
    /// copy is in progress there.
    pub(crate) fn help_copy_root(&self, guard: &Guard) {
        let top = self.root(guard);
        if !top.next.load_consume(guard).is_null() {
            top.help_copy(self, guard, false);
        }
    }

    fn get_in<'g>(
        &self,
        guard: &'g Guard,
        t: &'g Table<K, V>,
        hash: u64,
        key: &K,
    ) -> Option<V> {
        let mask = t.capacity - 1;
        let mut idx = (hash as usize) & mask;
        let mut reprobes = 0;
        loop {
            let slot = t.slot(idx);
            let k = slot.key.load_consume(guard);
            let v = slot.value.load_consume(guard);
            if is_clear(k) {
                return None;
            }
            if self.keys_match(key, k) {
                if !is_primed(v) {
                    if is_dead(v) {
                        return None;
                    }
                    return Some(unsafe { v.deref() }.0.clone());
                }
                let nested = t.copy_slot_and_check(self, guard, idx, true);
                return self.get_in(guard, nested, hash, key);
            }
            reprobes += 1;
            if reprobes >= reprobe_limit(t.capacity) || is_key_tombstone(k) {
                return match unsafe { t.next.load_consume(guard).as_ref() } {
                    Some(nested) => {
                        self.help_copy_root(guard);
                        self.get_in(guard, nested, hash, key)
                    }
                    None => None,
                };
            }
            idx = (idx + 1) & mask;
        }
    }

    /// The one write primitive everything else is sugar over: claim a slot
    /// for `key`, then install `put` if the current value satisfies
    /// `expected`. Returns the previously observed value, with absence
    /// reported as the tombstone so callers can distinguish "matched nothing"
    /// from "displaced something".
    pub(crate) fn put_if_match<'g>(
        &self,
        guard: &'g Guard,
        t: &'g Table<K, V>,
        key: &K,
        hash: u64,
        expected: Match<'_, V>,
        mut put: PutVal<V>,
    ) -> Shared<'g, Aligned<V>> {
        // A table whose depth lags the root's has been fully copied and
        // tombstoned; any put into it is guaranteed to fail, and a highly
        // churning map can leave a key permanently behind. Restart on the
        // root.
        let root = self.root(guard);
        if root.depth > t.depth {
            return self.put_if_match(guard, root, key, hash, expected, put);
        }

        let put_is_tombstone = matches!(put, PutVal::Tombstone);
        let is_copy_install = matches!(expected, Match::Empty);
        let mask = t.capacity - 1;
        let mut idx = (hash as usize) & mask;
        let mut reprobes = 0;

        // Phase one: claim a slot for the key.
        let (slot, mut v) = loop {
            let slot = t.slot(idx);
            let mut k = slot.key.load_consume(guard);
            let v = slot.value.load_consume(guard);
            if is_clear(k) {
                // Deleting a key nobody ever claimed: nothing to do.
                if put_is_tombstone {
                    return tombstone();
                }
                match slot.key.compare_exchange(
                    Shared::null(),
                    Owned::new(Aligned(key.clone())),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                ) {
                    Ok(_) => {
                        t.slots_used.fetch_add(1, Ordering::Relaxed);
                        break (slot, v);
                    }
                    Err(e) => {
                        let claimed = e.current;
                        drop(e.new);
                        k = claimed;
                    }
                }
            }
            if self.keys_match(key, k) {
                break (slot, v);
            }
            reprobes += 1;
            if reprobes >= reprobe_limit(t.capacity) || is_key_tombstone(k) {
                let nested = t.resize(self, guard);
                if !is_copy_install {
                    self.help_copy_root(guard);
                }
                return self.put_if_match(guard, nested, key, hash, expected, put);
            }
            idx = (idx + 1) & mask;
        };

        // Storing the pointer already present is a no-op; with fresh
        // allocations per write this only fires for a tombstone over a
        // tombstone.
        if !is_primed(v) && put_is_tombstone && v == tombstone::<V>() {
            return v;
        }

        // Phase two: install the value, unless this table is being (or needs
        // to be) copied, in which case copy this slot and continue in the
        // successor.
        let mut nested = unsafe { t.next.load_consume(guard).as_ref() };
        if nested.is_none() && ((is_clear(v) && t.is_crowded(reprobes)) || is_primed(v)) {
            nested = Some(t.resize(self, guard));
        }
        if nested.is_some() {
            let target = t.copy_slot_and_check(self, guard, idx, !is_copy_install);
            return self.put_if_match(guard, target, key, hash, expected, put);
        }

        loop {
            assert!(!is_primed(v), "installing over a primed value");
            let accepts = match expected {
                Match::AnyOld => true,
                Match::Live => !is_dead(v),
                Match::Dead => is_dead(v),
                Match::Empty => is_clear(v),
                Match::Value(cmp) => match unsafe { v.as_ref() } {
                    Some(cell) => self.helper.values_equal(cmp, &cell.0),
                    None => false,
                },
            };
            if !accepts {
                return v;
            }
            match cas_value(slot, v, &mut put, guard) {
                Ok(()) => {
                    if !is_copy_install {
                        if is_dead(v) && !put_is_tombstone {
                            t.elems.fetch_add(1, Ordering::Relaxed);
                            self.size.fetch_add(1, Ordering::Relaxed);
                        }
                        if !is_dead(v) && put_is_tombstone {
                            t.elems.fetch_sub(1, Ordering::Relaxed);
                            self.size.fetch_sub(1, Ordering::Relaxed);
                        }
                    }
                    if !v.is_null() {
                        // The displaced value is unreachable once current
                        // readers unpin.
                        unsafe { defer_destroy(guard, v) };
                    }
                    if !is_copy_install && is_clear(v) {
                        return tombstone();
                    }
                    return v;
                }
                Err(current) => {
                    v = current;
                    if is_primed(v) {
                        let target = t.copy_slot_and_check(self, guard, idx, !is_copy_install);
                        return self.put_if_match(guard, target, key, hash, expected, put);
                    }
                }
            }
        }
    }
}

fn cas_value<'g, K, V>(
    slot: &Slot<K, V>,
    current: Shared<'g, Aligned<V>>,
    put: &mut PutVal<V>,
    guard: &'g Guard,
) -> Result<(), Shared<'g, Aligned<V>>> {
    match std::mem::replace(put, PutVal::Tombstone) {
        PutVal::Tombstone => slot
            .value
            .compare_exchange(
                current,
                tombstone::<V>(),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            )
            .map(|_| ())
            .map_err(|e| e.current),
        PutVal::Value(owned) => match slot.value.compare_exchange(
            current,
            owned,
            Ordering::AcqRel,
            Ordering::Acquire,
            guard,
        ) {
            Ok(_) => Ok(()),
            Err(e) => {
                let current = e.current;
                *put = PutVal::Value(e.new);
                Err(current)
            }
        },
    }
}

impl<K, V, H> Drop for Map<K, V, H> {
    fn drop(&mut self) {
        // Exclusive access: no guards are pinned on this map any more, so
        // walking the chain with an unprotected guard is sound.
        let guard = unsafe { crossbeam_epoch::unprotected() };
        atomic::fence(Ordering::Acquire);

        let mut current = self.table.load(Ordering::Relaxed, guard);
        while let Some(t) = unsafe { current.as_ref() } {
            let next = t.next.load(Ordering::Relaxed, guard);
            for slot in t.slots.iter() {
                let k = slot.key.load(Ordering::Relaxed, guard);
                if !k.is_null() {
                    drop(unsafe { k.into_owned() });
                }
                let v = deprime(slot.value.load(Ordering::Relaxed, guard));
                if !v.is_null() {
                    drop(unsafe { v.into_owned() });
                }
            }
            drop(unsafe { current.into_owned() });
            current = next;
        }
    }
}
