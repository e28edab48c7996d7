use std::sync::atomic::{self, AtomicUsize, Ordering};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

use super::{Map, MapHelper, Match, PutVal};

pub(crate) const MIN_CAPACITY: usize = 8;
pub(crate) const REPROBE_LIMIT: usize = 10;

/// Slots copied per draft of copy work. Writers that trip over an in-progress
/// copy perform one chunk before resuming their own operation.
pub(crate) const COPY_CHUNK: usize = 1024;

pub(crate) const TOMBSTONE_TAG: usize = 0b01; // a deleted value, or a sealed key
pub(crate) const PRIME_TAG: usize = 0b10; // mid-copy; the in-table value is not to be trusted

/// Key and value allocations go through this wrapper so the low bits of their
/// pointers are always free to hold the two tags above, whatever `T`'s own
/// alignment is.
#[repr(align(8))]
pub(crate) struct Aligned<T>(pub(crate) T);

/// The deletion sentinel: a tagged null, distinguishable from plain absence.
#[inline]
pub(crate) fn tombstone<'g, T>() -> Shared<'g, Aligned<T>> {
    Shared::null().with_tag(TOMBSTONE_TAG)
}

/// The primed tombstone: terminal state of every copied slot.
#[inline]
pub(crate) fn tombprime<'g, T>() -> Shared<'g, Aligned<T>> {
    Shared::null().with_tag(TOMBSTONE_TAG | PRIME_TAG)
}

#[inline]
pub(crate) fn prime<'g, T>(ptr: Shared<'g, Aligned<T>>) -> Shared<'g, Aligned<T>> {
    ptr.with_tag(ptr.tag() | PRIME_TAG)
}

#[inline]
pub(crate) fn deprime<'g, T>(ptr: Shared<'g, Aligned<T>>) -> Shared<'g, Aligned<T>> {
    ptr.with_tag(ptr.tag() & !PRIME_TAG)
}

#[inline]
pub(crate) fn is_primed<T>(ptr: Shared<'_, Aligned<T>>) -> bool {
    ptr.tag() & PRIME_TAG != 0
}

/// True for plain null and for the tombstone: no live mapping here. False for
/// live values and for anything primed.
#[inline]
pub(crate) fn is_dead<T>(ptr: Shared<'_, Aligned<T>>) -> bool {
    ptr.is_null() && ptr.tag() & PRIME_TAG == 0
}

#[inline]
pub(crate) fn is_clear<T>(ptr: Shared<'_, Aligned<T>>) -> bool {
    ptr.is_null() && ptr.tag() == 0
}

#[inline]
pub(crate) fn is_key_tombstone<T>(ptr: Shared<'_, Aligned<T>>) -> bool {
    ptr.is_null() && ptr.tag() & TOMBSTONE_TAG != 0
}

#[inline]
pub(crate) fn reprobe_limit(capacity: usize) -> usize {
    REPROBE_LIMIT + (capacity >> 2)
}

pub(crate) struct Slot<K, V> {
    pub(super) key: Atomic<Aligned<K>>,
    pub(super) value: Atomic<Aligned<V>>,
}

/// One generation of the map. Tables are chained through `next`; a table is
/// retired once every slot has been sealed with the primed tombstone and the
/// map's root pointer has been advanced past it.
pub(crate) struct Table<K, V> {
    pub(super) capacity: usize,
    pub(super) depth: u64,
    /// Keys claimed in this table, live or not.
    pub(super) slots_used: AtomicUsize,
    /// Live mappings in this table.
    pub(super) elems: AtomicUsize,
    copy_idx: AtomicUsize,
    copy_done: AtomicUsize,
    pub(super) next: Atomic<Table<K, V>>,
    pub(super) slots: Box<[Slot<K, V>]>,
}

impl<K, V> Table<K, V> {
    pub(crate) fn new(depth: u64, capacity: usize) -> Self {
        assert!(
            capacity >= MIN_CAPACITY && capacity.is_power_of_two(),
            "table capacity must be a power of two, no smaller than {MIN_CAPACITY}"
        );
        let slots = (0..capacity)
            .map(|_| Slot {
                key: Atomic::null(),
                value: Atomic::null(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            capacity,
            depth,
            slots_used: AtomicUsize::new(0),
            elems: AtomicUsize::new(0),
            copy_idx: AtomicUsize::new(0),
            copy_done: AtomicUsize::new(0),
            next: Atomic::null(),
            slots,
        }
    }

    #[inline]
    pub(super) fn slot(&self, idx: usize) -> &Slot<K, V> {
        &self.slots[idx]
    }

    /// A probe sequence that exhausts the base reprobe budget against a table
    /// whose slots are at least one quarter claimed will not get better by
    /// probing further; the table needs to grow.
    pub(super) fn is_crowded(&self, reprobes: usize) -> bool {
        reprobes >= REPROBE_LIMIT && self.slots_used.load(Ordering::Relaxed) >= self.capacity >> 2
    }
}

impl<K: Clone, V: Clone> Table<K, V> {
    /// Returns this table's successor, installing one first if nobody has.
    /// The new capacity quadruples when the table is at least half live,
    /// doubles at a quarter, and otherwise stays put unless the table has
    /// churned through twice as many slots as it holds live elements within a
    /// second of the previous resize, in which case it doubles anyway.
    pub(super) fn resize<'g, H>(&self, m: &Map<K, V, H>, guard: &'g Guard) -> &'g Table<K, V>
    where
        H: MapHelper<K, V>,
    {
        if let Some(next) = unsafe { self.next.load_consume(guard).as_ref() } {
            return next;
        }

        let old_size = self.elems.load(Ordering::Relaxed);
        let mut new_size = old_size;
        if old_size >= self.capacity >> 2 {
            new_size = self.capacity << 1;
            if old_size >= self.capacity >> 1 {
                new_size = self.capacity << 2;
            }
        }

        let last_resize = m.last_resize.load(Ordering::Acquire);
        if new_size < self.capacity
            && last_resize
                .checked_add(1000)
                .map_or(false, |deadline| m.millis() <= deadline)
            && self.slots_used.load(Ordering::Relaxed) >= old_size << 1
        {
            new_size = self.capacity << 1;
        }
        if new_size < self.capacity {
            new_size = self.capacity;
        }
        let new_capacity = new_size.next_power_of_two().max(MIN_CAPACITY);
        assert!(new_capacity >= self.capacity, "a table never shrinks");

        if let Some(next) = unsafe { self.next.load_consume(guard).as_ref() } {
            return next;
        }
        let table = Owned::new(Table::new(self.depth + 1, new_capacity));
        match self
            .next
            .compare_exchange(Shared::null(), table, Ordering::AcqRel, Ordering::Acquire, guard)
        {
            Ok(installed) => unsafe { installed.deref() },
            Err(e) => unsafe { e.current.deref() },
        }
    }

    /// Perform copy work towards this table's successor. Each pass claims a
    /// chunk of the copy cursor and copies those slots; with `copy_all` the
    /// caller keeps at it (yielding between chunks) until the whole table is
    /// sealed. Once the cursor has lapped the table, late helpers stop
    /// claiming and sweep linearly instead.
    pub(super) fn help_copy<H>(&self, m: &Map<K, V, H>, guard: &Guard, copy_all: bool)
    where
        H: MapHelper<K, V>,
    {
        let next = self.next.load_consume(guard);
        let next = unsafe { next.as_ref() }.expect("help_copy without a successor table");
        let chunk = self.capacity.min(COPY_CHUNK);
        let mut sweeping = false;
        let mut idx = 0;

        while self.copy_done.load(Ordering::Acquire) < self.capacity {
            if !sweeping {
                idx = self.copy_idx.load(Ordering::Relaxed);
                while idx < self.capacity << 1 {
                    idx = self.copy_idx.load(Ordering::Relaxed);
                    if self
                        .copy_idx
                        .compare_exchange(idx, idx + chunk, Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                    {
                        break;
                    }
                }
                if idx >= self.capacity << 1 {
                    sweeping = true;
                }
            }

            let mut work_done = 0;
            for i in 0..chunk {
                if self.copy_slot(m, guard, (idx + i) & (self.capacity - 1), next) {
                    work_done += 1;
                }
            }
            if work_done > 0 {
                self.copy_check_and_promote(m, guard, work_done);
            }
            idx += chunk;
            if !copy_all && !sweeping {
                return;
            }
            std::thread::yield_now();
        }

        self.copy_check_and_promote(m, guard, 0);
    }

    /// Copy a single slot (the one an operation tripped over) and return the
    /// successor table the operation should continue in.
    pub(super) fn copy_slot_and_check<'g, H>(
        &self,
        m: &Map<K, V, H>,
        guard: &'g Guard,
        idx: usize,
        should_help: bool,
    ) -> &'g Table<K, V>
    where
        H: MapHelper<K, V>,
    {
        let next = self.next.load_consume(guard);
        let next = unsafe { next.as_ref() }.expect("copying a slot without a successor table");
        if self.copy_slot(m, guard, idx, next) {
            self.copy_check_and_promote(m, guard, 1);
        }
        if should_help {
            m.help_copy_root(guard);
        }
        next
    }

    fn copy_check_and_promote<H>(&self, m: &Map<K, V, H>, guard: &Guard, work_done: usize)
    where
        H: MapHelper<K, V>,
    {
        let mut done = self.copy_done.load(Ordering::Acquire);
        assert!(
            done + work_done <= self.capacity,
            "copied more slots than the table holds"
        );
        if work_done > 0 {
            done = self.copy_done.fetch_add(work_done, Ordering::AcqRel) + work_done;
            assert!(done <= self.capacity, "copied more slots than the table holds");
        }
        if done < self.capacity {
            return;
        }
        // Every slot is sealed; whoever observes the root still pointing here
        // swings it to the successor and retires this table.
        let next = self.next.load_consume(guard);
        let this = Shared::from(self as *const Table<K, V>);
        if m.table
            .compare_exchange(this, next, Ordering::AcqRel, Ordering::Acquire, guard)
            .is_ok()
        {
            m.last_resize.store(m.millis(), Ordering::Release);
            unsafe { defer_destroy_table(guard, this) };
        }
    }

    /// Seal one slot of this table into `new_table`. Returns true for the one
    /// caller whose work completed the slot's copy; that caller owns the
    /// slot's contribution to the copy-done count.
    fn copy_slot<H>(
        &self,
        m: &Map<K, V, H>,
        guard: &Guard,
        idx: usize,
        new_table: &Table<K, V>,
    ) -> bool
    where
        H: MapHelper<K, V>,
    {
        let slot = self.slot(idx);

        // A never-claimed slot is sealed outright: key to tombstone, value to
        // the primed tombstone.
        let mut kw = slot.key.load_consume(guard);
        while is_clear(kw) {
            if slot
                .key
                .compare_exchange(
                    Shared::null(),
                    tombstone::<K>(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                )
                .is_ok()
            {
                let mut tmp = slot.value.load_consume(guard);
                while slot
                    .value
                    .compare_exchange(tmp, tombprime::<V>(), Ordering::AcqRel, Ordering::Acquire, guard)
                    .is_err()
                {
                    tmp = slot.value.load_consume(guard);
                }
                return true;
            }
            kw = slot.key.load_consume(guard);
        }
        if is_key_tombstone(kw) {
            return false;
        }

        // Box the value: dead slots go straight to the primed tombstone, live
        // ones get primed in place so no writer trusts them any longer.
        let mut old_val = slot.value.load_consume(guard);
        while !is_primed(old_val) {
            let boxed = if is_dead(old_val) {
                tombprime::<V>()
            } else {
                prime(old_val)
            };
            match slot
                .value
                .compare_exchange(old_val, boxed, Ordering::AcqRel, Ordering::Acquire, guard)
            {
                Ok(_) => {
                    if boxed == tombprime::<V>() {
                        return true;
                    }
                    old_val = boxed;
                    break;
                }
                Err(e) => old_val = e.current,
            }
        }
        if old_val == tombprime::<V>() {
            return false;
        }

        // The slot held a live value. Install a copy in the successor unless
        // the successor already saw a newer write for this key.
        let key = slot.key.load_consume(guard);
        let old_unboxed = deprime(old_val);
        assert!(!old_unboxed.is_null(), "a primed slot must hold a live value");
        let key_ref = &unsafe { key.deref() }.0;
        let value = PutVal::Value(Owned::new(Aligned(unsafe { old_unboxed.deref() }.0.clone())));
        new_table.elems.fetch_add(1, Ordering::Relaxed);
        m.put_if_match(
            guard,
            new_table,
            key_ref,
            m.helper.hash_key(key_ref),
            Match::Empty,
            value,
        );

        // Seal the old slot. The winner of this transition retires the
        // superseded allocation; losers undo their element count.
        loop {
            match slot
                .value
                .compare_exchange(old_val, tombprime::<V>(), Ordering::AcqRel, Ordering::Acquire, guard)
            {
                Ok(_) => {
                    unsafe { defer_destroy(guard, old_unboxed) };
                    return true;
                }
                Err(e) => {
                    if e.current == tombprime::<V>() {
                        new_table.elems.fetch_sub(1, Ordering::Relaxed);
                        return false;
                    }
                }
            }
        }
    }
}

/// Drops an allocation once no pinned reader can still see it.
pub(super) unsafe fn defer_destroy<T>(guard: &Guard, ptr: Shared<'_, Aligned<T>>) {
    assert!(!ptr.is_null());
    guard.defer_unchecked(move || {
        atomic::fence(Ordering::Acquire);
        drop(ptr.into_owned());
    });
}

/// Retires a fully-copied table: its keys, then the table itself. By the
/// promotion invariant every value here is the primed tombstone, so keys are
/// the only allocations left to free.
pub(super) unsafe fn defer_destroy_table<K, V>(guard: &Guard, ptr: Shared<'_, Table<K, V>>) {
    assert!(!ptr.is_null());
    guard.defer_unchecked(move || {
        atomic::fence(Ordering::Acquire);
        let unprotected = crossbeam_epoch::unprotected();
        for slot in ptr.deref().slots.iter() {
            let key = slot.key.load(Ordering::Relaxed, unprotected);
            if !key.is_null() {
                drop(key.into_owned());
            }
            debug_assert!(slot.value.load(Ordering::Relaxed, unprotected) == tombprime::<V>());
        }
        drop(ptr.into_owned());
    });
}
