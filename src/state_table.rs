//! A reference-counted state hash table.
//!
//! The table maps keys to caller-defined state objects whose presence is
//! coupled to a lifecycle predicate: a state stays in the table for as long
//! as it is held by at least one handle or its [`State::finished`] says
//! there is more to do. The last handle to release a finished state removes
//! it, so the table prunes itself; there is no sweep and no explicit
//! delete.
//!
//! Every lookup-style operation returns a [`StateHandle`], an RAII guard
//! that keeps the state pinned in the table; dropping the handle performs
//! the release. A handle is the only way to touch a state, which makes the
//! release protocol impossible to miss or double-run.
//!
//! Internally each state lives in a wrapper carrying an acquire count and a
//! `garbage` flag behind its own mutex. Removal happens exactly once, by
//! whichever release observes the count at zero with the state finished;
//! the flag marks the wrapper dead so a handle that raced its way to an
//! already-condemned wrapper retries its lookup instead of resurrecting it.

use std::collections::HashMap;
use std::hash::Hash;
use std::ops::Deref;

use parking_lot::Mutex;
use triomphe::Arc;

/// Factory for table entries.
pub trait Params {
    type Key: Hash + Eq + Clone;
    type State: State;

    fn new_state(&self, key: &Self::Key) -> Self::State;
}

/// Lifecycle predicate on a table entry.
pub trait State {
    /// Whether the state can leave the table. Queried only while its wrapper
    /// is locked and the acquire count is zero.
    fn finished(&self) -> bool;
}

struct WrapperCore {
    acquires: u64,
    garbage: bool,
}

struct Wrapper<P: Params> {
    key: P::Key,
    state: P::State,
    core: Mutex<WrapperCore>,
}

pub struct StateTable<P: Params> {
    params: P,
    table: Mutex<HashMap<P::Key, Arc<Wrapper<P>>>>,
}

/// A held reference to one state. Dereferences to the state itself; dropping
/// it releases the state and, if this was the last handle and the state is
/// finished, removes it from the table.
pub struct StateHandle<'t, P: Params> {
    table: &'t StateTable<P>,
    wrapper: Arc<Wrapper<P>>,
}

impl<P: Params> StateTable<P> {
    pub fn new(params: P) -> Self {
        Self {
            params,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Install a fresh state for `key`. Returns `None` (and constructs
    /// nothing visible) if the key is already present.
    pub fn create_state(&self, key: &P::Key) -> Option<StateHandle<'_, P>> {
        let wrapper = self.fresh(key);
        wrapper.core.lock().acquires += 1;
        if self.insert(&wrapper) {
            Some(StateHandle {
                table: self,
                wrapper,
            })
        } else {
            self.release(&wrapper);
            None
        }
    }

    /// Look up the state for `key`, if present.
    pub fn get_state(&self, key: &P::Key) -> Option<StateHandle<'_, P>> {
        loop {
            let wrapper = self.lookup(key)?;
            let mut core = wrapper.core.lock();
            core.acquires += 1;
            let garbage = core.garbage;
            drop(core);
            // A release may have condemned the wrapper between the lookup
            // and our acquire; start over on the current table contents.
            if garbage {
                self.release(&wrapper);
                continue;
            }
            return Some(StateHandle {
                table: self,
                wrapper,
            });
        }
    }

    /// Look up the state for `key`, installing a fresh one if absent.
    pub fn get_or_create_state(&self, key: &P::Key) -> StateHandle<'_, P> {
        loop {
            let wrapper = match self.lookup(key) {
                Some(wrapper) => wrapper,
                None => {
                    let wrapper = self.fresh(key);
                    wrapper.core.lock().acquires += 1;
                    if !self.insert(&wrapper) {
                        self.release(&wrapper);
                        continue;
                    }
                    return StateHandle {
                        table: self,
                        wrapper,
                    };
                }
            };
            let mut core = wrapper.core.lock();
            core.acquires += 1;
            let garbage = core.garbage;
            drop(core);
            if garbage {
                self.release(&wrapper);
                continue;
            }
            return StateHandle {
                table: self,
                wrapper,
            };
        }
    }

    /// Iterate the states present when the iterator was created. The key set
    /// is snapshotted up front: keys added afterwards may or may not be
    /// yielded, and a key removed mid-iteration is simply skipped.
    pub fn iter(&self) -> Iter<'_, P> {
        let keys = self.table.lock().keys().cloned().collect();
        Iter {
            table: self,
            keys,
            idx: 0,
        }
    }

    fn lookup(&self, key: &P::Key) -> Option<Arc<Wrapper<P>>> {
        self.table.lock().get(key).cloned()
    }

    fn fresh(&self, key: &P::Key) -> Arc<Wrapper<P>> {
        Arc::new(Wrapper {
            key: key.clone(),
            state: self.params.new_state(key),
            core: Mutex::new(WrapperCore {
                acquires: 0,
                garbage: false,
            }),
        })
    }

    fn insert(&self, wrapper: &Arc<Wrapper<P>>) -> bool {
        let mut table = self.table.lock();
        if table.contains_key(&wrapper.key) {
            return false;
        }
        table.insert(wrapper.key.clone(), wrapper.clone());
        true
    }

    /// Identity-checked removal: a stale releaser must never evict a
    /// replacement wrapper that has since been installed under the same key.
    fn remove(&self, wrapper: &Arc<Wrapper<P>>) {
        let mut table = self.table.lock();
        if let Some(existing) = table.get(&wrapper.key) {
            if Arc::ptr_eq(existing, wrapper) {
                table.remove(&wrapper.key);
            }
        }
    }

    fn release(&self, wrapper: &Arc<Wrapper<P>>) {
        let mut core = wrapper.core.lock();
        assert!(
            core.acquires > 0,
            "released a state with no outstanding acquires"
        );
        core.acquires -= 1;
        if core.acquires == 0 && !core.garbage && wrapper.state.finished() {
            core.garbage = true;
            self.remove(wrapper);
        }
    }
}

impl<P: Params> StateHandle<'_, P> {
    pub fn key(&self) -> &P::Key {
        &self.wrapper.key
    }
}

impl<P: Params> Deref for StateHandle<'_, P> {
    type Target = P::State;

    fn deref(&self) -> &P::State {
        &self.wrapper.state
    }
}

impl<P: Params> Drop for StateHandle<'_, P> {
    fn drop(&mut self) {
        self.table.release(&self.wrapper);
    }
}

pub struct Iter<'t, P: Params> {
    table: &'t StateTable<P>,
    keys: Vec<P::Key>,
    idx: usize,
}

impl<'t, P: Params> Iterator for Iter<'t, P> {
    type Item = StateHandle<'t, P>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.idx < self.keys.len() {
            let key = &self.keys[self.idx];
            self.idx += 1;
            if let Some(handle) = self.table.get_state(key) {
                return Some(handle);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::{Params, State, StateTable};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct TestState {
        hold: AtomicBool,
        tag: u64,
        serial: usize,
    }

    impl TestState {
        fn set_hold(&self, hold: bool) {
            self.hold.store(hold, Ordering::Relaxed);
        }
    }

    impl State for TestState {
        fn finished(&self) -> bool {
            !self.hold.load(Ordering::Relaxed)
        }
    }

    struct TestParams {
        created: AtomicUsize,
    }

    impl TestParams {
        fn new() -> Self {
            Self {
                created: AtomicUsize::new(0),
            }
        }
    }

    impl Params for TestParams {
        type Key = u64;
        type State = TestState;

        fn new_state(&self, key: &u64) -> TestState {
            TestState {
                hold: AtomicBool::new(false),
                tag: *key,
                serial: self.created.fetch_add(1, Ordering::Relaxed),
            }
        }
    }

    #[test]
    fn lifecycle() {
        const KEY: u64 = 1;
        let table = StateTable::new(TestParams::new());

        // Not there.
        assert!(table.get_state(&KEY).is_none());

        // Make it there, and hold it in the table.
        let s1 = table.create_state(&KEY).unwrap();
        s1.set_hold(true);
        let s1_serial = s1.serial;
        drop(s1);

        // Creating it again fails because it is still held.
        assert!(table.create_state(&KEY).is_none());

        // Getting it returns the same state.
        let got = table.get_state(&KEY).unwrap();
        assert_eq!(got.serial, s1_serial);
        drop(got);

        // So does get-or-create.
        let got = table.get_or_create_state(&KEY);
        assert_eq!(got.serial, s1_serial);

        // Stop holding it; the release prunes the slot.
        got.set_hold(false);
        drop(got);
        assert!(table.get_state(&KEY).is_none());

        // Get-or-create now builds a fresh state.
        let s2 = table.get_or_create_state(&KEY);
        assert_ne!(s2.serial, s1_serial);
    }

    #[test]
    fn unheld_states_vanish_on_release() {
        let table = StateTable::new(TestParams::new());
        let s = table.create_state(&7).unwrap();
        assert!(s.finished());
        drop(s);
        assert!(table.get_state(&7).is_none());
    }

    #[test]
    fn handle_keeps_state_alive_while_finished() {
        let table = StateTable::new(TestParams::new());
        let s = table.create_state(&7).unwrap();
        // Finished but still acquired: a second handle must see it.
        let again = table.get_state(&7).unwrap();
        drop(again);
        assert!(table.get_state(&7).is_some());
        drop(s);
        assert!(table.get_state(&7).is_none());
    }

    #[test]
    fn iteration_yields_each_held_key_once() {
        let table = StateTable::new(TestParams::new());
        for key in 0..100u64 {
            let s = table.create_state(&key).unwrap();
            s.set_hold(true);
        }

        let mut seen = [false; 100];
        for handle in table.iter() {
            let key = *handle.key();
            assert_eq!(handle.tag, key);
            assert!(!seen[key as usize], "key {key} yielded twice");
            seen[key as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));

        for key in 0..100u64 {
            let s = table.get_state(&key).unwrap();
            s.set_hold(false);
        }
        assert_eq!(table.iter().count(), 0);
    }

    #[test]
    fn concurrent_churn_single_key() {
        // Every handle drop is a candidate to prune the slot; the garbage
        // protocol must keep creations and removals from tripping over each
        // other. The acquire-count assert inside release() is the invariant
        // check.
        let table = StateTable::new(TestParams::new());
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for i in 0..10_000u64 {
                        let handle = table.get_or_create_state(&(i % 4));
                        assert_eq!(handle.tag, i % 4);
                    }
                });
            }
        });
        for key in 0..4u64 {
            assert!(table.get_state(&key).is_none());
        }
    }

    #[test]
    fn racing_creates_agree_on_one_winner() {
        let table = StateTable::new(TestParams::new());
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for key in 0..100u64 {
                        if let Some(handle) = table.create_state(&key) {
                            handle.set_hold(true);
                        }
                    }
                });
            }
        });
        // Exactly one create won per key; everything is held and therefore
        // still present.
        let mut count = 0;
        for handle in table.iter() {
            assert_eq!(handle.tag, *handle.key());
            handle.set_hold(false);
            count += 1;
        }
        assert_eq!(count, 100);
    }
}
