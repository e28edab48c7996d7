use std::collections::HashMap;
use std::sync::Barrier;
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use skein::Map;

/// Ten workers hammer a shared map with a random mix of every operation,
/// each over its own slice of the keyspace so every outcome is deterministic
/// given that worker's ground truth. The map's return values must agree with
/// a plain `HashMap` replayed alongside.
#[test]
fn ground_truth_contention() {
    const WORKERS: u64 = 10;
    const KEYS_PER_WORKER: u64 = 100;
    const OPS: usize = 30_000;

    let map: Map<u64, u64> = Map::new();
    let barrier = Barrier::new(WORKERS as usize);

    let truths: Vec<HashMap<u64, u64>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..WORKERS)
            .map(|worker| {
                let map = &map;
                let barrier = &barrier;
                scope.spawn(move || {
                    let mut rng = StdRng::seed_from_u64(worker);
                    let mut truth: HashMap<u64, u64> = HashMap::new();
                    let base = worker * KEYS_PER_WORKER;
                    barrier.wait();
                    for _ in 0..OPS {
                        let key = base + rng.gen_range(0..KEYS_PER_WORKER);
                        let value = rng.gen_range(0..1_000_000u64);
                        match rng.gen_range(0..7) {
                            0 => {
                                let displaced = map.put(key, value);
                                assert_eq!(displaced, truth.insert(key, value).is_some());
                            }
                            1 => {
                                let replaced = map.put_if_exists(key, value);
                                assert_eq!(replaced, truth.contains_key(&key));
                                if replaced {
                                    truth.insert(key, value);
                                }
                            }
                            2 => {
                                let inserted = map.put_if_absent(key, value);
                                assert_eq!(inserted, !truth.contains_key(&key));
                                if inserted {
                                    truth.insert(key, value);
                                }
                            }
                            3 => {
                                // Compare against the real current value half
                                // the time, garbage the other half.
                                let expected = if rng.gen_bool(0.5) {
                                    truth.get(&key).copied().unwrap_or(value)
                                } else {
                                    value.wrapping_add(1)
                                };
                                let swapped = map.compare_and_swap(key, &expected, value);
                                assert_eq!(swapped, truth.get(&key) == Some(&expected));
                                if swapped {
                                    truth.insert(key, value);
                                }
                            }
                            4 => {
                                let removed = map.delete(&key);
                                assert_eq!(removed, truth.remove(&key).is_some());
                            }
                            5 => {
                                let expected = if rng.gen_bool(0.5) {
                                    truth.get(&key).copied().unwrap_or(value)
                                } else {
                                    value.wrapping_add(1)
                                };
                                let removed = map.delete_if(&key, &expected);
                                assert_eq!(removed, truth.get(&key) == Some(&expected));
                                if removed {
                                    truth.remove(&key);
                                }
                            }
                            _ => {
                                assert_eq!(map.get(&key), truth.get(&key).copied());
                            }
                        }
                    }
                    truth
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    // After quiescence the map agrees with the union of the ground truths,
    // element count included: no update was lost.
    let live: usize = truths.iter().map(HashMap::len).sum();
    assert_eq!(map.len(), live);
    for truth in &truths {
        for (key, value) in truth {
            assert_eq!(map.get(key), Some(*value), "key {key} diverged");
        }
    }
}

/// Sixteen writers insert disjoint key ranges; every key must come back with
/// its value, and the table must have kept growing ahead of occupancy.
#[test]
fn parallel_inserts_survive_resizes() {
    const WRITERS: u64 = 16;
    const PER_WRITER: u64 = 6_250;
    const TOTAL: u64 = WRITERS * PER_WRITER;

    let map: Map<u64, u64> = Map::new();
    thread::scope(|scope| {
        for worker in 0..WRITERS {
            let map = &map;
            scope.spawn(move || {
                for i in 0..PER_WRITER {
                    let key = worker * PER_WRITER + i;
                    map.put(key, key.wrapping_mul(7));
                }
            });
        }
    });

    assert_eq!(map.len(), TOTAL as usize);
    for key in 0..TOTAL {
        assert_eq!(map.get(&key), Some(key.wrapping_mul(7)), "key {key} lost");
    }
    // Load stays at or below one quarter of capacity.
    assert!(
        map.capacity() >= (TOTAL as usize) * 4,
        "final capacity {} is under 4x the {} live keys",
        map.capacity(),
        TOTAL
    );
}

/// Readers racing writers over a hot key set: every read sees either absence
/// or some value a writer actually stored.
#[test]
fn readers_never_see_torn_values() {
    const KEYS: u64 = 64;
    const ROUNDS: u64 = 20_000;

    let map: Map<u64, u64> = Map::new();
    thread::scope(|scope| {
        for writer in 0..4u64 {
            let map = &map;
            scope.spawn(move || {
                let mut rng = StdRng::seed_from_u64(writer);
                for _ in 0..ROUNDS {
                    let key = rng.gen_range(0..KEYS);
                    if rng.gen_bool(0.2) {
                        map.delete(&key);
                    } else {
                        // Values encode their key so readers can validate.
                        map.put(key, key | (u64::from(rng.gen::<u32>()) << 32));
                    }
                }
            });
        }
        for reader in 0..4u64 {
            let map = &map;
            scope.spawn(move || {
                let mut rng = StdRng::seed_from_u64(1000 + reader);
                for _ in 0..ROUNDS {
                    let key = rng.gen_range(0..KEYS);
                    if let Some(value) = map.get(&key) {
                        assert_eq!(value & 0xFFFF_FFFF, key, "read a value from another key");
                    }
                }
            });
        }
    });
}
