use crate::common::{Map, Set};
use crate::protocol::key::{TaskKey, TaskKeyRef};
use crate::server::worker::WorkerId;

/// Bidirectional mapping between data keys and the workers holding a
/// live copy. Invariant: `worker ∈ who_has[key]` exactly when
/// `key ∈ worker_has[worker]`.
#[derive(Default, Debug)]
pub struct LocationRegistry {
    who_has: Map<TaskKey, Set<WorkerId>>,
    worker_has: Map<WorkerId, Set<TaskKey>>,
}

impl LocationRegistry {
    /// Records that `worker` holds `key`. Idempotent.
    pub fn record(&mut self, key: TaskKey, worker: WorkerId) {
        self.worker_has
            .entry(worker)
            .or_default()
            .insert(key.clone());
        self.who_has.entry(key).or_default().insert(worker);
    }

    /// Removes the mapping for `key` and returns the workers that held
    /// it, so the caller can send them eviction messages.
    pub fn release(&mut self, key: &TaskKeyRef) -> Set<WorkerId> {
        let holders = self.who_has.remove(key).unwrap_or_default();
        for worker in &holders {
            if let Some(keys) = self.worker_has.get_mut(worker) {
                keys.remove(key);
                if keys.is_empty() {
                    self.worker_has.remove(worker);
                }
            }
        }
        holders
    }

    /// Drops every entry recorded for `worker`. Called when a worker
    /// connection terminates.
    pub fn forget_worker(&mut self, worker: WorkerId) -> Vec<TaskKey> {
        let keys = self.worker_has.remove(&worker).unwrap_or_default();
        let mut dropped = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(workers) = self.who_has.get_mut(&key) {
                workers.remove(&worker);
                if workers.is_empty() {
                    self.who_has.remove(&key);
                }
            }
            dropped.push(key);
        }
        dropped
    }

    #[inline]
    pub fn holders(&self, key: &TaskKeyRef) -> Option<&Set<WorkerId>> {
        self.who_has.get(key)
    }

    #[inline]
    pub fn is_resident(&self, key: &TaskKeyRef) -> bool {
        self.who_has.get(key).map_or(false, |ws| !ws.is_empty())
    }

    #[cfg(test)]
    fn check_bidirectional(&self) {
        for (key, workers) in &self.who_has {
            assert!(!workers.is_empty());
            for worker in workers {
                assert!(self.worker_has[worker].contains(key));
            }
        }
        for (worker, keys) in &self.worker_has {
            assert!(!keys.is_empty());
            for key in keys {
                assert!(self.who_has[key].contains(worker));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::prelude::*;

    use crate::protocol::key::to_key;

    use super::LocationRegistry;

    #[test]
    fn record_is_idempotent() {
        let mut registry = LocationRegistry::default();
        registry.record(to_key("x"), 1);
        registry.record(to_key("x"), 1);
        assert_eq!(registry.holders(&to_key("x")).unwrap().len(), 1);
        registry.check_bidirectional();
    }

    #[test]
    fn release_returns_holders() {
        let mut registry = LocationRegistry::default();
        registry.record(to_key("x"), 1);
        registry.record(to_key("x"), 2);
        registry.record(to_key("y"), 1);

        let holders = registry.release(&to_key("x"));
        assert_eq!(holders.len(), 2);
        assert!(!registry.is_resident(&to_key("x")));
        assert!(registry.is_resident(&to_key("y")));
        registry.check_bidirectional();

        assert!(registry.release(&to_key("x")).is_empty());
    }

    #[test]
    fn forget_worker_drops_entries() {
        let mut registry = LocationRegistry::default();
        registry.record(to_key("x"), 1);
        registry.record(to_key("x"), 2);
        registry.record(to_key("y"), 2);

        let mut dropped = registry.forget_worker(2);
        dropped.sort();
        assert_eq!(dropped, vec![to_key("x"), to_key("y")]);
        assert!(registry.is_resident(&to_key("x")));
        assert!(!registry.is_resident(&to_key("y")));
        registry.check_bidirectional();
    }

    #[test]
    fn bidirectional_under_random_sequences() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let keys: Vec<_> = (0..8).map(|i| to_key(&format!("k{}", i))).collect();

        let mut registry = LocationRegistry::default();
        for _ in 0..500 {
            let key = keys.choose(&mut rng).unwrap().clone();
            let worker = rng.gen_range(0..5u64);
            match rng.gen_range(0..3) {
                0 | 1 => registry.record(key, worker),
                _ => {
                    registry.release(&key);
                }
            }
            registry.check_bidirectional();
        }
    }
}
