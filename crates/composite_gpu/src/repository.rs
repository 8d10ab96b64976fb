//! Reference-counted sharing of device resources
//!
//! Renderers that resolve to the same configuration share one resource. Each
//! holder keeps an `Option<H>` slot; `get` fills it and `release` empties it.
//! The underlying resource is destroyed as soon as its last holder releases.

use rustc_hash::FxHashMap;
use std::fmt::Debug;
use std::hash::Hash;

/// Counters for a [`SharedRepository`]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RepositoryStats {
    /// Existing entry handed out again
    pub hits: u64,
    /// New resource created
    pub misses: u64,
    /// Resources destroyed after their last release
    pub destroyed: u64,
    /// Entries alive right now
    pub active: usize,
}

impl RepositoryStats {
    /// Reuse ratio (0.0 - 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug)]
struct Entry<H> {
    handle: H,
    count: usize,
}

/// Keyed, ref-counted resource cache
#[derive(Debug)]
pub struct SharedRepository<K, H> {
    name: &'static str,
    entries: FxHashMap<K, Entry<H>>,
    keys: FxHashMap<H, K>,
    hits: u64,
    misses: u64,
    destroyed: u64,
}

impl<K, H> SharedRepository<K, H>
where
    K: Hash + Eq + Clone + Debug,
    H: Hash + Eq + Copy + Debug,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: FxHashMap::default(),
            keys: FxHashMap::default(),
            hits: 0,
            misses: 0,
            destroyed: 0,
        }
    }

    /// Whether `held` is already the resource registered under `key`.
    pub fn valid(&self, key: &K, held: Option<H>) -> bool {
        match (held, self.entries.get(key)) {
            (Some(h), Some(entry)) => entry.handle == h,
            _ => false,
        }
    }

    /// Point `held` at the resource for `key`.
    ///
    /// If `held` already refers to it nothing changes. Otherwise the previous
    /// handle is released, then an existing entry is shared or a new one is
    /// created with `create`.
    pub fn get<E>(
        &mut self,
        key: K,
        held: &mut Option<H>,
        create: impl FnOnce(&K) -> Result<H, E>,
        destroy: impl FnOnce(H),
    ) -> Result<H, E> {
        if let Some(h) = *held {
            if self.valid(&key, Some(h)) {
                return Ok(h);
            }
        }
        self.release(held, destroy);

        if let Some(entry) = self.entries.get_mut(&key) {
            entry.count += 1;
            self.hits += 1;
            tracing::trace!(repo = self.name, ?key, count = entry.count, "shared resource reused");
            *held = Some(entry.handle);
            return Ok(entry.handle);
        }

        let handle = create(&key)?;
        self.misses += 1;
        tracing::debug!(repo = self.name, ?key, ?handle, "shared resource created");
        self.keys.insert(handle, key.clone());
        self.entries.insert(key, Entry { handle, count: 1 });
        *held = Some(handle);
        Ok(handle)
    }

    /// Drop the reference in `held`. Destroys the resource on last release.
    pub fn release(&mut self, held: &mut Option<H>, destroy: impl FnOnce(H)) {
        let Some(handle) = held.take() else {
            return;
        };
        let Some(key) = self.keys.get(&handle).cloned() else {
            tracing::warn!(repo = self.name, ?handle, "release of untracked resource ignored");
            return;
        };
        let remove = match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.count = entry.count.saturating_sub(1);
                entry.count == 0
            }
            None => true,
        };
        if remove {
            self.entries.remove(&key);
            self.keys.remove(&handle);
            self.destroyed += 1;
            tracing::debug!(repo = self.name, ?key, ?handle, "shared resource destroyed");
            destroy(handle);
        }
    }

    /// Number of distinct live resources
    pub fn active_count(&self) -> usize {
        self.entries.len()
    }

    pub fn ref_count(&self, key: &K) -> usize {
        self.entries.get(key).map_or(0, |e| e.count)
    }

    pub fn key_of(&self, handle: H) -> Option<&K> {
        self.keys.get(&handle)
    }

    /// Destroy everything regardless of outstanding references.
    pub fn clear(&mut self, mut destroy: impl FnMut(H)) {
        for (_, entry) in self.entries.drain() {
            self.destroyed += 1;
            destroy(entry.handle);
        }
        self.keys.clear();
    }

    pub fn stats(&self) -> RepositoryStats {
        RepositoryStats {
            hits: self.hits,
            misses: self.misses,
            destroyed: self.destroyed,
            active: self.entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Repo = SharedRepository<&'static str, u32>;

    fn create(next: &mut u32) -> impl FnOnce(&&'static str) -> Result<u32, ()> + '_ {
        move |_| {
            *next += 1;
            Ok(*next)
        }
    }

    #[test]
    fn test_n_gets_then_n_releases_empties_repository() {
        let mut repo = Repo::new("test");
        let mut next = 0;
        let mut destroyed = Vec::new();
        let mut holders = vec![None; 5];

        for held in holders.iter_mut() {
            repo.get("a", held, create(&mut next), |_| {}).unwrap();
        }
        assert_eq!(repo.active_count(), 1);
        assert_eq!(repo.ref_count(&"a"), 5);

        for held in holders.iter_mut().take(4) {
            repo.release(held, |h| destroyed.push(h));
        }
        assert_eq!(repo.active_count(), 1);
        assert!(destroyed.is_empty());

        repo.release(&mut holders[4], |h| destroyed.push(h));
        assert_eq!(repo.active_count(), 0);
        assert_eq!(destroyed, vec![1]);
        assert_eq!(next, 1);
    }

    #[test]
    fn test_get_with_new_key_releases_previous() {
        let mut repo = Repo::new("test");
        let mut next = 0;
        let mut destroyed = Vec::new();
        let mut held = None;

        repo.get("a", &mut held, create(&mut next), |_| {}).unwrap();
        repo.get("b", &mut held, create(&mut next), |h| destroyed.push(h))
            .unwrap();

        assert_eq!(held, Some(2));
        assert_eq!(destroyed, vec![1]);
        assert_eq!(repo.active_count(), 1);
    }

    #[test]
    fn test_get_is_idempotent_for_valid_holder() {
        let mut repo = Repo::new("test");
        let mut next = 0;
        let mut held = None;
        repo.get("a", &mut held, create(&mut next), |_| {}).unwrap();
        repo.get("a", &mut held, create(&mut next), |_| {}).unwrap();
        assert_eq!(repo.ref_count(&"a"), 1);
        assert_eq!(repo.stats().misses, 1);
    }

    #[test]
    fn test_failed_create_leaves_holder_empty() {
        let mut repo = Repo::new("test");
        let mut held = None;
        let result = repo.get("a", &mut held, |_| Err::<u32, _>("boom"), |_| {});
        assert_eq!(result, Err("boom"));
        assert_eq!(held, None);
        assert_eq!(repo.active_count(), 0);
    }
}
