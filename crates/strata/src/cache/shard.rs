use bytes::Bytes;
use lru::LruCache;
use std::collections::{HashMap, HashSet};

use crate::store::{EntryList, KeySliceQuery, SliceQuery};

/// Fixed bookkeeping cost charged to every cached slice on top of its bytes.
pub(crate) const ENTRY_OVERHEAD: u64 =
    (size_of::<KeySliceQuery>() + size_of::<CachedSlice>() + 4 * size_of::<usize>()) as u64;

pub(crate) fn weigh(query: &KeySliceQuery, entries: &EntryList) -> u64 {
    ENTRY_OVERHEAD + (query.byte_size() + entries.byte_size()) as u64
}

#[derive(Debug)]
pub(crate) struct CachedSlice {
    entries: EntryList,
    valid_since: u64,
    weight: u64,
}

#[derive(Debug, Default)]
struct KeyState {
    invalidated_at: Option<u64>,
    // Slices of this key currently in the LRU.
    queries: HashSet<SliceQuery>,
}

impl KeyState {
    fn is_idle(&self) -> bool {
        self.invalidated_at.is_none() && self.queries.is_empty()
    }
}

/// How a read should proceed after consulting the shard.
#[derive(Debug)]
pub(crate) enum Lookup {
    Hit(EntryList),
    /// Fetch, then offer the result back with this epoch.
    Miss { epoch: u64 },
    /// The key is inside its grace window: fetch and do not cache.
    Bypass,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Inserted {
    pub(crate) cached: bool,
    pub(crate) evicted: u64,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Purged {
    pub(crate) stale: usize,
    pub(crate) flags: usize,
}

/// One independently locked slice of the cache.
///
/// Bumping `epoch` on every invalidation lets a fetch that raced with a
/// write notice it and skip caching its possibly outdated result.
#[derive(Debug)]
pub(crate) struct Shard {
    lru: LruCache<KeySliceQuery, CachedSlice>,
    keys: HashMap<Bytes, KeyState>,
    epoch: u64,
    weight: u64,
    budget: u64,
}

impl Shard {
    pub(crate) fn new(budget: u64) -> Self {
        Self {
            lru: LruCache::unbounded(),
            keys: HashMap::new(),
            epoch: 0,
            weight: 0,
            budget,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lru.len()
    }

    pub(crate) const fn weight(&self) -> u64 {
        self.weight
    }

    pub(crate) fn lookup(&mut self, query: &KeySliceQuery, now: u64, expiration: u64, grace: u64) -> Lookup {
        if let Some(state) = self.keys.get_mut(query.key()) {
            if let Some(at) = state.invalidated_at {
                if now < at.saturating_add(grace) {
                    return Lookup::Bypass;
                }
                state.invalidated_at = None;
                if state.is_idle() {
                    self.keys.remove(query.key());
                }
            }
        }

        let stale = match self.lru.get(query) {
            Some(cached) if now.saturating_sub(cached.valid_since) < expiration => {
                return Lookup::Hit(cached.entries.clone());
            }
            Some(_) => true,
            None => false,
        };
        if stale {
            self.remove(query);
        }
        Lookup::Miss { epoch: self.epoch }
    }

    /// Caches `entries` under `query` unless an invalidation happened since
    /// `epoch` was handed out or the slice is heavier than the whole shard.
    pub(crate) fn insert(
        &mut self,
        query: KeySliceQuery,
        entries: EntryList,
        valid_since: u64,
        epoch: u64,
    ) -> Inserted {
        let weight = weigh(&query, &entries);
        if epoch != self.epoch || weight > self.budget {
            return Inserted::default();
        }

        self.remove(&query);
        let mut evicted = 0;
        while self.weight + weight > self.budget {
            let Some((old, cached)) = self.lru.pop_lru() else {
                break;
            };
            self.forget(&old, cached.weight);
            evicted += 1;
        }

        self.keys
            .entry(query.key().clone())
            .or_default()
            .queries
            .insert(query.slice().clone());
        self.weight += weight;
        self.lru.put(
            query,
            CachedSlice {
                entries,
                valid_since,
                weight,
            },
        );
        Inserted {
            cached: true,
            evicted,
        }
    }

    /// Drops every cached slice of `key` and opens its grace window.
    /// Returns the number of slices dropped.
    pub(crate) fn invalidate(&mut self, key: &Bytes, now: u64) -> usize {
        self.epoch = self.epoch.wrapping_add(1);
        let state = self.keys.entry(key.clone()).or_default();
        state.invalidated_at = Some(now);
        let queries: Vec<SliceQuery> = state.queries.drain().collect();

        let mut dropped = 0;
        for slice in queries {
            if let Some(cached) = self.lru.pop(&KeySliceQuery::new(key.clone(), slice)) {
                self.weight -= cached.weight;
                dropped += 1;
            }
        }
        dropped
    }

    /// Removes every cached slice. Pending invalidations are kept so that
    /// their grace windows still apply.
    pub(crate) fn clear(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        self.lru.clear();
        self.weight = 0;
        self.keys.retain(|_, state| {
            state.queries.clear();
            state.invalidated_at.is_some()
        });
    }

    /// Closes elapsed grace windows and drops slices older than `expiration`.
    pub(crate) fn purge(&mut self, now: u64, expiration: u64, grace: u64) -> Purged {
        let mut purged = Purged::default();
        for state in self.keys.values_mut() {
            if state
                .invalidated_at
                .is_some_and(|at| now >= at.saturating_add(grace))
            {
                state.invalidated_at = None;
                purged.flags += 1;
            }
        }

        let stale: Vec<KeySliceQuery> = self
            .lru
            .iter()
            .filter(|(_, cached)| now.saturating_sub(cached.valid_since) >= expiration)
            .map(|(query, _)| query.clone())
            .collect();
        purged.stale = stale.len();
        for query in &stale {
            self.remove(query);
        }

        self.keys.retain(|_, state| !state.is_idle());
        purged
    }

    fn remove(&mut self, query: &KeySliceQuery) {
        if let Some(cached) = self.lru.pop(query) {
            self.forget(query, cached.weight);
        }
    }

    fn forget(&mut self, query: &KeySliceQuery, weight: u64) {
        self.weight -= weight;
        if let Some(state) = self.keys.get_mut(query.key()) {
            state.queries.remove(query.slice());
            if state.is_idle() {
                self.keys.remove(query.key());
            }
        }
    }
}
