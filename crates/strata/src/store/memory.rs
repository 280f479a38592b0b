use bytes::Bytes;
use core::ops::Bound;
use parking_lot::RwLock;
use portable_atomic::{AtomicU8, Ordering};
use std::collections::{BTreeMap, HashMap};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    error::{Error, Result},
    store::{
        Entry, EntryList, KeyColumnValueStore, KeySliceQuery, SliceQuery, StoreFeatures,
        StoreTransaction,
    },
};

type Row = BTreeMap<Bytes, Entry>;

/// A thread-safe, process-local [`KeyColumnValueStore`].
///
/// Nothing is persisted. Mutations are visible as soon as `mutate` returns;
/// transactions only track whether they are still open.
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use strata::{Entry, InMemoryStore, KeyColumnValueStore, KeySliceQuery, SliceQuery};
///
/// let store = InMemoryStore::new("edges");
/// let tx = store.begin_transaction()?;
/// let key = Bytes::from_static(b"v1");
/// store.mutate(&key, &[Entry::new("name", "marko")], &[], &tx)?;
///
/// let row = store.get_slice(&KeySliceQuery::new(key, SliceQuery::all()), &tx)?;
/// assert_eq!(row.len(), 1);
/// # Ok::<(), strata::Error>(())
/// ```
#[derive(Debug)]
pub struct InMemoryStore {
    name: String,
    features: StoreFeatures,
    rows: RwLock<BTreeMap<Bytes, Row>>,
}

impl InMemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            features: StoreFeatures { multi_query: true },
            rows: RwLock::new(BTreeMap::new()),
        }
    }

    /// Overrides whether the store advertises multi-key reads.
    #[must_use]
    pub fn with_multi_query(mut self, multi_query: bool) -> Self {
        self.features.multi_query = multi_query;
        self
    }

    /// Number of non-empty rows.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    pub fn clear(&self) {
        self.rows.write().clear();
    }

    fn read_row(row: Option<&Row>, slice: &SliceQuery) -> EntryList {
        let Some(row) = row else {
            return EntryList::default();
        };
        let upper = slice.end().map_or(Bound::Unbounded, Bound::Excluded);
        let range = row
            .range::<Bytes, _>((Bound::Included(slice.start()), upper))
            .map(|(_, entry)| entry.clone());
        match slice.limit() {
            Some(limit) => range.take(limit).collect(),
            None => range.collect(),
        }
    }
}

impl KeyColumnValueStore for InMemoryStore {
    type Tx = InMemoryTransaction;

    fn name(&self) -> &str {
        &self.name
    }

    fn features(&self) -> StoreFeatures {
        self.features
    }

    fn begin_transaction(&self) -> Result<Self::Tx> {
        Ok(InMemoryTransaction::default())
    }

    fn get_slice(&self, query: &KeySliceQuery, tx: &Self::Tx) -> Result<EntryList> {
        tx.ensure_open()?;
        if let Some(end) = query.slice().end() {
            if end <= query.slice().start() {
                return Ok(EntryList::default());
            }
        }
        Ok(Self::read_row(self.rows.read().get(query.key()), query.slice()))
    }

    fn get_multi_slice(
        &self,
        keys: &[Bytes],
        slice: &SliceQuery,
        tx: &Self::Tx,
    ) -> Result<HashMap<Bytes, EntryList>> {
        tx.ensure_open()?;
        let empty = slice.end().is_some_and(|end| end <= slice.start());
        let rows = self.rows.read();
        Ok(keys
            .iter()
            .map(|key| {
                let list = if empty {
                    EntryList::default()
                } else {
                    Self::read_row(rows.get(key), slice)
                };
                (key.clone(), list)
            })
            .collect())
    }

    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip_all, fields(store = %self.name, additions = additions.len(), deletions = deletions.len())))]
    fn mutate(
        &self,
        key: &Bytes,
        additions: &[Entry],
        deletions: &[Bytes],
        tx: &Self::Tx,
    ) -> Result<()> {
        tx.ensure_open()?;
        additions.iter().try_for_each(Entry::validate)?;

        let mut rows = self.rows.write();
        let row = rows.entry(key.clone()).or_default();
        for column in deletions {
            row.remove(column);
        }
        for entry in additions {
            row.insert(entry.column().clone(), entry.clone());
        }
        if row.is_empty() {
            rows.remove(key);
        }
        Ok(())
    }
}

const OPEN: u8 = 0;
const COMMITTED: u8 = 1;
const ROLLED_BACK: u8 = 2;

/// Transaction handle of an [`InMemoryStore`].
#[derive(Debug, Default)]
pub struct InMemoryTransaction {
    state: AtomicU8,
}

impl InMemoryTransaction {
    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == OPEN
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state.load(Ordering::Acquire) {
            OPEN => Ok(()),
            COMMITTED => Err(Error::invariant("transaction already committed")),
            _ => Err(Error::invariant("transaction already rolled back")),
        }
    }

    fn finish(&self, to: u8) -> Result<()> {
        self.state
            .compare_exchange(OPEN, to, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .or_else(|_| self.ensure_open())
    }
}

impl StoreTransaction for InMemoryTransaction {
    fn commit(&self) -> Result<()> {
        self.finish(COMMITTED)
    }

    fn rollback(&self) -> Result<()> {
        self.finish(ROLLED_BACK)
    }
}
