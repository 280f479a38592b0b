use bytes::Bytes;
use std::{collections::HashMap, sync::Arc};

use crate::{
    error::Result,
    store::{Entry, EntryList, KeySliceQuery, SliceQuery},
};

/// Capabilities a [`KeyColumnValueStore`] advertises to callers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreFeatures {
    /// `get_multi_slice` is served in one round trip rather than one call per
    /// key.
    pub multi_query: bool,
}

/// A unit of work against a [`KeyColumnValueStore`].
pub trait StoreTransaction: Send + Sync {
    /// # Errors
    ///
    /// Returns a backend error if the commit fails.
    fn commit(&self) -> Result<()>;

    /// # Errors
    ///
    /// Returns a backend error if the rollback fails.
    fn rollback(&self) -> Result<()>;
}

impl<T: StoreTransaction + ?Sized> StoreTransaction for Arc<T> {
    fn commit(&self) -> Result<()> {
        (**self).commit()
    }

    fn rollback(&self) -> Result<()> {
        (**self).rollback()
    }
}

/// A store of rows, each row an ordered map from column to value.
///
/// Failures to reach the backend are reported as
/// [`Error::Backend`](crate::Error::Backend).
pub trait KeyColumnValueStore: Send + Sync {
    type Tx: StoreTransaction;

    fn name(&self) -> &str;

    fn features(&self) -> StoreFeatures;

    /// # Errors
    ///
    /// Returns a backend error if a transaction cannot be opened.
    fn begin_transaction(&self) -> Result<Self::Tx>;

    /// Reads the columns of `query.key()` selected by `query.slice()`, in
    /// column order.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the read fails.
    fn get_slice(&self, query: &KeySliceQuery, tx: &Self::Tx) -> Result<EntryList>;

    /// Reads the same slice from many rows. Every key gets an entry in the
    /// result, empty if the row does not exist.
    ///
    /// The default issues one [`Self::get_slice`] per key; stores advertising
    /// [`StoreFeatures::multi_query`] override it.
    ///
    /// # Errors
    ///
    /// Returns a backend error if any read fails.
    fn get_multi_slice(
        &self,
        keys: &[Bytes],
        slice: &SliceQuery,
        tx: &Self::Tx,
    ) -> Result<HashMap<Bytes, EntryList>> {
        keys.iter()
            .map(|key| {
                let query = KeySliceQuery::new(key.clone(), slice.clone());
                Ok((key.clone(), self.get_slice(&query, tx)?))
            })
            .collect()
    }

    /// Applies `deletions` and then `additions` to row `key`. An addition
    /// replaces any existing value of the same column.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the write fails, or an invariant violation
    /// if an addition carries invalid metadata.
    fn mutate(&self, key: &Bytes, additions: &[Entry], deletions: &[Bytes], tx: &Self::Tx)
    -> Result<()>;
}

impl<S: KeyColumnValueStore + ?Sized> KeyColumnValueStore for Arc<S> {
    type Tx = S::Tx;

    fn name(&self) -> &str {
        (**self).name()
    }

    fn features(&self) -> StoreFeatures {
        (**self).features()
    }

    fn begin_transaction(&self) -> Result<Self::Tx> {
        (**self).begin_transaction()
    }

    fn get_slice(&self, query: &KeySliceQuery, tx: &Self::Tx) -> Result<EntryList> {
        (**self).get_slice(query, tx)
    }

    fn get_multi_slice(
        &self,
        keys: &[Bytes],
        slice: &SliceQuery,
        tx: &Self::Tx,
    ) -> Result<HashMap<Bytes, EntryList>> {
        (**self).get_multi_slice(keys, slice, tx)
    }

    fn mutate(
        &self,
        key: &Bytes,
        additions: &[Entry],
        deletions: &[Bytes],
        tx: &Self::Tx,
    ) -> Result<()> {
        (**self).mutate(key, additions, deletions, tx)
    }
}
