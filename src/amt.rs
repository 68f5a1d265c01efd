// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use itertools::sorted;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::node::Link;
use crate::root::{Root, RootRecord};
use crate::store::CborBlockstoreExt as _;
use crate::{Config, Error, MAX_INDEX, Node, ValueMut, init_sized_vec, nodes_for_height};

/// Array Mapped Trie allows for the insertion and persistence of data, serializable to a CID.
///
/// Amt is not thread-safe and can't be shared between threads.
///
/// Usage:
/// ```
/// use ipld_amt::Amt;
///
/// let db = fvm_ipld_blockstore::MemoryBlockstore::default();
/// let mut amt = Amt::new(&db);
///
/// // Insert or remove any serializable values
/// amt.set(2, "foo".to_owned()).unwrap();
/// amt.set(1, "bar".to_owned()).unwrap();
/// amt.delete(2).unwrap();
/// assert_eq!(amt.count(), 1);
/// let bar: &String = amt.get(1).unwrap().unwrap();
///
/// // Generate cid by calling flush to remove cache
/// let cid = amt.flush().unwrap();
/// ```
#[derive(Debug)]
pub struct Amt<V, BS> {
    pub(crate) root: Root<V>,
    pub(crate) block_store: BS,
    /// Remember the last flushed CID until it changes.
    flushed_cid: Option<Cid>,
}

impl<V: PartialEq, BS: Blockstore> PartialEq for Amt<V, BS> {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root
    }
}

impl<V, BS> Amt<V, BS> {
    /// Constructor for Root AMT node
    pub fn new(block_store: BS) -> Self {
        Self {
            root: Root::new(Config::default().bit_width),
            block_store,
            flushed_cid: None,
        }
    }

    /// Construct new Amt with the given config
    pub fn new_with_config(block_store: BS, config: Config) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            root: Root::new(config.bit_width),
            block_store,
            flushed_cid: None,
        })
    }

    /// Construct new Amt with given bit width
    pub fn new_with_bit_width(block_store: BS, bit_width: u32) -> Result<Self, Error> {
        Self::new_with_config(block_store, Config::with_bit_width(bit_width))
    }

    /// Gets the bit width of the `Amt`.
    pub fn bit_width(&self) -> u32 {
        self.root.bit_width
    }

    /// Gets the height of the `Amt`.
    pub fn height(&self) -> u32 {
        self.root.height
    }

    /// Gets count of elements added in the `Amt`.
    pub fn count(&self) -> u64 {
        self.root.count
    }

    pub fn store(&self) -> &BS {
        &self.block_store
    }

    pub fn into_store(self) -> BS {
        self.block_store
    }
}

impl<V, BS> Amt<V, BS>
where
    BS: Blockstore,
    V: Serialize,
{
    /// Generates an AMT from an array of serializable objects.
    ///
    /// This can be called with an iterator of _references_ to values to avoid copying.
    pub fn new_from_iter(block_store: BS, vals: impl IntoIterator<Item = V>) -> Result<Cid, Error> {
        Self::new_from_iter_with_config(block_store, Config::default(), vals)
    }

    /// Generates an AMT with the requested config from an array of serializable objects.
    pub fn new_from_iter_with_config(
        block_store: BS,
        config: Config,
        vals: impl IntoIterator<Item = V>,
    ) -> Result<Cid, Error> {
        // Values written from an iterator are never read back, but the node operations need a
        // deserializable value type.
        #[derive(Serialize)]
        #[serde(transparent)]
        struct WriteOnly<V>(V);

        impl<'de, V> Deserialize<'de> for WriteOnly<V> {
            fn deserialize<D>(_: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                use serde::de::Error;
                Err(D::Error::custom(
                    "can't deserialize when constructing an AMT from an iterator",
                ))
            }
        }

        let mut t = Amt::new_with_config(block_store, config)?;
        t.batch_set(vals.into_iter().map(WriteOnly))?;
        t.flush()
    }
}

impl<V, BS> Amt<V, BS>
where
    V: DeserializeOwned + Serialize,
    BS: Blockstore,
{
    /// Constructs an AMT with a block store and a Cid of the root of the AMT
    pub fn load(cid: &Cid, block_store: BS) -> Result<Self, Error> {
        Self::load_with_config(cid, block_store, Config::default())
    }

    /// Constructs an AMT from a root Cid, checking the stored bit width against `config`.
    pub fn load_with_config(cid: &Cid, block_store: BS, config: Config) -> Result<Self, Error> {
        config.validate()?;
        let record: RootRecord<V> = block_store.get_cbor_required(cid)?;
        let root = Root::from_record(record, &config)?;
        tracing::debug!(%cid, height = root.height, count = root.count, "loaded amt");

        Ok(Self {
            root,
            block_store,
            flushed_cid: Some(*cid),
        })
    }

    /// Get value at index of AMT
    pub fn get(&self, i: u64) -> Result<Option<&V>, Error> {
        if i > MAX_INDEX {
            return Err(Error::OutOfRange(i));
        }

        if i >= nodes_for_height(self.bit_width(), self.height() + 1) {
            return Ok(None);
        }

        self.root
            .node
            .get(&self.block_store, self.height(), self.bit_width(), i)
    }

    /// Set value at index, returning the value that was replaced.
    pub fn set(&mut self, i: u64, val: V) -> Result<Option<V>, Error> {
        if i > MAX_INDEX {
            return Err(Error::OutOfRange(i));
        }

        while i >= nodes_for_height(self.bit_width(), self.height() + 1) {
            if self.root.node.is_empty() {
                // Nothing to push down, intermediate nodes are created by the insertion.
                self.root.node = Node::empty(self.bit_width(), self.height() + 1);
            } else {
                let mut new_links: Vec<Option<Link<V>>> = init_sized_vec(self.bit_width());
                let node = std::mem::replace(&mut self.root.node, Node::Leaf { vals: Vec::new() });
                new_links[0] = Some(Link::Dirty(Box::new(node)));
                self.root.node = Node::Link { links: new_links };
            }
            self.root.height += 1;
            tracing::trace!(index = i, height = self.height(), "grew amt");
        }

        let prev = self
            .root
            .node
            .set(&self.block_store, self.height(), self.bit_width(), i, val)?;

        // There's no equality constraint on `V` so we could check if the content changed.
        self.flushed_cid = None;

        if prev.is_none() {
            if self.root.count >= MAX_INDEX - 1 {
                tracing::warn!(count = self.root.count, "amt count overflow on insert");
                return Err(Error::InvalidCount);
            }
            self.root.count += 1;
        }

        Ok(prev)
    }

    /// Sets the values at indices `0..n`.
    pub fn batch_set(&mut self, vals: impl IntoIterator<Item = V>) -> Result<(), Error> {
        for (i, val) in (0u64..).zip(vals) {
            self.set(i, val)?;
        }

        Ok(())
    }

    /// Delete item from AMT at index, returning it if it was present.
    pub fn delete(&mut self, i: u64) -> Result<Option<V>, Error> {
        if i > MAX_INDEX {
            return Err(Error::OutOfRange(i));
        }

        if i >= nodes_for_height(self.bit_width(), self.height() + 1) {
            // Index was out of range of current AMT
            return Ok(None);
        }

        let deleted =
            self.root
                .node
                .delete(&self.block_store, self.height(), self.bit_width(), i)?;

        if deleted.is_none() {
            return Ok(None);
        }
        self.flushed_cid = None;

        // Move a lone left-most child up into the root for as long as possible. An emptied root
        // becomes an empty leaf at height 0.
        self.root.height =
            self.root
                .node
                .collapse(&self.block_store, self.bit_width(), self.height())?;

        if self.root.count == 0 {
            tracing::warn!(index = i, "deleted a value from an amt with a count of 0");
            return Err(Error::InvalidCount);
        }
        self.root.count -= 1;

        Ok(deleted)
    }

    /// Deletes multiple items from AMT
    /// If `strict` is true, all indices are expected to be present, and this will
    /// return an error if one is not found.
    ///
    /// Returns true if items were deleted.
    pub fn batch_delete(
        &mut self,
        iter: impl IntoIterator<Item = u64>,
        strict: bool,
    ) -> Result<bool, Error> {
        let mut modified = false;

        // Sorted deletes collapse the tree at most once per level.
        for i in sorted(iter) {
            let found = self.delete(i)?.is_some();
            if strict && !found {
                return Err(Error::NoSuchIndex(i));
            }
            modified |= found;
        }
        Ok(modified)
    }

    /// flush root and return Cid used as key in block store
    pub fn flush(&mut self) -> Result<Cid, Error> {
        if let Some(cid) = self.flushed_cid {
            return Ok(cid);
        }
        self.root.node.flush(&self.block_store, self.bit_width())?;
        let cid = self.block_store.put_cbor_blake2b256(&self.root.record()?)?;
        tracing::debug!(%cid, height = self.height(), count = self.count(), "flushed amt");
        self.flushed_cid = Some(cid);
        Ok(cid)
    }

    /// Lowest index with a value set. Fails with [`Error::NoValues`] on an empty AMT.
    pub fn first_set_index(&self) -> Result<u64, Error> {
        self.root
            .node
            .first_set_index(&self.block_store, self.height(), self.bit_width())
    }

    /// Iterates over each value in the Amt and runs a function on the values.
    ///
    /// The index in the amt is a `u64` and the value is the generic parameter `V` as defined
    /// in the Amt.
    #[inline]
    pub fn for_each<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnMut(u64, &V) -> anyhow::Result<()>,
    {
        self.for_each_at(0, f)
    }

    /// Iterates over the values with an index of at least `start`. Sub-trees that lie entirely
    /// below `start` are not loaded.
    pub fn for_each_at<F>(&self, start: u64, mut f: F) -> Result<(), Error>
    where
        F: FnMut(u64, &V) -> anyhow::Result<()>,
    {
        self.for_each_while_at(start, |i, x| {
            f(i, x)?;
            Ok(true)
        })
    }

    /// Iterates over each value in the Amt and runs a function on the values, for as long as that
    /// function keeps returning `true`.
    pub fn for_each_while<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnMut(u64, &V) -> anyhow::Result<bool>,
    {
        self.for_each_while_at(0, f)
    }

    fn for_each_while_at<F>(&self, start: u64, mut f: F) -> Result<(), Error>
    where
        F: FnMut(u64, &V) -> anyhow::Result<bool>,
    {
        self.root
            .node
            .for_each_while(
                &self.block_store,
                self.height(),
                self.bit_width(),
                start,
                0,
                &mut f,
            )
            .map(|_| ())
    }

    /// Iterates over values in the Amt and runs a function on the values.
    ///
    /// The index in the amt is a `u64` and the value is the generic parameter `V` as defined
    /// in the Amt. If `start_at` is provided traversal begins at the first index `>= start_at`,
    /// otherwise it begins from the first element. If `limit` is provided, traversal will stop
    /// after `limit` elements have been traversed. Returns a tuple describing the number of
    /// elements iterated over and optionally the index of the next element in the AMT if more
    /// elements remain.
    pub fn for_each_ranged<F>(
        &self,
        start_at: Option<u64>,
        limit: Option<u64>,
        mut f: F,
    ) -> Result<(u64, Option<u64>), Error>
    where
        F: FnMut(u64, &V) -> anyhow::Result<()>,
    {
        self.for_each_while_ranged(start_at, limit, |i, v| {
            f(i, v)?;
            Ok(true)
        })
    }

    /// Same as [`Amt::for_each_ranged`], but also stops once `f` returns `false`. The element
    /// that stopped the traversal counts as traversed.
    pub fn for_each_while_ranged<F>(
        &self,
        start_at: Option<u64>,
        limit: Option<u64>,
        mut f: F,
    ) -> Result<(u64, Option<u64>), Error>
    where
        F: FnMut(u64, &V) -> anyhow::Result<bool>,
    {
        let mut traversed = 0u64;
        let mut stopped = false;
        let mut next_index = None;
        self.for_each_while_at(start_at.unwrap_or(0), |i, v| {
            // Walk one element past the last visited one to report where to resume.
            if stopped || limit.is_some_and(|limit| traversed >= limit) {
                next_index = Some(i);
                return Ok(false);
            }
            traversed += 1;
            stopped = !f(i, v)?;
            Ok(true)
        })?;
        Ok((traversed, next_index))
    }

    /// Iterates over each value in the Amt and runs a function on the values that allows modifying
    /// each value.
    pub fn for_each_mut<F>(&mut self, mut f: F) -> Result<(), Error>
    where
        F: FnMut(u64, &mut ValueMut<'_, V>) -> anyhow::Result<()>,
    {
        self.for_each_while_mut(|i, x| {
            f(i, x)?;
            Ok(true)
        })
    }

    /// Iterates over each value in the Amt and runs a function on the values that allows modifying
    /// each value, for as long as that function keeps returning `true`.
    ///
    /// Only nodes holding values that were accessed mutably are marked dirty.
    pub fn for_each_while_mut<F>(&mut self, mut f: F) -> Result<(), Error>
    where
        F: FnMut(u64, &mut ValueMut<'_, V>) -> anyhow::Result<bool>,
    {
        let mut did_mutate = false;
        let res = self.root.node.for_each_while_mut(
            &self.block_store,
            self.height(),
            self.bit_width(),
            0,
            &mut f,
            &mut did_mutate,
        );

        // Values changed before a failure stay changed.
        if did_mutate {
            self.flushed_cid = None;
        }

        res.map(|_| ())
    }
}
