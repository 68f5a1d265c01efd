// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cell::OnceCell;

use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::{DAG_CBOR, strict_bytes};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::bitmap::{self, BitMap};
use crate::error::Corruption;
use crate::store::CborBlockstoreExt as _;
use crate::value_mut::ValueMut;
use crate::{Error, init_sized_vec, nodes_for_height};

/// This represents a link to another Node
#[derive(Debug)]
pub(crate) enum Link<V> {
    /// Unchanged link to data with a lazily filled cache.
    Cid { cid: Cid, cache: OnceCell<Box<Node<V>>> },
    /// Modifications have been made to the link, requires flush to clear
    Dirty(Box<Node<V>>),
}

impl<V: PartialEq> PartialEq for Link<V> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Link::Cid { cid: a, .. }, Link::Cid { cid: b, .. }) => a == b,
            (Link::Dirty(a), Link::Dirty(b)) => a == b,
            _ => false,
        }
    }
}

impl<V> From<Cid> for Link<V> {
    fn from(cid: Cid) -> Link<V> {
        Link::Cid {
            cid,
            cache: Default::default(),
        }
    }
}

/// Node represents either a shard of values in the form of bytes or links to other nodes
#[derive(PartialEq, Debug)]
pub(crate) enum Node<V> {
    /// Node is a link node, contains array of Cid or cached sub nodes.
    Link { links: Vec<Option<Link<V>>> },
    /// Leaf node, this array contains only values.
    Leaf { vals: Vec<Option<V>> },
}

/// Serialized form of a node: `[bitmap, links, values]`, with the links and values arrays
/// compacted to the slots marked in the bitmap.
#[derive(Deserialize)]
pub(crate) struct CollapsedNode<V>(
    #[serde(with = "strict_bytes")] Vec<u8>,
    Vec<Cid>,
    Vec<V>,
);

/// Borrowing counterpart of [`CollapsedNode`] used when writing a node.
#[derive(Serialize)]
pub(crate) struct CollapsedNodeRef<'a, V>(
    #[serde(with = "strict_bytes")] Vec<u8>,
    Vec<Cid>,
    Vec<&'a V>,
);

impl<V> CollapsedNode<V> {
    /// Expands the compacted arrays into a slot addressed [`Node`], checking every structural
    /// invariant of the encoding on the way.
    ///
    /// `allow_empty` is only set for the root of an empty AMT, `expect_leaf` for nodes at height
    /// zero.
    pub(crate) fn expand(
        self,
        bit_width: u32,
        allow_empty: bool,
        expect_leaf: bool,
    ) -> Result<Node<V>, Corruption> {
        let CollapsedNode(bmap, links, values) = self;
        if !links.is_empty() && !values.is_empty() {
            return Err(Corruption::MixedNode);
        }
        let bmap = BitMap::from_bytes(bmap, bit_width)?;

        if !values.is_empty() {
            if !expect_leaf {
                return Err(Corruption::LeafUnexpected);
            }
            return Ok(Node::Leaf {
                vals: bitmap::expand(&bmap, bit_width, values)?,
            });
        }

        if !links.is_empty() {
            if expect_leaf {
                return Err(Corruption::LeafExpected);
            }
            if let Some(cid) = links.iter().find(|cid| cid.codec() != DAG_CBOR) {
                return Err(Corruption::InvalidLinkCodec(cid.codec()));
            }
            return Ok(Node::Link {
                links: bitmap::expand(&bmap, bit_width, links.into_iter().map(Link::from).collect())?,
            });
        }

        if !allow_empty {
            return Err(Corruption::EmptyNode);
        }
        // An empty root must not claim any entries either.
        Ok(Node::Leaf {
            vals: bitmap::expand(&bmap, bit_width, Vec::new())?,
        })
    }
}

/// Height of the children of a node at `height`. Only link nodes have children, so a link node
/// found at height zero is malformed.
pub(crate) fn child_height(height: u32) -> Result<u32, Error> {
    height
        .checked_sub(1)
        .ok_or_else(|| Corruption::LeafExpected.into())
}

/// Index of the left-most element below slot `slot` of a node whose children each address
/// `sub_count` elements.
pub(crate) fn slot_offset(offset: u64, slot: usize, sub_count: u64) -> Result<u64, Error> {
    (slot as u64)
        .checked_mul(sub_count)
        .and_then(|o| o.checked_add(offset))
        .ok_or_else(|| Corruption::IndexOverflow.into())
}

fn load_node<V, BS>(bs: &BS, cid: &Cid, bit_width: u32, height: u32) -> Result<Node<V>, Error>
where
    V: DeserializeOwned,
    BS: Blockstore,
{
    let collapsed: CollapsedNode<V> = bs.get_cbor_required(cid)?;
    Ok(collapsed.expand(bit_width, false, height == 0)?)
}

impl<V> Link<V> {
    /// Returns the node behind this link, loading and caching it from the store if needed.
    pub(crate) fn load<BS>(&self, bs: &BS, bit_width: u32, height: u32) -> Result<&Node<V>, Error>
    where
        V: DeserializeOwned,
        BS: Blockstore,
    {
        match self {
            Link::Dirty(node) => Ok(&**node),
            Link::Cid { cid, cache } => {
                if let Some(node) = cache.get() {
                    return Ok(&**node);
                }
                let node = load_node(bs, cid, bit_width, height)?;
                Ok(&**cache.get_or_init(|| Box::new(node)))
            }
        }
    }

    /// Returns the node behind this link for modification, marking the link dirty.
    fn load_mut<BS>(&mut self, bs: &BS, bit_width: u32, height: u32) -> Result<&mut Node<V>, Error>
    where
        V: DeserializeOwned,
        BS: Blockstore,
    {
        if let Link::Cid { cid, cache } = self {
            let node = match cache.take() {
                Some(node) => node,
                None => Box::new(load_node(bs, cid, bit_width, height)?),
            };
            *self = Link::Dirty(node);
        }
        match self {
            Link::Dirty(node) => Ok(&mut **node),
            Link::Cid { .. } => unreachable!("link was marked dirty above"),
        }
    }

    /// Detaches the node behind this link, loading it from the store if needed.
    fn into_node<BS>(self, bs: &BS, bit_width: u32, height: u32) -> Result<Box<Node<V>>, Error>
    where
        V: DeserializeOwned,
        BS: Blockstore,
    {
        match self {
            Link::Dirty(node) => Ok(node),
            Link::Cid { cid, cache } => match cache.into_inner() {
                Some(node) => Ok(node),
                None => Ok(Box::new(load_node(bs, &cid, bit_width, height)?)),
            },
        }
    }
}

impl<V> Node<V> {
    /// Empty node of the kind expected at `height`.
    pub(crate) fn empty(bit_width: u32, height: u32) -> Self {
        if height == 0 {
            Node::Leaf {
                vals: init_sized_vec(bit_width),
            }
        } else {
            Node::Link {
                links: init_sized_vec(bit_width),
            }
        }
    }

    /// Check if node is empty.
    pub(crate) fn is_empty(&self) -> bool {
        match self {
            Node::Link { links } => links.iter().all(Option::is_none),
            Node::Leaf { vals } => vals.iter().all(Option::is_none),
        }
    }

    /// Borrowing serialized form of the node. Fails if a child link has not been flushed yet.
    pub(crate) fn collapsed(&self, bit_width: u32) -> Result<CollapsedNodeRef<'_, V>, Error> {
        match self {
            Node::Leaf { vals } => {
                let (bmap, values) = bitmap::compact(bit_width, vals.iter().map(Option::as_ref));
                Ok(CollapsedNodeRef(bmap.into_bytes(), Vec::new(), values))
            }
            Node::Link { links } => {
                let (bmap, links) = bitmap::compact(bit_width, links.iter().map(Option::as_ref));
                let cids = links
                    .into_iter()
                    .map(|link| match link {
                        Link::Cid { cid, .. } => Ok(*cid),
                        Link::Dirty(_) => Err(Corruption::UnflushedLink),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(CollapsedNodeRef(bmap.into_bytes(), cids, Vec::new()))
            }
        }
    }
}

impl<V> Node<V>
where
    V: Serialize + DeserializeOwned,
{
    /// Flushes cache for node, replacing any cached values with a Cid variant
    pub(crate) fn flush<BS: Blockstore>(&mut self, bs: &BS, bit_width: u32) -> Result<(), Error> {
        if let Node::Link { links } = self {
            for link in links.iter_mut().flatten() {
                if let Link::Dirty(node) = link {
                    // Children are persisted before their parent embeds their Cid.
                    node.flush(bs, bit_width)?;
                    let cid = bs.put_cbor_blake2b256(&node.collapsed(bit_width)?)?;

                    // Keep the flushed node around, it is unchanged from what is in the store.
                    let node = std::mem::replace(node, Box::new(Node::Leaf { vals: Vec::new() }));
                    *link = Link::Cid {
                        cid,
                        cache: OnceCell::from(node),
                    };
                }
            }
        }
        Ok(())
    }

    /// Gets value at given index of AMT given height
    pub(crate) fn get<BS: Blockstore>(
        &self,
        bs: &BS,
        height: u32,
        bit_width: u32,
        i: u64,
    ) -> Result<Option<&V>, Error> {
        match self {
            Node::Leaf { vals } => Ok(vals.get(i as usize).and_then(Option::as_ref)),
            Node::Link { links } => {
                let sub_height = child_height(height)?;
                let nfh = nodes_for_height(bit_width, height);
                match &links[(i / nfh) as usize] {
                    Some(link) => link
                        .load(bs, bit_width, sub_height)?
                        .get(bs, sub_height, bit_width, i % nfh),
                    None => Ok(None),
                }
            }
        }
    }

    /// Set value in node, returning the value it replaced, if any.
    ///
    /// Missing intermediate nodes are created on the way down.
    pub(crate) fn set<BS: Blockstore>(
        &mut self,
        bs: &BS,
        height: u32,
        bit_width: u32,
        i: u64,
        val: V,
    ) -> Result<Option<V>, Error> {
        match self {
            Node::Leaf { vals } => {
                let slot = vals
                    .get_mut(i as usize)
                    .ok_or(Corruption::LeafUnexpected)?;
                Ok(slot.replace(val))
            }
            Node::Link { links } => {
                let sub_height = child_height(height)?;
                let nfh = nodes_for_height(bit_width, height);
                let link = links[(i / nfh) as usize]
                    .get_or_insert_with(|| Link::Dirty(Box::new(Node::empty(bit_width, sub_height))));
                link.load_mut(bs, bit_width, sub_height)?
                    .set(bs, sub_height, bit_width, i % nfh, val)
            }
        }
    }

    /// Delete value in AMT by index, returning the removed value.
    ///
    /// Children left empty by the removal are unlinked, which can cascade up to the caller.
    pub(crate) fn delete<BS: Blockstore>(
        &mut self,
        bs: &BS,
        height: u32,
        bit_width: u32,
        i: u64,
    ) -> Result<Option<V>, Error> {
        match self {
            Node::Leaf { vals } => Ok(vals.get_mut(i as usize).and_then(Option::take)),
            Node::Link { links } => {
                let sub_height = child_height(height)?;
                let nfh = nodes_for_height(bit_width, height);
                let sub_i = (i / nfh) as usize;
                let Some(link) = &mut links[sub_i] else {
                    return Ok(None);
                };

                let (deleted, sub_empty) = match link {
                    Link::Dirty(node) => {
                        let deleted = node.delete(bs, sub_height, bit_width, i % nfh)?;
                        (deleted, node.is_empty())
                    }
                    Link::Cid { cid, cache } => {
                        let mut node = match cache.take() {
                            Some(node) => node,
                            None => Box::new(load_node(bs, cid, bit_width, sub_height)?),
                        };
                        let deleted = node.delete(bs, sub_height, bit_width, i % nfh)?;
                        if deleted.is_none() {
                            // Nothing changed below, the link stays clean.
                            let _ = cache.set(node);
                            return Ok(None);
                        }
                        let sub_empty = node.is_empty();
                        *link = Link::Dirty(node);
                        (deleted, sub_empty)
                    }
                };

                if deleted.is_some() && sub_empty {
                    links[sub_i] = None;
                }
                Ok(deleted)
            }
        }
    }

    /// Replaces this node by its only, left-most child for as long as that shape holds, and
    /// returns the resulting height.
    ///
    /// A link node without any children collapses into an empty leaf at height zero.
    pub(crate) fn collapse<BS: Blockstore>(
        &mut self,
        bs: &BS,
        bit_width: u32,
        height: u32,
    ) -> Result<u32, Error> {
        let Node::Link { links } = self else {
            return Ok(height);
        };
        if links.iter().skip(1).any(Option::is_some) {
            return Ok(height);
        }
        let Some(link) = links.first() else {
            return Ok(height);
        };
        let Some(link) = link else {
            tracing::trace!(height, "amt emptied, resetting to height 0");
            *self = Node::empty(bit_width, 0);
            return Ok(0);
        };

        let sub_height = child_height(height)?;
        // Load the only child while it is still linked, so a failed load leaves the node intact.
        link.load(bs, bit_width, sub_height)?;
        let Some(link) = links[0].take() else {
            unreachable!("left-most link checked above");
        };
        let mut sub_node = link.into_node(bs, bit_width, sub_height)?;
        let new_height = match sub_node.collapse(bs, bit_width, sub_height) {
            Ok(h) => h,
            Err(e) => {
                links[0] = Some(Link::Dirty(sub_node));
                return Err(e);
            }
        };
        tracing::trace!(from = height, to = new_height, "collapsed amt root");
        *self = *sub_node;
        Ok(new_height)
    }

    /// Iterates the values under this node in index order, starting at `start`, until `f`
    /// returns `false`. Returns whether iteration should continue.
    ///
    /// `offset` is the index of the left-most element this node can address.
    pub(crate) fn for_each_while<BS, F>(
        &self,
        bs: &BS,
        height: u32,
        bit_width: u32,
        start: u64,
        offset: u64,
        f: &mut F,
    ) -> Result<bool, Error>
    where
        BS: Blockstore,
        F: FnMut(u64, &V) -> anyhow::Result<bool>,
    {
        match self {
            Node::Leaf { vals } => {
                for (i, v) in vals.iter().enumerate() {
                    let Some(v) = v else { continue };
                    let ix = offset + i as u64;
                    if ix < start {
                        continue;
                    }
                    if !f(ix, v)? {
                        return Ok(false);
                    }
                }
            }
            Node::Link { links } => {
                let sub_height = child_height(height)?;
                let sub_count = nodes_for_height(bit_width, height);
                for (i, link) in links.iter().enumerate() {
                    let Some(link) = link else { continue };
                    let offs = slot_offset(offset, i, sub_count)?;
                    // Skip sub-trees that end before `start`. If the end overflows this is the
                    // last sub-tree of the index space and must be visited.
                    if offs
                        .checked_add(sub_count)
                        .is_some_and(|next_offs| start >= next_offs)
                    {
                        continue;
                    }
                    let keep_going = link.load(bs, bit_width, sub_height)?.for_each_while(
                        bs, sub_height, bit_width, start, offs, f,
                    )?;
                    if !keep_going {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Mutable variant of [`Node::for_each_while`]. Returns whether iteration should continue.
    ///
    /// `mutated` is raised as soon as any value changes, also when `f` or a store read fails
    /// later on. Only nodes holding changed values are marked dirty.
    pub(crate) fn for_each_while_mut<BS, F>(
        &mut self,
        bs: &BS,
        height: u32,
        bit_width: u32,
        offset: u64,
        f: &mut F,
        mutated: &mut bool,
    ) -> Result<bool, Error>
    where
        BS: Blockstore,
        F: FnMut(u64, &mut ValueMut<'_, V>) -> anyhow::Result<bool>,
    {
        match self {
            Node::Leaf { vals } => {
                for (i, v) in vals.iter_mut().enumerate() {
                    let Some(v) = v else { continue };
                    let mut value = ValueMut::new(v);
                    let keep_going = f(offset + i as u64, &mut value);
                    *mutated |= value.value_changed();
                    if !keep_going? {
                        return Ok(false);
                    }
                }
            }
            Node::Link { links } => {
                let sub_height = child_height(height)?;
                let sub_count = nodes_for_height(bit_width, height);
                for (i, link) in links.iter_mut().enumerate() {
                    let Some(link) = link else { continue };
                    let offs = slot_offset(offset, i, sub_count)?;
                    let keep_going = match link {
                        Link::Dirty(node) => {
                            node.for_each_while_mut(bs, sub_height, bit_width, offs, f, mutated)
                        }
                        Link::Cid { cid, cache } => {
                            let mut node = match cache.take() {
                                Some(node) => node,
                                None => Box::new(load_node(bs, cid, bit_width, sub_height)?),
                            };
                            let mut sub_mutated = false;
                            let res = node.for_each_while_mut(
                                bs,
                                sub_height,
                                bit_width,
                                offs,
                                f,
                                &mut sub_mutated,
                            );
                            // The node goes back in place before any error is returned.
                            if sub_mutated {
                                *link = Link::Dirty(node);
                                *mutated = true;
                            } else {
                                let _ = cache.set(node);
                            }
                            res
                        }
                    };
                    if !keep_going? {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Lowest populated index under this node, relative to the node.
    pub(crate) fn first_set_index<BS: Blockstore>(
        &self,
        bs: &BS,
        height: u32,
        bit_width: u32,
    ) -> Result<u64, Error> {
        match self {
            Node::Leaf { vals } => vals
                .iter()
                .position(Option::is_some)
                .map(|i| i as u64)
                .ok_or(Error::NoValues),
            Node::Link { links } => {
                let sub_height = child_height(height)?;
                let Some((i, link)) = links
                    .iter()
                    .enumerate()
                    .find_map(|(i, link)| link.as_ref().map(|link| (i, link)))
                else {
                    return Err(Error::NoValues);
                };
                let ix = link
                    .load(bs, bit_width, sub_height)?
                    .first_set_index(bs, sub_height, bit_width)?;
                slot_offset(ix, i, nodes_for_height(bit_width, height))
            }
        }
    }
}
