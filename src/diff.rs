// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Structural diff between two AMTs, walking both node graphs in lock-step.

use std::fmt;

use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Corruption;
use crate::node::{Link, child_height, slot_offset};
use crate::{Amt, Config, Error, Node, nodes_for_height};

/// Kind of change between two versions of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Add,
    Remove,
    Modify,
}

/// Represents a change to an AMT entry. `before` is only set for removals and modifications,
/// `after` only for additions and modifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change<V> {
    pub change_type: ChangeType,
    pub key: u64,
    pub before: Option<V>,
    pub after: Option<V>,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::Add => write!(f, "add"),
            ChangeType::Remove => write!(f, "remove"),
            ChangeType::Modify => write!(f, "modify"),
        }
    }
}

impl<V: fmt::Debug> fmt::Display for Change<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.change_type, self.key)?;
        if let Some(before) = &self.before {
            write!(f, " before={before:?}")?;
        }
        if let Some(after) = &self.after {
            write!(f, " after={after:?}")?;
        }
        Ok(())
    }
}

impl<V> Change<V> {
    fn add(key: u64, after: V) -> Self {
        Self {
            change_type: ChangeType::Add,
            key,
            before: None,
            after: Some(after),
        }
    }

    fn remove(key: u64, before: V) -> Self {
        Self {
            change_type: ChangeType::Remove,
            key,
            before: Some(before),
            after: None,
        }
    }

    fn modify(key: u64, before: V, after: V) -> Self {
        Self {
            change_type: ChangeType::Modify,
            key,
            before: Some(before),
            after: Some(after),
        }
    }
}

#[derive(Debug)]
struct NodeContext<'a, BS> {
    bs: &'a BS,
    bit_width: u32,
    height: u32,
}

impl<BS> NodeContext<'_, BS> {
    fn child(&self) -> Result<Self, Error> {
        Ok(Self {
            bs: self.bs,
            bit_width: self.bit_width,
            height: child_height(self.height)?,
        })
    }

    /// Number of elements each child of a node at this height addresses.
    fn sub_count(&self) -> u64 {
        nodes_for_height(self.bit_width, self.height)
    }
}

/// Returns the set of changes that transform `prev` into `curr`, in increasing key order.
///
/// Values are compared on their serialized bytes. Both AMTs may contain unflushed modifications,
/// and sub-trees reachable through the same persisted Cid on both sides are skipped.
pub fn diff<V, PBS, CBS>(prev: &Amt<V, PBS>, curr: &Amt<V, CBS>) -> Result<Vec<Change<V>>, Error>
where
    V: Serialize + DeserializeOwned + Clone,
    PBS: Blockstore,
    CBS: Blockstore,
{
    if prev.bit_width() != curr.bit_width() {
        return Err(Error::IncompatibleBitWidth {
            prev: prev.bit_width(),
            curr: curr.bit_width(),
        });
    }

    let prev_ctx = NodeContext {
        bs: prev.store(),
        bit_width: prev.bit_width(),
        height: prev.height(),
    };
    let curr_ctx = NodeContext {
        bs: curr.store(),
        bit_width: curr.bit_width(),
        height: curr.height(),
    };

    // Edge case of diffing an empty AMT against a non-empty one.
    if prev.count() == 0 && curr.count() != 0 {
        return add_all(&curr_ctx, &curr.root.node, 0);
    }
    if prev.count() != 0 && curr.count() == 0 {
        return remove_all(&prev_ctx, &prev.root.node, 0);
    }
    diff_node(&prev_ctx, &curr_ctx, &prev.root.node, &curr.root.node, 0)
}

/// Loads the AMTs rooted at `prev` and `curr` from their stores and diffs them.
///
/// Both roots are checked against `config`.
pub fn diff_cids<V, PBS, CBS>(
    prev_store: &PBS,
    curr_store: &CBS,
    prev: &Cid,
    curr: &Cid,
    config: Config,
) -> Result<Vec<Change<V>>, Error>
where
    V: Serialize + DeserializeOwned + Clone,
    PBS: Blockstore,
    CBS: Blockstore,
{
    let prev_amt = Amt::<V, _>::load_with_config(prev, prev_store, config)?;
    let curr_amt = Amt::<V, _>::load_with_config(curr, curr_store, config)?;
    diff(&prev_amt, &curr_amt)
}

fn links_of<V>(node: &Node<V>) -> Result<&[Option<Link<V>>], Error> {
    match node {
        Node::Link { links } => Ok(links),
        Node::Leaf { .. } => Err(Corruption::LeafUnexpected.into()),
    }
}

fn diff_node<V, PBS, CBS>(
    prev_ctx: &NodeContext<'_, PBS>,
    curr_ctx: &NodeContext<'_, CBS>,
    prev: &Node<V>,
    curr: &Node<V>,
    offset: u64,
) -> Result<Vec<Change<V>>, Error>
where
    V: Serialize + DeserializeOwned + Clone,
    PBS: Blockstore,
    CBS: Blockstore,
{
    if prev_ctx.height == 0 && curr_ctx.height == 0 {
        return diff_leaves(prev, curr, offset);
    }

    let mut changes = Vec::new();

    // The taller side is descended until both sides are at the same height. Everything outside
    // its left-most sub-tree has no counterpart on the other side.
    if curr_ctx.height > prev_ctx.height {
        let sub_ctx = curr_ctx.child()?;
        let sub_count = curr_ctx.sub_count();
        let links = links_of(curr)?;
        match links.first() {
            Some(Some(link)) => {
                let sub = link.load(curr_ctx.bs, curr_ctx.bit_width, sub_ctx.height)?;
                changes.extend(diff_node(prev_ctx, &sub_ctx, prev, sub, offset)?);
            }
            // Nothing on the taller side overlaps the shorter tree.
            _ => changes.extend(remove_all(prev_ctx, prev, offset)?),
        }
        for (i, link) in links.iter().enumerate().skip(1) {
            let Some(link) = link else { continue };
            let sub = link.load(curr_ctx.bs, curr_ctx.bit_width, sub_ctx.height)?;
            changes.extend(add_all(&sub_ctx, sub, slot_offset(offset, i, sub_count)?)?);
        }
        return Ok(changes);
    }

    if prev_ctx.height > curr_ctx.height {
        let sub_ctx = prev_ctx.child()?;
        let sub_count = prev_ctx.sub_count();
        let links = links_of(prev)?;
        match links.first() {
            Some(Some(link)) => {
                let sub = link.load(prev_ctx.bs, prev_ctx.bit_width, sub_ctx.height)?;
                changes.extend(diff_node(&sub_ctx, curr_ctx, sub, curr, offset)?);
            }
            _ => changes.extend(add_all(curr_ctx, curr, offset)?),
        }
        for (i, link) in links.iter().enumerate().skip(1) {
            let Some(link) = link else { continue };
            let sub = link.load(prev_ctx.bs, prev_ctx.bit_width, sub_ctx.height)?;
            changes.extend(remove_all(&sub_ctx, sub, slot_offset(offset, i, sub_count)?)?);
        }
        return Ok(changes);
    }

    let prev_sub_ctx = prev_ctx.child()?;
    let curr_sub_ctx = curr_ctx.child()?;
    let sub_count = prev_ctx.sub_count();
    let prev_links = links_of(prev)?;
    let curr_links = links_of(curr)?;
    for (i, (prev_link, curr_link)) in prev_links.iter().zip(curr_links).enumerate() {
        if prev_link.is_none() && curr_link.is_none() {
            continue;
        }
        let offs = slot_offset(offset, i, sub_count)?;
        match (prev_link, curr_link) {
            (None, None) => {}
            (Some(prev_link), None) => {
                let sub = prev_link.load(prev_ctx.bs, prev_ctx.bit_width, prev_sub_ctx.height)?;
                changes.extend(remove_all(&prev_sub_ctx, sub, offs)?);
            }
            (None, Some(curr_link)) => {
                let sub = curr_link.load(curr_ctx.bs, curr_ctx.bit_width, curr_sub_ctx.height)?;
                changes.extend(add_all(&curr_sub_ctx, sub, offs)?);
            }
            (Some(Link::Cid { cid: prev_cid, .. }), Some(Link::Cid { cid: curr_cid, .. }))
                if prev_cid == curr_cid => {}
            (Some(prev_link), Some(curr_link)) => {
                let prev_sub =
                    prev_link.load(prev_ctx.bs, prev_ctx.bit_width, prev_sub_ctx.height)?;
                let curr_sub =
                    curr_link.load(curr_ctx.bs, curr_ctx.bit_width, curr_sub_ctx.height)?;
                changes.extend(diff_node(
                    &prev_sub_ctx,
                    &curr_sub_ctx,
                    prev_sub,
                    curr_sub,
                    offs,
                )?);
            }
        }
    }

    Ok(changes)
}

fn add_all<V, BS>(ctx: &NodeContext<'_, BS>, node: &Node<V>, offset: u64) -> Result<Vec<Change<V>>, Error>
where
    V: Serialize + DeserializeOwned + Clone,
    BS: Blockstore,
{
    let mut changes = Vec::new();
    node.for_each_while(ctx.bs, ctx.height, ctx.bit_width, 0, offset, &mut |i, v: &V| {
        changes.push(Change::add(i, v.clone()));
        Ok(true)
    })?;
    Ok(changes)
}

fn remove_all<V, BS>(
    ctx: &NodeContext<'_, BS>,
    node: &Node<V>,
    offset: u64,
) -> Result<Vec<Change<V>>, Error>
where
    V: Serialize + DeserializeOwned + Clone,
    BS: Blockstore,
{
    let mut changes = Vec::new();
    node.for_each_while(ctx.bs, ctx.height, ctx.bit_width, 0, offset, &mut |i, v: &V| {
        changes.push(Change::remove(i, v.clone()));
        Ok(true)
    })?;
    Ok(changes)
}

fn diff_leaves<V>(prev: &Node<V>, curr: &Node<V>, offset: u64) -> Result<Vec<Change<V>>, Error>
where
    V: Serialize + Clone,
{
    let (Node::Leaf { vals: prev_vals }, Node::Leaf { vals: curr_vals }) = (prev, curr) else {
        return Err(Corruption::LeafExpected.into());
    };

    let mut changes = Vec::new();
    for (i, (prev_val, curr_val)) in prev_vals.iter().zip(curr_vals).enumerate() {
        let index = offset + i as u64;
        match (prev_val, curr_val) {
            (None, None) => {}
            (None, Some(curr_val)) => changes.push(Change::add(index, curr_val.clone())),
            (Some(prev_val), None) => changes.push(Change::remove(index, prev_val.clone())),
            (Some(prev_val), Some(curr_val)) => {
                if fvm_ipld_encoding::to_vec(prev_val)? != fvm_ipld_encoding::to_vec(curr_val)? {
                    changes.push(Change::modify(index, prev_val.clone(), curr_val.clone()));
                }
            }
        }
    }
    Ok(changes)
}
