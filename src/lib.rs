// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Array Mapped Trie, a persistent and content-addressed sparse array.
//!
//! Indices in `0..=MAX_INDEX` map to values of type `V`. Every node of the trie
//! is stored as a DAG-CBOR block in a [`fvm_ipld_blockstore::Blockstore`], so
//! the whole array is identified by the [`cid::Cid`] returned from
//! [`Amt::flush`].
//!
//! [Data structure reference](https://github.com/ipld/specs/blob/master/data-structures/vector.md)

mod amt;
mod bitmap;
mod config;
mod diff;
mod error;
mod node;
mod root;
mod store;
#[cfg(test)]
mod tests;
mod value_mut;

pub use self::amt::Amt;
pub use self::config::Config;
pub use self::diff::{Change, ChangeType, diff, diff_cids};
pub use self::error::{Corruption, Error};
pub use self::value_mut::ValueMut;

pub(crate) use self::node::Node;

/// Bit width used when none is configured, giving 8 slots per node.
pub const DEFAULT_BIT_WIDTH: u32 = 3;

/// Largest supported bit width. Wider nodes cannot be addressed with a `usize` slot index on
/// every platform the crate targets.
pub const MAX_BIT_WIDTH: u32 = 30;

/// Sanity bound on the height of a loaded AMT, keeps `height + 1` from overflowing.
pub const MAX_HEIGHT: u32 = 64;

/// Largest index that can be stored. This is `u64::MAX - 1` so the length of a full AMT still
/// fits in a `u64`.
pub const MAX_INDEX: u64 = u64::MAX - 1;

/// Number of leaf slots that a node at `height` can address, `width^height`.
///
/// Saturates to `u64::MAX` once `bit_width * height` reaches 64 bits; the topmost level of such
/// a tree is never full.
pub(crate) fn nodes_for_height(bit_width: u32, height: u32) -> u64 {
    let height_log_two = u64::from(bit_width) * u64::from(height);
    if height_log_two >= 64 {
        return u64::MAX;
    }
    1 << height_log_two
}

/// Number of slots in a node, `2^bit_width`.
pub(crate) fn width(bit_width: u32) -> usize {
    1 << bit_width
}

pub(crate) fn init_sized_vec<V>(bit_width: u32) -> Vec<Option<V>> {
    std::iter::repeat_with(|| None)
        .take(width(bit_width))
        .collect()
}
