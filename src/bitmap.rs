// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Translation between the expanded, slot addressed form of a node and the compacted form that
//! is written to the store.

use crate::error::Corruption;
use crate::width;

/// Map of bits to indicate which slots of a node contain values and which are empty.
///
/// Slot `i` is bit `i % 8` of byte `i / 8`.
#[derive(PartialEq, Eq, Clone, Debug)]
pub(crate) struct BitMap {
    bz: Vec<u8>,
}

/// Number of bytes needed for one bit per slot, never less than one.
pub(crate) fn bmap_bytes(bit_width: u32) -> usize {
    if bit_width <= 3 {
        return 1;
    }
    1 << (bit_width - 3)
}

impl BitMap {
    pub fn new(bit_width: u32) -> Self {
        Self {
            bz: vec![0; bmap_bytes(bit_width)],
        }
    }

    /// Wraps serialized bitmap bytes, which must have the exact length for `bit_width`.
    pub fn from_bytes(bz: Vec<u8>, bit_width: u32) -> Result<Self, Corruption> {
        let expected = bmap_bytes(bit_width);
        if bz.len() != expected {
            return Err(Corruption::BitmapLength {
                expected,
                found: bz.len(),
            });
        }
        Ok(Self { bz })
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bz
    }

    pub fn get_bit(&self, i: usize) -> bool {
        self.bz[i / 8] & (1 << (i % 8)) != 0
    }

    pub fn set_bit(&mut self, i: usize) {
        self.bz[i / 8] |= 1 << (i % 8);
    }

    /// Number of set bits among the first `width` slots. Bits past the node width are ignored.
    pub fn count_ones(&self, width: usize) -> usize {
        (0..width).filter(|&i| self.get_bit(i)).count()
    }
}

/// Compacts a slot array, returning the bitmap of present slots and the present entries in slot
/// order.
pub(crate) fn compact<'a, T>(
    bit_width: u32,
    slots: impl IntoIterator<Item = Option<&'a T>>,
) -> (BitMap, Vec<&'a T>)
where
    T: 'a,
{
    let mut bmap = BitMap::new(bit_width);
    let mut entries = Vec::new();
    for (i, slot) in slots.into_iter().enumerate() {
        if let Some(entry) = slot {
            bmap.set_bit(i);
            entries.push(entry);
        }
    }
    (bmap, entries)
}

/// Expands compacted entries back into `width` slots according to `bmap`.
///
/// Fails if the number of set bits differs from the number of entries.
pub(crate) fn expand<T>(
    bmap: &BitMap,
    bit_width: u32,
    entries: Vec<T>,
) -> Result<Vec<Option<T>>, Corruption> {
    let width = width(bit_width);
    let expected = bmap.count_ones(width);
    if expected != entries.len() {
        return Err(Corruption::CountMismatch {
            expected,
            found: entries.len(),
        });
    }
    let mut entries = entries.into_iter();
    Ok((0..width)
        .map(|i| {
            if bmap.get_bit(i) {
                entries.next()
            } else {
                None
            }
        })
        .collect())
}
