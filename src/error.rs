// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_ipld_encoding::Error as EncodingError;
use thiserror::Error;

/// AMT Error
#[derive(Debug, Error)]
pub enum Error {
    /// Index is above `MAX_INDEX`
    #[error("index {0} out of range for the amt")]
    OutOfRange(u64),
    /// Bit width is not usable, either because it is invalid or because it does not match the
    /// bit width of the data being loaded
    #[error("invalid amt config: {0}")]
    InvalidConfig(String),
    /// The stored structure violates one of the AMT invariants
    #[error("malformed amt: {0}")]
    Corrupt(#[from] Corruption),
    /// Cid not found in store error
    #[error("Cid ({0}) did not match any in database")]
    CidNotFound(String),
    /// Strict batch delete targeted an index that is not set
    #[error("no such index {0} in Amt for batch delete")]
    NoSuchIndex(u64),
    /// Diff was requested between AMTs with different bit widths
    #[error("diffing AMTs with differing bitWidths not supported (prev={prev}, cur={curr})")]
    IncompatibleBitWidth { prev: u32, curr: u32 },
    /// Element count would over- or underflow, the tree was built inconsistently
    #[error("amt count does not match number of elements")]
    InvalidCount,
    /// Lowest set index requested from an empty AMT
    #[error("no values")]
    NoValues,
    /// Error when serializing or deserializing data
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
    /// Dynamic error for when the error needs to be forwarded as is.
    #[error("{0}")]
    Dynamic(anyhow::Error),
}

/// Structural invariants a decoded AMT node or root can break.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Corruption {
    /// Stored height is above `MAX_HEIGHT`
    #[error("height greater than {1}: {0}")]
    MaxHeight(u64, u32),
    /// Height is taller than any AMT with this bit width can need
    #[error("height {0} out of bounds")]
    HeightOutOfBounds(u32),
    /// Count is larger than the tree height can address
    #[error("not tall enough ({height}) for count ({count})")]
    CountTooLarge { height: u32, count: u64 },
    /// Node holds both links and values
    #[error("amt node has both links and values")]
    MixedNode,
    /// Bitmap byte length does not match the bit width
    #[error("expected bitfield to be {expected} bytes long, found bitfield with {found} bytes")]
    BitmapLength { expected: usize, found: usize },
    /// Number of set bits differs from the number of stored entries
    #[error("bitmap marks {expected} entries, found {found}")]
    CountMismatch { expected: usize, found: usize },
    /// Link to a child that is not DAG-CBOR
    #[error("internal amt nodes must be cbor, found {0:#x}")]
    InvalidLinkCodec(u64),
    /// Non-root node without any entries
    #[error("unexpected empty amt node")]
    EmptyNode,
    /// Values found above height zero
    #[error("amt leaf not expected at height")]
    LeafUnexpected,
    /// Links found at height zero
    #[error("amt leaf expected at height")]
    LeafExpected,
    /// Node written before its children were flushed
    #[error("cannot serialize a node with unflushed links")]
    UnflushedLink,
    /// Child slot starts past the end of the `u64` index space
    #[error("amt node addresses indices beyond the maximum index")]
    IndexOverflow,
}

impl Error {
    /// Returns true for errors that indicate the stored or in-memory structure is inconsistent
    /// rather than a caller mistake or an I/O failure.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupt(_) | Self::InvalidCount)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        e.downcast::<Error>().unwrap_or_else(Self::Dynamic)
    }
}
