// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use serde::{Deserialize, Serialize};

use crate::error::Corruption;
use crate::node::{CollapsedNode, CollapsedNodeRef};
use crate::{Config, Error, MAX_HEIGHT, Node, nodes_for_height};

/// Root of an AMT vector, keeps track of bit width, height and count
#[derive(PartialEq, Debug)]
pub(crate) struct Root<V> {
    pub bit_width: u32,
    pub height: u32,
    pub count: u64,
    pub node: Node<V>,
}

/// Serialized root, `[bitWidth, height, count, node]`.
#[derive(Deserialize)]
pub(crate) struct RootRecord<V>(u64, u64, u64, CollapsedNode<V>);

#[derive(Serialize)]
pub(crate) struct RootRecordRef<'a, V>(u64, u64, u64, CollapsedNodeRef<'a, V>);

impl<V> Root<V> {
    pub(crate) fn new(bit_width: u32) -> Self {
        Self {
            bit_width,
            height: 0,
            count: 0,
            node: Node::empty(bit_width, 0),
        }
    }

    /// Serialized form of the root. All links must have been flushed.
    pub(crate) fn record(&self) -> Result<RootRecordRef<'_, V>, Error> {
        Ok(RootRecordRef(
            u64::from(self.bit_width),
            u64::from(self.height),
            self.count,
            self.node.collapsed(self.bit_width)?,
        ))
    }

    /// Validates a decoded root against `config` and expands its node.
    ///
    /// The stored bit width is checked but never trusted in place of the configured one.
    pub(crate) fn from_record(record: RootRecord<V>, config: &Config) -> Result<Self, Error> {
        let RootRecord(bit_width, height, count, node) = record;
        let expected = config.bit_width;
        if bit_width != u64::from(expected) {
            return Err(Error::InvalidConfig(format!(
                "expected bitwidth {expected} but AMT has bitwidth {bit_width}"
            )));
        }

        // Keeps `height + 1` from overflowing. A height above 62 can't be reached with the
        // minimum bit width of 1 anyway.
        if height > u64::from(MAX_HEIGHT) {
            return Err(Corruption::MaxHeight(height, MAX_HEIGHT).into());
        }
        let height = height as u32;

        // `nodes_for_height` saturates. If the previous level saturates as well, this height is
        // taller than any AMT with this bit width needs to be.
        let max_nodes = nodes_for_height(expected, height + 1);
        if max_nodes == u64::MAX && nodes_for_height(expected, height) == u64::MAX {
            return Err(Corruption::HeightOutOfBounds(height).into());
        }
        if max_nodes < count {
            return Err(Corruption::CountTooLarge { height, count }.into());
        }

        Ok(Self {
            bit_width: expected,
            height,
            count,
            node: node.expand(expected, height == 0, height == 0)?,
        })
    }
}
