// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::ops::{Deref, DerefMut};

/// Mutable reference to a value stored in the AMT, handed out by [`crate::Amt::for_each_mut`].
///
/// Tracks whether the value was accessed mutably, so that nodes whose values were only read
/// are not marked dirty and re-persisted on the next flush.
pub struct ValueMut<'a, V> {
    value: &'a mut V,
    value_mutated: bool,
}

impl<V> Deref for ValueMut<'_, V> {
    type Target = V;

    fn deref(&self) -> &Self::Target {
        self.value
    }
}

impl<V> DerefMut for ValueMut<'_, V> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.value_mutated = true;
        self.value
    }
}

impl<'a, V> ValueMut<'a, V> {
    pub(crate) fn new(value: &'a mut V) -> Self {
        Self {
            value,
            value_mutated: false,
        }
    }

    /// Returns true if the value has been accessed mutably.
    pub fn value_changed(&self) -> bool {
        self.value_mutated
    }

    /// Resets the mutation flag, for when the caller restored the original value.
    pub fn mark_unchanged(&mut self) {
        self.value_mutated = false;
    }
}
