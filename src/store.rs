// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::DAG_CBOR;
use multihash_codetable::{Code, MultihashDigest as _};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::Error;

/// DAG-CBOR block access on top of any [`Blockstore`].
///
/// - The codec is [`fvm_ipld_encoding::DAG_CBOR`]
/// - The hash function is 256 bit BLAKE2b
///
/// This matches the CID builder used for AMT nodes by other Filecoin implementations.
pub(crate) trait CborBlockstoreExt: Blockstore {
    /// Encodes `obj`, writes it under its content hash and returns that hash.
    fn put_cbor_blake2b256<S: Serialize>(&self, obj: &S) -> Result<Cid, Error> {
        let bytes = fvm_ipld_encoding::to_vec(obj)?;
        let cid = Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(&bytes));
        self.put_keyed(&cid, &bytes)?;
        Ok(cid)
    }

    /// Reads and decodes the block stored under `cid`, failing if the store doesn't have it.
    fn get_cbor_required<T: DeserializeOwned>(&self, cid: &Cid) -> Result<T, Error> {
        let bytes = self
            .get(cid)?
            .ok_or_else(|| Error::CidNotFound(cid.to_string()))?;
        Ok(fvm_ipld_encoding::from_slice(&bytes)?)
    }
}

impl<BS: Blockstore + ?Sized> CborBlockstoreExt for BS {}
