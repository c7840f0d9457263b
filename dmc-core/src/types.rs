//! Core identifiers shared by the lock graph and the scheduler.

use alloy_primitives::Address;
use std::fmt;

/// Identifier of one top-level transaction's execution within a block.
pub type ContextId = u64;

/// Call-depth counter of a nested call inside a context.
pub type Seq = u64;

/// Raw storage slot key as reported by an executor shard.
pub type StorageKey = Vec<u8>;

/// An exclusive claim on one storage slot of one contract.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyLock {
    pub contract: Address,
    pub key: StorageKey,
}

impl KeyLock {
    pub fn new(contract: Address, key: impl Into<StorageKey>) -> Self {
        Self {
            contract,
            key: key.into(),
        }
    }
}

impl fmt::Display for KeyLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:0x", self.contract)?;
        for byte in &self.key {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Holder of a key lock: one context, possibly at several call depths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LockHolder {
    pub context_id: ContextId,
    pub seqs: std::collections::BTreeSet<Seq>,
}
