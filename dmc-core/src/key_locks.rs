//! Key-lock table with wait-for deadlock detection.
//!
//! One graph lives for exactly one block. Every operation runs under a single
//! mutex so that acquire, release, probe and cycle detection are atomic with
//! respect to each other; none of them ever blocks on another context.

use crate::types::{ContextId, KeyLock, LockHolder, Seq, StorageKey};
use alloy_primitives::Address;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, trace};

/// Lock table of a single block execution.
///
/// Structure: Contract -> BTreeMap<StorageKey -> holder context + seqs>
///
/// The wait-for graph is never stored as such. Each denied request is kept as
/// `(context, seq) -> wanted locks` and edges are derived from the current
/// holders whenever [`KeyLockGraph::detect_dead_lock`] walks the graph, which
/// keeps repeated denials between the same two contexts from growing it.
pub struct KeyLockGraph {
    table: Mutex<LockTable>,
}

#[derive(Default)]
struct LockTable {
    holders: HashMap<Address, BTreeMap<StorageKey, LockHolder>>,
    /// Locks granted to each `(context, seq)`, for release.
    acquired: HashMap<(ContextId, Seq), BTreeSet<KeyLock>>,
    /// Locks each `(context, seq)` was denied and still waits for.
    waiting: HashMap<(ContextId, Seq), BTreeSet<KeyLock>>,
}

impl LockTable {
    fn holder_of(&self, lock: &KeyLock) -> Option<ContextId> {
        self.holders
            .get(&lock.contract)
            .and_then(|keys| keys.get(&lock.key))
            .map(|holder| holder.context_id)
    }

    /// Deduplicated `waiter -> holder` edges.
    fn edges(&self) -> HashMap<ContextId, BTreeSet<ContextId>> {
        let mut edges: HashMap<ContextId, BTreeSet<ContextId>> = HashMap::new();
        for (&(waiter, _), locks) in &self.waiting {
            for lock in locks {
                if let Some(holder) = self.holder_of(lock) {
                    if holder != waiter {
                        edges.entry(waiter).or_default().insert(holder);
                    }
                }
            }
        }
        edges
    }
}

impl KeyLockGraph {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
        }
    }

    /// Tries to lock `key` of `contract` for `(context_id, seq)`.
    ///
    /// Grants when the key is free or already held by the same context, whatever
    /// the seq. Otherwise records that this `(context_id, seq)` waits for the key
    /// and returns `false`.
    pub fn acquire_key_lock(
        &self,
        contract: &Address,
        key: &[u8],
        context_id: ContextId,
        seq: Seq,
    ) -> bool {
        let mut table = self.table.lock();
        let LockTable {
            holders,
            acquired,
            waiting,
        } = &mut *table;

        let keys = holders.entry(*contract).or_default();
        match keys.get_mut(key) {
            Some(holder) if holder.context_id != context_id => {
                trace!(
                    contract = %contract,
                    context_id,
                    seq,
                    holder = holder.context_id,
                    "key lock denied"
                );
                waiting
                    .entry((context_id, seq))
                    .or_default()
                    .insert(KeyLock::new(*contract, key));
                return false;
            }
            Some(holder) => {
                holder.seqs.insert(seq);
            }
            None => {
                keys.insert(
                    key.to_vec(),
                    LockHolder {
                        context_id,
                        seqs: BTreeSet::from([seq]),
                    },
                );
            }
        }

        let lock = KeyLock::new(*contract, key);
        if let Some(wanted) = waiting.get_mut(&(context_id, seq)) {
            wanted.remove(&lock);
            if wanted.is_empty() {
                waiting.remove(&(context_id, seq));
            }
        }
        acquired.entry((context_id, seq)).or_default().insert(lock);
        true
    }

    /// Releases every lock granted to `(context_id, seq)` and forgets what it waited for.
    ///
    /// Locks the same context holds at other seqs are untouched.
    pub fn release_key_locks(&self, context_id: ContextId, seq: Seq) {
        let mut table = self.table.lock();
        let LockTable {
            holders,
            acquired,
            waiting,
        } = &mut *table;

        waiting.remove(&(context_id, seq));
        let Some(locks) = acquired.remove(&(context_id, seq)) else {
            return;
        };

        for lock in locks {
            let Some(keys) = holders.get_mut(&lock.contract) else {
                continue;
            };
            let now_free = match keys.get_mut(&lock.key) {
                Some(holder) if holder.context_id == context_id => {
                    holder.seqs.remove(&seq);
                    holder.seqs.is_empty()
                }
                _ => false,
            };
            if now_free {
                keys.remove(&lock.key);
            }
            if keys.is_empty() {
                holders.remove(&lock.contract);
            }
        }
        trace!(context_id, seq, "key locks released");
    }

    /// Releases everything `context_id` holds or waits for, at every seq.
    pub fn release_context(&self, context_id: ContextId) {
        let seqs: BTreeSet<Seq> = {
            let table = self.table.lock();
            table
                .acquired
                .keys()
                .chain(table.waiting.keys())
                .filter(|(context, _)| *context == context_id)
                .map(|(_, seq)| *seq)
                .collect()
        };
        for seq in seqs {
            self.release_key_locks(context_id, seq);
        }
    }

    /// Keys of `contract` currently held by any context other than `context_id`.
    pub fn get_key_locks_not_holding_by_context(
        &self,
        contract: &Address,
        context_id: ContextId,
    ) -> BTreeSet<StorageKey> {
        let table = self.table.lock();
        table
            .holders
            .get(contract)
            .map(|keys| {
                keys.iter()
                    .filter(|(_, holder)| holder.context_id != context_id)
                    .map(|(key, _)| key.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns true if `context_id` lies on a cycle of the wait-for graph.
    pub fn detect_dead_lock(&self, context_id: ContextId) -> bool {
        let edges = self.table.lock().edges();

        let mut visited = HashSet::new();
        let mut stack: Vec<ContextId> = edges
            .get(&context_id)
            .map(|next| next.iter().copied().collect())
            .unwrap_or_default();

        while let Some(current) = stack.pop() {
            if current == context_id {
                debug!(context_id, "deadlock detected");
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(next) = edges.get(&current) {
                stack.extend(next.iter().copied());
            }
        }
        false
    }

    /// Snapshot of the deduplicated wait-for edges, sorted.
    pub fn wait_for_edges(&self) -> Vec<(ContextId, ContextId)> {
        let edges = self.table.lock().edges();
        let mut flat: Vec<_> = edges
            .into_iter()
            .flat_map(|(waiter, holders)| holders.into_iter().map(move |holder| (waiter, holder)))
            .collect();
        flat.sort_unstable();
        flat
    }

    /// Number of `(contract, key)` pairs currently locked.
    pub fn len(&self) -> usize {
        self.table.lock().holders.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for KeyLockGraph {
    fn default() -> Self {
        Self::new()
    }
}
