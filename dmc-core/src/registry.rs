//! Contract-to-executor assignment with least-loaded placement.

use alloy_primitives::Address;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised by registry mutations and lookups.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no executor shard is registered")]
    NoShardsAvailable,
    #[error("executor shard `{0}` not found")]
    ShardNotFound(String),
}

/// A registered shard: its stable name plus the caller's handle type.
#[derive(Debug, Clone)]
pub struct ShardHandle<H> {
    pub name: Arc<str>,
    pub executor: H,
}

struct ShardEntry<H> {
    order: u64,
    executor: H,
    contracts: HashSet<Address>,
}

impl<H> ShardEntry<H> {
    fn load_key(&self, name: &Arc<str>) -> LoadKey {
        (self.contracts.len(), self.order, name.clone())
    }
}

/// `(assigned contracts, registration order, name)`; the minimum is the next target.
type LoadKey = (usize, u64, Arc<str>);

struct ShardSet<H> {
    next_order: u64,
    entries: HashMap<Arc<str>, ShardEntry<H>>,
    by_load: BTreeSet<LoadKey>,
}

impl<H: Clone> ShardSet<H> {
    fn handle(&self, name: &Arc<str>) -> Option<ShardHandle<H>> {
        self.entries.get(name).map(|entry| ShardHandle {
            name: name.clone(),
            executor: entry.executor.clone(),
        })
    }

    fn assign(&mut self, contract: Address) -> Result<ShardHandle<H>, RegistryError> {
        let (count, order, name) = self
            .by_load
            .pop_first()
            .ok_or(RegistryError::NoShardsAvailable)?;
        let entry = self
            .entries
            .get_mut(&name)
            .ok_or_else(|| RegistryError::ShardNotFound(name.to_string()))?;
        entry.contracts.insert(contract);
        self.by_load.insert((entry.contracts.len(), order, name.clone()));

        debug!(contract = %contract, shard = %name, previous_load = count, "contract assigned");
        Ok(ShardHandle {
            name,
            executor: entry.executor.clone(),
        })
    }
}

/// Maps contract addresses to executor shards.
///
/// Structure: Address -> shard name (DashMap), plus one shard table ordered by
/// load. A contract keeps its shard until that shard is removed; dispatch never
/// moves an assigned contract.
///
/// Lock order is always assignment entry first, shard table second.
pub struct ExecutorShardRegistry<H> {
    assignments: DashMap<Address, Arc<str>>,
    shards: RwLock<ShardSet<H>>,
}

impl<H: Clone> ExecutorShardRegistry<H> {
    pub fn new() -> Self {
        Self {
            assignments: DashMap::new(),
            shards: RwLock::new(ShardSet {
                next_order: 0,
                entries: HashMap::new(),
                by_load: BTreeSet::new(),
            }),
        }
    }

    /// Registers a shard. Registering an existing name is a no-op.
    pub fn add_shard(&self, name: &str, executor: H) {
        let mut shards = self.shards.write();
        if shards.entries.contains_key(name) {
            debug!(shard = name, "executor shard already registered");
            return;
        }

        let name: Arc<str> = Arc::from(name);
        let order = shards.next_order;
        shards.next_order += 1;
        let entry = ShardEntry {
            order,
            executor,
            contracts: HashSet::new(),
        };
        shards.by_load.insert(entry.load_key(&name));
        shards.entries.insert(name.clone(), entry);
        info!(shard = %name, total = shards.entries.len(), "executor shard registered");
    }

    /// Returns the shard owning `contract`, assigning the least-loaded one first if needed.
    ///
    /// Concurrent callers racing on an unassigned contract all observe the same winner.
    pub fn dispatch(&self, contract: &Address) -> Result<ShardHandle<H>, RegistryError> {
        let assigned = self
            .assignments
            .get(contract)
            .map(|name| name.value().clone());
        if let Some(name) = assigned {
            if let Some(handle) = self.shards.read().handle(&name) {
                return Ok(handle);
            }
        }

        match self.assignments.entry(*contract) {
            Entry::Occupied(mut occupied) => {
                let mut shards = self.shards.write();
                if let Some(handle) = shards.handle(occupied.get()) {
                    return Ok(handle);
                }
                // The previous owner was removed while we raced here.
                let handle = shards.assign(*contract)?;
                occupied.insert(handle.name.clone());
                Ok(handle)
            }
            Entry::Vacant(vacant) => {
                let handle = self.shards.write().assign(*contract)?;
                vacant.insert(handle.name.clone());
                Ok(handle)
            }
        }
    }

    /// Unregisters a shard; its contracts are reassigned on their next dispatch.
    pub fn remove_shard(&self, name: &str) -> Result<(), RegistryError> {
        let (name, contracts) = {
            let mut shards = self.shards.write();
            let (name, entry) = shards
                .entries
                .remove_entry(name)
                .ok_or_else(|| RegistryError::ShardNotFound(name.to_string()))?;
            shards.by_load.remove(&entry.load_key(&name));
            (name, entry.contracts)
        };

        for contract in &contracts {
            self.assignments.remove_if(contract, |_, owner| *owner == name);
        }
        info!(shard = %name, released = contracts.len(), "executor shard removed");
        Ok(())
    }

    /// Looks up a shard by name.
    pub fn get(&self, name: &str) -> Option<ShardHandle<H>> {
        let shards = self.shards.read();
        let (name, entry) = shards.entries.get_key_value(name)?;
        Some(ShardHandle {
            name: name.clone(),
            executor: entry.executor.clone(),
        })
    }

    /// All shards in registration order.
    pub fn shards(&self) -> Vec<ShardHandle<H>> {
        let shards = self.shards.read();
        let mut handles: Vec<_> = shards
            .entries
            .iter()
            .map(|(name, entry)| {
                (
                    entry.order,
                    ShardHandle {
                        name: name.clone(),
                        executor: entry.executor.clone(),
                    },
                )
            })
            .collect();
        handles.sort_unstable_by_key(|(order, _)| *order);
        handles.into_iter().map(|(_, handle)| handle).collect()
    }

    /// Calls `f` on every shard. The shard table is not locked while `f` runs.
    pub fn for_each_shard<F>(&self, mut f: F)
    where
        F: FnMut(&ShardHandle<H>),
    {
        for handle in self.shards() {
            f(&handle);
        }
    }

    /// Number of registered shards.
    pub fn size(&self) -> usize {
        self.shards.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Number of contracts currently assigned to `name`.
    pub fn contract_count(&self, name: &str) -> Option<usize> {
        self.shards
            .read()
            .entries
            .get(name)
            .map(|entry| entry.contracts.len())
    }

    /// Removes every shard and every assignment.
    pub fn clear(&self) {
        {
            let mut shards = self.shards.write();
            shards.entries.clear();
            shards.by_load.clear();
        }
        self.assignments.clear();
        info!("executor shard registry cleared");
    }
}

impl<H: Clone> Default for ExecutorShardRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn contract(i: u64) -> Address {
        let mut bytes = [0u8; 20];
        bytes[12..].copy_from_slice(&i.to_be_bytes());
        Address::from(bytes)
    }

    fn registry_with(shards: usize) -> ExecutorShardRegistry<usize> {
        let registry = ExecutorShardRegistry::new();
        for i in 0..shards {
            registry.add_shard(&format!("executor-{i}"), i);
        }
        registry
    }

    #[test]
    fn test_dispatch_is_stable() {
        let registry = registry_with(3);
        let mut rng = StdRng::seed_from_u64(7);

        let contracts: Vec<_> = (0..50).map(contract).collect();
        let first: Vec<_> = contracts
            .iter()
            .map(|c| registry.dispatch(c).unwrap().name)
            .collect();

        for _ in 0..500 {
            let i = rng.gen_range(0..contracts.len());
            assert_eq!(registry.dispatch(&contracts[i]).unwrap().name, first[i]);
        }
    }

    #[test]
    fn test_load_balancing() {
        let (n, m) = (100usize, 7usize);
        let registry = registry_with(m);
        for i in 0..n {
            registry.dispatch(&contract(i as u64)).unwrap();
        }

        let (floor, ceil) = (n / m, n.div_ceil(m));
        for i in 0..m {
            let count = registry.contract_count(&format!("executor-{i}")).unwrap();
            assert!(count >= floor && count <= ceil, "shard {i} holds {count}");
        }
    }

    #[test]
    fn test_ties_follow_registration_order() {
        let registry = registry_with(3);
        for i in 0..3u64 {
            let handle = registry.dispatch(&contract(i)).unwrap();
            assert_eq!(handle.executor, i as usize);
        }
    }

    #[test]
    fn test_rebalancing_on_removal() {
        let registry = registry_with(3);
        let contracts: Vec<_> = (0..30).map(contract).collect();
        let before: Vec<_> = contracts
            .iter()
            .map(|c| registry.dispatch(c).unwrap().name)
            .collect();

        registry.remove_shard("executor-1").unwrap();
        assert_eq!(registry.size(), 2);

        for (c, old) in contracts.iter().zip(&before) {
            let now = registry.dispatch(c).unwrap().name;
            if &**old == "executor-1" {
                assert_ne!(&*now, "executor-1");
            } else {
                assert_eq!(&now, old);
            }
        }
        assert_eq!(registry.contract_count("executor-0"), Some(15));
        assert_eq!(registry.contract_count("executor-2"), Some(15));
    }

    #[test]
    fn test_errors() {
        let registry: ExecutorShardRegistry<usize> = ExecutorShardRegistry::new();
        assert_eq!(
            registry.dispatch(&contract(1)).unwrap_err(),
            RegistryError::NoShardsAvailable
        );
        assert_eq!(
            registry.remove_shard("missing").unwrap_err(),
            RegistryError::ShardNotFound("missing".to_string())
        );
    }

    #[test]
    fn test_add_shard_is_idempotent() {
        let registry = registry_with(1);
        registry.add_shard("executor-0", 99);
        assert_eq!(registry.size(), 1);
        assert_eq!(registry.get("executor-0").unwrap().executor, 0);
    }

    #[test]
    fn test_clear_and_for_each() {
        let registry = registry_with(4);
        let mut seen = Vec::new();
        registry.for_each_shard(|shard| seen.push(shard.executor));
        assert_eq!(seen, vec![0, 1, 2, 3]);

        registry.dispatch(&contract(1)).unwrap();
        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.dispatch(&contract(1)).is_err());
    }

    #[test]
    fn test_concurrent_dispatch_agrees() {
        let registry = registry_with(4);
        let contracts: Vec<_> = (0..64).map(contract).collect();

        let results: Vec<Vec<Arc<str>>> = crossbeam::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|_| {
                        contracts
                            .iter()
                            .map(|c| registry.dispatch(c).unwrap().name)
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
        .unwrap();

        for other in &results[1..] {
            assert_eq!(other, &results[0]);
        }
        for i in 0..4 {
            assert_eq!(registry.contract_count(&format!("executor-{i}")), Some(16));
        }
    }
}
