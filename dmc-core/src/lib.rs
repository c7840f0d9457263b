//! Concurrency primitives for DMC (deterministic multi-contract) block execution.
//!
//! This crate holds the block-independent pieces of the transaction-execution
//! scheduler. Both structures are synchronous and internally locked, so they can
//! be shared between the tasks that drive executor shards concurrently.
//!
//! # Core Components
//!
//! - **ExecutorShardRegistry**: Maps contract addresses to executor shards, assigning
//!   each new contract to the least-loaded shard
//! - **KeyLockGraph**: Per-block table of exclusive storage-key locks held by execution
//!   contexts, with wait-for cycle detection
//!
//! # Locking Overview
//!
//! 1. Every top-level transaction runs as one context; nested calls advance its `Seq`
//! 2. A shard reports the keys a call frame touched and the scheduler locks them
//! 3. A context asking for a key held by another context is denied and a wait-for edge is recorded
//! 4. When every runnable context is blocked, the scheduler looks for a cycle and aborts one member
//! 5. Locks are released per `Seq` on revert and for the whole context on completion
//!
//! # Example
//!
//! ```rust
//! use dmc_core::{ExecutorShardRegistry, KeyLockGraph};
//! use alloy_primitives::Address;
//!
//! let registry = ExecutorShardRegistry::new();
//! registry.add_shard("executor-0", 0usize);
//! let shard = registry.dispatch(&Address::repeat_byte(1)).unwrap();
//! assert_eq!(&*shard.name, "executor-0");
//!
//! let locks = KeyLockGraph::new();
//! assert!(locks.acquire_key_lock(&Address::repeat_byte(1), b"balance", 7, 0));
//! assert!(!locks.acquire_key_lock(&Address::repeat_byte(1), b"balance", 8, 0));
//! ```

pub mod key_locks;
pub mod registry;
pub mod types;

pub use key_locks::KeyLockGraph;
pub use registry::{ExecutorShardRegistry, RegistryError, ShardHandle};
pub use types::{ContextId, KeyLock, Seq, StorageKey};
