//! Node local memories.
//!
//! Each [MemoryManager] simulates one memory of a node: it reserves address ranges for instances,
//! owns the bytes of every instance placed in it, and keeps the garbage collection priorities
//! the owners of its instances have settled on.

use crate::error::{InstanceError, InstanceResult};
use crate::instance::DistributedId;
use crate::layout::MemoryKind;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) mod alloc;
use alloc::BestFitAlloc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemoryId {
    pub node: usize,
    pub index: usize,
}

impl std::fmt::Display for MemoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "mem{}.{}", self.node, self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocationPool {
    Normal,
    Eager,
    /// bytes handed over by the application, not counted against capacity
    External,
}

/// Handle to the storage of one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhysicalInstance {
    pub memory: MemoryId,
    pub id: u64,
    pub addr: usize,
    pub size: usize,
    pub pool: AllocationPool,
}

#[derive(Debug)]
pub struct MemoryManager {
    id: MemoryId,
    kind: MemoryKind,
    alloc: BestFitAlloc,
    eager: BestFitAlloc,
    next_instance: AtomicU64,
    storage: Mutex<HashMap<u64, Vec<u8>>>,
    gc_priorities: Mutex<HashMap<DistributedId, i32>>,
}

impl MemoryManager {
    pub fn new(id: MemoryId, kind: MemoryKind, capacity: usize, eager_fraction: f64) -> MemoryManager {
        let eager_size = ((capacity as f64) * eager_fraction.clamp(0.0, 1.0)) as usize;
        let normal_size = capacity - eager_size;
        MemoryManager {
            id,
            kind,
            alloc: BestFitAlloc::new(format!("{}", id), 0, normal_size),
            eager: BestFitAlloc::new(format!("{}.eager", id), normal_size, eager_size),
            next_instance: AtomicU64::new(1),
            storage: Mutex::new(HashMap::new()),
            gc_priorities: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> MemoryId {
        self.id
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.alloc.capacity() + self.eager.capacity()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.alloc.allocated_bytes() + self.eager.allocated_bytes()
    }

    pub fn live_instances(&self) -> usize {
        self.storage.lock().len()
    }

    /// Reserves `footprint` bytes from the normal or the eager pool
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn allocate(&self, footprint: usize, eager: bool) -> InstanceResult<PhysicalInstance> {
        let (alloc, pool) = if eager {
            (&self.eager, AllocationPool::Eager)
        } else {
            (&self.alloc, AllocationPool::Normal)
        };
        let addr = match alloc.try_malloc(footprint) {
            Some(addr) => addr,
            None => {
                tracing::debug!(memory = %self.id, footprint, "allocation failed");
                return Err(InstanceError::AllocationFailed {
                    memory: self.id,
                    footprint,
                });
            }
        };
        Ok(self.insert(addr, vec![0u8; footprint], pool))
    }

    /// Takes ownership of application provided bytes as an instance
    pub fn attach_external(&self, bytes: Vec<u8>) -> PhysicalInstance {
        self.insert(0, bytes, AllocationPool::External)
    }

    fn insert(&self, addr: usize, bytes: Vec<u8>, pool: AllocationPool) -> PhysicalInstance {
        let instance = PhysicalInstance {
            memory: self.id,
            id: self.next_instance.fetch_add(1, Ordering::Relaxed),
            addr,
            size: bytes.len(),
            pool,
        };
        self.storage.lock().insert(instance.id, bytes);
        instance
    }

    /// Hands the bytes of an external instance back to the application
    pub fn detach_external(&self, instance: &PhysicalInstance) -> InstanceResult<Vec<u8>> {
        self.storage
            .lock()
            .remove(&instance.id)
            .ok_or(InstanceError::UnknownMemory(instance.memory))
    }

    /// Releases the storage and the address range of `instance`
    pub fn free(&self, instance: &PhysicalInstance) -> bool {
        let removed = self.storage.lock().remove(&instance.id).is_some();
        match instance.pool {
            AllocationPool::Normal => removed && self.alloc.free(instance.addr),
            AllocationPool::Eager => removed && self.eager.free(instance.addr),
            AllocationPool::External => removed,
        }
    }

    pub fn is_eager_address(&self, addr: usize) -> bool {
        self.eager.contains(addr)
    }

    pub fn with_bytes<R>(
        &self,
        instance: &PhysicalInstance,
        f: impl FnOnce(&[u8]) -> R,
    ) -> InstanceResult<R> {
        let storage = self.storage.lock();
        match storage.get(&instance.id) {
            Some(bytes) => Ok(f(bytes)),
            None => Err(InstanceError::UnknownMemory(instance.memory)),
        }
    }

    pub fn with_bytes_mut<R>(
        &self,
        instance: &PhysicalInstance,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> InstanceResult<R> {
        let mut storage = self.storage.lock();
        match storage.get_mut(&instance.id) {
            Some(bytes) => Ok(f(bytes)),
            None => Err(InstanceError::UnknownMemory(instance.memory)),
        }
    }

    pub fn set_gc_priority(&self, did: DistributedId, priority: i32) {
        self.gc_priorities.lock().insert(did, priority);
    }

    pub fn remove_gc_priority(&self, did: &DistributedId) {
        self.gc_priorities.lock().remove(did);
    }

    pub fn gc_priority(&self, did: &DistributedId) -> Option<i32> {
        self.gc_priorities.lock().get(did).copied()
    }

    /// Instances with a recorded priority, lowest priority first
    pub fn eviction_order(&self) -> Vec<DistributedId> {
        let priorities = self.gc_priorities.lock();
        let mut order: Vec<(i32, DistributedId)> =
            priorities.iter().map(|(did, p)| (*p, *did)).collect();
        order.sort();
        order.into_iter().map(|(_, did)| did).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(capacity: usize) -> MemoryManager {
        MemoryManager::new(
            MemoryId { node: 0, index: 0 },
            MemoryKind::System,
            capacity,
            0.25,
        )
    }

    #[test]
    fn allocation_failure_reports_footprint() {
        let mem = memory(100);
        let inst = mem.allocate(70, false).expect("fits");
        assert_eq!(inst.size, 70);
        assert_eq!(
            mem.allocate(10, false),
            Err(InstanceError::AllocationFailed {
                memory: MemoryId { node: 0, index: 0 },
                footprint: 10
            })
        );
        let eager = mem.allocate(25, true).expect("eager pool");
        assert!(mem.is_eager_address(eager.addr));
        assert!(mem.free(&inst));
        assert!(mem.allocate(75, false).is_ok());
    }

    #[test]
    fn external_bytes_round_trip() {
        let mem = memory(16);
        let inst = mem.attach_external(vec![1, 2, 3]);
        assert_eq!(mem.allocated_bytes(), 0);
        mem.with_bytes_mut(&inst, |b| b[0] = 9).expect("attached");
        assert_eq!(mem.detach_external(&inst).expect("attached"), vec![9, 2, 3]);
        assert_eq!(mem.live_instances(), 0);
    }
}
