//! phys_instances tracks the physical memory instances backing logical regions across the nodes of
//! a distributed task runtime.
//!
//! Every block of allocated memory (an "instance") is described by a [PhysicalManager][instance::PhysicalManagerRef],
//! which keeps the instance's metadata consistent on every node holding a copy and drives a distributed
//! garbage collection protocol that decides when the allocation may be reclaimed.
//!
//! Two kinds of physical managers exist:
//! - [IndividualManager][instance::IndividualManager] -- a single allocation on a single node.
//! - [CollectiveManager][instance::CollectiveManager] -- one logical instance replicated as many point
//!   allocations spread across a set of nodes, with tree based fill, broadcast, reduction and all-reduce
//!   operations across the replicas.
//!
//! Instances are created through the [InstanceBuilder][builder::InstanceBuilder], which resolves a
//! [LayoutConstraintSet][layout::LayoutConstraintSet] into a shared [LayoutDescription][layout::LayoutDescription]
//! and reserves the memory.
//!
//! Nodes communicate through a Lamellae (network fabric). The in-process `Local` fabric simulates a cluster
//! inside a single process, which is what the [InstanceWorld][world::InstanceWorld] sets up.
//!
//! EXAMPLES
//! --------
//!
//! ```
//! use phys_instances::prelude::*;
//!
//! let world = InstanceWorldBuilder::new().with_num_nodes(2).build();
//! let fs = FieldSpace::new(1, vec![(10, 8), (11, 8)]);
//! world.register_field_space(fs.clone());
//! let region = LogicalRegion::new(1, fs.id(), Domain::new(0, 16));
//! let constraints = LayoutConstraintSet::new(vec![10, 11]);
//! let node = world.node(0);
//! let manager = InstanceBuilder::new(node, vec![region], constraints, node.memories()[0].id())
//!     .create_physical_instance()
//!     .expect("instance");
//! assert!(manager.did().is_physical_manager());
//! ```

pub extern crate serde;

pub extern crate tracing;

pub mod builder;
pub mod collective_mapping;
pub mod copy;
pub mod domain;
pub mod env_var;
pub mod error;
pub mod event;
pub mod instance;
pub(crate) mod lamellae;
pub mod layout;
pub mod memory;
pub(crate) mod messages;
pub mod runtime;
pub(crate) mod scheduler;
pub(crate) mod warnings;
pub mod world;

pub use crate::env_var::config;

/// Commonly used types, re-exported for convenience
pub mod prelude {
    pub use crate::builder::{InstanceBuilder, PendingCollectiveManager};
    pub use crate::collective_mapping::CollectiveMapping;
    pub use crate::copy::{FieldBuffer, ReductionOpKind};
    pub use crate::domain::{Domain, DomainPoint, LogicalRegion};
    pub use crate::error::{InstanceError, InstanceResult};
    pub use crate::event::{ApEvent, RtEvent, UserEvent};
    pub use crate::instance::{
        AllReduceTag, CollectiveManager, DistributedId, GcState, IndividualManager, InstanceKind,
        InstanceManager, InstanceManagerOps, PhysicalManagerRef, ReferenceSource, RendezvousKey,
    };
    pub use crate::layout::{
        FieldId, FieldMask, FieldOrdering, FieldSpace, LayoutConstraintKind,
        LayoutConstraintSet, LayoutDescription, MemoryKind, SpecializedKind,
    };
    pub use crate::memory::{MemoryId, PhysicalInstance};
    pub use crate::runtime::Runtime;
    pub use crate::world::{InstanceWorld, InstanceWorldBuilder};
}

/// Wrapper function for serializing data
pub fn serialize<T: ?Sized>(obj: &T) -> Result<Vec<u8>, anyhow::Error>
where
    T: serde::Serialize,
{
    Ok(bincode::serialize(obj)?)
}

/// Wrapper function for getting the size of serialized data
pub fn serialized_size<T: ?Sized>(obj: &T) -> Result<usize, anyhow::Error>
where
    T: serde::Serialize,
{
    Ok(bincode::serialized_size(obj)? as usize)
}

/// Wrapper function for deserializing data
pub fn deserialize<'a, T>(bytes: &'a [u8]) -> Result<T, anyhow::Error>
where
    T: serde::Deserialize<'a>,
{
    Ok(bincode::deserialize(bytes)?)
}
