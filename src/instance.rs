//! Instance managers.
//!
//! An [InstanceManager] binds a [DistributedId] to a layout, a field space and the domain an instance
//! covers. The set of manager kinds is closed: [IndividualManager], [CollectiveManager] and the per node
//! [VirtualManager]. The physical kinds share the garbage collection machinery exposed through
//! [PhysicalManagerRef].

use crate::domain::Domain;
use crate::error::{InstanceError, InstanceResult};
use crate::layout::{FieldId, FieldSpace, LayoutConstraintKind, LayoutConstraintSet, LayoutDescription};

use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub(crate) mod physical;
pub use physical::{
    GcCollection, HeldReservations, InstanceRef, PhysicalManagerRef, Reservation, TopViewKey,
};

pub(crate) mod rendezvous;
pub use rendezvous::CollectiveUser;

pub(crate) mod individual;
pub use individual::IndividualManager;

pub(crate) mod collective;
pub use collective::{AllReduceSchedule, CollectiveManager, PointLocation, StageStep};

pub type ContextId = u64;
pub type MapperId = u32;
pub type ProcessorId = u32;
pub type GcPriority = i32;

/// Classification of a physical instance identifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceClass {
    pub external: bool,
    pub reduction: bool,
    pub collective: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IdKind {
    Virtual,
    Instance(InstanceClass),
    View,
}

/// A cluster wide unique identifier.
///
/// The classification is stored next to the serial rather than packed into it; serial 0 is reserved for
/// the per node virtual manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DistributedId {
    owner: usize,
    serial: u64,
    kind: IdKind,
}

impl DistributedId {
    /// # Panics
    ///
    /// if `serial` is 0 for anything other than a virtual manager, or non zero for one
    pub fn new(owner: usize, serial: u64, kind: IdKind) -> DistributedId {
        assert_eq!(
            serial == 0,
            kind == IdKind::Virtual,
            "serial 0 is reserved for the virtual manager"
        );
        DistributedId {
            owner,
            serial,
            kind,
        }
    }

    pub fn virtual_manager(node: usize) -> DistributedId {
        DistributedId::new(node, 0, IdKind::Virtual)
    }

    /// The node holding the authoritative state of the object
    pub fn owner(&self) -> usize {
        self.owner
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn kind(&self) -> IdKind {
        self.kind
    }

    fn class(&self) -> Option<InstanceClass> {
        match self.kind {
            IdKind::Instance(class) => Some(class),
            _ => None,
        }
    }

    pub fn is_virtual_manager(&self) -> bool {
        self.kind == IdKind::Virtual
    }

    pub fn is_physical_manager(&self) -> bool {
        self.class().is_some()
    }

    pub fn is_individual_manager(&self) -> bool {
        self.class().map_or(false, |c| !c.collective)
    }

    pub fn is_collective_manager(&self) -> bool {
        self.class().map_or(false, |c| c.collective)
    }

    pub fn is_external_instance(&self) -> bool {
        self.class().map_or(false, |c| c.external)
    }

    pub fn is_reduction_manager(&self) -> bool {
        self.class().map_or(false, |c| c.reduction)
    }

    pub fn is_view(&self) -> bool {
        self.kind == IdKind::View
    }
}

impl std::fmt::Display for DistributedId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let tag = match self.kind {
            IdKind::Virtual => "virtual".to_owned(),
            IdKind::View => "view".to_owned(),
            IdKind::Instance(c) => format!(
                "{}{}{}",
                if c.collective { "collective" } else { "individual" },
                if c.reduction { "+reduction" } else { "" },
                if c.external { "+external" } else { "" }
            ),
        };
        write!(f, "{}:{}:{:#x}", tag, self.owner, self.serial)
    }
}

/// Garbage collection state of a physical instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GcState {
    Valid,
    Acquired,
    Collectable,
    PendingCollected,
    Collected,
}

/// Who holds a reference on an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferenceSource {
    Mapper(MapperId),
    Operation(u64),
    Context(ContextId),
    View(DistributedId),
    Application,
}

/// Names one collective user registration: (logical view, operation context index, region requirement index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RendezvousKey {
    pub view: DistributedId,
    pub op_context_index: u64,
    pub index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceKind {
    Internal,
    ExternalAttached,
    ExternalOwned,
    Eager,
    /// allocation deferred until the size is known
    Unbound,
}

impl InstanceKind {
    pub fn is_external(&self) -> bool {
        matches!(self, InstanceKind::ExternalAttached | InstanceKind::ExternalOwned)
    }
}

/// Names one all-reduce; every participant must use the same tag for the same operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllReduceTag(pub u64);

/// Snapshot of the collection state of an instance on one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcDebugInfo {
    pub did: DistributedId,
    pub node: usize,
    pub state: GcState,
    pub references: usize,
    pub valid_references: usize,
    pub active_contexts: usize,
    pub remote_holders: Vec<usize>,
    pub pending_responses: usize,
}

#[enum_dispatch]
pub trait InstanceManagerOps {
    fn did(&self) -> DistributedId;
    fn layout(&self) -> Option<Arc<LayoutDescription>>;
    fn field_space(&self) -> Option<Arc<FieldSpace>>;
    fn instance_domain(&self) -> Domain;
    fn tree_id(&self) -> Option<u32>;

    fn owner_node(&self) -> usize {
        self.did().owner()
    }
    fn is_physical_manager(&self) -> bool {
        self.did().is_physical_manager()
    }
    fn is_collective_manager(&self) -> bool {
        self.did().is_collective_manager()
    }
    fn is_external_instance(&self) -> bool {
        self.did().is_external_instance()
    }
    fn is_reduction_manager(&self) -> bool {
        self.did().is_reduction_manager()
    }
    fn is_virtual_manager(&self) -> bool {
        self.did().is_virtual_manager()
    }
    fn get_fields(&self) -> Vec<FieldId> {
        self.layout().map(|l| l.get_fields()).unwrap_or_default()
    }
    fn has_field(&self, fid: FieldId) -> bool {
        self.layout().map_or(false, |l| l.has_field(fid))
    }
    /// Whether this instance can serve a request for `constraints`, naming the first failing constraint
    fn entails(&self, constraints: &LayoutConstraintSet) -> Result<(), (LayoutConstraintKind, Option<usize>)> {
        match self.layout() {
            Some(layout) => layout.entails(constraints),
            None => Err((LayoutConstraintKind::Specialized, None)),
        }
    }
    /// true if no amount of extra fields would make this instance satisfy `constraints`
    fn conflicts(&self, constraints: &LayoutConstraintSet) -> bool {
        matches!(
            self.entails(constraints),
            Err((LayoutConstraintKind::Ordering, _))
                | Err((LayoutConstraintKind::Specialized, _))
                | Err((LayoutConstraintKind::Alignment, _))
        )
    }
}

#[enum_dispatch(InstanceManagerOps)]
#[derive(Debug, Clone)]
pub enum InstanceManager {
    Individual(Arc<IndividualManager>),
    Collective(Arc<CollectiveManager>),
    Virtual(Arc<VirtualManager>),
}

impl InstanceManager {
    pub fn as_individual_manager(&self) -> InstanceResult<Arc<IndividualManager>> {
        match self {
            InstanceManager::Individual(m) => {
                debug_assert!(m.did().is_individual_manager());
                Ok(m.clone())
            }
            _ => Err(InstanceError::UnknownManager(self.did())),
        }
    }

    pub fn as_collective_manager(&self) -> InstanceResult<Arc<CollectiveManager>> {
        match self {
            InstanceManager::Collective(m) => {
                debug_assert!(m.did().is_collective_manager());
                Ok(m.clone())
            }
            _ => Err(InstanceError::UnknownManager(self.did())),
        }
    }

    pub fn as_physical_manager(&self) -> Option<PhysicalManagerRef> {
        match self {
            InstanceManager::Individual(m) => Some(PhysicalManagerRef::Individual(m.clone())),
            InstanceManager::Collective(m) => Some(PhysicalManagerRef::Collective(m.clone())),
            InstanceManager::Virtual(_) => None,
        }
    }
}

/// The single no-op instance of a node; backs requests that need no physical data
#[derive(Debug)]
pub struct VirtualManager {
    did: DistributedId,
}

impl VirtualManager {
    pub fn new(node: usize) -> VirtualManager {
        VirtualManager {
            did: DistributedId::virtual_manager(node),
        }
    }
}

impl InstanceManagerOps for Arc<VirtualManager> {
    fn did(&self) -> DistributedId {
        self.did
    }
    fn layout(&self) -> Option<Arc<LayoutDescription>> {
        None
    }
    fn field_space(&self) -> Option<Arc<FieldSpace>> {
        None
    }
    fn instance_domain(&self) -> Domain {
        Domain::empty()
    }
    fn tree_id(&self) -> Option<u32> {
        None
    }
}

/// A logical view of a physical instance scoped to one context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceView {
    pub did: DistributedId,
    pub manager: DistributedId,
    pub context: ContextId,
    pub logical_owner: usize,
    pub creator: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_kind() {
        let did = DistributedId::new(
            3,
            0x10003,
            IdKind::Instance(InstanceClass {
                external: true,
                reduction: false,
                collective: false,
            }),
        );
        assert_eq!(did.owner(), 3);
        assert!(did.is_physical_manager());
        assert!(did.is_individual_manager());
        assert!(did.is_external_instance());
        assert!(!did.is_collective_manager());
        assert!(!did.is_reduction_manager());
        let virt = DistributedId::virtual_manager(1);
        assert!(virt.is_virtual_manager());
        assert!(!virt.is_physical_manager());
        assert_eq!(virt.serial(), 0);
    }

    #[test]
    #[should_panic]
    fn serial_zero_is_reserved() {
        DistributedId::new(0, 0, IdKind::View);
    }

    #[test]
    fn virtual_manager_has_no_layout() {
        let manager: InstanceManager = Arc::new(VirtualManager::new(2)).into();
        assert!(manager.is_virtual_manager());
        assert!(manager.layout().is_none());
        assert!(manager.get_fields().is_empty());
        assert!(manager.as_physical_manager().is_none());
        assert!(manager.as_individual_manager().is_err());
        assert_eq!(manager.owner_node(), 2);
    }
}
