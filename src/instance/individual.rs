use crate::copy::{FieldBuffer, ReductionOpKind};
use crate::domain::Domain;
use crate::error::{InstanceError, InstanceResult};
use crate::event::{ApEvent, RtEvent, RtUserEvent};
use crate::instance::physical::PhysicalCore;
use crate::instance::{
    DistributedId, GcPriority, GcState, InstanceKind, InstanceManagerOps, PhysicalManagerRef,
};
use crate::layout::{CopySrcDstField, FieldId, FieldMask, FieldSpace, LayoutDescription};
use crate::memory::{MemoryId, PhysicalInstance};
use crate::messages::{DescriptorVariant, InstanceMessage, ManagerDescriptor};

use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug)]
struct IndividualState {
    instance: Option<PhysicalInstance>,
    kind: InstanceKind,
}

/// A physical instance backed by exactly one allocation in one memory.
///
/// The node of that memory owns the manager. Other nodes may hold copies of the metadata, which keep the
/// owner from collecting until they agree.
pub struct IndividualManager {
    pub(crate) core: PhysicalCore,
    memory: MemoryId,
    state: Mutex<IndividualState>,
    bound: RtUserEvent,
}

impl std::fmt::Debug for IndividualManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("IndividualManager")
            .field("core", &self.core)
            .field("memory", &self.memory)
            .field("instance", &state.instance)
            .field("kind", &state.kind)
            .finish()
    }
}

impl IndividualManager {
    pub(crate) fn new(
        core: PhysicalCore,
        memory: MemoryId,
        instance: Option<PhysicalInstance>,
        kind: InstanceKind,
    ) -> IndividualManager {
        let bound = RtUserEvent::new();
        if instance.is_some() {
            bound.trigger();
        }
        IndividualManager {
            core,
            memory,
            state: Mutex::new(IndividualState { instance, kind }),
            bound,
        }
    }

    pub fn as_physical(self: &Arc<Self>) -> PhysicalManagerRef {
        PhysicalManagerRef::Individual(self.clone())
    }

    pub fn memory(&self) -> MemoryId {
        self.memory
    }

    pub fn kind(&self) -> InstanceKind {
        self.state.lock().kind
    }

    pub fn instance(&self) -> Option<PhysicalInstance> {
        self.state.lock().instance
    }

    pub fn is_bound(&self) -> bool {
        self.state.lock().instance.is_some()
    }

    /// Triggers once storage is attached; immediately for everything but unbound instances
    pub fn bound_event(&self) -> RtEvent {
        self.bound.event()
    }

    pub fn footprint(&self) -> usize {
        self.core.footprint
    }

    pub fn compute_copy_offsets(&self, mask: &FieldMask) -> Vec<CopySrcDstField> {
        self.core
            .layout
            .compute_copy_offsets(mask, self.core.instance_domain.volume())
    }

    // None when the configured policy turns use after collection into a no-op
    fn local_instance(&self, operation: &'static str) -> InstanceResult<Option<PhysicalInstance>> {
        if !self.core.check_usable(operation)? {
            return Ok(None);
        }
        if self.memory.node != self.core.runtime.node() {
            return Err(InstanceError::UnknownMemory(self.memory));
        }
        match self.instance() {
            Some(instance) => Ok(Some(instance)),
            None => Err(InstanceError::InvalidInstanceState {
                did: self.core.did,
                state: self.core.gc_state(),
                operation,
            }),
        }
    }

    /// Writes `value` into every element of `fids`
    pub fn fill(&self, fids: &[FieldId], value: &[u8]) -> InstanceResult<ApEvent> {
        if let Some(instance) = self.local_instance("fill")? {
            self.core.fill_instance(&instance, fids, value)?;
        }
        Ok(ApEvent::no_event())
    }

    pub fn gather(&self, fids: &[FieldId]) -> InstanceResult<FieldBuffer> {
        match self.local_instance("gather")? {
            Some(instance) => self.core.gather_instance(&instance, fids),
            None => Ok(FieldBuffer::new(self.core.instance_domain.volume())),
        }
    }

    pub fn read_field(&self, fid: FieldId) -> InstanceResult<Vec<u8>> {
        let buffer = self.gather(&[fid])?;
        Ok(buffer.field(fid).map(|b| b.to_vec()).unwrap_or_default())
    }

    pub fn write_field(&self, fid: FieldId, bytes: Vec<u8>) -> InstanceResult<()> {
        let mut buffer = FieldBuffer::new(self.core.instance_domain.volume());
        buffer.push_field(fid, bytes);
        self.scatter(&buffer, None).map(|_| ())
    }

    /// Writes `buffer` into the instance, folding with `fold` when given
    pub fn scatter(
        &self,
        buffer: &FieldBuffer,
        fold: Option<ReductionOpKind>,
    ) -> InstanceResult<ApEvent> {
        if let Some(instance) = self.local_instance("scatter")? {
            self.core.scatter_instance(&instance, buffer, fold)?;
        }
        Ok(ApEvent::no_event())
    }

    /// Copies (or reduces with `fold`) `fids` from `src`; both instances must live on this node
    pub fn copy_from(
        &self,
        src: &IndividualManager,
        fids: &[FieldId],
        fold: Option<ReductionOpKind>,
    ) -> InstanceResult<ApEvent> {
        if src.core.instance_domain.volume() != self.core.instance_domain.volume() {
            return Err(InstanceError::Transport(format!(
                "copy between {} and {} with different domains",
                src.core.did, self.core.did
            )));
        }
        let buffer = src.gather(fids)?;
        self.scatter(&buffer, fold)
    }

    /// Binds storage to an unbound instance and tells every remote holder about it
    pub fn update_physical_instance(&self, instance: PhysicalInstance) -> InstanceResult<()> {
        if !self.core.is_owner() {
            return Err(InstanceError::InvalidInstanceState {
                did: self.core.did,
                state: self.core.gc_state(),
                operation: "update_physical_instance",
            });
        }
        if instance.memory != self.memory {
            return Err(InstanceError::UnknownMemory(instance.memory));
        }
        if instance.size < self.core.footprint {
            return Err(InstanceError::AllocationFailed {
                memory: self.memory,
                footprint: self.core.footprint,
            });
        }
        {
            let mut state = self.state.lock();
            if state.kind != InstanceKind::Unbound || state.instance.is_some() {
                return Err(InstanceError::InvalidInstanceState {
                    did: self.core.did,
                    state: self.core.gc_state(),
                    operation: "update_physical_instance",
                });
            }
            state.instance = Some(instance);
            state.kind = InstanceKind::Internal;
        }
        self.bound.trigger();
        let gc = self.core.gc.lock();
        for holder in gc.remote_holders.iter() {
            self.core.runtime.send(
                *holder,
                InstanceMessage::ManagerUpdate {
                    did: self.core.did,
                    instance,
                    kind: InstanceKind::Internal,
                },
            );
        }
        Ok(())
    }

    /// Allocates the deferred storage of an unbound instance from its memory
    pub fn allocate_deferred(&self) -> InstanceResult<()> {
        let memory = self.core.runtime.memory(self.memory)?;
        let instance = memory.allocate(self.core.footprint, false)?;
        if let Err(e) = self.update_physical_instance(instance) {
            memory.free(&instance);
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn handle_manager_update(&self, instance: PhysicalInstance, kind: InstanceKind) {
        {
            let mut state = self.state.lock();
            state.instance = Some(instance);
            state.kind = kind;
        }
        self.bound.trigger();
    }

    /// Ships the metadata of this manager to `target`, which becomes a remote holder
    pub fn send_manager(&self, target: usize) -> InstanceResult<()> {
        if !self.core.is_owner() {
            let did = self.core.did;
            self.core
                .runtime
                .send(did.owner(), InstanceMessage::ManagerRequest { did, target });
            return Ok(());
        }
        let descriptor = self.descriptor();
        let mut gc = self.core.gc.lock();
        if gc.state == GcState::Collected {
            drop(gc);
            return self.core.collected("send_manager").map(|_| ());
        }
        if target != self.core.runtime.node() {
            gc.remote_holders.insert(target);
            self.core
                .runtime
                .send(target, InstanceMessage::SendManager { descriptor });
        }
        Ok(())
    }

    pub(crate) fn descriptor(&self) -> ManagerDescriptor {
        let state = self.state.lock();
        ManagerDescriptor {
            did: self.core.did,
            field_space: (*self.core.field_space).clone(),
            constraints: self.core.layout.constraints().clone(),
            tree_id: self.core.tree_id,
            instance_domain: self.core.instance_domain,
            footprint: self.core.footprint,
            variant: DescriptorVariant::Individual {
                memory: self.memory,
                instance: state.instance,
                kind: state.kind,
            },
        }
    }

    /// Releases the storage, if this node holds it
    pub(crate) fn perform_deletion(&self) {
        let (instance, kind) = {
            let mut state = self.state.lock();
            (state.instance.take(), state.kind)
        };
        let instance = match instance {
            Some(instance) if instance.memory.node == self.core.runtime.node() => instance,
            _ => return,
        };
        let memory = match self.core.runtime.memory(instance.memory) {
            Ok(memory) => memory,
            Err(e) => {
                tracing::error!(did = %self.core.did, error = %e, "deleting instance in unknown memory");
                return;
            }
        };
        memory.remove_gc_priority(&self.core.did);
        for (fid, serdez) in self.core.layout.compute_destroyed_fields() {
            tracing::trace!(did = %self.core.did, fid, serdez, "destroying field");
        }
        match kind {
            InstanceKind::ExternalAttached => {
                // attached bytes belong to the application, drop our claim on them
                if let Err(e) = memory.detach_external(&instance) {
                    tracing::warn!(did = %self.core.did, ?instance, error = %e, "external storage already gone");
                }
            }
            _ => {
                if !memory.free(&instance) {
                    tracing::error!(did = %self.core.did, ?instance, "failed to free instance");
                }
            }
        }
        tracing::debug!(did = %self.core.did, memory = %instance.memory, "instance deleted");
    }

    /// Deletes the instance immediately, bypassing the collection protocol
    pub fn force_deletion(&self) {
        let mut gc = self.core.gc.lock();
        if gc.state == GcState::Collected {
            return;
        }
        tracing::warn!(did = %self.core.did, state = ?gc.state, "forcing deletion");
        gc.state = GcState::Collected;
        for holder in gc.remote_holders.iter() {
            self.core.runtime.send(
                *holder,
                InstanceMessage::ManagerDeletion {
                    did: self.core.did,
                },
            );
        }
        drop(gc);
        self.perform_deletion();
        self.core.runtime.unregister_manager(&self.core.did);
    }

    /// Hands the bytes of an attached external instance back to the application and deletes the manager
    pub fn detach_external_instance(&self) -> InstanceResult<Vec<u8>> {
        let instance = {
            let mut state = self.state.lock();
            if state.kind != InstanceKind::ExternalAttached {
                return Err(InstanceError::InvalidInstanceState {
                    did: self.core.did,
                    state: self.core.gc_state(),
                    operation: "detach_external_instance",
                });
            }
            match state.instance.take() {
                Some(instance) => instance,
                None => {
                    return Err(InstanceError::InvalidInstanceState {
                        did: self.core.did,
                        state: self.core.gc_state(),
                        operation: "detach_external_instance",
                    })
                }
            }
        };
        let bytes = self
            .core
            .runtime
            .memory(instance.memory)?
            .detach_external(&instance)?;
        self.force_deletion();
        Ok(bytes)
    }

    pub(crate) fn apply_gc_priority(&self, priority: GcPriority) {
        if self.memory.node == self.core.runtime.node() {
            if let Ok(memory) = self.core.runtime.memory(self.memory) {
                memory.set_gc_priority(self.core.did, priority);
            }
        }
    }
}

impl InstanceManagerOps for Arc<IndividualManager> {
    fn did(&self) -> DistributedId {
        self.core.did
    }
    fn layout(&self) -> Option<Arc<LayoutDescription>> {
        Some(self.core.layout.clone())
    }
    fn field_space(&self) -> Option<Arc<FieldSpace>> {
        Some(self.core.field_space.clone())
    }
    fn instance_domain(&self) -> Domain {
        self.core.instance_domain
    }
    fn tree_id(&self) -> Option<u32> {
        Some(self.core.tree_id)
    }
}
