//! Turning a set of regions plus layout constraints into a physical instance.
//!
//! An [InstanceBuilder] resolves the constraints into a shared [LayoutDescription], reserves the
//! memory and wraps the allocation in the right kind of physical manager. Point instances of a
//! collective instance are created the same way, once per point, after every participating node has
//! been handed the same [PendingCollectiveManager].

use crate::collective_mapping::CollectiveMapping;
use crate::copy::ReductionOpKind;
use crate::domain::{Domain, DomainPoint, LogicalRegion};
use crate::error::{InstanceError, InstanceResult};
use crate::instance::collective::report_creation;
use crate::instance::physical::PhysicalCore;
use crate::instance::{
    DistributedId, IdKind, IndividualManager, InstanceClass, InstanceKind, InstanceManager,
    PhysicalManagerRef,
};
use crate::layout::{
    FieldSpace, LayoutConstraintKind, LayoutConstraintSet, LayoutDescription, SpecializedKind,
};
use crate::memory::{MemoryId, MemoryManager, PhysicalInstance};
use crate::runtime::Runtime;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A collective instance whose points have not all been created yet.
///
/// Made once (usually by the origin of `mapping`) and handed to every node that will create points.
/// The first point created on a node materializes the [CollectiveManager][crate::instance::CollectiveManager]
/// there; the owner of the returned id is always the origin of the mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingCollectiveManager {
    pub(crate) did: DistributedId,
    pub(crate) point_space: Domain,
    pub(crate) mapping: CollectiveMapping,
    pub(crate) multi_instance: bool,
    pub(crate) redop: Option<ReductionOpKind>,
}

impl PendingCollectiveManager {
    /// `multi_instance` allows a node to back more than one point
    pub fn new(
        runtime: &Runtime,
        point_space: Domain,
        mapping: CollectiveMapping,
        multi_instance: bool,
    ) -> PendingCollectiveManager {
        let did = runtime.allocate_did_owned_by(
            mapping.get_origin(),
            IdKind::Instance(InstanceClass {
                external: false,
                reduction: false,
                collective: true,
            }),
        );
        PendingCollectiveManager {
            did,
            point_space,
            mapping,
            multi_instance,
            redop: None,
        }
    }

    /// Marks the collective instance as a reduction instance folding with `redop`
    pub fn for_reductions(mut self, redop: ReductionOpKind) -> PendingCollectiveManager {
        if let IdKind::Instance(class) = self.did.kind() {
            self.did = DistributedId::new(
                self.did.owner(),
                self.did.serial(),
                IdKind::Instance(InstanceClass {
                    reduction: true,
                    ..class
                }),
            );
        }
        self.redop = Some(redop);
        self
    }

    pub fn did(&self) -> DistributedId {
        self.did
    }

    pub fn point_space(&self) -> Domain {
        self.point_space
    }

    pub fn mapping(&self) -> &CollectiveMapping {
        &self.mapping
    }

    pub fn is_multi_instance(&self) -> bool {
        self.multi_instance
    }

    /// Tells the owner that `point` will never be created, failing everyone waiting on the instance
    pub fn report_failure(&self, runtime: &Runtime, point: DomainPoint) {
        report_creation(runtime, self.did, point, None);
    }
}

/// Builds one physical instance (or one point of a collective instance) in a local memory.
///
/// # Examples
///
///```
/// use phys_instances::prelude::*;
///
/// let world = InstanceWorldBuilder::new().build();
/// let fs = FieldSpace::new(3, vec![(1, 4), (2, 8)]);
/// world.register_field_space(fs.clone());
/// let node = world.node(0);
/// let region = LogicalRegion::new(7, fs.id(), Domain::new(0, 100));
/// let manager = InstanceBuilder::new(node, vec![region], LayoutConstraintSet::new(vec![1, 2]), node.memories()[0].id())
///     .unbound()
///     .create_physical_instance()
///     .expect("unbound instance");
/// assert_eq!(manager.footprint(), 1200);
///```
pub struct InstanceBuilder<'a> {
    runtime: &'a Arc<Runtime>,
    regions: Vec<LogicalRegion>,
    constraints: LayoutConstraintSet,
    memory: MemoryId,
    kind: InstanceKind,
    external: Option<Vec<u8>>,
    collective: Option<(PendingCollectiveManager, DomainPoint)>,
    field_space: Option<Arc<FieldSpace>>,
    tree_id: u32,
    instance_domain: Domain,
    layout: Option<Arc<LayoutDescription>>,
    footprint: usize,
}

impl<'a> std::fmt::Debug for InstanceBuilder<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceBuilder")
            .field("node", &self.runtime.node())
            .field("regions", &self.regions)
            .field("memory", &self.memory)
            .field("kind", &self.kind)
            .field("footprint", &self.footprint)
            .finish()
    }
}

impl<'a> InstanceBuilder<'a> {
    pub fn new(
        runtime: &'a Arc<Runtime>,
        regions: Vec<LogicalRegion>,
        constraints: LayoutConstraintSet,
        memory: MemoryId,
    ) -> InstanceBuilder<'a> {
        InstanceBuilder {
            runtime,
            regions,
            constraints,
            memory,
            kind: InstanceKind::Internal,
            external: None,
            collective: None,
            field_space: None,
            tree_id: 0,
            instance_domain: Domain::empty(),
            layout: None,
            footprint: 0,
        }
    }

    /// Create `point` of the pending collective instance instead of an individual instance
    pub fn with_collective(mut self, pending: PendingCollectiveManager, point: DomainPoint) -> Self {
        self.collective = Some((pending, point));
        self
    }

    /// Allocate from the eager pool of the memory
    pub fn eager(mut self) -> Self {
        self.kind = InstanceKind::Eager;
        self
    }

    /// Defer the allocation; storage is bound later with
    /// [allocate_deferred][IndividualManager::allocate_deferred] or
    /// [update_physical_instance][IndividualManager::update_physical_instance]
    pub fn unbound(mut self) -> Self {
        self.kind = InstanceKind::Unbound;
        self
    }

    /// Use application provided bytes as the storage. An `owned` instance belongs to the runtime
    /// from now on, otherwise the bytes can be taken back with
    /// [detach_external_instance][IndividualManager::detach_external_instance].
    pub fn attach_external(mut self, bytes: Vec<u8>, owned: bool) -> Self {
        self.kind = if owned {
            InstanceKind::ExternalOwned
        } else {
            InstanceKind::ExternalAttached
        };
        self.external = Some(bytes);
        self
    }

    /// Resolves the field space, region tree and bounding domain of the regions
    pub fn initialize(&mut self) -> InstanceResult<()> {
        let first = self.regions.first().ok_or(InstanceError::LayoutUnsatisfiable {
            kind: LayoutConstraintKind::Dimension,
            field_index: None,
        })?;
        let (tree_id, fs_id) = (first.tree_id, first.field_space);
        let mut domain = Domain::empty();
        for region in self.regions.iter() {
            if region.field_space != fs_id || region.tree_id != tree_id {
                return Err(InstanceError::LayoutUnsatisfiable {
                    kind: LayoutConstraintKind::Field,
                    field_index: None,
                });
            }
            domain = domain.hull(&region.domain);
        }
        self.field_space = Some(self.runtime.field_space(fs_id)?);
        self.tree_id = tree_id;
        self.instance_domain = domain;
        Ok(())
    }

    /// Checks the constraints against the target memory and finds the shared layout
    pub fn compute_layout_parameters(&mut self) -> InstanceResult<Arc<LayoutDescription>> {
        if self.field_space.is_none() {
            self.initialize()?;
        }
        let memory = self.runtime.memory(self.memory)?;
        if let Some(kind) = self.constraints.memory_kind {
            if kind != memory.kind() {
                return Err(InstanceError::LayoutUnsatisfiable {
                    kind: LayoutConstraintKind::Memory,
                    field_index: None,
                });
            }
        }
        if self.constraints.specialized == SpecializedKind::Virtual {
            return Err(InstanceError::LayoutUnsatisfiable {
                kind: LayoutConstraintKind::Specialized,
                field_index: None,
            });
        }
        let field_space = self.field_space.as_ref().ok_or(InstanceError::LayoutUnsatisfiable {
            kind: LayoutConstraintKind::Field,
            field_index: None,
        })?;
        let layout = self.runtime.layouts().find_or_create(
            field_space,
            &self.constraints,
            self.instance_domain.dim(),
        )?;
        self.footprint = layout.footprint(self.instance_domain.volume());
        self.layout = Some(layout.clone());
        Ok(layout)
    }

    fn allocate(&mut self, memory: &MemoryManager) -> InstanceResult<Option<PhysicalInstance>> {
        match self.kind {
            InstanceKind::Unbound => Ok(None),
            InstanceKind::Internal => memory.allocate(self.footprint, false).map(Some),
            InstanceKind::Eager => memory.allocate(self.footprint, true).map(Some),
            InstanceKind::ExternalAttached | InstanceKind::ExternalOwned => {
                let bytes = self.external.take().unwrap_or_default();
                if bytes.len() < self.footprint {
                    return Err(InstanceError::AllocationFailed {
                        memory: memory.id(),
                        footprint: self.footprint,
                    });
                }
                Ok(Some(memory.attach_external(bytes)))
            }
        }
    }

    /// Reserves the memory and registers the new manager on this node
    #[tracing::instrument(skip(self), fields(node = self.runtime.node(), memory = %self.memory), level = "debug")]
    pub fn create_physical_instance(mut self) -> InstanceResult<PhysicalManagerRef> {
        let layout = match self.compute_layout_parameters() {
            Ok(layout) => layout,
            Err(e) => {
                if let Some((pending, point)) = self.collective.as_ref() {
                    pending.report_failure(self.runtime, *point);
                }
                return Err(e);
            }
        };
        let memory = self.runtime.memory(self.memory)?;
        let field_space = match self.field_space.clone() {
            Some(field_space) => field_space,
            None => return Err(InstanceError::UnknownFieldSpace(layout.field_space())),
        };
        match self.collective.take() {
            Some((pending, point)) => {
                let instance = match self.allocate(&memory) {
                    Ok(Some(instance)) => instance,
                    Ok(None) => {
                        pending.report_failure(self.runtime, point);
                        return Err(InstanceError::AllocationFailed {
                            memory: self.memory,
                            footprint: self.footprint,
                        });
                    }
                    Err(e) => {
                        pending.report_failure(self.runtime, point);
                        return Err(e);
                    }
                };
                let created = self
                    .runtime
                    .find_or_create_collective_manager(
                        &pending,
                        layout,
                        field_space,
                        self.tree_id,
                        self.instance_domain,
                        self.footprint,
                    )
                    .and_then(|manager| {
                        manager.record_point_instance(point, instance)?;
                        manager.finalize_point_instance(point)?;
                        Ok(manager)
                    });
                match created {
                    Ok(manager) => {
                        tracing::debug!(did = %pending.did, ?point, "created collective point instance");
                        Ok(manager.as_physical())
                    }
                    Err(e) => {
                        memory.free(&instance);
                        pending.report_failure(self.runtime, point);
                        Err(e)
                    }
                }
            }
            None => {
                let instance = self.allocate(&memory)?;
                let did = self.runtime.allocate_did(IdKind::Instance(InstanceClass {
                    external: self.kind.is_external(),
                    reduction: layout.redop().is_some(),
                    collective: false,
                }));
                let core = PhysicalCore::new(
                    did,
                    self.runtime.clone(),
                    layout,
                    field_space,
                    self.tree_id,
                    self.instance_domain,
                    self.footprint,
                );
                let manager = Arc::new(IndividualManager::new(core, self.memory, instance, self.kind));
                self.runtime
                    .register_manager(InstanceManager::Individual(manager.clone()));
                tracing::debug!(%did, footprint = self.footprint, kind = ?self.kind, "created individual instance");
                Ok(manager.as_physical())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{FieldSpace, MemoryKind};
    use crate::world::InstanceWorldBuilder;

    fn field_space() -> FieldSpace {
        FieldSpace::new(2, vec![(1, 8), (2, 4)])
    }

    #[test]
    fn regions_must_share_a_tree() {
        let world = InstanceWorldBuilder::new().build();
        world.register_field_space(field_space());
        let node = world.node(0);
        let mut builder = InstanceBuilder::new(
            node,
            vec![
                LogicalRegion::new(1, 2, Domain::new(0, 4)),
                LogicalRegion::new(2, 2, Domain::new(4, 8)),
            ],
            LayoutConstraintSet::new(vec![1]),
            node.memories()[0].id(),
        );
        assert!(matches!(
            builder.initialize(),
            Err(InstanceError::LayoutUnsatisfiable {
                kind: LayoutConstraintKind::Field,
                ..
            })
        ));
    }

    #[test]
    fn instance_domain_is_the_hull_of_the_regions() {
        let world = InstanceWorldBuilder::new().build();
        world.register_field_space(field_space());
        let node = world.node(0);
        let mut builder = InstanceBuilder::new(
            node,
            vec![
                LogicalRegion::new(1, 2, Domain::new(0, 4)),
                LogicalRegion::new(1, 2, Domain::new(8, 10)),
            ],
            LayoutConstraintSet::new(vec![1, 2]),
            node.memories()[0].id(),
        );
        let layout = builder.compute_layout_parameters().unwrap();
        assert_eq!(builder.instance_domain, Domain::new(0, 10));
        assert_eq!(builder.footprint, layout.footprint(10));
    }

    #[test]
    fn memory_kind_must_match() {
        let world = InstanceWorldBuilder::new().build();
        world.register_field_space(field_space());
        let node = world.node(0);
        let memory = node.memories()[0].clone();
        let wrong = match memory.kind() {
            MemoryKind::Framebuffer => MemoryKind::System,
            _ => MemoryKind::Framebuffer,
        };
        let err = InstanceBuilder::new(
            node,
            vec![LogicalRegion::new(1, 2, Domain::new(0, 4))],
            LayoutConstraintSet::new(vec![1]).in_memory_kind(wrong),
            memory.id(),
        )
        .create_physical_instance()
        .unwrap_err();
        assert!(matches!(
            err,
            InstanceError::LayoutUnsatisfiable {
                kind: LayoutConstraintKind::Memory,
                ..
            }
        ));
    }

    #[test]
    fn reduction_did_marks_the_class() {
        let world = InstanceWorldBuilder::new().with_num_nodes(2).build();
        let mapping = world.mapping(0..2);
        let pending = PendingCollectiveManager::new(world.node(1), Domain::new(0, 2), mapping, false)
            .for_reductions(ReductionOpKind::Sum);
        assert_eq!(pending.did().owner(), 0);
        assert!(pending.did().is_reduction_manager());
        assert!(pending.did().is_collective_manager());
    }
}
