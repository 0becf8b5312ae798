//! One logical instance replicated as point instances across the members of a [CollectiveMapping].
//!
//! The owner is the origin of the mapping. Every member hosts at least one point; the owner learns
//! where each point lives as members report their creations, and answers lookups from other nodes.
//! Data movement between the points travels down (and partial results up) the mapping tree rooted at
//! whichever member starts the operation.

use crate::collective_mapping::CollectiveMapping;
use crate::copy::{FieldBuffer, ReductionOpKind};
use crate::domain::{Domain, DomainPoint};
use crate::error::{InstanceError, InstanceResult};
use crate::event::{ApEvent, ApUserEvent, EventToken, RtUserEvent};
use crate::instance::physical::{unexpected_reply, PhysicalCore};
use crate::instance::{
    AllReduceTag, DistributedId, GcPriority, GcState, IndividualManager, InstanceManagerOps,
    PhysicalManagerRef,
};
use crate::layout::{FieldId, FieldSpace, LayoutConstraintKind, LayoutDescription};
use crate::memory::{MemoryId, PhysicalInstance};
use crate::messages::{
    BroadcastSource, DescriptorVariant, InstanceMessage, ManagerDescriptor, ReductionTarget,
    ReplyPayload,
};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

mod allreduce;
pub(crate) use allreduce::HAMMER_STAGE;
pub use allreduce::{AllReduceSchedule, StageStep};
use allreduce::StageBuffer;

/// Where a point instance lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PointLocation {
    pub node: usize,
    pub memory: MemoryId,
}

/// Same memory 0, same node 1, otherwise 2 plus the distance between node ids
pub fn memory_distance(a: MemoryId, b: MemoryId) -> usize {
    if a == b {
        0
    } else if a.node == b.node {
        1
    } else {
        2 + a.node.abs_diff(b.node)
    }
}

// resolved by whichever caller polls it; the future removes itself from `pending_points` when done
type PointLookup = Shared<BoxFuture<'static, InstanceResult<Option<PointLocation>>>>;

#[derive(Debug)]
struct LocalPoint {
    instance: PhysicalInstance,
    ready: ApUserEvent,
    finalized: bool,
}

#[derive(Debug)]
struct CreationTracker {
    table: BTreeMap<DomainPoint, PointLocation>,
    reported: BTreeSet<DomainPoint>,
    failed: bool,
    ready: RtUserEvent,
}

pub struct CollectiveManager {
    pub(crate) core: PhysicalCore,
    point_space: Domain,
    total_points: usize,
    mapping: CollectiveMapping,
    multi_instance: bool,
    redop: Mutex<Option<ReductionOpKind>>,
    local_points: Mutex<BTreeMap<DomainPoint, LocalPoint>>,
    remote_points: Mutex<HashMap<DomainPoint, PointLocation>>,
    pending_points: Mutex<HashMap<DomainPoint, PointLookup>>,
    // owner only
    creation: Mutex<CreationTracker>,
    stages: Mutex<HashMap<(AllReduceTag, u64), StageBuffer>>,
    allreduce_runs: Mutex<HashMap<AllReduceTag, u64>>,
}

impl std::fmt::Debug for CollectiveManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectiveManager")
            .field("core", &self.core)
            .field("point_space", &self.point_space)
            .field("mapping", &self.mapping)
            .field("multi_instance", &self.multi_instance)
            .field("local_points", &self.local_points.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CollectiveManager {
    pub(crate) fn new(
        core: PhysicalCore,
        point_space: Domain,
        mapping: CollectiveMapping,
        multi_instance: bool,
        redop: Option<ReductionOpKind>,
    ) -> CollectiveManager {
        CollectiveManager {
            core,
            point_space,
            total_points: point_space.volume(),
            mapping,
            multi_instance,
            redop: Mutex::new(redop),
            local_points: Mutex::new(BTreeMap::new()),
            remote_points: Mutex::new(HashMap::new()),
            pending_points: Mutex::new(HashMap::new()),
            creation: Mutex::new(CreationTracker {
                table: BTreeMap::new(),
                reported: BTreeSet::new(),
                failed: false,
                ready: RtUserEvent::new(),
            }),
            stages: Mutex::new(HashMap::new()),
            allreduce_runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn as_physical(self: &Arc<Self>) -> PhysicalManagerRef {
        PhysicalManagerRef::Collective(self.clone())
    }

    pub fn point_space(&self) -> Domain {
        self.point_space
    }

    pub fn total_points(&self) -> usize {
        self.total_points
    }

    pub fn mapping(&self) -> &CollectiveMapping {
        &self.mapping
    }

    pub fn is_multi_instance(&self) -> bool {
        self.multi_instance
    }

    /// Points hosted on this node
    pub fn local_points(&self) -> Vec<DomainPoint> {
        self.local_points.lock().keys().copied().collect()
    }

    pub fn point_instance(&self, point: DomainPoint) -> Option<PhysicalInstance> {
        self.local_points.lock().get(&point).map(|p| p.instance)
    }

    /// Makes broadcasts into the points fold with `redop` instead of overwriting
    pub fn set_redop(&self, redop: ReductionOpKind) {
        *self.redop.lock() = Some(redop);
    }

    pub fn clear_redop(&self) {
        *self.redop.lock() = None;
    }

    pub fn redop(&self) -> Option<ReductionOpKind> {
        *self.redop.lock()
    }

    //#####################################
    // Creation
    //#####################################

    pub(crate) fn record_point_instance(
        &self,
        point: DomainPoint,
        instance: PhysicalInstance,
    ) -> InstanceResult<()> {
        if !self.point_space.contains(point) {
            return Err(InstanceError::PointNotFound {
                did: self.core.did,
                point,
            });
        }
        if instance.memory.node != self.core.runtime.node() {
            return Err(InstanceError::UnknownMemory(instance.memory));
        }
        let mut points = self.local_points.lock();
        if points.contains_key(&point) || (!self.multi_instance && !points.is_empty()) {
            return Err(InstanceError::InvalidInstanceState {
                did: self.core.did,
                state: self.core.gc_state(),
                operation: "record_point_instance",
            });
        }
        points.insert(
            point,
            LocalPoint {
                instance,
                ready: ApUserEvent::new(),
                finalized: false,
            },
        );
        Ok(())
    }

    /// Marks a recorded point ready for use and reports it to the owner
    pub(crate) fn finalize_point_instance(&self, point: DomainPoint) -> InstanceResult<()> {
        let location = {
            let mut points = self.local_points.lock();
            let local = points.get_mut(&point).ok_or(InstanceError::PointNotFound {
                did: self.core.did,
                point,
            })?;
            if local.finalized {
                return Ok(());
            }
            local.finalized = true;
            local.ready.trigger();
            PointLocation {
                node: self.core.runtime.node(),
                memory: local.instance.memory,
            }
        };
        report_creation(&self.core.runtime, self.core.did, point, Some(location));
        Ok(())
    }

    pub(crate) fn handle_instance_creation(
        &self,
        point: DomainPoint,
        location: Option<PointLocation>,
    ) {
        let mut creation = self.creation.lock();
        if !creation.reported.insert(point) {
            tracing::error!(did = %self.core.did, ?point, "point reported twice");
            return;
        }
        match location {
            Some(location) => {
                creation.table.insert(point, location);
            }
            None => creation.failed = true,
        }
        if creation.reported.len() == self.total_points {
            tracing::debug!(did = %self.core.did, failed = creation.failed, "all points reported");
            creation.ready.trigger();
        }
    }

    /// Triggers on the owner once every point reported its creation, successful or not
    pub async fn instances_ready(&self) -> InstanceResult<()> {
        if !self.core.is_owner() {
            return Err(InstanceError::InvalidInstanceState {
                did: self.core.did,
                state: self.core.gc_state(),
                operation: "instances_ready",
            });
        }
        let ready = self.creation.lock().ready.event();
        ready.await;
        Ok(())
    }

    /// On the owner, whether some point failed to allocate
    pub fn creation_failed(&self) -> bool {
        self.creation.lock().failed
    }

    //#####################################
    // Point discovery
    //#####################################

    /// Finds the node and memory of `point`, asking the nearest member (and through it the owner)
    /// when it is not known locally. Concurrent lookups of one point share a single request.
    pub async fn find_or_forward_physical_instance(
        self: &Arc<Self>,
        point: DomainPoint,
    ) -> InstanceResult<PointLocation> {
        if let Some(instance) = self.point_instance(point) {
            return Ok(PointLocation {
                node: self.core.runtime.node(),
                memory: instance.memory,
            });
        }
        if let Some(location) = self.remote_points.lock().get(&point) {
            return Ok(*location);
        }
        let lookup = self
            .pending_points
            .lock()
            .entry(point)
            .or_insert_with(|| {
                let manager = self.clone();
                async move {
                    let found = manager.lookup_point(point).await;
                    if let Ok(Some(location)) = &found {
                        manager.remote_points.lock().insert(point, *location);
                    }
                    manager.pending_points.lock().remove(&point);
                    found
                }
                .boxed()
                .shared()
            })
            .clone();
        lookup.await?.ok_or(InstanceError::PointNotFound {
            did: self.core.did,
            point,
        })
    }

    /// Lookups that have been started but not resolved yet
    pub fn pending_point_lookups(&self) -> usize {
        self.pending_points.lock().len()
    }

    async fn lookup_point(&self, point: DomainPoint) -> InstanceResult<Option<PointLocation>> {
        if self.core.is_owner() {
            return Ok(self.owner_lookup(point).await);
        }
        let local = self.core.runtime.node();
        let target = if self.mapping.contains(local) {
            self.core.did.owner()
        } else {
            self.mapping.find_nearest(local)
        };
        let did = self.core.did;
        let rx = self
            .core
            .runtime
            .request(target, |request| InstanceMessage::PointRequest { did, point, request });
        match rx.await? {
            ReplyPayload::Point(location) => Ok(location),
            other => Err(unexpected_reply(did, &other)),
        }
    }

    async fn owner_lookup(&self, point: DomainPoint) -> Option<PointLocation> {
        loop {
            let wait = {
                let creation = self.creation.lock();
                if let Some(location) = creation.table.get(&point) {
                    return Some(*location);
                }
                if !self.point_space.contains(point) || creation.reported.contains(&point) {
                    return None;
                }
                creation.ready.event()
            };
            wait.await;
        }
    }

    /// Points whose instances live in `memory`
    pub async fn find_points_in_memory(&self, memory: MemoryId) -> InstanceResult<Vec<DomainPoint>> {
        if memory.node == self.core.runtime.node() {
            return Ok(self.points_in_local_memory(memory));
        }
        let did = self.core.did;
        let rx = self.core.runtime.request(memory.node, |request| {
            InstanceMessage::FindPointsRequest {
                did,
                memory,
                request,
            }
        });
        match rx.await? {
            ReplyPayload::Points(points) => Ok(points),
            other => Err(unexpected_reply(did, &other)),
        }
    }

    pub(crate) fn points_in_local_memory(&self, memory: MemoryId) -> Vec<DomainPoint> {
        self.local_points
            .lock()
            .iter()
            .filter(|(_, p)| p.instance.memory == memory)
            .map(|(point, _)| *point)
            .collect()
    }

    /// Points whose instances are closest to `memory`, see [memory_distance]
    pub async fn find_points_nearest_memory(
        &self,
        memory: MemoryId,
    ) -> InstanceResult<Vec<DomainPoint>> {
        if self.core.is_owner() {
            let ready = self.creation.lock().ready.event();
            ready.await;
            let creation = self.creation.lock();
            let best = creation
                .table
                .values()
                .map(|loc| memory_distance(loc.memory, memory))
                .min();
            return Ok(match best {
                Some(best) => creation
                    .table
                    .iter()
                    .filter(|(_, loc)| memory_distance(loc.memory, memory) == best)
                    .map(|(point, _)| *point)
                    .collect(),
                None => Vec::new(),
            });
        }
        let did = self.core.did;
        let rx = self.core.runtime.request(did.owner(), |request| {
            InstanceMessage::NearestPointsRequest {
                did,
                memory,
                request,
            }
        });
        match rx.await? {
            ReplyPayload::Points(points) => Ok(points),
            other => Err(unexpected_reply(did, &other)),
        }
    }

    //#####################################
    // Local data movement
    //#####################################

    fn local_point_instance(&self, point: DomainPoint) -> InstanceResult<PhysicalInstance> {
        self.point_instance(point)
            .ok_or(InstanceError::PointNotFound {
                did: self.core.did,
                point,
            })
    }

    pub fn gather_point(&self, point: DomainPoint, fids: &[FieldId]) -> InstanceResult<FieldBuffer> {
        let instance = self.local_point_instance(point)?;
        self.core.gather_instance(&instance, fids)
    }

    pub fn scatter_point(
        &self,
        point: DomainPoint,
        buffer: &FieldBuffer,
        fold: Option<ReductionOpKind>,
    ) -> InstanceResult<()> {
        let instance = self.local_point_instance(point)?;
        self.core.scatter_instance(&instance, buffer, fold)
    }

    pub fn fill_point(&self, point: DomainPoint, fids: &[FieldId], value: &[u8]) -> InstanceResult<()> {
        let instance = self.local_point_instance(point)?;
        self.core.fill_instance(&instance, fids, value)
    }

    fn identity_buffer(&self, fids: &[FieldId], redop: ReductionOpKind) -> InstanceResult<FieldBuffer> {
        let volume = self.core.instance_domain.volume();
        let mut buffer = FieldBuffer::new(volume);
        for (i, fid) in fids.iter().enumerate() {
            let size = self
                .core
                .layout
                .find_field_info(*fid)
                .ok_or(InstanceError::UnknownField(*fid))?
                .size;
            if size % 8 != 0 {
                return Err(InstanceError::LayoutUnsatisfiable {
                    kind: LayoutConstraintKind::Specialized,
                    field_index: Some(i),
                });
            }
            let lane = redop.identity().to_le_bytes();
            let bytes: Vec<u8> = lane.iter().copied().cycle().take(size * volume).collect();
            buffer.push_field(*fid, bytes);
        }
        Ok(buffer)
    }

    /// Every local point folded together
    pub(crate) fn local_partial(
        &self,
        fids: &[FieldId],
        redop: ReductionOpKind,
    ) -> InstanceResult<FieldBuffer> {
        let mut partial = self.identity_buffer(fids, redop)?;
        for point in self.local_points() {
            let contribution = self.gather_point(point, fids)?;
            partial.fold_from(&contribution, redop)?;
        }
        Ok(partial)
    }

    /// Writes `buffer` into every local point but `skip`, holding the field reservations of each point
    pub(crate) async fn write_local_points(
        &self,
        buffer: &FieldBuffer,
        skip: Option<DomainPoint>,
        fold: Option<ReductionOpKind>,
    ) -> InstanceResult<()> {
        let mask = self.core.field_space.mask_of(buffer.fields())?;
        for point in self.local_points() {
            if Some(point) == skip {
                continue;
            }
            let _held = self
                .core
                .lock_field_reservations(self.core.did, point, &mask)
                .await;
            self.scatter_point(point, buffer, fold)?;
        }
        Ok(())
    }

    fn apply_to_local_points(
        self: &Arc<Self>,
        buffer: FieldBuffer,
        skip: Option<DomainPoint>,
        fold: Option<ReductionOpKind>,
    ) -> ApEvent {
        let done = ApUserEvent::new();
        let event = done.event();
        let this = self.clone();
        self.core.runtime.submit(async move {
            if let Err(e) = this.write_local_points(&buffer, skip, fold).await {
                tracing::error!(did = %this.core.did, error = %e, "failed to update local points");
            }
            done.trigger();
        });
        event
    }

    //#####################################
    // Tree distribution
    //#####################################

    /// The member that roots trees for operations started here
    pub fn select_origin_space(&self) -> usize {
        let local = self.core.runtime.node();
        if self.mapping.contains(local) {
            local
        } else {
            self.mapping.find_nearest(local)
        }
    }

    /// The node holding `point`, which roots trees that read from it
    pub async fn select_source_space(self: &Arc<Self>, point: DomainPoint) -> InstanceResult<usize> {
        Ok(self.find_or_forward_physical_instance(point).await?.node)
    }

    fn send_to_children(
        &self,
        origin: usize,
        build: impl Fn(EventToken) -> InstanceMessage,
    ) -> InstanceResult<Vec<ApEvent>> {
        let mut children = Vec::new();
        self.mapping
            .get_children(origin, self.core.runtime.node(), &mut children)?;
        Ok(children
            .into_iter()
            .map(|child| {
                let (token, done) = self.core.runtime.events.create();
                self.core.runtime.send(child, build(token));
                done
            })
            .collect())
    }

    fn forward_to_origin(&self, origin: usize, build: impl FnOnce(EventToken) -> InstanceMessage) -> ApEvent {
        let (token, done) = self.core.runtime.events.create();
        self.core.runtime.send(origin, build(token));
        done
    }

    /// Writes `value` into `fids` of every point instance
    pub fn perform_collective_fill(
        self: &Arc<Self>,
        fids: &[FieldId],
        value: &[u8],
    ) -> InstanceResult<ApEvent> {
        if !self.core.check_usable("perform_collective_fill")? {
            return Ok(ApEvent::no_event());
        }
        let origin = self.select_origin_space();
        if origin == self.core.runtime.node() {
            return self.distribute_fill(origin, fids.to_vec(), value.to_vec());
        }
        let did = self.core.did;
        Ok(self.forward_to_origin(origin, |done| InstanceMessage::DistributeFill {
            did,
            origin,
            fields: fids.to_vec(),
            value: ByteBuf::from(value.to_vec()),
            done,
        }))
    }

    pub(crate) fn distribute_fill(
        &self,
        origin: usize,
        fields: Vec<FieldId>,
        value: Vec<u8>,
    ) -> InstanceResult<ApEvent> {
        let did = self.core.did;
        let mut events = self.send_to_children(origin, |done| InstanceMessage::DistributeFill {
            did,
            origin,
            fields: fields.clone(),
            value: ByteBuf::from(value.clone()),
            done,
        })?;
        for point in self.local_points() {
            self.fill_point(point, &fields, &value)?;
        }
        events.push(ApEvent::no_event());
        Ok(ApEvent::merge(events))
    }

    /// Copies `fids` of `src_point` into every other point instance
    pub async fn perform_collective_broadcast(
        self: &Arc<Self>,
        src_point: DomainPoint,
        fids: &[FieldId],
    ) -> InstanceResult<ApEvent> {
        if !self.core.check_usable("perform_collective_broadcast")? {
            return Ok(ApEvent::no_event());
        }
        let source = self.select_source_space(src_point).await?;
        if source == self.core.runtime.node() {
            return self.distribute_broadcast(source, fids.to_vec(), BroadcastSource::Point(src_point));
        }
        let did = self.core.did;
        Ok(self.forward_to_origin(source, |done| InstanceMessage::DistributeBroadcast {
            did,
            origin: source,
            fields: fids.to_vec(),
            source: BroadcastSource::Point(src_point),
            done,
        }))
    }

    /// Broadcasts data that did not come from one of the points, such as a reduction result
    pub(crate) fn broadcast_buffer(
        self: &Arc<Self>,
        fields: Vec<FieldId>,
        buffer: FieldBuffer,
    ) -> InstanceResult<ApEvent> {
        let origin = self.select_origin_space();
        if origin == self.core.runtime.node() {
            return self.distribute_broadcast(origin, fields, BroadcastSource::Buffer(buffer));
        }
        let did = self.core.did;
        Ok(self.forward_to_origin(origin, |done| InstanceMessage::DistributeBroadcast {
            did,
            origin,
            fields,
            source: BroadcastSource::Buffer(buffer),
            done,
        }))
    }

    pub(crate) fn distribute_broadcast(
        self: &Arc<Self>,
        origin: usize,
        fields: Vec<FieldId>,
        source: BroadcastSource,
    ) -> InstanceResult<ApEvent> {
        let (buffer, skip) = match source {
            BroadcastSource::Point(point) => (self.gather_point(point, &fields)?, Some(point)),
            BroadcastSource::Buffer(buffer) => (buffer, None),
        };
        let did = self.core.did;
        let mut events = self.send_to_children(origin, |done| InstanceMessage::DistributeBroadcast {
            did,
            origin,
            fields: fields.clone(),
            source: BroadcastSource::Buffer(buffer.clone()),
            done,
        })?;
        let fold = self.redop();
        events.push(self.apply_to_local_points(buffer, skip, fold));
        Ok(ApEvent::merge(events))
    }

    /// Folds `fids` of an individual instance on this node into every point instance
    pub fn perform_collective_reducecast(
        self: &Arc<Self>,
        source: &IndividualManager,
        fids: &[FieldId],
        redop: ReductionOpKind,
    ) -> InstanceResult<ApEvent> {
        if !self.core.check_usable("perform_collective_reducecast")? {
            return Ok(ApEvent::no_event());
        }
        let buffer = source.gather(fids)?;
        let origin = self.select_origin_space();
        if origin == self.core.runtime.node() {
            return self.distribute_reducecast(origin, redop, buffer);
        }
        let did = self.core.did;
        Ok(self.forward_to_origin(origin, |done| InstanceMessage::DistributeReducecast {
            did,
            origin,
            redop,
            buffer,
            done,
        }))
    }

    pub(crate) fn distribute_reducecast(
        self: &Arc<Self>,
        origin: usize,
        redop: ReductionOpKind,
        buffer: FieldBuffer,
    ) -> InstanceResult<ApEvent> {
        let did = self.core.did;
        let mut events = self.send_to_children(origin, |done| InstanceMessage::DistributeReducecast {
            did,
            origin,
            redop,
            buffer: buffer.clone(),
            done,
        })?;
        events.push(self.apply_to_local_points(buffer, None, Some(redop)));
        Ok(ApEvent::merge(events))
    }

    /// Folds `fids` of every point instance together and writes the result into `dst_point`
    pub async fn perform_collective_reduction(
        self: &Arc<Self>,
        fids: &[FieldId],
        redop: ReductionOpKind,
        dst_point: DomainPoint,
    ) -> InstanceResult<ApEvent> {
        if !self.core.check_usable("perform_collective_reduction")? {
            return Ok(ApEvent::no_event());
        }
        let target = self.find_or_forward_physical_instance(dst_point).await?;
        if target.node == self.core.runtime.node() {
            self.reduce_to_point(target.node, fids.to_vec(), redop, dst_point)
                .await?;
            return Ok(ApEvent::no_event());
        }
        let did = self.core.did;
        Ok(self.forward_to_origin(target.node, |done| InstanceMessage::DistributeReduction {
            did,
            origin: target.node,
            fields: fids.to_vec(),
            redop,
            target: ReductionTarget::Point {
                point: dst_point,
                done,
            },
        }))
    }

    pub(crate) async fn reduce_to_point(
        &self,
        origin: usize,
        fields: Vec<FieldId>,
        redop: ReductionOpKind,
        dst_point: DomainPoint,
    ) -> InstanceResult<()> {
        let result = self.reduce_subtree(origin, fields.clone(), redop).await?;
        let mask = self.core.field_space.mask_of(&fields)?;
        let _held = self
            .core
            .lock_field_reservations(self.core.did, dst_point, &mask)
            .await;
        self.scatter_point(dst_point, &result, None)
    }

    /// The fold of every point in the subtree rooted at this node
    pub(crate) async fn reduce_subtree(
        &self,
        origin: usize,
        fields: Vec<FieldId>,
        redop: ReductionOpKind,
    ) -> InstanceResult<FieldBuffer> {
        let did = self.core.did;
        let mut children = Vec::new();
        self.mapping
            .get_children(origin, self.core.runtime.node(), &mut children)?;
        let requests: Vec<_> = children
            .into_iter()
            .map(|child| {
                self.core.runtime.request(child, |request| {
                    InstanceMessage::DistributeReduction {
                        did,
                        origin,
                        fields: fields.clone(),
                        redop,
                        target: ReductionTarget::Parent { request },
                    }
                })
            })
            .collect();
        let mut partial = self.local_partial(&fields, redop)?;
        for rx in requests {
            match rx.await? {
                ReplyPayload::Buffer(Some(other)) => partial.fold_from(&other, redop)?,
                ReplyPayload::Buffer(None) => {
                    return Err(InstanceError::Transport(format!(
                        "a subtree of {} failed to reduce",
                        did
                    )))
                }
                other => return Err(unexpected_reply(did, &other)),
            }
        }
        Ok(partial)
    }

    /// Reduces every point of this instance and broadcasts the result into every point of `dst`
    pub async fn perform_collective_hourglass(
        self: &Arc<Self>,
        dst: &Arc<CollectiveManager>,
        fids: &[FieldId],
        redop: ReductionOpKind,
    ) -> InstanceResult<ApEvent> {
        if !self.core.check_usable("perform_collective_hourglass")?
            || !dst.core.check_usable("perform_collective_hourglass")?
        {
            return Ok(ApEvent::no_event());
        }
        let origin = self.select_origin_space();
        if origin == self.core.runtime.node() {
            return self.hourglass_from_origin(dst.core.did, fids.to_vec(), redop).await;
        }
        let did = self.core.did;
        let dst = dst.core.did;
        Ok(self.forward_to_origin(origin, |done| InstanceMessage::DistributeHourglass {
            did,
            dst,
            fields: fids.to_vec(),
            redop,
            done,
        }))
    }

    pub(crate) async fn hourglass_from_origin(
        self: &Arc<Self>,
        dst: DistributedId,
        fields: Vec<FieldId>,
        redop: ReductionOpKind,
    ) -> InstanceResult<ApEvent> {
        let origin = self.core.runtime.node();
        let buffer = self.reduce_subtree(origin, fields.clone(), redop).await?;
        let dst = self
            .core
            .runtime
            .find_or_request_manager(dst)
            .await?
            .as_collective_manager()?;
        dst.broadcast_buffer(fields, buffer)
    }

    /// Copies every point of `src` into the matching point of this instance
    pub async fn perform_collective_pointwise(
        self: &Arc<Self>,
        src: &Arc<CollectiveManager>,
        fids: &[FieldId],
    ) -> InstanceResult<ApEvent> {
        if src.point_space != self.point_space {
            return Err(InstanceError::LayoutUnsatisfiable {
                kind: LayoutConstraintKind::Dimension,
                field_index: None,
            });
        }
        if !self.core.check_usable("perform_collective_pointwise")? {
            return Ok(ApEvent::no_event());
        }
        let origin = self.select_origin_space();
        if origin == self.core.runtime.node() {
            return self.distribute_pointwise(origin, src.core.did, fids.to_vec());
        }
        let did = self.core.did;
        let src = src.core.did;
        Ok(self.forward_to_origin(origin, |done| InstanceMessage::DistributePointwise {
            did,
            origin,
            src,
            fields: fids.to_vec(),
            done,
        }))
    }

    pub(crate) fn distribute_pointwise(
        self: &Arc<Self>,
        origin: usize,
        src: DistributedId,
        fields: Vec<FieldId>,
    ) -> InstanceResult<ApEvent> {
        let did = self.core.did;
        let mut events = self.send_to_children(origin, |done| InstanceMessage::DistributePointwise {
            did,
            origin,
            src,
            fields: fields.clone(),
            done,
        })?;
        let done = ApUserEvent::new();
        events.push(done.event());
        let this = self.clone();
        self.core.runtime.submit(async move {
            if let Err(e) = this.pull_local_points(src, fields).await {
                tracing::error!(did = %this.core.did, %src, error = %e, "pointwise copy failed");
            }
            done.trigger();
        });
        Ok(ApEvent::merge(events))
    }

    async fn pull_local_points(&self, src: DistributedId, fields: Vec<FieldId>) -> InstanceResult<()> {
        let runtime = &self.core.runtime;
        let src = runtime
            .find_or_request_manager(src)
            .await?
            .as_collective_manager()?;
        let mask = self.core.field_space.mask_of(&fields)?;
        for point in self.local_points() {
            let location = src.find_or_forward_physical_instance(point).await?;
            let buffer = if location.node == runtime.node() {
                src.gather_point(point, &fields)?
            } else {
                let src_did = src.core.did;
                let rx = runtime.request(location.node, |request| InstanceMessage::DistributePoint {
                    did: src_did,
                    point,
                    fields: fields.clone(),
                    request,
                });
                match rx.await? {
                    ReplyPayload::Buffer(Some(buffer)) => buffer,
                    ReplyPayload::Buffer(None) => {
                        return Err(InstanceError::PointNotFound { did: src_did, point })
                    }
                    other => return Err(unexpected_reply(src_did, &other)),
                }
            };
            let _held = self
                .core
                .lock_field_reservations(self.core.did, point, &mask)
                .await;
            self.scatter_point(point, &buffer, None)?;
        }
        Ok(())
    }

    //#####################################
    // Lifecycle
    //#####################################

    /// Ships the metadata of this manager to a node outside the mapping
    pub fn send_manager(&self, target: usize) -> InstanceResult<()> {
        let did = self.core.did;
        if !self.core.is_owner() {
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
        if target != self.core.runtime.node() && !self.mapping.contains(target) {
            gc.remote_holders.insert(target);
            self.core
                .runtime
                .send(target, InstanceMessage::SendManager { descriptor });
        }
        Ok(())
    }

    pub(crate) fn descriptor(&self) -> ManagerDescriptor {
        ManagerDescriptor {
            did: self.core.did,
            field_space: (*self.core.field_space).clone(),
            constraints: self.core.layout.constraints().clone(),
            tree_id: self.core.tree_id,
            instance_domain: self.core.instance_domain,
            footprint: self.core.footprint,
            variant: DescriptorVariant::Collective {
                point_space: self.point_space,
                mapping: self.mapping.clone(),
                multi_instance: self.multi_instance,
                redop: self.redop(),
            },
        }
    }

    pub(crate) fn perform_deletion(&self) {
        let points = std::mem::take(&mut *self.local_points.lock());
        for (point, local) in points {
            match self.core.runtime.memory(local.instance.memory) {
                Ok(memory) => {
                    memory.remove_gc_priority(&self.core.did);
                    if !memory.free(&local.instance) {
                        tracing::error!(did = %self.core.did, ?point, "failed to free point instance");
                    }
                }
                Err(e) => tracing::error!(did = %self.core.did, error = %e, "point in unknown memory"),
            }
            self.core.reclaim_field_reservations(self.core.did, point);
        }
        self.stages.lock().clear();
        // abandoned lookups hold the manager alive
        self.pending_points.lock().clear();
        tracing::debug!(did = %self.core.did, "collective instance deleted");
    }

    pub(crate) fn apply_gc_priority(&self, priority: GcPriority) {
        for local in self.local_points.lock().values() {
            if let Ok(memory) = self.core.runtime.memory(local.instance.memory) {
                memory.set_gc_priority(self.core.did, priority);
            }
        }
    }
}

/// Tells the owner of `did` whether `point` was created
pub(crate) fn report_creation(
    runtime: &crate::runtime::Runtime,
    did: DistributedId,
    point: DomainPoint,
    location: Option<PointLocation>,
) {
    runtime.send(
        did.owner(),
        InstanceMessage::InstanceCreation {
            did,
            point,
            location,
        },
    );
}

impl InstanceManagerOps for Arc<CollectiveManager> {
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
