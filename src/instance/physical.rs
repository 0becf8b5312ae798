//! State shared by every physical manager: the distributed garbage collector, the top view cache
//! and the per field reservations that serialize reductions into one point.
//!
//! The owner node is authoritative for the collection state. Other nodes that know about the manager
//! are remote holders and must each agree before the owner commits a collection.

use crate::copy::{self, FieldBuffer, ReductionOpKind};
use crate::domain::{Domain, DomainPoint};
use crate::env_var::CollectedPolicy;
use crate::error::{InstanceError, InstanceResult};
use crate::event::{RtEvent, RtUserEvent};
use crate::instance::rendezvous::RendezvousTable;
use crate::instance::{
    CollectiveManager, ContextId, DistributedId, GcDebugInfo, GcPriority, GcState, IdKind,
    IndividualManager, InstanceView, MapperId, ProcessorId, ReferenceSource,
};
use crate::layout::{
    CopySrcDstField, FieldId, FieldMask, FieldSpace, LayoutConstraintKind, LayoutDescription,
};
use crate::memory::PhysicalInstance;
use crate::messages::{InstanceMessage, ReplyPayload};
use crate::runtime::Runtime;

use futures::channel::oneshot;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Serializes concurrent folds into the same field of the same point
pub type Reservation = Arc<async_lock::Mutex<()>>;

#[derive(Debug)]
struct PendingCollection {
    epoch: u64,
    remaining: BTreeSet<usize>,
    accepted: Vec<usize>,
    refused: bool,
    cancelled: bool,
    done: Option<oneshot::Sender<InstanceResult<()>>>,
}

#[derive(Debug)]
pub(crate) struct GcTracker {
    pub(crate) state: GcState,
    references: HashMap<ReferenceSource, usize>,
    valid_references: HashMap<ReferenceSource, usize>,
    active_contexts: HashSet<ContextId>,
    pub(crate) remote_holders: BTreeSet<usize>,
    epoch: u64,
    pending: Option<PendingCollection>,
    // epoch and pre-collection state of an accepted request, on remote holders only
    remote_pending: Option<(u64, GcState)>,
    priorities: HashMap<(MapperId, ProcessorId), GcPriority>,
}

enum Admission {
    Admitted,
    Pending,
    Collected,
}

impl GcTracker {
    fn new() -> GcTracker {
        GcTracker {
            state: GcState::Collectable,
            references: HashMap::new(),
            valid_references: HashMap::new(),
            active_contexts: HashSet::new(),
            remote_holders: BTreeSet::new(),
            epoch: 0,
            pending: None,
            remote_pending: None,
            priorities: HashMap::new(),
        }
    }

    fn reference_count(&self) -> usize {
        self.references.values().sum()
    }

    fn valid_count(&self) -> usize {
        self.valid_references.values().sum()
    }

    fn unreferenced(&self) -> bool {
        self.references.is_empty() && self.valid_references.is_empty() && self.active_contexts.is_empty()
    }

    fn recompute(&mut self) {
        if matches!(self.state, GcState::PendingCollected | GcState::Collected) {
            return;
        }
        self.state = if self.valid_count() > 0 {
            GcState::Valid
        } else if self.reference_count() > 0 {
            GcState::Acquired
        } else {
            GcState::Collectable
        };
    }

    fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending.as_mut() {
            pending.cancelled = true;
        }
        self.state = GcState::Acquired;
    }

    fn admit(&mut self, is_owner: bool) -> Admission {
        match self.state {
            GcState::Collected => Admission::Collected,
            GcState::PendingCollected if is_owner => {
                self.cancel_pending();
                Admission::Admitted
            }
            GcState::PendingCollected => Admission::Pending,
            _ => Admission::Admitted,
        }
    }

    fn can_collect(&self) -> bool {
        matches!(
            self.state,
            GcState::Valid | GcState::Acquired | GcState::Collectable
        ) && self.pending.is_none()
            && self.unreferenced()
    }

    fn effective_priority(&self) -> Option<GcPriority> {
        self.priorities.values().min().copied()
    }
}

/// Caches the top level instance view per (context, logical owner, replication) so that concurrent
/// requests construct it once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopViewKey {
    pub context: ContextId,
    pub logical_owner: usize,
    pub replication: Option<u64>,
}

/// Held by the task constructing a top view. Dropping it, on completion or cancellation, lets the
/// waiters for the same key look again.
struct PendingTopView<'a> {
    views: &'a Mutex<TopViewCache>,
    key: TopViewKey,
    creator: RtUserEvent,
}

impl Drop for PendingTopView<'_> {
    fn drop(&mut self) {
        self.views.lock().pending.remove(&self.key);
        self.creator.trigger();
    }
}

#[derive(Debug, Default)]
struct TopViewCache {
    views: HashMap<TopViewKey, Arc<InstanceView>>,
    pending: HashMap<TopViewKey, RtEvent>,
    // owner only, one view id per key for the whole cluster
    assigned: HashMap<TopViewKey, DistributedId>,
}

pub(crate) struct PhysicalCore {
    pub(crate) did: DistributedId,
    pub(crate) runtime: Arc<Runtime>,
    pub(crate) layout: Arc<LayoutDescription>,
    pub(crate) field_space: Arc<FieldSpace>,
    pub(crate) tree_id: u32,
    pub(crate) instance_domain: Domain,
    pub(crate) footprint: usize,
    pub(crate) gc: Mutex<GcTracker>,
    views: Mutex<TopViewCache>,
    reservations: Mutex<HashMap<(DistributedId, DomainPoint), BTreeMap<usize, Reservation>>>,
    pub(crate) rendezvous: Mutex<RendezvousTable>,
}

impl std::fmt::Debug for PhysicalCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalCore")
            .field("did", &self.did)
            .field("node", &self.runtime.node())
            .field("instance_domain", &self.instance_domain)
            .field("footprint", &self.footprint)
            .field("state", &self.gc.lock().state)
            .finish()
    }
}

impl PhysicalCore {
    pub(crate) fn new(
        did: DistributedId,
        runtime: Arc<Runtime>,
        layout: Arc<LayoutDescription>,
        field_space: Arc<FieldSpace>,
        tree_id: u32,
        instance_domain: Domain,
        footprint: usize,
    ) -> PhysicalCore {
        PhysicalCore {
            did,
            runtime,
            layout,
            field_space,
            tree_id,
            instance_domain,
            footprint,
            gc: Mutex::new(GcTracker::new()),
            views: Mutex::new(TopViewCache::default()),
            reservations: Mutex::new(HashMap::new()),
            rendezvous: Mutex::new(RendezvousTable::default()),
        }
    }

    /// Top view constructions in flight on this node
    pub(crate) fn pending_top_views(&self) -> usize {
        self.views.lock().pending.len()
    }

    pub(crate) fn is_owner(&self) -> bool {
        self.runtime.node() == self.did.owner()
    }

    pub(crate) fn gc_state(&self) -> GcState {
        self.gc.lock().state
    }

    pub(crate) fn add_remote_holder(&self, node: usize) {
        if node != self.runtime.node() {
            self.gc.lock().remote_holders.insert(node);
        }
    }

    /// Errors (or quietly refuses) according to the configured policy for use after collection
    pub(crate) fn collected(&self, operation: &'static str) -> InstanceResult<bool> {
        match self.runtime.config().collected_policy {
            CollectedPolicy::Error => Err(InstanceError::InvalidInstanceState {
                did: self.did,
                state: GcState::Collected,
                operation,
            }),
            CollectedPolicy::Ignore => {
                tracing::warn!(did = %self.did, operation, "ignoring use of a collected instance");
                Ok(false)
            }
        }
    }

    /// Ok(true) if data movement on this instance may proceed
    pub(crate) fn check_usable(&self, operation: &'static str) -> InstanceResult<bool> {
        match self.gc_state() {
            GcState::Collected => self.collected(operation),
            _ => Ok(true),
        }
    }

    pub(crate) fn debug_info(&self) -> GcDebugInfo {
        let gc = self.gc.lock();
        GcDebugInfo {
            did: self.did,
            node: self.runtime.node(),
            state: gc.state,
            references: gc.reference_count(),
            valid_references: gc.valid_count(),
            active_contexts: gc.active_contexts.len(),
            remote_holders: gc.remote_holders.iter().copied().collect(),
            pending_responses: gc.pending.as_ref().map_or(0, |p| p.remaining.len()),
        }
    }

    fn view_id_for(&self, key: TopViewKey) -> DistributedId {
        let runtime = &self.runtime;
        *self
            .views
            .lock()
            .assigned
            .entry(key)
            .or_insert_with(|| runtime.allocate_did(IdKind::View))
    }

    pub fn find_field_reservations(
        &self,
        view: DistributedId,
        point: DomainPoint,
        mask: &FieldMask,
    ) -> Vec<Reservation> {
        let mut reservations = self.reservations.lock();
        let per_field = reservations.entry((view, point)).or_default();
        // BTreeMap iteration keeps the acquisition order identical for every caller
        mask.indices()
            .map(|idx| per_field.entry(idx).or_default().clone())
            .collect()
    }

    pub fn reclaim_field_reservations(&self, view: DistributedId, point: DomainPoint) -> usize {
        self.reservations
            .lock()
            .remove(&(view, point))
            .map_or(0, |r| r.len())
    }

    /// Locks the reservations for `mask` at `point` in field order
    pub(crate) async fn lock_field_reservations(
        &self,
        view: DistributedId,
        point: DomainPoint,
        mask: &FieldMask,
    ) -> HeldReservations<'_> {
        // declared first so a cancelled lock drops the reservation handles before releasing
        let mut held = HeldReservations {
            core: self,
            key: (view, point),
            guards: Vec::new(),
        };
        let reservations = self.find_field_reservations(view, point, mask);
        for reservation in reservations.iter() {
            held.guards.push(reservation.lock_arc().await);
        }
        held
    }

    fn release_field_reservations(&self, key: (DistributedId, DomainPoint)) {
        let mut reservations = self.reservations.lock();
        let idle = reservations.get(&key).map_or(false, |per_field| {
            per_field.values().all(|r| Arc::strong_count(r) == 1)
        });
        if idle {
            reservations.remove(&key);
        }
    }

    pub(crate) fn reserved_points(&self) -> usize {
        self.reservations.lock().len()
    }

    /// Copy descriptors for `fids`, overwriting unless `fold` names a reduction
    pub(crate) fn copy_fields(
        &self,
        fids: &[FieldId],
        fold: Option<ReductionOpKind>,
    ) -> InstanceResult<Vec<CopySrcDstField>> {
        let mut fields = self
            .layout
            .compute_copy_offsets_for_fields(fids, self.instance_domain.volume())?;
        for field in fields.iter_mut() {
            match fold {
                Some(redop) => field.set_redop(redop),
                None => field.clear_redop(),
            }
        }
        Ok(fields)
    }

    pub(crate) fn fill_instance(
        &self,
        instance: &PhysicalInstance,
        fids: &[FieldId],
        value: &[u8],
    ) -> InstanceResult<()> {
        let fields = self.copy_fields(fids, None)?;
        if let Some(i) = fields.iter().position(|f| f.size != value.len()) {
            return Err(InstanceError::LayoutUnsatisfiable {
                kind: LayoutConstraintKind::Field,
                field_index: Some(i),
            });
        }
        let volume = self.instance_domain.volume();
        self.runtime
            .memory(instance.memory)?
            .with_bytes_mut(instance, |bytes| copy::fill(bytes, &fields, volume, value))
    }

    pub(crate) fn gather_instance(
        &self,
        instance: &PhysicalInstance,
        fids: &[FieldId],
    ) -> InstanceResult<FieldBuffer> {
        let fields = self.copy_fields(fids, None)?;
        let volume = self.instance_domain.volume();
        self.runtime
            .memory(instance.memory)?
            .with_bytes(instance, |bytes| copy::gather(bytes, &fields, volume))
    }

    pub(crate) fn scatter_instance(
        &self,
        instance: &PhysicalInstance,
        buffer: &FieldBuffer,
        fold: Option<ReductionOpKind>,
    ) -> InstanceResult<()> {
        let fields = self.copy_fields(buffer.fields(), fold)?;
        let volume = self.instance_domain.volume();
        self.runtime
            .memory(instance.memory)?
            .with_bytes_mut(instance, |bytes| copy::scatter(bytes, &fields, volume, buffer))?
    }
}

/// Field reservations held at one point. Dropping it unlocks them and forgets the point once nobody
/// else is waiting on it.
#[must_use = "the reservations unlock when this drops"]
pub struct HeldReservations<'a> {
    core: &'a PhysicalCore,
    key: (DistributedId, DomainPoint),
    guards: Vec<async_lock::MutexGuardArc<()>>,
}

impl Drop for HeldReservations<'_> {
    fn drop(&mut self) {
        self.guards.clear();
        self.core.release_field_reservations(self.key);
    }
}

/// Completes with the outcome of a collection started by [PhysicalManagerRef::collect]
#[must_use = "collections report refusals through this future"]
#[derive(Debug)]
pub struct GcCollection {
    did: DistributedId,
    rx: oneshot::Receiver<InstanceResult<()>>,
}

impl Future for GcCollection {
    type Output = InstanceResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let did = self.did;
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(res)) => Poll::Ready(res),
            Poll::Ready(Err(_)) => Poll::Ready(Err(InstanceError::Transport(format!(
                "collection of {} abandoned",
                did
            )))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A handle on either kind of physical manager carrying the garbage collection interface
#[derive(Debug, Clone)]
pub enum PhysicalManagerRef {
    Individual(Arc<IndividualManager>),
    Collective(Arc<CollectiveManager>),
}

impl PhysicalManagerRef {
    pub(crate) fn core(&self) -> &PhysicalCore {
        match self {
            PhysicalManagerRef::Individual(m) => &m.core,
            PhysicalManagerRef::Collective(m) => &m.core,
        }
    }

    pub fn did(&self) -> DistributedId {
        self.core().did
    }

    pub fn layout(&self) -> &Arc<LayoutDescription> {
        &self.core().layout
    }

    pub fn instance_domain(&self) -> Domain {
        self.core().instance_domain
    }

    pub fn footprint(&self) -> usize {
        self.core().footprint
    }

    pub fn as_individual(&self) -> Option<&Arc<IndividualManager>> {
        match self {
            PhysicalManagerRef::Individual(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_collective(&self) -> Option<&Arc<CollectiveManager>> {
        match self {
            PhysicalManagerRef::Collective(m) => Some(m),
            _ => None,
        }
    }

    pub fn gc_state(&self) -> GcState {
        self.core().gc_state()
    }

    pub fn remote_holders(&self) -> Vec<usize> {
        self.core().gc.lock().remote_holders.iter().copied().collect()
    }

    //#####################################
    // References
    //#####################################

    /// Adds a reference on behalf of `source`.
    ///
    /// Returns false when a remote holder has agreed to a pending collection; use
    /// [acquire_instance_async][Self::acquire_instance_async] to ask the owner to cancel it.
    pub fn acquire_instance(&self, source: ReferenceSource) -> InstanceResult<bool> {
        let core = self.core();
        let mut gc = core.gc.lock();
        match gc.admit(core.is_owner()) {
            Admission::Collected => {
                drop(gc);
                return core.collected("acquire_instance");
            }
            Admission::Pending => return Ok(false),
            Admission::Admitted => {}
        }
        *gc.references.entry(source).or_default() += 1;
        gc.recompute();
        tracing::trace!(did = %core.did, ?source, state = ?gc.state, "acquired");
        Ok(true)
    }

    /// Like [acquire_instance][Self::acquire_instance] but asks the owner to cancel a pending
    /// collection the local node already agreed to. Returns false only if the collection committed.
    pub async fn acquire_instance_async(&self, source: ReferenceSource) -> InstanceResult<bool> {
        if self.acquire_instance(source)? {
            return Ok(true);
        }
        let core = self.core();
        if core.gc_state() == GcState::Collected {
            return Ok(false);
        }
        let did = core.did;
        let rx = core
            .runtime
            .request(did.owner(), |request| InstanceMessage::GcAcquireRequest { did, request });
        let acquired = match rx.await? {
            ReplyPayload::Bool(acquired) => acquired,
            other => return Err(unexpected_reply(did, &other)),
        };
        if !acquired {
            return Ok(false);
        }
        let mut gc = core.gc.lock();
        match gc.state {
            GcState::Collected => {
                drop(gc);
                return core.collected("acquire_instance");
            }
            GcState::PendingCollected => {
                gc.state = GcState::Acquired;
                gc.remote_pending = None;
            }
            _ => {}
        }
        *gc.references.entry(source).or_default() += 1;
        gc.recompute();
        Ok(true)
    }

    /// Acquires a reference that is released when the returned guard drops
    pub fn acquire_guard(&self, source: ReferenceSource) -> InstanceResult<Option<InstanceRef>> {
        Ok(self.acquire_instance(source)?.then(|| InstanceRef {
            manager: self.clone(),
            source,
        }))
    }

    pub fn release_instance(&self, source: ReferenceSource) -> InstanceResult<()> {
        let core = self.core();
        let mut gc = core.gc.lock();
        match gc.references.get_mut(&source) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                gc.references.remove(&source);
            }
            None => {
                return Err(InstanceError::InvalidInstanceState {
                    did: core.did,
                    state: gc.state,
                    operation: "release_instance",
                })
            }
        }
        gc.recompute();
        Ok(())
    }

    /// A valid reference marks the instance as holding data some view still needs
    pub fn add_valid_reference(&self, source: ReferenceSource) -> InstanceResult<bool> {
        let core = self.core();
        let mut gc = core.gc.lock();
        match gc.admit(core.is_owner()) {
            Admission::Collected => {
                drop(gc);
                return core.collected("add_valid_reference");
            }
            Admission::Pending => return Ok(false),
            Admission::Admitted => {}
        }
        *gc.valid_references.entry(source).or_default() += 1;
        gc.recompute();
        Ok(true)
    }

    pub fn remove_valid_reference(&self, source: ReferenceSource) -> InstanceResult<()> {
        let core = self.core();
        let mut gc = core.gc.lock();
        match gc.valid_references.get_mut(&source) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                gc.valid_references.remove(&source);
            }
            None => {
                return Err(InstanceError::InvalidInstanceState {
                    did: core.did,
                    state: gc.state,
                    operation: "remove_valid_reference",
                })
            }
        }
        gc.recompute();
        Ok(())
    }

    pub fn register_active_context(&self, context: ContextId) -> InstanceResult<bool> {
        let core = self.core();
        let mut gc = core.gc.lock();
        match gc.admit(core.is_owner()) {
            Admission::Collected => {
                drop(gc);
                return core.collected("register_active_context");
            }
            Admission::Pending => return Ok(false),
            Admission::Admitted => {}
        }
        gc.active_contexts.insert(context);
        Ok(true)
    }

    pub fn unregister_active_context(&self, context: ContextId) -> bool {
        self.core().gc.lock().active_contexts.remove(&context)
    }

    //#####################################
    // Collection
    //#####################################

    /// Whether nothing on this node prevents a collection
    pub fn can_collect(&self) -> bool {
        self.core().gc.lock().can_collect()
    }

    /// Starts collecting the instance. Only the owner may collect; returns None when the instance is
    /// still referenced locally, a collection is already in flight, or this node is not the owner.
    pub fn collect(&self) -> Option<GcCollection> {
        let core = self.core();
        if !core.is_owner() {
            return None;
        }
        let mut gc = core.gc.lock();
        if !gc.can_collect() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        let collection = GcCollection { did: core.did, rx };
        gc.state = GcState::PendingCollected;
        if gc.remote_holders.is_empty() {
            self.commit_collection(gc);
            let _ = tx.send(Ok(()));
            return Some(collection);
        }
        gc.epoch += 1;
        let epoch = gc.epoch;
        tracing::debug!(did = %core.did, epoch, holders = ?gc.remote_holders, "requesting collection");
        for holder in gc.remote_holders.iter() {
            core.runtime.send(
                *holder,
                InstanceMessage::GcRequest {
                    did: core.did,
                    epoch,
                },
            );
        }
        gc.pending = Some(PendingCollection {
            epoch,
            remaining: gc.remote_holders.clone(),
            accepted: Vec::new(),
            refused: false,
            cancelled: false,
            done: Some(tx),
        });
        Some(collection)
    }

    fn commit_collection(&self, mut gc: MutexGuard<GcTracker>) {
        let core = self.core();
        gc.state = GcState::Collected;
        // deletion notices go out under the lock so no later message for this epoch can overtake them
        for holder in gc.remote_holders.iter() {
            core.runtime
                .send(*holder, InstanceMessage::ManagerDeletion { did: core.did });
        }
        drop(gc);
        tracing::debug!(did = %core.did, "collected");
        self.perform_local_deletion();
        core.runtime.unregister_manager(&core.did);
    }

    pub(crate) fn handle_gc_request(&self, src: usize, epoch: u64) {
        let core = self.core();
        let mut gc = core.gc.lock();
        let accepted = match gc.state {
            GcState::Collected => true,
            GcState::PendingCollected => gc.remote_pending.map_or(false, |(e, _)| e == epoch),
            _ => gc.unreferenced(),
        };
        if accepted && !matches!(gc.state, GcState::PendingCollected | GcState::Collected) {
            gc.remote_pending = Some((epoch, gc.state));
            gc.state = GcState::PendingCollected;
        }
        tracing::trace!(did = %core.did, epoch, accepted, "collection request");
        core.runtime.send(
            src,
            InstanceMessage::GcResponse {
                did: core.did,
                epoch,
                accepted,
            },
        );
    }

    pub(crate) fn handle_gc_response(&self, src: usize, epoch: u64, accepted: bool) {
        let core = self.core();
        let mut gc = core.gc.lock();
        let finished = match gc.pending.as_mut() {
            Some(pending) if pending.epoch == epoch => {
                pending.remaining.remove(&src);
                if accepted {
                    pending.accepted.push(src);
                } else {
                    pending.refused = true;
                }
                pending.remaining.is_empty()
            }
            _ => {
                tracing::debug!(did = %core.did, epoch, src, "stale collection response");
                false
            }
        };
        if !finished {
            return;
        }
        let mut pending = match gc.pending.take() {
            Some(pending) => pending,
            None => return,
        };
        let done = pending.done.take();
        if pending.refused || pending.cancelled {
            for node in pending.accepted.iter() {
                core.runtime
                    .send(*node, InstanceMessage::GcFailed { did: core.did, epoch });
            }
            if gc.state == GcState::PendingCollected {
                gc.state = GcState::Acquired;
            }
            drop(gc);
            tracing::debug!(did = %core.did, epoch, "collection refused");
            if let Some(done) = done {
                let _ = done.send(Err(InstanceError::GcRaceRefused { did: core.did }));
            }
        } else {
            self.commit_collection(gc);
            if let Some(done) = done {
                let _ = done.send(Ok(()));
            }
        }
    }

    pub(crate) fn handle_gc_failed(&self, epoch: u64) {
        let mut gc = self.core().gc.lock();
        if let Some((pending_epoch, prior)) = gc.remote_pending {
            if pending_epoch == epoch && gc.state == GcState::PendingCollected {
                gc.state = prior;
                gc.remote_pending = None;
                gc.recompute();
            }
        }
    }

    pub(crate) fn handle_gc_acquire_request(&self, src: usize, request: u64) {
        let core = self.core();
        let mut gc = core.gc.lock();
        let acquired = match gc.state {
            GcState::Collected => false,
            GcState::PendingCollected => {
                gc.cancel_pending();
                true
            }
            _ => true,
        };
        core.runtime
            .send(src, InstanceMessage::GcAcquireResponse { request, acquired });
    }

    /// The owner told us the instance is gone
    pub(crate) fn handle_deletion(&self) {
        let core = self.core();
        {
            let mut gc = core.gc.lock();
            if gc.state == GcState::Collected {
                return;
            }
            gc.state = GcState::Collected;
            gc.remote_pending = None;
        }
        self.perform_local_deletion();
        core.runtime.unregister_manager(&core.did);
    }

    fn perform_local_deletion(&self) {
        match self {
            PhysicalManagerRef::Individual(m) => m.perform_deletion(),
            PhysicalManagerRef::Collective(m) => m.perform_deletion(),
        }
    }

    //#####################################
    // Priorities and debugging
    //#####################################

    /// Records one (mapper, processor) vote; the owner applies the minimum of all votes
    pub fn set_garbage_collection_priority(
        &self,
        mapper: MapperId,
        processor: ProcessorId,
        priority: GcPriority,
    ) {
        let core = self.core();
        if core.is_owner() {
            self.update_priority_vote(mapper, processor, priority);
        } else {
            core.runtime.send(
                core.did.owner(),
                InstanceMessage::GcPriorityUpdate {
                    did: core.did,
                    mapper,
                    processor,
                    priority,
                },
            );
        }
    }

    pub(crate) fn update_priority_vote(
        &self,
        mapper: MapperId,
        processor: ProcessorId,
        priority: GcPriority,
    ) {
        let effective = {
            let mut gc = self.core().gc.lock();
            gc.priorities.insert((mapper, processor), priority);
            gc.effective_priority()
        };
        if let Some(effective) = effective {
            match self {
                PhysicalManagerRef::Individual(m) => m.apply_gc_priority(effective),
                PhysicalManagerRef::Collective(m) => m.apply_gc_priority(effective),
            }
        }
    }

    pub fn effective_gc_priority(&self) -> Option<GcPriority> {
        self.core().gc.lock().effective_priority()
    }

    pub fn gc_debug_info(&self) -> GcDebugInfo {
        self.core().debug_info()
    }

    /// The collection state as the owner sees it
    pub async fn owner_gc_debug_info(&self) -> InstanceResult<GcDebugInfo> {
        let core = self.core();
        if core.is_owner() {
            return Ok(core.debug_info());
        }
        let did = core.did;
        let rx = core
            .runtime
            .request(did.owner(), |request| InstanceMessage::GcDebugRequest { did, request });
        match rx.await? {
            ReplyPayload::Debug(info) => Ok(info),
            other => Err(unexpected_reply(did, &other)),
        }
    }

    //#####################################
    // Top views
    //#####################################

    /// Returns the view of this instance for `context`, constructing it on first use.
    ///
    /// Concurrent callers with the same key wait for the first construction instead of racing it.
    pub async fn find_or_create_instance_top_view(
        &self,
        context: ContextId,
        logical_owner: usize,
        replication: Option<u64>,
    ) -> InstanceResult<Arc<InstanceView>> {
        let core = self.core();
        let key = TopViewKey {
            context,
            logical_owner,
            replication,
        };
        let construction = loop {
            let wait = {
                let mut views = core.views.lock();
                if let Some(view) = views.views.get(&key) {
                    return Ok(view.clone());
                }
                match views.pending.get(&key) {
                    Some(event) => event.clone(),
                    None => {
                        let creator = RtUserEvent::new();
                        views.pending.insert(key, creator.event());
                        break PendingTopView {
                            views: &core.views,
                            key,
                            creator,
                        };
                    }
                }
            };
            wait.await;
        };
        let result = self.construct_top_view(key).await;
        if let Ok(view) = &result {
            core.views.lock().views.insert(key, view.clone());
        }
        drop(construction);
        result
    }

    pub fn pending_top_views(&self) -> usize {
        self.core().pending_top_views()
    }

    async fn construct_top_view(&self, key: TopViewKey) -> InstanceResult<Arc<InstanceView>> {
        let core = self.core();
        let did = core.did;
        let runtime = &core.runtime;
        let view_did = if core.is_owner() {
            core.view_id_for(key)
        } else {
            let rx = runtime.request(did.owner(), |request| InstanceMessage::TopViewRequest {
                did,
                key,
                request,
            });
            match rx.await? {
                ReplyPayload::Did(view) => view,
                other => return Err(unexpected_reply(did, &other)),
            }
        };
        if !self.add_valid_reference(ReferenceSource::View(view_did))? {
            return Err(InstanceError::InvalidInstanceState {
                did,
                state: GcState::PendingCollected,
                operation: "find_or_create_instance_top_view",
            });
        }
        let view = Arc::new(InstanceView {
            did: view_did,
            manager: did,
            context: key.context,
            logical_owner: key.logical_owner,
            creator: runtime.node(),
        });
        runtime.register_view(view.clone());
        if key.logical_owner != runtime.node() {
            runtime.send(
                key.logical_owner,
                InstanceMessage::TopViewCreation {
                    view: view_did,
                    manager: did,
                    creator: runtime.node(),
                },
            );
        }
        tracing::debug!(%did, view = %view_did, ?key, "top view created");
        Ok(view)
    }

    pub(crate) fn handle_top_view_request(&self, src: usize, key: TopViewKey, request: u64) {
        let core = self.core();
        let view = core.view_id_for(key);
        core.runtime
            .send(src, InstanceMessage::TopViewResponse { request, view });
    }

    /// Drops the cached view for `context` and the valid reference it held
    pub fn release_top_view(&self, view: &InstanceView) -> InstanceResult<()> {
        let core = self.core();
        core.views
            .lock()
            .views
            .retain(|_, cached| cached.did != view.did);
        core.runtime.unregister_view(&view.did);
        self.remove_valid_reference(ReferenceSource::View(view.did))
    }

    //#####################################
    // Reservations
    //#####################################

    pub fn find_field_reservations(
        &self,
        view: DistributedId,
        point: DomainPoint,
        mask: &FieldMask,
    ) -> Vec<Reservation> {
        self.core().find_field_reservations(view, point, mask)
    }

    pub fn reclaim_field_reservations(&self, view: DistributedId, point: DomainPoint) -> usize {
        self.core().reclaim_field_reservations(view, point)
    }

    pub async fn lock_field_reservations(
        &self,
        view: DistributedId,
        point: DomainPoint,
        mask: &FieldMask,
    ) -> HeldReservations<'_> {
        self.core().lock_field_reservations(view, point, mask).await
    }

    /// Points that currently have reservations on this node
    pub fn reserved_points(&self) -> usize {
        self.core().reserved_points()
    }
}

pub(crate) fn unexpected_reply(did: DistributedId, reply: &ReplyPayload) -> InstanceError {
    InstanceError::Transport(format!("unexpected reply {:?} for {}", reply, did))
}

/// A reference that is released when dropped
#[derive(Debug)]
pub struct InstanceRef {
    manager: PhysicalManagerRef,
    source: ReferenceSource,
}

impl InstanceRef {
    pub fn manager(&self) -> &PhysicalManagerRef {
        &self.manager
    }
}

impl Drop for InstanceRef {
    fn drop(&mut self) {
        if let Err(e) = self.manager.release_instance(self.source) {
            tracing::error!(error = %e, "failed to release instance reference");
        }
    }
}
