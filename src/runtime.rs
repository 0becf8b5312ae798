//! The per node runtime.
//!
//! A [Runtime] owns everything one node knows: its memories, the managers and views it has heard of,
//! the executor running its tasks and its endpoint of the lamellae. Incoming messages are dispatched
//! from [Runtime::handle_message]; handlers that have to wait for something are spawned onto the
//! executor so the receive task never blocks.

use crate::builder::PendingCollectiveManager;
use crate::config;
use crate::domain::{Domain, DomainPoint};
use crate::env_var::CollectedPolicy;
use crate::error::{InstanceError, InstanceResult};
use crate::event::{Event, EventRegistry, EventToken};
use crate::instance::collective::HAMMER_STAGE;
use crate::instance::physical::PhysicalCore;
use crate::instance::{
    CollectiveManager, DistributedId, GcDebugInfo, GcState, IdKind, IndividualManager,
    InstanceManager, InstanceView, PhysicalManagerRef, PointLocation, VirtualManager,
};
use crate::lamellae::{Lamellae, LamellaeComm};
use crate::layout::{FieldSpace, FieldSpaceId, LayoutDescription, LayoutTable, MemoryKind};
use crate::memory::{MemoryId, MemoryManager};
use crate::messages::{
    DescriptorVariant, Envelope, InstanceMessage, ManagerDescriptor, ReductionTarget, ReplyPayload,
};
use crate::scheduler::{create_executor, Executor, ExecutorType, TaskQueue};

use futures::channel::oneshot;
use futures::Future;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Per runtime settings, defaulting to the environment (see [config])
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub radix: usize,
    pub threads: usize,
    pub hammer_threshold: usize,
    pub memory_capacity: usize,
    pub eager_fraction: f64,
    pub memories_per_node: usize,
    pub collected_policy: CollectedPolicy,
}

impl RuntimeConfig {
    pub fn from_env() -> RuntimeConfig {
        let env = config();
        RuntimeConfig {
            radix: env.radix,
            threads: env.threads,
            hammer_threshold: env.hammer_threshold,
            memory_capacity: env.memory_capacity,
            eager_fraction: env.eager_fraction,
            memories_per_node: env.memories_per_node,
            collected_policy: env.collected_policy,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig::from_env()
    }
}

fn memory_kind(index: usize) -> MemoryKind {
    match index % 3 {
        0 => MemoryKind::System,
        1 => MemoryKind::Registered,
        _ => MemoryKind::Framebuffer,
    }
}

type ManagerWaiter = oneshot::Sender<InstanceResult<InstanceManager>>;
type DeferredHandler = Box<dyn FnOnce(InstanceManager) + Send>;

pub struct Runtime {
    node: usize,
    num_nodes: usize,
    config: RuntimeConfig,
    me: Weak<Runtime>,
    executor: Arc<Executor>,
    lamellae: Arc<Lamellae>,
    pub(crate) events: EventRegistry,
    replies: Mutex<HashMap<u64, oneshot::Sender<ReplyPayload>>>,
    next_request: AtomicU64,
    next_serial: AtomicU64,
    managers: RwLock<HashMap<DistributedId, InstanceManager>>,
    pending_managers: Mutex<HashMap<DistributedId, Vec<ManagerWaiter>>>,
    // handlers for messages that arrived before their manager, in arrival order
    deferred: Mutex<HashMap<DistributedId, Vec<DeferredHandler>>>,
    // creation reports that reached the owner before its own collective manager existed
    pending_creations: Mutex<HashMap<DistributedId, Vec<(DomainPoint, Option<PointLocation>)>>>,
    views: Mutex<HashMap<DistributedId, Arc<InstanceView>>>,
    // views created elsewhere for which this node is the logical owner: view -> (manager, creator)
    remote_views: Mutex<HashMap<DistributedId, (DistributedId, usize)>>,
    field_spaces: RwLock<HashMap<FieldSpaceId, Arc<FieldSpace>>>,
    layouts: LayoutTable,
    memories: Vec<Arc<MemoryManager>>,
    virtual_manager: Arc<VirtualManager>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("node", &self.node)
            .field("num_nodes", &self.num_nodes)
            .field("managers", &self.managers.read().len())
            .field("lamellae", &self.lamellae)
            .finish()
    }
}

impl Runtime {
    pub(crate) fn new(node: usize, config: RuntimeConfig, lamellae: Lamellae) -> Arc<Runtime> {
        let num_nodes = lamellae.num_nodes();
        let executor = Arc::new(create_executor(
            ExecutorType::WorkStealing,
            node,
            config.threads,
        ));
        let memories = (0..config.memories_per_node.max(1))
            .map(|index| {
                Arc::new(MemoryManager::new(
                    MemoryId { node, index },
                    memory_kind(index),
                    config.memory_capacity,
                    config.eager_fraction,
                ))
            })
            .collect();
        let runtime = Arc::new_cyclic(|me| Runtime {
            node,
            num_nodes,
            config,
            me: me.clone(),
            executor,
            lamellae: Arc::new(lamellae),
            events: EventRegistry::new(node),
            replies: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
            next_serial: AtomicU64::new(1),
            managers: RwLock::new(HashMap::new()),
            pending_managers: Mutex::new(HashMap::new()),
            deferred: Mutex::new(HashMap::new()),
            pending_creations: Mutex::new(HashMap::new()),
            views: Mutex::new(HashMap::new()),
            remote_views: Mutex::new(HashMap::new()),
            field_spaces: RwLock::new(HashMap::new()),
            layouts: LayoutTable::new(),
            memories,
            virtual_manager: Arc::new(VirtualManager::new(node)),
        });
        let lamellae = runtime.lamellae.clone();
        let weak = Arc::downgrade(&runtime);
        runtime.executor.submit_task(async move {
            lamellae.recv_data(weak).await;
        });
        tracing::debug!(node, num_nodes, "runtime started");
        runtime
    }

    pub fn node(&self) -> usize {
        self.node
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn memories(&self) -> &[Arc<MemoryManager>] {
        &self.memories
    }

    pub fn memory(&self, id: MemoryId) -> InstanceResult<Arc<MemoryManager>> {
        if id.node != self.node {
            return Err(InstanceError::UnknownMemory(id));
        }
        self.memories
            .get(id.index)
            .cloned()
            .ok_or(InstanceError::UnknownMemory(id))
    }

    pub fn register_field_space(&self, field_space: FieldSpace) -> Arc<FieldSpace> {
        self.field_spaces
            .write()
            .entry(field_space.id())
            .or_insert_with(|| Arc::new(field_space))
            .clone()
    }

    pub fn field_space(&self, id: FieldSpaceId) -> InstanceResult<Arc<FieldSpace>> {
        self.field_spaces
            .read()
            .get(&id)
            .cloned()
            .ok_or(InstanceError::UnknownFieldSpace(id))
    }

    pub fn layouts(&self) -> &LayoutTable {
        &self.layouts
    }

    pub fn virtual_manager(&self) -> InstanceManager {
        InstanceManager::Virtual(self.virtual_manager.clone())
    }

    /// Bytes this node has pushed into the lamellae
    pub fn bytes_sent(&self) -> usize {
        self.lamellae.bytes_sent()
    }

    /// Holds every message this node sends to `dst` until [resume_messages_to][Self::resume_messages_to]
    pub fn pause_messages_to(&self, dst: usize) {
        self.lamellae.pause_link(dst);
    }

    pub fn resume_messages_to(&self, dst: usize) {
        if let Err(e) = self.lamellae.resume_link(dst) {
            tracing::error!(node = self.node, dst, error = %e, "failed to release held messages");
        }
    }

    pub fn held_messages_to(&self, dst: usize) -> usize {
        self.lamellae.held_messages(dst)
    }

    //#####################################
    // Managers and views
    //#####################################

    pub fn find_manager(&self, did: &DistributedId) -> Option<InstanceManager> {
        if *did == DistributedId::virtual_manager(self.node) {
            return Some(self.virtual_manager());
        }
        self.managers.read().get(did).cloned()
    }

    fn find_physical(&self, did: &DistributedId) -> Option<PhysicalManagerRef> {
        self.find_manager(did).and_then(|m| m.as_physical_manager())
    }

    /// Returns the local manager for `did`, asking its owner to send the metadata if this node has not
    /// seen it yet. Concurrent requests for one `did` share the owner round trip.
    pub async fn find_or_request_manager(
        &self,
        did: DistributedId,
    ) -> InstanceResult<InstanceManager> {
        let (rx, first) = {
            let mut pending = self.pending_managers.lock();
            if let Some(manager) = self.find_manager(&did) {
                return Ok(manager);
            }
            if did.owner() == self.node && !did.is_collective_manager() {
                return Err(InstanceError::UnknownManager(did));
            }
            let waiters = pending.entry(did).or_default();
            let (tx, rx) = oneshot::channel();
            waiters.push(tx);
            (rx, waiters.len() == 1)
        };
        if first && did.owner() != self.node {
            self.send(
                did.owner(),
                InstanceMessage::ManagerRequest {
                    did,
                    target: self.node,
                },
            );
        }
        rx.await?
    }

    /// Registers `manager` unless another manager with the same id got there first, returning the winner
    pub(crate) fn register_manager(&self, manager: InstanceManager) -> InstanceManager {
        use crate::instance::InstanceManagerOps;
        let did = manager.did();
        let manager = self
            .managers
            .write()
            .entry(did)
            .or_insert(manager)
            .clone();
        let waiters = self.pending_managers.lock().remove(&did);
        for waiter in waiters.into_iter().flatten() {
            let _ = waiter.send(Ok(manager.clone()));
        }
        if let InstanceManager::Collective(collective) = &manager {
            let creations = self.pending_creations.lock().remove(&did);
            for (point, location) in creations.into_iter().flatten() {
                collective.handle_instance_creation(point, location);
            }
        }
        self.drain_deferred(&manager);
        manager
    }

    /// Runs the handlers queued for `manager` in arrival order. The queue entry stays in place while a
    /// batch runs so messages arriving meanwhile line up behind it.
    fn drain_deferred(&self, manager: &InstanceManager) {
        use crate::instance::InstanceManagerOps;
        let did = manager.did();
        loop {
            let batch = {
                let mut deferred = self.deferred.lock();
                match deferred.get_mut(&did) {
                    Some(queue) if !queue.is_empty() => std::mem::take(queue),
                    _ => {
                        deferred.remove(&did);
                        return;
                    }
                }
            };
            tracing::trace!(node = self.node, %did, handlers = batch.len(), "running deferred messages");
            for handler in batch {
                handler(manager.clone());
            }
        }
    }

    /// Number of messages waiting for the manager `did` to arrive on this node
    pub fn deferred_messages(&self, did: &DistributedId) -> usize {
        self.deferred.lock().get(did).map_or(0, |queue| queue.len())
    }

    pub(crate) fn unregister_manager(&self, did: &DistributedId) {
        self.managers.write().remove(did);
    }

    pub fn find_view(&self, did: &DistributedId) -> Option<Arc<InstanceView>> {
        self.views.lock().get(did).cloned()
    }

    pub(crate) fn register_view(&self, view: Arc<InstanceView>) {
        self.views.lock().insert(view.did, view);
    }

    pub(crate) fn unregister_view(&self, did: &DistributedId) {
        self.views.lock().remove(did);
    }

    pub(crate) fn record_remote_view(&self, view: DistributedId, manager: DistributedId, creator: usize) {
        self.remote_views.lock().insert(view, (manager, creator));
    }

    /// Views of instances that other nodes created on behalf of this node
    pub fn remote_views(&self) -> Vec<(DistributedId, DistributedId, usize)> {
        self.remote_views
            .lock()
            .iter()
            .map(|(view, (manager, creator))| (*view, *manager, *creator))
            .collect()
    }

    pub(crate) fn allocate_did(&self, kind: IdKind) -> DistributedId {
        self.allocate_did_owned_by(self.node, kind)
    }

    /// Serials embed the allocating node so ids handed out for other owners never collide
    pub(crate) fn allocate_did_owned_by(&self, owner: usize, kind: IdKind) -> DistributedId {
        let counter = self.next_serial.fetch_add(1, Ordering::Relaxed);
        DistributedId::new(owner, (counter << 16) | (self.node as u64 & 0xffff), kind)
    }

    pub(crate) fn find_or_create_collective_manager(
        &self,
        pending: &PendingCollectiveManager,
        layout: Arc<LayoutDescription>,
        field_space: Arc<FieldSpace>,
        tree_id: u32,
        instance_domain: Domain,
        footprint: usize,
    ) -> InstanceResult<Arc<CollectiveManager>> {
        if let Some(existing) = self.find_manager(&pending.did) {
            return existing.as_collective_manager();
        }
        let runtime = self.me.upgrade().ok_or_else(|| {
            InstanceError::Transport(format!("node {} runtime shut down", self.node))
        })?;
        let core = PhysicalCore::new(
            pending.did,
            runtime,
            layout,
            field_space,
            tree_id,
            instance_domain,
            footprint,
        );
        if pending.did.owner() == self.node {
            for member in pending.mapping.spaces() {
                core.add_remote_holder(*member);
            }
        }
        let manager = Arc::new(CollectiveManager::new(
            core,
            pending.point_space,
            pending.mapping.clone(),
            pending.multi_instance,
            pending.redop,
        ));
        self.register_manager(InstanceManager::Collective(manager))
            .as_collective_manager()
    }

    /// Rebuilds a manager shipped by its owner
    fn install_manager(&self, descriptor: ManagerDescriptor) -> InstanceResult<InstanceManager> {
        if let Some(existing) = self.find_manager(&descriptor.did) {
            return Ok(existing);
        }
        let runtime = self.me.upgrade().ok_or_else(|| {
            InstanceError::Transport(format!("node {} runtime shut down", self.node))
        })?;
        let field_space = self.register_field_space(descriptor.field_space);
        let layout = self.layouts.find_or_create(
            &field_space,
            &descriptor.constraints,
            descriptor.instance_domain.dim(),
        )?;
        let core = PhysicalCore::new(
            descriptor.did,
            runtime,
            layout,
            field_space,
            descriptor.tree_id,
            descriptor.instance_domain,
            descriptor.footprint,
        );
        let manager = match descriptor.variant {
            DescriptorVariant::Individual {
                memory,
                instance,
                kind,
            } => InstanceManager::Individual(Arc::new(IndividualManager::new(
                core, memory, instance, kind,
            ))),
            DescriptorVariant::Collective {
                point_space,
                mapping,
                multi_instance,
                redop,
            } => InstanceManager::Collective(Arc::new(CollectiveManager::new(
                core,
                point_space,
                mapping,
                multi_instance,
                redop,
            ))),
        };
        Ok(self.register_manager(manager))
    }

    fn fail_manager_waiters(&self, did: DistributedId) {
        let waiters = self.pending_managers.lock().remove(&did);
        for waiter in waiters.into_iter().flatten() {
            let _ = waiter.send(Err(InstanceError::UnknownManager(did)));
        }
    }

    //#####################################
    // Messaging
    //#####################################

    pub(crate) fn send(&self, dst: usize, msg: InstanceMessage) {
        let envelope = Envelope {
            src: self.node,
            msg,
        };
        let result = crate::serialize(&envelope)
            .and_then(|data| self.lamellae.send_to_node(dst, data));
        if let Err(e) = result {
            tracing::error!(node = self.node, dst, error = %e, "failed to send message");
        }
    }

    /// Sends the message built from a fresh request id and returns where the reply will arrive
    pub(crate) fn request(
        &self,
        dst: usize,
        build: impl FnOnce(u64) -> InstanceMessage,
    ) -> oneshot::Receiver<ReplyPayload> {
        let request = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.replies.lock().insert(request, tx);
        self.send(dst, build(request));
        rx
    }

    fn complete_reply(&self, request: u64, payload: ReplyPayload) {
        match self.replies.lock().remove(&request) {
            Some(tx) => {
                let _ = tx.send(payload);
            }
            None => tracing::error!(node = self.node, request, "reply to unknown request"),
        }
    }

    /// Triggers the event named by `token` on its node once `event` triggers here
    pub(crate) fn forward_trigger<K>(&self, event: &Event<K>, token: EventToken) {
        self.forward_trigger_to(event, token.node, token)
    }

    /// Like [forward_trigger][Self::forward_trigger] for a token that was claimed on `dst`
    pub(crate) fn forward_trigger_to<K>(&self, event: &Event<K>, dst: usize, token: EventToken) {
        let runtime = self.me.clone();
        event.on_trigger(move || {
            if let Some(runtime) = runtime.upgrade() {
                runtime.trigger_token_at(dst, token);
            }
        });
    }

    fn trigger_token_at(&self, dst: usize, token: EventToken) {
        if dst == self.node {
            self.events.trigger(token);
        } else {
            self.send(dst, InstanceMessage::TriggerEvent { token });
        }
    }

    pub(crate) fn submit<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.executor.submit_task(future);
    }

    pub fn spawn<F>(&self, future: F) -> async_task::Task<F::Output, usize>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.executor.spawn_task(future)
    }

    /// Runs `future` to completion, helping execute this node's tasks while waiting
    pub fn block_on<F>(&self, future: F) -> F::Output
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.executor.block_on(future)
    }

    /// Runs `handler` with the manager for `did`, queueing it until the manager arrives if this node
    /// does not know it yet. Handlers for one `did` always run in arrival order.
    fn with_manager<F>(&self, did: DistributedId, handler: F)
    where
        F: FnOnce(InstanceManager) + Send + 'static,
    {
        {
            let mut deferred = self.deferred.lock();
            if let Some(queue) = deferred.get_mut(&did) {
                queue.push(Box::new(handler));
                return;
            }
            match self.find_manager(&did) {
                Some(manager) => {
                    drop(deferred);
                    handler(manager);
                    return;
                }
                None => {
                    deferred.insert(did, vec![Box::new(handler)]);
                }
            }
        }
        let runtime = match self.me.upgrade() {
            Some(runtime) => runtime,
            None => return,
        };
        self.submit(async move {
            // success drains the queue from register_manager
            if let Err(e) = runtime.find_or_request_manager(did).await {
                let dropped = runtime.deferred.lock().remove(&did).map_or(0, |q| q.len());
                tracing::warn!(node = runtime.node, %did, dropped, error = %e, "dropping messages");
            }
        });
    }

    /// Like [with_manager][Self::with_manager] for messages that only concern managers already known
    /// here. Returns false, without running `handler`, if this node has not heard of `did`.
    fn with_known_physical<F>(&self, did: DistributedId, handler: F) -> bool
    where
        F: FnOnce(PhysicalManagerRef) + Send + 'static,
    {
        let known = {
            let deferred = self.deferred.lock();
            deferred.contains_key(&did) || self.find_manager(&did).is_some()
        };
        if known {
            self.with_physical(did, handler);
        }
        known
    }

    fn with_collective<F>(&self, did: DistributedId, handler: F)
    where
        F: FnOnce(Arc<CollectiveManager>) + Send + 'static,
    {
        self.with_manager(did, move |manager| match manager.as_collective_manager() {
            Ok(collective) => handler(collective),
            Err(e) => tracing::error!(%did, error = %e, "expected a collective manager"),
        })
    }

    fn with_physical<F>(&self, did: DistributedId, handler: F)
    where
        F: FnOnce(PhysicalManagerRef) + Send + 'static,
    {
        self.with_manager(did, move |manager| match manager.as_physical_manager() {
            Some(physical) => handler(physical),
            None => tracing::error!(%did, "expected a physical manager"),
        })
    }

    fn reply_or_fail(&self, dst: usize, request: u64, reply: Option<InstanceMessage>) {
        match reply {
            Some(msg) => self.send(dst, msg),
            None => self.send(dst, InstanceMessage::RequestFailed { request }),
        }
    }

    /// Completes a distribution step; `done` triggers on failure too
    fn finish_distribution(&self, did: DistributedId, result: InstanceResult<crate::event::ApEvent>, done: EventToken) {
        match result {
            Ok(event) => self.forward_trigger(&event, done),
            Err(e) => {
                tracing::error!(node = self.node, %did, error = %e, "collective distribution failed");
                self.trigger_token_at(done.node, done);
            }
        }
    }

    #[tracing::instrument(skip_all, level = "trace", fields(node = self.node, src = src))]
    pub(crate) fn handle_message(&self, src: usize, msg: InstanceMessage) {
        let msg = match msg.into_reply() {
            Ok((request, payload)) => {
                self.complete_reply(request, payload);
                return;
            }
            Err(msg) => msg,
        };
        let runtime = match self.me.upgrade() {
            Some(runtime) => runtime,
            None => return,
        };
        match msg {
            InstanceMessage::TriggerEvent { token } => self.events.trigger(token),
            InstanceMessage::RequestFailed { request } => {
                self.replies.lock().remove(&request);
            }

            // garbage collection needs no waiting; unknown ids were already deleted here
            InstanceMessage::GcRequest { did, epoch } => {
                if !self.with_known_physical(did, move |m| m.handle_gc_request(src, epoch)) {
                    self.send(
                        src,
                        InstanceMessage::GcResponse {
                            did,
                            epoch,
                            accepted: true,
                        },
                    );
                }
            }
            InstanceMessage::GcResponse {
                did,
                epoch,
                accepted,
            } => {
                self.with_known_physical(did, move |m| m.handle_gc_response(src, epoch, accepted));
            }
            InstanceMessage::GcFailed { did, epoch } => {
                self.with_known_physical(did, move |m| m.handle_gc_failed(epoch));
            }
            InstanceMessage::GcAcquireRequest { did, request } => {
                if !self.with_known_physical(did, move |m| m.handle_gc_acquire_request(src, request)) {
                    self.send(
                        src,
                        InstanceMessage::GcAcquireResponse {
                            request,
                            acquired: false,
                        },
                    );
                }
            }
            InstanceMessage::GcPriorityUpdate {
                did,
                mapper,
                processor,
                priority,
            } => {
                self.with_known_physical(did, move |m| {
                    m.update_priority_vote(mapper, processor, priority)
                });
            }
            InstanceMessage::GcDebugRequest { did, request } => {
                let info = match self.find_physical(&did) {
                    Some(manager) => manager.gc_debug_info(),
                    None => GcDebugInfo {
                        did,
                        node: self.node,
                        state: GcState::Collected,
                        references: 0,
                        valid_references: 0,
                        active_contexts: 0,
                        remote_holders: Vec::new(),
                        pending_responses: 0,
                    },
                };
                self.send(src, InstanceMessage::GcDebugResponse { request, info });
            }
            InstanceMessage::ManagerDeletion { did } => {
                self.with_known_physical(did, |m| m.handle_deletion());
            }

            InstanceMessage::ManagerRequest { did, target } => {
                let result = match self.find_physical(&did) {
                    Some(PhysicalManagerRef::Individual(m)) => m.send_manager(target),
                    Some(PhysicalManagerRef::Collective(m)) => m.send_manager(target),
                    None => Err(InstanceError::UnknownManager(did)),
                };
                if let Err(e) = result {
                    tracing::debug!(node = self.node, %did, target, error = %e, "cannot send manager");
                    self.send(target, InstanceMessage::ManagerMissing { did });
                }
            }
            InstanceMessage::SendManager { descriptor } => {
                let did = descriptor.did;
                if let Err(e) = self.install_manager(descriptor) {
                    tracing::error!(node = self.node, %did, error = %e, "failed to install manager");
                    self.fail_manager_waiters(did);
                }
            }
            InstanceMessage::ManagerMissing { did } => self.fail_manager_waiters(did),
            InstanceMessage::ManagerUpdate {
                did,
                instance,
                kind,
            } => {
                self.with_known_physical(did, move |m| match m {
                    PhysicalManagerRef::Individual(m) => m.handle_manager_update(instance, kind),
                    PhysicalManagerRef::Collective(_) => {
                        tracing::error!(%did, "manager update for a collective instance")
                    }
                });
            }

            InstanceMessage::TopViewRequest { did, key, request } => {
                if !self.with_known_physical(did, move |m| m.handle_top_view_request(src, key, request)) {
                    self.send(src, InstanceMessage::RequestFailed { request });
                }
            }
            InstanceMessage::TopViewCreation {
                view,
                manager,
                creator,
            } => self.record_remote_view(view, manager, creator),

            InstanceMessage::RegisterUserRequest {
                did,
                key,
                usage,
                term,
            } => self.with_physical(did, move |m| {
                m.handle_register_user_request(src, key, usage, term)
            }),
            InstanceMessage::RegisterUserResponse { did, key } => {
                self.with_physical(did, move |m| m.handle_register_user_response(key))
            }
            InstanceMessage::RemoteRegistration {
                did,
                key,
                usage,
                term,
                ready,
            } => self.with_physical(did, move |m| {
                m.handle_remote_registration(src, key, usage, term, ready)
            }),

            InstanceMessage::InstanceCreation {
                did,
                point,
                location,
            } => {
                let manager = {
                    let mut pending = self.pending_creations.lock();
                    match self.find_manager(&did) {
                        Some(manager) => Some(manager),
                        None => {
                            pending.entry(did).or_default().push((point, location));
                            None
                        }
                    }
                };
                if let Some(manager) = manager {
                    match manager.as_collective_manager() {
                        Ok(collective) => collective.handle_instance_creation(point, location),
                        Err(e) => tracing::error!(%did, error = %e, "creation report for non collective"),
                    }
                }
            }
            InstanceMessage::PointRequest {
                did,
                point,
                request,
            } => self.with_collective(did, move |m| {
                let rt = runtime.clone();
                runtime.submit(async move {
                    let location = m.find_or_forward_physical_instance(point).await.ok();
                    rt.send(src, InstanceMessage::PointResponse { request, location });
                });
            }),
            InstanceMessage::FindPointsRequest {
                did,
                memory,
                request,
            } => {
                let rt = runtime.clone();
                self.with_collective(did, move |m| {
                    let points = m.points_in_local_memory(memory);
                    rt.send(src, InstanceMessage::PointsResponse { request, points });
                })
            }
            InstanceMessage::NearestPointsRequest {
                did,
                memory,
                request,
            } => self.with_collective(did, move |m| {
                let rt = runtime.clone();
                runtime.submit(async move {
                    let reply = m
                        .find_points_nearest_memory(memory)
                        .await
                        .ok()
                        .map(|points| InstanceMessage::PointsResponse { request, points });
                    rt.reply_or_fail(src, request, reply);
                });
            }),

            InstanceMessage::DistributeFill {
                did,
                origin,
                fields,
                value,
                done,
            } => self.with_collective(did, move |m| {
                let result = m.distribute_fill(origin, fields, value.into_vec());
                runtime.finish_distribution(did, result, done);
            }),
            InstanceMessage::DistributeBroadcast {
                did,
                origin,
                fields,
                source,
                done,
            } => self.with_collective(did, move |m| {
                let result = m.distribute_broadcast(origin, fields, source);
                runtime.finish_distribution(did, result, done);
            }),
            InstanceMessage::DistributeReducecast {
                did,
                origin,
                redop,
                buffer,
                done,
            } => self.with_collective(did, move |m| {
                let result = m.distribute_reducecast(origin, redop, buffer);
                runtime.finish_distribution(did, result, done);
            }),
            InstanceMessage::DistributeReduction {
                did,
                origin,
                fields,
                redop,
                target,
            } => self.with_collective(did, move |m| {
                let rt = runtime.clone();
                runtime.submit(async move {
                    match target {
                        ReductionTarget::Parent { request } => {
                            let buffer = match m.reduce_subtree(origin, fields, redop).await {
                                Ok(buffer) => Some(buffer),
                                Err(e) => {
                                    tracing::error!(%did, error = %e, "subtree reduction failed");
                                    None
                                }
                            };
                            rt.send(src, InstanceMessage::ReductionPartial { request, buffer });
                        }
                        ReductionTarget::Point { point, done } => {
                            let result = m
                                .reduce_to_point(origin, fields, redop, point)
                                .await
                                .map(|_| crate::event::ApEvent::no_event());
                            rt.finish_distribution(did, result, done);
                        }
                    }
                });
            }),
            InstanceMessage::DistributeHourglass {
                did,
                dst,
                fields,
                redop,
                done,
            } => self.with_collective(did, move |m| {
                let rt = runtime.clone();
                runtime.submit(async move {
                    let result = m.hourglass_from_origin(dst, fields, redop).await;
                    rt.finish_distribution(did, result, done);
                });
            }),
            InstanceMessage::DistributePointwise {
                did,
                origin,
                src: source,
                fields,
                done,
            } => self.with_collective(did, move |m| {
                let result = m.distribute_pointwise(origin, source, fields);
                runtime.finish_distribution(did, result, done);
            }),
            InstanceMessage::DistributePoint {
                did,
                point,
                fields,
                request,
            } => self.with_collective(did, move |m| {
                let buffer = m.gather_point(point, &fields).ok();
                runtime.send(src, InstanceMessage::DistributePointResponse { request, buffer });
            }),
            InstanceMessage::DistributeAllreduce {
                did,
                tag,
                run,
                stage,
                buffer,
            } => self.with_collective(did, move |m| {
                m.process_distribute_allreduce(src, tag, run, stage, buffer)
            }),
            InstanceMessage::HammerReduction {
                did,
                tag,
                run,
                buffer,
            } => self.with_collective(did, move |m| {
                m.process_distribute_allreduce(src, tag, run, HAMMER_STAGE, buffer)
            }),

            InstanceMessage::GcAcquireResponse { .. }
            | InstanceMessage::GcDebugResponse { .. }
            | InstanceMessage::TopViewResponse { .. }
            | InstanceMessage::PointResponse { .. }
            | InstanceMessage::PointsResponse { .. }
            | InstanceMessage::ReductionPartial { .. }
            | InstanceMessage::DistributePointResponse { .. } => {
                tracing::error!(node = self.node, "reply escaped dispatch")
            }
        }
    }

    /// Stops the receive task and the executor. Messages still in flight are dropped.
    pub(crate) fn shutdown(&self) {
        if !self.executor.panicked() {
            self.lamellae.shutdown();
        }
        self.executor.shutdown();
        // managers point back at the runtime
        self.managers.write().clear();
        self.pending_managers.lock().clear();
        self.deferred.lock().clear();
        let outstanding = self.events.outstanding();
        if outstanding > 0 {
            tracing::debug!(node = self.node, outstanding, "shutting down with untriggered events");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lamellae::LocalFabric;

    fn runtime() -> Arc<Runtime> {
        let fabric = LocalFabric::new(1);
        Runtime::new(0, RuntimeConfig::from_env(), Lamellae::Local(fabric.endpoint(0)))
    }

    #[test]
    fn dids_are_unique_and_owned() {
        let rt = runtime();
        let a = rt.allocate_did(IdKind::View);
        let b = rt.allocate_did(IdKind::View);
        assert_ne!(a, b);
        assert_eq!(a.owner(), 0);
        let c = rt.allocate_did_owned_by(5, IdKind::View);
        assert_eq!(c.owner(), 5);
        rt.shutdown();
    }

    #[test]
    fn memories_are_local_only() {
        let rt = runtime();
        assert!(rt.memory(MemoryId { node: 0, index: 0 }).is_ok());
        assert_eq!(
            rt.memory(MemoryId { node: 1, index: 0 }).unwrap_err(),
            InstanceError::UnknownMemory(MemoryId { node: 1, index: 0 })
        );
        rt.shutdown();
    }

    #[test]
    fn virtual_manager_is_always_known() {
        let rt = runtime();
        let did = DistributedId::virtual_manager(0);
        assert!(rt.find_manager(&did).is_some());
        let unknown = rt.allocate_did(IdKind::View);
        assert_eq!(
            rt.block_on({
                let rt = rt.clone();
                async move { rt.find_or_request_manager(unknown).await.map(|_| ()) }
            }),
            Err(InstanceError::UnknownManager(unknown))
        );
        rt.shutdown();
    }

    #[test]
    fn self_addressed_requests_round_trip() {
        let rt = runtime();
        let (token, event) = rt.events.create::<crate::event::Resource>();
        rt.send(0, InstanceMessage::TriggerEvent { token });
        assert!(event.wait_timeout(std::time::Duration::from_secs(10)));
        rt.shutdown();
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let start = std::time::Instant::now();
        while !condition() {
            assert!(start.elapsed().as_secs() < 10, "timed out");
            std::thread::yield_now();
        }
    }

    fn logger<T: 'static>(order: &Arc<Mutex<Vec<usize>>>, step: usize) -> impl FnOnce(T) + Send + 'static {
        let order = order.clone();
        move |_| order.lock().push(step)
    }

    #[test]
    fn messages_waiting_for_a_manager_keep_arrival_order() {
        use crate::builder::InstanceBuilder;
        use crate::layout::LayoutConstraintSet;
        use crate::world::InstanceWorldBuilder;

        let world = InstanceWorldBuilder::new().with_num_nodes(2).build();
        world.register_field_space(FieldSpace::new(1, vec![(1, 8)]));
        let owner = world.node(0);
        let did = InstanceBuilder::new(
            owner,
            vec![crate::domain::LogicalRegion::new(1, 1, Domain::new(0, 4))],
            LayoutConstraintSet::new(vec![1]),
            owner.memories()[0].id(),
        )
        .create_physical_instance()
        .expect("instance")
        .did();

        let order = Arc::new(Mutex::new(Vec::new()));
        let rt1 = world.node(1);
        assert!(!rt1.with_known_physical(did, logger(&order, 0)));
        world.pause_link(0, 1);
        rt1.with_manager(did, logger(&order, 1));
        assert!(rt1.with_known_physical(did, logger(&order, 2)));
        rt1.with_manager(did, logger(&order, 3));
        assert_eq!(rt1.deferred_messages(&did), 3);
        wait_for(|| world.held_messages(0, 1) > 0);
        assert!(order.lock().is_empty());

        world.resume_link(0, 1);
        wait_for(|| order.lock().len() == 3);
        assert_eq!(*order.lock(), vec![1, 2, 3]);
        rt1.with_manager(did, logger(&order, 4));
        wait_for(|| order.lock().len() == 4);
        assert_eq!(*order.lock(), vec![1, 2, 3, 4]);
        assert_eq!(rt1.deferred_messages(&did), 0);
    }

    #[test]
    fn messages_for_unknown_managers_are_dropped() {
        let world = crate::world::InstanceWorldBuilder::new().with_num_nodes(2).build();
        let missing = world.node(0).allocate_did(IdKind::View);
        let rt1 = world.node(1);
        rt1.with_manager(missing, |_| panic!("no such manager"));
        wait_for(|| rt1.deferred_messages(&missing) == 0);
    }
}
