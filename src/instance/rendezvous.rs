//! Collective user registration.
//!
//! Every participant of a collective operation announces its use of an instance under a shared
//! [RendezvousKey]. Arrivals are gathered up a tree built over the participating nodes; the root of that
//! tree registers the merged user with the owner exactly once and the readiness signal flows back down.

use crate::collective_mapping::CollectiveMapping;
use crate::error::{fatal, InstanceError, InstanceResult};
use crate::event::{ApEvent, EventToken, RtEvent, RtUserEvent};
use crate::instance::{PhysicalManagerRef, RendezvousKey};
use crate::layout::FieldMask;
use crate::messages::InstanceMessage;

use std::collections::HashMap;

/// A registered user of an instance
#[derive(Debug, Clone)]
pub struct CollectiveUser {
    pub key: RendezvousKey,
    pub usage: FieldMask,
    /// triggers when every participant has finished using the instance
    pub term: ApEvent,
}

#[derive(Debug, Clone)]
struct Route {
    origin: usize,
    mapping: Option<CollectiveMapping>,
}

#[derive(Debug)]
struct PendingRendezvous {
    // (local, remote) arrivals, known once the first local participant shows up
    expected: Option<(usize, usize)>,
    local: usize,
    remote: usize,
    usage: FieldMask,
    terms: Vec<ApEvent>,
    ready: RtUserEvent,
    route: Option<Route>,
}

impl PendingRendezvous {
    fn new() -> PendingRendezvous {
        PendingRendezvous {
            expected: None,
            local: 0,
            remote: 0,
            usage: FieldMask::new(),
            terms: Vec::new(),
            ready: RtUserEvent::new(),
            route: None,
        }
    }

    fn is_complete(&self) -> bool {
        self.expected
            .map_or(false, |(local, remote)| self.local == local && self.remote == remote)
    }

    fn overflowed(&self) -> bool {
        self.expected
            .map_or(false, |(local, remote)| self.local > local || self.remote > remote)
    }
}

#[derive(Debug)]
struct AwaitingResponse {
    ready: RtUserEvent,
    route: Route,
}

#[derive(Debug, Default)]
pub(crate) struct RendezvousTable {
    arrivals: HashMap<RendezvousKey, PendingRendezvous>,
    awaiting: HashMap<RendezvousKey, AwaitingResponse>,
    users: Vec<CollectiveUser>,
    registrations: HashMap<RendezvousKey, usize>,
}

impl PhysicalManagerRef {
    /// Announces one local participant of the collective user `key`.
    ///
    /// `local_arrivals` is the number of participants on this node and must agree across all of them.
    /// With a `mapping`, the participating nodes are its members and this node must be one of them.
    /// The returned event triggers after every participant on every node arrived and the user was
    /// registered with the owner.
    pub fn register_collective_user(
        &self,
        key: RendezvousKey,
        usage: FieldMask,
        term: ApEvent,
        local_arrivals: usize,
        mapping: Option<&CollectiveMapping>,
    ) -> InstanceResult<RtEvent> {
        let core = self.core();
        let local = core.runtime.node();
        let owner = core.did.owner();
        let (route, expected_remote) = match mapping {
            Some(mapping) => {
                if !mapping.contains(local) {
                    return Err(crate::collective_mapping::NotMemberError {
                        node: local,
                        mapping_size: mapping.size(),
                    }
                    .into());
                }
                let origin = if mapping.contains(owner) {
                    owner
                } else {
                    mapping.find_nearest(owner)
                };
                let remote = mapping.count_children(origin, local)?;
                (
                    Route {
                        origin,
                        mapping: Some(mapping.clone()),
                    },
                    remote,
                )
            }
            None => (
                Route {
                    origin: local,
                    mapping: None,
                },
                0,
            ),
        };
        let mut table = core.rendezvous.lock();
        let entry = table
            .arrivals
            .entry(key)
            .or_insert_with(PendingRendezvous::new);
        match entry.expected {
            None => {
                entry.expected = Some((local_arrivals, expected_remote));
                entry.route = Some(route);
            }
            Some((l, r)) if l != local_arrivals || r != expected_remote => {
                let err = mismatch(key, entry, local_arrivals, expected_remote);
                drop(table);
                fatal(err, Some(core.debug_info()));
            }
            Some(_) => {}
        }
        entry.local += 1;
        entry.usage |= usage;
        entry.terms.push(term);
        let ready = entry.ready.event();
        if entry.overflowed() {
            let (l, r) = entry.expected.unwrap_or_default();
            let err = mismatch(key, entry, l, r);
            drop(table);
            fatal(err, Some(core.debug_info()));
        }
        if entry.is_complete() {
            if let Some(record) = table.arrivals.remove(&key) {
                drop(table);
                self.finish_rendezvous(key, record);
            }
        }
        Ok(ready)
    }

    pub(crate) fn handle_register_user_request(
        &self,
        src: usize,
        key: RendezvousKey,
        usage: FieldMask,
        term: EventToken,
    ) {
        let core = self.core();
        let term = core.runtime.events.claim(term);
        let mut table = core.rendezvous.lock();
        let entry = table
            .arrivals
            .entry(key)
            .or_insert_with(PendingRendezvous::new);
        entry.remote += 1;
        entry.usage |= usage;
        entry.terms.push(term);
        tracing::trace!(did = %core.did, ?key, src, remote = entry.remote, "remote arrival");
        if entry.overflowed() {
            let (l, r) = entry.expected.unwrap_or_default();
            let err = mismatch(key, entry, l, r);
            drop(table);
            fatal(err, Some(core.debug_info()));
        }
        if entry.is_complete() {
            if let Some(record) = table.arrivals.remove(&key) {
                drop(table);
                self.finish_rendezvous(key, record);
            }
        }
    }

    fn finish_rendezvous(&self, key: RendezvousKey, record: PendingRendezvous) {
        let core = self.core();
        let runtime = &core.runtime;
        let local = runtime.node();
        let owner = core.did.owner();
        let route = match record.route {
            Some(route) => route,
            None => return,
        };
        let term = ApEvent::merge(record.terms);
        if route.origin != local {
            let mapping = match &route.mapping {
                Some(mapping) => mapping,
                None => return,
            };
            let parent = match mapping.get_parent(route.origin, local) {
                Ok(parent) => parent,
                Err(e) => fatal(e.into(), Some(core.debug_info())),
            };
            core.rendezvous.lock().awaiting.insert(
                key,
                AwaitingResponse {
                    ready: record.ready,
                    route: route.clone(),
                },
            );
            let token = runtime.events.fresh_token();
            runtime.forward_trigger_to(&term, parent, token);
            runtime.send(
                parent,
                InstanceMessage::RegisterUserRequest {
                    did: core.did,
                    key,
                    usage: record.usage,
                    term: token,
                },
            );
            return;
        }
        if local == owner {
            self.register_user(key, record.usage, term);
            record.ready.trigger();
            self.respond_to_children(key, &route);
        } else {
            let term_token = runtime.events.fresh_token();
            runtime.forward_trigger_to(&term, owner, term_token);
            let (ready_token, registered) = runtime.events.create::<crate::event::Resource>();
            runtime.send(
                owner,
                InstanceMessage::RemoteRegistration {
                    did: core.did,
                    key,
                    usage: record.usage,
                    term: term_token,
                    ready: ready_token,
                },
            );
            let this = self.clone();
            let ready = record.ready;
            registered.on_trigger(move || {
                ready.trigger();
                this.respond_to_children(key, &route);
            });
        }
    }

    fn respond_to_children(&self, key: RendezvousKey, route: &Route) {
        let core = self.core();
        if let Some(mapping) = &route.mapping {
            let mut children = Vec::new();
            if let Err(e) = mapping.get_children(route.origin, core.runtime.node(), &mut children) {
                fatal(e.into(), Some(core.debug_info()));
            }
            for child in children {
                core.runtime.send(
                    child,
                    InstanceMessage::RegisterUserResponse { did: core.did, key },
                );
            }
        }
    }

    pub(crate) fn handle_register_user_response(&self, key: RendezvousKey) {
        let awaiting = self.core().rendezvous.lock().awaiting.remove(&key);
        match awaiting {
            Some(awaiting) => {
                awaiting.ready.trigger();
                self.respond_to_children(key, &awaiting.route);
            }
            None => tracing::error!(did = %self.did(), ?key, "unexpected rendezvous response"),
        }
    }

    pub(crate) fn handle_remote_registration(
        &self,
        src: usize,
        key: RendezvousKey,
        usage: FieldMask,
        term: EventToken,
        ready: EventToken,
    ) {
        let core = self.core();
        let term = core.runtime.events.claim(term);
        self.register_user(key, usage, term);
        core.runtime
            .send(src, InstanceMessage::TriggerEvent { token: ready });
    }

    fn register_user(&self, key: RendezvousKey, usage: FieldMask, term: ApEvent) {
        let core = self.core();
        let mut table = core.rendezvous.lock();
        table.prune();
        *table.registrations.entry(key).or_default() += 1;
        table.users.push(CollectiveUser { key, usage, term });
        tracing::debug!(did = %core.did, ?key, ?usage, "collective user registered");
    }

    /// How many live users registered `key` with this node; 1 on the owner after a completed
    /// rendezvous, until the user is pruned
    pub fn registration_count(&self, key: &RendezvousKey) -> usize {
        self.core()
            .rendezvous
            .lock()
            .registrations
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn collective_users(&self) -> Vec<CollectiveUser> {
        self.core().rendezvous.lock().users.clone()
    }

    /// Drops users whose termination event has triggered
    pub fn prune_collective_users(&self) -> usize {
        self.core().rendezvous.lock().prune()
    }

    /// Keys with a rendezvous still gathering arrivals or waiting for the owner
    pub fn pending_rendezvous(&self) -> usize {
        let table = self.core().rendezvous.lock();
        table.arrivals.len() + table.awaiting.len()
    }
}

impl RendezvousTable {
    fn prune(&mut self) -> usize {
        let before = self.users.len();
        let registrations = &mut self.registrations;
        self.users.retain(|user| {
            if !user.term.has_triggered() {
                return true;
            }
            if let Some(count) = registrations.get_mut(&user.key) {
                *count -= 1;
                if *count == 0 {
                    registrations.remove(&user.key);
                }
            }
            false
        });
        before - self.users.len()
    }
}

fn mismatch(
    key: RendezvousKey,
    entry: &PendingRendezvous,
    expected_local: usize,
    expected_remote: usize,
) -> InstanceError {
    InstanceError::RendezvousMismatch {
        key,
        expected_local,
        expected_remote,
        local: entry.local,
        remote: entry.remote,
    }
}
