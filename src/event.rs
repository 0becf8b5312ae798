//! Completion events.
//!
//! Two kinds of events are kept apart by type: [RtEvent] signals that a distributed metadata or control
//! operation finished (a GC acknowledgment, a rendezvous, a view construction) while [ApEvent] signals
//! that data produced by a copy, fill or reduction is safe to consume.
//!
//! Events are futures. Blocking waits are available for threads outside of a node executor.
//! Triggering an event only wakes tasks and runs registered continuations; continuations are limited to
//! other event bookkeeping and message sends so triggering never re-enters manager state.

use crate::warnings::RuntimeWarning;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

/// Marker for control/metadata readiness
#[derive(Debug)]
pub struct Resource;
/// Marker for data readiness
#[derive(Debug)]
pub struct Data;

pub type RtEvent = Event<Resource>;
pub type ApEvent = Event<Data>;
pub type RtUserEvent = UserEvent<Resource>;
pub type ApUserEvent = UserEvent<Data>;

type Continuation = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct EventState {
    triggered: bool,
    wakers: Vec<Waker>,
    continuations: Vec<Continuation>,
}

#[derive(Default)]
pub(crate) struct EventCore {
    state: Mutex<EventState>,
    cvar: Condvar,
}

impl EventCore {
    fn trigger(&self) -> bool {
        let (wakers, continuations) = {
            let mut state = self.state.lock();
            if state.triggered {
                return false;
            }
            state.triggered = true;
            (
                std::mem::take(&mut state.wakers),
                std::mem::take(&mut state.continuations),
            )
        };
        self.cvar.notify_all();
        for waker in wakers {
            waker.wake();
        }
        for continuation in continuations {
            continuation();
        }
        true
    }

    fn has_triggered(&self) -> bool {
        self.state.lock().triggered
    }

    fn on_trigger(&self, continuation: Continuation) {
        let mut state = self.state.lock();
        if state.triggered {
            drop(state);
            continuation();
        } else {
            state.continuations.push(continuation);
        }
    }
}

pub struct Event<K> {
    core: Option<Arc<EventCore>>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for Event<K> {
    fn clone(&self) -> Self {
        Event {
            core: self.core.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K> Default for Event<K> {
    fn default() -> Self {
        Event::no_event()
    }
}

impl<K> std::fmt::Debug for Event<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.core {
            None => write!(f, "Event(NO_EVENT)"),
            Some(core) => write!(
                f,
                "Event({:p}, triggered: {})",
                Arc::as_ptr(core),
                core.has_triggered()
            ),
        }
    }
}

impl<K> Event<K> {
    /// An event that has already triggered
    pub fn no_event() -> Self {
        Event {
            core: None,
            _kind: PhantomData,
        }
    }

    fn from_core(core: Arc<EventCore>) -> Self {
        Event {
            core: Some(core),
            _kind: PhantomData,
        }
    }

    pub fn exists(&self) -> bool {
        self.core.is_some()
    }

    pub fn has_triggered(&self) -> bool {
        match &self.core {
            None => true,
            Some(core) => core.has_triggered(),
        }
    }

    /// Runs `continuation` once this event triggers, immediately if it already has
    pub(crate) fn on_trigger<F>(&self, continuation: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.core {
            None => continuation(),
            Some(core) => core.on_trigger(Box::new(continuation)),
        }
    }

    /// Returns an event that triggers once every event in `events` has triggered
    pub fn merge(events: impl IntoIterator<Item = Event<K>>) -> Event<K> {
        let mut pending: Vec<Arc<EventCore>> = events
            .into_iter()
            .filter_map(|e| e.core)
            .filter(|c| !c.has_triggered())
            .collect();
        match pending.len() {
            0 => Event::no_event(),
            1 => Event::from_core(pending.remove(0)),
            n => {
                let merged = Arc::new(EventCore::default());
                let remaining = Arc::new(AtomicUsize::new(n));
                for core in pending {
                    let merged = merged.clone();
                    let remaining = remaining.clone();
                    core.on_trigger(Box::new(move || {
                        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            merged.trigger();
                        }
                    }));
                }
                Event::from_core(merged)
            }
        }
    }

    /// Blocks the calling thread until the event triggers.
    ///
    /// Must not be called from a node executor thread, use `.await` there instead.
    pub fn wait(&self) {
        let core = match &self.core {
            None => return,
            Some(core) => core,
        };
        if crate::scheduler::on_worker_thread() {
            RuntimeWarning::BlockOnWorker("Event::wait").print();
        }
        let timeout = Duration::from_secs_f64(crate::config().deadlock_timeout.max(0.001));
        let start = Instant::now();
        let mut state = core.state.lock();
        while !state.triggered {
            if core.cvar.wait_for(&mut state, timeout).timed_out() {
                RuntimeWarning::BlockingWait("Event::wait", start.elapsed().as_secs_f64()).print();
            }
        }
    }

    /// Blocks for at most `timeout`, returning whether the event triggered
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let core = match &self.core {
            None => return true,
            Some(core) => core,
        };
        let deadline = Instant::now() + timeout;
        let mut state = core.state.lock();
        while !state.triggered {
            if core.cvar.wait_until(&mut state, deadline).timed_out() {
                return state.triggered;
            }
        }
        true
    }
}

impl<K> Future for Event<K> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let core = match &self.core {
            None => return Poll::Ready(()),
            Some(core) => core,
        };
        let mut state = core.state.lock();
        if state.triggered {
            Poll::Ready(())
        } else {
            if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                state.wakers.push(cx.waker().clone());
            }
            Poll::Pending
        }
    }
}

/// An event triggered explicitly by its creator
pub struct UserEvent<K> {
    event: Event<K>,
}

impl<K> Clone for UserEvent<K> {
    fn clone(&self) -> Self {
        UserEvent {
            event: self.event.clone(),
        }
    }
}

impl<K> std::fmt::Debug for UserEvent<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "User{:?}", self.event)
    }
}

impl<K> Default for UserEvent<K> {
    fn default() -> Self {
        UserEvent::new()
    }
}

impl<K> UserEvent<K> {
    pub fn new() -> Self {
        UserEvent {
            event: Event::from_core(Arc::new(EventCore::default())),
        }
    }

    pub fn event(&self) -> Event<K> {
        self.event.clone()
    }

    /// Returns false if the event had already been triggered
    pub fn trigger(&self) -> bool {
        match &self.event.core {
            Some(core) => core.trigger(),
            None => false,
        }
    }

    /// Triggers this event once `precondition` triggers
    pub fn trigger_on(&self, precondition: &Event<K>) {
        if let Some(core) = &self.event.core {
            let core = core.clone();
            precondition.on_trigger(move || {
                core.trigger();
            });
        }
    }
}

/// Names an event that lives on `node` so that other nodes can ask for it to be triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventToken {
    pub node: usize,
    pub id: u64,
}

struct Slot {
    core: Arc<EventCore>,
    claimed: bool,
    triggered: bool,
}

/// Per node table of events that may be triggered by messages.
///
/// A slot is created by whichever side touches the token first: `claim` (a local waiter) or
/// `trigger` (an incoming trigger message). The slot is dropped once both have happened.
pub(crate) struct EventRegistry {
    node: usize,
    next_id: AtomicU64,
    slots: Mutex<HashMap<EventToken, Slot>>,
}

impl EventRegistry {
    pub(crate) fn new(node: usize) -> EventRegistry {
        EventRegistry {
            node,
            next_id: AtomicU64::new(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// A fresh token owned by this node together with the event it names
    pub(crate) fn create<K>(&self) -> (EventToken, Event<K>) {
        let token = EventToken {
            node: self.node,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        (token, self.claim(token))
    }

    /// A fresh token for an event that will be claimed on another node
    pub(crate) fn fresh_token(&self) -> EventToken {
        EventToken {
            node: self.node,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub(crate) fn claim<K>(&self, token: EventToken) -> Event<K> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(token).or_insert_with(|| Slot {
            core: Arc::new(EventCore::default()),
            claimed: false,
            triggered: false,
        });
        slot.claimed = true;
        let core = slot.core.clone();
        if slot.triggered {
            slots.remove(&token);
        }
        Event::from_core(core)
    }

    pub(crate) fn trigger(&self, token: EventToken) {
        let core = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(token).or_insert_with(|| Slot {
                core: Arc::new(EventCore::default()),
                claimed: false,
                triggered: false,
            });
            slot.triggered = true;
            let core = slot.core.clone();
            if slot.claimed {
                slots.remove(&token);
            }
            core
        };
        core.trigger();
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.slots.lock().len()
    }
}
