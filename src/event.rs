//! Generational one-shot events.
//!
//! An [`Event`] handle names a generation of a [`GenEventImpl`] slot.
//! Each generation triggers exactly once; once a generation has
//! triggered it stays triggered, and triggering is idempotent. Waiters
//! are boxed continuations so that message-handler threads never block:
//! they mutate slot state and run the drained continuations after the
//! slot lock is released.
//!
//! On non-owner nodes the same slot type acts as a proxy: the first
//! local subscriber sends an `EventSubscribe` to the owner, and the
//! owner's `EventTrigger` notification fires the proxy's waiters.

use crate::error::{Error, ErrorKind, Result};
use crate::message::MessageBody;
use crate::barrier;
use crate::runtime::{EventImplRef, Runtime, RuntimeCore};
use crate::table::TableSlot;
use crate::types::{Generation, Id, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// A continuation run when an observed generation triggers.
///
/// The `bool` reports whether the generation was poisoned. Waiters run
/// on whichever thread performs the trigger and must not block.
pub(crate) type Waiter = Box<dyn FnOnce(&RuntimeCore, bool) + Send + 'static>;

/// A handle to one generation of an event.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize,
)]
pub struct Event {
    /// The event's id.
    pub id: Id,
    /// The observed generation.
    pub gen: Generation,
}

impl Event {
    /// The sentinel event; it is considered always triggered.
    pub const NO_EVENT: Self = Self {
        id: Id::NULL,
        gen: 0,
    };

    /// Returns true if this handle names a real event.
    #[must_use]
    pub const fn exists(&self) -> bool {
        !self.id.is_null()
    }

    /// Non-blocking triggered check for the observed generation.
    pub fn has_triggered(&self, rt: &Runtime) -> Result<bool> {
        Ok(observe(rt.core(), *self)?.0)
    }

    /// Blocks the calling thread until the observed generation triggers.
    ///
    /// Returns [`ErrorKind::PoisonedGeneration`] if the generation was
    /// poisoned.
    pub fn wait(&self, rt: &Runtime) -> Result<()> {
        wait(rt.core(), *self)
    }

    /// Triggers the observed generation. Must be called on the owner
    /// node.
    pub fn trigger(&self, rt: &Runtime) -> Result<()> {
        trigger(rt.core(), *self, false)
    }

    /// Triggers the observed generation as poisoned. Must be called on
    /// the owner node.
    pub fn poison(&self, rt: &Runtime) -> Result<()> {
        trigger(rt.core(), *self, true)
    }

    /// Returns an event that triggers once every input has triggered.
    ///
    /// The empty set yields [`Event::NO_EVENT`]; a single input is
    /// returned unchanged. Poison on any input poisons the merge.
    pub fn merge_events(rt: &Runtime, events: &[Event]) -> Result<Event> {
        merge_events(rt.core(), events)
    }
}

/// A generational event slot.
///
/// One instance per table slot; acts as the authoritative record on the
/// owner node and as a subscription proxy elsewhere.
#[derive(Debug)]
pub struct GenEventImpl {
    me: Id,
    owner: NodeId,
    state: Mutex<EventState>,
}

#[derive(Default)]
struct EventState {
    /// Most recently minted generation (owner side).
    num_gens: Generation,
    /// Every generation at or below this has triggered.
    triggered_gen: Generation,
    /// Generations that triggered poisoned.
    poisoned: BTreeSet<Generation>,
    /// Pending waiters keyed by the generation they observe.
    waiters: Vec<(Generation, Waiter)>,
    /// Nodes to notify on trigger (owner side).
    remote_subscribers: BTreeSet<NodeId>,
    /// Highest generation a subscription was sent for (proxy side).
    subscribe_sent_gen: Generation,
}

impl std::fmt::Debug for EventState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventState")
            .field("num_gens", &self.num_gens)
            .field("triggered_gen", &self.triggered_gen)
            .field("poisoned", &self.poisoned)
            .field("waiters", &self.waiters.len())
            .field("remote_subscribers", &self.remote_subscribers)
            .field("subscribe_sent_gen", &self.subscribe_sent_gen)
            .finish()
    }
}

impl TableSlot for GenEventImpl {
    fn create(id: Id, owner: NodeId) -> Self {
        Self {
            me: id,
            owner,
            state: Mutex::new(EventState::default()),
        }
    }
}

impl GenEventImpl {
    fn lock(&self) -> std::sync::MutexGuard<'_, EventState> {
        self.state.lock().expect("event slot lock poisoned")
    }
}

/// Mints a fresh untriggered event on the local node.
pub(crate) fn create(rt: &RuntimeCore) -> Result<Event> {
    let (_, slot) = rt.event_free_list().alloc(rt.local_node_events())?;
    let gen = {
        let mut st = slot.lock();
        st.num_gens += 1;
        st.num_gens
    };
    tracing::trace!(event = %slot.me, gen, "event created");
    Ok(Event { id: slot.me, gen })
}

/// Reports `(triggered, poisoned)` for the observed generation.
pub(crate) fn observe(rt: &RuntimeCore, e: Event) -> Result<(bool, bool)> {
    if !e.exists() || e.gen == 0 {
        return Ok((true, false));
    }
    match rt.event_impl(e.id)? {
        EventImplRef::Gen(imp) => {
            let st = imp.lock();
            Ok((e.gen <= st.triggered_gen, st.poisoned.contains(&e.gen)))
        }
        EventImplRef::Barrier(imp) => Ok(barrier::observe_generation(&imp, e.gen)),
    }
}

/// Registers a waiter on the observed generation, firing immediately if
/// it has already triggered.
pub(crate) fn subscribe(rt: &RuntimeCore, e: Event, waiter: Waiter) -> Result<()> {
    if !e.exists() || e.gen == 0 {
        waiter(rt, false);
        return Ok(());
    }
    match rt.event_impl(e.id)? {
        EventImplRef::Gen(imp) => subscribe_genevent(rt, &imp, e.gen, waiter),
        EventImplRef::Barrier(imp) => barrier::subscribe_publication(rt, &imp, e.gen, waiter),
    }
}

fn subscribe_genevent(
    rt: &RuntimeCore,
    imp: &Arc<GenEventImpl>,
    gen: Generation,
    waiter: Waiter,
) -> Result<()> {
    let mut subscribe_owner = None;
    {
        let mut st = imp.lock();
        if gen <= st.triggered_gen {
            let poisoned = st.poisoned.contains(&gen);
            drop(st);
            waiter(rt, poisoned);
            return Ok(());
        }
        st.waiters.push((gen, waiter));
        if imp.owner != rt.node_id() && st.subscribe_sent_gen < gen {
            st.subscribe_sent_gen = gen;
            subscribe_owner = Some(imp.owner);
        }
    }
    if let Some(owner) = subscribe_owner {
        rt.send_message(
            owner,
            MessageBody::EventSubscribe {
                event: imp.me,
                gen,
            },
        )?;
    }
    Ok(())
}

/// Triggers generation `e.gen`; owner-node entry point.
pub(crate) fn trigger(rt: &RuntimeCore, e: Event, poisoned: bool) -> Result<()> {
    if !e.exists() {
        return Ok(());
    }
    let imp = rt.genevent_impl(e.id)?;
    if imp.owner != rt.node_id() {
        return Err(Error::new(ErrorKind::NotOwner)
            .with_context(format!("event {} is owned by {}", imp.me, imp.owner)));
    }
    apply_trigger(rt, &imp, e.gen, poisoned)
}

/// Applies a trigger to a slot: the shared path for owner-side triggers
/// and proxy-side `EventTrigger` notifications.
pub(crate) fn apply_trigger(
    rt: &RuntimeCore,
    imp: &Arc<GenEventImpl>,
    gen: Generation,
    poisoned: bool,
) -> Result<()> {
    let is_owner = imp.owner == rt.node_id();
    let mut fired = Vec::new();
    let mut notify = Vec::new();
    let mut recycle = false;
    {
        let mut st = imp.lock();
        if gen <= st.triggered_gen {
            return Ok(());
        }
        st.triggered_gen = gen;
        if poisoned {
            st.poisoned.insert(gen);
        }
        let triggered_gen = st.triggered_gen;
        let taken = std::mem::take(&mut st.waiters);
        for (wgen, waiter) in taken {
            if wgen <= triggered_gen {
                let wpoisoned = st.poisoned.contains(&wgen);
                fired.push((waiter, wpoisoned));
            } else {
                st.waiters.push((wgen, waiter));
            }
        }
        if is_owner {
            notify = st.remote_subscribers.iter().copied().collect();
            st.remote_subscribers.clear();
            recycle = st.waiters.is_empty() && st.triggered_gen == st.num_gens;
        }
    }
    tracing::trace!(event = %imp.me, gen, poisoned, waiters = fired.len(), "event triggered");
    for (waiter, wpoisoned) in fired {
        waiter(rt, wpoisoned);
    }
    for target in notify {
        rt.send_message(
            target,
            MessageBody::EventTrigger {
                event: imp.me,
                gen,
                poisoned,
            },
        )?;
    }
    if recycle {
        rt.event_free_list().release(imp.me.index());
    }
    Ok(())
}

/// Owner-side handler for a remote `EventSubscribe`.
pub(crate) fn handle_subscribe(
    rt: &RuntimeCore,
    event: Id,
    gen: Generation,
    sender: NodeId,
) -> Result<()> {
    let imp = rt.genevent_impl(event)?;
    if imp.owner != rt.node_id() {
        return Err(Error::new(ErrorKind::Internal)
            .with_context(format!("subscription for {event} routed past its owner")));
    }
    let reply = {
        let mut st = imp.lock();
        if gen <= st.triggered_gen {
            Some((st.triggered_gen, st.poisoned.contains(&st.triggered_gen)))
        } else {
            st.remote_subscribers.insert(sender);
            None
        }
    };
    if let Some((triggered_gen, poisoned)) = reply {
        rt.send_message(
            sender,
            MessageBody::EventTrigger {
                event,
                gen: triggered_gen,
                poisoned,
            },
        )?;
    }
    Ok(())
}

/// Proxy-side handler for a remote `EventTrigger`.
pub(crate) fn handle_trigger(
    rt: &RuntimeCore,
    event: Id,
    gen: Generation,
    poisoned: bool,
) -> Result<()> {
    let imp = rt.genevent_impl(event)?;
    if imp.owner == rt.node_id() {
        return Err(Error::new(ErrorKind::Internal)
            .with_context(format!("trigger notification for {event} reached its own owner")));
    }
    apply_trigger(rt, &imp, gen, poisoned)
}

/// Condvar-backed completion used to park a thread on a continuation.
pub(crate) struct WaitCompletion {
    state: Mutex<Option<bool>>,
    cvar: Condvar,
}

impl WaitCompletion {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            cvar: Condvar::new(),
        })
    }

    /// Returns a waiter that completes this parker.
    pub(crate) fn as_waiter(self: &Arc<Self>) -> Waiter {
        let comp = Arc::clone(self);
        Box::new(move |_rt: &RuntimeCore, poisoned: bool| {
            *comp.state.lock().expect("wait completion lock poisoned") = Some(poisoned);
            comp.cvar.notify_all();
        })
    }

    /// Blocks until completed; returns the poison flag.
    pub(crate) fn block(&self) -> bool {
        let mut guard = self.state.lock().expect("wait completion lock poisoned");
        while guard.is_none() {
            guard = self
                .cvar
                .wait(guard)
                .expect("wait completion lock poisoned");
        }
        guard.unwrap_or(false)
    }
}

/// Blocks the calling thread until the observed generation triggers.
pub(crate) fn wait(rt: &RuntimeCore, e: Event) -> Result<()> {
    let comp = WaitCompletion::new();
    subscribe(rt, e, comp.as_waiter())?;
    let _blocking = crate::proc::blocking_section(rt);
    if comp.block() {
        Err(Error::new(ErrorKind::PoisonedGeneration)
            .with_context(format!("event {} gen {}", e.id, e.gen)))
    } else {
        Ok(())
    }
}

struct EventMerger {
    target: Event,
    remaining: AtomicUsize,
    poisoned: AtomicBool,
}

impl EventMerger {
    fn arm(self: &Arc<Self>) -> Waiter {
        let merger = Arc::clone(self);
        Box::new(move |rt: &RuntimeCore, poisoned: bool| {
            if poisoned {
                merger.poisoned.store(true, Ordering::Relaxed);
            }
            if merger.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                let poisoned = merger.poisoned.load(Ordering::Relaxed);
                if let Err(err) = trigger(rt, merger.target, poisoned) {
                    tracing::error!(%err, target = %merger.target.id, "merged event trigger failed");
                }
            }
        })
    }
}

/// Merges a set of events into one that triggers when all do.
pub(crate) fn merge_events(rt: &RuntimeCore, events: &[Event]) -> Result<Event> {
    let inputs: Vec<Event> = events.iter().copied().filter(Event::exists).collect();
    match inputs.len() {
        0 => return Ok(Event::NO_EVENT),
        1 => return Ok(inputs[0]),
        _ => {}
    }

    let merged = create(rt)?;
    // The extra count keeps the merge from firing while inputs are
    // still being registered.
    let merger = Arc::new(EventMerger {
        target: merged,
        remaining: AtomicUsize::new(inputs.len() + 1),
        poisoned: AtomicBool::new(false),
    });
    for input in &inputs {
        subscribe(rt, *input, merger.arm())?;
    }
    let arm = merger.arm();
    arm(rt, false);
    tracing::trace!(merged = %merged.id, inputs = inputs.len(), "events merged");
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_test_logging, test_runtime};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn user_event_triggers_once() {
        init_test_logging();
        crate::test_phase!("user_event_triggers_once");
        let rt = test_runtime();

        let e = rt.create_user_event().expect("create failed");
        assert!(!e.has_triggered(&rt).expect("observe failed"));

        e.trigger(&rt).expect("trigger failed");
        assert!(e.has_triggered(&rt).expect("observe failed"));
        e.wait(&rt).expect("wait failed");

        // Triggering an already-triggered generation is a no-op.
        e.trigger(&rt).expect("second trigger failed");
        assert!(e.has_triggered(&rt).expect("observe failed"));

        rt.shutdown();
        rt.wait_for_shutdown();
        crate::test_complete!("user_event_triggers_once");
    }

    #[test]
    fn no_event_is_always_triggered() {
        init_test_logging();
        let rt = test_runtime();
        assert!(Event::NO_EVENT.has_triggered(&rt).expect("observe failed"));
        Event::NO_EVENT.wait(&rt).expect("wait failed");
        rt.shutdown();
        rt.wait_for_shutdown();
    }

    #[test]
    fn generation_zero_subscribes_immediately() {
        init_test_logging();
        let rt = test_runtime();
        let e = rt.create_user_event().expect("create failed");
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&fired);
        subscribe(
            rt.core(),
            Event { id: e.id, gen: 0 },
            Box::new(move |_rt, _poisoned| {
                observed.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .expect("subscribe failed");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        rt.shutdown();
        rt.wait_for_shutdown();
    }

    #[test]
    fn poisoned_event_fails_wait() {
        init_test_logging();
        let rt = test_runtime();
        let e = rt.create_user_event().expect("create failed");
        e.poison(&rt).expect("poison failed");
        let err = e.wait(&rt).expect_err("expected poison");
        assert!(err.is_poisoned());
        rt.shutdown();
        rt.wait_for_shutdown();
    }

    #[test]
    fn merge_of_empty_set_is_no_event() {
        init_test_logging();
        let rt = test_runtime();
        let merged = Event::merge_events(&rt, &[]).expect("merge failed");
        assert_eq!(merged, Event::NO_EVENT);
        merged.wait(&rt).expect("wait failed");
        rt.shutdown();
        rt.wait_for_shutdown();
    }

    #[test]
    fn merge_of_one_event_is_that_event() {
        init_test_logging();
        let rt = test_runtime();
        let e = rt.create_user_event().expect("create failed");
        let merged = Event::merge_events(&rt, &[e]).expect("merge failed");
        assert_eq!(merged, e);
        rt.shutdown();
        rt.wait_for_shutdown();
    }

    #[test]
    fn merge_triggers_when_all_inputs_do() {
        init_test_logging();
        crate::test_phase!("merge_triggers_when_all_inputs_do");
        let rt = test_runtime();

        let a = rt.create_user_event().expect("create failed");
        let b = rt.create_user_event().expect("create failed");
        let merged = Event::merge_events(&rt, &[a, b]).expect("merge failed");
        assert!(!merged.has_triggered(&rt).expect("observe failed"));

        a.trigger(&rt).expect("trigger failed");
        assert!(!merged.has_triggered(&rt).expect("observe failed"));

        b.trigger(&rt).expect("trigger failed");
        assert!(merged.has_triggered(&rt).expect("observe failed"));
        merged.wait(&rt).expect("wait failed");

        rt.shutdown();
        rt.wait_for_shutdown();
        crate::test_complete!("merge_triggers_when_all_inputs_do");
    }

    #[test]
    fn merge_propagates_poison() {
        init_test_logging();
        let rt = test_runtime();
        let a = rt.create_user_event().expect("create failed");
        let b = rt.create_user_event().expect("create failed");
        let merged = Event::merge_events(&rt, &[a, b]).expect("merge failed");

        a.poison(&rt).expect("poison failed");
        b.trigger(&rt).expect("trigger failed");

        let err = merged.wait(&rt).expect_err("expected poison");
        assert!(err.is_poisoned());
        rt.shutdown();
        rt.wait_for_shutdown();
    }

    #[test]
    fn triggered_slot_is_recycled() {
        init_test_logging();
        let rt = test_runtime();
        let first = rt.create_user_event().expect("create failed");
        first.trigger(&rt).expect("trigger failed");
        let second = rt.create_user_event().expect("create failed");
        // The slot comes back with a higher generation, so the old
        // handle stays triggered and the new one starts fresh.
        assert_eq!(second.id, first.id);
        assert!(second.gen > first.gen);
        assert!(first.has_triggered(&rt).expect("observe failed"));
        assert!(!second.has_triggered(&rt).expect("observe failed"));
        second.trigger(&rt).expect("trigger failed");
        rt.shutdown();
        rt.wait_for_shutdown();
    }
}
