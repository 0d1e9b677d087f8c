//! Generational barriers with associated reductions.
//!
//! A [`Barrier`] handle names one generation (phase) of a
//! [`BarrierImpl`] slot. Participants contribute arrivals to a
//! generation, optionally folding a reduction value into the
//! generation's accumulator; when the received count reaches the
//! expected count the generation publishes: the folded accumulator is
//! applied onto a copy of the initial value, the result becomes
//! immutable, local waiters run, and remote result subscribers are sent
//! a `BarrierNotify`.
//!
//! Arrivals are non-stratified: a generation map (not a single counter)
//! accepts arrivals for any future phase while earlier phases are still
//! open. Arrivals within a generation commute; the published value
//! depends only on the multiset of contributed values.
//!
//! Slots are reclaimed through the owner's free list after
//! `destroy_barrier` once every materialized generation has completed.
//! Reuse bumps the slot's creator-generation tag; handles carrying the
//! old tag fail with `StaleHandle`.

use crate::error::{Error, ErrorKind, Result};
use crate::event::{self, Event, WaitCompletion, Waiter};
use crate::message::MessageBody;
use crate::reduction::{ReductionOp, ReductionOpId};
use crate::runtime::{Runtime, RuntimeCore};
use crate::table::TableSlot;
use crate::types::{Generation, Id, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// A handle to one generation of a barrier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Barrier {
    /// The barrier's id.
    pub id: Id,
    /// The phase this handle participates in.
    pub gen: Generation,
    creator_gen: u32,
    arrival_hint: u64,
}

impl Barrier {
    /// Creates a barrier on the calling node expecting `expected`
    /// arrivals per generation.
    ///
    /// `redop` optionally binds a registered reduction operator;
    /// `initial` is the generation-independent initial value (LHS-sized
    /// when a reduction is bound) returned when no values arrive.
    /// `expected == 0` publishes generation 1 immediately.
    pub fn create_barrier(
        rt: &Runtime,
        expected: u64,
        redop: Option<ReductionOpId>,
        initial: &[u8],
    ) -> Result<Self> {
        create(rt.core(), expected, redop, initial)
    }

    /// Contributes `count` arrivals to this generation once `wait_on`
    /// has triggered, optionally folding `value` into the accumulator.
    ///
    /// The caller never blocks: an unsatisfied precondition defers the
    /// arrival, and a poisoned precondition records a poison arrival.
    pub fn arrive(
        &self,
        rt: &Runtime,
        count: u64,
        wait_on: Event,
        value: Option<&[u8]>,
    ) -> Result<()> {
        arrive(rt.core(), *self, count, wait_on, value.map(<[u8]>::to_vec))
    }

    /// Returns the handle for the next phase. Pure; allocates nothing.
    #[must_use]
    pub const fn advance_barrier(&self) -> Self {
        Self {
            gen: self.gen + 1,
            ..*self
        }
    }

    /// Adjusts the expected arrival count of this generation and all
    /// not-yet-materialized future generations by `delta`.
    pub fn alter_arrival_count(&self, rt: &Runtime, delta: i64) -> Result<()> {
        alter(rt.core(), *self, delta)
    }

    /// Copies the published result into `out` if this generation has
    /// published on the local node.
    ///
    /// Returns `Ok(false)` without blocking when unpublished; the first
    /// miss from a non-owner node subscribes to the owner's
    /// publication. A poisoned generation reports
    /// [`ErrorKind::PoisonedGeneration`].
    pub fn get_result(&self, rt: &Runtime, out: &mut [u8]) -> Result<bool> {
        get_result(rt.core(), *self, out)
    }

    /// Blocks the calling thread until this generation publishes
    /// locally.
    pub fn wait(&self, rt: &Runtime) -> Result<()> {
        wait(rt.core(), *self)
    }

    /// Marks the barrier for reclamation; the owner releases the slot
    /// once every materialized generation has completed.
    pub fn destroy_barrier(&self, rt: &Runtime) -> Result<()> {
        destroy(rt.core(), *self)
    }

    /// The expected-arrival count the barrier was created with.
    #[must_use]
    pub const fn arrival_hint(&self) -> u64 {
        self.arrival_hint
    }
}

/// A barrier slot: authoritative on the owner node, a result cache and
/// subscription proxy elsewhere.
pub struct BarrierImpl {
    me: Id,
    owner: NodeId,
    state: Mutex<BarrierState>,
}

#[derive(Default)]
struct BarrierState {
    /// Bumped on every slot reuse; handles carry the value at creation.
    creator_gen: u32,
    in_use: bool,
    destroyed: bool,
    /// Expected arrivals for generations not yet materialized.
    base_count: u64,
    redop: Option<Arc<ReductionOp>>,
    initial: Vec<u8>,
    gens: BTreeMap<Generation, GenState>,
    /// Generations a result subscription was sent for (proxy side).
    subscribe_sent: BTreeSet<Generation>,
}

#[derive(Default)]
struct GenState {
    expected: u64,
    received: u64,
    accumulator: Vec<u8>,
    poisoned: bool,
    published: Option<Vec<u8>>,
    waiters: Vec<Waiter>,
    result_subscribers: BTreeSet<NodeId>,
}

impl TableSlot for BarrierImpl {
    fn create(id: Id, owner: NodeId) -> Self {
        Self {
            me: id,
            owner,
            state: Mutex::new(BarrierState::default()),
        }
    }
}

impl std::fmt::Debug for BarrierImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarrierImpl")
            .field("me", &self.me)
            .field("owner", &self.owner)
            .finish()
    }
}

impl BarrierImpl {
    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().expect("barrier slot lock poisoned")
    }
}

/// Deferred side effects of a publication, run after the slot lock is
/// released.
struct Publication {
    barrier: Id,
    gen: Generation,
    value: Vec<u8>,
    poisoned: bool,
    waiters: Vec<Waiter>,
    subscribers: Vec<NodeId>,
}

fn check_handle(st: &BarrierState, creator_gen: u32, me: Id) -> Result<()> {
    if st.in_use && st.creator_gen == creator_gen {
        Ok(())
    } else {
        Err(Error::new(ErrorKind::StaleHandle)
            .with_context(format!("barrier {me} (creator generation {creator_gen})")))
    }
}

/// Materializes a generation record if absent.
fn touch_gen(st: &mut BarrierState, gen: Generation) -> Result<()> {
    if gen == 0 {
        return Err(Error::new(ErrorKind::Internal).with_context("barrier generation 0"));
    }
    if !st.gens.contains_key(&gen) {
        if st.destroyed {
            return Err(Error::new(ErrorKind::StaleHandle)
                .with_context("arrival for a new generation of a destroyed barrier"));
        }
        let accumulator = st.redop.as_ref().map(|op| op.identity.clone()).unwrap_or_default();
        st.gens.insert(
            gen,
            GenState {
                expected: st.base_count,
                accumulator,
                ..GenState::default()
            },
        );
    }
    Ok(())
}

/// Publishes `gen` if its expected count has been reached.
fn maybe_publish(st: &mut BarrierState, me: Id, gen: Generation) -> Result<Option<Publication>> {
    let redop = st.redop.clone();
    let initial = st.initial.clone();
    let Some(g) = st.gens.get_mut(&gen) else {
        return Ok(None);
    };
    if g.published.is_some() || g.received != g.expected {
        return Ok(None);
    }
    let mut value = initial;
    if let Some(op) = redop {
        op.apply(&mut value, &g.accumulator)?;
    }
    g.published = Some(value.clone());
    Ok(Some(Publication {
        barrier: me,
        gen,
        value,
        poisoned: g.poisoned,
        waiters: std::mem::take(&mut g.waiters),
        subscribers: std::mem::take(&mut g.result_subscribers).into_iter().collect(),
    }))
}

/// Reaps a destroyed slot whose generations have all completed.
/// Returns the slot index to release, if any.
fn maybe_reap(st: &mut BarrierState, me: Id) -> Option<u64> {
    let drained = st
        .gens
        .values()
        .all(|g| g.published.is_some() && g.waiters.is_empty());
    if st.in_use && st.destroyed && drained {
        st.in_use = false;
        st.destroyed = false;
        st.creator_gen += 1;
        st.gens.clear();
        st.subscribe_sent.clear();
        Some(me.index())
    } else {
        None
    }
}

/// Runs a publication's deferred effects: waiters, then notifies.
fn run_publication(rt: &RuntimeCore, p: Publication) {
    tracing::debug!(
        barrier = %p.barrier,
        gen = p.gen,
        poisoned = p.poisoned,
        waiters = p.waiters.len(),
        subscribers = p.subscribers.len(),
        "barrier generation published"
    );
    for waiter in p.waiters {
        waiter(rt, p.poisoned);
    }
    for target in p.subscribers {
        if let Err(err) = rt.send_message(
            target,
            MessageBody::BarrierNotify {
                barrier: p.barrier,
                gen: p.gen,
                value: p.value.clone(),
                poisoned: p.poisoned,
            },
        ) {
            tracing::error!(%err, %target, "barrier notify failed");
        }
    }
}

fn create(
    rt: &RuntimeCore,
    expected: u64,
    redop_id: Option<ReductionOpId>,
    initial: &[u8],
) -> Result<Barrier> {
    let redop = match redop_id {
        Some(id) => {
            let op = rt.reductions().get(id)?;
            if initial.len() != op.lhs_size {
                return Err(Error::new(ErrorKind::ReductionSizeMismatch).with_context(format!(
                    "initial value is {} bytes, redop {} lhs is {}",
                    initial.len(),
                    id,
                    op.lhs_size
                )));
            }
            Some(op)
        }
        None => None,
    };
    let (_, slot) = rt.barrier_free_list().alloc(rt.local_node_barriers())?;
    let (creator_gen, publication) = {
        let mut st = slot.lock();
        st.in_use = true;
        st.destroyed = false;
        st.base_count = expected;
        st.redop = redop;
        st.initial = initial.to_vec();
        st.gens.clear();
        st.subscribe_sent.clear();
        touch_gen(&mut st, 1)?;
        let publication = maybe_publish(&mut st, slot.me, 1)?;
        (st.creator_gen, publication)
    };
    if let Some(p) = publication {
        run_publication(rt, p);
    }
    tracing::debug!(barrier = %slot.me, expected, "barrier created");
    Ok(Barrier {
        id: slot.me,
        gen: 1,
        creator_gen,
        arrival_hint: expected,
    })
}

fn arrive(
    rt: &RuntimeCore,
    b: Barrier,
    count: u64,
    wait_on: Event,
    value: Option<Vec<u8>>,
) -> Result<()> {
    let (triggered, poisoned) = event::observe(rt, wait_on)?;
    if triggered {
        return perform_arrival(rt, b, count, value, poisoned);
    }
    event::subscribe(
        rt,
        wait_on,
        Box::new(move |rt: &RuntimeCore, poisoned: bool| {
            if let Err(err) = perform_arrival(rt, b, count, value, poisoned) {
                tracing::error!(%err, barrier = %b.id, gen = b.gen, "deferred arrival failed");
            }
        }),
    )
}

fn perform_arrival(
    rt: &RuntimeCore,
    b: Barrier,
    count: u64,
    value: Option<Vec<u8>>,
    poisoned: bool,
) -> Result<()> {
    let imp = rt.barrier_impl(b.id)?;
    if imp.owner == rt.node_id() {
        apply_arrival(rt, &imp, b.creator_gen, b.gen, count, value.as_deref(), poisoned)
    } else {
        rt.send_message(
            imp.owner,
            MessageBody::BarrierArrival {
                barrier: b.id,
                creator_gen: b.creator_gen,
                gen: b.gen,
                count,
                value,
                poisoned,
            },
        )
    }
}

/// Owner-side arrival accumulation; shared by local arrivals and the
/// `BarrierArrival` message handler.
pub(crate) fn apply_arrival(
    rt: &RuntimeCore,
    imp: &Arc<BarrierImpl>,
    creator_gen: u32,
    gen: Generation,
    count: u64,
    value: Option<&[u8]>,
    poisoned: bool,
) -> Result<()> {
    if imp.owner != rt.node_id() {
        return Err(Error::new(ErrorKind::Internal)
            .with_context(format!("arrival for {} routed past its owner", imp.me)));
    }
    let (publication, reaped) = {
        let mut st = imp.lock();
        check_handle(&st, creator_gen, imp.me)?;
        touch_gen(&mut st, gen)?;
        let redop = st.redop.clone();
        let g = st
            .gens
            .get_mut(&gen)
            .ok_or_else(|| Error::new(ErrorKind::Internal).with_context("generation vanished"))?;
        if count > 0 {
            if g.received + count > g.expected {
                return Err(Error::new(ErrorKind::Internal).with_context(format!(
                    "barrier {} gen {gen}: {} arrivals exceed expected {}",
                    imp.me,
                    g.received + count,
                    g.expected
                )));
            }
            g.received += count;
        }
        if poisoned {
            g.poisoned = true;
        }
        if let Some(v) = value {
            let op = redop.ok_or_else(|| {
                Error::new(ErrorKind::UnknownReduction)
                    .with_context(format!("barrier {} has no bound reduction", imp.me))
            })?;
            op.fold(&mut g.accumulator, v)?;
        }
        tracing::trace!(
            barrier = %imp.me,
            gen,
            count,
            received = g.received,
            expected = g.expected,
            "barrier arrival"
        );
        let publication = maybe_publish(&mut st, imp.me, gen)?;
        let reaped = if publication.is_some() {
            maybe_reap(&mut st, imp.me)
        } else {
            None
        };
        (publication, reaped)
    };
    if let Some(p) = publication {
        run_publication(rt, p);
    }
    if let Some(index) = reaped {
        rt.barrier_free_list().release(index);
    }
    Ok(())
}

fn alter(rt: &RuntimeCore, b: Barrier, delta: i64) -> Result<()> {
    if delta == 0 {
        return Ok(());
    }
    let imp = rt.barrier_impl(b.id)?;
    if imp.owner != rt.node_id() {
        return rt.send_message(
            imp.owner,
            MessageBody::BarrierAdjust {
                barrier: b.id,
                creator_gen: b.creator_gen,
                gen: b.gen,
                delta,
            },
        );
    }
    apply_adjust(rt, &imp, b.creator_gen, b.gen, delta)
}

/// Owner-side arrival-count adjustment; shared by local alters and the
/// `BarrierAdjust` message handler.
pub(crate) fn apply_adjust(
    rt: &RuntimeCore,
    imp: &Arc<BarrierImpl>,
    creator_gen: u32,
    gen: Generation,
    delta: i64,
) -> Result<()> {
    if imp.owner != rt.node_id() {
        return Err(Error::new(ErrorKind::Internal)
            .with_context(format!("adjustment for {} routed past its owner", imp.me)));
    }
    let publications = {
        let mut st = imp.lock();
        check_handle(&st, creator_gen, imp.me)?;
        if st.destroyed {
            return Err(Error::new(ErrorKind::StaleHandle)
                .with_context("arrival-count adjustment on a destroyed barrier"));
        }

        // Validate every affected generation before mutating any.
        let new_base = i128::from(st.base_count) + i128::from(delta);
        if new_base < 0 {
            return Err(Error::new(ErrorKind::ArrivalCountUnderflow)
                .with_context(format!("base count {} with delta {delta}", st.base_count)));
        }
        for (g_gen, g) in st.gens.range(gen..) {
            if g.published.is_some() {
                return Err(Error::new(ErrorKind::ArrivalCountUnderflow)
                    .with_context(format!("generation {g_gen} already published")));
            }
            let new_expected = i128::from(g.expected) + i128::from(delta);
            if new_expected < i128::from(g.received) {
                return Err(Error::new(ErrorKind::ArrivalCountUnderflow).with_context(format!(
                    "generation {g_gen}: expected {new_expected} below received {}",
                    g.received
                )));
            }
        }

        st.base_count = new_base as u64;
        let affected: Vec<Generation> = st.gens.range(gen..).map(|(g, _)| *g).collect();
        let mut publications = Vec::new();
        for g_gen in affected {
            if let Some(g) = st.gens.get_mut(&g_gen) {
                g.expected = (i128::from(g.expected) + i128::from(delta)) as u64;
            }
            if let Some(p) = maybe_publish(&mut st, imp.me, g_gen)? {
                publications.push(p);
            }
        }
        publications
    };
    for p in publications {
        run_publication(rt, p);
    }
    Ok(())
}

fn get_result(rt: &RuntimeCore, b: Barrier, out: &mut [u8]) -> Result<bool> {
    let imp = rt.barrier_impl(b.id)?;
    let is_owner = imp.owner == rt.node_id();
    let mut subscribe = false;
    let mut publication = None;
    let outcome = {
        let mut st = imp.lock();
        if is_owner {
            check_handle(&st, b.creator_gen, imp.me)?;
            touch_gen(&mut st, b.gen)?;
            // A zero-expected generation publishes on first touch.
            publication = maybe_publish(&mut st, imp.me, b.gen)?;
        }
        match st.gens.get(&b.gen) {
            Some(g) if g.poisoned && g.published.is_some() => {
                Err(Error::new(ErrorKind::PoisonedGeneration)
                    .with_context(format!("barrier {} gen {}", b.id, b.gen)))
            }
            Some(g) if g.published.is_some() => {
                let value = g.published.as_ref().expect("published value present");
                if out.len() == value.len() {
                    out.copy_from_slice(value);
                    Ok(true)
                } else {
                    Err(Error::new(ErrorKind::ReductionSizeMismatch).with_context(format!(
                        "result is {} bytes, buffer is {}",
                        value.len(),
                        out.len()
                    )))
                }
            }
            _ => {
                if !is_owner && st.subscribe_sent.insert(b.gen) {
                    subscribe = true;
                }
                Ok(false)
            }
        }
    };
    if let Some(p) = publication {
        run_publication(rt, p);
    }
    if subscribe {
        rt.send_message(
            imp.owner,
            MessageBody::BarrierResultSubscribe {
                barrier: b.id,
                gen: b.gen,
            },
        )?;
    }
    outcome
}

fn wait(rt: &RuntimeCore, b: Barrier) -> Result<()> {
    let imp = rt.barrier_impl(b.id)?;
    if imp.owner == rt.node_id() {
        check_handle(&imp.lock(), b.creator_gen, imp.me)?;
    }
    let comp = WaitCompletion::new();
    subscribe_publication(rt, &imp, b.gen, comp.as_waiter())?;
    let _blocking = crate::proc::blocking_section(rt);
    if comp.block() {
        Err(Error::new(ErrorKind::PoisonedGeneration)
            .with_context(format!("barrier {} gen {}", b.id, b.gen)))
    } else {
        Ok(())
    }
}

fn destroy(rt: &RuntimeCore, b: Barrier) -> Result<()> {
    let imp = rt.barrier_impl(b.id)?;
    if imp.owner != rt.node_id() {
        return Err(Error::new(ErrorKind::NotOwner)
            .with_context(format!("barrier {} is owned by {}", b.id, imp.owner)));
    }
    let reaped = {
        let mut st = imp.lock();
        check_handle(&st, b.creator_gen, imp.me)?;
        st.destroyed = true;
        maybe_reap(&mut st, imp.me)
    };
    tracing::debug!(barrier = %b.id, reaped = reaped.is_some(), "barrier destroyed");
    if let Some(index) = reaped {
        rt.barrier_free_list().release(index);
    }
    Ok(())
}

/// Reports `(published, poisoned)` for a generation on the local node.
pub(crate) fn observe_generation(imp: &Arc<BarrierImpl>, gen: Generation) -> (bool, bool) {
    let st = imp.lock();
    st.gens
        .get(&gen)
        .map_or((false, false), |g| (g.published.is_some(), g.poisoned))
}

/// Registers a waiter on a generation's local publication, firing
/// immediately if already published. Non-owner registrations subscribe
/// to the owner's publication on first use.
pub(crate) fn subscribe_publication(
    rt: &RuntimeCore,
    imp: &Arc<BarrierImpl>,
    gen: Generation,
    waiter: Waiter,
) -> Result<()> {
    let is_owner = imp.owner == rt.node_id();
    let mut waiter = Some(waiter);
    let mut fire = None;
    let mut subscribe = false;
    let mut publication = None;
    {
        let mut st = imp.lock();
        if is_owner {
            if !st.in_use {
                return Err(Error::new(ErrorKind::StaleHandle)
                    .with_context(format!("barrier {} slot is not live", imp.me)));
            }
            touch_gen(&mut st, gen)?;
            // A zero-expected generation publishes on first touch.
            publication = maybe_publish(&mut st, imp.me, gen)?;
        }
        let registered = {
            let g = st.gens.entry(gen).or_default();
            if g.published.is_some() {
                fire = Some(g.poisoned);
                false
            } else {
                g.waiters.push(waiter.take().expect("waiter already consumed"));
                true
            }
        };
        if registered && !is_owner && st.subscribe_sent.insert(gen) {
            subscribe = true;
        }
    }
    if let Some(p) = publication {
        run_publication(rt, p);
    }
    if let (Some(poisoned), Some(waiter)) = (fire, waiter) {
        waiter(rt, poisoned);
    }
    if subscribe {
        rt.send_message(
            imp.owner,
            MessageBody::BarrierResultSubscribe {
                barrier: imp.me,
                gen,
            },
        )?;
    }
    Ok(())
}

/// Owner-side handler for a remote `BarrierResultSubscribe`.
pub(crate) fn handle_result_subscribe(
    rt: &RuntimeCore,
    barrier: Id,
    gen: Generation,
    sender: NodeId,
) -> Result<()> {
    let imp = rt.barrier_impl(barrier)?;
    if imp.owner != rt.node_id() {
        return Err(Error::new(ErrorKind::Internal)
            .with_context(format!("subscription for {barrier} routed past its owner")));
    }
    let (reply, publication) = {
        let mut st = imp.lock();
        if !st.in_use {
            tracing::warn!(%barrier, gen, %sender, "result subscription for a dead barrier slot");
            return Ok(());
        }
        touch_gen(&mut st, gen)?;
        let publication = maybe_publish(&mut st, imp.me, gen)?;
        let g = st
            .gens
            .get_mut(&gen)
            .ok_or_else(|| Error::new(ErrorKind::Internal).with_context("generation vanished"))?;
        let reply = if let Some(v) = g.published.as_ref() {
            Some((v.clone(), g.poisoned))
        } else {
            g.result_subscribers.insert(sender);
            None
        };
        (reply, publication)
    };
    if let Some(p) = publication {
        run_publication(rt, p);
    }
    if let Some((value, poisoned)) = reply {
        rt.send_message(
            sender,
            MessageBody::BarrierNotify {
                barrier,
                gen,
                value,
                poisoned,
            },
        )?;
    }
    Ok(())
}

/// Proxy-side handler for a `BarrierNotify`: caches the published value
/// and wakes local waiters.
pub(crate) fn handle_notify(
    rt: &RuntimeCore,
    barrier: Id,
    gen: Generation,
    value: Vec<u8>,
    poisoned: bool,
) -> Result<()> {
    let imp = rt.barrier_impl(barrier)?;
    if imp.owner == rt.node_id() {
        return Err(Error::new(ErrorKind::Internal)
            .with_context(format!("notification for {barrier} reached its own owner")));
    }
    let waiters = {
        let mut st = imp.lock();
        let g = st.gens.entry(gen).or_default();
        if g.published.is_none() {
            g.published = Some(value);
            g.poisoned = poisoned;
        }
        std::mem::take(&mut g.waiters)
    };
    tracing::trace!(%barrier, gen, poisoned, waiters = waiters.len(), "barrier result cached");
    for waiter in waiters {
        waiter(rt, poisoned);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduction::ReductionOp;
    use crate::test_utils::{init_test_logging, test_runtime};
    use crate::ErrorKind;

    const REDOP_ADD: crate::ReductionOpId = 1;

    fn add_runtime() -> crate::Runtime {
        let rt = test_runtime();
        rt.register_reduction(ReductionOp::int_add(REDOP_ADD))
            .expect("register failed");
        rt
    }

    fn read_i32(rt: &crate::Runtime, b: &Barrier) -> Option<i32> {
        let mut out = [0_u8; 4];
        match b.get_result(rt, &mut out).expect("get_result failed") {
            true => Some(i32::from_le_bytes(out)),
            false => None,
        }
    }

    #[test]
    fn sum_reduction_publishes_folded_value() {
        init_test_logging();
        crate::test_phase!("sum_reduction_publishes_folded_value");
        let rt = add_runtime();

        let b = Barrier::create_barrier(&rt, 2, Some(REDOP_ADD), &42_i32.to_le_bytes())
            .expect("create failed");
        assert_eq!(read_i32(&rt, &b), None);

        b.arrive(&rt, 1, Event::NO_EVENT, Some(&5_i32.to_le_bytes()))
            .expect("arrive failed");
        assert_eq!(read_i32(&rt, &b), None);

        b.arrive(&rt, 1, Event::NO_EVENT, Some(&7_i32.to_le_bytes()))
            .expect("arrive failed");
        crate::assert_with_log!(
            read_i32(&rt, &b) == Some(54),
            "published sum",
            Some(54),
            read_i32(&rt, &b)
        );
        b.wait(&rt).expect("wait after publication failed");

        rt.shutdown();
        rt.wait_for_shutdown();
        crate::test_complete!("sum_reduction_publishes_folded_value");
    }

    #[test]
    fn zero_expected_publishes_immediately() {
        init_test_logging();
        let rt = test_runtime();
        let b = Barrier::create_barrier(&rt, 0, None, b"seed").expect("create failed");
        let mut out = [0_u8; 4];
        assert!(b.get_result(&rt, &mut out).expect("get_result failed"));
        assert_eq!(&out, b"seed");

        // Advanced generations of a zero-expected barrier publish on
        // first touch as well.
        let next = b.advance_barrier();
        assert!(next.get_result(&rt, &mut out).expect("get_result failed"));
        assert_eq!(&out, b"seed");
        rt.shutdown();
        rt.wait_for_shutdown();
    }

    #[test]
    fn no_redop_publishes_initial_unchanged() {
        init_test_logging();
        let rt = test_runtime();
        let b = Barrier::create_barrier(&rt, 1, None, b"init").expect("create failed");
        b.arrive(&rt, 1, Event::NO_EVENT, None).expect("arrive failed");
        let mut out = [0_u8; 4];
        assert!(b.get_result(&rt, &mut out).expect("get_result failed"));
        assert_eq!(&out, b"init");
        rt.shutdown();
        rt.wait_for_shutdown();
    }

    #[test]
    fn arrivals_for_future_generations_are_accepted() {
        init_test_logging();
        crate::test_phase!("arrivals_for_future_generations_are_accepted");
        let rt = add_runtime();
        let b = Barrier::create_barrier(&rt, 1, Some(REDOP_ADD), &0_i32.to_le_bytes())
            .expect("create failed");
        let later = b.advance_barrier().advance_barrier();

        // Generation 3 fills up while generation 1 is still open.
        later
            .arrive(&rt, 1, Event::NO_EVENT, Some(&9_i32.to_le_bytes()))
            .expect("arrive failed");
        assert_eq!(read_i32(&rt, &later), Some(9));
        assert_eq!(read_i32(&rt, &b), None);

        b.arrive(&rt, 1, Event::NO_EVENT, Some(&1_i32.to_le_bytes()))
            .expect("arrive failed");
        assert_eq!(read_i32(&rt, &b), Some(1));

        rt.shutdown();
        rt.wait_for_shutdown();
        crate::test_complete!("arrivals_for_future_generations_are_accepted");
    }

    #[test]
    fn advance_increments_generation() {
        init_test_logging();
        let rt = test_runtime();
        let b = Barrier::create_barrier(&rt, 1, None, &[]).expect("create failed");
        let mut handle = b;
        for expected_gen in 1..=5 {
            assert_eq!(handle.gen, expected_gen);
            handle = handle.advance_barrier();
        }
        rt.shutdown();
        rt.wait_for_shutdown();
    }

    #[test]
    fn excess_arrivals_fail_fast() {
        init_test_logging();
        let rt = test_runtime();
        let b = Barrier::create_barrier(&rt, 1, None, &[]).expect("create failed");
        b.arrive(&rt, 1, Event::NO_EVENT, None).expect("arrive failed");
        let err = b
            .arrive(&rt, 1, Event::NO_EVENT, None)
            .expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::Internal);
        rt.shutdown();
        rt.wait_for_shutdown();
    }

    #[test]
    fn zero_count_arrival_is_a_no_op() {
        init_test_logging();
        let rt = test_runtime();
        let b = Barrier::create_barrier(&rt, 1, None, &[]).expect("create failed");
        b.arrive(&rt, 0, Event::NO_EVENT, None).expect("arrive failed");
        let mut out = [0_u8; 0];
        assert!(!b.get_result(&rt, &mut out).expect("get_result failed"));
        b.arrive(&rt, 1, Event::NO_EVENT, None).expect("arrive failed");
        assert!(b.get_result(&rt, &mut out).expect("get_result failed"));
        rt.shutdown();
        rt.wait_for_shutdown();
    }

    #[test]
    fn alter_arrival_count_can_publish() {
        init_test_logging();
        crate::test_phase!("alter_arrival_count_can_publish");
        let rt = add_runtime();
        let b = Barrier::create_barrier(&rt, 3, Some(REDOP_ADD), &0_i32.to_le_bytes())
            .expect("create failed");
        b.arrive(&rt, 1, Event::NO_EVENT, Some(&4_i32.to_le_bytes()))
            .expect("arrive failed");
        assert_eq!(read_i32(&rt, &b), None);

        // Zero delta is a no-op.
        b.alter_arrival_count(&rt, 0).expect("alter failed");
        assert_eq!(read_i32(&rt, &b), None);

        // Dropping the expectation to the received count publishes.
        b.alter_arrival_count(&rt, -2).expect("alter failed");
        assert_eq!(read_i32(&rt, &b), Some(4));

        rt.shutdown();
        rt.wait_for_shutdown();
        crate::test_complete!("alter_arrival_count_can_publish");
    }

    #[test]
    fn alter_underflow_is_rejected() {
        init_test_logging();
        let rt = test_runtime();
        let b = Barrier::create_barrier(&rt, 2, None, &[]).expect("create failed");
        b.arrive(&rt, 1, Event::NO_EVENT, None).expect("arrive failed");
        let err = b
            .alter_arrival_count(&rt, -2)
            .expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::ArrivalCountUnderflow);

        // A published generation cannot be adjusted either.
        b.arrive(&rt, 1, Event::NO_EVENT, None).expect("arrive failed");
        let err = b.alter_arrival_count(&rt, 1).expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::ArrivalCountUnderflow);
        rt.shutdown();
        rt.wait_for_shutdown();
    }

    #[test]
    fn alter_applies_to_future_generations() {
        init_test_logging();
        let rt = test_runtime();
        let b = Barrier::create_barrier(&rt, 2, None, &[]).expect("create failed");
        b.alter_arrival_count(&rt, -1).expect("alter failed");

        // Both the current and the next generation now expect one.
        b.arrive(&rt, 1, Event::NO_EVENT, None).expect("arrive failed");
        let mut out = [0_u8; 0];
        assert!(b.get_result(&rt, &mut out).expect("get_result failed"));
        let next = b.advance_barrier();
        next.arrive(&rt, 1, Event::NO_EVENT, None).expect("arrive failed");
        assert!(next.get_result(&rt, &mut out).expect("get_result failed"));
        rt.shutdown();
        rt.wait_for_shutdown();
    }

    #[test]
    fn deferred_arrival_waits_for_precondition() {
        init_test_logging();
        crate::test_phase!("deferred_arrival_waits_for_precondition");
        let rt = add_runtime();
        let gate = rt.create_user_event().expect("create failed");
        let b = Barrier::create_barrier(&rt, 2, Some(REDOP_ADD), &0_i32.to_le_bytes())
            .expect("create failed");

        b.arrive(&rt, 1, gate, Some(&3_i32.to_le_bytes()))
            .expect("arrive failed");
        b.arrive(&rt, 1, Event::NO_EVENT, Some(&4_i32.to_le_bytes()))
            .expect("arrive failed");
        assert_eq!(read_i32(&rt, &b), None);

        gate.trigger(&rt).expect("trigger failed");
        assert_eq!(read_i32(&rt, &b), Some(7));

        rt.shutdown();
        rt.wait_for_shutdown();
        crate::test_complete!("deferred_arrival_waits_for_precondition");
    }

    #[test]
    fn poisoned_precondition_poisons_the_generation() {
        init_test_logging();
        let rt = add_runtime();
        let gate = rt.create_user_event().expect("create failed");
        let b = Barrier::create_barrier(&rt, 2, Some(REDOP_ADD), &0_i32.to_le_bytes())
            .expect("create failed");

        b.arrive(&rt, 1, gate, Some(&3_i32.to_le_bytes()))
            .expect("arrive failed");
        b.arrive(&rt, 1, Event::NO_EVENT, Some(&4_i32.to_le_bytes()))
            .expect("arrive failed");
        gate.poison(&rt).expect("poison failed");

        let mut out = [0_u8; 4];
        let err = b.get_result(&rt, &mut out).expect_err("expected poison");
        assert_eq!(err.kind(), ErrorKind::PoisonedGeneration);
        rt.shutdown();
        rt.wait_for_shutdown();
    }

    #[test]
    fn destroyed_slot_rejects_stale_handles() {
        init_test_logging();
        crate::test_phase!("destroyed_slot_rejects_stale_handles");
        let rt = test_runtime();

        let stale = Barrier::create_barrier(&rt, 1, None, &[]).expect("create failed");
        stale.arrive(&rt, 1, Event::NO_EVENT, None).expect("arrive failed");
        stale.destroy_barrier(&rt).expect("destroy failed");

        // The replacement reuses the slot under a new creator tag.
        let fresh = Barrier::create_barrier(&rt, 1, None, &[]).expect("create failed");
        assert_eq!(fresh.id, stale.id);

        let err = stale
            .arrive(&rt, 1, Event::NO_EVENT, None)
            .expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::StaleHandle);
        let mut out = [0_u8; 0];
        let err = stale.get_result(&rt, &mut out).expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::StaleHandle);

        // The fresh barrier is unaffected.
        fresh.arrive(&rt, 1, Event::NO_EVENT, None).expect("arrive failed");
        assert!(fresh.get_result(&rt, &mut out).expect("get_result failed"));

        rt.shutdown();
        rt.wait_for_shutdown();
        crate::test_complete!("destroyed_slot_rejects_stale_handles");
    }

    #[test]
    fn result_buffer_size_is_checked() {
        init_test_logging();
        let rt = add_runtime();
        let b = Barrier::create_barrier(&rt, 0, Some(REDOP_ADD), &42_i32.to_le_bytes())
            .expect("create failed");
        let mut small = [0_u8; 2];
        let err = b.get_result(&rt, &mut small).expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::ReductionSizeMismatch);
        rt.shutdown();
        rt.wait_for_shutdown();
    }
}
