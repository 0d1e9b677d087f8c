//! Reservations: ID-addressed exclusive locks.
//!
//! Only the registry-facing sliver lives in the core: slot allocation
//! through the node's free list and a local exclusive acquire/release
//! with deferred grants. Acquisition returns an [`Event`] that triggers
//! when the reservation is granted, so callers queue instead of
//! blocking.

use crate::error::{Error, ErrorKind, Result};
use crate::event::{self, Event};
use crate::runtime::Runtime;
use crate::table::TableSlot;
use crate::types::{Id, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

/// A handle to a reservation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Reservation {
    /// The reservation's id.
    pub id: Id,
}

impl Reservation {
    /// Creates a reservation on the calling node.
    pub fn create_reservation(rt: &Runtime) -> Result<Self> {
        let core = rt.core();
        let (_, slot) = core
            .reservation_free_list()
            .alloc(core.local_node_reservations())?;
        Ok(Self { id: slot.me })
    }

    /// Requests exclusive ownership.
    ///
    /// Returns an event that triggers when the reservation is granted;
    /// an uncontended acquire returns an already-triggered event.
    pub fn acquire(&self, rt: &Runtime) -> Result<Event> {
        let core = rt.core();
        let imp = core.reservation_impl(self.id)?;
        if imp.owner != core.node_id() {
            return Err(Error::new(ErrorKind::NotOwner)
                .with_context(format!("reservation {} is owned by {}", self.id, imp.owner)));
        }
        {
            let mut st = imp.lock();
            if !st.held {
                st.held = true;
                return Ok(Event::NO_EVENT);
            }
        }
        // Contended: mint the grant event outside the slot lock, then
        // re-check in case the holder released in between.
        let grant = event::create(core)?;
        let granted_now = {
            let mut st = imp.lock();
            if st.held {
                st.pending.push_back(grant);
                false
            } else {
                st.held = true;
                true
            }
        };
        if granted_now {
            event::trigger(core, grant, false)?;
        }
        Ok(grant)
    }

    /// Releases ownership, granting the next queued acquirer if any.
    pub fn release(&self, rt: &Runtime) -> Result<()> {
        let core = rt.core();
        let imp = core.reservation_impl(self.id)?;
        if imp.owner != core.node_id() {
            return Err(Error::new(ErrorKind::NotOwner)
                .with_context(format!("reservation {} is owned by {}", self.id, imp.owner)));
        }
        let grant = {
            let mut st = imp.lock();
            if !st.held {
                return Err(Error::new(ErrorKind::Internal)
                    .with_context(format!("reservation {} released while free", self.id)));
            }
            match st.pending.pop_front() {
                Some(grant) => Some(grant),
                None => {
                    st.held = false;
                    None
                }
            }
        };
        if let Some(grant) = grant {
            event::trigger(core, grant, false)?;
        }
        Ok(())
    }
}

/// A reservation slot.
#[derive(Debug)]
pub struct ReservationImpl {
    pub(crate) me: Id,
    pub(crate) owner: NodeId,
    state: Mutex<ReservationState>,
}

#[derive(Debug, Default)]
struct ReservationState {
    held: bool,
    pending: VecDeque<Event>,
}

impl TableSlot for ReservationImpl {
    fn create(id: Id, owner: NodeId) -> Self {
        Self {
            me: id,
            owner,
            state: Mutex::new(ReservationState::default()),
        }
    }
}

impl ReservationImpl {
    fn lock(&self) -> std::sync::MutexGuard<'_, ReservationState> {
        self.state.lock().expect("reservation slot lock poisoned")
    }
}
