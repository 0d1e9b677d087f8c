//! Per-node registry of ID-addressed objects.
//!
//! Every node in the machine is mirrored by a [`Node`] record on every
//! peer: the local node's tables are authoritative and fed by the
//! runtime's free lists, while remote nodes' tables hold lazily
//! allocated proxy slots that carry subscription state. Memories and
//! processors are fixed at startup.

use crate::barrier::BarrierImpl;
use crate::event::GenEventImpl;
use crate::index_space::IndexSpaceImpl;
use crate::proc::ProcessorImpl;
use crate::proc_group::ProcessorGroupImpl;
use crate::reservation::ReservationImpl;
use crate::table::DynamicTable;
use crate::types::{Id, IdKind, NodeId};
use std::sync::Arc;

/// The flavor of a memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Ordinary system memory.
    System,
}

/// A fixed memory record.
#[derive(Debug, Clone)]
pub struct MemoryInfo {
    /// The memory's id.
    pub id: Id,
    /// The memory's kind.
    pub kind: MemoryKind,
    /// Capacity in bytes.
    pub capacity: u64,
}

/// One node's registry: fixed memories/processors plus one dynamic
/// table per ID-addressed kind.
#[derive(Debug)]
pub struct Node {
    /// Fixed at startup; not resizable.
    pub memories: Vec<MemoryInfo>,
    /// Populated only on the node itself; empty in peers' mirrors.
    pub processors: Vec<Arc<ProcessorImpl>>,
    /// Generational events owned by this node.
    pub events: DynamicTable<GenEventImpl>,
    /// Barriers owned by this node.
    pub barriers: DynamicTable<BarrierImpl>,
    /// Reservations owned by this node.
    pub reservations: DynamicTable<ReservationImpl>,
    /// Index spaces owned by this node.
    pub index_spaces: DynamicTable<IndexSpaceImpl>,
    /// Processor groups owned by this node.
    pub proc_groups: DynamicTable<ProcessorGroupImpl>,
}

impl Node {
    /// Creates the registry for node `node`.
    ///
    /// Table arities: events 10/8, barriers 10/4, reservations 10/8,
    /// index spaces 10/4, processor groups 10/4.
    #[must_use]
    pub fn new(node: NodeId) -> Self {
        Self {
            memories: Vec::new(),
            processors: Vec::new(),
            events: DynamicTable::new(IdKind::Event, node, 10, 8),
            barriers: DynamicTable::new(IdKind::Barrier, node, 10, 4),
            reservations: DynamicTable::new(IdKind::Reservation, node, 10, 8),
            index_spaces: DynamicTable::new(IdKind::IndexSpace, node, 10, 4),
            proc_groups: DynamicTable::new(IdKind::ProcGroup, node, 10, 4),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::FreeList;
    use std::sync::Arc as StdArc;

    #[test]
    fn tables_mint_kind_tagged_ids() {
        let node = Node::new(NodeId(2));
        let events = FreeList::new();
        let barriers = FreeList::new();
        let (ev_index, ev_slot) = events.alloc(&node.events).expect("alloc failed");
        let (bar_index, _) = barriers.alloc(&node.barriers).expect("alloc failed");
        assert_eq!(ev_index, 1);
        assert_eq!(bar_index, 1);
        assert!(StdArc::ptr_eq(
            &ev_slot,
            &node.events.lookup(ev_index).expect("lookup failed")
        ));
    }

    #[test]
    fn proxy_lookup_allocates_lazily() {
        // A peer's mirror table materializes slots on first access
        // without any free list involvement.
        let remote = Node::new(NodeId(7));
        let slot = remote.events.lookup(300).expect("lookup failed");
        let again = remote.events.lookup(300).expect("lookup failed");
        assert!(StdArc::ptr_eq(&slot, &again));
    }
}
