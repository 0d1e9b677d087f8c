//! Index spaces: ID-addressed element-count records.
//!
//! Region/instance management lives outside the core; the registry only
//! tracks the spaces themselves so that ids resolve uniformly.

use crate::error::Result;
use crate::runtime::Runtime;
use crate::table::TableSlot;
use crate::types::{Id, NodeId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// A handle to an index space.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct IndexSpace {
    /// The index space's id.
    pub id: Id,
}

impl IndexSpace {
    /// Creates an index space of `num_elements` on the calling node.
    pub fn create_index_space(rt: &Runtime, num_elements: u64) -> Result<Self> {
        let core = rt.core();
        let (_, slot) = core
            .index_space_free_list()
            .alloc(core.local_node_index_spaces())?;
        slot.num_elements.store(num_elements, Ordering::Release);
        Ok(Self { id: slot.me })
    }

    /// Returns the number of elements in the space.
    pub fn num_elements(&self, rt: &Runtime) -> Result<u64> {
        let imp = rt.core().index_space_impl(self.id)?;
        Ok(imp.num_elements.load(Ordering::Acquire))
    }
}

/// An index space slot.
#[derive(Debug)]
pub struct IndexSpaceImpl {
    pub(crate) me: Id,
    #[allow(dead_code)]
    pub(crate) owner: NodeId,
    num_elements: AtomicU64,
}

impl TableSlot for IndexSpaceImpl {
    fn create(id: Id, owner: NodeId) -> Self {
        Self {
            me: id,
            owner,
            num_elements: AtomicU64::new(0),
        }
    }
}
