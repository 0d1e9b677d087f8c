//! Processor groups: ID-addressed member lists.
//!
//! Group-wide task dispatch is a scheduler concern outside the core;
//! the registry records membership so group ids resolve like any other
//! id.

use crate::error::Result;
use crate::proc::Processor;
use crate::runtime::Runtime;
use crate::table::TableSlot;
use crate::types::{Id, NodeId};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// A handle to a processor group.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct ProcessorGroup {
    /// The group's id.
    pub id: Id,
}

impl ProcessorGroup {
    /// Creates a group over `members` on the calling node.
    pub fn create_group(rt: &Runtime, members: &[Processor]) -> Result<Self> {
        let core = rt.core();
        let (_, slot) = core
            .proc_group_free_list()
            .alloc(core.local_node_proc_groups())?;
        *slot.members.lock().expect("group slot lock poisoned") = members.to_vec();
        Ok(Self { id: slot.me })
    }

    /// Returns the group's members.
    pub fn members(&self, rt: &Runtime) -> Result<Vec<Processor>> {
        let imp = rt.core().proc_group_impl(self.id)?;
        let members = imp.members.lock().expect("group slot lock poisoned").clone();
        Ok(members)
    }
}

/// A processor group slot.
#[derive(Debug)]
pub struct ProcessorGroupImpl {
    pub(crate) me: Id,
    #[allow(dead_code)]
    pub(crate) owner: NodeId,
    members: Mutex<Vec<Processor>>,
}

impl TableSlot for ProcessorGroupImpl {
    fn create(id: Id, owner: NodeId) -> Self {
        Self {
            me: id,
            owner,
            members: Mutex::new(Vec::new()),
        }
    }
}
