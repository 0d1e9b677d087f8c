//! Bit-packed identifiers for runtime objects.
//!
//! Every ID-addressed object (event, barrier, reservation, index space,
//! processor group, processor, memory) is named by a 64-bit [`Id`] that
//! packs the object kind, the owning node, and a per-node slot index.
//! The encoding is stable and shared by all nodes, so an id minted on
//! one node resolves to the same slot everywhere.
//!
//! Layout (most significant bit first):
//!
//! ```text
//! | kind: 4 bits | owner: 16 bits | index: 44 bits |
//! ```
//!
//! The all-zero id is reserved; [`Id::NULL`] never names an object.

use crate::error::{Error, ErrorKind, Result};
use core::fmt;
use serde::{Deserialize, Serialize};

/// A generation number for events and barriers.
///
/// Generations are logical phases of a reusable object and only ever
/// increase.
pub type Generation = u64;

const KIND_BITS: u32 = 4;
const OWNER_BITS: u32 = 16;
const INDEX_BITS: u32 = 64 - KIND_BITS - OWNER_BITS;

const OWNER_SHIFT: u32 = INDEX_BITS;
const KIND_SHIFT: u32 = INDEX_BITS + OWNER_BITS;

const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;
const OWNER_MASK: u64 = (1 << OWNER_BITS) - 1;

/// The node that owns an object.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub u16);

impl NodeId {
    /// Returns the raw node number.
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

/// The kind of object an [`Id`] names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IdKind {
    /// The reserved null kind; only [`Id::NULL`] carries it.
    Null = 0,
    /// A generational event.
    Event = 1,
    /// A generational barrier.
    Barrier = 2,
    /// A reservation.
    Reservation = 3,
    /// An index space.
    IndexSpace = 4,
    /// A processor group.
    ProcGroup = 5,
    /// A processor.
    Processor = 6,
    /// A memory.
    Memory = 7,
}

impl IdKind {
    const fn from_bits(bits: u64) -> Self {
        match bits {
            1 => Self::Event,
            2 => Self::Barrier,
            3 => Self::Reservation,
            4 => Self::IndexSpace,
            5 => Self::ProcGroup,
            6 => Self::Processor,
            7 => Self::Memory,
            _ => Self::Null,
        }
    }
}

/// A bit-packed object identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(u64);

impl Id {
    /// The reserved null id; names no object.
    pub const NULL: Self = Self(0);

    /// Packs a kind, owner, and index into an id.
    ///
    /// # Panics
    /// Panics if `index` does not fit in the index field.
    #[must_use]
    pub fn new(kind: IdKind, owner: NodeId, index: u64) -> Self {
        assert!(index <= INDEX_MASK, "id index out of range: {index}");
        Self(((kind as u64) << KIND_SHIFT) | (u64::from(owner.0) << OWNER_SHIFT) | index)
    }

    /// Returns the object kind encoded in this id.
    #[must_use]
    pub const fn kind(self) -> IdKind {
        IdKind::from_bits(self.0 >> KIND_SHIFT)
    }

    /// Returns the owning node encoded in this id.
    #[must_use]
    pub const fn owner(self) -> NodeId {
        NodeId(((self.0 >> OWNER_SHIFT) & OWNER_MASK) as u16)
    }

    /// Returns the per-node slot index encoded in this id.
    #[must_use]
    pub const fn index(self) -> u64 {
        self.0 & INDEX_MASK
    }

    /// Returns true for the reserved null id.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the raw 64-bit representation.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Checks that this id carries the expected kind.
    ///
    /// Resolving an id through the wrong accessor is a programmer error;
    /// it fails fast with [`ErrorKind::KindMismatch`].
    pub fn expect_kind(self, expected: IdKind) -> Result<Self> {
        if self.kind() == expected {
            Ok(self)
        } else {
            Err(Error::new(ErrorKind::KindMismatch).with_context(format!(
                "id {self:?} is not a {expected:?} id"
            )))
        }
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({:?}:{}:{})", self.kind(), self.owner(), self.index())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
