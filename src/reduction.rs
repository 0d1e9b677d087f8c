//! Reduction operator descriptors and the per-runtime registry.
//!
//! Barrier arrivals may carry a right-hand-side value that is folded
//! into the generation's accumulator; at publication the folded
//! accumulator is applied onto a copy of the barrier's initial value.
//! Operators are plain descriptor records dispatched by id, sized by
//! `{lhs_size, rhs_size}`, and required to be associative and
//! commutative so arrival order never matters.

use crate::error::{Error, ErrorKind, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Identifier for a registered reduction operator.
pub type ReductionOpId = u32;

/// A reduction operator descriptor.
///
/// `fold` combines two RHS values; `apply` combines an LHS value with a
/// RHS value. Both operate on raw byte slices of the declared sizes.
pub struct ReductionOp {
    /// The id user code registers and arrives with.
    pub id: ReductionOpId,
    /// Size in bytes of the left-hand side (the barrier's initial value).
    pub lhs_size: usize,
    /// Size in bytes of the right-hand side (arrival values).
    pub rhs_size: usize,
    /// The RHS identity element; a fresh accumulator starts here.
    pub identity: Vec<u8>,
    apply: fn(&mut [u8], &[u8]),
    fold: fn(&mut [u8], &[u8]),
}

impl ReductionOp {
    /// Creates a descriptor from its parts.
    ///
    /// # Panics
    /// Panics if `identity` does not have `rhs_size` bytes.
    #[must_use]
    pub fn new(
        id: ReductionOpId,
        lhs_size: usize,
        rhs_size: usize,
        identity: Vec<u8>,
        apply: fn(&mut [u8], &[u8]),
        fold: fn(&mut [u8], &[u8]),
    ) -> Self {
        assert_eq!(identity.len(), rhs_size, "identity must be rhs-sized");
        Self {
            id,
            lhs_size,
            rhs_size,
            identity,
            apply,
            fold,
        }
    }

    /// Folds `rhs` into the accumulator `acc` (both RHS-sized).
    pub fn fold(&self, acc: &mut [u8], rhs: &[u8]) -> Result<()> {
        self.check_rhs(rhs)?;
        (self.fold)(acc, rhs);
        Ok(())
    }

    /// Applies the folded accumulator `rhs` onto the LHS value `lhs`.
    pub fn apply(&self, lhs: &mut [u8], rhs: &[u8]) -> Result<()> {
        if lhs.len() != self.lhs_size {
            return Err(Error::new(ErrorKind::ReductionSizeMismatch).with_context(format!(
                "redop {} lhs is {} bytes, got {}",
                self.id,
                self.lhs_size,
                lhs.len()
            )));
        }
        self.check_rhs(rhs)?;
        (self.apply)(lhs, rhs);
        Ok(())
    }

    fn check_rhs(&self, rhs: &[u8]) -> Result<()> {
        if rhs.len() == self.rhs_size {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::ReductionSizeMismatch).with_context(format!(
                "redop {} rhs is {} bytes, got {}",
                self.id,
                self.rhs_size,
                rhs.len()
            )))
        }
    }

    /// The canonical little-endian `i32` sum operator.
    #[must_use]
    pub fn int_add(id: ReductionOpId) -> Self {
        fn add(lhs: &mut [u8], rhs: &[u8]) {
            let a = i32::from_le_bytes(lhs.try_into().expect("lhs is 4 bytes"));
            let b = i32::from_le_bytes(rhs.try_into().expect("rhs is 4 bytes"));
            lhs.copy_from_slice(&a.wrapping_add(b).to_le_bytes());
        }
        Self::new(id, 4, 4, 0_i32.to_le_bytes().to_vec(), add, add)
    }
}

impl std::fmt::Debug for ReductionOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReductionOp")
            .field("id", &self.id)
            .field("lhs_size", &self.lhs_size)
            .field("rhs_size", &self.rhs_size)
            .finish()
    }
}

/// Per-runtime table of reduction operators keyed by id.
#[derive(Debug, Default)]
pub struct ReductionRegistry {
    ops: RwLock<HashMap<ReductionOpId, Arc<ReductionOp>>>,
}

impl ReductionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an operator under its id.
    ///
    /// Registering the same id twice is a programmer error.
    pub fn register(&self, op: ReductionOp) -> Result<()> {
        let mut ops = self.ops.write();
        let id = op.id;
        if ops.insert(id, Arc::new(op)).is_some() {
            return Err(Error::new(ErrorKind::DuplicateRegistration)
                .with_context(format!("reduction op {id} already registered")));
        }
        Ok(())
    }

    /// Looks up an operator by id.
    pub fn get(&self, id: ReductionOpId) -> Result<Arc<ReductionOp>> {
        self.ops.read().get(&id).cloned().ok_or_else(|| {
            Error::new(ErrorKind::UnknownReduction).with_context(format!("reduction op {id}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_add_folds_and_applies() {
        let op = ReductionOp::int_add(1);
        let mut acc = op.identity.clone();
        op.fold(&mut acc, &5_i32.to_le_bytes()).expect("fold failed");
        op.fold(&mut acc, &7_i32.to_le_bytes()).expect("fold failed");
        assert_eq!(i32::from_le_bytes(acc.clone().try_into().unwrap()), 12);

        let mut lhs = 42_i32.to_le_bytes().to_vec();
        op.apply(&mut lhs, &acc).expect("apply failed");
        assert_eq!(i32::from_le_bytes(lhs.try_into().unwrap()), 54);
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let op = ReductionOp::int_add(1);
        let mut acc = op.identity.clone();
        let err = op.fold(&mut acc, &[1, 2]).expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::ReductionSizeMismatch);
    }

    #[test]
    fn registry_round_trip() {
        let registry = ReductionRegistry::new();
        registry.register(ReductionOp::int_add(9)).expect("register failed");
        assert_eq!(registry.get(9).expect("get failed").rhs_size, 4);
        let err = registry.get(10).expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::UnknownReduction);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = ReductionRegistry::new();
        registry.register(ReductionOp::int_add(3)).expect("register failed");
        let err = registry
            .register(ReductionOp::int_add(3))
            .expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::DuplicateRegistration);
    }
}
