//! Begin/commit/rollback envelope around allocation mutations
//!
//! `Mutation::begin` snapshots the mutable fields of every allocation taking
//! part in a logical operation. The caller then edits the live records and
//! finishes with exactly one of:
//!
//! - `commit`: marks changed allocations dirty and re-validates all invariants
//! - `rollback`: restores every snapshot (dry runs)
//!
//! Only one mutation is ever open at a time because all ledger access happens
//! on the single actor task.

use crate::error::{Error, Result};
use crate::invariants::verify_allocation;
use crate::store::Arena;
use crate::types::{Allocation, AllocationId, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Snapshot {
    not_before: Timestamp,
    not_after: Option<Timestamp>,
    initial_balance: i64,
    current_balance: i64,
    local_balance: i64,
}

impl Snapshot {
    fn capture(alloc: &Allocation) -> Self {
        Self {
            not_before: alloc.not_before,
            not_after: alloc.not_after,
            initial_balance: alloc.initial_balance,
            current_balance: alloc.current_balance,
            local_balance: alloc.local_balance,
        }
    }

    fn restore(&self, alloc: &mut Allocation) {
        alloc.not_before = self.not_before;
        alloc.not_after = self.not_after;
        alloc.initial_balance = self.initial_balance;
        alloc.current_balance = self.current_balance;
        alloc.local_balance = self.local_balance;
    }

    fn differs(&self, alloc: &Allocation) -> bool {
        *self != Self::capture(alloc)
    }
}

/// Pending changes to a set of allocations
#[must_use = "a mutation must be committed or rolled back"]
#[derive(Debug)]
pub struct Mutation {
    entries: Vec<(AllocationId, Snapshot)>,
}

impl Mutation {
    /// Snapshot the given allocations
    pub fn begin(allocations: &Arena<Allocation>, ids: &[AllocationId]) -> Result<Self> {
        let mut entries = Vec::with_capacity(ids.len());
        for &id in ids {
            if entries.iter().any(|(seen, _)| *seen == id) {
                return Err(Error::InvariantViolation(format!(
                    "allocation {} is already part of this mutation",
                    id
                )));
            }

            let alloc = allocations
                .get(id)
                .ok_or_else(|| Error::Other(format!("unknown allocation {}", id)))?;
            entries.push((id, Snapshot::capture(alloc)));
        }

        Ok(Self { entries })
    }

    /// Change of each allocation's current balance since `begin`
    pub fn current_balance_deltas(&self, allocations: &Arena<Allocation>) -> Vec<(AllocationId, i64)> {
        self.entries
            .iter()
            .filter_map(|(id, snapshot)| {
                allocations
                    .get(*id)
                    .map(|alloc| (*id, alloc.current_balance - snapshot.current_balance))
            })
            .collect()
    }

    /// Keep the changes, mark changed allocations dirty and re-validate
    pub fn commit(self, allocations: &mut Arena<Allocation>) -> Result<()> {
        for (id, snapshot) in &self.entries {
            if let Some(alloc) = allocations.get_mut(*id) {
                alloc.dirty = alloc.dirty || snapshot.differs(alloc);
            }
        }

        for (id, _) in &self.entries {
            if let Some(alloc) = allocations.get(*id) {
                verify_allocation(alloc)?;
            }
        }

        Ok(())
    }

    /// Discard the changes
    pub fn rollback(self, allocations: &mut Arena<Allocation>) {
        for (id, snapshot) in &self.entries {
            if let Some(alloc) = allocations.get_mut(*id) {
                snapshot.restore(alloc);
            }
        }
    }
}
