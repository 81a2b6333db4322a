//! Allocation invariants
//!
//! Checked after every commit and for every allocation loaded from storage.
//! A violation means the ledger is corrupt; callers treat it as fatal.

use crate::error::{Error, Result};
use crate::types::{Allocation, Timestamp};

/// Verify every invariant of a single allocation
pub fn verify_allocation(alloc: &Allocation) -> Result<()> {
    let not_after = alloc.not_after.unwrap_or(Timestamp::MAX);
    if not_after < alloc.not_before {
        return Err(violation(
            alloc,
            format!("notAfter >= notBefore ({} >= {})", not_after, alloc.not_before),
        ));
    }

    if alloc.initial_balance < 0 {
        return Err(violation(
            alloc,
            format!("initialBalance >= 0 ({} >= 0)", alloc.initial_balance),
        ));
    }

    if alloc.current_balance > alloc.initial_balance {
        return Err(violation(
            alloc,
            format!(
                "currentBalance <= initialBalance ({} <= {})",
                alloc.current_balance, alloc.initial_balance
            ),
        ));
    }

    if alloc.local_balance > alloc.initial_balance {
        return Err(violation(
            alloc,
            format!(
                "localBalance <= initialBalance ({} <= {})",
                alloc.local_balance, alloc.initial_balance
            ),
        ));
    }

    if alloc.current_balance > alloc.local_balance {
        return Err(violation(
            alloc,
            format!(
                "currentBalance <= localBalance ({} <= {})",
                alloc.current_balance, alloc.local_balance
            ),
        ));
    }

    if let Some(parent) = alloc.parent {
        if parent >= alloc.id {
            return Err(violation(
                alloc,
                format!("parentAllocation < id ({} < {})", parent, alloc.id),
            ));
        }
    }

    Ok(())
}

fn violation(alloc: &Allocation, rule: String) -> Error {
    Error::InvariantViolation(format!("allocation {}: {} {:?}", alloc.id, rule, alloc))
}
