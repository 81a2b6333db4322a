//! Charge Engine
//!
//! Two algorithms walk the ancestor chain of every eligible allocation of the
//! payer's wallet (valid at `now`, ascending id order):
//!
//! - ABSOLUTE: charge `min(remaining, min current balance over the chain)` per
//!   allocation, stopping once the requested amount is covered.
//! - DIFFERENTIAL_QUOTA: every eligible allocation first gets its previously
//!   recorded usage added back along the chain, then is charged like ABSOLUTE.
//!   Whatever is still missing afterwards is split evenly over all eligible
//!   allocations and deducted without balance checks.
//!
//! Each chain is mutated inside one `Mutation`. Dry runs roll every chain back.
//! A balance that would leave the `i64` range aborts the whole charge: every
//! touched allocation is restored and no rows are recorded.

use crate::error::{Error, Result};
use crate::ledger::Ledger;
use crate::mutation::Mutation;
use crate::types::{AllocationId, ChargeType, Timestamp, Transaction, TransactionInfo, WalletId};
use tracing::debug;

/// A resolved charge request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeDescription {
    /// Username recorded on the transactions
    pub performed_by: String,
    /// Total amount to charge
    pub amount: i64,
    /// Units consumed, for product-use charges
    pub units: Option<i64>,
    /// Periods consumed, for product-use charges
    pub periods: Option<i64>,
    /// Product key, for product-use charges
    pub product_id: Option<u64>,
    /// Free products always succeed without touching any balance
    pub is_free: bool,
}

impl ChargeDescription {
    /// A plain credit charge
    pub fn raw(performed_by: impl Into<String>, amount: i64) -> Self {
        Self {
            performed_by: performed_by.into(),
            amount,
            units: None,
            periods: None,
            product_id: None,
            is_free: false,
        }
    }
}

/// State shared by every chain touched during one charge
struct ChargeRun<'a> {
    charge: &'a ChargeDescription,
    initial_transaction_id: String,
    initial_id_used: bool,
    now: Timestamp,
    dry_run: bool,
}

impl Ledger {
    /// Charge `charge.amount` against `wallet`.
    ///
    /// Returns whether the full amount was covered. A wallet without any
    /// allocation valid at `now` is never charged.
    pub fn charge(
        &mut self,
        wallet: WalletId,
        charge: &ChargeDescription,
        now: Timestamp,
        dry_run: bool,
    ) -> Result<bool> {
        let charge_type = match self.wallet(wallet) {
            Some(w) => w.charge_type,
            None => return Ok(false),
        };

        let eligible: Vec<AllocationId> = self
            .allocations
            .iter()
            .filter(|alloc| alloc.wallet == wallet && alloc.is_valid(now))
            .map(|alloc| alloc.id)
            .collect();

        if eligible.is_empty() {
            return Ok(false);
        }

        let mut run = ChargeRun {
            charge,
            initial_transaction_id: self.next_transaction_id(),
            initial_id_used: false,
            now,
            dry_run,
        };

        let mut touched: Vec<AllocationId> = eligible
            .iter()
            .flat_map(|id| self.ancestry(*id))
            .collect();
        touched.sort_unstable();
        touched.dedup();

        let envelope = Mutation::begin(&self.allocations, &touched)?;
        let logged = self.transactions.len();

        let outcome = match charge_type {
            ChargeType::Absolute => self.charge_absolute(&eligible, &mut run),
            ChargeType::DifferentialQuota => self.charge_differential(&eligible, &mut run),
        };

        let success = match outcome {
            Ok(success) => {
                envelope.commit(&mut self.allocations)?;
                success
            }
            Err(err) => {
                envelope.rollback(&mut self.allocations);
                self.transactions.truncate(logged);
                return Err(err);
            }
        };

        debug!(
            wallet,
            amount = charge.amount,
            charge_type = %charge_type,
            allocations = eligible.len(),
            dry_run,
            success,
            "charge processed"
        );

        Ok(success)
    }

    fn charge_absolute(&mut self, eligible: &[AllocationId], run: &mut ChargeRun<'_>) -> Result<bool> {
        let amount = run.charge.amount;
        let mut charged = 0i64;

        for &id in eligible {
            if charged >= amount {
                break;
            }
            charged += self.charge_chain(id, amount - charged, false, run)?;
        }

        Ok(charged == amount)
    }

    fn charge_differential(
        &mut self,
        eligible: &[AllocationId],
        run: &mut ChargeRun<'_>,
    ) -> Result<bool> {
        let amount = run.charge.amount;
        let mut charged = 0i64;

        // Every allocation may be owed a refund of last cycle's usage, so all
        // of them are processed even once the amount is covered
        for &id in eligible {
            charged += self.charge_chain(id, amount - charged, true, run)?;
        }

        let missing = amount - charged;
        if missing == 0 {
            return Ok(true);
        }

        let count = eligible.len() as i64;
        let per_allocation = missing / count;
        let remainder = missing % count;

        for (idx, &id) in eligible.iter().enumerate() {
            let share = if idx == 0 {
                per_allocation + remainder
            } else {
                per_allocation
            };
            self.deduct_without_checks(id, share, run)?;
        }

        Ok(false)
    }

    /// Charge at most `amount` against `leaf` and its ancestors. With
    /// `refund_usage` the usage recorded at `leaf` is returned first.
    fn charge_chain(
        &mut self,
        leaf: AllocationId,
        amount: i64,
        refund_usage: bool,
        run: &mut ChargeRun<'_>,
    ) -> Result<i64> {
        let chain = self.ancestry(leaf);
        let mutation = Mutation::begin(&self.allocations, &chain)?;

        let bound = match self.refund_and_bound(&chain, leaf, amount, refund_usage) {
            Ok(bound) => bound,
            Err(err) => {
                mutation.rollback(&mut self.allocations);
                return Err(err);
            }
        };

        self.finish_chain(mutation, leaf, run)?;
        Ok(bound)
    }

    fn refund_and_bound(
        &mut self,
        chain: &[AllocationId],
        leaf: AllocationId,
        amount: i64,
        refund_usage: bool,
    ) -> Result<i64> {
        if refund_usage {
            let usage = match self.allocations.get(leaf) {
                Some(alloc) => alloc.local_usage()?,
                None => 0,
            };
            self.adjust_chain(chain, leaf, usage)?;
        }

        let bound = chain
            .iter()
            .filter_map(|id| self.allocations.get(*id))
            .fold(amount, |acc, alloc| acc.min(alloc.current_balance))
            .max(0);

        self.adjust_chain(chain, leaf, -bound)?;
        Ok(bound)
    }

    fn deduct_without_checks(
        &mut self,
        leaf: AllocationId,
        amount: i64,
        run: &mut ChargeRun<'_>,
    ) -> Result<()> {
        let chain = self.ancestry(leaf);
        let mutation = Mutation::begin(&self.allocations, &chain)?;
        if let Err(err) = self.adjust_chain(&chain, leaf, -amount) {
            mutation.rollback(&mut self.allocations);
            return Err(err);
        }
        self.finish_chain(mutation, leaf, run)
    }

    /// Add `delta` to the current balance of every allocation in `chain` and
    /// to the local balance of `leaf`
    fn adjust_chain(
        &mut self,
        chain: &[AllocationId],
        leaf: AllocationId,
        delta: i64,
    ) -> Result<()> {
        for &id in chain {
            if let Some(alloc) = self.allocations.get_mut(id) {
                alloc.current_balance = alloc
                    .current_balance
                    .checked_add(delta)
                    .ok_or(Error::BalanceOverflow(id))?;
                if id == leaf {
                    alloc.local_balance = alloc
                        .local_balance
                        .checked_add(delta)
                        .ok_or(Error::BalanceOverflow(id))?;
                }
            }
        }
        Ok(())
    }

    /// Roll back on dry runs; otherwise commit and record one charge row per
    /// allocation whose current balance changed
    fn finish_chain(
        &mut self,
        mutation: Mutation,
        leaf: AllocationId,
        run: &mut ChargeRun<'_>,
    ) -> Result<()> {
        if run.dry_run {
            mutation.rollback(&mut self.allocations);
            return Ok(());
        }

        let deltas = mutation.current_balance_deltas(&self.allocations);
        mutation.commit(&mut self.allocations)?;

        let category = match self.allocations.get(leaf) {
            Some(alloc) => self.wallet_category(alloc.wallet)?,
            None => return Ok(()),
        };

        for (id, change) in deltas {
            if change == 0 {
                continue;
            }

            let transaction_id = if run.initial_id_used {
                self.next_transaction_id()
            } else {
                run.initial_id_used = true;
                run.initial_transaction_id.clone()
            };

            self.record(Transaction::Charge {
                info: TransactionInfo {
                    affected_allocation: id,
                    change,
                    performed_by: run.charge.performed_by.clone(),
                    description: "Charge".to_string(),
                    created_at: run.now,
                    category: category.clone(),
                    transaction_id,
                    initial_transaction_id: run.initial_transaction_id.clone(),
                },
                source_allocation: leaf,
                product_id: run.charge.product_id,
                periods: run.charge.periods,
                units: run.charge.units,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProductCategoryId;

    fn category() -> ProductCategoryId {
        ProductCategoryId::new("cpu", "hpc")
    }

    /// root(1000) -> mid(500) -> leaf(100), each in its own wallet
    fn chain(charge_type: ChargeType) -> (Ledger, WalletId, [AllocationId; 3]) {
        let mut ledger = Ledger::new();
        let w0 = ledger.create_wallet("root", category(), charge_type);
        let w1 = ledger.create_wallet("mid", category(), charge_type);
        let w2 = ledger.create_wallet("leaf", category(), charge_type);

        let root = ledger.root_deposit(w0, 1000, "_system", 0).unwrap();
        let mid = ledger.deposit(w1, root, 500, 0, None, "_system", 0).unwrap();
        let leaf = ledger.deposit(w2, mid, 100, 0, None, "_system", 0).unwrap();
        ledger.transactions.clear();
        (ledger, w2, [root, mid, leaf])
    }

    fn balances(ledger: &Ledger, ids: [AllocationId; 3]) -> [i64; 3] {
        ids.map(|id| ledger.allocation(id).unwrap().current_balance)
    }

    fn charge(amount: i64) -> ChargeDescription {
        ChargeDescription::raw("alice", amount)
    }

    #[test]
    fn test_absolute_charge_within_bounds() {
        let (mut ledger, wallet, ids) = chain(ChargeType::Absolute);

        assert!(ledger.charge(wallet, &charge(50), 10, false).unwrap());
        assert_eq!(balances(&ledger, ids), [950, 450, 50]);
        assert_eq!(ledger.allocation(ids[2]).unwrap().local_balance, 50);
        assert_eq!(ledger.allocation(ids[1]).unwrap().local_balance, 500);

        let rows = ledger.pending_transactions();
        assert_eq!(rows.len(), 3);
        let initial = rows[0].info().initial_transaction_id.clone();
        assert_eq!(rows[0].info().transaction_id, initial);
        assert!(rows.iter().all(|t| t.info().initial_transaction_id == initial));
        assert!(rows.iter().all(|t| t.info().change == -50));
    }

    #[test]
    fn test_absolute_charge_is_bounded_by_tightest_ancestor() {
        let (mut ledger, wallet, ids) = chain(ChargeType::Absolute);

        assert!(!ledger.charge(wallet, &charge(999_999), 10, false).unwrap());
        assert_eq!(balances(&ledger, ids), [900, 400, 0]);
    }

    #[test]
    fn test_absolute_charge_spans_allocations() {
        let (mut ledger, wallet, [_, mid, leaf]) = chain(ChargeType::Absolute);
        let second = ledger.deposit(wallet, mid, 30, 0, None, "_system", 0).unwrap();

        assert!(ledger.charge(wallet, &charge(120), 10, false).unwrap());
        assert_eq!(ledger.allocation(leaf).unwrap().current_balance, 0);
        assert_eq!(ledger.allocation(second).unwrap().current_balance, 10);
        assert_eq!(ledger.allocation(mid).unwrap().current_balance, 380);
    }

    #[test]
    fn test_expired_allocations_are_not_eligible() {
        let (mut ledger, wallet, [_, mid, leaf]) = chain(ChargeType::Absolute);
        ledger.update(leaf, 100, 0, Some(5), "_system", 0).unwrap();

        assert!(!ledger.charge(wallet, &charge(10), 10, false).unwrap());
        assert_eq!(ledger.allocation(mid).unwrap().current_balance, 500);
    }

    #[test]
    fn test_dry_run_leaves_state_untouched() {
        for charge_type in [ChargeType::Absolute, ChargeType::DifferentialQuota] {
            let (mut ledger, wallet, ids) = chain(charge_type);
            let before: Vec<_> = ledger.allocations().iter().cloned().collect();

            assert!(ledger.charge(wallet, &charge(50), 10, true).unwrap());
            assert!(!ledger.charge(wallet, &charge(5_000), 10, true).unwrap());

            let after: Vec<_> = ledger.allocations().iter().cloned().collect();
            assert_eq!(before, after);
            assert_eq!(balances(&ledger, ids), [1000, 500, 100]);
            assert!(ledger.pending_transactions().is_empty());
        }
    }

    #[test]
    fn test_differential_charge_returns_previous_usage() {
        let (mut ledger, wallet, ids) = chain(ChargeType::DifferentialQuota);

        assert!(ledger.charge(wallet, &charge(50), 10, false).unwrap());
        assert_eq!(balances(&ledger, ids), [950, 450, 50]);

        // Usage dropped to zero: the 50 flows back up the chain
        assert!(ledger.charge(wallet, &charge(0), 20, false).unwrap());
        assert_eq!(balances(&ledger, ids), [1000, 500, 100]);

        // Usage went up to 70: only the difference is consumed
        assert!(ledger.charge(wallet, &charge(70), 30, false).unwrap());
        assert_eq!(balances(&ledger, ids), [930, 430, 30]);
    }

    #[test]
    fn test_differential_shortfall_goes_negative() {
        let (mut ledger, wallet, ids) = chain(ChargeType::DifferentialQuota);

        assert!(!ledger.charge(wallet, &charge(130), 10, false).unwrap());
        assert_eq!(balances(&ledger, ids), [870, 370, -30]);

        let leaf = ledger.allocation(ids[2]).unwrap();
        assert_eq!(leaf.local_balance, -30);
        assert_eq!(leaf.local_usage().unwrap(), 130);
    }

    #[test]
    fn test_differential_shortfall_split_evenly() {
        let mut ledger = Ledger::new();
        let wallet = ledger.create_wallet("p", category(), ChargeType::DifferentialQuota);
        let a = ledger.root_deposit(wallet, 10, "_system", 0).unwrap();
        let b = ledger.root_deposit(wallet, 10, "_system", 0).unwrap();
        let c = ledger.root_deposit(wallet, 10, "_system", 0).unwrap();

        // 30 covered, 11 missing: 3 each, remainder of 2 on the first
        assert!(!ledger.charge(wallet, &charge(41), 10, false).unwrap());
        assert_eq!(ledger.allocation(a).unwrap().current_balance, -5);
        assert_eq!(ledger.allocation(b).unwrap().current_balance, -3);
        assert_eq!(ledger.allocation(c).unwrap().current_balance, -3);
    }

    #[test]
    fn test_update_below_usage_then_zero_charge() {
        let (mut ledger, wallet, ids) = chain(ChargeType::DifferentialQuota);
        let [_, _, leaf] = ids;

        assert!(ledger.charge(wallet, &charge(50), 10, false).unwrap());
        ledger.update(leaf, 10, 0, None, "_system", 15).unwrap();

        let alloc = ledger.allocation(leaf).unwrap();
        assert_eq!((alloc.current_balance, alloc.local_balance), (-40, -40));

        // The recorded usage is handed back to the ancestors
        assert!(ledger.charge(wallet, &charge(0), 20, false).unwrap());
        assert_eq!(balances(&ledger, ids), [1000, 500, 10]);

        // Charging the old usage again overdraws the shrunken leaf
        assert!(!ledger.charge(wallet, &charge(50), 30, false).unwrap());
        assert_eq!(balances(&ledger, ids), [950, 450, -40]);
        assert_eq!(ledger.allocation(leaf).unwrap().local_balance, -40);
    }

    #[test]
    fn test_differential_charge_after_interior_update() {
        let (mut ledger, wallet, ids) = chain(ChargeType::DifferentialQuota);
        let [_, mid, _] = ids;

        assert!(ledger.charge(wallet, &charge(50), 10, false).unwrap());
        ledger.update(mid, 500, 0, None, "_system", 15).unwrap();
        let alloc = ledger.allocation(mid).unwrap();
        assert_eq!((alloc.current_balance, alloc.local_balance), (450, 500));

        assert!(ledger.charge(wallet, &charge(20), 20, false).unwrap());
        assert_eq!(balances(&ledger, ids), [980, 480, 80]);
    }

    fn balance_rows(ledger: &Ledger) -> Vec<(AllocationId, i64, i64, i64)> {
        ledger
            .allocations()
            .iter()
            .map(|a| (a.id, a.initial_balance, a.current_balance, a.local_balance))
            .collect()
    }

    #[test]
    fn test_shortfall_overflow_is_rejected() {
        let mut ledger = Ledger::new();
        let w0 = ledger.create_wallet("root", category(), ChargeType::DifferentialQuota);
        let wa = ledger.create_wallet("a", category(), ChargeType::DifferentialQuota);
        let wb = ledger.create_wallet("b", category(), ChargeType::DifferentialQuota);
        let root = ledger.root_deposit(w0, 0, "_system", 0).unwrap();
        let a = ledger.deposit(wa, root, 0, 0, None, "_system", 0).unwrap();
        ledger.deposit(wb, root, 0, 0, None, "_system", 0).unwrap();

        assert!(!ledger.charge(wa, &charge(i64::MAX), 10, false).unwrap());
        assert_eq!(ledger.allocation(root).unwrap().current_balance, -i64::MAX);

        let before = balance_rows(&ledger);
        let logged = ledger.pending_transactions().len();

        let err = ledger.charge(wb, &charge(i64::MAX), 20, false).unwrap_err();
        assert!(matches!(err, Error::BalanceOverflow(id) if id == root));
        assert!(!err.is_fatal());
        assert_eq!(balance_rows(&ledger), before);
        assert_eq!(ledger.pending_transactions().len(), logged);

        // The ledger keeps working: dropping a's usage hands it back
        assert!(ledger.charge(wa, &charge(0), 30, false).unwrap());
        assert_eq!(ledger.allocation(a).unwrap().current_balance, 0);
        assert_eq!(ledger.allocation(root).unwrap().current_balance, 0);
    }

    #[test]
    fn test_overflow_restores_chains_already_charged() {
        let mut ledger = Ledger::new();
        let org = ledger.create_wallet("org", category(), ChargeType::DifferentialQuota);
        let team = ledger.create_wallet("team", category(), ChargeType::DifferentialQuota);
        let other = ledger.create_wallet("other", category(), ChargeType::DifferentialQuota);
        let r1 = ledger.root_deposit(org, 100, "_system", 0).unwrap();
        let r2 = ledger.root_deposit(org, 0, "_system", 0).unwrap();
        ledger.deposit(team, r1, 10, 0, None, "_system", 0).unwrap();
        ledger.deposit(other, r2, 0, 0, None, "_system", 0).unwrap();
        ledger.deposit(team, r2, 0, 0, None, "_system", 0).unwrap();

        assert!(!ledger.charge(other, &charge(i64::MAX), 10, false).unwrap());
        let before = balance_rows(&ledger);
        let logged = ledger.pending_transactions().len();

        // The first chain is charged and committed before the second overflows
        let err = ledger.charge(team, &charge(i64::MAX), 20, false).unwrap_err();
        assert!(matches!(err, Error::BalanceOverflow(id) if id == r2));
        assert_eq!(balance_rows(&ledger), before);
        assert_eq!(ledger.pending_transactions().len(), logged);

        let dry = ledger.charge(team, &charge(i64::MAX), 30, true).unwrap_err();
        assert!(matches!(dry, Error::BalanceOverflow(_)));
        assert_eq!(balance_rows(&ledger), before);
    }

    #[test]
    fn test_charge_without_allocations_fails() {
        let mut ledger = Ledger::new();
        let wallet = ledger.create_wallet("p", category(), ChargeType::Absolute);
        assert!(!ledger.charge(wallet, &charge(1), 0, false).unwrap());
        assert!(!ledger.charge(42, &charge(1), 0, false).unwrap());
    }
}
