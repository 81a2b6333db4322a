//! In-memory ledger state
//!
//! The `Ledger` owns every wallet, every allocation and the log of
//! transactions that have not been synchronized yet. It is loaded once at
//! start-up and is the only source of truth afterwards; durable storage is
//! written to but never read back during normal operation.
//!
//! All mutation happens on the actor task, so nothing here is synchronized.
//!
//! # Example
//!
//! ```
//! use accounting_core::{ChargeType, Ledger};
//! use accounting_core::types::ProductCategoryId;
//!
//! let mut ledger = Ledger::new();
//! let category = ProductCategoryId::new("cpu", "hpc");
//! let wallet = ledger.create_wallet("my-project", category, ChargeType::Absolute);
//! let root = ledger.root_deposit(wallet, 1000, "_system", 0).unwrap();
//!
//! assert_eq!(ledger.allocation(root).unwrap().current_balance, 1000);
//! ```

use crate::error::{Error, Result};
use crate::invariants::verify_allocation;
use crate::mutation::Mutation;
use crate::store::Arena;
use crate::types::{
    format_timestamp, Allocation, AllocationId, AllocationView, ChargeType, ProductCategoryId,
    SubAllocationView, Timestamp, Transaction, TransactionInfo, Wallet, WalletId, WalletView,
};
use std::collections::HashSet;
use std::fmt;
use tracing::debug;
use uuid::Uuid;

/// A requested window does not fit inside the windows of its ancestors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlapError {
    /// Latest start of any ancestor window
    pub not_before: Timestamp,
    /// Earliest end of any ancestor window
    pub not_after: Timestamp,
}

impl fmt::Display for OverlapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Allocation period is outside of allowed range. It must be between {} and {}.",
            format_timestamp(self.not_before),
            format_timestamp(self.not_after)
        )
    }
}

/// Wallets, allocations and the pending transaction log
#[derive(Debug)]
pub struct Ledger {
    pub(crate) wallets: Arena<Wallet>,
    pub(crate) allocations: Arena<Allocation>,
    pub(crate) transactions: Vec<Transaction>,
    transaction_prefix: Uuid,
    transaction_counter: u64,
}

impl Ledger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self {
            wallets: Arena::new(),
            allocations: Arena::new(),
            transactions: Vec::new(),
            transaction_prefix: Uuid::new_v4(),
            transaction_counter: 0,
        }
    }

    /// Rebuild the ledger from records loaded in ascending id order.
    ///
    /// Every allocation is integrity-checked and must reference a known wallet
    /// and an already loaded parent.
    pub fn restore(wallets: Vec<Wallet>, allocations: Vec<Allocation>) -> Result<Self> {
        let mut ledger = Self::new();

        for wallet in wallets {
            ledger.wallets.restore(wallet.id, wallet)?;
        }

        for alloc in allocations {
            verify_allocation(&alloc)?;

            if ledger.wallets.get(alloc.wallet).is_none() {
                return Err(Error::Storage(format!(
                    "allocation {} references unknown wallet {}",
                    alloc.id, alloc.wallet
                )));
            }

            if let Some(parent) = alloc.parent {
                if ledger.allocations.get(parent).is_none() {
                    return Err(Error::Storage(format!(
                        "allocation {} references unknown parent {}",
                        alloc.id, parent
                    )));
                }
            }

            ledger.allocations.restore(alloc.id, alloc)?;
        }

        Ok(ledger)
    }

    /// All wallets
    pub fn wallets(&self) -> &Arena<Wallet> {
        &self.wallets
    }

    /// All allocations
    pub fn allocations(&self) -> &Arena<Allocation> {
        &self.allocations
    }

    /// Transactions recorded since the last successful synchronization
    pub fn pending_transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Wallet by id
    pub fn wallet(&self, id: WalletId) -> Option<&Wallet> {
        self.wallets.get(id)
    }

    /// Allocation by id
    pub fn allocation(&self, id: AllocationId) -> Option<&Allocation> {
        self.allocations.get(id)
    }

    /// Wallet of an allocation
    pub fn wallet_of(&self, alloc: &Allocation) -> Option<&Wallet> {
        self.wallets.get(alloc.wallet)
    }

    /// The wallet paying for `(owner, category)`
    pub fn find_wallet(&self, owner: &str, category: &ProductCategoryId) -> Option<WalletId> {
        self.wallets
            .iter()
            .find(|w| w.owner == owner && &w.category == category)
            .map(|w| w.id)
    }

    /// Create a new (dirty) wallet
    pub fn create_wallet(
        &mut self,
        owner: impl Into<String>,
        category: ProductCategoryId,
        charge_type: ChargeType,
    ) -> WalletId {
        let owner = owner.into();
        self.wallets.append(|id| Wallet {
            id,
            owner,
            category,
            charge_type,
            dirty: true,
        })
    }

    /// Create a new (dirty) allocation with all balances set to `balance`
    pub fn create_allocation(
        &mut self,
        wallet: WalletId,
        balance: i64,
        parent: Option<AllocationId>,
        not_before: Timestamp,
        not_after: Option<Timestamp>,
    ) -> AllocationId {
        self.allocations.append(|id| Allocation {
            id,
            wallet,
            parent,
            not_before,
            not_after,
            initial_balance: balance,
            current_balance: balance,
            local_balance: balance,
            dirty: true,
        })
    }

    /// Next unique transaction id
    pub fn next_transaction_id(&mut self) -> String {
        let id = format!("{}-{}", self.transaction_prefix, self.transaction_counter);
        self.transaction_counter += 1;
        id
    }

    /// Append to the pending transaction log
    pub fn record(&mut self, transaction: Transaction) {
        self.transactions.push(transaction);
    }

    /// The allocation followed by all of its ancestors, leaf first
    pub fn ancestry(&self, id: AllocationId) -> Vec<AllocationId> {
        let mut chain = Vec::new();
        let mut current = self.allocations.get(id);
        while let Some(alloc) = current {
            chain.push(alloc.id);
            current = alloc.parent.and_then(|parent| self.allocations.get(parent));
        }
        chain
    }

    /// Ancestry from the root down to the allocation
    pub fn allocation_path(&self, id: AllocationId) -> Vec<AllocationId> {
        let mut path = self.ancestry(id);
        path.reverse();
        path
    }

    /// Materialized path: dot-joined ids from the root down
    pub fn materialized_path(&self, id: AllocationId) -> String {
        self.allocation_path(id)
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Check that `[not_before, not_after]` lies within the window of `parent`
    /// and of every ancestor of `parent`.
    pub fn check_overlap_ancestors(
        &self,
        parent: AllocationId,
        not_before: Timestamp,
        not_after: Option<Timestamp>,
    ) -> std::result::Result<(), OverlapError> {
        let not_after = not_after.unwrap_or(Timestamp::MAX);
        let mut tightest = OverlapError {
            not_before: Timestamp::MIN,
            not_after: Timestamp::MAX,
        };
        let mut fits = true;

        for id in self.ancestry(parent) {
            let Some(alloc) = self.allocations.get(id) else {
                continue;
            };
            let end = alloc.not_after.unwrap_or(Timestamp::MAX);

            let contains = |ts: Timestamp| ts >= alloc.not_before && ts <= end;
            if !contains(not_before) || !contains(not_after) {
                fits = false;
            }

            tightest.not_before = tightest.not_before.max(alloc.not_before);
            tightest.not_after = tightest.not_after.min(end);
        }

        if fits {
            Ok(())
        } else {
            Err(tightest)
        }
    }

    /// Intersect the window of every descendant of `id` with the window of `id`.
    ///
    /// Returns the number of descendants visited.
    pub fn clamp_descendants(&mut self, id: AllocationId) -> Result<usize> {
        let (not_before, not_after) = match self.allocations.get(id) {
            Some(alloc) => (alloc.not_before, alloc.not_after.unwrap_or(Timestamp::MAX)),
            None => return Ok(0),
        };

        // Children always have larger ids than their parents
        let mut watch: HashSet<AllocationId> = HashSet::from([id]);
        let descendants: Vec<AllocationId> = self
            .allocations
            .iter_from(id + 1)
            .filter_map(|alloc| match alloc.parent {
                Some(parent) if watch.contains(&parent) => {
                    watch.insert(alloc.id);
                    Some(alloc.id)
                }
                _ => None,
            })
            .collect();

        for &child in &descendants {
            let mutation = Mutation::begin(&self.allocations, &[child])?;
            if let Some(alloc) = self.allocations.get_mut(child) {
                let (start, end) = clamp_window(
                    alloc.not_before,
                    alloc.not_after.unwrap_or(Timestamp::MAX),
                    not_before,
                    not_after,
                );
                alloc.not_before = start;
                alloc.not_after = (end != Timestamp::MAX).then_some(end);
            }
            mutation.commit(&mut self.allocations)?;
        }

        Ok(descendants.len())
    }

    /// Create a root allocation with an open-ended window starting at `now`
    pub fn root_deposit(
        &mut self,
        wallet: WalletId,
        amount: i64,
        performed_by: &str,
        now: Timestamp,
    ) -> Result<AllocationId> {
        let category = self.wallet_category(wallet)?;
        let created = self.create_allocation(wallet, amount, None, now, None);
        verify_allocation(self.allocations_checked(created)?)?;

        let transaction_id = self.next_transaction_id();
        self.record(Transaction::Deposit {
            info: TransactionInfo {
                affected_allocation: created,
                change: amount,
                performed_by: performed_by.to_string(),
                description: "Root deposit".to_string(),
                created_at: now,
                category,
                initial_transaction_id: transaction_id.clone(),
                transaction_id,
            },
            source_allocation: None,
            start_date: now,
            end_date: None,
        });

        Ok(created)
    }

    /// Create a child allocation under `parent`, owned by `wallet`
    #[allow(clippy::too_many_arguments)]
    pub fn deposit(
        &mut self,
        wallet: WalletId,
        parent: AllocationId,
        amount: i64,
        not_before: Timestamp,
        not_after: Option<Timestamp>,
        performed_by: &str,
        now: Timestamp,
    ) -> Result<AllocationId> {
        let category = self.wallet_category(wallet)?;
        let created = self.create_allocation(wallet, amount, Some(parent), not_before, not_after);
        verify_allocation(self.allocations_checked(created)?)?;

        let transaction_id = self.next_transaction_id();
        self.record(Transaction::Deposit {
            info: TransactionInfo {
                affected_allocation: created,
                change: amount,
                performed_by: performed_by.to_string(),
                description: "Deposit".to_string(),
                created_at: now,
                category,
                initial_transaction_id: transaction_id.clone(),
                transaction_id,
            },
            source_allocation: Some(parent),
            start_date: not_before,
            end_date: not_after,
        });

        Ok(created)
    }

    /// Replace the balance and window of an allocation in place, then clamp
    /// its descendants to the new window.
    ///
    /// For DIFFERENTIAL_QUOTA wallets the usage recorded so far is carried over
    /// into the new balances, which may leave them negative. The subtree usage
    /// is taken from the current balance and the local usage from the local
    /// balance.
    pub fn update(
        &mut self,
        id: AllocationId,
        amount: i64,
        not_before: Timestamp,
        not_after: Option<Timestamp>,
        performed_by: &str,
        now: Timestamp,
    ) -> Result<()> {
        let alloc = self.allocations_checked(id)?;
        let wallet = alloc.wallet;
        let category = self.wallet_category(wallet)?;
        let charge_type = self
            .wallets
            .get(wallet)
            .map(|w| w.charge_type)
            .unwrap_or(ChargeType::Absolute);

        // Descendant usage shows up in the current balance only
        let (current_balance, local_balance) = if charge_type == ChargeType::DifferentialQuota {
            let current = amount.checked_sub(alloc.subtree_usage()?);
            let local = amount.checked_sub(alloc.local_usage()?);
            match current.zip(local) {
                Some(balances) => balances,
                None => return Err(Error::BalanceOverflow(id)),
            }
        } else {
            (amount, amount)
        };

        let mutation = Mutation::begin(&self.allocations, &[id])?;
        if let Some(alloc) = self.allocations.get_mut(id) {
            alloc.initial_balance = amount;
            alloc.current_balance = current_balance;
            alloc.local_balance = local_balance;
            alloc.not_before = not_before;
            alloc.not_after = not_after;
        }

        let change = mutation
            .current_balance_deltas(&self.allocations)
            .first()
            .map(|(_, delta)| *delta)
            .unwrap_or(0);
        mutation.commit(&mut self.allocations)?;

        let transaction_id = self.next_transaction_id();
        self.record(Transaction::AllocationUpdate {
            info: TransactionInfo {
                affected_allocation: id,
                change,
                performed_by: performed_by.to_string(),
                description: "Allocation update".to_string(),
                created_at: now,
                category,
                initial_transaction_id: transaction_id.clone(),
                transaction_id,
            },
            start_date: not_before,
            end_date: not_after,
        });

        self.clamp_descendants(id)?;
        Ok(())
    }

    /// Largest amount chargeable against `id` without pushing it or any
    /// ancestor below zero
    pub fn max_usable_balance(&self, id: AllocationId) -> i64 {
        let mut chain = self.ancestry(id).into_iter();
        let Some(leaf) = chain.next().and_then(|id| self.allocations.get(id)) else {
            return 0;
        };

        let bound = chain
            .filter_map(|id| self.allocations.get(id))
            .fold(leaf.current_balance.min(leaf.local_balance), |acc, alloc| {
                acc.min(alloc.current_balance)
            });
        bound.max(0)
    }

    /// Sum of the max usable balance of every allocation valid at `now`
    pub fn wallet_max_usable_balance(&self, wallet: WalletId, now: Timestamp) -> i64 {
        self.allocations
            .iter()
            .filter(|alloc| alloc.wallet == wallet && alloc.is_valid(now))
            .map(|alloc| self.max_usable_balance(alloc.id))
            .fold(0, i64::saturating_add)
    }

    /// View of a single allocation
    pub fn allocation_view(&self, alloc: &Allocation) -> AllocationView {
        AllocationView {
            id: alloc.id,
            path: self.allocation_path(alloc.id),
            balance: alloc.current_balance,
            initial_balance: alloc.initial_balance,
            local_balance: alloc.local_balance,
            max_usable_balance: self.max_usable_balance(alloc.id),
            not_before: alloc.not_before,
            not_after: alloc.not_after,
        }
    }

    /// Views of the allocations of `wallet` that are valid at `now`
    pub fn valid_allocation_views(&self, wallet: WalletId, now: Timestamp) -> Vec<AllocationView> {
        self.allocations
            .iter()
            .filter(|alloc| alloc.wallet == wallet && alloc.is_valid(now))
            .map(|alloc| self.allocation_view(alloc))
            .collect()
    }

    /// Every wallet of `owner` with all of its allocations
    pub fn wallet_views(&self, owner: &str) -> Vec<WalletView> {
        self.wallets
            .iter()
            .filter(|wallet| wallet.owner == owner)
            .map(|wallet| WalletView {
                id: wallet.id,
                owner: wallet.owner.clone(),
                category: wallet.category.clone(),
                charge_type: wallet.charge_type,
                allocations: self
                    .allocations
                    .iter()
                    .filter(|alloc| alloc.wallet == wallet.id)
                    .map(|alloc| self.allocation_view(alloc))
                    .collect(),
            })
            .collect()
    }

    /// Allocations granted out of any allocation owned by `owner`.
    ///
    /// `query` keeps only entries whose workspace, category or provider
    /// contains it (case-insensitive).
    pub fn sub_allocations(&self, owner: &str, query: Option<&str>) -> Vec<SubAllocationView> {
        let owned: HashSet<WalletId> = self
            .wallets
            .iter()
            .filter(|wallet| wallet.owner == owner)
            .map(|wallet| wallet.id)
            .collect();
        let query = query.map(str::to_lowercase).filter(|q| !q.is_empty());

        self.allocations
            .iter()
            .filter(|alloc| {
                alloc
                    .parent
                    .and_then(|parent| self.allocations.get(parent))
                    .map_or(false, |parent| owned.contains(&parent.wallet))
            })
            .filter_map(|alloc| {
                let wallet = self.wallets.get(alloc.wallet)?;
                Some(SubAllocationView {
                    id: alloc.id,
                    path: self.materialized_path(alloc.id),
                    not_before: alloc.not_before,
                    not_after: alloc.not_after,
                    category: wallet.category.clone(),
                    charge_type: wallet.charge_type,
                    workspace: wallet.owner.clone(),
                    remaining: alloc.current_balance,
                    initial_balance: alloc.initial_balance,
                })
            })
            .filter(|view| match &query {
                None => true,
                Some(q) => {
                    view.workspace.to_lowercase().contains(q)
                        || view.category.name.to_lowercase().contains(q)
                        || view.category.provider.to_lowercase().contains(q)
                }
            })
            .collect()
    }

    /// Dump the full state at debug level
    pub fn log_state(&self) {
        for wallet in self.wallets.iter() {
            debug!(
                wallet = wallet.id,
                owner = %wallet.owner,
                category = %wallet.category,
                charge_type = %wallet.charge_type,
                dirty = wallet.dirty,
                "wallet"
            );
        }

        for alloc in self.allocations.iter() {
            let owner = self
                .wallets
                .get(alloc.wallet)
                .map(|w| w.owner.as_str())
                .unwrap_or("?");
            debug!(
                allocation = alloc.id,
                owner,
                wallet = alloc.wallet,
                parent = ?alloc.parent,
                initial = alloc.initial_balance,
                current = alloc.current_balance,
                local = alloc.local_balance,
                dirty = alloc.dirty,
                start = %format_timestamp(alloc.not_before),
                end = %format_timestamp(alloc.not_after.unwrap_or(Timestamp::MAX)),
                "allocation"
            );
        }
    }

    pub(crate) fn allocations_checked(&self, id: AllocationId) -> Result<&Allocation> {
        self.allocations
            .get(id)
            .ok_or_else(|| Error::Other(format!("unknown allocation {}", id)))
    }

    pub(crate) fn wallet_category(&self, wallet: WalletId) -> Result<ProductCategoryId> {
        self.wallets
            .get(wallet)
            .map(|w| w.category.clone())
            .ok_or_else(|| Error::Other(format!("unknown wallet {}", wallet)))
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

/// Intersect `[start, end]` with `[bound_start, bound_end]`. An empty
/// intersection collapses onto the nearest boundary of the bounding window.
fn clamp_window(
    start: Timestamp,
    end: Timestamp,
    bound_start: Timestamp,
    bound_end: Timestamp,
) -> (Timestamp, Timestamp) {
    let clamped_start = start.max(bound_start);
    let clamped_end = end.min(bound_end);

    if clamped_end >= clamped_start {
        (clamped_start, clamped_end)
    } else if start > bound_end {
        (bound_end, bound_end)
    } else {
        (bound_start, bound_start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn category() -> ProductCategoryId {
        ProductCategoryId::new("cpu", "hpc")
    }

    /// root(1000) -> mid(500) -> leaf(100), each in its own wallet
    fn chain(charge_type: ChargeType) -> (Ledger, [AllocationId; 3]) {
        let mut ledger = Ledger::new();
        let w0 = ledger.create_wallet("root", category(), charge_type);
        let w1 = ledger.create_wallet("mid", category(), charge_type);
        let w2 = ledger.create_wallet("leaf", category(), charge_type);

        let root = ledger.root_deposit(w0, 1000, "_system", 0).unwrap();
        let mid = ledger.deposit(w1, root, 500, 0, None, "_system", 0).unwrap();
        let leaf = ledger.deposit(w2, mid, 100, 0, None, "_system", 0).unwrap();
        (ledger, [root, mid, leaf])
    }

    #[test]
    fn test_root_deposit_balances() {
        let (ledger, [root, _, _]) = chain(ChargeType::Absolute);
        let alloc = ledger.allocation(root).unwrap();

        assert_eq!(alloc.parent, None);
        assert_eq!(alloc.initial_balance, 1000);
        assert_eq!(alloc.current_balance, 1000);
        assert_eq!(alloc.local_balance, 1000);
        assert!(alloc.dirty);
        assert_eq!(ledger.pending_transactions().len(), 3);
    }

    #[test]
    fn test_ancestry_and_paths() {
        let (ledger, [root, mid, leaf]) = chain(ChargeType::Absolute);

        assert_eq!(ledger.ancestry(leaf), vec![leaf, mid, root]);
        assert_eq!(ledger.allocation_path(leaf), vec![root, mid, leaf]);
        assert_eq!(ledger.materialized_path(leaf), "0.1.2");
        assert_eq!(ledger.materialized_path(root), "0");
    }

    #[test]
    fn test_transaction_ids_are_unique() {
        let mut ledger = Ledger::new();
        let a = ledger.next_transaction_id();
        let b = ledger.next_transaction_id();
        assert_ne!(a, b);
        assert!(a.ends_with("-0"));
        assert!(b.ends_with("-1"));
    }

    #[test]
    fn test_find_wallet_by_owner_and_category() {
        let (ledger, _) = chain(ChargeType::Absolute);
        assert_eq!(ledger.find_wallet("mid", &category()), Some(1));
        assert_eq!(
            ledger.find_wallet("mid", &ProductCategoryId::new("gpu", "hpc")),
            None
        );
    }

    #[test]
    fn test_overlap_check_reports_tightest_window() {
        let mut ledger = Ledger::new();
        let wallet = ledger.create_wallet("p", category(), ChargeType::Absolute);
        let root = ledger.root_deposit(wallet, 100, "_system", 0).unwrap();
        let mid = ledger
            .deposit(wallet, root, 100, 1_000, Some(5_000), "_system", 0)
            .unwrap();

        assert!(ledger.check_overlap_ancestors(mid, 1_000, Some(5_000)).is_ok());
        assert!(ledger.check_overlap_ancestors(mid, 2_000, Some(3_000)).is_ok());

        let err = ledger.check_overlap_ancestors(mid, 500, Some(3_000)).unwrap_err();
        assert_eq!(err.not_before, 1_000);
        assert_eq!(err.not_after, 5_000);

        // Open-ended request under a bounded parent
        assert!(ledger.check_overlap_ancestors(mid, 2_000, None).is_err());
        assert!(err.to_string().starts_with("Allocation period is outside"));
    }

    #[test]
    fn test_update_differential_keeps_usage() {
        let (mut ledger, [root, mid, leaf]) = chain(ChargeType::DifferentialQuota);
        for id in [leaf, mid, root] {
            let alloc = ledger.allocations.get_mut(id).unwrap();
            alloc.current_balance -= 50;
            if id == leaf {
                alloc.local_balance -= 50;
            }
        }

        ledger.update(leaf, 10, 0, None, "_system", 1).unwrap();
        let alloc = ledger.allocation(leaf).unwrap();
        assert_eq!(alloc.initial_balance, 10);
        assert_eq!(alloc.current_balance, -40);
        assert_eq!(alloc.local_balance, -40);

        match ledger.pending_transactions().last().unwrap() {
            Transaction::AllocationUpdate { info, .. } => assert_eq!(info.change, -90),
            other => panic!("unexpected transaction {:?}", other),
        }
    }

    #[test]
    fn test_update_interior_differential_keeps_subtree_usage() {
        let (mut ledger, [root, mid, leaf]) = chain(ChargeType::DifferentialQuota);
        for id in [leaf, mid, root] {
            let alloc = ledger.allocations.get_mut(id).unwrap();
            alloc.current_balance -= 50;
            if id == leaf {
                alloc.local_balance -= 50;
            }
        }

        ledger.update(mid, 500, 0, None, "_system", 1).unwrap();
        let alloc = ledger.allocation(mid).unwrap();
        assert_eq!(alloc.current_balance, 450);
        assert_eq!(alloc.local_balance, 500);
        assert_eq!(alloc.subtree_usage().unwrap(), 50);
    }

    #[test]
    fn test_update_rejects_unrepresentable_balance() {
        let (mut ledger, [_, mid, _]) = chain(ChargeType::DifferentialQuota);
        ledger.allocations.get_mut(mid).unwrap().current_balance = i64::MIN;
        let logged = ledger.pending_transactions().len();

        let err = ledger.update(mid, 500, 0, None, "_system", 1).unwrap_err();
        assert!(matches!(err, Error::BalanceOverflow(id) if id == mid));
        assert!(!err.is_fatal());
        assert_eq!(ledger.allocation(mid).unwrap().current_balance, i64::MIN);
        assert_eq!(ledger.pending_transactions().len(), logged);
    }

    #[test]
    fn test_update_absolute_resets_balances() {
        let (mut ledger, [_, _, leaf]) = chain(ChargeType::Absolute);
        ledger.allocations.get_mut(leaf).unwrap().current_balance = 20;
        ledger.allocations.get_mut(leaf).unwrap().local_balance = 20;

        ledger.update(leaf, 60, 0, None, "_system", 1).unwrap();
        let alloc = ledger.allocation(leaf).unwrap();
        assert_eq!(alloc.current_balance, 60);
        assert_eq!(alloc.local_balance, 60);
    }

    #[test]
    fn test_update_clamps_descendants() {
        let (mut ledger, [root, mid, leaf]) = chain(ChargeType::Absolute);
        for alloc in ledger.allocations.iter_mut() {
            alloc.dirty = false;
        }

        ledger.update(root, 1000, 100, Some(200), "_system", 1).unwrap();

        for id in [mid, leaf] {
            let alloc = ledger.allocation(id).unwrap();
            assert_eq!(alloc.not_before, 100);
            assert_eq!(alloc.not_after, Some(200));
            assert!(alloc.dirty);
        }
    }

    #[test]
    fn test_clamp_skips_unrelated_allocations() {
        let (mut ledger, [root, mid, _]) = chain(ChargeType::Absolute);
        let other_wallet = ledger.create_wallet("other", category(), ChargeType::Absolute);
        let unrelated = ledger.root_deposit(other_wallet, 10, "_system", 0).unwrap();
        let sibling = ledger.deposit(other_wallet, root, 10, 0, None, "_system", 0).unwrap();

        ledger.update(mid, 500, 50, Some(60), "_system", 1).unwrap();

        assert_eq!(ledger.allocation(unrelated).unwrap().not_before, 0);
        assert_eq!(ledger.allocation(sibling).unwrap().not_after, None);
    }

    #[test]
    fn test_clamp_window_collapses_empty_intersection() {
        assert_eq!(clamp_window(0, Timestamp::MAX, 100, 200), (100, 200));
        assert_eq!(clamp_window(150, 180, 100, 200), (150, 180));
        assert_eq!(clamp_window(300, 400, 100, 200), (200, 200));
        assert_eq!(clamp_window(0, 50, 100, 200), (100, 100));
    }

    #[test]
    fn test_max_usable_balance_is_bounded_by_ancestors() {
        let (mut ledger, [root, mid, leaf]) = chain(ChargeType::Absolute);
        assert_eq!(ledger.max_usable_balance(leaf), 100);

        ledger.allocations.get_mut(mid).unwrap().current_balance = 30;
        assert_eq!(ledger.max_usable_balance(leaf), 30);
        assert_eq!(ledger.max_usable_balance(root), 1000);

        ledger.allocations.get_mut(root).unwrap().current_balance = -5;
        assert_eq!(ledger.max_usable_balance(leaf), 0);
    }

    #[test]
    fn test_wallet_and_sub_allocation_views() {
        let (ledger, [root, mid, leaf]) = chain(ChargeType::Absolute);

        let wallets = ledger.wallet_views("mid");
        assert_eq!(wallets.len(), 1);
        assert_eq!(wallets[0].allocations[0].path, vec![root, mid]);

        let subs = ledger.sub_allocations("root", None);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].id, mid);
        assert_eq!(subs[0].workspace, "mid");
        assert_eq!(subs[0].path, "0.1");

        assert_eq!(ledger.sub_allocations("mid", Some("LEAF"))[0].id, leaf);
        assert!(ledger.sub_allocations("mid", Some("storage")).is_empty());
        assert_eq!(ledger.sub_allocations("mid", Some("hpc")).len(), 1);
    }

    #[test]
    fn test_restore_rejects_orphans() {
        let wallet = Wallet {
            id: 0,
            owner: "p".to_string(),
            category: category(),
            charge_type: ChargeType::Absolute,
            dirty: false,
        };
        let orphan = Allocation {
            id: 3,
            wallet: 0,
            parent: Some(1),
            not_before: 0,
            not_after: None,
            initial_balance: 10,
            current_balance: 10,
            local_balance: 10,
            dirty: false,
        };

        assert!(Ledger::restore(vec![wallet.clone()], vec![orphan.clone()]).is_err());

        let root = Allocation {
            id: 1,
            parent: None,
            ..orphan.clone()
        };
        let ledger = Ledger::restore(vec![wallet], vec![root, orphan]).unwrap();
        assert_eq!(ledger.allocations().next_id(), 4);
        assert!(ledger.allocation(0).is_none());
        assert!(ledger.pending_transactions().is_empty());
    }
}
