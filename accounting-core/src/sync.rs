//! Synchronization scheduler
//!
//! Runs inside the actor loop, never concurrently with request handling.
//! Every cycle collects dirty wallets, dirty allocations and the pending
//! transaction log into one `SyncBatch`, writes it atomically and only then
//! clears the flushed dirty flags. Providers that received deposits are
//! notified once per cycle.

use crate::error::Result;
use crate::ledger::Ledger;
use crate::metrics::Metrics;
use crate::notify::ProviderNotifier;
use crate::processor::Accounting;
use crate::storage::{
    to_datetime, AllocationRow, DepositNotificationRow, Persistence, SyncBatch, TransactionRow,
    WalletRow,
};
use crate::types::{Timestamp, Transaction};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Periodic flush of the ledger to durable storage
pub struct Synchronizer {
    storage: Arc<dyn Persistence>,
    notifier: Arc<dyn ProviderNotifier>,
    interval: Timestamp,
    next_sync: Timestamp,
    metrics: Option<Metrics>,
}

impl Synchronizer {
    /// Create new synchronizer. The first attempt is due immediately.
    pub fn new(
        storage: Arc<dyn Persistence>,
        notifier: Arc<dyn ProviderNotifier>,
        interval: Duration,
    ) -> Self {
        Self {
            storage,
            notifier,
            interval: i64::try_from(interval.as_millis()).unwrap_or(Timestamp::MAX),
            next_sync: Timestamp::MIN,
            metrics: None,
        }
    }

    /// Record cycles into `metrics`
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Time of the next scheduled cycle
    pub fn next_sync(&self) -> Timestamp {
        self.next_sync
    }

    /// Whether a scheduled cycle is due at `now`
    pub fn is_due(&self, now: Timestamp) -> bool {
        now >= self.next_sync
    }

    /// Run a cycle if one is due, or unconditionally when `forced`.
    ///
    /// Returns the number of records written. Failures are logged and
    /// counted here; everything stays dirty for the next cycle.
    pub async fn attempt(
        &mut self,
        accounting: &mut Accounting,
        now: Timestamp,
        forced: bool,
    ) -> Result<usize> {
        if !forced && !self.is_due(now) {
            return Ok(0);
        }
        self.next_sync = now.saturating_add(self.interval);

        if let Err(e) = accounting.refresh_caches().await {
            warn!(error = %e, "Cache refresh failed");
        }

        let started = Instant::now();
        match self.flush(accounting.ledger_mut()).await {
            Ok(records) => {
                if records > 0 {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_sync(records, started.elapsed().as_secs_f64());
                    }
                }
                Ok(records)
            }
            Err(e) => {
                error!(error = %e, "Synchronization failed");
                if let Some(metrics) = &self.metrics {
                    metrics.record_sync_failure();
                }
                Err(e)
            }
        }
    }

    async fn flush(&self, ledger: &mut Ledger) -> Result<usize> {
        let batch = collect_batch(ledger);
        if batch.is_empty() {
            debug!("Nothing to synchronize");
            return Ok(0);
        }

        self.storage.write(&batch)?;
        mark_flushed(ledger, &batch);

        info!(
            wallets = batch.wallets.len(),
            allocations = batch.allocations.len(),
            transactions = batch.transactions.len(),
            notifications = batch.deposit_notifications.len(),
            "Synchronized"
        );

        let providers: BTreeSet<&str> = batch
            .deposit_notifications
            .iter()
            .map(|n| n.provider.as_str())
            .collect();
        for provider in providers {
            if let Err(e) = self.notifier.notify_deposits(provider).await {
                warn!(provider, error = %e, "Provider notification failed");
            }
        }

        Ok(batch.len())
    }
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("interval_ms", &self.interval)
            .field("next_sync", &self.next_sync)
            .finish()
    }
}

/// Everything unflushed in `ledger`
pub fn collect_batch(ledger: &Ledger) -> SyncBatch {
    let wallets = ledger
        .wallets()
        .iter()
        .filter(|w| w.dirty)
        .map(WalletRow::from)
        .collect();

    let allocations = ledger
        .allocations()
        .iter()
        .filter(|a| a.dirty)
        .map(|a| AllocationRow::new(a, ledger.materialized_path(a.id)))
        .collect();

    let pending = ledger.pending_transactions();
    let transactions = pending.iter().map(TransactionRow::from).collect();

    let deposit_notifications = pending
        .iter()
        .filter_map(|transaction| match transaction {
            Transaction::Deposit { info, .. } => {
                let owner = ledger
                    .allocation(info.affected_allocation)
                    .and_then(|alloc| ledger.wallet_of(alloc))
                    .map(|wallet| wallet.owner.clone())?;
                Some(DepositNotificationRow {
                    created_at: to_datetime(info.created_at),
                    owned_by: owner,
                    category: info.category.name.clone(),
                    provider: info.category.provider.clone(),
                    balance: info.change,
                })
            }
            _ => None,
        })
        .collect();

    SyncBatch {
        wallets,
        allocations,
        transactions,
        deposit_notifications,
    }
}

/// Clear dirty flags of exactly the records in `batch` and drop the flushed
/// transactions from the pending log
fn mark_flushed(ledger: &mut Ledger, batch: &SyncBatch) {
    for row in &batch.wallets {
        if let Some(wallet) = ledger.wallets.get_mut(row.id) {
            wallet.dirty = false;
        }
    }

    for row in &batch.allocations {
        if let Some(alloc) = ledger.allocations.get_mut(row.id) {
            alloc.dirty = false;
        }
    }

    let flushed = batch.transactions.len().min(ledger.transactions.len());
    ledger.transactions.drain(..flushed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ProductCache, ProjectCache};
    use crate::catalog::StaticCatalog;
    use crate::error::Error;
    use crate::types::{ChargeType, ProductCategoryId};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct MemoryStore {
        batches: Mutex<Vec<SyncBatch>>,
        failing: AtomicBool,
    }

    impl Persistence for MemoryStore {
        fn load(&self) -> Result<Ledger> {
            Ok(Ledger::new())
        }

        fn write(&self, batch: &SyncBatch) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Storage("disk on fire".to_string()));
            }
            self.batches.lock().push(batch.clone());
            Ok(())
        }

        fn transaction_changes(&self) -> Result<HashMap<u32, i64>> {
            Ok(HashMap::new())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        providers: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProviderNotifier for RecordingNotifier {
        async fn notify_deposits(&self, provider: &str) -> Result<()> {
            self.providers.lock().push(provider.to_string());
            Ok(())
        }
    }

    fn accounting() -> Accounting {
        let catalog = Arc::new(StaticCatalog::new());
        Accounting::new(
            Ledger::new(),
            ProductCache::new(catalog.clone()),
            ProjectCache::new(catalog),
        )
    }

    fn setup() -> (Synchronizer, Arc<MemoryStore>, Arc<RecordingNotifier>) {
        let store = Arc::new(MemoryStore::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let sync = Synchronizer::new(store.clone(), notifier.clone(), Duration::from_secs(30));
        (sync, store, notifier)
    }

    fn seed(ledger: &mut Ledger) {
        let cpu = ledger.create_wallet("root", ProductCategoryId::new("cpu", "hpc"), ChargeType::Absolute);
        let gpu = ledger.create_wallet("root", ProductCategoryId::new("gpu", "hpc"), ChargeType::Absolute);
        let child = ledger.create_wallet("child", ProductCategoryId::new("cpu", "hpc"), ChargeType::Absolute);
        let root = ledger.root_deposit(cpu, 1000, "_system", 0).unwrap();
        ledger.root_deposit(gpu, 10, "_system", 0).unwrap();
        ledger.deposit(child, root, 100, 0, None, "_system", 0).unwrap();
    }

    #[tokio::test]
    async fn test_empty_cycle_writes_nothing() {
        let (mut sync, store, notifier) = setup();
        let mut accounting = accounting();

        assert_eq!(sync.attempt(&mut accounting, 0, false).await.unwrap(), 0);
        assert!(store.batches.lock().is_empty());
        assert!(notifier.providers.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_flushes_and_clears() {
        let (mut sync, store, notifier) = setup();
        let mut accounting = accounting();
        seed(accounting.ledger_mut());

        let written = sync.attempt(&mut accounting, 0, false).await.unwrap();
        // 3 wallets, 3 allocations, 3 transactions, 3 notifications
        assert_eq!(written, 12);

        let batches = store.batches.lock().clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].allocations[2].allocation_path, "0.2");
        assert_eq!(batches[0].deposit_notifications[2].owned_by, "child");

        let ledger = accounting.ledger();
        assert!(ledger.wallets().iter().all(|w| !w.dirty));
        assert!(ledger.allocations().iter().all(|a| !a.dirty));
        assert!(ledger.pending_transactions().is_empty());

        // All deposits went to the same provider
        assert_eq!(*notifier.providers.lock(), vec!["hpc".to_string()]);
    }

    #[tokio::test]
    async fn test_schedule() {
        let (mut sync, store, _) = setup();
        let mut accounting = accounting();

        sync.attempt(&mut accounting, 1_000, false).await.unwrap();
        assert_eq!(sync.next_sync(), 31_000);

        seed(accounting.ledger_mut());
        assert_eq!(sync.attempt(&mut accounting, 2_000, false).await.unwrap(), 0);
        assert!(store.batches.lock().is_empty());

        assert!(sync.attempt(&mut accounting, 2_000, true).await.unwrap() > 0);
        assert_eq!(store.batches.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_state_dirty() {
        let (sync, store, notifier) = setup();
        let metrics = Metrics::new().unwrap();
        let mut sync = sync.with_metrics(metrics.clone());
        let mut accounting = accounting();
        seed(accounting.ledger_mut());

        store.failing.store(true, Ordering::SeqCst);
        assert!(sync.attempt(&mut accounting, 0, false).await.is_err());
        assert_eq!(metrics.sync_failures.get(), 1);
        assert_eq!(accounting.ledger().pending_transactions().len(), 3);
        assert!(accounting.ledger().allocations().iter().all(|a| a.dirty));
        assert!(notifier.providers.lock().is_empty());

        store.failing.store(false, Ordering::SeqCst);
        assert_eq!(sync.attempt(&mut accounting, 0, true).await.unwrap(), 12);
        assert_eq!(metrics.sync_cycles.get(), 1);
    }

    #[tokio::test]
    async fn test_only_changed_records_are_flushed() {
        let (mut sync, store, _) = setup();
        let mut accounting = accounting();
        seed(accounting.ledger_mut());
        sync.attempt(&mut accounting, 0, true).await.unwrap();

        accounting
            .ledger_mut()
            .update(2, 50, 0, None, "_system", 0)
            .unwrap();
        sync.attempt(&mut accounting, 0, true).await.unwrap();

        let batches = store.batches.lock().clone();
        let second = &batches[1];
        assert!(second.wallets.is_empty());
        assert_eq!(second.allocations.len(), 1);
        assert_eq!(second.allocations[0].initial_balance, 50);
        assert_eq!(second.transactions.len(), 1);
        assert!(second.deposit_notifications.is_empty());
    }
}
