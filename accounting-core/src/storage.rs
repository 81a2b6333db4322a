//! Durable storage using RocksDB
//!
//! The store is read once at start-up and written to by every synchronization
//! cycle afterwards.
//!
//! # Column Families
//!
//! - `wallets` - Wallets (key: wallet id, big-endian u32)
//! - `wallet_allocations` - Allocations with materialized path (key: allocation id)
//! - `transactions` - Append-only transaction log (key: sequence, big-endian u64)
//! - `deposit_notifications` - Pending provider notifications (key: sequence)
//!
//! Because keys are big-endian, a forward scan of a column family is an
//! ordered full scan.

use crate::{
    error::{Error, Result},
    ledger::Ledger,
    types::{
        Allocation, AllocationId, ChargeType, ProductCategoryId, Timestamp, Transaction, Wallet,
        WalletId,
    },
    Config,
};
use chrono::{DateTime, TimeZone, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Column family names
const CF_WALLETS: &str = "wallets";
const CF_ALLOCATIONS: &str = "wallet_allocations";
const CF_TRANSACTIONS: &str = "transactions";
const CF_DEPOSIT_NOTIFICATIONS: &str = "deposit_notifications";

/// Convert epoch milliseconds to a UTC date, saturating outside chrono's range
pub fn to_datetime(ts: Timestamp) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts).single().unwrap_or(if ts < 0 {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

/// Persisted wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRow {
    /// Wallet id
    pub id: WalletId,
    /// Username or project id
    pub owned_by: String,
    /// Category name
    pub category: String,
    /// Provider
    pub provider: String,
    /// Payment model
    pub charge_type: ChargeType,
}

impl From<&Wallet> for WalletRow {
    fn from(wallet: &Wallet) -> Self {
        Self {
            id: wallet.id,
            owned_by: wallet.owner.clone(),
            category: wallet.category.name.clone(),
            provider: wallet.category.provider.clone(),
            charge_type: wallet.charge_type,
        }
    }
}

impl From<WalletRow> for Wallet {
    fn from(row: WalletRow) -> Self {
        Wallet {
            id: row.id,
            owner: row.owned_by,
            category: ProductCategoryId::new(row.category, row.provider),
            charge_type: row.charge_type,
            dirty: false,
        }
    }
}

/// Persisted allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRow {
    /// Allocation id
    pub id: AllocationId,
    /// Dot-joined ids from the root down to this allocation
    pub allocation_path: String,
    /// Owning wallet
    pub associated_wallet: WalletId,
    /// Current balance
    pub balance: i64,
    /// Initial balance
    pub initial_balance: i64,
    /// Local balance
    pub local_balance: i64,
    /// Start of the validity window
    pub start_date: DateTime<Utc>,
    /// End of the validity window
    pub end_date: Option<DateTime<Utc>>,
}

impl AllocationRow {
    /// Build the row for `alloc` with its materialized path
    pub fn new(alloc: &Allocation, allocation_path: String) -> Self {
        Self {
            id: alloc.id,
            allocation_path,
            associated_wallet: alloc.wallet,
            balance: alloc.current_balance,
            initial_balance: alloc.initial_balance,
            local_balance: alloc.local_balance,
            start_date: to_datetime(alloc.not_before),
            end_date: alloc.not_after.map(to_datetime),
        }
    }

    /// Parent id: the second to last element of the path
    pub fn parent(&self) -> Result<Option<AllocationId>> {
        let path: Vec<&str> = self.allocation_path.split('.').collect();
        if path.len() <= 1 {
            return Ok(None);
        }

        path[path.len() - 2].parse().map(Some).map_err(|_| {
            Error::Storage(format!(
                "allocation {} has a malformed path {:?}",
                self.id, self.allocation_path
            ))
        })
    }

    /// Convert back into a clean in-memory allocation
    pub fn into_allocation(self) -> Result<Allocation> {
        Ok(Allocation {
            id: self.id,
            wallet: self.associated_wallet,
            parent: self.parent()?,
            not_before: self.start_date.timestamp_millis(),
            not_after: self.end_date.map(|d| d.timestamp_millis()),
            initial_balance: self.initial_balance,
            current_balance: self.balance,
            local_balance: self.local_balance,
            dirty: false,
        })
    }
}

/// Type discriminator of a persisted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Deposit
    Deposit,
    /// Charge
    Charge,
    /// Allocation update
    AllocationUpdate,
    /// Transfer
    Transfer,
}

/// Persisted transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRow {
    /// Type discriminator
    pub kind: TransactionKind,
    /// Allocation whose balance changed
    pub affected_allocation_id: AllocationId,
    /// Signed change
    pub change: i64,
    /// Actor username
    pub performed_by: String,
    /// Human description
    pub description: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Category name
    pub category: String,
    /// Provider
    pub provider: String,
    /// Source allocation (deposits, charges and transfers)
    pub source_allocation_id: Option<AllocationId>,
    /// Product key (product-use charges)
    pub product_id: Option<u64>,
    /// Periods (product-use charges)
    pub periods: Option<i64>,
    /// Units (product-use charges)
    pub units: Option<i64>,
    /// Start of the window (deposits, updates, transfers)
    pub start_date: Option<DateTime<Utc>>,
    /// End of the window (deposits, updates, transfers)
    pub end_date: Option<DateTime<Utc>>,
    /// Unique id of this row
    pub transaction_id: String,
    /// Groups the rows of one logical operation
    pub initial_transaction_id: String,
}

impl From<&Transaction> for TransactionRow {
    fn from(transaction: &Transaction) -> Self {
        let info = transaction.info();
        let mut row = TransactionRow {
            kind: TransactionKind::Deposit,
            affected_allocation_id: info.affected_allocation,
            change: info.change,
            performed_by: info.performed_by.clone(),
            description: info.description.clone(),
            created_at: to_datetime(info.created_at),
            category: info.category.name.clone(),
            provider: info.category.provider.clone(),
            source_allocation_id: None,
            product_id: None,
            periods: None,
            units: None,
            start_date: None,
            end_date: None,
            transaction_id: info.transaction_id.clone(),
            initial_transaction_id: info.initial_transaction_id.clone(),
        };

        match transaction {
            Transaction::Deposit {
                source_allocation,
                start_date,
                end_date,
                ..
            } => {
                row.source_allocation_id = *source_allocation;
                row.start_date = Some(to_datetime(*start_date));
                row.end_date = end_date.map(to_datetime);
            }
            Transaction::Charge {
                source_allocation,
                product_id,
                periods,
                units,
                ..
            } => {
                row.kind = TransactionKind::Charge;
                row.source_allocation_id = Some(*source_allocation);
                row.product_id = *product_id;
                row.periods = *periods;
                row.units = *units;
            }
            Transaction::AllocationUpdate {
                start_date,
                end_date,
                ..
            } => {
                row.kind = TransactionKind::AllocationUpdate;
                row.start_date = Some(to_datetime(*start_date));
                row.end_date = end_date.map(to_datetime);
            }
            Transaction::Transfer {
                source_allocation,
                start_date,
                end_date,
                ..
            } => {
                row.kind = TransactionKind::Transfer;
                row.source_allocation_id = Some(*source_allocation);
                row.start_date = Some(to_datetime(*start_date));
                row.end_date = end_date.map(to_datetime);
            }
        }

        row
    }
}

/// Signal to a provider that a wallet it serves received funds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositNotificationRow {
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Receiving owner
    pub owned_by: String,
    /// Category name
    pub category: String,
    /// Provider to notify
    pub provider: String,
    /// Deposited amount
    pub balance: i64,
}

/// Everything one synchronization cycle writes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncBatch {
    /// Dirty wallets (upsert)
    pub wallets: Vec<WalletRow>,
    /// Dirty allocations (upsert)
    pub allocations: Vec<AllocationRow>,
    /// Pending transactions (append)
    pub transactions: Vec<TransactionRow>,
    /// Derived deposit notifications (append)
    pub deposit_notifications: Vec<DepositNotificationRow>,
}

impl SyncBatch {
    /// Whether there is nothing to write
    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
            && self.allocations.is_empty()
            && self.transactions.is_empty()
            && self.deposit_notifications.is_empty()
    }

    /// Number of records in the batch
    pub fn len(&self) -> usize {
        self.wallets.len()
            + self.allocations.len()
            + self.transactions.len()
            + self.deposit_notifications.len()
    }
}

/// The durable store as seen by the ledger
pub trait Persistence: Send + Sync {
    /// Ordered full scan of wallets and allocations
    fn load(&self) -> Result<Ledger>;

    /// Write a batch atomically
    fn write(&self, batch: &SyncBatch) -> Result<()>;

    /// Sum of transaction changes per affected allocation
    fn transaction_changes(&self) -> Result<HashMap<AllocationId, i64>>;
}

/// Check every loaded allocation's current balance against the sum of its
/// recorded transaction changes
pub fn verify_transaction_trace(
    ledger: &Ledger,
    changes: &HashMap<AllocationId, i64>,
) -> Result<()> {
    if let Some(unknown) = changes
        .keys()
        .find(|id| ledger.allocation(**id).is_none())
    {
        return Err(Error::InvariantViolation(format!(
            "transactions reference unknown allocation {}",
            unknown
        )));
    }

    for alloc in ledger.allocations().iter() {
        let expected = changes.get(&alloc.id).copied().unwrap_or(0);
        if alloc.current_balance != expected {
            return Err(Error::InvariantViolation(format!(
                "allocation {} has an unexpected balance according to its transactions: expected {} but was {}",
                alloc.id, expected, alloc.current_balance
            )));
        }
    }

    Ok(())
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
    transaction_seq: AtomicU64,
    notification_seq: AtomicU64,
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_WALLETS, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_ALLOCATIONS, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_TRANSACTIONS, Self::cf_options_log()),
            ColumnFamilyDescriptor::new(CF_DEPOSIT_NOTIFICATIONS, Self::cf_options_log()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let mut storage = Self {
            db: Arc::new(db),
            transaction_seq: AtomicU64::new(0),
            notification_seq: AtomicU64::new(0),
        };
        storage.transaction_seq = AtomicU64::new(storage.next_sequence(CF_TRANSACTIONS)?);
        storage.notification_seq =
            AtomicU64::new(storage.next_sequence(CF_DEPOSIT_NOTIFICATIONS)?);

        tracing::info!(
            path = ?path,
            transactions = storage.transaction_seq.load(Ordering::Relaxed),
            "Opened accounting store"
        );

        Ok(storage)
    }

    fn cf_options_records() -> Options {
        let mut opts = Options::default();
        // Rewritten on every sync, favour speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_log() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    /// One past the last sequence key of an append-only column family
    fn next_sequence(&self, cf_name: &str) -> Result<u64> {
        let cf = self.cf_handle(cf_name)?;
        match self.db.iterator_cf(cf, IteratorMode::End).next() {
            Some(item) => {
                let (key, _) = item?;
                let bytes = <[u8; 8]>::try_from(&key[..]).map_err(|_| {
                    Error::Storage(format!("malformed sequence key in {}", cf_name))
                })?;
                Ok(u64::from_be_bytes(bytes) + 1)
            }
            None => Ok(0),
        }
    }

    fn scan<T: serde::de::DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>> {
        let cf = self.cf_handle(cf_name)?;
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            rows.push(bincode::deserialize(&value)?);
        }
        Ok(rows)
    }

    /// All persisted transactions in append order
    pub fn transactions(&self) -> Result<Vec<TransactionRow>> {
        self.scan(CF_TRANSACTIONS)
    }

    /// All persisted deposit notifications in append order
    pub fn deposit_notifications(&self) -> Result<Vec<DepositNotificationRow>> {
        self.scan(CF_DEPOSIT_NOTIFICATIONS)
    }

    /// Close database (graceful shutdown)
    pub fn close(self) -> Result<()> {
        drop(self.db);
        tracing::info!("RocksDB closed gracefully");
        Ok(())
    }
}

impl Persistence for Storage {
    fn load(&self) -> Result<Ledger> {
        let wallets: Vec<WalletRow> = self.scan(CF_WALLETS)?;
        let allocations = self
            .scan::<AllocationRow>(CF_ALLOCATIONS)?
            .into_iter()
            .map(AllocationRow::into_allocation)
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            wallets = wallets.len(),
            allocations = allocations.len(),
            "Loaded accounting state"
        );

        Ledger::restore(wallets.into_iter().map(Wallet::from).collect(), allocations)
    }

    fn write(&self, batch: &SyncBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut write = WriteBatch::default();

        let cf_wallets = self.cf_handle(CF_WALLETS)?;
        for row in &batch.wallets {
            write.put_cf(cf_wallets, row.id.to_be_bytes(), bincode::serialize(row)?);
        }

        let cf_allocations = self.cf_handle(CF_ALLOCATIONS)?;
        for row in &batch.allocations {
            write.put_cf(cf_allocations, row.id.to_be_bytes(), bincode::serialize(row)?);
        }

        let cf_transactions = self.cf_handle(CF_TRANSACTIONS)?;
        let first = self
            .transaction_seq
            .fetch_add(batch.transactions.len() as u64, Ordering::SeqCst);
        for (offset, row) in batch.transactions.iter().enumerate() {
            let key = (first + offset as u64).to_be_bytes();
            write.put_cf(cf_transactions, key, bincode::serialize(row)?);
        }

        let cf_notifications = self.cf_handle(CF_DEPOSIT_NOTIFICATIONS)?;
        let first = self
            .notification_seq
            .fetch_add(batch.deposit_notifications.len() as u64, Ordering::SeqCst);
        for (offset, row) in batch.deposit_notifications.iter().enumerate() {
            let key = (first + offset as u64).to_be_bytes();
            write.put_cf(cf_notifications, key, bincode::serialize(row)?);
        }

        // Atomic commit
        self.db.write(write)?;

        tracing::debug!(records = batch.len(), "Batch written");
        Ok(())
    }

    fn transaction_changes(&self) -> Result<HashMap<AllocationId, i64>> {
        let mut changes = HashMap::new();
        for row in self.transactions()? {
            *changes.entry(row.affected_allocation_id).or_insert(0) += row.change;
        }
        Ok(changes)
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .field("transaction_seq", &self.transaction_seq)
            .field("notification_seq", &self.notification_seq)
            .finish()
    }
}
