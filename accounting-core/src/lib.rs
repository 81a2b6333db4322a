//! Accounting Ledger Engine
//!
//! In-memory, sequentially processed ledger of wallets and hierarchical credit
//! allocations, charged under prepaid (`ABSOLUTE`) or usage-based
//! (`DIFFERENTIAL_QUOTA`) payment models.
//!
//! # Architecture
//!
//! - **Single Writer**: one actor task owns all ledger state and handles one request at a time
//! - **Arena Store**: wallets and allocations live in id-indexed vectors; ids are never reused
//! - **Mutation Envelope**: every allocation change runs inside begin/commit/rollback
//! - **Write-behind**: dirty records and the transaction log are flushed to RocksDB periodically
//!
//! # Invariants
//!
//! - `notAfter >= notBefore`, `initialBalance >= 0`
//! - `currentBalance <= localBalance <= initialBalance`
//! - a parent allocation id is always smaller than its children's ids

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, missing_debug_implementations)]

pub mod actor;
pub mod cache;
pub mod catalog;
pub mod charge;
pub mod config;
pub mod error;
pub mod invariants;
pub mod ledger;
pub mod metrics;
pub mod mutation;
pub mod notify;
pub mod processor;
pub mod request;
pub mod storage;
pub mod store;
pub mod sync;
pub mod types;

// Re-exports
pub use actor::{spawn_accounting_actor, AccountingHandle, Collaborators};
pub use config::Config;
pub use error::{Error, Result};
pub use ledger::Ledger;
pub use request::{AccountingRequest, AccountingResponse, ChargeRequest, ErrorCode, ResponseError};
pub use storage::{Persistence, Storage};
pub use types::{
    Actor, AllocationId, ChargeType, Product, ProductCategoryId, ProductReference, ProjectRole,
    Timestamp, WalletId,
};
