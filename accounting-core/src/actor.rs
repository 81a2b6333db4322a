//! Single-writer actor for the accounting ledger
//!
//! One Tokio task owns the `Accounting` state and handles one request at a
//! time, so the ledger needs no locks. Synchronization runs inside the same
//! loop: before every request when due, and on an idle tick.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │             AccountingHandle (Clone)                  │
//! │  id = next_id++  ──►  pending.insert(id, oneshot)     │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       │ mpsc::channel (bounded)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │            AccountingActor (Single Task)              │
//! │  ┌────────────────────────────────────────────────┐  │
//! │  │ Synchronizer::attempt() if due                 │  │
//! │  │ Accounting::handle(request)                    │  │
//! │  │ pending.remove(id) ──► oneshot.send(response)  │  │
//! │  └────────────────────────────────────────────────┘  │
//! │  Idle tick ──► Synchronizer::attempt()               │
//! └──────────────────────────────────────────────────────┘
//! ```

use crate::cache::{ProductCache, ProductSource, ProjectCache, ProjectSource};
use crate::catalog::StaticCatalog;
use crate::metrics::Metrics;
use crate::notify::{LogNotifier, ProviderNotifier};
use crate::processor::Accounting;
use crate::request::{AccountingRequest, AccountingResponse, ChargeRequest, ErrorCode};
use crate::storage::{verify_transaction_trace, Persistence};
use crate::sync::Synchronizer;
use crate::types::{
    now_millis, Actor, AllocationId, AllocationView, ProductCategoryId, SubAllocationView,
    Timestamp, WalletView,
};
use crate::{Config, Error, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

/// Responses awaited by callers, keyed by correlation id
type PendingResponses = Arc<DashMap<u64, oneshot::Sender<AccountingResponse>>>;

/// Message sent to the accounting actor
#[derive(Debug)]
pub enum AccountingMessage {
    /// Handle a request; the response is published under `id`
    Request {
        /// Correlation id
        id: u64,
        /// The request
        request: AccountingRequest,
    },

    /// Synchronize now, ignoring the schedule
    Synchronize {
        /// Number of records written
        response: oneshot::Sender<Result<usize>>,
    },

    /// Final synchronization, then stop
    Shutdown,
}

/// External collaborators of the actor
#[derive(Clone)]
pub struct Collaborators {
    /// Product catalog
    pub products: Arc<dyn ProductSource>,
    /// Project memberships
    pub projects: Arc<dyn ProjectSource>,
    /// Provider notification dispatcher
    pub notifier: Arc<dyn ProviderNotifier>,
}

impl Collaborators {
    /// Serve products and memberships from `catalog`; notifications are only logged
    pub fn from_catalog(catalog: Arc<StaticCatalog>) -> Self {
        Self {
            products: catalog.clone(),
            projects: catalog,
            notifier: Arc::new(LogNotifier),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Actor that owns the ledger
#[derive(Debug)]
pub struct AccountingActor {
    /// Ledger and caches
    accounting: Accounting,

    /// Flush scheduler
    sync: Synchronizer,

    /// Mailbox for incoming messages
    mailbox: mpsc::Receiver<AccountingMessage>,

    /// Callers waiting for a response
    pending: PendingResponses,

    /// Tick on which a due synchronization is attempted while idle
    idle_tick: Duration,

    /// Log every request/response pair and the full ledger state
    verbose: bool,

    metrics: Metrics,
}

impl AccountingActor {
    /// Run the actor event loop.
    ///
    /// Returns an error only when the ledger can no longer be trusted. Callers
    /// still waiting at that point observe `Error::Concurrency`.
    pub async fn run(mut self) -> Result<()> {
        let mut idle = interval(self.idle_tick);
        idle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                msg = self.mailbox.recv() => {
                    match msg {
                        Some(AccountingMessage::Request { id, request }) => {
                            if let Err(e) = self.handle_request(id, request).await {
                                break Err(e);
                            }
                        }

                        Some(AccountingMessage::Synchronize { response }) => {
                            let result = self.sync.attempt(&mut self.accounting, now_millis(), true).await;
                            let _ = response.send(result);
                        }

                        // Shutdown requested or every handle dropped
                        Some(AccountingMessage::Shutdown) | None => {
                            let _ = self.sync.attempt(&mut self.accounting, now_millis(), true).await;
                            break Ok(());
                        }
                    }
                }

                _ = idle.tick() => {
                    let _ = self.sync.attempt(&mut self.accounting, now_millis(), false).await;
                }
            }
        };

        // Dropping the senders wakes every waiter with a closed channel
        self.pending.clear();

        match &result {
            Ok(()) => info!("Accounting actor stopped"),
            Err(e) => error!(error = %e, "Accounting actor stopped on a fatal error"),
        }
        result
    }

    /// Handle a single request and publish its response
    async fn handle_request(&mut self, id: u64, request: AccountingRequest) -> Result<()> {
        let now = now_millis();
        let _ = self.sync.attempt(&mut self.accounting, now, false).await;

        let kind = request.kind();
        if self.verbose {
            debug!(id, ?request, "Request");
        }

        let response = match self.accounting.handle(request, now).await {
            Ok(response) => response,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => AccountingResponse::error(ErrorCode::GenericError, e.to_string()),
        };

        self.metrics.record_request(response.is_error());
        match &response {
            AccountingResponse::Charge { success } => self.metrics.record_charge(*success),
            AccountingResponse::Error(err) => warn!(id, kind, code = %err.code, message = %err.message, "Request rejected"),
            _ => {}
        }

        if self.verbose {
            debug!(id, ?response, "Response");
            self.accounting.ledger().log_state();
        }

        match self.pending.remove(&id) {
            Some((_, waiter)) => {
                let _ = waiter.send(response);
            }
            None => debug!(id, kind, "No caller waiting for response"),
        }

        Ok(())
    }
}

/// Handle for sending requests to the actor
#[derive(Clone, Debug)]
pub struct AccountingHandle {
    sender: mpsc::Sender<AccountingMessage>,
    pending: PendingResponses,
    next_id: Arc<AtomicU64>,
    metrics: Metrics,
}

impl AccountingHandle {
    /// Submit a request and wait for the response carrying the same id.
    ///
    /// Dropping the returned future stops waiting but does not cancel the
    /// request.
    pub async fn send(&self, request: AccountingRequest) -> Result<AccountingResponse> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        if self
            .sender
            .send(AccountingMessage::Request { id, request })
            .await
            .is_err()
        {
            self.pending.remove(&id);
            return Err(Error::Concurrency("Actor mailbox closed".to_string()));
        }

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }

    /// Submit a request, turning an error response into `Error::Rejected`
    pub async fn send_or_reject(&self, request: AccountingRequest) -> Result<AccountingResponse> {
        match self.send(request).await? {
            AccountingResponse::Error(err) => Err(Error::Rejected(err)),
            response => Ok(response),
        }
    }

    /// Create a root allocation
    pub async fn root_deposit(
        &self,
        actor: Actor,
        owner: impl Into<String>,
        category: ProductCategoryId,
        amount: i64,
    ) -> Result<AllocationId> {
        let request = AccountingRequest::RootDeposit {
            actor,
            owner: owner.into(),
            category,
            amount,
        };
        match self.send_or_reject(request).await? {
            AccountingResponse::RootDeposit(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    /// Create a child allocation under `parent`
    pub async fn deposit(
        &self,
        actor: Actor,
        owner: impl Into<String>,
        parent: AllocationId,
        amount: i64,
        not_before: Timestamp,
        not_after: Option<Timestamp>,
    ) -> Result<AllocationId> {
        let request = AccountingRequest::Deposit {
            actor,
            owner: owner.into(),
            parent,
            amount,
            not_before,
            not_after,
        };
        match self.send_or_reject(request).await? {
            AccountingResponse::Deposit(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    /// Charge a wallet; `Ok(false)` means the full amount was not covered
    pub async fn charge(&self, charge: ChargeRequest) -> Result<bool> {
        match self.send_or_reject(AccountingRequest::Charge(charge)).await? {
            AccountingResponse::Charge { success } => Ok(success),
            other => Err(unexpected(other)),
        }
    }

    /// Replace the balance and window of an allocation
    pub async fn update(
        &self,
        actor: Actor,
        allocation: AllocationId,
        amount: i64,
        not_before: Timestamp,
        not_after: Option<Timestamp>,
    ) -> Result<bool> {
        let request = AccountingRequest::Update {
            actor,
            allocation,
            amount,
            not_before,
            not_after,
        };
        match self.send_or_reject(request).await? {
            AccountingResponse::Update { success } => Ok(success),
            other => Err(unexpected(other)),
        }
    }

    /// Currently valid allocations of a wallet
    pub async fn retrieve_allocations(
        &self,
        owner: impl Into<String>,
        category: ProductCategoryId,
    ) -> Result<Vec<AllocationView>> {
        let request = AccountingRequest::RetrieveAllocations {
            owner: owner.into(),
            category,
        };
        match self.send_or_reject(request).await? {
            AccountingResponse::Allocations(views) => Ok(views),
            other => Err(unexpected(other)),
        }
    }

    /// Every wallet of an owner
    pub async fn retrieve_wallets(&self, owner: impl Into<String>) -> Result<Vec<WalletView>> {
        let request = AccountingRequest::RetrieveWallets {
            owner: owner.into(),
        };
        match self.send_or_reject(request).await? {
            AccountingResponse::Wallets(views) => Ok(views),
            other => Err(unexpected(other)),
        }
    }

    /// Allocations granted out of an owner's allocations
    pub async fn browse_sub_allocations(
        &self,
        owner: impl Into<String>,
        query: Option<String>,
    ) -> Result<Vec<SubAllocationView>> {
        let request = AccountingRequest::BrowseSubAllocations {
            owner: owner.into(),
            query,
        };
        match self.send_or_reject(request).await? {
            AccountingResponse::SubAllocations(views) => Ok(views),
            other => Err(unexpected(other)),
        }
    }

    /// Usable balance of a wallet, 0 if it does not exist
    pub async fn max_usable_balance(
        &self,
        owner: impl Into<String>,
        category: ProductCategoryId,
    ) -> Result<i64> {
        let request = AccountingRequest::MaxUsableBalance {
            owner: owner.into(),
            category,
        };
        match self.send_or_reject(request).await? {
            AccountingResponse::Balance(balance) => Ok(balance),
            other => Err(unexpected(other)),
        }
    }

    /// Synchronize immediately; returns the number of records written
    pub async fn synchronize(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AccountingMessage::Synchronize { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Shutdown actor after a final synchronization
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(AccountingMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }

    /// Metrics recorded by the actor
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

fn unexpected(response: AccountingResponse) -> Error {
    Error::Other(format!("Unexpected response: {:?}", response))
}

/// Load the ledger from `storage` and spawn the accounting actor
pub fn spawn_accounting_actor(
    config: &Config,
    storage: Arc<dyn Persistence>,
    collaborators: Collaborators,
) -> Result<(AccountingHandle, JoinHandle<Result<()>>)> {
    let ledger = storage.load()?;
    if config.verify_on_load {
        verify_transaction_trace(&ledger, &storage.transaction_changes()?)?;
        info!("Loaded balances match the transaction history");
    }

    let metrics = Metrics::new()?;
    let accounting = Accounting::new(
        ledger,
        ProductCache::new(collaborators.products),
        ProjectCache::new(collaborators.projects),
    );
    let sync = Synchronizer::new(storage, collaborators.notifier, config.sync.interval())
        .with_metrics(metrics.clone());

    // Bounded channel for backpressure
    let (tx, rx) = mpsc::channel(config.actor.mailbox_capacity.max(1));
    let pending: PendingResponses = Arc::new(DashMap::new());

    let actor = AccountingActor {
        accounting,
        sync,
        mailbox: rx,
        pending: pending.clone(),
        idle_tick: config.sync.idle_tick(),
        verbose: config.verbose_tracing,
        metrics: metrics.clone(),
    };
    let task = tokio::spawn(actor.run());

    let handle = AccountingHandle {
        sender: tx,
        pending,
        next_id: Arc::new(AtomicU64::new(0)),
        metrics,
    };
    Ok((handle, task))
}
