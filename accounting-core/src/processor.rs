//! Request handlers
//!
//! `Accounting` validates and authorizes each request, resolves wallets and
//! products through the caches, and applies the result to the `Ledger`.
//! Rejections are returned as `AccountingResponse::Error` values; an `Err`
//! from `handle` means the request could not be processed at all.

use crate::cache::{ProductCache, ProjectCache};
use crate::charge::ChargeDescription;
use crate::error::{Error, Result};
use crate::ledger::Ledger;
use crate::request::{AccountingRequest, AccountingResponse, ChargeRequest, ErrorCode};
use crate::types::{
    Actor, AllocationId, ProductCategoryId, Timestamp, WalletId,
};
use tracing::{debug, info, warn};

/// The ledger together with the collaborators its handlers need
#[derive(Debug)]
pub struct Accounting {
    ledger: Ledger,
    products: ProductCache,
    projects: ProjectCache,
}

impl Accounting {
    /// Create new processor
    pub fn new(ledger: Ledger, products: ProductCache, projects: ProjectCache) -> Self {
        Self {
            ledger,
            products,
            projects,
        }
    }

    /// Ledger state
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Mutable ledger state
    pub fn ledger_mut(&mut self) -> &mut Ledger {
        &mut self.ledger
    }

    /// Reload both caches. Both reloads are attempted even if the first fails.
    pub async fn refresh_caches(&self) -> Result<()> {
        let products = self.products.fill().await;
        let projects = self.projects.fill().await;
        products.and(projects)
    }

    /// Handle a single request
    pub async fn handle(
        &mut self,
        request: AccountingRequest,
        now: Timestamp,
    ) -> Result<AccountingResponse> {
        match request {
            AccountingRequest::RootDeposit {
                actor,
                owner,
                category,
                amount,
            } => self.root_deposit(actor, owner, category, amount, now).await,

            AccountingRequest::Deposit {
                actor,
                owner,
                parent,
                amount,
                not_before,
                not_after,
            } => {
                self.deposit(actor, owner, parent, amount, not_before, not_after, now)
                    .await
            }

            AccountingRequest::Charge(charge) => self.charge(charge, now).await,

            AccountingRequest::Update {
                actor,
                allocation,
                amount,
                not_before,
                not_after,
            } => {
                self.update(actor, allocation, amount, not_before, not_after, now)
                    .await
            }

            AccountingRequest::RetrieveAllocations { owner, category } => {
                Ok(match self.ledger.find_wallet(&owner, &category) {
                    Some(wallet) => AccountingResponse::Allocations(
                        self.ledger.valid_allocation_views(wallet, now),
                    ),
                    None => {
                        AccountingResponse::error(ErrorCode::NotFound, "Unknown wallet requested")
                    }
                })
            }

            AccountingRequest::RetrieveWallets { owner } => {
                Ok(AccountingResponse::Wallets(self.ledger.wallet_views(&owner)))
            }

            AccountingRequest::BrowseSubAllocations { owner, query } => {
                let views = self.ledger.sub_allocations(&owner, query.as_deref());
                Ok(AccountingResponse::SubAllocations(views))
            }

            AccountingRequest::MaxUsableBalance { owner, category } => {
                let balance = self
                    .ledger
                    .find_wallet(&owner, &category)
                    .map(|wallet| self.ledger.wallet_max_usable_balance(wallet, now))
                    .unwrap_or(0);
                Ok(AccountingResponse::Balance(balance))
            }
        }
    }

    async fn root_deposit(
        &mut self,
        actor: Actor,
        owner: String,
        category: ProductCategoryId,
        amount: i64,
        now: Timestamp,
    ) -> Result<AccountingResponse> {
        if amount < 0 {
            return Ok(AccountingResponse::error(
                ErrorCode::BadRequest,
                "Cannot deposit with a negative balance",
            ));
        }

        if !actor.is_system() {
            return Ok(AccountingResponse::error(
                ErrorCode::Forbidden,
                "Only administrators can perform a root deposit",
            ));
        }

        let Some(wallet) = self.resolve_wallet(&owner, &category).await? else {
            return Ok(AccountingResponse::error(
                ErrorCode::UnknownProduct,
                "Unknown product category.",
            ));
        };

        let created = self
            .ledger
            .root_deposit(wallet, amount, actor.safe_username(), now)?;

        info!(allocation = created, owner = %owner, category = %category, amount, "Root deposit");
        Ok(AccountingResponse::RootDeposit(created))
    }

    #[allow(clippy::too_many_arguments)]
    async fn deposit(
        &mut self,
        actor: Actor,
        owner: String,
        parent: AllocationId,
        amount: i64,
        not_before: Timestamp,
        not_after: Option<Timestamp>,
        now: Timestamp,
    ) -> Result<AccountingResponse> {
        if amount < 0 {
            return Ok(AccountingResponse::error(
                ErrorCode::BadRequest,
                "Cannot deposit with a negative balance",
            ));
        }

        if let Some(response) = reject_inverted_window(not_before, not_after) {
            return Ok(response);
        }

        let Some((parent_owner, category)) = self.owner_and_category(parent) else {
            return Ok(AccountingResponse::error(
                ErrorCode::NotFound,
                "Bad parent allocation",
            ));
        };

        if !self.is_admin(&actor, &parent_owner).await? {
            return Ok(not_allowed());
        }

        if let Err(overlap) = self
            .ledger
            .check_overlap_ancestors(parent, not_before, not_after)
        {
            return Ok(AccountingResponse::error(
                ErrorCode::BadRequest,
                overlap.to_string(),
            ));
        }

        let Some(wallet) = self.resolve_wallet(&owner, &category).await? else {
            return Ok(AccountingResponse::error(
                ErrorCode::GenericError,
                format!("Internal error - Product category no longer exists {}", category),
            ));
        };

        let created = self.ledger.deposit(
            wallet,
            parent,
            amount,
            not_before,
            not_after,
            actor.safe_username(),
            now,
        )?;

        info!(allocation = created, parent, owner = %owner, amount, "Deposit");
        Ok(AccountingResponse::Deposit(created))
    }

    async fn charge(&mut self, request: ChargeRequest, now: Timestamp) -> Result<AccountingResponse> {
        let description = match &request {
            ChargeRequest::Raw { actor, amount, .. } => {
                ChargeDescription::raw(actor.safe_username(), *amount)
            }

            ChargeRequest::ProductUse {
                actor,
                units,
                period,
                product,
                ..
            } => {
                let Some(product) = self.products.retrieve_product(product).await? else {
                    return Ok(AccountingResponse::error(
                        ErrorCode::UnknownProduct,
                        "Could not find product information in charge request.",
                    ));
                };

                let Some(amount) = product
                    .price_per_unit
                    .checked_mul(*units)
                    .and_then(|amount| amount.checked_mul(*period))
                else {
                    return Ok(AccountingResponse::error(
                        ErrorCode::BadRequest,
                        "Charge amount is out of range",
                    ));
                };

                ChargeDescription {
                    performed_by: actor.safe_username().to_string(),
                    amount,
                    units: Some(*units),
                    periods: Some(*period),
                    product_id: Some(product.id),
                    is_free: product.free_to_use,
                }
            }
        };

        if description.amount < 0 {
            return Ok(AccountingResponse::error(
                ErrorCode::BadRequest,
                "Cannot charge a negative amount",
            ));
        }

        if description.is_free {
            return Ok(AccountingResponse::Charge { success: true });
        }

        let Some(wallet) = self.ledger.find_wallet(request.owner(), &request.category()) else {
            debug!(owner = request.owner(), "Charge against unknown wallet");
            return Ok(AccountingResponse::Charge { success: false });
        };

        match self
            .ledger
            .charge(wallet, &description, now, request.dry_run())
        {
            Ok(success) => Ok(AccountingResponse::Charge { success }),
            Err(Error::BalanceOverflow(allocation)) => {
                warn!(
                    wallet,
                    allocation,
                    amount = description.amount,
                    "Charge overflows a balance"
                );
                Ok(AccountingResponse::error(
                    ErrorCode::BadRequest,
                    "Charge amount is out of range",
                ))
            }
            Err(err) => Err(err),
        }
    }

    async fn update(
        &mut self,
        actor: Actor,
        allocation: AllocationId,
        amount: i64,
        not_before: Timestamp,
        not_after: Option<Timestamp>,
        now: Timestamp,
    ) -> Result<AccountingResponse> {
        if amount < 0 {
            return Ok(AccountingResponse::error(
                ErrorCode::BadRequest,
                "Cannot update to a negative balance",
            ));
        }

        if let Some(response) = reject_inverted_window(not_before, not_after) {
            return Ok(response);
        }

        let Some(parent) = self.ledger.allocation(allocation).map(|alloc| alloc.parent) else {
            return Ok(AccountingResponse::error(
                ErrorCode::NotFound,
                "Invalid allocation id supplied",
            ));
        };

        if !actor.is_system() {
            // Only admins of the granting project may change a grant; roots
            // have no granting project
            let Some((parent_owner, _)) = parent.and_then(|id| self.owner_and_category(id)) else {
                return Ok(not_allowed());
            };

            if !self.is_admin(&actor, &parent_owner).await? {
                return Ok(not_allowed());
            }
        }

        if let Some(parent) = parent {
            if let Err(overlap) = self
                .ledger
                .check_overlap_ancestors(parent, not_before, not_after)
            {
                return Ok(AccountingResponse::error(
                    ErrorCode::BadRequest,
                    overlap.to_string(),
                ));
            }
        }

        let updated = self.ledger.update(
            allocation,
            amount,
            not_before,
            not_after,
            actor.safe_username(),
            now,
        );
        if let Err(Error::BalanceOverflow(_)) = updated {
            return Ok(AccountingResponse::error(
                ErrorCode::BadRequest,
                "Allocation balance is out of range",
            ));
        }
        updated?;

        info!(allocation, amount, not_before, ?not_after, "Allocation updated");
        Ok(AccountingResponse::Update { success: true })
    }

    /// The wallet paying for `(owner, category)`, created if the category is
    /// known to the product catalog
    async fn resolve_wallet(
        &mut self,
        owner: &str,
        category: &ProductCategoryId,
    ) -> Result<Option<WalletId>> {
        if let Some(wallet) = self.ledger.find_wallet(owner, category) {
            return Ok(Some(wallet));
        }

        let Some(charge_type) = self.products.retrieve_charge_type(category).await? else {
            return Ok(None);
        };

        let wallet = self
            .ledger
            .create_wallet(owner, category.clone(), charge_type);
        debug!(wallet, owner, category = %category, charge_type = %charge_type, "Wallet created");
        Ok(Some(wallet))
    }

    /// Owner and category of the wallet holding `allocation`
    fn owner_and_category(&self, allocation: AllocationId) -> Option<(String, ProductCategoryId)> {
        let alloc = self.ledger.allocation(allocation)?;
        let wallet = self.ledger.wallet_of(alloc)?;
        Some((wallet.owner.clone(), wallet.category.clone()))
    }

    async fn is_admin(&self, actor: &Actor, project: &str) -> Result<bool> {
        match actor {
            Actor::System => Ok(true),
            Actor::User(username) => Ok(self
                .projects
                .retrieve_role(username, project)
                .await?
                .map_or(false, |role| role.is_admin())),
        }
    }
}

fn not_allowed() -> AccountingResponse {
    AccountingResponse::error(
        ErrorCode::Forbidden,
        "You are not allowed to manage this allocation.",
    )
}

fn reject_inverted_window(
    not_before: Timestamp,
    not_after: Option<Timestamp>,
) -> Option<AccountingResponse> {
    match not_after {
        Some(end) if end < not_before => Some(AccountingResponse::error(
            ErrorCode::BadRequest,
            "Allocation period is invalid: it must not end before it starts.",
        )),
        _ => None,
    }
}
