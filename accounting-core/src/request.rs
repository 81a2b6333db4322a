//! Requests accepted by the accounting actor and their responses

use crate::types::{
    Actor, AllocationId, AllocationView, ProductCategoryId, ProductReference, SubAllocationView,
    Timestamp, WalletView,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A request to the accounting ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountingRequest {
    /// Create a root allocation (system actor only)
    RootDeposit {
        /// Who performs the request
        actor: Actor,
        /// Receiving owner
        owner: String,
        /// Category the credit is valid for
        category: ProductCategoryId,
        /// Amount to grant
        amount: i64,
    },

    /// Create a child allocation under an existing allocation
    Deposit {
        /// Who performs the request
        actor: Actor,
        /// Receiving owner
        owner: String,
        /// Allocation the credit is carved out of
        parent: AllocationId,
        /// Amount to grant
        amount: i64,
        /// Start of the validity window
        not_before: Timestamp,
        /// End of the validity window
        not_after: Option<Timestamp>,
    },

    /// Charge consumption
    Charge(ChargeRequest),

    /// Replace the balance and window of an allocation
    Update {
        /// Who performs the request
        actor: Actor,
        /// Allocation to update
        allocation: AllocationId,
        /// New balance
        amount: i64,
        /// New start of the validity window
        not_before: Timestamp,
        /// New end of the validity window
        not_after: Option<Timestamp>,
    },

    /// Currently valid allocations of a wallet
    RetrieveAllocations {
        /// Wallet owner
        owner: String,
        /// Wallet category
        category: ProductCategoryId,
    },

    /// Every wallet of an owner
    RetrieveWallets {
        /// Wallet owner
        owner: String,
    },

    /// Allocations granted out of the owner's allocations
    BrowseSubAllocations {
        /// Granting owner
        owner: String,
        /// Optional filter on workspace, category or provider
        query: Option<String>,
    },

    /// Sum of the usable balance of a wallet
    MaxUsableBalance {
        /// Wallet owner
        owner: String,
        /// Wallet category
        category: ProductCategoryId,
    },
}

impl AccountingRequest {
    /// Short name for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            AccountingRequest::RootDeposit { .. } => "root_deposit",
            AccountingRequest::Deposit { .. } => "deposit",
            AccountingRequest::Charge(ChargeRequest::Raw { .. }) => "charge_raw",
            AccountingRequest::Charge(ChargeRequest::ProductUse { .. }) => "charge_product_use",
            AccountingRequest::Update { .. } => "update",
            AccountingRequest::RetrieveAllocations { .. } => "retrieve_allocations",
            AccountingRequest::RetrieveWallets { .. } => "retrieve_wallets",
            AccountingRequest::BrowseSubAllocations { .. } => "browse_sub_allocations",
            AccountingRequest::MaxUsableBalance { .. } => "max_usable_balance",
        }
    }
}

/// The two shapes of a charge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargeRequest {
    /// Direct credit charge
    Raw {
        /// Who performs the request
        actor: Actor,
        /// Paying owner
        owner: String,
        /// Category being paid for
        category: ProductCategoryId,
        /// Credits to charge
        amount: i64,
        /// Simulate only
        dry_run: bool,
    },

    /// Charge `price × units × period` of a product
    ProductUse {
        /// Who performs the request
        actor: Actor,
        /// Paying owner
        owner: String,
        /// Units consumed
        units: i64,
        /// Periods consumed
        period: i64,
        /// Product consumed
        product: ProductReference,
        /// Simulate only
        dry_run: bool,
    },
}

impl ChargeRequest {
    /// Who performs the request
    pub fn actor(&self) -> &Actor {
        match self {
            ChargeRequest::Raw { actor, .. } | ChargeRequest::ProductUse { actor, .. } => actor,
        }
    }

    /// Paying owner
    pub fn owner(&self) -> &str {
        match self {
            ChargeRequest::Raw { owner, .. } | ChargeRequest::ProductUse { owner, .. } => owner,
        }
    }

    /// Category being paid for
    pub fn category(&self) -> ProductCategoryId {
        match self {
            ChargeRequest::Raw { category, .. } => category.clone(),
            ChargeRequest::ProductUse { product, .. } => product.category_id(),
        }
    }

    /// Whether this is a simulation
    pub fn dry_run(&self) -> bool {
        match self {
            ChargeRequest::Raw { dry_run, .. } | ChargeRequest::ProductUse { dry_run, .. } => {
                *dry_run
            }
        }
    }
}

/// Response to an `AccountingRequest`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountingResponse {
    /// Allocation created by a root deposit
    RootDeposit(AllocationId),
    /// Allocation created by a deposit
    Deposit(AllocationId),
    /// Whether the full amount was charged
    Charge {
        /// Full amount covered
        success: bool,
    },
    /// Whether the update was applied
    Update {
        /// Update applied
        success: bool,
    },
    /// Allocation views
    Allocations(Vec<AllocationView>),
    /// Wallet views
    Wallets(Vec<WalletView>),
    /// Sub-allocation views
    SubAllocations(Vec<SubAllocationView>),
    /// A balance
    Balance(i64),
    /// The request was rejected
    Error(ResponseError),
}

impl AccountingResponse {
    /// Build an error response
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        AccountingResponse::Error(ResponseError::new(code, message))
    }

    /// Whether this is an error response
    pub fn is_error(&self) -> bool {
        matches!(self, AccountingResponse::Error(_))
    }
}

/// Category of a rejected request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed or invalid input
    BadRequest,
    /// Referenced wallet or allocation does not exist
    NotFound,
    /// Caller may not perform the operation
    Forbidden,
    /// Product or category unknown to the product catalog
    UnknownProduct,
    /// Anything else
    GenericError,
}

impl ErrorCode {
    /// Stable code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::UnknownProduct => "UNKNOWN_PRODUCT",
            ErrorCode::GenericError => "GENERIC_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed error returned in place of a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseError {
    /// Human readable message
    pub message: String,
    /// Error category
    pub code: ErrorCode,
}

impl ResponseError {
    /// Create new response error
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
        }
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.message, self.code)
    }
}
