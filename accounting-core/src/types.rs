//! Core types for the accounting ledger
//!
//! Balances are plain `i64` credits. Timestamps are Unix epoch milliseconds.

use crate::error::{Error, Result};
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wallet identifier (index into the wallet arena)
pub type WalletId = u32;

/// Allocation identifier (index into the allocation arena)
pub type AllocationId = u32;

/// Unix timestamp in milliseconds
pub type Timestamp = i64;

/// Current wall-clock time in milliseconds
pub fn now_millis() -> Timestamp {
    Utc::now().timestamp_millis()
}

/// Render a timestamp for human-facing messages
pub fn format_timestamp(ts: Timestamp) -> String {
    match ts {
        Timestamp::MAX => "never".to_string(),
        Timestamp::MIN => "the beginning of time".to_string(),
        _ => Utc
            .timestamp_millis_opt(ts)
            .single()
            .map(|dt| dt.format("%d/%m/%Y - %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| ts.to_string()),
    }
}

/// Whether `now` lies inside the closed window `[not_before, not_after]`.
/// A missing `not_after` means the window never ends.
pub fn window_contains(not_before: Timestamp, not_after: Option<Timestamp>, now: Timestamp) -> bool {
    now >= not_before && now <= not_after.unwrap_or(Timestamp::MAX)
}

/// The product category a wallet pays for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductCategoryId {
    /// Category name
    pub name: String,
    /// Provider serving the category
    pub provider: String,
}

impl ProductCategoryId {
    /// Create new category id
    pub fn new(name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
        }
    }
}

impl fmt::Display for ProductCategoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.provider)
    }
}

/// Payment model of a wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChargeType {
    /// Prepaid quota; charges never exceed the remaining balance
    Absolute,
    /// Usage based; usage is recomputed on every charge and may go negative
    DifferentialQuota,
}

impl ChargeType {
    /// Stable code used in durable storage
    pub fn code(&self) -> &'static str {
        match self {
            ChargeType::Absolute => "ABSOLUTE",
            ChargeType::DifferentialQuota => "DIFFERENTIAL_QUOTA",
        }
    }

    /// Parse from code
    pub fn from_code(s: &str) -> Option<Self> {
        match s {
            "ABSOLUTE" => Some(ChargeType::Absolute),
            "DIFFERENTIAL_QUOTA" => Some(ChargeType::DifferentialQuota),
            _ => None,
        }
    }
}

impl fmt::Display for ChargeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Reference to a single product
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductReference {
    /// Product name
    pub id: String,
    /// Category name
    pub category: String,
    /// Provider
    pub provider: String,
}

impl ProductReference {
    /// Create new product reference
    pub fn new(
        id: impl Into<String>,
        category: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            category: category.into(),
            provider: provider.into(),
        }
    }

    /// Category this product belongs to
    pub fn category_id(&self) -> ProductCategoryId {
        ProductCategoryId::new(self.category.clone(), self.provider.clone())
    }
}

/// A priced product
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Surrogate key recorded on charge transactions
    pub id: u64,
    /// Product name
    pub name: String,
    /// Category the product belongs to
    pub category: ProductCategoryId,
    /// Price of one unit for one period
    pub price_per_unit: i64,
    /// Payment model of the category
    pub charge_type: ChargeType,
    /// Free products are never charged
    #[serde(default)]
    pub free_to_use: bool,
    /// Newer versions replace older ones
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

impl Product {
    /// Reference pointing at this product
    pub fn reference(&self) -> ProductReference {
        ProductReference::new(
            self.name.clone(),
            self.category.name.clone(),
            self.category.provider.clone(),
        )
    }
}

/// Who performs a request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Actor {
    /// The platform itself
    System,
    /// An end user
    User(String),
}

impl Actor {
    /// Username recorded on transactions
    pub fn safe_username(&self) -> &str {
        match self {
            Actor::System => "_system",
            Actor::User(username) => username,
        }
    }

    /// Whether this is the privileged system actor
    pub fn is_system(&self) -> bool {
        matches!(self, Actor::System)
    }
}

/// Role of a user in a project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectRole {
    /// Principal investigator
    Pi,
    /// Administrator
    Admin,
    /// Regular member
    User,
}

impl ProjectRole {
    /// PIs and admins may manage allocations
    pub fn is_admin(&self) -> bool {
        matches!(self, ProjectRole::Pi | ProjectRole::Admin)
    }
}

/// Membership of a user in a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMember {
    /// Username
    pub username: String,
    /// Project id
    pub project: String,
    /// Role in the project
    pub role: ProjectRole,
}

/// The account paying for one (owner, product category) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wallet {
    /// Wallet id
    pub id: WalletId,
    /// Username or project id
    pub owner: String,
    /// Category this wallet pays for
    pub category: ProductCategoryId,
    /// Payment model
    pub charge_type: ChargeType,
    /// Unflushed changes since the last synchronization
    pub dirty: bool,
}

/// A time-bounded credit grant under a wallet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// Allocation id
    pub id: AllocationId,
    /// Wallet owning this allocation
    pub wallet: WalletId,
    /// Parent allocation, `None` for roots
    pub parent: Option<AllocationId>,
    /// Start of the validity window
    pub not_before: Timestamp,
    /// End of the validity window, `None` if open-ended
    pub not_after: Option<Timestamp>,
    /// Amount of the most recent deposit or update
    pub initial_balance: i64,
    /// Consumable remainder after propagation through the ancestor chain
    pub current_balance: i64,
    /// Consumption local to this node
    pub local_balance: i64,
    /// Unflushed changes since the last synchronization
    pub dirty: bool,
}

impl Allocation {
    /// Whether the validity window contains `now`
    pub fn is_valid(&self, now: Timestamp) -> bool {
        window_contains(self.not_before, self.not_after, now)
    }

    /// Usage recorded locally at the last charge
    pub fn local_usage(&self) -> Result<i64> {
        self.initial_balance
            .checked_sub(self.local_balance)
            .ok_or(Error::BalanceOverflow(self.id))
    }

    /// Usage of this node and everything below it
    pub fn subtree_usage(&self) -> Result<i64> {
        self.initial_balance
            .checked_sub(self.current_balance)
            .ok_or(Error::BalanceOverflow(self.id))
    }
}

/// Common fields of every transaction row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInfo {
    /// Allocation whose balance changed
    pub affected_allocation: AllocationId,
    /// Signed change of the affected allocation's current balance
    pub change: i64,
    /// Username of the actor
    pub performed_by: String,
    /// Human description
    pub description: String,
    /// Creation time
    pub created_at: Timestamp,
    /// Category of the affected wallet
    pub category: ProductCategoryId,
    /// Unique id of this row
    pub transaction_id: String,
    /// Groups all rows produced by one logical operation
    pub initial_transaction_id: String,
}

/// Append-only ledger transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transaction {
    /// Credit granted to an allocation
    Deposit {
        /// Common fields
        info: TransactionInfo,
        /// Parent allocation the credit was carved out of
        source_allocation: Option<AllocationId>,
        /// Start of the granted window
        start_date: Timestamp,
        /// End of the granted window
        end_date: Option<Timestamp>,
    },
    /// Consumption charged against an allocation chain
    Charge {
        /// Common fields
        info: TransactionInfo,
        /// Allocation the charge was initiated against
        source_allocation: AllocationId,
        /// Product key, when charged by product use
        product_id: Option<u64>,
        /// Number of periods, when charged by product use
        periods: Option<i64>,
        /// Number of units, when charged by product use
        units: Option<i64>,
    },
    /// In-place replacement of balance and window
    AllocationUpdate {
        /// Common fields
        info: TransactionInfo,
        /// New start of the window
        start_date: Timestamp,
        /// New end of the window
        end_date: Option<Timestamp>,
    },
    /// Credit moved from one allocation to another
    Transfer {
        /// Common fields
        info: TransactionInfo,
        /// Allocation the credit was moved from
        source_allocation: AllocationId,
        /// Start of the window
        start_date: Timestamp,
        /// End of the window
        end_date: Option<Timestamp>,
    },
}

impl Transaction {
    /// Common fields
    pub fn info(&self) -> &TransactionInfo {
        match self {
            Transaction::Deposit { info, .. }
            | Transaction::Charge { info, .. }
            | Transaction::AllocationUpdate { info, .. }
            | Transaction::Transfer { info, .. } => info,
        }
    }
}

/// Read-only view of an allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationView {
    /// Allocation id
    pub id: AllocationId,
    /// Ancestry from the root down to this allocation
    pub path: Vec<AllocationId>,
    /// Current balance
    pub balance: i64,
    /// Initial balance
    pub initial_balance: i64,
    /// Local balance
    pub local_balance: i64,
    /// Largest amount chargeable without exceeding any ancestor
    pub max_usable_balance: i64,
    /// Start of the validity window
    pub not_before: Timestamp,
    /// End of the validity window
    pub not_after: Option<Timestamp>,
}

/// Read-only view of a wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletView {
    /// Wallet id
    pub id: WalletId,
    /// Owner
    pub owner: String,
    /// Category
    pub category: ProductCategoryId,
    /// Payment model
    pub charge_type: ChargeType,
    /// Every allocation of the wallet
    pub allocations: Vec<AllocationView>,
}

/// An allocation granted out of another owner's allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubAllocationView {
    /// Allocation id
    pub id: AllocationId,
    /// Materialized path (dot-joined ids)
    pub path: String,
    /// Start of the validity window
    pub not_before: Timestamp,
    /// End of the validity window
    pub not_after: Option<Timestamp>,
    /// Category
    pub category: ProductCategoryId,
    /// Payment model
    pub charge_type: ChargeType,
    /// Owner of the sub-allocation's wallet
    pub workspace: String,
    /// Current balance
    pub remaining: i64,
    /// Initial balance
    pub initial_balance: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_contains() {
        assert!(window_contains(100, Some(200), 100));
        assert!(window_contains(100, Some(200), 200));
        assert!(!window_contains(100, Some(200), 201));
        assert!(!window_contains(100, Some(200), 99));
        assert!(window_contains(100, None, Timestamp::MAX));
    }

    #[test]
    fn test_charge_type_codes() {
        for ty in [ChargeType::Absolute, ChargeType::DifferentialQuota] {
            assert_eq!(ChargeType::from_code(ty.code()), Some(ty));
        }
        assert_eq!(ChargeType::from_code("PERIODIC"), None);
    }

    #[test]
    fn test_actor_username() {
        assert_eq!(Actor::System.safe_username(), "_system");
        assert_eq!(Actor::User("alice".into()).safe_username(), "alice");
    }

    #[test]
    fn test_admin_roles() {
        assert!(ProjectRole::Pi.is_admin());
        assert!(ProjectRole::Admin.is_admin());
        assert!(!ProjectRole::User.is_admin());
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "01/01/1970 - 00:00:00 UTC");
        assert_eq!(format_timestamp(Timestamp::MAX), "never");
    }
}
