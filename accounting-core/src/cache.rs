//! Project-role and product caches
//!
//! Both caches hold an immutable snapshot behind an `Arc`. Readers never wait
//! for a reload. A reload follows the double-checked refill protocol:
//!
//! 1. remember the snapshot seen before asking for the refill lock
//! 2. take the refill lock
//! 3. if the snapshot was replaced in the meantime, someone else already
//!    reloaded it, so return
//! 4. otherwise load from the source and swap the snapshot in
//!
//! Concurrent refresh requests therefore trigger exactly one reload.

use crate::error::Result;
use crate::types::{ChargeType, Product, ProductCategoryId, ProductReference, ProjectMember, ProjectRole};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Where product and pricing information comes from
#[async_trait]
pub trait ProductSource: Send + Sync {
    /// Every known product, all versions
    async fn load_products(&self) -> Result<Vec<Product>>;
}

/// Where project membership comes from
#[async_trait]
pub trait ProjectSource: Send + Sync {
    /// Every project membership
    async fn load_members(&self) -> Result<Vec<ProjectMember>>;
}

/// Snapshot cell with double-checked refill
#[derive(Debug)]
struct RefillCell<T> {
    current: RwLock<Arc<T>>,
    refill: Mutex<()>,
    reloads: AtomicU64,
}

impl<T> RefillCell<T> {
    fn new(initial: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            refill: Mutex::new(()),
            reloads: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> Arc<T> {
        self.current.read().clone()
    }

    async fn refill<F, Fut>(&self, load: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let before = self.snapshot();
        let _guard = self.refill.lock().await;

        if !Arc::ptr_eq(&before, &self.snapshot()) {
            return Ok(());
        }

        let fresh = load().await?;
        *self.current.write() = Arc::new(fresh);
        self.reloads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn reloads(&self) -> u64 {
        self.reloads.load(Ordering::Relaxed)
    }
}

/// Latest version of every product
pub struct ProductCache {
    source: Arc<dyn ProductSource>,
    products: RefillCell<HashMap<ProductReference, Product>>,
}

impl ProductCache {
    /// Create an empty cache over `source`
    pub fn new(source: Arc<dyn ProductSource>) -> Self {
        Self {
            source,
            products: RefillCell::new(HashMap::new()),
        }
    }

    /// Reload from the source unless a concurrent caller already did
    pub async fn fill(&self) -> Result<()> {
        let source = self.source.clone();
        self.products
            .refill(|| async move {
                let mut latest: HashMap<ProductReference, Product> = HashMap::new();
                for product in source.load_products().await? {
                    let reference = product.reference();
                    match latest.get(&reference) {
                        Some(existing) if existing.version >= product.version => {}
                        _ => {
                            latest.insert(reference, product);
                        }
                    }
                }
                debug!(products = latest.len(), "product cache filled");
                Ok(latest)
            })
            .await
    }

    /// Look up a product, reloading once on a miss
    pub async fn retrieve_product(&self, reference: &ProductReference) -> Result<Option<Product>> {
        if let Some(product) = self.products.snapshot().get(reference) {
            return Ok(Some(product.clone()));
        }

        self.fill().await?;
        Ok(self.products.snapshot().get(reference).cloned())
    }

    /// Charge type of a category, taken from any of its products. Reloads
    /// once on a miss.
    pub async fn retrieve_charge_type(&self, category: &ProductCategoryId) -> Result<Option<ChargeType>> {
        if let Some(charge_type) = Self::find_charge_type(&self.products.snapshot(), category) {
            return Ok(Some(charge_type));
        }

        self.fill().await?;
        Ok(Self::find_charge_type(&self.products.snapshot(), category))
    }

    fn find_charge_type(
        products: &HashMap<ProductReference, Product>,
        category: &ProductCategoryId,
    ) -> Option<ChargeType> {
        products
            .values()
            .find(|product| &product.category == category)
            .map(|product| product.charge_type)
    }

    /// Number of reloads performed so far
    pub fn reloads(&self) -> u64 {
        self.products.reloads()
    }
}

impl std::fmt::Debug for ProductCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProductCache")
            .field("products", &self.products.snapshot().len())
            .field("reloads", &self.reloads())
            .finish()
    }
}

/// Project memberships, used for admin checks
pub struct ProjectCache {
    source: Arc<dyn ProjectSource>,
    members: RefillCell<Vec<ProjectMember>>,
}

impl ProjectCache {
    /// Create an empty cache over `source`
    pub fn new(source: Arc<dyn ProjectSource>) -> Self {
        Self {
            source,
            members: RefillCell::new(Vec::new()),
        }
    }

    /// Reload from the source unless a concurrent caller already did
    pub async fn fill(&self) -> Result<()> {
        let source = self.source.clone();
        self.members
            .refill(|| async move {
                let members = source.load_members().await?;
                debug!(members = members.len(), "project cache filled");
                Ok(members)
            })
            .await
    }

    /// Role of `username` in `project`, reloading once on a miss
    pub async fn retrieve_role(&self, username: &str, project: &str) -> Result<Option<ProjectRole>> {
        if let Some(role) = Self::find_role(&self.members.snapshot(), username, project) {
            return Ok(Some(role));
        }

        self.fill().await?;
        Ok(Self::find_role(&self.members.snapshot(), username, project))
    }

    fn find_role(members: &[ProjectMember], username: &str, project: &str) -> Option<ProjectRole> {
        members
            .iter()
            .find(|m| m.username == username && m.project == project)
            .map(|m| m.role)
    }

    /// Number of reloads performed so far
    pub fn reloads(&self) -> u64 {
        self.members.reloads()
    }
}

impl std::fmt::Debug for ProjectCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectCache")
            .field("members", &self.members.snapshot().len())
            .field("reloads", &self.reloads())
            .finish()
    }
}
