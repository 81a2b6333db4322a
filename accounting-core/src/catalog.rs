//! Static product and project catalog
//!
//! A file-backed implementation of both cache sources, used by the server
//! binary and by tests. Entries can also be added at runtime; the caches
//! observe them on their next reload.
//!
//! ```toml
//! [[products]]
//! id = 1
//! name = "u1-standard"
//! category = { name = "cpu", provider = "hpc" }
//! price_per_unit = 10
//! charge_type = "ABSOLUTE"
//!
//! [[members]]
//! username = "alice"
//! project = "my-project"
//! role = "ADMIN"
//! ```

use crate::cache::{ProductSource, ProjectSource};
use crate::error::{Error, Result};
use crate::types::{Product, ProjectMember};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    products: Vec<Product>,
    #[serde(default)]
    members: Vec<ProjectMember>,
}

/// In-memory catalog of products and project members
#[derive(Debug, Default)]
pub struct StaticCatalog {
    products: RwLock<Vec<Product>>,
    members: RwLock<Vec<ProjectMember>>,
}

impl StaticCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a catalog from TOML
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse catalog: {}", e)))?;

        Ok(Self {
            products: RwLock::new(file.products),
            members: RwLock::new(file.members),
        })
    }

    /// Load a catalog file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Add a product (or a newer version of one)
    pub fn add_product(&self, product: Product) {
        self.products.write().push(product);
    }

    /// Add a project membership
    pub fn add_member(&self, member: ProjectMember) {
        self.members.write().push(member);
    }
}

#[async_trait]
impl ProductSource for StaticCatalog {
    async fn load_products(&self) -> Result<Vec<Product>> {
        Ok(self.products.read().clone())
    }
}

#[async_trait]
impl ProjectSource for StaticCatalog {
    async fn load_members(&self) -> Result<Vec<ProjectMember>> {
        Ok(self.members.read().clone())
    }
}
