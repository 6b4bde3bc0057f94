use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ServiceError;

/// Price and tracking data for a SKU at the moment a line item is added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkuSnapshot {
    pub sku_id: String,
    pub name: String,
    pub unit_price: Decimal,
    pub cost_price: Option<Decimal>,
    /// Units are tracked individually (IMEI or serial number).
    pub serialized: bool,
}

/// Catalog lookups consumed by the order services.
#[async_trait]
pub trait CatalogService: Send + Sync {
    /// Returns `None` when the SKU does not exist.
    async fn sku_snapshot(&self, sku_id: &str) -> Result<Option<SkuSnapshot>, ServiceError>;
}

/// Customer existence checks consumed at order creation.
#[async_trait]
pub trait CustomerDirectory: Send + Sync {
    async fn customer_exists(&self, customer_id: Uuid) -> Result<bool, ServiceError>;
}

/// Catalog kept in memory; used by tests and the operator CLI.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    skus: DashMap<String, SkuSnapshot>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, snapshot: SkuSnapshot) {
        self.skus.insert(snapshot.sku_id.clone(), snapshot);
    }

    /// Registers a plain (non-serialized) SKU at the given price.
    pub fn with_sku(self, sku_id: &str, unit_price: Decimal) -> Self {
        self.upsert(SkuSnapshot {
            sku_id: sku_id.to_string(),
            name: sku_id.to_string(),
            unit_price,
            cost_price: None,
            serialized: false,
        });
        self
    }

    /// Registers a serialized SKU at the given price.
    pub fn with_serialized_sku(self, sku_id: &str, unit_price: Decimal) -> Self {
        self.upsert(SkuSnapshot {
            sku_id: sku_id.to_string(),
            name: sku_id.to_string(),
            unit_price,
            cost_price: None,
            serialized: true,
        });
        self
    }
}

#[async_trait]
impl CatalogService for InMemoryCatalog {
    async fn sku_snapshot(&self, sku_id: &str) -> Result<Option<SkuSnapshot>, ServiceError> {
        Ok(self.skus.get(sku_id).map(|entry| entry.value().clone()))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCustomers {
    customers: DashSet<Uuid>,
}

impl InMemoryCustomers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, customer_id: Uuid) {
        self.customers.insert(customer_id);
    }
}

#[async_trait]
impl CustomerDirectory for InMemoryCustomers {
    async fn customer_exists(&self, customer_id: Uuid) -> Result<bool, ServiceError> {
        Ok(self.customers.contains(&customer_id))
    }
}
