use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{Item, Quantity};
use crate::tenant::{ItemKey, TenantId};

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("inventory unavailable: {0}")]
    Unavailable(String),
}

/// Read-only source of item totals. The engine never writes through it.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// `None` when `tenant_id` has no such item.
    async fn get_total_quantity(
        &self,
        tenant_id: &TenantId,
        item_id: Ulid,
    ) -> Result<Option<Quantity>, InventoryError>;

    /// Every tenant that has an item with this id. Used to resolve the tenant
    /// of anonymous hold requests.
    async fn owners_of(&self, item_id: Ulid) -> Result<Vec<TenantId>, InventoryError>;
}

/// Inventory kept in memory. Seeded by the server's `INSERT INTO items` and by tests.
#[derive(Debug, Default)]
pub struct InMemoryInventory {
    totals: DashMap<ItemKey, Quantity>,
}

impl InMemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, item: Item) {
        self.totals
            .insert(ItemKey::new(item.tenant_id, item.item_id), item.total_quantity);
    }

    pub fn set_total_quantity(&self, tenant_id: &TenantId, item_id: Ulid, total: Quantity) {
        self.totals.insert(ItemKey::new(tenant_id.clone(), item_id), total);
    }

    pub fn len(&self) -> usize {
        self.totals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }
}

#[async_trait]
impl InventoryStore for InMemoryInventory {
    async fn get_total_quantity(
        &self,
        tenant_id: &TenantId,
        item_id: Ulid,
    ) -> Result<Option<Quantity>, InventoryError> {
        Ok(self
            .totals
            .get(&ItemKey::new(tenant_id.clone(), item_id))
            .map(|e| *e.value()))
    }

    async fn owners_of(&self, item_id: Ulid) -> Result<Vec<TenantId>, InventoryError> {
        let mut owners: Vec<TenantId> = self
            .totals
            .iter()
            .filter(|e| e.key().item_id == item_id)
            .map(|e| e.key().tenant_id.clone())
            .collect();
        owners.sort();
        Ok(owners)
    }
}
