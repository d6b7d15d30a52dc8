mod bookings;
mod error;
mod holds;
mod idempotency;
mod overlap;
#[cfg(test)]
mod tests;

pub use bookings::{BookingReceipt, BookingRequest, LineRequest};
pub use error::{BadRequest, EngineError, ErrorKind};
pub use holds::{HoldRequest, ReleaseOutcome};
pub use overlap::{committed_and_held, Availability};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::inventory::InventoryStore;
use crate::limits::*;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::store::Store;
use crate::tenant::{ItemKey, TenantContext, TenantId};

/// The availability and booking engine: hold ledger, booking transactor and
/// idempotency registry over one durable store shared by every tenant.
///
/// Holds no mutable state of its own; every decision is made against the
/// store, so any number of tasks may call into one `Arc<Engine>`.
pub struct Engine {
    store: Store,
    inventory: Arc<dyn InventoryStore>,
    notify: Arc<NotifyHub>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl Engine {
    /// Open (or create) the store at `wal_path`. Must run inside a tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        inventory: Arc<dyn InventoryStore>,
        notify: Arc<NotifyHub>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        Ok(Self {
            store: Store::open(&wal_path)?,
            inventory,
            notify,
            clock: Arc::new(SystemClock),
            config,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn notify(&self) -> &Arc<NotifyHub> {
        &self.notify
    }

    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        Ok(self.store.compact_wal().await?)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.store.wal_appends_since_compact().await
    }

    /// Total quantity of `tenant_id`'s item, or `ItemNotFound`.
    async fn total_quantity(&self, tenant_id: &TenantId, item_id: Ulid) -> Result<Quantity, EngineError> {
        self.inventory
            .get_total_quantity(tenant_id, item_id)
            .await?
            .ok_or(EngineError::ItemNotFound(item_id))
    }

    /// Ledger key and total of an item as seen from `tenant`. A tenant sees
    /// only its own items; the public context takes the tenant from the item,
    /// which must then have exactly one owner.
    async fn resolve_item(
        &self,
        tenant: &TenantContext,
        item_id: Ulid,
    ) -> Result<(ItemKey, Quantity), EngineError> {
        let tenant_id = match tenant {
            TenantContext::Tenant(t) => t.clone(),
            TenantContext::Public => {
                let mut owners = self.inventory.owners_of(item_id).await?;
                match owners.len() {
                    0 => return Err(EngineError::ItemNotFound(item_id)),
                    1 => owners.remove(0),
                    _ => return Err(BadRequest::AmbiguousItem(item_id).into()),
                }
            }
        };
        let total = self.total_quantity(&tenant_id, item_id).await?;
        Ok((ItemKey::new(tenant_id, item_id), total))
    }
}

/// Caller-supplied `[start, end)`: ordered, inside the accepted timestamp
/// range and not wider than the longest rental.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = Span::checked(start, end).ok_or(BadRequest::EmptyInterval)?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(span)
}

fn validate_customer_id(customer_id: &str) -> Result<(), BadRequest> {
    if customer_id.is_empty() || customer_id.len() > MAX_CUSTOMER_ID_LEN {
        return Err(BadRequest::InvalidCustomerId {
            max: MAX_CUSTOMER_ID_LEN,
        });
    }
    Ok(())
}
