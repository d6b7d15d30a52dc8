use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ulid::Ulid;

use crate::tenant::TenantId;

/// Unique index on `(tenant_id, idempotency_key) -> booking_id`.
///
/// A key is claimed at commit time, before the booking's WAL record is
/// written, so two transactions carrying the same key cannot both commit even
/// when they touch disjoint items. A claim whose write then fails is undone.
#[derive(Debug, Default)]
pub struct IdempotencyIndex {
    keys: DashMap<(TenantId, String), Ulid>,
}

impl IdempotencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, tenant_id: &TenantId, key: &str) -> Option<Ulid> {
        self.keys
            .get(&(tenant_id.clone(), key.to_string()))
            .map(|e| *e.value())
    }

    /// Claim `key` for `booking_id`. First claim wins; a losing claim gets
    /// the winner's booking id back.
    pub fn claim(&self, tenant_id: &TenantId, key: &str, booking_id: Ulid) -> Result<(), Ulid> {
        match self.keys.entry((tenant_id.clone(), key.to_string())) {
            Entry::Occupied(e) if *e.get() == booking_id => Ok(()),
            Entry::Occupied(e) => Err(*e.get()),
            Entry::Vacant(e) => {
                e.insert(booking_id);
                Ok(())
            }
        }
    }

    /// Undo a claim made by `booking_id`; a claim held by anyone else stays.
    pub fn unclaim(&self, tenant_id: &TenantId, key: &str, booking_id: Ulid) {
        self.keys
            .remove_if(&(tenant_id.clone(), key.to_string()), |_, v| *v == booking_id);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
