use crate::limits::MAX_IDEMPOTENCY_KEY_LEN;
use crate::model::Booking;
use crate::tenant::TenantId;

use super::{BadRequest, Engine};

pub(super) fn validate_key(key: &str) -> Result<(), BadRequest> {
    if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(BadRequest::InvalidIdempotencyKey {
            max: MAX_IDEMPOTENCY_KEY_LEN,
        });
    }
    Ok(())
}

impl Engine {
    /// The booking registered under `(tenant_id, key)`, if any. Registration
    /// happens only as part of a booking commit; there is no separate insert.
    pub fn lookup_idempotent(&self, tenant_id: &TenantId, key: &str) -> Option<Booking> {
        let id = self.store.idempotency().lookup(tenant_id, key)?;
        self.store.booking(&id)
    }
}
