use std::time::Duration;

use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::MAX_ALLOCATIONS_PER_ITEM;
use crate::model::*;
use crate::observability::{HOLDS_REMOVED_TOTAL, HOLDS_TOTAL};
use crate::tenant::{scoped, TenantContext};

use super::overlap::committed_and_held;
use super::{validate_customer_id, validate_span, BadRequest, Engine, EngineError};

#[derive(Debug, Clone)]
pub struct HoldRequest {
    pub tenant: TenantContext,
    pub item_id: Ulid,
    pub quantity: Quantity,
    pub start: Ms,
    pub end: Ms,
    /// Clamped into the configured bounds; the default TTL when `None`.
    pub ttl: Option<Duration>,
    pub customer_id: Option<String>,
    pub session_id: Option<String>,
}

impl HoldRequest {
    pub fn new(tenant: impl Into<TenantContext>, item_id: Ulid, quantity: Quantity, start: Ms, end: Ms) -> Self {
        Self {
            tenant: tenant.into(),
            item_id,
            quantity,
            start,
            end,
            ttl: None,
            customer_id: None,
            session_id: None,
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released(Hold),
    /// Already released, consumed or swept. Not an error.
    NotFound,
}

impl Engine {
    /// Place a time-limited hold if `committed_and_held + quantity` fits the
    /// item's total; otherwise `Conflict` with what is left.
    pub async fn create_hold(&self, req: HoldRequest) -> Result<Hold, EngineError> {
        let result = self.place_hold(req).await;
        let outcome = match &result {
            Ok(_) => "placed",
            Err(EngineError::Conflict { .. }) => "conflict",
            Err(_) => "rejected",
        };
        metrics::counter!(HOLDS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn place_hold(&self, req: HoldRequest) -> Result<Hold, EngineError> {
        let span = validate_span(req.start, req.end)?;
        if req.quantity == 0 {
            return Err(BadRequest::NonPositiveQuantity.into());
        }
        if let Some(customer_id) = &req.customer_id {
            validate_customer_id(customer_id)?;
        }
        let (key, total) = self.resolve_item(&req.tenant, req.item_id).await?;
        let ttl = self.config.clamp_ttl(req.ttl);

        // Check and insert under the ledger's exclusive lock.
        let mut guards = self.store.lock_items([key.clone()]).await;
        let now = self.now();
        let used = {
            let Some(ledger) = guards.get(&key) else {
                return Err(EngineError::NotFound(req.item_id));
            };
            if ledger.live_len(now) >= MAX_ALLOCATIONS_PER_ITEM {
                return Err(EngineError::LimitExceeded("too many allocations on item"));
            }
            committed_and_held(ledger, &span, now, &[])
        };
        if used.saturating_add(req.quantity) > total {
            debug!(%key, used, total, requested = req.quantity, "hold rejected");
            return Err(EngineError::Conflict {
                item_id: req.item_id,
                available: total.saturating_sub(used),
            });
        }

        let hold = Hold {
            id: Ulid::new(),
            tenant_id: key.tenant_id.clone(),
            item_id: req.item_id,
            quantity: req.quantity,
            span,
            created_at: now,
            expires_at: now.saturating_add(ttl.as_millis() as Ms),
            customer_id: req.customer_id,
            session_id: req.session_id,
        };
        self.store
            .persist_and_apply(&mut guards, &Event::HoldPlaced { hold: hold.clone() })
            .await?;
        debug!(hold = %hold.id, %key, quantity = hold.quantity, expires_at = hold.expires_at, "hold placed");
        Ok(hold)
    }

    /// Hard-delete a hold whether or not it has expired. A tenant context
    /// only sees its own holds.
    pub async fn release_hold(&self, tenant: &TenantContext, id: Ulid) -> Result<ReleaseOutcome, EngineError> {
        let Some(hold) = self.get_hold(tenant, id) else {
            return Ok(ReleaseOutcome::NotFound);
        };
        let key = hold.key();
        let mut guards = self.store.lock_items([key.clone()]).await;
        // A concurrent release or booking may have removed it meanwhile.
        let Some(hold) = self.store.hold(&id) else {
            return Ok(ReleaseOutcome::NotFound);
        };
        self.store
            .persist_and_apply(&mut guards, &Event::HoldReleased { id, key })
            .await?;
        metrics::counter!(HOLDS_REMOVED_TOTAL, "reason" => "released").increment(1);
        debug!(hold = %id, "hold released");
        Ok(ReleaseOutcome::Released(hold))
    }

    pub fn get_hold(&self, tenant: &TenantContext, id: Ulid) -> Option<Hold> {
        let hold = self.store.hold(&id);
        match tenant {
            TenantContext::Tenant(t) => scoped(hold, t),
            TenantContext::Public => hold,
        }
    }

    /// Delete holds that expired at least `grace` ago. Storage hygiene only:
    /// expired holds already stopped counting the moment they expired.
    pub async fn sweep_expired_holds(&self, grace: Duration) -> Result<usize, EngineError> {
        let cutoff = self.now().saturating_sub(grace.as_millis() as Ms);
        let mut swept = 0;
        for hold in self.store.holds_expired_by(cutoff) {
            let key = hold.key();
            let mut guards = self.store.lock_items([key.clone()]).await;
            if self.store.hold(&hold.id).is_none() {
                continue;
            }
            self.store
                .persist_and_apply(&mut guards, &Event::HoldReleased { id: hold.id, key })
                .await?;
            swept += 1;
        }
        if swept > 0 {
            metrics::counter!(HOLDS_REMOVED_TOTAL, "reason" => "swept").increment(swept as u64);
            info!(swept, "expired holds swept");
        }
        Ok(swept)
    }
}
