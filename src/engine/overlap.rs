use ulid::Ulid;

use crate::model::*;
use crate::store::ItemLedger;
use crate::tenant::{ItemKey, TenantContext};

use super::{validate_span, Engine, EngineError};

/// Units of the ledger's item taken during `window` at `now`: confirmed lines
/// plus holds with `expires_at > now`, skipping the allocations in `exclude`.
///
/// Pure; the same sum backs the advisory lookups and the check inside the
/// serializable booking transaction.
pub fn committed_and_held(ledger: &ItemLedger, window: &Span, now: Ms, exclude: &[Ulid]) -> Quantity {
    ledger
        .overlapping(window)
        .filter(|a| a.counts_at(now) && !exclude.contains(&a.id))
        .fold(0, |sum: Quantity, a| sum.saturating_add(a.quantity))
}

/// Advisory availability of one item over one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Availability {
    pub total_quantity: Quantity,
    pub committed_and_held: Quantity,
    pub available: Quantity,
}

impl Engine {
    /// Optimistic pre-check outside any transaction. Never the basis of a commit.
    pub async fn committed_and_held(
        &self,
        key: &ItemKey,
        start: Ms,
        end: Ms,
    ) -> Result<Quantity, EngineError> {
        let span = validate_span(start, end)?;
        let now = self.now();
        Ok(self
            .store
            .read_ledger(key, |l| committed_and_held(l, &span, now, &[]))
            .await)
    }

    /// `total - committed_and_held` for one window. Public callers get the
    /// item's owning tenant resolved like for holds.
    pub async fn availability(
        &self,
        tenant: &TenantContext,
        item_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Availability, EngineError> {
        let (key, total_quantity) = self.resolve_item(tenant, item_id).await?;
        let used = self.committed_and_held(&key, start, end).await?;
        Ok(Availability {
            total_quantity,
            committed_and_held: used,
            available: total_quantity.saturating_sub(used),
        })
    }
}
