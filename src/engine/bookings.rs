use std::collections::HashSet;
use std::time::Instant;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::MAX_LINES_PER_BOOKING;
use crate::model::*;
use crate::notify::BookingNotice;
use crate::observability::{
    BOOKINGS_CANCELLED_TOTAL, BOOKINGS_TOTAL, BOOKING_COMMIT_ATTEMPTS, HOLDS_REMOVED_TOTAL,
    SERIALIZATION_FAILURES_TOTAL,
};
use crate::store::{Isolation, StoreError};
use crate::tenant::{scoped, ItemKey, TenantId};

use super::idempotency::validate_key;
use super::overlap::committed_and_held;
use super::{validate_customer_id, validate_span, BadRequest, Engine, EngineError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRequest {
    pub item_id: Ulid,
    pub quantity: Quantity,
    pub unit_price: Option<i64>,
}

impl LineRequest {
    pub fn new(item_id: Ulid, quantity: Quantity) -> Self {
        Self {
            item_id,
            quantity,
            unit_price: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub tenant_id: TenantId,
    pub customer_id: String,
    pub lines: Vec<LineRequest>,
    pub start: Ms,
    pub end: Ms,
    pub idempotency_key: Option<String>,
    /// Holds this booking supersedes. They stop counting against it and are
    /// deleted in the same commit.
    pub consume_holds: Vec<Ulid>,
}

impl BookingRequest {
    pub fn new(tenant_id: TenantId, customer_id: impl Into<String>, lines: Vec<LineRequest>, start: Ms, end: Ms) -> Self {
        Self {
            tenant_id,
            customer_id: customer_id.into(),
            lines,
            start,
            end,
            idempotency_key: None,
            consume_holds: Vec::new(),
        }
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn consume_hold(mut self, hold_id: Ulid) -> Self {
        self.consume_holds.push(hold_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingReceipt {
    pub booking: Booking,
    /// True when an earlier booking with the same idempotency key was returned.
    pub replayed: bool,
}

impl Engine {
    /// Commit a multi-line booking atomically, re-checking every line inside
    /// a serializable transaction. Serialization failures are retried with
    /// backoff; once attempts or the deadline run out the caller gets
    /// `TransientStoreConflict`, never `Conflict`.
    pub async fn create_booking(&self, req: BookingRequest) -> Result<BookingReceipt, EngineError> {
        let result = self.commit_booking(&req).await;
        let outcome = match &result {
            Ok(r) if r.replayed => "replayed",
            Ok(_) => "committed",
            Err(e) => e.kind().label(),
        };
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn commit_booking(&self, req: &BookingRequest) -> Result<BookingReceipt, EngineError> {
        let span = validate_booking(req)?;
        let tenant_id = &req.tenant_id;

        if let Some(key) = &req.idempotency_key
            && let Some(booking) = self.lookup_idempotent(tenant_id, key)
        {
            debug!(booking = %booking.id, "idempotent replay");
            return Ok(BookingReceipt {
                booking,
                replayed: true,
            });
        }

        let mut totals = Vec::with_capacity(req.lines.len());
        for line in &req.lines {
            totals.push(self.total_quantity(tenant_id, line.item_id).await?);
        }
        let consumed = self.resolve_consumed_holds(req)?;

        let started = Instant::now();
        let max_attempts = self.config.booking_max_retries.saturating_add(1);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match self.attempt_booking(req, span, &totals, &consumed).await {
                Ok(booking) => {
                    metrics::histogram!(BOOKING_COMMIT_ATTEMPTS).record(attempt as f64);
                    if !consumed.is_empty() {
                        metrics::counter!(HOLDS_REMOVED_TOTAL, "reason" => "consumed")
                            .increment(consumed.len() as u64);
                    }
                    info!(booking = %booking.id, tenant = %booking.tenant_id, lines = booking.lines.len(), attempt, "booking committed");
                    self.notify.publish(BookingNotice::committed(&booking));
                    return Ok(BookingReceipt {
                        booking,
                        replayed: false,
                    });
                }
                Err(EngineError::Store(StoreError::UniqueViolation { existing, .. })) => {
                    match self.store.booking(&existing) {
                        Some(booking) => {
                            debug!(booking = %booking.id, "lost idempotency race, replaying winner");
                            return Ok(BookingReceipt {
                                booking,
                                replayed: true,
                            });
                        }
                        // Winner claimed the key but has not applied yet.
                        None => StoreError::UniqueViolation {
                            tenant_id: tenant_id.clone(),
                            existing,
                        },
                    }
                }
                Err(EngineError::Store(e @ StoreError::SerializationFailure { .. })) => {
                    metrics::counter!(SERIALIZATION_FAILURES_TOTAL).increment(1);
                    e
                }
                Err(e) => return Err(e),
            };

            if attempt >= max_attempts || started.elapsed() >= self.config.booking_deadline {
                metrics::histogram!(BOOKING_COMMIT_ATTEMPTS).record(attempt as f64);
                warn!(tenant = %tenant_id, attempt, "booking gave up: {err}");
                return Err(EngineError::TransientStoreConflict { attempts: attempt });
            }
            let backoff = self
                .config
                .retry_backoff
                .saturating_mul(1u32 << (attempt - 1).min(16));
            debug!(attempt, ?backoff, "retrying booking: {err}");
            tokio::time::sleep(backoff).await;
        }
    }

    /// One serializable attempt: read every line's ledger, check, stage, commit.
    async fn attempt_booking(
        &self,
        req: &BookingRequest,
        span: Span,
        totals: &[Quantity],
        consumed: &[Ulid],
    ) -> Result<Booking, EngineError> {
        let now = self.now();
        let mut txn = self.store.begin(Isolation::Serializable);
        for (line, &total) in req.lines.iter().zip(totals) {
            let key = ItemKey::new(req.tenant_id.clone(), line.item_id);
            let used = txn
                .read(&key, |ledger| committed_and_held(ledger, &span, now, consumed))
                .await;
            if used.saturating_add(line.quantity) > total {
                debug!(%key, used, total, requested = line.quantity, "booking rejected");
                return Err(EngineError::Conflict {
                    item_id: line.item_id,
                    available: total.saturating_sub(used),
                });
            }
            // Bookings on other windows or items bump the version too; only
            // fail the commit if this line no longer fits.
            let quantity = line.quantity;
            let exclude = consumed.to_vec();
            txn.recheck(&key, move |ledger| {
                committed_and_held(ledger, &span, now, &exclude).saturating_add(quantity) <= total
            });
        }

        let booking = Booking {
            id: Ulid::new(),
            tenant_id: req.tenant_id.clone(),
            customer_id: req.customer_id.clone(),
            span,
            status: BookingStatus::Confirmed,
            idempotency_key: req.idempotency_key.clone(),
            created_at: now,
            lines: req
                .lines
                .iter()
                .map(|l| BookingLine {
                    item_id: l.item_id,
                    quantity: l.quantity,
                    unit_price_snapshot: l.unit_price,
                })
                .collect(),
        };
        txn.insert_booking(booking.clone(), consumed.to_vec());
        txn.commit().await?;
        Ok(booking)
    }

    /// Holds named by the request that still exist and are active. Each must
    /// belong to the booking's tenant and sit on one of its items.
    fn resolve_consumed_holds(&self, req: &BookingRequest) -> Result<Vec<Ulid>, EngineError> {
        let now = self.now();
        let mut seen = HashSet::new();
        let mut consumed = Vec::new();
        for &id in &req.consume_holds {
            if !seen.insert(id) {
                continue;
            }
            let Some(hold) = self.store.hold(&id) else {
                debug!(hold = %id, "named hold already gone");
                continue;
            };
            if hold.tenant_id != req.tenant_id {
                return Err(BadRequest::TenantMismatch(id).into());
            }
            if !req.lines.iter().any(|l| l.item_id == hold.item_id) {
                return Err(BadRequest::HoldNotOnBookedItem(id).into());
            }
            if hold.is_active(now) {
                consumed.push(id);
            }
        }
        Ok(consumed)
    }

    /// Confirmed → Cancelled, giving the capacity back. Cancelling twice
    /// returns the cancelled booking unchanged.
    pub async fn cancel_booking(&self, tenant_id: &TenantId, id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.get_booking(tenant_id, id).ok_or(EngineError::NotFound(id))?;
        if !booking.is_confirmed() {
            return Ok(booking);
        }
        let mut guards = self.store.lock_items(booking.item_keys()).await;
        let mut booking = self.store.booking(&id).ok_or(EngineError::NotFound(id))?;
        if !booking.is_confirmed() {
            return Ok(booking);
        }

        let cancelled_at = self.now();
        let event = Event::BookingCancelled {
            id,
            tenant_id: tenant_id.clone(),
            cancelled_at,
        };
        self.store.persist_and_apply(&mut guards, &event).await?;
        drop(guards);

        booking.status = BookingStatus::Cancelled { cancelled_at };
        metrics::counter!(BOOKINGS_CANCELLED_TOTAL).increment(1);
        info!(booking = %id, tenant = %tenant_id, "booking cancelled");
        self.notify.publish(BookingNotice::cancelled(&booking));
        Ok(booking)
    }

    /// A booking of `tenant_id`. Other tenants' bookings read as absent.
    pub fn get_booking(&self, tenant_id: &TenantId, id: Ulid) -> Option<Booking> {
        scoped(self.store.booking(&id), tenant_id)
    }
}

fn validate_booking(req: &BookingRequest) -> Result<Span, EngineError> {
    let span = validate_span(req.start, req.end)?;
    validate_customer_id(&req.customer_id)?;
    if let Some(key) = &req.idempotency_key {
        validate_key(key)?;
    }
    if req.lines.is_empty() {
        return Err(BadRequest::NoLines.into());
    }
    if req.lines.len() > MAX_LINES_PER_BOOKING {
        return Err(EngineError::LimitExceeded("too many lines"));
    }
    let mut items = HashSet::with_capacity(req.lines.len());
    for line in &req.lines {
        if line.quantity == 0 {
            return Err(BadRequest::NonPositiveQuantity.into());
        }
        if !items.insert(line.item_id) {
            return Err(BadRequest::DuplicateItem(line.item_id).into());
        }
    }
    Ok(span)
}
