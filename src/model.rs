use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::tenant::{ItemKey, TenantId};

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Units of an item. Totals, line quantities and hold quantities all use it.
pub type Quantity = u32;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Build a span from caller input; `None` unless `start < end`.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// The one overlap rule used everywhere: `s1 < e2 && s2 < e1`.
    /// Adjacent spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// An item as the inventory store knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub tenant_id: TenantId,
    pub item_id: Ulid,
    pub total_quantity: Quantity,
}

/// One item-and-quantity entry of a booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingLine {
    pub item_id: Ulid,
    pub quantity: Quantity,
    /// Price per unit in minor currency units, as the caller quoted it.
    pub unit_price_snapshot: Option<i64>,
}

/// Closed lifecycle of a booking. `Cancelled` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Cancelled { cancelled_at: Ms },
}

impl BookingStatus {
    pub fn label(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled { .. } => "cancelled",
        }
    }
}

/// A confirmed reservation of one or more items over one span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub tenant_id: TenantId,
    pub customer_id: String,
    pub span: Span,
    pub status: BookingStatus,
    pub idempotency_key: Option<String>,
    pub created_at: Ms,
    pub lines: Vec<BookingLine>,
}

impl Booking {
    pub fn is_confirmed(&self) -> bool {
        matches!(self.status, BookingStatus::Confirmed)
    }

    /// Ledger keys touched by this booking, one per line.
    pub fn item_keys(&self) -> impl Iterator<Item = ItemKey> + '_ {
        self.lines
            .iter()
            .map(|line| ItemKey::new(self.tenant_id.clone(), line.item_id))
    }
}

/// Time-limited provisional reservation held during checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub id: Ulid,
    pub tenant_id: TenantId,
    pub item_id: Ulid,
    pub quantity: Quantity,
    pub span: Span,
    pub created_at: Ms,
    pub expires_at: Ms,
    pub customer_id: Option<String>,
    pub session_id: Option<String>,
}

impl Hold {
    pub fn is_active(&self, now: Ms) -> bool {
        self.expires_at > now
    }

    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.tenant_id.clone(), self.item_id)
    }
}

/// The persisted record types: flat, no nesting. This is the WAL record format.
/// Every committing write is exactly one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    HoldPlaced {
        hold: Hold,
    },
    HoldReleased {
        id: Ulid,
        key: ItemKey,
    },
    /// A booking with all its lines, the holds it superseded and (inside the
    /// booking) its idempotency key.
    BookingCommitted {
        booking: Booking,
        consumed_holds: Vec<Ulid>,
    },
    BookingCancelled {
        id: Ulid,
        tenant_id: TenantId,
        cancelled_at: Ms,
    },
}
