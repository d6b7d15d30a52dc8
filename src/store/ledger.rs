use ulid::Ulid;

use crate::limits::MAX_SPAN_DURATION_MS;
use crate::model::*;
use crate::tenant::ItemKey;

/// What a ledger row represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationKind {
    /// A line of a confirmed booking. The allocation id is the booking id.
    Line,
    /// A hold; only counts while `expires_at > now`.
    Hold { expires_at: Ms },
}

/// One row of an item ledger: units of the item taken over a span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub id: Ulid,
    pub span: Span,
    pub quantity: Quantity,
    pub kind: AllocationKind,
}

impl Allocation {
    pub fn line(booking_id: Ulid, span: Span, quantity: Quantity) -> Self {
        Self {
            id: booking_id,
            span,
            quantity,
            kind: AllocationKind::Line,
        }
    }

    pub fn hold(hold: &Hold) -> Self {
        Self {
            id: hold.id,
            span: hold.span,
            quantity: hold.quantity,
            kind: AllocationKind::Hold {
                expires_at: hold.expires_at,
            },
        }
    }

    /// Whether this row takes capacity at `now`. Expiry is lazy: an expired
    /// hold stays in the ledger until released or swept, it just stops counting.
    pub fn counts_at(&self, now: Ms) -> bool {
        match self.kind {
            AllocationKind::Line => true,
            AllocationKind::Hold { expires_at } => expires_at > now,
        }
    }

    pub fn is_hold(&self) -> bool {
        matches!(self.kind, AllocationKind::Hold { .. })
    }
}

/// All live allocations of one `(tenant, item)`, sorted by `span.start`.
///
/// `version` increases on every committed write to the ledger; serializable
/// transactions compare it at commit time against the version they read.
#[derive(Debug, Clone)]
pub struct ItemLedger {
    pub key: ItemKey,
    version: u64,
    allocations: Vec<Allocation>,
}

impl ItemLedger {
    pub fn new(key: ItemKey) -> Self {
        Self {
            key,
            version: 0,
            allocations: Vec::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn bump(&mut self) {
        self.version += 1;
    }

    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// Allocations still taking or about to take capacity at `now`: active
    /// holds and lines that have not ended. Finished lines stay for history
    /// but are not counted.
    pub fn live_len(&self, now: Ms) -> usize {
        self.allocations[self.first_possibly_ending_after(now)..]
            .iter()
            .filter(|a| a.span.end > now && a.counts_at(now))
            .count()
    }

    pub fn allocations(&self) -> &[Allocation] {
        &self.allocations
    }

    pub fn get(&self, id: Ulid) -> Option<&Allocation> {
        self.allocations.iter().find(|a| a.id == id)
    }

    /// Insert maintaining sort order by span.start.
    pub(crate) fn insert(&mut self, allocation: Allocation) {
        let pos = self
            .allocations
            .binary_search_by_key(&allocation.span.start, |a| a.span.start)
            .unwrap_or_else(|e| e);
        self.allocations.insert(pos, allocation);
    }

    pub(crate) fn remove(&mut self, id: Ulid) -> Option<Allocation> {
        let pos = self.allocations.iter().position(|a| a.id == id)?;
        Some(self.allocations.remove(pos))
    }

    /// Allocations whose span overlaps `window` under `Span::overlaps`.
    /// Binary search skips everything starting at or after `window.end`, and
    /// everything that started too long before `window.start` to reach it.
    pub fn overlapping<'a>(&'a self, window: &'a Span) -> impl Iterator<Item = &'a Allocation> + 'a {
        let left_bound = self.first_possibly_ending_after(window.start);
        let right_bound = self
            .allocations
            .partition_point(|a| a.span.start < window.end);
        self.allocations[left_bound..right_bound.max(left_bound)]
            .iter()
            .filter(move |a| a.span.overlaps(window))
    }

    /// Index of the first allocation whose end may lie after `at`. Spans are
    /// at most `MAX_SPAN_DURATION_MS` long, so anything starting that far
    /// before `at` has already ended.
    fn first_possibly_ending_after(&self, at: Ms) -> usize {
        self.allocations
            .partition_point(|a| a.span.start.saturating_add(MAX_SPAN_DURATION_MS) <= at)
    }
}
