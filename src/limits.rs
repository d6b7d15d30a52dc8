use crate::model::Ms;

pub const MAX_TENANT_NAME_LEN: usize = 63;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// Longest rental or hold window: two years.
pub const MAX_SPAN_DURATION_MS: Ms = 2 * 366 * 24 * 3_600_000;

pub const MAX_LINES_PER_BOOKING: usize = 100;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;
pub const MAX_CUSTOMER_ID_LEN: usize = 255;

/// Live allocations a single item ledger may carry: active holds plus
/// confirmed lines that have not ended. Finished lines do not count.
pub const MAX_ALLOCATIONS_PER_ITEM: usize = 100_000;
