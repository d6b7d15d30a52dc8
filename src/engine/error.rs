use thiserror::Error;
use ulid::Ulid;

use crate::inventory::InventoryError;
use crate::model::Quantity;
use crate::store::StoreError;
use crate::tenant::TenantError;

/// Caller mistakes. Never retried, reported verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BadRequest {
    #[error("start must be before end")]
    EmptyInterval,
    #[error("quantity must be positive")]
    NonPositiveQuantity,
    #[error("item {0} appears on more than one line")]
    DuplicateItem(Ulid),
    #[error("booking has no lines")]
    NoLines,
    #[error("hold {0} belongs to another tenant")]
    TenantMismatch(Ulid),
    #[error("hold {0} is not on any booked item")]
    HoldNotOnBookedItem(Ulid),
    #[error("item {0} is owned by more than one tenant")]
    AmbiguousItem(Ulid),
    #[error("idempotency key must be 1..={max} bytes")]
    InvalidIdempotencyKey { max: usize },
    #[error("customer id must be 1..={max} bytes")]
    InvalidCustomerId { max: usize },
    #[error(transparent)]
    Tenant(#[from] TenantError),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("bad request: {0}")]
    BadRequest(#[from] BadRequest),
    #[error("insufficient availability for item {item_id}: {available} available")]
    Conflict { item_id: Ulid, available: Quantity },
    #[error("could not serialize booking after {attempts} attempts, retry later")]
    TransientStoreConflict { attempts: u32 },
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("item not found: {0}")]
    ItemNotFound(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::LedgerFull(_) => EngineError::LimitExceeded("too many allocations on item"),
            other => EngineError::Store(other),
        }
    }
}

impl From<TenantError> for EngineError {
    fn from(e: TenantError) -> Self {
        EngineError::BadRequest(BadRequest::Tenant(e))
    }
}

/// Coarse classification used for wire error codes and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Conflict,
    Transient,
    NotFound,
    Internal,
}

impl ErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Transient => "transient",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Internal => "error",
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::BadRequest(_) | EngineError::LimitExceeded(_) => ErrorKind::BadRequest,
            EngineError::Conflict { .. } => ErrorKind::Conflict,
            EngineError::TransientStoreConflict { .. } => ErrorKind::Transient,
            EngineError::NotFound(_) | EngineError::ItemNotFound(_) => ErrorKind::NotFound,
            EngineError::Store(_) | EngineError::Inventory(_) => ErrorKind::Internal,
        }
    }
}
