use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::limits::MAX_TENANT_NAME_LEN;
use crate::model::{Booking, Hold};

/// Database name that selects the anonymous, cross-tenant storefront context.
pub const PUBLIC_CONTEXT: &str = "public";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TenantError {
    #[error("empty tenant name")]
    Empty,
    #[error("tenant name too long")]
    TooLong,
    #[error("invalid character {0:?} in tenant name")]
    InvalidChar(char),
    #[error("operation requires a tenant context")]
    Required,
}

/// Validated tenant identifier: `[A-Za-z0-9_-]{1,MAX_TENANT_NAME_LEN}`.
///
/// Names are rejected rather than sanitized so two distinct inputs can never
/// collapse onto the same tenant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(name: &str) -> Result<Self, TenantError> {
        if name.is_empty() {
            return Err(TenantError::Empty);
        }
        if name.len() > MAX_TENANT_NAME_LEN {
            return Err(TenantError::TooLong);
        }
        if let Some(bad) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        {
            return Err(TenantError::InvalidChar(bad));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of one per-item ledger. Tenants that reuse an item id never share a key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    pub tenant_id: TenantId,
    pub item_id: Ulid,
}

impl ItemKey {
    pub fn new(tenant_id: TenantId, item_id: Ulid) -> Self {
        Self { tenant_id, item_id }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.item_id)
    }
}

/// Who is asking. Bookings always need `Tenant`; holds and availability
/// lookups may come from the anonymous storefront (`Public`) and then take
/// their tenant from the item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantContext {
    Tenant(TenantId),
    Public,
}

impl TenantContext {
    /// Map a connection's database name to a context.
    pub fn from_database(db: &str) -> Result<Self, TenantError> {
        if db.eq_ignore_ascii_case(PUBLIC_CONTEXT) {
            Ok(TenantContext::Public)
        } else {
            TenantId::new(db).map(TenantContext::Tenant)
        }
    }

    pub fn require_tenant(&self) -> Result<&TenantId, TenantError> {
        match self {
            TenantContext::Tenant(t) => Ok(t),
            TenantContext::Public => Err(TenantError::Required),
        }
    }

    pub fn tenant(&self) -> Option<&TenantId> {
        match self {
            TenantContext::Tenant(t) => Some(t),
            TenantContext::Public => None,
        }
    }
}

impl From<TenantId> for TenantContext {
    fn from(t: TenantId) -> Self {
        TenantContext::Tenant(t)
    }
}

/// Records that belong to exactly one tenant.
pub trait TenantOwned {
    fn tenant_id(&self) -> &TenantId;
}

impl TenantOwned for Booking {
    fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }
}

impl TenantOwned for Hold {
    fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }
}

/// Tenant guard for reads: a record owned by another tenant is
/// indistinguishable from a missing one.
pub fn scoped<T: TenantOwned>(record: Option<T>, caller: &TenantId) -> Option<T> {
    record.filter(|r| r.tenant_id() == caller)
}
