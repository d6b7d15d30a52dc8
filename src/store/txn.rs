use std::collections::BTreeMap;

use tracing::debug;
use ulid::Ulid;

use crate::limits::MAX_ALLOCATIONS_PER_ITEM;
use crate::model::{Booking, Event};
use crate::tenant::ItemKey;

use super::{ItemLedger, Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    /// Reads see the latest committed state and are never re-validated. Two
    /// transactions may both read "capacity available" and both commit
    /// (write skew). Not used by the engine.
    ReadCommitted,
    /// Every ledger read is re-validated at commit. A ledger that changed
    /// since it was read fails the commit with `SerializationFailure`, unless
    /// the read registered a `recheck` that still holds under the commit's
    /// exclusive lock.
    Serializable,
}

/// Predicate a read was made for, re-evaluated against the locked ledger.
type Recheck<'s> = Box<dyn Fn(&ItemLedger) -> bool + Send + Sync + 's>;

/// A booking-insert transaction.
///
/// Reads record the version of each ledger they see; writes are staged and
/// nothing is visible to others until `commit`. Dropping the transaction
/// without committing is a rollback.
pub struct Transaction<'s> {
    store: &'s Store,
    isolation: Isolation,
    reads: BTreeMap<ItemKey, u64>,
    rechecks: BTreeMap<ItemKey, Recheck<'s>>,
    staged: Option<(Booking, Vec<Ulid>)>,
}

impl<'s> Transaction<'s> {
    pub(super) fn new(store: &'s Store, isolation: Isolation) -> Self {
        Self {
            store,
            isolation,
            reads: BTreeMap::new(),
            rechecks: BTreeMap::new(),
            staged: None,
        }
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    /// Read one ledger inside the transaction. The first version seen for a
    /// key is the one validated at commit.
    pub async fn read<T>(&mut self, key: &ItemKey, f: impl FnOnce(&ItemLedger) -> T) -> T {
        let ledger = self.store.ledger(key);
        let guard = ledger.read().await;
        self.reads.entry(key.clone()).or_insert(guard.version());
        f(&guard)
    }

    /// Register what the read of `key` established. If that ledger changes
    /// before commit, the commit re-runs `check` against it under the
    /// exclusive lock and only fails when the check no longer passes.
    pub fn recheck(&mut self, key: &ItemKey, check: impl Fn(&ItemLedger) -> bool + Send + Sync + 's) {
        self.rechecks.insert(key.clone(), Box::new(check));
    }

    /// Stage a booking insert (all lines), the registration of its
    /// idempotency key and the deletion of the holds it supersedes.
    pub fn insert_booking(&mut self, booking: Booking, consumed_holds: Vec<Ulid>) {
        self.staged = Some((booking, consumed_holds));
    }

    /// Validate and apply. Returns the committed booking, or `None` for a
    /// transaction that staged nothing.
    pub async fn commit(self) -> Result<Option<Booking>, StoreError> {
        let Some((booking, consumed_holds)) = self.staged else {
            return Ok(None);
        };
        let store = self.store;

        let mut keys: Vec<ItemKey> = self.reads.keys().cloned().collect();
        keys.extend(booking.item_keys());
        keys.extend(
            consumed_holds
                .iter()
                .filter_map(|id| store.hold(id).map(|h| h.key())),
        );
        let mut guards = store.lock_items(keys).await;

        if self.isolation == Isolation::Serializable {
            for (key, seen) in &self.reads {
                let Some(guard) = guards.get(key) else {
                    return Err(StoreError::SerializationFailure { key: key.clone() });
                };
                let current = guard.version();
                if current == *seen {
                    continue;
                }
                let still_holds = self.rechecks.get(key).is_some_and(|check| check(&**guard));
                if !still_holds {
                    debug!(%key, seen, current, "serialization failure");
                    return Err(StoreError::SerializationFailure { key: key.clone() });
                }
                debug!(%key, seen, current, "ledger changed, read still valid");
            }
        }

        for key in booking.item_keys() {
            if guards
                .get(&key)
                .is_some_and(|g| g.live_len(booking.created_at) >= MAX_ALLOCATIONS_PER_ITEM)
            {
                return Err(StoreError::LedgerFull(key));
            }
        }

        if let Some(idem) = &booking.idempotency_key {
            store
                .idempotency
                .claim(&booking.tenant_id, idem, booking.id)
                .map_err(|existing| StoreError::UniqueViolation {
                    tenant_id: booking.tenant_id.clone(),
                    existing,
                })?;
        }

        let committed = booking.clone();
        let event = Event::BookingCommitted {
            booking,
            consumed_holds,
        };
        if let Err(e) = store.persist_and_apply(&mut guards, &event).await {
            if let Some(idem) = &committed.idempotency_key {
                store
                    .idempotency
                    .unclaim(&committed.tenant_id, idem, committed.id);
            }
            return Err(e);
        }
        Ok(Some(committed))
    }
}
