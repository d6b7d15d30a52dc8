mod idempotency;
mod ledger;
mod txn;

pub use idempotency::IdempotencyIndex;
pub use ledger::{Allocation, AllocationKind, ItemLedger};
pub use txn::{Isolation, Transaction};

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::tenant::{ItemKey, TenantId};
use crate::wal::Wal;

pub type SharedLedger = Arc<RwLock<ItemLedger>>;

/// Exclusive locks on a set of ledgers, acquired in key order.
pub type LedgerGuards = BTreeMap<ItemKey, OwnedRwLockWriteGuard<ItemLedger>>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A ledger read by a serializable transaction changed before it committed.
    #[error("could not serialize access due to concurrent update of {key}")]
    SerializationFailure { key: ItemKey },
    /// `(tenant_id, idempotency_key)` already belongs to another booking.
    #[error("idempotency key already used by booking {existing} in tenant {tenant_id}")]
    UniqueViolation { tenant_id: TenantId, existing: Ulid },
    #[error("too many allocations on {0}")]
    LedgerFull(ItemKey),
    #[error("WAL error: {0}")]
    Wal(String),
}

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Each wakeup drains every append already queued and makes
/// them durable with a single fsync before answering any of them.
async fn run_wal_writer(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        flush_and_respond(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
    debug!("WAL writer stopped");
}

fn flush_and_respond(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes don't leak
    // into the next batch; every caller in this batch is told it failed.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Durable, in-process relational store behind the engine.
///
/// Tables: per-item ledgers (booking lines + holds), a hold index, a booking
/// index and the idempotency unique index. Every committing write is one
/// WAL event, appended while the affected ledgers are exclusively locked and
/// applied right after, so WAL order matches apply order per item.
pub struct Store {
    ledgers: DashMap<ItemKey, SharedLedger>,
    holds: DashMap<Ulid, Hold>,
    bookings: DashMap<Ulid, Booking>,
    idempotency: IdempotencyIndex,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Writers share it; compaction takes it exclusively so its snapshot
    /// cannot miss a write that is already in the WAL but not yet applied.
    commit_gate: RwLock<()>,
}

impl Store {
    /// Replay the WAL at `path`, rewrite it without any torn tail and start
    /// the background writer. Must run inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let events = Wal::replay(path)?;
        let mut wal = Wal::open(path)?;
        Wal::write_compact_file(path, &events)?;
        wal.swap_compact_file()?;

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(run_wal_writer(wal, wal_rx));

        let store = Self {
            ledgers: DashMap::new(),
            holds: DashMap::new(),
            bookings: DashMap::new(),
            idempotency: IdempotencyIndex::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
        };

        // Sole owner of every ledger here, so try_write never contends. Never
        // use blocking_write: this may run inside an async context.
        for event in &events {
            let keys: BTreeSet<ItemKey> = store.event_keys(event).into_iter().collect();
            let mut guards = LedgerGuards::new();
            for key in keys {
                let ledger = store.ledger(&key);
                let guard = ledger
                    .try_write_owned()
                    .expect("replay: uncontended write");
                guards.insert(key, guard);
            }
            store.apply(&mut guards, event);
        }

        info!(
            path = %path.display(),
            events = events.len(),
            bookings = store.bookings.len(),
            holds = store.holds.len(),
            "store opened"
        );
        Ok(store)
    }

    /// Get or create the ledger for `key`.
    pub fn ledger(&self, key: &ItemKey) -> SharedLedger {
        if let Some(l) = self.ledgers.get(key) {
            return l.value().clone();
        }
        self.ledgers
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(ItemLedger::new(key.clone()))))
            .value()
            .clone()
    }

    /// Run `f` against a consistent snapshot of one ledger, outside any
    /// transaction. Only for advisory reads.
    pub async fn read_ledger<T>(&self, key: &ItemKey, f: impl FnOnce(&ItemLedger) -> T) -> T {
        let ledger = self.ledger(key);
        let guard = ledger.read().await;
        f(&guard)
    }

    pub fn begin(&self, isolation: Isolation) -> Transaction<'_> {
        Transaction::new(self, isolation)
    }

    /// Exclusively lock the ledgers for `keys` in sorted order (deadlock-free).
    pub async fn lock_items(&self, keys: impl IntoIterator<Item = ItemKey>) -> LedgerGuards {
        let sorted: BTreeSet<ItemKey> = keys.into_iter().collect();
        let mut guards = LedgerGuards::new();
        for key in sorted {
            let guard = self.ledger(&key).write_owned().await;
            guards.insert(key, guard);
        }
        guards
    }

    /// WAL-append then apply. The caller must hold guards for every ledger
    /// the event touches.
    pub async fn persist_and_apply(
        &self,
        guards: &mut LedgerGuards,
        event: &Event,
    ) -> Result<(), StoreError> {
        let _gate = self.commit_gate.read().await;
        self.wal_append(event).await?;
        self.apply(guards, event);
        Ok(())
    }

    // ── Indexes ──────────────────────────────────────────────

    pub fn hold(&self, id: &Ulid) -> Option<Hold> {
        self.holds.get(id).map(|e| e.value().clone())
    }

    pub fn booking(&self, id: &Ulid) -> Option<Booking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    pub fn idempotency(&self) -> &IdempotencyIndex {
        &self.idempotency
    }

    /// Holds whose expiry is at or before `cutoff`.
    pub fn holds_expired_by(&self, cutoff: Ms) -> Vec<Hold> {
        self.holds
            .iter()
            .filter(|e| e.value().expires_at <= cutoff)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn hold_count(&self) -> usize {
        self.holds.len()
    }

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }

    // ── Apply ────────────────────────────────────────────────

    /// Ledgers an event touches.
    fn event_keys(&self, event: &Event) -> Vec<ItemKey> {
        match event {
            Event::HoldPlaced { hold } => vec![hold.key()],
            Event::HoldReleased { key, .. } => vec![key.clone()],
            Event::BookingCommitted {
                booking,
                consumed_holds,
            } => {
                let mut keys: Vec<ItemKey> = booking.item_keys().collect();
                keys.extend(consumed_holds.iter().filter_map(|id| self.hold(id).map(|h| h.key())));
                keys
            }
            Event::BookingCancelled { id, .. } => self
                .booking(id)
                .map(|b| b.item_keys().collect())
                .unwrap_or_default(),
        }
    }

    /// Apply a persisted event to the indexes and locked ledgers. Applying an
    /// event that no longer matches state (e.g. releasing a gone hold) is a
    /// no-op, which keeps replay of a compacted log safe.
    fn apply(&self, guards: &mut LedgerGuards, event: &Event) {
        match event {
            Event::HoldPlaced { hold } => {
                if let Some(ledger) = guards.get_mut(&hold.key()) {
                    ledger.insert(Allocation::hold(hold));
                    ledger.bump();
                }
                self.holds.insert(hold.id, hold.clone());
            }
            Event::HoldReleased { id, key } => {
                if let Some(ledger) = guards.get_mut(key)
                    && ledger.remove(*id).is_some()
                {
                    ledger.bump();
                }
                self.holds.remove(id);
            }
            Event::BookingCommitted {
                booking,
                consumed_holds,
            } => {
                for hold_id in consumed_holds {
                    if let Some((_, hold)) = self.holds.remove(hold_id)
                        && let Some(ledger) = guards.get_mut(&hold.key())
                    {
                        ledger.remove(*hold_id);
                        ledger.bump();
                    }
                }
                for line in &booking.lines {
                    let key = ItemKey::new(booking.tenant_id.clone(), line.item_id);
                    if let Some(ledger) = guards.get_mut(&key) {
                        if booking.is_confirmed() {
                            ledger.insert(Allocation::line(booking.id, booking.span, line.quantity));
                        }
                        ledger.bump();
                    }
                }
                if let Some(key) = &booking.idempotency_key {
                    let _ = self.idempotency.claim(&booking.tenant_id, key, booking.id);
                }
                self.bookings.insert(booking.id, booking.clone());
            }
            Event::BookingCancelled {
                id, cancelled_at, ..
            } => {
                let Some(mut booking) = self.booking(id) else {
                    return;
                };
                if !booking.is_confirmed() {
                    return;
                }
                for key in booking.item_keys() {
                    if let Some(ledger) = guards.get_mut(&key) {
                        ledger.remove(*id);
                        ledger.bump();
                    }
                }
                booking.status = BookingStatus::Cancelled {
                    cancelled_at: *cancelled_at,
                };
                self.bookings.insert(*id, booking);
            }
        }
    }

    // ── WAL ──────────────────────────────────────────────────

    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    /// Rewrite the WAL as the minimal event list that recreates current state:
    /// every booking (with its current status) and every hold still indexed.
    pub async fn compact_wal(&self) -> Result<usize, StoreError> {
        let _gate = self.commit_gate.write().await;

        let mut bookings: Vec<Booking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        bookings.sort_by_key(|b| b.id);
        let mut holds: Vec<Hold> = self.holds.iter().map(|e| e.value().clone()).collect();
        holds.sort_by_key(|h| h.id);

        let mut events: Vec<Event> = bookings
            .into_iter()
            .map(|booking| Event::BookingCommitted {
                booking,
                consumed_holds: Vec::new(),
            })
            .collect();
        events.extend(holds.into_iter().map(|hold| Event::HoldPlaced { hold }));
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))?;
        Ok(count)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
