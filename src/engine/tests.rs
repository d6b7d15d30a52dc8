use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use super::*;
use crate::clock::ManualClock;
use crate::inventory::InMemoryInventory;
use crate::notify::{BookingNotice, BookingSink, SinkError};
use crate::store::StoreError;

const JAN_1_2025: Ms = 1_735_689_600_000;
const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms
const DAY: Ms = 24 * H;

/// Midnight of day `n` after the test clock's start.
fn day(n: i64) -> Ms {
    JAN_1_2025 + n * DAY
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("rental_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn tenant(name: &str) -> TenantId {
    TenantId::new(name).unwrap()
}

struct Harness {
    engine: Arc<Engine>,
    inventory: Arc<InMemoryInventory>,
    clock: Arc<ManualClock>,
    path: PathBuf,
}

impl Harness {
    fn new(name: &str) -> Self {
        Self::with(name, EngineConfig::default(), NotifyHub::new())
    }

    fn with(name: &str, config: EngineConfig, notify: NotifyHub) -> Self {
        let path = test_wal_path(name);
        let inventory = Arc::new(InMemoryInventory::new());
        let clock = Arc::new(ManualClock::new(JAN_1_2025));
        let engine = open(&path, &inventory, &clock, config, notify);
        Self {
            engine: Arc::new(engine),
            inventory,
            clock,
            path,
        }
    }

    /// A fresh engine over the same WAL, inventory and clock.
    fn reopen(&self) -> Engine {
        open(&self.path, &self.inventory, &self.clock, EngineConfig::default(), NotifyHub::new())
    }

    fn item(&self, tenant_id: &TenantId, total: Quantity) -> Ulid {
        let id = Ulid::new();
        self.inventory.set_total_quantity(tenant_id, id, total);
        id
    }

    async fn book(&self, tenant_id: &TenantId, item: Ulid, quantity: Quantity, start: Ms, end: Ms) -> Result<BookingReceipt, EngineError> {
        self.engine
            .create_booking(BookingRequest::new(
                tenant_id.clone(),
                "cust-1",
                vec![LineRequest::new(item, quantity)],
                start,
                end,
            ))
            .await
    }

    async fn available(&self, tenant_id: &TenantId, item: Ulid, start: Ms, end: Ms) -> Quantity {
        self.engine
            .availability(&TenantContext::Tenant(tenant_id.clone()), item, start, end)
            .await
            .unwrap()
            .available
    }
}

fn open(
    path: &Path,
    inventory: &Arc<InMemoryInventory>,
    clock: &Arc<ManualClock>,
    config: EngineConfig,
    notify: NotifyHub,
) -> Engine {
    Engine::new(path.to_path_buf(), inventory.clone(), Arc::new(notify), config)
        .unwrap()
        .with_clock(clock.clone())
}

fn patient() -> EngineConfig {
    EngineConfig {
        booking_max_retries: 64,
        booking_deadline: Duration::from_secs(30),
        retry_backoff: Duration::from_millis(1),
        ..EngineConfig::default()
    }
}

// ── Validation ───────────────────────────────────────────

#[tokio::test]
async fn booking_validation() {
    let h = Harness::new("validation.wal");
    let acme = tenant("acme");
    let item = h.item(&acme, 5);
    let other = h.item(&acme, 5);

    let reject = |req: BookingRequest| {
        let engine = h.engine.clone();
        async move { engine.create_booking(req).await.unwrap_err() }
    };

    let base = |lines| BookingRequest::new(acme.clone(), "c", lines, day(1), day(2));

    assert!(matches!(
        reject(BookingRequest::new(acme.clone(), "c", vec![LineRequest::new(item, 1)], day(2), day(2))).await,
        EngineError::BadRequest(BadRequest::EmptyInterval)
    ));
    assert!(matches!(
        reject(base(vec![LineRequest::new(item, 0)])).await,
        EngineError::BadRequest(BadRequest::NonPositiveQuantity)
    ));
    assert!(matches!(
        reject(base(vec![LineRequest::new(item, 1), LineRequest::new(other, 1), LineRequest::new(item, 2)])).await,
        EngineError::BadRequest(BadRequest::DuplicateItem(id)) if id == item
    ));
    assert!(matches!(
        reject(base(vec![])).await,
        EngineError::BadRequest(BadRequest::NoLines)
    ));
    assert!(matches!(
        reject(base(vec![LineRequest::new(item, 1)]).idempotency_key("")).await,
        EngineError::BadRequest(BadRequest::InvalidIdempotencyKey { .. })
    ));
    assert!(matches!(
        reject(BookingRequest::new(acme.clone(), "", vec![LineRequest::new(item, 1)], day(1), day(2))).await,
        EngineError::BadRequest(BadRequest::InvalidCustomerId { .. })
    ));
    assert!(matches!(
        reject(BookingRequest::new(acme.clone(), "c", vec![LineRequest::new(item, 1)], 0, 1)).await,
        EngineError::LimitExceeded(_)
    ));
    let too_many: Vec<LineRequest> = (0..=MAX_LINES_PER_BOOKING).map(|_| LineRequest::new(Ulid::new(), 1)).collect();
    assert!(matches!(reject(base(too_many)).await, EngineError::LimitExceeded(_)));
    assert!(matches!(
        reject(base(vec![LineRequest::new(Ulid::new(), 1)])).await,
        EngineError::ItemNotFound(_)
    ));

    assert_eq!(h.engine.store().booking_count(), 0);
}

#[test]
fn error_kinds() {
    assert_eq!(EngineError::from(BadRequest::NoLines).kind(), ErrorKind::BadRequest);
    assert_eq!(
        EngineError::Conflict {
            item_id: Ulid::new(),
            available: 0
        }
        .kind(),
        ErrorKind::Conflict
    );
    assert_eq!(EngineError::TransientStoreConflict { attempts: 4 }.kind(), ErrorKind::Transient);
    assert_eq!(EngineError::NotFound(Ulid::new()).kind(), ErrorKind::NotFound);
    assert_eq!(
        EngineError::from(StoreError::Wal("disk full".into())).kind(),
        ErrorKind::Internal
    );
    assert!(matches!(
        EngineError::from(StoreError::LedgerFull(ItemKey::new(tenant("acme"), Ulid::new()))),
        EngineError::LimitExceeded(_)
    ));
}

// ── No oversell ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_bookings_never_oversell() {
    let h = Harness::with("no_oversell.wal", patient(), NotifyHub::new());
    let acme = tenant("acme");
    let item = h.item(&acme, 3);

    let mut tasks = Vec::new();
    for i in 0..16 {
        let engine = h.engine.clone();
        let acme = acme.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .create_booking(BookingRequest::new(
                    acme,
                    format!("cust-{i}"),
                    vec![LineRequest::new(item, 1)],
                    day(10),
                    day(12),
                ))
                .await
        }));
    }

    let (mut ok, mut conflicts) = (0, 0);
    for t in tasks {
        match t.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::Conflict { available, .. }) => {
                assert_eq!(available, 0);
                conflicts += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 3);
    assert_eq!(conflicts, 13);
    assert_eq!(h.available(&acme, item, day(10), day(12)).await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_holds_and_bookings_never_oversell() {
    let h = Harness::with("no_oversell_mixed.wal", patient(), NotifyHub::new());
    let acme = tenant("acme");
    let item = h.item(&acme, 5);

    let mut tasks = Vec::new();
    for i in 0..24 {
        let engine = h.engine.clone();
        let acme = acme.clone();
        // Overlapping but not identical windows.
        let (start, end) = (day(10) + (i % 3) * H, day(11) + (i % 4) * H);
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                engine
                    .create_hold(HoldRequest::new(acme, item, 1, start, end))
                    .await
                    .map(|_| ())
            } else {
                engine
                    .create_booking(BookingRequest::new(acme, "c", vec![LineRequest::new(item, 1)], start, end))
                    .await
                    .map(|_| ())
            }
        }));
    }

    let mut ok = 0;
    for t in tasks {
        match t.await.unwrap() {
            Ok(()) => ok += 1,
            Err(EngineError::Conflict { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    // Every window contains [day(10) + 2h, day(11)), so all requests compete.
    assert_eq!(ok, 5);
    let used = h
        .engine
        .committed_and_held(&ItemKey::new(acme.clone(), item), day(10), day(12))
        .await
        .unwrap();
    assert_eq!(used, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_multi_line_bookings_never_oversell() {
    let h = Harness::with("no_oversell_multi.wal", patient(), NotifyHub::new());
    let acme = tenant("acme");
    let a = h.item(&acme, 2);
    let b = h.item(&acme, 2);

    let mut tasks = Vec::new();
    for i in 0..12 {
        let engine = h.engine.clone();
        let acme = acme.clone();
        let lines = if i % 2 == 0 {
            vec![LineRequest::new(a, 1), LineRequest::new(b, 1)]
        } else {
            vec![LineRequest::new(b, 1), LineRequest::new(a, 1)]
        };
        tasks.push(tokio::spawn(async move {
            engine
                .create_booking(BookingRequest::new(acme, "c", lines, day(3), day(4)))
                .await
        }));
    }
    let results = futures::future::join_all(tasks).await;
    let ok = results.into_iter().filter(|r| matches!(r, Ok(Ok(_)))).count();
    assert_eq!(ok, 2);
    assert_eq!(h.available(&acme, a, day(3), day(4)).await, 0);
    assert_eq!(h.available(&acme, b, day(3), day(4)).await, 0);
}

// ── Boundaries and exhaustion ────────────────────────────

#[tokio::test]
async fn adjacent_bookings_do_not_overlap() {
    let h = Harness::new("adjacent.wal");
    let acme = tenant("acme");
    let item = h.item(&acme, 1);

    h.book(&acme, item, 1, day(1), day(2)).await.unwrap();
    h.book(&acme, item, 1, day(2), day(3)).await.unwrap();
    h.book(&acme, item, 1, day(0), day(1)).await.unwrap();

    let err = h.book(&acme, item, 1, day(2) - M, day(2) + M).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict { item_id, available: 0 } if item_id == item));
}

#[tokio::test]
async fn exact_exhaustion_then_conflict() {
    let h = Harness::new("exhaustion.wal");
    let acme = tenant("acme");
    let item = h.item(&acme, 5);

    h.book(&acme, item, 3, day(1), day(3)).await.unwrap();
    match h.book(&acme, item, 3, day(2), day(4)).await {
        Err(EngineError::Conflict { available, .. }) => assert_eq!(available, 2),
        other => panic!("expected conflict, got {other:?}"),
    }
    h.book(&acme, item, 2, day(2), day(4)).await.unwrap();
    assert!(matches!(
        h.book(&acme, item, 1, day(2), day(3)).await,
        Err(EngineError::Conflict { available: 0, .. })
    ));
    // Outside the booked window everything is free again.
    assert_eq!(h.available(&acme, item, day(4), day(5)).await, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_exact_exhaustion_leaves_one_conflict() {
    let h = Harness::new("exhaustion_concurrent.wal");
    let acme = tenant("acme");

    for round in 0..20 {
        let item = h.item(&acme, 3);
        let tasks: Vec<_> = (0..4)
            .map(|i| {
                let engine = h.engine.clone();
                let req = BookingRequest::new(
                    acme.clone(),
                    format!("cust-{i}"),
                    vec![LineRequest::new(item, 1)],
                    day(1),
                    day(2),
                );
                tokio::spawn(async move { engine.create_booking(req).await })
            })
            .collect();

        let (mut ok, mut conflicts) = (0, 0);
        for t in tasks {
            match t.await.unwrap() {
                Ok(_) => ok += 1,
                Err(EngineError::Conflict { available: 0, .. }) => conflicts += 1,
                Err(e) => panic!("round {round}: unexpected error: {e}"),
            }
        }
        assert_eq!((ok, conflicts), (3, 1), "round {round}");
        assert_eq!(h.available(&acme, item, day(1), day(2)).await, 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn contention_with_spare_capacity_always_commits() {
    let h = Harness::new("contention_default.wal");
    let acme = tenant("acme");
    let item = h.item(&acme, 20);

    let tasks: Vec<_> = (0..20)
        .map(|i| {
            let engine = h.engine.clone();
            let req = BookingRequest::new(
                acme.clone(),
                format!("cust-{i}"),
                vec![LineRequest::new(item, 1)],
                day(1),
                day(2),
            );
            tokio::spawn(async move { engine.create_booking(req).await })
        })
        .collect();

    for t in tasks {
        if let Err(e) = t.await.unwrap() {
            panic!("booking with spare capacity failed: {e}");
        }
    }
    assert_eq!(h.engine.store().booking_count(), 20);
    assert_eq!(h.available(&acme, item, day(1), day(2)).await, 0);
}

#[tokio::test]
async fn zero_total_item_always_conflicts() {
    let h = Harness::new("zero_total.wal");
    let acme = tenant("acme");
    let item = h.item(&acme, 0);
    assert!(matches!(
        h.book(&acme, item, 1, day(1), day(2)).await,
        Err(EngineError::Conflict { available: 0, .. })
    ));
}

#[tokio::test]
async fn multi_line_booking_is_all_or_nothing() {
    let h = Harness::new("all_or_nothing.wal");
    let acme = tenant("acme");
    let tent = h.item(&acme, 5);
    let stove = h.item(&acme, 1);
    h.book(&acme, stove, 1, day(1), day(2)).await.unwrap();

    let req = BookingRequest::new(
        acme.clone(),
        "c",
        vec![LineRequest::new(tent, 2), LineRequest::new(stove, 1)],
        day(1),
        day(2),
    );
    let err = h.engine.create_booking(req).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict { item_id, .. } if item_id == stove));
    assert_eq!(h.available(&acme, tent, day(1), day(2)).await, 5);
}

// ── Idempotency ──────────────────────────────────────────

#[tokio::test]
async fn idempotent_replay_returns_first_booking() {
    let h = Harness::new("idem_replay.wal");
    let acme = tenant("acme");
    let item = h.item(&acme, 3);

    let req = BookingRequest::new(acme.clone(), "c", vec![LineRequest::new(item, 1)], day(1), day(2))
        .idempotency_key("checkout-42");
    let first = h.engine.create_booking(req.clone()).await.unwrap();
    assert!(!first.replayed);

    let again = h.engine.create_booking(req).await.unwrap();
    assert!(again.replayed);
    assert_eq!(again.booking, first.booking);

    // Payload is not compared: first write wins.
    let different = BookingRequest::new(acme.clone(), "c", vec![LineRequest::new(item, 2)], day(5), day(6))
        .idempotency_key("checkout-42");
    let replay = h.engine.create_booking(different).await.unwrap();
    assert_eq!(replay.booking.id, first.booking.id);

    assert_eq!(h.engine.store().booking_count(), 1);
    assert_eq!(h.available(&acme, item, day(1), day(2)).await, 2);
    assert_eq!(
        h.engine.lookup_idempotent(&acme, "checkout-42").map(|b| b.id),
        Some(first.booking.id)
    );
}

#[tokio::test]
async fn idempotency_keys_are_per_tenant() {
    let h = Harness::new("idem_tenants.wal");
    let (acme, globex) = (tenant("acme"), tenant("globex"));
    let a = h.item(&acme, 1);
    let g = h.item(&globex, 1);

    let ra = h
        .engine
        .create_booking(BookingRequest::new(acme.clone(), "c", vec![LineRequest::new(a, 1)], day(1), day(2)).idempotency_key("k"))
        .await
        .unwrap();
    let rg = h
        .engine
        .create_booking(BookingRequest::new(globex.clone(), "c", vec![LineRequest::new(g, 1)], day(1), day(2)).idempotency_key("k"))
        .await
        .unwrap();
    assert!(!ra.replayed && !rg.replayed);
    assert_ne!(ra.booking.id, rg.booking.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_same_key_commits_once() {
    let h = Harness::with("idem_race.wal", patient(), NotifyHub::new());
    let acme = tenant("acme");
    let item = h.item(&acme, 100);

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let engine = h.engine.clone();
        let acme = acme.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .create_booking(
                    BookingRequest::new(acme, "c", vec![LineRequest::new(item, 1)], day(1), day(2))
                        .idempotency_key("same"),
                )
                .await
        }));
    }
    let mut ids = Vec::new();
    for t in tasks {
        ids.push(t.await.unwrap().unwrap().booking.id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(h.engine.store().booking_count(), 1);
    assert_eq!(h.available(&acme, item, day(1), day(2)).await, 99);
}

// ── Holds ────────────────────────────────────────────────

#[tokio::test]
async fn hold_blocks_then_expiry_releases_capacity() {
    let h = Harness::new("hold_expiry.wal");
    let acme = tenant("acme");
    let item = h.item(&acme, 2);

    let hold = h
        .engine
        .create_hold(HoldRequest::new(acme.clone(), item, 2, day(1), day(2)).ttl(Duration::from_secs(600)))
        .await
        .unwrap();
    assert_eq!(hold.expires_at, JAN_1_2025 + 10 * M);
    assert!(matches!(
        h.book(&acme, item, 1, day(1), day(2)).await,
        Err(EngineError::Conflict { available: 0, .. })
    ));

    h.clock.advance(10 * M - 1);
    assert_eq!(h.available(&acme, item, day(1), day(2)).await, 0);
    h.clock.advance(1); // now == expires_at: no longer active
    assert_eq!(h.available(&acme, item, day(1), day(2)).await, 2);

    h.book(&acme, item, 2, day(1), day(2)).await.unwrap();
    // Lazy expiry: the record is still there until swept or released.
    assert!(h.engine.get_hold(&TenantContext::Public, hold.id).is_some());
}

#[tokio::test]
async fn hold_conflict_reports_available() {
    let h = Harness::new("hold_conflict.wal");
    let acme = tenant("acme");
    let item = h.item(&acme, 4);
    h.book(&acme, item, 3, day(1), day(2)).await.unwrap();

    let err = h
        .engine
        .create_hold(HoldRequest::new(acme.clone(), item, 2, day(1), day(2)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict { available: 1, .. }));
    assert!(matches!(
        h.engine.create_hold(HoldRequest::new(acme.clone(), item, 0, day(1), day(2))).await,
        Err(EngineError::BadRequest(BadRequest::NonPositiveQuantity))
    ));
}

#[tokio::test]
async fn hold_ttl_is_clamped() {
    let h = Harness::new("hold_ttl.wal");
    let acme = tenant("acme");
    let item = h.item(&acme, 10);
    let place = |ttl: Option<Duration>| {
        let mut req = HoldRequest::new(acme.clone(), item, 1, day(1), day(2));
        req.ttl = ttl;
        let engine = h.engine.clone();
        async move { engine.create_hold(req).await.unwrap() }
    };

    assert_eq!(place(Some(Duration::from_secs(1))).await.expires_at, JAN_1_2025 + 5 * M);
    assert_eq!(place(Some(Duration::from_secs(7200))).await.expires_at, JAN_1_2025 + 30 * M);
    assert_eq!(place(None).await.expires_at, JAN_1_2025 + 15 * M);
}

#[tokio::test]
async fn release_hold_is_idempotent() {
    let h = Harness::new("hold_release.wal");
    let acme = tenant("acme");
    let item = h.item(&acme, 1);
    let ctx = TenantContext::Tenant(acme.clone());

    let hold = h
        .engine
        .create_hold(HoldRequest::new(acme.clone(), item, 1, day(1), day(2)))
        .await
        .unwrap();
    assert_eq!(
        h.engine.release_hold(&ctx, hold.id).await.unwrap(),
        ReleaseOutcome::Released(hold.clone())
    );
    assert_eq!(h.engine.release_hold(&ctx, hold.id).await.unwrap(), ReleaseOutcome::NotFound);
    assert_eq!(
        h.engine.release_hold(&ctx, Ulid::new()).await.unwrap(),
        ReleaseOutcome::NotFound
    );
    h.book(&acme, item, 1, day(1), day(2)).await.unwrap();
}

#[tokio::test]
async fn expired_hold_can_still_be_released() {
    let h = Harness::new("hold_release_expired.wal");
    let acme = tenant("acme");
    let item = h.item(&acme, 1);
    let hold = h
        .engine
        .create_hold(HoldRequest::new(acme.clone(), item, 1, day(1), day(2)))
        .await
        .unwrap();
    h.clock.advance(DAY);
    assert!(matches!(
        h.engine.release_hold(&TenantContext::Public, hold.id).await.unwrap(),
        ReleaseOutcome::Released(_)
    ));
}

#[tokio::test]
async fn public_hold_takes_tenant_from_item() {
    let h = Harness::new("hold_public.wal");
    let (acme, globex) = (tenant("acme"), tenant("globex"));
    let item = h.item(&acme, 2);

    let hold = h
        .engine
        .create_hold(HoldRequest::new(TenantContext::Public, item, 1, day(1), day(2)))
        .await
        .unwrap();
    assert_eq!(hold.tenant_id, acme);
    assert_eq!(h.available(&acme, item, day(1), day(2)).await, 1);

    // Tenant context must own the item.
    assert!(matches!(
        h.engine.create_hold(HoldRequest::new(globex.clone(), item, 1, day(1), day(2))).await,
        Err(EngineError::ItemNotFound(_))
    ));
    assert!(matches!(
        h.engine
            .create_hold(HoldRequest::new(TenantContext::Public, Ulid::new(), 1, day(1), day(2)))
            .await,
        Err(EngineError::ItemNotFound(_))
    ));

    // Same item id now owned by two tenants: public lookups cannot choose.
    h.inventory.set_total_quantity(&globex, item, 2);
    assert!(matches!(
        h.engine
            .create_hold(HoldRequest::new(TenantContext::Public, item, 1, day(1), day(2)))
            .await,
        Err(EngineError::BadRequest(BadRequest::AmbiguousItem(id))) if id == item
    ));
    assert!(matches!(
        h.engine.availability(&TenantContext::Public, item, day(1), day(2)).await,
        Err(EngineError::BadRequest(BadRequest::AmbiguousItem(_)))
    ));
}

#[tokio::test]
async fn holds_are_tenant_scoped() {
    let h = Harness::new("hold_scope.wal");
    let (acme, globex) = (tenant("acme"), tenant("globex"));
    let item = h.item(&acme, 1);
    let hold = h
        .engine
        .create_hold(HoldRequest::new(acme.clone(), item, 1, day(1), day(2)))
        .await
        .unwrap();

    let foreign = TenantContext::Tenant(globex);
    assert!(h.engine.get_hold(&foreign, hold.id).is_none());
    assert_eq!(h.engine.release_hold(&foreign, hold.id).await.unwrap(), ReleaseOutcome::NotFound);
    assert!(h.engine.get_hold(&TenantContext::Tenant(acme), hold.id).is_some());
}

#[tokio::test]
async fn sweep_removes_only_long_expired_holds() {
    let h = Harness::new("sweep.wal");
    let acme = tenant("acme");
    let item = h.item(&acme, 10);
    let short = h
        .engine
        .create_hold(HoldRequest::new(acme.clone(), item, 1, day(1), day(2)).ttl(Duration::from_secs(300)))
        .await
        .unwrap();
    let long = h
        .engine
        .create_hold(HoldRequest::new(acme.clone(), item, 1, day(1), day(2)).ttl(Duration::from_secs(1800)))
        .await
        .unwrap();

    h.clock.advance(10 * M);
    // Expired 5 minutes ago, but the grace period is an hour.
    assert_eq!(h.engine.sweep_expired_holds(Duration::from_secs(3600)).await.unwrap(), 0);
    assert_eq!(h.engine.sweep_expired_holds(Duration::ZERO).await.unwrap(), 1);
    assert!(h.engine.get_hold(&TenantContext::Public, short.id).is_none());
    assert!(h.engine.get_hold(&TenantContext::Public, long.id).is_some());
    assert_eq!(h.engine.sweep_expired_holds(Duration::ZERO).await.unwrap(), 0);
}

// ── Hold supersession ────────────────────────────────────

#[tokio::test]
async fn booking_consumes_own_hold() {
    let h = Harness::new("supersede.wal");
    let acme = tenant("acme");
    let item = h.item(&acme, 2);
    let hold = h
        .engine
        .create_hold(HoldRequest::new(acme.clone(), item, 2, day(1), day(2)))
        .await
        .unwrap();

    // Without naming the hold, its units block the booking.
    assert!(matches!(
        h.book(&acme, item, 2, day(1), day(2)).await,
        Err(EngineError::Conflict { available: 0, .. })
    ));

    let req = BookingRequest::new(acme.clone(), "c", vec![LineRequest::new(item, 2)], day(1), day(2))
        .consume_hold(hold.id);
    h.engine.create_booking(req).await.unwrap();

    assert!(h.engine.get_hold(&TenantContext::Public, hold.id).is_none());
    assert_eq!(h.available(&acme, item, day(1), day(2)).await, 0);
    let units = h
        .engine
        .committed_and_held(&ItemKey::new(acme, item), day(1), day(2))
        .await
        .unwrap();
    assert_eq!(units, 2);
}

#[tokio::test]
async fn released_hold_named_by_booking_is_ignored() {
    let h = Harness::new("supersede_gone.wal");
    let acme = tenant("acme");
    let item = h.item(&acme, 1);
    let hold = h
        .engine
        .create_hold(HoldRequest::new(acme.clone(), item, 1, day(1), day(2)))
        .await
        .unwrap();
    h.engine
        .release_hold(&TenantContext::Public, hold.id)
        .await
        .unwrap();

    let req = BookingRequest::new(acme.clone(), "c", vec![LineRequest::new(item, 1)], day(1), day(2))
        .consume_hold(hold.id);
    h.engine.create_booking(req).await.unwrap();
}

#[tokio::test]
async fn foreign_or_unrelated_hold_is_rejected() {
    let h = Harness::new("supersede_reject.wal");
    let (acme, globex) = (tenant("acme"), tenant("globex"));
    let item = h.item(&acme, 5);
    h.inventory.set_total_quantity(&globex, item, 5);
    let other = h.item(&acme, 5);

    let globex_hold = h
        .engine
        .create_hold(HoldRequest::new(globex.clone(), item, 1, day(1), day(2)))
        .await
        .unwrap();
    let req = BookingRequest::new(acme.clone(), "c", vec![LineRequest::new(item, 1)], day(1), day(2))
        .consume_hold(globex_hold.id);
    assert!(matches!(
        h.engine.create_booking(req).await,
        Err(EngineError::BadRequest(BadRequest::TenantMismatch(_)))
    ));

    let other_hold = h
        .engine
        .create_hold(HoldRequest::new(acme.clone(), other, 1, day(1), day(2)))
        .await
        .unwrap();
    let req = BookingRequest::new(acme.clone(), "c", vec![LineRequest::new(item, 1)], day(1), day(2))
        .consume_hold(other_hold.id);
    assert!(matches!(
        h.engine.create_booking(req).await,
        Err(EngineError::BadRequest(BadRequest::HoldNotOnBookedItem(_)))
    ));
    // Neither hold was touched.
    assert!(h.engine.get_hold(&TenantContext::Public, globex_hold.id).is_some());
    assert!(h.engine.get_hold(&TenantContext::Public, other_hold.id).is_some());
}

// ── Tenant isolation ─────────────────────────────────────

#[tokio::test]
async fn tenants_sharing_an_item_id_do_not_contend() {
    let h = Harness::new("tenant_isolation.wal");
    let (acme, globex) = (tenant("acme"), tenant("globex"));
    let item = h.item(&acme, 1);
    h.inventory.set_total_quantity(&globex, item, 1);

    let a = h.book(&acme, item, 1, day(1), day(2)).await.unwrap().booking;
    let g = h.book(&globex, item, 1, day(1), day(2)).await.unwrap().booking;
    assert_eq!(h.available(&acme, item, day(1), day(2)).await, 0);
    assert_eq!(h.available(&globex, item, day(1), day(2)).await, 0);

    assert!(h.engine.get_booking(&acme, g.id).is_none());
    assert!(matches!(
        h.engine.cancel_booking(&acme, g.id).await,
        Err(EngineError::NotFound(_))
    ));
    assert_eq!(h.engine.get_booking(&acme, a.id).unwrap(), a);
    assert!(h.engine.get_booking(&globex, g.id).unwrap().is_confirmed());
}

#[tokio::test]
async fn booking_foreign_item_is_not_found() {
    let h = Harness::new("tenant_foreign_item.wal");
    let (acme, globex) = (tenant("acme"), tenant("globex"));
    let item = h.item(&globex, 1);
    assert!(matches!(
        h.book(&acme, item, 1, day(1), day(2)).await,
        Err(EngineError::ItemNotFound(id)) if id == item
    ));
}

// ── Cancellation ─────────────────────────────────────────

#[tokio::test]
async fn cancel_releases_capacity_and_is_idempotent() {
    let h = Harness::new("cancel.wal");
    let acme = tenant("acme");
    let item = h.item(&acme, 1);
    let booking = h.book(&acme, item, 1, day(1), day(2)).await.unwrap().booking;

    h.clock.advance(H);
    let cancelled = h.engine.cancel_booking(&acme, booking.id).await.unwrap();
    assert_eq!(
        cancelled.status,
        BookingStatus::Cancelled {
            cancelled_at: JAN_1_2025 + H
        }
    );
    assert_eq!(h.available(&acme, item, day(1), day(2)).await, 1);

    h.clock.advance(H);
    let again = h.engine.cancel_booking(&acme, booking.id).await.unwrap();
    assert_eq!(again.status, cancelled.status);

    h.book(&acme, item, 1, day(1), day(2)).await.unwrap();
    assert!(matches!(
        h.engine.cancel_booking(&acme, Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Retry ────────────────────────────────────────────────

/// Make the first attempt of a two-line booking fail validation: hold the
/// second line's ledger so the booking blocks after reading the first, then
/// take the first line's only unit with a hold. The clock passes the hold's
/// expiry before the booking resumes, so a retry reads a free unit again.
async fn race_first_attempt(h: &Harness) -> Result<BookingReceipt, EngineError> {
    let acme = tenant("acme");
    let a = h.item(&acme, 1);
    let b = h.item(&acme, 5);

    let blocker = h.engine.store().lock_items([ItemKey::new(acme.clone(), b)]).await;
    let engine = h.engine.clone();
    let req = BookingRequest::new(
        acme.clone(),
        "c",
        vec![LineRequest::new(a, 1), LineRequest::new(b, 1)],
        day(1),
        day(2),
    );
    let task = tokio::spawn(async move { engine.create_booking(req).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    h.engine
        .create_hold(HoldRequest::new(acme.clone(), a, 1, day(1), day(2)).ttl(Duration::from_secs(600)))
        .await
        .unwrap();
    h.clock.advance(10 * M);
    drop(blocker);
    task.await.unwrap()
}

#[tokio::test]
async fn serialization_failure_surfaces_as_transient_after_retries() {
    let config = EngineConfig {
        booking_max_retries: 0,
        ..EngineConfig::default()
    };
    let h = Harness::with("retry_exhausted.wal", config, NotifyHub::new());
    let err = race_first_attempt(&h).await.unwrap_err();
    assert!(matches!(err, EngineError::TransientStoreConflict { attempts: 1 }));
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert_eq!(h.engine.store().booking_count(), 0);
}

#[tokio::test]
async fn serialization_failure_is_retried() {
    let h = Harness::with("retry_succeeds.wal", patient(), NotifyHub::new());
    let receipt = race_first_attempt(&h).await.unwrap();
    assert!(!receipt.replayed);
    assert_eq!(h.engine.store().booking_count(), 1);
}

// ── Notifications ────────────────────────────────────────

struct Broken;

#[async_trait]
impl BookingSink for Broken {
    fn name(&self) -> &'static str {
        "broken"
    }

    async fn deliver(&self, _notice: &BookingNotice) -> Result<(), SinkError> {
        Err(SinkError("downstream unavailable".into()))
    }
}

#[tokio::test]
async fn notification_failure_does_not_affect_booking() {
    let notify = NotifyHub::new().with_sink(Arc::new(Broken));
    let mut rx = notify.subscribe();
    let h = Harness::with("notify.wal", EngineConfig::default(), notify);
    let acme = tenant("acme");
    let item = h.item(&acme, 1);

    let booking = h.book(&acme, item, 1, day(1), day(2)).await.unwrap().booking;
    assert_eq!(
        rx.recv().await.unwrap(),
        BookingNotice::Committed {
            tenant_id: acme.clone(),
            booking_id: booking.id,
        }
    );

    let cancelled = h.engine.cancel_booking(&acme, booking.id).await.unwrap();
    assert_eq!(
        rx.recv().await.unwrap(),
        BookingNotice::Cancelled {
            tenant_id: acme.clone(),
            booking_id: cancelled.id,
        }
    );

    // Replays publish nothing.
    let req = BookingRequest::new(acme.clone(), "c", vec![LineRequest::new(item, 1)], day(5), day(6))
        .idempotency_key("k");
    h.engine.create_booking(req.clone()).await.unwrap();
    rx.recv().await.unwrap();
    h.engine.create_booking(req).await.unwrap();
    assert!(rx.try_recv().is_err());
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn restart_restores_bookings_holds_and_keys() {
    let h = Harness::new("restart.wal");
    let acme = tenant("acme");
    let item = h.item(&acme, 3);

    let kept = h
        .engine
        .create_booking(
            BookingRequest::new(acme.clone(), "c", vec![LineRequest::new(item, 1)], day(1), day(2))
                .idempotency_key("k1"),
        )
        .await
        .unwrap()
        .booking;
    let cancelled = h.book(&acme, item, 1, day(1), day(2)).await.unwrap().booking;
    h.engine.cancel_booking(&acme, cancelled.id).await.unwrap();
    let hold = h
        .engine
        .create_hold(HoldRequest::new(acme.clone(), item, 1, day(1), day(2)))
        .await
        .unwrap();

    let engine = h.reopen();
    assert_eq!(engine.get_booking(&acme, kept.id), Some(kept.clone()));
    assert!(!engine.get_booking(&acme, cancelled.id).unwrap().is_confirmed());
    assert_eq!(engine.get_hold(&TenantContext::Public, hold.id), Some(hold));
    assert_eq!(engine.lookup_idempotent(&acme, "k1").map(|b| b.id), Some(kept.id));
    let availability = engine
        .availability(&TenantContext::Tenant(acme.clone()), item, day(1), day(2))
        .await
        .unwrap();
    assert_eq!(availability.committed_and_held, 2);
    assert_eq!(availability.available, 1);
}

#[tokio::test]
async fn compaction_then_restart() {
    let h = Harness::new("compact_restart.wal");
    let acme = tenant("acme");
    let item = h.item(&acme, 10);
    let ctx = TenantContext::Tenant(acme.clone());

    for _ in 0..5 {
        let hold = h
            .engine
            .create_hold(HoldRequest::new(acme.clone(), item, 1, day(1), day(2)))
            .await
            .unwrap();
        h.engine.release_hold(&ctx, hold.id).await.unwrap();
    }
    let booking = h.book(&acme, item, 4, day(1), day(2)).await.unwrap().booking;
    assert_eq!(h.engine.wal_appends_since_compact().await, 11);
    assert_eq!(h.engine.compact_wal().await.unwrap(), 1);

    let engine = h.reopen();
    assert_eq!(engine.get_booking(&acme, booking.id), Some(booking));
    assert_eq!(engine.store().hold_count(), 0);
}
