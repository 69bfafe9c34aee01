//! End-to-end allocation/renewal/health scenarios against the in-memory
//! backend, driven on a paused clock.

use core::time::Duration;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio_util::sync::CancellationToken;

use crate::{
    AllocateError, AllocatorOptions, ConflictObserver, CoordinationBackend, HealthStatus,
    IdentityProvider, MemoryBackend, UnhealthyStatus, WorkerIdAllocator, WorkerIdConflictError,
    WorkerSlot,
};

struct FixedIdentity(&'static str);

impl IdentityProvider for FixedIdentity {
    fn owner_token(&self) -> String {
        self.0.to_string()
    }
}

/// Let spawned keep-alive tasks run between clock manipulations.
async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

async fn advance(duration: Duration) {
    // Let any freshly-spawned keep-alive task reach its first `sleep`
    // registration against the current clock before we move time forward;
    // otherwise its first timer would be registered past the advance and
    // every renewal would be skewed by one interval.
    settle().await;
    tokio::time::advance(duration).await;
    settle().await;
}

fn small_space() -> AllocatorOptions {
    AllocatorOptions::new("orders")
        .with_id_bits(2)
        .with_ttl(Duration::from_secs(10))
        .with_refresh_interval(Duration::from_secs(5))
        .with_safety_margin(Duration::ZERO)
}

#[tokio::test(start_paused = true)]
async fn sequential_instances_get_distinct_ids_until_exhaustion() {
    let backend = Arc::new(MemoryBackend::new());

    let mut slots = Vec::new();
    for expected in 0..4u32 {
        let slot = WorkerSlot::acquire(backend.clone(), small_space())
            .await
            .expect("space not yet exhausted");
        assert_eq!(slot.worker_id(), expected);
        slots.push(slot);
    }

    let err = WorkerSlot::acquire(backend.clone(), small_space())
        .await
        .expect_err("fifth instance must not fit a 2-bit space");
    assert!(matches!(
        err,
        AllocateError::SpaceExhausted { capacity: 4, .. }
    ));

    for slot in slots {
        slot.shutdown().await;
    }
    assert_eq!(backend.claimed(), 0);
}

#[tokio::test(start_paused = true)]
async fn renewals_keep_id_and_health() {
    let backend = Arc::new(MemoryBackend::new());
    let options = small_space();
    let key = options.claim_key(0);

    let slot = WorkerSlot::acquire_with(backend.clone(), options, &FixedIdentity("me"), None)
        .await
        .expect("allocation succeeds on an empty backend");
    assert_eq!(slot.worker_id(), 0);

    // Three refresh intervals exceed the 10s ttl; only renewal keeps the
    // claim alive across them.
    for _ in 0..3 {
        advance(Duration::from_secs(5)).await;
        assert_eq!(slot.worker_id(), 0);
        assert!(slot.is_healthy());
        assert_eq!(backend.owner_of(&key).as_deref(), Some("me"));
    }

    slot.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_frees_the_slot_immediately() {
    let backend = Arc::new(MemoryBackend::new());

    let first = WorkerSlot::acquire(backend.clone(), small_space())
        .await
        .expect("allocation succeeds on an empty backend");
    assert_eq!(first.worker_id(), 0);
    first.shutdown().await;

    // No ttl wait: the released slot is reusable right away.
    let second = WorkerSlot::acquire(backend.clone(), small_space())
        .await
        .expect("released slot is immediately reusable");
    assert_eq!(second.worker_id(), 0);
    second.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn crashed_holder_slot_is_reclaimed_after_ttl() {
    let backend = Arc::new(MemoryBackend::new());
    let options = small_space();

    // Live peers hold ids 0, 2 and 3 on long leases; the holder of id 1
    // "crashed" without releasing, leaving a 10s lease to expire.
    for id in [0u32, 2, 3] {
        backend
            .atomic_claim(&options.claim_key(id), "peer", Duration::from_secs(3600))
            .await
            .expect("claim succeeds")
            .expect("key is free");
    }
    backend
        .atomic_claim(&options.claim_key(1), "crashed", Duration::from_secs(10))
        .await
        .expect("claim succeeds")
        .expect("key is free");

    advance(Duration::from_secs(11)).await;

    let slot = WorkerSlot::acquire(backend.clone(), options)
        .await
        .expect("expired slot is reclaimable");
    assert_eq!(slot.worker_id(), 1);
    slot.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stolen_key_escalates_exactly_once_and_is_never_released() {
    let backend = Arc::new(MemoryBackend::new());
    let options = small_space();
    let key = options.claim_key(0);

    let conflicts = Arc::new(AtomicUsize::new(0));
    let last_conflict: Arc<Mutex<Option<WorkerIdConflictError>>> = Arc::default();
    let observer: ConflictObserver = {
        let conflicts = conflicts.clone();
        let last_conflict = last_conflict.clone();
        Arc::new(move |err: &WorkerIdConflictError| {
            conflicts.fetch_add(1, Ordering::SeqCst);
            *last_conflict.lock().expect("observer mutex") = Some(err.clone());
        })
    };

    let slot = WorkerSlot::acquire_with(
        backend.clone(),
        options,
        &FixedIdentity("victim"),
        Some(observer),
    )
    .await
    .expect("allocation succeeds on an empty backend");

    backend.steal(&key, "intruder");
    advance(Duration::from_secs(5)).await;

    assert!(!slot.is_healthy());
    assert_eq!(slot.health().status(), HealthStatus::Unhealthy);
    assert_eq!(conflicts.load(Ordering::SeqCst), 1);
    let err = last_conflict
        .lock()
        .expect("observer mutex")
        .clone()
        .expect("conflict was observed");
    assert_eq!(err.worker_id, 0);
    assert_eq!(err.owner_token, "victim");

    // The id keeps reading back (documented), and further intervals raise
    // no second conflict.
    assert_eq!(slot.worker_id(), 0);
    advance(Duration::from_secs(30)).await;
    assert_eq!(conflicts.load(Ordering::SeqCst), 1);

    // Shutdown after conflict must not touch the intruder's claim.
    slot.shutdown().await;
    assert_eq!(backend.owner_of(&key).as_deref(), Some("intruder"));
}

#[tokio::test(start_paused = true)]
async fn deleted_key_escalates_on_next_renewal() {
    let backend = Arc::new(MemoryBackend::new());
    let options = small_space();
    let key = options.claim_key(0);

    let slot = WorkerSlot::acquire(backend.clone(), options).await.unwrap();
    backend.evict(&key);
    advance(Duration::from_secs(5)).await;

    assert!(!slot.is_healthy());
    slot.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn partition_exhausts_budget_and_escalates() {
    let backend = Arc::new(MemoryBackend::new());
    let conflicts = Arc::new(AtomicUsize::new(0));
    let observer: ConflictObserver = {
        let conflicts = conflicts.clone();
        Arc::new(move |_: &WorkerIdConflictError| {
            conflicts.fetch_add(1, Ordering::SeqCst);
        })
    };

    // ttl 10s / refresh 5s / margin 0 -> a budget of two transient
    // failures before the conflict path.
    let slot = WorkerSlot::acquire_with(
        backend.clone(),
        small_space(),
        &FixedIdentity("me"),
        Some(observer),
    )
    .await
    .expect("allocation succeeds on an empty backend");

    backend.set_offline(true);

    advance(Duration::from_secs(5)).await;
    assert!(slot.is_healthy(), "one transient failure is within budget");

    advance(Duration::from_secs(5)).await;
    assert!(
        !slot.is_healthy(),
        "budget exhaustion must escalate, not go silently stale"
    );
    assert_eq!(conflicts.load(Ordering::SeqCst), 1);

    backend.set_offline(false);
    slot.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn conflict_status_is_deployment_policy() {
    let backend = Arc::new(MemoryBackend::new());
    let options = small_space().with_unhealthy_status(UnhealthyStatus::Degraded);
    let key = options.claim_key(0);

    let slot = WorkerSlot::acquire(backend.clone(), options).await.unwrap();
    backend.steal(&key, "intruder");
    advance(Duration::from_secs(5)).await;

    assert_eq!(slot.health().status(), HealthStatus::Degraded);
    assert!(!slot.is_healthy());
    let report = slot.check_health();
    assert_eq!(report.name, "worker-id/orders");
    assert_eq!(report.status, HealthStatus::Degraded);
    slot.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn batch_scan_releases_every_surplus_win() {
    let backend = Arc::new(MemoryBackend::new());
    // An empty backend makes every claim in the first batch a winner; all
    // but the minimum must be handed straight back.
    let options = AllocatorOptions::new("orders")
        .with_id_bits(4)
        .with_claim_batch_size(8)
        .with_ttl(Duration::from_secs(10))
        .with_refresh_interval(Duration::from_secs(5));

    let slot = WorkerSlot::acquire(backend.clone(), options).await.unwrap();
    assert_eq!(slot.worker_id(), 0);
    assert_eq!(backend.claimed(), 1, "surplus wins must not linger");
    slot.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn contended_scan_takes_minimum_free_id() {
    let backend = Arc::new(MemoryBackend::new());
    let options = small_space();
    backend
        .atomic_claim(&options.claim_key(0), "peer", Duration::from_secs(3600))
        .await
        .unwrap()
        .unwrap();

    let slot = WorkerSlot::acquire(backend.clone(), options).await.unwrap();
    assert_eq!(slot.worker_id(), 1);
    slot.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cancelled_allocation_claims_nothing() {
    let backend = MemoryBackend::new();
    let options = small_space();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = WorkerIdAllocator::new(&backend, &options, "me")
        .allocate(&cancel)
        .await
        .expect_err("pre-cancelled allocation must abort");
    assert!(matches!(err, AllocateError::Cancelled));
    assert_eq!(backend.claimed(), 0);
}

#[tokio::test(start_paused = true)]
async fn app_names_do_not_contend() {
    let backend = Arc::new(MemoryBackend::new());

    // Same app: the peer contends and lands on id 1. Different app: its
    // own space, starting over at id 0, on the same shared backend.
    let orders = WorkerSlot::acquire(backend.clone(), small_space())
        .await
        .unwrap();
    let orders_peer = WorkerSlot::acquire(backend.clone(), small_space())
        .await
        .unwrap();
    assert_eq!(orders.worker_id(), 0);
    assert_eq!(orders_peer.worker_id(), 1);

    let billing_options = AllocatorOptions::new("billing")
        .with_id_bits(2)
        .with_ttl(Duration::from_secs(10))
        .with_refresh_interval(Duration::from_secs(5));
    let billing = WorkerSlot::acquire(backend.clone(), billing_options)
        .await
        .unwrap();
    assert_eq!(billing.worker_id(), 0);

    orders.shutdown().await;
    orders_peer.shutdown().await;
    billing.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn misconfigured_options_fail_before_touching_the_backend() {
    let backend = Arc::new(MemoryBackend::new());
    let options = AllocatorOptions::new("orders")
        .with_ttl(Duration::from_secs(5))
        .with_refresh_interval(Duration::from_secs(5));

    let err = WorkerSlot::acquire(backend.clone(), options)
        .await
        .expect_err("refresh_interval == ttl is invalid");
    assert!(matches!(err, AllocateError::Misconfigured { .. }));
    assert_eq!(backend.claimed(), 0);
}
