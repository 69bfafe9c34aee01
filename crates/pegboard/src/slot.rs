//! The public facade: acquire a slot, watch its health, shut it down.

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::allocator::WorkerIdAllocator;
use crate::backend::CoordinationBackend;
use crate::error::AllocateError;
use crate::health::{HealthReport, HealthState};
use crate::identity::{IdentityProvider, ProcessIdentity};
use crate::keepalive::{ConflictObserver, keep_alive_loop};
use crate::options::AllocatorOptions;

/// An exclusively-owned worker id with its keep-alive loop attached.
///
/// `acquire` runs identity, then allocation, then the keep-alive spawn;
/// the returned slot is immediately usable as the worker-id input of a
/// Snowflake-style encoder. Each slot is instance-scoped: several slots
/// with different app names coexist in one process, sharing one backend
/// client.
///
/// # Shutdown
///
/// Call [`WorkerSlot::shutdown`] on graceful termination: it cancels the
/// keep-alive loop and waits for the loop's best-effort release to finish,
/// so the slot frees immediately for the next process. A slot that is
/// merely dropped cancels its loop but does not wait: the release still
/// runs on the detached task if the runtime lives long enough, and the
/// backend ttl reclaims the slot otherwise.
pub struct WorkerSlot {
    app_name: String,
    worker_id: u32,
    owner_token: String,
    acquired_at: Instant,
    health: HealthState,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl WorkerSlot {
    /// Acquires a slot with the default [`ProcessIdentity`] and no
    /// conflict observer.
    ///
    /// # Errors
    ///
    /// Fails fast with [`AllocateError`] when the options are invalid, the
    /// id space is exhausted, or the backend is unreachable. None of these
    /// are retried here; propagate them and let the supervisor restart
    /// the process.
    pub async fn acquire<B>(backend: B, options: AllocatorOptions) -> Result<Self, AllocateError>
    where
        B: CoordinationBackend + 'static,
    {
        Self::acquire_with(backend, options, &ProcessIdentity, None).await
    }

    /// Acquires a slot with an explicit identity and an optional conflict
    /// observer.
    ///
    /// The observer fires at most once, on the keep-alive task, when loss
    /// of ownership is confirmed. The health surface is the load-bearing
    /// signal; the observer is for logging/alerting glue.
    pub async fn acquire_with<B>(
        backend: B,
        options: AllocatorOptions,
        identity: &dyn IdentityProvider,
        observer: Option<ConflictObserver>,
    ) -> Result<Self, AllocateError>
    where
        B: CoordinationBackend + 'static,
    {
        options.validate()?;
        let owner_token = identity.owner_token();
        let cancel = CancellationToken::new();

        let claim = WorkerIdAllocator::new(&backend, &options, &owner_token)
            .allocate(&cancel)
            .await?;

        let app_name = options.app_name.clone();
        let worker_id = claim.worker_id;
        let acquired_at = claim.acquired_at;
        let health = HealthState::new(format!("worker-id/{app_name}"));

        let task = tokio::spawn(keep_alive_loop(
            backend,
            claim,
            options,
            health.clone(),
            observer,
            cancel.clone(),
        ));

        Ok(Self {
            app_name,
            worker_id,
            owner_token,
            acquired_at,
            health,
            cancel,
            task: Some(task),
        })
    }

    /// The allocated worker id.
    ///
    /// Keeps returning the last allocated id even after the slot turns
    /// unhealthy; do not trust it once [`WorkerSlot::is_healthy`] is
    /// false. Callers minting new ids must consult health first; this
    /// crate never forcibly stops a downstream encoder.
    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    /// The app namespace this slot was allocated in.
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// The owner token the claim is held under.
    pub fn owner_token(&self) -> &str {
        &self.owner_token
    }

    /// When the claim was won.
    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// A clone of the shared health state, for health-check plumbing.
    pub fn health(&self) -> HealthState {
        self.health.clone()
    }

    /// Whether exclusive ownership is still intact.
    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    /// Point-in-time `{name, status, description}` report.
    pub fn check_health(&self) -> HealthReport {
        self.health.check_health()
    }

    /// Graceful shutdown: cancel the keep-alive loop and wait for it to
    /// exit. On return the best-effort release has run (unless a conflict
    /// had already terminated the loop, in which case the key is left
    /// alone, since it may belong to the new owner).
    pub async fn shutdown(mut self) {
        debug!(app_name = %self.app_name, worker_id = self.worker_id, "shutting down worker slot");
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        // Stop renewing even when the caller forgets shutdown(); an
        // abandoned loop would otherwise keep the claim alive forever.
        self.cancel.cancel();
    }
}

impl core::fmt::Debug for WorkerSlot {
    fn fmt(&self, fmt: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        fmt.debug_struct("WorkerSlot")
            .field("app_name", &self.app_name)
            .field("worker_id", &self.worker_id)
            .field("owner_token", &self.owner_token)
            .field("status", &self.health.status())
            .finish_non_exhaustive()
    }
}
