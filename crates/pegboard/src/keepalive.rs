//! Lease keep-alive loop.
//!
//! One task per claim, spawned right after allocation succeeds and driven
//! by a cancellation token. Renewals are strictly sequential. The loop has
//! exactly three exits:
//!
//! - graceful cancellation, after one best-effort release;
//! - a definitive conflict reported by the backend;
//! - exhaustion of the transient-failure budget.
//!
//! The latter two converge on the same escalation: flip health to the
//! configured status, raise one [`WorkerIdConflictError`], and stop
//! renewing. Once exclusivity is lost, silently continuing to hand out
//! "exclusive" ids is strictly worse than refusing, so the loop fails loud
//! and stays unhealthy rather than attempting reallocation.

use std::sync::Arc;

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::backend::CoordinationBackend;
use crate::claim::WorkerIdClaim;
use crate::error::{RenewError, WorkerIdConflictError};
use crate::health::HealthState;
use crate::options::AllocatorOptions;

/// Callback invoked with the conflict error when ownership loss is
/// confirmed. Runs at most once per slot, on the keep-alive task.
pub type ConflictObserver = Arc<dyn Fn(&WorkerIdConflictError) + Send + Sync>;

pub(crate) async fn keep_alive_loop<B>(
    backend: B,
    mut claim: WorkerIdClaim<B::Handle>,
    options: AllocatorOptions,
    health: HealthState,
    observer: Option<ConflictObserver>,
    cancel: CancellationToken,
) where
    B: CoordinationBackend,
{
    let budget = options.max_refresh_failures();
    let mut failures = 0u32;

    trace!(
        app_name = %options.app_name,
        worker_id = claim.worker_id,
        refresh_interval = ?options.refresh_interval,
        budget,
        "keep-alive loop started"
    );

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                release_on_shutdown(&backend, &claim, &options).await;
                return;
            }
            () = sleep(options.refresh_interval) => {}
        }

        match backend.renew(&claim.handle).await {
            Ok(()) => {
                failures = 0;
                claim.expires_at = Instant::now() + options.ttl;
                trace!(
                    app_name = %options.app_name,
                    worker_id = claim.worker_id,
                    "lease renewed"
                );
            }
            Err(RenewError::Transient(err)) => {
                failures += 1;
                warn!(
                    app_name = %options.app_name,
                    worker_id = claim.worker_id,
                    attempt = failures,
                    budget,
                    error = %err,
                    "transient renew failure"
                );
                // Budget exhaustion must escalate: past this point the
                // backend may already have expired the lease and handed
                // the id to someone else.
                if failures >= budget {
                    escalate(&options, &claim, &health, observer.as_ref());
                    return;
                }
            }
            Err(RenewError::Conflict { context }) => {
                warn!(
                    app_name = %options.app_name,
                    worker_id = claim.worker_id,
                    context,
                    "definitive renew conflict"
                );
                escalate(&options, &claim, &health, observer.as_ref());
                return;
            }
        }
    }
}

/// Graceful path: one best-effort release. Failures are logged, never
/// thrown; the ttl reclaims the slot either way.
async fn release_on_shutdown<B>(backend: &B, claim: &WorkerIdClaim<B::Handle>, options: &AllocatorOptions)
where
    B: CoordinationBackend,
{
    debug!(
        app_name = %options.app_name,
        worker_id = claim.worker_id,
        "keep-alive loop cancelled, releasing claim"
    );
    match backend.release(&claim.handle).await {
        Ok(()) => debug!(
            app_name = %options.app_name,
            worker_id = claim.worker_id,
            "claim released"
        ),
        Err(err) => warn!(
            app_name = %options.app_name,
            worker_id = claim.worker_id,
            error = %err,
            "best-effort release failed; slot frees on ttl expiry"
        ),
    }
}

/// Terminal conflict path. The CAS inside [`HealthState::escalate`] makes
/// the error exactly-once even if escalation were ever raced. The claimed
/// key is deliberately NOT released here: it may already belong to the new
/// owner, and deleting it would knock them over too.
fn escalate<H>(
    options: &AllocatorOptions,
    claim: &WorkerIdClaim<H>,
    health: &HealthState,
    observer: Option<&ConflictObserver>,
) {
    if !health.escalate(options.unhealthy_status) {
        return;
    }
    let err = WorkerIdConflictError {
        app_name: options.app_name.clone(),
        worker_id: claim.worker_id,
        owner_token: claim.owner_token.clone(),
    };
    error!(
        error = %err,
        status = ?options.unhealthy_status,
        "worker id ownership lost; this process must stop minting ids until restarted"
    );
    if let Some(callback) = observer {
        callback(&err);
    }
}
