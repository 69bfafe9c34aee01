//! Startup allocation scan.
//!
//! The allocator enumerates candidate ids `0..2^id_bits` in bounded-size
//! batches: claims inside a batch run concurrently, batches run
//! sequentially. Several ids in a batch may be won at once under
//! contention, so the scan keeps the minimum id and immediately releases
//! every other winner, since won-but-unused claims must never linger as phantom
//! reservations.
//!
//! Allocation runs once, at startup, and is fatal on failure: exhaustion
//! and backend unavailability both propagate to the caller so the process
//! fails fast. There is no internal retry loop; restart policy belongs to
//! the process supervisor.

use futures::future;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::CoordinationBackend;
use crate::claim::WorkerIdClaim;
use crate::error::{AllocateError, BackendError};
use crate::options::AllocatorOptions;

/// Scans the candidate space and wins exclusive ownership of exactly one
/// worker id.
///
/// Production callers go through [`WorkerSlot::acquire`], which wires the
/// allocator and the keep-alive loop together; the allocator also stands
/// alone when only the scan is needed.
///
/// [`WorkerSlot::acquire`]: crate::WorkerSlot::acquire
pub struct WorkerIdAllocator<'a, B> {
    backend: &'a B,
    options: &'a AllocatorOptions,
    owner_token: &'a str,
}

impl<'a, B> WorkerIdAllocator<'a, B>
where
    B: CoordinationBackend,
{
    pub fn new(backend: &'a B, options: &'a AllocatorOptions, owner_token: &'a str) -> Self {
        Self {
            backend,
            options,
            owner_token,
        }
    }

    /// Runs the scan. Returns the won claim, or the first fatal error.
    ///
    /// Cancellation is honored between backend calls: before each batch,
    /// and again after a batch completes (any claims that batch won are
    /// released before returning [`AllocateError::Cancelled`]).
    pub async fn allocate(
        &self,
        cancel: &CancellationToken,
    ) -> Result<WorkerIdClaim<B::Handle>, AllocateError> {
        self.options.validate()?;

        let capacity = self.options.capacity();
        let batch_size = self.options.claim_batch_size as u32;
        let mut start = 0u32;

        while start < capacity {
            if cancel.is_cancelled() {
                return Err(AllocateError::Cancelled);
            }
            let end = start.saturating_add(batch_size).min(capacity);
            debug!(
                app_name = %self.options.app_name,
                batch_start = start,
                batch_end = end,
                "scanning worker id batch"
            );

            let attempts = (start..end).map(|id| {
                let key = self.options.claim_key(id);
                async move {
                    let won = self
                        .backend
                        .atomic_claim(&key, self.owner_token, self.options.ttl)
                        .await;
                    (id, won)
                }
            });
            let results = future::join_all(attempts).await;

            let mut winners: Vec<(u32, B::Handle)> = Vec::new();
            let mut first_err: Option<BackendError> = None;
            for (id, won) in results {
                match won {
                    Ok(Some(handle)) => winners.push((id, handle)),
                    Ok(None) => {}
                    Err(err) => {
                        if first_err.is_none() {
                            first_err = Some(err);
                        }
                    }
                }
            }

            // A batch that saw a backend error may still hold wins; those
            // are released before the error propagates, otherwise a failed
            // startup would leave slots reserved until ttl expiry.
            if let Some(err) = first_err {
                self.release_all(winners).await;
                return Err(AllocateError::Backend(err));
            }
            if cancel.is_cancelled() {
                self.release_all(winners).await;
                return Err(AllocateError::Cancelled);
            }

            if !winners.is_empty() {
                let min_index = winners
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, (id, _))| *id)
                    .map(|(index, _)| index)
                    .unwrap_or(0);
                let (worker_id, handle) = winners.swap_remove(min_index);
                self.release_all(winners).await;

                let acquired_at = Instant::now();
                info!(
                    app_name = %self.options.app_name,
                    worker_id,
                    owner_token = %self.owner_token,
                    "worker id allocated"
                );
                return Ok(WorkerIdClaim {
                    worker_id,
                    owner_token: self.owner_token.to_string(),
                    handle,
                    acquired_at,
                    expires_at: acquired_at + self.options.ttl,
                });
            }

            start = end;
        }

        Err(AllocateError::SpaceExhausted {
            app_name: self.options.app_name.clone(),
            capacity,
        })
    }

    /// Releases every surplus win from a batch. Failures are logged and
    /// otherwise ignored; an unreleased surplus claim expires with its
    /// ttl.
    async fn release_all(&self, winners: Vec<(u32, B::Handle)>) {
        let releases = winners.into_iter().map(|(id, handle)| async move {
            if let Err(err) = self.backend.release(&handle).await {
                warn!(
                    app_name = %self.options.app_name,
                    worker_id = id,
                    error = %err,
                    "failed to release surplus claim"
                );
            }
        });
        future::join_all(releases).await;
    }
}
