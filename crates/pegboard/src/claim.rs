//! The claim record produced by allocation.

use tokio::time::Instant;

/// An exclusively-owned worker id, as won from the backend.
///
/// Created once by the allocator; `expires_at` is extended only by the
/// keep-alive loop. The claim is destroyed either by an explicit release
/// on graceful shutdown or passively, backend-side, when the ttl elapses
/// after a crash.
#[derive(Debug, Clone)]
pub struct WorkerIdClaim<H> {
    /// The won id, in `[0, 2^id_bits)`.
    pub worker_id: u32,
    /// Token identifying the owning process.
    pub owner_token: String,
    /// Backend lease handle used to renew and release.
    pub handle: H,
    /// When the claim was won.
    pub acquired_at: Instant,
    /// When the backend will expire the claim absent renewal.
    pub expires_at: Instant,
}
