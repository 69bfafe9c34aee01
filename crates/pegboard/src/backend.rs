//! The capability contract a coordination backend must provide.
//!
//! Worker-id exclusivity is never enforced by this crate alone: it rides
//! entirely on the backend's own atomic-claim primitive (etcd transactions,
//! Consul session CAS, Redis `SET NX`). The contract is three operations
//! over an opaque lease handle; the allocation/renewal/health state
//! machine on top of it is shared across every adapter.

use core::time::Duration;
use std::sync::Arc;

use crate::error::{BackendError, RenewError};

/// A time-bounded, exclusively-owned claim on one key, realized by a
/// backend lease/session.
///
/// Implemented via an associated type so each adapter can carry whatever
/// it needs to renew and release without re-deriving it (Redis: key +
/// owner token; etcd: key + lease id).
pub trait CoordinationBackend: Send + Sync {
    /// Backend-specific lease handle, captured at claim time.
    type Handle: Clone + Send + Sync + 'static;

    /// Creates `key` bound to a fresh lease of `ttl`, only if the key is
    /// absent. Atomicity is mandatory: among concurrent callers for one
    /// key, at most one may receive `Some`.
    ///
    /// Returns `Ok(None)` when the key is already held, which is an
    /// ordinary outcome during the allocation scan, not an error.
    fn atomic_claim(
        &self,
        key: &str,
        owner_token: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<Option<Self::Handle>, BackendError>> + Send;

    /// Extends the lease behind `handle`, only while the key is still
    /// owned by it.
    ///
    /// Implementations must distinguish "not mine anymore"
    /// ([`RenewError::Conflict`]) from "network blip"
    /// ([`RenewError::Transient`]); the keep-alive loop escalates the
    /// former immediately and retries the latter within budget.
    fn renew(&self, handle: &Self::Handle) -> impl Future<Output = Result<(), RenewError>> + Send;

    /// Best-effort removal of the key and its lease. Callers log failures
    /// and move on; they never propagate them.
    fn release(
        &self,
        handle: &Self::Handle,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;
}

/// Backends are commonly shared process-wide; delegating through `Arc`
/// lets several slots (different app names) reuse one client.
impl<B: CoordinationBackend> CoordinationBackend for Arc<B> {
    type Handle = B::Handle;

    fn atomic_claim(
        &self,
        key: &str,
        owner_token: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<Option<Self::Handle>, BackendError>> + Send {
        (**self).atomic_claim(key, owner_token, ttl)
    }

    fn renew(&self, handle: &Self::Handle) -> impl Future<Output = Result<(), RenewError>> + Send {
        (**self).renew(handle)
    }

    fn release(
        &self,
        handle: &Self::Handle,
    ) -> impl Future<Output = Result<(), BackendError>> + Send {
        (**self).release(handle)
    }
}
