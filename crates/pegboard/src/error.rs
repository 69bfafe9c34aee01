//! Error types for worker-id leasing.
//!
//! This module defines the full error surface of the crate:
//!
//! - [`BackendError`]: A coordination backend call failed outright.
//! - [`RenewError`]: The renew-path split between "not mine anymore" and
//!   "network blip" that the keep-alive loop depends on.
//! - [`AllocateError`]: Fatal startup failures of the allocation scan.
//! - [`WorkerIdConflictError`]: Confirmed loss of exclusive ownership,
//!   raised exactly once per process instance.

/// A coordination backend call failed.
///
/// Carries a human-readable context plus the backend client error that
/// caused it, when one exists. At startup this is fatal; during keep-alive
/// it is wrapped in [`RenewError::Transient`] and retried within budget.
#[derive(Debug, thiserror::Error)]
#[error("{context}")]
pub struct BackendError {
    context: String,
    #[source]
    source: Option<Box<dyn core::error::Error + Send + Sync>>,
}

impl BackendError {
    /// Creates an error from a bare description.
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            source: None,
        }
    }

    /// Creates an error wrapping the underlying backend client error.
    pub fn with_source(
        context: impl Into<String>,
        source: impl core::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Outcome classification for a failed lease renewal.
///
/// Backends must distinguish the two cases: a [`RenewError::Conflict`]
/// means the lease or key is definitively no longer ours and the caller
/// escalates immediately, while a [`RenewError::Transient`] is retried on
/// the next refresh interval until the failure budget runs out.
#[derive(Debug, thiserror::Error)]
pub enum RenewError {
    /// The key or lease is no longer owned by this handle.
    #[error("lease no longer owned: {context}")]
    Conflict { context: String },

    /// The backend was unreachable or failed in a way that may recover.
    #[error("transient renew failure: {0}")]
    Transient(#[from] BackendError),
}

/// Fatal failures of the startup allocation scan.
///
/// None of these are retried internally. The caller is expected to
/// propagate them so the process fails fast instead of serving traffic
/// without a valid worker id; restart policy belongs to the supervisor.
#[derive(Debug, thiserror::Error)]
pub enum AllocateError {
    /// Every candidate id in `[0, capacity)` is currently claimed.
    #[error("all {capacity} worker ids for app '{app_name}' are claimed")]
    SpaceExhausted { app_name: String, capacity: u32 },

    /// The backend was unreachable while scanning.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The shutdown signal fired before a worker id was claimed.
    #[error("allocation cancelled before a worker id was claimed")]
    Cancelled,

    /// The allocator options failed validation.
    #[error("invalid allocator options: {reason}")]
    Misconfigured { reason: String },
}

/// Exclusive ownership of a claimed worker id was lost.
///
/// Raised exactly once per process instance, after which the health state
/// is pinned to the configured unhealthy status and the keep-alive loop
/// stops. The process keeps running; recovery requires a restart and a
/// fresh allocation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("worker id {worker_id} for app '{app_name}' is no longer owned by '{owner_token}'")]
pub struct WorkerIdConflictError {
    pub app_name: String,
    pub worker_id: u32,
    pub owner_token: String,
}
