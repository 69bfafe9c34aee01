//! Distributed worker-id leasing for Snowflake-style ID generators.
//!
//! A Snowflake encoder needs a process-unique worker id. The encoding is
//! trivial; the hard part is safely allocating a small integer in
//! `[0, 2^bits)` exclusively to one live process among many, noticing when
//! that exclusivity is lost, and recovering gracefully. `pegboard` does
//! exactly that against a pluggable [`CoordinationBackend`]:
//!
//! - [`WorkerIdAllocator`] scans the candidate space at startup and wins
//!   exactly one id via the backend's atomic-claim primitive.
//! - A keep-alive task renews the claim every `refresh_interval` until
//!   cancellation or conflict.
//! - [`HealthState`] surfaces `Healthy`/`Degraded`/`Unhealthy` to a
//!   health-check aggregator; a conflicted slot stays unhealthy for the
//!   rest of the process lifetime.
//! - [`WorkerSlot::shutdown`] releases the claim on graceful termination
//!   so the slot frees immediately instead of waiting out the ttl.
//!
//! Backend adapters live in sibling crates (`pegboard-redis`,
//! `pegboard-etcd`); [`MemoryBackend`] ships here for tests and
//! single-process embeddings.
//!
//! # Example
//!
//! ```no_run
//! use pegboard::{AllocatorOptions, MemoryBackend, WorkerSlot};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), pegboard::AllocateError> {
//! let backend = Arc::new(MemoryBackend::new());
//! let slot = WorkerSlot::acquire(backend, AllocatorOptions::new("orders")).await?;
//!
//! // Feed the id to a Snowflake encoder; gate minting on health.
//! let worker_id = slot.worker_id();
//! assert!(slot.is_healthy());
//!
//! slot.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod allocator;
mod backend;
mod claim;
mod error;
mod health;
mod identity;
mod keepalive;
mod memory;
mod options;
mod slot;
#[cfg(test)]
mod tests;

pub use crate::allocator::*;
pub use crate::backend::*;
pub use crate::claim::*;
pub use crate::error::*;
pub use crate::health::*;
pub use crate::identity::*;
pub use crate::keepalive::ConflictObserver;
pub use crate::memory::*;
pub use crate::options::*;
pub use crate::slot::*;
