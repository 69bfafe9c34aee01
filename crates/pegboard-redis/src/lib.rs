//! Redis realization of the pegboard
//! [`CoordinationBackend`](pegboard::CoordinationBackend) contract.
//!
//! - **Claim**: `SET key owner NX PX ttl_ms`: create-if-absent with a
//!   millisecond expiry, atomic by construction.
//! - **Renew**: a Lua compare-and-expire script that extends the expiry
//!   only while the key still carries this owner's token. A script result
//!   of "not yours" is a definitive conflict; IO errors are transient.
//! - **Release**: a Lua compare-and-delete script, so a release through a
//!   stale handle can never evict the key's new owner.
//!
//! The [`MultiplexedConnection`](redis::aio::MultiplexedConnection) is
//! cheap to clone and safe to share, so one [`RedisBackend`] can serve
//! every slot in the process.

mod backend;

pub use crate::backend::*;
