//! etcd realization of the pegboard
//! [`CoordinationBackend`](pegboard::CoordinationBackend) contract.
//!
//! - **Claim**: grant a lease of the claim ttl, then a single transaction
//!   that puts the key bound to the lease only if the key's create
//!   revision is zero (the key does not exist). Losing the transaction
//!   revokes the just-granted lease so it never dangles.
//! - **Renew**: drive the lease keep-alive once, then verify the key still
//!   carries this owner's token. A dead lease or a foreign token is a
//!   definitive conflict; transport errors are transient.
//! - **Release**: delete the key and revoke the lease, best-effort.

mod backend;

pub use crate::backend::*;
