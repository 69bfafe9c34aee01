//! In-process coordination backend.
//!
//! `MemoryBackend` realizes the full [`CoordinationBackend`] contract
//! against a mutexed map, which makes it the conformance reference for the
//! real adapters and the workhorse of this crate's test-suite. It is also
//! usable on its own for single-process deployments that want the
//! allocation semantics without external infrastructure.
//!
//! Chaos knobs (`set_offline`, `steal`, `evict`) exist so tests can drive
//! the partition and theft scenarios the keep-alive loop must survive.

use core::time::Duration;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Mutex, PoisonError};

use tokio::time::Instant;

use crate::backend::CoordinationBackend;
use crate::error::{BackendError, RenewError};

#[derive(Debug)]
struct MemorySlot {
    owner: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct MemoryState {
    slots: HashMap<String, MemorySlot>,
    offline: bool,
}

/// Lease handle for [`MemoryBackend`]: the key plus the owner token it was
/// claimed with, so renewal can verify ownership.
#[derive(Debug, Clone)]
pub struct MemoryHandle {
    key: String,
    owner: String,
    ttl: Duration,
}

impl MemoryHandle {
    /// The claimed key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Map-backed [`CoordinationBackend`] with ttl expiry.
///
/// Expiry is passive: a slot past its deadline is treated as absent by
/// `atomic_claim` and as lost by `renew`, mirroring how a real backend
/// reclaims unrenewed leases. Uses [`tokio::time::Instant`], so paused-time
/// tests can advance the clock deterministically.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

enum RenewVerdict {
    Renewed,
    Expired,
    OtherOwner,
    Gone,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates a backend partition: while offline, every operation fails
    /// with a transient error.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Hands `key` to a different owner, as an external actor would.
    /// The next renewal through the original handle reports a conflict.
    pub fn steal(&self, key: &str, new_owner: &str) {
        let mut state = self.lock();
        state.slots.insert(
            key.to_string(),
            MemorySlot {
                owner: new_owner.to_string(),
                expires_at: Instant::now() + Duration::from_secs(3600),
            },
        );
    }

    /// Deletes `key` outright, as an external actor would.
    pub fn evict(&self, key: &str) {
        self.lock().slots.remove(key);
    }

    /// Current owner token of `key`, if claimed and unexpired.
    pub fn owner_of(&self, key: &str) -> Option<String> {
        let state = self.lock();
        state
            .slots
            .get(key)
            .filter(|slot| slot.expires_at > Instant::now())
            .map(|slot| slot.owner.clone())
    }

    /// Number of live (unexpired) claims.
    pub fn claimed(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .slots
            .values()
            .filter(|slot| slot.expires_at > now)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CoordinationBackend for MemoryBackend {
    type Handle = MemoryHandle;

    fn atomic_claim(
        &self,
        key: &str,
        owner_token: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<Option<Self::Handle>, BackendError>> + Send {
        let outcome = {
            let mut state = self.lock();
            if state.offline {
                Err(BackendError::new("memory backend offline"))
            } else {
                let now = Instant::now();
                let slot = MemorySlot {
                    owner: owner_token.to_string(),
                    expires_at: now + ttl,
                };
                match state.slots.entry(key.to_string()) {
                    Entry::Occupied(mut occupied) => {
                        if occupied.get().expires_at <= now {
                            // Unrenewed claim from a dead process; reclaim.
                            occupied.insert(slot);
                            Ok(true)
                        } else {
                            Ok(false)
                        }
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(slot);
                        Ok(true)
                    }
                }
            }
        };
        let handle = outcome.map(|won| {
            won.then(|| MemoryHandle {
                key: key.to_string(),
                owner: owner_token.to_string(),
                ttl,
            })
        });
        async move { handle }
    }

    fn renew(&self, handle: &Self::Handle) -> impl Future<Output = Result<(), RenewError>> + Send {
        let outcome = {
            let mut state = self.lock();
            if state.offline {
                Err(RenewError::Transient(BackendError::new(
                    "memory backend offline",
                )))
            } else {
                let now = Instant::now();
                let verdict = match state.slots.get_mut(&handle.key) {
                    Some(slot) if slot.owner != handle.owner => RenewVerdict::OtherOwner,
                    Some(slot) if slot.expires_at <= now => RenewVerdict::Expired,
                    Some(slot) => {
                        slot.expires_at = now + handle.ttl;
                        RenewVerdict::Renewed
                    }
                    None => RenewVerdict::Gone,
                };
                match verdict {
                    RenewVerdict::Renewed => Ok(()),
                    RenewVerdict::Expired => {
                        state.slots.remove(&handle.key);
                        Err(RenewError::Conflict {
                            context: format!("lease on '{}' expired", handle.key),
                        })
                    }
                    RenewVerdict::OtherOwner => Err(RenewError::Conflict {
                        context: format!("'{}' is held by another owner", handle.key),
                    }),
                    RenewVerdict::Gone => Err(RenewError::Conflict {
                        context: format!("'{}' is no longer present", handle.key),
                    }),
                }
            }
        };
        async move { outcome }
    }

    fn release(
        &self,
        handle: &Self::Handle,
    ) -> impl Future<Output = Result<(), BackendError>> + Send {
        let outcome = {
            let mut state = self.lock();
            if state.offline {
                Err(BackendError::new("memory backend offline"))
            } else {
                // Only the owner's release removes the key; releasing a
                // stolen key must not evict the new owner.
                let owned = state
                    .slots
                    .get(&handle.key)
                    .is_some_and(|slot| slot.owner == handle.owner);
                if owned {
                    state.slots.remove(&handle.key);
                }
                Ok(())
            }
        };
        async move { outcome }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn claim_is_exclusive_until_released() {
        let backend = MemoryBackend::new();
        let handle = backend.atomic_claim("k/a/0", "me", TTL).await.unwrap();
        let handle = handle.expect("first claim wins");

        assert!(
            backend
                .atomic_claim("k/a/0", "you", TTL)
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(backend.owner_of("k/a/0").as_deref(), Some("me"));

        backend.release(&handle).await.unwrap();
        assert_eq!(backend.claimed(), 0);
        assert!(
            backend
                .atomic_claim("k/a/0", "you", TTL)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_claim_is_reclaimable_and_unrenewable() {
        let backend = MemoryBackend::new();
        let handle = backend
            .atomic_claim("k/a/1", "me", TTL)
            .await
            .unwrap()
            .unwrap();

        tokio::time::advance(TTL + Duration::from_secs(1)).await;

        let err = backend.renew(&handle).await.unwrap_err();
        assert!(matches!(err, RenewError::Conflict { .. }));
        assert!(
            backend
                .atomic_claim("k/a/1", "you", TTL)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn stolen_key_conflicts_and_survives_release() {
        let backend = MemoryBackend::new();
        let handle = backend
            .atomic_claim("k/a/2", "me", TTL)
            .await
            .unwrap()
            .unwrap();

        backend.steal("k/a/2", "intruder");
        let err = backend.renew(&handle).await.unwrap_err();
        assert!(matches!(err, RenewError::Conflict { .. }));

        // Releasing through the stale handle must not evict the thief.
        backend.release(&handle).await.unwrap();
        assert_eq!(backend.owner_of("k/a/2").as_deref(), Some("intruder"));
    }

    #[tokio::test]
    async fn offline_is_transient() {
        let backend = MemoryBackend::new();
        let handle = backend
            .atomic_claim("k/a/3", "me", TTL)
            .await
            .unwrap()
            .unwrap();

        backend.set_offline(true);
        assert!(backend.atomic_claim("k/a/4", "me", TTL).await.is_err());
        let err = backend.renew(&handle).await.unwrap_err();
        assert!(matches!(err, RenewError::Transient(_)));

        backend.set_offline(false);
        assert!(backend.renew(&handle).await.is_ok());
    }
}
