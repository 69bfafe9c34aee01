use core::time::Duration;

use etcd_client::{Client, Compare, CompareOp, PutOptions, Txn, TxnOp};
use pegboard::{BackendError, CoordinationBackend, RenewError};
use tokio::sync::Mutex;
use tracing::trace;

/// Lease handle for [`EtcdBackend`]: the key, the owner token stored as
/// its value, and the etcd lease id the key is bound to.
#[derive(Debug, Clone)]
pub struct EtcdHandle {
    key: String,
    owner_token: String,
    lease_id: i64,
}

impl EtcdHandle {
    /// The claimed key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The etcd lease the key is bound to.
    pub fn lease_id(&self) -> i64 {
        self.lease_id
    }
}

/// etcd-backed coordination: lease-bound keys claimed through a
/// create-revision transaction.
///
/// The client is wrapped in an async mutex because `etcd_client` operations
/// take `&mut self`; renewals for a claim are strictly sequential anyway,
/// and the allocation scan's batches are short-lived.
///
/// # Example
/// ```no_run
/// use pegboard::{AllocatorOptions, WorkerSlot};
/// use pegboard_etcd::EtcdBackend;
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = EtcdBackend::connect(&["http://127.0.0.1:2379"]).await?;
/// let slot = WorkerSlot::acquire(backend, AllocatorOptions::new("orders")).await?;
/// println!("worker id: {}", slot.worker_id());
/// # Ok(())
/// # }
/// ```
pub struct EtcdBackend {
    client: Mutex<Client>,
}

impl EtcdBackend {
    /// Connects to the given endpoints.
    pub async fn connect<E: AsRef<str>>(endpoints: &[E]) -> Result<Self, BackendError> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|err| BackendError::with_source("failed to connect to etcd", err))?;
        Ok(Self::new(client))
    }

    /// Wraps an existing client. The client may be shared with unrelated
    /// components; this backend only ever touches its claim keys and the
    /// leases it grants.
    pub fn new(client: Client) -> Self {
        Self {
            client: Mutex::new(client),
        }
    }
}

/// etcd grants are whole seconds; claims shorter than a second still get
/// one.
fn ttl_seconds(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX).max(1)
}

fn transient(context: String, err: etcd_client::Error) -> RenewError {
    RenewError::Transient(BackendError::with_source(context, err))
}

impl CoordinationBackend for EtcdBackend {
    type Handle = EtcdHandle;

    fn atomic_claim(
        &self,
        key: &str,
        owner_token: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<Option<Self::Handle>, BackendError>> + Send {
        let ttl_secs = ttl_seconds(ttl);
        async move {
            let mut client = self.client.lock().await;
            let lease = client
                .lease_grant(ttl_secs, None)
                .await
                .map_err(|err| BackendError::with_source("lease grant failed", err))?;
            let lease_id = lease.id();

            let txn = Txn::new()
                .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
                .and_then(vec![TxnOp::put(
                    key,
                    owner_token,
                    Some(PutOptions::new().with_lease(lease_id)),
                )]);
            let outcome = match client.txn(txn).await {
                Ok(response) => Ok(response.succeeded()),
                Err(err) => Err(BackendError::with_source(
                    format!("claim transaction failed for '{key}'"),
                    err,
                )),
            };

            match outcome {
                Ok(true) => {
                    trace!(key, lease_id, "claimed");
                    Ok(Some(EtcdHandle {
                        key: key.to_string(),
                        owner_token: owner_token.to_string(),
                        lease_id,
                    }))
                }
                // Key already exists, or the transaction never ran: either
                // way the fresh lease must not dangle.
                Ok(false) => {
                    let _ = client.lease_revoke(lease_id).await;
                    Ok(None)
                }
                Err(err) => {
                    let _ = client.lease_revoke(lease_id).await;
                    Err(err)
                }
            }
        }
    }

    fn renew(&self, handle: &Self::Handle) -> impl Future<Output = Result<(), RenewError>> + Send {
        async move {
            let mut client = self.client.lock().await;
            let (mut keeper, mut stream) = client
                .lease_keep_alive(handle.lease_id)
                .await
                .map_err(|err| transient("keep-alive channel failed".to_string(), err))?;
            keeper
                .keep_alive()
                .await
                .map_err(|err| transient("keep-alive send failed".to_string(), err))?;
            match stream
                .message()
                .await
                .map_err(|err| transient("keep-alive receive failed".to_string(), err))?
            {
                Some(response) if response.ttl() > 0 => {}
                Some(_) => {
                    // etcd answers a dead lease with ttl 0 instead of an
                    // error.
                    return Err(RenewError::Conflict {
                        context: format!("lease {} expired or was revoked", handle.lease_id),
                    });
                }
                None => {
                    return Err(RenewError::Transient(BackendError::new(
                        "keep-alive stream closed without a response",
                    )));
                }
            }

            // The lease being alive is necessary but not sufficient: an
            // external actor may have deleted and re-created the key while
            // our lease survived. Verify the stored token is still ours.
            let response = client
                .get(handle.key.as_str(), None)
                .await
                .map_err(|err| transient(format!("get failed for '{}'", handle.key), err))?;
            match response.kvs().first() {
                Some(kv) if kv.value() == handle.owner_token.as_bytes() => {
                    trace!(key = %handle.key, "renewed");
                    Ok(())
                }
                Some(_) => Err(RenewError::Conflict {
                    context: format!("'{}' is held by another owner", handle.key),
                }),
                None => Err(RenewError::Conflict {
                    context: format!("'{}' was deleted", handle.key),
                }),
            }
        }
    }

    fn release(
        &self,
        handle: &Self::Handle,
    ) -> impl Future<Output = Result<(), BackendError>> + Send {
        async move {
            let mut client = self.client.lock().await;
            // Revoking the lease also deletes every key bound to it, which
            // covers the claim key; the explicit delete would race a new
            // owner's claim, so ownership is checked by leaving deletion
            // to the lease binding.
            client
                .lease_revoke(handle.lease_id)
                .await
                .map_err(|err| {
                    BackendError::with_source(
                        format!("lease revoke failed for '{}'", handle.key),
                        err,
                    )
                })?;
            trace!(key = %handle.key, lease_id = handle.lease_id, "released");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pegboard::{AllocatorOptions, WorkerSlot};

    #[test]
    fn grants_are_whole_seconds_with_a_floor() {
        assert_eq!(ttl_seconds(Duration::from_secs(60)), 60);
        assert_eq!(ttl_seconds(Duration::from_millis(200)), 1);
    }

    #[tokio::test]
    #[ignore = "requires an etcd server at http://127.0.0.1:2379"]
    async fn claim_renew_release_round_trip() {
        let backend = EtcdBackend::connect(&["http://127.0.0.1:2379"])
            .await
            .expect("etcd reachable");
        let options = AllocatorOptions::new("pegboard-etcd-it").with_id_bits(2);

        let slot = WorkerSlot::acquire(backend, options)
            .await
            .expect("allocation succeeds");
        assert!(slot.is_healthy());
        slot.shutdown().await;
    }
}
