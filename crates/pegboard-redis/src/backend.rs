use core::time::Duration;

use pegboard::{BackendError, CoordinationBackend, RenewError};
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use tracing::trace;

/// Extends the expiry only while the key still carries the caller's owner
/// token. Returns 1 on success, -1 when the key is absent or owned by
/// someone else.
const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return -1
end
"#;

/// Deletes the key only while it still carries the caller's owner token.
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Lease handle for [`RedisBackend`]: the key, the owner token the claim
/// was made under, and the ttl to re-arm on every renewal.
#[derive(Debug, Clone)]
pub struct RedisHandle {
    key: String,
    owner_token: String,
    ttl_ms: u64,
}

impl RedisHandle {
    /// The claimed key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Redis-backed coordination: `SET NX PX` claims with scripted
/// compare-and-expire renewal.
///
/// # Example
/// ```no_run
/// use pegboard::{AllocatorOptions, WorkerSlot};
/// use pegboard_redis::RedisBackend;
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = RedisBackend::connect("redis://127.0.0.1:6379").await?;
/// let slot = WorkerSlot::acquire(backend, AllocatorOptions::new("orders")).await?;
/// println!("worker id: {}", slot.worker_id());
/// # Ok(())
/// # }
/// ```
pub struct RedisBackend {
    conn: MultiplexedConnection,
    renew: Script,
    release: Script,
}

impl RedisBackend {
    /// Connects to `url` and wraps the resulting multiplexed connection.
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        let client = Client::open(url)
            .map_err(|err| BackendError::with_source("invalid redis url", err))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| BackendError::with_source("failed to connect to redis", err))?;
        Ok(Self::new(conn))
    }

    /// Wraps an existing connection. The connection may be shared with
    /// unrelated components; this backend only ever touches its claim
    /// keys.
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            renew: Script::new(RENEW_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

impl CoordinationBackend for RedisBackend {
    type Handle = RedisHandle;

    fn atomic_claim(
        &self,
        key: &str,
        owner_token: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<Option<Self::Handle>, BackendError>> + Send {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        let owner_token = owner_token.to_string();
        let ttl_ms = ttl_millis(ttl);
        async move {
            let reply: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&owner_token)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await
                .map_err(|err| {
                    BackendError::with_source(format!("SET NX failed for '{key}'"), err)
                })?;
            // SET .. NX replies OK on success and nil when the key exists.
            match reply {
                Some(_) => {
                    trace!(key = %key, "claimed");
                    Ok(Some(RedisHandle {
                        key,
                        owner_token,
                        ttl_ms,
                    }))
                }
                None => Ok(None),
            }
        }
    }

    fn renew(&self, handle: &Self::Handle) -> impl Future<Output = Result<(), RenewError>> + Send {
        let mut conn = self.conn.clone();
        let script = &self.renew;
        async move {
            let verdict: i64 = script
                .key(&handle.key)
                .arg(&handle.owner_token)
                .arg(handle.ttl_ms)
                .invoke_async(&mut conn)
                .await
                .map_err(|err| {
                    RenewError::Transient(BackendError::with_source(
                        format!("renew script failed for '{}'", handle.key),
                        err,
                    ))
                })?;
            if verdict == 1 {
                trace!(key = %handle.key, "renewed");
                Ok(())
            } else {
                Err(RenewError::Conflict {
                    context: format!("'{}' is absent or held by another owner", handle.key),
                })
            }
        }
    }

    fn release(
        &self,
        handle: &Self::Handle,
    ) -> impl Future<Output = Result<(), BackendError>> + Send {
        let mut conn = self.conn.clone();
        let script = &self.release;
        async move {
            let _deleted: i64 = script
                .key(&handle.key)
                .arg(&handle.owner_token)
                .invoke_async(&mut conn)
                .await
                .map_err(|err| {
                    BackendError::with_source(
                        format!("release script failed for '{}'", handle.key),
                        err,
                    )
                })?;
            trace!(key = %handle.key, "released");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pegboard::{AllocatorOptions, WorkerSlot};

    #[test]
    fn ttl_conversion_saturates() {
        assert_eq!(ttl_millis(Duration::from_secs(60)), 60_000);
        assert_eq!(ttl_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn scripts_verify_ownership_before_mutating() {
        assert!(RENEW_SCRIPT.contains("GET"));
        assert!(RENEW_SCRIPT.contains("PEXPIRE"));
        assert!(RELEASE_SCRIPT.contains("DEL"));
    }

    #[tokio::test]
    #[ignore = "requires a redis server at redis://127.0.0.1:6379"]
    async fn claim_renew_release_round_trip() {
        let backend = RedisBackend::connect("redis://127.0.0.1:6379")
            .await
            .expect("redis reachable");
        let options = AllocatorOptions::new("pegboard-redis-it").with_id_bits(2);

        let slot = WorkerSlot::acquire(backend, options)
            .await
            .expect("allocation succeeds");
        assert!(slot.is_healthy());
        slot.shutdown().await;
    }
}
