//! Allocator configuration.

use core::time::Duration;

use crate::error::AllocateError;
use crate::health::HealthStatus;

/// Health status a worker slot reports after confirmed loss of ownership.
///
/// This is deployment policy, not backend logic: a `Degraded` instance can
/// keep serving read-only traffic behind a readiness gate, while an
/// `Unhealthy` one is expected to be restarted by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UnhealthyStatus {
    /// Report [`HealthStatus::Degraded`] on conflict.
    Degraded,
    /// Report [`HealthStatus::Unhealthy`] on conflict.
    #[default]
    Unhealthy,
}

impl UnhealthyStatus {
    /// The [`HealthStatus`] this policy maps to.
    pub fn as_status(self) -> HealthStatus {
        match self {
            Self::Degraded => HealthStatus::Degraded,
            Self::Unhealthy => HealthStatus::Unhealthy,
        }
    }
}

/// Configuration for one worker-slot instance.
///
/// Construct with [`AllocatorOptions::new`] and override defaults with the
/// `with_*` methods. Validation happens once, up front, in
/// [`AllocatorOptions::validate`]; a misconfigured instance fails fast
/// instead of misbehaving at renewal time.
///
/// # Example
/// ```
/// use core::time::Duration;
/// use pegboard::AllocatorOptions;
///
/// let options = AllocatorOptions::new("billing")
///     .with_id_bits(10)
///     .with_ttl(Duration::from_secs(30))
///     .with_refresh_interval(Duration::from_secs(10));
/// assert!(options.validate().is_ok());
/// assert_eq!(options.capacity(), 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AllocatorOptions {
    /// Logical application namespace. Claims from different apps never
    /// contend with each other.
    pub app_name: String,
    /// Width of the worker-id field in the downstream Snowflake layout.
    /// Candidate ids span `[0, 2^id_bits)`.
    pub id_bits: u8,
    /// Leading segment of every claim key.
    pub key_prefix: String,
    /// How long a claim survives in the backend without renewal. Bounds
    /// how long a crashed process's slot stays reserved.
    pub ttl: Duration,
    /// Interval between renewals. Bounds detection latency for lost
    /// ownership. Must be strictly below `ttl`; Ttl/2..Ttl/3 is the
    /// recommended band.
    pub refresh_interval: Duration,
    /// Health status reported after confirmed loss of ownership.
    pub unhealthy_status: UnhealthyStatus,
    /// Number of candidate ids probed concurrently per scan batch.
    pub claim_batch_size: usize,
    /// Slice of the ttl reserved for escalation: transient renew failures
    /// are retried only while `ttl - safety_margin` has not elapsed.
    pub safety_margin: Duration,
}

const DEFAULT_ID_BITS: u8 = 12;
const DEFAULT_KEY_PREFIX: &str = "pegboard";
const DEFAULT_TTL: Duration = Duration::from_secs(60);
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(20);
const DEFAULT_CLAIM_BATCH_SIZE: usize = 16;
const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(5);

/// Widest supported worker-id field. Wider fields stop fitting a 64-bit
/// Snowflake layout alongside a millisecond timestamp and a sequence.
const MAX_ID_BITS: u8 = 16;

impl AllocatorOptions {
    /// Creates options for `app_name` with the default 12-bit id space
    /// (ids 0..4095), a 60s ttl and a 20s refresh interval.
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            id_bits: DEFAULT_ID_BITS,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            ttl: DEFAULT_TTL,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            unhealthy_status: UnhealthyStatus::default(),
            claim_batch_size: DEFAULT_CLAIM_BATCH_SIZE,
            safety_margin: DEFAULT_SAFETY_MARGIN,
        }
    }

    /// Sets the worker-id field width (1..=16 bits).
    pub fn with_id_bits(mut self, id_bits: u8) -> Self {
        self.id_bits = id_bits;
        self
    }

    /// Sets the claim key prefix.
    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    /// Sets the claim ttl.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the renewal interval.
    pub fn with_refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.refresh_interval = refresh_interval;
        self
    }

    /// Sets the post-conflict health status.
    pub fn with_unhealthy_status(mut self, unhealthy_status: UnhealthyStatus) -> Self {
        self.unhealthy_status = unhealthy_status;
        self
    }

    /// Sets the per-batch claim concurrency.
    pub fn with_claim_batch_size(mut self, claim_batch_size: usize) -> Self {
        self.claim_batch_size = claim_batch_size;
        self
    }

    /// Sets the escalation safety margin.
    pub fn with_safety_margin(mut self, safety_margin: Duration) -> Self {
        self.safety_margin = safety_margin;
        self
    }

    /// Number of candidate worker ids, `2^id_bits`.
    pub fn capacity(&self) -> u32 {
        1u32 << u32::from(self.id_bits)
    }

    /// Backend key for one candidate id:
    /// `"{key_prefix}/{app_name}/{worker_id}"`.
    pub fn claim_key(&self, worker_id: u32) -> String {
        format!("{}/{}/{}", self.key_prefix, self.app_name, worker_id)
    }

    /// Consecutive transient renew failures tolerated before the conflict
    /// path is taken: `floor((ttl - safety_margin) / refresh_interval)`,
    /// never below one.
    pub fn max_refresh_failures(&self) -> u32 {
        let window = self.ttl.saturating_sub(self.safety_margin);
        let interval = self.refresh_interval.as_millis().max(1);
        u32::try_from(window.as_millis() / interval)
            .unwrap_or(u32::MAX)
            .max(1)
    }

    /// Validates the options, returning [`AllocateError::Misconfigured`]
    /// describing the first violation found.
    pub fn validate(&self) -> Result<(), AllocateError> {
        if self.app_name.is_empty() {
            return Err(misconfigured("app_name must not be empty"));
        }
        if self.id_bits == 0 || self.id_bits > MAX_ID_BITS {
            return Err(misconfigured(format!(
                "id_bits must be in 1..={MAX_ID_BITS}, got {}",
                self.id_bits
            )));
        }
        if self.refresh_interval.is_zero() {
            return Err(misconfigured("refresh_interval must be non-zero"));
        }
        if self.refresh_interval >= self.ttl {
            return Err(misconfigured(format!(
                "refresh_interval ({:?}) must be strictly below ttl ({:?})",
                self.refresh_interval, self.ttl
            )));
        }
        if self.safety_margin >= self.ttl {
            return Err(misconfigured(format!(
                "safety_margin ({:?}) must be below ttl ({:?})",
                self.safety_margin, self.ttl
            )));
        }
        if self.claim_batch_size == 0 {
            return Err(misconfigured("claim_batch_size must be at least 1"));
        }
        Ok(())
    }
}

fn misconfigured(reason: impl Into<String>) -> AllocateError {
    AllocateError::Misconfigured {
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let options = AllocatorOptions::new("orders");
        assert!(options.validate().is_ok());
        assert_eq!(options.capacity(), 4096);
        assert_eq!(options.claim_key(7), "pegboard/orders/7");
    }

    #[test]
    fn rejects_empty_app_name() {
        let err = AllocatorOptions::new("").validate().unwrap_err();
        assert!(matches!(err, AllocateError::Misconfigured { .. }));
    }

    #[test]
    fn rejects_bad_id_bits() {
        assert!(
            AllocatorOptions::new("a")
                .with_id_bits(0)
                .validate()
                .is_err()
        );
        assert!(
            AllocatorOptions::new("a")
                .with_id_bits(17)
                .validate()
                .is_err()
        );
        assert!(
            AllocatorOptions::new("a")
                .with_id_bits(16)
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn rejects_refresh_at_or_above_ttl() {
        let options = AllocatorOptions::new("a")
            .with_ttl(Duration::from_secs(10))
            .with_refresh_interval(Duration::from_secs(10));
        assert!(options.validate().is_err());

        let options = AllocatorOptions::new("a")
            .with_ttl(Duration::from_secs(10))
            .with_refresh_interval(Duration::from_secs(15));
        assert!(options.validate().is_err());
    }

    #[test]
    fn refresh_failure_budget() {
        let options = AllocatorOptions::new("a")
            .with_ttl(Duration::from_secs(10))
            .with_refresh_interval(Duration::from_secs(5))
            .with_safety_margin(Duration::ZERO);
        assert_eq!(options.max_refresh_failures(), 2);

        // The budget never drops to zero, even with an aggressive margin.
        let options = AllocatorOptions::new("a")
            .with_ttl(Duration::from_secs(10))
            .with_refresh_interval(Duration::from_secs(5))
            .with_safety_margin(Duration::from_secs(9));
        assert_eq!(options.max_refresh_failures(), 1);
    }
}
