//! Tri-state health surfaced to a liveness/readiness aggregator.
//!
//! Health starts `Healthy` and moves at most once, to `Degraded` or
//! `Unhealthy`, when the keep-alive loop confirms loss of ownership. It
//! never reverts within a process lifetime: a conflicted worker id stays
//! poisoned until the process restarts and allocates fresh.

use std::sync::Arc;

use portable_atomic::{AtomicU8, Ordering};

use crate::options::UnhealthyStatus;

/// Reported health of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum HealthStatus {
    /// The claim is held and renewing on schedule.
    Healthy,
    /// Ownership was lost; the deployment policy keeps the instance
    /// partially in service.
    Degraded,
    /// Ownership was lost; the instance should be restarted.
    Unhealthy,
}

impl HealthStatus {
    const HEALTHY: u8 = 0;
    const DEGRADED: u8 = 1;
    const UNHEALTHY: u8 = 2;

    fn as_u8(self) -> u8 {
        match self {
            Self::Healthy => Self::HEALTHY,
            Self::Degraded => Self::DEGRADED,
            Self::Unhealthy => Self::UNHEALTHY,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            Self::DEGRADED => Self::Degraded,
            Self::UNHEALTHY => Self::Unhealthy,
            _ => Self::Healthy,
        }
    }
}

/// Point-in-time health report for a generic health-check aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HealthReport {
    /// Check name, `"worker-id/{app_name}"`.
    pub name: String,
    pub status: HealthStatus,
    pub description: String,
}

/// Shared, lock-free health cell.
///
/// Cloning is cheap; every clone observes the same underlying state. The
/// keep-alive loop holds one clone and the [`WorkerSlot`] hands further
/// clones to health-check plumbing.
///
/// [`WorkerSlot`]: crate::WorkerSlot
#[derive(Debug, Clone)]
pub struct HealthState {
    name: Arc<str>,
    cell: Arc<AtomicU8>,
}

impl HealthState {
    pub(crate) fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            cell: Arc::new(AtomicU8::new(HealthStatus::HEALTHY)),
        }
    }

    /// Name of this health check.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current status.
    pub fn status(&self) -> HealthStatus {
        HealthStatus::from_u8(self.cell.load(Ordering::Acquire))
    }

    /// Whether the slot is still exclusively owned.
    pub fn is_healthy(&self) -> bool {
        self.status() == HealthStatus::Healthy
    }

    /// One-way transition out of `Healthy`. Returns `true` only for the
    /// single caller that performed the transition, which is what makes
    /// the conflict error exactly-once.
    pub(crate) fn escalate(&self, to: UnhealthyStatus) -> bool {
        self.cell
            .compare_exchange(
                HealthStatus::HEALTHY,
                to.as_status().as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Builds a report suitable for a `{name, status, description}`
    /// health-check surface.
    pub fn check_health(&self) -> HealthReport {
        let status = self.status();
        let description = match status {
            HealthStatus::Healthy => "worker id lease held and renewing".to_string(),
            HealthStatus::Degraded | HealthStatus::Unhealthy => {
                "worker id ownership lost; ids from this process must not be trusted until restart"
                    .to_string()
            }
        };
        HealthReport {
            name: self.name.to_string(),
            status,
            description,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_healthy() {
        let health = HealthState::new("worker-id/app");
        assert!(health.is_healthy());
        assert_eq!(health.status(), HealthStatus::Healthy);
        assert_eq!(health.check_health().name, "worker-id/app");
    }

    #[test]
    fn escalation_is_one_way_and_one_shot() {
        let health = HealthState::new("worker-id/app");
        assert!(health.escalate(UnhealthyStatus::Unhealthy));
        assert_eq!(health.status(), HealthStatus::Unhealthy);

        // A second escalation loses the race and must not flip the status.
        assert!(!health.escalate(UnhealthyStatus::Degraded));
        assert_eq!(health.status(), HealthStatus::Unhealthy);
    }

    #[test]
    fn clones_share_state() {
        let health = HealthState::new("worker-id/app");
        let observer = health.clone();
        assert!(health.escalate(UnhealthyStatus::Degraded));
        assert_eq!(observer.status(), HealthStatus::Degraded);
        assert!(!observer.is_healthy());
    }
}
