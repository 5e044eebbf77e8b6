//! Operator configuration
//!
//! Built by the binary from CLI flags and environment, then handed to the
//! reconcilers. Nothing in the reconcile path reads the environment directly.

use std::time::Duration;

use crate::consts::{DEFAULT_CONTROLPLANE_IMAGE, DEFAULT_DATAPLANE_IMAGE};

/// Default resync interval for settled resources
const DEFAULT_RESYNC_SECONDS: u64 = 300;

/// Requeue interval while waiting for workloads or dependencies
const DEFAULT_PENDING_REQUEUE_SECONDS: u64 = 5;

/// Base for exponential error backoff
const ERROR_REQUEUE_SECONDS: u64 = 5;

/// Maximum requeue delay for error backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 300;

#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace to watch, `None` for cluster-wide
    pub namespace: Option<String>,
    /// Image used when a DataPlane does not set one
    pub dataplane_image: String,
    /// Image used when a ControlPlane does not set one
    pub controlplane_image: String,
    /// Requeue interval once a resource has converged
    pub resync_interval: Duration,
    /// Requeue interval while a workload or dependency is not ready yet
    pub pending_requeue: Duration,
    /// Base delay for error backoff
    pub error_backoff_base: Duration,
    /// Cap for error backoff
    pub error_backoff_max: Duration,
    /// Attempts for optimistic-concurrency retries inside one reconcile
    pub conflict_retries: u32,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            dataplane_image: DEFAULT_DATAPLANE_IMAGE.to_string(),
            controlplane_image: DEFAULT_CONTROLPLANE_IMAGE.to_string(),
            resync_interval: Duration::from_secs(DEFAULT_RESYNC_SECONDS),
            pending_requeue: Duration::from_secs(DEFAULT_PENDING_REQUEUE_SECONDS),
            error_backoff_base: Duration::from_secs(ERROR_REQUEUE_SECONDS),
            error_backoff_max: Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS),
            conflict_retries: 3,
        }
    }
}

impl OperatorConfig {
    /// Backoff for the given consecutive failure count: base, 2x, 4x ... capped
    pub fn error_backoff(&self, retries: u32) -> Duration {
        let exp = retries.saturating_sub(1).min(10);
        let backoff = self.error_backoff_base * 2u32.saturating_pow(exp);
        backoff.min(self.error_backoff_max)
    }
}
