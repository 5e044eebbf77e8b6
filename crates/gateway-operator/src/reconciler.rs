//! Shared reconciler plumbing
//!
//! Both reconcilers implement [`Reconciler`] over an [`ObjectKey`] and receive
//! their collaborators through [`Context`]. They always re-read the object by
//! key, so a stale event payload never drives a write.

use async_trait::async_trait;
use kube::runtime::controller::Action;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::OperatorConfig;
use crate::error::Result;
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::store::{ObjectKey, ObjectStore, Stores};

/// Collaborators injected into every reconciler
pub struct Context {
    pub stores: Stores,
    pub config: OperatorConfig,
    pub clock: Arc<dyn Clock>,
}

impl Context {
    pub fn new(stores: Stores, config: OperatorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            stores,
            config,
            clock,
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::from(&self.config)
    }

    /// Requeue for a resource still waiting on its workload or a dependency
    pub fn pending(&self) -> Action {
        Action::requeue(self.config.pending_requeue)
    }

    /// Requeue for a settled resource
    pub fn resync(&self) -> Action {
        Action::requeue(self.config.resync_interval)
    }
}

/// One reconcile pass for the object identified by `key`
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Kind name used in logs and metric labels
    fn kind(&self) -> &'static str;

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action>;
}

/// Re-read `key`, let `mutate` adjust its status, and write the status back
/// only if `mutate` reports a change. Stale writes are retried from a fresh
/// read. Returns `None` when the object no longer exists.
pub async fn update_status<K, F>(
    store: &dyn ObjectStore<K>,
    key: &ObjectKey,
    retry: &RetryConfig,
    mutate: F,
) -> Result<Option<K>>
where
    K: Clone + Send + Sync + 'static,
    F: Fn(&mut K) -> bool,
{
    let mutate = &mutate;
    retry_on_conflict(retry, "update_status", move || async move {
        let Some(mut current) = store.get(key).await? else {
            return Ok(None);
        };
        if !mutate(&mut current) {
            return Ok(Some(current));
        }
        store.replace_status(&current).await.map(Some)
    })
    .await
}
