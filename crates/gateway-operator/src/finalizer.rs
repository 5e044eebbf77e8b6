//! Finalizer-gated cleanup over an [`ObjectStore`]
//!
//! Same contract as `kube::runtime::finalizer`: the marker is added before
//! the first `Apply`, `Cleanup` runs once deletion is requested, and the
//! marker is only removed after `Cleanup` succeeds. Until then the API
//! server keeps the object around.

use kube::runtime::controller::Action;
use kube::Resource;
use std::future::Future;
use tracing::{debug, info};

use crate::error::{OperatorError, Result};
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::store::{ObjectKey, ObjectStore};

/// What the reconcile closure is asked to do
#[derive(Debug)]
pub enum Event<K> {
    Apply(K),
    Cleanup(K),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerState {
    /// Not being deleted
    Active,
    /// Deletion requested, marker still held
    DeletionRequested,
    /// Deletion requested and marker released
    Finalized,
}

impl FinalizerState {
    pub fn of<K: Resource>(obj: &K, marker: &str) -> Self {
        match (obj.meta().deletion_timestamp.is_some(), has_marker(obj, marker)) {
            (false, _) => FinalizerState::Active,
            (true, true) => FinalizerState::DeletionRequested,
            (true, false) => FinalizerState::Finalized,
        }
    }
}

pub fn has_marker<K: Resource>(obj: &K, marker: &str) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|m| m == marker))
}

async fn add_marker<K>(
    store: &dyn ObjectStore<K>,
    key: &ObjectKey,
    marker: &str,
    retry: &RetryConfig,
) -> Result<Option<K>>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    retry_on_conflict(retry, "add_finalizer", move || async move {
        let Some(mut current) = store.get(key).await? else {
            return Ok(None);
        };
        if has_marker(&current, marker) || current.meta().deletion_timestamp.is_some() {
            return Ok(Some(current));
        }
        current
            .meta_mut()
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(marker.to_string());
        debug!(key = %key, marker, "Adding finalizer");
        store.replace(&current).await.map(Some)
    })
    .await
}

async fn remove_marker<K>(
    store: &dyn ObjectStore<K>,
    key: &ObjectKey,
    marker: &str,
    retry: &RetryConfig,
) -> Result<()>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    retry_on_conflict(retry, "remove_finalizer", move || async move {
        let Some(mut current) = store.get(key).await? else {
            return Ok(());
        };
        if !has_marker(&current, marker) {
            return Ok(());
        }
        if let Some(finalizers) = current.meta_mut().finalizers.as_mut() {
            finalizers.retain(|m| m != marker);
        }
        debug!(key = %key, marker, "Removing finalizer");
        store.replace(&current).await.map(|_| ())
    })
    .await
}

/// Drive `reconcile` through the finalizer protocol for `obj`
pub async fn run<K, F, Fut>(
    store: &dyn ObjectStore<K>,
    obj: K,
    marker: &str,
    retry: &RetryConfig,
    reconcile: F,
) -> Result<Action>
where
    K: Resource + Clone + Send + Sync + 'static,
    F: FnOnce(Event<K>) -> Fut,
    Fut: Future<Output = Result<Action>>,
{
    let key = ObjectKey::of(&obj)
        .ok_or_else(|| OperatorError::FinalizerError("object has no name".to_string()))?;

    match FinalizerState::of(&obj, marker) {
        FinalizerState::Active => {
            let obj = if has_marker(&obj, marker) {
                obj
            } else {
                match add_marker(store, &key, marker, retry).await? {
                    Some(obj) => obj,
                    None => return Ok(Action::await_change()),
                }
            };
            if FinalizerState::of(&obj, marker) != FinalizerState::Active {
                // deletion raced the marker write; the deletion event follows
                return Ok(Action::await_change());
            }
            reconcile(Event::Apply(obj)).await
        }
        FinalizerState::DeletionRequested => {
            debug!(key = %key, state = ?FinalizerState::DeletionRequested, "Running cleanup");
            let action = reconcile(Event::Cleanup(obj)).await?;
            remove_marker(store, &key, marker, retry).await?;
            info!(key = %key, state = ?FinalizerState::Finalized, "Cleanup complete, finalizer released");
            Ok(action)
        }
        FinalizerState::Finalized => Ok(Action::await_change()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use std::sync::atomic::{AtomicU32, Ordering};

    const MARKER: &str = "example.com/cleanup";

    fn object() -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("guarded".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn key() -> ObjectKey {
        ObjectKey::namespaced("default", "guarded")
    }

    #[tokio::test]
    async fn test_marker_added_before_apply() {
        let store = MemoryStore::<ConfigMap>::new();
        let obj = store.insert(object());

        let action = run(&store, obj, MARKER, &RetryConfig::default(), |event| async move {
            match event {
                Event::Apply(obj) => {
                    assert!(has_marker(&obj, MARKER));
                    Ok(Action::requeue(std::time::Duration::from_secs(1)))
                }
                Event::Cleanup(_) => panic!("not deleting"),
            }
        })
        .await
        .unwrap();

        assert_eq!(action, Action::requeue(std::time::Duration::from_secs(1)));
        assert!(has_marker(&store.snapshot(&key()).unwrap(), MARKER));
    }

    #[tokio::test]
    async fn test_failed_cleanup_keeps_object() {
        let store = MemoryStore::<ConfigMap>::new();
        let mut obj = object();
        obj.metadata.finalizers = Some(vec![MARKER.to_string()]);
        store.insert(obj);
        store.delete(&key()).await.unwrap();

        let deleting = store.snapshot(&key()).unwrap();
        assert_eq!(FinalizerState::of(&deleting, MARKER), FinalizerState::DeletionRequested);

        let err = run(&store, deleting, MARKER, &RetryConfig::default(), |_| async {
            Err(OperatorError::FinalizerError("still there".to_string()))
        })
        .await
        .unwrap_err();
        assert!(err.is_retryable());
        assert!(store.snapshot(&key()).is_some());
    }

    #[tokio::test]
    async fn test_successful_cleanup_releases_object() {
        let store = MemoryStore::<ConfigMap>::new();
        let mut obj = object();
        obj.metadata.finalizers = Some(vec![MARKER.to_string()]);
        store.insert(obj);
        store.delete(&key()).await.unwrap();

        let cleanups = AtomicU32::new(0);
        let deleting = store.snapshot(&key()).unwrap();
        run(&store, deleting, MARKER, &RetryConfig::default(), |event| {
            let cleanups = &cleanups;
            async move {
                assert!(matches!(event, Event::Cleanup(_)));
                cleanups.fetch_add(1, Ordering::SeqCst);
                Ok(Action::await_change())
            }
        })
        .await
        .unwrap();

        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert!(store.snapshot(&key()).is_none());
    }

    #[tokio::test]
    async fn test_foreign_finalizers_preserved() {
        let store = MemoryStore::<ConfigMap>::new();
        let mut obj = object();
        obj.metadata.finalizers = Some(vec![MARKER.to_string(), "other.io/hold".to_string()]);
        store.insert(obj);
        store.delete(&key()).await.unwrap();

        let deleting = store.snapshot(&key()).unwrap();
        run(&store, deleting, MARKER, &RetryConfig::default(), |_| async {
            Ok(Action::await_change())
        })
        .await
        .unwrap();

        let remaining = store.snapshot(&key()).unwrap();
        assert_eq!(remaining.metadata.finalizers, Some(vec!["other.io/hold".to_string()]));
    }

    #[tokio::test]
    async fn test_released_marker_skips_callback() {
        let store = MemoryStore::<ConfigMap>::new();
        let mut obj = object();
        obj.metadata.finalizers = Some(vec!["other.io/hold".to_string()]);
        store.insert(obj);
        store.delete(&key()).await.unwrap();

        let deleting = store.snapshot(&key()).unwrap();
        assert_eq!(FinalizerState::of(&deleting, MARKER), FinalizerState::Finalized);

        let action = run(&store, deleting, MARKER, &RetryConfig::default(), |_| async {
            panic!("marker already released")
        })
        .await
        .unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(FinalizerState::of(&object(), MARKER), FinalizerState::Active);
    }
}
