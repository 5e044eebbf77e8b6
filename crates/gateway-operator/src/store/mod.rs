//! Object store seam
//!
//! Reconcilers never talk to `kube::Api` directly. They go through
//! [`ObjectStore`], a get/list/create/replace/delete surface with optimistic
//! concurrency on `metadata.resourceVersion`. Production uses [`KubeStore`];
//! tests use an in-memory store or mocks.

#[cfg(test)]
pub(crate) mod memory;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::consts::FIELD_MANAGER;
use crate::crd::{ControlPlane, DataPlane};
use crate::error::{OperatorError, Result};

/// Namespace + name of an object; `namespace` is `None` for cluster-scoped kinds
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of an existing object, `None` if it has no name yet
    pub fn of<K: Resource>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        Some(Self {
            namespace: meta.namespace.clone(),
            name: meta.name.clone()?,
        })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Equality label selector, optionally restricted to one namespace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl Selector {
    pub fn new(namespace: Option<String>) -> Self {
        Self {
            namespace,
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Render as a Kubernetes label selector string (`a=b,c=d`)
    pub fn label_selector(&self) -> String {
        self.labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn matches(&self, namespace: Option<&str>, labels: Option<&BTreeMap<String, String>>) -> bool {
        if let Some(ns) = &self.namespace {
            if namespace != Some(ns.as_str()) {
                return false;
            }
        }
        self.labels
            .iter()
            .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
    }
}

/// CRUD access to one object kind
///
/// `replace` and `replace_status` carry the object's resourceVersion and fail
/// with [`OperatorError::Conflict`] when it is stale. `delete` treats an
/// absent object as success.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore<K>: Send + Sync
where
    K: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>>;

    async fn list(&self, selector: &Selector) -> Result<Vec<K>>;

    async fn create(&self, obj: &K) -> Result<K>;

    async fn replace(&self, obj: &K) -> Result<K>;

    async fn replace_status(&self, obj: &K) -> Result<K>;

    async fn delete(&self, key: &ObjectKey) -> Result<()>;
}

/// Builds an `Api` handle with the right scope for a kind
pub trait ScopedResource: Resource<DynamicType = ()> + Sized {
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;
}

macro_rules! namespaced_resources {
    ($($kind:ty),* $(,)?) => {
        $(
            impl ScopedResource for $kind {
                fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
                    match namespace {
                        Some(ns) => Api::namespaced(client, ns),
                        None => Api::all(client),
                    }
                }
            }
        )*
    };
}

macro_rules! cluster_resources {
    ($($kind:ty),* $(,)?) => {
        $(
            impl ScopedResource for $kind {
                fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
                    Api::all(client)
                }
            }
        )*
    };
}

namespaced_resources!(DataPlane, ControlPlane, Deployment, Service, ServiceAccount);
cluster_resources!(ClusterRole, ClusterRoleBinding);

/// [`ObjectStore`] backed by the Kubernetes API server
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

fn kind_of<K: Resource<DynamicType = ()>>() -> String {
    K::kind(&()).to_string()
}

fn object_name<K: Resource<DynamicType = ()>>(obj: &K) -> Result<&str> {
    obj.meta().name.as_deref().ok_or_else(|| {
        OperatorError::InvalidConfig(format!("{} missing metadata.name", kind_of::<K>()))
    })
}

/// Map API status codes onto the operator's error classes
fn classify<K: Resource<DynamicType = ()>>(err: kube::Error, name: &str, namespace: Option<&str>) -> OperatorError {
    match err {
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            OperatorError::already_exists(kind_of::<K>(), name)
        }
        kube::Error::Api(ae) if ae.code == 409 => OperatorError::conflict(kind_of::<K>(), name),
        kube::Error::Api(ae) if ae.code == 404 => {
            OperatorError::not_found(kind_of::<K>(), name, namespace)
        }
        e => OperatorError::KubeError(e),
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: ScopedResource + Clone + Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>> {
        let api = K::api(self.client.clone(), key.namespace.as_deref());
        api.get_opt(&key.name)
            .await
            .map_err(|e| classify::<K>(e, &key.name, key.namespace.as_deref()))
    }

    async fn list(&self, selector: &Selector) -> Result<Vec<K>> {
        let api = K::api(self.client.clone(), selector.namespace.as_deref());
        let lp = ListParams::default().labels(&selector.label_selector());
        let list = api.list(&lp).await.map_err(OperatorError::from)?;
        Ok(list.items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let namespace = obj.meta().namespace.as_deref();
        let api = K::api(self.client.clone(), namespace);
        let shown = obj
            .meta()
            .name
            .clone()
            .or_else(|| obj.meta().generate_name.clone())
            .unwrap_or_default();

        debug!(kind = %kind_of::<K>(), name = %shown, "Creating object");

        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.create(&pp, obj)
            .await
            .map_err(|e| classify::<K>(e, &shown, namespace))
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let name = object_name(obj)?;
        let namespace = obj.meta().namespace.as_deref();
        let api = K::api(self.client.clone(), namespace);

        debug!(kind = %kind_of::<K>(), name = %name, "Replacing object");

        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.replace(name, &pp, obj)
            .await
            .map_err(|e| classify::<K>(e, name, namespace))
    }

    async fn replace_status(&self, obj: &K) -> Result<K> {
        let name = object_name(obj)?;
        let namespace = obj.meta().namespace.as_deref();
        let api = K::api(self.client.clone(), namespace);

        debug!(kind = %kind_of::<K>(), name = %name, "Replacing status");

        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let data = serde_json::to_vec(obj)?;
        api.replace_status(name, &pp, data)
            .await
            .map_err(|e| classify::<K>(e, name, namespace))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let api = K::api(self.client.clone(), key.namespace.as_deref());

        debug!(kind = %kind_of::<K>(), key = %key, "Deleting object");

        match api.delete(&key.name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(classify::<K>(e, &key.name, key.namespace.as_deref())),
        }
    }
}

/// Every store the reconcilers need, injected at construction
#[derive(Clone)]
pub struct Stores {
    pub dataplanes: Arc<dyn ObjectStore<DataPlane>>,
    pub controlplanes: Arc<dyn ObjectStore<ControlPlane>>,
    pub deployments: Arc<dyn ObjectStore<Deployment>>,
    pub services: Arc<dyn ObjectStore<Service>>,
    pub service_accounts: Arc<dyn ObjectStore<ServiceAccount>>,
    pub cluster_roles: Arc<dyn ObjectStore<ClusterRole>>,
    pub cluster_role_bindings: Arc<dyn ObjectStore<ClusterRoleBinding>>,
}

impl Stores {
    /// Stores backed by a live cluster
    pub fn kube(client: Client) -> Self {
        Self {
            dataplanes: Arc::new(KubeStore::new(client.clone())),
            controlplanes: Arc::new(KubeStore::new(client.clone())),
            deployments: Arc::new(KubeStore::new(client.clone())),
            services: Arc::new(KubeStore::new(client.clone())),
            service_accounts: Arc::new(KubeStore::new(client.clone())),
            cluster_roles: Arc::new(KubeStore::new(client.clone())),
            cluster_role_bindings: Arc::new(KubeStore::new(client)),
        }
    }
}
