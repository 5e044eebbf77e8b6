//! In-memory cluster for reconciler tests
//!
//! Stands in for the API server and for the workload controllers that
//! would otherwise roll Deployments out and assign load balancer addresses.

use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::{
    EnvVar, LoadBalancerIngress, LoadBalancerStatus, Service, ServiceAccount, ServiceStatus,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::runtime::controller::Action;
use kube::Resource;
use std::sync::Arc;

use crate::clock::FakeClock;
use crate::config::OperatorConfig;
use crate::consts::OWNER_UID_LABEL;
use crate::controlplane::ControlPlaneReconciler;
use crate::crd::{ControlPlane, ControlPlaneSpec, DataPlane, DataPlaneSpec, DeploymentOptions};
use crate::dataplane::DataPlaneReconciler;
use crate::error::Result;
use crate::reconciler::{Context, Reconciler};
use crate::store::memory::{Journal, MemoryStore, Sequence};
use crate::store::{ObjectKey, ObjectStore, Stores};

pub const NAMESPACE: &str = "default";

pub fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn options(env_vars: Vec<(&str, &str)>) -> DeploymentOptions {
    DeploymentOptions {
        env: env_vars.into_iter().map(|(n, v)| env(n, v)).collect(),
        ..Default::default()
    }
}

pub struct Harness {
    pub journal: Journal,
    pub clock: FakeClock,
    pub dataplanes: Arc<MemoryStore<DataPlane>>,
    pub controlplanes: Arc<MemoryStore<ControlPlane>>,
    pub deployments: Arc<MemoryStore<Deployment>>,
    pub services: Arc<MemoryStore<Service>>,
    pub service_accounts: Arc<MemoryStore<ServiceAccount>>,
    pub cluster_roles: Arc<MemoryStore<ClusterRole>>,
    pub cluster_role_bindings: Arc<MemoryStore<ClusterRoleBinding>>,
    pub ctx: Arc<Context>,
}

impl Harness {
    pub fn new() -> Self {
        let journal = Journal::default();
        let sequence = Sequence::default();
        let clock = FakeClock::default();

        let dataplanes = Arc::new(MemoryStore::shared(journal.clone(), sequence.clone()));
        let controlplanes = Arc::new(MemoryStore::shared(journal.clone(), sequence.clone()));
        let deployments = Arc::new(MemoryStore::shared(journal.clone(), sequence.clone()));
        let services = Arc::new(MemoryStore::shared(journal.clone(), sequence.clone()));
        let service_accounts = Arc::new(MemoryStore::shared(journal.clone(), sequence.clone()));
        let cluster_roles = Arc::new(MemoryStore::shared(journal.clone(), sequence.clone()));
        let cluster_role_bindings = Arc::new(MemoryStore::shared(journal.clone(), sequence.clone()));

        let stores = Stores {
            dataplanes: dataplanes.clone(),
            controlplanes: controlplanes.clone(),
            deployments: deployments.clone(),
            services: services.clone(),
            service_accounts: service_accounts.clone(),
            cluster_roles: cluster_roles.clone(),
            cluster_role_bindings: cluster_role_bindings.clone(),
        };
        let ctx = Arc::new(Context::new(
            stores,
            OperatorConfig::default(),
            Arc::new(clock.clone()),
        ));

        Self {
            journal,
            clock,
            dataplanes,
            controlplanes,
            deployments,
            services,
            service_accounts,
            cluster_roles,
            cluster_role_bindings,
            ctx,
        }
    }

    /// Swap the ClusterRole store the reconcilers see
    pub fn with_cluster_roles(mut self, store: Arc<dyn ObjectStore<ClusterRole>>) -> Self {
        let mut stores = self.ctx.stores.clone();
        stores.cluster_roles = store;
        self.ctx = Arc::new(Context::new(
            stores,
            self.ctx.config.clone(),
            self.ctx.clock.clone(),
        ));
        self
    }

    pub fn create_dataplane(&self, name: &str, env_vars: Vec<(&str, &str)>) -> DataPlane {
        let mut dp = DataPlane::new(
            name,
            DataPlaneSpec {
                deployment: options(env_vars),
            },
        );
        dp.metadata.namespace = Some(NAMESPACE.to_string());
        self.dataplanes.insert(dp)
    }

    pub fn create_controlplane(
        &self,
        name: &str,
        dataplane: Option<&str>,
        env_vars: Vec<(&str, &str)>,
    ) -> ControlPlane {
        let mut cp = ControlPlane::new(
            name,
            ControlPlaneSpec {
                deployment: options(env_vars),
                data_plane: dataplane.map(str::to_string),
            },
        );
        cp.metadata.namespace = Some(NAMESPACE.to_string());
        self.controlplanes.insert(cp)
    }

    pub async fn reconcile_dataplane(&self, key: &ObjectKey) -> Result<Action> {
        DataPlaneReconciler::new(self.ctx.clone()).reconcile(key).await
    }

    pub async fn reconcile_controlplane(&self, key: &ObjectKey) -> Result<Action> {
        ControlPlaneReconciler::new(self.ctx.clone()).reconcile(key).await
    }

    /// Reconcile everything a few rounds, rolling workloads out in between
    pub async fn settle(&self) {
        for _ in 0..4 {
            for dp in self.dataplanes.objects() {
                self.reconcile_dataplane(&ObjectKey::of(&dp).unwrap())
                    .await
                    .unwrap();
            }
            self.rollout();
            for cp in self.controlplanes.objects() {
                self.reconcile_controlplane(&ObjectKey::of(&cp).unwrap())
                    .await
                    .unwrap();
            }
            self.rollout();
        }
    }

    fn set_ready(&self, filter: impl Fn(&Deployment) -> bool, ready: bool) {
        for deployment in self.deployments.objects() {
            if !filter(&deployment) {
                continue;
            }
            let key = ObjectKey::of(&deployment).unwrap();
            self.deployments.update(&key, |d| {
                let replicas = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                let count = if ready { replicas } else { 0 };
                d.status = Some(DeploymentStatus {
                    observed_generation: d.metadata.generation,
                    replicas: Some(replicas),
                    updated_replicas: Some(replicas),
                    ready_replicas: Some(count),
                    available_replicas: Some(count),
                    ..Default::default()
                });
            });
        }
    }

    /// Every Deployment reaches its desired replica count
    pub fn rollout(&self) {
        self.set_ready(|_| true, true);
    }

    pub fn lose_pods(&self) {
        self.set_ready(|_| true, false);
    }

    pub fn lose_pods_of(&self, owner_uid: &str) {
        self.set_ready(|d| has_owner_uid(d, owner_uid), false);
    }

    pub fn assign_load_balancer(&self, ip: &str) {
        for service in self.services.objects() {
            let key = ObjectKey::of(&service).unwrap();
            self.services.update(&key, |s| {
                s.status = Some(ServiceStatus {
                    load_balancer: Some(LoadBalancerStatus {
                        ingress: Some(vec![LoadBalancerIngress {
                            ip: Some(ip.to_string()),
                            ..Default::default()
                        }]),
                    }),
                    ..Default::default()
                });
            });
        }
    }

    pub fn owned_by<T: Resource + Clone>(&self, objects: &[T], uid: &str) -> Vec<T> {
        objects
            .iter()
            .filter(|o| has_owner_uid(*o, uid))
            .cloned()
            .collect()
    }

    /// Writes the reconcilers made across every store
    pub fn total_writes(&self) -> usize {
        self.dataplanes.writes()
            + self.controlplanes.writes()
            + self.deployments.writes()
            + self.services.writes()
            + self.service_accounts.writes()
            + self.cluster_roles.writes()
            + self.cluster_role_bindings.writes()
    }
}

fn has_owner_uid<T: Resource>(obj: &T, uid: &str) -> bool {
    obj.meta()
        .labels
        .as_ref()
        .and_then(|l| l.get(OWNER_UID_LABEL))
        .is_some_and(|v| v == uid)
}
