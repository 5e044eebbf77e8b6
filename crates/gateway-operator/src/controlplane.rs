//! ControlPlane Reconciler
//!
//! A ControlPlane runs the ingress controller for a DataPlane it references
//! by name. The reference is resolved with a fresh read on every pass; while
//! it is unset, missing or not provisioned the controller Deployment is kept
//! at zero replicas. The ServiceAccount, ClusterRole and ClusterRoleBinding
//! the controller runs as are owned too. The cluster-scoped pair cannot be
//! garbage collected through owner references, so deletion goes through the
//! cluster-resources finalizer.

use async_trait::async_trait;
use kube::runtime::controller::Action;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

use crate::clock::Clock;
use crate::conditions::{self, ConditionUpdate};
use crate::consts::{CLUSTER_RESOURCES_FINALIZER, CONTROLPLANE_MANAGED_VALUE};
use crate::crd::{
    describe_validation_errors, ConditionReason, ConditionStatus, ConditionType, ControlPlane,
};
use crate::dataplane::{dataplane_dependency, DataPlaneDependency};
use crate::error::{OperatorError, Result};
use crate::finalizer::{self, Event};
use crate::owned::converge;
use crate::reconciler::{update_status, Context, Reconciler};
use crate::resources::{deployment_ready, ready_replicas, ControlPlaneBuilder, Owner};
use crate::retry::retry_on_conflict;
use crate::store::{ObjectKey, Selector};

/// Lifecycle phase of a ControlPlane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPlanePhase {
    Unscheduled,
    Scheduled,
    Provisioning,
    Provisioned,
    Deleting,
}

pub fn phase(controlplane: &ControlPlane) -> ControlPlanePhase {
    if controlplane.metadata.deletion_timestamp.is_some() {
        return ControlPlanePhase::Deleting;
    }
    if !conditions::is_true(controlplane, ConditionType::Scheduled) {
        return ControlPlanePhase::Unscheduled;
    }
    match conditions::get(controlplane, ConditionType::Provisioned) {
        Some(c) if c.status == ConditionStatus::True => ControlPlanePhase::Provisioned,
        Some(c) if c.reason == ConditionReason::PodsNotReady => ControlPlanePhase::Provisioning,
        _ => ControlPlanePhase::Scheduled,
    }
}

#[derive(Debug, Clone)]
enum Observation {
    InvalidSpec(String),
    Converged {
        dependency: DataPlaneDependency,
        ready: bool,
        ready_replicas: i32,
        desired_replicas: i32,
    },
}

fn provisioned_update(observed: &Observation) -> ConditionUpdate {
    let falsy = |reason, message: String| {
        ConditionUpdate::falsy(ConditionType::Provisioned, reason, message)
    };
    match observed {
        Observation::InvalidSpec(message) => falsy(ConditionReason::InvalidSpec, message.clone()),
        Observation::Converged { dependency, ready, ready_replicas, desired_replicas } => {
            match dependency {
                DataPlaneDependency::Unset => falsy(
                    ConditionReason::NoDataPlane,
                    "no DataPlane is referenced".to_string(),
                ),
                DataPlaneDependency::Missing(name) => falsy(
                    ConditionReason::DataPlaneNotReady,
                    format!("DataPlane {} does not exist", name),
                ),
                DataPlaneDependency::NotReady(name) => falsy(
                    ConditionReason::DataPlaneNotReady,
                    format!("DataPlane {} is not provisioned", name),
                ),
                DataPlaneDependency::Ready { .. } if *ready => ConditionUpdate::truthy(
                    ConditionType::Provisioned,
                    ConditionReason::PodsReady,
                    format!("{}/{} replicas ready", ready_replicas, desired_replicas),
                ),
                DataPlaneDependency::Ready { .. } => falsy(
                    ConditionReason::PodsNotReady,
                    format!("{}/{} replicas ready", ready_replicas, desired_replicas),
                ),
            }
        }
    }
}

fn apply_observation(controlplane: &mut ControlPlane, observed: &Observation, clock: &dyn Clock) -> bool {
    let scheduled = match observed {
        Observation::InvalidSpec(message) => ConditionUpdate::falsy(
            ConditionType::Scheduled,
            ConditionReason::InvalidSpec,
            message.clone(),
        ),
        Observation::Converged { .. } => ConditionUpdate::truthy(
            ConditionType::Scheduled,
            ConditionReason::Scheduled,
            "ControlPlane admitted",
        ),
    };
    let mut changed = conditions::set(controlplane, scheduled, clock);
    changed |= conditions::set(controlplane, provisioned_update(observed), clock);
    changed | conditions::mark_observed(controlplane)
}

fn name_of<K: kube::Resource<DynamicType = ()>>(obj: &K) -> Result<String> {
    obj.meta().name.clone().ok_or_else(|| {
        OperatorError::ReconcileFailed(format!("{} has no name after create", K::kind(&())))
    })
}

pub struct ControlPlaneReconciler {
    ctx: Arc<Context>,
}

impl ControlPlaneReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn write_status(&self, key: &ObjectKey, observed: Observation) -> Result<Option<ControlPlane>> {
        let clock = self.ctx.clock.clone();
        update_status(
            self.ctx.stores.controlplanes.as_ref(),
            key,
            &self.ctx.retry_config(),
            |cp| apply_observation(cp, &observed, clock.as_ref()),
        )
        .await
    }

    /// Converge every owned object for a live ControlPlane
    async fn apply(&self, key: &ObjectKey, controlplane: &ControlPlane) -> Result<Action> {
        if let Err(errors) = controlplane.spec.validate() {
            let message = describe_validation_errors(&errors);
            warn!(errors = %message, "ControlPlane spec validation failed");
            self.scale_down(controlplane).await?;
            self.write_status(key, Observation::InvalidSpec(message)).await?;
            return Ok(self.ctx.resync());
        }

        let stores = &self.ctx.stores;
        let attempts = self.ctx.config.conflict_retries;
        let builder = ControlPlaneBuilder::new(controlplane, &self.ctx.config.controlplane_image)?;
        let owner = builder.owner();

        let dependency = dataplane_dependency(
            stores.dataplanes.as_ref(),
            owner.namespace(),
            controlplane.spec.data_plane.as_deref(),
        )
        .await?;
        debug!(?dependency, met = dependency.is_met(), "DataPlane reference resolved");

        let namespaced = owner.namespaced_selector();
        let cluster = owner.cluster_selector();

        let service_account = converge(
            stores.service_accounts.as_ref(),
            &namespaced,
            &builder.build_service_account(),
            attempts,
        )
        .await?;
        let service_account_name = name_of(&service_account.object)?;

        let role = converge(
            stores.cluster_roles.as_ref(),
            &cluster,
            &builder.build_cluster_role(),
            attempts,
        )
        .await?;
        let binding = converge(
            stores.cluster_role_bindings.as_ref(),
            &cluster,
            &builder.build_cluster_role_binding(&name_of(&role.object)?, &service_account_name),
            attempts,
        )
        .await?;

        let dataplane_service = match &dependency {
            DataPlaneDependency::Ready { service, .. } => service.as_deref(),
            _ => None,
        };
        let env = builder.env(dataplane_service);
        if !env.dropped.is_empty() {
            warn!(dropped = ?env.dropped, "Ignoring env entries that name reserved variables");
        }

        let desired_replicas = if dependency.is_met() {
            controlplane.spec.deployment.replicas_or_default()
        } else {
            0
        };
        let deployment = converge(
            stores.deployments.as_ref(),
            &namespaced,
            &builder.build_deployment(env.env, desired_replicas, &service_account_name),
            attempts,
        )
        .await?;

        let ready = dependency.is_met() && deployment_ready(&deployment.object);
        let waiting = matches!(
            dependency,
            DataPlaneDependency::Missing(_) | DataPlaneDependency::NotReady(_)
        ) || (dependency.is_met() && !ready);

        let observed = Observation::Converged {
            dependency,
            ready,
            ready_replicas: ready_replicas(&deployment.object),
            desired_replicas,
        };
        let Some(updated) = self.write_status(key, observed).await? else {
            return Ok(Action::await_change());
        };

        info!(
            phase = ?phase(&updated),
            deployment = ?deployment.outcome,
            cluster_role = ?role.outcome,
            cluster_role_binding = ?binding.outcome,
            "ControlPlane reconciled"
        );

        Ok(if waiting {
            self.ctx.pending()
        } else {
            self.ctx.resync()
        })
    }

    /// Hold any existing controller Deployment at zero replicas
    async fn scale_down(&self, controlplane: &ControlPlane) -> Result<()> {
        let store = self.ctx.stores.deployments.as_ref();
        let owner = Owner::of(controlplane, CONTROLPLANE_MANAGED_VALUE)?;
        let retry = self.ctx.retry_config();

        for deployment in store.list(&owner.namespaced_selector()).await? {
            let Some(key) = ObjectKey::of(&deployment) else {
                continue;
            };
            let key = &key;
            retry_on_conflict(&retry, "scale_down", move || async move {
                let Some(mut current) = store.get(key).await? else {
                    return Ok(());
                };
                let Some(spec) = current.spec.as_mut() else {
                    return Ok(());
                };
                if spec.replicas == Some(0) {
                    return Ok(());
                }
                spec.replicas = Some(0);
                store.replace(&current).await?;
                info!(deployment = %key, "Scaled controller Deployment to zero");
                Ok(())
            })
            .await?;
        }
        Ok(())
    }

    /// Remove the cluster-scoped objects; succeeds only once both are gone
    async fn cleanup(&self, controlplane: &ControlPlane) -> Result<Action> {
        let stores = &self.ctx.stores;
        let owner = Owner::of(controlplane, CONTROLPLANE_MANAGED_VALUE)?;
        let selector = owner.cluster_selector();

        info!(phase = ?ControlPlanePhase::Deleting, "Removing cluster-scoped resources");

        for binding in stores.cluster_role_bindings.list(&selector).await? {
            if let Some(key) = ObjectKey::of(&binding) {
                stores.cluster_role_bindings.delete(&key).await?;
            }
        }
        for role in stores.cluster_roles.list(&selector).await? {
            if let Some(key) = ObjectKey::of(&role) {
                stores.cluster_roles.delete(&key).await?;
            }
        }

        let remaining = self.remaining_cluster_objects(&selector).await?;
        if remaining > 0 {
            return Err(OperatorError::FinalizerError(format!(
                "{} cluster-scoped objects still present",
                remaining
            )));
        }

        Ok(Action::await_change())
    }

    async fn remaining_cluster_objects(&self, selector: &Selector) -> Result<usize> {
        let stores = &self.ctx.stores;
        Ok(stores.cluster_role_bindings.list(selector).await?.len()
            + stores.cluster_roles.list(selector).await?.len())
    }
}

#[async_trait]
impl Reconciler for ControlPlaneReconciler {
    fn kind(&self) -> &'static str {
        "ControlPlane"
    }

    #[instrument(skip(self), fields(controlplane = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(controlplane) = self.ctx.stores.controlplanes.get(key).await? else {
            debug!("ControlPlane no longer exists");
            return Ok(Action::await_change());
        };

        finalizer::run(
            self.ctx.stores.controlplanes.as_ref(),
            controlplane,
            CLUSTER_RESOURCES_FINALIZER,
            &self.ctx.retry_config(),
            |event| async move {
                match event {
                    Event::Apply(cp) => self.apply(key, &cp).await,
                    Event::Cleanup(cp) => self.cleanup(&cp).await,
                }
            },
        )
        .await
    }
}
