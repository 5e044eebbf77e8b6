//! DataPlane Reconciler
//!
//! Admits every DataPlane immediately, converges its proxy Deployment and
//! LoadBalancer Service, and reflects workload readiness into the
//! `Provisioned` condition. Also answers the ControlPlane reconciler's
//! question of whether a given DataPlane can be attached to.

use async_trait::async_trait;
use kube::runtime::controller::Action;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

use crate::clock::Clock;
use crate::conditions::{self, ConditionUpdate};
use crate::crd::{
    describe_validation_errors, ConditionReason, ConditionStatus, ConditionType, DataPlane,
};
use crate::error::Result;
use crate::owned::converge;
use crate::reconciler::{update_status, Context, Reconciler};
use crate::resources::{deployment_ready, load_balancer_addresses, ready_replicas, DataPlaneBuilder};
use crate::store::{ObjectKey, ObjectStore};

/// Lifecycle phase derived from a DataPlane's conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataPlanePhase {
    Unscheduled,
    Scheduled,
    Provisioning,
    Provisioned,
    Degraded,
}

pub fn phase(dataplane: &DataPlane) -> DataPlanePhase {
    if !conditions::is_true(dataplane, ConditionType::Scheduled) {
        return DataPlanePhase::Unscheduled;
    }
    match conditions::get(dataplane, ConditionType::Provisioned) {
        None => DataPlanePhase::Scheduled,
        Some(c) if c.status == ConditionStatus::True => DataPlanePhase::Provisioned,
        Some(c) => match c.reason {
            ConditionReason::InvalidSpec => DataPlanePhase::Scheduled,
            ConditionReason::Degraded => DataPlanePhase::Degraded,
            _ => DataPlanePhase::Provisioning,
        },
    }
}

/// True when the DataPlane can serve an attached ControlPlane
pub fn is_provisioned(dataplane: &DataPlane) -> bool {
    dataplane.metadata.deletion_timestamp.is_none()
        && conditions::is_true(dataplane, ConditionType::Provisioned)
}

/// What a ControlPlane's DataPlane reference currently resolves to
#[derive(Debug, Clone, PartialEq)]
pub enum DataPlaneDependency {
    /// No reference set
    Unset,
    /// Referenced DataPlane does not exist
    Missing(String),
    /// Referenced DataPlane exists but is not provisioned
    NotReady(String),
    Ready {
        name: String,
        service: Option<String>,
    },
}

impl DataPlaneDependency {
    pub fn is_met(&self) -> bool {
        matches!(self, DataPlaneDependency::Ready { .. })
    }
}

/// Resolve a DataPlane reference with a fresh read
pub async fn dataplane_dependency(
    store: &dyn ObjectStore<DataPlane>,
    namespace: &str,
    reference: Option<&str>,
) -> Result<DataPlaneDependency> {
    let Some(name) = reference else {
        return Ok(DataPlaneDependency::Unset);
    };
    let key = ObjectKey::namespaced(namespace, name);
    Ok(match store.get(&key).await? {
        None => DataPlaneDependency::Missing(name.to_string()),
        Some(dp) if is_provisioned(&dp) => DataPlaneDependency::Ready {
            name: name.to_string(),
            service: dp.status.and_then(|s| s.service),
        },
        Some(_) => DataPlaneDependency::NotReady(name.to_string()),
    })
}

/// Facts gathered during one pass, folded into status
#[derive(Debug, Clone)]
enum Observation {
    InvalidSpec(String),
    Workload {
        ready: bool,
        ready_replicas: i32,
        desired_replicas: i32,
        service: String,
        addresses: Vec<String>,
    },
}

fn apply_observation(dataplane: &mut DataPlane, observed: &Observation, clock: &dyn Clock) -> bool {
    let mut changed = conditions::set(
        dataplane,
        ConditionUpdate::truthy(
            ConditionType::Scheduled,
            ConditionReason::Scheduled,
            "DataPlane admitted",
        ),
        clock,
    );

    let provisioned = match observed {
        Observation::InvalidSpec(message) => ConditionUpdate::falsy(
            ConditionType::Provisioned,
            ConditionReason::InvalidSpec,
            message.clone(),
        ),
        Observation::Workload {
            ready: true,
            ready_replicas,
            desired_replicas,
            ..
        } => ConditionUpdate::truthy(
            ConditionType::Provisioned,
            ConditionReason::PodsReady,
            format!("{}/{} replicas ready", ready_replicas, desired_replicas),
        ),
        Observation::Workload {
            ready_replicas,
            desired_replicas,
            ..
        } => {
            // lost readiness without a spec change in between
            let generation = dataplane.metadata.generation.unwrap_or(0);
            let degraded = conditions::get(dataplane, ConditionType::Provisioned).is_some_and(|c| {
                c.observed_generation == generation
                    && (c.status == ConditionStatus::True || c.reason == ConditionReason::Degraded)
            });
            let reason = if degraded {
                ConditionReason::Degraded
            } else {
                ConditionReason::PodsNotReady
            };
            ConditionUpdate::falsy(
                ConditionType::Provisioned,
                reason,
                format!("{}/{} replicas ready", ready_replicas, desired_replicas),
            )
        }
    };
    changed |= conditions::set(dataplane, provisioned, clock);

    if let Observation::Workload {
        service, addresses, ..
    } = observed
    {
        let status = dataplane.status.get_or_insert_with(Default::default);
        if status.service.as_ref() != Some(service) {
            status.service = Some(service.clone());
            changed = true;
        }
        if &status.addresses != addresses {
            status.addresses = addresses.clone();
            changed = true;
        }
    }

    changed | conditions::mark_observed(dataplane)
}

pub struct DataPlaneReconciler {
    ctx: Arc<Context>,
}

impl DataPlaneReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn write_status(&self, key: &ObjectKey, observed: Observation) -> Result<Option<DataPlane>> {
        let clock = self.ctx.clock.clone();
        update_status(
            self.ctx.stores.dataplanes.as_ref(),
            key,
            &self.ctx.retry_config(),
            |dp| apply_observation(dp, &observed, clock.as_ref()),
        )
        .await
    }
}

#[async_trait]
impl Reconciler for DataPlaneReconciler {
    fn kind(&self) -> &'static str {
        "DataPlane"
    }

    #[instrument(skip(self), fields(dataplane = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let stores = &self.ctx.stores;
        let Some(dataplane) = stores.dataplanes.get(key).await? else {
            debug!("DataPlane no longer exists");
            return Ok(Action::await_change());
        };
        if dataplane.metadata.deletion_timestamp.is_some() {
            // owned objects go with it through their owner references
            debug!("DataPlane is being deleted");
            return Ok(Action::await_change());
        }

        if let Err(errors) = dataplane.spec.validate() {
            let message = describe_validation_errors(&errors);
            warn!(errors = %message, "DataPlane spec validation failed");
            self.write_status(key, Observation::InvalidSpec(message)).await?;
            return Ok(self.ctx.resync());
        }

        let builder = DataPlaneBuilder::new(&dataplane, &self.ctx.config.dataplane_image)?;
        let selector = builder.owner().namespaced_selector();
        let attempts = self.ctx.config.conflict_retries;

        let deployment = converge(
            stores.deployments.as_ref(),
            &selector,
            &builder.build_deployment(),
            attempts,
        )
        .await?;
        let service = converge(
            stores.services.as_ref(),
            &selector,
            &builder.build_service(),
            attempts,
        )
        .await?;

        let ready = deployment_ready(&deployment.object);
        let observed = Observation::Workload {
            ready,
            ready_replicas: ready_replicas(&deployment.object),
            desired_replicas: dataplane.spec.deployment.replicas_or_default(),
            service: service.object.metadata.name.clone().unwrap_or_default(),
            addresses: load_balancer_addresses(&service.object),
        };

        let Some(updated) = self.write_status(key, observed).await? else {
            return Ok(Action::await_change());
        };
        info!(
            phase = ?phase(&updated),
            deployment = ?deployment.outcome,
            service = ?service.outcome,
            "DataPlane reconciled"
        );

        Ok(if ready {
            self.ctx.resync()
        } else {
            self.ctx.pending()
        })
    }
}
