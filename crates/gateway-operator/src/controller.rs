//! Controller wiring
//!
//! Runs one `kube::runtime::Controller` per kind. Watch events only decide
//! *which* key to reconcile; the reconcilers re-read everything they need
//! through the stores. Per-object error counts drive exponential backoff.

use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServiceAccount};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::SystemClock;
use crate::config::OperatorConfig;
use crate::controlplane::ControlPlaneReconciler;
use crate::crd::{ControlPlane, DataPlane};
use crate::dataplane::DataPlaneReconciler;
use crate::error::{OperatorError, Result};
use crate::reconciler::{Context, Reconciler};
use crate::store::{ObjectKey, ScopedResource, Stores};

/// Context passed to each controller
pub struct ControllerContext<R> {
    pub reconciler: R,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-object error retry counts for exponential backoff
    pub error_counts: DashMap<ObjectKey, u32>,
    pub config: OperatorConfig,
}

impl<R: Reconciler> ControllerContext<R> {
    pub fn new(reconciler: R, config: OperatorConfig) -> Self {
        let metrics = Some(ControllerMetrics::new(reconciler.kind()));
        Self {
            reconciler,
            metrics,
            error_counts: DashMap::new(),
            config,
        }
    }
}

/// Metrics for one controller, labelled by kind
#[derive(Clone)]
pub struct ControllerMetrics {
    pub reconciliations: metrics::Counter,
    pub errors: metrics::Counter,
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    pub fn new(kind: &'static str) -> Self {
        Self {
            reconciliations: metrics::counter!("gateway_operator_reconciliations_total", "kind" => kind),
            errors: metrics::counter!("gateway_operator_reconciliation_errors_total", "kind" => kind),
            duration: metrics::histogram!("gateway_operator_reconciliation_duration_seconds", "kind" => kind),
        }
    }
}

/// Reconcile entry point shared by both controllers
#[instrument(skip(obj, ctx), fields(kind = ctx.reconciler.kind(), name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile<K, R>(obj: Arc<K>, ctx: Arc<ControllerContext<R>>) -> Result<Action>
where
    K: Resource + Send + Sync + 'static,
    R: Reconciler,
{
    let start = Instant::now();
    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let key = ObjectKey::of(obj.as_ref())
        .ok_or_else(|| OperatorError::InvalidConfig("watched object has no name".to_string()))?;
    let result = ctx.reconciler.reconcile(&key).await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    match result {
        Ok(action) => {
            ctx.error_counts.remove(&key);
            Ok(action)
        }
        Err(e) => {
            if let Some(ref metrics) = ctx.metrics {
                metrics.errors.increment(1);
            }
            Err(e)
        }
    }
}

/// Error policy: suggested delay for the error class, capped by per-object
/// exponential backoff
fn error_policy<K, R>(obj: Arc<K>, error: &OperatorError, ctx: Arc<ControllerContext<R>>) -> Action
where
    K: Resource,
    R: Reconciler,
{
    let Some(key) = ObjectKey::of(obj.as_ref()) else {
        return Action::requeue(ctx.config.error_backoff_max);
    };
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    let backoff = ctx.config.error_backoff(retries);
    let delay = error
        .requeue_delay()
        .map_or(backoff, |suggested| suggested.min(backoff));

    warn!(
        error = %error,
        kind = ctx.reconciler.kind(),
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}

fn log_result<K: Resource, E: Debug + std::fmt::Display>(
    kind: &'static str,
) -> impl Fn(std::result::Result<(ObjectRef<K>, Action), E>) -> futures::future::Ready<()> {
    move |result| {
        match result {
            Ok((obj, action)) => {
                debug!(kind, name = obj.name, namespace = obj.namespace, ?action, "Reconciliation completed");
            }
            Err(e) => {
                error!(kind, error = %e, "Reconciliation failed");
            }
        }
        futures::future::ready(())
    }
}

/// ControlPlanes in the DataPlane's namespace that reference it by name
pub fn referencing_controlplanes(
    controlplanes: &[Arc<ControlPlane>],
    dataplane: &DataPlane,
) -> Vec<ObjectRef<ControlPlane>> {
    let namespace = dataplane.namespace();
    let name = dataplane.name_any();
    controlplanes
        .iter()
        .filter(|cp| cp.namespace() == namespace)
        .filter(|cp| cp.spec.data_plane.as_deref() == Some(name.as_str()))
        .map(|cp| ObjectRef::from_obj(cp.as_ref()))
        .collect()
}

/// Run both controllers until a shutdown signal arrives
pub async fn run(client: Client, config: OperatorConfig) -> Result<()> {
    let namespace = config.namespace.clone();
    let ns = namespace.as_deref();

    let ctx = Arc::new(Context::new(
        Stores::kube(client.clone()),
        config.clone(),
        Arc::new(SystemClock),
    ));

    info!(
        namespace = ns.unwrap_or("all"),
        "Starting DataPlane and ControlPlane controllers"
    );

    let dataplane_ctx = Arc::new(ControllerContext::new(
        DataPlaneReconciler::new(ctx.clone()),
        config.clone(),
    ));
    let dataplanes = Controller::new(DataPlane::api(client.clone(), ns), Config::default())
        .owns(Deployment::api(client.clone(), ns), Config::default())
        .owns(Service::api(client.clone(), ns), Config::default())
        .shutdown_on_signal()
        .run(
            reconcile::<DataPlane, DataPlaneReconciler>,
            error_policy::<DataPlane, DataPlaneReconciler>,
            dataplane_ctx,
        )
        .for_each(log_result::<DataPlane, _>("DataPlane"));

    let controlplane_ctx = Arc::new(ControllerContext::new(
        ControlPlaneReconciler::new(ctx),
        config,
    ));
    let controller = Controller::new(ControlPlane::api(client.clone(), ns), Config::default());
    let cache = controller.store();
    let controlplanes = controller
        .owns(Deployment::api(client.clone(), ns), Config::default())
        .owns(ServiceAccount::api(client.clone(), ns), Config::default())
        .watches(DataPlane::api(client, ns), Config::default(), move |dataplane| {
            let affected = referencing_controlplanes(&cache.state(), &dataplane);
            debug!(
                dataplane = %dataplane.name_any(),
                affected = affected.len(),
                "DataPlane changed, requeueing referencing ControlPlanes"
            );
            affected
        })
        .shutdown_on_signal()
        .run(
            reconcile::<ControlPlane, ControlPlaneReconciler>,
            error_policy::<ControlPlane, ControlPlaneReconciler>,
            controlplane_ctx,
        )
        .for_each(log_result::<ControlPlane, _>("ControlPlane"));

    futures::join!(dataplanes, controlplanes);
    info!("Controllers stopped");
    Ok(())
}
