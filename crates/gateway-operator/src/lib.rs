//! # Gateway Kubernetes Operator
//!
//! Reconciles two custom resources into running gateway infrastructure:
//!
//! - **DataPlane** (`kdp`): a Kong proxy Deployment plus a LoadBalancer
//!   Service. Admitted immediately; `Provisioned` once the pods are ready.
//! - **ControlPlane** (`kcp`): an ingress controller Deployment with its own
//!   ServiceAccount, ClusterRole and ClusterRoleBinding. The controller is
//!   scaled to zero until the DataPlane it references is provisioned.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use gateway_operator::prelude::*;
//! use kube::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     run(client, OperatorConfig::default()).await
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Watch**: DataPlanes, ControlPlanes and the objects they own. A DataPlane
//!    change also requeues every ControlPlane that references it.
//! 2. **Reconcile**: re-read the resource by key, converge each owned object
//!    to exactly one attributed instance, then fold what was observed into
//!    status conditions.
//! 3. **Finalize**: ControlPlanes carry a finalizer so their cluster-scoped
//!    RBAC objects are deleted before the ControlPlane itself goes away.
//!
//! All cluster access goes through [`store::ObjectStore`], so the reconcilers
//! run unchanged against the API server or an in-memory store.
//!
//! ## Modules
//!
//! - [`crd`] - DataPlane/ControlPlane types, conditions and validation
//! - [`dataplane`] / [`controlplane`] - the two reconcilers
//! - [`resources`] - desired-state builders for owned objects
//! - [`owned`] - single-instance convergence of owned objects
//! - [`finalizer`] - cleanup gating for deletion
//! - [`controller`] - `kube::runtime` wiring, metrics and error policy

pub mod clock;
pub mod conditions;
pub mod config;
pub mod consts;
pub mod controller;
pub mod controlplane;
pub mod crd;
pub mod dataplane;
pub mod error;
pub mod finalizer;
pub mod owned;
pub mod reconciler;
pub mod resources;
pub mod retry;
pub mod store;

#[cfg(test)]
mod testing;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::config::OperatorConfig;
    pub use crate::controller::{run, ControllerContext, ControllerMetrics};
    pub use crate::controlplane::{ControlPlanePhase, ControlPlaneReconciler};
    pub use crate::crd::{
        Condition, ConditionReason, ConditionStatus, ConditionType, ControlPlane,
        ControlPlaneSpec, ControlPlaneStatus, DataPlane, DataPlaneSpec, DataPlaneStatus,
        DeploymentOptions,
    };
    pub use crate::dataplane::{DataPlanePhase, DataPlaneReconciler};
    pub use crate::error::{OperatorError, Result};
    pub use crate::reconciler::{Context, Reconciler};
    pub use crate::store::{ObjectKey, ObjectStore, Stores};
}
