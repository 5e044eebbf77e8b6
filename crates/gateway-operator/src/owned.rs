//! Owned-resource convergence
//!
//! [`converge`] makes exactly one object matching an owner selector look like
//! a desired template. It lists matches, creates when there are none, prunes
//! duplicates keeping the newest, and writes only when a field the operator
//! controls has drifted. Fields set by other actors (defaults filled in by the
//! API server, node ports, cluster IPs) are left alone.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, Probe, Service, ServiceAccount, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use std::fmt::Debug;
use tracing::{debug, info, warn};

use crate::consts::OWNER_UID_LABEL;
use crate::error::{OperatorError, Result};
use crate::store::{ObjectKey, ObjectStore, Selector};

/// How an existing object differs from the desired one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drift {
    None,
    /// Mutable fields were brought in line; the object must be written back
    Patch,
    /// An immutable field differs; the object must be replaced wholesale
    Recreate,
}

impl Drift {
    fn merge(self, other: Drift) -> Drift {
        match (self, other) {
            (Drift::Recreate, _) | (_, Drift::Recreate) => Drift::Recreate,
            (Drift::Patch, _) | (_, Drift::Patch) => Drift::Patch,
            _ => Drift::None,
        }
    }

    fn from_changed(changed: bool) -> Drift {
        if changed {
            Drift::Patch
        } else {
            Drift::None
        }
    }
}

/// An object kind the operator owns and knows how to diff
pub trait OwnedObject: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static {
    /// Copy every operator-controlled field of `desired` that differs into
    /// `self`, reporting what kind of write that requires
    fn align_with(&mut self, desired: &Self) -> Drift;
}

/// Add any missing or changed desired labels, keeping foreign ones
fn align_labels(meta: &mut ObjectMeta, desired: &ObjectMeta) -> Drift {
    let Some(wanted) = desired.labels.as_ref() else {
        return Drift::None;
    };
    let labels = meta.labels.get_or_insert_with(Default::default);
    let mut changed = false;
    for (k, v) in wanted {
        if labels.get(k) != Some(v) {
            labels.insert(k.clone(), v.clone());
            changed = true;
        }
    }
    Drift::from_changed(changed)
}

fn assign<T: PartialEq + Clone>(current: &mut T, desired: &T) -> bool {
    if current != desired {
        *current = desired.clone();
        true
    } else {
        false
    }
}

/// Ports compared on what we declare; protocol defaults are server-filled
fn ports_differ<T, F>(current: Option<&Vec<T>>, desired: Option<&Vec<T>>, key: F) -> bool
where
    F: Fn(&T) -> (Option<String>, i32),
{
    let current: Vec<_> = current.into_iter().flatten().map(&key).collect();
    let desired: Vec<_> = desired.into_iter().flatten().map(&key).collect();
    current != desired
}

type ProbeKey = (Option<String>, Option<IntOrString>, Option<String>, Option<i32>, Option<i32>);

/// Probe fields we declare; thresholds and timeouts are server-filled
fn probe_key(probe: Option<&Probe>) -> Option<ProbeKey> {
    probe.map(|p| {
        let http = p.http_get.as_ref();
        (
            http.and_then(|h| h.path.clone()),
            http.map(|h| h.port.clone()),
            http.and_then(|h| h.scheme.clone()),
            p.initial_delay_seconds,
            p.period_seconds,
        )
    })
}

fn align_container(current: &mut Container, desired: &Container) -> bool {
    let mut changed = assign(&mut current.image, &desired.image);
    changed |= assign(&mut current.env, &desired.env);
    if ports_differ(current.ports.as_ref(), desired.ports.as_ref(), |p| {
        (p.name.clone(), p.container_port)
    }) {
        current.ports = desired.ports.clone();
        changed = true;
    }
    if desired.readiness_probe.is_some()
        && probe_key(current.readiness_probe.as_ref()) != probe_key(desired.readiness_probe.as_ref())
    {
        current.readiness_probe = desired.readiness_probe.clone();
        changed = true;
    }
    changed
}

impl OwnedObject for Deployment {
    fn align_with(&mut self, desired: &Self) -> Drift {
        let mut drift = align_labels(&mut self.metadata, &desired.metadata);
        let (Some(spec), Some(wanted)) = (self.spec.as_mut(), desired.spec.as_ref()) else {
            return Drift::Recreate;
        };

        if spec.selector != wanted.selector {
            return Drift::Recreate;
        }
        drift = drift.merge(Drift::from_changed(assign(&mut spec.replicas, &wanted.replicas)));

        if let (Some(meta), Some(wanted_meta)) =
            (spec.template.metadata.as_mut(), wanted.template.metadata.as_ref())
        {
            drift = drift.merge(align_labels(meta, wanted_meta));
        }

        let (Some(pod), Some(wanted_pod)) = (spec.template.spec.as_mut(), wanted.template.spec.as_ref())
        else {
            return Drift::Recreate;
        };
        drift = drift.merge(Drift::from_changed(assign(
            &mut pod.service_account_name,
            &wanted_pod.service_account_name,
        )));

        let same_containers = pod.containers.len() == wanted_pod.containers.len()
            && pod
                .containers
                .iter()
                .zip(&wanted_pod.containers)
                .all(|(a, b)| a.name == b.name);
        if !same_containers {
            pod.containers = wanted_pod.containers.clone();
            return drift.merge(Drift::Patch);
        }
        for (current, wanted) in pod.containers.iter_mut().zip(&wanted_pod.containers) {
            drift = drift.merge(Drift::from_changed(align_container(current, wanted)));
        }
        drift
    }
}

fn service_port_key(port: &ServicePort) -> (Option<String>, i32) {
    (port.name.clone(), port.port)
}

impl OwnedObject for Service {
    fn align_with(&mut self, desired: &Self) -> Drift {
        let mut drift = align_labels(&mut self.metadata, &desired.metadata);
        let (Some(spec), Some(wanted)) = (self.spec.as_mut(), desired.spec.as_ref()) else {
            return Drift::Recreate;
        };

        drift = drift.merge(Drift::from_changed(assign(&mut spec.type_, &wanted.type_)));
        drift = drift.merge(Drift::from_changed(assign(&mut spec.selector, &wanted.selector)));

        let targets_differ = {
            let current: Vec<_> = spec.ports.iter().flatten().map(|p| &p.target_port).collect();
            let desired: Vec<_> = wanted.ports.iter().flatten().map(|p| &p.target_port).collect();
            current != desired
        };
        if targets_differ
            || ports_differ(spec.ports.as_ref(), wanted.ports.as_ref(), service_port_key)
        {
            // keep allocated node ports for ports that survive
            let mut ports = wanted.ports.clone().unwrap_or_default();
            for port in &mut ports {
                port.node_port = spec
                    .ports
                    .iter()
                    .flatten()
                    .find(|p| p.name == port.name)
                    .and_then(|p| p.node_port);
            }
            spec.ports = Some(ports);
            drift = drift.merge(Drift::Patch);
        }
        drift
    }
}

impl OwnedObject for ServiceAccount {
    fn align_with(&mut self, desired: &Self) -> Drift {
        align_labels(&mut self.metadata, &desired.metadata)
    }
}

impl OwnedObject for ClusterRole {
    fn align_with(&mut self, desired: &Self) -> Drift {
        align_labels(&mut self.metadata, &desired.metadata)
            .merge(Drift::from_changed(assign(&mut self.rules, &desired.rules)))
    }
}

impl OwnedObject for ClusterRoleBinding {
    fn align_with(&mut self, desired: &Self) -> Drift {
        if self.role_ref != desired.role_ref {
            return Drift::Recreate;
        }
        align_labels(&mut self.metadata, &desired.metadata)
            .merge(Drift::from_changed(assign(&mut self.subjects, &desired.subjects)))
    }
}

/// What [`converge`] had to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    Updated,
    Recreated,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct Converged<K> {
    pub object: K,
    pub outcome: SyncOutcome,
    /// Duplicates deleted on the way
    pub pruned: usize,
}

/// Namespaced objects must also carry an owner reference to the owner's UID;
/// a label copied onto a foreign object is not enough to claim it
fn attributed<K: Resource>(obj: &K, owner_uid: Option<&str>) -> bool {
    let Some(uid) = owner_uid else {
        return true;
    };
    match obj.meta().owner_references.as_ref() {
        Some(refs) if !refs.is_empty() => refs.iter().any(|r| r.uid == uid),
        _ => obj.meta().namespace.is_none(),
    }
}

fn key_of<K: Resource<DynamicType = ()>>(obj: &K) -> Result<ObjectKey> {
    ObjectKey::of(obj).ok_or_else(|| {
        OperatorError::InvalidConfig(format!("listed {} without a name", K::kind(&())))
    })
}

/// Delete all but the newest match, returning the survivor
async fn prune<K: OwnedObject>(store: &dyn ObjectStore<K>, mut matches: Vec<K>) -> Result<(Option<K>, usize)> {
    matches.sort_by(|a, b| {
        let (ma, mb) = (a.meta(), b.meta());
        ma.creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .cmp(&mb.creation_timestamp.as_ref().map(|t| t.0))
            .then_with(|| ma.name.cmp(&mb.name))
    });
    let newest = matches.pop();
    let pruned = matches.len();
    for extra in matches {
        let key = key_of(&extra)?;
        warn!(kind = %K::kind(&()), key = %key, "Deleting duplicate owned object");
        store.delete(&key).await?;
    }
    Ok((newest, pruned))
}

/// Converge the single object selected by `selector` onto `desired`
///
/// Stale writes and create races are retried with a fresh list, up to
/// `attempts` times. Any other error is returned as is.
pub async fn converge<K: OwnedObject>(
    store: &dyn ObjectStore<K>,
    selector: &Selector,
    desired: &K,
    attempts: u32,
) -> Result<Converged<K>> {
    let kind = K::kind(&());
    let owner_uid = selector.labels.get(OWNER_UID_LABEL).map(String::as_str);
    let mut pruned = 0;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let matches: Vec<K> = store
            .list(selector)
            .await?
            .into_iter()
            .filter(|o| o.meta().deletion_timestamp.is_none() && attributed(o, owner_uid))
            .collect();

        let (existing, removed) = prune(store, matches).await?;
        pruned += removed;

        let result = match existing {
            None => store.create(desired).await.map(|object| {
                info!(kind = %kind, name = ?object.meta().name, "Created owned object");
                (object, SyncOutcome::Created)
            }),
            Some(mut existing) => match existing.align_with(desired) {
                Drift::None => Ok((existing, SyncOutcome::Unchanged)),
                Drift::Patch => store.replace(&existing).await.map(|object| {
                    info!(kind = %kind, name = ?object.meta().name, "Updated drifted owned object");
                    (object, SyncOutcome::Updated)
                }),
                Drift::Recreate => {
                    store.delete(&key_of(&existing)?).await?;
                    store.create(desired).await.map(|object| {
                        info!(kind = %kind, name = ?object.meta().name, "Recreated owned object");
                        (object, SyncOutcome::Recreated)
                    })
                }
            },
        };

        match result {
            Ok((object, outcome)) => {
                return Ok(Converged {
                    object,
                    outcome,
                    pruned,
                })
            }
            Err(e) if e.is_transient() && attempt < attempts => {
                debug!(kind = %kind, attempt, error = %e, "Re-listing after write race");
            }
            Err(e) => return Err(e),
        }
    }
}
