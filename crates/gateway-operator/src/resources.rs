//! Kubernetes Resource Builders
//!
//! Generates the desired shape of every object a DataPlane or ControlPlane
//! owns. Builders are pure: they never talk to the API server, so the same
//! desired object can be rebuilt on every reconcile and diffed against what
//! exists.

use crate::consts::*;
use crate::crd::{ControlPlane, DataPlane};
use crate::error::{OperatorError, Result};
use crate::store::Selector;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, ObjectFieldSelector, PodSpec,
    PodTemplateSpec, Probe, Service, ServiceAccount, ServicePort, ServiceSpec,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

/// Identity of the resource that owns a set of objects
#[derive(Debug, Clone)]
pub struct Owner {
    name: String,
    namespace: String,
    uid: String,
    managed_value: &'static str,
    reference: OwnerReference,
}

impl Owner {
    pub fn of<K: Resource<DynamicType = ()>>(obj: &K, managed_value: &'static str) -> Result<Self> {
        let name = obj.meta().name.clone().ok_or_else(|| {
            OperatorError::InvalidConfig(format!("{} name is required", K::kind(&())))
        })?;
        let namespace = obj.namespace().ok_or_else(|| {
            OperatorError::InvalidConfig(format!("{} {} has no namespace", K::kind(&()), name))
        })?;
        let uid = obj.uid().ok_or_else(|| {
            OperatorError::InvalidConfig(format!("{} {} has no uid yet", K::kind(&()), name))
        })?;
        let reference = obj.controller_owner_ref(&()).ok_or_else(|| {
            OperatorError::InvalidConfig(format!("cannot reference {} {}", K::kind(&()), name))
        })?;

        Ok(Self {
            name,
            namespace,
            uid,
            managed_value,
            reference,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Labels attributing an object to this owner
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(CONTROLLED_LABEL.to_string(), self.managed_value.to_string());
        labels.insert(OWNER_UID_LABEL.to_string(), self.uid.clone());
        labels.insert(OWNER_NAMESPACE_LABEL.to_string(), self.namespace.clone());
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        labels
    }

    /// Pod selector labels for the owned workload
    pub fn pod_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(APP_LABEL.to_string(), self.name.clone());
        labels.insert(CONTROLLED_LABEL.to_string(), self.managed_value.to_string());
        labels
    }

    /// Selector for owned objects in the owner's namespace
    pub fn namespaced_selector(&self) -> Selector {
        Selector::new(Some(self.namespace.clone()))
            .with_label(CONTROLLED_LABEL, self.managed_value)
            .with_label(OWNER_UID_LABEL, self.uid.clone())
    }

    /// Selector for owned cluster-scoped objects
    pub fn cluster_selector(&self) -> Selector {
        Selector::new(None)
            .with_label(CONTROLLED_LABEL, self.managed_value)
            .with_label(OWNER_UID_LABEL, self.uid.clone())
    }

    /// Dots are valid in owner names but not in Service names
    fn generate_name(&self) -> String {
        format!("{}-{}-", self.managed_value, self.name.replace('.', "-"))
    }

    fn namespaced_metadata(&self) -> ObjectMeta {
        ObjectMeta {
            generate_name: Some(self.generate_name()),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels()),
            owner_references: Some(vec![self.reference.clone()]),
            ..Default::default()
        }
    }

    fn cluster_metadata(&self) -> ObjectMeta {
        ObjectMeta {
            generate_name: Some(self.generate_name()),
            labels: Some(self.labels()),
            ..Default::default()
        }
    }

    /// Single-container Deployment selecting this owner's pods
    fn deployment(
        &self,
        container: Container,
        replicas: i32,
        service_account: Option<String>,
    ) -> Deployment {
        let pod_labels = self.pod_labels();
        let mut metadata = self.namespaced_metadata();
        if let Some(labels) = metadata.labels.as_mut() {
            labels.insert(APP_LABEL.to_string(), self.name.clone());
        }

        Deployment {
            metadata,
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                selector: LabelSelector {
                    match_labels: Some(pod_labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        service_account_name: service_account,
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn literal(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn field_ref(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: Some("v1".to_string()),
                field_path: field_path.to_string(),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn service_port(name: &str, port: i32, target: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(target)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Overlay `overrides` on `defaults`: same-name entries replace in place,
/// the rest are appended in declared order.
pub fn overlay_env(defaults: Vec<EnvVar>, overrides: &[EnvVar]) -> Vec<EnvVar> {
    let mut env = defaults;
    for var in overrides {
        match env.iter_mut().find(|e| e.name == var.name) {
            Some(existing) => *existing = var.clone(),
            None => env.push(var.clone()),
        }
    }
    env
}

/// Default proxy configuration, overridable through the DataPlane spec
fn dataplane_default_env() -> Vec<EnvVar> {
    vec![
        literal("KONG_DATABASE", "off"),
        literal(
            "KONG_ADMIN_LISTEN",
            &format!("0.0.0.0:{} ssl", DATAPLANE_ADMIN_PORT),
        ),
        literal(
            "KONG_PROXY_LISTEN",
            &format!("0.0.0.0:{}", DATAPLANE_PROXY_PORT),
        ),
        literal(
            "KONG_STATUS_LISTEN",
            &format!("0.0.0.0:{}", DATAPLANE_STATUS_PORT),
        ),
        literal("KONG_PROXY_ACCESS_LOG", "/dev/stdout"),
        literal("KONG_ADMIN_ACCESS_LOG", "/dev/stdout"),
        literal("KONG_PROXY_ERROR_LOG", "/dev/stderr"),
        literal("KONG_ADMIN_ERROR_LOG", "/dev/stderr"),
    ]
}

/// Builder for the objects a DataPlane owns
pub struct DataPlaneBuilder<'a> {
    dataplane: &'a DataPlane,
    owner: Owner,
    default_image: &'a str,
}

impl<'a> DataPlaneBuilder<'a> {
    pub fn new(dataplane: &'a DataPlane, default_image: &'a str) -> Result<Self> {
        Ok(Self {
            dataplane,
            owner: Owner::of(dataplane, DATAPLANE_MANAGED_VALUE)?,
            default_image,
        })
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    fn build_container(&self) -> Container {
        let options = &self.dataplane.spec.deployment;

        Container {
            name: DATAPLANE_CONTAINER_NAME.to_string(),
            image: Some(options.image_or(self.default_image)),
            env: Some(overlay_env(dataplane_default_env(), &options.env)),
            ports: Some(vec![
                container_port("proxy", DATAPLANE_PROXY_PORT),
                container_port("admin", DATAPLANE_ADMIN_PORT),
                container_port("status", DATAPLANE_STATUS_PORT),
            ]),
            readiness_probe: Some(Probe {
                http_get: Some(HTTPGetAction {
                    path: Some("/status".to_string()),
                    port: IntOrString::Int(DATAPLANE_STATUS_PORT),
                    scheme: Some("HTTP".to_string()),
                    ..Default::default()
                }),
                initial_delay_seconds: Some(5),
                period_seconds: Some(10),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the proxy Deployment
    pub fn build_deployment(&self) -> Deployment {
        let replicas = self.dataplane.spec.deployment.replicas_or_default();
        self.owner.deployment(self.build_container(), replicas, None)
    }

    /// Build the LoadBalancer Service exposing the proxy and admin ports
    pub fn build_service(&self) -> Service {
        Service {
            metadata: self.owner.namespaced_metadata(),
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                selector: Some(self.owner.pod_labels()),
                ports: Some(vec![
                    service_port("proxy", DATAPLANE_PROXY_SERVICE_PORT, DATAPLANE_PROXY_PORT),
                    service_port("admin", DATAPLANE_ADMIN_PORT, DATAPLANE_ADMIN_PORT),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Container environment for a ControlPlane, plus user entries that were
/// discarded because they name a reserved variable
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerEnv {
    pub env: Vec<EnvVar>,
    pub dropped: Vec<String>,
}

/// Reserved variables first, then DataPlane wiring when attached, then the
/// user's entries in declared order. Reserved names always win.
pub fn controlplane_env(
    namespace: &str,
    user: &[EnvVar],
    dataplane_service: Option<&str>,
) -> ControllerEnv {
    let mut env = vec![
        field_ref(ENV_POD_NAME, "metadata.name"),
        field_ref(ENV_POD_NAMESPACE, "metadata.namespace"),
    ];

    if let Some(service) = dataplane_service {
        env.push(literal(
            ENV_KONG_ADMIN_URL,
            &format!("https://{}.{}.svc:{}", service, namespace, DATAPLANE_ADMIN_PORT),
        ));
        env.push(literal(ENV_KONG_ADMIN_TLS_SKIP_VERIFY, "true"));
        env.push(literal(
            ENV_PUBLISH_SERVICE,
            &format!("{}/{}", namespace, service),
        ));
    }

    let mut dropped = Vec::new();
    for var in user {
        if CONTROLPLANE_RESERVED_ENV.contains(&var.name.as_str()) {
            dropped.push(var.name.clone());
        } else {
            env.push(var.clone());
        }
    }

    ControllerEnv { env, dropped }
}

fn rule(api_groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(api_groups.iter().map(|s| s.to_string()).collect()),
        resources: Some(resources.iter().map(|s| s.to_string()).collect()),
        verbs: verbs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

const READ: &[&str] = &["get", "list", "watch"];

/// Permissions the ingress controller needs to operate
pub fn controller_rules() -> Vec<PolicyRule> {
    vec![
        rule(
            &[""],
            &["endpoints", "nodes", "pods", "secrets", "namespaces", "services", "configmaps"],
            &["list", "watch"],
        ),
        rule(&[""], &["events"], &["create", "patch"]),
        rule(&[""], &["services/status"], &["get", "patch", "update"]),
        rule(&["discovery.k8s.io"], &["endpointslices"], READ),
        rule(&["networking.k8s.io"], &["ingresses", "ingressclasses"], READ),
        rule(&["networking.k8s.io"], &["ingresses/status"], &["get", "patch", "update"]),
        rule(
            &["gateway.networking.k8s.io"],
            &[
                "gateways",
                "gatewayclasses",
                "httproutes",
                "tcproutes",
                "udproutes",
                "tlsroutes",
                "grpcroutes",
                "referencegrants",
            ],
            READ,
        ),
        rule(
            &["gateway.networking.k8s.io"],
            &[
                "gateways/status",
                "gatewayclasses/status",
                "httproutes/status",
                "tcproutes/status",
                "udproutes/status",
                "tlsroutes/status",
                "grpcroutes/status",
            ],
            &["get", "patch", "update"],
        ),
        rule(
            &["configuration.konghq.com"],
            &[
                "kongplugins",
                "kongclusterplugins",
                "kongconsumers",
                "kongingresses",
                "tcpingresses",
                "udpingresses",
                "ingressclassparameterses",
            ],
            READ,
        ),
        rule(
            &["configuration.konghq.com"],
            &[
                "kongplugins/status",
                "kongclusterplugins/status",
                "kongconsumers/status",
                "kongingresses/status",
                "tcpingresses/status",
                "udpingresses/status",
            ],
            &["get", "patch", "update"],
        ),
        rule(
            &["coordination.k8s.io"],
            &["leases"],
            &["get", "list", "watch", "create", "update", "patch", "delete"],
        ),
    ]
}

/// Builder for the objects a ControlPlane owns
pub struct ControlPlaneBuilder<'a> {
    controlplane: &'a ControlPlane,
    owner: Owner,
    default_image: &'a str,
}

impl<'a> ControlPlaneBuilder<'a> {
    pub fn new(controlplane: &'a ControlPlane, default_image: &'a str) -> Result<Self> {
        Ok(Self {
            controlplane,
            owner: Owner::of(controlplane, CONTROLPLANE_MANAGED_VALUE)?,
            default_image,
        })
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    pub fn build_service_account(&self) -> ServiceAccount {
        ServiceAccount {
            metadata: self.owner.namespaced_metadata(),
            ..Default::default()
        }
    }

    pub fn build_cluster_role(&self) -> ClusterRole {
        ClusterRole {
            metadata: self.owner.cluster_metadata(),
            rules: Some(controller_rules()),
            ..Default::default()
        }
    }

    pub fn build_cluster_role_binding(&self, role: &str, service_account: &str) -> ClusterRoleBinding {
        ClusterRoleBinding {
            metadata: self.owner.cluster_metadata(),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: role.to_string(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: service_account.to_string(),
                namespace: Some(self.owner.namespace.clone()),
                ..Default::default()
            }]),
        }
    }

    /// Environment for the controller container
    pub fn env(&self, dataplane_service: Option<&str>) -> ControllerEnv {
        controlplane_env(
            &self.owner.namespace,
            &self.controlplane.spec.deployment.env,
            dataplane_service,
        )
    }

    /// Build the controller Deployment with an explicit replica count
    pub fn build_deployment(&self, env: Vec<EnvVar>, replicas: i32, service_account: &str) -> Deployment {
        let container = Container {
            name: CONTROLPLANE_CONTAINER_NAME.to_string(),
            image: Some(
                self.controlplane
                    .spec
                    .deployment
                    .image_or(self.default_image),
            ),
            env: Some(env),
            ..Default::default()
        };
        self.owner
            .deployment(container, replicas, Some(service_account.to_string()))
    }
}

/// A Deployment is ready once the rollout for its current generation has
/// at least one ready replica and ready/available counts meet the desired count
pub fn deployment_ready(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let generation = deployment.metadata.generation.unwrap_or(0);
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    let ready = status.ready_replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);

    status.observed_generation.unwrap_or(0) >= generation
        && ready >= 1
        && ready >= desired
        && available >= desired
}

/// Ready replica count as reported by the workload controller
pub fn ready_replicas(deployment: &Deployment) -> i32 {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
}

/// IPs or hostnames assigned by the load balancer
pub fn load_balancer_addresses(service: &Service) -> Vec<String> {
    service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|ingress| {
            ingress
                .iter()
                .filter_map(|i| i.ip.clone().or_else(|| i.hostname.clone()))
                .collect()
        })
        .unwrap_or_default()
}
