//! Names, labels and ports shared by the reconcilers

/// Field manager used for every write the operator issues
pub const FIELD_MANAGER: &str = "gateway-operator";

/// Label marking which reconciler controls an object
pub const CONTROLLED_LABEL: &str = "konghq.com/gateway-operator";

/// Controlled-label value for objects owned by a DataPlane
pub const DATAPLANE_MANAGED_VALUE: &str = "dataplane";

/// Controlled-label value for objects owned by a ControlPlane
pub const CONTROLPLANE_MANAGED_VALUE: &str = "controlplane";

/// Owner UID, disambiguates objects across name collisions
pub const OWNER_UID_LABEL: &str = "gateway-operator.konghq.com/owner-uid";

/// Owner namespace, required for cluster-scoped objects
pub const OWNER_NAMESPACE_LABEL: &str = "gateway-operator.konghq.com/owner-namespace";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "gateway-operator";

/// Pod selector label
pub const APP_LABEL: &str = "app";

/// Finalizer gating ControlPlane removal on cluster-scoped cleanup
pub const CLUSTER_RESOURCES_FINALIZER: &str = "gateway-operator.konghq.com/cluster-resources";

pub const DATAPLANE_CONTAINER_NAME: &str = "proxy";
pub const CONTROLPLANE_CONTAINER_NAME: &str = "controller";

pub const DEFAULT_DATAPLANE_IMAGE: &str = "kong:3.0";
pub const DEFAULT_CONTROLPLANE_IMAGE: &str = "kong/kubernetes-ingress-controller:2.7";

pub const DATAPLANE_PROXY_PORT: i32 = 8000;
pub const DATAPLANE_PROXY_SERVICE_PORT: i32 = 80;
pub const DATAPLANE_ADMIN_PORT: i32 = 8444;
pub const DATAPLANE_STATUS_PORT: i32 = 8100;

/// Reserved variable carrying the hosting pod's own name
pub const ENV_POD_NAME: &str = "POD_NAME";
pub const ENV_POD_NAMESPACE: &str = "POD_NAMESPACE";
pub const ENV_KONG_ADMIN_URL: &str = "CONTROLLER_KONG_ADMIN_URL";
pub const ENV_KONG_ADMIN_TLS_SKIP_VERIFY: &str = "CONTROLLER_KONG_ADMIN_TLS_SKIP_VERIFY";
pub const ENV_PUBLISH_SERVICE: &str = "CONTROLLER_PUBLISH_SERVICE";

/// Variables the ControlPlane workload always sets itself
pub const CONTROLPLANE_RESERVED_ENV: [&str; 5] = [
    ENV_POD_NAME,
    ENV_POD_NAMESPACE,
    ENV_KONG_ADMIN_URL,
    ENV_KONG_ADMIN_TLS_SKIP_VERIFY,
    ENV_PUBLISH_SERVICE,
];
