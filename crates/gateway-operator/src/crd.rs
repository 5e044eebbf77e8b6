//! Custom Resource Definitions for the gateway operator
//!
//! This module defines the `DataPlane` and `ControlPlane` CRDs. A DataPlane
//! runs the proxy tier of a gateway, a ControlPlane runs the controller tier
//! and is attached to a DataPlane by name.

use k8s_openapi::api::core::v1::EnvVar;
use kube::{CustomResource, CustomResourceExt};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

use crate::error::Result;

/// Regex for validating object names (RFC 1123 subdomain)
static NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap()
});

/// Regex for environment variable names (C identifier, as accepted by most runtimes)
static ENV_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.-]*$").unwrap());

/// Maximum number of environment overrides accepted on a resource
const MAX_ENV_VARS: usize = 100;

/// Validate a container image reference
fn validate_image(value: &str) -> std::result::Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::new("empty_image")
            .with_message("image must not be empty when set".into()));
    }
    if value.len() > 255 {
        return Err(ValidationError::new("image_too_long")
            .with_message("image reference exceeds 255 characters".into()));
    }
    if value.contains("..") || value.starts_with('/') || value.starts_with('-') {
        return Err(ValidationError::new("invalid_image")
            .with_message(format!("'{}' is not a valid container image", value).into()));
    }
    Ok(())
}

/// Validate an object name (RFC 1123 subdomain, as DataPlane names are)
fn validate_object_name(value: &str) -> std::result::Result<(), ValidationError> {
    if value.len() > 253 {
        return Err(
            ValidationError::new("name_too_long").with_message("name exceeds 253 characters".into())
        );
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

/// Validate environment overrides
fn validate_env_vars(vars: &[EnvVar]) -> std::result::Result<(), ValidationError> {
    if vars.len() > MAX_ENV_VARS {
        return Err(ValidationError::new("too_many_env_vars").with_message(
            format!("maximum {} environment variables allowed", MAX_ENV_VARS).into(),
        ));
    }
    let forbidden_names = [
        "LD_PRELOAD",
        "LD_LIBRARY_PATH",
        "DYLD_INSERT_LIBRARIES",
        "DYLD_LIBRARY_PATH",
    ];
    let mut seen = HashSet::new();
    for var in vars {
        if var.name.is_empty() || var.name.len() > 256 || !ENV_NAME_REGEX.is_match(&var.name) {
            return Err(ValidationError::new("invalid_env_name").with_message(
                format!("'{}' is not a valid environment variable name", var.name).into(),
            ));
        }
        if forbidden_names.contains(&var.name.as_str()) || var.name.starts_with("LD_AUDIT") {
            return Err(ValidationError::new("forbidden_env_var").with_message(
                format!(
                    "environment variable '{}' is not allowed for security",
                    var.name
                )
                .into(),
            ));
        }
        if !seen.insert(var.name.as_str()) {
            return Err(ValidationError::new("duplicate_env_var").with_message(
                format!("environment variable '{}' is declared more than once", var.name).into(),
            ));
        }
    }
    Ok(())
}

/// Flatten validator output into one human readable line
pub fn describe_validation_errors(errors: &validator::ValidationErrors) -> String {
    let mut messages: Vec<String> = Vec::new();
    collect_messages(errors, "", &mut messages);
    messages.sort();
    messages.join("; ")
}

fn collect_messages(errors: &validator::ValidationErrors, prefix: &str, out: &mut Vec<String>) {
    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{}.{}", prefix, field)
        };
        match kind {
            validator::ValidationErrorsKind::Field(errs) => {
                for e in errs {
                    let message = e
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| e.code.to_string());
                    out.push(format!("{}: {}", path, message));
                }
            }
            validator::ValidationErrorsKind::Struct(inner) => {
                collect_messages(inner, &path, out);
            }
            validator::ValidationErrorsKind::List(items) => {
                for (idx, inner) in items {
                    collect_messages(inner, &format!("{}[{}]", path, idx), out);
                }
            }
        }
    }
}

/// Sparse override of the default workload template
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentOptions {
    /// Environment variables for the workload container, in declared order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[validate(custom(function = "validate_env_vars"))]
    pub env: Vec<EnvVar>,

    /// Container image (overrides the operator default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_image"))]
    pub image: Option<String>,

    /// Replica count (defaults to 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 0, max = 100, message = "replicas must be between 0 and 100"))]
    pub replicas: Option<i32>,
}

impl DeploymentOptions {
    /// Replica count requested by the user, or the single-instance default
    pub fn replicas_or_default(&self) -> i32 {
        self.replicas.unwrap_or(1)
    }

    /// Image requested by the user, or the given default
    pub fn image_or(&self, default: &str) -> String {
        self.image.clone().unwrap_or_else(|| default.to_string())
    }
}

/// DataPlane custom resource definition
///
/// Runs the proxy tier of a gateway: one Deployment and one LoadBalancer
/// Service exposing the proxy and the TLS admin endpoint.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "gateway-operator.konghq.com",
    version = "v1alpha1",
    kind = "DataPlane",
    plural = "dataplanes",
    shortname = "kdp",
    namespaced,
    status = "DataPlaneStatus",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Provisioned\")].status"}"#,
    printcolumn = r#"{"name":"Service", "type":"string", "jsonPath":".status.service"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneSpec {
    #[serde(flatten)]
    #[validate(nested)]
    pub deployment: DeploymentOptions,
}

/// Status of a DataPlane resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneStatus {
    /// Conditions describing the DataPlane state
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Generation last acted upon by the operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Name of the Service exposing the proxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    /// Load balancer addresses assigned to the proxy Service
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
}

/// ControlPlane custom resource definition
///
/// Runs the controller tier of a gateway. It only scales up once it is
/// attached to a provisioned DataPlane.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "gateway-operator.konghq.com",
    version = "v1alpha1",
    kind = "ControlPlane",
    plural = "controlplanes",
    shortname = "kcp",
    namespaced,
    status = "ControlPlaneStatus",
    printcolumn = r#"{"name":"DataPlane", "type":"string", "jsonPath":".spec.dataplane"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Provisioned\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSpec {
    #[serde(flatten)]
    #[validate(nested)]
    pub deployment: DeploymentOptions,

    /// Name of the DataPlane (same namespace) this ControlPlane configures
    #[serde(default, rename = "dataplane", skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_object_name"))]
    pub data_plane: Option<String>,
}

/// Status of a ControlPlane resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneStatus {
    /// Conditions describing the ControlPlane state
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Generation last acted upon by the operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Aspect of a resource's state a condition describes
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, JsonSchema,
)]
pub enum ConditionType {
    /// The resource was admitted by the operator
    Scheduled,
    /// The owned workload is up and serving
    Provisioned,
}

/// Tri-state condition status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Machine readable reason attached to a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionReason {
    /// Admitted for reconciliation
    Scheduled,
    /// The spec cannot be converged until it is corrected
    InvalidSpec,
    /// ControlPlane has no DataPlane reference
    NoDataPlane,
    /// Referenced DataPlane is missing or not provisioned
    DataPlaneNotReady,
    /// Owned workload has not reached its readiness target
    PodsNotReady,
    /// Owned workload is ready
    PodsReady,
    /// Owned workload was ready and lost readiness
    Degraded,
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for ConditionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Condition describing an aspect of a resource's state
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: ConditionType,

    /// Status of the condition
    pub status: ConditionStatus,

    /// Reason for the condition
    pub reason: ConditionReason,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Generation of the resource this condition was computed from
    pub observed_generation: i64,

    /// Last time the status flipped
    pub last_transition_time: String,
}

/// Render both CRDs as a multi-document YAML stream
pub fn crds_yaml() -> Result<String> {
    let dataplane = serde_yaml::to_string(&DataPlane::crd())?;
    let controlplane = serde_yaml::to_string(&ControlPlane::crd())?;
    Ok(format!("{}---\n{}", dataplane, controlplane))
}
