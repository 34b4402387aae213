//! Custom Resource Definitions for the app-registry operator
//!
//! `PackageRegistry` declares a registry server that serves a curated set of
//! packages. `PackageSource` describes an upstream app-registry that owns
//! packages; the registry pod is granted read access to exactly the sources
//! its packages resolve to.

use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// API group shared by both custom resources
pub const API_GROUP: &str = "appregistry.dev";

/// Plural resource name of `PackageSource`, used in RBAC rules
pub const PACKAGE_SOURCE_PLURAL: &str = "packagesources";

/// Package ids end up comma-joined on the registry command line, so commas
/// and whitespace are rejected
static PACKAGE_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9._-]*[A-Za-z0-9])?$").unwrap());

/// Maximum length of a single package id
const MAX_PACKAGE_ID_LEN: usize = 253;

/// Validate every package id in a registry spec
fn validate_packages(packages: &[String]) -> Result<(), ValidationError> {
    for id in packages {
        if id.is_empty() || id.len() > MAX_PACKAGE_ID_LEN {
            return Err(ValidationError::new("invalid_package_id").with_message(
                format!("package id must be 1-{} characters", MAX_PACKAGE_ID_LEN).into(),
            ));
        }
        if !PACKAGE_ID_REGEX.is_match(id) {
            return Err(ValidationError::new("invalid_package_id")
                .with_message(format!("'{}' is not a valid package id", id).into()));
        }
    }
    Ok(())
}

/// Validate an upstream endpoint URL
fn validate_endpoint(endpoint: &str) -> Result<(), ValidationError> {
    if endpoint.starts_with("https://") || endpoint.starts_with("http://") {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_endpoint")
            .with_message(format!("'{}' must be an http(s) URL", endpoint).into()))
    }
}

/// PackageRegistry custom resource definition
///
/// Each PackageRegistry is served by a single-replica registry Deployment
/// plus the ServiceAccount, Role, RoleBinding and Service it needs. All of
/// them carry an owner reference back to the PackageRegistry.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "appregistry.dev",
    version = "v1alpha1",
    kind = "PackageRegistry",
    plural = "packageregistries",
    shortname = "preg",
    namespaced,
    status = "PackageRegistryStatus",
    printcolumn = r#"{"name":"Packages", "type":"string", "jsonPath":".spec.packages"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Address", "type":"string", "jsonPath":".status.address"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PackageRegistrySpec {
    /// Package ids to serve, in order (1-256 entries)
    #[validate(
        length(min = 1, max = 256, message = "packages must have 1-256 entries"),
        custom(function = "validate_packages")
    )]
    pub packages: Vec<String>,
}

/// Status of a PackageRegistry resource
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PackageRegistryStatus {
    /// Current phase of the registry
    pub phase: RegistryPhase,

    /// `clusterIP:port` of the registry Service
    pub address: Option<String>,

    /// Error or progress message
    pub message: Option<String>,

    /// Generation the status was computed for
    pub observed_generation: i64,

    /// Last time the status was updated
    pub last_updated: Option<String>,
}

/// Phase of the registry lifecycle
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RegistryPhase {
    /// Not reconciled yet
    #[default]
    Pending,
    /// All managed resources exist and the address is known
    Succeeded,
    /// The last reconciliation failed
    Failed,
}

/// Labels shared by every object managed for a registry
pub fn registry_labels(registry_name: &str) -> BTreeMap<String, String> {
    let mut labels = selector_labels(registry_name);
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "appregistry-operator".to_string(),
    );
    labels
}

/// Labels that must match between the Deployment selector, its pod template
/// and the Service selector
pub fn selector_labels(registry_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/name".to_string(),
        "appregistry-server".to_string(),
    );
    labels.insert(
        "app.kubernetes.io/instance".to_string(),
        registry_name.to_string(),
    );
    labels
}

// ============================================================================
// PackageSource CRD
// ============================================================================

/// PackageSource custom resource definition
///
/// An upstream app-registry. The process that syncs the upstream publishes
/// the package ids it currently offers in `status.packages`.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "appregistry.dev",
    version = "v1alpha1",
    kind = "PackageSource",
    plural = "packagesources",
    shortname = "psrc",
    namespaced,
    status = "PackageSourceStatus",
    printcolumn = r#"{"name":"Endpoint", "type":"string", "jsonPath":".spec.endpoint"}"#,
    printcolumn = r#"{"name":"Registry", "type":"string", "jsonPath":".spec.registryNamespace"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PackageSourceSpec {
    /// Upstream app-registry URL
    #[validate(custom(function = "validate_endpoint"))]
    pub endpoint: String,

    /// Namespace inside the upstream registry
    #[validate(length(min = 1, max = 253, message = "registryNamespace must be 1-253 characters"))]
    pub registry_namespace: String,
}

/// Status of a PackageSource resource
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PackageSourceStatus {
    /// Package ids offered by this source
    #[serde(default)]
    pub packages: Vec<String>,

    /// Last time the package list was synced
    pub last_synced: Option<String>,
}
