//! Kubernetes Resource Builders
//!
//! Generates the ServiceAccount, Role, RoleBinding, Deployment and Service
//! backing a PackageRegistry. Every object is named after the registry,
//! lives in its namespace and carries an owner reference to it.

use crate::crd::{
    registry_labels, selector_labels, PackageRegistry, API_GROUP, PACKAGE_SOURCE_PLURAL,
};
use crate::error::{OperatorError, Result};
use crate::sources::ResolvedSources;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, ExecAction, PodSpec, PodTemplateSpec, Probe, Service,
    ServiceAccount, ServicePort, ServiceSpec,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Resource;

/// Binary launched in the registry container
pub const REGISTRY_SERVER_BINARY: &str = "appregistry-server";

/// gRPC port served by the registry
pub const REGISTRY_PORT: i32 = 50051;

/// Name of the single port on both the container and the Service
pub const REGISTRY_PORT_NAME: &str = "grpc";

/// Seconds before the first health probe
const PROBE_INITIAL_DELAY_SECONDS: i32 = 5;

/// Consecutive probe failures tolerated before the container is unhealthy
const PROBE_FAILURE_THRESHOLD: i32 = 30;

/// Command line for the registry server.
///
/// `-s` takes the deduplicated source refs, `-o` the package ids exactly as
/// listed on the registry (no dedup).
pub fn registry_command(packages: &[String], sources: &ResolvedSources) -> Vec<String> {
    vec![
        REGISTRY_SERVER_BINARY.to_string(),
        "-s".to_string(),
        sources.display_string(),
        "-o".to_string(),
        packages.join(","),
    ]
}

/// RBAC rules letting the registry pod read its sources and pull secrets.
///
/// The source rule is scoped by name; it is omitted when no source resolved
/// because an empty `resourceNames` list matches every object.
pub fn access_rules(sources: &ResolvedSources) -> Vec<PolicyRule> {
    let mut rules = Vec::with_capacity(2);
    if !sources.is_empty() {
        rules.push(PolicyRule {
            verbs: vec!["get".to_string()],
            api_groups: Some(vec![API_GROUP.to_string()]),
            resources: Some(vec![PACKAGE_SOURCE_PLURAL.to_string()]),
            resource_names: Some(sources.names()),
            ..Default::default()
        });
    }
    rules.push(PolicyRule {
        verbs: vec!["get".to_string()],
        api_groups: Some(vec![String::new()]),
        resources: Some(vec!["secrets".to_string()]),
        ..Default::default()
    });
    rules
}

/// Exec action shared by the readiness and liveness probes
fn health_probe() -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(vec![
                "grpc_health_probe".to_string(),
                format!("-addr=localhost:{}", REGISTRY_PORT),
            ]),
        }),
        initial_delay_seconds: Some(PROBE_INITIAL_DELAY_SECONDS),
        failure_threshold: Some(PROBE_FAILURE_THRESHOLD),
        ..Default::default()
    }
}

/// Builder for generating Kubernetes resources from a PackageRegistry
pub struct ResourceBuilder<'a> {
    registry: &'a PackageRegistry,
    name: String,
    namespace: String,
    image: &'a str,
}

impl<'a> ResourceBuilder<'a> {
    /// Create a new resource builder
    pub fn new(registry: &'a PackageRegistry, image: &'a str) -> Result<Self> {
        let name = registry
            .metadata
            .name
            .clone()
            .ok_or(OperatorError::MissingField(".metadata.name"))?;

        let namespace = registry
            .metadata
            .namespace
            .clone()
            .ok_or(OperatorError::MissingField(".metadata.namespace"))?;

        Ok(Self {
            registry,
            name,
            namespace,
            image,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Owner reference to the registry so that deleting it collects everything
    fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: PackageRegistry::api_version(&()).to_string(),
            kind: PackageRegistry::kind(&()).to_string(),
            name: self.name.clone(),
            uid: self.registry.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn object_meta(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.name.clone()),
            namespace: Some(self.namespace.clone()),
            labels: Some(registry_labels(&self.name)),
            owner_references: Some(vec![self.owner_reference()]),
            ..Default::default()
        }
    }

    /// Build the ServiceAccount the registry pod runs as
    pub fn build_service_account(&self) -> ServiceAccount {
        ServiceAccount {
            metadata: self.object_meta(),
            ..Default::default()
        }
    }

    /// Build the Role granting access to the resolved sources
    pub fn build_role(&self, sources: &ResolvedSources) -> Role {
        Role {
            metadata: self.object_meta(),
            rules: Some(access_rules(sources)),
        }
    }

    /// Build the RoleBinding tying the Role to the ServiceAccount
    pub fn build_role_binding(&self) -> RoleBinding {
        RoleBinding {
            metadata: self.object_meta(),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: self.name.clone(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: self.name.clone(),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            }]),
        }
    }

    /// Build the single-replica registry Deployment
    pub fn build_deployment(&self, command: Vec<String>) -> Deployment {
        Deployment {
            metadata: self.object_meta(),
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(selector_labels(&self.name)),
                    ..Default::default()
                },
                template: self.build_pod_template(command),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the pod template running the registry server.
    ///
    /// This is the part of the Deployment rewritten on every reconcile so
    /// that package and source changes roll out in place.
    pub fn build_pod_template(&self, command: Vec<String>) -> PodTemplateSpec {
        let container = Container {
            name: self.name.clone(),
            image: Some(self.image.to_string()),
            command: Some(command),
            ports: Some(vec![ContainerPort {
                name: Some(REGISTRY_PORT_NAME.to_string()),
                container_port: REGISTRY_PORT,
                ..Default::default()
            }]),
            readiness_probe: Some(health_probe()),
            liveness_probe: Some(health_probe()),
            ..Default::default()
        };

        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(selector_labels(&self.name)),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![container],
                service_account_name: Some(self.name.clone()),
                ..Default::default()
            }),
        }
    }

    /// Build the ClusterIP Service fronting the registry
    pub fn build_service(&self) -> Service {
        Service {
            metadata: self.object_meta(),
            spec: Some(ServiceSpec {
                selector: Some(selector_labels(&self.name)),
                ports: Some(vec![ServicePort {
                    name: Some(REGISTRY_PORT_NAME.to_string()),
                    port: REGISTRY_PORT,
                    target_port: Some(IntOrString::Int(REGISTRY_PORT)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
